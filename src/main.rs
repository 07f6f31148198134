use std::sync::Arc;
use std::thread;

use anyhow::{bail, Context, Result};
use log::{info, LevelFilter};
use simplelog::{ColorChoice, Config, TermLogger, TerminalMode};

use nabu_adaptor::adaptor::Adaptor;
use nabu_adaptor::connection::serial::{add_serial, SerialSettings};
use nabu_adaptor::connection::tcp::add_tcp;
use nabu_adaptor::connection::ConnOptions;
use nabu_adaptor::image::{Channel, ChannelKind, ChannelTable, FsImageSource};

fn usage() -> ! {
    eprintln!(
        "usage: nabu-adaptor [--debug] [--file-root DIR] [--default-channel NUM]\n\
         \x20                   [--default-file NAME] --channel NUM:raw|pak:DIR [--channel ...]\n\
         \x20                   [--listen PORT] [--serial DEV[,BAUD[,STOPBITS]]]"
    );
    std::process::exit(1);
}

/// `NUM:raw|pak:DIR`, e.g. `1:pak:/var/nabu/cycle1`.
fn parse_channel(spec: &str) -> Result<Channel> {
    let mut parts = spec.splitn(3, ':');
    let number: i16 = parts
        .next()
        .context("missing channel number")?
        .parse()
        .context("bad channel number")?;
    let kind = match parts.next().context("missing channel type")? {
        "raw" => ChannelKind::Raw,
        "pak" => ChannelKind::Pak,
        other => bail!("unknown channel type '{}'", other),
    };
    let dir = parts.next().context("missing channel directory")?;

    let name = std::path::Path::new(dir)
        .file_name()
        .map_or_else(|| format!("channel-{}", number), |n| n.to_string_lossy().into_owned());

    Ok(Channel {
        name,
        number,
        kind,
        location: dir.into(),
        default_file: None,
        retronet_enabled: false,
    })
}

/// `DEV[,BAUD[,STOPBITS]]`; zero (or absent) baud means NABU-native with a
/// 115.2k fallback.
fn parse_serial(spec: &str) -> Result<SerialSettings> {
    let mut parts = spec.split(',');
    let device = parts.next().context("missing serial device")?.to_string();
    let baud = parts
        .next()
        .map(str::parse)
        .transpose()
        .context("bad baud rate")?
        .unwrap_or(0);
    let stop_bits = parts
        .next()
        .map(str::parse)
        .transpose()
        .context("bad stop bits")?
        .unwrap_or(0);

    Ok(SerialSettings {
        device,
        baud,
        stop_bits,
        flow_control: false,
    })
}

fn main() -> Result<()> {
    let mut listens: Vec<u16> = Vec::new();
    let mut serials: Vec<SerialSettings> = Vec::new();
    let mut channels: Vec<Channel> = Vec::new();
    let mut file_root: Option<String> = None;
    let mut default_channel: i16 = 0;
    let mut default_file: Option<String> = None;
    let mut debug = false;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--listen" => listens.push(
                args.next()
                    .context("--listen needs a port")?
                    .parse()
                    .context("bad port")?,
            ),
            "--serial" => {
                serials.push(parse_serial(&args.next().context("--serial needs a device")?)?)
            }
            "--channel" => {
                channels.push(parse_channel(&args.next().context("--channel needs an argument")?)?)
            }
            "--file-root" => file_root = Some(args.next().context("--file-root needs a path")?),
            "--default-channel" => {
                default_channel = args
                    .next()
                    .context("--default-channel needs a number")?
                    .parse()
                    .context("bad channel number")?
            }
            "--default-file" => {
                default_file = Some(args.next().context("--default-file needs a name")?)
            }
            "--debug" => debug = true,
            _ => usage(),
        }
    }

    TermLogger::init(
        if debug {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        },
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )?;

    if channels.is_empty() {
        bail!("no channels configured; specify at least one --channel");
    }
    if listens.is_empty() && serials.is_empty() {
        bail!("nothing to serve; specify --listen and/or --serial");
    }

    let adaptor = Arc::new(Adaptor::new(
        ChannelTable::new(channels),
        Box::new(FsImageSource),
    ));
    let opts = ConnOptions {
        channel: default_channel,
        file_root,
        selected_file: default_file,
    };

    for port in listens {
        add_tcp(&adaptor, port, opts.clone())?;
    }
    for settings in serials {
        add_serial(&adaptor, settings, opts.clone())?;
    }

    info!(
        "nabu-adaptor up; {} connection(s) registered.",
        adaptor.registry.len()
    );

    // Everything from here on happens on the connection workers.
    loop {
        thread::park();
    }
}
