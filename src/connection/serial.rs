//! Serial bring-up for a real NABU: 8 data bits, no parity, two stop bits
//! by default (one is allowed but the NABU drifts out of sync more easily),
//! optional RTS/CTS flow control, raw line discipline.

use std::sync::Arc;

use log::{error, info};
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};

use super::endpoint::{SerialEndpoint, IDLE_TIMEOUT};
use super::{client_worker, create_common, ConnOptions, Connection, ConnectionError,
            ConnectionKind, SerialParams};
use crate::adaptor::Adaptor;

/// The native baud rate of the NABU:
///
/// ```text
/// 3.57954 MHz      / 2                  / 16
/// NTSC colorburst    on-board divider     on-chip divider on the TR1863
/// ```
///
/// ==> 111,860 (and change)
pub const NATIVE_BAUD: u32 = (3_579_540 / 2) / 16;
/// What we fall back to when the native rate cannot be set.
pub const FALLBACK_BAUD: u32 = 115_200;

/// How the serial device should be brought up. Zero values mean "use the
/// NABU defaults": native-then-fallback baud, two stop bits.
#[derive(Debug, Clone)]
pub struct SerialSettings {
    pub device: String,
    pub baud: u32,
    pub stop_bits: u8,
    pub flow_control: bool,
}

fn open_port(settings: &SerialSettings, baud: u32) -> serialport::Result<Box<dyn SerialPort>> {
    let stop_bits = match settings.stop_bits {
        1 => StopBits::One,
        _ => StopBits::Two,
    };
    let flow_control = if settings.flow_control {
        FlowControl::Hardware
    } else {
        FlowControl::None
    };

    serialport::new(&settings.device, baud)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(stop_bits)
        .flow_control(flow_control)
        .timeout(IDLE_TIMEOUT)
        .open()
}

/// Adds a serial connection and starts its worker.
pub fn add_serial(
    adaptor: &Arc<Adaptor>,
    mut settings: SerialSettings,
    opts: ConnOptions,
) -> Result<Arc<Connection>, ConnectionError> {
    info!("Creating Serial connection on {}.", settings.device);

    if settings.stop_bits == 0 {
        settings.stop_bits = 2;
    }

    let (port, baud) = if settings.baud != 0 {
        (open_port(&settings, settings.baud)?, settings.baud)
    } else {
        match open_port(&settings, NATIVE_BAUD) {
            Ok(port) => (port, NATIVE_BAUD),
            Err(e) => {
                error!(
                    "[{}] Failed to set NABU-native baud rate ({}); falling back...",
                    settings.device, e
                );
                (open_port(&settings, FALLBACK_BAUD)?, FALLBACK_BAUD)
            }
        }
    };

    info!(
        "[{}] Using 8N{}-{}{}.",
        settings.device,
        settings.stop_bits,
        baud,
        if settings.flow_control { "+RTS/CTS" } else { "" }
    );

    let params = SerialParams {
        baud,
        stop_bits: settings.stop_bits,
        flow_control: settings.flow_control,
    };
    let io = Box::new(SerialEndpoint::new(port));
    create_common(
        adaptor,
        settings.device,
        ConnectionKind::Serial,
        Some(params),
        opts,
        move |adaptor, conn| client_worker(adaptor, conn, io),
    )
}
