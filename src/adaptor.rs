//! NABU Adaptor emulation: the per-connection protocol engine.
//!
//! Each connection worker runs [`Adaptor::run`], which reads one opcode at
//! a time, services the classic request set itself, and offers everything
//! else to the registered sub-protocol handlers. Replies are framed,
//! CRC-trailed and escape-encoded before they hit the wire.
//!
//! Protocol information and message details gleaned from the original
//! adaptor hardware and the surviving emulators of it.

use std::io;
use std::mem;
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use log::{debug, error, info, warn};

use crate::connection::endpoint::{is_fatal, Endpoint};
use crate::connection::registry::Registry;
use crate::connection::Connection;
use crate::crc::NABU_CRC16;
use crate::handlers::RequestHandler;
use crate::image::{self, ChannelTable, Image, ImageSource};
use crate::packets::{self, frame, time};

/// Deadline applied to every receive between the first byte of a request
/// and its completion.
const REQUEST_WATCHDOG: Duration = Duration::from_secs(10);

/// A live session: the shared connection object, the byte transport (owned
/// exclusively by the worker), and the scratch buffer packets are
/// escape-encoded into.
pub struct Session {
    conn: Arc<Connection>,
    io: Box<dyn Endpoint>,
    pktbuf: Vec<u8>,
}

impl Session {
    pub fn new(conn: Arc<Connection>, io: Box<dyn Endpoint>) -> Self {
        Self {
            conn,
            io,
            pktbuf: Vec::with_capacity(packets::MAX_PACKET_SIZE * 2),
        }
    }

    pub fn conn(&self) -> &Arc<Connection> {
        &self.conn
    }

    /// Receives one byte. A fatal transport error condemns the connection.
    pub fn recv_byte(&mut self) -> io::Result<u8> {
        match self.io.recv_byte() {
            Ok(b) => Ok(b),
            Err(e) => {
                if is_fatal(&e) {
                    self.conn.abort();
                }
                Err(e)
            }
        }
    }

    /// Receives exactly `buf.len()` bytes.
    pub fn recv_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        match self.io.recv_exact(buf) {
            Ok(()) => Ok(()),
            Err(e) => {
                if is_fatal(&e) {
                    self.conn.abort();
                }
                Err(e)
            }
        }
    }

    /// Best-effort send; a dead peer is discovered by the next receive.
    pub fn send(&mut self, buf: &[u8]) {
        if let Err(e) = self.io.send(buf) {
            debug!("[{}] send failed: {}", self.conn.name(), e);
            if is_fatal(&e) {
                self.conn.abort();
            }
        }
    }

    pub fn send_byte(&mut self, b: u8) {
        self.send(&[b]);
    }

    fn start_watchdog(&mut self, timeout: Duration) {
        if let Err(e) = self.io.start_watchdog(timeout) {
            warn!("[{}] Unable to arm watchdog: {}", self.conn.name(), e);
        }
    }

    fn stop_watchdog(&mut self) {
        if let Err(e) = self.io.stop_watchdog() {
            warn!("[{}] Unable to disarm watchdog: {}", self.conn.name(), e);
        }
    }
}

/// Waits for an expected byte from the NABU.
fn expect_byte(session: &mut Session, val: u8) -> bool {
    let got = match session.recv_byte() {
        Ok(b) => b,
        Err(_) => {
            error!("[{}] Receive error.", session.conn.name());
            return false;
        }
    };

    debug!(
        "[{}] Expected {:#04x}, got {:#04x} ({})",
        session.conn.name(),
        val,
        got,
        if val == got { "success" } else { "fail" }
    );
    val == got
}

fn expect_sequence(session: &mut Session, seq: &[u8]) -> bool {
    seq.iter().all(|&b| expect_byte(session, b))
}

fn expect_ack(session: &mut Session) -> bool {
    expect_sequence(session, &packets::MSGSEQ_ACK)
}

fn send_ack(session: &mut Session) {
    session.send(&packets::MSGSEQ_ACK);
}

fn send_confirmed(session: &mut Session) {
    session.send_byte(packets::STATE_CONFIRMED);
}

struct ClassicHandler {
    handler: fn(&Adaptor, &mut Session),
    debug_desc: &'static str,
}

/// Classic message dispatch, indexed by `opcode - MSG_CLASSIC_FIRST`.
/// Lookups strictly past the end of the table are misses, as are empty
/// slots, should the block ever grow gaps.
const CLASSIC_HANDLERS: [Option<ClassicHandler>; 6] = [
    Some(ClassicHandler {
        handler: Adaptor::msg_reset,
        debug_desc: "MSG_RESET",
    }),
    Some(ClassicHandler {
        handler: Adaptor::msg_mystery,
        debug_desc: "MSG_MYSTERY",
    }),
    Some(ClassicHandler {
        handler: Adaptor::msg_start_up,
        debug_desc: "MSG_START_UP",
    }),
    Some(ClassicHandler {
        handler: Adaptor::msg_get_status,
        debug_desc: "MSG_GET_STATUS",
    }),
    Some(ClassicHandler {
        handler: Adaptor::msg_packet_request,
        debug_desc: "MSG_PACKET_REQUEST",
    }),
    Some(ClassicHandler {
        handler: Adaptor::msg_change_channel,
        debug_desc: "MSG_CHANGE_CHANNEL",
    }),
];

/// The process-wide adaptor services: the channel catalog, the image
/// loader, the sub-protocol handlers, and the registry of live
/// connections.
pub struct Adaptor {
    pub channels: ChannelTable,
    pub source: Box<dyn ImageSource>,
    pub handlers: Vec<Box<dyn RequestHandler>>,
    pub registry: Registry,
}

impl Adaptor {
    pub fn new(channels: ChannelTable, source: Box<dyn ImageSource>) -> Self {
        Self {
            channels,
            source,
            handlers: Vec::new(),
            registry: Registry::new(),
        }
    }

    pub fn add_handler(&mut self, handler: Box<dyn RequestHandler>) {
        self.handlers.push(handler);
    }

    /// Main event loop for the Adaptor emulation. Returns when the
    /// connection dies.
    pub fn run(&self, session: &mut Session) {
        info!("[{}] Connection starting.", session.conn.name());

        loop {
            if session.conn.is_aborted() {
                break;
            }

            // We want to block "forever" waiting for requests.
            session.stop_watchdog();

            debug!("[{}] Waiting for NABU.", session.conn.name());
            let msg = match session.recv_byte() {
                Ok(msg) => msg,
                Err(e) => {
                    if session.conn.is_aborted() {
                        break;
                    }
                    debug!(
                        "[{}] recv_byte() failed ({}), continuing event loop.",
                        session.conn.name(),
                        e
                    );
                    continue;
                }
            };

            // Now that we've got a request, no single I/O may stall it for
            // longer than the watchdog allows.
            session.start_watchdog(REQUEST_WATCHDOG);

            if self.classic_request(session, msg) {
                continue;
            }
            if self.handlers.iter().any(|h| h.try_request(session, msg)) {
                continue;
            }

            error!(
                "[{}] Got unexpected message {:#04x}.",
                session.conn.name(),
                msg
            );
        }
    }

    /// Checks for and processes a classic NABU message.
    fn classic_request(&self, session: &mut Session, msg: u8) -> bool {
        if !packets::is_classic(msg) {
            return false;
        }

        let idx = (msg - packets::MSG_CLASSIC_FIRST) as usize;
        let entry = match CLASSIC_HANDLERS.get(idx) {
            Some(Some(entry)) => entry,
            _ => {
                // The sub-protocols park their request sets inside the
                // classic range, so this may still be somebody's opcode.
                error!(
                    "[{}] Unknown classic message type {:#04x}.",
                    session.conn.name(),
                    msg
                );
                return false;
            }
        };

        debug!("[{}] Got {}.", session.conn.name(), entry.debug_desc);
        (entry.handler)(self, session);
        true
    }

    fn msg_reset(&self, session: &mut Session) {
        session.conn.reboot(&self.handlers);
        debug!(
            "[{}] Sending MSGSEQ_ACK + STATE_CONFIRMED.",
            session.conn.name()
        );
        send_ack(session);
        send_confirmed(session);
    }

    fn msg_mystery(&self, session: &mut Session) {
        debug!("[{}] Sending MSGSEQ_ACK.", session.conn.name());
        send_ack(session);

        debug!(
            "[{}] Expecting the NABU to send 2 bytes.",
            session.conn.name()
        );
        let mut msg = [0u8; 2];
        if session.recv_exact(&mut msg).is_err() {
            error!(
                "[{}] Those two bytes never arrived.",
                session.conn.name()
            );
        } else {
            debug!(
                "[{}] msg[0] = {:#04x} msg[1] = {:#04x}",
                session.conn.name(),
                msg[0],
                msg[1]
            );
        }
        debug!("[{}] Sending STATE_CONFIRMED.", session.conn.name());
        send_confirmed(session);
    }

    fn msg_start_up(&self, session: &mut Session) {
        debug!(
            "[{}] Sending MSGSEQ_ACK + STATE_CONFIRMED.",
            session.conn.name()
        );
        send_ack(session);
        send_confirmed(session);
    }

    fn msg_get_status(&self, session: &mut Session) {
        debug!("[{}] Sending MSGSEQ_ACK.", session.conn.name());
        send_ack(session);

        debug!(
            "[{}] Expecting the NABU to send status type.",
            session.conn.name()
        );
        let msg = match session.recv_byte() {
            Ok(msg) => msg,
            Err(_) => {
                error!("[{}] Status type never arrived.", session.conn.name());
                return;
            }
        };

        match msg {
            packets::STATUS_SIGNAL => {
                debug!("[{}] Channel status requested.", session.conn.name());
                self.channel_status(session);
            }
            packets::STATUS_TRANSMIT => {
                debug!("[{}] Transmit status requested.", session.conn.name());
                self.transmit_status(session);
            }
            _ => {
                error!(
                    "[{}] Unknown status type requested: {:#04x}.",
                    session.conn.name(),
                    msg
                );
            }
        }
    }

    fn channel_status(&self, session: &mut Session) {
        if session.conn.channel().is_some() {
            debug!("[{}] Sending SIGNAL_STATUS_YES.", session.conn.name());
            session.send_byte(packets::SIGNAL_STATUS_YES);
        } else {
            debug!("[{}] Sending SIGNAL_STATUS_NO.", session.conn.name());
            session.send_byte(packets::SIGNAL_STATUS_NO);
        }
        session.send(&packets::MSGSEQ_FINISHED);
    }

    /// The adaptor is always clear to transmit.
    fn transmit_status(&self, session: &mut Session) {
        debug!("[{}] Sending SIGNAL_STATUS_YES.", session.conn.name());
        session.send_byte(packets::SIGNAL_STATUS_YES);
        session.send(&packets::MSGSEQ_FINISHED);
    }

    fn msg_packet_request(&self, session: &mut Session) {
        debug!("[{}] Sending MSGSEQ_ACK.", session.conn.name());
        send_ack(session);

        let mut msg = [0u8; 4];
        if session.recv_exact(&mut msg).is_err() {
            error!(
                "[{}] NABU failed to send segment/image message.",
                session.conn.name()
            );
            session.conn.abort();
            return;
        }

        let segment = msg[0] as u16;
        let image = packets::get_uint24([msg[1], msg[2], msg[3]]);
        debug!(
            "[{}] NABU requested segment {} of image {:06X}.",
            session.conn.name(),
            segment,
            image
        );

        debug!("[{}] Sending STATE_CONFIRMED.", session.conn.name());
        send_confirmed(session);

        if image == packets::IMAGE_TIME {
            if segment == 0 {
                debug!("[{}] Sending time packet.", session.conn.name());
                self.send_time(session);
                return;
            }
            error!(
                "[{}] Unexpected request for segment {} of time image.",
                session.conn.name(),
                segment
            );
            self.send_unauthorized(session);
            return;
        }

        let Some(img) = image::image_load(self.source.as_ref(), session.conn(), image) else {
            error!(
                "[{}] Unable to load image {:06X}.",
                session.conn.name(),
                image
            );
            self.send_unauthorized(session);
            return;
        };

        debug!(
            "[{}] Sending segment {} of image {:06X}.",
            session.conn.name(),
            segment,
            image
        );
        let last = self.send_image(session, image, segment, &img);
        image::image_unload(session.conn(), img, last);
    }

    fn msg_change_channel(&self, session: &mut Session) {
        debug!("[{}] Sending MSGSEQ_ACK.", session.conn.name());
        send_ack(session);

        debug!(
            "[{}] Waiting for NABU to send channel code.",
            session.conn.name()
        );
        let mut msg = [0u8; 2];
        if session.recv_exact(&mut msg).is_err() {
            error!(
                "[{}] NABU failed to send channel code.",
                session.conn.name()
            );
            session.conn.abort();
            return;
        }

        let channel = packets::get_uint16(msg) as i16;
        info!(
            "[{}] NABU selected channel {:#06x}.",
            session.conn.name(),
            channel
        );

        image::channel_select(&self.channels, session.conn(), channel);

        debug!("[{}] Sending STATE_CONFIRMED.", session.conn.name());
        send_confirmed(session);
    }

    /// Sends a time packet to the NABU.
    fn send_time(&self, session: &mut Session) {
        let img = time::time_image(Local::now());
        self.send_image(session, packets::IMAGE_TIME, 0, &img);
    }

    /// Wraps the region of `img` selected by `segment` in a packet and
    /// sends it. Returns whether this was the image's final segment.
    fn send_image(&self, session: &mut Session, image: u32, segment: u16, img: &Image) -> bool {
        // PAK images are pre-wrapped, so they are processed a little
        // differently. Time packets have no channel, so the check is on
        // the image, not the connection.
        if img.is_pak() {
            return self.send_pak(session, image, segment, img);
        }

        let off = segment as usize * packets::MAX_PAYLOAD_SIZE;
        let mut len = packets::MAX_PAYLOAD_SIZE;
        let mut last = false;

        if off >= img.data().len() {
            error!(
                "image {}: segment {} offset {} exceeds image size {}",
                image,
                segment,
                off,
                img.data().len()
            );
            self.send_unauthorized(session);
            return false;
        }

        if off + len >= img.data().len() {
            len = img.data().len() - off;
            last = true;
        }

        let pktlen = len + packets::HEADER_SIZE + packets::FOOTER_SIZE;
        let mut pktbuf = vec![0u8; pktlen];

        let mut i = frame::init_pkthdr(&mut pktbuf, image, segment, off as u16, last);
        pktbuf[i..i + len].copy_from_slice(&img.data()[off..off + len]);
        i += len;

        let crc = NABU_CRC16.checksum(&pktbuf[..i]);
        i += frame::set_crc(&mut pktbuf[i..], crc);
        if i != pktlen {
            // Header accounting is broken; a panic would only unwind this
            // worker thread.
            error!("internal packet length error");
            std::process::abort();
        }

        debug!(
            "[{}] Sending segment {} of image {:06X}{}",
            session.conn.name(),
            segment,
            image,
            if last { " (last segment)" } else { "" }
        );
        self.send_packet(session, pktbuf);
        last
    }

    /// Extracts the selected segment from a pre-framed image pak, patches
    /// its CRC, and sends it.
    fn send_pak(&self, session: &mut Session, image: u32, segment: u16, img: &Image) -> bool {
        let mut len = packets::TOTAL_PAYLOAD_SIZE;
        let off = frame::pak_offset(segment);
        let mut last = false;

        if off >= img.data().len() {
            error!(
                "[{}] PAK {}: offset {} exceeds pak size {}",
                session.conn.name(),
                img.name(),
                off,
                img.data().len()
            );
            self.send_unauthorized(session);
            return false;
        }

        if off + len >= img.data().len() {
            len = img.data().len() - off;
            last = true;
        }

        if len < packets::HEADER_SIZE + packets::FOOTER_SIZE {
            error!(
                "[{}] PAK {}: offset {} length {} is nonsensical",
                session.conn.name(),
                img.name(),
                off,
                len
            );
            self.send_unauthorized(session);
            return last;
        }

        let mut pktbuf = img.data()[off..off + len].to_vec();
        let crc = NABU_CRC16.checksum(&pktbuf[..len - 2]);
        frame::set_crc(&mut pktbuf[len - 2..], crc);

        debug!(
            "[{}] Sending segment {} of image {:06X}{}",
            session.conn.name(),
            segment,
            image,
            if last { " (last segment)" } else { "" }
        );
        self.send_packet(session, pktbuf);
        last
    }

    /// Sends a packet to the NABU. The buffer is consumed whether or not
    /// the NABU acknowledges it; the client has no recovery path for a
    /// packet it failed to ACK.
    fn send_packet(&self, session: &mut Session, buf: Vec<u8>) {
        if buf.len() > packets::MAX_PACKET_SIZE {
            error!(
                "[{}] internal packet size error: {} bytes",
                session.conn.name(),
                buf.len()
            );
            std::process::abort();
        }

        let mut pktbuf = mem::take(&mut session.pktbuf);
        frame::escape_into(&mut pktbuf, &buf);
        drop(buf);

        debug!("[{}] Sending AUTHORIZED.", session.conn.name());
        session.send_byte(packets::SERVICE_AUTHORIZED);
        debug!("[{}] Waiting for NABU to ACK.", session.conn.name());
        if expect_ack(session) {
            debug!(
                "[{}] Received ACK, sending packet.",
                session.conn.name()
            );
            session.send(&pktbuf);
            session.send(&packets::MSGSEQ_FINISHED);
        } else {
            error!("[{}] NABU failed to ACK.", session.conn.name());
        }
        session.pktbuf = pktbuf;
    }

    /// Sends an UNAUTHORIZED message to the NABU.
    fn send_unauthorized(&self, session: &mut Session) {
        debug!("[{}] Sending UNAUTHORIZED.", session.conn.name());
        session.send_byte(packets::SERVICE_UNAUTHORIZED);
        debug!("[{}] Waiting for NABU to ACK.", session.conn.name());
        if expect_ack(session) {
            debug!("[{}] Received ACK.", session.conn.name());
        } else {
            error!("[{}] NABU failed to ACK.", session.conn.name());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionKind;
    use crate::image::{Channel, ChannelKind, ImageError};
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::io::Read;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Endpoint fed from a canned byte script; everything sent lands in a
    /// shared output buffer.
    struct ScriptedEndpoint {
        input: io::Cursor<Vec<u8>>,
        output: Arc<Mutex<Vec<u8>>>,
    }

    impl Endpoint for ScriptedEndpoint {
        fn recv_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
            self.input.read_exact(buf)
        }

        fn send(&mut self, buf: &[u8]) -> io::Result<()> {
            self.output.lock().extend_from_slice(buf);
            Ok(())
        }

        fn start_watchdog(&mut self, _timeout: Duration) -> io::Result<()> {
            Ok(())
        }

        fn stop_watchdog(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct MapSource {
        images: HashMap<u32, Vec<u8>>,
        loads: Arc<AtomicUsize>,
    }

    impl ImageSource for MapSource {
        fn load(
            &self,
            _conn: &Connection,
            chan: &Arc<Channel>,
            image: u32,
        ) -> Result<Arc<Image>, ImageError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            self.images
                .get(&image)
                .map(|data| {
                    Arc::new(Image::new(
                        format!("{:06X}", image),
                        image,
                        data.clone(),
                        chan,
                    ))
                })
                .ok_or(ImageError::NotFound(image))
        }
    }

    fn channel(number: i16, kind: ChannelKind) -> Channel {
        Channel {
            name: format!("ch{}", number),
            number,
            kind,
            location: PathBuf::from("/nonexistent"),
            default_file: None,
            retronet_enabled: false,
        }
    }

    fn adaptor_with(
        channels: Vec<Channel>,
        images: HashMap<u32, Vec<u8>>,
    ) -> (Adaptor, Arc<AtomicUsize>) {
        let loads = Arc::new(AtomicUsize::new(0));
        let source = MapSource {
            images,
            loads: Arc::clone(&loads),
        };
        (
            Adaptor::new(ChannelTable::new(channels), Box::new(source)),
            loads,
        )
    }

    /// Runs one session over `input` and returns everything the adaptor
    /// sent. The loop exits on its own when the script runs dry.
    fn run_session(adaptor: &Adaptor, conn: &Arc<Connection>, input: &[u8]) -> Vec<u8> {
        let output = Arc::new(Mutex::new(Vec::new()));
        let io = Box::new(ScriptedEndpoint {
            input: io::Cursor::new(input.to_vec()),
            output: Arc::clone(&output),
        });
        let mut session = Session::new(Arc::clone(conn), io);
        adaptor.run(&mut session);
        let bytes = output.lock().clone();
        bytes
    }

    fn test_conn() -> Arc<Connection> {
        Arc::new(Connection::new(ConnectionKind::Tcp, "test", None, None))
    }

    /// Consumes one `AUTHORIZED + escaped packet + FINISHED` exchange from
    /// the front of `stream` and returns the unescaped packet.
    fn take_packet(stream: &mut &[u8]) -> Vec<u8> {
        assert_eq!(stream[0], packets::SERVICE_AUTHORIZED);
        let mut pkt = Vec::new();
        let mut i = 1;
        loop {
            let b = stream[i];
            if b == packets::MSG_ESCAPE {
                match stream[i + 1] {
                    packets::MSG_ESCAPE => {
                        pkt.push(packets::MSG_ESCAPE);
                        i += 2;
                    }
                    0xE1 => {
                        i += 2;
                        break;
                    }
                    other => panic!("stray byte {:#04x} after escape", other),
                }
            } else {
                pkt.push(b);
                i += 1;
            }
        }
        *stream = &stream[i..];
        pkt
    }

    fn check_crc(pkt: &[u8]) {
        let stored = u16::from_be_bytes([pkt[pkt.len() - 2], pkt[pkt.len() - 1]]);
        assert_eq!(NABU_CRC16.checksum(&pkt[..pkt.len() - 2]), stored);
    }

    #[test]
    fn reset_handshake() {
        let (adaptor, _) = adaptor_with(vec![], HashMap::new());
        let out = run_session(&adaptor, &test_conn(), &[0x80]);
        assert_eq!(out, [0x10, 0x06, 0xE4]);
    }

    #[test]
    fn start_up_and_mystery() {
        let (adaptor, _) = adaptor_with(vec![], HashMap::new());
        let out = run_session(&adaptor, &test_conn(), &[0x82]);
        assert_eq!(out, [0x10, 0x06, 0xE4]);

        let out = run_session(&adaptor, &test_conn(), &[0x81, 0xAA, 0xBB]);
        assert_eq!(out, [0x10, 0x06, 0xE4]);
    }

    #[test]
    fn change_channel_selects_and_clears_file() {
        let (adaptor, _) = adaptor_with(vec![channel(7, ChannelKind::Raw)], HashMap::new());
        let conn = test_conn();
        conn.set_selected_file(Some("leftover.nabu".into()));

        let out = run_session(&adaptor, &conn, &[0x85, 0x07, 0x00]);
        assert_eq!(out, [0x10, 0x06, 0xE4]);
        assert_eq!(conn.channel().unwrap().number, 7);
        assert!(conn.selected_file().is_none());
    }

    #[test]
    fn time_packet_request() {
        let (adaptor, _) = adaptor_with(vec![], HashMap::new());
        let out = run_session(
            &adaptor,
            &test_conn(),
            &[0x84, 0x00, 0xFF, 0xFF, 0x7F, 0x10, 0x06],
        );

        assert_eq!(&out[..3], &[0x10, 0x06, 0xE4]);
        let mut stream = &out[3..];
        let pkt = take_packet(&mut stream);
        assert!(stream.is_empty());

        assert_eq!(
            pkt.len(),
            packets::HEADER_SIZE + time::TIME_SIZE + packets::FOOTER_SIZE
        );
        // Image id 0x7FFFFF, segment 0, first + last flags.
        assert_eq!(&pkt[0..3], &[0x7F, 0xFF, 0xFF]);
        assert_eq!(pkt[3], 0);
        assert_eq!(pkt[11], 0xB1);

        let body = &pkt[packets::HEADER_SIZE..pkt.len() - packets::FOOTER_SIZE];
        assert_eq!(&body[..2], &[0x02, 0x02]);
        assert!((1..=7).contains(&body[2]));
        assert_eq!(body[3], 84);
        assert!((1..=12).contains(&body[4]));

        check_crc(&pkt);
    }

    #[test]
    fn time_image_only_has_segment_zero() {
        let (adaptor, _) = adaptor_with(vec![], HashMap::new());
        let out = run_session(
            &adaptor,
            &test_conn(),
            &[0x84, 0x01, 0xFF, 0xFF, 0x7F, 0x10, 0x06],
        );
        assert_eq!(out, [0x10, 0x06, 0xE4, 0x10]);
    }

    #[test]
    fn packet_request_for_missing_image() {
        let (adaptor, _) = adaptor_with(vec![], HashMap::new());
        let out = run_session(
            &adaptor,
            &test_conn(),
            &[0x84, 0x00, 0x34, 0x12, 0x00, 0x10, 0x06],
        );
        // UNAUTHORIZED, then the adaptor waits out our ACK.
        assert_eq!(out, [0x10, 0x06, 0xE4, 0x10]);
    }

    #[test]
    fn channel_status_without_channel() {
        let (adaptor, _) = adaptor_with(vec![], HashMap::new());
        let out = run_session(&adaptor, &test_conn(), &[0x83, 0x01]);
        assert_eq!(out, [0x10, 0x06, 0x10, 0x10, 0xE1]);
    }

    #[test]
    fn channel_status_with_channel() {
        let (adaptor, _) = adaptor_with(vec![channel(1, ChannelKind::Raw)], HashMap::new());
        let conn = test_conn();
        let out = run_session(&adaptor, &conn, &[0x85, 0x01, 0x00, 0x83, 0x01]);
        assert_eq!(out, [0x10, 0x06, 0xE4, 0x10, 0x06, 0x1F, 0x10, 0xE1]);
    }

    #[test]
    fn transmit_status_always_yes() {
        let (adaptor, _) = adaptor_with(vec![], HashMap::new());
        let out = run_session(&adaptor, &test_conn(), &[0x83, 0x1E]);
        assert_eq!(out, [0x10, 0x06, 0x1F, 0x10, 0xE1]);
    }

    #[test]
    fn unknown_classic_opcode_does_not_desync() {
        let (adaptor, _) = adaptor_with(vec![], HashMap::new());
        let out = run_session(&adaptor, &test_conn(), &[0x8F, 0x80]);
        // 0x8F is logged and skipped; the RESET is still serviced.
        assert_eq!(out, [0x10, 0x06, 0xE4]);
    }

    #[test]
    fn raw_image_segmentation() {
        let data: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
        let (adaptor, loads) = adaptor_with(
            vec![channel(1, ChannelKind::Raw)],
            HashMap::from([(0x000002, data.clone())]),
        );
        let conn = test_conn();

        let mut input = vec![0x85, 0x01, 0x00];
        for segment in 0..3u8 {
            input.extend([0x84, segment, 0x02, 0x00, 0x00, 0x10, 0x06]);
        }
        let out = run_session(&adaptor, &conn, &input);

        assert_eq!(&out[..3], &[0x10, 0x06, 0xE4]);
        let mut stream = &out[3..];

        for segment in 0..3usize {
            assert_eq!(&stream[..3], &[0x10, 0x06, 0xE4]);
            stream = &stream[3..];
            let pkt = take_packet(&mut stream);

            let off = segment * packets::MAX_PAYLOAD_SIZE;
            let payload_len = (data.len() - off).min(packets::MAX_PAYLOAD_SIZE);
            let last = segment == 2;

            assert!(pkt.len() <= packets::MAX_PACKET_SIZE);
            assert_eq!(
                pkt.len(),
                packets::HEADER_SIZE + payload_len + packets::FOOTER_SIZE
            );
            assert_eq!(&pkt[0..3], &[0x00, 0x00, 0x02]);
            assert_eq!(pkt[3], segment as u8);
            let mut ty = 0x20u8;
            if segment == 0 {
                ty |= 0x81;
            }
            if last {
                ty |= 0x10;
            }
            assert_eq!(pkt[11], ty);
            assert_eq!(&pkt[14..16], &(off as u16).to_be_bytes());
            assert_eq!(
                &pkt[packets::HEADER_SIZE..packets::HEADER_SIZE + payload_len],
                &data[off..off + payload_len]
            );
            check_crc(&pkt);
        }
        assert!(stream.is_empty());

        // Adjacent segment requests reused the connection's cached image.
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        // The final segment dropped the cache.
        assert!(conn.last_image().is_none());
    }

    #[test]
    fn out_of_range_segment_is_unauthorized() {
        let (adaptor, _) = adaptor_with(
            vec![channel(1, ChannelKind::Raw)],
            HashMap::from([(0x000002, vec![0u8; 100])]),
        );
        let out = run_session(
            &adaptor,
            &test_conn(),
            &[0x85, 0x01, 0x00, 0x84, 0x01, 0x02, 0x00, 0x00, 0x10, 0x06],
        );
        assert_eq!(out, [0x10, 0x06, 0xE4, 0x10, 0x06, 0xE4, 0x10]);
    }

    #[test]
    fn pak_segment_crc_rewrite() {
        // Two stored segments: a full one and a 40-byte tail, each behind
        // its 2-byte length tag.
        let mut pak = vec![0u8; 2 + packets::TOTAL_PAYLOAD_SIZE + 2 + 40];
        for (i, b) in pak.iter_mut().enumerate() {
            *b = (i % 253) as u8;
        }
        let (adaptor, _) = adaptor_with(
            vec![channel(2, ChannelKind::Pak)],
            HashMap::from([(0x000001, pak.clone())]),
        );
        let conn = test_conn();

        let out = run_session(
            &adaptor,
            &conn,
            &[
                0x85, 0x02, 0x00, //
                0x84, 0x00, 0x01, 0x00, 0x00, 0x10, 0x06, //
                0x84, 0x01, 0x01, 0x00, 0x00, 0x10, 0x06,
            ],
        );

        assert_eq!(&out[..3], &[0x10, 0x06, 0xE4]);
        let mut stream = &out[3..];

        // Segment 0: the full pre-framed span, CRC patched in place.
        assert_eq!(&stream[..3], &[0x10, 0x06, 0xE4]);
        stream = &stream[3..];
        let pkt = take_packet(&mut stream);
        let off = frame::pak_offset(0);
        assert_eq!(pkt.len(), packets::TOTAL_PAYLOAD_SIZE);
        assert_eq!(&pkt[..pkt.len() - 2], &pak[off..off + pkt.len() - 2]);
        check_crc(&pkt);

        // Segment 1: truncated tail, marked last by its length.
        assert_eq!(&stream[..3], &[0x10, 0x06, 0xE4]);
        stream = &stream[3..];
        let pkt = take_packet(&mut stream);
        let off = frame::pak_offset(1);
        assert_eq!(pkt.len(), 40);
        assert_eq!(&pkt[..38], &pak[off..off + 38]);
        check_crc(&pkt);
        assert!(stream.is_empty());

        assert!(conn.last_image().is_none());
    }

    #[test]
    fn pak_requests_past_the_end_are_unauthorized() {
        // A pak with a nonsensical 10-byte second segment.
        let pak = vec![0x55u8; 2 + packets::TOTAL_PAYLOAD_SIZE + 2 + 10];
        let (adaptor, _) = adaptor_with(
            vec![channel(2, ChannelKind::Pak)],
            HashMap::from([(0x000001, pak)]),
        );

        // Segment 9 is far past the end of the pak.
        let out = run_session(
            &adaptor,
            &test_conn(),
            &[0x85, 0x02, 0x00, 0x84, 0x09, 0x01, 0x00, 0x00, 0x10, 0x06],
        );
        assert_eq!(out, [0x10, 0x06, 0xE4, 0x10, 0x06, 0xE4, 0x10]);

        // Segment 1 exists but is shorter than a header and trailer.
        let out = run_session(
            &adaptor,
            &test_conn(),
            &[0x85, 0x02, 0x00, 0x84, 0x01, 0x01, 0x00, 0x00, 0x10, 0x06],
        );
        assert_eq!(out, [0x10, 0x06, 0xE4, 0x10, 0x06, 0xE4, 0x10]);
    }

    struct FakeHandler {
        opcode: u8,
        hits: Arc<AtomicUsize>,
        finis: Arc<AtomicUsize>,
    }

    impl RequestHandler for FakeHandler {
        fn try_request(&self, session: &mut Session, msg: u8) -> bool {
            if msg != self.opcode {
                return false;
            }
            self.hits.fetch_add(1, Ordering::SeqCst);
            // Swallow the request's one argument byte.
            let _ = session.recv_byte();
            true
        }

        fn fini(&self, _conn: &Connection) {
            self.finis.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn sub_protocols_get_unclaimed_opcodes() {
        let (mut adaptor, _) = adaptor_with(vec![], HashMap::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let finis = Arc::new(AtomicUsize::new(0));
        adaptor.add_handler(Box::new(FakeHandler {
            opcode: 0xA6,
            hits: Arc::clone(&hits),
            finis: Arc::clone(&finis),
        }));

        // A handled extension opcode, then a RESET (which must fini the
        // sub-protocols), then an opcode nobody wants.
        let out = run_session(&adaptor, &test_conn(), &[0xA6, 0x00, 0x80, 0xEE]);

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(finis.load(Ordering::SeqCst), 1);
        assert_eq!(out, [0x10, 0x06, 0xE4]);
    }
}
