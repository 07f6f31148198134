//! Byte-level duplex transport under a connection: a serial port to a real
//! NABU or a TCP stream to an emulator.
//!
//! The adaptor event loop arms a watchdog deadline once a request starts
//! and disarms it before idling for the next one. Both transports map the
//! watchdog onto their native read timeout. A serial port cannot block
//! indefinitely, so "disarmed" is a long idle deadline there; an idle
//! expiry is classified transient and the event loop just waits again.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use serialport::SerialPort;

/// Read deadline while no watchdog is armed on a serial port.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(3600);

/// A duplex byte stream with an armable receive deadline.
///
/// Sends are best-effort: a lost peer surfaces as an error on a subsequent
/// receive.
pub trait Endpoint: Send {
    fn recv_exact(&mut self, buf: &mut [u8]) -> io::Result<()>;

    fn recv_byte(&mut self) -> io::Result<u8> {
        let mut b = [0u8; 1];
        self.recv_exact(&mut b)?;
        Ok(b[0])
    }

    fn send(&mut self, buf: &[u8]) -> io::Result<()>;

    fn send_byte(&mut self, b: u8) -> io::Result<()> {
        self.send(&[b])
    }

    /// Applies `timeout` to subsequent receives.
    fn start_watchdog(&mut self, timeout: Duration) -> io::Result<()>;

    /// Returns subsequent receives to the idle blocking policy.
    fn stop_watchdog(&mut self) -> io::Result<()>;
}

/// Distinguishes a receive deadline expiring (retry) from a dead transport
/// (tear the connection down). `WouldBlock` is what `SO_RCVTIMEO` yields on
/// most platforms.
pub fn is_fatal(e: &io::Error) -> bool {
    !matches!(
        e.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

pub struct TcpEndpoint {
    stream: TcpStream,
}

impl TcpEndpoint {
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }
}

impl Endpoint for TcpEndpoint {
    fn recv_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        self.stream.read_exact(buf)
    }

    fn send(&mut self, buf: &[u8]) -> io::Result<()> {
        self.stream.write_all(buf)?;
        self.stream.flush()
    }

    fn start_watchdog(&mut self, timeout: Duration) -> io::Result<()> {
        self.stream.set_read_timeout(Some(timeout))
    }

    fn stop_watchdog(&mut self) -> io::Result<()> {
        self.stream.set_read_timeout(None)
    }
}

pub struct SerialEndpoint {
    port: Box<dyn SerialPort>,
}

impl SerialEndpoint {
    pub fn new(port: Box<dyn SerialPort>) -> Self {
        Self { port }
    }
}

impl Endpoint for SerialEndpoint {
    fn recv_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        self.port.read_exact(buf)
    }

    fn send(&mut self, buf: &[u8]) -> io::Result<()> {
        self.port.write_all(buf)?;
        self.port.flush()
    }

    fn start_watchdog(&mut self, timeout: Duration) -> io::Result<()> {
        self.port.set_timeout(timeout).map_err(io::Error::from)
    }

    fn stop_watchdog(&mut self) -> io::Result<()> {
        self.port.set_timeout(IDLE_TIMEOUT).map_err(io::Error::from)
    }
}
