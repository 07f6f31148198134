//! Server-side emulation of the NABU network adaptor. In the original 1980s
//! NABU network, the adaptor sat between the NABU Personal Computer and the
//! cable head-end and streamed cycled program segments down a serial link.
//! This crate replaces the head-end: it accepts a physical serial connection
//! to a real NABU or a TCP connection from an emulator, and speaks the NABU's
//! request/response protocol to deliver program images, time-of-day packets,
//! and extended file-service requests.
//!
//! The crate is structured around the [`Connection`](connection::Connection)
//! object (one per client session) and the [`Adaptor`](adaptor::Adaptor),
//! which owns the channel table, the image source, the registry of live
//! connections, and the per-connection protocol loop run on a dedicated
//! worker thread. Byte transport is abstracted behind the
//! [`Endpoint`](connection::endpoint::Endpoint) trait with serial and TCP
//! implementations. Extended sub-protocols (RetroNet, NHACP) plug in through
//! the [`RequestHandler`](handlers::RequestHandler) trait.

pub mod adaptor;
pub mod connection;
pub mod crc;
pub mod handlers;
pub mod image;
pub mod packets;
