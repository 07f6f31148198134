//! Extended sub-protocols (RetroNet, NHACP).
//!
//! The classic NABU request set leaves most of the opcode space unused;
//! modern clients put file-service protocols there. Each sub-protocol
//! plugs into the adaptor event loop through [`RequestHandler`]: the loop
//! offers every opcode it does not recognize to each handler in turn.
//!
//! This crate owns the per-connection *state* those protocols need (the
//! RetroNet blob store, the NHACP session set); the wire decoding lives in
//! the handler implementations themselves.

use crate::adaptor::Session;
use crate::connection::Connection;

pub mod nhacp;
pub mod retronet;

/// A pluggable request handler for one sub-protocol.
pub trait RequestHandler: Send + Sync {
    /// Services the request starting with `msg` if it belongs to this
    /// protocol: consume the rest of the request from the session, reply,
    /// and return `true`. Returns `false` *without consuming anything*
    /// when the opcode is not ours.
    ///
    /// Failures inside a request must be handled here (logged, and the
    /// connection aborted if the transport died); they never propagate
    /// into the event loop.
    fn try_request(&self, session: &mut Session, msg: u8) -> bool;

    /// Releases any per-connection state this protocol holds. Called on
    /// client reboot and at connection teardown.
    fn fini(&self, conn: &Connection);
}
