//! Per-connection RetroNet state: a slotted store of fetched blobs.
//!
//! RetroNet clients fetch remote files into numbered slots and then read
//! them back piecewise. The store itself is protocol-agnostic; whoever
//! decodes the RetroNet requests fills it in and reads it out.

use log::debug;

use crate::connection::Connection;

/// One fetched blob, parked in a slot.
#[derive(Debug)]
pub struct RnBlob {
    pub url: String,
    pub data: Box<[u8]>,
    pub slot: u8,
}

/// The blob store of a connection that has used RetroNet.
#[derive(Debug, Default)]
pub struct RnState {
    blobs: Vec<RnBlob>,
}

/// Stores `data` under `slot`, replacing any previous occupant.
pub fn store_insert(conn: &Connection, url: String, data: Vec<u8>, slot: u8) {
    debug!(
        "[{}] Storing {} bytes from '{}' in slot {}.",
        conn.name(),
        data.len(),
        url,
        slot
    );

    let mut state = conn.retronet.lock();
    let state = state.get_or_insert_with(RnState::default);
    state.blobs.retain(|blob| blob.slot != slot);
    state.blobs.push(RnBlob {
        url,
        data: data.into_boxed_slice(),
        slot,
    });
}

/// Size of the blob in `slot`, if occupied.
pub fn store_size(conn: &Connection, slot: u8) -> Option<usize> {
    let state = conn.retronet.lock();
    let state = state.as_ref()?;
    state
        .blobs
        .iter()
        .find(|blob| blob.slot == slot)
        .map(|blob| blob.data.len())
}

/// Copies out up to `len` bytes of the blob in `slot` starting at
/// `offset`, clamped to the blob's end. `None` if the slot is empty.
pub fn store_read(conn: &Connection, slot: u8, offset: usize, len: usize) -> Option<Vec<u8>> {
    let state = conn.retronet.lock();
    let blob = state
        .as_ref()?
        .blobs
        .iter()
        .find(|blob| blob.slot == slot)?;

    let start = offset.min(blob.data.len());
    let end = (start + len).min(blob.data.len());
    Some(blob.data[start..end].to_vec())
}

/// Drops every stored blob.
pub fn store_clear(conn: &Connection) {
    let old = conn.retronet.lock().take();
    drop(old);
}
