//! Connection abstraction.
//!
//! Connections can be either over a serial interface to a real NABU or over
//! a TCP socket to support NABU emulators. A third kind, the listener, is
//! the pseudo-connection whose worker accepts new TCP clients.

use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

use log::{error, info};
use parking_lot::Mutex;
use thiserror::Error;

use crate::adaptor::{Adaptor, Session};
use crate::handlers::nhacp::NhacpSession;
use crate::handlers::retronet::RnState;
use crate::handlers::RequestHandler;
use crate::image::{self, Channel, Image};

pub mod endpoint;
pub mod registry;
pub mod serial;
pub mod tcp;

use endpoint::Endpoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    Serial,
    Tcp,
    Listener,
}

/// Serial line parameters a serial connection was brought up with.
#[derive(Debug, Clone, Copy)]
pub struct SerialParams {
    pub baud: u32,
    pub stop_bits: u8,
    pub flow_control: bool,
}

/// Session settings handed to a new connection: the initially selected
/// channel (0 = none), the file root for sub-protocol storage, and an
/// initially selected file.
#[derive(Debug, Clone, Default)]
pub struct ConnOptions {
    pub channel: i16,
    pub file_root: Option<String>,
    pub selected_file: Option<String>,
}

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("IO Error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Serialport Error: {0}")]
    SerialportError(#[from] serialport::Error),
    #[error("No usable listen address for port {0}")]
    NoListenAddress(u16),
}

/// Fields read and written under the connection mutex. Everything the
/// worker shares with registry enumerators lives here.
#[derive(Default)]
struct SessionState {
    channel: Weak<Channel>,
    selected_file: Option<String>,
    last_image: Option<Arc<Image>>,
    retronet_enabled: bool,
}

fn effective_selection<'a>(
    st: &'a SessionState,
    chan: &'a Option<Arc<Channel>>,
) -> Option<&'a str> {
    st.selected_file
        .as_deref()
        .or_else(|| chan.as_ref().and_then(|c| c.default_file.as_deref()))
}

/// A session with one client.
pub struct Connection {
    kind: ConnectionKind,
    name: String,
    file_root: Option<String>,
    serial: Option<SerialParams>,
    aborted: AtomicBool,
    locked: Mutex<SessionState>,

    /// Registry bookkeeping, maintained under the registry's list lock.
    pub(crate) on_list: AtomicBool,
    pub(crate) enum_count: AtomicU32,

    /// NHACP sub-sessions owned by this connection.
    pub nhacp_sessions: Mutex<Vec<NhacpSession>>,
    /// RetroNet blob-store state, if the client has used RetroNet.
    pub retronet: Mutex<Option<RnState>>,
}

impl Connection {
    pub fn new(
        kind: ConnectionKind,
        name: impl Into<String>,
        file_root: Option<String>,
        serial: Option<SerialParams>,
    ) -> Self {
        Self {
            kind,
            name: name.into(),
            file_root,
            serial,
            aborted: AtomicBool::new(false),
            locked: Mutex::new(SessionState::default()),
            on_list: AtomicBool::new(false),
            enum_count: AtomicU32::new(0),
            nhacp_sessions: Mutex::new(Vec::new()),
            retronet: Mutex::new(None),
        }
    }

    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn file_root(&self) -> Option<&str> {
        self.file_root.as_deref()
    }

    pub fn serial_params(&self) -> Option<SerialParams> {
        self.serial
    }

    /// True once a fatal I/O or protocol error has condemned the
    /// connection; the event loop exits at the next opportunity.
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
    }

    pub fn channel(&self) -> Option<Arc<Channel>> {
        self.locked.lock().channel.upgrade()
    }

    /// Installs `chan` as the selected channel. Changing the channel clears
    /// the selected file; the displaced string is dropped outside the lock.
    pub fn set_channel(&self, chan: &Arc<Channel>) {
        let mut st = self.locked.lock();
        st.channel = Arc::downgrade(chan);
        st.retronet_enabled = chan.retronet_enabled;
        let old = st.selected_file.take();
        drop(st);
        drop(old);
    }

    pub fn retronet_enabled(&self) -> bool {
        self.locked.lock().retronet_enabled
    }

    pub fn last_image(&self) -> Option<Arc<Image>> {
        self.locked.lock().last_image.clone()
    }

    /// Caches `img` as the most recently delivered image, returning the
    /// displaced value.
    pub fn set_last_image(&self, img: Option<Arc<Image>>) -> Option<Arc<Image>> {
        let mut st = self.locked.lock();
        mem::replace(&mut st.last_image, img)
    }

    /// Like [`set_last_image`](Self::set_last_image), but only if the cache
    /// currently holds `current`. Returns the displaced value on success,
    /// `None` if the cache held something else.
    pub fn set_last_image_if(
        &self,
        current: Option<&Arc<Image>>,
        img: Option<Arc<Image>>,
    ) -> Option<Option<Arc<Image>>> {
        let mut st = self.locked.lock();
        let matches = match (&st.last_image, current) {
            (Some(have), Some(want)) => Arc::ptr_eq(have, want),
            (None, None) => true,
            _ => false,
        };
        matches.then(|| mem::replace(&mut st.last_image, img))
    }

    /// Returns the effective file selection: the explicitly selected file,
    /// or the selected channel's default.
    ///
    /// The copy is sized outside the lock: read the selection length, drop
    /// the lock, allocate, re-acquire, and copy only if the selection still
    /// fits; otherwise size it again. Keeps allocation out of the critical
    /// section.
    pub fn selected_file(&self) -> Option<String> {
        loop {
            let len = {
                let st = self.locked.lock();
                let chan = st.channel.upgrade();
                effective_selection(&st, &chan)?.len()
            };

            let mut copy = String::with_capacity(len);

            let fits = {
                let st = self.locked.lock();
                let chan = st.channel.upgrade();
                match effective_selection(&st, &chan) {
                    Some(sel) if sel.len() <= len => {
                        copy.push_str(sel);
                        true
                    }
                    Some(_) => false, /* selection grew under us; retry */
                    None => return None,
                }
            };

            if fits {
                return Some(copy);
            }
        }
    }

    pub fn set_selected_file(&self, name: Option<String>) {
        let mut st = self.locked.lock();
        let old = mem::replace(&mut st.selected_file, name);
        drop(st);
        drop(old);
    }

    /// Handles a reboot of the client at the other end of the connection:
    /// tears down all sub-protocol state and drops the cached image.
    pub fn reboot(&self, handlers: &[Box<dyn RequestHandler>]) {
        if !self.nhacp_sessions.lock().is_empty() {
            info!("[{}] Clearing previous NHACP state.", self.name);
        }
        if self.retronet.lock().is_some() {
            info!("[{}] Clearing previous RetroNet state.", self.name);
        }
        for handler in handlers {
            handler.fini(self);
        }
        self.nhacp_sessions.lock().clear();
        *self.retronet.lock() = None;
        drop(self.set_last_image(None));
    }
}

/// Common connection-creation duties: build the [`Connection`], apply the
/// initial channel and file selection, register it, and start its worker
/// thread.
pub(crate) fn create_common(
    adaptor: &Arc<Adaptor>,
    name: String,
    kind: ConnectionKind,
    serial: Option<SerialParams>,
    opts: ConnOptions,
    worker: impl FnOnce(Arc<Adaptor>, Arc<Connection>) + Send + 'static,
) -> Result<Arc<Connection>, ConnectionError> {
    let conn = Arc::new(Connection::new(kind, name, opts.file_root, serial));

    if let Some(root) = conn.file_root() {
        info!("[{}] Using '{}' for local storage.", conn.name(), root);
    }
    if opts.channel != 0 {
        image::channel_select(&adaptor.channels, &conn, opts.channel);
    }
    if opts.selected_file.is_some() {
        conn.set_selected_file(opts.selected_file);
    }

    adaptor.registry.insert(&conn);

    let builder = thread::Builder::new().name(format!("conn-{}", conn.name()));
    let worker_adaptor = Arc::clone(adaptor);
    let worker_conn = Arc::clone(&conn);
    if let Err(e) = builder.spawn(move || worker(worker_adaptor, worker_conn)) {
        error!("[{}] Unable to start connection thread: {}", conn.name(), e);
        destroy(adaptor, &conn);
        return Err(e.into());
    }

    Ok(conn)
}

/// End-of-life teardown: deregister (waiting out any in-flight
/// enumerators), tear down sub-protocol state, and drop the cached image.
/// The endpoint closes when the worker drops it.
pub(crate) fn destroy(adaptor: &Adaptor, conn: &Arc<Connection>) {
    adaptor.registry.remove(conn);
    conn.reboot(&adaptor.handlers);
    info!("[{}] Connection closed.", conn.name());
}

/// Worker body for serial and TCP client connections: run the adaptor
/// event loop until it returns, then tear the connection down.
pub(crate) fn client_worker(adaptor: Arc<Adaptor>, conn: Arc<Connection>, io: Box<dyn Endpoint>) {
    let mut session = Session::new(conn, io);
    adaptor.run(&mut session);
    destroy(&adaptor, session.conn());
}
