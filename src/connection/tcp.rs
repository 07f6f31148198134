//! TCP bring-up for NABU emulators (like MAME).
//!
//! A listener is itself a connection: a pseudo-connection whose worker
//! accepts clients and spawns a real connection for each. The listener's
//! channel, file root and selected file act as defaults that each accepted
//! client starts from.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;

use log::{error, info, warn};

use super::endpoint::TcpEndpoint;
use super::{client_worker, create_common, ConnOptions, Connection, ConnectionError,
            ConnectionKind};
use crate::adaptor::Adaptor;

/// Adds TCP listeners on `port` for both address families and starts their
/// accept workers. Succeeds if at least one family binds.
pub fn add_tcp(
    adaptor: &Arc<Adaptor>,
    port: u16,
    opts: ConnOptions,
) -> Result<(), ConnectionError> {
    info!("Creating TCP listener on port {}.", port);

    let addrs: [(&str, SocketAddr); 2] = [
        ("IPv4", SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))),
        ("IPv6", SocketAddr::from((Ipv6Addr::UNSPECIFIED, port))),
    ];

    let mut bound = 0;
    for (family, addr) in addrs {
        let name = format!("{}-{}", family, port);
        let listener = match TcpListener::bind(addr) {
            Ok(listener) => listener,
            Err(e) => {
                error!("Unable to bind {}: {}", name, e);
                continue;
            }
        };

        let result = create_common(
            adaptor,
            name,
            ConnectionKind::Listener,
            None,
            opts.clone(),
            move |adaptor, conn| listener_worker(adaptor, conn, listener),
        );
        if result.is_ok() {
            bound += 1;
        }
    }

    if bound == 0 {
        return Err(ConnectionError::NoListenAddress(port));
    }
    Ok(())
}

/// Accept loop. Each accepted client inherits a snapshot of the listener's
/// channel, file root and selected file. An error on the listen socket
/// destroys the listener only; accepted connections keep running.
fn listener_worker(adaptor: Arc<Adaptor>, conn: Arc<Connection>, listener: TcpListener) {
    loop {
        let (sock, peer) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("[{}] accept() failed: {}", conn.name(), e);
                break;
            }
        };

        if let Err(e) = accept_one(&adaptor, &conn, sock, peer) {
            error!("[{}] Unable to create connection: {}", conn.name(), e);
        }
    }

    // Error on the listen socket -- he's dead, Jim.
    super::destroy(&adaptor, &conn);
}

fn accept_one(
    adaptor: &Arc<Adaptor>,
    listener_conn: &Arc<Connection>,
    sock: TcpStream,
    peer: SocketAddr,
) -> Result<(), ConnectionError> {
    if let Err(e) = sock.set_nodelay(true) {
        warn!("[{}] Unable to disable Nagle: {}", listener_conn.name(), e);
    }

    let host = peer.ip().to_string();
    info!(
        "[{}] Creating TCP connection for {}.",
        listener_conn.name(),
        host
    );

    let opts = ConnOptions {
        channel: listener_conn.channel().map_or(0, |chan| chan.number),
        file_root: listener_conn.file_root().map(String::from),
        selected_file: listener_conn.selected_file(),
    };

    let io = Box::new(TcpEndpoint::new(sock));
    create_common(
        adaptor,
        host,
        ConnectionKind::Tcp,
        None,
        opts,
        move |adaptor, conn| client_worker(adaptor, conn, io),
    )
    .map(|_| ())
}
