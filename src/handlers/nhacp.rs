//! Per-connection NHACP state: the set of numbered sub-sessions a client
//! has started. The NHACP wire protocol is decoded by its handler; the
//! connection only owns the session bookkeeping so reboot and teardown can
//! release it.

use log::debug;

use crate::connection::Connection;

/// One NHACP sub-session.
#[derive(Debug)]
pub struct NhacpSession {
    pub id: u8,
}

/// Starts a session with the given id. Returns `false` if the id is
/// already in use.
pub fn session_create(conn: &Connection, id: u8) -> bool {
    let mut sessions = conn.nhacp_sessions.lock();
    if sessions.iter().any(|s| s.id == id) {
        return false;
    }
    debug!("[{}] Starting NHACP session {}.", conn.name(), id);
    sessions.push(NhacpSession { id });
    true
}

pub fn session_exists(conn: &Connection, id: u8) -> bool {
    conn.nhacp_sessions.lock().iter().any(|s| s.id == id)
}

/// Ends one session. Returns `false` if it was not running.
pub fn session_end(conn: &Connection, id: u8) -> bool {
    let mut sessions = conn.nhacp_sessions.lock();
    let before = sessions.len();
    sessions.retain(|s| s.id != id);
    sessions.len() != before
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionKind;

    #[test]
    fn session_lifecycle() {
        let c = Connection::new(ConnectionKind::Tcp, "test", None, None);

        assert!(session_create(&c, 1));
        assert!(!session_create(&c, 1));
        assert!(session_exists(&c, 1));

        assert!(session_end(&c, 1));
        assert!(!session_end(&c, 1));
        assert!(!session_exists(&c, 1));
    }
}
