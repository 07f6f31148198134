//! The set of live connections.
//!
//! Administrative code walks the set while connection workers come and go,
//! so enumeration hands out borrows tracked per connection: while a
//! connection's `enum_count` is nonzero its removal blocks, which lets the
//! enumeration callback dereference the connection freely and lets the
//! walk find its successor afterwards.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use super::Connection;

#[derive(Default)]
pub struct Registry {
    list: Mutex<Vec<Arc<Connection>>>,
    enum_cv: Condvar,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.list.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.lock().is_empty()
    }

    pub fn insert(&self, conn: &Arc<Connection>) {
        assert!(!conn.on_list.load(Ordering::Relaxed));

        let mut list = self.list.lock();
        list.push(Arc::clone(conn));
        conn.on_list.store(true, Ordering::Relaxed);
    }

    /// Unlinks `conn`, waiting until no enumerator holds a borrow on it.
    pub fn remove(&self, conn: &Arc<Connection>) {
        if !conn.on_list.load(Ordering::Relaxed) {
            return;
        }

        let mut list = self.list.lock();
        while conn.enum_count.load(Ordering::Relaxed) != 0 {
            self.enum_cv.wait(&mut list);
        }
        list.retain(|c| !Arc::ptr_eq(c, conn));
        conn.on_list.store(false, Ordering::Relaxed);
    }

    /// Calls `func` for every connection on the list. The list lock is
    /// released around each call; the current connection is pinned by its
    /// `enum_count` borrow instead. Stops early and returns `false` if
    /// `func` does.
    pub fn enumerate(&self, mut func: impl FnMut(&Arc<Connection>) -> bool) -> bool {
        let mut rv = true;

        let mut list = self.list.lock();
        let mut pos = 0;
        while pos < list.len() {
            let conn = Arc::clone(&list[pos]);
            conn.enum_count.fetch_add(1, Ordering::Relaxed);
            drop(list);

            if !func(&conn) {
                rv = false;
            }

            list = self.list.lock();
            // Our borrow kept `conn` on the list, so its position locates
            // the successor even if neighbors were removed meanwhile.
            pos = list
                .iter()
                .position(|c| Arc::ptr_eq(c, &conn))
                .map_or(pos, |i| i + 1);
            conn.enum_count.fetch_sub(1, Ordering::Relaxed);
            self.enum_cv.notify_all();
            if !rv {
                break;
            }
        }

        rv
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionKind;
    use std::thread;
    use std::time::Duration;

    fn conn(name: &str) -> Arc<Connection> {
        Arc::new(Connection::new(ConnectionKind::Tcp, name, None, None))
    }

    #[test]
    fn enumerate_sees_every_connection() {
        let reg = Registry::new();
        let a = conn("a");
        let b = conn("b");
        reg.insert(&a);
        reg.insert(&b);

        let mut seen = Vec::new();
        assert!(reg.enumerate(|c| {
            seen.push(c.name().to_owned());
            true
        }));
        assert_eq!(seen, ["a", "b"]);
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn enumerate_stops_when_callback_declines() {
        let reg = Registry::new();
        reg.insert(&conn("a"));
        reg.insert(&conn("b"));

        let mut calls = 0;
        assert!(!reg.enumerate(|_| {
            calls += 1;
            false
        }));
        assert_eq!(calls, 1);
    }

    #[test]
    fn remove_unlinks_and_allows_reinsert() {
        let reg = Registry::new();
        let a = conn("a");
        reg.insert(&a);
        reg.remove(&a);
        assert!(reg.is_empty());

        // A connection that never made it onto the list is a no-op.
        reg.remove(&a);

        reg.insert(&a);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn remove_waits_for_enumerators() {
        let reg = Arc::new(Registry::new());
        let a = conn("a");
        reg.insert(&a);

        let mut remover = None;
        reg.enumerate(|c| {
            // Start the remover while we hold the borrow; it must block
            // until the callback returns and the borrow is released.
            let reg = Arc::clone(&reg);
            let victim = Arc::clone(c);
            remover = Some(thread::spawn(move || reg.remove(&victim)));

            thread::sleep(Duration::from_millis(200));
            assert!(c.on_list.load(Ordering::Relaxed));
            true
        });

        remover.unwrap().join().unwrap();
        assert!(reg.is_empty());
        assert!(!a.on_list.load(Ordering::Relaxed));
    }

    #[test]
    fn callback_may_remove_other_connections() {
        let reg = Arc::new(Registry::new());
        let a = conn("a");
        let b = conn("b");
        let c = conn("c");
        reg.insert(&a);
        reg.insert(&b);
        reg.insert(&c);

        let mut seen = Vec::new();
        reg.enumerate(|cur| {
            if cur.name() == "a" {
                // Removing a not-yet-visited neighbor from another thread
                // must not derail the walk.
                let reg = Arc::clone(&reg);
                let b = Arc::clone(&b);
                thread::spawn(move || reg.remove(&b)).join().unwrap();
            }
            seen.push(cur.name().to_owned());
            true
        });

        assert_eq!(seen, ["a", "c"]);
    }
}
