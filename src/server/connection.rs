//! Per-client connection state.
//!
//! Connections live in a slab registry; the slab id is the connection id
//! carried in every operation tag, so a completion recovers its client in
//! O(1) without any pointer games.

use slab::Slab;
use std::os::unix::io::RawFd;

/// Initial capacity of the per-connection reply staging buffer. One reply
/// for the supported command set fits comfortably; larger values grow it.
pub const REPLY_BUF_SIZE: usize = 512;

/// A single client connection.
///
/// Lifetime: created on a successful accept completion, destroyed on the
/// close completion. Operations on a connection are strictly sequential:
/// recv, then write, then the next recv, each issued from the previous
/// operation's completion. At most one operation is in flight at a time.
#[derive(Debug)]
pub struct Connection {
    /// The accepted socket.
    pub fd: RawFd,
    /// Reply staging buffer. While a write is in flight the buffer is never
    /// touched: the next recv (and with it the next `process` call) is only
    /// armed once the write completion reports the full reply sent.
    pub reply: Vec<u8>,
    /// Bytes of the staged reply the kernel has accepted so far. Short
    /// writes are resubmitted from this offset.
    pub written: usize,
    /// Close this connection once the staged reply finishes writing; set on
    /// protocol errors.
    pub hangup: bool,
    /// Client library name, if the client announced one via
    /// `CLIENT SETINFO lib-name`.
    pub lib_name: Option<String>,
    /// Client library version, from `CLIENT SETINFO lib-ver`.
    pub lib_ver: Option<String>,
}

impl Connection {
    pub fn new(fd: RawFd) -> Self {
        Self {
            fd,
            reply: Vec::with_capacity(REPLY_BUF_SIZE),
            written: 0,
            hangup: false,
            lib_name: None,
            lib_ver: None,
        }
    }
}

/// Registry of live connections with O(1) insert, lookup, and remove.
pub struct ConnTable {
    connections: Slab<Connection>,
    max_connections: usize,
}

impl ConnTable {
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections),
            max_connections,
        }
    }

    /// Insert a connection, returning its id, or `None` at capacity.
    pub fn insert(&mut self, conn: Connection) -> Option<usize> {
        if self.connections.len() >= self.max_connections {
            return None;
        }
        Some(self.connections.insert(conn))
    }

    pub fn get(&self, id: usize) -> Option<&Connection> {
        self.connections.get(id)
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut Connection> {
        self.connections.get_mut(id)
    }

    pub fn remove(&mut self, id: usize) -> Option<Connection> {
        if self.connections.contains(id) {
            Some(self.connections.remove(id))
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_respects_capacity() {
        let mut table = ConnTable::new(2);

        let a = table.insert(Connection::new(10)).unwrap();
        let b = table.insert(Connection::new(11)).unwrap();
        assert!(table.insert(Connection::new(12)).is_none());

        assert_eq!(table.len(), 2);
        assert_eq!(table.get(a).unwrap().fd, 10);
        assert_eq!(table.get(b).unwrap().fd, 11);
    }

    #[test]
    fn remove_frees_a_slot() {
        let mut table = ConnTable::new(1);
        let id = table.insert(Connection::new(5)).unwrap();
        assert!(table.remove(id).is_some());
        assert!(table.remove(id).is_none());
        assert!(table.is_empty());
        assert!(table.insert(Connection::new(6)).is_some());
    }

    #[test]
    fn new_connection_has_reply_capacity() {
        let conn = Connection::new(3);
        assert!(conn.reply.capacity() >= REPLY_BUF_SIZE);
        assert!(conn.reply.is_empty());
        assert_eq!(conn.written, 0);
        assert!(!conn.hangup);
        assert!(conn.lib_name.is_none());
    }
}
