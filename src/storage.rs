//! In-memory key-value storage.
//!
//! A plain byte-keyed map owned by the single dispatch thread, so no
//! synchronization is needed. Keys and values are copied out of the receive
//! buffer on insert; the buffer is recycled to the kernel pool immediately
//! after dispatch, so nothing in the store may alias it.

use std::collections::HashMap;
use tracing::trace;

/// Unordered mapping from byte-string keys to byte-string values.
#[derive(Debug, Default)]
pub struct Store {
    data: HashMap<Vec<u8>, Vec<u8>>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a value.
    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.data.get(key).map(Vec::as_slice)
    }

    /// Insert a copy of `value` under a copy of `key`, replacing any prior
    /// value for the key.
    pub fn set(&mut self, key: &[u8], value: &[u8]) {
        trace!(
            key = %String::from_utf8_lossy(key),
            bytes = value.len(),
            "stored item"
        );
        self.data.insert(key.to_vec(), value.to_vec());
    }

    /// Remove a key. Returns whether it was present.
    pub fn delete(&mut self, key: &[u8]) -> bool {
        let removed = self.data.remove(key).is_some();
        if removed {
            trace!(key = %String::from_utf8_lossy(key), "deleted item");
        }
        removed
    }

    /// Whether a key is present.
    pub fn contains(&self, key: &[u8]) -> bool {
        self.data.contains_key(key)
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_on_missing_key() {
        let store = Store::new();
        assert!(store.get(b"nonexistent").is_none());
    }

    #[test]
    fn set_then_get() {
        let mut store = Store::new();
        store.set(b"foo", b"bar");
        assert_eq!(store.get(b"foo"), Some(&b"bar"[..]));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn set_replaces_prior_value() {
        let mut store = Store::new();
        store.set(b"foo", b"first");
        store.set(b"foo", b"second");
        assert_eq!(store.get(b"foo"), Some(&b"second"[..]));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn stored_bytes_do_not_alias_input() {
        let mut store = Store::new();
        let mut buf = b"key-value".to_vec();
        store.set(&buf[..3], &buf[4..]);
        // Clobber the source buffer: the store must hold its own copies.
        buf.iter_mut().for_each(|b| *b = 0);
        assert_eq!(store.get(b"key"), Some(&b"value"[..]));
    }

    #[test]
    fn delete_reports_presence() {
        let mut store = Store::new();
        store.set(b"k", b"v");
        assert!(store.delete(b"k"));
        assert!(!store.delete(b"k"));
        assert!(store.get(b"k").is_none());
    }

    #[test]
    fn binary_keys_and_values() {
        let mut store = Store::new();
        store.set(b"\x00\r\n", b"\xff\xfe\r\n");
        assert!(store.contains(b"\x00\r\n"));
        assert_eq!(store.get(b"\x00\r\n"), Some(&b"\xff\xfe\r\n"[..]));
    }
}
