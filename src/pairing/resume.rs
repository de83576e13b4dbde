//! The Pair Resume session cache (BLE only).
//!
//! After a successful Pair Verify on BLE, the accessory remembers the session's shared secret
//! under an 8-byte session ID. A controller reconnecting shortly afterwards can then skip the
//! X25519 exchange with a Pair Resume request. The cache is a small fixed-size LRU; entries are
//! invalidated on fetch, when their pairing is removed, and wholesale on admin cleanup.

use crate::crypto::x25519;
use crate::platform::Key;

/// Length of a Pair Resume session ID in bytes.
pub const SESSION_ID_BYTES: usize = 8;

/// Number of sessions the cache remembers.
pub const CACHE_ENTRIES: usize = 8;

struct Entry {
    session_id: [u8; SESSION_ID_BYTES],
    shared_secret: [u8; x25519::KEY_BYTES],
    pairing_key: Key,
    last_use: u32,
}

/// Fixed-size LRU cache of resumable sessions.
pub struct SessionCache {
    entries: [Option<Entry>; CACHE_ENTRIES],
    tick: u32,
}

impl Default for SessionCache {
    fn default() -> Self {
        SessionCache {
            entries: Default::default(),
            tick: 0,
        }
    }
}

impl SessionCache {
    /// Retrieves the shared secret and pairing for `session_id`, if cached.
    ///
    /// The entry is invalidated by the fetch: a session ID can only be resumed once.
    pub fn fetch(
        &mut self,
        session_id: &[u8; SESSION_ID_BYTES],
    ) -> Option<([u8; x25519::KEY_BYTES], Key)> {
        for slot in self.entries.iter_mut() {
            if let Some(entry) = slot {
                if entry.session_id == *session_id {
                    let result = (entry.shared_secret, entry.pairing_key);
                    *slot = None;
                    return Some(result);
                }
            }
        }
        None
    }

    /// Stores the shared secret and pairing for `session_id`, evicting the oldest entry when
    /// full.
    pub fn save(
        &mut self,
        session_id: &[u8; SESSION_ID_BYTES],
        shared_secret: &[u8; x25519::KEY_BYTES],
        pairing_key: Key,
    ) {
        self.tick = self.tick.wrapping_add(1);
        let entry = Entry {
            session_id: *session_id,
            shared_secret: *shared_secret,
            pairing_key,
            last_use: self.tick,
        };

        // Reuse an existing slot for the same session ID or a free slot; otherwise evict the
        // least recently saved entry.
        let mut victim = 0;
        let mut victim_age = u32::MAX;
        for (i, slot) in self.entries.iter().enumerate() {
            match slot {
                None => {
                    victim = i;
                    break;
                }
                Some(existing) => {
                    if existing.session_id == *session_id {
                        victim = i;
                        break;
                    }
                    if existing.last_use < victim_age {
                        victim_age = existing.last_use;
                        victim = i;
                    }
                }
            }
        }
        self.entries[victim] = Some(entry);
    }

    /// Invalidates all entries referring to `pairing_key`.
    pub fn invalidate_pairing(&mut self, pairing_key: Key) {
        for slot in self.entries.iter_mut() {
            if matches!(slot, Some(entry) if entry.pairing_key == pairing_key) {
                *slot = None;
            }
        }
    }

    /// Invalidates all entries.
    pub fn clear(&mut self) {
        for slot in self.entries.iter_mut() {
            *slot = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_invalidates() {
        let mut cache = SessionCache::default();
        cache.save(&[1; 8], &[0x11; 32], Key(0));

        assert_eq!(cache.fetch(&[1; 8]), Some(([0x11; 32], Key(0))));
        assert_eq!(cache.fetch(&[1; 8]), None);
    }

    #[test]
    fn evicts_least_recently_saved() {
        let mut cache = SessionCache::default();
        for i in 0..CACHE_ENTRIES as u8 {
            cache.save(&[i; 8], &[i; 32], Key(i));
        }
        cache.save(&[0xee; 8], &[0xee; 32], Key(0xe));

        assert_eq!(cache.fetch(&[0; 8]), None);
        assert!(cache.fetch(&[1; 8]).is_some());
        assert!(cache.fetch(&[0xee; 8]).is_some());
    }

    #[test]
    fn invalidate_by_pairing() {
        let mut cache = SessionCache::default();
        cache.save(&[1; 8], &[1; 32], Key(0));
        cache.save(&[2; 8], &[2; 32], Key(1));
        cache.save(&[3; 8], &[3; 32], Key(0));

        cache.invalidate_pairing(Key(0));
        assert_eq!(cache.fetch(&[1; 8]), None);
        assert_eq!(cache.fetch(&[3; 8]), None);
        assert!(cache.fetch(&[2; 8]).is_some());
    }
}
