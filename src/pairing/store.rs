//! Persistence of pairings in the key-value store.
//!
//! Each pairing occupies one key in the `PAIRINGS` domain with a fixed 70-byte record:
//! 36 identifier bytes (zero padded), 1 identifier length byte, 32 public key bytes, and
//! 1 permissions byte. Keys are allocated lowest-free-first below the configured maximum.

use crate::pairing::{Pairing, MAX_IDENTIFIER_BYTES, PUBLIC_KEY_BYTES};
use crate::platform::{domains, Key, KeyValueStore};
use crate::Error;

/// Size of a serialized pairing record.
pub const RECORD_BYTES: usize = MAX_IDENTIFIER_BYTES + 1 + PUBLIC_KEY_BYTES + 1;

fn serialize(pairing: &Pairing) -> [u8; RECORD_BYTES] {
    let mut record = [0; RECORD_BYTES];
    record[..MAX_IDENTIFIER_BYTES].copy_from_slice(&pairing.identifier);
    record[36] = pairing.identifier_len;
    record[37..69].copy_from_slice(&pairing.public_key);
    record[69] = pairing.permissions;
    record
}

fn deserialize(record: &[u8]) -> Result<Pairing, Error> {
    if record.len() != RECORD_BYTES {
        error!("invalid pairing record size {}", record.len());
        return Err(Error::Unknown);
    }
    let identifier_len = record[36];
    if identifier_len as usize > MAX_IDENTIFIER_BYTES {
        error!("invalid pairing identifier length {}", identifier_len);
        return Err(Error::Unknown);
    }
    let mut identifier = [0; MAX_IDENTIFIER_BYTES];
    identifier.copy_from_slice(&record[..MAX_IDENTIFIER_BYTES]);
    let mut public_key = [0; PUBLIC_KEY_BYTES];
    public_key.copy_from_slice(&record[37..69]);
    Ok(Pairing {
        identifier,
        identifier_len,
        public_key,
        permissions: record[69],
    })
}

/// Reads the pairing stored under `key`, if any.
pub fn read_pairing<S: KeyValueStore>(store: &mut S, key: Key) -> Result<Option<Pairing>, Error> {
    let mut record = [0; RECORD_BYTES];
    match store.get(domains::PAIRINGS, key, &mut record)? {
        None => Ok(None),
        Some(len) => deserialize(&record[..len]).map(Some),
    }
}

/// Looks for a pairing with the given identifier.
///
/// Returns the store key and the full record when found.
pub fn find_pairing<S: KeyValueStore>(
    store: &mut S,
    identifier: &[u8],
) -> Result<Option<(Key, Pairing)>, Error> {
    let mut result: Option<(Key, Pairing)> = None;
    let mut record_err = Ok(());
    store.enumerate(domains::PAIRINGS, &mut |key, record| {
        let pairing = match deserialize(record) {
            Ok(pairing) => pairing,
            Err(e) => {
                record_err = Err(e);
                return false;
            }
        };
        if pairing.identifier() == identifier {
            result = Some((key, pairing));
            false
        } else {
            true
        }
    })?;
    record_err?;
    Ok(result)
}

/// Stores a new pairing in the lowest free key below `max_pairings`.
///
/// Returns `Error::NotAuthorized` disguised as `MaxPeers` by the caller when the table is full.
pub fn add_pairing<S: KeyValueStore>(
    store: &mut S,
    max_pairings: u8,
    pairing: &Pairing,
) -> Result<Option<Key>, Error> {
    let mut record = [0; RECORD_BYTES];
    for index in 0..max_pairings {
        let key = Key(index);
        match store.get(domains::PAIRINGS, key, &mut record)? {
            Some(len) => {
                if len != RECORD_BYTES {
                    error!("invalid pairing record size {}", len);
                    return Err(Error::Unknown);
                }
            }
            None => {
                store.set(domains::PAIRINGS, key, &serialize(pairing))?;
                return Ok(Some(key));
            }
        }
    }
    Ok(None)
}

/// Overwrites the pairing stored under `key`.
pub fn update_pairing<S: KeyValueStore>(
    store: &mut S,
    key: Key,
    pairing: &Pairing,
) -> Result<(), Error> {
    store.set(domains::PAIRINGS, key, &serialize(pairing))
}

/// Removes the pairing stored under `key`.
pub fn remove_pairing<S: KeyValueStore>(store: &mut S, key: Key) -> Result<(), Error> {
    store.remove(domains::PAIRINGS, key)
}

/// Removes all pairings.
pub fn purge_pairings<S: KeyValueStore>(store: &mut S) -> Result<(), Error> {
    store.purge_domain(domains::PAIRINGS)
}

/// Calls `f` with every stored pairing until it returns `false`.
pub fn enumerate_pairings<S: KeyValueStore>(
    store: &mut S,
    f: &mut dyn FnMut(Key, &Pairing) -> bool,
) -> Result<(), Error> {
    let mut record_err = Ok(());
    store.enumerate(domains::PAIRINGS, &mut |key, record| {
        match deserialize(record) {
            Ok(pairing) => f(key, &pairing),
            Err(e) => {
                record_err = Err(e);
                false
            }
        }
    })?;
    record_err
}

/// Returns whether any pairing exists.
pub fn has_pairings<S: KeyValueStore>(store: &mut S) -> Result<bool, Error> {
    let mut found = false;
    enumerate_pairings(store, &mut |_, _| {
        found = true;
        false
    })?;
    Ok(found)
}

/// Returns whether an admin pairing exists.
pub fn has_admin_pairing<S: KeyValueStore>(store: &mut S) -> Result<bool, Error> {
    let mut found = false;
    enumerate_pairings(store, &mut |_, pairing| {
        if pairing.is_admin() {
            found = true;
            false
        } else {
            true
        }
    })?;
    Ok(found)
}
