//! Add Pairing, Remove Pairing and List Pairings.
//!
//! All three run over an established secure session and are admin-only; a non-admin controller
//! receives an `Authentication` error. Writes carry M1, the following read produces M2 and
//! resets the sub-state. Remove defers the actual removal to M2 so the response is produced
//! after the store mutation, mirroring the request/response pairing of the wire protocol.

use crate::pairing::{
    enumerate_pairings, find_pairing, read_pairing, remove_pairing, tlv_types, update_pairing,
    add_pairing, Method, Pairing, PairingError, MAX_IDENTIFIER_BYTES, PUBLIC_KEY_BYTES,
};
use crate::platform::Platform;
use crate::server::AccessoryServer;
use crate::session::Session;
use crate::tlv::{schema, ExpectedTlv, TlvReader, TlvWriter};
use crate::Error;

/// Pairings procedure progress of one session.
pub struct PairingsSubState {
    pub(crate) state: u8,
    pub(crate) method: Method,
    pub(crate) error: Option<PairingError>,
    removed_id: [u8; MAX_IDENTIFIER_BYTES],
    removed_id_len: u8,
}

impl Default for PairingsSubState {
    fn default() -> Self {
        PairingsSubState {
            state: 0,
            method: Method::ListPairings,
            error: None,
            removed_id: [0; MAX_IDENTIFIER_BYTES],
            removed_id_len: 0,
        }
    }
}

/// Processes a Pairings request message.
pub fn handle_write<P: Platform>(
    server: &mut AccessoryServer<'_, P>,
    session: &mut Session,
    body: &mut [u8],
) -> Result<(), Error> {
    let mut expected = [
        ExpectedTlv::new(tlv_types::METHOD),
        ExpectedTlv::new(tlv_types::IDENTIFIER),
        ExpectedTlv::new(tlv_types::PUBLIC_KEY),
        ExpectedTlv::new(tlv_types::STATE),
        ExpectedTlv::new(tlv_types::PERMISSIONS),
    ];
    if let Err(e) = TlvReader::new(body).get_all(&mut expected) {
        session.pairings = PairingsSubState::default();
        return Err(e);
    }
    let [method_tlv, identifier_tlv, public_key_tlv, state_tlv, permissions_tlv] = expected;

    let result = match session.pairings.state {
        0 => {
            session.pairings.state = 1;

            let state = schema::read_u8(state_tlv.value.ok_or(Error::InvalidData)?)?;
            if state != 1 {
                info!("Pairings M1: kTLVType_State invalid: {}", state);
                Err(Error::InvalidData)
            } else {
                let method = Method::from(schema::read_u8(
                    method_tlv.value.ok_or(Error::InvalidData)?,
                )?);
                match method {
                    Method::AddPairing | Method::RemovePairing | Method::ListPairings => {
                        session.pairings.method = method;
                        process_m1(
                            server,
                            session,
                            identifier_tlv.value,
                            public_key_tlv.value,
                            permissions_tlv.value,
                        )
                    }
                    _ => {
                        info!("Pairings M1: kTLVType_Method invalid");
                        Err(Error::InvalidData)
                    }
                }
            }
        }
        state => {
            info!("received unexpected Pairings write in state M{}", state);
            Err(Error::InvalidState)
        }
    };

    if result.is_err() {
        session.pairings = PairingsSubState::default();
    }
    result
}

fn process_m1<P: Platform>(
    server: &mut AccessoryServer<'_, P>,
    session: &mut Session,
    identifier: Option<&[u8]>,
    public_key: Option<&[u8]>,
    permissions: Option<&[u8]>,
) -> Result<(), Error> {
    // Admin access only.
    if !session.is_secured() || session.is_transient() {
        info!("Pairings M1: rejected access from non-secure session");
        session.pairings.error = Some(PairingError::Authentication);
        return Ok(());
    }
    let pairing_key = session.pairing_key.ok_or(Error::InvalidState)?;
    let controller = read_pairing(&mut server.store, pairing_key)?.ok_or(Error::Unknown)?;
    if !controller.is_admin() {
        info!("Pairings M1: rejected access from non-admin controller");
        session.pairings.error = Some(PairingError::Authentication);
        return Ok(());
    }

    match session.pairings.method {
        Method::AddPairing => {
            process_add_pairing_m1(server, session, identifier, public_key, permissions)
        }
        Method::RemovePairing => process_remove_pairing_m1(session, identifier),
        Method::ListPairings => Ok(()),
        _ => Err(Error::InvalidState),
    }
}

fn process_add_pairing_m1<P: Platform>(
    server: &mut AccessoryServer<'_, P>,
    session: &mut Session,
    identifier: Option<&[u8]>,
    public_key: Option<&[u8]>,
    permissions: Option<&[u8]>,
) -> Result<(), Error> {
    debug!("Add Pairing M1: Add Pairing Request");

    let identifier = match identifier {
        Some(id) if !id.is_empty() && id.len() <= MAX_IDENTIFIER_BYTES => id,
        _ => {
            info!("Add Pairing M1: kTLVType_Identifier missing or invalid");
            return Err(Error::InvalidData);
        }
    };
    let public_key: &[u8; PUBLIC_KEY_BYTES] = match public_key {
        Some(value) => schema::read_fixed(value)?,
        None => {
            info!("Add Pairing M1: kTLVType_PublicKey missing");
            return Err(Error::InvalidData);
        }
    };
    let permissions = schema::read_u8(permissions.ok_or_else(|| {
        info!("Add Pairing M1: kTLVType_Permissions missing");
        Error::InvalidData
    })?)?;
    if permissions & !0x01 != 0 {
        info!("Add Pairing M1: kTLVType_Permissions invalid: {}", permissions);
        return Err(Error::InvalidData);
    }

    match find_pairing(&mut server.store, identifier)? {
        Some((key, existing)) => {
            // An existing pairing may only have its permissions updated, and only when the
            // presented long-term public key matches the stored one.
            if existing.public_key != *public_key {
                info!("Add Pairing M1: public key does not match stored pairing");
                session.pairings.error = Some(PairingError::Unknown);
                return Ok(());
            }
            let updated = Pairing::new(identifier, *public_key, permissions)?;
            update_pairing(&mut server.store, key, &updated)?;
            server.pairing_state_changed = true;

            if server.cleanup_pairings().is_err() {
                info!("Add Pairing M1: failed to cleanup pairings");
                session.pairings.error = Some(PairingError::Unknown);
                return Ok(());
            }
        }
        None => {
            let pairing = Pairing::new(identifier, *public_key, permissions)?;
            match add_pairing(&mut server.store, server.max_pairings, &pairing) {
                Ok(Some(_)) => {
                    server.pairing_state_changed = true;
                }
                Ok(None) => {
                    info!("Add Pairing M1: no space for additional pairings");
                    session.pairings.error = Some(PairingError::MaxPeers);
                    return Ok(());
                }
                Err(_) => {
                    info!("Add Pairing M1: failed to add pairing");
                    session.pairings.error = Some(PairingError::Unknown);
                    return Ok(());
                }
            }
        }
    }
    Ok(())
}

fn process_remove_pairing_m1(
    session: &mut Session,
    identifier: Option<&[u8]>,
) -> Result<(), Error> {
    debug!("Remove Pairing M1: Remove Pairing Request");

    let identifier = match identifier {
        Some(id) if !id.is_empty() && id.len() <= MAX_IDENTIFIER_BYTES => id,
        _ => {
            info!("Remove Pairing M1: kTLVType_Identifier missing or invalid");
            return Err(Error::InvalidData);
        }
    };

    // The removal happens when M2 is produced.
    session.pairings.removed_id[..identifier.len()].copy_from_slice(identifier);
    session.pairings.removed_id_len = identifier.len() as u8;
    Ok(())
}

/// Produces the next Pairings response message.
pub fn handle_read<P: Platform>(
    server: &mut AccessoryServer<'_, P>,
    session: &mut Session,
    writer: &mut TlvWriter<'_>,
) -> Result<(), Error> {
    if let Some(error) = session.pairings.error {
        session.pairings.state += 1;
        let state = session.pairings.state;
        writer.append(tlv_types::STATE, &[state])?;
        writer.append(tlv_types::ERROR, &[error as u8])?;
        session.pairings = PairingsSubState::default();
        return Ok(());
    }

    let result = match session.pairings.state {
        1 => {
            session.pairings.state = 2;
            match session.pairings.method {
                Method::AddPairing => get_add_pairing_m2(session, writer),
                Method::RemovePairing => get_remove_pairing_m2(server, session, writer),
                Method::ListPairings => get_list_pairings_m2(server, writer),
                _ => Err(Error::InvalidState),
            }
        }
        state => {
            info!("received unexpected Pairings read in state M{}", state);
            Err(Error::InvalidState)
        }
    };

    match result {
        Ok(()) if session.pairings.error.is_none() => {
            session.pairings = PairingsSubState::default();
            Ok(())
        }
        other => {
            if other.is_err() {
                session.pairings = PairingsSubState::default();
            }
            other
        }
    }
}

fn get_add_pairing_m2(session: &Session, writer: &mut TlvWriter<'_>) -> Result<(), Error> {
    debug!("Add Pairing M2: Add Pairing Response");
    writer.append(tlv_types::STATE, &[session.pairings.state])
}

fn get_remove_pairing_m2<P: Platform>(
    server: &mut AccessoryServer<'_, P>,
    session: &mut Session,
    writer: &mut TlvWriter<'_>,
) -> Result<(), Error> {
    debug!("Remove Pairing M2: Remove Pairing Response");

    let removed_len = session.pairings.removed_id_len as usize;
    let removed_id = session.pairings.removed_id;
    let identifier = &removed_id[..removed_len];

    // Removing a pairing that does not exist is a success.
    if let Some((key, _)) = find_pairing(&mut server.store, identifier)? {
        if remove_pairing(&mut server.store, key).is_err() {
            info!("Remove Pairing M2: failed to remove pairing");
            session.pairings.error = Some(PairingError::Unknown);
        } else {
            server.pairing_state_changed = true;

            // Cached resumable sessions of the removed controller must not survive it.
            if let Some(ble) = server.ble.as_mut() {
                ble.session_cache.invalidate_pairing(key);
            }

            if server.cleanup_pairings().is_err() {
                info!("Remove Pairing M2: failed to cleanup pairings");
                session.pairings.error = Some(PairingError::Unknown);
            }
        }
    }

    if session.pairings.error.is_some() {
        // Deliver the error on this read rather than the next.
        let state = session.pairings.state;
        writer.append(tlv_types::STATE, &[state])?;
        writer.append(tlv_types::ERROR, &[PairingError::Unknown as u8])?;
        session.pairings = PairingsSubState::default();
        return Ok(());
    }

    writer.append(tlv_types::STATE, &[2])
}

fn get_list_pairings_m2<P: Platform>(
    server: &mut AccessoryServer<'_, P>,
    writer: &mut TlvWriter<'_>,
) -> Result<(), Error> {
    debug!("List Pairings M2: List Pairings Response");

    writer.append(tlv_types::STATE, &[2])?;

    let mut write_err = Ok(());
    let mut needs_separator = false;
    enumerate_pairings(&mut server.store, &mut |_, pairing| {
        let mut append = || -> Result<(), Error> {
            if needs_separator {
                writer.append_separator()?;
            }
            writer.append(tlv_types::IDENTIFIER, pairing.identifier())?;
            writer.append(tlv_types::PUBLIC_KEY, &pairing.public_key)?;
            writer.append(tlv_types::PERMISSIONS, &[pairing.permissions])?;
            Ok(())
        };
        match append() {
            Ok(()) => {
                needs_separator = true;
                true
            }
            Err(e) => {
                write_err = Err(e);
                false
            }
        }
    })?;
    write_err
}
