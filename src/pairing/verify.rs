//! Pair Verify (M1..M4) and Pair Resume.
//!
//! Pair Verify performs an ephemeral X25519 exchange, authenticates both sides with their
//! long-term Ed25519 keys, and installs the per-session ChaCha20-Poly1305 transport keys. On
//! BLE, a successful verify also seeds the Pair Resume cache so the next connection can
//! re-derive fresh keys from the cached shared secret without public-key cryptography.
//!
//! Writes carry the controller's M1/M3, reads produce the accessory's M2/M4. A pending error is
//! delivered on the next read and resets the procedure.

use crate::crypto::{aead, ed25519, hash, x25519};
use crate::pairing::resume::SESSION_ID_BYTES;
use crate::pairing::{
    find_pairing, read_pairing, tlv_types, Method, PairingError, MAX_IDENTIFIER_BYTES,
};
use crate::platform::{Key, Platform};
use crate::server::AccessoryServer;
use crate::session::{SecurityContext, Session, TransportType};
use crate::tlv::{schema, ExpectedTlv, TlvReader, TlvWriter};
use crate::Error;

/// Pair Verify progress of one session.
pub struct VerifySubState {
    pub(crate) state: u8,
    pub(crate) method: Method,
    pub(crate) error: Option<PairingError>,
    session_key: [u8; aead::KEY_BYTES],
    cv_pk: [u8; x25519::KEY_BYTES],
    controller_cv_pk: [u8; x25519::KEY_BYTES],
    shared_secret: [u8; x25519::KEY_BYTES],
    pairing_key: Option<Key>,
    pairing_is_admin: bool,
    resume_session_id: [u8; SESSION_ID_BYTES],
    resume_tag: [u8; aead::TAG_BYTES],
}

impl Default for VerifySubState {
    fn default() -> Self {
        VerifySubState {
            state: 0,
            method: Method::PairVerify,
            error: None,
            session_key: [0; aead::KEY_BYTES],
            cv_pk: [0; x25519::KEY_BYTES],
            controller_cv_pk: [0; x25519::KEY_BYTES],
            shared_secret: [0; x25519::KEY_BYTES],
            pairing_key: None,
            pairing_is_admin: false,
            resume_session_id: [0; SESSION_ID_BYTES],
            resume_tag: [0; aead::TAG_BYTES],
        }
    }
}

/// Derives the resume session ID both sides compute after a full Pair Verify.
fn derive_resume_session_id(shared_secret: &[u8; x25519::KEY_BYTES]) -> [u8; SESSION_ID_BYTES] {
    let mut session_id = [0; SESSION_ID_BYTES];
    hash::hkdf_sha512(
        shared_secret,
        b"Pair-Verify-ResumeSessionID-Salt",
        b"Pair-Verify-ResumeSessionID-Info",
        &mut session_id,
    );
    session_id
}

fn derive_control_keys(shared_secret: &[u8; x25519::KEY_BYTES]) -> SecurityContext {
    let mut read_key = [0; aead::KEY_BYTES];
    hash::hkdf_sha512(
        shared_secret,
        b"Control-Salt",
        b"Control-Read-Encryption-Key",
        &mut read_key,
    );
    let mut write_key = [0; aead::KEY_BYTES];
    hash::hkdf_sha512(
        shared_secret,
        b"Control-Salt",
        b"Control-Write-Encryption-Key",
        &mut write_key,
    );
    SecurityContext::new(read_key, write_key)
}

/// Processes a Pair Verify (or Pair Resume) request message.
pub fn handle_write<P: Platform>(
    server: &mut AccessoryServer<'_, P>,
    session: &mut Session,
    body: &mut [u8],
) -> Result<(), Error> {
    let mut expected = [
        ExpectedTlv::new(tlv_types::STATE),
        ExpectedTlv::new(tlv_types::METHOD),
        ExpectedTlv::new(tlv_types::PUBLIC_KEY),
        ExpectedTlv::new(tlv_types::ENCRYPTED_DATA),
        ExpectedTlv::new(tlv_types::SESSION_ID),
    ];
    TlvReader::new(body).get_all(&mut expected)?;
    let [state_tlv, method_tlv, public_key_tlv, encrypted_data_tlv, session_id_tlv] = expected;

    let state = schema::read_u8(state_tlv.value.ok_or_else(|| {
        info!("Pair Verify: kTLVType_State missing");
        Error::InvalidData
    })?)?;

    match (session.verify.state, state) {
        (0, 1) => process_m1(
            server,
            session,
            method_tlv.value,
            public_key_tlv.value,
            encrypted_data_tlv.value,
            session_id_tlv.value,
        ),
        (2, 3) => process_m3(server, session, encrypted_data_tlv.value),
        (have, got) => {
            info!("Pair Verify: unexpected write M{} in state M{}", got, have);
            session.verify = VerifySubState::default();
            Err(Error::InvalidState)
        }
    }
}

fn process_m1<P: Platform>(
    server: &mut AccessoryServer<'_, P>,
    session: &mut Session,
    method: Option<&[u8]>,
    public_key: Option<&[u8]>,
    encrypted_data: Option<&[u8]>,
    session_id: Option<&[u8]>,
) -> Result<(), Error> {
    debug!("Pair Verify M1: Verify Start Request");

    let public_key = public_key.ok_or_else(|| {
        info!("Pair Verify M1: kTLVType_PublicKey missing");
        Error::InvalidData
    })?;
    let controller_cv_pk: &[u8; x25519::KEY_BYTES] = schema::read_fixed(public_key)?;
    session.verify.controller_cv_pk = *controller_cv_pk;
    session.verify.state = 1;
    session.verify.method = Method::PairVerify;

    // Pair Resume short-circuits the exchange when the referenced session is still cached.
    let is_resume = matches!(method.map(schema::read_u8), Some(Ok(m)) if Method::from(m) == Method::PairResume);
    if is_resume {
        if session.transport_type() != TransportType::Ble {
            info!("Pair Resume M1: only supported on BLE");
            return Err(Error::InvalidData);
        }
        if let (Some(session_id), Some(encrypted_data)) = (session_id, encrypted_data) {
            if process_resume_request(server, session, session_id, encrypted_data)? {
                session.verify.method = Method::PairResume;
                return Ok(());
            }
        } else {
            info!("Pair Resume M1: kTLVType_SessionID or kTLVType_EncryptedData missing");
            return Err(Error::InvalidData);
        }
        // Fall back to a full Pair Verify using the public key from M1.
        debug!("Pair Resume M1: session not resumable, continuing with Pair Verify");
    }

    Ok(())
}

/// Attempts to resume a cached session. Returns `false` when the request cannot be resumed and
/// the exchange should continue as a full Pair Verify.
fn process_resume_request<P: Platform>(
    server: &mut AccessoryServer<'_, P>,
    session: &mut Session,
    session_id: &[u8],
    encrypted_data: &[u8],
) -> Result<bool, Error> {
    let session_id: &[u8; SESSION_ID_BYTES] = match schema::read_fixed(session_id) {
        Ok(id) => id,
        Err(_) => return Ok(false),
    };
    if encrypted_data.len() != aead::TAG_BYTES {
        info!("Pair Resume M1: unexpected encrypted data length {}", encrypted_data.len());
        return Ok(false);
    }

    let (shared_secret, pairing_key) = match server
        .ble
        .as_mut()
        .and_then(|ble| ble.session_cache.fetch(session_id))
    {
        Some(cached) => cached,
        None => {
            info!("Pair Resume M1: session not cached");
            return Ok(false);
        }
    };
    let pairing = match read_pairing(&mut server.store, pairing_key)? {
        Some(pairing) => pairing,
        None => return Ok(false),
    };

    // RequestKey = HKDF(shared secret, <controller public key || session ID>, request info).
    let mut salt = [0; x25519::KEY_BYTES + SESSION_ID_BYTES];
    salt[..x25519::KEY_BYTES].copy_from_slice(&session.verify.controller_cv_pk);
    salt[x25519::KEY_BYTES..].copy_from_slice(session_id);
    let mut request_key = [0; aead::KEY_BYTES];
    hash::hkdf_sha512(&shared_secret, &salt, b"Pair-Resume-Request-Info", &mut request_key);

    let mut tag = [0; aead::TAG_BYTES];
    tag.copy_from_slice(encrypted_data);
    if aead::decrypt(&request_key, b"PR-Msg01", &[], &mut [], &tag).is_err() {
        info!("Pair Resume M1: request verification failed");
        return Ok(false);
    }

    // Issue a fresh session ID and derive the response key and refreshed shared secret.
    let mut new_session_id = [0; SESSION_ID_BYTES];
    rand_core::RngCore::fill_bytes(&mut server.rng, &mut new_session_id);
    salt[x25519::KEY_BYTES..].copy_from_slice(&new_session_id);

    let mut response_key = [0; aead::KEY_BYTES];
    hash::hkdf_sha512(&shared_secret, &salt, b"Pair-Resume-Response-Info", &mut response_key);
    let response_tag = aead::encrypt(&response_key, b"PR-Msg02", &[], &mut []);

    let mut new_shared_secret = [0; x25519::KEY_BYTES];
    hash::hkdf_sha512(
        &shared_secret,
        &salt,
        b"Pair-Resume-Shared-Secret-Info",
        &mut new_shared_secret,
    );

    session.verify.shared_secret = new_shared_secret;
    session.verify.resume_session_id = new_session_id;
    session.verify.resume_tag = response_tag;
    session.verify.pairing_key = Some(pairing_key);
    session.verify.pairing_is_admin = pairing.is_admin();

    if let Some(ble) = server.ble.as_mut() {
        ble.session_cache
            .save(&new_session_id, &new_shared_secret, pairing_key);
    }
    Ok(true)
}

fn process_m3<P: Platform>(
    server: &mut AccessoryServer<'_, P>,
    session: &mut Session,
    encrypted_data: Option<&[u8]>,
) -> Result<(), Error> {
    debug!("Pair Verify M3: Verify Finish Request");
    session.verify.state = 3;

    let encrypted_data = encrypted_data.ok_or_else(|| {
        info!("Pair Verify M3: kTLVType_EncryptedData missing");
        Error::InvalidData
    })?;
    if encrypted_data.len() < aead::TAG_BYTES || encrypted_data.len() - aead::TAG_BYTES > 128 {
        info!("Pair Verify M3: kTLVType_EncryptedData has invalid length {}", encrypted_data.len());
        return Err(Error::InvalidData);
    }

    let mut buf = [0; 128];
    let data_len = encrypted_data.len() - aead::TAG_BYTES;
    buf[..data_len].copy_from_slice(&encrypted_data[..data_len]);
    let mut tag = [0; aead::TAG_BYTES];
    tag.copy_from_slice(&encrypted_data[data_len..]);

    if aead::decrypt(
        &session.verify.session_key,
        b"PV-Msg03",
        &[],
        &mut buf[..data_len],
        &tag,
    )
    .is_err()
    {
        info!("Pair Verify M3: decryption failed");
        session.verify.error = Some(PairingError::Authentication);
        return Ok(());
    }

    let mut expected = [
        ExpectedTlv::new(tlv_types::IDENTIFIER),
        ExpectedTlv::new(tlv_types::SIGNATURE),
    ];
    TlvReader::new(&mut buf[..data_len]).get_all(&mut expected)?;
    let [identifier_tlv, signature_tlv] = expected;

    let identifier = match identifier_tlv.value {
        Some(id) if !id.is_empty() && id.len() <= MAX_IDENTIFIER_BYTES => id,
        _ => {
            info!("Pair Verify M3: kTLVType_Identifier missing or invalid");
            return Err(Error::InvalidData);
        }
    };
    let signature: &[u8; ed25519::SIGNATURE_BYTES] = match signature_tlv.value {
        Some(sig) => match schema::read_fixed(sig) {
            Ok(sig) => sig,
            Err(e) => return Err(e),
        },
        None => {
            info!("Pair Verify M3: kTLVType_Signature missing");
            return Err(Error::InvalidData);
        }
    };

    let (pairing_key, pairing) = match find_pairing(&mut server.store, identifier)? {
        Some(found) => found,
        None => {
            info!("Pair Verify M3: no pairing for controller identifier");
            session.verify.error = Some(PairingError::Authentication);
            return Ok(());
        }
    };

    // iOSDeviceInfo = iOSDeviceCurvePK || iOSDevicePairingID || AccessoryCurvePK.
    let mut info = [0; x25519::KEY_BYTES + MAX_IDENTIFIER_BYTES + x25519::KEY_BYTES];
    let mut len = 0;
    info[len..len + x25519::KEY_BYTES].copy_from_slice(&session.verify.controller_cv_pk);
    len += x25519::KEY_BYTES;
    info[len..len + identifier.len()].copy_from_slice(identifier);
    len += identifier.len();
    info[len..len + x25519::KEY_BYTES].copy_from_slice(&session.verify.cv_pk);
    len += x25519::KEY_BYTES;

    if !ed25519::verify(signature, &info[..len], &pairing.public_key) {
        info!("Pair Verify M3: signature verification failed");
        session.verify.error = Some(PairingError::Authentication);
        return Ok(());
    }

    session.verify.pairing_key = Some(pairing_key);
    session.verify.pairing_is_admin = pairing.is_admin();
    Ok(())
}

/// Produces the next Pair Verify response message.
pub fn handle_read<P: Platform>(
    server: &mut AccessoryServer<'_, P>,
    session: &mut Session,
    writer: &mut TlvWriter<'_>,
) -> Result<(), Error> {
    if let Some(error) = session.verify.error {
        session.verify.state += 1;
        let state = session.verify.state;
        writer.append(tlv_types::STATE, &[state])?;
        writer.append(tlv_types::ERROR, &[error as u8])?;
        session.verify = VerifySubState::default();
        return Ok(());
    }

    match session.verify.state {
        1 => {
            session.verify.state = 2;
            if session.verify.method == Method::PairResume {
                get_resume_m2(server, session, writer)
            } else {
                get_m2(server, session, writer)
            }
        }
        3 => {
            session.verify.state = 4;
            get_m4(server, session, writer)
        }
        state => {
            info!("Pair Verify: unexpected read in state M{}", state);
            session.verify = VerifySubState::default();
            Err(Error::InvalidState)
        }
    }
}

fn get_m2<P: Platform>(
    server: &mut AccessoryServer<'_, P>,
    session: &mut Session,
    writer: &mut TlvWriter<'_>,
) -> Result<(), Error> {
    debug!("Pair Verify M2: Verify Start Response");

    let mut cv_sk = [0; x25519::SCALAR_BYTES];
    rand_core::RngCore::fill_bytes(&mut server.rng, &mut cv_sk);
    session.verify.cv_pk = x25519::scalarmult_base(&cv_sk);
    session.verify.shared_secret =
        x25519::scalarmult(&cv_sk, &session.verify.controller_cv_pk);

    hash::hkdf_sha512(
        &session.verify.shared_secret,
        b"Pair-Verify-Encrypt-Salt",
        b"Pair-Verify-Encrypt-Info",
        &mut session.verify.session_key,
    );

    // AccessoryInfo = AccessoryCurvePK || AccessoryPairingID || iOSDeviceCurvePK.
    let device_id = server.device_id.as_bytes();
    let mut info = [0; x25519::KEY_BYTES * 2 + 17];
    info[..x25519::KEY_BYTES].copy_from_slice(&session.verify.cv_pk);
    info[x25519::KEY_BYTES..x25519::KEY_BYTES + 17].copy_from_slice(device_id);
    info[x25519::KEY_BYTES + 17..].copy_from_slice(&session.verify.controller_cv_pk);
    let signature = ed25519::sign(&info, &server.ltsk);

    // Sub-TLV with the accessory identifier and signature, encrypted with the session key.
    let mut sub_tlv = [0; 2 + 17 + 2 + ed25519::SIGNATURE_BYTES];
    let sub_len = {
        let mut sub_writer = TlvWriter::new(&mut sub_tlv);
        sub_writer.append(tlv_types::IDENTIFIER, device_id)?;
        sub_writer.append(tlv_types::SIGNATURE, &signature)?;
        sub_writer.len()
    };
    let tag = aead::encrypt(
        &session.verify.session_key,
        b"PV-Msg02",
        &[],
        &mut sub_tlv[..sub_len],
    );

    let mut encrypted = [0; 2 + 17 + 2 + ed25519::SIGNATURE_BYTES + aead::TAG_BYTES];
    encrypted[..sub_len].copy_from_slice(&sub_tlv[..sub_len]);
    encrypted[sub_len..sub_len + aead::TAG_BYTES].copy_from_slice(&tag);

    writer.append(tlv_types::STATE, &[2])?;
    writer.append(tlv_types::PUBLIC_KEY, &session.verify.cv_pk)?;
    writer.append(tlv_types::ENCRYPTED_DATA, &encrypted[..sub_len + aead::TAG_BYTES])?;
    Ok(())
}

fn get_resume_m2<P: Platform>(
    _server: &mut AccessoryServer<'_, P>,
    session: &mut Session,
    writer: &mut TlvWriter<'_>,
) -> Result<(), Error> {
    debug!("Pair Resume M2: Resume Response");

    writer.append(tlv_types::STATE, &[2])?;
    writer.append(tlv_types::METHOD, &[Method::PairResume.into()])?;
    writer.append(tlv_types::SESSION_ID, &session.verify.resume_session_id)?;
    writer.append(tlv_types::ENCRYPTED_DATA, &session.verify.resume_tag)?;

    // The resume response completes the exchange; install the refreshed transport keys.
    session.security = Some(derive_control_keys(&session.verify.shared_secret));
    session.pairing_key = session.verify.pairing_key;
    session.is_admin = session.verify.pairing_is_admin;
    session.transient = false;
    session.verify = VerifySubState::default();
    Ok(())
}

fn get_m4<P: Platform>(
    server: &mut AccessoryServer<'_, P>,
    session: &mut Session,
    writer: &mut TlvWriter<'_>,
) -> Result<(), Error> {
    debug!("Pair Verify M4: Verify Finish Response");

    writer.append(tlv_types::STATE, &[4])?;

    session.security = Some(derive_control_keys(&session.verify.shared_secret));
    session.pairing_key = session.verify.pairing_key;
    session.is_admin = session.verify.pairing_is_admin;
    session.transient = false;

    // Seed the Pair Resume cache so the controller can shortcut its next connection.
    if session.transport_type() == TransportType::Ble {
        if let (Some(pairing_key), Some(ble)) =
            (session.verify.pairing_key, server.ble.as_mut())
        {
            let session_id = derive_resume_session_id(&session.verify.shared_secret);
            ble.session_cache
                .save(&session_id, &session.verify.shared_secret, pairing_key);
        }
    }

    session.verify = VerifySubState::default();
    Ok(())
}
