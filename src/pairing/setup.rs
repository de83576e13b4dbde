//! Pair Setup (M1..M6).
//!
//! Mutual authentication through SRP-6a over the accessory's 8-digit setup code, followed by an
//! exchange of long-term Ed25519 identities encrypted under a key derived from the SRP session
//! key. Two variants shorten the exchange:
//!
//! * A *transient* Pair Setup (flag bit 4) finishes after M4 and secures the session without
//!   exchanging identities; no pairing is persisted.
//! * A *split* Pair Setup (flag bit 24) saves the SRP verifier of a transient session so a
//!   later non-transient session can reuse it without a fresh setup-code entry.
//!
//! The server enforces a single outstanding Pair Setup across all sessions, answers concurrent
//! attempts with `Busy`, and refuses further attempts with `MaxTries` after three failed
//! setup-code proofs until the accessory restarts.

use crate::crypto::{aead, constant_time_eq, ed25519, hash, srp};
use crate::pairing::{
    add_pairing, find_pairing, flags, has_admin_pairing, tlv_types, update_pairing, Method,
    Pairing, PairingError, PERMISSION_ADMIN,
};
use crate::platform::{Clock, Platform};
use crate::server::AccessoryServer;
use crate::session::{SecurityContext, Session, SessionId};
use crate::tlv::{schema, ExpectedTlv, TlvReader, TlvWriter};
use crate::Error;

/// SRP username fixed by the protocol.
const SRP_USERNAME: &[u8] = b"Pair-Setup";

/// Failed setup-code attempts allowed before Pair Setup locks until restart.
pub const MAX_AUTH_ATTEMPTS: u8 = 3;

/// Pair Setup progress of one session.
///
/// The SRP state itself lives in the server's single [`PairSetupResource`]; sessions only track
/// their message counter and pending error.
///
/// [`PairSetupResource`]: struct.PairSetupResource.html
#[derive(Default)]
pub struct SetupSubState {
    pub(crate) state: u8,
    pub(crate) error: Option<PairingError>,
}

/// Salt and verifier saved by a transient split Pair Setup for the follow-up session.
pub(crate) struct SavedSrp {
    pub salt: [u8; srp::SALT_BYTES],
    pub verifier: [u8; srp::VERIFIER_BYTES],
}

/// The server-wide SRP state of the one Pair Setup in flight.
pub(crate) struct PairSetupResource {
    pub session_id: SessionId,
    pub method: Method,
    pub flags: u32,
    pub salt: [u8; srp::SALT_BYTES],
    pub verifier: [u8; srp::VERIFIER_BYTES],
    pub b: [u8; srp::SECRET_KEY_BYTES],
    pub pub_b: [u8; srp::PUBLIC_KEY_BYTES],
    pub pub_a: [u8; srp::PUBLIC_KEY_BYTES],
    pub proof_m1: [u8; srp::PROOF_BYTES],
    pub session_key: [u8; srp::SESSION_KEY_BYTES],
}

impl PairSetupResource {
    fn is_transient(&self) -> bool {
        self.flags & flags::TRANSIENT != 0
    }

    fn is_split(&self) -> bool {
        self.flags & flags::SPLIT != 0
    }
}

fn derive_setup_key(session_key: &[u8; srp::SESSION_KEY_BYTES]) -> [u8; aead::KEY_BYTES] {
    let mut key = [0; aead::KEY_BYTES];
    hash::hkdf_sha512(
        session_key,
        b"Pair-Setup-Encrypt-Salt",
        b"Pair-Setup-Encrypt-Info",
        &mut key,
    );
    key
}

/// Processes a Pair Setup request message.
pub fn handle_write<P: Platform>(
    server: &mut AccessoryServer<'_, P>,
    session: &mut Session,
    body: &mut [u8],
) -> Result<(), Error> {
    let mut expected = [
        ExpectedTlv::new(tlv_types::STATE),
        ExpectedTlv::new(tlv_types::METHOD),
        ExpectedTlv::new(tlv_types::FLAGS),
        ExpectedTlv::new(tlv_types::PUBLIC_KEY),
        ExpectedTlv::new(tlv_types::PROOF),
        ExpectedTlv::new(tlv_types::ENCRYPTED_DATA),
    ];
    TlvReader::new(body).get_all(&mut expected)?;
    let [state_tlv, method_tlv, flags_tlv, public_key_tlv, proof_tlv, encrypted_data_tlv] =
        expected;

    let state = schema::read_u8(state_tlv.value.ok_or_else(|| {
        info!("Pair Setup: kTLVType_State missing");
        Error::InvalidData
    })?)?;

    let result = match (session.setup.state, state) {
        (0, 1) => process_m1(server, session, method_tlv.value, flags_tlv.value),
        (2, 3) => process_m3(server, session, public_key_tlv.value, proof_tlv.value),
        (4, 5) => process_m5(server, session, encrypted_data_tlv.value),
        (have, got) => {
            info!("Pair Setup: unexpected write M{} in state M{}", got, have);
            Err(Error::InvalidState)
        }
    };
    if result.is_err() {
        release(server, session);
        session.setup = SetupSubState::default();
    }
    result
}

/// Releases the server's Pair Setup resource if this session owns it.
pub(crate) fn release<P: Platform>(server: &mut AccessoryServer<'_, P>, session: &Session) {
    if matches!(&server.pair_setup, Some(resource) if resource.session_id == session.id) {
        server.pair_setup = None;
    }
}

fn process_m1<P: Platform>(
    server: &mut AccessoryServer<'_, P>,
    session: &mut Session,
    method: Option<&[u8]>,
    setup_flags: Option<&[u8]>,
) -> Result<(), Error> {
    debug!("Pair Setup M1: SRP Start Request");
    session.setup.state = 1;

    let method = match method {
        Some(value) => Method::from(schema::read_u8(value)?),
        None => Method::PairSetup,
    };
    if method != Method::PairSetup && method != Method::PairSetupWithAuth {
        info!("Pair Setup M1: kTLVType_Method invalid");
        return Err(Error::InvalidData);
    }
    if method == Method::PairSetupWithAuth && server.mfi.is_none() {
        info!("Pair Setup M1: hardware authentication requested but no coprocessor present");
        session.setup.error = Some(PairingError::Authentication);
        return Ok(());
    }
    let setup_flags = setup_flags.map(schema::read_flags).unwrap_or(0);

    if server.num_auth_attempts >= MAX_AUTH_ATTEMPTS {
        info!("Pair Setup M1: too many failed authentication attempts");
        session.setup.error = Some(PairingError::MaxTries);
        return Ok(());
    }
    if matches!(&server.pair_setup, Some(resource) if resource.session_id != session.id) {
        info!("Pair Setup M1: another session is currently pairing");
        session.setup.error = Some(PairingError::Busy);
        return Ok(());
    }
    if has_admin_pairing(&mut server.store)? {
        info!("Pair Setup M1: accessory is already paired");
        session.setup.error = Some(PairingError::Unavailable);
        return Ok(());
    }

    // A split (non-transient) request reuses the SRP verifier saved by an earlier transient
    // session; everything else pairs against the setup code's verifier.
    let (salt, verifier) = if setup_flags & flags::SPLIT != 0 && setup_flags & flags::TRANSIENT == 0
    {
        match &server.saved_srp {
            Some(saved) => (saved.salt, saved.verifier),
            None => {
                info!("Pair Setup M1: no saved SRP verifier for split setup");
                session.setup.error = Some(PairingError::Authentication);
                return Ok(());
            }
        }
    } else {
        (server.setup_info.salt, server.setup_info.verifier)
    };

    let mut b = [0; srp::SECRET_KEY_BYTES];
    rand_core::RngCore::fill_bytes(&mut server.rng, &mut b);
    let pub_b = srp::public_key(&b, &verifier);

    server.pair_setup = Some(PairSetupResource {
        session_id: session.id,
        method,
        flags: setup_flags,
        salt,
        verifier,
        b,
        pub_b,
        pub_a: [0; srp::PUBLIC_KEY_BYTES],
        proof_m1: [0; srp::PROOF_BYTES],
        session_key: [0; srp::SESSION_KEY_BYTES],
    });
    Ok(())
}

fn process_m3<P: Platform>(
    server: &mut AccessoryServer<'_, P>,
    session: &mut Session,
    public_key: Option<&[u8]>,
    proof: Option<&[u8]>,
) -> Result<(), Error> {
    debug!("Pair Setup M3: SRP Verify Request");
    session.setup.state = 3;

    let public_key = match public_key {
        Some(value) if !value.is_empty() && value.len() <= srp::PUBLIC_KEY_BYTES => value,
        _ => {
            info!("Pair Setup M3: kTLVType_PublicKey missing or invalid");
            return Err(Error::InvalidData);
        }
    };
    let proof: &[u8; srp::PROOF_BYTES] = match proof {
        Some(value) => schema::read_fixed(value)?,
        None => {
            info!("Pair Setup M3: kTLVType_Proof missing");
            return Err(Error::InvalidData);
        }
    };

    let resource = match &mut server.pair_setup {
        Some(resource) if resource.session_id == session.id => resource,
        _ => return Err(Error::InvalidState),
    };

    // The controller's A arrives unpadded; restore the wire width.
    let mut pub_a = [0; srp::PUBLIC_KEY_BYTES];
    pub_a[srp::PUBLIC_KEY_BYTES - public_key.len()..].copy_from_slice(public_key);

    let u = srp::scrambling_parameter(&pub_a, &resource.pub_b);
    let premaster = match srp::premaster_secret(&pub_a, &resource.b, &u, &resource.verifier) {
        Ok(premaster) => premaster,
        Err(_) => {
            info!("Pair Setup M3: illegal controller public key");
            session.setup.error = Some(PairingError::Authentication);
            return Ok(());
        }
    };
    let session_key = srp::session_key(&premaster);

    let expected_proof = srp::proof_m1(
        SRP_USERNAME,
        &resource.salt,
        &pub_a,
        &resource.pub_b,
        &session_key,
    );
    if !constant_time_eq(&expected_proof, proof) {
        info!("Pair Setup M3: setup code proof verification failed");
        server.num_auth_attempts += 1;
        session.setup.error = Some(PairingError::Authentication);
        return Ok(());
    }
    server.num_auth_attempts = 0;

    resource.session_key = session_key;
    resource.pub_a = pub_a;
    resource.proof_m1 = *proof;
    Ok(())
}

fn process_m5<P: Platform>(
    server: &mut AccessoryServer<'_, P>,
    session: &mut Session,
    encrypted_data: Option<&[u8]>,
) -> Result<(), Error> {
    debug!("Pair Setup M5: Exchange Request");
    session.setup.state = 5;

    let encrypted_data = match encrypted_data {
        Some(value) if value.len() >= aead::TAG_BYTES && value.len() <= 256 => value,
        _ => {
            info!("Pair Setup M5: kTLVType_EncryptedData missing or invalid");
            return Err(Error::InvalidData);
        }
    };

    let resource = match &server.pair_setup {
        Some(resource) if resource.session_id == session.id => resource,
        _ => return Err(Error::InvalidState),
    };
    let setup_key = derive_setup_key(&resource.session_key);
    let session_key = resource.session_key;

    let data_len = encrypted_data.len() - aead::TAG_BYTES;
    let mut buf = [0; 256];
    buf[..data_len].copy_from_slice(&encrypted_data[..data_len]);
    let mut tag = [0; aead::TAG_BYTES];
    tag.copy_from_slice(&encrypted_data[data_len..]);

    if aead::decrypt(&setup_key, b"PS-Msg05", &[], &mut buf[..data_len], &tag).is_err() {
        info!("Pair Setup M5: decryption failed");
        session.setup.error = Some(PairingError::Authentication);
        return Ok(());
    }

    let mut expected = [
        ExpectedTlv::new(tlv_types::IDENTIFIER),
        ExpectedTlv::new(tlv_types::PUBLIC_KEY),
        ExpectedTlv::new(tlv_types::SIGNATURE),
    ];
    TlvReader::new(&mut buf[..data_len]).get_all(&mut expected)?;
    let [identifier_tlv, public_key_tlv, signature_tlv] = expected;

    let identifier = match identifier_tlv.value {
        Some(id) if !id.is_empty() && id.len() <= crate::pairing::MAX_IDENTIFIER_BYTES => id,
        _ => {
            info!("Pair Setup M5: kTLVType_Identifier missing or invalid");
            return Err(Error::InvalidData);
        }
    };
    let ltpk: &[u8; ed25519::PUBLIC_KEY_BYTES] = match public_key_tlv.value {
        Some(value) => schema::read_fixed(value)?,
        None => {
            info!("Pair Setup M5: kTLVType_PublicKey missing");
            return Err(Error::InvalidData);
        }
    };
    let signature: &[u8; ed25519::SIGNATURE_BYTES] = match signature_tlv.value {
        Some(value) => schema::read_fixed(value)?,
        None => {
            info!("Pair Setup M5: kTLVType_Signature missing");
            return Err(Error::InvalidData);
        }
    };

    // iOSDeviceInfo = iOSDeviceX || iOSDevicePairingID || iOSDeviceLTPK.
    let mut device_x = [0; 32];
    hash::hkdf_sha512(
        &session_key,
        b"Pair-Setup-Controller-Sign-Salt",
        b"Pair-Setup-Controller-Sign-Info",
        &mut device_x,
    );
    let mut info = [0; 32 + crate::pairing::MAX_IDENTIFIER_BYTES + ed25519::PUBLIC_KEY_BYTES];
    let mut len = 0;
    info[len..len + 32].copy_from_slice(&device_x);
    len += 32;
    info[len..len + identifier.len()].copy_from_slice(identifier);
    len += identifier.len();
    info[len..len + ed25519::PUBLIC_KEY_BYTES].copy_from_slice(ltpk);
    len += ed25519::PUBLIC_KEY_BYTES;

    if !ed25519::verify(signature, &info[..len], ltpk) {
        info!("Pair Setup M5: signature verification failed");
        session.setup.error = Some(PairingError::Authentication);
        return Ok(());
    }

    // Persist the controller as the first (admin) pairing.
    let pairing = Pairing::new(identifier, *ltpk, PERMISSION_ADMIN)?;
    match find_pairing(&mut server.store, identifier)? {
        Some((key, existing)) => {
            if existing.public_key != *ltpk {
                info!("Pair Setup M5: identifier already paired with different key");
                session.setup.error = Some(PairingError::Unknown);
                return Ok(());
            }
            update_pairing(&mut server.store, key, &pairing)?;
        }
        None => {
            if add_pairing(&mut server.store, server.max_pairings, &pairing)?.is_none() {
                info!("Pair Setup M5: no space for additional pairings");
                session.setup.error = Some(PairingError::MaxPeers);
                return Ok(());
            }
        }
    }

    Ok(())
}

/// Produces the next Pair Setup response message.
pub fn handle_read<P: Platform>(
    server: &mut AccessoryServer<'_, P>,
    session: &mut Session,
    writer: &mut TlvWriter<'_>,
) -> Result<(), Error> {
    if let Some(error) = session.setup.error {
        session.setup.state += 1;
        let state = session.setup.state;
        writer.append(tlv_types::STATE, &[state])?;
        writer.append(tlv_types::ERROR, &[error as u8])?;
        release(server, session);
        session.setup = SetupSubState::default();
        return Ok(());
    }

    match session.setup.state {
        1 => {
            session.setup.state = 2;
            get_m2(server, session, writer)
        }
        3 => {
            session.setup.state = 4;
            get_m4(server, session, writer)
        }
        5 => {
            session.setup.state = 6;
            get_m6(server, session, writer)
        }
        state => {
            info!("Pair Setup: unexpected read in state M{}", state);
            release(server, session);
            session.setup = SetupSubState::default();
            Err(Error::InvalidState)
        }
    }
}

fn get_m2<P: Platform>(
    server: &mut AccessoryServer<'_, P>,
    session: &mut Session,
    writer: &mut TlvWriter<'_>,
) -> Result<(), Error> {
    debug!("Pair Setup M2: SRP Start Response");

    let resource = match &server.pair_setup {
        Some(resource) if resource.session_id == session.id => resource,
        _ => return Err(Error::InvalidState),
    };

    writer.append(tlv_types::STATE, &[2])?;
    writer.append(tlv_types::PUBLIC_KEY, &resource.pub_b)?;
    writer.append(tlv_types::SALT, &resource.salt)?;
    if resource.flags != 0 {
        let mut scratch = [0; 8];
        let flag_bytes = schema::write_uint(resource.flags as u64, &mut scratch);
        writer.append(tlv_types::FLAGS, flag_bytes)?;
    }
    Ok(())
}

fn get_m4<P: Platform>(
    server: &mut AccessoryServer<'_, P>,
    session: &mut Session,
    writer: &mut TlvWriter<'_>,
) -> Result<(), Error> {
    debug!("Pair Setup M4: SRP Verify Response");

    let resource = match &server.pair_setup {
        Some(resource) if resource.session_id == session.id => resource,
        _ => return Err(Error::InvalidState),
    };
    let proof = srp::proof_m2(&resource.pub_a, &resource.proof_m1, &resource.session_key);

    writer.append(tlv_types::STATE, &[4])?;
    writer.append(tlv_types::PROOF, &proof)?;

    if resource.method == Method::PairSetupWithAuth {
        append_mfi_proof(server, session, writer)?;
    }
    let resource = match &server.pair_setup {
        Some(resource) if resource.session_id == session.id => resource,
        _ => return Err(Error::InvalidState),
    };

    if resource.is_transient() {
        // Transient setup ends here: secure the session from the SRP session key and keep no
        // long-term state other than an optional split verifier.
        let mut shared = [0; 32];
        hash::hkdf_sha512(
            &resource.session_key,
            b"Pair-Setup-Encrypt-Salt",
            b"Pair-Setup-Encrypt-Info",
            &mut shared,
        );
        let mut read_key = [0; aead::KEY_BYTES];
        hash::hkdf_sha512(&shared, b"Control-Salt", b"Control-Read-Encryption-Key", &mut read_key);
        let mut write_key = [0; aead::KEY_BYTES];
        hash::hkdf_sha512(&shared, b"Control-Salt", b"Control-Write-Encryption-Key", &mut write_key);

        if resource.is_split() {
            server.saved_srp = Some(SavedSrp {
                salt: resource.salt,
                verifier: resource.verifier,
            });
        }

        session.security = Some(SecurityContext::new(read_key, write_key));
        session.transient = true;
        session.is_admin = false;
        session.pairing_key = None;

        release(server, session);
        session.setup = SetupSubState::default();
    }
    Ok(())
}

/// Appends the encrypted MFi proof to M4 when hardware authentication was requested.
fn append_mfi_proof<P: Platform>(
    server: &mut AccessoryServer<'_, P>,
    session: &Session,
    writer: &mut TlvWriter<'_>,
) -> Result<(), Error> {
    let session_key = match &server.pair_setup {
        Some(resource) if resource.session_id == session.id => resource.session_key,
        _ => return Err(Error::InvalidState),
    };
    let setup_key = derive_setup_key(&session_key);

    let mut challenge = [0; 32];
    hash::hkdf_sha512(
        &session_key,
        b"MFi-Pair-Setup-Salt",
        b"MFi-Pair-Setup-Info",
        &mut challenge,
    );

    let now = server.clock.now();
    let mfi = server.mfi.as_mut().ok_or(Error::InvalidState)?;
    let mut signature = [0; crate::mfi::MAX_SIGNATURE_BYTES];
    let signature_len = mfi.create_signature(now, &challenge, &mut signature)?;
    let mut certificate = [0; crate::mfi::MAX_CERTIFICATE_BYTES];
    let certificate_len = mfi.copy_certificate(now, &mut certificate)?;

    // Sub-TLV with signature and certificate, encrypted under the setup key.
    let mut sub_tlv = [0; 2 + crate::mfi::MAX_SIGNATURE_BYTES
        + 2 * (crate::mfi::MAX_CERTIFICATE_BYTES / 255 + 1)
        + crate::mfi::MAX_CERTIFICATE_BYTES
        + aead::TAG_BYTES];
    let sub_len = {
        let mut sub_writer = TlvWriter::new(&mut sub_tlv);
        sub_writer.append(tlv_types::SIGNATURE, &signature[..signature_len])?;
        sub_writer.append(tlv_types::CERTIFICATE, &certificate[..certificate_len])?;
        sub_writer.len()
    };
    let tag = aead::encrypt(&setup_key, b"PS-Msg04", &[], &mut sub_tlv[..sub_len]);
    sub_tlv[sub_len..sub_len + aead::TAG_BYTES].copy_from_slice(&tag);

    writer.append(tlv_types::ENCRYPTED_DATA, &sub_tlv[..sub_len + aead::TAG_BYTES])
}

fn get_m6<P: Platform>(
    server: &mut AccessoryServer<'_, P>,
    session: &mut Session,
    writer: &mut TlvWriter<'_>,
) -> Result<(), Error> {
    debug!("Pair Setup M6: Exchange Response");

    let resource = match &server.pair_setup {
        Some(resource) if resource.session_id == session.id => resource,
        _ => return Err(Error::InvalidState),
    };
    let session_key = resource.session_key;
    let setup_key = derive_setup_key(&session_key);

    // AccessoryInfo = AccessoryX || AccessoryPairingID || AccessoryLTPK.
    let mut accessory_x = [0; 32];
    hash::hkdf_sha512(
        &session_key,
        b"Pair-Setup-Accessory-Sign-Salt",
        b"Pair-Setup-Accessory-Sign-Info",
        &mut accessory_x,
    );
    let device_id = *server.device_id.as_bytes();
    let mut info = [0; 32 + 17 + ed25519::PUBLIC_KEY_BYTES];
    info[..32].copy_from_slice(&accessory_x);
    info[32..49].copy_from_slice(&device_id);
    info[49..].copy_from_slice(&server.ltpk);
    let signature = ed25519::sign(&info, &server.ltsk);

    let mut sub_tlv = [0; 2 + 17 + 2 + ed25519::PUBLIC_KEY_BYTES + 2 + ed25519::SIGNATURE_BYTES
        + aead::TAG_BYTES];
    let sub_len = {
        let mut sub_writer = TlvWriter::new(&mut sub_tlv);
        sub_writer.append(tlv_types::IDENTIFIER, &device_id)?;
        sub_writer.append(tlv_types::PUBLIC_KEY, &server.ltpk)?;
        sub_writer.append(tlv_types::SIGNATURE, &signature)?;
        sub_writer.len()
    };
    let tag = aead::encrypt(&setup_key, b"PS-Msg06", &[], &mut sub_tlv[..sub_len]);
    sub_tlv[sub_len..sub_len + aead::TAG_BYTES].copy_from_slice(&tag);

    writer.append(tlv_types::STATE, &[6])?;
    writer.append(tlv_types::ENCRYPTED_DATA, &sub_tlv[..sub_len + aead::TAG_BYTES])?;

    // Paired. The configuration changed; advertising must reflect the paired state.
    release(server, session);
    session.setup = SetupSubState::default();
    server.num_auth_attempts = 0;
    server.pairing_state_changed = true;
    Ok(())
}
