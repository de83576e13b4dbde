//! The accessory server.
//!
//! One `AccessoryServer` owns the platform resources, the long-term identity, the pairing
//! database, the Pair Setup singleton, and the transport states. All entry points take the
//! server handle explicitly; there are no ambient singletons. The server is driven from the
//! platform's run loop: events are delivered through the `*_handle_*` methods, and deadlines
//! reported by [`next_deadline`] are serviced by calling [`poll`].
//!
//! State callbacks are deferred: state transitions latch a pending callback which the run loop
//! picks up with [`take_state_callback`] after the current entry point unwound, so the
//! application never re-enters the server from inside a transition.
//!
//! [`next_deadline`]: struct.AccessoryServer.html#method.next_deadline
//! [`poll`]: struct.AccessoryServer.html#method.poll
//! [`take_state_callback`]: struct.AccessoryServer.html#method.take_state_callback

use crate::accessory::{self, Accessory, AccessoryDelegate};
use crate::ble::gatt::{self, BleState, GattAttribute};
use crate::crypto::ed25519;
use crate::mfi::MfiHwAuth;
use crate::pairing::setup::{PairSetupResource, SavedSrp};
use crate::pairing;
use crate::platform::{
    config_keys, domains, AttributeHandle, BlePeripheral, ConnectionHandle, Key, KeyValueStore,
    Platform,
};
use crate::session::{Session, SessionId, TransportType};
use crate::setup::{self, DeviceIdString, SetupCode, SetupId};
use crate::time::{earliest, Deadline};
use crate::tlv::TlvWriter;
use crate::{crypto::srp, platform::Clock, Error};
use rand_core::RngCore;

/// Lifecycle state of the accessory server.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ServerState {
    /// Not started.
    Idle,
    /// Serving controllers.
    Running,
    /// Stop requested; transports are draining.
    Stopping,
}

/// Static configuration of an accessory server.
pub struct ServerOptions {
    /// Maximum number of paired controllers the accessory supports.
    pub max_pairings: u8,
    /// The accessory's 6-byte device ID.
    pub device_id: [u8; 6],
    /// Setup code to pair with; `None` generates a random one.
    pub setup_code: Option<SetupCode>,
    /// Setup ID for payload and setup hash derivation; `None` generates a random one.
    pub setup_id: Option<SetupId>,
    /// Whether the accessory is reachable over HAP over IP.
    pub supports_ip: bool,
}

/// Smallest supported pairing table size.
pub const MIN_MAX_PAIRINGS: u8 = 16;

pub(crate) struct SetupInfo {
    pub code: SetupCode,
    pub setup_id: SetupId,
    pub salt: [u8; srp::SALT_BYTES],
    pub verifier: [u8; srp::VERIFIER_BYTES],
}

/// The HAP accessory server.
pub struct AccessoryServer<'a, P: Platform> {
    pub(crate) store: P::Store,
    pub(crate) clock: P::Clock,
    pub(crate) rng: P::Rng,
    pub(crate) ble: Option<BleState<P::Ble>>,
    pub(crate) mfi: Option<MfiHwAuth<P::Mfi>>,

    state: ServerState,
    state_callback_pending: bool,

    pub(crate) max_pairings: u8,
    pub(crate) ltsk: [u8; ed25519::SECRET_KEY_BYTES],
    pub(crate) ltpk: [u8; ed25519::PUBLIC_KEY_BYTES],
    pub(crate) device_id: DeviceIdString,
    pub(crate) setup_info: SetupInfo,

    supports_ip: bool,
    pub(crate) pair_setup: Option<PairSetupResource>,
    pub(crate) saved_srp: Option<SavedSrp>,
    pub(crate) num_auth_attempts: u8,
    /// Set when the pairing set changed; advertising data must be refreshed.
    pub(crate) pairing_state_changed: bool,

    primary: Option<&'a Accessory<'a>>,
    bridged: &'a [&'a Accessory<'a>],
    next_session_id: u32,
}

impl<'a, P: Platform> AccessoryServer<'a, P> {
    /// Creates an accessory server in the `Idle` state.
    ///
    /// `ble` must be provided for HAP over BLE; `mfi` when an Apple Authentication Coprocessor
    /// is fitted.
    pub fn new(
        store: P::Store,
        clock: P::Clock,
        mut rng: P::Rng,
        ble: Option<P::Ble>,
        mfi: Option<P::Mfi>,
        options: ServerOptions,
    ) -> Self {
        assert!(
            options.max_pairings >= MIN_MAX_PAIRINGS,
            "max_pairings below supported minimum"
        );

        let code = options
            .setup_code
            .unwrap_or_else(|| setup::generate_setup_code(&mut rng));
        assert!(
            setup::is_valid_setup_code(&code.0),
            "invalid setup code configured"
        );
        let setup_id = options
            .setup_id
            .unwrap_or_else(|| setup::generate_setup_id(&mut rng));
        assert!(
            setup::is_valid_setup_id(&setup_id.0),
            "invalid setup ID configured"
        );

        // The SRP verifier for the setup code is derived once with a fresh salt.
        let mut salt = [0; srp::SALT_BYTES];
        rng.fill_bytes(&mut salt);
        let verifier = srp::verifier(&salt, b"Pair-Setup", &code.0);

        AccessoryServer {
            store,
            clock,
            rng,
            ble: ble.map(BleState::new),
            mfi: mfi.map(MfiHwAuth::new),
            state: ServerState::Idle,
            state_callback_pending: false,
            max_pairings: options.max_pairings,
            ltsk: [0; ed25519::SECRET_KEY_BYTES],
            ltpk: [0; ed25519::PUBLIC_KEY_BYTES],
            device_id: DeviceIdString::from_bytes(&options.device_id),
            setup_info: SetupInfo {
                code,
                setup_id,
                salt,
                verifier,
            },
            supports_ip: options.supports_ip,
            pair_setup: None,
            saved_srp: None,
            num_auth_attempts: 0,
            pairing_state_changed: false,
            primary: None,
            bridged: &[],
            next_session_id: 1,
        }
    }

    /// Returns the lifecycle state.
    pub fn state(&self) -> ServerState {
        self.state
    }

    /// Takes the deferred state callback, if one is pending.
    ///
    /// The platform run loop calls this after every entry point and reports the returned state
    /// to the application.
    pub fn take_state_callback(&mut self) -> Option<ServerState> {
        if self.state_callback_pending {
            self.state_callback_pending = false;
            Some(self.state)
        } else {
            None
        }
    }

    fn schedule_state_callback(&mut self) {
        self.state_callback_pending = true;
    }

    /// Starts the server for a regular accessory.
    ///
    /// Returns `Error::InvalidState` (leaving the server `Idle`) when the persisted firmware
    /// version is newer than the accessory's, since a downgrade would corrupt migrated state.
    pub fn start(&mut self, accessory: &'a Accessory<'a>) -> Result<(), Error> {
        self.start_bridge(accessory, &[])
    }

    /// Starts the server for a bridge with bridged accessories.
    pub fn start_bridge(
        &mut self,
        primary: &'a Accessory<'a>,
        bridged: &'a [&'a Accessory<'a>],
    ) -> Result<(), Error> {
        assert!(self.state == ServerState::Idle, "server already started");
        assert!(self.primary.is_none());

        debug!("checking accessory definition");
        accessory::validate_tree(primary, bridged, self.ble.is_some())?;

        info!("accessory server starting");
        self.state = ServerState::Running;
        self.schedule_state_callback();

        // Firmware version check: a downgrade must not start the server.
        if !self.check_firmware_version(primary.firmware_version)? {
            self.state = ServerState::Idle;
            self.schedule_state_callback();
            return Err(Error::InvalidState);
        }

        // Register accessories.
        self.primary = Some(primary);
        self.bridged = bridged;

        // Load the long-term identity.
        debug!("loading accessory identity");
        self.load_ltsk()?;

        // If the admin pairing disappeared, the whole pairing state goes with it.
        self.cleanup_pairings().map_err(|e| {
            error!("cleanup pairings failed");
            e
        })?;

        // Ensure a configuration number exists before it is advertised anywhere.
        self.cn32()?;

        if self.ble.is_some() {
            gatt::publish_table(self)?;
        }

        Ok(())
    }

    /// Parses `major.minor.revision` with decimal `u32` components.
    fn parse_version(version: &str) -> Result<(u32, u32, u32), Error> {
        let mut parts = version.split('.');
        let mut component = || -> Result<u32, Error> {
            let part = parts.next().ok_or(Error::InvalidData)?;
            if part.is_empty() || part.len() > 10 || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(Error::InvalidData);
            }
            part.parse::<u32>().map_err(|_| Error::InvalidData)
        };
        let major = component()?;
        let minor = component()?;
        let revision = component()?;
        if parts.next().is_some() {
            return Err(Error::InvalidData);
        }
        Ok((major, minor, revision))
    }

    /// Compares the firmware version against the persisted triple.
    ///
    /// Returns `false` for a downgrade. An upgrade runs the post-update fixups and persists the
    /// new triple.
    fn check_firmware_version(&mut self, version: &str) -> Result<bool, Error> {
        let (major, minor, revision) = match Self::parse_version(version) {
            Ok(parsed) => parsed,
            Err(_) => panic!("malformed firmware version string"),
        };
        info!("firmware version: {}.{}.{}", major, minor, revision);

        let mut bytes = [0; 12];
        let stored = self
            .store
            .get(domains::CONFIGURATION, config_keys::FIRMWARE_VERSION, &mut bytes)?;

        let save = match stored {
            Some(len) => {
                if len != bytes.len() {
                    panic!("key-value store corrupted: unexpected firmware version length");
                }
                let previous = (
                    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
                    u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
                    u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
                );
                let current = (major, minor, revision);
                if current == previous {
                    false
                } else if current < previous {
                    error!(
                        "firmware must not be downgraded; not starting accessory server"
                    );
                    return Ok(false);
                } else {
                    info!("performing post firmware update tasks");
                    self.handle_firmware_update()?;
                    true
                }
            }
            None => {
                info!("storing initial firmware version");
                true
            }
        };

        if save {
            let mut bytes = [0; 12];
            bytes[0..4].copy_from_slice(&major.to_le_bytes());
            bytes[4..8].copy_from_slice(&minor.to_le_bytes());
            bytes[8..12].copy_from_slice(&revision.to_le_bytes());
            self.store
                .set(domains::CONFIGURATION, config_keys::FIRMWARE_VERSION, &bytes)?;
        }
        Ok(true)
    }

    /// Post-firmware-update fixups.
    ///
    /// Derived state that may not match the new firmware is dropped; controllers re-read it via
    /// the bumped configuration number.
    fn handle_firmware_update(&mut self) -> Result<(), Error> {
        self.store.remove(
            domains::CONFIGURATION,
            config_keys::BLE_BROADCAST_PARAMETERS,
        )?;
        self.increment_cn()
    }

    /// Loads the LTSK from the store, creating it on first start.
    fn load_ltsk(&mut self) -> Result<(), Error> {
        let mut ltsk = [0; ed25519::SECRET_KEY_BYTES];
        match self
            .store
            .get(domains::CONFIGURATION, config_keys::LTSK, &mut ltsk)?
        {
            Some(len) => {
                if len != ltsk.len() {
                    panic!("corrupted LTSK in key-value store");
                }
            }
            None => {
                // A lost identity invalidates all pairings referring to it.
                pairing::purge_pairings(&mut self.store)?;

                self.rng.fill_bytes(&mut ltsk);
                info!("generated new LTSK");
                self.store
                    .set(domains::CONFIGURATION, config_keys::LTSK, &ltsk)?;
            }
        }
        self.ltsk = ltsk;
        self.ltpk = ed25519::public_key(&self.ltsk);
        Ok(())
    }

    /// Requests a stop. The transition to `Idle` completes once the transports drained.
    pub fn stop(&mut self) {
        match self.state {
            ServerState::Idle => {}
            ServerState::Stopping => {}
            ServerState::Running => {
                info!("accessory server stopping");
                self.state = ServerState::Stopping;
                self.schedule_state_callback();
                self.try_complete_stop();
            }
        }
    }

    /// Completes the stop when no BLE connection remains.
    fn try_complete_stop(&mut self) {
        if self.state != ServerState::Stopping {
            return;
        }
        let ble_busy = self.ble.as_ref().map_or(false, |ble| ble.connection.is_some());
        if ble_busy {
            return;
        }
        if let Some(ble) = self.ble.as_mut() {
            ble.peripheral.remove_all_services().ok();
            ble.table.clear();
        }
        self.primary = None;
        self.bridged = &[];
        self.pair_setup = None;
        self.state = ServerState::Idle;
        self.schedule_state_callback();
        info!("accessory server stopped");
    }

    /// Enforces the admin invariant: a non-empty pairing set must contain an admin.
    ///
    /// When the last admin is gone, all pairings, the Pair Resume cache and the BLE broadcast
    /// parameters are purged.
    pub fn cleanup_pairings(&mut self) -> Result<(), Error> {
        debug!("checking if admin pairing exists");
        if pairing::has_admin_pairing(&mut self.store)? {
            return Ok(());
        }

        if pairing::has_pairings(&mut self.store)? {
            info!("no admin pairing found; removing all pairings");
            self.schedule_state_callback();
            pairing::purge_pairings(&mut self.store)?;
            self.pairing_state_changed = true;
        }

        if let Some(ble) = self.ble.as_mut() {
            ble.session_cache.clear();
        }

        self.store.remove(
            domains::CONFIGURATION,
            config_keys::BLE_BROADCAST_PARAMETERS,
        )?;
        Ok(())
    }

    /// Returns whether at least one admin controller is paired.
    pub fn is_paired(&mut self) -> Result<bool, Error> {
        pairing::has_admin_pairing(&mut self.store)
    }

    /// Reads the stored 32-bit configuration number, initializing it to 1.
    pub fn cn32(&mut self) -> Result<u32, Error> {
        let mut bytes = [0; 4];
        match self.store.get(
            domains::CONFIGURATION,
            config_keys::CONFIGURATION_NUMBER,
            &mut bytes,
        )? {
            Some(len) => {
                if len != bytes.len() {
                    info!("invalid configuration number length ({})", len);
                    return Err(Error::Unknown);
                }
            }
            None => {
                bytes = 1u32.to_le_bytes();
                self.store.set(
                    domains::CONFIGURATION,
                    config_keys::CONFIGURATION_NUMBER,
                    &bytes,
                )?;
            }
        }
        Ok(u32::from_le_bytes(bytes))
    }

    /// The configuration number as published over IP (`1..=65535`, wrapping to 1).
    pub fn cn16(&mut self) -> Result<u16, Error> {
        Ok(((self.cn32()? - 1) % 65535 + 1) as u16)
    }

    /// The Global State Number as published over BLE (`1..=255`, wrapping to 1).
    pub fn gsn(&mut self) -> Result<u8, Error> {
        Ok(((self.cn32()? - 1) % 255 + 1) as u8)
    }

    /// The configuration number downcast for BLE protocol configuration (`1..=255`).
    pub fn cn8(&mut self) -> Result<u8, Error> {
        self.gsn()
    }

    /// Increments the configuration number, wrapping `u32::MAX` to 1.
    ///
    /// The new value is persisted before it is reported anywhere.
    pub fn increment_cn(&mut self) -> Result<(), Error> {
        let cn = self.cn32()?;
        let next = if cn == u32::MAX { 1 } else { cn + 1 };
        self.store.set(
            domains::CONFIGURATION,
            config_keys::CONFIGURATION_NUMBER,
            &next.to_le_bytes(),
        )?;
        info!("updated CN: {}", next);
        Ok(())
    }

    /// The pairing feature flags byte: bit 0 = Apple Authentication Coprocessor, bit 1 =
    /// software authentication.
    pub fn pairing_feature_flags(&self) -> u8 {
        let mut flags = 0;
        if self.mfi.is_some() {
            flags |= 0x01;
        }
        flags
    }

    /// The accessory's device ID string.
    pub fn device_id(&self) -> &DeviceIdString {
        &self.device_id
    }

    /// The accessory's long-term public key.
    pub fn ltpk(&self) -> &[u8; ed25519::PUBLIC_KEY_BYTES] {
        &self.ltpk
    }

    /// Derives the current setup payload.
    pub fn setup_payload(&mut self) -> Result<setup::SetupPayload, Error> {
        let category = self.primary.map(|a| a.category).unwrap_or(1);
        let paired = self.is_paired()?;
        let flags = setup::SetupPayloadFlags {
            ble_supported: self.ble.is_some(),
            ip_supported: self.supports_ip,
            is_paired: paired,
        };
        if paired {
            setup::setup_payload(None, None, flags, category)
        } else {
            setup::setup_payload(
                Some(&self.setup_info.code),
                Some(&self.setup_info.setup_id),
                flags,
                category,
            )
        }
    }

    /// Derives the setup hash advertised next to the payload.
    pub fn setup_hash(&self) -> setup::SetupHash {
        setup::setup_hash(&self.setup_info.setup_id, &self.device_id)
    }

    /// Creates a session bound to `transport`.
    pub fn create_session(&mut self, transport: TransportType) -> Session {
        let id = SessionId(self.next_session_id);
        self.next_session_id = self.next_session_id.wrapping_add(1);
        Session::new(id, transport)
    }

    /// Invalidates a session, dropping its security context and pairing procedure progress.
    ///
    /// On BLE, `terminate_link` additionally marks the session terminal and schedules the link
    /// teardown.
    pub fn invalidate_session(&mut self, session: &mut Session, terminate_link: bool) {
        match session.transport_type() {
            TransportType::Ble => gatt::invalidate_session(self, session, terminate_link),
            TransportType::Ip => {
                pairing::setup::release(self, session);
                session.clear_security();
            }
        }
    }

    // Pairing endpoints, shared by the IP router glue and the BLE procedure engine.

    /// Processes a Pair Setup request message.
    pub fn pair_setup_write(
        &mut self,
        session: &mut Session,
        body: &mut [u8],
    ) -> Result<(), Error> {
        pairing::setup::handle_write(self, session, body)
    }

    /// Produces the next Pair Setup response message.
    pub fn pair_setup_read(
        &mut self,
        session: &mut Session,
        writer: &mut TlvWriter<'_>,
    ) -> Result<(), Error> {
        pairing::setup::handle_read(self, session, writer)
    }

    /// Processes a Pair Verify (or Pair Resume) request message.
    pub fn pair_verify_write(
        &mut self,
        session: &mut Session,
        body: &mut [u8],
    ) -> Result<(), Error> {
        pairing::verify::handle_write(self, session, body)
    }

    /// Produces the next Pair Verify response message.
    pub fn pair_verify_read(
        &mut self,
        session: &mut Session,
        writer: &mut TlvWriter<'_>,
    ) -> Result<(), Error> {
        pairing::verify::handle_read(self, session, writer)
    }

    /// Processes an Add/Remove/List Pairings request message.
    pub fn pairings_write(&mut self, session: &mut Session, body: &mut [u8]) -> Result<(), Error> {
        pairing::pairings::handle_write(self, session, body)
    }

    /// Produces the next Add/Remove/List Pairings response message.
    pub fn pairings_read(
        &mut self,
        session: &mut Session,
        writer: &mut TlvWriter<'_>,
    ) -> Result<(), Error> {
        pairing::pairings::handle_read(self, session, writer)
    }

    // BLE GATT entry points, called by the platform's peripheral delegate glue.

    /// Reports a central having connected.
    pub fn ble_handle_connect(&mut self, session: &mut Session, connection: ConnectionHandle) {
        gatt::handle_connect(self, session, connection);
    }

    /// Reports the central having disconnected.
    pub fn ble_handle_disconnect(&mut self, session: &mut Session) {
        gatt::handle_disconnect(self, session);
        self.try_complete_stop();
    }

    /// Processes a GATT write request. `bytes` is decrypted in place when the session is
    /// secured.
    pub fn ble_handle_gatt_write(
        &mut self,
        delegate: &mut dyn AccessoryDelegate,
        session: &mut Session,
        handle: AttributeHandle,
        bytes: &mut [u8],
    ) -> Result<(), Error> {
        gatt::handle_gatt_write(self, delegate, session, handle, bytes)
    }

    /// Processes a GATT read request, writing the response into `out` and returning its length.
    pub fn ble_handle_gatt_read(
        &mut self,
        delegate: &mut dyn AccessoryDelegate,
        session: &mut Session,
        handle: AttributeHandle,
        out: &mut [u8],
    ) -> Result<usize, Error> {
        gatt::handle_gatt_read(self, delegate, session, handle, out)
    }

    /// Reports the peripheral being ready to send further indications.
    pub fn ble_handle_ready_to_indicate(
        &mut self,
        delegate: &mut dyn AccessoryDelegate,
        session: &mut Session,
    ) {
        gatt::send_pending_events(self, delegate, session);
    }

    /// Raises an event on a characteristic for the connected BLE central.
    pub fn raise_event(
        &mut self,
        delegate: &mut dyn AccessoryDelegate,
        session: &mut Session,
        aid: u64,
        iid: u64,
    ) {
        match session.transport_type() {
            TransportType::Ble => gatt::raise_event(self, delegate, session, aid, iid),
            // Over IP, events are routed by the HTTP engine.
            TransportType::Ip => {}
        }
    }

    /// Services all elapsed deadlines. Call whenever [`next_deadline`] has passed.
    ///
    /// [`next_deadline`]: #method.next_deadline
    pub fn poll(&mut self, delegate: &mut dyn AccessoryDelegate, session: &mut Session) {
        let now = self.clock.now();
        if session.transport_type() == TransportType::Ble {
            gatt::poll(self, session);
            gatt::send_pending_events(self, delegate, session);
        }
        if let Some(mfi) = self.mfi.as_mut() {
            mfi.poll(now);
        }
        self.try_complete_stop();
    }

    /// Returns the earliest pending deadline across all timers.
    pub fn next_deadline(&self, session: &Session) -> Deadline {
        let mut deadline = None;
        if session.transport_type() == TransportType::Ble {
            deadline = gatt::next_deadline(self, session);
        }
        if let Some(mfi) = self.mfi.as_ref() {
            deadline = earliest(deadline, mfi.next_deadline());
        }
        deadline
    }

    // Internal accessors shared with the transport modules.

    pub(crate) fn num_accessories(&self) -> usize {
        match self.primary {
            Some(_) => 1 + self.bridged.len(),
            None => 0,
        }
    }

    pub(crate) fn accessory_at(&self, index: usize) -> Option<&'a Accessory<'a>> {
        if index == 0 {
            self.primary
        } else {
            self.bridged.get(index - 1).copied()
        }
    }

    pub(crate) fn ble_table_entry(&self, index: usize) -> Option<&GattAttribute> {
        self.ble.as_ref().and_then(|ble| ble.table.get(index))
    }

    /// Looks up the pairing record a session verified against.
    pub fn session_pairing(&mut self, session: &Session) -> Result<Option<pairing::Pairing>, Error> {
        match session.pairing_key {
            Some(key) => pairing::read_pairing(&mut self.store, key),
            None => Ok(None),
        }
    }

    /// Removes a pairing by store key, running the admin-cleanup invariant.
    ///
    /// Used when tearing down state for controllers that disappeared out of band.
    pub fn remove_pairing_by_key(&mut self, key: Key) -> Result<(), Error> {
        pairing::remove_pairing(&mut self.store, key)?;
        self.pairing_state_changed = true;
        if let Some(ble) = self.ble.as_mut() {
            ble.session_cache.invalidate_pairing(key);
        }
        self.cleanup_pairings()
    }

    /// Invalidates all Pair Resume state, e.g. when pairing data changed out of band.
    pub fn purge_resume_cache(&mut self) {
        if let Some(ble) = self.ble.as_mut() {
            ble.session_cache.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accessory::{
        Characteristic, CharacteristicProperties, CharacteristicRequest, Constraints, Format,
        Service, ServiceProperties, Unit,
    };
    use crate::bytes::ByteWriter;
    use crate::crypto::{aead, hash, srp, x25519};
    use crate::pairing::tlv_types;
    use crate::platform::test_support::{FakeClock, MemoryStore, SeqRng};
    use crate::platform::{
        BlePeripheral, GattProperties, NoBlePeripheral, NoMfiCoprocessor,
    };
    use crate::tlv::{ExpectedTlv, TlvReader};
    use crate::uuid::{types, HapUuid};
    use ed25519_dalek::Signer;
    use std::cell::Cell;
    use std::rc::Rc;
    use std::vec::Vec;

    struct IpPlatform;

    impl Platform for IpPlatform {
        type Store = MemoryStore;
        type Clock = FakeClock;
        type Rng = SeqRng;
        type Ble = NoBlePeripheral;
        type Mfi = NoMfiCoprocessor;
    }

    struct BlePlatform;

    impl Platform for BlePlatform {
        type Store = MemoryStore;
        type Clock = FakeClock;
        type Rng = SeqRng;
        type Ble = FakePeripheral;
        type Mfi = NoMfiCoprocessor;
    }

    /// GATT server fake handing out sequential attribute handles.
    struct FakePeripheral {
        next_handle: AttributeHandle,
        published: bool,
        cancelled: Rc<Cell<u32>>,
    }

    impl FakePeripheral {
        fn new(cancelled: Rc<Cell<u32>>) -> Self {
            FakePeripheral {
                next_handle: 0,
                published: false,
                cancelled,
            }
        }

        fn allocate(&mut self) -> AttributeHandle {
            self.next_handle += 1;
            self.next_handle
        }
    }

    impl BlePeripheral for FakePeripheral {
        fn add_service(&mut self, _uuid: &HapUuid, _primary: bool) -> Result<(), Error> {
            self.allocate();
            Ok(())
        }

        fn add_characteristic(
            &mut self,
            _uuid: &HapUuid,
            properties: GattProperties,
            _initial_value: &[u8],
        ) -> Result<(AttributeHandle, Option<AttributeHandle>), Error> {
            let value = self.allocate();
            let cccd = if properties.contains(GattProperties::INDICATE) {
                Some(self.allocate())
            } else {
                None
            };
            Ok((value, cccd))
        }

        fn add_descriptor(
            &mut self,
            _uuid: &HapUuid,
            _properties: GattProperties,
            _initial_value: &[u8],
        ) -> Result<AttributeHandle, Error> {
            Ok(self.allocate())
        }

        fn publish_services(&mut self) -> Result<(), Error> {
            self.published = true;
            Ok(())
        }

        fn remove_all_services(&mut self) -> Result<(), Error> {
            self.published = false;
            Ok(())
        }

        fn send_indication(
            &mut self,
            _connection: ConnectionHandle,
            _handle: AttributeHandle,
            _payload: &[u8],
        ) -> Result<(), Error> {
            Ok(())
        }

        fn cancel_connection(&mut self, _connection: ConnectionHandle) -> Result<(), Error> {
            self.cancelled.set(self.cancelled.get() + 1);
            Ok(())
        }
    }

    /// Application serving a single boolean "On" characteristic.
    struct TestDelegate {
        on: bool,
    }

    impl AccessoryDelegate for TestDelegate {
        fn handle_read(
            &mut self,
            request: &CharacteristicRequest<'_, '_>,
            value: &mut ByteWriter<'_>,
        ) -> Result<(), Error> {
            assert_eq!(request.characteristic.iid, 0x11);
            value.write_u8(self.on as u8)
        }

        fn handle_write(
            &mut self,
            request: &CharacteristicRequest<'_, '_>,
            value: &[u8],
        ) -> Result<(), Error> {
            assert_eq!(request.characteristic.iid, 0x11);
            self.on = value == [1];
            Ok(())
        }
    }

    const PAIRING_CHARS: [Characteristic<'static>; 4] = [
        Characteristic {
            iid: 0x02,
            uuid: types::CHARACTERISTIC_PAIR_SETUP,
            format: Format::Tlv8,
            properties: CharacteristicProperties::from_bits_truncate(
                CharacteristicProperties::READABLE_WITHOUT_SECURITY.bits()
                    | CharacteristicProperties::WRITABLE_WITHOUT_SECURITY.bits(),
            ),
            unit: Unit::None,
            constraints: Constraints::None,
            user_description: None,
        },
        Characteristic {
            iid: 0x03,
            uuid: types::CHARACTERISTIC_PAIR_VERIFY,
            format: Format::Tlv8,
            properties: CharacteristicProperties::from_bits_truncate(
                CharacteristicProperties::READABLE_WITHOUT_SECURITY.bits()
                    | CharacteristicProperties::WRITABLE_WITHOUT_SECURITY.bits(),
            ),
            unit: Unit::None,
            constraints: Constraints::None,
            user_description: None,
        },
        Characteristic {
            iid: 0x04,
            uuid: types::CHARACTERISTIC_PAIRING_FEATURES,
            format: Format::UInt8,
            properties: CharacteristicProperties::from_bits_truncate(
                CharacteristicProperties::READABLE_WITHOUT_SECURITY.bits(),
            ),
            unit: Unit::None,
            constraints: Constraints::None,
            user_description: None,
        },
        Characteristic {
            iid: 0x05,
            uuid: types::CHARACTERISTIC_PAIRING_PAIRINGS,
            format: Format::Tlv8,
            properties: CharacteristicProperties::from_bits_truncate(
                CharacteristicProperties::READABLE.bits()
                    | CharacteristicProperties::WRITABLE.bits(),
            ),
            unit: Unit::None,
            constraints: Constraints::None,
            user_description: None,
        },
    ];

    const LIGHT_CHARS: [Characteristic<'static>; 1] = [Characteristic {
        iid: 0x11,
        uuid: HapUuid::short(0x25),
        format: Format::Bool,
        properties: CharacteristicProperties::from_bits_truncate(
            CharacteristicProperties::READABLE.bits()
                | CharacteristicProperties::WRITABLE.bits()
                | CharacteristicProperties::SUPPORTS_EVENT_NOTIFICATION.bits(),
        ),
        unit: Unit::None,
        constraints: Constraints::None,
        user_description: None,
    }];

    const SERVICES: [Service<'static>; 2] = [
        Service {
            iid: 0x01,
            uuid: types::SERVICE_PAIRING,
            properties: ServiceProperties::from_bits_truncate(0),
            linked_services: &[],
            characteristics: &PAIRING_CHARS,
        },
        Service {
            iid: 0x10,
            uuid: HapUuid::short(0x43),
            properties: ServiceProperties::from_bits_truncate(ServiceProperties::PRIMARY.bits()),
            linked_services: &[],
            characteristics: &LIGHT_CHARS,
        },
    ];

    const ACCESSORY: Accessory<'static> = Accessory {
        aid: 1,
        category: 5,
        name: "Test Outlet",
        manufacturer: "Hearth",
        model: "H1",
        serial_number: "0000001",
        firmware_version: "1.0.0",
        services: &SERVICES,
    };

    const SETUP_CODE: SetupCode = SetupCode(*b"111-22-333");

    fn options() -> ServerOptions {
        ServerOptions {
            max_pairings: MIN_MAX_PAIRINGS,
            device_id: [0x1a, 0x2b, 0x3c, 0x4d, 0x5e, 0x6f],
            setup_code: Some(SETUP_CODE),
            setup_id: Some(SetupId(*b"ABCD")),
            supports_ip: true,
        }
    }

    fn ip_server(store: MemoryStore) -> AccessoryServer<'static, IpPlatform> {
        AccessoryServer::<IpPlatform>::new(
            store,
            FakeClock::new(),
            SeqRng(42),
            None,
            None,
            options(),
        )
    }

    fn get(expected: &[ExpectedTlv<'_>], ty: u8) -> Vec<u8> {
        expected
            .iter()
            .find(|slot| slot.ty == ty)
            .and_then(|slot| slot.value)
            .expect("missing TLV")
            .to_vec()
    }

    fn parse_response(response: &mut [u8], tys: &[u8]) -> Vec<Vec<u8>> {
        let mut expected: Vec<ExpectedTlv<'_>> = tys.iter().map(|&t| ExpectedTlv::new(t)).collect();
        TlvReader::new(response).get_all(&mut expected).unwrap();
        tys.iter().map(|&t| get(&expected, t)).collect()
    }

    /// Controller state for a full Pair Setup exchange.
    struct Controller {
        identifier: &'static [u8],
        signing_key: ed25519_dalek::SigningKey,
        srp_key: [u8; srp::SESSION_KEY_BYTES],
        eph_sk: [u8; 32],
        eph_pk: [u8; 32],
        shared: [u8; 32],
        verify_key: [u8; 32],
    }

    impl Controller {
        fn new() -> Self {
            Controller {
                identifier: b"12345678-9ABC-DEF0-1234-56789ABCDEF0",
                signing_key: ed25519_dalek::SigningKey::from_bytes(&[0x51; 32]),
                srp_key: [0; srp::SESSION_KEY_BYTES],
                eph_sk: [0x77; 32],
                eph_pk: [0; 32],
                shared: [0; 32],
                verify_key: [0; 32],
            }
        }
    }

    /// Runs M1..M6 of Pair Setup against `server` from the controller side.
    fn run_pair_setup(
        server: &mut AccessoryServer<'_, IpPlatform>,
        session: &mut Session,
        controller: &mut Controller,
    ) {
        // M1
        let mut m1 = [0u8; 16];
        let len = {
            let mut writer = TlvWriter::new(&mut m1);
            writer.append(tlv_types::STATE, &[1]).unwrap();
            writer.append(tlv_types::METHOD, &[0]).unwrap();
            writer.len()
        };
        server.pair_setup_write(session, &mut m1[..len]).unwrap();

        // M2
        let mut m2 = [0u8; 600];
        let m2_len = {
            let mut writer = TlvWriter::new(&mut m2);
            server.pair_setup_read(session, &mut writer).unwrap();
            writer.len()
        };
        let fields = parse_response(
            &mut m2[..m2_len],
            &[tlv_types::STATE, tlv_types::PUBLIC_KEY, tlv_types::SALT],
        );
        assert_eq!(fields[0], [2]);
        let mut pub_b = [0u8; srp::PUBLIC_KEY_BYTES];
        pub_b.copy_from_slice(&fields[1]);
        let mut salt = [0u8; srp::SALT_BYTES];
        salt.copy_from_slice(&fields[2]);

        // Client SRP.
        let a = [0x42u8; 32];
        let pub_a = srp::client::public_key(&a);
        let u = srp::scrambling_parameter(&pub_a, &pub_b);
        let x = srp::client::private_key(&salt, b"Pair-Setup", &SETUP_CODE.0);
        let premaster = srp::client::premaster_secret(&a, &pub_b, &u, &x);
        controller.srp_key = srp::session_key(&premaster);
        let proof = srp::proof_m1(b"Pair-Setup", &salt, &pub_a, &pub_b, &controller.srp_key);

        // M3
        let mut m3 = [0u8; 600];
        let len = {
            let mut writer = TlvWriter::new(&mut m3);
            writer.append(tlv_types::STATE, &[3]).unwrap();
            writer.append(tlv_types::PUBLIC_KEY, &pub_a).unwrap();
            writer.append(tlv_types::PROOF, &proof).unwrap();
            writer.len()
        };
        server.pair_setup_write(session, &mut m3[..len]).unwrap();

        // M4
        let mut m4 = [0u8; 128];
        let m4_len = {
            let mut writer = TlvWriter::new(&mut m4);
            server.pair_setup_read(session, &mut writer).unwrap();
            writer.len()
        };
        let fields = parse_response(&mut m4[..m4_len], &[tlv_types::STATE, tlv_types::PROOF]);
        assert_eq!(fields[0], [4]);
        let expected_m2 = srp::proof_m2(&pub_a, &proof, &controller.srp_key);
        assert_eq!(fields[1], expected_m2);

        // M5
        let mut setup_key = [0u8; 32];
        hash::hkdf_sha512(
            &controller.srp_key,
            b"Pair-Setup-Encrypt-Salt",
            b"Pair-Setup-Encrypt-Info",
            &mut setup_key,
        );
        let mut device_x = [0u8; 32];
        hash::hkdf_sha512(
            &controller.srp_key,
            b"Pair-Setup-Controller-Sign-Salt",
            b"Pair-Setup-Controller-Sign-Info",
            &mut device_x,
        );
        let ltpk = controller.signing_key.verifying_key().to_bytes();
        let mut info = Vec::new();
        info.extend_from_slice(&device_x);
        info.extend_from_slice(controller.identifier);
        info.extend_from_slice(&ltpk);
        let signature = controller.signing_key.sign(&info).to_bytes();

        let mut sub_tlv = [0u8; 256];
        let sub_len = {
            let mut writer = TlvWriter::new(&mut sub_tlv);
            writer.append(tlv_types::IDENTIFIER, controller.identifier).unwrap();
            writer.append(tlv_types::PUBLIC_KEY, &ltpk).unwrap();
            writer.append(tlv_types::SIGNATURE, &signature).unwrap();
            writer.len()
        };
        let tag = aead::encrypt(&setup_key, b"PS-Msg05", &[], &mut sub_tlv[..sub_len]);
        let mut encrypted = Vec::new();
        encrypted.extend_from_slice(&sub_tlv[..sub_len]);
        encrypted.extend_from_slice(&tag);

        let mut m5 = [0u8; 512];
        let len = {
            let mut writer = TlvWriter::new(&mut m5);
            writer.append(tlv_types::STATE, &[5]).unwrap();
            writer.append(tlv_types::ENCRYPTED_DATA, &encrypted).unwrap();
            writer.len()
        };
        server.pair_setup_write(session, &mut m5[..len]).unwrap();

        // M6
        let mut m6 = [0u8; 512];
        let m6_len = {
            let mut writer = TlvWriter::new(&mut m6);
            server.pair_setup_read(session, &mut writer).unwrap();
            writer.len()
        };
        let fields = parse_response(
            &mut m6[..m6_len],
            &[tlv_types::STATE, tlv_types::ENCRYPTED_DATA],
        );
        assert_eq!(fields[0], [6]);

        // Verify the accessory's identity proof.
        let mut encrypted = fields[1].clone();
        let data_len = encrypted.len() - aead::TAG_BYTES;
        let mut tag = [0u8; aead::TAG_BYTES];
        tag.copy_from_slice(&encrypted[data_len..]);
        aead::decrypt(&setup_key, b"PS-Msg06", &[], &mut encrypted[..data_len], &tag).unwrap();
        let fields = parse_response(
            &mut encrypted[..data_len],
            &[tlv_types::IDENTIFIER, tlv_types::PUBLIC_KEY, tlv_types::SIGNATURE],
        );
        assert_eq!(fields[0], server.device_id().as_bytes());
        assert_eq!(fields[1], server.ltpk());
    }

    /// Runs M1..M4 of Pair Verify against `server` from the controller side.
    fn run_pair_verify(
        server: &mut AccessoryServer<'_, IpPlatform>,
        session: &mut Session,
        controller: &mut Controller,
    ) {
        controller.eph_pk = x25519::scalarmult_base(&controller.eph_sk);

        // M1
        let mut m1 = [0u8; 64];
        let len = {
            let mut writer = TlvWriter::new(&mut m1);
            writer.append(tlv_types::STATE, &[1]).unwrap();
            writer.append(tlv_types::PUBLIC_KEY, &controller.eph_pk).unwrap();
            writer.len()
        };
        server.pair_verify_write(session, &mut m1[..len]).unwrap();

        // M2
        let mut m2 = [0u8; 256];
        let m2_len = {
            let mut writer = TlvWriter::new(&mut m2);
            server.pair_verify_read(session, &mut writer).unwrap();
            writer.len()
        };
        let fields = parse_response(
            &mut m2[..m2_len],
            &[tlv_types::STATE, tlv_types::PUBLIC_KEY, tlv_types::ENCRYPTED_DATA],
        );
        assert_eq!(fields[0], [2]);
        let mut accessory_pk = [0u8; 32];
        accessory_pk.copy_from_slice(&fields[1]);
        controller.shared = x25519::scalarmult(&controller.eph_sk, &accessory_pk);
        hash::hkdf_sha512(
            &controller.shared,
            b"Pair-Verify-Encrypt-Salt",
            b"Pair-Verify-Encrypt-Info",
            &mut controller.verify_key,
        );

        let mut encrypted = fields[2].clone();
        let data_len = encrypted.len() - aead::TAG_BYTES;
        let mut tag = [0u8; aead::TAG_BYTES];
        tag.copy_from_slice(&encrypted[data_len..]);
        aead::decrypt(
            &controller.verify_key,
            b"PV-Msg02",
            &[],
            &mut encrypted[..data_len],
            &tag,
        )
        .unwrap();
        let fields = parse_response(
            &mut encrypted[..data_len],
            &[tlv_types::IDENTIFIER, tlv_types::SIGNATURE],
        );
        assert_eq!(fields[0], server.device_id().as_bytes());

        // The accessory signed AccessoryCurvePK || AccessoryPairingID || iOSDeviceCurvePK.
        let mut info = Vec::new();
        info.extend_from_slice(&accessory_pk);
        info.extend_from_slice(server.device_id().as_bytes());
        info.extend_from_slice(&controller.eph_pk);
        let mut signature = [0u8; 64];
        signature.copy_from_slice(&fields[1]);
        assert!(crate::crypto::ed25519::verify(&signature, &info, server.ltpk()));

        // M3
        let mut info = Vec::new();
        info.extend_from_slice(&controller.eph_pk);
        info.extend_from_slice(controller.identifier);
        info.extend_from_slice(&accessory_pk);
        let signature = controller.signing_key.sign(&info).to_bytes();

        let mut sub_tlv = [0u8; 256];
        let sub_len = {
            let mut writer = TlvWriter::new(&mut sub_tlv);
            writer.append(tlv_types::IDENTIFIER, controller.identifier).unwrap();
            writer.append(tlv_types::SIGNATURE, &signature).unwrap();
            writer.len()
        };
        let tag = aead::encrypt(
            &controller.verify_key,
            b"PV-Msg03",
            &[],
            &mut sub_tlv[..sub_len],
        );
        let mut encrypted = Vec::new();
        encrypted.extend_from_slice(&sub_tlv[..sub_len]);
        encrypted.extend_from_slice(&tag);

        let mut m3 = [0u8; 256];
        let len = {
            let mut writer = TlvWriter::new(&mut m3);
            writer.append(tlv_types::STATE, &[3]).unwrap();
            writer.append(tlv_types::ENCRYPTED_DATA, &encrypted).unwrap();
            writer.len()
        };
        server.pair_verify_write(session, &mut m3[..len]).unwrap();

        // M4
        let mut m4 = [0u8; 64];
        let m4_len = {
            let mut writer = TlvWriter::new(&mut m4);
            server.pair_verify_read(session, &mut writer).unwrap();
            writer.len()
        };
        let fields = parse_response(&mut m4[..m4_len], &[tlv_types::STATE]);
        assert_eq!(fields[0], [4]);
        assert!(session.is_secured());
    }

    #[test]
    fn cold_start_creates_identity() {
        let mut server = ip_server(MemoryStore::new());
        server.start(&ACCESSORY).unwrap();
        assert_eq!(server.state(), ServerState::Running);
        assert_eq!(server.take_state_callback(), Some(ServerState::Running));

        // LTSK persisted, LTPK derived from it.
        let mut ltsk = [0u8; 32];
        let len = server
            .store
            .get(domains::CONFIGURATION, config_keys::LTSK, &mut ltsk)
            .unwrap()
            .expect("LTSK missing");
        assert_eq!(len, 32);
        assert_ne!(ltsk, [0u8; 32]);
        assert_eq!(server.ltpk(), &ed25519::public_key(&ltsk));

        // No pairings yet.
        assert!(!server.is_paired().unwrap());
        assert_eq!(server.store.count(domains::PAIRINGS), 0);
    }

    #[test]
    fn start_purges_pairings_without_admin() {
        let mut store = MemoryStore::new();
        let p1 = pairing::Pairing::new(b"A", [1; 32], 0).unwrap();
        let p2 = pairing::Pairing::new(b"B", [2; 32], 0).unwrap();
        pairing::add_pairing(&mut store, 16, &p1).unwrap().unwrap();
        pairing::add_pairing(&mut store, 16, &p2).unwrap().unwrap();
        store
            .set(
                domains::CONFIGURATION,
                config_keys::BLE_BROADCAST_PARAMETERS,
                &[0xaa; 40],
            )
            .unwrap();

        let mut server = ip_server(store);
        server.start(&ACCESSORY).unwrap();

        assert_eq!(server.store.count(domains::PAIRINGS), 0);
        let mut buf = [0u8; 64];
        assert_eq!(
            server
                .store
                .get(
                    domains::CONFIGURATION,
                    config_keys::BLE_BROADCAST_PARAMETERS,
                    &mut buf
                )
                .unwrap(),
            None
        );
    }

    #[test]
    fn firmware_downgrade_is_rejected() {
        let mut store = MemoryStore::new();
        let mut bytes = [0u8; 12];
        bytes[0..4].copy_from_slice(&2u32.to_le_bytes());
        bytes[4..8].copy_from_slice(&0u32.to_le_bytes());
        bytes[8..12].copy_from_slice(&0u32.to_le_bytes());
        store
            .set(domains::CONFIGURATION, config_keys::FIRMWARE_VERSION, &bytes)
            .unwrap();

        let mut server = ip_server(store);
        assert_eq!(server.start(&ACCESSORY), Err(Error::InvalidState));
        assert_eq!(server.state(), ServerState::Idle);
    }

    #[test]
    fn pair_setup_creates_admin_pairing() {
        let mut server = ip_server(MemoryStore::new());
        server.start(&ACCESSORY).unwrap();
        let mut session = server.create_session(TransportType::Ip);
        let mut controller = Controller::new();

        run_pair_setup(&mut server, &mut session, &mut controller);

        assert!(server.is_paired().unwrap());
        let (_, stored) = pairing::find_pairing(&mut server.store, controller.identifier)
            .unwrap()
            .expect("pairing missing");
        assert_eq!(stored.permissions, 1);
        assert_eq!(
            stored.public_key,
            controller.signing_key.verifying_key().to_bytes()
        );
    }

    #[test]
    fn pair_verify_secures_session_and_lists_pairings() {
        let mut server = ip_server(MemoryStore::new());
        server.start(&ACCESSORY).unwrap();
        let mut controller = Controller::new();

        let mut setup_session = server.create_session(TransportType::Ip);
        run_pair_setup(&mut server, &mut setup_session, &mut controller);

        let mut session = server.create_session(TransportType::Ip);
        run_pair_verify(&mut server, &mut session, &mut controller);
        assert!(session.controller_is_admin());

        // List Pairings over the secured session.
        let mut m1 = [0u8; 16];
        let len = {
            let mut writer = TlvWriter::new(&mut m1);
            writer.append(tlv_types::STATE, &[1]).unwrap();
            writer.append(tlv_types::METHOD, &[5]).unwrap();
            writer.len()
        };
        server.pairings_write(&mut session, &mut m1[..len]).unwrap();

        let mut m2 = [0u8; 256];
        let m2_len = {
            let mut writer = TlvWriter::new(&mut m2);
            server.pairings_read(&mut session, &mut writer).unwrap();
            writer.len()
        };
        let fields = parse_response(
            &mut m2[..m2_len],
            &[
                tlv_types::STATE,
                tlv_types::IDENTIFIER,
                tlv_types::PUBLIC_KEY,
                tlv_types::PERMISSIONS,
            ],
        );
        assert_eq!(fields[0], [2]);
        assert_eq!(fields[1], controller.identifier);
        assert_eq!(fields[3], [1]);
    }

    #[test]
    fn pairings_rejected_without_admin_session() {
        let mut server = ip_server(MemoryStore::new());
        server.start(&ACCESSORY).unwrap();
        let mut session = server.create_session(TransportType::Ip);

        let mut m1 = [0u8; 16];
        let len = {
            let mut writer = TlvWriter::new(&mut m1);
            writer.append(tlv_types::STATE, &[1]).unwrap();
            writer.append(tlv_types::METHOD, &[5]).unwrap();
            writer.len()
        };
        server.pairings_write(&mut session, &mut m1[..len]).unwrap();

        let mut m2 = [0u8; 64];
        let m2_len = {
            let mut writer = TlvWriter::new(&mut m2);
            server.pairings_read(&mut session, &mut writer).unwrap();
            writer.len()
        };
        let fields = parse_response(&mut m2[..m2_len], &[tlv_types::STATE, tlv_types::ERROR]);
        assert_eq!(fields[0], [2]);
        assert_eq!(fields[1], [2]); // Authentication
    }

    #[test]
    fn wrong_setup_code_counts_towards_max_tries() {
        let mut server = ip_server(MemoryStore::new());
        server.start(&ACCESSORY).unwrap();

        for attempt in 0..3 {
            let mut session = server.create_session(TransportType::Ip);

            let mut m1 = [0u8; 16];
            let len = {
                let mut writer = TlvWriter::new(&mut m1);
                writer.append(tlv_types::STATE, &[1]).unwrap();
                writer.append(tlv_types::METHOD, &[0]).unwrap();
                writer.len()
            };
            server.pair_setup_write(&mut session, &mut m1[..len]).unwrap();

            let mut m2 = [0u8; 600];
            let m2_len = {
                let mut writer = TlvWriter::new(&mut m2);
                server.pair_setup_read(&mut session, &mut writer).unwrap();
                writer.len()
            };
            let fields = parse_response(
                &mut m2[..m2_len],
                &[tlv_types::STATE, tlv_types::PUBLIC_KEY, tlv_types::SALT],
            );
            let mut pub_b = [0u8; srp::PUBLIC_KEY_BYTES];
            pub_b.copy_from_slice(&fields[1]);
            let mut salt = [0u8; srp::SALT_BYTES];
            salt.copy_from_slice(&fields[2]);

            // Proof computed over the wrong setup code.
            let a = [0x42u8; 32];
            let pub_a = srp::client::public_key(&a);
            let x = srp::client::private_key(&salt, b"Pair-Setup", b"999-88-777");
            let u = srp::scrambling_parameter(&pub_a, &pub_b);
            let premaster = srp::client::premaster_secret(&a, &pub_b, &u, &x);
            let key = srp::session_key(&premaster);
            let proof = srp::proof_m1(b"Pair-Setup", &salt, &pub_a, &pub_b, &key);

            let mut m3 = [0u8; 600];
            let len = {
                let mut writer = TlvWriter::new(&mut m3);
                writer.append(tlv_types::STATE, &[3]).unwrap();
                writer.append(tlv_types::PUBLIC_KEY, &pub_a).unwrap();
                writer.append(tlv_types::PROOF, &proof).unwrap();
                writer.len()
            };
            server.pair_setup_write(&mut session, &mut m3[..len]).unwrap();

            let mut m4 = [0u8; 128];
            let m4_len = {
                let mut writer = TlvWriter::new(&mut m4);
                server.pair_setup_read(&mut session, &mut writer).unwrap();
                writer.len()
            };
            let fields = parse_response(&mut m4[..m4_len], &[tlv_types::STATE, tlv_types::ERROR]);
            assert_eq!(fields[1], [2], "attempt {}", attempt); // Authentication
        }

        // The fourth attempt is refused outright.
        let mut session = server.create_session(TransportType::Ip);
        let mut m1 = [0u8; 16];
        let len = {
            let mut writer = TlvWriter::new(&mut m1);
            writer.append(tlv_types::STATE, &[1]).unwrap();
            writer.append(tlv_types::METHOD, &[0]).unwrap();
            writer.len()
        };
        server.pair_setup_write(&mut session, &mut m1[..len]).unwrap();
        let mut m2 = [0u8; 64];
        let m2_len = {
            let mut writer = TlvWriter::new(&mut m2);
            server.pair_setup_read(&mut session, &mut writer).unwrap();
            writer.len()
        };
        let fields = parse_response(&mut m2[..m2_len], &[tlv_types::STATE, tlv_types::ERROR]);
        assert_eq!(fields[1], [5]); // MaxTries
    }

    #[test]
    fn concurrent_pair_setup_is_busy() {
        let mut server = ip_server(MemoryStore::new());
        server.start(&ACCESSORY).unwrap();

        let mut first = server.create_session(TransportType::Ip);
        let mut m1 = [0u8; 16];
        let len = {
            let mut writer = TlvWriter::new(&mut m1);
            writer.append(tlv_types::STATE, &[1]).unwrap();
            writer.append(tlv_types::METHOD, &[0]).unwrap();
            writer.len()
        };
        server.pair_setup_write(&mut first, &mut m1[..len]).unwrap();

        let mut second = server.create_session(TransportType::Ip);
        let mut m1b = [0u8; 16];
        let len = {
            let mut writer = TlvWriter::new(&mut m1b);
            writer.append(tlv_types::STATE, &[1]).unwrap();
            writer.append(tlv_types::METHOD, &[0]).unwrap();
            writer.len()
        };
        server.pair_setup_write(&mut second, &mut m1b[..len]).unwrap();

        let mut m2 = [0u8; 64];
        let m2_len = {
            let mut writer = TlvWriter::new(&mut m2);
            server.pair_setup_read(&mut second, &mut writer).unwrap();
            writer.len()
        };
        let fields = parse_response(&mut m2[..m2_len], &[tlv_types::STATE, tlv_types::ERROR]);
        assert_eq!(fields[1], [7]); // Busy
    }

    #[test]
    fn cn_increments_and_wraps() {
        let mut server = ip_server(MemoryStore::new());
        assert_eq!(server.cn32().unwrap(), 1);
        server.increment_cn().unwrap();
        assert_eq!(server.cn32().unwrap(), 2);
        assert_eq!(server.cn16().unwrap(), 2);
        assert_eq!(server.gsn().unwrap(), 2);

        server
            .store
            .set(
                domains::CONFIGURATION,
                config_keys::CONFIGURATION_NUMBER,
                &u32::MAX.to_le_bytes(),
            )
            .unwrap();
        server.increment_cn().unwrap();
        assert_eq!(server.cn32().unwrap(), 1);

        // Downcasts wrap within their own ranges.
        server
            .store
            .set(
                domains::CONFIGURATION,
                config_keys::CONFIGURATION_NUMBER,
                &65536u32.to_le_bytes(),
            )
            .unwrap();
        assert_eq!(server.cn16().unwrap(), 1);
        assert_eq!(server.gsn().unwrap(), ((65536u32 - 1) % 255 + 1) as u8);
    }

    #[test]
    fn setup_payload_matches_reference_shape() {
        let mut server = ip_server(MemoryStore::new());
        server.start(&ACCESSORY).unwrap();
        let payload = server.setup_payload().unwrap();
        let s = core::str::from_utf8(&payload.0).unwrap();
        assert!(s.starts_with("X-HM://"));
        assert!(s.ends_with("ABCD"));
        assert_eq!(s.len(), 20);
    }

    fn ble_server(
        cancelled: Rc<Cell<u32>>,
    ) -> AccessoryServer<'static, BlePlatform> {
        let mut server = AccessoryServer::<BlePlatform>::new(
            MemoryStore::new(),
            FakeClock::new(),
            SeqRng(7),
            Some(FakePeripheral::new(cancelled)),
            None,
            ServerOptions {
                supports_ip: false,
                ..options()
            },
        );
        server.start(&ACCESSORY).unwrap();
        server
    }

    fn value_handle_of(server: &AccessoryServer<'static, BlePlatform>, iid: u64) -> AttributeHandle {
        server
            .ble
            .as_ref()
            .unwrap()
            .table
            .iter()
            .find(|entry| entry.characteristic_iid == Some(iid))
            .and_then(|entry| entry.value_handle)
            .unwrap()
    }

    #[test]
    fn ble_unsolicited_read_terminates_link() {
        let cancelled = Rc::new(Cell::new(0));
        let mut server = ble_server(cancelled.clone());
        let mut delegate = TestDelegate { on: false };
        let mut session = server.create_session(TransportType::Ble);
        server.ble_handle_connect(&mut session, 0x0040);

        let handle = value_handle_of(&server, 0x11);
        let mut out = [0u8; 64];
        let result = server.ble_handle_gatt_read(&mut delegate, &mut session, handle, &mut out);
        assert_eq!(result, Err(Error::InvalidState));
        assert!(session.ble.is_terminal());
        assert_eq!(cancelled.get(), 1);
    }

    #[test]
    fn ble_signature_read_round_trip() {
        let cancelled = Rc::new(Cell::new(0));
        let mut server = ble_server(cancelled.clone());
        let mut delegate = TestDelegate { on: false };
        let mut session = server.create_session(TransportType::Ble);
        server.ble_handle_connect(&mut session, 0x0040);

        // Signature read on the Pair Setup characteristic works without security.
        let handle = value_handle_of(&server, 0x02);
        let mut request = [0x00, 0x01, 0x3a, 0x02, 0x00];
        server
            .ble_handle_gatt_write(&mut delegate, &mut session, handle, &mut request)
            .unwrap();

        let mut out = [0u8; 128];
        let len = server
            .ble_handle_gatt_read(&mut delegate, &mut session, handle, &mut out)
            .unwrap();
        assert!(len > 5);
        assert_eq!(out[0], 0x02); // response control field
        assert_eq!(out[1], 0x3a); // TID
        assert_eq!(out[2], 0x00); // success

        let body_len = u16::from_le_bytes([out[3], out[4]]) as usize;
        let body = &mut out[5..5 + body_len];
        let fields = parse_response(
            body,
            &[
                crate::ble::pdu::body_types::CHARACTERISTIC_TYPE,
                crate::ble::pdu::body_types::SERVICE_INSTANCE_ID,
                crate::ble::pdu::body_types::SERVICE_TYPE,
                crate::ble::pdu::body_types::CHARACTERISTIC_PROPERTIES,
            ],
        );
        assert_eq!(fields[0], types::CHARACTERISTIC_PAIR_SETUP.to_wire_bytes());
        assert_eq!(fields[1], 0x0001u16.to_le_bytes());
    }

    #[test]
    fn ble_link_timeout_marks_session_terminal() {
        let cancelled = Rc::new(Cell::new(0));
        let mut server = ble_server(cancelled.clone());
        let mut delegate = TestDelegate { on: false };
        let mut session = server.create_session(TransportType::Ble);
        server.ble_handle_connect(&mut session, 0x0040);

        server.clock.advance(10_001);
        server.poll(&mut delegate, &mut session);
        assert!(session.ble.is_terminal());
        assert_eq!(cancelled.get(), 1);
    }

    #[test]
    fn ble_cccd_write_validates_value() {
        let cancelled = Rc::new(Cell::new(0));
        let mut server = ble_server(cancelled);
        let mut delegate = TestDelegate { on: false };
        let mut session = server.create_session(TransportType::Ble);
        server.ble_handle_connect(&mut session, 0x0040);

        let cccd = server
            .ble
            .as_ref()
            .unwrap()
            .table
            .iter()
            .find(|entry| entry.characteristic_iid == Some(0x11))
            .and_then(|entry| entry.cccd_handle)
            .unwrap();

        let mut enable = [0x02, 0x00];
        server
            .ble_handle_gatt_write(&mut delegate, &mut session, cccd, &mut enable)
            .unwrap();
        assert!(server
            .ble
            .as_ref()
            .unwrap()
            .table
            .iter()
            .any(|entry| entry.central_subscribed));

        let mut invalid = [0x01, 0x00];
        assert_eq!(
            server.ble_handle_gatt_write(&mut delegate, &mut session, cccd, &mut invalid),
            Err(Error::InvalidData)
        );
    }
}
