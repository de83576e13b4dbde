//! The HAP-BLE procedure engine.
//!
//! A procedure is a sequence of HAP transactions on one characteristic. At most one
//! full-featured procedure exists per connection; it owns the transaction assembler, the 10 s
//! procedure deadline, and Timed Write state. When the full slot is busy on another
//! characteristic, writes elsewhere get a minimal *fallback* procedure that can only answer
//! with an error status (or the zero-IID service signature stub) — see [`gatt`].
//!
//! [`gatt`]: ../gatt/index.html

use crate::accessory::{
    AccessoryDelegate, Characteristic, CharacteristicProperties, CharacteristicRequest,
    Constraints, Format, Service, ServiceProperties, Unit,
};
use crate::ble::pdu::{self, body_types, Opcode, Status, Transaction};
use crate::bytes::ByteWriter;
use crate::pairing::{self, ProcedureType};
use crate::platform::{Clock, Platform};
use crate::server::AccessoryServer;
use crate::session::Session;
use crate::time::{elapsed, Deadline, Duration, Instant};
use crate::tlv::{schema, ExpectedTlv, TlvIndex, TlvReader, TlvWriter};
use crate::uuid::types;
use crate::Error;

/// Budget for one in-flight HAP procedure.
pub const PROCEDURE_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum Timed Write body retained until execution.
pub const MAX_TIMED_WRITE_BODY_BYTES: usize = 512;

/// Active multi-transaction procedure state.
pub(crate) enum MultiTransaction {
    /// No multi-transaction procedure in progress.
    None,
    /// A Timed Write waiting for its Execute Write.
    TimedWrite {
        /// When the Timed Write request arrived.
        start: Instant,
        /// Time-to-live granted by the controller.
        ttl: Duration,
        /// The retained write body (HAP-Param-Value and friends).
        body: heapless::Vec<u8, MAX_TIMED_WRITE_BODY_BYTES>,
    },
}

/// The connection's single full-featured procedure.
pub(crate) struct Procedure {
    /// GATT table index of the characteristic the procedure is attached to.
    pub attached: Option<usize>,
    pub transaction: Transaction,
    /// Armed from the first GATT write until the final response fragment is read.
    pub deadline: Deadline,
    pub multi: MultiTransaction,
    /// Whether the session was secured when the procedure started.
    pub started_secured: bool,
}

impl Procedure {
    pub(crate) fn new() -> Self {
        Procedure {
            attached: None,
            transaction: Transaction::new(),
            deadline: None,
            multi: MultiTransaction::None,
            started_secured: false,
        }
    }

    /// Attaches the procedure to a characteristic, discarding previous state.
    pub(crate) fn attach(&mut self, table_index: usize, secured: bool) {
        self.attached = Some(table_index);
        self.transaction = Transaction::new();
        self.deadline = None;
        self.multi = MultiTransaction::None;
        self.started_secured = secured;
    }

    /// Detaches the procedure.
    pub(crate) fn detach(&mut self) {
        self.attached = None;
        self.transaction = Transaction::new();
        self.deadline = None;
        self.multi = MultiTransaction::None;
    }

    /// Returns whether a transaction is currently in progress.
    ///
    /// When no transaction is in progress, the procedure may be re-attached to a different
    /// characteristic without losing data.
    pub(crate) fn is_in_progress(&self) -> bool {
        self.attached.is_some()
            && (!self.transaction.is_idle() || matches!(self.multi, MultiTransaction::TimedWrite { .. }))
    }

    /// Processes a (decrypted) GATT write fragment, arming the procedure deadline.
    ///
    /// A fragment that starts a new transaction latches the session's security state: the whole
    /// request/response pair runs under the state it started with, so the response finishing a
    /// Pair Verify still leaves in plaintext.
    pub(crate) fn handle_gatt_write(
        &mut self,
        now: Instant,
        fragment: &[u8],
        secured: bool,
    ) -> Result<(), Error> {
        if self.transaction.is_idle() {
            self.started_secured = secured;
        }
        self.transaction.handle_write(fragment)?;
        self.deadline = Some(now + PROCEDURE_TIMEOUT);
        Ok(())
    }

    /// Returns whether the procedure deadline has expired, clearing it if so.
    pub(crate) fn poll(&mut self, now: Instant) -> bool {
        if elapsed(self.deadline, now) {
            info!("HAP procedure timeout expired");
            self.deadline = None;
            return true;
        }
        false
    }
}

/// HAP characteristic property bits serialized in signature reads.
mod hap_properties {
    pub const READ: u16 = 0x0001;
    pub const WRITE: u16 = 0x0002;
    pub const ADDITIONAL_AUTHORIZATION: u16 = 0x0004;
    pub const TIMED_WRITE: u16 = 0x0008;
    pub const SECURE_READ: u16 = 0x0010;
    pub const SECURE_WRITE: u16 = 0x0020;
    pub const NOTIFY_CONNECTED: u16 = 0x0080;
    pub const NOTIFY_DISCONNECTED: u16 = 0x0100;
    pub const BROADCAST_NOTIFY: u16 = 0x0200;
}

fn hap_characteristic_properties(characteristic: &Characteristic<'_>) -> u16 {
    let p = characteristic.properties;
    let mut bits = 0;
    if p.contains(CharacteristicProperties::READABLE_WITHOUT_SECURITY) {
        bits |= hap_properties::READ;
    }
    if p.contains(CharacteristicProperties::WRITABLE_WITHOUT_SECURITY) {
        bits |= hap_properties::WRITE;
    }
    if p.contains(CharacteristicProperties::SUPPORTS_AUTHORIZATION_DATA) {
        bits |= hap_properties::ADDITIONAL_AUTHORIZATION;
    }
    if p.contains(CharacteristicProperties::REQUIRES_TIMED_WRITE) {
        bits |= hap_properties::TIMED_WRITE;
    }
    if p.contains(CharacteristicProperties::READABLE) {
        bits |= hap_properties::SECURE_READ;
    }
    if p.contains(CharacteristicProperties::WRITABLE) {
        bits |= hap_properties::SECURE_WRITE;
    }
    if p.contains(CharacteristicProperties::SUPPORTS_EVENT_NOTIFICATION) {
        bits |= hap_properties::NOTIFY_CONNECTED;
    }
    if p.contains(CharacteristicProperties::SUPPORTS_DISCONNECTED_NOTIFICATION) {
        bits |= hap_properties::NOTIFY_DISCONNECTED;
    }
    if p.contains(CharacteristicProperties::SUPPORTS_BROADCAST_NOTIFICATION) {
        bits |= hap_properties::BROADCAST_NOTIFY;
    }
    bits
}

/// GATT unit codes for the HAP units.
fn gatt_unit_code(unit: Unit) -> u16 {
    match unit {
        Unit::None => 0x2700,
        Unit::Celsius => 0x272f,
        Unit::ArcDegrees => 0x2763,
        Unit::Percentage => 0x27ad,
        Unit::Lux => 0x2731,
        Unit::Seconds => 0x2703,
    }
}

/// Serializes the GATT presentation format descriptor value.
fn presentation_format(characteristic: &Characteristic<'_>) -> [u8; 7] {
    let mut format = [0; 7];
    format[0] = characteristic.format.gatt_format_code();
    // Exponent 0.
    format[2..4].copy_from_slice(&gatt_unit_code(characteristic.unit).to_le_bytes());
    // Namespace: Bluetooth SIG.
    format[4] = 0x01;
    // Description 0.
    format
}

fn append_valid_range_and_step(
    writer: &mut TlvWriter<'_>,
    characteristic: &Characteristic<'_>,
) -> Result<(), Error> {
    fn width(format: Format) -> usize {
        match format {
            Format::UInt8 | Format::Bool => 1,
            Format::UInt16 => 2,
            Format::UInt32 | Format::Int | Format::Float => 4,
            Format::UInt64 => 8,
            _ => 0,
        }
    }

    match characteristic.constraints {
        Constraints::UInt { min, max, step } => {
            let n = width(characteristic.format);
            let mut range = [0; 16];
            range[..n].copy_from_slice(&min.to_le_bytes()[..n]);
            range[n..2 * n].copy_from_slice(&max.to_le_bytes()[..n]);
            writer.append(body_types::VALID_RANGE, &range[..2 * n])?;
            if step != 0 {
                writer.append(body_types::STEP_VALUE, &step.to_le_bytes()[..n])?;
            }
        }
        Constraints::Int { min, max, step } => {
            let mut range = [0; 8];
            range[..4].copy_from_slice(&min.to_le_bytes());
            range[4..].copy_from_slice(&max.to_le_bytes());
            writer.append(body_types::VALID_RANGE, &range)?;
            if step != 0 {
                writer.append(body_types::STEP_VALUE, &step.to_le_bytes())?;
            }
        }
        Constraints::Float { min, max, step } => {
            let mut range = [0; 8];
            range[..4].copy_from_slice(&min.to_le_bytes());
            range[4..].copy_from_slice(&max.to_le_bytes());
            writer.append(body_types::VALID_RANGE, &range)?;
            if step != 0.0 {
                writer.append(body_types::STEP_VALUE, &step.to_le_bytes())?;
            }
        }
        Constraints::None | Constraints::MaxLength(_) | Constraints::MaxDataLength(_) => {}
    }
    Ok(())
}

/// Processes a completed request against the attached characteristic, producing the response
/// status and body.
///
/// Fatal errors (wire violations that must tear the link down) are returned as `Err`; protocol
/// errors surface as a status byte with an empty body.
pub(crate) fn process_request<P: Platform>(
    server: &mut AccessoryServer<'_, P>,
    delegate: &mut dyn AccessoryDelegate,
    session: &mut Session,
    table_index: usize,
    opcode: Opcode,
    iid: u16,
    body: &mut [u8],
    response: &mut [u8],
) -> Result<(Status, usize), Error> {
    let now = server.clock.now();
    let (accessory_index, service_iid, characteristic_iid) = {
        let entry = server.ble_table_entry(table_index).ok_or(Error::InvalidState)?;
        (
            entry.accessory_index,
            entry.service_iid,
            entry.characteristic_iid.ok_or(Error::InvalidState)?,
        )
    };

    // Validate the addressed instance ID. A mismatch is answered with InvalidInstanceId; the
    // zero-IID service signature read gets a stub response instead.
    let expected_iid = if opcode.is_service_operation() {
        service_iid
    } else {
        characteristic_iid
    };
    if u64::from(iid) != expected_iid {
        if opcode == Opcode::ServiceSignatureRead && iid == 0 {
            let mut writer = TlvWriter::new(response);
            writer.append(body_types::SERVICE_PROPERTIES, &[0, 0])?;
            writer.append(body_types::LINKED_SERVICES, &[])?;
            let len = writer.len();
            return Ok((Status::Success, len));
        }
        info!("request for invalid IID {}", iid);
        return Ok((Status::InvalidInstanceId, 0));
    }

    if matches!(opcode, Opcode::Unknown(_)) {
        return Ok((Status::UnsupportedPdu, 0));
    }

    let is_admin = session.controller_is_admin();
    let accessory = server.accessory_at(accessory_index).ok_or(Error::InvalidState)?;
    let (service, characteristic) = accessory
        .characteristic_by_iid(characteristic_iid)
        .ok_or(Error::InvalidState)?;

    // Pairing characteristics run the pairing procedures instead of value accesses.
    if characteristic.uuid == types::CHARACTERISTIC_PAIR_SETUP
        || characteristic.uuid == types::CHARACTERISTIC_PAIR_VERIFY
        || characteristic.uuid == types::CHARACTERISTIC_PAIRING_PAIRINGS
    {
        match opcode {
            Opcode::CharacteristicWrite => {
                return process_pairing_write(
                    server,
                    session,
                    characteristic.uuid,
                    now,
                    body,
                    response,
                );
            }
            Opcode::CharacteristicSignatureRead => {
                // Signature reads fall through to the generic handler below.
            }
            _ => return Ok((Status::UnsupportedPdu, 0)),
        }
    }
    if characteristic.uuid == types::CHARACTERISTIC_PAIRING_FEATURES
        && opcode == Opcode::CharacteristicRead
    {
        let mut writer = TlvWriter::new(response);
        writer.append(body_types::VALUE, &[server.pairing_feature_flags()])?;
        let len = writer.len();
        return Ok((Status::Success, len));
    }

    // Everything except the pairing characteristics requires a secured, non-transient session.
    let open_access = characteristic
        .properties
        .intersects(
            CharacteristicProperties::READABLE_WITHOUT_SECURITY
                | CharacteristicProperties::WRITABLE_WITHOUT_SECURITY,
        );
    if !open_access {
        if !session.is_secured() {
            info!("rejecting request on insecure session");
            return Ok((Status::InsufficientAuthentication, 0));
        }
        if session.is_transient() {
            info!("rejecting request on transient session");
            return Ok((Status::InsufficientAuthentication, 0));
        }
    }

    match opcode {
        Opcode::CharacteristicSignatureRead => {
            let mut writer = TlvWriter::new(response);
            writer.append(
                body_types::CHARACTERISTIC_TYPE,
                &characteristic.uuid.to_wire_bytes(),
            )?;
            writer.append(
                body_types::SERVICE_INSTANCE_ID,
                &(service.iid as u16).to_le_bytes(),
            )?;
            writer.append(body_types::SERVICE_TYPE, &service.uuid.to_wire_bytes())?;
            writer.append(
                body_types::CHARACTERISTIC_PROPERTIES,
                &hap_characteristic_properties(characteristic).to_le_bytes(),
            )?;
            if let Some(description) = characteristic.user_description {
                writer.append(body_types::USER_DESCRIPTION, description.as_bytes())?;
            }
            writer.append(
                body_types::PRESENTATION_FORMAT,
                &presentation_format(characteristic),
            )?;
            append_valid_range_and_step(&mut writer, characteristic)?;
            let len = writer.len();
            Ok((Status::Success, len))
        }

        Opcode::ServiceSignatureRead => {
            let mut writer = TlvWriter::new(response);
            let mut properties = 0u16;
            if service.properties.contains(ServiceProperties::PRIMARY) {
                properties |= 0x0001;
            }
            if service.properties.contains(ServiceProperties::HIDDEN) {
                properties |= 0x0002;
            }
            if service
                .properties
                .contains(ServiceProperties::SUPPORTS_CONFIGURATION)
            {
                properties |= 0x0004;
            }
            writer.append(body_types::SERVICE_PROPERTIES, &properties.to_le_bytes())?;
            let mut linked = [0; 2 * 16];
            let mut linked_len = 0;
            for linked_iid in service.linked_services.iter().take(16) {
                linked[linked_len..linked_len + 2]
                    .copy_from_slice(&(*linked_iid as u16).to_le_bytes());
                linked_len += 2;
            }
            writer.append(body_types::LINKED_SERVICES, &linked[..linked_len])?;
            let len = writer.len();
            Ok((Status::Success, len))
        }

        Opcode::CharacteristicRead => process_characteristic_read(
            delegate,
            accessory,
            service,
            characteristic,
            is_admin,
            session.is_secured(),
            response,
        ),

        Opcode::CharacteristicWrite => {
            // A plain write aborts any pending Timed Write.
            server.ble.as_mut().ok_or(Error::InvalidState)?.procedure.multi =
                MultiTransaction::None;
            process_characteristic_write(
                delegate,
                accessory,
                service,
                characteristic,
                is_admin,
                session.is_secured(),
                body,
                response,
                false,
            )
        }

        Opcode::CharacteristicTimedWrite => {
            // Retain the body; the value is applied by the Execute Write.
            let mut index_body = [0u8; pdu::MAX_BODY_BYTES];
            index_body[..body.len()].copy_from_slice(body);
            let index = TlvIndex::new(TlvReader::new(&mut index_body[..body.len()]))?;
            let ttl = match index.find(body_types::TTL) {
                Some(value) => Duration::from_millis(schema::read_uint(value)? * 100),
                None => {
                    info!("Timed Write without TTL");
                    return Ok((Status::InvalidRequest, 0));
                }
            };
            if body.len() > MAX_TIMED_WRITE_BODY_BYTES {
                return Err(Error::OutOfResources);
            }
            let mut retained = heapless::Vec::new();
            retained.extend_from_slice(body).map_err(|_| Error::OutOfResources)?;

            let ble = server.ble.as_mut().ok_or(Error::InvalidState)?;
            ble.procedure.multi = MultiTransaction::TimedWrite {
                start: now,
                ttl,
                body: retained,
            };
            Ok((Status::Success, 0))
        }

        Opcode::CharacteristicExecuteWrite => {
            let multi = core::mem::replace(
                &mut server.ble.as_mut().ok_or(Error::InvalidState)?.procedure.multi,
                MultiTransaction::None,
            );
            match multi {
                MultiTransaction::TimedWrite { start, ttl, mut body } => {
                    if now.duration_since(start) > ttl {
                        info!("Execute Write after TTL expiry");
                        Ok((Status::InvalidRequest, 0))
                    } else {
                        process_characteristic_write(
                            delegate,
                            accessory,
                            service,
                            characteristic,
                            is_admin,
                            session.is_secured(),
                            &mut body,
                            response,
                            true,
                        )
                    }
                }
                MultiTransaction::None => {
                    info!("Execute Write without preceding Timed Write");
                    Ok((Status::InvalidRequest, 0))
                }
            }
        }

        Opcode::CharacteristicConfiguration => {
            // Broadcast notification configuration is not carried by this stack; acknowledge
            // with empty (all default) configuration.
            let mut writer = TlvWriter::new(response);
            writer.append(0x01, &[0, 0])?;
            let len = writer.len();
            Ok((Status::Success, len))
        }

        Opcode::ProtocolConfiguration => {
            if !is_admin {
                return Ok((Status::InsufficientAuthorization, 0));
            }
            let gsn = server.gsn()?;
            let cn = server.cn8()?;
            let mut writer = TlvWriter::new(response);
            // Current state number is 2 bytes on the wire, the config number 1 byte.
            writer.append(0x01, &[gsn, 0])?;
            writer.append(0x02, &[cn])?;
            let len = writer.len();
            Ok((Status::Success, len))
        }

        // Software authentication is not provisioned on this accessory.
        Opcode::Token | Opcode::TokenUpdate | Opcode::Info => Ok((Status::UnsupportedPdu, 0)),

        Opcode::Unknown(_) => Ok((Status::UnsupportedPdu, 0)),
    }
}

fn process_pairing_write<P: Platform>(
    server: &mut AccessoryServer<'_, P>,
    session: &mut Session,
    uuid: crate::uuid::HapUuid,
    now: Instant,
    body: &mut [u8],
    response: &mut [u8],
) -> Result<(Status, usize), Error> {
    // The pairing TLV rides in HAP-Param-Value; Return-Response must be requested since every
    // pairing write is answered with data.
    let mut expected = [
        ExpectedTlv::new(body_types::VALUE),
        ExpectedTlv::new(body_types::RETURN_RESPONSE),
    ];
    TlvReader::new(body).get_all(&mut expected)?;
    let [value_tlv, return_response_tlv] = expected;

    let value = match value_tlv.value {
        Some(value) => value,
        None => {
            info!("pairing write without HAP-Param-Value");
            return Ok((Status::InvalidRequest, 0));
        }
    };
    if !matches!(return_response_tlv.value.map(schema::read_u8), Some(Ok(1))) {
        info!("pairing write without HAP-Param-Return-Response");
        return Ok((Status::InvalidRequest, 0));
    }

    let procedure_type = if uuid == types::CHARACTERISTIC_PAIR_SETUP {
        ProcedureType::PairSetup
    } else if uuid == types::CHARACTERISTIC_PAIR_VERIFY {
        ProcedureType::PairVerify
    } else {
        ProcedureType::Pairings
    };
    session.ble.did_start_pairing_procedure(now, procedure_type);

    let mut pairing_tlv = [0u8; pdu::MAX_BODY_BYTES];
    pairing_tlv[..value.len()].copy_from_slice(value);

    let result = match procedure_type {
        ProcedureType::PairSetup => {
            pairing::setup::handle_write(server, session, &mut pairing_tlv[..value.len()])
        }
        ProcedureType::PairVerify => {
            pairing::verify::handle_write(server, session, &mut pairing_tlv[..value.len()])
        }
        ProcedureType::Pairings => {
            pairing::pairings::handle_write(server, session, &mut pairing_tlv[..value.len()])
        }
    };
    result?;

    // The response TLV is produced immediately and wrapped in HAP-Param-Value.
    let mut pairing_response = [0u8; pdu::MAX_BODY_BYTES];
    let response_len = {
        let mut pairing_writer = TlvWriter::new(&mut pairing_response);
        match procedure_type {
            ProcedureType::PairSetup => {
                pairing::setup::handle_read(server, session, &mut pairing_writer)?
            }
            ProcedureType::PairVerify => {
                pairing::verify::handle_read(server, session, &mut pairing_writer)?
            }
            ProcedureType::Pairings => {
                pairing::pairings::handle_read(server, session, &mut pairing_writer)?
            }
        }
        pairing_writer.len()
    };

    let completed = match procedure_type {
        ProcedureType::PairSetup => session.setup.state == 0,
        ProcedureType::PairVerify => session.verify.state == 0,
        ProcedureType::Pairings => session.pairings.state == 0,
    };
    if completed {
        let now = server.clock.now();
        let secured = session.is_secured();
        session
            .ble
            .did_complete_pairing_procedure(now, procedure_type, secured);
    }

    let mut writer = TlvWriter::new(response);
    writer.append(body_types::VALUE, &pairing_response[..response_len])?;
    let len = writer.len();
    Ok((Status::Success, len))
}

fn check_read_permissions(
    characteristic: &Characteristic<'_>,
    is_admin: bool,
    secured: bool,
) -> Option<Status> {
    let p = characteristic.properties;
    let open = p.contains(CharacteristicProperties::READABLE_WITHOUT_SECURITY);
    if !p.contains(CharacteristicProperties::READABLE) && !open {
        return Some(Status::UnsupportedPdu);
    }
    if !secured && !open {
        return Some(Status::InsufficientAuthentication);
    }
    if p.contains(CharacteristicProperties::READ_REQUIRES_ADMIN) && !is_admin {
        return Some(Status::InsufficientAuthorization);
    }
    None
}

fn check_write_permissions(
    characteristic: &Characteristic<'_>,
    is_admin: bool,
    secured: bool,
    timed: bool,
) -> Option<Status> {
    let p = characteristic.properties;
    let open = p.contains(CharacteristicProperties::WRITABLE_WITHOUT_SECURITY);
    if !p.contains(CharacteristicProperties::WRITABLE) && !open {
        return Some(Status::UnsupportedPdu);
    }
    if !secured && !open {
        return Some(Status::InsufficientAuthentication);
    }
    if p.contains(CharacteristicProperties::WRITE_REQUIRES_ADMIN) && !is_admin {
        return Some(Status::InsufficientAuthorization);
    }
    if p.contains(CharacteristicProperties::REQUIRES_TIMED_WRITE) && !timed {
        info!("characteristic requires the Timed Write procedure");
        return Some(Status::InvalidRequest);
    }
    None
}

fn process_characteristic_read(
    delegate: &mut dyn AccessoryDelegate,
    accessory: &crate::accessory::Accessory<'_>,
    service: &Service<'_>,
    characteristic: &Characteristic<'_>,
    is_admin: bool,
    secured: bool,
    response: &mut [u8],
) -> Result<(Status, usize), Error> {
    if let Some(status) = check_read_permissions(characteristic, is_admin, secured) {
        return Ok((status, 0));
    }

    let mut value = [0u8; pdu::MAX_BODY_BYTES - 8];
    let value_len = {
        let mut value_writer = ByteWriter::new(&mut value);
        let request = CharacteristicRequest {
            accessory,
            service,
            characteristic,
            is_admin,
        };
        match delegate.handle_read(&request, &mut value_writer) {
            Ok(()) => (pdu::MAX_BODY_BYTES - 8) - value_writer.space_left(),
            Err(Error::NotAuthorized) => return Ok((Status::InsufficientAuthorization, 0)),
            Err(Error::Busy) => return Ok((Status::MaxProcedures, 0)),
            Err(_) => return Ok((Status::UnsupportedPdu, 0)),
        }
    };

    let mut writer = TlvWriter::new(response);
    writer.append(body_types::VALUE, &value[..value_len])?;
    let len = writer.len();
    Ok((Status::Success, len))
}

fn process_characteristic_write(
    delegate: &mut dyn AccessoryDelegate,
    accessory: &crate::accessory::Accessory<'_>,
    service: &Service<'_>,
    characteristic: &Characteristic<'_>,
    is_admin: bool,
    secured: bool,
    body: &mut [u8],
    response: &mut [u8],
    timed: bool,
) -> Result<(Status, usize), Error> {
    if let Some(status) = check_write_permissions(characteristic, is_admin, secured, timed) {
        return Ok((status, 0));
    }

    let mut expected = [
        ExpectedTlv::new(body_types::VALUE),
        ExpectedTlv::new(body_types::ADDITIONAL_AUTHORIZATION_DATA),
        ExpectedTlv::new(body_types::RETURN_RESPONSE),
        ExpectedTlv::new(body_types::TTL),
        ExpectedTlv::new(body_types::ORIGIN),
    ];
    TlvReader::new(body).get_all(&mut expected)?;
    let [value_tlv, aad_tlv, return_response_tlv, _ttl_tlv, _origin_tlv] = expected;

    let value = match value_tlv.value {
        Some(value) => value,
        None => {
            info!("characteristic write without HAP-Param-Value");
            return Ok((Status::InvalidRequest, 0));
        }
    };
    if aad_tlv.value.is_some()
        && !characteristic
            .properties
            .contains(CharacteristicProperties::SUPPORTS_AUTHORIZATION_DATA)
    {
        info!("authorization data on characteristic that does not support it");
        return Ok((Status::InsufficientAuthorization, 0));
    }

    let request = CharacteristicRequest {
        accessory,
        service,
        characteristic,
        is_admin,
    };
    match delegate.handle_write(&request, value) {
        Ok(()) => {}
        Err(Error::NotAuthorized) => return Ok((Status::InsufficientAuthorization, 0)),
        Err(Error::InvalidData) => return Ok((Status::InvalidRequest, 0)),
        Err(_) => return Ok((Status::UnsupportedPdu, 0)),
    }

    // Write-with-response returns the (possibly coerced) value.
    if matches!(return_response_tlv.value.map(schema::read_u8), Some(Ok(1))) {
        return process_characteristic_read(
            delegate,
            accessory,
            service,
            characteristic,
            is_admin,
            secured,
            response,
        );
    }
    Ok((Status::Success, 0))
}
