//! The published GATT table and the BLE GATT event entry points.
//!
//! Every HAP service maps to a GATT service containing a Service Instance ID characteristic;
//! every HAP characteristic maps to a GATT characteristic with a Characteristic Instance ID
//! descriptor and, when it supports events, a Client Characteristic Configuration descriptor.
//! The table rows carry the per-connection state: CCCD subscription, a latched pending event,
//! and the characteristic's fallback procedure slot.
//!
//! The platform delivers GATT events by calling the `handle_*` functions through the
//! corresponding `AccessoryServer::ble_handle_*` wrappers. Errors returned from them mean the
//! request was refused at the ATT level; where the protocol demands it, the session has already
//! been invalidated and the link teardown scheduled.

use crate::accessory::CharacteristicRequest;
use crate::ble::pdu;
use crate::ble::procedure::{self, Procedure};
use crate::pairing::resume::SessionCache;
use crate::platform::{
    AttributeHandle, BlePeripheral, Clock, ConnectionHandle, GattProperties, Platform,
};
use crate::server::{AccessoryServer, ServerState};
use crate::session::Session;
use crate::time::{elapsed, Deadline, Duration, Instant};
use crate::uuid::{types, HapUuid};
use crate::{accessory::AccessoryDelegate, Error};

/// Maximum number of GATT table rows (services plus characteristics).
pub const MAX_GATT_ATTRIBUTES: usize = 64;

/// Lifetime of a fallback procedure.
pub const FALLBACK_PROCEDURE_TIMEOUT: Duration = Duration::from_secs(10);

/// The Service Instance ID characteristic type.
pub const SERVICE_INSTANCE_ID_UUID: HapUuid =
    HapUuid::parse_static("e604e95d-a759-4817-87d3-aa005083a0d1");

/// The Characteristic Instance ID descriptor type.
pub const CHARACTERISTIC_INSTANCE_ID_UUID: HapUuid =
    HapUuid::parse_static("dc46f0fe-81d2-4616-b5d9-6abdd796939a");

/// Terminal states of a fallback procedure.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum FallbackStatus {
    /// Another procedure is in progress.
    MaxProcedures,
    /// The request addressed a foreign instance ID.
    InvalidInstanceId,
    /// Zero-IID service signature read; answered with a stub signature.
    ZeroIidServiceSignatureRead,
}

/// Minimal per-characteristic procedure used while the full slot is busy.
pub(crate) struct FallbackProcedure {
    pub deadline: Deadline,
    pub remaining_body_bytes: u16,
    pub tid: u8,
    pub status: FallbackStatus,
}

/// One row of the GATT table: a service instance or a characteristic.
pub(crate) struct GattAttribute {
    pub accessory_index: usize,
    pub service_iid: u64,
    /// `None` for the service-level row.
    pub characteristic_iid: Option<u64>,
    pub value_handle: Option<AttributeHandle>,
    pub cccd_handle: Option<AttributeHandle>,
    pub iid_handle: AttributeHandle,
    pub central_subscribed: bool,
    pub pending_event: bool,
    pub fallback: Option<FallbackProcedure>,
}

/// State of the BLE transport within the accessory server.
pub(crate) struct BleState<B: BlePeripheral> {
    pub peripheral: B,
    pub table: heapless::Vec<GattAttribute, MAX_GATT_ATTRIBUTES>,
    pub session_cache: SessionCache,
    pub connection: Option<ConnectionHandle>,
    pub procedure: Procedure,
}

impl<B: BlePeripheral> BleState<B> {
    pub(crate) fn new(peripheral: B) -> Self {
        BleState {
            peripheral,
            table: heapless::Vec::new(),
            session_cache: SessionCache::default(),
            connection: None,
            procedure: Procedure::new(),
        }
    }
}

/// Builds and publishes the GATT table for the registered accessories.
pub(crate) fn publish_table<P: Platform>(server: &mut AccessoryServer<'_, P>) -> Result<(), Error> {
    let num_accessories = server.num_accessories();
    let mut has_pairing_service = false;

    for accessory_index in 0..num_accessories {
        let accessory = server.accessory_at(accessory_index).ok_or(Error::InvalidState)?;
        let services = accessory.services;
        for service in services {
            has_pairing_service |= service.uuid == types::SERVICE_PAIRING;

            let ble = server.ble.as_mut().ok_or(Error::InvalidState)?;
            ble.peripheral.add_service(&service.uuid, true)?;

            let iid_bytes = (service.iid as u16).to_le_bytes();
            let (iid_handle, _) = ble.peripheral.add_characteristic(
                &SERVICE_INSTANCE_ID_UUID,
                GattProperties::READ,
                &iid_bytes,
            )?;
            ble.table
                .push(GattAttribute {
                    accessory_index,
                    service_iid: service.iid,
                    characteristic_iid: None,
                    value_handle: None,
                    cccd_handle: None,
                    iid_handle,
                    central_subscribed: false,
                    pending_event: false,
                    fallback: None,
                })
                .map_err(|_| Error::OutOfResources)?;

            for characteristic in service.characteristics {
                let mut properties = GattProperties::READ | GattProperties::WRITE;
                if characteristic
                    .properties
                    .contains(crate::accessory::CharacteristicProperties::SUPPORTS_EVENT_NOTIFICATION)
                {
                    properties |= GattProperties::INDICATE;
                }

                let (value_handle, cccd_handle) =
                    ble.peripheral
                        .add_characteristic(&characteristic.uuid, properties, &[])?;
                let iid_bytes = (characteristic.iid as u16).to_le_bytes();
                let iid_handle = ble.peripheral.add_descriptor(
                    &CHARACTERISTIC_INSTANCE_ID_UUID,
                    GattProperties::READ,
                    &iid_bytes,
                )?;
                ble.table
                    .push(GattAttribute {
                        accessory_index,
                        service_iid: service.iid,
                        characteristic_iid: Some(characteristic.iid),
                        value_handle: Some(value_handle),
                        cccd_handle,
                        iid_handle,
                        central_subscribed: false,
                        pending_event: false,
                        fallback: None,
                    })
                    .map_err(|_| Error::OutOfResources)?;
            }
        }
    }

    if !has_pairing_service {
        error!("BLE attribute database must contain the Pairing service");
        return Err(Error::InvalidData);
    }

    server.ble.as_mut().ok_or(Error::InvalidState)?.peripheral.publish_services()
}

fn find_attribute<P: Platform>(
    server: &AccessoryServer<'_, P>,
    handle: AttributeHandle,
) -> Option<usize> {
    let ble = server.ble.as_ref()?;
    ble.table.iter().position(|attribute| {
        attribute.value_handle == Some(handle)
            || attribute.cccd_handle == Some(handle)
            || attribute.iid_handle == handle
    })
}

/// Resets all per-connection state in the GATT table.
fn reset_connection_state<P: Platform>(server: &mut AccessoryServer<'_, P>) {
    if let Some(ble) = server.ble.as_mut() {
        for attribute in ble.table.iter_mut() {
            attribute.central_subscribed = false;
            attribute.pending_event = false;
            attribute.fallback = None;
        }
        ble.procedure.detach();
    }
}

/// Aborts all fallback procedures, e.g. when a new secure session starts getting established.
pub(crate) fn abort_all_fallbacks<P: Platform>(server: &mut AccessoryServer<'_, P>) {
    if let Some(ble) = server.ble.as_mut() {
        for attribute in ble.table.iter_mut() {
            if attribute.fallback.is_some() {
                debug!("aborting fallback procedure");
                attribute.fallback = None;
            }
        }
    }
}

/// Handles a central connecting to the accessory.
pub(crate) fn handle_connect<P: Platform>(
    server: &mut AccessoryServer<'_, P>,
    session: &mut Session,
    connection: ConnectionHandle,
) {
    let now = server.clock.now();
    reset_connection_state(server);
    if let Some(ble) = server.ble.as_mut() {
        ble.connection = Some(connection);
    }
    session.ble.connected(now);
}

/// Handles the central disconnecting.
pub(crate) fn handle_disconnect<P: Platform>(
    server: &mut AccessoryServer<'_, P>,
    session: &mut Session,
) {
    reset_connection_state(server);
    if let Some(ble) = server.ble.as_mut() {
        ble.connection = None;
    }
    session.clear_security();
    session.ble.invalidate(false);
}

/// Invalidates a BLE session and, when requested, schedules the link teardown.
pub(crate) fn invalidate_session<P: Platform>(
    server: &mut AccessoryServer<'_, P>,
    session: &mut Session,
    terminate_link: bool,
) {
    crate::pairing::setup::release(server, session);
    session.clear_security();
    session.ble.invalidate(terminate_link);

    if terminate_link && session.ble.is_safe_to_disconnect() {
        if let Some(ble) = server.ble.as_mut() {
            if let Some(connection) = ble.connection {
                info!("disconnecting connection - security session marked terminal");
                ble.peripheral.cancel_connection(connection).ok();
            }
        }
    }
}

enum AttachedProcedure {
    Full { is_new: bool },
    Fallback { is_new: bool },
}

/// Applies the procedure attachment rules for a GATT write to `table_index`.
fn attach_procedure<P: Platform>(
    server: &mut AccessoryServer<'_, P>,
    session: &mut Session,
    table_index: usize,
    now: Instant,
) -> Result<AttachedProcedure, Error> {
    // If session is terminal, no more requests may be accepted.
    if session.ble.is_terminal() {
        info!("rejecting request: session is terminal");
        cancel_connection(server);
        return Err(Error::InvalidState);
    }

    let drops_security = characteristic_drops_security(server, table_index);

    // During shutdown, only a procedure that is already in flight may finish; fallback
    // procedures carry no state and are aborted.
    if server.state() != ServerState::Running {
        let in_progress = server.ble.as_ref().map_or(false, |ble| {
            ble.procedure.attached == Some(table_index) && ble.procedure.is_in_progress()
        });
        if !in_progress {
            info!("rejecting request: shutdown requested");
            cancel_connection(server);
            return Err(Error::InvalidState);
        }
    }

    // An accessory must cancel pending procedures when a new secure session starts getting
    // established.
    if drops_security {
        abort_all_fallbacks(server);
    }

    let ble = server.ble.as_mut().ok_or(Error::InvalidState)?;

    // Already attached to this characteristic?
    if ble.table[table_index].fallback.is_some() {
        return Ok(AttachedProcedure::Fallback { is_new: false });
    }
    if ble.procedure.attached == Some(table_index) {
        return Ok(AttachedProcedure::Full { is_new: false });
    }

    if let Some(attached) = ble.procedure.attached {
        if ble.procedure.is_in_progress() && !drops_security {
            debug!(
                "procedure in progress on IID {:?}; attaching fallback procedure",
                ble.table[attached].characteristic_iid
            );
            ble.table[table_index].fallback = Some(FallbackProcedure {
                deadline: Some(now + FALLBACK_PROCEDURE_TIMEOUT),
                remaining_body_bytes: 0,
                tid: 0,
                status: FallbackStatus::MaxProcedures,
            });
            session.ble.did_start_procedure(now, session.is_secured());
            return Ok(AttachedProcedure::Fallback { is_new: true });
        }
        debug!("detaching procedure to serve another characteristic");
        ble.procedure.detach();
    }

    ble.procedure.attach(table_index, session.is_secured());
    Ok(AttachedProcedure::Full { is_new: true })
}

fn characteristic_drops_security<P: Platform>(
    server: &AccessoryServer<'_, P>,
    table_index: usize,
) -> bool {
    let entry = match server.ble.as_ref().and_then(|ble| ble.table.get(table_index)) {
        Some(entry) => entry,
        None => return false,
    };
    let iid = match entry.characteristic_iid {
        Some(iid) => iid,
        None => return false,
    };
    server
        .accessory_at(entry.accessory_index)
        .and_then(|accessory| accessory.characteristic_by_iid(iid))
        .map_or(false, |(_, characteristic)| characteristic.drops_security_session())
}

fn cancel_connection<P: Platform>(server: &mut AccessoryServer<'_, P>) {
    if let Some(ble) = server.ble.as_mut() {
        if let Some(connection) = ble.connection {
            ble.peripheral.cancel_connection(connection).ok();
        }
    }
}

/// Handles a GATT write request.
pub(crate) fn handle_gatt_write<P: Platform>(
    server: &mut AccessoryServer<'_, P>,
    delegate: &mut dyn AccessoryDelegate,
    session: &mut Session,
    handle: AttributeHandle,
    bytes: &mut [u8],
) -> Result<(), Error> {
    let table_index = match find_attribute(server, handle) {
        Some(index) => index,
        None => {
            info!("GATT write to unknown attribute handle {:#06x}", handle);
            return Err(Error::InvalidState);
        }
    };
    let now = server.clock.now();

    let entry_kind = {
        let ble = server.ble.as_ref().ok_or(Error::InvalidState)?;
        let entry = &ble.table[table_index];
        if entry.value_handle == Some(handle) {
            HandleKind::Value
        } else if entry.cccd_handle == Some(handle) {
            HandleKind::Cccd
        } else {
            HandleKind::InstanceId
        }
    };

    match entry_kind {
        HandleKind::Value => {
            let attached = match attach_procedure(server, session, table_index, now) {
                Ok(attached) => attached,
                Err(e) => {
                    invalidate_session(server, session, true);
                    return Err(e);
                }
            };

            // Each fragment is individually encrypted once the session is secured.
            let fragment_len = if session.is_secured() {
                match session.decrypt_trailing_tag(bytes) {
                    Ok(len) => len,
                    Err(e) => {
                        info!("write fragment decryption failed");
                        invalidate_session(server, session, true);
                        return Err(e);
                    }
                }
            } else {
                bytes.len()
            };
            let fragment = &bytes[..fragment_len];

            match attached {
                AttachedProcedure::Full { .. } => {
                    let secured = session.is_secured();
                    let ble = server.ble.as_mut().ok_or(Error::InvalidState)?;
                    let starting = ble.procedure.transaction.is_idle();
                    if let Err(e) = ble.procedure.handle_gatt_write(now, fragment, secured) {
                        invalidate_session(server, session, true);
                        return Err(e);
                    }
                    if starting {
                        session.ble.did_start_procedure(now, secured);
                    }
                }
                AttachedProcedure::Fallback { is_new } => {
                    if let Err(e) =
                        handle_fallback_write(server, table_index, fragment, is_new)
                    {
                        invalidate_session(server, session, true);
                        return Err(e);
                    }
                    session.ble.did_send_gatt_response(now);
                }
            }

            send_pending_events(server, delegate, session);
            Ok(())
        }
        HandleKind::Cccd => {
            if bytes.len() != 2 {
                info!("unexpected CCCD value length {}", bytes.len());
                return Err(Error::InvalidData);
            }
            let value = u16::from_le_bytes([bytes[0], bytes[1]]);
            if value & !0x0002 != 0 {
                info!("unexpected CCCD value {:#06x}", value);
                return Err(Error::InvalidData);
            }
            set_subscription(server, delegate, session, table_index, value == 0x0002);
            Ok(())
        }
        HandleKind::InstanceId => {
            info!("rejecting write to Instance ID attribute");
            Err(Error::InvalidState)
        }
    }
}

enum HandleKind {
    Value,
    Cccd,
    InstanceId,
}

/// Processes a write to a characteristic with an active fallback procedure.
///
/// Only enough header state is retained to emit an error response; body bytes are skipped.
fn handle_fallback_write<P: Platform>(
    server: &mut AccessoryServer<'_, P>,
    table_index: usize,
    fragment: &[u8],
    is_new: bool,
) -> Result<(), Error> {
    let (service_iid, characteristic_iid) = {
        let ble = server.ble.as_ref().ok_or(Error::InvalidState)?;
        let entry = &ble.table[table_index];
        (entry.service_iid, entry.characteristic_iid)
    };

    let ble = server.ble.as_mut().ok_or(Error::InvalidState)?;
    let fallback = ble.table[table_index]
        .fallback
        .as_mut()
        .ok_or(Error::InvalidState)?;

    if is_new {
        debug!("processing first fragment of fallback procedure");
        if fragment.len() < 5 {
            info!("first fragment of fallback procedure malformed (too short)");
            return Err(Error::InvalidData);
        }
        if fragment[0] != 0 {
            info!("first fragment of fallback procedure malformed (control field)");
            return Err(Error::InvalidData);
        }

        fallback.tid = fragment[2];
        fallback.status = FallbackStatus::MaxProcedures;

        let operation = fragment[1];
        let iid = u16::from_le_bytes([fragment[3], fragment[4]]);
        if pdu::Opcode::is_valid(operation) {
            let opcode = pdu::Opcode::from(operation);
            let expected_iid = if opcode.is_service_operation() {
                service_iid
            } else {
                characteristic_iid.unwrap_or(0)
            };
            if u64::from(iid) != expected_iid {
                info!("invalid IID {} in fallback procedure", iid);
                fallback.status = FallbackStatus::InvalidInstanceId;
                // A zero service IID still gets a valid stub signature response.
                if opcode == pdu::Opcode::ServiceSignatureRead && iid == 0 {
                    fallback.status = FallbackStatus::ZeroIidServiceSignatureRead;
                }
            }
        }

        if fragment.len() > 5 {
            if fragment.len() < 7 {
                info!("first fragment of fallback procedure malformed (body length)");
                return Err(Error::InvalidData);
            }
            let body_len = u16::from_le_bytes([fragment[5], fragment[6]]);
            let in_fragment = (fragment.len() - 7) as u16;
            if body_len < in_fragment {
                info!("first fragment of fallback procedure malformed (body too long)");
                return Err(Error::InvalidData);
            }
            fallback.remaining_body_bytes = body_len - in_fragment;
        } else {
            fallback.remaining_body_bytes = 0;
        }
    } else {
        debug!("processing continuation of fallback procedure");
        if fragment.len() < 2 {
            info!("continuation of fallback procedure malformed (too short)");
            return Err(Error::InvalidData);
        }
        if fragment[0] != 0x80 {
            info!("continuation of fallback procedure malformed (control field)");
            return Err(Error::InvalidData);
        }
        if fragment[1] != fallback.tid {
            info!("continuation of fallback procedure malformed (invalid TID)");
            return Err(Error::InvalidData);
        }
        let in_fragment = (fragment.len() - 2) as u16;
        if fallback.remaining_body_bytes < in_fragment {
            info!("continuation of fallback procedure malformed (body too long)");
            return Err(Error::InvalidData);
        }
        fallback.remaining_body_bytes -= in_fragment;
    }
    Ok(())
}

/// Handles a GATT read request, writing the response into `out`.
pub(crate) fn handle_gatt_read<P: Platform>(
    server: &mut AccessoryServer<'_, P>,
    delegate: &mut dyn AccessoryDelegate,
    session: &mut Session,
    handle: AttributeHandle,
    out: &mut [u8],
) -> Result<usize, Error> {
    let table_index = match find_attribute(server, handle) {
        Some(index) => index,
        None => {
            info!("GATT read of unknown attribute handle {:#06x}", handle);
            return Err(Error::InvalidState);
        }
    };
    let now = server.clock.now();

    let (is_value, is_cccd, iid16) = {
        let ble = server.ble.as_ref().ok_or(Error::InvalidState)?;
        let entry = &ble.table[table_index];
        (
            entry.value_handle == Some(handle),
            entry.cccd_handle == Some(handle),
            entry.characteristic_iid.unwrap_or(entry.service_iid) as u16,
        )
    };

    if is_cccd {
        let ble = server.ble.as_ref().ok_or(Error::InvalidState)?;
        let value: u16 = if ble.table[table_index].central_subscribed {
            0x0002
        } else {
            0x0000
        };
        if out.len() < 2 {
            return Err(Error::OutOfResources);
        }
        out[..2].copy_from_slice(&value.to_le_bytes());
        return Ok(2);
    }
    if !is_value {
        // Instance ID descriptor / Service Instance ID characteristic.
        if out.len() < 2 {
            return Err(Error::OutOfResources);
        }
        out[..2].copy_from_slice(&iid16.to_le_bytes());
        return Ok(2);
    }

    // A read on a HAP value handle must belong to an attached procedure; anything else is an
    // unsolicited read and terminates the link.
    if session.ble.is_terminal() {
        info!("rejecting request: session is terminal");
        cancel_connection(server);
        return Err(Error::InvalidState);
    }

    let has_fallback = server
        .ble
        .as_ref()
        .map_or(false, |ble| ble.table[table_index].fallback.is_some());
    if has_fallback {
        let len = match handle_fallback_read(server, session, table_index, out) {
            Ok(len) => len,
            Err(e) => {
                invalidate_session(server, session, true);
                return Err(e);
            }
        };
        session.ble.did_send_gatt_response(now);
        return Ok(len);
    }

    let is_attached = server
        .ble
        .as_ref()
        .map_or(false, |ble| ble.procedure.attached == Some(table_index));
    if !is_attached {
        info!("rejecting unsolicited GATT read");
        invalidate_session(server, session, true);
        return Err(Error::InvalidState);
    }

    let len = match handle_procedure_read(server, delegate, session, table_index, out) {
        Ok(len) => len,
        Err(e) => {
            invalidate_session(server, session, true);
            return Err(e);
        }
    };
    session.ble.did_send_gatt_response(now);
    send_pending_events(server, delegate, session);
    Ok(len)
}

fn handle_fallback_read<P: Platform>(
    server: &mut AccessoryServer<'_, P>,
    session: &mut Session,
    table_index: usize,
    out: &mut [u8],
) -> Result<usize, Error> {
    let ble = server.ble.as_mut().ok_or(Error::InvalidState)?;
    let fallback = ble.table[table_index]
        .fallback
        .take()
        .ok_or(Error::InvalidState)?;

    if fallback.remaining_body_bytes != 0 {
        info!("GATT read while fallback body is incomplete");
        return Err(Error::InvalidState);
    }

    let mut response = [0u8; 16];
    let mut len = 3;
    response[0] = 0x02;
    response[1] = fallback.tid;
    response[2] = match fallback.status {
        FallbackStatus::MaxProcedures => pdu::Status::MaxProcedures as u8,
        FallbackStatus::InvalidInstanceId => pdu::Status::InvalidInstanceId as u8,
        FallbackStatus::ZeroIidServiceSignatureRead => pdu::Status::Success as u8,
    };
    if fallback.status == FallbackStatus::ZeroIidServiceSignatureRead {
        // Stub signature: Svc Properties 0, empty Linked Services.
        let body = [0x0f, 0x02, 0x00, 0x00, 0x10, 0x00];
        response[3..5].copy_from_slice(&(body.len() as u16).to_le_bytes());
        response[5..5 + body.len()].copy_from_slice(&body);
        len = 5 + body.len();
    }

    if session.is_secured() {
        if out.len() < len + 16 {
            return Err(Error::OutOfResources);
        }
        out[..len].copy_from_slice(&response[..len]);
        session.encrypt_trailing_tag(out, len)
    } else {
        if out.len() < len {
            return Err(Error::OutOfResources);
        }
        out[..len].copy_from_slice(&response[..len]);
        Ok(len)
    }
}

fn handle_procedure_read<P: Platform>(
    server: &mut AccessoryServer<'_, P>,
    delegate: &mut dyn AccessoryDelegate,
    session: &mut Session,
    table_index: usize,
    out: &mut [u8],
) -> Result<usize, Error> {
    // Process the request on the first read after reassembly completed.
    let needs_processing = {
        let ble = server.ble.as_ref().ok_or(Error::InvalidState)?;
        ble.procedure.transaction.is_request_complete()
    };
    if needs_processing {
        let (opcode, iid, mut body, body_len) = {
            let ble = server.ble.as_ref().ok_or(Error::InvalidState)?;
            let request = ble.procedure.transaction.request()?;
            let mut body = [0u8; pdu::MAX_BODY_BYTES];
            body[..request.body.len()].copy_from_slice(request.body);
            (request.opcode, request.iid, body, request.body.len())
        };

        let mut response = [0u8; pdu::MAX_BODY_BYTES];
        let (status, response_len) = procedure::process_request(
            server,
            delegate,
            session,
            table_index,
            opcode,
            iid,
            &mut body[..body_len],
            &mut response,
        )?;

        let ble = server.ble.as_mut().ok_or(Error::InvalidState)?;
        ble.procedure
            .transaction
            .set_response(status, &response[..response_len])?;
    }

    // Responses are encrypted iff the transaction started on a secured session. The response
    // that completes a Pair Verify leaves in plaintext even though the session is secured by
    // the time it is read.
    let secured = server
        .ble
        .as_ref()
        .map_or(false, |ble| ble.procedure.started_secured);
    let overhead = if secured { 16 } else { 0 };
    if out.len() <= overhead {
        return Err(Error::OutOfResources);
    }

    let ble = server.ble.as_mut().ok_or(Error::InvalidState)?;
    let read_len = out.len() - overhead;
    let fragment_len = ble.procedure.transaction.handle_read(&mut out[..read_len])?;
    if !ble.procedure.transaction.has_pending_response() {
        // Last fragment; the procedure timer stops with the final read.
        ble.procedure.deadline = None;
    }

    if secured {
        session.encrypt_trailing_tag(out, fragment_len)
    } else {
        Ok(fragment_len)
    }
}

/// Updates the CCCD subscription state of a characteristic.
fn set_subscription<P: Platform>(
    server: &mut AccessoryServer<'_, P>,
    delegate: &mut dyn AccessoryDelegate,
    session: &mut Session,
    table_index: usize,
    enable: bool,
) {
    let changed = {
        let ble = match server.ble.as_mut() {
            Some(ble) => ble,
            None => return,
        };
        let entry = &mut ble.table[table_index];
        if entry.central_subscribed == enable {
            false
        } else {
            entry.central_subscribed = enable;
            true
        }
    };
    if !changed {
        return;
    }
    info!("{} events", if enable { "enabling" } else { "disabling" });

    // Inform the application, but only over a secured session.
    if session.is_secured() {
        if let Some((accessory, service, characteristic)) =
            resolve_characteristic(server, table_index)
        {
            let request = CharacteristicRequest {
                accessory,
                service,
                characteristic,
                is_admin: session.controller_is_admin(),
            };
            if enable {
                delegate.handle_subscribe(&request);
            } else {
                delegate.handle_unsubscribe(&request);
            }
        }
    }

    send_pending_events(server, delegate, session);
}

fn resolve_characteristic<'t, 'a, P: Platform>(
    server: &'t AccessoryServer<'a, P>,
    table_index: usize,
) -> Option<(
    &'a crate::accessory::Accessory<'a>,
    &'a crate::accessory::Service<'a>,
    &'a crate::accessory::Characteristic<'a>,
)> {
    let entry = server.ble.as_ref()?.table.get(table_index)?;
    let iid = entry.characteristic_iid?;
    let accessory = server.accessory_at(entry.accessory_index)?;
    let (service, characteristic) = accessory.characteristic_by_iid(iid)?;
    Some((accessory, service, characteristic))
}

/// Latches a pending event for `(accessory, characteristic)` and tries to deliver it.
pub(crate) fn raise_event<P: Platform>(
    server: &mut AccessoryServer<'_, P>,
    delegate: &mut dyn AccessoryDelegate,
    session: &mut Session,
    aid: u64,
    iid: u64,
) {
    let num_accessories = server.num_accessories();
    let mut accessory_index = None;
    for i in 0..num_accessories {
        if server.accessory_at(i).map(|a| a.aid) == Some(aid) {
            accessory_index = Some(i);
            break;
        }
    }
    let accessory_index = match accessory_index {
        Some(index) => index,
        None => return,
    };

    if let Some(ble) = server.ble.as_mut() {
        for attribute in ble.table.iter_mut() {
            if attribute.accessory_index == accessory_index
                && attribute.characteristic_iid == Some(iid)
            {
                attribute.pending_event = true;
            }
        }
    }
    send_pending_events(server, delegate, session);
}

/// Delivers latched events whose gates are all open.
///
/// Events are suppressed while the session is not secured or transient; events on
/// admin-read-only characteristics are dropped for non-admin controllers.
pub(crate) fn send_pending_events<P: Platform>(
    server: &mut AccessoryServer<'_, P>,
    _delegate: &mut dyn AccessoryDelegate,
    session: &mut Session,
) {
    let connection = match server.ble.as_ref().and_then(|ble| ble.connection) {
        Some(connection) => connection,
        None => return,
    };

    let table_len = server.ble.as_ref().map_or(0, |ble| ble.table.len());
    for index in 0..table_len {
        let (subscribed, pending, value_handle) = {
            let ble = match server.ble.as_ref() {
                Some(ble) => ble,
                None => return,
            };
            let entry = &ble.table[index];
            (entry.central_subscribed, entry.pending_event, entry.value_handle)
        };
        if !subscribed || !pending {
            continue;
        }
        let value_handle = match value_handle {
            Some(handle) => handle,
            None => continue,
        };

        if !session.is_secured() {
            info!("not sending event: session is not secured");
            return;
        }
        if session.is_transient() {
            info!("not sending event: session is transient");
            return;
        }

        let requires_admin = resolve_characteristic(server, index).map_or(false, |(_, _, c)| {
            c.properties
                .contains(crate::accessory::CharacteristicProperties::READ_REQUIRES_ADMIN)
        });
        if requires_admin && !session.controller_is_admin() {
            info!("not sending event: delivered only to admin controllers");
            continue;
        }

        let ble = match server.ble.as_mut() {
            Some(ble) => ble,
            None => return,
        };
        match ble.peripheral.send_indication(connection, value_handle, &[]) {
            Ok(()) => {
                ble.table[index].pending_event = false;
                debug!("sent event indication");
            }
            Err(Error::InvalidState) => {
                debug!("delaying event until ready to update subscribers");
                return;
            }
            Err(_) => {
                error!("sending event indication failed");
                return;
            }
        }
    }
}

/// Drives BLE deadlines: session timers, the procedure timeout and fallback timeouts.
pub(crate) fn poll<P: Platform>(
    server: &mut AccessoryServer<'_, P>,
    session: &mut Session,
) {
    let now = server.clock.now();

    let actions = session.ble.poll(now);
    if actions.invalidate {
        invalidate_session(server, session, true);
    }
    if actions.safe_to_disconnect_fired {
        let should_disconnect =
            session.ble.is_terminal() || server.state() != ServerState::Running;
        if should_disconnect {
            info!("disconnecting connection after safe-to-disconnect grace");
            cancel_connection(server);
        }
    }

    let procedure_expired = server
        .ble
        .as_mut()
        .map_or(false, |ble| ble.procedure.poll(now));
    if procedure_expired {
        invalidate_session(server, session, true);
    }

    if let Some(ble) = server.ble.as_mut() {
        for attribute in ble.table.iter_mut() {
            let expired = attribute
                .fallback
                .as_ref()
                .map_or(false, |fallback| elapsed(fallback.deadline, now));
            if expired {
                info!("fallback procedure timeout expired");
                attribute.fallback = None;
            }
        }
    }
}

/// Returns the earliest BLE deadline for the platform's wakeup scheduling.
pub(crate) fn next_deadline<P: Platform>(
    server: &AccessoryServer<'_, P>,
    session: &Session,
) -> Deadline {
    let mut deadline = session.ble.next_deadline();
    if let Some(ble) = server.ble.as_ref() {
        deadline = crate::time::earliest(deadline, ble.procedure.deadline);
        for attribute in ble.table.iter() {
            if let Some(fallback) = &attribute.fallback {
                deadline = crate::time::earliest(deadline, fallback.deadline);
            }
        }
    }
    deadline
}
