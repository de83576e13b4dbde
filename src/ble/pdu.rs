//! HAP-PDU encoding and the transaction assembler.
//!
//! A HAP transaction is one request/response pair on a characteristic's value handle. Requests
//! and responses are fragmented to the ATT MTU; the first fragment carries the header, and
//! continuation fragments repeat only the control field (with the continuation bit) and the
//! transaction ID:
//!
//! ```text
//! Request:       <control> <opcode> <TID> <IID: u16 LE> [<body_len: u16 LE> <body...>]
//! Continuation:  <control | 0x80> <TID> <body...>
//! Response:      <control> <TID> <status> [<body_len: u16 LE> <body...>]
//! ```
//!
//! [`Transaction`] reassembles request bodies into a fixed buffer and fragments the response
//! back out. Bodies larger than the buffer are drained and reported as `OutOfResources` when
//! the request is fetched, so the transaction stays parseable.
//!
//! [`Transaction`]: struct.Transaction.html

use crate::utils::HexSlice;
use crate::Error;

/// Maximum reassembled body size of a request or response.
pub const MAX_BODY_BYTES: usize = 2048;

/// Continuation bit of the control field.
const CONTROL_CONTINUATION: u8 = 1 << 7;
/// PDU type bits of the control field (0 = request, 1 = response).
const CONTROL_RESPONSE: u8 = 1 << 1;

enum_with_unknown! {
    /// Opcode of a HAP-PDU request.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum Opcode(u8) {
        /// HAP-Characteristic-Signature-Read.
        CharacteristicSignatureRead = 0x01,
        /// HAP-Characteristic-Write.
        CharacteristicWrite = 0x02,
        /// HAP-Characteristic-Read.
        CharacteristicRead = 0x03,
        /// HAP-Characteristic-Timed-Write.
        CharacteristicTimedWrite = 0x04,
        /// HAP-Characteristic-Execute-Write.
        CharacteristicExecuteWrite = 0x05,
        /// HAP-Service-Signature-Read.
        ServiceSignatureRead = 0x06,
        /// HAP-Characteristic-Configuration.
        CharacteristicConfiguration = 0x07,
        /// HAP-Protocol-Configuration.
        ProtocolConfiguration = 0x08,
        /// HAP-Token-Request.
        Token = 0x10,
        /// HAP-Token-Update-Request.
        TokenUpdate = 0x11,
        /// HAP-Info-Request.
        Info = 0x12,
    }
}

impl Opcode {
    /// Returns whether the value is an opcode this stack understands.
    pub fn is_valid(value: u8) -> bool {
        !matches!(Opcode::from(value), Opcode::Unknown(_))
    }

    /// Returns whether the operation addresses a service IID rather than a characteristic IID.
    pub fn is_service_operation(&self) -> bool {
        matches!(self, Opcode::ServiceSignatureRead | Opcode::ProtocolConfiguration)
    }
}

/// Status byte of a HAP-PDU response.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    /// The request completed.
    Success = 0x00,
    /// The PDU or opcode is not supported.
    UnsupportedPdu = 0x01,
    /// The maximum number of procedures is already in progress.
    MaxProcedures = 0x02,
    /// The controller lacks authorization for the operation.
    InsufficientAuthorization = 0x03,
    /// The addressed instance ID does not exist.
    InvalidInstanceId = 0x04,
    /// The operation requires a secured session.
    InsufficientAuthentication = 0x05,
    /// The request was malformed.
    InvalidRequest = 0x06,
}

/// HAP-PDU body parameter TLV types.
pub mod body_types {
    /// HAP-Param-Value.
    pub const VALUE: u8 = 0x01;
    /// HAP-Param-Additional-Authorization-Data.
    pub const ADDITIONAL_AUTHORIZATION_DATA: u8 = 0x02;
    /// HAP-Param-Origin (local vs remote).
    pub const ORIGIN: u8 = 0x03;
    /// HAP-Param-Characteristic-Type.
    pub const CHARACTERISTIC_TYPE: u8 = 0x04;
    /// HAP-Param-Characteristic-Instance-ID.
    pub const CHARACTERISTIC_INSTANCE_ID: u8 = 0x05;
    /// HAP-Param-Service-Type.
    pub const SERVICE_TYPE: u8 = 0x06;
    /// HAP-Param-Service-Instance-ID.
    pub const SERVICE_INSTANCE_ID: u8 = 0x07;
    /// HAP-Param-TTL.
    pub const TTL: u8 = 0x08;
    /// HAP-Param-Return-Response.
    pub const RETURN_RESPONSE: u8 = 0x09;
    /// HAP-Param-HAP-Characteristic-Properties-Descriptor.
    pub const CHARACTERISTIC_PROPERTIES: u8 = 0x0A;
    /// HAP-Param-GATT-User-Description-Descriptor.
    pub const USER_DESCRIPTION: u8 = 0x0B;
    /// HAP-Param-GATT-Presentation-Format-Descriptor.
    pub const PRESENTATION_FORMAT: u8 = 0x0C;
    /// HAP-Param-GATT-Valid-Range.
    pub const VALID_RANGE: u8 = 0x0D;
    /// HAP-Param-HAP-Step-Value-Descriptor.
    pub const STEP_VALUE: u8 = 0x0E;
    /// HAP-Param-HAP-Service-Properties.
    pub const SERVICE_PROPERTIES: u8 = 0x0F;
    /// HAP-Param-HAP-Linked-Services.
    pub const LINKED_SERVICES: u8 = 0x10;
    /// HAP-Param-HAP-Valid-Values-Descriptor.
    pub const VALID_VALUES: u8 = 0x11;
    /// HAP-Param-HAP-Valid-Values-Range-Descriptor.
    pub const VALID_VALUES_RANGE: u8 = 0x12;
}

/// A fully reassembled request.
pub struct Request<'a> {
    /// The requested operation.
    pub opcode: Opcode,
    /// Transaction ID chosen by the controller.
    pub tid: u8,
    /// Addressed instance ID (characteristic or service, depending on the opcode).
    pub iid: u16,
    /// The reassembled body.
    pub body: &'a [u8],
}

#[derive(PartialEq, Eq, Copy, Clone)]
enum State {
    /// Waiting for the first request fragment.
    Idle,
    /// Reassembling request body fragments.
    ReadingRequest,
    /// Request complete, body available.
    RequestComplete,
    /// Response set, emitting fragments.
    WritingResponse { first: bool },
    /// Response fully emitted.
    ResponseComplete,
}

/// Reassembles one request and fragments one response.
pub struct Transaction {
    state: State,
    opcode: u8,
    tid: u8,
    iid: u16,
    body: heapless::Vec<u8, MAX_BODY_BYTES>,
    /// Body bytes still expected from continuation fragments.
    remaining_body: usize,
    /// Body bytes dropped because the buffer was full.
    overflowed: bool,
    response_status: Status,
    response: heapless::Vec<u8, MAX_BODY_BYTES>,
    response_offset: usize,
}

impl Transaction {
    /// Creates an idle transaction.
    pub fn new() -> Self {
        Transaction {
            state: State::Idle,
            opcode: 0,
            tid: 0,
            iid: 0,
            body: heapless::Vec::new(),
            remaining_body: 0,
            overflowed: false,
            response_status: Status::Success,
            response: heapless::Vec::new(),
            response_offset: 0,
        }
    }

    /// Returns the transaction ID of the request being processed.
    pub fn tid(&self) -> u8 {
        self.tid
    }

    /// Returns whether a request has been fully reassembled.
    pub fn is_request_complete(&self) -> bool {
        self.state == State::RequestComplete
    }

    /// Returns whether the transaction has neither an unfinished request nor an unsent
    /// response.
    ///
    /// While this is `true`, the procedure can be re-attached to another characteristic without
    /// losing data.
    pub fn is_idle(&self) -> bool {
        matches!(self.state, State::Idle | State::ResponseComplete)
    }

    /// Appends body bytes, draining anything past the buffer capacity.
    fn accept_body_bytes(&mut self, bytes: &[u8]) {
        let free = MAX_BODY_BYTES - self.body.len();
        let stored = bytes.len().min(free);
        self.body.extend_from_slice(&bytes[..stored]).ok();
        if stored < bytes.len() {
            self.overflowed = true;
        }
    }

    /// Processes one GATT write (request fragment).
    pub fn handle_write(&mut self, fragment: &[u8]) -> Result<(), Error> {
        match self.state {
            State::Idle | State::RequestComplete | State::ResponseComplete
            | State::WritingResponse { .. } => {
                // First fragment; any previous transaction is discarded.
                if fragment.len() < 5 {
                    info!("request fragment too short ({} bytes)", fragment.len());
                    return Err(Error::InvalidData);
                }
                if fragment[0] != 0 {
                    info!("unexpected request control field {:#04x}", fragment[0]);
                    return Err(Error::InvalidData);
                }
                self.opcode = fragment[1];
                self.tid = fragment[2];
                self.iid = u16::from_le_bytes([fragment[3], fragment[4]]);
                self.body.clear();
                self.overflowed = false;
                self.response.clear();
                self.response_offset = 0;

                if fragment.len() > 5 {
                    if fragment.len() < 7 {
                        info!("request fragment has truncated body length");
                        return Err(Error::InvalidData);
                    }
                    let body_len = u16::from_le_bytes([fragment[5], fragment[6]]) as usize;
                    let in_fragment = fragment.len() - 7;
                    if in_fragment > body_len {
                        info!("request fragment body longer than declared");
                        return Err(Error::InvalidData);
                    }
                    self.remaining_body = body_len - in_fragment;
                    self.accept_body_bytes(&fragment[7..]);
                } else {
                    self.remaining_body = 0;
                }

                self.state = if self.remaining_body == 0 {
                    State::RequestComplete
                } else {
                    State::ReadingRequest
                };
                Ok(())
            }
            State::ReadingRequest => {
                if fragment.len() < 2 {
                    info!("continuation fragment too short");
                    return Err(Error::InvalidData);
                }
                if fragment[0] != CONTROL_CONTINUATION {
                    info!("unexpected continuation control field {:#04x}", fragment[0]);
                    return Err(Error::InvalidData);
                }
                if fragment[1] != self.tid {
                    info!("continuation fragment TID mismatch");
                    return Err(Error::InvalidData);
                }
                let in_fragment = fragment.len() - 2;
                if in_fragment > self.remaining_body {
                    info!("continuation fragment body longer than declared");
                    return Err(Error::InvalidData);
                }
                self.remaining_body -= in_fragment;
                self.accept_body_bytes(&fragment[2..]);
                if self.remaining_body == 0 {
                    self.state = State::RequestComplete;
                }
                Ok(())
            }
        }
    }

    /// Fetches the reassembled request.
    ///
    /// Returns `Error::OutOfResources` when the request body exceeded the transaction buffer.
    pub fn request(&self) -> Result<Request<'_>, Error> {
        if self.state != State::RequestComplete {
            return Err(Error::InvalidState);
        }
        if self.overflowed {
            info!("request body exceeded transaction buffer");
            return Err(Error::OutOfResources);
        }
        Ok(Request {
            opcode: Opcode::from(self.opcode),
            tid: self.tid,
            iid: self.iid,
            body: &self.body,
        })
    }

    /// Stages the response for the completed request.
    pub fn set_response(&mut self, status: Status, body: &[u8]) -> Result<(), Error> {
        if self.state != State::RequestComplete {
            return Err(Error::InvalidState);
        }
        self.response_status = status;
        self.response.clear();
        self.response
            .extend_from_slice(body)
            .map_err(|_| Error::OutOfResources)?;
        self.response_offset = 0;
        self.state = State::WritingResponse { first: true };
        trace!("response staged: status {:?} body {:?}", status, HexSlice(body));
        Ok(())
    }

    /// Returns whether a staged response has fragments left to send.
    pub fn has_pending_response(&self) -> bool {
        matches!(self.state, State::WritingResponse { .. })
    }

    /// Emits the next response fragment into `out`, returning its length.
    pub fn handle_read(&mut self, out: &mut [u8]) -> Result<usize, Error> {
        let first = match self.state {
            State::WritingResponse { first } => first,
            _ => return Err(Error::InvalidState),
        };

        let mut offset = 0;
        if first {
            if out.len() < 3 {
                return Err(Error::OutOfResources);
            }
            out[0] = CONTROL_RESPONSE;
            out[1] = self.tid;
            out[2] = self.response_status as u8;
            offset = 3;
            if !self.response.is_empty() {
                if out.len() < 5 {
                    return Err(Error::OutOfResources);
                }
                out[3..5].copy_from_slice(&(self.response.len() as u16).to_le_bytes());
                offset = 5;
            }
        } else {
            if out.len() < 2 {
                return Err(Error::OutOfResources);
            }
            out[0] = CONTROL_RESPONSE | CONTROL_CONTINUATION;
            out[1] = self.tid;
            offset = 2;
        }

        let remaining = &self.response[self.response_offset..];
        let chunk = remaining.len().min(out.len() - offset);
        out[offset..offset + chunk].copy_from_slice(&remaining[..chunk]);
        self.response_offset += chunk;

        if self.response_offset == self.response.len() {
            self.state = State::ResponseComplete;
        } else {
            self.state = State::WritingResponse { first: false };
        }
        Ok(offset + chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_header_only_request() {
        let mut transaction = Transaction::new();
        transaction
            .handle_write(&[0x00, 0x06, 0x42, 0x10, 0x00])
            .unwrap();
        assert!(transaction.is_request_complete());

        let request = transaction.request().unwrap();
        assert_eq!(request.opcode, Opcode::ServiceSignatureRead);
        assert_eq!(request.tid, 0x42);
        assert_eq!(request.iid, 0x0010);
        assert!(request.body.is_empty());
    }

    #[test]
    fn reassembles_fragmented_body() {
        // 64-byte body at MTU 25, mirroring the shipped transaction tests.
        let mtu = 25;
        let body: std::vec::Vec<u8> = (0..64u32).map(|i| i as u8).collect();

        let mut transaction = Transaction::new();
        let mut fragment = std::vec::Vec::new();
        fragment.extend_from_slice(&[0x00, 0x01, 0x42, 0x01, 0x00]);
        fragment.extend_from_slice(&(body.len() as u16).to_le_bytes());
        let first_chunk = (mtu - 7).min(body.len());
        fragment.extend_from_slice(&body[..first_chunk]);
        transaction.handle_write(&fragment).unwrap();
        assert!(!transaction.is_request_complete());

        let mut sent = first_chunk;
        while sent < body.len() {
            let chunk = (mtu - 2).min(body.len() - sent);
            let mut fragment = std::vec![0x80, 0x42];
            fragment.extend_from_slice(&body[sent..sent + chunk]);
            transaction.handle_write(&fragment).unwrap();
            sent += chunk;
        }

        assert!(transaction.is_request_complete());
        let request = transaction.request().unwrap();
        assert_eq!(request.opcode, Opcode::CharacteristicSignatureRead);
        assert_eq!(request.body, &body[..]);
    }

    #[test]
    fn rejects_mismatched_continuation() {
        let mut transaction = Transaction::new();
        transaction
            .handle_write(&[0x00, 0x02, 0x42, 0x01, 0x00, 0x04, 0x00, 0xaa])
            .unwrap();

        // Wrong TID.
        assert_eq!(
            transaction.handle_write(&[0x80, 0x43, 0xbb]),
            Err(Error::InvalidData)
        );
    }

    #[test]
    fn oversized_body_is_drained_and_reported() {
        let mut transaction = Transaction::new();
        let declared = (MAX_BODY_BYTES + 10) as u16;
        let mut fragment = std::vec![0x00, 0x02, 0x01, 0x02, 0x00];
        fragment.extend_from_slice(&declared.to_le_bytes());
        fragment.extend_from_slice(&[0u8; 100]);
        transaction.handle_write(&fragment).unwrap();

        let mut remaining = declared as usize - 100;
        while remaining > 0 {
            let chunk = remaining.min(200);
            let mut fragment = std::vec![0x80, 0x01];
            fragment.extend_from_slice(&std::vec![0u8; chunk]);
            transaction.handle_write(&fragment).unwrap();
            remaining -= chunk;
        }

        assert!(transaction.is_request_complete());
        assert_eq!(transaction.request().err(), Some(Error::OutOfResources));
    }

    #[test]
    fn response_fragments_to_mtu() {
        let mut transaction = Transaction::new();
        transaction
            .handle_write(&[0x00, 0x03, 0x55, 0x07, 0x00])
            .unwrap();

        let body: std::vec::Vec<u8> = (0..40u32).map(|i| (i + 1) as u8).collect();
        transaction.set_response(Status::Success, &body).unwrap();

        let mut out = [0u8; 25];
        let n = transaction.handle_read(&mut out).unwrap();
        assert_eq!(n, 25);
        assert_eq!(&out[..3], &[0x02, 0x55, 0x00]);
        assert_eq!(&out[3..5], &40u16.to_le_bytes());
        assert_eq!(&out[5..25], &body[..20]);
        assert!(transaction.has_pending_response());

        let n = transaction.handle_read(&mut out).unwrap();
        assert_eq!(n, 22);
        assert_eq!(&out[..2], &[0x82, 0x55]);
        assert_eq!(&out[2..22], &body[20..]);
        assert!(!transaction.has_pending_response());
        assert!(transaction.is_idle());
    }

    #[test]
    fn empty_response_has_no_length_field() {
        let mut transaction = Transaction::new();
        transaction
            .handle_write(&[0x00, 0x02, 0x11, 0x03, 0x00])
            .unwrap();
        transaction
            .set_response(Status::InsufficientAuthentication, &[])
            .unwrap();

        let mut out = [0u8; 16];
        let n = transaction.handle_read(&mut out).unwrap();
        assert_eq!(n, 3);
        assert_eq!(&out[..3], &[0x02, 0x11, 0x05]);
        assert!(transaction.is_idle());
    }
}
