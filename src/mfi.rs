//! Apple Authentication Coprocessor (MFi) register protocol.
//!
//! The coprocessor signs Pair Setup challenges with Apple-provisioned keys and hands out its
//! certificate chain. Two device generations are handled: 2.0C (RSA signatures up to 128 bytes,
//! SHA-1 challenge digest) and 3.0 (64-byte ECDSA signatures, SHA-256 challenge digest).
//!
//! Power management: the chip is powered on on first use and powered off 3 seconds after the
//! last use. A 2.0C device with a non-zero System Event Counter must not lose power until the
//! counter drains, so the off deadline is extended in 1-second steps while it is non-zero.

use crate::crypto::hash;
use crate::platform::MfiCoprocessor;
use crate::time::{elapsed, Deadline, Duration, Instant};
use crate::Error;

/// Maximum certificate length accepted from the coprocessor (2.0C limit).
pub const MAX_CERTIFICATE_BYTES: usize = 1280;

/// Maximum challenge response length (2.0C RSA limit; 3.0 always produces 64 bytes).
pub const MAX_SIGNATURE_BYTES: usize = 128;

const POWER_OFF_DELAY: Duration = Duration::from_secs(3);
const POWER_OFF_EXTENSION: Duration = Duration::from_secs(1);

/// Coprocessor register addresses.
mod registers {
    pub const DEVICE_VERSION: u8 = 0x00;
    pub const AUTHENTICATION_REVISION: u8 = 0x01;
    pub const PROTOCOL_MAJOR_VERSION: u8 = 0x02;
    pub const PROTOCOL_MINOR_VERSION: u8 = 0x03;
    pub const ERROR_CODE: u8 = 0x05;
    pub const AUTHENTICATION_CONTROL_AND_STATUS: u8 = 0x10;
    pub const CHALLENGE_RESPONSE_DATA_LENGTH: u8 = 0x11;
    pub const CHALLENGE_RESPONSE_DATA: u8 = 0x12;
    pub const CHALLENGE_DATA_LENGTH: u8 = 0x20;
    pub const CHALLENGE_DATA: u8 = 0x21;
    pub const CERTIFICATE_DATA_LENGTH: u8 = 0x30;
    pub const CERTIFICATE_DATA_PART1: u8 = 0x31;
    pub const SYSTEM_EVENT_COUNTER: u8 = 0x4D;
}

/// Device Version register value of a 2.0C coprocessor.
const DEVICE_VERSION_2_0C: u8 = 0x05;
/// Device Version register value of a 3.0 coprocessor.
const DEVICE_VERSION_3_0: u8 = 0x07;

/// Driver state for one Apple Authentication Coprocessor.
pub struct MfiHwAuth<M: MfiCoprocessor> {
    driver: M,
    powered: bool,
    power_off_deadline: Deadline,
}

impl<M: MfiCoprocessor> MfiHwAuth<M> {
    /// Wraps a platform coprocessor driver. The chip stays powered off until first use.
    pub fn new(driver: M) -> Self {
        MfiHwAuth {
            driver,
            powered: false,
            power_off_deadline: None,
        }
    }

    fn enable(&mut self, now: Instant) -> Result<(), Error> {
        if !self.powered {
            info!("turning on Apple Authentication Coprocessor");
            self.driver.power_on().map_err(|_| Error::Unknown)?;
            self.powered = true;
        }
        self.power_off_deadline = Some(now + POWER_OFF_DELAY);
        Ok(())
    }

    fn read(&mut self, register: u8, buf: &mut [u8]) -> Result<(), Error> {
        self.driver.read(register, buf).map_err(|_| Error::Unknown)
    }

    fn read_u8(&mut self, register: u8) -> Result<u8, Error> {
        let mut byte = [0];
        self.read(register, &mut byte)?;
        Ok(byte[0])
    }

    fn check_error_register(&mut self, operation: &str) -> Result<(), Error> {
        let code = self.read_u8(registers::ERROR_CODE)?;
        if code != 0 {
            warn!("coprocessor error during {}: {:#04x}", operation, code);
            return Err(Error::Unknown);
        }
        Ok(())
    }

    /// A 2.0C device must keep power while its System Event Counter is draining.
    fn is_safe_to_release(&mut self) -> bool {
        match self.read_u8(registers::DEVICE_VERSION) {
            Ok(DEVICE_VERSION_2_0C) => match self.read_u8(registers::SYSTEM_EVENT_COUNTER) {
                Ok(counter) => counter == 0,
                Err(_) => true,
            },
            _ => true,
        }
    }

    /// Drives the auto-power-off deadline.
    pub fn poll(&mut self, now: Instant) {
        if !elapsed(self.power_off_deadline, now) {
            return;
        }
        self.power_off_deadline = None;
        if !self.powered {
            return;
        }
        if !self.is_safe_to_release() {
            self.power_off_deadline = Some(now + POWER_OFF_EXTENSION);
            return;
        }
        info!("turning off Apple Authentication Coprocessor");
        self.driver.power_off();
        self.powered = false;
    }

    /// Returns the next power management deadline, if armed.
    pub fn next_deadline(&self) -> Deadline {
        self.power_off_deadline
    }

    /// Probes the coprocessor: resets the error register and reads version information.
    pub fn is_available(&mut self, now: Instant) -> bool {
        if self.enable(now).is_err() {
            return false;
        }
        // Reading the error register clears stale state.
        if self.read_u8(registers::ERROR_CODE).is_err() {
            return false;
        }
        let device_version = match self.read_u8(registers::DEVICE_VERSION) {
            Ok(v) => v,
            Err(_) => return false,
        };
        if self.read_u8(registers::AUTHENTICATION_REVISION).is_err()
            || self.read_u8(registers::PROTOCOL_MAJOR_VERSION).is_err()
            || self.read_u8(registers::PROTOCOL_MINOR_VERSION).is_err()
        {
            return false;
        }
        if self.check_error_register("device probe").is_err() {
            return false;
        }

        match device_version {
            DEVICE_VERSION_2_0C | DEVICE_VERSION_3_0 => true,
            other => {
                warn!("unsupported coprocessor device version {:#04x}", other);
                false
            }
        }
    }

    fn protocol_major_version(&mut self) -> Result<u8, Error> {
        let major = self.read_u8(registers::PROTOCOL_MAJOR_VERSION)?;
        if major != 2 && major != 3 {
            warn!("unsupported authentication protocol major version {}", major);
            return Err(Error::Unknown);
        }
        Ok(major)
    }

    /// Reads the accessory certificate into `buf`, returning its length.
    pub fn copy_certificate(&mut self, now: Instant, buf: &mut [u8]) -> Result<usize, Error> {
        self.enable(now)?;
        self.read_u8(registers::ERROR_CODE)?;
        let major = self.protocol_major_version()?;

        let mut length_bytes = [0; 2];
        self.read(registers::CERTIFICATE_DATA_LENGTH, &mut length_bytes)?;
        let mut remaining = u16::from_be_bytes(length_bytes) as usize;
        if (major == 3 && !(607..=609).contains(&remaining))
            || (major == 2 && remaining > MAX_CERTIFICATE_BYTES)
        {
            warn!("implausible accessory certificate length {}", remaining);
            return Err(Error::Unknown);
        }
        if remaining > buf.len() {
            return Err(Error::OutOfResources);
        }

        // The certificate is exposed through consecutive 128-byte part registers.
        let mut total = 0;
        let mut part = 0;
        while remaining > 0 {
            let chunk = remaining.min(128);
            self.read(
                registers::CERTIFICATE_DATA_PART1 + part,
                &mut buf[total..total + chunk],
            )?;
            remaining -= chunk;
            total += chunk;
            part += 1;
        }

        self.check_error_register("certificate read")?;
        Ok(total)
    }

    /// Signs a Pair Setup challenge, returning the signature length.
    ///
    /// The challenge is digested before it reaches the chip: SHA-256 for 3.0 devices (ECDSA),
    /// SHA-1 for 2.0C devices (RSA).
    pub fn create_signature(
        &mut self,
        now: Instant,
        challenge: &[u8],
        signature: &mut [u8; MAX_SIGNATURE_BYTES],
    ) -> Result<usize, Error> {
        self.enable(now)?;
        self.read_u8(registers::ERROR_CODE)?;
        let major = self.protocol_major_version()?;

        if major == 3 {
            let mut write = [0; 1 + hash::SHA256_BYTES];
            write[0] = registers::CHALLENGE_DATA;
            write[1..].copy_from_slice(&hash::sha256(challenge));
            self.driver.write(&write).map_err(|_| Error::Unknown)?;
        } else {
            let mut length = [0; 3];
            length[0] = registers::CHALLENGE_DATA_LENGTH;
            length[1..].copy_from_slice(&(hash::SHA1_BYTES as u16).to_be_bytes());
            self.driver.write(&length).map_err(|_| Error::Unknown)?;

            let mut write = [0; 1 + hash::SHA1_BYTES];
            write[0] = registers::CHALLENGE_DATA;
            write[1..].copy_from_slice(&hash::sha1(challenge));
            self.driver.write(&write).map_err(|_| Error::Unknown)?;

            // The response length register must hold 0x80 before generation starts.
            let mut response_length = [0; 3];
            response_length[0] = registers::CHALLENGE_RESPONSE_DATA_LENGTH;
            response_length[1..].copy_from_slice(&0x80u16.to_be_bytes());
            self.driver
                .write(&response_length)
                .map_err(|_| Error::Unknown)?;
        }

        // Start challenge response generation (PROC_CONTROL) and wait for the result bit.
        self.driver
            .write(&[registers::AUTHENTICATION_CONTROL_AND_STATUS, 1])
            .map_err(|_| Error::Unknown)?;
        let status = self.read_u8(registers::AUTHENTICATION_CONTROL_AND_STATUS)?;
        if status != 1 << 4 {
            warn!("coprocessor authentication status {:#04x}", status);
            return Err(Error::Unknown);
        }

        let mut length_bytes = [0; 2];
        self.read(registers::CHALLENGE_RESPONSE_DATA_LENGTH, &mut length_bytes)?;
        let length = u16::from_be_bytes(length_bytes) as usize;
        if (major == 3 && length != 64) || (major == 2 && length > MAX_SIGNATURE_BYTES) {
            warn!("implausible challenge response length {}", length);
            return Err(Error::Unknown);
        }

        self.read(registers::CHALLENGE_RESPONSE_DATA, &mut signature[..length])?;
        self.check_error_register("challenge response")?;
        Ok(length)
    }
}
