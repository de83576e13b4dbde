//! BLE link session lifecycle.
//!
//! A BLE session moves through `Connected -> Secured -> Terminal -> Disconnected`. Three
//! deadline slots drive the transitions:
//!
//! * The link deadline enforces the 10 s budget for the first HAP procedure after link-up and,
//!   once secured, the 30 s inactivity budget.
//! * The pairing procedure deadline enforces 10 s per pairing step.
//! * The safe-to-disconnect deadline gives the BLE stack 200 ms to flush a pending GATT
//!   response before the link may be torn down.
//!
//! Deadlines are polled, not callback-driven: `None` means not armed, and expiry handlers clear
//! the slot before acting, which makes cancellation idempotent.

use crate::pairing::ProcedureType;
use crate::time::{earliest, elapsed, Deadline, Duration, Instant};

/// Budget for the first HAP procedure after link establishment.
pub const LINK_SETUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Inactivity budget once a security session is established.
pub const SECURED_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(30);

/// Budget for each pairing procedure step.
pub const PAIRING_PROCEDURE_TIMEOUT: Duration = Duration::from_secs(10);

/// Grace period after a GATT response before the link may be dropped.
///
/// BLE stacks send responses asynchronously without confirming completion, so a disconnect
/// immediately after queueing a response could lose it.
pub const SAFE_TO_DISCONNECT_TIMEOUT: Duration = Duration::from_millis(200);

/// Per-link BLE session state.
pub struct BleSession {
    pub(crate) link_deadline: Deadline,
    pub(crate) pairing_procedure_deadline: Deadline,
    pub(crate) safe_to_disconnect_deadline: Deadline,
    pub(crate) is_terminal: bool,
    pub(crate) is_safe_to_disconnect: bool,
}

impl Default for BleSession {
    fn default() -> Self {
        BleSession {
            link_deadline: None,
            pairing_procedure_deadline: None,
            safe_to_disconnect_deadline: None,
            is_terminal: false,
            is_safe_to_disconnect: true,
        }
    }
}

/// Expired-deadline actions a poll asks the caller to perform.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PollActions {
    /// A link or pairing deadline expired: invalidate the security session and drop the link.
    pub invalidate: bool,
    /// The safe-to-disconnect grace elapsed; a terminal session may now be disconnected.
    pub safe_to_disconnect_fired: bool,
}

impl BleSession {
    /// Arms the first-procedure deadline. Called when the GATT link comes up.
    pub(crate) fn connected(&mut self, now: Instant) {
        self.link_deadline = Some(now + LINK_SETUP_TIMEOUT);
        self.pairing_procedure_deadline = None;
        self.safe_to_disconnect_deadline = None;
        self.is_terminal = false;
        self.is_safe_to_disconnect = true;
    }

    /// Returns whether the session has been marked terminal.
    pub fn is_terminal(&self) -> bool {
        self.is_terminal
    }

    /// Returns whether any queued GATT response has had time to leave the BLE stack.
    pub fn is_safe_to_disconnect(&self) -> bool {
        self.is_safe_to_disconnect
    }

    /// Returns whether the session is terminal or the link deadline is about to expire.
    ///
    /// Used to avoid starting work whose response could no longer be delivered.
    pub fn is_terminal_soon(&self, now: Instant) -> bool {
        if self.is_terminal {
            return true;
        }
        match self.link_deadline {
            Some(deadline) => now + SAFE_TO_DISCONNECT_TIMEOUT >= deadline,
            None => false,
        }
    }

    /// Marks the session terminal and cancels the link and pairing deadlines.
    pub(crate) fn invalidate(&mut self, terminate_link: bool) {
        self.link_deadline = None;
        self.pairing_procedure_deadline = None;
        if terminate_link {
            self.is_terminal = true;
        }
    }

    /// Re-arms the safe-to-disconnect grace after a GATT response was queued.
    pub(crate) fn did_send_gatt_response(&mut self, now: Instant) {
        self.is_safe_to_disconnect = false;
        self.safe_to_disconnect_deadline = Some(now + SAFE_TO_DISCONNECT_TIMEOUT);
    }

    /// Updates the link deadline when a HAP procedure starts.
    ///
    /// Before security is established the first-procedure deadline is disarmed; once secured,
    /// each procedure restarts the inactivity window.
    pub(crate) fn did_start_procedure(&mut self, now: Instant, secured: bool) {
        if self.is_terminal {
            return;
        }
        if secured {
            self.link_deadline = Some(now + SECURED_INACTIVITY_TIMEOUT);
        } else {
            self.link_deadline = None;
        }
    }

    /// Arms the pairing procedure deadline unless one is already running.
    pub(crate) fn did_start_pairing_procedure(&mut self, now: Instant, _ty: ProcedureType) {
        if self.is_terminal {
            return;
        }
        if self.pairing_procedure_deadline.is_none() {
            self.pairing_procedure_deadline = Some(now + PAIRING_PROCEDURE_TIMEOUT);
        }
    }

    /// Clears the pairing deadline; after a completed Pair Verify the inactivity window starts.
    pub(crate) fn did_complete_pairing_procedure(
        &mut self,
        now: Instant,
        ty: ProcedureType,
        secured: bool,
    ) {
        if self.is_terminal {
            return;
        }
        self.pairing_procedure_deadline = None;
        if ty == ProcedureType::PairVerify && secured {
            self.link_deadline = Some(now + SECURED_INACTIVITY_TIMEOUT);
        }
    }

    /// Checks all deadlines against `now`, clearing the expired ones.
    pub(crate) fn poll(&mut self, now: Instant) -> PollActions {
        let mut actions = PollActions::default();

        if elapsed(self.link_deadline, now) {
            info!("link timeout expired");
            self.link_deadline = None;
            actions.invalidate = true;
        }
        if elapsed(self.pairing_procedure_deadline, now) {
            info!("pairing procedure timeout expired");
            self.pairing_procedure_deadline = None;
            actions.invalidate = true;
        }
        if elapsed(self.safe_to_disconnect_deadline, now) {
            debug!("safe to disconnect expired");
            self.safe_to_disconnect_deadline = None;
            self.is_safe_to_disconnect = true;
            actions.safe_to_disconnect_fired = true;
        }

        actions
    }

    /// Returns the earliest armed deadline, for the platform's wakeup scheduling.
    pub fn next_deadline(&self) -> Deadline {
        earliest(
            earliest(self.link_deadline, self.pairing_procedure_deadline),
            self.safe_to_disconnect_deadline,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(millis: u64) -> Instant {
        Instant::from_raw_millis(millis)
    }

    #[test]
    fn first_procedure_deadline_invalidates() {
        let mut session = BleSession::default();
        session.connected(at(0));

        assert_eq!(session.poll(at(9_999)), PollActions::default());
        let actions = session.poll(at(10_000));
        assert!(actions.invalidate);
        // Expiry cleared the slot; polling again is idle.
        assert_eq!(session.poll(at(20_000)), PollActions::default());
    }

    #[test]
    fn secured_procedure_restarts_inactivity_window() {
        let mut session = BleSession::default();
        session.connected(at(0));
        session.did_start_procedure(at(1_000), true);

        assert_eq!(session.poll(at(10_000)), PollActions::default());
        assert!(session.poll(at(31_000)).invalidate);
    }

    #[test]
    fn unsecured_procedure_disarms_link_deadline() {
        let mut session = BleSession::default();
        session.connected(at(0));
        session.did_start_procedure(at(1_000), false);
        assert_eq!(session.poll(at(60_000)), PollActions::default());
    }

    #[test]
    fn safe_to_disconnect_grace() {
        let mut session = BleSession::default();
        session.connected(at(0));
        session.did_start_procedure(at(10), false);
        session.did_send_gatt_response(at(100));
        assert!(!session.is_safe_to_disconnect());

        let actions = session.poll(at(300));
        assert!(actions.safe_to_disconnect_fired);
        assert!(session.is_safe_to_disconnect());
    }

    #[test]
    fn pairing_deadline_is_not_restarted_by_next_step() {
        let mut session = BleSession::default();
        session.connected(at(0));
        session.did_start_pairing_procedure(at(0), ProcedureType::PairSetup);
        session.did_start_pairing_procedure(at(9_000), ProcedureType::PairSetup);
        assert!(session.poll(at(10_000)).invalidate);
    }

    #[test]
    fn terminal_soon_near_deadline() {
        let mut session = BleSession::default();
        session.connected(at(0));
        assert!(!session.is_terminal_soon(at(9_000)));
        assert!(session.is_terminal_soon(at(9_900)));

        session.invalidate(true);
        assert!(session.is_terminal());
        assert!(session.is_terminal_soon(at(0)));
    }
}
