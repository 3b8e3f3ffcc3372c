//! Collaborators the engine consults but does not own: the clock and the
//! authorization gate.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use ulid::Ulid;

use crate::model::Ms;

pub trait Clock: Send + Sync {
    fn now(&self) -> Ms;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Ms {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Clock that only moves when told to. Used by tests and replay tooling.
#[derive(Debug)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(now: Ms) -> Arc<Self> {
        Arc::new(Self {
            now: AtomicI64::new(now),
        })
    }

    pub fn set(&self, now: Ms) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Ms) {
        self.now.fetch_add(by, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Ms {
        self.now.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    RegisterVehicle,
    UpdateVehicle,
    ManageCustomer,
    WriteState,
    Assign,
    ExtendAssignment,
    RevokeAssignment,
    CloseAssignment,
    ManageBlock,
    CreateRental,
    UpdateRental,
    TransitionRental,
    AddCharge,
    ManagePriceList,
    ManageFeeRate,
    SnapshotFee,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::RegisterVehicle => "register_vehicle",
            Action::UpdateVehicle => "update_vehicle",
            Action::ManageCustomer => "manage_customer",
            Action::WriteState => "write_state",
            Action::Assign => "assign",
            Action::ExtendAssignment => "extend_assignment",
            Action::RevokeAssignment => "revoke_assignment",
            Action::CloseAssignment => "close_assignment",
            Action::ManageBlock => "manage_block",
            Action::CreateRental => "create_rental",
            Action::UpdateRental => "update_rental",
            Action::TransitionRental => "transition_rental",
            Action::AddCharge => "add_charge",
            Action::ManagePriceList => "manage_pricelist",
            Action::ManageFeeRate => "manage_fee_rate",
            Action::SnapshotFee => "snapshot_fee",
        }
    }
}

/// Answers "may `actor` perform `action` on `resource`". Consulted before
/// any validation or locking.
pub trait Authorizer: Send + Sync {
    fn can(&self, actor: &str, action: Action, resource: Ulid) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn can(&self, _actor: &str, _action: Action, _resource: Ulid) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_moves_only_when_told() {
        let clock = ManualClock::new(1_000);
        assert_eq!(clock.now(), 1_000);
        clock.advance(500);
        assert_eq!(clock.now(), 1_500);
        clock.set(42);
        assert_eq!(clock.now(), 42);
    }

    #[test]
    fn system_clock_is_after_2020() {
        assert!(SystemClock.now() > 1_577_836_800_000);
    }
}
