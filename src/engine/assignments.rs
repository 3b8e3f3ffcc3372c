use tracing::{info, warn};
use ulid::Ulid;

use crate::collab::Action;
use crate::limits::MAX_BATCH_SIZE;
use crate::model::*;

use super::conflict::{allocation_conflicts, ensure_no_conflicts, validate_instant, validate_window};
use super::{ConflictRef, Engine, EngineError, Txn, ledger};

#[derive(Debug, Clone)]
pub struct AssignRequest {
    pub id: Ulid,
    pub vehicle_id: Ulid,
    pub renter_org_id: Ulid,
    pub start_at: Ms,
    pub end_at: Option<Ms>,
}

/// Per-vehicle result of a bulk assignment.
#[derive(Debug)]
pub enum AssignOutcome {
    Assigned(Assignment),
    Skipped { vehicle_id: Ulid, error: EngineError },
}

impl Engine {
    /// Hand a vehicle to a renter organization for a window.
    pub async fn assign(&self, req: AssignRequest, actor: &str) -> Result<Assignment, EngineError> {
        self.authorize(actor, Action::Assign, req.vehicle_id)?;
        let window = validate_window("end_at", req.start_at, req.end_at)?;
        if self.entity_to_vehicle.contains_key(&req.id) {
            return Err(EngineError::AlreadyExists {
                entity: "assignment",
                key: req.id.to_string(),
            });
        }

        let mut lock = self.lock_vehicle(req.vehicle_id).await?;
        let now = self.now();
        let mut txn = Txn::begin(&lock);
        ledger::activate_due(&mut txn, now)?;

        if !txn.staged.vehicle.active {
            return Err(EngineError::validation("vehicle_id", "vehicle is archived"));
        }
        let result = ensure_no_conflicts(allocation_conflicts(&txn.staged, &window, None));
        if let Err(e) = result {
            metrics::counter!(crate::observability::ASSIGNMENTS_TOTAL, "outcome" => "conflict").increment(1);
            warn!(vehicle_id = %req.vehicle_id, %window, "assignment conflict");
            return Err(e);
        }

        let active = req.start_at <= now;
        let assignment = Assignment {
            id: req.id,
            vehicle_id: req.vehicle_id,
            renter_org_id: req.renter_org_id,
            start_at: req.start_at,
            end_at: req.end_at,
            status: if active {
                AssignmentStatus::Active
            } else {
                AssignmentStatus::Scheduled
            },
            mileage_start: active.then_some(txn.staged.vehicle.mileage),
            mileage_end: None,
            created_by: actor.to_string(),
        };
        txn.record(Event::AssignmentWritten(assignment.clone()));
        if active {
            ledger::open_state_clamped(
                &mut txn,
                VehicleStateKind::Assigned,
                req.start_at,
                format!("assigned to {}", req.renter_org_id),
                actor,
                Some(req.id),
            )?;
        } else {
            ledger::write_audit_row(
                &mut txn,
                VehicleStateKind::Assigned,
                window,
                format!("scheduled for {}", req.renter_org_id),
                actor,
                req.id,
            );
        }

        self.commit(&mut lock, txn).await?;
        metrics::counter!(crate::observability::ASSIGNMENTS_TOTAL, "outcome" => "assigned").increment(1);
        info!(assignment_id = %assignment.id, vehicle_id = %assignment.vehicle_id, status = %assignment.status, "assigned");
        Ok(assignment)
    }

    /// Assign many vehicles. Each vehicle commits on its own; conflicts are
    /// reported per vehicle and only fatal errors abort the batch.
    pub async fn assign_many(&self, reqs: Vec<AssignRequest>, actor: &str) -> Result<Vec<AssignOutcome>, EngineError> {
        if reqs.len() > MAX_BATCH_SIZE {
            return Err(EngineError::LimitExceeded("batch too large"));
        }
        let mut outcomes = Vec::with_capacity(reqs.len());
        for req in reqs {
            let vehicle_id = req.vehicle_id;
            match self.assign(req, actor).await {
                Ok(a) => outcomes.push(AssignOutcome::Assigned(a)),
                Err(e) if e.is_fatal() => return Err(e),
                Err(error) => {
                    tracing::debug!(%vehicle_id, %error, "bulk assign skipped vehicle");
                    outcomes.push(AssignOutcome::Skipped { vehicle_id, error });
                }
            }
        }
        Ok(outcomes)
    }

    /// Push an assignment's end later. Shortening is not an extension.
    pub async fn extend_assignment(&self, id: Ulid, new_end: Ms, actor: &str) -> Result<Assignment, EngineError> {
        validate_instant(new_end)?;
        let vehicle_id = self.resolve_vehicle("assignment", id)?;
        self.authorize(actor, Action::ExtendAssignment, vehicle_id)?;
        let mut lock = self.lock_vehicle(vehicle_id).await?;
        let mut txn = Txn::begin(&lock);
        ledger::activate_due(&mut txn, self.now())?;

        let current = txn
            .staged
            .assignment(id)
            .cloned()
            .ok_or(EngineError::not_found("assignment", id))?;
        if !current.status.is_live() {
            return Err(EngineError::validation(
                "status",
                format!("assignment is {}", current.status),
            ));
        }
        if new_end < current.start_at {
            return Err(EngineError::validation(
                "end_at",
                format!("{} is before start {}", fmt_ms(new_end), fmt_ms(current.start_at)),
            ));
        }
        if let Some(end) = current.end_at
            && new_end <= end
        {
            return Err(EngineError::validation(
                "end_at",
                format!("{} does not extend current end {}", fmt_ms(new_end), fmt_ms(end)),
            ));
        }
        let window = Window::bounded(current.start_at, new_end);
        ensure_no_conflicts(allocation_conflicts(&txn.staged, &window, Some(id)))?;

        let extended = Assignment {
            end_at: Some(new_end),
            ..current
        };
        txn.record(Event::AssignmentWritten(extended.clone()));
        if extended.status == AssignmentStatus::Scheduled {
            ledger::reschedule_audit_rows(&mut txn, id, window);
        }
        self.commit(&mut lock, txn).await?;
        info!(assignment_id = %id, new_end, "assignment extended");
        Ok(extended)
    }

    /// Forced termination. Scheduled rows vanish, active rows end now,
    /// finished rows are removed. Returns the surviving row, if any.
    pub async fn revoke_assignment(&self, id: Ulid, actor: &str) -> Result<Option<Assignment>, EngineError> {
        let vehicle_id = self.resolve_vehicle("assignment", id)?;
        self.authorize(actor, Action::RevokeAssignment, vehicle_id)?;
        let mut lock = self.lock_vehicle(vehicle_id).await?;
        let now = self.now();
        let mut txn = Txn::begin(&lock);
        ledger::activate_due(&mut txn, now)?;

        let current = txn
            .staged
            .assignment(id)
            .cloned()
            .ok_or(EngineError::not_found("assignment", id))?;
        let result = match current.status {
            AssignmentStatus::Scheduled => {
                ledger::delete_audit_rows(&mut txn, id);
                txn.record(Event::AssignmentDeleted { id, vehicle_id });
                None
            }
            AssignmentStatus::Active => {
                Some(end_active(&mut txn, current, AssignmentStatus::Revoked, now, actor)?)
            }
            AssignmentStatus::Ended | AssignmentStatus::Revoked => {
                txn.record(Event::AssignmentDeleted { id, vehicle_id });
                None
            }
        };
        self.commit(&mut lock, txn).await?;
        metrics::counter!(crate::observability::ASSIGNMENTS_TOTAL, "outcome" => "revoked").increment(1);
        info!(assignment_id = %id, %vehicle_id, "assignment revoked");
        Ok(result)
    }

    /// Natural end of an active assignment.
    pub async fn close_assignment(&self, id: Ulid, actor: &str) -> Result<Assignment, EngineError> {
        let vehicle_id = self.resolve_vehicle("assignment", id)?;
        self.authorize(actor, Action::CloseAssignment, vehicle_id)?;
        let mut lock = self.lock_vehicle(vehicle_id).await?;
        let now = self.now();
        let mut txn = Txn::begin(&lock);
        ledger::activate_due(&mut txn, now)?;

        let current = txn
            .staged
            .assignment(id)
            .cloned()
            .ok_or(EngineError::not_found("assignment", id))?;
        if current.status != AssignmentStatus::Active {
            return Err(EngineError::validation(
                "status",
                format!("only active assignments can be closed, this one is {}", current.status),
            ));
        }
        let closed = end_active(&mut txn, current, AssignmentStatus::Ended, now, actor)?;
        self.commit(&mut lock, txn).await?;
        metrics::counter!(crate::observability::ASSIGNMENTS_TOTAL, "outcome" => "ended").increment(1);
        info!(assignment_id = %id, "assignment closed");
        Ok(closed)
    }

    /// Conflicts `window` would hit on the vehicle, without writing anything.
    pub async fn check_assignment_window(
        &self,
        vehicle_id: Ulid,
        window: Window,
        exclude: Option<Ulid>,
    ) -> Result<Vec<ConflictRef>, EngineError> {
        let window = validate_window("end_at", window.start, window.end)?;
        let timeline = self
            .timeline(&vehicle_id)
            .ok_or(EngineError::not_found("vehicle", vehicle_id))?;
        let tl = timeline.read().await;
        Ok(allocation_conflicts(&tl, &window, exclude))
    }
}

/// Finish an active assignment at `now`: leave the `assigned` state and
/// return the vehicle to `available`.
fn end_active(
    txn: &mut Txn,
    current: Assignment,
    status: AssignmentStatus,
    now: Ms,
    actor: &str,
) -> Result<Assignment, EngineError> {
    if let Some(r) = txn.staged.rentals.iter().find(|r| {
        r.assignment_id == current.id
            && matches!(r.status, RentalStatus::CheckedOut | RentalStatus::InUse)
    }) {
        return Err(EngineError::validation(
            "status",
            format!("rental {} is still out on this assignment", r.id),
        ));
    }
    let verb = match status {
        AssignmentStatus::Revoked => "revoked",
        _ => "ended",
    };
    ledger::release_state(
        txn,
        VehicleStateKind::Assigned,
        now,
        verb,
        format!("assignment {} {verb}", current.id),
        actor,
    )?;
    let finished = Assignment {
        status,
        end_at: Some(current.end_at.map_or(now, |end| end.min(now))),
        mileage_end: Some(txn.staged.vehicle.mileage),
        ..current
    };
    txn.record(Event::AssignmentWritten(finished.clone()));
    Ok(finished)
}
