//! Vehicle state ledger: a per-vehicle history of intervals where the row
//! with `ended_at = NULL` is the current state.

use tracing::info;
use ulid::Ulid;

use crate::collab::Action;
use crate::limits::MAX_TEXT_LEN;
use crate::model::*;

use super::conflict::{validate_instant, validate_text};
use super::{ConflictRef, Engine, EngineError, Txn};

/// The vehicle's open row. More than one is a broken ledger.
pub(crate) fn current_state(tl: &VehicleTimeline) -> Result<Option<&VehicleState>, EngineError> {
    let mut open = tl.open_states();
    match (open.next(), open.next()) {
        (Some(a), Some(b)) => Err(EngineError::InvariantViolation(format!(
            "vehicle {} has more than one open state ({}, {})",
            tl.vehicle.id, a.id, b.id
        ))),
        (first, _) => Ok(first),
    }
}

pub(crate) fn check_single_open(tl: &VehicleTimeline) -> Result<(), EngineError> {
    current_state(tl).map(|_| ())
}

/// Close the open row at `started_at` and append a new open row.
///
/// Time only moves forward: a start before the current row's start is a conflict.
pub(crate) fn open_state(
    txn: &mut Txn,
    state: VehicleStateKind,
    started_at: Ms,
    reason: String,
    actor: &str,
    source_id: Option<Ulid>,
) -> Result<Ulid, EngineError> {
    if let Some(current) = current_state(&txn.staged)?.cloned() {
        if started_at < current.started_at {
            return Err(EngineError::Conflict {
                conflicts: vec![ConflictRef {
                    id: current.id,
                    kind: "state",
                    start: current.started_at,
                    end: None,
                }],
            });
        }
        txn.record(Event::StateWritten(VehicleState {
            ended_at: Some(started_at),
            ..current
        }));
    }
    let id = Ulid::new();
    txn.record(Event::StateWritten(VehicleState {
        id,
        vehicle_id: txn.staged.vehicle.id,
        state,
        started_at,
        ended_at: None,
        reason,
        created_by: actor.to_string(),
        source_id,
    }));
    Ok(id)
}

/// Allocator-driven open: a start that predates the current row is moved up to it.
pub(crate) fn open_state_clamped(
    txn: &mut Txn,
    state: VehicleStateKind,
    started_at: Ms,
    reason: String,
    actor: &str,
    source_id: Option<Ulid>,
) -> Result<Ulid, EngineError> {
    let started_at = match current_state(&txn.staged)? {
        Some(current) => started_at.max(current.started_at),
        None => started_at,
    };
    open_state(txn, state, started_at, reason, actor, source_id)
}

/// Close the open row if it is in `state`. No-op otherwise.
pub(crate) fn close_state(
    txn: &mut Txn,
    state: VehicleStateKind,
    ended_at: Ms,
    reason_suffix: &str,
) -> Result<Option<Ulid>, EngineError> {
    let Some(current) = current_state(&txn.staged)?.cloned() else {
        return Ok(None);
    };
    if current.state != state {
        return Ok(None);
    }
    let reason = match (current.reason.is_empty(), reason_suffix.is_empty()) {
        (_, true) => current.reason.clone(),
        (true, false) => reason_suffix.to_string(),
        (false, false) => format!("{}; {}", current.reason, reason_suffix),
    };
    let id = current.id;
    txn.record(Event::StateWritten(VehicleState {
        ended_at: Some(ended_at.max(current.started_at)),
        reason,
        ..current
    }));
    Ok(Some(id))
}

/// Leave `state` and fall back to `available`. When some other state has
/// replaced it in the meantime (a manual maintenance entry, say), that row
/// stays current.
pub(crate) fn release_state(
    txn: &mut Txn,
    state: VehicleStateKind,
    at: Ms,
    reason_suffix: &str,
    reason: String,
    actor: &str,
) -> Result<(), EngineError> {
    let closed = close_state(txn, state, at, reason_suffix)?;
    if closed.is_some() || current_state(&txn.staged)?.is_none() {
        open_state_clamped(txn, VehicleStateKind::Available, at, reason, actor, None)?;
    }
    Ok(())
}

/// Closed, future-dated row recording a scheduled allocation. Never current.
pub(crate) fn write_audit_row(
    txn: &mut Txn,
    state: VehicleStateKind,
    window: Window,
    reason: String,
    actor: &str,
    source_id: Ulid,
) {
    txn.record(Event::StateWritten(VehicleState {
        id: Ulid::new(),
        vehicle_id: txn.staged.vehicle.id,
        state,
        started_at: window.start,
        ended_at: Some(window.end.unwrap_or(window.start)),
        reason,
        created_by: actor.to_string(),
        source_id: Some(source_id),
    }));
}

/// Delete every audit row written for `source_id`.
pub(crate) fn delete_audit_rows(txn: &mut Txn, source_id: Ulid) {
    let vehicle_id = txn.staged.vehicle.id;
    let ids: Vec<Ulid> = txn
        .staged
        .states
        .iter()
        .filter(|s| s.source_id == Some(source_id) && !s.is_open())
        .map(|s| s.id)
        .collect();
    for id in ids {
        txn.record(Event::StateDeleted { id, vehicle_id });
    }
}

/// Move a scheduled row's audit entry to a new window.
pub(crate) fn reschedule_audit_rows(txn: &mut Txn, source_id: Ulid, window: Window) {
    let rows: Vec<VehicleState> = txn
        .staged
        .states
        .iter()
        .filter(|s| s.source_id == Some(source_id) && !s.is_open())
        .cloned()
        .collect();
    for row in rows {
        txn.record(Event::StateWritten(VehicleState {
            started_at: window.start,
            ended_at: Some(window.end.unwrap_or(window.start)),
            ..row
        }));
    }
}

enum Due {
    Assignment(Assignment),
    Block(Block),
}

/// Promote scheduled assignments and blocks whose start has passed.
pub(crate) fn activate_due(txn: &mut Txn, now: Ms) -> Result<(), EngineError> {
    let mut due: Vec<(Ms, Due)> = Vec::new();
    for a in &txn.staged.assignments {
        if a.status == AssignmentStatus::Scheduled && a.start_at <= now {
            due.push((a.start_at, Due::Assignment(a.clone())));
        }
    }
    for b in &txn.staged.blocks {
        if b.status == BlockStatus::Scheduled && b.start_at <= now {
            due.push((b.start_at, Due::Block(b.clone())));
        }
    }
    due.sort_by_key(|(start, _)| *start);

    for (_, row) in due {
        match row {
            Due::Assignment(a) => {
                delete_audit_rows(txn, a.id);
                let mileage = txn.staged.vehicle.mileage;
                txn.record(Event::AssignmentWritten(Assignment {
                    status: AssignmentStatus::Active,
                    mileage_start: a.mileage_start.or(Some(mileage)),
                    ..a.clone()
                }));
                open_state_clamped(
                    txn,
                    VehicleStateKind::Assigned,
                    a.start_at,
                    format!("assignment {} started", a.id),
                    &a.created_by,
                    Some(a.id),
                )?;
            }
            Due::Block(b) => {
                delete_audit_rows(txn, b.id);
                txn.record(Event::BlockWritten(Block {
                    status: BlockStatus::Active,
                    ..b.clone()
                }));
                open_state_clamped(
                    txn,
                    b.kind.vehicle_state(),
                    b.start_at,
                    format!("{} {} started", b.kind, b.id),
                    &b.created_by,
                    Some(b.id),
                )?;
            }
        }
    }
    Ok(())
}

impl Engine {
    /// Manually open a state, closing the current one at `started_at`.
    pub async fn open_state(
        &self,
        vehicle_id: Ulid,
        state: VehicleStateKind,
        started_at: Ms,
        reason: &str,
        actor: &str,
    ) -> Result<Ulid, EngineError> {
        self.authorize(actor, Action::WriteState, vehicle_id)?;
        validate_instant(started_at)?;
        validate_text("reason", reason, MAX_TEXT_LEN)?;

        let mut lock = self.lock_vehicle(vehicle_id).await?;
        let mut txn = Txn::begin(&lock);
        activate_due(&mut txn, self.now())?;
        let id = open_state(&mut txn, state, started_at, reason.to_string(), actor, None)?;
        self.commit(&mut lock, txn).await?;
        info!(%vehicle_id, %state, started_at, "state opened");
        Ok(id)
    }

    /// Close the current state if it matches `state`. Returns the closed row.
    pub async fn close_state(
        &self,
        vehicle_id: Ulid,
        state: VehicleStateKind,
        ended_at: Ms,
        reason_suffix: &str,
        actor: &str,
    ) -> Result<Option<Ulid>, EngineError> {
        self.authorize(actor, Action::WriteState, vehicle_id)?;
        validate_instant(ended_at)?;
        validate_text("reason", reason_suffix, MAX_TEXT_LEN)?;

        let mut lock = self.lock_vehicle(vehicle_id).await?;
        let mut txn = Txn::begin(&lock);
        activate_due(&mut txn, self.now())?;
        let closed = close_state(&mut txn, state, ended_at, reason_suffix)?;
        self.commit(&mut lock, txn).await?;
        if closed.is_some() {
            info!(%vehicle_id, %state, ended_at, "state closed");
        }
        Ok(closed)
    }
}
