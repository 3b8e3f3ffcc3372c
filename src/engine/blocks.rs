use tracing::info;
use ulid::Ulid;

use crate::collab::Action;
use crate::limits::MAX_TEXT_LEN;
use crate::model::*;

use super::conflict::{allocation_conflicts, ensure_no_conflicts, validate_text, validate_window};
use super::{Engine, EngineError, Txn, ledger};

#[derive(Debug, Clone)]
pub struct NewBlock {
    pub id: Ulid,
    pub vehicle_id: Ulid,
    pub organization_id: Ulid,
    pub kind: BlockKind,
    pub start_at: Ms,
    pub end_at: Option<Ms>,
    pub reason: String,
}

impl Engine {
    /// Take a vehicle out of circulation. Shares the assignment conflict space.
    pub async fn create_block(&self, new: NewBlock, actor: &str) -> Result<Block, EngineError> {
        self.authorize(actor, Action::ManageBlock, new.vehicle_id)?;
        let window = validate_window("end_at", new.start_at, new.end_at)?;
        validate_text("reason", &new.reason, MAX_TEXT_LEN)?;
        if self.entity_to_vehicle.contains_key(&new.id) {
            return Err(EngineError::AlreadyExists {
                entity: "block",
                key: new.id.to_string(),
            });
        }

        let mut lock = self.lock_vehicle(new.vehicle_id).await?;
        let now = self.now();
        let mut txn = Txn::begin(&lock);
        ledger::activate_due(&mut txn, now)?;
        if !txn.staged.vehicle.active {
            return Err(EngineError::validation("vehicle_id", "vehicle is archived"));
        }
        ensure_no_conflicts(allocation_conflicts(&txn.staged, &window, None))?;

        let active = new.start_at <= now;
        let block = Block {
            id: new.id,
            vehicle_id: new.vehicle_id,
            organization_id: new.organization_id,
            kind: new.kind,
            start_at: new.start_at,
            end_at: new.end_at,
            status: if active {
                BlockStatus::Active
            } else {
                BlockStatus::Scheduled
            },
            reason: new.reason,
            created_by: actor.to_string(),
        };
        txn.record(Event::BlockWritten(block.clone()));
        let reason = if block.reason.is_empty() {
            block.kind.to_string()
        } else {
            format!("{}: {}", block.kind, block.reason)
        };
        if active {
            ledger::open_state_clamped(
                &mut txn,
                block.kind.vehicle_state(),
                block.start_at,
                reason,
                actor,
                Some(block.id),
            )?;
        } else {
            ledger::write_audit_row(&mut txn, block.kind.vehicle_state(), window, reason, actor, block.id);
        }
        self.commit(&mut lock, txn).await?;
        info!(block_id = %block.id, vehicle_id = %block.vehicle_id, kind = %block.kind, status = %block.status, "block created");
        Ok(block)
    }

    /// Lift an active block now.
    pub async fn end_block(&self, id: Ulid, actor: &str) -> Result<Block, EngineError> {
        self.finish_block(id, BlockStatus::Ended, actor).await
    }

    /// Withdraw a block. Scheduled blocks leave no ledger trace; active ones end now.
    pub async fn cancel_block(&self, id: Ulid, actor: &str) -> Result<Block, EngineError> {
        self.finish_block(id, BlockStatus::Cancelled, actor).await
    }

    async fn finish_block(&self, id: Ulid, to: BlockStatus, actor: &str) -> Result<Block, EngineError> {
        let vehicle_id = self.resolve_vehicle("block", id)?;
        self.authorize(actor, Action::ManageBlock, vehicle_id)?;
        let mut lock = self.lock_vehicle(vehicle_id).await?;
        let now = self.now();
        let mut txn = Txn::begin(&lock);
        ledger::activate_due(&mut txn, now)?;

        let current = txn
            .staged
            .block(id)
            .cloned()
            .ok_or(EngineError::not_found("block", id))?;
        let finished = match (current.status, to) {
            (BlockStatus::Scheduled, BlockStatus::Cancelled) => {
                ledger::delete_audit_rows(&mut txn, id);
                Block {
                    status: BlockStatus::Cancelled,
                    ..current
                }
            }
            (BlockStatus::Active, _) => {
                let verb = to.as_str();
                ledger::release_state(
                    &mut txn,
                    current.kind.vehicle_state(),
                    now,
                    verb,
                    format!("{} {} {verb}", current.kind, current.id),
                    actor,
                )?;
                Block {
                    status: to,
                    end_at: Some(current.end_at.map_or(now, |end| end.min(now))),
                    ..current
                }
            }
            (status, _) => {
                return Err(EngineError::validation(
                    "status",
                    format!("cannot move a {status} block to {to}"),
                ));
            }
        };
        txn.record(Event::BlockWritten(finished.clone()));
        self.commit(&mut lock, txn).await?;
        info!(block_id = %id, status = %finished.status, "block finished");
        Ok(finished)
    }
}
