use chrono::NaiveDate;
use rust_decimal::Decimal;
use tracing::info;
use ulid::Ulid;

use crate::collab::Action;
use crate::model::*;
use crate::pricing::{local_date, percent_of};

use super::{Engine, EngineError, Txn, ledger};

impl Engine {
    pub async fn set_fee_rate(&self, rate: FeeRate, actor: &str) -> Result<FeeRate, EngineError> {
        self.authorize(actor, Action::ManageFeeRate, rate.organization_id)?;
        if rate.percent < Decimal::ZERO || rate.percent > Decimal::ONE_HUNDRED {
            return Err(EngineError::validation("percent", "must be between 0 and 100"));
        }
        if let Some(to) = rate.effective_to
            && to < rate.effective_from
        {
            return Err(EngineError::validation("effective_to", "ends before it starts"));
        }
        self.commit_global(vec![Event::FeeRateWritten(rate.clone())]).await?;
        Ok(rate)
    }

    /// The organization's rate on `date`: latest `effective_from` among the
    /// covering rows, later id on a tie.
    pub fn fee_rate_at(&self, organization_id: Ulid, date: NaiveDate) -> Option<FeeRate> {
        self.fee_rates.get(&organization_id).and_then(|rates| {
            rates
                .iter()
                .filter(|r| r.covers(date))
                .max_by(|a, b| a.effective_from.cmp(&b.effective_from).then(a.id.cmp(&b.id)))
                .cloned()
        })
    }

    pub fn fee_rates(&self, organization_id: Ulid) -> Vec<FeeRate> {
        self.fee_rates
            .get(&organization_id)
            .map(|r| r.value().clone())
            .unwrap_or_default()
    }

    /// Freeze the admin fee onto a closed rental. A second call is a no-op.
    pub async fn snapshot_fee(&self, rental_id: Ulid, as_of: Option<NaiveDate>, actor: &str) -> Result<Rental, EngineError> {
        let vehicle_id = self.resolve_vehicle("rental", rental_id)?;
        self.authorize(actor, Action::SnapshotFee, vehicle_id)?;
        let mut lock = self.lock_vehicle(vehicle_id).await?;
        let mut txn = Txn::begin(&lock);
        ledger::activate_due(&mut txn, self.now())?;

        let current = txn
            .staged
            .rental(rental_id)
            .cloned()
            .ok_or(EngineError::not_found("rental", rental_id))?;
        if current.status != RentalStatus::Closed {
            return Err(EngineError::validation(
                "status",
                format!("fees are snapshotted on closed rentals, this one is {}", current.status),
            ));
        }
        let snapshot = self.with_fee_snapshot(&txn.staged, current.clone(), as_of)?;
        if snapshot != current {
            txn.record(Event::RentalWritten(snapshot.clone()));
        }
        self.commit(&mut lock, txn).await?;
        Ok(snapshot)
    }

    /// Fill in the fee percent and amount unless they are already set.
    pub(super) fn with_fee_snapshot(
        &self,
        tl: &VehicleTimeline,
        rental: Rental,
        as_of: Option<NaiveDate>,
    ) -> Result<Rental, EngineError> {
        if rental.admin_fee_percent.is_some() && rental.admin_fee_amount_cents.is_some() {
            return Ok(rental);
        }
        let date = match as_of {
            Some(date) => date,
            None => local_date(rental.actual_return_at.unwrap_or_else(|| self.now()), self.tz)?,
        };
        let percent = self
            .fee_rate_at(rental.organization_id, date)
            .map(|r| r.percent)
            .unwrap_or(Decimal::ZERO);
        let base: i64 = tl
            .charges
            .iter()
            .filter(|c| c.rental_id == rental.id && c.commissionable)
            .map(|c| c.amount_cents)
            .sum();
        let amount = percent_of(base, percent)?;
        info!(rental_id = %rental.id, %percent, amount, %date, "admin fee snapshotted");
        Ok(Rental {
            admin_fee_percent: Some(percent),
            admin_fee_amount_cents: Some(amount),
            ..rental
        })
    }
}
