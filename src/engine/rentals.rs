use chrono::{Days, NaiveTime, TimeZone};
use tracing::{info, warn};
use ulid::Ulid;

use crate::collab::Action;
use crate::limits::MAX_TEXT_LEN;
use crate::model::*;

use super::conflict::{ensure_no_conflicts, rental_conflicts, validate_instant, validate_text, validate_window};
use super::{ConflictRef, Engine, EngineError, Txn, ledger};

#[derive(Debug, Clone)]
pub struct NewRental {
    pub id: Ulid,
    pub organization_id: Ulid,
    pub vehicle_id: Ulid,
    /// Covering assignment. Looked up when absent.
    pub assignment_id: Option<Ulid>,
    pub customer_id: Option<Ulid>,
    pub second_driver_id: Option<Ulid>,
    pub planned_pickup_at: Ms,
    pub planned_return_at: Ms,
    pub pickup_location_id: Option<Ulid>,
    pub return_location_id: Option<Ulid>,
    /// `draft` or `reserved`.
    pub status: RentalStatus,
}

/// Edits to a draft or reserved rental. `None` leaves a field unchanged;
/// `Some(None)` clears a nullable one.
#[derive(Debug, Clone, Default)]
pub struct RentalAmendment {
    pub planned_pickup_at: Option<Ms>,
    pub planned_return_at: Option<Ms>,
    pub customer_id: Option<Option<Ulid>>,
    pub second_driver_id: Option<Option<Ulid>>,
    pub pickup_location_id: Option<Option<Ulid>>,
    pub return_location_id: Option<Option<Ulid>>,
}

impl RentalAmendment {
    pub fn is_empty(&self) -> bool {
        self.planned_pickup_at.is_none()
            && self.planned_return_at.is_none()
            && self.customer_id.is_none()
            && self.second_driver_id.is_none()
            && self.pickup_location_id.is_none()
            && self.return_location_id.is_none()
    }
}

impl Engine {
    pub async fn create_rental(&self, new: NewRental, actor: &str) -> Result<Rental, EngineError> {
        self.authorize(actor, Action::CreateRental, new.vehicle_id)?;
        let window = validate_window("planned_return_at", new.planned_pickup_at, Some(new.planned_return_at))?;
        if !matches!(new.status, RentalStatus::Draft | RentalStatus::Reserved) {
            return Err(EngineError::validation(
                "status",
                format!("a rental starts as draft or reserved, not {}", new.status),
            ));
        }
        if self.entity_to_vehicle.contains_key(&new.id) {
            return Err(EngineError::AlreadyExists {
                entity: "rental",
                key: new.id.to_string(),
            });
        }

        let _drivers = self
            .lock_drivers(new.customer_id.into_iter().chain(new.second_driver_id))
            .await;
        let mut lock = self.lock_vehicle(new.vehicle_id).await?;
        let mut txn = Txn::begin(&lock);
        ledger::activate_due(&mut txn, self.now())?;
        if !txn.staged.vehicle.active {
            return Err(EngineError::validation("vehicle_id", "vehicle is archived"));
        }

        let mut rental = Rental {
            id: new.id,
            organization_id: new.organization_id,
            vehicle_id: new.vehicle_id,
            assignment_id: Ulid::nil(),
            customer_id: new.customer_id,
            second_driver_id: new.second_driver_id,
            planned_pickup_at: window.start,
            planned_return_at: new.planned_return_at,
            actual_pickup_at: None,
            actual_return_at: None,
            pickup_location_id: new.pickup_location_id,
            return_location_id: new.return_location_id,
            status: new.status,
            number_id: 0,
            admin_fee_percent: None,
            admin_fee_amount_cents: None,
            final_amount_override_cents: None,
            created_by: actor.to_string(),
        };
        rental.assignment_id = self.check_rental(&txn.staged, &rental, new.assignment_id)?;

        rental.number_id = self.reserve_contract_number(rental.organization_id);
        txn.record(Event::RentalWritten(rental.clone()));
        txn.record(Event::ContractNumberIssued(ContractNumber {
            organization_id: rental.organization_id,
            rental_id: rental.id,
            number_id: rental.number_id,
            created_by: actor.to_string(),
        }));
        self.commit(&mut lock, txn).await?;
        metrics::counter!(crate::observability::RENTALS_TOTAL, "outcome" => "created").increment(1);
        info!(rental_id = %rental.id, vehicle_id = %rental.vehicle_id, number = rental.number_id, "rental created");
        Ok(rental)
    }

    /// Re-plan a draft or reserved rental. Every creation check runs again
    /// with the rental itself excluded.
    pub async fn amend_rental(&self, id: Ulid, amendment: RentalAmendment, actor: &str) -> Result<Rental, EngineError> {
        let vehicle_id = self.resolve_vehicle("rental", id)?;
        self.authorize(actor, Action::UpdateRental, vehicle_id)?;
        let named = amendment
            .customer_id
            .flatten()
            .into_iter()
            .chain(amendment.second_driver_id.flatten());
        let mut locked: Vec<Ulid> = self.rental(id).await?.drivers().chain(named).collect();
        // The drivers can change between the read above and the vehicle lock;
        // retry until every driver the amended rental keeps is held.
        let (_drivers, mut lock, mut txn, current) = loop {
            let drivers = self.lock_drivers(locked.iter().copied()).await;
            let lock = self.lock_vehicle(vehicle_id).await?;
            let mut txn = Txn::begin(&lock);
            ledger::activate_due(&mut txn, self.now())?;
            let current = txn
                .staged
                .rental(id)
                .cloned()
                .ok_or(EngineError::not_found("rental", id))?;
            let missing: Vec<Ulid> = current.drivers().filter(|d| !locked.contains(d)).collect();
            if missing.is_empty() {
                break (drivers, lock, txn, current);
            }
            locked.extend(missing);
        };
        if !current.status.is_editable() {
            return Err(EngineError::validation(
                "status",
                format!("a {} rental can no longer be edited", current.status),
            ));
        }
        let mut amended = current.clone();
        if let Some(at) = amendment.planned_pickup_at {
            amended.planned_pickup_at = at;
        }
        if let Some(at) = amendment.planned_return_at {
            amended.planned_return_at = at;
        }
        if let Some(customer) = amendment.customer_id {
            amended.customer_id = customer;
        }
        if let Some(driver) = amendment.second_driver_id {
            amended.second_driver_id = driver;
        }
        if let Some(loc) = amendment.pickup_location_id {
            amended.pickup_location_id = loc;
        }
        if let Some(loc) = amendment.return_location_id {
            amended.return_location_id = loc;
        }
        if amended == current {
            return Ok(current);
        }
        validate_window("planned_return_at", amended.planned_pickup_at, Some(amended.planned_return_at))?;
        amended.assignment_id = self.check_rental(&txn.staged, &amended, None)?;

        txn.record(Event::RentalWritten(amended.clone()));
        self.commit(&mut lock, txn).await?;
        info!(rental_id = %id, "rental amended");
        Ok(amended)
    }

    /// Creation checks, in order: customer records, vehicle overlap, driver
    /// overlap, license coverage, covering assignment. Returns the covering
    /// assignment's id.
    fn check_rental(
        &self,
        tl: &VehicleTimeline,
        rental: &Rental,
        requested_assignment: Option<Ulid>,
    ) -> Result<Ulid, EngineError> {
        if rental.status == RentalStatus::Reserved && rental.customer_id.is_none() {
            return Err(EngineError::validation("customer_id", "a reserved rental needs a customer"));
        }
        if rental.second_driver_id.is_some() && rental.second_driver_id == rental.customer_id {
            return Err(EngineError::validation(
                "second_driver_id",
                "second driver must differ from the customer",
            ));
        }
        let mut drivers = Vec::new();
        for (field, driver_id) in [
            ("customer_id", rental.customer_id),
            ("second_driver_id", rental.second_driver_id),
        ] {
            let Some(driver_id) = driver_id else { continue };
            let driver = self
                .customer(&driver_id)
                .ok_or(EngineError::not_found("customer", driver_id))?;
            if driver.organization_id != rental.organization_id {
                return Err(EngineError::validation(field, "customer belongs to another organization"));
            }
            drivers.push(driver);
        }

        let window = rental.window();
        let vehicle_conflicts = rental_conflicts(tl, &window, Some(rental.id));
        if !vehicle_conflicts.is_empty() {
            metrics::counter!(crate::observability::RENTALS_TOTAL, "outcome" => "conflict").increment(1);
            warn!(vehicle_id = %rental.vehicle_id, %window, "rental overlaps another rental of the vehicle");
        }
        ensure_no_conflicts(vehicle_conflicts)?;

        for driver in &drivers {
            ensure_no_conflicts(self.driver_conflicts(driver.id, &window, rental.id))?;
        }
        for driver in &drivers {
            self.check_license(driver, rental.planned_return_at)?;
        }

        covering_assignment(tl, rental, requested_assignment)
    }

    /// Other calendar-blocking rentals of `driver` overlapping `window`, on any vehicle.
    fn driver_conflicts(&self, driver: Ulid, window: &Window, exclude: Ulid) -> Vec<ConflictRef> {
        self.driver_bookings
            .get(&driver)
            .map(|bookings| {
                bookings
                    .iter()
                    .filter(|b| b.rental_id != exclude && b.window.overlaps(window))
                    .map(|b| ConflictRef {
                        id: b.rental_id,
                        kind: "driver rental",
                        start: b.window.start,
                        end: b.window.end,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The license must be valid through the end of its expiry day, in the tenant zone.
    fn check_license(&self, driver: &Customer, planned_return_at: Ms) -> Result<(), EngineError> {
        let Some(expires_on) = driver.driver_license_expires_on else {
            return Ok(());
        };
        let next_day = expires_on
            .checked_add_days(Days::new(1))
            .ok_or(EngineError::LimitExceeded("license date out of range"))?
            .and_time(NaiveTime::MIN);
        let cutoff = self
            .tz
            .from_local_datetime(&next_day)
            .earliest()
            .map(|dt| dt.timestamp_millis())
            .unwrap_or_else(|| next_day.and_utc().timestamp_millis());
        if planned_return_at >= cutoff {
            return Err(EngineError::LicenseExpired {
                driver_id: driver.id,
                expires_on,
                planned_return_at,
            });
        }
        Ok(())
    }

    fn reserve_contract_number(&self, organization_id: Ulid) -> u64 {
        let mut last = self.contract_counters.entry(organization_id).or_insert(0);
        *last += 1;
        *last
    }

    /// Move a rental through its state machine, applying ledger side effects.
    pub async fn transition_rental(
        &self,
        id: Ulid,
        to: RentalStatus,
        at: Option<Ms>,
        actor: &str,
    ) -> Result<Rental, EngineError> {
        let vehicle_id = self.resolve_vehicle("rental", id)?;
        self.authorize(actor, Action::TransitionRental, vehicle_id)?;
        if let Some(at) = at {
            validate_instant(at)?;
        }
        let mut lock = self.lock_vehicle(vehicle_id).await?;
        let now = self.now();
        let at = at.unwrap_or(now);
        let mut txn = Txn::begin(&lock);
        ledger::activate_due(&mut txn, now)?;

        let current = txn
            .staged
            .rental(id)
            .cloned()
            .ok_or(EngineError::not_found("rental", id))?;
        if !can_transition(&current, to) {
            let message = match transition_precondition(&current, to) {
                Err(why) if current.status.allowed_next().contains(&to) => why.to_string(),
                _ => format!("cannot move a rental from {} to {to}", current.status),
            };
            return Err(EngineError::validation("status", message));
        }

        let mut next = Rental {
            status: to,
            ..current.clone()
        };
        match to {
            RentalStatus::Reserved => {
                if let Some(driver) = current.customer_id.and_then(|c| self.customer(&c)) {
                    self.check_license(&driver, current.planned_return_at)?;
                }
            }
            RentalStatus::CheckedOut => {
                let assignment = txn.staged.assignment(current.assignment_id);
                if assignment.map(|a| a.status) != Some(AssignmentStatus::Active) {
                    return Err(EngineError::validation(
                        "assignment_id",
                        "the covering assignment is not active",
                    ));
                }
                next.actual_pickup_at = Some(at);
                ledger::open_state_clamped(
                    &mut txn,
                    VehicleStateKind::Rented,
                    at,
                    format!("rental {} checked out", current.number_id),
                    actor,
                    Some(id),
                )?;
            }
            RentalStatus::CheckedIn => {
                if let Some(pickup) = current.actual_pickup_at
                    && at < pickup
                {
                    return Err(EngineError::validation(
                        "actual_return_at",
                        format!("{} is before pickup {}", fmt_ms(at), fmt_ms(pickup)),
                    ));
                }
                next.actual_return_at = Some(at);
                let closed = ledger::close_state(&mut txn, VehicleStateKind::Rented, at, "returned")?;
                let covering_active = txn
                    .staged
                    .assignment(current.assignment_id)
                    .is_some_and(|a| a.status == AssignmentStatus::Active);
                // A manual state opened while the car was out stays current.
                let released = closed.is_some() || ledger::current_state(&txn.staged)?.is_none();
                if released {
                    let (state, source_id) = if covering_active {
                        (VehicleStateKind::Assigned, Some(current.assignment_id))
                    } else {
                        (VehicleStateKind::Available, None)
                    };
                    ledger::open_state_clamped(
                        &mut txn,
                        state,
                        at,
                        format!("rental {} returned", current.number_id),
                        actor,
                        source_id,
                    )?;
                }
            }
            RentalStatus::Closed => {
                next = self.with_fee_snapshot(&txn.staged, next, None)?;
            }
            RentalStatus::Draft
            | RentalStatus::InUse
            | RentalStatus::Cancelled
            | RentalStatus::NoShow => {}
        }

        txn.record(Event::RentalWritten(next.clone()));
        self.commit(&mut lock, txn).await?;
        metrics::counter!(crate::observability::RENTAL_TRANSITIONS_TOTAL, "to" => to.as_str()).increment(1);
        info!(rental_id = %id, from = %current.status, %to, "rental transitioned");
        Ok(next)
    }

    pub async fn add_charge(
        &self,
        rental_id: Ulid,
        description: &str,
        amount_cents: i64,
        commissionable: bool,
        actor: &str,
    ) -> Result<ChargeLine, EngineError> {
        validate_text("description", description, MAX_TEXT_LEN)?;
        let vehicle_id = self.resolve_vehicle("rental", rental_id)?;
        self.authorize(actor, Action::AddCharge, vehicle_id)?;
        let mut lock = self.lock_vehicle(vehicle_id).await?;
        let mut txn = Txn::begin(&lock);
        ledger::activate_due(&mut txn, self.now())?;

        let rental = txn
            .staged
            .rental(rental_id)
            .ok_or(EngineError::not_found("rental", rental_id))?;
        if matches!(
            rental.status,
            RentalStatus::Closed | RentalStatus::Cancelled | RentalStatus::NoShow
        ) {
            return Err(EngineError::validation(
                "rental_id",
                format!("cannot charge a {} rental", rental.status),
            ));
        }
        let charge = ChargeLine {
            id: Ulid::new(),
            rental_id,
            vehicle_id,
            description: description.to_string(),
            amount_cents,
            commissionable,
            created_by: actor.to_string(),
        };
        txn.record(Event::ChargeAdded(charge.clone()));
        self.commit(&mut lock, txn).await?;
        Ok(charge)
    }

    pub async fn set_final_amount_override(
        &self,
        rental_id: Ulid,
        amount_cents: Option<i64>,
        actor: &str,
    ) -> Result<Rental, EngineError> {
        if amount_cents.is_some_and(|a| a < 0) {
            return Err(EngineError::validation("final_amount_override", "must not be negative"));
        }
        let vehicle_id = self.resolve_vehicle("rental", rental_id)?;
        self.authorize(actor, Action::UpdateRental, vehicle_id)?;
        let mut lock = self.lock_vehicle(vehicle_id).await?;
        let mut txn = Txn::begin(&lock);
        ledger::activate_due(&mut txn, self.now())?;

        let current = txn
            .staged
            .rental(rental_id)
            .cloned()
            .ok_or(EngineError::not_found("rental", rental_id))?;
        if !current.status.blocks_calendar() {
            return Err(EngineError::validation(
                "status",
                format!("cannot price a {} rental", current.status),
            ));
        }
        let updated = Rental {
            final_amount_override_cents: amount_cents,
            ..current
        };
        txn.record(Event::RentalWritten(updated.clone()));
        self.commit(&mut lock, txn).await?;
        Ok(updated)
    }
}

/// A live assignment of the vehicle to the rental's organization whose
/// window contains the rental's planned window.
fn covering_assignment(tl: &VehicleTimeline, rental: &Rental, requested: Option<Ulid>) -> Result<Ulid, EngineError> {
    let window = rental.window();
    let covers = |a: &Assignment| {
        a.status.is_live() && a.renter_org_id == rental.organization_id && a.window().contains_window(&window)
    };
    match requested {
        Some(id) => match tl.assignment(id) {
            Some(a) if covers(a) => Ok(a.id),
            Some(_) => Err(EngineError::validation(
                "assignment_id",
                format!("assignment {id} does not cover {window} for this organization"),
            )),
            None => Err(EngineError::not_found("assignment", id)),
        },
        None => tl
            .assignments
            .iter()
            .find(|a| covers(a))
            .map(|a| a.id)
            .ok_or_else(|| {
                EngineError::validation(
                    "assignment_id",
                    format!("no live assignment to organization {} covers {window}", rental.organization_id),
                )
            }),
    }
}
