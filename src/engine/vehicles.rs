use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use tokio::sync::RwLock;
use tracing::info;
use ulid::Ulid;

use crate::collab::Action;
use crate::limits::*;
use crate::model::*;

use super::conflict::{ensure_no_conflicts, validate_text};
use super::{ConflictRef, Engine, EngineError, Txn, ledger, normalize_key};

#[derive(Debug, Clone)]
pub struct NewVehicle {
    pub id: Ulid,
    pub admin_org_id: Ulid,
    pub plate: String,
    pub vin: Option<String>,
    pub make: String,
    pub model: String,
    pub year: u16,
    pub fuel_type: String,
    pub transmission: String,
    pub seats: u8,
    pub mileage: u64,
}

impl Engine {
    /// Add a vehicle to the fleet. It starts `available` at the current time.
    pub async fn register_vehicle(&self, new: NewVehicle, actor: &str) -> Result<Vehicle, EngineError> {
        self.authorize(actor, Action::RegisterVehicle, new.admin_org_id)?;
        if self.vehicles.len() >= MAX_VEHICLES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many vehicles"));
        }
        let plate = new.plate.trim().to_string();
        if plate.is_empty() {
            return Err(EngineError::validation("plate", "must not be empty"));
        }
        validate_text("plate", &plate, MAX_PLATE_LEN)?;
        if let Some(vin) = &new.vin {
            validate_text("vin", vin, MAX_PLATE_LEN)?;
        }
        for (field, value) in [
            ("make", &new.make),
            ("model", &new.model),
            ("fuel_type", &new.fuel_type),
            ("transmission", &new.transmission),
        ] {
            validate_text(field, value, MAX_TEXT_LEN)?;
        }
        if self.vehicles.contains_key(&new.id) {
            return Err(EngineError::AlreadyExists {
                entity: "vehicle",
                key: new.id.to_string(),
            });
        }

        let plate_key = normalize_key(&plate);
        let vin_key = new.vin.as_deref().map(normalize_key).filter(|v| !v.is_empty());

        let vehicle = Vehicle {
            id: new.id,
            admin_org_id: new.admin_org_id,
            plate,
            vin: vin_key.clone(),
            make: new.make,
            model: new.model,
            year: new.year,
            fuel_type: new.fuel_type,
            transmission: new.transmission,
            seats: new.seats,
            mileage: new.mileage,
            active: true,
            created_by: actor.to_string(),
        };

        let mut txn = Txn::begin(&VehicleTimeline::new(vehicle.clone()));
        txn.record(Event::VehicleRegistered(vehicle.clone()));
        ledger::open_state(
            &mut txn,
            VehicleStateKind::Available,
            self.now(),
            "registered".into(),
            actor,
            None,
        )?;

        self.reserve_identity(new.id, &plate_key, vin_key.as_deref())?;
        let _gate = self.commit_gate.read().await;
        if let Err(e) = self.wal_append(&txn.events).await {
            self.plates.remove(&plate_key);
            if let Some(vin) = &vin_key {
                self.vins.remove(vin);
            }
            return Err(e);
        }
        self.vehicles.insert(vehicle.id, Arc::new(RwLock::new(txn.staged)));
        for event in &txn.events {
            self.index_event(event);
        }
        info!(vehicle_id = %vehicle.id, plate = %vehicle.plate, "vehicle registered");
        Ok(vehicle)
    }

    /// Claim plate and VIN before the WAL write so a concurrent registration
    /// of the same plate loses.
    fn reserve_identity(&self, id: Ulid, plate: &str, vin: Option<&str>) -> Result<(), EngineError> {
        match self.plates.entry(plate.to_string()) {
            Entry::Occupied(_) => {
                return Err(EngineError::AlreadyExists {
                    entity: "plate",
                    key: plate.to_string(),
                });
            }
            Entry::Vacant(slot) => {
                slot.insert(id);
            }
        }
        if let Some(vin) = vin {
            match self.vins.entry(vin.to_string()) {
                Entry::Occupied(_) => {
                    self.plates.remove(plate);
                    return Err(EngineError::AlreadyExists {
                        entity: "vin",
                        key: vin.to_string(),
                    });
                }
                Entry::Vacant(slot) => {
                    slot.insert(id);
                }
            }
        }
        Ok(())
    }

    /// Odometer readings never go backwards.
    pub async fn record_mileage(&self, vehicle_id: Ulid, mileage: u64, actor: &str) -> Result<Vehicle, EngineError> {
        self.authorize(actor, Action::UpdateVehicle, vehicle_id)?;
        let mut lock = self.lock_vehicle(vehicle_id).await?;
        let mut txn = Txn::begin(&lock);
        ledger::activate_due(&mut txn, self.now())?;
        let current = txn.staged.vehicle.clone();
        if mileage < current.mileage {
            return Err(EngineError::validation(
                "mileage",
                format!("{mileage} is below the recorded {}", current.mileage),
            ));
        }
        let updated = Vehicle { mileage, ..current };
        txn.record(Event::VehicleUpdated(updated.clone()));
        self.commit(&mut lock, txn).await?;
        Ok(updated)
    }

    /// Soft delete. Refused while anything still occupies the vehicle's calendar.
    pub async fn archive_vehicle(&self, vehicle_id: Ulid, actor: &str) -> Result<Vehicle, EngineError> {
        self.authorize(actor, Action::UpdateVehicle, vehicle_id)?;
        let mut lock = self.lock_vehicle(vehicle_id).await?;
        let mut txn = Txn::begin(&lock);
        ledger::activate_due(&mut txn, self.now())?;

        let tl = &txn.staged;
        let mut live: Vec<ConflictRef> = Vec::new();
        live.extend(tl.assignments.iter().filter(|a| a.status.is_live()).map(|a| ConflictRef {
            id: a.id,
            kind: "assignment",
            start: a.start_at,
            end: a.end_at,
        }));
        live.extend(tl.blocks.iter().filter(|b| b.status.is_live()).map(|b| ConflictRef {
            id: b.id,
            kind: "block",
            start: b.start_at,
            end: b.end_at,
        }));
        live.extend(
            tl.rentals
                .iter()
                .filter(|r| r.status.blocks_calendar() && r.status != RentalStatus::Closed)
                .map(|r| ConflictRef {
                    id: r.id,
                    kind: "rental",
                    start: r.planned_pickup_at,
                    end: Some(r.planned_return_at),
                }),
        );
        ensure_no_conflicts(live)?;

        let archived = Vehicle {
            active: false,
            ..tl.vehicle.clone()
        };
        txn.record(Event::VehicleUpdated(archived.clone()));
        self.commit(&mut lock, txn).await?;
        info!(%vehicle_id, "vehicle archived");
        Ok(archived)
    }

    pub async fn upsert_customer(&self, customer: Customer, actor: &str) -> Result<(), EngineError> {
        self.authorize(actor, Action::ManageCustomer, customer.organization_id)?;
        validate_text("full_name", &customer.full_name, MAX_TEXT_LEN)?;
        if let Some(existing) = self.customers.get(&customer.id)
            && existing.organization_id != customer.organization_id
        {
            return Err(EngineError::validation(
                "organization_id",
                "customer belongs to another organization",
            ));
        }
        self.commit_global(vec![Event::CustomerWritten(customer)]).await
    }

    pub fn customer(&self, id: &Ulid) -> Option<Customer> {
        self.customers.get(id).map(|c| c.value().clone())
    }
}
