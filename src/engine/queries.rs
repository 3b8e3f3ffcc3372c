use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError, SharedTimeline, ledger, normalize_key};

/// Enumerated optional filters; every `Some`/non-empty field must match.
#[derive(Debug, Clone, Default)]
pub struct AssignmentFilter {
    pub vehicle_id: Option<Ulid>,
    pub renter_org_id: Option<Ulid>,
    pub statuses: Vec<AssignmentStatus>,
    pub window: Option<Window>,
}

impl AssignmentFilter {
    /// `a` must already carry its effective status.
    fn matches(&self, a: &Assignment) -> bool {
        self.vehicle_id.is_none_or(|v| a.vehicle_id == v)
            && self.renter_org_id.is_none_or(|o| a.renter_org_id == o)
            && (self.statuses.is_empty() || self.statuses.contains(&a.status))
            && self.window.is_none_or(|w| a.window().overlaps(&w))
    }
}

#[derive(Debug, Clone, Default)]
pub struct BlockFilter {
    pub vehicle_id: Option<Ulid>,
    pub organization_id: Option<Ulid>,
    pub statuses: Vec<BlockStatus>,
    pub window: Option<Window>,
}

impl BlockFilter {
    fn matches(&self, b: &Block) -> bool {
        self.vehicle_id.is_none_or(|v| b.vehicle_id == v)
            && self.organization_id.is_none_or(|o| b.organization_id == o)
            && (self.statuses.is_empty() || self.statuses.contains(&b.status))
            && self.window.is_none_or(|w| b.window().overlaps(&w))
    }
}

#[derive(Debug, Clone, Default)]
pub struct RentalFilter {
    pub vehicle_id: Option<Ulid>,
    pub organization_id: Option<Ulid>,
    /// Matches the customer or the second driver.
    pub driver_id: Option<Ulid>,
    pub statuses: Vec<RentalStatus>,
    pub window: Option<Window>,
}

impl RentalFilter {
    fn matches(&self, r: &Rental) -> bool {
        self.vehicle_id.is_none_or(|v| r.vehicle_id == v)
            && self.organization_id.is_none_or(|o| r.organization_id == o)
            && self.driver_id.is_none_or(|d| r.drivers().any(|x| x == d))
            && (self.statuses.is_empty() || self.statuses.contains(&r.status))
            && self.window.is_none_or(|w| r.window().overlaps(&w))
    }
}

impl Engine {
    /// Timelines to scan: one vehicle when given, else all of them.
    fn timelines(&self, vehicle_id: Option<Ulid>) -> Vec<SharedTimeline> {
        match vehicle_id {
            Some(id) => self.timeline(&id).into_iter().collect(),
            None => self.vehicles.iter().map(|e| e.value().clone()).collect(),
        }
    }

    async fn read_timeline<T>(
        &self,
        vehicle_id: Ulid,
        f: impl FnOnce(&VehicleTimeline) -> T,
    ) -> Result<T, EngineError> {
        let timeline = self
            .timeline(&vehicle_id)
            .ok_or(EngineError::not_found("vehicle", vehicle_id))?;
        let tl = timeline.read().await;
        Ok(f(&tl))
    }

    pub async fn vehicle(&self, id: Ulid) -> Result<Vehicle, EngineError> {
        self.read_timeline(id, |tl| tl.vehicle.clone()).await
    }

    pub async fn list_vehicles(&self) -> Vec<Vehicle> {
        let mut out = Vec::new();
        for timeline in self.timelines(None) {
            out.push(timeline.read().await.vehicle.clone());
        }
        out.sort_by_key(|v| v.id);
        out
    }

    pub fn vehicle_by_plate(&self, plate: &str) -> Option<Ulid> {
        self.plates.get(&normalize_key(plate)).map(|e| *e.value())
    }

    pub async fn current_state(&self, vehicle_id: Ulid) -> Result<Option<VehicleState>, EngineError> {
        self.read_timeline(vehicle_id, |tl| ledger::current_state(tl).map(|s| s.cloned()))
            .await?
    }

    pub async fn vehicle_states(&self, vehicle_id: Ulid) -> Result<Vec<VehicleState>, EngineError> {
        self.read_timeline(vehicle_id, |tl| tl.states.clone()).await
    }

    pub async fn assignment(&self, id: Ulid) -> Result<Assignment, EngineError> {
        let vehicle_id = self.resolve_vehicle("assignment", id)?;
        let now = self.now();
        self.read_timeline(vehicle_id, |tl| {
            tl.assignment(id).map(|a| Assignment {
                status: a.status_at(now),
                ..a.clone()
            })
        })
        .await?
        .ok_or(EngineError::not_found("assignment", id))
    }

    /// Assignments with their effective status, ordered by vehicle then start.
    pub async fn list_assignments(&self, filter: &AssignmentFilter) -> Vec<Assignment> {
        let now = self.now();
        let mut out = Vec::new();
        for timeline in self.timelines(filter.vehicle_id) {
            let tl = timeline.read().await;
            out.extend(
                tl.assignments
                    .iter()
                    .map(|a| Assignment {
                        status: a.status_at(now),
                        ..a.clone()
                    })
                    .filter(|a| filter.matches(a)),
            );
        }
        out.sort_by_key(|a| (a.vehicle_id, a.start_at, a.id));
        out
    }

    pub async fn block(&self, id: Ulid) -> Result<Block, EngineError> {
        let vehicle_id = self.resolve_vehicle("block", id)?;
        let now = self.now();
        self.read_timeline(vehicle_id, |tl| {
            tl.block(id).map(|b| Block {
                status: b.status_at(now),
                ..b.clone()
            })
        })
        .await?
        .ok_or(EngineError::not_found("block", id))
    }

    pub async fn list_blocks(&self, filter: &BlockFilter) -> Vec<Block> {
        let now = self.now();
        let mut out = Vec::new();
        for timeline in self.timelines(filter.vehicle_id) {
            let tl = timeline.read().await;
            out.extend(
                tl.blocks
                    .iter()
                    .map(|b| Block {
                        status: b.status_at(now),
                        ..b.clone()
                    })
                    .filter(|b| filter.matches(b)),
            );
        }
        out.sort_by_key(|b| (b.vehicle_id, b.start_at, b.id));
        out
    }

    pub async fn rental(&self, id: Ulid) -> Result<Rental, EngineError> {
        let vehicle_id = self.resolve_vehicle("rental", id)?;
        self.read_timeline(vehicle_id, |tl| tl.rental(id).cloned())
            .await?
            .ok_or(EngineError::not_found("rental", id))
    }

    pub async fn list_rentals(&self, filter: &RentalFilter) -> Vec<Rental> {
        let mut out = Vec::new();
        for timeline in self.timelines(filter.vehicle_id) {
            let tl = timeline.read().await;
            out.extend(tl.rentals.iter().filter(|r| filter.matches(r)).cloned());
        }
        out.sort_by_key(|r| (r.planned_pickup_at, r.id));
        out
    }

    pub async fn charges(&self, rental_id: Ulid) -> Result<Vec<ChargeLine>, EngineError> {
        let vehicle_id = self.resolve_vehicle("rental", rental_id)?;
        self.read_timeline(vehicle_id, |tl| {
            tl.charges
                .iter()
                .filter(|c| c.rental_id == rental_id)
                .cloned()
                .collect()
        })
        .await
    }

    pub async fn price_lists(&self, vehicle_id: Option<Ulid>) -> Vec<PriceList> {
        let mut out = Vec::new();
        for timeline in self.timelines(vehicle_id) {
            out.extend(timeline.read().await.price_lists.iter().cloned());
        }
        out.sort_by_key(|p| (p.vehicle_id, p.renter_org_id, p.version));
        out
    }

    pub async fn price_list(&self, id: Ulid) -> Result<PriceList, EngineError> {
        let vehicle_id = self.resolve_vehicle("price list", id)?;
        self.read_timeline(vehicle_id, |tl| tl.price_list(id).cloned())
            .await?
            .ok_or(EngineError::not_found("price list", id))
    }

    pub fn contract_ledger(&self, organization_id: Option<Ulid>) -> Vec<ContractNumber> {
        let mut out: Vec<ContractNumber> = match organization_id {
            Some(org) => self
                .contract_ledgers
                .get(&org)
                .map(|l| l.value().clone())
                .unwrap_or_default(),
            None => self
                .contract_ledgers
                .iter()
                .flat_map(|e| e.value().clone())
                .collect(),
        };
        out.sort_by_key(|c| (c.organization_id, c.number_id));
        out
    }

    pub fn list_customers(&self, organization_id: Option<Ulid>) -> Vec<Customer> {
        let mut out: Vec<Customer> = self
            .customers
            .iter()
            .filter(|c| organization_id.is_none_or(|o| c.organization_id == o))
            .map(|c| c.value().clone())
            .collect();
        out.sort_by_key(|c| c.id);
        out
    }
}
