mod assignments;
mod blocks;
mod conflict;
mod error;
mod fees;
mod ledger;
mod pricelists;
mod queries;
mod rentals;
mod vehicles;

pub use assignments::{AssignOutcome, AssignRequest};
pub use blocks::NewBlock;
pub use error::{ConflictRef, EngineError};
pub use pricelists::{NewPriceList, NewSeason, NewTier};
pub use queries::{AssignmentFilter, BlockFilter, RentalFilter};
pub use rentals::{NewRental, RentalAmendment};
pub use vehicles::NewVehicle;

use std::io;
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::Arc;

use chrono_tz::Tz;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use tracing::warn;
use ulid::Ulid;

use crate::collab::{Action, AllowAll, Authorizer, Clock, SystemClock};
use crate::limits::MAX_ROWS_PER_VEHICLE;
use crate::model::*;
use crate::wal::Wal;

pub type SharedTimeline = Arc<RwLock<VehicleTimeline>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        records: Vec<Vec<Event>>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Vec<Event>, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders with the shared result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { events, response } => {
                let mut batch = vec![(events, response)];

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { events, response }) => {
                            batch.push((events, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (events, _) in batch {
        if let Err(e) = wal.append_buffered(events) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even on append error so buffered bytes don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { records, response } => {
            let result = Wal::write_compact_file(wal.path(), &records)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

// ── Engine ───────────────────────────────────────────────

pub struct EngineOptions {
    pub clock: Arc<dyn Clock>,
    pub authorizer: Arc<dyn Authorizer>,
    /// Zone for calendar rules: seasons, weekends, license expiry, fee dates.
    pub time_zone: Tz,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            clock: Arc::new(SystemClock),
            authorizer: Arc::new(AllowAll),
            time_zone: Tz::UTC,
        }
    }
}

/// A calendar-blocking rental as seen from one of its drivers.
#[derive(Debug, Clone, Copy)]
pub(super) struct DriverBooking {
    pub rental_id: Ulid,
    pub vehicle_id: Ulid,
    pub window: Window,
}

pub struct Engine {
    pub(super) vehicles: DashMap<Ulid, SharedTimeline>,
    /// Upper-cased plate → vehicle.
    pub(super) plates: DashMap<String, Ulid>,
    pub(super) vins: DashMap<String, Ulid>,
    pub(super) customers: DashMap<Ulid, Customer>,
    /// Driver → calendar-blocking rentals. Read without vehicle locks.
    pub(super) driver_bookings: DashMap<Ulid, Vec<DriverBooking>>,
    /// Rental → drivers it was last indexed under.
    pub(super) rental_drivers: DashMap<Ulid, Vec<Ulid>>,
    /// Serializes rental writes per driver across vehicles. Taken before
    /// any vehicle lock, in id order.
    pub(super) driver_locks: DashMap<Ulid, Arc<Mutex<()>>>,
    pub(super) fee_rates: DashMap<Ulid, Vec<FeeRate>>,
    /// Organization → issued contract numbers, in issue order.
    pub(super) contract_ledgers: DashMap<Ulid, Vec<ContractNumber>>,
    /// Organization → last reserved contract number.
    pub(super) contract_counters: DashMap<Ulid, u64>,
    /// Reverse lookup: assignment/block/rental/price list id → vehicle id.
    pub(super) entity_to_vehicle: DashMap<Ulid, Ulid>,
    /// Mutations hold this shared; compaction holds it exclusively so the
    /// snapshot never misses a commit in flight.
    pub(super) commit_gate: Arc<RwLock<()>>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) authorizer: Arc<dyn Authorizer>,
    pub(super) tz: Tz,
}

/// Write access to one vehicle's rows for the length of a transaction.
pub(super) struct VehicleLock {
    _gate: OwnedRwLockReadGuard<()>,
    timeline: OwnedRwLockWriteGuard<VehicleTimeline>,
}

impl Deref for VehicleLock {
    type Target = VehicleTimeline;

    fn deref(&self) -> &VehicleTimeline {
        &self.timeline
    }
}

impl DerefMut for VehicleLock {
    fn deref_mut(&mut self) -> &mut VehicleTimeline {
        &mut self.timeline
    }
}

/// Changes staged against a copy of a vehicle's rows. Dropping it is a rollback.
pub(super) struct Txn {
    pub staged: VehicleTimeline,
    pub events: Vec<Event>,
}

impl Txn {
    pub fn begin(timeline: &VehicleTimeline) -> Self {
        Self {
            staged: timeline.clone(),
            events: Vec::new(),
        }
    }

    pub fn record(&mut self, event: Event) {
        self.staged.apply(&event);
        self.events.push(event);
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, options: EngineOptions) -> io::Result<Self> {
        let records = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            vehicles: DashMap::new(),
            plates: DashMap::new(),
            vins: DashMap::new(),
            customers: DashMap::new(),
            driver_bookings: DashMap::new(),
            rental_drivers: DashMap::new(),
            driver_locks: DashMap::new(),
            fee_rates: DashMap::new(),
            contract_ledgers: DashMap::new(),
            contract_counters: DashMap::new(),
            entity_to_vehicle: DashMap::new(),
            commit_gate: Arc::new(RwLock::new(())),
            wal_tx,
            clock: options.clock,
            authorizer: options.authorizer,
            tz: options.time_zone,
        };

        // We're the sole owner of these Arcs, so try_write always succeeds.
        // Never use blocking_write here: this may run inside an async context
        // (lazy tenant creation).
        for record in &records {
            for event in record {
                if let Event::VehicleRegistered(v) = event {
                    engine
                        .vehicles
                        .entry(v.id)
                        .or_insert_with(|| Arc::new(RwLock::new(VehicleTimeline::new(v.clone()))));
                }
                if let Some(vehicle_id) = event.vehicle_id()
                    && let Some(entry) = engine.vehicles.get(&vehicle_id)
                {
                    let timeline = entry.value().clone();
                    let mut guard = timeline.try_write().expect("replay: uncontended write");
                    guard.apply(event);
                }
                engine.index_event(event);
            }
        }

        Ok(engine)
    }

    pub fn now(&self) -> Ms {
        self.clock.now()
    }

    pub fn time_zone(&self) -> Tz {
        self.tz
    }

    pub(super) fn authorize(&self, actor: &str, action: Action, resource: Ulid) -> Result<(), EngineError> {
        if self.authorizer.can(actor, action, resource) {
            Ok(())
        } else {
            warn!(actor, action = action.as_str(), %resource, "forbidden");
            Err(EngineError::Forbidden {
                actor: actor.to_string(),
                action: action.as_str(),
            })
        }
    }

    /// Write one transaction to the WAL via the background group-commit writer.
    async fn wal_append(&self, events: &[Event]) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                events: events.to_vec(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn timeline(&self, vehicle_id: &Ulid) -> Option<SharedTimeline> {
        self.vehicles.get(vehicle_id).map(|e| e.value().clone())
    }

    pub fn vehicle_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_vehicle.get(entity_id).map(|e| *e.value())
    }

    pub(super) async fn lock_vehicle(&self, vehicle_id: Ulid) -> Result<VehicleLock, EngineError> {
        let gate = self.commit_gate.clone().read_owned().await;
        let timeline = self
            .timeline(&vehicle_id)
            .ok_or(EngineError::not_found("vehicle", vehicle_id))?;
        Ok(VehicleLock {
            _gate: gate,
            timeline: timeline.write_owned().await,
        })
    }

    /// Hold every given driver's lock until the guards drop.
    pub(super) async fn lock_drivers(&self, drivers: impl IntoIterator<Item = Ulid>) -> Vec<OwnedMutexGuard<()>> {
        let mut ids: Vec<Ulid> = drivers.into_iter().collect();
        ids.sort();
        ids.dedup();
        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            let mutex = self.driver_locks.entry(id).or_default().clone();
            guards.push(mutex.lock_owned().await);
        }
        guards
    }

    /// Lookup entity → owning vehicle.
    pub(super) fn resolve_vehicle(&self, entity: &'static str, entity_id: Ulid) -> Result<Ulid, EngineError> {
        self.vehicle_for_entity(&entity_id)
            .ok_or(EngineError::not_found(entity, entity_id))
    }

    /// Make a staged vehicle transaction durable, then visible.
    pub(super) async fn commit(&self, lock: &mut VehicleLock, txn: Txn) -> Result<(), EngineError> {
        let Txn { staged, events } = txn;
        if events.is_empty() {
            return Ok(());
        }
        if staged.row_count() > MAX_ROWS_PER_VEHICLE {
            return Err(EngineError::LimitExceeded("too many rows on vehicle"));
        }
        ledger::check_single_open(&staged)?;
        self.wal_append(&events).await?;
        for event in &events {
            self.index_event(event);
        }
        **lock = staged;
        Ok(())
    }

    /// Commit events that touch no vehicle rows.
    pub(super) async fn commit_global(&self, events: Vec<Event>) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        self.wal_append(&events).await?;
        for event in &events {
            self.index_event(event);
        }
        Ok(())
    }

    /// Keep the global maps in step with a committed event.
    fn index_event(&self, event: &Event) {
        match event {
            Event::VehicleRegistered(v) => {
                self.plates.insert(normalize_key(&v.plate), v.id);
                if let Some(vin) = &v.vin {
                    self.vins.insert(normalize_key(vin), v.id);
                }
            }
            Event::AssignmentWritten(a) => {
                self.entity_to_vehicle.insert(a.id, a.vehicle_id);
            }
            Event::BlockWritten(b) => {
                self.entity_to_vehicle.insert(b.id, b.vehicle_id);
            }
            Event::AssignmentDeleted { id, .. } | Event::BlockDeleted { id, .. } => {
                self.entity_to_vehicle.remove(id);
            }
            Event::RentalWritten(r) => {
                self.entity_to_vehicle.insert(r.id, r.vehicle_id);
                self.index_rental_drivers(r);
            }
            Event::PriceListWritten(p) => {
                self.entity_to_vehicle.insert(p.id, p.vehicle_id);
            }
            Event::CustomerWritten(c) => {
                self.customers.insert(c.id, c.clone());
            }
            Event::FeeRateWritten(rate) => {
                let mut rates = self.fee_rates.entry(rate.organization_id).or_default();
                rates.retain(|r| r.id != rate.id);
                rates.push(rate.clone());
            }
            Event::ContractNumberIssued(entry) => {
                self.contract_counters
                    .entry(entry.organization_id)
                    .and_modify(|n| *n = (*n).max(entry.number_id))
                    .or_insert(entry.number_id);
                self.contract_ledgers
                    .entry(entry.organization_id)
                    .or_default()
                    .push(entry.clone());
            }
            Event::VehicleUpdated(_)
            | Event::StateWritten(_)
            | Event::StateDeleted { .. }
            | Event::ChargeAdded(_) => {}
        }
    }

    fn index_rental_drivers(&self, rental: &Rental) {
        if let Some((_, previous)) = self.rental_drivers.remove(&rental.id) {
            for driver in previous {
                if let Some(mut bookings) = self.driver_bookings.get_mut(&driver) {
                    bookings.retain(|b| b.rental_id != rental.id);
                }
            }
        }
        if !rental.status.blocks_calendar() {
            return;
        }
        let drivers: Vec<Ulid> = rental.drivers().collect();
        for driver in &drivers {
            self.driver_bookings.entry(*driver).or_default().push(DriverBooking {
                rental_id: rental.id,
                vehicle_id: rental.vehicle_id,
                window: rental.window(),
            });
        }
        self.rental_drivers.insert(rental.id, drivers);
    }

    /// Rewrite the WAL as the minimal set of records that recreates current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;
        let mut records = Vec::new();

        let customers: Vec<Event> = self
            .customers
            .iter()
            .map(|e| Event::CustomerWritten(e.value().clone()))
            .collect();
        if !customers.is_empty() {
            records.push(customers);
        }
        let rates: Vec<Event> = self
            .fee_rates
            .iter()
            .flat_map(|e| e.value().clone())
            .map(Event::FeeRateWritten)
            .collect();
        if !rates.is_empty() {
            records.push(rates);
        }

        let timelines: Vec<SharedTimeline> = self.vehicles.iter().map(|e| e.value().clone()).collect();
        for timeline in timelines {
            let tl = timeline.read().await;
            let mut events = vec![Event::VehicleRegistered(tl.vehicle.clone())];
            events.extend(tl.states.iter().cloned().map(Event::StateWritten));
            events.extend(tl.assignments.iter().cloned().map(Event::AssignmentWritten));
            events.extend(tl.blocks.iter().cloned().map(Event::BlockWritten));
            events.extend(tl.rentals.iter().cloned().map(Event::RentalWritten));
            events.extend(tl.charges.iter().cloned().map(Event::ChargeAdded));
            events.extend(tl.price_lists.iter().cloned().map(Event::PriceListWritten));
            records.push(events);
        }

        let contracts: Vec<Event> = self
            .contract_ledgers
            .iter()
            .flat_map(|e| e.value().clone())
            .map(Event::ContractNumberIssued)
            .collect();
        if !contracts.is_empty() {
            records.push(contracts);
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { records, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

pub(super) fn normalize_key(s: &str) -> String {
    s.trim().to_uppercase()
}
