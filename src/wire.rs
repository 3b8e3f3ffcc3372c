use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use rust_decimal::Decimal;
use tokio::net::TcpStream;
use tracing::debug;
use ulid::Ulid;

use crate::auth::FleetlineAuthSource;
use crate::engine::{AssignOutcome, ConflictRef, Engine, EngineError};
use crate::model::*;
use crate::observability;
use crate::pricing::Quote;
use crate::sql::{self, Command};
use crate::tenant::TenantManager;

pub struct FleetlineHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<FleetlineQueryParser>,
}

impl FleetlineHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(FleetlineQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("tenant error: {e}"),
            )))
        })
    }

    /// The login user acts as the principal for authorization.
    fn actor<C: ClientInfo>(client: &C) -> String {
        client
            .metadata()
            .get("user")
            .cloned()
            .unwrap_or_else(|| "anonymous".to_string())
    }

    async fn run<C: ClientInfo>(&self, client: &C, query: &str) -> PgWireResult<Vec<Response>> {
        let engine = self.resolve_engine(client)?;
        let actor = Self::actor(client);
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        debug!(command = label, %actor, "executing");

        let started = Instant::now();
        let result = self.execute_command(&engine, cmd, &actor).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result.map_err(engine_err)
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command, actor: &str) -> Result<Vec<Response>, EngineError> {
        let response = match cmd {
            Command::RegisterVehicle(new) => {
                engine.register_vehicle(new, actor).await?;
                inserted(1)
            }
            Command::RecordMileage { id, mileage } => {
                engine.record_mileage(id, mileage, actor).await?;
                updated(1)
            }
            Command::ArchiveVehicle { id } => {
                engine.archive_vehicle(id, actor).await?;
                updated(1)
            }
            Command::UpsertCustomer(customer) => {
                engine.upsert_customer(customer, actor).await?;
                inserted(1)
            }
            Command::OpenState {
                vehicle_id,
                state,
                started_at,
                reason,
            } => {
                engine.open_state(vehicle_id, state, started_at, &reason, actor).await?;
                inserted(1)
            }
            Command::CloseState {
                vehicle_id,
                state,
                ended_at,
                reason,
            } => {
                let closed = engine.close_state(vehicle_id, state, ended_at, &reason, actor).await?;
                updated(closed.map_or(0, |_| 1))
            }
            Command::Assign(req) => {
                engine.assign(req, actor).await?;
                inserted(1)
            }
            Command::AssignMany(reqs) => {
                let outcomes = engine.assign_many(reqs, actor).await?;
                encode_rows(schema("bulk_assign"), outcomes, encode_outcome)
            }
            Command::ExtendAssignment { id, end_at } => {
                engine.extend_assignment(id, end_at, actor).await?;
                updated(1)
            }
            Command::RevokeAssignment { id } => {
                engine.revoke_assignment(id, actor).await?;
                updated(1)
            }
            Command::CloseAssignment { id } => {
                engine.close_assignment(id, actor).await?;
                updated(1)
            }
            Command::CreateBlock(new) => {
                engine.create_block(new, actor).await?;
                inserted(1)
            }
            Command::FinishBlock { id, status } => {
                match status {
                    BlockStatus::Cancelled => engine.cancel_block(id, actor).await?,
                    _ => engine.end_block(id, actor).await?,
                };
                updated(1)
            }
            Command::CreateRental(new) => {
                engine.create_rental(new, actor).await?;
                inserted(1)
            }
            Command::AmendRental { id, amendment } => {
                engine.amend_rental(id, amendment, actor).await?;
                updated(1)
            }
            Command::TransitionRental { id, to, at } => {
                engine.transition_rental(id, to, at, actor).await?;
                updated(1)
            }
            Command::SetFinalAmount { id, amount_cents } => {
                engine.set_final_amount_override(id, amount_cents, actor).await?;
                updated(1)
            }
            Command::SnapshotFee { rental_id, as_of } => {
                engine.snapshot_fee(rental_id, as_of, actor).await?;
                updated(1)
            }
            Command::AddCharge {
                rental_id,
                description,
                amount_cents,
                commissionable,
            } => {
                engine
                    .add_charge(rental_id, &description, amount_cents, commissionable, actor)
                    .await?;
                inserted(1)
            }
            Command::SetFeeRate(rate) => {
                engine.set_fee_rate(rate, actor).await?;
                inserted(1)
            }
            Command::CreatePriceList(new) => {
                engine.create_price_list(new, actor).await?;
                inserted(1)
            }
            Command::AddSeason { price_list_id, season } => {
                engine.add_season(price_list_id, season, actor).await?;
                inserted(1)
            }
            Command::AddTier { price_list_id, tier } => {
                engine.add_tier(price_list_id, tier, actor).await?;
                inserted(1)
            }
            Command::SetPriceListStatus { id, status } => {
                match status {
                    PriceListStatus::Archived => engine.archive_price_list(id, actor).await?,
                    _ => engine.publish_price_list(id, actor).await?,
                };
                updated(1)
            }
            Command::SelectVehicles { id, plate } => {
                let vehicles = match (id, plate) {
                    (Some(id), _) => found(engine.vehicle(id).await)?,
                    (None, Some(plate)) => match engine.vehicle_by_plate(&plate) {
                        Some(id) => found(engine.vehicle(id).await)?,
                        None => Vec::new(),
                    },
                    (None, None) => engine.list_vehicles().await,
                };
                encode_rows(schema("vehicles"), vehicles, encode_vehicle)
            }
            Command::SelectCustomers { organization_id } => {
                encode_rows(schema("customers"), engine.list_customers(organization_id), encode_customer)
            }
            Command::SelectStates {
                vehicle_id,
                current_only,
            } => {
                let states = if current_only {
                    engine.current_state(vehicle_id).await?.into_iter().collect()
                } else {
                    engine.vehicle_states(vehicle_id).await?
                };
                encode_rows(schema("vehicle_states"), states, encode_state)
            }
            Command::SelectAssignments { id, filter } => {
                let mut assignments = match id {
                    Some(id) => found(engine.assignment(id).await)?,
                    None => engine.list_assignments(&filter).await,
                };
                if id.is_some() {
                    assignments.retain(|a| filter.statuses.is_empty() || filter.statuses.contains(&a.status));
                }
                encode_rows(schema("vehicle_assignments"), assignments, encode_assignment)
            }
            Command::SelectBlocks { id, filter } => {
                let blocks = match id {
                    Some(id) => found(engine.block(id).await)?,
                    None => engine.list_blocks(&filter).await,
                };
                encode_rows(schema("vehicle_blocks"), blocks, encode_block)
            }
            Command::SelectRentals { id, filter } => {
                let rentals = match id {
                    Some(id) => found(engine.rental(id).await)?,
                    None => engine.list_rentals(&filter).await,
                };
                encode_rows(schema("rentals"), rentals, encode_rental)
            }
            Command::SelectCharges { rental_id } => {
                let charges = found(engine.charges(rental_id).await)?.into_iter().flatten();
                encode_rows(schema("rental_charges"), charges, encode_charge)
            }
            Command::SelectPriceLists {
                id,
                vehicle_id,
                renter_org_id,
            } => {
                let mut lists = match id {
                    Some(id) => found(engine.price_list(id).await)?,
                    None => engine.price_lists(vehicle_id).await,
                };
                lists.retain(|p| {
                    vehicle_id.is_none_or(|v| p.vehicle_id == v) && renter_org_id.is_none_or(|r| p.renter_org_id == r)
                });
                encode_rows(schema("vehicle_pricelists"), lists, encode_price_list)
            }
            Command::SelectSeasons { price_list_id } => {
                let seasons = found(engine.price_list(price_list_id).await)?
                    .into_iter()
                    .flat_map(|p| p.seasons.into_iter().map(move |s| (p.id, s)));
                encode_rows(schema("vehicle_pricelist_seasons"), seasons, encode_season)
            }
            Command::SelectTiers { price_list_id } => {
                let tiers = found(engine.price_list(price_list_id).await)?
                    .into_iter()
                    .flat_map(|p| p.tiers.into_iter().map(move |t| (p.id, t)));
                encode_rows(schema("vehicle_pricelist_tiers"), tiers, encode_tier)
            }
            Command::SelectQuote {
                vehicle_id,
                renter_org_id,
                price_list_id,
                request,
            } => {
                let quote = match (price_list_id, vehicle_id, renter_org_id) {
                    (Some(id), _, _) => engine.quote_price_list(id, &request).await?,
                    (None, Some(vehicle_id), Some(renter_org_id)) => {
                        engine.quote_active(vehicle_id, renter_org_id, &request).await?
                    }
                    _ => return Err(EngineError::validation("pricelist_id", "no price list to quote")),
                };
                encode_rows(schema("quote"), [quote], encode_quote)
            }
            Command::SelectContractLedger { organization_id } => encode_rows(
                schema("renter_contract_number_ledger"),
                engine.contract_ledger(organization_id),
                encode_contract_number,
            ),
            Command::SelectFeeRates { organization_id } => {
                encode_rows(schema("admin_fee_rates"), engine.fee_rates(organization_id), encode_fee_rate)
            }
            Command::SelectConflicts {
                vehicle_id,
                window,
                exclude,
            } => {
                let conflicts = engine.check_assignment_window(vehicle_id, window, exclude).await?;
                encode_rows(schema("assignment_conflicts"), conflicts, encode_conflict)
            }
        };
        Ok(vec![response])
    }
}

fn inserted(rows: usize) -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(rows))
}

fn updated(rows: usize) -> Response {
    Response::Execution(Tag::new("UPDATE").with_rows(rows))
}

/// A lookup by id that misses reads as an empty result set.
fn found<T>(result: Result<T, EngineError>) -> Result<Vec<T>, EngineError> {
    match result {
        Ok(row) => Ok(vec![row]),
        Err(EngineError::NotFound { .. }) => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

// ── Row encoding ─────────────────────────────────────────────────

fn encode_rows<T>(
    schema: Vec<FieldInfo>,
    items: impl IntoIterator<Item = T>,
    encode: impl Fn(&mut DataRowEncoder, T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(schema);
    let rows: Vec<PgWireResult<_>> = items
        .into_iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn id_text(id: Ulid) -> String {
    id.to_string()
}

fn opt_id(id: Option<Ulid>) -> Option<String> {
    id.map(|id| id.to_string())
}

fn dec_text(d: Decimal) -> String {
    d.normalize().to_string()
}

fn encode_vehicle(e: &mut DataRowEncoder, v: Vehicle) -> PgWireResult<()> {
    e.encode_field(&id_text(v.id))?;
    e.encode_field(&id_text(v.admin_org_id))?;
    e.encode_field(&v.plate)?;
    e.encode_field(&v.vin)?;
    e.encode_field(&v.make)?;
    e.encode_field(&v.model)?;
    e.encode_field(&i32::from(v.year))?;
    e.encode_field(&v.fuel_type)?;
    e.encode_field(&v.transmission)?;
    e.encode_field(&i32::from(v.seats))?;
    e.encode_field(&(v.mileage as i64))?;
    e.encode_field(&v.active)?;
    e.encode_field(&v.created_by)
}

fn encode_customer(e: &mut DataRowEncoder, c: Customer) -> PgWireResult<()> {
    e.encode_field(&id_text(c.id))?;
    e.encode_field(&id_text(c.organization_id))?;
    e.encode_field(&c.full_name)?;
    e.encode_field(&c.driver_license_expires_on.map(|d| d.to_string()))
}

fn encode_state(e: &mut DataRowEncoder, s: VehicleState) -> PgWireResult<()> {
    e.encode_field(&id_text(s.id))?;
    e.encode_field(&id_text(s.vehicle_id))?;
    e.encode_field(&s.state.as_str())?;
    e.encode_field(&s.started_at)?;
    e.encode_field(&s.ended_at)?;
    e.encode_field(&s.reason)?;
    e.encode_field(&opt_id(s.source_id))?;
    e.encode_field(&s.created_by)
}

fn encode_assignment(e: &mut DataRowEncoder, a: Assignment) -> PgWireResult<()> {
    e.encode_field(&id_text(a.id))?;
    e.encode_field(&id_text(a.vehicle_id))?;
    e.encode_field(&id_text(a.renter_org_id))?;
    e.encode_field(&a.start_at)?;
    e.encode_field(&a.end_at)?;
    e.encode_field(&a.status.as_str())?;
    e.encode_field(&a.mileage_start.map(|m| m as i64))?;
    e.encode_field(&a.mileage_end.map(|m| m as i64))?;
    e.encode_field(&a.created_by)
}

fn encode_block(e: &mut DataRowEncoder, b: Block) -> PgWireResult<()> {
    e.encode_field(&id_text(b.id))?;
    e.encode_field(&id_text(b.vehicle_id))?;
    e.encode_field(&id_text(b.organization_id))?;
    e.encode_field(&b.kind.as_str())?;
    e.encode_field(&b.start_at)?;
    e.encode_field(&b.end_at)?;
    e.encode_field(&b.status.as_str())?;
    e.encode_field(&b.reason)?;
    e.encode_field(&b.created_by)
}

fn encode_rental(e: &mut DataRowEncoder, r: Rental) -> PgWireResult<()> {
    e.encode_field(&id_text(r.id))?;
    e.encode_field(&id_text(r.organization_id))?;
    e.encode_field(&id_text(r.vehicle_id))?;
    e.encode_field(&id_text(r.assignment_id))?;
    e.encode_field(&opt_id(r.customer_id))?;
    e.encode_field(&opt_id(r.second_driver_id))?;
    e.encode_field(&r.planned_pickup_at)?;
    e.encode_field(&r.planned_return_at)?;
    e.encode_field(&r.actual_pickup_at)?;
    e.encode_field(&r.actual_return_at)?;
    e.encode_field(&opt_id(r.pickup_location_id))?;
    e.encode_field(&opt_id(r.return_location_id))?;
    e.encode_field(&r.status.as_str())?;
    e.encode_field(&(r.number_id as i64))?;
    e.encode_field(&r.admin_fee_percent.map(dec_text))?;
    e.encode_field(&r.admin_fee_amount_cents)?;
    e.encode_field(&r.final_amount_override_cents)?;
    e.encode_field(&r.created_by)
}

fn encode_charge(e: &mut DataRowEncoder, c: ChargeLine) -> PgWireResult<()> {
    e.encode_field(&id_text(c.id))?;
    e.encode_field(&id_text(c.rental_id))?;
    e.encode_field(&c.description)?;
    e.encode_field(&c.amount_cents)?;
    e.encode_field(&c.commissionable)?;
    e.encode_field(&c.created_by)
}

fn encode_fee_rate(e: &mut DataRowEncoder, r: FeeRate) -> PgWireResult<()> {
    e.encode_field(&id_text(r.id))?;
    e.encode_field(&id_text(r.organization_id))?;
    e.encode_field(&dec_text(r.percent))?;
    e.encode_field(&r.effective_from.to_string())?;
    e.encode_field(&r.effective_to.map(|d| d.to_string()))
}

fn encode_price_list(e: &mut DataRowEncoder, p: PriceList) -> PgWireResult<()> {
    e.encode_field(&id_text(p.id))?;
    e.encode_field(&id_text(p.vehicle_id))?;
    e.encode_field(&id_text(p.renter_org_id))?;
    e.encode_field(&i64::from(p.version))?;
    e.encode_field(&p.status.as_str())?;
    e.encode_field(&p.base_daily_cents)?;
    e.encode_field(&dec_text(p.weekend_pct))?;
    e.encode_field(&p.km_included_per_day.map(i64::from))?;
    e.encode_field(&p.extra_km_cents)?;
    e.encode_field(&p.deposit_cents)?;
    e.encode_field(&p.rounding.as_str())?;
    e.encode_field(&p.second_driver_daily_cents)?;
    e.encode_field(&p.created_by)
}

fn encode_season(e: &mut DataRowEncoder, (price_list_id, s): (Ulid, Season)) -> PgWireResult<()> {
    e.encode_field(&id_text(s.id))?;
    e.encode_field(&id_text(price_list_id))?;
    e.encode_field(&s.name)?;
    e.encode_field(&s.start_mmdd.to_string())?;
    e.encode_field(&s.end_mmdd.to_string())?;
    e.encode_field(&dec_text(s.season_pct))?;
    e.encode_field(&s.weekend_pct_override.map(dec_text))?;
    e.encode_field(&s.priority)?;
    e.encode_field(&s.is_active)
}

fn encode_tier(e: &mut DataRowEncoder, (price_list_id, t): (Ulid, Tier)) -> PgWireResult<()> {
    e.encode_field(&id_text(t.id))?;
    e.encode_field(&id_text(price_list_id))?;
    e.encode_field(&i64::from(t.min_days))?;
    e.encode_field(&t.max_days.map(i64::from))?;
    e.encode_field(&t.override_daily_cents)?;
    e.encode_field(&t.discount_pct.map(dec_text))?;
    e.encode_field(&t.priority)?;
    e.encode_field(&t.is_active)
}

fn encode_quote(e: &mut DataRowEncoder, q: Quote) -> PgWireResult<()> {
    e.encode_field(&i64::from(q.days))?;
    e.encode_field(&q.daily_total_cents)?;
    e.encode_field(&q.discount_cents)?;
    e.encode_field(&q.km_extra_cents)?;
    e.encode_field(&q.second_driver_cents)?;
    e.encode_field(&q.deposit_cents)?;
    e.encode_field(&q.total_cents)?;
    e.encode_field(&opt_id(q.tier_id))
}

fn encode_contract_number(e: &mut DataRowEncoder, c: ContractNumber) -> PgWireResult<()> {
    e.encode_field(&id_text(c.organization_id))?;
    e.encode_field(&(c.number_id as i64))?;
    e.encode_field(&id_text(c.rental_id))?;
    e.encode_field(&c.created_by)
}

fn encode_conflict(e: &mut DataRowEncoder, c: ConflictRef) -> PgWireResult<()> {
    e.encode_field(&id_text(c.id))?;
    e.encode_field(&c.kind)?;
    e.encode_field(&c.start)?;
    e.encode_field(&c.end)
}

fn encode_outcome(e: &mut DataRowEncoder, outcome: AssignOutcome) -> PgWireResult<()> {
    match outcome {
        AssignOutcome::Assigned(a) => {
            e.encode_field(&id_text(a.vehicle_id))?;
            e.encode_field(&Some(id_text(a.id)))?;
            e.encode_field(&"assigned")?;
            e.encode_field(&None::<String>)
        }
        AssignOutcome::Skipped { vehicle_id, error } => {
            e.encode_field(&id_text(vehicle_id))?;
            e.encode_field(&None::<String>)?;
            e.encode_field(&"skipped")?;
            e.encode_field(&Some(error.to_string()))
        }
    }
}

// ── Result schemas ───────────────────────────────────────────────

fn fields(columns: &[(&str, Type)]) -> Vec<FieldInfo> {
    columns
        .iter()
        .map(|(name, ty)| FieldInfo::new(name.to_string(), None, None, ty.clone(), FieldFormat::Text))
        .collect()
}

/// Row shape per result table. Ids, decimals and dates travel as text,
/// instants as unix milliseconds.
fn schema(table: &str) -> Vec<FieldInfo> {
    use Type as T;
    match table {
        "vehicles" => fields(&[
            ("id", T::VARCHAR),
            ("admin_org_id", T::VARCHAR),
            ("plate", T::VARCHAR),
            ("vin", T::VARCHAR),
            ("make", T::VARCHAR),
            ("model", T::VARCHAR),
            ("year", T::INT4),
            ("fuel_type", T::VARCHAR),
            ("transmission", T::VARCHAR),
            ("seats", T::INT4),
            ("mileage", T::INT8),
            ("active", T::BOOL),
            ("created_by", T::VARCHAR),
        ]),
        "customers" => fields(&[
            ("id", T::VARCHAR),
            ("organization_id", T::VARCHAR),
            ("full_name", T::VARCHAR),
            ("driver_license_expires_on", T::VARCHAR),
        ]),
        "vehicle_states" => fields(&[
            ("id", T::VARCHAR),
            ("vehicle_id", T::VARCHAR),
            ("state", T::VARCHAR),
            ("started_at", T::INT8),
            ("ended_at", T::INT8),
            ("reason", T::VARCHAR),
            ("source_id", T::VARCHAR),
            ("created_by", T::VARCHAR),
        ]),
        "vehicle_assignments" => fields(&[
            ("id", T::VARCHAR),
            ("vehicle_id", T::VARCHAR),
            ("renter_org_id", T::VARCHAR),
            ("start_at", T::INT8),
            ("end_at", T::INT8),
            ("status", T::VARCHAR),
            ("mileage_start", T::INT8),
            ("mileage_end", T::INT8),
            ("created_by", T::VARCHAR),
        ]),
        "vehicle_blocks" => fields(&[
            ("id", T::VARCHAR),
            ("vehicle_id", T::VARCHAR),
            ("organization_id", T::VARCHAR),
            ("type", T::VARCHAR),
            ("start_at", T::INT8),
            ("end_at", T::INT8),
            ("status", T::VARCHAR),
            ("reason", T::VARCHAR),
            ("created_by", T::VARCHAR),
        ]),
        "rentals" => fields(&[
            ("id", T::VARCHAR),
            ("organization_id", T::VARCHAR),
            ("vehicle_id", T::VARCHAR),
            ("assignment_id", T::VARCHAR),
            ("customer_id", T::VARCHAR),
            ("second_driver_id", T::VARCHAR),
            ("planned_pickup_at", T::INT8),
            ("planned_return_at", T::INT8),
            ("actual_pickup_at", T::INT8),
            ("actual_return_at", T::INT8),
            ("pickup_location_id", T::VARCHAR),
            ("return_location_id", T::VARCHAR),
            ("status", T::VARCHAR),
            ("number_id", T::INT8),
            ("admin_fee_percent", T::VARCHAR),
            ("admin_fee_amount_cents", T::INT8),
            ("final_amount_override", T::INT8),
            ("created_by", T::VARCHAR),
        ]),
        "rental_charges" => fields(&[
            ("id", T::VARCHAR),
            ("rental_id", T::VARCHAR),
            ("description", T::VARCHAR),
            ("amount_cents", T::INT8),
            ("commissionable", T::BOOL),
            ("created_by", T::VARCHAR),
        ]),
        "admin_fee_rates" => fields(&[
            ("id", T::VARCHAR),
            ("organization_id", T::VARCHAR),
            ("percent", T::VARCHAR),
            ("effective_from", T::VARCHAR),
            ("effective_to", T::VARCHAR),
        ]),
        "vehicle_pricelists" => fields(&[
            ("id", T::VARCHAR),
            ("vehicle_id", T::VARCHAR),
            ("renter_org_id", T::VARCHAR),
            ("version", T::INT8),
            ("status", T::VARCHAR),
            ("base_daily_cents", T::INT8),
            ("weekend_pct", T::VARCHAR),
            ("km_included_per_day", T::INT8),
            ("extra_km_cents", T::INT8),
            ("deposit_cents", T::INT8),
            ("rounding", T::VARCHAR),
            ("second_driver_daily_cents", T::INT8),
            ("created_by", T::VARCHAR),
        ]),
        "vehicle_pricelist_seasons" => fields(&[
            ("id", T::VARCHAR),
            ("pricelist_id", T::VARCHAR),
            ("name", T::VARCHAR),
            ("start_mmdd", T::VARCHAR),
            ("end_mmdd", T::VARCHAR),
            ("season_pct", T::VARCHAR),
            ("weekend_pct_override", T::VARCHAR),
            ("priority", T::INT4),
            ("is_active", T::BOOL),
        ]),
        "vehicle_pricelist_tiers" => fields(&[
            ("id", T::VARCHAR),
            ("pricelist_id", T::VARCHAR),
            ("min_days", T::INT8),
            ("max_days", T::INT8),
            ("override_daily_cents", T::INT8),
            ("discount_pct", T::VARCHAR),
            ("priority", T::INT4),
            ("is_active", T::BOOL),
        ]),
        "quote" => fields(&[
            ("days", T::INT8),
            ("daily_total_cents", T::INT8),
            ("discount_cents", T::INT8),
            ("km_extra_cents", T::INT8),
            ("second_driver_cents", T::INT8),
            ("deposit_cents", T::INT8),
            ("total_cents", T::INT8),
            ("tier_id", T::VARCHAR),
        ]),
        "renter_contract_number_ledger" => fields(&[
            ("organization_id", T::VARCHAR),
            ("number_id", T::INT8),
            ("rental_id", T::VARCHAR),
            ("created_by", T::VARCHAR),
        ]),
        "assignment_conflicts" => fields(&[
            ("id", T::VARCHAR),
            ("kind", T::VARCHAR),
            ("start_at", T::INT8),
            ("end_at", T::INT8),
        ]),
        "bulk_assign" => fields(&[
            ("vehicle_id", T::VARCHAR),
            ("assignment_id", T::VARCHAR),
            ("outcome", T::VARCHAR),
            ("detail", T::VARCHAR),
        ]),
        _ => Vec::new(),
    }
}

fn statement_schema(sql: &str) -> Vec<FieldInfo> {
    sql::result_table(sql).map(|table| schema(&table)).unwrap_or_default()
}

#[async_trait]
impl SimpleQueryHandler for FleetlineHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        self.run(client, query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct FleetlineQueryParser;

#[async_trait]
impl QueryParser for FleetlineQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(statement_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for FleetlineHandler {
    type Statement = String;
    type QueryParser = FleetlineQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let sql = substitute_params(portal);
        let mut responses = self.run(client, &sql).await?;
        Ok(responses.remove(0))
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            statement_schema(&target.statement),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(statement_schema(
            &target.statement.statement,
        )))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i > start
                && let Ok(n) = sql[start..i].parse::<usize>()
            {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
/// Highest index first, so `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let values: Vec<Option<String>> = portal
        .parameters
        .iter()
        .map(|p| p.as_ref().map(|bytes| String::from_utf8_lossy(bytes).into_owned()))
        .collect();
    substitute(&portal.statement.statement, &values)
}

fn substitute(sql: &str, values: &[Option<String>]) -> String {
    let mut result = sql.to_string();
    for (i, value) in values.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let literal = match value {
            Some(text) => format!("'{}'", text.replace('\'', "''")),
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &literal);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct FleetlineFactory {
    handler: Arc<FleetlineHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<FleetlineAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl FleetlineFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = FleetlineAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(FleetlineHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for FleetlineFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(FleetlineFactory::new(tenant_manager, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Validation { .. } => "22023",
        EngineError::Conflict { .. } => "23P01",
        EngineError::LicenseExpired { .. } => "23514",
        EngineError::NotFound { .. } => "P0002",
        EngineError::AlreadyExists { .. } => "23505",
        EngineError::Forbidden { .. } => "42501",
        EngineError::InvariantViolation(_) => "XX000",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        e.to_string(),
    )))
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_params_finds_highest_index() {
        assert_eq!(count_params("SELECT * FROM rentals"), 0);
        assert_eq!(count_params("SELECT * FROM rentals WHERE id = $1"), 1);
        assert_eq!(
            count_params("SELECT * FROM quote WHERE pricelist_id = $2 AND pickup_at = $1 AND return_at = $10"),
            10
        );
    }

    #[test]
    fn substitute_quotes_and_nulls() {
        let sql = "INSERT INTO customers (id, organization_id, full_name, driver_license_expires_on) VALUES ($1, $2, $3, $4)";
        let out = substitute(
            sql,
            &[
                Some("01ARZ3NDEKTSV4RRFFQ69G5FAV".into()),
                Some("01BX5ZZKBKACTAV9WEVGEMMVRZ".into()),
                Some("Dario D'Angelo".into()),
                None,
            ],
        );
        assert!(out.contains("'Dario D''Angelo'"));
        assert!(out.ends_with("NULL)"));
        assert!(sql::parse_sql(&out).is_ok());
    }

    #[test]
    fn substitute_tenth_before_first() {
        let values: Vec<Option<String>> = (1..=10).map(|i| Some(i.to_string())).collect();
        assert_eq!(substitute("$1,$10", &values), "'1','10'");
    }

    #[test]
    fn sqlstate_per_error_kind() {
        let conflict = EngineError::Conflict { conflicts: Vec::new() };
        assert_eq!(sqlstate(&conflict), "23P01");
        assert_eq!(sqlstate(&EngineError::not_found("rental", Ulid::nil())), "P0002");
        assert_eq!(sqlstate(&EngineError::LimitExceeded("batch too large")), "54000");
        assert_eq!(
            sqlstate(&EngineError::Forbidden {
                actor: "ops".into(),
                action: "assign",
            }),
            "42501"
        );
    }

    #[test]
    fn statement_schema_follows_select_table() {
        let names: Vec<String> = statement_schema("SELECT * FROM quote WHERE pricelist_id = $1")
            .iter()
            .map(|f| f.name().to_string())
            .collect();
        assert_eq!(names.first().map(String::as_str), Some("days"));
        assert!(names.iter().any(|n| n == "total_cents"));
        assert!(statement_schema("UPDATE rentals SET status = 'closed' WHERE id = $1").is_empty());
    }

    #[test]
    fn missing_id_lookup_is_empty() {
        let rows = found::<Vehicle>(Err(EngineError::not_found("vehicle", Ulid::nil()))).unwrap();
        assert!(rows.is_empty());
        assert!(found::<Vehicle>(Err(EngineError::LimitExceeded("x"))).is_err());
    }
}
