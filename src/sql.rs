use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate};
use rust_decimal::Decimal;
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::engine::{
    AssignRequest, AssignmentFilter, BlockFilter, NewBlock, NewPriceList, NewRental, NewSeason, NewTier,
    NewVehicle, RentalAmendment, RentalFilter,
};
use crate::limits::MAX_IN_CLAUSE_IDS;
use crate::model::*;
use crate::pricing::QuoteRequest;

/// Parsed command from SQL input.
#[derive(Debug)]
pub enum Command {
    RegisterVehicle(NewVehicle),
    RecordMileage {
        id: Ulid,
        mileage: u64,
    },
    ArchiveVehicle {
        id: Ulid,
    },
    UpsertCustomer(Customer),
    OpenState {
        vehicle_id: Ulid,
        state: VehicleStateKind,
        started_at: Ms,
        reason: String,
    },
    CloseState {
        vehicle_id: Ulid,
        state: VehicleStateKind,
        ended_at: Ms,
        reason: String,
    },
    Assign(AssignRequest),
    /// Multi-row INSERT: one transaction per vehicle.
    AssignMany(Vec<AssignRequest>),
    ExtendAssignment {
        id: Ulid,
        end_at: Ms,
    },
    RevokeAssignment {
        id: Ulid,
    },
    CloseAssignment {
        id: Ulid,
    },
    CreateBlock(NewBlock),
    FinishBlock {
        id: Ulid,
        status: BlockStatus,
    },
    CreateRental(NewRental),
    AmendRental {
        id: Ulid,
        amendment: RentalAmendment,
    },
    TransitionRental {
        id: Ulid,
        to: RentalStatus,
        at: Option<Ms>,
    },
    SetFinalAmount {
        id: Ulid,
        amount_cents: Option<i64>,
    },
    SnapshotFee {
        rental_id: Ulid,
        as_of: Option<NaiveDate>,
    },
    AddCharge {
        rental_id: Ulid,
        description: String,
        amount_cents: i64,
        commissionable: bool,
    },
    SetFeeRate(FeeRate),
    CreatePriceList(NewPriceList),
    AddSeason {
        price_list_id: Ulid,
        season: NewSeason,
    },
    AddTier {
        price_list_id: Ulid,
        tier: NewTier,
    },
    SetPriceListStatus {
        id: Ulid,
        status: PriceListStatus,
    },
    SelectVehicles {
        id: Option<Ulid>,
        plate: Option<String>,
    },
    SelectCustomers {
        organization_id: Option<Ulid>,
    },
    SelectStates {
        vehicle_id: Ulid,
        current_only: bool,
    },
    SelectAssignments {
        id: Option<Ulid>,
        filter: AssignmentFilter,
    },
    SelectBlocks {
        id: Option<Ulid>,
        filter: BlockFilter,
    },
    SelectRentals {
        id: Option<Ulid>,
        filter: RentalFilter,
    },
    SelectCharges {
        rental_id: Ulid,
    },
    SelectPriceLists {
        id: Option<Ulid>,
        vehicle_id: Option<Ulid>,
        renter_org_id: Option<Ulid>,
    },
    SelectSeasons {
        price_list_id: Ulid,
    },
    SelectTiers {
        price_list_id: Ulid,
    },
    SelectQuote {
        vehicle_id: Option<Ulid>,
        renter_org_id: Option<Ulid>,
        price_list_id: Option<Ulid>,
        request: QuoteRequest,
    },
    SelectContractLedger {
        organization_id: Option<Ulid>,
    },
    SelectFeeRates {
        organization_id: Ulid,
    },
    /// Availability check: what an assignment over the window would hit.
    SelectConflicts {
        vehicle_id: Ulid,
        window: Window,
        exclude: Option<Ulid>,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection.as_ref()),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Table whose rows a statement returns, for describing prepared statements.
/// Multi-row assignment inserts answer with per-vehicle outcome rows.
pub fn result_table(sql: &str) -> Option<String> {
    let stmts = Parser::parse_sql(&PostgreSqlDialect {}, sql).ok()?;
    match stmts.first()? {
        Statement::Query(query) => match query.body.as_ref() {
            SetExpr::Select(select) => table_factor_name(&select.from.first()?.relation).ok(),
            _ => None,
        },
        Statement::Insert(insert) => {
            let table = insert_table_name(insert).ok()?;
            let rows = extract_all_insert_rows(insert).ok()?;
            (table == "vehicle_assignments" && rows.len() > 1).then(|| "bulk_assign".to_string())
        }
        _ => None,
    }
}

// ── INSERT ────────────────────────────────────────────────────

/// One VALUES row addressed by column name.
struct Row<'a> {
    table: &'static str,
    columns: &'a [String],
    values: &'a [Expr],
}

impl<'a> Row<'a> {
    fn get(&self, col: &str) -> Option<&'a Expr> {
        self.columns
            .iter()
            .position(|c| c == col)
            .and_then(|i| self.values.get(i))
    }

    fn req(&self, col: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(col).ok_or(SqlError::MissingColumn(self.table, col))
    }

    /// Missing column and explicit NULL both read as `None`.
    fn opt<T>(&self, col: &str, parse: impl Fn(&Expr) -> Result<T, SqlError>) -> Result<Option<T>, SqlError> {
        match self.get(col) {
            None => Ok(None),
            Some(e) if is_null(e) => Ok(None),
            Some(e) => parse(e).map(Some),
        }
    }

    fn ulid(&self, col: &'static str) -> Result<Ulid, SqlError> {
        parse_ulid_expr(self.req(col)?)
    }

    /// Generated when the column is absent.
    fn id(&self) -> Result<Ulid, SqlError> {
        Ok(self.opt("id", parse_ulid_expr)?.unwrap_or_else(Ulid::new))
    }

    fn text(&self, col: &'static str) -> Result<String, SqlError> {
        parse_text(self.req(col)?)
    }

    fn text_or_empty(&self, col: &str) -> Result<String, SqlError> {
        Ok(self.opt(col, parse_text)?.unwrap_or_default())
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let table = known_table(&table)?;
    if insert.columns.is_empty() {
        return Err(SqlError::Parse(format!("INSERT INTO {table} needs an explicit column list")));
    }
    let columns: Vec<String> = insert.columns.iter().map(|c| c.value.to_lowercase()).collect();
    let rows = extract_all_insert_rows(insert)?;
    for (i, values) in rows.iter().enumerate() {
        if values.len() != columns.len() {
            return Err(SqlError::Parse(format!(
                "row {i}: {} columns but {} values",
                columns.len(),
                values.len()
            )));
        }
    }

    if table == "vehicle_assignments" && rows.len() > 1 {
        let mut reqs = Vec::with_capacity(rows.len());
        for (i, values) in rows.iter().enumerate() {
            let row = Row {
                table,
                columns: &columns,
                values,
            };
            reqs.push(assign_request(&row).map_err(|e| SqlError::Parse(format!("row {i}: {e}")))?);
        }
        return Ok(Command::AssignMany(reqs));
    }
    if rows.len() > 1 {
        return Err(SqlError::Unsupported(format!("multi-row INSERT into {table}")));
    }
    let row = Row {
        table,
        columns: &columns,
        values: &rows[0],
    };

    match table {
        "vehicles" => Ok(Command::RegisterVehicle(NewVehicle {
            id: row.id()?,
            admin_org_id: row.ulid("admin_org_id")?,
            plate: row.text("plate")?,
            vin: row.opt("vin", parse_text)?,
            make: row.text_or_empty("make")?,
            model: row.text_or_empty("model")?,
            year: row.opt("year", parse_u16)?.unwrap_or(0),
            fuel_type: row.text_or_empty("fuel_type")?,
            transmission: row.text_or_empty("transmission")?,
            seats: row.opt("seats", parse_u8)?.unwrap_or(0),
            mileage: row.opt("mileage", parse_u64)?.unwrap_or(0),
        })),
        "customers" => Ok(Command::UpsertCustomer(Customer {
            id: row.id()?,
            organization_id: row.ulid("organization_id")?,
            full_name: row.text_or_empty("full_name")?,
            driver_license_expires_on: row.opt("driver_license_expires_on", parse_date)?,
        })),
        "vehicle_states" => Ok(Command::OpenState {
            vehicle_id: row.ulid("vehicle_id")?,
            state: parse_enum(row.req("state")?)?,
            started_at: parse_ms(row.req("started_at")?)?,
            reason: row.text_or_empty("reason")?,
        }),
        "vehicle_assignments" => Ok(Command::Assign(assign_request(&row)?)),
        "vehicle_blocks" => Ok(Command::CreateBlock(NewBlock {
            id: row.id()?,
            vehicle_id: row.ulid("vehicle_id")?,
            organization_id: row.ulid("organization_id")?,
            kind: parse_enum(row.req("type")?)?,
            start_at: parse_ms(row.req("start_at")?)?,
            end_at: row.opt("end_at", parse_ms)?,
            reason: row.text_or_empty("reason")?,
        })),
        "rentals" => Ok(Command::CreateRental(NewRental {
            id: row.id()?,
            organization_id: row.ulid("organization_id")?,
            vehicle_id: row.ulid("vehicle_id")?,
            assignment_id: row.opt("assignment_id", parse_ulid_expr)?,
            customer_id: row.opt("customer_id", parse_ulid_expr)?,
            second_driver_id: row.opt("second_driver_id", parse_ulid_expr)?,
            planned_pickup_at: parse_ms(row.req("planned_pickup_at")?)?,
            planned_return_at: parse_ms(row.req("planned_return_at")?)?,
            pickup_location_id: row.opt("pickup_location_id", parse_ulid_expr)?,
            return_location_id: row.opt("return_location_id", parse_ulid_expr)?,
            status: row.opt("status", parse_enum)?.unwrap_or(RentalStatus::Draft),
        })),
        "rental_charges" => Ok(Command::AddCharge {
            rental_id: row.ulid("rental_id")?,
            description: row.text_or_empty("description")?,
            amount_cents: parse_i64_expr(row.req("amount_cents")?)?,
            commissionable: row.opt("commissionable", parse_bool)?.unwrap_or(true),
        }),
        "admin_fee_rates" => Ok(Command::SetFeeRate(FeeRate {
            id: row.id()?,
            organization_id: row.ulid("organization_id")?,
            percent: parse_decimal(row.req("percent")?)?,
            effective_from: parse_date(row.req("effective_from")?)?,
            effective_to: row.opt("effective_to", parse_date)?,
        })),
        "vehicle_pricelists" => Ok(Command::CreatePriceList(NewPriceList {
            id: row.id()?,
            vehicle_id: row.ulid("vehicle_id")?,
            renter_org_id: row.ulid("renter_org_id")?,
            base_daily_cents: parse_i64_expr(row.req("base_daily_cents")?)?,
            weekend_pct: row.opt("weekend_pct", parse_decimal)?.unwrap_or(Decimal::ZERO),
            km_included_per_day: row.opt("km_included_per_day", parse_u32)?,
            extra_km_cents: row.opt("extra_km_cents", parse_i64_expr)?,
            deposit_cents: row.opt("deposit_cents", parse_i64_expr)?,
            rounding: row.opt("rounding", parse_enum)?.unwrap_or(Rounding::None),
            second_driver_daily_cents: row.opt("second_driver_daily_cents", parse_i64_expr)?,
        })),
        "vehicle_pricelist_seasons" => Ok(Command::AddSeason {
            price_list_id: row.ulid("pricelist_id")?,
            season: NewSeason {
                id: row.id()?,
                name: row.text_or_empty("name")?,
                start_mmdd: parse_month_day(row.req("start_mmdd")?)?,
                end_mmdd: parse_month_day(row.req("end_mmdd")?)?,
                season_pct: row.opt("season_pct", parse_decimal)?.unwrap_or(Decimal::ZERO),
                weekend_pct_override: row.opt("weekend_pct_override", parse_decimal)?,
                priority: row.opt("priority", parse_i32)?.unwrap_or(0),
                is_active: row.opt("is_active", parse_bool)?.unwrap_or(true),
            },
        }),
        "vehicle_pricelist_tiers" => Ok(Command::AddTier {
            price_list_id: row.ulid("pricelist_id")?,
            tier: NewTier {
                id: row.id()?,
                min_days: parse_u32(row.req("min_days")?)?,
                max_days: row.opt("max_days", parse_u32)?,
                override_daily_cents: row.opt("override_daily_cents", parse_i64_expr)?,
                discount_pct: row.opt("discount_pct", parse_decimal)?,
                priority: row.opt("priority", parse_i32)?.unwrap_or(0),
                is_active: row.opt("is_active", parse_bool)?.unwrap_or(true),
            },
        }),
        _ => Err(SqlError::Unsupported(format!("INSERT into {table}"))),
    }
}

fn assign_request(row: &Row<'_>) -> Result<AssignRequest, SqlError> {
    Ok(AssignRequest {
        id: row.id()?,
        vehicle_id: row.ulid("vehicle_id")?,
        renter_org_id: row.ulid("renter_org_id")?,
        start_at: parse_ms(row.req("start_at")?)?,
        end_at: row.opt("end_at", parse_ms)?,
    })
}

// ── UPDATE / DELETE ───────────────────────────────────────────

fn parse_update(relation: &TableFactor, assignments: &[ast::Assignment], selection: Option<&Expr>) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    let table = known_table(&table)?;
    let mut set: HashMap<String, &Expr> = HashMap::new();
    for a in assignments {
        let col = match &a.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        }
        .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))?;
        set.insert(col, &a.value);
    }
    let filters = Filters::from_selection(selection)?;
    let set = SetClause { table, set };

    if table == "vehicle_states" {
        filters.allow(table, &["vehicle_id", "state"])?;
        set.allow(&["ended_at", "reason"])?;
        return Ok(Command::CloseState {
            vehicle_id: filters.required("vehicle_id", parse_ulid_expr)?,
            state: filters.required("state", parse_enum)?,
            ended_at: parse_ms(set.req("ended_at")?)?,
            reason: set.opt("reason", parse_text)?.unwrap_or_default(),
        });
    }

    filters.allow(table, &["id"])?;
    let id = filters.required("id", parse_ulid_expr)?;
    match table {
        "vehicles" => {
            if let Some(mileage) = set.opt("mileage", parse_u64)? {
                set.allow(&["mileage"])?;
                Ok(Command::RecordMileage { id, mileage })
            } else {
                set.allow(&["active"])?;
                match parse_bool(set.req("active")?)? {
                    false => Ok(Command::ArchiveVehicle { id }),
                    true => Err(SqlError::Unsupported("reactivating an archived vehicle".into())),
                }
            }
        }
        "vehicle_assignments" => {
            if let Some(end_at) = set.opt("end_at", parse_ms)? {
                set.allow(&["end_at"])?;
                return Ok(Command::ExtendAssignment { id, end_at });
            }
            set.allow(&["status"])?;
            match parse_enum(set.req("status")?)? {
                AssignmentStatus::Revoked => Ok(Command::RevokeAssignment { id }),
                AssignmentStatus::Ended => Ok(Command::CloseAssignment { id }),
                other => Err(SqlError::Unsupported(format!("setting an assignment to {other}"))),
            }
        }
        "vehicle_blocks" => {
            set.allow(&["status"])?;
            match parse_enum(set.req("status")?)? {
                status @ (BlockStatus::Ended | BlockStatus::Cancelled) => Ok(Command::FinishBlock { id, status }),
                other => Err(SqlError::Unsupported(format!("setting a block to {other}"))),
            }
        }
        "rentals" => parse_rental_update(id, &set),
        "vehicle_pricelists" => {
            set.allow(&["status"])?;
            match parse_enum(set.req("status")?)? {
                status @ (PriceListStatus::Active | PriceListStatus::Archived) => {
                    Ok(Command::SetPriceListStatus { id, status })
                }
                PriceListStatus::Draft => Err(SqlError::Unsupported("reverting a price list to draft".into())),
            }
        }
        _ => Err(SqlError::Unsupported(format!("UPDATE {table}"))),
    }
}

/// Rental updates come in four shapes: a status change, a fee snapshot, a
/// final amount override, or an amendment of planned fields.
fn parse_rental_update(id: Ulid, set: &SetClause<'_>) -> Result<Command, SqlError> {
    if set.has("status") {
        set.allow(&["status", "actual_pickup_at", "actual_return_at"])?;
        let to: RentalStatus = parse_enum(set.req("status")?)?;
        let at = match (set.opt("actual_pickup_at", parse_ms)?, set.opt("actual_return_at", parse_ms)?) {
            (Some(_), Some(_)) => {
                return Err(SqlError::Unsupported("setting pickup and return in one change".into()));
            }
            (a, b) => a.or(b),
        };
        return Ok(Command::TransitionRental { id, to, at });
    }
    if set.has("admin_fee_snapshot") {
        set.allow(&["admin_fee_snapshot", "admin_fee_as_of"])?;
        if !parse_bool(set.req("admin_fee_snapshot")?)? {
            return Err(SqlError::Unsupported("clearing an admin fee snapshot".into()));
        }
        return Ok(Command::SnapshotFee {
            rental_id: id,
            as_of: set.opt("admin_fee_as_of", parse_date)?,
        });
    }
    if set.has("final_amount_override") {
        set.allow(&["final_amount_override"])?;
        return Ok(Command::SetFinalAmount {
            id,
            amount_cents: set.opt("final_amount_override", parse_i64_expr)?,
        });
    }
    set.allow(&[
        "planned_pickup_at",
        "planned_return_at",
        "customer_id",
        "second_driver_id",
        "pickup_location_id",
        "return_location_id",
    ])?;
    let amendment = RentalAmendment {
        planned_pickup_at: set.opt("planned_pickup_at", parse_ms)?,
        planned_return_at: set.opt("planned_return_at", parse_ms)?,
        customer_id: set.nullable("customer_id", parse_ulid_expr)?,
        second_driver_id: set.nullable("second_driver_id", parse_ulid_expr)?,
        pickup_location_id: set.nullable("pickup_location_id", parse_ulid_expr)?,
        return_location_id: set.nullable("return_location_id", parse_ulid_expr)?,
    };
    Ok(Command::AmendRental { id, amendment })
}

struct SetClause<'a> {
    table: &'static str,
    set: HashMap<String, &'a Expr>,
}

impl<'a> SetClause<'a> {
    fn has(&self, col: &str) -> bool {
        self.set.contains_key(col)
    }

    fn req(&self, col: &'static str) -> Result<&'a Expr, SqlError> {
        self.set.get(col).copied().ok_or(SqlError::MissingColumn(self.table, col))
    }

    fn opt<T>(&self, col: &str, parse: impl Fn(&Expr) -> Result<T, SqlError>) -> Result<Option<T>, SqlError> {
        match self.set.get(col) {
            None => Ok(None),
            Some(e) if is_null(e) => Ok(None),
            Some(e) => parse(e).map(Some),
        }
    }

    /// `None` when not assigned, `Some(None)` for `= NULL`.
    fn nullable<T>(
        &self,
        col: &str,
        parse: impl Fn(&Expr) -> Result<T, SqlError>,
    ) -> Result<Option<Option<T>>, SqlError> {
        match self.set.get(col) {
            None => Ok(None),
            Some(e) if is_null(e) => Ok(Some(None)),
            Some(e) => parse(e).map(|v| Some(Some(v))),
        }
    }

    fn allow(&self, cols: &[&str]) -> Result<(), SqlError> {
        match self.set.keys().find(|k| !cols.contains(&k.as_str())) {
            Some(col) => Err(SqlError::UnknownColumn(self.table, col.clone())),
            None => Ok(()),
        }
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let table = known_table(&table)?;
    let id = extract_where_id(&delete.selection)?;

    match table {
        "vehicle_assignments" => Ok(Command::RevokeAssignment { id }),
        "vehicle_blocks" => Ok(Command::FinishBlock {
            id,
            status: BlockStatus::Cancelled,
        }),
        _ => Err(SqlError::Unsupported(format!("DELETE from {table}"))),
    }
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;
    let table = known_table(&table)?;
    let f = Filters::from_selection(select.selection.as_ref())?;

    match table {
        "vehicles" => {
            f.allow(table, &["id", "plate"])?;
            Ok(Command::SelectVehicles {
                id: f.optional("id", parse_ulid_expr)?,
                plate: f.optional("plate", parse_text)?,
            })
        }
        "customers" => {
            f.allow(table, &["organization_id"])?;
            Ok(Command::SelectCustomers {
                organization_id: f.optional("organization_id", parse_ulid_expr)?,
            })
        }
        "vehicle_states" => {
            f.allow(table, &["vehicle_id", "ended_at"])?;
            if f.eq.contains_key("ended_at") {
                return Err(SqlError::Unsupported("ended_at filters other than IS NULL".into()));
            }
            Ok(Command::SelectStates {
                vehicle_id: f.required("vehicle_id", parse_ulid_expr)?,
                current_only: f.nulls.iter().any(|c| c == "ended_at"),
            })
        }
        "vehicle_assignments" => {
            f.allow(table, &["id", "vehicle_id", "renter_org_id", "status", "window_start", "window_end"])?;
            Ok(Command::SelectAssignments {
                id: f.optional("id", parse_ulid_expr)?,
                filter: AssignmentFilter {
                    vehicle_id: f.optional("vehicle_id", parse_ulid_expr)?,
                    renter_org_id: f.optional("renter_org_id", parse_ulid_expr)?,
                    statuses: f.list("status", parse_enum)?,
                    window: f.window()?,
                },
            })
        }
        "vehicle_blocks" => {
            f.allow(table, &["id", "vehicle_id", "organization_id", "status", "window_start", "window_end"])?;
            Ok(Command::SelectBlocks {
                id: f.optional("id", parse_ulid_expr)?,
                filter: BlockFilter {
                    vehicle_id: f.optional("vehicle_id", parse_ulid_expr)?,
                    organization_id: f.optional("organization_id", parse_ulid_expr)?,
                    statuses: f.list("status", parse_enum)?,
                    window: f.window()?,
                },
            })
        }
        "rentals" => {
            f.allow(
                table,
                &["id", "vehicle_id", "organization_id", "driver_id", "status", "window_start", "window_end"],
            )?;
            Ok(Command::SelectRentals {
                id: f.optional("id", parse_ulid_expr)?,
                filter: RentalFilter {
                    vehicle_id: f.optional("vehicle_id", parse_ulid_expr)?,
                    organization_id: f.optional("organization_id", parse_ulid_expr)?,
                    driver_id: f.optional("driver_id", parse_ulid_expr)?,
                    statuses: f.list("status", parse_enum)?,
                    window: f.window()?,
                },
            })
        }
        "rental_charges" => {
            f.allow(table, &["rental_id"])?;
            Ok(Command::SelectCharges {
                rental_id: f.required("rental_id", parse_ulid_expr)?,
            })
        }
        "vehicle_pricelists" => {
            f.allow(table, &["id", "vehicle_id", "renter_org_id"])?;
            Ok(Command::SelectPriceLists {
                id: f.optional("id", parse_ulid_expr)?,
                vehicle_id: f.optional("vehicle_id", parse_ulid_expr)?,
                renter_org_id: f.optional("renter_org_id", parse_ulid_expr)?,
            })
        }
        "vehicle_pricelist_seasons" => {
            f.allow(table, &["pricelist_id"])?;
            Ok(Command::SelectSeasons {
                price_list_id: f.required("pricelist_id", parse_ulid_expr)?,
            })
        }
        "vehicle_pricelist_tiers" => {
            f.allow(table, &["pricelist_id"])?;
            Ok(Command::SelectTiers {
                price_list_id: f.required("pricelist_id", parse_ulid_expr)?,
            })
        }
        "quote" => {
            f.allow(
                table,
                &[
                    "vehicle_id",
                    "renter_org_id",
                    "pricelist_id",
                    "pickup_at",
                    "return_at",
                    "expected_km",
                    "second_driver",
                ],
            )?;
            let vehicle_id = f.optional("vehicle_id", parse_ulid_expr)?;
            let renter_org_id = f.optional("renter_org_id", parse_ulid_expr)?;
            let price_list_id = f.optional("pricelist_id", parse_ulid_expr)?;
            if price_list_id.is_none() && (vehicle_id.is_none() || renter_org_id.is_none()) {
                return Err(SqlError::MissingFilter("pricelist_id or vehicle_id and renter_org_id"));
            }
            Ok(Command::SelectQuote {
                vehicle_id,
                renter_org_id,
                price_list_id,
                request: QuoteRequest {
                    pickup_at: f.required("pickup_at", parse_ms)?,
                    return_at: f.required("return_at", parse_ms)?,
                    expected_km: f.optional("expected_km", parse_u32)?.unwrap_or(0),
                    second_driver: f.optional("second_driver", parse_bool)?.unwrap_or(false),
                },
            })
        }
        "renter_contract_number_ledger" => {
            f.allow(table, &["organization_id"])?;
            Ok(Command::SelectContractLedger {
                organization_id: f.optional("organization_id", parse_ulid_expr)?,
            })
        }
        "admin_fee_rates" => {
            f.allow(table, &["organization_id"])?;
            Ok(Command::SelectFeeRates {
                organization_id: f.required("organization_id", parse_ulid_expr)?,
            })
        }
        "assignment_conflicts" => {
            f.allow(table, &["vehicle_id", "window_start", "window_end", "exclude_id"])?;
            Ok(Command::SelectConflicts {
                vehicle_id: f.required("vehicle_id", parse_ulid_expr)?,
                window: f.window()?.ok_or(SqlError::MissingFilter("window_start"))?,
                exclude: f.optional("exclude_id", parse_ulid_expr)?,
            })
        }
        _ => Err(SqlError::Unsupported(format!("SELECT from {table}"))),
    }
}

/// AND-ed `col = value`, `col IN (...)` and `col IS NULL` predicates.
#[derive(Default)]
struct Filters {
    eq: HashMap<String, Vec<Expr>>,
    nulls: Vec<String>,
}

impl Filters {
    fn from_selection(selection: Option<&Expr>) -> Result<Self, SqlError> {
        let mut filters = Filters::default();
        if let Some(expr) = selection {
            filters.collect(expr)?;
        }
        Ok(filters)
    }

    fn collect(&mut self, expr: &Expr) -> Result<(), SqlError> {
        match expr {
            Expr::Nested(inner) => self.collect(inner),
            Expr::BinaryOp {
                left,
                op: ast::BinaryOperator::And,
                right,
            } => {
                self.collect(left)?;
                self.collect(right)
            }
            Expr::BinaryOp {
                left,
                op: ast::BinaryOperator::Eq,
                right,
            } => {
                let col = expr_column_name(left).ok_or_else(|| SqlError::Unsupported(format!("filter {expr}")))?;
                self.eq.entry(col).or_default().push(right.as_ref().clone());
                Ok(())
            }
            Expr::InList {
                expr: col,
                list,
                negated: false,
            } => {
                if list.len() > MAX_IN_CLAUSE_IDS {
                    return Err(SqlError::Parse(format!("IN list longer than {MAX_IN_CLAUSE_IDS}")));
                }
                let col = expr_column_name(col).ok_or_else(|| SqlError::Unsupported(format!("filter {expr}")))?;
                self.eq.entry(col).or_default().extend(list.iter().cloned());
                Ok(())
            }
            Expr::IsNull(col) => {
                let col = expr_column_name(col).ok_or_else(|| SqlError::Unsupported(format!("filter {expr}")))?;
                self.nulls.push(col);
                Ok(())
            }
            other => Err(SqlError::Unsupported(format!("filter {other}"))),
        }
    }

    fn allow(&self, table: &'static str, cols: &[&str]) -> Result<(), SqlError> {
        match self
            .eq
            .keys()
            .chain(self.nulls.iter())
            .find(|k| !cols.contains(&k.as_str()))
        {
            Some(col) => Err(SqlError::UnknownColumn(table, col.clone())),
            None => Ok(()),
        }
    }

    fn optional<T>(&self, col: &'static str, parse: impl Fn(&Expr) -> Result<T, SqlError>) -> Result<Option<T>, SqlError> {
        match self.eq.get(col).map(Vec::as_slice) {
            None | Some([]) => Ok(None),
            Some([value]) => parse(value).map(Some),
            Some(_) => Err(SqlError::Unsupported(format!("more than one value for {col}"))),
        }
    }

    fn required<T>(&self, col: &'static str, parse: impl Fn(&Expr) -> Result<T, SqlError>) -> Result<T, SqlError> {
        self.optional(col, parse)?.ok_or(SqlError::MissingFilter(col))
    }

    fn list<T>(&self, col: &str, parse: impl Fn(&Expr) -> Result<T, SqlError>) -> Result<Vec<T>, SqlError> {
        self.eq
            .get(col)
            .map(|values| values.iter().map(&parse).collect())
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    /// `window_start = a [AND window_end = b]`.
    fn window(&self) -> Result<Option<Window>, SqlError> {
        let start = self.optional("window_start", parse_ms)?;
        let end = self.optional("window_end", parse_ms)?;
        match (start, end) {
            (Some(start), end) => {
                if end.is_some_and(|e| e < start) {
                    return Err(SqlError::Parse("window_end is before window_start".into()));
                }
                Ok(Some(Window::new(start, end)))
            }
            (None, Some(_)) => Err(SqlError::MissingFilter("window_start")),
            (None, None) => Ok(None),
        }
    }
}

// ── Helpers ───────────────────────────────────────────────────

const TABLES: &[&str] = &[
    "vehicles",
    "customers",
    "vehicle_states",
    "vehicle_assignments",
    "vehicle_blocks",
    "rentals",
    "rental_charges",
    "admin_fee_rates",
    "vehicle_pricelists",
    "vehicle_pricelist_seasons",
    "vehicle_pricelist_tiers",
    "quote",
    "renter_contract_number_ledger",
    "assignment_conflicts",
];

fn known_table(name: &str) -> Result<&'static str, SqlError> {
    TABLES
        .iter()
        .find(|t| **t == name)
        .copied()
        .ok_or_else(|| SqlError::UnknownTable(name.to_string()))
}

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_all_insert_rows(insert: &ast::Insert) -> Result<Vec<Vec<Expr>>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(values.rows.clone())
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let filters = Filters::from_selection(selection.as_ref())?;
    filters.allow("where", &["id"])?;
    filters.required("id", parse_ulid_expr)
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

/// Quoted strings and bare numbers both reach us as text: bound parameters
/// are substituted as quoted literals.
fn literal_text(expr: &Expr) -> Result<&str, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s) | Value::Number(s, _)) => Ok(s),
        Some(value) => Err(SqlError::Parse(format!("expected literal, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = literal_text(expr)?;
    Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID {s}: {e}")))
}

fn parse_text(expr: &Expr) -> Result<String, SqlError> {
    literal_text(expr).map(str::to_string)
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(-parse_i64_expr(expr)?);
    }
    let s = literal_text(expr)?;
    s.trim().parse().map_err(|e| SqlError::Parse(format!("bad integer {s}: {e}")))
}

/// Unix milliseconds, or an RFC 3339 timestamp.
fn parse_ms(expr: &Expr) -> Result<Ms, SqlError> {
    if let Ok(ms) = parse_i64_expr(expr) {
        return Ok(ms);
    }
    let s = literal_text(expr)?;
    DateTime::parse_from_rfc3339(s.trim())
        .map(|dt| dt.timestamp_millis())
        .map_err(|e| SqlError::Parse(format!("bad timestamp {s}: {e}")))
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = literal_text(expr)?;
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").map_err(|e| SqlError::Parse(format!("bad date {s}: {e}")))
}

fn parse_decimal(expr: &Expr) -> Result<Decimal, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(-parse_decimal(expr)?);
    }
    let s = literal_text(expr)?;
    Decimal::from_str(s.trim()).map_err(|e| SqlError::Parse(format!("bad decimal {s}: {e}")))
}

fn parse_month_day(expr: &Expr) -> Result<MonthDay, SqlError> {
    MonthDay::parse(literal_text(expr)?).map_err(SqlError::Parse)
}

fn parse_enum<T>(expr: &Expr) -> Result<T, SqlError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    T::from_str(literal_text(expr)?).map_err(|e| SqlError::Parse(e.to_string()))
}

fn parse_u8(expr: &Expr) -> Result<u8, SqlError> {
    let v = parse_i64_expr(expr)?;
    u8::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u8 range")))
}

fn parse_u16(expr: &Expr) -> Result<u16, SqlError> {
    let v = parse_i64_expr(expr)?;
    u16::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u16 range")))
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_i32(expr: &Expr) -> Result<i32, SqlError> {
    let v = parse_i64_expr(expr)?;
    i32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of i32 range")))
}

fn parse_u64(expr: &Expr) -> Result<u64, SqlError> {
    let v = parse_i64_expr(expr)?;
    u64::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u64 range")))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Boolean(b) => Ok(*b),
            Value::SingleQuotedString(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "1" => Ok(true),
                "false" | "f" | "0" => Ok(false),
                _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
            },
            Value::Number(n, _) => Ok(n != "0"),
            _ => Err(SqlError::Parse(format!("expected bool, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(&'static str, String),
    MissingColumn(&'static str, &'static str),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(t, c) => write!(f, "{t}: unknown column {c}"),
            SqlError::MissingColumn(t, c) => write!(f, "{t}: missing column {c}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
