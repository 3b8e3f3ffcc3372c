use rust_decimal::Decimal;
use tracing::info;
use ulid::Ulid;

use crate::collab::Action;
use crate::limits::MAX_TEXT_LEN;
use crate::model::*;
use crate::pricing::{self, Quote, QuoteRequest};

use super::conflict::{validate_instant, validate_text};
use super::{Engine, EngineError, Txn, ledger};

#[derive(Debug, Clone)]
pub struct NewPriceList {
    pub id: Ulid,
    pub vehicle_id: Ulid,
    pub renter_org_id: Ulid,
    pub base_daily_cents: i64,
    pub weekend_pct: Decimal,
    pub km_included_per_day: Option<u32>,
    pub extra_km_cents: Option<i64>,
    pub deposit_cents: Option<i64>,
    pub rounding: Rounding,
    pub second_driver_daily_cents: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct NewSeason {
    pub id: Ulid,
    pub name: String,
    pub start_mmdd: MonthDay,
    pub end_mmdd: MonthDay,
    pub season_pct: Decimal,
    pub weekend_pct_override: Option<Decimal>,
    pub priority: i32,
    pub is_active: bool,
}

#[derive(Debug, Clone)]
pub struct NewTier {
    pub id: Ulid,
    pub min_days: u32,
    pub max_days: Option<u32>,
    pub override_daily_cents: Option<i64>,
    pub discount_pct: Option<Decimal>,
    pub priority: i32,
    pub is_active: bool,
}

fn non_negative(field: &'static str, cents: Option<i64>) -> Result<(), EngineError> {
    match cents {
        Some(c) if c < 0 => Err(EngineError::validation(field, "must not be negative")),
        _ => Ok(()),
    }
}

/// Surcharges may go down to -100% (free) but not below.
fn surcharge(field: &'static str, pct: Option<Decimal>) -> Result<(), EngineError> {
    match pct {
        Some(p) if p < -Decimal::ONE_HUNDRED => Err(EngineError::validation(field, "must be at least -100")),
        _ => Ok(()),
    }
}

impl Engine {
    /// New draft version for the (vehicle, renter) pair.
    pub async fn create_price_list(&self, new: NewPriceList, actor: &str) -> Result<PriceList, EngineError> {
        self.authorize(actor, Action::ManagePriceList, new.vehicle_id)?;
        non_negative("base_daily_cents", Some(new.base_daily_cents))?;
        non_negative("extra_km_cents", new.extra_km_cents)?;
        non_negative("deposit_cents", new.deposit_cents)?;
        non_negative("second_driver_daily_cents", new.second_driver_daily_cents)?;
        surcharge("weekend_pct", Some(new.weekend_pct))?;
        if self.entity_to_vehicle.contains_key(&new.id) {
            return Err(EngineError::AlreadyExists {
                entity: "price list",
                key: new.id.to_string(),
            });
        }

        let mut lock = self.lock_vehicle(new.vehicle_id).await?;
        let mut txn = Txn::begin(&lock);
        ledger::activate_due(&mut txn, self.now())?;
        let version = txn
            .staged
            .price_lists
            .iter()
            .filter(|p| p.renter_org_id == new.renter_org_id)
            .map(|p| p.version)
            .max()
            .unwrap_or(0)
            + 1;
        let list = PriceList {
            id: new.id,
            vehicle_id: new.vehicle_id,
            renter_org_id: new.renter_org_id,
            version,
            status: PriceListStatus::Draft,
            active_flag: None,
            base_daily_cents: new.base_daily_cents,
            weekend_pct: new.weekend_pct,
            km_included_per_day: new.km_included_per_day,
            extra_km_cents: new.extra_km_cents,
            deposit_cents: new.deposit_cents,
            rounding: new.rounding,
            second_driver_daily_cents: new.second_driver_daily_cents,
            seasons: Vec::new(),
            tiers: Vec::new(),
            created_by: actor.to_string(),
        };
        txn.record(Event::PriceListWritten(list.clone()));
        self.commit(&mut lock, txn).await?;
        info!(price_list_id = %list.id, vehicle_id = %list.vehicle_id, version, "price list created");
        Ok(list)
    }

    pub async fn add_season(&self, price_list_id: Ulid, season: NewSeason, actor: &str) -> Result<PriceList, EngineError> {
        validate_text("name", &season.name, MAX_TEXT_LEN)?;
        surcharge("season_pct", Some(season.season_pct))?;
        surcharge("weekend_pct_override", season.weekend_pct_override)?;
        self.edit_price_list(price_list_id, actor, move |list| {
            if list.seasons.iter().any(|s| s.id == season.id) {
                return Err(EngineError::AlreadyExists {
                    entity: "season",
                    key: season.id.to_string(),
                });
            }
            list.seasons.push(Season {
                id: season.id,
                name: season.name,
                start_mmdd: season.start_mmdd,
                end_mmdd: season.end_mmdd,
                season_pct: season.season_pct,
                weekend_pct_override: season.weekend_pct_override,
                priority: season.priority,
                is_active: season.is_active,
            });
            Ok(())
        })
        .await
    }

    pub async fn add_tier(&self, price_list_id: Ulid, tier: NewTier, actor: &str) -> Result<PriceList, EngineError> {
        if tier.min_days == 0 {
            return Err(EngineError::validation("min_days", "must be at least 1"));
        }
        if let Some(max) = tier.max_days
            && max < tier.min_days
        {
            return Err(EngineError::validation("max_days", "is below min_days"));
        }
        match (tier.override_daily_cents, tier.discount_pct) {
            (Some(_), Some(_)) | (None, None) => {
                return Err(EngineError::validation(
                    "override_daily_cents",
                    "a tier sets exactly one of override_daily_cents and discount_pct",
                ));
            }
            (Some(cents), None) => non_negative("override_daily_cents", Some(cents))?,
            (None, Some(pct)) => {
                if pct < Decimal::ZERO || pct > Decimal::ONE_HUNDRED {
                    return Err(EngineError::validation("discount_pct", "must be between 0 and 100"));
                }
            }
        }
        self.edit_price_list(price_list_id, actor, move |list| {
            if list.tiers.iter().any(|t| t.id == tier.id) {
                return Err(EngineError::AlreadyExists {
                    entity: "tier",
                    key: tier.id.to_string(),
                });
            }
            list.tiers.push(Tier {
                id: tier.id,
                min_days: tier.min_days,
                max_days: tier.max_days,
                override_daily_cents: tier.override_daily_cents,
                discount_pct: tier.discount_pct,
                priority: tier.priority,
                is_active: tier.is_active,
            });
            Ok(())
        })
        .await
    }

    async fn edit_price_list(
        &self,
        price_list_id: Ulid,
        actor: &str,
        edit: impl FnOnce(&mut PriceList) -> Result<(), EngineError>,
    ) -> Result<PriceList, EngineError> {
        let vehicle_id = self.resolve_vehicle("price list", price_list_id)?;
        self.authorize(actor, Action::ManagePriceList, vehicle_id)?;
        let mut lock = self.lock_vehicle(vehicle_id).await?;
        let mut txn = Txn::begin(&lock);
        ledger::activate_due(&mut txn, self.now())?;

        let mut list = txn
            .staged
            .price_list(price_list_id)
            .cloned()
            .ok_or(EngineError::not_found("price list", price_list_id))?;
        if list.status == PriceListStatus::Archived {
            return Err(EngineError::validation("status", "archived price lists are read-only"));
        }
        edit(&mut list)?;
        txn.record(Event::PriceListWritten(list.clone()));
        self.commit(&mut lock, txn).await?;
        Ok(list)
    }

    /// Make a version the pair's active list. The previous active version is
    /// archived in the same transaction.
    pub async fn publish_price_list(&self, price_list_id: Ulid, actor: &str) -> Result<PriceList, EngineError> {
        let vehicle_id = self.resolve_vehicle("price list", price_list_id)?;
        self.authorize(actor, Action::ManagePriceList, vehicle_id)?;
        let mut lock = self.lock_vehicle(vehicle_id).await?;
        let mut txn = Txn::begin(&lock);
        ledger::activate_due(&mut txn, self.now())?;

        let list = txn
            .staged
            .price_list(price_list_id)
            .cloned()
            .ok_or(EngineError::not_found("price list", price_list_id))?;
        match list.status {
            PriceListStatus::Active => return Ok(list),
            PriceListStatus::Archived => {
                return Err(EngineError::validation("status", "archived price lists cannot be republished"));
            }
            PriceListStatus::Draft => {}
        }

        let previous: Vec<PriceList> = txn
            .staged
            .price_lists
            .iter()
            .filter(|p| p.renter_org_id == list.renter_org_id && p.active_flag.is_some())
            .cloned()
            .collect();
        for prev in previous {
            txn.record(Event::PriceListWritten(PriceList {
                status: PriceListStatus::Archived,
                active_flag: None,
                ..prev
            }));
        }
        let published = PriceList {
            status: PriceListStatus::Active,
            active_flag: Some(1),
            ..list
        };
        txn.record(Event::PriceListWritten(published.clone()));
        active_for(&txn.staged, published.renter_org_id)?;

        self.commit(&mut lock, txn).await?;
        info!(price_list_id = %published.id, vehicle_id = %published.vehicle_id, version = published.version, "price list published");
        Ok(published)
    }

    pub async fn archive_price_list(&self, price_list_id: Ulid, actor: &str) -> Result<PriceList, EngineError> {
        let vehicle_id = self.resolve_vehicle("price list", price_list_id)?;
        self.authorize(actor, Action::ManagePriceList, vehicle_id)?;
        let mut lock = self.lock_vehicle(vehicle_id).await?;
        let mut txn = Txn::begin(&lock);
        ledger::activate_due(&mut txn, self.now())?;

        let list = txn
            .staged
            .price_list(price_list_id)
            .cloned()
            .ok_or(EngineError::not_found("price list", price_list_id))?;
        if list.status == PriceListStatus::Archived {
            return Ok(list);
        }
        let archived = PriceList {
            status: PriceListStatus::Archived,
            active_flag: None,
            ..list
        };
        txn.record(Event::PriceListWritten(archived.clone()));
        self.commit(&mut lock, txn).await?;
        Ok(archived)
    }

    /// The single active list for (vehicle, renter).
    pub async fn active_price_list(&self, vehicle_id: Ulid, renter_org_id: Ulid) -> Result<PriceList, EngineError> {
        let timeline = self
            .timeline(&vehicle_id)
            .ok_or(EngineError::not_found("vehicle", vehicle_id))?;
        let tl = timeline.read().await;
        active_for(&tl, renter_org_id)?
            .cloned()
            .ok_or(EngineError::not_found("active price list", vehicle_id))
    }

    pub async fn quote_price_list(&self, price_list_id: Ulid, req: &QuoteRequest) -> Result<Quote, EngineError> {
        validate_quote_window(req)?;
        let vehicle_id = self.resolve_vehicle("price list", price_list_id)?;
        let timeline = self
            .timeline(&vehicle_id)
            .ok_or(EngineError::not_found("vehicle", vehicle_id))?;
        let tl = timeline.read().await;
        let list = tl
            .price_list(price_list_id)
            .ok_or(EngineError::not_found("price list", price_list_id))?;
        pricing::quote(list, req, self.tz)
    }

    /// Quote against whichever version is active for the pair.
    pub async fn quote_active(&self, vehicle_id: Ulid, renter_org_id: Ulid, req: &QuoteRequest) -> Result<Quote, EngineError> {
        validate_quote_window(req)?;
        let list = self.active_price_list(vehicle_id, renter_org_id).await?;
        pricing::quote(&list, req, self.tz)
    }
}

fn validate_quote_window(req: &QuoteRequest) -> Result<(), EngineError> {
    validate_instant(req.pickup_at)?;
    validate_instant(req.return_at)
}

fn active_for(tl: &VehicleTimeline, renter_org_id: Ulid) -> Result<Option<&PriceList>, EngineError> {
    let mut active = tl
        .price_lists
        .iter()
        .filter(|p| p.renter_org_id == renter_org_id && p.active_flag == Some(1));
    match (active.next(), active.next()) {
        (Some(a), Some(b)) => Err(EngineError::InvariantViolation(format!(
            "price lists {} and {} are both active for vehicle {} and renter {renter_org_id}",
            a.id, b.id, tl.vehicle.id
        ))),
        (first, _) => Ok(first),
    }
}
