//! Quote calculation for a single price list. Pure: no locks, no clock.

use chrono::{DateTime, Datelike, NaiveDate, Weekday};
use chrono_tz::Tz;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use ulid::Ulid;

use crate::engine::EngineError;
use crate::limits::MAX_QUOTE_DAYS;
use crate::model::{DAY_MS, MonthDay, Ms, PriceList, Rounding, Season, Tier};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuoteRequest {
    pub pickup_at: Ms,
    pub return_at: Ms,
    pub expected_km: u32,
    pub second_driver: bool,
}

/// All amounts in cents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quote {
    pub days: u32,
    pub daily_total_cents: i64,
    pub discount_cents: i64,
    pub km_extra_cents: i64,
    pub second_driver_cents: i64,
    /// Reported next to the total, never folded into it.
    pub deposit_cents: i64,
    pub total_cents: i64,
    pub tier_id: Option<Ulid>,
}

/// Billable days: started 24h blocks, minimum one.
pub fn billable_days(pickup_at: Ms, return_at: Ms) -> Result<u32, EngineError> {
    if return_at <= pickup_at {
        return Err(EngineError::Validation {
            field: "return_at",
            message: "return must be after pickup".into(),
        });
    }
    let span = return_at
        .checked_sub(pickup_at)
        .ok_or(EngineError::LimitExceeded("quote window too long"))?;
    let days = span / DAY_MS + i64::from(span % DAY_MS != 0);
    if days > MAX_QUOTE_DAYS as i64 {
        return Err(EngineError::LimitExceeded("quote window too long"));
    }
    Ok(days.max(1) as u32)
}

fn out_of_range() -> EngineError {
    EngineError::LimitExceeded("amount out of range")
}

fn mul(a: i64, b: i64) -> Result<i64, EngineError> {
    a.checked_mul(b).ok_or_else(out_of_range)
}

fn add(a: i64, b: i64) -> Result<i64, EngineError> {
    a.checked_add(b).ok_or_else(out_of_range)
}

pub fn quote(list: &PriceList, req: &QuoteRequest, tz: Tz) -> Result<Quote, EngineError> {
    let days = billable_days(req.pickup_at, req.return_at)?;
    let tier = select_tier(&list.tiers, days);

    let daily_total_cents = match tier.and_then(|t| t.override_daily_cents) {
        // Tier override replaces season and weekend adjustments entirely.
        Some(rate) => mul(rate, days as i64)?,
        None => {
            let mut sum = 0i64;
            for i in 0..days {
                let date = local_date(req.pickup_at + i as i64 * DAY_MS, tz)?;
                sum = add(sum, day_rate_cents(list, date)?)?;
            }
            sum
        }
    };

    let discount_cents = match tier {
        Some(t) if t.override_daily_cents.is_none() => match t.discount_pct {
            Some(pct) => percent_of(daily_total_cents, pct)?,
            None => 0,
        },
        _ => 0,
    };

    let km_extra_cents = match list.km_included_per_day {
        None => 0,
        Some(included) => {
            // u32 × u32 fits in i64.
            let allowance = included as i64 * days as i64;
            let over = (req.expected_km as i64 - allowance).max(0);
            mul(over, list.extra_km_cents.unwrap_or(0))?
        }
    };

    let second_driver_cents = if req.second_driver {
        mul(list.second_driver_daily_cents.unwrap_or(0), days as i64)?
    } else {
        0
    };

    let subtotal = add(
        add(daily_total_cents - discount_cents, km_extra_cents)?,
        second_driver_cents,
    )?
    .max(0);

    Ok(Quote {
        days,
        daily_total_cents,
        discount_cents,
        km_extra_cents,
        second_driver_cents,
        deposit_cents: list.deposit_cents.unwrap_or(0),
        total_cents: apply_rounding(subtotal, list.rounding)?,
        tier_id: tier.map(|t| t.id),
    })
}

/// One day's rate after the season modifier and weekend surcharge, in cents.
fn day_rate_cents(list: &PriceList, date: NaiveDate) -> Result<i64, EngineError> {
    let season = select_season(&list.seasons, date);
    let mut rate = Decimal::from(list.base_daily_cents);
    if let Some(s) = season {
        rate = scale(rate, s.season_pct)?;
    }
    if matches!(date.weekday(), Weekday::Sat | Weekday::Sun) {
        let weekend_pct = season
            .and_then(|s| s.weekend_pct_override)
            .unwrap_or(list.weekend_pct);
        rate = scale(rate, weekend_pct)?;
    }
    to_cents(rate)
}

/// Highest priority wins; equal priority falls back to the lowest id.
pub fn select_season(seasons: &[Season], date: NaiveDate) -> Option<&Season> {
    seasons
        .iter()
        .filter(|s| s.is_active && MonthDay::range_contains(s.start_mmdd, s.end_mmdd, date))
        .max_by(|a, b| a.priority.cmp(&b.priority).then(b.id.cmp(&a.id)))
}

pub fn select_tier(tiers: &[Tier], days: u32) -> Option<&Tier> {
    tiers
        .iter()
        .filter(|t| t.is_active && t.covers(days))
        .max_by(|a, b| a.priority.cmp(&b.priority).then(b.id.cmp(&a.id)))
}

/// `rate × (1 + pct/100)`.
fn scale(rate: Decimal, pct: Decimal) -> Result<Decimal, EngineError> {
    (Decimal::ONE + pct / Decimal::ONE_HUNDRED)
        .checked_mul(rate)
        .ok_or_else(out_of_range)
}

pub fn apply_rounding(cents: i64, policy: Rounding) -> Result<i64, EngineError> {
    let step = match policy {
        Rounding::None => return Ok(cents),
        Rounding::Up1 => 100,
        Rounding::Up5 => 500,
    };
    mul(add(cents, step - 1)?.div_euclid(step), step)
}

fn to_cents(amount: Decimal) -> Result<i64, EngineError> {
    amount
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .ok_or_else(out_of_range)
}

/// Round half-up a percentage of `cents`. Shared with the fee snapshot.
pub fn percent_of(cents: i64, pct: Decimal) -> Result<i64, EngineError> {
    let amount = Decimal::from(cents).checked_mul(pct).ok_or_else(out_of_range)?;
    to_cents(amount / Decimal::ONE_HUNDRED)
}

pub fn local_date(at: Ms, tz: Tz) -> Result<NaiveDate, EngineError> {
    DateTime::from_timestamp_millis(at)
        .map(|dt| dt.with_timezone(&tz).date_naive())
        .ok_or(EngineError::LimitExceeded("timestamp out of range"))
}
