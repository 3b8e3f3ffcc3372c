use chrono::{DateTime, Datelike, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only instant type on the engine boundary.
pub type Ms = i64;

pub const HOUR_MS: Ms = 3_600_000;
pub const DAY_MS: Ms = 24 * HOUR_MS;

/// Render an instant for operator-facing messages.
pub fn fmt_ms(ms: Ms) -> String {
    match DateTime::<Utc>::from_timestamp_millis(ms) {
        Some(dt) => dt.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        None => ms.to_string(),
    }
}

// ── Interval overlap oracle ──────────────────────────────────────

/// Do `[start_a, end_a]` and `[start_b, end_b]` overlap? A missing end is +∞.
///
/// Touching boundaries count as overlap: a window ending at `t` conflicts
/// with one starting at `t`.
pub fn overlaps(start_a: Ms, end_a: Option<Ms>, start_b: Ms, end_b: Option<Ms>) -> bool {
    let end_a = end_a.unwrap_or(Ms::MAX);
    let end_b = end_b.unwrap_or(Ms::MAX);
    start_a <= end_b && start_b <= end_a
}

/// A time window whose end may be open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub start: Ms,
    pub end: Option<Ms>,
}

impl Window {
    pub fn new(start: Ms, end: Option<Ms>) -> Self {
        Self { start, end }
    }

    pub fn bounded(start: Ms, end: Ms) -> Self {
        Self { start, end: Some(end) }
    }

    pub fn overlaps(&self, other: &Window) -> bool {
        overlaps(self.start, self.end, other.start, other.end)
    }

    /// Returns true if `self` fully contains `inner`.
    pub fn contains_window(&self, inner: &Window) -> bool {
        if inner.start < self.start {
            return false;
        }
        match (self.end, inner.end) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(outer), Some(inner)) => inner <= outer,
        }
    }
}

impl std::fmt::Display for Window {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.end {
            Some(end) => write!(f, "[{}, {}]", fmt_ms(self.start), fmt_ms(end)),
            None => write!(f, "[{}, open]", fmt_ms(self.start)),
        }
    }
}

// ── Status columns ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

/// String-backed enum matching a status column in the relational layout.
macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($text => Ok($name::$variant),)+
                    other => Err(UnknownVariant {
                        kind: stringify!($name),
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

string_enum! {
    /// What a vehicle is doing during one ledger interval.
    VehicleStateKind {
        Available => "available",
        Assigned => "assigned",
        Rented => "rented",
        Maintenance => "maintenance",
        Blocked => "blocked",
    }
}

string_enum! {
    AssignmentStatus {
        Scheduled => "scheduled",
        Active => "active",
        Ended => "ended",
        Revoked => "revoked",
    }
}

string_enum! {
    BlockKind {
        Maintenance => "maintenance",
        LegalHold => "legal_hold",
        CustomBlock => "custom_block",
    }
}

string_enum! {
    BlockStatus {
        Scheduled => "scheduled",
        Active => "active",
        Ended => "ended",
        Cancelled => "cancelled",
    }
}

string_enum! {
    RentalStatus {
        Draft => "draft",
        Reserved => "reserved",
        CheckedOut => "checked_out",
        InUse => "in_use",
        CheckedIn => "checked_in",
        Closed => "closed",
        Cancelled => "cancelled",
        NoShow => "no_show",
    }
}

string_enum! {
    PriceListStatus {
        Draft => "draft",
        Active => "active",
        Archived => "archived",
    }
}

string_enum! {
    /// How a quote total is rounded.
    Rounding {
        None => "none",
        Up1 => "up_1",
        Up5 => "up_5",
    }
}

impl AssignmentStatus {
    /// Scheduled and active assignments occupy the vehicle's calendar.
    pub fn is_live(self) -> bool {
        matches!(self, AssignmentStatus::Scheduled | AssignmentStatus::Active)
    }
}

impl BlockStatus {
    pub fn is_live(self) -> bool {
        matches!(self, BlockStatus::Scheduled | BlockStatus::Active)
    }
}

impl BlockKind {
    /// Ledger state a vehicle enters while this block is active.
    pub fn vehicle_state(self) -> VehicleStateKind {
        match self {
            BlockKind::Maintenance => VehicleStateKind::Maintenance,
            BlockKind::LegalHold | BlockKind::CustomBlock => VehicleStateKind::Blocked,
        }
    }
}

impl RentalStatus {
    /// The rental state machine: current state → allowed next states.
    pub fn allowed_next(self) -> &'static [RentalStatus] {
        use RentalStatus::*;
        match self {
            Draft => &[Reserved, Cancelled],
            Reserved => &[CheckedOut, Cancelled, NoShow],
            CheckedOut => &[InUse, CheckedIn],
            InUse => &[CheckedIn],
            CheckedIn => &[Closed],
            Closed | Cancelled | NoShow => &[],
        }
    }

    /// Cancelled and no-show rentals release the vehicle's calendar.
    pub fn blocks_calendar(self) -> bool {
        !matches!(self, RentalStatus::Cancelled | RentalStatus::NoShow)
    }

    /// Planned window, customer and drivers can still be edited.
    pub fn is_editable(self) -> bool {
        matches!(self, RentalStatus::Draft | RentalStatus::Reserved)
    }
}

/// Preconditions a rental must meet before entering `to`, beyond the table.
pub fn transition_precondition(rental: &Rental, to: RentalStatus) -> Result<(), &'static str> {
    match to {
        RentalStatus::Reserved | RentalStatus::CheckedOut if rental.customer_id.is_none() => {
            Err("a customer must be set")
        }
        _ => Ok(()),
    }
}

/// Single source of truth for rental status changes.
pub fn can_transition(rental: &Rental, to: RentalStatus) -> bool {
    rental.status.allowed_next().contains(&to) && transition_precondition(rental, to).is_ok()
}

// ── Calendar helpers ─────────────────────────────────────────────

/// Month and day without a year, written `MM-DD`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MonthDay {
    pub month: u32,
    pub day: u32,
}

impl MonthDay {
    pub fn parse(s: &str) -> Result<Self, String> {
        let (m, d) = s
            .trim()
            .split_once('-')
            .ok_or_else(|| format!("expected MM-DD, got {s:?}"))?;
        if m.len() != 2 || d.len() != 2 {
            return Err(format!("expected MM-DD, got {s:?}"));
        }
        let month: u32 = m.parse().map_err(|_| format!("bad month in {s:?}"))?;
        let day: u32 = d.parse().map_err(|_| format!("bad day in {s:?}"))?;
        let max_day = match month {
            1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
            4 | 6 | 9 | 11 => 30,
            2 => 29,
            _ => return Err(format!("month out of range in {s:?}")),
        };
        if day == 0 || day > max_day {
            return Err(format!("day out of range in {s:?}"));
        }
        Ok(Self { month, day })
    }

    pub fn of(date: NaiveDate) -> Self {
        Self {
            month: date.month(),
            day: date.day(),
        }
    }

    /// Is `date` inside `[start, end]`? Ranges with `start > end` wrap the year end.
    pub fn range_contains(start: MonthDay, end: MonthDay, date: NaiveDate) -> bool {
        let d = Self::of(date);
        if start <= end {
            start <= d && d <= end
        } else {
            d >= start || d <= end
        }
    }
}

impl std::fmt::Display for MonthDay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02}-{:02}", self.month, self.day)
    }
}

// ── Rows ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vehicle {
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
    pub active: bool,
    pub created_by: String,
}

/// One interval of the vehicle state ledger. `ended_at = None` marks the current state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VehicleState {
    pub id: Ulid,
    pub vehicle_id: Ulid,
    pub state: VehicleStateKind,
    pub started_at: Ms,
    pub ended_at: Option<Ms>,
    pub reason: String,
    pub created_by: String,
    /// Assignment, block or rental this row was written for.
    pub source_id: Option<Ulid>,
}

impl VehicleState {
    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub id: Ulid,
    pub vehicle_id: Ulid,
    pub renter_org_id: Ulid,
    pub start_at: Ms,
    pub end_at: Option<Ms>,
    pub status: AssignmentStatus,
    pub mileage_start: Option<u64>,
    pub mileage_end: Option<u64>,
    pub created_by: String,
}

impl Assignment {
    pub fn window(&self) -> Window {
        Window::new(self.start_at, self.end_at)
    }

    /// Status as seen at `now`: a scheduled row whose start has passed is active.
    pub fn status_at(&self, now: Ms) -> AssignmentStatus {
        match self.status {
            AssignmentStatus::Scheduled if self.start_at <= now => AssignmentStatus::Active,
            status => status,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub id: Ulid,
    pub vehicle_id: Ulid,
    pub organization_id: Ulid,
    pub kind: BlockKind,
    pub start_at: Ms,
    pub end_at: Option<Ms>,
    pub status: BlockStatus,
    pub reason: String,
    pub created_by: String,
}

impl Block {
    pub fn window(&self) -> Window {
        Window::new(self.start_at, self.end_at)
    }

    pub fn status_at(&self, now: Ms) -> BlockStatus {
        match self.status {
            BlockStatus::Scheduled if self.start_at <= now => BlockStatus::Active,
            status => status,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customer {
    pub id: Ulid,
    pub organization_id: Ulid,
    pub full_name: String,
    pub driver_license_expires_on: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rental {
    pub id: Ulid,
    pub organization_id: Ulid,
    pub vehicle_id: Ulid,
    pub assignment_id: Ulid,
    pub customer_id: Option<Ulid>,
    pub second_driver_id: Option<Ulid>,
    pub planned_pickup_at: Ms,
    pub planned_return_at: Ms,
    pub actual_pickup_at: Option<Ms>,
    pub actual_return_at: Option<Ms>,
    pub pickup_location_id: Option<Ulid>,
    pub return_location_id: Option<Ulid>,
    pub status: RentalStatus,
    pub number_id: u64,
    #[serde(with = "rust_decimal::serde::str_option")]
    pub admin_fee_percent: Option<Decimal>,
    pub admin_fee_amount_cents: Option<i64>,
    pub final_amount_override_cents: Option<i64>,
    pub created_by: String,
}

impl Rental {
    pub fn window(&self) -> Window {
        Window::bounded(self.planned_pickup_at, self.planned_return_at)
    }

    /// Drivers whose license and calendar must cover the rental.
    pub fn drivers(&self) -> impl Iterator<Item = Ulid> {
        self.customer_id.into_iter().chain(self.second_driver_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargeLine {
    pub id: Ulid,
    pub rental_id: Ulid,
    pub vehicle_id: Ulid,
    pub description: String,
    pub amount_cents: i64,
    pub commissionable: bool,
    pub created_by: String,
}

/// Admin fee percentage owed by an organization over a date range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeRate {
    pub id: Ulid,
    pub organization_id: Ulid,
    #[serde(with = "rust_decimal::serde::str")]
    pub percent: Decimal,
    pub effective_from: NaiveDate,
    pub effective_to: Option<NaiveDate>,
}

impl FeeRate {
    pub fn covers(&self, date: NaiveDate) -> bool {
        self.effective_from <= date && self.effective_to.is_none_or(|to| date <= to)
    }
}

/// Append-only record of a contract number handed out to a rental.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractNumber {
    pub organization_id: Ulid,
    pub rental_id: Ulid,
    pub number_id: u64,
    pub created_by: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Season {
    pub id: Ulid,
    pub name: String,
    pub start_mmdd: MonthDay,
    pub end_mmdd: MonthDay,
    #[serde(with = "rust_decimal::serde::str")]
    pub season_pct: Decimal,
    #[serde(with = "rust_decimal::serde::str_option")]
    pub weekend_pct_override: Option<Decimal>,
    pub priority: i32,
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tier {
    pub id: Ulid,
    pub min_days: u32,
    pub max_days: Option<u32>,
    pub override_daily_cents: Option<i64>,
    #[serde(with = "rust_decimal::serde::str_option")]
    pub discount_pct: Option<Decimal>,
    pub priority: i32,
    pub is_active: bool,
}

impl Tier {
    pub fn covers(&self, days: u32) -> bool {
        self.min_days <= days && self.max_days.is_none_or(|max| days <= max)
    }
}

/// Versioned rate card for one (vehicle, renter organization) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceList {
    pub id: Ulid,
    pub vehicle_id: Ulid,
    pub renter_org_id: Ulid,
    pub version: u32,
    pub status: PriceListStatus,
    /// `Some(1)` on the active version, `None` everywhere else.
    pub active_flag: Option<u8>,
    pub base_daily_cents: i64,
    #[serde(with = "rust_decimal::serde::str")]
    pub weekend_pct: Decimal,
    pub km_included_per_day: Option<u32>,
    pub extra_km_cents: Option<i64>,
    pub deposit_cents: Option<i64>,
    pub rounding: Rounding,
    pub second_driver_daily_cents: Option<i64>,
    pub seasons: Vec<Season>,
    pub tiers: Vec<Tier>,
    pub created_by: String,
}

// ── Per-vehicle row set ──────────────────────────────────────────

/// Every row owned by one vehicle. Guarded as a unit by the vehicle's lock.
#[derive(Debug, Clone)]
pub struct VehicleTimeline {
    pub vehicle: Vehicle,
    /// Ledger rows, sorted by `started_at`.
    pub states: Vec<VehicleState>,
    pub assignments: Vec<Assignment>,
    pub blocks: Vec<Block>,
    pub rentals: Vec<Rental>,
    pub charges: Vec<ChargeLine>,
    pub price_lists: Vec<PriceList>,
}

impl VehicleTimeline {
    pub fn new(vehicle: Vehicle) -> Self {
        Self {
            vehicle,
            states: Vec::new(),
            assignments: Vec::new(),
            blocks: Vec::new(),
            rentals: Vec::new(),
            charges: Vec::new(),
            price_lists: Vec::new(),
        }
    }

    pub fn row_count(&self) -> usize {
        self.states.len()
            + self.assignments.len()
            + self.blocks.len()
            + self.rentals.len()
            + self.charges.len()
            + self.price_lists.len()
    }

    pub fn open_states(&self) -> impl Iterator<Item = &VehicleState> {
        self.states.iter().filter(|s| s.is_open())
    }

    pub fn state(&self, id: Ulid) -> Option<&VehicleState> {
        self.states.iter().find(|s| s.id == id)
    }

    pub fn assignment(&self, id: Ulid) -> Option<&Assignment> {
        self.assignments.iter().find(|a| a.id == id)
    }

    pub fn block(&self, id: Ulid) -> Option<&Block> {
        self.blocks.iter().find(|b| b.id == id)
    }

    pub fn rental(&self, id: Ulid) -> Option<&Rental> {
        self.rentals.iter().find(|r| r.id == id)
    }

    pub fn price_list(&self, id: Ulid) -> Option<&PriceList> {
        self.price_lists.iter().find(|p| p.id == id)
    }

    /// Insert or replace a ledger row, keeping `started_at` order.
    fn upsert_state(&mut self, row: VehicleState) {
        self.states.retain(|s| s.id != row.id);
        let pos = self
            .states
            .partition_point(|s| s.started_at <= row.started_at);
        self.states.insert(pos, row);
    }

    /// Apply a vehicle-scoped event. Global events are ignored here.
    pub fn apply(&mut self, event: &Event) {
        match event {
            Event::VehicleRegistered(v) | Event::VehicleUpdated(v) => self.vehicle = v.clone(),
            Event::StateWritten(row) => self.upsert_state(row.clone()),
            Event::StateDeleted { id, .. } => self.states.retain(|s| s.id != *id),
            Event::AssignmentWritten(row) => upsert(&mut self.assignments, row.clone(), |a| a.id),
            Event::AssignmentDeleted { id, .. } => self.assignments.retain(|a| a.id != *id),
            Event::BlockWritten(row) => upsert(&mut self.blocks, row.clone(), |b| b.id),
            Event::BlockDeleted { id, .. } => self.blocks.retain(|b| b.id != *id),
            Event::RentalWritten(row) => upsert(&mut self.rentals, row.clone(), |r| r.id),
            Event::ChargeAdded(row) => self.charges.push(row.clone()),
            Event::PriceListWritten(row) => upsert(&mut self.price_lists, row.clone(), |p| p.id),
            Event::CustomerWritten(_)
            | Event::FeeRateWritten(_)
            | Event::ContractNumberIssued(_) => {}
        }
    }
}

fn upsert<T>(rows: &mut Vec<T>, row: T, id: impl Fn(&T) -> Ulid) {
    let key = id(&row);
    match rows.iter_mut().find(|r| id(r) == key) {
        Some(slot) => *slot = row,
        None => rows.push(row),
    }
}

// ── WAL record vocabulary ────────────────────────────────────────

/// Full row images. A committed transaction is a `Vec<Event>` written as one WAL record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    VehicleRegistered(Vehicle),
    VehicleUpdated(Vehicle),
    StateWritten(VehicleState),
    StateDeleted { id: Ulid, vehicle_id: Ulid },
    AssignmentWritten(Assignment),
    AssignmentDeleted { id: Ulid, vehicle_id: Ulid },
    BlockWritten(Block),
    BlockDeleted { id: Ulid, vehicle_id: Ulid },
    RentalWritten(Rental),
    ChargeAdded(ChargeLine),
    PriceListWritten(PriceList),
    CustomerWritten(Customer),
    FeeRateWritten(FeeRate),
    ContractNumberIssued(ContractNumber),
}

impl Event {
    /// The vehicle whose rows this event touches, if any.
    pub fn vehicle_id(&self) -> Option<Ulid> {
        match self {
            Event::VehicleRegistered(v) | Event::VehicleUpdated(v) => Some(v.id),
            Event::StateWritten(r) => Some(r.vehicle_id),
            Event::AssignmentWritten(r) => Some(r.vehicle_id),
            Event::BlockWritten(r) => Some(r.vehicle_id),
            Event::RentalWritten(r) => Some(r.vehicle_id),
            Event::ChargeAdded(r) => Some(r.vehicle_id),
            Event::PriceListWritten(r) => Some(r.vehicle_id),
            Event::StateDeleted { vehicle_id, .. }
            | Event::AssignmentDeleted { vehicle_id, .. }
            | Event::BlockDeleted { vehicle_id, .. } => Some(*vehicle_id),
            Event::CustomerWritten(_)
            | Event::FeeRateWritten(_)
            | Event::ContractNumberIssued(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlap_touching_boundary_counts() {
        assert!(overlaps(100, Some(200), 200, Some(300)));
        assert!(overlaps(200, Some(300), 100, Some(200)));
        assert!(!overlaps(100, Some(199), 200, Some(300)));
    }

    #[test]
    fn overlap_open_end_is_infinite() {
        assert!(overlaps(100, None, 5_000_000, Some(5_000_001)));
        assert!(overlaps(100, None, 50, None));
        assert!(!overlaps(100, None, 0, Some(99)));
    }

    #[test]
    fn overlap_zero_length() {
        assert!(overlaps(100, Some(100), 100, Some(100)));
        assert!(overlaps(100, Some(100), 50, Some(150)));
        assert!(!overlaps(100, Some(100), 101, None));
    }

    #[test]
    fn overlap_symmetric_and_matches_brute_force() {
        // Every well-formed interval over a small grid, closed ends plus open.
        let mut intervals = Vec::new();
        for s in 0..7 {
            intervals.push((s, None));
            for e in s..7 {
                intervals.push((s, Some(e)));
            }
        }
        let horizon = 20;
        let contains = |(s, e): (Ms, Option<Ms>), t: Ms| s <= t && e.is_none_or(|e| t <= e);
        for &a in &intervals {
            for &b in &intervals {
                let fast = overlaps(a.0, a.1, b.0, b.1);
                assert_eq!(fast, overlaps(b.0, b.1, a.0, a.1), "asymmetric for {a:?} {b:?}");
                let brute = (0..horizon).any(|t| contains(a, t) && contains(b, t));
                assert_eq!(fast, brute, "disagrees with brute force for {a:?} {b:?}");
            }
        }
    }

    #[test]
    fn window_contains_window() {
        let outer = Window::bounded(100, 400);
        assert!(outer.contains_window(&Window::bounded(100, 400)));
        assert!(outer.contains_window(&Window::bounded(150, 300)));
        assert!(!outer.contains_window(&Window::bounded(50, 300)));
        assert!(!outer.contains_window(&Window::new(150, None)));
        assert!(Window::new(100, None).contains_window(&Window::new(150, None)));
    }

    #[test]
    fn window_display_shows_both_ends_closed() {
        let w = Window::bounded(0, 86_400_000);
        assert_eq!(w.to_string(), "[1970-01-01T00:00:00Z, 1970-01-02T00:00:00Z]");
        assert_eq!(Window::new(0, None).to_string(), "[1970-01-01T00:00:00Z, open]");
    }

    #[test]
    fn status_strings_roundtrip() {
        for s in ["draft", "reserved", "checked_out", "in_use", "checked_in", "closed", "cancelled", "no_show"] {
            let status: RentalStatus = s.parse().unwrap();
            assert_eq!(status.as_str(), s);
        }
        assert_eq!("UP_5".parse::<Rounding>().unwrap(), Rounding::Up5);
        let err = "parked".parse::<VehicleStateKind>().unwrap_err();
        assert_eq!(err.to_string(), "unknown VehicleStateKind: parked");
    }

    #[test]
    fn rental_state_machine_is_one_way() {
        use RentalStatus::*;
        assert!(Draft.allowed_next().contains(&Reserved));
        assert!(!Reserved.allowed_next().contains(&Draft));
        // in_use is optional
        assert!(CheckedOut.allowed_next().contains(&CheckedIn));
        assert!(!Draft.allowed_next().contains(&CheckedOut));
        assert!(Reserved.allowed_next().contains(&NoShow));
        assert!(!Draft.allowed_next().contains(&NoShow));
        for terminal in [Closed, Cancelled, NoShow] {
            assert!(terminal.allowed_next().is_empty());
        }
        assert!(!Cancelled.blocks_calendar());
        assert!(!NoShow.blocks_calendar());
        assert!(CheckedIn.blocks_calendar());
    }

    #[test]
    fn month_day_parse() {
        assert_eq!(MonthDay::parse("12-01").unwrap(), MonthDay { month: 12, day: 1 });
        assert!(MonthDay::parse("02-29").is_ok());
        assert!(MonthDay::parse("02-30").is_err());
        assert!(MonthDay::parse("13-01").is_err());
        assert!(MonthDay::parse("1-01").is_err());
        assert!(MonthDay::parse("0101").is_err());
        assert_eq!(MonthDay::parse("06-15").unwrap().to_string(), "06-15");
    }

    #[test]
    fn month_day_wrapping_range() {
        let start = MonthDay::parse("12-01").unwrap();
        let end = MonthDay::parse("02-28").unwrap();
        let d = |y, m, d| NaiveDate::from_ymd_opt(y, m, d).unwrap();
        assert!(MonthDay::range_contains(start, end, d(2024, 12, 25)));
        assert!(MonthDay::range_contains(start, end, d(2025, 1, 10)));
        assert!(MonthDay::range_contains(start, end, d(2025, 2, 28)));
        assert!(!MonthDay::range_contains(start, end, d(2025, 3, 1)));
        assert!(!MonthDay::range_contains(start, end, d(2025, 11, 30)));

        let summer_start = MonthDay::parse("06-01").unwrap();
        let summer_end = MonthDay::parse("08-31").unwrap();
        assert!(MonthDay::range_contains(summer_start, summer_end, d(2025, 7, 4)));
        assert!(!MonthDay::range_contains(summer_start, summer_end, d(2025, 9, 1)));
    }

    #[test]
    fn assignment_effective_status() {
        let a = Assignment {
            id: Ulid::new(),
            vehicle_id: Ulid::new(),
            renter_org_id: Ulid::new(),
            start_at: 1_000,
            end_at: None,
            status: AssignmentStatus::Scheduled,
            mileage_start: None,
            mileage_end: None,
            created_by: "ops".into(),
        };
        assert_eq!(a.status_at(999), AssignmentStatus::Scheduled);
        assert_eq!(a.status_at(1_000), AssignmentStatus::Active);
    }

    #[test]
    fn timeline_keeps_states_ordered() {
        let vehicle = Vehicle {
            id: Ulid::new(),
            admin_org_id: Ulid::new(),
            plate: "AB-123".into(),
            vin: None,
            make: "Fiat".into(),
            model: "Panda".into(),
            year: 2022,
            fuel_type: "petrol".into(),
            transmission: "manual".into(),
            seats: 5,
            mileage: 0,
            active: true,
            created_by: "ops".into(),
        };
        let mut tl = VehicleTimeline::new(vehicle.clone());
        let row = |started_at| VehicleState {
            id: Ulid::new(),
            vehicle_id: vehicle.id,
            state: VehicleStateKind::Available,
            started_at,
            ended_at: Some(started_at + 1),
            reason: String::new(),
            created_by: "ops".into(),
            source_id: None,
        };
        for t in [300, 100, 200] {
            tl.apply(&Event::StateWritten(row(t)));
        }
        let starts: Vec<Ms> = tl.states.iter().map(|s| s.started_at).collect();
        assert_eq!(starts, vec![100, 200, 300]);

        let mut reopened = tl.states[0].clone();
        reopened.ended_at = None;
        tl.apply(&Event::StateWritten(reopened));
        assert_eq!(tl.states.len(), 3);
        assert_eq!(tl.open_states().count(), 1);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::FeeRateWritten(FeeRate {
            id: Ulid::new(),
            organization_id: Ulid::new(),
            percent: Decimal::new(125, 1),
            effective_from: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            effective_to: None,
        });
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
