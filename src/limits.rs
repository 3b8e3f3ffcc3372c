use crate::model::Ms;

pub const MAX_TENANTS: usize = 1_000;
pub const MAX_TENANT_NAME_LEN: usize = 256;

pub const MAX_VEHICLES_PER_TENANT: usize = 100_000;
/// States, assignments, blocks, rentals, charges and price lists together.
pub const MAX_ROWS_PER_VEHICLE: usize = 50_000;
pub const MAX_BATCH_SIZE: usize = 1_000;
pub const MAX_IN_CLAUSE_IDS: usize = 1_000;

pub const MAX_TEXT_LEN: usize = 1_024;
pub const MAX_PLATE_LEN: usize = 32;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// Longest rental a quote will price.
pub const MAX_QUOTE_DAYS: u32 = 731;
