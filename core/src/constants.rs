//! Protocol constants for pools and stakes

use rust_decimal::Decimal;

/// Share of the reserve that may back outstanding principal (0.1)
pub const CAPACITY_RATIO: Decimal = Decimal::from_parts(1, 0, 0, false, 1);

/// Share of the reserve set aside for insurance payouts (0.9)
pub const INSURANCE_RESERVE_SHARE: Decimal = Decimal::from_parts(9, 0, 0, false, 1);

/// Magnitude reported for a price change when the opening price is zero
pub const PRICE_CHANGE_SENTINEL: Decimal = Decimal::from_parts(1_000_000_000, 0, 0, false, 0);

/// Smallest reserve accepted when a pool is created
pub const MIN_RESERVE_DEPOSIT: Decimal = Decimal::ONE;

/// Allowed per-day reward percent range (inclusive)
pub const MIN_REWARD_PERCENT: Decimal = Decimal::ONE;
pub const MAX_REWARD_PERCENT: Decimal = Decimal::from_parts(30, 0, 0, false, 0);

/// Shortest pool term in days
pub const MIN_PERIOD_DAYS: u32 = 1;

/// Seconds per accrual day
pub const SECONDS_PER_DAY: i64 = 86_400;

/// Default page size for list queries
pub const DEFAULT_PAGE_LIMIT: usize = 20;
