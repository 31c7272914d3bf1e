//! Reserve capacity, insurance and accrual arithmetic
//!
//! Pure functions with no I/O. The ledger calls these before any mutation
//! is persisted; the scheduler and settlement reuse them so every path
//! agrees on the same numbers.

use rust_decimal::Decimal;

use crate::constants::{CAPACITY_RATIO, INSURANCE_RESERVE_SHARE, PRICE_CHANGE_SENTINEL};
use crate::model::{Pool, Stake};

const HUNDRED: Decimal = Decimal::ONE_HUNDRED;

/// Maximum outstanding principal a reserve can back (exclusive bound)
pub fn capacity_limit(reserve: Decimal) -> Decimal {
    reserve * CAPACITY_RATIO
}

/// Whether a new stake fits: `active + new < 0.1 × reserve`
pub fn fits_capacity(active_principal: Decimal, new_amount: Decimal, reserve: Decimal) -> bool {
    active_principal + new_amount < capacity_limit(reserve)
}

/// Room left under the capacity limit, never negative
pub fn capacity_left(active_principal: Decimal, reserve: Decimal) -> Decimal {
    (capacity_limit(reserve) - active_principal).max(Decimal::ZERO)
}

/// `(closed − open) / open × 100`
///
/// Both prices zero yields zero. A zero opening price with a non-zero
/// closing price yields [`PRICE_CHANGE_SENTINEL`] carrying the sign of the
/// closing price.
pub fn percent_price_change(closed_price: Decimal, open_price: Decimal) -> Decimal {
    if open_price.is_zero() {
        if closed_price.is_zero() {
            return Decimal::ZERO;
        }
        return if closed_price.is_sign_negative() {
            -PRICE_CHANGE_SENTINEL
        } else {
            PRICE_CHANGE_SENTINEL
        };
    }

    (closed_price - open_price)
        .checked_div(open_price)
        .and_then(|ratio| ratio.checked_mul(HUNDRED))
        .unwrap_or(if closed_price > open_price {
            PRICE_CHANGE_SENTINEL
        } else {
            -PRICE_CHANGE_SENTINEL
        })
}

/// `ceil((0.9 × reserve) × (amount / (0.1 × reserve)))`
///
/// The reserve cancels out, so the result equals `ceil(9 × amount)` for any
/// positive reserve. The product is formed before the division to keep the
/// quotient exact. A non-positive reserve uses the reduced form directly.
pub fn insurance_amount(reserve: Decimal, amount: Decimal) -> Decimal {
    let reduced = || amount * INSURANCE_RESERVE_SHARE * Decimal::TEN;

    if reserve <= Decimal::ZERO {
        return reduced().ceil();
    }

    (INSURANCE_RESERVE_SHARE * reserve)
        .checked_mul(amount)
        .and_then(|backed| backed.checked_div(CAPACITY_RATIO * reserve))
        .unwrap_or_else(reduced)
        .ceil()
}

/// Price change of a closed stake relative to its opening price
pub fn stake_price_change(stake: &Stake) -> Option<Decimal> {
    stake
        .jetton_price_closed
        .map(|closed| percent_price_change(closed, stake.deposit_creation_price))
}

/// Closed stake whose price dropped past the pool's insurance coating
pub fn is_insurance_eligible(pool: &Pool, stake: &Stake) -> bool {
    match stake_price_change(stake) {
        Some(change) => change < -pool.insurance_coating_percent,
        None => false,
    }
}

/// What the pool's reserve still owes a closed, unsettled stake
pub fn stake_liability(pool: &Pool, stake: &Stake) -> Decimal {
    let reward = stake.accrued_reward();
    if is_insurance_eligible(pool, stake) {
        insurance_amount(pool.reserve, stake.amount) + reward
    } else {
        reward
    }
}

/// Sum of liabilities over closed, unsettled stakes, floored at zero
pub fn outstanding_liability<'a, I>(pool: &Pool, stakes: I) -> Decimal
where
    I: IntoIterator<Item = &'a Stake>,
{
    stakes
        .into_iter()
        .filter(|stake| stake.pool_id == pool.id && stake.awaits_settlement())
        .map(|stake| stake_liability(pool, stake))
        .sum::<Decimal>()
        .max(Decimal::ZERO)
}

/// `reserve − outstanding_liability`
pub fn temp_reserve<'a, I>(pool: &Pool, stakes: I) -> Decimal
where
    I: IntoIterator<Item = &'a Stake>,
{
    pool.reserve - outstanding_liability(pool, stakes)
}

/// Reward added per accrual tick
pub fn daily_bonus(amount: Decimal, reward_percent: Decimal) -> Decimal {
    amount * reward_percent / HUNDRED
}

/// Contractual maximum balance: `amount × rewardPercent/100 × periodDays + amount`
pub fn accrual_cap(amount: Decimal, reward_percent: Decimal, period_days: u32) -> Decimal {
    daily_bonus(amount, reward_percent) * Decimal::from(period_days) + amount
}

/// Balance after one accrual tick, or `None` once the cap is reached
pub fn next_balance(pool: &Pool, stake: &Stake) -> Option<Decimal> {
    let cap = accrual_cap(stake.amount, pool.reward_percent, pool.period_days);
    if stake.balance >= cap {
        return None;
    }
    let bonus = daily_bonus(stake.amount, pool.reward_percent);
    Some((stake.balance + bonus).min(cap))
}
