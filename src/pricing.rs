//! Pure pricing functions — no side effects, no `sqlx` import.
//!
//! Price is a simple ratio of the two pools, clamped away from the edges so
//! share counts stay finite; shares bought are `collateral / price` on the
//! side taken; collateral backing a position is recovered from its shares
//! and entry price, with the short side mirroring the long formula rather
//! than sharing it.

use rust_decimal::Decimal;

use crate::error::{EngineError, EngineResult};

/// Lower clamp bound for price.
pub fn min_price() -> Decimal {
    Decimal::new(1, 2) // 0.01
}

/// Upper clamp bound for price.
pub fn max_price() -> Decimal {
    Decimal::new(99, 2) // 0.99
}

fn half() -> Decimal {
    Decimal::new(50, 2) // 0.50
}

/// `price(pool_true, pool_false) = clamp(pool_true / (pool_true + pool_false), 0.01, 0.99)`,
/// defaulting to 0.50 when both pools are zero.
pub fn price(pool_true: Decimal, pool_false: Decimal) -> Decimal {
    let total = pool_true + pool_false;
    if total.is_zero() {
        return half();
    }
    (pool_true / total).clamp(min_price(), max_price())
}

/// Shares received by a long (true-side) buyer staking `cc` at price `p`.
/// `sharesLong(cc, p) = cc / p`.
pub fn shares_long(cc: Decimal, p: Decimal) -> EngineResult<Decimal> {
    validate_trade_inputs(cc, p)?;
    Ok(cc / p)
}

/// Shares received by a short (false-side) buyer staking `cc` at price `p`.
/// `sharesShort(cc, p) = cc / (1 - p)`.
pub fn shares_short(cc: Decimal, p: Decimal) -> EngineResult<Decimal> {
    validate_trade_inputs(cc, p)?;
    Ok(cc / (Decimal::ONE - p))
}

fn validate_trade_inputs(cc: Decimal, p: Decimal) -> EngineResult<()> {
    if cc <= Decimal::ZERO {
        return Err(EngineError::InvalidInput(
            "collateral cost must be positive".into(),
        ));
    }
    if p <= Decimal::ZERO || p >= Decimal::ONE {
        return Err(EngineError::InvalidInput(
            "price must be strictly between 0 and 1".into(),
        ));
    }
    Ok(())
}

/// Collateral backing a long position: `max(0, shares * (1 - entry_price))`.
pub fn collateral_long(shares: Decimal, entry_price: Decimal) -> Decimal {
    (shares * (Decimal::ONE - entry_price)).max(Decimal::ZERO)
}

/// Collateral backing a short position, mirroring the long formula:
/// `max(0, shares * entry_price)`.
pub fn collateral_short(shares: Decimal, entry_price: Decimal) -> Decimal {
    (shares * entry_price).max(Decimal::ZERO)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    True,
    False,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::True => "true",
            Side::False => "false",
        }
    }

    pub fn from_str(s: &str) -> EngineResult<Self> {
        match s {
            "true" => Ok(Side::True),
            "false" => Ok(Side::False),
            other => Err(EngineError::InvalidInput(format!(
                "side must be 'true' or 'false', got '{other}'"
            ))),
        }
    }
}

/// `long`/`short` is the trader-facing direction; `true`/`false` is the
/// side of the claim it corresponds to. They coincide (long == true-side,
/// short == false-side) but are kept as distinct enums since the HTTP
/// surface speaks `long`/`short` while the data model speaks `true`/`false`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    pub fn from_str(s: &str) -> EngineResult<Self> {
        match s {
            "long" => Ok(Direction::Long),
            "short" => Ok(Direction::Short),
            other => Err(EngineError::InvalidInput(format!(
                "type must be 'long' or 'short', got '{other}'"
            ))),
        }
    }

    pub fn side(&self) -> Side {
        match self {
            Direction::Long => Side::True,
            Direction::Short => Side::False,
        }
    }
}

/// Shares for a trade, dispatching on side.
pub fn shares_for(side: Side, cc: Decimal, p: Decimal) -> EngineResult<Decimal> {
    match side {
        Side::True => shares_long(cc, p),
        Side::False => shares_short(cc, p),
    }
}

/// Collateral for a position, dispatching on side.
pub fn collateral_for(side: Side, shares: Decimal, entry_price: Decimal) -> Decimal {
    match side {
        Side::True => collateral_long(shares, entry_price),
        Side::False => collateral_short(shares, entry_price),
    }
}

/// Volume-weighted entry price after aggregating additional shares and cost
/// into an existing position on `side`.
pub fn aggregate_entry_price(
    side: Side,
    total_shares: Decimal,
    total_cost: Decimal,
    fallback_price: Decimal,
) -> Decimal {
    if total_shares <= Decimal::ZERO {
        return fallback_price;
    }
    match side {
        Side::True => total_cost / total_shares,
        Side::False => (Decimal::ONE - (total_cost / total_shares)).clamp(min_price(), max_price()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn dec(f: f64) -> Decimal {
        Decimal::from_str_exact(&format!("{f:.6}")).unwrap()
    }

    #[test]
    fn price_defaults_to_half_when_pools_empty() {
        assert_eq!(price(Decimal::ZERO, Decimal::ZERO), half());
    }

    #[test]
    fn price_clamps_at_extremes() {
        assert_eq!(price(dec(1000.0), dec(0.0001)), max_price());
        assert_eq!(price(dec(0.0001), dec(1000.0)), min_price());
    }

    #[test]
    fn long_bet_at_half_price_doubles_collateral_into_shares() {
        let p = dec(0.50);
        let shares = shares_long(dec(10.0), p).unwrap();
        assert_eq!(shares, dec(20.0));
    }

    #[test]
    fn short_collateral_mirrors_long() {
        let shares = dec(10.0);
        let entry = dec(0.4);
        assert_eq!(collateral_long(shares, entry), shares * (Decimal::ONE - entry));
        assert_eq!(collateral_short(shares, entry), shares * entry);
    }

    #[test]
    fn invalid_inputs_are_rejected() {
        assert!(shares_long(Decimal::ZERO, dec(0.5)).is_err());
        assert!(shares_long(dec(1.0), Decimal::ZERO).is_err());
        assert!(shares_long(dec(1.0), Decimal::ONE).is_err());
    }

    proptest! {
        #[test]
        fn price_is_always_within_bounds(pt in 0.0f64..1_000_000.0, pf in 0.0f64..1_000_000.0) {
            let p = price(dec(pt), dec(pf));
            prop_assert!(p >= min_price());
            prop_assert!(p <= max_price());
        }

        #[test]
        fn shares_times_price_round_trips_long(cc in 0.01f64..100_000.0, p in 0.01f64..0.99) {
            let shares = shares_long(dec(cc), dec(p)).unwrap();
            let recovered_cc = shares * dec(p);
            let diff = (recovered_cc - dec(cc)).abs();
            prop_assert!(diff < dec(0.001));
        }

        #[test]
        fn shares_times_complement_round_trips_short(cc in 0.01f64..100_000.0, p in 0.01f64..0.99) {
            let shares = shares_short(dec(cc), dec(p)).unwrap();
            let recovered_cc = shares * (Decimal::ONE - dec(p));
            let diff = (recovered_cc - dec(cc)).abs();
            prop_assert!(diff < dec(0.001));
        }

        #[test]
        fn collateral_is_never_negative(shares in 0.0f64..100_000.0, entry in 0.0f64..1.0) {
            prop_assert!(collateral_long(dec(shares), dec(entry)) >= Decimal::ZERO);
            prop_assert!(collateral_short(dec(shares), dec(entry)) >= Decimal::ZERO);
        }
    }
}
