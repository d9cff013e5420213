//! Trade Engine: validates and executes bets, aggregating them into
//! per-user, per-market, per-side positions and appending an audit trail.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::{PgPool, Postgres, Transaction};

use crate::error::{EngineError, EngineResult};
use crate::ledger;
use crate::market::{self, Market};
use crate::pricing::{self, Direction, Side};

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Position {
    pub id: i64,
    pub user_id: i64,
    pub market_id: i64,
    pub side: String,
    pub shares: Decimal,
    pub entry_price: Decimal,
    pub cost_basis: Decimal,
    pub collateral: Decimal,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct BetOutcome {
    pub market: Market,
    pub position: Position,
    pub shares: Decimal,
    pub new_price: Decimal,
}

/// Places a bet. Runs entirely inside one transaction: a lock on the
/// trader's funds, a pool mutation + price recompute on the market, a
/// position upsert, and a trade audit row, in that order. Any failure rolls
/// the whole transaction back.
pub async fn place_bet(
    pool: &PgPool,
    user_id: i64,
    market_id: i64,
    direction: Direction,
    cc: Decimal,
) -> EngineResult<BetOutcome> {
    if cc <= Decimal::ZERO {
        return Err(EngineError::InvalidInput("cc_amount must be positive".into()));
    }

    let mut tx = pool.begin().await?;

    let market = sqlx::query_as::<_, Market>("SELECT * FROM markets WHERE id = $1 FOR UPDATE")
        .bind(market_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("market {market_id}")))?;

    if !market.is_active() {
        return Err(EngineError::InvalidState(format!("market {market_id} is not active")));
    }

    let side = direction.side();
    let execution_price = market.price;
    let shares = pricing::shares_for(side, cc, execution_price)?;

    ledger::lock(&mut tx, user_id, cc).await?;

    let market = market::apply_pool_delta(&mut tx, market_id, side, cc).await?;

    let position = upsert_position(&mut tx, user_id, market_id, side, cc, shares, execution_price).await?;

    sqlx::query(
        "INSERT INTO trades (user_id, market_id, side, cc_amount, shares, price_at_execution)
         VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(user_id)
    .bind(market_id)
    .bind(side.as_str())
    .bind(cc)
    .bind(shares)
    .bind(execution_price)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    Ok(BetOutcome {
        new_price: market.price,
        market,
        position,
        shares,
    })
}

async fn upsert_position(
    tx: &mut Transaction<'_, Postgres>,
    user_id: i64,
    market_id: i64,
    side: Side,
    cc: Decimal,
    add_shares: Decimal,
    fallback_price: Decimal,
) -> EngineResult<Position> {
    let existing = sqlx::query_as::<_, Position>(
        "SELECT * FROM positions WHERE user_id = $1 AND market_id = $2 AND side = $3 AND status = 'open' FOR UPDATE",
    )
    .bind(user_id)
    .bind(market_id)
    .bind(side.as_str())
    .fetch_optional(&mut **tx)
    .await?;

    let (new_shares, new_cost) = match &existing {
        Some(p) => (p.shares + add_shares, p.cost_basis + cc),
        None => (add_shares, cc),
    };
    let new_entry_price = pricing::aggregate_entry_price(side, new_shares, new_cost, fallback_price);
    let new_collateral = pricing::collateral_for(side, new_shares, new_entry_price);

    let position = match existing {
        Some(p) => {
            sqlx::query_as::<_, Position>(
                "UPDATE positions SET shares = $1, entry_price = $2, cost_basis = $3, collateral = $4, updated_at = now()
                 WHERE id = $5 RETURNING *",
            )
            .bind(new_shares)
            .bind(new_entry_price)
            .bind(new_cost)
            .bind(new_collateral)
            .bind(p.id)
            .fetch_one(&mut **tx)
            .await?
        }
        None => {
            sqlx::query_as::<_, Position>(
                "INSERT INTO positions (user_id, market_id, side, shares, entry_price, cost_basis, collateral, status)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, 'open') RETURNING *",
            )
            .bind(user_id)
            .bind(market_id)
            .bind(side.as_str())
            .bind(new_shares)
            .bind(new_entry_price)
            .bind(new_cost)
            .bind(new_collateral)
            .fetch_one(&mut **tx)
            .await?
        }
    };

    Ok(position)
}

#[cfg(test)]
mod tests {
    // Exercised against a live pool in `integration_tests.rs`; the arithmetic itself is
    // covered directly by `pricing`'s unit and property tests.
}
