//! Settlement Engine: resolves a market's outcome into winner payouts,
//! loser slashing, and a terminal status transition.

use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::PgPool;

use crate::error::{EngineError, EngineResult};
use crate::ledger::{self, CreditCategory};
use crate::market::{self, Market};
use crate::trade::Position;

#[derive(Debug, Serialize)]
pub struct SettlementResult {
    pub market: Market,
    pub winners_paid: usize,
    pub losers_slashed: usize,
}

/// Distributes the pool pro-rata across winning positions and slashes
/// losing positions' collateral. The status transition on `markets` is the
/// last write so concurrent settlement attempts race on a single
/// conditional `UPDATE ... WHERE status = 'active'` and only one can win.
pub async fn settle(pool: &PgPool, market_id: i64, outcome: bool) -> EngineResult<SettlementResult> {
    let mut tx = pool.begin().await?;

    let market = sqlx::query_as::<_, Market>("SELECT * FROM markets WHERE id = $1 FOR UPDATE")
        .bind(market_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("market {market_id}")))?;
    if !market.is_active() {
        return Err(EngineError::InvalidState(format!("market {market_id} is not active")));
    }

    let positions = sqlx::query_as::<_, Position>(
        "SELECT * FROM positions WHERE market_id = $1 AND status = 'open' FOR UPDATE",
    )
    .bind(market_id)
    .fetch_all(&mut *tx)
    .await?;

    let outcome_side = if outcome { "true" } else { "false" };
    let total_pool = market.total_bet_true + market.total_bet_false;
    let total_winning_shares: Decimal = positions
        .iter()
        .filter(|p| p.side == outcome_side)
        .map(|p| p.shares)
        .sum();

    let mut winners_paid = 0usize;
    let mut losers_slashed = 0usize;

    for position in &positions {
        if position.side == outcome_side {
            let payout = if total_winning_shares.is_zero() {
                Decimal::ZERO
            } else {
                (position.shares / total_winning_shares) * total_pool
            };
            ledger::unlock(&mut tx, position.user_id, position.collateral).await?;
            ledger::credit(&mut tx, position.user_id, payout, CreditCategory::Earnings).await?;
            sqlx::query("UPDATE positions SET status = 'won', updated_at = now() WHERE id = $1")
                .bind(position.id)
                .execute(&mut *tx)
                .await?;
            winners_paid += 1;
        } else {
            ledger::debit_from_locked(&mut tx, position.user_id, position.collateral).await?;
            sqlx::query("UPDATE positions SET status = 'lost', updated_at = now() WHERE id = $1")
                .bind(position.id)
                .execute(&mut *tx)
                .await?;
            losers_slashed += 1;
        }
    }

    market::credit_submitter_on_settle(&mut tx, market.submitter_id, market.stake, outcome).await?;

    let new_status = if outcome { "resolved_true" } else { "resolved_false" };
    let rows = sqlx::query(
        "UPDATE markets SET status = $1, resolved_at = now() WHERE id = $2 AND status = 'active'",
    )
    .bind(new_status)
    .bind(market_id)
    .execute(&mut *tx)
    .await?
    .rows_affected();
    if rows == 0 {
        return Err(EngineError::Conflict(format!(
            "market {market_id} was settled concurrently"
        )));
    }

    let market = sqlx::query_as::<_, Market>("SELECT * FROM markets WHERE id = $1")
        .bind(market_id)
        .fetch_one(&mut *tx)
        .await?;

    tx.commit().await?;

    Ok(SettlementResult {
        market,
        winners_paid,
        losers_slashed,
    })
}

#[cfg(test)]
mod tests {
    // Pro-rata distribution and the zero-winner residual case are exercised
    // against a live pool in `integration_tests.rs`.
}
