//! Per-user balance primitives: `lock`, `unlock`, `credit`, `debit_from_locked`.
//!
//! Each operation is a single conditional `UPDATE` against the `users` row —
//! the guard clause in the `WHERE` doubles as the non-negativity check and
//! the compare-and-set, so a losing concurrent writer sees `rows_affected()
//! == 0` rather than a negative balance. Callers run these inside an
//! existing `sqlx::Transaction`; this module never opens its own.

use rust_decimal::Decimal;
use sqlx::{Postgres, Transaction};

use crate::error::{EngineError, EngineResult};

/// Whether a `credit` should also bump `total_earned`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreditCategory {
    Earnings,
    Other,
}

/// Confirms `user_id` exists, row-locking it so the existence check and the
/// guarded update that follows it observe the same row within the caller's
/// transaction. Lets `lock`/`unlock`/`debit_from_locked` tell "no such user"
/// (`NotFound`) apart from "insufficient balance" instead of collapsing both
/// into the same `rows_affected() == 0`.
async fn ensure_user_exists(tx: &mut Transaction<'_, Postgres>, user_id: i64) -> EngineResult<()> {
    sqlx::query_scalar::<_, i64>("SELECT id FROM users WHERE id = $1 FOR UPDATE")
        .bind(user_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("user {user_id}")))?;
    Ok(())
}

/// Moves `amt` from `available` to `locked`. Fails `NotFound` if `user_id`
/// does not exist, `InsufficientFunds` if `amt > available`.
pub async fn lock(tx: &mut Transaction<'_, Postgres>, user_id: i64, amt: Decimal) -> EngineResult<()> {
    ensure_user_exists(tx, user_id).await?;

    let rows = sqlx::query(
        "UPDATE users SET available = available - $1, locked = locked + $1
         WHERE id = $2 AND available >= $1",
    )
    .bind(amt)
    .bind(user_id)
    .execute(&mut **tx)
    .await?
    .rows_affected();

    if rows == 0 {
        return Err(EngineError::InsufficientFunds(format!(
            "user {user_id} cannot lock {amt}"
        )));
    }
    Ok(())
}

/// Moves `amt` from `locked` back to `available`. Fails `NotFound` if
/// `user_id` does not exist, `InsufficientLocked` if `amt > locked`.
pub async fn unlock(tx: &mut Transaction<'_, Postgres>, user_id: i64, amt: Decimal) -> EngineResult<()> {
    ensure_user_exists(tx, user_id).await?;

    let rows = sqlx::query(
        "UPDATE users SET locked = locked - $1, available = available + $1
         WHERE id = $2 AND locked >= $1",
    )
    .bind(amt)
    .bind(user_id)
    .execute(&mut **tx)
    .await?
    .rows_affected();

    if rows == 0 {
        return Err(EngineError::InsufficientLocked(format!(
            "user {user_id} cannot unlock {amt}"
        )));
    }
    Ok(())
}

/// Adds `amt` to `available`. When `category` is `Earnings`, `total_earned`
/// also increases by `amt` — the monotone win counter used by reputation
/// and win-rate views.
pub async fn credit(
    tx: &mut Transaction<'_, Postgres>,
    user_id: i64,
    amt: Decimal,
    category: CreditCategory,
) -> EngineResult<()> {
    let rows = match category {
        CreditCategory::Earnings => {
            sqlx::query(
                "UPDATE users SET available = available + $1, total_earned = total_earned + $1
                 WHERE id = $2",
            )
            .bind(amt)
            .bind(user_id)
            .execute(&mut **tx)
            .await?
            .rows_affected()
        }
        CreditCategory::Other => {
            sqlx::query("UPDATE users SET available = available + $1 WHERE id = $2")
                .bind(amt)
                .bind(user_id)
                .execute(&mut **tx)
                .await?
                .rows_affected()
        }
    };

    if rows == 0 {
        return Err(EngineError::NotFound(format!("user {user_id}")));
    }
    Ok(())
}

/// Slashes `amt` out of `locked` without crediting `available`; `total_lost`
/// increases by `amt`. Fails `NotFound` if `user_id` does not exist,
/// `InsufficientLocked` if `amt > locked`.
pub async fn debit_from_locked(
    tx: &mut Transaction<'_, Postgres>,
    user_id: i64,
    amt: Decimal,
) -> EngineResult<()> {
    ensure_user_exists(tx, user_id).await?;

    let rows = sqlx::query(
        "UPDATE users SET locked = locked - $1, total_lost = total_lost + $1
         WHERE id = $2 AND locked >= $1",
    )
    .bind(amt)
    .bind(user_id)
    .execute(&mut **tx)
    .await?
    .rows_affected();

    if rows == 0 {
        return Err(EngineError::InsufficientLocked(format!(
            "user {user_id} cannot slash {amt}"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UserBalance {
    pub id: i64,
    pub pseudonym: String,
    pub available: Decimal,
    pub locked: Decimal,
    pub total_earned: Decimal,
    pub total_lost: Decimal,
}

pub async fn get_balance(
    tx: &mut Transaction<'_, Postgres>,
    user_id: i64,
) -> EngineResult<UserBalance> {
    sqlx::query_as::<_, UserBalance>(
        "SELECT id, pseudonym, available, locked, total_earned, total_lost
         FROM users WHERE id = $1 FOR UPDATE",
    )
    .bind(user_id)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or_else(|| EngineError::NotFound(format!("user {user_id}")))
}

#[cfg(test)]
mod tests {
    // Covered end to end by the transactional tests in `integration_tests.rs`, which
    // run these primitives against a real pool rather than mocking
    // `sqlx::Transaction` (not practical to construct in isolation).
}
