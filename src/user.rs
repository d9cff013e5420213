//! Thin `AuthProvider` implementation: pseudonym-only identity.
//!
//! The real identity/credential system is out of scope (§1) — this module
//! only implements the one endpoint the source spec's §6 table actually
//! lists, `/auth/initialize`, plus the read views (`/auth/user/{id}`,
//! `/auth/users`) the original's `routes/auth.py` exposes alongside it.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::PgPool;

use crate::error::{EngineError, EngineResult};
use crate::reputation;

/// Starting balance credited to a brand-new pseudonym.
pub const INITIAL_BALANCE: Decimal = Decimal::from_parts(100, 0, 0, false, 0);

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub pseudonym: String,
    pub available: Decimal,
    pub locked: Decimal,
    pub total_earned: Decimal,
    pub total_lost: Decimal,
    pub created_at: DateTime<Utc>,
}

pub struct InitializeOutcome {
    pub user: User,
    pub created: bool,
}

/// Returns the existing user for `pseudonym`, or creates one with
/// `INITIAL_BALANCE` available CC. Never fails on "already exists" — that's
/// the expected steady-state call from a returning client.
pub async fn initialize(pool: &PgPool, pseudonym: &str) -> EngineResult<InitializeOutcome> {
    let inserted = sqlx::query_as::<_, User>(
        "INSERT INTO users (pseudonym, available, locked, total_earned, total_lost)
         VALUES ($1, $2, 0, 0, 0)
         ON CONFLICT (pseudonym) DO NOTHING
         RETURNING *",
    )
    .bind(pseudonym)
    .bind(INITIAL_BALANCE)
    .fetch_optional(pool)
    .await?;

    if let Some(user) = inserted {
        return Ok(InitializeOutcome { user, created: true });
    }

    let user = find_by_pseudonym(pool, pseudonym)
        .await?
        .ok_or_else(|| EngineError::StoreError(anyhow::anyhow!("initialize race left no row for {pseudonym}")))?;
    Ok(InitializeOutcome { user, created: false })
}

async fn find_by_pseudonym(pool: &PgPool, pseudonym: &str) -> EngineResult<Option<User>> {
    let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE pseudonym = $1")
        .bind(pseudonym)
        .fetch_optional(pool)
        .await?;
    Ok(user)
}

pub async fn get_by_id(pool: &PgPool, user_id: i64) -> EngineResult<User> {
    sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
        .bind(user_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("user {user_id}")))
}

#[derive(Debug, Serialize)]
pub struct UserDetail {
    #[serde(flatten)]
    pub user: User,
    pub positions_count: i64,
    pub win_rate: f64,
}

/// `/auth/user/{id}`: balance plus position count and win rate over closed
/// positions, matching `routes/auth.py::get_user`.
pub async fn get_detail(pool: &PgPool, user_id: i64) -> EngineResult<UserDetail> {
    let user = get_by_id(pool, user_id).await?;

    let positions_count: i64 =
        sqlx::query_scalar("SELECT count(*) FROM positions WHERE user_id = $1")
            .bind(user_id)
            .fetch_one(pool)
            .await?;

    let win_rate = reputation::win_rate(pool, user_id).await?.win_rate;

    Ok(UserDetail {
        user,
        positions_count,
        win_rate,
    })
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct LeaderboardEntry {
    pub rank: i64,
    pub pseudonym: String,
    pub balance: Decimal,
    pub total_earned: Decimal,
}

/// `/auth/users`: top 20 by `available + locked`, matching
/// `routes/auth.py::get_users`.
pub async fn top_users(pool: &PgPool, limit: i64) -> EngineResult<Vec<LeaderboardEntry>> {
    #[derive(sqlx::FromRow)]
    struct Row {
        pseudonym: String,
        available: Decimal,
        locked: Decimal,
        total_earned: Decimal,
    }

    let rows = sqlx::query_as::<_, Row>(
        "SELECT pseudonym, available, locked, total_earned
         FROM users
         ORDER BY (available + locked) DESC
         LIMIT $1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .enumerate()
        .map(|(i, r)| LeaderboardEntry {
            rank: i as i64 + 1,
            pseudonym: r.pseudonym.chars().take(8).collect(),
            balance: r.available + r.locked,
            total_earned: r.total_earned,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    // Exercised against a live pool in `integration_tests.rs` (pseudonym round-trip,
    // idempotent re-initialize, leaderboard ordering).
}
