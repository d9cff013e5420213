//! Read-only view over an oracle's historical accuracy.
//!
//! Reputation is a pure function of resolved reports, so it is never stored
//! directly — only cached. The cache lives in `AppState` alongside the
//! HTTP-response cache and is keyed by oracle id; `invalidate` is called
//! whenever a report's status changes (i.e. after every payout cascade).

use std::time::Duration;

use moka::future::Cache;
use rust_decimal::Decimal;
use sqlx::PgPool;

use crate::config::OracleConfig;
use crate::error::EngineResult;

pub type ReputationCache = Cache<i64, Decimal>;

pub fn new_cache() -> ReputationCache {
    Cache::builder()
        .max_capacity(10_000)
        .time_to_live(Duration::from_secs(60))
        .build()
}

/// `correct / (correct + incorrect)` over resolved reports only; defaults to
/// `cfg.default_reputation` for an oracle with no resolved history.
pub async fn reputation(
    pool: &PgPool,
    cache: &ReputationCache,
    cfg: &OracleConfig,
    oracle_id: i64,
) -> EngineResult<Decimal> {
    if let Some(cached) = cache.get(&oracle_id).await {
        return Ok(cached);
    }

    #[derive(sqlx::FromRow)]
    struct Counts {
        correct: i64,
        incorrect: i64,
    }

    let counts = sqlx::query_as::<_, Counts>(
        "SELECT
            count(*) FILTER (WHERE status = 'correct') AS correct,
            count(*) FILTER (WHERE status = 'incorrect') AS incorrect
         FROM oracle_reports WHERE oracle_id = $1",
    )
    .bind(oracle_id)
    .fetch_one(pool)
    .await?;

    let total = counts.correct + counts.incorrect;
    let rep = if total == 0 {
        cfg.default_reputation
    } else {
        Decimal::from(counts.correct) / Decimal::from(total)
    };

    cache.insert(oracle_id, rep).await;
    Ok(rep)
}

pub async fn invalidate(cache: &ReputationCache, oracle_id: i64) {
    cache.invalidate(&oracle_id).await;
}

#[derive(Debug, serde::Serialize, sqlx::FromRow)]
pub struct WinRate {
    pub user_id: i64,
    pub won: i64,
    pub lost: i64,
    pub win_rate: f64,
}

/// `won / (won + lost)` over a trader's closed positions, used by the
/// `/auth/user/{id}` view rather than the oracle's reputation score.
pub async fn win_rate(pool: &PgPool, user_id: i64) -> EngineResult<WinRate> {
    #[derive(sqlx::FromRow)]
    struct Counts {
        won: i64,
        lost: i64,
    }
    let counts = sqlx::query_as::<_, Counts>(
        "SELECT
            count(*) FILTER (WHERE status = 'won') AS won,
            count(*) FILTER (WHERE status = 'lost') AS lost
         FROM positions WHERE user_id = $1",
    )
    .bind(user_id)
    .fetch_one(pool)
    .await?;

    let total = counts.won + counts.lost;
    let win_rate = if total == 0 {
        0.0
    } else {
        counts.won as f64 / total as f64
    };

    Ok(WinRate {
        user_id,
        won: counts.won,
        lost: counts.lost,
        win_rate,
    })
}
