//! Connection pool creation and schema migration.
//!
//! Schema is applied with plain inline `CREATE TABLE IF NOT EXISTS`
//! statements rather than an external migration tool, matching the rest of
//! this crate's preference for dependency-light, inspectable SQL.

use anyhow::Result;
use sqlx::PgPool;

pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    tracing::info!("connecting to postgres");
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;
    tracing::info!("connected to postgres");
    Ok(pool)
}

/// Creates the engine's tables if they do not already exist. Safe to call on
/// every startup: this is purely additive and never drops or alters
/// existing objects.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id              BIGSERIAL PRIMARY KEY,
            pseudonym       TEXT NOT NULL UNIQUE,
            available       NUMERIC NOT NULL DEFAULT 0 CHECK (available >= 0),
            locked          NUMERIC NOT NULL DEFAULT 0 CHECK (locked >= 0),
            total_earned    NUMERIC NOT NULL DEFAULT 0 CHECK (total_earned >= 0),
            total_lost      NUMERIC NOT NULL DEFAULT 0 CHECK (total_lost >= 0),
            created_at      TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS markets (
            id                BIGSERIAL PRIMARY KEY,
            text              TEXT NOT NULL,
            category          TEXT NOT NULL,
            submitter_id      BIGINT NOT NULL REFERENCES users(id),
            stake             NUMERIC NOT NULL CHECK (stake >= 10),
            total_bet_true    NUMERIC NOT NULL DEFAULT 0 CHECK (total_bet_true >= 0),
            total_bet_false   NUMERIC NOT NULL DEFAULT 0 CHECK (total_bet_false >= 0),
            price             NUMERIC NOT NULL DEFAULT 0.50 CHECK (price >= 0.01 AND price <= 0.99),
            status            TEXT NOT NULL DEFAULT 'active'
                              CHECK (status IN ('active','resolved_true','resolved_false','deleted')),
            ai_prediction     TEXT,
            ai_confidence     NUMERIC,
            embedding         JSONB,
            created_at        TIMESTAMPTZ NOT NULL DEFAULT now(),
            resolved_at       TIMESTAMPTZ
        )
        "#,
    )
    .execute(pool)
    .await?;

    // `closed` is part of the data model's status enum but no code path here
    // ever writes it: it belongs to pre-settlement partial redemption, which
    // is an explicit non-goal. Kept in the CHECK so the schema matches the
    // documented enum rather than silently narrowing it.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS positions (
            id              BIGSERIAL PRIMARY KEY,
            user_id         BIGINT NOT NULL REFERENCES users(id),
            market_id       BIGINT NOT NULL REFERENCES markets(id),
            side            TEXT NOT NULL CHECK (side IN ('true','false')),
            shares          NUMERIC NOT NULL DEFAULT 0 CHECK (shares >= 0),
            entry_price     NUMERIC NOT NULL,
            cost_basis      NUMERIC NOT NULL DEFAULT 0 CHECK (cost_basis >= 0),
            collateral      NUMERIC NOT NULL DEFAULT 0 CHECK (collateral >= 0),
            status          TEXT NOT NULL DEFAULT 'open'
                            CHECK (status IN ('open','won','lost','closed','deleted')),
            created_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
            updated_at      TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
    )
    .execute(pool)
    .await?;

    // At most one open position per (user, market, side), enforced as a
    // partial unique index rather than in application logic alone.
    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS positions_open_unique
        ON positions (user_id, market_id, side)
        WHERE status = 'open'
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS trades (
            id                  BIGSERIAL PRIMARY KEY,
            user_id             BIGINT NOT NULL REFERENCES users(id),
            market_id           BIGINT NOT NULL REFERENCES markets(id),
            side                TEXT NOT NULL CHECK (side IN ('true','false')),
            cc_amount           NUMERIC NOT NULL CHECK (cc_amount > 0),
            shares              NUMERIC NOT NULL,
            price_at_execution  NUMERIC NOT NULL,
            created_at          TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS oracle_reports (
            id            BIGSERIAL PRIMARY KEY,
            oracle_id     BIGINT NOT NULL REFERENCES users(id),
            market_id     BIGINT NOT NULL REFERENCES markets(id),
            verdict       TEXT NOT NULL CHECK (verdict IN ('true','false')),
            evidence      JSONB NOT NULL DEFAULT '[]',
            stake         NUMERIC NOT NULL CHECK (stake >= 20),
            status        TEXT NOT NULL DEFAULT 'pending'
                          CHECK (status IN ('pending','correct','incorrect')),
            created_at    TIMESTAMPTZ NOT NULL DEFAULT now(),
            UNIQUE (oracle_id, market_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS oracle_vote_history (
            id            BIGSERIAL PRIMARY KEY,
            oracle_id     BIGINT NOT NULL REFERENCES users(id),
            market_id     BIGINT NOT NULL REFERENCES markets(id),
            ip_hash       TEXT,
            created_at    TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS oracle_vote_history_ip_hash_idx
        ON oracle_vote_history (ip_hash, created_at)
        "#,
    )
    .execute(pool)
    .await?;

    tracing::info!("schema migration complete");
    Ok(())
}

/// Liveness probe: a trivial round trip against the pool.
pub async fn is_healthy(pool: &PgPool) -> bool {
    sqlx::query("SELECT 1").execute(pool).await.is_ok()
}

#[derive(Debug, serde::Serialize, sqlx::FromRow)]
pub struct Stats {
    pub total_users: i64,
    pub active_markets: i64,
    pub resolved_markets: i64,
    pub total_locked: rust_decimal::Decimal,
    pub total_trades: i64,
    pub oracle_reports: i64,
}

/// `/stats`: aggregate totals across the engine, grounded on the donor's
/// leaderboard/accuracy aggregation query shape (one round trip, several
/// `FILTER`-qualified aggregates rather than N separate queries).
pub async fn get_stats(pool: &PgPool) -> Result<Stats> {
    let stats = sqlx::query_as::<_, Stats>(
        "SELECT
            (SELECT count(*) FROM users) AS total_users,
            (SELECT count(*) FROM markets WHERE status = 'active') AS active_markets,
            (SELECT count(*) FROM markets WHERE status IN ('resolved_true', 'resolved_false')) AS resolved_markets,
            (SELECT coalesce(sum(locked), 0) FROM users) AS total_locked,
            (SELECT count(*) FROM trades) AS total_trades,
            (SELECT count(*) FROM oracle_reports) AS oracle_reports",
    )
    .fetch_one(pool)
    .await?;
    Ok(stats)
}
