//! Oracle Engine: staked, reputation-weighted verdict reporting with
//! Sybil deterrence, plus the consensus check and payout cascade it
//! triggers.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::{PgPool, Postgres, Transaction};

use crate::config::OracleConfig;
use crate::error::{EngineError, EngineResult};
use crate::ledger::{self, CreditCategory};
use crate::market::{self, Market};
use crate::reputation::{self, ReputationCache};
use crate::settlement;

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct OracleReport {
    pub id: i64,
    pub oracle_id: i64,
    pub market_id: i64,
    pub verdict: String,
    pub evidence: serde_json::Value,
    pub stake: Decimal,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct ReportOutcome {
    pub report: OracleReport,
    pub consensus_triggered: bool,
}

/// Accepts a staked verdict, running the ordered pre-check pipeline before
/// locking the oracle's stake and persisting the report. If the new report
/// completes a consensus, settlement and payouts run inline; failures in
/// that cascade are logged and swallowed so the vote itself still lands
/// (`consensus_triggered` just comes back `false`).
pub async fn submit_report(
    pool: &PgPool,
    cache: &ReputationCache,
    cfg: &OracleConfig,
    oracle_id: i64,
    market_id: i64,
    verdict: bool,
    evidence: serde_json::Value,
    stake: Decimal,
    ip_hash: Option<String>,
) -> EngineResult<ReportOutcome> {
    let mut tx = pool.begin().await?;

    let market = sqlx::query_as::<_, Market>("SELECT * FROM markets WHERE id = $1 FOR UPDATE")
        .bind(market_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("market {market_id}")))?;
    if !market.is_active() {
        return Err(EngineError::InvalidState(format!("market {market_id} is not active")));
    }

    let oracle_balance = ledger::get_balance(&mut tx, oracle_id).await?;
    if oracle_balance.available < stake {
        return Err(EngineError::InsufficientFunds(format!(
            "oracle {oracle_id} has insufficient available balance to stake {stake}"
        )));
    }

    if stake < cfg.min_stake {
        return Err(EngineError::InvalidInput(format!(
            "oracle stake must be at least {}",
            cfg.min_stake
        )));
    }

    let duplicate = sqlx::query_scalar::<_, i64>(
        "SELECT count(*) FROM oracle_reports WHERE oracle_id = $1 AND market_id = $2",
    )
    .bind(oracle_id)
    .bind(market_id)
    .fetch_one(&mut *tx)
    .await?;
    if duplicate > 0 {
        return Err(EngineError::DuplicateVote(format!(
            "oracle {oracle_id} already reported on market {market_id}"
        )));
    }

    if let Some(ip_hash) = &ip_hash {
        let recent = sqlx::query_scalar::<_, i64>(
            "SELECT count(*) FROM oracle_vote_history WHERE ip_hash = $1 AND created_at > now() - interval '1 hour'",
        )
        .bind(ip_hash)
        .fetch_one(&mut *tx)
        .await?;
        if recent >= cfg.ip_rate_limit_per_hour {
            return Err(EngineError::RateLimited(
                "too many reports from this IP in the last hour".into(),
            ));
        }
    }

    ledger::lock(&mut tx, oracle_id, stake).await?;

    let verdict_str = if verdict { "true" } else { "false" };
    let report = sqlx::query_as::<_, OracleReport>(
        "INSERT INTO oracle_reports (oracle_id, market_id, verdict, evidence, stake, status)
         VALUES ($1, $2, $3, $4, $5, 'pending') RETURNING *",
    )
    .bind(oracle_id)
    .bind(market_id)
    .bind(verdict_str)
    .bind(&evidence)
    .bind(stake)
    .fetch_one(&mut *tx)
    .await?;

    sqlx::query("INSERT INTO oracle_vote_history (oracle_id, market_id, ip_hash) VALUES ($1, $2, $3)")
        .bind(oracle_id)
        .bind(market_id)
        .bind(&ip_hash)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;

    let consensus = check_consensus(pool, cache, cfg, market_id).await?;
    let consensus_triggered = match consensus {
        Some(outcome) => match settlement::settle(pool, market_id, outcome).await {
            Ok(_) => {
                if let Err(e) = apply_oracle_payouts(pool, cache, cfg, market_id, outcome).await {
                    tracing::error!(market_id, error = %e, "oracle payout cascade failed after settlement");
                }
                true
            }
            Err(e) => {
                tracing::error!(market_id, error = %e, "settlement failed after consensus reached");
                false
            }
        },
        None => false,
    };

    Ok(ReportOutcome {
        report,
        consensus_triggered,
    })
}

/// Loads every report for `market_id` and returns a decisive outcome if the
/// stake-and-reputation-weighted score clears the 0.75/0.25 thresholds,
/// requiring at least 3 reports to avoid deciding on a thin sample.
pub async fn check_consensus(
    pool: &PgPool,
    cache: &ReputationCache,
    cfg: &OracleConfig,
    market_id: i64,
) -> EngineResult<Option<bool>> {
    let reports = sqlx::query_as::<_, OracleReport>("SELECT * FROM oracle_reports WHERE market_id = $1")
        .bind(market_id)
        .fetch_all(pool)
        .await?;

    if reports.len() < cfg.min_reports_for_consensus {
        return Ok(None);
    }

    let mut weighted_true = Decimal::ZERO;
    let mut weighted_total = Decimal::ZERO;
    for report in &reports {
        let rep = reputation::reputation(pool, cache, cfg, report.oracle_id).await?;
        let weight = report.stake * rep;
        weighted_total += weight;
        if report.verdict == "true" {
            weighted_true += weight;
        }
    }

    if weighted_total.is_zero() {
        return Ok(None);
    }

    let score = weighted_true / weighted_total;
    if score >= cfg.consensus_true_threshold {
        Ok(Some(true))
    } else if score <= cfg.consensus_false_threshold {
        Ok(Some(false))
    } else {
        Ok(None)
    }
}

fn reward_multiplier(rep: Decimal) -> Decimal {
    let tier = if rep > Decimal::new(8, 1) {
        Decimal::new(20, 1)
    } else if rep > Decimal::new(6, 1) {
        Decimal::new(15, 1)
    } else {
        Decimal::new(12, 1)
    };
    Decimal::new(15, 1) * tier
}

/// Pays correct reporters their stake back plus a reputation-tiered reward,
/// and slashes incorrect reporters' stake outright.
pub async fn apply_oracle_payouts(
    pool: &PgPool,
    cache: &ReputationCache,
    cfg: &OracleConfig,
    market_id: i64,
    consensus: bool,
) -> EngineResult<()> {
    let reports = sqlx::query_as::<_, OracleReport>(
        "SELECT * FROM oracle_reports WHERE market_id = $1 AND status = 'pending'",
    )
    .bind(market_id)
    .fetch_all(pool)
    .await?;

    let consensus_side = if consensus { "true" } else { "false" };

    for report in reports {
        let rep = reputation::reputation(pool, cache, cfg, report.oracle_id).await?;
        let mut tx = pool.begin().await?;
        if report.verdict == consensus_side {
            ledger::unlock(&mut tx, report.oracle_id, report.stake).await?;
            let reward = report.stake * reward_multiplier(rep);
            ledger::credit(&mut tx, report.oracle_id, reward, CreditCategory::Earnings).await?;
            update_report_status(&mut tx, report.id, "correct").await?;
        } else {
            ledger::debit_from_locked(&mut tx, report.oracle_id, report.stake).await?;
            update_report_status(&mut tx, report.id, "incorrect").await?;
        }
        tx.commit().await?;
        reputation::invalidate(cache, report.oracle_id).await;
    }

    Ok(())
}

async fn update_report_status(
    tx: &mut Transaction<'_, Postgres>,
    report_id: i64,
    status: &str,
) -> EngineResult<()> {
    sqlx::query("UPDATE oracle_reports SET status = $1 WHERE id = $2")
        .bind(status)
        .bind(report_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

pub async fn reports_for_market(pool: &PgPool, market_id: i64) -> EngineResult<Vec<OracleReport>> {
    let reports = sqlx::query_as::<_, OracleReport>(
        "SELECT * FROM oracle_reports WHERE market_id = $1 ORDER BY created_at DESC",
    )
    .bind(market_id)
    .fetch_all(pool)
    .await?;
    Ok(reports)
}
