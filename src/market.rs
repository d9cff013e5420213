//! Market Registry: submission, lookup, listing, and deletion of claims.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::{PgPool, Postgres, Transaction};

use crate::advisor::Advisor;
use crate::error::{EngineError, EngineResult};
use crate::ledger::{self, CreditCategory};
use crate::pricing;

pub const MIN_SUBMIT_STAKE: Decimal = Decimal::from_parts(10, 0, 0, false, 0);

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Market {
    pub id: i64,
    pub text: String,
    pub category: String,
    pub submitter_id: i64,
    pub stake: Decimal,
    pub total_bet_true: Decimal,
    pub total_bet_false: Decimal,
    pub price: Decimal,
    pub status: String,
    pub ai_prediction: Option<String>,
    pub ai_confidence: Option<Decimal>,
    pub embedding: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Market {
    pub fn is_active(&self) -> bool {
        self.status == "active"
    }
}

/// Result of `submit`: the persisted market plus the best-effort advisory
/// hint that it may duplicate an existing active market.
#[derive(Debug, Serialize)]
pub struct SubmitOutcome {
    pub market: Market,
    pub duplicate_of: Option<i64>,
}

/// Creates a market, locking the submitter's stake and seeding both pools
/// with it so the initial price is 0.50. The advisor is queried best-effort
/// after the row exists; its result — including a possible duplicate-market
/// hint from its embedding — is attached but never blocks or rolls back
/// submission.
pub async fn submit(
    pool: &PgPool,
    advisor: &Advisor,
    user_id: i64,
    text: String,
    category: String,
    stake: Decimal,
) -> EngineResult<SubmitOutcome> {
    if stake < MIN_SUBMIT_STAKE {
        return Err(EngineError::InvalidInput(format!(
            "stake must be at least {MIN_SUBMIT_STAKE}"
        )));
    }

    let mut tx = pool.begin().await?;
    ledger::lock(&mut tx, user_id, stake).await?;

    let half = pricing::price(Decimal::ZERO, Decimal::ZERO);
    let market = sqlx::query_as::<_, Market>(
        "INSERT INTO markets (text, category, submitter_id, stake, total_bet_true, total_bet_false, price, status)
         VALUES ($1, $2, $3, $4, $4, $4, $5, 'active')
         RETURNING *",
    )
    .bind(&text)
    .bind(&category)
    .bind(user_id)
    .bind(stake)
    .bind(half)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;

    let analysis = advisor.classify(&text).await;
    let duplicate_of = find_duplicate_market(pool, &analysis, market.id).await.ok().flatten();
    let market = attach_advisor_analysis(pool, market.id, analysis).await.unwrap_or(market);
    Ok(SubmitOutcome { market, duplicate_of })
}

async fn attach_advisor_analysis(
    pool: &PgPool,
    market_id: i64,
    analysis: crate::advisor::Analysis,
) -> EngineResult<Market> {
    let market = sqlx::query_as::<_, Market>(
        "UPDATE markets SET ai_prediction = $1, ai_confidence = $2, embedding = $3
         WHERE id = $4 RETURNING *",
    )
    .bind(&analysis.prediction)
    .bind(analysis.confidence)
    .bind(&analysis.embedding)
    .bind(market_id)
    .fetch_one(pool)
    .await?;
    Ok(market)
}

/// Best-effort duplicate-submission check: compares the new market's
/// advisor-provided embedding against recent active markets' stored
/// embeddings by cosine similarity. Never blocks or fails submission — any
/// error here is swallowed by the caller, which treats it as "no duplicate
/// found".
async fn find_duplicate_market(
    pool: &PgPool,
    analysis: &crate::advisor::Analysis,
    exclude_market_id: i64,
) -> EngineResult<Option<i64>> {
    let candidate_embedding = match &analysis.embedding {
        Some(e) => e.clone(),
        None => return Ok(None),
    };
    let candidate_vec: Vec<f64> = match serde_json::from_value(candidate_embedding) {
        Ok(v) => v,
        Err(_) => return Ok(None),
    };
    if candidate_vec.is_empty() {
        return Ok(None);
    }

    #[derive(sqlx::FromRow)]
    struct Candidate {
        id: i64,
        embedding: Option<serde_json::Value>,
    }

    let candidates = sqlx::query_as::<_, Candidate>(
        "SELECT id, embedding FROM markets
         WHERE status = 'active' AND id != $1 AND embedding IS NOT NULL
         ORDER BY created_at DESC LIMIT 200",
    )
    .bind(exclude_market_id)
    .fetch_all(pool)
    .await?;

    for candidate in candidates {
        let Some(embedding) = candidate.embedding else { continue };
        let Ok(other_vec) = serde_json::from_value::<Vec<f64>>(embedding) else { continue };
        if crate::advisor::is_likely_duplicate(&candidate_vec, &other_vec) {
            return Ok(Some(candidate.id));
        }
    }
    Ok(None)
}

pub async fn get_by_id(pool: &PgPool, market_id: i64) -> EngineResult<Market> {
    sqlx::query_as::<_, Market>("SELECT * FROM markets WHERE id = $1")
        .bind(market_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("market {market_id}")))
}

#[derive(Debug, Serialize)]
pub struct MarketDetail {
    #[serde(flatten)]
    pub market: Market,
    pub submitter_pseudonym: String,
    pub positions_count: i64,
}

/// `/markets/{id}`: the market plus its submitter's pseudonym and the count
/// of positions ever taken on it, matching `routes/markets.py::get_market`.
pub async fn get_detail(pool: &PgPool, market_id: i64) -> EngineResult<MarketDetail> {
    let market = get_by_id(pool, market_id).await?;

    let submitter_pseudonym: String = sqlx::query_scalar("SELECT pseudonym FROM users WHERE id = $1")
        .bind(market.submitter_id)
        .fetch_one(pool)
        .await?;

    let positions_count: i64 = sqlx::query_scalar("SELECT count(*) FROM positions WHERE market_id = $1")
        .bind(market_id)
        .fetch_one(pool)
        .await?;

    Ok(MarketDetail {
        market,
        submitter_pseudonym,
        positions_count,
    })
}

pub struct ListFilter {
    pub status: Option<String>,
    pub category: Option<String>,
    pub limit: i64,
    pub offset: i64,
}

impl Default for ListFilter {
    fn default() -> Self {
        Self {
            status: None,
            category: None,
            limit: 20,
            offset: 0,
        }
    }
}

pub async fn list(pool: &PgPool, filter: ListFilter) -> EngineResult<Vec<Market>> {
    let markets = sqlx::query_as::<_, Market>(
        "SELECT * FROM markets
         WHERE ($1::text IS NULL OR status = $1)
           AND ($2::text IS NULL OR category = $2)
         ORDER BY created_at DESC
         LIMIT $3 OFFSET $4",
    )
    .bind(filter.status)
    .bind(filter.category)
    .bind(filter.limit)
    .bind(filter.offset)
    .fetch_all(pool)
    .await?;
    Ok(markets)
}

#[derive(Debug, Serialize)]
pub struct Refund {
    pub user_id: i64,
    pub amount: Decimal,
}

/// Deletes an active market the caller submitted. Each open position's
/// `cost_basis` is refunded to its holder (unwound from `locked`), the
/// submitter's stake is refunded, and every affected row becomes `deleted`.
pub async fn delete(pool: &PgPool, market_id: i64, requester_id: i64) -> EngineResult<Vec<Refund>> {
    let mut tx = pool.begin().await?;

    let market = sqlx::query_as::<_, Market>("SELECT * FROM markets WHERE id = $1 FOR UPDATE")
        .bind(market_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("market {market_id}")))?;

    if !market.is_active() {
        return Err(EngineError::InvalidState("market is not active".into()));
    }
    if market.submitter_id != requester_id {
        return Err(EngineError::Forbidden(
            "only the submitter may delete this market".into(),
        ));
    }

    #[derive(sqlx::FromRow)]
    struct OpenPosition {
        id: i64,
        user_id: i64,
        cost_basis: Decimal,
    }

    let positions = sqlx::query_as::<_, OpenPosition>(
        "SELECT id, user_id, cost_basis FROM positions WHERE market_id = $1 AND status = 'open'",
    )
    .bind(market_id)
    .fetch_all(&mut *tx)
    .await?;

    let mut refunds = Vec::with_capacity(positions.len() + 1);
    for position in &positions {
        ledger::unlock(&mut tx, position.user_id, position.cost_basis).await?;
        refunds.push(Refund {
            user_id: position.user_id,
            amount: position.cost_basis,
        });
    }

    sqlx::query("UPDATE positions SET status = 'deleted', updated_at = now() WHERE market_id = $1 AND status = 'open'")
        .bind(market_id)
        .execute(&mut *tx)
        .await?;

    ledger::unlock(&mut tx, market.submitter_id, market.stake).await?;
    refunds.push(Refund {
        user_id: market.submitter_id,
        amount: market.stake,
    });

    let rows = sqlx::query("UPDATE markets SET status = 'deleted' WHERE id = $1 AND status = 'active'")
        .bind(market_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
    if rows == 0 {
        return Err(EngineError::Conflict(format!(
            "market {market_id} changed status concurrently"
        )));
    }

    tx.commit().await?;
    Ok(refunds)
}

/// Internal helper used by the trade engine to recompute price and persist
/// pool deltas as part of `placeBet`'s shared transaction.
pub async fn apply_pool_delta(
    tx: &mut Transaction<'_, Postgres>,
    market_id: i64,
    side: pricing::Side,
    cc: Decimal,
) -> EngineResult<Market> {
    let market = match side {
        pricing::Side::True => {
            sqlx::query_as::<_, Market>(
                "UPDATE markets SET total_bet_true = total_bet_true + $1 WHERE id = $2 AND status = 'active' RETURNING *",
            )
            .bind(cc)
            .bind(market_id)
        }
        pricing::Side::False => {
            sqlx::query_as::<_, Market>(
                "UPDATE markets SET total_bet_false = total_bet_false + $1 WHERE id = $2 AND status = 'active' RETURNING *",
            )
            .bind(cc)
            .bind(market_id)
        }
    }
    .fetch_optional(&mut **tx)
    .await?
    .ok_or_else(|| EngineError::InvalidState(format!("market {market_id} is not active")))?;

    let new_price = pricing::price(market.total_bet_true, market.total_bet_false);
    let market = sqlx::query_as::<_, Market>("UPDATE markets SET price = $1 WHERE id = $2 RETURNING *")
        .bind(new_price)
        .bind(market_id)
        .fetch_one(&mut **tx)
        .await?;
    Ok(market)
}

pub async fn credit_submitter_on_settle(
    tx: &mut Transaction<'_, Postgres>,
    submitter_id: i64,
    stake: Decimal,
    outcome: bool,
) -> EngineResult<()> {
    if outcome {
        ledger::unlock(tx, submitter_id, stake).await?;
        ledger::credit(tx, submitter_id, stake, CreditCategory::Earnings).await?;
    } else {
        ledger::debit_from_locked(tx, submitter_id, stake).await?;
    }
    Ok(())
}
