//! Transaction retry helpers.
//!
//! Postgres can abort a transaction for reasons that are safe to retry
//! (serialization failure under `SERIALIZABLE`, deadlock, a unique-violation
//! race on an upsert). `is_retryable` walks the error chain looking for the
//! SQLSTATE codes that mean "retry me"; `with_retry` wraps a transaction body
//! in a bounded backoff-with-jitter loop, retrying a `Conflict` up to 3 times
//! before surfacing it to the caller.

use std::time::Duration;

use rand::Rng;
use sqlx::Error as SqlxError;

use crate::error::EngineError;

/// PostgreSQL SQLSTATE codes worth retrying.
/// https://www.postgresql.org/docs/current/errcodes-appendix.html
mod pg_error_codes {
    pub const SERIALIZATION_FAILURE: &str = "40001";
    pub const DEADLOCK_DETECTED: &str = "40P01";
    pub const ACTIVE_SQL_TRANSACTION: &str = "25001";
    pub const UNIQUE_VIOLATION: &str = "23505";
}

pub const MAX_RETRY_ATTEMPTS: u32 = 3;
const BASE_RETRY_DELAY_MS: u64 = 10;

fn sqlx_is_retryable(e: &SqlxError) -> bool {
    match e {
        SqlxError::Database(db_error) => {
            let Some(sqlstate) = db_error.code() else {
                return false;
            };
            matches!(
                sqlstate.as_ref(),
                pg_error_codes::SERIALIZATION_FAILURE
                    | pg_error_codes::DEADLOCK_DETECTED
                    | pg_error_codes::ACTIVE_SQL_TRANSACTION
                    | pg_error_codes::UNIQUE_VIOLATION
            )
        }
        _ => false,
    }
}

/// Whether a failed transaction attempt should be retried.
pub fn is_retryable(err: &EngineError) -> bool {
    match err {
        EngineError::Conflict(_) => true,
        EngineError::StoreError(e) => {
            let mut current: &dyn std::error::Error = e.as_ref();
            loop {
                if let Some(sqlx_err) = current.downcast_ref::<SqlxError>() {
                    if sqlx_is_retryable(sqlx_err) {
                        return true;
                    }
                }
                match current.source() {
                    Some(source) => current = source,
                    None => return false,
                }
            }
        }
        _ => false,
    }
}

/// Runs `attempt` up to `MAX_RETRY_ATTEMPTS` times, sleeping with exponential
/// backoff and jitter between retryable failures. `attempt` is expected to
/// open its own transaction, run the body, and commit/rollback internally —
/// this helper only decides whether to call it again.
pub async fn with_retry<T, F, Fut>(mut attempt: F) -> Result<T, EngineError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, EngineError>>,
{
    let mut try_count: u32 = 1;
    loop {
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(e) if is_retryable(&e) && try_count < MAX_RETRY_ATTEMPTS => {
                let jitter = rand::thread_rng().gen_range(0..10);
                let delay_ms = BASE_RETRY_DELAY_MS * (1u64 << (try_count - 1)) + jitter;
                tracing::debug!(attempt = try_count, delay_ms, error = %e, "retrying transaction");
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                try_count += 1;
            }
            Err(e) => {
                if try_count >= MAX_RETRY_ATTEMPTS {
                    return Err(EngineError::Conflict(format!(
                        "exhausted {MAX_RETRY_ATTEMPTS} retry attempts: {e}"
                    )));
                }
                return Err(e);
            }
        }
    }
}
