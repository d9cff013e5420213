//! Prediction Market Engine
//!
//! Core library for a short-lived binary-claim prediction market: the
//! Ledger & Position Engine, the Oracle Consensus Engine, and the
//! Settlement Engine, plus the modules that support them (pricing, market
//! registry, reputation, advisor, sanitisation, config, persistence).

pub mod advisor;
pub mod config;
pub mod database;
pub mod error;
pub mod ledger;
pub mod market;
pub mod oracle;
pub mod pricing;
pub mod reputation;
pub mod retry;
pub mod sanitize;
pub mod settlement;
pub mod stress;
pub mod trade;
pub mod user;

#[cfg(test)]
mod integration_tests;
