//! Intraday Execution Engine Library
//!
//! Core components of the live intraday execution engine: position book,
//! broker error handling and retry, market data streaming, OTR throttling and
//! the per-account order execution state machine.

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod persistence;
pub mod rate_limit;
pub mod secrets;
pub mod task_runner;
