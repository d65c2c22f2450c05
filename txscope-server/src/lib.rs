//! txscope-server: example service wired through txscope transactions
//!
//! Layers, outermost first:
//! - `http`: axum routes, per-request contexts, JSON errors
//! - `service`: one unit of work per operation via `TxManager`
//! - `db`: repositories that find the active transaction with `TxGetter`

pub mod config;
pub mod db;
pub mod http;
pub mod logging;
pub mod models;
pub mod service;

pub use config::Config;
