//! Database layer - schema setup and repositories

pub mod migrations;
pub mod repos;

pub use repos::*;
