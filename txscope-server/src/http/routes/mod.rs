//! Route handlers organized by resource

pub mod example;
pub mod health;
