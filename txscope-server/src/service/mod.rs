//! Service layer - units of work over the repositories

pub mod example;
pub mod health;

pub use example::{ExampleApi, ExampleService, ServiceError};
pub use health::{DatabaseHealth, HealthCheck};
