//! Domain models with validation at construction
//!
//! Invalid input returns ValidationError, not panic.

pub mod example;
pub mod validation;

pub use example::{Example, ExampleName, MAX_EXAMPLE_NAME_LEN};
pub use validation::ValidationError;
