//! Example record and its validated name

use serde::Serialize;
use txscope_core::{DbError, FromRow, Row};

use super::ValidationError;

/// Maximum length of an example name, in characters
pub const MAX_EXAMPLE_NAME_LEN: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Example {
    pub id: i32,
    pub name: String,
}

impl FromRow for Example {
    fn from_row(row: &Row) -> Result<Self, DbError> {
        Ok(Self {
            id: row.get("id")?,
            name: row.get("name")?,
        })
    }
}

/// Non-blank name of at most `MAX_EXAMPLE_NAME_LEN` characters
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExampleName(String);

impl ExampleName {
    pub fn new(s: &str) -> Result<Self, ValidationError> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(ValidationError::Empty { field: "name" });
        }
        if trimmed.chars().count() > MAX_EXAMPLE_NAME_LEN {
            return Err(ValidationError::TooLong {
                field: "name",
                max: MAX_EXAMPLE_NAME_LEN,
            });
        }
        Ok(Self(trimmed.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl AsRef<str> for ExampleName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
