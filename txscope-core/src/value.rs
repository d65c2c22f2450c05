//! Parameter and cell values, rows and row sequences
//!
//! Backends translate their native types to and from `Value`, which keeps the
//! `Tx` surface independent of any driver and lets fakes return rows.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DbError;

/// A single statement parameter or result cell
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Uuid(Uuid),
    Timestamp(DateTime<Utc>),
    Json(serde_json::Value),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Text(_) => "text",
            Self::Bytes(_) => "bytes",
            Self::Uuid(_) => "uuid",
            Self::Timestamp(_) => "timestamp",
            Self::Json(_) => "json",
        }
    }
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident $(as $cast:ty)?),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Self::$variant(v $(as $cast)?)
                }
            }
        )*
    };
}

value_from! {
    bool => Bool,
    i16 => Int as i64,
    i32 => Int as i64,
    i64 => Int,
    f32 => Float as f64,
    f64 => Float,
    String => Text,
    Vec<u8> => Bytes,
    Uuid => Uuid,
    DateTime<Utc> => Timestamp,
    serde_json::Value => Json,
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_owned())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

/// Build a `Vec<Value>` of statement parameters
///
/// ```ignore
/// tx.execute(&ctx, "UPDATE example SET name = $1 WHERE id = $2", &params![name, id]).await?;
/// ```
#[macro_export]
macro_rules! params {
    () => { ::std::vec::Vec::<$crate::Value>::new() };
    ($($v:expr),+ $(,)?) => { ::std::vec![$($crate::Value::from($v)),+] };
}

/// Conversion from a result cell
pub trait FromValue: Sized {
    fn from_value(column: &str, value: &Value) -> Result<Self, DbError>;
}

fn mismatch(column: &str, expected: &str, got: &Value) -> DbError {
    DbError::decode(column, format!("expected {expected}, got {}", got.kind()))
}

impl FromValue for bool {
    fn from_value(column: &str, value: &Value) -> Result<Self, DbError> {
        match value {
            Value::Bool(b) => Ok(*b),
            other => Err(mismatch(column, "bool", other)),
        }
    }
}

impl FromValue for i64 {
    fn from_value(column: &str, value: &Value) -> Result<Self, DbError> {
        match value {
            Value::Int(i) => Ok(*i),
            other => Err(mismatch(column, "int", other)),
        }
    }
}

impl FromValue for i32 {
    fn from_value(column: &str, value: &Value) -> Result<Self, DbError> {
        let wide = i64::from_value(column, value)?;
        i32::try_from(wide).map_err(|_| DbError::decode(column, format!("{wide} out of range for i32")))
    }
}

impl FromValue for f64 {
    fn from_value(column: &str, value: &Value) -> Result<Self, DbError> {
        match value {
            Value::Float(f) => Ok(*f),
            Value::Int(i) => Ok(*i as f64),
            other => Err(mismatch(column, "float", other)),
        }
    }
}

impl FromValue for String {
    fn from_value(column: &str, value: &Value) -> Result<Self, DbError> {
        match value {
            Value::Text(s) => Ok(s.clone()),
            other => Err(mismatch(column, "text", other)),
        }
    }
}

impl FromValue for Vec<u8> {
    fn from_value(column: &str, value: &Value) -> Result<Self, DbError> {
        match value {
            Value::Bytes(b) => Ok(b.clone()),
            other => Err(mismatch(column, "bytes", other)),
        }
    }
}

impl FromValue for Uuid {
    fn from_value(column: &str, value: &Value) -> Result<Self, DbError> {
        match value {
            Value::Uuid(u) => Ok(*u),
            other => Err(mismatch(column, "uuid", other)),
        }
    }
}

impl FromValue for DateTime<Utc> {
    fn from_value(column: &str, value: &Value) -> Result<Self, DbError> {
        match value {
            Value::Timestamp(t) => Ok(*t),
            other => Err(mismatch(column, "timestamp", other)),
        }
    }
}

impl FromValue for serde_json::Value {
    fn from_value(column: &str, value: &Value) -> Result<Self, DbError> {
        match value {
            Value::Json(j) => Ok(j.clone()),
            other => Err(mismatch(column, "json", other)),
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(column: &str, value: &Value) -> Result<Self, DbError> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(column, other).map(Some),
        }
    }
}

/// One result row
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<Value>,
}

impl Row {
    pub fn new(columns: Arc<[String]>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Decode the cell of the named column
    pub fn get<T: FromValue>(&self, column: &str) -> Result<T, DbError> {
        let idx = self
            .columns
            .iter()
            .position(|c| c == column)
            .ok_or_else(|| DbError::ColumnNotFound(column.to_owned()))?;
        self.get_at(idx)
    }

    /// Decode the cell at position `idx`
    pub fn get_at<T: FromValue>(&self, idx: usize) -> Result<T, DbError> {
        let value = self
            .values
            .get(idx)
            .ok_or_else(|| DbError::ColumnNotFound(format!("#{idx}")))?;
        let column = self.columns.get(idx).map(String::as_str).unwrap_or("?");
        T::from_value(column, value)
    }
}

/// Map a row onto a domain type
pub trait FromRow: Sized {
    fn from_row(row: &Row) -> Result<Self, DbError>;
}

/// A finite, forward-only sequence of rows produced by one query.
///
/// Iterating consumes it; run the query again for a fresh sequence.
#[derive(Debug)]
pub struct Rows {
    columns: Arc<[String]>,
    rows: std::vec::IntoIter<Vec<Value>>,
    rows_affected: u64,
}

impl Rows {
    pub fn new(columns: Arc<[String]>, rows: Vec<Vec<Value>>, rows_affected: u64) -> Self {
        Self {
            columns,
            rows: rows.into_iter(),
            rows_affected,
        }
    }

    /// Build a row set from column names and rows, for fakes and tests
    pub fn from_values<C: AsRef<str>>(columns: &[C], rows: Vec<Vec<Value>>) -> Self {
        let columns: Arc<[String]> = columns.iter().map(|c| c.as_ref().to_owned()).collect();
        Self::new(columns, rows, 0)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Rows reported as affected by the statement (INSERT/UPDATE/DELETE ... RETURNING)
    pub fn rows_affected(&self) -> u64 {
        self.rows_affected
    }

    /// Decode every remaining row with `T::from_row`
    pub fn collect_as<T: FromRow>(self) -> Result<Vec<T>, DbError> {
        self.map(|row| T::from_row(&row)).collect()
    }
}

impl Iterator for Rows {
    type Item = Row;

    fn next(&mut self) -> Option<Row> {
        self.rows
            .next()
            .map(|values| Row::new(self.columns.clone(), values))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.rows.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Pair {
        id: i32,
        label: Option<String>,
    }

    impl FromRow for Pair {
        fn from_row(row: &Row) -> Result<Self, DbError> {
            Ok(Self {
                id: row.get("id")?,
                label: row.get("label")?,
            })
        }
    }

    #[test]
    fn params_macro_converts_each_argument() {
        let name: Option<&str> = None;
        let params = params![1, "x", true, name];
        assert_eq!(
            params,
            vec![
                Value::Int(1),
                Value::Text("x".into()),
                Value::Bool(true),
                Value::Null
            ]
        );
        assert!(params![].is_empty());
    }

    #[test]
    fn rows_decode_and_are_consumed_once() {
        let mut rows = Rows::from_values(
            &["id", "label"],
            vec![
                vec![Value::Int(1), Value::Text("one".into())],
                vec![Value::Int(2), Value::Null],
            ],
        );
        let first = rows.next().unwrap();
        assert_eq!(first.get::<i32>("id").unwrap(), 1);

        let rest = rows.collect_as::<Pair>().unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].id, 2);
        assert!(rest[0].label.is_none());
    }

    #[test]
    fn decode_errors_name_the_column() {
        let row = Row::new(Arc::from(vec!["id".to_owned()]), vec![Value::Text("x".into())]);
        let err = row.get::<i64>("id").unwrap_err();
        assert_eq!(err.to_string(), "column 'id': expected int, got text");
        assert!(matches!(row.get::<i64>("missing"), Err(DbError::ColumnNotFound(_))));
    }

    #[test]
    fn i32_rejects_out_of_range() {
        let row = Row::new(Arc::from(vec!["n".to_owned()]), vec![Value::Int(i64::MAX)]);
        assert!(row.get::<i32>("n").is_err());
    }
}
