//! Materialized result rows.

use crate::Result;
use crate::error::{Error, TypeError};
use crate::value::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Column names shared by every row snapshot taken from one cursor.
///
/// Name lookup is ASCII case-insensitive and returns the first column with
/// a matching name.
#[derive(Debug, Clone)]
pub struct ColumnInfo {
    names: Vec<String>,
    /// Lower-cased name -> first index
    by_name: HashMap<String, usize>,
}

impl ColumnInfo {
    pub fn new(names: Vec<String>) -> Self {
        let mut by_name = HashMap::with_capacity(names.len());
        for (i, name) in names.iter().enumerate() {
            by_name.entry(name.to_ascii_lowercase()).or_insert(i);
        }
        Self { names, by_name }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Get the index of a column by name.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.by_name.get(&name.to_ascii_lowercase()).copied()
    }

    /// Get the name of a column by index.
    pub fn name_at(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }
}

/// A snapshot of one result row, detached from the statement that produced it.
#[derive(Debug, Clone)]
pub struct Row {
    values: Vec<Value>,
    columns: Arc<ColumnInfo>,
}

impl Row {
    /// Create a row with its own column info.
    pub fn new(column_names: Vec<String>, values: Vec<Value>) -> Self {
        Self {
            values,
            columns: Arc::new(ColumnInfo::new(column_names)),
        }
    }

    /// Create a row that shares column info with its siblings.
    pub fn with_columns(columns: Arc<ColumnInfo>, values: Vec<Value>) -> Self {
        Self { values, columns }
    }

    pub fn column_info(&self) -> Arc<ColumnInfo> {
        Arc::clone(&self.columns)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Get a value by column index.
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Get a value by column name.
    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.columns.index_of(name).and_then(|i| self.values.get(i))
    }

    /// Get a typed value by column index.
    pub fn get_as<T: FromValue>(&self, index: usize) -> Result<T> {
        let value = self.get(index).ok_or_else(|| {
            Error::Type(TypeError {
                expected: std::any::type_name::<T>(),
                actual: format!(
                    "index {} out of bounds (row has {} columns)",
                    index,
                    self.len()
                ),
                column: None,
            })
        })?;
        T::from_value(value).map_err(|e| with_column(e, self.columns.name_at(index)))
    }

    /// Get a typed value by column name.
    pub fn get_named<T: FromValue>(&self, name: &str) -> Result<T> {
        let value = self.get_by_name(name).ok_or_else(|| {
            Error::Type(TypeError {
                expected: std::any::type_name::<T>(),
                actual: format!("column '{}' not found", name),
                column: Some(name.to_string()),
            })
        })?;
        T::from_value(value).map_err(|e| with_column(e, Some(name)))
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.names().iter().map(String::as_str)
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.values.iter()
    }

    /// Iterate over (column_name, value) pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.column_names().zip(self.values.iter())
    }

    /// Consume the row and return its values.
    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    /// Render the row as a JSON object keyed by column name.
    ///
    /// Later duplicates of a column name overwrite earlier ones.
    pub fn to_json(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = self
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_json()))
            .collect();
        serde_json::Value::Object(map)
    }
}

fn with_column(err: Error, column: Option<&str>) -> Error {
    match err {
        Error::Type(mut te) if te.column.is_none() => {
            te.column = column.map(str::to_string);
            Error::Type(te)
        }
        e => e,
    }
}

/// Conversion from a borrowed `Value` into a Rust type.
pub trait FromValue: Sized {
    fn from_value(value: &Value) -> Result<Self>;
}

macro_rules! from_value_via_try_from {
    ($($ty:ty),*) => {
        $(
            impl FromValue for $ty {
                fn from_value(value: &Value) -> Result<Self> {
                    <$ty>::try_from(value.clone())
                }
            }
        )*
    };
}

from_value_via_try_from!(bool, i32, i64, f64, String, Vec<u8>);

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Null => Ok(None),
            v => T::from_value(v).map(Some),
        }
    }
}

impl FromValue for Value {
    fn from_value(value: &Value) -> Result<Self> {
        Ok(value.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Row {
        Row::new(
            vec!["id".to_string(), "Name".to_string(), "data".to_string()],
            vec![
                Value::BigInt(1),
                Value::Text("Alice".to_string()),
                Value::Bytes(vec![0xde, 0xad]),
            ],
        )
    }

    #[test]
    fn test_row_access_by_index_and_name() {
        let row = sample();
        assert_eq!(row.len(), 3);
        assert_eq!(row.get(0), Some(&Value::BigInt(1)));
        assert_eq!(row.get(3), None);
        assert_eq!(row.get_by_name("name"), Some(&Value::Text("Alice".to_string())));
        assert_eq!(row.get_by_name("NAME"), row.get(1));
        assert_eq!(row.get_by_name("missing"), None);
    }

    #[test]
    fn test_row_typed_access() {
        let row = sample();
        assert_eq!(row.get_as::<i64>(0).unwrap(), 1);
        assert_eq!(row.get_as::<i32>(0).unwrap(), 1);
        assert_eq!(row.get_named::<String>("name").unwrap(), "Alice");
        assert_eq!(row.get_named::<Vec<u8>>("data").unwrap(), vec![0xde, 0xad]);
    }

    #[test]
    fn test_row_type_errors_name_the_column() {
        let row = sample();
        match row.get_named::<i64>("name") {
            Err(Error::Type(te)) => assert_eq!(te.column.as_deref(), Some("name")),
            other => panic!("unexpected: {:?}", other),
        }
        match row.get_as::<i64>(1) {
            Err(Error::Type(te)) => assert_eq!(te.column.as_deref(), Some("Name")),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(row.get_as::<i32>(99).is_err());
    }

    #[test]
    fn test_row_null_handling() {
        let row = Row::new(vec!["n".to_string()], vec![Value::Null]);
        assert_eq!(row.get_named::<Option<i64>>("n").unwrap(), None);
        assert!(row.get_named::<i64>("n").is_err());
    }

    #[test]
    fn test_duplicate_names_resolve_to_first() {
        let info = ColumnInfo::new(vec!["a".to_string(), "A".to_string()]);
        assert_eq!(info.index_of("a"), Some(0));
        assert_eq!(info.name_at(1), Some("A"));
    }

    #[test]
    fn test_shared_columns() {
        let info = Arc::new(ColumnInfo::new(vec!["x".to_string()]));
        let r1 = Row::with_columns(Arc::clone(&info), vec![Value::BigInt(1)]);
        let r2 = Row::with_columns(Arc::clone(&info), vec![Value::BigInt(2)]);
        assert!(Arc::ptr_eq(&r1.column_info(), &r2.column_info()));
        assert_eq!(r2.into_values(), vec![Value::BigInt(2)]);
    }

    #[test]
    fn test_to_json() {
        let json = sample().to_json();
        assert_eq!(
            json,
            serde_json::json!({"id": 1, "Name": "Alice", "data": "3q0="})
        );
    }
}
