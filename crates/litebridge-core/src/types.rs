//! Column type affinity and runtime storage classes.

use std::fmt;

/// Runtime storage class of a single value, as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageClass {
    Integer,
    Float,
    Text,
    Blob,
    Null,
}

/// Type affinity derived from a column's declared type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Affinity {
    Integer,
    Text,
    Real,
    Numeric,
    /// Declared BLOB, or no declared type at all
    None,
}

impl StorageClass {
    /// Map a native fundamental datatype code (`SQLITE_INTEGER` ..= `SQLITE_NULL`).
    pub const fn from_code(code: i32) -> Self {
        match code {
            1 => StorageClass::Integer,
            2 => StorageClass::Float,
            3 => StorageClass::Text,
            4 => StorageClass::Blob,
            _ => StorageClass::Null,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            StorageClass::Integer => "INTEGER",
            StorageClass::Float => "REAL",
            StorageClass::Text => "TEXT",
            StorageClass::Blob => "BLOB",
            StorageClass::Null => "NULL",
        }
    }
}

impl Affinity {
    /// Compute the affinity of a declared column type.
    ///
    /// Rules are applied in order on the upper-cased type name:
    /// contains `INT` → INTEGER; `CHAR`, `CLOB` or `TEXT` → TEXT;
    /// `BLOB` or no type → NONE; `REAL`, `FLOA` or `DOUB` → REAL;
    /// anything else → NUMERIC.
    pub fn from_decl_type(decl_type: Option<&str>) -> Self {
        let decl = match decl_type {
            Some(t) if !t.trim().is_empty() => t.to_ascii_uppercase(),
            _ => return Affinity::None,
        };
        if decl.contains("INT") {
            Affinity::Integer
        } else if decl.contains("CHAR") || decl.contains("CLOB") || decl.contains("TEXT") {
            Affinity::Text
        } else if decl.contains("BLOB") {
            Affinity::None
        } else if decl.contains("REAL") || decl.contains("FLOA") || decl.contains("DOUB") {
            Affinity::Real
        } else {
            Affinity::Numeric
        }
    }
}

impl fmt::Display for StorageClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_affinity_rules() {
        assert_eq!(Affinity::from_decl_type(Some("INTEGER")), Affinity::Integer);
        assert_eq!(Affinity::from_decl_type(Some("bigint")), Affinity::Integer);
        // INT wins over CHAR
        assert_eq!(Affinity::from_decl_type(Some("CHARINT")), Affinity::Integer);
        assert_eq!(Affinity::from_decl_type(Some("VARCHAR(20)")), Affinity::Text);
        assert_eq!(Affinity::from_decl_type(Some("clob")), Affinity::Text);
        assert_eq!(Affinity::from_decl_type(Some("BLOB")), Affinity::None);
        assert_eq!(Affinity::from_decl_type(Some("")), Affinity::None);
        assert_eq!(Affinity::from_decl_type(None), Affinity::None);
        assert_eq!(Affinity::from_decl_type(Some("DOUBLE PRECISION")), Affinity::Real);
        assert_eq!(Affinity::from_decl_type(Some("FLOAT")), Affinity::Real);
        assert_eq!(Affinity::from_decl_type(Some("DECIMAL(10,2)")), Affinity::Numeric);
        assert_eq!(Affinity::from_decl_type(Some("DATETIME")), Affinity::Numeric);
    }

    #[test]
    fn test_storage_class_codes() {
        assert_eq!(StorageClass::from_code(1), StorageClass::Integer);
        assert_eq!(StorageClass::from_code(4), StorageClass::Blob);
        assert_eq!(StorageClass::from_code(5), StorageClass::Null);
        assert_eq!(StorageClass::Float.to_string(), "REAL");
    }
}
