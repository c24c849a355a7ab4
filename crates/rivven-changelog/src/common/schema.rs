//! Table identity and captured-column schema

use serde::{Deserialize, Serialize};
use std::fmt;

/// Fully-qualified identity of an origin table.
///
/// Ordering is lexicographic on (database, schema, table); it is also the
/// deterministic tie-break between sources in the merge stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableId {
    pub database: String,
    pub schema: String,
    pub table: String,
}

impl TableId {
    pub fn new(
        database: impl Into<String>,
        schema: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        Self {
            database: database.into(),
            schema: schema.into(),
            table: table.into(),
        }
    }

    /// Bracket-quoted `[schema].[table]` for interpolation into T-SQL
    pub fn bracketed(&self) -> String {
        format!(
            "[{}].[{}]",
            self.schema.replace(']', "]]"),
            self.table.replace(']', "]]")
        )
    }

    /// `schema.table`
    pub fn qualified(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

/// One column of an origin table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    /// 1-based ordinal position in the origin table
    pub position: u32,
    /// Backend type name (`int`, `nvarchar`, `NUMBER`, `TIMESTAMP(6)`, ...)
    pub type_name: String,
    pub nullable: bool,
    /// Raw default expression as stored in the catalog
    pub default_value: Option<String>,
}

impl Column {
    pub fn new(name: impl Into<String>, position: u32, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            position,
            type_name: type_name.into(),
            nullable: true,
            default_value: None,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn with_default(mut self, expr: impl Into<String>) -> Self {
        self.default_value = Some(expr.into());
        self
    }
}

/// Captured-column projection of an origin table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub id: TableId,
    /// Columns in origin-table ordinal order
    pub columns: Vec<Column>,
    /// Primary key (or unique index) column names
    pub primary_key: Vec<String>,
}

impl TableSchema {
    pub fn new(id: TableId, columns: Vec<Column>) -> Self {
        Self {
            id,
            columns,
            primary_key: Vec::new(),
        }
    }

    pub fn with_primary_key(mut self, key: Vec<String>) -> Self {
        self.primary_key = key;
        self
    }

    /// Index of a column by exact name
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}
