//! # Oracle LogMiner Source
//!
//! Reads row changes from the redo log through LogMiner. LogMiner renders
//! each change as a SQL statement (`SQL_REDO`) against the table; the
//! values are recovered by parsing that text.
//!
//! ## Components
//!
//! | Type | Role |
//! |------|------|
//! | [`Scn`] | 8-byte log position, incremented by one |
//! | [`LogMinerDmlParser`] | `SQL_REDO` text → aligned before/after values |
//! | [`RedoReader`] | Merges redo threads and parses each row |
//! | [`LogMinerConnection`] | Connection capabilities the reader needs |
//!
//! ## Example
//!
//! ```rust
//! use rivven_changelog::common::{Column, RawValue, TableId, TableSchema};
//! use rivven_changelog::oracle::LogMinerDmlParser;
//!
//! let table = TableSchema::new(
//!     TableId::new("ORCLPDB1", "DEBEZIUM", "CUSTOMERS"),
//!     vec![Column::new("ID", 1, "NUMBER"), Column::new("NAME", 2, "VARCHAR2")],
//! );
//!
//! let entry = LogMinerDmlParser::new()
//!     .parse(
//!         r#"update "DEBEZIUM"."CUSTOMERS" set "NAME" = 'Bob' where "ID" = '1';"#,
//!         &table,
//!     )
//!     .unwrap();
//!
//! assert_eq!(entry.new[1], Some(RawValue::Literal("Bob".into())));
//! ```

mod dml_parser;
mod redo;
mod scanner;
mod scn;

pub use dml_parser::{Assignments, DmlEntry, DmlOperation, LogMinerDmlParser, ParsedStatement};
pub use redo::{LogMinerConnection, RedoReader, RedoRow};
pub use scanner::{ScanState, ValueToken, UNSUPPORTED_TYPE};
pub use scn::Scn;
