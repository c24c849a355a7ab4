//! Capture instances and change-table rows

use crate::common::{
    CdcError, CdcOp, LogPosition, RawValue, Result, SourceRow, TableId, Validator,
};
use super::Lsn;
use std::fmt;

/// One capture instance of a source table.
///
/// A table can have two capture instances at a time (after a schema change
/// the old one is kept until dropped); each has its own change table and
/// its own valid LSN range.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChangeTable {
    pub source_table: TableId,
    /// e.g. `dbo_orders`
    pub capture_instance: String,
    /// Object id of the change table
    pub object_id: i32,
    /// First LSN the capture instance covers
    pub start_lsn: Lsn,
    /// Last LSN it covers; null while the instance is active
    pub stop_lsn: Lsn,
    /// Captured columns in change-table order
    pub captured_columns: Vec<String>,
}

impl ChangeTable {
    /// Convert one `sys.sp_cdc_help_change_data_capture` row.
    pub fn from_raw(database: &str, raw: RawChangeTable) -> Result<Self> {
        Validator::validate_capture_instance(&raw.capture_instance)
            .map_err(|e| CdcError::discovery(e.to_string()))?;

        let start_lsn = lsn_column(&raw.capture_instance, "start_lsn", raw.start_lsn.as_deref())?;
        let stop_lsn = lsn_column(&raw.capture_instance, "end_lsn", raw.end_lsn.as_deref())?;

        if !start_lsn.is_null() && !stop_lsn.is_null() && start_lsn > stop_lsn {
            return Err(CdcError::discovery(format!(
                "Capture instance '{}' has start LSN {} after stop LSN {}",
                raw.capture_instance, start_lsn, stop_lsn
            )));
        }

        Ok(Self {
            source_table: TableId::new(database, raw.schema, raw.table),
            capture_instance: raw.capture_instance,
            object_id: raw.object_id,
            start_lsn,
            stop_lsn,
            captured_columns: parse_captured_columns(raw.captured_column_list.as_deref()),
        })
    }

    /// Whether capture has been retired (stop LSN set)
    pub fn is_retired(&self) -> bool {
        !self.stop_lsn.is_null()
    }

    /// Name of the underlying change table, `cdc.<capture_instance>_CT`
    pub fn change_table_name(&self) -> String {
        format!("{}_CT", self.capture_instance)
    }

    /// Label used for merge tie-breaks and error context
    pub fn label(&self) -> String {
        format!("{}:{}", self.source_table, self.capture_instance)
    }
}

impl fmt::Display for ChangeTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}) [{}, {}]",
            self.capture_instance, self.source_table, self.start_lsn, self.stop_lsn
        )
    }
}

fn lsn_column(capture_instance: &str, column: &str, bytes: Option<&[u8]>) -> Result<Lsn> {
    Lsn::from_bytes(bytes).map_err(|e| {
        CdcError::discovery(format!(
            "Invalid {} for capture instance '{}': {}",
            column, capture_instance, e
        ))
    })
}

/// `"[id], [first name]"` → `["id", "first name"]`
pub fn parse_captured_columns(list: Option<&str>) -> Vec<String> {
    let stripped: String = list
        .unwrap_or_default()
        .chars()
        .filter(|c| *c != '[' && *c != ']')
        .collect();
    if stripped.is_empty() {
        return Vec::new();
    }
    stripped.split(", ").map(str::to_string).collect()
}

/// Row of `EXEC sys.sp_cdc_help_change_data_capture`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawChangeTable {
    pub schema: String,
    pub table: String,
    pub capture_instance: String,
    pub object_id: i32,
    pub start_lsn: Option<Vec<u8>>,
    pub end_lsn: Option<Vec<u8>>,
    pub captured_column_list: Option<String>,
}

/// Row of `SELECT * FROM cdc.change_tables WHERE start_lsn BETWEEN ? AND ?`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawNewChangeTable {
    pub object_id: i32,
    pub capture_instance: String,
    pub start_lsn: Option<Vec<u8>>,
    pub end_lsn: Option<Vec<u8>>,
}

// ============================================================================
// Change rows
// ============================================================================

/// `__$operation` values of `fn_cdc_get_all_changes_<ci>(.., N'all update old')`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum ChangeOperation {
    Delete = 1,
    Insert = 2,
    UpdateBefore = 3,
    UpdateAfter = 4,
}

impl ChangeOperation {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Delete),
            2 => Some(Self::Insert),
            3 => Some(Self::UpdateBefore),
            4 => Some(Self::UpdateAfter),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn op(self) -> CdcOp {
        match self {
            Self::Delete => CdcOp::Delete,
            Self::Insert => CdcOp::Insert,
            Self::UpdateBefore | Self::UpdateAfter => CdcOp::Update,
        }
    }
}

/// One row of a change-table range query
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeTableRow {
    /// `__$start_lsn`: commit LSN of the transaction
    pub start_lsn: Lsn,
    /// `__$seqval`: order of the change within the transaction
    pub seqval: Lsn,
    /// `__$operation`
    pub operation: u8,
    /// `__$update_mask`
    pub update_mask: Option<Vec<u8>>,
    /// Captured column values in change-table order
    pub values: Vec<Option<RawValue>>,
}

impl SourceRow for ChangeTableRow {
    type Key = (Lsn, Lsn, u8);

    fn order_key(&self) -> Self::Key {
        (self.start_lsn, self.seqval, self.operation)
    }
}

/// One row of a bootstrap read
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotRow {
    pub values: Vec<Option<RawValue>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(start: Option<Lsn>, end: Option<Lsn>) -> RawChangeTable {
        RawChangeTable {
            schema: "dbo".to_string(),
            table: "orders".to_string(),
            capture_instance: "dbo_orders".to_string(),
            object_id: 1_234_567,
            start_lsn: start.and_then(|l| l.to_bytes()),
            end_lsn: end.and_then(|l| l.to_bytes()),
            captured_column_list: Some("[id], [customer name], [total]".to_string()),
        }
    }

    #[test]
    fn test_from_raw() {
        let table =
            ChangeTable::from_raw("shop", raw(Some(Lsn::from_parts(1, 0, 0)), None)).unwrap();

        assert_eq!(table.source_table, TableId::new("shop", "dbo", "orders"));
        assert_eq!(
            table.captured_columns,
            vec!["id", "customer name", "total"]
        );
        assert!(!table.is_retired());
        assert_eq!(table.change_table_name(), "dbo_orders_CT");
        assert_eq!(table.label(), "dbo.orders:dbo_orders");
    }

    #[test]
    fn test_start_after_stop_is_discovery_error() {
        let err = ChangeTable::from_raw(
            "shop",
            raw(Some(Lsn::from_parts(5, 0, 0)), Some(Lsn::from_parts(4, 0, 0))),
        )
        .unwrap_err();
        assert!(matches!(err, CdcError::Discovery(_)));
    }

    #[test]
    fn test_bad_lsn_width_is_discovery_error() {
        let mut row = raw(None, None);
        row.start_lsn = Some(vec![1, 2, 3]);
        assert!(matches!(
            ChangeTable::from_raw("shop", row),
            Err(CdcError::Discovery(_))
        ));
    }

    #[test]
    fn test_bad_capture_instance() {
        let mut row = raw(None, None);
        row.capture_instance = "dbo_orders; DROP TABLE x".to_string();
        assert!(matches!(
            ChangeTable::from_raw("shop", row),
            Err(CdcError::Discovery(_))
        ));
    }

    #[test]
    fn test_parse_captured_columns() {
        assert_eq!(parse_captured_columns(Some("[a]")), vec!["a"]);
        assert_eq!(parse_captured_columns(Some("[a], [b c]")), vec!["a", "b c"]);
        assert!(parse_captured_columns(None).is_empty());
        assert!(parse_captured_columns(Some("")).is_empty());
    }

    #[test]
    fn test_operation_codes() {
        assert_eq!(ChangeOperation::from_code(3), Some(ChangeOperation::UpdateBefore));
        assert_eq!(ChangeOperation::from_code(9), None);
        assert_eq!(ChangeOperation::Insert.code(), 2);
        assert_eq!(ChangeOperation::UpdateAfter.op(), CdcOp::Update);
    }
}
