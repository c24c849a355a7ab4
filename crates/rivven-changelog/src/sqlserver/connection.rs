//! SQL Server collaborator interface
//!
//! Everything the capture engine needs from a live server, expressed as an
//! async trait. The engine never builds connections or SQL itself; the
//! `tds` feature provides a Tiberius implementation and tests use in-memory
//! ones.
//!
//! | Method | Server call |
//! |--------|-------------|
//! | `list_change_tables` | `EXEC sys.sp_cdc_help_change_data_capture` |
//! | `list_new_change_tables` | `SELECT * FROM cdc.change_tables WHERE start_lsn BETWEEN ? AND ?` |
//! | `min_lsn` | `SELECT sys.fn_cdc_get_min_lsn('<ci>')` |
//! | `max_lsn` | `SELECT sys.fn_cdc_get_max_lsn()` |
//! | `max_transaction_lsn` | `SELECT MAX(start_lsn) FROM cdc.lsn_time_mapping WHERE tran_id <> 0x00` |
//! | `increment_lsn` | `SELECT sys.fn_cdc_increment_lsn(?)` |
//! | `changes` | `SELECT * FROM cdc.fn_cdc_get_all_changes_<ci>(?, ?, N'all update old')` |

use super::change_table::{ChangeTableRow, RawChangeTable, RawNewChangeTable, SnapshotRow};
use super::planner::SourceWindow;
use super::Lsn;
use crate::common::{Column, Result, RowCursor, TableId, TableLocker};
use async_trait::async_trait;

/// Server-side operations used by the SQL Server capture engine.
///
/// Implementations report failures of administrative queries as
/// `CdcError::Discovery` and failures of range queries as
/// `CdcError::StreamRead`; transport errors may use the network variants.
#[async_trait]
pub trait SqlServerConnection: TableLocker {
    /// Database the connection is bound to
    fn database(&self) -> &str;

    /// All capture instances known to the server
    async fn list_change_tables(&self) -> Result<Vec<RawChangeTable>>;

    /// Capture instances whose start LSN lies in `[from, to]`
    async fn list_new_change_tables(&self, from: &Lsn, to: &Lsn)
        -> Result<Vec<RawNewChangeTable>>;

    /// Live column list of a table, ordinal order
    async fn table_columns(&self, table: &TableId) -> Result<Vec<Column>>;

    /// Primary key columns of a table, falling back to a unique index
    async fn key_columns(&self, table: &TableId) -> Result<Vec<String>>;

    /// Lowest LSN still available for a capture instance (null if unknown)
    async fn min_lsn(&self, capture_instance: &str) -> Result<Lsn>;

    /// Highest LSN processed by the capture job
    async fn max_lsn(&self) -> Result<Lsn>;

    /// Start LSN of the newest committed transaction.
    ///
    /// Lags `max_lsn` while the log only advances through records that
    /// belong to no transaction.
    async fn max_transaction_lsn(&self) -> Result<Lsn>;

    /// Start LSN of the `n`-th transaction at or after `from`.
    ///
    /// Used to cap how much work one interval takes on; null when no
    /// transaction exists past `from`.
    async fn nth_transaction_lsn_from_last(&self, from: &Lsn, n: u32) -> Result<Lsn>;

    /// `sys.fn_cdc_increment_lsn`
    async fn increment_lsn(&self, lsn: &Lsn) -> Result<Lsn>;

    /// Range query over one window, ordered by
    /// `(__$start_lsn, __$seqval, __$operation)`
    async fn changes(&self, window: &SourceWindow) -> Result<Box<dyn RowCursor<ChangeTableRow>>>;

    /// Full read of `columns` from a source table
    async fn snapshot_rows(
        &self,
        table: &TableId,
        columns: &[String],
    ) -> Result<Box<dyn RowCursor<SnapshotRow>>>;
}
