//! SQL Server snapshot support for initial data sync
//!
//! Each captured table is read once under an exclusive lock before streaming
//! starts. Rows are delivered as `Snapshot` records positioned at the
//! watermark LSN read before the first table; streaming then continues from
//! the LSN after the watermark. Changes committed between the watermark and
//! a table's lock may appear in both the snapshot and the stream.

use super::connection::SqlServerConnection;
use super::Lsn;
use crate::common::{
    with_table_lock, CdcError, CdcOp, ChangeRecord, DeliverySender, LogPosition, Result,
    TableSchema,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// When to bootstrap tables before streaming
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotMode {
    /// Snapshot when no committed offset exists, then stream
    #[default]
    Initial,
    /// Stream only
    Never,
}

/// Snapshot progress for a table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSnapshotProgress {
    pub schema: String,
    pub table: String,
    /// Rows delivered so far
    pub processed_rows: u64,
    pub complete: bool,
}

/// Overall snapshot state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotState {
    pub database: String,
    /// Watermark LSN (hex); streaming resumes after it
    pub snapshot_lsn: String,
    /// Per-table progress keyed by `schema.table`
    pub tables: BTreeMap<String, TableSnapshotProgress>,
    pub started_at: i64,
    pub completed_at: Option<i64>,
}

impl SnapshotState {
    pub fn new(database: &str, snapshot_lsn: &Lsn) -> Self {
        Self {
            database: database.to_string(),
            snapshot_lsn: snapshot_lsn.to_hex(),
            tables: BTreeMap::new(),
            started_at: chrono::Utc::now().timestamp(),
            completed_at: None,
        }
    }

    pub fn watermark(&self) -> Result<Lsn> {
        Lsn::from_hex(&self.snapshot_lsn)
    }

    /// Check if all tables are complete
    pub fn is_complete(&self) -> bool {
        self.tables.values().all(|t| t.complete)
    }

    pub fn is_table_complete(&self, schema: &str, table: &str) -> bool {
        self.tables
            .get(&format!("{}.{}", schema, table))
            .is_some_and(|t| t.complete)
    }

    /// Add a table to track
    pub fn add_table(&mut self, schema: &str, table: &str) {
        self.tables
            .entry(format!("{}.{}", schema, table))
            .or_insert_with(|| TableSnapshotProgress {
                schema: schema.to_string(),
                table: table.to_string(),
                processed_rows: 0,
                complete: false,
            });
    }

    /// Mark table as complete
    pub fn mark_complete(&mut self, schema: &str, table: &str, rows: u64) {
        if let Some(progress) = self.tables.get_mut(&format!("{}.{}", schema, table)) {
            progress.processed_rows = rows;
            progress.complete = true;
        }
    }

    /// Save state to file
    pub async fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Load state from file, `None` if it does not exist
    pub async fn load(path: &Path) -> Result<Option<Self>> {
        match tokio::fs::read_to_string(path).await {
            Ok(json) => Ok(Some(serde_json::from_str(&json)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Reads captured tables under an exclusive lock
pub struct SqlServerSnapshotExecutor<'a, C: SqlServerConnection + ?Sized> {
    conn: &'a C,
    sender: &'a DeliverySender<Lsn>,
    lock_timeout: Duration,
}

impl<'a, C: SqlServerConnection + ?Sized> SqlServerSnapshotExecutor<'a, C> {
    pub fn new(conn: &'a C, sender: &'a DeliverySender<Lsn>, lock_timeout: Duration) -> Self {
        Self {
            conn,
            sender,
            lock_timeout,
        }
    }

    /// Snapshot `tables` at `state`'s watermark.
    ///
    /// Tables already complete in `state` are skipped; `state` is saved to
    /// `progress_path` after every table.
    pub async fn execute(
        &self,
        tables: &[TableSchema],
        state: &mut SnapshotState,
        progress_path: Option<&Path>,
    ) -> Result<()> {
        let watermark = state.watermark()?;
        info!(
            "Starting snapshot of {} tables at watermark {}",
            tables.len(),
            watermark
        );

        for schema in tables {
            let id = &schema.id;
            state.add_table(&id.schema, &id.table);
            if state.is_table_complete(&id.schema, &id.table) {
                info!("Skipping {} (already complete)", id);
                continue;
            }

            let rows = with_table_lock(self.conn, id, self.lock_timeout, || {
                self.read_table(schema, watermark)
            })
            .await?;

            state.mark_complete(&id.schema, &id.table, rows);
            info!("Completed snapshot of {}: {} rows", id, rows);

            if let Some(path) = progress_path {
                state.save(path).await?;
            }
        }

        state.completed_at = Some(chrono::Utc::now().timestamp());
        if let Some(path) = progress_path {
            state.save(path).await?;
        }
        info!("Snapshot complete. Watermark LSN: {}", watermark);
        Ok(())
    }

    async fn read_table(&self, schema: &TableSchema, watermark: Lsn) -> Result<u64> {
        let columns: Vec<String> = schema.column_names().map(str::to_string).collect();
        let mut cursor = self.conn.snapshot_rows(&schema.id, &columns).await?;
        let mut rows = 0u64;

        while let Some(row) = cursor.next_row().await? {
            if row.values.len() != columns.len() {
                return Err(CdcError::schema_mismatch(format!(
                    "Snapshot of {} returned {} values for {} columns",
                    schema.id,
                    row.values.len(),
                    columns.len()
                )));
            }

            self.sender
                .deliver(ChangeRecord {
                    op: CdcOp::Snapshot,
                    op_code: 0,
                    table: schema.id.clone(),
                    source: "snapshot".to_string(),
                    position: watermark,
                    sequence: Lsn::NULL,
                    old: Vec::new(),
                    new: row.values,
                })
                .await?;
            rows += 1;

            if rows % 10_000 == 0 {
                debug!("Snapshotted {}: {} rows", schema.id, rows);
            }
        }
        Ok(rows)
    }
}
