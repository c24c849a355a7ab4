//! In-memory SQL Server with CDC enabled

use async_trait::async_trait;
use rivven_changelog::common::{
    Column, RowCursor, SourceRow, TableId, TableLockGuard, TableLocker, VecCursor,
};
use rivven_changelog::sqlserver::{
    ChangeTableRow, Lsn, RawChangeTable, RawNewChangeTable, SnapshotRow, SourceWindow,
    SqlServerConnection,
};
use rivven_changelog::{CdcError, LogPosition, RawValue, Result};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Commit LSN `n`
pub fn lsn(n: u32) -> Lsn {
    Lsn::from_parts(n, 0, 0)
}

/// Sequence value `n` within a transaction
pub fn seq(n: u32) -> Lsn {
    Lsn::from_parts(0, n, 0)
}

pub fn int(v: i64) -> Option<RawValue> {
    Some(RawValue::Integer(v))
}

pub fn text(v: &str) -> Option<RawValue> {
    Some(RawValue::Text(v.to_string()))
}

pub fn change_row(commit: u32, sequence: u32, operation: u8, values: Vec<Option<RawValue>>) -> ChangeTableRow {
    ChangeTableRow {
        start_lsn: lsn(commit),
        seqval: seq(sequence),
        operation,
        update_mask: None,
        values,
    }
}

#[derive(Default)]
struct State {
    change_tables: Vec<RawChangeTable>,
    columns: HashMap<TableId, Vec<Column>>,
    keys: HashMap<TableId, Vec<String>>,
    rows: HashMap<String, Vec<ChangeTableRow>>,
    snapshot: HashMap<TableId, Vec<SnapshotRow>>,
    max_lsn: Lsn,
    min_lsn: HashMap<String, Lsn>,
    failing: HashSet<String>,
    lock_events: Vec<String>,
    lock_delay: Option<Duration>,
    change_queries: Vec<(String, Lsn, Lsn)>,
    listings: usize,
}

/// CDC-enabled database held in memory.
///
/// Capture instances, change rows and table contents are set up by the
/// test; every query the engine issues is answered from that state.
pub struct MockSqlServer {
    database: String,
    state: Arc<Mutex<State>>,
}

impl MockSqlServer {
    pub fn new(database: &str) -> Self {
        Self {
            database: database.to_string(),
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    fn table_id(&self, schema: &str, table: &str) -> TableId {
        TableId::new(&self.database, schema, table)
    }

    /// Define a source table; the first column is the key
    pub fn add_table(&self, schema: &str, table: &str, columns: &[(&str, &str)]) {
        let id = self.table_id(schema, table);
        let cols = columns
            .iter()
            .enumerate()
            .map(|(i, (name, ty))| Column::new(*name, i as u32 + 1, *ty))
            .collect();
        let mut state = self.state.lock().unwrap();
        state.columns.insert(id.clone(), cols);
        state
            .keys
            .insert(id, columns.first().map(|(n, _)| n.to_string()).into_iter().collect());
    }

    /// Enable capture of `captured` columns under `capture_instance`
    pub fn add_capture_instance(
        &self,
        schema: &str,
        table: &str,
        capture_instance: &str,
        start: Lsn,
        captured: &[&str],
    ) {
        let mut state = self.state.lock().unwrap();
        let object_id = 1000 + state.change_tables.len() as i32;
        state.change_tables.push(RawChangeTable {
            schema: schema.to_string(),
            table: table.to_string(),
            capture_instance: capture_instance.to_string(),
            object_id,
            start_lsn: start.to_bytes(),
            end_lsn: None,
            captured_column_list: Some(
                captured
                    .iter()
                    .map(|c| format!("[{}]", c))
                    .collect::<Vec<_>>()
                    .join(", "),
            ),
        });
    }

    /// Set the stop LSN of a capture instance
    pub fn retire(&self, capture_instance: &str, stop: Lsn) {
        let mut state = self.state.lock().unwrap();
        for table in &mut state.change_tables {
            if table.capture_instance == capture_instance {
                table.end_lsn = stop.to_bytes();
            }
        }
    }

    /// Remove a capture instance entirely
    pub fn drop_capture_instance(&self, capture_instance: &str) {
        let mut state = self.state.lock().unwrap();
        state
            .change_tables
            .retain(|t| t.capture_instance != capture_instance);
    }

    pub fn push_rows(&self, capture_instance: &str, rows: Vec<ChangeTableRow>) {
        let mut state = self.state.lock().unwrap();
        let mut max = state.max_lsn;
        for row in &rows {
            max = max.max(row.start_lsn);
        }
        state.max_lsn = max;
        state
            .rows
            .entry(capture_instance.to_string())
            .or_default()
            .extend(rows);
    }

    pub fn set_max_lsn(&self, max: Lsn) {
        self.state.lock().unwrap().max_lsn = max;
    }

    pub fn set_min_lsn(&self, capture_instance: &str, min: Lsn) {
        self.state
            .lock()
            .unwrap()
            .min_lsn
            .insert(capture_instance.to_string(), min);
    }

    /// Make range queries of `capture_instance` fail
    pub fn fail_changes(&self, capture_instance: &str) {
        self.state
            .lock()
            .unwrap()
            .failing
            .insert(capture_instance.to_string());
    }

    pub fn add_snapshot_rows(&self, schema: &str, table: &str, rows: Vec<Vec<Option<RawValue>>>) {
        let id = self.table_id(schema, table);
        self.state
            .lock()
            .unwrap()
            .snapshot
            .entry(id)
            .or_default()
            .extend(rows.into_iter().map(|values| SnapshotRow { values }));
    }

    /// Delay every lock acquisition
    pub fn set_lock_delay(&self, delay: Duration) {
        self.state.lock().unwrap().lock_delay = Some(delay);
    }

    /// `"lock schema.table"` / `"unlock schema.table"` in call order
    pub fn lock_events(&self) -> Vec<String> {
        self.state.lock().unwrap().lock_events.clone()
    }

    /// `(capture instance, from, to)` of every range query
    pub fn change_queries(&self) -> Vec<(String, Lsn, Lsn)> {
        self.state.lock().unwrap().change_queries.clone()
    }

    /// Number of full capture instance listings served
    pub fn listings(&self) -> usize {
        self.state.lock().unwrap().listings
    }
}

struct MockLockGuard {
    state: Arc<Mutex<State>>,
    table: String,
}

#[async_trait]
impl TableLockGuard for MockLockGuard {
    async fn release(self: Box<Self>) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .lock_events
            .push(format!("unlock {}", self.table));
        Ok(())
    }
}

#[async_trait]
impl TableLocker for MockSqlServer {
    async fn lock_table(&self, table: &TableId) -> Result<Box<dyn TableLockGuard>> {
        let delay = self.state.lock().unwrap().lock_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.state
            .lock()
            .unwrap()
            .lock_events
            .push(format!("lock {}", table));
        Ok(Box::new(MockLockGuard {
            state: self.state.clone(),
            table: table.to_string(),
        }))
    }
}

#[async_trait]
impl SqlServerConnection for MockSqlServer {
    fn database(&self) -> &str {
        &self.database
    }

    async fn list_change_tables(&self) -> Result<Vec<RawChangeTable>> {
        let mut state = self.state.lock().unwrap();
        state.listings += 1;
        Ok(state.change_tables.clone())
    }

    async fn list_new_change_tables(
        &self,
        from: &Lsn,
        to: &Lsn,
    ) -> Result<Vec<RawNewChangeTable>> {
        let state = self.state.lock().unwrap();
        let mut out = Vec::new();
        for table in &state.change_tables {
            let start = Lsn::from_bytes(table.start_lsn.as_deref())?;
            if !start.is_null() && start.in_range(from, to) {
                out.push(RawNewChangeTable {
                    object_id: table.object_id,
                    capture_instance: table.capture_instance.clone(),
                    start_lsn: table.start_lsn.clone(),
                    end_lsn: table.end_lsn.clone(),
                });
            }
        }
        Ok(out)
    }

    async fn table_columns(&self, table: &TableId) -> Result<Vec<Column>> {
        self.state
            .lock()
            .unwrap()
            .columns
            .get(table)
            .cloned()
            .ok_or_else(|| CdcError::schema(format!("Unknown table {}", table)))
    }

    async fn key_columns(&self, table: &TableId) -> Result<Vec<String>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .keys
            .get(table)
            .cloned()
            .unwrap_or_default())
    }

    async fn min_lsn(&self, capture_instance: &str) -> Result<Lsn> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .min_lsn
            .get(capture_instance)
            .copied()
            .unwrap_or(Lsn::NULL))
    }

    async fn max_lsn(&self) -> Result<Lsn> {
        Ok(self.state.lock().unwrap().max_lsn)
    }

    async fn max_transaction_lsn(&self) -> Result<Lsn> {
        let state = self.state.lock().unwrap();
        Ok(state
            .rows
            .values()
            .flatten()
            .map(|r| r.start_lsn)
            .max()
            .unwrap_or(Lsn::NULL))
    }

    async fn nth_transaction_lsn_from_last(&self, from: &Lsn, n: u32) -> Result<Lsn> {
        let state = self.state.lock().unwrap();
        let commits: Vec<Lsn> = state
            .rows
            .values()
            .flatten()
            .map(|r| r.start_lsn)
            .filter(|l| l >= from)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if commits.is_empty() {
            return Ok(Lsn::NULL);
        }
        Ok(commits[(n as usize).min(commits.len() - 1)])
    }

    async fn increment_lsn(&self, lsn: &Lsn) -> Result<Lsn> {
        let Some(bytes) = lsn.bytes() else {
            return Err(CdcError::invalid_position("Cannot increment the NULL LSN"));
        };
        let mut wide = [0u8; 16];
        wide[6..].copy_from_slice(bytes);
        let next = (u128::from_be_bytes(wide) + 1).to_be_bytes();
        let mut out = [0u8; 10];
        out.copy_from_slice(&next[6..]);
        Ok(Lsn::new(out))
    }

    async fn changes(&self, window: &SourceWindow) -> Result<Box<dyn RowCursor<ChangeTableRow>>> {
        let mut state = self.state.lock().unwrap();
        let ci = window.source.capture_instance.clone();
        state
            .change_queries
            .push((ci.clone(), window.from, window.to));
        if state.failing.contains(&ci) {
            return Err(CdcError::other(format!(
                "Invalid object name 'cdc.fn_cdc_get_all_changes_{}'",
                ci
            )));
        }
        let mut rows: Vec<ChangeTableRow> = state
            .rows
            .get(&ci)
            .into_iter()
            .flatten()
            .filter(|r| r.start_lsn.in_range(&window.from, &window.to))
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.order_key());
        Ok(Box::new(VecCursor::new(rows)))
    }

    async fn snapshot_rows(
        &self,
        table: &TableId,
        _columns: &[String],
    ) -> Result<Box<dyn RowCursor<SnapshotRow>>> {
        let rows = self
            .state
            .lock()
            .unwrap()
            .snapshot
            .get(table)
            .cloned()
            .unwrap_or_default();
        Ok(Box::new(VecCursor::new(rows)))
    }
}
