//! Change source registry
//!
//! Discovers capture instances, detects instances created inside an
//! interval and resolves the captured-column schema of their source tables.
//!
//! The registry holds no state of its own. Changes between polling cycles are
//! found by reconciling the previous [`RegistrySnapshot`] with the latest
//! listing, which yields an explicit [`RegistryDiff`].

use super::change_table::ChangeTable;
use super::connection::SqlServerConnection;
use super::Lsn;
use crate::common::{CdcError, Result, TableId, TableSchema};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, trace};

/// Include/exclude rules over `(schema, table)` pairs.
///
/// Excludes win; an empty include list captures every table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableFilter {
    pub include: Vec<(String, String)>,
    pub exclude: Vec<(String, String)>,
}

impl TableFilter {
    pub fn new(include: Vec<(String, String)>, exclude: Vec<(String, String)>) -> Self {
        Self { include, exclude }
    }

    pub fn matches(&self, table: &TableId) -> bool {
        let is = |(schema, name): &(String, String)| *schema == table.schema && *name == table.table;

        if self.exclude.iter().any(is) {
            return false;
        }
        self.include.is_empty() || self.include.iter().any(is)
    }
}

/// Capture instance discovery over a [`SqlServerConnection`]
pub struct ChangeTableRegistry<'a, C: SqlServerConnection + ?Sized> {
    conn: &'a C,
    filter: &'a TableFilter,
}

impl<'a, C: SqlServerConnection + ?Sized> ChangeTableRegistry<'a, C> {
    pub fn new(conn: &'a C, filter: &'a TableFilter) -> Self {
        Self { conn, filter }
    }

    /// All capture instances of tables passing the filter.
    ///
    /// Failures surface as `Discovery`; retrying is left to the polling loop.
    pub async fn list_sources(&self) -> Result<Vec<ChangeTable>> {
        let rows = self
            .conn
            .list_change_tables()
            .await
            .map_err(as_discovery)?;
        let total = rows.len();

        let mut sources = Vec::with_capacity(total);
        for raw in rows {
            let table = ChangeTable::from_raw(self.conn.database(), raw)?;
            if self.filter.matches(&table.source_table) {
                sources.push(table);
            } else {
                trace!("Skipping filtered capture instance {}", table.capture_instance);
            }
        }

        debug!(
            "Discovered {} capture instances ({} after filtering)",
            total,
            sources.len()
        );
        Ok(sources)
    }

    /// Capture instances whose start LSN lies in `[from, to]`.
    ///
    /// `cdc.change_tables` carries no source table name, so each hit is
    /// resolved against the full listing by capture instance.
    pub async fn list_new_sources(&self, from: &Lsn, to: &Lsn) -> Result<Vec<ChangeTable>> {
        let new_rows = self
            .conn
            .list_new_change_tables(from, to)
            .await
            .map_err(as_discovery)?;
        if new_rows.is_empty() {
            return Ok(Vec::new());
        }

        let mut known: HashMap<String, ChangeTable> = self
            .list_sources()
            .await?
            .into_iter()
            .map(|t| (t.capture_instance.clone(), t))
            .collect();

        let mut sources = Vec::with_capacity(new_rows.len());
        for row in new_rows {
            match known.remove(&row.capture_instance) {
                Some(table) => {
                    info!("New capture instance {} within [{}, {}]", table, from, to);
                    sources.push(table);
                }
                None => trace!(
                    "New capture instance {} not listed or filtered out",
                    row.capture_instance
                ),
            }
        }
        Ok(sources)
    }

    /// Captured-column projection of a source's origin table.
    ///
    /// Columns added after capture was enabled are not in the captured set
    /// and are dropped. Key columns are filtered to the captured set as well.
    pub async fn resolve_table_schema(&self, source: &ChangeTable) -> Result<TableSchema> {
        let mut columns = self.conn.table_columns(&source.source_table).await?;
        let live = columns.len();

        columns.retain(|c| source.captured_columns.iter().any(|name| *name == c.name));
        columns.sort_by_key(|c| c.position);

        let key = self
            .conn
            .key_columns(&source.source_table)
            .await?
            .into_iter()
            .filter(|k| columns.iter().any(|c| c.name == *k))
            .collect();

        if columns.len() < live {
            debug!(
                "{} captures {} of {} columns of {}",
                source.capture_instance,
                columns.len(),
                live,
                source.source_table
            );
        }

        Ok(TableSchema::new(source.source_table.clone(), columns).with_primary_key(key))
    }
}

fn as_discovery(err: CdcError) -> CdcError {
    match err {
        CdcError::Discovery(_) => err,
        other => CdcError::discovery(other.to_string()),
    }
}

// ============================================================================
// Reconciliation
// ============================================================================

/// Last known set of capture instances, keyed by capture instance name
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    sources: BTreeMap<String, ChangeTable>,
}

/// Difference between two registry snapshots
#[derive(Debug, Clone)]
pub struct RegistryDiff {
    /// Instances not present in the previous snapshot
    pub added: Vec<ChangeTable>,
    /// Instances that disappeared or got a stop LSN since the previous snapshot
    pub retired: Vec<ChangeTable>,
    /// Instances present in both with no stop LSN change
    pub unchanged: usize,
    /// Snapshot to reconcile against next cycle
    pub snapshot: RegistrySnapshot,
}

impl RegistryDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.retired.is_empty()
    }
}

impl RegistrySnapshot {
    pub fn new(sources: Vec<ChangeTable>) -> Self {
        Self {
            sources: sources
                .into_iter()
                .map(|t| (t.capture_instance.clone(), t))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn get(&self, capture_instance: &str) -> Option<&ChangeTable> {
        self.sources.get(capture_instance)
    }

    /// Sources in capture instance order
    pub fn sources(&self) -> impl Iterator<Item = &ChangeTable> {
        self.sources.values()
    }

    /// Compare against the latest listing. `self` is not modified.
    pub fn reconcile(&self, latest: Vec<ChangeTable>) -> RegistryDiff {
        let next = RegistrySnapshot::new(latest);
        let mut added = Vec::new();
        let mut retired = Vec::new();
        let mut unchanged = 0;

        for (name, table) in &next.sources {
            match self.sources.get(name) {
                None => added.push(table.clone()),
                Some(prev) if !prev.is_retired() && table.is_retired() => {
                    retired.push(table.clone())
                }
                Some(_) => unchanged += 1,
            }
        }

        for (name, prev) in &self.sources {
            if !next.sources.contains_key(name) {
                retired.push(prev.clone());
            }
        }

        RegistryDiff {
            added,
            retired,
            unchanged,
            snapshot: next,
        }
    }
}
