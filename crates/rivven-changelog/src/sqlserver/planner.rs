//! Per-source query windows for one polling interval
//!
//! A capture instance created partway through an interval only holds
//! changes from its own start LSN on; querying it from the interval start
//! would fail on the server (`fn_cdc_get_all_changes_*` rejects bounds below
//! the instance's minimum). The planner clamps each source's lower bound:
//!
//! ```text
//!   interval        [from ....................... to]
//!   source A   [start ........................................)   A: [from, to]
//!   source B                 [start ............................)  B: [start, to]
//!   source C  [start ... stop]                                    C: excluded
//! ```
//!
//! While a table migrates to a new capture instance both instances record
//! the same changes. The older window is cut off at the newer instance's
//! start LSN, so every change comes from exactly one instance and the newer
//! column set wins from its first change on.

use super::change_table::ChangeTable;
use super::connection::SqlServerConnection;
use super::Lsn;
use crate::common::{LogPosition, Result};
use std::cmp::max;
use tracing::{debug, trace};

/// Closed LSN range to query for one capture instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceWindow {
    pub source: ChangeTable,
    pub from: Lsn,
    pub to: Lsn,
    /// Exclusive upper bound set by a newer capture instance of the table
    pub until: Option<Lsn>,
}

impl SourceWindow {
    /// Whether a change at `lsn` belongs to this window's capture instance
    pub fn owns(&self, lsn: &Lsn) -> bool {
        self.until.map_or(true, |until| *lsn < until)
    }

    /// Merge label; orders by table identity, then capture instance
    pub fn label(&self) -> String {
        self.source.label()
    }
}

/// Computes [`SourceWindow`]s for an interval
pub struct WindowPlanner;

impl WindowPlanner {
    /// Plan the windows of `[from, to]` over `sources`.
    ///
    /// - sources stopped before `from` are excluded;
    /// - the lower bound is `max(source start, from)`, falling back to the
    ///   server's minimum LSN for the instance when that is null;
    /// - a window whose lower bound is past `to` is dropped;
    /// - a window is cut off at the start LSN of the next newer capture
    ///   instance of the same table, and dropped when that leaves nothing.
    ///
    /// The result is sorted by table identity, then capture instance, and
    /// depends only on the arguments and the server's answers.
    pub async fn plan<C>(
        conn: &C,
        sources: &[ChangeTable],
        from: &Lsn,
        to: &Lsn,
    ) -> Result<Vec<SourceWindow>>
    where
        C: SqlServerConnection + ?Sized,
    {
        let mut windows = Vec::with_capacity(sources.len());

        for source in sources {
            if !source.stop_lsn.is_null() && source.stop_lsn < *from {
                trace!("Capture instance {} retired before {}", source, from);
                continue;
            }

            let mut effective_from = max(source.start_lsn, *from);
            if effective_from.is_null() {
                effective_from = conn.min_lsn(&source.capture_instance).await?;
                if effective_from.is_null() {
                    debug!(
                        "No minimum LSN for capture instance {}, skipping",
                        source.capture_instance
                    );
                    continue;
                }
            }

            if effective_from > *to {
                trace!(
                    "Capture instance {} starts at {} after interval end {}",
                    source.capture_instance,
                    effective_from,
                    to
                );
                continue;
            }

            let until = superseded_at(source, sources);
            if let Some(until) = until {
                if until <= effective_from {
                    trace!(
                        "Capture instance {} superseded at {} before {}",
                        source.capture_instance,
                        until,
                        effective_from
                    );
                    continue;
                }
            }

            windows.push(SourceWindow {
                source: source.clone(),
                from: effective_from,
                to: *to,
                until,
            });
        }

        windows.sort_by(|a, b| {
            a.source
                .source_table
                .cmp(&b.source.source_table)
                .then_with(|| a.source.capture_instance.cmp(&b.source.capture_instance))
        });

        debug!(
            "Planned {} of {} sources for [{}, {}]",
            windows.len(),
            sources.len(),
            from,
            to
        );
        Ok(windows)
    }
}

/// Start LSN of the next newer capture instance of `source`'s table
fn superseded_at(source: &ChangeTable, sources: &[ChangeTable]) -> Option<Lsn> {
    sources
        .iter()
        .filter(|other| {
            other.source_table == source.source_table
                && other.capture_instance != source.capture_instance
                && !other.start_lsn.is_null()
                && other.start_lsn > source.start_lsn
        })
        .map(|other| other.start_lsn)
        .min()
}
