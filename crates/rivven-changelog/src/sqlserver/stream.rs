//! Merged change stream over one interval's windows
//!
//! Opens one `fn_cdc_get_all_changes_*` cursor per window, merges them by
//! `(__$start_lsn, __$seqval, __$operation)` and turns rows into
//! [`ChangeRecord`]s:
//!
//! - `1` / `2` become deletes / inserts;
//! - a `3` (before image) is held until the `4` (after image) of the same
//!   `(lsn, seqval)` from the same window arrives, and the pair becomes one
//!   update;
//! - a `4` without a before image becomes an update with unknown old values;
//! - a `3` not followed by its `4` is a read error.
//!
//! Rows at or past a window's cutoff belong to a newer capture instance of
//! the same table and are dropped.

use super::change_table::{ChangeOperation, ChangeTableRow};
use super::connection::SqlServerConnection;
use super::planner::SourceWindow;
use super::Lsn;
use crate::common::{
    CdcError, ChangeRecord, MergeInput, MergeStream, RawValue, Result, TableSchema,
};
use tracing::{debug, trace};

struct WindowState {
    window: SourceWindow,
    schema: TableSchema,
    /// For each schema column, its index in the captured-column list
    projection: Vec<usize>,
    /// Before image waiting for its after image
    before: Option<ChangeTableRow>,
}

impl WindowState {
    fn new(window: SourceWindow, schema: TableSchema) -> Result<Self> {
        let captured = &window.source.captured_columns;
        let projection = schema
            .columns
            .iter()
            .map(|column| {
                captured
                    .iter()
                    .position(|name| *name == column.name)
                    .ok_or_else(|| {
                        CdcError::schema_mismatch(format!(
                            "Column '{}' of {} is not captured by {}",
                            column.name, schema.id, window.source.capture_instance
                        ))
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            window,
            schema,
            projection,
            before: None,
        })
    }

    /// Values in captured-column order → values in schema order
    fn project(&self, row: &ChangeTableRow) -> Result<Vec<Option<RawValue>>> {
        let captured = self.window.source.captured_columns.len();
        if row.values.len() != captured {
            return Err(CdcError::schema_mismatch(format!(
                "{} returned {} values for {} captured columns at {}",
                self.window.source.capture_instance,
                row.values.len(),
                captured,
                row.start_lsn
            )));
        }
        Ok(self
            .projection
            .iter()
            .map(|&i| row.values[i].clone())
            .collect())
    }
}

/// Ordered [`ChangeRecord`]s for one interval
pub struct ChangeStream {
    merge: MergeStream<ChangeTableRow>,
    states: Vec<WindowState>,
    superseded: u64,
}

impl ChangeStream {
    /// Open cursors for every window.
    ///
    /// Each window comes with the resolved schema of its table. Cursors are
    /// opened concurrently; a failure is reported against its window.
    pub async fn open<C>(conn: &C, windows: Vec<(SourceWindow, TableSchema)>) -> Result<Self>
    where
        C: SqlServerConnection + ?Sized,
    {
        let mut states = Vec::with_capacity(windows.len());
        for (window, schema) in windows {
            states.push(WindowState::new(window, schema)?);
        }

        let cursors = futures::future::try_join_all(states.iter().map(|state| async move {
            conn.changes(&state.window)
                .await
                .map_err(|e| CdcError::stream_read(state.window.label(), e.to_string()))
        }))
        .await?;

        let inputs = states
            .iter()
            .zip(cursors)
            .map(|(state, cursor)| MergeInput::new(state.window.label(), cursor))
            .collect();
        let merge = MergeStream::open(inputs).await?;

        debug!("Opened change stream over {} windows", states.len());
        Ok(Self {
            merge,
            states,
            superseded: 0,
        })
    }

    /// Rows dropped so far because a newer capture instance owns them
    pub fn superseded(&self) -> u64 {
        self.superseded
    }

    /// Next record in `(lsn, seqval, operation)` order
    pub async fn next(&mut self) -> Result<Option<ChangeRecord<Lsn>>> {
        loop {
            let Some((input, row)) = self.merge.next().await? else {
                self.check_no_pending_before()?;
                return Ok(None);
            };

            if !self.states[input].window.owns(&row.start_lsn) {
                trace!(
                    "Dropping {} from {}, superseded by a newer capture instance",
                    row.start_lsn,
                    self.merge.label(input)
                );
                self.superseded += 1;
                continue;
            }

            if let Some(record) = self.assemble(input, row)? {
                return Ok(Some(record));
            }
        }
    }

    fn assemble(&mut self, input: usize, row: ChangeTableRow) -> Result<Option<ChangeRecord<Lsn>>> {
        let label = self.merge.label(input).to_string();
        let Some(operation) = ChangeOperation::from_code(row.operation) else {
            return Err(CdcError::stream_read(
                label,
                format!("unknown __$operation {} at {}", row.operation, row.start_lsn),
            ));
        };

        if operation != ChangeOperation::UpdateAfter {
            if let Some(before) = &self.states[input].before {
                return Err(orphan_before(label, before));
            }
        }

        let state = &mut self.states[input];
        let (old, new) = match operation {
            ChangeOperation::UpdateBefore => {
                state.before = Some(row);
                return Ok(None);
            }
            ChangeOperation::Delete => (state.project(&row)?, Vec::new()),
            ChangeOperation::Insert => (Vec::new(), state.project(&row)?),
            ChangeOperation::UpdateAfter => {
                let new = state.project(&row)?;
                let old = match state.before.take() {
                    Some(before)
                        if before.start_lsn == row.start_lsn && before.seqval == row.seqval =>
                    {
                        state.project(&before)?
                    }
                    Some(before) => return Err(orphan_before(label, &before)),
                    None => {
                        trace!(
                            "After image at {} from {} has no before image",
                            row.start_lsn,
                            label
                        );
                        vec![None; state.schema.len()]
                    }
                };
                (old, new)
            }
        };

        Ok(Some(ChangeRecord {
            op: operation.op(),
            op_code: operation.code(),
            table: state.window.source.source_table.clone(),
            source: state.window.source.capture_instance.clone(),
            position: row.start_lsn,
            sequence: row.seqval,
            old,
            new,
        }))
    }

    fn check_no_pending_before(&self) -> Result<()> {
        for (input, state) in self.states.iter().enumerate() {
            if let Some(before) = &state.before {
                return Err(orphan_before(self.merge.label(input).to_string(), before));
            }
        }
        Ok(())
    }
}

fn orphan_before(label: String, before: &ChangeTableRow) -> CdcError {
    CdcError::stream_read(
        label,
        format!(
            "update before image at {}/{} has no after image",
            before.start_lsn, before.seqval
        ),
    )
}

