//! Redo thread merge
//!
//! LogMiner returns one ordered result per redo thread (one per RAC
//! instance). [`RedoReader`] merges the threads by `(SCN, sequence,
//! operation)`, parses each row's `SQL_REDO` against the current table
//! schema and yields [`ChangeRecord`]s.

use super::dml_parser::{DmlOperation, LogMinerDmlParser};
use super::Scn;
use crate::common::{
    CdcError, ChangeRecord, MergeInput, MergeStream, Result, RowCursor, SourceRow, TableId,
    TableSchema,
};
use async_trait::async_trait;
use std::collections::HashMap;
use tracing::{debug, trace};

/// One row of `V$LOGMNR_CONTENTS`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedoRow {
    pub scn: Scn,
    /// Order of the row within its SCN
    pub sequence: u64,
    /// `OPERATION_CODE`: 1 insert, 2 delete, 3 update
    pub operation_code: u8,
    pub table: TableId,
    pub sql_redo: String,
}

impl SourceRow for RedoRow {
    /// The table orders rows of different threads that share an SCN,
    /// sequence and operation, as their change offsets do
    type Key = (Scn, u64, u8, TableId);

    fn order_key(&self) -> Self::Key {
        (self.scn, self.sequence, self.operation_code, self.table.clone())
    }
}

/// What the redo reader needs from an Oracle connection
#[async_trait]
pub trait LogMinerConnection: Send + Sync {
    /// Redo threads with log in the mined range
    async fn redo_threads(&self) -> Result<Vec<u16>>;

    async fn current_scn(&self) -> Result<Scn>;

    /// DML rows of `thread` with `from <= SCN <= to`, ordered by
    /// `(SCN, sequence, operation)`
    async fn mine(&self, thread: u16, from: &Scn, to: &Scn)
        -> Result<Box<dyn RowCursor<RedoRow>>>;

    async fn table_schema(&self, table: &TableId) -> Result<TableSchema>;
}

/// Ordered, parsed changes of all redo threads over `[from, to]`
pub struct RedoReader<'a, C: LogMinerConnection + ?Sized> {
    conn: &'a C,
    merge: MergeStream<RedoRow>,
    parser: LogMinerDmlParser,
    schemas: HashMap<TableId, TableSchema>,
    records: u64,
}

impl<'a, C: LogMinerConnection + ?Sized> RedoReader<'a, C> {
    pub async fn open(conn: &'a C, from: &Scn, to: &Scn) -> Result<Self> {
        if from > to {
            return Err(CdcError::invalid_position(format!(
                "Empty SCN range {}..{}",
                from, to
            )));
        }

        let mut threads = conn.redo_threads().await?;
        threads.sort_unstable();
        threads.dedup();

        let cursors = futures::future::try_join_all(threads.iter().map(|&thread| async move {
            conn.mine(thread, from, to)
                .await
                .map_err(|e| CdcError::stream_read(thread_label(thread), e.to_string()))
        }))
        .await?;

        let inputs = threads
            .iter()
            .zip(cursors)
            .map(|(&thread, cursor)| MergeInput::new(thread_label(thread), cursor))
            .collect();
        let merge = MergeStream::open(inputs).await?;

        debug!(
            "Mining SCN {}..{} across {} redo threads",
            from,
            to,
            threads.len()
        );
        Ok(Self {
            conn,
            merge,
            parser: LogMinerDmlParser::new(),
            schemas: HashMap::new(),
            records: 0,
        })
    }

    /// Records produced so far
    pub fn records(&self) -> u64 {
        self.records
    }

    /// Forget a cached table schema, e.g. after DDL
    pub fn invalidate_schema(&mut self, table: &TableId) {
        self.schemas.remove(table);
    }

    pub async fn next(&mut self) -> Result<Option<ChangeRecord<Scn>>> {
        let Some((input, row)) = self.merge.next().await? else {
            return Ok(None);
        };
        let label = self.merge.label(input).to_string();

        let Some(expected) = DmlOperation::from_code(row.operation_code) else {
            return Err(CdcError::stream_read(
                label,
                format!(
                    "unsupported OPERATION_CODE {} at SCN {}",
                    row.operation_code, row.scn
                ),
            ));
        };

        if !self.schemas.contains_key(&row.table) {
            let schema = self.conn.table_schema(&row.table).await?;
            self.schemas.insert(row.table.clone(), schema);
        }
        let Some(schema) = self.schemas.get(&row.table) else {
            return Err(CdcError::schema(format!("No schema for {}", row.table)));
        };

        let entry = self
            .parser
            .parse(&row.sql_redo, schema)
            .map_err(|e| e.at_position(row.scn))?;
        if entry.operation != expected {
            return Err(CdcError::stream_read(
                label,
                format!(
                    "SQL_REDO at SCN {} is {:?} but OPERATION_CODE is {}",
                    row.scn, entry.operation, row.operation_code
                ),
            ));
        }

        trace!("{:?} on {} at SCN {}", entry.operation, row.table, row.scn);
        self.records += 1;
        Ok(Some(ChangeRecord {
            op: entry.operation.op(),
            op_code: row.operation_code,
            table: row.table,
            source: label,
            position: row.scn,
            sequence: row.sequence,
            old: entry.old,
            new: entry.new,
        }))
    }
}

/// Zero-padded so labels sort by thread number
fn thread_label(thread: u16) -> String {
    format!("thread-{:05}", thread)
}
