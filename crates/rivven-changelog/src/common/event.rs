//! Change records and CDC events
//!
//! A [`ChangeRecord`] is one reconstructed row mutation as produced by the
//! merge stream or the redo parser: positional value arrays aligned to the
//! table's captured columns, tagged with the log position it came from.
//! A [`CdcEvent`] is the JSON form handed to downstream consumers.
//!
//! ## Transaction Metadata
//!
//! Events carry the originating position as transaction metadata so that
//! consumers can checkpoint precisely:
//!
//! ```ignore
//! let event = record.to_event("inventory", &schema, &normalizer, 0)?;
//! assert_eq!(event.transaction.unwrap().id, record.position.to_hex());
//! ```

use crate::common::{
    ChangeOffset, LogPosition, RawValue, Result, TableId, TableSchema, ValueNormalizer,
};
use serde_json::{Map, Value};

/// Transaction metadata for CDC events.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TransactionMetadata {
    /// Commit position (hex)
    pub id: String,
    /// Intra-position sequence (SQL Server seqval, Oracle redo sequence)
    pub lsn: String,
    /// Sequence number of this event within the interval
    pub sequence: u64,
    /// Total events in transaction (if known, 0 = unknown)
    pub total_events: u64,
    /// Transaction commit timestamp (Unix epoch millis)
    pub commit_ts: Option<i64>,
    /// Is this the last event in the transaction?
    pub is_last: bool,
}

impl TransactionMetadata {
    pub fn new(id: impl Into<String>, lsn: impl Into<String>, sequence: u64) -> Self {
        Self {
            id: id.into(),
            lsn: lsn.into(),
            sequence,
            total_events: 0,
            commit_ts: None,
            is_last: false,
        }
    }

    pub fn with_total(mut self, total: u64) -> Self {
        self.total_events = total;
        self
    }

    pub fn with_commit_ts(mut self, ts: i64) -> Self {
        self.commit_ts = Some(ts);
        self
    }

    pub fn with_last(mut self) -> Self {
        self.is_last = true;
        self
    }
}

/// Represents a change captured from a database
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CdcEvent {
    /// Backend: "sqlserver" or "oracle"
    pub source_type: String,
    pub database: String,
    pub schema: String,
    pub table: String,
    pub op: CdcOp,
    /// Previous row state (for UPDATE/DELETE)
    pub before: Option<Value>,
    /// Current row state (for INSERT/UPDATE/SNAPSHOT)
    pub after: Option<Value>,
    /// Event timestamp (Unix epoch seconds)
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction: Option<TransactionMetadata>,
}

/// CDC operation type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum CdcOp {
    /// Row inserted
    Insert,
    /// Row updated
    Update,
    /// Row deleted
    Delete,
    /// Snapshot read (initial bootstrap)
    Snapshot,
}

impl CdcEvent {
    /// Get the topic name for this event
    /// Format: cdc.{database}.{schema}.{table}
    pub fn topic_name(&self) -> String {
        format!("cdc.{}.{}.{}", self.database, self.schema, self.table)
    }

    /// Check if this is a data modification event (INSERT/UPDATE/DELETE)
    pub fn is_dml(&self) -> bool {
        matches!(self.op, CdcOp::Insert | CdcOp::Update | CdcOp::Delete)
    }

    pub fn txn_id(&self) -> Option<&str> {
        self.transaction.as_ref().map(|t| t.id.as_str())
    }
}

impl std::fmt::Display for CdcOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CdcOp::Insert => write!(f, "INSERT"),
            CdcOp::Update => write!(f, "UPDATE"),
            CdcOp::Delete => write!(f, "DELETE"),
            CdcOp::Snapshot => write!(f, "SNAPSHOT"),
        }
    }
}

/// One reconstructed row mutation.
///
/// `old` is empty for inserts and snapshot reads, `new` is empty for
/// deletes. For updates both have one slot per captured column. A `None`
/// slot means the value is unknown: not present in the statement, or an
/// explicit SQL NULL. The two are not distinguished.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRecord<P: LogPosition> {
    pub op: CdcOp,
    /// Backend operation code (SQL Server `__$operation`, Oracle `OPERATION_CODE`)
    pub op_code: u8,
    pub table: TableId,
    /// Capture instance or redo thread the record was read from
    pub source: String,
    pub position: P,
    pub sequence: P::Sequence,
    pub old: Vec<Option<RawValue>>,
    pub new: Vec<Option<RawValue>>,
}

impl<P: LogPosition> ChangeRecord<P> {
    /// Checkpoint offset of this record
    pub fn offset(&self) -> ChangeOffset<P> {
        ChangeOffset::new(self.position.clone(), self.sequence.clone(), self.op_code)
            .with_origin(self.origin())
    }

    /// `"<schema>.<table>:<source>"`, the merge label of the source that
    /// produced the record
    pub fn origin(&self) -> String {
        format!("{}:{}", self.table, self.source)
    }

    /// Build the JSON event using `schema` for column names and types.
    pub fn to_event(
        &self,
        database: &str,
        schema: &TableSchema,
        normalizer: &ValueNormalizer,
        serial: u64,
    ) -> Result<CdcEvent> {
        let before = row_object(&self.old, schema, normalizer)?;
        let after = row_object(&self.new, schema, normalizer)?;

        let txn = TransactionMetadata::new(self.position.to_hex(), self.sequence.to_string(), serial);

        Ok(CdcEvent {
            source_type: P::BACKEND.to_string(),
            database: database.to_string(),
            schema: self.table.schema.clone(),
            table: self.table.table.clone(),
            op: self.op,
            before,
            after,
            timestamp: chrono::Utc::now().timestamp(),
            transaction: Some(txn),
        })
    }
}

fn row_object(
    values: &[Option<RawValue>],
    schema: &TableSchema,
    normalizer: &ValueNormalizer,
) -> Result<Option<Value>> {
    if values.is_empty() {
        return Ok(None);
    }
    if values.len() != schema.len() {
        return Err(crate::common::CdcError::schema_mismatch(format!(
            "{} values for {} columns of {}",
            values.len(),
            schema.len(),
            schema.id
        )));
    }

    let mut data = Map::with_capacity(values.len());
    for (column, value) in schema.columns.iter().zip(values) {
        data.insert(column.name.clone(), normalizer.normalize(column, value.as_ref())?);
    }
    Ok(Some(Value::Object(data)))
}
