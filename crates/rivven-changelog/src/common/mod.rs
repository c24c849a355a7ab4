//! # Common change capture types
//!
//! Backend-agnostic building blocks shared by the SQL Server and Oracle
//! readers:
//!
//! - [`LogPosition`] - Ordered fixed-width log positions
//! - [`TableId`], [`TableSchema`] - Table identity and captured columns
//! - [`ChangeRecord`], [`CdcEvent`] - Reconstructed row mutations
//! - [`MergeStream`] - K-way merge of per-source cursors
//! - [`ValueNormalizer`] - Raw values and defaults to typed JSON
//! - [`ChangeOffset`], [`delivery_channel`] - Checkpoints and acknowledged delivery
//! - [`with_table_lock`] - Scoped exclusive table locks
//! - [`Validator`] - Names interpolated into SQL
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐    ┌───────────────┐    ┌───────────────┐
//! │ RowCursor ×N │───▶│  MergeStream  │───▶│ ChangeRecord  │
//! └──────────────┘    └───────────────┘    └───────┬───────┘
//!                                                  │
//!                     ┌───────────────┐            ▼
//!                     │ OffsetTracker │◀── ack ─ Delivery ──▶ sink
//!                     └───────────────┘
//! ```

mod backoff;
mod error;
mod event;
mod lock;
mod merge;
mod normalizer;
mod offset;
mod position;
mod schema;
mod traits;
mod validation;

pub use backoff::ExponentialBackoff;
pub use error::{CdcError, ErrorCategory, Result};
pub use event::{CdcEvent, CdcOp, ChangeRecord, TransactionMetadata};
pub use lock::{with_table_lock, TableLockGuard, TableLocker};
pub use merge::{MergeInput, MergeStream, RowCursor, SourceRow, VecCursor};
pub use normalizer::{unescape_quotes, ColumnKind, RawValue, ValueNormalizer};
pub use offset::{
    delivery_channel, Acknowledger, ChangeOffset, Delivery, DeliverySender, FileOffsetStore,
    MemoryOffsetStore, OffsetStore, OffsetTracker, ResumeFilter,
};
pub use position::LogPosition;
pub(crate) use position::fixed_width;
pub use schema::{Column, TableId, TableSchema};
pub use traits::{CdcConfig, CdcSource};
pub use validation::{Validator, MAX_STATEMENT_SIZE};
