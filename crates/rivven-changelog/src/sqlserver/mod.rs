//! # SQL Server CDC Source
//!
//! Reads the change tables maintained by the SQL Server Agent capture job
//! and turns them into one ordered stream of [`ChangeRecord`](crate::common::ChangeRecord)s.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐   ┌───────────────┐   ┌───────────────┐
//! │ ChangeTable      │──▶│ WindowPlanner │──▶│ SourceWindow  │ ×N
//! │ Registry         │   └───────────────┘   └───────┬───────┘
//! └──────────────────┘                               │
//!                                                    ▼
//!   fn_cdc_get_all_changes_<ci>(from, to) ×N ──▶ ChangeStream (merge)
//!                                                    │
//!                                                    ▼
//!                               DeliverySender ──▶ sink ── ack ──▶ OffsetTracker
//! ```
//!
//! Each polling interval `[from, to]` is bounded by the capture job's
//! maximum LSN and by a configurable number of transactions. A table being
//! migrated to a new capture instance is read from both instances for the
//! overlap; the second copy of each change is dropped.
//!
//! ## CDC Table Structure
//!
//! | Column | Type | Description |
//! |--------|------|-------------|
//! | `__$start_lsn` | `binary(10)` | Commit LSN of the transaction |
//! | `__$seqval` | `binary(10)` | Sequence within transaction |
//! | `__$operation` | `int` | 1=Delete, 2=Insert, 3=Update(before), 4=Update(after) |
//! | `__$update_mask` | `varbinary` | Bitmask of updated columns |
//! | `<columns>` | varies | Captured table columns |
//!
//! ## Offsets
//!
//! A change is addressed by `(commit LSN, seqval, operation)`, persisted as
//! `HEX:HEX:OP`. On restart every change up to and including the committed
//! offset is skipped.
//!
//! ## Example
//!
//! ```rust,no_run
//! # #[cfg(feature = "tds")]
//! # async fn example() -> anyhow::Result<()> {
//! use rivven_changelog::sqlserver::{SqlServerCdc, SqlServerCdcConfig};
//! use rivven_changelog::CdcSource;
//!
//! let config = SqlServerCdcConfig::builder()
//!     .host("localhost")
//!     .username("sa")
//!     .password("password")
//!     .database("mydb")
//!     .include_table("dbo", "users")
//!     .build()?;
//!
//! let mut cdc = SqlServerCdc::connect(config).await?;
//! let mut rx = cdc.take_delivery_receiver().expect("receiver");
//!
//! cdc.start().await?;
//!
//! while let Some(delivery) = rx.recv().await {
//!     println!("Change: {:?}", delivery.record());
//!     delivery.ack();
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## SQL Server Requirements
//!
//! 1. **Enable CDC on database**: `EXEC sys.sp_cdc_enable_db;`
//! 2. **Enable CDC on tables**:
//!    ```sql
//!    EXEC sys.sp_cdc_enable_table
//!        @source_schema = N'dbo',
//!        @source_name = N'users',
//!        @role_name = NULL;
//!    ```
//! 3. **SQL Server Agent must be running** (populates the change tables)

mod change_table;
mod connection;
mod error;
mod lsn;
mod planner;
mod registry;
mod snapshot;
mod source;
mod stream;
#[cfg(feature = "tds")]
mod tds;

pub use change_table::{
    parse_captured_columns, ChangeOperation, ChangeTable, ChangeTableRow, RawChangeTable,
    RawNewChangeTable, SnapshotRow,
};
pub use connection::SqlServerConnection;
pub use error::SqlServerError;
pub use lsn::Lsn;
pub use planner::{SourceWindow, WindowPlanner};
pub use registry::{ChangeTableRegistry, RegistryDiff, RegistrySnapshot, TableFilter};
pub use snapshot::{
    SnapshotMode, SnapshotState, SqlServerSnapshotExecutor, TableSnapshotProgress,
};
pub use source::{
    IntervalStats, SqlServerCdc, SqlServerCdcConfig, SqlServerCdcConfigBuilder, SqlServerStreamer,
    StartPosition,
};
pub use stream::ChangeStream;
#[cfg(feature = "tds")]
pub use tds::TdsConnection;
