//! # rivven-changelog - Change log positions and change reconstruction
//!
//! Turns a database's change log into an ordered, resumable stream of
//! row-level changes with before and after values.
//!
//! ## Features
//!
//! - `sqlserver` - SQL Server CDC change tables (windows, merge, update pairing)
//! - `oracle` - Oracle LogMiner (`SQL_REDO` parser, redo thread merge)
//! - `tds` - Tiberius-backed SQL Server connection (enables `sqlserver`)
//! - `full` - All of the above
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────┐          ┌────────────────┐
//! │  SQL Server    │          │    Oracle      │
//! │ change tables  │          │ V$LOGMNR_...   │
//! └───────┬────────┘          └───────┬────────┘
//!         │ RowCursor ×N              │ RowCursor ×threads
//!         ▼                           ▼
//! ┌──────────────────────────────────────────────┐
//! │        MergeStream (position, seq, op)       │
//! └──────────────────────────────────────────────┘
//!         │ update pairing            │ LogMinerDmlParser
//!         ▼                           ▼
//! ┌──────────────────────────────────────────────┐
//! │   ChangeRecord<Lsn>   /   ChangeRecord<Scn>  │
//! └──────────────────────────────────────────────┘
//!         │
//!         ▼
//!   DeliverySender ──▶ sink ── ack ──▶ committed ChangeOffset
//! ```
//!
//! ## Quick Start
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
//!     .build()?;
//!
//! let mut cdc = SqlServerCdc::connect(config).await?;
//! let mut rx = cdc.take_delivery_receiver().expect("receiver");
//! cdc.start().await?;
//!
//! while let Some(delivery) = rx.recv().await {
//!     println!("{:?}", delivery.ack());
//! }
//! # Ok(())
//! # }
//! ```

pub mod common;

pub use common::{
    CdcError, CdcEvent, CdcOp, CdcSource, ChangeOffset, ChangeRecord, Delivery, ErrorCategory,
    LogPosition, RawValue, Result, TableId, TableSchema, ValueNormalizer,
};

// SQL Server CDC - feature-gated
#[cfg(feature = "sqlserver")]
pub mod sqlserver;

// Oracle LogMiner - feature-gated
#[cfg(feature = "oracle")]
pub mod oracle;
