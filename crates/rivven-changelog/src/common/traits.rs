//! Source and configuration traits

use crate::common::Result;
use async_trait::async_trait;

/// A running change capture source
///
/// `start` spawns the polling task; records are consumed through the
/// source's delivery receiver.
#[async_trait]
pub trait CdcSource: Send + Sync {
    /// Start capturing changes
    async fn start(&mut self) -> Result<()>;

    /// Stop capturing changes
    ///
    /// The polling task finishes the record in flight and exits; the
    /// committed offset stays at the last acknowledged record.
    async fn stop(&mut self) -> Result<()>;

    /// Whether the polling task is running
    async fn is_healthy(&self) -> bool;
}

/// Configuration trait for change capture sources
pub trait CdcConfig: Send + Sync {
    /// Backend name ("sqlserver", "oracle")
    fn source_type(&self) -> &'static str;

    /// Connection string with credentials redacted
    fn connection_string(&self) -> &str;

    fn validate(&self) -> Result<()>;
}
