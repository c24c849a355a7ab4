//! Test harness for changelog integration tests
//!
//! Tests run against in-memory collaborators instead of live databases:
//! [`MockSqlServer`] stands in for a CDC-enabled SQL Server database.

#![allow(dead_code)]

#[cfg(feature = "sqlserver")]
pub mod sqlserver;

use std::sync::Once;

static INIT: Once = Once::new();

/// Initialize test logging (idempotent)
pub fn init_test_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive("rivven_changelog=debug".parse().unwrap()),
            )
            .with_test_writer()
            .try_init()
            .ok();
    });
}
