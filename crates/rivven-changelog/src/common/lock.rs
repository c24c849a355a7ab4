//! Scoped exclusive table locks
//!
//! The initial bootstrap read of a table runs under an exclusive lock so the
//! snapshot and the change stream agree on one cut. The lock is held for the
//! duration of one read and released on every exit path, including failure.

use crate::common::{CdcError, Result, TableId};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// A held exclusive lock
#[async_trait]
pub trait TableLockGuard: Send {
    async fn release(self: Box<Self>) -> Result<()>;
}

/// Acquires exclusive table locks
#[async_trait]
pub trait TableLocker: Send + Sync {
    async fn lock_table(&self, table: &TableId) -> Result<Box<dyn TableLockGuard>>;
}

/// Run `body` while holding an exclusive lock on `table`.
///
/// Acquisition is bounded by `timeout` (`LockTimeout` on expiry). The lock
/// is released whether `body` succeeds or fails; a body error takes
/// precedence over a release error.
pub async fn with_table_lock<L, F, Fut, T>(
    locker: &L,
    table: &TableId,
    timeout: Duration,
    body: F,
) -> Result<T>
where
    L: TableLocker + ?Sized,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let guard = match tokio::time::timeout(timeout, locker.lock_table(table)).await {
        Ok(guard) => guard?,
        Err(_) => return Err(CdcError::lock_timeout(table.to_string(), timeout)),
    };
    debug!("Acquired exclusive lock on {}", table);

    let result = body().await;
    let released = guard.release().await;

    match (result, released) {
        (Ok(value), Ok(())) => {
            debug!("Released exclusive lock on {}", table);
            Ok(value)
        }
        (Ok(_), Err(e)) => Err(e),
        (Err(e), released) => {
            if let Err(release_err) = released {
                warn!("Failed to release lock on {}: {}", table, release_err);
            }
            Err(e)
        }
    }
}
