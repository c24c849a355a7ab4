//! SQL Server CDC error types

use crate::common::CdcError;
use thiserror::Error;

/// SQL Server-specific CDC errors
#[derive(Error, Debug)]
pub enum SqlServerError {
    /// TDS protocol error
    #[error("TDS protocol error: {0}")]
    Tds(String),

    /// Authentication failure
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// CDC not enabled on database
    #[error("CDC not enabled on database '{0}'. Run: EXEC sys.sp_cdc_enable_db")]
    CdcNotEnabled(String),

    /// Invalid LSN value returned by the server
    #[error("Invalid LSN: {0}")]
    InvalidLsn(String),
}

impl From<SqlServerError> for CdcError {
    fn from(err: SqlServerError) -> Self {
        match err {
            SqlServerError::Authentication(msg) => CdcError::ConnectionRefused(msg),
            SqlServerError::Connection(msg) => CdcError::ConnectionRefused(msg),
            SqlServerError::Tds(_) => CdcError::ConnectionClosed,
            SqlServerError::CdcNotEnabled(_) => CdcError::config(err.to_string()),
            SqlServerError::InvalidLsn(_) => CdcError::invalid_position(err.to_string()),
        }
    }
}
