//! Tiberius-backed [`SqlServerConnection`]
//!
//! One TDS session shared behind a mutex. Result sets are read completely
//! before the session is released, so cursors handed to the merge are
//! in-memory. The exclusive table lock is an open transaction on the same
//! session; the snapshot read runs inside it.

use super::change_table::{ChangeTableRow, RawChangeTable, RawNewChangeTable, SnapshotRow};
use super::connection::SqlServerConnection;
use super::error::SqlServerError;
use super::planner::SourceWindow;
use super::source::{SqlServerCdc, SqlServerCdcConfig};
use super::Lsn;
use crate::common::{
    CdcError, Column, LogPosition, RawValue, Result, RowCursor, TableId, TableLockGuard,
    TableLocker, Validator, VecCursor,
};
use async_trait::async_trait;
use std::sync::Arc;
use tiberius::{AuthMethod, Client, Config, EncryptionLevel, Row, ToSql};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, info, trace, warn};

type TdsClient = Client<Compat<TcpStream>>;

/// Offset of the first captured column in `fn_cdc_get_all_changes_*` rows,
/// after `__$start_lsn`, `__$seqval`, `__$operation`, `__$update_mask`
const CHANGE_DATA_OFFSET: usize = 4;

/// SQL Server connection over TDS
pub struct TdsConnection {
    client: Arc<Mutex<TdsClient>>,
    database: String,
}

impl TdsConnection {
    /// Connect to SQL Server
    pub async fn connect(config: &SqlServerCdcConfig) -> Result<Self> {
        debug!("Connecting to {}", config.redacted_connection_string());

        let mut tiberius_config = Config::new();
        tiberius_config.host(&config.host);
        tiberius_config.port(config.port);
        tiberius_config.database(&config.database);
        tiberius_config.application_name(&config.application_name);

        if let Some(ref password) = config.password {
            tiberius_config.authentication(AuthMethod::sql_server(&config.username, password));
        } else {
            return Err(CdcError::config(
                "Password is required for SQL Server authentication",
            ));
        }

        if config.encrypt {
            tiberius_config.encryption(EncryptionLevel::Required);
            if config.trust_server_certificate {
                tiberius_config.trust_cert();
            }
        } else {
            tiberius_config.encryption(EncryptionLevel::NotSupported);
        }

        let tcp = TcpStream::connect(tiberius_config.get_addr())
            .await
            .map_err(|e| SqlServerError::Connection(e.to_string()))?;
        tcp.set_nodelay(true)
            .map_err(|e| SqlServerError::Connection(e.to_string()))?;

        let client = Client::connect(tiberius_config, tcp.compat_write())
            .await
            .map_err(|e| match e {
                tiberius::error::Error::Server(token) if token.code() == 18456 => {
                    SqlServerError::Authentication(token.message().to_string())
                }
                other => SqlServerError::Tds(other.to_string()),
            })?;

        info!(
            "Connected to SQL Server {}:{}/{}",
            config.host, config.port, config.database
        );

        let conn = Self {
            client: Arc::new(Mutex::new(client)),
            database: config.database.clone(),
        };
        conn.verify_cdc_enabled().await?;
        Ok(conn)
    }

    /// Connect, retrying retriable failures with the configured backoff
    pub async fn connect_with_retry(config: &SqlServerCdcConfig) -> Result<Self> {
        let mut backoff = config.backoff();
        loop {
            match Self::connect(config).await {
                Ok(conn) => return Ok(conn),
                Err(e) if e.is_retriable() => match backoff.next_backoff() {
                    Some(delay) => {
                        warn!(
                            "Connection attempt {} failed, retrying in {:?}: {}",
                            backoff.attempt(),
                            delay,
                            e
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(e),
                },
                Err(e) => return Err(e),
            }
        }
    }

    /// Verify that CDC is enabled on the database
    async fn verify_cdc_enabled(&self) -> Result<()> {
        let rows = self
            .query(
                "SELECT is_cdc_enabled FROM sys.databases WHERE name = @P1",
                &[&self.database.as_str()],
            )
            .await
            .map_err(discovery)?;

        let enabled = match rows.first() {
            Some(row) => row.try_get::<bool, _>(0).map_err(discovery)?,
            None => None,
        };
        if enabled != Some(true) {
            return Err(SqlServerError::CdcNotEnabled(self.database.clone()).into());
        }

        debug!("CDC is enabled on database '{}'", self.database);
        Ok(())
    }

    async fn query(
        &self,
        sql: &str,
        params: &[&dyn ToSql],
    ) -> std::result::Result<Vec<Row>, tiberius::error::Error> {
        let mut client = self.client.lock().await;
        client.query(sql, params).await?.into_first_result().await
    }

    async fn batch(&self, sql: &str) -> std::result::Result<Vec<Row>, tiberius::error::Error> {
        let mut client = self.client.lock().await;
        client.simple_query(sql).await?.into_first_result().await
    }

    async fn single_lsn(&self, sql: &str, params: &[&dyn ToSql]) -> Result<Lsn> {
        let rows = self.query(sql, params).await.map_err(discovery)?;
        match rows.first() {
            Some(row) => lsn_at(row, 0).map_err(|e| CdcError::discovery(e.to_string())),
            None => Ok(Lsn::NULL),
        }
    }
}

impl SqlServerCdc<TdsConnection> {
    /// Connect over TDS and create the source
    pub async fn connect(config: SqlServerCdcConfig) -> Result<Self> {
        let conn = TdsConnection::connect_with_retry(&config).await?;
        Ok(Self::new(config, conn))
    }
}

fn discovery(e: tiberius::error::Error) -> CdcError {
    CdcError::discovery(e.to_string())
}

fn bound(lsn: &Lsn) -> Result<&[u8]> {
    lsn.bytes()
        .map(|b| b.as_slice())
        .ok_or_else(|| CdcError::invalid_position("NULL LSN cannot bound a query"))
}

fn lsn_at(row: &Row, index: usize) -> Result<Lsn> {
    let bytes = row
        .try_get::<&[u8], _>(index)
        .map_err(|e| SqlServerError::InvalidLsn(e.to_string()))?;
    Lsn::from_bytes(bytes)
}

fn text_at(row: &Row, index: usize) -> Result<Option<String>> {
    Ok(row
        .try_get::<&str, _>(index)
        .map_err(|e| CdcError::discovery(e.to_string()))?
        .map(str::to_string))
}

fn bytes_at(row: &Row, index: usize) -> Result<Option<Vec<u8>>> {
    Ok(row
        .try_get::<&[u8], _>(index)
        .map_err(|e| CdcError::discovery(e.to_string()))?
        .map(<[u8]>::to_vec))
}

/// Column value as a [`RawValue`], trying types in order of likelihood
fn raw_value(row: &Row, index: usize) -> Option<RawValue> {
    if let Some(v) = row.try_get::<&str, _>(index).ok().flatten() {
        Some(RawValue::Text(v.to_string()))
    } else if let Some(v) = row.try_get::<i64, _>(index).ok().flatten() {
        Some(RawValue::Integer(v))
    } else if let Some(v) = row.try_get::<i32, _>(index).ok().flatten() {
        Some(RawValue::Integer(v.into()))
    } else if let Some(v) = row.try_get::<i16, _>(index).ok().flatten() {
        Some(RawValue::Integer(v.into()))
    } else if let Some(v) = row.try_get::<u8, _>(index).ok().flatten() {
        Some(RawValue::Integer(v.into()))
    } else if let Some(v) = row.try_get::<f64, _>(index).ok().flatten() {
        Some(RawValue::Float(v))
    } else if let Some(v) = row.try_get::<f32, _>(index).ok().flatten() {
        Some(RawValue::Float(v.into()))
    } else if let Some(v) = row.try_get::<bool, _>(index).ok().flatten() {
        Some(RawValue::Boolean(v))
    } else if let Some(v) = row
        .try_get::<tiberius::numeric::Numeric, _>(index)
        .ok()
        .flatten()
    {
        Some(RawValue::Text(v.to_string()))
    } else if let Some(v) = row.try_get::<&[u8], _>(index).ok().flatten() {
        Some(RawValue::Binary(v.to_vec()))
    } else if let Some(v) = row
        .try_get::<chrono::NaiveDateTime, _>(index)
        .ok()
        .flatten()
    {
        Some(RawValue::Timestamp(v))
    } else if let Some(v) = row
        .try_get::<chrono::DateTime<chrono::FixedOffset>, _>(index)
        .ok()
        .flatten()
    {
        Some(RawValue::Text(v.to_rfc3339()))
    } else if let Some(v) = row.try_get::<chrono::NaiveDate, _>(index).ok().flatten() {
        Some(RawValue::Text(v.format("%Y-%m-%d").to_string()))
    } else if let Some(v) = row.try_get::<chrono::NaiveTime, _>(index).ok().flatten() {
        Some(RawValue::Text(v.format("%H:%M:%S%.f").to_string()))
    } else {
        row.try_get::<uuid::Uuid, _>(index)
            .ok()
            .flatten()
            .map(|v| RawValue::Text(v.to_string()))
    }
}

#[async_trait]
impl TableLocker for TdsConnection {
    async fn lock_table(&self, table: &TableId) -> Result<Box<dyn TableLockGuard>> {
        Validator::validate_quoted_identifier(&table.schema)
            .and_then(|_| Validator::validate_quoted_identifier(&table.table))
            .map_err(|e| CdcError::config(e.to_string()))?;

        let mut client = self.client.lock().await;
        client
            .simple_query("BEGIN TRANSACTION")
            .await
            .map_err(|e| CdcError::other(e.to_string()))?
            .into_results()
            .await
            .map_err(|e| CdcError::other(e.to_string()))?;

        let sql = format!(
            "SELECT TOP 0 * FROM {} WITH (TABLOCKX, HOLDLOCK)",
            table.bracketed()
        );
        let locked = match client.simple_query(sql).await {
            Ok(stream) => stream.into_results().await.map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = locked {
            if let Ok(stream) = client.simple_query("ROLLBACK TRANSACTION").await {
                let _ = stream.into_results().await;
            }
            return Err(CdcError::other(format!("Failed to lock {}: {}", table, e)));
        }

        trace!("Locked {}", table);
        Ok(Box::new(TdsLockGuard {
            client: self.client.clone(),
        }))
    }
}

struct TdsLockGuard {
    client: Arc<Mutex<TdsClient>>,
}

#[async_trait]
impl TableLockGuard for TdsLockGuard {
    async fn release(self: Box<Self>) -> Result<()> {
        let mut client = self.client.lock().await;
        client
            .simple_query("COMMIT TRANSACTION")
            .await
            .map_err(|e| CdcError::other(e.to_string()))?
            .into_results()
            .await
            .map_err(|e| CdcError::other(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl SqlServerConnection for TdsConnection {
    fn database(&self) -> &str {
        &self.database
    }

    async fn list_change_tables(&self) -> Result<Vec<RawChangeTable>> {
        let rows = self
            .batch("EXEC sys.sp_cdc_help_change_data_capture")
            .await
            .map_err(discovery)?;

        rows.iter()
            .map(|row| {
                Ok(RawChangeTable {
                    schema: text_at(row, 0)?.unwrap_or_default(),
                    table: text_at(row, 1)?.unwrap_or_default(),
                    capture_instance: text_at(row, 2)?.unwrap_or_default(),
                    object_id: row
                        .try_get::<i32, _>(3)
                        .map_err(discovery)?
                        .unwrap_or_default(),
                    start_lsn: bytes_at(row, 5)?,
                    end_lsn: bytes_at(row, 6)?,
                    captured_column_list: text_at(row, 14)?,
                })
            })
            .collect()
    }

    async fn list_new_change_tables(
        &self,
        from: &Lsn,
        to: &Lsn,
    ) -> Result<Vec<RawNewChangeTable>> {
        let rows = self
            .query(
                "SELECT * FROM cdc.change_tables WHERE start_lsn BETWEEN @P1 AND @P2",
                &[&bound(from)?, &bound(to)?],
            )
            .await
            .map_err(discovery)?;

        rows.iter()
            .map(|row| {
                Ok(RawNewChangeTable {
                    object_id: row
                        .try_get::<i32, _>(0)
                        .map_err(discovery)?
                        .unwrap_or_default(),
                    capture_instance: text_at(row, 3)?.unwrap_or_default(),
                    start_lsn: bytes_at(row, 4)?,
                    end_lsn: bytes_at(row, 5)?,
                })
            })
            .collect()
    }

    async fn table_columns(&self, table: &TableId) -> Result<Vec<Column>> {
        let rows = self
            .query(
                "SELECT COLUMN_NAME, ORDINAL_POSITION, DATA_TYPE, IS_NULLABLE, COLUMN_DEFAULT \
                 FROM INFORMATION_SCHEMA.COLUMNS \
                 WHERE TABLE_SCHEMA = @P1 AND TABLE_NAME = @P2 \
                 ORDER BY ORDINAL_POSITION",
                &[&table.schema.as_str(), &table.table.as_str()],
            )
            .await
            .map_err(discovery)?;

        rows.iter()
            .map(|row| {
                let position = row
                    .try_get::<i32, _>(1)
                    .map_err(discovery)?
                    .unwrap_or_default();
                let mut column = Column::new(
                    text_at(row, 0)?.unwrap_or_default(),
                    u32::try_from(position).unwrap_or_default(),
                    text_at(row, 2)?.unwrap_or_default(),
                );
                if text_at(row, 3)?.as_deref() == Some("NO") {
                    column = column.not_null();
                }
                if let Some(default) = text_at(row, 4)? {
                    column = column.with_default(default);
                }
                Ok(column)
            })
            .collect()
    }

    async fn key_columns(&self, table: &TableId) -> Result<Vec<String>> {
        let rows = self
            .query(
                "SELECT c.name \
                 FROM sys.index_columns ic \
                 JOIN sys.columns c ON ic.object_id = c.object_id AND ic.column_id = c.column_id \
                 WHERE ic.object_id = OBJECT_ID(@P1) AND ic.index_id = ( \
                     SELECT TOP 1 i.index_id FROM sys.indexes i \
                     WHERE i.object_id = OBJECT_ID(@P1) AND (i.is_primary_key = 1 OR i.is_unique = 1) \
                     ORDER BY i.is_primary_key DESC, i.index_id) \
                 ORDER BY ic.key_ordinal",
                &[&table.bracketed().as_str()],
            )
            .await
            .map_err(discovery)?;

        let mut key = Vec::with_capacity(rows.len());
        for row in &rows {
            if let Some(name) = text_at(row, 0)? {
                key.push(name);
            }
        }
        Ok(key)
    }

    async fn min_lsn(&self, capture_instance: &str) -> Result<Lsn> {
        self.single_lsn(
            "SELECT sys.fn_cdc_get_min_lsn(@P1)",
            &[&capture_instance],
        )
        .await
    }

    async fn max_lsn(&self) -> Result<Lsn> {
        self.single_lsn("SELECT sys.fn_cdc_get_max_lsn()", &[]).await
    }

    async fn max_transaction_lsn(&self) -> Result<Lsn> {
        self.single_lsn(
            "SELECT MAX(start_lsn) FROM cdc.lsn_time_mapping WHERE tran_id <> 0x00",
            &[],
        )
        .await
    }

    async fn nth_transaction_lsn_from_last(&self, from: &Lsn, n: u32) -> Result<Lsn> {
        let n = i32::try_from(n).unwrap_or(i32::MAX - 1);
        self.single_lsn(
            "SELECT MAX(start_lsn) FROM ( \
                 SELECT TOP (@P1 + 1) start_lsn FROM cdc.lsn_time_mapping \
                 WHERE start_lsn >= @P2 AND tran_id <> 0x00 \
                 ORDER BY start_lsn) AS next_lsns",
            &[&n, &bound(from)?],
        )
        .await
    }

    async fn increment_lsn(&self, lsn: &Lsn) -> Result<Lsn> {
        self.single_lsn("SELECT sys.fn_cdc_increment_lsn(@P1)", &[&bound(lsn)?])
            .await
    }

    async fn changes(&self, window: &SourceWindow) -> Result<Box<dyn RowCursor<ChangeTableRow>>> {
        let label = window.label();
        let capture_instance = &window.source.capture_instance;
        Validator::validate_capture_instance(capture_instance)
            .map_err(|e| CdcError::config(e.to_string()))?;

        let sql = format!(
            "SELECT * FROM cdc.[fn_cdc_get_all_changes_{}](@P1, @P2, N'all update old') \
             ORDER BY [__$start_lsn] ASC, [__$seqval] ASC, [__$operation] ASC",
            capture_instance
        );
        let rows = self
            .query(&sql, &[&bound(&window.from)?, &bound(&window.to)?])
            .await
            .map_err(|e| CdcError::stream_read(&label, e.to_string()))?;

        let width = window.source.captured_columns.len();
        let mut changes = Vec::with_capacity(rows.len());
        for row in &rows {
            let operation = row
                .try_get::<i32, _>(2)
                .map_err(|e| CdcError::stream_read(&label, e.to_string()))?
                .unwrap_or_default();
            changes.push(ChangeTableRow {
                start_lsn: lsn_at(row, 0)?,
                seqval: lsn_at(row, 1)?,
                operation: u8::try_from(operation).unwrap_or(u8::MAX),
                update_mask: row
                    .try_get::<&[u8], _>(3)
                    .ok()
                    .flatten()
                    .map(<[u8]>::to_vec),
                values: (0..width)
                    .map(|i| raw_value(row, CHANGE_DATA_OFFSET + i))
                    .collect(),
            });
        }

        trace!("Got {} changes from {}", changes.len(), capture_instance);
        Ok(Box::new(VecCursor::new(changes)))
    }

    async fn snapshot_rows(
        &self,
        table: &TableId,
        columns: &[String],
    ) -> Result<Box<dyn RowCursor<SnapshotRow>>> {
        let column_list = columns
            .iter()
            .map(|c| format!("[{}]", c.replace(']', "]]")))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!("SELECT {} FROM {}", column_list, table.bracketed());

        let rows = self
            .query(&sql, &[])
            .await
            .map_err(|e| CdcError::stream_read(table.to_string(), e.to_string()))?;

        let snapshot = rows
            .iter()
            .map(|row| SnapshotRow {
                values: (0..columns.len()).map(|i| raw_value(row, i)).collect(),
            })
            .collect();
        Ok(Box::new(VecCursor::new(snapshot)))
    }
}
