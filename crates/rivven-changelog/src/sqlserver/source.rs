//! SQL Server CDC source implementation
//!
//! Captures changes by polling change tables interval by interval:
//!
//! 1. pick the interval end (`max_lsn`, or the start LSN of the n-th
//!    transaction ahead when `max_transactions_per_iteration` is set);
//! 2. reconcile the capture instance listing with the previous cycle; the
//!    full listing is reloaded only when a capture instance starts inside
//!    the interval or the previous interval failed;
//! 3. plan one window per capture instance and merge them;
//! 4. deliver records one at a time, committing each acknowledged offset;
//! 5. continue from `fn_cdc_increment_lsn(end)`.
//!
//! Any error aborts the interval. Retriable errors restart it from the same
//! start after a backoff; records up to the committed offset are skipped on
//! replay.

use super::change_table::ChangeTable;
use super::connection::SqlServerConnection;
use super::planner::WindowPlanner;
use super::registry::{ChangeTableRegistry, RegistryDiff, RegistrySnapshot, TableFilter};
use super::snapshot::{SnapshotMode, SnapshotState, SqlServerSnapshotExecutor};
use super::stream::ChangeStream;
use super::Lsn;
use crate::common::{
    delivery_channel, CdcConfig, CdcError, CdcSource, ChangeOffset, Delivery,
    DeliverySender, ExponentialBackoff, LogPosition, OffsetStore, OffsetTracker, Result,
    ResumeFilter, TableSchema,
};
use async_trait::async_trait;
use std::cmp::min;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// SQL Server CDC configuration
///
/// # Security Note
///
/// This struct implements a custom Debug that redacts the password field
/// to prevent accidental leakage to logs.
///
/// # Example
///
/// ```rust
/// use rivven_changelog::sqlserver::SqlServerCdcConfig;
///
/// let config = SqlServerCdcConfig::builder()
///     .host("localhost")
///     .port(1433)
///     .username("sa")
///     .password("YourPassword123!")
///     .database("mydb")
///     .poll_interval_ms(500)
///     .include_table("dbo", "users")
///     .build()
///     .unwrap();
/// assert!(!format!("{:?}", config).contains("YourPassword123!"));
/// ```
#[derive(Clone)]
pub struct SqlServerCdcConfig {
    /// SQL Server host
    pub host: String,
    /// SQL Server port (default: 1433)
    pub port: u16,
    /// Username for authentication
    pub username: String,
    /// Password for authentication
    pub password: Option<String>,
    /// Database name (required for CDC)
    pub database: String,
    /// Application name for connection identification
    pub application_name: String,
    /// Poll interval in milliseconds (default: 500ms)
    pub poll_interval_ms: u64,
    /// Tables to include (schema, table pairs; empty = all CDC-enabled tables)
    pub include_tables: Vec<(String, String)>,
    /// Tables to exclude
    pub exclude_tables: Vec<(String, String)>,
    /// Starting offset (`<lsn-hex>:<seqval-hex>:<op>` or a bare LSN hex;
    /// empty = use the offset store or start from the current position)
    pub start_lsn: String,
    /// Transactions per interval (0 = everything up to the max LSN)
    pub max_transactions_per_iteration: u32,
    /// Delivery channel buffer (default: 16)
    pub buffer_size: usize,
    /// Connection timeout in seconds (default: 30)
    pub connect_timeout_secs: u64,
    /// Whether to trust server certificate (for self-signed certs)
    pub trust_server_certificate: bool,
    /// Whether to enable encryption
    pub encrypt: bool,
    /// Snapshot mode (Initial, Never)
    pub snapshot_mode: SnapshotMode,
    /// Exclusive lock acquisition timeout for snapshots (default: 10s)
    pub lock_timeout_ms: u64,
    /// First retry delay after a retriable failure (default: 500ms)
    pub retry_initial_ms: u64,
    /// Retry delay cap (default: 30s)
    pub retry_max_ms: u64,
    /// Consecutive retriable failures tolerated (0 = unlimited)
    pub max_retries: u32,
    /// Key under which committed offsets are stored
    pub offset_key: String,
    /// Where snapshot progress is persisted
    pub snapshot_state_path: Option<PathBuf>,
    /// Cached redacted connection string for trait compliance
    redacted_conn_str: String,
}

impl std::fmt::Debug for SqlServerCdcConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlServerCdcConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("database", &self.database)
            .field("application_name", &self.application_name)
            .field("poll_interval_ms", &self.poll_interval_ms)
            .field("include_tables", &self.include_tables)
            .field("exclude_tables", &self.exclude_tables)
            .field("start_lsn", &self.start_lsn)
            .field(
                "max_transactions_per_iteration",
                &self.max_transactions_per_iteration,
            )
            .field("buffer_size", &self.buffer_size)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("trust_server_certificate", &self.trust_server_certificate)
            .field("encrypt", &self.encrypt)
            .field("snapshot_mode", &self.snapshot_mode)
            .field("lock_timeout_ms", &self.lock_timeout_ms)
            .field("retry_initial_ms", &self.retry_initial_ms)
            .field("retry_max_ms", &self.retry_max_ms)
            .field("max_retries", &self.max_retries)
            .field("offset_key", &self.offset_key)
            .field("snapshot_state_path", &self.snapshot_state_path)
            .field("redacted_conn_str", &self.redacted_conn_str)
            .finish()
    }
}

impl Default for SqlServerCdcConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1433,
            username: String::new(),
            password: None,
            database: String::new(),
            application_name: "rivven-changelog".to_string(),
            poll_interval_ms: 500,
            include_tables: Vec::new(),
            exclude_tables: Vec::new(),
            start_lsn: String::new(),
            max_transactions_per_iteration: 500,
            buffer_size: 16,
            connect_timeout_secs: 30,
            trust_server_certificate: false,
            encrypt: true,
            snapshot_mode: SnapshotMode::Initial,
            lock_timeout_ms: 10_000,
            retry_initial_ms: 500,
            retry_max_ms: 30_000,
            max_retries: 10,
            offset_key: "rivven-changelog".to_string(),
            snapshot_state_path: None,
            redacted_conn_str: String::new(),
        }
    }
}

impl SqlServerCdcConfig {
    /// Create a new builder for SqlServerCdcConfig
    pub fn builder() -> SqlServerCdcConfigBuilder {
        SqlServerCdcConfigBuilder::default()
    }

    /// Build ADO.NET style connection string for Tiberius
    pub fn connection_string(&self) -> String {
        let mut parts = vec![
            format!("Server={},{}", self.host, self.port),
            format!("Database={}", self.database),
            format!("User Id={}", self.username),
        ];

        if let Some(ref pwd) = self.password {
            parts.push(format!("Password={}", pwd));
        }

        parts.push(format!("Application Name={}", self.application_name));
        let timeout_secs = i32::try_from(self.connect_timeout_secs).unwrap_or(i32::MAX);
        parts.push(format!("Connect Timeout={}", timeout_secs));

        if self.trust_server_certificate {
            parts.push("TrustServerCertificate=true".to_string());
        }

        if self.encrypt {
            parts.push("Encrypt=true".to_string());
        } else {
            parts.push("Encrypt=false".to_string());
        }

        parts.join(";")
    }

    /// Redact password from connection string for logging
    pub fn redacted_connection_string(&self) -> String {
        let conn_str = self.connection_string();
        if let Some(start) = conn_str.find("Password=") {
            if let Some(end) = conn_str[start..].find(';') {
                let before = &conn_str[..start];
                let after = &conn_str[start + end..];
                return format!("{}Password=[REDACTED]{}", before, after);
            } else {
                return format!("{}Password=[REDACTED]", &conn_str[..start]);
            }
        }
        conn_str
    }

    /// Include/exclude rules as a [`TableFilter`]
    pub fn table_filter(&self) -> TableFilter {
        TableFilter::new(self.include_tables.clone(), self.exclude_tables.clone())
    }

    /// Configured start offset, if any.
    ///
    /// Accepts a full offset or a bare LSN; a bare LSN starts the interval
    /// at that LSN with nothing skipped.
    pub fn start_offset(&self) -> Result<Option<StartPosition>> {
        let text = self.start_lsn.trim();
        if text.is_empty() {
            return Ok(None);
        }
        if text.contains(':') {
            return Ok(Some(StartPosition::Offset(ChangeOffset::parse(text)?)));
        }
        let lsn = Lsn::from_hex(text)?;
        if lsn.is_null() {
            return Err(CdcError::config("Start LSN cannot be NULL"));
        }
        Ok(Some(StartPosition::Lsn(lsn)))
    }

    pub(crate) fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(
            Duration::from_millis(self.retry_initial_ms),
            Duration::from_millis(self.retry_max_ms),
        )
        .with_max_attempts(self.max_retries)
    }
}

impl CdcConfig for SqlServerCdcConfig {
    fn source_type(&self) -> &'static str {
        "sqlserver"
    }

    fn connection_string(&self) -> &str {
        &self.redacted_conn_str
    }

    fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(CdcError::config("Host is required"));
        }
        if self.username.is_empty() {
            return Err(CdcError::config("Username is required"));
        }
        if self.database.is_empty() {
            return Err(CdcError::config("Database is required"));
        }
        if self.poll_interval_ms == 0 {
            return Err(CdcError::config("Poll interval must be > 0"));
        }
        if self.poll_interval_ms < 50 {
            return Err(CdcError::config(
                "Poll interval must be >= 50ms to avoid excessive load",
            ));
        }
        if self.lock_timeout_ms == 0 {
            return Err(CdcError::config("Lock timeout must be > 0"));
        }
        if self.retry_initial_ms > self.retry_max_ms {
            return Err(CdcError::config(
                "Initial retry delay must not exceed the maximum delay",
            ));
        }
        if self.offset_key.is_empty() {
            return Err(CdcError::config("Offset key is required"));
        }
        self.start_offset()
            .map_err(|e| CdcError::config(format!("Invalid start LSN: {}", e)))?;
        Ok(())
    }
}

/// Builder for SqlServerCdcConfig
#[derive(Default)]
pub struct SqlServerCdcConfigBuilder {
    config: SqlServerCdcConfig,
}

impl SqlServerCdcConfigBuilder {
    /// Set the SQL Server host
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    /// Set the SQL Server port (default: 1433)
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Set the username for authentication
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.config.username = username.into();
        self
    }

    /// Set the password for authentication
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.config.password = Some(password.into());
        self
    }

    /// Set the database name
    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.config.database = database.into();
        self
    }

    /// Set the application name for connection identification
    pub fn application_name(mut self, name: impl Into<String>) -> Self {
        self.config.application_name = name.into();
        self
    }

    /// Set the poll interval in milliseconds (default: 500ms)
    ///
    /// Lower values = lower latency but higher database load.
    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.poll_interval_ms = ms;
        self
    }

    /// Include a table for CDC capture
    ///
    /// If no tables are included, all CDC-enabled tables will be captured.
    pub fn include_table(mut self, schema: impl Into<String>, table: impl Into<String>) -> Self {
        self.config
            .include_tables
            .push((schema.into(), table.into()));
        self
    }

    /// Exclude a table from CDC capture
    pub fn exclude_table(mut self, schema: impl Into<String>, table: impl Into<String>) -> Self {
        self.config
            .exclude_tables
            .push((schema.into(), table.into()));
        self
    }

    /// Set the starting offset or LSN (hex)
    pub fn start_lsn(mut self, lsn: impl Into<String>) -> Self {
        self.config.start_lsn = lsn.into();
        self
    }

    /// Cap each interval at `n` transactions (0 = no cap, default: 500)
    pub fn max_transactions_per_iteration(mut self, n: u32) -> Self {
        self.config.max_transactions_per_iteration = n;
        self
    }

    /// Set the delivery buffer size (default: 16)
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.config.buffer_size = size;
        self
    }

    /// Set connection timeout in seconds (default: 30)
    pub fn connect_timeout_secs(mut self, secs: u64) -> Self {
        self.config.connect_timeout_secs = secs;
        self
    }

    /// Trust server certificate (for self-signed certs)
    ///
    /// **Security warning**: Only use in development/testing.
    pub fn trust_server_certificate(mut self, trust: bool) -> Self {
        self.config.trust_server_certificate = trust;
        self
    }

    /// Enable/disable encryption (default: true)
    pub fn encrypt(mut self, encrypt: bool) -> Self {
        self.config.encrypt = encrypt;
        self
    }

    /// Set snapshot mode
    ///
    /// - `Initial`: snapshot when no offset exists, then stream changes
    /// - `Never`: stream changes only
    pub fn snapshot_mode(mut self, mode: SnapshotMode) -> Self {
        self.config.snapshot_mode = mode;
        self
    }

    /// Set the exclusive lock timeout for snapshots
    pub fn lock_timeout_ms(mut self, ms: u64) -> Self {
        self.config.lock_timeout_ms = ms;
        self
    }

    /// Set the retry backoff bounds
    pub fn retry_backoff_ms(mut self, initial: u64, max: u64) -> Self {
        self.config.retry_initial_ms = initial;
        self.config.retry_max_ms = max;
        self
    }

    /// Set the number of consecutive retries (0 = unlimited)
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config.max_retries = retries;
        self
    }

    /// Set the offset store key
    pub fn offset_key(mut self, key: impl Into<String>) -> Self {
        self.config.offset_key = key.into();
        self
    }

    /// Persist snapshot progress to `path`
    pub fn snapshot_state_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.snapshot_state_path = Some(path.into());
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<SqlServerCdcConfig> {
        let mut config = self.config;
        config.validate()?;
        config.redacted_conn_str = config.redacted_connection_string();
        Ok(config)
    }
}

/// Where streaming starts when no offset is stored
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartPosition {
    /// Replay from the offset's LSN, skipping records up to the offset
    Offset(ChangeOffset<Lsn>),
    /// Start at this LSN
    Lsn(Lsn),
}

// ============================================================================
// Interval streaming
// ============================================================================

/// Outcome of one polling interval
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntervalStats {
    pub from: Lsn,
    pub to: Lsn,
    /// Windows queried
    pub windows: usize,
    pub delivered: u64,
    /// Replayed records at or before the committed offset
    pub skipped: u64,
    /// Interval reached the server's max LSN
    pub caught_up: bool,
}

/// Drives intervals against one connection.
///
/// Single-flight: one streamer owns the position and registry state of a
/// connector. [`SqlServerCdc`] runs one in a background task.
pub struct SqlServerStreamer<C: SqlServerConnection + ?Sized> {
    conn: Arc<C>,
    filter: TableFilter,
    max_transactions: u32,
    sender: DeliverySender<Lsn>,
    tracker: OffsetTracker<Lsn>,
    registry: RegistrySnapshot,
    /// Reload the full capture instance listing next interval
    registry_stale: bool,
    /// Start of the last completed interval
    last_from: Lsn,
    next_from: Lsn,
    offset_store: Option<Arc<dyn OffsetStore<Lsn>>>,
    offset_key: String,
    active: Arc<AtomicBool>,
}

impl<C: SqlServerConnection + ?Sized> SqlServerStreamer<C> {
    pub fn new(conn: Arc<C>, config: &SqlServerCdcConfig, sender: DeliverySender<Lsn>) -> Self {
        Self {
            conn,
            filter: config.table_filter(),
            max_transactions: config.max_transactions_per_iteration,
            sender,
            tracker: OffsetTracker::default(),
            registry: RegistrySnapshot::default(),
            registry_stale: true,
            last_from: Lsn::NULL,
            next_from: Lsn::NULL,
            offset_store: None,
            offset_key: config.offset_key.clone(),
            active: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn with_offset_store(mut self, store: Arc<dyn OffsetStore<Lsn>>) -> Self {
        self.offset_store = Some(store);
        self
    }

    /// Share the running flag; intervals stop at the next record boundary
    /// once it is cleared.
    pub fn with_active_flag(mut self, active: Arc<AtomicBool>) -> Self {
        self.active = active;
        self
    }

    /// Start of the next interval
    pub fn next_from(&self) -> Lsn {
        self.next_from
    }

    pub fn committed(&self) -> Option<&ChangeOffset<Lsn>> {
        self.tracker.committed()
    }

    pub fn registry(&self) -> &RegistrySnapshot {
        &self.registry
    }

    /// Resume from `offset`: its interval is replayed up to the offset.
    pub fn resume_from(&mut self, offset: ChangeOffset<Lsn>) {
        info!("Resuming after committed offset {}", offset);
        self.next_from = offset.position;
        self.tracker = OffsetTracker::new(Some(offset));
    }

    /// Start the next interval at `lsn`
    pub fn start_at(&mut self, lsn: Lsn) {
        self.next_from = lsn;
    }

    /// Establish the start position.
    ///
    /// Order: stored offset, configured start, snapshot (mode `Initial`),
    /// otherwise the LSN after the current max.
    pub async fn initialize(&mut self, config: &SqlServerCdcConfig) -> Result<()> {
        if let Some(store) = &self.offset_store {
            if let Some(offset) = store.load(&self.offset_key).await? {
                self.resume_from(offset);
                return Ok(());
            }
        }

        match config.start_offset()? {
            Some(StartPosition::Offset(offset)) => {
                self.resume_from(offset);
                return Ok(());
            }
            Some(StartPosition::Lsn(lsn)) => {
                info!("Starting at configured LSN {}", lsn);
                self.start_at(lsn);
                return Ok(());
            }
            None => {}
        }

        let max = self.conn.max_lsn().await?;
        let watermark = match config.snapshot_mode {
            SnapshotMode::Initial => self.snapshot(config, max).await?,
            SnapshotMode::Never => max,
        };

        if watermark.is_null() {
            info!("No changes captured yet, starting at the first available LSN");
            self.start_at(Lsn::NULL);
        } else {
            let from = self.increment(&watermark).await?;
            info!("Starting after LSN {} at {}", watermark, from);
            self.start_at(from);
        }
        Ok(())
    }

    async fn snapshot(&mut self, config: &SqlServerCdcConfig, max: Lsn) -> Result<Lsn> {
        let mut state = match &config.snapshot_state_path {
            Some(path) => SnapshotState::load(path).await?,
            None => None,
        }
        .unwrap_or_else(|| SnapshotState::new(self.conn.database(), &max));
        let watermark = state.watermark()?;

        let registry = ChangeTableRegistry::new(self.conn.as_ref(), &self.filter);
        let sources = registry.list_sources().await?;

        // one schema per table, taken from its newest active capture instance
        let mut newest: BTreeMap<_, &ChangeTable> = BTreeMap::new();
        for source in sources.iter().filter(|s| !s.is_retired()) {
            newest
                .entry(source.source_table.clone())
                .and_modify(|current: &mut &ChangeTable| {
                    if source.start_lsn > current.start_lsn {
                        *current = source;
                    }
                })
                .or_insert(source);
        }
        let mut tables: Vec<TableSchema> = Vec::with_capacity(newest.len());
        for source in newest.values() {
            tables.push(registry.resolve_table_schema(source).await?);
        }

        SqlServerSnapshotExecutor::new(
            self.conn.as_ref(),
            &self.sender,
            Duration::from_millis(config.lock_timeout_ms),
        )
        .execute(&tables, &mut state, config.snapshot_state_path.as_deref())
        .await?;

        Ok(watermark)
    }

    /// `fn_cdc_increment_lsn`, checked to move strictly forward
    async fn increment(&self, lsn: &Lsn) -> Result<Lsn> {
        let next = self.conn.increment_lsn(lsn).await?;
        if next <= *lsn {
            return Err(CdcError::invalid_position(format!(
                "fn_cdc_increment_lsn({}) returned {}",
                lsn, next
            )));
        }
        Ok(next)
    }

    /// End of the interval starting at `from`
    async fn interval_end(&self, from: &Lsn, max: Lsn) -> Result<Lsn> {
        if self.max_transactions == 0 || from.is_null() {
            return Ok(max);
        }
        let nth = self
            .conn
            .nth_transaction_lsn_from_last(from, self.max_transactions)
            .await?;
        if nth.is_null() || nth > max {
            Ok(max)
        } else {
            Ok(nth)
        }
    }

    /// Capture instances for an interval ending at `to`.
    ///
    /// New instances are looked for from the start of the last completed
    /// interval, so one created while that interval ran is not missed.
    async fn reconcile_registry(
        &self,
        registry: &ChangeTableRegistry<'_, C>,
        to: &Lsn,
    ) -> Result<RegistryDiff> {
        let latest = if self.registry_stale || self.registry.is_empty() || self.last_from.is_null()
        {
            registry.list_sources().await?
        } else {
            let found = registry.list_new_sources(&self.last_from, to).await?;
            if found
                .iter()
                .all(|table| self.registry.get(&table.capture_instance).is_some())
            {
                return Ok(self.registry.reconcile(self.registry.sources().cloned().collect()));
            }
            self.registry.sources().cloned().chain(found).collect()
        };
        Ok(self.registry.reconcile(latest))
    }

    /// Run one interval.
    ///
    /// `Ok(None)` when the server has nothing past the current start, or
    /// when the log only advanced through records without a transaction
    /// (agent and checkpoint activity).
    pub async fn poll_once(&mut self) -> Result<Option<IntervalStats>> {
        let from = self.next_from;
        let max = self.conn.max_lsn().await?;
        if max.is_null() || max < from {
            trace!("No changes at or after {}", from);
            return Ok(None);
        }
        let last_transaction = self.conn.max_transaction_lsn().await?;
        if last_transaction.is_null() || last_transaction < from {
            trace!(
                "No transaction at or after {} (max LSN {})",
                from,
                max
            );
            return Ok(None);
        }
        let max = min(max, last_transaction);
        let to = self.interval_end(&from, max).await?;

        let registry = ChangeTableRegistry::new(self.conn.as_ref(), &self.filter);
        let diff = self.reconcile_registry(&registry, &to).await?;
        for table in &diff.added {
            info!("Capture instance {} registered", table);
        }
        for table in &diff.retired {
            info!("Capture instance {} retired", table);
        }

        let active: Vec<ChangeTable> = diff.snapshot.sources().cloned().collect();
        // cleared once the interval completes
        self.registry_stale = true;

        let windows = WindowPlanner::plan(self.conn.as_ref(), &active, &from, &to).await?;
        let mut planned = Vec::with_capacity(windows.len());
        for window in windows {
            let schema = registry.resolve_table_schema(&window.source).await?;
            planned.push((window, schema));
        }
        let window_count = planned.len();

        let mut stream = ChangeStream::open(self.conn.as_ref(), planned).await?;
        let mut resume = ResumeFilter::new(self.tracker.committed().cloned());
        let mut delivered = 0u64;

        while let Some(record) = stream.next().await? {
            let offset = record.offset();
            if resume.should_skip(&offset) {
                continue;
            }
            if !self.active.load(Ordering::SeqCst) {
                info!("Stopping interval [{}, {}] before {}", from, to, offset);
                self.registry = diff.snapshot;
                self.registry_stale = false;
                return Ok(Some(IntervalStats {
                    from,
                    to,
                    windows: window_count,
                    delivered,
                    skipped: resume.skipped(),
                    caught_up: false,
                }));
            }

            self.sender.deliver(record).await?;
            self.tracker.commit(offset.clone())?;
            if let Some(store) = &self.offset_store {
                store.save(&self.offset_key, &offset).await?;
            }
            delivered += 1;
        }

        self.registry = diff.snapshot;
        self.registry_stale = false;
        self.last_from = from;
        self.next_from = self.increment(&to).await?;

        Ok(Some(IntervalStats {
            from,
            to,
            windows: window_count,
            delivered,
            skipped: resume.skipped(),
            caught_up: to == max,
        }))
    }
}

// ============================================================================
// Source
// ============================================================================

/// SQL Server CDC source
///
/// Captures changes from SQL Server using poll-based CDC table queries.
///
/// ```rust,ignore
/// let mut cdc = SqlServerCdc::new(config, connection);
/// let mut deliveries = cdc.take_delivery_receiver().unwrap();
/// cdc.start().await?;
///
/// while let Some(delivery) = deliveries.recv().await {
///     publish(delivery.record()).await?;
///     delivery.ack();
/// }
/// ```
pub struct SqlServerCdc<C: SqlServerConnection + 'static> {
    config: SqlServerCdcConfig,
    conn: Arc<C>,
    active: Arc<AtomicBool>,
    sender: DeliverySender<Lsn>,
    receiver: Option<mpsc::Receiver<Delivery<Lsn>>>,
    offset_store: Option<Arc<dyn OffsetStore<Lsn>>>,
    task: Option<JoinHandle<Result<()>>>,
}

impl<C: SqlServerConnection + 'static> SqlServerCdc<C> {
    /// Create a new SQL Server CDC source over `conn`
    pub fn new(config: SqlServerCdcConfig, conn: C) -> Self {
        Self::with_connection(config, Arc::new(conn))
    }

    pub fn with_connection(config: SqlServerCdcConfig, conn: Arc<C>) -> Self {
        let (sender, receiver) = delivery_channel(config.buffer_size);
        Self {
            config,
            conn,
            active: Arc::new(AtomicBool::new(false)),
            sender,
            receiver: Some(receiver),
            offset_store: None,
            task: None,
        }
    }

    /// Persist committed offsets in `store`
    pub fn with_offset_store(mut self, store: Arc<dyn OffsetStore<Lsn>>) -> Self {
        self.offset_store = Some(store);
        self
    }

    /// Take the delivery receiver (can only be called once)
    pub fn take_delivery_receiver(&mut self) -> Option<mpsc::Receiver<Delivery<Lsn>>> {
        self.receiver.take()
    }

    /// Get configuration
    pub fn config(&self) -> &SqlServerCdcConfig {
        &self.config
    }

    /// Wait for the polling task to exit and return its result
    pub async fn join(&mut self) -> Result<()> {
        match self.task.take() {
            Some(task) => task
                .await
                .map_err(|e| CdcError::other(format!("CDC poll task failed: {}", e)))?,
            None => Ok(()),
        }
    }
}

#[async_trait]
impl<C: SqlServerConnection + 'static> CdcSource for SqlServerCdc<C> {
    async fn start(&mut self) -> Result<()> {
        info!(
            "Starting SQL Server CDC on {}",
            self.config.redacted_connection_string()
        );

        if self.active.load(Ordering::SeqCst) {
            return Err(CdcError::config("CDC source already started"));
        }
        self.active.store(true, Ordering::SeqCst);

        let mut streamer =
            SqlServerStreamer::new(self.conn.clone(), &self.config, self.sender.clone())
                .with_active_flag(self.active.clone());
        if let Some(store) = &self.offset_store {
            streamer = streamer.with_offset_store(store.clone());
        }

        let config = self.config.clone();
        let active = self.active.clone();
        self.task = Some(tokio::spawn(async move {
            let result = run_cdc_poll_loop(&config, &mut streamer, &active).await;
            active.store(false, Ordering::SeqCst);
            if let Err(e) = &result {
                error!(
                    "CDC poll loop stopped at {:?}: {} [{}]",
                    streamer.committed().map(|o| o.to_string()),
                    e,
                    e.error_code()
                );
            }
            result
        }));

        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        info!("Stopping SQL Server CDC");
        self.active.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn is_healthy(&self) -> bool {
        self.active.load(Ordering::SeqCst) && self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

/// Run the CDC polling loop
async fn run_cdc_poll_loop<C: SqlServerConnection + ?Sized>(
    config: &SqlServerCdcConfig,
    streamer: &mut SqlServerStreamer<C>,
    active: &AtomicBool,
) -> Result<()> {
    let poll_interval = Duration::from_millis(config.poll_interval_ms);
    let mut backoff = config.backoff();

    loop {
        match streamer.initialize(config).await {
            Ok(()) => break,
            Err(e) => retry_or_fail(&mut backoff, e, "initialize").await?,
        }
    }
    backoff.reset();

    while active.load(Ordering::SeqCst) {
        let poll_start = Instant::now();

        match streamer.poll_once().await {
            Ok(Some(stats)) => {
                backoff.reset();
                if stats.delivered > 0 || stats.skipped > 0 {
                    debug!(
                        "Interval [{}, {}]: {} records from {} windows ({} skipped) in {:?}",
                        stats.from,
                        stats.to,
                        stats.delivered,
                        stats.windows,
                        stats.skipped,
                        poll_start.elapsed()
                    );
                }
                if stats.caught_up {
                    tokio::time::sleep(poll_interval).await;
                }
            }
            Ok(None) => {
                backoff.reset();
                trace!("No new changes, sleeping...");
                tokio::time::sleep(poll_interval).await;
            }
            Err(e) => retry_or_fail(&mut backoff, e, "poll").await?,
        }
    }

    info!("CDC poll loop stopped");
    Ok(())
}

async fn retry_or_fail(backoff: &mut ExponentialBackoff, err: CdcError, stage: &str) -> Result<()> {
    if !err.is_retriable() {
        return Err(err);
    }
    match backoff.next_backoff() {
        Some(delay) => {
            warn!(
                "CDC {} failed (attempt {}), retrying in {:?}: {}",
                stage,
                backoff.attempt(),
                delay,
                err
            );
            tokio::time::sleep(delay).await;
            Ok(())
        }
        None => {
            error!("CDC {} failed after {} attempts", stage, backoff.attempt());
            Err(err)
        }
    }
}
