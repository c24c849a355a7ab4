//! # Change offsets and acknowledged delivery
//!
//! A [`ChangeOffset`] is the durable checkpoint unit: the (position,
//! sequence, operation code) triple of the last record the sink has
//! acknowledged, plus the origin the record was read from. Two sources can
//! emit records with the same triple; the origin orders them the same way
//! the merge does. Its text form is `"<position-hex>:<sequence>:<op>:<origin>"`.
//!
//! Records reach the sink through a [`delivery_channel`]. The engine hands
//! over one record at a time and waits for its [`Acknowledger`] before it
//! advances the committed offset and sends the next record:
//!
//! ```ignore
//! let (sender, mut deliveries) = delivery_channel::<Lsn>(16);
//!
//! tokio::spawn(async move {
//!     while let Some(delivery) = deliveries.recv().await {
//!         publish(delivery.record()).await?;
//!         delivery.ack();
//!     }
//! });
//! ```
//!
//! After a restart the interval containing the committed offset is replayed;
//! a [`ResumeFilter`] drops every record at or before that offset.

use crate::common::{CdcError, ChangeRecord, LogPosition, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, info, trace};

// ============================================================================
// Change offset
// ============================================================================

/// Totally ordered checkpoint of one change record.
///
/// Fields compare in declaration order. An empty `origin` stands for every
/// origin at its (position, sequence, op), see [`ChangeOffset::covers`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChangeOffset<P: LogPosition> {
    pub position: P,
    pub sequence: P::Sequence,
    pub op: u8,
    /// Merge label of the source, e.g. `dbo.users:dbo_users`
    pub origin: String,
}

impl<P: LogPosition> ChangeOffset<P> {
    pub fn new(position: P, sequence: P::Sequence, op: u8) -> Self {
        Self {
            position,
            sequence,
            op,
            origin: String::new(),
        }
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into();
        self
    }

    /// Whether a record at `other` is at or before this offset.
    ///
    /// Without an origin, every record sharing the (position, sequence, op)
    /// triple is covered.
    pub fn covers(&self, other: &ChangeOffset<P>) -> bool {
        let key = (&self.position, &self.sequence, self.op);
        let other_key = (&other.position, &other.sequence, other.op);
        match other_key.cmp(&key) {
            std::cmp::Ordering::Less => true,
            std::cmp::Ordering::Greater => false,
            std::cmp::Ordering::Equal => self.origin.is_empty() || other.origin <= self.origin,
        }
    }

    /// Parse `"<position-hex>:<sequence>:<op>[:<origin>]"`
    pub fn parse(text: &str) -> Result<Self> {
        let invalid = || CdcError::invalid_position(format!("Malformed offset '{}'", text));

        let mut parts = text.splitn(4, ':');
        let (Some(position), Some(sequence), Some(op)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid());
        };

        Ok(Self {
            position: P::from_hex(position)?,
            sequence: P::decode_sequence(sequence)?,
            op: op.parse().map_err(|_| invalid())?,
            origin: parts.next().unwrap_or_default().to_string(),
        })
    }
}

impl<P: LogPosition> fmt::Display for ChangeOffset<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.position.to_hex(),
            P::encode_sequence(&self.sequence),
            self.op
        )?;
        if !self.origin.is_empty() {
            write!(f, ":{}", self.origin)?;
        }
        Ok(())
    }
}

impl<P: LogPosition> Serialize for ChangeOffset<P> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de, P: LogPosition> Deserialize<'de> for ChangeOffset<P> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::parse(&text).map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Acknowledged delivery
// ============================================================================

/// Confirms durable handoff of one record
#[derive(Debug)]
pub struct Acknowledger(oneshot::Sender<()>);

impl Acknowledger {
    pub fn ack(self) {
        // the engine may already have given up on this record
        let _ = self.0.send(());
    }
}

/// One record awaiting acknowledgement by the sink
#[derive(Debug)]
pub struct Delivery<P: LogPosition> {
    record: ChangeRecord<P>,
    ack: Acknowledger,
}

impl<P: LogPosition> Delivery<P> {
    pub fn record(&self) -> &ChangeRecord<P> {
        &self.record
    }

    /// Acknowledge and take the record
    pub fn ack(self) -> ChangeRecord<P> {
        self.ack.ack();
        self.record
    }

    /// Split into the record and its acknowledger for deferred acks
    pub fn into_parts(self) -> (ChangeRecord<P>, Acknowledger) {
        (self.record, self.ack)
    }
}

/// Engine side of the delivery channel
#[derive(Debug)]
pub struct DeliverySender<P: LogPosition> {
    tx: mpsc::Sender<Delivery<P>>,
}

impl<P: LogPosition> Clone for DeliverySender<P> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<P: LogPosition> DeliverySender<P> {
    /// Hand one record to the sink and wait until it is acknowledged.
    pub async fn deliver(&self, record: ChangeRecord<P>) -> Result<()> {
        let offset = record.offset();
        let (ack_tx, ack_rx) = oneshot::channel();

        self.tx
            .send(Delivery {
                record,
                ack: Acknowledger(ack_tx),
            })
            .await
            .map_err(|_| CdcError::sink_closed("delivery receiver dropped"))?;

        ack_rx.await.map_err(|_| {
            CdcError::sink_closed(format!("record at {} dropped without acknowledgement", offset))
        })?;

        trace!("Acknowledged {}", offset);
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Create a bounded delivery channel
pub fn delivery_channel<P: LogPosition>(
    buffer: usize,
) -> (DeliverySender<P>, mpsc::Receiver<Delivery<P>>) {
    let (tx, rx) = mpsc::channel(buffer.max(1));
    (DeliverySender { tx }, rx)
}

// ============================================================================
// Committed offset tracking
// ============================================================================

/// Monotonic committed offset
#[derive(Debug, Clone)]
pub struct OffsetTracker<P: LogPosition> {
    committed: Option<ChangeOffset<P>>,
}

impl<P: LogPosition> Default for OffsetTracker<P> {
    fn default() -> Self {
        Self { committed: None }
    }
}

impl<P: LogPosition> OffsetTracker<P> {
    pub fn new(committed: Option<ChangeOffset<P>>) -> Self {
        Self { committed }
    }

    pub fn committed(&self) -> Option<&ChangeOffset<P>> {
        self.committed.as_ref()
    }

    /// Advance to `offset`; a regression is an `InvalidPosition` error.
    pub fn commit(&mut self, offset: ChangeOffset<P>) -> Result<()> {
        if let Some(current) = &self.committed {
            if current.covers(&offset) {
                return Err(CdcError::invalid_position(format!(
                    "Offset {} does not advance past committed {}",
                    offset, current
                )));
            }
        }
        self.committed = Some(offset);
        Ok(())
    }
}

/// Drops replayed records up to and including the committed offset.
///
/// Merged output is ordered, so the filter disarms at the first record past
/// the committed offset.
#[derive(Debug, Clone)]
pub struct ResumeFilter<P: LogPosition> {
    resume_after: Option<ChangeOffset<P>>,
    skipped: u64,
}

impl<P: LogPosition> ResumeFilter<P> {
    pub fn new(resume_after: Option<ChangeOffset<P>>) -> Self {
        Self {
            resume_after,
            skipped: 0,
        }
    }

    pub fn should_skip(&mut self, offset: &ChangeOffset<P>) -> bool {
        let Some(committed) = &self.resume_after else {
            return false;
        };
        if committed.covers(offset) {
            self.skipped += 1;
            return true;
        }

        if self.skipped > 0 {
            debug!("Skipped {} already committed records", self.skipped);
        }
        self.resume_after = None;
        false
    }

    pub fn skipped(&self) -> u64 {
        self.skipped
    }
}

// ============================================================================
// Offset storage
// ============================================================================

/// Durable storage for committed offsets, keyed by connector name
#[async_trait::async_trait]
pub trait OffsetStore<P: LogPosition>: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<ChangeOffset<P>>>;
    async fn save(&self, key: &str, offset: &ChangeOffset<P>) -> Result<()>;
}

/// In-memory offset store (for testing or when persistence isn't needed).
#[derive(Debug)]
pub struct MemoryOffsetStore<P: LogPosition> {
    offsets: RwLock<HashMap<String, ChangeOffset<P>>>,
}

impl<P: LogPosition> Default for MemoryOffsetStore<P> {
    fn default() -> Self {
        Self {
            offsets: RwLock::new(HashMap::new()),
        }
    }
}

impl<P: LogPosition> MemoryOffsetStore<P> {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl<P: LogPosition> OffsetStore<P> for MemoryOffsetStore<P> {
    async fn load(&self, key: &str) -> Result<Option<ChangeOffset<P>>> {
        Ok(self.offsets.read().await.get(key).cloned())
    }

    async fn save(&self, key: &str, offset: &ChangeOffset<P>) -> Result<()> {
        self.offsets
            .write()
            .await
            .insert(key.to_string(), offset.clone());
        Ok(())
    }
}

/// File-backed offset store.
///
/// One JSON file per key, replaced atomically via rename.
#[derive(Debug)]
pub struct FileOffsetStore {
    base_dir: PathBuf,
    fsync: bool,
}

impl FileOffsetStore {
    pub async fn new(base_dir: impl AsRef<Path>) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        fs::create_dir_all(&base_dir).await?;
        info!("Offset store at {}", base_dir.display());
        Ok(Self {
            base_dir,
            fsync: true,
        })
    }

    pub fn with_fsync(mut self, fsync: bool) -> Self {
        self.fsync = fsync;
        self
    }

    fn file_path(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || key.contains('/') || key.contains('\\') {
            return Err(CdcError::config(format!("Invalid offset key '{}'", key)));
        }
        Ok(self.base_dir.join(format!("{}.json", key)))
    }
}

#[async_trait::async_trait]
impl<P: LogPosition> OffsetStore<P> for FileOffsetStore {
    async fn load(&self, key: &str) -> Result<Option<ChangeOffset<P>>> {
        let path = self.file_path(key)?;
        let contents = match fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let offset = serde_json::from_str(&contents)?;
        Ok(Some(offset))
    }

    async fn save(&self, key: &str, offset: &ChangeOffset<P>) -> Result<()> {
        let path = self.file_path(key)?;
        let temp_path = path.with_extension("tmp");
        let json = serde_json::to_string(offset)?;

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .await?;
        file.write_all(json.as_bytes()).await?;
        if self.fsync {
            file.sync_all().await?;
        }
        fs::rename(&temp_path, &path).await?;

        trace!("Saved offset for {}: {}", key, offset);
        Ok(())
    }
}
