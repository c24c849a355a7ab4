//! Multi-source merge stream
//!
//! K-way merge of per-source row cursors into one globally ordered sequence.
//! Each source is already sorted by its order key (position, sequence,
//! operation code); the merge keeps exactly one pending row per source in a
//! min-heap and advances the source whose row it just emitted.
//!
//! Equal keys can only occur across sources. They are broken by the source
//! label (lexicographically smaller first), then by input order, so the
//! output is reproducible.
//!
//! Any cursor error aborts the merge with [`CdcError::StreamRead`] tagged
//! with the offending source. The stream stays failed afterwards: the caller
//! restarts the interval from its last committed offset.

use crate::common::{CdcError, Result};
use async_trait::async_trait;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt::Debug;
use tracing::{debug, trace};

/// A row that can take part in a merge
pub trait SourceRow: Send + 'static {
    type Key: Ord + Clone + Debug + Send + Sync;

    fn order_key(&self) -> Self::Key;
}

/// Forward-only cursor over one source's rows
#[async_trait]
pub trait RowCursor<R>: Send {
    /// Next row, or `None` when the source is exhausted
    async fn next_row(&mut self) -> Result<Option<R>>;
}

/// Cursor over rows already held in memory
pub struct VecCursor<R> {
    rows: std::vec::IntoIter<R>,
}

impl<R> VecCursor<R> {
    pub fn new(rows: Vec<R>) -> Self {
        Self {
            rows: rows.into_iter(),
        }
    }
}

#[async_trait]
impl<R: Send> RowCursor<R> for VecCursor<R> {
    async fn next_row(&mut self) -> Result<Option<R>> {
        Ok(self.rows.next())
    }
}

/// One labelled merge input
pub struct MergeInput<R> {
    pub label: String,
    pub cursor: Box<dyn RowCursor<R>>,
}

impl<R> MergeInput<R> {
    pub fn new(label: impl Into<String>, cursor: Box<dyn RowCursor<R>>) -> Self {
        Self {
            label: label.into(),
            cursor,
        }
    }
}

struct Pending<R: SourceRow> {
    key: R::Key,
    /// Position of the source in label order
    rank: usize,
    input: usize,
    row: R,
}

impl<R: SourceRow> PartialEq for Pending<R> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<R: SourceRow> Eq for Pending<R> {}

impl<R: SourceRow> PartialOrd for Pending<R> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<R: SourceRow> Ord for Pending<R> {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reversed to pop the smallest key first
        match other.key.cmp(&self.key) {
            Ordering::Equal => other.rank.cmp(&self.rank),
            ordering => ordering,
        }
    }
}

struct Source<R: SourceRow> {
    label: String,
    cursor: Box<dyn RowCursor<R>>,
    last_key: Option<R::Key>,
    rows: u64,
}

/// Globally ordered merge over labelled cursors
pub struct MergeStream<R: SourceRow> {
    sources: Vec<Source<R>>,
    ranks: Vec<usize>,
    heap: BinaryHeap<Pending<R>>,
    failure: Option<(String, String)>,
}

impl<R: SourceRow> MergeStream<R> {
    /// Prime every cursor concurrently and build the merge.
    pub async fn open(inputs: Vec<MergeInput<R>>) -> Result<Self> {
        let mut ranks = vec![0; inputs.len()];
        let mut order: Vec<usize> = (0..inputs.len()).collect();
        order.sort_by(|&a, &b| inputs[a].label.cmp(&inputs[b].label).then(a.cmp(&b)));
        for (rank, &input) in order.iter().enumerate() {
            ranks[input] = rank;
        }

        let primed = futures::future::try_join_all(inputs.into_iter().map(|mut input| async move {
            match input.cursor.next_row().await {
                Ok(first) => Ok((input, first)),
                Err(e) => Err(CdcError::stream_read(&input.label, e.to_string())),
            }
        }))
        .await?;

        let mut stream = Self {
            sources: Vec::with_capacity(primed.len()),
            ranks,
            heap: BinaryHeap::with_capacity(primed.len()),
            failure: None,
        };

        for (index, (input, first)) in primed.into_iter().enumerate() {
            stream.sources.push(Source {
                label: input.label,
                cursor: input.cursor,
                last_key: None,
                rows: 0,
            });
            if let Some(row) = first {
                stream.push(index, row)?;
            }
        }

        debug!(
            "Opened merge over {} sources ({} non-empty)",
            stream.sources.len(),
            stream.heap.len()
        );
        Ok(stream)
    }

    /// Number of merged sources
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Label of input `index`
    pub fn label(&self, index: usize) -> &str {
        &self.sources[index].label
    }

    /// Rows emitted so far from input `index`
    pub fn rows_from(&self, index: usize) -> u64 {
        self.sources[index].rows
    }

    /// Next row in global order with the index of the input it came from.
    pub async fn next(&mut self) -> Result<Option<(usize, R)>> {
        if let Some((label, message)) = &self.failure {
            return Err(CdcError::stream_read(label.clone(), message.clone()));
        }

        let Some(Pending { input, row, .. }) = self.heap.pop() else {
            return Ok(None);
        };
        self.sources[input].rows += 1;

        match self.sources[input].cursor.next_row().await {
            Ok(Some(next)) => self.push(input, next)?,
            Ok(None) => trace!(
                "Source '{}' exhausted after {} rows",
                self.sources[input].label,
                self.sources[input].rows
            ),
            Err(e) => return Err(self.fail(input, e.to_string())),
        }

        Ok(Some((input, row)))
    }

    fn push(&mut self, input: usize, row: R) -> Result<()> {
        let key = row.order_key();
        if let Some(last) = &self.sources[input].last_key {
            if key <= *last {
                let message = format!("row key {:?} does not advance past {:?}", key, last);
                return Err(self.fail(input, message));
            }
        }
        self.sources[input].last_key = Some(key.clone());
        self.heap.push(Pending {
            key,
            rank: self.ranks[input],
            input,
            row,
        });
        Ok(())
    }

    fn fail(&mut self, input: usize, message: String) -> CdcError {
        let label = self.sources[input].label.clone();
        self.heap.clear();
        self.failure = Some((label.clone(), message.clone()));
        CdcError::stream_read(label, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Row(u32, u32, &'static str);

    impl SourceRow for Row {
        type Key = (u32, u32);

        fn order_key(&self) -> Self::Key {
            (self.0, self.1)
        }
    }

    struct FailingCursor {
        rows: Vec<Row>,
    }

    #[async_trait]
    impl RowCursor<Row> for FailingCursor {
        async fn next_row(&mut self) -> Result<Option<Row>> {
            if self.rows.is_empty() {
                return Err(CdcError::ConnectionClosed);
            }
            Ok(Some(self.rows.remove(0)))
        }
    }

    fn input(label: &str, rows: Vec<Row>) -> MergeInput<Row> {
        MergeInput::new(label, Box::new(VecCursor::new(rows)))
    }

    async fn drain(stream: &mut MergeStream<Row>) -> Vec<Row> {
        let mut out = Vec::new();
        while let Some((_, row)) = stream.next().await.unwrap() {
            out.push(row);
        }
        out
    }

    #[tokio::test]
    async fn test_merge_orders_globally() {
        let mut stream = MergeStream::open(vec![
            input("dbo.a", vec![Row(1, 0, "a"), Row(4, 0, "a")]),
            input("dbo.b", vec![Row(2, 0, "b"), Row(3, 0, "b"), Row(5, 0, "b")]),
            input("dbo.c", vec![]),
        ])
        .await
        .unwrap();

        let keys: Vec<u32> = drain(&mut stream).await.iter().map(|r| r.0).collect();
        assert_eq!(keys, vec![1, 2, 3, 4, 5]);
        assert_eq!(stream.rows_from(1), 3);
    }

    #[tokio::test]
    async fn test_tie_break_by_label() {
        // input order deliberately opposite to label order
        let mut stream = MergeStream::open(vec![
            input("dbo.zeta", vec![Row(1, 1, "z")]),
            input("dbo.alpha", vec![Row(1, 1, "a")]),
        ])
        .await
        .unwrap();

        let (index, row) = stream.next().await.unwrap().unwrap();
        assert_eq!(row.2, "a");
        assert_eq!(stream.label(index), "dbo.alpha");
        let (_, row) = stream.next().await.unwrap().unwrap();
        assert_eq!(row.2, "z");
        assert!(stream.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cursor_error_is_tagged_and_sticky() {
        let mut stream = MergeStream::open(vec![
            input("dbo.ok", vec![Row(1, 0, "ok"), Row(9, 0, "ok")]),
            MergeInput::new(
                "dbo.flaky",
                Box::new(FailingCursor {
                    rows: vec![Row(2, 0, "f")],
                }),
            ),
        ])
        .await
        .unwrap();

        assert_eq!(stream.next().await.unwrap().unwrap().1 .0, 1);

        let err = stream.next().await.unwrap_err();
        match &err {
            CdcError::StreamRead { origin, .. } => assert_eq!(origin, "dbo.flaky"),
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.is_retriable());

        // poisoned
        assert!(matches!(
            stream.next().await,
            Err(CdcError::StreamRead { .. })
        ));
    }

    #[tokio::test]
    async fn test_priming_error() {
        let result = MergeStream::open(vec![MergeInput::new(
            "dbo.broken",
            Box::new(FailingCursor { rows: vec![] }),
        )])
        .await;
        assert!(matches!(result, Err(CdcError::StreamRead { .. })));
    }

    #[tokio::test]
    async fn test_out_of_order_source_is_rejected() {
        let mut stream = MergeStream::open(vec![input(
            "dbo.bad",
            vec![Row(2, 0, "x"), Row(2, 0, "x")],
        )])
        .await
        .unwrap();

        let err = stream.next().await.unwrap_err();
        assert!(err.to_string().contains("does not advance"));
    }

    #[tokio::test]
    async fn test_empty_merge() {
        let mut stream = MergeStream::<Row>::open(vec![]).await.unwrap();
        assert!(stream.is_empty());
        assert!(stream.next().await.unwrap().is_none());
    }
}
