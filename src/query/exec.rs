//! Query execution: a producer thread streams matching records through
//! a bounded channel.
//!
//! The consumer side is a plain iterator. Back-pressure is the channel
//! bound; cancellation flips a shared flag the producer checks between
//! records and closes the channel, so the consumer always observes a
//! deterministic end-of-stream. Dropping the stream disconnects the
//! channel, which also collapses the producer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::Error;
use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, warn};

use crate::error::StoreError;
use crate::extract::KvExtractor;
use crate::store::{ChunkData, ChunkId, ChunkStore, Record, RecordRef};

use super::expr::{matches_branches, Branch, Expr, RecordEval};
use super::plan::{plan_query, ChunkPlan};

/// Scan direction over chunks and records.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Reverse,
}

impl Default for Direction {
    fn default() -> Self {
        Direction::Forward
    }
}

/// Inclusive time bounds in Unix microseconds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TimeBounds {
    pub start: Option<i64>,
    pub end: Option<i64>,
}

impl TimeBounds {
    pub fn new(start: Option<i64>, end: Option<i64>) -> Self {
        Self { start, end }
    }

    pub fn is_unbounded(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }

    /// Both ends are inclusive: a record stamped exactly `end` matches.
    pub fn contains(&self, ts: i64) -> bool {
        self.start.map_or(true, |s| ts >= s) && self.end.map_or(true, |e| ts <= e)
    }
}

/// Opaque pagination cursor: 16 bytes of chunk id plus the position to
/// seek to, big-endian.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResumeToken {
    pub chunk_id: ChunkId,
    pub position: u64,
}

pub const RESUME_TOKEN_SIZE: usize = 24;

impl ResumeToken {
    pub fn encode(&self) -> [u8; RESUME_TOKEN_SIZE] {
        let mut buf = [0u8; RESUME_TOKEN_SIZE];
        buf[..16].copy_from_slice(self.chunk_id.as_bytes());
        buf[16..].copy_from_slice(&self.position.to_be_bytes());
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self, Error> {
        if data.len() != RESUME_TOKEN_SIZE {
            return Err(StoreError::InvalidResumeToken.into());
        }
        let mut id = [0u8; 16];
        id.copy_from_slice(&data[..16]);
        let mut position = [0u8; 8];
        position.copy_from_slice(&data[16..]);
        Ok(Self {
            chunk_id: ChunkId::from_bytes(id),
            position: u64::from_be_bytes(position),
        })
    }
}

/// The wire-level query contract.
#[derive(Default)]
pub struct Query {
    /// Boolean expression; `None` scans by time only.
    pub expr: Option<Expr>,
    /// Bounds on the write timestamp.
    pub write_bounds: TimeBounds,
    /// Bounds on the ingest timestamp.
    pub ingest_bounds: TimeBounds,
    /// Bounds on the origin event time (the `source_ts` attribute).
    pub source_bounds: TimeBounds,
    /// Stop after this many records.
    pub limit: Option<u64>,
    /// Context lines around each hit; carried for display consumers,
    /// the engine itself does not expand context.
    pub context_lines: u32,
    pub direction: Direction,
    /// Restrict to a named store; mismatches yield an empty stream.
    pub store: Option<String>,
    /// Continue a previous execution.
    pub resume: Option<ResumeToken>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_expr(mut self, expr: Expr) -> Self {
        self.expr = Some(expr);
        self
    }

    /// Parse and attach a query expression.
    pub fn with_text(mut self, text: &str) -> Result<Self, Error> {
        self.expr = Some(super::parse::parse_query(text)?);
        Ok(self)
    }

    pub fn with_write_bounds(mut self, start: Option<i64>, end: Option<i64>) -> Self {
        self.write_bounds = TimeBounds::new(start, end);
        self
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub fn with_resume(mut self, token: ResumeToken) -> Self {
        self.resume = Some(token);
        self
    }
}

/// One matching record, with the token that resumes right after it.
pub struct QueryHit {
    pub record: Record,
    pub rref: RecordRef,
    pub resume: ResumeToken,
}

/// Shared cancellation flag. Cancellation is cooperative: producers
/// check it between records and simply stop.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// The consumer end of a query execution.
pub struct RecordStream {
    rx: Receiver<Result<QueryHit, Error>>,
    cancel: CancelToken,
    _handle: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for RecordStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordStream").finish()
    }
}

impl RecordStream {
    pub(super) fn new(
        rx: Receiver<Result<QueryHit, Error>>,
        cancel: CancelToken,
        handle: JoinHandle<()>,
    ) -> Self {
        Self {
            rx,
            cancel,
            _handle: Some(handle),
        }
    }

    /// A stream that ends immediately.
    pub fn empty() -> Self {
        let (_, rx) = bounded(1);
        Self {
            rx,
            cancel: CancelToken::new(),
            _handle: None,
        }
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }
}

impl Iterator for RecordStream {
    type Item = Result<QueryHit, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        self.rx.recv().ok()
    }
}

impl Drop for RecordStream {
    fn drop(&mut self) {
        // the producer exits on the next send once the channel
        // disconnects; no join required
        self.cancel.cancel();
    }
}

pub(super) enum Flow {
    Continue,
    SkipChunk,
    Stop,
}

pub(super) struct Producer {
    pub(super) branches: Vec<Branch>,
    pub(super) write_bounds: TimeBounds,
    pub(super) ingest_bounds: TimeBounds,
    pub(super) source_bounds: TimeBounds,
    pub(super) direction: Direction,
    pub(super) remaining: Option<u64>,
    pub(super) extractors: Arc<Vec<Box<dyn KvExtractor>>>,
    pub(super) tx: Sender<Result<QueryHit, Error>>,
    pub(super) cancel: CancelToken,
}

impl Producer {
    fn source_ts_matches(&self, record: &crate::store::RecordView) -> bool {
        if self.source_bounds.is_unbounded() {
            return true;
        }
        match record
            .attrs
            .get("source_ts")
            .and_then(|v| v.parse::<i64>().ok())
        {
            Some(ts) => self.source_bounds.contains(ts),
            None => false,
        }
    }

    /// Evaluate one position; emits on match.
    pub(super) fn process(&mut self, data: &ChunkData, position: u64) -> Flow {
        if self.cancel.is_cancelled() {
            return Flow::Stop;
        }

        let view = match data.view(position) {
            Ok(view) => view,
            Err(err) => {
                warn!(
                    "skipping corrupt record {}@{} - {}",
                    data.chunk_id(),
                    position,
                    err
                );
                return Flow::Continue;
            }
        };

        if !self.write_bounds.contains(view.write_ts) {
            // write timestamps are monotone within a chunk: past the
            // bound in scan direction, the rest of the chunk is too
            match self.direction {
                Direction::Forward => {
                    if let Some(end) = self.write_bounds.end {
                        if view.write_ts > end {
                            return Flow::SkipChunk;
                        }
                    }
                }
                Direction::Reverse => {
                    if let Some(start) = self.write_bounds.start {
                        if view.write_ts < start {
                            return Flow::SkipChunk;
                        }
                    }
                }
            }
            return Flow::Continue;
        }
        if !self.ingest_bounds.contains(view.ingest_ts) {
            return Flow::Continue;
        }
        if !self.source_ts_matches(&view) {
            return Flow::Continue;
        }

        let mut eval = RecordEval::new(&self.extractors, &view.attrs, view.raw);
        if !matches_branches(&self.branches, &mut eval) {
            return Flow::Continue;
        }

        let rref = RecordRef {
            chunk_id: data.chunk_id(),
            position,
        };
        let resume = match self.direction {
            // forward: seek(p) then next() returns p, so the token
            // names the next unseen record
            Direction::Forward => ResumeToken {
                chunk_id: rref.chunk_id,
                position: position + 1,
            },
            // reverse: seek(p) then prev() returns p-1
            Direction::Reverse => ResumeToken {
                chunk_id: rref.chunk_id,
                position,
            },
        };
        let hit = QueryHit {
            record: view.to_record(),
            rref,
            resume,
        };
        if self.tx.send(Ok(hit)).is_err() {
            return Flow::Stop;
        }

        if let Some(remaining) = self.remaining.as_mut() {
            *remaining -= 1;
            if *remaining == 0 {
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    fn run_chunk(&mut self, store: &ChunkStore, plan: &ChunkPlan, resume: Option<u64>) -> Flow {
        if plan.empty {
            return Flow::Continue;
        }

        let data = match store.open_chunk_data(plan.meta.id) {
            Ok(data) => data,
            Err(err) => {
                // the chunk may have been deleted since planning
                warn!("chunk {} unavailable - {}", plan.meta.id, err);
                return Flow::Continue;
            }
        };
        let records = data.records();

        match self.direction {
            Direction::Forward => {
                let mut first = plan.start_position.unwrap_or(0);
                if let Some(resume) = resume {
                    first = first.max(resume);
                }
                match &plan.candidates {
                    Some(candidates) => {
                        for &position in candidates {
                            if position < first {
                                continue;
                            }
                            match self.process(&data, position) {
                                Flow::Continue => {}
                                Flow::SkipChunk => break,
                                Flow::Stop => return Flow::Stop,
                            }
                        }
                    }
                    None => {
                        let mut position = first;
                        while position < records {
                            match self.process(&data, position) {
                                Flow::Continue => {}
                                Flow::SkipChunk => break,
                                Flow::Stop => return Flow::Stop,
                            }
                            position += 1;
                        }
                    }
                }
            }
            Direction::Reverse => {
                // a reverse resume token is exclusive: it names the
                // position already returned
                let limit = resume.unwrap_or(records).min(records);
                match &plan.candidates {
                    Some(candidates) => {
                        for &position in candidates.iter().rev() {
                            if position >= limit {
                                continue;
                            }
                            match self.process(&data, position) {
                                Flow::Continue => {}
                                Flow::SkipChunk => break,
                                Flow::Stop => return Flow::Stop,
                            }
                        }
                    }
                    None => {
                        let mut position = limit;
                        while position > 0 {
                            position -= 1;
                            match self.process(&data, position) {
                                Flow::Continue => {}
                                Flow::SkipChunk => break,
                                Flow::Stop => return Flow::Stop,
                            }
                        }
                    }
                }
            }
        }

        Flow::Continue
    }
}

/// Execute a query. Planning happens synchronously (so an invalid resume
/// token fails fast); scanning happens on a producer thread.
pub fn execute_query(
    store: Arc<ChunkStore>,
    extractors: Arc<Vec<Box<dyn KvExtractor>>>,
    query: Query,
    capacity: usize,
) -> Result<RecordStream, Error> {
    let plan = plan_query(&store, &query)?;
    debug!("{}", plan);

    let cancel = CancelToken::new();
    let (tx, rx) = bounded(capacity.max(1));

    let mut producer = Producer {
        branches: plan.branches.clone(),
        write_bounds: query.write_bounds,
        ingest_bounds: query.ingest_bounds,
        source_bounds: query.source_bounds,
        direction: query.direction,
        remaining: query.limit,
        extractors,
        tx,
        cancel: cancel.clone(),
    };
    let resume = query.resume;

    let handle = std::thread::spawn(move || {
        if producer.remaining == Some(0) {
            return;
        }
        for chunk_plan in &plan.chunks {
            let resume_position = resume
                .filter(|token| token.chunk_id == chunk_plan.meta.id)
                .map(|token| token.position);
            match producer.run_chunk(&store, chunk_plan, resume_position) {
                Flow::Stop => return,
                _ => {}
            }
        }
    });

    Ok(RecordStream::new(rx, cancel, handle))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resume_token_roundtrip() {
        let token = ResumeToken {
            chunk_id: ChunkId::now_v7(),
            position: 0xDEAD_BEEF,
        };
        let buf = token.encode();
        assert_eq!(buf.len(), RESUME_TOKEN_SIZE);
        assert_eq!(ResumeToken::decode(&buf).unwrap(), token);

        // position is big-endian per the wire contract
        assert_eq!(&buf[16..], &[0, 0, 0, 0, 0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn resume_token_rejects_bad_length() {
        let err = ResumeToken::decode(&[0u8; 23]).unwrap_err();
        assert!(matches!(
            StoreError::from_err(&err),
            Some(StoreError::InvalidResumeToken)
        ));
    }

    #[test]
    fn time_bounds_are_inclusive() {
        let bounds = TimeBounds::new(Some(10), Some(20));
        assert!(bounds.contains(10));
        assert!(bounds.contains(20));
        assert!(!bounds.contains(9));
        assert!(!bounds.contains(21));
        assert!(TimeBounds::default().contains(i64::MIN));
    }
}
