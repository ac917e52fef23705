//! Follow mode: an endless execution tracking the active chunk.
//!
//! The producer starts at the current tail of the active chunk, emits
//! matching records as they are appended, and polls briefly when there
//! is no progress. On rotation it drains the now-sealed chunk (and any
//! chunks created in between), then continues in the new active chunk
//! from position zero. Only cancellation terminates it.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::bounded;
use log::warn;

use crate::extract::KvExtractor;
use crate::store::{ChunkId, ChunkStore};

use super::exec::{CancelToken, Direction, Query, RecordStream};
use super::expr::to_dnf;

/// Idle poll interval while no records arrive.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

struct FollowState {
    chunk_id: ChunkId,
    next_position: u64,
}

pub fn follow_query(
    store: Arc<ChunkStore>,
    extractors: Arc<Vec<Box<dyn KvExtractor>>>,
    query: Query,
    capacity: usize,
) -> RecordStream {
    let cancel = CancelToken::new();
    let (tx, rx) = bounded(capacity.max(1));

    let branches = match &query.expr {
        Some(expr) => to_dnf(expr),
        None => Vec::new(),
    };

    let mut producer = super::exec::Producer {
        branches,
        write_bounds: query.write_bounds,
        ingest_bounds: query.ingest_bounds,
        source_bounds: query.source_bounds,
        direction: Direction::Forward,
        remaining: query.limit,
        extractors,
        tx,
        cancel: cancel.clone(),
    };

    // capture the tail before spawning: everything appended after this
    // call returns is guaranteed to be delivered
    let initial = store.active_state().map(|active| FollowState {
        chunk_id: active.id,
        next_position: active.records,
    });

    let producer_cancel = cancel.clone();
    let handle = std::thread::spawn(move || {
        let mut state: Option<FollowState> = initial;

        loop {
            if producer_cancel.is_cancelled() {
                return;
            }

            let active = match store.active_state() {
                Some(active) => active,
                None => {
                    std::thread::sleep(POLL_INTERVAL);
                    continue;
                }
            };

            let mut current = match state.take() {
                // the first active chunk appeared after follow started,
                // so all of it is new
                None => FollowState {
                    chunk_id: active.id,
                    next_position: 0,
                },
                Some(current) => current,
            };

            if current.chunk_id != active.id {
                // rotation happened: drain the chunks we left behind,
                // oldest first, before switching to the new active one
                let stale: Vec<ChunkId> = store
                    .list()
                    .iter()
                    .map(|meta| meta.id)
                    .filter(|id| *id >= current.chunk_id && *id < active.id)
                    .collect();
                for id in stale {
                    let from = if id == current.chunk_id {
                        current.next_position
                    } else {
                        0
                    };
                    if !drain(&mut producer, &store, id, from) {
                        return;
                    }
                }
                current = FollowState {
                    chunk_id: active.id,
                    next_position: 0,
                };
            }

            // read whatever the active chunk gained since the last pass
            let data = match store.open_chunk_data(current.chunk_id) {
                Ok(data) => data,
                Err(err) => {
                    warn!("follow: chunk {} unavailable - {}", current.chunk_id, err);
                    std::thread::sleep(POLL_INTERVAL);
                    state = Some(current);
                    continue;
                }
            };
            let records = data.records();
            if current.next_position >= records {
                state = Some(current);
                std::thread::sleep(POLL_INTERVAL);
                continue;
            }

            let mut position = current.next_position;
            while position < records {
                match producer.process(&data, position) {
                    super::exec::Flow::Stop => return,
                    _ => {}
                }
                position += 1;
            }
            current.next_position = records;
            state = Some(current);
        }
    });

    RecordStream::new(rx, cancel, handle)
}

fn drain(
    producer: &mut super::exec::Producer,
    store: &ChunkStore,
    id: ChunkId,
    from: u64,
) -> bool {
    let data = match store.open_chunk_data(id) {
        Ok(data) => data,
        Err(err) => {
            warn!("follow: stale chunk {} unavailable - {}", id, err);
            return true;
        }
    };
    let mut position = from;
    while position < data.records() {
        match producer.process(&data, position) {
            super::exec::Flow::Stop => return false,
            _ => {}
        }
        position += 1;
    }
    true
}
