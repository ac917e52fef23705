//! Retention policies: pure functions flagging sealed chunks for
//! deletion.
//!
//! A policy sees an ordered snapshot of the sealed chunk set (oldest
//! first) plus the current wall time and returns the ids to delete. The
//! maintenance worker applies the result; the active chunk can never be
//! returned because it is not part of the sealed snapshot.

use std::collections::HashSet;
use std::time::Duration;

use super::chunk_meta::StoreState;
use super::record::ChunkId;

pub trait RetentionPolicy: Send + Sync {
    fn apply(&self, state: &StoreState) -> Vec<ChunkId>;
}

/// Delete chunks whose newest record is older than `max_age`.
pub struct TtlRetention {
    pub max_age: Duration,
}

impl RetentionPolicy for TtlRetention {
    fn apply(&self, state: &StoreState) -> Vec<ChunkId> {
        if self.max_age.is_zero() {
            return Vec::new();
        }
        let cutoff = state.now - self.max_age.as_micros() as i64;
        state
            .chunks
            .iter()
            .filter(|meta| meta.end_ts < cutoff)
            .map(|meta| meta.id)
            .collect()
    }
}

/// Keep the newest chunks whose cumulative size fits the budget, delete
/// the rest. A zero budget disables the policy.
pub struct SizeRetention {
    pub max_total_bytes: u64,
}

impl RetentionPolicy for SizeRetention {
    fn apply(&self, state: &StoreState) -> Vec<ChunkId> {
        if self.max_total_bytes == 0 {
            return Vec::new();
        }
        let mut total = 0u64;
        let mut drop_ids = Vec::new();
        // walk newest to oldest, keep while the budget holds
        for meta in state.chunks.iter().rev() {
            total = total.saturating_add(meta.bytes);
            if total > self.max_total_bytes {
                drop_ids.push(meta.id);
            }
        }
        // report oldest first
        drop_ids.reverse();
        drop_ids
    }
}

/// Keep the `max_chunks` newest chunks. Zero disables the policy.
pub struct CountRetention {
    pub max_chunks: u64,
}

impl RetentionPolicy for CountRetention {
    fn apply(&self, state: &StoreState) -> Vec<ChunkId> {
        if self.max_chunks == 0 {
            return Vec::new();
        }
        let total = state.chunks.len() as u64;
        if total <= self.max_chunks {
            return Vec::new();
        }
        let overflow = (total - self.max_chunks) as usize;
        state.chunks[..overflow].iter().map(|meta| meta.id).collect()
    }
}

/// Union of all sub-policies, deduplicated, first-insertion order.
pub struct CompositeRetention {
    policies: Vec<Box<dyn RetentionPolicy>>,
}

impl CompositeRetention {
    pub fn new(policies: Vec<Box<dyn RetentionPolicy>>) -> Self {
        Self { policies }
    }
}

impl RetentionPolicy for CompositeRetention {
    fn apply(&self, state: &StoreState) -> Vec<ChunkId> {
        let mut seen = HashSet::new();
        let mut result = Vec::new();
        for policy in &self.policies {
            for id in policy.apply(state) {
                if seen.insert(id) {
                    result.push(id);
                }
            }
        }
        result
    }
}

/// Keeps everything; for tests and as the stock default.
pub struct NeverRetain;

impl RetentionPolicy for NeverRetain {
    fn apply(&self, _state: &StoreState) -> Vec<ChunkId> {
        Vec::new()
    }
}
