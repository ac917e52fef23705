//! Rotation policies: pure decisions over the active chunk state.
//!
//! A policy is asked *before* a record is appended and sees the projected
//! on-disk size of that record. It never performs I/O and never mutates
//! its inputs, so the store can evaluate it under the writer lock without
//! side effects. Zero thresholds disable a check.

use std::time::Duration;

use super::chunk_meta::ActiveChunkState;

/// Projected on-disk cost of the record about to be appended.
#[derive(Clone, Copy, Debug)]
pub struct PendingRecord {
    /// Raw payload bytes.
    pub raw_len: u64,
    /// Encoded attribute blob bytes.
    pub attr_len: u64,
    /// Total chunk growth: raw + attrs + index entry.
    pub disk_size: u64,
}

pub trait RotationPolicy: Send + Sync {
    /// Decide whether the active chunk must be sealed before appending
    /// `next`. Returns the trigger name of the first matching rule.
    fn should_rotate(
        &self,
        state: &ActiveChunkState,
        next: &PendingRecord,
        now: i64,
    ) -> Option<&'static str>;
}

/// Seal once the projected chunk size exceeds `max_bytes`.
pub struct SizePolicy {
    pub max_bytes: u64,
}

impl RotationPolicy for SizePolicy {
    fn should_rotate(
        &self,
        state: &ActiveChunkState,
        next: &PendingRecord,
        _now: i64,
    ) -> Option<&'static str> {
        if self.max_bytes == 0 {
            return None;
        }
        if state.bytes + next.disk_size > self.max_bytes {
            Some("size")
        } else {
            None
        }
    }
}

/// Seal once the chunk would hold more than `max_records` records.
pub struct RecordCountPolicy {
    pub max_records: u64,
}

impl RotationPolicy for RecordCountPolicy {
    fn should_rotate(
        &self,
        state: &ActiveChunkState,
        _next: &PendingRecord,
        _now: i64,
    ) -> Option<&'static str> {
        if self.max_records == 0 {
            return None;
        }
        if state.records + 1 > self.max_records {
            Some("records")
        } else {
            None
        }
    }
}

/// Seal once the chunk is older than `max_age`. Skipped when the chunk
/// creation time is unknown (zero).
pub struct AgePolicy {
    pub max_age: Duration,
}

impl RotationPolicy for AgePolicy {
    fn should_rotate(
        &self,
        state: &ActiveChunkState,
        _next: &PendingRecord,
        now: i64,
    ) -> Option<&'static str> {
        if self.max_age.is_zero() || state.created_at == 0 {
            return None;
        }
        if now - state.created_at > self.max_age.as_micros() as i64 {
            Some("age")
        } else {
            None
        }
    }
}

/// Seal before a log offset would no longer fit in 32 bits.
///
/// Both append logs are bounded: the record index stores raw and
/// attribute offsets as u32. Any production composite must include this
/// policy.
pub struct HardLimitPolicy {
    pub raw_max_bytes: u64,
    pub attr_max_bytes: u64,
}

impl Default for HardLimitPolicy {
    fn default() -> Self {
        Self {
            raw_max_bytes: u32::MAX as u64,
            attr_max_bytes: u32::MAX as u64,
        }
    }
}

impl RotationPolicy for HardLimitPolicy {
    fn should_rotate(
        &self,
        state: &ActiveChunkState,
        next: &PendingRecord,
        _now: i64,
    ) -> Option<&'static str> {
        if self.raw_max_bytes > 0 && state.raw_bytes + next.raw_len > self.raw_max_bytes {
            return Some("hard-limit");
        }
        if self.attr_max_bytes > 0 && state.attr_bytes + next.attr_len > self.attr_max_bytes {
            return Some("hard-limit");
        }
        None
    }
}

/// First matching sub-policy wins; evaluation short-circuits.
pub struct CompositePolicy {
    policies: Vec<Box<dyn RotationPolicy>>,
}

impl CompositePolicy {
    pub fn new(policies: Vec<Box<dyn RotationPolicy>>) -> Self {
        Self { policies }
    }
}

impl RotationPolicy for CompositePolicy {
    fn should_rotate(
        &self,
        state: &ActiveChunkState,
        next: &PendingRecord,
        now: i64,
    ) -> Option<&'static str> {
        self.policies
            .iter()
            .find_map(|p| p.should_rotate(state, next, now))
    }
}

/// Never rotates; for tests.
pub struct NeverRotate;

impl RotationPolicy for NeverRotate {
    fn should_rotate(
        &self,
        _state: &ActiveChunkState,
        _next: &PendingRecord,
        _now: i64,
    ) -> Option<&'static str> {
        None
    }
}

/// Rotates on every append; for tests.
pub struct AlwaysRotate;

impl RotationPolicy for AlwaysRotate {
    fn should_rotate(
        &self,
        _state: &ActiveChunkState,
        _next: &PendingRecord,
        _now: i64,
    ) -> Option<&'static str> {
        Some("always")
    }
}

/// The stock production policy: size-bounded chunks with the u32 offset
/// guard in place.
pub fn default_rotation() -> Box<dyn RotationPolicy> {
    Box::new(CompositePolicy::new(vec![
        Box::new(SizePolicy {
            max_bytes: 256 * 1024 * 1024,
        }),
        Box::new(HardLimitPolicy::default()),
    ]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn state(bytes: u64, records: u64) -> ActiveChunkState {
        ActiveChunkState {
            id: Uuid::now_v7(),
            start_ts: 0,
            last_write_ts: 0,
            created_at: 1_000_000,
            bytes,
            raw_bytes: bytes / 2,
            attr_bytes: bytes / 4,
            records,
        }
    }

    fn pending(disk: u64) -> PendingRecord {
        PendingRecord {
            raw_len: disk / 2,
            attr_len: disk / 4,
            disk_size: disk,
        }
    }

    #[test]
    fn size_policy_uses_projected_bytes() {
        let policy = SizePolicy { max_bytes: 100 };
        assert_eq!(policy.should_rotate(&state(90, 5), &pending(10), 0), None);
        assert_eq!(
            policy.should_rotate(&state(90, 5), &pending(11), 0),
            Some("size")
        );
        // zero disables
        let off = SizePolicy { max_bytes: 0 };
        assert_eq!(off.should_rotate(&state(u64::MAX / 2, 5), &pending(64), 0), None);
    }

    #[test]
    fn record_count_policy() {
        let policy = RecordCountPolicy { max_records: 3 };
        assert_eq!(policy.should_rotate(&state(0, 2), &pending(1), 0), None);
        assert_eq!(
            policy.should_rotate(&state(0, 3), &pending(1), 0),
            Some("records")
        );
    }

    #[test]
    fn age_policy_skips_unknown_creation_time() {
        let policy = AgePolicy {
            max_age: Duration::from_secs(1),
        };
        let mut s = state(0, 0);
        let now = s.created_at + 2_000_000;
        assert_eq!(policy.should_rotate(&s, &pending(1), now), Some("age"));

        s.created_at = 0;
        assert_eq!(policy.should_rotate(&s, &pending(1), now), None);
    }

    #[test]
    fn hard_limit_checks_both_logs() {
        let policy = HardLimitPolicy {
            raw_max_bytes: 100,
            attr_max_bytes: 50,
        };
        let mut s = state(0, 0);
        s.raw_bytes = 95;
        s.attr_bytes = 10;

        let mut next = pending(0);
        next.raw_len = 6;
        next.attr_len = 1;
        assert_eq!(policy.should_rotate(&s, &next, 0), Some("hard-limit"));

        next.raw_len = 5;
        next.attr_len = 41;
        assert_eq!(policy.should_rotate(&s, &next, 0), Some("hard-limit"));

        next.attr_len = 40;
        assert_eq!(policy.should_rotate(&s, &next, 0), None);
    }

    #[test]
    fn composite_returns_first_trigger() {
        let policy = CompositePolicy::new(vec![
            Box::new(RecordCountPolicy { max_records: 3 }),
            Box::new(AlwaysRotate),
        ]);
        assert_eq!(
            policy.should_rotate(&state(0, 3), &pending(1), 0),
            Some("records")
        );
        assert_eq!(
            policy.should_rotate(&state(0, 0), &pending(1), 0),
            Some("always")
        );
    }

    #[test]
    fn repeated_calls_are_pure() {
        let policy = SizePolicy { max_bytes: 100 };
        let s = state(99, 1);
        let p = pending(2);
        for _ in 0..3 {
            assert_eq!(policy.should_rotate(&s, &p, 7), Some("size"));
        }
    }
}
