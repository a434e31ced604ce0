//! Event retention policy
//!
//! Events are ranked by kind. Identity and social-graph kinds are kept
//! longest, recent conversation content next, and everything else is never
//! persisted. Once the persisted count passes `limit * 1.5` a sweep trims
//! the table back to the `limit` highest-ranked events.

use roost_core::{Event, kinds};

/// Rank of identity and social-graph kinds
pub const IDENTITY_RANK: f64 = 1.0;

/// Rank of recent high-volume content kinds
pub const CONTENT_RANK: f64 = 0.9;

/// Sweep triggers once the count exceeds `limit * SWEEP_FACTOR`
pub const SWEEP_FACTOR: f64 = 1.5;

/// Default number of events kept after a sweep
pub const DEFAULT_LIMIT: usize = 10_000;

/// Durability priority of an event. Zero means never persist.
pub fn rank(event: &Event) -> f64 {
    rank_kind(event.kind)
}

pub fn rank_kind(kind: u32) -> f64 {
    match kind {
        kinds::PROFILE
        | kinds::FOLLOWS
        | kinds::MUTES
        | kinds::RELAYS
        | kinds::INBOX_RELAYS
        | kinds::ROOMS
        | kinds::APP_DATA
        | kinds::ALERT
        | kinds::ALERT_STATUS => IDENTITY_RANK,
        kinds::EVENT_TIME
        | kinds::THREAD
        | kinds::MESSAGE
        | kinds::DIRECT_MESSAGE
        | kinds::DIRECT_MESSAGE_FILE => CONTENT_RANK,
        _ => 0.0,
    }
}

/// A persisted event as seen by a sweep
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub id: String,
    pub rank: f64,
    pub created_at: u64,
}

impl Candidate {
    pub fn new(id: impl Into<String>, rank: f64, created_at: u64) -> Self {
        Self {
            id: id.into(),
            rank,
            created_at,
        }
    }

    pub fn from_event(event: &Event) -> Self {
        Self::new(event.id.clone(), rank(event), event.created_at)
    }
}

/// Retention limit with hysteresis
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetentionPolicy {
    limit: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_LIMIT)
    }
}

impl RetentionPolicy {
    pub fn new(limit: usize) -> Self {
        Self { limit }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Count above which a sweep runs
    pub fn threshold(&self) -> f64 {
        self.limit as f64 * SWEEP_FACTOR
    }

    pub fn should_sweep(&self, count: usize) -> bool {
        count as f64 > self.threshold()
    }

    /// Ids to delete so that only the `limit` best candidates remain.
    ///
    /// Candidates are ordered by rank, then newest first, then id, so the
    /// kept set is the same for the same input.
    pub fn select_for_eviction(&self, mut candidates: Vec<Candidate>) -> Vec<String> {
        if candidates.len() <= self.limit {
            return Vec::new();
        }

        candidates.sort_by(|a, b| {
            b.rank
                .total_cmp(&a.rank)
                .then(b.created_at.cmp(&a.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });

        candidates
            .split_off(self.limit)
            .into_iter()
            .map(|candidate| candidate.id)
            .collect()
    }
}
