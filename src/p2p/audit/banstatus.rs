//! Ban status bookkeeping
//!
//! Every banned-or-watched address and peer identity carries a time-ordered
//! event history, a cumulative ban score (event count, never decayed), and a
//! ban expiry recomputed from the score through a fixed escalation table.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Escalating ban durations in seconds, indexed by `ban_score - 1` (clamped
/// to the last entry). Zero means "not yet banned".
pub const BAN_DURATION_SECS: [i64; 9] = [
    0,
    0,
    60,            // 1 minute
    3 * 60,        // 3 minutes
    10 * 60,       // 10 minutes
    3600,          // 1 hour
    24 * 3600,     // 1 day
    30 * 24 * 3600,   // 30 days
    3650 * 24 * 3600, // effectively forever
];

/// One scoring event in a ban history. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BanEvent {
    pub when: DateTime<Utc>,
    pub why: String,
}

/// Ban record for one address or peer identity.
#[derive(Debug, Clone, PartialEq)]
pub struct BanStatus {
    id: String,
    /// History of scoring events, ascending by time.
    events: Vec<BanEvent>,
    /// Count of events; only grows, pruning does not reduce it.
    ban_score: u32,
    ban_until: Option<DateTime<Utc>>,
}

impl BanStatus {
    pub fn new(id: impl Into<String>) -> Self {
        BanStatus {
            id: id.into(),
            events: Vec::new(),
            ban_score: 0,
            ban_until: None,
        }
    }

    /// Reconstruct a record from persisted parts.
    pub fn from_parts(
        id: impl Into<String>,
        ban_score: u32,
        ban_until: Option<DateTime<Utc>>,
        events: Vec<BanEvent>,
    ) -> Self {
        BanStatus {
            id: id.into(),
            events,
            ban_score,
            ban_until,
        }
    }

    /// The address or string-rendered peer identity this record is keyed by.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn ban_score(&self) -> u32 {
        self.ban_score
    }

    pub fn ban_until(&self) -> Option<DateTime<Utc>> {
        self.ban_until
    }

    pub fn events(&self) -> &[BanEvent] {
        &self.events
    }

    pub fn banned(&self, at: DateTime<Utc>) -> bool {
        matches!(self.ban_until, Some(until) if at < until)
    }

    /// Record a new event, bump the score, and recompute the ban expiry
    /// from the escalation table. Caller must hold the registry lock.
    pub(crate) fn add_event(&mut self, event: BanEvent) {
        let when = event.when;
        self.events.push(event);
        self.ban_score += 1;
        self.update_stats(when);
    }

    fn update_stats(&mut self, now: DateTime<Utc>) {
        let idx = ((self.ban_score - 1) as usize).min(BAN_DURATION_SECS.len() - 1);
        let secs = BAN_DURATION_SECS[idx];
        self.ban_until = if secs == 0 {
            None
        } else {
            Some(now + Duration::seconds(secs))
        };
    }

    /// Drop events at or before `cutoff` from the front of the history.
    /// Historical housekeeping only: neither the score nor the ban expiry
    /// changes. Returns the number of events removed.
    pub(crate) fn prune_old_events(&mut self, cutoff: DateTime<Utc>) -> usize {
        let keep_from = self
            .events
            .iter()
            .position(|ev| ev.when > cutoff)
            .unwrap_or(self.events.len());
        self.events.drain(..keep_from);
        keep_from
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event_at(when: DateTime<Utc>, why: &str) -> BanEvent {
        BanEvent {
            when,
            why: why.to_string(),
        }
    }

    #[test]
    fn escalation_follows_the_duration_table() {
        let now = Utc::now();
        let mut status = BanStatus::new("203.0.113.9");

        // scores 1 and 2 map to zero duration: not banned yet
        status.add_event(event_at(now, "first"));
        assert_eq!(status.ban_score(), 1);
        assert!(status.ban_until().is_none());
        assert!(!status.banned(now));

        status.add_event(event_at(now, "second"));
        assert!(status.ban_until().is_none());

        // third event yields the first non-zero tier: one minute
        status.add_event(event_at(now, "third"));
        assert_eq!(status.ban_score(), 3);
        assert_eq!(status.ban_until(), Some(now + Duration::seconds(60)));
        assert!(status.banned(now));
        assert!(!status.banned(now + Duration::seconds(61)));
    }

    #[test]
    fn escalation_clamps_to_last_tier() {
        let now = Utc::now();
        let mut status = BanStatus::new("peer");
        for i in 0..20 {
            status.add_event(event_at(now, &format!("ev{i}")));
        }
        assert_eq!(status.ban_score(), 20);
        let last = BAN_DURATION_SECS[BAN_DURATION_SECS.len() - 1];
        assert_eq!(status.ban_until(), Some(now + Duration::seconds(last)));
    }

    #[test]
    fn ban_until_matches_table_for_each_score() {
        let now = Utc::now();
        let mut status = BanStatus::new("x");
        for n in 1..=BAN_DURATION_SECS.len() as u32 {
            status.add_event(event_at(now, "ev"));
            let secs = BAN_DURATION_SECS[(n as usize - 1).min(BAN_DURATION_SECS.len() - 1)];
            let expected = if secs == 0 {
                None
            } else {
                Some(now + Duration::seconds(secs))
            };
            assert_eq!(status.ban_until(), expected, "score {n}");
        }
    }

    #[test]
    fn pruning_drops_leading_events_only() {
        let base = Utc::now();
        let mut status = BanStatus::new("203.0.113.9");
        for i in 0..5 {
            status.add_event(event_at(base + Duration::days(i), &format!("ev{i}")));
        }
        let removed = status.prune_old_events(base + Duration::days(2));
        assert_eq!(removed, 3);
        assert_eq!(status.events().len(), 2);
        assert_eq!(status.events()[0].why, "ev3");

        // score and expiry untouched: pruning never un-bans
        assert_eq!(status.ban_score(), 5);
        assert!(status.ban_until().is_some());
    }

    #[test]
    fn pruning_empty_history_is_a_noop() {
        let mut status = BanStatus::new("x");
        assert_eq!(status.prune_old_events(Utc::now()), 0);
    }
}
