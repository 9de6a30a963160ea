//! Per-peer penalty auditors
//!
//! One auditor per active peer session, owned by that session and discarded
//! on disconnect. Scores land in three buckets: short-term and long-term
//! decaying values plus a permanent accumulator. The first time the summed
//! score crosses the threshold, the auditor flips to the exceeded state
//! (one-way) and notifies its exceed listener exactly once.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::p2p::audit::decay::{DecayCache, ExponentDecayValue};
use crate::p2p::audit::{
    Penalty, PenaltyCategory, DEFAULT_PEER_EXCEED_THRESHOLD, LONG_TERM_MLT, SHORT_TERM_MLT,
};
use crate::p2p::message::PeerId;

/// Score keeper for a single peer session.
///
/// `add_penalty`/`add_score` return whether the peer is still fine (not
/// exceeded) as of the call.
pub trait PeerAuditor: Send + Sync {
    fn peer_id(&self) -> PeerId;
    fn ip_address(&self) -> &str;

    fn add_penalty(&self, penalty: Penalty) -> bool;
    fn add_score(&self, category: PenaltyCategory, score: f64) -> bool;

    fn threshold(&self) -> f64;
    /// Score of one category, projected to now.
    fn current_score(&self, category: PenaltyCategory) -> f64;
    /// Sum of all three categories, projected to now.
    fn score_sum(&self) -> f64;
}

/// Notified exactly once, the first time a peer's score crosses threshold.
pub trait ExceedListener: Send + Sync {
    fn on_exceed(&self, auditor: &dyn PeerAuditor, cause: &str);
}

struct AuditorState {
    exceed: bool,
    perm_score: f64,
    long_score: ExponentDecayValue,
    short_score: ExponentDecayValue,
}

pub struct DefaultAuditor {
    peer_id: PeerId,
    ip_address: String,
    threshold: f64,
    exceed_listener: Arc<dyn ExceedListener>,
    state: Mutex<AuditorState>,
}

impl DefaultAuditor {
    pub fn new(
        peer_id: PeerId,
        ip_address: String,
        threshold: f64,
        cache: &DecayCache,
        exceed_listener: Arc<dyn ExceedListener>,
    ) -> Self {
        DefaultAuditor {
            peer_id,
            ip_address,
            threshold,
            exceed_listener,
            state: Mutex::new(AuditorState {
                exceed: false,
                perm_score: 0.0,
                long_score: ExponentDecayValue::new(cache, LONG_TERM_MLT),
                short_score: ExponentDecayValue::new(cache, SHORT_TERM_MLT),
            }),
        }
    }

    fn sum_locked(state: &mut AuditorState, now: i64) -> f64 {
        state.perm_score + state.long_score.value(now) + state.short_score.value(now)
    }
}

impl PeerAuditor for DefaultAuditor {
    fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    fn ip_address(&self) -> &str {
        &self.ip_address
    }

    fn add_penalty(&self, penalty: Penalty) -> bool {
        self.add_score(penalty.category, penalty.score)
    }

    fn add_score(&self, category: PenaltyCategory, score: f64) -> bool {
        let now = chrono::Utc::now().timestamp();
        let exceeded_now = {
            let mut state = self.state.lock();
            if state.exceed {
                return false;
            }
            match category {
                PenaltyCategory::ShortTerm => state.short_score.add_value(now, score),
                PenaltyCategory::LongTerm => state.long_score.add_value(now, score),
                PenaltyCategory::Permanent => state.perm_score += score,
            }
            let sum = Self::sum_locked(&mut state, now);
            if sum > self.threshold {
                state.exceed = true;
                true
            } else {
                false
            }
        };
        if exceeded_now {
            debug!(
                target: "lumen_node::p2p::audit",
                "[AUDIT] peer {} exceeded threshold {} on {} penalty",
                self.peer_id.short(),
                self.threshold,
                category
            );
            // listener runs outside the state lock
            self.exceed_listener.on_exceed(self, &category.to_string());
            return false;
        }
        true
    }

    fn threshold(&self) -> f64 {
        self.threshold
    }

    fn current_score(&self, category: PenaltyCategory) -> f64 {
        let now = chrono::Utc::now().timestamp();
        let mut state = self.state.lock();
        match category {
            PenaltyCategory::ShortTerm => state.short_score.value(now),
            PenaltyCategory::LongTerm => state.long_score.value(now),
            PenaltyCategory::Permanent => state.perm_score,
        }
    }

    fn score_sum(&self) -> f64 {
        let now = chrono::Utc::now().timestamp();
        let mut state = self.state.lock();
        Self::sum_locked(&mut state, now)
    }
}

/// Auditor variant that never penalizes; selected when runtime audit is off.
pub struct NoopAuditor {
    peer_id: PeerId,
    ip_address: String,
}

impl NoopAuditor {
    pub fn new(peer_id: PeerId, ip_address: String) -> Self {
        NoopAuditor {
            peer_id,
            ip_address,
        }
    }
}

impl PeerAuditor for NoopAuditor {
    fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    fn ip_address(&self) -> &str {
        &self.ip_address
    }

    fn add_penalty(&self, _penalty: Penalty) -> bool {
        true
    }

    fn add_score(&self, _category: PenaltyCategory, _score: f64) -> bool {
        true
    }

    fn threshold(&self) -> f64 {
        DEFAULT_PEER_EXCEED_THRESHOLD
    }

    fn current_score(&self, _category: PenaltyCategory) -> f64 {
        0.0
    }

    fn score_sum(&self) -> f64 {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::p2p::audit::decay::default_decay_cache;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingListener {
        calls: AtomicUsize,
    }

    impl CountingListener {
        fn new() -> Arc<Self> {
            Arc::new(CountingListener {
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl ExceedListener for CountingListener {
        fn on_exceed(&self, _auditor: &dyn PeerAuditor, _cause: &str) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn auditor_with(threshold: f64, listener: Arc<CountingListener>) -> DefaultAuditor {
        DefaultAuditor::new(
            PeerId([3u8; 32]),
            "203.0.113.7".to_string(),
            threshold,
            &default_decay_cache(),
            listener,
        )
    }

    #[test]
    fn below_threshold_never_triggers() {
        let listener = CountingListener::new();
        let auditor = auditor_with(10_000.0, listener.clone());

        for _ in 0..10 {
            assert!(auditor.add_score(PenaltyCategory::Permanent, 1000.0));
        }
        // sum is exactly at threshold, not over it
        assert_eq!(listener.calls.load(Ordering::SeqCst), 0);
        assert_eq!(auditor.current_score(PenaltyCategory::Permanent), 10_000.0);
    }

    #[test]
    fn crossing_threshold_triggers_exactly_once() {
        let listener = CountingListener::new();
        let auditor = auditor_with(10_000.0, listener.clone());

        for _ in 0..10 {
            assert!(auditor.add_score(PenaltyCategory::Permanent, 1000.0));
        }
        // the push over the line
        assert!(!auditor.add_score(PenaltyCategory::Permanent, 1000.0));
        assert_eq!(listener.calls.load(Ordering::SeqCst), 1);

        // sticky: every later call is rejected without re-notifying
        assert!(!auditor.add_score(PenaltyCategory::ShortTerm, 1.0));
        assert!(!auditor.add_penalty(Penalty::TINY));
        assert_eq!(listener.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn severe_penalty_exceeds_default_threshold_immediately() {
        let listener = CountingListener::new();
        let auditor = auditor_with(DEFAULT_PEER_EXCEED_THRESHOLD, listener.clone());

        assert!(!auditor.add_penalty(Penalty::SEVERE));
        assert_eq!(listener.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn score_sum_mixes_categories() {
        let listener = CountingListener::new();
        let auditor = auditor_with(1_000_000.0, listener);

        auditor.add_score(PenaltyCategory::Permanent, 100.0);
        auditor.add_score(PenaltyCategory::ShortTerm, 200.0);
        auditor.add_score(PenaltyCategory::LongTerm, 300.0);

        let sum = auditor.score_sum();
        // decaying categories may have shed a tiny amount already
        assert!(sum > 590.0 && sum <= 600.0, "sum {sum}");
    }

    #[test]
    fn noop_auditor_never_rejects() {
        let auditor = NoopAuditor::new(PeerId([1u8; 32]), "198.51.100.1".to_string());
        assert!(auditor.add_penalty(Penalty::SEVERE));
        assert!(auditor.add_score(PenaltyCategory::Permanent, f64::MAX / 2.0));
        assert_eq!(auditor.score_sum(), 0.0);
    }
}
