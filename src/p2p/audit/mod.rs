//! Peer audit subsystem
//!
//! Penalty scoring with exponential decay, per-peer auditors that flag
//! threshold-exceeding peers, and the process-wide blacklist that turns
//! repeated misbehavior into escalating bans.

use std::fmt;

pub mod auditor;
pub mod banstatus;
pub mod blacklist;
pub mod decay;

use crate::p2p::block_receiver::ChunkError;

/// Score sum above which a peer is flagged and disconnected.
pub const DEFAULT_PEER_EXCEED_THRESHOLD: f64 = 100_000.0;

/// Mean lifetime of the short-term decaying score, in seconds.
pub const SHORT_TERM_MLT: u32 = 30;
/// Mean lifetime of the long-term decaying score, in seconds.
pub const LONG_TERM_MLT: u32 = 900;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PenaltyCategory {
    ShortTerm,
    LongTerm,
    Permanent,
}

impl fmt::Display for PenaltyCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PenaltyCategory::ShortTerm => "short_term",
            PenaltyCategory::LongTerm => "long_term",
            PenaltyCategory::Permanent => "permanent",
        };
        f.write_str(name)
    }
}

/// A single penalty: which score bucket it lands in and how much.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Penalty {
    pub category: PenaltyCategory,
    pub score: f64,
}

impl Penalty {
    pub const NONE: Penalty = Penalty {
        category: PenaltyCategory::Permanent,
        score: 0.0,
    };
    pub const TINY: Penalty = Penalty {
        category: PenaltyCategory::ShortTerm,
        score: 100.0,
    };
    pub const SMALL: Penalty = Penalty {
        category: PenaltyCategory::ShortTerm,
        score: 1000.0,
    };
    pub const NORMAL: Penalty = Penalty {
        category: PenaltyCategory::LongTerm,
        score: 10_000.0,
    };
    pub const BIG: Penalty = Penalty {
        category: PenaltyCategory::Permanent,
        score: 50_000.0,
    };
    pub const SEVERE: Penalty = Penalty {
        category: PenaltyCategory::Permanent,
        score: 100_001.0,
    };
}

impl fmt::Display for Penalty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.category, self.score)
    }
}

/// Closed classification of how much a peer is to blame for an error.
/// Built once; dispatch is an explicit lookup, not runtime type inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlameKind {
    /// Verification or signature failure; the peer fabricated data.
    Verification,
    /// Structural or format violation of the protocol.
    Format,
    /// Business-rule violation (insufficient balance, nonce reuse, ...).
    BusinessRule,
    /// Plausible concurrent race between honest peers.
    Race,
    /// Harmless noise; still worth a nudge.
    Benign,
    /// Not attributable to the peer.
    Unclassified,
}

impl BlameKind {
    pub const ALL: [BlameKind; 6] = [
        BlameKind::Verification,
        BlameKind::Format,
        BlameKind::BusinessRule,
        BlameKind::Race,
        BlameKind::Benign,
        BlameKind::Unclassified,
    ];
}

/// Fixed blame-to-severity lookup.
pub fn penalty_for(kind: BlameKind) -> Penalty {
    match kind {
        BlameKind::Verification => Penalty::SEVERE,
        BlameKind::Format => Penalty::BIG,
        BlameKind::BusinessRule => Penalty::NORMAL,
        BlameKind::Race => Penalty::SMALL,
        BlameKind::Benign => Penalty::TINY,
        BlameKind::Unclassified => Penalty::NONE,
    }
}

impl ChunkError {
    /// How a block-chunk failure reflects on the responding peer.
    pub fn blame(self) -> BlameKind {
        match self {
            // wrong or excess content is a structural violation
            ChunkError::UnexpectedBlock | ChunkError::TooManyBlocks | ChunkError::TooBigBlock => {
                BlameKind::Format
            }
            // short responses can happen when the peer pruned mid-request
            ChunkError::MissingHash | ChunkError::TooFewBlocks => BlameKind::Race,
            // an honest error answer costs almost nothing
            ChunkError::RemotePeerFail => BlameKind::Benign,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_is_complete_and_fixed() {
        // every blame kind maps to exactly the documented severity
        for kind in BlameKind::ALL {
            let penalty = penalty_for(kind);
            let expected = match kind {
                BlameKind::Verification => Penalty::SEVERE,
                BlameKind::Format => Penalty::BIG,
                BlameKind::BusinessRule => Penalty::NORMAL,
                BlameKind::Race => Penalty::SMALL,
                BlameKind::Benign => Penalty::TINY,
                BlameKind::Unclassified => Penalty::NONE,
            };
            assert_eq!(penalty, expected, "blame {:?}", kind);
        }
    }

    #[test]
    fn severities_follow_the_defined_scale() {
        assert_eq!(Penalty::TINY.score, 100.0);
        assert_eq!(Penalty::SMALL.score, 1000.0);
        assert_eq!(Penalty::NORMAL.score, 10_000.0);
        assert_eq!(Penalty::BIG.score, 50_000.0);
        assert_eq!(Penalty::SEVERE.score, 100_001.0);
        assert!(Penalty::SEVERE.score > DEFAULT_PEER_EXCEED_THRESHOLD);
    }

    #[test]
    fn chunk_errors_all_classify() {
        let errors = [
            ChunkError::RemotePeerFail,
            ChunkError::MissingHash,
            ChunkError::UnexpectedBlock,
            ChunkError::TooFewBlocks,
            ChunkError::TooManyBlocks,
            ChunkError::TooBigBlock,
        ];
        for err in errors {
            // none of the receiver faults should go fully unpunished except
            // by explicit choice
            let penalty = penalty_for(err.blame());
            assert!(penalty.score > 0.0, "{err} classified as none");
        }
    }
}
