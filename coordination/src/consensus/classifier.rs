//! Consensus classifier: map a finding's scores onto exactly one category.
//!
//! Evaluation order (first match wins):
//!
//! 1. `Blocker`: skeptic concern > `blocker`
//! 2. `Praise`: reviewer flagged the observation as purely positive
//! 3. `LowValue`: no primary scores survived (every reviewer failed)
//! 4. `HighConsensus`: at least `min_votes` scores and all > `high`
//! 5. `Disputed`: max − min > `dispute_delta`
//! 6. `LowValue`: all scores < `low`
//! 7. `Disputed`: anything else (mid-band agreement, lone votes); surfaced
//!    for a human rather than integrated
//!
//! Missing votes are excluded, never imputed, so an under-populated score
//! vector can not reach `HighConsensus`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::review::MAX_SCORE;

/// Category assigned to a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Category {
    HighConsensus,
    Disputed,
    LowValue,
    Blocker,
    Praise,
}

impl Category {
    /// Contribution of one finding of this category to the iteration
    /// severity score.
    pub fn severity_weight(self) -> u32 {
        match self {
            Self::Blocker => 10,
            Self::HighConsensus => 5,
            Self::Disputed => 2,
            Self::LowValue => 1,
            Self::Praise => 0,
        }
    }

    /// Whether the pipeline may apply findings of this category.
    pub fn is_auto_integrable(self) -> bool {
        matches!(self, Self::HighConsensus)
    }

    /// Whether a recurrence of this category counts toward the same-issue
    /// breaker. Praise and low-value noise never trip it.
    pub fn counts_toward_recurrence(self) -> bool {
        matches!(self, Self::HighConsensus | Self::Disputed | Self::Blocker)
    }

    pub const ALL: [Category; 5] = [
        Self::HighConsensus,
        Self::Disputed,
        Self::LowValue,
        Self::Blocker,
        Self::Praise,
    ];
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HighConsensus => write!(f, "HIGH_CONSENSUS"),
            Self::Disputed => write!(f, "DISPUTED"),
            Self::LowValue => write!(f, "LOW_VALUE"),
            Self::Blocker => write!(f, "BLOCKER"),
            Self::Praise => write!(f, "PRAISE"),
        }
    }
}

/// Classification thresholds on the 0–1000 scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    /// Every primary score must exceed this for `HighConsensus`.
    pub high: u32,
    /// Every primary score below this is `LowValue`.
    pub low: u32,
    /// Spread above this is `Disputed`.
    pub dispute_delta: u32,
    /// Skeptic concern above this is a `Blocker`.
    pub blocker: u32,
    /// Minimum number of primary scores for `HighConsensus`.
    pub min_votes: usize,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            high: 700,
            low: 400,
            dispute_delta: 300,
            blocker: 700,
            min_votes: 2,
        }
    }
}

/// Invalid threshold combination.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ThresholdError {
    #[error("threshold {name}={value} exceeds the 0-1000 score scale")]
    OutOfRange { name: &'static str, value: u32 },
    #[error("low threshold {low} must not exceed high threshold {high}")]
    Inverted { low: u32, high: u32 },
    #[error("min_votes must be at least 2, got {0}")]
    TooFewVotes(usize),
}

impl Thresholds {
    pub fn validate(&self) -> Result<(), ThresholdError> {
        for (name, value) in [
            ("high", self.high),
            ("low", self.low),
            ("dispute_delta", self.dispute_delta),
            ("blocker", self.blocker),
        ] {
            if value > MAX_SCORE {
                return Err(ThresholdError::OutOfRange { name, value });
            }
        }
        if self.low > self.high {
            return Err(ThresholdError::Inverted {
                low: self.low,
                high: self.high,
            });
        }
        if self.min_votes < 2 {
            return Err(ThresholdError::TooFewVotes(self.min_votes));
        }
        Ok(())
    }

    /// Apply per-run overrides on top of these thresholds.
    pub fn with_override(mut self, o: &ThresholdOverride) -> Self {
        if let Some(v) = o.high {
            self.high = v;
        }
        if let Some(v) = o.low {
            self.low = v;
        }
        if let Some(v) = o.dispute_delta {
            self.dispute_delta = v;
        }
        if let Some(v) = o.blocker {
            self.blocker = v;
        }
        if let Some(v) = o.min_votes {
            self.min_votes = v;
        }
        self
    }
}

/// Partial thresholds supplied by the caller of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThresholdOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub high: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub low: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dispute_delta: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocker: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_votes: Option<usize>,
}

impl ThresholdOverride {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Classify one finding.
///
/// `scores` holds the surviving primary reviewer scores (any length),
/// `skeptic` the highest paired skeptic concern if any skeptic answered.
pub fn classify(scores: &[u32], skeptic: Option<u32>, praise: bool, t: &Thresholds) -> Category {
    if skeptic.is_some_and(|s| s.min(MAX_SCORE) > t.blocker) {
        return Category::Blocker;
    }
    if praise {
        return Category::Praise;
    }

    let mut clamped = scores.iter().map(|s| (*s).min(MAX_SCORE));
    let Some(first) = clamped.next() else {
        return Category::LowValue;
    };
    let (min, max) = clamped.fold((first, first), |(lo, hi), s| (lo.min(s), hi.max(s)));

    if scores.len() >= t.min_votes && min > t.high {
        Category::HighConsensus
    } else if max - min > t.dispute_delta {
        Category::Disputed
    } else if max < t.low {
        Category::LowValue
    } else {
        Category::Disputed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t() -> Thresholds {
        Thresholds::default()
    }

    #[test]
    fn test_high_consensus() {
        assert_eq!(classify(&[850, 820], Some(50), false, &t()), Category::HighConsensus);
        assert_eq!(classify(&[701, 701, 999], None, false, &t()), Category::HighConsensus);
    }

    #[test]
    fn test_high_threshold_is_exclusive() {
        assert_eq!(classify(&[700, 900], None, false, &t()), Category::Disputed);
    }

    #[test]
    fn test_blocker_wins_over_everything() {
        for scores in [[850, 820], [100, 900], [10, 20], [500, 500]] {
            assert_eq!(classify(&scores, Some(701), false, &t()), Category::Blocker);
            assert_eq!(classify(&scores, Some(701), true, &t()), Category::Blocker);
        }
        assert_eq!(classify(&[], Some(1000), false, &t()), Category::Blocker);
    }

    #[test]
    fn test_skeptic_at_threshold_does_not_block() {
        assert_eq!(classify(&[850, 820], Some(700), false, &t()), Category::HighConsensus);
    }

    #[test]
    fn test_disputed_beats_low_value() {
        // 100 and 450: spread 350 > 300 and one score below 400.
        assert_eq!(classify(&[100, 450], None, false, &t()), Category::Disputed);
    }

    #[test]
    fn test_low_value() {
        assert_eq!(classify(&[100, 300], Some(200), false, &t()), Category::LowValue);
        assert_eq!(classify(&[399, 399], None, false, &t()), Category::LowValue);
    }

    #[test]
    fn test_mid_band_is_surfaced_as_disputed() {
        assert_eq!(classify(&[500, 600], None, false, &t()), Category::Disputed);
        assert_eq!(classify(&[400, 400], None, false, &t()), Category::Disputed);
    }

    #[test]
    fn test_single_vote_never_high_consensus() {
        assert_eq!(classify(&[990], None, false, &t()), Category::Disputed);
        assert_eq!(classify(&[200], None, false, &t()), Category::LowValue);
    }

    #[test]
    fn test_no_votes_is_low_value() {
        assert_eq!(classify(&[], None, false, &t()), Category::LowValue);
        assert_eq!(classify(&[], Some(300), false, &t()), Category::LowValue);
    }

    #[test]
    fn test_praise_has_zero_weight() {
        assert_eq!(classify(&[900, 900], None, true, &t()), Category::Praise);
        assert_eq!(Category::Praise.severity_weight(), 0);
        assert!(!Category::Praise.is_auto_integrable());
    }

    #[test]
    fn test_scores_above_scale_are_clamped() {
        assert_eq!(classify(&[5000, 800], None, false, &t()), Category::HighConsensus);
    }

    #[test]
    fn test_deterministic_over_grid() {
        let th = t();
        for a in (0..=1000).step_by(50) {
            for b in (0..=1000).step_by(50) {
                for s in [None, Some(0), Some(700), Some(701)] {
                    let first = classify(&[a, b], s, false, &th);
                    assert_eq!(first, classify(&[a, b], s, false, &th));
                    if s == Some(701) {
                        assert_eq!(first, Category::Blocker);
                    }
                }
            }
        }
    }

    #[test]
    fn test_override_applies_only_given_fields() {
        let o = ThresholdOverride {
            high: Some(800),
            ..Default::default()
        };
        let th = t().with_override(&o);
        assert_eq!(th.high, 800);
        assert_eq!(th.low, 400);
        assert_eq!(classify(&[850, 790], None, false, &th), Category::Disputed);
    }

    #[test]
    fn test_validate() {
        assert!(t().validate().is_ok());
        let inverted = Thresholds {
            low: 800,
            ..Default::default()
        };
        assert!(matches!(inverted.validate(), Err(ThresholdError::Inverted { .. })));
        let too_few = Thresholds {
            min_votes: 1,
            ..Default::default()
        };
        assert_eq!(too_few.validate(), Err(ThresholdError::TooFewVotes(1)));
        let out = Thresholds {
            blocker: 1001,
            ..Default::default()
        };
        assert!(matches!(out.validate(), Err(ThresholdError::OutOfRange { name: "blocker", .. })));
    }

    #[test]
    fn test_category_serializes_screaming() {
        assert_eq!(
            serde_json::to_string(&Category::HighConsensus).unwrap(),
            "\"HIGH_CONSENSUS\""
        );
    }
}
