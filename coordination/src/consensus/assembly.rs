//! Candidate assembly: merge reviewer proposals, peer votes, and skeptic
//! concerns into classified findings.

use std::collections::HashMap;

use super::classifier::{classify, Thresholds};
use super::finding::{normalize, Finding, FindingId, ProposalKey, SlotScore};
use crate::digest::ContentHash;
use crate::review::{PeerScore, ProposedEdit, ReviewResult, ReviewRole};

/// A proposal that has not been classified yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub key: ProposalKey,
    pub location: String,
    pub description: String,
    pub edit: Option<ProposedEdit>,
    /// Praise only if every proposer flagged it as praise.
    pub praise: bool,
    pub scores: Vec<SlotScore>,
    pub skeptic: Option<(u32, String)>,
}

impl Candidate {
    fn has_vote_from(&self, slot: usize) -> bool {
        self.scores.iter().any(|s| s.slot == slot)
    }

    fn raise_concern(&mut self, score: u32, note: &str) {
        match &self.skeptic {
            Some((current, _)) if *current >= score => {}
            _ => self.skeptic = Some((score, note.to_string())),
        }
    }
}

/// Merge primary reviewer proposals. Identical proposals (same normalized
/// location and content) from different slots collapse into one candidate
/// carrying each slot's score once.
pub fn collect_proposals(reviews: &[ReviewResult]) -> Vec<Candidate> {
    let mut order: Vec<ProposalKey> = Vec::new();
    let mut by_key: HashMap<ProposalKey, Candidate> = HashMap::new();

    for review in reviews.iter().filter(|r| r.role == ReviewRole::Reviewer) {
        let Some(payload) = review.payload() else {
            continue;
        };
        for proposed in &payload.findings {
            let key = ProposalKey::compute(
                &proposed.location,
                &proposed.description,
                proposed.edit.as_ref(),
            );
            let candidate = by_key.entry(key.clone()).or_insert_with(|| {
                order.push(key.clone());
                Candidate {
                    key,
                    location: proposed.location.trim().to_string(),
                    description: proposed.description.trim().to_string(),
                    edit: proposed.edit.clone(),
                    praise: true,
                    scores: Vec::new(),
                    skeptic: None,
                }
            });
            candidate.praise &= proposed.praise;
            if !candidate.has_vote_from(review.slot) {
                candidate.scores.push(SlotScore {
                    slot: review.slot,
                    role: ReviewRole::Reviewer,
                    score: proposed.score,
                });
            }
        }
    }

    order
        .into_iter()
        .filter_map(|key| by_key.remove(&key))
        .collect()
}

/// Record one scorer's cross-scoring votes. A slot never votes twice on the
/// same candidate, so a reviewer scoring its own proposal is ignored.
pub fn apply_peer_scores(candidates: &mut [Candidate], slot: usize, votes: &[PeerScore]) {
    for vote in votes {
        if let Some(candidate) = candidates
            .iter_mut()
            .find(|c| c.key.matches_label(&vote.key))
        {
            if !candidate.has_vote_from(slot) {
                candidate.scores.push(SlotScore {
                    slot,
                    role: ReviewRole::Scorer,
                    score: vote.score,
                });
            }
        }
    }
}

/// Attach skeptic concerns by normalized location (highest concern wins).
/// Concerns about locations no reviewer touched become standalone candidates
/// with no primary votes, so only a blocking concern can surface them.
pub fn attach_concerns(candidates: &mut Vec<Candidate>, reviews: &[ReviewResult]) {
    for review in reviews.iter().filter(|r| r.role == ReviewRole::Skeptic) {
        let Some(payload) = review.payload() else {
            continue;
        };
        for concern in &payload.concerns {
            let location = normalize(&concern.location);
            let mut matched = false;
            for candidate in candidates
                .iter_mut()
                .filter(|c| normalize(&c.location) == location)
            {
                candidate.raise_concern(concern.score, &concern.description);
                matched = true;
            }
            if matched {
                continue;
            }

            let key = ProposalKey::compute(&concern.location, &concern.description, None);
            if let Some(existing) = candidates.iter_mut().find(|c| c.key == key) {
                existing.raise_concern(concern.score, &concern.description);
            } else {
                candidates.push(Candidate {
                    key,
                    location: concern.location.trim().to_string(),
                    description: concern.description.trim().to_string(),
                    edit: None,
                    praise: false,
                    scores: Vec::new(),
                    skeptic: Some((concern.score, concern.description.trim().to_string())),
                });
            }
        }
    }
}

/// Classify every candidate against the document hash the reviewers saw.
pub fn finalize(
    candidates: Vec<Candidate>,
    thresholds: &Thresholds,
    baseline: &ContentHash,
) -> Vec<Finding> {
    candidates
        .into_iter()
        .map(|c| {
            let votes: Vec<u32> = c.scores.iter().map(|s| s.score).collect();
            let skeptic_score = c.skeptic.as_ref().map(|(s, _)| *s);
            let category = classify(&votes, skeptic_score, c.praise, thresholds);
            Finding {
                id: FindingId::compute(category, &c.location, &c.description, c.edit.as_ref()),
                proposal_key: c.key,
                category,
                location: c.location,
                description: c.description,
                edit: c.edit,
                scores: c.scores,
                skeptic_score,
                skeptic_note: c.skeptic.map(|(_, note)| note),
                baseline_hash: baseline.clone(),
            }
        })
        .collect()
}

/// One-shot assembly over every result of an iteration.
pub fn assemble(
    reviews: &[ReviewResult],
    cross_scores: &[ReviewResult],
    thresholds: &Thresholds,
    baseline: &ContentHash,
) -> Vec<Finding> {
    let mut candidates = collect_proposals(reviews);
    for result in cross_scores {
        if let Some(payload) = result.payload() {
            apply_peer_scores(&mut candidates, result.slot, &payload.scores);
        }
    }
    attach_concerns(&mut candidates, reviews);
    finalize(candidates, thresholds, baseline)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::Category;
    use crate::review::{
        Concern, InvocationError, InvocationErrorKind, ProposedFinding, ReviewOutcome,
        ReviewPayload,
    };

    fn ok(role: ReviewRole, slot: usize, payload: ReviewPayload) -> ReviewResult {
        ReviewResult {
            role,
            slot,
            backend: format!("b{slot}"),
            outcome: ReviewOutcome::Completed { payload },
            latency_ms: 1,
            attempts: 1,
            usage: Default::default(),
            cost_micros: 0,
        }
    }

    fn failed(role: ReviewRole, slot: usize) -> ReviewResult {
        ReviewResult {
            role,
            slot,
            backend: format!("b{slot}"),
            outcome: ReviewOutcome::Failed {
                error: InvocationError::new(InvocationErrorKind::Timeout, "slow"),
            },
            latency_ms: 1,
            attempts: 3,
            usage: Default::default(),
            cost_micros: 0,
        }
    }

    fn proposal(location: &str, description: &str, score: u32) -> ProposedFinding {
        ProposedFinding {
            location: location.into(),
            description: description.into(),
            edit: None,
            score,
            praise: false,
        }
    }

    fn reviewer(slot: usize, findings: Vec<ProposedFinding>) -> ReviewResult {
        ok(
            ReviewRole::Reviewer,
            slot,
            ReviewPayload {
                findings,
                ..Default::default()
            },
        )
    }

    fn skeptic(slot: usize, concerns: Vec<Concern>) -> ReviewResult {
        ok(
            ReviewRole::Skeptic,
            slot,
            ReviewPayload {
                concerns,
                ..Default::default()
            },
        )
    }

    fn baseline() -> ContentHash {
        ContentHash::of(b"doc")
    }

    #[test]
    fn test_identical_proposals_merge() {
        let reviews = vec![
            reviewer(0, vec![proposal("## Goals", "Add a metric", 850)]),
            reviewer(1, vec![proposal("## goals", "add a  metric", 820)]),
            skeptic(0, vec![Concern {
                location: "## Goals".into(),
                description: "minor".into(),
                score: 50,
            }]),
        ];
        let findings = assemble(&reviews, &[], &Thresholds::default(), &baseline());
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].category, Category::HighConsensus);
        assert_eq!(findings[0].primary_scores(), vec![850, 820]);
        assert_eq!(findings[0].skeptic_score, Some(50));
    }

    #[test]
    fn test_peer_scores_complete_the_pair() {
        let reviews = vec![
            reviewer(0, vec![proposal("intro", "clarify scope", 900)]),
            reviewer(1, vec![]),
        ];
        let mut candidates = collect_proposals(&reviews);
        let label = candidates[0].key.short().to_string();
        // Slot 0 scoring its own proposal is ignored.
        apply_peer_scores(&mut candidates, 0, &[PeerScore { key: label.clone(), score: 100 }]);
        apply_peer_scores(&mut candidates, 1, &[PeerScore { key: label, score: 760 }]);
        let findings = finalize(candidates, &Thresholds::default(), &baseline());
        assert_eq!(findings[0].primary_scores(), vec![900, 760]);
        assert_eq!(findings[0].category, Category::HighConsensus);
    }

    #[test]
    fn test_failed_reviewer_leaves_single_vote() {
        let reviews = vec![
            reviewer(0, vec![proposal("intro", "clarify scope", 950)]),
            failed(ReviewRole::Reviewer, 1),
        ];
        let findings = assemble(&reviews, &[], &Thresholds::default(), &baseline());
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].category, Category::Disputed);
    }

    #[test]
    fn test_unmatched_concern_becomes_candidate() {
        let reviews = vec![
            reviewer(0, vec![proposal("intro", "clarify", 500)]),
            skeptic(0, vec![Concern {
                location: "## Security".into(),
                description: "no threat model".into(),
                score: 910,
            }]),
            skeptic(1, vec![Concern {
                location: "## Security".into(),
                description: "no threat model".into(),
                score: 880,
            }]),
        ];
        let findings = assemble(&reviews, &[], &Thresholds::default(), &baseline());
        assert_eq!(findings.len(), 2);
        let blocker = findings.iter().find(|f| f.location == "## Security").unwrap();
        assert_eq!(blocker.category, Category::Blocker);
        assert_eq!(blocker.skeptic_score, Some(910));
        assert!(blocker.scores.is_empty());
    }

    #[test]
    fn test_highest_concern_wins() {
        let reviews = vec![
            reviewer(0, vec![proposal("intro", "clarify", 800)]),
            reviewer(1, vec![proposal("intro", "clarify", 810)]),
            skeptic(0, vec![Concern {
                location: "intro".into(),
                description: "fine".into(),
                score: 100,
            }]),
            skeptic(1, vec![Concern {
                location: "INTRO".into(),
                description: "breaks the API contract".into(),
                score: 750,
            }]),
        ];
        let findings = assemble(&reviews, &[], &Thresholds::default(), &baseline());
        assert_eq!(findings[0].category, Category::Blocker);
        assert_eq!(findings[0].skeptic_note.as_deref(), Some("breaks the API contract"));
    }

    #[test]
    fn test_praise_requires_all_proposers() {
        let mut a = proposal("intro", "well written", 900);
        a.praise = true;
        let b = proposal("intro", "well written", 900);
        let findings = assemble(
            &[reviewer(0, vec![a.clone()]), reviewer(1, vec![b])],
            &[],
            &Thresholds::default(),
            &baseline(),
        );
        assert_eq!(findings[0].category, Category::HighConsensus);

        let findings = assemble(
            &[reviewer(0, vec![a.clone()]), reviewer(1, vec![a])],
            &[],
            &Thresholds::default(),
            &baseline(),
        );
        assert_eq!(findings[0].category, Category::Praise);
    }

    #[test]
    fn test_findings_carry_baseline() {
        let findings = assemble(
            &[reviewer(0, vec![proposal("a", "b", 10)])],
            &[],
            &Thresholds::default(),
            &baseline(),
        );
        assert_eq!(findings[0].baseline_hash, baseline());
        assert_eq!(findings[0].category, Category::LowValue);
    }
}
