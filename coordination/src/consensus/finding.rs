//! Finding identity and the classified finding record.

use serde::{Deserialize, Serialize};

use super::classifier::Category;
use crate::digest::ContentHash;
use crate::review::{ProposedEdit, ReviewRole};

/// Lowercase, collapse runs of whitespace, trim.
pub fn normalize(text: &str) -> String {
    text.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Normalized content of a proposal: the description plus its edit.
fn content_material(description: &str, edit: Option<&ProposedEdit>) -> String {
    let mut material = normalize(description);
    if let Some(edit) = edit {
        material.push('\u{1f}');
        material.push_str(&normalize(&edit.anchor));
        material.push('\u{1f}');
        material.push_str(&normalize(&edit.replacement));
    }
    material
}

/// Category-free key used to merge identical proposals and to address them
/// during cross-scoring, before a category exists.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProposalKey(String);

impl ProposalKey {
    pub fn compute(location: &str, description: &str, edit: Option<&ProposedEdit>) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(normalize(location).as_bytes());
        hasher.update(b"\x1e");
        hasher.update(content_material(description, edit).as_bytes());
        Self(hasher.finalize().to_hex().to_string())
    }

    /// Short label shown to scorers.
    pub fn short(&self) -> &str {
        &self.0[..12]
    }

    /// Whether a label returned by a scorer refers to this key.
    pub fn matches_label(&self, label: &str) -> bool {
        let label = label.trim().trim_matches(['[', ']']);
        label.len() >= 8 && self.0.starts_with(&label.to_lowercase())
    }
}

/// Stable identity of a finding: category + normalized location + content.
///
/// Used for deduplication, for the same-issue circuit breaker, and as the
/// record of what an integration manifest applied.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FindingId(String);

impl FindingId {
    pub fn compute(
        category: Category,
        location: &str,
        description: &str,
        edit: Option<&ProposedEdit>,
    ) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(category.to_string().as_bytes());
        hasher.update(b"\x1e");
        hasher.update(normalize(location).as_bytes());
        hasher.update(b"\x1e");
        hasher.update(content_material(description, edit).as_bytes());
        Self(hasher.finalize().to_hex().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl std::fmt::Display for FindingId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One vote on a proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotScore {
    pub slot: usize,
    /// `Reviewer` for the proposer's own score, `Scorer` for a peer vote.
    pub role: ReviewRole,
    pub score: u32,
}

/// A classified finding, valid against `baseline_hash` only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub id: FindingId,
    pub proposal_key: ProposalKey,
    pub category: Category,
    pub location: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edit: Option<ProposedEdit>,
    pub scores: Vec<SlotScore>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skeptic_score: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skeptic_note: Option<String>,
    /// Document hash the reviewers saw.
    pub baseline_hash: ContentHash,
}

impl Finding {
    pub fn primary_scores(&self) -> Vec<u32> {
        self.scores.iter().map(|s| s.score).collect()
    }

    /// One-line rendering used in prompts, logs, and reports.
    pub fn summary(&self) -> String {
        let scores = self
            .scores
            .iter()
            .map(|s| s.score.to_string())
            .collect::<Vec<_>>()
            .join("/");
        let skeptic = self
            .skeptic_score
            .map(|s| format!(" skeptic={s}"))
            .unwrap_or_default();
        format!(
            "[{}] {}: {} (scores={}{}, id={})",
            self.category,
            self.location,
            self.description,
            if scores.is_empty() { "-" } else { scores.as_str() },
            skeptic,
            self.id.short()
        )
    }
}
