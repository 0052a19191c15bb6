//! System prompts for each review role, and user-prompt rendering.
//!
//! Bump `PROMPT_VERSION` whenever a preamble changes; it is logged with every
//! invocation so a response can be traced back to the prompt that produced it.

use flatline_coordination::consensus::Candidate;
use flatline_coordination::{ReviewRequest, ReviewRole};

pub const PROMPT_VERSION: &str = "1.2.0";

pub const REVIEWER_PREAMBLE: &str = "\
You are one of several independent reviewers improving a planning document. \
You do not see the other reviewers' output.

Propose concrete improvements. For each, give the location (a heading or a short \
quote), a one-sentence description, an optional edit, and a score from 0 to 1000 \
for how much the document would improve if it were applied. Use the edit form \
{\"anchor\": <exact text currently in the document>, \"replacement\": <new text>}; \
an empty anchor appends the replacement to the end of the document. Anchors must \
be copied verbatim from the document. Mark purely positive observations with \
\"praise\": true and no edit.

Respond with JSON only:
{\"findings\": [{\"location\": \"...\", \"description\": \"...\", \
\"edit\": {\"anchor\": \"...\", \"replacement\": \"...\"}, \"score\": 0, \"praise\": false}], \
\"rationale\": \"...\"}";

pub const SKEPTIC_PREAMBLE: &str = "\
You are a skeptic reviewing a planning document. Look for problems that would make \
the plan fail: contradictions, missing requirements, unsafe assumptions, security or \
data-loss risks. Do not propose style improvements.

Score each concern from 0 to 1000 by how seriously it endangers the plan. Scores \
above 700 block automated changes, so reserve them for real blockers.

Respond with JSON only:
{\"concerns\": [{\"location\": \"...\", \"description\": \"...\", \"score\": 0}], \
\"rationale\": \"...\"}";

pub const SCORER_PREAMBLE: &str = "\
You are scoring improvements proposed by other reviewers of a planning document. \
For each proposal, judge how much the document would improve if it were applied, \
from 0 to 1000. Refer to proposals by their key exactly as given.

Respond with JSON only:
{\"scores\": [{\"key\": \"...\", \"score\": 0}]}";

pub fn preamble(role: ReviewRole) -> &'static str {
    match role {
        ReviewRole::Reviewer => REVIEWER_PREAMBLE,
        ReviewRole::Skeptic => SKEPTIC_PREAMBLE,
        ReviewRole::Scorer => SCORER_PREAMBLE,
    }
}

/// Build the user prompt. For `Scorer` requests the prior findings carry
/// the proposal lines to score (see [`proposal_line`]).
pub fn render(request: &ReviewRequest) -> String {
    let mut prompt = format!(
        "Document: {}\n\n<document>\n{}\n</document>\n",
        request.target(),
        request.content()
    );
    let prior = request.prior_findings();
    if prior.is_empty() {
        return prompt;
    }
    let heading = match request.role() {
        ReviewRole::Scorer => "Proposals to score",
        _ => "Findings from the previous iteration (do not repeat ones that were applied)",
    };
    prompt.push_str(&format!("\n{heading}:\n"));
    for line in prior {
        prompt.push_str("- ");
        prompt.push_str(line);
        prompt.push('\n');
    }
    prompt
}

/// One scoreable proposal, keyed by its short proposal key.
pub fn proposal_line(candidate: &Candidate) -> String {
    let mut line = format!(
        "[{}] {}: {}",
        candidate.key.short(),
        candidate.location,
        candidate.description
    );
    if let Some(edit) = &candidate.edit {
        line.push_str(&format!(
            " (replace {:?} with {:?})",
            edit.anchor, edit.replacement
        ));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use flatline_coordination::consensus::ProposalKey;

    #[test]
    fn test_render_without_prior() {
        let req = ReviewRequest::new("prd.md", "# Goals\n", ReviewRole::Reviewer);
        let prompt = render(&req);
        assert!(prompt.contains("<document>\n# Goals\n"));
        assert!(!prompt.contains("previous iteration"));
    }

    #[test]
    fn test_scorer_prompt_lists_proposals() {
        let candidate = Candidate {
            key: ProposalKey::compute("## Goals", "add a metric", None),
            location: "## Goals".into(),
            description: "add a metric".into(),
            edit: None,
            praise: false,
            scores: vec![],
            skeptic: None,
        };
        let line = proposal_line(&candidate);
        assert!(line.starts_with(&format!("[{}]", candidate.key.short())));

        let req = ReviewRequest::new("prd.md", "x", ReviewRole::Scorer)
            .with_prior_findings(vec![line.clone()]);
        let prompt = render(&req);
        assert!(prompt.contains("Proposals to score"));
        assert!(prompt.contains(&line));
    }
}
