//! Consensus engine: clustering, voting and the final decision.
//!
//! Clustering groups equivalent findings across personas into key issues
//! (see `cluster`). Voting tallies weighted persona votes with a fail-safe
//! REJECT tie-break. Quick mode has no votes and synthesizes the decision
//! directly from the surfaced issues. Regardless of mode, the configurable
//! critical-override policy can force REJECT when a CRITICAL issue
//! surfaced; overrides are recorded as unresolved disagreements.

pub mod cluster;

use serde::{Deserialize, Serialize};

use crate::personas::Persona;
use crate::review::{
    ConsensusResult, Disagreement, Finding, KeyIssue, Severity, SuggestedFix, Vote, VoteDecision,
};

pub use cluster::{cluster_findings, description_overlap, DESCRIPTION_OVERLAP_THRESHOLD};

/// Tunable consensus policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusConfig {
    /// Minimum description overlap for two findings to cluster.
    pub similarity_threshold: f64,
    /// Whether a surfaced CRITICAL issue forces the decision to REJECT.
    pub critical_override: bool,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: DESCRIPTION_OVERLAP_THRESHOLD,
            critical_override: true,
        }
    }
}

/// Derives the collective verdict from a debate's raw material.
#[derive(Debug, Clone, Default)]
pub struct ConsensusEngine {
    config: ConsensusConfig,
}

impl ConsensusEngine {
    pub fn new(config: ConsensusConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    /// Clusters findings and keeps only the surfaced ("key") issues: at
    /// least two supporting personas, or a single supporter at CRITICAL.
    pub fn key_issues(&self, findings: &[Finding]) -> Vec<KeyIssue> {
        cluster::cluster_findings(findings, self.config.similarity_threshold)
            .into_iter()
            .filter(|issue| {
                issue.supporters.len() >= 2 || issue.severity == Severity::Critical
            })
            .collect()
    }

    /// Suggested fixes attached to findings that belong to surfaced issues.
    fn accepted_fixes(findings: &[Finding], key_issues: &[KeyIssue]) -> Vec<SuggestedFix> {
        let accepted_ids: std::collections::HashSet<_> = key_issues
            .iter()
            .flat_map(|issue| issue.findings.iter().copied())
            .collect();

        findings
            .iter()
            .filter(|f| accepted_ids.contains(&f.id))
            .filter_map(|f| f.fix.clone())
            .collect()
    }

    /// Full-mode consensus from cast votes.
    ///
    /// Each persona contributes one tally count; weighted APPROVE support is
    /// compared against weighted REJECT support. An exact nonzero tie is
    /// REJECT (fail-safe bias); zero support on both sides is ABSTAIN.
    pub fn from_votes(
        &self,
        personas: &[Persona],
        votes: &[Vote],
        findings: &[Finding],
    ) -> ConsensusResult {
        let key_issues = self.key_issues(findings);

        let mut tally = ConsensusResult::empty_tally();
        let mut approve_weight = 0.0;
        let mut reject_weight = 0.0;

        for vote in votes {
            *tally.entry(vote.decision).or_insert(0) += 1;

            let weight = personas
                .iter()
                .find(|p| p.id == vote.persona)
                .map(|p| p.weight)
                .unwrap_or(1.0);
            match vote.decision {
                VoteDecision::Approve => approve_weight += weight,
                VoteDecision::Reject => reject_weight += weight,
                VoteDecision::Abstain => {}
            }
        }

        let decision = if approve_weight == 0.0 && reject_weight == 0.0 {
            VoteDecision::Abstain
        } else if approve_weight > reject_weight {
            VoteDecision::Approve
        } else {
            VoteDecision::Reject
        };

        let mut disagreements: Vec<Disagreement> = votes
            .iter()
            .filter(|v| v.decision != decision && v.decision != VoteDecision::Abstain)
            .map(|v| Disagreement::DissentingVote {
                persona: v.persona.clone(),
                decision: v.decision,
                rationale: v.rationale.clone(),
            })
            .collect();

        let decision = self.apply_override(decision, &key_issues, &mut disagreements);
        let accepted_fixes = Self::accepted_fixes(findings, &key_issues);

        ConsensusResult {
            decision,
            tally,
            key_issues,
            accepted_fixes,
            disagreements,
        }
    }

    /// Quick-mode consensus: no votes exist, the decision is synthesized.
    ///
    /// REJECT when any surfaced issue is HIGH or CRITICAL, APPROVE when no
    /// findings were reported at all, ABSTAIN otherwise.
    pub fn synthetic(&self, findings: &[Finding]) -> ConsensusResult {
        let key_issues = self.key_issues(findings);

        let decision = if findings.is_empty() {
            VoteDecision::Approve
        } else if key_issues.iter().any(|k| k.severity >= Severity::High) {
            VoteDecision::Reject
        } else {
            VoteDecision::Abstain
        };

        let mut disagreements = Vec::new();
        let decision = self.apply_override(decision, &key_issues, &mut disagreements);
        let accepted_fixes = Self::accepted_fixes(findings, &key_issues);

        ConsensusResult {
            decision,
            tally: ConsensusResult::empty_tally(),
            key_issues,
            accepted_fixes,
            disagreements,
        }
    }

    /// Forces REJECT on a surfaced CRITICAL issue when the policy flag is
    /// on, recording the override only when it actually flips the decision.
    fn apply_override(
        &self,
        decision: VoteDecision,
        key_issues: &[KeyIssue],
        disagreements: &mut Vec<Disagreement>,
    ) -> VoteDecision {
        if !self.config.critical_override || decision == VoteDecision::Reject {
            return decision;
        }
        match key_issues
            .iter()
            .find(|issue| issue.severity == Severity::Critical)
        {
            Some(critical) => {
                tracing::info!(
                    issue = %critical.description,
                    overridden = %decision,
                    "Critical issue forces REJECT over raw decision"
                );
                disagreements.push(Disagreement::CriticalOverride {
                    issue: critical.description.clone(),
                });
                VoteDecision::Reject
            }
            None => decision,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::personas::builtin_personas;
    use crate::review::LineRange;

    fn vote(persona: &str, decision: VoteDecision) -> Vote {
        Vote {
            persona: persona.into(),
            decision,
            rationale: format!("{} says {}", persona, decision),
        }
    }

    fn critical_finding(persona: &str) -> Finding {
        Finding::new(persona, "eval of untrusted input", Severity::Critical, 0.95)
            .with_line(LineRange::single(1))
    }

    #[test]
    fn unanimous_approval_with_no_findings() {
        let engine = ConsensusEngine::default();
        let personas = builtin_personas();
        let votes: Vec<Vote> = ["security", "performance", "architecture", "pragmatic"]
            .iter()
            .map(|p| vote(p, VoteDecision::Approve))
            .collect();

        let result = engine.from_votes(&personas, &votes, &[]);

        assert_eq!(result.decision, VoteDecision::Approve);
        assert_eq!(result.tally[&VoteDecision::Approve], 4);
        assert_eq!(result.tally[&VoteDecision::Reject], 0);
        assert_eq!(result.tally[&VoteDecision::Abstain], 0);
        assert!(result.key_issues.is_empty());
        assert!(result.disagreements.is_empty());
    }

    #[test]
    fn exact_tie_is_rejected() {
        let engine = ConsensusEngine::default();
        let personas = builtin_personas();
        let votes = vec![
            vote("security", VoteDecision::Reject),
            vote("performance", VoteDecision::Reject),
            vote("architecture", VoteDecision::Approve),
            vote("pragmatic", VoteDecision::Approve),
        ];

        let result = engine.from_votes(&personas, &votes, &[]);
        assert_eq!(result.decision, VoteDecision::Reject);
    }

    #[test]
    fn abstains_count_in_tally_but_not_in_support() {
        let engine = ConsensusEngine::default();
        let personas = builtin_personas();
        let votes = vec![
            vote("security", VoteDecision::Approve),
            vote("performance", VoteDecision::Abstain),
            vote("architecture", VoteDecision::Abstain),
            vote("pragmatic", VoteDecision::Abstain),
        ];

        let result = engine.from_votes(&personas, &votes, &[]);
        assert_eq!(result.decision, VoteDecision::Approve);
        assert_eq!(result.tally[&VoteDecision::Abstain], 3);
        assert_eq!(result.tally.values().sum::<usize>(), 4);
    }

    #[test]
    fn all_abstain_yields_abstain_not_reject() {
        let engine = ConsensusEngine::default();
        let personas = builtin_personas();
        let votes = vec![
            vote("security", VoteDecision::Abstain),
            vote("pragmatic", VoteDecision::Abstain),
        ];

        let result = engine.from_votes(&personas, &votes, &[]);
        assert_eq!(result.decision, VoteDecision::Abstain);
    }

    #[test]
    fn vote_weight_shifts_the_majority() {
        let engine = ConsensusEngine::default();
        let personas = vec![
            Persona::new("security", "SecurityExpert", "p", ["s"]).with_weight(3.0),
            Persona::new("performance", "PerformanceEngineer", "p", ["p"]),
            Persona::new("pragmatic", "PragmaticDev", "p", ["d"]),
        ];
        let votes = vec![
            vote("security", VoteDecision::Reject),
            vote("performance", VoteDecision::Approve),
            vote("pragmatic", VoteDecision::Approve),
        ];

        let result = engine.from_votes(&personas, &votes, &[]);
        // 3.0 reject vs 2.0 approve despite the 2-1 head count.
        assert_eq!(result.decision, VoteDecision::Reject);
        assert_eq!(result.tally[&VoteDecision::Approve], 2);
    }

    #[test]
    fn critical_override_flips_approve_majority() {
        let engine = ConsensusEngine::default();
        let personas = builtin_personas();
        let votes = vec![
            vote("security", VoteDecision::Reject),
            vote("performance", VoteDecision::Approve),
            vote("architecture", VoteDecision::Approve),
            vote("pragmatic", VoteDecision::Approve),
        ];
        let findings = vec![critical_finding("security")];

        let result = engine.from_votes(&personas, &votes, &findings);

        assert_eq!(result.decision, VoteDecision::Reject);
        assert!(result
            .disagreements
            .iter()
            .any(|d| matches!(d, Disagreement::CriticalOverride { .. })));
    }

    #[test]
    fn critical_override_can_be_disabled() {
        let engine = ConsensusEngine::new(ConsensusConfig {
            critical_override: false,
            ..ConsensusConfig::default()
        });
        let personas = builtin_personas();
        let votes = vec![
            vote("security", VoteDecision::Reject),
            vote("performance", VoteDecision::Approve),
            vote("architecture", VoteDecision::Approve),
            vote("pragmatic", VoteDecision::Approve),
        ];
        let findings = vec![critical_finding("security")];

        let result = engine.from_votes(&personas, &votes, &findings);

        assert_eq!(result.decision, VoteDecision::Approve);
        assert!(!result
            .disagreements
            .iter()
            .any(|d| matches!(d, Disagreement::CriticalOverride { .. })));
    }

    #[test]
    fn override_not_recorded_when_majority_already_rejects() {
        let engine = ConsensusEngine::default();
        let personas = builtin_personas();
        let votes = vec![
            vote("security", VoteDecision::Reject),
            vote("pragmatic", VoteDecision::Reject),
        ];
        let findings = vec![critical_finding("security")];

        let result = engine.from_votes(&personas, &votes, &findings);
        assert_eq!(result.decision, VoteDecision::Reject);
        assert!(!result
            .disagreements
            .iter()
            .any(|d| matches!(d, Disagreement::CriticalOverride { .. })));
    }

    #[test]
    fn dissenting_votes_are_recorded() {
        let engine = ConsensusEngine::default();
        let personas = builtin_personas();
        let votes = vec![
            vote("security", VoteDecision::Reject),
            vote("performance", VoteDecision::Approve),
            vote("architecture", VoteDecision::Approve),
            vote("pragmatic", VoteDecision::Approve),
        ];

        let result = engine.from_votes(&personas, &votes, &[]);
        assert_eq!(result.decision, VoteDecision::Approve);
        assert!(matches!(
            result.disagreements.as_slice(),
            [Disagreement::DissentingVote { persona, decision: VoteDecision::Reject, .. }]
                if persona == "security"
        ));
    }

    #[test]
    fn synthetic_rejects_on_single_critical_finding() {
        // A lone CRITICAL finding is surfaced and drives REJECT.
        let engine = ConsensusEngine::default();
        let findings = vec![critical_finding("security")];

        let result = engine.synthetic(&findings);

        assert_eq!(result.decision, VoteDecision::Reject);
        assert_eq!(result.key_issues.len(), 1);
        assert_eq!(result.key_issues[0].supporters, vec!["security"]);
        assert_eq!(result.tally.values().sum::<usize>(), 0);
    }

    #[test]
    fn synthetic_approves_when_nothing_was_found() {
        let engine = ConsensusEngine::default();
        let result = engine.synthetic(&[]);
        assert_eq!(result.decision, VoteDecision::Approve);
        assert!(result.key_issues.is_empty());
    }

    #[test]
    fn synthetic_abstains_on_minor_unsupported_findings() {
        let engine = ConsensusEngine::default();
        // One persona, MEDIUM: not surfaced as a key issue, but findings
        // exist, so the engine can neither approve nor reject outright.
        let findings = vec![Finding::new("pragmatic", "unclear variable naming", Severity::Medium, 0.6)];

        let result = engine.synthetic(&findings);
        assert_eq!(result.decision, VoteDecision::Abstain);
        assert!(result.key_issues.is_empty());
    }

    #[test]
    fn accepted_fixes_come_only_from_surfaced_issues() {
        let engine = ConsensusEngine::default();
        let surfaced = critical_finding("security").with_fix(SuggestedFix {
            replacement: "use ast.literal_eval".into(),
            lines: LineRange::single(1),
        });
        let buried = Finding::new("pragmatic", "bikeshed color wrong", Severity::Low, 0.3)
            .with_fix(SuggestedFix {
                replacement: "paint it blue".into(),
                lines: LineRange::single(99),
            });

        let result = engine.synthetic(&[surfaced, buried]);

        assert_eq!(result.accepted_fixes.len(), 1);
        assert_eq!(result.accepted_fixes[0].replacement, "use ast.literal_eval");
    }
}
