//! Core data model for debate sessions.
//!
//! Everything here is immutable once produced: findings, reviews and votes
//! are appended to the session and never mutated, which is what lets the
//! round fan-out run without locking anything but the append itself. The
//! sealed `DebateSession` is the value handed to external collaborators
//! (persistence, export, transport), so every type derives `Serialize`.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

// ============================================================================
// Enums
// ============================================================================

/// Severity of a finding, ordered from least to most severe.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// All severities, least severe first.
    pub fn all() -> [Self; 4] {
        [Self::Low, Self::Medium, Self::High, Self::Critical]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "LOW" => Ok(Self::Low),
            "MEDIUM" => Ok(Self::Medium),
            "HIGH" => Ok(Self::High),
            "CRITICAL" => Ok(Self::Critical),
            other => Err(format!("invalid severity: '{}'", other)),
        }
    }
}

/// A persona's final decision on the code under review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VoteDecision {
    Approve,
    Reject,
    Abstain,
}

impl VoteDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "APPROVE",
            Self::Reject => "REJECT",
            Self::Abstain => "ABSTAIN",
        }
    }
}

impl std::fmt::Display for VoteDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of one reviewer call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallStatus {
    /// The call completed with a valid structured response.
    Ok,
    /// Retries and deadline were exhausted without a usable response.
    DegradedTimeout,
    /// The response failed schema validation even after the repair attempt.
    DegradedMalformed,
}

impl CallStatus {
    pub fn is_degraded(&self) -> bool {
        !matches!(self, Self::Ok)
    }
}

/// Lifecycle state of a debate session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    /// Rounds still in progress (never observable on a sealed session).
    Running,
    /// Completed with at least one degraded call.
    Partial,
    /// Completed with every call OK.
    Complete,
    /// Aborted: a round lost quorum, no consensus was produced.
    Failed,
}

/// Debate protocol selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewMode {
    /// Three rounds: independent review, rebuttal, vote.
    Full,
    /// One round, decision synthesized from findings without a vote.
    Quick,
}

impl ReviewMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "FULL",
            Self::Quick => "QUICK",
        }
    }
}

// ============================================================================
// Findings and fixes
// ============================================================================

/// An inclusive, 1-indexed range of source lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LineRange {
    pub start: u32,
    pub end: u32,
}

impl LineRange {
    /// A range covering the given lines; `end` is clamped up to `start`.
    pub fn new(start: u32, end: u32) -> Self {
        Self {
            start,
            end: end.max(start),
        }
    }

    /// A single-line range.
    pub fn single(line: u32) -> Self {
        Self::new(line, line)
    }

    /// Whether two ranges share at least one line.
    pub fn overlaps(&self, other: &LineRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

/// A concrete replacement suggestion anchored to a line range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuggestedFix {
    /// Replacement text for the anchored lines.
    pub replacement: String,
    /// The lines the replacement is anchored to.
    pub lines: LineRange,
}

/// One issue reported by one persona in one round. Immutable once produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    /// Unique identifier of this finding.
    pub id: Uuid,
    /// Id of the persona that reported it.
    pub persona: String,
    /// Free-text description of the issue.
    pub description: String,
    /// Severity of this individual issue.
    pub severity: Severity,
    /// Reporter's confidence in the finding (0.0 - 1.0).
    pub confidence: f64,
    /// Optional source line reference.
    pub line: Option<LineRange>,
    /// Optional suggested fix.
    pub fix: Option<SuggestedFix>,
}

impl Finding {
    /// Creates a finding with a fresh id and no line/fix attachments.
    pub fn new(
        persona: impl Into<String>,
        description: impl Into<String>,
        severity: Severity,
        confidence: f64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            persona: persona.into(),
            description: description.into(),
            severity,
            confidence: confidence.clamp(0.0, 1.0),
            line: None,
            fix: None,
        }
    }

    /// Attaches a line reference.
    pub fn with_line(mut self, line: LineRange) -> Self {
        self.line = Some(line);
        self
    }

    /// Attaches a suggested fix.
    pub fn with_fix(mut self, fix: SuggestedFix) -> Self {
        self.fix = Some(fix);
        self
    }
}

// ============================================================================
// Reviews and votes
// ============================================================================

/// The output of one reviewer call: a persona's full position for one round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentReview {
    /// Id of the reviewing persona.
    pub persona: String,
    /// Round this review belongs to (1-indexed).
    pub round: u32,
    /// Findings in the order the persona reported them.
    pub findings: Vec<Finding>,
    /// Free-text overall summary.
    pub summary: String,
    /// Overall severity assessment.
    pub severity: Severity,
    /// Overall confidence (0.0 - 1.0).
    pub confidence: f64,
    /// How the underlying call ended.
    pub status: CallStatus,
    /// When the review was produced.
    pub created_at: DateTime<Utc>,
}

impl AgentReview {
    /// A successful review.
    pub fn ok(
        persona: impl Into<String>,
        round: u32,
        findings: Vec<Finding>,
        summary: impl Into<String>,
        severity: Severity,
        confidence: f64,
    ) -> Self {
        Self {
            persona: persona.into(),
            round,
            findings,
            summary: summary.into(),
            severity,
            confidence: confidence.clamp(0.0, 1.0),
            status: CallStatus::Ok,
            created_at: Utc::now(),
        }
    }

    /// A review degraded after exhausting retries or the call deadline.
    /// Carries no findings and zero confidence.
    pub fn degraded_timeout(persona: impl Into<String>, round: u32) -> Self {
        Self {
            persona: persona.into(),
            round,
            findings: Vec::new(),
            summary: "reviewer did not respond within the call deadline".to_string(),
            severity: Severity::Low,
            confidence: 0.0,
            status: CallStatus::DegradedTimeout,
            created_at: Utc::now(),
        }
    }

    /// A review degraded by schema validation failure, retaining whatever
    /// findings could be salvaged from the malformed response.
    pub fn degraded_malformed(
        persona: impl Into<String>,
        round: u32,
        salvaged: Vec<Finding>,
    ) -> Self {
        let severity = salvaged
            .iter()
            .map(|f| f.severity)
            .max()
            .unwrap_or(Severity::Low);
        Self {
            persona: persona.into(),
            round,
            findings: salvaged,
            summary: "reviewer response failed validation; partial findings salvaged".to_string(),
            severity,
            confidence: 0.0,
            status: CallStatus::DegradedMalformed,
            created_at: Utc::now(),
        }
    }
}

/// A persona's final-round vote.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vote {
    /// Id of the voting persona.
    pub persona: String,
    /// The decision cast.
    pub decision: VoteDecision,
    /// Free-text justification.
    pub rationale: String,
}

// ============================================================================
// Consensus output
// ============================================================================

/// A cluster of equivalent findings surfaced in the final result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyIssue {
    /// Canonical description (taken from the most severe member).
    pub description: String,
    /// Maximum severity across cluster members.
    pub severity: Severity,
    /// Distinct supporting persona ids, sorted.
    pub supporters: Vec<String>,
    /// Ids of the member findings.
    pub findings: Vec<Uuid>,
}

/// An unresolved disagreement recorded on the final result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Disagreement {
    /// A persona whose vote conflicts with the final decision.
    DissentingVote {
        persona: String,
        decision: VoteDecision,
        rationale: String,
    },
    /// The critical-severity policy override forced the decision to REJECT
    /// against the raw majority.
    CriticalOverride { issue: String },
}

/// The collective verdict derived from a completed debate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusResult {
    /// Final decision.
    pub decision: VoteDecision,
    /// Vote tally; all three decisions are always present as keys. All zero
    /// in quick mode, where no votes are cast.
    pub tally: BTreeMap<VoteDecision, usize>,
    /// Surfaced key issues, most severe first.
    pub key_issues: Vec<KeyIssue>,
    /// Suggested fixes drawn from findings belonging to surfaced key issues.
    pub accepted_fixes: Vec<SuggestedFix>,
    /// Dissenting votes and policy overrides.
    pub disagreements: Vec<Disagreement>,
}

impl ConsensusResult {
    /// A tally map with every decision present, initialized to zero.
    pub fn empty_tally() -> BTreeMap<VoteDecision, usize> {
        [
            (VoteDecision::Approve, 0),
            (VoteDecision::Reject, 0),
            (VoteDecision::Abstain, 0),
        ]
        .into_iter()
        .collect()
    }

    /// Highest severity among surfaced key issues, if any were surfaced.
    pub fn max_severity(&self) -> Option<Severity> {
        self.key_issues.iter().map(|k| k.severity).max()
    }
}

// ============================================================================
// Session
// ============================================================================

/// Deterministic, content-addressed cache key over the review inputs.
///
/// SHA-256 over the source text, context, the sorted persona ids and the
/// mode tag, each field NUL-terminated so field boundaries are unambiguous.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn compute(source: &str, context: &str, personas: &[String], mode: ReviewMode) -> Self {
        let mut sorted: Vec<&str> = personas.iter().map(String::as_str).collect();
        sorted.sort_unstable();

        let mut hasher = Sha256::new();
        hasher.update(source.as_bytes());
        hasher.update([0u8]);
        hasher.update(context.as_bytes());
        hasher.update([0u8]);
        for id in sorted {
            hasher.update(id.as_bytes());
            hasher.update([0u8]);
        }
        hasher.update(mode.as_str().as_bytes());

        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a session entered `Failed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuorumFailure {
    /// Round in which quorum was lost.
    pub round: u32,
    /// Number of degraded calls in that round.
    pub degraded: usize,
    /// Number of active personas.
    pub total: usize,
}

impl std::fmt::Display for QuorumFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "quorum lost in round {}: {} of {} reviewers degraded",
            self.round, self.degraded, self.total
        )
    }
}

/// One synchronized wave of reviewer calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Round {
    /// Round number (1-indexed).
    pub number: u32,
    /// One review per active persona, including degraded ones.
    pub reviews: Vec<AgentReview>,
}

impl Round {
    /// Number of degraded calls in this round.
    pub fn degraded_count(&self) -> usize {
        self.reviews.iter().filter(|r| r.status.is_degraded()).count()
    }
}

/// The aggregate root: one complete debate over one piece of source text.
///
/// Built append-only by the orchestrator and sealed (never mutated again)
/// once the status leaves `Running`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebateSession {
    /// Opaque session identifier.
    pub id: Uuid,
    /// Content-addressed fingerprint of the inputs.
    pub fingerprint: Fingerprint,
    /// The source text under review.
    pub source: String,
    /// Caller-supplied context (may be empty).
    pub context: String,
    /// Ids of the active personas, in request order.
    pub personas: Vec<String>,
    /// Protocol used.
    pub mode: ReviewMode,
    /// Completed rounds, in order.
    pub rounds: Vec<Round>,
    /// Final-round votes (empty in quick mode and failed sessions).
    pub votes: Vec<Vote>,
    /// The collective verdict; absent when the session failed.
    pub consensus: Option<ConsensusResult>,
    /// Lifecycle state at sealing time.
    pub status: SessionStatus,
    /// Populated when the session failed on lost quorum.
    pub failure: Option<QuorumFailure>,
    /// When the session was created.
    pub created_at: DateTime<Utc>,
    /// When the session was sealed.
    pub completed_at: Option<DateTime<Utc>>,
}

impl DebateSession {
    /// All findings across review rounds, in round order then persona order.
    pub fn all_findings(&self) -> Vec<&Finding> {
        self.rounds
            .iter()
            .flat_map(|round| round.reviews.iter())
            .flat_map(|review| review.findings.iter())
            .collect()
    }

    /// Personas whose calls degraded in any round, with the round number.
    pub fn degraded_personas(&self) -> Vec<(String, u32, CallStatus)> {
        self.rounds
            .iter()
            .flat_map(|round| round.reviews.iter())
            .filter(|review| review.status.is_degraded())
            .map(|review| (review.persona.clone(), review.round, review.status))
            .collect()
    }
}

// ============================================================================
// Engine input
// ============================================================================

/// Caller input describing one review run.
#[derive(Debug, Clone)]
pub struct ReviewRequest {
    /// The source text to review. Must be non-empty.
    pub source: String,
    /// Additional context; may be empty.
    pub context: String,
    /// Persona ids to activate, in order. Must be non-empty and known.
    pub personas: Vec<String>,
    /// Protocol selection.
    pub mode: ReviewMode,
    /// Deadline for each individual reviewer call.
    pub round_deadline: Duration,
    /// Optional overall session deadline.
    pub session_deadline: Option<Duration>,
    /// Skip the cache lookup (the result is still written back).
    pub force_fresh: bool,
}

impl ReviewRequest {
    /// A full-debate request with the default deadlines.
    pub fn new(source: impl Into<String>, personas: Vec<String>) -> Self {
        Self {
            source: source.into(),
            context: String::new(),
            personas,
            mode: ReviewMode::Full,
            round_deadline: Duration::from_secs(120),
            session_deadline: None,
            force_fresh: false,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    pub fn with_mode(mut self, mode: ReviewMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_round_deadline(mut self, deadline: Duration) -> Self {
        self.round_deadline = deadline;
        self
    }

    pub fn with_session_deadline(mut self, deadline: Duration) -> Self {
        self.session_deadline = Some(deadline);
        self
    }

    pub fn force_fresh(mut self) -> Self {
        self.force_fresh = true;
        self
    }

    /// The cache fingerprint for this request.
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::compute(&self.source, &self.context, &self.personas, self.mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_ordering_is_least_to_most_severe() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::Medium < Severity::High);
        assert!(Severity::High < Severity::Critical);
    }

    #[test]
    fn severity_parses_case_insensitively() {
        assert_eq!("critical".parse::<Severity>(), Ok(Severity::Critical));
        assert_eq!("HIGH".parse::<Severity>(), Ok(Severity::High));
        assert!("severe".parse::<Severity>().is_err());
    }

    #[test]
    fn severity_serializes_to_wire_format() {
        assert_eq!(
            serde_json::to_string(&Severity::Critical).expect("serializes"),
            "\"CRITICAL\""
        );
        assert_eq!(
            serde_json::from_str::<Severity>("\"MEDIUM\"").expect("parses"),
            Severity::Medium
        );
    }

    #[test]
    fn line_range_overlap() {
        let a = LineRange::new(5, 10);
        assert!(a.overlaps(&LineRange::new(10, 12)));
        assert!(a.overlaps(&LineRange::new(1, 5)));
        assert!(a.overlaps(&LineRange::single(7)));
        assert!(!a.overlaps(&LineRange::new(11, 20)));
        assert!(!a.overlaps(&LineRange::new(1, 4)));
    }

    #[test]
    fn line_range_end_clamped_to_start() {
        let r = LineRange::new(9, 3);
        assert_eq!(r.start, 9);
        assert_eq!(r.end, 9);
    }

    #[test]
    fn finding_confidence_is_clamped() {
        let f = Finding::new("security", "x", Severity::Low, 1.8);
        assert!((f.confidence - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn degraded_timeout_review_is_empty_with_zero_confidence() {
        let review = AgentReview::degraded_timeout("performance", 1);
        assert_eq!(review.status, CallStatus::DegradedTimeout);
        assert!(review.findings.is_empty());
        assert_eq!(review.confidence, 0.0);
        assert_eq!(review.severity, Severity::Low);
    }

    #[test]
    fn degraded_malformed_review_keeps_salvaged_findings() {
        let salvaged = vec![Finding::new("security", "sqli", Severity::High, 0.8)];
        let review = AgentReview::degraded_malformed("security", 2, salvaged);
        assert_eq!(review.status, CallStatus::DegradedMalformed);
        assert_eq!(review.findings.len(), 1);
        assert_eq!(review.severity, Severity::High);
        assert_eq!(review.confidence, 0.0);
    }

    #[test]
    fn fingerprint_is_stable_and_persona_order_independent() {
        let a = Fingerprint::compute(
            "code",
            "ctx",
            &["security".into(), "pragmatic".into()],
            ReviewMode::Full,
        );
        let b = Fingerprint::compute(
            "code",
            "ctx",
            &["pragmatic".into(), "security".into()],
            ReviewMode::Full,
        );
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn fingerprint_distinguishes_every_input_field() {
        let base = Fingerprint::compute("code", "ctx", &["security".into()], ReviewMode::Full);

        assert_ne!(
            base,
            Fingerprint::compute("code2", "ctx", &["security".into()], ReviewMode::Full)
        );
        assert_ne!(
            base,
            Fingerprint::compute("code", "ctx2", &["security".into()], ReviewMode::Full)
        );
        assert_ne!(
            base,
            Fingerprint::compute("code", "ctx", &["pragmatic".into()], ReviewMode::Full)
        );
        assert_ne!(
            base,
            Fingerprint::compute("code", "ctx", &["security".into()], ReviewMode::Quick)
        );
    }

    #[test]
    fn fingerprint_field_boundaries_are_unambiguous() {
        // Moving a character across the source/context boundary must change
        // the hash.
        let a = Fingerprint::compute("ab", "c", &["security".into()], ReviewMode::Full);
        let b = Fingerprint::compute("a", "bc", &["security".into()], ReviewMode::Full);
        assert_ne!(a, b);
    }

    #[test]
    fn empty_tally_has_all_three_keys() {
        let tally = ConsensusResult::empty_tally();
        assert_eq!(tally.len(), 3);
        assert!(tally.values().all(|&count| count == 0));
    }

    #[test]
    fn request_fingerprint_matches_direct_computation() {
        let request = ReviewRequest::new("code", vec!["security".into()])
            .with_context("ctx")
            .with_mode(ReviewMode::Quick);
        assert_eq!(
            request.fingerprint(),
            Fingerprint::compute("code", "ctx", &["security".into()], ReviewMode::Quick)
        );
    }
}
