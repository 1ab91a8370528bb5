//! Reviewer client: one persona's analysis call with full degradation
//! handling.
//!
//! Every call is bounded twice: a per-attempt timeout and an overall
//! per-call deadline. Transient failures (network, rate limit, 5xx, attempt
//! timeout) are retried with exponential backoff until the attempt cap or
//! the deadline is reached, after which the call degrades to
//! `DegradedTimeout`. A response that fails structured-output validation
//! gets exactly one repair attempt (a re-ask carrying the bad response and a
//! corrective instruction); if that also fails the call degrades to
//! `DegradedMalformed`, salvaging whatever individual findings still parse.
//! A degraded call never aborts its round.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::time::{sleep, timeout, Instant};

use crate::llm::{GenerationRequest, LlmProvider, Message};
use crate::personas::{
    render_rebuttal_prompt, render_review_prompt, render_vote_prompt, Persona, REPAIR_INSTRUCTION,
};
use crate::review::{
    AgentReview, Finding, KeyIssue, LineRange, Severity, SuggestedFix, Vote, VoteDecision,
};

/// Maximum transport attempts per call.
const MAX_ATTEMPTS: u32 = 3;

/// Base delay for exponential backoff between attempts.
const BASE_RETRY_DELAY_MS: u64 = 1000;

/// Timeout for a single transport attempt.
const ATTEMPT_TIMEOUT_SECS: u64 = 60;

/// Sampling temperature for review calls; low, reviews should be stable.
const REVIEW_TEMPERATURE: f64 = 0.2;

/// Token budget per reviewer response.
const MAX_RESPONSE_TOKENS: u32 = 4000;

/// Retry/timeout policy for reviewer calls.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum transport attempts (1 = no retries).
    pub max_attempts: u32,
    /// Backoff base; attempt n waits `base_delay * 2^(n-1)`.
    pub base_delay: Duration,
    /// Timeout for each individual attempt.
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            base_delay: Duration::from_millis(BASE_RETRY_DELAY_MS),
            attempt_timeout: Duration::from_secs(ATTEMPT_TIMEOUT_SECS),
        }
    }
}

/// How a single transport attempt ended.
enum AttemptError {
    /// Worth retrying within the deadline.
    Transient,
    /// Retrying cannot help (client-side API error).
    Fatal,
    /// The per-call deadline is already spent.
    DeadlineExhausted,
}

/// Client for one persona's review and vote calls.
pub struct ReviewerClient {
    provider: Arc<dyn LlmProvider>,
    retry: RetryPolicy,
}

impl ReviewerClient {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self {
            provider,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Runs one persona's review for one round.
    ///
    /// `prior` carries the other personas' earlier findings and is only
    /// consulted for rebuttal rounds (round >= 2). The returned review is
    /// degraded rather than erroring: this method cannot fail.
    pub async fn review(
        &self,
        persona: &Persona,
        code: &str,
        context: &str,
        round: u32,
        prior: &[Finding],
        deadline: Duration,
    ) -> AgentReview {
        let user_prompt = if round >= 2 {
            render_rebuttal_prompt(code, context, prior)
        } else {
            render_review_prompt(code, context)
        };

        let deadline_at = Instant::now() + deadline;
        let messages = vec![
            Message::system(persona.prompt.clone()),
            Message::user(user_prompt),
        ];

        let Some(content) = self.generate_with_retry(&persona.id, messages.clone(), deadline_at).await
        else {
            return AgentReview::degraded_timeout(&persona.id, round);
        };

        match parse_review(&persona.id, round, &content) {
            Ok(review) => review,
            Err(parse_err) => {
                tracing::warn!(
                    persona = %persona.id,
                    round,
                    error = %parse_err,
                    "Review response failed validation, attempting repair"
                );
                self.repair_review(persona, round, messages, content, deadline_at)
                    .await
            }
        }
    }

    /// Runs one persona's final vote over the clustered key issues.
    ///
    /// Degraded calls yield an ABSTAIN vote so the tally always covers
    /// every active persona. Returns the vote plus the round-record review
    /// carrying the call status.
    pub async fn vote(
        &self,
        persona: &Persona,
        code: &str,
        context: &str,
        key_issues: &[KeyIssue],
        round: u32,
        deadline: Duration,
    ) -> (Vote, AgentReview) {
        let deadline_at = Instant::now() + deadline;
        let messages = vec![
            Message::system(persona.prompt.clone()),
            Message::user(render_vote_prompt(code, context, key_issues)),
        ];

        let Some(content) = self.generate_with_retry(&persona.id, messages.clone(), deadline_at).await
        else {
            return (
                abstain_vote(&persona.id, "reviewer did not respond within the call deadline"),
                AgentReview::degraded_timeout(&persona.id, round),
            );
        };

        match parse_vote(&persona.id, &content) {
            Ok(vote) => {
                let review = AgentReview::ok(
                    &persona.id,
                    round,
                    Vec::new(),
                    vote.rationale.clone(),
                    Severity::Low,
                    1.0,
                );
                (vote, review)
            }
            Err(parse_err) => {
                tracing::warn!(
                    persona = %persona.id,
                    error = %parse_err,
                    "Vote response failed validation, attempting repair"
                );
                let mut repair = messages;
                repair.push(Message::assistant(content));
                repair.push(Message::user(REPAIR_INSTRUCTION));

                if let Ok(repaired) = self.single_attempt(repair, deadline_at).await {
                    if let Ok(vote) = parse_vote(&persona.id, &repaired) {
                        let review = AgentReview::ok(
                            &persona.id,
                            round,
                            Vec::new(),
                            vote.rationale.clone(),
                            Severity::Low,
                            1.0,
                        );
                        return (vote, review);
                    }
                }

                (
                    abstain_vote(&persona.id, "reviewer did not produce a valid vote"),
                    AgentReview::degraded_malformed(&persona.id, round, Vec::new()),
                )
            }
        }
    }

    /// The single repair attempt after a malformed review response.
    async fn repair_review(
        &self,
        persona: &Persona,
        round: u32,
        mut messages: Vec<Message>,
        malformed: String,
        deadline_at: Instant,
    ) -> AgentReview {
        messages.push(Message::assistant(malformed.clone()));
        messages.push(Message::user(REPAIR_INSTRUCTION));

        if let Ok(repaired) = self.single_attempt(messages, deadline_at).await {
            match parse_review(&persona.id, round, &repaired) {
                Ok(review) => return review,
                Err(_) => {
                    let mut salvaged = salvage_findings(&persona.id, &repaired);
                    if salvaged.is_empty() {
                        salvaged = salvage_findings(&persona.id, &malformed);
                    }
                    return AgentReview::degraded_malformed(&persona.id, round, salvaged);
                }
            }
        }

        AgentReview::degraded_malformed(
            &persona.id,
            round,
            salvage_findings(&persona.id, &malformed),
        )
    }

    /// Retries transient failures with exponential backoff, never sleeping
    /// past the per-call deadline. Returns the raw response content, or
    /// `None` once the call should degrade.
    async fn generate_with_retry(
        &self,
        persona_id: &str,
        messages: Vec<Message>,
        deadline_at: Instant,
    ) -> Option<String> {
        for attempt in 0..self.retry.max_attempts {
            if attempt > 0 {
                let delay = self.retry.base_delay * 2u32.pow(attempt - 1);
                if Instant::now() + delay >= deadline_at {
                    tracing::debug!(persona = persona_id, attempt, "Backoff would exceed call deadline");
                    return None;
                }
                sleep(delay).await;
                tracing::debug!(
                    persona = persona_id,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying reviewer call after transient failure"
                );
            }

            match self.single_attempt(messages.clone(), deadline_at).await {
                Ok(content) => return Some(content),
                Err(AttemptError::Transient) => continue,
                Err(AttemptError::Fatal) | Err(AttemptError::DeadlineExhausted) => return None,
            }
        }
        None
    }

    /// One transport attempt, bounded by both the attempt timeout and the
    /// remaining per-call budget.
    async fn single_attempt(
        &self,
        messages: Vec<Message>,
        deadline_at: Instant,
    ) -> Result<String, AttemptError> {
        let now = Instant::now();
        if now >= deadline_at {
            return Err(AttemptError::DeadlineExhausted);
        }
        let budget = (deadline_at - now).min(self.retry.attempt_timeout);

        let request = GenerationRequest::new("", messages)
            .with_temperature(REVIEW_TEMPERATURE)
            .with_max_tokens(MAX_RESPONSE_TOKENS);

        match timeout(budget, self.provider.generate(request)).await {
            Ok(Ok(response)) => match response.first_content() {
                Some(content) if !content.is_empty() => Ok(content.to_string()),
                _ => Err(AttemptError::Transient),
            },
            Ok(Err(err)) if err.is_transient() => {
                tracing::warn!(error = %err, "Transient provider error");
                Err(AttemptError::Transient)
            }
            Ok(Err(err)) => {
                tracing::error!(error = %err, "Non-transient provider error, giving up");
                Err(AttemptError::Fatal)
            }
            Err(_elapsed) => Err(AttemptError::Transient),
        }
    }
}

fn abstain_vote(persona_id: &str, rationale: &str) -> Vote {
    Vote {
        persona: persona_id.to_string(),
        decision: VoteDecision::Abstain,
        rationale: rationale.to_string(),
    }
}

// ============================================================================
// Response parsing
// ============================================================================

/// Wire shape of a structured review response.
#[derive(Debug, Deserialize)]
struct WireReview {
    summary: String,
    severity: Severity,
    confidence: f64,
    issues: Vec<WireIssue>,
}

/// Wire shape of one reported issue.
#[derive(Debug, Deserialize)]
struct WireIssue {
    description: String,
    severity: Severity,
    #[serde(default = "default_issue_confidence")]
    confidence: f64,
    #[serde(default)]
    line: Option<WireRange>,
    #[serde(default)]
    suggested_fix: Option<WireFix>,
}

fn default_issue_confidence() -> f64 {
    0.5
}

#[derive(Debug, Deserialize)]
struct WireRange {
    start: u32,
    #[serde(default)]
    end: Option<u32>,
}

impl WireRange {
    /// Converts to a validated line range; line numbers are 1-indexed, so a
    /// zero start means the model produced nonsense and the reference is
    /// dropped.
    fn into_range(self) -> Option<LineRange> {
        if self.start == 0 {
            return None;
        }
        Some(LineRange::new(self.start, self.end.unwrap_or(self.start)))
    }
}

#[derive(Debug, Deserialize)]
struct WireFix {
    replacement: String,
    lines: WireRange,
}

/// Wire shape of a structured vote response.
#[derive(Debug, Deserialize)]
struct WireVote {
    decision: VoteDecision,
    rationale: String,
}

/// Extracts a JSON object from a possibly markdown-fenced response.
fn extract_json(content: &str) -> &str {
    if let (Some(start), Some(end)) = (content.find('{'), content.rfind('}')) {
        if end >= start {
            return &content[start..=end];
        }
    }
    content
}

fn build_finding(persona_id: &str, issue: WireIssue) -> Finding {
    let mut finding = Finding::new(persona_id, issue.description, issue.severity, issue.confidence);
    if let Some(range) = issue.line.and_then(WireRange::into_range) {
        finding = finding.with_line(range);
    }
    if let Some(fix) = issue.suggested_fix {
        if let Some(lines) = fix.lines.into_range() {
            finding = finding.with_fix(SuggestedFix {
                replacement: fix.replacement,
                lines,
            });
        }
    }
    finding
}

/// Parses and validates a full review response.
fn parse_review(persona_id: &str, round: u32, content: &str) -> Result<AgentReview, String> {
    let wire: WireReview = serde_json::from_str(extract_json(content))
        .map_err(|e| format!("invalid review response: {}", e))?;

    let findings = wire
        .issues
        .into_iter()
        .map(|issue| build_finding(persona_id, issue))
        .collect();

    Ok(AgentReview::ok(
        persona_id,
        round,
        findings,
        wire.summary,
        wire.severity,
        wire.confidence,
    ))
}

/// Parses and validates a vote response.
fn parse_vote(persona_id: &str, content: &str) -> Result<Vote, String> {
    let wire: WireVote = serde_json::from_str(extract_json(content))
        .map_err(|e| format!("invalid vote response: {}", e))?;
    Ok(Vote {
        persona: persona_id.to_string(),
        decision: wire.decision,
        rationale: wire.rationale,
    })
}

/// Pulls individually-valid findings out of a malformed response, skipping
/// entries that fail validation (unknown severity, missing fields).
fn salvage_findings(persona_id: &str, content: &str) -> Vec<Finding> {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(extract_json(content)) else {
        return Vec::new();
    };
    let Some(issues) = value.get("issues").and_then(|v| v.as_array()) else {
        return Vec::new();
    };

    issues
        .iter()
        .filter_map(|raw| serde_json::from_value::<WireIssue>(raw.clone()).ok())
        .map(|issue| build_finding(persona_id, issue))
        .collect()
}
