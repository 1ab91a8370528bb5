//! Debate orchestrator: drives the round-based protocol end to end.
//!
//! The protocol is a small state machine:
//!
//! ```text
//! INIT -> ROUND1 -> (QUICK: -> CONSENSUS)
//!                 | (FULL:  -> ROUND2 -> ROUND3 -> CONSENSUS) -> DONE
//! ```
//!
//! INIT (persona validation, fingerprinting) happens in the engine before
//! the cache is consulted; the orchestrator owns everything from ROUND1 on.
//! After every round the quorum rule is checked: if more than half of the
//! active personas degraded, the session seals as FAILED with a recorded
//! `QuorumFailure` and no consensus is produced. A session deadline, when
//! configured, clamps every per-call deadline to the remaining budget; a
//! spent budget finalizes the session immediately with the results gathered
//! so far.

pub mod round;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

use crate::consensus::{ConsensusConfig, ConsensusEngine};
use crate::personas::Persona;
use crate::review::{
    AgentReview, CallStatus, ConsensusResult, DebateSession, Finding, Fingerprint, QuorumFailure,
    ReviewMode, ReviewRequest, Round, SessionStatus, Vote, VoteDecision,
};
use crate::reviewer::ReviewerClient;

pub use round::{quorum_lost, RoundCoordinator};

// ============================================================================
// Events
// ============================================================================

/// Progress events emitted while a debate runs.
///
/// Emission is best-effort: a missing or full subscriber never blocks or
/// fails the session.
#[derive(Debug, Clone)]
pub enum DebateEvent {
    /// A session began.
    SessionStarted {
        session: Uuid,
        mode: ReviewMode,
        personas: usize,
        timestamp: DateTime<Utc>,
    },
    /// A round's fan-out began.
    RoundStarted { round: u32, timestamp: DateTime<Utc> },
    /// One persona's call finished (possibly degraded).
    ReviewReceived {
        persona: String,
        round: u32,
        status: CallStatus,
        findings: usize,
        timestamp: DateTime<Utc>,
    },
    /// A round's barrier released.
    RoundCompleted {
        round: u32,
        degraded: usize,
        timestamp: DateTime<Utc>,
    },
    /// The session sealed.
    SessionCompleted {
        status: SessionStatus,
        decision: Option<VoteDecision>,
        timestamp: DateTime<Utc>,
    },
}

impl DebateEvent {
    pub fn session_started(session: Uuid, mode: ReviewMode, personas: usize) -> Self {
        Self::SessionStarted {
            session,
            mode,
            personas,
            timestamp: Utc::now(),
        }
    }

    pub fn round_started(round: u32) -> Self {
        Self::RoundStarted {
            round,
            timestamp: Utc::now(),
        }
    }

    pub fn review_received(review: &AgentReview) -> Self {
        Self::ReviewReceived {
            persona: review.persona.clone(),
            round: review.round,
            status: review.status,
            findings: review.findings.len(),
            timestamp: Utc::now(),
        }
    }

    pub fn round_completed(round: &Round) -> Self {
        Self::RoundCompleted {
            round: round.number,
            degraded: round.degraded_count(),
            timestamp: Utc::now(),
        }
    }

    pub fn session_completed(status: SessionStatus, decision: Option<VoteDecision>) -> Self {
        Self::SessionCompleted {
            status,
            decision,
            timestamp: Utc::now(),
        }
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Orchestrator tuning knobs. Deadlines are not configured here; they
/// arrive on each request.
#[derive(Debug, Clone, Default)]
pub struct OrchestratorConfig {
    /// Maximum concurrent persona calls per round; `None` = all at once.
    pub parallelism: Option<usize>,
    /// Consensus policy (clustering threshold, critical override).
    pub consensus: ConsensusConfig,
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Accumulated session state, sealed exactly once.
struct SessionState {
    id: Uuid,
    fingerprint: Fingerprint,
    source: String,
    context: String,
    personas: Vec<String>,
    mode: ReviewMode,
    rounds: Vec<Round>,
    votes: Vec<Vote>,
    created_at: DateTime<Utc>,
}

impl SessionState {
    fn seal(
        self,
        consensus: Option<ConsensusResult>,
        status: SessionStatus,
        failure: Option<QuorumFailure>,
    ) -> DebateSession {
        DebateSession {
            id: self.id,
            fingerprint: self.fingerprint,
            source: self.source,
            context: self.context,
            personas: self.personas,
            mode: self.mode,
            rounds: self.rounds,
            votes: self.votes,
            consensus,
            status,
            failure,
            created_at: self.created_at,
            completed_at: Some(Utc::now()),
        }
    }

    /// Owned copy of every finding reported so far.
    fn findings(&self) -> Vec<Finding> {
        self.rounds
            .iter()
            .flat_map(|round| round.reviews.iter())
            .flat_map(|review| review.findings.iter())
            .cloned()
            .collect()
    }

    /// COMPLETE only when every call in every round came back OK.
    fn completion_status(&self) -> SessionStatus {
        let any_degraded = self
            .rounds
            .iter()
            .any(|round| round.degraded_count() > 0);
        if any_degraded {
            SessionStatus::Partial
        } else {
            SessionStatus::Complete
        }
    }
}

/// Drives a full debate session from first round to sealed result.
pub struct DebateOrchestrator {
    coordinator: RoundCoordinator,
    consensus: ConsensusEngine,
    events: Option<mpsc::Sender<DebateEvent>>,
}

impl DebateOrchestrator {
    pub fn new(client: Arc<ReviewerClient>, config: OrchestratorConfig) -> Self {
        let mut coordinator = RoundCoordinator::new(client);
        if let Some(limit) = config.parallelism {
            coordinator = coordinator.with_parallelism(limit);
        }
        Self {
            coordinator,
            consensus: ConsensusEngine::new(config.consensus),
            events: None,
        }
    }

    /// Attaches a progress event subscriber.
    pub fn with_events(mut self, events: mpsc::Sender<DebateEvent>) -> Self {
        self.events = Some(events);
        self
    }

    async fn emit(&self, event: DebateEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event).await;
        }
    }

    async fn emit_round(&self, round: &Round) {
        for review in &round.reviews {
            self.emit(DebateEvent::review_received(review)).await;
        }
        self.emit(DebateEvent::round_completed(round)).await;
    }

    /// Runs the debate protocol for a validated request.
    ///
    /// `personas` must already be resolved (INIT is the engine's job). The
    /// returned session is sealed; failures are expressed through its
    /// status, never as an error.
    pub async fn run(
        &self,
        request: &ReviewRequest,
        personas: &[Persona],
        fingerprint: Fingerprint,
    ) -> DebateSession {
        let started = Instant::now();
        let mut state = SessionState {
            id: Uuid::new_v4(),
            fingerprint,
            source: request.source.clone(),
            context: request.context.clone(),
            personas: personas.iter().map(|p| p.id.clone()).collect(),
            mode: request.mode,
            rounds: Vec::new(),
            votes: Vec::new(),
            created_at: Utc::now(),
        };
        let total = personas.len();

        tracing::info!(
            session = %state.id,
            fingerprint = %state.fingerprint,
            mode = ?request.mode,
            personas = total,
            "Debate session started"
        );
        self.emit(DebateEvent::session_started(state.id, request.mode, total))
            .await;

        // ROUND 1: independent reviews.
        let round1 = self
            .run_round(request, personas, 1, &[], started)
            .await;
        state.rounds.push(round1);
        if let Some(failure) = Self::lost_quorum(&state, total) {
            return self.seal_failed(state, failure).await;
        }

        if request.mode == ReviewMode::Quick {
            let findings = state.findings();
            let consensus = self.consensus.synthetic(&findings);
            return self.seal_done(state, consensus).await;
        }

        // ROUND 2: rebuttals over peers' round-1 findings.
        let prior = state.findings();
        if self.budget_spent(request, started) {
            return self.seal_expired(state).await;
        }
        let round2 = self
            .run_round(request, personas, 2, &prior, started)
            .await;
        state.rounds.push(round2);
        if let Some(failure) = Self::lost_quorum(&state, total) {
            return self.seal_failed(state, failure).await;
        }

        // ROUND 3: votes over the clustered key issues.
        if self.budget_spent(request, started) {
            return self.seal_expired(state).await;
        }
        let findings = state.findings();
        let key_issues = self.consensus.key_issues(&findings);
        let deadline = self.call_deadline(request, started);
        self.emit(DebateEvent::round_started(3)).await;
        let (votes, round3) = self
            .coordinator
            .run_vote_round(
                3,
                personas,
                &request.source,
                &request.context,
                &key_issues,
                deadline,
            )
            .await;
        self.emit_round(&round3).await;
        state.rounds.push(round3);
        state.votes = votes;
        if let Some(failure) = Self::lost_quorum(&state, total) {
            return self.seal_failed(state, failure).await;
        }

        let consensus = self
            .consensus
            .from_votes(personas, &state.votes, &findings);
        self.seal_done(state, consensus).await
    }

    /// Runs one review round, including the case where the session budget
    /// is already spent and every call degrades without being issued.
    async fn run_round(
        &self,
        request: &ReviewRequest,
        personas: &[Persona],
        number: u32,
        prior: &[Finding],
        started: Instant,
    ) -> Round {
        if self.budget_spent(request, started) {
            return Round {
                number,
                reviews: personas
                    .iter()
                    .map(|p| AgentReview::degraded_timeout(&p.id, number))
                    .collect(),
            };
        }

        let deadline = self.call_deadline(request, started);
        self.emit(DebateEvent::round_started(number)).await;
        let round = self
            .coordinator
            .run_review_round(
                number,
                personas,
                &request.source,
                &request.context,
                prior,
                deadline,
            )
            .await;
        self.emit_round(&round).await;
        round
    }

    /// Whether the configured session deadline has been reached.
    fn budget_spent(&self, request: &ReviewRequest, started: Instant) -> bool {
        match request.session_deadline {
            Some(budget) => started.elapsed() >= budget,
            None => false,
        }
    }

    /// Per-call deadline for the current round: the round deadline clamped
    /// to whatever session budget remains.
    fn call_deadline(&self, request: &ReviewRequest, started: Instant) -> Duration {
        match request.session_deadline {
            Some(budget) => request
                .round_deadline
                .min(budget.saturating_sub(started.elapsed())),
            None => request.round_deadline,
        }
    }

    /// The quorum failure for the most recent round, if quorum was lost.
    fn lost_quorum(state: &SessionState, total: usize) -> Option<QuorumFailure> {
        let last = state.rounds.last()?;
        if !quorum_lost(last, total) {
            return None;
        }
        Some(QuorumFailure {
            round: last.number,
            degraded: last.degraded_count(),
            total,
        })
    }

    /// Seals the session FAILED; the degraded rounds are retained for
    /// diagnostics but no consensus is produced.
    async fn seal_failed(&self, state: SessionState, failure: QuorumFailure) -> DebateSession {
        tracing::warn!(session = %state.id, %failure, "Session failed on lost quorum");
        let session = state.seal(None, SessionStatus::Failed, Some(failure));
        self.emit(DebateEvent::session_completed(SessionStatus::Failed, None))
            .await;
        session
    }

    /// Seals a successfully completed session.
    async fn seal_done(&self, state: SessionState, consensus: ConsensusResult) -> DebateSession {
        let status = state.completion_status();
        let decision = Some(consensus.decision);
        let session = state.seal(Some(consensus), status, None);
        tracing::info!(
            session = %session.id,
            status = ?session.status,
            decision = ?decision,
            "Debate session sealed"
        );
        self.emit(DebateEvent::session_completed(status, decision))
            .await;
        session
    }

    /// Seals a session whose budget ran out before the protocol finished:
    /// PARTIAL, with a consensus synthesized from the findings gathered so
    /// far.
    async fn seal_expired(&self, state: SessionState) -> DebateSession {
        tracing::warn!(
            session = %state.id,
            rounds = state.rounds.len(),
            "Session deadline reached, finalizing early"
        );
        let findings = state.findings();
        let consensus = self.consensus.synthetic(&findings);
        let decision = Some(consensus.decision);
        let session = state.seal(Some(consensus), SessionStatus::Partial, None);
        self.emit(DebateEvent::session_completed(
            SessionStatus::Partial,
            decision,
        ))
        .await;
        session
    }
}
