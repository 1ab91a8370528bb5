//! Round coordinator: one synchronized wave of reviewer calls.
//!
//! All active personas run concurrently (optionally capped by a semaphore)
//! and the round is a barrier: it returns only when every call has either
//! produced a review or degraded. Individual failures never fail the round;
//! quorum is the orchestrator's concern.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;

use crate::personas::Persona;
use crate::review::{Finding, KeyIssue, Round, Vote};
use crate::reviewer::ReviewerClient;

/// Fans one round out across the active personas.
pub struct RoundCoordinator {
    client: Arc<ReviewerClient>,
    /// Maximum concurrent calls; `None` means all personas at once, which
    /// is the default since persona counts are small.
    parallelism: Option<usize>,
}

impl RoundCoordinator {
    pub fn new(client: Arc<ReviewerClient>) -> Self {
        Self {
            client,
            parallelism: None,
        }
    }

    pub fn with_parallelism(mut self, limit: usize) -> Self {
        self.parallelism = Some(limit.max(1));
        self
    }

    fn semaphore(&self) -> Option<Arc<Semaphore>> {
        self.parallelism.map(|n| Arc::new(Semaphore::new(n)))
    }

    /// Runs one review round. `prior` holds every earlier finding; each
    /// persona receives only its peers' findings, never its own.
    pub async fn run_review_round(
        &self,
        round: u32,
        personas: &[Persona],
        code: &str,
        context: &str,
        prior: &[Finding],
        call_deadline: Duration,
    ) -> Round {
        let semaphore = self.semaphore();
        let calls = personas.iter().map(|persona| {
            let semaphore = semaphore.clone();
            async move {
                let _permit = match semaphore.as_ref() {
                    Some(s) => Some(s.acquire().await.expect("round semaphore never closed")),
                    None => None,
                };
                let peers: Vec<Finding> = prior
                    .iter()
                    .filter(|f| f.persona != persona.id)
                    .cloned()
                    .collect();
                self.client
                    .review(persona, code, context, round, &peers, call_deadline)
                    .await
            }
        });

        let reviews = futures::future::join_all(calls).await;
        tracing::debug!(
            round,
            reviews = reviews.len(),
            degraded = reviews.iter().filter(|r| r.status.is_degraded()).count(),
            "Round barrier released"
        );
        Round { number: round, reviews }
    }

    /// Runs the vote round over the clustered key issues. Returns the votes
    /// together with the round record carrying per-call status.
    pub async fn run_vote_round(
        &self,
        round: u32,
        personas: &[Persona],
        code: &str,
        context: &str,
        key_issues: &[KeyIssue],
        call_deadline: Duration,
    ) -> (Vec<Vote>, Round) {
        let semaphore = self.semaphore();
        let calls = personas.iter().map(|persona| {
            let semaphore = semaphore.clone();
            async move {
                let _permit = match semaphore.as_ref() {
                    Some(s) => Some(s.acquire().await.expect("round semaphore never closed")),
                    None => None,
                };
                self.client
                    .vote(persona, code, context, key_issues, round, call_deadline)
                    .await
            }
        });

        let outcomes = futures::future::join_all(calls).await;
        let mut votes = Vec::with_capacity(outcomes.len());
        let mut reviews = Vec::with_capacity(outcomes.len());
        for (vote, review) in outcomes {
            votes.push(vote);
            reviews.push(review);
        }
        (votes, Round { number: round, reviews })
    }
}

/// Quorum rule: a round is lost when more than half of the active personas
/// degraded.
pub fn quorum_lost(round: &Round, total: usize) -> bool {
    round.degraded_count() * 2 > total
}
