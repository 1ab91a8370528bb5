//! Top-level review engine: the single entry point callers use.
//!
//! The engine performs INIT (request validation against the persona
//! registry, fingerprint computation), then routes the request through the
//! review cache; on a miss the cache invokes the debate orchestrator at
//! most once per fingerprint, regardless of how many identical requests
//! arrive concurrently.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::cache::ReviewCache;
use crate::error::{EngineError, EngineResult};
use crate::llm::LlmProvider;
use crate::orchestrator::{DebateEvent, DebateOrchestrator, OrchestratorConfig};
use crate::personas::{Persona, PersonaRegistry};
use crate::review::{DebateSession, ReviewRequest};
use crate::reviewer::{RetryPolicy, ReviewerClient};

/// Engine-wide configuration.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Retry/timeout policy for individual reviewer calls.
    pub retry: RetryPolicy,
    /// Orchestrator tuning (parallelism, consensus policy).
    pub orchestrator: OrchestratorConfig,
}

/// The debate & consensus engine.
pub struct ReviewEngine {
    registry: PersonaRegistry,
    orchestrator: DebateOrchestrator,
    cache: Arc<ReviewCache>,
}

impl ReviewEngine {
    /// Builds an engine over the given provider and cache with default
    /// configuration and the built-in persona catalogue.
    pub fn new(provider: Arc<dyn LlmProvider>, cache: Arc<ReviewCache>) -> Self {
        Self::with_config(provider, cache, EngineConfig::default())
    }

    pub fn with_config(
        provider: Arc<dyn LlmProvider>,
        cache: Arc<ReviewCache>,
        config: EngineConfig,
    ) -> Self {
        let client = ReviewerClient::new(provider).with_retry_policy(config.retry);
        Self {
            registry: PersonaRegistry::builtin(),
            orchestrator: DebateOrchestrator::new(Arc::new(client), config.orchestrator),
            cache,
        }
    }

    /// Replaces the built-in persona catalogue.
    pub fn with_personas(mut self, personas: Vec<Persona>) -> Self {
        self.registry = PersonaRegistry::new(personas);
        self
    }

    /// Attaches a progress event subscriber.
    pub fn with_events(mut self, events: mpsc::Sender<DebateEvent>) -> Self {
        self.orchestrator = self.orchestrator.with_events(events);
        self
    }

    pub fn registry(&self) -> &PersonaRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &ReviewCache {
        &self.cache
    }

    /// Runs (or fetches) the review described by `request`.
    ///
    /// Configuration problems are rejected here, before any network call.
    /// Runtime failures are expressed through the sealed session's status;
    /// a `Failed` session carries no consensus.
    pub async fn review(&self, request: ReviewRequest) -> EngineResult<Arc<DebateSession>> {
        if request.source.is_empty() {
            return Err(EngineError::EmptySource);
        }
        let personas = self.registry.resolve(&request.personas)?;
        let fingerprint = request.fingerprint();

        self.cache
            .get_or_compute(&fingerprint, request.force_fresh, || {
                self.orchestrator.run(&request, &personas, fingerprint.clone())
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::llm::{Choice, GenerationRequest, GenerationResponse, Message, Usage};
    use crate::review::{ReviewMode, SessionStatus, VoteDecision};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Provider that answers every call with a clean empty review.
    struct CleanProvider {
        calls: AtomicUsize,
    }

    impl CleanProvider {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
            })
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LlmProvider for CleanProvider {
        async fn generate(
            &self,
            _request: GenerationRequest,
        ) -> Result<GenerationResponse, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(GenerationResponse {
                id: "clean".into(),
                model: "mock".into(),
                choices: vec![Choice {
                    index: 0,
                    message: Message::assistant(
                        r#"{"summary": "fine", "severity": "LOW", "confidence": 0.9, "issues": []}"#,
                    ),
                    finish_reason: "stop".into(),
                }],
                usage: Usage {
                    prompt_tokens: 1,
                    completion_tokens: 1,
                    total_tokens: 2,
                },
            })
        }
    }

    fn engine(provider: Arc<CleanProvider>) -> ReviewEngine {
        ReviewEngine::with_config(
            provider,
            Arc::new(ReviewCache::with_defaults()),
            EngineConfig {
                retry: RetryPolicy {
                    max_attempts: 1,
                    base_delay: Duration::from_millis(1),
                    attempt_timeout: Duration::from_secs(5),
                },
                orchestrator: OrchestratorConfig::default(),
            },
        )
    }

    #[tokio::test]
    async fn config_errors_are_rejected_before_any_network_call() {
        let provider = CleanProvider::new();
        let engine = engine(provider.clone());

        let empty_personas = ReviewRequest::new("code", vec![]);
        assert!(matches!(
            engine.review(empty_personas).await,
            Err(EngineError::EmptyPersonaSet)
        ));

        let unknown = ReviewRequest::new("code", vec!["astrologer".into()]);
        assert!(matches!(
            engine.review(unknown).await,
            Err(EngineError::UnknownPersona(id)) if id == "astrologer"
        ));

        let empty_source = ReviewRequest::new("", vec!["security".into()]);
        assert!(matches!(
            engine.review(empty_source).await,
            Err(EngineError::EmptySource)
        ));

        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn quick_review_completes_and_caches() {
        let provider = CleanProvider::new();
        let engine = engine(provider.clone());

        let request = ReviewRequest::new("fn main() {}", vec!["security".into()])
            .with_mode(ReviewMode::Quick);

        let first = engine.review(request.clone()).await.expect("session");
        assert_eq!(first.status, SessionStatus::Complete);
        assert_eq!(
            first.consensus.as_ref().map(|c| c.decision),
            Some(VoteDecision::Approve)
        );
        let calls_after_first = provider.call_count();
        assert_eq!(calls_after_first, 1);

        let second = engine.review(request).await.expect("cached session");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(provider.call_count(), calls_after_first);
    }

    #[tokio::test]
    async fn custom_persona_catalogue_replaces_builtins() {
        let provider = CleanProvider::new();
        let engine = engine(provider).with_personas(vec![Persona::new(
            "linter",
            "HouseLinter",
            "You are HouseLinter.",
            ["style"],
        )]);

        // Built-ins are gone.
        let builtin = ReviewRequest::new("code", vec!["security".into()])
            .with_mode(ReviewMode::Quick);
        assert!(matches!(
            engine.review(builtin).await,
            Err(EngineError::UnknownPersona(_))
        ));

        // The custom persona works.
        let custom = ReviewRequest::new("code", vec!["linter".into()])
            .with_mode(ReviewMode::Quick);
        let session = engine.review(custom).await.expect("session");
        assert_eq!(session.personas, vec!["linter"]);
    }
}
