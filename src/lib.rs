//! consensys: multi-agent code review with debate and voting.
//!
//! Several opinionated reviewer personas analyze the same source text
//! concurrently, rebut each other's findings across rounds, and converge on
//! one collective verdict. The engine owns the round-based protocol, the
//! per-call retry/repair contract, finding clustering and voting, fix
//! merging, and a content-addressed result cache with single-flight
//! coalescing.

pub mod cache;
pub mod cli;
pub mod consensus;
pub mod engine;
pub mod error;
pub mod llm;
pub mod merge;
pub mod orchestrator;
pub mod personas;
pub mod review;
pub mod reviewer;

pub use engine::{EngineConfig, ReviewEngine};
pub use error::{EngineError, EngineResult, LlmError};
