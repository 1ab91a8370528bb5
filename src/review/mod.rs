//! Review data model: findings, reviews, votes, sessions.

mod types;

pub use types::{
    AgentReview, CallStatus, ConsensusResult, DebateSession, Disagreement, Finding, Fingerprint,
    KeyIssue, LineRange, QuorumFailure, ReviewMode, ReviewRequest, Round, SessionStatus, Severity,
    SuggestedFix, Vote, VoteDecision,
};
