//! Command-line interface for consensys.
//!
//! The CLI is a thin consumer of the engine: it loads the source text,
//! builds a `ReviewRequest`, prints progress lines from the debate event
//! stream, renders the sealed session as plain text or JSON, and maps the
//! final decision to a process exit code (APPROVE -> 0, REJECT -> 1 when
//! the configured severity threshold is met, ABSTAIN -> 0 with a warning,
//! failed sessions -> 2).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;

use crate::cache::ReviewCache;
use crate::engine::ReviewEngine;
use crate::llm::HttpLlmClient;
use crate::merge::merge_fixes;
use crate::orchestrator::DebateEvent;
use crate::personas::PersonaRegistry;
use crate::review::{
    DebateSession, ReviewMode, ReviewRequest, SessionStatus, Severity, VoteDecision,
};

/// Exit code for reviews rejected at or above the severity threshold.
const EXIT_REJECTED: i32 = 1;

/// Exit code for sessions that failed to produce a verdict.
const EXIT_FAILED: i32 = 2;

#[derive(Debug, Parser)]
#[command(
    name = "consensys",
    version,
    about = "Multi-agent AI code review with debate and voting"
)]
pub struct Cli {
    /// Log level when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a debate review on code.
    Review {
        /// Path of the file to review.
        file: Option<PathBuf>,

        /// Review an inline code snippet instead of a file.
        #[arg(short = 'c', long, conflicts_with = "file")]
        code: Option<String>,

        /// Additional context about the code.
        #[arg(short = 'x', long)]
        context: Option<String>,

        /// One-round quick review: no rebuttal or vote rounds.
        #[arg(long)]
        quick: bool,

        /// Comma-separated persona ids (defaults to all built-ins).
        #[arg(long, value_delimiter = ',')]
        personas: Vec<String>,

        /// Skip the cache lookup; the fresh result is still written back.
        #[arg(long)]
        force_fresh: bool,

        /// Deadline in seconds for each reviewer call.
        #[arg(long, default_value_t = 120)]
        round_deadline: u64,

        /// Overall session deadline in seconds.
        #[arg(long)]
        session_deadline: Option<u64>,

        /// Minimum surfaced severity for a REJECT to exit non-zero.
        #[arg(long, default_value = "HIGH")]
        fail_on: String,

        /// Print the sealed session as JSON instead of a text summary.
        #[arg(long)]
        json: bool,

        /// Print the merged fix output and any fix conflicts.
        #[arg(long)]
        show_fixes: bool,
    },

    /// List the available reviewer personas.
    Personas,
}

/// Parses command-line arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Runs the parsed command, returning the process exit code.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<i32> {
    match cli.command {
        Command::Personas => {
            list_personas();
            Ok(0)
        }
        Command::Review {
            file,
            code,
            context,
            quick,
            personas,
            force_fresh,
            round_deadline,
            session_deadline,
            fail_on,
            json,
            show_fixes,
        } => {
            let fail_on: Severity = fail_on
                .parse()
                .map_err(|e: String| anyhow::anyhow!(e))
                .context("invalid --fail-on value")?;
            let (source, default_context) = read_source(file.as_deref(), code)?;
            let context = context.or(default_context).unwrap_or_default();

            let persona_ids = if personas.is_empty() {
                PersonaRegistry::builtin()
                    .all()
                    .map(|p| p.id.clone())
                    .collect()
            } else {
                personas
            };

            let mut request = ReviewRequest::new(source, persona_ids)
                .with_context(context)
                .with_mode(if quick {
                    ReviewMode::Quick
                } else {
                    ReviewMode::Full
                })
                .with_round_deadline(Duration::from_secs(round_deadline));
            if let Some(secs) = session_deadline {
                request = request.with_session_deadline(Duration::from_secs(secs));
            }
            if force_fresh {
                request = request.force_fresh();
            }

            run_review(request, fail_on, json, show_fixes).await
        }
    }
}

fn list_personas() {
    let registry = PersonaRegistry::builtin();
    for persona in registry.all() {
        println!(
            "{:<14} {:<20} focus: {}",
            persona.id,
            persona.name,
            persona.focus.join(", ")
        );
    }
}

/// Loads the source text plus a default context derived from the file name.
fn read_source(
    file: Option<&Path>,
    code: Option<String>,
) -> anyhow::Result<(String, Option<String>)> {
    match (file, code) {
        (Some(path), _) => {
            let source = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let default_context = path
                .file_name()
                .map(|name| format!("File: {}", name.to_string_lossy()));
            Ok((source, default_context))
        }
        (None, Some(code)) => Ok((code, None)),
        (None, None) => bail!("provide either a file path or --code"),
    }
}

async fn run_review(
    request: ReviewRequest,
    fail_on: Severity,
    json: bool,
    show_fixes: bool,
) -> anyhow::Result<i32> {
    let provider = Arc::new(HttpLlmClient::from_env()?);
    let cache = Arc::new(ReviewCache::with_defaults());
    let (events_tx, mut events_rx) = mpsc::channel(64);
    let engine = ReviewEngine::new(provider, cache).with_events(events_tx);

    let progress = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            print_event(&event);
        }
    });

    let source = request.source.clone();
    let session = engine.review(request).await?;

    // Dropping the engine closes the event channel so the printer drains.
    drop(engine);
    let _ = progress.await;

    if json {
        println!("{}", serde_json::to_string_pretty(session.as_ref())?);
    } else {
        print_summary(&session);
        if show_fixes {
            print_fixes(&source, &session);
        }
    }

    Ok(exit_code(&session, fail_on))
}

fn print_event(event: &DebateEvent) {
    match event {
        DebateEvent::SessionStarted {
            mode, personas, ..
        } => eprintln!("session started: {:?} mode, {} reviewers", mode, personas),
        DebateEvent::RoundStarted { round, .. } => eprintln!("round {} started", round),
        DebateEvent::ReviewReceived {
            persona,
            status,
            findings,
            ..
        } => eprintln!("  {}: {:?}, {} findings", persona, status, findings),
        DebateEvent::RoundCompleted {
            round, degraded, ..
        } => eprintln!("round {} completed ({} degraded)", round, degraded),
        DebateEvent::SessionCompleted { status, .. } => {
            eprintln!("session completed: {:?}", status)
        }
    }
}

fn print_summary(session: &DebateSession) {
    println!("session {}", session.id);
    println!("status: {:?}", session.status);

    if let Some(failure) = &session.failure {
        println!("failure: {}", failure);
    }

    let degraded = session.degraded_personas();
    if !degraded.is_empty() {
        println!("degraded reviewers:");
        for (persona, round, status) in degraded {
            println!("  {} (round {}): {:?}", persona, round, status);
        }
    }

    let Some(consensus) = &session.consensus else {
        println!("no consensus produced");
        return;
    };

    println!("decision: {}", consensus.decision);
    if session.mode == ReviewMode::Full {
        let tally: Vec<String> = consensus
            .tally
            .iter()
            .map(|(decision, count)| format!("{}: {}", decision, count))
            .collect();
        println!("votes: {}", tally.join(", "));
    }

    if consensus.key_issues.is_empty() {
        println!("no key issues");
    } else {
        println!("key issues:");
        for issue in &consensus.key_issues {
            println!(
                "  [{}] {} ({})",
                issue.severity,
                issue.description,
                issue.supporters.join(", ")
            );
        }
    }

    for disagreement in &consensus.disagreements {
        match disagreement {
            crate::review::Disagreement::DissentingVote {
                persona, decision, ..
            } => println!("dissent: {} voted {}", persona, decision),
            crate::review::Disagreement::CriticalOverride { issue } => {
                println!("override: critical issue forced REJECT: {}", issue)
            }
        }
    }
}

fn print_fixes(source: &str, session: &DebateSession) {
    let Some(consensus) = &session.consensus else {
        return;
    };
    if consensus.accepted_fixes.is_empty() {
        println!("no accepted fixes");
        return;
    }

    let report = merge_fixes(source, &consensus.accepted_fixes);
    println!(
        "applied {} of {} fixes",
        report.applied.len(),
        consensus.accepted_fixes.len()
    );
    for conflict in &report.conflicts {
        println!("  conflict: {}", conflict.reason);
    }
    println!("--- merged ---");
    println!("{}", report.merged);
}

/// Maps the sealed session to a process exit code.
fn exit_code(session: &DebateSession, fail_on: Severity) -> i32 {
    if session.status == SessionStatus::Failed {
        return EXIT_FAILED;
    }
    let Some(consensus) = &session.consensus else {
        return EXIT_FAILED;
    };
    match consensus.decision {
        VoteDecision::Approve => 0,
        VoteDecision::Abstain => {
            tracing::warn!("reviewers abstained; treating as pass");
            0
        }
        VoteDecision::Reject => match consensus.max_severity() {
            Some(severity) if severity >= fail_on => EXIT_REJECTED,
            _ => 0,
        },
    }
}
