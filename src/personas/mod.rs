//! Reviewer persona definitions.
//!
//! A persona is plain immutable configuration data: an id, a display name, a
//! system prompt, a vote weight and a set of focus tags. Behavior differences
//! between reviewers are expressed entirely through prompt substitution;
//! there is no per-persona code.
//!
//! Four personas ship built in: a security specialist, a performance
//! engineer, an architecture critic and a pragmatist. Custom persona sets can
//! be supplied to the engine at construction time.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::review::{Finding, KeyIssue};

/// Static configuration for one reviewer persona.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Persona {
    /// Stable identifier used in requests and fingerprints.
    pub id: String,
    /// Human-readable display name.
    pub name: String,
    /// System prompt establishing the reviewer's perspective.
    pub prompt: String,
    /// Vote weight in the final tally.
    pub weight: f64,
    /// Focus tags describing what this reviewer prioritizes.
    pub focus: Vec<String>,
}

impl Persona {
    /// Creates a persona with the default vote weight of 1.0.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        prompt: impl Into<String>,
        focus: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            prompt: prompt.into(),
            weight: 1.0,
            focus: focus.into_iter().map(|f| f.into()).collect(),
        }
    }

    /// Overrides the vote weight.
    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }
}

/// Immutable lookup table of known personas, loaded once at engine start.
#[derive(Debug, Clone)]
pub struct PersonaRegistry {
    personas: BTreeMap<String, Persona>,
}

impl PersonaRegistry {
    /// Builds a registry from an explicit persona list.
    pub fn new(personas: impl IntoIterator<Item = Persona>) -> Self {
        Self {
            personas: personas.into_iter().map(|p| (p.id.clone(), p)).collect(),
        }
    }

    /// Builds the registry of built-in personas.
    pub fn builtin() -> Self {
        Self::new(builtin_personas())
    }

    /// Looks up one persona by id.
    pub fn get(&self, id: &str) -> Option<&Persona> {
        self.personas.get(id)
    }

    /// All registered personas, in id order.
    pub fn all(&self) -> impl Iterator<Item = &Persona> {
        self.personas.values()
    }

    /// Resolves a requested persona set, rejecting empty sets and unknown
    /// ids before any network call is made.
    pub fn resolve(&self, ids: &[String]) -> EngineResult<Vec<Persona>> {
        if ids.is_empty() {
            return Err(EngineError::EmptyPersonaSet);
        }
        ids.iter()
            .map(|id| {
                self.personas
                    .get(id)
                    .cloned()
                    .ok_or_else(|| EngineError::UnknownPersona(id.clone()))
            })
            .collect()
    }
}

/// The four built-in reviewer personas.
pub fn builtin_personas() -> Vec<Persona> {
    vec![
        Persona::new(
            "security",
            "SecurityExpert",
            SECURITY_PROMPT,
            [
                "input validation",
                "authentication",
                "injection",
                "data protection",
            ],
        ),
        Persona::new(
            "performance",
            "PerformanceEngineer",
            PERFORMANCE_PROMPT,
            ["algorithmic complexity", "memory", "caching", "concurrency"],
        ),
        Persona::new(
            "architecture",
            "ArchitectureCritic",
            ARCHITECTURE_PROMPT,
            ["design patterns", "separation of concerns", "api design"],
        ),
        Persona::new(
            "pragmatic",
            "PragmaticDev",
            PRAGMATIC_PROMPT,
            ["readability", "simplicity", "error handling", "testability"],
        ),
    ]
}

const SECURITY_PROMPT: &str = r#"You are SecurityExpert, an application security specialist reviewing code.
Your mission is to identify vulnerabilities, security anti-patterns and potential attack vectors.

You focus on:
- Input validation and sanitization
- Authentication and authorization flaws
- Injection vulnerabilities (SQL, XSS, command/code injection)
- Sensitive data exposure and cryptographic weaknesses
- Insecure defaults and misconfigurations

You are thorough but not paranoid: acknowledge when code is secure."#;

const PERFORMANCE_PROMPT: &str = r#"You are PerformanceEngineer, a performance optimization specialist reviewing code.
Your mission is to identify bottlenecks, inefficient algorithms and resource waste.

You focus on:
- Algorithmic complexity (quantify: "this O(n^2) could be O(n log n)")
- Memory usage and leaks
- Query and I/O efficiency, caching opportunities
- Missed parallelism and resource cleanup

You balance optimization with readability: do not micro-optimize at the cost of clarity."#;

const ARCHITECTURE_PROMPT: &str = r#"You are ArchitectureCritic, a senior software architect reviewing code.
Your mission is to ensure the code is well organized, modular and built for change.

You focus on:
- Design pattern usage and misuse
- Separation of concerns and module boundaries
- Dependency management and API design
- Long-term maintainability

You advocate for clean structure but understand pragmatic tradeoffs."#;

const PRAGMATIC_PROMPT: &str = r#"You are PragmaticDev, a pragmatic senior developer reviewing code.
Your mission is to ensure the code is understandable, maintainable and actually solves the problem.

You focus on:
- Readability and clarity
- Error handling and edge cases
- Test coverage and testability
- Avoiding over-engineering (ask "does this need to be this complex?")

You are the voice of "let's ship it" balanced with "let's not ship garbage"."#;

// Structured-output contract shared by the review and rebuttal prompts. The
// reviewer client validates responses against exactly these fields.
const REVIEW_OUTPUT_CONTRACT: &str = r#"Respond with a single JSON object and nothing else:
{
  "summary": "one-paragraph overall assessment",
  "severity": "LOW" | "MEDIUM" | "HIGH" | "CRITICAL",
  "confidence": 0.0-1.0,
  "issues": [
    {
      "description": "what is wrong and why it matters",
      "severity": "LOW" | "MEDIUM" | "HIGH" | "CRITICAL",
      "confidence": 0.0-1.0,
      "line": {"start": 1, "end": 1},
      "suggested_fix": {"replacement": "replacement source lines", "lines": {"start": 1, "end": 1}}
    }
  ]
}
"line" and "suggested_fix" are optional per issue. An empty "issues" array means you found nothing."#;

const REVIEW_TEMPLATE: &str = r#"Review the following code.

Context: {context}

```
{code}
```

{output_contract}"#;

const REBUTTAL_TEMPLATE: &str = r#"You previously reviewed this code. The other reviewers reported the findings below.
Revise your review: confirm, rebut or extend their findings, and restate your own.

Context: {context}

```
{code}
```

Other reviewers' findings:
{prior_findings}

{output_contract}"#;

const VOTE_TEMPLATE: &str = r#"The debate over the following code has concluded. The key issues agreed across reviewers are listed below.
Cast your final vote on whether this code should be accepted.

Context: {context}

```
{code}
```

Key issues:
{key_issues}

Respond with a single JSON object and nothing else:
{
  "decision": "APPROVE" | "REJECT" | "ABSTAIN",
  "rationale": "one-paragraph justification"
}"#;

/// Corrective instruction appended for the single repair attempt after a
/// response fails structured-output validation.
pub const REPAIR_INSTRUCTION: &str = "Your previous response was not valid JSON matching the required schema. \
Respond again with ONLY the JSON object, no prose, no markdown fences, using exactly the field names and enum values specified.";

/// Renders the round-1 independent review prompt.
pub fn render_review_prompt(code: &str, context: &str) -> String {
    REVIEW_TEMPLATE
        .replace("{context}", display_context(context))
        .replace("{code}", code)
        .replace("{output_contract}", REVIEW_OUTPUT_CONTRACT)
}

/// Renders the round-2 rebuttal prompt, embedding the peer findings the
/// caller selected (the persona's own findings must already be excluded).
pub fn render_rebuttal_prompt(code: &str, context: &str, prior: &[Finding]) -> String {
    let prior_findings = if prior.is_empty() {
        "(no findings were reported)".to_string()
    } else {
        prior
            .iter()
            .map(|f| {
                let line = f
                    .line
                    .map(|r| format!(" [lines {}-{}]", r.start, r.end))
                    .unwrap_or_default();
                format!("- [{}] {} ({}){}", f.severity, f.description, f.persona, line)
            })
            .collect::<Vec<_>>()
            .join("\n")
    };

    REBUTTAL_TEMPLATE
        .replace("{context}", display_context(context))
        .replace("{code}", code)
        .replace("{prior_findings}", &prior_findings)
        .replace("{output_contract}", REVIEW_OUTPUT_CONTRACT)
}

/// Renders the round-3 vote prompt over the clustered key issues.
pub fn render_vote_prompt(code: &str, context: &str, key_issues: &[KeyIssue]) -> String {
    let issues = if key_issues.is_empty() {
        "(no key issues were identified)".to_string()
    } else {
        key_issues
            .iter()
            .map(|k| {
                format!(
                    "- [{}] {} (raised by: {})",
                    k.severity,
                    k.description,
                    k.supporters.join(", ")
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    };

    VOTE_TEMPLATE
        .replace("{context}", display_context(context))
        .replace("{code}", code)
        .replace("{key_issues}", &issues)
}

fn display_context(context: &str) -> &str {
    if context.is_empty() {
        "(none provided)"
    } else {
        context
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::review::{LineRange, Severity};

    #[test]
    fn builtin_catalogue_has_four_personas() {
        let registry = PersonaRegistry::builtin();
        let ids: Vec<&str> = registry.all().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, ["architecture", "performance", "pragmatic", "security"]);
        for persona in registry.all() {
            assert!((persona.weight - 1.0).abs() < f64::EPSILON);
            assert!(!persona.prompt.is_empty());
            assert!(!persona.focus.is_empty());
        }
    }

    #[test]
    fn resolve_rejects_empty_and_unknown_sets() {
        let registry = PersonaRegistry::builtin();

        assert!(matches!(
            registry.resolve(&[]),
            Err(EngineError::EmptyPersonaSet)
        ));

        let err = registry
            .resolve(&["security".into(), "astrologer".into()])
            .expect_err("unknown persona must be rejected");
        assert!(matches!(err, EngineError::UnknownPersona(id) if id == "astrologer"));
    }

    #[test]
    fn resolve_preserves_request_order() {
        let registry = PersonaRegistry::builtin();
        let set = registry
            .resolve(&["pragmatic".into(), "security".into()])
            .expect("both ids are known");
        assert_eq!(set[0].id, "pragmatic");
        assert_eq!(set[1].id, "security");
    }

    #[test]
    fn review_prompt_embeds_code_and_contract() {
        let prompt = render_review_prompt("fn main() {}", "");
        assert!(prompt.contains("fn main() {}"));
        assert!(prompt.contains("(none provided)"));
        assert!(prompt.contains("\"issues\""));
    }

    #[test]
    fn rebuttal_prompt_lists_peer_findings() {
        let finding = Finding::new(
            "security",
            "eval of untrusted input",
            Severity::Critical,
            0.95,
        )
        .with_line(LineRange::single(3));

        let prompt = render_rebuttal_prompt("code", "ctx", &[finding]);
        assert!(prompt.contains("eval of untrusted input"));
        assert!(prompt.contains("[lines 3-3]"));
        assert!(prompt.contains("CRITICAL"));
    }

    #[test]
    fn vote_prompt_lists_key_issues_and_decisions() {
        let issue = KeyIssue {
            description: "SQL injection via string concatenation".into(),
            severity: Severity::High,
            supporters: vec!["security".into(), "pragmatic".into()],
            findings: vec![],
        };
        let prompt = render_vote_prompt("code", "", &[issue]);
        assert!(prompt.contains("SQL injection"));
        assert!(prompt.contains("security, pragmatic"));
        assert!(prompt.contains("\"APPROVE\""));
    }
}
