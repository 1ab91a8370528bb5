//! Finding clustering: grouping equivalent findings across personas.
//!
//! Two findings are equivalent when their line references are compatible
//! (ranges overlap, or both are absent) and their descriptions share enough
//! vocabulary. Similarity is the overlap coefficient over stopword-filtered
//! token sets; clustering is the transitive closure of the pairwise
//! relation, computed with a union-find, so the result is independent of
//! input order.

use std::collections::{BTreeSet, HashSet};

use crate::review::{Finding, KeyIssue, Severity};

/// Minimum overlap coefficient for two descriptions to be considered the
/// same issue.
pub const DESCRIPTION_OVERLAP_THRESHOLD: f64 = 0.25;

/// Words carrying no signal for issue identity.
const STOPWORDS: &[&str] = &[
    "a", "an", "and", "at", "be", "by", "for", "from", "in", "is", "it", "of", "on", "or", "the",
    "this", "to", "via", "with",
];

/// Lowercase alphanumeric tokens of a description, stopwords removed.
fn tokenize(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty() && !STOPWORDS.contains(token))
        .map(str::to_string)
        .collect()
}

/// Overlap coefficient between two descriptions: |A ∩ B| / min(|A|, |B|).
///
/// Preferred over plain Jaccard because a short description that is wholly
/// contained in a longer one should score high.
pub fn description_overlap(a: &str, b: &str) -> f64 {
    let set_a = tokenize(a);
    let set_b = tokenize(b);
    let smaller = set_a.len().min(set_b.len());
    if smaller == 0 {
        return 0.0;
    }
    let intersection = set_a.intersection(&set_b).count();
    intersection as f64 / smaller as f64
}

/// Whether two findings' line references allow them to be merged: both
/// absent, or both present and overlapping. A located finding never merges
/// with an unlocated one.
fn lines_compatible(a: &Finding, b: &Finding) -> bool {
    match (a.line, b.line) {
        (None, None) => true,
        (Some(ra), Some(rb)) => ra.overlaps(&rb),
        _ => false,
    }
}

/// The pairwise equivalence relation underlying clustering.
pub fn equivalent(a: &Finding, b: &Finding, threshold: f64) -> bool {
    lines_compatible(a, b) && description_overlap(&a.description, &b.description) >= threshold
}

/// Union-find over finding indices.
struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(len: usize) -> Self {
        Self {
            parent: (0..len).collect(),
        }
    }

    fn find(&mut self, i: usize) -> usize {
        if self.parent[i] != i {
            let root = self.find(self.parent[i]);
            self.parent[i] = root;
        }
        self.parent[i]
    }

    fn union(&mut self, a: usize, b: usize) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            // Attach the larger root under the smaller so cluster identity
            // is stable regardless of union order.
            let (lo, hi) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent[hi] = lo;
        }
    }
}

/// Clusters findings into issues by transitive closure of `equivalent`.
///
/// Returns every cluster (including single-member ones); surfacing rules are
/// applied by the caller. Output ordering is deterministic: most severe
/// first, then by canonical description.
pub fn cluster_findings(findings: &[Finding], threshold: f64) -> Vec<KeyIssue> {
    if findings.is_empty() {
        return Vec::new();
    }

    let mut uf = UnionFind::new(findings.len());
    for i in 0..findings.len() {
        for j in (i + 1)..findings.len() {
            if equivalent(&findings[i], &findings[j], threshold) {
                uf.union(i, j);
            }
        }
    }

    let mut clusters: std::collections::HashMap<usize, Vec<usize>> =
        std::collections::HashMap::new();
    for i in 0..findings.len() {
        let root = uf.find(i);
        clusters.entry(root).or_default().push(i);
    }

    let mut issues: Vec<KeyIssue> = clusters
        .into_values()
        .map(|members| build_issue(findings, &members))
        .collect();

    issues.sort_by(|a, b| {
        b.severity
            .cmp(&a.severity)
            .then_with(|| a.description.cmp(&b.description))
    });
    issues
}

/// Builds one issue from a cluster's member indices.
fn build_issue(findings: &[Finding], members: &[usize]) -> KeyIssue {
    let severity = members
        .iter()
        .map(|&i| findings[i].severity)
        .max()
        .unwrap_or(Severity::Low);

    // Canonical description: the most severe member; ties broken
    // lexicographically so the choice is order-independent.
    let description = members
        .iter()
        .map(|&i| &findings[i])
        .filter(|f| f.severity == severity)
        .map(|f| f.description.clone())
        .min()
        .unwrap_or_default();

    let supporters: BTreeSet<String> = members
        .iter()
        .map(|&i| findings[i].persona.clone())
        .collect();

    let mut finding_ids: Vec<_> = members.iter().map(|&i| findings[i].id).collect();
    finding_ids.sort();

    KeyIssue {
        description,
        severity,
        supporters: supporters.into_iter().collect(),
        findings: finding_ids,
    }
}
