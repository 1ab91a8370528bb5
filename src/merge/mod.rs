//! Fix merger: combining non-conflicting suggested fixes into one text.
//!
//! Fixes whose anchor ranges overlap any other input fix are excluded as
//! conflicts; overlap knocks out both sides rather than arbitrarily
//! preferring one. The surviving fixes are applied bottom-up (highest start
//! line first) so earlier edits are never invalidated by offset shifts.
//! Every input fix ends up in exactly one of the applied or conflicted
//! sets.

use serde::{Deserialize, Serialize};

use crate::review::SuggestedFix;

/// A fix excluded from the merge, with the reason.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixConflict {
    /// The excluded fix.
    pub fix: SuggestedFix,
    /// Why it was excluded.
    pub reason: String,
}

/// Result of merging a set of suggested fixes into a source text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeReport {
    /// The source text with all applied fixes in place.
    pub merged: String,
    /// Fixes that were applied, in application order (bottom-up).
    pub applied: Vec<SuggestedFix>,
    /// Fixes that were excluded.
    pub conflicts: Vec<FixConflict>,
}

impl MergeReport {
    /// Whether anything was actually changed.
    pub fn changed(&self) -> bool {
        !self.applied.is_empty()
    }
}

/// Merges `fixes` into `source`.
///
/// Anchor ranges are 1-indexed inclusive line ranges; a fix whose anchor
/// extends past the end of the source is a conflict, not an applied edit.
pub fn merge_fixes(source: &str, fixes: &[SuggestedFix]) -> MergeReport {
    let lines: Vec<&str> = source.lines().collect();
    let line_count = lines.len() as u32;

    let mut conflicted = vec![false; fixes.len()];
    let mut reasons: Vec<Option<String>> = vec![None; fixes.len()];

    // Overlap is mutual: both members of an overlapping pair are excluded.
    for i in 0..fixes.len() {
        for j in (i + 1)..fixes.len() {
            if fixes[i].lines.overlaps(&fixes[j].lines) {
                conflicted[i] = true;
                conflicted[j] = true;
                let reason_i = format!(
                    "anchor lines {}-{} overlap another fix at lines {}-{}",
                    fixes[i].lines.start, fixes[i].lines.end, fixes[j].lines.start, fixes[j].lines.end
                );
                let reason_j = format!(
                    "anchor lines {}-{} overlap another fix at lines {}-{}",
                    fixes[j].lines.start, fixes[j].lines.end, fixes[i].lines.start, fixes[i].lines.end
                );
                reasons[i].get_or_insert(reason_i);
                reasons[j].get_or_insert(reason_j);
            }
        }
    }

    for (i, fix) in fixes.iter().enumerate() {
        if fix.lines.start == 0 || fix.lines.end > line_count {
            conflicted[i] = true;
            reasons[i].get_or_insert(format!(
                "anchor lines {}-{} are outside the source ({} lines)",
                fix.lines.start, fix.lines.end, line_count
            ));
        }
    }

    let mut applied: Vec<SuggestedFix> = Vec::new();
    let mut conflicts: Vec<FixConflict> = Vec::new();
    for (i, fix) in fixes.iter().enumerate() {
        if conflicted[i] {
            conflicts.push(FixConflict {
                fix: fix.clone(),
                reason: reasons[i].take().unwrap_or_default(),
            });
        } else {
            applied.push(fix.clone());
        }
    }

    // Bottom-up: descending start line, so line numbers below each edit
    // stay valid while the edits above it are still pending.
    applied.sort_by(|a, b| b.lines.start.cmp(&a.lines.start));

    let mut merged_lines: Vec<String> = lines.iter().map(|l| l.to_string()).collect();
    for fix in &applied {
        let start = (fix.lines.start - 1) as usize;
        let end = fix.lines.end as usize;
        let replacement: Vec<String> = fix.replacement.lines().map(str::to_string).collect();
        merged_lines.splice(start..end, replacement);
    }

    tracing::debug!(
        input = fixes.len(),
        applied = applied.len(),
        conflicted = conflicts.len(),
        "Merged suggested fixes"
    );

    MergeReport {
        merged: merged_lines.join("\n"),
        applied,
        conflicts,
    }
}
