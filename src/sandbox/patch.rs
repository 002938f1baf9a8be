//! Unified-diff patch applier with line-number self-correction.
//!
//! Models frequently emit diffs whose `@@` headers are off by a few lines.
//! Rather than rejecting those, each hunk's source position is recomputed by
//! scanning the file for the hunk's pre-image; only a pre-image that appears
//! nowhere fails the patch. Application is staged in a throwaway directory
//! and committed atomically, so the target file is never left half-patched.

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use tracing::{debug, warn};

use super::PathGuard;
use crate::error::AgentError;

#[derive(Debug, Clone, PartialEq)]
enum HunkLine {
    Context(String),
    Remove(String),
    Add(String),
}

#[derive(Debug, Clone)]
struct Hunk {
    /// 1-based source start line as claimed by the `@@` header.
    src_start: usize,
    lines: Vec<HunkLine>,
}

impl Hunk {
    /// Lines the source file must contain for this hunk to apply.
    fn pre_image(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter_map(|l| match l {
                HunkLine::Context(s) | HunkLine::Remove(s) => Some(s.as_str()),
                HunkLine::Add(_) => None,
            })
            .collect()
    }
}

#[derive(Debug)]
struct ParsedDiff {
    source: String,
    target: String,
    hunks: Vec<Hunk>,
}

/// A hunk with its source position corrected against the actual file.
#[derive(Debug)]
struct CorrectedHunk {
    /// 0-based index into the source lines where the pre-image begins.
    src_index: usize,
    lines: Vec<HunkLine>,
}

#[derive(Debug)]
pub struct PatchOutcome {
    /// Absolute path of the replaced file.
    pub target: PathBuf,
    /// The target path as it appeared in the diff header.
    pub target_display: String,
}

/// Normalize diff text: `\r\n` to `\n`, non-breaking spaces to plain
/// spaces, trailing whitespace stripped per line.
fn normalize(diff: &str) -> String {
    diff.replace("\r\n", "\n")
        .replace('\u{a0}', " ")
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
}

fn strip_diff_prefix(path: &str) -> &str {
    path.strip_prefix("a/")
        .or_else(|| path.strip_prefix("b/"))
        .unwrap_or(path)
}

fn parse_diff(normalized: &str) -> Result<ParsedDiff, AgentError> {
    let mut source = None;
    let mut target = None;
    let mut hunks: Vec<Hunk> = Vec::new();
    let mut current: Option<Hunk> = None;

    let header_re = regex::Regex::new(r"^@@ -(\d+)(?:,(\d+))? \+(\d+)(?:,(\d+))? @@").unwrap();

    for line in normalized.lines() {
        if let Some(rest) = line.strip_prefix("--- ") {
            source = Some(strip_diff_prefix(rest.trim()).to_string());
            continue;
        }
        if let Some(rest) = line.strip_prefix("+++ ") {
            target = Some(strip_diff_prefix(rest.trim()).to_string());
            continue;
        }
        if let Some(caps) = header_re.captures(line) {
            if let Some(hunk) = current.take() {
                hunks.push(hunk);
            }
            let src_start: usize = caps[1].parse().unwrap_or(1);
            current = Some(Hunk {
                src_start,
                lines: Vec::new(),
            });
            continue;
        }
        let mut hunk_done = false;
        if let Some(hunk) = current.as_mut() {
            if line.starts_with('\\') {
                // "\ No newline at end of file" marker
                continue;
            }
            if let Some(body) = line.strip_prefix('+') {
                hunk.lines.push(HunkLine::Add(body.to_string()));
            } else if let Some(body) = line.strip_prefix('-') {
                hunk.lines.push(HunkLine::Remove(body.to_string()));
            } else if let Some(body) = line.strip_prefix(' ') {
                hunk.lines.push(HunkLine::Context(body.to_string()));
            } else if line.is_empty() {
                // Normalization trims a context line that held only a space.
                hunk.lines.push(HunkLine::Context(String::new()));
            } else {
                // Unrecognized line ends the hunk (e.g. trailing commentary).
                hunk_done = true;
            }
        }
        if hunk_done {
            if let Some(hunk) = current.take() {
                hunks.push(hunk);
            }
        }
    }
    if let Some(hunk) = current.take() {
        hunks.push(hunk);
    }

    let source = source.ok_or_else(|| {
        AgentError::PatchNotApplicable("diff is missing a '--- ' source header".to_string())
    })?;
    let target = target.ok_or_else(|| {
        AgentError::PatchNotApplicable("diff is missing a '+++ ' target header".to_string())
    })?;
    if hunks.is_empty() || hunks.iter().all(|h| h.lines.is_empty()) {
        return Err(AgentError::PatchNotApplicable(
            "diff contains no hunks".to_string(),
        ));
    }
    Ok(ParsedDiff {
        source,
        target,
        hunks,
    })
}

fn lines_match(source: &[&str], start: usize, pre_image: &[&str]) -> bool {
    if start + pre_image.len() > source.len() {
        return false;
    }
    pre_image
        .iter()
        .zip(&source[start..start + pre_image.len()])
        .all(|(expected, actual)| expected.trim_end() == actual.trim_end())
}

/// Recompute each hunk's source position by scanning for its pre-image.
///
/// The scan starts at the end of the previous hunk so corrected hunks stay
/// ordered and non-overlapping. A pre-image that appears nowhere past the
/// cursor fails the whole patch.
fn correct_hunks(source_lines: &[&str], hunks: &[Hunk]) -> Result<Vec<CorrectedHunk>, AgentError> {
    let mut corrected = Vec::with_capacity(hunks.len());
    let mut cursor = 0usize;

    for (n, hunk) in hunks.iter().enumerate() {
        let pre_image = hunk.pre_image();
        if pre_image.is_empty() {
            // Pure insertion: trust the header, clamped to the file.
            let index = hunk.src_start.saturating_sub(1).min(source_lines.len());
            corrected.push(CorrectedHunk {
                src_index: index.max(cursor),
                lines: hunk.lines.clone(),
            });
            cursor = index.max(cursor);
            continue;
        }

        let claimed = hunk.src_start.saturating_sub(1);
        let found = (cursor..=source_lines.len().saturating_sub(pre_image.len()))
            .find(|&start| lines_match(source_lines, start, &pre_image));

        match found {
            Some(start) => {
                if start != claimed {
                    debug!(
                        "Hunk {} header claimed line {}, pre-image found at line {}",
                        n + 1,
                        claimed + 1,
                        start + 1
                    );
                }
                cursor = start + pre_image.len();
                corrected.push(CorrectedHunk {
                    src_index: start,
                    lines: hunk.lines.clone(),
                });
            }
            None => {
                return Err(AgentError::PatchNotApplicable(format!(
                    "hunk {} pre-image does not match the source file (first line: {:?})",
                    n + 1,
                    pre_image.first().copied().unwrap_or("")
                )));
            }
        }
    }
    Ok(corrected)
}

/// Apply corrected hunks, producing the patched content. Untouched lines are
/// carried over from the source byte-for-byte.
fn apply_hunks(source_lines: &[&str], hunks: &[CorrectedHunk]) -> String {
    let mut output: Vec<String> = Vec::with_capacity(source_lines.len());
    let mut src_pos = 0usize;

    for hunk in hunks {
        while src_pos < hunk.src_index && src_pos < source_lines.len() {
            output.push(source_lines[src_pos].to_string());
            src_pos += 1;
        }
        for line in &hunk.lines {
            match line {
                HunkLine::Context(_) => {
                    if src_pos < source_lines.len() {
                        output.push(source_lines[src_pos].to_string());
                        src_pos += 1;
                    }
                }
                HunkLine::Remove(_) => {
                    src_pos += 1;
                }
                HunkLine::Add(s) => {
                    output.push(s.clone());
                }
            }
        }
    }
    while src_pos < source_lines.len() {
        output.push(source_lines[src_pos].to_string());
        src_pos += 1;
    }
    output.join("\n")
}

/// Apply a unified diff against the sandbox.
///
/// Guarantees: the target file is unchanged on disk unless the full patch
/// applies cleanly, and the staging directory is always removed.
pub fn apply_patch(guard: &PathGuard, diff_content: &str) -> Result<PatchOutcome, AgentError> {
    let normalized = normalize(diff_content);
    let parsed = parse_diff(&normalized)?;

    if parsed.source == "/dev/null" {
        return Err(AgentError::PatchNotApplicable(
            "creating new files via patch is not supported; use create_file".to_string(),
        ));
    }

    // Header paths may carry the sandbox directory name; containment is
    // enforced by the guard either way.
    let source_rel = parsed.source.strip_prefix("sandbox/").unwrap_or(&parsed.source);
    let target_rel = parsed.target.strip_prefix("sandbox/").unwrap_or(&parsed.target);

    let source_path = guard.safe_existing_path(source_rel)?;
    let target_path = guard.safe_path(target_rel)?;

    let original = fs::read_to_string(&source_path)
        .map_err(|e| AgentError::StoreError(format!("cannot read source file: {}", e)))?;
    let had_trailing_newline = original.ends_with('\n');
    let source_lines: Vec<&str> = original.lines().collect();

    let corrected = correct_hunks(&source_lines, &parsed.hunks)?;

    // Stage in a fresh temporary directory; `TempDir` removes it on every
    // exit path.
    let staging = tempfile::Builder::new()
        .prefix("patch-stage-")
        .tempdir()
        .map_err(|e| AgentError::StoreError(format!("cannot create staging dir: {}", e)))?;
    let staged_file = staging.path().join("staged");
    fs::write(&staged_file, &original)
        .map_err(|e| AgentError::StoreError(format!("cannot stage source copy: {}", e)))?;

    let mut patched = apply_hunks(&source_lines, &corrected);
    if had_trailing_newline && !patched.ends_with('\n') {
        patched.push('\n');
    }
    fs::write(&staged_file, &patched)
        .map_err(|e| AgentError::StoreError(format!("cannot write staged result: {}", e)))?;

    // Commit: sibling temp file + atomic rename over the target.
    if let Some(parent) = target_path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| AgentError::StoreError(format!("cannot create target dir: {}", e)))?;
    }
    let parent = target_path
        .parent()
        .ok_or_else(|| AgentError::InvalidArgument("target path has no parent".to_string()))?;
    let mut committed = tempfile::NamedTempFile::new_in(parent)
        .map_err(|e| AgentError::StoreError(format!("cannot create commit temp: {}", e)))?;
    committed
        .write_all(patched.as_bytes())
        .map_err(|e| AgentError::StoreError(format!("cannot write commit temp: {}", e)))?;
    committed.persist(&target_path).map_err(|e| {
        warn!("Patch commit failed for {}: {}", target_path.display(), e);
        AgentError::StoreError(format!("cannot commit patched file: {}", e))
    })?;

    debug!(
        "Patch applied: {} hunks onto {}",
        parsed.hunks.len(),
        target_path.display()
    );
    Ok(PatchOutcome {
        target: target_path,
        target_display: parsed.target.clone(),
    })
}
