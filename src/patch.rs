//! Unified diff parsing and application scoped to a project root.
//!
//! Patches are the only write path for automated fixes. Every target path is
//! validated against the project root before anything touches disk, and any
//! overwritten file is backed up under `.patchup/patch_backups/` first.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PatchError {
    #[error("invalid diff: {0}")]
    InvalidDiff(String),
    #[error("unsafe path in diff: {0}")]
    UnsafePath(String),
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HunkLine {
    Context(String),
    Remove(String),
    Add(String),
}

#[derive(Debug, Clone)]
pub struct Hunk {
    pub old_start: usize,
    pub old_count: usize,
    pub new_start: usize,
    pub new_count: usize,
    pub lines: Vec<HunkLine>,
}

#[derive(Debug, Clone)]
pub struct FilePatch {
    /// Path relative to the project root.
    pub path: PathBuf,
    pub hunks: Vec<Hunk>,
    pub is_new_file: bool,
    /// The new side ends without a trailing newline.
    pub no_trailing_newline: bool,
}

fn strip_diff_prefix(raw: &str) -> &str {
    raw.strip_prefix("a/")
        .or_else(|| raw.strip_prefix("b/"))
        .unwrap_or(raw)
}

fn parse_range(spec: &str) -> Option<(usize, usize)> {
    // "-12,4" or "+12" with an implied count of 1
    let body = &spec[1..];
    match body.split_once(',') {
        Some((start, count)) => Some((start.parse().ok()?, count.parse().ok()?)),
        None => Some((body.parse().ok()?, 1)),
    }
}

fn parse_hunk_header(line: &str) -> Option<(usize, usize, usize, usize)> {
    let mut parts = line.split_whitespace();
    let marker = parts.next()?;
    if marker != "@@" {
        return None;
    }
    let old = parts.next()?;
    let new = parts.next()?;
    if !old.starts_with('-') || !new.starts_with('+') {
        return None;
    }
    let (old_start, old_count) = parse_range(old)?;
    let (new_start, new_count) = parse_range(new)?;
    Some((old_start, old_count, new_start, new_count))
}

/// Parse a unified diff into per-file patches.
///
/// File deletions (`+++ /dev/null`) are rejected; this tool only creates and
/// edits files.
pub fn parse_unified_diff(diff_text: &str) -> Result<Vec<FilePatch>, PatchError> {
    let mut patches: Vec<FilePatch> = Vec::new();
    let mut lines = diff_text.lines().peekable();

    while let Some(line) = lines.next() {
        if !line.starts_with("--- ") {
            continue;
        }
        let old_name = line[4..].trim();
        let new_header = lines
            .next()
            .ok_or_else(|| PatchError::InvalidDiff("missing +++ header".to_string()))?;
        if !new_header.starts_with("+++ ") {
            return Err(PatchError::InvalidDiff(format!(
                "expected +++ header after '{}'",
                line
            )));
        }
        let new_name = new_header[4..].trim();
        if new_name == "/dev/null" {
            return Err(PatchError::InvalidDiff(
                "deletion patches are not supported".to_string(),
            ));
        }
        let is_new_file = old_name == "/dev/null";
        let rel = strip_diff_prefix(new_name);
        if rel.is_empty() {
            return Err(PatchError::InvalidDiff("empty target path".to_string()));
        }

        let mut hunks: Vec<Hunk> = Vec::new();
        let mut no_trailing_newline = false;
        // Side of the most recently parsed hunk line; a `\ No newline` marker
        // applies to the line right before it.
        let mut last_new_side = false;
        while let Some(next) = lines.peek() {
            if !next.starts_with("@@") {
                break;
            }
            let header = lines.next().unwrap_or_default();
            let (old_start, old_count, new_start, new_count) = parse_hunk_header(header)
                .ok_or_else(|| {
                    PatchError::InvalidDiff(format!("malformed hunk header '{}'", header))
                })?;
            let mut hunk_lines: Vec<HunkLine> = Vec::new();
            let mut remaining_old = old_count;
            let mut remaining_new = new_count;
            while remaining_old > 0 || remaining_new > 0 {
                let Some(&raw) = lines.peek() else { break };
                if raw.starts_with("\\ No newline") {
                    lines.next();
                    if last_new_side {
                        no_trailing_newline = true;
                    }
                    continue;
                }
                let parsed = if raw.is_empty() {
                    // Some producers emit bare empty lines for empty context.
                    HunkLine::Context(String::new())
                } else {
                    match raw.as_bytes()[0] {
                        b' ' => HunkLine::Context(raw[1..].to_string()),
                        b'-' => HunkLine::Remove(raw[1..].to_string()),
                        b'+' => HunkLine::Add(raw[1..].to_string()),
                        _ => break,
                    }
                };
                lines.next();
                match &parsed {
                    HunkLine::Context(_) => {
                        remaining_old = remaining_old.saturating_sub(1);
                        remaining_new = remaining_new.saturating_sub(1);
                        last_new_side = true;
                    }
                    HunkLine::Remove(_) => {
                        remaining_old = remaining_old.saturating_sub(1);
                        last_new_side = false;
                    }
                    HunkLine::Add(_) => {
                        remaining_new = remaining_new.saturating_sub(1);
                        last_new_side = true;
                    }
                }
                hunk_lines.push(parsed);
            }
            if remaining_old > 0 || remaining_new > 0 {
                return Err(PatchError::InvalidDiff(format!(
                    "truncated hunk for '{}'",
                    rel
                )));
            }
            // Markers trailing the final counted line of the hunk.
            while lines
                .peek()
                .map(|l| l.starts_with("\\ No newline"))
                .unwrap_or(false)
            {
                lines.next();
                if last_new_side {
                    no_trailing_newline = true;
                }
            }
            hunks.push(Hunk {
                old_start,
                old_count,
                new_start,
                new_count,
                lines: hunk_lines,
            });
        }
        if hunks.is_empty() {
            return Err(PatchError::InvalidDiff(format!("no hunks for '{}'", rel)));
        }
        patches.push(FilePatch {
            path: PathBuf::from(rel),
            hunks,
            is_new_file,
            no_trailing_newline,
        });
    }

    if patches.is_empty() {
        return Err(PatchError::InvalidDiff(
            "no file headers found".to_string(),
        ));
    }
    Ok(patches)
}

fn canonicalize_existing_parent(path: &Path) -> Result<PathBuf, PatchError> {
    // Walk up to the nearest existing ancestor, canonicalize it, then
    // re-attach the not-yet-existing tail.
    let mut existing = path.to_path_buf();
    let mut tail: Vec<std::ffi::OsString> = Vec::new();
    while !existing.exists() {
        let Some(name) = existing.file_name() else {
            return Err(PatchError::UnsafePath(path.display().to_string()));
        };
        tail.push(name.to_os_string());
        if !existing.pop() {
            return Err(PatchError::UnsafePath(path.display().to_string()));
        }
    }
    let mut resolved = existing.canonicalize().map_err(|e| PatchError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    for part in tail.iter().rev() {
        resolved.push(part);
    }
    Ok(resolved)
}

/// Resolve a relative patch target against the project root, rejecting
/// absolute paths, parent traversal, and anything resolving outside the root.
pub fn resolve_patch_target(root: &Path, rel: &Path) -> Result<PathBuf, PatchError> {
    if rel.is_absolute() {
        return Err(PatchError::UnsafePath(rel.display().to_string()));
    }
    for component in rel.components() {
        if matches!(component, std::path::Component::ParentDir) {
            return Err(PatchError::UnsafePath(rel.display().to_string()));
        }
    }
    let root_canon = root.canonicalize().map_err(|e| PatchError::Io {
        path: root.to_path_buf(),
        source: e,
    })?;
    let resolved = canonicalize_existing_parent(&root_canon.join(rel))?;
    if !resolved.starts_with(&root_canon) {
        return Err(PatchError::UnsafePath(rel.display().to_string()));
    }
    Ok(resolved)
}

/// Returns the updated lines plus whether the hunks consumed the original
/// through its last line (when they did not, the untouched tail keeps the
/// original's trailing-newline state).
fn apply_hunks(
    original: &[String],
    patch: &FilePatch,
) -> Result<(Vec<String>, bool), PatchError> {
    let mut out: Vec<String> = Vec::new();
    let mut idx: usize = 1; // 1-based cursor into `original`

    for hunk in &patch.hunks {
        if hunk.old_start > 0 {
            if hunk.old_start < idx || hunk.old_start > original.len() + 1 {
                return Err(PatchError::InvalidDiff(format!(
                    "hunk start {} out of range for '{}'",
                    hunk.old_start,
                    patch.path.display()
                )));
            }
            while idx < hunk.old_start {
                out.push(original[idx - 1].clone());
                idx += 1;
            }
        }
        for line in &hunk.lines {
            match line {
                HunkLine::Context(text) | HunkLine::Remove(text) => {
                    let actual = original.get(idx - 1).ok_or_else(|| {
                        PatchError::InvalidDiff(format!(
                            "hunk extends past end of '{}'",
                            patch.path.display()
                        ))
                    })?;
                    if actual != text {
                        return Err(PatchError::InvalidDiff(format!(
                            "context mismatch at {}:{} (expected '{}', found '{}')",
                            patch.path.display(),
                            idx,
                            text,
                            actual
                        )));
                    }
                    if matches!(line, HunkLine::Context(_)) {
                        out.push(actual.clone());
                    }
                    idx += 1;
                }
                HunkLine::Add(text) => out.push(text.clone()),
            }
        }
    }
    let consumed_to_end = idx > original.len();
    if !consumed_to_end {
        out.extend(original[idx - 1..].iter().cloned());
    }
    Ok((out, consumed_to_end))
}

/// Backup stamps are second-granularity; rapid successive applies would land
/// in the same snapshot directory, so disambiguate with a numeric suffix.
fn unique_backup_stamp(root: &Path) -> String {
    let backups = root.join(".patchup").join("patch_backups");
    let base = crate::util::timestamp();
    if !backups.join(&base).exists() {
        return base;
    }
    let mut n = 1;
    loop {
        let candidate = format!("{}_{}", base, n);
        if !backups.join(&candidate).exists() {
            return candidate;
        }
        n += 1;
    }
}

fn backup_file(root: &Path, rel: &Path, stamp: &str) -> Result<(), PatchError> {
    let source = root.join(rel);
    if !source.exists() {
        return Ok(());
    }
    let backup_path = root
        .join(".patchup")
        .join("patch_backups")
        .join(stamp)
        .join(rel);
    // Keep the earliest snapshot if the same file is staged twice.
    if backup_path.exists() {
        return Ok(());
    }
    if let Some(parent) = backup_path.parent() {
        fs::create_dir_all(parent).map_err(|e| PatchError::Io {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }
    fs::copy(&source, &backup_path).map_err(|e| PatchError::Io {
        path: source.clone(),
        source: e,
    })?;
    Ok(())
}

/// Apply a unified diff under `root`. Returns the relative paths of files
/// that were written. All hunks are verified against the current file
/// contents before any file is modified; a mismatch leaves the tree
/// untouched.
pub fn apply_unified_diff(root: &Path, diff_text: &str) -> Result<Vec<PathBuf>, PatchError> {
    let patches = parse_unified_diff(diff_text)?;

    // First pass: resolve targets and compute every new content in memory.
    let mut staged: Vec<(PathBuf, PathBuf, Vec<String>, bool)> = Vec::new();
    for patch in &patches {
        let target = resolve_patch_target(root, &patch.path)?;
        let mut original_missing_newline = false;
        let original: Vec<String> = if target.exists() {
            let text = fs::read_to_string(&target).map_err(|e| PatchError::Io {
                path: target.clone(),
                source: e,
            })?;
            original_missing_newline = !text.is_empty() && !text.ends_with('\n');
            text.lines().map(|s| s.to_string()).collect()
        } else if patch.is_new_file {
            Vec::new()
        } else {
            return Err(PatchError::InvalidDiff(format!(
                "target file '{}' does not exist",
                patch.path.display()
            )));
        };
        let (updated, consumed_to_end) = apply_hunks(&original, patch)?;
        let omit_final_newline = if consumed_to_end {
            patch.no_trailing_newline
        } else {
            original_missing_newline
        };
        staged.push((patch.path.clone(), target, updated, omit_final_newline));
    }

    // Second pass: back up and write.
    let stamp = unique_backup_stamp(root);
    let mut written: Vec<PathBuf> = Vec::new();
    for (rel, target, updated, omit_final_newline) in staged {
        backup_file(root, &rel, &stamp)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| PatchError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        let mut content = updated.join("\n");
        if !content.is_empty() && !omit_final_newline {
            content.push('\n');
        }
        fs::write(&target, content).map_err(|e| PatchError::Io {
            path: target.clone(),
            source: e,
        })?;
        written.push(rel);
    }
    Ok(written)
}

/// Build a unified diff turning the current contents of `target_rel` (empty
/// if absent) into `new_text`. Returns an empty string when nothing changes.
pub fn build_diff(root: &Path, target_rel: &Path, new_text: &str) -> Result<String, PatchError> {
    let target = root.join(target_rel);
    let old_text = if target.exists() {
        fs::read_to_string(&target).map_err(|e| PatchError::Io {
            path: target.clone(),
            source: e,
        })?
    } else {
        String::new()
    };
    if old_text == new_text {
        return Ok(String::new());
    }
    let rel_display = target_rel.display().to_string();
    let old_header = if old_text.is_empty() && !target.exists() {
        "/dev/null".to_string()
    } else {
        format!("a/{}", rel_display)
    };
    let diff = similar::TextDiff::from_lines(old_text.as_str(), new_text)
        .unified_diff()
        .context_radius(3)
        .header(&old_header, &format!("b/{}", rel_display))
        .to_string();
    Ok(diff)
}
