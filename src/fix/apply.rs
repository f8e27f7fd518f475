//! Turn plan actions into unified diffs and, in apply mode, write them.

use std::path::{Path, PathBuf};

use super::rules::{
    ensure_cors_middleware, ensure_fastapi_imports, ensure_requirements,
    ensure_router_registered, Action, FixPlan, RuleId,
};
use crate::patch;

/// Resolve a file hint to a path relative to `root`. Hints may be absolute
/// (from interpreter tracebacks) or already relative; anything outside the
/// project is discarded.
fn normalize_hint(root: &Path, hint: &str) -> Option<PathBuf> {
    let hint_path = Path::new(hint);
    let rel = if hint_path.is_absolute() {
        hint_path.strip_prefix(root).ok()?.to_path_buf()
    } else {
        hint_path.to_path_buf()
    };
    if rel
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return None;
    }
    if root.join(&rel).is_file() {
        Some(rel)
    } else {
        None
    }
}

/// First hint that resolves to an existing file with the given extension.
fn find_candidate_file(root: &Path, hints: &[String], extension: &str) -> Option<PathBuf> {
    hints
        .iter()
        .filter(|h| h.ends_with(extension))
        .find_map(|h| normalize_hint(root, h))
}

fn resolve_target(root: &Path, action: &Action) -> Option<PathBuf> {
    match &action.path {
        Some(fixed) => Some(PathBuf::from(fixed)),
        None => find_candidate_file(root, &action.files_hint, ".py"),
    }
}

fn transform(root: &Path, action: &Action, target: &Path) -> Result<String, String> {
    let full = root.join(target);
    let content = if full.is_file() {
        std::fs::read_to_string(&full).map_err(|e| format!("read {}: {}", target.display(), e))?
    } else {
        String::new()
    };
    match action.rule {
        RuleId::EnsureImport => ensure_fastapi_imports(&content, &action.names),
        RuleId::EnsureCorsMiddleware => ensure_cors_middleware(&content),
        RuleId::EnsureRouterRegistered => {
            let segment = action
                .names
                .first()
                .ok_or_else(|| "missing router segment".to_string())?;
            ensure_router_registered(&content, segment)
        }
        RuleId::EnsureDependencies => Ok(ensure_requirements(&content, &action.names)),
    }
}

/// Compute diffs for every action and, when `apply_changes` is set, write
/// them. Per-action failures are logged and skipped rather than aborting the
/// whole plan. Returns whether anything was applied plus the diffs produced.
pub fn apply_plan(plan: &mut FixPlan, root: &Path, apply_changes: bool) -> (bool, Vec<String>) {
    let mut diffs: Vec<String> = Vec::new();
    let mut any_applied = false;

    for action in plan.actions.iter_mut() {
        let Some(target) = resolve_target(root, action) else {
            tracing::warn!(rule = action.rule.as_str(), "no target file resolved");
            continue;
        };
        let new_text = match transform(root, action, &target) {
            Ok(text) => text,
            Err(reason) => {
                tracing::warn!(
                    rule = action.rule.as_str(),
                    target = %target.display(),
                    %reason,
                    "rule transform skipped"
                );
                continue;
            }
        };
        let diff = match patch::build_diff(root, &target, &new_text) {
            Ok(diff) => diff,
            Err(e) => {
                tracing::warn!(rule = action.rule.as_str(), error = %e, "diff failed");
                continue;
            }
        };
        if diff.is_empty() {
            continue;
        }
        if apply_changes {
            if let Err(e) = patch::apply_unified_diff(root, &diff) {
                tracing::warn!(rule = action.rule.as_str(), error = %e, "patch failed");
                continue;
            }
            action.applied = true;
            any_applied = true;
        }
        diffs.push(diff);
    }

    (any_applied || (!apply_changes && !diffs.is_empty()), diffs)
}
