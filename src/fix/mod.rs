//! Bounded run-diagnose-patch-rerun loop.
//!
//! One initial verification pass, then up to `max_iterations` cycles of plan
//! building, patch application, and re-verification. The plan is persisted
//! before anything is applied so every change is traceable to a recorded
//! decision.

pub mod apply;
pub mod brief;
pub mod diagnose;
pub mod rules;

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Serialize;

use crate::runner::{self, artifacts, Profile, RunOptions, RunReport, Scope};

pub use rules::FixPlan;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FixStatus {
    /// Checks pass, either immediately or after applied fixes.
    Pass,
    /// A plan was produced but applying was off (dry-run or no --apply).
    DryRun,
    /// No rule produced an applicable change for the failure.
    Fail,
    /// The iteration budget ran out with checks still failing.
    Exhausted,
}

#[derive(Debug, Clone)]
pub struct FixOutcome {
    pub status: FixStatus,
    pub iterations: usize,
    pub applied: bool,
}

impl FixOutcome {
    pub fn exit_code(&self) -> i32 {
        match self.status {
            FixStatus::Pass => 0,
            FixStatus::DryRun => 2,
            FixStatus::Fail | FixStatus::Exhausted => 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FixOptions {
    pub max_iterations: usize,
    pub apply_changes: bool,
    pub dry_run: bool,
    pub timeout: Duration,
    pub scope: Scope,
    pub profile: Profile,
    pub commands: Vec<String>,
    pub no_install: bool,
    pub json_summary: bool,
    pub command_label: String,
}

impl Default for FixOptions {
    fn default() -> Self {
        FixOptions {
            max_iterations: 3,
            apply_changes: false,
            dry_run: false,
            timeout: Duration::from_secs(900),
            scope: Scope::All,
            profile: Profile::PythonPytest,
            commands: Vec::new(),
            no_install: false,
            json_summary: false,
            command_label: String::new(),
        }
    }
}

impl FixOptions {
    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            timeout: self.timeout,
            no_install: self.no_install,
            json_summary: self.json_summary,
            commands: self.commands.clone(),
            scope: self.scope,
            command_label: self.command_label.clone(),
        }
    }
}

fn unique_fix_stamp(root: &Path) -> String {
    let base = crate::util::timestamp();
    let dir = root.join(".patchup");
    if !dir.join(format!("fix_{}.plan.json", base)).exists() {
        return base;
    }
    for i in 1.. {
        let candidate = format!("{}_{}", base, i);
        if !dir.join(format!("fix_{}.plan.json", candidate)).exists() {
            return candidate;
        }
    }
    unreachable!()
}

fn persist_plan(root: &Path, stamp: &str, plan: &FixPlan) -> anyhow::Result<()> {
    fs::create_dir_all(root.join(".patchup")).context("failed to create .patchup")?;
    let json_rel = format!(".patchup/fix_{}.plan.json", stamp);
    fs::write(root.join(&json_rel), serde_json::to_string_pretty(plan)?)
        .with_context(|| format!("failed to write {}", json_rel))?;
    let md_rel = format!(".patchup/fix_{}.plan.md", stamp);
    fs::write(root.join(&md_rel), rules::plan_to_markdown(plan))
        .with_context(|| format!("failed to write {}", md_rel))?;
    Ok(())
}

fn write_patch_artifact(root: &Path, stamp: &str, diffs: &[String]) -> anyhow::Result<()> {
    fs::create_dir_all(root.join(".patchup")).context("failed to create .patchup")?;
    // Concatenated as-is so the artifact stays one valid multi-file unified
    // diff; each entry just needs to end on a line boundary.
    let mut combined = String::new();
    for diff in diffs {
        combined.push_str(diff);
        if !diff.ends_with('\n') {
            combined.push('\n');
        }
    }
    let rel = format!(".patchup/fix_{}.patch.diff", stamp);
    fs::write(root.join(&rel), combined)
        .with_context(|| format!("failed to write {}", rel))?;
    Ok(())
}

fn finish(
    root: &Path,
    stamp: &str,
    opts: &FixOptions,
    outcome: FixOutcome,
    report: &RunReport,
) -> anyhow::Result<FixOutcome> {
    let summary = brief::FixSummary {
        command_label: &opts.command_label,
        iteration: outcome.iterations,
        exit_code: outcome.exit_code(),
        dry_run: opts.dry_run,
        applied: outcome.applied,
        report,
    };
    brief::write_fix_summary(root, stamp, &summary)?;
    Ok(outcome)
}

/// Run the fix loop against a project: an initial verification pass, then up
/// to `max_iterations` diagnose-plan-apply-rerun cycles.
pub fn fix_loop(root: &Path, opts: &FixOptions) -> anyhow::Result<FixOutcome> {
    let run_opts = opts.run_options();
    let mut report = runner::execute(opts.profile, root, &run_opts)
        .context("initial verification run failed")?;

    if report.passed() {
        println!("[OK] checks passing, nothing to fix");
        let stamp = unique_fix_stamp(root);
        let outcome = FixOutcome {
            status: FixStatus::Pass,
            iterations: 0,
            applied: false,
        };
        return finish(root, &stamp, opts, outcome, &report);
    }

    for iteration in 1..=opts.max_iterations {
        let log_tail = artifacts::read_tail(&root.join(&report.log_path), 120);
        let summary_lines = artifacts::read_tail(&root.join(&report.summary_path), 120);
        let diagnosis = diagnose::diagnose(&summary_lines, &log_tail);

        let mut plan = rules::build_plan(
            root,
            &diagnosis,
            opts.scope,
            iteration,
            if opts.commands.is_empty() {
                vec![opts.command_label.clone()]
            } else {
                opts.commands.clone()
            },
        );
        let stamp = unique_fix_stamp(root);
        persist_plan(root, &stamp, &plan)?;
        eprintln!(
            "[ITER {}/{}] detected: {}",
            iteration,
            opts.max_iterations,
            if plan.key_errors.is_empty() {
                "no recognized errors".to_string()
            } else {
                plan.key_errors.join(" | ")
            }
        );

        if opts.dry_run || !opts.apply_changes {
            brief::write_repair_brief(root, &stamp, &opts.command_label, &report)?;
            eprintln!("[PLAN] wrote plan without applying changes");
            let outcome = FixOutcome {
                status: FixStatus::DryRun,
                iterations: iteration,
                applied: false,
            };
            return finish(root, &stamp, opts, outcome, &report);
        }

        let (applied, diffs) = apply::apply_plan(&mut plan, root, true);
        // Rewrite the plan so the applied flags land in the record.
        persist_plan(root, &stamp, &plan)?;
        write_patch_artifact(root, &stamp, &diffs)?;

        if !applied {
            brief::write_repair_brief(root, &stamp, &opts.command_label, &report)?;
            eprintln!("[FAIL] no applicable fix for the current failure");
            let outcome = FixOutcome {
                status: FixStatus::Fail,
                iterations: iteration,
                applied: false,
            };
            return finish(root, &stamp, opts, outcome, &report);
        }

        report = runner::execute(opts.profile, root, &run_opts)
            .context("verification re-run failed")?;
        if report.passed() {
            println!("[OK] fixed in {} iteration(s)", iteration);
            let outcome = FixOutcome {
                status: FixStatus::Pass,
                iterations: iteration,
                applied: true,
            };
            return finish(root, &stamp, opts, outcome, &report);
        }
    }

    let stamp = unique_fix_stamp(root);
    brief::write_repair_brief(root, &stamp, &opts.command_label, &report)?;
    eprintln!(
        "[FAIL] could not fix after {} iteration(s)",
        opts.max_iterations
    );
    let outcome = FixOutcome {
        status: FixStatus::Exhausted,
        iterations: opts.max_iterations,
        applied: true,
    };
    finish(root, &stamp, opts, outcome, &report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    fn write_script(root: &Path, rel: &str, body: &str) {
        let path = root.join(rel);
        fs::write(&path, body).unwrap();
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
    }

    #[test]
    fn test_patch_artifact_concatenates_into_one_valid_diff() {
        let tmp = tempfile::tempdir().unwrap();
        let diffs = vec![
            "--- /dev/null\n+++ b/a.txt\n@@ -0,0 +1 @@\n+alpha".to_string(),
            "--- /dev/null\n+++ b/b.txt\n@@ -0,0 +1 @@\n+beta\n".to_string(),
        ];
        write_patch_artifact(tmp.path(), "t", &diffs).unwrap();
        let text = fs::read_to_string(tmp.path().join(".patchup/fix_t.patch.diff")).unwrap();
        let patches = crate::patch::parse_unified_diff(&text).unwrap();
        assert_eq!(patches.len(), 2);
        for line in text.lines().filter(|l| l.starts_with("---")) {
            assert!(line == "--- /dev/null");
        }
    }

    fn opts(commands: Vec<&str>, apply: bool, dry_run: bool, max: usize) -> FixOptions {
        FixOptions {
            max_iterations: max,
            apply_changes: apply,
            dry_run,
            profile: Profile::GenericShell,
            commands: commands.into_iter().map(|s| s.to_string()).collect(),
            command_label: "patchup fix --profile generic-shell".to_string(),
            ..FixOptions::default()
        }
    }

    // A check script that fails with a NameError until the import rule has
    // patched app/code.py, then passes.
    fn setup_name_error_project(root: &Path) {
        fs::create_dir_all(root.join("app")).unwrap();
        fs::write(
            root.join("app/code.py"),
            "from fastapi import FastAPI\n\napp = FastAPI()\n\ndef handler(q=Query(None)):\n    return q\n",
        )
        .unwrap();
        write_script(
            root,
            "check.sh",
            concat!(
                "#!/bin/sh\n",
                "if grep -q 'from fastapi import FastAPI, Query' app/code.py; then\n",
                "  echo 'checks passed'\n",
                "  exit 0\n",
                "fi\n",
                "echo 'Traceback (most recent call last):' >&2\n",
                "echo '  File \"app/code.py\", line 5, in handler' >&2\n",
                "echo \"NameError: name 'Query' is not defined\" >&2\n",
                "exit 1\n",
            ),
        );
    }

    #[test]
    fn test_passing_project_returns_zero() {
        let tmp = tempfile::tempdir().unwrap();
        let outcome = fix_loop(tmp.path(), &opts(vec!["true"], true, false, 3)).unwrap();
        assert_eq!(outcome.status, FixStatus::Pass);
        assert_eq!(outcome.exit_code(), 0);
        assert_eq!(outcome.iterations, 0);
    }

    #[test]
    fn test_name_error_fixed_in_one_iteration() {
        let tmp = tempfile::tempdir().unwrap();
        setup_name_error_project(tmp.path());
        let outcome = fix_loop(tmp.path(), &opts(vec!["sh check.sh"], true, false, 3)).unwrap();
        assert_eq!(outcome.status, FixStatus::Pass);
        assert_eq!(outcome.iterations, 1);
        assert!(outcome.applied);
        let content = fs::read_to_string(tmp.path().join("app/code.py")).unwrap();
        assert!(content.contains("from fastapi import FastAPI, Query"));

        // Plan and patch artifacts recorded under .patchup.
        let entries: Vec<String> = fs::read_dir(tmp.path().join(".patchup"))
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        assert!(entries.iter().any(|n| n.ends_with(".plan.json")));
        assert!(entries.iter().any(|n| n.ends_with(".plan.md")));
        assert!(entries.iter().any(|n| n.ends_with(".patch.diff")));
        assert!(entries.iter().any(|n| n.ends_with(".summary.json")));
    }

    #[test]
    fn test_dry_run_plans_without_touching_project() {
        let tmp = tempfile::tempdir().unwrap();
        setup_name_error_project(tmp.path());
        let before = fs::read_to_string(tmp.path().join("app/code.py")).unwrap();
        let outcome = fix_loop(tmp.path(), &opts(vec!["sh check.sh"], false, true, 3)).unwrap();
        assert_eq!(outcome.status, FixStatus::DryRun);
        assert_eq!(outcome.exit_code(), 2);
        let after = fs::read_to_string(tmp.path().join("app/code.py")).unwrap();
        assert_eq!(before, after);

        let entries: Vec<String> = fs::read_dir(tmp.path().join(".patchup"))
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        assert!(entries.iter().any(|n| n.ends_with(".plan.json")));
        assert!(entries.iter().any(|n| n.ends_with(".prompt.md")));
        assert!(!entries.iter().any(|n| n.ends_with(".patch.diff")));
    }

    #[test]
    fn test_apply_disabled_exits_plan_only() {
        let tmp = tempfile::tempdir().unwrap();
        setup_name_error_project(tmp.path());
        let outcome =
            fix_loop(tmp.path(), &opts(vec!["sh check.sh"], false, false, 3)).unwrap();
        assert_eq!(outcome.status, FixStatus::DryRun);
        assert_eq!(outcome.exit_code(), 2);
    }

    #[test]
    fn test_unrecognized_failure_returns_unresolved() {
        let tmp = tempfile::tempdir().unwrap();
        let outcome = fix_loop(
            tmp.path(),
            &opts(vec!["echo 'some inscrutable failure' >&2; exit 1"], true, false, 3),
        )
        .unwrap();
        assert_eq!(outcome.status, FixStatus::Fail);
        assert_eq!(outcome.exit_code(), 1);
        let entries: Vec<String> = fs::read_dir(tmp.path().join(".patchup"))
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        assert!(entries.iter().any(|n| n.ends_with(".prompt.md")));
    }

    #[test]
    fn test_budget_exhaustion_counts_runs() {
        let tmp = tempfile::tempdir().unwrap();
        // The CORS rule keeps re-applying because the check script restores
        // the unpatched file before every run, so each iteration applies a
        // diff and the failure never clears.
        fs::create_dir_all(tmp.path().join("app")).unwrap();
        let main_py = "from fastapi import FastAPI\n\napp = FastAPI()\n";
        fs::write(tmp.path().join("app/main.orig"), main_py).unwrap();
        fs::write(tmp.path().join("app/main.py"), main_py).unwrap();
        write_script(
            tmp.path(),
            "check.sh",
            concat!(
                "#!/bin/sh\n",
                "cp app/main.orig app/main.py\n",
                "echo 'request blocked by CORS policy' >&2\n",
                "exit 1\n",
            ),
        );
        let max = 2;
        let outcome =
            fix_loop(tmp.path(), &opts(vec!["sh check.sh"], true, false, max)).unwrap();
        assert_eq!(outcome.status, FixStatus::Exhausted);
        assert_eq!(outcome.exit_code(), 1);
        // One initial run plus one re-run per iteration.
        let logs = fs::read_dir(tmp.path().join(".patchup/run_logs"))
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().ends_with(".log"))
            .count();
        assert_eq!(logs, max + 1);
    }
}
