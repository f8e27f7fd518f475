//! Run artifacts: full log, numbered summary, machine-readable records.
//!
//! Everything lands under `.patchup/` inside the project so a run leaves a
//! self-contained audit trail next to the code it checked.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde_json::json;

use super::{RunOptions, RunReport, RunStatus, StepStatus};
use crate::util::truncate;

const STEP_OUTPUT_LIMIT: usize = 20_000;

fn unique_stamp(dir: &Path, base: &str) -> String {
    if !dir.join(format!("run_{}.log", base)).exists() {
        return base.to_string();
    }
    for i in 1.. {
        let candidate = format!("{}_{}", base, i);
        if !dir.join(format!("run_{}.log", candidate)).exists() {
            return candidate;
        }
    }
    unreachable!()
}

fn render_log(report: &RunReport, root: &Path, opts: &RunOptions) -> String {
    let mut out = String::new();
    out.push_str(&format!("# run {}\n", report.timestamp));
    out.push_str(&format!("project_dir: {}\n", root.display()));
    out.push_str(&format!("profile: {}\n", report.profile.name()));
    if !opts.command_label.is_empty() {
        out.push_str(&format!("command: {}\n", opts.command_label));
    }
    out.push('\n');
    for step in &report.steps {
        out.push_str(&format!("== step: {} ==\n", step.name));
        if let Some(cmd) = &step.command {
            out.push_str(&format!("$ {}\n", cmd));
        }
        out.push_str(&format!(
            "status={:?} exit_code={} duration_ms={} timed_out={}\n",
            step.status,
            step.exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "-".to_string()),
            step.duration_ms,
            step.timed_out,
        ));
        if !step.stdout.is_empty() {
            out.push_str("--- stdout ---\n");
            out.push_str(&truncate(&step.stdout, STEP_OUTPUT_LIMIT));
            if !step.stdout.ends_with('\n') {
                out.push('\n');
            }
        }
        if !step.stderr.is_empty() {
            out.push_str("--- stderr ---\n");
            out.push_str(&truncate(&step.stderr, STEP_OUTPUT_LIMIT));
            if !step.stderr.ends_with('\n') {
                out.push('\n');
            }
        }
        out.push('\n');
    }
    out.push_str(&format!("result: {}\n", report.status.as_str()));
    out
}

fn step_status_label(status: StepStatus) -> &'static str {
    match status {
        StepStatus::Ok => "OK",
        StepStatus::Fail => "FAIL",
        StepStatus::Skip => "SKIP",
    }
}

fn render_summary(report: &RunReport, root: &Path, opts: &RunOptions, log_rel: &str) -> String {
    let mut out = String::new();
    out.push_str("1) Run meta:\n");
    out.push_str(&format!("- project_dir: {}\n", root.display()));
    out.push_str(&format!("- timestamp: {}\n", report.timestamp));
    if !opts.command_label.is_empty() {
        out.push_str(&format!("- command: {}\n", opts.command_label));
    }
    out.push_str(&format!("- profile: {}\n", report.profile.name()));
    out.push('\n');

    out.push_str("2) Steps:\n");
    if report.steps.is_empty() {
        out.push_str("- steps: none\n");
    }
    for step in &report.steps {
        out.push_str(&format!(
            "- step: {} status={} exit_code={} duration_ms={}\n",
            step.name,
            step_status_label(step.status),
            step.exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "-".to_string()),
            step.duration_ms,
        ));
    }
    out.push('\n');

    out.push_str(&format!("3) Result: {}\n", report.status.as_str()));
    if let Some(reason) = &report.reason {
        out.push_str(&format!("- reason: {}\n", reason));
    }

    if report.status == RunStatus::Fail {
        out.push('\n');
        out.push_str("4) Failure summary:\n");
        if report.failure_summary.is_empty() {
            out.push_str("- no diagnostic lines captured\n");
        }
        for line in &report.failure_summary {
            out.push_str(&format!("- {}\n", line.trim_end()));
        }
        out.push('\n');
        out.push_str("5) Next actions:\n");
        out.push_str(&format!("- inspect the full log: {}\n", log_rel));
        out.push_str("- re-run after fixing the first failing step\n");
    }
    out
}

fn render_result_txt(report: &RunReport) -> String {
    let mut lines: Vec<String> = Vec::new();
    lines.push(format!("status: {}", report.status.as_str()));
    lines.push(format!("profile: {}", report.profile.name()));
    if let Some(reason) = &report.reason {
        lines.push(format!("reason: {}", reason));
    }
    if let Some(first) = report.failure_summary.first() {
        lines.push(format!("failure: {}", first.trim()));
    }
    lines.push(format!("log: {}", report.log_path));
    lines.join("\n") + "\n"
}

/// Write log, summary, optional JSON summary, and the `.patchup/result.*`
/// records. Fills the path fields on `report` with root-relative paths.
pub fn write_report(root: &Path, report: &mut RunReport, opts: &RunOptions) -> anyhow::Result<()> {
    let log_dir = root.join(".patchup").join("run_logs");
    fs::create_dir_all(&log_dir)
        .with_context(|| format!("failed to create {}", log_dir.display()))?;

    let stamp = unique_stamp(&log_dir, &report.timestamp);
    report.timestamp = stamp.clone();
    let log_rel = format!(".patchup/run_logs/run_{}.log", stamp);
    let summary_rel = format!(".patchup/run_logs/run_{}.summary.txt", stamp);

    fs::write(root.join(&log_rel), render_log(report, root, opts))
        .with_context(|| format!("failed to write {}", log_rel))?;
    fs::write(
        root.join(&summary_rel),
        render_summary(report, root, opts, &log_rel),
    )
    .with_context(|| format!("failed to write {}", summary_rel))?;
    report.log_path = log_rel;
    report.summary_path = summary_rel;

    if opts.json_summary {
        let json_rel = format!(".patchup/run_logs/run_{}.summary.json", stamp);
        let payload = serde_json::to_string_pretty(&report)?;
        fs::write(root.join(&json_rel), payload)
            .with_context(|| format!("failed to write {}", json_rel))?;
        report.json_summary_path = Some(json_rel);
    }

    let result = json!({
        "status": report.status,
        "profile": report.profile,
        "reason": report.reason,
        "timestamp": report.timestamp,
        "steps": report.steps.iter().map(|s| json!({
            "name": s.name,
            "status": s.status,
            "exit_code": s.exit_code,
            "duration_ms": s.duration_ms,
        })).collect::<Vec<_>>(),
        "failure_summary": report.failure_summary,
        "log_path": report.log_path,
        "summary_path": report.summary_path,
    });
    fs::write(
        root.join(".patchup/result.json"),
        serde_json::to_string_pretty(&result)?,
    )
    .context("failed to write .patchup/result.json")?;
    fs::write(root.join(".patchup/result.txt"), render_result_txt(report))
        .context("failed to write .patchup/result.txt")?;
    Ok(())
}

/// Last `n` lines of a file, empty when unreadable.
pub fn read_tail(path: &Path, n: usize) -> Vec<String> {
    match fs::read_to_string(path) {
        Ok(text) => crate::util::tail_lines(&text, n),
        Err(_) => Vec::new(),
    }
}

/// Most recent run log and its summary, by file name order.
pub fn latest_run_log(root: &Path) -> Option<(PathBuf, PathBuf)> {
    let dir = root.join(".patchup").join("run_logs");
    let mut logs: Vec<PathBuf> = fs::read_dir(&dir)
        .ok()?
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.extension().map(|e| e == "log").unwrap_or(false)
                && p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with("run_"))
                    .unwrap_or(false)
        })
        .collect();
    logs.sort();
    let log = logs.pop()?;
    let summary = log.with_extension("summary.txt");
    Some((log, summary))
}
