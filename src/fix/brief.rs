//! Repair briefs and fix summaries.
//!
//! A brief is a handoff document for whoever (or whatever) picks up a
//! failure the rule catalog could not clear: reproduction command, condensed
//! failure, the failing point, and the raw output tail.

use std::fs;
use std::path::Path;

use anyhow::Context;
use serde_json::json;

use crate::runner::RunReport;
use crate::util::tail_lines;

const OUTPUT_TAIL_LINES: usize = 40;
const STACK_HEAD_LINES: usize = 6;
const STACK_TAIL_LINES: usize = 6;

/// Lines of section 4 of a run summary, without the section headers.
pub fn extract_failure_section(summary_text: &str) -> Vec<String> {
    let mut in_section = false;
    let mut out: Vec<String> = Vec::new();
    for line in summary_text.lines() {
        if line.starts_with("4) Failure summary:") {
            in_section = true;
            continue;
        }
        if in_section {
            if line.starts_with("5) ") {
                break;
            }
            if !line.trim().is_empty() {
                out.push(line.to_string());
            }
        }
    }
    out
}

fn failure_point(log_tail: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    if let Some(failed) = log_tail
        .iter()
        .find(|l| (l.contains("FAILED") || l.contains("ERROR")) && l.contains("::"))
    {
        let trimmed = failed.trim();
        out.push(format!("- failing test: {}", trimmed));
        if let Some(file) = trimmed.split("::").next() {
            let file = file.rsplit(' ').next().unwrap_or(file);
            out.push(format!("- file: {}", file));
        }
    } else if let Some(file_line) = log_tail.iter().find(|l| l.contains("File \"")) {
        out.push(format!("- failing location: {}", file_line.trim()));
    }

    if let Some(start) = log_tail.iter().position(|l| l.contains("Traceback")) {
        out.push("- stack excerpt:".to_string());
        let head_end = (start + STACK_HEAD_LINES).min(log_tail.len());
        for line in &log_tail[start..head_end] {
            out.push(format!("    {}", line.trim_end()));
        }
        let tail_start = log_tail.len().saturating_sub(STACK_TAIL_LINES);
        if tail_start > head_end {
            out.push("    ...".to_string());
            for line in &log_tail[tail_start..] {
                out.push(format!("    {}", line.trim_end()));
            }
        }
    }
    if out.is_empty() {
        out.push("- no structured failure point identified".to_string());
    }
    out
}

/// Write `fix_<stamp>.prompt.md` describing the unresolved failure. Returns
/// the root-relative path.
pub fn write_repair_brief(
    root: &Path,
    stamp: &str,
    command_label: &str,
    report: &RunReport,
) -> anyhow::Result<String> {
    let summary_text =
        fs::read_to_string(root.join(&report.summary_path)).unwrap_or_default();
    let log_text = fs::read_to_string(root.join(&report.log_path)).unwrap_or_default();
    let log_tail = tail_lines(&log_text, 120);

    let mut out = String::new();
    out.push_str("# Reproduction command\n\n");
    out.push_str(&format!("    {}\n\n", command_label));

    out.push_str("# Failure summary\n\n");
    let failure = extract_failure_section(&summary_text);
    if failure.is_empty() {
        for line in &report.failure_summary {
            out.push_str(&format!("- {}\n", line.trim()));
        }
        if report.failure_summary.is_empty() {
            out.push_str("- no condensed failure available\n");
        }
    } else {
        for line in &failure {
            out.push_str(&format!("{}\n", line));
        }
    }
    out.push('\n');

    out.push_str("# Failure point\n\n");
    for line in failure_point(&log_tail) {
        out.push_str(&format!("{}\n", line));
    }
    out.push('\n');

    out.push_str("# Output tail\n\n");
    for line in tail_lines(&log_text, OUTPUT_TAIL_LINES) {
        out.push_str(&format!("    {}\n", line.trim_end()));
    }
    out.push('\n');

    out.push_str("# Fix instructions\n\n");
    out.push_str("1. Reproduce the failure with the command above.\n");
    out.push_str("2. Start from the failing test or location in the failure point.\n");
    out.push_str("3. Make the smallest change that addresses the root cause.\n");
    out.push_str("4. Keep behavior of passing tests unchanged.\n\n");

    out.push_str("# Completion checklist\n\n");
    out.push_str("- [ ] reproduction command passes\n");
    out.push_str("- [ ] no new failures in the full run\n");
    out.push_str("- [ ] changes limited to the failing area\n");

    fs::create_dir_all(root.join(".patchup")).context("failed to create .patchup")?;
    let rel = format!(".patchup/fix_{}.prompt.md", stamp);
    fs::write(root.join(&rel), out).with_context(|| format!("failed to write {}", rel))?;
    Ok(rel)
}

#[derive(Debug, Clone)]
pub struct FixSummary<'a> {
    pub command_label: &'a str,
    pub iteration: usize,
    pub exit_code: i32,
    pub dry_run: bool,
    pub applied: bool,
    pub report: &'a RunReport,
}

/// Write `fix_<stamp>.summary.txt` and `.summary.json`.
pub fn write_fix_summary(root: &Path, stamp: &str, summary: &FixSummary) -> anyhow::Result<()> {
    let mut txt = String::new();
    txt.push_str("1) Fix meta:\n");
    txt.push_str(&format!("- project_dir: {}\n", root.display()));
    txt.push_str(&format!("- timestamp: {}\n", stamp));
    txt.push_str(&format!("- command: {}\n", summary.command_label));
    txt.push_str(&format!("- iteration: {}\n", summary.iteration));
    txt.push_str(&format!("- dry_run: {}\n", summary.dry_run));
    txt.push_str(&format!("- applied: {}\n", summary.applied));
    txt.push('\n');
    txt.push_str("2) Outcome:\n");
    txt.push_str(&format!("- exit_code: {}\n", summary.exit_code));
    txt.push_str(&format!("- run_status: {}\n", summary.report.status.as_str()));
    txt.push_str(&format!("- run_log: {}\n", summary.report.log_path));
    txt.push_str(&format!("- run_summary: {}\n", summary.report.summary_path));

    fs::create_dir_all(root.join(".patchup")).context("failed to create .patchup")?;
    let txt_rel = format!(".patchup/fix_{}.summary.txt", stamp);
    fs::write(root.join(&txt_rel), txt)
        .with_context(|| format!("failed to write {}", txt_rel))?;

    let payload = json!({
        "project_dir": root.display().to_string(),
        "timestamp": stamp,
        "command": summary.command_label,
        "iteration": summary.iteration,
        "exit_code": summary.exit_code,
        "dry_run": summary.dry_run,
        "applied": summary.applied,
        "run_status": summary.report.status,
        "run_log": summary.report.log_path,
        "run_summary": summary.report.summary_path,
    });
    let json_rel = format!(".patchup/fix_{}.summary.json", stamp);
    fs::write(root.join(&json_rel), serde_json::to_string_pretty(&payload)?)
        .with_context(|| format!("failed to write {}", json_rel))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{execute, Profile, RunOptions};

    fn failing_report(root: &Path) -> RunReport {
        let opts = RunOptions {
            commands: vec![
                "printf 'Traceback (most recent call last):\\n  File \"app/main.py\", line 3\\nNameError: bad\\nFAILED tests/test_a.py::test_b\\n' >&2; exit 1"
                    .to_string(),
            ],
            command_label: "patchup run --profile generic-shell".to_string(),
            ..RunOptions::default()
        };
        execute(Profile::GenericShell, root, &opts).unwrap()
    }

    #[test]
    fn test_extract_failure_section() {
        let summary = "3) Result: FAIL\n\n4) Failure summary:\n- FAILED x\n- Traceback y\n\n5) Next actions:\n- z\n";
        let section = extract_failure_section(summary);
        assert_eq!(section, vec!["- FAILED x", "- Traceback y"]);
        assert!(extract_failure_section("3) Result: SUCCESS\n").is_empty());
    }

    #[test]
    fn test_brief_sections_present() {
        let tmp = tempfile::tempdir().unwrap();
        let report = failing_report(tmp.path());
        let rel = write_repair_brief(tmp.path(), "t1", "patchup run", &report).unwrap();
        let brief = fs::read_to_string(tmp.path().join(&rel)).unwrap();
        assert!(brief.contains("# Reproduction command"));
        assert!(brief.contains("# Failure summary"));
        assert!(brief.contains("# Failure point"));
        assert!(brief.contains("failing test: FAILED tests/test_a.py::test_b"));
        assert!(brief.contains("- file: tests/test_a.py"));
        assert!(brief.contains("# Output tail"));
        assert!(brief.contains("# Completion checklist"));
    }

    #[test]
    fn test_fix_summary_files() {
        let tmp = tempfile::tempdir().unwrap();
        let report = failing_report(tmp.path());
        let summary = FixSummary {
            command_label: "patchup fix",
            iteration: 2,
            exit_code: 1,
            dry_run: false,
            applied: true,
            report: &report,
        };
        write_fix_summary(tmp.path(), "t2", &summary).unwrap();
        let txt = fs::read_to_string(tmp.path().join(".patchup/fix_t2.summary.txt")).unwrap();
        assert!(txt.contains("1) Fix meta:"));
        assert!(txt.contains("- iteration: 2"));
        assert!(txt.contains("- exit_code: 1"));
        let parsed: serde_json::Value = serde_json::from_str(
            &fs::read_to_string(tmp.path().join(".patchup/fix_t2.summary.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(parsed["applied"], true);
        assert_eq!(parsed["run_status"], "FAIL");
    }
}
