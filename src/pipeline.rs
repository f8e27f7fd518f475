//! End-to-end pipeline: optional generation, verification, fix loop, final
//! verification, one consolidated outcome.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::fix::{self, FixOptions};
use crate::generate::{CommandGenerator, GenerateOptions, ProjectGenerator};
use crate::runner::{self, artifacts, RunReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PipelineStatus {
    Success,
    Partial,
    Fail,
}

impl PipelineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStatus::Success => "SUCCESS",
            PipelineStatus::Partial => "PARTIAL",
            PipelineStatus::Fail => "FAIL",
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineStatus::Success => 0,
            PipelineStatus::Partial => 2,
            PipelineStatus::Fail => 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Idea text handed to the generator; requires `generate_command`.
    pub idea: Option<String>,
    pub generate_command: Option<String>,
    pub workdir: PathBuf,
    pub fix: FixOptions,
}

#[derive(Debug)]
pub struct PipelineOutcome {
    pub status: PipelineStatus,
    pub project_dir: PathBuf,
    pub fix_exit: Option<i32>,
}

fn resolve_project(
    project: Option<PathBuf>,
    opts: &PipelineOptions,
) -> anyhow::Result<PathBuf> {
    if let Some(idea) = &opts.idea {
        let command = opts
            .generate_command
            .as_deref()
            .context("an idea was given but no generator command is configured")?;
        let generator = CommandGenerator::new(command, &opts.workdir);
        let dir = generator
            .generate(idea, &GenerateOptions::default())
            .context("project generation failed")?;
        println!("[GEN] project created at {}", dir.display());
        return Ok(dir);
    }
    project.context("either a project path or an idea is required")
}

fn write_pipeline_artifacts(
    root: &Path,
    outcome: &PipelineOutcome,
    initial: &RunReport,
    last: &RunReport,
) -> anyhow::Result<()> {
    let dir = root.join(".patchup").join("pipeline_logs");
    fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;
    let stamp = crate::util::timestamp();

    let mut log = String::new();
    log.push_str(&format!("# pipeline {}\n", stamp));
    log.push_str(&format!("project_dir: {}\n", root.display()));
    log.push_str(&format!("initial_run: {}\n", initial.log_path));
    log.push_str(&format!("final_run: {}\n", last.log_path));
    if let Some(code) = outcome.fix_exit {
        log.push_str(&format!("fix_exit: {}\n", code));
    }
    log.push_str(&format!("status: {}\n", outcome.status.as_str()));
    fs::write(dir.join(format!("pipeline_{}.log", stamp)), &log)
        .context("failed to write pipeline log")?;

    let mut summary = String::new();
    summary.push_str("1) Pipeline meta:\n");
    summary.push_str(&format!("- project_dir: {}\n", root.display()));
    summary.push_str(&format!("- timestamp: {}\n", stamp));
    summary.push('\n');
    summary.push_str(&format!("2) Result: {}\n", outcome.status.as_str()));
    summary.push_str(&format!("- initial_run: {}\n", initial.status.as_str()));
    summary.push_str(&format!("- final_run: {}\n", last.status.as_str()));
    if let Some(code) = outcome.fix_exit {
        summary.push_str(&format!("- fix_exit: {}\n", code));
    }
    fs::write(dir.join(format!("pipeline_{}.summary.txt", stamp)), &summary)
        .context("failed to write pipeline summary")?;

    let payload = json!({
        "status": outcome.status,
        "project_dir": root.display().to_string(),
        "timestamp": stamp,
        "initial_run": {
            "status": initial.status,
            "log_path": initial.log_path,
            "summary_path": initial.summary_path,
        },
        "final_run": {
            "status": last.status,
            "log_path": last.log_path,
            "summary_path": last.summary_path,
        },
        "fix_exit": outcome.fix_exit,
    });
    fs::write(
        dir.join(format!("pipeline_{}.summary.json", stamp)),
        serde_json::to_string_pretty(&payload)?,
    )
    .context("failed to write pipeline summary json")?;

    // The pipeline record supersedes the per-run result as the final word.
    fs::write(
        root.join(".patchup/result.json"),
        serde_json::to_string_pretty(&payload)?,
    )
    .context("failed to write .patchup/result.json")?;
    let txt = format!(
        "status: {}\nproject: {}\nfinal_run: {}\nlog: {}\n",
        outcome.status.as_str(),
        root.display(),
        last.status.as_str(),
        last.log_path,
    );
    fs::write(root.join(".patchup/result.txt"), txt)
        .context("failed to write .patchup/result.txt")?;
    Ok(())
}

fn echo_last_summary(root: &Path) {
    if let Some((_, summary)) = artifacts::latest_run_log(root) {
        if let Ok(text) = fs::read_to_string(&summary) {
            eprintln!("{}", text.trim_end());
        }
    }
}

/// Drive the full pipeline and return the outcome. The caller maps the
/// status to a process exit code.
pub fn run_pipeline(
    project: Option<PathBuf>,
    opts: &PipelineOptions,
) -> anyhow::Result<PipelineOutcome> {
    let root = resolve_project(project, opts)?;
    let run_opts = opts.fix.run_options();

    let initial = runner::execute(opts.fix.profile, &root, &run_opts)
        .context("initial verification run failed")?;

    let (status, fix_exit, last) = if initial.passed() {
        (PipelineStatus::Success, None, initial.clone())
    } else {
        let fixed = fix::fix_loop(&root, &opts.fix)?;
        let fix_exit = Some(fixed.exit_code());
        match fixed.status {
            fix::FixStatus::Pass => {
                let final_run = runner::execute(opts.fix.profile, &root, &run_opts)
                    .context("final verification run failed")?;
                let status = if final_run.passed() {
                    PipelineStatus::Success
                } else {
                    PipelineStatus::Fail
                };
                (status, fix_exit, final_run)
            }
            fix::FixStatus::DryRun => (PipelineStatus::Partial, fix_exit, initial.clone()),
            fix::FixStatus::Fail | fix::FixStatus::Exhausted => {
                (PipelineStatus::Fail, fix_exit, initial.clone())
            }
        }
    };

    let outcome = PipelineOutcome {
        status,
        project_dir: root.clone(),
        fix_exit,
    };
    write_pipeline_artifacts(&root, &outcome, &initial, &last)?;
    println!("[PIPELINE] {}", outcome.status.as_str());
    if outcome.status != PipelineStatus::Success {
        echo_last_summary(&root);
    }
    Ok(outcome)
}
