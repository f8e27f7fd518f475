//! Verification step runner.
//!
//! A profile resolves to an ordered step plan; steps run until the first
//! failure, install steps get one fallback retry, and the step outcomes fold
//! into an overall SUCCESS / FAIL / SKIP status.

pub mod artifacts;
pub mod profiles;

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::exec;
use crate::util::tail_lines;

pub use profiles::{PlannedStep, Profile, StepKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StepStatus {
    Ok,
    Fail,
    Skip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStatus {
    Success,
    Fail,
    Skip,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "SUCCESS",
            RunStatus::Fail => "FAIL",
            RunStatus::Skip => "SKIP",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Backend,
    Frontend,
    All,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Backend => "backend",
            Scope::Frontend => "frontend",
            Scope::All => "all",
        }
    }

    pub fn parse(s: &str) -> Option<Scope> {
        match s {
            "backend" => Some(Scope::Backend),
            "frontend" => Some(Scope::Frontend),
            "all" => Some(Scope::All),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutcome {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl StepOutcome {
    fn skipped(name: &str, reason: &str) -> StepOutcome {
        StepOutcome {
            name: name.to_string(),
            command: None,
            status: StepStatus::Skip,
            exit_code: None,
            duration_ms: 0,
            stdout: String::new(),
            stderr: reason.to_string(),
            timed_out: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub timeout: Duration,
    pub no_install: bool,
    pub json_summary: bool,
    /// Commands for the generic-shell profile.
    pub commands: Vec<String>,
    pub scope: Scope,
    /// Label recorded in run artifacts for reproduction.
    pub command_label: String,
}

impl Default for RunOptions {
    fn default() -> Self {
        RunOptions {
            timeout: Duration::from_secs(900),
            no_install: false,
            json_summary: false,
            commands: Vec::new(),
            scope: Scope::All,
            command_label: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub profile: Profile,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub steps: Vec<StepOutcome>,
    pub failure_summary: Vec<String>,
    pub timestamp: String,
    pub log_path: String,
    pub summary_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json_summary_path: Option<String>,
}

impl RunReport {
    /// A run counts as passing when nothing failed. SKIP is not a failure.
    pub fn passed(&self) -> bool {
        !matches!(self.status, RunStatus::Fail)
    }

    pub fn exit_code(&self) -> i32 {
        if self.passed() {
            0
        } else {
            1
        }
    }
}

/// Run the given profile against `root` and persist run artifacts.
pub fn execute(profile: Profile, root: &Path, opts: &RunOptions) -> anyhow::Result<RunReport> {
    let plan = profiles::resolve(profile, root, opts);
    let steps = run_plan(&plan, root, opts.timeout);
    let status = derive_status(&steps);
    let reason = derive_skip_reason(status, &steps);
    let failure_summary = condense_failure(&steps);

    let mut report = RunReport {
        profile,
        status,
        reason,
        steps,
        failure_summary,
        timestamp: crate::util::timestamp(),
        log_path: String::new(),
        summary_path: String::new(),
        json_summary_path: None,
    };
    artifacts::write_report(root, &mut report, opts)?;
    Ok(report)
}

fn run_step_kind(name: &str, kind: &StepKind, root: &Path, timeout: Duration) -> StepOutcome {
    match kind {
        StepKind::Skip(reason) => StepOutcome::skipped(name, reason),
        StepKind::Fail(reason) => StepOutcome {
            name: name.to_string(),
            command: None,
            status: StepStatus::Fail,
            exit_code: None,
            duration_ms: 0,
            stdout: String::new(),
            stderr: reason.clone(),
            timed_out: false,
        },
        StepKind::Argv { program, args, cwd } => {
            let dir = root.join(cwd);
            let label = format!("{} {}", program, args.join(" "));
            match exec::run_capture(program, args, &dir, timeout) {
                Ok(result) => outcome_from_result(name, &label, result),
                Err(e) => spawn_failure(name, &label, e),
            }
        }
        StepKind::Shell { command, cwd } => {
            let dir = root.join(cwd);
            match exec::run_shell_capture(command, &dir, timeout) {
                Ok(result) => outcome_from_result(name, command, result),
                Err(e) => spawn_failure(name, command, e),
            }
        }
    }
}

fn outcome_from_result(name: &str, command: &str, result: exec::CommandResult) -> StepOutcome {
    let status = if result.success() {
        StepStatus::Ok
    } else {
        StepStatus::Fail
    };
    StepOutcome {
        name: name.to_string(),
        command: Some(command.to_string()),
        status,
        exit_code: Some(result.exit_code),
        duration_ms: result.duration_ms,
        stdout: result.stdout,
        stderr: result.stderr,
        timed_out: result.timed_out,
    }
}

fn spawn_failure(name: &str, command: &str, error: String) -> StepOutcome {
    StepOutcome {
        name: name.to_string(),
        command: Some(command.to_string()),
        status: StepStatus::Fail,
        exit_code: None,
        duration_ms: 0,
        stdout: String::new(),
        stderr: error,
        timed_out: false,
    }
}

fn run_plan(plan: &[PlannedStep], root: &Path, timeout: Duration) -> Vec<StepOutcome> {
    let mut outcomes: Vec<StepOutcome> = Vec::new();
    for step in plan {
        tracing::debug!(step = %step.name, "running step");
        let mut outcome = run_step_kind(&step.name, &step.kind, root, timeout);
        if outcome.status == StepStatus::Fail {
            if let Some(fallback) = &step.fallback {
                tracing::debug!(step = %step.name, "primary attempt failed, retrying fallback");
                let fallback_name = format!("{}-fallback", step.name);
                // The failed primary is superseded by the fallback outcome.
                outcome = run_step_kind(&fallback_name, fallback, root, timeout);
            }
        }
        let failed = outcome.status == StepStatus::Fail;
        outcomes.push(outcome);
        if failed {
            break;
        }
    }
    outcomes
}

/// Any FAIL makes the run FAIL; otherwise any OK makes it SUCCESS; otherwise
/// any SKIP makes it SKIP; an empty plan is SKIP as well.
fn derive_status(steps: &[StepOutcome]) -> RunStatus {
    if steps.iter().any(|s| s.status == StepStatus::Fail) {
        return RunStatus::Fail;
    }
    if steps.iter().any(|s| s.status == StepStatus::Ok) {
        return RunStatus::Success;
    }
    RunStatus::Skip
}

fn derive_skip_reason(status: RunStatus, steps: &[StepOutcome]) -> Option<String> {
    if status != RunStatus::Skip {
        return None;
    }
    for step in steps {
        if step.status != StepStatus::Skip {
            continue;
        }
        let reason = if !step.stderr.trim().is_empty() {
            step.stderr.trim()
        } else {
            step.stdout.trim()
        };
        if !reason.is_empty() {
            return Some(reason.to_string());
        }
    }
    Some("no steps executed".to_string())
}

const FAILURE_KEYWORDS: [&str; 4] = [
    "FAILED",
    "AssertionError",
    "Traceback",
    "short test summary info",
];

/// Condense the first failing step's output into at most three key lines,
/// falling back to the raw output tail when no keyword matches.
fn condense_failure(steps: &[StepOutcome]) -> Vec<String> {
    let Some(failed) = steps.iter().find(|s| s.status == StepStatus::Fail) else {
        return Vec::new();
    };
    let combined = format!("{}\n{}", failed.stdout, failed.stderr);
    let tail = tail_lines(&combined, 60);
    let mut picked: Vec<String> = Vec::new();
    for line in &tail {
        if FAILURE_KEYWORDS.iter().any(|kw| line.contains(kw)) {
            picked.push(line.clone());
            if picked.len() >= 3 {
                break;
            }
        }
    }
    if picked.is_empty() {
        picked = tail
            .iter()
            .rev()
            .filter(|l| !l.trim().is_empty())
            .take(3)
            .cloned()
            .collect();
        picked.reverse();
    }
    picked
}
