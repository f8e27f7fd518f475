//! Profile definitions and step-plan resolution.
//!
//! Each profile inspects the project tree lazily and produces an ordered
//! plan. Missing tooling or markers resolve to SKIP steps with a reason
//! instead of errors, so an empty project never fails a run.

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{RunOptions, Scope};
use crate::util::is_on_path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Profile {
    PythonPytest,
    NodeVite,
    GenericShell,
    Legacy,
}

impl Profile {
    pub fn name(&self) -> &'static str {
        match self {
            Profile::PythonPytest => "python-pytest",
            Profile::NodeVite => "node-vite",
            Profile::GenericShell => "generic-shell",
            Profile::Legacy => "legacy",
        }
    }

    pub fn parse(s: &str) -> Option<Profile> {
        match s {
            "python-pytest" => Some(Profile::PythonPytest),
            "node-vite" => Some(Profile::NodeVite),
            "generic-shell" | "generic" => Some(Profile::GenericShell),
            "legacy" => Some(Profile::Legacy),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum StepKind {
    /// Direct argv execution, no shell interpretation.
    Argv {
        program: String,
        args: Vec<String>,
        cwd: String,
    },
    /// Verbatim `sh -c` command line.
    Shell { command: String, cwd: String },
    /// Resolved at plan time to a skip with a reason.
    Skip(String),
    /// Resolved at plan time to a hard failure, e.g. a broken manifest.
    Fail(String),
}

#[derive(Debug, Clone)]
pub struct PlannedStep {
    pub name: String,
    pub kind: StepKind,
    pub fallback: Option<StepKind>,
}

impl PlannedStep {
    fn simple(name: &str, kind: StepKind) -> PlannedStep {
        PlannedStep {
            name: name.to_string(),
            kind,
            fallback: None,
        }
    }
}

pub fn resolve(profile: Profile, root: &Path, opts: &RunOptions) -> Vec<PlannedStep> {
    match profile {
        Profile::PythonPytest => python_pytest_plan(root),
        Profile::NodeVite => node_plan(root, ".", "", opts.no_install),
        Profile::GenericShell => generic_plan(&opts.commands),
        Profile::Legacy => legacy_plan(root, opts),
    }
}

fn select_python(root: &Path) -> String {
    let venv = root.join(".venv/bin/python");
    if venv.is_file() {
        venv.display().to_string()
    } else {
        "python3".to_string()
    }
}

fn python_pytest_plan(root: &Path) -> Vec<PlannedStep> {
    let python = select_python(root);
    if root.join("pytest.ini").is_file() {
        return vec![PlannedStep::simple(
            "pytest",
            StepKind::Argv {
                program: python,
                args: ["-m", "pytest", "-c", "./pytest.ini", "-q"]
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
                cwd: ".".to_string(),
            },
        )];
    }
    if root.join("tests").is_dir() {
        return vec![PlannedStep::simple(
            "pytest",
            StepKind::Argv {
                program: python,
                args: ["-m", "pytest", "-q"].iter().map(|s| s.to_string()).collect(),
                cwd: ".".to_string(),
            },
        )];
    }
    vec![PlannedStep::simple(
        "pytest",
        StepKind::Skip("no pytest.ini or tests/ directory".to_string()),
    )]
}

fn read_npm_scripts(manifest: &Path) -> Result<Vec<String>, String> {
    let text = std::fs::read_to_string(manifest)
        .map_err(|e| format!("failed to read package.json: {}", e))?;
    let value: serde_json::Value = serde_json::from_str(&text)
        .map_err(|e| format!("failed to parse package.json: {}", e))?;
    let scripts = value
        .get("scripts")
        .and_then(|s| s.as_object())
        .map(|obj| obj.keys().cloned().collect())
        .unwrap_or_default();
    Ok(scripts)
}

fn node_plan(root: &Path, dir: &str, name_prefix: &str, no_install: bool) -> Vec<PlannedStep> {
    let step_name = |base: &str| format!("{}{}", name_prefix, base);
    let manifest = root.join(dir).join("package.json");
    if !manifest.is_file() {
        return vec![PlannedStep::simple(
            &step_name("npm"),
            StepKind::Skip("no package.json found".to_string()),
        )];
    }
    if !is_on_path("node") || !is_on_path("npm") {
        return vec![PlannedStep::simple(
            &step_name("npm"),
            StepKind::Skip("node/npm not available".to_string()),
        )];
    }
    let scripts = match read_npm_scripts(&manifest) {
        Ok(scripts) => scripts,
        Err(reason) => {
            return vec![PlannedStep::simple(&step_name("npm"), StepKind::Fail(reason))]
        }
    };
    let wanted: Vec<&str> = ["lint", "test", "build"]
        .into_iter()
        .filter(|w| scripts.iter().any(|s| s == w))
        .collect();
    if wanted.is_empty() {
        return vec![PlannedStep::simple(
            &step_name("npm"),
            StepKind::Skip("no scripts (lint/test/build) found".to_string()),
        )];
    }

    let mut plan: Vec<PlannedStep> = Vec::new();
    if !no_install {
        plan.push(PlannedStep {
            name: step_name("npm-install"),
            kind: StepKind::Shell {
                command: "npm ci".to_string(),
                cwd: dir.to_string(),
            },
            fallback: Some(StepKind::Shell {
                command: "npm install".to_string(),
                cwd: dir.to_string(),
            }),
        });
    }
    for script in wanted {
        plan.push(PlannedStep::simple(
            &step_name(&format!("npm-{}", script)),
            StepKind::Shell {
                command: format!("npm run {}", script),
                cwd: dir.to_string(),
            },
        ));
    }
    plan
}

fn generic_plan(commands: &[String]) -> Vec<PlannedStep> {
    if commands.is_empty() {
        return vec![PlannedStep::simple(
            "shell",
            StepKind::Skip("no commands provided".to_string()),
        )];
    }
    commands
        .iter()
        .enumerate()
        .map(|(i, command)| {
            PlannedStep::simple(
                &format!("cmd{}", i + 1),
                StepKind::Shell {
                    command: command.clone(),
                    cwd: ".".to_string(),
                },
            )
        })
        .collect()
}

/// The legacy profile runs the backend pytest plan at the project root and
/// the node plan under `frontend/`, filtered by scope.
fn legacy_plan(root: &Path, opts: &RunOptions) -> Vec<PlannedStep> {
    let mut plan: Vec<PlannedStep> = Vec::new();
    if matches!(opts.scope, Scope::Backend | Scope::All) {
        for mut step in python_pytest_plan(root) {
            step.name = format!("backend-{}", step.name);
            plan.push(step);
        }
    }
    if matches!(opts.scope, Scope::Frontend | Scope::All) {
        plan.extend(node_plan(root, "frontend", "frontend-", opts.no_install));
    }
    plan
}
