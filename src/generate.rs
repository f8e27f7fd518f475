//! Project generation seam.
//!
//! Generation itself is delegated to an external command so the pipeline can
//! sit in front of any scaffolder. The contract is small: the command gets
//! the idea text as its final argument and prints the created project path
//! as its last stdout line.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::exec;
use crate::util::truncate;

#[derive(Debug, Error)]
pub enum GenerateError {
    #[error("generator command failed (exit {exit_code}): {stderr_tail}")]
    CommandFailed { exit_code: i32, stderr_tail: String },
    #[error("generator produced no project path")]
    NoPath,
    #[error("generator reported a path that does not exist: {0}")]
    MissingProject(String),
    #[error("failed to run generator: {0}")]
    Spawn(String),
}

#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
    pub timeout: Option<Duration>,
}

pub trait ProjectGenerator {
    fn generate(&self, idea: &str, opts: &GenerateOptions) -> Result<PathBuf, GenerateError>;
}

/// Runs a shell command with the idea appended as a quoted argument.
pub struct CommandGenerator {
    pub command: String,
    pub workdir: PathBuf,
}

impl CommandGenerator {
    pub fn new(command: &str, workdir: &Path) -> CommandGenerator {
        CommandGenerator {
            command: command.to_string(),
            workdir: workdir.to_path_buf(),
        }
    }
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

impl ProjectGenerator for CommandGenerator {
    fn generate(&self, idea: &str, opts: &GenerateOptions) -> Result<PathBuf, GenerateError> {
        let command = format!("{} {}", self.command, shell_quote(idea));
        let timeout = opts.timeout.unwrap_or(Duration::from_secs(1800));
        let result = exec::run_shell_capture(&command, &self.workdir, timeout)
            .map_err(GenerateError::Spawn)?;
        if !result.success() {
            return Err(GenerateError::CommandFailed {
                exit_code: result.exit_code,
                stderr_tail: truncate(result.stderr.trim(), 500),
            });
        }
        let path_line = result
            .stdout
            .lines()
            .rev()
            .map(|l| l.trim())
            .find(|l| !l.is_empty())
            .ok_or(GenerateError::NoPath)?;
        let path = PathBuf::from(path_line);
        let resolved = if path.is_absolute() {
            path
        } else {
            self.workdir.join(path)
        };
        if !resolved.is_dir() {
            return Err(GenerateError::MissingProject(path_line.to_string()));
        }
        Ok(resolved)
    }
}
