//! Failure diagnosis: extract key error lines and file hints from run output.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Ordered marker list; scan order decides which lines surface first.
const KEY_ERROR_MARKERS: [&str; 9] = [
    "Traceback",
    "ModuleNotFoundError",
    "NameError",
    "AssertionError",
    "ImportError",
    "FAILED",
    "ERROR",
    "CORS",
    "404",
];

const MAX_KEY_ERRORS: usize = 10;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Diagnosis {
    pub key_errors: Vec<String>,
    pub files_hint: Vec<String>,
}

impl Diagnosis {
    pub fn is_empty(&self) -> bool {
        self.key_errors.is_empty()
    }
}

fn collect_key_errors(lines: &[String], seen: &mut HashSet<String>, out: &mut Vec<String>) {
    for line in lines {
        if out.len() >= MAX_KEY_ERRORS {
            return;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if !KEY_ERROR_MARKERS.iter().any(|m| trimmed.contains(m)) {
            continue;
        }
        if seen.insert(trimmed.to_string()) {
            out.push(trimmed.to_string());
        }
    }
}

fn collect_file_hints(lines: &[String], seen: &mut HashSet<String>, out: &mut Vec<String>) {
    let Ok(trace_re) = Regex::new(r#"File "([^"]+)", line \d+"#) else {
        return;
    };
    let Ok(pytest_re) = Regex::new(r"(?m)^([^\s:]+\.[A-Za-z]+):\d+:") else {
        return;
    };
    for line in lines {
        for re in [&trace_re, &pytest_re] {
            if let Some(caps) = re.captures(line) {
                if let Some(path) = caps.get(1) {
                    let path = path.as_str().to_string();
                    if seen.insert(path.clone()) {
                        out.push(path);
                    }
                }
            }
        }
    }
}

/// Scan the summary first, then the log tail, keeping first occurrences and
/// capping the result so a noisy log cannot flood a fix plan.
pub fn diagnose(summary_lines: &[String], log_tail: &[String]) -> Diagnosis {
    let mut key_errors: Vec<String> = Vec::new();
    let mut seen_errors: HashSet<String> = HashSet::new();
    collect_key_errors(summary_lines, &mut seen_errors, &mut key_errors);
    collect_key_errors(log_tail, &mut seen_errors, &mut key_errors);

    let mut files_hint: Vec<String> = Vec::new();
    let mut seen_files: HashSet<String> = HashSet::new();
    collect_file_hints(summary_lines, &mut seen_files, &mut files_hint);
    collect_file_hints(log_tail, &mut seen_files, &mut files_hint);

    Diagnosis {
        key_errors,
        files_hint,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_key_errors_deduped_in_order() {
        let log = lines(&[
            "collecting tests",
            "Traceback (most recent call last):",
            "NameError: name 'Query' is not defined",
            "NameError: name 'Query' is not defined",
            "FAILED tests/test_api.py::test_items",
        ]);
        let diag = diagnose(&[], &log);
        assert_eq!(diag.key_errors.len(), 3);
        assert!(diag.key_errors[0].starts_with("Traceback"));
        assert!(diag.key_errors[1].starts_with("NameError"));
        assert!(diag.key_errors[2].starts_with("FAILED"));
    }

    #[test]
    fn test_summary_scanned_before_log() {
        let summary = lines(&["- AssertionError: expected 3"]);
        let log = lines(&["Traceback (most recent call last):"]);
        let diag = diagnose(&summary, &log);
        assert!(diag.key_errors[0].contains("AssertionError"));
        assert!(diag.key_errors[1].contains("Traceback"));
    }

    #[test]
    fn test_key_errors_capped() {
        let log: Vec<String> = (0..30)
            .map(|i| format!("ERROR: distinct failure {}", i))
            .collect();
        let diag = diagnose(&[], &log);
        assert_eq!(diag.key_errors.len(), 10);
    }

    #[test]
    fn test_file_hints_from_traceback_and_pytest_styles() {
        let log = lines(&[
            r#"  File "app/main.py", line 12, in root"#,
            "tests/test_api.py:7: AssertionError",
            r#"  File "app/main.py", line 30, in other"#,
        ]);
        let diag = diagnose(&[], &log);
        assert_eq!(diag.files_hint, vec!["app/main.py", "tests/test_api.py"]);
    }

    #[test]
    fn test_clean_output_yields_empty_diagnosis() {
        let diag = diagnose(&lines(&["3) Result: SUCCESS"]), &lines(&["all good"]));
        assert!(diag.is_empty());
        assert!(diag.files_hint.is_empty());
    }
}
