//! Small shared helpers: truncation, tail extraction, artifact timestamps.

use std::path::PathBuf;

pub fn truncate(s: &str, max: usize) -> String {
    if max == 0 {
        return String::new();
    }

    let char_count = s.chars().count();
    if char_count <= max {
        return s.to_string();
    }

    if max <= 3 {
        return s.chars().take(max).collect();
    }

    let truncated: String = s.chars().take(max - 3).collect();
    format!("{}...", truncated)
}

/// Last `max_lines` lines of a text blob, in order.
pub fn tail_lines(text: &str, max_lines: usize) -> Vec<String> {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].iter().map(|s| s.to_string()).collect()
}

/// Artifact timestamp in the `YYYYmmdd_HHMMSS` form used for log file names.
pub fn timestamp() -> String {
    chrono::Local::now().format("%Y%m%d_%H%M%S").to_string()
}

/// Check whether an executable is reachable through `PATH`.
pub fn is_on_path(binary: &str) -> bool {
    let Some(paths) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&paths).any(|dir| {
        let candidate: PathBuf = dir.join(binary);
        candidate.is_file()
    })
}

#[cfg(test)]
mod tests {
    use super::{is_on_path, tail_lines, timestamp, truncate};

    #[test]
    fn test_truncate_unicode_safe() {
        let input = "ééééé";
        assert_eq!(truncate(input, 4), "é...");
    }

    #[test]
    fn test_truncate_small_max() {
        let input = "こんにちは";
        assert_eq!(truncate(input, 3), "こんに");
        assert_eq!(truncate(input, 0), "");
    }

    #[test]
    fn test_truncate_no_change_when_short() {
        assert_eq!(truncate("ok", 10), "ok");
    }

    #[test]
    fn test_tail_lines_keeps_order() {
        let text = "a\nb\nc\nd";
        assert_eq!(tail_lines(text, 2), vec!["c", "d"]);
        assert_eq!(tail_lines(text, 10).len(), 4);
    }

    #[test]
    fn test_timestamp_shape() {
        let ts = timestamp();
        assert_eq!(ts.len(), 15);
        assert_eq!(ts.as_bytes()[8], b'_');
    }

    #[test]
    fn test_is_on_path_finds_sh() {
        assert!(is_on_path("sh"));
        assert!(!is_on_path("definitely-not-a-real-binary-name"));
    }
}
