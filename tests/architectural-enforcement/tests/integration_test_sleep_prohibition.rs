//! Integration Test: Sleep Prohibition
//!
//! **Policy**: Production code in the bridge crates MUST NOT call sleep methods.
//! Timers wait on a deadline (`sleep_until`) or a `tokio::time::interval`.
//! **Exceptions**: exponential backoff (retry logic only), test code

use std::fs;
use std::path::Path;

use architectural_enforcement::{production_source_dirs, rust_files};

/// Test that production code does not contain sleep() calls
#[test]
fn test_no_sleep_in_production_code() {
    let violations = find_sleep_violations();

    if !violations.is_empty() {
        eprintln!("\n❌ CRITICAL: Sleep calls found in production code!\n");

        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }

        eprintln!("\n✅ ACCEPTABLE sleep uses:");
        eprintln!("  - Exponential backoff in retry logic");
        eprintln!("  - Test code (#[test] or #[tokio::test] functions)");
        eprintln!("  - Periodic tasks using tokio::time::interval()");
        eprintln!("  - Deadlines using tokio::time::sleep_until()");
        eprintln!("\n❌ FORBIDDEN:");
        eprintln!("  - Sleep in polling loops");
        eprintln!("  - Sleep as poor man's synchronization");
        eprintln!("  - Sleep to 'wait' for events (use async I/O!)");

        panic!(
            "\nFound {} sleep violation(s) in production code.\nFix these before merging!",
            violations.len()
        );
    }
}

/// Find all sleep() calls in production code
fn find_sleep_violations() -> Vec<String> {
    let mut violations = Vec::new();
    let policy = SleepPolicy {
        allow_backoff: true,
        allow_tests: true,
    };

    for dir in production_source_dirs() {
        for file in rust_files(&dir) {
            check_file(&file, &mut violations, &policy);
        }
    }

    violations
}

struct SleepPolicy {
    allow_backoff: bool,
    allow_tests: bool,
}

fn check_file(path: &Path, violations: &mut Vec<String>, policy: &SleepPolicy) {
    let Ok(content) = fs::read_to_string(path) else {
        return;
    };

    let lines: Vec<&str> = content.lines().collect();

    for (idx, line) in lines.iter().enumerate() {
        if let Some(reason) = sleep_violation(&lines, idx, policy) {
            violations.push(format!(
                "{}:{} - {reason}: {}",
                path.display(),
                idx + 1,
                line.trim()
            ));
        }
    }
}

fn sleep_violation(lines: &[&str], idx: usize, policy: &SleepPolicy) -> Option<&'static str> {
    // Skip comments
    let code_part = lines[idx].split("//").next().unwrap_or(lines[idx]);

    if !(code_part.contains("::sleep(") || code_part.contains(".sleep(")) {
        return None;
    }
    if policy.allow_tests && is_in_test_function(lines, idx) {
        return None;
    }
    if policy.allow_backoff && is_backoff_context(lines, idx) {
        return None;
    }
    if is_interval_pattern(lines, idx) {
        return None;
    }
    Some("Sleep call")
}

/// Check if line is inside a test function
fn is_in_test_function(lines: &[&str], current_idx: usize) -> bool {
    // Scan backwards for #[test] or #[tokio::test]
    for i in (0..current_idx).rev() {
        let line = lines[i].trim();

        if line.starts_with("fn ") && !line.contains("test") {
            return false; // Found a non-test function first
        }

        if line.starts_with("#[test]") || line.starts_with("#[tokio::test") {
            return true;
        }

        // Stop at module boundaries
        if line.starts_with("mod ") || line.starts_with("impl ") {
            return false;
        }
    }
    false
}

/// Check if sleep is used for exponential backoff (acceptable for retry logic)
fn is_backoff_context(lines: &[&str], current_idx: usize) -> bool {
    // Look for backoff, retry, reconnect in nearby lines
    let context_range = current_idx.saturating_sub(15)..std::cmp::min(current_idx + 5, lines.len());

    let mut has_backoff_calc = false;
    let mut has_retry_context = false;

    for line in &lines[context_range] {
        let line = line.to_lowercase();

        // Exponential backoff calculation (2^n pattern or bit shift)
        if line.contains("<<") || line.contains("pow") || line.contains("* 2") {
            has_backoff_calc = true;
        }

        if line.contains("retry")
            || line.contains("reconnect")
            || line.contains("backoff")
            || line.contains("attempt")
        {
            has_retry_context = true;
        }
    }

    has_backoff_calc && has_retry_context
}

/// Check if this is tokio::time::interval pattern (acceptable for periodic tasks)
fn is_interval_pattern(lines: &[&str], current_idx: usize) -> bool {
    let before = current_idx.saturating_sub(20)..current_idx;
    if lines[before]
        .iter()
        .any(|line| line.contains("interval.tick()") || line.contains("tokio::time::interval"))
    {
        return true;
    }

    let after = current_idx..std::cmp::min(current_idx + 5, lines.len());
    lines[after].iter().any(|line| line.contains("interval.tick()"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strict() -> SleepPolicy {
        SleepPolicy {
            allow_backoff: false,
            allow_tests: false,
        }
    }

    #[test]
    fn test_sleep_violation_detection() {
        let code = [
            "fn bad_function() {",
            "    tokio::time::sleep(Duration::from_millis(10)).await;",
            "}",
        ];

        assert!(!is_in_test_function(&code, 1), "Should detect this is not a test");
        assert!(sleep_violation(&code, 1, &strict()).is_some());
    }

    #[test]
    fn test_sleep_until_is_allowed() {
        let code = [
            "fn arm_timer() {",
            "    tokio::time::sleep_until(deadline).await;",
            "}",
        ];

        assert!(sleep_violation(&code, 1, &strict()).is_none());
    }

    #[test]
    fn test_backoff_detection() {
        let code = [
            "fn reconnect() {",
            "    let delay = base_delay * (1 << attempt);",
            "    println!(\"Retry attempt {}\", attempt);",
            "    tokio::time::sleep(Duration::from_millis(delay)).await;",
            "}",
        ];

        assert!(
            is_backoff_context(&code, 3),
            "Should detect exponential backoff pattern"
        );
    }

    #[test]
    fn test_commented_sleep_ignored() {
        let code = ["    // tokio::time::sleep(d).await;"];
        assert!(sleep_violation(&code, 0, &strict()).is_none());
    }
}
