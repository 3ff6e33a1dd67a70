//! Integration Test: Blocking I/O Prohibition
//!
//! **Policy**: Production code in the bridge crates MUST NOT use blocking I/O
//! inside the runtime.
//! **Required**: Use `tokio::fs`, `tokio::net`, `tokio::process`, not `std::fs`, `std::net`, `std::process`

use std::fs;
use std::path::Path;

use architectural_enforcement::{production_source_dirs, rust_files};

/// Test that production code does not use blocking I/O
#[test]
fn test_no_blocking_io_in_production_code() {
    let violations = find_blocking_io_violations();

    if !violations.is_empty() {
        eprintln!("\n❌ CRITICAL: Blocking I/O calls found in production code!\n");

        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }

        eprintln!("\n❌ FORBIDDEN blocking I/O:");
        eprintln!("  - std::fs::read(), std::fs::write(), std::fs::File");
        eprintln!("  - std::net::TcpStream, std::net::TcpListener");
        eprintln!("  - std::process::Command::output()");
        eprintln!("  - reqwest::blocking::*");
        eprintln!("\n✅ REQUIRED async I/O:");
        eprintln!("  - tokio::fs::read().await, tokio::fs::write().await");
        eprintln!("  - tokio::net::TcpStream::connect().await");
        eprintln!("  - tokio::process::Command::output().await");
        eprintln!("  - reqwest::Client::post().send().await");
        eprintln!("\n✅ ACCEPTABLE blocking I/O:");
        eprintln!("  - Private non-async functions (config loading before the runtime)");
        eprintln!("  - Test code");

        panic!(
            "\nFound {} blocking I/O violation(s) in production code.\nFix these before merging!",
            violations.len()
        );
    }
}

/// Find all blocking I/O calls in production code
fn find_blocking_io_violations() -> Vec<String> {
    let mut violations = Vec::new();

    for dir in production_source_dirs() {
        for file in rust_files(&dir) {
            check_file(&file, &mut violations);
        }
    }

    violations
}

fn check_file(path: &Path, violations: &mut Vec<String>) {
    let Ok(content) = fs::read_to_string(path) else {
        return;
    };

    let lines: Vec<&str> = content.lines().collect();

    for (idx, line) in lines.iter().enumerate() {
        for reason in blocking_io_violations(&lines, idx) {
            violations.push(format!(
                "{}:{} - {reason}: {}",
                path.display(),
                idx + 1,
                line.trim()
            ));
        }
    }
}

fn blocking_io_violations(lines: &[&str], idx: usize) -> Vec<&'static str> {
    // Skip comments
    let code_part = lines[idx].split("//").next().unwrap_or(lines[idx]);
    let mut found = Vec::new();

    if is_in_test_function(lines, idx) || is_in_non_async_function(lines, idx) {
        return found;
    }

    if code_part.contains("std::fs::") || code_part.contains("use std::fs") {
        found.push("Blocking file I/O");
    }
    if code_part.contains("std::net::") || code_part.contains("use std::net") {
        found.push("Blocking network I/O");
    }
    if code_part.contains("std::process::Command") && !code_part.contains("tokio::process") {
        found.push("Blocking process I/O");
    }
    if code_part.contains("reqwest::blocking") {
        found.push("Blocking HTTP client");
    }
    if (code_part.contains("std::io::stdin()") || code_part.contains("std::io::stdout()"))
        && is_in_async_function(lines, idx)
    {
        found.push("Blocking stdin/stdout in async");
    }

    found
}

/// Check if line is inside a test function
fn is_in_test_function(lines: &[&str], current_idx: usize) -> bool {
    // Scan backwards to find the enclosing function
    let mut found_fn_idx = None;
    for i in (0..current_idx).rev() {
        let line = lines[i].trim();

        if line.starts_with("fn ") || line.contains(" fn ") {
            found_fn_idx = Some(i);
            break;
        }

        // Stop at module boundaries
        if line.starts_with("mod ") || (line.starts_with("impl ") && line.contains('{')) {
            return false;
        }
    }

    // If we found a function, check if it has a test marker
    if let Some(fn_idx) = found_fn_idx {
        for i in (0..fn_idx).rev() {
            let line = lines[i].trim();

            if line.starts_with("#[test]")
                || line.starts_with("#[tokio::test")
                || line.starts_with("#[cfg(test)]")
            {
                return true;
            }

            // Stop if we hit another function or boundary
            if line.starts_with("fn ") || line.starts_with("mod ") || line.starts_with("impl ") {
                break;
            }
        }
    }

    false
}

/// Check if line is inside an async function
fn is_in_async_function(lines: &[&str], current_idx: usize) -> bool {
    for i in (0..current_idx).rev() {
        let line = lines[i].trim();

        if line.contains("async fn ") {
            return true;
        }

        if line.starts_with("fn ") && !line.contains("async") {
            return false;
        }

        // Stop at module/impl boundaries
        if line.starts_with("mod ") || (line.starts_with("impl ") && line.contains('{')) {
            return false;
        }
    }
    false
}

/// Check if line is inside a private non-async function
fn is_in_non_async_function(lines: &[&str], current_idx: usize) -> bool {
    for i in (0..current_idx).rev() {
        let line = lines[i].trim();

        if line.starts_with("fn ") && !line.contains("async") {
            return true;
        }

        if line.contains("async fn ") {
            return false;
        }

        // Stop at module/impl boundaries
        if line.starts_with("mod ") || (line.starts_with("impl ") && line.contains('{')) {
            return false;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocking_io_detection() {
        let code = [
            "async fn bad_function() {",
            "    let contents = std::fs::read_to_string(\"file.txt\")?;",
            "}",
        ];

        assert!(is_in_async_function(&code, 1), "Should detect async function");
        assert!(!is_in_non_async_function(&code, 1));
        assert_eq!(blocking_io_violations(&code, 1), vec!["Blocking file I/O"]);
    }

    #[test]
    fn test_non_async_function_detection() {
        let code = [
            "fn read_config_file(path: &Path) -> Result<String, ConfigError> {",
            "    std::fs::read_to_string(path)",
            "}",
        ];

        assert!(is_in_non_async_function(&code, 1), "Should detect non-async function");
        assert!(blocking_io_violations(&code, 1).is_empty());
    }

    #[test]
    fn test_test_function_detection() {
        let code = [
            "#[test]",
            "fn test_something() {",
            "    let contents = std::fs::read_to_string(\"test.txt\")?;",
            "}",
        ];

        assert!(is_in_test_function(&code, 2), "Should detect test function");
    }

    #[test]
    fn test_blocking_socket_flagged() {
        let code = [
            "pub async fn serve() {",
            "    let listener = std::net::TcpListener::bind(addr)?;",
            "}",
        ];

        assert_eq!(blocking_io_violations(&code, 1), vec!["Blocking network I/O"]);
    }
}
