//! Integration Test: Blocking I/O Prohibition
//!
//! **Policy**: Async router code MUST NOT use blocking I/O.
//! **Required**: Use `tokio::fs`, `tokio::net`, `tokio::process`, not `std::fs`, `std::net`, `std::process`
//!
//! Blocking calls are acceptable in non-async functions (configuration is
//! loaded before the router starts serving).

use architectural_enforcement::{production_lines, report, SourceLine};

const BLOCKING_IN_ASYNC: &[&str] = &[
    "std::fs::",
    "std::process::Command",
    "std::io::stdin()",
    "std::io::stdout()",
    "std::thread::sleep",
    ".blocking_recv(",
    ".blocking_lock(",
];

const BLOCKING_ANYWHERE: &[&str] = &["std::net::", "use std::net", "reqwest::blocking"];

fn is_violation(line: &SourceLine) -> bool {
    BLOCKING_ANYWHERE.iter().any(|p| line.code.contains(p))
        || (line.in_async_fn && BLOCKING_IN_ASYNC.iter().any(|p| line.code.contains(p)))
}

#[test]
fn test_no_blocking_io_in_production_code() {
    let violations: Vec<_> = production_lines()
        .into_iter()
        .filter(is_violation)
        .collect();

    report(
        "Blocking I/O calls found in production code!",
        &[
            "❌ FORBIDDEN in async code:",
            "  - std::fs::*, std::process::Command, std::thread::sleep",
            "  - blocking_recv() / blocking_lock()",
            "❌ FORBIDDEN everywhere: std::net::*, reqwest::blocking::*",
            "✅ ACCEPTABLE: std::fs in non-async functions (config loading)",
        ],
        &violations,
    );
}
