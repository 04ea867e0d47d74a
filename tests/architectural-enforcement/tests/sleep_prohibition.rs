//! Integration Test: Sleep Prohibition
//!
//! **Policy**: Router production code MUST NOT call sleep methods.
//! Attempt deadlines use `tokio::time::timeout`, breaker windows compare
//! `Instant`s lazily, and waiters park on channels or `Notify`.
//!
//! Test code and `test_utils.rs` are exempt.

use architectural_enforcement::{production_lines, report};

#[test]
fn test_no_sleep_in_production_code() {
    let violations: Vec<_> = production_lines()
        .into_iter()
        .filter(|l| l.code.contains("::sleep(") || l.code.contains(".sleep("))
        .collect();

    report(
        "Sleep calls found in production code!",
        &[
            "✅ REQUIRED instead:",
            "  - tokio::time::timeout() for deadlines",
            "  - Instant comparisons for cool-down windows",
            "  - oneshot / Notify for waiting on events",
        ],
        &violations,
    );
}

#[test]
fn test_scanner_sees_router_sources() {
    let lines = production_lines();
    assert!(lines
        .iter()
        .any(|l| l.path.ends_with("routing/router.rs") && l.code.contains("tokio::time::timeout")));
    assert!(!lines
        .iter()
        .any(|l| l.path.ends_with("routing/test_utils.rs")));

    // Re-exports below the `#[cfg(test)] pub mod test_utils;` declaration
    assert!(lines
        .iter()
        .any(|l| l.path.ends_with("routing/mod.rs") && l.code.starts_with("pub use router::")));
    assert!(!lines.iter().any(|l| l.code.contains("mod test_utils")));
}
