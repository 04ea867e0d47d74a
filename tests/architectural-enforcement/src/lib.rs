//! Architectural Enforcement Integration Tests
//!
//! This package contains integration tests that enforce architectural principles
//! on the router's production code:
//! - No sleep() calls (waits are deadlines or events, never naps)
//! - No blocking I/O inside async functions
//!
//! The helpers below walk a crate's `src/` tree and yield only production
//! lines: comments are stripped, `test_utils.rs` is skipped, `#[cfg(test)]`
//! items are dropped, and scanning of a file stops at its inline test module.

use std::fs;
use std::path::{Path, PathBuf};

/// Crates whose production code is checked, relative to the workspace root
pub const PRODUCTION_CRATES: &[&str] = &["switchboard/core/src"];

/// One production source line
#[derive(Clone, Debug)]
pub struct SourceLine {
    /// File the line came from
    pub path: PathBuf,
    /// 1-based line number
    pub line_number: usize,
    /// Full line, trimmed
    pub text: String,
    /// Line with any trailing `//` comment removed
    pub code: String,
    /// Whether the nearest enclosing `fn` above this line is `async`
    pub in_async_fn: bool,
}

impl std::fmt::Display for SourceLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{} - {}", self.path.display(), self.line_number, self.text)
    }
}

/// Workspace root, derived from this package's manifest directory
#[must_use]
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

/// Every production line in every checked crate
#[must_use]
pub fn production_lines() -> Vec<SourceLine> {
    let root = workspace_root();
    let mut lines = Vec::new();

    for dir in PRODUCTION_CRATES {
        let path = root.join(dir);
        assert!(path.exists(), "missing production crate at {}", path.display());

        for entry in walkdir::WalkDir::new(&path)
            .into_iter()
            .filter_map(Result::ok)
        {
            let file = entry.path();
            if file.extension().and_then(|s| s.to_str()) != Some("rs") {
                continue;
            }
            if file.file_name().and_then(|s| s.to_str()) == Some("test_utils.rs") {
                continue;
            }
            collect_file(file, &mut lines);
        }
    }

    lines
}

fn collect_file(path: &Path, out: &mut Vec<SourceLine>) {
    let Ok(content) = fs::read_to_string(path) else {
        return;
    };

    let mut in_async_fn = false;
    for (line_number, text) in production_code(&content) {
        let code = text.split("//").next().unwrap_or(text).to_string();
        if code.contains("fn ") {
            in_async_fn = code.contains("async fn ");
        }

        out.push(SourceLine {
            path: path.to_path_buf(),
            line_number,
            text: text.to_string(),
            code,
            in_async_fn,
        });
    }
}

/// Trimmed non-comment lines of `content` with their 1-based numbers
///
/// An inline `#[cfg(test)] mod ... {` ends the file's production code. Any
/// other `#[cfg(test)]` item (e.g. `pub mod test_utils;`) is skipped on its
/// own and scanning resumes after it.
fn production_code(content: &str) -> Vec<(usize, &str)> {
    let mut lines = Vec::new();
    let mut after_cfg_test = false;

    for (idx, line) in content.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with("//") {
            continue;
        }
        if trimmed.starts_with("#[cfg(test)]") {
            after_cfg_test = true;
            continue;
        }
        if after_cfg_test {
            if trimmed.starts_with("#[") {
                continue;
            }
            after_cfg_test = false;
            if is_inline_mod(trimmed) {
                break;
            }
            continue;
        }

        lines.push((idx + 1, trimmed));
    }

    lines
}

fn is_inline_mod(line: &str) -> bool {
    let item = line.strip_prefix("pub ").unwrap_or(line);
    item.starts_with("mod ") && item.ends_with('{')
}

/// Print violations and fail the test if there are any
///
/// # Panics
///
/// Panics when `violations` is non-empty.
pub fn report(title: &str, hint: &[&str], violations: &[SourceLine]) {
    if violations.is_empty() {
        return;
    }

    eprintln!("\n❌ CRITICAL: {title}\n");
    for violation in violations {
        eprintln!("  ❌ {violation}");
    }
    eprintln!();
    for line in hint {
        eprintln!("  {line}");
    }

    panic!(
        "\nFound {} violation(s) in production code.\nFix these before merging!",
        violations.len()
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cfg_test_declaration_does_not_end_scan() {
        let source = "pub mod router;\n\
                      \n\
                      #[cfg(test)]\n\
                      pub mod test_utils;\n\
                      \n\
                      pub use router::*;\n\
                      \n\
                      #[cfg(test)]\n\
                      mod tests {\n\
                      \x20   fn helper() {}\n\
                      }\n";

        let lines: Vec<_> = production_code(source)
            .into_iter()
            .map(|(_, text)| text)
            .collect();
        assert_eq!(lines, vec!["pub mod router;", "pub use router::*;"]);
    }

    #[test]
    fn test_line_numbers_and_comments() {
        let source = "// header\nfn a() {}\n    // note\nasync fn b() {}\n";
        assert_eq!(
            production_code(source),
            vec![(2, "fn a() {}"), (4, "async fn b() {}")]
        );
    }

    #[test]
    fn test_attributes_between_cfg_test_and_module() {
        let source = "fn live() {}\n#[cfg(test)]\n#[allow(unused)]\nmod tests {\nfn dead() {}\n}\n";
        assert_eq!(production_code(source), vec![(1, "fn live() {}")]);
    }
}
