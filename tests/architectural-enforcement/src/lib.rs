//! Architectural Enforcement Integration Tests
//!
//! Source scans over the dispatch crates that enforce architectural rules:
//! - No sleeping outside the timer, retry and simulation primitives
//! - No panicking shortcuts (`unwrap`/`expect`) in production paths
//!
//! Test code (`#[cfg(test)]` items and `tests/` directories) is exempt.

use std::fs;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

/// One offending line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// File, relative to the scanned root
    pub path: PathBuf,
    /// 1-based line number
    pub line: usize,
    /// The offending line, trimmed
    pub text: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}: {}", self.path.display(), self.line, self.text)
    }
}

/// The `dispatch/` directory holding every production crate
#[must_use]
pub fn dispatch_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join("..")
        .join("dispatch")
}

/// Rust sources under `root`, skipping `tests/`, `benches/` and `target/`
#[must_use]
pub fn production_sources(root: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
        .filter(|e| {
            !e.path().components().any(|c| {
                matches!(
                    c.as_os_str().to_str(),
                    Some("tests" | "benches" | "target")
                )
            })
        })
        .map(walkdir::DirEntry::into_path)
        .collect();
    files.sort();
    files
}

/// Blank out every `#[cfg(test)]` item, keeping line numbers intact
#[must_use]
pub fn strip_test_code(source: &str) -> String {
    let mut out = String::with_capacity(source.len());
    let mut skipping = false;
    let mut depth: i64 = 0;
    let mut opened = false;

    for line in source.lines() {
        if !skipping && line.trim_start().starts_with("#[cfg(test)]") {
            skipping = true;
            depth = 0;
            opened = false;
            out.push('\n');
            continue;
        }
        if skipping {
            for ch in line.chars() {
                match ch {
                    '{' => {
                        depth += 1;
                        opened = true;
                    }
                    '}' => depth -= 1,
                    _ => {}
                }
            }
            // A braced item ends when its braces balance; `use ...;` ends at once
            if (opened && depth <= 0) || (!opened && line.trim_end().ends_with(';')) {
                skipping = false;
            }
            out.push('\n');
            continue;
        }
        out.push_str(line);
        out.push('\n');
    }
    out
}

/// Lines of production code in `root` containing any of `patterns`
///
/// Files whose path ends with an entry of `allowed` are skipped, as are
/// comment lines.
#[must_use]
pub fn scan(root: &Path, patterns: &[&str], allowed: &[&str]) -> Vec<Violation> {
    let mut violations = Vec::new();
    for path in production_sources(root) {
        let relative = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
        let normalized = relative.to_string_lossy().replace('\\', "/");
        if allowed.iter().any(|a| normalized.ends_with(a)) {
            continue;
        }
        let Ok(source) = fs::read_to_string(&path) else {
            continue;
        };
        for (index, line) in strip_test_code(&source).lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.starts_with("//") {
                continue;
            }
            if patterns.iter().any(|p| trimmed.contains(p)) {
                violations.push(Violation {
                    path: relative.clone(),
                    line: index + 1,
                    text: trimmed.to_string(),
                });
            }
        }
    }
    violations
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_test_code_blanks_test_modules() {
        let source = "fn real() {}\n#[cfg(test)]\nmod tests {\n    fn t() { x.unwrap(); }\n}\nfn after() {}\n";
        let stripped = strip_test_code(source);

        assert_eq!(stripped.lines().count(), source.lines().count());
        assert!(!stripped.contains("unwrap"));
        assert!(stripped.contains("fn real()"));
        assert!(stripped.contains("fn after()"));
    }

    #[test]
    fn test_strip_test_code_handles_single_line_items() {
        let source = "#[cfg(test)]\nuse std::time::Duration;\nfn kept() {}\n";
        let stripped = strip_test_code(source);
        assert!(!stripped.contains("Duration"));
        assert!(stripped.contains("fn kept()"));
    }

    #[test]
    fn test_dispatch_root_has_sources() {
        let files = production_sources(&dispatch_root());
        assert!(files.iter().any(|p| p.ends_with("dispatcher.rs")));
        assert!(!files
            .iter()
            .any(|p| p.components().any(|c| c.as_os_str() == "tests")));
    }
}
