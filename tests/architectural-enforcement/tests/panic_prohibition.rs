//! Panic Prohibition
//!
//! Production paths propagate errors with `?` instead of panicking.
//! `unwrap_or*` variants are fine; bare `unwrap()`/`expect()` are not.

use architectural_enforcement::{dispatch_root, scan};

#[test]
fn test_no_unwrap_or_expect_in_production_code() {
    let violations = scan(&dispatch_root(), &[".unwrap()", ".expect("], &[]);
    assert!(
        violations.is_empty(),
        "panicking shortcuts in production code:\n{}",
        violations
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("\n")
    );
}
