//! Sleep Prohibition
//!
//! Production code waits on events, deadlines and timers, never on a fixed
//! sleep. Only the primitives that implement waiting may call it:
//!
//! - `timer.rs`: deferred and periodic actions
//! - `retry.rs`: backoff between attempts
//! - `executor.rs`: the hard execution deadline
//! - `provider/simulated.rs`: simulated latency

use architectural_enforcement::{dispatch_root, scan};

const SLEEP_PATTERNS: &[&str] = &["sleep(", "sleep_until("];

const SLEEP_ALLOWED: &[&str] = &[
    "core/src/timer.rs",
    "core/src/scheduling/retry.rs",
    "core/src/scheduling/executor.rs",
    "core/src/provider/simulated.rs",
];

#[test]
fn test_no_sleep_in_production_code() {
    let violations = scan(&dispatch_root(), SLEEP_PATTERNS, SLEEP_ALLOWED);
    assert!(
        violations.is_empty(),
        "sleep calls outside timer/retry/executor/simulation code:\n{}",
        violations
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("\n")
    );
}

#[test]
fn test_no_blocking_sleep_anywhere() {
    // Even the allowed files must not block a runtime thread
    let violations = scan(&dispatch_root(), &["thread::sleep"], &[]);
    assert!(
        violations.is_empty(),
        "blocking sleep in async code:\n{}",
        violations
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("\n")
    );
}
