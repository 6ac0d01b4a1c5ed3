//! Runs the ping-pong stress binary end to end.

use std::process::Command;

fn run_stress(args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_fiberlane"))
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .expect("failed to run the stress binary")
}

#[test]
fn test_mixed_waits_with_tiny_timeout_pass() {
    // 1µs timeouts: plain waits regularly follow timed-out ones.
    let output = run_stress(&["2", "8", "500", "1000"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        output.status.success(),
        "stdout: {stdout}\nstderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(stdout.contains("num_timeouts:"), "stdout: {stdout}");
    assert!(stdout.contains("4 pairs x 500 round-trips"), "stdout: {stdout}");
}

#[test]
fn test_rejects_malformed_arguments() {
    let output = run_stress(&["two"]);
    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("invalid num_workers"));
}
