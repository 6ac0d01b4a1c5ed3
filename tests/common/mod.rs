//! Shared helpers for the integration tests.

use std::process::Command;

const ISOLATED_TEST: &str = "FIBERLANE_ISOLATED_TEST";

/// Runs `body` in a fresh copy of this test binary and asserts that the copy
/// aborted with `message` on stderr.
///
/// `test_name` must be the name of the calling test, so the child process
/// runs exactly that test and nothing else.
pub fn expect_abort(test_name: &str, message: &str, body: impl FnOnce()) {
    if std::env::var(ISOLATED_TEST).as_deref() == Ok(test_name) {
        body();
        return;
    }

    let output = Command::new(std::env::current_exe().unwrap())
        .args([test_name, "--exact", "--nocapture", "--test-threads=1"])
        .env(ISOLATED_TEST, test_name)
        .output()
        .unwrap();
    let stderr = String::from_utf8_lossy(&output.stderr);

    assert!(
        !output.status.success(),
        "child process for {test_name} kept running: {stderr}"
    );
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        // SIGABRT
        assert_eq!(output.status.signal(), Some(6), "stderr: {stderr}");
    }
    assert!(stderr.contains(message), "stderr: {stderr}");
}
