//! End-to-end local bootstrap (spec §8 S1/S6): spawn a real `relaymux`
//! master process which itself bootstraps a real `relaymux` peer process
//! over the local transport, calls a built-in function in it, and checks
//! the master exits cleanly without an explicit shutdown step.

use std::process::Command;
use std::time::Duration;

fn relaymux_bin() -> &'static str {
    env!("CARGO_BIN_EXE_relaymux")
}

#[test]
fn connect_local_calls_os_getuid() {
    let bin = relaymux_bin();
    let output = Command::new(bin)
        .args(["connect", "local", "--python-path", bin])
        .output()
        .expect("spawning relaymux connect local");

    assert!(output.status.success(), "master exited non-zero: {output:?}");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("os.getuid() = Int("), "unexpected stdout: {stdout}");
}

#[test]
fn connect_local_terminates_within_shutdown_grace() {
    let bin = relaymux_bin();
    let start = std::time::Instant::now();
    let output = Command::new(bin)
        .args(["connect", "local", "--python-path", bin])
        .output()
        .expect("spawning relaymux connect local");
    assert!(output.status.success());
    // Config's default shutdown grace is a few seconds; the whole
    // round-trip (spawn, handshake, one call, shutdown, reap) should
    // comfortably finish well under a minute even on a loaded CI box.
    assert!(start.elapsed() < Duration::from_secs(60));
}
