//! OS process liveness probing and process-tree kill.
//!
//! Both primitives shell out rather than binding platform APIs: the
//! workspace forbids `unsafe`, and a subprocess per probe is cheap at the
//! watchdog's cadence. On Linux the probe reads `/proc` directly.

use std::process::Command;

use tracing::debug;

/// Whether the OS process `pid` is currently alive.
#[must_use]
pub fn process_alive(pid: u32) -> bool {
    #[cfg(target_os = "linux")]
    {
        std::path::Path::new(&format!("/proc/{pid}")).exists()
    }
    #[cfg(all(unix, not(target_os = "linux")))]
    {
        // kill -0 probes without signaling.
        Command::new("kill")
            .args(["-0", &pid.to_string()])
            .output()
            .map(|out| out.status.success())
            .unwrap_or(false)
    }
    #[cfg(windows)]
    {
        Command::new("tasklist")
            .args(["/FI", &format!("PID eq {pid}"), "/NH"])
            .output()
            .map(|out| String::from_utf8_lossy(&out.stdout).contains(&pid.to_string()))
            .unwrap_or(false)
    }
}

/// Terminate `pid` and its descendants, best-effort.
///
/// POSIX: SIGTERM to the process group first (the runner's children share
/// it when the shell created one), then to the pid itself. Windows:
/// `taskkill /T /F`.
pub fn kill_process_tree(pid: u32) {
    debug!(pid, "killing process tree");
    #[cfg(unix)]
    {
        let group = format!("-{pid}");
        let _ = Command::new("kill").args(["-TERM", &group]).output();
        let _ = Command::new("kill").args(["-TERM", &pid.to_string()]).output();
    }
    #[cfg(windows)]
    {
        let _ = Command::new("taskkill")
            .args(["/T", "/F", "/PID", &pid.to_string()])
            .output();
    }
}
