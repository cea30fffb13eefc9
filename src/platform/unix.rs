//! Unix process signalling (Linux and macOS)

use anyhow::Result;
use tracing::debug;

use super::Delivery;

/// Terminate a process gracefully (SIGTERM)
pub fn terminate_process(pid: u32) -> Result<Delivery> {
    send_signal(pid, libc::SIGTERM, "terminate")
}

/// Force kill a process (SIGKILL)
pub fn kill_process(pid: u32) -> Result<Delivery> {
    send_signal(pid, libc::SIGKILL, "kill")
}

fn send_signal(pid: u32, signal: libc::c_int, action: &str) -> Result<Delivery> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| anyhow::anyhow!("PID {} is out of range", pid))?;

    // kill(0) or kill(-1) would signal whole process groups
    if pid <= 0 {
        anyhow::bail!("Refusing to {} PID {}", action, pid);
    }

    let result = unsafe { libc::kill(pid, signal) };
    if result == 0 {
        return Ok(Delivery::Sent);
    }

    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        debug!("PID {} already exited before {}", pid, action);
        Ok(Delivery::Gone)
    } else {
        anyhow::bail!("Failed to {} process {}: {}", action, pid, err)
    }
}
