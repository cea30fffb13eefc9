//! Platform-specific process signalling for Unix and Windows

#[cfg(windows)]
pub mod windows;

#[cfg(unix)]
pub mod unix;

use anyhow::Result;

/// Result of delivering a termination request to a process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The request reached the process
    Sent,
    /// The process no longer exists
    Gone,
}

/// Ask a process to exit gracefully
pub fn terminate_process(pid: u32) -> Result<Delivery> {
    #[cfg(windows)]
    {
        windows::terminate_process(pid)
    }
    #[cfg(unix)]
    {
        unix::terminate_process(pid)
    }
    #[cfg(not(any(windows, unix)))]
    {
        let _ = pid;
        anyhow::bail!("Unsupported platform")
    }
}

/// Force kill a process
pub fn kill_process(pid: u32) -> Result<Delivery> {
    #[cfg(windows)]
    {
        windows::kill_process(pid)
    }
    #[cfg(unix)]
    {
        unix::kill_process(pid)
    }
    #[cfg(not(any(windows, unix)))]
    {
        let _ = pid;
        anyhow::bail!("Unsupported platform")
    }
}
