//! Windows process signalling

use anyhow::{Context, Result};
use tracing::{debug, info};

use windows::Win32::Foundation::{CloseHandle, BOOL, FALSE, HWND, LPARAM, WPARAM};
use windows::Win32::System::Threading::*;
use windows::Win32::UI::WindowsAndMessaging::*;

use super::Delivery;

/// STILL_ACTIVE exit code
const STILL_ACTIVE: u32 = 259;

/// Ask a process to close by posting WM_CLOSE to its top-level windows
pub fn terminate_process(pid: u32) -> Result<Delivery> {
    if !is_process_running(pid) {
        return Ok(Delivery::Gone);
    }

    unsafe {
        let mut windows_to_close: Vec<HWND> = Vec::new();
        let callback_data = &mut windows_to_close as *mut Vec<HWND>;

        unsafe extern "system" fn enum_callback(hwnd: HWND, lparam: LPARAM) -> BOOL {
            let windows = &mut *(lparam.0 as *mut Vec<HWND>);
            windows.push(hwnd);
            BOOL::from(true)
        }

        let _ = EnumWindows(Some(enum_callback), LPARAM(callback_data as isize));

        let mut closed_count = 0;
        for hwnd in windows_to_close {
            let mut window_pid: u32 = 0;
            GetWindowThreadProcessId(hwnd, Some(&mut window_pid));

            if window_pid == pid && PostMessageW(hwnd, WM_CLOSE, WPARAM(0), LPARAM(0)).is_ok() {
                closed_count += 1;
            }
        }

        if closed_count > 0 {
            info!("Posted WM_CLOSE to {} window(s) of PID {}", closed_count, pid);
        } else {
            // Tray-only processes have no top-level window; the caller falls back to kill
            debug!("No top-level windows found for PID {}", pid);
        }
    }

    Ok(Delivery::Sent)
}

/// Force kill a process
pub fn kill_process(pid: u32) -> Result<Delivery> {
    unsafe {
        let handle = match OpenProcess(PROCESS_TERMINATE, FALSE, pid) {
            Ok(h) => h,
            Err(e) => {
                if !is_process_running(pid) {
                    return Ok(Delivery::Gone);
                }
                return Err(e).context("Failed to open process");
            }
        };

        let result = TerminateProcess(handle, 1);
        CloseHandle(handle)?;

        if result.is_ok() {
            Ok(Delivery::Sent)
        } else if !is_process_running(pid) {
            Ok(Delivery::Gone)
        } else {
            anyhow::bail!("Failed to kill process {}", pid)
        }
    }
}

/// Check if a process is running
pub fn is_process_running(pid: u32) -> bool {
    unsafe {
        let handle = match OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, FALSE, pid) {
            Ok(h) => h,
            Err(_) => return false,
        };

        let mut exit_code: u32 = 0;
        let result = GetExitCodeProcess(handle, &mut exit_code);
        CloseHandle(handle).ok();

        result.is_ok() && exit_code == STILL_ACTIVE
    }
}
