//! Best-effort `WM_SETTINGCHANGE("Environment")` broadcast.
//!
//! New terminals read the user PATH from the registry, but already-running
//! shells only refresh on this message. The send is bounded: a hung
//! top-level window cannot stall PATH registration beyond the timeout.

use anyhow::Result;

#[cfg(windows)]
pub fn notify_environment_change() -> Result<()> {
    use windows::Win32::Foundation::{LPARAM, WPARAM};
    use windows::Win32::UI::WindowsAndMessaging::{
        SendMessageTimeoutW, HWND_BROADCAST, SMTO_ABORTIFHUNG, WM_SETTINGCHANGE,
    };

    const BROADCAST_TIMEOUT_MS: u32 = 5000;

    let section: Vec<u16> = "Environment".encode_utf16().chain(std::iter::once(0)).collect();
    let mut result: usize = 0;

    let sent = unsafe {
        SendMessageTimeoutW(
            HWND_BROADCAST,
            WM_SETTINGCHANGE,
            WPARAM(0),
            LPARAM(section.as_ptr() as isize),
            SMTO_ABORTIFHUNG,
            BROADCAST_TIMEOUT_MS,
            Some(&mut result as *mut usize),
        )
    };

    if sent.0 != 0 {
        return Ok(());
    }
    let last = windows::core::Error::from_win32();
    if last.code().is_ok() {
        anyhow::bail!("SendMessageTimeoutW returned 0 without extended error");
    }
    Err(anyhow::Error::new(last).context("broadcasting WM_SETTINGCHANGE"))
}

#[cfg(not(windows))]
pub fn notify_environment_change() -> Result<()> {
    Ok(())
}
