//! `%LOCALAPPDATA%\myT-x` layout shared by the shim, the host and the
//! installer.
//!
//! All helpers consult the environment on every call so tests can point the
//! tree at a temp directory. An empty `LOCALAPPDATA` is an error here;
//! callers that can degrade (the debug log) catch it and fall back.

use std::path::PathBuf;

use anyhow::{bail, Result};

pub const APP_DIR_NAME: &str = "myT-x";
pub const BIN_SUBDIR: &str = "bin";
pub const SHIM_FILE_NAME: &str = "tmux.exe";
pub const SHIM_HASH_SUFFIX: &str = ".sha256";
pub const DEBUG_LOG_FILE_NAME: &str = "shim-debug.log";
pub const CONFIG_FILE_NAME: &str = "config.yaml";

/// `%LOCALAPPDATA%\myT-x`.
pub fn app_data_dir() -> Result<PathBuf> {
    Ok(local_app_data()?.join(APP_DIR_NAME))
}

/// `%APPDATA%\myT-x`, the roaming fallback used only by the config loader.
pub fn roaming_app_data_dir() -> Result<PathBuf> {
    let raw = std::env::var("APPDATA").unwrap_or_default();
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        bail!("APPDATA is not set");
    }
    Ok(PathBuf::from(trimmed).join(APP_DIR_NAME))
}

/// Install directory for the shim binary.
pub fn bin_dir() -> Result<PathBuf> {
    Ok(app_data_dir()?.join(BIN_SUBDIR))
}

/// Installed shim target, `…\bin\tmux.exe`.
pub fn shim_target() -> Result<PathBuf> {
    Ok(bin_dir()?.join(SHIM_FILE_NAME))
}

/// Hash sidecar next to the installed shim, `…\bin\tmux.exe.sha256`.
pub fn shim_hash_sidecar() -> Result<PathBuf> {
    Ok(bin_dir()?.join(format!("{SHIM_FILE_NAME}{SHIM_HASH_SUFFIX}")))
}

/// Active debug log. No roaming fallback: when `LOCALAPPDATA` is empty the
/// shim logs to stderr instead.
pub fn debug_log_path() -> Result<PathBuf> {
    Ok(app_data_dir()?.join(DEBUG_LOG_FILE_NAME))
}

/// Primary config location.
pub fn config_file() -> Result<PathBuf> {
    Ok(app_data_dir()?.join(CONFIG_FILE_NAME))
}

/// Roaming config fallback, consulted when `LOCALAPPDATA` is empty.
pub fn config_file_fallback() -> Result<PathBuf> {
    Ok(roaming_app_data_dir()?.join(CONFIG_FILE_NAME))
}

fn local_app_data() -> Result<PathBuf> {
    let raw = std::env::var("LOCALAPPDATA").unwrap_or_default();
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        bail!("LOCALAPPDATA is not set");
    }
    Ok(PathBuf::from(trimmed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn tree_hangs_off_localappdata() {
        let temp = tempfile::tempdir().unwrap();
        std::env::set_var("LOCALAPPDATA", temp.path());

        let app = app_data_dir().unwrap();
        assert_eq!(app, temp.path().join(APP_DIR_NAME));
        assert_eq!(bin_dir().unwrap(), app.join(BIN_SUBDIR));
        assert_eq!(shim_target().unwrap(), app.join(BIN_SUBDIR).join(SHIM_FILE_NAME));
        assert_eq!(
            shim_hash_sidecar().unwrap(),
            app.join(BIN_SUBDIR).join("tmux.exe.sha256")
        );
        assert_eq!(debug_log_path().unwrap(), app.join(DEBUG_LOG_FILE_NAME));
        assert_eq!(config_file().unwrap(), app.join(CONFIG_FILE_NAME));
    }

    #[test]
    #[serial]
    fn empty_localappdata_is_an_error() {
        std::env::set_var("LOCALAPPDATA", "  ");
        assert!(app_data_dir().is_err());
        assert!(debug_log_path().is_err());
        std::env::remove_var("LOCALAPPDATA");
        assert!(bin_dir().is_err());
    }

    #[test]
    #[serial]
    fn config_fallback_uses_appdata() {
        let temp = tempfile::tempdir().unwrap();
        std::env::set_var("APPDATA", temp.path());
        assert_eq!(
            config_file_fallback().unwrap(),
            temp.path().join(APP_DIR_NAME).join(CONFIG_FILE_NAME)
        );
        std::env::remove_var("APPDATA");
        assert!(config_file_fallback().is_err());
    }
}
