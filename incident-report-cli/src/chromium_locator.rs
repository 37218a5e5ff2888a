//! Chromium Locator - find a headless-capable browser for the chromium engine
//!
//! Lookup order: explicit `--chromium-path`, `CHROME_PATH`, a binary placed
//! in the user's data directory, then well-known install locations and `PATH`.
//! Nothing is downloaded.

use anyhow::{anyhow, Result};
use std::path::{Path, PathBuf};

/// Environment variable consulted before any well-known location
pub const CHROME_PATH_ENV: &str = "CHROME_PATH";

#[cfg(target_os = "macos")]
const WELL_KNOWN_PATHS: &[&str] = &[
    "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
    "/Applications/Chromium.app/Contents/MacOS/Chromium",
    "/Applications/Microsoft Edge.app/Contents/MacOS/Microsoft Edge",
];

#[cfg(windows)]
const WELL_KNOWN_PATHS: &[&str] = &[
    r"C:\Program Files\Google\Chrome\Application\chrome.exe",
    r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
    r"C:\Program Files (x86)\Microsoft\Edge\Application\msedge.exe",
];

#[cfg(not(any(target_os = "macos", windows)))]
const WELL_KNOWN_PATHS: &[&str] = &[
    "/usr/bin/chromium",
    "/usr/bin/chromium-browser",
    "/usr/bin/google-chrome",
    "/usr/bin/google-chrome-stable",
    "/snap/bin/chromium",
    "/opt/google/chrome/chrome",
];

/// Executable names searched on `PATH`
const PATH_NAMES: &[&str] = &["chromium", "chromium-browser", "google-chrome", "google-chrome-stable", "chrome"];

pub struct ChromiumLocator {
    /// Per-user data directory (e.g., ~/.local/share/incident-report)
    data_dir: Option<PathBuf>,
}

impl Default for ChromiumLocator {
    fn default() -> Self {
        Self::new()
    }
}

impl ChromiumLocator {
    pub fn new() -> Self {
        Self {
            data_dir: Self::get_data_dir(),
        }
    }

    /// Locator with an explicit data directory
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: Some(data_dir.into()),
        }
    }

    fn get_data_dir() -> Option<PathBuf> {
        #[cfg(windows)]
        {
            dirs::data_local_dir().map(|base| base.join("incident-report"))
        }

        #[cfg(not(windows))]
        {
            dirs::home_dir().map(|home| home.join(".local").join("share").join("incident-report"))
        }
    }

    /// Where a user-provided browser binary may be placed
    pub fn data_dir_binary(&self) -> Option<PathBuf> {
        let name = if cfg!(windows) { "chrome.exe" } else { "chromium" };
        self.data_dir.as_ref().map(|dir| dir.join("chromium").join(name))
    }

    /// Resolve the browser binary. An explicit path must exist; every other
    /// source is skipped when it does not.
    pub fn locate(&self, explicit: Option<&str>) -> Result<PathBuf> {
        if let Some(path) = explicit {
            let path = PathBuf::from(path);
            if !path.exists() {
                return Err(anyhow!("Chromium not found at --chromium-path {}", path.display()));
            }
            println!("🔧 Using specified Chromium: {}", path.display());
            return Ok(path);
        }

        if let Some(path) = std::env::var_os(CHROME_PATH_ENV).filter(|p| !p.is_empty()) {
            let path = PathBuf::from(path);
            if path.exists() {
                println!("🔧 Using {}: {}", CHROME_PATH_ENV, path.display());
                return Ok(path);
            }
            log::warn!("⚠️  {} points at {}, which does not exist", CHROME_PATH_ENV, path.display());
        }

        let candidates = self
            .data_dir_binary()
            .into_iter()
            .chain(WELL_KNOWN_PATHS.iter().map(PathBuf::from))
            .chain(PATH_NAMES.iter().filter_map(|name| which_in_path(name)));

        for candidate in candidates {
            if candidate.exists() {
                println!("🔧 Using Chromium: {}", candidate.display());
                return Ok(candidate);
            }
        }

        Err(anyhow!(
            "Could not find a Chromium binary.\n\
             Searched in:\n\
             - --chromium-path\n\
             - ${CHROME_PATH_ENV}\n\
             - {}\n\
             - Well-known install locations\n\
             - PATH ({})\n\
             Or set render.engine: builtin in the config",
            self.data_dir_binary()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "<no data directory>".to_string()),
            PATH_NAMES.join(", ")
        ))
    }
}

fn which_in_path(bin: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(bin))
        .find(|candidate| is_file(candidate))
}

fn is_file(path: &Path) -> bool {
    path.metadata().map(|m| m.is_file()).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_path_must_exist() {
        let locator = ChromiumLocator::with_data_dir("/nonexistent");
        assert!(locator.locate(Some("/nonexistent/chromium")).is_err());
    }

    #[test]
    fn test_explicit_path_wins() {
        let temp_dir = tempfile::tempdir().unwrap();
        let binary = temp_dir.path().join("my-chrome");
        std::fs::write(&binary, b"").unwrap();

        let locator = ChromiumLocator::with_data_dir(temp_dir.path());
        let found = locator.locate(binary.to_str()).unwrap();
        assert_eq!(found, binary);
    }

    #[test]
    fn test_data_dir_binary_is_found() {
        let temp_dir = tempfile::tempdir().unwrap();
        let locator = ChromiumLocator::with_data_dir(temp_dir.path());
        let binary = locator.data_dir_binary().unwrap();
        std::fs::create_dir_all(binary.parent().unwrap()).unwrap();
        std::fs::write(&binary, b"").unwrap();

        // CHROME_PATH from the environment takes precedence when it exists
        if std::env::var_os(CHROME_PATH_ENV).is_none() {
            assert_eq!(locator.locate(None).unwrap(), binary);
        }
    }
}
