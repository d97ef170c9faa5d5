use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, Result};
use crate::resolver::{ExecutableResolver, OsFamily};

/// Release artifact per OS family
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReleaseUrls {
    pub windows: String,
    pub macos: String,
    pub linux: String,
}

impl Default for ReleaseUrls {
    fn default() -> Self {
        Self {
            windows: "https://github.com/yt-dlp/yt-dlp/releases/latest/download/yt-dlp.exe".to_string(),
            macos: "https://github.com/yt-dlp/yt-dlp/releases/latest/download/yt-dlp_macos".to_string(),
            linux: "https://github.com/yt-dlp/yt-dlp/releases/latest/download/yt-dlp".to_string(),
        }
    }
}

impl ReleaseUrls {
    pub fn for_os(&self, os: OsFamily) -> &str {
        match os {
            OsFamily::Windows => &self.windows,
            OsFamily::Macos => &self.macos,
            OsFamily::Linux => &self.linux,
        }
    }
}

/// Recognises a self-update refusal caused by the tool having been
/// installed through a package manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PackageManagerSignal {
    /// Exit code that must match, if set
    pub exit_code: Option<i32>,
    /// Case-insensitive text one output line must contain
    pub output_marker: String,
}

impl Default for PackageManagerSignal {
    fn default() -> Self {
        Self {
            exit_code: None,
            output_marker: "installed yt-dlp with pip".to_string(),
        }
    }
}

impl PackageManagerSignal {
    pub fn matches(&self, exit_code: i32, output: &[String]) -> bool {
        if exit_code == 0 || self.exit_code.is_some_and(|expected| expected != exit_code) {
            return false;
        }
        let marker = self.output_marker.to_lowercase();
        if marker.is_empty() {
            return self.exit_code.is_some();
        }
        output.iter().any(|line| line.to_lowercase().contains(&marker))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Logical tool name; the platform suffix is added by the resolver
    pub tool_name: String,
    /// Checked before the search path, and where provisioned binaries land
    pub local_dir: PathBuf,
    /// Overrides `PATH` for executable lookup
    pub search_path: Option<String>,
    pub os: OsFamily,
    /// How long a cancelled process gets to exit before it is killed
    pub grace_period_ms: u64,
    pub release_urls: ReleaseUrls,
    pub self_update_args: Vec<String>,
    /// Program followed by its arguments
    pub package_manager_update: Vec<String>,
    pub package_manager_signal: PackageManagerSignal,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        let python = if cfg!(target_os = "windows") { "py" } else { "python3" };
        Self {
            tool_name: "yt-dlp".to_string(),
            local_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            search_path: None,
            os: OsFamily::current(),
            grace_period_ms: 3_000,
            release_urls: ReleaseUrls::default(),
            self_update_args: vec!["-U".to_string()],
            package_manager_update: [python, "-m", "pip", "install", "-U", "yt-dlp"]
                .into_iter()
                .map(String::from)
                .collect(),
            package_manager_signal: PackageManagerSignal::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Reads a JSON config file; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let bytes = std::fs::read(path)?;
        let config: Self = serde_json::from_slice(&bytes).map_err(|e| {
            OrchestratorError::Config(format!(
                "failed to parse {}: {e}",
                path.to_string_lossy()
            ))
        })?;
        config.check()?;
        Ok(config)
    }

    fn check(&self) -> Result<()> {
        if self.tool_name.trim().is_empty() {
            return Err(OrchestratorError::Config("tool_name is empty".to_string()));
        }
        if self.package_manager_update.is_empty() {
            return Err(OrchestratorError::Config(
                "package_manager_update needs at least a program".to_string(),
            ));
        }
        Ok(())
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn release_url(&self) -> &str {
        self.release_urls.for_os(self.os)
    }

    pub fn resolver(&self) -> ExecutableResolver {
        let resolver = ExecutableResolver::new(&self.local_dir, self.os);
        match &self.search_path {
            Some(path) => resolver.with_search_path(path),
            None => resolver,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn default_signal_matches_pip_refusal() {
        let signal = PackageManagerSignal::default();
        let output = lines(&[
            "Current version: 2024.01.01",
            "ERROR: You installed yt-dlp with pip or using the wheel from PyPi; Use that to update",
        ]);
        assert!(signal.matches(1, &output));
    }

    #[test]
    fn signal_never_matches_success_or_unrelated_failure() {
        let signal = PackageManagerSignal::default();
        let refusal = lines(&["You installed yt-dlp with pip"]);
        assert!(!signal.matches(0, &refusal));
        assert!(!signal.matches(1, &lines(&["ERROR: Unable to connect"])));
    }

    #[test]
    fn signal_exit_code_must_agree_when_configured() {
        let signal = PackageManagerSignal {
            exit_code: Some(100),
            ..PackageManagerSignal::default()
        };
        let refusal = lines(&["You installed yt-dlp with pip"]);
        assert!(!signal.matches(1, &refusal));
        assert!(signal.matches(100, &refusal));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = OrchestratorConfig::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config.tool_name, "yt-dlp");
        assert_eq!(config.grace_period(), Duration::from_secs(3));
        assert_eq!(config.self_update_args, vec!["-U".to_string()]);
    }

    #[test]
    fn partial_file_overrides_only_given_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ytdlp-gui.json");
        std::fs::write(
            &path,
            r#"{ "grace_period_ms": 500, "os": "windows", "package_manager_signal": { "exit_code": 100 } }"#,
        )
        .unwrap();

        let config = OrchestratorConfig::load(&path).unwrap();
        assert_eq!(config.grace_period(), Duration::from_millis(500));
        assert_eq!(config.os, OsFamily::Windows);
        assert!(config.release_url().ends_with("yt-dlp.exe"));
        assert_eq!(config.package_manager_signal.exit_code, Some(100));
        assert_eq!(
            config.package_manager_signal.output_marker,
            "installed yt-dlp with pip"
        );
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ytdlp-gui.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            OrchestratorConfig::load(&path),
            Err(OrchestratorError::Config(_))
        ));
    }

    #[test]
    fn empty_package_manager_command_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ytdlp-gui.json");
        std::fs::write(&path, r#"{ "package_manager_update": [] }"#).unwrap();
        assert!(OrchestratorConfig::load(&path).is_err());
    }
}
