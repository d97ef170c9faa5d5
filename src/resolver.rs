use std::ffi::OsString;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Host operating system family, as far as binary naming and release
/// artifacts are concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsFamily {
    Windows,
    Macos,
    Linux,
}

impl OsFamily {
    pub fn current() -> Self {
        if cfg!(target_os = "windows") {
            OsFamily::Windows
        } else if cfg!(target_os = "macos") {
            OsFamily::Macos
        } else {
            OsFamily::Linux
        }
    }

    /// File name of `tool` on this platform.
    pub fn executable_name(self, tool: &str) -> String {
        match self {
            OsFamily::Windows => format!("{tool}.exe"),
            OsFamily::Macos | OsFamily::Linux => tool.to_string(),
        }
    }
}

impl Default for OsFamily {
    fn default() -> Self {
        Self::current()
    }
}

/// Finds a runnable tool binary.
///
/// The local directory always wins over the search path so an operator can
/// pin a specific version by dropping a binary next to the application.
#[derive(Debug, Clone)]
pub struct ExecutableResolver {
    local_dir: PathBuf,
    search_path: Option<OsString>,
    os: OsFamily,
}

impl ExecutableResolver {
    pub fn new(local_dir: impl Into<PathBuf>, os: OsFamily) -> Self {
        Self {
            local_dir: local_dir.into(),
            search_path: None,
            os,
        }
    }

    /// Replaces the `PATH` value consulted after the local directory.
    pub fn with_search_path(mut self, search_path: impl Into<OsString>) -> Self {
        self.search_path = Some(search_path.into());
        self
    }

    /// Where a locally provisioned copy of `tool` lives.
    pub fn local_target(&self, tool: &str) -> PathBuf {
        self.local_dir.join(self.os.executable_name(tool))
    }

    /// `None` means the tool is absent and needs provisioning. A local file
    /// without execute permission does not count and does not shadow the
    /// search path.
    pub fn resolve(&self, tool: &str) -> Option<PathBuf> {
        let file_name = self.os.executable_name(tool);
        if let Ok(local) = which::which_in(&file_name, Some(&self.local_dir), &self.local_dir) {
            tracing::debug!(path = %local.display(), "using local executable");
            return Some(local);
        }
        let local = self.local_target(tool);
        if local.is_file() {
            tracing::warn!(path = %local.display(), "ignoring local file that is not executable");
        }

        let search_path = self
            .search_path
            .clone()
            .or_else(|| std::env::var_os("PATH"));
        match which::which_in(&file_name, search_path, &self.local_dir) {
            Ok(path) => {
                tracing::debug!(path = %path.display(), "using executable from search path");
                Some(path)
            }
            Err(_) => {
                tracing::info!(tool = %file_name, "executable not found");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn windows_binaries_get_exe_suffix() {
        assert_eq!(OsFamily::Windows.executable_name("yt-dlp"), "yt-dlp.exe");
        assert_eq!(OsFamily::Linux.executable_name("yt-dlp"), "yt-dlp");
        assert_eq!(OsFamily::Macos.executable_name("yt-dlp"), "yt-dlp");
    }

    #[test]
    fn absent_everywhere_resolves_to_none() {
        let local = tempfile::tempdir().unwrap();
        let elsewhere = tempfile::tempdir().unwrap();
        let resolver = ExecutableResolver::new(local.path(), OsFamily::current())
            .with_search_path(elsewhere.path().as_os_str());
        assert_eq!(resolver.resolve("yt-dlp"), None);
    }

    #[test]
    fn local_target_uses_platform_name() {
        let resolver = ExecutableResolver::new("/opt/app", OsFamily::Windows);
        assert_eq!(
            resolver.local_target("yt-dlp"),
            PathBuf::from("/opt/app").join("yt-dlp.exe")
        );
    }

    #[cfg(unix)]
    fn install_fake(dir: &Path, name: &str) -> PathBuf {
        install_with_mode(dir, name, 0o755)
    }

    #[cfg(unix)]
    fn install_with_mode(dir: &Path, name: &str, mode: u32) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join(name);
        std::fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).unwrap();
        path
    }

    #[cfg(unix)]
    #[test]
    fn local_binary_wins_over_search_path() {
        let local = tempfile::tempdir().unwrap();
        let system = tempfile::tempdir().unwrap();
        let local_bin = install_fake(local.path(), "yt-dlp");
        install_fake(system.path(), "yt-dlp");

        let resolver = ExecutableResolver::new(local.path(), OsFamily::Linux)
            .with_search_path(system.path().as_os_str());
        assert_eq!(resolver.resolve("yt-dlp"), Some(local_bin));
    }

    #[cfg(unix)]
    #[test]
    fn falls_back_to_search_path() {
        let local = tempfile::tempdir().unwrap();
        let system = tempfile::tempdir().unwrap();
        let system_bin = install_fake(system.path(), "yt-dlp");

        let resolver = ExecutableResolver::new(local.path(), OsFamily::Linux)
            .with_search_path(system.path().as_os_str());
        assert_eq!(resolver.resolve("yt-dlp"), Some(system_bin));
    }

    #[cfg(unix)]
    #[test]
    fn non_executable_local_file_does_not_shadow_search_path() {
        let local = tempfile::tempdir().unwrap();
        let system = tempfile::tempdir().unwrap();
        install_with_mode(local.path(), "yt-dlp", 0o644);
        let system_bin = install_fake(system.path(), "yt-dlp");

        let resolver = ExecutableResolver::new(local.path(), OsFamily::Linux)
            .with_search_path(system.path().as_os_str());
        assert_eq!(resolver.resolve("yt-dlp"), Some(system_bin));
    }

    #[cfg(unix)]
    #[test]
    fn non_executable_local_file_alone_is_absent() {
        let local = tempfile::tempdir().unwrap();
        let elsewhere = tempfile::tempdir().unwrap();
        install_with_mode(local.path(), "yt-dlp", 0o644);

        let resolver = ExecutableResolver::new(local.path(), OsFamily::Linux)
            .with_search_path(elsewhere.path().as_os_str());
        assert_eq!(resolver.resolve("yt-dlp"), None);
    }
}
