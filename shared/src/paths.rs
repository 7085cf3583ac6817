//! Filesystem path resolution for config, data and the IPC socket
//!
//! Running as root the daemon uses the system locations under /etc, /var;
//! otherwise everything lives under `~/.pulse`. The socket sits next to
//! the data directory so its filesystem permissions form the trust
//! boundary for the IPC bus.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::Context;

/// Resolved locations for the config file, data directory and socket
#[derive(Debug, Clone, PartialEq)]
pub struct Paths {
    pub config_file: PathBuf,
    pub data_dir: PathBuf,
    pub socket_path: PathBuf,
}

impl Paths {
    /// Resolve the default paths for the current user.
    ///
    /// Root: `/etc/pulse/config.yaml`, `/var/lib/pulse`,
    /// `/var/run/pulse/pulse.sock`. Everyone else:
    /// `~/.pulse/config/config.yaml`, `~/.pulse/data`, `~/.pulse/pulse.sock`.
    pub fn resolve() -> crate::Result<Self> {
        if unsafe { libc::geteuid() } == 0 {
            return Ok(Paths {
                config_file: PathBuf::from("/etc/pulse/config.yaml"),
                data_dir: PathBuf::from("/var/lib/pulse"),
                socket_path: PathBuf::from("/var/run/pulse/pulse.sock"),
            });
        }

        let home = dirs::home_dir().context("failed to resolve home directory")?;
        let base = home.join(".pulse");
        Ok(Paths {
            config_file: base.join("config").join("config.yaml"),
            data_dir: base.join("data"),
            socket_path: base.join("pulse.sock"),
        })
    }

    /// Create every directory these paths need, mode 0755.
    pub fn ensure_directories(&self) -> crate::Result<()> {
        let dirs = [
            self.config_file.parent(),
            Some(self.data_dir.as_path()),
            self.socket_path.parent(),
        ];
        for dir in dirs.into_iter().flatten() {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create directory {}", dir.display()))?;
            fs::set_permissions(dir, fs::Permissions::from_mode(0o755))
                .with_context(|| format!("failed to set permissions on {}", dir.display()))?;
        }
        Ok(())
    }

    pub fn config_exists(&self) -> bool {
        self.config_file.exists()
    }

    pub fn socket_exists(&self) -> bool {
        self.socket_path.exists()
    }

    /// Remove a stale socket file if one exists.
    pub fn remove_socket(&self) -> crate::Result<()> {
        if self.socket_exists() {
            fs::remove_file(&self.socket_path).with_context(|| {
                format!("failed to remove socket {}", self.socket_path.display())
            })?;
        }
        Ok(())
    }

    /// Write a commented sample config if none exists yet.
    ///
    /// Returns true when a new file was created, false when one was
    /// already present.
    pub fn create_default_config(&self) -> crate::Result<bool> {
        if self.config_exists() {
            return Ok(false);
        }

        if let Some(dir) = self.config_file.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create config directory {}", dir.display()))?;
        }

        fs::write(&self.config_file, default_config_contents()).with_context(|| {
            format!("failed to write config file {}", self.config_file.display())
        })?;
        Ok(true)
    }
}

/// Sample configuration written on first start.
fn default_config_contents() -> &'static str {
    r#"# Pulse configuration
# Edit this file to configure your monitoring targets

server:
  address: ":8080"
  enable_tui: true

global:
  interval: 10s
  timeout: 5s
  pings: 10

storage:
  retention: "10s:1d,1m:7d,1h:90d"
  aggregation: average
  xff: 0.5

# Add your monitoring targets below
targets:
  - name: "Google DNS"
    host: "8.8.8.8"
    probe: icmp

  - name: "Cloudflare"
    host: "1.1.1.1"
    probe: icmp

  # Example TCP probe:
  # - name: "Web Server"
  #   host: "example.com"
  #   port: 443
  #   probe: tcp
"#
}

/// Paths rooted at an explicit base directory, used by tests and by the
/// `--config` override (data and socket stay siblings of the config).
pub fn under_base_dir(base: &Path) -> Paths {
    Paths {
        config_file: base.join("config").join("config.yaml"),
        data_dir: base.join("data"),
        socket_path: base.join("pulse.sock"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_ensure_directories_creates_all() {
        let tmp = TempDir::new().unwrap();
        let paths = under_base_dir(tmp.path());

        paths.ensure_directories().unwrap();

        assert!(paths.config_file.parent().unwrap().is_dir());
        assert!(paths.data_dir.is_dir());
        assert!(paths.socket_path.parent().unwrap().is_dir());
    }

    #[test]
    fn test_create_default_config_once() {
        let tmp = TempDir::new().unwrap();
        let paths = under_base_dir(tmp.path());

        assert!(!paths.config_exists());
        assert!(paths.create_default_config().unwrap());
        assert!(paths.config_exists());
        // Second call must not overwrite
        assert!(!paths.create_default_config().unwrap());

        // The sample config must itself be valid
        let cfg = crate::config::Config::load(&paths.config_file).unwrap();
        assert_eq!(cfg.targets.len(), 2);
    }

    #[test]
    fn test_remove_socket_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let paths = under_base_dir(tmp.path());

        // Nothing to remove yet
        paths.remove_socket().unwrap();

        std::fs::write(&paths.socket_path, b"").unwrap();
        assert!(paths.socket_exists());
        paths.remove_socket().unwrap();
        assert!(!paths.socket_exists());
    }
}
