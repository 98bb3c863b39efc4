//! Host locations and tool settings.
//!
//! [`HostPaths`] names every file and directory the workflow reads or
//! mutates. The defaults are the real locations on an Arch-family host;
//! [`HostPaths::rooted`] moves all of them under a prefix so the whole
//! workflow can run against a scratch tree.
//!
//! [`Settings`] is the tool's own configuration, read from
//! `$XDG_CONFIG_HOME/lintune/config.toml`. Every field has a default, so a
//! missing file is the same as an empty one.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::privilege::ElevationMode;

/// Suffix of the pre-mutation copy kept next to every edited system file.
pub const BACKUP_SUFFIX: &str = ".backup";

pub const DEFAULT_REPO_URL: &str = "https://github.com/himmelblau-idm/himmelblau";

/// Canonical names of the packages needed to build the identity daemon.
pub const DEFAULT_DEPENDENCIES: &[&str] = &[
    "rust",
    "cargo",
    "pkg-config",
    "openssl",
    "sqlite",
    "dbus",
    "tpm2-tss",
    "git",
    "base-devel",
];

/// Build artifacts and where each one is installed.
pub const BINARY_DESTINATIONS: &[(&str, &str)] = &[
    ("himmelblaud", "/usr/sbin/himmelblaud"),
    ("himmelblaud_tasks", "/usr/sbin/himmelblaud_tasks"),
    ("aad-tool", "/usr/bin/aad-tool"),
    ("broker", "/usr/sbin/broker"),
    ("linux-entra-sso", "/usr/bin/linux-entra-sso"),
    ("libpam_himmelblau.so", "/usr/lib/security/pam_himmelblau.so"),
    ("libnss_himmelblau.so", "/usr/lib/libnss_himmelblau.so.2"),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPaths {
    pub os_release: PathBuf,
    pub nsswitch: PathBuf,
    pub pam_system_auth: PathBuf,
    /// Debian-family equivalent of `pam_system_auth`.
    pub pam_common_auth: PathBuf,
    pub identity_conf_dir: PathBuf,
    pub identity_conf: PathBuf,
    pub systemd_dir: PathBuf,
    pub dbus_services_dir: PathBuf,
    /// Parent of the daemon's cache directories; must stay traversable.
    pub cache_root: PathBuf,
    pub cache_dirs: Vec<PathBuf>,
    pub build_dir: PathBuf,
    pub services_scratch_dir: PathBuf,
    /// Where files copied into place with elevation are staged. Each write
    /// gets its own exclusively created file here, so this should be a
    /// sticky directory like `/tmp`.
    pub staging_dir: PathBuf,
    /// `(artifact name, absolute destination)` pairs.
    pub binaries: Vec<(String, PathBuf)>,
}

impl Default for HostPaths {
    fn default() -> Self {
        Self {
            os_release: PathBuf::from("/etc/os-release"),
            nsswitch: PathBuf::from("/etc/nsswitch.conf"),
            pam_system_auth: PathBuf::from("/etc/pam.d/system-auth"),
            pam_common_auth: PathBuf::from("/etc/pam.d/common-auth"),
            identity_conf_dir: PathBuf::from("/etc/himmelblau"),
            identity_conf: PathBuf::from("/etc/himmelblau/himmelblau.conf"),
            systemd_dir: PathBuf::from("/etc/systemd/system"),
            dbus_services_dir: PathBuf::from("/usr/share/dbus-1/services"),
            cache_root: PathBuf::from("/var/cache"),
            cache_dirs: vec![
                PathBuf::from("/var/cache/nss-himmelblau"),
                PathBuf::from("/var/cache/himmelblau-policies"),
                PathBuf::from("/etc/krb5.conf.d"),
            ],
            build_dir: PathBuf::from("/tmp/himmelblau"),
            services_scratch_dir: PathBuf::from("/tmp/himmelblau-services"),
            staging_dir: PathBuf::from("/tmp"),
            binaries: BINARY_DESTINATIONS
                .iter()
                .map(|(name, dest)| (name.to_string(), PathBuf::from(dest)))
                .collect(),
        }
    }
}

impl HostPaths {
    /// Every default path re-anchored under `root`.
    pub fn rooted(root: &Path) -> Self {
        let under = |p: &Path| root.join(p.strip_prefix("/").unwrap_or(p));
        let d = Self::default();
        Self {
            os_release: under(&d.os_release),
            nsswitch: under(&d.nsswitch),
            pam_system_auth: under(&d.pam_system_auth),
            pam_common_auth: under(&d.pam_common_auth),
            identity_conf_dir: under(&d.identity_conf_dir),
            identity_conf: under(&d.identity_conf),
            systemd_dir: under(&d.systemd_dir),
            dbus_services_dir: under(&d.dbus_services_dir),
            cache_root: under(&d.cache_root),
            cache_dirs: d.cache_dirs.iter().map(|p| under(p)).collect(),
            build_dir: under(&d.build_dir),
            services_scratch_dir: under(&d.services_scratch_dir),
            staging_dir: under(&d.staging_dir),
            binaries: d
                .binaries
                .iter()
                .map(|(name, dest)| (name.clone(), under(dest)))
                .collect(),
        }
    }

    pub fn backup_of(path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_os_string();
        name.push(BACKUP_SUFFIX);
        PathBuf::from(name)
    }

    /// The PAM stack this host actually uses.
    pub fn active_pam(&self) -> &Path {
        if !self.pam_system_auth.exists() && self.pam_common_auth.exists() {
            &self.pam_common_auth
        } else {
            &self.pam_system_auth
        }
    }

    pub fn daemon_binary(&self) -> PathBuf {
        self.binary("himmelblaud")
            .unwrap_or_else(|| PathBuf::from("/usr/sbin/himmelblaud"))
    }

    pub fn binary(&self, name: &str) -> Option<PathBuf> {
        self.binaries
            .iter()
            .find(|(artifact, _)| artifact == name)
            .map(|(_, dest)| dest.clone())
    }

    pub fn unit_file(&self, unit: &str) -> PathBuf {
        self.systemd_dir.join(unit)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub repo_url: String,
    pub elevation: ElevationMode,
    pub dependencies: Vec<String>,
    pub journal_lines: u32,
    /// Stop a composed install after the system check when the host is
    /// already fully configured.
    pub skip_when_configured: bool,
    pub clone_timeout_secs: u64,
    pub build_timeout_secs: u64,
    pub install_timeout_secs: u64,
    pub query_timeout_secs: u64,
    pub remove_timeout_secs: u64,
    pub service_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            repo_url: DEFAULT_REPO_URL.to_string(),
            elevation: ElevationMode::Sudo,
            dependencies: DEFAULT_DEPENDENCIES.iter().map(|d| d.to_string()).collect(),
            journal_lines: 500,
            skip_when_configured: true,
            clone_timeout_secs: 300,
            build_timeout_secs: 600,
            install_timeout_secs: 600,
            query_timeout_secs: 5,
            remove_timeout_secs: 300,
            service_timeout_secs: 30,
        }
    }
}

impl Settings {
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("lintune").join("config.toml"))
    }

    /// Load from the default location; defaults when there is no file.
    pub fn load() -> Result<Self> {
        match Self::default_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading settings '{}'", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing settings '{}'", path.display()))
    }

    pub fn clone_timeout(&self) -> Duration {
        Duration::from_secs(self.clone_timeout_secs)
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs)
    }

    pub fn service_timeout(&self) -> Duration {
        Duration::from_secs(self.service_timeout_secs)
    }
}
