//! Host distribution detection.
//!
//! Reads `os-release`, maps the `ID` through a fixed table to a supported
//! family and the family to a package manager tag. Detection cannot fail:
//! an unreadable or unknown host is simply [`SupportedDistroFamily::Unsupported`].

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SupportedDistroFamily {
    Arch,
    CachyOs,
    Ubuntu,
    Debian,
    Unsupported,
}

impl fmt::Display for SupportedDistroFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SupportedDistroFamily::Arch => write!(f, "arch"),
            SupportedDistroFamily::CachyOs => write!(f, "cachyos"),
            SupportedDistroFamily::Ubuntu => write!(f, "ubuntu"),
            SupportedDistroFamily::Debian => write!(f, "debian"),
            SupportedDistroFamily::Unsupported => write!(f, "unsupported"),
        }
    }
}

/// Distribution IDs we recognize.
const DISTRO_TABLE: &[(&str, SupportedDistroFamily)] = &[
    ("arch", SupportedDistroFamily::Arch),
    ("cachyos", SupportedDistroFamily::CachyOs),
    ("ubuntu", SupportedDistroFamily::Ubuntu),
    ("debian", SupportedDistroFamily::Debian),
];

/// Package manager tag per family.
const PACKAGE_MANAGER_TABLE: &[(SupportedDistroFamily, &str)] = &[
    (SupportedDistroFamily::Arch, "pacman"),
    (SupportedDistroFamily::CachyOs, "pacman"),
    (SupportedDistroFamily::Ubuntu, "apt"),
    (SupportedDistroFamily::Debian, "apt"),
];

pub fn family_for(distro_id: &str) -> SupportedDistroFamily {
    let id = distro_id.trim().to_ascii_lowercase();
    DISTRO_TABLE
        .iter()
        .find(|(known, _)| *known == id)
        .map(|(_, family)| *family)
        .unwrap_or(SupportedDistroFamily::Unsupported)
}

pub fn package_manager_for(family: SupportedDistroFamily) -> &'static str {
    PACKAGE_MANAGER_TABLE
        .iter()
        .find(|(f, _)| *f == family)
        .map(|(_, pm)| *pm)
        .unwrap_or("unknown")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DistroInfo {
    pub distro_id: String,
    pub name: String,
    pub version: String,
    pub codename: String,
    pub family: SupportedDistroFamily,
    pub package_manager: String,
}

impl DistroInfo {
    pub fn from_os_release(text: &str) -> Self {
        let fields = parse_os_release(text);
        let get = |key: &str| fields.get(key).cloned().unwrap_or_default();

        let distro_id = get("ID").to_ascii_lowercase();
        let family = family_for(&distro_id);
        let name = fields
            .get("NAME")
            .cloned()
            .unwrap_or_else(|| distro_id.clone());
        Self {
            name,
            version: get("VERSION_ID"),
            codename: get("VERSION_CODENAME"),
            package_manager: package_manager_for(family).to_string(),
            family,
            distro_id,
        }
    }

    pub fn is_supported(&self) -> bool {
        self.family != SupportedDistroFamily::Unsupported
    }

    pub fn display_name(&self) -> String {
        if self.version.is_empty() {
            self.name.clone()
        } else {
            format!("{} {}", self.name, self.version)
        }
    }
}

/// Parse `KEY=value` lines, unquoting values. Comments and junk are skipped.
pub fn parse_os_release(text: &str) -> HashMap<String, String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| {
            let value = value.trim();
            let unquoted = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
                .unwrap_or(value);
            (key.trim().to_string(), unquoted.to_string())
        })
        .collect()
}

pub struct DistroDetector {
    os_release: PathBuf,
}

impl Default for DistroDetector {
    fn default() -> Self {
        Self::new(Path::new("/etc/os-release"))
    }
}

impl DistroDetector {
    pub fn new(os_release: &Path) -> Self {
        Self {
            os_release: os_release.to_path_buf(),
        }
    }

    pub fn detect(&self) -> DistroInfo {
        let text = match fs::read_to_string(&self.os_release) {
            Ok(text) => text,
            Err(e) => {
                debug!("cannot read {}: {e}", self.os_release.display());
                String::new()
            }
        };
        let info = DistroInfo::from_os_release(&text);
        info!(
            distro = %info.distro_id,
            family = %info.family,
            package_manager = %info.package_manager,
            "detected distribution"
        );
        info
    }
}
