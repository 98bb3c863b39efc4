//! OS package management.
//!
//! One [`PackageManager`] implementation per package-tool family. Every
//! operation converts tool failures and timeouts into plain results; nothing
//! here returns an error across the trait boundary.
//!
//! Installs are batched and all-or-nothing: a non-zero exit marks the whole
//! request as failed, with no per-package accounting.

mod pacman;

use std::sync::Arc;

use serde::Serialize;

use crate::config::{Settings, DEFAULT_DEPENDENCIES};
use crate::distro::SupportedDistroFamily;
use crate::privilege::PrivilegeSession;

pub use pacman::Pacman;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PackageInstallResult {
    pub success: bool,
    pub packages_installed: Vec<String>,
    pub packages_failed: Vec<String>,
    pub stdout: String,
    pub stderr: String,
}

impl PackageInstallResult {
    /// Result of an empty request.
    pub fn nothing_to_do() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    /// Whole batch failed with `reason`.
    pub fn batch_failed(packages: &[String], stdout: String, reason: impl Into<String>) -> Self {
        Self {
            success: false,
            packages_installed: Vec::new(),
            packages_failed: packages.to_vec(),
            stdout,
            stderr: reason.into(),
        }
    }

    /// First line of stderr, for progress messages.
    pub fn summary(&self) -> String {
        self.stderr
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .unwrap_or("package installation failed")
            .to_string()
    }
}

pub trait PackageManager: Send + Sync {
    fn name(&self) -> &'static str;

    /// Refresh the package database.
    fn update_repos(&self) -> bool;

    /// Install `packages`. An empty list succeeds without running anything.
    fn install(&self, packages: &[String]) -> PackageInstallResult;

    fn is_installed(&self, package: &str) -> bool;

    /// Remove `packages`. An empty list succeeds without running anything.
    fn remove(&self, packages: &[String]) -> bool;
}

/// Package manager for `family`, or `None` when we have no implementation.
pub fn package_manager_for(
    family: SupportedDistroFamily,
    session: Arc<PrivilegeSession>,
    settings: &Settings,
) -> Option<Box<dyn PackageManager>> {
    match family {
        SupportedDistroFamily::Arch | SupportedDistroFamily::CachyOs => {
            Some(Box::new(Pacman::new(session, settings)))
        }
        // apt families are detected but not yet installable.
        SupportedDistroFamily::Ubuntu
        | SupportedDistroFamily::Debian
        | SupportedDistroFamily::Unsupported => None,
    }
}

/// Canonical dependency name to per-family package name.
const PACKAGE_MAP: &[(&str, &[(SupportedDistroFamily, &str)])] = &[
    ("rust", &[(SupportedDistroFamily::Arch, "rust"), (SupportedDistroFamily::CachyOs, "rust")]),
    ("cargo", &[(SupportedDistroFamily::Arch, "cargo"), (SupportedDistroFamily::CachyOs, "cargo")]),
    ("pkg-config", &[(SupportedDistroFamily::Arch, "pkg-config"), (SupportedDistroFamily::CachyOs, "pkg-config")]),
    ("openssl", &[(SupportedDistroFamily::Arch, "openssl"), (SupportedDistroFamily::CachyOs, "openssl")]),
    ("sqlite", &[(SupportedDistroFamily::Arch, "sqlite"), (SupportedDistroFamily::CachyOs, "sqlite")]),
    ("dbus", &[(SupportedDistroFamily::Arch, "dbus"), (SupportedDistroFamily::CachyOs, "dbus")]),
    ("tpm2-tss", &[(SupportedDistroFamily::Arch, "tpm2-tss"), (SupportedDistroFamily::CachyOs, "tpm2-tss")]),
    ("git", &[(SupportedDistroFamily::Arch, "git"), (SupportedDistroFamily::CachyOs, "git")]),
    ("base-devel", &[(SupportedDistroFamily::Arch, "base-devel"), (SupportedDistroFamily::CachyOs, "base-devel")]),
    ("python", &[(SupportedDistroFamily::Arch, "python"), (SupportedDistroFamily::CachyOs, "python")]),
    ("cronie", &[(SupportedDistroFamily::Arch, "cronie"), (SupportedDistroFamily::CachyOs, "cronie")]),
    ("gdm", &[(SupportedDistroFamily::Arch, "gdm"), (SupportedDistroFamily::CachyOs, "gdm")]),
];

/// Translate a canonical name for `family`.
///
/// Names missing from the table pass through unchanged. Names in the table
/// without an entry for `family` yield `None`.
pub fn map_package_name(canonical: &str, family: SupportedDistroFamily) -> Option<String> {
    match PACKAGE_MAP.iter().find(|(name, _)| *name == canonical) {
        None => Some(canonical.to_string()),
        Some((_, per_family)) => per_family
            .iter()
            .find(|(f, _)| *f == family)
            .map(|(_, pkg)| pkg.to_string()),
    }
}

/// Build dependencies of the identity daemon for `family`, from `canonical`.
pub fn dependencies_for(canonical: &[String], family: SupportedDistroFamily) -> Vec<String> {
    canonical
        .iter()
        .filter_map(|dep| map_package_name(dep, family))
        .collect()
}

/// The default dependency list mapped for `family`.
pub fn himmelblau_dependencies(family: SupportedDistroFamily) -> Vec<String> {
    let canonical: Vec<String> = DEFAULT_DEPENDENCIES.iter().map(|d| d.to_string()).collect();
    dependencies_for(&canonical, family)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::CommandRunner;
    use crate::testing::FakeRunner;

    fn session(runner: &FakeRunner) -> Arc<PrivilegeSession> {
        let runner: Arc<dyn CommandRunner> = Arc::new(runner.clone());
        Arc::new(PrivilegeSession::direct(runner))
    }

    #[test]
    fn test_factory_only_for_pacman_families() {
        let runner = FakeRunner::new();
        let settings = Settings::default();
        for family in [SupportedDistroFamily::Arch, SupportedDistroFamily::CachyOs] {
            let pm = package_manager_for(family, session(&runner), &settings).unwrap();
            assert_eq!(pm.name(), "pacman");
        }
        for family in [
            SupportedDistroFamily::Ubuntu,
            SupportedDistroFamily::Debian,
            SupportedDistroFamily::Unsupported,
        ] {
            assert!(package_manager_for(family, session(&runner), &settings).is_none());
        }
    }

    #[test]
    fn test_unmapped_names_pass_through() {
        assert_eq!(
            map_package_name("libfoo", SupportedDistroFamily::Ubuntu),
            Some("libfoo".to_string())
        );
        assert_eq!(
            map_package_name("rust", SupportedDistroFamily::Arch),
            Some("rust".to_string())
        );
        assert_eq!(map_package_name("rust", SupportedDistroFamily::Debian), None);
    }

    #[test]
    fn test_himmelblau_dependencies_arch() {
        let deps = himmelblau_dependencies(SupportedDistroFamily::Arch);
        assert_eq!(deps.len(), DEFAULT_DEPENDENCIES.len());
        assert!(deps.iter().any(|d| d == "tpm2-tss"));
        assert!(himmelblau_dependencies(SupportedDistroFamily::Ubuntu).is_empty());
    }

    #[test]
    fn test_summary_uses_first_stderr_line() {
        let result = PackageInstallResult::batch_failed(
            &["git".to_string()],
            String::new(),
            "\nerror: target not found: git\nmore\n",
        );
        assert_eq!(result.summary(), "error: target not found: git");
    }
}
