use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use super::{PackageInstallResult, PackageManager};
use crate::config::Settings;
use crate::privilege::PrivilegeSession;
use crate::process::{Cmd, CmdError};

const UPDATE_TIMEOUT_SECS: u64 = 60;

/// `pacman` for the Arch family.
pub struct Pacman {
    session: Arc<PrivilegeSession>,
    install_timeout: Duration,
    query_timeout: Duration,
    remove_timeout: Duration,
}

impl Pacman {
    pub fn new(session: Arc<PrivilegeSession>, settings: &Settings) -> Self {
        Self {
            session,
            install_timeout: Duration::from_secs(settings.install_timeout_secs),
            query_timeout: Duration::from_secs(settings.query_timeout_secs),
            remove_timeout: Duration::from_secs(settings.remove_timeout_secs),
        }
    }
}

impl PackageManager for Pacman {
    fn name(&self) -> &'static str {
        "pacman"
    }

    fn update_repos(&self) -> bool {
        let cmd = Cmd::new("pacman").arg("-Sy").timeout_secs(UPDATE_TIMEOUT_SECS);
        match self.session.run(cmd) {
            Ok(result) => result.success(),
            Err(e) => {
                warn!("pacman -Sy: {e}");
                false
            }
        }
    }

    fn install(&self, packages: &[String]) -> PackageInstallResult {
        if packages.is_empty() {
            return PackageInstallResult::nothing_to_do();
        }
        info!(packages = %packages.join(" "), "installing packages");

        let cmd = Cmd::new("pacman")
            .args(["-S", "--noconfirm", "--needed"])
            .args(packages)
            .timeout(self.install_timeout);
        match self.session.run(cmd) {
            Ok(result) if result.success() => PackageInstallResult {
                success: true,
                packages_installed: packages.to_vec(),
                packages_failed: Vec::new(),
                stdout: result.stdout,
                stderr: result.stderr,
            },
            Ok(result) => {
                warn!(code = ?result.status, "pacman install failed");
                PackageInstallResult::batch_failed(packages, result.stdout, result.stderr)
            }
            Err(CmdError::Timeout { .. }) => {
                warn!("pacman install timed out");
                PackageInstallResult::batch_failed(packages, String::new(), "Installation timeout")
            }
            Err(e) => PackageInstallResult::batch_failed(packages, String::new(), e.to_string()),
        }
    }

    fn is_installed(&self, package: &str) -> bool {
        Cmd::new("pacman")
            .args(["-Q", package])
            .timeout(self.query_timeout)
            .allow_fail()
            .run(self.session.runner())
            .map(|r| r.success())
            .unwrap_or(false)
    }

    fn remove(&self, packages: &[String]) -> bool {
        if packages.is_empty() {
            return true;
        }
        let cmd = Cmd::new("pacman")
            .args(["-R", "--noconfirm"])
            .args(packages)
            .timeout(self.remove_timeout);
        match self.session.run(cmd) {
            Ok(result) => result.success(),
            Err(e) => {
                warn!("pacman remove: {e}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{CmdResult, CommandRunner};
    use crate::testing::FakeRunner;

    fn pacman(runner: &FakeRunner) -> Pacman {
        let handle: Arc<dyn CommandRunner> = Arc::new(runner.clone());
        Pacman::new(
            Arc::new(PrivilegeSession::direct(handle)),
            &Settings::default(),
        )
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_empty_install_issues_no_command() {
        let runner = FakeRunner::new();
        let result = pacman(&runner).install(&[]);
        assert!(result.success);
        assert!(result.packages_installed.is_empty());
        assert!(result.packages_failed.is_empty());
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn test_empty_remove_issues_no_command() {
        let runner = FakeRunner::new();
        assert!(pacman(&runner).remove(&[]));
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn test_install_success_reports_all_packages() {
        let runner = FakeRunner::new();
        let result = pacman(&runner).install(&names(&["git", "dbus"]));
        assert!(result.success);
        assert_eq!(result.packages_installed, ["git", "dbus"]);
        assert!(result.packages_failed.is_empty());

        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(
            calls[0].to_string(),
            "pacman -S --noconfirm --needed git dbus"
        );
        assert_eq!(calls[0].get_timeout(), Duration::from_secs(600));
    }

    #[test]
    fn test_install_failure_fails_whole_batch() {
        let runner = FakeRunner::new();
        runner.on(&["pacman", "-S"], CmdResult::failed(1, "error: target not found: nope"));
        let result = pacman(&runner).install(&names(&["git", "nope"]));
        assert!(!result.success);
        assert!(result.packages_installed.is_empty());
        assert_eq!(result.packages_failed, ["git", "nope"]);
        assert!(result.stderr.contains("target not found"));
    }

    #[test]
    fn test_install_timeout_is_a_result() {
        let runner = FakeRunner::new();
        runner.timeout_on(&["pacman", "-S"]);
        let result = pacman(&runner).install(&names(&["rust"]));
        assert!(!result.success);
        assert_eq!(result.stderr, "Installation timeout");
        assert_eq!(result.packages_failed, ["rust"]);
    }

    #[test]
    fn test_is_installed_queries_without_elevation() {
        let runner = FakeRunner::new();
        runner.on(&["pacman", "-Q", "missing"], CmdResult::failed(1, ""));
        runner.timeout_on(&["pacman", "-Q", "slow"]);
        let pm = pacman(&runner);
        assert!(pm.is_installed("git"));
        assert!(!pm.is_installed("missing"));
        assert!(!pm.is_installed("slow"));
    }

    #[test]
    fn test_remove_and_update() {
        let runner = FakeRunner::new();
        runner.on(&["pacman", "-Sy"], CmdResult::failed(1, "no network"));
        let pm = pacman(&runner);
        assert!(pm.remove(&names(&["gdm"])));
        assert!(!pm.update_repos());
        assert_eq!(runner.count(&["pacman", "-R", "--noconfirm", "gdm"]), 1);
    }
}
