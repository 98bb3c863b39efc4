//! Live system inspection.
//!
//! [`SystemValidator::validate`] probes files, services, packages and the
//! identity daemon and returns a fresh [`SystemStatus`]. Probes never fail:
//! an unreadable file, a missing tool or a timed-out query all read as
//! "not there".
//!
//! The validator also owns the daemon's operational commands
//! (`check_aad_tool_status`, `clear_cache`, `test_auth`, `get_tpm_status`,
//! `set_offline_breakglass`, `enumerate_users`). Their output is free text;
//! the rules for reading it live in [`aad`] and [`journal`] only.
//!
//! ```rust,ignore
//! let validator = SystemValidator::new(session, HostPaths::default(), &settings);
//! let status = validator.validate();
//! if status.is_fully_configured() {
//!     println!("{}", status.intune.enrollment_state.display());
//! }
//! ```

pub mod aad;
pub mod journal;
pub mod status;

use std::fs;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::{HostPaths, Settings};
use crate::privilege::PrivilegeSession;
use crate::process::{Cmd, CmdResult};

pub use aad::{AadOutcome, AadReport};
pub use status::{ComplianceState, EnrollmentState, IntuneStatus, SystemStatus};

pub const DAEMON_SERVICE: &str = "himmelblaud";
pub const TASKS_SERVICE: &str = "himmelblaud-tasks";

const DISPLAY_MANAGERS: &[&str] = &["gdm", "gdm3", "sddm", "lightdm", "lxdm", "xdm"];
const NSS_MARKER: &str = "himmelblau";
const PAM_MARKER: &str = "pam_himmelblau";

const QUICK_TIMEOUT_SECS: u64 = 2;
const STATUS_TIMEOUT_SECS: u64 = 5;
const JOURNAL_TIMEOUT_SECS: u64 = 10;
const AAD_TIMEOUT_SECS: u64 = 30;
const ENUMERATE_TIMEOUT_SECS: u64 = 120;

pub struct SystemValidator {
    session: Arc<PrivilegeSession>,
    paths: HostPaths,
    journal_lines: u32,
}

impl SystemValidator {
    pub fn new(session: Arc<PrivilegeSession>, paths: HostPaths, settings: &Settings) -> Self {
        Self {
            session,
            paths,
            journal_lines: settings.journal_lines,
        }
    }

    pub fn validate(&self) -> SystemStatus {
        let current_display_manager = self.current_display_manager();
        let gdm_enabled = matches!(current_display_manager.as_deref(), Some("gdm" | "gdm3"));
        let himmelblau_installed = self.paths.daemon_binary().exists();

        let mut status = SystemStatus {
            gdm_installed: self.package_installed("gdm") || self.package_installed("gdm3"),
            gdm_enabled,
            current_display_manager,

            rust_installed: self.package_installed("rust") || self.package_installed("rustc"),
            cargo_installed: self.package_installed("cargo"),
            build_deps_installed: ["pkg-config", "git"]
                .iter()
                .all(|pkg| self.package_installed(pkg)),

            himmelblau_version: himmelblau_installed.then(|| self.installed_version()),
            himmelblau_installed,

            nss_configured: file_contains(&self.paths.nsswitch, NSS_MARKER),
            pam_configured: self.pam_configured(),
            services_installed: self.paths.unit_file("himmelblaud.service").exists(),

            daemon_running: self.service_active(DAEMON_SERVICE),
            tasks_running: self.service_active(TASKS_SERVICE),
            cron_running: self.service_active("cronie") || self.service_active("cron"),

            config_exists: self.paths.identity_conf.exists(),
            configured_domain: self.configured_domain(),

            has_backups: [&self.paths.pam_system_auth, &self.paths.nsswitch]
                .iter()
                .any(|p| HostPaths::backup_of(p).exists()),

            intune: IntuneStatus::default(),
        };
        status.intune = self.intune_status(status.is_fully_configured());

        info!(
            installed = status.himmelblau_installed,
            nss = status.nss_configured,
            pam = status.pam_configured,
            running = status.daemon_running,
            config = status.config_exists,
            "validated system"
        );
        status
    }

    fn quick(&self, cmd: Cmd) -> Option<CmdResult> {
        match self.session.runner().exec(&cmd) {
            Ok(result) => Some(result),
            Err(e) => {
                debug!("{e}");
                None
            }
        }
    }

    fn succeeds(&self, cmd: Cmd) -> bool {
        self.quick(cmd).is_some_and(|r| r.success())
    }

    /// First display manager whose unit is enabled.
    pub fn current_display_manager(&self) -> Option<String> {
        DISPLAY_MANAGERS
            .iter()
            .find(|dm| {
                self.succeeds(
                    Cmd::new("systemctl")
                        .args(["is-enabled", &format!("{dm}.service")])
                        .timeout_secs(QUICK_TIMEOUT_SECS),
                )
            })
            .map(|dm| dm.to_string())
    }

    /// Installed according to pacman, else dpkg.
    pub fn package_installed(&self, package: &str) -> bool {
        self.succeeds(
            Cmd::new("pacman")
                .args(["-Q", package])
                .timeout_secs(QUICK_TIMEOUT_SECS),
        ) || self.succeeds(
            Cmd::new("dpkg")
                .args(["-s", package])
                .timeout_secs(QUICK_TIMEOUT_SECS),
        )
    }

    pub fn service_active(&self, service: &str) -> bool {
        self.succeeds(
            Cmd::new("systemctl")
                .args(["is-active", &format!("{service}.service")])
                .timeout_secs(QUICK_TIMEOUT_SECS),
        )
    }

    pub fn service_enabled(&self, service: &str) -> bool {
        self.succeeds(
            Cmd::new("systemctl")
                .args(["is-enabled", &format!("{service}.service")])
                .timeout_secs(QUICK_TIMEOUT_SECS),
        )
    }

    fn pam_configured(&self) -> bool {
        match fs::read_to_string(&self.paths.pam_system_auth) {
            Ok(text) => text.contains(PAM_MARKER),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                file_contains(&self.paths.pam_common_auth, PAM_MARKER)
            }
            Err(_) => false,
        }
    }

    fn installed_version(&self) -> String {
        let trimmed_stdout = |r: CmdResult| {
            let out = r.stdout.trim().to_string();
            (r.success() && !out.is_empty()).then_some(out)
        };
        self.quick(
            Cmd::new("aad-tool")
                .arg("version")
                .timeout_secs(STATUS_TIMEOUT_SECS),
        )
        .and_then(trimmed_stdout)
        .or_else(|| {
            self.quick(
                Cmd::new(self.paths.daemon_binary().to_string_lossy())
                    .arg("--version")
                    .timeout_secs(QUICK_TIMEOUT_SECS),
            )
            .and_then(trimmed_stdout)
        })
        .unwrap_or_else(|| "installed".to_string())
    }

    /// Version reported by `aad-tool version`, or `"unknown"`.
    pub fn get_version(&self) -> String {
        self.quick(
            Cmd::new("aad-tool")
                .arg("version")
                .timeout_secs(STATUS_TIMEOUT_SECS),
        )
        .filter(CmdResult::success)
        .map(|r| r.stdout.trim().to_string())
        .unwrap_or_else(|| "unknown".to_string())
    }

    /// Value of `domains` in the identity config.
    pub fn configured_domain(&self) -> Option<String> {
        let text = fs::read_to_string(&self.paths.identity_conf).ok()?;
        text.lines()
            .map(str::trim)
            .filter(|line| line.starts_with("domains"))
            .find_map(|line| {
                let (_, value) = line.split_once('=')?;
                let value = value.trim();
                (!value.is_empty()).then(|| value.to_string())
            })
    }

    pub fn check_aad_tool_status(&self) -> AadReport {
        let raw = self.session.runner().exec(
            &Cmd::new("aad-tool")
                .arg("status")
                .timeout_secs(STATUS_TIMEOUT_SECS),
        );
        aad::interpret_status(raw)
    }

    pub fn clear_cache(&self) -> AadReport {
        let report = aad::interpret_cache_clear(
            self.session.run(
                Cmd::new("aad-tool")
                    .arg("cache-clear")
                    .timeout_secs(AAD_TIMEOUT_SECS),
            ),
        );
        info!(outcome = ?report.outcome, "cache clear: {}", report.message);
        report
    }

    pub fn test_auth(&self, username: &str) -> AadReport {
        aad::interpret_auth_test(
            self.session.runner().exec(
                &Cmd::new("aad-tool")
                    .args(["auth-test", "--name", username])
                    .timeout_secs(AAD_TIMEOUT_SECS),
            ),
        )
    }

    /// `ok()` means the TPM is in use.
    pub fn get_tpm_status(&self) -> AadReport {
        aad::interpret_tpm(
            self.session
                .run(Cmd::new("aad-tool").arg("tpm").timeout_secs(AAD_TIMEOUT_SECS)),
        )
    }

    /// `ttl` such as `"2h"`; `"0"` disables breakglass, `None` uses the
    /// daemon's configured default.
    pub fn set_offline_breakglass(&self, ttl: Option<&str>) -> AadReport {
        let mut cmd = Cmd::new("aad-tool")
            .arg("offline-breakglass")
            .timeout_secs(AAD_TIMEOUT_SECS);
        if let Some(ttl) = ttl.filter(|t| !t.is_empty()) {
            cmd = cmd.args(["--ttl", ttl]);
        }
        aad::interpret_breakglass(self.session.run(cmd))
    }

    pub fn enumerate_users(&self, username: Option<&str>) -> AadReport {
        let mut cmd = Cmd::new("aad-tool")
            .arg("enumerate")
            .timeout_secs(ENUMERATE_TIMEOUT_SECS);
        if let Some(name) = username.filter(|n| !n.is_empty()) {
            cmd = cmd.args(["--name", name]);
        }
        aad::interpret_enumerate(self.session.run(cmd))
    }

    /// Last `lines` journal entries of `service`, or `None` when the journal
    /// cannot be read.
    pub fn read_journal(&self, service: &str, lines: u32) -> Option<String> {
        self.quick(
            Cmd::new("journalctl")
                .args(["-u", service, "-n", &lines.to_string(), "--no-pager"])
                .timeout_secs(JOURNAL_TIMEOUT_SECS),
        )
        .filter(CmdResult::success)
        .map(|r| r.stdout)
    }

    pub fn last_activity(&self) -> Option<String> {
        let result = self.quick(
            Cmd::new("journalctl")
                .args(["-u", DAEMON_SERVICE, "-n", "1", "--no-pager", "-o", "short"])
                .timeout_secs(STATUS_TIMEOUT_SECS),
        )?;
        if !result.success() {
            return None;
        }
        journal::parse_last_activity(&result.stdout)
    }

    /// Enrollment and compliance, derived from daemon health and journal.
    pub fn intune_status(&self, fully_configured: bool) -> IntuneStatus {
        let daemon = self.check_aad_tool_status();
        if !daemon.ok() {
            return IntuneStatus::unknown(format!("Daemon not responding: {}", daemon.message));
        }

        let raw = self.session.runner().exec(
            &Cmd::new("journalctl")
                .args([
                    "-u",
                    DAEMON_SERVICE,
                    "-n",
                    &self.journal_lines.to_string(),
                    "--no-pager",
                ])
                .timeout_secs(JOURNAL_TIMEOUT_SECS),
        );
        let journal = match raw {
            Ok(result) if result.success() => result.stdout,
            Ok(_) => return IntuneStatus::default(),
            Err(e) if e.is_timeout() => return IntuneStatus::unknown("Timeout checking status"),
            Err(e) => return IntuneStatus::unknown(e.to_string()),
        };

        let (enrollment_state, enrollment_error) =
            journal::classify_enrollment(&journal, fully_configured);
        IntuneStatus {
            compliance_state: journal::classify_compliance(&journal, enrollment_state),
            enrollment_state,
            enrollment_error,
            last_activity: self.last_activity(),
        }
    }
}

fn file_contains(path: &Path, marker: &str) -> bool {
    fs::read_to_string(path)
        .map(|text| text.contains(marker))
        .unwrap_or(false)
}
