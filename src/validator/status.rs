//! Snapshot types produced by [`SystemValidator::validate`](super::SystemValidator::validate).

use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentState {
    Enrolled,
    NotEnrolled,
    DeviceLimit,
    Failed,
    #[default]
    Unknown,
}

impl EnrollmentState {
    pub fn display(&self) -> &'static str {
        match self {
            EnrollmentState::Enrolled => "Enrolled",
            EnrollmentState::NotEnrolled => "Not enrolled",
            EnrollmentState::DeviceLimit => "Device limit reached",
            EnrollmentState::Failed => "Enrollment failed",
            EnrollmentState::Unknown => "Unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplianceState {
    Compliant,
    NonCompliant,
    #[default]
    Unknown,
    NotApplicable,
}

impl ComplianceState {
    pub fn display(&self) -> &'static str {
        match self {
            ComplianceState::Compliant => "Compliant",
            ComplianceState::NonCompliant => "Non-compliant",
            ComplianceState::Unknown => "Unknown",
            ComplianceState::NotApplicable => "N/A",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IntuneStatus {
    pub enrollment_state: EnrollmentState,
    pub enrollment_error: Option<String>,
    pub compliance_state: ComplianceState,
    pub last_activity: Option<String>,
}

impl IntuneStatus {
    pub fn unknown(error: impl Into<String>) -> Self {
        Self {
            enrollment_error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn is_enrolled(&self) -> bool {
        self.enrollment_state == EnrollmentState::Enrolled
    }

    pub fn is_compliant(&self) -> bool {
        self.compliance_state == ComplianceState::Compliant
    }
}

/// Everything we know about the host's enrollment setup at one instant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SystemStatus {
    // Display manager
    pub current_display_manager: Option<String>,
    pub gdm_installed: bool,
    pub gdm_enabled: bool,

    // Build dependencies
    pub rust_installed: bool,
    pub cargo_installed: bool,
    pub build_deps_installed: bool,

    // Identity daemon
    pub himmelblau_installed: bool,
    pub himmelblau_version: Option<String>,

    // Host configuration
    pub nss_configured: bool,
    pub pam_configured: bool,
    pub services_installed: bool,

    // Runtime
    pub daemon_running: bool,
    pub tasks_running: bool,
    pub cron_running: bool,

    pub config_exists: bool,
    pub configured_domain: Option<String>,

    pub has_backups: bool,

    pub intune: IntuneStatus,
}

impl SystemStatus {
    pub fn is_fully_configured(&self) -> bool {
        self.himmelblau_installed
            && self.nss_configured
            && self.pam_configured
            && self.daemon_running
            && self.config_exists
    }

    /// Daemon binaries present but the daemon is not running.
    pub fn is_partially_installed(&self) -> bool {
        self.himmelblau_installed && !self.daemon_running
    }

    pub fn is_ready_for_install(&self) -> bool {
        self.gdm_installed && !self.himmelblau_installed
    }

    pub fn enrollment_status(&self) -> &'static str {
        if self.is_fully_configured() {
            "Enrolled and running"
        } else if self.is_partially_installed() {
            "Partially configured"
        } else if self.himmelblau_installed {
            "Installed, not configured"
        } else {
            "Not enrolled"
        }
    }
}
