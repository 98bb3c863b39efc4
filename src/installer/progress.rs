//! Step-level progress snapshots.

use std::fmt;

use serde::{Deserialize, Serialize};

pub const TOTAL_INSTALL_STEPS: u32 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallStep {
    CheckSystem,
    InstallGdm,
    InstallDeps,
    BuildHimmelblau,
    ConfigureSystem,
    StartServices,
    Verify,
}

impl InstallStep {
    pub const ALL: [InstallStep; TOTAL_INSTALL_STEPS as usize] = [
        InstallStep::CheckSystem,
        InstallStep::InstallGdm,
        InstallStep::InstallDeps,
        InstallStep::BuildHimmelblau,
        InstallStep::ConfigureSystem,
        InstallStep::StartServices,
        InstallStep::Verify,
    ];

    /// 1-based position in the sequence.
    pub fn number(self) -> u32 {
        match self {
            InstallStep::CheckSystem => 1,
            InstallStep::InstallGdm => 2,
            InstallStep::InstallDeps => 3,
            InstallStep::BuildHimmelblau => 4,
            InstallStep::ConfigureSystem => 5,
            InstallStep::StartServices => 6,
            InstallStep::Verify => 7,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            InstallStep::CheckSystem => "Check system",
            InstallStep::InstallGdm => "Install GDM",
            InstallStep::InstallDeps => "Install dependencies",
            InstallStep::BuildHimmelblau => "Build Himmelblau",
            InstallStep::ConfigureSystem => "Configure system",
            InstallStep::StartServices => "Start services",
            InstallStep::Verify => "Verify installation",
        }
    }
}

impl fmt::Display for InstallStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallStatus {
    NotStarted,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl InstallStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            InstallStatus::Completed | InstallStatus::Failed | InstallStatus::Cancelled
        )
    }
}

impl fmt::Display for InstallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstallStatus::NotStarted => "not_started",
            InstallStatus::InProgress => "in_progress",
            InstallStatus::Completed => "completed",
            InstallStatus::Failed => "failed",
            InstallStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// One published snapshot. A new value replaces the previous one; nothing
/// mutates a snapshot after it is sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstallProgress {
    pub status: InstallStatus,
    pub current_step: InstallStep,
    pub step_number: u32,
    pub total_steps: u32,
    pub message: String,
    pub percent: u8,
    pub error: Option<String>,
}

impl InstallProgress {
    pub fn new(
        step: InstallStep,
        status: InstallStatus,
        message: impl Into<String>,
        error: Option<String>,
    ) -> Self {
        let step_number = step.number();
        Self {
            status,
            current_step: step,
            step_number,
            total_steps: TOTAL_INSTALL_STEPS,
            message: message.into(),
            percent: (step_number * 100 / TOTAL_INSTALL_STEPS) as u8,
            error,
        }
    }
}

impl Default for InstallProgress {
    fn default() -> Self {
        Self {
            status: InstallStatus::NotStarted,
            current_step: InstallStep::CheckSystem,
            step_number: 0,
            total_steps: TOTAL_INSTALL_STEPS,
            message: "Ready".to_string(),
            percent: 0,
            error: None,
        }
    }
}
