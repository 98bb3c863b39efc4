//! Clone, build and install the identity daemon from source.
//!
//! The builder walks `NOT_STARTED → CLONING → BUILDING → INSTALLING →
//! COMPLETED`; any phase can fall to `FAILED`, which is terminal. Each phase
//! is also callable on its own. Percent only moves on phase transitions;
//! `Compiling <crate>` lines from the build update the message alone.
//!
//! ```rust,ignore
//! let builder = HimmelblauBuilder::new(session, paths, &settings);
//! let rx = builder.progress().subscribe();
//! if !builder.build_and_install() {
//!     eprintln!("{}", builder.current().message);
//! }
//! ```

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::config::{HostPaths, Settings};
use crate::privilege::PrivilegeSession;
use crate::process::{Cmd, CmdError};
use crate::progress::ProgressBus;

pub const TOTAL_BUILD_STEPS: u32 = 5;
const BINARY_MODE: u32 = 0o755;
const VERSION_TIMEOUT_SECS: u64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    NotStarted,
    Cloning,
    Building,
    Installing,
    Completed,
    Failed,
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BuildStatus::NotStarted => "not_started",
            BuildStatus::Cloning => "cloning",
            BuildStatus::Building => "building",
            BuildStatus::Installing => "installing",
            BuildStatus::Completed => "completed",
            BuildStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildProgress {
    pub status: BuildStatus,
    pub message: String,
    pub percent: u8,
    pub current_step: u32,
    pub total_steps: u32,
}

impl Default for BuildProgress {
    fn default() -> Self {
        Self {
            status: BuildStatus::NotStarted,
            message: "Ready".to_string(),
            percent: 0,
            current_step: 0,
            total_steps: TOTAL_BUILD_STEPS,
        }
    }
}

/// Crate name from a cargo `Compiling foo v1.2.3 (...)` line.
pub fn compiling_unit(line: &str) -> Option<&str> {
    if !line.contains("Compiling") {
        return None;
    }
    line.split_whitespace().nth(1)
}

pub struct HimmelblauBuilder {
    session: Arc<PrivilegeSession>,
    paths: HostPaths,
    repo_url: String,
    clone_timeout: Duration,
    build_timeout: Duration,
    state: Mutex<BuildProgress>,
    bus: ProgressBus<BuildProgress>,
}

impl HimmelblauBuilder {
    pub fn new(session: Arc<PrivilegeSession>, paths: HostPaths, settings: &Settings) -> Self {
        Self {
            session,
            paths,
            repo_url: settings.repo_url.clone(),
            clone_timeout: settings.clone_timeout(),
            build_timeout: settings.build_timeout(),
            state: Mutex::new(BuildProgress::default()),
            bus: ProgressBus::new(),
        }
    }

    pub fn progress(&self) -> &ProgressBus<BuildProgress> {
        &self.bus
    }

    pub fn current(&self) -> BuildProgress {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Record a transition and publish the new snapshot. `step` moves the
    /// percentage; `None` keeps the current step.
    fn update(&self, status: BuildStatus, message: impl Into<String>, step: Option<u32>) {
        let snapshot = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(step) = step {
                state.current_step = step;
            }
            state.status = status;
            state.message = message.into();
            state.percent = (state.current_step * 100 / state.total_steps) as u8;
            state.clone()
        };
        if status == BuildStatus::Failed {
            warn!(step = snapshot.current_step, "build failed: {}", snapshot.message);
        } else {
            info!(status = %status, percent = snapshot.percent, "{}", snapshot.message);
        }
        self.bus.publish(snapshot);
    }

    fn fail(&self, message: impl Into<String>) -> bool {
        self.update(BuildStatus::Failed, message, None);
        false
    }

    fn release_dir(&self) -> PathBuf {
        self.paths.build_dir.join("target").join("release")
    }

    /// Fresh clone into the build directory.
    pub fn clone_repo(&self) -> bool {
        self.update(BuildStatus::Cloning, "Cloning repository...", Some(1));

        let build_dir = &self.paths.build_dir;
        if build_dir.exists() {
            if let Err(e) = self.session.remove_dir_all(build_dir) {
                return self.fail(format!("Failed to clean build dir: {e:#}"));
            }
        }

        let clone = Cmd::new("git")
            .args(["clone", &self.repo_url])
            .arg_path(build_dir)
            .timeout(self.clone_timeout);
        match self.session.runner().exec(&clone) {
            Ok(result) if result.success() => true,
            Ok(result) => self.fail(format!("Clone failed: {}", result.stderr.trim())),
            Err(CmdError::Timeout { .. }) => self.fail("Clone timeout"),
            Err(e) => self.fail(format!("Clone error: {e}")),
        }
    }

    /// `cargo build --release`, streaming compile progress.
    pub fn build(&self) -> bool {
        self.update(
            BuildStatus::Building,
            "Building Himmelblau (this may take 2-5 minutes)...",
            Some(2),
        );

        if !self.paths.build_dir.is_dir() {
            return self.fail("Build directory not found");
        }

        let cargo = Cmd::new("cargo")
            .args(["build", "--release"])
            .cwd(&self.paths.build_dir)
            .env("HIMMELBLAU_ALLOW_MISSING_SELINUX", "1")
            .timeout(self.build_timeout);
        let mut on_line = |line: &str| {
            if let Some(unit) = compiling_unit(line) {
                self.update(BuildStatus::Building, format!("Compiling {unit}..."), None);
            }
        };
        match self.session.runner().exec_streaming(&cargo, &mut on_line) {
            Ok(result) if result.success() => true,
            Ok(_) => self.fail("Build failed"),
            Err(CmdError::Timeout { .. }) => self.fail("Build timeout"),
            Err(e) => self.fail(format!("Build error: {e}")),
        }
    }

    /// Install every known artifact. A missing artifact aborts before
    /// anything is installed.
    pub fn install_binaries(&self) -> bool {
        self.update(BuildStatus::Installing, "Installing binaries...", Some(3));

        let release = self.release_dir();
        if !release.is_dir() {
            return self.fail("Release directory not found");
        }

        if let Some((artifact, _)) = self
            .paths
            .binaries
            .iter()
            .find(|(artifact, _)| !release.join(artifact).exists())
        {
            return self.fail(format!("Binary not found: {artifact}"));
        }

        for (artifact, dest) in &self.paths.binaries {
            let src = release.join(artifact);
            if let Err(e) = self.session.install_file(&src, dest, BINARY_MODE) {
                warn!("{e:#}");
                return self.fail(format!("Failed to install {artifact}"));
            }
        }
        true
    }

    /// Remove the build directory. Never fails the build.
    pub fn cleanup(&self) -> bool {
        self.update(BuildStatus::Installing, "Cleaning up...", Some(4));
        if let Err(e) = self.session.remove_dir_all(&self.paths.build_dir) {
            warn!("cleanup of {} failed: {e:#}", self.paths.build_dir.display());
        }
        true
    }

    /// All phases in order, stopping at the first failure.
    pub fn build_and_install(&self) -> bool {
        let phases: [fn(&Self) -> bool; 4] = [
            Self::clone_repo,
            Self::build,
            Self::install_binaries,
            Self::cleanup,
        ];
        if !phases.iter().all(|phase| phase(self)) {
            return false;
        }
        self.update(BuildStatus::Completed, "Installation complete!", Some(5));
        true
    }

    pub fn is_installed(&self) -> bool {
        self.paths.daemon_binary().exists()
    }

    pub fn get_version(&self) -> Option<String> {
        let cmd = Cmd::new(self.paths.daemon_binary().to_string_lossy())
            .arg("--version")
            .timeout_secs(VERSION_TIMEOUT_SECS);
        self.session
            .runner()
            .exec(&cmd)
            .ok()
            .filter(|r| r.success())
            .map(|r| r.stdout.trim().to_string())
    }
}
