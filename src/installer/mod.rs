//! End-to-end enrollment workflow.
//!
//! [`Installer`] runs seven steps in a fixed order. Each step is also public
//! and can be called on its own, as long as the steps it depends on ran
//! first (everything after `check_system` needs its detection results).
//!
//! A snapshot is published on [`Installer::progress`] after every
//! sub-action. The last snapshot of a run carries its terminal status.
//!
//! ```rust,ignore
//! let installer = Installer::new(session, HostPaths::default(), settings);
//! let rx = installer.progress().subscribe();
//! let handle = installer.spawn_install("contoso.com".into(), true)?;
//! while !handle.is_finished() {
//!     if let Ok(p) = rx.recv_timeout(Duration::from_millis(200)) {
//!         println!("[{}/{}] {}", p.step_number, p.total_steps, p.message);
//!     }
//! }
//! let (installer, ok) = handle.join().expect("worker joined");
//! ```

pub mod progress;
pub mod report;

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use thiserror::Error;
use tracing::{error, info, warn};

use crate::builder::{BuildProgress, HimmelblauBuilder};
use crate::config::{HostPaths, Settings};
use crate::configurator::{ConfigError, RollbackReport, SystemConfigurator};
use crate::distro::{DistroDetector, DistroInfo};
use crate::packages::{self, PackageInstallResult, PackageManager};
use crate::privilege::PrivilegeSession;
use crate::process::Cmd;
use crate::progress::ProgressBus;
use crate::validator::{SystemStatus, SystemValidator};

pub use progress::{InstallProgress, InstallStatus, InstallStep, TOTAL_INSTALL_STEPS};
pub use report::{RunLog, RunRecord};

const GDM_ENABLE_TIMEOUT_SECS: u64 = 30;
const RUN_HISTORY: usize = 20;

/// A step that ended the run. The same text is in the FAILED snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{step}: {message}")]
pub struct StepError {
    pub step: InstallStep,
    pub message: String,
    pub detail: Option<String>,
}

pub struct Installer {
    session: Arc<PrivilegeSession>,
    paths: HostPaths,
    settings: Settings,
    detector: DistroDetector,
    validator: SystemValidator,
    bus: ProgressBus<InstallProgress>,
    cancel: Arc<AtomicBool>,
    run_log: Option<RunLog>,

    distro_info: Option<DistroInfo>,
    system_status: Option<SystemStatus>,
    package_manager: Option<Box<dyn PackageManager>>,
    builder: Option<HimmelblauBuilder>,
    configurator: Option<SystemConfigurator>,
}

impl Installer {
    pub fn new(session: Arc<PrivilegeSession>, paths: HostPaths, settings: Settings) -> Self {
        Self {
            detector: DistroDetector::new(&paths.os_release),
            validator: SystemValidator::new(Arc::clone(&session), paths.clone(), &settings),
            bus: ProgressBus::new(),
            cancel: Arc::new(AtomicBool::new(false)),
            run_log: None,
            distro_info: None,
            system_status: None,
            package_manager: None,
            builder: None,
            configurator: None,
            session,
            paths,
            settings,
        }
    }

    /// Record composed runs in `log`.
    pub fn with_run_log(mut self, log: RunLog) -> Self {
        self.run_log = Some(log);
        self
    }

    pub fn progress(&self) -> &ProgressBus<InstallProgress> {
        &self.bus
    }

    pub fn current(&self) -> InstallProgress {
        self.bus.last().unwrap_or_default()
    }

    pub fn distro_info(&self) -> Option<&DistroInfo> {
        self.distro_info.as_ref()
    }

    pub fn system_status(&self) -> Option<&SystemStatus> {
        self.system_status.as_ref()
    }

    /// Last builder snapshot, when this run built the daemon.
    pub fn build_progress(&self) -> Option<BuildProgress> {
        self.builder.as_ref().map(HimmelblauBuilder::current)
    }

    /// Setting the flag stops a composed run before its next step.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    fn publish(&self, step: InstallStep, status: InstallStatus, message: impl Into<String>, error: Option<String>) {
        let snapshot = InstallProgress::new(step, status, message, error);
        match snapshot.status {
            InstallStatus::Failed => {
                error!(step = %step, error = ?snapshot.error, "{}", snapshot.message)
            }
            InstallStatus::Cancelled => warn!(step = %step, "{}", snapshot.message),
            _ => info!(step = %step, "{}", snapshot.message),
        }
        self.bus.publish(snapshot);
    }

    fn report(&self, step: InstallStep, message: impl Into<String>) {
        self.publish(step, InstallStatus::InProgress, message, None);
    }

    fn fail(&self, step: InstallStep, message: &str, detail: Option<String>) -> StepError {
        self.publish(step, InstallStatus::Failed, message, detail.clone());
        StepError {
            step,
            message: message.to_string(),
            detail,
        }
    }

    fn checked_status(&self, step: InstallStep) -> Result<&SystemStatus, StepError> {
        self.system_status
            .as_ref()
            .ok_or_else(|| self.fail(step, "System not checked", None))
    }

    fn checked_manager(&self, step: InstallStep) -> Result<&dyn PackageManager, StepError> {
        self.package_manager
            .as_deref()
            .ok_or_else(|| self.fail(step, "No package manager available", None))
    }

    /// Detect the distribution, pick its package manager and validate.
    ///
    /// A fully configured system ends the step as COMPLETED.
    pub fn check_system(&mut self) -> Result<(), StepError> {
        let step = InstallStep::CheckSystem;
        self.report(step, "Checking system...");

        let info = self.detector.detect();
        if !info.is_supported() {
            let message = format!("Unsupported distribution: {}", info.name);
            self.distro_info = Some(info);
            return Err(self.fail(step, &message, Some("Distribution not supported".into())));
        }

        let Some(manager) =
            packages::package_manager_for(info.family, Arc::clone(&self.session), &self.settings)
        else {
            self.distro_info = Some(info);
            return Err(self.fail(
                step,
                "No package manager available",
                Some("Package manager not found".into()),
            ));
        };
        self.package_manager = Some(manager);

        let status = self.validator.validate();
        let configured = status.is_fully_configured();
        self.system_status = Some(status);

        if configured {
            self.publish(step, InstallStatus::Completed, "System already configured", None);
        } else {
            self.report(step, format!("System compatible: {}", info.display_name()));
        }
        self.distro_info = Some(info);
        Ok(())
    }

    pub fn install_gdm(&mut self) -> Result<(), StepError> {
        let step = InstallStep::InstallGdm;
        self.report(step, "Checking GDM...");

        let status = self.checked_status(step)?;
        if status.gdm_enabled {
            self.report(step, "GDM already enabled");
            return Ok(());
        }

        if !status.gdm_installed {
            self.report(step, "Installing GDM...");
            let family = self.distro_family();
            let gdm = packages::map_package_name("gdm", family).unwrap_or_else(|| "gdm".into());
            let result = self.checked_manager(step)?.install(&[gdm]);
            if !result.success {
                return Err(self.fail(step, "Failed to install GDM", Some(result.summary())));
            }
        }

        self.report(step, "Enabling GDM...");
        let enable = Cmd::new("systemctl")
            .args(["enable", "gdm"])
            .timeout_secs(GDM_ENABLE_TIMEOUT_SECS);
        match self.session.run(enable) {
            Ok(result) if result.success() => {}
            Ok(result) => {
                return Err(self.fail(step, "Failed to enable GDM", Some(result.message_or("systemctl failed"))))
            }
            Err(e) => return Err(self.fail(step, "Failed to enable GDM", Some(e.to_string()))),
        }

        self.report(step, "GDM configured");
        Ok(())
    }

    fn distro_family(&self) -> crate::distro::SupportedDistroFamily {
        self.distro_info
            .as_ref()
            .map(|info| info.family)
            .unwrap_or(crate::distro::SupportedDistroFamily::Unsupported)
    }

    /// Install whichever configured dependencies are missing.
    pub fn install_dependencies(&mut self) -> Result<PackageInstallResult, StepError> {
        let step = InstallStep::InstallDeps;
        self.report(step, "Installing dependencies...");

        let deps = packages::dependencies_for(&self.settings.dependencies, self.distro_family());
        let manager = self.checked_manager(step)?;
        let missing: Vec<String> = deps
            .into_iter()
            .filter(|dep| !manager.is_installed(dep))
            .collect();

        if missing.is_empty() {
            self.report(step, "All dependencies installed");
            return Ok(PackageInstallResult::nothing_to_do());
        }

        self.report(step, format!("Installing {} packages...", missing.len()));
        let result = manager.install(&missing);
        if !result.success {
            return Err(self.fail(step, "Failed to install dependencies", Some(result.summary())));
        }

        self.report(step, "Dependencies installed");
        Ok(result)
    }

    /// Build from source unless the daemon is already installed. Builder
    /// messages are republished as step 4 snapshots.
    pub fn build_himmelblau(&mut self) -> Result<(), StepError> {
        let step = InstallStep::BuildHimmelblau;
        self.report(step, "Building Himmelblau...");

        if self.checked_status(step)?.himmelblau_installed {
            self.report(step, "Himmelblau already installed");
            return Ok(());
        }

        let builder = HimmelblauBuilder::new(Arc::clone(&self.session), self.paths.clone(), &self.settings);
        let bus = self.bus.clone();
        builder.progress().on_progress(move |build: &BuildProgress| {
            bus.publish(InstallProgress::new(step, InstallStatus::InProgress, build.message.clone(), None));
        });

        let ok = builder.build_and_install();
        let last_message = builder.current().message;
        self.builder = Some(builder);
        if !ok {
            return Err(self.fail(step, "Build failed", Some(last_message)));
        }

        self.report(step, "Himmelblau installed");
        Ok(())
    }

    /// Configure everything except service start.
    pub fn configure_system(&mut self, domain: &str, grant_sudo: bool) -> Result<(), StepError> {
        let step = InstallStep::ConfigureSystem;
        self.report(step, "Configuring system...");

        self.configurator = Some(SystemConfigurator::new(
            Arc::clone(&self.session),
            self.paths.clone(),
            &self.settings,
        ));

        self.configure_action("Creating directories...", |c| c.create_cache_directories())?;
        self.configure_action("Configuring NSS...", |c| c.configure_nss())?;
        self.configure_action("Configuring PAM...", |c| c.configure_pam())?;
        self.configure_action("Installing services...", |c| c.install_systemd_services())?;
        self.configure_action("Creating configuration...", |c| {
            c.create_himmelblau_config(domain, grant_sudo)
        })?;

        self.report(step, "System configured");
        Ok(())
    }

    fn configure_action<F>(&self, message: &str, action: F) -> Result<(), StepError>
    where
        F: FnOnce(&SystemConfigurator) -> Result<(), ConfigError>,
    {
        let step = InstallStep::ConfigureSystem;
        let Some(configurator) = self.configurator.as_ref() else {
            return Err(self.fail(step, "Configurator unavailable", None));
        };
        self.report(step, message);
        action(configurator).map_err(|e| {
            self.fail(step, &format!("Failed to {}", e.action), Some(e.detail.clone()))
        })
    }

    pub fn start_services(&mut self) -> Result<(), StepError> {
        let step = InstallStep::StartServices;
        self.report(step, "Starting services...");

        let detail = match self.configurator.as_ref().map(|c| c.start_services()) {
            Some(Ok(())) => {
                self.report(step, "Services started");
                return Ok(());
            }
            Some(Err(e)) => Some(e.detail),
            None => Some("System was not configured in this run".to_string()),
        };
        Err(self.fail(step, "Failed to start services", detail))
    }

    pub fn verify(&mut self) -> Result<(), StepError> {
        let step = InstallStep::Verify;
        self.report(step, "Verifying installation...");

        let status = self.validator.validate();
        let configured = status.is_fully_configured();
        let summary = status.enrollment_status();
        self.system_status = Some(status);

        if configured {
            self.publish(step, InstallStatus::Completed, "Installation complete!", None);
            return Ok(());
        }
        Err(self.fail(step, "Verification failed", Some(format!("Status: {summary}"))))
    }

    fn run_step(&mut self, step: InstallStep, domain: &str, grant_sudo: bool) -> Result<(), StepError> {
        match step {
            InstallStep::CheckSystem => self.check_system(),
            InstallStep::InstallGdm => self.install_gdm(),
            InstallStep::InstallDeps => self.install_dependencies().map(|_| ()),
            InstallStep::BuildHimmelblau => self.build_himmelblau(),
            InstallStep::ConfigureSystem => self.configure_system(domain, grant_sudo),
            InstallStep::StartServices => self.start_services(),
            InstallStep::Verify => self.verify(),
        }
    }

    fn run_steps(&mut self, domain: &str, grant_sudo: bool) -> bool {
        for step in InstallStep::ALL {
            if self.cancel.load(Ordering::SeqCst) {
                self.publish(step, InstallStatus::Cancelled, "Installation cancelled", None);
                return false;
            }
            if self.run_step(step, domain, grant_sudo).is_err() {
                return false;
            }
            if step == InstallStep::CheckSystem
                && self.settings.skip_when_configured
                && self.current().status == InstallStatus::Completed
            {
                info!("system already configured, skipping remaining steps");
                return true;
            }
        }
        true
    }

    /// Run every step in order, stopping at the first failure.
    pub fn install(&mut self, domain: &str, grant_sudo: bool) -> bool {
        let mut record = self.run_log.as_ref().and_then(|log| match log.begin(domain) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("cannot record install run: {e:#}");
                None
            }
        });

        let ok = self.run_steps(domain, grant_sudo);

        if let (Some(log), Some(record)) = (self.run_log.as_ref(), record.as_mut()) {
            if let Err(e) = log.finish(record, &self.current()) {
                warn!("cannot record install run: {e:#}");
            } else if let Err(e) = log.prune(RUN_HISTORY) {
                warn!("cannot expire old install runs: {e:#}");
            }
        }
        ok
    }

    /// Run [`install`](Self::install) on a dedicated thread.
    ///
    /// A panic inside the workflow is published as a FAILED snapshot and
    /// reported as `false`.
    pub fn spawn_install(
        self,
        domain: String,
        grant_sudo: bool,
    ) -> std::io::Result<JoinHandle<(Installer, bool)>> {
        thread::Builder::new()
            .name("lintune-install".into())
            .spawn(move || {
                let mut installer = self;
                let outcome =
                    panic::catch_unwind(AssertUnwindSafe(|| installer.install(&domain, grant_sudo)));
                let ok = match outcome {
                    Ok(ok) => ok,
                    Err(payload) => {
                        let step = installer.current().current_step;
                        installer.publish(
                            step,
                            InstallStatus::Failed,
                            "Installation failed",
                            Some(panic_message(&*payload)),
                        );
                        false
                    }
                };
                (installer, ok)
            })
    }

    /// Undo the configuration made by [`configure_system`](Self::configure_system).
    /// `false` when that step never ran or a restore failed.
    pub fn rollback(&self) -> bool {
        self.rollback_report().is_some_and(|report| report.restored())
    }

    pub fn rollback_report(&self) -> Option<RollbackReport> {
        match &self.configurator {
            Some(configurator) => Some(configurator.rollback()),
            None => {
                warn!("nothing to roll back: system was not configured in this run");
                None
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configurator::units;
    use crate::process::{CmdResult, CommandRunner};
    use crate::testing::FakeRunner;
    use std::fs;
    use std::path::Path;
    use std::sync::mpsc::Receiver;
    use tempfile::TempDir;

    const ARCH: &str = "NAME=\"Arch Linux\"\nID=arch\nBUILD_ID=rolling\n";

    fn installer(runner: &FakeRunner, root: &Path, os_release: &str, settings: Settings) -> Installer {
        let paths = HostPaths::rooted(root);
        fs::create_dir_all(paths.os_release.parent().unwrap()).unwrap();
        fs::write(&paths.os_release, os_release).unwrap();
        let handle: Arc<dyn CommandRunner> = Arc::new(runner.clone());
        Installer::new(Arc::new(PrivilegeSession::direct(handle)), paths, settings)
    }

    fn drain(rx: &Receiver<InstallProgress>) -> Vec<InstallProgress> {
        rx.try_iter().collect()
    }

    /// A host whose tools all behave: clone, build and the unit generator
    /// produce files; the daemon reports itself working.
    fn working_host(runner: &FakeRunner, paths: &HostPaths) {
        let build_dir = paths.build_dir.clone();
        runner.on_with(move |cmd| {
            cmd.starts_with(&["git", "clone"]).then(|| {
                let dbus = build_dir.join("platform/debian").join(units::DBUS_SERVICE);
                fs::create_dir_all(dbus.parent().unwrap()).unwrap();
                fs::write(&dbus, "[D-BUS Service]\n").unwrap();
                fs::create_dir_all(build_dir.join("scripts")).unwrap();
                fs::write(build_dir.join("scripts/gen_servicefiles.py"), "").unwrap();
                Ok(CmdResult::ok(""))
            })
        });

        let release = paths.build_dir.join("target/release");
        let artifacts: Vec<String> = paths.binaries.iter().map(|(a, _)| a.clone()).collect();
        runner.on_with(move |cmd| {
            cmd.starts_with(&["cargo", "build"]).then(|| {
                fs::create_dir_all(&release).unwrap();
                for artifact in &artifacts {
                    fs::write(release.join(artifact), "").unwrap();
                }
                Ok(CmdResult::ok("   Compiling himmelblau v1.0.0\n"))
            })
        });

        let scratch = paths.services_scratch_dir.clone();
        runner.on_with(move |cmd| {
            cmd.starts_with(&["python3"]).then(|| {
                fs::create_dir_all(&scratch).unwrap();
                fs::write(scratch.join(units::DAEMON_UNIT), "[Service]\n").unwrap();
                fs::write(scratch.join(units::TASKS_UNIT), "[Service]\n").unwrap();
                Ok(CmdResult::ok(""))
            })
        });

        runner.on(&["aad-tool", "status"], CmdResult::ok("himmelblaud is working!\n"));
    }

    fn seed_auth_files(paths: &HostPaths) {
        fs::create_dir_all(paths.nsswitch.parent().unwrap()).unwrap();
        fs::write(&paths.nsswitch, "passwd: files\ngroup: files\n").unwrap();
        fs::create_dir_all(paths.pam_system_auth.parent().unwrap()).unwrap();
        fs::write(&paths.pam_system_auth, "auth required pam_unix.so\n").unwrap();
        fs::create_dir_all(&paths.cache_root).unwrap();
    }

    #[test]
    fn test_check_system_on_fresh_arch() {
        let temp = TempDir::new().unwrap();
        let runner = FakeRunner::new();
        let mut inst = installer(&runner, temp.path(), ARCH, Settings::default());
        let rx = inst.progress().subscribe();

        inst.check_system().unwrap();

        let last = drain(&rx).pop().unwrap();
        assert_eq!(last.status, InstallStatus::InProgress);
        assert_eq!(last.current_step, InstallStep::CheckSystem);
        assert!(last.message.contains("Arch Linux"), "{}", last.message);
        assert!(!inst.system_status().unwrap().is_fully_configured());
    }

    #[test]
    fn test_install_dependencies_reports_missing_only() {
        let temp = TempDir::new().unwrap();
        let runner = FakeRunner::new();
        let settings = Settings {
            dependencies: ["rust", "cargo", "openssl", "sqlite", "git"]
                .map(String::from)
                .to_vec(),
            ..Settings::default()
        };
        let mut inst = installer(&runner, temp.path(), ARCH, settings);
        runner.on(&["pacman", "-Q", "openssl"], CmdResult::failed(1, "error: package 'openssl' was not found"));
        runner.on(&["pacman", "-Q", "sqlite"], CmdResult::failed(1, "error: package 'sqlite' was not found"));

        inst.check_system().unwrap();
        let result = inst.install_dependencies().unwrap();

        assert!(result.success);
        assert!(result.packages_failed.is_empty());
        assert_eq!(result.packages_installed, ["openssl", "sqlite"]);
        assert_eq!(
            runner.count(&["pacman", "-S", "--noconfirm", "--needed", "openssl", "sqlite"]),
            1
        );
        assert_eq!(inst.current().message, "Dependencies installed");
    }

    #[test]
    fn test_dependency_failure_short_circuits() {
        let temp = TempDir::new().unwrap();
        let runner = FakeRunner::new();
        let mut inst = installer(&runner, temp.path(), ARCH, Settings::default());
        seed_auth_files(&inst.paths);
        runner.on(&["pacman", "-Q", "tpm2-tss"], CmdResult::failed(1, ""));
        runner.on(&["pacman", "-S"], CmdResult::failed(1, "error: target not found: tpm2-tss\n"));
        let rx = inst.progress().subscribe();

        assert!(!inst.install("contoso.com", true));

        let seen = drain(&rx);
        assert!(seen.iter().all(|p| p.step_number <= InstallStep::InstallDeps.number()));
        let last = seen.last().unwrap();
        assert_eq!(last.status, InstallStatus::Failed);
        assert_eq!(last.message, "Failed to install dependencies");
        assert_eq!(last.error.as_deref(), Some("error: target not found: tpm2-tss"));

        assert_eq!(runner.count(&["git"]), 0);
        assert_eq!(runner.count(&["cargo"]), 0);
        assert_eq!(runner.count(&["python3"]), 0);
        assert_eq!(runner.count(&["systemctl", "start"]), 0);
        assert!(!HostPaths::backup_of(&inst.paths.nsswitch).exists());
        assert!(!inst.rollback());
    }

    #[test]
    fn test_unsupported_distro_fails_first_step() {
        let temp = TempDir::new().unwrap();
        let runner = FakeRunner::new();
        let mut inst = installer(
            &runner,
            temp.path(),
            "NAME=\"Fedora Linux\"\nID=fedora\nVERSION_ID=40\n",
            Settings::default(),
        );

        let err = inst.check_system().unwrap_err();
        assert_eq!(err.step, InstallStep::CheckSystem);
        assert_eq!(err.message, "Unsupported distribution: Fedora Linux");
        assert_eq!(err.detail.as_deref(), Some("Distribution not supported"));
        assert_eq!(inst.current().status, InstallStatus::Failed);
    }

    #[test]
    fn test_debian_has_no_package_manager_yet() {
        let temp = TempDir::new().unwrap();
        let runner = FakeRunner::new();
        let mut inst = installer(&runner, temp.path(), "NAME=Debian\nID=debian\n", Settings::default());

        let err = inst.check_system().unwrap_err();
        assert_eq!(err.message, "No package manager available");
    }

    #[test]
    fn test_steps_need_system_check() {
        let temp = TempDir::new().unwrap();
        let runner = FakeRunner::new();
        let mut inst = installer(&runner, temp.path(), ARCH, Settings::default());

        assert_eq!(inst.install_gdm().unwrap_err().message, "System not checked");
        assert_eq!(
            inst.install_dependencies().unwrap_err().message,
            "No package manager available"
        );
        assert_eq!(
            inst.start_services().unwrap_err().message,
            "Failed to start services"
        );
    }

    #[test]
    fn test_full_install_then_rollback() {
        let temp = TempDir::new().unwrap();
        let runner = FakeRunner::new();
        let log_dir = temp.path().join("runs");
        let mut inst = installer(&runner, temp.path(), ARCH, Settings::default())
            .with_run_log(RunLog::new(&log_dir));
        let paths = inst.paths.clone();
        seed_auth_files(&paths);
        working_host(&runner, &paths);
        let rx = inst.progress().subscribe();

        assert!(inst.install("contoso.com", false));

        let seen = drain(&rx);
        let steps: Vec<u32> = seen.iter().map(|p| p.step_number).collect();
        assert!(steps.windows(2).all(|w| w[0] <= w[1]));
        assert!(seen
            .iter()
            .any(|p| p.current_step == InstallStep::BuildHimmelblau && p.message == "Compiling himmelblau..."));
        let last = seen.last().unwrap();
        assert_eq!(last.status, InstallStatus::Completed);
        assert_eq!(last.message, "Installation complete!");
        assert_eq!(last.percent, 100);

        let conf = fs::read_to_string(&paths.identity_conf).unwrap();
        assert!(conf.contains("domains = contoso.com\n"));
        assert!(conf.contains("local_groups = users\n"));

        let record = RunLog::new(&log_dir).latest().unwrap().unwrap();
        assert_eq!(record.status, InstallStatus::Completed);
        assert_eq!(record.failed_step, None);

        assert!(inst.rollback());
        assert_eq!(
            fs::read_to_string(&paths.nsswitch).unwrap(),
            "passwd: files\ngroup: files\n"
        );
        assert!(!paths.identity_conf.exists());
    }

    #[test]
    fn test_configured_system_skips_remaining_steps() {
        let temp = TempDir::new().unwrap();
        let runner = FakeRunner::new();
        let mut inst = installer(&runner, temp.path(), ARCH, Settings::default());
        let paths = inst.paths.clone();
        for (file, text) in [
            (&paths.nsswitch, "passwd: files himmelblau\n"),
            (&paths.pam_system_auth, "auth sufficient pam_himmelblau.so\n"),
            (&paths.identity_conf, "domains = contoso.com\n"),
            (&paths.daemon_binary(), ""),
        ] {
            fs::create_dir_all(file.parent().unwrap()).unwrap();
            fs::write(file, text).unwrap();
        }

        assert!(inst.install("contoso.com", true));
        assert_eq!(inst.current().message, "System already configured");
        assert_eq!(inst.current().status, InstallStatus::Completed);
        assert_eq!(runner.count(&["pacman", "-S"]), 0);
        assert_eq!(runner.count(&["git"]), 0);
        assert_eq!(runner.count(&["systemctl", "enable"]), 0);
    }

    #[test]
    fn test_cancel_before_next_step() {
        let temp = TempDir::new().unwrap();
        let runner = FakeRunner::new();
        let mut inst = installer(&runner, temp.path(), ARCH, Settings::default());
        let cancel = inst.cancel_handle();
        inst.progress().on_progress(move |p: &InstallProgress| {
            if p.message.starts_with("System compatible") {
                cancel.store(true, Ordering::SeqCst);
            }
        });

        assert!(!inst.install("contoso.com", true));
        let last = inst.current();
        assert_eq!(last.status, InstallStatus::Cancelled);
        assert_eq!(last.current_step, InstallStep::InstallGdm);
    }

    #[test]
    fn test_worker_turns_panic_into_failed_snapshot() {
        let temp = TempDir::new().unwrap();
        let runner = FakeRunner::new();
        runner.on_with(|cmd| {
            if cmd.starts_with(&["pacman", "-Q", "tpm2-tss"]) {
                panic!("package query exploded");
            }
            None
        });
        let inst = installer(&runner, temp.path(), ARCH, Settings::default());
        let rx = inst.progress().subscribe();

        let (inst, ok) = inst
            .spawn_install("contoso.com".into(), true)
            .unwrap()
            .join()
            .unwrap();

        assert!(!ok);
        let last = drain(&rx).pop().unwrap();
        assert_eq!(last.status, InstallStatus::Failed);
        assert_eq!(last.current_step, InstallStep::InstallDeps);
        assert_eq!(last.error.as_deref(), Some("package query exploded"));
        assert_eq!(inst.current(), last);
    }
}
