//! Backup-guarded mutation of the host's authentication setup.
//!
//! Every file we edit is backed up first (see [`backup`]), written through
//! an exclusively created staging file and copied into place with
//! elevation. If an NSS or PAM write fails, the backup is put back before
//! the error is returned. A failed identity config write puts the previous
//! content back from memory.
//!
//! [`SystemConfigurator::configure_all`] stops at the first failing action
//! and does not roll back; the caller decides. [`SystemConfigurator::rollback`]
//! is the opposite: it attempts every step and reports what failed.
//!
//! No file locks are taken. Two instances working on one host will race.

pub mod backup;
pub mod identity_conf;
pub mod nss;
pub mod pam;
pub mod units;

use std::fmt;
use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{HostPaths, Settings};
use crate::privilege::PrivilegeSession;
use crate::process::Cmd;
use crate::validator::{DAEMON_SERVICE, TASKS_SERVICE};

pub use backup::{backup_inventory, BackupEntry, BackupOutcome};
pub use identity_conf::IdentityConfig;

const GENERATOR_TIMEOUT_SECS: u64 = 30;
const CACHE_ROOT_MODE: u32 = 0o755;
const DBUS_MODE: u32 = 0o644;
const STAGED_MODE: u32 = 0o644;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigAction {
    CacheDirectories,
    Nss,
    Pam,
    Services,
    IdentityConfig,
    StartServices,
    StopServices,
    RestartServices,
    RestoreBackups,
}

impl fmt::Display for ConfigAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConfigAction::CacheDirectories => "create cache directories",
            ConfigAction::Nss => "configure NSS",
            ConfigAction::Pam => "configure PAM",
            ConfigAction::Services => "install services",
            ConfigAction::IdentityConfig => "create configuration",
            ConfigAction::StartServices => "start services",
            ConfigAction::StopServices => "stop services",
            ConfigAction::RestartServices => "restart services",
            ConfigAction::RestoreBackups => "restore backups",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
#[error("Failed to {action}: {detail}")]
pub struct ConfigError {
    pub action: ConfigAction,
    pub detail: String,
}

impl ConfigError {
    fn new(action: ConfigAction, err: anyhow::Error) -> Self {
        Self {
            action,
            detail: format!("{err:#}"),
        }
    }
}

/// Outcome of a best-effort reversal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RollbackReport {
    pub attempted: Vec<String>,
    /// Failed steps that leave the host's authentication setup unrestored.
    pub failures: Vec<String>,
    /// Failed cleanup steps; logged, not fatal.
    pub warnings: Vec<String>,
}

impl RollbackReport {
    fn record(&mut self, step: &str, critical: bool, result: Result<()>) {
        self.attempted.push(step.to_string());
        if let Err(e) = result {
            let line = format!("{step}: {e:#}");
            warn!("rollback: {line}");
            if critical {
                self.failures.push(line);
            } else {
                self.warnings.push(line);
            }
        }
    }

    /// Every restore step succeeded.
    pub fn restored(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn all_ok(&self) -> bool {
        self.failures.is_empty() && self.warnings.is_empty()
    }
}

pub struct SystemConfigurator {
    session: Arc<PrivilegeSession>,
    paths: HostPaths,
    repo_url: String,
    clone_timeout: Duration,
    service_timeout: Duration,
}

impl SystemConfigurator {
    pub fn new(session: Arc<PrivilegeSession>, paths: HostPaths, settings: &Settings) -> Self {
        Self {
            session,
            paths,
            repo_url: settings.repo_url.clone(),
            clone_timeout: settings.clone_timeout(),
            service_timeout: settings.service_timeout(),
        }
    }

    pub fn paths(&self) -> &HostPaths {
        &self.paths
    }

    fn systemctl(&self, args: &[&str]) -> Result<()> {
        let cmd = Cmd::new("systemctl")
            .args(args.iter().copied())
            .timeout(self.service_timeout);
        let what = cmd.to_string();
        let result = self.session.run(cmd).with_context(|| what.clone())?;
        if !result.success() {
            bail!("{what}: {}", result.message_or("failed"));
        }
        Ok(())
    }

    /// Stage `content` in a fresh temp file, then copy it over `target`.
    /// The staged file is removed when it goes out of scope.
    fn write_system_file(&self, target: &Path, content: impl AsRef<[u8]>) -> Result<()> {
        let staging = &self.paths.staging_dir;
        fs::create_dir_all(staging)
            .with_context(|| format!("creating staging dir {}", staging.display()))?;
        let name = target
            .file_name()
            .ok_or_else(|| anyhow!("{} has no file name", target.display()))?;
        let mut staged = tempfile::Builder::new()
            .prefix("lintune-")
            .suffix(&format!("-{}", name.to_string_lossy()))
            .tempfile_in(staging)
            .with_context(|| format!("staging {} in {}", target.display(), staging.display()))?;
        staged
            .write_all(content.as_ref())
            .and_then(|()| staged.flush())
            .with_context(|| format!("writing {}", staged.path().display()))?;
        fs::set_permissions(staged.path(), fs::Permissions::from_mode(STAGED_MODE))
            .with_context(|| format!("setting mode on {}", staged.path().display()))?;

        self.session.copy(staged.path(), target)
    }

    /// Back up, write, and put the backup back if the write fails.
    fn replace_guarded(&self, target: &Path, content: &str) -> Result<()> {
        let outcome = backup::backup_file(&self.session, target)?;
        if let Err(e) = self.write_system_file(target, content) {
            if outcome != BackupOutcome::NoSource {
                if let Err(restore) = backup::restore_file(&self.session, target) {
                    warn!("restoring {} after failed write: {restore:#}", target.display());
                }
            }
            return Err(e);
        }
        Ok(())
    }

    pub fn create_cache_directories(&self) -> Result<(), ConfigError> {
        for dir in &self.paths.cache_dirs {
            self.session
                .mkdir_p(dir)
                .map_err(|e| ConfigError::new(ConfigAction::CacheDirectories, e))?;
        }
        info!("cache directories ready");
        Ok(())
    }

    /// Add the identity module to `passwd` and `group`. A file that already
    /// mentions it is left untouched.
    pub fn configure_nss(&self) -> Result<(), ConfigError> {
        let err = |e| ConfigError::new(ConfigAction::Nss, e);
        let path = &self.paths.nsswitch;
        let current = fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))
            .map_err(err)?;
        let Some(updated) = nss::rewrite_nsswitch(&current) else {
            info!("{} already configured", path.display());
            return Ok(());
        };
        self.replace_guarded(path, &updated).map_err(err)?;
        info!("configured {}", path.display());
        Ok(())
    }

    /// Replace the active PAM stack with [`pam::PAM_STACK`].
    pub fn configure_pam(&self) -> Result<(), ConfigError> {
        let path = self.paths.active_pam().to_path_buf();
        self.replace_guarded(&path, pam::PAM_STACK)
            .map_err(|e| ConfigError::new(ConfigAction::Pam, e))?;
        info!("configured {}", path.display());
        Ok(())
    }

    /// Generate, patch and install the daemon's units and D-Bus service.
    pub fn install_systemd_services(&self) -> Result<(), ConfigError> {
        self.install_units()
            .map_err(|e| ConfigError::new(ConfigAction::Services, e))
    }

    fn generator_script(&self) -> PathBuf {
        self.paths.build_dir.join("scripts").join("gen_servicefiles.py")
    }

    /// Shallow-clone the sources when the generator is not on disk, as
    /// after a build cleanup or when the daemon was installed earlier.
    fn ensure_sources(&self) -> Result<()> {
        if self.generator_script().exists() {
            return Ok(());
        }
        let build = &self.paths.build_dir;
        self.session.remove_dir_all(build)?;
        info!("fetching service sources into {}", build.display());
        Cmd::new("git")
            .args(["clone", "--depth", "1", &self.repo_url])
            .arg_path(build)
            .timeout(self.clone_timeout)
            .error_msg("fetching service sources")
            .run(self.session.runner())?;
        Ok(())
    }

    fn install_units(&self) -> Result<()> {
        let scratch = &self.paths.services_scratch_dir;
        let build = &self.paths.build_dir;
        self.ensure_sources()?;
        if scratch.exists() {
            fs::remove_dir_all(scratch)
                .with_context(|| format!("clearing {}", scratch.display()))?;
        }

        Cmd::new("python3")
            .arg_path(&self.generator_script())
            .arg("--out-dir")
            .arg_path(scratch)
            .timeout_secs(GENERATOR_TIMEOUT_SECS)
            .error_msg("generating service files")
            .run(self.session.runner())?;

        let generated = units::patch_generated(scratch)?;
        info!(count = generated.len(), "patched generated units");

        self.session.mkdir_p(&self.paths.systemd_dir)?;
        for unit in [units::DAEMON_UNIT, units::TASKS_UNIT] {
            let src = scratch.join(unit);
            if !src.exists() {
                bail!("generator did not produce {unit}");
            }
            self.session.copy(&src, &self.paths.unit_file(unit))?;
        }

        let dbus_src = build
            .join("platform")
            .join("debian")
            .join(units::DBUS_SERVICE);
        let dbus_dst = self.paths.dbus_services_dir.join(units::DBUS_SERVICE);
        self.session.install_file(&dbus_src, &dbus_dst, DBUS_MODE)?;

        self.systemctl(&["daemon-reload"])?;

        // DynamicUser services cannot reach their cache without this.
        if let Err(e) = self.session.chmod(&self.paths.cache_root, CACHE_ROOT_MODE) {
            warn!("{e:#}");
        }
        info!("installed systemd services");
        Ok(())
    }

    pub fn create_himmelblau_config(&self, domain: &str, grant_sudo: bool) -> Result<(), ConfigError> {
        self.save_settings(&IdentityConfig::for_enrollment(domain, grant_sudo))
    }

    /// Write `config` as the identity daemon's configuration file.
    pub fn save_settings(&self, config: &IdentityConfig) -> Result<(), ConfigError> {
        let err = |e| ConfigError::new(ConfigAction::IdentityConfig, e);
        if config.domain.trim().is_empty() {
            return Err(err(anyhow!("domain is required")));
        }
        self.session
            .mkdir_p(&self.paths.identity_conf_dir)
            .map_err(err)?;
        let path = &self.paths.identity_conf;
        let previous = fs::read(path).ok();
        if let Err(e) = self.write_system_file(path, config.render()) {
            self.put_back(path, previous.as_deref());
            return Err(err(e));
        }
        info!(domain = %config.domain, grant_sudo = config.grant_sudo, "wrote identity config");
        Ok(())
    }

    /// Return `path` to `previous`, or remove it if it did not exist.
    fn put_back(&self, path: &Path, previous: Option<&[u8]>) {
        let current = fs::read(path).ok();
        if current.as_deref() == previous {
            return;
        }
        let restored = match previous {
            Some(bytes) => self.write_system_file(path, bytes),
            None => self.session.remove_file(path),
        };
        if let Err(e) = restored {
            warn!("restoring {} after failed write: {e:#}", path.display());
        }
    }

    pub fn load_settings(&self) -> Option<IdentityConfig> {
        let text = fs::read_to_string(&self.paths.identity_conf).ok()?;
        IdentityConfig::parse(&text)
    }

    /// Enable both units and start the daemon; the tasks unit follows it.
    pub fn start_services(&self) -> Result<(), ConfigError> {
        let err = |e| ConfigError::new(ConfigAction::StartServices, e);
        self.systemctl(&["enable", DAEMON_SERVICE, TASKS_SERVICE])
            .map_err(err)?;
        self.systemctl(&["start", DAEMON_SERVICE]).map_err(err)?;
        info!("started {DAEMON_SERVICE}");
        Ok(())
    }

    pub fn restart_services(&self) -> Result<(), ConfigError> {
        self.systemctl(&["restart", DAEMON_SERVICE])
            .map_err(|e| ConfigError::new(ConfigAction::RestartServices, e))
    }

    pub fn stop_services(&self) -> Result<(), ConfigError> {
        self.systemctl(&["stop", DAEMON_SERVICE])
            .map_err(|e| ConfigError::new(ConfigAction::StopServices, e))
    }

    /// Cache dirs, NSS, PAM, services, config, start. Stops at the first
    /// failure without undoing earlier actions.
    pub fn configure_all(&self, domain: &str, grant_sudo: bool) -> Result<(), ConfigError> {
        self.create_cache_directories()?;
        self.configure_nss()?;
        self.configure_pam()?;
        self.install_systemd_services()?;
        self.create_himmelblau_config(domain, grant_sudo)?;
        self.start_services()
    }

    /// Stop the daemon and put back whichever NSS/PAM backups exist.
    pub fn restore_backups(&self) -> Result<(), ConfigError> {
        if let Err(e) = self.stop_services() {
            warn!("{e}");
        }
        for path in [self.paths.nsswitch.clone(), self.paths.active_pam().to_path_buf()] {
            if HostPaths::backup_of(&path).exists() {
                backup::restore_file(&self.session, &path)
                    .map_err(|e| ConfigError::new(ConfigAction::RestoreBackups, e))?;
            }
        }
        Ok(())
    }

    pub fn backup_inventory(&self) -> Vec<BackupEntry> {
        backup_inventory(&self.paths)
    }

    /// Undo the configuration. Every step is attempted.
    pub fn rollback(&self) -> RollbackReport {
        let mut report = RollbackReport::default();
        let services = [DAEMON_SERVICE, TASKS_SERVICE];

        report.record(
            "stop services",
            false,
            self.systemctl(&["stop", services[0], services[1]]),
        );
        report.record(
            "disable services",
            false,
            self.systemctl(&["disable", services[0], services[1]]),
        );

        let mut installed: Vec<PathBuf> = [units::DAEMON_UNIT, units::TASKS_UNIT]
            .iter()
            .map(|unit| self.paths.unit_file(unit))
            .collect();
        installed.push(self.paths.dbus_services_dir.join(units::DBUS_SERVICE));
        for file in &installed {
            report.record(
                &format!("remove {}", file.display()),
                false,
                self.session.remove_file(file),
            );
        }
        report.record("daemon-reload", false, self.systemctl(&["daemon-reload"]));

        report.record(
            "restore NSS",
            true,
            backup::restore_file(&self.session, &self.paths.nsswitch),
        );
        let pam = self.paths.active_pam().to_path_buf();
        report.record("restore PAM", true, backup::restore_file(&self.session, &pam));

        report.record(
            "remove identity config",
            false,
            self.session.remove_file(&self.paths.identity_conf),
        );

        if report.restored() {
            info!("rollback complete");
        } else {
            warn!(failures = report.failures.len(), "rollback incomplete");
        }
        report
    }

    /// Roll back, then delete binaries, caches and the build tree.
    pub fn full_uninstall(&self) -> RollbackReport {
        let mut report = self.rollback();
        for (artifact, dest) in &self.paths.binaries {
            report.record(
                &format!("remove {artifact}"),
                false,
                self.session.remove_file(dest),
            );
        }
        for dir in self.paths.cache_dirs.iter().chain([&self.paths.build_dir]) {
            report.record(
                &format!("remove {}", dir.display()),
                false,
                self.session.remove_dir_all(dir),
            );
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{CmdResult, CommandRunner};
    use crate::testing::FakeRunner;
    use tempfile::TempDir;

    const STOCK_NSS: &str = "passwd: files systemd\ngroup: files [SUCCESS=merge] systemd\nhosts: files dns\n";
    const STOCK_PAM: &str = "#%PAM-1.0\nauth required pam_unix.so\n";

    struct Host {
        temp: TempDir,
        runner: FakeRunner,
        cfg: SystemConfigurator,
    }

    fn host() -> Host {
        let temp = TempDir::new().unwrap();
        let paths = HostPaths::rooted(temp.path());
        for (path, text) in [(&paths.nsswitch, STOCK_NSS), (&paths.pam_system_auth, STOCK_PAM)] {
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, text).unwrap();
        }
        fs::create_dir_all(&paths.cache_root).unwrap();

        let runner = FakeRunner::new();
        let scratch = paths.services_scratch_dir.clone();
        runner.on_with(move |cmd| {
            cmd.starts_with(&["python3"]).then(|| {
                fs::create_dir_all(&scratch).unwrap();
                fs::write(
                    scratch.join(units::DAEMON_UNIT),
                    "[Service]\nLoadCredentialEncrypted=pin\n",
                )
                .unwrap();
                fs::write(scratch.join(units::TASKS_UNIT), "[Service]\n").unwrap();
                Ok(CmdResult::ok(""))
            })
        });
        let dbus = paths
            .build_dir
            .join("platform/debian")
            .join(units::DBUS_SERVICE);
        fs::create_dir_all(dbus.parent().unwrap()).unwrap();
        fs::write(&dbus, "[D-BUS Service]\n").unwrap();
        let script = paths.build_dir.join("scripts/gen_servicefiles.py");
        fs::create_dir_all(script.parent().unwrap()).unwrap();
        fs::write(&script, "").unwrap();

        let handle: Arc<dyn CommandRunner> = Arc::new(runner.clone());
        let cfg = SystemConfigurator::new(
            Arc::new(PrivilegeSession::direct(handle)),
            paths,
            &Settings::default(),
        );
        Host {
            temp,
            runner,
            cfg,
        }
    }

    fn snapshot(cfg: &SystemConfigurator) -> Vec<(PathBuf, Option<Vec<u8>>)> {
        let p = cfg.paths();
        [
            p.nsswitch.clone(),
            p.pam_system_auth.clone(),
            p.identity_conf.clone(),
            p.unit_file(units::DAEMON_UNIT),
            p.unit_file(units::TASKS_UNIT),
            p.dbus_services_dir.join(units::DBUS_SERVICE),
        ]
        .into_iter()
        .map(|path| {
            let bytes = fs::read(&path).ok();
            (path, bytes)
        })
        .collect()
    }

    #[test]
    fn test_configure_nss_writes_exact_lines_and_backup() {
        let h = host();
        h.cfg.configure_nss().unwrap();
        let text = fs::read_to_string(&h.cfg.paths().nsswitch).unwrap();
        assert_eq!(
            text,
            "passwd: files systemd himmelblau\n\
             group: files [SUCCESS=merge] systemd himmelblau\n\
             hosts: files dns\n"
        );
        let backup = HostPaths::backup_of(&h.cfg.paths().nsswitch);
        assert_eq!(fs::read_to_string(backup).unwrap(), STOCK_NSS);
    }

    #[test]
    fn test_configure_nss_already_configured_is_untouched() {
        let h = host();
        let path = h.cfg.paths().nsswitch.clone();
        let configured = b"passwd: files himmelblau\r\ngroup: files\r\n";
        fs::write(&path, configured).unwrap();

        h.cfg.configure_nss().unwrap();
        assert_eq!(fs::read(&path).unwrap(), configured);
    }

    #[test]
    fn test_configure_pam_replaces_stack() {
        let h = host();
        h.cfg.configure_pam().unwrap();
        let p = h.cfg.paths();
        assert_eq!(fs::read_to_string(&p.pam_system_auth).unwrap(), pam::PAM_STACK);
        assert_eq!(
            fs::read_to_string(HostPaths::backup_of(&p.pam_system_auth)).unwrap(),
            STOCK_PAM
        );
    }

    /// Same host, but staging lands on a regular file and always fails.
    fn broken_staging(h: &Host) -> SystemConfigurator {
        let mut paths = h.cfg.paths().clone();
        paths.staging_dir = h.temp.path().join("staging-is-a-file");
        fs::write(&paths.staging_dir, "").unwrap();
        let handle: Arc<dyn CommandRunner> = Arc::new(h.runner.clone());
        SystemConfigurator::new(
            Arc::new(PrivilegeSession::direct(handle)),
            paths,
            &Settings::default(),
        )
    }

    #[test]
    fn test_failed_write_restores_backup() {
        let h = host();
        let cfg = broken_staging(&h);
        let pam = cfg.paths().pam_system_auth.clone();

        let err = cfg.configure_pam().unwrap_err();
        assert_eq!(err.action, ConfigAction::Pam);
        assert_eq!(fs::read_to_string(&pam).unwrap(), STOCK_PAM);
        assert!(HostPaths::backup_of(&pam).exists());
    }

    #[test]
    fn test_failed_nss_write_restores_backup() {
        let h = host();
        let cfg = broken_staging(&h);
        let nss = cfg.paths().nsswitch.clone();

        let err = cfg.configure_nss().unwrap_err();
        assert_eq!(err.action, ConfigAction::Nss);
        assert_eq!(fs::read_to_string(&nss).unwrap(), STOCK_NSS);
        assert_eq!(
            fs::read_to_string(HostPaths::backup_of(&nss)).unwrap(),
            STOCK_NSS
        );
    }

    #[test]
    fn test_failed_identity_config_write_keeps_previous() {
        let h = host();
        h.cfg.create_himmelblau_config("contoso.com", true).unwrap();
        let conf = h.cfg.paths().identity_conf.clone();
        let before = fs::read(&conf).unwrap();

        let cfg = broken_staging(&h);
        let err = cfg.create_himmelblau_config("fabrikam.com", false).unwrap_err();
        assert_eq!(err.action, ConfigAction::IdentityConfig);
        assert_eq!(fs::read(&conf).unwrap(), before);
        assert_eq!(cfg.load_settings().unwrap().domain, "contoso.com");
    }

    #[test]
    fn test_failed_identity_config_write_leaves_no_file() {
        let h = host();
        let cfg = broken_staging(&h);

        assert!(cfg.create_himmelblau_config("contoso.com", true).is_err());
        assert!(!cfg.paths().identity_conf.exists());
    }

    #[test]
    fn test_staging_ignores_planted_symlink() {
        let h = host();
        let p = h.cfg.paths();
        let victim = h.temp.path().join("victim.txt");
        fs::write(&victim, "precious").unwrap();
        fs::create_dir_all(&p.staging_dir).unwrap();
        std::os::unix::fs::symlink(&victim, p.staging_dir.join("system-auth")).unwrap();

        h.cfg.configure_pam().unwrap();

        assert_eq!(fs::read_to_string(&victim).unwrap(), "precious");
        assert_eq!(fs::read_to_string(&p.pam_system_auth).unwrap(), pam::PAM_STACK);
        let leftovers: Vec<_> = fs::read_dir(&p.staging_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with("lintune-"))
            .collect();
        assert!(leftovers.is_empty(), "{leftovers:?}");
    }

    #[test]
    fn test_configure_all_and_rollback_twice() {
        let h = host();
        h.cfg.configure_all("contoso.com", true).unwrap();

        let p = h.cfg.paths();
        let daemon_unit = fs::read_to_string(p.unit_file(units::DAEMON_UNIT)).unwrap();
        assert!(daemon_unit.contains("#LoadCredentialEncrypted=pin"));
        assert!(p.dbus_services_dir.join(units::DBUS_SERVICE).exists());
        assert_eq!(h.cfg.load_settings().unwrap().domain, "contoso.com");
        assert!(p.cache_dirs.iter().all(|d| d.is_dir()));
        assert_eq!(
            h.runner
                .count(&["systemctl", "enable", "himmelblaud", "himmelblaud-tasks"]),
            1
        );
        assert_eq!(h.runner.count(&["systemctl", "start", "himmelblaud"]), 1);
        assert_eq!(h.runner.count(&["systemctl", "start", "himmelblaud-tasks"]), 0);

        let first = h.cfg.rollback();
        assert!(first.all_ok(), "{first:?}");
        let after_once = snapshot(&h.cfg);

        let second = h.cfg.rollback();
        assert!(second.restored());
        assert_eq!(snapshot(&h.cfg), after_once);

        assert_eq!(fs::read_to_string(&p.nsswitch).unwrap(), STOCK_NSS);
        assert_eq!(fs::read_to_string(&p.pam_system_auth).unwrap(), STOCK_PAM);
        assert!(!p.identity_conf.exists());
        assert!(!p.unit_file(units::DAEMON_UNIT).exists());
    }

    #[test]
    fn test_configure_all_stops_at_first_failure() {
        let h = host();
        h.runner.on(&["python3"], CmdResult::failed(1, "no such script"));

        let err = h.cfg.configure_all("contoso.com", false).unwrap_err();
        assert_eq!(err.action, ConfigAction::Services);
        assert!(err.to_string().contains("no such script"));
        assert!(!h.cfg.paths().identity_conf.exists());
        assert_eq!(h.runner.count(&["systemctl", "enable"]), 0);
    }

    #[test]
    fn test_missing_sources_are_fetched() {
        let h = host();
        let p = h.cfg.paths().clone();
        fs::remove_dir_all(&p.build_dir).unwrap();
        let build = p.build_dir.clone();
        h.runner.on_with(move |cmd| {
            cmd.starts_with(&["git", "clone", "--depth", "1"]).then(|| {
                let dbus = build.join("platform/debian").join(units::DBUS_SERVICE);
                fs::create_dir_all(dbus.parent().unwrap()).unwrap();
                fs::write(dbus, "").unwrap();
                fs::create_dir_all(build.join("scripts")).unwrap();
                fs::write(build.join("scripts/gen_servicefiles.py"), "").unwrap();
                Ok(CmdResult::ok(""))
            })
        });

        h.cfg.install_systemd_services().unwrap();
        assert_eq!(h.runner.count(&["git", "clone"]), 1);
        assert!(p.unit_file(units::TASKS_UNIT).exists());

        h.cfg.install_systemd_services().unwrap();
        assert_eq!(h.runner.count(&["git", "clone"]), 1);
    }

    #[test]
    fn test_rollback_attempts_everything_despite_failures() {
        let h = host();
        h.runner.on(&["systemctl"], CmdResult::failed(5, "Unit not loaded"));

        let report = h.cfg.rollback();
        assert!(!report.restored());
        assert_eq!(report.failures.len(), 2);
        assert!(report.attempted.iter().any(|s| s == "remove identity config"));
        assert_eq!(report.attempted.len(), 9);
    }

    #[test]
    fn test_full_uninstall_removes_binaries_and_caches() {
        let h = host();
        let p = h.cfg.paths().clone();
        for (_, dest) in &p.binaries {
            fs::create_dir_all(dest.parent().unwrap()).unwrap();
            fs::write(dest, "").unwrap();
        }
        h.cfg.create_cache_directories().unwrap();

        h.cfg.full_uninstall();
        assert!(p.binaries.iter().all(|(_, d)| !d.exists()));
        assert!(p.cache_dirs.iter().all(|d| !d.exists()));
        assert!(!p.build_dir.exists());
    }

    #[test]
    fn test_save_settings_requires_domain() {
        let h = host();
        let config = IdentityConfig::for_enrollment("  ", true);
        assert_eq!(
            h.cfg.save_settings(&config).unwrap_err().action,
            ConfigAction::IdentityConfig
        );
    }

    #[test]
    fn test_restore_backups_only_existing() {
        let h = host();
        h.cfg.configure_nss().unwrap();
        h.cfg.restore_backups().unwrap();
        assert_eq!(
            fs::read_to_string(&h.cfg.paths().nsswitch).unwrap(),
            STOCK_NSS
        );
        assert_eq!(h.runner.count(&["systemctl", "stop", "himmelblaud"]), 1);
    }
}
