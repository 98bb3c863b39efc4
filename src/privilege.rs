//! Privilege elevation for commands that touch system state.
//!
//! A [`PrivilegeSession`] is created once by whoever drives the workflow and
//! handed to every component that needs root. It owns the elevation strategy
//! and, for `sudo`, the cached credential. Nothing here is global: dropping
//! the session or calling [`PrivilegeSession::invalidate`] forgets the secret.
//!
//! Modes:
//! - [`ElevationMode::Direct`]: commands run as-is (we are already root, or a
//!   test redirected every path into a scratch directory).
//! - [`ElevationMode::Sudo`]: `sudo -S` with the cached secret on stdin. The
//!   sudo timestamp is refreshed before every call so long builds do not
//!   trigger a re-prompt halfway through.
//! - [`ElevationMode::Pkexec`]: polkit prompts on every call.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::process::{Cmd, CmdError, CmdResult, CommandRunner};

const VALIDATE_TIMEOUT_SECS: u64 = 5;
const FILE_OP_TIMEOUT_SECS: u64 = 30;

/// Check if we're running as root.
pub fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElevationMode {
    Direct,
    Sudo,
    Pkexec,
}

pub struct PrivilegeSession {
    runner: Arc<dyn CommandRunner>,
    mode: ElevationMode,
    credential: Mutex<Option<String>>,
}

impl PrivilegeSession {
    pub fn new(runner: Arc<dyn CommandRunner>, mode: ElevationMode) -> Self {
        Self {
            runner,
            mode,
            credential: Mutex::new(None),
        }
    }

    /// `preferred` unless the process already runs as root.
    pub fn for_host(runner: Arc<dyn CommandRunner>, preferred: ElevationMode) -> Self {
        let mode = if is_root() {
            ElevationMode::Direct
        } else {
            preferred
        };
        Self::new(runner, mode)
    }

    pub fn direct(runner: Arc<dyn CommandRunner>) -> Self {
        Self::new(runner, ElevationMode::Direct)
    }

    pub fn mode(&self) -> ElevationMode {
        self.mode
    }

    /// Runner for commands that need no elevation.
    pub fn runner(&self) -> &dyn CommandRunner {
        self.runner.as_ref()
    }

    pub fn runner_handle(&self) -> Arc<dyn CommandRunner> {
        Arc::clone(&self.runner)
    }

    pub fn is_validated(&self) -> bool {
        match self.mode {
            ElevationMode::Sudo => self.cached_secret().is_some(),
            ElevationMode::Direct | ElevationMode::Pkexec => true,
        }
    }

    /// Check `secret` against sudo and cache it on success.
    ///
    /// The first successful validation wins: while a credential is cached,
    /// further calls return true without replacing it.
    pub fn validate(&self, secret: &str) -> bool {
        if self.mode != ElevationMode::Sudo {
            return true;
        }
        let mut credential = self.credential.lock().unwrap_or_else(|e| e.into_inner());
        if credential.is_some() {
            return true;
        }

        let check = Cmd::new("sudo")
            .args(["-S", "-k", "true"])
            .stdin(format!("{secret}\n"))
            .timeout_secs(VALIDATE_TIMEOUT_SECS);
        match self.runner.exec(&check) {
            Ok(result) if result.success() => {
                *credential = Some(secret.to_string());
                drop(credential);
                self.refresh();
                info!("sudo credential validated");
                true
            }
            Ok(_) => {
                warn!("sudo rejected the supplied credential");
                false
            }
            Err(e) => {
                warn!("sudo validation failed: {e}");
                false
            }
        }
    }

    /// Forget the cached credential and drop the sudo timestamp.
    pub fn invalidate(&self) {
        let had_secret = self
            .credential
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .is_some();
        if self.mode == ElevationMode::Sudo {
            let _ = self
                .runner
                .exec(&Cmd::new("sudo").arg("-k").timeout_secs(VALIDATE_TIMEOUT_SECS));
        }
        if had_secret {
            info!("sudo credential cleared");
        }
    }

    /// Run `cmd` with elevated privileges.
    pub fn run(&self, cmd: Cmd) -> Result<CmdResult, CmdError> {
        let elevated = match self.mode {
            ElevationMode::Direct => cmd,
            ElevationMode::Pkexec => cmd.wrapped("pkexec", &[]),
            ElevationMode::Sudo => match self.cached_secret() {
                Some(secret) => {
                    self.refresh();
                    let input = match cmd.get_stdin() {
                        Some(existing) => format!("{secret}\n{existing}"),
                        None => format!("{secret}\n"),
                    };
                    cmd.wrapped("sudo", &["-S"]).stdin(input)
                }
                // No cached secret: only succeeds if sudo needs no password.
                None => cmd.wrapped("sudo", &["-n"]),
            },
        };
        debug!(command = %elevated, "privileged");
        self.runner.exec(&elevated)
    }

    fn cached_secret(&self) -> Option<String> {
        self.credential
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn refresh(&self) -> bool {
        let Some(secret) = self.cached_secret() else {
            return false;
        };
        let refresh = Cmd::new("sudo")
            .args(["-S", "-v"])
            .stdin(format!("{secret}\n"))
            .timeout_secs(VALIDATE_TIMEOUT_SECS);
        self.runner
            .exec(&refresh)
            .map(|r| r.success())
            .unwrap_or(false)
    }

    fn checked(&self, cmd: Cmd, what: &str) -> Result<()> {
        let result = self.run(cmd).with_context(|| what.to_string())?;
        if !result.success() {
            bail!("{}: {}", what, result.message_or("command failed"));
        }
        Ok(())
    }

    /// Copy `src` over `dst`. The destination directory must exist.
    pub fn copy(&self, src: &Path, dst: &Path) -> Result<()> {
        let what = format!("copying {} to {}", src.display(), dst.display());
        if self.mode == ElevationMode::Direct {
            fs::copy(src, dst).with_context(|| what)?;
            return Ok(());
        }
        self.checked(
            Cmd::new("cp")
                .arg_path(src)
                .arg_path(dst)
                .timeout_secs(FILE_OP_TIMEOUT_SECS),
            &what,
        )
    }

    /// Install `src` at `dst` with `mode`, creating parent directories.
    pub fn install_file(&self, src: &Path, dst: &Path, mode: u32) -> Result<()> {
        let what = format!("installing {} to {}", src.display(), dst.display());
        if self.mode == ElevationMode::Direct {
            if let Some(parent) = dst.parent() {
                fs::create_dir_all(parent).with_context(|| what.clone())?;
            }
            fs::copy(src, dst).with_context(|| what.clone())?;
            fs::set_permissions(dst, fs::Permissions::from_mode(mode)).with_context(|| what)?;
            return Ok(());
        }
        self.checked(
            Cmd::new("install")
                .args(["-D", "-m", &format!("{mode:o}")])
                .arg_path(src)
                .arg_path(dst)
                .timeout_secs(FILE_OP_TIMEOUT_SECS),
            &what,
        )
    }

    pub fn mkdir_p(&self, dir: &Path) -> Result<()> {
        let what = format!("creating directory {}", dir.display());
        if self.mode == ElevationMode::Direct {
            fs::create_dir_all(dir).with_context(|| what)?;
            return Ok(());
        }
        self.checked(
            Cmd::new("mkdir")
                .arg("-p")
                .arg_path(dir)
                .timeout_secs(FILE_OP_TIMEOUT_SECS),
            &what,
        )
    }

    /// Remove a file. A missing file is not an error.
    pub fn remove_file(&self, path: &Path) -> Result<()> {
        let what = format!("removing {}", path.display());
        if self.mode == ElevationMode::Direct {
            return match fs::remove_file(path) {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                    Err(e).with_context(|| what)
                }
                _ => Ok(()),
            };
        }
        self.checked(
            Cmd::new("rm")
                .arg("-f")
                .arg_path(path)
                .timeout_secs(FILE_OP_TIMEOUT_SECS),
            &what,
        )
    }

    /// Remove a directory tree. A missing directory is not an error.
    pub fn remove_dir_all(&self, path: &Path) -> Result<()> {
        let what = format!("removing directory {}", path.display());
        if self.mode == ElevationMode::Direct {
            return match fs::remove_dir_all(path) {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                    Err(e).with_context(|| what)
                }
                _ => Ok(()),
            };
        }
        self.checked(
            Cmd::new("rm")
                .arg("-rf")
                .arg_path(path)
                .timeout_secs(FILE_OP_TIMEOUT_SECS),
            &what,
        )
    }

    pub fn chmod(&self, path: &Path, mode: u32) -> Result<()> {
        let what = format!("changing mode of {} to {mode:o}", path.display());
        if self.mode == ElevationMode::Direct {
            fs::set_permissions(path, fs::Permissions::from_mode(mode)).with_context(|| what)?;
            return Ok(());
        }
        self.checked(
            Cmd::new("chmod")
                .arg(format!("{mode:o}"))
                .arg_path(path)
                .timeout_secs(FILE_OP_TIMEOUT_SECS),
            &what,
        )
    }
}
