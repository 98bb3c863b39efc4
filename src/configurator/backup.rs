//! Pre-mutation backups of system files.
//!
//! A backup sits next to its file with [`BACKUP_SUFFIX`](crate::config::BACKUP_SUFFIX).
//! The first backup wins: once it exists it is never replaced, so a second
//! install cannot overwrite the pristine copy with an already-edited file.
//! Restores copy the backup back and leave it in place.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::HostPaths;
use crate::privilege::PrivilegeSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupOutcome {
    Created,
    AlreadyPresent,
    /// Nothing to back up: the file does not exist.
    NoSource,
}

/// Copy `path` to its backup unless a backup already exists.
pub fn backup_file(session: &PrivilegeSession, path: &Path) -> Result<BackupOutcome> {
    let backup = HostPaths::backup_of(path);
    if backup.exists() {
        debug!("backup {} already present", backup.display());
        return Ok(BackupOutcome::AlreadyPresent);
    }
    if !path.exists() {
        return Ok(BackupOutcome::NoSource);
    }
    session
        .copy(path, &backup)
        .with_context(|| format!("backing up {}", path.display()))?;
    info!("backed up {} to {}", path.display(), backup.display());
    Ok(BackupOutcome::Created)
}

/// Copy the backup of `path` back over it and confirm the bytes match.
pub fn restore_file(session: &PrivilegeSession, path: &Path) -> Result<()> {
    let backup = HostPaths::backup_of(path);
    if !backup.exists() {
        bail!("no backup for {}", path.display());
    }
    session
        .copy(&backup, path)
        .with_context(|| format!("restoring {}", path.display()))?;

    match (sha256_file(&backup), sha256_file(path)) {
        (Ok(expected), Ok(actual)) if expected != actual => {
            bail!("restored {} does not match its backup", path.display())
        }
        (Ok(_), Ok(_)) => {}
        (Err(e), _) | (_, Err(e)) => warn!("cannot verify restore of {}: {e:#}", path.display()),
    }
    info!("restored {} from backup", path.display());
    Ok(())
}

fn sha256_file(path: &Path) -> Result<String> {
    let bytes = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupEntry {
    pub label: &'static str,
    pub file: PathBuf,
    pub backup: PathBuf,
    pub present: bool,
}

/// Backups of the files we edit, present or not.
pub fn backup_inventory(paths: &HostPaths) -> Vec<BackupEntry> {
    [("NSS", &paths.nsswitch), ("PAM", &paths.pam_system_auth)]
        .into_iter()
        .map(|(label, file)| {
            let backup = HostPaths::backup_of(file);
            BackupEntry {
                label,
                file: file.clone(),
                present: backup.exists(),
                backup,
            }
        })
        .collect()
}
