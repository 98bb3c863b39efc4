//! Persistent records of composed install runs.
//!
//! Each run is one pretty-printed JSON file named after its run id under
//! `$XDG_DATA_HOME/lintune/runs/`. The record is written when the run starts
//! and rewritten when it ends, so a crashed run is left `in_progress`.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use super::progress::{InstallProgress, InstallStatus, InstallStep};

static RUN_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub status: InstallStatus,
    pub domain: String,
    pub created_at_utc: String,
    pub finished_at_utc: Option<String>,
    pub failed_step: Option<InstallStep>,
    pub message: String,
}

impl RunRecord {
    fn sort_key(&self) -> (&str, &str) {
        (
            self.finished_at_utc.as_deref().unwrap_or(&self.created_at_utc),
            &self.run_id,
        )
    }
}

/// Sortable, process-unique id: base62 of time, pid and a counter.
pub fn new_run_id() -> Result<String> {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock before UNIX epoch")?
        .as_nanos();
    let pid = (std::process::id() as u128 & 0xFFFF) << 16;
    let seq = RUN_COUNTER.fetch_add(1, Ordering::Relaxed) as u128 & 0xFFFF;
    Ok(base62((nanos << 32) | pid | seq))
}

fn base62(mut value: u128) -> String {
    const ALPHABET: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while value > 0 {
        digits.push(ALPHABET[(value % 62) as usize] as char);
        value /= 62;
    }
    digits.iter().rev().collect()
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .context("formatting timestamp")
}

pub struct RunLog {
    dir: PathBuf,
}

impl RunLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn default_dir() -> Option<PathBuf> {
        dirs::data_local_dir().map(|dir| dir.join("lintune").join("runs"))
    }

    pub fn for_user() -> Option<Self> {
        Self::default_dir().map(Self::new)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_of(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("{run_id}.json"))
    }

    /// Create and persist an `in_progress` record.
    pub fn begin(&self, domain: &str) -> Result<RunRecord> {
        let record = RunRecord {
            run_id: new_run_id()?,
            status: InstallStatus::InProgress,
            domain: domain.to_string(),
            created_at_utc: now_rfc3339()?,
            finished_at_utc: None,
            failed_step: None,
            message: String::new(),
        };
        self.write(&record)?;
        Ok(record)
    }

    /// Close `record` with the final snapshot and persist it.
    pub fn finish(&self, record: &mut RunRecord, last: &InstallProgress) -> Result<()> {
        record.status = last.status;
        record.finished_at_utc = Some(now_rfc3339()?);
        record.failed_step = matches!(last.status, InstallStatus::Failed | InstallStatus::Cancelled)
            .then_some(last.current_step);
        record.message = match &last.error {
            Some(error) => format!("{}: {error}", last.message),
            None => last.message.clone(),
        };
        self.write(record)
    }

    /// Write through a temp file and rename.
    pub fn write(&self, record: &RunRecord) -> Result<()> {
        let path = self.path_of(&record.run_id);
        let parent = path
            .parent()
            .ok_or_else(|| anyhow!("path without parent '{}'", path.display()))?;
        fs::create_dir_all(parent)
            .with_context(|| format!("creating run directory '{}'", parent.display()))?;
        let tmp = path.with_extension(format!("tmp-{}", std::process::id()));
        let payload = serde_json::to_vec_pretty(record).context("serializing run record")?;
        fs::write(&tmp, payload).with_context(|| format!("writing '{}'", tmp.display()))?;
        fs::rename(&tmp, &path).with_context(|| {
            format!("renaming '{}' to '{}'", tmp.display(), path.display())
        })?;
        Ok(())
    }

    pub fn load_all(&self) -> Result<Vec<RunRecord>> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut runs = Vec::new();
        for entry in fs::read_dir(&self.dir)
            .with_context(|| format!("reading run directory '{}'", self.dir.display()))?
        {
            let path = entry
                .with_context(|| format!("iterating run directory '{}'", self.dir.display()))?
                .path();
            if !path.extension().is_some_and(|ext| ext == "json") {
                continue;
            }
            let bytes =
                fs::read(&path).with_context(|| format!("reading run '{}'", path.display()))?;
            let record: RunRecord = serde_json::from_slice(&bytes)
                .with_context(|| format!("parsing run '{}'", path.display()))?;
            runs.push(record);
        }
        runs.sort_by(|a, b| b.sort_key().cmp(&a.sort_key()));
        Ok(runs)
    }

    /// Most recently finished (or started) run.
    pub fn latest(&self) -> Result<Option<RunRecord>> {
        Ok(self.load_all()?.into_iter().next())
    }

    /// Keep only the `keep` newest records.
    pub fn prune(&self, keep: usize) -> Result<()> {
        for run in self.load_all()?.into_iter().skip(keep) {
            let path = self.path_of(&run.run_id);
            fs::remove_file(&path)
                .with_context(|| format!("removing expired run '{}'", path.display()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_run_ids_are_unique() {
        let a = new_run_id().unwrap();
        let b = new_run_id().unwrap();
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_begin_then_finish_failed() {
        let temp = TempDir::new().unwrap();
        let log = RunLog::new(temp.path().join("runs"));
        let mut record = log.begin("contoso.com").unwrap();
        assert_eq!(log.latest().unwrap().unwrap().status, InstallStatus::InProgress);

        let last = InstallProgress::new(
            InstallStep::InstallDeps,
            InstallStatus::Failed,
            "Failed to install dependencies",
            Some("target not found: tpm2-tss".into()),
        );
        log.finish(&mut record, &last).unwrap();

        let stored = log.latest().unwrap().unwrap();
        assert_eq!(stored, record);
        assert_eq!(stored.failed_step, Some(InstallStep::InstallDeps));
        assert_eq!(
            stored.message,
            "Failed to install dependencies: target not found: tpm2-tss"
        );
        let finished = stored.finished_at_utc.unwrap();
        assert!(finished.contains('T') && finished.ends_with('Z'), "{finished}");
    }

    #[test]
    fn test_prune_keeps_newest() {
        let temp = TempDir::new().unwrap();
        let log = RunLog::new(temp.path());
        for i in 0..3 {
            let mut record = log.begin("contoso.com").unwrap();
            record.finished_at_utc = Some(format!("2026-01-0{}T00:00:00Z", i + 1));
            log.write(&record).unwrap();
        }
        fs::write(temp.path().join("notes.txt"), "ignored").unwrap();

        log.prune(1).unwrap();
        let left = log.load_all().unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].finished_at_utc.as_deref(), Some("2026-01-03T00:00:00Z"));
    }

    #[test]
    fn test_missing_directory_is_empty() {
        let temp = TempDir::new().unwrap();
        let log = RunLog::new(temp.path().join("absent"));
        assert!(log.latest().unwrap().is_none());
    }
}
