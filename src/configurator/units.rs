//! Generated systemd units and their local patches.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use walkdir::WalkDir;

pub const DAEMON_UNIT: &str = "himmelblaud.service";
pub const TASKS_UNIT: &str = "himmelblaud-tasks.service";
pub const DBUS_SERVICE: &str = "com.microsoft.identity.broker1.service";

/// Lines that need a hardware-backed credential store most hosts lack.
const HSM_DIRECTIVES: &[&str] = &[
    "LoadCredentialEncrypted=",
    "Environment=HIMMELBLAU_HSM_PIN_PATH=",
];

/// Comment out the HSM credential directives, keeping their indentation.
pub fn patch_unit(text: &str) -> String {
    text.split('\n')
        .map(|line| {
            let body = line.trim_start();
            if HSM_DIRECTIVES.iter().any(|d| body.starts_with(d)) {
                let indent = &line[..line.len() - body.len()];
                format!("{indent}#{body}")
            } else {
                line.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Every `*.service` file under `dir`, sorted.
pub fn collect_units(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut units = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1) {
        let entry = entry.with_context(|| format!("walking {}", dir.display()))?;
        if entry.file_type().is_file()
            && entry.path().extension().is_some_and(|ext| ext == "service")
        {
            units.push(entry.into_path());
        }
    }
    units.sort();
    Ok(units)
}

/// Patch every generated unit in place.
pub fn patch_generated(dir: &Path) -> Result<Vec<PathBuf>> {
    let units = collect_units(dir)?;
    for unit in &units {
        let text =
            fs::read_to_string(unit).with_context(|| format!("reading {}", unit.display()))?;
        let patched = patch_unit(&text);
        if patched != text {
            fs::write(unit, patched).with_context(|| format!("writing {}", unit.display()))?;
        }
    }
    Ok(units)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const UNIT: &str = "[Service]\n\
LoadCredentialEncrypted=hsm-pin:/var/lib/private/himmelblaud/hsm-pin.enc\n\
Environment=HIMMELBLAU_HSM_PIN_PATH=%d/hsm-pin\n\
Environment=RUST_LOG=info\n\
ExecStart=/usr/sbin/himmelblaud\n";

    #[test]
    fn test_patch_comments_hsm_lines_only() {
        let patched = patch_unit(UNIT);
        assert!(patched.contains("\n#LoadCredentialEncrypted=hsm-pin:"));
        assert!(patched.contains("\n#Environment=HIMMELBLAU_HSM_PIN_PATH=%d/hsm-pin\n"));
        assert!(patched.contains("\nEnvironment=RUST_LOG=info\n"));
        assert_eq!(patch_unit(&patched), patched);
    }

    #[test]
    fn test_patch_handles_indented_directives() {
        let unit = "[Service]\n  LoadCredentialEncrypted=hsm-pin:/x\n\tEnvironment=HIMMELBLAU_HSM_PIN_PATH=%d/hsm-pin\n    ExecStart=/usr/sbin/himmelblaud\n";
        let patched = patch_unit(unit);
        assert_eq!(
            patched,
            "[Service]\n  #LoadCredentialEncrypted=hsm-pin:/x\n\t#Environment=HIMMELBLAU_HSM_PIN_PATH=%d/hsm-pin\n    ExecStart=/usr/sbin/himmelblaud\n"
        );
        assert_eq!(patch_unit(&patched), patched);
    }

    #[test]
    fn test_patch_generated_walks_directory() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join(DAEMON_UNIT), UNIT).unwrap();
        fs::write(temp.path().join(TASKS_UNIT), "[Service]\n").unwrap();
        fs::write(temp.path().join("README"), "LoadCredentialEncrypted=").unwrap();

        let units = patch_generated(temp.path()).unwrap();
        assert_eq!(units.len(), 2);
        let daemon = fs::read_to_string(temp.path().join(DAEMON_UNIT)).unwrap();
        assert!(daemon.contains("#LoadCredentialEncrypted="));
        let readme = fs::read_to_string(temp.path().join("README")).unwrap();
        assert_eq!(readme, "LoadCredentialEncrypted=");
    }
}
