//! Host tool checks.
//!
//! The workflow shells out to systemd, the elevation wrapper and, once
//! dependencies are in, the build toolchain. Checking up front turns a
//! confusing spawn failure halfway through an install into one clear list.
//!
//! # Example
//!
//! ```rust,ignore
//! use lintune::preflight::{check_required_tools, required_tools};
//! use lintune::privilege::ElevationMode;
//!
//! if let Err(e) = check_required_tools(&required_tools(ElevationMode::Sudo)) {
//!     eprintln!("{e}");
//! }
//! ```

use anyhow::{bail, Result};

use crate::privilege::ElevationMode;

/// Check if a command exists in PATH.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Tools the workflow needs before it can install anything.
///
/// Each tuple is (command_name, package_name).
pub const SYSTEM_TOOLS: &[(&str, &str)] = &[
    ("systemctl", "systemd"),
    ("journalctl", "systemd"),
];

/// Tools the build and service generation need. The dependency step
/// installs them, so their absence is reported but not fatal up front.
pub const BUILD_TOOLS: &[(&str, &str)] = &[
    ("git", "git"),
    ("cargo", "rust"),
    ("python3", "python"),
];

/// [`SYSTEM_TOOLS`] plus the wrapper `mode` elevates with.
pub fn required_tools(mode: ElevationMode) -> Vec<(&'static str, &'static str)> {
    let mut tools = SYSTEM_TOOLS.to_vec();
    match mode {
        ElevationMode::Sudo => tools.push(("sudo", "sudo")),
        ElevationMode::Pkexec => tools.push(("pkexec", "polkit")),
        ElevationMode::Direct => {}
    }
    tools
}

/// Entries of `tools` whose command is not in PATH.
pub fn missing_tools<'a>(tools: &[(&'a str, &'a str)]) -> Vec<(&'a str, &'a str)> {
    tools
        .iter()
        .filter(|(tool, _)| !command_exists(tool))
        .copied()
        .collect()
}

/// Fail with the list of missing tools and their packages.
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let missing = missing_tools(tools);
    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, p)| format!("  {} (install: {})", t, p))
            .collect::<Vec<_>>()
            .join("\n");
        bail!("Missing required host tools:\n{}", msg);
    }
    Ok(())
}
