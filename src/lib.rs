//! Enrollment of Linux hosts into Entra ID and Intune.
//!
//! The crate builds the Himmelblau identity daemon from source, wires it
//! into NSS and PAM, installs its systemd units and keeps track of whether
//! the result actually works.
//!
//! # Architecture
//!
//! ```text
//! installer (orchestrator, 7 steps)
//!     │
//!     ├── distro        os-release → family → package manager
//!     ├── packages      PackageManager trait, pacman
//!     ├── validator     SystemStatus snapshots, aad-tool, journal
//!     ├── builder       clone → build → install → cleanup
//!     └── configurator  backups, NSS, PAM, units, identity config, rollback
//!
//! process / privilege / progress / config   shared plumbing
//! ```
//!
//! Every component receives an `Arc<PrivilegeSession>` from whoever drives
//! the workflow. Nothing holds global state.
//!
//! Single-instance operation is assumed: no locks are taken on the files
//! being edited, and two runs against one host will interfere.

pub mod builder;
pub mod config;
pub mod configurator;
pub mod distro;
pub mod installer;
pub mod packages;
pub mod preflight;
pub mod privilege;
pub mod process;
pub mod progress;
pub mod validator;

#[cfg(test)]
mod testing;

pub use config::{HostPaths, Settings};
pub use installer::{InstallProgress, InstallStatus, InstallStep, Installer};
pub use privilege::{ElevationMode, PrivilegeSession};
