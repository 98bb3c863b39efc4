//! Interpretation of `aad-tool` output.
//!
//! `aad-tool` reports everything as free text with terminal colors. Each
//! function here turns one subcommand's raw outcome into an [`AadReport`];
//! callers never look at the text themselves.

use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

use crate::process::{CmdError, CmdResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AadOutcome {
    /// The command did what was asked and the answer is positive.
    Passed,
    /// The command ran but the answer is negative (daemon not working,
    /// TPM not in use).
    Negative,
    Failed,
    RootRequired,
    /// `aad-tool` or the elevation wrapper is not installed.
    Unavailable,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AadReport {
    pub outcome: AadOutcome,
    pub message: String,
}

impl AadReport {
    fn new(outcome: AadOutcome, message: impl Into<String>) -> Self {
        Self {
            outcome,
            message: message.into(),
        }
    }

    pub fn ok(&self) -> bool {
        self.outcome == AadOutcome::Passed
    }
}

fn ansi_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\x1B(?:[@-Z\\-_]|\[[0-?]*[ -/]*[@-~])").expect("ANSI pattern is valid")
    })
}

pub fn strip_ansi(text: &str) -> String {
    ansi_re().replace_all(text, "").into_owned()
}

fn first_non_empty(candidates: &[&str], fallback: &str) -> String {
    candidates
        .iter()
        .map(|s| s.trim())
        .find(|s| !s.is_empty())
        .unwrap_or(fallback)
        .to_string()
}

/// Map spawn failures and timeouts shared by every subcommand.
fn from_error(error: &CmdError, elevated: bool, timeout_message: &str) -> AadReport {
    if error.is_timeout() {
        AadReport::new(AadOutcome::TimedOut, timeout_message)
    } else if error.is_not_found() {
        let what = if elevated {
            "aad-tool or pkexec not found"
        } else {
            "aad-tool not found"
        };
        AadReport::new(AadOutcome::Unavailable, what)
    } else {
        AadReport::new(AadOutcome::Failed, error.to_string())
    }
}

fn clean(result: &CmdResult) -> (String, String) {
    (
        strip_ansi(result.stdout.trim()),
        strip_ansi(result.stderr.trim()),
    )
}

/// `aad-tool status`: only an exact `working!` counts.
pub fn interpret_status(raw: Result<CmdResult, CmdError>) -> AadReport {
    match raw {
        Err(e) => from_error(&e, false, "Timeout"),
        Ok(result) => {
            let (out, err) = clean(&result);
            if result.success() && out == "working!" {
                AadReport::new(AadOutcome::Passed, "working!")
            } else {
                AadReport::new(
                    AadOutcome::Negative,
                    first_non_empty(&[&out, &err], "Unknown error"),
                )
            }
        }
    }
}

/// `aad-tool cache-clear`.
pub fn interpret_cache_clear(raw: Result<CmdResult, CmdError>) -> AadReport {
    match raw {
        Err(e) => from_error(&e, true, "Timeout or auth cancelled"),
        Ok(result) => {
            let (out, err) = clean(&result);
            if result.success() && out.to_lowercase().contains("success") {
                AadReport::new(AadOutcome::Passed, "Cache cleared successfully")
            } else if result.success() {
                AadReport::new(AadOutcome::Passed, first_non_empty(&[&out], "Cache cleared"))
            } else if err.contains("must be run as root") {
                AadReport::new(AadOutcome::RootRequired, "Root privileges required")
            } else {
                AadReport::new(
                    AadOutcome::Failed,
                    first_non_empty(&[&err, &out], "Cache clear failed"),
                )
            }
        }
    }
}

/// `aad-tool auth-test --name <user>`.
pub fn interpret_auth_test(raw: Result<CmdResult, CmdError>) -> AadReport {
    match raw {
        Err(e) => from_error(&e, false, "Timeout - user may need to complete MFA"),
        Ok(result) => {
            let (out, err) = clean(&result);
            if result.success() {
                AadReport::new(
                    AadOutcome::Passed,
                    first_non_empty(&[&out], "Authentication test passed"),
                )
            } else {
                AadReport::new(
                    AadOutcome::Failed,
                    first_non_empty(&[&err, &out], "Auth test failed"),
                )
            }
        }
    }
}

/// `aad-tool tpm`. `Passed` means the TPM is in use.
pub fn interpret_tpm(raw: Result<CmdResult, CmdError>) -> AadReport {
    match raw {
        Err(e) => from_error(&e, true, "Timeout or auth cancelled"),
        Ok(result) => {
            let (out, err) = clean(&result);
            if result.success() {
                let lower = out.to_lowercase();
                if lower.contains("not in use") {
                    AadReport::new(AadOutcome::Negative, out)
                } else {
                    AadReport::new(
                        AadOutcome::Passed,
                        first_non_empty(&[&out], "TPM check completed"),
                    )
                }
            } else if err.contains("must be run as root") {
                AadReport::new(AadOutcome::RootRequired, "Root privileges required")
            } else {
                AadReport::new(
                    AadOutcome::Failed,
                    first_non_empty(&[&err, &out], "TPM check failed"),
                )
            }
        }
    }
}

/// `aad-tool offline-breakglass [--ttl <ttl>]`.
pub fn interpret_breakglass(raw: Result<CmdResult, CmdError>) -> AadReport {
    interpret_plain(
        raw,
        "Timeout or auth cancelled",
        "Breakglass mode updated",
        "Breakglass command failed",
    )
}

/// `aad-tool enumerate [--name <user>]`.
pub fn interpret_enumerate(raw: Result<CmdResult, CmdError>) -> AadReport {
    interpret_plain(
        raw,
        "Timeout - enumeration may take a while",
        "Enumeration completed",
        "Enumeration failed",
    )
}

fn interpret_plain(
    raw: Result<CmdResult, CmdError>,
    timeout: &str,
    passed: &str,
    failed: &str,
) -> AadReport {
    match raw {
        Err(e) => from_error(&e, true, timeout),
        Ok(result) => {
            let (out, err) = clean(&result);
            if result.success() {
                AadReport::new(AadOutcome::Passed, first_non_empty(&[&out], passed))
            } else if err.contains("must be run as root") {
                AadReport::new(AadOutcome::RootRequired, "Root privileges required")
            } else {
                AadReport::new(AadOutcome::Failed, first_non_empty(&[&err, &out], failed))
            }
        }
    }
}
