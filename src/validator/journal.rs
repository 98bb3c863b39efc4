//! Enrollment and compliance classification from daemon journal text.
//!
//! The daemon has no status API for Intune, so these rules match phrases in
//! its log. Specific failures are checked before the generic "not enrolled"
//! message; a missed failure is worse than a spurious one.

use super::status::{ComplianceState, EnrollmentState};

const DEVICE_LIMIT: &str = "reached their enrolled device limit";
const ENROLL_FAILED: &str = "failed to enroll in intune";
const BAD_REQUEST: &str = "badrequest";
const NOT_ENROLLED: &str = "device is not enrolled";

/// Classify enrollment from `journal`. `fully_configured` is the host's
/// configuration state, used only when no negative signal is present.
pub fn classify_enrollment(
    journal: &str,
    fully_configured: bool,
) -> (EnrollmentState, Option<String>) {
    let text = journal.to_lowercase();
    if text.contains(DEVICE_LIMIT) {
        (
            EnrollmentState::DeviceLimit,
            Some("User has reached enrolled device limit in Intune".to_string()),
        )
    } else if text.contains(ENROLL_FAILED) {
        let error = if text.contains(BAD_REQUEST) {
            "Intune enrollment returned BadRequest"
        } else {
            "Intune enrollment failed"
        };
        (EnrollmentState::Failed, Some(error.to_string()))
    } else if text.contains(NOT_ENROLLED) {
        (EnrollmentState::NotEnrolled, None)
    } else if fully_configured {
        (EnrollmentState::Enrolled, None)
    } else {
        (EnrollmentState::NotEnrolled, None)
    }
}

/// Compliance only has meaning for an enrolled device.
pub fn classify_compliance(journal: &str, enrollment: EnrollmentState) -> ComplianceState {
    if enrollment != EnrollmentState::Enrolled {
        return ComplianceState::NotApplicable;
    }
    let text = journal.to_lowercase();
    if text.contains("non-compliant") || text.contains("not compliant") {
        ComplianceState::NonCompliant
    } else if text.contains("compliant") {
        ComplianceState::Compliant
    } else {
        ComplianceState::Unknown
    }
}

/// Timestamp of the first log line in `journalctl -o short` output.
pub fn parse_last_activity(output: &str) -> Option<String> {
    let line = output
        .lines()
        .find(|line| !line.trim().is_empty() && !line.starts_with("--"))?;
    let fields: Vec<&str> = line.split_whitespace().take(3).collect();
    (fields.len() == 3).then(|| fields.join(" "))
}
