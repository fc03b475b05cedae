//! Trait seam between the fleet pipeline and the UI-automation layer. The
//! orchestrator only ever speaks through these traits, so the concrete
//! WebDriver client lives outside the core crate and tests can substitute
//! scripted fakes.

use std::time::Duration;

use async_trait::async_trait;

/// Verdict for a single subject lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubjectStatus {
    /// The subject resolved to a profile inside the app.
    Registered,
    /// The app affirmatively reported no account for the subject.
    NotRegistered,
    /// The probe finished without either signal; the item should be retried
    /// later rather than recorded.
    Indeterminate,
}

#[derive(Debug)]
pub enum DriverError {
    /// The automation session is gone and cannot answer further commands.
    SessionLost(String),
    /// A single command failed; the session itself may still be usable.
    Command(String),
}

impl std::fmt::Display for DriverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriverError::SessionLost(detail) => write!(f, "automation session lost: {detail}"),
            DriverError::Command(detail) => write!(f, "automation command failed: {detail}"),
        }
    }
}

impl std::error::Error for DriverError {}

/// UI-automation operations the pipeline needs from a live device session.
#[async_trait]
pub trait AutomationDriver: Send + Sync {
    /// Whether the target app currently owns the foreground.
    async fn is_app_active(&self) -> Result<bool, DriverError>;

    async fn bring_app_to_foreground(&self) -> Result<(), DriverError>;

    /// Waits up to `timeout` for the first-launch onboarding prompt to
    /// appear. `Ok(false)` means the prompt never showed, which on an
    /// already-onboarded device is the normal outcome.
    async fn detect_onboarding_prompt(&self, timeout: Duration) -> Result<bool, DriverError>;

    async fn dismiss_onboarding_prompt(&self) -> Result<(), DriverError>;

    /// Whether an account is signed in, judged by the presence of the
    /// app's main navigation chrome.
    async fn is_signed_in(&self) -> Result<bool, DriverError>;

    /// Looks up one subject and classifies the outcome. Implementations
    /// must leave the app on a screen from which the next lookup can start.
    async fn check_subject(&self, subject: &str) -> Result<SubjectStatus, DriverError>;

    async fn press_back(&self) -> Result<(), DriverError>;

    /// Ends the automation session. Errors are reported, not fatal; the
    /// caller tears the server down regardless.
    async fn quit(&self) -> Result<(), DriverError>;
}

/// Builds a driver bound to one device and one automation server.
#[async_trait]
pub trait DriverFactory: Send + Sync {
    async fn create(
        &self,
        serial: &str,
        server_url: &str,
    ) -> Result<Box<dyn AutomationDriver>, DriverError>;
}
