use std::fmt;

/// Failures that abort a single worker. None of these propagate to sibling
/// workers; the worker's top level logs them with the device identity and
/// resolves them into teardown.
#[derive(Debug)]
pub enum WorkerError {
    /// Device create/configure failed; the registry entry is cleaned up and
    /// the store record cleared so the next attempt starts fresh.
    Provisioning { device: String, detail: String },
    /// Device never reported boot completion within the configured window.
    BootTimeout { device: String, waited_secs: u64 },
    /// The automation server did not answer its liveness probe.
    SessionUnavailable { port: u16, detail: String },
    /// The device bridge does not list the expected device serial.
    DeviceUnreachable { serial: String },
    /// The operator did not confirm authentication in time, or confirmation
    /// never survived re-validation. The store record stays at booted.
    AuthenticationTimeout { device: String, detail: String },
    /// The automation-driver collaborator failed beyond recovery.
    Driver { device: String, detail: String },
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerError::Provisioning { device, detail } => {
                write!(f, "provisioning failed for {device}: {detail}")
            }
            WorkerError::BootTimeout {
                device,
                waited_secs,
            } => {
                write!(f, "{device} did not become ready within {waited_secs}s")
            }
            WorkerError::SessionUnavailable { port, detail } => {
                write!(f, "automation server on port {port} unavailable: {detail}")
            }
            WorkerError::DeviceUnreachable { serial } => {
                write!(f, "device {serial} not listed by the device bridge")
            }
            WorkerError::AuthenticationTimeout { device, detail } => {
                write!(f, "authentication for {device} not completed: {detail}")
            }
            WorkerError::Driver { device, detail } => {
                write!(f, "automation driver failed on {device}: {detail}")
            }
        }
    }
}

impl std::error::Error for WorkerError {}

impl WorkerError {
    /// Short stage label used in logs and telemetry.
    pub fn stage(&self) -> &'static str {
        match self {
            WorkerError::Provisioning { .. } => "provisioning",
            WorkerError::BootTimeout { .. } => "boot",
            WorkerError::SessionUnavailable { .. } => "session",
            WorkerError::DeviceUnreachable { .. } => "device-bridge",
            WorkerError::AuthenticationTimeout { .. } => "authentication",
            WorkerError::Driver { .. } => "driver",
        }
    }
}
