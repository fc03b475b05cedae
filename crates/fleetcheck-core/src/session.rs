//! Automation-session binding: starts the automation server for one device,
//! waits for its HTTP status endpoint to come up, confirms the device is
//! visible to the bridge, and hands back a driver bound to both. The
//! resulting [`Session`] owns the server process and the driver together so
//! one `close` tears down everything this worker started.

use std::{fs, process::Stdio, time::Duration};

use tokio::process::{Child, Command};
use tracing::{info, warn};

use crate::{
    adb,
    driver::{AutomationDriver, DriverFactory},
    error::WorkerError,
    poll::poll_until,
};

const STATUS_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Base command for the automation server, e.g. `appium`; port and log
    /// level are appended.
    pub server_command: String,
    pub startup_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            server_command: "appium".into(),
            startup_timeout: Duration::from_secs(60),
        }
    }
}

/// One worker's automation session: the server process plus the remote
/// driver speaking to it.
pub struct Session {
    device: String,
    driver: Option<Box<dyn AutomationDriver>>,
    server: Option<Child>,
    closed: bool,
}

impl Session {
    pub fn driver(&self) -> Option<&dyn AutomationDriver> {
        self.driver.as_deref()
    }

    /// Quits the driver and kills the server. Safe to call more than once
    /// and after partial failures; every worker exit path runs through it.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(driver) = self.driver.take() {
            if let Err(e) = driver.quit().await {
                warn!("{}: driver quit failed: {e}", self.device);
            }
        }
        kill_server(&self.device, self.server.take()).await;
    }
}

async fn kill_server(device: &str, server: Option<Child>) {
    let Some(mut child) = server else { return };
    if let Err(e) = child.start_kill() {
        warn!("{device}: failed to kill automation server: {e}");
        return;
    }
    if let Err(e) = child.wait().await {
        warn!("{device}: failed to reap automation server: {e}");
    }
}

fn spawn_server(device: &str, config: &SessionConfig, port: u16) -> Result<Child, WorkerError> {
    let mut parts = config.server_command.split_whitespace();
    let program = parts.next().ok_or_else(|| WorkerError::SessionUnavailable {
        port,
        detail: "empty automation server command".into(),
    })?;

    let log_path = fleetcheck_util::server_log_dir().join(format!("automation-{port}.log"));
    let log = fs::File::create(&log_path).map_err(|e| WorkerError::SessionUnavailable {
        port,
        detail: format!("cannot open server log: {e}"),
    })?;
    let log_err = log.try_clone().map_err(|e| WorkerError::SessionUnavailable {
        port,
        detail: format!("cannot open server log: {e}"),
    })?;

    let port_arg = port.to_string();
    let mut cmd = Command::new(program);
    cmd.args(parts)
        .args(["--port", &port_arg, "--log-level", "info"])
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err))
        .kill_on_drop(true);
    info!("{device}: starting automation server on port {port}");
    cmd.spawn().map_err(|e| WorkerError::SessionUnavailable {
        port,
        detail: format!("failed to start automation server: {e}"),
    })
}

/// Probes the server's WebDriver status endpoint. `curl` is used as the
/// HTTP client with a short per-request timeout.
async fn server_alive(port: u16) -> bool {
    let url = format!("http://127.0.0.1:{port}/status");
    let result = Command::new("curl")
        .args(["-fsS", "--max-time", "2", &url])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    matches!(result, Ok(status) if status.success())
}

/// Brings up the full automation session for one device: server process,
/// status-endpoint readiness, bridge visibility, then the remote driver.
/// On any failure the server process started here is killed before the
/// error propagates.
pub async fn bind_session(
    device: &str,
    device_port: u16,
    automation_port: u16,
    config: &SessionConfig,
    factory: &dyn DriverFactory,
) -> Result<Session, WorkerError> {
    let server = spawn_server(device, config, automation_port)?;

    let label = format!("{device} automation server");
    let up = poll_until(
        &label,
        STATUS_POLL_INTERVAL,
        config.startup_timeout,
        || server_alive(automation_port),
    )
    .await;
    if !up {
        kill_server(device, Some(server)).await;
        return Err(WorkerError::SessionUnavailable {
            port: automation_port,
            detail: format!(
                "status endpoint not reachable within {}s",
                config.startup_timeout.as_secs()
            ),
        });
    }

    let serial = adb::emulator_serial(device_port);
    match adb::device_listed(&serial).await {
        Ok(true) => {}
        Ok(false) | Err(_) => {
            kill_server(device, Some(server)).await;
            return Err(WorkerError::DeviceUnreachable { serial });
        }
    }

    let server_url = format!("http://127.0.0.1:{automation_port}");
    let driver = match factory.create(&serial, &server_url).await {
        Ok(driver) => driver,
        Err(e) => {
            kill_server(device, Some(server)).await;
            return Err(WorkerError::Driver {
                device: device.to_string(),
                detail: e.to_string(),
            });
        }
    };

    info!("{device}: automation session ready on port {automation_port}");
    Ok(Session {
        device: device.to_string(),
        driver: Some(driver),
        server: Some(server),
        closed: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::driver::{DriverError, SubjectStatus};

    struct NoopDriver;

    #[async_trait]
    impl AutomationDriver for NoopDriver {
        async fn is_app_active(&self) -> Result<bool, DriverError> {
            Ok(true)
        }
        async fn bring_app_to_foreground(&self) -> Result<(), DriverError> {
            Ok(())
        }
        async fn detect_onboarding_prompt(&self, _t: Duration) -> Result<bool, DriverError> {
            Ok(false)
        }
        async fn dismiss_onboarding_prompt(&self) -> Result<(), DriverError> {
            Ok(())
        }
        async fn is_signed_in(&self) -> Result<bool, DriverError> {
            Ok(true)
        }
        async fn check_subject(&self, _s: &str) -> Result<SubjectStatus, DriverError> {
            Ok(SubjectStatus::Indeterminate)
        }
        async fn press_back(&self) -> Result<(), DriverError> {
            Ok(())
        }
        async fn quit(&self) -> Result<(), DriverError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let mut session = Session {
            device: "AVD_1".into(),
            driver: Some(Box::new(NoopDriver)),
            server: None,
            closed: false,
        };
        session.close().await;
        assert!(session.driver().is_none());
        session.close().await;
    }

    #[tokio::test]
    async fn empty_server_command_is_rejected() {
        struct NeverFactory;

        #[async_trait]
        impl DriverFactory for NeverFactory {
            async fn create(
                &self,
                _serial: &str,
                _url: &str,
            ) -> Result<Box<dyn AutomationDriver>, DriverError> {
                unreachable!("factory must not be consulted before the server is up")
            }
        }

        let config = SessionConfig {
            server_command: "   ".into(),
            startup_timeout: Duration::from_secs(1),
        };
        let err = bind_session("AVD_1", 5554, 4723, &config, &NeverFactory)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, WorkerError::SessionUnavailable { port: 4723, .. }));
    }
}
