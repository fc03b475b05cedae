//! Fleet orchestration: one long-lived task per configured device slot.
//! Each worker owns its device, its port pair, and its automation session
//! exclusively; failures are contained to the worker and logged with the
//! device identity, and only the shared termination signal fans out.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::{
    auth::{AuthGate, ConfirmationSurface, DeviceControl},
    avd::AvdManager,
    cancel::ShutdownFlag,
    driver::{AutomationDriver, DriverError, DriverFactory, SubjectStatus},
    error::WorkerError,
    ports::assign_ports,
    queue::WorkQueue,
    session::{bind_session, SessionConfig},
    store::DeviceStateStore,
};

/// Consecutive recoverable driver failures tolerated before a worker gives
/// up on its session.
const MAX_CONSECUTIVE_DRIVER_ERRORS: u32 = 5;

#[derive(Clone, Debug)]
pub struct FleetConfig {
    pub devices: Vec<String>,
    pub system_image: String,
    pub ram_mb: u32,
    pub disk_size: String,
    pub base_port: u16,
    pub automation_base_port: u16,
    pub ready_timeout: Duration,
    pub auth_timeout: Duration,
    pub onboard_timeout: Duration,
    pub session: SessionConfig,
}

#[derive(Clone)]
pub struct FleetDeps {
    pub queue: Arc<WorkQueue>,
    pub store: Arc<DeviceStateStore>,
    pub avd: Arc<AvdManager>,
    pub factory: Arc<dyn DriverFactory>,
    pub surface: Arc<dyn ConfirmationSurface>,
    pub shutdown: ShutdownFlag,
}

/// Device-control seam the authentication gate sees: snapshots and boot
/// readiness over the live emulator.
struct EmulatorControl {
    avd: Arc<AvdManager>,
    name: String,
    port: u16,
}

#[async_trait]
impl DeviceControl for EmulatorControl {
    async fn save_snapshot(&self, tag: &str) {
        self.avd.save_snapshot(&self.name, self.port, tag).await;
    }

    async fn ready(&self, timeout: Duration) -> bool {
        self.avd.await_ready(&self.name, self.port, timeout).await
    }
}

/// Runs the whole fleet: spawns a worker per device, waits for all of them,
/// and reports a summary. Worker failures never abort siblings.
pub async fn run_fleet(config: FleetConfig, deps: FleetDeps) {
    let mut handles = Vec::new();
    for (index, device) in config.devices.iter().enumerate() {
        let device = device.clone();
        let config = config.clone();
        let deps = deps.clone();
        handles.push(tokio::spawn(async move {
            let outcome = run_worker(&device, index as u16, &config, &deps).await;
            (device, outcome)
        }));
    }

    let mut checked_total = 0usize;
    let mut failed = 0usize;
    for handle in handles {
        match handle.await {
            Ok((device, Ok(checked))) => {
                info!("{device}: worker finished, {checked} subjects checked");
                checked_total += checked;
            }
            Ok((device, Err(e))) => {
                error!("{device}: worker failed during {}: {e}", e.stage());
                fleetcheck_telemetry::event(
                    "worker.failed",
                    &[("device", device.as_str()), ("stage", e.stage())],
                );
                failed += 1;
            }
            Err(e) => {
                error!("worker task panicked: {e}");
                failed += 1;
            }
        }
    }

    info!(
        "fleet done: {checked_total} subjects checked, {failed} worker(s) failed, {} pending",
        deps.queue.pending_count()
    );
    fleetcheck_telemetry::event(
        "fleet.done",
        &[
            ("checked", &checked_total.to_string()),
            ("failed", &failed.to_string()),
        ],
    );
}

async fn run_worker(
    device: &str,
    index: u16,
    config: &FleetConfig,
    deps: &FleetDeps,
) -> Result<usize, WorkerError> {
    let ports = assign_ports(index, config.base_port, config.automation_base_port);

    if deps.shutdown.is_triggered() {
        return Ok(0);
    }

    let mut child = match provision_and_boot(device, ports.device_port, config, deps).await {
        Ok(child) => child,
        Err(e) => {
            // A device that failed to provision or start is torn down
            // completely so the next run re-creates it from scratch.
            deps.avd.destroy(device).await;
            deps.store.clear(device);
            return Err(e);
        }
    };

    let ready = tokio::select! {
        ready = deps.avd.await_ready(device, ports.device_port, config.ready_timeout) => ready,
        _ = deps.shutdown.triggered() => {
            info!("{device}: termination signal during boot, shutting down");
            let _ = child.kill().await;
            return Ok(0);
        }
    };
    if !ready {
        // An AVD that cannot reach a usable state is torn down completely
        // so the next run re-creates it from scratch.
        let _ = child.kill().await;
        deps.avd.destroy(device).await;
        deps.store.clear(device);
        return Err(WorkerError::BootTimeout {
            device: device.to_string(),
            waited_secs: config.ready_timeout.as_secs(),
        });
    }

    let result = if deps.shutdown.is_triggered() {
        Ok(0)
    } else {
        run_on_device(device, ports.device_port, ports.automation_port, config, deps).await
    };

    if !deps.avd.shutdown(device, ports.device_port).await {
        // The console never took the kill; force it so fleet exit is not
        // pinned on a wedged emulator.
        let _ = child.start_kill();
    }
    if let Err(e) = child.wait().await {
        warn!("{device}: failed to reap emulator: {e}");
    }
    result
}

/// Resumes an existing device from its newest snapshot, or creates and
/// configures a fresh one for a cold boot, then starts the emulator.
async fn provision_and_boot(
    device: &str,
    device_port: u16,
    config: &FleetConfig,
    deps: &FleetDeps,
) -> Result<tokio::process::Child, WorkerError> {
    let resume = if deps.avd.exists(device).await? {
        deps.avd.latest_snapshot(device)
    } else {
        deps.avd.create(device, &config.system_image).await?;
        deps.avd.configure(device, config.ram_mb, config.disk_size.as_str());
        deps.store.clear(device);
        None
    };
    deps.avd.boot(device, device_port, resume.as_deref())
}

/// Everything that needs a booted device: session binding, the
/// onboarding/authentication gate, and the check loop. The session is
/// closed on every exit path before the result propagates.
async fn run_on_device(
    device: &str,
    device_port: u16,
    automation_port: u16,
    config: &FleetConfig,
    deps: &FleetDeps,
) -> Result<usize, WorkerError> {
    let mut session = bind_session(
        device,
        device_port,
        automation_port,
        &config.session,
        deps.factory.as_ref(),
    )
    .await?;

    if deps.shutdown.is_triggered() {
        session.close().await;
        return Ok(0);
    }

    let outcome = match session.driver() {
        Some(driver) => {
            let gate = AuthGate::new(
                Arc::clone(&deps.store),
                Arc::clone(&deps.surface),
                deps.shutdown.clone(),
                config.auth_timeout,
                config.onboard_timeout,
            );
            let control = EmulatorControl {
                avd: Arc::clone(&deps.avd),
                name: device.to_string(),
                port: device_port,
            };
            let gated = gate.ensure_onboarded(device, &control, driver).await;
            let gated = match gated {
                Ok(()) => gate.ensure_authenticated(device, &control, driver).await,
                Err(e) => Err(e),
            };
            match gated {
                Ok(()) => run_check_loop(&deps.queue, driver, &deps.shutdown, device).await,
                Err(e) => Err(e),
            }
        }
        None => Err(WorkerError::Driver {
            device: device.to_string(),
            detail: "session bound without a driver".into(),
        }),
    };

    session.close().await;
    outcome
}

/// Pulls work until the queue drains or the termination signal fires.
/// Registered subjects are recorded; a lost session aborts the worker,
/// while isolated command failures are tolerated up to a bound.
pub async fn run_check_loop(
    queue: &WorkQueue,
    driver: &dyn AutomationDriver,
    shutdown: &ShutdownFlag,
    device: &str,
) -> Result<usize, WorkerError> {
    let mut checked = 0usize;
    let mut consecutive_errors = 0u32;

    loop {
        if shutdown.is_triggered() {
            info!("{device}: termination signal observed, stopping");
            break;
        }
        let Some(item) = queue.next() else {
            info!("{device}: queue drained");
            break;
        };

        match driver.check_subject(&item.subject).await {
            Ok(SubjectStatus::Registered) => {
                consecutive_errors = 0;
                checked += 1;
                if let Err(e) = queue.record(&item) {
                    warn!("{device}: failed to record {}: {e}", item.subject);
                }
            }
            Ok(SubjectStatus::NotRegistered) => {
                consecutive_errors = 0;
                checked += 1;
            }
            Ok(SubjectStatus::Indeterminate) => {
                consecutive_errors = 0;
                // Not recorded, so a later run retries it.
                warn!("{device}: no verdict for {}, leaving for retry", item.subject);
            }
            Err(DriverError::SessionLost(detail)) => {
                return Err(WorkerError::Driver {
                    device: device.to_string(),
                    detail,
                });
            }
            Err(DriverError::Command(detail)) => {
                consecutive_errors += 1;
                warn!(
                    "{device}: check failed for {} ({consecutive_errors} in a row): {detail}",
                    item.subject
                );
                if consecutive_errors >= MAX_CONSECUTIVE_DRIVER_ERRORS {
                    return Err(WorkerError::Driver {
                        device: device.to_string(),
                        detail: format!(
                            "{MAX_CONSECUTIVE_DRIVER_ERRORS} consecutive command failures, last: {detail}"
                        ),
                    });
                }
                // Try to return the app to a known screen before the next pull.
                let _ = driver.press_back().await;
            }
        }
    }

    Ok(checked)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        collections::HashMap,
        fs,
        sync::Mutex,
    };

    struct MapDriver {
        verdicts: HashMap<String, SubjectStatus>,
        calls: Mutex<Vec<String>>,
    }

    impl MapDriver {
        fn new(verdicts: &[(&str, SubjectStatus)]) -> Self {
            MapDriver {
                verdicts: verdicts
                    .iter()
                    .map(|(k, v)| (k.to_string(), *v))
                    .collect(),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl AutomationDriver for MapDriver {
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
        async fn check_subject(&self, subject: &str) -> Result<SubjectStatus, DriverError> {
            self.calls.lock().unwrap().push(subject.to_string());
            Ok(self
                .verdicts
                .get(subject)
                .copied()
                .unwrap_or(SubjectStatus::Indeterminate))
        }
        async fn press_back(&self) -> Result<(), DriverError> {
            Ok(())
        }
        async fn quit(&self) -> Result<(), DriverError> {
            Ok(())
        }
    }

    struct FailingDriver {
        error: fn() -> DriverError,
    }

    #[async_trait]
    impl AutomationDriver for FailingDriver {
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
            Err((self.error)())
        }
        async fn press_back(&self) -> Result<(), DriverError> {
            Ok(())
        }
        async fn quit(&self) -> Result<(), DriverError> {
            Ok(())
        }
    }

    struct NoFactory;

    #[async_trait]
    impl DriverFactory for NoFactory {
        async fn create(
            &self,
            _serial: &str,
            _url: &str,
        ) -> Result<Box<dyn AutomationDriver>, DriverError> {
            Err(DriverError::Command("no automation in this test".into()))
        }
    }

    struct AlwaysConfirm;

    #[async_trait]
    impl ConfirmationSurface for AlwaysConfirm {
        async fn confirm(&self, _device: &str, _timeout: Duration) -> bool {
            true
        }
    }

    fn queue_with(dir: &tempfile::TempDir, rows: &[&str]) -> WorkQueue {
        let input = dir.path().join("input.csv");
        let mut body = String::from("name,phone\n");
        for (i, row) in rows.iter().enumerate() {
            body.push_str(&format!("p{i},{row}\n"));
        }
        fs::write(&input, body).unwrap();
        WorkQueue::load(&input, &dir.path().join("output.csv"), "phone").unwrap()
    }

    #[tokio::test]
    async fn records_registered_subjects_only() {
        let dir = tempfile::tempdir().unwrap();
        let queue = queue_with(&dir, &["+79161230001", "+79161230002"]);
        let driver = MapDriver::new(&[
            ("+79161230001", SubjectStatus::Registered),
            ("+79161230002", SubjectStatus::NotRegistered),
        ]);
        let shutdown = ShutdownFlag::new();

        let checked = run_check_loop(&queue, &driver, &shutdown, "AVD_1")
            .await
            .unwrap();
        assert_eq!(checked, 2);
        assert_eq!(queue.recorded_count(), 1);
        assert_eq!(queue.pending_count(), 0);

        let out = fs::read_to_string(dir.path().join("output.csv")).unwrap();
        assert!(out.contains("+79161230001"));
        assert!(!out.lines().any(|l| l.contains("+79161230002")));
    }

    #[tokio::test]
    async fn indeterminate_subjects_are_left_for_retry() {
        let dir = tempfile::tempdir().unwrap();
        let queue = queue_with(&dir, &["+79161230001"]);
        let driver = MapDriver::new(&[]);
        let shutdown = ShutdownFlag::new();

        let checked = run_check_loop(&queue, &driver, &shutdown, "AVD_1")
            .await
            .unwrap();
        assert_eq!(checked, 0);
        assert_eq!(queue.recorded_count(), 0);
    }

    #[tokio::test]
    async fn triggered_shutdown_stops_before_any_pull() {
        let dir = tempfile::tempdir().unwrap();
        let queue = queue_with(&dir, &["+79161230001", "+79161230002"]);
        let driver = MapDriver::new(&[]);
        let shutdown = ShutdownFlag::new();
        shutdown.trigger();

        let checked = run_check_loop(&queue, &driver, &shutdown, "AVD_1")
            .await
            .unwrap();
        assert_eq!(checked, 0);
        assert_eq!(queue.pending_count(), 2);
        assert!(driver.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn lost_session_aborts_the_worker() {
        let dir = tempfile::tempdir().unwrap();
        let queue = queue_with(&dir, &["+79161230001"]);
        let driver = FailingDriver {
            error: || DriverError::SessionLost("socket closed".into()),
        };
        let shutdown = ShutdownFlag::new();

        let err = run_check_loop(&queue, &driver, &shutdown, "AVD_1")
            .await
            .err()
            .unwrap();
        assert!(matches!(err, WorkerError::Driver { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failed_provisioning_destroys_device_and_clears_record() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("bin");
        fs::create_dir_all(&bin).unwrap();
        // emulator knows no AVDs; avdmanager always fails, so provisioning
        // takes the create path and dies there.
        let emulator = bin.join("emulator");
        fs::write(&emulator, "#!/bin/sh\nexit 0\n").unwrap();
        fs::set_permissions(&emulator, fs::Permissions::from_mode(0o755)).unwrap();
        let avdmanager = bin.join("avdmanager");
        fs::write(
            &avdmanager,
            "#!/bin/sh\necho 'package path is not valid' >&2\nexit 1\n",
        )
        .unwrap();
        fs::set_permissions(&avdmanager, fs::Permissions::from_mode(0o755)).unwrap();
        std::env::set_var("FLEETCHECK_EMULATOR_PATH", &emulator);
        std::env::set_var("FLEETCHECK_AVDMANAGER_PATH", &avdmanager);

        let queue = Arc::new(queue_with(&dir, &["+79161230001"]));
        let store = Arc::new(DeviceStateStore::new(dir.path().join("devices.json")));
        store.mark_booted("AVD_9");

        let config = FleetConfig {
            devices: vec!["AVD_9".into()],
            system_image: "system-images;android-30;google_apis;x86_64".into(),
            ram_mb: 2048,
            disk_size: "4G".into(),
            base_port: 5554,
            automation_base_port: 4723,
            ready_timeout: Duration::from_secs(1),
            auth_timeout: Duration::from_secs(1),
            onboard_timeout: Duration::from_secs(1),
            session: SessionConfig {
                server_command: "appium".into(),
                startup_timeout: Duration::from_secs(1),
            },
        };
        let deps = FleetDeps {
            queue,
            store: Arc::clone(&store),
            avd: Arc::new(AvdManager::with_avd_home(dir.path())),
            factory: Arc::new(NoFactory),
            surface: Arc::new(AlwaysConfirm),
            shutdown: ShutdownFlag::new(),
        };

        let err = run_worker("AVD_9", 0, &config, &deps).await.err().unwrap();
        assert!(matches!(err, WorkerError::Provisioning { .. }));
        // Registry entry and booted record are gone, so the next run starts
        // from a fresh create.
        assert!(!store.was_booted("AVD_9"));

        std::env::remove_var("FLEETCHECK_EMULATOR_PATH");
        std::env::remove_var("FLEETCHECK_AVDMANAGER_PATH");
    }

    #[tokio::test]
    async fn repeated_command_failures_are_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let rows: Vec<String> = (0..10).map(|i| format!("+791612300{i:02}")).collect();
        let refs: Vec<&str> = rows.iter().map(String::as_str).collect();
        let queue = queue_with(&dir, &refs);
        let driver = FailingDriver {
            error: || DriverError::Command("element not found".into()),
        };
        let shutdown = ShutdownFlag::new();

        let err = run_check_loop(&queue, &driver, &shutdown, "AVD_1")
            .await
            .err()
            .unwrap();
        assert!(matches!(err, WorkerError::Driver { .. }));
        // Exactly the tolerated number of pulls happened before giving up.
        assert_eq!(
            queue.pending_count(),
            10 - MAX_CONSECUTIVE_DRIVER_ERRORS as usize
        );
    }
}
