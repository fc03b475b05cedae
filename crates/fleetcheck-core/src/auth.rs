//! Per-device onboarding and authentication gate. Progression is
//! `not-booted -> booted -> authenticated`, persisted through the device
//! state store so completed stages survive restarts. Authentication needs a
//! human: the gate blocks on an operator confirmation surface, snapshots the
//! device once confirmed, and re-validates through the automation driver
//! before trusting the confirmation.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tracing::{info, warn};

use crate::{
    avd::{SNAPSHOT_AUTHORIZED, SNAPSHOT_CONFIGURED},
    cancel::ShutdownFlag,
    driver::AutomationDriver,
    error::WorkerError,
    store::DeviceStateStore,
};

/// Operator-facing confirmation prompt. `true` means the operator confirmed
/// within the timeout.
#[async_trait]
pub trait ConfirmationSurface: Send + Sync {
    async fn confirm(&self, device: &str, timeout: Duration) -> bool;
}

/// The slice of device control the gate needs: snapshots and readiness.
/// Implemented over the emulator in production, faked in tests.
#[async_trait]
pub trait DeviceControl: Send + Sync {
    async fn save_snapshot(&self, tag: &str);
    async fn ready(&self, timeout: Duration) -> bool;
}

pub struct AuthGate {
    store: Arc<DeviceStateStore>,
    surface: Arc<dyn ConfirmationSurface>,
    shutdown: ShutdownFlag,
    /// How long to wait for the operator each attempt.
    auth_timeout: Duration,
    /// How long onboarding waits for the first-launch prompt.
    onboard_timeout: Duration,
    /// Readiness re-probe window after a snapshot save.
    ready_recheck: Duration,
    max_attempts: u32,
}

impl AuthGate {
    pub fn new(
        store: Arc<DeviceStateStore>,
        surface: Arc<dyn ConfirmationSurface>,
        shutdown: ShutdownFlag,
        auth_timeout: Duration,
        onboard_timeout: Duration,
    ) -> Self {
        AuthGate {
            store,
            surface,
            shutdown,
            auth_timeout,
            onboard_timeout,
            ready_recheck: Duration::from_secs(60),
            max_attempts: 3,
        }
    }

    /// Completes first-launch onboarding on a device that has never booted:
    /// waits for the welcome prompt, dismisses it if present, records the
    /// boot, and snapshots the configured state.
    pub async fn ensure_onboarded(
        &self,
        device: &str,
        control: &dyn DeviceControl,
        driver: &dyn AutomationDriver,
    ) -> Result<(), WorkerError> {
        if self.store.was_booted(device) {
            return Ok(());
        }
        info!("{device}: first boot, completing onboarding");
        let prompted = driver
            .detect_onboarding_prompt(self.onboard_timeout)
            .await
            .map_err(|e| driver_error(device, e))?;
        if prompted {
            driver
                .dismiss_onboarding_prompt()
                .await
                .map_err(|e| driver_error(device, e))?;
        }
        self.store.mark_booted(device);
        control.save_snapshot(SNAPSHOT_CONFIGURED).await;
        Ok(())
    }

    /// Blocks until the device is authenticated. Each attempt waits for an
    /// operator confirmation, snapshots the authorized state, re-probes
    /// readiness, then re-validates sign-in through the driver; a failed
    /// re-validation clears the flag and repeats the wait, bounded by the
    /// attempt limit. A termination signal during the wait returns `Ok`
    /// without marking anything: the caller's work loop observes the same
    /// signal and exits before touching the queue.
    pub async fn ensure_authenticated(
        &self,
        device: &str,
        control: &dyn DeviceControl,
        driver: &dyn AutomationDriver,
    ) -> Result<(), WorkerError> {
        if self.store.is_authenticated(device) {
            return Ok(());
        }

        for attempt in 1..=self.max_attempts {
            if self.shutdown.is_triggered() {
                info!("{device}: termination signal observed, abandoning authentication");
                return Ok(());
            }
            info!(
                "{device}: waiting for operator authentication (attempt {attempt}/{})",
                self.max_attempts
            );
            let confirmed = tokio::select! {
                confirmed = self.surface.confirm(device, self.auth_timeout) => confirmed,
                _ = self.shutdown.triggered() => {
                    info!("{device}: termination signal observed while waiting for the operator");
                    return Ok(());
                }
            };
            if !confirmed {
                return Err(WorkerError::AuthenticationTimeout {
                    device: device.to_string(),
                    detail: format!(
                        "operator did not confirm within {}s",
                        self.auth_timeout.as_secs()
                    ),
                });
            }

            control.save_snapshot(SNAPSHOT_AUTHORIZED).await;
            if !control.ready(self.ready_recheck).await {
                warn!("{device}: device not ready after snapshot, retrying authentication");
                continue;
            }

            self.store.mark_authenticated(device);
            match driver.is_signed_in().await {
                Ok(true) => {
                    info!("{device}: authentication confirmed");
                    return Ok(());
                }
                Ok(false) => {
                    warn!("{device}: confirmation not reflected in the app, retrying");
                    self.store.reset_authentication(device);
                }
                Err(e) => {
                    // The confirmation was never validated; do not let the
                    // flag survive into the next run.
                    self.store.reset_authentication(device);
                    return Err(driver_error(device, e));
                }
            }
        }

        Err(WorkerError::AuthenticationTimeout {
            device: device.to_string(),
            detail: format!("not signed in after {} attempts", self.max_attempts),
        })
    }
}

fn driver_error(device: &str, e: crate::driver::DriverError) -> WorkerError {
    WorkerError::Driver {
        device: device.to_string(),
        detail: e.to_string(),
    }
}
