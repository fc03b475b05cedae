use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::info;

/// How many probe attempts pass between elapsed-time log lines.
const LOG_EVERY_ATTEMPTS: u32 = 10;

/// Polls `probe` at `interval` until it reports true or `deadline` of
/// wall-clock time has elapsed. Shared by boot-readiness, automation-server
/// liveness, and onboarding waits; sleeps between attempts rather than
/// spinning, and logs elapsed time periodically.
pub async fn poll_until<F, Fut>(
    label: &str,
    interval: Duration,
    deadline: Duration,
    mut probe: F,
) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let started = Instant::now();
    let mut attempts: u32 = 0;
    loop {
        if probe().await {
            return true;
        }
        if started.elapsed() >= deadline {
            info!(
                "{label}: gave up after {}s",
                started.elapsed().as_secs()
            );
            return false;
        }
        attempts += 1;
        if attempts % LOG_EVERY_ATTEMPTS == 0 {
            info!(
                "{label}: still waiting, {}s elapsed",
                started.elapsed().as_secs()
            );
        }
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn returns_true_once_probe_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let probe_calls = Arc::clone(&calls);
        let ok = poll_until(
            "test-probe",
            Duration::from_secs(1),
            Duration::from_secs(30),
            move || {
                let calls = Arc::clone(&probe_calls);
                async move { calls.fetch_add(1, Ordering::SeqCst) >= 2 }
            },
        )
        .await;
        assert!(ok);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn returns_false_after_deadline() {
        let ok = poll_until(
            "never-ready",
            Duration::from_secs(1),
            Duration::from_secs(5),
            || async { false },
        )
        .await;
        assert!(!ok);
    }

    #[tokio::test(start_paused = true)]
    async fn first_success_needs_no_sleep() {
        let ok = poll_until(
            "instant",
            Duration::from_secs(1),
            Duration::ZERO,
            || async { true },
        )
        .await;
        assert!(ok);
    }
}
