//! Terminal confirmation surface. All prompts funnel through one dedicated
//! stdin thread, so concurrent workers asking for operator attention never
//! interleave reads on the same descriptor; workers block on a oneshot
//! reply with their own timeout.

use std::{
    io::BufRead,
    sync::mpsc,
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::oneshot;

use fleetcheck_core::auth::ConfirmationSurface;

struct Prompt {
    device: String,
    timeout: Duration,
    reply: oneshot::Sender<()>,
}

pub struct TerminalConfirmation {
    tx: mpsc::Sender<Prompt>,
}

impl TerminalConfirmation {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel::<Prompt>();
        std::thread::spawn(move || prompt_loop(rx));
        TerminalConfirmation { tx }
    }
}

impl Default for TerminalConfirmation {
    fn default() -> Self {
        TerminalConfirmation::new()
    }
}

fn prompt_text(device: &str, timeout: Duration) -> String {
    format!(
        "==> Device {device} needs authentication: sign in inside the emulator window, \
         then press Enter ({}s before this worker gives up).",
        timeout.as_secs()
    )
}

fn prompt_loop(rx: mpsc::Receiver<Prompt>) {
    let stdin = std::io::stdin();
    while let Ok(prompt) = rx.recv() {
        println!();
        println!("{}", prompt_text(&prompt.device, prompt.timeout));
        let mut line = String::new();
        if stdin.lock().read_line(&mut line).is_err() {
            return;
        }
        // The worker may have timed out and dropped its receiver; that is
        // its problem, not ours.
        let _ = prompt.reply.send(());
    }
}

#[async_trait]
impl ConfirmationSurface for TerminalConfirmation {
    async fn confirm(&self, device: &str, timeout: Duration) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();
        let prompt = Prompt {
            device: device.to_string(),
            timeout,
            reply: reply_tx,
        };
        if self.tx.send(prompt).is_err() {
            return false;
        }
        matches!(tokio::time::timeout(timeout, reply_rx).await, Ok(Ok(())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_names_device_and_countdown() {
        let text = prompt_text("AVD_1", Duration::from_secs(600));
        assert!(text.contains("AVD_1"));
        assert!(text.contains("600s"));
    }
}
