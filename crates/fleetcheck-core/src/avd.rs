//! Android Virtual Device lifecycle: registry operations through
//! `avdmanager`, boots through `emulator`, and console commands through the
//! adb bridge. All tool invocations capture stdout/stderr and treat a
//! non-zero exit status as the failure signal.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use tokio::process::{Child, Command};
use tracing::{error, info, warn};

use crate::{
    adb::{self, adb_failure_message},
    error::WorkerError,
    poll::poll_until,
};

/// Snapshot saved after first-boot onboarding completes.
pub const SNAPSHOT_CONFIGURED: &str = "configured";
/// Snapshot saved after an operator authenticates the device.
pub const SNAPSHOT_AUTHORIZED: &str = "authorized";

const READY_POLL_INTERVAL: Duration = Duration::from_secs(1);

fn sdk_root() -> Option<PathBuf> {
    fleetcheck_util::read_env_trimmed("ANDROID_SDK_ROOT")
        .or_else(|| fleetcheck_util::read_env_trimmed("ANDROID_HOME"))
        .map(|root| fleetcheck_util::expand_user(&root))
}

fn avdmanager_path() -> PathBuf {
    if let Some(path) = fleetcheck_util::read_env_trimmed("FLEETCHECK_AVDMANAGER_PATH") {
        return fleetcheck_util::expand_user(&path);
    }
    if let Some(root) = sdk_root() {
        let candidate = root
            .join("cmdline-tools")
            .join("latest")
            .join("bin")
            .join("avdmanager");
        if candidate.exists() {
            return candidate;
        }
    }
    PathBuf::from("avdmanager")
}

fn emulator_path() -> PathBuf {
    if let Some(path) = fleetcheck_util::read_env_trimmed("FLEETCHECK_EMULATOR_PATH") {
        return fleetcheck_util::expand_user(&path);
    }
    if let Some(root) = sdk_root() {
        let candidate = root.join("emulator").join("emulator");
        if candidate.exists() {
            return candidate;
        }
    }
    PathBuf::from("emulator")
}

fn default_avd_home() -> PathBuf {
    if let Some(home) = fleetcheck_util::read_env_trimmed("FLEETCHECK_AVD_HOME")
        .or_else(|| fleetcheck_util::read_env_trimmed("ANDROID_AVD_HOME"))
    {
        return fleetcheck_util::expand_user(&home);
    }
    let base = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
    PathBuf::from(base).join(".android").join("avd")
}

fn provisioning(device: &str, detail: impl Into<String>) -> WorkerError {
    WorkerError::Provisioning {
        device: device.to_string(),
        detail: detail.into(),
    }
}

async fn run_tool(
    device: &str,
    program: &Path,
    args: &[&str],
) -> Result<std::process::Output, WorkerError> {
    let output = Command::new(program)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| provisioning(device, format!("failed to run {}: {e}", program.display())))?;
    if output.status.success() {
        Ok(output)
    } else {
        let detail = adb::format_tool_output(
            &String::from_utf8_lossy(&output.stdout),
            &String::from_utf8_lossy(&output.stderr),
        );
        Err(provisioning(
            device,
            format!(
                "{} exited with {}: {}",
                program.display(),
                output.status.code().unwrap_or(-1),
                detail.trim()
            ),
        ))
    }
}

pub struct AvdManager {
    avd_home: PathBuf,
}

impl AvdManager {
    pub fn new() -> Self {
        AvdManager {
            avd_home: default_avd_home(),
        }
    }

    pub fn with_avd_home(avd_home: impl Into<PathBuf>) -> Self {
        AvdManager {
            avd_home: avd_home.into(),
        }
    }

    fn avd_dir(&self, name: &str) -> PathBuf {
        self.avd_home.join(format!("{name}.avd"))
    }

    /// Whether the registry knows the device, per `emulator -list-avds`.
    pub async fn exists(&self, name: &str) -> Result<bool, WorkerError> {
        let output = run_tool(name, &emulator_path(), &["-list-avds"]).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout.lines().any(|line| line.trim() == name))
    }

    pub async fn create(&self, name: &str, image: &str) -> Result<(), WorkerError> {
        info!("creating device {name} from {image}");
        run_tool(
            name,
            &avdmanager_path(),
            &[
                "create", "avd", "-n", name, "-k", image, "--device", "pixel", "--force",
            ],
        )
        .await?;
        Ok(())
    }

    /// Rewrites the device's config.ini with the fleet hardware profile.
    /// Lines for other keys pass through untouched; keys absent from the
    /// file are appended. A missing file is logged and skipped, not fatal.
    pub fn configure(&self, name: &str, ram_mb: u32, disk: &str) {
        let path = self.avd_dir(name).join("config.ini");
        let desired: [(&str, String); 4] = [
            ("hw.ramSize", ram_mb.to_string()),
            ("disk.dataPartition.size", disk.to_string()),
            ("hw.gpu.enabled", "yes".to_string()),
            ("hw.gpu.mode", "auto".to_string()),
        ];
        match rewrite_config(&path, &desired) {
            Ok(()) => info!("configured {name}: ram={ram_mb}M disk={disk}"),
            Err(e) => error!("failed to configure {name} at {}: {e}", path.display()),
        }
    }

    /// Starts the emulator and returns the child handle without waiting for
    /// boot. `resume` names a snapshot tag to load; otherwise the device
    /// cold-boots with wiped data.
    pub fn boot(&self, name: &str, port: u16, resume: Option<&str>) -> Result<Child, WorkerError> {
        let log_path = fleetcheck_util::server_log_dir().join(format!("emulator-{name}.log"));
        let log = fs::File::create(&log_path)
            .map_err(|e| provisioning(name, format!("cannot open boot log: {e}")))?;
        let log_err = log
            .try_clone()
            .map_err(|e| provisioning(name, format!("cannot open boot log: {e}")))?;

        let port_arg = port.to_string();
        let mut cmd = Command::new(emulator_path());
        cmd.args(["-avd", name, "-port", &port_arg]);
        match resume {
            Some(tag) => {
                info!("booting {name} on port {port}, resuming snapshot {tag}");
                cmd.args(["-snapshot", tag, "-no-snapshot-save"]);
            }
            None => {
                info!("booting {name} on port {port} cold");
                cmd.args(["-no-snapshot-load", "-wipe-data"]);
            }
        }
        if fleetcheck_util::env_flag("FLEETCHECK_EMULATOR_NO_WINDOW") {
            cmd.arg("-no-window");
        }
        cmd.stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .kill_on_drop(true);
        cmd.spawn()
            .map_err(|e| provisioning(name, format!("failed to start emulator: {e}")))
    }

    /// Polls the boot-completed property until the device is usable or the
    /// deadline passes.
    pub async fn await_ready(&self, name: &str, port: u16, timeout: Duration) -> bool {
        let serial = adb::emulator_serial(port);
        let label = format!("{name} boot");
        poll_until(&label, READY_POLL_INTERVAL, timeout, || {
            let serial = serial.clone();
            async move { adb::boot_completed(&serial).await }
        })
        .await
    }

    /// Best-effort snapshot save; failures are logged, never propagated.
    pub async fn save_snapshot(&self, name: &str, port: u16, tag: &str) {
        let serial = adb::emulator_serial(port);
        match adb::adb_emu(&serial, &["avd", "snapshot", "save", tag]).await {
            Ok(_) => info!("saved snapshot {tag} for {name}"),
            Err(e) => warn!(
                "failed to save snapshot {tag} for {name}: {}",
                adb_failure_message(&e)
            ),
        }
    }

    /// Best-effort snapshot delete.
    pub async fn delete_snapshot(&self, name: &str, port: u16, tag: &str) {
        let serial = adb::emulator_serial(port);
        if let Err(e) = adb::adb_emu(&serial, &["avd", "snapshot", "delete", tag]).await {
            warn!(
                "failed to delete snapshot {tag} for {name}: {}",
                adb_failure_message(&e)
            );
        }
    }

    /// Most recently modified snapshot tag under the device's snapshots
    /// directory, if any. Resume prefers this over a fixed tag so an
    /// `authorized` snapshot wins over the older `configured` one.
    pub fn latest_snapshot(&self, name: &str) -> Option<String> {
        let snapshots = self.avd_dir(name).join("snapshots");
        let mut newest: Option<(std::time::SystemTime, String)> = None;
        for entry in walkdir::WalkDir::new(&snapshots)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(Result::ok)
        {
            if !entry.file_type().is_dir() {
                continue;
            }
            let tag = entry.file_name().to_string_lossy().to_string();
            let modified = match entry.metadata().ok().and_then(|m| m.modified().ok()) {
                Some(t) => t,
                None => continue,
            };
            let newer = match &newest {
                Some((best, _)) => modified > *best,
                None => true,
            };
            if newer {
                newest = Some((modified, tag));
            }
        }
        newest.map(|(_, tag)| tag)
    }

    /// Removes the device from the registry. Snapshot directories go with
    /// the AVD directory, so no separate cleanup is needed beyond logging.
    pub async fn destroy(&self, name: &str) {
        match run_tool(name, &avdmanager_path(), &["delete", "avd", "-n", name]).await {
            Ok(_) => info!("destroyed device {name}"),
            Err(e) => warn!("failed to destroy device {name}: {e}"),
        }
    }

    /// Asks the running emulator to power off via the console. Returns
    /// whether the console accepted the command; on `false` the process is
    /// still alive and the caller must force-kill it.
    pub async fn shutdown(&self, name: &str, port: u16) -> bool {
        let serial = adb::emulator_serial(port);
        match adb::adb_emu(&serial, &["kill"]).await {
            Ok(_) => {
                info!("shut down {name} on port {port}");
                true
            }
            Err(e) => {
                warn!(
                    "failed to shut down {name} on port {port}: {}",
                    adb_failure_message(&e)
                );
                false
            }
        }
    }
}

impl Default for AvdManager {
    fn default() -> Self {
        AvdManager::new()
    }
}

fn rewrite_config(path: &Path, desired: &[(&str, String)]) -> std::io::Result<()> {
    let original = fs::read_to_string(path)?;
    let mut pending: HashMap<&str, &str> = desired
        .iter()
        .map(|(k, v)| (*k, v.as_str()))
        .collect();

    let mut lines: Vec<String> = Vec::new();
    for line in original.lines() {
        let key = line.split('=').next().map(str::trim).unwrap_or("");
        if let Some(value) = pending.remove(key) {
            lines.push(format!("{key}={value}"));
        } else {
            lines.push(line.to_string());
        }
    }
    // Keys the file never mentioned, in the caller's order.
    for (key, value) in desired {
        if pending.contains_key(*key) {
            lines.push(format!("{key}={value}"));
        }
    }

    let mut out = lines.join("\n");
    out.push('\n');
    fs::write(path, out)
}
