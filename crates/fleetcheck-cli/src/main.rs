use std::{sync::Arc, time::Duration};

use clap::{Parser, Subcommand};
use tracing::{info, warn};

use fleetcheck_core::{
    avd::AvdManager,
    cancel::ShutdownFlag,
    orchestrator::{run_fleet, FleetConfig, FleetDeps},
    ports::{DEFAULT_AUTOMATION_BASE_PORT, DEFAULT_BASE_PORT},
    queue::WorkQueue,
    session::SessionConfig,
    store::DeviceStateStore,
};

mod appium;
mod confirm;

#[derive(Parser)]
#[command(name = "fleetcheck", version, about = "Emulated-device fleet for phone number checks")]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Run the fleet over the input dataset
    Run {
        /// Input CSV with one subject per row
        #[arg(long, default_value_t = default_input())]
        input: String,
        /// Output CSV accumulating confirmed rows
        #[arg(long, default_value_t = default_output())]
        output: String,
        /// Name of the column carrying the phone number
        #[arg(long, default_value_t = default_subject_column())]
        subject_column: String,
        /// Device name; repeat for more workers
        #[arg(long = "device", default_values_t = default_devices())]
        devices: Vec<String>,
        /// System image passed to avdmanager
        #[arg(long, default_value_t = default_system_image())]
        system_image: String,
        #[arg(long, default_value_t = default_u32("FLEETCHECK_RAM_MB", 4096))]
        ram_mb: u32,
        #[arg(long, default_value_t = default_disk_size())]
        disk_size: String,
        #[arg(long, default_value_t = DEFAULT_BASE_PORT)]
        base_port: u16,
        #[arg(long, default_value_t = DEFAULT_AUTOMATION_BASE_PORT)]
        automation_base_port: u16,
        /// Seconds to wait for a device to finish booting
        #[arg(long, default_value_t = default_u64("FLEETCHECK_READY_TIMEOUT", 600))]
        ready_timeout: u64,
        /// Seconds to wait for operator authentication
        #[arg(long, default_value_t = default_u64("FLEETCHECK_AUTH_TIMEOUT", 600))]
        auth_timeout: u64,
        /// Seconds to wait for the first-launch prompt
        #[arg(long, default_value_t = default_u64("FLEETCHECK_ONBOARD_TIMEOUT", 120))]
        onboard_timeout: u64,
        /// Automation server command; port and log level are appended
        #[arg(long, default_value_t = default_server_command())]
        server_command: String,
        /// Package name of the app under automation
        #[arg(long, default_value_t = default_app_package())]
        app_package: String,
    },
    /// Clear the authentication flag for one device, or all of them
    ResetAuth {
        /// Device name; omit to reset every device
        device: Option<String>,
    },
    /// Report queue statistics without starting any device
    Pending {
        #[arg(long, default_value_t = default_input())]
        input: String,
        #[arg(long, default_value_t = default_output())]
        output: String,
        #[arg(long, default_value_t = default_subject_column())]
        subject_column: String,
    },
}

fn default_input() -> String {
    std::env::var("FLEETCHECK_INPUT").unwrap_or_else(|_| "numbers.csv".into())
}
fn default_output() -> String {
    std::env::var("FLEETCHECK_OUTPUT").unwrap_or_else(|_| "registered.csv".into())
}
fn default_subject_column() -> String {
    std::env::var("FLEETCHECK_SUBJECT_COLUMN").unwrap_or_else(|_| "phone".into())
}
fn default_devices() -> Vec<String> {
    match std::env::var("FLEETCHECK_DEVICES") {
        Ok(list) => list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        Err(_) => vec!["FLEETCHECK_AVD_0".into()],
    }
}
fn default_system_image() -> String {
    std::env::var("FLEETCHECK_SYSTEM_IMAGE")
        .unwrap_or_else(|_| "system-images;android-30;google_apis;x86_64".into())
}
fn default_disk_size() -> String {
    std::env::var("FLEETCHECK_DISK_SIZE").unwrap_or_else(|_| "8G".into())
}
fn default_server_command() -> String {
    std::env::var("FLEETCHECK_SERVER_COMMAND").unwrap_or_else(|_| "appium".into())
}
fn default_app_package() -> String {
    std::env::var("FLEETCHECK_APP_PACKAGE").unwrap_or_else(|_| "org.telegram.messenger".into())
}
fn default_u32(var: &str, fallback: u32) -> u32 {
    std::env::var(var)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(fallback)
}
fn default_u64(var: &str, fallback: u64) -> u64 {
    std::env::var(var)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(fallback)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    fleetcheck_util::init_tracing()?;
    fleetcheck_telemetry::init_with_env("fleetcheck", env!("CARGO_PKG_VERSION"));

    let cli = Cli::parse();
    match cli.cmd {
        Cmd::Run {
            input,
            output,
            subject_column,
            devices,
            system_image,
            ram_mb,
            disk_size,
            base_port,
            automation_base_port,
            ready_timeout,
            auth_timeout,
            onboard_timeout,
            server_command,
            app_package,
        } => {
            let queue = Arc::new(WorkQueue::load(
                &fleetcheck_util::expand_user(&input),
                &fleetcheck_util::expand_user(&output),
                &subject_column,
            )?);
            if queue.pending_count() == 0 {
                info!("nothing to do, all subjects are already recorded");
                return Ok(());
            }

            let shutdown = ShutdownFlag::new();
            let signal_flag = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received, asking workers to stop");
                    signal_flag.trigger();
                }
            });

            let device_count = devices.len();
            let config = FleetConfig {
                devices,
                system_image,
                ram_mb,
                disk_size,
                base_port,
                automation_base_port,
                ready_timeout: Duration::from_secs(ready_timeout),
                auth_timeout: Duration::from_secs(auth_timeout),
                onboard_timeout: Duration::from_secs(onboard_timeout),
                session: SessionConfig {
                    server_command,
                    startup_timeout: Duration::from_secs(60),
                },
            };
            let deps = FleetDeps {
                queue,
                store: Arc::new(DeviceStateStore::new(DeviceStateStore::default_path())),
                avd: Arc::new(AvdManager::new()),
                factory: Arc::new(appium::AppiumDriverFactory::new(app_package)),
                surface: Arc::new(confirm::TerminalConfirmation::new()),
                shutdown,
            };

            fleetcheck_telemetry::event(
                "fleet.run",
                &[("devices", &device_count.to_string())],
            );
            run_fleet(config, deps).await;
        }

        Cmd::ResetAuth { device } => {
            let store = DeviceStateStore::new(DeviceStateStore::default_path());
            match device {
                Some(name) => {
                    store.reset_authentication(&name);
                    println!("authentication reset for {name}");
                }
                None => {
                    store.reset_all_authentication();
                    println!("authentication reset for all devices");
                }
            }
        }

        Cmd::Pending {
            input,
            output,
            subject_column,
        } => {
            let queue = WorkQueue::load(
                &fleetcheck_util::expand_user(&input),
                &fleetcheck_util::expand_user(&output),
                &subject_column,
            )?;
            println!("pending={}", queue.pending_count());
            println!("recorded={}", queue.recorded_count());
        }
    }

    Ok(())
}
