//! Thin boundary over the `adb` device-bridge tool. Every call is an
//! external process invocation with captured stdout/stderr; a non-zero exit
//! code is the sole failure signal consulted.

use std::{io, path::PathBuf, process::Output};

use tokio::process::Command;

#[derive(Debug)]
pub enum AdbFailure {
    NotFound,
    Io(String),
    Exit {
        status: i32,
        stdout: String,
        stderr: String,
    },
}

pub fn adb_path() -> PathBuf {
    if let Some(path) = fleetcheck_util::read_env_trimmed("FLEETCHECK_ADB_PATH")
        .or_else(|| fleetcheck_util::read_env_trimmed("ADB_PATH"))
    {
        return fleetcheck_util::expand_user(&path);
    }
    if let Some(sdk_root) = fleetcheck_util::read_env_trimmed("ANDROID_SDK_ROOT")
        .or_else(|| fleetcheck_util::read_env_trimmed("ANDROID_HOME"))
    {
        let candidate = fleetcheck_util::expand_user(&sdk_root)
            .join("platform-tools")
            .join("adb");
        if candidate.exists() {
            return candidate;
        }
    }
    PathBuf::from("adb")
}

/// Serial under which the emulator on `port` registers with the bridge.
pub fn emulator_serial(port: u16) -> String {
    format!("emulator-{port}")
}

pub async fn adb_output(args: &[&str]) -> Result<Output, AdbFailure> {
    let mut cmd = Command::new(adb_path());
    cmd.args(args)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped());
    let output = cmd.output().await.map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            AdbFailure::NotFound
        } else {
            AdbFailure::Io(e.to_string())
        }
    })?;

    if output.status.success() {
        Ok(output)
    } else {
        Err(AdbFailure::Exit {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

pub fn format_tool_output(stdout: &str, stderr: &str) -> String {
    let stdout = stdout.trim();
    let stderr = stderr.trim();
    let mut out = String::new();

    if !stdout.is_empty() {
        out.push_str("stdout:\n");
        out.push_str(stdout);
        out.push('\n');
    }
    if !stderr.is_empty() {
        out.push_str("stderr:\n");
        out.push_str(stderr);
        out.push('\n');
    }

    out
}

pub fn adb_failure_message(err: &AdbFailure) -> String {
    match err {
        AdbFailure::NotFound => {
            "adb not found (set FLEETCHECK_ADB_PATH or ANDROID_SDK_ROOT)".into()
        }
        AdbFailure::Io(msg) => msg.clone(),
        AdbFailure::Exit {
            status,
            stdout,
            stderr,
        } => {
            let detail = format_tool_output(stdout, stderr);
            if detail.trim().is_empty() {
                format!("adb command failed with exit {status}")
            } else {
                format!("adb command failed with exit {status}: {}", detail.trim())
            }
        }
    }
}

pub async fn adb_get_prop(serial: &str, prop: &str) -> Result<String, AdbFailure> {
    let args = ["-s", serial, "shell", "getprop", prop];
    let output = adb_output(&args).await?;
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Boot-completion probe: true once the device reports
/// `sys.boot_completed = 1`. Any bridge failure reads as "not ready yet".
pub async fn boot_completed(serial: &str) -> bool {
    matches!(adb_get_prop(serial, "sys.boot_completed").await.as_deref(), Ok("1"))
}

/// Parses `adb devices -l` output into `(serial, state)` pairs.
pub fn parse_device_list(output: &str) -> Vec<(String, String)> {
    let mut devices = Vec::new();
    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with("List of devices attached") {
            continue;
        }
        let mut parts = line.split_whitespace();
        let serial = match parts.next() {
            Some(s) => s,
            None => continue,
        };
        let state = match parts.next() {
            Some(s) => s,
            None => continue,
        };
        devices.push((serial.to_string(), state.to_string()));
    }
    devices
}

/// Whether the bridge lists `serial` in the `device` (fully online) state.
pub async fn device_listed(serial: &str) -> Result<bool, AdbFailure> {
    let output = adb_output(&["devices", "-l"]).await?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(parse_device_list(&stdout)
        .iter()
        .any(|(listed, state)| listed == serial && state == "device"))
}

/// Runs an emulator console command (`adb -s <serial> emu ...`).
pub async fn adb_emu(serial: &str, emu_args: &[&str]) -> Result<Output, AdbFailure> {
    let mut args = vec!["-s", serial, "emu"];
    args.extend_from_slice(emu_args);
    adb_output(&args).await
}
