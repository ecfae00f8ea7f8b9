use std::path::{Path, PathBuf};
use std::time::Duration;

use sysinfo::{ProcessesToUpdate, System};

use crate::app::adb::runner::CommandRunner;
use crate::app::config::SimulatorSettings;
use crate::app::error::AppError;
use crate::app::models::{Endpoint, ToolInfo};

pub fn normalize_command_path(value: &str) -> String {
    let trimmed = value.trim();
    if let Some(inner) = trimmed
        .strip_prefix('"')
        .and_then(|candidate| candidate.strip_suffix('"'))
    {
        return inner.trim().to_string();
    }
    if let Some(inner) = trimmed
        .strip_prefix('\'')
        .and_then(|candidate| candidate.strip_suffix('\''))
    {
        return inner.trim().to_string();
    }
    trimmed.to_string()
}

fn adb_file_name() -> &'static str {
    if cfg!(windows) {
        "adb.exe"
    } else {
        "adb"
    }
}

/// Resolves the adb program: explicit override first, then the known
/// install locations in order, then a PATH lookup. A configured override
/// that does not exist is an error rather than silently falling through.
pub fn find_adb_program(
    settings: &SimulatorSettings,
    trace_id: &str,
) -> Result<String, AppError> {
    let override_path = normalize_command_path(&settings.adb_path);
    if !override_path.is_empty() {
        let path = Path::new(&override_path);
        if path.is_dir() {
            return Err(AppError::validation(
                "adb_path must point to an executable file",
                trace_id,
            ));
        }
        if !path.exists() {
            return Err(AppError::tooling_not_found(
                format!("Configured adb not found: {override_path}"),
                trace_id,
            ));
        }
        return Ok(override_path);
    }

    for candidate in adb_candidates(settings) {
        if candidate.is_file() {
            return Ok(candidate.to_string_lossy().to_string());
        }
    }

    if path_lookup(adb_file_name()).is_some() {
        return Ok("adb".to_string());
    }

    Err(AppError::tooling_not_found(
        "adb executable not found in the configured simulator directory or on PATH",
        trace_id,
    ))
}

fn adb_candidates(settings: &SimulatorSettings) -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    let install_dir = normalize_command_path(&settings.install_dir);
    if !install_dir.is_empty() {
        let dir = PathBuf::from(&install_dir);
        candidates.push(dir.join(adb_file_name()));
        if let Some(parent) = dir.parent() {
            candidates.push(parent.join("bin").join(adb_file_name()));
        }
    }
    if let Ok(android_home) = std::env::var("ANDROID_HOME") {
        if !android_home.trim().is_empty() {
            candidates.push(
                PathBuf::from(android_home)
                    .join("platform-tools")
                    .join(adb_file_name()),
            );
        }
    }
    candidates
}

fn path_lookup(file_name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(file_name);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

/// Resolves the emulator host program (the device host application) via
/// the same ordered-candidates pattern as the adb lookup.
pub fn find_host_executable(
    settings: &SimulatorSettings,
    trace_id: &str,
) -> Result<PathBuf, AppError> {
    let configured = normalize_command_path(&settings.host_executable);
    if !configured.is_empty() {
        let path = PathBuf::from(&configured);
        if path.is_file() {
            return Ok(path);
        }
    }

    let image = settings.host_image_name.trim();
    let mut candidates = Vec::new();
    let install_dir = normalize_command_path(&settings.install_dir);
    if !install_dir.is_empty() && !image.is_empty() {
        let dir = PathBuf::from(&install_dir);
        candidates.push(dir.join(image));
        if let Some(parent) = dir.parent() {
            candidates.push(parent.join(image));
            candidates.push(parent.join("bin").join(image));
        }
    }
    if !image.is_empty() {
        candidates.push(PathBuf::from("C:\\Program Files\\Nox\\bin").join(image));
        candidates.push(PathBuf::from("C:\\Program Files (x86)\\Nox\\bin").join(image));
        candidates.push(PathBuf::from("D:\\Program Files\\Nox\\bin").join(image));
    }

    for candidate in candidates {
        if candidate.is_file() {
            return Ok(candidate);
        }
    }

    Err(AppError::tooling_not_found(
        format!("Host program {image} not found in any known location"),
        trace_id,
    ))
}

/// Process-table liveness check for the host program's image name.
pub fn is_host_process_running(image_name: &str) -> bool {
    let needle = image_stem(image_name);
    if needle.is_empty() {
        return false;
    }
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);
    system.processes().values().any(|process| {
        image_stem(&process.name().to_string_lossy()) == needle
    })
}

fn image_stem(name: &str) -> String {
    let lower = name.trim().to_lowercase();
    lower
        .strip_suffix(".exe")
        .map(|stem| stem.to_string())
        .unwrap_or(lower)
}

/// The fixed, ordered candidate list. Priority is expressed purely by
/// list order; the connection manager never re-sorts it.
pub fn candidate_endpoints(settings: &SimulatorSettings) -> Vec<Endpoint> {
    settings
        .endpoint_ports
        .iter()
        .map(|port| Endpoint::loopback(*port))
        .collect()
}

pub fn adb_tool_info(
    runner: &dyn CommandRunner,
    program: &str,
    trace_id: &str,
) -> ToolInfo {
    match runner.run(
        program,
        &["version".to_string()],
        Duration::from_secs(10),
        trace_id,
    ) {
        Ok(output) if output.succeeded() => ToolInfo {
            available: true,
            version_output: output.stdout.trim().to_string(),
            command_path: program.to_string(),
            error: None,
        },
        Ok(output) => ToolInfo {
            available: false,
            version_output: output.stdout.trim().to_string(),
            command_path: program.to_string(),
            error: Some(format!(
                "adb version exited with {:?}: {}",
                output.exit_code,
                output.stderr.trim()
            )),
        },
        Err(err) => ToolInfo {
            available: false,
            version_output: String::new(),
            command_path: program.to_string(),
            error: Some(err.error),
        },
    }
}
