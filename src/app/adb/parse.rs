use regex::Regex;

use crate::app::models::{DeviceStatus, DeviceSummary, Endpoint};

pub fn parse_adb_devices(output: &str) -> Vec<DeviceSummary> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter(|line| !line.trim_start().starts_with('*'))
        .filter(|line| !line.to_lowercase().contains("list of devices"))
        .filter_map(|line| {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.len() < 2 {
                return None;
            }
            Some(DeviceSummary {
                serial: tokens[0].to_string(),
                state: tokens[1].to_string(),
            })
        })
        .collect()
}

/// Derives the status of one endpoint from a fresh device listing. An
/// endpoint missing from the listing is Absent, never "assumed online".
pub fn status_of(devices: &[DeviceSummary], endpoint: &Endpoint) -> DeviceStatus {
    let serial = endpoint.serial();
    devices
        .iter()
        .find(|device| device.serial == serial)
        .map(|device| DeviceStatus::from_adb_state(&device.state))
        .unwrap_or(DeviceStatus::Absent)
}

/// Classifies `adb connect` output. The bridge acknowledges both fresh
/// and pre-existing bindings; everything else is a refusal.
pub fn connect_acknowledged(output: &str) -> bool {
    let lower = output.to_lowercase();
    lower.contains("connected to") || lower.contains("already connected")
}

/// Pulls the foreground package out of `dumpsys window` focus lines,
/// e.g. `mCurrentFocus=Window{f5e9a0 u0 com.hexin.plat.android/...}`.
pub fn parse_foreground_package(output: &str) -> Option<String> {
    let focus_re = Regex::new(
        r"m(?:CurrentFocus|FocusedApp)=\S+\{[^}]*?\s([A-Za-z][\w.]+)/[^\s}]+",
    )
    .ok()?;
    for line in output.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(caps) = focus_re.captures(trimmed) {
            return Some(caps[1].to_string());
        }
    }
    None
}

/// Checks `pm list packages <pkg>` output for an exact package match;
/// `pm` prefix-filters, so `com.example` would also list
/// `com.example.beta`.
pub fn package_installed(output: &str, package: &str) -> bool {
    output
        .lines()
        .filter_map(|line| line.trim().strip_prefix("package:"))
        .any(|entry| {
            let name = entry
                .rsplit_once('=')
                .map(|(_, pkg)| pkg)
                .unwrap_or(entry)
                .trim();
            name == package
        })
}
