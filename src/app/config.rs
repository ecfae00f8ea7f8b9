use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::app::error::AppError;
use crate::app::uiauto::locator::Locator;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SimulatorSettings {
    /// Directory holding the emulator's bundled platform tools (adb).
    pub install_dir: String,
    /// Explicit adb override; empty means "resolve from install_dir/PATH".
    pub adb_path: String,
    /// Explicit host program override; empty means "search known locations".
    pub host_executable: String,
    /// Process image name used for the liveness check.
    pub host_image_name: String,
    /// Candidate loopback ports, probed strictly in this order.
    pub endpoint_ports: Vec<u16>,
}

impl Default for SimulatorSettings {
    fn default() -> Self {
        Self {
            install_dir: String::new(),
            adb_path: String::new(),
            host_executable: String::new(),
            host_image_name: "Nox.exe".to_string(),
            endpoint_ports: vec![62001, 62025, 62026, 5555, 62028],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TargetAppSettings {
    pub package: String,
    /// Activity suffix for the shell-level launch fallback
    /// (`am start -n <package>/<launch_component>`).
    pub launch_component: String,
}

impl Default for TargetAppSettings {
    fn default() -> Self {
        Self {
            package: "com.hexin.plat.android".to_string(),
            launch_component: ".InitPluginActivity".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionSettings {
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    /// Quantum slept after kill-server and again after start-server.
    pub server_reset_delay_ms: u64,
    pub host_launch_timeout_s: u64,
    pub host_poll_interval_ms: u64,
    /// Settle time between a "connected" ack and the status re-query.
    pub probe_settle_ms: u64,
    pub disconnect_settle_ms: u64,
    pub command_timeout_s: u64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay_ms: 2_000,
            server_reset_delay_ms: 2_000,
            host_launch_timeout_s: 60,
            host_poll_interval_ms: 2_000,
            probe_settle_ms: 2_000,
            disconnect_settle_ms: 500,
            command_timeout_s: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FallbackStep {
    pub locator: Locator,
    pub timeout_s: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowSettings {
    pub foreground_timeout_s: u64,
    pub poll_interval_ms: u64,
    pub element_timeout_s: u64,
    /// Dismiss-locator patterns tried in order each popup round.
    pub popup_locators: Vec<Locator>,
    pub popup_rounds: u32,
    /// Navigation fallbacks for the trading tab, tried in order, each
    /// with its own wait ceiling.
    pub trade_tab_steps: Vec<FallbackStep>,
    pub account_row: Locator,
    pub pin_field: Locator,
    pub login_button: Locator,
    pub result_dialog_dismiss: Locator,
    pub subscribe_button: Locator,
    pub key_delay_min_ms: u64,
    pub key_delay_max_ms: u64,
    pub result_dialog_timeout_s: u64,
    pub subscribe_timeout_s: u64,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            foreground_timeout_s: 15,
            poll_interval_ms: 1_000,
            element_timeout_s: 10,
            popup_locators: vec![
                Locator::Id("close_button".to_string()),
                Locator::Text("关闭".to_string()),
                Locator::Text("取消".to_string()),
                Locator::Text("跳过".to_string()),
                Locator::Text("稍后".to_string()),
                Locator::Text("知道了".to_string()),
            ],
            popup_rounds: 10,
            trade_tab_steps: vec![
                FallbackStep {
                    locator: Locator::Text("交易".to_string()),
                    timeout_s: 20,
                },
                FallbackStep {
                    locator: Locator::Desc("交易".to_string()),
                    timeout_s: 5,
                },
                FallbackStep {
                    locator: Locator::Id("tab_trade".to_string()),
                    timeout_s: 5,
                },
            ],
            account_row: Locator::Id("txt_account_value".to_string()),
            pin_field: Locator::Id("weituo_edit_trade_password".to_string()),
            login_button: Locator::Id("weituo_btn_login".to_string()),
            result_dialog_dismiss: Locator::Id("iv_operate_cancel".to_string()),
            subscribe_button: Locator::Id("option_apply".to_string()),
            key_delay_min_ms: 100,
            key_delay_max_ms: 300,
            result_dialog_timeout_s: 3,
            subscribe_timeout_s: 3,
        }
    }
}

impl WorkflowSettings {
    pub fn key_delay_range(&self) -> std::ops::RangeInclusive<u64> {
        self.key_delay_min_ms..=self.key_delay_max_ms
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KeypadSettings {
    /// Digit label -> screen coordinate on the fixed PIN keypad.
    pub keys: BTreeMap<String, [i32; 2]>,
    /// Coordinate used for characters missing from the table.
    pub fallback: [i32; 2],
}

impl Default for KeypadSettings {
    fn default() -> Self {
        let mut keys = BTreeMap::new();
        keys.insert("1".to_string(), [66, 723]);
        keys.insert("2".to_string(), [205, 721]);
        keys.insert("3".to_string(), [328, 720]);
        keys.insert("4".to_string(), [64, 792]);
        keys.insert("5".to_string(), [201, 785]);
        keys.insert("6".to_string(), [332, 783]);
        keys.insert("7".to_string(), [66, 853]);
        keys.insert("8".to_string(), [201, 846]);
        keys.insert("9".to_string(), [326, 852]);
        keys.insert("0".to_string(), [197, 916]);
        Self {
            keys,
            // The '0' key; keeps a bad character inside the keypad area.
            fallback: [197, 916],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct NotifySettings {
    /// Enterprise-chat webhook; empty disables outbound notifications.
    pub webhook_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub simulator: SimulatorSettings,
    #[serde(default)]
    pub target_app: TargetAppSettings,
    #[serde(default)]
    pub connection: ConnectionSettings,
    #[serde(default)]
    pub workflow: WorkflowSettings,
    #[serde(default)]
    pub keypad: KeypadSettings,
    #[serde(default)]
    pub notify: NotifySettings,
    #[serde(default)]
    pub store_path: String,
    #[serde(default)]
    pub version: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            simulator: SimulatorSettings::default(),
            target_app: TargetAppSettings::default(),
            connection: ConnectionSettings::default(),
            workflow: WorkflowSettings::default(),
            keypad: KeypadSettings::default(),
            notify: NotifySettings::default(),
            store_path: String::new(),
            version: "0.3.2".to_string(),
        }
    }
}

impl AppConfig {
    pub fn resolved_store_path(&self) -> PathBuf {
        if !self.store_path.trim().is_empty() {
            return PathBuf::from(self.store_path.trim());
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".subpilot.db")
    }
}

pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("SUBPILOT_CONFIG_PATH") {
        return PathBuf::from(path);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".subpilot.json")
}

pub fn backup_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".subpilot.backup.json")
}

pub fn load_config(trace_id: &str) -> Result<AppConfig, AppError> {
    load_config_from_path(&config_path(), trace_id)
}

pub fn save_config(config: &AppConfig, trace_id: &str) -> Result<(), AppError> {
    save_config_to_path(config, &config_path(), &backup_config_path(), trace_id)
}

pub fn load_config_from_path(path: &Path, trace_id: &str) -> Result<AppConfig, AppError> {
    if !path.exists() {
        return Ok(AppConfig::default());
    }
    let raw = fs::read_to_string(path)
        .map_err(|err| AppError::system(format!("Failed to read config: {err}"), trace_id))?;
    let value: serde_json::Value = serde_json::from_str(&raw)
        .map_err(|err| AppError::system(format!("Failed to parse config: {err}"), trace_id))?;
    let mut config: AppConfig = serde_json::from_value(value.clone()).unwrap_or_default();
    config = apply_legacy_overrides(config, &value);
    Ok(validate_config(config))
}

pub fn save_config_to_path(
    config: &AppConfig,
    path: &Path,
    backup_path: &Path,
    trace_id: &str,
) -> Result<(), AppError> {
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    if path.exists() {
        let _ = fs::copy(path, backup_path);
    }
    let payload = serde_json::to_string_pretty(config)
        .map_err(|err| AppError::system(format!("Failed to serialize config: {err}"), trace_id))?;
    fs::write(path, payload)
        .map_err(|err| AppError::system(format!("Failed to write config: {err}"), trace_id))?;
    Ok(())
}

/// Flat keys written by the original desktop assistant's `app_config.json`.
fn apply_legacy_overrides(mut config: AppConfig, value: &serde_json::Value) -> AppConfig {
    if let Some(path) = value.get("simulator_path").and_then(|v| v.as_str()) {
        if !path.trim().is_empty() {
            config.simulator.install_dir = path.to_string();
        }
    }
    if let Some(exe) = value.get("simulator_exe_path").and_then(|v| v.as_str()) {
        if !exe.trim().is_empty() {
            config.simulator.host_executable = exe.to_string();
        }
    }
    if let Some(package) = value.get("broker_package").and_then(|v| v.as_str()) {
        if !package.trim().is_empty() {
            config.target_app.package = package.to_string();
        }
    }
    if let Some(url) = value.get("webhook_url").and_then(|v| v.as_str()) {
        config.notify.webhook_url = url.to_string();
    }
    config
}

fn validate_config(mut config: AppConfig) -> AppConfig {
    let defaults = AppConfig::default();
    if config.connection.max_attempts == 0 {
        config.connection.max_attempts = defaults.connection.max_attempts;
    }
    if config.connection.command_timeout_s == 0 {
        config.connection.command_timeout_s = defaults.connection.command_timeout_s;
    }
    if config.connection.host_launch_timeout_s == 0 {
        config.connection.host_launch_timeout_s = defaults.connection.host_launch_timeout_s;
    }
    if config.connection.host_poll_interval_ms == 0 {
        config.connection.host_poll_interval_ms = defaults.connection.host_poll_interval_ms;
    }
    if config.simulator.endpoint_ports.is_empty() {
        config.simulator.endpoint_ports = defaults.simulator.endpoint_ports;
    }
    if config.target_app.package.trim().is_empty() {
        config.target_app.package = defaults.target_app.package;
    }
    if config.workflow.poll_interval_ms == 0 {
        config.workflow.poll_interval_ms = defaults.workflow.poll_interval_ms;
    }
    if config.workflow.popup_rounds == 0 {
        config.workflow.popup_rounds = defaults.workflow.popup_rounds;
    }
    if config.workflow.key_delay_max_ms < config.workflow.key_delay_min_ms {
        config.workflow.key_delay_max_ms = config.workflow.key_delay_min_ms;
    }
    if config.keypad.keys.is_empty() {
        config.keypad = defaults.keypad;
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_the_known_port_order() {
        let config = AppConfig::default();
        assert_eq!(
            config.simulator.endpoint_ports,
            vec![62001, 62025, 62026, 5555, 62028]
        );
        assert_eq!(config.target_app.package, "com.hexin.plat.android");
        assert_eq!(config.keypad.keys.get("5"), Some(&[201, 785]));
    }

    #[test]
    fn merges_legacy_flat_keys() {
        let value = serde_json::json!({
            "simulator_path": "D:\\Nox\\bin",
            "simulator_exe_path": "D:\\Nox\\bin\\Nox.exe",
            "broker_package": "com.example.broker"
        });
        let config: AppConfig = serde_json::from_value(value.clone()).unwrap_or_default();
        let config = apply_legacy_overrides(config, &value);
        assert_eq!(config.simulator.install_dir, "D:\\Nox\\bin");
        assert_eq!(config.simulator.host_executable, "D:\\Nox\\bin\\Nox.exe");
        assert_eq!(config.target_app.package, "com.example.broker");
    }

    #[test]
    fn clamps_invalid_values() {
        let mut config = AppConfig::default();
        config.connection.max_attempts = 0;
        config.simulator.endpoint_ports.clear();
        config.workflow.key_delay_min_ms = 400;
        config.workflow.key_delay_max_ms = 100;
        let validated = validate_config(config);
        assert_eq!(validated.connection.max_attempts, 3);
        assert!(!validated.simulator.endpoint_ports.is_empty());
        assert_eq!(validated.workflow.key_delay_max_ms, 400);
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        let backup = dir.path().join("config.backup.json");

        let mut config = AppConfig::default();
        config.notify.webhook_url = "https://example.invalid/hook".to_string();
        save_config_to_path(&config, &path, &backup, "test-trace").expect("save");

        let loaded = load_config_from_path(&path, "test-trace").expect("load");
        assert_eq!(loaded, config);

        // Second save snapshots the previous file.
        save_config_to_path(&config, &path, &backup, "test-trace").expect("save again");
        assert!(backup.exists());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let loaded =
            load_config_from_path(Path::new("/does/not/exist.json"), "test-trace").expect("load");
        assert_eq!(loaded, AppConfig::default());
    }
}
