use serde::{Deserialize, Serialize};
use std::fmt;

/// One candidate attachment point for the emulator's ADB bridge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn loopback(port: u16) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port,
        }
    }

    /// The `host:port` form adb uses as a device serial.
    pub fn serial(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Bridge-reported state of one endpoint, derived fresh on every probe.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeviceStatus {
    Absent,
    Offline,
    Unauthorized,
    Online,
}

impl DeviceStatus {
    pub fn from_adb_state(state: &str) -> Self {
        match state.trim() {
            "device" => DeviceStatus::Online,
            "offline" => DeviceStatus::Offline,
            "unauthorized" => DeviceStatus::Unauthorized,
            _ => DeviceStatus::Absent,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            DeviceStatus::Absent => "absent",
            DeviceStatus::Offline => "offline",
            DeviceStatus::Unauthorized => "unauthorized",
            DeviceStatus::Online => "online",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceSummary {
    pub serial: String,
    pub state: String,
}

/// Outcome of one probe pass over a candidate endpoint, kept for the
/// failure report when no endpoint comes up.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct EndpointProbe {
    pub endpoint: Endpoint,
    pub last_status: DeviceStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolInfo {
    pub available: bool,
    pub version_output: String,
    pub command_path: String,
    pub error: Option<String>,
}

/// A broker account as stored by the persistence collaborator. The pin
/// must never appear in logs; use the masked rendering instead.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Account {
    pub identifier: String,
    pub pin: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure { code: String, reason: String },
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccountOutcome {
    pub identifier: String,
    pub outcome: Outcome,
}

/// Ordered, append-only per-account results for one orchestrator run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchResult {
    pub outcomes: Vec<AccountOutcome>,
    pub cancelled: bool,
}

impl BatchResult {
    pub fn record(&mut self, identifier: impl Into<String>, outcome: Outcome) {
        self.outcomes.push(AccountOutcome {
            identifier: identifier.into(),
            outcome,
        });
    }

    pub fn success_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|item| item.outcome.is_success())
            .count()
    }

    pub fn failure_count(&self) -> usize {
        self.outcomes.len() - self.success_count()
    }
}
