use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Serialize)]
pub struct AppError {
    pub error: String,
    pub code: String,
    pub trace_id: String,
}

impl AppError {
    pub fn new(
        code: impl Into<String>,
        message: impl Into<String>,
        trace_id: impl Into<String>,
    ) -> Self {
        Self {
            error: message.into(),
            code: code.into(),
            trace_id: trace_id.into(),
        }
    }

    pub fn validation(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new("ERR_VALIDATION", message, trace_id)
    }

    pub fn system(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new("ERR_SYSTEM", message, trace_id)
    }

    pub fn dependency(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new("ERR_DEPENDENCY", message, trace_id)
    }

    pub fn tooling_not_found(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new("ERR_TOOLING_NOT_FOUND", message, trace_id)
    }

    pub fn connection_failed(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new("ERR_CONNECTION_FAILED", message, trace_id)
    }

    pub fn channel_lost(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new("ERR_CHANNEL_LOST", message, trace_id)
    }

    pub fn app_not_installed(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new("ERR_APP_NOT_INSTALLED", message, trace_id)
    }

    pub fn foreground_timeout(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new("ERR_FOREGROUND_TIMEOUT", message, trace_id)
    }

    pub fn element_not_found(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new("ERR_ELEMENT_NOT_FOUND", message, trace_id)
    }

    pub fn account_not_matched(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new("ERR_ACCOUNT_NOT_MATCHED", message, trace_id)
    }

    pub fn is_tooling_not_found(&self) -> bool {
        self.code == "ERR_TOOLING_NOT_FOUND"
    }

    pub fn is_connection_failed(&self) -> bool {
        self.code == "ERR_CONNECTION_FAILED"
    }

    pub fn is_channel_lost(&self) -> bool {
        self.code == "ERR_CHANNEL_LOST"
    }

    pub fn is_element_not_found(&self) -> bool {
        self.code == "ERR_ELEMENT_NOT_FOUND"
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.error, self.code)
    }
}

impl std::error::Error for AppError {}
