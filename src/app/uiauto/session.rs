use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::app::adb::connection::ConnectionHandle;
use crate::app::adb::parse::{package_installed, parse_foreground_package};
use crate::app::adb::runner::{CommandOutput, CommandRunner};
use crate::app::config::WorkflowSettings;
use crate::app::error::AppError;
use crate::app::models::Endpoint;
use crate::app::uiauto::dump::parse_ui_dump;
use crate::app::uiauto::locator::{Locator, UiNode};

/// Low-level device driver behind the automation session.
///
/// Contract: methods fail only for channel-level problems (the bridge or
/// device is unreachable). "The element is not there" is not an error at
/// this layer; it is an empty dump result.
pub trait UiDriver: Send {
    fn dump(&self, trace_id: &str) -> Result<Vec<UiNode>, AppError>;
    fn tap(&self, x: i32, y: i32, trace_id: &str) -> Result<(), AppError>;
    fn shell(&self, args: &[&str], trace_id: &str) -> Result<CommandOutput, AppError>;
}

/// Production driver: drives one device serial through adb.
pub struct AdbUiDriver {
    runner: Arc<dyn CommandRunner>,
    adb_program: String,
    serial: String,
    command_timeout: Duration,
}

impl AdbUiDriver {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        adb_program: impl Into<String>,
        endpoint: &Endpoint,
        command_timeout: Duration,
    ) -> Self {
        Self {
            runner,
            adb_program: adb_program.into(),
            serial: endpoint.serial(),
            command_timeout,
        }
    }

    fn run(&self, args: Vec<String>, trace_id: &str) -> Result<CommandOutput, AppError> {
        let mut full = vec!["-s".to_string(), self.serial.clone()];
        full.extend(args);
        let output = self
            .runner
            .run(&self.adb_program, &full, self.command_timeout, trace_id)?;
        if device_gone(&output) {
            return Err(AppError::system(
                format!("Device {} dropped off the bridge: {}", self.serial, output.stderr.trim()),
                trace_id,
            ));
        }
        Ok(output)
    }
}

/// adb reports a vanished device on stderr while still exiting; treat
/// those markers as loss of the control channel.
fn device_gone(output: &CommandOutput) -> bool {
    let stderr = output.stderr.to_lowercase();
    stderr.contains("device offline")
        || stderr.contains("device still authorizing")
        || stderr.contains("not found")
        || stderr.contains("no devices/emulators found")
}

impl UiDriver for AdbUiDriver {
    fn dump(&self, trace_id: &str) -> Result<Vec<UiNode>, AppError> {
        let output = self.run(
            vec![
                "exec-out".to_string(),
                "uiautomator".to_string(),
                "dump".to_string(),
                "/dev/tty".to_string(),
            ],
            trace_id,
        )?;
        if !output.succeeded() {
            return Err(AppError::dependency(
                format!("UI dump failed: {}", output.stderr.trim()),
                trace_id,
            ));
        }
        Ok(parse_ui_dump(&output.stdout))
    }

    fn tap(&self, x: i32, y: i32, trace_id: &str) -> Result<(), AppError> {
        let output = self.run(
            vec![
                "shell".to_string(),
                "input".to_string(),
                "tap".to_string(),
                x.to_string(),
                y.to_string(),
            ],
            trace_id,
        )?;
        if !output.succeeded() {
            return Err(AppError::system(
                format!("input tap failed: {}", output.stderr.trim()),
                trace_id,
            ));
        }
        Ok(())
    }

    fn shell(&self, args: &[&str], trace_id: &str) -> Result<CommandOutput, AppError> {
        let mut full = vec!["shell".to_string()];
        full.extend(args.iter().map(|arg| arg.to_string()));
        self.run(full, trace_id)
    }
}

/// One UI-automation session over one ConnectionHandle. All element
/// operations are bounded polls against hierarchy dumps; there is no
/// event push from the device.
pub struct AutomationSession {
    handle: ConnectionHandle,
    driver: Box<dyn UiDriver>,
    settings: WorkflowSettings,
}

impl AutomationSession {
    pub fn new(
        handle: ConnectionHandle,
        driver: Box<dyn UiDriver>,
        settings: WorkflowSettings,
    ) -> Self {
        Self {
            handle,
            driver,
            settings,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        self.handle.endpoint()
    }

    pub fn is_lost(&self) -> bool {
        self.handle.is_invalidated()
    }

    pub fn settings(&self) -> &WorkflowSettings {
        &self.settings
    }

    /// Simulates a channel failure; production code invalidates only
    /// through the channel-error path.
    #[cfg(test)]
    pub(crate) fn invalidate_for_tests(&self) {
        self.handle.invalidate();
    }

    /// Operations on an invalidated handle fail fast; recovery means
    /// re-running the connection manager, not retrying the call.
    fn guard(&self, trace_id: &str) -> Result<(), AppError> {
        if self.handle.is_invalidated() {
            return Err(AppError::channel_lost(
                format!("Connection to {} was lost", self.handle.endpoint()),
                trace_id,
            ));
        }
        Ok(())
    }

    fn channel_error(&self, err: AppError) -> AppError {
        self.handle.invalidate();
        if err.is_channel_lost() {
            err
        } else {
            AppError::channel_lost(err.error, err.trace_id)
        }
    }

    fn dump(&self, trace_id: &str) -> Result<Vec<UiNode>, AppError> {
        self.guard(trace_id)?;
        self.driver
            .dump(trace_id)
            .map_err(|err| self.channel_error(err))
    }

    fn shell(&self, args: &[&str], trace_id: &str) -> Result<CommandOutput, AppError> {
        self.guard(trace_id)?;
        self.driver
            .shell(args, trace_id)
            .map_err(|err| self.channel_error(err))
    }

    pub fn app_installed(&self, package: &str, trace_id: &str) -> Result<bool, AppError> {
        let output = self.shell(&["pm", "list", "packages", package], trace_id)?;
        Ok(package_installed(&output.stdout, package))
    }

    /// Primary launch via a LAUNCHER-intent monkey event; falls back to
    /// an explicit `am start` with the configured component when monkey
    /// cannot resolve the package.
    pub fn launch_app(
        &self,
        package: &str,
        launch_component: &str,
        trace_id: &str,
    ) -> Result<bool, AppError> {
        let monkey = self.shell(
            &[
                "monkey",
                "-p",
                package,
                "-c",
                "android.intent.category.LAUNCHER",
                "1",
            ],
            trace_id,
        )?;
        let monkey_failed = !monkey.succeeded()
            || monkey.stdout.contains("No activities found")
            || monkey.stderr.contains("No activities found");
        if !monkey_failed {
            return Ok(true);
        }

        warn!(trace_id = %trace_id, package = %package, "monkey launch failed; trying am start");
        let component = if launch_component.starts_with('.') {
            format!("{package}/{launch_component}")
        } else {
            launch_component.to_string()
        };
        let started = self.shell(&["am", "start", "-n", &component], trace_id)?;
        Ok(started.succeeded() && !started.stderr.contains("Error"))
    }

    pub fn current_foreground(&self, trace_id: &str) -> Result<Option<String>, AppError> {
        let output = self.shell(&["dumpsys", "window"], trace_id)?;
        Ok(parse_foreground_package(&output.stdout))
    }

    /// Polls at the fixed interval until the package owns the window
    /// focus or the ceiling elapses.
    pub fn wait_foreground(
        &self,
        package: &str,
        timeout: Duration,
        trace_id: &str,
    ) -> Result<bool, AppError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.current_foreground(trace_id)?.as_deref() == Some(package) {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            std::thread::sleep(Duration::from_millis(self.settings.poll_interval_ms));
        }
    }

    /// Clicks through the known dismiss patterns until one full round
    /// finds nothing, or the round cap is hit. Returns how many
    /// popups were dismissed.
    pub fn dismiss_known_popups(&self, trace_id: &str) -> Result<u32, AppError> {
        let locators = self.settings.popup_locators.clone();
        let mut dismissed = 0u32;
        for _round in 0..self.settings.popup_rounds {
            let nodes = self.dump(trace_id)?;
            let hit = locators.iter().find_map(|locator| {
                nodes
                    .iter()
                    .find(|node| locator.matches(node))
                    .map(|node| (locator, node.clone()))
            });
            let Some((locator, node)) = hit else {
                break;
            };
            info!(trace_id = %trace_id, locator = %locator, "dismissing popup");
            match node.center() {
                Some((x, y)) => self.click_at(x, y, trace_id)?,
                None => break,
            }
            dismissed += 1;
            std::thread::sleep(Duration::from_millis(self.settings.poll_interval_ms));
        }
        Ok(dismissed)
    }

    pub fn wait_for_element(
        &self,
        locator: &Locator,
        timeout: Duration,
        trace_id: &str,
    ) -> Result<bool, AppError> {
        let deadline = Instant::now() + timeout;
        loop {
            let nodes = self.dump(trace_id)?;
            if nodes.iter().any(|node| locator.matches(node)) {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            std::thread::sleep(Duration::from_millis(self.settings.poll_interval_ms));
        }
    }

    pub fn find_all(&self, locator: &Locator, trace_id: &str) -> Result<Vec<UiNode>, AppError> {
        let nodes = self.dump(trace_id)?;
        Ok(nodes
            .into_iter()
            .filter(|node| locator.matches(node))
            .collect())
    }

    pub fn click(&self, locator: &Locator, trace_id: &str) -> Result<(), AppError> {
        let nodes = self.dump(trace_id)?;
        let node = nodes
            .iter()
            .find(|node| locator.matches(node))
            .ok_or_else(|| {
                AppError::element_not_found(format!("No element matches {locator}"), trace_id)
            })?;
        let (x, y) = node.center().ok_or_else(|| {
            AppError::element_not_found(
                format!("Element {locator} has no tappable bounds"),
                trace_id,
            )
        })?;
        self.click_at(x, y, trace_id)
    }

    pub fn click_at(&self, x: i32, y: i32, trace_id: &str) -> Result<(), AppError> {
        self.guard(trace_id)?;
        self.driver
            .tap(x, y, trace_id)
            .map_err(|err| self.channel_error(err))
    }

    pub fn text(&self, locator: &Locator, trace_id: &str) -> Result<String, AppError> {
        let nodes = self.dump(trace_id)?;
        nodes
            .iter()
            .find(|node| locator.matches(node))
            .map(|node| node.text.trim().to_string())
            .ok_or_else(|| {
                AppError::element_not_found(format!("No element matches {locator}"), trace_id)
            })
    }

    /// Unconditional teardown step; callers ignore failures here beyond
    /// logging, so a dead channel cannot mask the original error.
    pub fn force_stop(&self, package: &str, trace_id: &str) -> Result<(), AppError> {
        let output = self.shell(&["am", "force-stop", package], trace_id)?;
        if !output.succeeded() {
            warn!(
                trace_id = %trace_id,
                package = %package,
                stderr = %output.stderr.trim(),
                "force-stop exited non-zero"
            );
        }
        Ok(())
    }
}
