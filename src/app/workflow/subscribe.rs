use std::time::Duration;

use rand::Rng;
use tracing::{info, warn};

use crate::app::config::TargetAppSettings;
use crate::app::error::AppError;
use crate::app::models::Account;
use crate::app::uiauto::session::AutomationSession;
use crate::app::workflow::keypad::KeypadLayout;
use crate::app::workflow::mask::mask_identifier;

/// The fixed per-account business sequence: find the account row, log in
/// through the PIN keypad, dismiss result dialogs, trigger the one-click
/// subscribe action. Entirely synchronous; one account at a time.
pub struct SubscriptionWorkflow {
    target: TargetAppSettings,
    keypad: KeypadLayout,
}

impl SubscriptionWorkflow {
    pub fn new(target: TargetAppSettings, keypad: KeypadLayout) -> Self {
        Self { target, keypad }
    }

    /// Runs the whole sequence for one account. Whatever happens in the
    /// steps, the target app is force-stopped before this returns.
    pub fn run_for_account(
        &self,
        session: &AutomationSession,
        account: &Account,
        trace_id: &str,
    ) -> Result<(), AppError> {
        let _teardown = AppTeardown {
            session,
            package: &self.target.package,
            trace_id,
        };
        self.run_steps(session, account, trace_id)
    }

    fn run_steps(
        &self,
        session: &AutomationSession,
        account: &Account,
        trace_id: &str,
    ) -> Result<(), AppError> {
        let package = self.target.package.as_str();
        let settings = session.settings().clone();
        let masked = mask_identifier(&account.identifier, trace_id)?;
        info!(trace_id = %trace_id, account = %masked, "starting subscription run");

        if !session.app_installed(package, trace_id)? {
            return Err(AppError::app_not_installed(
                format!("{package} is not installed on the device"),
                trace_id,
            ));
        }

        if !session.launch_app(package, &self.target.launch_component, trace_id)? {
            return Err(AppError::foreground_timeout(
                format!("{package} failed to launch via monkey and am start"),
                trace_id,
            ));
        }
        let foreground = session.wait_foreground(
            package,
            Duration::from_secs(settings.foreground_timeout_s),
            trace_id,
        )?;
        if !foreground {
            return Err(AppError::foreground_timeout(
                format!("{package} never reached the foreground"),
                trace_id,
            ));
        }

        session.dismiss_known_popups(trace_id)?;

        self.open_trade_tab(session, trace_id)?;

        // The selector shows masked labels, so the masked rendering is
        // compared against the rows verbatim. Equality, not substring: a
        // mask like 3023****9271 must not match a longer sibling row.
        if !session.wait_for_element(
            &settings.account_row,
            Duration::from_secs(settings.element_timeout_s),
            trace_id,
        )? {
            return Err(AppError::element_not_found(
                "Account selector rows never appeared",
                trace_id,
            ));
        }
        let rows = session.find_all(&settings.account_row, trace_id)?;
        let row = rows
            .iter()
            .find(|node| node.text.trim() == masked)
            .ok_or_else(|| {
                AppError::account_not_matched(
                    format!("No selector row shows {masked} ({} rows listed)", rows.len()),
                    trace_id,
                )
            })?;
        let (x, y) = row.center().ok_or_else(|| {
            AppError::element_not_found("Matched account row has no tappable bounds", trace_id)
        })?;
        info!(trace_id = %trace_id, account = %masked, "account row matched");
        session.click_at(x, y, trace_id)?;

        if !session.wait_for_element(
            &settings.pin_field,
            Duration::from_secs(settings.element_timeout_s),
            trace_id,
        )? {
            return Err(AppError::element_not_found(
                "PIN entry field never appeared",
                trace_id,
            ));
        }
        session.click(&settings.pin_field, trace_id)?;
        self.enter_pin(session, &account.pin, &settings.key_delay_range(), trace_id)?;

        if !session.wait_for_element(
            &settings.login_button,
            Duration::from_secs(settings.element_timeout_s),
            trace_id,
        )? {
            return Err(AppError::element_not_found(
                "Login button never appeared",
                trace_id,
            ));
        }
        session.click(&settings.login_button, trace_id)?;
        info!(trace_id = %trace_id, account = %masked, "login submitted");

        // Post-login the app may announce an allotment; close it so it
        // cannot cover the subscribe control.
        if session.wait_for_element(
            &settings.result_dialog_dismiss,
            Duration::from_secs(settings.result_dialog_timeout_s),
            trace_id,
        )? {
            info!(trace_id = %trace_id, "dismissing post-login result dialog");
            if let Err(err) = session.click(&settings.result_dialog_dismiss, trace_id) {
                if !err.is_element_not_found() {
                    return Err(err);
                }
            }
        }

        // The one-click subscribe control; its absence is terminal for
        // this account, not a retry condition.
        if !session.wait_for_element(
            &settings.subscribe_button,
            Duration::from_secs(settings.subscribe_timeout_s),
            trace_id,
        )? {
            return Err(AppError::element_not_found(
                "One-click subscribe control is not present",
                trace_id,
            ));
        }
        session.click(&settings.subscribe_button, trace_id)?;
        info!(trace_id = %trace_id, account = %masked, "subscribe action triggered");
        Ok(())
    }

    /// Tries the configured navigation fallbacks in priority order, each
    /// within its own ceiling.
    fn open_trade_tab(
        &self,
        session: &AutomationSession,
        trace_id: &str,
    ) -> Result<(), AppError> {
        let steps = session.settings().trade_tab_steps.clone();
        for step in &steps {
            if session.wait_for_element(
                &step.locator,
                Duration::from_secs(step.timeout_s),
                trace_id,
            )? {
                info!(trace_id = %trace_id, locator = %step.locator, "opening trade tab");
                session.click(&step.locator, trace_id)?;
                return Ok(());
            }
        }
        Err(AppError::element_not_found(
            "Trade tab not reachable via any configured locator",
            trace_id,
        ))
    }

    /// Keys the PIN digit by digit at the fixed keypad coordinates. The
    /// inter-digit pause is drawn from a band rather than being constant
    /// so the cadence is not perfectly uniform.
    fn enter_pin(
        &self,
        session: &AutomationSession,
        pin: &str,
        delay_range: &std::ops::RangeInclusive<u64>,
        trace_id: &str,
    ) -> Result<(), AppError> {
        let mut rng = rand::thread_rng();
        for key in pin.chars() {
            let (x, y) = self.keypad.coordinate_for(key, trace_id);
            session.click_at(x, y, trace_id)?;
            let pause = rng.gen_range(delay_range.clone());
            std::thread::sleep(Duration::from_millis(pause));
        }
        Ok(())
    }
}

/// Guaranteed teardown: force-stops the app on every exit path. A failed
/// stop (a dead channel included) only logs; it must not mask the
/// original workflow error.
struct AppTeardown<'a> {
    session: &'a AutomationSession,
    package: &'a str,
    trace_id: &'a str,
}

impl Drop for AppTeardown<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.session.force_stop(self.package, self.trace_id) {
            warn!(
                trace_id = %self.trace_id,
                package = %self.package,
                error = %err,
                "app teardown failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::adb::connection::ConnectionHandle;
    use crate::app::adb::runner::CommandOutput;
    use crate::app::config::WorkflowSettings;
    use crate::app::models::Endpoint;
    use crate::app::uiauto::locator::UiNode;
    use crate::app::uiauto::session::UiDriver;
    use std::sync::{Arc, Mutex};

    fn node(resource_id: &str, text: &str, desc: &str, bounds: (i32, i32, i32, i32)) -> UiNode {
        UiNode {
            resource_id: resource_id.to_string(),
            text: text.to_string(),
            content_desc: desc.to_string(),
            bounds: Some(bounds),
            ..UiNode::default()
        }
    }

    /// A single static "screen" is enough to walk the whole sequence:
    /// each step only checks for its own element.
    fn full_screen() -> Vec<UiNode> {
        let pkg = "com.hexin.plat.android:id/";
        vec![
            node("", "交易", "", (0, 1200, 180, 1280)),
            node(
                &format!("{pkg}txt_account_value"),
                "3023****9271",
                "",
                (40, 300, 680, 360),
            ),
            node(
                &format!("{pkg}txt_account_value"),
                "6789****4321",
                "",
                (40, 380, 680, 440),
            ),
            node(
                &format!("{pkg}weituo_edit_trade_password"),
                "",
                "",
                (40, 500, 680, 560),
            ),
            node(&format!("{pkg}weituo_btn_login"), "", "", (40, 600, 680, 660)),
            node(&format!("{pkg}option_apply"), "", "", (40, 700, 680, 760)),
        ]
    }

    struct ScriptedDriver {
        screen: Mutex<Vec<UiNode>>,
        installed: bool,
        fail_dumps: Mutex<bool>,
        taps: Mutex<Vec<(i32, i32)>>,
        shell_calls: Mutex<Vec<String>>,
    }

    impl ScriptedDriver {
        fn new(screen: Vec<UiNode>, installed: bool) -> Arc<Self> {
            Arc::new(Self {
                screen: Mutex::new(screen),
                installed,
                fail_dumps: Mutex::new(false),
                taps: Mutex::new(Vec::new()),
                shell_calls: Mutex::new(Vec::new()),
            })
        }

        fn force_stop_count(&self) -> usize {
            self.shell_calls
                .lock()
                .expect("calls")
                .iter()
                .filter(|call| call.starts_with("am force-stop"))
                .count()
        }
    }

    impl UiDriver for Arc<ScriptedDriver> {
        fn dump(&self, trace_id: &str) -> Result<Vec<UiNode>, AppError> {
            if *self.fail_dumps.lock().expect("flag") {
                return Err(AppError::system("bridge vanished", trace_id));
            }
            Ok(self.screen.lock().expect("screen").clone())
        }

        fn tap(&self, x: i32, y: i32, _trace_id: &str) -> Result<(), AppError> {
            self.taps.lock().expect("taps").push((x, y));
            Ok(())
        }

        fn shell(&self, args: &[&str], _trace_id: &str) -> Result<CommandOutput, AppError> {
            let joined = args.join(" ");
            self.shell_calls.lock().expect("calls").push(joined.clone());
            let stdout = if joined.starts_with("pm list packages") {
                if self.installed {
                    format!("package:{}", args.last().unwrap_or(&""))
                } else {
                    String::new()
                }
            } else if joined.starts_with("dumpsys window") {
                "mCurrentFocus=Window{abc u0 com.hexin.plat.android/com.hexin.plat.android.Main}"
                    .to_string()
            } else {
                String::new()
            };
            Ok(CommandOutput {
                stdout,
                stderr: String::new(),
                exit_code: Some(0),
            })
        }
    }

    fn fast_settings() -> WorkflowSettings {
        WorkflowSettings {
            poll_interval_ms: 1,
            foreground_timeout_s: 1,
            element_timeout_s: 1,
            result_dialog_timeout_s: 0,
            subscribe_timeout_s: 0,
            key_delay_min_ms: 0,
            key_delay_max_ms: 0,
            popup_rounds: 2,
            ..WorkflowSettings::default()
        }
    }

    fn session_for(driver: Arc<ScriptedDriver>) -> AutomationSession {
        AutomationSession::new(
            ConnectionHandle::for_tests(Endpoint::loopback(62001)),
            Box::new(driver),
            fast_settings(),
        )
    }

    fn account() -> Account {
        Account {
            identifier: "302319669271".to_string(),
            pin: "280114".to_string(),
            display_name: "测试账户".to_string(),
        }
    }

    fn workflow() -> SubscriptionWorkflow {
        SubscriptionWorkflow::new(TargetAppSettings::default(), KeypadLayout::default())
    }

    #[test]
    fn happy_path_subscribes_and_tears_down_once() {
        let driver = ScriptedDriver::new(full_screen(), true);
        let session = session_for(Arc::clone(&driver));

        workflow()
            .run_for_account(&session, &account(), "trace")
            .expect("subscription should succeed");

        assert_eq!(driver.force_stop_count(), 1);

        // Six PIN digits were keyed at the fixed keypad coordinates.
        let layout = KeypadLayout::default();
        let taps = driver.taps.lock().expect("taps").clone();
        for key in "280114".chars() {
            let expected = layout.coordinate_for(key, "trace");
            assert!(taps.contains(&expected), "missing tap for digit {key}");
        }
    }

    #[test]
    fn pin_taps_preserve_digit_order() {
        let driver = ScriptedDriver::new(full_screen(), true);
        let session = session_for(Arc::clone(&driver));
        workflow()
            .run_for_account(&session, &account(), "trace")
            .expect("subscription should succeed");

        let layout = KeypadLayout::default();
        let expected: Vec<(i32, i32)> = "280114"
            .chars()
            .map(|key| layout.coordinate_for(key, "trace"))
            .collect();
        let taps = driver.taps.lock().expect("taps").clone();
        let keypad_taps: Vec<(i32, i32)> = taps
            .into_iter()
            .filter(|tap| expected.contains(tap))
            .collect();
        assert_eq!(keypad_taps, expected);
    }

    #[test]
    fn missing_app_fails_the_account_but_still_tears_down() {
        let driver = ScriptedDriver::new(full_screen(), false);
        let session = session_for(Arc::clone(&driver));

        let err = workflow()
            .run_for_account(&session, &account(), "trace")
            .expect_err("must fail");
        assert_eq!(err.code, "ERR_APP_NOT_INSTALLED");
        assert_eq!(driver.force_stop_count(), 1);
    }

    #[test]
    fn unmatched_account_row_is_account_not_matched() {
        let driver = ScriptedDriver::new(full_screen(), true);
        let session = session_for(Arc::clone(&driver));

        let other = Account {
            identifier: "999988887777".to_string(),
            ..account()
        };
        let err = workflow()
            .run_for_account(&session, &other, "trace")
            .expect_err("must fail");
        assert_eq!(err.code, "ERR_ACCOUNT_NOT_MATCHED");
        assert_eq!(driver.force_stop_count(), 1);
    }

    #[test]
    fn masked_match_is_exact_equality() {
        // A row showing a prefix of the mask must not match.
        let mut screen = full_screen();
        for node in &mut screen {
            if node.text == "3023****9271" {
                node.text = "3023****9271x".to_string();
            }
        }
        let driver = ScriptedDriver::new(screen, true);
        let session = session_for(Arc::clone(&driver));

        let err = workflow()
            .run_for_account(&session, &account(), "trace")
            .expect_err("must fail");
        assert_eq!(err.code, "ERR_ACCOUNT_NOT_MATCHED");
    }

    #[test]
    fn short_identifier_fails_before_touching_the_device() {
        let driver = ScriptedDriver::new(full_screen(), true);
        let session = session_for(Arc::clone(&driver));

        let short = Account {
            identifier: "1234".to_string(),
            ..account()
        };
        let err = workflow()
            .run_for_account(&session, &short, "trace")
            .expect_err("must fail");
        assert_eq!(err.code, "ERR_VALIDATION");
        // No launch happened, but teardown still ran.
        assert_eq!(driver.force_stop_count(), 1);
    }

    #[test]
    fn absent_subscribe_control_is_terminal() {
        let screen: Vec<UiNode> = full_screen()
            .into_iter()
            .filter(|node| !node.resource_id.ends_with("option_apply"))
            .collect();
        let driver = ScriptedDriver::new(screen, true);
        let session = session_for(Arc::clone(&driver));

        let err = workflow()
            .run_for_account(&session, &account(), "trace")
            .expect_err("must fail");
        assert!(err.is_element_not_found());
        assert!(err.error.contains("subscribe"));
        assert_eq!(driver.force_stop_count(), 1);
    }

    #[test]
    fn channel_loss_mid_flow_surfaces_channel_lost() {
        let driver = ScriptedDriver::new(full_screen(), true);
        let session = session_for(Arc::clone(&driver));
        *driver.fail_dumps.lock().expect("flag") = true;

        let err = workflow()
            .run_for_account(&session, &account(), "trace")
            .expect_err("must fail");
        assert!(err.is_channel_lost());
        assert!(session.is_lost());
    }
}
