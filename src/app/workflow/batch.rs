use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use uuid::Uuid;

use crate::app::adb::connection::ConnectionManager;
use crate::app::config::AppConfig;
use crate::app::error::AppError;
use crate::app::models::{Account, BatchResult, Outcome};
use crate::app::uiauto::session::{AdbUiDriver, AutomationSession};
use crate::app::workflow::subscribe::SubscriptionWorkflow;

/// Cooperative cancellation, checked between accounts. An in-flight
/// bounded wait is allowed to finish; the batch stops before the next
/// account's workflow starts.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Outcome listener, decoupled from any transport. The webhook notifier
/// implements this; so can a UI status line.
pub trait ResultSink {
    fn on_account_result(&self, identifier: &str, outcome: &Outcome);
    fn on_batch_finished(&self, _result: &BatchResult) {}
}

/// Establishes automation sessions on demand. Seam between the batch
/// loop and the connection manager so the loop is testable without a
/// device.
pub trait SessionFactory {
    fn establish(&self, trace_id: &str) -> Result<AutomationSession, AppError>;
}

/// Production factory: full connection sequence, then an adb-backed
/// driver bound to the endpoint that won the probe.
pub struct BridgeSessionFactory<'a> {
    manager: &'a ConnectionManager,
    config: &'a AppConfig,
}

impl<'a> BridgeSessionFactory<'a> {
    pub fn new(manager: &'a ConnectionManager, config: &'a AppConfig) -> Self {
        Self { manager, config }
    }
}

impl SessionFactory for BridgeSessionFactory<'_> {
    fn establish(&self, trace_id: &str) -> Result<AutomationSession, AppError> {
        let handle = self.manager.establish(trace_id)?;
        let driver = AdbUiDriver::new(
            self.manager.runner(),
            self.manager.adb_program(),
            handle.endpoint(),
            Duration::from_secs(self.config.connection.command_timeout_s),
        );
        Ok(AutomationSession::new(
            handle,
            Box::new(driver),
            self.config.workflow.clone(),
        ))
    }
}

/// Runs one per-account routine against a live session.
pub trait AccountRunner {
    fn run(
        &self,
        session: &AutomationSession,
        account: &Account,
        trace_id: &str,
    ) -> Result<(), AppError>;
}

impl AccountRunner for SubscriptionWorkflow {
    fn run(
        &self,
        session: &AutomationSession,
        account: &Account,
        trace_id: &str,
    ) -> Result<(), AppError> {
        self.run_for_account(session, account, trace_id)
    }
}

/// Sequential batch driver. One live session at a time, input order
/// preserved, one outcome per attempted account; a failing account never
/// takes the rest of the batch down with it.
pub struct BatchRunner<'a> {
    factory: &'a dyn SessionFactory,
    workflow: &'a dyn AccountRunner,
    sink: Option<&'a dyn ResultSink>,
    cancel: CancelToken,
}

impl<'a> BatchRunner<'a> {
    pub fn new(
        factory: &'a dyn SessionFactory,
        workflow: &'a dyn AccountRunner,
        sink: Option<&'a dyn ResultSink>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            factory,
            workflow,
            sink,
            cancel,
        }
    }

    pub fn process_all(&self, accounts: &[Account]) -> Result<BatchResult, AppError> {
        let mut result = BatchResult::default();
        let mut session: Option<AutomationSession> = None;

        for account in accounts {
            if self.cancel.is_cancelled() {
                info!("batch cancelled; stopping before the next account");
                result.cancelled = true;
                break;
            }

            let trace_id = Uuid::new_v4().to_string();

            // A session lost or failed on the previous account gets
            // re-established here, before this account's workflow.
            if session.as_ref().map(|s| s.is_lost()).unwrap_or(true) {
                match self.factory.establish(&trace_id) {
                    Ok(fresh) => session = Some(fresh),
                    Err(err) if err.is_tooling_not_found() => {
                        // Without tooling there is nothing to retry for
                        // any account; the whole batch aborts.
                        return Err(err);
                    }
                    Err(err) => {
                        warn!(
                            trace_id = %trace_id,
                            error = %err,
                            "connection not available for this account"
                        );
                        session = None;
                        let outcome = Outcome::Failure {
                            code: err.code,
                            reason: err.error,
                        };
                        self.report(&mut result, &account.identifier, outcome);
                        continue;
                    }
                }
            }

            let live = session.as_ref().ok_or_else(|| {
                AppError::system("session missing after establish", &trace_id)
            })?;

            let outcome = match self.workflow.run(live, account, &trace_id) {
                Ok(()) => Outcome::Success,
                Err(err) => {
                    if err.is_channel_lost() {
                        warn!(
                            trace_id = %trace_id,
                            "control channel lost mid-workflow; will re-establish"
                        );
                    }
                    Outcome::Failure {
                        code: err.code,
                        reason: err.error,
                    }
                }
            };

            // Discard a dead session so the next account reconnects.
            if session.as_ref().map(|s| s.is_lost()).unwrap_or(false) {
                session = None;
            }

            self.report(&mut result, &account.identifier, outcome);
        }

        if let Some(sink) = self.sink {
            sink.on_batch_finished(&result);
        }
        info!(
            total = result.outcomes.len(),
            succeeded = result.success_count(),
            failed = result.failure_count(),
            cancelled = result.cancelled,
            "batch finished"
        );
        Ok(result)
    }

    fn report(&self, result: &mut BatchResult, identifier: &str, outcome: Outcome) {
        if let Some(sink) = self.sink {
            sink.on_account_result(identifier, &outcome);
        }
        result.record(identifier, outcome);
    }
}
