use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use subpilot::app::adb::connection::ConnectionManager;
use subpilot::app::adb::locator::{adb_tool_info, find_adb_program, is_host_process_running};
use subpilot::app::adb::runner::{CommandRunner, SystemRunner};
use subpilot::app::config::{load_config, AppConfig};
use subpilot::app::error::AppError;
use subpilot::app::logging::init_logging;
use subpilot::app::models::{BatchResult, EndpointProbe, Outcome, ToolInfo};
use subpilot::app::notifier::WebhookNotifier;
use subpilot::app::store::AccountStore;
use subpilot::app::workflow::batch::{
    BatchRunner, BridgeSessionFactory, CancelToken, ResultSink,
};
use subpilot::app::workflow::keypad::KeypadLayout;
use subpilot::app::workflow::mask::mask_identifier;
use subpilot::app::workflow::subscribe::SubscriptionWorkflow;

const USAGE: &str = "\
subpilot — automated broker-app subscription runs over ADB

Usage:
  subpilot run [--json]                 process every stored account once
  subpilot check [--json]               report tooling, host and endpoint status
  subpilot accounts list [--json]       list stored accounts (masked)
  subpilot accounts add <identifier> <pin> <display-name>
  subpilot accounts remove <identifier>

Config file: $SUBPILOT_CONFIG_PATH or ~/.subpilot.json";

fn main() {
    init_logging();
    let args: Vec<String> = std::env::args().skip(1).collect();
    let code = match dispatch(&args) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err}");
            1
        }
    };
    std::process::exit(code);
}

fn dispatch(args: &[String]) -> Result<i32, AppError> {
    let trace_id = Uuid::new_v4().to_string();
    let json = args.iter().any(|arg| arg == "--json");
    let positional: Vec<&String> = args.iter().filter(|arg| !arg.starts_with("--")).collect();

    match positional.first().map(|s| s.as_str()) {
        Some("run") => run_batch(&trace_id, json),
        Some("check") => run_check(&trace_id, json),
        Some("accounts") => run_accounts(&positional[1..], &trace_id, json),
        _ => {
            eprintln!("{USAGE}");
            Ok(2)
        }
    }
}

#[derive(Serialize)]
struct RunSummary {
    tool: &'static str,
    trace_id: String,
    result: BatchResult,
}

fn run_batch(trace_id: &str, json: bool) -> Result<i32, AppError> {
    let config = load_config(trace_id)?;
    let store = AccountStore::open(&config.resolved_store_path(), trace_id)?;
    let accounts = store.list_accounts(trace_id)?;
    if accounts.is_empty() {
        eprintln!("No accounts stored; add one with `subpilot accounts add`.");
        return Ok(2);
    }

    let runner = Arc::new(SystemRunner);
    let manager = ConnectionManager::new(
        runner,
        config.simulator.clone(),
        config.connection.clone(),
        trace_id,
    )?;
    let factory = BridgeSessionFactory::new(&manager, &config);
    let workflow = SubscriptionWorkflow::new(
        config.target_app.clone(),
        KeypadLayout::from_settings(&config.keypad),
    );
    let notifier = WebhookNotifier::from_settings(&config.notify);
    let sink = notifier.as_ref().map(|n| n as &dyn ResultSink);

    let batch = BatchRunner::new(&factory, &workflow, sink, CancelToken::new());
    let result = batch.process_all(&accounts)?;

    if json {
        let summary = RunSummary {
            tool: "subpilot",
            trace_id: trace_id.to_string(),
            result: result.clone(),
        };
        println!("{}", serde_json::to_string_pretty(&summary).unwrap_or_default());
    } else {
        for outcome in &result.outcomes {
            let shown = mask_identifier(&outcome.identifier, trace_id)
                .unwrap_or_else(|_| "(invalid identifier)".to_string());
            match &outcome.outcome {
                Outcome::Success => println!("{shown}  ok"),
                Outcome::Failure { code, reason } => {
                    println!("{shown}  FAILED [{code}] {reason}")
                }
            }
        }
        println!(
            "{} processed, {} succeeded, {} failed{}",
            result.outcomes.len(),
            result.success_count(),
            result.failure_count(),
            if result.cancelled { " (cancelled)" } else { "" }
        );
    }

    Ok(if result.failure_count() == 0 && !result.cancelled {
        0
    } else {
        1
    })
}

#[derive(Serialize)]
struct CheckReport {
    tool: &'static str,
    trace_id: String,
    adb: ToolInfo,
    host_running: bool,
    endpoints: Vec<EndpointProbe>,
}

fn run_check(trace_id: &str, json: bool) -> Result<i32, AppError> {
    let config = load_config(trace_id)?;
    let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);

    let (adb, endpoints) = match find_adb_program(&config.simulator, trace_id) {
        Ok(program) => {
            let info = adb_tool_info(runner.as_ref(), &program, trace_id);
            let manager = ConnectionManager::new(
                Arc::clone(&runner),
                config.simulator.clone(),
                config.connection.clone(),
                trace_id,
            )?;
            let probes = manager.survey(trace_id)?;
            (info, probes)
        }
        Err(err) => (
            ToolInfo {
                available: false,
                version_output: String::new(),
                command_path: String::new(),
                error: Some(err.error),
            },
            Vec::new(),
        ),
    };

    let report = CheckReport {
        tool: "subpilot",
        trace_id: trace_id.to_string(),
        adb,
        host_running: is_host_process_running(&config.simulator.host_image_name),
        endpoints,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report).unwrap_or_default());
    } else {
        if report.adb.available {
            println!("adb: {} ({})", report.adb.command_path, report.adb.version_output);
        } else {
            println!(
                "adb: unavailable ({})",
                report.adb.error.as_deref().unwrap_or("unknown")
            );
        }
        println!(
            "host process: {}",
            if report.host_running { "running" } else { "not running" }
        );
        for probe in &report.endpoints {
            println!("  {}  {}", probe.endpoint, probe.last_status.label());
        }
    }

    Ok(if report.adb.available { 0 } else { 1 })
}

#[derive(Serialize)]
struct AccountRow {
    identifier: String,
    display_name: String,
}

fn run_accounts(args: &[&String], trace_id: &str, json: bool) -> Result<i32, AppError> {
    let config: AppConfig = load_config(trace_id)?;
    let store = AccountStore::open(&config.resolved_store_path(), trace_id)?;

    match args.first().map(|s| s.as_str()) {
        Some("list") | None => {
            let accounts = store.list_accounts(trace_id)?;
            if json {
                let rows: Vec<AccountRow> = accounts
                    .iter()
                    .map(|account| AccountRow {
                        identifier: account.identifier.clone(),
                        display_name: account.display_name.clone(),
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&rows).unwrap_or_default());
            } else if accounts.is_empty() {
                println!("No accounts stored.");
            } else {
                for account in &accounts {
                    let shown = mask_identifier(&account.identifier, trace_id)
                        .unwrap_or_else(|_| "(invalid identifier)".to_string());
                    println!("{shown}  {}", account.display_name);
                }
            }
            Ok(0)
        }
        Some("add") => {
            let (identifier, pin, name) = match (args.get(1), args.get(2), args.get(3)) {
                (Some(identifier), Some(pin), Some(name)) => (identifier, pin, name),
                _ => {
                    eprintln!("usage: subpilot accounts add <identifier> <pin> <display-name>");
                    return Ok(2);
                }
            };
            // Reject identifiers the masker cannot handle up front; the
            // workflow would never match them against a selector row.
            mask_identifier(identifier, trace_id)?;
            store.create_account(identifier, pin, name, trace_id)?;
            println!("Account added.");
            Ok(0)
        }
        Some("remove") => {
            let Some(identifier) = args.get(1) else {
                eprintln!("usage: subpilot accounts remove <identifier>");
                return Ok(2);
            };
            if store.delete_account(identifier, trace_id)? {
                println!("Account removed.");
                Ok(0)
            } else {
                eprintln!("No such account.");
                Ok(1)
            }
        }
        Some(other) => {
            eprintln!("unknown accounts action: {other}\n{USAGE}");
            Ok(2)
        }
    }
}
