use std::path::Path;

use chrono::Utc;
use rusqlite::{params, Connection};

use crate::app::error::AppError;
use crate::app::models::Account;

/// SQLite-backed account store. The orchestrator only ever reads it;
/// create/delete exist for the management CLI.
pub struct AccountStore {
    conn: Connection,
}

impl AccountStore {
    pub fn open(path: &Path, trace_id: &str) -> Result<Self, AppError> {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(path).map_err(|err| {
            AppError::system(format!("Failed to open account store: {err}"), trace_id)
        })?;
        bootstrap(&conn, trace_id)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory(trace_id: &str) -> Result<Self, AppError> {
        let conn = Connection::open_in_memory().map_err(|err| {
            AppError::system(format!("Failed to open account store: {err}"), trace_id)
        })?;
        bootstrap(&conn, trace_id)?;
        Ok(Self { conn })
    }

    /// Accounts in insertion order, which is also batch processing order.
    pub fn list_accounts(&self, trace_id: &str) -> Result<Vec<Account>, AppError> {
        let mut statement = self
            .conn
            .prepare("SELECT identifier, pin, display_name FROM t_account ORDER BY id")
            .map_err(|err| store_error(err, trace_id))?;
        let rows = statement
            .query_map([], |row| {
                Ok(Account {
                    identifier: row.get(0)?,
                    pin: row.get(1)?,
                    display_name: row.get(2)?,
                })
            })
            .map_err(|err| store_error(err, trace_id))?;
        let mut accounts = Vec::new();
        for row in rows {
            accounts.push(row.map_err(|err| store_error(err, trace_id))?);
        }
        Ok(accounts)
    }

    pub fn create_account(
        &self,
        identifier: &str,
        pin: &str,
        display_name: &str,
        trace_id: &str,
    ) -> Result<(), AppError> {
        if identifier.trim().is_empty() {
            return Err(AppError::validation("identifier is required", trace_id));
        }
        if pin.trim().is_empty() {
            return Err(AppError::validation("pin is required", trace_id));
        }
        let inserted = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO t_account (identifier, pin, display_name, created_at) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    identifier.trim(),
                    pin.trim(),
                    display_name.trim(),
                    Utc::now().to_rfc3339()
                ],
            )
            .map_err(|err| store_error(err, trace_id))?;
        if inserted == 0 {
            return Err(AppError::validation(
                "An account with this identifier already exists",
                trace_id,
            ));
        }
        Ok(())
    }

    pub fn delete_account(&self, identifier: &str, trace_id: &str) -> Result<bool, AppError> {
        let removed = self
            .conn
            .execute(
                "DELETE FROM t_account WHERE identifier = ?1",
                params![identifier.trim()],
            )
            .map_err(|err| store_error(err, trace_id))?;
        Ok(removed > 0)
    }
}

fn bootstrap(conn: &Connection, trace_id: &str) -> Result<(), AppError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS t_account (\
            id INTEGER PRIMARY KEY AUTOINCREMENT,\
            identifier TEXT NOT NULL UNIQUE,\
            pin TEXT NOT NULL,\
            display_name TEXT NOT NULL,\
            created_at TEXT NOT NULL\
         );",
    )
    .map_err(|err| store_error(err, trace_id))
}

fn store_error(err: rusqlite::Error, trace_id: &str) -> AppError {
    AppError::system(format!("Account store query failed: {err}"), trace_id)
}
