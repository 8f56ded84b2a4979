//! Connection bootstrap utilities for SQLite.
//!
//! # Responsibility
//! - Open file or in-memory SQLite connections.
//! - Attach secondary store files under a schema alias.
//! - Trigger schema migrations before returning a usable connection.
//!
//! # Invariants
//! - Returned connections have `foreign_keys=ON`.
//! - Returned connections (and attached schemas) have migrations fully applied.

use super::migrations::apply_migrations;
use super::{DbError, DbResult};
use log::{error, info};
use rusqlite::Connection;
use std::path::Path;
use std::time::{Duration, Instant};

const MAIN_SCHEMA: &str = "main";

/// Opens a SQLite database file and applies all pending migrations.
///
/// # Side effects
/// - Creates parent directories of `path` when missing.
/// - Emits `db_open` logging events with duration and status.
pub fn open_db(path: impl AsRef<Path>) -> DbResult<Connection> {
    let started_at = Instant::now();
    let path = path.as_ref();
    info!("event=db_open module=db status=start mode=file");

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(err) = std::fs::create_dir_all(parent) {
                error!(
                    "event=db_open module=db status=error mode=file duration_ms={} error_code=db_dir_failed error={}",
                    started_at.elapsed().as_millis(),
                    err
                );
                return Err(err.into());
            }
        }
    }

    let mut conn = match Connection::open(path) {
        Ok(conn) => conn,
        Err(err) => {
            error!(
                "event=db_open module=db status=error mode=file duration_ms={} error_code=db_open_failed error={}",
                started_at.elapsed().as_millis(),
                err
            );
            return Err(err.into());
        }
    };

    finish_open(&mut conn, "file", started_at)?;
    Ok(conn)
}

/// Opens an in-memory SQLite database and applies all pending migrations.
pub fn open_db_in_memory() -> DbResult<Connection> {
    let started_at = Instant::now();
    info!("event=db_open module=db status=start mode=memory");

    let mut conn = match Connection::open_in_memory() {
        Ok(conn) => conn,
        Err(err) => {
            error!(
                "event=db_open module=db status=error mode=memory duration_ms={} error_code=db_open_failed error={}",
                started_at.elapsed().as_millis(),
                err
            );
            return Err(err.into());
        }
    };

    finish_open(&mut conn, "memory", started_at)?;
    Ok(conn)
}

/// Attaches another store under `alias` and migrates it.
///
/// `path = None` attaches a private in-memory database.
pub fn attach_db(conn: &mut Connection, path: Option<&Path>, alias: &str) -> DbResult<()> {
    if alias.is_empty() || !alias.chars().all(|c| c.is_ascii_lowercase() || c == '_') {
        return Err(DbError::InvalidAlias(alias.to_string()));
    }

    let started_at = Instant::now();
    let target = match path {
        Some(path) => {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            path.to_string_lossy().into_owned()
        }
        None => ":memory:".to_string(),
    };

    let attached = conn
        .execute(&format!("ATTACH DATABASE ?1 AS {alias};"), [target.as_str()])
        .map_err(DbError::from)
        .and_then(|_| apply_migrations(conn, alias));

    match attached {
        Ok(()) => {
            info!(
                "event=db_attach module=db status=ok alias={} duration_ms={}",
                alias,
                started_at.elapsed().as_millis()
            );
            Ok(())
        }
        Err(err) => {
            error!(
                "event=db_attach module=db status=error alias={} duration_ms={} error={}",
                alias,
                started_at.elapsed().as_millis(),
                err
            );
            Err(err)
        }
    }
}

fn finish_open(conn: &mut Connection, mode: &str, started_at: Instant) -> DbResult<()> {
    match bootstrap_connection(conn) {
        Ok(()) => {
            info!(
                "event=db_open module=db status=ok mode={} duration_ms={}",
                mode,
                started_at.elapsed().as_millis()
            );
            Ok(())
        }
        Err(err) => {
            error!(
                "event=db_open module=db status=error mode={} duration_ms={} error_code=db_bootstrap_failed error={}",
                mode,
                started_at.elapsed().as_millis(),
                err
            );
            Err(err)
        }
    }
}

fn bootstrap_connection(conn: &mut Connection) -> DbResult<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.busy_timeout(Duration::from_secs(5))?;
    apply_migrations(conn, MAIN_SCHEMA)?;
    Ok(())
}
