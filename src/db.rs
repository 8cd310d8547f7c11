//! SQLite database for instance records
//!
//! Implements [`Registry`] on top of a single `instances` table with unique
//! `name` and `port` columns. SQLite treats NULLs as distinct, so any number
//! of instances may be without a port at the same time.

use crate::instance::{Instance, InstancePatch, InstanceStatus, NewInstance};
use crate::registry::Registry;
use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info};
use uuid::Uuid;

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 1;

const INSTANCE_COLUMNS: &str = "id, name, runtime_handle, port, status, webhook_url, webhook_secret,
     last_activity, created_at, updated_at";

/// Database connection wrapper with thread-safe access
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path).context("Failed to open database")?;

        // WAL lets the reconciler read while API writes are in flight
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.run_migrations()?;

        info!("Database opened at {}", path.display());
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < SCHEMA_VERSION {
            info!("Running migrations from v{} to v{}", current_version, SCHEMA_VERSION);

            if current_version < 1 {
                Self::migrate_v1(&conn)?;
            }
        }

        Ok(())
    }

    /// Migration v1: Initial schema
    fn migrate_v1(conn: &Connection) -> Result<()> {
        debug!("Applying migration v1: instances");

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS instances (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                runtime_handle TEXT,
                port INTEGER UNIQUE,
                status TEXT NOT NULL DEFAULT 'creating',
                webhook_url TEXT,
                webhook_secret TEXT,
                last_activity TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_instances_status ON instances(status);
            CREATE INDEX IF NOT EXISTS idx_instances_handle ON instances(runtime_handle);

            INSERT INTO schema_migrations (version) VALUES (1);
        "#,
        )?;

        Ok(())
    }

    fn get_with(conn: &Connection, id: &str) -> Result<Option<Instance>> {
        conn.query_row(
            &format!("SELECT {} FROM instances WHERE id = ?1", INSTANCE_COLUMNS),
            params![id],
            instance_from_row,
        )
        .optional()
        .context("Failed to get instance")
    }
}

impl Registry for Database {
    fn get(&self, id: &str) -> Result<Option<Instance>> {
        let conn = self.conn.lock();
        Self::get_with(&conn, id)
    }

    fn find_by_name(&self, name: &str) -> Result<Option<Instance>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM instances WHERE name = ?1", INSTANCE_COLUMNS),
            params![name],
            instance_from_row,
        )
        .optional()
        .context("Failed to find instance by name")
    }

    fn list(&self) -> Result<Vec<Instance>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM instances ORDER BY created_at, rowid",
            INSTANCE_COLUMNS
        ))?;

        let instances = stmt
            .query_map([], instance_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(instances)
    }

    fn create(&self, new: &NewInstance) -> Result<Instance> {
        let conn = self.conn.lock();
        let id = Uuid::new_v4().to_string();
        let now = format_ts(&Utc::now());

        conn.execute(
            "INSERT INTO instances (id, name, status, webhook_url, webhook_secret, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![
                id,
                new.name,
                InstanceStatus::Creating.as_str(),
                new.webhook_url,
                new.webhook_secret,
                now
            ],
        )
        .with_context(|| format!("Failed to create instance '{}'", new.name))?;

        Self::get_with(&conn, &id)?.context("Instance vanished after insert")
    }

    fn update(&self, id: &str, patch: &InstancePatch) -> Result<Option<Instance>> {
        let mut columns: Vec<&str> = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        if let Some(name) = &patch.name {
            columns.push("name");
            values.push(Value::Text(name.clone()));
        }
        if let Some(url) = &patch.webhook_url {
            columns.push("webhook_url");
            values.push(optional_text(url.as_deref()));
        }
        if let Some(secret) = &patch.webhook_secret {
            columns.push("webhook_secret");
            values.push(optional_text(secret.as_deref()));
        }
        if let Some(handle) = &patch.runtime_handle {
            columns.push("runtime_handle");
            values.push(optional_text(handle.as_deref()));
        }
        if let Some(port) = patch.port {
            columns.push("port");
            values.push(port.map_or(Value::Null, |p| Value::Integer(i64::from(p))));
        }
        if let Some(status) = patch.status {
            columns.push("status");
            values.push(Value::Text(status.as_str().to_string()));
        }
        if let Some(at) = &patch.last_activity {
            columns.push("last_activity");
            values.push(Value::Text(format_ts(at)));
        }

        columns.push("updated_at");
        values.push(Value::Text(format_ts(&Utc::now())));

        let assignments: Vec<String> = columns
            .iter()
            .enumerate()
            .map(|(i, col)| format!("{} = ?{}", col, i + 1))
            .collect();
        let sql = format!(
            "UPDATE instances SET {} WHERE id = ?{}",
            assignments.join(", "),
            values.len() + 1
        );
        values.push(Value::Text(id.to_string()));

        let conn = self.conn.lock();
        let rows = conn
            .execute(&sql, params_from_iter(values.iter()))
            .with_context(|| format!("Failed to update instance {}", id))?;

        if rows == 0 {
            return Ok(None);
        }
        Self::get_with(&conn, id)
    }

    fn transition_status(
        &self,
        id: &str,
        handle: &str,
        expected: InstanceStatus,
        status: InstanceStatus,
    ) -> Result<Option<Instance>> {
        let conn = self.conn.lock();
        let rows = conn
            .execute(
                "UPDATE instances SET status = ?1, updated_at = ?2
                 WHERE id = ?3 AND runtime_handle = ?4 AND status = ?5",
                params![
                    status.as_str(),
                    format_ts(&Utc::now()),
                    id,
                    handle,
                    expected.as_str()
                ],
            )
            .with_context(|| format!("Failed to update status of instance {}", id))?;

        if rows == 0 {
            return Ok(None);
        }
        Self::get_with(&conn, id)
    }

    fn delete(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute("DELETE FROM instances WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    fn used_ports(&self) -> Result<HashSet<u16>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT port FROM instances WHERE port IS NOT NULL")?;
        let ports = stmt
            .query_map([], |row| row.get::<_, u16>(0))?
            .collect::<Result<HashSet<_>, _>>()?;
        Ok(ports)
    }
}

fn optional_text(value: Option<&str>) -> Value {
    value.map_or(Value::Null, |v| Value::Text(v.to_string()))
}

fn format_ts(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn instance_from_row(row: &Row<'_>) -> rusqlite::Result<Instance> {
    let status: String = row.get(4)?;
    let status = status
        .parse::<InstanceStatus>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, e.into()))?;

    let last_activity = match row.get::<_, Option<String>>(7)? {
        Some(raw) => Some(parse_ts(7, &raw)?),
        None => None,
    };

    Ok(Instance {
        id: row.get(0)?,
        name: row.get(1)?,
        runtime_handle: row.get(2)?,
        port: row.get(3)?,
        status,
        webhook_url: row.get(5)?,
        webhook_secret: row.get(6)?,
        last_activity,
        created_at: parse_ts(8, &row.get::<_, String>(8)?)?,
        updated_at: parse_ts(9, &row.get::<_, String>(9)?)?,
    })
}
