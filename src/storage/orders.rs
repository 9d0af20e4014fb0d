//! Durable order storage.
//!
//! The issuance workflow is client-driven and suspended between steps (the
//! operator publishes the challenge file on their own schedule), so order
//! state lives in SQLite rather than in memory. Every state transition is an
//! `UPDATE ... WHERE state IN (<legal sources>)` so an illegal transition
//! touches zero rows and surfaces as an error instead of corrupting the
//! record.

use std::{
    fs,
    path::Path,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OpenFlags, Row, params};

use crate::core::types::{Order, OrderState};

/// SQLite-backed store for issuance orders.
///
/// All access goes through a single connection behind a mutex, the same
/// arrangement the rest of the crate's async code expects: calls are short
/// and in-memory except for the page I/O itself.
#[derive(Clone)]
pub struct OrderStore {
    conn: Arc<Mutex<Connection>>,
}

impl OrderStore {
    /// Opens (or creates) the order database under `data_dir`.
    pub fn initialize_with_path(data_dir: &Path) -> Result<Self> {
        fs::create_dir_all(data_dir)?;

        let db_path = data_dir.join("certflow.sqlite");
        let conn = Connection::open_with_flags(
            &db_path,
            OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        )
        .with_context(|| format!("failed to open SQLite database at {}", db_path.display()))?;

        Self::configure_connection(&conn)?;
        Self::init_schema(&conn)?;
        Self::migrate_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory store for tests.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Self::migrate_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn configure_connection(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA foreign_keys = ON;
            "#,
        )?;
        conn.busy_timeout(Duration::from_secs(5))
            .context("failed to set SQLite busy timeout")?;
        Ok(())
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS orders (
                id TEXT PRIMARY KEY,
                domain TEXT NOT NULL,
                email TEXT NOT NULL,
                token TEXT,
                key_authorization TEXT,
                ca_order_handle TEXT,
                state TEXT NOT NULL,
                certificate_pem TEXT,
                private_key_pem TEXT,
                not_after TEXT,
                fingerprint TEXT,
                last_error TEXT,
                attempts INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_orders_domain ON orders (domain, created_at);
            "#,
        )?;
        Ok(())
    }

    /// Applies lightweight schema migrations for new columns.
    fn migrate_schema(conn: &Connection) -> Result<()> {
        let mut stmt = conn.prepare("PRAGMA table_info(orders)")?;
        let mut rows = stmt.query([])?;
        let mut existing = Vec::new();
        while let Some(row) = rows.next()? {
            let name: String = row.get(1)?;
            existing.push(name);
        }
        if !existing.iter().any(|c| c == "private_key_pem") {
            conn.execute("ALTER TABLE orders ADD COLUMN private_key_pem TEXT", [])
                .context("failed to add private_key_pem column")?;
        }
        if !existing.iter().any(|c| c == "fingerprint") {
            conn.execute("ALTER TABLE orders ADD COLUMN fingerprint TEXT", [])
                .context("failed to add fingerprint column")?;
        }
        Ok(())
    }

    fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|err| anyhow!("SQLite connection poisoned: {err}"))
    }

    pub fn insert(&self, order: &Order) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            r#"
            INSERT INTO orders (
                id, domain, email, token, key_authorization, ca_order_handle, state,
                certificate_pem, private_key_pem, not_after, fingerprint, last_error,
                attempts, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            "#,
            params![
                order.id,
                order.domain,
                order.email,
                order.token,
                order.key_authorization,
                order.ca_order_handle,
                order.state.as_str(),
                order.certificate_pem,
                order.private_key_pem,
                order.not_after.map(|t| t.to_rfc3339()),
                order.fingerprint,
                order.last_error,
                order.attempts,
                order.created_at.to_rfc3339(),
                order.updated_at.to_rfc3339(),
            ],
        )
        .with_context(|| format!("failed to insert order for {}", order.domain))?;
        Ok(())
    }

    /// The most recent order for a domain, regardless of state. A snapshot
    /// read of a single row, so the `(token, key_authorization)` pair is
    /// always consistent.
    pub fn latest_for_domain(&self, domain: &str) -> Result<Option<Order>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, domain, email, token, key_authorization, ca_order_handle, state,
                   certificate_pem, private_key_pem, not_after, fingerprint, last_error,
                   attempts, created_at, updated_at
            FROM orders
            WHERE domain = ?1
            ORDER BY created_at DESC, rowid DESC
            LIMIT 1
            "#,
        )?;
        let mut rows = stmt.query(params![domain])?;
        match rows.next()? {
            Some(row) => Ok(Some(map_order(row)?)),
            None => Ok(None),
        }
    }

    pub fn get(&self, id: &str) -> Result<Option<Order>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, domain, email, token, key_authorization, ca_order_handle, state,
                   certificate_pem, private_key_pem, not_after, fingerprint, last_error,
                   attempts, created_at, updated_at
            FROM orders
            WHERE id = ?1
            "#,
        )?;
        let mut rows = stmt.query(params![id])?;
        match rows.next()? {
            Some(row) => Ok(Some(map_order(row)?)),
            None => Ok(None),
        }
    }

    /// Created -> PendingValidation: records the CA-assigned token, the
    /// derived key authorization, and the CA order handle in one statement
    /// so readers never observe a torn pair.
    pub fn set_challenge(
        &self,
        id: &str,
        token: &str,
        key_authorization: &str,
        ca_order_handle: &str,
    ) -> Result<()> {
        self.transition(
            id,
            &[OrderState::Created],
            OrderState::PendingValidation,
            "SET token = ?2, key_authorization = ?3, ca_order_handle = ?4",
            params![id, token, key_authorization, ca_order_handle],
        )
    }

    /// PendingValidation -> Validated.
    pub fn mark_validated(&self, id: &str) -> Result<()> {
        self.transition(
            id,
            &[OrderState::PendingValidation],
            OrderState::Validated,
            "",
            params![id],
        )
    }

    /// Validated -> Finalizing. Also accepts Finalizing so a crash-resumed
    /// finalize is a no-op rather than an error.
    pub fn begin_finalize(&self, id: &str) -> Result<()> {
        self.transition(
            id,
            &[OrderState::Validated, OrderState::Finalizing],
            OrderState::Finalizing,
            "",
            params![id],
        )
    }

    /// Finalizing -> Issued. The only write path that populates the
    /// certificate column, which keeps "certificate present iff issued"
    /// true by construction.
    pub fn mark_issued(
        &self,
        id: &str,
        certificate_pem: &str,
        private_key_pem: &str,
        not_after: Option<DateTime<Utc>>,
        fingerprint: Option<&str>,
    ) -> Result<()> {
        self.transition(
            id,
            &[OrderState::Finalizing],
            OrderState::Issued,
            "SET certificate_pem = ?2, private_key_pem = ?3, not_after = ?4, \
             fingerprint = ?5, last_error = NULL",
            params![
                id,
                certificate_pem,
                private_key_pem,
                not_after.map(|t| t.to_rfc3339()),
                fingerprint,
            ],
        )
    }

    /// Any non-terminal state -> Failed, recording why.
    pub fn mark_failed(&self, id: &str, last_error: &str) -> Result<()> {
        self.transition(
            id,
            &[
                OrderState::Created,
                OrderState::PendingValidation,
                OrderState::Validated,
                OrderState::Finalizing,
            ],
            OrderState::Failed,
            "SET last_error = ?2",
            params![id, last_error],
        )
    }

    /// Bumps the validation attempt counter and returns the new total.
    pub fn record_attempt(&self, id: &str) -> Result<u32> {
        let conn = self.lock_conn()?;
        let updated = conn.execute(
            "UPDATE orders SET attempts = attempts + 1, updated_at = ?2 \
             WHERE id = ?1 AND state = 'pending_validation'",
            params![id, Utc::now().to_rfc3339()],
        )?;
        if updated == 0 {
            return Err(anyhow!("cannot record attempt for order {id}: not pending"));
        }
        let attempts: u32 =
            conn.query_row("SELECT attempts FROM orders WHERE id = ?1", params![id], |row| {
                row.get(0)
            })?;
        Ok(attempts)
    }

    fn transition(
        &self,
        id: &str,
        from: &[OrderState],
        to: OrderState,
        extra_set: &str,
        extra_params: &[&dyn rusqlite::ToSql],
    ) -> Result<()> {
        debug_assert!(from.iter().all(|source| source.can_transition_to(to) || *source == to));

        let sources = from
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        let set_clause = if extra_set.is_empty() {
            String::from("SET ")
        } else {
            format!("{extra_set}, ")
        };
        let sql = format!(
            "UPDATE orders {set_clause}state = '{}', updated_at = '{}' \
             WHERE id = ?1 AND state IN ({sources})",
            to.as_str(),
            Utc::now().to_rfc3339(),
        );

        let conn = self.lock_conn()?;
        let updated = conn.execute(&sql, extra_params)?;
        if updated == 0 {
            return Err(anyhow!(
                "illegal state transition to {} for order {id} (order missing or not in {sources})",
                to.as_str()
            ));
        }
        Ok(())
    }
}

fn map_order(row: &Row<'_>) -> Result<Order> {
    let state_raw: String = row.get(6)?;
    let state = OrderState::parse(&state_raw)
        .ok_or_else(|| anyhow!("unknown order state in database: {state_raw}"))?;
    Ok(Order {
        id: row.get(0)?,
        domain: row.get(1)?,
        email: row.get(2)?,
        token: row.get(3)?,
        key_authorization: row.get(4)?,
        ca_order_handle: row.get(5)?,
        state,
        certificate_pem: row.get(7)?,
        private_key_pem: row.get(8)?,
        not_after: parse_timestamp_opt(row.get::<_, Option<String>>(9)?)?,
        fingerprint: row.get(10)?,
        last_error: row.get(11)?,
        attempts: row.get(12)?,
        created_at: parse_timestamp(row.get::<_, String>(13)?)?,
        updated_at: parse_timestamp(row.get::<_, String>(14)?)?,
    })
}

fn parse_timestamp(raw: String) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .with_context(|| format!("invalid timestamp in database: {raw}"))
}

fn parse_timestamp_opt(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.map(parse_timestamp).transpose()
}
