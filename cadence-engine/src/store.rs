//! Durable local state: goals, completions, the operation queue, and the
//! sync cursor, all in one SQLite database.
//!
//! Writes that must stay atomic with their queued operation (the optimistic
//! local mutation plus its outbox record) run inside a single transaction,
//! as does applying a server response. Timestamps are stored as fixed-width
//! UTC strings so `ORDER BY timestamp` agrees with chronological order.

use std::cell::RefCell;
use std::path::Path;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use cadence_core::model::{Completion, Goal, OperationKind, QueuedOperation, TargetPeriod};
use cadence_core::wire::{GoalChange, SyncResponse};

/// Every schema change bumps this and appends a migration step. Steps are
/// additive only, so a database written by an older build always upgrades
/// in place without data loss.
const SCHEMA_VERSION: i64 = 2;

const CURSOR_KEY: &str = "lastSyncedAt";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The database could not be opened at all (bad path, locked file).
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("sqlite: {0}")]
    Sql(#[from] rusqlite::Error),
    /// A row held something we wrote but can no longer read.
    #[error("corrupt row: {0}")]
    Corrupt(String),
    /// The file was written by a newer build. Refuse rather than guess.
    #[error("database schema version {found} is newer than this build supports ({supported})")]
    SchemaAhead { found: i64, supported: i64 },
}

pub struct LocalStore {
    conn: RefCell<Connection>,
}

impl LocalStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn =
            Connection::open(path).map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn =
            Connection::open_in_memory().map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        let store = Self {
            conn: RefCell::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.borrow_mut();
        let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if version > SCHEMA_VERSION {
            return Err(StoreError::SchemaAhead {
                found: version,
                supported: SCHEMA_VERSION,
            });
        }
        if version == SCHEMA_VERSION {
            return Ok(());
        }

        let tx = conn.transaction()?;
        if version < 1 {
            tx.execute_batch(
                r#"
                CREATE TABLE goals (
                  id TEXT PRIMARY KEY,
                  name TEXT NOT NULL,
                  color TEXT NOT NULL,
                  position INTEGER NOT NULL,
                  target_count INTEGER,
                  target_period TEXT,
                  created_at TEXT NOT NULL,
                  archived_at TEXT
                );
                CREATE INDEX idx_goals_position ON goals(position);

                CREATE TABLE completions (
                  id TEXT PRIMARY KEY,
                  goal_id TEXT NOT NULL,
                  date TEXT NOT NULL,
                  created_at TEXT NOT NULL,
                  UNIQUE (goal_id, date)
                );
                CREATE INDEX idx_completions_goal ON completions(goal_id);
                CREATE INDEX idx_completions_date ON completions(date);

                CREATE TABLE meta (
                  key TEXT PRIMARY KEY,
                  value TEXT
                );
                "#,
            )?;
        }
        if version < 2 {
            tx.execute_batch(
                r#"
                CREATE TABLE operations (
                  id TEXT PRIMARY KEY,
                  kind TEXT NOT NULL,
                  entity_id TEXT NOT NULL,
                  payload TEXT NOT NULL,
                  timestamp TEXT NOT NULL,
                  retry_count INTEGER NOT NULL DEFAULT 0
                );
                CREATE INDEX idx_operations_timestamp ON operations(timestamp);
                "#,
            )?;
        }
        tx.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        tx.commit()?;
        Ok(())
    }

    // ---- goals ----

    pub fn put_goal(&self, goal: &Goal) -> Result<(), StoreError> {
        upsert_goal(&self.conn.borrow(), goal)
    }

    /// Physical removal, bypassing the tombstone convention. Only for
    /// cleanup paths; ordinary deletion goes through archiving.
    pub fn delete_goal_row(&self, id: &str) -> Result<(), StoreError> {
        self.conn
            .borrow()
            .execute("DELETE FROM goals WHERE id = ?1", params![id])?;
        Ok(())
    }

    pub fn get_goal(&self, id: &str) -> Result<Option<Goal>, StoreError> {
        let conn = self.conn.borrow();
        let row = conn
            .query_row(
                "SELECT id, name, color, position, target_count, target_period, created_at, archived_at
                 FROM goals WHERE id = ?1",
                params![id],
                goal_columns,
            )
            .optional()?;
        row.map(goal_from_columns).transpose()
    }

    pub fn list_active_goals(&self) -> Result<Vec<Goal>, StoreError> {
        self.query_goals("WHERE archived_at IS NULL ORDER BY position ASC, id ASC")
    }

    pub fn list_all_goals(&self) -> Result<Vec<Goal>, StoreError> {
        self.query_goals("ORDER BY position ASC, id ASC")
    }

    fn query_goals(&self, tail: &str) -> Result<Vec<Goal>, StoreError> {
        let conn = self.conn.borrow();
        let sql = format!(
            "SELECT id, name, color, position, target_count, target_period, created_at, archived_at
             FROM goals {tail}"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], goal_columns)?;
        let mut goals = Vec::new();
        for row in rows {
            goals.push(goal_from_columns(row?)?);
        }
        Ok(goals)
    }

    /// Highest position among active goals, 0 when there are none. Archived
    /// goals keep their position but no longer count.
    pub fn max_position(&self) -> Result<i64, StoreError> {
        let position = self.conn.borrow().query_row(
            "SELECT COALESCE(MAX(position), 0) FROM goals WHERE archived_at IS NULL",
            [],
            |row| row.get(0),
        )?;
        Ok(position)
    }

    // ---- completions ----

    pub fn put_completion(&self, completion: &Completion) -> Result<(), StoreError> {
        upsert_completion(&self.conn.borrow(), completion)
    }

    pub fn delete_completion(&self, goal_id: &str, date: NaiveDate) -> Result<(), StoreError> {
        self.conn.borrow().execute(
            "DELETE FROM completions WHERE goal_id = ?1 AND date = ?2",
            params![goal_id, date.to_string()],
        )?;
        Ok(())
    }

    pub fn find_completion(
        &self,
        goal_id: &str,
        date: NaiveDate,
    ) -> Result<Option<Completion>, StoreError> {
        let conn = self.conn.borrow();
        let row = conn
            .query_row(
                "SELECT id, goal_id, date, created_at FROM completions
                 WHERE goal_id = ?1 AND date = ?2",
                params![goal_id, date.to_string()],
                completion_columns,
            )
            .optional()?;
        row.map(completion_from_columns).transpose()
    }

    /// All completions in a calendar month, `month` formatted `YYYY-MM`.
    pub fn completions_for_month(&self, month: &str) -> Result<Vec<Completion>, StoreError> {
        self.query_completions(
            "WHERE date LIKE ?1 ORDER BY date ASC, goal_id ASC",
            params![format!("{month}-%")],
        )
    }

    pub fn list_all_completions(&self) -> Result<Vec<Completion>, StoreError> {
        self.query_completions("ORDER BY date ASC, goal_id ASC", params![])
    }

    fn query_completions(
        &self,
        tail: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<Completion>, StoreError> {
        let conn = self.conn.borrow();
        let sql =
            format!("SELECT id, goal_id, date, created_at FROM completions {tail}");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params, completion_columns)?;
        let mut completions = Vec::new();
        for row in rows {
            completions.push(completion_from_columns(row?)?);
        }
        Ok(completions)
    }

    // ---- sync cursor ----

    pub fn last_synced_at(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let conn = self.conn.borrow();
        let raw: Option<Option<String>> = conn
            .query_row(
                "SELECT value FROM meta WHERE key = ?1",
                params![CURSOR_KEY],
                |row| row.get(0),
            )
            .optional()?;
        match raw.flatten() {
            Some(raw) => Ok(Some(parse_ts(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn set_last_synced_at(&self, at: Option<DateTime<Utc>>) -> Result<(), StoreError> {
        self.conn.borrow().execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
            params![CURSOR_KEY, at.map(|t| ts(&t))],
        )?;
        Ok(())
    }

    // ---- operation queue ----

    pub fn enqueue_operation(&self, op: &QueuedOperation) -> Result<(), StoreError> {
        insert_operation(&self.conn.borrow(), op)
    }

    /// Every queued operation, oldest first. Equal timestamps fall back to
    /// id order so the result is stable across calls.
    pub fn drain_operations_ordered(&self) -> Result<Vec<QueuedOperation>, StoreError> {
        let conn = self.conn.borrow();
        let mut stmt = conn.prepare(
            "SELECT id, kind, entity_id, payload, timestamp, retry_count
             FROM operations ORDER BY timestamp ASC, id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, u32>(5)?,
            ))
        })?;
        let mut ops = Vec::new();
        for row in rows {
            let (id, kind, entity_id, payload, timestamp, retry_count) = row?;
            let kind = OperationKind::parse(&kind)
                .ok_or_else(|| StoreError::Corrupt(format!("unknown operation kind {kind:?}")))?;
            let payload = serde_json::from_str(&payload)
                .map_err(|e| StoreError::Corrupt(format!("operation payload: {e}")))?;
            ops.push(QueuedOperation {
                id,
                kind,
                entity_id,
                payload,
                timestamp: parse_ts(&timestamp)?,
                retry_count,
            });
        }
        Ok(ops)
    }

    pub fn remove_operations(&self, ids: &[String]) -> Result<(), StoreError> {
        let mut conn = self.conn.borrow_mut();
        let tx = conn.transaction()?;
        for id in ids {
            tx.execute("DELETE FROM operations WHERE id = ?1", params![id])?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn bump_retry_counts(&self, ids: &[String]) -> Result<(), StoreError> {
        let mut conn = self.conn.borrow_mut();
        let tx = conn.transaction()?;
        for id in ids {
            tx.execute(
                "UPDATE operations SET retry_count = retry_count + 1 WHERE id = ?1",
                params![id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn clear_operations(&self) -> Result<(), StoreError> {
        self.conn.borrow().execute("DELETE FROM operations", [])?;
        Ok(())
    }

    // ---- combined writes ----
    //
    // The optimistic local mutation and its outbox record commit together
    // or not at all. `op` is `None` for guest sessions, which have nothing
    // to upload.

    pub fn put_goal_with_op(
        &self,
        goal: &Goal,
        op: Option<&QueuedOperation>,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.borrow_mut();
        let tx = conn.transaction()?;
        upsert_goal(&tx, goal)?;
        if let Some(op) = op {
            insert_operation(&tx, op)?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn put_completion_with_op(
        &self,
        completion: &Completion,
        op: Option<&QueuedOperation>,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.borrow_mut();
        let tx = conn.transaction()?;
        upsert_completion(&tx, completion)?;
        if let Some(op) = op {
            insert_operation(&tx, op)?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn delete_completion_with_op(
        &self,
        goal_id: &str,
        date: NaiveDate,
        op: Option<&QueuedOperation>,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.borrow_mut();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM completions WHERE goal_id = ?1 AND date = ?2",
            params![goal_id, date.to_string()],
        )?;
        if let Some(op) = op {
            insert_operation(&tx, op)?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn reorder_goals_with_op(
        &self,
        positions: &[(String, i64)],
        op: Option<&QueuedOperation>,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.borrow_mut();
        let tx = conn.transaction()?;
        for (goal_id, position) in positions {
            tx.execute(
                "UPDATE goals SET position = ?2 WHERE id = ?1",
                params![goal_id, position],
            )?;
        }
        if let Some(op) = op {
            insert_operation(&tx, op)?;
        }
        tx.commit()?;
        Ok(())
    }

    // ---- reconciliation ----

    /// Applies the server's delta, advances the cursor, and deletes the
    /// operations the server has accepted, all in one transaction. If any
    /// step fails the queue and cursor are untouched and the next sync
    /// retries the whole batch.
    pub fn apply_sync_response(
        &self,
        response: &SyncResponse,
        accepted_op_ids: &[String],
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.borrow_mut();
        let tx = conn.transaction()?;
        for change in &response.goals {
            apply_goal_change(&tx, change)?;
        }
        for change in &response.completions {
            if change.completed {
                tx.execute(
                    "INSERT OR REPLACE INTO completions (id, goal_id, date, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        change.sync_id(),
                        change.goal_id,
                        change.date.to_string(),
                        ts(&change.updated_at),
                    ],
                )?;
            } else {
                tx.execute(
                    "DELETE FROM completions WHERE goal_id = ?1 AND date = ?2",
                    params![change.goal_id, change.date.to_string()],
                )?;
            }
        }
        tx.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
            params![CURSOR_KEY, ts(&response.server_time)],
        )?;
        for id in accepted_op_ids {
            tx.execute("DELETE FROM operations WHERE id = ?1", params![id])?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Wipes every table. Used when a user signs out of a linked account.
    pub fn clear_all(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.borrow_mut();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM goals", [])?;
        tx.execute("DELETE FROM completions", [])?;
        tx.execute("DELETE FROM operations", [])?;
        tx.execute("DELETE FROM meta", [])?;
        tx.commit()?;
        Ok(())
    }
}

fn upsert_completion(conn: &Connection, completion: &Completion) -> Result<(), StoreError> {
    conn.execute(
        "INSERT OR REPLACE INTO completions (id, goal_id, date, created_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            completion.id,
            completion.goal_id,
            completion.date.to_string(),
            ts(&completion.created_at),
        ],
    )?;
    Ok(())
}

fn upsert_goal(conn: &Connection, goal: &Goal) -> Result<(), StoreError> {
    conn.execute(
        "INSERT OR REPLACE INTO goals
         (id, name, color, position, target_count, target_period, created_at, archived_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            goal.id,
            goal.name,
            goal.color,
            goal.position,
            goal.target_count,
            goal.target_period.map(period_str),
            ts(&goal.created_at),
            goal.archived_at.map(|t| ts(&t)),
        ],
    )?;
    Ok(())
}

/// Server-sourced upsert. Unlike [`upsert_goal`] this preserves the local
/// `created_at` on conflict; the wire change only knows `updated_at`.
fn apply_goal_change(conn: &Connection, change: &GoalChange) -> Result<(), StoreError> {
    let archived_at = change.deleted.then_some(change.updated_at);
    conn.execute(
        "INSERT INTO goals
         (id, name, color, position, target_count, target_period, created_at, archived_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(id) DO UPDATE SET
           name = excluded.name,
           color = excluded.color,
           position = excluded.position,
           target_count = excluded.target_count,
           target_period = excluded.target_period,
           archived_at = excluded.archived_at",
        params![
            change.id,
            change.name,
            change.color,
            change.position,
            change.target_count,
            change.target_period.map(period_str),
            ts(&change.updated_at),
            archived_at.map(|t| ts(&t)),
        ],
    )?;
    Ok(())
}

fn insert_operation(conn: &Connection, op: &QueuedOperation) -> Result<(), StoreError> {
    let payload = serde_json::to_string(&op.payload)
        .map_err(|e| StoreError::Corrupt(format!("operation payload: {e}")))?;
    conn.execute(
        "INSERT INTO operations (id, kind, entity_id, payload, timestamp, retry_count)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            op.id,
            op.kind.as_str(),
            op.entity_id,
            payload,
            ts(&op.timestamp),
            op.retry_count,
        ],
    )?;
    Ok(())
}

type GoalColumns = (
    String,
    String,
    String,
    i64,
    Option<i64>,
    Option<String>,
    String,
    Option<String>,
);

fn goal_columns(row: &rusqlite::Row<'_>) -> rusqlite::Result<GoalColumns> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn goal_from_columns(columns: GoalColumns) -> Result<Goal, StoreError> {
    let (id, name, color, position, target_count, target_period, created_at, archived_at) =
        columns;
    Ok(Goal {
        id,
        name,
        color,
        position,
        target_count,
        target_period: target_period.as_deref().map(parse_period).transpose()?,
        created_at: parse_ts(&created_at)?,
        archived_at: archived_at.as_deref().map(parse_ts).transpose()?,
    })
}

type CompletionColumns = (String, String, String, String);

fn completion_columns(row: &rusqlite::Row<'_>) -> rusqlite::Result<CompletionColumns> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn completion_from_columns(columns: CompletionColumns) -> Result<Completion, StoreError> {
    let (id, goal_id, date, created_at) = columns;
    Ok(Completion {
        id,
        goal_id,
        date: parse_date(&date)?,
        created_at: parse_ts(&created_at)?,
    })
}

fn period_str(period: TargetPeriod) -> &'static str {
    match period {
        TargetPeriod::Week => "week",
        TargetPeriod::Month => "month",
    }
}

fn parse_period(raw: &str) -> Result<TargetPeriod, StoreError> {
    match raw {
        "week" => Ok(TargetPeriod::Week),
        "month" => Ok(TargetPeriod::Month),
        other => Err(StoreError::Corrupt(format!("unknown target period {other:?}"))),
    }
}

/// Fixed-width millisecond UTC form, e.g. `2026-01-05T09:30:00.000Z`.
/// Lexicographic order over these strings matches time order.
fn ts(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp {raw:?}: {e}")))
}

fn parse_date(raw: &str) -> Result<NaiveDate, StoreError> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|e| StoreError::Corrupt(format!("bad date {raw:?}: {e}")))
}
