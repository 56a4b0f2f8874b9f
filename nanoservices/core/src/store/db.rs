use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;

/// SQLite-backed state shared by the run ledger and the checkpoint store.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, rusqlite::Error> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self, rusqlite::Error> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<(), rusqlite::Error> {
        self.conn.execute_batch(
            "PRAGMA foreign_keys = ON;
            CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                mode TEXT NOT NULL,
                status TEXT NOT NULL,
                phase TEXT NOT NULL,
                window_start TEXT NOT NULL,
                window_end TEXT NOT NULL,
                load_strategy TEXT NOT NULL,
                tables TEXT NOT NULL,
                recovers TEXT,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                duration_ms INTEGER,
                watermark_after TEXT,
                checkpoint_error TEXT
            );
            CREATE TABLE IF NOT EXISTS table_outcomes (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL REFERENCES runs(id),
                table_name TEXT NOT NULL,
                stage TEXT NOT NULL,
                phase TEXT NOT NULL,
                rows_in INTEGER NOT NULL,
                rows_out INTEGER NOT NULL,
                error TEXT,
                duration_ms INTEGER NOT NULL,
                recorded_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS checkpoints (
                environment TEXT PRIMARY KEY,
                last_date TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status);
            CREATE INDEX IF NOT EXISTS idx_runs_started_at ON runs(started_at);
            CREATE INDEX IF NOT EXISTS idx_runs_recovers ON runs(recovers);
            CREATE INDEX IF NOT EXISTS idx_table_outcomes_run ON table_outcomes(run_id, table_name);",
        )?;
        Ok(())
    }

    /// Record a new run as running.
    pub fn insert_run(&self, run: &RunRow) -> Result<(), rusqlite::Error> {
        self.conn.execute(
            "INSERT INTO runs (id, mode, status, phase, window_start, window_end, load_strategy,
                               tables, recovers, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                run.id,
                run.mode,
                run.status,
                run.phase,
                run.window_start,
                run.window_end,
                run.load_strategy,
                run.tables,
                run.recovers,
                run.started_at,
            ],
        )?;
        Ok(())
    }

    /// Move an unfinished run to another phase. Finished runs are immutable.
    pub fn update_run_phase(&self, id: &str, phase: &str) -> Result<usize, rusqlite::Error> {
        self.conn.execute(
            "UPDATE runs SET phase = ?2 WHERE id = ?1 AND finished_at IS NULL",
            params![id, phase],
        )
    }

    /// Write the terminal fields of a run. Only the first completion sticks.
    pub fn complete_run(&self, run: &RunRow) -> Result<usize, rusqlite::Error> {
        self.conn.execute(
            "UPDATE runs
             SET status = ?2, phase = ?3, finished_at = ?4, duration_ms = ?5,
                 watermark_after = ?6, checkpoint_error = ?7
             WHERE id = ?1 AND finished_at IS NULL",
            params![
                run.id,
                run.status,
                run.phase,
                run.finished_at,
                run.duration_ms,
                run.watermark_after,
                run.checkpoint_error,
            ],
        )
    }

    /// Append one table outcome. Returns its sequence number.
    pub fn insert_outcome(&self, outcome: &OutcomeRow) -> Result<i64, rusqlite::Error> {
        self.conn.execute(
            "INSERT INTO table_outcomes (run_id, table_name, stage, phase, rows_in, rows_out,
                                         error, duration_ms, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                outcome.run_id,
                outcome.table_name,
                outcome.stage,
                outcome.phase,
                outcome.rows_in,
                outcome.rows_out,
                outcome.error,
                outcome.duration_ms,
                outcome.recorded_at,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Mark runs left running by a previous process as failed.
    pub fn mark_inflight_as_failed(&self, finished_at: &str) -> Result<usize, rusqlite::Error> {
        let count = self.conn.execute(
            "UPDATE runs SET status = 'failed', phase = 'FAILED', finished_at = ?1
             WHERE status = 'running'",
            params![finished_at],
        )?;
        Ok(count)
    }

    pub fn get_run(&self, id: &str) -> Result<Option<RunRow>, rusqlite::Error> {
        self.conn
            .query_row(
                &format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = ?1"),
                params![id],
                RunRow::from_row,
            )
            .optional()
    }

    /// Finished runs whose status is one of `statuses`, newest first.
    pub fn runs_with_status(&self, statuses: &[&str]) -> Result<Vec<RunRow>, rusqlite::Error> {
        let placeholders = (1..=statuses.len()).map(|i| format!("?{i}")).collect::<Vec<_>>().join(", ");
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM runs
             WHERE status IN ({placeholders}) AND finished_at IS NOT NULL
             ORDER BY started_at DESC, rowid DESC"
        ))?;
        let rows = stmt.query_map(rusqlite::params_from_iter(statuses.iter()), RunRow::from_row)?;
        rows.collect()
    }

    /// Ids of the recovery runs started for `run_id`, oldest first.
    pub fn runs_recovering(&self, run_id: &str) -> Result<Vec<String>, rusqlite::Error> {
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM runs WHERE recovers = ?1 ORDER BY started_at, rowid")?;
        let rows = stmt.query_map(params![run_id], |row| row.get(0))?;
        rows.collect()
    }

    /// Get recent runs, newest first.
    pub fn recent_runs(&self, limit: usize) -> Result<Vec<RunRow>, rusqlite::Error> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM runs ORDER BY started_at DESC, rowid DESC LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![limit as i64], RunRow::from_row)?;
        rows.collect()
    }

    /// All outcomes of a run in append order.
    pub fn outcomes_for(&self, run_id: &str) -> Result<Vec<OutcomeRow>, rusqlite::Error> {
        let mut stmt = self.conn.prepare(
            "SELECT seq, run_id, table_name, stage, phase, rows_in, rows_out, error, duration_ms,
                    recorded_at
             FROM table_outcomes WHERE run_id = ?1 ORDER BY seq",
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            Ok(OutcomeRow {
                seq: row.get(0)?,
                run_id: row.get(1)?,
                table_name: row.get(2)?,
                stage: row.get(3)?,
                phase: row.get(4)?,
                rows_in: row.get(5)?,
                rows_out: row.get(6)?,
                error: row.get(7)?,
                duration_ms: row.get(8)?,
                recorded_at: row.get(9)?,
            })
        })?;
        rows.collect()
    }

    pub fn get_checkpoint(&self, environment: &str) -> Result<Option<CheckpointRow>, rusqlite::Error> {
        self.conn
            .query_row(
                "SELECT environment, last_date, updated_at FROM checkpoints WHERE environment = ?1",
                params![environment],
                |row| {
                    Ok(CheckpointRow {
                        environment: row.get(0)?,
                        last_date: row.get(1)?,
                        updated_at: row.get(2)?,
                    })
                },
            )
            .optional()
    }

    /// Insert or move the checkpoint forward in one statement. Returns 0 when
    /// the stored date is later than `last_date`.
    pub fn advance_checkpoint(
        &self,
        environment: &str,
        last_date: &str,
        updated_at: &str,
    ) -> Result<usize, rusqlite::Error> {
        self.conn.execute(
            "INSERT INTO checkpoints (environment, last_date, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(environment) DO UPDATE
                 SET last_date = excluded.last_date, updated_at = excluded.updated_at
                 WHERE checkpoints.last_date <= excluded.last_date",
            params![environment, last_date, updated_at],
        )
    }
}

const RUN_COLUMNS: &str = "id, mode, status, phase, window_start, window_end, load_strategy, tables, \
     recovers, started_at, finished_at, duration_ms, watermark_after, checkpoint_error";

#[derive(Debug, Clone, PartialEq)]
pub struct RunRow {
    pub id: String,
    pub mode: String,
    pub status: String,
    pub phase: String,
    pub window_start: String,
    pub window_end: String,
    pub load_strategy: String,
    /// JSON array of target table names in load order.
    pub tables: String,
    pub recovers: Option<String>,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub duration_ms: Option<i64>,
    pub watermark_after: Option<String>,
    pub checkpoint_error: Option<String>,
}

impl RunRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(RunRow {
            id: row.get(0)?,
            mode: row.get(1)?,
            status: row.get(2)?,
            phase: row.get(3)?,
            window_start: row.get(4)?,
            window_end: row.get(5)?,
            load_strategy: row.get(6)?,
            tables: row.get(7)?,
            recovers: row.get(8)?,
            started_at: row.get(9)?,
            finished_at: row.get(10)?,
            duration_ms: row.get(11)?,
            watermark_after: row.get(12)?,
            checkpoint_error: row.get(13)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutcomeRow {
    pub seq: i64,
    pub run_id: String,
    pub table_name: String,
    pub stage: String,
    pub phase: String,
    pub rows_in: i64,
    pub rows_out: i64,
    pub error: Option<String>,
    pub duration_ms: i64,
    pub recorded_at: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointRow {
    pub environment: String,
    pub last_date: String,
    pub updated_at: String,
}
