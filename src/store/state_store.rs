//! StateStore: SQLite persistence for pairs, tasks and waves.
//!
//! Every mutation is a single upsert/increment or a short `BEGIN IMMEDIATE`
//! transaction, so two overlapping invocations never lose an update and an
//! interrupted one leaves no partial state behind.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, Row, Transaction, TransactionBehavior, params};
use tracing::debug;

use crate::error::{Result, WaveError};
use crate::id::now_ms;
use crate::scheduler::{Reward, RotationPhase, WaveNumber};
use crate::store::records::{
    COVERAGE_TARGET, CreditOutcome, CreditReceipt, EventRecord, NewPair, PairCounts, PairRecord, PendingAward,
    Publication, TaskRecord, WaveProgress, WaveRecord,
};

const PAIR_COLUMNS: &str = "pair_name, hash, doc_a, doc_b, group_rank, group_position, wave_ordinal, wave_phase, \
     annotation_index, pass, sentence_count, reward_cents, created_at, updated_at";

const TASK_COLUMNS: &str = "external_task_id, hash, pair_name, wave_ordinal, wave_phase, token_index, is_exclusive, \
     requested_assignments, credited_count, completed, retired, created_at, updated_at";

const WAVE_COLUMNS: &str = "wave_ordinal, wave_phase, sent_count, completed_count, closed, token_index, is_exclusive, \
     worker_list, created_at, updated_at";

/// How long a writer waits for another invocation's transaction
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

pub struct StateStore {
    path: PathBuf,
    db: Connection,
}

impl StateStore {
    /// Open or create the state database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        let db = Connection::open(path)?;
        db.busy_timeout(BUSY_TIMEOUT)?;
        Self::init_schema(&db)?;

        debug!(path = %path.display(), "Opened state store");
        Ok(Self {
            path: path.to_path_buf(),
            db,
        })
    }

    fn init_schema(db: &Connection) -> Result<()> {
        db.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS round_doc (
                pair_name TEXT PRIMARY KEY,
                hash TEXT NOT NULL UNIQUE,
                doc_a TEXT NOT NULL,
                doc_b TEXT NOT NULL,
                group_rank INTEGER NOT NULL,
                group_position INTEGER NOT NULL,
                wave_ordinal INTEGER,
                wave_phase INTEGER,
                annotation_index INTEGER NOT NULL DEFAULT 0,
                pass INTEGER NOT NULL DEFAULT 0,
                sentence_count INTEGER NOT NULL,
                reward_cents INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_round_doc_rank ON round_doc(group_rank, group_position);
            CREATE INDEX IF NOT EXISTS idx_round_doc_wave ON round_doc(wave_ordinal, wave_phase);

            CREATE TABLE IF NOT EXISTS past_tasks (
                external_task_id TEXT PRIMARY KEY,
                hash TEXT NOT NULL,
                pair_name TEXT NOT NULL,
                wave_ordinal INTEGER NOT NULL,
                wave_phase INTEGER NOT NULL,
                token_index INTEGER NOT NULL,
                is_exclusive INTEGER NOT NULL,
                requested_assignments INTEGER NOT NULL,
                credited_count INTEGER NOT NULL DEFAULT 0,
                completed INTEGER NOT NULL DEFAULT 0,
                retired INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_past_tasks_pair ON past_tasks(pair_name);
            CREATE INDEX IF NOT EXISTS idx_past_tasks_wave ON past_tasks(wave_ordinal, wave_phase);

            CREATE TABLE IF NOT EXISTS stack_target (
                wave_ordinal INTEGER NOT NULL,
                wave_phase INTEGER NOT NULL,
                sent_count INTEGER NOT NULL DEFAULT 0,
                completed_count INTEGER NOT NULL DEFAULT 0,
                sealed INTEGER NOT NULL DEFAULT 0,
                closed INTEGER NOT NULL DEFAULT 0,
                token_index INTEGER NOT NULL,
                is_exclusive INTEGER NOT NULL,
                worker_list TEXT NOT NULL DEFAULT '[]',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (wave_ordinal, wave_phase)
            );

            CREATE TABLE IF NOT EXISTS task_assignments (
                assignment_id TEXT PRIMARY KEY,
                external_task_id TEXT NOT NULL,
                worker_id TEXT NOT NULL,
                qualification_awarded INTEGER NOT NULL DEFAULT 0,
                credited_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_task_assignments_task ON task_assignments(external_task_id);

            CREATE TABLE IF NOT EXISTS eligibility_tokens (
                token_index INTEGER PRIMARY KEY,
                qualification_id TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS event_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                detail TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            "#,
        )?;

        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn begin(&self) -> Result<Transaction<'_>> {
        Ok(Transaction::new_unchecked(&self.db, TransactionBehavior::Immediate)?)
    }

    // ------------------------------------------------------------------
    // Pairs
    // ------------------------------------------------------------------

    /// Register a pair as unassigned. Returns false if it already exists.
    pub fn register_pair(&self, pair: &NewPair) -> Result<bool> {
        let now = now_ms();
        let inserted = self.db.execute(
            r#"
            INSERT OR IGNORE INTO round_doc
            (pair_name, hash, doc_a, doc_b, group_rank, group_position, sentence_count, reward_cents,
             created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
            "#,
            params![
                pair.pair_name,
                pair.hash,
                pair.doc_a,
                pair.doc_b,
                pair.group_rank,
                pair.group_position,
                pair.sentence_count,
                pair.reward.cents(),
                now,
            ],
        )?;
        Ok(inserted == 1)
    }

    pub fn get_pair(&self, pair_name: &str) -> Result<Option<PairRecord>> {
        let sql = format!("SELECT {} FROM round_doc WHERE pair_name = ?1", PAIR_COLUMNS);
        Ok(self.db.query_row(&sql, [pair_name], pair_from_row).optional()?)
    }

    pub fn get_pair_by_hash(&self, hash: &str) -> Result<Option<PairRecord>> {
        let sql = format!("SELECT {} FROM round_doc WHERE hash = ?1", PAIR_COLUMNS);
        Ok(self.db.query_row(&sql, [hash], pair_from_row).optional()?)
    }

    /// Highest group rank registered so far
    pub fn max_group_rank(&self) -> Result<Option<u32>> {
        let rank: Option<i64> = self
            .db
            .query_row("SELECT MAX(group_rank) FROM round_doc", [], |row| row.get(0))?;
        Ok(rank.map(|r| r as u32))
    }

    /// All pairs in priority order
    pub fn list_pairs(&self) -> Result<Vec<PairRecord>> {
        self.query_pairs("1 = 1", "group_rank, group_position")
    }

    /// Pairs never published, in priority order
    pub fn unassigned_pairs(&self) -> Result<Vec<PairRecord>> {
        self.query_pairs("wave_ordinal IS NULL", "group_rank, group_position")
    }

    /// Under-covered pairs whose last wave has closed, oldest wave first
    pub fn continuation_candidates(&self) -> Result<Vec<PairRecord>> {
        let sql = format!(
            r#"
            SELECT {} FROM round_doc r
            WHERE r.annotation_index < ?1
              AND EXISTS (
                SELECT 1 FROM stack_target s
                WHERE s.wave_ordinal = r.wave_ordinal AND s.wave_phase = r.wave_phase AND s.closed = 1
              )
            ORDER BY r.wave_ordinal, r.wave_phase, r.group_rank, r.group_position
            "#,
            PAIR_COLUMNS
        );
        let mut stmt = self.db.prepare(&sql)?;
        let rows = stmt.query_map([COVERAGE_TARGET], pair_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn query_pairs(&self, filter: &str, order: &str) -> Result<Vec<PairRecord>> {
        let sql = format!("SELECT {} FROM round_doc WHERE {} ORDER BY {}", PAIR_COLUMNS, filter, order);
        let mut stmt = self.db.prepare(&sql)?;
        let rows = stmt.query_map([], pair_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn pair_counts(&self) -> Result<PairCounts> {
        let counts = self.db.query_row(
            r#"
            SELECT
                COUNT(*),
                COALESCE(SUM(CASE WHEN wave_ordinal IS NULL THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN wave_ordinal IS NOT NULL AND annotation_index < ?1 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN annotation_index >= ?1 THEN 1 ELSE 0 END), 0)
            FROM round_doc
            "#,
            [COVERAGE_TARGET],
            |row| {
                Ok(PairCounts {
                    total: row.get(0)?,
                    unassigned: row.get(1)?,
                    in_progress: row.get(2)?,
                    covered: row.get(3)?,
                })
            },
        )?;
        Ok(counts)
    }

    // ------------------------------------------------------------------
    // Publication
    // ------------------------------------------------------------------

    /// Record a task the marketplace accepted.
    ///
    /// In one transaction: bump the wave's sent count (creating the wave on
    /// its first task), insert the task row and move the pair into the wave.
    pub fn record_publication(&self, publication: &Publication) -> Result<()> {
        let tx = self.begin()?;
        let now = now_ms();

        let pair_sql = format!("SELECT {} FROM round_doc WHERE pair_name = ?1", PAIR_COLUMNS);
        let pair = tx
            .query_row(&pair_sql, [&publication.pair_name], pair_from_row)
            .optional()?
            .ok_or_else(|| WaveError::UnknownReference(format!("pair {}", publication.pair_name)))?;

        if pair.hash != publication.hash {
            return Err(WaveError::InvariantViolation(format!(
                "pair {} published with foreign hash",
                pair.pair_name
            )));
        }
        if let Some(current) = pair.wave {
            if current == publication.wave {
                return Err(WaveError::InvariantViolation(format!(
                    "pair {} already published in wave {}",
                    pair.pair_name, current
                )));
            }
            if !wave_closed(&tx, current)? {
                return Err(WaveError::InvariantViolation(format!(
                    "pair {} is still in open wave {}",
                    pair.pair_name, current
                )));
            }
        }
        if publication.requested_assignments != pair.remaining() || pair.remaining() == 0 {
            return Err(WaveError::InvariantViolation(format!(
                "pair {} has {} annotations but {} were requested",
                pair.pair_name, pair.annotation_index, publication.requested_assignments
            )));
        }

        let wave = publication.wave;
        let touched = tx.execute(
            r#"
            INSERT INTO stack_target
            (wave_ordinal, wave_phase, sent_count, completed_count, sealed, closed, token_index, is_exclusive,
             worker_list, created_at, updated_at)
            VALUES (?1, ?2, 1, 0, 0, 0, ?3, ?4, '[]', ?5, ?5)
            ON CONFLICT(wave_ordinal, wave_phase) DO UPDATE SET
                sent_count = sent_count + 1,
                updated_at = excluded.updated_at
            WHERE sealed = 0
            "#,
            params![
                wave.ordinal,
                wave.phase.as_i64(),
                publication.token_index as i64,
                publication.exclusive,
                now
            ],
        )?;
        if touched == 0 {
            return Err(WaveError::InvariantViolation(format!(
                "wave {} is sealed; cannot add task for {}",
                wave, pair.pair_name
            )));
        }

        let inserted = tx.execute(
            r#"
            INSERT OR IGNORE INTO past_tasks
            (external_task_id, hash, pair_name, wave_ordinal, wave_phase, token_index, is_exclusive,
             requested_assignments, credited_count, completed, retired, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, 0, 0, ?9, ?9)
            "#,
            params![
                publication.external_task_id,
                publication.hash,
                publication.pair_name,
                wave.ordinal,
                wave.phase.as_i64(),
                publication.token_index as i64,
                publication.exclusive,
                publication.requested_assignments,
                now
            ],
        )?;
        if inserted == 0 {
            return Err(WaveError::InvariantViolation(format!(
                "task {} already recorded",
                publication.external_task_id
            )));
        }

        tx.execute(
            r#"
            UPDATE round_doc
            SET wave_ordinal = ?2, wave_phase = ?3, pass = pass + 1, updated_at = ?4
            WHERE pair_name = ?1
            "#,
            params![publication.pair_name, wave.ordinal, wave.phase.as_i64(), now],
        )?;

        insert_event(
            &tx,
            "publish",
            &format!(
                "wave {} task {} pair {} requested {}",
                wave, publication.external_task_id, publication.pair_name, publication.requested_assignments
            ),
            now,
        )?;

        tx.commit()?;
        Ok(())
    }

    /// Mark a wave's publication finished. Only a sealed wave can close.
    ///
    /// Returns the wave's progress, or None if the wave has no row (nothing
    /// was published).
    pub fn seal_wave(&self, wave: WaveNumber) -> Result<Option<WaveProgress>> {
        let tx = self.begin()?;
        tx.execute(
            r#"
            UPDATE stack_target
            SET sealed = 1,
                closed = CASE WHEN completed_count >= sent_count THEN 1 ELSE 0 END,
                updated_at = ?3
            WHERE wave_ordinal = ?1 AND wave_phase = ?2 AND sealed = 0
            "#,
            params![wave.ordinal, wave.phase.as_i64(), now_ms()],
        )?;
        let progress = wave_progress(&tx, wave)?;
        tx.commit()?;
        Ok(progress)
    }

    /// Whether the publisher finished the wave
    pub fn is_sealed(&self, wave: WaveNumber) -> Result<bool> {
        let sealed: Option<bool> = self
            .db
            .query_row(
                "SELECT sealed FROM stack_target WHERE wave_ordinal = ?1 AND wave_phase = ?2",
                params![wave.ordinal, wave.phase.as_i64()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(sealed.unwrap_or(false))
    }

    // ------------------------------------------------------------------
    // Waves
    // ------------------------------------------------------------------

    pub fn get_wave(&self, wave: WaveNumber) -> Result<Option<WaveRecord>> {
        let sql = format!(
            "SELECT {} FROM stack_target WHERE wave_ordinal = ?1 AND wave_phase = ?2",
            WAVE_COLUMNS
        );
        Ok(self
            .db
            .query_row(&sql, params![wave.ordinal, wave.phase.as_i64()], wave_from_row)
            .optional()?)
    }

    /// The most recently created wave
    pub fn latest_wave(&self) -> Result<Option<WaveRecord>> {
        let sql = format!(
            "SELECT {} FROM stack_target ORDER BY wave_ordinal DESC, wave_phase DESC LIMIT 1",
            WAVE_COLUMNS
        );
        Ok(self.db.query_row(&sql, [], wave_from_row).optional()?)
    }

    pub fn list_waves(&self) -> Result<Vec<WaveRecord>> {
        let sql = format!(
            "SELECT {} FROM stack_target ORDER BY wave_ordinal, wave_phase",
            WAVE_COLUMNS
        );
        let mut stmt = self.db.prepare(&sql)?;
        let rows = stmt.query_map([], wave_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Count one more finished task in the wave, closing it when every sent
    /// task is accounted for.
    pub fn increment_wave_completed(&self, wave: WaveNumber) -> Result<WaveProgress> {
        let tx = self.begin()?;
        let progress = increment_wave_completed_in(&tx, wave, now_ms())?;
        tx.commit()?;
        Ok(progress)
    }

    // ------------------------------------------------------------------
    // Tasks
    // ------------------------------------------------------------------

    pub fn get_task(&self, external_task_id: &str) -> Result<Option<TaskRecord>> {
        let sql = format!("SELECT {} FROM past_tasks WHERE external_task_id = ?1", TASK_COLUMNS);
        Ok(self.db.query_row(&sql, [external_task_id], task_from_row).optional()?)
    }

    pub fn list_tasks(&self) -> Result<Vec<TaskRecord>> {
        self.query_tasks("1 = 1")
    }

    /// Tasks still expecting credits
    pub fn open_tasks(&self) -> Result<Vec<TaskRecord>> {
        self.query_tasks("completed = 0 AND retired = 0")
    }

    pub fn tasks_in_wave(&self, wave: WaveNumber) -> Result<Vec<TaskRecord>> {
        let sql = format!(
            "SELECT {} FROM past_tasks WHERE wave_ordinal = ?1 AND wave_phase = ?2 ORDER BY created_at, external_task_id",
            TASK_COLUMNS
        );
        let mut stmt = self.db.prepare(&sql)?;
        let rows = stmt.query_map(params![wave.ordinal, wave.phase.as_i64()], task_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn query_tasks(&self, filter: &str) -> Result<Vec<TaskRecord>> {
        let sql = format!(
            "SELECT {} FROM past_tasks WHERE {} ORDER BY wave_ordinal, wave_phase, created_at, external_task_id",
            TASK_COLUMNS, filter
        );
        let mut stmt = self.db.prepare(&sql)?;
        let rows = stmt.query_map([], task_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Credit one submitted assignment.
    ///
    /// Idempotent on the assignment id. Crediting the third annotation of a
    /// pair completes its task and counts the task toward its wave.
    pub fn credit_assignment(&self, external_task_id: &str, assignment_id: &str, worker_id: &str) -> Result<CreditOutcome> {
        let tx = self.begin()?;
        let now = now_ms();

        let task_sql = format!("SELECT {} FROM past_tasks WHERE external_task_id = ?1", TASK_COLUMNS);
        let Some(task) = tx.query_row(&task_sql, [external_task_id], task_from_row).optional()? else {
            return Ok(CreditOutcome::UnknownTask);
        };

        let seen: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM task_assignments WHERE assignment_id = ?1",
                [assignment_id],
                |row| row.get(0),
            )
            .optional()?;
        if seen.is_some() {
            return Ok(CreditOutcome::AlreadyCredited);
        }
        if !task.is_open() {
            return Ok(CreditOutcome::TaskClosed);
        }

        tx.execute(
            r#"
            INSERT INTO task_assignments (assignment_id, external_task_id, worker_id, qualification_awarded, credited_at)
            VALUES (?1, ?2, ?3, 0, ?4)
            "#,
            params![assignment_id, external_task_id, worker_id, now],
        )?;

        let bumped = tx.execute(
            r#"
            UPDATE round_doc SET annotation_index = annotation_index + 1, updated_at = ?3
            WHERE pair_name = ?1 AND annotation_index < ?2
            "#,
            params![task.pair_name, COVERAGE_TARGET, now],
        )?;
        if bumped == 0 {
            return Err(WaveError::InvariantViolation(format!(
                "pair {} already has {} annotations; refusing to credit {}",
                task.pair_name, COVERAGE_TARGET, assignment_id
            )));
        }
        let annotation_index: u32 = tx.query_row(
            "SELECT annotation_index FROM round_doc WHERE pair_name = ?1",
            [&task.pair_name],
            |row| row.get(0),
        )?;
        let task_completed = annotation_index >= COVERAGE_TARGET;

        tx.execute(
            r#"
            UPDATE past_tasks
            SET credited_count = credited_count + 1, completed = ?2, updated_at = ?3
            WHERE external_task_id = ?1
            "#,
            params![external_task_id, task_completed, now],
        )?;

        tx.execute(
            r#"
            UPDATE stack_target
            SET worker_list = json_insert(worker_list, '$[#]', ?3), updated_at = ?4
            WHERE wave_ordinal = ?1 AND wave_phase = ?2
              AND NOT EXISTS (SELECT 1 FROM json_each(stack_target.worker_list) WHERE value = ?3)
            "#,
            params![task.wave.ordinal, task.wave.phase.as_i64(), worker_id, now],
        )?;

        let wave_progress = if task_completed {
            Some(increment_wave_completed_in(&tx, task.wave, now)?)
        } else {
            None
        };

        insert_event(
            &tx,
            "credit",
            &format!(
                "task {} assignment {} worker {} pair {} index {}",
                external_task_id, assignment_id, worker_id, task.pair_name, annotation_index
            ),
            now,
        )?;

        tx.commit()?;
        Ok(CreditOutcome::Credited(CreditReceipt {
            pair_name: task.pair_name,
            annotation_index,
            task_completed,
            wave_progress,
        }))
    }

    /// Retire a task whose lifetime ended before its pair reached coverage.
    ///
    /// The task counts toward its wave's completed count; its pair becomes
    /// a continuation candidate once the wave closes. Returns None if the
    /// task is unknown or already completed/retired.
    pub fn retire_task(&self, external_task_id: &str) -> Result<Option<WaveProgress>> {
        let tx = self.begin()?;
        let now = now_ms();

        let task_sql = format!("SELECT {} FROM past_tasks WHERE external_task_id = ?1", TASK_COLUMNS);
        let Some(task) = tx.query_row(&task_sql, [external_task_id], task_from_row).optional()? else {
            return Ok(None);
        };

        let retired = tx.execute(
            r#"
            UPDATE past_tasks SET retired = 1, updated_at = ?2
            WHERE external_task_id = ?1 AND completed = 0 AND retired = 0
            "#,
            params![external_task_id, now],
        )?;
        if retired == 0 {
            return Ok(None);
        }

        let progress = increment_wave_completed_in(&tx, task.wave, now)?;
        insert_event(
            &tx,
            "retire",
            &format!(
                "task {} pair {} after {} of {} credits",
                external_task_id, task.pair_name, task.credited_count, task.requested_assignments
            ),
            now,
        )?;
        tx.commit()?;
        Ok(Some(progress))
    }

    // ------------------------------------------------------------------
    // Qualification awards
    // ------------------------------------------------------------------

    /// Credited assignments whose worker still lacks the wave's token
    pub fn pending_awards(&self) -> Result<Vec<PendingAward>> {
        let mut stmt = self.db.prepare(
            r#"
            SELECT a.assignment_id, a.worker_id, a.external_task_id, t.wave_ordinal, t.wave_phase, t.token_index
            FROM task_assignments a
            JOIN past_tasks t ON t.external_task_id = a.external_task_id
            WHERE a.qualification_awarded = 0
            ORDER BY a.credited_at, a.assignment_id
            "#,
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(PendingAward {
                assignment_id: row.get(0)?,
                worker_id: row.get(1)?,
                external_task_id: row.get(2)?,
                wave: wave_from_columns(row, 3, 4)?,
                token_index: row.get::<_, i64>(5)? as usize,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn mark_qualification_awarded(&self, assignment_id: &str) -> Result<bool> {
        let updated = self.db.execute(
            "UPDATE task_assignments SET qualification_awarded = 1 WHERE assignment_id = ?1 AND qualification_awarded = 0",
            [assignment_id],
        )?;
        Ok(updated == 1)
    }

    pub fn credited_assignment_count(&self) -> Result<u32> {
        Ok(self
            .db
            .query_row("SELECT COUNT(*) FROM task_assignments", [], |row| row.get(0))?)
    }

    // ------------------------------------------------------------------
    // Eligibility tokens
    // ------------------------------------------------------------------

    /// Persist a provisioned token; an existing index is never overwritten.
    pub fn save_eligibility_token(&self, token_index: usize, qualification_id: &str) -> Result<bool> {
        let inserted = self.db.execute(
            "INSERT OR IGNORE INTO eligibility_tokens (token_index, qualification_id, created_at) VALUES (?1, ?2, ?3)",
            params![token_index as i64, qualification_id, now_ms()],
        )?;
        Ok(inserted == 1)
    }

    pub fn list_eligibility_tokens(&self) -> Result<Vec<(usize, String)>> {
        let mut stmt = self
            .db
            .prepare("SELECT token_index, qualification_id FROM eligibility_tokens ORDER BY token_index")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, i64>(0)? as usize, row.get(1)?)))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // ------------------------------------------------------------------
    // Event log
    // ------------------------------------------------------------------

    pub fn log_event(&self, kind: &str, detail: &str) -> Result<()> {
        insert_event(&self.db, kind, detail, now_ms())
    }

    /// Most recent events, newest first
    pub fn recent_events(&self, limit: usize) -> Result<Vec<EventRecord>> {
        let mut stmt = self
            .db
            .prepare("SELECT id, kind, detail, created_at FROM event_log ORDER BY id DESC LIMIT ?1")?;
        let rows = stmt.query_map([limit as i64], |row| {
            Ok(EventRecord {
                id: row.get(0)?,
                kind: row.get(1)?,
                detail: row.get(2)?,
                created_at: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

fn insert_event(db: &Connection, kind: &str, detail: &str, now: i64) -> Result<()> {
    db.execute(
        "INSERT INTO event_log (kind, detail, created_at) VALUES (?1, ?2, ?3)",
        params![kind, detail, now],
    )?;
    Ok(())
}

fn wave_closed(db: &Connection, wave: WaveNumber) -> Result<bool> {
    let closed: Option<bool> = db
        .query_row(
            "SELECT closed FROM stack_target WHERE wave_ordinal = ?1 AND wave_phase = ?2",
            params![wave.ordinal, wave.phase.as_i64()],
            |row| row.get(0),
        )
        .optional()?;
    closed.ok_or_else(|| WaveError::InvariantViolation(format!("pair references missing wave {}", wave)))
}

fn wave_progress(db: &Connection, wave: WaveNumber) -> Result<Option<WaveProgress>> {
    Ok(db
        .query_row(
            "SELECT sent_count, completed_count, closed FROM stack_target WHERE wave_ordinal = ?1 AND wave_phase = ?2",
            params![wave.ordinal, wave.phase.as_i64()],
            |row| {
                Ok(WaveProgress {
                    wave,
                    sent_count: row.get(0)?,
                    completed_count: row.get(1)?,
                    closed: row.get(2)?,
                })
            },
        )
        .optional()?)
}

fn increment_wave_completed_in(db: &Connection, wave: WaveNumber, now: i64) -> Result<WaveProgress> {
    let updated = db.execute(
        r#"
        UPDATE stack_target
        SET completed_count = completed_count + 1,
            closed = CASE WHEN sealed = 1 AND completed_count + 1 >= sent_count THEN 1 ELSE 0 END,
            updated_at = ?3
        WHERE wave_ordinal = ?1 AND wave_phase = ?2 AND closed = 0 AND completed_count < sent_count
        "#,
        params![wave.ordinal, wave.phase.as_i64(), now],
    )?;

    let progress = wave_progress(db, wave)?
        .ok_or_else(|| WaveError::UnknownReference(format!("wave {}", wave)))?;
    if updated == 0 {
        return Err(WaveError::InvariantViolation(format!(
            "wave {} cannot complete more tasks ({} of {} completed, closed={})",
            wave, progress.completed_count, progress.sent_count, progress.closed
        )));
    }
    if progress.closed {
        insert_event(db, "close", &format!("wave {} closed after {} tasks", wave, progress.sent_count), now)?;
    }
    Ok(progress)
}

fn wave_from_columns(row: &Row<'_>, ordinal_idx: usize, phase_idx: usize) -> rusqlite::Result<WaveNumber> {
    let ordinal: u32 = row.get(ordinal_idx)?;
    let phase: i64 = row.get(phase_idx)?;
    let phase = RotationPhase::from_i64(phase).ok_or(rusqlite::Error::IntegralValueOutOfRange(phase_idx, phase))?;
    Ok(WaveNumber::new(ordinal, phase))
}

fn pair_from_row(row: &Row<'_>) -> rusqlite::Result<PairRecord> {
    let ordinal: Option<u32> = row.get(6)?;
    let phase: Option<i64> = row.get(7)?;
    let wave = match (ordinal, phase) {
        (Some(ordinal), Some(phase)) => Some(WaveNumber::new(
            ordinal,
            RotationPhase::from_i64(phase).ok_or(rusqlite::Error::IntegralValueOutOfRange(7, phase))?,
        )),
        _ => None,
    };
    Ok(PairRecord {
        pair_name: row.get(0)?,
        hash: row.get(1)?,
        doc_a: row.get(2)?,
        doc_b: row.get(3)?,
        group_rank: row.get(4)?,
        group_position: row.get(5)?,
        wave,
        annotation_index: row.get(8)?,
        pass: row.get(9)?,
        sentence_count: row.get(10)?,
        reward: Reward::from_cents(row.get(11)?),
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
    })
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<TaskRecord> {
    Ok(TaskRecord {
        external_task_id: row.get(0)?,
        hash: row.get(1)?,
        pair_name: row.get(2)?,
        wave: wave_from_columns(row, 3, 4)?,
        token_index: row.get::<_, i64>(5)? as usize,
        exclusive: row.get(6)?,
        requested_assignments: row.get(7)?,
        credited_count: row.get(8)?,
        completed: row.get(9)?,
        retired: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

fn wave_from_row(row: &Row<'_>) -> rusqlite::Result<WaveRecord> {
    let worker_list: String = row.get(7)?;
    let workers: Vec<String> = serde_json::from_str(&worker_list)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(7, rusqlite::types::Type::Text, Box::new(e)))?;
    Ok(WaveRecord {
        wave: wave_from_columns(row, 0, 1)?,
        sent_count: row.get(2)?,
        completed_count: row.get(3)?,
        closed: row.get(4)?,
        token_index: row.get::<_, i64>(5)? as usize,
        exclusive: row.get(6)?,
        workers,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{pair_hash, pair_name};
    use tempfile::TempDir;

    fn create_temp_store() -> (StateStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = StateStore::open(&temp_dir.path().join("state").join("wavecrowd.db")).unwrap();
        (store, temp_dir)
    }

    fn new_pair(a: &str, b: &str, rank: u32, position: u32) -> NewPair {
        let name = pair_name(a, b);
        NewPair {
            hash: pair_hash(&name),
            pair_name: name,
            doc_a: a.to_string(),
            doc_b: b.to_string(),
            group_rank: rank,
            group_position: position,
            sentence_count: 20,
            reward: Reward::from_cents(230),
        }
    }

    fn publication(pair: &NewPair, task_id: &str, wave: WaveNumber, requested: u32) -> Publication {
        Publication {
            external_task_id: task_id.to_string(),
            pair_name: pair.pair_name.clone(),
            hash: pair.hash.clone(),
            wave,
            token_index: wave.token_index(),
            exclusive: wave.is_exclusive(),
            requested_assignments: requested,
        }
    }

    /// Register and publish a single pair in `wave`, then seal the wave
    fn publish_one(store: &StateStore, pair: &NewPair, task_id: &str, wave: WaveNumber) {
        store.register_pair(pair).unwrap();
        store.record_publication(&publication(pair, task_id, wave, 3)).unwrap();
        store.seal_wave(wave).unwrap();
    }

    #[test]
    fn test_open_creates_directories() {
        let (store, temp) = create_temp_store();
        assert!(temp.path().join("state/wavecrowd.db").exists());
        assert!(store.path().ends_with("wavecrowd.db"));
    }

    #[test]
    fn test_reopen_preserves_state() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("wavecrowd.db");
        {
            let store = StateStore::open(&path).unwrap();
            store.register_pair(&new_pair("a", "b", 0, 0)).unwrap();
        }
        let store = StateStore::open(&path).unwrap();
        assert!(store.get_pair("pair_a_and_b").unwrap().is_some());
    }

    #[test]
    fn test_register_pair_is_idempotent() {
        let (store, _temp) = create_temp_store();
        let pair = new_pair("a", "b", 0, 0);
        assert!(store.register_pair(&pair).unwrap());
        assert!(!store.register_pair(&pair).unwrap());

        let record = store.get_pair(&pair.pair_name).unwrap().unwrap();
        assert_eq!(record.wave, None);
        assert_eq!(record.annotation_index, 0);
        assert_eq!(record.pass, 0);
        assert_eq!(record.reward.to_string(), "2.30");
        assert_eq!(store.get_pair_by_hash(&pair.hash).unwrap().unwrap().pair_name, pair.pair_name);
    }

    #[test]
    fn test_unassigned_pairs_in_priority_order() {
        let (store, _temp) = create_temp_store();
        store.register_pair(&new_pair("c", "d", 1, 0)).unwrap();
        store.register_pair(&new_pair("a", "b", 0, 1)).unwrap();
        store.register_pair(&new_pair("a", "c", 0, 0)).unwrap();

        let names: Vec<String> = store
            .unassigned_pairs()
            .unwrap()
            .into_iter()
            .map(|p| p.pair_name)
            .collect();
        assert_eq!(names, vec!["pair_a_and_c", "pair_a_and_b", "pair_c_and_d"]);
        assert_eq!(store.max_group_rank().unwrap(), Some(1));
    }

    #[test]
    fn test_record_publication_creates_wave() {
        let (store, _temp) = create_temp_store();
        let wave = WaveNumber::first();
        let p1 = new_pair("a", "b", 0, 0);
        let p2 = new_pair("a", "c", 0, 1);
        store.register_pair(&p1).unwrap();
        store.register_pair(&p2).unwrap();

        store.record_publication(&publication(&p1, "T1", wave, 3)).unwrap();
        store.record_publication(&publication(&p2, "T2", wave, 3)).unwrap();

        let record = store.get_wave(wave).unwrap().unwrap();
        assert_eq!(record.sent_count, 2);
        assert_eq!(record.completed_count, 0);
        assert!(!record.closed);
        assert_eq!(record.token_index, 1);
        assert!(!record.exclusive);

        let pair = store.get_pair(&p1.pair_name).unwrap().unwrap();
        assert_eq!(pair.wave, Some(wave));
        assert_eq!(pair.pass, 1);
        assert!(store.unassigned_pairs().unwrap().is_empty());
        assert_eq!(store.open_tasks().unwrap().len(), 2);
    }

    #[test]
    fn test_duplicate_publication_in_same_wave_rejected() {
        let (store, _temp) = create_temp_store();
        let wave = WaveNumber::first();
        let p1 = new_pair("a", "b", 0, 0);
        store.register_pair(&p1).unwrap();
        store.record_publication(&publication(&p1, "T1", wave, 3)).unwrap();

        let err = store.record_publication(&publication(&p1, "T2", wave, 3)).unwrap_err();
        assert!(matches!(err, WaveError::InvariantViolation(_)));
        // Rolled back: still one task, one sent
        assert_eq!(store.list_tasks().unwrap().len(), 1);
        assert_eq!(store.get_wave(wave).unwrap().unwrap().sent_count, 1);
    }

    #[test]
    fn test_publication_into_next_wave_while_open_rejected() {
        let (store, _temp) = create_temp_store();
        let p1 = new_pair("a", "b", 0, 0);
        store.register_pair(&p1).unwrap();
        store.record_publication(&publication(&p1, "T1", WaveNumber::first(), 3)).unwrap();

        let next = WaveNumber::next(Some(WaveNumber::first()));
        let err = store.record_publication(&publication(&p1, "T2", next, 3)).unwrap_err();
        assert!(matches!(err, WaveError::InvariantViolation(_)));
    }

    #[test]
    fn test_publication_after_seal_rejected() {
        let (store, _temp) = create_temp_store();
        let wave = WaveNumber::first();
        let p1 = new_pair("a", "b", 0, 0);
        let p2 = new_pair("a", "c", 0, 1);
        publish_one(&store, &p1, "T1", wave);
        store.register_pair(&p2).unwrap();

        let err = store.record_publication(&publication(&p2, "T2", wave, 3)).unwrap_err();
        assert!(matches!(err, WaveError::InvariantViolation(_)));
        assert!(store.get_pair(&p2.pair_name).unwrap().unwrap().wave.is_none());
    }

    #[test]
    fn test_unknown_pair_publication() {
        let (store, _temp) = create_temp_store();
        let p1 = new_pair("a", "b", 0, 0);
        let err = store
            .record_publication(&publication(&p1, "T1", WaveNumber::first(), 3))
            .unwrap_err();
        assert!(matches!(err, WaveError::UnknownReference(_)));
    }

    #[test]
    fn test_credit_is_idempotent() {
        let (store, _temp) = create_temp_store();
        let p1 = new_pair("a", "b", 0, 0);
        publish_one(&store, &p1, "T1", WaveNumber::first());

        let first = store.credit_assignment("T1", "A1", "W1").unwrap();
        assert!(matches!(first, CreditOutcome::Credited(ref r) if r.annotation_index == 1 && !r.task_completed));
        let again = store.credit_assignment("T1", "A1", "W1").unwrap();
        assert_eq!(again, CreditOutcome::AlreadyCredited);

        let pair = store.get_pair(&p1.pair_name).unwrap().unwrap();
        assert_eq!(pair.annotation_index, 1);
        assert_eq!(store.credited_assignment_count().unwrap(), 1);
    }

    #[test]
    fn test_credit_unknown_task() {
        let (store, _temp) = create_temp_store();
        assert_eq!(
            store.credit_assignment("nope", "A1", "W1").unwrap(),
            CreditOutcome::UnknownTask
        );
    }

    #[test]
    fn test_third_credit_completes_task_and_closes_wave() {
        let (store, _temp) = create_temp_store();
        let wave = WaveNumber::first();
        let p1 = new_pair("a", "b", 0, 0);
        publish_one(&store, &p1, "T1", wave);

        store.credit_assignment("T1", "A1", "W1").unwrap();
        store.credit_assignment("T1", "A2", "W2").unwrap();
        let outcome = store.credit_assignment("T1", "A3", "W3").unwrap();

        let CreditOutcome::Credited(receipt) = outcome else {
            panic!("expected credit, got {:?}", outcome);
        };
        assert!(receipt.task_completed);
        let progress = receipt.wave_progress.unwrap();
        assert_eq!(progress.completed_count, 1);
        assert!(progress.closed);

        let task = store.get_task("T1").unwrap().unwrap();
        assert!(task.completed);
        assert_eq!(task.credited_count, 3);

        let wave_record = store.get_wave(wave).unwrap().unwrap();
        assert_eq!(wave_record.workers, vec!["W1", "W2", "W3"]);

        assert_eq!(store.credit_assignment("T1", "A4", "W4").unwrap(), CreditOutcome::TaskClosed);
        assert_eq!(store.get_pair(&p1.pair_name).unwrap().unwrap().annotation_index, 3);
    }

    #[test]
    fn test_worker_list_is_distinct() {
        let (store, _temp) = create_temp_store();
        let wave = WaveNumber::first();
        let p1 = new_pair("a", "b", 0, 0);
        let p2 = new_pair("a", "c", 0, 1);
        store.register_pair(&p1).unwrap();
        store.register_pair(&p2).unwrap();
        store.record_publication(&publication(&p1, "T1", wave, 3)).unwrap();
        store.record_publication(&publication(&p2, "T2", wave, 3)).unwrap();

        store.credit_assignment("T1", "A1", "W1").unwrap();
        store.credit_assignment("T2", "A2", "W1").unwrap();
        assert_eq!(store.get_wave(wave).unwrap().unwrap().workers, vec!["W1"]);
    }

    #[test]
    fn test_unsealed_wave_does_not_close() {
        let (store, _temp) = create_temp_store();
        let wave = WaveNumber::first();
        let p1 = new_pair("a", "b", 0, 0);
        store.register_pair(&p1).unwrap();
        store.record_publication(&publication(&p1, "T1", wave, 3)).unwrap();

        for (a, w) in [("A1", "W1"), ("A2", "W2"), ("A3", "W3")] {
            store.credit_assignment("T1", a, w).unwrap();
        }
        assert!(!store.get_wave(wave).unwrap().unwrap().closed);

        let progress = store.seal_wave(wave).unwrap().unwrap();
        assert!(progress.closed);
        assert!(store.is_sealed(wave).unwrap());
    }

    #[test]
    fn test_seal_missing_wave() {
        let (store, _temp) = create_temp_store();
        assert!(store.seal_wave(WaveNumber::first()).unwrap().is_none());
    }

    #[test]
    fn test_increment_beyond_sent_is_violation() {
        let (store, _temp) = create_temp_store();
        let wave = WaveNumber::first();
        publish_one(&store, &new_pair("a", "b", 0, 0), "T1", wave);

        let progress = store.increment_wave_completed(wave).unwrap();
        assert!(progress.closed);
        let err = store.increment_wave_completed(wave).unwrap_err();
        assert!(matches!(err, WaveError::InvariantViolation(_)));
        assert_eq!(store.get_wave(wave).unwrap().unwrap().completed_count, 1);
    }

    #[test]
    fn test_increment_unknown_wave() {
        let (store, _temp) = create_temp_store();
        let err = store.increment_wave_completed(WaveNumber::first()).unwrap_err();
        assert!(matches!(err, WaveError::UnknownReference(_)));
    }

    #[test]
    fn test_retire_makes_pair_a_continuation_candidate() {
        let (store, _temp) = create_temp_store();
        let wave = WaveNumber::first();
        let p1 = new_pair("a", "b", 0, 0);
        publish_one(&store, &p1, "T1", wave);
        store.credit_assignment("T1", "A1", "W1").unwrap();

        assert!(store.continuation_candidates().unwrap().is_empty());
        let progress = store.retire_task("T1").unwrap().unwrap();
        assert!(progress.closed);
        assert!(store.retire_task("T1").unwrap().is_none());

        let candidates = store.continuation_candidates().unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].remaining(), 2);

        // Continuation into the next wave asks only for what is missing
        let next = WaveNumber::next(Some(wave));
        store.record_publication(&publication(&p1, "T2", next, 2)).unwrap();
        let pair = store.get_pair(&p1.pair_name).unwrap().unwrap();
        assert_eq!(pair.pass, 2);
        assert_eq!(pair.wave, Some(next));
        let task = store.get_task("T2").unwrap().unwrap();
        assert!(task.exclusive);
        assert_eq!(task.token_index, 2);
    }

    #[test]
    fn test_continuation_requested_must_match_remaining() {
        let (store, _temp) = create_temp_store();
        let wave = WaveNumber::first();
        let p1 = new_pair("a", "b", 0, 0);
        publish_one(&store, &p1, "T1", wave);
        store.credit_assignment("T1", "A1", "W1").unwrap();
        store.retire_task("T1").unwrap();

        let next = WaveNumber::next(Some(wave));
        let err = store.record_publication(&publication(&p1, "T2", next, 3)).unwrap_err();
        assert!(matches!(err, WaveError::InvariantViolation(_)));
    }

    #[test]
    fn test_pending_awards() {
        let (store, _temp) = create_temp_store();
        publish_one(&store, &new_pair("a", "b", 0, 0), "T1", WaveNumber::first());
        store.credit_assignment("T1", "A1", "W1").unwrap();
        store.credit_assignment("T1", "A2", "W2").unwrap();

        let pending = store.pending_awards().unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].token_index, 1);
        assert_eq!(pending[0].wave, WaveNumber::first());

        assert!(store.mark_qualification_awarded("A1").unwrap());
        assert!(!store.mark_qualification_awarded("A1").unwrap());
        let pending = store.pending_awards().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].worker_id, "W2");
    }

    #[test]
    fn test_eligibility_tokens_never_overwritten() {
        let (store, _temp) = create_temp_store();
        assert!(store.save_eligibility_token(0, "Q0").unwrap());
        assert!(!store.save_eligibility_token(0, "Qx").unwrap());
        store.save_eligibility_token(2, "Q2").unwrap();
        assert_eq!(
            store.list_eligibility_tokens().unwrap(),
            vec![(0, "Q0".to_string()), (2, "Q2".to_string())]
        );
    }

    #[test]
    fn test_pair_counts_and_events() {
        let (store, _temp) = create_temp_store();
        let p1 = new_pair("a", "b", 0, 0);
        store.register_pair(&new_pair("c", "d", 1, 0)).unwrap();
        publish_one(&store, &p1, "T1", WaveNumber::first());

        let counts = store.pair_counts().unwrap();
        assert_eq!(counts.total, 2);
        assert_eq!(counts.unassigned, 1);
        assert_eq!(counts.in_progress, 1);
        assert_eq!(counts.covered, 0);

        store.log_event("note", "hello").unwrap();
        let events = store.recent_events(2).unwrap();
        assert_eq!(events[0].kind, "note");
        assert_eq!(events[1].kind, "publish");
    }
}
