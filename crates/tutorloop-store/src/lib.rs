//! tutorloop-store: SQLite persistence.
//!
//! [`SqliteRepository`] implements the core `Repository` seam on a single
//! serialized connection. A submission commit runs in one transaction.

pub mod schema;

use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};

use tutorloop_core::model::{CapabilityScore, EscalationLog, Problem, Student, Submission};
use tutorloop_core::repository::{Repository, SubmissionCommit};

const STUDENT_COLUMNS: &str = "id, name, email, created_at";
const PROBLEM_COLUMNS: &str = "id, title, statement, concept_tags_json, primary_concept, \
     difficulty, difficulty_score, test_cases_json, expected_complexity, provenance";
const SUBMISSION_COLUMNS: &str = "id, student_id, problem_id, concept, code, code_hash, \
     outcomes_json, pass_rate, visible_pass_rate, hidden_pass_rate, status, error_class, \
     capability_delta, escalated, escalation_reason, gaming_flagged, gaming_reason, \
     next_problem_id, submitted_at";
const SCORE_COLUMNS: &str = "student_id, concept, score, updated_at";
const ESCALATION_COLUMNS: &str =
    "id, student_id, problem_id, submission_id, reason, resolved, logged_at";

/// Durable repository backed by one SQLite database file.
#[derive(Clone)]
pub struct SqliteRepository {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRepository {
    /// Open (creating if needed) the database at `path` and apply the schema.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database: {}", path.display()))?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        let repo = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        repo.init_schema()?;
        Ok(repo)
    }

    pub fn init_schema(&self) -> Result<()> {
        self.conn()
            .execute_batch(schema::DDL)
            .context("failed to apply schema")?;
        Ok(())
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn query_submissions(
        &self,
        filter: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<Submission>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare(&format!("SELECT {SUBMISSION_COLUMNS} FROM submissions {filter}"))?;
        let rows = stmt.query_map(params, submission_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn query_scores(
        &self,
        filter: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<CapabilityScore>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare(&format!("SELECT {SCORE_COLUMNS} FROM capability_scores {filter}"))?;
        let rows = stmt.query_map(params, score_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

impl Repository for SqliteRepository {
    fn student(&self, id: &str) -> Result<Option<Student>> {
        let conn = self.conn();
        Ok(conn
            .query_row(
                &format!("SELECT {STUDENT_COLUMNS} FROM students WHERE id = ?1"),
                params![id],
                student_from_row,
            )
            .optional()?)
    }

    fn student_by_email(&self, email: &str) -> Result<Option<Student>> {
        let conn = self.conn();
        Ok(conn
            .query_row(
                &format!("SELECT {STUDENT_COLUMNS} FROM students WHERE email = ?1"),
                params![email],
                student_from_row,
            )
            .optional()?)
    }

    fn students(&self) -> Result<Vec<Student>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare(&format!("SELECT {STUDENT_COLUMNS} FROM students ORDER BY rowid"))?;
        let rows = stmt.query_map([], student_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn problem(&self, id: &str) -> Result<Option<Problem>> {
        let conn = self.conn();
        Ok(conn
            .query_row(
                &format!("SELECT {PROBLEM_COLUMNS} FROM problems WHERE id = ?1"),
                params![id],
                problem_from_row,
            )
            .optional()?)
    }

    fn problems(&self) -> Result<Vec<Problem>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare(&format!("SELECT {PROBLEM_COLUMNS} FROM problems ORDER BY rowid"))?;
        let rows = stmt.query_map([], problem_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn submissions(&self) -> Result<Vec<Submission>> {
        self.query_submissions("ORDER BY submitted_at, rowid", &[])
    }

    fn submissions_for_student(&self, student_id: &str) -> Result<Vec<Submission>> {
        self.query_submissions(
            "WHERE student_id = ?1 ORDER BY submitted_at, rowid",
            &[&student_id],
        )
    }

    fn recent_submissions(
        &self,
        student_id: &str,
        problem_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Submission>> {
        self.query_submissions(
            "WHERE student_id = ?1 AND problem_id = ?2 AND submitted_at >= ?3 \
             ORDER BY submitted_at DESC, rowid DESC",
            &[&student_id, &problem_id, &timestamp(since)],
        )
    }

    fn concept_history(
        &self,
        student_id: &str,
        concept: &str,
        limit: usize,
    ) -> Result<Vec<Submission>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.query_submissions(
            "WHERE student_id = ?1 AND concept = ?2 \
             ORDER BY submitted_at DESC, rowid DESC LIMIT ?3",
            &[&student_id, &concept, &limit],
        )
    }

    fn capability_scores(&self, student_id: &str) -> Result<Vec<CapabilityScore>> {
        self.query_scores("WHERE student_id = ?1 ORDER BY concept", &[&student_id])
    }

    fn all_capability_scores(&self) -> Result<Vec<CapabilityScore>> {
        self.query_scores("ORDER BY student_id, concept", &[])
    }

    fn capability_score(&self, student_id: &str, concept: &str) -> Result<Option<f64>> {
        let conn = self.conn();
        Ok(conn
            .query_row(
                "SELECT score FROM capability_scores WHERE student_id = ?1 AND concept = ?2",
                params![student_id, concept],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn escalations(&self, unresolved_only: bool) -> Result<Vec<EscalationLog>> {
        let conn = self.conn();
        let filter = if unresolved_only {
            "WHERE resolved = 0"
        } else {
            ""
        };
        let mut stmt = conn.prepare(&format!(
            "SELECT {ESCALATION_COLUMNS} FROM escalations {filter} ORDER BY logged_at, rowid"
        ))?;
        let rows = stmt.query_map([], escalation_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn insert_student(&self, student: &Student) -> Result<()> {
        let conn = self.conn();
        let taken: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM students WHERE email = ?1 OR id = ?2)",
            params![student.email, student.id],
            |row| row.get(0),
        )?;
        if taken {
            bail!("a student with email '{}' already exists", student.email);
        }
        conn.execute(
            &format!("INSERT INTO students({STUDENT_COLUMNS}) VALUES (?1, ?2, ?3, ?4)"),
            params![
                student.id,
                student.name,
                student.email,
                timestamp(student.created_at)
            ],
        )?;
        Ok(())
    }

    fn insert_problem(&self, problem: &Problem) -> Result<()> {
        let conn = self.conn();
        upsert_problem(&conn, problem)
    }

    fn commit(&self, commit: &SubmissionCommit) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let sub = &commit.submission;

        let known: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM students WHERE id = ?1)",
            params![sub.student_id],
            |row| row.get(0),
        )?;
        if !known {
            bail!("commit references unknown student '{}'", sub.student_id);
        }

        if let Some(problem) = &commit.generated_problem {
            upsert_problem(&tx, problem)?;
        }
        insert_submission(&tx, sub)
            .with_context(|| format!("failed to store submission '{}'", sub.id))?;
        for score in &commit.scores {
            tx.execute(
                &format!(
                    "INSERT INTO capability_scores({SCORE_COLUMNS}) VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(student_id, concept)
                     DO UPDATE SET score = excluded.score, updated_at = excluded.updated_at"
                ),
                params![
                    score.student_id,
                    score.concept,
                    score.score,
                    timestamp(score.updated_at)
                ],
            )?;
        }
        if let Some(log) = &commit.escalation {
            tx.execute(
                &format!(
                    "INSERT INTO escalations({ESCALATION_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
                ),
                params![
                    log.id,
                    log.student_id,
                    log.problem_id,
                    log.submission_id,
                    log.reason.as_str(),
                    log.resolved,
                    timestamp(log.logged_at)
                ],
            )?;
        }

        tx.commit().context("failed to commit submission")?;
        tracing::debug!(submission_id = %sub.id, scores = commit.scores.len(), "stored submission");
        Ok(())
    }

    fn resolve_escalation(&self, id: &str) -> Result<bool> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE escalations SET resolved = 1 WHERE id = ?1",
            params![id],
        )?;
        Ok(changed > 0)
    }
}

// ---------------------------------------------------------------------------
// Writes
// ---------------------------------------------------------------------------

/// Insert or update by id. An update keeps the row, and so the problem's
/// position in bank order.
fn upsert_problem(conn: &Connection, problem: &Problem) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO problems({PROBLEM_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(id) DO UPDATE SET
               title = excluded.title,
               statement = excluded.statement,
               concept_tags_json = excluded.concept_tags_json,
               primary_concept = excluded.primary_concept,
               difficulty = excluded.difficulty,
               difficulty_score = excluded.difficulty_score,
               test_cases_json = excluded.test_cases_json,
               expected_complexity = excluded.expected_complexity,
               provenance = excluded.provenance"
        ),
        params![
            problem.id,
            problem.title,
            problem.statement,
            serde_json::to_string(&problem.concept_tags)?,
            problem.primary_concept,
            problem.difficulty.as_str(),
            problem.difficulty_score,
            serde_json::to_string(&problem.test_cases)?,
            problem.expected_complexity,
            problem.provenance.as_str(),
        ],
    )
    .with_context(|| format!("failed to store problem '{}'", problem.id))?;
    Ok(())
}

fn insert_submission(tx: &Transaction<'_>, sub: &Submission) -> Result<()> {
    tx.execute(
        &format!(
            "INSERT INTO submissions({SUBMISSION_COLUMNS}) VALUES
             (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)"
        ),
        params![
            sub.id,
            sub.student_id,
            sub.problem_id,
            sub.concept,
            sub.code,
            sub.code_hash,
            serde_json::to_string(&sub.outcomes)?,
            sub.pass_rate,
            sub.visible_pass_rate,
            sub.hidden_pass_rate,
            sub.status.as_str(),
            sub.error_class.as_str(),
            sub.capability_delta,
            sub.escalated,
            sub.escalation_reason.map(|r| r.as_str()),
            sub.gaming_flagged,
            sub.gaming_reason.map(|r| r.as_str()),
            sub.next_problem_id,
            timestamp(sub.submitted_at),
        ],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

/// Nanosecond precision, `Z` suffix: fixed width, so text order is time order.
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn conversion_error(
    idx: usize,
    err: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, err.into())
}

fn time_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn enum_col<T: FromStr<Err = String>>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    text.parse().map_err(|e: String| conversion_error(idx, e))
}

fn opt_enum_col<T: FromStr<Err = String>>(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<T>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|t| t.parse().map_err(|e: String| conversion_error(idx, e)))
        .transpose()
}

fn json_col<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text).map_err(|e| conversion_error(idx, e))
}

fn student_from_row(row: &Row<'_>) -> rusqlite::Result<Student> {
    Ok(Student {
        id: row.get(0)?,
        name: row.get(1)?,
        email: row.get(2)?,
        created_at: time_col(row, 3)?,
    })
}

fn problem_from_row(row: &Row<'_>) -> rusqlite::Result<Problem> {
    Ok(Problem {
        id: row.get(0)?,
        title: row.get(1)?,
        statement: row.get(2)?,
        concept_tags: json_col(row, 3)?,
        primary_concept: row.get(4)?,
        difficulty: enum_col(row, 5)?,
        difficulty_score: row.get(6)?,
        test_cases: json_col(row, 7)?,
        expected_complexity: row.get(8)?,
        provenance: enum_col(row, 9)?,
    })
}

fn submission_from_row(row: &Row<'_>) -> rusqlite::Result<Submission> {
    Ok(Submission {
        id: row.get(0)?,
        student_id: row.get(1)?,
        problem_id: row.get(2)?,
        concept: row.get(3)?,
        code: row.get(4)?,
        code_hash: row.get(5)?,
        outcomes: json_col(row, 6)?,
        pass_rate: row.get(7)?,
        visible_pass_rate: row.get(8)?,
        hidden_pass_rate: row.get(9)?,
        status: enum_col(row, 10)?,
        error_class: enum_col(row, 11)?,
        capability_delta: row.get(12)?,
        escalated: row.get(13)?,
        escalation_reason: opt_enum_col(row, 14)?,
        gaming_flagged: row.get(15)?,
        gaming_reason: opt_enum_col(row, 16)?,
        next_problem_id: row.get(17)?,
        submitted_at: time_col(row, 18)?,
    })
}

fn score_from_row(row: &Row<'_>) -> rusqlite::Result<CapabilityScore> {
    Ok(CapabilityScore {
        student_id: row.get(0)?,
        concept: row.get(1)?,
        score: row.get(2)?,
        updated_at: time_col(row, 3)?,
    })
}

fn escalation_from_row(row: &Row<'_>) -> rusqlite::Result<EscalationLog> {
    Ok(EscalationLog {
        id: row.get(0)?,
        student_id: row.get(1)?,
        problem_id: row.get(2)?,
        submission_id: row.get(3)?,
        reason: enum_col(row, 4)?,
        resolved: row.get(5)?,
        logged_at: time_col(row, 6)?,
    })
}
