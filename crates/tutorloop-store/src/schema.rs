//! Table definitions. Lists and case outcomes are stored as JSON text;
//! timestamps as fixed-width RFC 3339 so they sort lexically.

pub const DDL: &str = r#"
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS students (
  id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  email TEXT NOT NULL UNIQUE,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS problems (
  id TEXT PRIMARY KEY,
  title TEXT NOT NULL,
  statement TEXT NOT NULL,
  concept_tags_json TEXT NOT NULL,
  primary_concept TEXT NOT NULL,
  difficulty TEXT NOT NULL,
  difficulty_score REAL NOT NULL,
  test_cases_json TEXT NOT NULL,
  expected_complexity TEXT,
  provenance TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS submissions (
  id TEXT PRIMARY KEY,
  student_id TEXT NOT NULL REFERENCES students(id),
  problem_id TEXT NOT NULL,
  concept TEXT NOT NULL,
  code TEXT NOT NULL,
  code_hash TEXT NOT NULL,
  outcomes_json TEXT NOT NULL,
  pass_rate REAL NOT NULL,
  visible_pass_rate REAL NOT NULL,
  hidden_pass_rate REAL,
  status TEXT NOT NULL,
  error_class TEXT NOT NULL,
  capability_delta REAL NOT NULL,
  escalated INTEGER NOT NULL,
  escalation_reason TEXT,
  gaming_flagged INTEGER NOT NULL,
  gaming_reason TEXT,
  next_problem_id TEXT,
  submitted_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_submissions_student_problem
  ON submissions(student_id, problem_id, submitted_at);
CREATE INDEX IF NOT EXISTS idx_submissions_student_concept
  ON submissions(student_id, concept, submitted_at);

CREATE TABLE IF NOT EXISTS capability_scores (
  student_id TEXT NOT NULL REFERENCES students(id),
  concept TEXT NOT NULL,
  score REAL NOT NULL,
  updated_at TEXT NOT NULL,
  PRIMARY KEY (student_id, concept)
);

CREATE TABLE IF NOT EXISTS escalations (
  id TEXT PRIMARY KEY,
  student_id TEXT NOT NULL REFERENCES students(id),
  problem_id TEXT NOT NULL,
  submission_id TEXT NOT NULL REFERENCES submissions(id),
  reason TEXT NOT NULL,
  resolved INTEGER NOT NULL DEFAULT 0,
  logged_at TEXT NOT NULL
);
"#;
