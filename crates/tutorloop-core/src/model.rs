//! Core data model types for tutorloop.
//!
//! Students, problems, submissions, capability scores and escalation logs,
//! plus the small closed vocabularies (difficulty, error class, signals)
//! that flow between pipeline stages.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::ProblemError;
use crate::results::CaseOutcome;

// ---------------------------------------------------------------------------
// Students
// ---------------------------------------------------------------------------

/// A registered learner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Student {
    pub id: String,
    pub name: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
}

impl Student {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            email: email.into(),
            created_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Problems
// ---------------------------------------------------------------------------

/// One stdin/stdout pair a submission is judged against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    /// Text fed to the program on stdin.
    pub input: String,
    /// Expected stdout, compared after trimming surrounding whitespace.
    pub output: String,
    /// Hidden cases count towards scoring but are never shown to the student.
    #[serde(default)]
    pub hidden: bool,
}

impl TestCase {
    pub fn visible(input: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
            hidden: false,
        }
    }

    pub fn hidden(input: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
            hidden: true,
        }
    }
}

/// Difficulty label of a problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
}

impl Difficulty {
    pub const ALL: [Difficulty; 3] = [Difficulty::Easy, Difficulty::Medium, Difficulty::Hard];

    /// Numeric difficulty used when a problem does not declare one.
    pub fn default_score(self) -> f64 {
        match self {
            Difficulty::Easy => 0.25,
            Difficulty::Medium => 0.55,
            Difficulty::Hard => 0.80,
        }
    }

    /// Difficulty scores a problem of this label is expected to carry.
    pub fn score_band(self) -> std::ops::RangeInclusive<f64> {
        match self {
            Difficulty::Easy => 0.0..=0.40,
            Difficulty::Medium => 0.40..=0.75,
            Difficulty::Hard => 0.75..=1.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Difficulty::Easy => "easy",
            Difficulty::Medium => "medium",
            Difficulty::Hard => "hard",
        }
    }
}

impl fmt::Display for Difficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Difficulty {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "easy" => Ok(Difficulty::Easy),
            "medium" => Ok(Difficulty::Medium),
            "hard" => Ok(Difficulty::Hard),
            other => Err(format!("unknown difficulty: {other}")),
        }
    }
}

/// Where a problem came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    /// Authored by faculty and loaded from a problem bank.
    Curated,
    /// Proposed by the deep-explanation collaborator and validated.
    Generated,
}

impl Provenance {
    pub fn as_str(self) -> &'static str {
        match self {
            Provenance::Curated => "curated",
            Provenance::Generated => "generated",
        }
    }
}

impl FromStr for Provenance {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "curated" => Ok(Provenance::Curated),
            "generated" => Ok(Provenance::Generated),
            other => Err(format!("unknown provenance: {other}")),
        }
    }
}

/// A practice problem in the bank.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Problem {
    pub id: String,
    pub title: String,
    pub statement: String,
    /// All concepts this problem exercises; always contains `primary_concept`.
    pub concept_tags: Vec<String>,
    pub primary_concept: String,
    pub difficulty: Difficulty,
    /// Position on a continuous 0..1 difficulty axis.
    pub difficulty_score: f64,
    /// Ordered cases, visible and hidden interleaved as authored.
    pub test_cases: Vec<TestCase>,
    #[serde(default)]
    pub expected_complexity: Option<String>,
    pub provenance: Provenance,
}

/// Unchecked problem fields, turned into a [`Problem`] by [`Problem::create`].
#[derive(Debug, Clone)]
pub struct NewProblem {
    pub id: String,
    pub title: String,
    pub statement: String,
    pub concept_tags: Vec<String>,
    pub primary_concept: String,
    pub difficulty: Difficulty,
    pub difficulty_score: Option<f64>,
    pub test_cases: Vec<TestCase>,
    pub expected_complexity: Option<String>,
    pub provenance: Provenance,
}

impl Problem {
    /// Build a problem, enforcing the creation-time invariants.
    ///
    /// The hidden-case ratio is checked here and nowhere else; the pipeline
    /// trusts every problem it reads back from the repository.
    pub fn create(new: NewProblem, min_hidden_ratio: f64) -> Result<Problem, ProblemError> {
        if new.id.trim().is_empty() {
            return Err(ProblemError::MissingField("id"));
        }
        if new.statement.trim().is_empty() {
            return Err(ProblemError::MissingField("statement"));
        }
        if new.primary_concept.trim().is_empty() {
            return Err(ProblemError::MissingField("primary_concept"));
        }
        if new.test_cases.is_empty() {
            return Err(ProblemError::NoTestCases);
        }

        let mut concept_tags: Vec<String> = Vec::with_capacity(new.concept_tags.len() + 1);
        for tag in new.concept_tags.iter().map(|t| t.trim().to_lowercase()) {
            if !tag.is_empty() && !concept_tags.contains(&tag) {
                concept_tags.push(tag);
            }
        }
        let primary_concept = new.primary_concept.trim().to_lowercase();
        if !concept_tags.contains(&primary_concept) {
            concept_tags.insert(0, primary_concept.clone());
        }

        let ratio = hidden_ratio(&new.test_cases);
        if ratio < min_hidden_ratio {
            return Err(ProblemError::InsufficientHidden {
                ratio,
                required: min_hidden_ratio,
            });
        }

        let difficulty_score = new
            .difficulty_score
            .unwrap_or_else(|| new.difficulty.default_score());
        if !(0.0..=1.0).contains(&difficulty_score) {
            return Err(ProblemError::DifficultyScoreOutOfRange(difficulty_score));
        }

        let title = if new.title.trim().is_empty() {
            truncate_chars(new.statement.trim(), 50)
        } else {
            new.title
        };

        Ok(Problem {
            id: new.id,
            title,
            statement: new.statement,
            concept_tags,
            primary_concept,
            difficulty: new.difficulty,
            difficulty_score,
            test_cases: new.test_cases,
            expected_complexity: new.expected_complexity,
            provenance: new.provenance,
        })
    }

    pub fn hidden_ratio(&self) -> f64 {
        hidden_ratio(&self.test_cases)
    }

    pub fn has_hidden_cases(&self) -> bool {
        self.test_cases.iter().any(|c| c.hidden)
    }

    /// Concepts other than the primary one, in tag order.
    pub fn secondary_concepts(&self) -> impl Iterator<Item = &str> {
        self.concept_tags
            .iter()
            .map(String::as_str)
            .filter(move |c| *c != self.primary_concept)
    }

    pub fn has_concept(&self, concept: &str) -> bool {
        self.primary_concept == concept || self.concept_tags.iter().any(|t| t == concept)
    }
}

fn hidden_ratio(cases: &[TestCase]) -> f64 {
    if cases.is_empty() {
        return 0.0;
    }
    cases.iter().filter(|c| c.hidden).count() as f64 / cases.len() as f64
}

/// Truncate to at most `max` characters without splitting a code point.
pub fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

// ---------------------------------------------------------------------------
// Classification vocabularies
// ---------------------------------------------------------------------------

/// Single best-guess structural error classification of a submission.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    SyntaxError,
    MissingBaseCase,
    OffByOne,
    WrongDataStructure,
    #[serde(rename = "brute_force_detected")]
    BruteForce,
    HardcodedValues,
    GeneralizationFailure,
    ApproachMismatch,
    #[default]
    None,
}

impl ErrorClass {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::SyntaxError => "syntax_error",
            ErrorClass::MissingBaseCase => "missing_base_case",
            ErrorClass::OffByOne => "off_by_one",
            ErrorClass::WrongDataStructure => "wrong_data_structure",
            ErrorClass::BruteForce => "brute_force_detected",
            ErrorClass::HardcodedValues => "hardcoded_values",
            ErrorClass::GeneralizationFailure => "generalization_failure",
            ErrorClass::ApproachMismatch => "approach_mismatch",
            ErrorClass::None => "none",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "syntax_error" => ErrorClass::SyntaxError,
            "missing_base_case" => ErrorClass::MissingBaseCase,
            "off_by_one" => ErrorClass::OffByOne,
            "wrong_data_structure" => ErrorClass::WrongDataStructure,
            "brute_force_detected" => ErrorClass::BruteForce,
            "hardcoded_values" => ErrorClass::HardcodedValues,
            "generalization_failure" => ErrorClass::GeneralizationFailure,
            "approach_mismatch" => ErrorClass::ApproachMismatch,
            "none" => ErrorClass::None,
            other => return Err(format!("unknown error class: {other}")),
        })
    }
}

/// Routing hint from the fast-feedback collaborator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DifficultySignal {
    Easier,
    #[default]
    Same,
    Harder,
}

impl DifficultySignal {
    /// Band offset applied by the zone selector.
    pub fn offset(self) -> i32 {
        match self {
            DifficultySignal::Easier => -1,
            DifficultySignal::Same => 0,
            DifficultySignal::Harder => 1,
        }
    }
}

impl FromStr for DifficultySignal {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "easier" => Ok(DifficultySignal::Easier),
            "same" => Ok(DifficultySignal::Same),
            "harder" => Ok(DifficultySignal::Harder),
            other => Err(format!("unknown difficulty signal: {other}")),
        }
    }
}

/// Mistake label returned with fast feedback.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MistakeCategory {
    OffByOne,
    MissingBaseCase,
    WrongDataStructure,
    BruteForce,
    Hardcoded,
    ApproachMismatch,
    Syntax,
    Logic,
    #[default]
    Unknown,
}

impl FromStr for MistakeCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_lowercase().as_str() {
            "off_by_one" => MistakeCategory::OffByOne,
            "missing_base_case" => MistakeCategory::MissingBaseCase,
            "wrong_data_structure" => MistakeCategory::WrongDataStructure,
            "brute_force" => MistakeCategory::BruteForce,
            "hardcoded" => MistakeCategory::Hardcoded,
            "approach_mismatch" => MistakeCategory::ApproachMismatch,
            "syntax" => MistakeCategory::Syntax,
            "logic" => MistakeCategory::Logic,
            "unknown" => MistakeCategory::Unknown,
            other => return Err(format!("unknown mistake category: {other}")),
        })
    }
}

/// Why the deep-explanation path was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationReason {
    StudentRequest,
    Streak,
    LowCapability,
    ConceptualGap,
}

impl EscalationReason {
    pub fn as_str(self) -> &'static str {
        match self {
            EscalationReason::StudentRequest => "student_request",
            EscalationReason::Streak => "streak",
            EscalationReason::LowCapability => "low_capability",
            EscalationReason::ConceptualGap => "conceptual_gap",
        }
    }
}

impl fmt::Display for EscalationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EscalationReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "student_request" => Ok(EscalationReason::StudentRequest),
            "streak" => Ok(EscalationReason::Streak),
            "low_capability" => Ok(EscalationReason::LowCapability),
            "conceptual_gap" => Ok(EscalationReason::ConceptualGap),
            other => Err(format!("unknown escalation reason: {other}")),
        }
    }
}

/// Why the hardcoding guard flagged a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GamingReason {
    VisibleOnlyPass,
    SuspiciousGap,
}

impl GamingReason {
    pub fn as_str(self) -> &'static str {
        match self {
            GamingReason::VisibleOnlyPass => "visible_only_pass",
            GamingReason::SuspiciousGap => "suspicious_gap",
        }
    }
}

impl FromStr for GamingReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "visible_only_pass" => Ok(GamingReason::VisibleOnlyPass),
            "suspicious_gap" => Ok(GamingReason::SuspiciousGap),
            other => Err(format!("unknown gaming reason: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Submissions, scores, escalations
// ---------------------------------------------------------------------------

/// Coarse execution status stored with a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    /// All cases ran to completion (pass or wrong answer).
    Completed,
    SyntaxError,
    /// At least one case timed out.
    Timeout,
    /// At least one case crashed or hit a resource limit.
    Crashed,
}

impl SubmissionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SubmissionStatus::Completed => "completed",
            SubmissionStatus::SyntaxError => "syntax_error",
            SubmissionStatus::Timeout => "timeout",
            SubmissionStatus::Crashed => "crashed",
        }
    }
}

impl FromStr for SubmissionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(SubmissionStatus::Completed),
            "syntax_error" => Ok(SubmissionStatus::SyntaxError),
            "timeout" => Ok(SubmissionStatus::Timeout),
            "crashed" => Ok(SubmissionStatus::Crashed),
            other => Err(format!("unknown submission status: {other}")),
        }
    }
}

/// Immutable record of one evaluation attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    pub id: String,
    pub student_id: String,
    pub problem_id: String,
    /// Primary concept of the problem at submission time.
    pub concept: String,
    pub code: String,
    /// sha256 of the trimmed code, used for duplicate detection.
    pub code_hash: String,
    /// Every case outcome, hidden ones included. Never returned to callers.
    pub outcomes: Vec<CaseOutcome>,
    pub pass_rate: f64,
    pub visible_pass_rate: f64,
    pub hidden_pass_rate: Option<f64>,
    pub status: SubmissionStatus,
    pub error_class: ErrorClass,
    /// Change applied to the primary concept's capability score.
    pub capability_delta: f64,
    pub escalated: bool,
    pub escalation_reason: Option<EscalationReason>,
    pub gaming_flagged: bool,
    pub gaming_reason: Option<GamingReason>,
    /// Problem handed out as the next one after this submission.
    pub next_problem_id: Option<String>,
    pub submitted_at: DateTime<Utc>,
}

/// Stable hash of submitted code, insensitive to surrounding whitespace.
pub fn code_hash(code: &str) -> String {
    hex::encode(Sha256::digest(code.trim().as_bytes()))
}

/// Mastery estimate for one (student, concept) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityScore {
    pub student_id: String,
    pub concept: String,
    /// Always within `[0.0, 1.0]`.
    pub score: f64,
    pub updated_at: DateTime<Utc>,
}

/// Append-only record of an escalation; only `resolved` may change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationLog {
    pub id: String,
    pub student_id: String,
    pub problem_id: String,
    pub submission_id: String,
    pub reason: EscalationReason,
    pub resolved: bool,
    pub logged_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_problem(cases: Vec<TestCase>) -> NewProblem {
        NewProblem {
            id: "sum-list".into(),
            title: String::new(),
            statement: "Read numbers and print their sum.".into(),
            concept_tags: vec!["Loops".into(), "arrays".into()],
            primary_concept: "loops".into(),
            difficulty: Difficulty::Easy,
            difficulty_score: None,
            test_cases: cases,
            expected_complexity: None,
            provenance: Provenance::Curated,
        }
    }

    #[test]
    fn create_enforces_hidden_ratio() {
        let cases = vec![
            TestCase::visible("1 2", "3"),
            TestCase::visible("2 2", "4"),
            TestCase::visible("0", "0"),
            TestCase::hidden("5 5", "10"),
        ];
        let err = Problem::create(new_problem(cases), 0.30).unwrap_err();
        assert!(matches!(err, ProblemError::InsufficientHidden { .. }));
    }

    #[test]
    fn create_normalises_tags_and_defaults() {
        let cases = vec![
            TestCase::visible("1 2", "3"),
            TestCase::hidden("5 5", "10"),
        ];
        let problem = Problem::create(new_problem(cases), 0.30).unwrap();
        assert_eq!(problem.concept_tags, vec!["loops", "arrays"]);
        assert_eq!(problem.difficulty_score, 0.25);
        assert_eq!(problem.title, "Read numbers and print their sum.");
        assert_eq!(problem.secondary_concepts().collect::<Vec<_>>(), vec!["arrays"]);
    }

    #[test]
    fn create_rejects_empty_cases() {
        let err = Problem::create(new_problem(vec![]), 0.30).unwrap_err();
        assert!(matches!(err, ProblemError::NoTestCases));
    }

    #[test]
    fn primary_concept_is_added_to_tags() {
        let mut new = new_problem(vec![TestCase::hidden("1", "1")]);
        new.concept_tags = vec!["arrays".into()];
        let problem = Problem::create(new, 0.30).unwrap();
        assert_eq!(problem.concept_tags, vec!["loops", "arrays"]);
    }

    #[test]
    fn code_hash_ignores_surrounding_whitespace() {
        assert_eq!(code_hash("print(1)\n"), code_hash("  print(1)"));
        assert_ne!(code_hash("print(1)"), code_hash("print(2)"));
    }

    #[test]
    fn error_class_round_trips_through_strings() {
        for class in [
            ErrorClass::SyntaxError,
            ErrorClass::BruteForce,
            ErrorClass::None,
        ] {
            assert_eq!(class.as_str().parse::<ErrorClass>().unwrap(), class);
        }
        let json = serde_json::to_string(&ErrorClass::BruteForce).unwrap();
        assert_eq!(json, "\"brute_force_detected\"");
    }

    #[test]
    fn difficulty_signal_offsets() {
        assert_eq!(DifficultySignal::Easier.offset(), -1);
        assert_eq!(DifficultySignal::default().offset(), 0);
        assert_eq!("HARDER".parse::<DifficultySignal>().unwrap().offset(), 1);
    }
}
