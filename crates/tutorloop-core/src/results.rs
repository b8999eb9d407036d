//! Execution and pipeline result types.
//!
//! [`ExecutionReport`] is what the sandbox hands back; [`SubmissionResult`]
//! is what the pipeline hands to its caller. The latter has no field that
//! could carry a hidden case, by construction.

use serde::{Deserialize, Serialize};

use crate::model::{
    Difficulty, DifficultySignal, ErrorClass, EscalationReason, MistakeCategory,
    SubmissionStatus, TestCase,
};

/// Marker stored as output of a case that ran out of time.
pub const TIMEOUT_MARKER: &str = "<timeout>";

// ---------------------------------------------------------------------------
// Sandbox output
// ---------------------------------------------------------------------------

/// How a single test case ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    Passed,
    WrongAnswer,
    /// Killed after exceeding the per-case time limit.
    Timeout,
    /// Non-zero exit, signal, or failure to start.
    Crashed,
    /// Killed by or failed under the memory ceiling.
    MemoryExceeded,
    /// Never started because the suite-wide time cap ran out.
    Skipped,
}

impl CaseStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CaseStatus::Passed => "passed",
            CaseStatus::WrongAnswer => "wrong_answer",
            CaseStatus::Timeout => "timeout",
            CaseStatus::Crashed => "crashed",
            CaseStatus::MemoryExceeded => "memory_exceeded",
            CaseStatus::Skipped => "skipped",
        }
    }
}

/// Outcome of one test case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseOutcome {
    /// Position of the case in the problem's ordered case list.
    pub index: usize,
    pub hidden: bool,
    pub status: CaseStatus,
    /// Trimmed stdout, or [`TIMEOUT_MARKER`].
    pub stdout: String,
    /// Truncated stderr.
    pub stderr: String,
    pub duration_ms: u64,
}

impl CaseOutcome {
    pub fn passed(&self) -> bool {
        self.status == CaseStatus::Passed
    }
}

/// Whether the program got past the compile/parse check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionStatus {
    Completed,
    SyntaxError { message: String },
}

/// Result of running one program against an ordered list of cases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub status: ExecutionStatus,
    pub outcomes: Vec<CaseOutcome>,
    /// Wall-clock time spent running cases.
    pub duration_ms: u64,
}

impl ExecutionReport {
    /// Short-circuit result for code that does not parse; no case was attempted.
    pub fn syntax_error(message: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::SyntaxError {
                message: message.into(),
            },
            outcomes: Vec::new(),
            duration_ms: 0,
        }
    }

    pub fn completed(outcomes: Vec<CaseOutcome>, duration_ms: u64) -> Self {
        Self {
            status: ExecutionStatus::Completed,
            outcomes,
            duration_ms,
        }
    }

    /// Report for an executor that could not run at all: every case crashed.
    pub fn fault(cases: &[TestCase], message: &str) -> Self {
        let outcomes = cases
            .iter()
            .enumerate()
            .map(|(index, case)| CaseOutcome {
                index,
                hidden: case.hidden,
                status: CaseStatus::Crashed,
                stdout: String::new(),
                stderr: message.to_string(),
                duration_ms: 0,
            })
            .collect();
        Self::completed(outcomes, 0)
    }

    pub fn compiled(&self) -> bool {
        matches!(self.status, ExecutionStatus::Completed)
    }

    pub fn syntax_message(&self) -> Option<&str> {
        match &self.status {
            ExecutionStatus::SyntaxError { message } => Some(message),
            ExecutionStatus::Completed => None,
        }
    }

    pub fn timed_out(&self) -> bool {
        self.outcomes
            .iter()
            .any(|o| matches!(o.status, CaseStatus::Timeout | CaseStatus::Skipped))
    }

    pub fn crashed(&self) -> bool {
        self.outcomes
            .iter()
            .any(|o| matches!(o.status, CaseStatus::Crashed | CaseStatus::MemoryExceeded))
    }

    pub fn pass_rate(&self) -> f64 {
        rate(self.outcomes.iter())
    }

    pub fn visible_pass_rate(&self) -> f64 {
        rate(self.outcomes.iter().filter(|o| !o.hidden))
    }

    /// Hidden-only pass rate; 0 when there are no hidden cases.
    pub fn hidden_pass_rate(&self) -> f64 {
        rate(self.outcomes.iter().filter(|o| o.hidden))
    }

    pub fn hidden_total(&self) -> usize {
        self.outcomes.iter().filter(|o| o.hidden).count()
    }

    /// Hidden-only pass rate, or `None` when nothing hidden was run.
    pub fn hidden_pass_rate_opt(&self) -> Option<f64> {
        (self.hidden_total() > 0).then(|| self.hidden_pass_rate())
    }

    pub fn submission_status(&self) -> SubmissionStatus {
        if !self.compiled() {
            SubmissionStatus::SyntaxError
        } else if self.timed_out() {
            SubmissionStatus::Timeout
        } else if self.crashed() {
            SubmissionStatus::Crashed
        } else {
            SubmissionStatus::Completed
        }
    }

    /// Caller-facing results for visible cases only, in case order.
    pub fn visible_results(&self, cases: &[TestCase]) -> Vec<VisibleCaseResult> {
        self.outcomes
            .iter()
            .filter(|o| !o.hidden)
            .filter_map(|o| {
                let case = cases.get(o.index)?;
                if case.hidden {
                    return None;
                }
                Some(VisibleCaseResult {
                    input: case.input.clone(),
                    expected: case.output.trim().to_string(),
                    got: o.stdout.clone(),
                    passed: o.passed(),
                    status: o.status,
                })
            })
            .collect()
    }
}

/// Division that defines the empty set's rate as 0.
pub fn safe_rate(passed: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        passed as f64 / total as f64
    }
}

fn rate<'a>(outcomes: impl Iterator<Item = &'a CaseOutcome>) -> f64 {
    let (passed, total) = outcomes.fold((0, 0), |(p, t), o| (p + usize::from(o.passed()), t + 1));
    safe_rate(passed, total)
}

// ---------------------------------------------------------------------------
// Pipeline output
// ---------------------------------------------------------------------------

/// One visible case as shown to the student.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisibleCaseResult {
    pub input: String,
    pub expected: String,
    pub got: String,
    pub passed: bool,
    pub status: CaseStatus,
}

/// Short-form feedback from the fast collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    pub text: String,
    pub mistake_category: MistakeCategory,
    pub difficulty_signal: DifficultySignal,
    /// True when the collaborator failed and the safe default was used.
    #[serde(default)]
    pub fallback: bool,
}

impl Feedback {
    pub const DEFAULT_TEXT: &'static str =
        "Review your logic and check your approach against the problem requirements.";

    /// Neutral feedback used whenever the collaborator cannot answer.
    pub fn fallback() -> Self {
        Self {
            text: Self::DEFAULT_TEXT.to_string(),
            mistake_category: MistakeCategory::Unknown,
            difficulty_signal: DifficultySignal::Same,
            fallback: true,
        }
    }
}

/// Long-form explanation from the deep collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeepExplanation {
    pub explanation: String,
    pub steps: Vec<String>,
    pub alternative_approach: String,
    /// Id of a validated practice problem added to the bank, if any.
    #[serde(default)]
    pub practice_problem_id: Option<String>,
}

/// Summary of the problem routed to next.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NextProblem {
    pub id: String,
    pub title: String,
    pub statement: String,
    pub difficulty: Difficulty,
    pub concept: String,
    pub concept_tags: Vec<String>,
    /// Zone band the problem came from; `None` for the Gaussian strategy.
    pub band: Option<u8>,
    pub fallback_used: bool,
}

/// Change to one capability score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityUpdate {
    pub concept: String,
    pub old_score: f64,
    pub new_score: f64,
    pub weight: f64,
}

impl CapabilityUpdate {
    pub fn delta(&self) -> f64 {
        self.new_score - self.old_score
    }
}

/// Everything a caller learns about an evaluated submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionResult {
    pub submission_id: String,
    pub status: SubmissionStatus,
    pub pass_rate: f64,
    pub visible_pass_rate: f64,
    pub visible_results: Vec<VisibleCaseResult>,
    pub error_class: ErrorClass,
    pub feedback: Feedback,
    pub deep_explanation: Option<DeepExplanation>,
    pub next_problem: Option<NextProblem>,
    /// Update to the problem's primary concept.
    pub capability: CapabilityUpdate,
    pub secondary_updates: Vec<CapabilityUpdate>,
    pub escalated: bool,
    pub escalation_reason: Option<EscalationReason>,
    pub gaming_flagged: bool,
}

/// Result shape of [`crate::engine::Pipeline::submit`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PipelineOutcome {
    Evaluated(Box<SubmissionResult>),
    /// Rapid identical resubmission; nothing was executed or stored.
    Throttled { cooldown_secs: u64 },
}

impl PipelineOutcome {
    pub fn evaluated(self) -> Option<SubmissionResult> {
        match self {
            PipelineOutcome::Evaluated(result) => Some(*result),
            PipelineOutcome::Throttled { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(index: usize, hidden: bool, status: CaseStatus) -> CaseOutcome {
        CaseOutcome {
            index,
            hidden,
            status,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 1,
        }
    }

    #[test]
    fn rates_split_visible_and_hidden() {
        let report = ExecutionReport::completed(
            vec![
                outcome(0, false, CaseStatus::Passed),
                outcome(1, false, CaseStatus::Passed),
                outcome(2, true, CaseStatus::WrongAnswer),
                outcome(3, true, CaseStatus::Passed),
            ],
            10,
        );
        assert_eq!(report.pass_rate(), 0.75);
        assert_eq!(report.visible_pass_rate(), 1.0);
        assert_eq!(report.hidden_pass_rate(), 0.5);
        assert_eq!(report.hidden_pass_rate_opt(), Some(0.5));
    }

    #[test]
    fn empty_sets_rate_zero() {
        let report = ExecutionReport::syntax_error("bad");
        assert_eq!(report.pass_rate(), 0.0);
        assert_eq!(report.visible_pass_rate(), 0.0);
        assert_eq!(report.hidden_pass_rate(), 0.0);
        assert_eq!(report.hidden_pass_rate_opt(), None);
        assert!(!report.compiled());
        assert_eq!(report.submission_status(), SubmissionStatus::SyntaxError);
    }

    #[test]
    fn visible_results_never_include_hidden_cases() {
        let cases = vec![
            TestCase::visible("1", "1"),
            TestCase::hidden("2", "secret"),
        ];
        let report = ExecutionReport::completed(
            vec![
                outcome(0, false, CaseStatus::Passed),
                outcome(1, true, CaseStatus::WrongAnswer),
            ],
            2,
        );
        let visible = report.visible_results(&cases);
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].input, "1");
        assert!(visible.iter().all(|v| v.expected != "secret"));
    }

    #[test]
    fn timeout_outranks_crash_in_status() {
        let report = ExecutionReport::completed(
            vec![
                outcome(0, false, CaseStatus::Crashed),
                outcome(1, false, CaseStatus::Timeout),
            ],
            2,
        );
        assert!(report.timed_out());
        assert!(report.crashed());
        assert_eq!(report.submission_status(), SubmissionStatus::Timeout);
    }

    #[test]
    fn fault_report_marks_every_case_crashed() {
        let cases = vec![TestCase::visible("1", "1"), TestCase::hidden("2", "2")];
        let report = ExecutionReport::fault(&cases, "spawn failed");
        assert_eq!(report.outcomes.len(), 2);
        assert!(report.crashed());
        assert_eq!(report.pass_rate(), 0.0);
    }
}
