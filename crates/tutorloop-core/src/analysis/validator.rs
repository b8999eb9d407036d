//! Validation of generated practice problems.
//!
//! A proposal becomes a bank problem only after three steps: structural
//! checks, a run of the reference solution through the same executor that
//! judges students, and a speed check against the declared difficulty.

use std::fmt;
use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use crate::config::ValidationConfig;
use crate::error::ProblemError;
use crate::model::{Difficulty, NewProblem, Problem, Provenance};
use crate::traits::{CodeExecutor, ExecutionRequest, MiniProblem};

/// Why a proposal was turned down.
#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    MissingField(&'static str),
    EmptyStatement,
    InvalidDifficulty(String),
    InvalidTestCases,
    InsufficientHidden { ratio: f64 },
    ReferenceSyntaxError,
    ReferenceTimeout,
    ReferenceRuntimeError,
    ReferenceFails { pass_rate: f64 },
    TooSlow { elapsed_ms: u64, limit_ms: u64 },
    ExecutorFault(String),
}

impl Rejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rejection::MissingField(_) => "missing_fields",
            Rejection::EmptyStatement => "empty_statement",
            Rejection::InvalidDifficulty(_) => "invalid_difficulty",
            Rejection::InvalidTestCases => "invalid_test_cases",
            Rejection::InsufficientHidden { .. } => "insufficient_hidden",
            Rejection::ReferenceSyntaxError => "reference_solution_syntax_error",
            Rejection::ReferenceTimeout => "reference_solution_timeout",
            Rejection::ReferenceRuntimeError => "reference_solution_runtime_error",
            Rejection::ReferenceFails { .. } => "reference_solution_fails",
            Rejection::TooSlow { .. } => "too_slow_for_difficulty",
            Rejection::ExecutorFault(_) => "executor_fault",
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct ProblemValidator {
    executor: Arc<dyn CodeExecutor>,
    config: ValidationConfig,
    min_hidden_ratio: f64,
}

impl ProblemValidator {
    pub fn new(
        executor: Arc<dyn CodeExecutor>,
        config: ValidationConfig,
        min_hidden_ratio: f64,
    ) -> Self {
        Self {
            executor,
            config,
            min_hidden_ratio,
        }
    }

    /// Turn a proposal into a `generated` problem, or say why not.
    pub async fn validate(&self, proposal: &MiniProblem) -> Result<Problem, Rejection> {
        let problem = self.structural(proposal)?;

        let request = ExecutionRequest {
            code: proposal.reference_solution.clone(),
            cases: problem.test_cases.clone(),
        };
        let report = self
            .executor
            .execute(&request)
            .await
            .map_err(|e| Rejection::ExecutorFault(format!("{e:#}")))?;

        if !report.compiled() {
            return Err(Rejection::ReferenceSyntaxError);
        }
        if report.timed_out() {
            return Err(Rejection::ReferenceTimeout);
        }
        let pass_rate = report.pass_rate();
        if report.crashed() && pass_rate < 1.0 {
            return Err(Rejection::ReferenceRuntimeError);
        }
        if pass_rate < 1.0 {
            return Err(Rejection::ReferenceFails { pass_rate });
        }

        let limit_ms = self.config.max_reference_ms(problem.difficulty);
        if report.duration_ms > limit_ms {
            return Err(Rejection::TooSlow {
                elapsed_ms: report.duration_ms,
                limit_ms,
            });
        }

        info!(
            problem_id = %problem.id,
            difficulty = %problem.difficulty,
            elapsed_ms = report.duration_ms,
            "generated problem validated"
        );
        Ok(problem)
    }

    fn structural(&self, proposal: &MiniProblem) -> Result<Problem, Rejection> {
        if proposal.statement.trim().chars().count() < self.config.min_statement_chars {
            return Err(Rejection::EmptyStatement);
        }
        let tags: Vec<String> = proposal
            .concept_tags
            .iter()
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();
        let Some(primary) = tags.first().cloned() else {
            return Err(Rejection::MissingField("concept_tags"));
        };
        let difficulty: Difficulty = proposal
            .difficulty
            .parse()
            .map_err(|_| Rejection::InvalidDifficulty(proposal.difficulty.clone()))?;
        if proposal.reference_solution.trim().is_empty() {
            return Err(Rejection::MissingField("reference_solution"));
        }
        if proposal.test_cases.is_empty() {
            return Err(Rejection::InvalidTestCases);
        }

        let new = NewProblem {
            id: generated_id(),
            title: String::new(),
            statement: proposal.statement.trim().to_string(),
            concept_tags: tags,
            primary_concept: primary,
            difficulty,
            difficulty_score: None,
            test_cases: proposal.test_cases.clone(),
            expected_complexity: None,
            provenance: Provenance::Generated,
        };
        Problem::create(new, self.min_hidden_ratio).map_err(|e| match e {
            ProblemError::InsufficientHidden { ratio, .. } => {
                Rejection::InsufficientHidden { ratio }
            }
            ProblemError::NoTestCases => Rejection::InvalidTestCases,
            ProblemError::MissingField(field) => Rejection::MissingField(field),
            ProblemError::DifficultyScoreOutOfRange(_) => {
                Rejection::InvalidDifficulty(proposal.difficulty.clone())
            }
        })
    }

    /// [`Self::validate`], logging and discarding rejections.
    pub async fn accept(&self, proposal: &MiniProblem) -> Option<Problem> {
        match self.validate(proposal).await {
            Ok(problem) => Some(problem),
            Err(rejection) => {
                warn!(
                    reason = %rejection,
                    detail = ?rejection,
                    statement = %crate::model::truncate_chars(&proposal.statement, 40),
                    "generated problem rejected"
                );
                None
            }
        }
    }
}

/// `gen_` followed by 12 hex digits.
pub fn generated_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("gen_{}", &hex[..12])
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::model::TestCase;
    use crate::results::{CaseOutcome, CaseStatus, ExecutionReport};

    /// Executor that replays a scripted report.
    struct Scripted {
        report: Mutex<Option<anyhow::Result<ExecutionReport>>>,
    }

    impl Scripted {
        fn new(report: anyhow::Result<ExecutionReport>) -> Arc<Self> {
            Arc::new(Self {
                report: Mutex::new(Some(report)),
            })
        }
    }

    #[async_trait]
    impl CodeExecutor for Scripted {
        async fn execute(&self, _request: &ExecutionRequest) -> anyhow::Result<ExecutionReport> {
            self.report
                .lock()
                .unwrap()
                .take()
                .unwrap_or_else(|| Err(anyhow::anyhow!("called twice")))
        }
    }

    fn proposal() -> MiniProblem {
        MiniProblem {
            statement: "Print the factorial of n read from stdin.".into(),
            concept_tags: vec!["Recursion".into()],
            difficulty: "easy".into(),
            reference_solution: "import math\nprint(math.factorial(int(input())))".into(),
            test_cases: vec![
                TestCase::visible("3", "6"),
                TestCase::hidden("5", "120"),
                TestCase::hidden("0", "1"),
            ],
        }
    }

    fn report(statuses: &[CaseStatus], duration_ms: u64) -> ExecutionReport {
        let outcomes = statuses
            .iter()
            .enumerate()
            .map(|(index, status)| CaseOutcome {
                index,
                hidden: index > 0,
                status: *status,
                stdout: String::new(),
                stderr: String::new(),
                duration_ms: 1,
            })
            .collect();
        ExecutionReport::completed(outcomes, duration_ms)
    }

    fn validator(executor: Arc<dyn CodeExecutor>) -> ProblemValidator {
        ProblemValidator::new(executor, ValidationConfig::default(), 0.3)
    }

    use CaseStatus::*;

    #[tokio::test]
    async fn valid_proposal_becomes_generated_problem() {
        let v = validator(Scripted::new(Ok(report(&[Passed, Passed, Passed], 120))));
        let problem = v.validate(&proposal()).await.unwrap();
        assert!(problem.id.starts_with("gen_"));
        assert_eq!(problem.id.len(), 16);
        assert_eq!(problem.primary_concept, "recursion");
        assert_eq!(problem.provenance, Provenance::Generated);
        assert_eq!(problem.difficulty, Difficulty::Easy);
    }

    #[tokio::test]
    async fn structural_rejections() {
        let v = validator(Scripted::new(Ok(report(&[Passed], 1))));

        let mut p = proposal();
        p.statement = "short".into();
        assert_eq!(v.validate(&p).await.unwrap_err(), Rejection::EmptyStatement);

        let mut p = proposal();
        p.concept_tags.clear();
        assert_eq!(
            v.validate(&p).await.unwrap_err(),
            Rejection::MissingField("concept_tags")
        );

        let mut p = proposal();
        p.difficulty = "impossible".into();
        assert!(matches!(
            v.validate(&p).await.unwrap_err(),
            Rejection::InvalidDifficulty(_)
        ));

        let mut p = proposal();
        p.test_cases = vec![TestCase::visible("1", "1"), TestCase::visible("2", "2")];
        assert!(matches!(
            v.validate(&p).await.unwrap_err(),
            Rejection::InsufficientHidden { .. }
        ));

        let mut p = proposal();
        p.test_cases.clear();
        assert_eq!(v.validate(&p).await.unwrap_err(), Rejection::InvalidTestCases);
    }

    #[tokio::test]
    async fn reference_must_pass_everything() {
        let v = validator(Scripted::new(Ok(report(&[Passed, WrongAnswer, Passed], 10))));
        assert!(matches!(
            v.validate(&proposal()).await.unwrap_err(),
            Rejection::ReferenceFails { .. }
        ));

        let v = validator(Scripted::new(Ok(report(&[Passed, Crashed, Passed], 10))));
        assert_eq!(
            v.validate(&proposal()).await.unwrap_err(),
            Rejection::ReferenceRuntimeError
        );

        let v = validator(Scripted::new(Ok(report(&[Passed, Timeout, Passed], 10))));
        assert_eq!(
            v.validate(&proposal()).await.unwrap_err(),
            Rejection::ReferenceTimeout
        );

        let v = validator(Scripted::new(Ok(ExecutionReport::syntax_error("bad"))));
        assert_eq!(
            v.validate(&proposal()).await.unwrap_err(),
            Rejection::ReferenceSyntaxError
        );
    }

    #[tokio::test]
    async fn slow_reference_is_rejected_for_its_difficulty() {
        let v = validator(Scripted::new(Ok(report(&[Passed, Passed, Passed], 2_500))));
        assert_eq!(
            v.validate(&proposal()).await.unwrap_err(),
            Rejection::TooSlow {
                elapsed_ms: 2_500,
                limit_ms: 2_000
            }
        );

        let mut p = proposal();
        p.difficulty = "medium".into();
        let v = validator(Scripted::new(Ok(report(&[Passed, Passed, Passed], 2_500))));
        assert!(v.validate(&p).await.is_ok());
    }

    #[tokio::test]
    async fn executor_fault_rejects_and_accept_swallows() {
        let v = validator(Scripted::new(Err(anyhow::anyhow!("sandbox down"))));
        assert!(v.accept(&proposal()).await.is_none());
    }
}
