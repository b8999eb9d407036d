//! Error types for the evaluation pipeline.

use thiserror::Error;

/// Hard failures of a pipeline run.
///
/// Everything that can go wrong once execution has started (compile
/// failures, crashes, timeouts, collaborator faults, bank exhaustion) is
/// reported as structured output instead.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("student '{0}' not found")]
    StudentNotFound(String),

    #[error("problem '{0}' not found")]
    ProblemNotFound(String),

    /// All sandbox slots stayed busy for the configured wait.
    #[error("all {slots} sandbox slots busy, try again later")]
    Busy { slots: usize },

    #[error("repository error: {0:#}")]
    Repository(#[from] anyhow::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Whether the caller sent a bad reference rather than hitting a fault.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            PipelineError::StudentNotFound(_) | PipelineError::ProblemNotFound(_)
        )
    }
}

/// Violations of the creation-time problem invariants.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProblemError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("problem has no test cases")]
    NoTestCases,

    #[error("hidden case ratio {ratio:.2} is below the required {required:.2}")]
    InsufficientHidden { ratio: f64, required: f64 },

    #[error("difficulty score {0} outside [0, 1]")]
    DifficultyScoreOutOfRange(f64),
}

/// Question selection ran out of candidates.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectionError {
    #[error("no unseen problems available for concept '{concept}'")]
    NoProblemsAvailable { concept: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_covers_bad_references_only() {
        assert!(PipelineError::StudentNotFound("s1".into()).is_not_found());
        assert!(PipelineError::ProblemNotFound("p1".into()).is_not_found());
        assert!(!PipelineError::Busy { slots: 2 }.is_not_found());
        assert!(!PipelineError::Internal("boom".into()).is_not_found());
    }
}
