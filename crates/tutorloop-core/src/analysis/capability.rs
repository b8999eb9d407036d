//! Exponential-moving-average capability scoring.
//!
//! The engine is pure: it turns an execution report plus the current scores
//! into [`CapabilityUpdate`]s, which the pipeline persists as part of its
//! single commit. The fast-feedback difficulty signal never reaches it.

use crate::config::{CapabilityConfig, OutcomeScores};
use crate::model::{ErrorClass, Problem};
use crate::results::{CapabilityUpdate, ExecutionReport};

/// Six-level summary of how a submission ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionOutcome {
    TimeoutOrCrash,
    SyntaxError,
    FullPass,
    PartialHigh,
    PartialLow,
    ZeroPass,
}

impl SubmissionOutcome {
    /// Levels are checked in order; the first that applies wins.
    pub fn classify(report: &ExecutionReport, partial_high_threshold: f64) -> Self {
        let pass_rate = report.pass_rate();
        if report.timed_out() || report.crashed() {
            SubmissionOutcome::TimeoutOrCrash
        } else if !report.compiled() {
            SubmissionOutcome::SyntaxError
        } else if pass_rate >= 1.0 {
            SubmissionOutcome::FullPass
        } else if pass_rate >= partial_high_threshold {
            SubmissionOutcome::PartialHigh
        } else if pass_rate > 0.0 {
            SubmissionOutcome::PartialLow
        } else {
            SubmissionOutcome::ZeroPass
        }
    }

    pub fn score(self, scores: &OutcomeScores) -> f64 {
        match self {
            SubmissionOutcome::TimeoutOrCrash => scores.timeout_or_crash,
            SubmissionOutcome::SyntaxError => scores.syntax_error,
            SubmissionOutcome::FullPass => scores.full_pass,
            SubmissionOutcome::PartialHigh => scores.partial_high,
            SubmissionOutcome::PartialLow => scores.partial_low,
            SubmissionOutcome::ZeroPass => scores.zero_pass,
        }
    }
}

/// `new = (1 - w) * old + w * score`, with `w` and the result clamped to [0, 1].
pub fn ema_update(old: f64, score: f64, weight: f64) -> f64 {
    let w = weight.clamp(0.0, 1.0);
    ((1.0 - w) * old + w * score).clamp(0.0, 1.0)
}

/// Capability updates for one submission.
#[derive(Debug, Clone, PartialEq)]
pub struct CapabilityPlan {
    pub submission_score: f64,
    pub primary: CapabilityUpdate,
    pub secondary: Vec<CapabilityUpdate>,
}

impl CapabilityPlan {
    pub fn all(&self) -> impl Iterator<Item = &CapabilityUpdate> {
        std::iter::once(&self.primary).chain(self.secondary.iter())
    }
}

#[derive(Debug, Clone)]
pub struct CapabilityEngine {
    config: CapabilityConfig,
}

impl CapabilityEngine {
    pub fn new(config: CapabilityConfig) -> Self {
        Self { config }
    }

    pub fn initial_score(&self) -> f64 {
        self.config.initial_score
    }

    /// First matching `(error, concept)` row, else the default weight.
    pub fn weight_for(&self, error: ErrorClass, concept: &str) -> f64 {
        self.config
            .weights
            .iter()
            .find(|w| w.error == error && w.concept == concept)
            .map(|w| w.weight)
            .unwrap_or(self.config.default_weight)
    }

    /// Scalar score of a run, optionally capped by the hardcoding guard.
    pub fn submission_score(&self, report: &ExecutionReport, cap: Option<f64>) -> f64 {
        let score = SubmissionOutcome::classify(report, self.config.partial_high_threshold)
            .score(&self.config.scores);
        match cap {
            Some(cap) => score.min(cap),
            None => score,
        }
    }

    /// Compute updates for the problem's primary concept and every
    /// secondary tag. `current` yields stored scores; missing pairs start
    /// at the initial score.
    pub fn plan(
        &self,
        problem: &Problem,
        error: ErrorClass,
        submission_score: f64,
        current: impl Fn(&str) -> Option<f64>,
    ) -> CapabilityPlan {
        let update = |concept: &str, weight: f64| {
            let old_score = current(concept).unwrap_or(self.config.initial_score);
            let weight = weight.clamp(0.0, 1.0);
            CapabilityUpdate {
                concept: concept.to_string(),
                old_score,
                new_score: ema_update(old_score, submission_score, weight),
                weight,
            }
        };

        let primary = update(
            &problem.primary_concept,
            self.weight_for(error, &problem.primary_concept),
        );
        let secondary = problem
            .secondary_concepts()
            .map(|c| update(c, self.weight_for(error, c) * self.config.secondary_factor))
            .collect();

        CapabilityPlan {
            submission_score,
            primary,
            secondary,
        }
    }
}
