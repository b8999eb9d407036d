//! Escalation rule engine.
//!
//! Rules are an ordered list of `(reason, predicate)` pairs evaluated top to
//! bottom; the first predicate that holds decides, and nothing after it is
//! looked at.

use crate::config::EscalationConfig;
use crate::model::{ErrorClass, EscalationReason};

/// Facts about the current submission the rules look at.
#[derive(Debug, Clone)]
pub struct EscalationContext<'a> {
    /// The student asked for a deep explanation.
    pub requested: bool,
    /// Pass rates on the primary concept, newest first, current one included.
    pub recent_pass_rates: &'a [f64],
    /// Primary-concept capability after this submission's update.
    pub score_after: f64,
    pub compiled: bool,
    pub pass_rate: f64,
    pub timed_out: bool,
    pub error_class: ErrorClass,
}

type Predicate = fn(&EscalationContext<'_>, &EscalationConfig) -> bool;

const RULES: [(EscalationReason, Predicate); 4] = [
    (EscalationReason::StudentRequest, |ctx, _| ctx.requested),
    (EscalationReason::Streak, |ctx, cfg| {
        failure_streak(ctx.recent_pass_rates.iter().copied()) >= cfg.streak
    }),
    (EscalationReason::LowCapability, |ctx, cfg| {
        ctx.score_after < cfg.low_capability
    }),
    (EscalationReason::ConceptualGap, |ctx, cfg| {
        ctx.compiled
            && ctx.pass_rate < cfg.conceptual_gap_pass_rate
            && !ctx.timed_out
            && !cfg.surface_errors.contains(&ctx.error_class)
    }),
];

/// Number of leading failures (pass rate below 1.0) in a newest-first
/// sequence; the first full pass ends the count.
pub fn failure_streak(pass_rates: impl IntoIterator<Item = f64>) -> usize {
    pass_rates.into_iter().take_while(|rate| *rate < 1.0).count()
}

#[derive(Debug, Clone)]
pub struct EscalationRules {
    config: EscalationConfig,
}

impl EscalationRules {
    pub fn new(config: EscalationConfig) -> Self {
        Self { config }
    }

    /// How many recent submissions the streak rule needs to see.
    pub fn history_needed(&self) -> usize {
        self.config.streak
    }

    pub fn evaluate(&self, ctx: &EscalationContext<'_>) -> Option<EscalationReason> {
        RULES
            .iter()
            .find(|(_, holds)| holds(ctx, &self.config))
            .map(|(reason, _)| *reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> EscalationRules {
        EscalationRules::new(EscalationConfig::default())
    }

    fn quiet(rates: &[f64]) -> EscalationContext<'_> {
        EscalationContext {
            requested: false,
            recent_pass_rates: rates,
            score_after: 0.6,
            compiled: true,
            pass_rate: rates.first().copied().unwrap_or(1.0),
            timed_out: false,
            error_class: ErrorClass::None,
        }
    }

    #[test]
    fn streak_counts_until_first_pass() {
        assert_eq!(failure_streak([0.5, 0.0, 0.9, 1.0, 0.0]), 3);
        assert_eq!(failure_streak([1.0, 0.0, 0.0]), 0);
        assert_eq!(failure_streak(std::iter::empty()), 0);
    }

    #[test]
    fn nothing_fires_for_a_good_submission() {
        let rates = [1.0];
        assert_eq!(rules().evaluate(&quiet(&rates)), None);
    }

    #[test]
    fn request_wins_over_everything() {
        let rates = [0.0, 0.0, 0.0];
        let ctx = EscalationContext {
            requested: true,
            score_after: 0.1,
            ..quiet(&rates)
        };
        assert_eq!(rules().evaluate(&ctx), Some(EscalationReason::StudentRequest));
    }

    #[test]
    fn streak_beats_low_capability() {
        let rates = [0.5, 0.5, 0.5];
        let ctx = EscalationContext {
            score_after: 0.2,
            ..quiet(&rates)
        };
        assert_eq!(rules().evaluate(&ctx), Some(EscalationReason::Streak));
    }

    #[test]
    fn low_capability_after_update() {
        let rates = [0.75, 1.0];
        let ctx = EscalationContext {
            score_after: 0.39,
            ..quiet(&rates)
        };
        assert_eq!(rules().evaluate(&ctx), Some(EscalationReason::LowCapability));
    }

    #[test]
    fn conceptual_gap_skips_surface_errors_and_timeouts() {
        let rates = [0.25];
        let gap = EscalationContext {
            error_class: ErrorClass::WrongDataStructure,
            ..quiet(&rates)
        };
        assert_eq!(rules().evaluate(&gap), Some(EscalationReason::ConceptualGap));

        let surface = EscalationContext {
            error_class: ErrorClass::OffByOne,
            ..quiet(&rates)
        };
        assert_eq!(rules().evaluate(&surface), None);

        let timed_out = EscalationContext {
            timed_out: true,
            ..quiet(&rates)
        };
        assert_eq!(rules().evaluate(&timed_out), None);

        let syntax = EscalationContext {
            compiled: false,
            pass_rate: 0.0,
            error_class: ErrorClass::SyntaxError,
            ..quiet(&rates)
        };
        assert_eq!(rules().evaluate(&syntax), None);
    }
}
