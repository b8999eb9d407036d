//! Next-problem selection.
//!
//! Two strategies share one seen-set rule: a problem the student has
//! submitted to, or has already been handed as their next problem, is never
//! served again.

use std::cmp::Ordering;
use std::collections::HashSet;

use tracing::{info, warn};

use crate::config::{SelectionConfig, SelectionStrategy};
use crate::error::SelectionError;
use crate::model::{Difficulty, DifficultySignal, Problem, Submission};

pub const MIN_BAND: u8 = 0;
pub const MAX_BAND: u8 = 3;

/// Problems a student must not be served again.
#[derive(Debug, Clone, Default)]
pub struct SeenProblems(HashSet<String>);

impl SeenProblems {
    /// Derive the seen set from a student's submission history.
    pub fn from_history<'a>(history: impl IntoIterator<Item = &'a Submission>) -> Self {
        let mut seen = HashSet::new();
        for submission in history {
            seen.insert(submission.problem_id.clone());
            if let Some(next) = &submission.next_problem_id {
                seen.insert(next.clone());
            }
        }
        Self(seen)
    }

    pub fn insert(&mut self, problem_id: impl Into<String>) {
        self.0.insert(problem_id.into());
    }

    pub fn contains(&self, problem_id: &str) -> bool {
        self.0.contains(problem_id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A chosen problem and how it was reached.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub problem: Problem,
    /// Concept actually searched (the prerequisite in band 0).
    pub concept: String,
    /// Band the problem came from; `None` for the Gaussian strategy.
    pub band: Option<u8>,
    pub fallback_used: bool,
}

#[derive(Debug, Clone)]
pub struct QuestionSelector {
    config: SelectionConfig,
}

impl QuestionSelector {
    pub fn new(config: SelectionConfig) -> Self {
        Self { config }
    }

    pub fn strategy(&self) -> SelectionStrategy {
        self.config.strategy
    }

    /// Zone 0 (too difficult) to 3 (approaching mastery).
    pub fn zone(&self, score: f64) -> u8 {
        let [too_difficult, easy_max, medium_max] = self.config.zone_thresholds;
        if score < too_difficult {
            0
        } else if score < easy_max {
            1
        } else if score < medium_max {
            2
        } else {
            3
        }
    }

    /// Zone shifted by the difficulty signal, clamped to the band range.
    pub fn target_band(&self, score: f64, signal: DifficultySignal) -> u8 {
        let band = i32::from(self.zone(score)) + signal.offset();
        band.clamp(i32::from(MIN_BAND), i32::from(MAX_BAND)) as u8
    }

    /// `exp(-(d - mu)^2 / (2 sigma^2))`
    pub fn gaussian_utility(&self, difficulty_score: f64) -> f64 {
        let mu = self.config.gaussian_mu;
        let sigma = self.config.gaussian_sigma;
        (-(difficulty_score - mu).powi(2) / (2.0 * sigma * sigma)).exp()
    }

    /// Pick the next problem for `concept` from `bank`, in bank order.
    pub fn select(
        &self,
        bank: &[Problem],
        concept: &str,
        score: f64,
        signal: DifficultySignal,
        seen: &SeenProblems,
    ) -> Result<Selection, SelectionError> {
        let selection = match self.config.strategy {
            SelectionStrategy::Zone => self.select_zone(bank, concept, score, signal, seen),
            SelectionStrategy::Gaussian => self.select_gaussian(bank, concept, seen),
        };

        match &selection {
            Some(s) => info!(
                problem_id = %s.problem.id,
                concept = %s.concept,
                difficulty = %s.problem.difficulty,
                band = ?s.band,
                fallback = s.fallback_used,
                "problem selected"
            ),
            None => warn!(concept, score, "no unseen problem available"),
        }
        selection.ok_or_else(|| SelectionError::NoProblemsAvailable {
            concept: concept.to_string(),
        })
    }

    fn select_zone(
        &self,
        bank: &[Problem],
        concept: &str,
        score: f64,
        signal: DifficultySignal,
        seen: &SeenProblems,
    ) -> Option<Selection> {
        let target = self.target_band(score, signal);
        (MIN_BAND..=target).rev().find_map(|band| {
            let (search_concept, difficulty) = match band {
                0 => (self.config.prerequisite_of(concept), Difficulty::Easy),
                1 => (concept, Difficulty::Easy),
                2 => (concept, Difficulty::Medium),
                _ => (concept, Difficulty::Hard),
            };
            let problem = band_candidate(bank, search_concept, difficulty, seen)?;
            Some(Selection {
                problem: problem.clone(),
                concept: search_concept.to_string(),
                band: Some(band),
                fallback_used: band != target,
            })
        })
    }

    fn select_gaussian(
        &self,
        bank: &[Problem],
        concept: &str,
        seen: &SeenProblems,
    ) -> Option<Selection> {
        let mu = self.config.gaussian_mu;
        bank.iter()
            .enumerate()
            .filter(|(_, p)| p.has_concept(concept) && !seen.contains(&p.id))
            .map(|(index, p)| (index, p, self.gaussian_utility(p.difficulty_score)))
            .min_by(|(ia, a, ua), (ib, b, ub)| {
                ub.total_cmp(ua)
                    .then_with(|| {
                        (a.difficulty_score - mu)
                            .abs()
                            .total_cmp(&(b.difficulty_score - mu).abs())
                    })
                    .then(ia.cmp(ib))
            })
            .map(|(_, problem, _)| Selection {
                problem: problem.clone(),
                concept: concept.to_string(),
                band: None,
                fallback_used: false,
            })
    }
}

/// Unseen problem at `difficulty`: primary-concept matches first, then tag
/// matches, each ordered by difficulty score and then bank order.
fn band_candidate<'a>(
    bank: &'a [Problem],
    concept: &str,
    difficulty: Difficulty,
    seen: &SeenProblems,
) -> Option<&'a Problem> {
    let by_score = |a: &&Problem, b: &&Problem| -> Ordering {
        a.difficulty_score.total_cmp(&b.difficulty_score)
    };
    let unseen = || {
        bank.iter()
            .filter(move |p| p.difficulty == difficulty && !seen.contains(&p.id))
    };

    let mut primary: Vec<&Problem> = unseen().filter(|p| p.primary_concept == concept).collect();
    primary.sort_by(by_score);
    if let Some(first) = primary.first() {
        return Some(first);
    }

    let mut tagged: Vec<&Problem> = unseen()
        .filter(|p| p.concept_tags.iter().any(|t| t == concept))
        .collect();
    tagged.sort_by(by_score);
    tagged.first().copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::model::{NewProblem, Provenance, TestCase};

    fn problem(
        id: &str,
        primary: &str,
        tags: &[&str],
        difficulty: Difficulty,
        score: f64,
    ) -> Problem {
        Problem::create(
            NewProblem {
                id: id.into(),
                title: id.into(),
                statement: format!("Solve {id} using stdin and stdout."),
                concept_tags: tags.iter().map(|t| t.to_string()).collect(),
                primary_concept: primary.into(),
                difficulty,
                difficulty_score: Some(score),
                test_cases: vec![TestCase::visible("1", "1"), TestCase::hidden("2", "2")],
                expected_complexity: None,
                provenance: Provenance::Curated,
            },
            0.3,
        )
        .unwrap()
    }

    fn bank() -> Vec<Problem> {
        vec![
            problem("var-1", "variables", &[], Difficulty::Easy, 0.1),
            problem("loops-e2", "loops", &[], Difficulty::Easy, 0.30),
            problem("loops-e1", "loops", &[], Difficulty::Easy, 0.20),
            problem("loops-m1", "loops", &[], Difficulty::Medium, 0.55),
            problem("arrays-m1", "arrays", &["loops"], Difficulty::Medium, 0.50),
            problem("loops-h1", "loops", &[], Difficulty::Hard, 0.85),
        ]
    }

    fn selector(strategy: SelectionStrategy) -> QuestionSelector {
        let mut config = PipelineConfig::default().selection;
        config.strategy = strategy;
        QuestionSelector::new(config)
    }

    #[test]
    fn zones_and_bands() {
        let s = selector(SelectionStrategy::Zone);
        assert_eq!(s.zone(0.39), 0);
        assert_eq!(s.zone(0.40), 1);
        assert_eq!(s.zone(0.575), 2);
        assert_eq!(s.zone(0.75), 3);
        assert_eq!(s.target_band(0.1, DifficultySignal::Easier), 0);
        assert_eq!(s.target_band(0.9, DifficultySignal::Harder), 3);
        assert_eq!(s.target_band(0.5, DifficultySignal::Harder), 2);
    }

    #[test]
    fn zone_two_serves_medium_primary_first() {
        let s = selector(SelectionStrategy::Zone);
        let pick = s
            .select(&bank(), "loops", 0.575, DifficultySignal::Same, &SeenProblems::default())
            .unwrap();
        assert_eq!(pick.problem.id, "loops-m1");
        assert_eq!(pick.band, Some(2));
        assert!(!pick.fallback_used);
    }

    #[test]
    fn tag_match_after_primary_matches() {
        let s = selector(SelectionStrategy::Zone);
        let mut seen = SeenProblems::default();
        seen.insert("loops-m1");
        let pick = s
            .select(&bank(), "loops", 0.6, DifficultySignal::Same, &seen)
            .unwrap();
        assert_eq!(pick.problem.id, "arrays-m1");
    }

    #[test]
    fn easiest_first_within_band() {
        let s = selector(SelectionStrategy::Zone);
        let pick = s
            .select(&bank(), "loops", 0.45, DifficultySignal::Same, &SeenProblems::default())
            .unwrap();
        assert_eq!(pick.problem.id, "loops-e1");
    }

    #[test]
    fn band_zero_serves_prerequisite() {
        let s = selector(SelectionStrategy::Zone);
        let pick = s
            .select(&bank(), "loops", 0.2, DifficultySignal::Same, &SeenProblems::default())
            .unwrap();
        assert_eq!(pick.problem.id, "var-1");
        assert_eq!(pick.concept, "variables");
        assert_eq!(pick.band, Some(0));
    }

    #[test]
    fn falls_back_to_lower_bands() {
        let s = selector(SelectionStrategy::Zone);
        let mut seen = SeenProblems::default();
        seen.insert("loops-h1");
        let pick = s
            .select(&bank(), "loops", 0.9, DifficultySignal::Same, &seen)
            .unwrap();
        assert_eq!(pick.problem.id, "loops-m1");
        assert_eq!(pick.band, Some(2));
        assert!(pick.fallback_used);
    }

    #[test]
    fn repeated_selection_never_repeats() {
        let s = selector(SelectionStrategy::Zone);
        let bank = bank();
        let mut seen = SeenProblems::default();
        let mut served = Vec::new();
        while let Ok(pick) = s.select(&bank, "loops", 0.9, DifficultySignal::Same, &seen) {
            assert!(!served.contains(&pick.problem.id));
            seen.insert(pick.problem.id.clone());
            served.push(pick.problem.id);
        }
        assert_eq!(served.len(), 6);
        assert_eq!(
            s.select(&bank, "loops", 0.9, DifficultySignal::Same, &seen),
            Err(SelectionError::NoProblemsAvailable {
                concept: "loops".into()
            })
        );
    }

    #[test]
    fn gaussian_prefers_difficulty_near_mu() {
        let s = selector(SelectionStrategy::Gaussian);
        assert!((s.gaussian_utility(0.5) - 1.0).abs() < 1e-12);
        assert!((s.gaussian_utility(0.7) - s.gaussian_utility(0.3)).abs() < 1e-12);

        let pick = s
            .select(&bank(), "loops", 0.1, DifficultySignal::Easier, &SeenProblems::default())
            .unwrap();
        assert_eq!(pick.problem.id, "arrays-m1");
        assert_eq!(pick.band, None);
    }

    #[test]
    fn gaussian_ties_go_to_bank_order() {
        let s = selector(SelectionStrategy::Gaussian);
        let bank = vec![
            problem("b", "loops", &[], Difficulty::Medium, 0.6),
            problem("a", "loops", &[], Difficulty::Medium, 0.4),
        ];
        let pick = s
            .select(&bank, "loops", 0.5, DifficultySignal::Same, &SeenProblems::default())
            .unwrap();
        assert_eq!(pick.problem.id, "b");
    }

    #[test]
    fn seen_set_includes_served_next_problems() {
        let now = chrono::Utc::now();
        let submission = Submission {
            id: "sub".into(),
            student_id: "s".into(),
            problem_id: "p1".into(),
            concept: "loops".into(),
            code: String::new(),
            code_hash: String::new(),
            outcomes: vec![],
            pass_rate: 1.0,
            visible_pass_rate: 1.0,
            hidden_pass_rate: None,
            status: crate::model::SubmissionStatus::Completed,
            error_class: crate::model::ErrorClass::None,
            capability_delta: 0.0,
            escalated: false,
            escalation_reason: None,
            gaming_flagged: false,
            gaming_reason: None,
            next_problem_id: Some("p2".into()),
            submitted_at: now,
        };
        let seen = SeenProblems::from_history([&submission]);
        assert!(seen.contains("p1"));
        assert!(seen.contains("p2"));
        assert_eq!(seen.len(), 2);
    }
}
