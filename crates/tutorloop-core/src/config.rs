//! Immutable pipeline configuration.
//!
//! A [`PipelineConfig`] is built once (usually from the `[pipeline]` table of
//! `tutorloop.toml`) and handed to each component at construction. Every
//! field has a serde default so partial TOML tables work.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::model::{Difficulty, ErrorClass};

/// Thresholds, weights and limits for one pipeline instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub sandbox: SandboxLimits,
    pub rate_guard: RateGuardConfig,
    pub hardcoding: HardcodingConfig,
    pub capability: CapabilityConfig,
    pub escalation: EscalationConfig,
    pub selection: SelectionConfig,
    pub validation: ValidationConfig,
    pub concurrency: ConcurrencyConfig,
    /// Minimum hidden / total case ratio enforced when problems are created.
    pub min_hidden_ratio: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sandbox: SandboxLimits::default(),
            rate_guard: RateGuardConfig::default(),
            hardcoding: HardcodingConfig::default(),
            capability: CapabilityConfig::default(),
            escalation: EscalationConfig::default(),
            selection: SelectionConfig::default(),
            validation: ValidationConfig::default(),
            concurrency: ConcurrencyConfig::default(),
            min_hidden_ratio: 0.30,
        }
    }
}

impl PipelineConfig {
    /// Reject configurations that would break score or routing invariants.
    pub fn validate(&self) -> Result<()> {
        let unit = 0.0..=1.0;
        if !unit.contains(&self.min_hidden_ratio) {
            bail!("min_hidden_ratio must be within [0, 1]");
        }
        if !unit.contains(&self.capability.initial_score) {
            bail!("capability.initial_score must be within [0, 1]");
        }
        if !unit.contains(&self.capability.default_weight) {
            bail!("capability.default_weight must be within [0, 1]");
        }
        if let Some(w) = self
            .capability
            .weights
            .iter()
            .find(|w| !unit.contains(&w.weight))
        {
            bail!(
                "weight for ({}, {}) must be within [0, 1]",
                w.error,
                w.concept
            );
        }
        let z = &self.selection.zone_thresholds;
        if !(z[0] <= z[1] && z[1] <= z[2]) {
            bail!("selection.zone_thresholds must be ascending");
        }
        if self.selection.gaussian_sigma <= 0.0 {
            bail!("selection.gaussian_sigma must be positive");
        }
        if self.concurrency.max_concurrent_sandboxes == 0 {
            bail!("concurrency.max_concurrent_sandboxes must be at least 1");
        }
        if self.rate_guard.submit_max == 0 {
            bail!("rate_guard.submit_max must be at least 1");
        }
        if self.escalation.streak == 0 {
            bail!("escalation.streak must be at least 1");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Sandbox
// ---------------------------------------------------------------------------

/// Resource bounds for one sandboxed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxLimits {
    /// Interpreter used for syntax checks and execution.
    pub python: String,
    pub case_timeout_ms: u64,
    /// Outer wall-clock cap for the whole suite.
    pub suite_timeout_ms: u64,
    pub memory_limit_mb: u64,
    /// Largest file the program may write inside its scratch area.
    pub file_size_limit_kb: u64,
    pub max_stdout_bytes: usize,
    pub max_stderr_chars: usize,
    /// Try to drop network access with a fresh user and network namespace.
    /// Silently skipped where the kernel refuses unprivileged namespaces.
    pub isolate_network: bool,
    /// Try to mount `/` read-only with private temp directories so the
    /// program can only write inside its scratch area. Skipped on the same
    /// kernels as `isolate_network`.
    pub isolate_filesystem: bool,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            python: "python3".to_string(),
            case_timeout_ms: 5_000,
            suite_timeout_ms: 30_000,
            memory_limit_mb: 256,
            file_size_limit_kb: 1_024,
            max_stdout_bytes: 64 * 1024,
            max_stderr_chars: 500,
            isolate_network: true,
            isolate_filesystem: true,
        }
    }
}

impl SandboxLimits {
    pub fn case_timeout(&self) -> Duration {
        Duration::from_millis(self.case_timeout_ms)
    }

    pub fn suite_timeout(&self) -> Duration {
        Duration::from_millis(self.suite_timeout_ms)
    }

    pub fn memory_limit_bytes(&self) -> u64 {
        self.memory_limit_mb * 1024 * 1024
    }
}

// ---------------------------------------------------------------------------
// Anti-gaming
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateGuardConfig {
    /// Trailing window inspected for repeated submissions.
    pub window_secs: u64,
    /// Submission count (incoming one included) that arms the guard.
    pub submit_max: usize,
    /// Throttle when distinct code variants are at most this many.
    pub distinct_max: usize,
    pub cooldown_secs: u64,
}

impl Default for RateGuardConfig {
    fn default() -> Self {
        Self {
            window_secs: 180,
            submit_max: 5,
            distinct_max: 1,
            cooldown_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HardcodingConfig {
    /// Visible rate treated as "effectively perfect".
    pub visible_full: f64,
    pub hidden_threshold: f64,
    pub gap: f64,
    /// Ceiling applied to the submission score of a flagged submission.
    pub score_cap: f64,
}

impl Default for HardcodingConfig {
    fn default() -> Self {
        Self {
            visible_full: 1.0,
            hidden_threshold: 0.50,
            gap: 0.40,
            score_cap: 0.30,
        }
    }
}

// ---------------------------------------------------------------------------
// Capability
// ---------------------------------------------------------------------------

/// A diagnostic (error class, concept) pair with its own EMA weight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConceptWeight {
    pub error: ErrorClass,
    pub concept: String,
    pub weight: f64,
}

impl ConceptWeight {
    fn new(error: ErrorClass, concept: &str, weight: f64) -> Self {
        Self {
            error,
            concept: concept.to_string(),
            weight,
        }
    }
}

/// Submission score for each of the six outcome levels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutcomeScores {
    pub full_pass: f64,
    pub partial_high: f64,
    pub partial_low: f64,
    pub zero_pass: f64,
    pub syntax_error: f64,
    pub timeout_or_crash: f64,
}

impl Default for OutcomeScores {
    fn default() -> Self {
        Self {
            full_pass: 1.0,
            partial_high: 0.6,
            partial_low: 0.4,
            zero_pass: 0.3,
            syntax_error: 0.2,
            timeout_or_crash: 0.1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapabilityConfig {
    /// Seed for a (student, concept) pair seen for the first time.
    pub initial_score: f64,
    /// Weight for pairs absent from `weights`.
    pub default_weight: f64,
    /// Multiplier applied to the weight of secondary concepts.
    pub secondary_factor: f64,
    /// Pass rate at or above which a partial pass counts as "high".
    pub partial_high_threshold: f64,
    pub scores: OutcomeScores,
    /// Ordered lookup table; the first matching row wins.
    pub weights: Vec<ConceptWeight>,
}

impl Default for CapabilityConfig {
    fn default() -> Self {
        use ErrorClass::*;
        Self {
            initial_score: 0.5,
            default_weight: 0.15,
            secondary_factor: 0.5,
            partial_high_threshold: 0.5,
            scores: OutcomeScores::default(),
            weights: vec![
                ConceptWeight::new(OffByOne, "loops", 0.20),
                ConceptWeight::new(OffByOne, "arrays", 0.05),
                ConceptWeight::new(MissingBaseCase, "recursion", 0.20),
                ConceptWeight::new(MissingBaseCase, "functions", 0.05),
                ConceptWeight::new(WrongDataStructure, "dictionaries", 0.20),
                ConceptWeight::new(WrongDataStructure, "arrays", 0.08),
                ConceptWeight::new(BruteForce, "sorting", 0.15),
                ConceptWeight::new(BruteForce, "loops", 0.10),
                ConceptWeight::new(GeneralizationFailure, "loops", 0.15),
                ConceptWeight::new(GeneralizationFailure, "arrays", 0.10),
                ConceptWeight::new(HardcodedValues, "loops", 0.10),
                ConceptWeight::new(HardcodedValues, "arrays", 0.10),
                ConceptWeight::new(ApproachMismatch, "sorting", 0.15),
            ],
        }
    }
}

// ---------------------------------------------------------------------------
// Escalation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationConfig {
    /// Consecutive failures on a concept that trigger escalation.
    pub streak: usize,
    /// Capability below which escalation triggers.
    pub low_capability: f64,
    /// Pass rate below which a compiled submission may be a conceptual gap.
    pub conceptual_gap_pass_rate: f64,
    /// Error classes considered mechanical rather than conceptual.
    pub surface_errors: Vec<ErrorClass>,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            streak: 3,
            low_capability: 0.40,
            conceptual_gap_pass_rate: 0.5,
            surface_errors: vec![ErrorClass::SyntaxError, ErrorClass::OffByOne],
        }
    }
}

// ---------------------------------------------------------------------------
// Selection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectionStrategy {
    #[default]
    Zone,
    Gaussian,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    pub strategy: SelectionStrategy,
    /// Upper bounds (exclusive) of zones 0, 1 and 2.
    pub zone_thresholds: [f64; 3],
    /// Target success rate of the Gaussian utility.
    pub gaussian_mu: f64,
    /// Tolerance band of the Gaussian utility.
    pub gaussian_sigma: f64,
    /// Concept → prerequisite served in the remedial band.
    pub prerequisites: BTreeMap<String, String>,
    /// Prerequisite of concepts missing from `prerequisites`.
    pub root_concept: String,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        let prerequisites = [
            ("variables", "variables"),
            ("loops", "variables"),
            ("functions", "variables"),
            ("arrays", "loops"),
            ("strings", "loops"),
            ("recursion", "functions"),
            ("dictionaries", "arrays"),
            ("sorting", "arrays"),
            ("graphs", "arrays"),
            ("dynamic_programming", "recursion"),
            ("trees", "recursion"),
        ]
        .into_iter()
        .map(|(c, p)| (c.to_string(), p.to_string()))
        .collect();

        Self {
            strategy: SelectionStrategy::Zone,
            zone_thresholds: [0.40, 0.55, 0.75],
            gaussian_mu: 0.5,
            gaussian_sigma: 0.2,
            prerequisites,
            root_concept: "variables".to_string(),
        }
    }
}

impl SelectionConfig {
    pub fn prerequisite_of<'a>(&'a self, concept: &str) -> &'a str {
        self.prerequisites
            .get(concept)
            .map(String::as_str)
            .unwrap_or(&self.root_concept)
    }
}

// ---------------------------------------------------------------------------
// Generated-problem validation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    pub min_statement_chars: usize,
    pub max_reference_ms_easy: u64,
    pub max_reference_ms_medium: u64,
    pub max_reference_ms_hard: u64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            min_statement_chars: 10,
            max_reference_ms_easy: 2_000,
            max_reference_ms_medium: 4_000,
            max_reference_ms_hard: 8_000,
        }
    }
}

impl ValidationConfig {
    pub fn max_reference_ms(&self, difficulty: Difficulty) -> u64 {
        match difficulty {
            Difficulty::Easy => self.max_reference_ms_easy,
            Difficulty::Medium => self.max_reference_ms_medium,
            Difficulty::Hard => self.max_reference_ms_hard,
        }
    }
}

// ---------------------------------------------------------------------------
// Concurrency
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    /// Size of the sandbox slot pool.
    pub max_concurrent_sandboxes: usize,
    /// How long a submission queues for a slot before being rejected.
    pub slot_wait_ms: u64,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sandboxes: 4,
            slot_wait_ms: 10_000,
        }
    }
}

impl ConcurrencyConfig {
    pub fn slot_wait(&self) -> Duration {
        Duration::from_millis(self.slot_wait_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = PipelineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.capability.default_weight, 0.15);
        assert_eq!(config.rate_guard.submit_max, 5);
        assert_eq!(config.selection.prerequisite_of("recursion"), "functions");
        assert_eq!(config.selection.prerequisite_of("quantum"), "variables");
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let toml_str = r#"
min_hidden_ratio = 0.4

[selection]
strategy = "gaussian"
gaussian_sigma = 0.1

[sandbox]
case_timeout_ms = 2000
"#;
        let config: PipelineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.min_hidden_ratio, 0.4);
        assert_eq!(config.selection.strategy, SelectionStrategy::Gaussian);
        assert_eq!(config.selection.gaussian_mu, 0.5);
        assert_eq!(config.sandbox.case_timeout(), Duration::from_secs(2));
        assert_eq!(config.sandbox.memory_limit_mb, 256);
        assert_eq!(config.capability.weights.len(), 13);
    }

    #[test]
    fn weight_table_parses_from_toml() {
        let toml_str = r#"
[[capability.weights]]
error = "brute_force_detected"
concept = "sorting"
weight = 0.3
"#;
        let config: PipelineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.capability.weights.len(), 1);
        assert_eq!(config.capability.weights[0].error, ErrorClass::BruteForce);
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut config = PipelineConfig::default();
        config.selection.zone_thresholds = [0.8, 0.5, 0.9];
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.capability.default_weight = 1.5;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.concurrency.max_concurrent_sandboxes = 0;
        assert!(config.validate().is_err());
    }
}
