//! Core trait definitions for the pipeline's collaborators.
//!
//! [`CodeExecutor`] is implemented by `tutorloop-runner`; [`LlmProvider`],
//! [`FastFeedback`] and [`DeepExplainer`] by `tutorloop-providers`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::analysis::features::CodeProfile;
use crate::model::{ErrorClass, EscalationReason, TestCase};
use crate::results::{DeepExplanation, ExecutionReport, Feedback, VisibleCaseResult};

// ---------------------------------------------------------------------------
// LLM Provider trait
// ---------------------------------------------------------------------------

/// Trait for LLM backends that complete prompts.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Human-readable provider name (e.g. "ollama").
    fn name(&self) -> &str;

    /// Complete a prompt.
    async fn generate(&self, request: &GenerateRequest) -> anyhow::Result<GenerateResponse>;
}

/// Request to an LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateRequest {
    /// Model identifier (e.g. "qwen2.5-coder:1.5b-instruct").
    pub model: String,
    /// The main prompt.
    pub prompt: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Maximum tokens to generate.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: f64,
    /// Ask the backend to constrain output to a JSON object.
    #[serde(default)]
    pub json_format: bool,
}

/// Response from an LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateResponse {
    /// The raw response content.
    pub content: String,
    /// Model that actually answered.
    pub model: String,
    /// Latency in milliseconds.
    pub latency_ms: u64,
}

// ---------------------------------------------------------------------------
// Code executor trait
// ---------------------------------------------------------------------------

/// Trait for sandboxed execution of submitted programs.
///
/// An `Err` means the executor itself broke (not the program); callers fold
/// it into an [`ExecutionReport::fault`].
#[async_trait]
pub trait CodeExecutor: Send + Sync {
    async fn execute(&self, request: &ExecutionRequest) -> anyhow::Result<ExecutionReport>;
}

/// A program plus the ordered cases to run it against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub code: String,
    pub cases: Vec<TestCase>,
}

// ---------------------------------------------------------------------------
// Tutoring collaborators
// ---------------------------------------------------------------------------

/// Input to the fast-feedback collaborator.
#[derive(Debug, Clone, Serialize)]
pub struct FeedbackRequest {
    pub statement: String,
    pub code: String,
    pub pass_rate: f64,
    pub compiled: bool,
    pub error_class: ErrorClass,
    /// Failing visible cases only.
    pub failures: Vec<VisibleCaseResult>,
    pub profile: CodeProfile,
}

/// Short-form feedback on every evaluated submission.
///
/// Implementations never fail: any fault degrades to [`Feedback::fallback`].
#[async_trait]
pub trait FastFeedback: Send + Sync {
    async fn feedback(&self, request: &FeedbackRequest) -> Feedback;
}

/// Input to the deep-explanation collaborator.
#[derive(Debug, Clone, Serialize)]
pub struct DeepRequest {
    pub statement: String,
    pub code: String,
    pub concept: String,
    pub reason: EscalationReason,
    pub failures: Vec<VisibleCaseResult>,
    pub profile: CodeProfile,
    /// The student's current score on every concept they have attempted.
    pub capability_history: BTreeMap<String, f64>,
}

/// Practice problem proposed alongside a deep explanation.
///
/// Unvalidated: it becomes a bank problem only after passing the
/// [`crate::analysis::validator::ProblemValidator`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MiniProblem {
    pub statement: String,
    pub concept_tags: Vec<String>,
    pub difficulty: String,
    pub reference_solution: String,
    pub test_cases: Vec<TestCase>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeepReply {
    pub explanation: DeepExplanation,
    pub mini_problem: Option<MiniProblem>,
}

/// Long-form explanation on escalation. `None` means no explanation is
/// available; the pipeline carries on without one.
#[async_trait]
pub trait DeepExplainer: Send + Sync {
    async fn explain(&self, request: &DeepRequest) -> Option<DeepReply>;
}

// ---------------------------------------------------------------------------
// JSON extraction
// ---------------------------------------------------------------------------

/// Pull a JSON object out of a model response.
///
/// Handles:
/// - Bare JSON (returned as-is)
/// - ```json fenced blocks (fence lines dropped)
/// - JSON embedded in prose (first `{` through last `}`)
pub fn extract_json_object(response: &str) -> Option<String> {
    let mut text = response.trim().to_string();

    if text.starts_with("```") {
        text = text
            .lines()
            .filter(|line| !line.trim().starts_with("```"))
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string();
    }

    if serde_json::from_str::<serde_json::Value>(&text).is_ok_and(|v| v.is_object()) {
        return Some(text);
    }

    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    let candidate = &text[start..=end];
    serde_json::from_str::<serde_json::Value>(candidate)
        .is_ok_and(|v| v.is_object())
        .then(|| candidate.to_string())
}
