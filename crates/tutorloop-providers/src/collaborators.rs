//! LLM-backed tutoring collaborators.
//!
//! Both collaborators are infallible from the pipeline's point of view:
//! transport errors, timeouts and unparseable answers degrade to safe
//! defaults and are logged as warnings.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::instrument;

use tutorloop_core::model::{truncate_chars, DifficultySignal, MistakeCategory, TestCase};
use tutorloop_core::results::{DeepExplanation, Feedback};
use tutorloop_core::traits::{
    extract_json_object, DeepExplainer, DeepReply, DeepRequest, FastFeedback, FeedbackRequest,
    GenerateRequest, LlmProvider, MiniProblem,
};

use crate::config::ModelSettings;

const FEEDBACK_SYSTEM_PROMPT: &str = "You are a concise coding tutor giving feedback to a college student. \
Given structured evaluation data about their Python submission, respond with ONLY a JSON object with these exact keys: \
feedback_text (one sentence on what went wrong, one on why, one actionable hint; no solution, no code, under 80 words), \
mistake_category (off_by_one | missing_base_case | wrong_data_structure | brute_force | hardcoded | approach_mismatch | syntax | logic | unknown), \
difficulty_signal (easier | same | harder).";

const DEEP_SYSTEM_PROMPT: &str = "You are an expert programming tutor. A student is stuck. \
Respond with ONLY a JSON object with these exact keys: \
{\"explanation\": \"2-3 sentences on the conceptual misunderstanding\", \
\"step_by_step\": [\"Step 1: ...\", \"Step 2: ...\"], \
\"alternative_approach\": \"one paragraph suggesting a different strategy\", \
\"mini_problem\": {\"statement\": \"a simpler problem on the same concept gap\", \"concept_tags\": [\"concept\"], \
\"difficulty\": \"easy\", \"reference_solution\": \"working Python 3 reading stdin\", \
\"test_cases\": [{\"input\": \"...\", \"output\": \"...\", \"hidden\": false}]}}. \
The reference_solution MUST be correct. Do not give away the solution to the original problem.";

const EMPTY_FEEDBACK_TEXT: &str = "Review your logic carefully.";
const FALLBACK_EXPLANATION: &str =
    "There is a conceptual misunderstanding. Review the core algorithm pattern for this concept.";
const FALLBACK_ALTERNATIVE: &str = "Consider a different algorithmic strategy. \
Start simple and build up complexity once the basic case works.";
const FALLBACK_STEPS: [&str; 3] = [
    "Step 1: Re-read the problem statement.",
    "Step 2: Trace through your code with a small example.",
    "Step 3: Identify where the output diverges from expected.",
];

const MAX_FAILURES: usize = 3;

// ---------------------------------------------------------------------------
// Fast feedback
// ---------------------------------------------------------------------------

/// Short per-submission feedback from a small local model.
pub struct LlmFastFeedback {
    provider: Arc<dyn LlmProvider>,
    settings: ModelSettings,
}

impl LlmFastFeedback {
    pub fn new(provider: Arc<dyn LlmProvider>, settings: ModelSettings) -> Self {
        Self { provider, settings }
    }

    fn prompt(request: &FeedbackRequest) -> String {
        let failures: Vec<_> = request.failures.iter().take(MAX_FAILURES).collect();
        let payload = json!({
            "problem_statement": truncate_chars(&request.statement, 400),
            "student_code": truncate_chars(&request.code, 1500),
            "pass_rate": request.pass_rate,
            "compiled": request.compiled,
            "error_type": request.error_class,
            "test_failures": failures,
            "features": request.profile,
        });
        serde_json::to_string_pretty(&payload).unwrap_or_default()
    }
}

#[async_trait]
impl FastFeedback for LlmFastFeedback {
    #[instrument(skip_all, fields(model = %self.settings.model, pass_rate = request.pass_rate))]
    async fn feedback(&self, request: &FeedbackRequest) -> Feedback {
        let generate = GenerateRequest {
            model: self.settings.model.clone(),
            prompt: Self::prompt(request),
            system_prompt: Some(FEEDBACK_SYSTEM_PROMPT.to_string()),
            max_tokens: self.settings.max_tokens,
            temperature: self.settings.temperature,
            json_format: true,
        };

        let Some(raw) = complete(self.provider.as_ref(), &generate, &self.settings).await else {
            return Feedback::fallback();
        };
        match parse_feedback(&raw) {
            Some(feedback) => feedback,
            None => {
                tracing::warn!(
                    preview = %truncate_chars(&raw, 200),
                    "unparseable feedback, using fallback"
                );
                Feedback::fallback()
            }
        }
    }
}

fn parse_feedback(raw: &str) -> Option<Feedback> {
    let obj = parse_object(raw)?;

    let text = string_field(&obj, "feedback_text");
    let mistake_category = obj
        .get("mistake_category")
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())
        .unwrap_or(MistakeCategory::Unknown);
    let difficulty_signal = obj
        .get("difficulty_signal")
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())
        .unwrap_or(DifficultySignal::Same);

    Some(Feedback {
        text: if text.is_empty() {
            EMPTY_FEEDBACK_TEXT.to_string()
        } else {
            text
        },
        mistake_category,
        difficulty_signal,
        fallback: false,
    })
}

// ---------------------------------------------------------------------------
// Deep explanation
// ---------------------------------------------------------------------------

/// Long-form explanation and practice problem from a larger local model.
pub struct LlmDeepExplainer {
    provider: Arc<dyn LlmProvider>,
    settings: ModelSettings,
}

impl LlmDeepExplainer {
    pub fn new(provider: Arc<dyn LlmProvider>, settings: ModelSettings) -> Self {
        Self { provider, settings }
    }

    fn prompt(request: &DeepRequest) -> String {
        let failures: Vec<_> = request.failures.iter().take(MAX_FAILURES).collect();
        let history: Map<String, Value> = request
            .capability_history
            .iter()
            .map(|(concept, score)| (concept.clone(), json!((score * 1000.0).round() / 1000.0)))
            .collect();
        let payload = json!({
            "concept": request.concept,
            "escalation_reason": request.reason,
            "problem_statement": truncate_chars(&request.statement, 500),
            "student_code": truncate_chars(&request.code, 2000),
            "test_failures": failures,
            "capability_history": history,
            "code_features": request.profile,
        });
        serde_json::to_string_pretty(&payload).unwrap_or_default()
    }
}

#[async_trait]
impl DeepExplainer for LlmDeepExplainer {
    #[instrument(
        skip_all,
        fields(
            model = %self.settings.model,
            concept = %request.concept,
            reason = %request.reason
        )
    )]
    async fn explain(&self, request: &DeepRequest) -> Option<DeepReply> {
        let generate = GenerateRequest {
            model: self.settings.model.clone(),
            prompt: Self::prompt(request),
            system_prompt: Some(DEEP_SYSTEM_PROMPT.to_string()),
            max_tokens: self.settings.max_tokens,
            temperature: self.settings.temperature,
            json_format: true,
        };

        let raw = complete(self.provider.as_ref(), &generate, &self.settings).await?;
        let reply = parse_deep_reply(&raw);
        match &reply {
            Some(reply) => tracing::info!(
                steps = reply.explanation.steps.len(),
                has_mini_problem = reply.mini_problem.is_some(),
                "deep explanation received"
            ),
            None => tracing::warn!(
                preview = %truncate_chars(&raw, 200),
                "unparseable deep explanation, none available"
            ),
        }
        reply
    }
}

fn parse_deep_reply(raw: &str) -> Option<DeepReply> {
    let obj = parse_object(raw)?;

    let mut explanation = string_field(&obj, "explanation");
    if explanation.is_empty() {
        explanation = FALLBACK_EXPLANATION.to_string();
    }

    let mut steps: Vec<String> = obj
        .get("step_by_step")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .map(|v| value_text(v).trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default();
    if steps.is_empty() {
        steps = FALLBACK_STEPS.iter().map(|s| s.to_string()).collect();
    }

    let mut alternative_approach = string_field(&obj, "alternative_approach");
    if alternative_approach.is_empty() {
        alternative_approach = FALLBACK_ALTERNATIVE.to_string();
    }

    let mini_problem = obj.get("mini_problem").and_then(parse_mini_problem);

    Some(DeepReply {
        explanation: DeepExplanation {
            explanation,
            steps,
            alternative_approach,
            practice_problem_id: None,
        },
        mini_problem,
    })
}

/// Sanitize a proposed practice problem. Structural problems drop the
/// proposal; the reference solution is not run here.
fn parse_mini_problem(value: &Value) -> Option<MiniProblem> {
    let obj = value.as_object()?;

    let statement = string_field(obj, "statement");
    let reference_solution = string_field(obj, "reference_solution");
    if statement.is_empty() || reference_solution.is_empty() {
        tracing::warn!("mini problem missing statement or reference solution");
        return None;
    }

    let concept_tags: Vec<String> = obj
        .get("concept_tags")
        .and_then(Value::as_array)
        .map(|tags| {
            tags.iter()
                .map(|t| value_text(t).trim().to_string())
                .filter(|t| !t.is_empty())
                .collect()
        })
        .unwrap_or_default();
    if concept_tags.is_empty() {
        tracing::warn!("mini problem has no concept tags");
        return None;
    }

    let difficulty = match string_field(obj, "difficulty").to_lowercase().as_str() {
        d @ ("easy" | "medium" | "hard") => d.to_string(),
        _ => "easy".to_string(),
    };

    let mut test_cases: Vec<TestCase> = obj
        .get("test_cases")
        .and_then(Value::as_array)
        .map(|cases| {
            cases
                .iter()
                .filter_map(Value::as_object)
                .map(|case| TestCase {
                    input: case.get("input").map(value_text).unwrap_or_default(),
                    output: case.get("output").map(value_text).unwrap_or_default(),
                    hidden: case.get("hidden").and_then(Value::as_bool).unwrap_or(false),
                })
                .collect()
        })
        .unwrap_or_default();
    if test_cases.is_empty() {
        tracing::warn!("mini problem has no test cases");
        return None;
    }
    if !test_cases.iter().any(|c| c.hidden) {
        if let Some(last) = test_cases.last_mut() {
            last.hidden = true;
        }
    }

    Some(MiniProblem {
        statement,
        concept_tags,
        difficulty,
        reference_solution,
        test_cases,
    })
}

// ---------------------------------------------------------------------------
// Shared plumbing
// ---------------------------------------------------------------------------

/// Run one completion under the collaborator's time budget. `None` on any
/// failure, with a warning.
async fn complete(
    provider: &dyn LlmProvider,
    request: &GenerateRequest,
    settings: &ModelSettings,
) -> Option<String> {
    match tokio::time::timeout(settings.timeout(), provider.generate(request)).await {
        Ok(Ok(response)) if !response.content.trim().is_empty() => Some(response.content),
        Ok(Ok(_)) => {
            tracing::warn!(provider = provider.name(), "empty completion, using fallback");
            None
        }
        Ok(Err(e)) => {
            tracing::warn!(
                provider = provider.name(),
                error = %format!("{e:#}"),
                "completion failed, using fallback"
            );
            None
        }
        Err(_) => {
            tracing::warn!(
                provider = provider.name(),
                timeout_ms = settings.timeout_ms,
                "completion timed out, using fallback"
            );
            None
        }
    }
}

fn parse_object(raw: &str) -> Option<Map<String, Value>> {
    let json = extract_json_object(raw)?;
    match serde_json::from_str(&json).ok()? {
        Value::Object(map) => Some(map),
        _ => None,
    }
}

fn string_field(obj: &Map<String, Value>, key: &str) -> String {
    obj.get(key)
        .map(value_text)
        .unwrap_or_default()
        .trim()
        .to_string()
}

/// Text of a JSON scalar; models sometimes send numbers where strings were
/// asked for.
fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use super::*;
    use crate::mock::MockProvider;
    use crate::ollama::OllamaProvider;
    use tutorloop_core::analysis::features::CodeProfile;
    use tutorloop_core::model::{ErrorClass, EscalationReason};
    use tutorloop_core::results::{CaseStatus, VisibleCaseResult};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn failure() -> VisibleCaseResult {
        VisibleCaseResult {
            input: "3".into(),
            expected: "6".into(),
            got: "5".into(),
            passed: false,
            status: CaseStatus::WrongAnswer,
        }
    }

    fn feedback_request() -> FeedbackRequest {
        FeedbackRequest {
            statement: "s".repeat(1000),
            code: "c".repeat(5000),
            pass_rate: 0.5,
            compiled: true,
            error_class: ErrorClass::OffByOne,
            failures: vec![failure(); 5],
            profile: CodeProfile::default(),
        }
    }

    fn deep_request() -> DeepRequest {
        DeepRequest {
            statement: "Sum the numbers from 1 to n.".into(),
            code: "n = int(input())\nprint(sum(range(n)))\n".into(),
            concept: "loops".into(),
            reason: EscalationReason::Streak,
            failures: vec![failure()],
            profile: CodeProfile::default(),
            capability_history: BTreeMap::from([("loops".to_string(), 0.123456)]),
        }
    }

    fn fast(provider: Arc<dyn LlmProvider>) -> LlmFastFeedback {
        LlmFastFeedback::new(provider, ModelSettings::fast_feedback())
    }

    fn deep(provider: Arc<dyn LlmProvider>) -> LlmDeepExplainer {
        LlmDeepExplainer::new(provider, ModelSettings::deep_explanation())
    }

    #[tokio::test]
    async fn feedback_parses_fenced_json() {
        let provider = Arc::new(MockProvider::with_fixed_response(
            "```json\n{\"feedback_text\": \"Your loop stops one short.\", \"mistake_category\": \"off_by_one\", \"difficulty_signal\": \"easier\"}\n```",
        ));
        let feedback = fast(provider.clone()).feedback(&feedback_request()).await;

        assert_eq!(feedback.text, "Your loop stops one short.");
        assert_eq!(feedback.mistake_category, MistakeCategory::OffByOne);
        assert_eq!(feedback.difficulty_signal, DifficultySignal::Easier);
        assert!(!feedback.fallback);

        let sent = provider.last_request().unwrap();
        assert_eq!(sent.model, "qwen2.5-coder:1.5b-instruct");
        assert_eq!(sent.max_tokens, 200);
        assert!(sent.json_format);
        let prompt: Value = serde_json::from_str(&sent.prompt).unwrap();
        assert_eq!(prompt["problem_statement"].as_str().unwrap().len(), 400);
        assert_eq!(prompt["student_code"].as_str().unwrap().len(), 1500);
        assert_eq!(prompt["test_failures"].as_array().unwrap().len(), 3);
        assert_eq!(prompt["error_type"], "off_by_one");
    }

    #[tokio::test]
    async fn feedback_normalizes_unknown_labels_and_empty_text() {
        let provider = Arc::new(MockProvider::with_fixed_response(
            "Sure! {\"feedback_text\": \"  \", \"mistake_category\": \"typo\", \"difficulty_signal\": \"much harder\"}",
        ));
        let feedback = fast(provider).feedback(&feedback_request()).await;

        assert_eq!(feedback.text, "Review your logic carefully.");
        assert_eq!(feedback.mistake_category, MistakeCategory::Unknown);
        assert_eq!(feedback.difficulty_signal, DifficultySignal::Same);
        assert!(!feedback.fallback);
    }

    #[tokio::test]
    async fn feedback_falls_back_on_garbage_failure_and_timeout() {
        let garbage = Arc::new(MockProvider::with_fixed_response("I think the loop is wrong"));
        assert_eq!(fast(garbage).feedback(&feedback_request()).await, Feedback::fallback());

        let down = Arc::new(MockProvider::failing());
        assert_eq!(fast(down).feedback(&feedback_request()).await, Feedback::fallback());

        let slow = Arc::new(
            MockProvider::with_fixed_response("{\"feedback_text\": \"late\"}")
                .with_delay(Duration::from_millis(500)),
        );
        let settings = ModelSettings {
            timeout_ms: 50,
            ..ModelSettings::fast_feedback()
        };
        let feedback = LlmFastFeedback::new(slow, settings)
            .feedback(&feedback_request())
            .await;
        assert!(feedback.fallback);
        assert_eq!(feedback.text, Feedback::DEFAULT_TEXT);
    }

    #[tokio::test]
    async fn feedback_over_ollama() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "message": {"role": "assistant", "content": "{\"feedback_text\": \"Check the range end.\", \"mistake_category\": \"logic\", \"difficulty_signal\": \"same\"}"},
                "model": "qwen2.5-coder:1.5b-instruct"
            })))
            .mount(&server)
            .await;

        let provider = Arc::new(OllamaProvider::new(&server.uri()).unwrap());
        let feedback = fast(provider).feedback(&feedback_request()).await;
        assert_eq!(feedback.text, "Check the range end.");
        assert_eq!(feedback.mistake_category, MistakeCategory::Logic);
    }

    #[tokio::test]
    async fn feedback_over_unavailable_ollama_falls_back() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let provider = Arc::new(OllamaProvider::new(&server.uri()).unwrap());
        assert!(fast(provider).feedback(&feedback_request()).await.fallback);
    }

    #[tokio::test]
    async fn deep_reply_with_mini_problem() {
        let body = json!({
            "explanation": "range(n) stops before n.",
            "step_by_step": ["Step 1: print range(3)", "", "Step 2: compare with 1..3"],
            "alternative_approach": "Use the closed-form n*(n+1)//2.",
            "mini_problem": {
                "statement": "Print the numbers 1 to n inclusive, one per line.",
                "concept_tags": ["loops"],
                "difficulty": "EASY",
                "reference_solution": "n = int(input())\nfor i in range(1, n + 1):\n    print(i)\n",
                "test_cases": [
                    {"input": "2", "output": "1\n2"},
                    {"input": 3, "output": "1\n2\n3"},
                    "not a case"
                ]
            }
        });
        let provider = Arc::new(MockProvider::with_fixed_response(&body.to_string()));
        let reply = deep(provider.clone()).explain(&deep_request()).await.unwrap();

        assert_eq!(reply.explanation.explanation, "range(n) stops before n.");
        assert_eq!(reply.explanation.steps.len(), 2);
        assert!(reply.explanation.practice_problem_id.is_none());

        let mini = reply.mini_problem.unwrap();
        assert_eq!(mini.difficulty, "easy");
        assert_eq!(mini.test_cases.len(), 2);
        assert_eq!(mini.test_cases[1].input, "3");
        assert!(!mini.test_cases[0].hidden);
        assert!(mini.test_cases[1].hidden, "last case promoted to hidden");

        let sent = provider.last_request().unwrap();
        assert_eq!(sent.model, "qwen2.5-coder:7b-instruct");
        assert_eq!(sent.max_tokens, 1500);
        let prompt: Value = serde_json::from_str(&sent.prompt).unwrap();
        assert_eq!(prompt["escalation_reason"], "streak");
        assert_eq!(prompt["capability_history"]["loops"], 0.123);
    }

    #[tokio::test]
    async fn malformed_mini_problem_keeps_explanation() {
        let body = json!({
            "explanation": "",
            "mini_problem": {"statement": "x", "concept_tags": [], "difficulty": "easy",
                             "reference_solution": "print(1)", "test_cases": [{"input": "", "output": "1"}]}
        });
        let provider = Arc::new(MockProvider::with_fixed_response(&body.to_string()));
        let reply = deep(provider).explain(&deep_request()).await.unwrap();

        assert_eq!(reply.explanation.explanation, FALLBACK_EXPLANATION);
        assert_eq!(reply.explanation.steps.len(), 3);
        assert_eq!(reply.explanation.alternative_approach, FALLBACK_ALTERNATIVE);
        assert!(reply.mini_problem.is_none());
    }

    #[tokio::test]
    async fn deep_failure_means_no_explanation() {
        let down = Arc::new(MockProvider::failing());
        assert!(deep(down).explain(&deep_request()).await.is_none());

        let garbage = Arc::new(MockProvider::with_fixed_response("no idea, sorry"));
        assert!(deep(garbage).explain(&deep_request()).await.is_none());
    }
}
