//! Central pipeline orchestrator.
//!
//! Runs one submission through guard, sandbox, feature extraction, fast
//! feedback, capability scoring, escalation and question selection, then
//! persists everything in a single repository commit.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::{Mutex as AsyncMutex, OwnedSemaphorePermit, Semaphore};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::analysis::capability::{CapabilityEngine, CapabilityPlan};
use crate::analysis::escalation::{EscalationContext, EscalationRules};
use crate::analysis::features::{extract_features, CodeProfile};
use crate::analysis::guard::{check_hardcoding, RateDecision, RateGuard};
use crate::analysis::selector::{QuestionSelector, SeenProblems, Selection};
use crate::analysis::validator::ProblemValidator;
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::model::{code_hash, CapabilityScore, EscalationLog, Problem, Student, Submission};
use crate::repository::{Repository, SubmissionCommit};
use crate::results::{
    DeepExplanation, ExecutionReport, Feedback, NextProblem, PipelineOutcome, SubmissionResult,
    VisibleCaseResult,
};
use crate::traits::{
    CodeExecutor, DeepExplainer, DeepRequest, ExecutionRequest, FastFeedback, FeedbackRequest,
};

/// Failing visible cases forwarded to the collaborators.
const MAX_REPORTED_FAILURES: usize = 3;

/// One submission to evaluate.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub student_id: String,
    pub problem_id: String,
    pub code: String,
    /// The student explicitly asked for a deep explanation.
    pub deep_explain: bool,
}

/// External collaborators the pipeline drives.
#[derive(Clone)]
pub struct Collaborators {
    pub repository: Arc<dyn Repository>,
    pub executor: Arc<dyn CodeExecutor>,
    pub feedback: Arc<dyn FastFeedback>,
    pub deep: Arc<dyn DeepExplainer>,
}

/// The evaluation pipeline. Cheap to clone; clones share slots, locks and
/// cooldowns.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<Inner>,
}

struct Inner {
    config: Arc<PipelineConfig>,
    repository: Arc<dyn Repository>,
    executor: Arc<dyn CodeExecutor>,
    feedback: Arc<dyn FastFeedback>,
    deep: Arc<dyn DeepExplainer>,
    guard: RateGuard,
    capability: CapabilityEngine,
    escalation: EscalationRules,
    selector: QuestionSelector,
    validator: ProblemValidator,
    slots: Arc<Semaphore>,
    student_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, collaborators: Collaborators) -> Self {
        let config = Arc::new(config);
        let Collaborators {
            repository,
            executor,
            feedback,
            deep,
        } = collaborators;

        let inner = Inner {
            guard: RateGuard::new(config.rate_guard.clone()),
            capability: CapabilityEngine::new(config.capability.clone()),
            escalation: EscalationRules::new(config.escalation.clone()),
            selector: QuestionSelector::new(config.selection.clone()),
            validator: ProblemValidator::new(
                Arc::clone(&executor),
                config.validation.clone(),
                config.min_hidden_ratio,
            ),
            slots: Arc::new(Semaphore::new(config.concurrency.max_concurrent_sandboxes)),
            student_locks: Mutex::new(HashMap::new()),
            repository,
            executor,
            feedback,
            deep,
            config,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    /// Evaluate a submission.
    ///
    /// The run happens on its own task: once started it completes and
    /// commits even if the returned future is dropped.
    #[instrument(
        skip(self, request),
        fields(student_id = %request.student_id, problem_id = %request.problem_id)
    )]
    pub async fn submit(&self, request: SubmitRequest) -> Result<PipelineOutcome, PipelineError> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.run(request).await })
            .await
            .map_err(|e| PipelineError::Internal(format!("pipeline task failed: {e}")))?
    }
}

impl Inner {
    async fn run(&self, request: SubmitRequest) -> Result<PipelineOutcome, PipelineError> {
        let student = self
            .repository
            .student(&request.student_id)?
            .ok_or_else(|| PipelineError::StudentNotFound(request.student_id.clone()))?;
        let problem = self
            .repository
            .problem(&request.problem_id)?
            .ok_or_else(|| PipelineError::ProblemNotFound(request.problem_id.clone()))?;

        let lock = self.student_lock(&student.id);
        let _serialized = lock.lock().await;

        let now = Utc::now();
        let hash = code_hash(&request.code);
        let recent = self.repository.recent_submissions(
            &student.id,
            &problem.id,
            self.guard.window_start(now),
        )?;
        if let RateDecision::Throttle {
            cooldown_secs,
            started,
        } = self.guard.check(&student.id, &hash, &recent, now)
        {
            warn!(
                student_id = %student.id,
                cooldown_secs,
                new_cooldown = started,
                "submission throttled"
            );
            return Ok(PipelineOutcome::Throttled { cooldown_secs });
        }

        let permit = self.acquire_slot().await?;
        let report = self.execute(&request.code, &problem).await;
        drop(permit);

        let visible_pass_rate = report.visible_pass_rate();
        let hidden_pass_rate = report.hidden_pass_rate_opt();
        let gaming = check_hardcoding(visible_pass_rate, hidden_pass_rate, &self.config.hardcoding);
        if let Some(reason) = gaming {
            warn!(
                student_id = %student.id,
                problem_id = %problem.id,
                reason = reason.as_str(),
                visible_pass_rate,
                hidden_pass_rate = ?hidden_pass_rate,
                "hardcoding suspected"
            );
        }

        let profile = self.profile(&request.code, &report);
        let error_class = profile.error_class;
        let visible_results = report.visible_results(&problem.test_cases);
        let failures: Vec<VisibleCaseResult> = visible_results
            .iter()
            .filter(|r| !r.passed)
            .take(MAX_REPORTED_FAILURES)
            .cloned()
            .collect();

        let feedback = self
            .feedback
            .feedback(&FeedbackRequest {
                statement: problem.statement.clone(),
                code: request.code.clone(),
                pass_rate: report.pass_rate(),
                compiled: report.compiled(),
                error_class,
                failures: failures.clone(),
                profile: profile.clone(),
            })
            .await;

        let current: HashMap<String, f64> = self
            .repository
            .capability_scores(&student.id)?
            .into_iter()
            .map(|c| (c.concept, c.score))
            .collect();
        let cap = gaming.map(|_| self.config.hardcoding.score_cap);
        let submission_score = self.capability.submission_score(&report, cap);
        let plan = self.capability.plan(&problem, error_class, submission_score, |c| {
            current.get(c).copied()
        });
        info!(
            student_id = %student.id,
            concept = %plan.primary.concept,
            old_score = plan.primary.old_score,
            new_score = plan.primary.new_score,
            weight = plan.primary.weight,
            secondary = plan.secondary.len(),
            "capability updated"
        );

        let history = self.repository.concept_history(
            &student.id,
            &problem.primary_concept,
            self.escalation.history_needed().saturating_sub(1),
        )?;
        let recent_pass_rates: Vec<f64> = std::iter::once(report.pass_rate())
            .chain(history.iter().map(|s| s.pass_rate))
            .collect();
        let escalation = self.escalation.evaluate(&EscalationContext {
            requested: request.deep_explain,
            recent_pass_rates: &recent_pass_rates,
            score_after: plan.primary.new_score,
            compiled: report.compiled(),
            pass_rate: report.pass_rate(),
            timed_out: report.timed_out(),
            error_class,
        });

        let (deep_explanation, generated_problem) = match escalation {
            Some(reason) => {
                info!(
                    student_id = %student.id,
                    problem_id = %problem.id,
                    reason = reason.as_str(),
                    "escalation triggered"
                );
                let deep_request = DeepRequest {
                    statement: problem.statement.clone(),
                    code: request.code.clone(),
                    concept: problem.primary_concept.clone(),
                    reason,
                    failures,
                    profile,
                    capability_history: capability_history(&current, &plan),
                };
                self.explain(&deep_request).await
            }
            None => (None, None),
        };

        let selection = self.select_next(&student, &problem, &plan, &feedback)?;

        let submission_id = Uuid::new_v4().to_string();
        let submission = Submission {
            id: submission_id.clone(),
            student_id: student.id.clone(),
            problem_id: problem.id.clone(),
            concept: problem.primary_concept.clone(),
            code: request.code,
            code_hash: hash,
            pass_rate: report.pass_rate(),
            visible_pass_rate,
            hidden_pass_rate,
            status: report.submission_status(),
            error_class,
            capability_delta: plan.primary.delta(),
            escalated: escalation.is_some(),
            escalation_reason: escalation,
            gaming_flagged: gaming.is_some(),
            gaming_reason: gaming,
            next_problem_id: selection.as_ref().map(|s| s.problem.id.clone()),
            submitted_at: now,
            outcomes: report.outcomes,
        };
        let commit = SubmissionCommit {
            scores: plan
                .all()
                .map(|u| CapabilityScore {
                    student_id: student.id.clone(),
                    concept: u.concept.clone(),
                    score: u.new_score,
                    updated_at: now,
                })
                .collect(),
            escalation: escalation.map(|reason| EscalationLog {
                id: Uuid::new_v4().to_string(),
                student_id: student.id.clone(),
                problem_id: problem.id.clone(),
                submission_id: submission_id.clone(),
                reason,
                resolved: false,
                logged_at: now,
            }),
            generated_problem,
            submission,
        };
        self.repository.commit(&commit)?;
        info!(
            submission_id = %submission_id,
            student_id = %student.id,
            pass_rate = commit.submission.pass_rate,
            status = commit.submission.status.as_str(),
            escalated = commit.submission.escalated,
            "submission committed"
        );

        Ok(PipelineOutcome::Evaluated(Box::new(SubmissionResult {
            submission_id,
            status: commit.submission.status,
            pass_rate: commit.submission.pass_rate,
            visible_pass_rate,
            visible_results,
            error_class,
            feedback,
            deep_explanation,
            next_problem: selection.map(next_problem),
            capability: plan.primary,
            secondary_updates: plan.secondary,
            escalated: escalation.is_some(),
            escalation_reason: escalation,
            gaming_flagged: gaming.is_some(),
        })))
    }

    fn student_lock(&self, student_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.student_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.retain(|id, lock| id == student_id || Arc::strong_count(lock) > 1);
        Arc::clone(
            locks
                .entry(student_id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        )
    }

    async fn acquire_slot(&self) -> Result<OwnedSemaphorePermit, PipelineError> {
        let wait = self.config.concurrency.slot_wait();
        match tokio::time::timeout(wait, Arc::clone(&self.slots).acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(PipelineError::Internal("sandbox pool closed".into())),
            Err(_) => {
                warn!(
                    slots = self.config.concurrency.max_concurrent_sandboxes,
                    wait_ms = self.config.concurrency.slot_wait_ms,
                    "no sandbox slot available"
                );
                Err(PipelineError::Busy {
                    slots: self.config.concurrency.max_concurrent_sandboxes,
                })
            }
        }
    }

    async fn execute(&self, code: &str, problem: &Problem) -> ExecutionReport {
        let request = ExecutionRequest {
            code: code.to_string(),
            cases: problem.test_cases.clone(),
        };
        match self.executor.execute(&request).await {
            Ok(report) => {
                info!(
                    problem_id = %problem.id,
                    status = report.submission_status().as_str(),
                    pass_rate = report.pass_rate(),
                    duration_ms = report.duration_ms,
                    "execution complete"
                );
                report
            }
            Err(e) => {
                error!(problem_id = %problem.id, error = %format!("{e:#}"), "executor fault");
                ExecutionReport::fault(&problem.test_cases, "executor fault")
            }
        }
    }

    fn profile(&self, code: &str, report: &ExecutionReport) -> CodeProfile {
        if !report.compiled() {
            return CodeProfile::syntax_error();
        }
        let profile = extract_features(code);
        if profile.syntax_error {
            warn!("interpreter accepted code the feature extractor could not follow");
            return CodeProfile::opaque();
        }
        profile
    }

    async fn explain(&self, request: &DeepRequest) -> (Option<DeepExplanation>, Option<Problem>) {
        let Some(reply) = self.deep.explain(request).await else {
            warn!(reason = request.reason.as_str(), "no deep explanation available");
            return (None, None);
        };
        let mut explanation = reply.explanation;
        let Some(proposal) = reply.mini_problem else {
            return (Some(explanation), None);
        };

        let Ok(_permit) = self.acquire_slot().await else {
            warn!("skipping practice problem validation, sandbox pool busy");
            return (Some(explanation), None);
        };
        let generated = self.validator.accept(&proposal).await;
        explanation.practice_problem_id = generated.as_ref().map(|p| p.id.clone());
        (Some(explanation), generated)
    }

    fn select_next(
        &self,
        student: &Student,
        problem: &Problem,
        plan: &CapabilityPlan,
        feedback: &Feedback,
    ) -> Result<Option<Selection>, PipelineError> {
        let bank = self.repository.problems()?;
        let history = self.repository.submissions_for_student(&student.id)?;
        let mut seen = SeenProblems::from_history(&history);
        seen.insert(problem.id.clone());

        Ok(self
            .selector
            .select(
                &bank,
                &problem.primary_concept,
                plan.primary.new_score,
                feedback.difficulty_signal,
                &seen,
            )
            .ok())
    }
}

/// Current scores with this submission's updates applied.
fn capability_history(
    current: &HashMap<String, f64>,
    plan: &CapabilityPlan,
) -> BTreeMap<String, f64> {
    let mut history: BTreeMap<String, f64> =
        current.iter().map(|(c, s)| (c.clone(), *s)).collect();
    for update in plan.all() {
        history.insert(update.concept.clone(), update.new_score);
    }
    history
}

fn next_problem(selection: Selection) -> NextProblem {
    NextProblem {
        id: selection.problem.id,
        title: selection.problem.title,
        statement: selection.problem.statement,
        difficulty: selection.problem.difficulty,
        concept: selection.concept,
        concept_tags: selection.problem.concept_tags,
        band: selection.band,
        fallback_used: selection.fallback_used,
    }
}
