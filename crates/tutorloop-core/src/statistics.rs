//! Student profiles and the faculty dashboard.
//!
//! Read-only views computed from repository contents; nothing here writes.

use std::collections::BTreeMap;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::analysis::selector::QuestionSelector;
use crate::config::SelectionConfig;
use crate::model::{
    CapabilityScore, ErrorClass, EscalationReason, Provenance, Student, Submission,
    SubmissionStatus,
};
use crate::repository::Repository;
use crate::results::safe_rate;

/// One concept on a student's profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConceptStanding {
    pub concept: String,
    pub score: f64,
    pub zone: u8,
    pub updated_at: DateTime<Utc>,
}

/// A submission as shown on a profile: no code, no case outcomes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionSummary {
    pub id: String,
    pub problem_id: String,
    pub concept: String,
    pub pass_rate: f64,
    pub status: SubmissionStatus,
    pub error_class: ErrorClass,
    pub escalation_reason: Option<EscalationReason>,
    pub gaming_flagged: bool,
    pub submitted_at: DateTime<Utc>,
}

impl From<&Submission> for SubmissionSummary {
    fn from(s: &Submission) -> Self {
        Self {
            id: s.id.clone(),
            problem_id: s.problem_id.clone(),
            concept: s.concept.clone(),
            pass_rate: s.pass_rate,
            status: s.status,
            error_class: s.error_class,
            escalation_reason: s.escalation_reason,
            gaming_flagged: s.gaming_flagged,
            submitted_at: s.submitted_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudentProfile {
    pub student: Student,
    /// Sorted by concept name.
    pub concepts: Vec<ConceptStanding>,
    pub weakest: Option<String>,
    pub strongest: Option<String>,
    pub mean_score: Option<f64>,
    pub submission_count: usize,
    pub escalation_count: usize,
    pub gaming_flag_count: usize,
    /// Newest first.
    pub recent: Vec<SubmissionSummary>,
}

/// Build a student's profile, or `None` for an unknown student.
pub fn student_profile(
    repo: &dyn Repository,
    student_id: &str,
    selection: &SelectionConfig,
    recent_limit: usize,
) -> Result<Option<StudentProfile>> {
    let Some(student) = repo.student(student_id)? else {
        return Ok(None);
    };
    let selector = QuestionSelector::new(selection.clone());

    let concepts: Vec<ConceptStanding> = repo
        .capability_scores(student_id)?
        .into_iter()
        .map(|c| ConceptStanding {
            zone: selector.zone(c.score),
            concept: c.concept,
            score: c.score,
            updated_at: c.updated_at,
        })
        .collect();

    // Ties resolve to the alphabetically first concept.
    let weakest = concepts
        .iter()
        .min_by(|a, b| a.score.total_cmp(&b.score))
        .map(|c| c.concept.clone());
    let strongest = concepts
        .iter()
        .rev()
        .max_by(|a, b| a.score.total_cmp(&b.score))
        .map(|c| c.concept.clone());
    let mean_score = (!concepts.is_empty())
        .then(|| concepts.iter().map(|c| c.score).sum::<f64>() / concepts.len() as f64);

    let submissions = repo.submissions_for_student(student_id)?;
    let recent = submissions
        .iter()
        .rev()
        .take(recent_limit)
        .map(SubmissionSummary::from)
        .collect();

    Ok(Some(StudentProfile {
        student,
        concepts,
        weakest,
        strongest,
        mean_score,
        submission_count: submissions.len(),
        escalation_count: submissions.iter().filter(|s| s.escalated).count(),
        gaming_flag_count: submissions.iter().filter(|s| s.gaming_flagged).count(),
        recent,
    }))
}

/// Class-wide statistics for one concept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConceptStats {
    pub concept: String,
    pub students: usize,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    /// Students per zone, zone 0 first.
    pub zones: [usize; 4],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dashboard {
    pub total_students: usize,
    pub total_submissions: usize,
    pub total_problems: usize,
    pub generated_problems: usize,
    pub escalation_rate: f64,
    pub gaming_flag_rate: f64,
    pub unresolved_escalations: usize,
    /// Weakest mean first.
    pub concepts: Vec<ConceptStats>,
}

pub fn dashboard(repo: &dyn Repository, selection: &SelectionConfig) -> Result<Dashboard> {
    let selector = QuestionSelector::new(selection.clone());
    let submissions = repo.submissions()?;
    let problems = repo.problems()?;

    Ok(Dashboard {
        total_students: repo.students()?.len(),
        total_submissions: submissions.len(),
        total_problems: problems.len(),
        generated_problems: problems
            .iter()
            .filter(|p| p.provenance == Provenance::Generated)
            .count(),
        escalation_rate: safe_rate(
            submissions.iter().filter(|s| s.escalated).count(),
            submissions.len(),
        ),
        gaming_flag_rate: safe_rate(
            submissions.iter().filter(|s| s.gaming_flagged).count(),
            submissions.len(),
        ),
        unresolved_escalations: repo.escalations(true)?.len(),
        concepts: concept_stats(&repo.all_capability_scores()?, &selector),
    })
}

fn concept_stats(scores: &[CapabilityScore], selector: &QuestionSelector) -> Vec<ConceptStats> {
    let mut grouped: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
    for s in scores {
        grouped.entry(s.concept.as_str()).or_default().push(s.score);
    }

    let mut stats: Vec<ConceptStats> = grouped
        .into_iter()
        .map(|(concept, values)| {
            let mut zones = [0usize; 4];
            for v in &values {
                zones[usize::from(selector.zone(*v))] += 1;
            }
            ConceptStats {
                concept: concept.to_string(),
                students: values.len(),
                mean: values.iter().sum::<f64>() / values.len() as f64,
                min: values.iter().copied().fold(f64::INFINITY, f64::min),
                max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
                zones,
            }
        })
        .collect();
    stats.sort_by(|a, b| a.mean.total_cmp(&b.mean).then_with(|| a.concept.cmp(&b.concept)));
    stats
}
