//! Persistence seam of the pipeline.
//!
//! [`Repository`] is synchronous: every call is short and the SQLite
//! implementation serializes access behind a mutex anyway. The only write
//! the pipeline performs is [`Repository::commit`], which must apply all of
//! a [`SubmissionCommit`] or none of it.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};

use crate::model::{CapabilityScore, EscalationLog, Problem, Student, Submission};

/// Everything one evaluated submission writes.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmissionCommit {
    pub submission: Submission,
    /// Upserts for the primary and every secondary concept.
    pub scores: Vec<CapabilityScore>,
    pub escalation: Option<EscalationLog>,
    /// Validated practice problem proposed on escalation.
    pub generated_problem: Option<Problem>,
}

pub trait Repository: Send + Sync {
    fn student(&self, id: &str) -> Result<Option<Student>>;
    fn student_by_email(&self, email: &str) -> Result<Option<Student>>;
    fn students(&self) -> Result<Vec<Student>>;

    fn problem(&self, id: &str) -> Result<Option<Problem>>;
    /// Every problem in bank (insertion) order.
    fn problems(&self) -> Result<Vec<Problem>>;

    /// All submissions, oldest first.
    fn submissions(&self) -> Result<Vec<Submission>>;
    /// A student's submissions, oldest first.
    fn submissions_for_student(&self, student_id: &str) -> Result<Vec<Submission>>;
    /// A student's submissions to one problem at or after `since`, newest first.
    fn recent_submissions(
        &self,
        student_id: &str,
        problem_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Submission>>;
    /// Up to `limit` of a student's submissions whose primary concept is
    /// `concept`, newest first.
    fn concept_history(
        &self,
        student_id: &str,
        concept: &str,
        limit: usize,
    ) -> Result<Vec<Submission>>;

    fn capability_scores(&self, student_id: &str) -> Result<Vec<CapabilityScore>>;
    fn all_capability_scores(&self) -> Result<Vec<CapabilityScore>>;
    fn capability_score(&self, student_id: &str, concept: &str) -> Result<Option<f64>>;

    /// Escalations, oldest first.
    fn escalations(&self, unresolved_only: bool) -> Result<Vec<EscalationLog>>;

    /// Fails when the email is already registered.
    fn insert_student(&self, student: &Student) -> Result<()>;
    /// Insert or replace by id; a replaced problem keeps its bank position.
    fn insert_problem(&self, problem: &Problem) -> Result<()>;

    fn commit(&self, commit: &SubmissionCommit) -> Result<()>;
    /// Mark an escalation resolved. `false` when no such escalation exists.
    fn resolve_escalation(&self, id: &str) -> Result<bool>;
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct State {
    students: Vec<Student>,
    problems: Vec<Problem>,
    submissions: Vec<Submission>,
    scores: HashMap<(String, String), CapabilityScore>,
    escalations: Vec<EscalationLog>,
}

/// Process-local repository. All state sits behind one lock, so a commit is
/// visible either entirely or not at all.
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    state: RwLock<State>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn read<T>(&self, f: impl FnOnce(&State) -> T) -> T {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        f(&state)
    }

    fn write<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }
}

impl Repository for InMemoryRepository {
    fn student(&self, id: &str) -> Result<Option<Student>> {
        Ok(self.read(|s| s.students.iter().find(|st| st.id == id).cloned()))
    }

    fn student_by_email(&self, email: &str) -> Result<Option<Student>> {
        Ok(self.read(|s| s.students.iter().find(|st| st.email == email).cloned()))
    }

    fn students(&self) -> Result<Vec<Student>> {
        Ok(self.read(|s| s.students.clone()))
    }

    fn problem(&self, id: &str) -> Result<Option<Problem>> {
        Ok(self.read(|s| s.problems.iter().find(|p| p.id == id).cloned()))
    }

    fn problems(&self) -> Result<Vec<Problem>> {
        Ok(self.read(|s| s.problems.clone()))
    }

    fn submissions(&self) -> Result<Vec<Submission>> {
        Ok(self.read(|s| s.submissions.clone()))
    }

    fn submissions_for_student(&self, student_id: &str) -> Result<Vec<Submission>> {
        Ok(self.read(|s| {
            s.submissions
                .iter()
                .filter(|sub| sub.student_id == student_id)
                .cloned()
                .collect()
        }))
    }

    fn recent_submissions(
        &self,
        student_id: &str,
        problem_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Submission>> {
        Ok(self.read(|s| {
            s.submissions
                .iter()
                .rev()
                .filter(|sub| {
                    sub.student_id == student_id
                        && sub.problem_id == problem_id
                        && sub.submitted_at >= since
                })
                .cloned()
                .collect()
        }))
    }

    fn concept_history(
        &self,
        student_id: &str,
        concept: &str,
        limit: usize,
    ) -> Result<Vec<Submission>> {
        Ok(self.read(|s| {
            s.submissions
                .iter()
                .rev()
                .filter(|sub| sub.student_id == student_id && sub.concept == concept)
                .take(limit)
                .cloned()
                .collect()
        }))
    }

    fn capability_scores(&self, student_id: &str) -> Result<Vec<CapabilityScore>> {
        Ok(self.read(|s| {
            let mut scores: Vec<_> = s
                .scores
                .values()
                .filter(|c| c.student_id == student_id)
                .cloned()
                .collect();
            scores.sort_by(|a, b| a.concept.cmp(&b.concept));
            scores
        }))
    }

    fn all_capability_scores(&self) -> Result<Vec<CapabilityScore>> {
        Ok(self.read(|s| {
            let mut scores: Vec<_> = s.scores.values().cloned().collect();
            scores.sort_by(|a, b| {
                a.student_id
                    .cmp(&b.student_id)
                    .then_with(|| a.concept.cmp(&b.concept))
            });
            scores
        }))
    }

    fn capability_score(&self, student_id: &str, concept: &str) -> Result<Option<f64>> {
        Ok(self.read(|s| {
            s.scores
                .get(&(student_id.to_string(), concept.to_string()))
                .map(|c| c.score)
        }))
    }

    fn escalations(&self, unresolved_only: bool) -> Result<Vec<EscalationLog>> {
        Ok(self.read(|s| {
            s.escalations
                .iter()
                .filter(|e| !unresolved_only || !e.resolved)
                .cloned()
                .collect()
        }))
    }

    fn insert_student(&self, student: &Student) -> Result<()> {
        self.write(|s| {
            if s.students.iter().any(|st| st.email == student.email) {
                bail!("a student with email '{}' already exists", student.email);
            }
            if s.students.iter().any(|st| st.id == student.id) {
                bail!("student id '{}' already exists", student.id);
            }
            s.students.push(student.clone());
            Ok(())
        })
    }

    fn insert_problem(&self, problem: &Problem) -> Result<()> {
        self.write(|s| {
            match s.problems.iter_mut().find(|p| p.id == problem.id) {
                Some(existing) => *existing = problem.clone(),
                None => s.problems.push(problem.clone()),
            }
            Ok(())
        })
    }

    fn commit(&self, commit: &SubmissionCommit) -> Result<()> {
        self.write(|s| {
            let sub = &commit.submission;
            if !s.students.iter().any(|st| st.id == sub.student_id) {
                bail!("commit references unknown student '{}'", sub.student_id);
            }
            if s.submissions.iter().any(|existing| existing.id == sub.id) {
                bail!("submission '{}' already committed", sub.id);
            }

            if let Some(problem) = &commit.generated_problem {
                match s.problems.iter_mut().find(|p| p.id == problem.id) {
                    Some(existing) => *existing = problem.clone(),
                    None => s.problems.push(problem.clone()),
                }
            }
            s.submissions.push(sub.clone());
            for score in &commit.scores {
                s.scores.insert(
                    (score.student_id.clone(), score.concept.clone()),
                    score.clone(),
                );
            }
            if let Some(log) = &commit.escalation {
                s.escalations.push(log.clone());
            }
            Ok(())
        })
    }

    fn resolve_escalation(&self, id: &str) -> Result<bool> {
        Ok(self.write(|s| match s.escalations.iter_mut().find(|e| e.id == id) {
            Some(log) => {
                log.resolved = true;
                true
            }
            None => false,
        }))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use chrono::Duration;

    use super::*;
    use crate::model::{
        code_hash, Difficulty, ErrorClass, EscalationReason, NewProblem, Provenance,
        SubmissionStatus, TestCase,
    };

    pub(crate) fn submission(
        student: &str,
        problem: &str,
        concept: &str,
        pass_rate: f64,
    ) -> Submission {
        Submission {
            id: uuid::Uuid::new_v4().to_string(),
            student_id: student.into(),
            problem_id: problem.into(),
            concept: concept.into(),
            code: "print(1)".into(),
            code_hash: code_hash("print(1)"),
            outcomes: vec![],
            pass_rate,
            visible_pass_rate: pass_rate,
            hidden_pass_rate: None,
            status: SubmissionStatus::Completed,
            error_class: ErrorClass::None,
            capability_delta: 0.0,
            escalated: false,
            escalation_reason: None,
            gaming_flagged: false,
            gaming_reason: None,
            next_problem_id: None,
            submitted_at: Utc::now(),
        }
    }

    fn problem(id: &str) -> Problem {
        Problem::create(
            NewProblem {
                id: id.into(),
                title: String::new(),
                statement: "Print the input back.".into(),
                concept_tags: vec!["loops".into()],
                primary_concept: "loops".into(),
                difficulty: Difficulty::Easy,
                difficulty_score: None,
                test_cases: vec![TestCase::visible("1", "1"), TestCase::hidden("2", "2")],
                expected_complexity: None,
                provenance: Provenance::Curated,
            },
            0.3,
        )
        .unwrap()
    }

    fn commit_for(sub: Submission, score: f64) -> SubmissionCommit {
        SubmissionCommit {
            scores: vec![CapabilityScore {
                student_id: sub.student_id.clone(),
                concept: sub.concept.clone(),
                score,
                updated_at: sub.submitted_at,
            }],
            submission: sub,
            escalation: None,
            generated_problem: None,
        }
    }

    #[test]
    fn duplicate_email_is_rejected() {
        let repo = InMemoryRepository::new();
        repo.insert_student(&Student::new("Ada", "ada@example.com")).unwrap();
        assert!(repo
            .insert_student(&Student::new("Ada Again", "ada@example.com"))
            .is_err());
        assert_eq!(repo.students().unwrap().len(), 1);
    }

    #[test]
    fn problems_keep_bank_order_on_replace() {
        let repo = InMemoryRepository::new();
        repo.insert_problem(&problem("a")).unwrap();
        repo.insert_problem(&problem("b")).unwrap();
        let mut replaced = problem("a");
        replaced.title = "Renamed".into();
        repo.insert_problem(&replaced).unwrap();

        let ids: Vec<_> = repo.problems().unwrap().into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(repo.problem("a").unwrap().unwrap().title, "Renamed");
    }

    #[test]
    fn commit_writes_everything_and_histories_are_newest_first() {
        let repo = InMemoryRepository::new();
        let student = Student::new("Ada", "ada@example.com");
        repo.insert_student(&student).unwrap();

        let first = submission(&student.id, "p1", "loops", 0.0);
        let mut second = submission(&student.id, "p2", "loops", 1.0);
        second.submitted_at = first.submitted_at + Duration::seconds(1);
        repo.commit(&commit_for(first.clone(), 0.47)).unwrap();

        let mut commit = commit_for(second.clone(), 0.55);
        commit.escalation = Some(EscalationLog {
            id: "esc-1".into(),
            student_id: student.id.clone(),
            problem_id: "p2".into(),
            submission_id: second.id.clone(),
            reason: EscalationReason::StudentRequest,
            resolved: false,
            logged_at: Utc::now(),
        });
        repo.commit(&commit).unwrap();

        let history = repo.concept_history(&student.id, "loops", 5).unwrap();
        assert_eq!(history[0].id, second.id);
        assert_eq!(history[1].id, first.id);
        assert_eq!(repo.capability_score(&student.id, "loops").unwrap(), Some(0.55));
        assert_eq!(repo.escalations(true).unwrap().len(), 1);

        assert!(repo.resolve_escalation("esc-1").unwrap());
        assert!(repo.escalations(true).unwrap().is_empty());
        assert!(!repo.resolve_escalation("missing").unwrap());
    }

    #[test]
    fn failed_commit_changes_nothing() {
        let repo = InMemoryRepository::new();
        let student = Student::new("Ada", "ada@example.com");
        repo.insert_student(&student).unwrap();
        let sub = submission(&student.id, "p1", "loops", 1.0);
        repo.commit(&commit_for(sub.clone(), 0.575)).unwrap();

        let mut again = commit_for(sub, 0.9);
        again.generated_problem = Some(problem("gen_000000000000"));
        assert!(repo.commit(&again).is_err());
        assert_eq!(repo.capability_score(&student.id, "loops").unwrap(), Some(0.575));
        assert!(repo.problem("gen_000000000000").unwrap().is_none());
    }

    #[test]
    fn recent_submissions_respect_since() {
        let repo = InMemoryRepository::new();
        let student = Student::new("Ada", "ada@example.com");
        repo.insert_student(&student).unwrap();
        let mut old = submission(&student.id, "p1", "loops", 0.0);
        old.submitted_at = Utc::now() - Duration::minutes(10);
        repo.commit(&commit_for(old, 0.4)).unwrap();
        repo.commit(&commit_for(submission(&student.id, "p1", "loops", 0.0), 0.4))
            .unwrap();
        repo.commit(&commit_for(submission(&student.id, "p2", "loops", 0.0), 0.4))
            .unwrap();

        let since = Utc::now() - Duration::minutes(3);
        assert_eq!(repo.recent_submissions(&student.id, "p1", since).unwrap().len(), 1);
    }
}
