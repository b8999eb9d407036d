//! Anti-gaming checks.
//!
//! The rate guard runs before execution and throttles rapid resubmission of
//! unchanged code; the hardcoding guard runs after execution and compares
//! visible against hidden pass rates.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

use crate::config::{HardcodingConfig, RateGuardConfig};
use crate::model::{GamingReason, Submission};

/// Verdict of [`RateGuard::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allow,
    Throttle {
        /// Seconds until the student may submit again (at least 1).
        cooldown_secs: u64,
        /// True when this check started the cooldown.
        started: bool,
    },
}

/// Sliding-window resubmission guard with per-student cooldowns.
///
/// Cooldowns live in memory and are keyed by student, so a throttled
/// student is held back on every problem until the cooldown lapses.
#[derive(Debug)]
pub struct RateGuard {
    config: RateGuardConfig,
    cooldowns: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl RateGuard {
    pub fn new(config: RateGuardConfig) -> Self {
        Self {
            config,
            cooldowns: Mutex::new(HashMap::new()),
        }
    }

    /// Oldest submission time that still counts towards the window.
    pub fn window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - seconds(self.config.window_secs)
    }

    /// Decide whether a submission may proceed.
    ///
    /// `recent` holds the student's earlier submissions for the same
    /// problem; entries older than the window are ignored. The incoming
    /// submission counts towards both the total and the distinct hashes.
    pub fn check(
        &self,
        student_id: &str,
        code_hash: &str,
        recent: &[Submission],
        now: DateTime<Utc>,
    ) -> RateDecision {
        let mut cooldowns = self.cooldowns.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(expiry) = cooldowns.get(student_id).copied() {
            if now < expiry {
                return RateDecision::Throttle {
                    cooldown_secs: remaining_secs(expiry - now),
                    started: false,
                };
            }
            cooldowns.remove(student_id);
        }

        let since = self.window_start(now);
        let window: Vec<&Submission> = recent.iter().filter(|s| s.submitted_at >= since).collect();
        if window.len() + 1 < self.config.submit_max {
            return RateDecision::Allow;
        }

        let distinct: HashSet<&str> = window
            .iter()
            .map(|s| s.code_hash.as_str())
            .chain(std::iter::once(code_hash))
            .collect();
        if distinct.len() > self.config.distinct_max {
            return RateDecision::Allow;
        }

        cooldowns.retain(|_, expiry| now < *expiry);
        cooldowns.insert(student_id.to_string(), now + seconds(self.config.cooldown_secs));
        RateDecision::Throttle {
            cooldown_secs: self.config.cooldown_secs.max(1),
            started: true,
        }
    }

    pub fn is_cooling_down(&self, student_id: &str, now: DateTime<Utc>) -> bool {
        let cooldowns = self.cooldowns.lock().unwrap_or_else(|e| e.into_inner());
        cooldowns.get(student_id).is_some_and(|expiry| now < *expiry)
    }
}

fn seconds(secs: u64) -> Duration {
    Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX / 1_000))
}

fn remaining_secs(left: Duration) -> u64 {
    let millis = left.num_milliseconds().max(0) as u64;
    millis.div_ceil(1000).max(1)
}

/// Flag a submission whose visible results are much better than its hidden
/// ones. Problems without hidden cases are never flagged.
///
/// Either rule is sufficient; the first that holds names the reason.
pub fn check_hardcoding(
    visible_pass_rate: f64,
    hidden_pass_rate: Option<f64>,
    config: &HardcodingConfig,
) -> Option<GamingReason> {
    let hidden = hidden_pass_rate?;
    if visible_pass_rate >= config.visible_full && hidden < config.hidden_threshold {
        Some(GamingReason::VisibleOnlyPass)
    } else if visible_pass_rate - hidden > config.gap {
        Some(GamingReason::SuspiciousGap)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{code_hash, ErrorClass, SubmissionStatus};

    fn submission(code: &str, at: DateTime<Utc>) -> Submission {
        Submission {
            id: uuid::Uuid::new_v4().to_string(),
            student_id: "s1".into(),
            problem_id: "p1".into(),
            concept: "loops".into(),
            code: code.into(),
            code_hash: code_hash(code),
            outcomes: vec![],
            pass_rate: 0.0,
            visible_pass_rate: 0.0,
            hidden_pass_rate: None,
            status: SubmissionStatus::Completed,
            error_class: ErrorClass::None,
            capability_delta: 0.0,
            escalated: false,
            escalation_reason: None,
            gaming_flagged: false,
            gaming_reason: None,
            next_problem_id: None,
            submitted_at: at,
        }
    }

    fn guard() -> RateGuard {
        RateGuard::new(RateGuardConfig::default())
    }

    #[test]
    fn fifth_identical_submission_is_throttled() {
        let guard = guard();
        let now = Utc::now();
        let code = "print(1)";
        let history: Vec<_> = (1..=4)
            .map(|i| submission(code, now - Duration::seconds(i * 10)))
            .collect();

        assert_eq!(
            guard.check("s1", &code_hash(code), &history[..3], now),
            RateDecision::Allow
        );
        assert_eq!(
            guard.check("s1", &code_hash(code), &history, now),
            RateDecision::Throttle {
                cooldown_secs: 60,
                started: true
            }
        );
        assert!(guard.is_cooling_down("s1", now));
    }

    #[test]
    fn expired_cooldowns_are_pruned_for_absent_students() {
        let guard = guard();
        let now = Utc::now();
        let code = "print(1)";
        let history: Vec<_> = (1..=4)
            .map(|i| submission(code, now - Duration::seconds(i * 10)))
            .collect();
        assert!(matches!(
            guard.check("gone", &code_hash(code), &history, now),
            RateDecision::Throttle { started: true, .. }
        ));

        // "gone" never submits again; a later cooldown for someone else
        // clears the stale entry.
        let later = now + Duration::seconds(120);
        let recent: Vec<_> = (1..=4)
            .map(|i| submission(code, later - Duration::seconds(i * 10)))
            .collect();
        assert!(matches!(
            guard.check("s1", &code_hash(code), &recent, later),
            RateDecision::Throttle { started: true, .. }
        ));

        let cooldowns = guard.cooldowns.lock().unwrap();
        assert_eq!(cooldowns.len(), 1);
        assert!(cooldowns.contains_key("s1"));
    }

    #[test]
    fn distinct_code_is_not_throttled() {
        let guard = guard();
        let now = Utc::now();
        let mut history: Vec<_> = (1..=4)
            .map(|i| submission("print(1)", now - Duration::seconds(i * 10)))
            .collect();
        history[0] = submission("print(2)", now - Duration::seconds(5));
        assert_eq!(
            guard.check("s1", &code_hash("print(1)"), &history, now),
            RateDecision::Allow
        );
        assert_eq!(
            guard.check("s1", &code_hash("print(3)"), &history[1..], now),
            RateDecision::Allow
        );
    }

    #[test]
    fn whitespace_only_changes_count_as_identical() {
        let guard = guard();
        let now = Utc::now();
        let history: Vec<_> = ["print(1)", "print(1)\n", "  print(1)", "print(1)  "]
            .iter()
            .map(|code| submission(code, now - Duration::seconds(30)))
            .collect();
        assert!(matches!(
            guard.check("s1", &code_hash("\tprint(1)\n"), &history, now),
            RateDecision::Throttle { .. }
        ));
    }

    #[test]
    fn old_submissions_fall_out_of_window() {
        let guard = guard();
        let now = Utc::now();
        let history: Vec<_> = (0..4)
            .map(|_| submission("print(1)", now - Duration::minutes(4)))
            .collect();
        assert_eq!(
            guard.check("s1", &code_hash("print(1)"), &history, now),
            RateDecision::Allow
        );
    }

    #[test]
    fn cooldown_applies_to_every_problem_then_expires() {
        let guard = guard();
        let now = Utc::now();
        let history: Vec<_> = (0..4).map(|_| submission("x = 1", now)).collect();
        guard.check("s1", &code_hash("x = 1"), &history, now);

        let later = now + Duration::seconds(20);
        assert_eq!(
            guard.check("s1", &code_hash("something else"), &[], later),
            RateDecision::Throttle {
                cooldown_secs: 40,
                started: false
            }
        );
        assert_eq!(
            guard.check("s2", &code_hash("x = 1"), &[], later),
            RateDecision::Allow
        );

        let expired = now + Duration::seconds(61);
        assert_eq!(
            guard.check("s1", &code_hash("something else"), &[], expired),
            RateDecision::Allow
        );
        assert!(!guard.is_cooling_down("s1", expired));
    }

    #[test]
    fn hardcoding_rules() {
        let config = HardcodingConfig::default();
        assert_eq!(
            check_hardcoding(1.0, Some(0.0), &config),
            Some(GamingReason::VisibleOnlyPass)
        );
        assert_eq!(
            check_hardcoding(0.9, Some(0.4), &config),
            Some(GamingReason::SuspiciousGap)
        );
        assert_eq!(
            check_hardcoding(1.0, Some(0.5), &config),
            Some(GamingReason::SuspiciousGap)
        );
        assert_eq!(check_hardcoding(0.8, Some(0.5), &config), None);
        assert_eq!(check_hardcoding(1.0, None, &config), None);
    }
}
