//! Decision model: what happens to a row after a failed attempt.
//!
//! Deciding is a pure function of the policy, the row's fail count and the
//! error. Applying the decision is the store's job (`TaskStore::mark_failed`).

use std::time::Duration;

use chrono::{DateTime, Utc};

use super::{HandlerError, RetryPolicy, time};

/// The next step for a row whose attempt just failed.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Return the row to the pending pool; eligible again at `run_at`.
    Retry {
        delay: Duration,
        run_at: DateTime<Utc>,
    },

    /// Give up. The row is dead-lettered with `fail_count` and `last_error`.
    Dead,
}

impl Decision {
    pub fn is_dead(&self) -> bool {
        matches!(self, Decision::Dead)
    }
}

impl RetryPolicy {
    /// Decide the fate of a row that has failed `fail_count` times before
    /// this attempt.
    ///
    /// The failure being recorded brings the count to `fail_count + 1`; the
    /// row is dead once that reaches `max_retries`, or right away when the
    /// error is permanent.
    pub fn decide(&self, fail_count: u32, error: &HandlerError, now: DateTime<Utc>) -> Decision {
        let failures = fail_count.saturating_add(1);
        if error.is_permanent() || failures >= self.max_retries {
            return Decision::Dead;
        }
        let delay = self.next_delay(failures);
        Decision::Retry {
            delay,
            run_at: time::later(now, delay),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Backoff;
    use chrono::TimeZone;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(
            max_retries,
            Backoff::exponential(Duration::from_secs(2), 2.0, Duration::from_secs(3600)),
        )
    }

    #[test]
    fn retries_with_backoff_from_the_new_fail_count() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let err = HandlerError::transient("boom");

        let first = policy(5).decide(0, &err, now);
        assert_eq!(
            first,
            Decision::Retry {
                delay: Duration::from_secs(2),
                run_at: now + chrono::Duration::seconds(2),
            }
        );

        let third = policy(5).decide(2, &err, now);
        assert_eq!(
            third,
            Decision::Retry {
                delay: Duration::from_secs(8),
                run_at: now + chrono::Duration::seconds(8),
            }
        );
    }

    #[test]
    fn dead_when_the_failure_reaches_max_retries() {
        let now = Utc::now();
        let err = HandlerError::transient("boom");

        assert!(!policy(2).decide(0, &err, now).is_dead());
        assert!(policy(2).decide(1, &err, now).is_dead());
        assert!(policy(0).decide(0, &err, now).is_dead());
    }

    #[test]
    fn permanent_errors_skip_remaining_retries() {
        let err = HandlerError::permanent("bad address");
        assert!(policy(10).decide(0, &err, Utc::now()).is_dead());
    }
}
