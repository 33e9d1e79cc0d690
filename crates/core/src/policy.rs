//! Retry and lease policy: the claim eligibility predicate.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::{Job, JobStatus};

/// Global retry/lease knobs shared by every worker of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimPolicy {
    /// Upper bound on claims; `failed` rows at or above it are never re-claimed.
    pub max_attempts: u32,
    /// Minimum gap between a failure and the next claim.
    pub retry_delay: Duration,
    /// Heartbeat staleness after which a `running` row is reclaimable.
    pub stale_running_ttl: Duration,
}

impl Default for ClaimPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            retry_delay: Duration::from_secs(30),
            stale_running_ttl: Duration::from_secs(120),
        }
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

impl ClaimPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_stale_running_ttl(mut self, ttl: Duration) -> Self {
        self.stale_running_ttl = ttl;
        self
    }

    /// Failures strictly before this instant have cooled down.
    pub fn retry_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_sub_signed(to_chrono(self.retry_delay))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Heartbeats strictly before this instant are stale.
    pub fn stale_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_sub_signed(to_chrono(self.stale_running_ttl))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// `failed` with every attempt consumed.
    pub fn is_exhausted(&self, job: &Job) -> bool {
        job.status == JobStatus::Failed && job.attempts >= self.max_attempts
    }

    /// Whether `job` may be claimed at `now`.
    ///
    /// Exactly one branch can match since they are keyed on distinct statuses.
    /// A running row without a heartbeat falls back to `updated_at`.
    pub fn is_eligible(&self, job: &Job, now: DateTime<Utc>) -> bool {
        if job.is_deleted() {
            return false;
        }
        match job.status {
            JobStatus::Queued => true,
            JobStatus::Failed => {
                job.attempts < self.max_attempts
                    && job
                        .last_error_at
                        .is_none_or(|at| at < self.retry_cutoff(now))
            }
            JobStatus::Running => {
                job.heartbeat_at.unwrap_or(job.updated_at) < self.stale_cutoff(now)
            }
            JobStatus::WaitingUser | JobStatus::Succeeded | JobStatus::Canceled => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{JobId, OwnerId};
    use crate::job::NewJob;
    use chrono::Duration as ChronoDuration;
    use proptest::prelude::*;

    fn job_at(now: DateTime<Utc>) -> Job {
        NewJob::new(OwnerId::new(), "material_set", None, "ingest_chunks")
            .into_job(JobId::new(), now)
            .unwrap()
    }

    fn status_strategy() -> impl Strategy<Value = JobStatus> {
        proptest::sample::select(JobStatus::ALL.to_vec())
    }

    #[test]
    fn queued_is_always_eligible() {
        let now = Utc::now();
        assert!(ClaimPolicy::default().is_eligible(&job_at(now), now));
    }

    #[test]
    fn failed_row_waits_for_retry_delay() {
        let t0 = Utc::now();
        let mut job = job_at(t0);
        job.status = JobStatus::Failed;
        job.attempts = 1;
        job.last_error_at = Some(t0);

        let policy = ClaimPolicy::default();
        assert!(!policy.is_eligible(&job, t0 + ChronoDuration::seconds(15)));
        assert!(!policy.is_eligible(&job, t0 + ChronoDuration::seconds(30)));
        assert!(policy.is_eligible(&job, t0 + ChronoDuration::seconds(31)));
    }

    #[test]
    fn exhausted_row_is_never_eligible() {
        let t0 = Utc::now();
        let mut job = job_at(t0);
        job.status = JobStatus::Failed;
        job.attempts = 5;
        job.last_error_at = Some(t0);

        let policy = ClaimPolicy::default();
        assert!(policy.is_exhausted(&job));
        assert!(!policy.is_eligible(&job, t0 + ChronoDuration::days(7)));
    }

    #[test]
    fn running_row_is_reclaimable_after_stale_ttl() {
        let t0 = Utc::now();
        let mut job = job_at(t0);
        job.status = JobStatus::Running;
        job.attempts = 1;
        job.heartbeat_at = Some(t0);

        let policy = ClaimPolicy::default();
        assert!(!policy.is_eligible(&job, t0 + ChronoDuration::seconds(60)));
        assert!(policy.is_eligible(&job, t0 + ChronoDuration::seconds(121)));
    }

    #[test]
    fn waiting_and_deleted_rows_are_not_eligible() {
        let now = Utc::now();
        let mut waiting = job_at(now);
        waiting.status = JobStatus::WaitingUser;
        assert!(!ClaimPolicy::default().is_eligible(&waiting, now + ChronoDuration::days(1)));

        let mut deleted = job_at(now);
        deleted.deleted_at = Some(now);
        assert!(!ClaimPolicy::default().is_eligible(&deleted, now));
    }

    proptest! {
        #[test]
        fn failed_rows_never_reclaimed_before_cooldown(
            attempts in 0u32..10,
            elapsed_ms in 0i64..60_000,
            delay_ms in 0u64..60_000,
        ) {
            let t0 = Utc::now();
            let mut job = job_at(t0);
            job.status = JobStatus::Failed;
            job.attempts = attempts;
            job.last_error_at = Some(t0);

            let policy = ClaimPolicy::default().with_retry_delay(Duration::from_millis(delay_ms));
            let now = t0 + ChronoDuration::milliseconds(elapsed_ms);
            if policy.is_eligible(&job, now) {
                prop_assert!(attempts < policy.max_attempts);
                prop_assert!(elapsed_ms > delay_ms as i64);
            }
        }

        #[test]
        fn absorbing_and_waiting_rows_are_never_eligible(
            status in status_strategy(),
            offset_s in 0i64..100_000,
        ) {
            let t0 = Utc::now();
            let mut job = job_at(t0);
            job.status = status;
            job.heartbeat_at = Some(t0);
            let eligible = ClaimPolicy::default().is_eligible(&job, t0 + ChronoDuration::seconds(offset_s));
            if matches!(status, JobStatus::Succeeded | JobStatus::Canceled | JobStatus::WaitingUser) {
                prop_assert!(!eligible);
            }
            if status == JobStatus::Queued {
                prop_assert!(eligible);
            }
        }
    }
}
