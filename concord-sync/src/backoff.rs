//! Retry bookkeeping and the `Failed` state.
//!
//! A failed attempt is applied to the record status according to its
//! category:
//!
//! - permanent: `Failed` straight away
//! - transient: `retry_count += 1`; `Error` with a backoff delay while the
//!   count stays under `max_retries`, otherwise `Failed`
//! - unknown: as transient, on the smaller `unknown_max_retries` budget
//!
//! Every failure records the generation it was observed at. A `Failed`
//! record stays failed until its generation moves past that one.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use concord_core::{ErrorCategory, ManagedRecord, Phase, RecordStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
    pub max_retries: u32,
    pub unknown_max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay_secs: 10,
            max_delay_secs: 300,
            max_retries: 5,
            unknown_max_retries: 3,
        }
    }
}

/// What a failure did to the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Try again after the delay.
    Retry(Duration),
    /// Terminal until the contributing spec changes.
    Failed,
}

impl BackoffPolicy {
    /// `min(max_delay, base_delay * 2^(retry_count - 1))`: 10s, 20s, 40s, ...
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let exp = retry_count.saturating_sub(1).min(32);
        let secs = self
            .base_delay_secs
            .saturating_mul(1u64 << exp)
            .min(self.max_delay_secs);
        Duration::from_secs(secs)
    }

    /// How many failed attempts a category tolerates before `Failed`.
    pub fn budget(&self, category: ErrorCategory) -> u32 {
        match category {
            ErrorCategory::Permanent => 0,
            ErrorCategory::Transient => self.max_retries,
            ErrorCategory::Unknown => self.unknown_max_retries,
        }
    }

    /// Record a failed attempt on `status`.
    pub fn record_failure(
        &self,
        status: &mut RecordStatus,
        category: ErrorCategory,
        reason: impl Into<String>,
        generation: u64,
        now: DateTime<Utc>,
    ) -> FailureOutcome {
        status.failure_reason = Some(reason.into());
        status.error_category = Some(category);
        status.max_retries = self.budget(category);
        status.observed_generation = generation;

        if category != ErrorCategory::Permanent {
            status.retry_count = status.retry_count.saturating_add(1);
            if status.retry_count < status.max_retries {
                let delay = self.delay_for(status.retry_count);
                status.phase = Phase::Error;
                status.next_retry_at = chrono::Duration::from_std(delay)
                    .ok()
                    .and_then(|d| now.checked_add_signed(d));
                return FailureOutcome::Retry(delay);
            }
        }

        status.phase = Phase::Failed;
        status.failed_at = Some(now);
        status.next_retry_at = None;
        FailureOutcome::Failed
    }
}

/// Whether a `Failed` record has seen a spec change since it failed.
pub fn should_reset(record: &ManagedRecord) -> bool {
    record.status.phase == Phase::Failed && record.generation > record.status.observed_generation
}

/// `Failed -> Pending`, with every failure field cleared.
pub fn reset_failed(status: &mut RecordStatus) {
    status.phase = Phase::Pending;
    status.clear_failure();
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_core::{ExternalId, RecordKey, ResourceType};
    use rstest::rstest;

    #[rstest]
    #[case(1, 10)]
    #[case(2, 20)]
    #[case(3, 40)]
    #[case(4, 80)]
    #[case(5, 160)]
    #[case(6, 300)]
    #[case(60, 300)]
    fn default_backoff_sequence(#[case] retry_count: u32, #[case] secs: u64) {
        assert_eq!(
            BackoffPolicy::default().delay_for(retry_count),
            Duration::from_secs(secs)
        );
    }

    #[test]
    fn permanent_fails_immediately() {
        let mut status = RecordStatus::default();
        let outcome = BackoffPolicy::default().record_failure(
            &mut status,
            ErrorCategory::Permanent,
            "zone not found",
            7,
            Utc::now(),
        );
        assert_eq!(outcome, FailureOutcome::Failed);
        assert_eq!(status.phase, Phase::Failed);
        assert_eq!(status.retry_count, 0);
        assert_eq!(status.observed_generation, 7);
        assert!(status.failed_at.is_some());
        assert_eq!(status.failure_reason.as_deref(), Some("zone not found"));
    }

    #[test]
    fn transient_retries_until_budget_then_fails() {
        let policy = BackoffPolicy::default();
        let mut status = RecordStatus::default();
        let now = Utc::now();

        let mut delays = Vec::new();
        loop {
            match policy.record_failure(&mut status, ErrorCategory::Transient, "503", 1, now) {
                FailureOutcome::Retry(d) => {
                    assert_eq!(status.phase, Phase::Error);
                    assert!(status.next_retry_at.is_some());
                    delays.push(d.as_secs());
                }
                FailureOutcome::Failed => break,
            }
        }
        assert_eq!(delays, [10, 20, 40, 80]);
        assert_eq!(status.phase, Phase::Failed);
        assert_eq!(status.retry_count, 5);
        assert_eq!(status.next_retry_at, None);
    }

    #[test]
    fn unknown_uses_smaller_budget() {
        let policy = BackoffPolicy::default();
        let mut status = RecordStatus::default();
        let mut retries = 0;
        while let FailureOutcome::Retry(_) =
            policy.record_failure(&mut status, ErrorCategory::Unknown, "odd", 1, Utc::now())
        {
            retries += 1;
        }
        assert_eq!(retries, 2);
        assert_eq!(status.max_retries, 3);
    }

    #[test]
    fn next_retry_at_is_now_plus_delay() {
        let now = Utc::now();
        let mut status = RecordStatus::default();
        BackoffPolicy::default().record_failure(&mut status, ErrorCategory::Transient, "x", 0, now);
        assert_eq!(status.next_retry_at, Some(now + chrono::Duration::seconds(10)));
    }

    #[test]
    fn failed_resets_only_after_generation_bump() {
        let mut record = ManagedRecord::new(
            RecordKey::from("r"),
            ResourceType::from("kind"),
            ExternalId::from("x"),
        );
        record.generation = 3;
        BackoffPolicy::default().record_failure(
            &mut record.status,
            ErrorCategory::Permanent,
            "bad",
            record.generation,
            Utc::now(),
        );
        assert!(!should_reset(&record));

        record.generation = 4;
        assert!(should_reset(&record));
        reset_failed(&mut record.status);
        assert_eq!(record.status.phase, Phase::Pending);
        assert_eq!(record.status.retry_count, 0);
        assert_eq!(record.status.failure_reason, None);
        assert_eq!(record.status.error_category, None);
        assert_eq!(record.status.failed_at, None);
    }
}
