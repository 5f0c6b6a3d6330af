//! Per-record fault isolation: classify a failed attempt, retry transient ones with
//! exponential backoff, and turn everything else into a quarantined outcome.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use lmig_core::{ErrorClass, FailureStage, RecordOutcome};
use lmig_storage::{classify_message, BackoffPolicy, RetryDisposition, StoreError};
use thiserror::Error;
use tracing::{debug, warn};

use crate::workflow::WorkflowLocked;

pub const MAX_RETRIES: usize = 3;
pub const BASE_DELAY_MS: u64 = 200;

const MAX_CODE_LEN: usize = 64;

#[derive(Debug, Clone, Error)]
pub enum StageErrorKind {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Workflow(#[from] WorkflowLocked),
    /// Data the pipeline refuses to load as-is.
    #[error("{code}: {message}")]
    Rejected { code: String, message: String },
    #[error("pipeline panicked: {0}")]
    Panicked(String),
    #[error("{0}")]
    Other(String),
}

/// A failed record attempt, tagged with the stage it failed in when known.
#[derive(Debug, Clone)]
pub struct StageError {
    pub stage: Option<FailureStage>,
    pub kind: StageErrorKind,
}

impl fmt::Display for StageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.stage {
            Some(stage) => write!(f, "{stage} stage failed: {}", self.kind),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl std::error::Error for StageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.kind)
    }
}

impl StageError {
    pub fn new(stage: FailureStage, kind: impl Into<StageErrorKind>) -> Self {
        Self {
            stage: Some(stage),
            kind: kind.into(),
        }
    }

    pub fn rejected(stage: FailureStage, code: &str, message: impl Into<String>) -> Self {
        Self::new(
            stage,
            StageErrorKind::Rejected {
                code: code.to_string(),
                message: message.into(),
            },
        )
    }

    pub fn other(stage: FailureStage, message: impl Into<String>) -> Self {
        Self::new(stage, StageErrorKind::Other(message.into()))
    }

    pub fn store(stage: FailureStage) -> impl FnOnce(StoreError) -> Self {
        move |err| Self::new(stage, err)
    }

    fn panicked(message: String) -> Self {
        Self {
            stage: None,
            kind: StageErrorKind::Panicked(message),
        }
    }
}

/// How a failed attempt is reported and whether it may be retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classified {
    pub class: ErrorClass,
    pub code: String,
    pub stage: FailureStage,
    pub message: String,
}

pub fn classify(err: &StageError) -> Classified {
    let message = err.kind.to_string();
    let (class, code) = match &err.kind {
        StageErrorKind::Store(store) => {
            let class = match store.disposition() {
                RetryDisposition::Retryable => ErrorClass::Transient,
                RetryDisposition::NonRetryable => ErrorClass::Permanent,
            };
            let code = store
                .code()
                .map(ToString::to_string)
                .unwrap_or_else(|| short_code(store.message()));
            (class, code)
        }
        StageErrorKind::Workflow(_) => (ErrorClass::Permanent, "WORKFLOW_LOCKED".to_string()),
        StageErrorKind::Rejected { code, .. } => (ErrorClass::Permanent, code.clone()),
        StageErrorKind::Panicked(_) => (ErrorClass::Permanent, "PANIC".to_string()),
        StageErrorKind::Other(msg) => {
            let class = match classify_message(msg) {
                RetryDisposition::Retryable => ErrorClass::Transient,
                RetryDisposition::NonRetryable => ErrorClass::Permanent,
            };
            (class, short_code(msg))
        }
    };
    Classified {
        class,
        code,
        stage: err.stage.unwrap_or(FailureStage::Load),
        message,
    }
}

fn short_code(message: &str) -> String {
    let trimmed = message.trim();
    if trimmed.is_empty() {
        return "UNKNOWN".to_string();
    }
    trimmed.chars().take(MAX_CODE_LEN).collect()
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct OutcomeWrapper {
    backoff: BackoffPolicy,
}

impl Default for OutcomeWrapper {
    fn default() -> Self {
        Self::new(BackoffPolicy {
            max_retries: MAX_RETRIES,
            base_delay: std::time::Duration::from_millis(BASE_DELAY_MS),
            ..BackoffPolicy::default()
        })
    }
}

impl OutcomeWrapper {
    pub fn new(backoff: BackoffPolicy) -> Self {
        Self { backoff }
    }

    pub fn backoff(&self) -> BackoffPolicy {
        self.backoff
    }

    /// Run `attempt` (called with the 0-based attempt index) until it succeeds, fails
    /// permanently, or exhausts its retries. Never returns an error and never unwinds.
    pub async fn run<F, Fut>(&self, entity_type: &str, legacy_id: &str, mut attempt: F) -> RecordOutcome
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<RecordOutcome, StageError>>,
    {
        let mut n: usize = 0;
        loop {
            let result = AssertUnwindSafe(async { attempt(n as u32).await })
                .catch_unwind()
                .await;
            let err = match result {
                Ok(Ok(outcome)) => return outcome,
                Ok(Err(err)) => err,
                Err(payload) => StageError::panicked(panic_message(payload.as_ref())),
            };

            let classified = classify(&err);
            if classified.class == ErrorClass::Transient && n < self.backoff.max_retries {
                let delay = self.backoff.delay_for_attempt(n);
                debug!(
                    entity_type,
                    legacy_id,
                    attempt = n + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient record failure; retrying"
                );
                tokio::time::sleep(delay).await;
                n += 1;
                continue;
            }

            warn!(
                entity_type,
                legacy_id,
                attempts = n + 1,
                class = classified.class.as_str(),
                code = %classified.code,
                stage = classified.stage.as_str(),
                "record quarantined: {}",
                classified.message
            );
            return RecordOutcome::quarantined(
                entity_type,
                legacy_id,
                classified.class,
                classified.code,
                classified.stage,
                Some(classified.message),
            )
            .with_attempts(n as u32 + 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lmig_core::OutcomeStatus;
    use lmig_storage::codes;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use uuid::Uuid;

    #[test]
    fn store_codes_and_messages_classify_as_expected() {
        let transient = [
            codes::SERIALIZATION_FAILURE,
            codes::DEADLOCK_DETECTED,
            codes::QUERY_CANCELED,
            codes::LOCK_NOT_AVAILABLE,
            codes::CONNECTION_FAILURE,
        ];
        for code in transient {
            let c = classify(&StageError::new(
                FailureStage::Load,
                StoreError::status(code, "boom"),
            ));
            assert_eq!(c.class, ErrorClass::Transient, "{code}");
            assert_eq!(c.code, code);
        }

        let unique = classify(&StageError::new(
            FailureStage::Reserve,
            StoreError::status(codes::UNIQUE_VIOLATION, "duplicate key"),
        ));
        assert_eq!(unique.class, ErrorClass::Permanent);
        assert_eq!(unique.stage, FailureStage::Reserve);

        let timeout = classify(&StageError::other(FailureStage::Snapshot, "operation timed out"));
        assert_eq!(timeout.class, ErrorClass::Transient);
        assert_eq!(timeout.code, "operation timed out");

        let blank = classify(&StageError {
            stage: None,
            kind: StageErrorKind::Other("   ".into()),
        });
        assert_eq!(blank.code, "UNKNOWN");
        assert_eq!(blank.stage, FailureStage::Load);
    }

    #[test]
    fn workflow_lock_is_permanent() {
        let locked = WorkflowLocked {
            entity_type: "invoice".into(),
            target_id: Uuid::nil(),
            verb: "migrate".into(),
            state: "approved".into(),
        };
        let c = classify(&StageError::new(FailureStage::Load, locked));
        assert_eq!(c.class, ErrorClass::Permanent);
        assert_eq!(c.code, "WORKFLOW_LOCKED");
    }

    #[tokio::test(start_paused = true)]
    async fn always_transient_is_quarantined_after_four_attempts() {
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();
        let outcome = OutcomeWrapper::default()
            .run("customer", "C-1", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<RecordOutcome, _>(StageError::new(FailureStage::Load, StoreError::serialization_failure("conflict"))) }
            })
            .await;

        assert_eq!(outcome.status, OutcomeStatus::Quarantined);
        assert_eq!(outcome.error_class, Some(ErrorClass::Transient));
        assert_eq!(outcome.error_code.as_deref(), Some(codes::SERIALIZATION_FAILURE));
        assert_eq!(outcome.failure_stage, Some(FailureStage::Load));
        assert_eq!(outcome.attempts, 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(started.elapsed() >= Duration::from_millis(1400));
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failure_is_not_retried() {
        let calls = AtomicU32::new(0);
        let outcome = OutcomeWrapper::default()
            .run("customer", "C-2", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<RecordOutcome, _>(StageError::rejected(FailureStage::Transform, "REQUIRED_FIELD_MISSING", "email")) }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.error_class, Some(ErrorClass::Permanent));
        assert_eq!(outcome.error_code.as_deref(), Some("REQUIRED_FIELD_MISSING"));
        assert_eq!(outcome.failure_stage, Some(FailureStage::Transform));
    }

    #[tokio::test(start_paused = true)]
    async fn success_after_retry_passes_through_unchanged() {
        let id = Uuid::new_v4();
        let outcome = OutcomeWrapper::default()
            .run("customer", "C-3", |n| async move {
                if n < 2 {
                    Err(StageError::new(FailureStage::Load, StoreError::Connection("reset".into())))
                } else {
                    Ok(RecordOutcome::migrated("customer", "C-3", id).with_attempts(n + 1))
                }
            })
            .await;
        assert_eq!(outcome, RecordOutcome::migrated("customer", "C-3", id).with_attempts(3));
    }

    #[tokio::test]
    async fn panic_inside_the_pipeline_is_quarantined() {
        let outcome = OutcomeWrapper::default()
            .run("customer", "C-4", |_| async {
                if true {
                    panic!("unexpected shape");
                }
                Ok::<_, StageError>(RecordOutcome::migrated("customer", "C-4", Uuid::nil()))
            })
            .await;
        assert_eq!(outcome.status, OutcomeStatus::Quarantined);
        assert_eq!(outcome.error_code.as_deref(), Some("PANIC"));
        assert!(outcome.error_message.unwrap().contains("unexpected shape"));
    }
}
