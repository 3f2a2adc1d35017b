//! Turn Recovery Policy: classify a pre-stream error (one raised before
//! any chunk of the conversation stream has been read) into a retry
//! strategy, kept as a pure function over the error and attempt count so
//! it can be property-tested without a real conversation service.

use std::time::Duration;

use crate::error::PreStreamError;
use crate::util::backoff;

const MAX_TRANSIENT_RETRIES: u32 = 3;
const MAX_CONVERSATION_BUSY_RETRIES: u32 = 1;
const CONVERSATION_BUSY_DELAY: Duration = Duration::from_millis(2500);
const TRANSIENT_BASE: Duration = Duration::from_secs(1);
const TRANSIENT_CAP: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Refetch pending approvals and re-run classification; the cloud
    /// resend will carry them.
    ResolveApprovalPending,
    RetryTransient { delay: Duration, attempt: u32, max_attempts: u32 },
    RetryConversationBusy { delay: Duration, attempt: u32, max_attempts: u32 },
    Fatal,
}

/// `attempt` is the number of retries already made for this error kind
/// (0 on first occurrence).
pub fn classify(error: &PreStreamError, attempt: u32) -> RecoveryAction {
    match error {
        PreStreamError::ApprovalsPending => RecoveryAction::ResolveApprovalPending,
        PreStreamError::ConversationBusy => {
            if attempt >= MAX_CONVERSATION_BUSY_RETRIES {
                RecoveryAction::Fatal
            } else {
                RecoveryAction::RetryConversationBusy {
                    delay: CONVERSATION_BUSY_DELAY,
                    attempt: attempt + 1,
                    max_attempts: MAX_CONVERSATION_BUSY_RETRIES,
                }
            }
        }
        PreStreamError::Transient(_) => retry_transient(attempt, None),
        PreStreamError::HttpStatus(status, _, retry_after) if is_retryable_status(*status) => {
            retry_transient(attempt, *retry_after)
        }
        PreStreamError::HttpStatus(..) => RecoveryAction::Fatal,
        PreStreamError::Fatal(_) => RecoveryAction::Fatal,
    }
}

fn retry_transient(attempt: u32, retry_after: Option<Duration>) -> RecoveryAction {
    if attempt >= MAX_TRANSIENT_RETRIES {
        return RecoveryAction::Fatal;
    }
    let delay = retry_after.unwrap_or_else(|| backoff(attempt + 1, TRANSIENT_BASE, TRANSIENT_CAP));
    RecoveryAction::RetryTransient {
        delay,
        attempt: attempt + 1,
        max_attempts: MAX_TRANSIENT_RETRIES,
    }
}

fn is_retryable_status(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn approvals_pending_always_resolves() {
        let action = classify(&PreStreamError::ApprovalsPending, 0);
        assert_eq!(action, RecoveryAction::ResolveApprovalPending);
    }

    #[test]
    fn conversation_busy_retries_once_then_fatal() {
        let first = classify(&PreStreamError::ConversationBusy, 0);
        assert!(matches!(first, RecoveryAction::RetryConversationBusy { attempt: 1, .. }));
        let second = classify(&PreStreamError::ConversationBusy, 1);
        assert_eq!(second, RecoveryAction::Fatal);
    }

    #[test]
    fn transient_retries_up_to_three_times() {
        for attempt in 0..3 {
            let action = classify(&PreStreamError::Transient("drop".to_string()), attempt);
            assert!(matches!(action, RecoveryAction::RetryTransient { .. }), "attempt {attempt}");
        }
        let exhausted = classify(&PreStreamError::Transient("drop".to_string()), 3);
        assert_eq!(exhausted, RecoveryAction::Fatal);
    }

    #[test]
    fn http_5xx_is_retryable_with_retry_after_override() {
        let error = PreStreamError::HttpStatus(503, "unavailable".to_string(), Some(Duration::from_secs(7)));
        let action = classify(&error, 0);
        assert_eq!(
            action,
            RecoveryAction::RetryTransient {
                delay: Duration::from_secs(7),
                attempt: 1,
                max_attempts: MAX_TRANSIENT_RETRIES,
            }
        );
    }

    #[test]
    fn http_4xx_other_than_429_is_fatal() {
        let error = PreStreamError::HttpStatus(403, "forbidden".to_string(), None);
        assert_eq!(classify(&error, 0), RecoveryAction::Fatal);
    }

    #[test]
    fn explicit_fatal_is_fatal() {
        assert_eq!(classify(&PreStreamError::Fatal("boom".to_string()), 0), RecoveryAction::Fatal);
    }
}
