//! Pending Approval Recovery (C14): after a reconnect, the cloud may
//! report a conversation sitting on tool calls nobody ever decided
//! because the previous connection dropped mid-approval. This module
//! holds the bits of that recovery flow that don't need a live control
//! channel: converting the conversation service's `PendingApproval`
//! list into the shapes the classifier already knows how to judge, and
//! a latch so a second `recover_pending_approvals` request arriving
//! mid-recovery is a no-op instead of racing the first.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use crate::classifier::ApprovalRequest;
use crate::classifier::ClassificationOutcome;
use crate::classifier::ClassifierOptions;
use crate::classifier::classify;
use crate::conversation::PendingApproval;
use crate::engine::EngineContext;

pub fn pending_approvals_to_requests(pending: &[PendingApproval]) -> Vec<ApprovalRequest> {
    pending
        .iter()
        .map(|p| ApprovalRequest {
            tool_call_id: p.tool_call_id.clone(),
            tool_name: p.tool_name.clone(),
            tool_args_json: p.tool_args_json.clone(),
        })
        .collect()
}

pub fn classify_recovered(pending: &[PendingApproval], ctx: &EngineContext<'_>, opts: &ClassifierOptions<'_>) -> ClassificationOutcome {
    let requests = pending_approvals_to_requests(pending);
    classify(&requests, ctx, opts)
}

/// Prevents two concurrent recovery runs for the same runtime: a second
/// `RecoverPendingApprovals` frame arriving while one is already
/// in-flight is dropped rather than double-submitting tool results.
#[derive(Debug, Default)]
pub struct RecoveryLatch(AtomicBool);

impl RecoveryLatch {
    /// Returns `true` if this call acquired the latch.
    pub fn try_begin(&self) -> bool {
        !self.0.swap(true, Ordering::SeqCst)
    }

    pub fn end(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latch_rejects_concurrent_acquisition() {
        let latch = RecoveryLatch::default();
        assert!(latch.try_begin());
        assert!(!latch.try_begin());
        latch.end();
        assert!(latch.try_begin());
    }

    #[test]
    fn pending_approvals_to_requests_preserves_order() {
        let pending = vec![
            PendingApproval { tool_call_id: "a".to_string(), tool_name: Some("Bash".to_string()), tool_args_json: Some("{}".to_string()) },
            PendingApproval { tool_call_id: "b".to_string(), tool_name: None, tool_args_json: None },
        ];
        let requests = pending_approvals_to_requests(&pending);
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].tool_call_id, "a");
        assert_eq!(requests[1].tool_call_id, "b");
    }
}
