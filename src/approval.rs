//! Approval Gate: `NONE_REQUIRED | PENDING_APPROVAL -> {APPROVED | DENIED}`.
//!
//! A request waiting for approval is invisible to the Beat. Approval makes it
//! dispatchable (and dispatches it right away if it is an already-due
//! one-shot); denial is terminal and no execution is ever created for it.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use crate::config::{Capability, Principal};
use crate::dispatch::Dispatcher;
use crate::error::{JobplaneError, Result};
use crate::store::models::{ApprovalState, ExecutionRequest, ExecutionResult};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApprovalOutcome {
    pub request: ExecutionRequest,
    /// Set when approval dispatched a due one-shot request.
    pub dispatched: Option<ExecutionResult>,
}

pub struct ApprovalGate {
    dispatcher: Arc<Dispatcher>,
}

impl ApprovalGate {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    async fn pending(&self, principal: &Principal, request_id: &Uuid) -> Result<ExecutionRequest> {
        principal.require(Capability::Approve)?;
        let request = self
            .dispatcher
            .store()
            .get_request(request_id)
            .await
            .ok_or_else(|| JobplaneError::NotFound(format!("execution request {}", request_id)))?;
        if request.approval != ApprovalState::PendingApproval {
            return Err(JobplaneError::Conflict(format!(
                "execution request {} is {}",
                request_id, request.approval
            )));
        }
        Ok(request)
    }

    pub async fn approve(&self, principal: &Principal, request_id: &Uuid) -> Result<ApprovalOutcome> {
        let request = self.pending(principal, request_id).await?;
        if request.principal == principal.name && !principal.can(Capability::ApproveOwn) {
            return Err(JobplaneError::Forbidden(format!(
                "{} cannot approve their own request",
                principal.name
            )));
        }

        let now = Utc::now();
        let due_one_shot = !request.recurrence.is_recurring()
            && request.enabled
            && !request.fired
            && request.next_due_at.is_some_and(|due| due <= now);
        if due_one_shot {
            // Leave the request pending if it could not run right now.
            self.dispatcher.check_request(&request).await?;
        }

        let approver = principal.name.clone();
        let request = self
            .dispatcher
            .store()
            .update_request(request_id, request.version, |r| {
                r.approval = ApprovalState::Approved;
                r.approved_by = Some(approver);
                r.approved_at = Some(now);
            })
            .await?;
        tracing::info!(
            request_id = %request_id,
            class_path = %request.class_path,
            approved_by = %principal.name,
            "Execution request approved"
        );

        let mut dispatched = None;
        if due_one_shot && request.is_due(now) {
            if let Some(due) = request.next_due_at {
                let store = self.dispatcher.store();
                if store.claim_due(request_id, due, None).await? {
                    match self.dispatcher.dispatch_request(&request).await {
                        Ok(result) => dispatched = Some(result),
                        // The failed execution is already recorded.
                        Err(e @ JobplaneError::Dispatch(_)) => return Err(e),
                        Err(e) => {
                            tracing::warn!(
                                request_id = %request_id,
                                class_path = %request.class_path,
                                error = %e,
                                "Approved request not dispatched; left due for the Beat"
                            );
                            store
                                .release_claim(request_id, due, request.last_dispatched_at)
                                .await?;
                        }
                    }
                }
            }
        }

        let request = self
            .dispatcher
            .store()
            .get_request(request_id)
            .await
            .unwrap_or(request);
        Ok(ApprovalOutcome {
            request,
            dispatched,
        })
    }

    pub async fn deny(&self, principal: &Principal, request_id: &Uuid) -> Result<ExecutionRequest> {
        let request = self.pending(principal, request_id).await?;
        let now = Utc::now();
        let decider = principal.name.clone();
        let request = self
            .dispatcher
            .store()
            .update_request(request_id, request.version, |r| {
                r.approval = ApprovalState::Denied;
                r.approved_by = Some(decider);
                r.approved_at = Some(now);
                r.enabled = false;
                r.next_due_at = None;
            })
            .await?;
        tracing::info!(
            request_id = %request_id,
            class_path = %request.class_path,
            denied_by = %principal.name,
            "Execution request denied"
        );
        Ok(request)
    }
}
