//! PermissionBroker - correlates agent permission requests with user decisions.
//!
//! # Flow
//!
//! 1. The agent sends `session/request_permission`; the adapter calls `request()`
//! 2. The broker stores a oneshot sender under a fresh request ID
//! 3. A `permission_requested` update is dispatched so the UI can render options
//! 4. The request awaits the oneshot receiver (no timeout)
//! 5. The UI calls `respond()` with the chosen option or `"cancelled"`
//! 6. On teardown, `cancel_all()` resolves every pending request as cancelled

use std::collections::HashMap;

use tokio::sync::{oneshot, Mutex};
use uuid::Uuid;

use crate::api::types::{
    PermissionOption, PermissionOutcome, PermissionRequestId, SessionId, SessionUpdate,
};
use crate::runtime::dispatcher::SessionUpdateDispatcher;

/// Option ID the UI sends to decline without picking an option.
pub const CANCELLED_OPTION_ID: &str = "cancelled";

/// A permission request from the agent.
#[derive(Debug, Clone)]
pub struct PermissionRequest {
    pub session_id: Option<SessionId>,
    /// The tool call the agent wants to run, forwarded opaquely to the UI
    pub tool_call: serde_json::Value,
    pub options: Vec<PermissionOption>,
}

/// Pending permission requests keyed by request ID.
pub struct PermissionBroker {
    dispatcher: SessionUpdateDispatcher,
    pending: Mutex<HashMap<PermissionRequestId, oneshot::Sender<PermissionOutcome>>>,
}

impl PermissionBroker {
    pub fn new(dispatcher: SessionUpdateDispatcher) -> Self {
        Self {
            dispatcher,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Ask the user and wait for the decision.
    ///
    /// Resolves as `Cancelled` if the broker is torn down first.
    pub async fn request(&self, request: PermissionRequest) -> PermissionOutcome {
        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();

        {
            let mut pending = self.pending.lock().await;
            pending.insert(request_id.clone(), tx);
        }

        log::debug!(
            "Permission requested: request_id={request_id}, options={}",
            request.options.len()
        );

        self.dispatcher.publish(
            request.session_id,
            SessionUpdate::PermissionRequested {
                request_id: request_id.clone(),
                tool_call: request.tool_call,
                options: request.options,
            },
        );

        match rx.await {
            Ok(outcome) => {
                log::debug!(
                    "Permission decision received: request_id={request_id}, outcome={outcome:?}"
                );
                outcome
            }
            Err(_) => {
                log::warn!("Permission channel dropped without response: request_id={request_id}");
                PermissionOutcome::Cancelled
            }
        }
    }

    /// Deliver the user's decision.
    ///
    /// Unknown or already resolved IDs are ignored with a warning.
    /// Returns whether a pending request was resolved.
    pub async fn respond(&self, request_id: &str, option_id: &str) -> bool {
        let sender = {
            let mut pending = self.pending.lock().await;
            pending.remove(request_id)
        };

        let Some(sender) = sender else {
            log::warn!("Permission respond for unknown request: request_id={request_id}");
            return false;
        };

        let outcome = if option_id == CANCELLED_OPTION_ID {
            PermissionOutcome::Cancelled
        } else {
            PermissionOutcome::Selected {
                option_id: option_id.to_string(),
            }
        };

        if sender.send(outcome).is_err() {
            log::warn!("Permission requester went away before decision: request_id={request_id}");
            return false;
        }

        log::info!("Permission responded: request_id={request_id}, option_id={option_id}");
        true
    }

    /// Resolve every pending request as cancelled. Returns how many were pending.
    pub async fn cancel_all(&self) -> usize {
        let drained: Vec<_> = {
            let mut pending = self.pending.lock().await;
            pending.drain().collect()
        };

        let count = drained.len();
        for (request_id, sender) in drained {
            if sender.send(PermissionOutcome::Cancelled).is_err() {
                log::debug!("Permission requester already gone: request_id={request_id}");
            }
        }

        if count > 0 {
            log::info!("Cancelled pending permission requests: count={count}");
        }
        count
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}
