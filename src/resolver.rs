//! User actions: locally optimistic, server-confirmed.
//!
//! Every operation mutates the store first (visible to the next `snapshot()`
//! synchronously), then issues the backend call. A failure rolls the local
//! mutation back and returns a typed error for the caller to display, never
//! silently swallowed. A response that arrives after a newer action for the
//! same id is discarded as [`ActionOutcome::Stale`], which is not an error.
//!
//! Rollbacks go through the store's confirmed floors, so a failed action
//! never reverts state an authoritative delivery vouched for in flight.

use std::sync::Arc;

use crate::backend::{Backend, BackendError};
use crate::logging;
use crate::protocol::{RelationshipStatus, Resolution};
use crate::state::{FeedEvent, FeedSender, SharedStore};
use crate::store::MergeStore;

/// How a completed resolver call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionOutcome {
    /// The server confirmed the optimistic mutation.
    Confirmed,
    /// A newer action for the same id was issued while this one was in
    /// flight; the response was discarded.
    Stale,
}

#[derive(Debug)]
pub enum ActionError {
    /// No notification with the given id (or owning the given request).
    NotFound(String),
    /// The notification exists but carries no pending request action.
    NotActionable(String),
    /// The backend call failed or timed out; the local mutation was rolled
    /// back. Recoverable; surface for a user-visible retry.
    Failed(BackendError),
}

impl std::fmt::Display for ActionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionError::NotFound(id) => write!(f, "no notification for {id}"),
            ActionError::NotActionable(id) => {
                write!(f, "notification {id} has no pending request action")
            }
            ActionError::Failed(error) => write!(f, "action failed: {error}"),
        }
    }
}

impl std::error::Error for ActionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ActionError::Failed(error) => Some(error),
            _ => None,
        }
    }
}

impl From<BackendError> for ActionError {
    fn from(error: BackendError) -> Self {
        ActionError::Failed(error)
    }
}

/// Applies read/resolution/delete actions against the store and the backend.
#[derive(Clone)]
pub struct Resolver {
    store: SharedStore,
    backend: Arc<dyn Backend>,
    events: FeedSender,
}

impl Resolver {
    pub fn new(store: SharedStore, backend: Arc<dyn Backend>, events: FeedSender) -> Self {
        Self {
            store,
            backend,
            events,
        }
    }

    fn notify_updated(&self, store: &MergeStore, id: &str) {
        let _ = self.events.send(FeedEvent::Updated { id: id.to_string() });
        let _ = self.events.send(FeedEvent::Unread {
            count: store.unread_count(),
        });
    }

    /// Optimistic `read = true`, confirmed by the backend; reverted on
    /// failure unless an authoritative delivery confirmed the read in flight.
    pub async fn mark_read(&self, id: &str) -> Result<ActionOutcome, ActionError> {
        let seq = {
            let mut store = self.store.lock().await;
            if store.get(id).is_none() {
                return Err(ActionError::NotFound(id.to_string()));
            }
            let seq = store.begin_action(id);
            if store.mark_read(id) {
                self.notify_updated(&store, id);
            }
            seq
        };

        match self.backend.mark_read(id).await {
            Ok(()) => {
                let mut store = self.store.lock().await;
                if !store.is_latest_action(id, seq) {
                    crate::mlog!(
                        "resolver: stale mark-read response for {}, discarding",
                        logging::notif_id(id)
                    );
                    return Ok(ActionOutcome::Stale);
                }
                store.confirm_read(id);
                Ok(ActionOutcome::Confirmed)
            }
            Err(error) => {
                let mut store = self.store.lock().await;
                if store.is_latest_action(id, seq) && store.revert_read(id) {
                    crate::mlog!(
                        "resolver: rolled back read state for {}",
                        logging::notif_id(id)
                    );
                    self.notify_updated(&store, id);
                }
                Err(ActionError::Failed(error))
            }
        }
    }

    /// Optimistic sweep of every unread record, confirmed by one backend
    /// call; the swept ids are reverted on failure.
    pub async fn mark_all_read(&self) -> Result<ActionOutcome, ActionError> {
        let swept: Vec<String> = {
            let mut store = self.store.lock().await;
            let ids: Vec<String> = store
                .snapshot()
                .into_iter()
                .filter(|r| !r.read)
                .map(|r| r.id)
                .collect();
            for id in &ids {
                if store.mark_read(id) {
                    let _ = self.events.send(FeedEvent::Updated { id: id.clone() });
                }
            }
            if !ids.is_empty() {
                let _ = self.events.send(FeedEvent::Unread {
                    count: store.unread_count(),
                });
            }
            ids
        };

        if swept.is_empty() {
            return Ok(ActionOutcome::Confirmed);
        }

        match self.backend.mark_all_read().await {
            Ok(()) => {
                let mut store = self.store.lock().await;
                for id in &swept {
                    store.confirm_read(id);
                }
                Ok(ActionOutcome::Confirmed)
            }
            Err(error) => {
                let mut store = self.store.lock().await;
                let mut reverted = 0usize;
                for id in &swept {
                    if store.revert_read(id) {
                        reverted += 1;
                        let _ = self.events.send(FeedEvent::Updated { id: id.clone() });
                    }
                }
                if reverted > 0 {
                    crate::mlog!("resolver: rolled back {} read sweep entr(ies)", reverted);
                    let _ = self.events.send(FeedEvent::Unread {
                        count: store.unread_count(),
                    });
                }
                Err(ActionError::Failed(error))
            }
        }
    }

    /// Accept the friend request behind `request_id`.
    pub async fn accept(&self, request_id: &str) -> Result<ActionOutcome, ActionError> {
        self.decide(request_id, true).await
    }

    /// Decline the friend request behind `request_id`.
    pub async fn decline(&self, request_id: &str) -> Result<ActionOutcome, ActionError> {
        self.decide(request_id, false).await
    }

    async fn decide(&self, request_id: &str, accept: bool) -> Result<ActionOutcome, ActionError> {
        let resolution = if accept {
            Resolution::Accepted
        } else {
            Resolution::Declined
        };
        let optimistic_status = if accept {
            RelationshipStatus::Accepted
        } else {
            RelationshipStatus::Declined
        };

        let (notif_id, seq) = {
            let mut store = self.store.lock().await;
            let Some(record) = store.find_by_subject(request_id) else {
                return Err(ActionError::NotFound(request_id.to_string()));
            };
            if !record.is_actionable() {
                return Err(ActionError::NotActionable(record.id));
            }
            let notif_id = record.id;
            let seq = store.begin_action(&notif_id);
            // Both the owning notification and the paired relationship row
            // move together, optimistically.
            if store.set_resolution(&notif_id, resolution) {
                self.notify_updated(&store, &notif_id);
            }
            store.set_request_status(request_id, optimistic_status);
            (notif_id, seq)
        };

        let result = if accept {
            self.backend.accept_request(request_id).await
        } else {
            self.backend.decline_request(request_id).await
        };

        match result {
            Ok(status) => {
                let mut store = self.store.lock().await;
                if !store.is_latest_action(&notif_id, seq) {
                    crate::mlog!(
                        "resolver: stale {} response for {}, discarding",
                        if accept { "accept" } else { "decline" },
                        logging::notif_id(&notif_id)
                    );
                    return Ok(ActionOutcome::Stale);
                }
                store.confirm_resolution(&notif_id, resolution);
                store.confirm_request(request_id, status);
                Ok(ActionOutcome::Confirmed)
            }
            Err(error) => {
                let mut store = self.store.lock().await;
                if store.is_latest_action(&notif_id, seq) {
                    store.revert_request(request_id);
                    if store.revert_resolution(&notif_id) {
                        crate::mlog!(
                            "resolver: rolled back resolution for {}",
                            logging::notif_id(&notif_id)
                        );
                        self.notify_updated(&store, &notif_id);
                    }
                }
                Err(ActionError::Failed(error))
            }
        }
    }

    /// Optimistic removal; the tombstone is re-inserted on failure (ordering
    /// by `created_at` recovers its original position).
    pub async fn delete(&self, id: &str) -> Result<ActionOutcome, ActionError> {
        let (tombstone, seq) = {
            let mut store = self.store.lock().await;
            let Some(tombstone) = store.remove(id) else {
                return Err(ActionError::NotFound(id.to_string()));
            };
            let seq = store.begin_action(id);
            let _ = self.events.send(FeedEvent::Removed { id: id.to_string() });
            let _ = self.events.send(FeedEvent::Unread {
                count: store.unread_count(),
            });
            (tombstone, seq)
        };

        match self.backend.delete_notification(id).await {
            Ok(()) => {
                let store = self.store.lock().await;
                if !store.is_latest_action(id, seq) {
                    return Ok(ActionOutcome::Stale);
                }
                Ok(ActionOutcome::Confirmed)
            }
            Err(error) => {
                let mut store = self.store.lock().await;
                if store.is_latest_action(id, seq) {
                    store.upsert(tombstone);
                    crate::mlog!(
                        "resolver: delete failed, restored {}",
                        logging::notif_id(id)
                    );
                    self.notify_updated(&store, id);
                }
                Err(ActionError::Failed(error))
            }
        }
    }
}
