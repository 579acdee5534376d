//! Shared handles and the feed-event types broadcast to the embedding UI.

use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};

use crate::store::MergeStore;

/// Events broadcast to feed subscribers. One is emitted whenever
/// `snapshot()` would return a different result, plus the live-channel
/// status edges for an optional "reconnecting" indicator.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedEvent {
    Updated { id: String },
    Removed { id: String },
    Unread { count: usize },
    Channel { connected: bool },
}

/// The merge store behind its single lock. All components other than the
/// normalizer touch notification state only through this handle.
pub type SharedStore = Arc<Mutex<MergeStore>>;

pub type FeedSender = broadcast::Sender<FeedEvent>;

pub fn shared_store() -> SharedStore {
    Arc::new(Mutex::new(MergeStore::new()))
}
