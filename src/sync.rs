//! Sync controller: lifecycle wiring for the store, channels, and resolver.
//!
//! Orchestration only. Activation runs the initial history fetch, bulk-loads
//! the store, then starts the live channel supervisor and the listener that
//! turns its reconnect signals into supplementary gap-closing fetches.
//! Deactivation tears the channel down and discards the store; in-flight
//! resolver confirmations complete but their results are discarded through
//! the invalidated action sequences. A controller activates once; a new
//! session gets a new controller.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::backend::Backend;
use crate::channel::{ChannelConfig, ChannelState, LiveChannel, PushTransport};
use crate::config::{
    DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_CAP, DEFAULT_HISTORY_TIMEOUT, EVENTS_CHANNEL_CAPACITY,
};
use crate::protocol::{normalize, now_secs, NotificationRecord, Origin};
use crate::resolver::{ActionError, ActionOutcome, Resolver};
use crate::state::{shared_store, FeedEvent, FeedSender, SharedStore};

pub struct SyncConfig {
    /// Per-user push destination.
    pub topic: String,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub history_timeout: Duration,
    pub events_capacity: usize,
}

impl SyncConfig {
    pub fn for_user(user_id: &str) -> Self {
        Self {
            topic: crate::channel::user_topic(user_id),
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_cap: DEFAULT_BACKOFF_CAP,
            history_timeout: DEFAULT_HISTORY_TIMEOUT,
            events_capacity: EVENTS_CHANNEL_CAPACITY,
        }
    }
}

/// Fetch one history page and reconcile it into the store.
///
/// Failures are logged and reported as zero applied records; the caller's
/// feed stays usable on whatever it already has.
pub(crate) async fn fetch_and_apply(
    backend: &dyn Backend,
    store: &SharedStore,
    events: &FeedSender,
    history_timeout: Duration,
) -> usize {
    let fetched = match tokio::time::timeout(history_timeout, backend.fetch_history()).await {
        Err(_) => {
            crate::mlog!("sync: history fetch timed out");
            return 0;
        }
        Ok(Err(error)) => {
            crate::mlog!("sync: history fetch failed: {}", error);
            return 0;
        }
        Ok(Ok(raws)) => raws,
    };

    let received_at = now_secs();
    let total = fetched.len();
    let mut applied = 0usize;

    let mut store = store.lock().await;
    for raw in &fetched {
        match normalize(raw, Origin::Fetched, received_at) {
            Ok(event) => {
                let id = event.record.id.clone();
                if store.apply(event) {
                    applied += 1;
                    let _ = events.send(FeedEvent::Updated { id });
                }
            }
            Err(error) => {
                crate::mlog!("sync: dropping malformed history payload: {}", error);
            }
        }
    }
    if applied > 0 {
        let _ = events.send(FeedEvent::Unread {
            count: store.unread_count(),
        });
    }
    crate::mlog!("sync: applied {} of {} fetched notification(s)", applied, total);
    applied
}

/// The single surface the embedding UI consumes.
pub struct SyncController {
    store: SharedStore,
    backend: Arc<dyn Backend>,
    resolver: Resolver,
    events_tx: FeedSender,
    state_rx: watch::Receiver<ChannelState>,
    shutdown_tx: watch::Sender<bool>,
    history_timeout: Duration,
    channel: Option<LiveChannel>,
    refetch_rx: Option<mpsc::UnboundedReceiver<()>>,
    tasks: Vec<JoinHandle<()>>,
    active: bool,
}

impl SyncController {
    pub fn new(
        backend: Arc<dyn Backend>,
        transport: Arc<dyn PushTransport>,
        config: SyncConfig,
    ) -> Self {
        let store = shared_store();
        let (events_tx, _) = broadcast::channel(config.events_capacity);
        let (shutdown_tx, _) = watch::channel(false);

        let (channel, state_rx, refetch_rx) = LiveChannel::new(
            transport,
            store.clone(),
            events_tx.clone(),
            ChannelConfig {
                topic: config.topic,
                backoff_base: config.backoff_base,
                backoff_cap: config.backoff_cap,
            },
        );
        let resolver = Resolver::new(store.clone(), backend.clone(), events_tx.clone());

        Self {
            store,
            backend,
            resolver,
            events_tx,
            state_rx,
            shutdown_tx,
            history_timeout: config.history_timeout,
            channel: Some(channel),
            refetch_rx: Some(refetch_rx),
            tasks: Vec::new(),
            active: false,
        }
    }

    /// Initial history load, then live channel attachment.
    pub async fn activate(&mut self) {
        if self.active {
            return;
        }
        self.active = true;

        fetch_and_apply(
            &*self.backend,
            &self.store,
            &self.events_tx,
            self.history_timeout,
        )
        .await;

        let (Some(channel), Some(mut refetch_rx)) = (self.channel.take(), self.refetch_rx.take())
        else {
            return;
        };

        self.tasks
            .push(tokio::spawn(channel.run(self.shutdown_tx.subscribe())));

        let backend = self.backend.clone();
        let store = self.store.clone();
        let events = self.events_tx.clone();
        let history_timeout = self.history_timeout;
        let mut shutdown = self.shutdown_tx.subscribe();
        self.tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    signal = refetch_rx.recv() => match signal {
                        Some(()) => {
                            crate::mlog!("sync: channel re-established, fetching missed history");
                            fetch_and_apply(&*backend, &store, &events, history_timeout).await;
                        }
                        None => break,
                    }
                }
            }
        }));
    }

    /// Tear down the channel and discard the session's view.
    pub async fn deactivate(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks.drain(..) {
            task.abort();
        }
        let mut store = self.store.lock().await;
        store.clear();
        let _ = self.events_tx.send(FeedEvent::Unread { count: 0 });
    }

    // -----------------------------------------------------------------------
    // Read surface
    // -----------------------------------------------------------------------

    pub async fn snapshot(&self) -> Vec<NotificationRecord> {
        self.store.lock().await.snapshot()
    }

    pub async fn list(&self, unread_only: bool, limit: usize) -> Vec<NotificationRecord> {
        self.store.lock().await.list(unread_only, limit)
    }

    pub async fn actionable(&self) -> Vec<NotificationRecord> {
        self.store.lock().await.actionable()
    }

    pub async fn get(&self, id: &str) -> Option<NotificationRecord> {
        self.store.lock().await.get(id)
    }

    pub async fn unread_count(&self) -> usize {
        self.store.lock().await.unread_count()
    }

    pub fn channel_state(&self) -> ChannelState {
        *self.state_rx.borrow()
    }

    /// Subscribe to change notifications. An event is broadcast whenever
    /// `snapshot()` would return a different result.
    pub fn subscribe(&self) -> broadcast::Receiver<FeedEvent> {
        self.events_tx.subscribe()
    }

    // -----------------------------------------------------------------------
    // Action surface: forwards to the resolver
    // -----------------------------------------------------------------------

    pub async fn mark_read(&self, id: &str) -> Result<ActionOutcome, ActionError> {
        self.resolver.mark_read(id).await
    }

    pub async fn mark_all_read(&self) -> Result<ActionOutcome, ActionError> {
        self.resolver.mark_all_read().await
    }

    pub async fn accept(&self, request_id: &str) -> Result<ActionOutcome, ActionError> {
        self.resolver.accept(request_id).await
    }

    pub async fn decline(&self, request_id: &str) -> Result<ActionOutcome, ActionError> {
        self.resolver.decline(request_id).await
    }

    pub async fn delete(&self, id: &str) -> Result<ActionOutcome, ActionError> {
        self.resolver.delete(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendError;
    use crate::channel::{PushStream, TransportError};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use tokio::time::sleep;

    /// Backend fake serving queued history pages; the last page repeats.
    struct PagedBackend {
        pages: StdMutex<VecDeque<Vec<Value>>>,
        fetches: AtomicUsize,
    }

    impl PagedBackend {
        fn new(pages: Vec<Vec<Value>>) -> Self {
            Self {
                pages: StdMutex::new(pages.into()),
                fetches: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Backend for PagedBackend {
        async fn fetch_history(&self) -> Result<Vec<Value>, BackendError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let mut pages = self.pages.lock().unwrap();
            if pages.len() > 1 {
                Ok(pages.pop_front().unwrap_or_default())
            } else {
                Ok(pages.front().cloned().unwrap_or_default())
            }
        }

        async fn mark_read(&self, _id: &str) -> Result<(), BackendError> {
            Ok(())
        }

        async fn mark_all_read(&self) -> Result<(), BackendError> {
            Ok(())
        }

        async fn accept_request(
            &self,
            _request_id: &str,
        ) -> Result<crate::protocol::RelationshipStatus, BackendError> {
            Ok(crate::protocol::RelationshipStatus::Accepted)
        }

        async fn decline_request(
            &self,
            _request_id: &str,
        ) -> Result<crate::protocol::RelationshipStatus, BackendError> {
            Ok(crate::protocol::RelationshipStatus::Declined)
        }

        async fn delete_notification(&self, _id: &str) -> Result<(), BackendError> {
            Ok(())
        }
    }

    enum ScriptItem {
        Msg(String),
        Hang,
    }

    struct ScriptedTransport {
        sessions: StdMutex<VecDeque<Vec<ScriptItem>>>,
    }

    impl ScriptedTransport {
        fn new(sessions: Vec<Vec<ScriptItem>>) -> Self {
            Self {
                sessions: StdMutex::new(sessions.into()),
            }
        }
    }

    #[async_trait]
    impl PushTransport for ScriptedTransport {
        async fn connect(&self, _topic: &str) -> Result<Box<dyn PushStream>, TransportError> {
            let next = self.sessions.lock().unwrap().pop_front();
            match next {
                Some(items) => Ok(Box::new(ScriptedStream {
                    items: items.into_iter().collect(),
                })),
                None => {
                    futures_util::future::pending::<()>().await;
                    unreachable!()
                }
            }
        }
    }

    struct ScriptedStream {
        items: VecDeque<ScriptItem>,
    }

    #[async_trait]
    impl PushStream for ScriptedStream {
        async fn next_event(&mut self) -> Option<Result<String, TransportError>> {
            match self.items.pop_front() {
                Some(ScriptItem::Msg(text)) => Some(Ok(text)),
                Some(ScriptItem::Hang) => {
                    futures_util::future::pending::<()>().await;
                    unreachable!()
                }
                None => None,
            }
        }
    }

    fn history_payload(id: &str, created_at: u64, read: bool) -> Value {
        json!({
            "id": id,
            "kind": "message",
            "text": format!("message {id}"),
            "created_at": created_at,
            "read": read,
        })
    }

    fn test_config() -> SyncConfig {
        SyncConfig {
            backoff_base: Duration::from_millis(1),
            backoff_cap: Duration::from_millis(5),
            history_timeout: Duration::from_secs(1),
            ..SyncConfig::for_user("u-me")
        }
    }

    async fn wait_until<F>(controller: &SyncController, condition: F)
    where
        F: Fn(usize, usize) -> bool,
    {
        for _ in 0..200 {
            let len = controller.snapshot().await.len();
            let unread = controller.unread_count().await;
            if condition(len, unread) {
                return;
            }
            sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn pushed_read_update_converges_with_fetched_history() {
        let backend = Arc::new(PagedBackend::new(vec![vec![
            history_payload("a", 100, false),
            history_payload("b", 200, true),
        ]]));
        let read_update = json!({
            "notification_id": "a",
            "type": "message",
            "body": "message a",
            "timestamp": 100,
            "read": true,
        })
        .to_string();
        let transport = Arc::new(ScriptedTransport::new(vec![vec![
            ScriptItem::Msg(read_update),
            ScriptItem::Hang,
        ]]));

        let mut controller = SyncController::new(backend, transport, test_config());
        controller.activate().await;

        assert_eq!(controller.snapshot().await.len(), 2);
        wait_until(&controller, |len, unread| len == 2 && unread == 0).await;

        controller.deactivate().await;
        assert!(controller.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn reconnect_gap_is_closed_without_duplicates() {
        // The gap event "c" only exists in the second history page.
        let backend = Arc::new(PagedBackend::new(vec![
            vec![history_payload("a", 100, false)],
            vec![history_payload("a", 100, false), history_payload("c", 300, false)],
        ]));
        // First push session drops at once; the second stays up.
        let transport = Arc::new(ScriptedTransport::new(vec![vec![], vec![ScriptItem::Hang]]));

        let mut controller = SyncController::new(backend.clone(), transport, test_config());
        controller.activate().await;
        assert_eq!(controller.snapshot().await.len(), 1);

        wait_until(&controller, |len, _| len == 2).await;
        let ids: Vec<String> = controller
            .snapshot()
            .await
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["c", "a"]);
        assert!(backend.fetches.load(Ordering::SeqCst) >= 2);

        controller.deactivate().await;
    }

    #[tokio::test]
    async fn fetch_failure_degrades_instead_of_crashing() {
        struct FailingBackend;

        #[async_trait]
        impl Backend for FailingBackend {
            async fn fetch_history(&self) -> Result<Vec<Value>, BackendError> {
                Err(BackendError::Transport("refused".to_string()))
            }
            async fn mark_read(&self, _id: &str) -> Result<(), BackendError> {
                Ok(())
            }
            async fn mark_all_read(&self) -> Result<(), BackendError> {
                Ok(())
            }
            async fn accept_request(
                &self,
                _request_id: &str,
            ) -> Result<crate::protocol::RelationshipStatus, BackendError> {
                Ok(crate::protocol::RelationshipStatus::Accepted)
            }
            async fn decline_request(
                &self,
                _request_id: &str,
            ) -> Result<crate::protocol::RelationshipStatus, BackendError> {
                Ok(crate::protocol::RelationshipStatus::Declined)
            }
            async fn delete_notification(&self, _id: &str) -> Result<(), BackendError> {
                Ok(())
            }
        }

        let transport = Arc::new(ScriptedTransport::new(vec![vec![ScriptItem::Hang]]));
        let mut controller =
            SyncController::new(Arc::new(FailingBackend), transport, test_config());
        controller.activate().await;

        assert!(controller.snapshot().await.is_empty());
        assert_eq!(controller.unread_count().await, 0);

        controller.deactivate().await;
    }

    #[tokio::test]
    async fn malformed_history_entries_are_dropped_not_fatal() {
        let backend = Arc::new(PagedBackend::new(vec![vec![
            history_payload("a", 100, false),
            json!({"text": "no kind"}),
            json!("not even an object"),
        ]]));
        let transport = Arc::new(ScriptedTransport::new(vec![vec![ScriptItem::Hang]]));

        let mut controller = SyncController::new(backend, transport, test_config());
        controller.activate().await;

        assert_eq!(controller.snapshot().await.len(), 1);
        assert_eq!(controller.unread_count().await, 1);

        controller.deactivate().await;
    }

    #[tokio::test]
    async fn actions_forward_through_the_controller() {
        let backend = Arc::new(PagedBackend::new(vec![vec![
            history_payload("a", 100, false),
            json!({
                "id": "fr",
                "kind": "friend_request",
                "text": "bob wants to be friends",
                "subject_id": "req-1",
                "created_at": 150,
            }),
        ]]));
        let transport = Arc::new(ScriptedTransport::new(vec![vec![ScriptItem::Hang]]));

        let mut controller = SyncController::new(backend, transport, test_config());
        controller.activate().await;

        controller.mark_read("a").await.unwrap();
        assert_eq!(controller.unread_count().await, 1); // "fr" still unread

        controller.accept("req-1").await.unwrap();
        assert!(controller.actionable().await.is_empty());

        controller.delete("a").await.unwrap();
        assert_eq!(controller.snapshot().await.len(), 1);

        controller.deactivate().await;
    }

    #[tokio::test]
    async fn repeated_bulk_load_is_idempotent() {
        let backend = Arc::new(PagedBackend::new(vec![vec![
            history_payload("a", 100, false),
            history_payload("b", 200, false),
        ]]));
        let transport = Arc::new(ScriptedTransport::new(vec![vec![ScriptItem::Hang]]));

        let mut controller = SyncController::new(backend.clone(), transport, test_config());
        controller.activate().await;

        // Re-apply the same page by hand, as a reconnect re-fetch would.
        let applied = fetch_and_apply(
            &*controller.backend,
            &controller.store,
            &controller.events_tx,
            Duration::from_secs(1),
        )
        .await;
        assert_eq!(applied, 0);
        assert_eq!(controller.snapshot().await.len(), 2);
        assert_eq!(controller.unread_count().await, 2);

        controller.deactivate().await;
    }
}
