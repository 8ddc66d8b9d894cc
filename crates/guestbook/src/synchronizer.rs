//! Guestbook synchronizer
//!
//! Owns the in-memory entry list and keeps it in step with the remote store
//! and, when the remote store is out of reach, with local fallback storage.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use entities::{Attendance, LocalIdGenerator, Wish, WishStatus};
use tokio::{
    sync::{oneshot, watch, Mutex, RwLock},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};
use wish_store::{load_wishes, save_wishes, FallbackStorage, InsertSubscription, WishStore};

use crate::Backend;

/// How long `shutdown` waits for the realtime listener to leave its channel
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(3);

/// Input fields a presentation layer binds to
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Draft {
    pub name: String,
    pub message: String,
    pub attendance: Option<Attendance>,
}

impl Draft {
    /// Clears all fields
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// State of the realtime insert stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RealtimeStatus {
    /// No stream attached
    #[default]
    Detached,
    /// Receiving insert notifications
    Live,
    /// The stream ended and is being re-established
    Reconnecting,
}

/// Observable guestbook state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestbookState {
    /// Entries, newest first
    pub entries: Vec<Wish>,
    /// Whether reads and writes go to local storage
    pub using_fallback: bool,
    /// Whether the initial load is still running
    pub loading: bool,
    /// Whether a submission is in flight
    pub submitting: bool,
    /// Realtime stream state
    pub realtime: RealtimeStatus,
    /// Current input fields
    pub draft: Draft,
}

impl Default for GuestbookState {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            using_fallback: false,
            loading: true,
            submitting: false,
            realtime: RealtimeStatus::Detached,
            draft: Draft::default(),
        }
    }
}

impl GuestbookState {
    /// Prepends `incoming` unless an entry with the same id is already
    /// present. Returns true if the list changed.
    pub fn merge_by_id(&mut self, incoming: Wish) -> bool {
        if self.entries.iter().any(|w| w.id == incoming.id) {
            return false;
        }
        self.entries.insert(0, incoming);
        true
    }

    /// Entries worth persisting locally: everything not awaiting the store
    fn persistable(&self) -> Vec<Wish> {
        self.entries
            .iter()
            .filter(|w| !w.is_pending())
            .cloned()
            .collect()
    }

    fn remove_pending(&mut self, id: &str) {
        self.entries.retain(|w| !(w.id == id && w.is_pending()));
    }

    fn mark_local_only(&mut self, wish: &Wish) {
        match self.entries.iter_mut().find(|w| w.id == wish.id) {
            Some(entry) => entry.status = WishStatus::LocalOnly,
            None => self.entries.insert(0, wish.clone()),
        }
    }
}

/// Why a submission was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    EmptyName,
    EmptyMessage,
    AlreadySubmitting,
}

/// Result of a submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Nothing happened
    Rejected(RejectReason),
    /// The remote store confirmed the entry
    Confirmed(Wish),
    /// The remote store acknowledged the insert without returning the row;
    /// the entry arrives through the realtime stream
    Sent,
    /// The entry was persisted to local storage only
    StoredLocally(Wish),
}

/// Backoff for re-establishing a dropped realtime stream
#[derive(Debug, Clone, Copy)]
struct RetryPolicy {
    initial_delay: Duration,
    max_delay: Duration,
    max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 30,
        }
    }
}

/// What the listener task needs from the guestbook
struct ListenerContext {
    store: Arc<dyn WishStore>,
    state: Arc<RwLock<GuestbookState>>,
    changes: watch::Sender<u64>,
    retry: RetryPolicy,
}

impl ListenerContext {
    async fn merge(&self, wish: Wish) {
        let id = wish.id.clone();
        if self.state.write().await.merge_by_id(wish) {
            debug!(id = %id, "Merged realtime wish");
            self.changes.send_modify(|revision| *revision += 1);
        }
    }

    async fn set_status(&self, status: RealtimeStatus) {
        self.state.write().await.realtime = status;
        self.changes.send_modify(|revision| *revision += 1);
    }

    /// Merges notifications until the stream ends. Returns true when a stop
    /// was requested instead.
    async fn drain(
        &self,
        subscription: &mut InsertSubscription,
        stop: &mut oneshot::Receiver<()>,
    ) -> bool {
        loop {
            tokio::select! {
                _ = &mut *stop => return true,
                row = subscription.recv() => match row {
                    Some(row) => self.merge(Wish::from(row)).await,
                    None => return false,
                },
            }
        }
    }

    /// Subscribes again with exponential backoff. Returns `None` when
    /// stopped or out of attempts.
    async fn resubscribe(&self, stop: &mut oneshot::Receiver<()>) -> Option<InsertSubscription> {
        let mut delay = self.retry.initial_delay;

        for attempt in 1..=self.retry.max_attempts {
            tokio::select! {
                _ = &mut *stop => return None,
                _ = tokio::time::sleep(delay) => {}
            }

            let subscribed = tokio::select! {
                _ = &mut *stop => return None,
                subscribed = self.store.subscribe_inserts() => subscribed,
            };

            match subscribed {
                Ok(subscription) => {
                    info!(attempt, "Realtime stream re-established");
                    return Some(subscription);
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Realtime resubscribe failed");
                    delay = (delay * 2).min(self.retry.max_delay);
                }
            }
        }

        error!(attempts = self.retry.max_attempts, "Giving up on realtime updates");
        None
    }

    /// Merges rows inserted while the stream was down
    async fn catch_up(&self) {
        match self.store.list_wishes().await {
            Ok(rows) => {
                // Oldest first so the newest ends up on top
                for row in rows.into_iter().rev() {
                    self.merge(Wish::from(row)).await;
                }
            }
            Err(e) => warn!(error = %e, "Failed to catch up after reconnect"),
        }
    }

    async fn run(self, mut subscription: InsertSubscription, mut stop: oneshot::Receiver<()>) {
        loop {
            let stopped = self.drain(&mut subscription, &mut stop).await;
            subscription.close().await;
            if stopped {
                return;
            }

            warn!("Realtime stream ended, resubscribing");
            self.set_status(RealtimeStatus::Reconnecting).await;

            match self.resubscribe(&mut stop).await {
                Some(next) => {
                    subscription = next;
                    self.set_status(RealtimeStatus::Live).await;
                    self.catch_up().await;
                }
                None => {
                    self.set_status(RealtimeStatus::Detached).await;
                    return;
                }
            }
        }
    }
}

/// Realtime listener task; aborted when dropped
struct RealtimeListener {
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl RealtimeListener {
    fn spawn(context: ListenerContext, subscription: InsertSubscription) -> Self {
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(context.run(subscription, stop_rx));

        Self {
            stop: Some(stop_tx),
            task: Some(task),
        }
    }

    async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut task).await.is_err() {
                warn!("Realtime listener did not stop in time, aborting");
                task.abort();
            }
        }
    }
}

impl Drop for RealtimeListener {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// The guestbook synchronizer
pub struct Guestbook {
    backend: Backend,
    storage: Arc<dyn FallbackStorage>,
    state: Arc<RwLock<GuestbookState>>,
    changes: watch::Sender<u64>,
    ids: LocalIdGenerator,
    retry: RetryPolicy,
    realtime: Mutex<Option<RealtimeListener>>,
}

impl Guestbook {
    /// Creates a guestbook over the given backend and fallback storage
    pub fn new(backend: Backend, storage: Arc<dyn FallbackStorage>) -> Self {
        Self {
            backend,
            storage,
            state: Arc::new(RwLock::new(GuestbookState::default())),
            changes: watch::channel(0).0,
            ids: LocalIdGenerator::new(),
            retry: RetryPolicy::default(),
            realtime: Mutex::new(None),
        }
    }

    /// Returns a copy of the current state
    pub async fn snapshot(&self) -> GuestbookState {
        self.state.read().await.clone()
    }

    /// Returns the current entries, newest first
    pub async fn entries(&self) -> Vec<Wish> {
        self.state.read().await.entries.clone()
    }

    /// Returns true if the session runs on local storage
    pub async fn is_using_fallback(&self) -> bool {
        self.state.read().await.using_fallback
    }

    /// Returns true while insert notifications are being received
    pub async fn has_realtime(&self) -> bool {
        self.state.read().await.realtime == RealtimeStatus::Live
    }

    /// Receiver notified with a new revision on every state change
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    fn notify(&self) {
        self.changes.send_modify(|revision| *revision += 1);
    }

    /// Loads the initial entries and attaches the realtime listener.
    ///
    /// The read result is applied as soon as it arrives; the realtime
    /// handshake finishes afterwards.
    pub async fn initialize(&self) {
        let store = match &self.backend {
            Backend::Connected(store) => Arc::clone(store),
            Backend::Unconfigured => {
                warn!("Remote store is not configured, using local storage fallback");
                let local = self.load_local().await;
                {
                    let mut state = self.state.write().await;
                    state.using_fallback = true;
                    if let Some(wishes) = local {
                        state.entries = wishes;
                    }
                    state.loading = false;
                }
                self.notify();
                return;
            }
        };

        // Subscribe alongside the read so inserts landing in between are
        // buffered instead of lost
        let subscribing = tokio::spawn({
            let store = Arc::clone(&store);
            async move { store.subscribe_inserts().await }
        });

        let online = match store.list_wishes().await {
            Ok(rows) => {
                info!(count = rows.len(), "Loaded wishes");
                let mut state = self.state.write().await;
                state.entries = rows.into_iter().map(Wish::from).collect();
                state.loading = false;
                true
            }
            Err(e) => {
                error!(error = %e, "Error fetching wishes");
                let local = self.load_local().await;
                let mut state = self.state.write().await;
                state.using_fallback = true;
                if let Some(wishes) = local {
                    state.entries = wishes;
                }
                state.loading = false;
                false
            }
        };
        self.notify();

        if !online {
            // Dropping a finished subscription releases it as well
            subscribing.abort();
            return;
        }

        match subscribing.await {
            Ok(Ok(subscription)) => self.attach_realtime(store, subscription).await,
            Ok(Err(e)) => warn!(error = %e, "Realtime updates unavailable"),
            Err(e) => error!(error = %e, "Realtime subscribe task failed"),
        }
    }

    async fn attach_realtime(&self, store: Arc<dyn WishStore>, subscription: InsertSubscription) {
        let context = ListenerContext {
            store,
            state: Arc::clone(&self.state),
            changes: self.changes.clone(),
            retry: self.retry,
        };

        let mut slot = self.realtime.lock().await;
        self.state.write().await.realtime = RealtimeStatus::Live;
        // Replacing an earlier listener drops and aborts it
        *slot = Some(RealtimeListener::spawn(context, subscription));
        drop(slot);

        self.notify();
    }

    /// Merges an entry delivered by any path, deduplicating by id.
    pub async fn merge_by_id(&self, incoming: Wish) -> bool {
        let merged = self.state.write().await.merge_by_id(incoming);
        if merged {
            self.notify();
        }
        merged
    }

    /// Updates the name field
    pub async fn set_name(&self, name: impl Into<String>) {
        self.state.write().await.draft.name = name.into();
        self.notify();
    }

    /// Updates the message field
    pub async fn set_message(&self, message: impl Into<String>) {
        self.state.write().await.draft.message = message.into();
        self.notify();
    }

    /// Updates the attendance field
    pub async fn set_attendance(&self, attendance: Option<Attendance>) {
        self.state.write().await.draft.attendance = attendance;
        self.notify();
    }

    /// Submits the current input fields
    pub async fn submit_draft(&self) -> SubmitOutcome {
        let draft = self.state.read().await.draft.clone();
        self.submit(draft.name, draft.message, draft.attendance).await
    }

    /// Submits a new entry.
    ///
    /// Never fails: when the remote store cannot take the entry it is kept
    /// in local storage instead.
    pub async fn submit(
        &self,
        name: impl Into<String>,
        message: impl Into<String>,
        attendance: Option<Attendance>,
    ) -> SubmitOutcome {
        let name = name.into();
        let message = message.into();

        if name.trim().is_empty() {
            return SubmitOutcome::Rejected(RejectReason::EmptyName);
        }
        if message.trim().is_empty() {
            return SubmitOutcome::Rejected(RejectReason::EmptyMessage);
        }

        let using_fallback = {
            let mut state = self.state.write().await;
            if state.submitting {
                return SubmitOutcome::Rejected(RejectReason::AlreadySubmitting);
            }
            state.submitting = true;
            state.using_fallback
        };
        self.notify();

        let now = Utc::now();
        let provisional = Wish::pending(self.ids.next_id(now), name, message, attendance, now);

        let outcome = match &self.backend {
            Backend::Connected(store) if !using_fallback => {
                self.submit_remote(store.as_ref(), provisional).await
            }
            _ => self.submit_local(provisional).await,
        };

        self.state.write().await.submitting = false;
        self.notify();
        outcome
    }

    async fn submit_local(&self, provisional: Wish) -> SubmitOutcome {
        let wish = provisional.into_local_only();

        let persisted = {
            let mut state = self.state.write().await;
            state.entries.insert(0, wish.clone());
            state.draft.clear();
            state.persistable()
        };
        self.notify();
        self.persist_local(persisted).await;

        debug!(id = %wish.id, "Stored wish locally");
        SubmitOutcome::StoredLocally(wish)
    }

    async fn submit_remote(&self, store: &dyn WishStore, provisional: Wish) -> SubmitOutcome {
        self.state.write().await.entries.insert(0, provisional.clone());
        self.notify();

        let result = store.insert_wish(&provisional.to_new_wish()).await;

        let (outcome, persisted) = {
            let mut state = self.state.write().await;
            state.draft.clear();

            match result {
                Ok(rows) => {
                    state.remove_pending(&provisional.id);
                    match rows.into_iter().next() {
                        Some(row) => {
                            let wish = Wish::from(row);
                            info!(id = %wish.id, "Wish confirmed");
                            state.merge_by_id(wish.clone());
                            (SubmitOutcome::Confirmed(wish), None)
                        }
                        None => {
                            warn!("Insert acknowledged without a row, waiting for realtime");
                            (SubmitOutcome::Sent, None)
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, "Failed to submit wish, keeping it locally");
                    let wish = provisional.into_local_only();
                    state.mark_local_only(&wish);

                    if e.is_unreachable() && !state.using_fallback {
                        warn!("Remote store unreachable, switching to offline mode");
                        state.using_fallback = true;
                    }
                    (SubmitOutcome::StoredLocally(wish), Some(state.persistable()))
                }
            }
        };
        self.notify();

        if let Some(wishes) = persisted {
            self.persist_local(wishes).await;
        }
        outcome
    }

    async fn load_local(&self) -> Option<Vec<Wish>> {
        let storage = Arc::clone(&self.storage);
        match tokio::task::spawn_blocking(move || load_wishes(storage.as_ref())).await {
            Ok(Ok(Some(wishes))) => {
                info!(count = wishes.len(), "Loaded local wishes");
                Some(wishes)
            }
            Ok(Ok(None)) => None,
            Ok(Err(e)) => {
                error!(error = %e, "Error parsing local wishes");
                None
            }
            Err(e) => {
                error!(error = %e, "Local storage task failed");
                None
            }
        }
    }

    async fn persist_local(&self, wishes: Vec<Wish>) {
        let storage = Arc::clone(&self.storage);
        let saving = tokio::task::spawn_blocking(move || save_wishes(storage.as_ref(), &wishes));
        match saving.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "Failed to persist local wishes"),
            Err(e) => error!(error = %e, "Local storage task failed"),
        }
    }

    /// Detaches the realtime listener, leaving its channel.
    pub async fn shutdown(&self) {
        let listener = self.realtime.lock().await.take();
        if let Some(listener) = listener {
            listener.stop().await;
            info!("Realtime listener stopped");
        }
        self.state.write().await.realtime = RealtimeStatus::Detached;
        self.notify();
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use entities::{NewWish, WishRow};
    use wish_store::{MemoryStorage, MemoryWishStore, FALLBACK_KEY};

    use super::*;

    fn connected(store: &Arc<MemoryWishStore>) -> Backend {
        Backend::Connected(Arc::clone(store) as Arc<dyn WishStore>)
    }

    fn row(id: &str, name: &str, day: u32) -> WishRow {
        WishRow {
            id: id.to_string(),
            name: name.to_string(),
            message: "Selamat!".to_string(),
            attendance: None,
            timestamp: Some(Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap()),
        }
    }

    fn budi_storage() -> Arc<MemoryStorage> {
        let storage = Arc::new(MemoryStorage::new());
        storage
            .set(
                FALLBACK_KEY,
                r#"[{"id":"1700000000000","name":"Budi","message":"Sukses!","timestamp":"2024-01-01T00:00:00Z"}]"#,
            )
            .unwrap();
        storage
    }

    async fn wait_for<F>(guestbook: &Guestbook, mut done: F)
    where
        F: FnMut(&GuestbookState) -> bool,
    {
        let mut changes = guestbook.changes();
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if done(&*guestbook.state.read().await) {
                    return;
                }
                let _ = changes.changed().await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    async fn wait_for_subscribers(store: &MemoryWishStore, count: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while store.subscriber_count() != count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("subscriber count not reached in time");
    }

    fn quick_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
            max_attempts,
        }
    }

    fn other_wish(name: &str) -> NewWish {
        NewWish {
            name: name.to_string(),
            message: "Turut berbahagia".to_string(),
            attendance: Some(Attendance::Attending),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_merge_by_id_is_idempotent() {
        let mut state = GuestbookState::default();
        let first = Wish::from(row("a", "Ani", 1));
        let second = Wish::from(row("b", "Budi", 2));

        assert!(state.merge_by_id(first.clone()));
        assert!(state.merge_by_id(second.clone()));
        let before = state.entries.clone();

        assert!(!state.merge_by_id(first.clone()));
        assert_eq!(state.entries, before);
        assert_eq!(state.entries, vec![second, first]);
    }

    #[tokio::test]
    async fn test_happy_path() {
        let store = Arc::new(MemoryWishStore::new());
        let guestbook = Guestbook::new(connected(&store), Arc::new(MemoryStorage::new()));

        guestbook.initialize().await;
        let state = guestbook.snapshot().await;
        assert!(state.entries.is_empty());
        assert!(!state.loading);
        assert!(!state.using_fallback);
        assert!(guestbook.has_realtime().await);

        let outcome = guestbook
            .submit("Ani", "Selamat ya!", Some(Attendance::Attending))
            .await;
        assert!(matches!(outcome, SubmitOutcome::Confirmed(_)));

        let state = guestbook.snapshot().await;
        assert_eq!(state.entries.len(), 1);
        let entry = &state.entries[0];
        assert_eq!(entry.id, "server-1");
        assert_eq!(entry.name, "Ani");
        assert_eq!(entry.message, "Selamat ya!");
        assert_eq!(entry.attendance, Some(Attendance::Attending));
        assert_eq!(entry.status, WishStatus::Confirmed);
        assert!(!state.submitting);

        // Notifications arrive in order, so once the next one is merged the
        // echo of our own insert has been handled too
        store.insert_from_other_client(&other_wish("Gita")).await;
        wait_for(&guestbook, |state| state.entries.len() == 2).await;
        let ids: Vec<_> = guestbook.entries().await.into_iter().map(|w| w.id).collect();
        assert_eq!(ids, ["server-2", "server-1"]);

        guestbook.shutdown().await;
    }

    #[tokio::test]
    async fn test_realtime_notification_before_insert_response() {
        let store = Arc::new(MemoryWishStore::new());
        store.set_reply_delay(Duration::from_millis(300));
        let guestbook = Arc::new(Guestbook::new(connected(&store), Arc::new(MemoryStorage::new())));
        guestbook.initialize().await;

        let submitting = tokio::spawn({
            let guestbook = Arc::clone(&guestbook);
            async move { guestbook.submit("Ani", "Selamat ya!", None).await }
        });

        // The notification is merged while the insert response is held back
        wait_for(&guestbook, |state| {
            state.entries.len() == 2
                && state.entries.iter().any(|w| w.id == "server-1")
                && state.entries.iter().any(Wish::is_pending)
        })
        .await;

        let outcome = submitting.await.unwrap();
        assert!(matches!(outcome, SubmitOutcome::Confirmed(_)));

        let entries = guestbook.entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, "server-1");
        assert_eq!(entries[0].status, WishStatus::Confirmed);
        assert!(!entries.iter().any(Wish::is_pending));
    }

    #[tokio::test]
    async fn test_known_row_is_not_duplicated_by_submit() {
        let store = Arc::new(MemoryWishStore::new());
        let guestbook = Guestbook::new(connected(&store), Arc::new(MemoryStorage::new()));
        guestbook.initialize().await;

        let mut early = Wish::from(row("server-1", "Ani", 1));
        early.message = "Selamat ya!".to_string();
        assert!(guestbook.merge_by_id(early).await);

        guestbook.submit("Ani", "Selamat ya!", None).await;

        let entries = guestbook.entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, "server-1");
    }

    #[tokio::test]
    async fn test_read_result_applied_before_slow_subscribe() {
        let store = Arc::new(MemoryWishStore::new());
        store.set_fail_reads(true);
        store.set_subscribe_delay(Duration::from_secs(10));
        let guestbook = Arc::new(Guestbook::new(connected(&store), budi_storage()));

        let initializing = tokio::spawn({
            let guestbook = Arc::clone(&guestbook);
            async move { guestbook.initialize().await }
        });

        tokio::time::timeout(Duration::from_millis(500), initializing)
            .await
            .expect("initialize waited for the subscription")
            .unwrap();

        let state = guestbook.snapshot().await;
        assert!(!state.loading);
        assert!(state.using_fallback);
        assert_eq!(state.entries[0].name, "Budi");

        // A submission right away goes to local storage
        let outcome = guestbook.submit("Cici", "Bahagia selalu", None).await;
        assert!(matches!(outcome, SubmitOutcome::StoredLocally(_)));
        assert!(store.rows().await.is_empty());
    }

    #[tokio::test]
    async fn test_loading_clears_while_subscribe_is_pending() {
        let store = Arc::new(MemoryWishStore::with_rows(vec![row("1", "Ani", 1)]));
        store.set_subscribe_delay(Duration::from_millis(300));
        let guestbook = Arc::new(Guestbook::new(connected(&store), Arc::new(MemoryStorage::new())));

        let initializing = tokio::spawn({
            let guestbook = Arc::clone(&guestbook);
            async move { guestbook.initialize().await }
        });

        wait_for(&guestbook, |state| !state.loading).await;
        let state = guestbook.snapshot().await;
        assert_eq!(state.entries.len(), 1);
        assert_eq!(state.realtime, RealtimeStatus::Detached);

        initializing.await.unwrap();
        assert!(guestbook.has_realtime().await);
    }

    #[tokio::test]
    async fn test_realtime_resubscribes_after_disconnect() {
        let store = Arc::new(MemoryWishStore::new());
        let mut guestbook = Guestbook::new(connected(&store), Arc::new(MemoryStorage::new()));
        guestbook.retry = quick_retry(100);
        guestbook.initialize().await;
        assert!(guestbook.has_realtime().await);

        store.set_fail_subscribe(true);
        store.disconnect_subscribers();
        wait_for(&guestbook, |state| state.realtime == RealtimeStatus::Reconnecting).await;
        assert!(!guestbook.has_realtime().await);

        // Inserted while the stream is down
        store.insert_from_other_client(&other_wish("Gita")).await;

        store.set_fail_subscribe(false);
        wait_for(&guestbook, |state| {
            state.realtime == RealtimeStatus::Live && state.entries.len() == 1
        })
        .await;
        assert_eq!(guestbook.entries().await[0].name, "Gita");
        assert_eq!(store.subscriber_count(), 1);

        store.insert_from_other_client(&other_wish("Hana")).await;
        wait_for(&guestbook, |state| state.entries.len() == 2).await;
        assert_eq!(guestbook.entries().await[0].name, "Hana");

        guestbook.shutdown().await;
        assert_eq!(store.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_realtime_gives_up_after_retries() {
        let store = Arc::new(MemoryWishStore::new());
        let mut guestbook = Guestbook::new(connected(&store), Arc::new(MemoryStorage::new()));
        guestbook.retry = quick_retry(3);
        guestbook.initialize().await;

        store.set_fail_subscribe(true);
        store.disconnect_subscribers();
        wait_for(&guestbook, |state| state.realtime == RealtimeStatus::Detached).await;

        assert!(!guestbook.has_realtime().await);
        assert_eq!(store.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_offline_fallback_when_unconfigured() {
        let guestbook = Guestbook::new(Backend::Unconfigured, budi_storage());
        guestbook.initialize().await;

        let state = guestbook.snapshot().await;
        assert!(state.using_fallback);
        assert!(!state.loading);
        assert_eq!(state.entries.len(), 1);
        assert_eq!(state.entries[0].id, "1700000000000");
        assert_eq!(state.entries[0].name, "Budi");
        assert_eq!(state.entries[0].message, "Sukses!");
        assert_eq!(
            state.entries[0].timestamp,
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
        );
        assert!(!guestbook.has_realtime().await);
    }

    #[tokio::test]
    async fn test_read_failure_degrades_to_local() {
        let store = Arc::new(MemoryWishStore::new());
        store.set_fail_reads(true);

        let guestbook = Guestbook::new(connected(&store), budi_storage());
        guestbook.initialize().await;

        let state = guestbook.snapshot().await;
        assert!(state.using_fallback);
        assert!(!state.loading);
        assert_eq!(state.entries.len(), 1);
        assert_eq!(state.entries[0].name, "Budi");
        assert!(!guestbook.has_realtime().await);
        wait_for_subscribers(&store, 0).await;
    }

    #[tokio::test]
    async fn test_read_failure_with_empty_storage() {
        let store = Arc::new(MemoryWishStore::new());
        store.set_fail_reads(true);

        let guestbook = Guestbook::new(connected(&store), Arc::new(MemoryStorage::new()));
        guestbook.initialize().await;

        let state = guestbook.snapshot().await;
        assert!(state.using_fallback);
        assert!(!state.loading);
        assert!(state.entries.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_local_storage_is_ignored() {
        let storage = Arc::new(MemoryStorage::new());
        storage.set(FALLBACK_KEY, "not json").unwrap();

        let guestbook = Guestbook::new(Backend::Unconfigured, storage);
        guestbook.initialize().await;

        let state = guestbook.snapshot().await;
        assert!(state.using_fallback);
        assert!(state.entries.is_empty());
    }

    #[tokio::test]
    async fn test_write_failure_recovers_to_local() {
        let store = Arc::new(MemoryWishStore::new());
        let storage = Arc::new(MemoryStorage::new());
        let guestbook = Guestbook::new(connected(&store), storage.clone());
        guestbook.initialize().await;

        store.set_fail_writes(true);
        guestbook.set_name("Cici").await;
        guestbook.set_message("Bahagia selalu").await;
        let outcome = guestbook.submit_draft().await;
        assert!(matches!(outcome, SubmitOutcome::StoredLocally(_)));

        let state = guestbook.snapshot().await;
        assert_eq!(state.entries.len(), 1);
        let entry = &state.entries[0];
        assert_eq!(entry.name, "Cici");
        assert_eq!(entry.message, "Bahagia selalu");
        assert_eq!(entry.status, WishStatus::LocalOnly);
        assert!(entry.id.parse::<i64>().is_ok());
        assert!(entry.timestamp.is_some());
        assert!(state.using_fallback);
        assert!(!state.submitting);
        assert_eq!(state.draft, Draft::default());

        let persisted = load_wishes(storage.as_ref()).unwrap().unwrap();
        assert_eq!(persisted, state.entries);
    }

    #[tokio::test]
    async fn test_rejected_write_keeps_online_mode() {
        let store = Arc::new(MemoryWishStore::new());
        let storage = Arc::new(MemoryStorage::new());
        let guestbook = Guestbook::new(connected(&store), storage.clone());
        guestbook.initialize().await;

        store.set_reject_writes(true);
        let outcome = guestbook.submit("Dedi", "Selamat", None).await;
        assert!(matches!(outcome, SubmitOutcome::StoredLocally(_)));
        assert!(!guestbook.is_using_fallback().await);
        assert_eq!(load_wishes(storage.as_ref()).unwrap().unwrap().len(), 1);

        // Next submission still goes to the store
        store.set_reject_writes(false);
        let outcome = guestbook.submit("Eka", "Semoga langgeng", None).await;
        assert!(matches!(outcome, SubmitOutcome::Confirmed(_)));
        assert_eq!(store.rows().await.len(), 1);
    }

    #[tokio::test]
    async fn test_insert_without_returned_row() {
        let store = Arc::new(MemoryWishStore::new());
        store.set_hide_inserted(true);
        let guestbook = Guestbook::new(connected(&store), Arc::new(MemoryStorage::new()));
        guestbook.initialize().await;

        let outcome = guestbook.submit("Fajar", "Barakallah", None).await;
        assert_eq!(outcome, SubmitOutcome::Sent);

        // The realtime notification brings the confirmed row
        wait_for(&guestbook, |state| state.entries.len() == 1).await;
        let entries = guestbook.entries().await;
        assert_eq!(entries[0].id, "server-1");
        assert_eq!(entries[0].status, WishStatus::Confirmed);
    }

    #[tokio::test]
    async fn test_fallback_persistence_round_trip() {
        let storage = Arc::new(MemoryStorage::new());
        let guestbook = Guestbook::new(Backend::Unconfigured, storage.clone());
        guestbook.initialize().await;

        let submissions = [
            ("Ani", "Selamat ya!", Some(Attendance::Attending)),
            ("Budi", "Sukses!", None),
            ("Cici", "Bahagia selalu", Some(Attendance::NotAttending)),
        ];
        for (name, message, attendance) in submissions {
            let outcome = guestbook.submit(name, message, attendance).await;
            assert!(matches!(outcome, SubmitOutcome::StoredLocally(_)));
        }
        let before = guestbook.entries().await;

        let reloaded = Guestbook::new(Backend::Unconfigured, storage);
        reloaded.initialize().await;
        let after = reloaded.entries().await;

        assert_eq!(after, before);
        let names: Vec<_> = after.iter().map(|w| w.name.as_str()).collect();
        assert_eq!(names, ["Cici", "Budi", "Ani"]);
        assert_eq!(after[0].attendance, Some(Attendance::NotAttending));
        assert_eq!(after[1].attendance, None);
    }

    #[tokio::test]
    async fn test_submission_validation() {
        let store = Arc::new(MemoryWishStore::new());
        let guestbook = Guestbook::new(connected(&store), Arc::new(MemoryStorage::new()));
        guestbook.initialize().await;

        assert_eq!(
            guestbook.submit("", "Selamat", None).await,
            SubmitOutcome::Rejected(RejectReason::EmptyName)
        );
        assert_eq!(
            guestbook.submit("Ani", "   ", None).await,
            SubmitOutcome::Rejected(RejectReason::EmptyMessage)
        );

        let state = guestbook.snapshot().await;
        assert!(state.entries.is_empty());
        assert!(!state.submitting);
        assert!(store.rows().await.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_submit_is_rejected() {
        let guestbook = Guestbook::new(Backend::Unconfigured, Arc::new(MemoryStorage::new()));
        guestbook.initialize().await;

        guestbook.state.write().await.submitting = true;
        assert_eq!(
            guestbook.submit("Ani", "Selamat", None).await,
            SubmitOutcome::Rejected(RejectReason::AlreadySubmitting)
        );
        assert!(guestbook.entries().await.is_empty());
    }

    #[tokio::test]
    async fn test_realtime_inserts_from_other_clients() {
        let store = Arc::new(MemoryWishStore::with_rows(vec![row("server-0", "Ani", 1)]));
        let guestbook = Guestbook::new(connected(&store), Arc::new(MemoryStorage::new()));
        guestbook.initialize().await;
        assert_eq!(guestbook.entries().await.len(), 1);

        let other = NewWish {
            name: "Gita".to_string(),
            message: "Turut berbahagia".to_string(),
            attendance: Some(Attendance::Attending),
            timestamp: Utc::now(),
        };
        store.insert_from_other_client(&other).await;

        wait_for(&guestbook, |state| state.entries.len() == 2).await;
        let entries = guestbook.entries().await;
        assert_eq!(entries[0].name, "Gita");
        assert_eq!(entries[1].name, "Ani");
    }

    #[tokio::test]
    async fn test_initial_order_is_newest_first() {
        let store = Arc::new(MemoryWishStore::with_rows(vec![
            row("1", "Ani", 1),
            row("3", "Cici", 3),
            row("2", "Budi", 2),
        ]));
        let guestbook = Guestbook::new(connected(&store), Arc::new(MemoryStorage::new()));
        guestbook.initialize().await;

        let ids: Vec<_> = guestbook.entries().await.into_iter().map(|w| w.id).collect();
        assert_eq!(ids, ["3", "2", "1"]);
    }

    #[tokio::test]
    async fn test_shutdown_releases_subscription() {
        let store = Arc::new(MemoryWishStore::new());
        let guestbook = Guestbook::new(connected(&store), Arc::new(MemoryStorage::new()));
        guestbook.initialize().await;
        assert_eq!(store.subscriber_count(), 1);

        guestbook.shutdown().await;
        assert!(!guestbook.has_realtime().await);
        assert_eq!(store.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_drop_releases_subscription() {
        let store = Arc::new(MemoryWishStore::new());
        let guestbook = Guestbook::new(connected(&store), Arc::new(MemoryStorage::new()));
        guestbook.initialize().await;
        assert_eq!(store.subscriber_count(), 1);

        drop(guestbook);

        tokio::time::timeout(Duration::from_secs(2), async {
            while store.subscriber_count() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("subscription was not released");
    }
}
