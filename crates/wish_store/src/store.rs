//! Wish store trait and implementations

use std::{
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use entities::{NewWish, WishRow};
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch, RwLock},
    task::JoinHandle,
};
use tracing::{debug, warn};

use crate::{WishStoreError, WishStoreResult};

/// Capacity of the per-subscription notification queue
pub const SUBSCRIPTION_CAPACITY: usize = 256;

/// How long `close` waits for a subscription worker to finish
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Trait for remote guestbook storage
#[async_trait]
pub trait WishStore: Send + Sync {
    /// Lists all entries ordered by timestamp, newest first
    async fn list_wishes(&self) -> WishStoreResult<Vec<WishRow>>;

    /// Inserts one entry and returns the inserted row(s)
    async fn insert_wish(&self, wish: &NewWish) -> WishStoreResult<Vec<WishRow>>;

    /// Subscribes to rows inserted by any client
    async fn subscribe_inserts(&self) -> WishStoreResult<InsertSubscription>;
}

/// Handle on a standing insert notification stream.
///
/// The underlying listener runs on a worker task which is stopped by
/// [`InsertSubscription::close`] or, failing that, aborted on drop.
#[derive(Debug)]
pub struct InsertSubscription {
    receiver: mpsc::Receiver<WishRow>,
    shutdown: Option<oneshot::Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl InsertSubscription {
    /// Creates a subscription from a notification queue and the worker
    /// feeding it.
    pub fn new(
        receiver: mpsc::Receiver<WishRow>,
        shutdown: oneshot::Sender<()>,
        worker: JoinHandle<()>,
    ) -> Self {
        Self {
            receiver,
            shutdown: Some(shutdown),
            worker: Some(worker),
        }
    }

    /// Waits for the next inserted row. Returns `None` once the stream ended.
    pub async fn recv(&mut self) -> Option<WishRow> {
        self.receiver.recv().await
    }

    /// Signals the worker to leave the channel and waits for it to finish.
    pub async fn close(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }

        if let Some(mut worker) = self.worker.take() {
            if tokio::time::timeout(CLOSE_TIMEOUT, &mut worker).await.is_err() {
                warn!("Subscription worker did not stop in time, aborting");
                worker.abort();
            }
        }
    }
}

impl Drop for InsertSubscription {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
    }
}

/// In-memory implementation for testing and demos
#[derive(Debug)]
pub struct MemoryWishStore {
    rows: RwLock<Vec<WishRow>>,
    next_id: AtomicU64,
    notifier: broadcast::Sender<WishRow>,
    disconnects: watch::Sender<u64>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    reject_writes: AtomicBool,
    hide_inserted: AtomicBool,
    fail_subscribe: AtomicBool,
    subscribe_delay_ms: AtomicU64,
    reply_delay_ms: AtomicU64,
}

impl Default for MemoryWishStore {
    fn default() -> Self {
        Self {
            rows: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            notifier: broadcast::channel(SUBSCRIPTION_CAPACITY).0,
            disconnects: watch::channel(0).0,
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            reject_writes: AtomicBool::new(false),
            hide_inserted: AtomicBool::new(false),
            fail_subscribe: AtomicBool::new(false),
            subscribe_delay_ms: AtomicU64::new(0),
            reply_delay_ms: AtomicU64::new(0),
        }
    }
}

impl MemoryWishStore {
    /// Creates a new in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-populated with rows
    pub fn with_rows(rows: Vec<WishRow>) -> Self {
        Self {
            rows: RwLock::new(rows),
            ..Self::default()
        }
    }

    /// Makes reads fail as if the store were unreachable
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Makes inserts fail as if the store were unreachable
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Makes inserts fail with a refusal from a reachable store
    pub fn set_reject_writes(&self, reject: bool) {
        self.reject_writes.store(reject, Ordering::SeqCst);
    }

    /// Makes inserts succeed without returning the inserted row
    pub fn set_hide_inserted(&self, hide: bool) {
        self.hide_inserted.store(hide, Ordering::SeqCst);
    }

    /// Makes new subscriptions fail as if the store were unreachable
    pub fn set_fail_subscribe(&self, fail: bool) {
        self.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    /// Delays every subscription handshake
    pub fn set_subscribe_delay(&self, delay: Duration) {
        self.subscribe_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Delays the insert response after subscribers were notified
    pub fn set_reply_delay(&self, delay: Duration) {
        self.reply_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Ends every live subscription stream, as a dropped connection would
    pub fn disconnect_subscribers(&self) {
        self.disconnects.send_modify(|generation| *generation += 1);
    }

    /// Inserts a row as another client would, notifying subscribers
    pub async fn insert_from_other_client(&self, wish: &NewWish) -> WishRow {
        let row = self.store_row(wish).await;
        let _ = self.notifier.send(row.clone());
        row
    }

    /// Returns every stored row in insertion order
    pub async fn rows(&self) -> Vec<WishRow> {
        self.rows.read().await.clone()
    }

    /// Number of live insert listeners
    pub fn subscriber_count(&self) -> usize {
        self.notifier.receiver_count()
    }

    async fn store_row(&self, wish: &NewWish) -> WishRow {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let row = WishRow {
            id: format!("server-{id}"),
            name: wish.name.clone(),
            message: wish.message.clone(),
            attendance: wish.attendance,
            timestamp: Some(wish.timestamp),
        };
        self.rows.write().await.push(row.clone());
        row
    }
}

#[async_trait]
impl WishStore for MemoryWishStore {
    async fn list_wishes(&self) -> WishStoreResult<Vec<WishRow>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(WishStoreError::Unreachable("memory store offline".to_string()));
        }

        let mut rows = self.rows.read().await.clone();
        // Newest first; rows without a readable timestamp sort last.
        rows.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(rows)
    }

    async fn insert_wish(&self, wish: &NewWish) -> WishStoreResult<Vec<WishRow>> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(WishStoreError::Unreachable("memory store offline".to_string()));
        }
        if self.reject_writes.load(Ordering::SeqCst) {
            return Err(WishStoreError::rejected(403, "insert not allowed"));
        }

        let row = self.store_row(wish).await;
        debug!(id = %row.id, "Stored wish");

        // Ignore send errors (no subscribers)
        let _ = self.notifier.send(row.clone());

        let delay = self.reply_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        if self.hide_inserted.load(Ordering::SeqCst) {
            return Ok(Vec::new());
        }
        Ok(vec![row])
    }

    async fn subscribe_inserts(&self) -> WishStoreResult<InsertSubscription> {
        let delay = self.subscribe_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(WishStoreError::Unreachable("memory store offline".to_string()));
        }

        let mut notifications = self.notifier.subscribe();
        let mut disconnects = self.disconnects.subscribe();
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let worker = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = disconnects.changed() => break,
                    notification = notifications.recv() => match notification {
                        Ok(row) => {
                            if tx.send(row).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Insert listener lagged behind");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });

        Ok(InsertSubscription::new(rx, shutdown_tx, worker))
    }
}
