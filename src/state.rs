use crate::store::reachability::{spawn_reachability_poller, REACHABILITY_POLL_INTERVAL};
use crate::store::DurableStore;
use crate::stream::events::EventPublisher;
use crate::stream::supervisor::{SessionData, SharedSessionData};
use parking_lot::Mutex as SyncMutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct StreamSessionHandle {
    pub session_id: u64,
    pub cancellation_token: CancellationToken,
    pub manual_disconnect: Arc<AtomicBool>,
    pub join_handle: JoinHandle<()>,
}

/// Engine-wide state shared by the command layer. At most one session is
/// live at a time; the slot lock serializes connect and disconnect.
pub struct StreamEngine {
    pub started_at: Instant,
    pub store: Arc<dyn DurableStore>,
    pub store_reachable: Arc<AtomicBool>,
    pub stream_session: Mutex<Option<StreamSessionHandle>>,
    pub publisher: EventPublisher,
    pub session_data: SharedSessionData,
    next_session_id: AtomicU64,
    reachability_cancel: CancellationToken,
    reachability_handle: SyncMutex<Option<JoinHandle<()>>>,
}

impl StreamEngine {
    /// Must be called from inside a tokio runtime: the store reachability
    /// poller starts immediately.
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self::with_poll_interval(store, REACHABILITY_POLL_INTERVAL)
    }

    pub fn with_poll_interval(store: Arc<dyn DurableStore>, poll_interval: Duration) -> Self {
        let store_reachable = Arc::new(AtomicBool::new(false));
        let reachability_cancel = CancellationToken::new();
        let reachability_handle = spawn_reachability_poller(
            Arc::clone(&store),
            Arc::clone(&store_reachable),
            poll_interval,
            reachability_cancel.clone(),
        );

        Self {
            started_at: Instant::now(),
            store,
            store_reachable,
            stream_session: Mutex::new(None),
            publisher: EventPublisher::new(),
            session_data: Arc::new(SyncMutex::new(SessionData::default())),
            next_session_id: AtomicU64::new(0),
            reachability_cancel,
            reachability_handle: SyncMutex::new(Some(reachability_handle)),
        }
    }

    pub fn allocate_session_id(&self) -> u64 {
        self.next_session_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn is_store_reachable(&self) -> bool {
        self.store_reachable.load(Ordering::Relaxed)
    }

    /// Stops the reachability poller. Sessions are stopped through the
    /// disconnect command.
    pub async fn shutdown(&self) {
        self.reachability_cancel.cancel();
        let handle = self.reachability_handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl Drop for StreamEngine {
    fn drop(&mut self) {
        self.reachability_cancel.cancel();
    }
}
