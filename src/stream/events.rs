use crate::stream::now_unix_ms;
use crate::stream::ring::RingBuffer;
use crate::stream::types::{
    ConnectionState, EngineEvent, LogEntry, LogLevel, StatusSnapshot, EVENT_LOG_CAPACITY,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, RwLock};

pub const EVENT_CHANNEL_CAPACITY: usize = 1_024;
const NOTICE_THROTTLE_MS: u64 = 500;

#[derive(Debug, Default)]
struct NoticeThrottle {
    last_level: Option<LogLevel>,
    last_text: Option<String>,
    last_emit: Option<Instant>,
}

impl NoticeThrottle {
    fn allow(&mut self, level: LogLevel, text: &str) -> bool {
        let now = Instant::now();
        let repeated = self.last_level == Some(level)
            && self.last_text.as_deref() == Some(text)
            && self
                .last_emit
                .map(|instant| {
                    now.duration_since(instant) < Duration::from_millis(NOTICE_THROTTLE_MS)
                })
                .unwrap_or(false);
        if repeated {
            return false;
        }

        self.last_level = Some(level);
        self.last_text = Some(text.to_string());
        self.last_emit = Some(now);
        true
    }
}

/// Fan-out to the operator layer: the status store, the bounded event log and
/// the broadcast channel. Sends never block; lagging subscribers lose events.
#[derive(Clone)]
pub struct EventPublisher {
    status_store: Arc<RwLock<StatusSnapshot>>,
    event_log: Arc<Mutex<RingBuffer<LogEntry>>>,
    events: broadcast::Sender<EngineEvent>,
    throttle: Arc<Mutex<NoticeThrottle>>,
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl EventPublisher {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            status_store: Arc::new(RwLock::new(StatusSnapshot::idle(Some(
                "stream idle".to_string(),
            )))),
            event_log: Arc::new(Mutex::new(RingBuffer::with_capacity(EVENT_LOG_CAPACITY))),
            events,
            throttle: Arc::new(Mutex::new(NoticeThrottle::default())),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub async fn status(&self) -> StatusSnapshot {
        self.status_store.read().await.clone()
    }

    pub fn event_log(&self) -> Vec<LogEntry> {
        self.event_log.lock().to_vec()
    }

    pub fn emit(&self, event: EngineEvent) {
        // No receivers is not an error: the operator layer may not be listening.
        let _ = self.events.send(event);
    }

    pub fn log(&self, level: LogLevel, text: impl Into<String>) {
        let entry = LogEntry {
            t: now_unix_ms(),
            level,
            text: text.into(),
        };
        self.event_log.lock().push(entry.clone());
        self.emit(EngineEvent::Log(entry));
    }

    /// Like [`log`](Self::log) but drops an identical notice repeated within
    /// the throttle window.
    pub fn log_throttled(&self, level: LogLevel, text: impl Into<String>) {
        let text = text.into();
        if !self.throttle.lock().allow(level, &text) {
            return;
        }
        self.log(level, text);
    }

    /// Records a state transition: stores the snapshot, logs it and
    /// broadcasts it once.
    pub async fn publish_status(&self, snapshot: StatusSnapshot) {
        {
            let mut writable = self.status_store.write().await;
            *writable = snapshot.clone();
        }

        let mut text = format!("stream {}", snapshot.state.as_str());
        if let Some(reason) = snapshot.reason.as_ref() {
            text.push_str(": ");
            text.push_str(reason);
        }
        let level = match snapshot.state {
            ConnectionState::Failed => LogLevel::Error,
            ConnectionState::Reconnecting => LogLevel::Warn,
            _ => LogLevel::Info,
        };
        self.log(level, text);
        self.emit(EngineEvent::Status(snapshot));
    }

    /// Updates live counters on the stored snapshot without announcing a
    /// transition.
    pub async fn refresh_status<F>(&self, update: F)
    where
        F: FnOnce(&mut StatusSnapshot),
    {
        let mut writable = self.status_store.write().await;
        update(&mut writable);
    }
}
