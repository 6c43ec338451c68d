use crate::store::DurableStore;
use crate::stream::types::{BatchRecord, Message, BATCH_QUEUE_CAPACITY, BATCH_SIZE};
use serde_json::Value;
use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

const INSTRUMENT_KEYS: &[&str] = &["instId", "s", "symbol"];
const DROP_WARN_EVERY: u64 = 500;
pub const MAX_IN_FLIGHT_SAVES: usize = 256;

/// FIFO of messages awaiting batched persistence.
#[derive(Debug)]
pub struct PersistenceBatcher {
    session_id: u64,
    queue: VecDeque<Message>,
    batch_size: usize,
    capacity: usize,
    dropped: u64,
}

impl PersistenceBatcher {
    pub fn new(session_id: u64) -> Self {
        Self::with_limits(session_id, BATCH_SIZE, BATCH_QUEUE_CAPACITY)
    }

    pub fn with_limits(session_id: u64, batch_size: usize, capacity: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            session_id,
            queue: VecDeque::new(),
            batch_size,
            capacity: capacity.max(batch_size),
            dropped: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Enqueues a message and flushes a full batch straight away when one is
    /// ready, without waiting for the next tick.
    pub fn push(
        &mut self,
        message: Message,
        reachable: bool,
        throughput: u32,
        now_ms: i64,
    ) -> Option<BatchRecord> {
        self.queue.push_back(message);

        if self.queue.len() > self.capacity {
            self.queue.pop_front();
            self.dropped = self.dropped.saturating_add(1);
            if self.dropped == 1 || self.dropped % DROP_WARN_EVERY == 0 {
                warn!(
                    "batch queue full while store is unreachable, dropped {} oldest message(s)",
                    self.dropped
                );
            }
        }

        self.flush_ready(reachable, throughput, now_ms)
    }

    pub fn on_tick(&mut self, reachable: bool, throughput: u32, now_ms: i64) -> Option<BatchRecord> {
        if self.queue.is_empty() {
            return None;
        }
        self.flush_ready(reachable, throughput, now_ms)
    }

    fn flush_ready(&mut self, reachable: bool, throughput: u32, now_ms: i64) -> Option<BatchRecord> {
        if !reachable || self.queue.len() < self.batch_size {
            return None;
        }

        let messages: Vec<Message> = self.queue.drain(..self.batch_size).collect();
        Some(build_batch(self.session_id, messages, throughput, now_ms))
    }
}

pub fn build_batch(
    session_id: u64,
    messages: Vec<Message>,
    throughput: u32,
    created_at_ms: i64,
) -> BatchRecord {
    let average_latency_s = if messages.is_empty() {
        0.0
    } else {
        messages
            .iter()
            .map(|message| message.latency.total_s)
            .sum::<f64>()
            / messages.len() as f64
    };

    BatchRecord {
        session_id,
        created_at_ms,
        instruments: collect_instruments(&messages),
        average_latency_s,
        throughput,
        messages,
    }
}

fn collect_instruments(messages: &[Message]) -> Vec<String> {
    let mut instruments = BTreeSet::new();
    for message in messages {
        let Value::Object(object) = &message.payload else {
            continue;
        };
        for key in INSTRUMENT_KEYS {
            if let Some(instrument) = object.get(*key).and_then(Value::as_str) {
                instruments.insert(instrument.to_string());
            }
        }
    }
    instruments.into_iter().collect()
}

/// Hands messages and batches to the durable store on spawned tasks so a slow
/// or failing store never stalls ingestion. Individual saves are skipped while
/// the reachability flag is down or when `max_in_flight` saves are already
/// pending; batches still carry every message.
#[derive(Clone)]
pub struct PersistenceDispatcher {
    store: Arc<dyn DurableStore>,
    reachable: Arc<AtomicBool>,
    save_permits: Arc<Semaphore>,
    max_in_flight: usize,
    skipped: Arc<AtomicU64>,
}

impl PersistenceDispatcher {
    pub fn new(store: Arc<dyn DurableStore>, reachable: Arc<AtomicBool>) -> Self {
        Self::with_in_flight_limit(store, reachable, MAX_IN_FLIGHT_SAVES)
    }

    pub fn with_in_flight_limit(
        store: Arc<dyn DurableStore>,
        reachable: Arc<AtomicBool>,
        max_in_flight: usize,
    ) -> Self {
        let max_in_flight = max_in_flight.max(1);
        Self {
            store,
            reachable,
            save_permits: Arc::new(Semaphore::new(max_in_flight)),
            max_in_flight,
            skipped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::Relaxed)
    }

    pub fn in_flight(&self) -> usize {
        self.max_in_flight
            .saturating_sub(self.save_permits.available_permits())
    }

    /// Individual saves skipped because the store was saturated.
    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    pub fn submit_message(&self, message: &Message) {
        if !self.is_reachable() {
            return;
        }

        let Ok(permit) = Arc::clone(&self.save_permits).try_acquire_owned() else {
            let skipped = self.skipped.fetch_add(1, Ordering::Relaxed) + 1;
            if skipped == 1 || skipped % DROP_WARN_EVERY == 0 {
                warn!(
                    "store saturated with {} pending saves, skipped message {} ({skipped} skipped so far)",
                    self.max_in_flight, message.seq
                );
            }
            return;
        };

        let store = Arc::clone(&self.store);
        let message = message.clone();
        tokio::spawn(async move {
            if let Err(error) = store.save_message(&message).await {
                warn!("failed to persist message {}: {error}", message.seq);
            }
            drop(permit);
        });
    }

    pub fn submit_batch(&self, batch: BatchRecord) {
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            let size = batch.messages.len();
            match store.save_batch(&batch).await {
                Ok(()) => debug!("persisted batch of {size} messages"),
                Err(error) => warn!("failed to persist batch of {size} messages: {error}"),
            }
        });
    }
}
