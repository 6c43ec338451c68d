use crate::stream::batcher::{PersistenceBatcher, PersistenceDispatcher};
use crate::stream::events::EventPublisher;
use crate::stream::metrics::MetricsAggregator;
use crate::stream::normalizer::{Classification, ControlFrame, Frame, MessageNormalizer};
use crate::stream::now_unix_ms;
use crate::stream::providers::{connect_feed_stream, liveness_probe, FeedWsStream};
use crate::stream::retention::RetentionBuffer;
use crate::stream::types::{
    ConnectionState, CurrentData, EngineEvent, FormatTag, LogLevel, Message, StatusSnapshot,
    StreamConfig,
};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const RECONNECT_BASE_MS: u64 = 1_000;
const RECONNECT_MAX_MS: u64 = 30_000;
const METRICS_TICK: Duration = Duration::from_secs(1);
const BATCH_TICK: Duration = Duration::from_secs(5);
const LIVENESS_CHECK_INTERVAL: Duration = Duration::from_secs(10);
const LIVENESS_IDLE_WINDOW: Duration = Duration::from_secs(60);

pub const CLOSE_CODE_NORMAL: u16 = 1000;
pub const CLOSE_CODE_NO_STATUS: u16 = 1005;
pub const CLOSE_CODE_ABNORMAL: u16 = 1006;

/// `min(1s * 2^(attempt - 1), 30s)`; attempt zero means no wait.
pub fn reconnect_delay(attempt: u32) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    let exponent = (attempt - 1).min(16);
    let delay_ms = RECONNECT_BASE_MS
        .saturating_mul(1_u64 << exponent)
        .min(RECONNECT_MAX_MS);
    Duration::from_millis(delay_ms)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseDisposition {
    /// Operator-initiated: stay down.
    Stop,
    Reconnect { attempt: u32, delay: Duration },
    /// Retry budget spent.
    GiveUp { attempts: u32 },
}

/// Connection state machine. Socket-free so that every transition can be
/// driven directly.
#[derive(Debug)]
pub struct ConnectionSupervisor {
    state: ConnectionState,
    attempt: u32,
    max_attempts: u32,
    manual_disconnect: Arc<AtomicBool>,
}

impl ConnectionSupervisor {
    pub fn new(max_attempts: u32, manual_disconnect: Arc<AtomicBool>) -> Self {
        Self {
            state: ConnectionState::Idle,
            attempt: 0,
            max_attempts: max_attempts.max(1),
            manual_disconnect,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_manual_disconnect(&self) -> bool {
        self.manual_disconnect.load(Ordering::SeqCst)
    }

    pub fn begin_connect(&mut self) {
        self.state = ConnectionState::Connecting;
    }

    pub fn on_open(&mut self) {
        self.state = ConnectionState::Open;
        self.attempt = 0;
    }

    pub fn begin_close(&mut self) {
        self.manual_disconnect.store(true, Ordering::SeqCst);
        self.state = ConnectionState::Closing;
    }

    pub fn on_close(&mut self, code: u16) -> CloseDisposition {
        if self.is_manual_disconnect() {
            self.state = ConnectionState::Idle;
            return CloseDisposition::Stop;
        }

        if code == CLOSE_CODE_NORMAL {
            debug!("stream closed normally by remote, reconnecting");
        }

        self.attempt = self.attempt.saturating_add(1);
        if self.attempt > self.max_attempts {
            self.state = ConnectionState::Failed;
            return CloseDisposition::GiveUp {
                attempts: self.max_attempts,
            };
        }

        self.state = ConnectionState::Reconnecting;
        CloseDisposition::Reconnect {
            attempt: self.attempt,
            delay: reconnect_delay(self.attempt),
        }
    }
}

/// Per-connection aggregates read by the operator layer. Reset every time a
/// connection is attempted.
#[derive(Debug)]
pub struct SessionData {
    pub session_id: Option<u64>,
    pub connect_ms: i64,
    pub first_message_ms: Option<i64>,
    pub message_count: u64,
    pub format: Option<FormatTag>,
    pub realtime: bool,
    pub metrics: MetricsAggregator,
    pub retention: RetentionBuffer,
}

impl Default for SessionData {
    fn default() -> Self {
        Self::new(None, 0)
    }
}

impl SessionData {
    pub fn new(session_id: Option<u64>, connect_ms: i64) -> Self {
        Self {
            session_id,
            connect_ms,
            first_message_ms: None,
            message_count: 0,
            format: None,
            realtime: false,
            metrics: MetricsAggregator::new(connect_ms),
            retention: RetentionBuffer::default(),
        }
    }

    pub fn current_data(&self, status: StatusSnapshot) -> CurrentData {
        CurrentData {
            records: self.retention.records(),
            message_count: self.message_count,
            duplicates_removed: self.retention.duplicates_removed(),
            format: self.format,
            realtime: self.realtime,
            metrics: self.metrics.snapshot(),
            status,
        }
    }
}

pub type SharedSessionData = Arc<Mutex<SessionData>>;

pub struct SessionContext {
    pub session_id: u64,
    pub config: StreamConfig,
    pub publisher: EventPublisher,
    pub data: SharedSessionData,
    pub persistence: PersistenceDispatcher,
    pub manual_disconnect: Arc<AtomicBool>,
    pub cancel_token: CancellationToken,
}

impl SessionContext {
    fn snapshot(
        &self,
        state: ConnectionState,
        reconnect_attempt: u32,
        next_retry: Option<Duration>,
        reason: Option<String>,
    ) -> StatusSnapshot {
        let data = self.data.lock();
        StatusSnapshot {
            state,
            session_id: Some(self.session_id),
            provider: Some(self.config.provider),
            uri: Some(self.config.uri.clone()),
            reconnect_attempt,
            next_retry_ms: next_retry.map(|delay| delay.as_millis() as u64),
            message_count: data.message_count,
            realtime: data.realtime,
            format: data.format,
            reason,
        }
    }

    async fn publish(
        &self,
        state: ConnectionState,
        reconnect_attempt: u32,
        next_retry: Option<Duration>,
        reason: Option<String>,
    ) {
        let snapshot = self.snapshot(state, reconnect_attempt, next_retry, reason);
        self.publisher.publish_status(snapshot).await;
    }

    fn reset_session_data(&self) {
        *self.data.lock() = SessionData::new(Some(self.session_id), now_unix_ms());
    }
}

/// State owned by the session task that outlives individual connections:
/// the batch queue and the sequence counter.
#[derive(Debug)]
struct SessionRuntime {
    batcher: PersistenceBatcher,
    next_seq: u64,
}

impl SessionRuntime {
    fn new(session_id: u64) -> Self {
        Self {
            batcher: PersistenceBatcher::new(session_id),
            next_seq: 0,
        }
    }

    fn allocate_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.saturating_add(1);
        seq
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamEnd {
    Closed(u16),
    Cancelled,
}

/// Owns one session: connects, drains frames and ticks on a single task, and
/// reconnects with backoff until cancelled, manually closed or out of
/// attempts. The first `Connecting` transition is published by the caller.
pub async fn run_session(context: SessionContext) {
    let mut supervisor = ConnectionSupervisor::new(
        context.config.max_reconnect_attempts,
        Arc::clone(&context.manual_disconnect),
    );
    let mut runtime = SessionRuntime::new(context.session_id);
    let mut failed = false;

    while !context.cancel_token.is_cancelled() {
        supervisor.begin_connect();
        if supervisor.attempt() > 0 {
            context.reset_session_data();
            context
                .publish(
                    ConnectionState::Connecting,
                    supervisor.attempt(),
                    None,
                    Some(format!("reconnect attempt {}", supervisor.attempt())),
                )
                .await;
        }

        let connected = tokio::select! {
            _ = context.cancel_token.cancelled() => break,
            result = connect_feed_stream(&context.config.uri) => result,
        };

        let close_code = match connected {
            Ok(stream) => {
                supervisor.on_open();
                {
                    let mut data = context.data.lock();
                    data.connect_ms = now_unix_ms();
                    data.metrics = MetricsAggregator::new(data.connect_ms);
                }
                info!(
                    "session {} connected to {}",
                    context.session_id, context.config.uri
                );
                context
                    .publish(
                        ConnectionState::Open,
                        0,
                        None,
                        Some("websocket connected".to_string()),
                    )
                    .await;

                match drive_open_stream(&context, stream, &mut runtime).await {
                    StreamEnd::Cancelled => {
                        supervisor.begin_close();
                        supervisor.on_close(CLOSE_CODE_NORMAL);
                        break;
                    }
                    StreamEnd::Closed(code) => code,
                }
            }
            Err(error) => {
                warn!("session {} connect failed: {error}", context.session_id);
                context
                    .publisher
                    .log_throttled(LogLevel::Warn, format!("websocket connect error: {error}"));
                CLOSE_CODE_ABNORMAL
            }
        };

        match supervisor.on_close(close_code) {
            CloseDisposition::Stop => break,
            CloseDisposition::GiveUp { attempts } => {
                context
                    .publish(
                        ConnectionState::Failed,
                        attempts,
                        None,
                        Some(format!(
                            "gave up after {attempts} reconnect attempt(s), last close code {close_code}"
                        )),
                    )
                    .await;
                failed = true;
                break;
            }
            CloseDisposition::Reconnect { attempt, delay } => {
                context
                    .publish(
                        ConnectionState::Reconnecting,
                        attempt,
                        Some(delay),
                        Some(format!("connection closed with code {close_code}")),
                    )
                    .await;

                tokio::select! {
                    _ = context.cancel_token.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    if runtime.batcher.dropped() > 0 {
        warn!(
            "session {} dropped {} queued message(s) while the store was unreachable",
            context.session_id,
            runtime.batcher.dropped()
        );
    }

    if !failed {
        context
            .publish(
                ConnectionState::Idle,
                0,
                None,
                Some("stream stopped".to_string()),
            )
            .await;
    }
}

async fn drive_open_stream(
    context: &SessionContext,
    stream: FeedWsStream,
    runtime: &mut SessionRuntime,
) -> StreamEnd {
    let (mut sink, mut source) = stream.split();
    let mut normalizer = MessageNormalizer::new(context.config.provider);

    if let Some(subscription) = context.config.subscription.as_ref() {
        if serde_json::from_str::<serde_json::Value>(subscription).is_err() {
            context.publisher.log(
                LogLevel::Warn,
                "subscription is not valid JSON, sending it as raw text",
            );
        }
        if let Err(error) = sink.send(WsMessage::Text(subscription.clone())).await {
            warn!("failed to send subscription: {error}");
            return StreamEnd::Closed(CLOSE_CODE_ABNORMAL);
        }
        context.publisher.log(LogLevel::Info, "subscription sent");
    }

    let mut metrics_ticker = tokio::time::interval(METRICS_TICK);
    metrics_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut batch_ticker =
        tokio::time::interval_at(tokio::time::Instant::now() + BATCH_TICK, BATCH_TICK);
    batch_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut liveness_ticker = tokio::time::interval_at(
        tokio::time::Instant::now() + LIVENESS_CHECK_INTERVAL,
        LIVENESS_CHECK_INTERVAL,
    );
    liveness_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut last_inbound = tokio::time::Instant::now();
    let mut probe_sent = false;

    loop {
        tokio::select! {
            _ = context.cancel_token.cancelled() => {
                let close = WsMessage::Close(Some(CloseFrame {
                    code: CloseCode::Normal,
                    reason: "client disconnect".into(),
                }));
                if let Err(error) = sink.send(close).await {
                    debug!("close frame not delivered: {error}");
                }
                return StreamEnd::Cancelled;
            }
            next_message = source.next() => {
                let Some(frame_result) = next_message else {
                    return StreamEnd::Closed(CLOSE_CODE_ABNORMAL);
                };

                let message = match frame_result {
                    Ok(message) => message,
                    Err(error) => {
                        context
                            .publisher
                            .log_throttled(LogLevel::Warn, format!("websocket frame error: {error}"));
                        return StreamEnd::Closed(CLOSE_CODE_ABNORMAL);
                    }
                };

                last_inbound = tokio::time::Instant::now();
                probe_sent = false;

                let arrival_ms = now_unix_ms();
                match message {
                    WsMessage::Text(text) => {
                        handle_frame(context, &mut normalizer, runtime, Frame::Text(text), arrival_ms);
                    }
                    WsMessage::Binary(bytes) => {
                        handle_frame(context, &mut normalizer, runtime, Frame::Binary(bytes), arrival_ms);
                    }
                    WsMessage::Close(close_frame) => {
                        let code = close_frame
                            .map(|frame| u16::from(frame.code))
                            .unwrap_or(CLOSE_CODE_NO_STATUS);
                        return StreamEnd::Closed(code);
                    }
                    WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => {}
                }
            }
            _ = metrics_ticker.tick() => {
                let now_ms = now_unix_ms();
                let (message_count, realtime, format) = {
                    let mut data = context.data.lock();
                    data.metrics.tick(now_ms);
                    (data.message_count, data.realtime, data.format)
                };
                context
                    .publisher
                    .refresh_status(|snapshot| {
                        snapshot.message_count = message_count;
                        snapshot.realtime = realtime;
                        snapshot.format = format;
                    })
                    .await;
            }
            _ = batch_ticker.tick() => {
                let throughput = context.data.lock().metrics.current_throughput();
                if let Some(batch) =
                    runtime.batcher.on_tick(context.persistence.is_reachable(), throughput, now_unix_ms())
                {
                    context.persistence.submit_batch(batch);
                }
            }
            _ = liveness_ticker.tick() => {
                if probe_sent || last_inbound.elapsed() < LIVENESS_IDLE_WINDOW {
                    continue;
                }
                probe_sent = true;
                let Some(probe) = liveness_probe(context.config.provider) else {
                    continue;
                };
                context
                    .publisher
                    .log(LogLevel::Info, "feed idle, sending liveness probe");
                if let Err(error) = sink.send(WsMessage::Text(probe.to_string())).await {
                    warn!("liveness probe failed: {error}");
                    return StreamEnd::Closed(CLOSE_CODE_ABNORMAL);
                }
            }
        }
    }
}

/// Normalizes one inbound data frame and fans its records out to metrics,
/// retention and persistence.
fn handle_frame(
    context: &SessionContext,
    normalizer: &mut MessageNormalizer,
    runtime: &mut SessionRuntime,
    frame: Frame,
    arrival_ms: i64,
) {
    let transform_started = Instant::now();
    let outcome = normalizer.normalize(frame, arrival_ms);
    let transform_s = transform_started.elapsed().as_secs_f64();

    let (format, records) = match outcome.classification {
        Classification::Control(ControlFrame::SubscriptionAck) => {
            context
                .publisher
                .log(LogLevel::Info, "subscription acknowledged");
            return;
        }
        Classification::Control(control) => {
            debug!("control frame {control:?}");
            return;
        }
        Classification::Records { format, records } => (format, records),
    };
    if records.is_empty() {
        return;
    }

    if let Some(changed) = outcome.format_changed {
        context.publisher.log(
            LogLevel::Info,
            format!("data format detected: {}", changed.as_str()),
        );
        context.publisher.emit(EngineEvent::FormatChanged(changed));
    }
    if outcome.realtime_detected {
        context
            .publisher
            .log(LogLevel::Info, "real-time stream detected");
        context.publisher.emit(EngineEvent::Realtime(true));
    }

    let record_count = records.len();
    let per_record_transform_s = transform_s / record_count as f64;
    let mut messages = Vec::with_capacity(record_count);
    let throughput = {
        let mut data = context.data.lock();
        data.first_message_ms.get_or_insert(arrival_ms);
        data.format = Some(format);
        data.realtime = normalizer.is_realtime();

        for payload in records {
            let seq = runtime.allocate_seq();
            data.message_count = data.message_count.saturating_add(1);
            let latency = data.metrics.record(seq, arrival_ms, per_record_transform_s);
            data.retention.append(payload.clone());
            messages.push(Message {
                session_id: context.session_id,
                seq,
                arrival_ms,
                format,
                payload,
                latency,
            });
        }

        data.metrics.current_throughput()
    };

    let reachable = context.persistence.is_reachable();
    for message in messages {
        context.persistence.submit_message(&message);
        if let Some(batch) = runtime.batcher.push(message, reachable, throughput, now_unix_ms()) {
            context.persistence.submit_batch(batch);
        }
    }

    context.publisher.log(
        LogLevel::Data,
        format!("received {record_count} record(s) [{}]", format.as_str()),
    );
}
