use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use stream_ingest::commands::stream;
use stream_ingest::error::AppError;
use stream_ingest::state::StreamEngine;
use stream_ingest::store::{DurableStore, NullStore};
use stream_ingest::stream::batcher::PersistenceDispatcher;
use stream_ingest::stream::events::EventPublisher;
use stream_ingest::stream::providers::okx_subscription;
use stream_ingest::stream::supervisor::{run_session, SessionContext, SessionData};
use stream_ingest::stream::types::{
    BatchRecord, ConnectionState, CurrentData, EngineEvent, FormatTag, LogLevel,
    Message as StreamMessage, ProviderKind, StartStreamArgs, StreamConfig,
};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

const OKX_FRAME: &str = r#"{"arg":{"channel":"trades","instId":"BTC-USDT"},"data":[{"instId":"BTC-USDT","px":"64000.1","sz":"0.01","tradeId":"1"},{"instId":"BTC-USDT","px":"64000.2","sz":"0.02","tradeId":"2"}]}"#;

/// What the local feed does per connection.
#[derive(Debug, Clone, Default)]
struct FeedScript {
    /// Text frame sent right after the handshake, by connection index.
    greetings: Vec<String>,
    /// Cut the first connection without a close frame once `drop_first` fires.
    cut_first: bool,
    /// Reply `pong` to the first `ping` text the feed receives.
    answer_first_ping: bool,
}

struct FeedServer {
    uri: String,
    connections: Arc<AtomicUsize>,
    drop_first: Arc<Notify>,
    received: Arc<Mutex<Vec<(usize, String)>>>,
}

impl FeedServer {
    fn received(&self) -> Vec<(usize, String)> {
        self.received.lock().clone()
    }

    fn received_count(&self, text: &str) -> usize {
        self.received
            .lock()
            .iter()
            .filter(|(_, received)| received == text)
            .count()
    }
}

async fn spawn_feed_server(script: FeedScript) -> FeedServer {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("ephemeral port should bind");
    let address = listener.local_addr().expect("local addr");
    let connections = Arc::new(AtomicUsize::new(0));
    let drop_first = Arc::new(Notify::new());
    let received = Arc::new(Mutex::new(Vec::new()));
    let answered_ping = Arc::new(AtomicBool::new(false));

    let server_connections = Arc::clone(&connections);
    let server_drop_first = Arc::clone(&drop_first);
    let server_received = Arc::clone(&received);
    let script = Arc::new(script);
    tokio::spawn(async move {
        while let Ok((tcp, _)) = listener.accept().await {
            let index = server_connections.fetch_add(1, Ordering::SeqCst);
            let drop_first = Arc::clone(&server_drop_first);
            let received = Arc::clone(&server_received);
            let answered_ping = Arc::clone(&answered_ping);
            let script = Arc::clone(&script);
            tokio::spawn(async move {
                let Ok(websocket) = tokio_tungstenite::accept_async(tcp).await else {
                    return;
                };
                let (mut sink, mut source) = websocket.split();

                if let Some(greeting) = script.greetings.get(index) {
                    if sink.send(Message::Text(greeting.clone())).await.is_err() {
                        return;
                    }
                }

                if index == 0 && script.cut_first {
                    drop_first.notified().await;
                    return;
                }

                while let Some(Ok(message)) = source.next().await {
                    match message {
                        Message::Text(text) => {
                            let reply = script.answer_first_ping
                                && text == "ping"
                                && !answered_ping.swap(true, Ordering::SeqCst);
                            received.lock().push((index, text));
                            if reply && sink.send(Message::Text("pong".to_string())).await.is_err() {
                                break;
                            }
                        }
                        Message::Close(_) => break,
                        _ => {}
                    }
                }
            });
        }
    });

    FeedServer {
        uri: format!("ws://{address}"),
        connections,
        drop_first,
        received,
    }
}

/// Store that is always reachable and records `(session_id, seq)` of every
/// individually saved message.
#[derive(Default)]
struct RecordingStore {
    saved: Mutex<Vec<(u64, u64)>>,
}

#[async_trait]
impl DurableStore for RecordingStore {
    async fn save_message(&self, message: &StreamMessage) -> Result<(), AppError> {
        self.saved.lock().push((message.session_id, message.seq));
        Ok(())
    }

    async fn save_batch(&self, _batch: &BatchRecord) -> Result<(), AppError> {
        Ok(())
    }

    async fn is_reachable(&self) -> bool {
        true
    }
}

async fn eventually<F>(what: &str, condition: F)
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn wait_for_data<F>(engine: &StreamEngine, what: &str, condition: F) -> CurrentData
where
    F: Fn(&CurrentData) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let data = stream::current_data(engine).await.expect("current data");
        if condition(&data) {
            return data;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn wait_for_state(engine: &StreamEngine, state: ConnectionState) {
    let what = format!("state {}", state.as_str());
    wait_for_data(engine, &what, |data| data.status.state == state).await;
}

#[tokio::test]
async fn ingests_frames_reconnects_after_abnormal_close_and_stops_on_disconnect() {
    let server = spawn_feed_server(FeedScript {
        greetings: vec![OKX_FRAME.to_string()],
        cut_first: true,
        ..FeedScript::default()
    })
    .await;
    let engine = StreamEngine::new(Arc::new(NullStore));
    let mut events = stream::subscribe_events(&engine);

    let session = stream::connect(
        &engine,
        Some(StartStreamArgs {
            provider: Some(ProviderKind::Custom),
            uri: Some(server.uri.clone()),
            ..StartStreamArgs::default()
        }),
    )
    .await
    .expect("session should start");
    assert_eq!(session.uri, server.uri);

    let data = wait_for_data(&engine, "two retained records", |data| {
        data.message_count == 2
    })
    .await;
    assert_eq!(data.format, Some(FormatTag::Okx));
    assert_eq!(data.records.len(), 2);
    assert_eq!(data.records[0]["tradeId"], json!("1"));
    assert_eq!(data.records[1]["px"], json!("64000.2"));
    assert_eq!(data.metrics.total_messages, 2);
    assert_eq!(data.metrics.latency_series.len(), 2);
    assert_eq!(data.status.state, ConnectionState::Open);

    server.drop_first.notify_one();

    let reconnecting = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(EngineEvent::Status(snapshot))
                    if snapshot.state == ConnectionState::Reconnecting =>
                {
                    return snapshot;
                }
                Ok(_) => {}
                Err(error) => panic!("event channel failed: {error}"),
            }
        }
    })
    .await
    .expect("abnormal close should schedule a reconnect");
    assert_eq!(reconnecting.reconnect_attempt, 1);
    assert_eq!(reconnecting.next_retry_ms, Some(1_000));

    wait_for_state(&engine, ConnectionState::Open).await;
    assert_eq!(server.connections.load(Ordering::SeqCst), 2);

    let stopped = stream::disconnect(&engine).await.expect("disconnect");
    assert!(stopped.stopped);
    assert_eq!(
        stream::stream_status(&engine).await.expect("status").state,
        ConnectionState::Idle
    );

    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert_eq!(server.connections.load(Ordering::SeqCst), 2);
    assert!(!stream::disconnect(&engine).await.expect("disconnect").stopped);

    engine.shutdown().await;
}

#[tokio::test]
async fn exhausted_retry_budget_ends_in_failed() {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("ephemeral port should bind");
    let address = listener.local_addr().expect("local addr");
    drop(listener);

    let engine = StreamEngine::new(Arc::new(NullStore));
    stream::connect(
        &engine,
        Some(StartStreamArgs {
            provider: Some(ProviderKind::Custom),
            uri: Some(format!("ws://{address}")),
            max_reconnect_attempts: Some(1),
            ..StartStreamArgs::default()
        }),
    )
    .await
    .expect("session should start");

    wait_for_state(&engine, ConnectionState::Failed).await;

    let log = stream::event_log(&engine);
    assert!(log.iter().any(|entry| entry.text.starts_with("stream failed")));

    stream::disconnect(&engine).await.expect("disconnect");
    assert_eq!(
        stream::stream_status(&engine).await.expect("status").state,
        ConnectionState::Idle
    );
    engine.shutdown().await;
}

#[tokio::test]
async fn sequence_numbers_stay_unique_across_reconnects() {
    let server = spawn_feed_server(FeedScript {
        greetings: vec![r#"{"price":0}"#.to_string(), r#"{"price":1}"#.to_string()],
        cut_first: true,
        ..FeedScript::default()
    })
    .await;
    let store = Arc::new(RecordingStore::default());
    let engine = StreamEngine::with_poll_interval(
        Arc::clone(&store) as Arc<dyn DurableStore>,
        Duration::from_millis(50),
    );
    eventually("store reachability", || engine.is_store_reachable()).await;

    let session = stream::connect(
        &engine,
        Some(StartStreamArgs {
            provider: Some(ProviderKind::Custom),
            uri: Some(server.uri.clone()),
            ..StartStreamArgs::default()
        }),
    )
    .await
    .expect("session should start");

    eventually("first save", || store.saved.lock().len() == 1).await;
    server.drop_first.notify_one();
    eventually("save after reconnect", || store.saved.lock().len() == 2).await;

    assert_eq!(server.connections.load(Ordering::SeqCst), 2);
    assert_eq!(
        store.saved.lock().clone(),
        vec![(session.session_id, 0), (session.session_id, 1)]
    );

    stream::disconnect(&engine).await.expect("disconnect");
    engine.shutdown().await;
}

#[tokio::test]
async fn subscription_is_sent_after_open_even_when_not_json() {
    let server = spawn_feed_server(FeedScript::default()).await;
    let engine = StreamEngine::new(Arc::new(NullStore));

    stream::connect(
        &engine,
        Some(StartStreamArgs {
            provider: Some(ProviderKind::Custom),
            uri: Some(server.uri.clone()),
            subscription: Some("subscribe trades".to_string()),
            ..StartStreamArgs::default()
        }),
    )
    .await
    .expect("session should start");
    eventually("raw subscription", || server.received().len() == 1).await;
    assert_eq!(server.received(), vec![(0, "subscribe trades".to_string())]);

    let json_subscription = r#"{"op":"subscribe","args":[{"channel":"trades"}]}"#;
    stream::connect(
        &engine,
        Some(StartStreamArgs {
            provider: Some(ProviderKind::Custom),
            uri: Some(server.uri.clone()),
            subscription: Some(json_subscription.to_string()),
            ..StartStreamArgs::default()
        }),
    )
    .await
    .expect("replacement session should start");
    eventually("json subscription", || server.received().len() == 2).await;
    assert_eq!(server.received()[1], (1, json_subscription.to_string()));

    let log = stream::event_log(&engine);
    let raw_warnings = log
        .iter()
        .filter(|entry| {
            entry.level == LogLevel::Warn && entry.text.starts_with("subscription is not valid JSON")
        })
        .count();
    assert_eq!(raw_warnings, 1);
    assert_eq!(
        log.iter()
            .filter(|entry| entry.text == "subscription sent")
            .count(),
        2
    );

    stream::disconnect(&engine).await.expect("disconnect");
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn idle_feed_gets_one_liveness_ping_per_silent_window() {
    let server = spawn_feed_server(FeedScript {
        answer_first_ping: true,
        ..FeedScript::default()
    })
    .await;

    let subscription = okx_subscription("trades", "BTC-USDT");
    let publisher = EventPublisher::new();
    let cancel_token = CancellationToken::new();
    let context = SessionContext {
        session_id: 1,
        config: StreamConfig {
            provider: ProviderKind::Okx,
            uri: server.uri.clone(),
            subscription: Some(subscription.clone()),
            instrument: Some("BTC-USDT".to_string()),
            channel: Some("trades".to_string()),
            max_reconnect_attempts: 3,
        },
        publisher: publisher.clone(),
        data: Arc::new(Mutex::new(SessionData::new(Some(1), 0))),
        persistence: PersistenceDispatcher::new(
            Arc::new(NullStore),
            Arc::new(AtomicBool::new(false)),
        ),
        manual_disconnect: Arc::new(AtomicBool::new(false)),
        cancel_token: cancel_token.clone(),
    };
    let session = tokio::spawn(run_session(context));

    eventually("subscription", || server.received_count(&subscription) == 1).await;
    assert_eq!(server.received_count("ping"), 0);

    // 100 s of silence: one probe at the 60 s mark, answered with a pong.
    tokio::time::sleep(Duration::from_secs(100)).await;
    assert_eq!(server.received_count("ping"), 1);

    // The pong restarted the window; the unanswered second probe is not repeated.
    tokio::time::sleep(Duration::from_secs(200)).await;
    assert_eq!(server.received_count("ping"), 2);
    assert_eq!(server.connections.load(Ordering::SeqCst), 1);
    assert_eq!(publisher.status().await.state, ConnectionState::Open);

    cancel_token.cancel();
    session.await.expect("session task should finish");
    assert_eq!(publisher.status().await.state, ConnectionState::Idle);
}
