use crate::error::AppError;
use crate::state::{StreamEngine, StreamSessionHandle};
use crate::stream::batcher::PersistenceDispatcher;
use crate::stream::now_unix_ms;
use crate::stream::supervisor::{run_session, SessionContext, SessionData};
use crate::stream::types::{
    ConnectionState, CurrentData, EngineEvent, LogEntry, StartStreamArgs, StatusSnapshot,
    StreamSession, StreamStopResult,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Validates the request, tears down any live session and starts a fresh one.
/// Invalid arguments fail before any state changes.
pub async fn connect(
    engine: &StreamEngine,
    args: Option<StartStreamArgs>,
) -> Result<StreamSession, AppError> {
    let config = args.unwrap_or_default().normalize()?;

    let mut stream_slot = engine.stream_session.lock().await;
    if let Some(handle) = stream_slot.take() {
        stop_session(handle).await;
    }

    let session_id = engine.allocate_session_id();
    *engine.session_data.lock() = SessionData::new(Some(session_id), now_unix_ms());

    engine
        .publisher
        .publish_status(StatusSnapshot {
            state: ConnectionState::Connecting,
            session_id: Some(session_id),
            provider: Some(config.provider),
            uri: Some(config.uri.clone()),
            reconnect_attempt: 0,
            next_retry_ms: None,
            message_count: 0,
            realtime: false,
            format: None,
            reason: Some("opening websocket stream".to_string()),
        })
        .await;

    let cancellation_token = CancellationToken::new();
    let manual_disconnect = Arc::new(AtomicBool::new(false));
    let context = SessionContext {
        session_id,
        config: config.clone(),
        publisher: engine.publisher.clone(),
        data: Arc::clone(&engine.session_data),
        persistence: PersistenceDispatcher::new(
            Arc::clone(&engine.store),
            Arc::clone(&engine.store_reachable),
        ),
        manual_disconnect: Arc::clone(&manual_disconnect),
        cancel_token: cancellation_token.clone(),
    };

    info!(
        "starting session {session_id} ({}) on {}",
        config.provider.as_str(),
        config.uri
    );
    let join_handle = tokio::spawn(run_session(context));

    *stream_slot = Some(StreamSessionHandle {
        session_id,
        cancellation_token,
        manual_disconnect,
        join_handle,
    });

    Ok(StreamSession::from_config(session_id, &config))
}

/// Idempotent: with no live session this reports `stopped: false`.
pub async fn disconnect(engine: &StreamEngine) -> Result<StreamStopResult, AppError> {
    let existing_handle = {
        let mut stream_slot = engine.stream_session.lock().await;
        stream_slot.take()
    };

    let Some(handle) = existing_handle else {
        return Ok(StreamStopResult { stopped: false });
    };

    let session_id = handle.session_id;
    stop_session(handle).await;
    info!("session {session_id} stopped");

    let mut snapshot = engine.publisher.status().await;
    if snapshot.state != ConnectionState::Idle {
        snapshot.state = ConnectionState::Idle;
        snapshot.reconnect_attempt = 0;
        snapshot.next_retry_ms = None;
        snapshot.reason = Some("stream stopped by command".to_string());
        engine.publisher.publish_status(snapshot).await;
    }

    Ok(StreamStopResult { stopped: true })
}

async fn stop_session(handle: StreamSessionHandle) {
    handle.manual_disconnect.store(true, Ordering::SeqCst);
    handle.cancellation_token.cancel();
    let _ = handle.join_handle.await;
}

pub async fn stream_status(engine: &StreamEngine) -> Result<StatusSnapshot, AppError> {
    Ok(engine.publisher.status().await)
}

pub async fn current_data(engine: &StreamEngine) -> Result<CurrentData, AppError> {
    let status = engine.publisher.status().await;
    let data = engine.session_data.lock().current_data(status);
    Ok(data)
}

pub fn event_log(engine: &StreamEngine) -> Vec<LogEntry> {
    engine.publisher.event_log()
}

pub fn subscribe_events(engine: &StreamEngine) -> broadcast::Receiver<EngineEvent> {
    engine.publisher.subscribe()
}
