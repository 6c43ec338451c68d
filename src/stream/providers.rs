use crate::error::AppError;
use crate::stream::types::ProviderKind;
use serde_json::json;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};

const OKX_PUBLIC_STREAM_URL: &str = "wss://ws.okx.com:8443/ws/v5/public";
const BINANCE_COMBINED_STREAM_URL: &str = "wss://stream.binance.com:9443/stream";
const OKX_PROBE: &str = "ping";

pub type FeedWsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub fn okx_endpoint() -> String {
    OKX_PUBLIC_STREAM_URL.to_string()
}

pub fn okx_subscription(channel: &str, instrument: &str) -> String {
    json!({
        "op": "subscribe",
        "args": [{ "channel": channel, "instId": instrument }],
    })
    .to_string()
}

pub fn binance_endpoint(symbol: &str, channel: &str) -> String {
    format!(
        "{BINANCE_COMBINED_STREAM_URL}?streams={}@{channel}",
        symbol.to_ascii_lowercase()
    )
}

/// Text frame sent when the feed has been silent for a full liveness window.
/// Binance answers websocket-level pings itself, so only OKX needs one.
pub fn liveness_probe(provider: ProviderKind) -> Option<&'static str> {
    match provider {
        ProviderKind::Okx => Some(OKX_PROBE),
        ProviderKind::Binance | ProviderKind::Custom => None,
    }
}

pub fn validate_custom_uri(uri: &str) -> Result<(), AppError> {
    let lowered = uri.to_ascii_lowercase();
    let remainder = lowered
        .strip_prefix("wss://")
        .or_else(|| lowered.strip_prefix("ws://"))
        .ok_or_else(|| {
            AppError::InvalidArgument("uri must use the ws:// or wss:// scheme".to_string())
        })?;

    let host = remainder.split(['/', '?', '#']).next().unwrap_or_default();
    if host.is_empty() || host.chars().any(char::is_whitespace) {
        return Err(AppError::InvalidArgument(
            "uri must name a host after the scheme".to_string(),
        ));
    }
    Ok(())
}

pub async fn connect_feed_stream(uri: &str) -> Result<FeedWsStream, AppError> {
    let ws_config = WebSocketConfig {
        max_message_size: Some(64 << 20),
        max_frame_size: Some(16 << 20),
        ..Default::default()
    };

    let (stream, _) = connect_async_with_config(uri, Some(ws_config), true).await?;
    Ok(stream)
}
