use crate::error::AppError;
use crate::stream::providers::{binance_endpoint, okx_endpoint, okx_subscription, validate_custom_uri};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_PROVIDER: ProviderKind = ProviderKind::Binance;
pub const DEFAULT_INSTRUMENT: &str = "BTC-USDT";
pub const DEFAULT_OKX_CHANNEL: &str = "trades";
pub const DEFAULT_BINANCE_CHANNEL: &str = "trade";
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = u32::MAX;
pub const MAX_SUBSCRIPTION_BYTES: usize = 64 * 1024;

pub const RETENTION_CAPACITY: usize = 1_000;
pub const DEDUP_STRIDE: usize = 100;
pub const LATENCY_SERIES_CAPACITY: usize = 100;
pub const THROUGHPUT_SERIES_CAPACITY: usize = 60;
pub const SCALABILITY_SERIES_CAPACITY: usize = 60;
pub const EVENT_LOG_CAPACITY: usize = 500;
pub const BATCH_SIZE: usize = 50;
pub const BATCH_QUEUE_CAPACITY: usize = 5_000;
pub const LOAD_TIME_SECONDS: f64 = 0.001;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Custom,
    Okx,
    Binance,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Custom => "custom",
            Self::Okx => "okx",
            Self::Binance => "binance",
        }
    }

    pub fn parse_str(value: &str) -> Result<Self, AppError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "custom" => Ok(Self::Custom),
            "okx" => Ok(Self::Okx),
            "binance" => Ok(Self::Binance),
            other => Err(AppError::InvalidArgument(format!(
                "unknown provider '{other}' (expected custom, okx or binance)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closing,
    Reconnecting,
    Failed,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum FormatTag {
    #[serde(rename = "okx")]
    Okx,
    #[serde(rename = "binance-stream")]
    BinanceStream,
    #[serde(rename = "binance-event")]
    BinanceEvent,
    #[serde(rename = "array")]
    Array,
    #[serde(rename = "realtime-object")]
    RealtimeObject,
    #[serde(rename = "json-object")]
    JsonObject,
    #[serde(rename = "primitive")]
    Primitive,
    #[serde(rename = "text")]
    Text,
}

impl FormatTag {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Okx => "okx",
            Self::BinanceStream => "binance-stream",
            Self::BinanceEvent => "binance-event",
            Self::Array => "array",
            Self::RealtimeObject => "realtime-object",
            Self::JsonObject => "json-object",
            Self::Primitive => "primitive",
            Self::Text => "text",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StartStreamArgs {
    pub provider: Option<ProviderKind>,
    pub uri: Option<String>,
    pub subscription: Option<String>,
    pub instrument: Option<String>,
    pub channel: Option<String>,
    pub max_reconnect_attempts: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    pub provider: ProviderKind,
    pub uri: String,
    pub subscription: Option<String>,
    pub instrument: Option<String>,
    pub channel: Option<String>,
    pub max_reconnect_attempts: u32,
}

fn normalize_selector(value: Option<String>, default: &str, field: &str) -> Result<String, AppError> {
    let selector = value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string());

    if !selector
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
    {
        return Err(AppError::InvalidArgument(format!(
            "{field} must be alphanumeric ASCII (dashes and underscores allowed)"
        )));
    }
    Ok(selector)
}

impl StartStreamArgs {
    pub fn normalize(self) -> Result<StreamConfig, AppError> {
        let provider = self.provider.unwrap_or(DEFAULT_PROVIDER);
        let max_reconnect_attempts = self
            .max_reconnect_attempts
            .unwrap_or(DEFAULT_MAX_RECONNECT_ATTEMPTS);
        if max_reconnect_attempts == 0 {
            return Err(AppError::InvalidArgument(
                "maxReconnectAttempts must be at least 1".to_string(),
            ));
        }

        let subscription = self
            .subscription
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        if let Some(payload) = subscription.as_ref() {
            if payload.len() > MAX_SUBSCRIPTION_BYTES {
                return Err(AppError::InvalidArgument(format!(
                    "subscription must not exceed {MAX_SUBSCRIPTION_BYTES} bytes"
                )));
            }
        }

        match provider {
            ProviderKind::Custom => {
                let uri = self.uri.map(|value| value.trim().to_string()).ok_or_else(|| {
                    AppError::InvalidArgument("uri is required for the custom provider".to_string())
                })?;
                validate_custom_uri(&uri)?;

                Ok(StreamConfig {
                    provider,
                    uri,
                    subscription,
                    instrument: None,
                    channel: None,
                    max_reconnect_attempts,
                })
            }
            ProviderKind::Okx => {
                let instrument =
                    normalize_selector(self.instrument, DEFAULT_INSTRUMENT, "instrument")?
                        .to_ascii_uppercase();
                let channel = normalize_selector(self.channel, DEFAULT_OKX_CHANNEL, "channel")?;

                Ok(StreamConfig {
                    provider,
                    uri: okx_endpoint(),
                    subscription: Some(okx_subscription(&channel, &instrument)),
                    instrument: Some(instrument),
                    channel: Some(channel),
                    max_reconnect_attempts,
                })
            }
            ProviderKind::Binance => {
                let instrument =
                    normalize_selector(self.instrument, DEFAULT_INSTRUMENT, "instrument")?
                        .replace('-', "")
                        .to_ascii_uppercase();
                let channel =
                    normalize_selector(self.channel, DEFAULT_BINANCE_CHANNEL, "channel")?;

                Ok(StreamConfig {
                    provider,
                    uri: binance_endpoint(&instrument, &channel),
                    subscription: None,
                    instrument: Some(instrument),
                    channel: Some(channel),
                    max_reconnect_attempts,
                })
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSession {
    pub running: bool,
    pub session_id: u64,
    pub provider: ProviderKind,
    pub uri: String,
    pub has_subscription: bool,
    pub instrument: Option<String>,
    pub channel: Option<String>,
}

impl StreamSession {
    pub fn from_config(session_id: u64, config: &StreamConfig) -> Self {
        Self {
            running: true,
            session_id,
            provider: config.provider,
            uri: config.uri.clone(),
            has_subscription: config.subscription.is_some(),
            instrument: config.instrument.clone(),
            channel: config.channel.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStopResult {
    pub stopped: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub state: ConnectionState,
    pub session_id: Option<u64>,
    pub provider: Option<ProviderKind>,
    pub uri: Option<String>,
    pub reconnect_attempt: u32,
    pub next_retry_ms: Option<u64>,
    pub message_count: u64,
    pub realtime: bool,
    pub format: Option<FormatTag>,
    pub reason: Option<String>,
}

impl StatusSnapshot {
    pub fn idle(reason: Option<String>) -> Self {
        Self {
            state: ConnectionState::Idle,
            session_id: None,
            provider: None,
            uri: None,
            reconnect_attempt: 0,
            next_retry_ms: None,
            message_count: 0,
            realtime: false,
            format: None,
            reason,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct LatencyBreakdown {
    pub extract_s: f64,
    pub transform_s: f64,
    pub load_s: f64,
    pub total_s: f64,
}

impl LatencyBreakdown {
    pub fn new(extract_s: f64, transform_s: f64, load_s: f64) -> Self {
        Self {
            extract_s,
            transform_s,
            load_s,
            total_s: extract_s + transform_s + load_s,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub session_id: u64,
    pub seq: u64,
    pub arrival_ms: i64,
    pub format: FormatTag,
    pub payload: Value,
    pub latency: LatencyBreakdown,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ThroughputPoint {
    pub t: i64,
    pub count: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LatencyPoint {
    pub seq: u64,
    pub t: i64,
    pub extract_s: f64,
    pub transform_s: f64,
    pub load_s: f64,
    pub total_s: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScalabilityPoint {
    pub t: i64,
    pub message_count: u64,
    pub avg_latency_s: f64,
    pub throughput: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub throughput: u32,
    pub latency_series: Vec<LatencyPoint>,
    pub throughput_series: Vec<ThroughputPoint>,
    pub scalability_series: Vec<ScalabilityPoint>,
    pub total_messages: u64,
    pub average_latency_s: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BatchRecord {
    pub session_id: u64,
    pub created_at_ms: i64,
    pub messages: Vec<Message>,
    pub instruments: Vec<String>,
    pub average_latency_s: f64,
    pub throughput: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
    Data,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub t: i64,
    pub level: LogLevel,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CurrentData {
    pub records: Vec<Value>,
    pub message_count: u64,
    pub duplicates_removed: u64,
    pub format: Option<FormatTag>,
    pub realtime: bool,
    pub metrics: MetricsSnapshot,
    pub status: StatusSnapshot,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "kind", content = "payload", rename_all = "camelCase")]
pub enum EngineEvent {
    Status(StatusSnapshot),
    Log(LogEntry),
    FormatChanged(FormatTag),
    Realtime(bool),
}
