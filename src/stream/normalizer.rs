//! Frame classification.
//!
//! Provider payloads overlap (an OKX push and a Binance combined-stream
//! frame are both objects with a `data` key), so classification is an
//! ordered cascade and the first matching rule wins.

use crate::stream::ring::RingBuffer;
use crate::stream::types::{FormatTag, ProviderKind};
use serde_json::{Map, Value};
use tracing::debug;

const REALTIME_HISTORY: usize = 10;
const REALTIME_SAMPLE: usize = 3;
const REALTIME_MAX_MEAN_GAP_MS: f64 = 5_000.0;

const BINANCE_EVENT_TYPES: &[&str] = &[
    "trade",
    "aggTrade",
    "24hrTicker",
    "24hrMiniTicker",
    "bookTicker",
    "depthUpdate",
    "kline",
];

const TRADE_LIKE_KEYS: &[&str] = &[
    "price", "p", "px", "size", "sz", "quantity", "q", "qty", "id", "tradeId", "amount",
    "volume", "bid", "ask", "last",
];

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFrame {
    SubscriptionAck,
    Ping,
    Pong,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    Records {
        format: FormatTag,
        records: Vec<Value>,
    },
    Control(ControlFrame),
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizeOutcome {
    pub classification: Classification,
    /// Set only when the format differs from the previous data frame's.
    pub format_changed: Option<FormatTag>,
    /// Set on the frame that first marks the session as real-time.
    pub realtime_detected: bool,
}

pub fn classify_frame(frame: Frame) -> Classification {
    let text = match frame {
        Frame::Text(text) => text,
        Frame::Binary(bytes) => match String::from_utf8(bytes) {
            Ok(text) => text,
            Err(error) => {
                let lossy = String::from_utf8_lossy(error.as_bytes()).into_owned();
                return degraded(lossy);
            }
        },
    };

    if let Some(control) = control_text(&text) {
        return Classification::Control(control);
    }

    let mut owned_payload = text.clone().into_bytes();
    match simd_json::serde::from_slice::<Value>(owned_payload.as_mut_slice()) {
        Ok(value) => classify_value(value),
        Err(error) => {
            debug!("frame is not json, keeping raw text: {error}");
            degraded(text)
        }
    }
}

pub fn classify_value(value: Value) -> Classification {
    match value {
        Value::Object(object) => classify_object(object),
        Value::Array(entries) => Classification::Records {
            format: FormatTag::Array,
            records: entries,
        },
        primitive => Classification::Records {
            format: FormatTag::Primitive,
            records: vec![primitive],
        },
    }
}

fn classify_object(mut object: Map<String, Value>) -> Classification {
    if object.contains_key("arg") && object.get("data").is_some_and(Value::is_array) {
        if let Some(Value::Array(entries)) = object.remove("data") {
            return Classification::Records {
                format: FormatTag::Okx,
                records: entries,
            };
        }
    }

    if object.contains_key("stream") && object.get("data").is_some_and(Value::is_object) {
        if let Some(data) = object.remove("data") {
            return Classification::Records {
                format: FormatTag::BinanceStream,
                records: vec![data],
            };
        }
    }

    let is_binance_event = object
        .get("e")
        .and_then(Value::as_str)
        .is_some_and(|event_type| BINANCE_EVENT_TYPES.contains(&event_type));
    if is_binance_event {
        return Classification::Records {
            format: FormatTag::BinanceEvent,
            records: vec![Value::Object(object)],
        };
    }

    if let Some(control) = control_object(&object) {
        return Classification::Control(control);
    }

    let format = if TRADE_LIKE_KEYS.iter().any(|key| object.contains_key(*key)) {
        FormatTag::RealtimeObject
    } else {
        FormatTag::JsonObject
    };
    Classification::Records {
        format,
        records: vec![Value::Object(object)],
    }
}

fn control_text(text: &str) -> Option<ControlFrame> {
    match text.trim().to_ascii_lowercase().as_str() {
        "ping" => Some(ControlFrame::Ping),
        "pong" => Some(ControlFrame::Pong),
        _ => None,
    }
}

fn control_object(object: &Map<String, Value>) -> Option<ControlFrame> {
    if let Some(event) = object.get("event").and_then(Value::as_str) {
        match event {
            "subscribe" | "unsubscribe" => return Some(ControlFrame::SubscriptionAck),
            _ => {}
        }
    }

    for key in ["op", "type", "event"] {
        match object.get(key).and_then(Value::as_str) {
            Some("ping") => return Some(ControlFrame::Ping),
            Some("pong") => return Some(ControlFrame::Pong),
            _ => {}
        }
    }

    // Binance replies to SUBSCRIBE/UNSUBSCRIBE requests with {"result": null, "id": n}.
    if object.contains_key("result") && object.contains_key("id") && object.len() == 2 {
        return Some(ControlFrame::SubscriptionAck);
    }

    None
}

fn degraded(text: String) -> Classification {
    let mut record = Map::new();
    record.insert("raw".to_string(), Value::String(text));
    Classification::Records {
        format: FormatTag::Text,
        records: vec![Value::Object(record)],
    }
}

/// Per-session normalizer state: last announced format and the arrival
/// history feeding real-time detection.
#[derive(Debug)]
pub struct MessageNormalizer {
    provider: ProviderKind,
    last_format: Option<FormatTag>,
    arrivals: RingBuffer<i64>,
    realtime: bool,
}

impl MessageNormalizer {
    pub fn new(provider: ProviderKind) -> Self {
        Self {
            provider,
            last_format: None,
            arrivals: RingBuffer::with_capacity(REALTIME_HISTORY),
            realtime: false,
        }
    }

    pub fn current_format(&self) -> Option<FormatTag> {
        self.last_format
    }

    pub fn is_realtime(&self) -> bool {
        self.realtime
    }

    pub fn normalize(&mut self, frame: Frame, arrival_ms: i64) -> NormalizeOutcome {
        let classification = classify_frame(frame);

        let format = match &classification {
            Classification::Records { format, records } if !records.is_empty() => *format,
            _ => {
                return NormalizeOutcome {
                    classification,
                    format_changed: None,
                    realtime_detected: false,
                }
            }
        };

        let format_changed = if self.last_format != Some(format) {
            self.last_format = Some(format);
            Some(format)
        } else {
            None
        };

        let realtime_detected = self.observe_arrival(arrival_ms);

        NormalizeOutcome {
            classification,
            format_changed,
            realtime_detected,
        }
    }

    fn observe_arrival(&mut self, arrival_ms: i64) -> bool {
        if self.provider != ProviderKind::Custom {
            return false;
        }

        self.arrivals.push(arrival_ms);
        if self.realtime || self.arrivals.len() < REALTIME_SAMPLE {
            return false;
        }

        let history = self.arrivals.to_vec();
        let latest = &history[history.len() - REALTIME_SAMPLE..];
        let gaps: Vec<f64> = latest
            .windows(2)
            .map(|pair| pair[1].saturating_sub(pair[0]) as f64)
            .collect();
        let mean_gap = gaps.iter().sum::<f64>() / gaps.len() as f64;

        if mean_gap < REALTIME_MAX_MEAN_GAP_MS {
            self.realtime = true;
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn records_of(classification: Classification) -> (FormatTag, Vec<Value>) {
        match classification {
            Classification::Records { format, records } => (format, records),
            Classification::Control(control) => panic!("expected records, got {control:?}"),
        }
    }

    fn text(payload: &str) -> Frame {
        Frame::Text(payload.to_string())
    }

    #[test]
    fn splits_okx_push_into_one_record_per_entry() {
        let (format, records) = records_of(classify_frame(text(
            r#"{"arg":{"instId":"BTC-USDT"},"data":[{"price":"1"},{"price":"2"}]}"#,
        )));

        assert_eq!(format, FormatTag::Okx);
        assert_eq!(records, vec![json!({"price":"1"}), json!({"price":"2"})]);
    }

    #[test]
    fn unwraps_binance_combined_stream_frame() {
        let (format, records) = records_of(classify_frame(text(
            r#"{"stream":"btcusdt@trade","data":{"e":"trade","s":"BTCUSDT","p":"100.5"}}"#,
        )));

        assert_eq!(format, FormatTag::BinanceStream);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["s"], "BTCUSDT");
    }

    #[test]
    fn recognizes_bare_binance_event() {
        let (format, records) = records_of(classify_frame(text(
            r#"{"e":"24hrTicker","s":"ETHUSDT","c":"3000"}"#,
        )));

        assert_eq!(format, FormatTag::BinanceEvent);
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn unknown_event_type_falls_through_to_object_rules() {
        let (format, _) = records_of(classify_frame(text(r#"{"e":"custom","value":3}"#)));
        assert_eq!(format, FormatTag::JsonObject);
    }

    #[test]
    fn okx_rule_wins_over_binance_rule_when_both_match() {
        let (format, records) = records_of(classify_frame(text(
            r#"{"arg":{},"stream":"x","data":[{"id":1}],"e":"trade"}"#,
        )));

        assert_eq!(format, FormatTag::Okx);
        assert_eq!(records, vec![json!({"id":1})]);
    }

    #[test]
    fn top_level_array_yields_entry_per_record() {
        let (format, records) = records_of(classify_frame(text(r#"[1,{"a":2},"x"]"#)));
        assert_eq!(format, FormatTag::Array);
        assert_eq!(records.len(), 3);
    }

    #[test]
    fn consumes_acknowledgements_and_heartbeats() {
        assert_eq!(
            classify_frame(text(r#"{"event":"subscribe","arg":{"channel":"trades"}}"#)),
            Classification::Control(ControlFrame::SubscriptionAck)
        );
        assert_eq!(
            classify_frame(text(r#"{"result":null,"id":1}"#)),
            Classification::Control(ControlFrame::SubscriptionAck)
        );
        assert_eq!(
            classify_frame(text("pong")),
            Classification::Control(ControlFrame::Pong)
        );
        assert_eq!(
            classify_frame(text(r#"{"op":"ping"}"#)),
            Classification::Control(ControlFrame::Ping)
        );
    }

    #[test]
    fn tags_trade_like_objects_as_realtime() {
        let (format, _) = records_of(classify_frame(text(r#"{"symbol":"X","price":1.5}"#)));
        assert_eq!(format, FormatTag::RealtimeObject);

        let (format, _) = records_of(classify_frame(text(r#"{"hello":"world"}"#)));
        assert_eq!(format, FormatTag::JsonObject);

        let (format, records) = records_of(classify_frame(text("42")));
        assert_eq!(format, FormatTag::Primitive);
        assert_eq!(records, vec![json!(42)]);
    }

    #[test]
    fn degrades_unparseable_text_to_raw_record() {
        let (format, records) = records_of(classify_frame(text("not json {")));
        assert_eq!(format, FormatTag::Text);
        assert_eq!(records, vec![json!({"raw":"not json {"})]);
    }

    #[test]
    fn decodes_binary_frames_and_degrades_invalid_utf8() {
        let (format, _) = records_of(classify_frame(Frame::Binary(br#"{"price":1}"#.to_vec())));
        assert_eq!(format, FormatTag::RealtimeObject);

        let (format, records) = records_of(classify_frame(Frame::Binary(vec![0xff, 0xfe, b'a'])));
        assert_eq!(format, FormatTag::Text);
        assert!(records[0]["raw"].as_str().is_some_and(|raw| raw.ends_with('a')));
    }

    #[test]
    fn announces_format_only_on_change() {
        let mut normalizer = MessageNormalizer::new(ProviderKind::Binance);

        let first = normalizer.normalize(text(r#"{"price":1}"#), 0);
        let second = normalizer.normalize(text(r#"{"price":2}"#), 10);
        let ack = normalizer.normalize(text(r#"{"event":"subscribe"}"#), 15);
        let third = normalizer.normalize(text(r#"{"hello":1}"#), 20);

        assert_eq!(first.format_changed, Some(FormatTag::RealtimeObject));
        assert_eq!(second.format_changed, None);
        assert_eq!(ack.format_changed, None);
        assert_eq!(third.format_changed, Some(FormatTag::JsonObject));
        assert_eq!(normalizer.current_format(), Some(FormatTag::JsonObject));
    }

    #[test]
    fn empty_frames_leave_format_untouched() {
        let mut normalizer = MessageNormalizer::new(ProviderKind::Custom);

        let empty_push = normalizer.normalize(text(r#"{"arg":{"instId":"BTC-USDT"},"data":[]}"#), 0);
        let empty_array = normalizer.normalize(text("[]"), 5);
        assert_eq!(empty_push.format_changed, None);
        assert_eq!(empty_array.format_changed, None);
        assert!(!empty_push.realtime_detected && !empty_array.realtime_detected);
        assert_eq!(normalizer.current_format(), None);

        let first = normalizer.normalize(text(r#"{"price":1}"#), 10);
        assert_eq!(first.format_changed, Some(FormatTag::RealtimeObject));
        let empty_again = normalizer.normalize(text(r#"{"arg":{},"data":[]}"#), 20);
        assert_eq!(empty_again.format_changed, None);
        assert_eq!(normalizer.current_format(), Some(FormatTag::RealtimeObject));
    }

    #[test]
    fn marks_custom_stream_realtime_after_three_close_arrivals() {
        let mut normalizer = MessageNormalizer::new(ProviderKind::Custom);

        assert!(!normalizer.normalize(text("1"), 1_000).realtime_detected);
        assert!(!normalizer.normalize(text("2"), 2_000).realtime_detected);
        assert!(normalizer.normalize(text("3"), 3_000).realtime_detected);
        assert!(normalizer.is_realtime());
        assert!(!normalizer.normalize(text("4"), 60_000).realtime_detected);
        assert!(normalizer.is_realtime());
    }

    #[test]
    fn slow_custom_stream_is_not_realtime() {
        let mut normalizer = MessageNormalizer::new(ProviderKind::Custom);
        for (index, arrival) in [0, 6_000, 12_000, 18_000].into_iter().enumerate() {
            let outcome = normalizer.normalize(text(&index.to_string()), arrival);
            assert!(!outcome.realtime_detected);
        }
        assert!(!normalizer.is_realtime());
    }

    #[test]
    fn built_in_providers_skip_realtime_detection() {
        let mut normalizer = MessageNormalizer::new(ProviderKind::Okx);
        for arrival in [0, 10, 20, 30] {
            normalizer.normalize(text(r#"{"price":1}"#), arrival);
        }
        assert!(!normalizer.is_realtime());
    }
}
