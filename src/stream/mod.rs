pub mod batcher;
pub mod events;
pub mod metrics;
pub mod normalizer;
pub mod providers;
pub mod retention;
pub mod ring;
pub mod supervisor;
pub mod types;

use std::time::{SystemTime, UNIX_EPOCH};

pub fn now_unix_ms() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_millis().min(i64::MAX as u128) as i64,
        Err(_) => 0,
    }
}
