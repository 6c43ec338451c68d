//! Durable store collaborators.
//!
//! The engine only needs three things from a store: accept one message,
//! accept one batch, and say whether it is reachable right now.

pub mod http;
pub mod reachability;
pub mod sqlite;

use crate::error::AppError;
use crate::stream::types::{BatchRecord, Message};
use async_trait::async_trait;

#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn save_message(&self, message: &Message) -> Result<(), AppError>;
    async fn save_batch(&self, batch: &BatchRecord) -> Result<(), AppError>;
    async fn is_reachable(&self) -> bool;
}

/// Store used when nothing is configured: never reachable, so both
/// persistence paths stay idle.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStore;

#[async_trait]
impl DurableStore for NullStore {
    async fn save_message(&self, _message: &Message) -> Result<(), AppError> {
        Err(AppError::Store("no durable store configured".to_string()))
    }

    async fn save_batch(&self, _batch: &BatchRecord) -> Result<(), AppError> {
        Err(AppError::Store("no durable store configured".to_string()))
    }

    async fn is_reachable(&self) -> bool {
        false
    }
}
