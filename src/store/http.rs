use crate::error::AppError;
use crate::store::DurableStore;
use crate::stream::types::{BatchRecord, Message};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(3);

/// Backend API adapter: one POST per message, one POST per batch, and a
/// health probe for reachability.
#[derive(Debug, Clone)]
pub struct HttpStore {
    client: Client,
    base_url: String,
}

impl HttpStore {
    pub fn new(base_url: &str) -> Result<Self, AppError> {
        let base_url = base_url.trim().trim_end_matches('/').to_string();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(AppError::Config(format!(
                "backend url '{base_url}' must use http:// or https://"
            )));
        }

        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self { client, base_url })
    }

    fn messages_endpoint(&self) -> String {
        format!("{}/api/stream/messages", self.base_url)
    }

    fn batches_endpoint(&self) -> String {
        format!("{}/api/stream/batches", self.base_url)
    }

    fn health_endpoint(&self) -> String {
        format!("{}/health", self.base_url)
    }
}

#[async_trait]
impl DurableStore for HttpStore {
    async fn save_message(&self, message: &Message) -> Result<(), AppError> {
        self.client
            .post(self.messages_endpoint())
            .json(message)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn save_batch(&self, batch: &BatchRecord) -> Result<(), AppError> {
        self.client
            .post(self.batches_endpoint())
            .json(batch)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn is_reachable(&self) -> bool {
        match self
            .client
            .get(self.health_endpoint())
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}
