use crate::error::TransportError;
use async_trait::async_trait;
use chatdesk_core::wire::RawMessage;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::warn;
use url::Url;

/// Result of one full fetch. Items that fail to decode are only counted;
/// their conversation is unknown.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PollBatch {
    pub messages: Vec<RawMessage>,
    pub rejected: usize,
}

/// Returns the complete current message set. Slow and expensive, but ground
/// truth.
#[async_trait]
pub trait PollSource: Send + Sync {
    async fn fetch_all(&self) -> Result<PollBatch, TransportError>;
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PollBody {
    Bare(Vec<Value>),
    Wrapped { messages: Vec<Value> },
}

pub struct HttpPollSource {
    http: reqwest::Client,
    url: Url,
}

impl HttpPollSource {
    pub fn new(url: Url, request_timeout: Duration) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|err| TransportError::Http(err.to_string()))?;
        Ok(Self { http, url })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl PollSource for HttpPollSource {
    async fn fetch_all(&self) -> Result<PollBatch, TransportError> {
        let resp = self.http.get(self.url.clone()).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(TransportError::Http(format!("status {status}")));
        }
        let body = resp.json::<PollBody>().await?;
        Ok(batch_from_items(match body {
            PollBody::Bare(items) | PollBody::Wrapped { messages: items } => items,
        }))
    }
}

fn batch_from_items(items: Vec<Value>) -> PollBatch {
    let mut batch = PollBatch::default();
    for item in items {
        match serde_json::from_value::<RawMessage>(item) {
            Ok(raw) => batch.messages.push(raw),
            Err(err) => {
                warn!(event = "poll_item_undecodable", reason = %err);
                batch.rejected += 1;
            }
        }
    }
    batch
}
