//! Backend API client (http://127.0.0.1:8787 by default).
//! Opens the per-turn NDJSON push stream for a conversation.

use std::pin::Pin;

use futures_util::{Stream, StreamExt};
use serde::Serialize;

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8787";

/// Client for the conversation backend HTTP API.
#[derive(Clone)]
pub struct BackendClient {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("backend request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("backend api error: {0}")]
    Api(String),
}

/// Body of the send request that opens a turn.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Client-generated id, echoed by the server for reply dedup.
    pub client_request_id: String,
}

impl BackendClient {
    pub fn new(base_url: Option<String>) -> Self {
        let base_url = base_url
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Self {
            base_url,
            client: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// POST /api/conversations/{id}/stream — submit a message and open the
    /// push channel for the turn it starts.
    pub async fn open_stream(
        &self,
        conversation_id: &str,
        request: &SendRequest,
    ) -> Result<EventStream, BackendError> {
        let url = format!(
            "{}/api/conversations/{}/stream",
            self.base_url, conversation_id
        );
        let res = self.client.post(&url).json(request).send().await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(BackendError::Api(format!("{} {}", status, body)));
        }
        Ok(EventStream::new(res))
    }
}

/// Line-oriented reader over a turn's push channel. Dropping it closes the
/// underlying connection.
pub struct EventStream {
    chunks: Pin<Box<dyn Stream<Item = Result<Vec<u8>, reqwest::Error>> + Send>>,
    buffer: Vec<u8>,
    done: bool,
}

impl EventStream {
    fn new(response: reqwest::Response) -> Self {
        let chunks = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()))
            .boxed();
        Self {
            chunks,
            buffer: Vec::new(),
            done: false,
        }
    }

    /// Next non-empty line, or `None` once the channel ends. Invalid UTF-8 is
    /// replaced rather than rejected.
    pub async fn next_line(&mut self) -> Result<Option<String>, BackendError> {
        loop {
            if let Some(i) = self.buffer.iter().position(|&b| b == b'\n') {
                let line_bytes: Vec<u8> = self.buffer.drain(..i).collect();
                self.buffer.drain(..1);
                let line = String::from_utf8_lossy(&line_bytes).trim().to_string();
                if line.is_empty() {
                    continue;
                }
                return Ok(Some(line));
            }
            if self.done {
                // Flush a trailing line that arrived without a newline.
                let line = String::from_utf8_lossy(&self.buffer).trim().to_string();
                self.buffer.clear();
                if line.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(line));
            }
            match self.chunks.next().await {
                Some(chunk) => self.buffer.extend_from_slice(&chunk?),
                None => self.done = true,
            }
        }
    }
}
