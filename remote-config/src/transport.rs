use crate::protocol::ClientGetConfigsRequest;
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use std::time::Duration;

const CONFIG_ENDPOINT: &str = "v0.7/config";

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error("HTTP error: {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("response body exceeds the maximum of {max} bytes")]
    PayloadTooLarge { max: usize },
    #[error("{0}")]
    Other(String),
}

/// Outcome of one request/response exchange with the agent.
#[derive(Debug, Clone, PartialEq)]
pub enum Exchange {
    NoChange,
    Body(Vec<u8>),
}

/// The boundary between the poller and the wire.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn exchange(&self, request: &ClientGetConfigsRequest) -> Result<Exchange, TransportError>;
}

pub struct HttpTransport {
    client: reqwest::Client,
    url: Url,
    max_payload_size: usize,
}

impl HttpTransport {
    pub fn new(
        agent_url: &Url,
        timeout: Duration,
        max_payload_size: usize,
    ) -> Result<Self, TransportError> {
        let full_url = format!(
            "{}/{}",
            agent_url.as_str().trim_end_matches('/'),
            CONFIG_ENDPOINT
        );
        let url = Url::parse(&full_url).map_err(|e| TransportError::InvalidUrl(e.to_string()))?;
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(HttpTransport {
            client,
            url,
            max_payload_size,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn exchange(&self, request: &ClientGetConfigsRequest) -> Result<Exchange, TransportError> {
        let mut response = self
            .client
            .post(self.url.clone())
            .json(request)
            .send()
            .await?;

        match response.status() {
            // The agent answers 404 when remote configuration is disabled.
            StatusCode::NOT_FOUND => {
                tracing::debug!(url = %self.url, "Remote configuration is disabled on the agent");
                return Ok(Exchange::NoChange);
            }
            StatusCode::NO_CONTENT => return Ok(Exchange::NoChange),
            status if !status.is_success() => {
                let body = response.text().await.unwrap_or_default();
                return Err(TransportError::Status { status, body });
            }
            _ => {}
        }

        if response
            .content_length()
            .is_some_and(|len| len > self.max_payload_size as u64)
        {
            return Err(TransportError::PayloadTooLarge {
                max: self.max_payload_size,
            });
        }

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            if body.len() + chunk.len() > self.max_payload_size {
                return Err(TransportError::PayloadTooLarge {
                    max: self.max_payload_size,
                });
            }
            body.extend_from_slice(&chunk);
        }

        Ok(Exchange::Body(body))
    }
}
