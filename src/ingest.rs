mod client;
mod retry;
mod types;


use crate::token::AuthError;
use anyhow::Context;
use std::time::Duration;
use thiserror::Error;

pub use client::{AppendReceipt, ChannelState, IngestClient};
pub use retry::RetryPolicy;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub const ERR_CHANNEL_CODE: &str = "ERR_CHANNEL_DOES_NOT_EXIST_OR_IS_NOT_AUTHORIZED";

/// Classified protocol failure. Everything except an exhausted credential
/// refresh is recoverable at the batch level: the scheduler counts the error
/// and moves on to the next interval.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("network error: {0}")]
    Network(String),
    #[error("channel invalidated: {0}")]
    Channel(String),
    #[error("request rejected: HTTP {status}: {message}")]
    Rejected { status: u16, message: String },
    #[error("rate limited: retries exhausted")]
    Throttled,
    #[error("failed to encode batch: {0}")]
    Encode(String),
}

impl IngestError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, IngestError::Auth(err) if err.is_fatal())
    }
}

/// Shared HTTP client for every outbound request: one connect timeout, one
/// overall request timeout. Proxy and CA-bundle knobs follow the client's
/// standard environment conventions.
pub fn build_http_client() -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(REQUEST_TIMEOUT)
        .build()
        .context("failed to build HTTP client")
}
