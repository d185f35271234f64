use super::retry::RetryPolicy;
use super::types::{
    AppendResponse, BulkStatusRequest, BulkStatusResponse, ErrorBody, HostnameResponse,
    OpenChannelRequest, OpenChannelResponse,
};
use super::{IngestError, ERR_CHANNEL_CODE};
use crate::config::Config;
use crate::reading::{self, Reading};
use crate::token::{AuthError, TokenSource};
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use std::time::Instant;

const WRITE_MODE: &str = "CLOUD_STORAGE";
const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Opening,
    Open,
    Broken,
    Closed,
}

#[derive(Debug, Clone, Copy)]
pub struct AppendReceipt {
    pub offset: u64,
    pub rows: usize,
    pub bytes: u64,
}

// Per-attempt classification of an append response, per the recovery table.
enum Classified {
    Throttled,
    Transient(String),
    Auth,
    ChannelInvalid(String),
    Client { status: u16, body: String },
    TokenRefresh(AuthError),
}

/// Protocol layer for one streaming channel: host discovery, channel open,
/// row append with continuation/offset tokens, status polling and recovery.
///
/// The offset token is owned exclusively by this client. It advances by
/// exactly one per acknowledged append and never on failure, so a retried
/// request always re-presents the same `(continuationToken, offsetToken)`
/// pair and the server can deduplicate. `append` takes `&mut self`: two
/// appends can never be in flight on the same channel.
pub struct IngestClient {
    http: reqwest::Client,
    token: TokenSource,
    retry: RetryPolicy,
    control_base: String,
    ingest_base: String,
    database: String,
    schema: String,
    pipe: String,
    channel_name: String,
    role: String,
    state: ChannelState,
    continuation_token: Option<String>,
    next_offset: u64,
    opened_at: Option<Instant>,
}

impl IngestClient {
    /// Discovers the ingest host and opens the channel. Any failure here is
    /// a startup failure; recovery only applies to an established channel.
    pub async fn connect(
        config: &Config,
        token: TokenSource,
        http: reqwest::Client,
    ) -> Result<Self, IngestError> {
        let mut client = Self {
            http,
            token,
            retry: RetryPolicy::default(),
            control_base: config.url.clone(),
            ingest_base: String::new(),
            database: config.database.clone(),
            schema: config.schema.clone(),
            pipe: config.pipe.clone(),
            channel_name: config.channel_name.clone(),
            role: config.role.clone(),
            state: ChannelState::Opening,
            continuation_token: None,
            next_offset: 1,
            opened_at: None,
        };
        client.discover_ingest_host().await?;
        client.open_channel().await?;
        Ok(client)
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn next_offset(&self) -> u64 {
        self.next_offset
    }

    pub fn channel_name(&self) -> &str {
        &self.channel_name
    }

    async fn bearer(&self) -> Result<String, IngestError> {
        self.token.get().await.map_err(IngestError::Auth)
    }

    async fn discover_ingest_host(&mut self) -> Result<(), IngestError> {
        let url = format!("{}/v2/streaming/hostname", self.control_base);
        let token = self.bearer().await?;
        let response = self
            .http
            .get(&url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|err| IngestError::Network(format!("host discovery failed: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(IngestError::Rejected {
                status: status.as_u16(),
                message: format!("host discovery failed: {body}"),
            });
        }

        let parsed: HostnameResponse = response
            .json()
            .await
            .map_err(|err| IngestError::Network(format!("invalid hostname response: {err}")))?;
        self.ingest_base = if parsed.ingest_host.contains("://") {
            parsed.ingest_host.trim_end_matches('/').to_string()
        } else {
            format!("https://{}", parsed.ingest_host)
        };
        tracing::info!(ingest_host = %self.ingest_base, "discovered ingest host");
        Ok(())
    }

    /// Opens (or re-opens) the channel under its fixed name. A re-open adopts
    /// the fresh continuation token; `next_offset` is deliberately untouched
    /// so the offset sequence stays strictly increasing across recoveries.
    async fn open_channel(&mut self) -> Result<(), IngestError> {
        self.state = ChannelState::Opening;
        let url = format!(
            "{}/v2/streaming/databases/{}/schemas/{}/pipes/{}/channels/{}:open",
            self.ingest_base, self.database, self.schema, self.pipe, self.channel_name
        );
        let token = self.bearer().await?;
        let response = self
            .http
            .put(&url)
            .bearer_auth(token)
            .json(&OpenChannelRequest {
                write_mode: WRITE_MODE,
                role: &self.role,
            })
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(err) => {
                self.state = ChannelState::Broken;
                return Err(IngestError::Network(format!("channel open failed: {err}")));
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            self.state = ChannelState::Broken;
            return Err(IngestError::Channel(format!(
                "channel open returned HTTP {}: {body}",
                status.as_u16()
            )));
        }

        let parsed: OpenChannelResponse = response.json().await.map_err(|err| {
            self.state = ChannelState::Broken;
            IngestError::Network(format!("invalid open response: {err}"))
        })?;

        self.continuation_token = Some(parsed.next_continuation_token);
        self.state = ChannelState::Open;
        self.opened_at = Some(Instant::now());
        tracing::info!(
            channel = %self.channel_name,
            next_offset = self.next_offset,
            "channel open"
        );
        Ok(())
    }

    /// Appends one batch, driving the full recovery table. On success the
    /// continuation token advances to the server-issued value and the offset
    /// increments by exactly one.
    pub async fn append(&mut self, rows: &[Reading]) -> Result<AppendReceipt, IngestError> {
        let body = reading::to_ndjson(rows).map_err(|err| IngestError::Encode(err.to_string()))?;
        self.append_ndjson(body, rows.len()).await
    }

    async fn append_ndjson(
        &mut self,
        body: String,
        row_count: usize,
    ) -> Result<AppendReceipt, IngestError> {
        if self.state != ChannelState::Open {
            self.open_channel().await?;
        }

        let offset = self.next_offset;
        let bytes = body.len() as u64;
        // Only the backoff-bounded classes (throttled, transient) spend this
        // budget; an auth retry is bounded separately and must not eat a slot.
        let mut backoff_attempts: u32 = 0;
        let mut consecutive_transient: u32 = 0;
        let mut auth_retried = false;
        let mut reopened = false;

        loop {
            match self.post_rows(&body, offset).await {
                Ok(next_continuation_token) => {
                    self.continuation_token = Some(next_continuation_token);
                    self.next_offset += 1;
                    tracing::debug!(offset, rows = row_count, bytes, "append accepted");
                    return Ok(AppendReceipt {
                        offset,
                        rows: row_count,
                        bytes,
                    });
                }
                Err(Classified::Throttled) => {
                    consecutive_transient = 0;
                    backoff_attempts += 1;
                    if backoff_attempts >= self.retry.max_attempts() {
                        return Err(IngestError::Throttled);
                    }
                    tracing::debug!(attempt = backoff_attempts, offset, "rate limited; backing off");
                    self.retry.sleep(backoff_attempts).await;
                }
                Err(Classified::Transient(reason)) => {
                    consecutive_transient += 1;
                    backoff_attempts += 1;
                    if consecutive_transient >= 2 {
                        // The batch is dropped; the next append finds the
                        // channel non-Open and re-opens it lazily.
                        self.state = ChannelState::Broken;
                        tracing::info!(
                            channel = %self.channel_name,
                            error = %reason,
                            "channel broken after consecutive transient failures"
                        );
                        return Err(IngestError::Network(reason));
                    }
                    if backoff_attempts >= self.retry.max_attempts() {
                        return Err(IngestError::Network(reason));
                    }
                    tracing::debug!(attempt = backoff_attempts, offset, error = %reason, "transient failure; backing off");
                    self.retry.sleep(backoff_attempts).await;
                }
                Err(Classified::Auth) => {
                    if auth_retried {
                        return Err(IngestError::Rejected {
                            status: 401,
                            message: "credential rejected after refresh".to_string(),
                        });
                    }
                    auth_retried = true;
                    tracing::info!("credential rejected; forcing token refresh");
                    self.token.force_refresh().await;
                }
                Err(Classified::ChannelInvalid(reason)) => {
                    self.state = ChannelState::Broken;
                    tracing::info!(
                        channel = %self.channel_name,
                        error = %reason,
                        "channel invalidated"
                    );
                    if !reopened {
                        reopened = true;
                        self.open_channel().await?;
                        continue;
                    }
                    return Err(IngestError::Channel(reason));
                }
                Err(Classified::Client { status, body: response_body }) => {
                    tracing::debug!(
                        status,
                        request = %body,
                        response = %response_body,
                        "append rejected; dropping batch"
                    );
                    return Err(IngestError::Rejected {
                        status,
                        message: response_body,
                    });
                }
                Err(Classified::TokenRefresh(err)) => {
                    return Err(IngestError::Auth(err));
                }
            }
        }
    }

    async fn post_rows(&self, body: &str, offset: u64) -> Result<String, Classified> {
        let token = self.token.get().await.map_err(Classified::TokenRefresh)?;
        let url = format!(
            "{}/v2/streaming/data/databases/{}/schemas/{}/pipes/{}/channels/{}/rows",
            self.ingest_base, self.database, self.schema, self.pipe, self.channel_name
        );
        let continuation_token = self.continuation_token.clone().unwrap_or_default();
        let offset_token = offset.to_string();

        let response = self
            .http
            .post(&url)
            .query(&[
                ("continuationToken", continuation_token.as_str()),
                ("offsetToken", offset_token.as_str()),
            ])
            .bearer_auth(token)
            .header(CONTENT_TYPE, NDJSON_CONTENT_TYPE)
            .body(body.to_string())
            .send()
            .await
            .map_err(|err| Classified::Transient(format!("append request failed: {err}")))?;

        let status = response.status();
        if status.is_success() {
            let parsed: AppendResponse = response
                .json()
                .await
                .map_err(|err| Classified::Transient(format!("invalid append response: {err}")))?;
            return Ok(parsed.next_continuation_token);
        }

        let body_text = response.text().await.unwrap_or_default();
        Err(classify_response(status, body_text))
    }

    /// Last committed offset token for this channel, per the server.
    pub async fn channel_status(&self) -> Result<Option<String>, IngestError> {
        let url = format!(
            "{}/v2/streaming/databases/{}/schemas/{}/pipes/{}:bulk-channel-status",
            self.ingest_base, self.database, self.schema, self.pipe
        );
        let token = self.bearer().await?;
        let response = self
            .http
            .post(&url)
            .bearer_auth(token)
            .json(&BulkStatusRequest {
                channel_names: vec![&self.channel_name],
            })
            .send()
            .await
            .map_err(|err| IngestError::Network(format!("status poll failed: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(IngestError::Rejected {
                status: status.as_u16(),
                message: body,
            });
        }

        let parsed: BulkStatusResponse = response
            .json()
            .await
            .map_err(|err| IngestError::Network(format!("invalid status response: {err}")))?;
        Ok(parsed
            .channel_statuses
            .get(&self.channel_name)
            .and_then(|entry| entry.last_committed_offset_token.clone()))
    }

    /// Best-effort close on shutdown. The server garbage-collects abandoned
    /// channels, so failures only get a debug line.
    pub async fn close_channel(&mut self) {
        if self.state == ChannelState::Closed {
            return;
        }
        self.state = ChannelState::Closed;

        let url = format!(
            "{}/v2/streaming/databases/{}/schemas/{}/pipes/{}/channels/{}:close",
            self.ingest_base, self.database, self.schema, self.pipe, self.channel_name
        );
        let token = match self.token.get().await {
            Ok(token) => token,
            Err(err) => {
                tracing::debug!(error = %err, "skipping channel close; no credential");
                return;
            }
        };
        match self.http.post(&url).bearer_auth(token).send().await {
            Ok(response) if response.status().is_success() => {
                let open_secs = self.opened_at.map(|at| at.elapsed().as_secs());
                tracing::info!(channel = %self.channel_name, open_secs, "channel closed");
            }
            Ok(response) => {
                tracing::debug!(status = %response.status(), "channel close rejected");
            }
            Err(err) => {
                tracing::debug!(error = %err, "channel close failed");
            }
        }
    }
}

fn classify_response(status: StatusCode, body: String) -> Classified {
    let envelope: ErrorBody = serde_json::from_str(&body).unwrap_or_default();
    let code = envelope.code.unwrap_or_default();
    let message = envelope.message.unwrap_or_else(|| body.clone());

    match status.as_u16() {
        401 => Classified::Auth,
        429 => Classified::Throttled,
        404 | 410 => Classified::ChannelInvalid(format!("HTTP {}: {message}", status.as_u16())),
        400 if code == ERR_CHANNEL_CODE || message.to_lowercase().contains("continuation token") => {
            Classified::ChannelInvalid(message)
        }
        500..=599 => Classified::Transient(format!("HTTP {}: {message}", status.as_u16())),
        other => Classified::Client {
            status: other,
            body,
        },
    }
}
