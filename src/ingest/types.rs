use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Deserialize)]
pub(in crate::ingest) struct HostnameResponse {
    pub(in crate::ingest) ingest_host: String,
}

#[derive(Debug, Serialize)]
pub(in crate::ingest) struct OpenChannelRequest<'a> {
    pub(in crate::ingest) write_mode: &'a str,
    pub(in crate::ingest) role: &'a str,
}

#[derive(Debug, Deserialize)]
pub(in crate::ingest) struct OpenChannelResponse {
    pub(in crate::ingest) next_continuation_token: String,
    #[serde(default)]
    #[allow(dead_code)]
    pub(in crate::ingest) channel_status: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub(in crate::ingest) struct AppendResponse {
    pub(in crate::ingest) next_continuation_token: String,
}

/// Server error envelope. Both fields are optional in practice; anything the
/// server sends that does not parse stays available as raw text.
#[derive(Debug, Default, Deserialize)]
pub(in crate::ingest) struct ErrorBody {
    #[serde(default)]
    pub(in crate::ingest) code: Option<String>,
    #[serde(default)]
    pub(in crate::ingest) message: Option<String>,
}

#[derive(Debug, Serialize)]
pub(in crate::ingest) struct BulkStatusRequest<'a> {
    pub(in crate::ingest) channel_names: Vec<&'a str>,
}

#[derive(Debug, Deserialize)]
pub(in crate::ingest) struct BulkStatusResponse {
    #[serde(default)]
    pub(in crate::ingest) channel_statuses: HashMap<String, ChannelStatusEntry>,
}

#[derive(Debug, Deserialize)]
pub(in crate::ingest) struct ChannelStatusEntry {
    #[serde(default)]
    pub(in crate::ingest) last_committed_offset_token: Option<String>,
}
