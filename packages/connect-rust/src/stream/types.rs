//! Request and response bodies of the channel ingestion API.

use serde::{Deserialize, Serialize};

/// `status_code` value reported on success.
pub const STATUS_SUCCESS: i64 = 0;

pub const ENDPOINT_OPEN_CHANNEL: &str = "/v1/streaming/channels/open/";
pub const ENDPOINT_REGISTER_BLOB: &str = "/v1/streaming/channels/write/blobs/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WriteMode {
    CloudStorage,
    RestApi,
}

#[derive(Debug, Clone, Serialize)]
pub struct OpenChannelRequest<'a> {
    pub request_id: String,
    pub channel: &'a str,
    pub table: &'a str,
    pub database: &'a str,
    pub schema: &'a str,
    pub write_mode: WriteMode,
    pub role: &'a str,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ColumnMetadata {
    pub name: String,
    pub collation: Option<String>,
    #[serde(rename = "type")]
    pub column_type: String,
    pub logical_type: String,
    pub physical_type: String,
    pub precision: Option<i64>,
    pub scale: Option<i64>,
    pub byte_length: Option<i64>,
    pub length: Option<i64>,
    pub nullable: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct OpenChannelResponse {
    pub status_code: i64,
    pub message: String,
    pub database: String,
    pub schema: String,
    pub table: String,
    pub channel: String,
    pub client_sequencer: i64,
    pub row_sequencer: i64,
    pub offset_token: Option<String>,
    pub table_columns: Vec<ColumnMetadata>,
    pub encryption_key: Option<String>,
    pub encryption_key_id: Option<i64>,
}

/// One insert unit addressed to an open channel.
#[derive(Debug, Clone, Serialize)]
pub struct InsertRowsRequest<'a> {
    pub request_id: String,
    pub role: &'a str,
    pub database: &'a str,
    pub schema: &'a str,
    pub table: &'a str,
    pub channel: &'a str,
    pub client_sequencer: i64,
    pub row_sequencer: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset_token: Option<&'a str>,
    pub rows: &'a [serde_json::Value],
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RegisterBlobResponse {
    pub status_code: i64,
    pub message: String,
    #[serde(rename = "blobs")]
    pub blobs_status: Vec<BlobRegisterStatus>,
}

impl RegisterBlobResponse {
    /// Channels the server reported a non-success status for.
    pub fn failed_channels(&self) -> impl Iterator<Item = &ChannelRegisterStatus> {
        self.blobs_status
            .iter()
            .flat_map(|b| &b.chunks_status)
            .flat_map(|c| &c.channels_status)
            .filter(|ch| ch.status_code != STATUS_SUCCESS)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BlobRegisterStatus {
    #[serde(rename = "chunks")]
    pub chunks_status: Vec<ChunkRegisterStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ChunkRegisterStatus {
    #[serde(rename = "channels")]
    pub channels_status: Vec<ChannelRegisterStatus>,
    pub database: String,
    pub schema: String,
    pub table: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ChannelRegisterStatus {
    pub status_code: i64,
    pub channel: String,
    #[serde(rename = "client_sequencer")]
    pub channel_sequencer: i64,
}
