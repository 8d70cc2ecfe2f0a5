//! HTTP seam of the stream writer.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use keyway_core::{KvError, KvResult};
use reqwest::header::{ACCEPT, CONTENT_TYPE};

/// Header telling the ingestion service which kind of bearer token is sent.
pub const TOKEN_TYPE_HEADER: &str = "X-Snowflake-Authorization-Token-Type";
pub const TOKEN_TYPE_KEYPAIR_JWT: &str = "KEYPAIR_JWT";

/// A JSON POST to one ingestion endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestRequest {
    pub url: String,
    pub token: String,
    pub body: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestResponse {
    pub status: u16,
    pub body: Bytes,
}

/// Sends authenticated requests to the ingestion service.
///
/// [`ReqwestTransport`] is the production implementation; tests substitute a
/// recording fake.
#[async_trait]
pub trait IngestTransport: Send + Sync {
    async fn post(&self, request: IngestRequest) -> anyhow::Result<IngestResponse>;
}

#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// # Errors
    ///
    /// [`KvError::InvalidConfiguration`] if the HTTP client cannot be built.
    pub fn new(timeout: Duration) -> KvResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| KvError::InvalidConfiguration(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl IngestTransport for ReqwestTransport {
    async fn post(&self, request: IngestRequest) -> anyhow::Result<IngestResponse> {
        let response = self
            .client
            .post(&request.url)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json")
            .header(TOKEN_TYPE_HEADER, TOKEN_TYPE_KEYPAIR_JWT)
            .bearer_auth(&request.token)
            .json(&request.body)
            .send()
            .await?;
        let status = response.status().as_u16();
        let body = response.bytes().await?;
        Ok(IngestResponse { status, body })
    }
}
