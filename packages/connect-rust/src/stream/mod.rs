//! Channel-oriented append path to a streaming ingestion service.
//!
//! State machine: Disconnected -> (open channel) -> Open -> (close) -> Closed.
//! A closed writer may be connected again, which opens a fresh channel.
//! The session lives behind an async mutex, so `write_batch` and `close`
//! never interleave. Every outbound request carries a freshly minted token.

pub mod auth;
pub mod transport;
pub mod types;

use std::sync::Arc;
use std::time::Duration;

use keyway_core::{
    CallContext, ClockSource, KvError, KvResult, Message, RequestIdSource, SystemClock, UuidSource,
};
use rsa::RsaPrivateKey;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use self::auth::{load_private_key, TokenSigner};
use self::transport::{IngestRequest, IngestTransport, ReqwestTransport};
use self::types::{
    InsertRowsRequest, OpenChannelRequest, OpenChannelResponse, RegisterBlobResponse, WriteMode,
    ENDPOINT_OPEN_CHANNEL, ENDPOINT_REGISTER_BLOB, STATUS_SUCCESS,
};
use crate::config::StreamConfig;
use crate::instrument::observed;

/// Server-assigned state of an open channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSession {
    /// The open-channel response as received, including column metadata.
    pub setup: OpenChannelResponse,
    /// Next row sequencer; starts at the server's value and advances per
    /// accepted row.
    pub row_sequencer: i64,
}

impl ChannelSession {
    fn new(setup: OpenChannelResponse) -> Self {
        Self {
            row_sequencer: setup.row_sequencer,
            setup,
        }
    }

    #[must_use]
    pub fn client_sequencer(&self) -> i64 {
        self.setup.client_sequencer
    }

    #[must_use]
    pub fn offset_token(&self) -> Option<&str> {
        self.setup.offset_token.as_deref()
    }
}

#[derive(Debug)]
enum SessionState {
    Disconnected,
    Open(ChannelSession),
    Closed,
}

pub struct StreamWriter {
    config: StreamConfig,
    base_url: String,
    signer: TokenSigner,
    transport: Arc<dyn IngestTransport>,
    ids: Arc<dyn RequestIdSource>,
    request_timeout: Duration,
    session: tokio::sync::Mutex<SessionState>,
}

impl StreamWriter {
    /// Loads the signing key from disk and talks HTTP through `reqwest`.
    ///
    /// # Errors
    ///
    /// [`KvError::InvalidConfiguration`] when the key cannot be loaded or the
    /// HTTP client cannot be built.
    pub fn from_config(config: StreamConfig) -> KvResult<Self> {
        let key = load_private_key(&config.private_key_file, config.private_key_pass.as_deref())?;
        let transport = Arc::new(ReqwestTransport::new(config.request_timeout())?);
        Self::with_parts(config, &key, transport, Arc::new(SystemClock), Arc::new(UuidSource))
    }

    /// Builds a writer from already-loaded parts.
    ///
    /// # Errors
    ///
    /// [`KvError::InvalidConfiguration`] if the key cannot be prepared for
    /// signing.
    pub fn with_parts(
        config: StreamConfig,
        key: &RsaPrivateKey,
        transport: Arc<dyn IngestTransport>,
        clock: Arc<dyn ClockSource>,
        ids: Arc<dyn RequestIdSource>,
    ) -> KvResult<Self> {
        let signer = TokenSigner::new(&config.account, &config.user, key, clock)?;
        Ok(Self {
            base_url: config.base_url().trim_end_matches('/').to_string(),
            request_timeout: config.request_timeout(),
            config,
            signer,
            transport,
            ids,
            session: tokio::sync::Mutex::new(SessionState::Disconnected),
        })
    }

    /// Snapshot of the open channel, if any.
    pub async fn session(&self) -> Option<ChannelSession> {
        match &*self.session.lock().await {
            SessionState::Open(session) => Some(session.clone()),
            SessionState::Disconnected | SessionState::Closed => None,
        }
    }

    /// Opens the channel. A no-op when already open.
    ///
    /// # Errors
    ///
    /// [`KvError::Transport`] when the request fails, the HTTP status is not
    /// 200, or the response reports a non-zero status code.
    pub async fn connect(&self, ctx: &CallContext) -> KvResult<()> {
        observed("stream", "open_channel", async {
            let mut state = self.session.lock().await;
            if matches!(*state, SessionState::Open(_)) {
                return Ok(());
            }

            let request = OpenChannelRequest {
                request_id: self.ids.next_id(),
                channel: &self.config.channel,
                table: &self.config.table,
                database: &self.config.database,
                schema: &self.config.schema,
                write_mode: WriteMode::CloudStorage,
                role: &self.config.role,
            };
            let response: OpenChannelResponse = self
                .call(ctx, "open_channel", ENDPOINT_OPEN_CHANNEL, &request)
                .await?;
            if response.status_code != STATUS_SUCCESS {
                return Err(KvError::transport(
                    "open_channel",
                    anyhow::anyhow!(
                        "received unexpected stream response code: {} ({})",
                        response.status_code,
                        response.message
                    ),
                ));
            }

            info!(
                channel = %self.config.channel,
                client_sequencer = response.client_sequencer,
                columns = response.table_columns.len(),
                "channel opened"
            );
            *state = SessionState::Open(ChannelSession::new(response));
            Ok(())
        })
        .await
    }

    /// Submits every message of `batch` as one insert unit on the open channel.
    ///
    /// Each message must be a JSON document; an empty batch succeeds without
    /// any request.
    ///
    /// # Errors
    ///
    /// [`KvError::NotConnected`] unless the channel is open,
    /// [`KvError::Resolve`] for a message that is not JSON, and
    /// [`KvError::Transport`] when the insert is rejected.
    pub async fn write_batch(&self, ctx: &CallContext, batch: &[Message]) -> KvResult<()> {
        observed("stream", "insert_rows", async {
            let mut state = self.session.lock().await;
            let SessionState::Open(session) = &mut *state else {
                return Err(KvError::NotConnected);
            };

            let rows = batch
                .iter()
                .enumerate()
                .map(|(index, msg)| {
                    msg.as_structured().map_err(|e| KvError::Resolve {
                        index,
                        source: anyhow::Error::new(e).context("failed to get message structure"),
                    })
                })
                .collect::<KvResult<Vec<_>>>()?;
            if rows.is_empty() {
                return Ok(());
            }

            let request = InsertRowsRequest {
                request_id: self.ids.next_id(),
                role: &self.config.role,
                database: &self.config.database,
                schema: &self.config.schema,
                table: &self.config.table,
                channel: &self.config.channel,
                client_sequencer: session.client_sequencer(),
                row_sequencer: session.row_sequencer,
                offset_token: session.offset_token(),
                rows: &rows,
            };
            let response: RegisterBlobResponse = self
                .call(ctx, "insert_rows", ENDPOINT_REGISTER_BLOB, &request)
                .await?;
            if response.status_code != STATUS_SUCCESS {
                return Err(KvError::transport(
                    "insert_rows",
                    anyhow::anyhow!(
                        "received unexpected stream response code: {} ({})",
                        response.status_code,
                        response.message
                    ),
                ));
            }
            if let Some(failed) = response.failed_channels().next() {
                return Err(KvError::transport(
                    "insert_rows",
                    anyhow::anyhow!(
                        "channel {} rejected rows with status code {}",
                        failed.channel,
                        failed.status_code
                    ),
                ));
            }

            session.row_sequencer += i64::try_from(rows.len()).unwrap_or(i64::MAX);
            debug!(rows = rows.len(), row_sequencer = session.row_sequencer, "rows inserted");
            Ok(())
        })
        .await
    }

    /// Drops the session. A no-op unless the channel is open.
    ///
    /// # Errors
    ///
    /// Never fails today; the signature leaves room for a server-side close.
    pub async fn close(&self, _ctx: &CallContext) -> KvResult<()> {
        let mut state = self.session.lock().await;
        if matches!(*state, SessionState::Open(_)) {
            *state = SessionState::Closed;
            info!(channel = %self.config.channel, "channel closed");
        }
        Ok(())
    }

    async fn call<Req, Res>(&self, ctx: &CallContext, op: &'static str, endpoint: &str, body: &Req) -> KvResult<Res>
    where
        Req: Serialize + Sync,
        Res: DeserializeOwned,
    {
        let request = IngestRequest {
            url: format!("{}{endpoint}", self.base_url),
            token: self.signer.mint()?,
            body: serde_json::to_value(body).map_err(|e| KvError::transport(op, e))?,
        };
        debug!(op, url = %request.url, "sending stream request");

        let response = ctx
            .or_timeout(self.request_timeout)
            .run(async {
                self.transport
                    .post(request)
                    .await
                    .map_err(|e| KvError::transport(op, e))
            })
            .await?;
        if response.status != 200 {
            return Err(KvError::transport(
                op,
                anyhow::anyhow!("received unexpected stream response status: {}", response.status),
            ));
        }
        serde_json::from_slice(&response.body).map_err(|e| {
            KvError::transport(
                op,
                anyhow::Error::new(e).context("failed to decode stream HTTP response"),
            )
        })
    }
}

impl std::fmt::Debug for StreamWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamWriter")
            .field("base_url", &self.base_url)
            .field("channel", &self.config.channel)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::path::{Path, PathBuf};

    use async_trait::async_trait;
    use bytes::Bytes;
    use keyway_core::{ManualClock, SequentialIds};
    use parking_lot::Mutex;

    use super::transport::IngestResponse;
    use super::*;

    /// Records every request and replies from a queue, defaulting to success.
    #[derive(Default)]
    struct RecordingTransport {
        requests: Mutex<Vec<IngestRequest>>,
        replies: Mutex<VecDeque<IngestResponse>>,
    }

    impl RecordingTransport {
        fn reply(&self, status: u16, body: &str) {
            self.replies.lock().push_back(IngestResponse {
                status,
                body: Bytes::copy_from_slice(body.as_bytes()),
            });
        }

        fn requests(&self) -> Vec<IngestRequest> {
            self.requests.lock().clone()
        }
    }

    #[async_trait]
    impl IngestTransport for RecordingTransport {
        async fn post(&self, request: IngestRequest) -> anyhow::Result<IngestResponse> {
            self.requests.lock().push(request);
            Ok(self.replies.lock().pop_front().unwrap_or(IngestResponse {
                status: 200,
                body: Bytes::from_static(br#"{"status_code":0}"#),
            }))
        }
    }

    fn config() -> StreamConfig {
        StreamConfig {
            account: "benthos".to_string(),
            region: Some("east-us-2".to_string()),
            cloud: Some("azure".to_string()),
            user: "foobar".to_string(),
            role: "test_role".to_string(),
            database: "test_db".to_string(),
            schema: "test_schema".to_string(),
            table: "test_table".to_string(),
            channel: "test_channel".to_string(),
            private_key_file: fixture("rsa_key.pem"),
            private_key_pass: None,
            endpoint: Some("http://ingest.test/".to_string()),
            request_timeout_ms: 5_000,
        }
    }

    fn fixture(name: &str) -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures").join(name)
    }

    fn writer(transport: &Arc<RecordingTransport>, clock: &ManualClock) -> StreamWriter {
        let key = load_private_key(&fixture("rsa_key.pem"), None).unwrap();
        StreamWriter::with_parts(
            config(),
            &key,
            Arc::clone(transport) as Arc<dyn IngestTransport>,
            Arc::new(clock.clone()),
            Arc::new(SequentialIds::new("req")),
        )
        .unwrap()
    }

    const OPENED: &str = r#"{"status_code":0,"message":"Success","client_sequencer":7,
        "row_sequencer":100,"offset_token":"offset-1",
        "table_columns":[{"name":"ID","type":"TEXT","nullable":true}]}"#;

    #[tokio::test]
    async fn write_before_connect_is_not_connected() {
        let transport = Arc::new(RecordingTransport::default());
        let writer = writer(&transport, &ManualClock::new(0));

        let err = writer
            .write_batch(&CallContext::new(), &[Message::new(r#"{"id":1}"#)])
            .await
            .unwrap_err();
        assert!(matches!(err, KvError::NotConnected));
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn connect_opens_channel_once() {
        let transport = Arc::new(RecordingTransport::default());
        transport.reply(200, OPENED);
        let writer = writer(&transport, &ManualClock::new(0));
        let ctx = CallContext::new();

        writer.connect(&ctx).await.unwrap();
        writer.connect(&ctx).await.unwrap();

        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].url, "http://ingest.test/v1/streaming/channels/open/");
        assert_eq!(
            requests[0].body,
            serde_json::json!({
                "request_id": "req-1",
                "channel": "test_channel",
                "table": "test_table",
                "database": "test_db",
                "schema": "test_schema",
                "write_mode": "CLOUD_STORAGE",
                "role": "test_role",
            })
        );

        let session = writer.session().await.unwrap();
        assert_eq!(session.client_sequencer(), 7);
        assert_eq!(session.row_sequencer, 100);
        assert_eq!(session.setup.table_columns.len(), 1);
    }

    #[tokio::test]
    async fn empty_batch_makes_no_request() {
        let transport = Arc::new(RecordingTransport::default());
        let writer = writer(&transport, &ManualClock::new(0));
        let ctx = CallContext::new();
        writer.connect(&ctx).await.unwrap();

        writer.write_batch(&ctx, &[]).await.unwrap();
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn insert_goes_to_register_endpoint_with_session_state() {
        let transport = Arc::new(RecordingTransport::default());
        transport.reply(200, OPENED);
        let clock = ManualClock::new(1_000_000);
        let writer = writer(&transport, &clock);
        let ctx = CallContext::new();
        writer.connect(&ctx).await.unwrap();

        clock.advance(Duration::from_secs(5));
        writer
            .write_batch(
                &ctx,
                &[
                    Message::new(r#"{"id":"foo","content":"foo stuff"}"#),
                    Message::new(r#"{"id":"bar","content":"bar stuff"}"#),
                ],
            )
            .await
            .unwrap();

        let requests = transport.requests();
        assert_eq!(requests.len(), 2);
        let insert = &requests[1];
        assert_eq!(insert.url, "http://ingest.test/v1/streaming/channels/write/blobs/");
        assert_eq!(insert.body["request_id"], "req-2");
        assert_eq!(insert.body["client_sequencer"], 7);
        assert_eq!(insert.body["row_sequencer"], 100);
        assert_eq!(insert.body["offset_token"], "offset-1");
        assert_eq!(insert.body["rows"][1]["id"], "bar");

        // Tokens are minted per request, so a later clock gives a new token.
        assert_ne!(requests[0].token, requests[1].token);
        assert_eq!(writer.session().await.unwrap().row_sequencer, 102);
    }

    #[tokio::test]
    async fn non_success_open_leaves_writer_disconnected() {
        let transport = Arc::new(RecordingTransport::default());
        transport.reply(200, r#"{"status_code":11,"message":"no such table"}"#);
        let writer = writer(&transport, &ManualClock::new(0));
        let ctx = CallContext::new();

        let err = writer.connect(&ctx).await.unwrap_err();
        assert!(err.to_string().contains("unexpected stream response code: 11"), "{err}");
        assert!(writer.session().await.is_none());
        assert!(matches!(
            writer.write_batch(&ctx, &[Message::new("{}")]).await,
            Err(KvError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn http_error_status_is_reported() {
        let transport = Arc::new(RecordingTransport::default());
        transport.reply(418, "");
        let writer = writer(&transport, &ManualClock::new(0));

        let err = writer.connect(&CallContext::new()).await.unwrap_err();
        assert!(
            err.to_string().contains("received unexpected stream response status: 418"),
            "{err}"
        );
    }

    #[tokio::test]
    async fn rejected_channel_fails_the_insert() {
        let transport = Arc::new(RecordingTransport::default());
        let writer = writer(&transport, &ManualClock::new(0));
        let ctx = CallContext::new();
        writer.connect(&ctx).await.unwrap();

        transport.reply(
            200,
            r#"{"status_code":0,"blobs":[{"chunks":[{"channels":[{"status_code":20,"channel":"test_channel"}]}]}]}"#,
        );
        let err = writer.write_batch(&ctx, &[Message::new("{}")]).await.unwrap_err();
        assert!(matches!(err, KvError::Transport { op: "insert_rows", .. }));
        assert_eq!(writer.session().await.unwrap().row_sequencer, 0);
    }

    #[tokio::test]
    async fn non_json_message_is_a_resolve_error() {
        let transport = Arc::new(RecordingTransport::default());
        let writer = writer(&transport, &ManualClock::new(0));
        let ctx = CallContext::new();
        writer.connect(&ctx).await.unwrap();

        let err = writer
            .write_batch(&ctx, &[Message::new("{}"), Message::new("plain text")])
            .await
            .unwrap_err();
        assert!(matches!(err, KvError::Resolve { index: 1, .. }));
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn close_then_write_is_not_connected_and_reconnect_reopens() {
        let transport = Arc::new(RecordingTransport::default());
        let writer = writer(&transport, &ManualClock::new(0));
        let ctx = CallContext::new();

        writer.close(&ctx).await.unwrap();
        writer.connect(&ctx).await.unwrap();
        writer.close(&ctx).await.unwrap();
        assert!(matches!(
            writer.write_batch(&ctx, &[Message::new("{}")]).await,
            Err(KvError::NotConnected)
        ));

        writer.connect(&ctx).await.unwrap();
        assert_eq!(transport.requests().len(), 2);
    }

    #[test]
    fn from_config_reports_key_problems() {
        let mut cfg = config();
        cfg.private_key_file = fixture("rsa_key.p8");
        let err = StreamWriter::from_config(cfg).unwrap_err();
        assert!(err.to_string().contains("requires a passphrase"), "{err}");
    }
}
