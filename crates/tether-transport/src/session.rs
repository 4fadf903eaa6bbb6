//! One blocking wait call at a time over MCP streamable HTTP.
//!
//! [`McpTransport`] lazily performs the `initialize` handshake, keeps the
//! server-issued `mcp-session-id`, and issues `tools/call messages` with
//! `wait: true`. Responses arrive either as a JSON body or as an SSE stream;
//! both are reduced to the JSON-RPC response for the request id, unwrapped,
//! and decoded into [`Event`]s.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde_json::{Value, json};
use tether_auth::Credential;
use tether_core::{Event, IdentityManager, WaitRequest};
use tracing::{debug, instrument, warn};

use crate::decode::decode_events;
use crate::errors::{ProtocolError, TransportError, WaitError};
use crate::heartbeat::HeartbeatMonitor;
use crate::rpc::{
    MESSAGES_TOOL, PROTOCOL_VERSION, RpcRequest, RpcResponse, find_response, tool_payload,
};
use crate::sse::SseDecoder;

/// Header carrying the MCP session id.
pub const SESSION_HEADER: &str = "mcp-session-id";
/// Header carrying the negotiated protocol revision.
pub const PROTOCOL_HEADER: &str = "MCP-Protocol-Version";
/// Slack added to the server-side wait timeout for the local deadline.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(30);

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_ERROR_BODY: usize = 512;

/// Performs wait calls against the message service.
#[async_trait]
pub trait WaitTransport: Send + Sync {
    /// Block until the server returns events or its timeout elapses.
    async fn wait(
        &self,
        request: &WaitRequest,
        credential: &Credential,
    ) -> Result<Vec<Event>, WaitError>;

    /// Drop connection-level state so the next call starts fresh.
    async fn reset(&self) {}
}

#[derive(Clone, Debug)]
struct McpSession {
    id: Option<String>,
}

struct Reply {
    session_id: Option<String>,
    body: Value,
}

/// [`WaitTransport`] speaking JSON-RPC over streamable HTTP.
pub struct McpTransport {
    client: reqwest::Client,
    endpoint: String,
    identity: IdentityManager,
    heartbeat: Arc<HeartbeatMonitor>,
    session: Mutex<Option<McpSession>>,
    next_id: AtomicU64,
    grace: Duration,
}

impl McpTransport {
    /// Create a transport for `endpoint` with its own HTTP client.
    pub fn new(
        endpoint: impl Into<String>,
        identity: IdentityManager,
        heartbeat: Arc<HeartbeatMonitor>,
    ) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self::with_client(endpoint, identity, heartbeat, client))
    }

    /// Create a transport using an existing client.
    #[must_use]
    pub fn with_client(
        endpoint: impl Into<String>,
        identity: IdentityManager,
        heartbeat: Arc<HeartbeatMonitor>,
        client: reqwest::Client,
    ) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            identity,
            heartbeat,
            session: Mutex::new(None),
            next_id: AtomicU64::new(1),
            grace: DEFAULT_GRACE,
        }
    }

    /// Override the local deadline slack.
    #[must_use]
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Server-issued session id, once the handshake has completed.
    #[must_use]
    pub fn session_id(&self) -> Option<String> {
        self.session.lock().as_ref().and_then(|s| s.id.clone())
    }

    /// Heartbeat fed by this transport.
    #[must_use]
    pub fn heartbeat(&self) -> &Arc<HeartbeatMonitor> {
        &self.heartbeat
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    #[instrument(skip_all)]
    async fn handshake(&self, credential: &Credential) -> Result<McpSession, WaitError> {
        let id = self.next_id();
        let reply = self
            .send(&RpcRequest::initialize(id), credential, HANDSHAKE_TIMEOUT, None)
            .await?;
        let result = response_for(reply.body, id)
            .and_then(RpcResponse::into_result)
            .map_err(|e| TransportError::Handshake(e.to_string()))?;

        let session = McpSession {
            id: reply.session_id,
        };
        let _ = self
            .send(
                &RpcRequest::notification("notifications/initialized"),
                credential,
                HANDSHAKE_TIMEOUT,
                session.id.as_deref(),
            )
            .await?;

        let server_info = result.get("serverInfo").unwrap_or(&serde_json::Value::Null);
        debug!(
            session_id = session.id.as_deref().unwrap_or("-"),
            server = %server_info,
            "MCP session initialized"
        );
        *self.session.lock() = Some(session.clone());
        Ok(session)
    }

    async fn send(
        &self,
        rpc: &RpcRequest,
        credential: &Credential,
        deadline: Duration,
        session_id: Option<&str>,
    ) -> Result<Reply, WaitError> {
        let mut builder = self
            .client
            .post(&self.endpoint)
            .timeout(deadline)
            .bearer_auth(&credential.access_token)
            .header(ACCEPT, "application/json, text/event-stream")
            .header(PROTOCOL_HEADER, PROTOCOL_VERSION)
            .json(rpc);
        for (name, value) in self.identity.headers() {
            builder = builder.header(name, value);
        }
        if let Some(sid) = session_id {
            builder = builder.header(SESSION_HEADER, sid);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| request_error(e, deadline))?;
        self.heartbeat.tick();

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(TransportError::Unauthorized.into());
        }
        if status == StatusCode::NOT_FOUND && session_id.is_some() {
            *self.session.lock() = None;
            return Err(TransportError::SessionExpired.into());
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(TransportError::Http {
                status: status.as_u16(),
                message: text.chars().take(MAX_ERROR_BODY).collect(),
            }
            .into());
        }

        let issued = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = self.read_body(response, rpc.id, deadline).await?;
        Ok(Reply {
            session_id: issued,
            body,
        })
    }

    /// Read the body, ticking the heartbeat on every chunk.
    async fn read_body(
        &self,
        response: reqwest::Response,
        id: Option<u64>,
        deadline: Duration,
    ) -> Result<Value, WaitError> {
        let is_sse = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));

        let mut stream = response.bytes_stream();
        let mut raw = BytesMut::new();
        let mut sse = SseDecoder::new();
        let mut messages = Vec::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| request_error(e, deadline))?;
            self.heartbeat.tick();
            if !is_sse {
                raw.extend_from_slice(&chunk);
                continue;
            }
            for data in sse.push(&chunk) {
                if collect_message(&mut messages, &data, id) {
                    return Ok(Value::Array(messages));
                }
            }
        }

        if is_sse {
            if let Some(data) = sse.finish() {
                let _ = collect_message(&mut messages, &data, id);
            }
            return Ok(Value::Array(messages));
        }
        if raw.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_slice(&raw).map_err(ProtocolError::from)?)
    }
}

#[async_trait]
impl WaitTransport for McpTransport {
    #[instrument(skip_all, fields(wait_mode = %request.wait_mode, timeout_s = request.timeout.as_secs()))]
    async fn wait(
        &self,
        request: &WaitRequest,
        credential: &Credential,
    ) -> Result<Vec<Event>, WaitError> {
        self.heartbeat.tick();

        let existing = self.session.lock().clone();
        let session = match existing {
            Some(session) => session,
            None => self.handshake(credential).await?,
        };

        let id = self.next_id();
        let rpc = RpcRequest::tool_call(id, MESSAGES_TOOL, wait_arguments(request));
        let deadline = request.timeout + self.grace;
        let reply = self
            .send(&rpc, credential, deadline, session.id.as_deref())
            .await?;

        let result = response_for(reply.body, id)?.into_result()?;
        let payload = tool_payload(result)?;
        let events = decode_events(&payload)?;
        debug!(count = events.len(), "wait call returned");
        Ok(events)
    }

    async fn reset(&self) {
        if self.session.lock().take().is_some() {
            debug!("dropped MCP session");
        }
    }
}

/// Arguments of the `messages` tool for one wait call.
#[must_use]
pub fn wait_arguments(request: &WaitRequest) -> Value {
    let mut args = json!({
        "action": "check",
        "wait": true,
        "wait_mode": request.wait_mode.as_str(),
        "timeout": request.timeout.as_secs(),
        "limit": request.limit,
        "mode": request.list_mode.as_str(),
    });
    if let Some(since) = &request.since {
        args["since"] = Value::String(since.as_str().to_string());
    }
    args
}

fn response_for(body: Value, id: u64) -> Result<RpcResponse, ProtocolError> {
    if body.is_null() {
        return Err(ProtocolError::MissingResponse(id));
    }
    find_response(body, id)
}

/// Parse one SSE data payload into `messages`. True once the response to `id` is in.
fn collect_message(messages: &mut Vec<Value>, data: &str, id: Option<u64>) -> bool {
    let Ok(value) = serde_json::from_str::<Value>(data) else {
        warn!(len = data.len(), "skipping non-JSON SSE event");
        return false;
    };
    let done = id.is_some_and(|id| {
        serde_json::from_value::<RpcResponse>(value.clone())
            .is_ok_and(|resp| resp.answers(id))
    });
    messages.push(value);
    done
}

fn request_error(e: reqwest::Error, deadline: Duration) -> WaitError {
    if e.is_timeout() {
        TransportError::Timeout(deadline).into()
    } else {
        TransportError::Request(e).into()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
