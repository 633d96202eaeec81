//! Streamable HTTP transport
//!
//! Every message is a POST to the server endpoint. The answer comes back
//! either as a plain `application/json` body or as a `text/event-stream`
//! whose `data:` lines carry JSON-RPC messages; we read the stream until
//! the response matching our request id shows up. The server may assign
//! a session through the `mcp-session-id` header, which is then echoed on
//! every later message.

use super::{Transport, TransportKind, closed_error};
use crate::config::{ClientConfig, ServerConfig};
use crate::error::{Result, ToolgateError};
use crate::protocol::{
    JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId, ServerMessage,
};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Header carrying the server-assigned session
pub const SESSION_HEADER: &str = "mcp-session-id";

/// Splits a byte stream into trimmed, non-empty text lines.
#[derive(Debug, Default)]
pub struct SseLineBuffer {
    buffer: Vec<u8>,
}

impl SseLineBuffer {
    /// Feed a chunk; returns the lines it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        self.drain(false)
    }

    /// Flush whatever is left once the stream ends.
    pub fn finish(&mut self) -> Vec<String> {
        self.drain(true)
    }

    fn drain(&mut self, flush: bool) -> Vec<String> {
        let mut lines = Vec::new();
        let mut start = 0;

        while let Some(offset) = self.buffer[start..].iter().position(|b| *b == b'\n') {
            let end = start + offset;
            push_trimmed(&self.buffer[start..end], &mut lines);
            start = end + 1;
        }

        if flush {
            push_trimmed(&self.buffer[start..], &mut lines);
            self.buffer.clear();
        } else if start > 0 {
            self.buffer.drain(..start);
        }
        lines
    }
}

fn push_trimmed(bytes: &[u8], lines: &mut Vec<String>) {
    if let Ok(text) = std::str::from_utf8(bytes) {
        let trimmed = text.trim();
        if !trimmed.is_empty() {
            lines.push(trimmed.to_string());
        }
    }
}

/// Whether a content type names an event stream
pub fn is_event_stream(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .map(str::trim)
        .is_some_and(|value| value.eq_ignore_ascii_case("text/event-stream"))
}

/// The payload of an SSE `data:` line
pub fn sse_data(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim)
}

/// A tool server reached over streamable HTTP
pub struct HttpTransport {
    name: String,
    endpoint: String,
    client: reqwest::Client,
    headers: HeaderMap,
    session_id: RwLock<Option<String>>,
    next_id: AtomicI64,
    closed: AtomicBool,
    request_timeout: Duration,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("name", &self.name)
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl HttpTransport {
    pub fn new(name: &str, server: &ServerConfig, client: &ClientConfig) -> Result<Self> {
        let endpoint = server.endpoint.clone().ok_or_else(|| {
            ToolgateError::Configuration(format!("Server '{}' has no endpoint", name))
        })?;

        let mut headers = HeaderMap::new();
        for (key, value) in &server.headers {
            let header_name = HeaderName::from_bytes(key.as_bytes()).map_err(|e| {
                ToolgateError::Configuration(format!("Invalid header name '{}': {}", key, e))
            })?;
            let header_value = HeaderValue::from_str(value).map_err(|e| {
                ToolgateError::Configuration(format!("Invalid value for header '{}': {}", key, e))
            })?;
            headers.insert(header_name, header_value);
        }

        let http = reqwest::Client::builder()
            .connect_timeout(client.handshake_timeout)
            .build()
            .map_err(|e| ToolgateError::Connection(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            name: name.to_string(),
            endpoint,
            client: http,
            headers,
            session_id: RwLock::new(None),
            next_id: AtomicI64::new(1),
            closed: AtomicBool::new(false),
            request_timeout: client.request_timeout,
        })
    }

    async fn post(&self, body: String) -> Result<reqwest::Response> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .headers(self.headers.clone())
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json, text/event-stream")
            .body(body);
        if let Some(session) = self.session_id.read().await.as_deref() {
            request = request.header(SESSION_HEADER, session);
        }

        let response = request.send().await.map_err(|e| {
            ToolgateError::Connection(format!("POST to '{}' failed: {}", self.name, e))
        })?;

        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            let mut current = self.session_id.write().await;
            if current.as_deref() != Some(session) {
                debug!(server = %self.name, session = %session, "Session assigned");
                *current = Some(session.to_string());
            }
        }

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND && self.session_id.read().await.is_some() {
            // the server forgot our session; only a fresh connect can recover
            self.closed.store(true, Ordering::Release);
            return Err(ToolgateError::Connection(format!(
                "Session for '{}' expired",
                self.name
            )));
        }
        if !status.is_success() {
            return Err(ToolgateError::Connection(format!(
                "'{}' answered HTTP {}",
                self.name, status
            )));
        }
        Ok(response)
    }

    async fn exchange(&self, request: JsonRpcRequest) -> Result<Value> {
        let id = request.id.clone();
        let response = self.post(serde_json::to_string(&request)?).await?;

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if is_event_stream(&content_type) {
            self.read_event_stream(response, &id).await?.into_result()
        } else {
            let body: JsonRpcResponse = response.json().await.map_err(|e| {
                ToolgateError::Connection(format!("Bad response body from '{}': {}", self.name, e))
            })?;
            body.into_result()
        }
    }

    async fn read_event_stream(
        &self,
        response: reqwest::Response,
        id: &RequestId,
    ) -> Result<JsonRpcResponse> {
        let mut stream = response.bytes_stream();
        let mut buffer = SseLineBuffer::default();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| {
                ToolgateError::Connection(format!("Event stream from '{}' broke: {}", self.name, e))
            })?;
            for line in buffer.push(&chunk) {
                if let Some(found) = self.match_line(&line, id) {
                    return Ok(found);
                }
            }
        }
        for line in buffer.finish() {
            if let Some(found) = self.match_line(&line, id) {
                return Ok(found);
            }
        }

        Err(ToolgateError::Connection(format!(
            "Event stream from '{}' ended without a response",
            self.name
        )))
    }

    fn match_line(&self, line: &str, id: &RequestId) -> Option<JsonRpcResponse> {
        let payload = sse_data(line).filter(|p| !p.is_empty())?;
        match ServerMessage::from_line(payload) {
            Ok(ServerMessage::Response(response)) if &response.id == id => Some(response),
            Ok(ServerMessage::Notification(n)) => {
                debug!(server = %self.name, method = %n.method, "Server notification");
                None
            }
            Ok(_) => None,
            Err(e) => {
                warn!(server = %self.name, error = %e, "Unparseable event");
                None
            }
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        if self.is_closed() {
            return Err(closed_error(&self.name));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::new(id, method).with_params(params);

        tokio::time::timeout(self.request_timeout, self.exchange(request))
            .await
            .map_err(|_| ToolgateError::Timeout(format!("{} on '{}'", method, self.name)))?
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        if self.is_closed() {
            return Err(closed_error(&self.name));
        }
        let notification = JsonRpcNotification::new(method).with_params(params);
        self.post(serde_json::to_string(&notification)?).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let session = self.session_id.write().await.take();
        if let Some(session) = session {
            // best effort; the server may already be gone
            let result = self
                .client
                .delete(&self.endpoint)
                .headers(self.headers.clone())
                .header(SESSION_HEADER, &session)
                .send()
                .await;
            if let Err(e) = result {
                debug!(server = %self.name, error = %e, "Session teardown failed");
            }
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_buffer_handles_partial_lines() {
        let mut buffer = SseLineBuffer::default();
        assert!(buffer.push(b"data: {\"id\"").is_empty());
        assert_eq!(buffer.push(b":1}\r\n\r\nevent: x"), vec!["data: {\"id\":1}"]);
        assert_eq!(buffer.finish(), vec!["event: x"]);
    }

    #[test]
    fn test_event_stream_detection() {
        assert!(is_event_stream("text/event-stream; charset=utf-8"));
        assert!(is_event_stream("Text/Event-Stream"));
        assert!(!is_event_stream("application/json"));
    }

    #[test]
    fn test_sse_data() {
        assert_eq!(sse_data("data: {\"id\":1}"), Some("{\"id\":1}"));
        assert_eq!(sse_data("event: message"), None);
    }

    #[test]
    fn test_matches_only_our_response() {
        let transport = HttpTransport::new(
            "remote",
            &ServerConfig::http("http://localhost:1/mcp"),
            &ClientConfig::default(),
        )
        .unwrap();
        let ours = RequestId::Number(7);

        assert!(transport
            .match_line(r#"data: {"jsonrpc":"2.0","id":6,"result":{}}"#, &ours)
            .is_none());
        assert!(transport
            .match_line(r#"data: {"jsonrpc":"2.0","method":"notifications/progress"}"#, &ours)
            .is_none());
        let found = transport
            .match_line(r#"data: {"jsonrpc":"2.0","id":7,"result":{"tools":[]}}"#, &ours)
            .unwrap();
        assert!(found.result.is_some());
    }

    #[test]
    fn test_rejects_bad_headers() {
        let server = ServerConfig::http("http://localhost/mcp").with_header("bad header", "x");
        assert!(HttpTransport::new("remote", &server, &ClientConfig::default()).is_err());
    }

    #[tokio::test]
    async fn test_unreachable_server_is_connection_error() {
        let transport = HttpTransport::new(
            "remote",
            &ServerConfig::http("http://127.0.0.1:9/mcp"),
            &ClientConfig::default(),
        )
        .unwrap();
        let err = transport.request("initialize", None).await.unwrap_err();
        assert!(matches!(err, ToolgateError::Connection(_)));
    }
}
