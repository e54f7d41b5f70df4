//! Outbound chat transport.
//!
//! The send primitive is deliberately tiny: one message in, one message id
//! (thread timestamp) out. The Slack driver speaks the Web API with a
//! secrecy-wrapped token; the in-memory driver records everything for
//! assertions and development without a workspace.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;
use tracing::{debug, warn};

use trafficcontrol_bus::{EventBus, EventPayload};

use crate::ChatError;

/// One outbound chat message.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    /// Destination channel id.
    pub channel: String,
    /// Message text.
    pub text: String,
    /// Thread to post into, if replying.
    pub thread_ts: Option<String>,
}

impl OutboundMessage {
    /// Top-level message to `channel`.
    pub fn new(channel: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            text: text.into(),
            thread_ts: None,
        }
    }

    /// Reply in `thread_ts`.
    pub fn in_thread(mut self, thread_ts: impl Into<String>) -> Self {
        self.thread_ts = Some(thread_ts.into());
        self
    }
}

/// Outbound send primitive over some chat service.
///
/// Implementations own their retries and rate limiting; callers treat an
/// error as final.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Deliver `message`, returning its message id (thread timestamp).
    async fn send(&self, message: OutboundMessage) -> Result<String, ChatError>;
}

//─────────────────────────────
//  Slack driver
//─────────────────────────────

const SLACK_POST_MESSAGE_URL: &str = "https://slack.com/api/chat.postMessage";

/// Slack Web API transport.
pub struct SlackTransport {
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct SlackPostResponse {
    ok: bool,
    #[serde(default)]
    ts: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

impl SlackTransport {
    /// Create a transport authenticating with `token`.
    pub fn new(token: Secret<String>) -> Result<Self, ChatError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/json; charset=utf-8"),
        );
        let auth = format!("Bearer {}", token.expose_secret());
        let mut auth_value = HeaderValue::from_str(&auth)
            .map_err(|_| ChatError::Api("token contains invalid header characters".into()))?;
        auth_value.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth_value);
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| ChatError::SendFailed(e.to_string()))?;
        Ok(Self { http })
    }
}

#[async_trait]
impl ChatTransport for SlackTransport {
    async fn send(&self, message: OutboundMessage) -> Result<String, ChatError> {
        let mut body = serde_json::json!({
            "channel": message.channel,
            "text": message.text,
        });
        if let Some(ts) = &message.thread_ts {
            body["thread_ts"] = serde_json::json!(ts);
        }
        let response = self
            .http
            .post(SLACK_POST_MESSAGE_URL)
            .json(&body)
            .send()
            .await
            .map_err(|e| ChatError::SendFailed(e.to_string()))?;
        let parsed: SlackPostResponse = response
            .json()
            .await
            .map_err(|e| ChatError::SendFailed(e.to_string()))?;
        if !parsed.ok {
            return Err(ChatError::Api(
                parsed.error.unwrap_or_else(|| "unknown slack error".into()),
            ));
        }
        parsed
            .ts
            .ok_or_else(|| ChatError::Api("slack response missing ts".into()))
    }
}

//─────────────────────────────
//  In-memory driver
//─────────────────────────────

/// A message recorded by [`MemoryChatTransport`].
#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    /// Destination channel id.
    pub channel: String,
    /// Message text.
    pub text: String,
    /// Thread it was posted into, if any.
    pub thread_ts: Option<String>,
    /// Message id assigned at send time.
    pub ts: String,
}

/// Recording transport for tests and development.
#[derive(Default)]
pub struct MemoryChatTransport {
    sent: Mutex<Vec<SentMessage>>,
    counter: AtomicU64,
    failing: AtomicBool,
}

impl MemoryChatTransport {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// All messages sent so far, oldest first.
    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Most recent message, if any.
    pub fn last(&self) -> Option<SentMessage> {
        self.sent().last().cloned()
    }

    /// Make every subsequent send fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl ChatTransport for MemoryChatTransport {
    async fn send(&self, message: OutboundMessage) -> Result<String, ChatError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ChatError::SendFailed("memory transport set to fail".into()));
        }
        let seq = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let ts = format!("100000000.{seq:06}");
        debug!(channel = message.channel, ts, "memory transport recorded message");
        self.sent
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(SentMessage {
                channel: message.channel,
                text: message.text,
                thread_ts: message.thread_ts,
                ts: ts.clone(),
            });
        Ok(ts)
    }
}

//─────────────────────────────
//  Bus-aware decorator
//─────────────────────────────

/// Transport decorator emitting `chat:out` for every delivered message.
pub struct EventfulTransport {
    inner: Arc<dyn ChatTransport>,
    bus: Arc<EventBus>,
}

impl EventfulTransport {
    /// Wrap `inner`, mirroring sends onto `bus`.
    pub fn new(inner: Arc<dyn ChatTransport>, bus: Arc<EventBus>) -> Self {
        Self { inner, bus }
    }
}

#[async_trait]
impl ChatTransport for EventfulTransport {
    async fn send(&self, message: OutboundMessage) -> Result<String, ChatError> {
        let mirror = message.clone();
        match self.inner.send(message).await {
            Ok(ts) => {
                self.bus.emit(EventPayload::ChatOut {
                    channel: mirror.channel,
                    text: mirror.text,
                    thread_ts: mirror.thread_ts,
                });
                Ok(ts)
            }
            Err(error) => {
                warn!(%error, "chat send failed");
                Err(error)
            }
        }
    }
}
