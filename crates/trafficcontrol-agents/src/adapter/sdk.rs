//! In-process SDK adapter.
//!
//! Wraps any [`SdkClient`] that can drive a streaming query inside the
//! process. Production deployments wire a real SDK client here; the
//! [`ScriptedClient`] drives the test suites with deterministic message
//! scripts, the same role the mock driver plays in the model-provider
//! crates this design is drawn from.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use trafficcontrol_types::{Model, RawUsage, SessionId, Usage};

use super::{ActiveQuery, AdapterError, AgentAdapter, AgentMessage, ModelMemory, QueryConfig};

/// A client able to run one streaming query in-process.
#[async_trait]
pub trait SdkClient: Send + Sync {
    /// Start a query and return its live handle.
    ///
    /// Implementations create the handle with [`ActiveQuery::channel`] and
    /// drive the feeder from a spawned task.
    async fn start(
        &self,
        session_id: SessionId,
        prompt: &str,
        config: &QueryConfig,
    ) -> Result<ActiveQuery, AdapterError>;
}

/// Adapter running queries through an in-process [`SdkClient`].
pub struct SdkAdapter {
    client: Arc<dyn SdkClient>,
    memory: ModelMemory,
}

impl SdkAdapter {
    /// Create an adapter over `client`.
    pub fn new(client: Arc<dyn SdkClient>) -> Self {
        Self {
            client,
            memory: ModelMemory::new(),
        }
    }
}

#[async_trait]
impl AgentAdapter for SdkAdapter {
    async fn start_query(
        &self,
        session_id: SessionId,
        prompt: &str,
        config: &QueryConfig,
    ) -> Result<ActiveQuery, AdapterError> {
        let query = self.client.start(session_id, prompt, config).await?;
        self.memory.remember(session_id, config.model);
        Ok(query)
    }

    fn extract_usage(&self, session_id: SessionId, model: Option<Model>, raw: &RawUsage) -> Usage {
        self.memory.normalize(session_id, model, raw)
    }
}

//─────────────────────────────
//  Scripted client
//─────────────────────────────

/// One step of a scripted session.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    /// Emit a normalized message.
    Emit(AgentMessage),
    /// Wait before the next step.
    Sleep(Duration),
    /// Block until text is injected into the session.
    AwaitInjection,
}

/// Script for one spawned session.
#[derive(Debug, Clone, Default)]
pub struct SessionScript {
    /// Steps played in order.
    pub steps: Vec<ScriptStep>,
    /// Fail `start` instead of playing the script.
    pub fail_start: bool,
}

impl SessionScript {
    /// A script that immediately succeeds with the given final text.
    pub fn success(text: &str, usage: RawUsage) -> Self {
        Self {
            steps: vec![ScriptStep::Emit(AgentMessage::ResultSuccess {
                text: text.to_string(),
                duration_ms: 10,
                usage,
            })],
            fail_start: false,
        }
    }

    /// A script that immediately fails with one error.
    pub fn failure(error: &str) -> Self {
        Self {
            steps: vec![ScriptStep::Emit(AgentMessage::ResultError {
                errors: vec![error.to_string()],
                usage: RawUsage::default(),
            })],
            fail_start: false,
        }
    }

    /// A script whose `start` call fails.
    pub fn start_failure() -> Self {
        Self {
            steps: Vec::new(),
            fail_start: true,
        }
    }
}

/// Deterministic [`SdkClient`] playing pre-loaded scripts, one per spawn.
///
/// Spawns beyond the loaded scripts end their stream immediately without a
/// terminal event, which exercises the manager's stream-closed handling.
#[derive(Default)]
pub struct ScriptedClient {
    scripts: Mutex<VecDeque<SessionScript>>,
    injections: Arc<Mutex<Vec<(SessionId, String)>>>,
}

impl ScriptedClient {
    /// Create a client with no scripts loaded.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a script for the next spawn.
    pub fn push_script(&self, script: SessionScript) {
        self.scripts.lock().unwrap_or_else(|p| p.into_inner()).push_back(script);
    }

    /// Text injected into sessions so far, in arrival order.
    pub fn injections(&self) -> Vec<(SessionId, String)> {
        self.injections.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

#[async_trait]
impl SdkClient for ScriptedClient {
    async fn start(
        &self,
        session_id: SessionId,
        _prompt: &str,
        _config: &QueryConfig,
    ) -> Result<ActiveQuery, AdapterError> {
        let script = self
            .scripts
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front()
            .unwrap_or_default();
        if script.fail_start {
            return Err(AdapterError::SpawnFailed("scripted start failure".into()));
        }

        let (query, mut feeder) = ActiveQuery::channel(session_id);
        let injections = self.injections.clone();
        tokio::spawn(async move {
            for step in script.steps {
                match step {
                    ScriptStep::Emit(message) => {
                        if feeder.tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    ScriptStep::Sleep(duration) => {
                        tokio::select! {
                            _ = feeder.cancel.cancelled() => break,
                            _ = tokio::time::sleep(duration) => {}
                        }
                    }
                    ScriptStep::AwaitInjection => {
                        tokio::select! {
                            _ = feeder.cancel.cancelled() => break,
                            injected = feeder.inject_rx.recv() => {
                                match injected {
                                    Some(text) => {
                                        debug!(%session_id, text, "scripted session received injection");
                                        injections
                                            .lock()
                                            .unwrap_or_else(|p| p.into_inner())
                                            .push((session_id, text));
                                    }
                                    None => break,
                                }
                            }
                        }
                    }
                }
            }
            feeder.running.store(false, Ordering::SeqCst);
        });
        Ok(query)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_success_plays_through_adapter() {
        let client = Arc::new(ScriptedClient::new());
        client.push_script(SessionScript::success(
            "all done",
            RawUsage {
                input_tokens: 1_000,
                output_tokens: 500,
                ..Default::default()
            },
        ));
        let adapter = SdkAdapter::new(client);

        let session = SessionId::new();
        let mut query = adapter
            .start_query(session, "do it", &QueryConfig::for_model(Model::Haiku))
            .await
            .unwrap();

        match query.next().await {
            Some(AgentMessage::ResultSuccess { text, usage, .. }) => {
                assert_eq!(text, "all done");
                let normalized = adapter.extract_usage(session, None, &usage);
                let expected = Usage::cost_for(Model::Haiku, 1_000, 500);
                assert!((normalized.cost_usd - expected).abs() < 1e-12);
            }
            other => panic!("unexpected message: {other:?}"),
        }
        assert!(query.next().await.is_none());
    }

    #[tokio::test]
    async fn start_failure_propagates() {
        let client = Arc::new(ScriptedClient::new());
        client.push_script(SessionScript::start_failure());
        let adapter = SdkAdapter::new(client);

        let result = adapter
            .start_query(SessionId::new(), "x", &QueryConfig::for_model(Model::Opus))
            .await;
        assert!(matches!(result, Err(AdapterError::SpawnFailed(_))));
    }

    #[tokio::test]
    async fn awaiting_script_sees_injection() {
        let client = Arc::new(ScriptedClient::new());
        client.push_script(SessionScript {
            steps: vec![
                ScriptStep::AwaitInjection,
                ScriptStep::Emit(AgentMessage::ResultSuccess {
                    text: "after reply".into(),
                    duration_ms: 1,
                    usage: RawUsage::default(),
                }),
            ],
            fail_start: false,
        });
        let session = SessionId::new();
        let mut query = client
            .start(session, "x", &QueryConfig::for_model(Model::Sonnet))
            .await
            .unwrap();

        query.control().inject("the answer is 42".into()).await.unwrap();
        assert!(matches!(
            query.next().await,
            Some(AgentMessage::ResultSuccess { .. })
        ));
        assert_eq!(
            client.injections(),
            vec![(session, "the answer is 42".to_string())]
        );
    }
}
