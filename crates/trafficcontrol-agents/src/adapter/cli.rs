//! CLI subprocess adapter.
//!
//! Spawns the relay CLI with streaming JSON output and translates its
//! line-delimited stdout protocol into normalized [`AgentMessage`]s. The
//! child process must authenticate with its own credentials, so
//! `ANTHROPIC_API_KEY` and `CI` are removed from its environment before
//! exec.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use trafficcontrol_types::{Model, RawUsage, SessionId, Usage};

use super::{
    ActiveQuery, AdapterError, AgentAdapter, AgentMessage, ModelMemory, PermissionMode,
    QueryConfig,
};

/// Adapter that runs each query as a relay CLI subprocess.
pub struct CliAdapter {
    cli_path: PathBuf,
    memory: ModelMemory,
}

impl CliAdapter {
    /// Create an adapter invoking the binary at `cli_path`.
    pub fn new(cli_path: impl Into<PathBuf>) -> Self {
        Self {
            cli_path: cli_path.into(),
            memory: ModelMemory::new(),
        }
    }

    /// Command-line arguments for one query.
    fn build_args(prompt: &str, config: &QueryConfig) -> Vec<String> {
        let mut args = vec![
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
            "--max-turns".to_string(),
            config.max_turns.to_string(),
            "--model".to_string(),
            config.model.as_str().to_string(),
        ];
        if config.permission_mode == PermissionMode::Bypass {
            args.push("--dangerously-skip-permissions".to_string());
        }
        if let Some(resume) = &config.resume_session {
            args.push("--resume".to_string());
            args.push(resume.clone());
        }
        if let Some(suffix) = &config.system_prompt_suffix {
            args.push("--append-system-prompt".to_string());
            args.push(suffix.clone());
        }
        args.push("--print".to_string());
        args.push(prompt.to_string());
        args
    }
}

#[async_trait]
impl AgentAdapter for CliAdapter {
    async fn start_query(
        &self,
        session_id: SessionId,
        prompt: &str,
        config: &QueryConfig,
    ) -> Result<ActiveQuery, AdapterError> {
        let args = Self::build_args(prompt, config);
        let mut child = Command::new(&self.cli_path)
            .args(&args)
            .current_dir(&config.working_dir)
            .env_remove("ANTHROPIC_API_KEY")
            .env_remove("CI")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AdapterError::SpawnFailed(format!("{}: {e}", self.cli_path.display())))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AdapterError::SpawnFailed("child stdout not captured".into()))?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| AdapterError::SpawnFailed("child stdin not captured".into()))?;
        let stderr = child.stderr.take();

        self.memory.remember(session_id, config.model);

        let (query, mut feeder) = ActiveQuery::channel(session_id);

        if let Some(stderr) = stderr {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(%session_id, line, "relay stderr");
                }
            });
        }

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let mut inject_open = true;
            loop {
                tokio::select! {
                    _ = feeder.cancel.cancelled() => {
                        debug!(%session_id, "close requested, killing relay subprocess");
                        break;
                    }
                    injected = feeder.inject_rx.recv(), if inject_open => {
                        match injected {
                            Some(text) => {
                                if stdin.write_all(text.as_bytes()).await.is_err()
                                    || stdin.write_all(b"\n").await.is_err()
                                    || stdin.flush().await.is_err()
                                {
                                    warn!(%session_id, "failed to inject text into relay stdin");
                                }
                            }
                            None => inject_open = false,
                        }
                    }
                    line = lines.next_line() => {
                        match line {
                            Ok(Some(line)) => {
                                let mut receiver_gone = false;
                                for message in parse_wire_line(&line) {
                                    if feeder.tx.send(message).await.is_err() {
                                        receiver_gone = true;
                                        break;
                                    }
                                }
                                if receiver_gone {
                                    // Nobody is listening; stop the child.
                                    break;
                                }
                            }
                            Ok(None) => break,
                            Err(error) => {
                                warn!(%session_id, %error, "error reading relay stdout");
                                break;
                            }
                        }
                    }
                }
            }
            feeder.running.store(false, Ordering::SeqCst);
            let _ = child.kill().await;
            let _ = child.wait().await;
        });

        Ok(query)
    }

    fn extract_usage(&self, session_id: SessionId, model: Option<Model>, raw: &RawUsage) -> Usage {
        self.memory.normalize(session_id, model, raw)
    }
}

//─────────────────────────────
//  Wire protocol
//─────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireEvent {
    System {
        #[serde(default)]
        subtype: String,
    },
    Assistant {
        message: WireAssistantMessage,
    },
    Progress {
        #[serde(default)]
        tool_use_id: String,
        #[serde(default)]
        name: String,
        #[serde(default)]
        elapsed_seconds: f64,
    },
    Result {
        #[serde(default)]
        subtype: String,
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        errors: Vec<String>,
        #[serde(default)]
        duration_ms: u64,
        #[serde(default)]
        usage: RawUsage,
        #[serde(default)]
        total_cost_usd: Option<f64>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct WireAssistantMessage {
    #[serde(default)]
    content: Vec<WireContent>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireContent {
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    Text {
        #[serde(default)]
        #[allow(dead_code)]
        text: String,
    },
    #[serde(other)]
    Other,
}

/// Translate one stdout line into zero or more normalized messages.
///
/// Unparseable lines are dropped with a debug log; the relay interleaves
/// human-readable output with the JSON stream under some failure modes.
fn parse_wire_line(line: &str) -> Vec<AgentMessage> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    let event: WireEvent = match serde_json::from_str(trimmed) {
        Ok(event) => event,
        Err(error) => {
            debug!(%error, line = trimmed, "unparseable relay line dropped");
            return Vec::new();
        }
    };
    match event {
        WireEvent::System { subtype } => vec![AgentMessage::System { subtype }],
        WireEvent::Assistant { message } => message
            .content
            .into_iter()
            .filter_map(|item| match item {
                WireContent::ToolUse { id, name, input } => Some(AgentMessage::ToolUse {
                    tool_id: id,
                    tool_name: name,
                    input,
                }),
                _ => None,
            })
            .collect(),
        WireEvent::Progress {
            tool_use_id,
            name,
            elapsed_seconds,
        } => vec![AgentMessage::ToolProgress {
            tool_id: tool_use_id,
            tool_name: name,
            elapsed_secs: elapsed_seconds,
        }],
        WireEvent::Result {
            subtype,
            result,
            errors,
            duration_ms,
            mut usage,
            total_cost_usd,
        } => {
            if usage.total_cost_usd.is_none() {
                usage.total_cost_usd = total_cost_usd;
            }
            if subtype == "success" {
                vec![AgentMessage::ResultSuccess {
                    text: result.unwrap_or_default(),
                    duration_ms,
                    usage,
                }]
            } else {
                let errors = if errors.is_empty() {
                    vec![format!("relay result: {subtype}")]
                } else {
                    errors
                };
                vec![AgentMessage::ResultError { errors, usage }]
            }
        }
        WireEvent::Unknown => vec![AgentMessage::System {
            subtype: "unknown".into(),
        }],
    }
}
