//! The `LlmClient` contract and the provider registry.
//!
//! The core never talks to a provider directly: concrete clients are
//! registered by model id at run start and the executor resolves them
//! through the registry. `stop_reason = Length` is the trigger for the
//! TRUNCATED_OUTPUT branch; providers that cannot report it are covered by
//! `Generation::effective_stop_reason`, which emulates it from observed
//! output size.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub messages: Vec<Message>,
    pub max_input_tokens: u64,
    pub max_output_tokens: u64,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopReason {
    End,
    Length,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Generation {
    pub text: String,
    pub stop_reason: StopReason,
    pub tokens_in: u64,
    pub tokens_out: u64,
}

impl Generation {
    /// The stop reason with length-emulation applied: a provider that
    /// reports `End` while having produced exactly the output budget is
    /// treated as truncated.
    pub fn effective_stop_reason(&self, max_output_tokens: u64) -> StopReason {
        if self.stop_reason == StopReason::End
            && max_output_tokens > 0
            && self.tokens_out >= max_output_tokens
        {
            return StopReason::Length;
        }
        self.stop_reason
    }
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Network error talking to provider: {detail}")]
    Network { detail: String },

    #[error("Provider call timed out after {ms}ms")]
    Timeout { ms: u64 },

    #[error("Provider rate limited the request")]
    RateLimited,

    #[error("Provider error: {detail}")]
    Provider { detail: String },
}

impl LlmError {
    /// Transient errors are retried with bounded backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Network { .. } | Self::Timeout { .. } | Self::RateLimited
        )
    }
}

/// The single operation a provider client must expose.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn generate(&self, request: GenerateRequest) -> Result<Generation, LlmError>;
}

/// Provider clients registered by model id at run start.
#[derive(Default, Clone)]
pub struct ClientRegistry {
    clients: HashMap<String, Arc<dyn LlmClient>>,
    /// Serves any model id with no dedicated registration.
    fallback: Option<Arc<dyn LlmClient>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, model_id: &str, client: Arc<dyn LlmClient>) {
        self.clients.insert(model_id.to_string(), client);
    }

    pub fn register_fallback(&mut self, client: Arc<dyn LlmClient>) {
        self.fallback = Some(client);
    }

    pub fn get(&self, model_id: &str) -> Option<Arc<dyn LlmClient>> {
        self.clients
            .get(model_id)
            .cloned()
            .or_else(|| self.fallback.clone())
    }
}

/// A client that shells out to a configured command (e.g. a provider CLI),
/// writing the rendered prompt to stdin and reading the generation from
/// stdout. Token counts are estimated from byte length, which also powers
/// the length-stop emulation for CLIs that cannot report a stop reason.
pub struct CommandClient {
    command: String,
    workdir: std::path::PathBuf,
}

impl CommandClient {
    pub fn new(command: &str, workdir: &std::path::Path) -> Self {
        Self {
            command: command.to_string(),
            workdir: workdir.to_path_buf(),
        }
    }

    fn render_prompt(messages: &[Message]) -> String {
        let mut out = String::new();
        for message in messages {
            match message.role {
                Role::System => {
                    out.push_str("# System\n\n");
                    out.push_str(&message.content);
                    out.push_str("\n\n");
                }
                Role::User | Role::Assistant => {
                    out.push_str(&message.content);
                    out.push('\n');
                }
            }
        }
        out
    }

    fn estimate_tokens(text: &str) -> u64 {
        (text.len() as u64).div_ceil(4)
    }
}

#[async_trait]
impl LlmClient for CommandClient {
    async fn generate(&self, request: GenerateRequest) -> Result<Generation, LlmError> {
        use tokio::io::AsyncWriteExt;

        let prompt = Self::render_prompt(&request.messages);

        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .current_dir(&self.workdir)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| LlmError::Network {
                detail: format!("failed to spawn '{}': {}", self.command, e),
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(prompt.as_bytes())
                .await
                .map_err(|e| LlmError::Network {
                    detail: format!("failed to write prompt: {}", e),
                })?;
            stdin.shutdown().await.map_err(|e| LlmError::Network {
                detail: format!("failed to close stdin: {}", e),
            })?;
        }

        let output = child.wait_with_output().await.map_err(|e| LlmError::Network {
            detail: format!("command failed: {}", e),
        })?;

        if !output.status.success() {
            return Err(LlmError::Provider {
                detail: format!(
                    "command exited {}: {}",
                    output.status.code().unwrap_or(-1),
                    String::from_utf8_lossy(&output.stderr)
                ),
            });
        }

        let text = String::from_utf8_lossy(&output.stdout).to_string();
        let tokens_out = Self::estimate_tokens(&text);
        let stop_reason = if request.max_output_tokens > 0 && tokens_out >= request.max_output_tokens
        {
            StopReason::Length
        } else {
            StopReason::End
        };

        Ok(Generation {
            tokens_in: Self::estimate_tokens(&prompt),
            tokens_out,
            text,
            stop_reason,
        })
    }
}

/// A scripted client that replays canned generations in order. Used by the
/// test suites and by offline dry runs.
pub struct ScriptedClient {
    responses: std::sync::Mutex<std::collections::VecDeque<Result<Generation, LlmError>>>,
}

impl ScriptedClient {
    pub fn new(responses: Vec<Result<Generation, LlmError>>) -> Self {
        Self {
            responses: std::sync::Mutex::new(responses.into()),
        }
    }

    pub fn ok(text: &str) -> Generation {
        Generation {
            text: text.to_string(),
            stop_reason: StopReason::End,
            tokens_in: 100,
            tokens_out: 100,
        }
    }

    pub fn truncated(text: &str) -> Generation {
        Generation {
            text: text.to_string(),
            stop_reason: StopReason::Length,
            tokens_in: 100,
            tokens_out: 100,
        }
    }
}

#[async_trait]
impl LlmClient for ScriptedClient {
    async fn generate(&self, _request: GenerateRequest) -> Result<Generation, LlmError> {
        self.responses
            .lock()
            .expect("scripted client lock")
            .pop_front()
            .unwrap_or_else(|| {
                Err(LlmError::Provider {
                    detail: "scripted client exhausted".to_string(),
                })
            })
    }
}
