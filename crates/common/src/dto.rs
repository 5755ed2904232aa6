use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};

// Constants for validation
const MAX_TOKENS_LIMIT: usize = 32_768;
const MIN_TOKENS: usize = 1;
const TEMPERATURE_MIN: f32 = 0.0;
const TEMPERATURE_MAX: f32 = 2.0;

/// Milliseconds since the unix epoch
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// On-disk model artifact format
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ModelFormat {
    /// Quantized weights executed by the native engine (GGUF)
    NativeQuantized,
    /// Generic tensor-graph model (ONNX)
    TensorGraph,
    Unrecognized,
}

impl ModelFormat {
    /// Guess the format from a file extension
    pub fn from_path(path: &Path) -> Self {
        match path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
            .as_deref()
        {
            Some("gguf") => ModelFormat::NativeQuantized,
            Some("onnx") => ModelFormat::TensorGraph,
            _ => ModelFormat::Unrecognized,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelFormat::NativeQuantized => "native_quantized",
            ModelFormat::TensorGraph => "tensor_graph",
            ModelFormat::Unrecognized => "unrecognized",
        }
    }
}

impl fmt::Display for ModelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Acquisition lifecycle of a model artifact
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ModelStatus {
    Fetching,
    Installing,
    Ready,
    Failed,
}

/// Identifies an on-disk model artifact
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelDescriptor {
    pub id: String,
    pub name: String,
    pub format: ModelFormat,
    pub size_bytes: u64,
    pub path: PathBuf,
    pub status: ModelStatus,
    /// Declared throughput hint
    #[serde(default)]
    pub tokens_per_second: Option<u32>,
    /// Parameter count hint, e.g. "7B"
    #[serde(default)]
    pub parameters: Option<String>,
}

impl ModelDescriptor {
    /// Build a ready descriptor for a local file, inferring the format from its extension
    pub fn from_local_file(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "model".to_string());
        let size_bytes = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);

        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name,
            format: ModelFormat::from_path(&path),
            size_bytes,
            path,
            status: ModelStatus::Ready,
            tokens_per_second: None,
            parameters: None,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.status == ModelStatus::Ready
    }
}

/// Metadata probed from a model artifact
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelMetadata {
    pub context_size: usize,
    pub chat_template: String,
    pub architecture: String,
    pub valid: bool,
}

impl Default for ModelMetadata {
    fn default() -> Self {
        Self {
            context_size: 4096,
            chat_template: String::new(),
            architecture: String::new(),
            valid: false,
        }
    }
}

impl ModelMetadata {
    pub fn chat_template(&self) -> Option<&str> {
        if self.chat_template.is_empty() {
            None
        } else {
            Some(&self.chat_template)
        }
    }
}

/// Message role enum for strict validation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl From<&str> for Role {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "system" => Role::System,
            "assistant" => Role::Assistant,
            _ => Role::User, // Default to user for unknown roles
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Chat message with role and content
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Why a generation stopped
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndOfSequence,
    MaxTokensReached,
    Cancelled,
    Error,
    Completed,
}

impl StopReason {
    /// Classify a finished generation.
    ///
    /// An explicit end-of-generation signal from the engine wins over the token count.
    pub fn classify(token_count: usize, max_tokens: usize, natural_end: bool) -> Self {
        if natural_end {
            StopReason::EndOfSequence
        } else if token_count >= max_tokens {
            StopReason::MaxTokensReached
        } else {
            StopReason::Completed
        }
    }

    /// Whether a turn ending this way counts as a successful reply
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            StopReason::EndOfSequence | StopReason::MaxTokensReached | StopReason::Completed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::EndOfSequence => "eos_token",
            StopReason::MaxTokensReached => "max_tokens_reached",
            StopReason::Cancelled => "cancelled",
            StopReason::Error => "error",
            StopReason::Completed => "completed",
        }
    }
}

/// Performance annotations attached to an assistant turn
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TurnStats {
    pub response_time_ms: u64,
    pub token_count: usize,
    pub tokens_per_second: f32,
    pub stop_reason: StopReason,
}

impl TurnStats {
    pub fn new(token_count: usize, response_time_ms: u64, stop_reason: StopReason) -> Self {
        let tokens_per_second = if response_time_ms > 0 {
            (token_count as f32 * 1000.0) / response_time_ms as f32
        } else {
            0.0
        };

        Self {
            response_time_ms,
            token_count,
            tokens_per_second,
            stop_reason,
        }
    }
}

/// One persisted message of a chat session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationTurn {
    /// Assigned by storage on insert; zero before that
    #[serde(default)]
    pub id: u64,
    pub session_id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: u64,
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub stats: Option<TurnStats>,
}

impl ConversationTurn {
    pub fn user(session_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: 0,
            session_id: session_id.into(),
            role: Role::User,
            content: content.into(),
            timestamp: now_millis(),
            model_id: None,
            stats: None,
        }
    }

    pub fn assistant(
        session_id: impl Into<String>,
        content: impl Into<String>,
        model_id: Option<String>,
        stats: Option<TurnStats>,
    ) -> Self {
        Self {
            id: 0,
            session_id: session_id.into(),
            role: Role::Assistant,
            content: content.into(),
            timestamp: now_millis(),
            model_id,
            stats,
        }
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stats.as_ref().map(|s| s.stop_reason)
    }

    pub fn as_message(&self) -> Message {
        Message::new(self.role, self.content.clone())
    }
}

/// A chat session grouping turns
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatSession {
    pub session_id: String,
    pub title: String,
    pub created_at: u64,
    pub updated_at: u64,
}

impl ChatSession {
    pub fn new(session_id: impl Into<String>, title: impl Into<String>) -> Self {
        let now = now_millis();
        Self {
            session_id: session_id.into(),
            title: title.into(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn generate_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

/// Transient performance report of a runtime
#[derive(Debug, Clone, Serialize, PartialEq, Default)]
pub struct PerformanceMetrics {
    pub tokens_per_second: f32,
    pub average_latency_ms: u64,
    pub memory_usage_mb: u64,
    pub accelerator: Option<String>,
}

/// Per-call generation knobs
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationParams {
    pub max_tokens: usize,
    pub temperature: f32,
}

impl GenerationParams {
    pub fn new(max_tokens: usize, temperature: f32) -> Self {
        Self {
            max_tokens,
            temperature,
        }
    }

    /// Validate the parameters
    pub fn validate(&self) -> Result<()> {
        if self.max_tokens < MIN_TOKENS || self.max_tokens > MAX_TOKENS_LIMIT {
            return Err(Error::InvalidArgument(format!(
                "max_tokens must be between {} and {}",
                MIN_TOKENS, MAX_TOKENS_LIMIT
            )));
        }
        if !(TEMPERATURE_MIN..=TEMPERATURE_MAX).contains(&self.temperature) {
            return Err(Error::InvalidArgument(format!(
                "Temperature must be between {} and {}",
                TEMPERATURE_MIN, TEMPERATURE_MAX
            )));
        }
        Ok(())
    }
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: 512,
            temperature: 0.7,
        }
    }
}

/// Load-time session parameters; changing them requires a reload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadOptions {
    pub threads: usize,
    pub context_length: usize,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            threads: 4,
            context_length: 4096,
        }
    }
}

/// Token usage statistics
#[derive(Debug, Clone, Serialize, Default, PartialEq)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

impl Usage {
    pub fn new(prompt_tokens: usize, completion_tokens: usize) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// Item of a generation stream
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamFrame {
    /// Delta content chunk
    Delta { content: String },
    /// End of stream with usage stats
    Done {
        finish_reason: StopReason,
        usage: Usage,
    },
}
