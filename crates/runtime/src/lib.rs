mod accel;
mod gguf_runtime;
mod graph_runtime;
mod manager;
pub mod native;
pub mod template_engine;
mod tokenizer;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

#[cfg(test)]
mod tests;

pub use accel::{AccelerationProbe, AccelerationType, FixedAcceleration};
pub use gguf_runtime::GgufRuntime;
pub use graph_runtime::{GraphBackend, GraphRuntime, GraphSession};
pub use manager::ModelManager;
pub use native::{NativeBackend, NativeEngine, NativeEngineAvailable, NativeSession, SessionHandle};
pub use template_engine::TemplateEngine;
pub use tokenizer::{TokenId, Tokenizer};

use async_trait::async_trait;
use futures::Stream;
use halo_common::{
    Error, GenerationParams, LoadOptions, ModelDescriptor, ModelMetadata, PerformanceMetrics,
    Result, Role, StreamFrame,
};
use std::path::Path;
use std::pin::Pin;

/// Lazy, finite sequence of generation frames
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<StreamFrame>> + Send>>;

/// One inference backend able to hold a loaded model
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Load the artifact. On failure the runtime is left unloaded.
    async fn initialize_model(&self, descriptor: &ModelDescriptor, options: LoadOptions) -> Result<()>;

    /// Start generating. Fails before yielding anything when no model is loaded.
    async fn generate_response(&self, prompt: &str, params: GenerationParams) -> Result<FrameStream>;

    /// Ask the in-flight generation to stop; never blocks
    fn stop_generation(&self);

    /// Tear down the loaded model. Safe to call repeatedly.
    async fn release(&self);

    fn performance_metrics(&self) -> PerformanceMetrics;

    fn is_ready(&self) -> bool;

    fn name(&self) -> &'static str;

    /// Conversation-state extensions, when the runtime supports them
    fn as_conversational(&self) -> Option<&dyn ConversationalRuntime> {
        None
    }
}

/// Runtimes whose engine keeps the conversation between turns
#[async_trait]
pub trait ConversationalRuntime: Send + Sync {
    async fn add_conversation_message(&self, role: Role, content: &str) -> Result<()>;

    async fn clear_conversation(&self) -> Result<()>;

    /// Probe artifact metadata; does not require a loaded model
    async fn read_metadata(&self, path: &Path) -> ModelMetadata;

    /// Tokens per second of the last completion
    fn generation_speed(&self) -> f32;

    /// Tokens of the context window currently in use
    fn context_usage(&self) -> usize;
}

/// Extension trait for convenience methods
#[async_trait]
pub trait RuntimeExt: Runtime {
    /// Generate without streaming (collects all frames)
    async fn generate_blocking(&self, prompt: &str, params: GenerationParams) -> Result<String> {
        use futures::StreamExt;

        let mut stream = self.generate_response(prompt, params).await?;
        let mut content = String::new();

        while let Some(frame) = stream.next().await {
            if let StreamFrame::Delta { content: delta } = frame? {
                content.push_str(&delta);
            }
        }

        Ok(content)
    }
}

// Implement RuntimeExt for all Runtime implementers
impl<T: Runtime + ?Sized> RuntimeExt for T {}

/// Check that a model artifact exists and can be opened
pub(crate) async fn check_artifact(path: &Path) -> Result<u64> {
    let metadata = tokio::fs::metadata(path).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::PermissionDenied => {
            Error::PermissionDenied(format!("Cannot access {}", path.display()))
        }
        _ => Error::ArtifactNotFound(path.display().to_string()),
    })?;
    if !metadata.is_file() {
        return Err(Error::ArtifactNotFound(format!(
            "{} is not a file",
            path.display()
        )));
    }

    tokio::fs::File::open(path)
        .await
        .map_err(|e| Error::PermissionDenied(format!("Cannot read {}: {}", path.display(), e)))?;

    Ok(metadata.len())
}
