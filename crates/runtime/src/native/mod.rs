//! Bridge to the native inference engine.
//!
//! Sessions live in an arena owned by [`NativeEngine`] and are addressed by opaque
//! [`SessionHandle`]s. Callers never hold the session itself, so a released handle
//! simply stops resolving instead of dangling.

mod engine;
pub(crate) mod gguf;
#[cfg(feature = "llama")]
mod llama;

pub use engine::{NativeEngine, SessionState};
pub use gguf::read_metadata;

use halo_common::{ModelMetadata, Role};
use std::path::Path;
use std::sync::{Arc, OnceLock};

/// Opaque identifier of a loaded native session; zero means "not loaded"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SessionHandle(u64);

impl SessionHandle {
    pub const NULL: SessionHandle = SessionHandle(0);

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session#{}", self.0)
    }
}

/// Load-time parameters of a native session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionParams {
    pub threads: usize,
    pub context_length: usize,
}

/// Result of one pull of the completion loop
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutput {
    /// Freshly generated text; may be empty while a multi-byte character is incomplete
    Fragment(String),
    EndOfGeneration,
    Error(String),
}

/// One loaded model context inside the engine.
///
/// Calls are strictly sequenced by [`NativeEngine`]: `begin_completion`, then any
/// number of `step`, then `end_completion`.
pub trait NativeSession: Send {
    /// Append a turn to the rolling conversation without generating
    fn append_message(&mut self, role: Role, content: &str);

    /// Drop the rolling conversation and any evaluated context
    fn clear_conversation(&mut self);

    /// Start generating a reply to `prompt` against the current conversation.
    /// Returns false when the engine refuses, e.g. on context overflow.
    fn begin_completion(&mut self, prompt: &str, temperature: f32) -> bool;

    fn step(&mut self) -> StepOutput;

    /// Finalize the completion, keeping whatever reply was produced
    fn end_completion(&mut self);

    /// Tokens per second of the current or last completion
    fn generation_speed(&self) -> f32;

    fn context_tokens_used(&self) -> usize;
}

/// Factory for native sessions
pub trait NativeBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Read artifact metadata without loading weights
    fn probe_metadata(&self, path: &Path) -> ModelMetadata {
        read_metadata(path)
    }

    /// Load a model; `None` is a load failure
    fn load(&self, path: &Path, params: &SessionParams) -> Option<Box<dyn NativeSession>>;
}

/// Outcome of process-wide engine initialisation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeEngineAvailable(pub bool);

impl NativeEngineAvailable {
    pub fn is_available(&self) -> bool {
        self.0
    }
}

static ENGINE_INIT: OnceLock<NativeEngineAvailable> = OnceLock::new();

/// Initialise the native library once for the whole process
pub fn initialize() -> NativeEngineAvailable {
    *ENGINE_INIT.get_or_init(|| {
        let available = init_library();
        if available {
            tracing::info!("Native inference engine initialised");
        } else {
            tracing::warn!("Native inference engine unavailable, native-quantized models disabled");
        }
        NativeEngineAvailable(available)
    })
}

#[cfg(feature = "llama")]
fn init_library() -> bool {
    llama::init_backend()
}

#[cfg(not(feature = "llama"))]
fn init_library() -> bool {
    false
}

/// The compiled-in native backend, when the engine initialised
pub fn default_backend() -> Option<Arc<dyn NativeBackend>> {
    if !initialize().is_available() {
        return None;
    }
    #[cfg(feature = "llama")]
    {
        Some(Arc::new(llama::LlamaCppBackend))
    }
    #[cfg(not(feature = "llama"))]
    {
        None
    }
}
