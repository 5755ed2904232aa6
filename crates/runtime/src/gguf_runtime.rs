use crate::accel::AccelerationProbe;
use crate::native::{NativeEngine, SessionHandle, StepOutput};
use crate::{check_artifact, ConversationalRuntime, FrameStream, Runtime};
use async_trait::async_trait;
use halo_common::{
    Error, GenerationParams, LoadOptions, ModelDescriptor, ModelFormat, ModelMetadata,
    PerformanceMetrics, PerformanceTracker, Result, Role, StopReason, StreamFrame, Usage,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct Loaded {
    handle: SessionHandle,
    /// Reserved while the engine loads; promoted to `handle` once ready
    loading: SessionHandle,
    path: Option<PathBuf>,
}

/// Engine telemetry sampled on blocking threads after each engine call,
/// so the sync getters never wait on a running step
#[derive(Debug, Clone, Copy, Default)]
struct LiveStats {
    speed: f32,
    context_used: usize,
}

/// Freed handles leave the cache alone; `release` resets it.
fn refresh_live(engine: &NativeEngine, handle: SessionHandle, live: &Mutex<LiveStats>) {
    if let (Ok(speed), Ok(context_used)) = (
        engine.generation_speed(handle),
        engine.context_tokens_used(handle),
    ) {
        *lock(live) = LiveStats {
            speed,
            context_used,
        };
    }
}

/// Runtime for native-quantized (GGUF) models, driving the engine's pull loop
pub struct GgufRuntime {
    engine: Arc<NativeEngine>,
    acceleration: Arc<dyn AccelerationProbe>,
    loaded: Mutex<Loaded>,
    /// Stop flag of the most recent generation
    stop: Mutex<Arc<AtomicBool>>,
    tracker: Arc<Mutex<PerformanceTracker>>,
    live: Arc<Mutex<LiveStats>>,
}

impl GgufRuntime {
    pub fn new(engine: Arc<NativeEngine>, acceleration: Arc<dyn AccelerationProbe>) -> Self {
        Self {
            engine,
            acceleration,
            loaded: Mutex::new(Loaded::default()),
            stop: Mutex::new(Arc::new(AtomicBool::new(false))),
            tracker: Arc::new(Mutex::new(PerformanceTracker::new())),
            live: Arc::new(Mutex::new(LiveStats::default())),
        }
    }

    /// Handle of the loaded session, null when unloaded
    pub fn handle(&self) -> SessionHandle {
        lock(&self.loaded).handle
    }

    pub fn model_path(&self) -> Option<PathBuf> {
        lock(&self.loaded).path.clone()
    }

    fn loaded_handle(&self) -> Result<SessionHandle> {
        let handle = self.handle();
        if handle.is_null() {
            Err(Error::RuntimeNotReady)
        } else {
            Ok(handle)
        }
    }

    /// Run an engine call against the loaded session off the async executor
    async fn with_session<F>(&self, call: F) -> Result<()>
    where
        F: FnOnce(&NativeEngine, SessionHandle) -> Result<()> + Send + 'static,
    {
        let handle = self.loaded_handle()?;
        let engine = self.engine.clone();
        let live = self.live.clone();
        tokio::task::spawn_blocking(move || {
            let result = call(&engine, handle);
            refresh_live(&engine, handle, &live);
            result
        })
        .await
        .map_err(|e| Error::Internal(format!("Engine task failed: {}", e)))?
    }
}

#[async_trait]
impl Runtime for GgufRuntime {
    async fn initialize_model(&self, descriptor: &ModelDescriptor, options: LoadOptions) -> Result<()> {
        // A failed load must not leave the previous model behind
        self.release().await;

        if descriptor.format != ModelFormat::NativeQuantized {
            return Err(Error::InvalidArgument(format!(
                "{} is {}, expected {}",
                descriptor.name,
                descriptor.format,
                ModelFormat::NativeQuantized
            )));
        }
        let size_bytes = check_artifact(&descriptor.path).await?;

        info!(
            model = %descriptor.name,
            path = %descriptor.path.display(),
            threads = options.threads,
            context_length = options.context_length,
            "Loading native-quantized model"
        );

        let handle = self.engine.reserve_session();
        lock(&self.loaded).loading = handle;

        let engine = self.engine.clone();
        let live = self.live.clone();
        let path = descriptor.path.clone();
        let loaded = tokio::task::spawn_blocking(move || {
            engine.load_session(handle, &path, options.threads, options.context_length)?;
            refresh_live(&engine, handle, &live);
            Ok(())
        })
        .await
        .map_err(|e| Error::Internal(format!("Model load task failed: {}", e)))
        .and_then(|result| result);

        {
            let mut loaded_state = lock(&self.loaded);
            if loaded_state.loading != handle {
                // Released while loading; release already freed the handle
                return Err(loaded.err().unwrap_or(Error::Cancelled));
            }
            loaded_state.loading = SessionHandle::NULL;
            if let Err(e) = loaded {
                drop(loaded_state);
                self.engine.free_session(handle);
                return Err(e);
            }
            loaded_state.handle = handle;
            loaded_state.path = Some(descriptor.path.clone());
        }
        lock(&self.tracker).set_model_footprint(
            size_bytes,
            Some(self.acceleration.best_acceleration_type().label().to_string()),
        );

        info!(handle = %handle, "Model ready");
        Ok(())
    }

    async fn generate_response(&self, prompt: &str, params: GenerationParams) -> Result<FrameStream> {
        params.validate()?;
        let handle = self.loaded_handle()?;

        let stop = Arc::new(AtomicBool::new(false));
        *lock(&self.stop) = stop.clone();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let engine = self.engine.clone();
        let tracker = self.tracker.clone();
        let live = self.live.clone();
        let prompt = prompt.to_string();

        tokio::task::spawn_blocking(move || {
            let last = run_completion(&engine, handle, &prompt, params, &stop, &tracker, &tx);
            // Observers read the live stats as soon as the last frame arrives
            refresh_live(&engine, handle, &live);
            let _ = tx.send(last);
        });

        let stream = async_stream::stream! {
            while let Some(frame) = rx.recv().await {
                yield frame;
            }
        };

        Ok(Box::pin(stream))
    }

    fn stop_generation(&self) {
        lock(&self.stop).store(true, Ordering::Release);
    }

    async fn release(&self) {
        self.stop_generation();

        let (handle, loading) = {
            let mut loaded = lock(&self.loaded);
            loaded.path = None;
            (
                std::mem::take(&mut loaded.handle),
                std::mem::take(&mut loaded.loading),
            )
        };
        lock(&self.tracker).reset();
        *lock(&self.live) = LiveStats::default();

        for handle in [handle, loading] {
            if handle.is_null() {
                continue;
            }
            let engine = self.engine.clone();
            match tokio::task::spawn_blocking(move || engine.free_session(handle)).await {
                Ok(true) => info!(handle = %handle, "Released native session"),
                Ok(false) => debug!(handle = %handle, "Session was already gone"),
                Err(e) => warn!(handle = %handle, "Session teardown failed: {}", e),
            }
        }
    }

    fn performance_metrics(&self) -> PerformanceMetrics {
        lock(&self.tracker).snapshot()
    }

    fn is_ready(&self) -> bool {
        !self.handle().is_null()
    }

    fn name(&self) -> &'static str {
        "gguf"
    }

    fn as_conversational(&self) -> Option<&dyn ConversationalRuntime> {
        Some(self)
    }
}

#[async_trait]
impl ConversationalRuntime for GgufRuntime {
    async fn add_conversation_message(&self, role: Role, content: &str) -> Result<()> {
        let content = content.to_string();
        self.with_session(move |engine, handle| engine.append_message(handle, role, &content))
            .await
    }

    async fn clear_conversation(&self) -> Result<()> {
        self.with_session(|engine, handle| engine.clear_conversation(handle))
            .await
    }

    async fn read_metadata(&self, path: &Path) -> ModelMetadata {
        let engine = self.engine.clone();
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || engine.probe_metadata(&path))
            .await
            .unwrap_or_default()
    }

    fn generation_speed(&self) -> f32 {
        lock(&self.live).speed
    }

    fn context_usage(&self) -> usize {
        lock(&self.live).context_used
    }
}

enum LoopEnd {
    Natural,
    Cap,
    Cancelled,
    Failed(String),
}

/// Drive one completion on a blocking thread, handing fragments to the
/// consumer. Returns the terminal frame.
fn run_completion(
    engine: &NativeEngine,
    handle: SessionHandle,
    prompt: &str,
    params: GenerationParams,
    stop: &AtomicBool,
    tracker: &Mutex<PerformanceTracker>,
    tx: &mpsc::UnboundedSender<Result<StreamFrame>>,
) -> Result<StreamFrame> {
    let started = Instant::now();
    if let Err(e) = engine.begin_completion(handle, prompt, params.temperature) {
        warn!(handle = %handle, "Completion failed to start: {}", e);
        return Err(e);
    }

    let mut tokens = 0;
    let end = {
        // The engine must leave the generating state whichever way the loop exits
        let _finish = scopeguard::guard((), |_| engine.end_completion(handle));
        loop {
            if stop.load(Ordering::Acquire) || tx.is_closed() {
                break LoopEnd::Cancelled;
            }
            if tokens >= params.max_tokens {
                break LoopEnd::Cap;
            }
            match engine.step(handle) {
                StepOutput::Fragment(text) => {
                    tokens += 1;
                    if !text.is_empty() && tx.send(Ok(StreamFrame::Delta { content: text })).is_err() {
                        break LoopEnd::Cancelled;
                    }
                }
                StepOutput::EndOfGeneration => break LoopEnd::Natural,
                // A release racing the step frees the session under us
                StepOutput::Error(_) if stop.load(Ordering::Acquire) => break LoopEnd::Cancelled,
                StepOutput::Error(message) => break LoopEnd::Failed(message),
            }
        }
    };

    let elapsed = started.elapsed();
    let finish_reason = match end {
        LoopEnd::Failed(message) => {
            warn!(handle = %handle, tokens, "Generation failed: {}", message);
            return Err(Error::Generation(message));
        }
        LoopEnd::Cancelled => {
            info!(handle = %handle, tokens, "Generation cancelled");
            StopReason::Cancelled
        }
        LoopEnd::Natural => StopReason::classify(tokens, params.max_tokens, true),
        LoopEnd::Cap => StopReason::classify(tokens, params.max_tokens, false),
    };

    if finish_reason != StopReason::Cancelled {
        lock(tracker).record_generation(tokens, elapsed);
        info!(
            handle = %handle,
            tokens,
            elapsed_ms = elapsed.as_millis() as u64,
            reason = finish_reason.as_str(),
            "Generation finished"
        );
    }

    // Rough estimate
    let prompt_tokens = prompt.len() / 4;
    Ok(StreamFrame::Done {
        finish_reason,
        usage: Usage::new(prompt_tokens, tokens),
    })
}
