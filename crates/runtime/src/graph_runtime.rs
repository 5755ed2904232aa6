use crate::accel::{AccelerationProbe, AccelerationType};
use crate::template_engine::TemplateEngine;
use crate::tokenizer::{TokenId, Tokenizer};
use crate::{check_artifact, FrameStream, Runtime};
use async_trait::async_trait;
use halo_common::{
    Error, GenerationParams, LoadOptions, Message, ModelDescriptor, ModelFormat,
    PerformanceMetrics, PerformanceTracker, Result, Role, StopReason, StreamFrame, Usage,
};
use halo_config::{TemplateConfig, TemplateRegistry};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const VOCAB_FILE: &str = "vocab.json";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Executes a tensor-graph model
pub trait GraphBackend: Send + Sync {
    fn open(&self, path: &Path, acceleration: AccelerationType) -> Result<Box<dyn GraphSession>>;
}

/// One opened tensor graph
pub trait GraphSession: Send {
    /// Run a forward pass and return the logits of the final position
    fn forward(&mut self, input_ids: &[TokenId]) -> Result<Vec<f32>>;

    /// Chat template embedded in the model, if any
    fn chat_template(&self) -> Option<String> {
        None
    }
}

struct GraphModel {
    session: Mutex<Box<dyn GraphSession>>,
    tokenizer: Tokenizer,
    template: TemplateConfig,
}

/// Runtime for tensor-graph models with greedy decoding.
///
/// There is no sampling: temperature is ignored and every step takes the arg-max
/// token. A forward pass cannot be interrupted, so `stop_generation` takes effect
/// between passes.
pub struct GraphRuntime {
    backend: Arc<dyn GraphBackend>,
    acceleration: Arc<dyn AccelerationProbe>,
    templates: TemplateRegistry,
    model: Mutex<Option<Arc<GraphModel>>>,
    stop: Mutex<Arc<AtomicBool>>,
    tracker: Arc<Mutex<PerformanceTracker>>,
}

impl GraphRuntime {
    pub fn new(
        backend: Arc<dyn GraphBackend>,
        acceleration: Arc<dyn AccelerationProbe>,
        templates: TemplateRegistry,
    ) -> Self {
        Self {
            backend,
            acceleration,
            templates,
            model: Mutex::new(None),
            stop: Mutex::new(Arc::new(AtomicBool::new(false))),
            tracker: Arc::new(Mutex::new(PerformanceTracker::new())),
        }
    }

    /// Id of the prompt template in use
    pub fn template_id(&self) -> Option<String> {
        lock(&self.model).as_ref().map(|m| m.template.id.clone())
    }
}

#[async_trait]
impl Runtime for GraphRuntime {
    async fn initialize_model(&self, descriptor: &ModelDescriptor, _options: LoadOptions) -> Result<()> {
        // A failed load must not leave the previous model behind
        self.release().await;

        if descriptor.format != ModelFormat::TensorGraph {
            return Err(Error::InvalidArgument(format!(
                "{} is {}, expected {}",
                descriptor.name,
                descriptor.format,
                ModelFormat::TensorGraph
            )));
        }
        let size_bytes = check_artifact(&descriptor.path).await?;

        let acceleration = self.acceleration.best_acceleration_type();
        info!(
            model = %descriptor.name,
            path = %descriptor.path.display(),
            accelerator = acceleration.label(),
            "Loading tensor-graph model"
        );

        let backend = self.backend.clone();
        let path = descriptor.path.clone();
        let (session, tokenizer) = tokio::task::spawn_blocking(move || -> Result<_> {
            let tokenizer = Tokenizer::from_file(&path.with_file_name(VOCAB_FILE))?;
            let session = backend.open(&path, acceleration)?;
            Ok((session, tokenizer))
        })
        .await
        .map_err(|e| Error::Internal(format!("Model load task failed: {}", e)))??;

        if tokenizer.eos_token_id().is_none() {
            warn!("Vocabulary has no end-of-sequence token, replies run to max_tokens");
        }

        let embedded = session.chat_template();
        let template = self.templates.resolve(embedded.as_deref()).clone();
        debug!(template = %template.id, "Selected prompt template");

        *lock(&self.model) = Some(Arc::new(GraphModel {
            session: Mutex::new(session),
            tokenizer,
            template,
        }));
        lock(&self.tracker).set_model_footprint(size_bytes, Some(acceleration.label().to_string()));

        Ok(())
    }

    async fn generate_response(&self, prompt: &str, params: GenerationParams) -> Result<FrameStream> {
        params.validate()?;
        let model = lock(&self.model).clone().ok_or(Error::RuntimeNotReady)?;

        let stop = Arc::new(AtomicBool::new(false));
        *lock(&self.stop) = stop.clone();

        let formatted = TemplateEngine::format_prompt(&[Message::new(Role::User, prompt)], &model.template);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let tracker = self.tracker.clone();

        tokio::task::spawn_blocking(move || {
            run_greedy(&model, &formatted, params.max_tokens, &stop, &tracker, &tx)
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
        let previous = lock(&self.model).take();
        lock(&self.tracker).reset();
        if previous.is_some() {
            info!("Released tensor-graph model");
        }
    }

    fn performance_metrics(&self) -> PerformanceMetrics {
        lock(&self.tracker).snapshot()
    }

    fn is_ready(&self) -> bool {
        lock(&self.model).is_some()
    }

    fn name(&self) -> &'static str {
        "tensor_graph"
    }
}

fn argmax(logits: &[f32]) -> Option<TokenId> {
    logits
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, _)| i as TokenId)
}

fn run_greedy(
    model: &GraphModel,
    prompt: &str,
    max_tokens: usize,
    stop: &AtomicBool,
    tracker: &Mutex<PerformanceTracker>,
    tx: &mpsc::UnboundedSender<Result<StreamFrame>>,
) {
    let started = Instant::now();
    let mut input_ids = model.tokenizer.encode(prompt);
    let prompt_tokens = input_ids.len();
    let eos = model.tokenizer.eos_token_id();
    let mut session = lock(&model.session);

    let mut emitted = 0;
    let mut natural_end = false;
    let mut cancelled = false;

    while emitted < max_tokens {
        if stop.load(Ordering::Acquire) || tx.is_closed() {
            cancelled = true;
            break;
        }

        let next = match session.forward(&input_ids).and_then(|logits| {
            argmax(&logits).ok_or_else(|| Error::Generation("Model produced no logits".into()))
        }) {
            Ok(id) => id,
            Err(e) => {
                warn!("Forward pass failed: {}", e);
                let message = match e {
                    Error::Generation(message) => message,
                    other => other.to_string(),
                };
                let _ = tx.send(Err(Error::Generation(message)));
                return;
            }
        };

        if Some(next) == eos {
            natural_end = true;
            break;
        }

        input_ids.push(next);
        emitted += 1;

        let fragment = TemplateEngine::remove_template_markers(
            &model.tokenizer.decode(&[next]),
            &model.template,
        );
        if !fragment.is_empty() && tx.send(Ok(StreamFrame::Delta { content: fragment })).is_err() {
            cancelled = true;
            break;
        }
    }

    let finish_reason = if cancelled {
        StopReason::Cancelled
    } else {
        let elapsed = started.elapsed();
        lock(tracker).record_generation(emitted, elapsed);
        debug!(
            tokens = emitted,
            elapsed_ms = elapsed.as_millis() as u64,
            "Greedy decode finished"
        );
        StopReason::classify(emitted, max_tokens, natural_end)
    };

    let _ = tx.send(Ok(StreamFrame::Done {
        finish_reason,
        usage: Usage::new(prompt_tokens, emitted),
    }));
}
