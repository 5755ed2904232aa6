//! llama.cpp binding.
//!
//! `LlamaContext` borrows its model and is not `Send`, so every session owns a
//! worker thread that keeps both on its stack and serves commands over a channel.

use super::{NativeBackend, NativeSession, SessionParams, StepOutput};
use halo_common::Role;
use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaChatMessage, LlamaChatTemplate, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::LlamaToken;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::OnceLock;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Tokens kept free for the reply when starting a completion
const REPLY_RESERVE: usize = 512;
const FALLBACK_TEMPLATE: &str = "chatml";

static BACKEND: OnceLock<Option<LlamaBackend>> = OnceLock::new();

fn backend() -> Option<&'static LlamaBackend> {
    BACKEND
        .get_or_init(|| match LlamaBackend::init() {
            Ok(backend) => Some(backend),
            Err(e) => {
                tracing::error!("Failed to initialise llama.cpp backend: {}", e);
                None
            }
        })
        .as_ref()
}

pub(super) fn init_backend() -> bool {
    backend().is_some()
}

pub struct LlamaCppBackend;

impl NativeBackend for LlamaCppBackend {
    fn name(&self) -> &'static str {
        "llama.cpp"
    }

    fn load(&self, path: &Path, params: &SessionParams) -> Option<Box<dyn NativeSession>> {
        let backend = backend()?;
        let (ready_tx, ready_rx) = mpsc::channel();
        let (command_tx, command_rx) = mpsc::channel();
        let path = path.to_path_buf();
        let params = *params;

        let worker = thread::Builder::new()
            .name("llama-session".into())
            .spawn(move || worker_main(backend, path, params, ready_tx, command_rx))
            .map_err(|e| tracing::error!("Failed to spawn session worker: {}", e))
            .ok()?;

        match ready_rx.recv() {
            Ok(Ok(())) => Some(Box::new(LlamaSession {
                commands: Some(command_tx),
                worker: Some(worker),
            })),
            Ok(Err(message)) => {
                tracing::error!("{}", message);
                let _ = worker.join();
                None
            }
            Err(_) => {
                let _ = worker.join();
                None
            }
        }
    }
}

enum Command {
    Append { role: Role, content: String },
    Clear,
    Begin {
        prompt: String,
        temperature: f32,
        reply: Sender<bool>,
    },
    Step { reply: Sender<StepOutput> },
    End,
    Stats { reply: Sender<(f32, usize)> },
}

/// Front half of a session; the model lives on the worker thread
struct LlamaSession {
    commands: Option<Sender<Command>>,
    worker: Option<JoinHandle<()>>,
}

impl LlamaSession {
    fn send(&self, command: Command) -> bool {
        self.commands
            .as_ref()
            .is_some_and(|tx| tx.send(command).is_ok())
    }

    fn request<T>(&self, build: impl FnOnce(Sender<T>) -> Command) -> Option<T> {
        let (tx, rx) = mpsc::channel();
        if !self.send(build(tx)) {
            return None;
        }
        rx.recv().ok()
    }
}

impl NativeSession for LlamaSession {
    fn append_message(&mut self, role: Role, content: &str) {
        self.send(Command::Append {
            role,
            content: content.to_string(),
        });
    }

    fn clear_conversation(&mut self) {
        self.send(Command::Clear);
    }

    fn begin_completion(&mut self, prompt: &str, temperature: f32) -> bool {
        self.request(|reply| Command::Begin {
            prompt: prompt.to_string(),
            temperature,
            reply,
        })
        .unwrap_or(false)
    }

    fn step(&mut self) -> StepOutput {
        self.request(|reply| Command::Step { reply })
            .unwrap_or_else(|| StepOutput::Error("session worker stopped".into()))
    }

    fn end_completion(&mut self) {
        self.send(Command::End);
    }

    fn generation_speed(&self) -> f32 {
        self.request(|reply| Command::Stats { reply })
            .map_or(0.0, |(speed, _)| speed)
    }

    fn context_tokens_used(&self) -> usize {
        self.request(|reply| Command::Stats { reply })
            .map_or(0, |(_, used)| used)
    }
}

impl Drop for LlamaSession {
    fn drop(&mut self) {
        // Closing the channel ends the worker loop
        self.commands.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn worker_main(
    backend: &'static LlamaBackend,
    path: PathBuf,
    params: SessionParams,
    ready: Sender<Result<(), String>>,
    commands: Receiver<Command>,
) {
    let model = match LlamaModel::load_from_file(backend, &path, &LlamaModelParams::default()) {
        Ok(model) => model,
        Err(e) => {
            let _ = ready.send(Err(format!("Failed to load {}: {}", path.display(), e)));
            return;
        }
    };

    let n_ctx = params.context_length.max(1) as u32;
    let threads = params.threads.max(1) as i32;
    let ctx_params = LlamaContextParams::default()
        .with_n_ctx(NonZeroU32::new(n_ctx))
        .with_n_batch(n_ctx)
        .with_n_threads(threads)
        .with_n_threads_batch(threads);

    let ctx = match model.new_context(backend, ctx_params) {
        Ok(ctx) => ctx,
        Err(e) => {
            let _ = ready.send(Err(format!("Failed to create context: {}", e)));
            return;
        }
    };

    let template = match model.chat_template(None) {
        Ok(template) => template,
        Err(_) => match LlamaChatTemplate::new(FALLBACK_TEMPLATE) {
            Ok(template) => {
                tracing::warn!("No chat template in model, using {}", FALLBACK_TEMPLATE);
                template
            }
            Err(e) => {
                let _ = ready.send(Err(format!("No usable chat template: {}", e)));
                return;
            }
        },
    };

    if ready.send(Ok(())).is_err() {
        return;
    }

    let mut worker = Worker::new(&model, ctx, template, n_ctx as usize);
    while let Ok(command) = commands.recv() {
        match command {
            Command::Append { role, content } => worker.messages.push((role, content)),
            Command::Clear => worker.clear(),
            Command::Begin {
                prompt,
                temperature,
                reply,
            } => {
                let started = worker.begin(&prompt, temperature).unwrap_or_else(|e| {
                    tracing::warn!("Completion not started: {}", e);
                    false
                });
                let _ = reply.send(started);
            }
            Command::Step { reply } => {
                let output = worker.step().unwrap_or_else(StepOutput::Error);
                let _ = reply.send(output);
            }
            Command::End => worker.end(),
            Command::Stats { reply } => {
                let _ = reply.send((worker.speed(), worker.n_past));
            }
        }
    }
    tracing::debug!("Session worker for {} exiting", path.display());
}

struct Worker<'m> {
    model: &'m LlamaModel,
    ctx: LlamaContext<'m>,
    template: LlamaChatTemplate,
    n_ctx: usize,
    messages: Vec<(Role, String)>,
    /// Bytes of the formatted conversation already evaluated
    prev_len: usize,
    n_past: usize,
    batch: LlamaBatch,
    sampler: Option<LlamaSampler>,
    response: String,
    reply_stored: bool,
    utf8: Vec<u8>,
    generated: usize,
    generation_time: Duration,
}

impl<'m> Worker<'m> {
    fn new(model: &'m LlamaModel, ctx: LlamaContext<'m>, template: LlamaChatTemplate, n_ctx: usize) -> Self {
        Self {
            model,
            ctx,
            template,
            n_ctx,
            messages: Vec::new(),
            prev_len: 0,
            n_past: 0,
            batch: LlamaBatch::new(n_ctx, 1),
            sampler: None,
            response: String::new(),
            reply_stored: false,
            utf8: Vec::new(),
            generated: 0,
            generation_time: Duration::ZERO,
        }
    }

    fn format(&self, add_assistant: bool) -> Result<String, String> {
        let chat = self
            .messages
            .iter()
            .map(|(role, content)| LlamaChatMessage::new(role.as_str().to_string(), content.clone()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| format!("Invalid chat message: {}", e))?;
        self.model
            .apply_chat_template(&self.template, &chat, add_assistant)
            .map_err(|e| format!("Failed to apply chat template: {}", e))
    }

    fn clear(&mut self) {
        self.messages.clear();
        self.prev_len = 0;
        self.n_past = 0;
        self.ctx.clear_kv_cache();
    }

    fn begin(&mut self, prompt: &str, temperature: f32) -> Result<bool, String> {
        self.response.clear();
        self.reply_stored = false;
        self.utf8.clear();
        self.generated = 0;
        self.generation_time = Duration::ZERO;

        self.messages.push((Role::User, prompt.to_string()));
        let formatted = self.format(true)?;

        // The evaluated prefix no longer matches; start the context over
        if self.prev_len > formatted.len() || !formatted.is_char_boundary(self.prev_len) {
            self.prev_len = 0;
            self.n_past = 0;
            self.ctx.clear_kv_cache();
        }

        let add_bos = if self.n_past == 0 { AddBos::Always } else { AddBos::Never };
        let tokens = self
            .model
            .str_to_token(&formatted[self.prev_len..], add_bos)
            .map_err(|e| format!("Failed to tokenize: {}", e))?;

        if tokens.is_empty() || self.n_past + tokens.len() + REPLY_RESERVE > self.n_ctx {
            tracing::warn!(
                used = self.n_past,
                prompt_tokens = tokens.len(),
                n_ctx = self.n_ctx,
                "Context overflow"
            );
            self.messages.pop();
            return Ok(false);
        }

        self.batch.clear();
        let last = tokens.len() - 1;
        for (i, token) in tokens.iter().enumerate() {
            self.batch
                .add(*token, (self.n_past + i) as i32, &[0], i == last)
                .map_err(|e| format!("Failed to batch prompt: {}", e))?;
        }
        self.ctx
            .decode(&mut self.batch)
            .map_err(|e| format!("Failed to decode prompt: {}", e))?;
        self.n_past += tokens.len();

        self.sampler = Some(if temperature <= f32::EPSILON {
            LlamaSampler::greedy()
        } else {
            LlamaSampler::chain_simple([
                LlamaSampler::top_k(40),
                LlamaSampler::top_p(0.95, 1),
                LlamaSampler::temp(temperature),
                LlamaSampler::dist(seed()),
            ])
        });
        Ok(true)
    }

    fn step(&mut self) -> Result<StepOutput, String> {
        let started = Instant::now();
        let sampler = self
            .sampler
            .as_mut()
            .ok_or_else(|| "no completion in progress".to_string())?;

        let token: LlamaToken = sampler.sample(&self.ctx, self.batch.n_tokens() - 1);
        sampler.accept(token);

        if self.model.is_eog_token(token) {
            self.store_reply();
            return Ok(StepOutput::EndOfGeneration);
        }

        let bytes = self
            .model
            .token_to_bytes(token, Special::Tokenize)
            .map_err(|e| format!("Failed to detokenize: {}", e))?;
        self.utf8.extend_from_slice(&bytes);
        let fragment = self.take_utf8();
        self.response.push_str(&fragment);

        self.batch.clear();
        self.batch
            .add(token, self.n_past as i32, &[0], true)
            .map_err(|e| format!("Failed to batch token: {}", e))?;
        self.ctx
            .decode(&mut self.batch)
            .map_err(|e| format!("Decode failed: {}", e))?;
        self.n_past += 1;

        self.generated += 1;
        self.generation_time += started.elapsed();
        Ok(StepOutput::Fragment(fragment))
    }

    /// Longest valid UTF-8 prefix of the pending bytes
    fn take_utf8(&mut self) -> String {
        let valid = match std::str::from_utf8(&self.utf8) {
            Ok(_) => self.utf8.len(),
            Err(e) => e.valid_up_to(),
        };
        let text = String::from_utf8_lossy(&self.utf8[..valid]).into_owned();
        self.utf8.drain(..valid);
        text
    }

    fn store_reply(&mut self) {
        if !self.reply_stored && !self.response.is_empty() {
            self.messages
                .push((Role::Assistant, std::mem::take(&mut self.response)));
        }
        self.reply_stored = true;
    }

    fn end(&mut self) {
        self.store_reply();
        self.sampler = None;
        match self.format(false) {
            Ok(formatted) => self.prev_len = formatted.len(),
            Err(e) => {
                tracing::warn!("{}", e);
                self.prev_len = 0;
                self.n_past = 0;
                self.ctx.clear_kv_cache();
            }
        }
        tracing::debug!(
            tokens = self.generated,
            context_used = self.n_past,
            "Completion finished"
        );
    }

    fn speed(&self) -> f32 {
        let secs = self.generation_time.as_secs_f32();
        if self.generated == 0 || secs <= 0.0 {
            0.0
        } else {
            self.generated as f32 / secs
        }
    }
}

fn seed() -> u32 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    RandomState::new().build_hasher().finish() as u32
}
