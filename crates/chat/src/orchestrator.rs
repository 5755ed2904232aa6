use futures::StreamExt;
use halo_common::{
    now_millis, ChatSession, ConversationTurn, Error, GenerationId, GenerationParams,
    GenerationTelemetry, Message, ModelDescriptor, Result, Role,
    StopReason, StreamFrame, TurnStats,
};
use halo_config::{ChatConfig, GenerationSettings, SettingsGate};
use halo_runtime::{ModelManager, Runtime, TemplateEngine};
use halo_store::{ChatStore, ModelStore};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const DEFAULT_SESSION_TITLE: &str = "New Chat";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Title a session from its first message
pub fn session_title(first_message: &str, max_chars: usize) -> String {
    let head: String = first_message.chars().take(max_chars).collect();
    let head = head.trim();
    if head.is_empty() {
        DEFAULT_SESSION_TITLE.to_string()
    } else if first_message.chars().count() > max_chars {
        format!("{}...", head)
    } else {
        head.to_string()
    }
}

/// Engine-side conversation contents, when they mirror a stored session
#[derive(Debug, Clone, PartialEq)]
struct SyncedConversation {
    session_id: String,
    system_prompt: String,
}

struct Job {
    cancel: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

struct GenerationRequest {
    session_id: String,
    model: ModelDescriptor,
    text: String,
    history: Vec<Message>,
    settings: GenerationSettings,
}

enum Outcome {
    Finished {
        text: String,
        stop_reason: StopReason,
        tokens: usize,
        runtime: Arc<dyn Runtime>,
    },
    Cancelled {
        tokens: usize,
    },
    Failed(Error),
}

struct Inner {
    manager: Arc<ModelManager>,
    chats: Arc<dyn ChatStore>,
    models: Arc<dyn ModelStore>,
    chat_config: ChatConfig,
    settings: Mutex<SettingsGate>,
    telemetry: Arc<GenerationTelemetry>,
    current_session: Mutex<String>,
    selected_model: Mutex<Option<ModelDescriptor>>,
    loaded_model: Mutex<Option<String>>,
    synced: Mutex<Option<SyncedConversation>>,
    job: Mutex<Option<Job>>,
    /// Serializes cancel-then-start
    send_lock: tokio::sync::Mutex<()>,
    streamed: watch::Sender<String>,
    generating: watch::Sender<bool>,
}

/// Drives chat turns: persists user input, runs generations through the
/// [`ModelManager`] and stores the replies.
///
/// At most one generation runs at a time. Starting a new one cancels the previous
/// one first, and a cancelled generation is never persisted.
#[derive(Clone)]
pub struct ChatOrchestrator {
    inner: Arc<Inner>,
}

impl ChatOrchestrator {
    pub fn new(
        manager: Arc<ModelManager>,
        chats: Arc<dyn ChatStore>,
        models: Arc<dyn ModelStore>,
        settings: GenerationSettings,
        chat_config: ChatConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                manager,
                chats,
                models,
                chat_config,
                settings: Mutex::new(SettingsGate::new(settings)),
                telemetry: Arc::new(GenerationTelemetry::new()),
                current_session: Mutex::new(ChatSession::generate_id()),
                selected_model: Mutex::new(None),
                loaded_model: Mutex::new(None),
                synced: Mutex::new(None),
                job: Mutex::new(None),
                send_lock: tokio::sync::Mutex::new(()),
                streamed: watch::Sender::new(String::new()),
                generating: watch::Sender::new(false),
            }),
        }
    }

    pub fn telemetry(&self) -> Arc<GenerationTelemetry> {
        self.inner.telemetry.clone()
    }

    /// Text of the reply being generated, empty when idle
    pub fn streamed_response(&self) -> watch::Receiver<String> {
        self.inner.streamed.subscribe()
    }

    pub fn is_generating(&self) -> bool {
        *self.inner.generating.borrow()
    }

    pub fn current_session(&self) -> String {
        lock(&self.inner.current_session).clone()
    }

    pub fn selected_model(&self) -> Option<ModelDescriptor> {
        lock(&self.inner.selected_model).clone()
    }

    /// Turns of the current session
    pub async fn messages(&self) -> Result<Vec<ConversationTurn>> {
        self.inner.chats.messages(&self.current_session()).await
    }

    /// Send `text` in the current session with the selected model
    pub async fn send(&self, text: &str) -> Result<bool> {
        let model = self
            .selected_model()
            .ok_or_else(|| Error::InvalidArgument("No model selected".into()))?;
        let session_id = self.current_session();
        self.send_message(&session_id, &model, text).await
    }

    /// Persist the user turn and start generating the reply.
    ///
    /// Returns false when the input is blank. A running generation is cancelled
    /// first.
    pub async fn send_message(&self, session_id: &str, model: &ModelDescriptor, text: &str) -> Result<bool> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(false);
        }
        if !model.is_ready() {
            return Err(Error::InvalidArgument(format!(
                "Model {} is not ready",
                model.name
            )));
        }

        let _serial = self.inner.send_lock.lock().await;
        // A reply still streaming for the previous turn is dropped, not stored after this one
        self.cancel_job().await;

        let chats = &self.inner.chats;
        let prior = chats.messages(session_id).await?;
        chats
            .insert_message(ConversationTurn::user(session_id, text))
            .await?;

        if prior.is_empty() {
            let title = session_title(text, self.inner.chat_config.title_max_chars);
            let session = match chats.get_session(session_id).await? {
                Some(mut existing) => {
                    existing.title = title;
                    existing.updated_at = now_millis();
                    existing
                }
                None => ChatSession::new(session_id, title),
            };
            chats.insert_session(session).await?;
        } else {
            chats.touch_session(session_id, now_millis()).await?;
        }

        let window = self.inner.chat_config.history_window;
        let history: Vec<Message> = prior
            .iter()
            .filter(|turn| turn.stop_reason() != Some(StopReason::Error))
            .map(ConversationTurn::as_message)
            .collect();
        let history = history[history.len().saturating_sub(window)..].to_vec();

        let request = GenerationRequest {
            session_id: session_id.to_string(),
            model: model.clone(),
            text: text.to_string(),
            history,
            settings: self.settings(),
        };

        self.inner.streamed.send_replace(String::new());
        self.inner.generating.send_replace(true);

        let (cancel, cancelled) = oneshot::channel();
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move { inner.run_generation(request, cancelled).await });
        *lock(&self.inner.job) = Some(Job { cancel, handle });

        Ok(true)
    }

    /// Cancel the running generation and wait for it to wind down
    pub async fn stop_generation(&self) {
        let _serial = self.inner.send_lock.lock().await;
        self.cancel_job().await;
    }

    async fn cancel_job(&self) {
        let job = lock(&self.inner.job).take();
        if let Some(job) = job {
            if !job.handle.is_finished() {
                info!("Cancelling running generation");
            }
            let _ = job.cancel.send(());
            if let Err(e) = job.handle.await {
                warn!("Generation task ended abnormally: {}", e);
            }
        }
    }

    /// Wait until no generation is running
    pub async fn wait_for_generation(&self) {
        let mut generating = self.inner.generating.subscribe();
        let _ = generating.wait_for(|running| !*running).await;
    }

    pub fn settings(&self) -> GenerationSettings {
        lock(&self.inner.settings).current().clone()
    }

    pub fn set_max_tokens(&self, max_tokens: usize) -> Result<()> {
        lock(&self.inner.settings).set_max_tokens(max_tokens)
    }

    pub fn set_temperature(&self, temperature: f32) -> Result<()> {
        lock(&self.inner.settings).set_temperature(temperature)
    }

    pub fn set_system_prompt(&self, prompt: &str) {
        lock(&self.inner.settings).set_system_prompt(prompt);
    }

    /// Stage a thread count change; takes effect on [`confirm_reload`](Self::confirm_reload)
    pub fn update_threads(&self, threads: usize) {
        lock(&self.inner.settings).request_threads(threads);
    }

    /// Stage a context length change; takes effect on [`confirm_reload`](Self::confirm_reload)
    pub fn update_context_length(&self, context_length: usize) {
        lock(&self.inner.settings).request_context_length(context_length);
    }

    pub fn reset_settings(&self) {
        lock(&self.inner.settings).request_reset();
    }

    pub fn needs_reload_confirmation(&self) -> bool {
        lock(&self.inner.settings).needs_confirmation()
    }

    /// Stage settings derived from the model's own metadata.
    ///
    /// Returns false when the model's runtime cannot probe metadata.
    pub async fn auto_configure(&self, model: &ModelDescriptor) -> Result<bool> {
        let runtime = self.inner.manager.get_runtime_for_model(model)?;
        let Some(conversational) = runtime.as_conversational() else {
            return Ok(false);
        };

        let metadata = conversational.read_metadata(&model.path).await;
        if !metadata.valid {
            warn!(model = %model.name, "Metadata probe failed, using defaults");
        }
        info!(
            model = %model.name,
            context_size = metadata.context_size,
            architecture = %metadata.architecture,
            "Auto-configuring from model metadata"
        );
        lock(&self.inner.settings).request_auto_configure(&metadata);
        Ok(true)
    }

    /// Apply the staged change and unload the model so the next turn reloads it
    pub async fn confirm_reload(&self) -> Result<bool> {
        let applied = lock(&self.inner.settings).confirm()?;
        if applied {
            self.stop_generation().await;
            self.inner.unload().await;
        }
        Ok(applied)
    }

    pub fn cancel_reload(&self) {
        lock(&self.inner.settings).cancel();
    }

    /// Select the model for following turns; the loaded one is released
    pub async fn select_model(&self, model: ModelDescriptor) {
        self.stop_generation().await;
        info!(model = %model.name, "Selected model");
        *lock(&self.inner.selected_model) = Some(model);
        self.inner.unload().await;
    }

    /// Select the first ready model when none is selected
    pub async fn select_default_model(&self) -> Result<Option<ModelDescriptor>> {
        if let Some(model) = self.selected_model() {
            return Ok(Some(model));
        }
        let ready = self
            .inner
            .models
            .models()
            .await?
            .into_iter()
            .find(ModelDescriptor::is_ready);
        *lock(&self.inner.selected_model) = ready.clone();
        Ok(ready)
    }

    /// Create an empty session and make it current
    pub async fn create_session(&self) -> Result<String> {
        let session_id = ChatSession::generate_id();
        self.inner
            .chats
            .insert_session(ChatSession::new(&session_id, DEFAULT_SESSION_TITLE))
            .await?;
        *lock(&self.inner.current_session) = session_id.clone();
        debug!(session = %session_id, "Created session");
        Ok(session_id)
    }

    pub fn switch_session(&self, session_id: &str) {
        *lock(&self.inner.current_session) = session_id.to_string();
    }

    /// Delete a session and its turns; deleting the current one opens a new session
    pub async fn delete_session(&self, session_id: &str) -> Result<()> {
        self.inner.chats.delete_session(session_id).await?;
        self.inner.forget_conversation(session_id);
        if self.current_session() == session_id {
            self.create_session().await?;
        }
        Ok(())
    }

    /// Replace the content of a stored turn
    pub async fn edit_message(&self, turn: &ConversationTurn, content: &str) -> Result<()> {
        let mut edited = turn.clone();
        edited.content = content.to_string();
        self.inner.chats.update_message(&edited).await?;
        self.inner.forget_conversation(&turn.session_id);
        Ok(())
    }

    pub async fn delete_message(&self, turn: &ConversationTurn) -> Result<()> {
        self.inner.chats.delete_message(turn.id).await?;
        self.inner.forget_conversation(&turn.session_id);
        Ok(())
    }

    /// Stop generating and release the model
    pub async fn shutdown(&self) {
        self.stop_generation().await;
        self.inner.unload().await;
    }
}

impl Inner {
    async fn unload(&self) {
        self.manager.unload_model().await;
        *lock(&self.loaded_model) = None;
        *lock(&self.synced) = None;
    }

    fn forget_conversation(&self, session_id: &str) {
        let mut synced = lock(&self.synced);
        if synced.as_ref().is_some_and(|s| s.session_id == session_id) {
            *synced = None;
        }
    }

    async fn run_generation(self: Arc<Self>, request: GenerationRequest, mut cancel: oneshot::Receiver<()>) {
        let started = Instant::now();
        let generation = self.telemetry.start_generation(&request.model.id).await;
        info!(
            generation = %generation,
            model = %request.model.name,
            history = request.history.len(),
            "Starting generation"
        );

        // Loading is not interruptible; cancellation takes effect once streaming starts
        let outcome = match self.prepare(&request).await {
            Ok((runtime, prompt)) => {
                self.stream_reply(runtime, &prompt, request.settings.generation_params(), &mut cancel)
                    .await
            }
            Err(e) => Outcome::Failed(e),
        };

        self.finish(&request, &generation, started, outcome).await;
        self.streamed.send_replace(String::new());
        self.generating.send_replace(false);
    }

    /// Make sure the model is loaded and build the prompt to send
    async fn prepare(&self, request: &GenerationRequest) -> Result<(Arc<dyn Runtime>, String)> {
        let runtime = self.manager.get_runtime_for_model(&request.model)?;
        let loaded = lock(&self.loaded_model).clone();
        if !runtime.is_ready() || loaded.as_deref() != Some(request.model.id.as_str()) {
            let options = request.settings.load_options();
            info!(
                model = %request.model.name,
                threads = options.threads,
                context_length = options.context_length,
                "Loading model"
            );
            *lock(&self.synced) = None;
            *lock(&self.loaded_model) = None;
            self.manager.load_model(&request.model, options).await?;
            *lock(&self.loaded_model) = Some(request.model.id.clone());
        }

        let runtime = self
            .manager
            .current_runtime()
            .await
            .ok_or(Error::RuntimeNotReady)?;
        let system_prompt = &request.settings.system_prompt;

        let prompt = match runtime.as_conversational() {
            Some(conversational) => {
                let wanted = SyncedConversation {
                    session_id: request.session_id.clone(),
                    system_prompt: system_prompt.clone(),
                };
                let in_sync = lock(&self.synced).as_ref() == Some(&wanted);
                if !in_sync {
                    debug!(session = %request.session_id, turns = request.history.len(), "Rebuilding engine conversation");
                    conversational.clear_conversation().await?;
                    if !system_prompt.trim().is_empty() {
                        conversational
                            .add_conversation_message(Role::System, system_prompt)
                            .await?;
                    }
                    for message in &request.history {
                        conversational
                            .add_conversation_message(message.role, &message.content)
                            .await?;
                    }
                    *lock(&self.synced) = Some(wanted);
                }
                request.text.clone()
            }
            None => TemplateEngine::format_transcript(system_prompt, &request.history, &request.text),
        };

        Ok((runtime, prompt))
    }

    async fn stream_reply(
        &self,
        runtime: Arc<dyn Runtime>,
        prompt: &str,
        params: GenerationParams,
        cancel: &mut oneshot::Receiver<()>,
    ) -> Outcome {
        let mut stream = match runtime.generate_response(prompt, params).await {
            Ok(stream) => stream,
            Err(e) => return Outcome::Failed(e),
        };

        let mut text = String::new();
        let mut tokens = 0;
        loop {
            tokio::select! {
                biased;
                _ = &mut *cancel => {
                    runtime.stop_generation();
                    return Outcome::Cancelled { tokens };
                }
                frame = stream.next() => match frame {
                    Some(Ok(StreamFrame::Delta { content })) => {
                        tokens += 1;
                        text.push_str(&content);
                        self.streamed.send_replace(text.clone());
                    }
                    Some(Ok(StreamFrame::Done { finish_reason: StopReason::Cancelled, usage })) => {
                        return Outcome::Cancelled { tokens: usage.completion_tokens };
                    }
                    Some(Ok(StreamFrame::Done { finish_reason, usage })) => {
                        return Outcome::Finished {
                            text,
                            stop_reason: finish_reason,
                            tokens: usage.completion_tokens,
                            runtime,
                        };
                    }
                    Some(Err(e)) => return Outcome::Failed(e),
                    None => {
                        return Outcome::Failed(Error::Generation(
                            "Generation ended without completing".into(),
                        ));
                    }
                },
            }
        }
    }

    async fn finish(
        &self,
        request: &GenerationRequest,
        generation: &GenerationId,
        started: Instant,
        outcome: Outcome,
    ) {
        let elapsed_ms = started.elapsed().as_millis() as u64;
        let session_id = &request.session_id;

        match outcome {
            Outcome::Finished {
                text,
                stop_reason,
                tokens,
                runtime,
            } => {
                let stats = TurnStats::new(tokens, elapsed_ms, stop_reason);
                info!(
                    generation = %generation,
                    tokens,
                    elapsed_ms,
                    tokens_per_second = stats.tokens_per_second,
                    reason = stop_reason.as_str(),
                    "Generation complete"
                );
                self.telemetry.finish_generation(generation, &stats).await;

                let live = match runtime.as_conversational() {
                    Some(conversational) => {
                        (conversational.generation_speed(), Some(conversational.context_usage()))
                    }
                    None => (stats.tokens_per_second, None),
                };
                self.telemetry.record_live(live.0, live.1).await;

                let turn = ConversationTurn::assistant(
                    session_id.as_str(),
                    text,
                    Some(request.model.id.clone()),
                    Some(stats),
                );
                self.persist(turn).await;
            }
            Outcome::Cancelled { tokens } => {
                info!(generation = %generation, tokens, "Generation cancelled, reply discarded");
                // The engine kept the partial reply; the store did not
                *lock(&self.synced) = None;
                self.telemetry
                    .finish_generation(generation, &TurnStats::new(tokens, elapsed_ms, StopReason::Cancelled))
                    .await;
            }
            Outcome::Failed(e) => {
                warn!(generation = %generation, "Generation failed: {}", e);
                *lock(&self.synced) = None;
                self.telemetry.record_error(Some(generation), &e).await;

                let turn = ConversationTurn::assistant(
                    session_id.as_str(),
                    format!("Error: {}", e),
                    Some(request.model.id.clone()),
                    Some(TurnStats::new(0, elapsed_ms, StopReason::Error)),
                );
                self.persist(turn).await;
            }
        }
    }

    async fn persist(&self, turn: ConversationTurn) {
        let session_id = turn.session_id.clone();
        if let Err(e) = self.chats.insert_message(turn).await {
            warn!(session = %session_id, "Failed to store reply: {}", e);
            return;
        }
        if let Err(e) = self.chats.touch_session(&session_id, now_millis()).await {
            warn!(session = %session_id, "Failed to update session: {}", e);
        }
    }
}
