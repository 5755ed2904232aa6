use super::{NativeBackend, NativeSession, SessionHandle, SessionParams, StepOutput};
use halo_common::{Error, ModelMetadata, Result, Role};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// Lifecycle of a session handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unloaded,
    Loading,
    Loaded,
    Generating,
}

struct SessionCell {
    session: Box<dyn NativeSession>,
    generating: bool,
}

enum Slot {
    Loading,
    Ready(Arc<Mutex<SessionCell>>),
}

/// Arena of native sessions keyed by handle.
///
/// All methods block; async callers run them on `spawn_blocking`.
pub struct NativeEngine {
    backend: Arc<dyn NativeBackend>,
    sessions: Mutex<HashMap<u64, Slot>>,
    next_id: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl NativeEngine {
    pub fn new(backend: Arc<dyn NativeBackend>) -> Self {
        Self {
            backend,
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn probe_metadata(&self, path: &Path) -> ModelMetadata {
        self.backend.probe_metadata(path)
    }

    /// Load a model; returns [`SessionHandle::NULL`] on failure
    pub fn init_session(&self, path: &Path, threads: usize, context_length: usize) -> SessionHandle {
        let handle = self.reserve_session();
        match self.load_session(handle, path, threads, context_length) {
            Ok(()) => handle,
            Err(_) => SessionHandle::NULL,
        }
    }

    /// Issue a handle in the `Loading` state. Follow with [`Self::load_session`].
    pub fn reserve_session(&self) -> SessionHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.sessions).insert(id, Slot::Loading);
        SessionHandle(id)
    }

    /// Load the model behind a reserved handle.
    ///
    /// A handle freed while its load runs reports `Cancelled` and the
    /// loaded session is dropped.
    pub fn load_session(
        &self,
        handle: SessionHandle,
        path: &Path,
        threads: usize,
        context_length: usize,
    ) -> Result<()> {
        let id = handle.raw();
        let params = SessionParams {
            threads,
            context_length,
        };
        let loaded = panic::catch_unwind(AssertUnwindSafe(|| self.backend.load(path, &params)))
            .unwrap_or_else(|_| {
                warn!("Native backend panicked while loading {}", path.display());
                None
            });

        let mut sessions = lock(&self.sessions);
        let still_wanted = matches!(sessions.get(&id), Some(Slot::Loading));
        match (loaded, still_wanted) {
            (Some(session), true) => {
                sessions.insert(
                    id,
                    Slot::Ready(Arc::new(Mutex::new(SessionCell {
                        session,
                        generating: false,
                    }))),
                );
                info!(
                    handle = id,
                    path = %path.display(),
                    threads,
                    context_length,
                    "Native session loaded"
                );
                Ok(())
            }
            (Some(session), false) => {
                drop(sessions);
                drop(session);
                debug!(handle = id, "Session freed during load");
                Err(Error::Cancelled)
            }
            (None, wanted) => {
                if wanted {
                    sessions.remove(&id);
                }
                warn!("Native backend failed to load {}", path.display());
                Err(Error::ModelLoad(format!(
                    "Native engine could not load {}",
                    path.display()
                )))
            }
        }
    }

    fn cell(&self, handle: SessionHandle) -> Result<Arc<Mutex<SessionCell>>> {
        match lock(&self.sessions).get(&handle.raw()) {
            Some(Slot::Ready(cell)) => Ok(cell.clone()),
            _ => Err(Error::RuntimeNotReady),
        }
    }

    pub fn session_state(&self, handle: SessionHandle) -> SessionState {
        let cell = match lock(&self.sessions).get(&handle.raw()) {
            None => return SessionState::Unloaded,
            Some(Slot::Loading) => return SessionState::Loading,
            Some(Slot::Ready(cell)) => cell.clone(),
        };
        let generating = lock(&cell).generating;
        if generating {
            SessionState::Generating
        } else {
            SessionState::Loaded
        }
    }

    /// Number of sessions currently holding native resources
    pub fn live_sessions(&self) -> usize {
        lock(&self.sessions)
            .values()
            .filter(|slot| matches!(slot, Slot::Ready(_)))
            .count()
    }

    pub fn append_message(&self, handle: SessionHandle, role: Role, content: &str) -> Result<()> {
        let cell = self.cell(handle)?;
        lock(&cell).session.append_message(role, content);
        Ok(())
    }

    pub fn clear_conversation(&self, handle: SessionHandle) -> Result<()> {
        let cell = self.cell(handle)?;
        lock(&cell).session.clear_conversation();
        Ok(())
    }

    /// Start a completion; a session runs at most one at a time
    pub fn begin_completion(&self, handle: SessionHandle, prompt: &str, temperature: f32) -> Result<()> {
        let cell = self.cell(handle)?;
        let mut cell = lock(&cell);
        if cell.generating {
            return Err(Error::Generation(format!(
                "{} is already generating",
                handle
            )));
        }
        if !cell.session.begin_completion(prompt, temperature) {
            return Err(Error::Generation(
                "Engine refused to start the completion (context full?)".into(),
            ));
        }
        cell.generating = true;
        Ok(())
    }

    /// Pull the next fragment. Panics inside the engine become [`StepOutput::Error`].
    pub fn step(&self, handle: SessionHandle) -> StepOutput {
        let cell = match self.cell(handle) {
            Ok(cell) => cell,
            Err(_) => return StepOutput::Error(format!("{} is not loaded", handle)),
        };
        let mut cell = lock(&cell);
        if !cell.generating {
            return StepOutput::Error(format!("{} has no completion in progress", handle));
        }

        match panic::catch_unwind(AssertUnwindSafe(|| cell.session.step())) {
            Ok(output) => output,
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                warn!(handle = handle.raw(), "Native step panicked: {}", message);
                StepOutput::Error(format!("Native engine panicked: {}", message))
            }
        }
    }

    /// Finish the current completion. No-op when none is running.
    pub fn end_completion(&self, handle: SessionHandle) {
        let Ok(cell) = self.cell(handle) else {
            return;
        };
        let mut cell = lock(&cell);
        if cell.generating {
            cell.session.end_completion();
            cell.generating = false;
        }
    }

    pub fn generation_speed(&self, handle: SessionHandle) -> Result<f32> {
        let cell = self.cell(handle)?;
        let speed = lock(&cell).session.generation_speed();
        Ok(speed)
    }

    pub fn context_tokens_used(&self, handle: SessionHandle) -> Result<usize> {
        let cell = self.cell(handle)?;
        let used = lock(&cell).session.context_tokens_used();
        Ok(used)
    }

    /// Release a session. Returns false for a handle that was not live.
    pub fn free_session(&self, handle: SessionHandle) -> bool {
        let removed = lock(&self.sessions).remove(&handle.raw());
        match removed {
            Some(Slot::Ready(cell)) => {
                drop(cell);
                info!(handle = handle.raw(), "Native session freed");
                true
            }
            Some(Slot::Loading) => {
                debug!(handle = handle.raw(), "Freed a session still loading");
                true
            }
            None => false,
        }
    }

    /// Single-call generation: runs the whole completion and reports each
    /// non-empty fragment to `on_token`, which returns false to stop early.
    ///
    /// Returns the number of tokens produced.
    pub fn generate<F>(
        &self,
        handle: SessionHandle,
        prompt: &str,
        max_tokens: usize,
        temperature: f32,
        mut on_token: F,
    ) -> Result<usize>
    where
        F: FnMut(&str) -> bool,
    {
        self.begin_completion(handle, prompt, temperature)?;
        let _end = scopeguard::guard((), |_| self.end_completion(handle));

        let mut produced = 0;
        while produced < max_tokens {
            match self.step(handle) {
                StepOutput::Fragment(text) => {
                    produced += 1;
                    if !text.is_empty() && !on_token(&text) {
                        break;
                    }
                }
                StepOutput::EndOfGeneration => break,
                StepOutput::Error(message) => return Err(Error::Generation(message)),
            }
        }
        Ok(produced)
    }
}

impl std::fmt::Debug for NativeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeEngine")
            .field("backend", &self.backend.name())
            .field("live_sessions", &self.live_sessions())
            .finish()
    }
}
