use halo_common::{Error, GenerationParams, LoadOptions, ModelMetadata, Result};
use serde::{Deserialize, Serialize};

// Constants for validation
const MAX_TOKENS_LIMIT: usize = 32_768;
const TEMPERATURE_MAX: f32 = 2.0;
const MAX_THREADS: usize = 64;
const MIN_CONTEXT_LENGTH: usize = 256;
const MAX_CONTEXT_LENGTH: usize = 131_072;

/// Caller-declared generation knobs
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerationSettings {
    /// Max tokens per response, applied per call
    pub max_tokens: usize,
    /// Sampling temperature, applied per call
    pub temperature: f32,
    /// Native session threads, load-time
    pub threads: usize,
    /// Native context window, load-time
    pub context_length: usize,
    #[serde(default)]
    pub system_prompt: String,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            max_tokens: 2048,
            temperature: 0.7,
            threads: 4,
            context_length: 4096,
            system_prompt: String::new(),
        }
    }
}

impl GenerationSettings {
    /// Validate every knob
    pub fn validate(&self) -> Result<()> {
        if self.max_tokens == 0 || self.max_tokens > MAX_TOKENS_LIMIT {
            return Err(Error::Configuration(format!(
                "max_tokens must be between 1 and {}",
                MAX_TOKENS_LIMIT
            )));
        }
        if !(0.0..=TEMPERATURE_MAX).contains(&self.temperature) {
            return Err(Error::Configuration(format!(
                "temperature must be between 0 and {}",
                TEMPERATURE_MAX
            )));
        }
        if self.threads == 0 || self.threads > MAX_THREADS {
            return Err(Error::Configuration(format!(
                "threads must be between 1 and {}",
                MAX_THREADS
            )));
        }
        if self.context_length < MIN_CONTEXT_LENGTH || self.context_length > MAX_CONTEXT_LENGTH {
            return Err(Error::Configuration(format!(
                "context_length must be between {} and {}",
                MIN_CONTEXT_LENGTH, MAX_CONTEXT_LENGTH
            )));
        }
        Ok(())
    }

    pub fn generation_params(&self) -> GenerationParams {
        GenerationParams::new(self.max_tokens, self.temperature)
    }

    pub fn load_options(&self) -> LoadOptions {
        LoadOptions {
            threads: self.threads,
            context_length: self.context_length,
        }
    }
}

/// A load-time change waiting for confirmation
#[derive(Debug, Clone, PartialEq)]
pub enum PendingChange {
    Threads(usize),
    ContextLength(usize),
    Reset,
    /// Settings derived from model metadata
    AutoConfigure {
        context_length: usize,
        max_tokens: usize,
    },
}

/// Holds the active settings and gates load-time changes behind a reload confirmation.
///
/// Per-call knobs apply immediately. Thread count and context length only change the
/// native session when it is recreated, so they are staged until `confirm` and the
/// caller is told to reload.
#[derive(Debug, Clone, Default)]
pub struct SettingsGate {
    current: GenerationSettings,
    pending: Option<PendingChange>,
}

impl SettingsGate {
    pub fn new(settings: GenerationSettings) -> Self {
        Self {
            current: settings,
            pending: None,
        }
    }

    pub fn current(&self) -> &GenerationSettings {
        &self.current
    }

    pub fn pending(&self) -> Option<&PendingChange> {
        self.pending.as_ref()
    }

    /// Whether a reload confirmation is outstanding
    pub fn needs_confirmation(&self) -> bool {
        self.pending.is_some()
    }

    pub fn set_max_tokens(&mut self, max_tokens: usize) -> Result<()> {
        self.apply_checked(|s| s.max_tokens = max_tokens)
    }

    pub fn set_temperature(&mut self, temperature: f32) -> Result<()> {
        self.apply_checked(|s| s.temperature = temperature)
    }

    pub fn set_system_prompt(&mut self, prompt: impl Into<String>) {
        self.current.system_prompt = prompt.into();
    }

    /// Stage a thread count change
    pub fn request_threads(&mut self, threads: usize) {
        self.pending = Some(PendingChange::Threads(threads));
    }

    /// Stage a context length change
    pub fn request_context_length(&mut self, context_length: usize) {
        self.pending = Some(PendingChange::ContextLength(context_length));
    }

    /// Stage a reset to defaults
    pub fn request_reset(&mut self) {
        self.pending = Some(PendingChange::Reset);
    }

    /// Stage settings derived from probed metadata: the full context and half of it for replies
    pub fn request_auto_configure(&mut self, metadata: &ModelMetadata) {
        let context_length = metadata.context_size;
        self.pending = Some(PendingChange::AutoConfigure {
            context_length,
            max_tokens: (context_length / 2).max(1),
        });
    }

    /// Apply the staged change.
    ///
    /// Returns `Ok(true)` when a change was applied and the session must be reloaded.
    /// An invalid staged change is discarded and reported.
    pub fn confirm(&mut self) -> Result<bool> {
        let Some(change) = self.pending.take() else {
            return Ok(false);
        };

        let mut next = self.current.clone();
        match change {
            PendingChange::Threads(threads) => next.threads = threads,
            PendingChange::ContextLength(context_length) => next.context_length = context_length,
            PendingChange::Reset => next = GenerationSettings::default(),
            PendingChange::AutoConfigure {
                context_length,
                max_tokens,
            } => {
                next.context_length = context_length;
                next.max_tokens = max_tokens.min(MAX_TOKENS_LIMIT);
            }
        }

        next.validate()?;
        tracing::info!(
            threads = next.threads,
            context_length = next.context_length,
            "Applied load-time settings change"
        );
        self.current = next;
        Ok(true)
    }

    /// Discard the staged change
    pub fn cancel(&mut self) {
        self.pending = None;
    }

    fn apply_checked(&mut self, update: impl FnOnce(&mut GenerationSettings)) -> Result<()> {
        let mut next = self.current.clone();
        update(&mut next);
        next.validate()?;
        self.current = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_length_waits_for_confirmation() {
        let mut gate = SettingsGate::default();
        gate.request_context_length(2048);

        assert!(gate.needs_confirmation());
        assert_eq!(gate.current().context_length, 4096);
        assert_eq!(gate.current().load_options().context_length, 4096);

        assert!(gate.confirm().unwrap());
        assert_eq!(gate.current().context_length, 2048);
        assert!(!gate.needs_confirmation());
    }

    #[test]
    fn test_cancel_discards_pending_change() {
        let mut gate = SettingsGate::default();
        gate.request_threads(8);
        gate.cancel();

        assert!(!gate.confirm().unwrap());
        assert_eq!(gate.current().threads, 4);
    }

    #[test]
    fn test_later_request_replaces_earlier() {
        let mut gate = SettingsGate::default();
        gate.request_threads(8);
        gate.request_context_length(1024);

        assert!(gate.confirm().unwrap());
        assert_eq!(gate.current().threads, 4);
        assert_eq!(gate.current().context_length, 1024);
    }

    #[test]
    fn test_per_call_knobs_apply_immediately() {
        let mut gate = SettingsGate::default();
        gate.set_max_tokens(64).unwrap();
        gate.set_temperature(0.2).unwrap();
        gate.set_system_prompt("Be brief.");

        assert!(!gate.needs_confirmation());
        let params = gate.current().generation_params();
        assert_eq!(params.max_tokens, 64);
        assert!((params.temperature - 0.2).abs() < f32::EPSILON);
        assert_eq!(gate.current().system_prompt, "Be brief.");
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let mut gate = SettingsGate::default();
        assert!(matches!(gate.set_max_tokens(0), Err(Error::Configuration(_))));
        assert!(matches!(gate.set_temperature(5.0), Err(Error::Configuration(_))));

        gate.request_threads(0);
        assert!(matches!(gate.confirm(), Err(Error::Configuration(_))));
        assert_eq!(gate.current().threads, 4);
        assert!(!gate.needs_confirmation());
    }

    #[test]
    fn test_auto_configure_from_metadata() {
        let mut gate = SettingsGate::default();
        let metadata = ModelMetadata {
            context_size: 8192,
            chat_template: String::new(),
            architecture: "llama".into(),
            valid: true,
        };
        gate.request_auto_configure(&metadata);

        assert_eq!(gate.current().context_length, 4096);
        assert!(gate.confirm().unwrap());
        assert_eq!(gate.current().context_length, 8192);
        assert_eq!(gate.current().max_tokens, 4096);
    }

    #[test]
    fn test_reset_restores_defaults() {
        let mut gate = SettingsGate::new(GenerationSettings {
            threads: 2,
            context_length: 1024,
            ..GenerationSettings::default()
        });
        gate.request_reset();
        assert!(gate.confirm().unwrap());
        assert_eq!(gate.current(), &GenerationSettings::default());
    }
}
