use crate::Runtime;
use halo_common::{Error, LoadOptions, ModelDescriptor, ModelFormat, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Owns the runtimes and keeps at most one of them loaded.
///
/// Loads and unloads are serialized by one async lock, so after any number of
/// concurrent `load_model` calls exactly one runtime is current.
pub struct ModelManager {
    runtimes: HashMap<ModelFormat, Arc<dyn Runtime>>,
    current: Mutex<Option<Arc<dyn Runtime>>>,
}

impl ModelManager {
    pub fn new() -> Self {
        Self {
            runtimes: HashMap::new(),
            current: Mutex::new(None),
        }
    }

    /// Register the runtime serving a format
    pub fn register(mut self, format: ModelFormat, runtime: Arc<dyn Runtime>) -> Self {
        self.runtimes.insert(format, runtime);
        self
    }

    pub fn supported_formats(&self) -> Vec<ModelFormat> {
        self.runtimes.keys().copied().collect()
    }

    /// Runtime serving the descriptor's format
    pub fn get_runtime_for_model(&self, descriptor: &ModelDescriptor) -> Result<Arc<dyn Runtime>> {
        self.runtimes
            .get(&descriptor.format)
            .cloned()
            .ok_or_else(|| Error::UnsupportedFormat(descriptor.format.to_string()))
    }

    /// Release whatever is loaded, then load `descriptor`.
    ///
    /// On failure nothing is loaded.
    pub async fn load_model(&self, descriptor: &ModelDescriptor, options: LoadOptions) -> Result<()> {
        let mut current = self.current.lock().await;

        if let Some(previous) = current.take() {
            info!(runtime = previous.name(), "Releasing previous model");
            previous.release().await;
        }

        let runtime = self.get_runtime_for_model(descriptor)?;
        match runtime.initialize_model(descriptor, options).await {
            Ok(()) => {
                info!(model = %descriptor.name, runtime = runtime.name(), "Model loaded");
                *current = Some(runtime);
                Ok(())
            }
            Err(e) => {
                warn!(model = %descriptor.name, "Model load failed: {}", e);
                // initialize_model leaves the runtime unloaded; make sure of it
                runtime.release().await;
                Err(e)
            }
        }
    }

    /// Release the current runtime, if any
    pub async fn unload_model(&self) {
        let mut current = self.current.lock().await;
        if let Some(runtime) = current.take() {
            runtime.release().await;
            info!(runtime = runtime.name(), "Model unloaded");
        }
    }

    /// The loaded runtime; never one that is not ready
    pub async fn current_runtime(&self) -> Option<Arc<dyn Runtime>> {
        self.current
            .lock()
            .await
            .as_ref()
            .filter(|runtime| runtime.is_ready())
            .cloned()
    }
}

impl Default for ModelManager {
    fn default() -> Self {
        Self::new()
    }
}
