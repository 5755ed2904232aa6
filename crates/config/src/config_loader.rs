use halo_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::settings::GenerationSettings;

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub generation: GenerationSettings,
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub chat: ChatConfig,
}

/// Runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RuntimeConfig {
    /// Preferred accelerator label ("cpu", "gpu_compute", ...); probed when unset
    pub acceleration: Option<String>,
}

/// Models configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    pub directory: PathBuf,
    pub default_model: Option<PathBuf>,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            directory: dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("halo/models"),
            default_model: None,
        }
    }
}

/// Chat behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Number of previous turns folded into a stateless prompt
    pub history_window: usize,
    /// Maximum length of an auto-generated session title
    pub title_max_chars: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            history_window: 5,
            title_max_chars: 30,
        }
    }
}

impl AppConfig {
    /// Validate the whole configuration
    pub fn validate(&self) -> Result<()> {
        self.generation.validate()?;
        if self.chat.title_max_chars == 0 {
            return Err(Error::Configuration(
                "chat.title_max_chars must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Resolve a model path relative to the models directory
    pub fn model_path(&self, name: &str) -> PathBuf {
        let path = PathBuf::from(name);
        if path.is_absolute() {
            path
        } else {
            self.models.directory.join(path)
        }
    }
}

/// Configuration loader
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from file or use defaults
    pub fn load(path: Option<&PathBuf>) -> Result<AppConfig> {
        if let Some(path) = path {
            if path.exists() {
                return Self::load_file(path);
            }
            tracing::warn!("Config file {} not found, falling back", path.display());
        }

        // Check default locations
        let default_paths = vec![
            PathBuf::from("halo.json"),
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("halo/config.json"),
        ];

        for path in default_paths {
            if path.exists() {
                return Self::load_file(&path);
            }
        }

        // Use defaults
        Ok(AppConfig::default())
    }

    fn load_file(path: &PathBuf) -> Result<AppConfig> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&content)?;
        config.validate()?;
        tracing::info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(config: &AppConfig, path: &PathBuf) -> Result<()> {
        let content = serde_json::to_string_pretty(config)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
