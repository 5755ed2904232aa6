mod config_loader;
mod settings;
mod template_registry;


pub use config_loader::{AppConfig, ChatConfig, ConfigLoader, ModelsConfig, RuntimeConfig};
pub use settings::{GenerationSettings, PendingChange, SettingsGate};
pub use template_registry::{TemplateConfig, TemplateRegistry, TemplateRegistryData};
