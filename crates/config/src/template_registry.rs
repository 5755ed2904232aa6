use halo_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Role delimiters for one chat-format family
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TemplateConfig {
    pub id: String,
    pub name: String,
    /// Substrings identifying this family inside an embedded chat template
    #[serde(default)]
    pub markers: Vec<String>,
    pub system_prefix: String,
    pub system_suffix: String,
    pub user_prefix: String,
    pub user_suffix: String,
    pub assistant_prefix: String,
    pub assistant_suffix: String,
    #[serde(default)]
    pub default_system_prompt: String,
}

/// Registry file contents
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateRegistryData {
    pub version: String,
    pub default_template: String,
    pub templates: Vec<TemplateConfig>,
}

/// Chat template registry
#[derive(Debug, Clone)]
pub struct TemplateRegistry {
    templates: HashMap<String, TemplateConfig>,
    /// Detection order, as listed in the registry file
    order: Vec<String>,
    default_template_id: String,
}

impl TemplateRegistry {
    /// Load registry from JSON file
    pub fn load_from_file(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::load_from_json(&content)
    }

    /// Load registry from JSON string
    pub fn load_from_json(json: &str) -> Result<Self> {
        let data: TemplateRegistryData = serde_json::from_str(json)?;
        Self::from_data(data)
    }

    /// Load the built-in templates
    pub fn load_defaults() -> Result<Self> {
        let json = include_str!("default_templates.json");
        Self::load_from_json(json)
    }

    fn from_data(data: TemplateRegistryData) -> Result<Self> {
        let mut templates = HashMap::new();
        let mut order = Vec::with_capacity(data.templates.len());

        for template in data.templates {
            if templates.contains_key(&template.id) {
                return Err(Error::Configuration(format!(
                    "Duplicate template id: {}",
                    template.id
                )));
            }
            order.push(template.id.clone());
            templates.insert(template.id.clone(), template);
        }

        if !templates.contains_key(&data.default_template) {
            return Err(Error::Configuration(format!(
                "Default template not found: {}",
                data.default_template
            )));
        }

        Ok(Self {
            templates,
            order,
            default_template_id: data.default_template,
        })
    }

    /// Get a template by ID
    pub fn get_template(&self, id: &str) -> Result<&TemplateConfig> {
        self.templates
            .get(id)
            .ok_or_else(|| Error::Configuration(format!("Template not found: {}", id)))
    }

    /// The fallback template
    pub fn default_template(&self) -> &TemplateConfig {
        // Presence is checked in from_data
        &self.templates[&self.default_template_id]
    }

    /// Find the family whose markers all appear in an embedded chat template
    pub fn detect(&self, chat_template: &str) -> Option<&TemplateConfig> {
        self.order
            .iter()
            .filter_map(|id| self.templates.get(id))
            .find(|t| {
                !t.markers.is_empty()
                    && t.markers.iter().all(|m| chat_template.contains(m.as_str()))
            })
    }

    /// Template for a model: the detected family when a chat template is embedded, else the default
    pub fn resolve(&self, chat_template: Option<&str>) -> &TemplateConfig {
        match chat_template.and_then(|t| self.detect(t)) {
            Some(template) => template,
            None => self.default_template(),
        }
    }

    /// List all template IDs
    pub fn list_templates(&self) -> Vec<String> {
        self.order.clone()
    }
}
