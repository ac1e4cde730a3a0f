use std::collections::HashMap;
use std::sync::Arc;

use secrecy::SecretString;
use tracing::{info, warn};

use parley_core::{ModelProvider, ProviderError, ProviderSummary};

use crate::mock::DemoProvider;
use crate::openai::{OpenAiConfig, OpenAiProvider, DEFAULT_BASE_URL};
use crate::pricing::Pricing;

/// Settings for one OpenAI-backed model id.
#[derive(Clone, Debug, PartialEq)]
pub struct OpenAiModelSettings {
    pub id: String,
    pub display_name: String,
    pub model: String,
    pub system_prompt: Option<String>,
    pub pricing: Pricing,
}

/// Provider configuration, usually read from the environment.
#[derive(Clone, Debug)]
pub struct ProviderSettings {
    /// Enables the OpenAI providers. Without it the demo providers are used.
    pub api_key: Option<SecretString>,
    pub base_url: String,
    pub openai_models: Vec<OpenAiModelSettings>,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            openai_models: vec![
                OpenAiModelSettings {
                    id: "gpt-4".into(),
                    display_name: "OpenAI GPT-4".into(),
                    model: "gpt-4o-mini".into(),
                    system_prompt: None,
                    pricing: Pricing::default(),
                },
                OpenAiModelSettings {
                    id: "gpt-5".into(),
                    display_name: "OpenAI GPT-5".into(),
                    model: "gpt-4o".into(),
                    system_prompt: None,
                    pricing: Pricing::default(),
                },
            ],
        }
    }
}

impl ProviderSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary variable source. Blank values count
    /// as unset and unparseable rates are ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let rate = |key: &str| {
            get(key).and_then(|v| match v.trim().parse::<f64>() {
                Ok(rate) if rate.is_finite() => Some(rate),
                _ => {
                    warn!(key, value = %v, "ignoring unparseable rate");
                    None
                }
            })
        };

        let mut settings = Self::default();
        settings.api_key = get("OPENAI_API_KEY").map(SecretString::from);
        if let Some(base_url) = get("OPENAI_API_BASE_URL") {
            settings.base_url = base_url;
        }
        for (model, prefix) in settings
            .openai_models
            .iter_mut()
            .zip(["OPENAI_GPT4", "OPENAI_GPT5"])
        {
            if let Some(name) = get(&format!("{prefix}_MODEL")) {
                model.model = name;
            }
            model.system_prompt = get(&format!("{prefix}_SYSTEM_PROMPT"));
            model.pricing = Pricing::new(
                rate(&format!("{prefix}_PROMPT_COST_PER_1K")),
                rate(&format!("{prefix}_COMPLETION_COST_PER_1K")),
            );
        }
        settings
    }
}

/// Configured providers, addressable by model id and listed in
/// registration order.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn ModelProvider>>,
    order: Vec<String>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// OpenAI providers when an API key is set, otherwise the demo pair.
    pub fn from_settings(settings: &ProviderSettings) -> Result<Self, ProviderError> {
        let mut registry = Self::new();
        match &settings.api_key {
            Some(api_key) => {
                for model in &settings.openai_models {
                    let provider = OpenAiProvider::new(OpenAiConfig {
                        id: model.id.clone(),
                        display_name: model.display_name.clone(),
                        model: model.model.clone(),
                        system_prompt: model.system_prompt.clone(),
                        pricing: model.pricing,
                        base_url: settings.base_url.clone(),
                        api_key: api_key.clone(),
                    })?;
                    registry.register(Arc::new(provider));
                }
                info!(providers = ?registry.ids(), "registered OpenAI providers");
            }
            None => {
                registry.register(Arc::new(DemoProvider::new("mock-gemini", "Mock Gemini")));
                registry.register(Arc::new(DemoProvider::new("mock-claude", "Mock Claude 3")));
                info!(providers = ?registry.ids(), "no OPENAI_API_KEY set, using demo providers");
            }
        }
        Ok(registry)
    }

    /// Register a provider. An id that is already taken keeps its first
    /// provider.
    pub fn register(&mut self, provider: Arc<dyn ModelProvider>) {
        let id = provider.id().to_string();
        if self.providers.contains_key(&id) {
            warn!(provider = %id, "duplicate provider id ignored");
            return;
        }
        self.order.push(id.clone());
        self.providers.insert(id, provider);
    }

    pub fn with(mut self, provider: Arc<dyn ModelProvider>) -> Self {
        self.register(provider);
        self
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn ModelProvider>> {
        self.providers.get(id).map(Arc::clone)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.providers.contains_key(id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.order.clone()
    }

    pub fn summaries(&self) -> Vec<ProviderSummary> {
        self.order
            .iter()
            .filter_map(|id| self.providers.get(id))
            .map(|p| p.summary())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockResponse, ScriptedProvider};
    use secrecy::ExposeSecret;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_without_environment() {
        let settings = ProviderSettings::from_lookup(lookup(&[]));
        assert!(settings.api_key.is_none());
        assert_eq!(settings.base_url, "https://api.openai.com/v1");
        assert_eq!(settings.openai_models[0].model, "gpt-4o-mini");
        assert_eq!(settings.openai_models[1].model, "gpt-4o");
    }

    #[test]
    fn reads_per_model_overrides() {
        let settings = ProviderSettings::from_lookup(lookup(&[
            ("OPENAI_API_KEY", "sk-live"),
            ("OPENAI_API_BASE_URL", "http://proxy/v1"),
            ("OPENAI_GPT4_MODEL", "gpt-4.1-mini"),
            ("OPENAI_GPT4_SYSTEM_PROMPT", "Be terse."),
            ("OPENAI_GPT4_PROMPT_COST_PER_1K", "0.15"),
            ("OPENAI_GPT5_COMPLETION_COST_PER_1K", "not-a-number"),
            ("OPENAI_GPT5_SYSTEM_PROMPT", "  "),
        ]));
        assert_eq!(
            settings.api_key.as_ref().map(|k| k.expose_secret().to_string()),
            Some("sk-live".to_string())
        );
        assert_eq!(settings.base_url, "http://proxy/v1");
        let gpt4 = &settings.openai_models[0];
        assert_eq!(gpt4.model, "gpt-4.1-mini");
        assert_eq!(gpt4.system_prompt.as_deref(), Some("Be terse."));
        assert_eq!(gpt4.pricing, Pricing::new(Some(0.15), None));
        let gpt5 = &settings.openai_models[1];
        assert_eq!(gpt5.system_prompt, None);
        assert!(!gpt5.pricing.is_configured());
    }

    #[test]
    fn demo_providers_without_key() {
        let registry = ProviderRegistry::from_settings(&ProviderSettings::default()).unwrap();
        assert_eq!(registry.ids(), vec!["mock-gemini", "mock-claude"]);
        let summaries = registry.summaries();
        assert_eq!(summaries[1].display_name, "Mock Claude 3");
    }

    #[test]
    fn openai_providers_with_key() {
        let settings = ProviderSettings {
            api_key: Some(SecretString::from("sk-test")),
            ..Default::default()
        };
        let registry = ProviderRegistry::from_settings(&settings).unwrap();
        assert_eq!(registry.ids(), vec!["gpt-4", "gpt-5"]);
        assert_eq!(registry.get("gpt-5").unwrap().display_name(), "OpenAI GPT-5");
    }

    #[test]
    fn duplicate_registration_keeps_first() {
        let registry = ProviderRegistry::new()
            .with(Arc::new(
                ScriptedProvider::always("m", MockResponse::texts(&["a"])).with_display_name("first"),
            ))
            .with(Arc::new(
                ScriptedProvider::always("m", MockResponse::texts(&["b"])).with_display_name("second"),
            ));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("m").unwrap().display_name(), "first");
        assert!(registry.get("other").is_none());
        assert!(!registry.contains("other"));
    }
}
