//! Provider template registry.

use crate::error::DeployError;
use std::collections::HashMap;
use voxhost_types::{DeploymentMode, HealthCheck, ProcessSpec, ProviderTemplate, ResourceLimits};

/// Templates keyed by provider type. Loaded once at wiring time and only
/// read afterwards.
#[derive(Debug, Clone, Default)]
pub struct TemplateRegistry {
    templates: HashMap<String, ProviderTemplate>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in provider catalog.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        for template in builtin_templates() {
            registry.register(template);
        }
        registry
    }

    /// Adds a template, replacing any existing one of the same type.
    pub fn register(&mut self, template: ProviderTemplate) -> Option<ProviderTemplate> {
        let previous = self
            .templates
            .insert(template.provider_type.clone(), template);
        if let Some(old) = &previous {
            tracing::debug!(provider_type = %old.provider_type, "provider template replaced");
        }
        previous
    }

    pub fn get(&self, provider_type: &str) -> Result<&ProviderTemplate, DeployError> {
        self.templates
            .get(provider_type)
            .ok_or_else(|| DeployError::UnknownProviderType(provider_type.to_string()))
    }

    pub fn contains(&self, provider_type: &str) -> bool {
        self.templates.contains_key(provider_type)
    }

    /// Registered provider types, sorted.
    pub fn provider_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.templates.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

fn builtin_templates() -> Vec<ProviderTemplate> {
    let mut whisper = ProviderTemplate::new("whisper-asr", DeploymentMode::Container);
    whisper.image = Some("onerahmet/openai-whisper-asr-webservice:latest".to_string());
    whisper.default_port = 9000;
    whisper.internal_port = 9000;
    whisper.health = HealthCheck {
        path: "/docs".to_string(),
        max_wait_ms: 120_000,
        ..HealthCheck::default()
    };
    whisper.gpu = true;
    whisper
        .volumes
        .insert("models".to_string(), "/root/.cache/whisper".to_string());
    whisper.env.insert("ASR_MODEL".to_string(), "base".to_string());
    whisper
        .env
        .insert("ASR_ENGINE".to_string(), "faster_whisper".to_string());
    whisper.limits = ResourceLimits {
        cpus: None,
        memory: Some("4g".to_string()),
    };

    let mut kokoro = ProviderTemplate::new("kokoro", DeploymentMode::Container);
    kokoro.image = Some("ghcr.io/remsky/kokoro-fastapi-cpu:latest".to_string());
    kokoro.default_port = 8880;
    kokoro.internal_port = 8880;
    kokoro
        .volumes
        .insert("models".to_string(), "/app/api/src/models".to_string());
    kokoro.limits = ResourceLimits {
        cpus: Some("2".to_string()),
        memory: Some("2g".to_string()),
    };

    let mut streaming = ProviderTemplate::new("whisper-live", DeploymentMode::StreamingContainer);
    streaming.image = Some("ghcr.io/collabora/whisperlive-cpu:latest".to_string());
    streaming.default_port = 9090;
    streaming.internal_port = 9091;
    streaming.stream_port = Some(9090);
    streaming
        .volumes
        .insert("models".to_string(), "/root/.cache/huggingface".to_string());
    streaming.gpu = true;

    let mut piper = ProviderTemplate::new("piper", DeploymentMode::Process);
    piper.default_port = 5000;
    piper.process = Some(ProcessSpec {
        runtime_candidates: vec!["python3".to_string(), "python".to_string()],
        min_version: Some((3, 9)),
        package: Some("piper-tts".to_string()),
        install_command: None,
        args: vec![
            "-m".to_string(),
            "piper.http_server".to_string(),
            "--model".to_string(),
            "en_US-lessac-medium".to_string(),
            "--port".to_string(),
            "{port}".to_string(),
        ],
        http_health: false,
    });

    let mut elevenlabs = ProviderTemplate::new("elevenlabs", DeploymentMode::Remote);
    elevenlabs.endpoint = Some("https://api.elevenlabs.io".to_string());
    elevenlabs.health.path = "/v1/models".to_string();
    elevenlabs.auth_header = Some("xi-api-key".to_string());
    elevenlabs.api_key_env = Some("ELEVENLABS_API_KEY".to_string());

    vec![whisper, kokoro, streaming, piper, elevenlabs]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_catalog_covers_every_mode() {
        let registry = TemplateRegistry::builtin();
        assert_eq!(
            registry.provider_types(),
            vec!["elevenlabs", "kokoro", "piper", "whisper-asr", "whisper-live"]
        );
        assert_eq!(registry.get("kokoro").unwrap().mode, DeploymentMode::Container);
        assert_eq!(
            registry.get("whisper-live").unwrap().mode,
            DeploymentMode::StreamingContainer
        );
        assert_eq!(registry.get("piper").unwrap().mode, DeploymentMode::Process);
        assert_eq!(registry.get("elevenlabs").unwrap().mode, DeploymentMode::Remote);
    }

    #[test]
    fn unknown_type_is_a_usage_error() {
        let registry = TemplateRegistry::builtin();
        assert!(matches!(
            registry.get("nope"),
            Err(DeployError::UnknownProviderType(t)) if t == "nope"
        ));
    }

    #[test]
    fn register_replaces_by_type() {
        let mut registry = TemplateRegistry::builtin();
        let mut custom = ProviderTemplate::new("kokoro", DeploymentMode::Container);
        custom.image = Some("registry.local/kokoro:gpu".to_string());
        assert!(registry.register(custom).is_some());
        assert_eq!(
            registry.get("kokoro").unwrap().image.as_deref(),
            Some("registry.local/kokoro:gpu")
        );
        assert_eq!(registry.len(), 5);
    }
}
