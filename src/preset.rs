//! Named model presets with a nullable default and JSON persistence.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, LazyLock, RwLock};

use tracing::debug;

use crate::adapter::{AdapterRegistry, drain_final};
use crate::config::AmritaConfig;
use crate::error::AmritaError;
use crate::types::{Message, ModelPreset, Usage};

/// Result of probing a preset's connectivity.
#[derive(Debug, Clone)]
pub struct PresetReport {
    pub preset_name: String,
    pub ok: bool,
    /// Error text when the probe failed, empty otherwise.
    pub message: String,
    pub latency_ms: i64,
    pub usage: Option<Usage>,
}

#[derive(Default)]
struct PresetInner {
    presets: HashMap<String, ModelPreset>,
    default_name: Option<String>,
}

/// Keyed preset map. Adding an existing name replaces the previous preset.
#[derive(Default)]
pub struct PresetRegistry {
    inner: RwLock<PresetInner>,
}

static DEFAULT_PRESETS: LazyLock<Arc<PresetRegistry>> =
    LazyLock::new(|| Arc::new(PresetRegistry::new()));

/// The process-wide preset registry.
pub fn default_presets() -> Arc<PresetRegistry> {
    DEFAULT_PRESETS.clone()
}

impl PresetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a preset.
    pub fn add(&self, preset: ModelPreset) {
        let mut inner = self.inner.write().expect("preset registry lock poisoned");
        inner.presets.insert(preset.name.clone(), preset);
    }

    /// Remove a preset; clears the default if it pointed at it. Idempotent.
    pub fn remove(&self, name: &str) {
        let mut inner = self.inner.write().expect("preset registry lock poisoned");
        inner.presets.remove(name);
        if inner.default_name.as_deref() == Some(name) {
            inner.default_name = None;
        }
    }

    pub fn get(&self, name: &str) -> Result<ModelPreset, AmritaError> {
        let inner = self.inner.read().expect("preset registry lock poisoned");
        inner
            .presets
            .get(name)
            .cloned()
            .ok_or_else(|| AmritaError::not_found("preset", name))
    }

    /// Mark an existing preset as the default.
    pub fn set_default(&self, name: &str) -> Result<(), AmritaError> {
        let mut inner = self.inner.write().expect("preset registry lock poisoned");
        if !inner.presets.contains_key(name) {
            return Err(AmritaError::not_found("preset", name));
        }
        inner.default_name = Some(name.to_string());
        Ok(())
    }

    /// The default preset; fails until [`PresetRegistry::set_default`] names
    /// one.
    pub fn default_preset(&self) -> Result<ModelPreset, AmritaError> {
        let inner = self.inner.read().expect("preset registry lock poisoned");
        let name = inner
            .default_name
            .as_ref()
            .ok_or_else(|| AmritaError::not_found("default preset", "(unset)"))?;
        inner
            .presets
            .get(name)
            .cloned()
            .ok_or_else(|| AmritaError::not_found("preset", name))
    }

    pub fn all(&self) -> Vec<ModelPreset> {
        let inner = self.inner.read().expect("preset registry lock poisoned");
        inner.presets.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.read().expect("preset registry lock poisoned");
        inner.presets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read a preset from a JSON file and register it.
    pub async fn load(&self, path: impl AsRef<Path>) -> Result<ModelPreset, AmritaError> {
        let contents = tokio::fs::read_to_string(path.as_ref()).await.map_err(|e| {
            AmritaError::Configuration(format!("failed to read preset file: {e}"))
        })?;
        let preset: ModelPreset = serde_json::from_str(&contents)
            .map_err(|e| AmritaError::Configuration(format!("failed to parse preset file: {e}")))?;
        self.add(preset.clone());
        Ok(preset)
    }

    /// Write a registered preset to a JSON file.
    pub async fn save(&self, name: &str, path: impl AsRef<Path>) -> Result<(), AmritaError> {
        let preset = self.get(name)?;
        let contents = serde_json::to_string_pretty(&preset)
            .map_err(|e| AmritaError::Configuration(format!("failed to serialize preset: {e}")))?;
        tokio::fs::write(path.as_ref(), contents)
            .await
            .map_err(|e| AmritaError::Configuration(format!("failed to write preset file: {e}")))
    }

    /// Probe a preset with a canned two-message conversation.
    ///
    /// Failures are reported in the result, never raised.
    pub async fn probe(
        &self,
        name: &str,
        adapters: &AdapterRegistry,
        config: &AmritaConfig,
    ) -> Result<PresetReport, AmritaError> {
        let preset = self.get(name)?;
        debug!(preset = %preset.name, model = %preset.model, "probing preset");

        let adapter = match adapters.resolve(&preset, config) {
            Ok(adapter) => adapter,
            Err(e) => {
                return Ok(PresetReport {
                    preset_name: preset.name,
                    ok: false,
                    message: e.to_string(),
                    latency_ms: 0,
                    usage: None,
                });
            }
        };

        let messages = [
            Message::system("You are a helpful assistant."),
            Message::user("Hello, please briefly introduce yourself."),
        ];
        let started = chrono::Utc::now();
        let outcome = match adapter.call_api(&messages, &[]).await {
            Ok(stream) => drain_final(stream).await,
            Err(e) => Err(e),
        };
        let latency_ms = (chrono::Utc::now() - started).num_milliseconds();

        Ok(match outcome {
            Ok(response) => PresetReport {
                preset_name: preset.name,
                ok: true,
                message: String::new(),
                latency_ms,
                usage: response.usage,
            },
            Err(e) => PresetReport {
                preset_name: preset.name,
                ok: false,
                message: e.to_string(),
                latency_ms,
                usage: None,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn preset(name: &str) -> ModelPreset {
        let mut p = ModelPreset::new(name, "test-model");
        p.base_url = "https://example.invalid/v1".to_string();
        p
    }

    #[test]
    fn add_replaces_existing_name() {
        let registry = PresetRegistry::new();
        registry.add(preset("main"));
        let mut updated = preset("main");
        updated.model = "test-model-v2".to_string();
        registry.add(updated);

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("main").unwrap().model, "test-model-v2");
    }

    #[test]
    fn default_requires_explicit_selection() {
        let registry = PresetRegistry::new();
        registry.add(preset("a"));
        assert!(registry.default_preset().is_err());

        registry.set_default("a").unwrap();
        assert_eq!(registry.default_preset().unwrap().name, "a");

        assert!(registry.set_default("missing").is_err());
    }

    #[test]
    fn removing_default_clears_it() {
        let registry = PresetRegistry::new();
        registry.add(preset("a"));
        registry.set_default("a").unwrap();
        registry.remove("a");
        assert!(registry.default_preset().is_err());
        registry.remove("a");
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("main.json");

        let registry = PresetRegistry::new();
        let mut original = preset("main");
        original.api_key = "sk-demo".to_string();
        original.config.temperature = 0.3;
        registry.add(original.clone());
        registry.save("main", &path).await.unwrap();

        let other = PresetRegistry::new();
        let loaded = other.load(&path).await.unwrap();
        assert_eq!(loaded, original);
        assert_eq!(other.get("main").unwrap(), original);
    }

    #[tokio::test]
    async fn load_missing_file_fails() {
        let registry = PresetRegistry::new();
        assert!(registry.load("/nonexistent/preset.json").await.is_err());
    }

    #[tokio::test]
    async fn probe_reports_unknown_protocol_as_failure() {
        let registry = PresetRegistry::new();
        let mut p = preset("odd");
        p.protocol = "no-such-protocol".to_string();
        registry.add(p);

        let adapters = AdapterRegistry::new();
        let report = registry
            .probe("odd", &adapters, &AmritaConfig::default())
            .await
            .unwrap();
        assert!(!report.ok);
        assert!(report.message.contains("no-such-protocol"));
    }
}
