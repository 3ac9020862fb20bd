//! Model catalog: the list of models an adapter can offer.

use serde::{Deserialize, Serialize};

/// A catalog entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogRecord {
    /// Model identifier passed to engine construction.
    pub model_id: String,

    /// Approximate VRAM needed to run the model, in MB.
    #[serde(default)]
    pub vram_required_mb: f64,

    /// Whether the model fits low-resource devices.
    #[serde(default)]
    pub low_resource_required: bool,
}

impl CatalogRecord {
    pub fn new(model_id: impl Into<String>, vram_required_mb: f64, low_resource: bool) -> Self {
        Self {
            model_id: model_id.into(),
            vram_required_mb,
            low_resource_required: low_resource,
        }
    }
}

/// Source of available models.
pub trait ModelCatalog: Send + Sync {
    /// All known models, in display order.
    fn list_models(&self) -> Vec<CatalogRecord>;

    /// Look up a single model by id.
    fn find(&self, model_id: &str) -> Option<CatalogRecord> {
        self.list_models()
            .into_iter()
            .find(|r| r.model_id == model_id)
    }
}

/// A fixed, in-memory catalog.
#[derive(Debug, Clone)]
pub struct StaticCatalog {
    records: Vec<CatalogRecord>,
}

impl StaticCatalog {
    pub fn new(records: Vec<CatalogRecord>) -> Self {
        Self { records }
    }

    /// Use `records` if any are configured, else the prebuilt list.
    pub fn from_records_or_prebuilt(records: &[CatalogRecord]) -> Self {
        if records.is_empty() {
            Self::prebuilt()
        } else {
            Self::new(records.to_vec())
        }
    }

    /// Models shipped with the adapter.
    pub fn prebuilt() -> Self {
        Self::new(vec![
            CatalogRecord::new("Llama-3-8B-Instruct-q4f32_1-MLC", 6101.01, false),
            CatalogRecord::new("Llama-3-8B-Instruct-q4f16_1-MLC", 5001.0, false),
            CatalogRecord::new("Phi-3-mini-4k-instruct-q4f16_1-MLC", 3672.07, false),
            CatalogRecord::new("Mistral-7B-Instruct-v0.2-q4f16_1-MLC", 6079.02, false),
            CatalogRecord::new("gemma-2b-it-q4f16_1-MLC", 1476.52, false),
            CatalogRecord::new("TinyLlama-1.1B-Chat-v0.4-q4f16_1-MLC", 697.24, true),
        ])
    }
}

impl ModelCatalog for StaticCatalog {
    fn list_models(&self) -> Vec<CatalogRecord> {
        self.records.clone()
    }
}
