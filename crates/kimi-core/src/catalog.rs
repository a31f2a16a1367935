use std::cmp::Ordering;

use kimi_contracts::{ListSearchResult, ListSearchResults, ModelDescriptor};
use serde_json::Value;
use tracing::{debug, warn};

use crate::{KimiError, MoonshotApi};

const BUILTIN_MODELS: &[(&str, &str)] = &[
    ("kimi-k2.5", "kimi-k2.5 (K2.5 Instant)"),
    ("kimi-k2.5-thinking", "kimi-k2.5-thinking (K2.5 Thinking)"),
    ("kimi-k2-0711", "kimi-k2-0711 (K2)"),
    ("kimi-k2-turbo-preview", "kimi-k2-turbo-preview"),
    ("kimi-k2-thinking", "kimi-k2-thinking (K2 Thinking)"),
    ("kimi-k2-thinking-turbo", "kimi-k2-thinking-turbo"),
    ("moonshot-v1-8k", "moonshot-v1-8k"),
    ("moonshot-v1-32k", "moonshot-v1-32k"),
    ("moonshot-v1-128k", "moonshot-v1-128k"),
    ("moonshot-v1-vision", "moonshot-v1-vision"),
    ("moonshot-v1-vision-32k", "moonshot-v1-vision-32k"),
    ("moonshot-v1", "moonshot-v1 (alias)"),
];

/// Model listing with a static fallback used whenever the remote listing fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelCatalog {
    fallback: Vec<ModelDescriptor>,
}

impl ModelCatalog {
    pub fn new(fallback: Vec<ModelDescriptor>) -> Self {
        Self { fallback }
    }

    pub fn builtin() -> Self {
        Self::new(
            BUILTIN_MODELS.iter().map(|(id, name)| ModelDescriptor::new(*id, *name)).collect(),
        )
    }

    pub fn from_ids(ids: &[String]) -> Self {
        Self::new(ids.iter().map(|id| ModelDescriptor::new(id.clone(), id.clone())).collect())
    }

    pub fn fallback(&self) -> &[ModelDescriptor] {
        &self.fallback
    }

    pub async fn search(
        &self,
        api: &dyn MoonshotApi,
        base_url: &str,
        filter: Option<&str>,
    ) -> Vec<ModelDescriptor> {
        let listed = api.list_models(base_url).await.and_then(|body| parse_model_list(&body));
        let models = match listed {
            Ok(models) => {
                debug!(event = "catalog.remote.loaded", base_url, models = models.len());
                models
            }
            Err(err) => {
                warn!(
                    event = "catalog.remote.fallback",
                    base_url,
                    error = %err,
                    fallback_models = self.fallback.len()
                );
                self.fallback.clone()
            }
        };
        filter_and_sort(models, filter)
    }
}

impl Default for ModelCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Maps `{ data: [{ id, ... }] }` to descriptors named after their id.
pub fn parse_model_list(body: &Value) -> Result<Vec<ModelDescriptor>, KimiError> {
    let data = body
        .get("data")
        .and_then(Value::as_array)
        .ok_or_else(|| KimiError::MalformedInput("model listing has no `data` array".to_string()))?;
    Ok(data
        .iter()
        .filter_map(|entry| entry.get("id").and_then(Value::as_str))
        .map(|id| ModelDescriptor::new(id, id))
        .collect())
}

pub fn filter_and_sort(models: Vec<ModelDescriptor>, filter: Option<&str>) -> Vec<ModelDescriptor> {
    let needle = filter.map(str::trim).filter(|value| !value.is_empty()).map(str::to_lowercase);
    let mut models = match needle {
        Some(needle) => models
            .into_iter()
            .filter(|model| {
                model.id.to_lowercase().contains(&needle)
                    || model.name.as_deref().unwrap_or("").to_lowercase().contains(&needle)
            })
            .collect(),
        None => models,
    };
    models.sort_by(|a, b| match a.display_name().cmp(b.display_name()) {
        Ordering::Equal => a.id.cmp(&b.id),
        other => other,
    });
    models
}

pub fn to_search_results(models: &[ModelDescriptor]) -> ListSearchResults {
    ListSearchResults {
        results: models
            .iter()
            .map(|model| ListSearchResult {
                name: model.display_name().to_string(),
                value: model.id.clone(),
            })
            .collect(),
    }
}
