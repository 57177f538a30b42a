use anyhow::Result;
use async_trait::async_trait;
use handlebars::{handlebars_helper, Handlebars};
use indexmap::IndexMap;
use serde_json::{Map, Value};

use crate::config::{IngestPlan, MappingMethod};
use crate::error::IngestError;

/// Metadata strategy for one task, resolved once from the mapping
/// configuration. `custom` scoping collapses to one of these per row
/// type before any work happens.
#[derive(Clone, Debug, PartialEq)]
pub enum TransformStrategy {
    /// The row's own data, expanded into a JSON document.
    Direct,
    /// Delegate to a rendering template addressed by id.
    Template(String),
}

/// Pick the strategy for a row type. Under `custom`, an unmapped type
/// falls back to `direct`.
pub fn select_strategy(
    plan: &IngestPlan,
    row_type: &str,
) -> Result<TransformStrategy, IngestError> {
    match plan.mapping.method {
        MappingMethod::Direct => Ok(TransformStrategy::Direct),
        MappingMethod::Template => plan
            .mapping
            .template
            .clone()
            .map(TransformStrategy::Template)
            .ok_or_else(|| {
                IngestError::BadConfig("template method without a template id".to_string())
            }),
        MappingMethod::Custom => match plan.mapping.per_type.get(row_type) {
            None => Ok(TransformStrategy::Direct),
            Some(mapping) => match mapping.method {
                MappingMethod::Template => mapping
                    .template
                    .clone()
                    .map(TransformStrategy::Template)
                    .ok_or_else(|| {
                        IngestError::BadConfig(format!(
                            "type {} is mapped to a template but names none",
                            row_type
                        ))
                    }),
                _ => Ok(TransformStrategy::Direct),
            },
        },
    }
}

/// Rendering capability behind the `template` strategy.
#[async_trait]
pub trait TemplateEngine: Send + Sync {
    async fn render(&self, template_id: &str, context: &Value) -> Result<String>;
}

/// Handlebars-backed default engine. Templates are registered by id up
/// front; rendering an unknown id fails the transform.
pub struct HandlebarsEngine {
    registry: Handlebars<'static>,
}

impl HandlebarsEngine {
    pub fn new() -> Self {
        let mut registry = Handlebars::new();

        handlebars_helper!(exists: |v: Value| !v.is_null());
        registry.register_helper("exists", Box::new(exists));

        handlebars_helper!(isnull: |v: Value| v.is_null());
        registry.register_helper("isnull", Box::new(isnull));

        handlebars_helper!(stringeq: |s1: String, s2: String| s1.eq(&s2));
        registry.register_helper("stringeq", Box::new(stringeq));

        Self { registry }
    }

    pub fn register(&mut self, id: &str, source: &str) -> Result<()> {
        self.registry.register_template_string(id, source)?;
        Ok(())
    }
}

impl Default for HandlebarsEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TemplateEngine for HandlebarsEngine {
    async fn render(&self, template_id: &str, context: &Value) -> Result<String> {
        Ok(self.registry.render(template_id, context)?)
    }
}

/// Expand a header -> cell record into a JSON document. Empty cells are
/// dropped; cells carrying embedded JSON arrays or objects (from upstream
/// exports) are parsed in place.
pub fn expand_row_document(record: &IndexMap<String, String>) -> Value {
    let mut doc = Map::new();
    for (key, raw) in record {
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        doc.insert(key.clone(), expand_cell(raw));
    }
    Value::Object(doc)
}

fn expand_cell(raw: &str) -> Value {
    if raw.starts_with('{') || raw.starts_with('[') {
        if let Ok(value) = serde_json::from_str(raw) {
            return value;
        }
    }
    Value::String(raw.to_string())
}

/// Run the selected strategy and canonicalize the result. Ingesting
/// without metadata is disallowed, so an empty document is an error, not
/// a degenerate success.
pub async fn transform_metadata(
    strategy: &TransformStrategy,
    record: &IndexMap<String, String>,
    context: &Value,
    engine: &dyn TemplateEngine,
) -> Result<Value, IngestError> {
    let document = match strategy {
        TransformStrategy::Direct => expand_row_document(record),
        TransformStrategy::Template(id) => {
            let rendered = engine
                .render(id, context)
                .await
                .map_err(|e| IngestError::Transform(e.to_string()))?;
            serde_json::from_str(&rendered)
                .map_err(|e| IngestError::Transform(format!("template {}: {}", id, e)))?
        }
    };

    match document.as_object() {
        Some(map) if !map.is_empty() => Ok(document),
        _ => Err(IngestError::EmptyMetadata),
    }
}
