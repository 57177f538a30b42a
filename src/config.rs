use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// ## Structure
/// Configuration for one ingest set.
///
/// ```text
/// IngestPlan
///   ├── set_id
///   ├── op: IngestOp (default for rows without an operation cell)
///   ├── columns: ColumnRoleMap
///   ├── mapping: MappingConfig
///   │   ├── method: direct | template | custom
///   │   ├── template / files / bundle (global scope)
///   │   └── per_type: row type -> TypeMapping (custom scope)
///   ├── parent_property / label_column
///   ├── status: bundle -> bool (published) or string (moderation state)
///   ├── templates: template id -> handlebars source
///   └── archive: optional archive scope for file tokens
/// ```

/// Operation requested for an object.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IngestOp {
    #[default]
    Create,
    Update,
    Patch,
    Delete,
}

impl IngestOp {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "create" => Some(Self::Create),
            "update" => Some(Self::Update),
            "patch" => Some(Self::Patch),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }

    pub fn past_tense(&self) -> &'static str {
        match self {
            Self::Create => "created",
            Self::Update => "updated",
            Self::Patch => "patched",
            Self::Delete => "deleted",
        }
    }

    /// Operations that address a pre-existing entity.
    pub fn targets_existing(&self) -> bool {
        !matches!(self, Self::Create)
    }
}

/// Logical column roles mapped to column indices. Provided externally;
/// never mutated by the resolver.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ColumnRoleMap {
    pub type_column: usize,
    pub parent_column: usize,
    pub uuid_column: usize,
    #[serde(default)]
    pub op_column: Option<usize>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MappingMethod {
    #[default]
    Direct,
    Template,
    Custom,
}

/// Per-row-type mapping override, used when the global method is `custom`.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct TypeMapping {
    #[serde(default)]
    pub method: MappingMethod,
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub bundle: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct MappingConfig {
    #[serde(default)]
    pub method: MappingMethod,
    /// Template id for the `template` method.
    #[serde(default)]
    pub template: Option<String>,
    /// Column headers holding file references (global scope).
    #[serde(default)]
    pub files: Vec<String>,
    /// Target property path `bundle:field[:offset]` (global scope).
    #[serde(default)]
    pub bundle: Option<String>,
    /// Row type -> mapping override (custom scope).
    #[serde(default)]
    pub per_type: HashMap<String, TypeMapping>,
}

/// Publish status for a bundle: a bare boolean publishes/unpublishes, a
/// string hands the entity to a moderation workflow instead.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum StatusValue {
    Published(bool),
    Moderation(String),
}

fn default_parent_property() -> String {
    "member_of".to_string()
}

fn default_label_column() -> String {
    "label".to_string()
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct IngestPlan {
    pub set_id: String,
    #[serde(default)]
    pub op: IngestOp,
    pub columns: ColumnRoleMap,
    #[serde(default)]
    pub mapping: MappingConfig,
    /// Metadata key that receives resolved parent entity ids.
    #[serde(default = "default_parent_property")]
    pub parent_property: String,
    /// Metadata key the entity title is read from.
    #[serde(default = "default_label_column")]
    pub label_column: String,
    /// Per-bundle publish/moderation status applied on persist.
    #[serde(default)]
    pub status: HashMap<String, StatusValue>,
    /// Inline handlebars templates, registered by id at startup.
    #[serde(default)]
    pub templates: HashMap<String, String>,
    /// Archive scope handed to the file resolver for every token.
    #[serde(default)]
    pub archive: Option<String>,
}

impl IngestPlan {
    /// File columns for a row type: the per-type selection under `custom`,
    /// the global selection otherwise. An unmapped type under `custom` has
    /// no configured file columns.
    pub fn files_for_type(&self, row_type: &str) -> Vec<String> {
        match self.mapping.method {
            MappingMethod::Custom => self
                .mapping
                .per_type
                .get(row_type)
                .map(|t| t.files.clone())
                .unwrap_or_default(),
            _ => self.mapping.files.clone(),
        }
    }

    /// Bundle property path for a row type, same scoping rules as
    /// [`files_for_type`](Self::files_for_type).
    pub fn bundle_for_type(&self, row_type: &str) -> Option<&str> {
        match self.mapping.method {
            MappingMethod::Custom => self
                .mapping
                .per_type
                .get(row_type)
                .and_then(|t| t.bundle.as_deref()),
            _ => self.mapping.bundle.as_deref(),
        }
    }
}
