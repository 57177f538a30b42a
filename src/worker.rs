use anyhow::Result;
use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::batch::TabularBatch;
use crate::config::{IngestOp, IngestPlan, StatusValue};
use crate::error::IngestError;
use crate::files::{self, FileResolver};
use crate::merge;
use crate::repository::{AccessOp, Entity, RepositoryStore};
use crate::resolver::{ResolvedObject, Resolution};
use crate::transform::{self, TemplateEngine};

/// Most deliveries a task gets before a missing parent becomes fatal:
/// two requeues, failure on the third attempt.
pub const MAX_ATTEMPTS: u32 = 3;

/// One unit of asynchronous ingest work: a resolved object plus the
/// context the worker needs to turn it into a persisted entity. Created
/// once per valid object; a requeue creates a fresh task with the
/// attempt counter bumped.
#[derive(Clone, Debug)]
pub struct IngestTask {
    pub object: ResolvedObject,
    /// Header -> cell pairs of the backing row.
    pub record: IndexMap<String, String>,
    pub set_id: String,
    pub user_id: String,
    pub attempt: u32,
    pub archive: Option<String>,
    pub plan: Arc<IngestPlan>,
}

/// Terminal state of one delivery.
#[derive(Debug)]
pub enum Outcome {
    Completed,
    Requeued,
    Failed(IngestError),
}

/// Queue capability. The external scheduler delivers one task at a time
/// to the worker; the core only ever pushes to the tail.
#[async_trait]
pub trait IngestQueue: Send + Sync {
    async fn enqueue(&self, task: IngestTask) -> Result<()>;
}

/// Per-row reporting back to the invoking user, keyed by object uuid and
/// set id.
#[async_trait]
pub trait IngestReporter: Send + Sync {
    async fn status(&self, set_id: &str, uuid: &Uuid, message: &str);
    async fn warning(&self, set_id: &str, uuid: &Uuid, message: &str);
    async fn error(&self, set_id: &str, uuid: &Uuid, message: &str);
}

/// Default reporter that forwards everything to the log.
pub struct LogReporter;

#[async_trait]
impl IngestReporter for LogReporter {
    async fn status(&self, set_id: &str, uuid: &Uuid, message: &str) {
        info!("[{}] {}: {}", set_id, uuid, message);
    }

    async fn warning(&self, set_id: &str, uuid: &Uuid, message: &str) {
        warn!("[{}] {}: {}", set_id, uuid, message);
    }

    async fn error(&self, set_id: &str, uuid: &Uuid, message: &str) {
        error!("[{}] {}: {}", set_id, uuid, message);
    }
}

/// One task per valid resolved object, in row order.
pub fn build_tasks(
    resolution: &Resolution,
    batch: &TabularBatch,
    plan: &Arc<IngestPlan>,
    user_id: &str,
) -> Vec<IngestTask> {
    resolution
        .objects
        .values()
        .map(|object| IngestTask {
            object: object.clone(),
            record: batch.record(object.index).unwrap_or_default(),
            set_id: plan.set_id.clone(),
            user_id: user_id.to_string(),
            attempt: 1,
            archive: plan.archive.clone(),
            plan: Arc::clone(plan),
        })
        .collect()
}

/// Queue consumer that converts one resolved row into a persisted
/// entity. Each delivery runs the task through
/// `ParentCheck -> TransformMetadata -> ResolveFiles -> Persist`; the
/// only non-terminal exit is the requeue on a missing parent. Failures
/// are reported and end the task without touching its siblings.
pub struct IngestQueueWorker {
    repo: Arc<dyn RepositoryStore>,
    files: Arc<dyn FileResolver>,
    queue: Arc<dyn IngestQueue>,
    templates: Arc<dyn TemplateEngine>,
    reporter: Arc<dyn IngestReporter>,
}

impl IngestQueueWorker {
    pub fn new(
        repo: Arc<dyn RepositoryStore>,
        files: Arc<dyn FileResolver>,
        queue: Arc<dyn IngestQueue>,
        templates: Arc<dyn TemplateEngine>,
    ) -> Self {
        Self {
            repo,
            files,
            queue,
            templates,
            reporter: Arc::new(LogReporter),
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn IngestReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub async fn process(&self, task: IngestTask) -> Outcome {
        let uuid = task.object.uuid;
        let set_id = task.set_id.clone();

        // ParentCheck: rows arrive in arbitrary order, so a parent made
        // by this same set may simply not be persisted yet.
        let mut parent_entity_id = None;
        if let Some(parent) = task.object.parent {
            match self.repo.find_by_uuid(&parent).await {
                Ok(Some(entity)) => parent_entity_id = Some(entity.id),
                Ok(None) => {
                    if task.attempt < MAX_ATTEMPTS {
                        self.reporter
                            .warning(
                                &set_id,
                                &uuid,
                                &format!(
                                    "parent {} is not in the repository yet (attempt {} of {}), requeueing",
                                    parent, task.attempt, MAX_ATTEMPTS
                                ),
                            )
                            .await;
                        let mut retry = task.clone();
                        retry.attempt += 1;
                        if let Err(e) = self.queue.enqueue(retry).await {
                            self.reporter
                                .error(&set_id, &uuid, &format!("requeue failed: {}", e))
                                .await;
                            return Outcome::Failed(IngestError::Storage(e));
                        }
                        return Outcome::Requeued;
                    }
                    self.reporter
                        .error(
                            &set_id,
                            &uuid,
                            &format!(
                                "parent {} still missing after {} attempts; check that parents \
                                 are in the repository or created by this set",
                                parent, MAX_ATTEMPTS
                            ),
                        )
                        .await;
                    return Outcome::Failed(IngestError::MissingParent { uuid, parent });
                }
                Err(e) => {
                    self.reporter.error(&set_id, &uuid, &e.to_string()).await;
                    return Outcome::Failed(IngestError::Storage(e));
                }
            }
        }

        // TransformMetadata: resolved once per task; ingesting files with
        // no metadata at all is disallowed.
        let strategy = match transform::select_strategy(&task.plan, &task.object.type_value) {
            Ok(strategy) => strategy,
            Err(e) => {
                self.reporter.error(&set_id, &uuid, &e.to_string()).await;
                return Outcome::Failed(e);
            }
        };
        let context = json!({
            "data": task.record,
            "uuid": uuid,
            "type": task.object.type_value,
            "parent": task.object.parent,
            "set_id": set_id,
        });
        let mut metadata = match transform::transform_metadata(
            &strategy,
            &task.record,
            &context,
            self.templates.as_ref(),
        )
        .await
        {
            Ok(metadata) => metadata,
            Err(e) => {
                self.reporter.error(&set_id, &uuid, &e.to_string()).await;
                return Outcome::Failed(e);
            }
        };

        // ResolveFiles. File columns are the union of the configured
        // selection and any mapping the transform embedded itself; the
        // embedded lists move into the bookkeeping so they are not
        // mistaken for metadata.
        let embedded_files = take_string_list(&mut metadata, merge::FILE_MAPPING);
        let embedded_nodes = take_string_list(&mut metadata, merge::NODE_MAPPING);
        let file_columns = union_dedup(
            embedded_files,
            task.plan.files_for_type(&task.object.type_value),
        );
        let node_keys = union_dedup(embedded_nodes, vec![task.plan.parent_property.clone()]);

        if let Some(doc) = metadata.as_object_mut() {
            doc.insert(
                merge::ENTITY_MAPPING_KEY.to_string(),
                json!({
                    (merge::FILE_MAPPING): file_columns,
                    (merge::NODE_MAPPING): node_keys,
                }),
            );
            if let Some(id) = parent_entity_id {
                doc.insert(task.plan.parent_property.clone(), json!([id]));
            }
        }

        for column in &file_columns {
            let Some(cell) = task.record.get(column) else {
                continue;
            };
            let tokens = files::split_file_tokens(cell);
            if tokens.is_empty() {
                continue;
            }
            let mut resolved = Vec::new();
            for token in tokens {
                match self.files.resolve(token, task.archive.as_deref()).await {
                    Ok(Some(file)) => resolved.push(json!(file.id)),
                    Ok(None) => {
                        self.reporter
                            .warning(
                                &set_id,
                                &uuid,
                                &format!(
                                    "file {} at column {} was not found, skipping",
                                    token, column
                                ),
                            )
                            .await;
                    }
                    Err(e) => {
                        self.reporter
                            .warning(
                                &set_id,
                                &uuid,
                                &format!("file {} at column {}: {}", token, column, e),
                            )
                            .await;
                    }
                }
            }
            // The resolved ids fully replace whatever literal value the
            // transform left in the column.
            if let Some(doc) = metadata.as_object_mut() {
                doc.insert(column.clone(), Value::Array(resolved));
            }
        }

        // Persist.
        match self.persist(&task, metadata).await {
            Ok(summary) => {
                self.reporter.status(&set_id, &uuid, &summary).await;
                Outcome::Completed
            }
            Err(e) => {
                self.reporter.error(&set_id, &uuid, &e.to_string()).await;
                Outcome::Failed(e)
            }
        }
    }

    async fn persist(&self, task: &IngestTask, metadata: Value) -> Result<String, IngestError> {
        let op = task.object.op;
        let uuid = task.object.uuid;

        let existing = self
            .repo
            .find_by_uuid(&uuid)
            .await
            .map_err(IngestError::Storage)?;

        let label = metadata
            .get(&task.plan.label_column)
            .and_then(Value::as_str)
            .or_else(|| metadata.get("label").and_then(Value::as_str))
            .unwrap_or_default()
            .to_string();

        match op {
            IngestOp::Create => {
                if existing.is_some() {
                    return Err(IngestError::Conflict(format!(
                        "an entity with uuid {} already exists, refusing to create another",
                        uuid
                    )));
                }
                let (bundle, field_name, _) = parse_bundle_path(
                    task.plan
                        .bundle_for_type(&task.object.type_value)
                        .unwrap_or_default(),
                )?;
                let mut entity = Entity {
                    id: 0,
                    uuid,
                    bundle: bundle.clone(),
                    title: label.clone(),
                    owner: task.user_id.clone(),
                    published: false,
                    moderation_state: None,
                    fields: [(field_name, vec![metadata])].into_iter().collect(),
                };
                apply_status(&mut entity, task.plan.status.get(&bundle));
                self.repo
                    .create(entity)
                    .await
                    .map_err(IngestError::Storage)?;
                Ok(format!("{} with uuid {} was created", label, uuid))
            }
            IngestOp::Delete => {
                let Some(entity) = existing else {
                    return Err(op_on_missing(uuid, op));
                };
                self.check_rights(&entity, task, AccessOp::Delete).await?;
                self.repo
                    .delete(entity.id)
                    .await
                    .map_err(IngestError::Storage)?;
                Ok(format!("{} with uuid {} was deleted", entity.title, uuid))
            }
            IngestOp::Update | IngestOp::Patch => {
                let Some(mut entity) = existing else {
                    return Err(op_on_missing(uuid, op));
                };
                self.check_rights(&entity, task, AccessOp::Update).await?;
                let (bundle, field_name, offset) = parse_bundle_path(
                    task.plan
                        .bundle_for_type(&task.object.type_value)
                        .unwrap_or_default(),
                )?;
                let documents = entity.fields.entry(field_name).or_default();
                if documents.is_empty() {
                    // Nothing stored before, the new document wins whole.
                    documents.push(metadata);
                } else if offset < documents.len() {
                    documents[offset] = merge::reconcile(&documents[offset], &metadata);
                } else {
                    self.reporter
                        .warning(
                            &task.set_id,
                            &uuid,
                            &format!("field slot {} holds no value, leaving the field as it is", offset),
                        )
                        .await;
                }
                apply_status(&mut entity, task.plan.status.get(&bundle));
                let id = entity.id;
                self.repo
                    .update(id, entity)
                    .await
                    .map_err(IngestError::Storage)?;
                Ok(format!("{} with uuid {} was {}", label, uuid, op.past_tense()))
            }
        }
    }

    async fn check_rights(
        &self,
        entity: &Entity,
        task: &IngestTask,
        op: AccessOp,
    ) -> Result<(), IngestError> {
        let allowed = self
            .repo
            .check_access(entity, &task.user_id, op)
            .await
            .map_err(IngestError::Storage)?;
        if allowed {
            Ok(())
        } else {
            Err(IngestError::AccessDenied {
                user: task.user_id.clone(),
                uuid: entity.uuid,
            })
        }
    }
}

fn op_on_missing(uuid: Uuid, op: IngestOp) -> IngestError {
    IngestError::Conflict(format!(
        "no entity with uuid {} exists to be {}",
        uuid,
        op.past_tense()
    ))
}

/// `bundle:field[:offset]` as configured in the mapping.
fn parse_bundle_path(path: &str) -> Result<(String, String, usize), IngestError> {
    let parts: Vec<&str> = path.split(':').collect();
    if parts.len() < 2 || parts[0].is_empty() || parts[1].is_empty() {
        return Err(IngestError::BadConfig(format!(
            "bad bundle property path {:?}",
            path
        )));
    }
    let offset = parts.get(2).and_then(|p| p.parse().ok()).unwrap_or(0);
    Ok((parts[0].to_string(), parts[1].to_string(), offset))
}

fn apply_status(entity: &mut Entity, status: Option<&StatusValue>) {
    match status {
        Some(StatusValue::Moderation(state)) => {
            // The moderation workflow owns the published bit.
            entity.moderation_state = Some(state.clone());
        }
        Some(StatusValue::Published(published)) => {
            entity.published = *published;
        }
        None => {
            entity.published = false;
        }
    }
}

fn take_string_list(metadata: &mut Value, key: &str) -> Vec<String> {
    let Some(doc) = metadata.as_object_mut() else {
        return Vec::new();
    };
    match doc.remove(key) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(String::from)
            .collect(),
        _ => Vec::new(),
    }
}

fn union_dedup(first: Vec<String>, second: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    first
        .into_iter()
        .chain(second)
        .filter(|key| seen.insert(key.clone()))
        .collect()
}
