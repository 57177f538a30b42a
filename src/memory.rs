use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::files::{FileRef, FileResolver};
use crate::repository::{AccessOp, Entity, RepositoryStore};
use crate::resolver::GENERIC_NAMESPACE;
use crate::worker::{IngestQueue, IngestQueueWorker, IngestReporter, IngestTask, Outcome};

/// Map-backed repository used by the simulate mode and the tests.
pub struct InMemoryRepository {
    inner: Mutex<RepoInner>,
}

struct RepoInner {
    entities: HashMap<Uuid, Entity>,
    next_id: u64,
    denied: HashSet<String>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RepoInner {
                entities: HashMap::new(),
                next_id: 1,
                denied: HashSet::new(),
            }),
        }
    }

    /// Seed an entity without going through the worker.
    pub async fn insert_fixture(&self, mut entity: Entity) {
        let mut inner = self.inner.lock().await;
        if entity.id == 0 {
            entity.id = inner.next_id;
            inner.next_id += 1;
        }
        inner.entities.insert(entity.uuid, entity);
    }

    /// Revoke every modification right of a user.
    pub async fn deny_user(&self, user: &str) {
        self.inner.lock().await.denied.insert(user.to_string());
    }

    pub async fn get(&self, uuid: &Uuid) -> Option<Entity> {
        self.inner.lock().await.entities.get(uuid).cloned()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entities.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for InMemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RepositoryStore for InMemoryRepository {
    async fn find_by_uuid(&self, uuid: &Uuid) -> Result<Option<Entity>> {
        Ok(self.inner.lock().await.entities.get(uuid).cloned())
    }

    async fn find_classification(&self, uuid: &Uuid) -> Result<Option<String>> {
        let inner = self.inner.lock().await;
        let Some(entity) = inner.entities.get(uuid) else {
            return Ok(None);
        };
        let classification = entity
            .fields
            .values()
            .flatten()
            .find_map(|doc| doc.get("type").and_then(Value::as_str))
            .unwrap_or(GENERIC_NAMESPACE)
            .to_string();
        Ok(Some(classification))
    }

    async fn create(&self, mut entity: Entity) -> Result<Entity> {
        let mut inner = self.inner.lock().await;
        if inner.entities.contains_key(&entity.uuid) {
            bail!("an entity with uuid {} already exists", entity.uuid);
        }
        entity.id = inner.next_id;
        inner.next_id += 1;
        inner.entities.insert(entity.uuid, entity.clone());
        Ok(entity)
    }

    async fn update(&self, id: u64, entity: Entity) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let Some(uuid) = inner
            .entities
            .values()
            .find(|e| e.id == id)
            .map(|e| e.uuid)
        else {
            bail!("no entity with id {}", id);
        };
        inner.entities.insert(uuid, Entity { id, ..entity });
        Ok(())
    }

    async fn delete(&self, id: u64) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let Some(uuid) = inner
            .entities
            .values()
            .find(|e| e.id == id)
            .map(|e| e.uuid)
        else {
            bail!("no entity with id {}", id);
        };
        inner.entities.remove(&uuid);
        Ok(())
    }

    async fn check_access(&self, _entity: &Entity, user: &str, _op: AccessOp) -> Result<bool> {
        Ok(!self.inner.lock().await.denied.contains(user))
    }
}

/// FIFO queue; requeued tasks land at the tail, exactly like the external
/// scheduler's.
pub struct InMemoryQueue {
    inner: Mutex<VecDeque<IngestTask>>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
        }
    }

    pub async fn pop(&self) -> Option<IngestTask> {
        self.inner.lock().await.pop_front()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Deliver tasks to the worker until the queue runs dry, requeues
    /// included. Stands in for the external scheduler in tests and the
    /// simulate mode.
    pub async fn drain(&self, worker: &IngestQueueWorker) -> Vec<Outcome> {
        let mut outcomes = Vec::new();
        while let Some(task) = self.pop().await {
            outcomes.push(worker.process(task).await);
        }
        outcomes
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IngestQueue for InMemoryQueue {
    async fn enqueue(&self, task: IngestTask) -> Result<()> {
        self.inner.lock().await.push_back(task);
        Ok(())
    }
}

/// Token -> file lookup over a fixed table. Archive-scoped entries are
/// keyed `archive/token` and win over bare tokens.
pub struct StaticFileResolver {
    files: Mutex<HashMap<String, FileRef>>,
}

impl StaticFileResolver {
    pub fn new() -> Self {
        Self {
            files: Mutex::new(HashMap::new()),
        }
    }

    pub async fn insert(&self, token: &str, id: u64, uri: &str) {
        self.files.lock().await.insert(
            token.to_string(),
            FileRef {
                id,
                uri: uri.to_string(),
            },
        );
    }
}

impl Default for StaticFileResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FileResolver for StaticFileResolver {
    async fn resolve(&self, token: &str, archive: Option<&str>) -> Result<Option<FileRef>> {
        let files = self.files.lock().await;
        if let Some(archive) = archive {
            if let Some(file) = files.get(&format!("{}/{}", archive, token)) {
                return Ok(Some(file.clone()));
            }
        }
        Ok(files.get(token).cloned())
    }
}

/// Reporter that keeps every message, for assertions and summaries.
pub struct CollectingReporter {
    messages: Mutex<Vec<(String, String)>>,
}

impl CollectingReporter {
    pub fn new() -> Self {
        Self {
            messages: Mutex::new(Vec::new()),
        }
    }

    pub async fn warnings(&self) -> Vec<String> {
        self.by_level("warning").await
    }

    pub async fn errors(&self) -> Vec<String> {
        self.by_level("error").await
    }

    pub async fn statuses(&self) -> Vec<String> {
        self.by_level("status").await
    }

    async fn by_level(&self, level: &str) -> Vec<String> {
        self.messages
            .lock()
            .await
            .iter()
            .filter(|(l, _)| l == level)
            .map(|(_, m)| m.clone())
            .collect()
    }

    async fn record(&self, level: &str, set_id: &str, uuid: &Uuid, message: &str) {
        self.messages
            .lock()
            .await
            .push((level.to_string(), format!("[{}] {}: {}", set_id, uuid, message)));
    }
}

impl Default for CollectingReporter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IngestReporter for CollectingReporter {
    async fn status(&self, set_id: &str, uuid: &Uuid, message: &str) {
        self.record("status", set_id, uuid, message).await;
    }

    async fn warning(&self, set_id: &str, uuid: &Uuid, message: &str) {
        self.record("warning", set_id, uuid, message).await;
    }

    async fn error(&self, set_id: &str, uuid: &Uuid, message: &str) {
        self.record("error", set_id, uuid, message).await;
    }
}
