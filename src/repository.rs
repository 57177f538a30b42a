use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// Boundary view of a persisted ADO. The repository owns the real record;
/// the core only reads and writes this shape.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Entity {
    /// Repository-assigned numeric id; 0 until created.
    pub id: u64,
    pub uuid: Uuid,
    pub bundle: String,
    pub title: String,
    pub owner: String,
    pub published: bool,
    pub moderation_state: Option<String>,
    /// Multi-valued JSON document fields, keyed by field name.
    pub fields: HashMap<String, Vec<Value>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessOp {
    Update,
    Delete,
}

/// Entity storage capability. Existence and uniqueness checks are
/// read-then-act; races surface as reported errors, never as crashes.
#[async_trait]
pub trait RepositoryStore: Send + Sync {
    async fn find_by_uuid(&self, uuid: &Uuid) -> Result<Option<Entity>>;

    /// Classification of the entity carrying `uuid`, used as the UUID
    /// namespace for its children. `None` when no such entity exists;
    /// implementations fall back to a generic classification for
    /// entities without one of their own.
    async fn find_classification(&self, uuid: &Uuid) -> Result<Option<String>>;

    /// Persist a new entity and return it with its assigned id. Fails on
    /// a uuid collision.
    async fn create(&self, entity: Entity) -> Result<Entity>;

    async fn update(&self, id: u64, entity: Entity) -> Result<()>;

    async fn delete(&self, id: u64) -> Result<()>;

    async fn check_access(&self, entity: &Entity, user: &str, op: AccessOp) -> Result<bool>;
}

impl Entity {
    /// First document stored at `field`, if any.
    pub fn first_document(&self, field: &str) -> Option<&Value> {
        self.fields.get(field).and_then(|docs| docs.first())
    }
}
