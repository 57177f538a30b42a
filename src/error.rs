use thiserror::Error;
use uuid::Uuid;

/// Per-task failure taxonomy. Every variant is reported to the invoking
/// user through the `IngestReporter` and ends the task; none of them abort
/// sibling tasks in the same set. Unresolvable file tokens are warnings,
/// not errors, and do not appear here.
#[derive(Debug, Error)]
pub enum IngestError {
    /// A declared parent is not in the repository yet. Recoverable by
    /// bounded requeue; becomes fatal for the task once attempts run out.
    #[error("parent {parent} of object {uuid} is not in the repository")]
    MissingParent { uuid: Uuid, parent: Uuid },

    #[error("metadata transform failed: {0}")]
    Transform(String),

    #[error("transform produced no usable metadata")]
    EmptyMetadata,

    #[error("{0}")]
    Conflict(String),

    #[error("user {user} has no rights to modify entity {uuid}")]
    AccessDenied { user: String, uuid: Uuid },

    #[error("bad ingest plan: {0}")]
    BadConfig(String),

    #[error("repository fault: {0}")]
    Storage(#[source] anyhow::Error),
}
