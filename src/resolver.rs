use anyhow::Result;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::batch::{SourceRow, TabularBatch};
use crate::config::{ColumnRoleMap, IngestOp};
use crate::repository::RepositoryStore;

/// Classification used for UUID minting when a row has no usable type of
/// its own and its parent has none either.
pub const GENERIC_NAMESPACE: &str = "thing";

/// One row resolved into an ingestable object. Immutable once produced;
/// the worker consumes it, never mutates it.
#[derive(Clone, Debug)]
pub struct ResolvedObject {
    pub index: usize,
    pub type_value: String,
    pub uuid: Uuid,
    /// Always a repository UUID after resolution, never a row index.
    pub parent: Option<Uuid>,
    pub namespace: String,
    pub row: SourceRow,
    pub op: IngestOp,
}

/// Per-row classification buckets reported back to the caller. `fatal`
/// is reserved and currently always empty.
#[derive(Clone, Debug, Default)]
pub struct RowReport {
    pub success: Vec<usize>,
    pub error: Vec<usize>,
    pub fatal: Vec<usize>,
}

/// Outcome of resolving one batch: the valid objects keyed by row index
/// and the set of row indices excluded from further processing.
#[derive(Clone, Debug, Default)]
pub struct Resolution {
    pub objects: BTreeMap<usize, ResolvedObject>,
    pub invalid: BTreeSet<usize>,
    pub report: RowReport,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ChainOutcome {
    Valid,
    Invalid,
}

#[derive(Clone, Debug)]
enum ParentRef {
    None,
    External(Uuid),
    Row(usize),
}

struct RowInfo {
    type_value: String,
    namespace: String,
    explicit_uuid: Option<Uuid>,
    parent: ParentRef,
    op: IngestOp,
    row: SourceRow,
}

/// Transient bookkeeping for one resolution: which rows hang off each
/// pending parent key, and the memoised outcome of every chain already
/// walked. Memoisation keeps shared ancestry O(R + E) instead of
/// re-walking it per descendant.
#[derive(Debug, Default)]
struct ParentChainGraph {
    dependents: HashMap<usize, HashSet<usize>>,
    memo: HashMap<usize, ChainOutcome>,
}

/// Resolve an unordered batch of rows into a forest of objects with
/// stable UUIDs and resolved parent links.
///
/// First pass classifies every row and walks parent row indirection with
/// an explicit visited set, invalidating whole chains on cycles and
/// dangling references. The fixup pass propagates invalidity to
/// dependants, mints missing UUIDs (deterministically when the batch has
/// a stable source reference) and replaces row-index parents with the
/// final UUID of the referenced row.
pub async fn resolve(
    batch: &TabularBatch,
    roles: &ColumnRoleMap,
    default_op: IngestOp,
    repo: &dyn RepositoryStore,
) -> Result<Resolution> {
    let mut infos: BTreeMap<usize, RowInfo> = BTreeMap::new();
    let mut invalid: BTreeSet<usize> = BTreeSet::new();
    let mut graph = ParentChainGraph::default();

    // First pass: per-row classification.
    for (&index, row) in &batch.rows {
        if invalid.contains(&index) {
            continue;
        }

        let type_value = row.cell(roles.type_column).to_string();
        let op = roles
            .op_column
            .and_then(|c| IngestOp::parse(row.cell(c)))
            .unwrap_or(default_op);
        let explicit_uuid = Uuid::parse_str(row.cell(roles.uuid_column)).ok();

        match explicit_uuid {
            Some(uuid) if op.targets_existing() => {
                if repo.find_by_uuid(&uuid).await?.is_none() {
                    debug!(
                        "row {}: {:?} requested for {} but no such entity",
                        index, op, uuid
                    );
                    invalid.insert(index);
                    continue;
                }
            }
            None if op.targets_existing() => {
                // Nothing to address: these operations cannot run against
                // a UUID minted on the fly.
                invalid.insert(index);
                continue;
            }
            _ => {}
        }

        let own_namespace = if type_value.is_empty() {
            GENERIC_NAMESPACE.to_string()
        } else {
            type_value.to_lowercase()
        };

        let parent_cell = row.cell(roles.parent_column);
        let (parent, namespace) = if parent_cell.is_empty() {
            (ParentRef::None, own_namespace)
        } else if let Ok(parent_uuid) = Uuid::parse_str(parent_cell) {
            match repo.find_classification(&parent_uuid).await? {
                Some(namespace) => (ParentRef::External(parent_uuid), namespace),
                None => {
                    debug!("row {}: parent {} is not in the repository", index, parent_uuid);
                    invalid.insert(index);
                    continue;
                }
            }
        } else if let Ok(parent_index) = parent_cell.parse::<usize>() {
            if invalid.contains(&parent_index) {
                invalid.insert(index);
                continue;
            }
            graph
                .dependents
                .entry(parent_index)
                .or_default()
                .insert(index);
            match walk_parent_chain(index, parent_index, batch, roles, &mut graph, &mut invalid) {
                ChainOutcome::Valid => (ParentRef::Row(parent_index), own_namespace),
                ChainOutcome::Invalid => continue,
            }
        } else {
            debug!("row {}: parent {:?} is neither a UUID nor a row index", index, parent_cell);
            invalid.insert(index);
            continue;
        };

        infos.insert(
            index,
            RowInfo {
                type_value,
                namespace,
                explicit_uuid,
                parent,
                op,
                row: row.clone(),
            },
        );
    }

    // Fixup: a row invalidated after its dependants were classified drags
    // them down with it.
    let mut work: VecDeque<usize> = invalid.iter().copied().collect();
    while let Some(node) = work.pop_front() {
        if let Some(dependents) = graph.dependents.get(&node) {
            for &dependent in dependents {
                if invalid.insert(dependent) {
                    infos.remove(&dependent);
                    work.push_back(dependent);
                }
            }
        }
    }

    // Second pass: mint UUIDs, then replace row-index parents with the
    // final UUID of the referenced row.
    let mut assigned: HashMap<usize, Uuid> = HashMap::new();
    for (&index, info) in &infos {
        let uuid = info.explicit_uuid.unwrap_or_else(|| {
            mint_uuid(batch.source_ref.as_deref(), &info.namespace, index)
        });
        assigned.insert(index, uuid);
    }

    let mut objects: BTreeMap<usize, ResolvedObject> = BTreeMap::new();
    for (index, info) in infos {
        let parent = match info.parent {
            ParentRef::None => None,
            ParentRef::External(uuid) => Some(uuid),
            ParentRef::Row(parent_index) => match assigned.get(&parent_index) {
                Some(uuid) => Some(*uuid),
                None => {
                    invalid.insert(index);
                    continue;
                }
            },
        };
        objects.insert(
            index,
            ResolvedObject {
                index,
                type_value: info.type_value,
                uuid: assigned[&index],
                parent,
                namespace: info.namespace,
                row: info.row,
                op: info.op,
            },
        );
    }

    let report = RowReport {
        success: objects.keys().copied().collect(),
        error: invalid.iter().copied().collect(),
        fatal: Vec::new(),
    };
    debug!(
        "resolved {} object(s), {} invalid row(s)",
        report.success.len(),
        report.error.len()
    );

    Ok(Resolution {
        objects,
        invalid,
        report,
    })
}

/// Follow parent row indirection from `first_parent` until it reaches a
/// UUID parent, a root, or trouble. Only nodes visited during this walk
/// are invalidated when the walk fails; ancestors proven valid earlier
/// keep their outcome.
fn walk_parent_chain(
    origin: usize,
    first_parent: usize,
    batch: &TabularBatch,
    roles: &ColumnRoleMap,
    graph: &mut ParentChainGraph,
    invalid: &mut BTreeSet<usize>,
) -> ChainOutcome {
    let mut visited: Vec<usize> = Vec::new();
    let mut cursor = first_parent;

    loop {
        if invalid.contains(&cursor) || graph.memo.get(&cursor) == Some(&ChainOutcome::Invalid) {
            return fail_walk(origin, &visited, graph, invalid);
        }
        if graph.memo.get(&cursor) == Some(&ChainOutcome::Valid) {
            // A previous walk already proved this branch; reuse it.
            for &node in &visited {
                graph.memo.insert(node, ChainOutcome::Valid);
            }
            return ChainOutcome::Valid;
        }
        if visited.contains(&cursor) {
            warn!(
                "row {}: parent chain loops at row {}, discarding the whole chain",
                origin, cursor
            );
            return fail_walk(origin, &visited, graph, invalid);
        }

        let Some(row) = batch.rows.get(&cursor) else {
            warn!("row {}: parent row {} does not exist in the batch", origin, cursor);
            invalid.insert(cursor);
            return fail_walk(origin, &visited, graph, invalid);
        };

        visited.push(cursor);
        let parent_cell = row.cell(roles.parent_column);

        if parent_cell.is_empty() {
            // Root object, the chain resolves with no parent.
            for &node in &visited {
                graph.memo.insert(node, ChainOutcome::Valid);
            }
            return ChainOutcome::Valid;
        }
        if Uuid::parse_str(parent_cell).is_ok() {
            // Terminal: an existing repository object. The row's own
            // classification performs the lookup.
            for &node in &visited {
                graph.memo.insert(node, ChainOutcome::Valid);
            }
            return ChainOutcome::Valid;
        }
        match parent_cell.parse::<usize>() {
            Ok(next) => {
                graph.dependents.entry(next).or_default().insert(cursor);
                cursor = next;
            }
            Err(_) => {
                return fail_walk(origin, &visited, graph, invalid);
            }
        }
    }
}

fn fail_walk(
    origin: usize,
    visited: &[usize],
    graph: &mut ParentChainGraph,
    invalid: &mut BTreeSet<usize>,
) -> ChainOutcome {
    for &node in visited.iter().chain(std::iter::once(&origin)) {
        invalid.insert(node);
        graph.memo.insert(node, ChainOutcome::Invalid);
    }
    ChainOutcome::Invalid
}

/// Deterministic UUID when the source has a stable reference, so
/// re-ingesting the same source and range never duplicates objects.
fn mint_uuid(source_ref: Option<&str>, namespace: &str, index: usize) -> Uuid {
    match source_ref {
        Some(source) => Uuid::new_v5(
            &Uuid::NAMESPACE_URL,
            format!("{}/{}#row-{}", source, namespace, index).as_bytes(),
        ),
        None => Uuid::new_v4(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryRepository;
    use crate::repository::Entity;
    use serde_json::json;
    use std::collections::HashMap;

    fn roles() -> ColumnRoleMap {
        ColumnRoleMap {
            type_column: 0,
            parent_column: 1,
            uuid_column: 2,
            op_column: Some(3),
        }
    }

    fn batch_of(rows: &[(&str, &str, &str)]) -> TabularBatch {
        let mut batch = TabularBatch::new(
            vec![
                "type".to_string(),
                "parent".to_string(),
                "uuid".to_string(),
                "op".to_string(),
            ],
            None,
        );
        for (type_value, parent, uuid) in rows {
            batch.push_row(SourceRow::new(vec![
                type_value.to_string(),
                parent.to_string(),
                uuid.to_string(),
            ]));
        }
        batch
    }

    fn entity(uuid: Uuid, type_value: &str) -> Entity {
        let mut fields = HashMap::new();
        fields.insert(
            "descriptive_metadata".to_string(),
            vec![json!({"type": type_value})],
        );
        Entity {
            id: 0,
            uuid,
            bundle: "digital_object".to_string(),
            title: "fixture".to_string(),
            owner: "admin".to_string(),
            published: true,
            moderation_state: None,
            fields,
        }
    }

    #[tokio::test]
    async fn explicit_uuid_is_kept_verbatim() {
        let repo = InMemoryRepository::new();
        let explicit = "9f3e77fa-5d3c-4b66-8c2a-9a4d2e3e1a01";
        let batch = batch_of(&[("Book", "", explicit)]);

        let resolution = resolve(&batch, &roles(), IngestOp::Create, &repo)
            .await
            .unwrap();
        assert_eq!(
            resolution.objects[&0].uuid,
            Uuid::parse_str(explicit).unwrap()
        );
        assert!(resolution.objects[&0].parent.is_none());
    }

    #[tokio::test]
    async fn chain_propagation_links_child_to_final_parent_uuid() {
        let repo = InMemoryRepository::new();
        let batch = batch_of(&[("Book", "", ""), ("Page", "0", "")]);

        let resolution = resolve(&batch, &roles(), IngestOp::Create, &repo)
            .await
            .unwrap();
        let root = &resolution.objects[&0];
        let child = &resolution.objects[&1];
        assert_eq!(child.parent, Some(root.uuid));
        assert!(resolution.invalid.is_empty());
    }

    #[tokio::test]
    async fn cycles_invalidate_the_whole_chain_and_dependants() {
        let repo = InMemoryRepository::new();
        // 0 -> 1 -> 2 -> 0, and 3 hangs off the cycle.
        let batch = batch_of(&[
            ("Book", "1", ""),
            ("Book", "2", ""),
            ("Book", "0", ""),
            ("Page", "0", ""),
        ]);

        let resolution = resolve(&batch, &roles(), IngestOp::Create, &repo)
            .await
            .unwrap();
        assert!(resolution.objects.is_empty());
        for index in 0..4 {
            assert!(resolution.invalid.contains(&index), "row {} should be invalid", index);
        }
    }

    #[tokio::test]
    async fn a_shared_ancestor_survives_a_cycle_elsewhere() {
        let repo = InMemoryRepository::new();
        // 0 is a clean root with child 1; 2 and 3 form a cycle.
        let batch = batch_of(&[
            ("Collection", "", ""),
            ("Book", "0", ""),
            ("Book", "3", ""),
            ("Book", "2", ""),
        ]);

        let resolution = resolve(&batch, &roles(), IngestOp::Create, &repo)
            .await
            .unwrap();
        assert!(resolution.objects.contains_key(&0));
        assert!(resolution.objects.contains_key(&1));
        assert!(resolution.invalid.contains(&2));
        assert!(resolution.invalid.contains(&3));
    }

    #[tokio::test]
    async fn dangling_row_index_invalidates_the_row() {
        let repo = InMemoryRepository::new();
        let batch = batch_of(&[("Book", "9", "")]);

        let resolution = resolve(&batch, &roles(), IngestOp::Create, &repo)
            .await
            .unwrap();
        assert!(resolution.objects.is_empty());
        assert!(resolution.invalid.contains(&0));
        assert!(resolution.invalid.contains(&9));
    }

    #[tokio::test]
    async fn garbage_parent_reference_is_invalid() {
        let repo = InMemoryRepository::new();
        let batch = batch_of(&[("Book", "somebody", "")]);

        let resolution = resolve(&batch, &roles(), IngestOp::Create, &repo)
            .await
            .unwrap();
        assert!(resolution.invalid.contains(&0));
    }

    #[tokio::test]
    async fn update_requires_an_existing_entity() {
        let repo = InMemoryRepository::new();
        let known = Uuid::new_v4();
        repo.insert_fixture(entity(known, "Book")).await;

        let missing = Uuid::new_v4();
        let batch = batch_of(&[
            ("Book", "", &known.to_string()),
            ("Book", "", &missing.to_string()),
            ("Book", "", ""),
        ]);

        let resolution = resolve(&batch, &roles(), IngestOp::Update, &repo)
            .await
            .unwrap();
        assert!(resolution.objects.contains_key(&0));
        assert!(resolution.invalid.contains(&1));
        // No explicit UUID means nothing to update.
        assert!(resolution.invalid.contains(&2));
    }

    #[tokio::test]
    async fn external_parent_namespace_comes_from_its_classification() {
        let repo = InMemoryRepository::new();
        let parent_uuid = Uuid::new_v4();
        repo.insert_fixture(entity(parent_uuid, "Collection")).await;

        let absent = Uuid::new_v4();
        let batch = batch_of(&[
            ("Book", &parent_uuid.to_string(), ""),
            ("Book", &absent.to_string(), ""),
        ]);

        let resolution = resolve(&batch, &roles(), IngestOp::Create, &repo)
            .await
            .unwrap();
        let object = &resolution.objects[&0];
        assert_eq!(object.parent, Some(parent_uuid));
        assert_eq!(object.namespace, "Collection");
        assert!(resolution.invalid.contains(&1));
    }

    #[tokio::test]
    async fn resolution_is_idempotent_for_stable_sources() {
        let repo = InMemoryRepository::new();
        let explicit = "9f3e77fa-5d3c-4b66-8c2a-9a4d2e3e1a01";
        let mut batch = batch_of(&[("Book", "", explicit), ("Page", "0", "")]);
        batch.source_ref = Some("https://example.org/sheets/42".to_string());

        let first = resolve(&batch, &roles(), IngestOp::Create, &repo)
            .await
            .unwrap();
        let second = resolve(&batch, &roles(), IngestOp::Create, &repo)
            .await
            .unwrap();

        assert_eq!(first.objects[&0].uuid, second.objects[&0].uuid);
        assert_eq!(first.objects[&1].uuid, second.objects[&1].uuid);
        assert_eq!(
            first.objects[&0].uuid,
            Uuid::parse_str(explicit).unwrap()
        );
    }

    #[tokio::test]
    async fn late_invalidation_drags_down_already_classified_children() {
        let repo = InMemoryRepository::new();
        let child_uuid = Uuid::new_v4();
        repo.insert_fixture(entity(child_uuid, "Page")).await;

        // Row 0 is a valid update of an existing entity, but it hangs off
        // row 2, whose own update check fails only once row 2 is reached.
        let missing = Uuid::new_v4();
        let mut batch = TabularBatch::new(
            vec![
                "type".to_string(),
                "parent".to_string(),
                "uuid".to_string(),
                "op".to_string(),
            ],
            None,
        );
        batch.push_row(SourceRow::new(vec![
            "Page".to_string(),
            "2".to_string(),
            child_uuid.to_string(),
            "update".to_string(),
        ]));
        batch.push_row(SourceRow::new(vec![
            "Book".to_string(),
            String::new(),
            String::new(),
            "create".to_string(),
        ]));
        batch.push_row(SourceRow::new(vec![
            "Book".to_string(),
            String::new(),
            missing.to_string(),
            "update".to_string(),
        ]));

        let resolution = resolve(&batch, &roles(), IngestOp::Create, &repo)
            .await
            .unwrap();
        assert!(resolution.invalid.contains(&2));
        assert!(resolution.invalid.contains(&0));
        assert!(resolution.objects.contains_key(&1));
        assert!(!resolution.objects.contains_key(&0));
    }

    #[tokio::test]
    async fn report_buckets_mirror_objects_and_invalid() {
        let repo = InMemoryRepository::new();
        let batch = batch_of(&[("Book", "", ""), ("Book", "9", "")]);

        let resolution = resolve(&batch, &roles(), IngestOp::Create, &repo)
            .await
            .unwrap();
        assert_eq!(resolution.report.success, vec![0]);
        assert!(resolution.report.error.contains(&1));
        assert!(resolution.report.fatal.is_empty());
    }
}
