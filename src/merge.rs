use serde_json::{json, Value};
use std::collections::HashSet;
use tracing::debug;

/// Metadata key holding the entity-mapping bookkeeping: which metadata
/// fields carry file-entity vs node-entity references.
pub const ENTITY_MAPPING_KEY: &str = "entitymapping";
pub const FILE_MAPPING: &str = "entity:file";
pub const NODE_MAPPING: &str = "entity:node";

/// Attachment-type keys copied verbatim from the previous document when a
/// patch does not address them. Downstream persistence drops the ones
/// that end up redundant.
pub const ATTACHMENT_KEYS: [&str; 7] = [
    "as:image",
    "as:document",
    "as:audio",
    "as:video",
    "as:text",
    "as:application",
    "as:model",
];

/// Reconcile the incoming document for one multi-value slot against the
/// value previously stored there.
///
/// The structural diff is computed for observability only and never
/// applied. Entity-mapping keys present in `previous` but absent from
/// `incoming` are carried forward together with their values, so a
/// partial update unions historical and new attachments instead of
/// clobbering them.
pub fn reconcile(previous: &Value, incoming: &Value) -> Value {
    let mut merged = incoming.clone();

    let diff = json_patch::diff(previous, incoming);
    debug!("slot reconcile produced {} diff operation(s)", diff.0.len());

    for list_key in [FILE_MAPPING, NODE_MAPPING] {
        for key in mapping_list(previous, list_key) {
            if !mapping_list(&merged, list_key).contains(&key) {
                let value = previous.get(&key).cloned().unwrap_or_else(|| json!([]));
                if let Some(doc) = merged.as_object_mut() {
                    doc.insert(key.clone(), value);
                }
                push_mapping(&mut merged, list_key, key);
            }
        }
        dedup_mapping(&mut merged, list_key);
    }

    for key in ATTACHMENT_KEYS {
        if let Some(value) = previous.get(key) {
            if let Some(doc) = merged.as_object_mut() {
                doc.insert(key.to_string(), value.clone());
            }
        }
    }

    merged
}

/// The named entity-mapping list of a document, empty when absent.
fn mapping_list(doc: &Value, which: &str) -> Vec<String> {
    doc.get(ENTITY_MAPPING_KEY)
        .and_then(|m| m.get(which))
        .and_then(Value::as_array)
        .map(|list| {
            list.iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

fn push_mapping(doc: &mut Value, which: &str, key: String) {
    let Some(root) = doc.as_object_mut() else {
        return;
    };
    let mapping = root
        .entry(ENTITY_MAPPING_KEY)
        .or_insert_with(|| json!({}));
    let Some(mapping) = mapping.as_object_mut() else {
        return;
    };
    let list = mapping.entry(which).or_insert_with(|| json!([]));
    if let Some(list) = list.as_array_mut() {
        list.push(Value::String(key));
    }
}

fn dedup_mapping(doc: &mut Value, which: &str) {
    let Some(list) = doc
        .get_mut(ENTITY_MAPPING_KEY)
        .and_then(|m| m.get_mut(which))
        .and_then(Value::as_array_mut)
    else {
        return;
    };
    let mut seen = HashSet::new();
    list.retain(|v| match v.as_str() {
        Some(s) => seen.insert(s.to_string()),
        None => true,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unions_entity_mapping_and_carries_values() {
        let previous = json!({
            "entitymapping": {"entity:file": ["imgcol"]},
            "imgcol": [1, 2]
        });
        let incoming = json!({
            "entitymapping": {"entity:file": ["pdfcol"]},
            "pdfcol": [9]
        });

        let merged = reconcile(&previous, &incoming);
        let files = merged["entitymapping"]["entity:file"].as_array().unwrap();
        assert!(files.contains(&json!("imgcol")));
        assert!(files.contains(&json!("pdfcol")));
        assert_eq!(merged["imgcol"], json!([1, 2]));
        assert_eq!(merged["pdfcol"], json!([9]));
    }

    #[test]
    fn incoming_values_win_for_keys_it_already_maps() {
        let previous = json!({
            "entitymapping": {"entity:file": ["imgcol"]},
            "imgcol": [1]
        });
        let incoming = json!({
            "entitymapping": {"entity:file": ["imgcol"]},
            "imgcol": [7, 8]
        });

        let merged = reconcile(&previous, &incoming);
        assert_eq!(merged["imgcol"], json!([7, 8]));
        assert_eq!(
            merged["entitymapping"]["entity:file"],
            json!(["imgcol"])
        );
    }

    #[test]
    fn carried_key_without_previous_value_becomes_empty_list() {
        let previous = json!({
            "entitymapping": {"entity:node": ["member_of"]}
        });
        let incoming = json!({"label": "x"});

        let merged = reconcile(&previous, &incoming);
        assert_eq!(merged["member_of"], json!([]));
        assert_eq!(
            merged["entitymapping"]["entity:node"],
            json!(["member_of"])
        );
    }

    #[test]
    fn mapping_lists_are_deduplicated() {
        let previous = json!({
            "entitymapping": {"entity:file": ["a"]},
            "a": [1]
        });
        let incoming = json!({
            "entitymapping": {"entity:file": ["b", "b"]},
            "b": [2]
        });

        let merged = reconcile(&previous, &incoming);
        assert_eq!(
            merged["entitymapping"]["entity:file"],
            json!(["b", "a"])
        );
    }

    #[test]
    fn attachment_type_keys_survive_a_partial_patch() {
        let previous = json!({
            "as:image": {"img1": {"checksum": "abc"}},
            "label": "old"
        });
        let incoming = json!({"label": "new"});

        let merged = reconcile(&previous, &incoming);
        assert_eq!(merged["as:image"], previous["as:image"]);
        assert_eq!(merged["label"], json!("new"));
    }
}
