//! Flattening of a root document into a self-contained export record.
//!
//! Every node in the export carries a `_key` of the form
//! `!<collection-path>!<id>`, where the collection path is the dot-joined
//! chain of collection names from the root down to that node:
//!
//! ```text
//! actors                 !actors!<actorId>
//! └─ items               !actors.items!<itemId>
//!    └─ effects          !actors.items.effects!<effectId>
//! ```

use crate::document::{Document, Record};
use serde_json::Value;

/// Field holding the composite key.
pub const KEY_FIELD: &str = "_key";

/// Build a composite key from a collection-name path and the node's id.
pub fn composite_key(path: &[&str], id: &str) -> String {
    format!("!{}!{}", path.join("."), id)
}

/// Flatten a root document and all of its embedded descendants.
pub fn flatten<D: Document>(root: &D) -> Record {
    let mut path = vec![root.collection_name().to_string()];
    flatten_node(root, &mut path)
}

fn flatten_node<D: Document>(document: &D, path: &mut Vec<String>) -> Record {
    let mut json = document.to_json();
    let segments: Vec<&str> = path.iter().map(String::as_str).collect();
    json.insert(
        KEY_FIELD.to_string(),
        Value::String(composite_key(&segments, document.id())),
    );

    for collection in document.collections() {
        let records = collection
            .contents
            .iter()
            .map(|child| {
                path.push(child.collection_name().to_string());
                let record = flatten_node(child, path);
                path.pop();
                Value::Object(record)
            })
            .collect();
        json.insert(collection.name, Value::Array(records));
    }

    json
}
