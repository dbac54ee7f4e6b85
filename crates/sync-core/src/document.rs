//! Host document model as seen by the synchronizer.
//!
//! The host application owns its documents; the synchronizer only needs to
//! walk them. `Document` is that read-only view, and `MemoryDocument` is an
//! in-memory implementation used by tests and by adapters that mirror the
//! host tree into Rust.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::{Arc, RwLock, Weak};

/// JSON object form of a document.
pub type Record = Map<String, Value>;

/// Metadata of a compendium pack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackMetadata {
    /// Collection id, `<packageName>.<name>`
    pub id: String,
    /// Human-readable pack name, used as the on-disk directory
    pub name: String,
    /// Package that owns the pack
    pub package_name: String,
}

impl PackMetadata {
    pub fn new(package_name: &str, name: &str) -> Self {
        Self {
            id: format!("{}.{}", package_name, name),
            name: name.to_string(),
            package_name: package_name.to_string(),
        }
    }

    /// Whether this pack belongs to the given module.
    pub fn is_managed_by(&self, module_id: &str) -> bool {
        self.package_name == module_id
    }
}

/// A named sub-collection of embedded documents.
#[derive(Debug, Clone)]
pub struct EmbeddedCollection<D> {
    /// Field name on the parent's JSON form (e.g. "items")
    pub name: String,
    /// Child documents in collection order
    pub contents: Vec<D>,
}

/// Read-only view of a host document.
///
/// Implementations are cheap handles: `parent()` and `collections()` return
/// owned handles onto the same underlying tree.
pub trait Document: Clone + Send + Sync {
    /// Stable identifier
    fn id(&self) -> &str;

    /// Collection-type name (e.g. "actors", "items", "effects")
    fn collection_name(&self) -> &str;

    /// Own serialized form, without embedded collections inlined
    fn to_json(&self) -> Record;

    /// Named sub-collections, in a stable order
    fn collections(&self) -> Vec<EmbeddedCollection<Self>>;

    /// Owning document, if embedded
    fn parent(&self) -> Option<Self>;

    /// Collection id of the pack this document lives in
    fn pack(&self) -> Option<String>;

    /// Host-wide reference, e.g. `Compendium.<module>.<pack>.Item.<id>`
    fn uuid(&self) -> String;
}

struct Node {
    id: String,
    collection_name: String,
    document_name: String,
    data: RwLock<Record>,
    pack: Option<String>,
    parent: RwLock<Weak<Node>>,
    collections: RwLock<Vec<(String, Vec<Arc<Node>>)>>,
}

/// In-memory document tree node.
#[derive(Clone)]
pub struct MemoryDocument {
    node: Arc<Node>,
}

impl std::fmt::Debug for MemoryDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryDocument")
            .field("id", &self.node.id)
            .field("collection_name", &self.node.collection_name)
            .finish()
    }
}

impl MemoryDocument {
    /// Create a root document.
    ///
    /// `document_name` is the class name used in uuids (e.g. "Item"),
    /// `collection_name` the collection it is stored in (e.g. "items").
    pub fn new(
        document_name: &str,
        collection_name: &str,
        pack: Option<&str>,
        data: Value,
    ) -> Self {
        let mut data = match data {
            Value::Object(map) => map,
            _ => Record::new(),
        };
        let id = data
            .get("_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        data.insert("_id".into(), Value::String(id.clone()));

        Self {
            node: Arc::new(Node {
                id,
                collection_name: collection_name.to_string(),
                document_name: document_name.to_string(),
                data: RwLock::new(data),
                pack: pack.map(str::to_string),
                parent: RwLock::new(Weak::new()),
                collections: RwLock::new(Vec::new()),
            }),
        }
    }

    /// Declare an (initially empty) sub-collection.
    pub fn add_collection(&self, name: &str) {
        let mut collections = self.node.collections.write().unwrap();
        if !collections.iter().any(|(n, _)| n == name) {
            collections.push((name.to_string(), Vec::new()));
        }
    }

    /// Embed a child under the named collection, creating it if needed.
    ///
    /// The child inherits this document's pack.
    pub fn embed(&self, collection: &str, document_name: &str, data: Value) -> MemoryDocument {
        let child = MemoryDocument::new(
            document_name,
            collection,
            self.node.pack.as_deref(),
            data,
        );
        *child.node.parent.write().unwrap() = Arc::downgrade(&self.node);

        self.add_collection(collection);
        let mut collections = self.node.collections.write().unwrap();
        if let Some((_, contents)) = collections.iter_mut().find(|(n, _)| n == collection) {
            contents.push(Arc::clone(&child.node));
        }
        child
    }

    /// Remove an embedded child by id from any collection.
    pub fn remove_embedded(&self, id: &str) -> bool {
        let mut collections = self.node.collections.write().unwrap();
        for (_, contents) in collections.iter_mut() {
            let before = contents.len();
            contents.retain(|c| c.id != id);
            if contents.len() != before {
                return true;
            }
        }
        false
    }

    /// Replace fields of the document's own data.
    pub fn merge(&self, update: &Record) {
        let mut data = self.node.data.write().unwrap();
        for (key, value) in update {
            data.insert(key.clone(), value.clone());
        }
    }

    /// Set a single field of the document's own data.
    pub fn set(&self, key: &str, value: Value) {
        self.node.data.write().unwrap().insert(key.to_string(), value);
    }

    /// Find a document by id in this subtree.
    pub fn find(&self, id: &str) -> Option<MemoryDocument> {
        if self.node.id == id {
            return Some(self.clone());
        }
        self.collections()
            .into_iter()
            .flat_map(|c| c.contents)
            .find_map(|child| child.find(id))
    }

    /// Whether two handles point to the same node.
    pub fn same_node(&self, other: &MemoryDocument) -> bool {
        Arc::ptr_eq(&self.node, &other.node)
    }
}

impl Document for MemoryDocument {
    fn id(&self) -> &str {
        &self.node.id
    }

    fn collection_name(&self) -> &str {
        &self.node.collection_name
    }

    fn to_json(&self) -> Record {
        self.node.data.read().unwrap().clone()
    }

    fn collections(&self) -> Vec<EmbeddedCollection<Self>> {
        self.node
            .collections
            .read()
            .unwrap()
            .iter()
            .map(|(name, contents)| EmbeddedCollection {
                name: name.clone(),
                contents: contents
                    .iter()
                    .map(|node| MemoryDocument {
                        node: Arc::clone(node),
                    })
                    .collect(),
            })
            .collect()
    }

    fn parent(&self) -> Option<Self> {
        self.node
            .parent
            .read()
            .unwrap()
            .upgrade()
            .map(|node| MemoryDocument { node })
    }

    fn pack(&self) -> Option<String> {
        self.node.pack.clone()
    }

    fn uuid(&self) -> String {
        let own = format!("{}.{}", self.node.document_name, self.node.id);
        match (self.parent(), &self.node.pack) {
            (Some(parent), _) => format!("{}.{}", parent.uuid(), own),
            (None, Some(pack)) => format!("Compendium.{}.{}", pack, own),
            (None, None) => own,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_embed_links_parent_and_pack() {
        let actor = MemoryDocument::new(
            "Actor",
            "actors",
            Some("my-module.monsters"),
            json!({"_id": "actor1", "name": "Goblin"}),
        );
        let item = actor.embed("items", "Item", json!({"_id": "item1", "name": "Dagger"}));

        assert_eq!(item.parent().unwrap().id(), "actor1");
        assert_eq!(item.pack().as_deref(), Some("my-module.monsters"));
        assert_eq!(
            item.uuid(),
            "Compendium.my-module.monsters.Actor.actor1.Item.item1"
        );
    }

    #[test]
    fn test_find_and_remove_embedded() {
        let actor = MemoryDocument::new("Actor", "actors", None, json!({"_id": "a"}));
        let item = actor.embed("items", "Item", json!({"_id": "i"}));
        let effect = item.embed("effects", "ActiveEffect", json!({"_id": "e"}));

        assert!(actor.find("e").unwrap().same_node(&effect));
        assert!(item.remove_embedded("e"));
        assert!(actor.find("e").is_none());
    }

    #[test]
    fn test_pack_metadata_scope() {
        let pack = PackMetadata::new("my-module", "monsters");
        assert_eq!(pack.id, "my-module.monsters");
        assert!(pack.is_managed_by("my-module"));
        assert!(!pack.is_managed_by("other-module"));
    }
}
