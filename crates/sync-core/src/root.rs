//! Root-document resolution.
//!
//! Only root documents are synchronized, so an event on an embedded
//! document has to be traced back up to the top of its tree.

use crate::document::Document;

/// Outcome of resolving the root of a changed document.
#[derive(Debug, Clone)]
pub enum RootResolution<D> {
    /// The topmost ancestor of an embedded document.
    Root(D),
    /// The document is itself top-level; the pack-contents event covers it.
    TopLevel,
    /// The document is not in a pack owned by the module.
    OutOfScope,
}

/// Whether a pack collection id (`<package>.<name>`) belongs to the module.
pub fn pack_in_scope(pack: &str, module_id: &str) -> bool {
    pack.strip_prefix(module_id)
        .is_some_and(|rest| rest.starts_with('.'))
}

/// Walk the parent chain of `document` up to its root.
pub fn resolve_root<D: Document>(document: &D, module_id: &str) -> RootResolution<D> {
    match document.pack() {
        Some(pack) if pack_in_scope(&pack, module_id) => {}
        _ => return RootResolution::OutOfScope,
    }

    let Some(mut root) = document.parent() else {
        return RootResolution::TopLevel;
    };
    while let Some(parent) = root.parent() {
        root = parent;
    }
    RootResolution::Root(root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::MemoryDocument;
    use serde_json::json;

    fn tree(pack: &str) -> (MemoryDocument, MemoryDocument, MemoryDocument) {
        let actor = MemoryDocument::new("Actor", "actors", Some(pack), json!({"_id": "a"}));
        let item = actor.embed("items", "Item", json!({"_id": "i"}));
        let effect = item.embed("effects", "ActiveEffect", json!({"_id": "e"}));
        (actor, item, effect)
    }

    #[test]
    fn test_deep_document_resolves_to_root() {
        let (actor, _, effect) = tree("my-module.monsters");
        match resolve_root(&effect, "my-module") {
            RootResolution::Root(root) => assert!(root.same_node(&actor)),
            other => panic!("expected root, got {:?}", other),
        }
    }

    #[test]
    fn test_top_level_document_is_skipped() {
        let (actor, _, _) = tree("my-module.monsters");
        assert!(matches!(
            resolve_root(&actor, "my-module"),
            RootResolution::TopLevel
        ));
    }

    #[test]
    fn test_foreign_pack_is_out_of_scope() {
        let (_, item, _) = tree("other-module.monsters");
        assert!(matches!(
            resolve_root(&item, "my-module"),
            RootResolution::OutOfScope
        ));
    }

    #[test]
    fn test_pack_scope_requires_full_package_match() {
        assert!(pack_in_scope("my-module.monsters", "my-module"));
        assert!(!pack_in_scope("my-module-extra.monsters", "my-module"));
        assert!(!pack_in_scope("my-module", "my-module"));
    }

    #[test]
    fn test_world_document_is_out_of_scope() {
        let actor = MemoryDocument::new("Actor", "actors", None, json!({"_id": "a"}));
        let item = actor.embed("items", "Item", json!({"_id": "i"}));
        assert!(matches!(
            resolve_root(&item, "my-module"),
            RootResolution::OutOfScope
        ));
    }
}
