//! Content comparison for incoming system updates.
//!
//! A file written by the dev server is seen again by its watcher and echoed
//! back; comparing normalized content is what keeps that echo from being
//! reapplied. Fields that change without the content changing are removed
//! before comparing: every numeric `modifiedTime` and every `_key`, then any
//! `_stats` object left empty.

use crate::flatten::KEY_FIELD;
use serde_json::Value;

pub const MODIFIED_TIME_FIELD: &str = "modifiedTime";
const STATS_FIELD: &str = "_stats";

/// Strip volatile fields at any depth.
pub fn normalize(value: &mut Value) {
    match value {
        Value::Object(map) => {
            map.remove(KEY_FIELD);
            if map.get(MODIFIED_TIME_FIELD).is_some_and(Value::is_number) {
                map.remove(MODIFIED_TIME_FIELD);
            }
            map.values_mut().for_each(normalize);
            // A stats block that only held the timestamp
            let stats_emptied = map
                .get(STATS_FIELD)
                .and_then(Value::as_object)
                .is_some_and(|stats| stats.is_empty());
            if stats_emptied {
                map.remove(STATS_FIELD);
            }
        }
        Value::Array(items) => items.iter_mut().for_each(normalize),
        _ => {}
    }
}

/// Canonical serialization of the normalized value.
pub fn normalized_string(mut value: Value) -> String {
    normalize(&mut value);
    value.to_string()
}

/// Whether two documents carry the same content.
pub fn same_content(current: Value, incoming: Value) -> bool {
    normalized_string(current) == normalized_string(incoming)
}

/// The stable source reference in a record's change-tracking metadata.
pub fn source_reference(record: &Value) -> Option<&str> {
    record
        .get(STATS_FIELD)
        .and_then(|stats| stats.get("compendiumSource"))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

/// Pack name of a watched file: the name of its parent directory.
pub fn pack_from_file(file: &str) -> Option<&str> {
    let mut segments = file.rsplit('/');
    segments.next()?;
    segments.next().filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_timestamp_and_keys_are_ignored() {
        let current = json!({
            "_id": "abc123",
            "name": "Goblin",
            "_stats": {"modifiedTime": 100},
            "items": [{"_id": "i1", "_stats": {"modifiedTime": 5}}]
        });
        let incoming = json!({
            "_id": "abc123",
            "name": "Goblin",
            "_key": "!actors!abc123",
            "_stats": {"modifiedTime": 200},
            "items": [{"_id": "i1", "_key": "!actors.items!i1", "_stats": {"modifiedTime": 9}}]
        });
        assert!(same_content(current, incoming));
    }

    #[test]
    fn test_real_change_is_detected() {
        let current = json!({"_id": "abc123", "name": "Goblin"});
        let incoming = json!({"_id": "abc123", "name": "Hobgoblin"});
        assert!(!same_content(current, incoming));
    }

    #[test]
    fn test_null_modified_time_is_content() {
        let current = json!({"_stats": {"modifiedTime": null}});
        let incoming = json!({"_stats": {}});
        assert!(!same_content(current, incoming));
    }

    #[test]
    fn test_stats_emptied_by_timestamp_matches_missing_stats() {
        let current = json!({"_id": "a", "_stats": {"modifiedTime": 1234}});
        let incoming = json!({"_id": "a"});
        assert!(same_content(current, incoming));

        let current = json!({"_id": "a", "_stats": {"modifiedTime": 1, "systemId": "dnd5e"}});
        assert!(!same_content(current, json!({"_id": "a"})));
    }

    #[test]
    fn test_field_order_does_not_matter() {
        let current: Value = serde_json::from_str(r#"{"b":1,"a":2}"#).unwrap();
        let incoming: Value = serde_json::from_str(r#"{"a":2,"b":1}"#).unwrap();
        assert!(same_content(current, incoming));
    }

    #[test]
    fn test_source_reference() {
        let record = json!({"_stats": {"compendiumSource": "Compendium.m.p.Item.x"}});
        assert_eq!(source_reference(&record), Some("Compendium.m.p.Item.x"));
        assert_eq!(source_reference(&json!({"_stats": {"compendiumSource": null}})), None);
        assert_eq!(source_reference(&json!({})), None);
    }

    #[test]
    fn test_pack_from_file() {
        assert_eq!(pack_from_file("data/monsters/Goblin_abc.json"), Some("monsters"));
        assert_eq!(pack_from_file("data/nested/spells/Fire_x.json"), Some("spells"));
        assert_eq!(pack_from_file("Goblin_abc.json"), None);
    }
}
