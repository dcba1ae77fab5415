//! Backup documents.
//!
//! A backup is a JSON object of sections. Entity sections have the shape
//! `{ids: [...], entities: {id: {...}}, ...extra}`; every other section is an
//! opaque value. Backups exported before the archive split carry legacy keys
//! and are migrated with [`migrate_legacy_backup`] before import.

use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use tracing::info;

use tasksync_common::{Error, Result};

use crate::migration::rename_field;
use crate::state::{AppState, EntityRecord, FieldRegister, WriteStamp};

/// Id of the project every task falls back to.
pub const INBOX_PROJECT_ID: &str = "INBOX_PROJECT";

/// Record id holding a section's non-entity content.
const SECTION_RECORD: &str = "__section__";
/// Field holding a non-object section value.
const VALUE_FIELD: &str = "__value__";
/// Marks a section record as belonging to an entity collection.
const COLLECTION_FIELD: &str = "__collection__";

const ENTITY_SECTIONS: &[&str] = &[
    "project",
    "note",
    "issueProvider",
    "metric",
    "task",
    "tag",
    "simpleCounter",
    "taskRepeatCfg",
];

const LEGACY_MARKERS: &[&str] = &["taskArchive", "improvement", "obstruction"];

const LEGACY_KEYS: &[&str] = &[
    "bookmark",
    "improvement",
    "obstruction",
    "taskArchive",
    "lastLocalSyncModelChange",
    "lastArchiveUpdate",
];

const TIME_TRACKING_FIELDS: &[(&str, &str)] = &[
    ("workStart", "s"),
    ("workEnd", "e"),
    ("breakNr", "b"),
    ("breakTime", "bt"),
];

/// Whether `data` was exported by a client that predates the archive split.
pub fn is_legacy_backup(data: &Value) -> bool {
    data.as_object()
        .is_some_and(|o| LEGACY_MARKERS.iter().any(|k| o.contains_key(*k)))
}

fn empty_collection() -> Value {
    json!({"ids": [], "entities": {}})
}

fn empty_archive() -> Value {
    json!({
        "task": empty_collection(),
        "timeTracking": {"project": {}, "tag": {}},
        "lastTimeTrackingFlush": 0,
    })
}

fn default_section(name: &str) -> Value {
    match name {
        "menuTree" => json!({"tagTree": [], "projectTree": []}),
        "globalConfig" => json!({}),
        "planner" => json!({"days": {}}),
        "boards" => json!({"boardCfgs": []}),
        "reminders" | "pluginUserData" | "pluginMetadata" => json!([]),
        "timeTracking" => json!({"project": {}, "tag": {}}),
        "archiveYoung" | "archiveOld" => empty_archive(),
        _ => empty_collection(),
    }
}

/// Sections every current backup carries.
pub const REQUIRED_SECTIONS: &[&str] = &[
    "project",
    "menuTree",
    "globalConfig",
    "planner",
    "boards",
    "note",
    "issueProvider",
    "metric",
    "task",
    "tag",
    "simpleCounter",
    "taskRepeatCfg",
    "reminders",
    "timeTracking",
    "pluginUserData",
    "pluginMetadata",
    "archiveYoung",
    "archiveOld",
];

/// Bring a backup of any age to the current document shape.
///
/// Every active and archived item survives. Running it on its own output
/// changes nothing.
///
/// # Errors
/// - `data` is not a JSON object
pub fn migrate_legacy_backup(data: &Value) -> Result<Value> {
    let mut doc = data
        .as_object()
        .cloned()
        .ok_or_else(|| Error::InvalidInput("Backup must be a JSON object".to_string()))?;
    let was_legacy = is_legacy_backup(data);

    move_flat_archive(&mut doc);
    extract_time_tracking(&mut doc);
    ensure_inbox_project(&mut doc);
    migrate_language(&mut doc);
    rename_planned_at(&mut doc);

    for key in LEGACY_KEYS {
        doc.remove(*key);
    }
    for key in REQUIRED_SECTIONS {
        if !doc.get(*key).is_some_and(|v| !v.is_null()) {
            doc.insert(key.to_string(), default_section(key));
        }
    }

    if was_legacy {
        info!("Migrated legacy backup to current format");
    }
    Ok(Value::Object(doc))
}

type CollectionParts<'a> = (&'a mut Vec<Value>, &'a mut Map<String, Value>);

fn collection_mut(section: &mut Value) -> Option<CollectionParts<'_>> {
    let obj = section.as_object_mut()?;
    if !obj.get("ids").is_some_and(Value::is_array) {
        obj.insert("ids".to_string(), json!([]));
    }
    if !obj.get("entities").is_some_and(Value::is_object) {
        obj.insert("entities".to_string(), json!({}));
    }
    // Both keys exist now; split the borrow.
    let mut ids = None;
    let mut entities = None;
    for (k, v) in obj.iter_mut() {
        match k.as_str() {
            "ids" => ids = v.as_array_mut(),
            "entities" => entities = v.as_object_mut(),
            _ => {}
        }
    }
    Some((ids?, entities?))
}

fn move_flat_archive(doc: &mut Map<String, Value>) {
    let Some(flat) = doc.remove("taskArchive") else {
        return;
    };
    let young = doc
        .entry("archiveYoung")
        .or_insert_with(empty_archive);
    if !young.is_object() {
        *young = empty_archive();
    }
    let Some(young_obj) = young.as_object_mut() else {
        return;
    };
    let task = young_obj.entry("task").or_insert_with(empty_collection);
    let Some((ids, entities)) = collection_mut(task) else {
        return;
    };

    let flat_entities = flat.get("entities").and_then(Value::as_object);
    let flat_ids = flat.get("ids").and_then(Value::as_array);
    for id in flat_ids.into_iter().flatten() {
        let Some(id_str) = id.as_str() else { continue };
        let Some(entity) = flat_entities.and_then(|e| e.get(id_str)) else {
            continue;
        };
        if !entities.contains_key(id_str) {
            ids.push(id.clone());
        }
        entities.insert(id_str.to_string(), entity.clone());
    }
}

fn extract_time_tracking(doc: &mut Map<String, Value>) {
    for kind in ["project", "tag"] {
        let mut extracted: Vec<(String, String, &'static str, Value)> = Vec::new();
        if let Some(entities) = doc
            .get_mut(kind)
            .and_then(|s| s.get_mut("entities"))
            .and_then(Value::as_object_mut)
        {
            for (id, entity) in entities.iter_mut() {
                let Some(fields) = entity.as_object_mut() else { continue };
                for &(legacy, short) in TIME_TRACKING_FIELDS {
                    let Some(by_day) = fields.remove(legacy) else { continue };
                    for (day, value) in by_day.as_object().into_iter().flatten() {
                        extracted.push((id.clone(), day.clone(), short, value.clone()));
                    }
                }
            }
        }
        if extracted.is_empty() {
            continue;
        }

        let tracking = doc
            .entry("timeTracking")
            .or_insert_with(|| default_section("timeTracking"));
        if !tracking.is_object() {
            *tracking = default_section("timeTracking");
        }
        let Some(tracking) = tracking.as_object_mut() else { continue };
        let per_kind = tracking.entry(kind).or_insert_with(|| json!({}));
        let Some(per_kind) = per_kind.as_object_mut() else { continue };
        for (id, day, short, value) in extracted {
            let days = per_kind.entry(id).or_insert_with(|| json!({}));
            let Some(days) = days.as_object_mut() else { continue };
            let slot = days.entry(day).or_insert_with(|| json!({}));
            if let Some(slot) = slot.as_object_mut() {
                slot.entry(short).or_insert(value);
            }
        }
    }
}

fn ensure_inbox_project(doc: &mut Map<String, Value>) {
    let project = doc.entry("project").or_insert_with(empty_collection);
    if !project.is_object() {
        *project = empty_collection();
    }
    let Some((ids, entities)) = collection_mut(project) else {
        return;
    };
    if entities.contains_key(INBOX_PROJECT_ID) {
        return;
    }
    entities.insert(
        INBOX_PROJECT_ID.to_string(),
        json!({
            "id": INBOX_PROJECT_ID,
            "title": "Inbox",
            "taskIds": [],
            "backlogTaskIds": [],
            "noteIds": [],
            "isHiddenFromMenu": false,
            "isArchived": false,
        }),
    );
    ids.push(json!(INBOX_PROJECT_ID));
}

fn migrate_language(doc: &mut Map<String, Value>) {
    let Some(config) = doc.get_mut("globalConfig").and_then(Value::as_object_mut) else {
        return;
    };
    let Some(mut lang) = config.remove("lang") else {
        return;
    };
    if config.contains_key("localization") {
        return;
    }
    if let Some(lng) = lang.get_mut("lng") {
        if let Some(s) = lng.as_str() {
            *lng = Value::String(s.to_lowercase());
        }
    }
    config.insert("localization".to_string(), lang);
}

fn rename_planned_at(doc: &mut Map<String, Value>) {
    let mut task_sections: Vec<&mut Value> = Vec::new();
    for (key, section) in doc.iter_mut() {
        match key.as_str() {
            "task" => task_sections.push(section),
            "archiveYoung" | "archiveOld" => {
                if let Some(task) = section.get_mut("task") {
                    task_sections.push(task);
                }
            }
            _ => {}
        }
    }
    for section in task_sections {
        let Some(entities) = section.get_mut("entities").and_then(Value::as_object_mut) else {
            continue;
        };
        for task in entities.values_mut() {
            if let Some(fields) = task.as_object_mut() {
                rename_field(fields, "plannedAt", "dueWithTime");
            }
        }
    }
}

fn record_from_fields(fields: Map<String, Value>, stamp: &WriteStamp) -> EntityRecord {
    EntityRecord {
        fields: fields
            .into_iter()
            .map(|(k, value)| {
                (
                    k,
                    FieldRegister {
                        value,
                        stamp: stamp.clone(),
                    },
                )
            })
            .collect(),
        deleted: None,
    }
}

fn is_collection(section: &Value) -> bool {
    section.get("ids").is_some_and(Value::is_array)
        && section.get("entities").is_some_and(Value::is_object)
}

/// Build state from a backup document. Every field is written with `stamp`.
///
/// # Errors
/// - `document` is not a JSON object
pub fn state_from_backup(document: &Value, stamp: &WriteStamp) -> Result<AppState> {
    let sections = document
        .as_object()
        .ok_or_else(|| Error::InvalidInput("Backup must be a JSON object".to_string()))?;

    let mut state = AppState::new();
    for (name, section) in sections {
        let entity_section = ENTITY_SECTIONS.contains(&name.as_str()) && section.is_object();
        if entity_section || is_collection(section) {
            let mut extra = section.as_object().cloned().unwrap_or_default();
            let entities = extra
                .remove("entities")
                .and_then(|e| e.as_object().cloned())
                .unwrap_or_default();
            for (id, entity) in entities {
                let fields = match entity {
                    Value::Object(fields) => fields,
                    other => Map::from_iter([(VALUE_FIELD.to_string(), other)]),
                };
                state.insert_record(name, &id, record_from_fields(fields, stamp));
            }
            extra.insert(COLLECTION_FIELD.to_string(), Value::Bool(true));
            state.insert_record(name, SECTION_RECORD, record_from_fields(extra, stamp));
        } else {
            let fields = match section {
                Value::Object(fields) if !fields.is_empty() => fields.clone(),
                other => Map::from_iter([(VALUE_FIELD.to_string(), other.clone())]),
            };
            state.insert_record(name, SECTION_RECORD, record_from_fields(fields, stamp));
        }
    }
    Ok(state)
}

/// Render state as a backup document.
///
/// Entity ids keep the order recorded at import; entities created since are
/// appended in id order.
pub fn backup_from_state(state: &AppState) -> Value {
    let mut doc = Map::new();
    for entity_type in state.entity_types() {
        let section = state.get(entity_type, SECTION_RECORD);
        let entities: Map<String, Value> = state
            .entities(entity_type)
            .into_iter()
            .filter(|(id, _)| id != SECTION_RECORD)
            .map(|(id, mut value)| {
                if let Some(single) = value.get(VALUE_FIELD).cloned() {
                    value = single;
                }
                (id, value)
            })
            .collect();

        let is_collection_section = section
            .as_ref()
            .is_some_and(|s| s.get(COLLECTION_FIELD).is_some())
            || !entities.is_empty();

        let rendered = if is_collection_section {
            let mut out = match section {
                Some(Value::Object(o)) => o,
                _ => Map::new(),
            };
            out.remove(COLLECTION_FIELD);
            let recorded: Vec<String> = out
                .remove("ids")
                .and_then(|ids| ids.as_array().cloned())
                .unwrap_or_default()
                .into_iter()
                .filter_map(|id| id.as_str().map(str::to_string))
                .collect();
            let mut seen = BTreeSet::new();
            let mut ids: Vec<Value> = Vec::with_capacity(entities.len());
            for id in recorded.iter().chain(entities.keys()) {
                if entities.contains_key(id) && seen.insert(id.clone()) {
                    ids.push(Value::String(id.clone()));
                }
            }
            out.insert("ids".to_string(), Value::Array(ids));
            out.insert("entities".to_string(), Value::Object(entities));
            Value::Object(out)
        } else {
            match section {
                Some(value) => match value.get(VALUE_FIELD) {
                    Some(single) => single.clone(),
                    None => value,
                },
                None => continue,
            }
        };
        doc.insert(entity_type.to_string(), rendered);
    }
    Value::Object(doc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tasksync_common::{ClientId, OpId};

    fn legacy_backup() -> Value {
        json!({
            "bookmark": {},
            "globalConfig": {"misc": {}, "lang": {"lng": "EN"}},
            "reminders": [],
            "planner": {"days": {}},
            "project": {
                "ids": ["proj-1"],
                "entities": {
                    "proj-1": {
                        "id": "proj-1",
                        "title": "My Project",
                        "workStart": {"2024-01-01": 1704067200000_i64},
                        "workEnd": {"2024-01-01": 1704096000000_i64},
                        "breakNr": {},
                        "breakTime": {}
                    }
                }
            },
            "tag": {"ids": ["TODAY"], "entities": {"TODAY": {"id": "TODAY", "title": "Today"}}},
            "improvement": {"ids": [], "entities": {}},
            "obstruction": {"ids": [], "entities": {}},
            "task": {
                "ids": ["task-1"],
                "entities": {"task-1": {"id": "task-1", "title": "Active", "plannedAt": 5}},
                "currentTaskId": null
            },
            "taskArchive": {
                "ids": ["archived-1", "archived-2"],
                "entities": {
                    "archived-1": {"id": "archived-1", "isDone": true},
                    "archived-2": {"id": "archived-2", "isDone": true}
                }
            },
            "lastLocalSyncModelChange": 1704096000000_i64,
            "lastArchiveUpdate": 1704096000000_i64
        })
    }

    fn stamp() -> WriteStamp {
        WriteStamp {
            clock_sum: 1,
            timestamp: 0,
            client_id: ClientId::new("a").unwrap(),
            op_id: OpId::from_string("import"),
        }
    }

    #[test]
    fn test_detects_legacy() {
        assert!(is_legacy_backup(&legacy_backup()));
        assert!(is_legacy_backup(&json!({"obstruction": {}})));
        assert!(!is_legacy_backup(&json!({"task": {"ids": [], "entities": {}}})));
        assert!(!is_legacy_backup(&json!([])));
    }

    #[test]
    fn test_migration_produces_current_shape() {
        let out = migrate_legacy_backup(&legacy_backup()).unwrap();
        for key in REQUIRED_SECTIONS {
            assert!(out.get(*key).is_some(), "missing {}", key);
        }
        for key in LEGACY_KEYS {
            assert!(out.get(*key).is_none(), "still has {}", key);
        }
        assert!(!is_legacy_backup(&out));
    }

    #[test]
    fn test_migration_preserves_items() {
        let out = migrate_legacy_backup(&legacy_backup()).unwrap();
        assert_eq!(out["task"]["ids"], json!(["task-1"]));
        assert_eq!(out["archiveYoung"]["task"]["ids"], json!(["archived-1", "archived-2"]));
        assert_eq!(out["archiveOld"]["task"]["ids"], json!([]));
        assert_eq!(out["project"]["ids"], json!(["proj-1", INBOX_PROJECT_ID]));
    }

    #[test]
    fn test_migration_moves_time_tracking() {
        let out = migrate_legacy_backup(&legacy_backup()).unwrap();
        assert_eq!(out["timeTracking"]["project"]["proj-1"]["2024-01-01"]["s"], 1704067200000_i64);
        assert_eq!(out["timeTracking"]["project"]["proj-1"]["2024-01-01"]["e"], 1704096000000_i64);
        let project = &out["project"]["entities"]["proj-1"];
        assert!(project.get("workStart").is_none());
        assert!(project.get("breakTime").is_none());
    }

    #[test]
    fn test_migration_renames_fields() {
        let out = migrate_legacy_backup(&legacy_backup()).unwrap();
        assert_eq!(out["globalConfig"]["localization"]["lng"], "en");
        assert!(out["globalConfig"].get("lang").is_none());
        assert_eq!(out["task"]["entities"]["task-1"]["dueWithTime"], 5);
        assert!(out["task"]["entities"]["task-1"].get("plannedAt").is_none());
    }

    #[test]
    fn test_migration_is_idempotent() {
        let once = migrate_legacy_backup(&legacy_backup()).unwrap();
        let twice = migrate_legacy_backup(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_archive_merges_into_existing_young_archive() {
        let mut backup = legacy_backup();
        backup["archiveYoung"] = json!({
            "task": {"ids": ["old"], "entities": {"old": {"id": "old"}}},
            "timeTracking": {"project": {}, "tag": {}},
            "lastTimeTrackingFlush": 7
        });
        let out = migrate_legacy_backup(&backup).unwrap();
        assert_eq!(
            out["archiveYoung"]["task"]["ids"],
            json!(["old", "archived-1", "archived-2"])
        );
        assert_eq!(out["archiveYoung"]["lastTimeTrackingFlush"], 7);
    }

    #[test]
    fn test_rejects_non_object() {
        assert!(migrate_legacy_backup(&json!("x")).is_err());
    }

    #[test]
    fn test_state_roundtrip_keeps_document() {
        let doc = migrate_legacy_backup(&legacy_backup()).unwrap();
        let state = state_from_backup(&doc, &stamp()).unwrap();
        assert_eq!(
            state.get("task", "task-1").unwrap()["title"],
            json!("Active")
        );
        assert_eq!(backup_from_state(&state), doc);
    }

    #[test]
    fn test_entities_created_later_are_appended() {
        let doc = json!({"task": {"ids": ["b"], "entities": {"b": {"title": "B"}}}});
        let mut state = state_from_backup(&doc, &stamp()).unwrap();
        state.insert_record(
            "task",
            "a",
            record_from_fields(Map::from_iter([("title".to_string(), json!("A"))]), &stamp()),
        );
        let out = backup_from_state(&state);
        assert_eq!(out["task"]["ids"], json!(["b", "a"]));
    }
}
