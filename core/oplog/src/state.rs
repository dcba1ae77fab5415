//! Materialized application state.
//!
//! State is a map of entity type to entity id to record. Each record keeps a
//! last-writer-wins register per top-level field plus an optional delete
//! tombstone. Writes are ordered by [`WriteStamp`], whose leading key is the
//! sum of the writer's vector clock; causally later writes therefore always
//! win, and concurrent writes are settled deterministically.
//!
//! A SyncImport sets an import floor at its own stamp: everything written
//! below the floor is dropped and the imported records take its place, while
//! writes stamped above the floor survive. Applying the same set of
//! operations, imports included, in any order yields the same state.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use tasksync_common::{ClientId, Error, OpId, OpType, Operation, Result};

/// Total order over writes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteStamp {
    pub clock_sum: u64,
    pub timestamp: i64,
    pub client_id: ClientId,
    pub op_id: OpId,
}

impl WriteStamp {
    /// Stamp of an operation.
    pub fn of(op: &Operation) -> Self {
        Self {
            clock_sum: op.vector_clock.sum(),
            timestamp: op.timestamp,
            client_id: op.client_id.clone(),
            op_id: op.id.clone(),
        }
    }
}

/// One last-writer-wins field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldRegister {
    pub value: Value,
    pub stamp: WriteStamp,
}

/// Stored form of a single entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub fields: BTreeMap<String, FieldRegister>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<WriteStamp>,
}

impl EntityRecord {
    fn write_field(&mut self, name: &str, value: Value, stamp: &WriteStamp) {
        match self.fields.get(name) {
            Some(existing) if existing.stamp >= *stamp => {}
            _ => {
                self.fields.insert(
                    name.to_string(),
                    FieldRegister {
                        value,
                        stamp: stamp.clone(),
                    },
                );
            }
        }
    }

    fn delete(&mut self, stamp: &WriteStamp) {
        if self.deleted.as_ref().map_or(true, |d| stamp > d) {
            self.deleted = Some(stamp.clone());
        }
    }

    fn merge(&mut self, other: &EntityRecord) {
        for (name, field) in &other.fields {
            self.write_field(name, field.value.clone(), &field.stamp);
        }
        if let Some(stamp) = &other.deleted {
            self.delete(stamp);
        }
    }

    /// Drop everything written below `floor`. Returns whether anything is
    /// left.
    fn prune_below(&mut self, floor: &WriteStamp) -> bool {
        self.fields.retain(|_, f| f.stamp > *floor);
        if self.deleted.as_ref().is_some_and(|d| d < floor) {
            self.deleted = None;
        }
        !self.fields.is_empty() || self.deleted.is_some()
    }

    fn survives(&self, stamp: &WriteStamp) -> bool {
        self.deleted.as_ref().map_or(true, |d| stamp > d)
    }

    /// Whether any field was written after the last delete.
    pub fn is_visible(&self) -> bool {
        self.fields.values().any(|f| self.survives(&f.stamp))
    }

    /// Current value as a JSON object, `None` when deleted or never written.
    pub fn value(&self) -> Option<Value> {
        if !self.is_visible() {
            return None;
        }
        let object: Map<String, Value> = self
            .fields
            .iter()
            .filter(|(_, f)| self.survives(&f.stamp))
            .map(|(k, f)| (k.clone(), f.value.clone()))
            .collect();
        Some(Value::Object(object))
    }
}

/// The whole materialized state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppState {
    /// Stamp of the newest import applied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    import_floor: Option<WriteStamp>,
    #[serde(default)]
    entities: BTreeMap<String, BTreeMap<String, EntityRecord>>,
}

impl AppState {
    /// Empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one operation.
    ///
    /// # Errors
    /// - Create/Update payload is not a JSON object
    /// - SyncImport payload is not a serialized state
    pub fn apply(&mut self, op: &Operation) -> Result<()> {
        if op.is_payload_encrypted {
            return Err(Error::InvalidInput(format!(
                "Operation {} still carries an encrypted payload",
                op.id
            )));
        }

        let stamp = WriteStamp::of(op);
        if self.import_floor.as_ref().is_some_and(|floor| stamp <= *floor) {
            // superseded by an import already applied
            return Ok(());
        }
        match op.op_type {
            OpType::Create | OpType::Update => {
                let fields = op.payload.as_object().ok_or_else(|| {
                    Error::InvalidInput(format!(
                        "Operation {} payload must be an object",
                        op.id
                    ))
                })?;
                let record = self.record_mut(&op.entity_type, &op.entity_id);
                for (name, value) in fields {
                    record.write_field(name, value.clone(), &stamp);
                }
            }
            OpType::Delete => {
                self.record_mut(&op.entity_type, &op.entity_id).delete(&stamp);
            }
            OpType::SyncImport => {
                let imported = Self::from_value(&op.payload)?;
                self.import(imported, stamp);
            }
        }
        Ok(())
    }

    fn import(&mut self, imported: AppState, floor: WriteStamp) {
        for records in self.entities.values_mut() {
            records.retain(|_, record| record.prune_below(&floor));
        }
        self.entities.retain(|_, records| !records.is_empty());

        for (entity_type, records) in imported.entities {
            for (entity_id, record) in records {
                self.record_mut(&entity_type, &entity_id).merge(&record);
            }
        }
        self.import_floor = Some(floor);
    }

    fn record_mut(&mut self, entity_type: &str, entity_id: &str) -> &mut EntityRecord {
        self.entities
            .entry(entity_type.to_string())
            .or_default()
            .entry(entity_id.to_string())
            .or_default()
    }

    /// Insert a whole record, used when building state from a document.
    pub fn insert_record(&mut self, entity_type: &str, entity_id: &str, record: EntityRecord) {
        self.entities
            .entry(entity_type.to_string())
            .or_default()
            .insert(entity_id.to_string(), record);
    }

    /// Raw record lookup, including deleted ones.
    pub fn record(&self, entity_type: &str, entity_id: &str) -> Option<&EntityRecord> {
        self.entities.get(entity_type)?.get(entity_id)
    }

    /// Current value of one entity.
    pub fn get(&self, entity_type: &str, entity_id: &str) -> Option<Value> {
        self.record(entity_type, entity_id)?.value()
    }

    /// Visible entities of a type, ordered by id.
    pub fn entities(&self, entity_type: &str) -> Vec<(String, Value)> {
        self.entities
            .get(entity_type)
            .map(|records| {
                records
                    .iter()
                    .filter_map(|(id, r)| r.value().map(|v| (id.clone(), v)))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Entity types present in the state.
    pub fn entity_types(&self) -> impl Iterator<Item = &str> {
        self.entities.keys().map(String::as_str)
    }

    /// Number of visible entities across all types.
    pub fn visible_count(&self) -> usize {
        self.entities
            .values()
            .flat_map(|records| records.values())
            .filter(|r| r.is_visible())
            .count()
    }

    /// Whether nothing visible exists.
    pub fn is_empty(&self) -> bool {
        self.visible_count() == 0
    }

    /// Serialize into the form carried by a SyncImport payload.
    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Parse a SyncImport payload.
    pub fn from_value(value: &Value) -> Result<Self> {
        serde_json::from_value(value.clone()).map_err(|e| {
            Error::Serialization(format!("Invalid state payload: {}", e))
        })
    }

    /// Visible values only, `{type: {id: value}}`. Two states that render the
    /// same view are indistinguishable to the user.
    pub fn view(&self) -> Value {
        let mut out = Map::new();
        for entity_type in self.entities.keys() {
            let visible: Map<String, Value> = self.entities(entity_type).into_iter().collect();
            if !visible.is_empty() {
                out.insert(entity_type.clone(), Value::Object(visible));
            }
        }
        Value::Object(out)
    }
}
