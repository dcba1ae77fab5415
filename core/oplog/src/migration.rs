//! Forward migration of operations written by older clients.

use serde_json::Value;
use tracing::warn;

use tasksync_common::{
    Error, OpType, Operation, Result, CURRENT_SCHEMA_VERSION, MIN_SUPPORTED_SCHEMA_VERSION,
};

/// Result of bringing one remote operation up to the local schema.
#[derive(Debug, Clone, PartialEq)]
pub enum Migrated {
    /// Ready to apply.
    Ready(Operation),
    /// Written by a newer client. Skip it, but consume its sequence number.
    TooNew { op_id: String, schema_version: u32 },
}

/// Migrate a decrypted operation to [`CURRENT_SCHEMA_VERSION`].
///
/// # Errors
/// - schema version below [`MIN_SUPPORTED_SCHEMA_VERSION`] (corrupt or
///   unmigratable); the caller skips this op and applies the rest
/// - structurally invalid operation
pub fn migrate_operation(mut op: Operation) -> Result<Migrated> {
    if op.schema_version > CURRENT_SCHEMA_VERSION {
        warn!(
            "Skipping op {} with newer schema version {} (local {})",
            op.id, op.schema_version, CURRENT_SCHEMA_VERSION
        );
        return Ok(Migrated::TooNew {
            op_id: op.id.to_string(),
            schema_version: op.schema_version,
        });
    }
    if op.schema_version < MIN_SUPPORTED_SCHEMA_VERSION {
        return Err(Error::InvalidInput(format!(
            "Op {} has unsupported schema version {}",
            op.id, op.schema_version
        )));
    }

    while op.schema_version < CURRENT_SCHEMA_VERSION {
        if op.schema_version == 1 {
            migrate_v1_to_v2(&mut op);
        }
        op.schema_version += 1;
    }

    validate_operation(&op)?;
    Ok(Migrated::Ready(op))
}

/// v2 renamed the task field `plannedAt` to `dueWithTime`.
fn migrate_v1_to_v2(op: &mut Operation) {
    match op.op_type {
        OpType::Create | OpType::Update if op.entity_type == "task" => {
            if let Some(fields) = op.payload.as_object_mut() {
                rename_field(fields, "plannedAt", "dueWithTime");
            }
        }
        _ => {}
    }
}

pub(crate) fn rename_field(fields: &mut serde_json::Map<String, Value>, from: &str, to: &str) {
    if let Some(value) = fields.remove(from) {
        fields.entry(to.to_string()).or_insert(value);
    }
}

/// Structural checks every applied op must pass.
pub fn validate_operation(op: &Operation) -> Result<()> {
    if op.entity_type.is_empty() {
        return Err(Error::InvalidInput(format!("Op {} has no entity type", op.id)));
    }
    if op.is_payload_encrypted {
        return Err(Error::InvalidInput(format!("Op {} was not decrypted", op.id)));
    }
    match op.op_type {
        OpType::Create | OpType::Update => {
            if op.entity_id.is_empty() {
                return Err(Error::InvalidInput(format!("Op {} has no entity id", op.id)));
            }
            if !op.payload.is_object() {
                return Err(Error::InvalidInput(format!(
                    "Op {} payload is not an object",
                    op.id
                )));
            }
        }
        OpType::Delete => {
            if op.entity_id.is_empty() {
                return Err(Error::InvalidInput(format!("Op {} has no entity id", op.id)));
            }
        }
        OpType::SyncImport => {
            if !op.payload.is_object() {
                return Err(Error::InvalidInput(format!(
                    "Import op {} payload is not a state",
                    op.id
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tasksync_common::{ClientId, VectorClock};

    fn op(schema_version: u32, payload: Value) -> Operation {
        let client = ClientId::new("a").unwrap();
        let mut op = Operation::new(
            client.clone(),
            VectorClock::new().increment(&client),
            "task",
            "t1",
            OpType::Update,
            payload,
        );
        op.schema_version = schema_version;
        op
    }

    #[test]
    fn test_current_passes_through() {
        let original = op(CURRENT_SCHEMA_VERSION, json!({"title": "X"}));
        assert_eq!(
            migrate_operation(original.clone()).unwrap(),
            Migrated::Ready(original)
        );
    }

    #[test]
    fn test_v1_renames_planned_at() {
        let Migrated::Ready(migrated) =
            migrate_operation(op(1, json!({"plannedAt": 42, "title": "X"}))).unwrap()
        else {
            panic!("expected ready op");
        };
        assert_eq!(migrated.schema_version, CURRENT_SCHEMA_VERSION);
        assert_eq!(migrated.payload, json!({"dueWithTime": 42, "title": "X"}));
    }

    #[test]
    fn test_newer_schema_is_skipped() {
        let result = migrate_operation(op(CURRENT_SCHEMA_VERSION + 1, json!({}))).unwrap();
        assert!(matches!(result, Migrated::TooNew { .. }));
    }

    #[test]
    fn test_schema_zero_is_rejected() {
        assert!(migrate_operation(op(0, json!({}))).is_err());
    }

    #[test]
    fn test_non_object_update_is_rejected() {
        assert!(migrate_operation(op(CURRENT_SCHEMA_VERSION, json!([1, 2]))).is_err());
    }
}
