//! Compacted state cache.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tasksync_common::{VectorClock, CURRENT_SCHEMA_VERSION};

use crate::state::AppState;

/// Materialized state as of a log position.
///
/// Every operation with `seq <= last_applied_op_seq` is folded into `state`
/// and may be pruned from the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub state: AppState,
    pub last_applied_op_seq: i64,
    /// Merge of the clocks of every folded operation.
    pub vector_clock: VectorClock,
    pub compacted_at: DateTime<Utc>,
    pub schema_version: u32,
}

impl Default for StateSnapshot {
    fn default() -> Self {
        Self {
            state: AppState::new(),
            last_applied_op_seq: 0,
            vector_clock: VectorClock::new(),
            compacted_at: DateTime::<Utc>::UNIX_EPOCH,
            schema_version: CURRENT_SCHEMA_VERSION,
        }
    }
}
