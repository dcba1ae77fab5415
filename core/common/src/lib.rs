//! Common types shared across TaskSync crates.
//!
//! This crate holds the foundational data model: the error type, client and
//! operation identifiers, vector clocks and the operation record itself.

pub mod clock;
pub mod error;
pub mod operation;
pub mod types;

pub use clock::{detect_duplicate, ClockOrdering, VectorClock};
pub use error::{Error, Result};
pub use operation::{
    OpType, Operation, RejectedOp, SyncImportReason, CURRENT_SCHEMA_VERSION, ENTITY_TYPE_ALL,
    MIN_SUPPORTED_SCHEMA_VERSION,
};
pub use types::{ClientId, OpId, SensitiveBytes};
