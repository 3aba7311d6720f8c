//! Entity snapshots — the attribute maps the condition evaluator reads.
//!
//! A snapshot is a point-in-time view of one entity's attributes. The
//! engine never cares where it came from (transaction store, customer
//! profile store); providers sit behind `SnapshotProvider`.

use crate::{error::EngineResult, types::EntityType};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntitySnapshot {
    attrs: Value,
}

impl EntitySnapshot {
    /// Wrap a JSON object as a snapshot. Non-object roots are accepted but
    /// resolve nothing — every lookup fails closed.
    pub fn new(attrs: Value) -> Self {
        Self { attrs }
    }

    /// Resolve a dotted field path (`"kyc.status"`) to its value.
    /// Missing segments or non-object intermediates return `None`.
    pub fn resolve(&self, path: &str) -> Option<&Value> {
        path.split('.').try_fold(&self.attrs, |v, segment| v.get(segment))
    }

    pub fn as_value(&self) -> &Value {
        &self.attrs
    }
}

/// Supplies snapshots to the rule engine. Out-of-scope stores implement
/// this; the engine only consumes it.
pub trait SnapshotProvider {
    fn snapshot(&self, entity_type: EntityType, entity_id: &str) -> EngineResult<EntitySnapshot>;
}
