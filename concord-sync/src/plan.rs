//! Dry-run view of what the next pass would push.
//!
//! Aggregates a record's current sources with its strategy and compares the
//! result against the last synced snapshot. Nothing is written.

use serde_json::Value;
use similar::TextDiff;

use concord_core::ManagedRecord;

use crate::error::SyncError;
use crate::hash;
use crate::strategy::SyncStrategy;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub changed: bool,
    pub current_hash: String,
    /// Empty if the record never synced.
    pub previous_hash: String,
    /// Unified diff of the pretty-printed canonical JSON; empty when unchanged.
    pub diff: String,
}

pub fn plan(record: &ManagedRecord, strategy: &dyn SyncStrategy) -> Result<Plan, SyncError> {
    let aggregation = strategy.aggregate(&record.sources)?;
    let current_hash = aggregation.hash();
    let previous_hash = record.status.config_hash.clone();
    let changed = hash::hash_changed(&previous_hash, &current_hash);

    let diff = if changed {
        let before = record
            .status
            .aggregated_config_snapshot
            .as_ref()
            .map(pretty)
            .unwrap_or_default();
        let after = pretty(&aggregation.value);
        let old_header = format!("a/{}", record.key);
        let new_header = format!("b/{}", record.key);
        TextDiff::from_lines(&before, &after)
            .unified_diff()
            .header(&old_header, &new_header)
            .context_radius(3)
            .to_string()
    } else {
        String::new()
    };

    Ok(Plan {
        changed,
        current_hash,
        previous_hash,
        diff,
    })
}

/// Pretty JSON with sorted keys and a trailing newline.
fn pretty(value: &Value) -> String {
    let canonical: Value = sort_keys(value);
    let mut out = serde_json::to_string_pretty(&canonical).unwrap_or_else(|_| canonical.to_string());
    out.push('\n');
    out
}

fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.clone(), sort_keys(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}
