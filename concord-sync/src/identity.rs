//! Pending-to-real identity migration.

use concord_core::{ExternalId, ManagedRecord};

use crate::error::SyncError;
use crate::updater::Updater;

/// Replace `record.external_id` with `real_id` through a conditional write.
///
/// Callers must treat an error as a failed sync attempt: a record left on
/// its pending id would create a second downstream resource next pass.
pub async fn migrate_identity(
    updater: &Updater,
    record: &mut ManagedRecord,
    real_id: &ExternalId,
) -> Result<(), SyncError> {
    if &record.external_id == real_id {
        return Ok(());
    }
    let previous = record.external_id.clone();
    updater
        .update(record, |r| r.external_id = real_id.clone())
        .await?;
    tracing::info!(key = %record.key, from = %previous, to = %real_id, "migrated pending identity");
    Ok(())
}
