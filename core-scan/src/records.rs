//! Typed JSON blob access shared by every component that persists records.

use crate::{Result, ScanError};
use bridge_traits::storage::RemoteStore;
use serde::{de::DeserializeOwned, Serialize};
use tracing::warn;

/// Read and decode a blob
///
/// A blob that exists but cannot be decoded is a malformed record: it is
/// logged and reported as absent so callers fall back to a fresh start.
pub(crate) async fn read_record<T: DeserializeOwned>(
    store: &dyn RemoteStore,
    path: &str,
) -> Result<Option<T>> {
    let Some(value) = store.read_blob(path).await? else {
        return Ok(None);
    };

    match serde_json::from_value::<T>(value) {
        Ok(record) => Ok(Some(record)),
        Err(e) => {
            let err = ScanError::MalformedRecord {
                path: path.to_string(),
                message: e.to_string(),
            };
            warn!(path, error = %err, "Ignoring malformed record");
            Ok(None)
        }
    }
}

pub(crate) async fn write_record<T: Serialize + ?Sized>(
    store: &dyn RemoteStore,
    path: &str,
    record: &T,
) -> Result<()> {
    let value = serde_json::to_value(record)?;
    store.write_blob(path, &value).await?;
    Ok(())
}
