use baseline::SnapshotError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

/// Serialize a snapshot struct into the named-fields map the store expects.
pub(crate) fn to_fields<T: Serialize>(snapshot: &T) -> Result<Map<String, Value>, SnapshotError> {
    let value =
        serde_json::to_value(snapshot).map_err(|source| SnapshotError::Serialize { source })?;
    match value {
        Value::Object(fields) => Ok(fields),
        // Snapshot structs always serialize to objects.
        _ => Ok(Map::new()),
    }
}

/// Deserialize a snapshot struct from its stored named fields.
pub(crate) fn from_fields<T: DeserializeOwned>(fields: Map<String, Value>) -> Result<T, String> {
    serde_json::from_value(Value::Object(fields))
        .map_err(|err| format!("bad snapshot fields: {err}"))
}
