//! CBOR helpers for rows and journal payloads.

use crate::error::{StoreError, StoreResult};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encodes a value as CBOR.
pub fn to_cbor<T: Serialize + ?Sized>(value: &T) -> StoreResult<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(value, &mut buf).map_err(|e| StoreError::codec(e.to_string()))?;
    Ok(buf)
}

/// Decodes a value from CBOR.
pub fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> StoreResult<T> {
    ciborium::de::from_reader(bytes).map_err(|e| StoreError::codec(e.to_string()))
}
