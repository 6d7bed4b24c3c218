//! Encodes and decodes cached values.
//!
//! Values are stored as JSON which is self-describing and readable when inspecting the backing
//! store (e.g. via `redis-cli GET`). Any type implementing **Serialize** and
//! **DeserializeOwned** can be cached, which is checked at compile time by the coordinators.
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{CacheError, CacheResult};

/// Encodes the given value into the bytes to store.
pub fn encode<T: Serialize>(value: &T) -> CacheResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|error| CacheError::Codec {
        operation: "encode",
        error: Arc::new(error),
    })
}

/// Decodes a value which has previously been stored via [encode].
pub fn decode<T: DeserializeOwned>(data: &[u8]) -> CacheResult<T> {
    serde_json::from_slice(data).map_err(|error| CacheError::Codec {
        operation: "decode",
        error: Arc::new(error),
    })
}
