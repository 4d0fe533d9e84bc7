// # Type-Erased Cache Values
//
// The cache stores values of arbitrary types behind `Arc<dyn Any>` with a
// recorded type name and an optional codec tag. Reads downcast back to the
// concrete type and fail with a validation error on mismatch, so a key can
// never silently serve a value of the wrong type.

use crate::error::{FasqError, Result};
use std::any::Any;
use std::sync::Arc;

/// Fixed per-value accounting overhead (map slot, timestamps, counters).
const VALUE_OVERHEAD_BYTES: usize = 24;

/// A cache payload with its runtime type information.
#[derive(Clone)]
pub struct CachedValue {
    data: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
    codec_tag: Option<String>,
    estimated_size: usize,
}

impl CachedValue {
    /// Wrap a value, estimating its memory footprint.
    pub fn new<T: Send + Sync + 'static>(value: T, codec_tag: Option<String>) -> Self {
        let estimated_size = estimate_size(&value);
        CachedValue {
            data: Arc::new(value),
            type_name: std::any::type_name::<T>(),
            codec_tag,
            estimated_size,
        }
    }

    /// Wrap an already shared value.
    pub fn from_arc<T: Send + Sync + 'static>(value: Arc<T>, codec_tag: Option<String>) -> Self {
        let estimated_size = estimate_size(&*value);
        CachedValue {
            data: value,
            type_name: std::any::type_name::<T>(),
            codec_tag,
            estimated_size,
        }
    }

    /// Downcast to the concrete type, failing on mismatch.
    pub fn downcast<T: Send + Sync + 'static>(&self) -> Result<Arc<T>> {
        self.data.clone().downcast::<T>().map_err(|_| {
            FasqError::Validation(format!(
                "cached value type mismatch: stored {}, requested {}",
                self.type_name,
                std::any::type_name::<T>()
            ))
        })
    }

    /// Whether the stored value is a `T`.
    pub fn is<T: Send + Sync + 'static>(&self) -> bool {
        self.data.is::<T>()
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Codec tag used by the persistence pipeline, if the type is registered.
    pub fn codec_tag(&self) -> Option<&str> {
        self.codec_tag.as_deref()
    }

    pub fn estimated_size(&self) -> usize {
        self.estimated_size
    }
}

impl std::fmt::Debug for CachedValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedValue")
            .field("type_name", &self.type_name)
            .field("codec_tag", &self.codec_tag)
            .field("estimated_size", &self.estimated_size)
            .finish()
    }
}

/// Estimate the memory footprint of a value in bytes.
///
/// Heap-carrying standard types are accounted per element; everything else
/// falls back to its struct size. Approximate by design, the cache only
/// needs relative sizes for budget accounting.
fn estimate_size<T: Send + Sync + 'static>(value: &T) -> usize {
    let value = value as &dyn Any;

    if let Some(s) = value.downcast_ref::<String>() {
        return s.len() + VALUE_OVERHEAD_BYTES;
    }
    if let Some(b) = value.downcast_ref::<Vec<u8>>() {
        return b.len() + VALUE_OVERHEAD_BYTES;
    }
    if let Some(j) = value.downcast_ref::<serde_json::Value>() {
        return estimate_json_size(j) + VALUE_OVERHEAD_BYTES;
    }

    std::mem::size_of::<T>().max(1) + VALUE_OVERHEAD_BYTES
}

/// Per-variant accounting for JSON payloads.
fn estimate_json_size(value: &serde_json::Value) -> usize {
    match value {
        serde_json::Value::Null => 1,
        serde_json::Value::Bool(_) => 1,
        serde_json::Value::Number(_) => 8,
        serde_json::Value::String(s) => s.len() + 24,
        serde_json::Value::Array(items) => {
            items.iter().map(estimate_json_size).sum::<usize>() + 24
        }
        serde_json::Value::Object(map) => {
            map.iter()
                .map(|(k, v)| k.len() + 24 + estimate_json_size(v))
                .sum::<usize>()
                + 32
        }
    }
}
