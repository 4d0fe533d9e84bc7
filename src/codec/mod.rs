// # Codec Registry
//
// Maps a stable string tag to an encode/decode pair that converts
// in-memory values to and from JSON for the persistence pipeline. The
// cache stores the tag alongside each payload; a value whose type is not
// registered is simply never persisted.

use crate::common::CachedValue;
use crate::error::{FasqError, Result};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

type EncodeFn = Arc<dyn Fn(&CachedValue) -> Result<serde_json::Value> + Send + Sync>;
type DecodeFn = Arc<dyn Fn(serde_json::Value) -> Result<CachedValue> + Send + Sync>;

struct Codec {
    encode: EncodeFn,
    decode: DecodeFn,
}

/// Registry of persistable value types, keyed by stable string tag.
#[derive(Default)]
pub struct CodecRegistry {
    by_tag: RwLock<HashMap<String, Codec>>,
    tags_by_type: RwLock<HashMap<TypeId, String>>,
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a serde-serializable type under a stable tag.
    ///
    /// Re-registering the same tag for a different type is rejected so
    /// persisted rows keep decoding to the type that wrote them.
    pub fn register<T>(&self, tag: &str) -> Result<()>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        if tag.is_empty() {
            return Err(FasqError::Validation("codec tag must not be empty".to_string()));
        }

        let mut by_tag = self.by_tag.write();
        let mut tags_by_type = self.tags_by_type.write();

        let type_id = TypeId::of::<T>();
        if let Some(existing) = tags_by_type.get(&type_id) {
            if existing != tag {
                return Err(FasqError::Validation(format!(
                    "type {} already registered under tag {:?}",
                    std::any::type_name::<T>(),
                    existing
                )));
            }
            return Ok(());
        }
        if by_tag.contains_key(tag) {
            return Err(FasqError::Validation(format!(
                "codec tag {:?} already registered for another type",
                tag
            )));
        }

        let decode_tag = tag.to_string();
        by_tag.insert(
            tag.to_string(),
            Codec {
                encode: Arc::new(|value: &CachedValue| {
                    let data = value.downcast::<T>()?;
                    serde_json::to_value(&*data)
                        .map_err(|e| FasqError::Persistence(format!("encode failed: {}", e)))
                }),
                decode: Arc::new(move |json: serde_json::Value| {
                    let data: T = serde_json::from_value(json)
                        .map_err(|e| FasqError::Persistence(format!("decode failed: {}", e)))?;
                    Ok(CachedValue::new(data, Some(decode_tag.clone())))
                }),
            },
        );
        tags_by_type.insert(type_id, tag.to_string());
        Ok(())
    }

    /// Tag registered for a type, if any.
    pub fn tag_for<T: 'static>(&self) -> Option<String> {
        self.tags_by_type.read().get(&TypeId::of::<T>()).cloned()
    }

    /// Encode a cached value through its registered codec.
    pub fn encode(&self, tag: &str, value: &CachedValue) -> Result<serde_json::Value> {
        let by_tag = self.by_tag.read();
        let codec = by_tag
            .get(tag)
            .ok_or_else(|| FasqError::Validation(format!("no codec registered for tag {:?}", tag)))?;
        let encode = codec.encode.clone();
        drop(by_tag);
        encode(value)
    }

    /// Decode a JSON payload back into a cached value.
    pub fn decode(&self, tag: &str, json: serde_json::Value) -> Result<CachedValue> {
        let by_tag = self.by_tag.read();
        let codec = by_tag
            .get(tag)
            .ok_or_else(|| FasqError::Validation(format!("no codec registered for tag {:?}", tag)))?;
        let decode = codec.decode.clone();
        drop(by_tag);
        decode(json)
    }

    pub fn is_registered(&self, tag: &str) -> bool {
        self.by_tag.read().contains_key(tag)
    }
}

impl std::fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecRegistry")
            .field("tags", &self.by_tag.read().keys().collect::<Vec<_>>())
            .finish()
    }
}
