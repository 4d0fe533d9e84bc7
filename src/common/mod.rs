// # Common Types
//
// Query keys and the type-erased value wrapper shared by the cache,
// the query state machines and the persistence pipeline.

pub mod key;
pub mod value;

pub use key::QueryKey;
pub use value::CachedValue;

/// Maximum accepted key length in bytes.
pub const MAX_KEY_LENGTH: usize = 255;
