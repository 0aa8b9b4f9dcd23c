pub mod metadata;
pub mod storage;

pub use metadata::{BlobRecord, CacheSource, CacheStats, ManifestRecord};
pub use storage::CacheStorage;
