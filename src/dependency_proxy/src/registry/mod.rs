pub mod blob;
pub mod manifest;
pub mod reference;
pub mod upstream;

pub use blob::{BlobCache, ResolvedBlob};
pub use manifest::{ManifestCache, ResolvedManifest};
pub use reference::Digest;
pub use upstream::{UpstreamClient, UpstreamManifest, UpstreamToken};
