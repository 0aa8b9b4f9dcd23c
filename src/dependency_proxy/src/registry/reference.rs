//! Validation of group names, image names, tags and content digests.
//!
//! Every name that reaches the cache directory layout or an upstream URL passes
//! through here first, so a crafted path segment can never escape the cache root.

use crate::error::{DependencyProxyError, Result};
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::str::FromStr;

const SHA256_PREFIX: &str = "sha256:";
const MAX_TAG_LEN: usize = 128;

/// A `sha256:<hex>` content address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Digest {
    hex: String,
}

impl Digest {
    /// Digest of the given bytes
    pub fn of(data: &[u8]) -> Self {
        Self {
            hex: format!("{:x}", Sha256::digest(data)),
        }
    }

    pub(crate) fn from_hasher(hasher: Sha256) -> Self {
        Self {
            hex: format!("{:x}", hasher.finalize()),
        }
    }

    /// Lowercase hex part without the algorithm prefix
    pub fn hex(&self) -> &str {
        &self.hex
    }
}

impl FromStr for Digest {
    type Err = DependencyProxyError;

    fn from_str(s: &str) -> Result<Self> {
        let hex = s.strip_prefix(SHA256_PREFIX).ok_or_else(|| {
            DependencyProxyError::InvalidReference(format!("unsupported digest: {}", s))
        })?;
        if hex.len() != 64 || !hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(DependencyProxyError::InvalidReference(format!(
                "malformed sha256 digest: {}",
                s
            )));
        }
        Ok(Self {
            hex: hex.to_string(),
        })
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", SHA256_PREFIX, self.hex)
    }
}

impl serde::Serialize for Digest {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for Digest {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

fn is_name_component(s: &str) -> bool {
    !s.is_empty()
        && s != "."
        && s != ".."
        && s.bytes()
            .all(|b| matches!(b, b'a'..=b'z' | b'0'..=b'9' | b'.' | b'_' | b'-'))
        && s.bytes().next().is_some_and(|b| b.is_ascii_alphanumeric())
}

/// Group identifiers are a single path component (case preserved).
pub fn validate_group(group: &str) -> Result<()> {
    let ok = !group.is_empty()
        && group.len() <= 255
        && group != "."
        && group != ".."
        && group
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'));
    if ok {
        Ok(())
    } else {
        Err(DependencyProxyError::InvalidReference(format!(
            "invalid group: {}",
            group
        )))
    }
}

/// Image names are one or more lowercase components separated by `/`.
pub fn validate_image(image: &str) -> Result<()> {
    if image.len() <= 255 && image.split('/').all(is_name_component) {
        Ok(())
    } else {
        Err(DependencyProxyError::InvalidReference(format!(
            "invalid image name: {}",
            image
        )))
    }
}

/// Tags follow the distribution grammar `[A-Za-z0-9_][A-Za-z0-9._-]{0,127}`;
/// a digest reference is accepted in the tag position too.
pub fn validate_tag(tag: &str) -> Result<()> {
    if tag.starts_with(SHA256_PREFIX) {
        return tag.parse::<Digest>().map(|_| ());
    }
    let ok = !tag.is_empty()
        && tag.len() <= MAX_TAG_LEN
        && tag
            .bytes()
            .next()
            .is_some_and(|b| b.is_ascii_alphanumeric() || b == b'_')
        && tag
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'));
    if ok {
        Ok(())
    } else {
        Err(DependencyProxyError::InvalidReference(format!(
            "invalid tag: {}",
            tag
        )))
    }
}

/// Repository path as the upstream registry knows it.
/// Docker Hub official images live under `library/`.
pub fn upstream_repository(image: &str) -> String {
    if image.contains('/') {
        image.to_string()
    } else {
        format!("library/{}", image)
    }
}

/// Scope string a pull token is bound to
pub fn pull_scope(group: &str, image: &str) -> String {
    format!("{}/{}", group, image)
}
