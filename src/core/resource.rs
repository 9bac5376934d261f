// src/core/resource.rs

//! Content-addressed resource keys: `/registry/{uuid}/{hash}`, `/package/{uuid}/{hash}`,
//! and `/artifact/{hash}`. Keys are immutable and parsed once at the HTTP boundary.

use std::fmt;

use crate::core::errors::PkgVaultError;

const HASH_LEN: usize = 40;

fn is_hex(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_digit() || c.is_ascii_lowercase() && c.is_ascii_hexdigit())
}

fn is_tree_hash(s: &str) -> bool {
    s.len() == HASH_LEN && is_hex(s)
}

fn is_uuid(s: &str) -> bool {
    let parts: Vec<&str> = s.split('-').collect();
    if parts.len() != 5 {
        return false;
    }
    let expected = [8, 4, 4, 4, 12];
    parts
        .iter()
        .zip(expected)
        .all(|(p, len)| p.len() == len && is_hex(p))
}

/// A parsed, validated resource key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResourceKey {
    Registry { uuid: String, hash: String },
    Package { uuid: String, hash: String },
    Artifact { hash: String },
}

impl ResourceKey {
    /// Parses a path of the form seen in an inbound HTTP request, e.g.
    /// `/registry/23338552-e32b-11e9-3998-5254009c5e99/deadbeef...`.
    pub fn parse(path: &str) -> Result<Self, PkgVaultError> {
        let trimmed = path.trim_start_matches('/');
        let parts: Vec<&str> = trimmed.split('/').collect();
        match parts.as_slice() {
            ["registry", uuid, hash] if is_uuid(uuid) && is_tree_hash(hash) => {
                Ok(ResourceKey::Registry {
                    uuid: uuid.to_string(),
                    hash: hash.to_string(),
                })
            }
            ["package", uuid, hash] if is_uuid(uuid) && is_tree_hash(hash) => {
                Ok(ResourceKey::Package {
                    uuid: uuid.to_string(),
                    hash: hash.to_string(),
                })
            }
            ["artifact", hash] if is_tree_hash(hash) => Ok(ResourceKey::Artifact {
                hash: hash.to_string(),
            }),
            _ => Err(PkgVaultError::InvalidRequest(format!(
                "'{path}' is not a valid resource key"
            ))),
        }
    }

    pub fn hash(&self) -> &str {
        match self {
            ResourceKey::Registry { hash, .. }
            | ResourceKey::Package { hash, .. }
            | ResourceKey::Artifact { hash } => hash,
        }
    }

    /// Returns a key identical to this one but with its hash replaced — used when
    /// installing a second copy under the no-skip-empty tree hash.
    pub fn with_hash(&self, hash: &str) -> Self {
        match self {
            ResourceKey::Registry { uuid, .. } => ResourceKey::Registry {
                uuid: uuid.clone(),
                hash: hash.to_string(),
            },
            ResourceKey::Package { uuid, .. } => ResourceKey::Package {
                uuid: uuid.clone(),
                hash: hash.to_string(),
            },
            ResourceKey::Artifact { .. } => ResourceKey::Artifact {
                hash: hash.to_string(),
            },
        }
    }

    /// A cache-directory-safe, collision-free string representation, also used as
    /// the resource path segment appended to a storage server's base URL.
    pub fn to_path_string(&self) -> String {
        match self {
            ResourceKey::Registry { uuid, hash } => format!("registry/{uuid}/{hash}"),
            ResourceKey::Package { uuid, hash } => format!("package/{uuid}/{hash}"),
            ResourceKey::Artifact { hash } => format!("artifact/{hash}"),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.to_path_string())
    }
}
