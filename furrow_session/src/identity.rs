//! Stable, UUID-shaped identifiers derived from external identity strings
//!
//! The data backend and blob storage want UUID-shaped keys, but the identity
//! provider hands out opaque identifiers such as `user_2abc…`. A
//! [`StableId`] is the first 128 bits of the SHA-256 digest of the external
//! identifier, laid out in `8-4-4-4-12` hex groups. No version or variant bits
//! are forced, so the value is UUID-shaped without being a real UUID.

use std::fmt;

use ring::digest;
use serde::Serialize;

/// A deterministic, UUID-shaped surrogate for an external identity
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct StableId(String);

impl StableId {
    /// Derives the stable identifier for `external_id`
    ///
    /// Any input, including the empty string, yields a well-formed identifier.
    pub fn derive(external_id: &str) -> Self {
        let digest = digest::digest(&digest::SHA256, external_id.as_bytes());
        let hex = hex::encode(&digest.as_ref()[..16]);

        Self(format!(
            "{}-{}-{}-{}-{}",
            &hex[0..8],
            &hex[8..12],
            &hex[12..16],
            &hex[16..20],
            &hex[20..32],
        ))
    }

    /// The identifier as a string slice
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consumes the identifier, returning the underlying string
    #[inline]
    pub fn into_string(self) -> String {
        self.0
    }

    /// A storage object path namespaced under this identity
    pub fn object_path(&self, file_name: &str) -> String {
        format!("{}/{}", self.0, file_name.trim_start_matches('/'))
    }
}

/// Derives the stable identifier for `external_id`
#[inline]
pub fn derive_id(external_id: &str) -> StableId {
    StableId::derive(external_id)
}

impl fmt::Debug for StableId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("StableId").field(&self.0).finish()
    }
}

impl fmt::Display for StableId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for StableId {
    #[inline]
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<StableId> for String {
    #[inline]
    fn from(id: StableId) -> Self {
        id.0
    }
}
