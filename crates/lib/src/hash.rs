//! Build-hash primitives for content addressing.
//!
//! A [`BuildHash`] binds a package's full effective build inputs: the
//! canonical JSON of its definition, the bytes of its build script, the
//! bytes of a file-type source, and the hashes of its dependencies. Two
//! packages with equal hashes resolve to the same store path and are
//! built at most once.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::consts::BUILD_HASH_LEN;

/// A truncated hex sha256 digest identifying one package build.
///
/// The truncation keeps store directory names readable while retaining
/// enough collision resistance for a store that holds at most a few
/// thousand artifacts.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BuildHash(pub String);

impl std::fmt::Display for BuildHash {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Incremental digest over an ordered sequence of input parts.
///
/// Order matters: the same parts fed in a different order produce a
/// different hash.
pub struct Hasher(Sha256);

impl Hasher {
  pub fn new() -> Self {
    Self(Sha256::new())
  }

  pub fn update(&mut self, part: &[u8]) {
    self.0.update(part);
  }

  pub fn finish(self) -> BuildHash {
    let full = format!("{:x}", self.0.finalize());
    BuildHash(full[..BUILD_HASH_LEN].to_string())
  }
}

impl Default for Hasher {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn hash_of(parts: &[&[u8]]) -> BuildHash {
    let mut h = Hasher::new();
    for part in parts {
      h.update(part);
    }
    h.finish()
  }

  #[test]
  fn hash_has_fixed_length() {
    assert_eq!(hash_of(&[b"content"]).0.len(), BUILD_HASH_LEN);
    assert_eq!(hash_of(&[]).0.len(), BUILD_HASH_LEN);
  }

  #[test]
  fn hash_is_deterministic() {
    assert_eq!(hash_of(&[b"a", b"b"]), hash_of(&[b"a", b"b"]));
  }

  #[test]
  fn hash_differs_with_content() {
    assert_ne!(hash_of(&[b"a"]), hash_of(&[b"b"]));
  }

  #[test]
  fn hash_is_order_sensitive() {
    assert_ne!(hash_of(&[b"a", b"b"]), hash_of(&[b"b", b"a"]));
  }
}
