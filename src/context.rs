//! Data-context descriptors.
//!
//! Every packet and every store entry carries a [`DataContext`] identifying
//! the OrcaPod semantic version and the hasher version that produced it.
//! Bumping either component changes the context key, which surfaces cache
//! invalidation to readers of persisted tables.

use crate::hash::{Hasher, HASHER_VERSION};
use serde::{Deserialize, Serialize};

/// Library semantic version embedded in context keys.
pub const LIB_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Identifies the library and hasher versions under which data was produced.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataContext {
  lib_version: String,
  hasher_version: u8,
}

impl Default for DataContext {
  fn default() -> Self {
    Self {
      lib_version: LIB_VERSION.to_string(),
      hasher_version: HASHER_VERSION,
    }
  }
}

impl DataContext {
  /// Creates a context with explicit versions.
  #[must_use]
  pub fn new(lib_version: impl Into<String>, hasher_version: u8) -> Self {
    Self {
      lib_version: lib_version.into(),
      hasher_version,
    }
  }

  /// Returns the library version component.
  #[must_use]
  pub fn lib_version(&self) -> &str {
    &self.lib_version
  }

  /// Returns the hasher version component.
  #[must_use]
  pub const fn hasher_version(&self) -> u8 {
    self.hasher_version
  }

  /// Returns the context key string, `orcapod:{lib_version}|hasher:{n}`.
  #[must_use]
  pub fn context_key(&self) -> String {
    format!("orcapod:{}|hasher:{}", self.lib_version, self.hasher_version)
  }

  /// Parses a context key produced by [`DataContext::context_key`].
  #[must_use]
  pub fn from_context_key(key: &str) -> Option<Self> {
    let rest = key.strip_prefix("orcapod:")?;
    let (lib, hasher) = rest.split_once("|hasher:")?;
    let version: u8 = hasher.parse().ok()?;
    Some(Self::new(lib, version))
  }

  /// Returns a hasher at this context's version.
  #[must_use]
  pub fn hasher(&self) -> Hasher {
    Hasher::with_version(self.hasher_version)
  }
}
