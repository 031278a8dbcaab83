//! Versioned content hashing.
//!
//! All identity in OrcaPod — packet content hashes, source-stream and
//! invocation fingerprints, pipeline fingerprints — reduces to a
//! [`Fingerprint`]: a hasher version byte plus a 256-bit BLAKE3 digest.
//! Every digest is domain-separated by a prefix (`b"value:"`, `b"record:"`,
//! ...) so hashes of different kinds can never collide, and the version byte
//! participates in equality so bumping [`HASHER_VERSION`] invalidates every
//! previously persisted cache entry.
//!
//! Record hashing sorts fields by name: permuting insertion order of a tag
//! or packet must not change its content hash.

use crate::error::{OrcaError, Result};
use crate::types::{TypeSpec, Value};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::fmt::Write as _;

/// Current hasher version. Prepended to every digest.
pub const HASHER_VERSION: u8 = 1;

/// A versioned content hash: one version byte plus a 32-byte BLAKE3 digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint {
  version: u8,
  digest: [u8; 32],
}

impl Fingerprint {
  /// Returns the hasher version that produced this fingerprint.
  #[must_use]
  pub const fn version(&self) -> u8 {
    self.version
  }

  /// Returns the raw digest bytes (without the version byte).
  #[must_use]
  pub const fn digest(&self) -> &[u8; 32] {
    &self.digest
  }

  /// Hex rendering, version byte first (66 characters).
  #[must_use]
  pub fn to_hex(&self) -> String {
    let mut out = String::with_capacity(66);
    write!(out, "{:02x}", self.version).expect("writing to string");
    for byte in &self.digest {
      write!(out, "{byte:02x}").expect("writing to string");
    }
    out
  }

  /// Parses the hex rendering produced by [`Fingerprint::to_hex`].
  pub fn from_hex(hex: &str) -> Result<Self> {
    if hex.len() != 66 || !hex.is_ascii() {
      return Err(OrcaError::Serialization(format!(
        "malformed fingerprint '{hex}'"
      )));
    }
    let parse_byte = |s: &str| {
      u8::from_str_radix(s, 16)
        .map_err(|_| OrcaError::Serialization(format!("malformed fingerprint '{hex}'")))
    };
    let version = parse_byte(&hex[0..2])?;
    let mut digest = [0u8; 32];
    for (i, chunk) in digest.iter_mut().enumerate() {
      *chunk = parse_byte(&hex[2 + 2 * i..4 + 2 * i])?;
    }
    Ok(Self { version, digest })
  }
}

impl fmt::Display for Fingerprint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.to_hex())
  }
}

impl fmt::Debug for Fingerprint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "Fingerprint({}..)", &self.to_hex()[..10])
  }
}

impl Serialize for Fingerprint {
  fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&self.to_hex())
  }
}

impl<'de> Deserialize<'de> for Fingerprint {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
    let hex = String::deserialize(deserializer)?;
    Fingerprint::from_hex(&hex).map_err(D::Error::custom)
  }
}

/// Deterministic, versioned content hasher.
///
/// Deterministic across processes and platforms: scalars are hashed from
/// their canonical big-endian byte encoding, records sort fields by name,
/// and no pointer- or environment-dependent state participates.
#[derive(Clone, Copy, Debug)]
pub struct Hasher {
  version: u8,
}

impl Default for Hasher {
  fn default() -> Self {
    Self::with_version(HASHER_VERSION)
  }
}

impl Hasher {
  /// Creates a hasher at an explicit version.
  #[must_use]
  pub const fn with_version(version: u8) -> Self {
    Self { version }
  }

  /// Returns the hasher version.
  #[must_use]
  pub const fn version(&self) -> u8 {
    self.version
  }

  fn digest(&self, domain: &'static [u8], feed: impl FnOnce(&mut blake3::Hasher)) -> Fingerprint {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[self.version]);
    hasher.update(domain);
    feed(&mut hasher);
    Fingerprint {
      version: self.version,
      digest: hasher.finalize().into(),
    }
  }

  fn feed_fingerprint(hasher: &mut blake3::Hasher, fp: &Fingerprint) {
    hasher.update(&[fp.version]);
    hasher.update(&fp.digest);
  }

  fn feed_str(hasher: &mut blake3::Hasher, s: &str) {
    hasher.update(&(s.len() as u64).to_be_bytes());
    hasher.update(s.as_bytes());
  }

  /// Hashes a single scalar value.
  #[must_use]
  pub fn hash_value(&self, value: &Value) -> Fingerprint {
    self.digest(b"value:", |h| {
      h.update(&value.canonical_bytes());
    })
  }

  /// Hashes a typespec. Fields are sorted by name so declaration order does
  /// not affect the result.
  #[must_use]
  pub fn hash_schema(&self, spec: &TypeSpec) -> Fingerprint {
    let mut fields: Vec<(&str, u8)> = spec.iter().map(|(n, t)| (n, t.type_code())).collect();
    fields.sort_by_key(|(name, _)| *name);
    self.digest(b"schema:", |h| {
      for (name, code) in fields {
        Self::feed_str(h, name);
        h.update(&[code]);
      }
    })
  }

  /// Hashes a keyed record as `H(sorted_by_key((name, type_code,
  /// H(value)))*)`. The sort is mandatory: insertion order must not affect
  /// the result.
  #[must_use]
  pub fn hash_record<'a>(&self, fields: impl Iterator<Item = (&'a str, &'a Value)>) -> Fingerprint {
    let mut entries: Vec<(&str, &Value)> = fields.collect();
    entries.sort_by_key(|(name, _)| *name);
    self.digest(b"record:", |h| {
      for (name, value) in entries {
        Self::feed_str(h, name);
        h.update(&[value.data_type().type_code()]);
        Self::feed_fingerprint(h, &self.hash_value(value));
      }
    })
  }

  /// Hashes a table as `H(schema_hash, concat(row_hash))`. Row hashes come
  /// from [`Hasher::hash_record`] over each row's fields.
  #[must_use]
  pub fn hash_table(&self, schema: &TypeSpec, row_hashes: &[Fingerprint]) -> Fingerprint {
    let schema_hash = self.hash_schema(schema);
    self.digest(b"table:", |h| {
      Self::feed_fingerprint(h, &schema_hash);
      for row in row_hashes {
        Self::feed_fingerprint(h, row);
      }
    })
  }

  /// Fingerprint of a source stream: the materialized table content plus the
  /// declared tag columns, in declaration order.
  #[must_use]
  pub fn hash_source<'a>(
    &self,
    table: &Fingerprint,
    tag_columns: impl Iterator<Item = &'a str>,
  ) -> Fingerprint {
    self.digest(b"source:", |h| {
      Self::feed_fingerprint(h, table);
      for column in tag_columns {
        Self::feed_str(h, column);
      }
    })
  }

  /// Stable identity of a pod: function name, ordered input name/type list,
  /// ordered output key/type list, and the implementation version.
  #[must_use]
  pub fn hash_pod_identity(
    &self,
    name: &str,
    inputs: &TypeSpec,
    outputs: &TypeSpec,
    impl_version: &str,
  ) -> Fingerprint {
    self.digest(b"pod:", |h| {
      Self::feed_str(h, name);
      for (field, ty) in inputs.iter() {
        Self::feed_str(h, field);
        h.update(&[ty.type_code()]);
      }
      h.update(b"->");
      for (field, ty) in outputs.iter() {
        Self::feed_str(h, field);
        h.update(&[ty.type_code()]);
      }
      Self::feed_str(h, impl_version);
    })
  }

  /// Stable identity of a structural operator: its name plus any bound
  /// parameters, in order.
  #[must_use]
  pub fn hash_operator_identity<'a>(
    &self,
    name: &str,
    params: impl Iterator<Item = &'a str>,
  ) -> Fingerprint {
    self.digest(b"operator:", |h| {
      Self::feed_str(h, name);
      for param in params {
        Self::feed_str(h, param);
      }
    })
  }

  /// Fingerprint of one invocation: kernel identity, ordered upstream
  /// fingerprints, and the declared output schemas.
  #[must_use]
  pub fn hash_invocation(
    &self,
    kernel: &Fingerprint,
    upstreams: &[Fingerprint],
    output_tags: &TypeSpec,
    output_packets: &TypeSpec,
  ) -> Fingerprint {
    self.digest(b"invocation:", |h| {
      Self::feed_fingerprint(h, kernel);
      for upstream in upstreams {
        Self::feed_fingerprint(h, upstream);
      }
      Self::feed_fingerprint(h, &self.hash_schema(output_tags));
      Self::feed_fingerprint(h, &self.hash_schema(output_packets));
    })
  }

  /// Key of a single pod call: the pod identity plus the content hash of the
  /// input packet. Two calls with equal keys are observationally
  /// interchangeable.
  #[must_use]
  pub fn hash_pod_call(&self, pod: &Fingerprint, input: &Fingerprint) -> Fingerprint {
    self.digest(b"call:", |h| {
      Self::feed_fingerprint(h, pod);
      Self::feed_fingerprint(h, input);
    })
  }

  /// Fingerprint of a pipeline: the registration-ordered sequence of
  /// `(node fingerprint, upstream node indices)`.
  #[must_use]
  pub fn hash_pipeline(&self, nodes: &[(Fingerprint, Vec<usize>)]) -> Fingerprint {
    self.digest(b"pipeline:", |h| {
      for (fp, upstream) in nodes {
        Self::feed_fingerprint(h, fp);
        h.update(&(upstream.len() as u64).to_be_bytes());
        for index in upstream {
          h.update(&(*index as u64).to_be_bytes());
        }
      }
    })
  }
}
