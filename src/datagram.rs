//! Tag and packet records.
//!
//! A [`Tag`] identifies a stream row within its logical domain (the role of
//! a primary key); a [`Packet`] carries the row's data plus its typespec,
//! per-field provenance ([`SourceInfo`]), and the [`DataContext`] under
//! which it was produced. Both are immutable after construction: every
//! transforming operation returns a new instance, and the packet content
//! hash is memoized under idempotent lazy initialization.
//!
//! Besides its data fields, a packet may carry **meta fields**: system
//! annotations named with a [`META_PREFIX`] (`__`) prefix, held separately
//! from the data and excluded from the content hash. Meta fields survive
//! the data-field operations (`select`, `rename`, ...) and round-trip
//! through table materialization as ordinary `__`-prefixed columns.

use crate::context::DataContext;
use crate::error::{OrcaError, Result};
use crate::hash::{Fingerprint, Hasher};
use crate::types::{typespec_of_pairs, TypeSpec, Value};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

/// Prefix distinguishing meta fields from data fields.
pub const META_PREFIX: &str = "__";

fn normalize_meta_key(key: &str) -> String {
  if key.starts_with(META_PREFIX) {
    key.to_string()
  } else {
    format!("{META_PREFIX}{key}")
  }
}

/// Per-field origin of a packet value.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceInfo {
  /// The value was supplied externally (a source stream).
  Input,
  /// The value was produced by a pod call.
  Invocation {
    /// Fingerprint of the producing call.
    fingerprint: Fingerprint,
    /// Output field of the producing call.
    field: String,
  },
}

impl SourceInfo {
  /// Encodes for a `_source_<field>` table column: `input`, or
  /// `<fingerprint hex>:<field>`.
  #[must_use]
  pub fn to_column_string(&self) -> String {
    match self {
      SourceInfo::Input => "input".to_string(),
      SourceInfo::Invocation { fingerprint, field } => {
        format!("{}:{}", fingerprint.to_hex(), field)
      }
    }
  }

  /// Decodes the encoding produced by [`SourceInfo::to_column_string`].
  pub fn from_column_string(encoded: &str) -> Result<Self> {
    if encoded == "input" {
      return Ok(SourceInfo::Input);
    }
    let (hex, field) = encoded.split_once(':').ok_or_else(|| {
      OrcaError::Serialization(format!("malformed source info '{encoded}'"))
    })?;
    Ok(SourceInfo::Invocation {
      fingerprint: Fingerprint::from_hex(hex)?,
      field: field.to_string(),
    })
  }
}

fn check_values(spec: &TypeSpec, values: &[Value], what: &str) -> Result<()> {
  if spec.len() != values.len() {
    return Err(OrcaError::SchemaMismatch(format!(
      "{what} has {} fields but {} values",
      spec.len(),
      values.len()
    )));
  }
  for ((name, declared), value) in spec.iter().zip(values) {
    if value.data_type() != declared {
      return Err(OrcaError::SchemaMismatch(format!(
        "{what} field '{name}' declared {declared} but value is {}",
        value.data_type()
      )));
    }
  }
  Ok(())
}

/// An immutable keyed record identifying a stream row.
///
/// Tag values are hashable and comparable; equal tags identify the same
/// logical row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tag {
  spec: TypeSpec,
  values: Vec<Value>,
}

impl Tag {
  /// Creates a tag, validating that values match the typespec in order.
  pub fn new(spec: TypeSpec, values: Vec<Value>) -> Result<Self> {
    check_values(&spec, &values, "tag")?;
    Ok(Self { spec, values })
  }

  /// Creates a tag from `(name, value)` pairs, inferring the typespec.
  pub fn from_pairs(pairs: Vec<(String, Value)>) -> Result<Self> {
    let spec = typespec_of_pairs(&pairs);
    let values = pairs.into_iter().map(|(_, v)| v).collect();
    Self::new(spec, values)
  }

  /// The empty tag.
  #[must_use]
  pub fn empty() -> Self {
    Self {
      spec: TypeSpec::new(),
      values: Vec::new(),
    }
  }

  /// Returns the typespec.
  #[must_use]
  pub fn types(&self) -> &TypeSpec {
    &self.spec
  }

  /// Field names in declared order.
  pub fn keys(&self) -> impl Iterator<Item = &str> {
    self.spec.keys()
  }

  /// Looks up a value by field name.
  #[must_use]
  pub fn get(&self, name: &str) -> Option<&Value> {
    self
      .spec
      .keys()
      .position(|k| k == name)
      .map(|i| &self.values[i])
  }

  /// `(name, value)` pairs in declared order.
  pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
    self.spec.keys().zip(self.values.iter())
  }

  /// Number of fields.
  #[must_use]
  pub fn len(&self) -> usize {
    self.values.len()
  }

  /// True when the tag has no fields.
  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.values.is_empty()
  }

  /// Content hash of this tag under the given hasher.
  #[must_use]
  pub fn content_hash(&self, hasher: &Hasher) -> Fingerprint {
    hasher.hash_record(self.iter())
  }

  /// The tuple of values at the given columns, or `None` if any is missing.
  /// Used as a grouping key by the join operator.
  #[must_use]
  pub fn key_for(&self, columns: &[String]) -> Option<Vec<Value>> {
    columns
      .iter()
      .map(|c| self.get(c).cloned())
      .collect::<Option<Vec<Value>>>()
  }
}

impl fmt::Display for Tag {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{{")?;
    for (i, (name, value)) in self.iter().enumerate() {
      if i > 0 {
        write!(f, ", ")?;
      }
      write!(f, "{name}: {value}")?;
    }
    write!(f, "}}")
  }
}

/// An immutable keyed record carrying a stream row's data.
///
/// Besides its values and typespec, a packet records where each field
/// originated ([`SourceInfo`]), the [`DataContext`] that produced it, and
/// any `__`-prefixed meta fields. The content hash covers the data fields
/// only and is computed at most once.
#[derive(Clone, Debug)]
pub struct Packet {
  spec: TypeSpec,
  values: Vec<Value>,
  source: Vec<SourceInfo>,
  meta: Vec<(String, Value)>,
  context: DataContext,
  content_hash: OnceLock<Fingerprint>,
}

impl PartialEq for Packet {
  fn eq(&self, other: &Self) -> bool {
    self.spec == other.spec
      && self.values == other.values
      && self.source == other.source
      && self.meta == other.meta
      && self.context == other.context
  }
}

impl Eq for Packet {}

impl Packet {
  /// Creates a packet. `source` must align with the typespec when supplied;
  /// omitted source info defaults to [`SourceInfo::Input`] for every field.
  pub fn new(
    spec: TypeSpec,
    values: Vec<Value>,
    source: Option<Vec<SourceInfo>>,
    context: DataContext,
  ) -> Result<Self> {
    check_values(&spec, &values, "packet")?;
    let source = match source {
      Some(source) => {
        if source.len() != spec.len() {
          return Err(OrcaError::SchemaMismatch(format!(
            "packet has {} fields but {} source entries",
            spec.len(),
            source.len()
          )));
        }
        source
      }
      None => vec![SourceInfo::Input; spec.len()],
    };
    Ok(Self {
      spec,
      values,
      source,
      meta: Vec::new(),
      context,
      content_hash: OnceLock::new(),
    })
  }

  /// Creates an externally supplied packet from `(name, value)` pairs under
  /// the default data context.
  pub fn from_pairs(pairs: Vec<(String, Value)>) -> Result<Self> {
    let spec = typespec_of_pairs(&pairs);
    let values = pairs.into_iter().map(|(_, v)| v).collect();
    Self::new(spec, values, None, DataContext::default())
  }

  /// Returns the typespec.
  #[must_use]
  pub fn types(&self) -> &TypeSpec {
    &self.spec
  }

  /// Field names in declared order.
  pub fn keys(&self) -> impl Iterator<Item = &str> {
    self.spec.keys()
  }

  /// Looks up a value by field name.
  #[must_use]
  pub fn get(&self, name: &str) -> Option<&Value> {
    self
      .spec
      .keys()
      .position(|k| k == name)
      .map(|i| &self.values[i])
  }

  /// `(name, value)` pairs in declared order.
  pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
    self.spec.keys().zip(self.values.iter())
  }

  /// Number of fields.
  #[must_use]
  pub fn len(&self) -> usize {
    self.values.len()
  }

  /// True when the packet has no fields.
  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.values.is_empty()
  }

  /// Per-field origin in declared order.
  pub fn source_info(&self) -> impl Iterator<Item = (&str, &SourceInfo)> {
    self.spec.keys().zip(self.source.iter())
  }

  /// Origin of one field.
  #[must_use]
  pub fn source_of(&self, name: &str) -> Option<&SourceInfo> {
    self
      .spec
      .keys()
      .position(|k| k == name)
      .map(|i| &self.source[i])
  }

  /// The data context under which this packet was produced.
  #[must_use]
  pub fn data_context(&self) -> &DataContext {
    &self.context
  }

  /// The context key string of this packet's data context.
  #[must_use]
  pub fn context_key(&self) -> String {
    self.context.context_key()
  }

  /// Content hash over the data fields. Memoized: recomputation after
  /// mutation is impossible because packets are immutable.
  #[must_use]
  pub fn content_hash(&self) -> Fingerprint {
    *self
      .content_hash
      .get_or_init(|| self.context.hasher().hash_record(self.iter()))
  }

  /// Meta field names in insertion order, `__`-prefixed.
  pub fn meta_keys(&self) -> impl Iterator<Item = &str> {
    self.meta.iter().map(|(name, _)| name.as_str())
  }

  /// `(name, value)` meta pairs in insertion order.
  pub fn meta_info(&self) -> impl Iterator<Item = (&str, &Value)> {
    self.meta.iter().map(|(name, value)| (name.as_str(), value))
  }

  /// Typespec of the meta fields, names `__`-prefixed.
  #[must_use]
  pub fn meta_types(&self) -> TypeSpec {
    self
      .meta
      .iter()
      .map(|(name, value)| (name.clone(), value.data_type()))
      .collect()
  }

  /// Looks up a meta value. The key may be given with or without the `__`
  /// prefix.
  #[must_use]
  pub fn meta_value(&self, key: &str) -> Option<&Value> {
    let key = normalize_meta_key(key);
    self
      .meta
      .iter()
      .find(|(name, _)| *name == key)
      .map(|(_, value)| value)
  }

  /// Returns a new packet with meta fields added or updated. Keys are
  /// `__`-prefixed when needed; existing meta fields are overwritten in
  /// place, new ones appended. Meta fields never affect the content hash.
  #[must_use]
  pub fn with_meta_fields(&self, pairs: Vec<(String, Value)>) -> Packet {
    let mut packet = self.clone();
    for (key, value) in pairs {
      let key = normalize_meta_key(&key);
      match packet.meta.iter_mut().find(|(name, _)| *name == key) {
        Some(entry) => entry.1 = value,
        None => packet.meta.push((key, value)),
      }
    }
    packet
  }

  /// Returns a new packet without the named meta fields. Keys may omit the
  /// `__` prefix; missing keys are an error unless `ignore_missing` is set.
  pub fn drop_meta_fields(&self, names: &[&str], ignore_missing: bool) -> Result<Packet> {
    let normalized: Vec<String> = names.iter().map(|name| normalize_meta_key(name)).collect();
    if !ignore_missing {
      for name in &normalized {
        if !self.meta.iter().any(|(key, _)| key == name) {
          return Err(OrcaError::MissingField {
            field: name.clone(),
            context: "packet meta".to_string(),
          });
        }
      }
    }
    let mut packet = self.clone();
    packet.meta.retain(|(key, _)| !normalized.contains(key));
    Ok(packet)
  }

  /// Returns a new packet under a different data context. The content hash
  /// cache is reset: the new context may use a different hasher version.
  #[must_use]
  pub fn with_data_context(&self, context: DataContext) -> Packet {
    Packet {
      spec: self.spec.clone(),
      values: self.values.clone(),
      source: self.source.clone(),
      meta: self.meta.clone(),
      context,
      content_hash: OnceLock::new(),
    }
  }

  /// Materializes this packet as a one-row table, optionally with
  /// `_source_<field>` provenance columns.
  pub fn as_table(&self, include_source: bool) -> Result<arrow::record_batch::RecordBatch> {
    let mut options = crate::table::TableOptions::new();
    if include_source {
      options = options.with_source();
    }
    crate::table::rows_to_batch(
      &TypeSpec::new(),
      &self.spec,
      &[(Tag::empty(), self.clone())],
      &options,
    )
  }

  fn rebuild(
    &self,
    spec: TypeSpec,
    values: Vec<Value>,
    source: Vec<SourceInfo>,
  ) -> Result<Packet> {
    let mut packet = Packet::new(spec, values, Some(source), self.context.clone())?;
    packet.meta = self.meta.clone();
    Ok(packet)
  }

  /// Returns a new packet with only the named fields, in the given order.
  pub fn select(&self, names: &[&str]) -> Result<Packet> {
    let mut spec = TypeSpec::new();
    let mut values = Vec::with_capacity(names.len());
    let mut source = Vec::with_capacity(names.len());
    for name in names {
      let index = self
        .spec
        .keys()
        .position(|k| k == *name)
        .ok_or_else(|| OrcaError::MissingField {
          field: (*name).to_string(),
          context: "packet".to_string(),
        })?;
      spec.insert((*name).to_string(), self.values[index].data_type());
      values.push(self.values[index].clone());
      source.push(self.source[index].clone());
    }
    self.rebuild(spec, values, source)
  }

  /// Returns a new packet without the named fields. Dropping every field is
  /// an error.
  pub fn drop_fields(&self, names: &[&str]) -> Result<Packet> {
    for name in names {
      if !self.spec.contains(name) {
        return Err(OrcaError::MissingField {
          field: (*name).to_string(),
          context: "packet".to_string(),
        });
      }
    }
    let keep: Vec<&str> = self
      .spec
      .keys()
      .filter(|k| !names.contains(k))
      .collect();
    if keep.is_empty() {
      return Err(OrcaError::SchemaMismatch(
        "cannot drop all packet fields".to_string(),
      ));
    }
    self.select(&keep)
  }

  /// Returns a new packet with fields renamed per the mapping; types and
  /// source info carry over.
  pub fn rename(&self, mapping: &[(&str, &str)]) -> Result<Packet> {
    for (old, _) in mapping {
      if !self.spec.contains(old) {
        return Err(OrcaError::MissingField {
          field: (*old).to_string(),
          context: "packet".to_string(),
        });
      }
    }
    let mut spec = TypeSpec::new();
    for (name, ty) in self.spec.iter() {
      let new_name = mapping
        .iter()
        .find(|(old, _)| *old == name)
        .map_or(name, |(_, new)| *new);
      if spec.contains(new_name) {
        return Err(OrcaError::NameCollision(format!(
          "rename produces duplicate field '{new_name}'"
        )));
      }
      spec.insert(new_name.to_string(), ty);
    }
    self.rebuild(spec, self.values.clone(), self.source.clone())
  }

  /// Returns a new packet with an existing field's value replaced. The new
  /// value must match the declared type.
  pub fn update(&self, name: &str, value: Value) -> Result<Packet> {
    let index = self
      .spec
      .keys()
      .position(|k| k == name)
      .ok_or_else(|| OrcaError::MissingField {
        field: name.to_string(),
        context: "packet".to_string(),
      })?;
    let declared = self.spec.get(name).expect("index resolved above");
    if value.data_type() != declared {
      return Err(OrcaError::SchemaMismatch(format!(
        "field '{name}' declared {declared} but update is {}",
        value.data_type()
      )));
    }
    let mut values = self.values.clone();
    values[index] = value;
    self.rebuild(self.spec.clone(), values, self.source.clone())
  }

  /// Returns a new packet with additional fields appended. Existing names
  /// are an error; new fields are externally supplied (`SourceInfo::Input`).
  pub fn with_fields(&self, pairs: Vec<(String, Value)>) -> Result<Packet> {
    let mut spec = self.spec.clone();
    let mut values = self.values.clone();
    let mut source = self.source.clone();
    for (name, value) in pairs {
      if spec.contains(&name) {
        return Err(OrcaError::NameCollision(format!(
          "packet field '{name}' already exists"
        )));
      }
      spec.insert(name, value.data_type());
      values.push(value);
      source.push(SourceInfo::Input);
    }
    self.rebuild(spec, values, source)
  }
}

impl fmt::Display for Packet {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{{")?;
    for (i, (name, value)) in self.iter().enumerate() {
      if i > 0 {
        write!(f, ", ")?;
      }
      write!(f, "{name}: {value}")?;
    }
    write!(f, "}}")
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::types::DataType;

  fn sample_packet() -> Packet {
    Packet::from_pairs(vec![
      ("a".to_string(), Value::Int64(1)),
      ("b".to_string(), Value::String("x".into())),
    ])
    .unwrap()
  }

  #[test]
  fn test_tag_access_in_schema_order() {
    let tag = Tag::from_pairs(vec![
      ("id".to_string(), Value::Int64(3)),
      ("name".to_string(), Value::String("n".into())),
    ])
    .unwrap();
    assert_eq!(tag.keys().collect::<Vec<_>>(), vec!["id", "name"]);
    assert_eq!(tag.get("id"), Some(&Value::Int64(3)));
    assert_eq!(tag.get("missing"), None);
    assert_eq!(tag.to_string(), "{id: 3, name: \"n\"}");
  }

  #[test]
  fn test_tag_rejects_type_mismatch() {
    let spec = TypeSpec::from_pairs(vec![("id".to_string(), DataType::Int64)]);
    let err = Tag::new(spec, vec![Value::String("oops".into())]).unwrap_err();
    assert!(matches!(err, OrcaError::SchemaMismatch(_)));
  }

  #[test]
  fn test_packet_defaults_to_input_source() {
    let packet = sample_packet();
    assert!(packet
      .source_info()
      .all(|(_, s)| *s == SourceInfo::Input));
  }

  #[test]
  fn test_content_hash_is_memoized_and_order_independent() {
    let forward = sample_packet();
    let reversed = Packet::from_pairs(vec![
      ("b".to_string(), Value::String("x".into())),
      ("a".to_string(), Value::Int64(1)),
    ])
    .unwrap();
    assert_eq!(forward.content_hash(), forward.content_hash());
    assert_eq!(forward.content_hash(), reversed.content_hash());
  }

  #[test]
  fn test_select_and_drop() {
    let packet = sample_packet();
    let selected = packet.select(&["b"]).unwrap();
    assert_eq!(selected.keys().collect::<Vec<_>>(), vec!["b"]);
    let dropped = packet.drop_fields(&["a"]).unwrap();
    assert_eq!(dropped.keys().collect::<Vec<_>>(), vec!["b"]);
    assert!(packet.drop_fields(&["a", "b"]).is_err());
    assert!(packet.drop_fields(&["missing"]).is_err());
  }

  #[test]
  fn test_rename_carries_types() {
    let packet = sample_packet();
    let renamed = packet.rename(&[("a", "count")]).unwrap();
    assert_eq!(renamed.types().get("count"), Some(DataType::Int64));
    assert!(packet.rename(&[("a", "b")]).is_err());
  }

  #[test]
  fn test_update_and_with_fields() {
    let packet = sample_packet();
    let updated = packet.update("a", Value::Int64(9)).unwrap();
    assert_eq!(updated.get("a"), Some(&Value::Int64(9)));
    assert!(packet.update("a", Value::Boolean(true)).is_err());
    assert!(packet.update("missing", Value::Int64(0)).is_err());

    let extended = packet
      .with_fields(vec![("c".to_string(), Value::Boolean(true))])
      .unwrap();
    assert_eq!(extended.len(), 3);
    assert!(extended
      .with_fields(vec![("c".to_string(), Value::Boolean(false))])
      .is_err());
  }

  #[test]
  fn test_meta_fields_are_prefixed_and_separate() {
    let packet = sample_packet().with_meta_fields(vec![
      ("pipeline_version".to_string(), Value::String("v2".into())),
      ("__retries".to_string(), Value::Int64(1)),
    ]);
    assert_eq!(
      packet.meta_keys().collect::<Vec<_>>(),
      vec!["__pipeline_version", "__retries"]
    );
    assert_eq!(
      packet.meta_value("pipeline_version"),
      Some(&Value::String("v2".into()))
    );
    assert_eq!(packet.meta_value("__retries"), Some(&Value::Int64(1)));
    // Data accessors stay meta-blind.
    assert_eq!(packet.keys().collect::<Vec<_>>(), vec!["a", "b"]);
    assert_eq!(packet.get("__retries"), None);
  }

  #[test]
  fn test_meta_fields_do_not_affect_content_hash() {
    let plain = sample_packet();
    let annotated =
      plain.with_meta_fields(vec![("note".to_string(), Value::String("x".into()))]);
    assert_eq!(plain.content_hash(), annotated.content_hash());
  }

  #[test]
  fn test_meta_update_and_drop() {
    let packet = sample_packet().with_meta_fields(vec![("n".to_string(), Value::Int64(1))]);
    let updated = packet.with_meta_fields(vec![("n".to_string(), Value::Int64(2))]);
    assert_eq!(updated.meta_value("n"), Some(&Value::Int64(2)));
    assert_eq!(updated.meta_keys().count(), 1);

    let dropped = updated.drop_meta_fields(&["n"], false).unwrap();
    assert_eq!(dropped.meta_keys().count(), 0);
    assert!(updated.drop_meta_fields(&["missing"], false).is_err());
    assert!(updated.drop_meta_fields(&["missing"], true).is_ok());
  }

  #[test]
  fn test_meta_survives_data_field_operations() {
    let packet =
      sample_packet().with_meta_fields(vec![("note".to_string(), Value::String("x".into()))]);
    let selected = packet.select(&["b"]).unwrap();
    assert_eq!(selected.meta_value("note"), Some(&Value::String("x".into())));
    let renamed = packet.rename(&[("a", "count")]).unwrap();
    assert_eq!(renamed.meta_value("note"), Some(&Value::String("x".into())));
  }

  #[test]
  fn test_with_data_context_preserves_record() {
    let packet =
      sample_packet().with_meta_fields(vec![("note".to_string(), Value::String("x".into()))]);
    let ctx = DataContext::new("9.9.9", 1);
    let moved = packet.with_data_context(ctx.clone());
    assert_eq!(moved.data_context(), &ctx);
    assert_eq!(moved.get("a"), packet.get("a"));
    assert_eq!(moved.meta_value("note"), packet.meta_value("note"));
  }

  #[test]
  fn test_packet_as_table_is_one_row() {
    let packet = sample_packet();
    let plain = packet.as_table(false).unwrap();
    assert_eq!(plain.num_rows(), 1);
    assert_eq!(plain.num_columns(), 2);
    let sourced = packet.as_table(true).unwrap();
    assert_eq!(sourced.num_columns(), 4);
  }

  #[test]
  fn test_source_info_column_round_trip() {
    let hasher = Hasher::default();
    let fp = hasher.hash_value(&Value::Int64(1));
    let info = SourceInfo::Invocation {
      fingerprint: fp,
      field: "sum".to_string(),
    };
    let encoded = info.to_column_string();
    assert_eq!(SourceInfo::from_column_string(&encoded).unwrap(), info);
    assert_eq!(
      SourceInfo::from_column_string("input").unwrap(),
      SourceInfo::Input
    );
    assert!(SourceInfo::from_column_string("garbage").is_err());
  }
}
