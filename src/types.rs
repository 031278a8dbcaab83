//! Logical type system and schema conversion.
//!
//! OrcaPod recognizes a small algebra of logical types ([`DataType`]) mapped
//! onto Arrow's columnar schema. A [`TypeSpec`] is an ordered mapping from
//! field name to logical type; iteration order is declaration order, while
//! content hashing sorts by field name so insertion order never affects
//! identity.
//!
//! The `path` logical type denotes a reference to external content. It is
//! carried as a string column and round-trips through Arrow via field
//! metadata.

use crate::error::{OrcaError, Result};
use arrow::datatypes::{DataType as ArrowDataType, Field, Schema, TimeUnit};
use indexmap::IndexMap;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher as StdHasher};

/// Field-metadata key marking a string column as a `path` column.
const PATH_METADATA_KEY: &str = "orcapod.type";
const PATH_METADATA_VALUE: &str = "path";

/// Logical types supported by the stream algebra.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DataType {
  Boolean,
  Int8,
  Int16,
  Int32,
  Int64,
  UInt8,
  UInt16,
  UInt32,
  UInt64,
  Float32,
  Float64,
  String,
  Binary,
  /// Microseconds since the UNIX epoch, UTC.
  Timestamp,
  /// A reference to external content, carried as a string.
  Path,
}

impl DataType {
  /// Stable one-byte code for this type; feeds the content hasher.
  #[must_use]
  pub const fn type_code(&self) -> u8 {
    match self {
      DataType::Boolean => 1,
      DataType::Int8 => 2,
      DataType::Int16 => 3,
      DataType::Int32 => 4,
      DataType::Int64 => 5,
      DataType::UInt8 => 6,
      DataType::UInt16 => 7,
      DataType::UInt32 => 8,
      DataType::UInt64 => 9,
      DataType::Float32 => 10,
      DataType::Float64 => 11,
      DataType::String => 12,
      DataType::Binary => 13,
      DataType::Timestamp => 14,
      DataType::Path => 15,
    }
  }

  /// Returns the lowercase type name.
  #[must_use]
  pub const fn name(&self) -> &'static str {
    match self {
      DataType::Boolean => "boolean",
      DataType::Int8 => "int8",
      DataType::Int16 => "int16",
      DataType::Int32 => "int32",
      DataType::Int64 => "int64",
      DataType::UInt8 => "uint8",
      DataType::UInt16 => "uint16",
      DataType::UInt32 => "uint32",
      DataType::UInt64 => "uint64",
      DataType::Float32 => "float32",
      DataType::Float64 => "float64",
      DataType::String => "string",
      DataType::Binary => "binary",
      DataType::Timestamp => "timestamp",
      DataType::Path => "path",
    }
  }

  /// Returns true for signed or unsigned integer types.
  #[must_use]
  pub const fn is_integer(&self) -> bool {
    matches!(
      self,
      DataType::Int8
        | DataType::Int16
        | DataType::Int32
        | DataType::Int64
        | DataType::UInt8
        | DataType::UInt16
        | DataType::UInt32
        | DataType::UInt64
    )
  }

  /// Returns true for floating-point types.
  #[must_use]
  pub const fn is_float(&self) -> bool {
    matches!(self, DataType::Float32 | DataType::Float64)
  }

  /// Returns true for integer or floating-point types.
  #[must_use]
  pub const fn is_numeric(&self) -> bool {
    self.is_integer() || self.is_float()
  }

  /// Converts to the Arrow data type.
  #[must_use]
  pub fn to_arrow(&self) -> ArrowDataType {
    match self {
      DataType::Boolean => ArrowDataType::Boolean,
      DataType::Int8 => ArrowDataType::Int8,
      DataType::Int16 => ArrowDataType::Int16,
      DataType::Int32 => ArrowDataType::Int32,
      DataType::Int64 => ArrowDataType::Int64,
      DataType::UInt8 => ArrowDataType::UInt8,
      DataType::UInt16 => ArrowDataType::UInt16,
      DataType::UInt32 => ArrowDataType::UInt32,
      DataType::UInt64 => ArrowDataType::UInt64,
      DataType::Float32 => ArrowDataType::Float32,
      DataType::Float64 => ArrowDataType::Float64,
      DataType::String | DataType::Path => ArrowDataType::Utf8,
      DataType::Binary => ArrowDataType::Binary,
      DataType::Timestamp => ArrowDataType::Timestamp(TimeUnit::Microsecond, None),
    }
  }

  /// Builds an Arrow field for a column of this type. `Path` columns carry
  /// marker metadata so the logical type survives a schema round trip.
  #[must_use]
  pub fn arrow_field(&self, name: &str) -> Field {
    let field = Field::new(name, self.to_arrow(), false);
    if *self == DataType::Path {
      let mut metadata = HashMap::new();
      metadata.insert(PATH_METADATA_KEY.to_string(), PATH_METADATA_VALUE.to_string());
      field.with_metadata(metadata)
    } else {
      field
    }
  }

  /// Recovers the logical type from an Arrow field, rejecting unsupported
  /// Arrow types.
  pub fn from_arrow(field: &Field) -> Result<Self> {
    match field.data_type() {
      ArrowDataType::Boolean => Ok(DataType::Boolean),
      ArrowDataType::Int8 => Ok(DataType::Int8),
      ArrowDataType::Int16 => Ok(DataType::Int16),
      ArrowDataType::Int32 => Ok(DataType::Int32),
      ArrowDataType::Int64 => Ok(DataType::Int64),
      ArrowDataType::UInt8 => Ok(DataType::UInt8),
      ArrowDataType::UInt16 => Ok(DataType::UInt16),
      ArrowDataType::UInt32 => Ok(DataType::UInt32),
      ArrowDataType::UInt64 => Ok(DataType::UInt64),
      ArrowDataType::Float32 => Ok(DataType::Float32),
      ArrowDataType::Float64 => Ok(DataType::Float64),
      ArrowDataType::Utf8 => {
        if field.metadata().get(PATH_METADATA_KEY).map(String::as_str) == Some(PATH_METADATA_VALUE)
        {
          Ok(DataType::Path)
        } else {
          Ok(DataType::String)
        }
      }
      ArrowDataType::Binary => Ok(DataType::Binary),
      ArrowDataType::Timestamp(TimeUnit::Microsecond, _) => Ok(DataType::Timestamp),
      other => Err(OrcaError::UnsupportedType(format!(
        "arrow type {other} of column '{}'",
        field.name()
      ))),
    }
  }
}

impl fmt::Display for DataType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

/// An ordered mapping from field name to logical type.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TypeSpec(IndexMap<String, DataType>);

impl TypeSpec {
  /// Creates an empty typespec.
  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  /// Builds a typespec from `(name, type)` pairs in order. Later duplicates
  /// overwrite earlier entries.
  #[must_use]
  pub fn from_pairs(pairs: Vec<(String, DataType)>) -> Self {
    Self(pairs.into_iter().collect())
  }

  /// Number of fields.
  #[must_use]
  pub fn len(&self) -> usize {
    self.0.len()
  }

  /// True when the typespec has no fields.
  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  /// Looks up a field's type by name.
  #[must_use]
  pub fn get(&self, name: &str) -> Option<DataType> {
    self.0.get(name).copied()
  }

  /// True when the field exists.
  #[must_use]
  pub fn contains(&self, name: &str) -> bool {
    self.0.contains_key(name)
  }

  /// Inserts a field at the end; replaces an existing entry in place.
  pub fn insert(&mut self, name: impl Into<String>, ty: DataType) {
    self.0.insert(name.into(), ty);
  }

  /// Field names in declaration order.
  pub fn keys(&self) -> impl Iterator<Item = &str> {
    self.0.keys().map(String::as_str)
  }

  /// `(name, type)` pairs in declaration order.
  pub fn iter(&self) -> impl Iterator<Item = (&str, DataType)> {
    self.0.iter().map(|(k, v)| (k.as_str(), *v))
  }

  /// Converts to an Arrow schema, one non-nullable field per entry.
  #[must_use]
  pub fn to_arrow_schema(&self) -> Schema {
    let fields: Vec<Field> = self.iter().map(|(name, ty)| ty.arrow_field(name)).collect();
    Schema::new(fields)
  }

  /// Recovers a typespec from an Arrow schema, rejecting unsupported types.
  pub fn from_arrow_schema(schema: &Schema) -> Result<Self> {
    let mut spec = TypeSpec::new();
    for field in schema.fields() {
      spec.insert(field.name().clone(), DataType::from_arrow(field)?);
    }
    Ok(spec)
  }

  /// Returns a new typespec with the fields of `self` followed by the
  /// fields of `other` that are not already present.
  #[must_use]
  pub fn union(&self, other: &TypeSpec) -> TypeSpec {
    let mut merged = self.clone();
    for (name, ty) in other.iter() {
      if !merged.contains(name) {
        merged.insert(name, ty);
      }
    }
    merged
  }
}

impl FromIterator<(String, DataType)> for TypeSpec {
  fn from_iter<I: IntoIterator<Item = (String, DataType)>>(iter: I) -> Self {
    Self(iter.into_iter().collect())
  }
}

/// Reconciles two typespecs over a set of shared keys.
///
/// Succeeds iff every shared key exists on both sides with an identical
/// logical type; the merged typespec lists `left`'s fields in order followed
/// by `right`'s fields not shared with `left`.
pub fn reconcile_typespecs<'a>(
  left: &TypeSpec,
  right: &TypeSpec,
  shared: impl IntoIterator<Item = &'a str>,
) -> Result<TypeSpec> {
  for key in shared {
    let lt = left.get(key).ok_or_else(|| OrcaError::MissingField {
      field: key.to_string(),
      context: "left typespec".to_string(),
    })?;
    let rt = right.get(key).ok_or_else(|| OrcaError::MissingField {
      field: key.to_string(),
      context: "right typespec".to_string(),
    })?;
    if lt != rt {
      return Err(OrcaError::SchemaMismatch(format!(
        "shared key '{key}' has type {lt} on one side and {rt} on the other"
      )));
    }
  }
  Ok(left.union(right))
}

/// A scalar value of one of the supported logical types.
///
/// Equality and hashing go through the canonical byte encoding: `-0.0`
/// compares equal to `+0.0` and all NaNs compare equal to each other, so
/// values are usable as grouping keys.
#[derive(Clone, Debug)]
pub enum Value {
  Boolean(bool),
  Int8(i8),
  Int16(i16),
  Int32(i32),
  Int64(i64),
  UInt8(u8),
  UInt16(u16),
  UInt32(u32),
  UInt64(u64),
  Float32(f32),
  Float64(f64),
  String(String),
  Binary(Vec<u8>),
  /// Microseconds since the UNIX epoch, UTC.
  Timestamp(i64),
  Path(String),
}

impl Value {
  /// Creates a path value.
  #[must_use]
  pub fn path(p: impl Into<String>) -> Self {
    Value::Path(p.into())
  }

  /// Creates a timestamp value from microseconds since the UNIX epoch.
  #[must_use]
  pub const fn timestamp(micros: i64) -> Self {
    Value::Timestamp(micros)
  }

  /// Returns the logical type of this value.
  #[must_use]
  pub const fn data_type(&self) -> DataType {
    match self {
      Value::Boolean(_) => DataType::Boolean,
      Value::Int8(_) => DataType::Int8,
      Value::Int16(_) => DataType::Int16,
      Value::Int32(_) => DataType::Int32,
      Value::Int64(_) => DataType::Int64,
      Value::UInt8(_) => DataType::UInt8,
      Value::UInt16(_) => DataType::UInt16,
      Value::UInt32(_) => DataType::UInt32,
      Value::UInt64(_) => DataType::UInt64,
      Value::Float32(_) => DataType::Float32,
      Value::Float64(_) => DataType::Float64,
      Value::String(_) => DataType::String,
      Value::Binary(_) => DataType::Binary,
      Value::Timestamp(_) => DataType::Timestamp,
      Value::Path(_) => DataType::Path,
    }
  }

  /// Canonical byte encoding: the type code followed by big-endian bytes for
  /// numbers, UTF-8 bytes for strings and paths, and raw bytes for binary.
  ///
  /// Floats normalize `-0.0` to `+0.0`; NaN encodes as the canonical quiet
  /// NaN bit pattern.
  #[must_use]
  pub fn canonical_bytes(&self) -> Vec<u8> {
    let mut bytes = vec![self.data_type().type_code()];
    match self {
      Value::Boolean(b) => bytes.push(u8::from(*b)),
      Value::Int8(v) => bytes.extend_from_slice(&v.to_be_bytes()),
      Value::Int16(v) => bytes.extend_from_slice(&v.to_be_bytes()),
      Value::Int32(v) => bytes.extend_from_slice(&v.to_be_bytes()),
      Value::Int64(v) | Value::Timestamp(v) => bytes.extend_from_slice(&v.to_be_bytes()),
      Value::UInt8(v) => bytes.extend_from_slice(&v.to_be_bytes()),
      Value::UInt16(v) => bytes.extend_from_slice(&v.to_be_bytes()),
      Value::UInt32(v) => bytes.extend_from_slice(&v.to_be_bytes()),
      Value::UInt64(v) => bytes.extend_from_slice(&v.to_be_bytes()),
      Value::Float32(v) => {
        let bits = if v.is_nan() {
          0x7fc0_0000
        } else if *v == 0.0 {
          0
        } else {
          v.to_bits()
        };
        bytes.extend_from_slice(&bits.to_be_bytes());
      }
      Value::Float64(v) => {
        let bits = if v.is_nan() {
          0x7ff8_0000_0000_0000
        } else if *v == 0.0 {
          0
        } else {
          v.to_bits()
        };
        bytes.extend_from_slice(&bits.to_be_bytes());
      }
      Value::String(s) | Value::Path(s) => bytes.extend_from_slice(s.as_bytes()),
      Value::Binary(b) => bytes.extend_from_slice(b),
    }
    bytes
  }
}

impl PartialEq for Value {
  fn eq(&self, other: &Self) -> bool {
    self.canonical_bytes() == other.canonical_bytes()
  }
}

impl Eq for Value {}

impl Hash for Value {
  fn hash<H: StdHasher>(&self, state: &mut H) {
    self.canonical_bytes().hash(state);
  }
}

impl fmt::Display for Value {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Value::Boolean(b) => write!(f, "{b}"),
      Value::Int8(v) => write!(f, "{v}"),
      Value::Int16(v) => write!(f, "{v}"),
      Value::Int32(v) => write!(f, "{v}"),
      Value::Int64(v) => write!(f, "{v}"),
      Value::UInt8(v) => write!(f, "{v}"),
      Value::UInt16(v) => write!(f, "{v}"),
      Value::UInt32(v) => write!(f, "{v}"),
      Value::UInt64(v) => write!(f, "{v}"),
      Value::Float32(v) => write!(f, "{v}"),
      Value::Float64(v) => write!(f, "{v}"),
      Value::String(s) => write!(f, "{s:?}"),
      Value::Binary(b) => write!(f, "<{} bytes>", b.len()),
      Value::Timestamp(v) => write!(f, "{v}us"),
      Value::Path(p) => write!(f, "path({p:?})"),
    }
  }
}

macro_rules! impl_value_from {
  ($($t:ty => $variant:ident),* $(,)?) => {
    $(
      impl From<$t> for Value {
        fn from(v: $t) -> Self {
          Value::$variant(v)
        }
      }
    )*
  };
}

impl_value_from! {
  bool => Boolean,
  i8 => Int8,
  i16 => Int16,
  i32 => Int32,
  i64 => Int64,
  u8 => UInt8,
  u16 => UInt16,
  u32 => UInt32,
  u64 => UInt64,
  f32 => Float32,
  f64 => Float64,
  String => String,
  Vec<u8> => Binary,
}

impl From<&str> for Value {
  fn from(v: &str) -> Self {
    Value::String(v.to_string())
  }
}

/// Maps a Rust scalar type onto its logical [`DataType`] and converts it to
/// and from [`Value`]. Used by the [`function_pod!`](crate::function_pod)
/// macro to derive pod signatures from typed Rust signatures.
pub trait ScalarType: Sized {
  /// The logical type this Rust type maps to.
  const DATA_TYPE: DataType;

  /// Wraps a Rust value.
  fn into_value(self) -> Value;

  /// Extracts a Rust value, failing on a logical-type mismatch.
  fn from_value(value: &Value) -> Result<Self>;
}

macro_rules! impl_scalar_type {
  ($($t:ty => $variant:ident / $dt:ident),* $(,)?) => {
    $(
      impl ScalarType for $t {
        const DATA_TYPE: DataType = DataType::$dt;

        fn into_value(self) -> Value {
          Value::$variant(self)
        }

        fn from_value(value: &Value) -> Result<Self> {
          match value {
            Value::$variant(v) => Ok(v.clone()),
            other => Err(OrcaError::SchemaMismatch(format!(
              "expected {}, got {}",
              DataType::$dt,
              other.data_type()
            ))),
          }
        }
      }
    )*
  };
}

impl_scalar_type! {
  bool => Boolean / Boolean,
  i8 => Int8 / Int8,
  i16 => Int16 / Int16,
  i32 => Int32 / Int32,
  i64 => Int64 / Int64,
  u8 => UInt8 / UInt8,
  u16 => UInt16 / UInt16,
  u32 => UInt32 / UInt32,
  u64 => UInt64 / UInt64,
  f32 => Float32 / Float32,
  f64 => Float64 / Float64,
  String => String / String,
  Vec<u8> => Binary / Binary,
}

/// Infers a typespec from `(name, value)` pairs in order.
pub(crate) fn typespec_of_pairs(pairs: &[(String, Value)]) -> TypeSpec {
  pairs
    .iter()
    .map(|(name, value)| (name.clone(), value.data_type()))
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_typespec_preserves_declaration_order() {
    let spec = TypeSpec::from_pairs(vec![
      ("b".to_string(), DataType::Int64),
      ("a".to_string(), DataType::String),
    ]);
    let keys: Vec<&str> = spec.keys().collect();
    assert_eq!(keys, vec!["b", "a"]);
  }

  #[test]
  fn test_arrow_schema_round_trip() {
    let spec = TypeSpec::from_pairs(vec![
      ("flag".to_string(), DataType::Boolean),
      ("count".to_string(), DataType::Int64),
      ("score".to_string(), DataType::Float64),
      ("name".to_string(), DataType::String),
      ("blob".to_string(), DataType::Binary),
      ("at".to_string(), DataType::Timestamp),
      ("file".to_string(), DataType::Path),
    ]);
    let schema = spec.to_arrow_schema();
    let recovered = TypeSpec::from_arrow_schema(&schema).unwrap();
    assert_eq!(spec, recovered);
  }

  #[test]
  fn test_from_arrow_rejects_unsupported() {
    let schema = Schema::new(vec![Field::new(
      "x",
      ArrowDataType::Decimal128(10, 2),
      false,
    )]);
    let err = TypeSpec::from_arrow_schema(&schema).unwrap_err();
    assert!(matches!(err, OrcaError::UnsupportedType(_)));
  }

  #[test]
  fn test_reconcile_merges_on_matching_shared_keys() {
    let left = TypeSpec::from_pairs(vec![
      ("id".to_string(), DataType::Int64),
      ("a".to_string(), DataType::String),
    ]);
    let right = TypeSpec::from_pairs(vec![
      ("id".to_string(), DataType::Int64),
      ("b".to_string(), DataType::Boolean),
    ]);
    let merged = reconcile_typespecs(&left, &right, ["id"]).unwrap();
    let keys: Vec<&str> = merged.keys().collect();
    assert_eq!(keys, vec!["id", "a", "b"]);
  }

  #[test]
  fn test_reconcile_rejects_type_conflict() {
    let left = TypeSpec::from_pairs(vec![("id".to_string(), DataType::Int64)]);
    let right = TypeSpec::from_pairs(vec![("id".to_string(), DataType::String)]);
    let err = reconcile_typespecs(&left, &right, ["id"]).unwrap_err();
    assert!(matches!(err, OrcaError::SchemaMismatch(_)));
  }

  #[test]
  fn test_value_float_normalization() {
    assert_eq!(Value::Float64(-0.0), Value::Float64(0.0));
    assert_eq!(Value::Float64(f64::NAN), Value::Float64(-f64::NAN));
    assert_ne!(Value::Float64(1.0), Value::Float64(2.0));
  }

  #[test]
  fn test_value_type_codes_disambiguate() {
    // Same payload bytes, different logical types.
    assert_ne!(Value::Int64(1), Value::Timestamp(1));
    assert_ne!(Value::String("p".into()), Value::Path("p".into()));
  }

  #[test]
  fn test_scalar_type_round_trip() {
    let v = 42i64.into_value();
    assert_eq!(i64::from_value(&v).unwrap(), 42);
    assert!(String::from_value(&v).is_err());
  }
}
