//! Conversion between `(tag, packet)` rows and Arrow record batches.
//!
//! Materialization lays out tag columns first (in tag-schema order), then
//! packet columns, then any requested meta (`__`-prefixed) columns, then
//! any requested system columns:
//!
//! - `_source_<field>` — provenance of each packet field,
//! - `_content_hash` (or a caller-chosen name) — the per-row packet content
//!   hash in hex,
//! - `_context_key` — the per-row data-context identifier.
//!
//! Decoding reverses the layout, reconstructing provenance, meta fields,
//! and data context from those columns when present and defaulting to
//! externally supplied (`source=input`) data otherwise.

use crate::context::DataContext;
use crate::datagram::{Packet, SourceInfo, Tag, META_PREFIX};
use crate::error::{OrcaError, Result};
use crate::types::{DataType, TypeSpec, Value};
use arrow::array::{
  Array, ArrayRef, BinaryArray, BooleanArray, Float32Array, Float64Array, Int16Array, Int32Array,
  Int64Array, Int8Array, StringArray, TimestampMicrosecondArray, UInt16Array, UInt32Array,
  UInt64Array, UInt8Array,
};
use arrow::datatypes::{Field, Schema};
use arrow::record_batch::RecordBatch;
use std::sync::Arc;

/// Prefix of per-field provenance columns.
pub const SOURCE_PREFIX: &str = "_source_";
/// Default name of the per-row packet content hash column.
pub const CONTENT_HASH_COLUMN: &str = "_content_hash";
/// Name of the per-row data-context column.
pub const CONTEXT_KEY_COLUMN: &str = "_context_key";

/// Options controlling which system columns a materialized table carries.
#[derive(Clone, Debug, Default)]
pub struct TableOptions {
  /// Emit a `_source_<field>` column per packet field.
  pub include_source: bool,
  /// Emit the per-row packet content hash.
  pub include_content_hash: bool,
  /// Overrides the content hash column name.
  pub content_hash_column: Option<String>,
  /// Emit the per-row data-context key.
  pub include_data_context: bool,
  /// Emit the packets' `__`-prefixed meta fields as columns.
  pub include_meta: bool,
}

impl TableOptions {
  /// Options with no system columns (data columns only).
  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  /// Options with every system and meta column; used for store persistence.
  #[must_use]
  pub fn full() -> Self {
    Self {
      include_source: true,
      include_content_hash: true,
      content_hash_column: None,
      include_data_context: true,
      include_meta: true,
    }
  }

  /// Enables the provenance columns.
  #[must_use]
  pub fn with_source(mut self) -> Self {
    self.include_source = true;
    self
  }

  /// Enables the content hash column.
  #[must_use]
  pub fn with_content_hash(mut self) -> Self {
    self.include_content_hash = true;
    self
  }

  /// Enables the content hash column under a caller-chosen name.
  #[must_use]
  pub fn with_content_hash_column(mut self, name: impl Into<String>) -> Self {
    self.include_content_hash = true;
    self.content_hash_column = Some(name.into());
    self
  }

  /// Enables the data-context column.
  #[must_use]
  pub fn with_data_context(mut self) -> Self {
    self.include_data_context = true;
    self
  }

  /// Enables the meta columns.
  #[must_use]
  pub fn with_meta(mut self) -> Self {
    self.include_meta = true;
    self
  }

  fn content_hash_name(&self) -> &str {
    self
      .content_hash_column
      .as_deref()
      .unwrap_or(CONTENT_HASH_COLUMN)
  }
}

/// True for reserved system-column names.
#[must_use]
pub fn is_system_column(name: &str) -> bool {
  name.starts_with(SOURCE_PREFIX) || name == CONTENT_HASH_COLUMN || name == CONTEXT_KEY_COLUMN
}

fn mismatch(column: &str, expected: DataType, value: &Value) -> OrcaError {
  OrcaError::SchemaMismatch(format!(
    "column '{column}' declared {expected} but row value is {}",
    value.data_type()
  ))
}

macro_rules! collect_column {
  ($values:expr, $column:expr, $expected:expr, $variant:ident) => {{
    $values
      .iter()
      .map(|v| match v {
        Value::$variant(x) => Ok(x.clone()),
        other => Err(mismatch($column, $expected, other)),
      })
      .collect::<Result<Vec<_>>>()?
  }};
}

fn build_array(name: &str, ty: DataType, values: &[&Value]) -> Result<ArrayRef> {
  Ok(match ty {
    DataType::Boolean => Arc::new(BooleanArray::from(collect_column!(
      values, name, ty, Boolean
    ))),
    DataType::Int8 => Arc::new(Int8Array::from(collect_column!(values, name, ty, Int8))),
    DataType::Int16 => Arc::new(Int16Array::from(collect_column!(values, name, ty, Int16))),
    DataType::Int32 => Arc::new(Int32Array::from(collect_column!(values, name, ty, Int32))),
    DataType::Int64 => Arc::new(Int64Array::from(collect_column!(values, name, ty, Int64))),
    DataType::UInt8 => Arc::new(UInt8Array::from(collect_column!(values, name, ty, UInt8))),
    DataType::UInt16 => Arc::new(UInt16Array::from(collect_column!(values, name, ty, UInt16))),
    DataType::UInt32 => Arc::new(UInt32Array::from(collect_column!(values, name, ty, UInt32))),
    DataType::UInt64 => Arc::new(UInt64Array::from(collect_column!(values, name, ty, UInt64))),
    DataType::Float32 => Arc::new(Float32Array::from(collect_column!(
      values, name, ty, Float32
    ))),
    DataType::Float64 => Arc::new(Float64Array::from(collect_column!(
      values, name, ty, Float64
    ))),
    DataType::String => Arc::new(StringArray::from(collect_column!(values, name, ty, String))),
    DataType::Binary => {
      let owned: Vec<Vec<u8>> = collect_column!(values, name, ty, Binary);
      let refs: Vec<&[u8]> = owned.iter().map(Vec::as_slice).collect();
      Arc::new(BinaryArray::from(refs))
    }
    DataType::Timestamp => Arc::new(TimestampMicrosecondArray::from(collect_column!(
      values, name, ty, Timestamp
    ))),
    DataType::Path => Arc::new(StringArray::from(collect_column!(values, name, ty, Path))),
  })
}

fn string_array(values: Vec<String>) -> ArrayRef {
  Arc::new(StringArray::from(values))
}

/// Materializes `(tag, packet)` rows to a record batch.
///
/// With `include_meta`, the meta schema is the union across rows in
/// first-seen order, and every row must carry every meta field.
pub fn rows_to_batch(
  tag_spec: &TypeSpec,
  packet_spec: &TypeSpec,
  rows: &[(Tag, Packet)],
  options: &TableOptions,
) -> Result<RecordBatch> {
  let mut fields: Vec<Field> = Vec::new();
  let mut columns: Vec<ArrayRef> = Vec::new();

  for (name, ty) in tag_spec.iter() {
    let values: Vec<&Value> = rows
      .iter()
      .map(|(tag, _)| {
        tag.get(name).ok_or_else(|| OrcaError::MissingField {
          field: name.to_string(),
          context: "tag".to_string(),
        })
      })
      .collect::<Result<Vec<_>>>()?;
    fields.push(ty.arrow_field(name));
    columns.push(build_array(name, ty, &values)?);
  }

  for (name, ty) in packet_spec.iter() {
    let values: Vec<&Value> = rows
      .iter()
      .map(|(_, packet)| {
        packet.get(name).ok_or_else(|| OrcaError::MissingField {
          field: name.to_string(),
          context: "packet".to_string(),
        })
      })
      .collect::<Result<Vec<_>>>()?;
    fields.push(ty.arrow_field(name));
    columns.push(build_array(name, ty, &values)?);
  }

  if options.include_meta {
    let mut meta_spec: Vec<(String, DataType)> = Vec::new();
    for (_, packet) in rows {
      for (name, value) in packet.meta_info() {
        if !meta_spec.iter().any(|(n, _)| n == name) {
          meta_spec.push((name.to_string(), value.data_type()));
        }
      }
    }
    for (name, ty) in &meta_spec {
      let values: Vec<&Value> = rows
        .iter()
        .map(|(_, packet)| {
          packet.meta_value(name).ok_or_else(|| OrcaError::MissingField {
            field: name.clone(),
            context: "packet meta".to_string(),
          })
        })
        .collect::<Result<Vec<_>>>()?;
      fields.push(ty.arrow_field(name));
      columns.push(build_array(name, *ty, &values)?);
    }
  }

  if options.include_source {
    for (name, _) in packet_spec.iter() {
      let encoded: Vec<String> = rows
        .iter()
        .map(|(_, packet)| {
          packet
            .source_of(name)
            .map_or_else(|| SourceInfo::Input.to_column_string(), SourceInfo::to_column_string)
        })
        .collect();
      fields.push(Field::new(
        format!("{SOURCE_PREFIX}{name}"),
        arrow::datatypes::DataType::Utf8,
        false,
      ));
      columns.push(string_array(encoded));
    }
  }

  if options.include_content_hash {
    let hashes: Vec<String> = rows
      .iter()
      .map(|(_, packet)| packet.content_hash().to_hex())
      .collect();
    fields.push(Field::new(
      options.content_hash_name(),
      arrow::datatypes::DataType::Utf8,
      false,
    ));
    columns.push(string_array(hashes));
  }

  if options.include_data_context {
    let keys: Vec<String> = rows
      .iter()
      .map(|(_, packet)| packet.context_key())
      .collect();
    fields.push(Field::new(
      CONTEXT_KEY_COLUMN,
      arrow::datatypes::DataType::Utf8,
      false,
    ));
    columns.push(string_array(keys));
  }

  let schema = Arc::new(Schema::new(fields));
  if rows.is_empty() {
    return Ok(RecordBatch::new_empty(schema));
  }
  Ok(RecordBatch::try_new(schema, columns)?)
}

fn value_at(column: &ArrayRef, name: &str, ty: DataType, row: usize) -> Result<Value> {
  if column.is_null(row) {
    return Err(OrcaError::UnsupportedType(format!(
      "null value in column '{name}'"
    )));
  }
  macro_rules! read {
    ($array:ty, $variant:ident) => {{
      let array = column
        .as_any()
        .downcast_ref::<$array>()
        .ok_or_else(|| OrcaError::SchemaMismatch(format!("column '{name}' is not {ty}")))?;
      Value::$variant(array.value(row))
    }};
    ($array:ty, $variant:ident, owned) => {{
      let array = column
        .as_any()
        .downcast_ref::<$array>()
        .ok_or_else(|| OrcaError::SchemaMismatch(format!("column '{name}' is not {ty}")))?;
      Value::$variant(array.value(row).to_owned())
    }};
  }
  Ok(match ty {
    DataType::Boolean => read!(BooleanArray, Boolean),
    DataType::Int8 => read!(Int8Array, Int8),
    DataType::Int16 => read!(Int16Array, Int16),
    DataType::Int32 => read!(Int32Array, Int32),
    DataType::Int64 => read!(Int64Array, Int64),
    DataType::UInt8 => read!(UInt8Array, UInt8),
    DataType::UInt16 => read!(UInt16Array, UInt16),
    DataType::UInt32 => read!(UInt32Array, UInt32),
    DataType::UInt64 => read!(UInt64Array, UInt64),
    DataType::Float32 => read!(Float32Array, Float32),
    DataType::Float64 => read!(Float64Array, Float64),
    DataType::String => read!(StringArray, String, owned),
    DataType::Binary => read!(BinaryArray, Binary, owned),
    DataType::Timestamp => read!(TimestampMicrosecondArray, Timestamp),
    DataType::Path => read!(StringArray, Path, owned),
  })
}

fn utf8_at(batch: &RecordBatch, index: usize, row: usize, what: &str) -> Result<String> {
  let column = batch.column(index);
  let array = column
    .as_any()
    .downcast_ref::<StringArray>()
    .ok_or_else(|| OrcaError::SchemaMismatch(format!("{what} column is not utf8")))?;
  Ok(array.value(row).to_string())
}

/// Decodes a record batch back into `(tag, packet)` rows under the given
/// schemas, reconstructing provenance and data context from system columns
/// when present.
pub fn batch_to_rows(
  batch: &RecordBatch,
  tag_spec: &TypeSpec,
  packet_spec: &TypeSpec,
) -> Result<Vec<(Tag, Packet)>> {
  let schema = batch.schema();
  let column_index = |name: &str| schema.index_of(name).ok();

  let mut tag_columns = Vec::with_capacity(tag_spec.len());
  for (name, ty) in tag_spec.iter() {
    let index = column_index(name).ok_or_else(|| OrcaError::MissingField {
      field: name.to_string(),
      context: "table".to_string(),
    })?;
    tag_columns.push((name.to_string(), ty, index));
  }

  let mut packet_columns = Vec::with_capacity(packet_spec.len());
  for (name, ty) in packet_spec.iter() {
    let index = column_index(name).ok_or_else(|| OrcaError::MissingField {
      field: name.to_string(),
      context: "table".to_string(),
    })?;
    let source_index = column_index(&format!("{SOURCE_PREFIX}{name}"));
    packet_columns.push((name.to_string(), ty, index, source_index));
  }

  let context_index = column_index(CONTEXT_KEY_COLUMN);

  // Any `__`-prefixed column not claimed by the schemas is a meta column.
  let mut meta_columns = Vec::new();
  for (index, field) in schema.fields().iter().enumerate() {
    let name = field.name();
    if name.starts_with(META_PREFIX) && !tag_spec.contains(name) && !packet_spec.contains(name) {
      meta_columns.push((name.clone(), DataType::from_arrow(field)?, index));
    }
  }

  let mut rows = Vec::with_capacity(batch.num_rows());
  for row in 0..batch.num_rows() {
    let mut tag_values = Vec::with_capacity(tag_columns.len());
    for (name, ty, index) in &tag_columns {
      tag_values.push(value_at(batch.column(*index), name, *ty, row)?);
    }
    let tag = Tag::new(tag_spec.clone(), tag_values)?;

    let mut packet_values = Vec::with_capacity(packet_columns.len());
    let mut source = Vec::with_capacity(packet_columns.len());
    for (name, ty, index, source_index) in &packet_columns {
      packet_values.push(value_at(batch.column(*index), name, *ty, row)?);
      source.push(match source_index {
        Some(si) => SourceInfo::from_column_string(&utf8_at(batch, *si, row, "source")?)?,
        None => SourceInfo::Input,
      });
    }

    let context = match context_index {
      Some(ci) => DataContext::from_context_key(&utf8_at(batch, ci, row, "context")?)
        .unwrap_or_default(),
      None => DataContext::default(),
    };

    let mut packet = Packet::new(packet_spec.clone(), packet_values, Some(source), context)?;
    if !meta_columns.is_empty() {
      let mut meta_pairs = Vec::with_capacity(meta_columns.len());
      for (name, ty, index) in &meta_columns {
        meta_pairs.push((name.clone(), value_at(batch.column(*index), name, *ty, row)?));
      }
      packet = packet.with_meta_fields(meta_pairs);
    }
    rows.push((tag, packet));
  }
  Ok(rows)
}
