//! Content-addressed stores.
//!
//! A [`Store`] persists tables keyed by invocation fingerprint, plus
//! pipeline results keyed by `(pipeline fingerprint, node label)`. Writes
//! are idempotent: storing the same table under the same key twice is a
//! no-op, while storing a different table under an existing key is a fatal
//! [`FingerprintCollision`](crate::OrcaError::FingerprintCollision).
//!
//! Two implementations are provided. [`InMemoryStore`] keeps everything in
//! process memory and is safe for concurrent reads. [`ParquetStore`] writes
//! each table as a Parquet file with a JSON metadata sidecar; writes go to a
//! temporary path followed by an atomic rename, so readers never observe a
//! partially written table.

use crate::error::{OrcaError, Result};
use crate::hash::Fingerprint;
use crate::table::CONTEXT_KEY_COLUMN;
use arrow::array::{Array, StringArray};
use arrow::compute::concat_batches;
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Utc};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::arrow_writer::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{debug, error};

/// Content-addressed persistence for packets, invocation outputs, and
/// pipeline results.
///
/// Implementations must be safe for concurrent reads; writes may require
/// exclusive access per key. Tables round-trip verbatim including system
/// columns.
pub trait Store: Send + Sync {
  /// True when a table is stored under the fingerprint.
  fn has(&self, fingerprint: &Fingerprint) -> Result<bool>;

  /// Retrieves the table stored under the fingerprint.
  fn get_table(&self, fingerprint: &Fingerprint) -> Result<Option<RecordBatch>>;

  /// Stores a table under the fingerprint. Idempotent; differing payloads
  /// under one key are a fatal error.
  fn put_table(&self, fingerprint: &Fingerprint, table: &RecordBatch) -> Result<()>;

  /// Retrieves a pipeline node result.
  fn get_result(&self, pipeline: &Fingerprint, label: &str) -> Result<Option<RecordBatch>>;

  /// Stores a pipeline node result. Overwrites are allowed: a pipeline may
  /// be re-run after its inputs changed.
  fn put_result(&self, pipeline: &Fingerprint, label: &str, table: &RecordBatch) -> Result<()>;
}

fn collision(fingerprint: &Fingerprint) -> OrcaError {
  error!(fingerprint = %fingerprint, "fingerprint collision");
  OrcaError::FingerprintCollision {
    fingerprint: fingerprint.to_hex(),
  }
}

/// A store keeping all tables in process memory.
#[derive(Default)]
pub struct InMemoryStore {
  tables: RwLock<HashMap<Fingerprint, RecordBatch>>,
  results: RwLock<HashMap<(Fingerprint, String), RecordBatch>>,
}

impl InMemoryStore {
  /// Creates an empty store.
  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  /// Number of tables stored by fingerprint.
  #[must_use]
  pub fn len(&self) -> usize {
    self.tables.read().expect("store lock").len()
  }

  /// True when no tables are stored.
  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

impl Store for InMemoryStore {
  fn has(&self, fingerprint: &Fingerprint) -> Result<bool> {
    Ok(self.tables.read().expect("store lock").contains_key(fingerprint))
  }

  fn get_table(&self, fingerprint: &Fingerprint) -> Result<Option<RecordBatch>> {
    Ok(self.tables.read().expect("store lock").get(fingerprint).cloned())
  }

  fn put_table(&self, fingerprint: &Fingerprint, table: &RecordBatch) -> Result<()> {
    let mut tables = self.tables.write().expect("store lock");
    if let Some(existing) = tables.get(fingerprint) {
      if existing == table {
        return Ok(());
      }
      return Err(collision(fingerprint));
    }
    tables.insert(*fingerprint, table.clone());
    Ok(())
  }

  fn get_result(&self, pipeline: &Fingerprint, label: &str) -> Result<Option<RecordBatch>> {
    Ok(
      self
        .results
        .read()
        .expect("store lock")
        .get(&(*pipeline, label.to_string()))
        .cloned(),
    )
  }

  fn put_result(&self, pipeline: &Fingerprint, label: &str, table: &RecordBatch) -> Result<()> {
    self
      .results
      .write()
      .expect("store lock")
      .insert((*pipeline, label.to_string()), table.clone());
    Ok(())
  }
}

/// Metadata sidecar written next to every stored Parquet file.
#[derive(Debug, Serialize, Deserialize)]
struct EntryMeta {
  created_at: DateTime<Utc>,
  kind: String,
  rows: usize,
  context_key: Option<String>,
}

impl EntryMeta {
  fn for_table(kind: &str, table: &RecordBatch) -> Self {
    let context_key = table
      .schema()
      .index_of(CONTEXT_KEY_COLUMN)
      .ok()
      .and_then(|index| {
        let column = table.column(index);
        let array = column.as_any().downcast_ref::<StringArray>()?;
        (array.len() > 0).then(|| array.value(0).to_string())
      });
    Self {
      created_at: Utc::now(),
      kind: kind.to_string(),
      rows: table.num_rows(),
      context_key,
    }
  }
}

/// A store persisting each table as a Parquet file under a root directory.
///
/// Layout: `packets/<fingerprint hex>.parquet` for fingerprint-keyed tables
/// and `results/<pipeline hex>/<label>.parquet` for pipeline results, each
/// with a `.meta.json` sidecar.
pub struct ParquetStore {
  root: PathBuf,
}

impl ParquetStore {
  /// Opens (creating if needed) a store rooted at the given directory.
  pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
    let root = root.as_ref().to_path_buf();
    std::fs::create_dir_all(root.join("packets"))?;
    std::fs::create_dir_all(root.join("results"))?;
    Ok(Self { root })
  }

  /// The root directory.
  #[must_use]
  pub fn root(&self) -> &Path {
    &self.root
  }

  fn table_path(&self, fingerprint: &Fingerprint) -> PathBuf {
    self
      .root
      .join("packets")
      .join(format!("{}.parquet", fingerprint.to_hex()))
  }

  fn result_path(&self, pipeline: &Fingerprint, label: &str) -> PathBuf {
    let safe_label =
      label.replace(|c: char| !c.is_alphanumeric() && c != '_' && c != '-', "_");
    self
      .root
      .join("results")
      .join(pipeline.to_hex())
      .join(format!("{safe_label}.parquet"))
  }

  fn read_batch(path: &Path) -> Result<RecordBatch> {
    let file = File::open(path)?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;
    let schema = builder.schema().clone();
    let reader = builder.build()?;
    let batches: Vec<RecordBatch> =
      reader.collect::<std::result::Result<Vec<_>, arrow::error::ArrowError>>()?;
    if batches.is_empty() {
      return Ok(RecordBatch::new_empty(schema));
    }
    Ok(concat_batches(&schema, batches.iter())?)
  }

  fn write_atomic(path: &Path, kind: &str, table: &RecordBatch) -> Result<()> {
    let parent = path.parent().ok_or_else(|| {
      OrcaError::Io(std::io::Error::other("store path has no parent directory"))
    })?;
    std::fs::create_dir_all(parent)?;

    let tmp_path = path.with_extension("parquet.tmp");
    let file = File::create(&tmp_path)?;
    let props = WriterProperties::builder()
      .set_compression(Compression::SNAPPY)
      .build();
    let mut writer = ArrowWriter::try_new(file, table.schema(), Some(props))?;
    writer.write(table)?;
    writer.close()?;
    std::fs::rename(&tmp_path, path)?;

    let meta = EntryMeta::for_table(kind, table);
    let json = serde_json::to_string_pretty(&meta)
      .map_err(|e| OrcaError::Serialization(e.to_string()))?;
    std::fs::write(path.with_extension("meta.json"), json)?;
    Ok(())
  }
}

impl Store for ParquetStore {
  fn has(&self, fingerprint: &Fingerprint) -> Result<bool> {
    Ok(self.table_path(fingerprint).exists())
  }

  fn get_table(&self, fingerprint: &Fingerprint) -> Result<Option<RecordBatch>> {
    let path = self.table_path(fingerprint);
    if !path.exists() {
      return Ok(None);
    }
    Ok(Some(Self::read_batch(&path)?))
  }

  fn put_table(&self, fingerprint: &Fingerprint, table: &RecordBatch) -> Result<()> {
    let path = self.table_path(fingerprint);
    if path.exists() {
      let existing = Self::read_batch(&path)?;
      if existing == *table {
        debug!(fingerprint = %fingerprint, "table already stored");
        return Ok(());
      }
      return Err(collision(fingerprint));
    }
    Self::write_atomic(&path, "invocation", table)
  }

  fn get_result(&self, pipeline: &Fingerprint, label: &str) -> Result<Option<RecordBatch>> {
    let path = self.result_path(pipeline, label);
    if !path.exists() {
      return Ok(None);
    }
    Ok(Some(Self::read_batch(&path)?))
  }

  fn put_result(&self, pipeline: &Fingerprint, label: &str, table: &RecordBatch) -> Result<()> {
    let path = self.result_path(pipeline, label);
    Self::write_atomic(&path, "result", table)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::hash::Hasher;
  use crate::types::Value;
  use arrow::array::{ArrayRef, Int64Array, StringArray};
  use arrow::datatypes::{DataType as ArrowDataType, Field, Schema};
  use std::sync::Arc;
  use tempfile::TempDir;

  fn sample_batch(values: Vec<i64>) -> RecordBatch {
    let schema = Arc::new(Schema::new(vec![Field::new(
      "v",
      ArrowDataType::Int64,
      false,
    )]));
    RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(values)) as ArrayRef]).unwrap()
  }

  fn fingerprint(seed: i64) -> Fingerprint {
    Hasher::default().hash_value(&Value::Int64(seed))
  }

  #[test]
  fn test_in_memory_round_trip() {
    let store = InMemoryStore::new();
    let fp = fingerprint(1);
    let batch = sample_batch(vec![1, 2, 3]);

    assert!(!store.has(&fp).unwrap());
    store.put_table(&fp, &batch).unwrap();
    assert!(store.has(&fp).unwrap());
    assert_eq!(store.get_table(&fp).unwrap().unwrap(), batch);
  }

  #[test]
  fn test_in_memory_idempotent_put_and_collision() {
    let store = InMemoryStore::new();
    let fp = fingerprint(1);
    let batch = sample_batch(vec![1, 2, 3]);

    store.put_table(&fp, &batch).unwrap();
    store.put_table(&fp, &batch).unwrap();
    assert_eq!(store.len(), 1);

    let different = sample_batch(vec![9]);
    let err = store.put_table(&fp, &different).unwrap_err();
    assert!(matches!(err, OrcaError::FingerprintCollision { .. }));
  }

  #[test]
  fn test_parquet_round_trip() {
    let tmp = TempDir::new().unwrap();
    let store = ParquetStore::new(tmp.path()).unwrap();
    let fp = fingerprint(2);
    let batch = sample_batch(vec![4, 5, 6]);

    store.put_table(&fp, &batch).unwrap();
    assert!(store.has(&fp).unwrap());
    assert_eq!(store.get_table(&fp).unwrap().unwrap(), batch);
    assert!(store.get_table(&fingerprint(3)).unwrap().is_none());
  }

  #[test]
  fn test_parquet_collision() {
    let tmp = TempDir::new().unwrap();
    let store = ParquetStore::new(tmp.path()).unwrap();
    let fp = fingerprint(2);

    store.put_table(&fp, &sample_batch(vec![1])).unwrap();
    store.put_table(&fp, &sample_batch(vec![1])).unwrap();
    let err = store.put_table(&fp, &sample_batch(vec![2])).unwrap_err();
    assert!(matches!(err, OrcaError::FingerprintCollision { .. }));
  }

  #[test]
  fn test_parquet_results_by_label() {
    let tmp = TempDir::new().unwrap();
    let store = ParquetStore::new(tmp.path()).unwrap();
    let pipeline = fingerprint(7);
    let batch = sample_batch(vec![1, 2]);

    assert!(store.get_result(&pipeline, "node_0").unwrap().is_none());
    store.put_result(&pipeline, "node_0", &batch).unwrap();
    assert_eq!(store.get_result(&pipeline, "node_0").unwrap().unwrap(), batch);
  }

  #[test]
  fn test_parquet_writes_meta_sidecar() {
    let tmp = TempDir::new().unwrap();
    let store = ParquetStore::new(tmp.path()).unwrap();
    let fp = fingerprint(4);

    let schema = Arc::new(Schema::new(vec![
      Field::new("v", ArrowDataType::Int64, false),
      Field::new(CONTEXT_KEY_COLUMN, ArrowDataType::Utf8, false),
    ]));
    let batch = RecordBatch::try_new(
      schema,
      vec![
        Arc::new(Int64Array::from(vec![1])) as ArrayRef,
        Arc::new(StringArray::from(vec!["orcapod:0.1.0|hasher:1"])) as ArrayRef,
      ],
    )
    .unwrap();
    store.put_table(&fp, &batch).unwrap();

    let meta_path = store
      .root()
      .join("packets")
      .join(format!("{}.meta.json", fp.to_hex()));
    let meta: EntryMeta =
      serde_json::from_str(&std::fs::read_to_string(meta_path).unwrap()).unwrap();
    assert_eq!(meta.kind, "invocation");
    assert_eq!(meta.rows, 1);
    assert_eq!(meta.context_key.as_deref(), Some("orcapod:0.1.0|hasher:1"));
  }
}
