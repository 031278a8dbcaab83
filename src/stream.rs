//! Streams: finite, restartable sequences of `(tag, packet)` pairs.
//!
//! Every stream carries a tag typespec and a packet typespec whose key sets
//! are disjoint; the stream's unified schema is their union. Streams are
//! restartable by construction: materialization is cached, so iterating
//! twice yields the same sequence.
//!
//! Two concrete variants exist. [`ImmutableTableStream`] is a source built
//! from an Arrow record batch plus a declared tag-column list.
//! [`KernelStream`] is the lazy output of a kernel invocation: it holds its
//! upstream streams and evaluates on first demand, consulting the store by
//! invocation fingerprint before computing.

use crate::context::DataContext;
use crate::datagram::{Packet, Tag, META_PREFIX};
use crate::error::{OrcaError, Result};
use crate::hash::Fingerprint;
use crate::kernel::{EvalContext, Kernel};
use crate::store::Store;
use crate::table::{self, TableOptions};
use crate::types::TypeSpec;
use arrow::record_batch::RecordBatch;
use std::sync::{Arc, OnceLock};
use tracing::debug;

/// Shared handle to a stream.
pub type SharedStream = Arc<dyn Stream>;

/// A finite, restartable, deterministic sequence of `(tag, packet)` pairs.
pub trait Stream: Send + Sync {
  /// Typespec of the tag columns.
  fn tag_schema(&self) -> &TypeSpec;

  /// Typespec of the packet columns.
  fn packet_schema(&self) -> &TypeSpec;

  /// Fingerprint identifying this stream's content.
  fn fingerprint(&self) -> Fingerprint;

  /// Materializes the stream. Cached: repeated calls return the same rows.
  fn flow(&self) -> Result<Arc<Vec<(Tag, Packet)>>>;

  /// True when the stream's rows are already resident in memory. Source
  /// streams always are; derived streams become materialized on first
  /// `flow()`.
  fn is_materialized(&self) -> bool {
    true
  }

  /// Optional label attached at invocation time.
  fn label(&self) -> Option<&str> {
    None
  }

  /// Restartable iteration over `(tag, packet)` pairs.
  fn iter(&self) -> Result<StreamIter> {
    Ok(StreamIter {
      rows: self.flow()?,
      index: 0,
    })
  }

  /// The unified schema: tag columns followed by packet columns.
  fn schema(&self) -> TypeSpec {
    self.tag_schema().union(self.packet_schema())
  }

  /// Materializes to a record batch in iteration order.
  fn as_table(&self, options: &TableOptions) -> Result<RecordBatch> {
    let rows = self.flow()?;
    table::rows_to_batch(self.tag_schema(), self.packet_schema(), &rows, options)
  }
}

impl std::fmt::Debug for dyn Stream {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Stream")
      .field("fingerprint", &self.fingerprint())
      .field("label", &self.label())
      .finish()
  }
}

/// Owning iterator over a materialized stream.
pub struct StreamIter {
  rows: Arc<Vec<(Tag, Packet)>>,
  index: usize,
}

impl Iterator for StreamIter {
  type Item = (Tag, Packet);

  fn next(&mut self) -> Option<Self::Item> {
    let row = self.rows.get(self.index).cloned();
    self.index += 1;
    row
  }
}

/// A source stream built from an Arrow record batch and a declared
/// tag-column list.
///
/// Construction validates that the tag columns exist, that all columns have
/// supported logical types, and that no column uses a reserved system name.
/// Every field's provenance is `source=input`.
#[derive(Debug)]
pub struct ImmutableTableStream {
  tag_spec: TypeSpec,
  packet_spec: TypeSpec,
  rows: Arc<Vec<(Tag, Packet)>>,
  fingerprint: Fingerprint,
  context: DataContext,
}

impl ImmutableTableStream {
  /// Builds a source stream under the default data context.
  pub fn new(batch: RecordBatch, tag_columns: &[&str]) -> Result<Self> {
    Self::with_context(batch, tag_columns, DataContext::default())
  }

  /// Builds a source stream under an explicit data context.
  pub fn with_context(
    batch: RecordBatch,
    tag_columns: &[&str],
    context: DataContext,
  ) -> Result<Self> {
    let full_spec = TypeSpec::from_arrow_schema(&batch.schema())?;

    for name in full_spec.keys() {
      if table::is_system_column(name) {
        return Err(OrcaError::NameCollision(format!(
          "column '{name}' uses a reserved system-column name"
        )));
      }
    }

    let mut seen: Vec<&str> = Vec::with_capacity(tag_columns.len());
    for column in tag_columns {
      if seen.contains(column) {
        return Err(OrcaError::NameCollision(format!(
          "tag column '{column}' declared twice"
        )));
      }
      if !full_spec.contains(column) {
        return Err(OrcaError::MissingField {
          field: (*column).to_string(),
          context: "source table".to_string(),
        });
      }
      seen.push(*column);
    }

    // Tag spec follows the declared tag-column order; packet spec keeps the
    // table's column order for the rest. `__`-prefixed columns become packet
    // meta fields, not data.
    let mut tag_spec = TypeSpec::new();
    for column in tag_columns {
      tag_spec.insert((*column).to_string(), full_spec.get(column).expect("validated"));
    }
    let mut packet_spec = TypeSpec::new();
    for (name, ty) in full_spec.iter() {
      if !tag_spec.contains(name) && !name.starts_with(META_PREFIX) {
        packet_spec.insert(name, ty);
      }
    }

    let decoded = table::batch_to_rows(&batch, &tag_spec, &packet_spec)?;
    let rows: Vec<(Tag, Packet)> = decoded
      .into_iter()
      .map(|(tag, packet)| (tag, packet.with_data_context(context.clone())))
      .collect();

    let hasher = context.hasher();
    let row_hashes: Vec<Fingerprint> = rows
      .iter()
      .map(|(tag, packet)| hasher.hash_record(tag.iter().chain(packet.iter())))
      .collect();
    let table_hash = hasher.hash_table(&tag_spec.union(&packet_spec), &row_hashes);
    let fingerprint = hasher.hash_source(&table_hash, tag_columns.iter().copied());

    Ok(Self {
      tag_spec,
      packet_spec,
      rows: Arc::new(rows),
      fingerprint,
      context,
    })
  }

  /// The data context this source was built under.
  #[must_use]
  pub fn data_context(&self) -> &DataContext {
    &self.context
  }
}

impl Stream for ImmutableTableStream {
  fn tag_schema(&self) -> &TypeSpec {
    &self.tag_spec
  }

  fn packet_schema(&self) -> &TypeSpec {
    &self.packet_spec
  }

  fn fingerprint(&self) -> Fingerprint {
    self.fingerprint
  }

  fn flow(&self) -> Result<Arc<Vec<(Tag, Packet)>>> {
    Ok(self.rows.clone())
  }
}

/// The lazy output stream of a kernel invocation.
///
/// Holds the kernel and its upstream streams; evaluation happens on first
/// `flow()` and is memoized. When a store is attached, the invocation
/// fingerprint is consulted first and results are written back after
/// computation.
pub struct KernelStream {
  kernel: Arc<dyn Kernel>,
  upstreams: Vec<SharedStream>,
  tag_spec: TypeSpec,
  packet_spec: TypeSpec,
  fingerprint: Fingerprint,
  label: Option<String>,
  store: Option<Arc<dyn Store>>,
  context: DataContext,
  cache: OnceLock<Arc<Vec<(Tag, Packet)>>>,
}

impl KernelStream {
  /// Validates the invocation and computes its fingerprint. No data is read.
  pub fn new(
    kernel: Arc<dyn Kernel>,
    upstreams: Vec<SharedStream>,
    label: Option<String>,
    store: Option<Arc<dyn Store>>,
    context: DataContext,
  ) -> Result<Self> {
    let (tag_spec, packet_spec) = kernel.output_types(&upstreams)?;
    let hasher = context.hasher();
    let upstream_fps: Vec<Fingerprint> = upstreams.iter().map(|u| u.fingerprint()).collect();
    let fingerprint = hasher.hash_invocation(
      &kernel.identity(&hasher),
      &upstream_fps,
      &tag_spec,
      &packet_spec,
    );
    Ok(Self {
      kernel,
      upstreams,
      tag_spec,
      packet_spec,
      fingerprint,
      label,
      store,
      context,
      cache: OnceLock::new(),
    })
  }

  /// The kernel this stream was produced by.
  #[must_use]
  pub fn kernel(&self) -> &Arc<dyn Kernel> {
    &self.kernel
  }

  /// The label used for error attribution: the explicit label, else the
  /// kernel name.
  #[must_use]
  pub fn display_label(&self) -> &str {
    self.label.as_deref().unwrap_or_else(|| self.kernel.name())
  }

  fn compute(&self) -> Result<Vec<(Tag, Packet)>> {
    if let Some(store) = self.store.as_deref() {
      if store.has(&self.fingerprint)? {
        if let Some(batch) = store.get_table(&self.fingerprint)? {
          debug!(
            node = self.display_label(),
            fingerprint = %self.fingerprint,
            "serving invocation from store"
          );
          return table::batch_to_rows(&batch, &self.tag_spec, &self.packet_spec);
        }
      }
    }

    let ctx = EvalContext {
      store: self.store.as_deref(),
      context: &self.context,
      label: self.display_label(),
    };
    let rows = self
      .kernel
      .evaluate(&self.upstreams, &ctx)
      .map_err(|e| e.with_node(self.display_label()))?;

    if let Some(store) = self.store.as_deref() {
      let batch =
        table::rows_to_batch(&self.tag_spec, &self.packet_spec, &rows, &TableOptions::full())?;
      store.put_table(&self.fingerprint, &batch)?;
    }
    Ok(rows)
  }

  /// The invocation fingerprint (also available through [`Stream`]).
  #[must_use]
  pub fn invocation_fingerprint(&self) -> Fingerprint {
    self.fingerprint
  }
}

impl Stream for KernelStream {
  fn tag_schema(&self) -> &TypeSpec {
    &self.tag_spec
  }

  fn packet_schema(&self) -> &TypeSpec {
    &self.packet_spec
  }

  fn fingerprint(&self) -> Fingerprint {
    self.fingerprint
  }

  fn is_materialized(&self) -> bool {
    self.cache.get().is_some()
  }

  fn label(&self) -> Option<&str> {
    self.label.as_deref()
  }

  fn flow(&self) -> Result<Arc<Vec<(Tag, Packet)>>> {
    if let Some(rows) = self.cache.get() {
      return Ok(rows.clone());
    }
    let rows = Arc::new(self.compute()?);
    // Another caller may have raced us; either way the value is identical.
    let _ = self.cache.set(rows);
    Ok(self.cache.get().expect("cache initialized above").clone())
  }
}
