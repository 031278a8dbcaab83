//! Pipelines: scoped invocation registries with memoized execution.
//!
//! A [`Pipeline`] is a registry of kernel invocations. Entering its scope
//! ([`Pipeline::activate`]) pushes it onto a thread-local stack; while the
//! scope is active, every operator/pod call registers a node carrying the
//! invocation's label, fingerprint, and upstream edges. Leaving the scope
//! freezes the DAG.
//!
//! [`Pipeline::run`] executes nodes in registration order (a topological
//! order by construction: a stream can only reference already-constructed
//! upstreams). Each node consults the store by invocation fingerprint before
//! computing, so re-running a structurally identical pipeline against the
//! same store performs no user-function invocations.

use crate::context::DataContext;
use crate::error::{OrcaError, Result};
use crate::hash::Fingerprint;
use crate::kernel::{Kernel, NodeKind};
use crate::stream::{KernelStream, SharedStream, Stream};
use crate::store::Store;
use crate::table::{self, TableOptions};
use arrow::record_batch::RecordBatch;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use tracing::{debug, info, warn};

thread_local! {
  static ACTIVE: RefCell<Vec<Rc<RefCell<PipelineInner>>>> = const { RefCell::new(Vec::new()) };
}

/// One registered invocation in a pipeline DAG.
#[derive(Clone)]
pub struct Node {
  label: String,
  kind: NodeKind,
  kernel_name: String,
  stream: SharedStream,
  fingerprint: Fingerprint,
  upstream: Vec<usize>,
}

impl Node {
  /// The node label (explicit, or `name_N`).
  #[must_use]
  pub fn label(&self) -> &str {
    &self.label
  }

  /// Operator or pod.
  #[must_use]
  pub fn kind(&self) -> NodeKind {
    self.kind
  }

  /// Name of the wrapped kernel.
  #[must_use]
  pub fn kernel_name(&self) -> &str {
    &self.kernel_name
  }

  /// The node's lazy output stream.
  #[must_use]
  pub fn stream(&self) -> &SharedStream {
    &self.stream
  }

  /// The invocation fingerprint.
  #[must_use]
  pub fn fingerprint(&self) -> Fingerprint {
    self.fingerprint
  }

  /// Indices of upstream nodes, in input order. Source streams are not
  /// nodes and do not appear.
  #[must_use]
  pub fn upstream(&self) -> &[usize] {
    &self.upstream
  }
}

struct PipelineInner {
  name: String,
  store: Arc<dyn Store>,
  context: DataContext,
  nodes: Vec<Node>,
  label_counts: HashMap<String, usize>,
  poisoned: bool,
}

/// A scoped registry of kernel invocations forming a DAG.
pub struct Pipeline {
  inner: Rc<RefCell<PipelineInner>>,
}

impl Pipeline {
  /// Creates a pipeline backed by the given store, under the default data
  /// context.
  #[must_use]
  pub fn new(name: impl Into<String>, store: Arc<dyn Store>) -> Self {
    Self::with_context(name, store, DataContext::default())
  }

  /// Creates a pipeline under an explicit data context.
  #[must_use]
  pub fn with_context(name: impl Into<String>, store: Arc<dyn Store>, context: DataContext) -> Self {
    Self {
      inner: Rc::new(RefCell::new(PipelineInner {
        name: name.into(),
        store,
        context,
        nodes: Vec::new(),
        label_counts: HashMap::new(),
        poisoned: false,
      })),
    }
  }

  /// The pipeline name.
  #[must_use]
  pub fn name(&self) -> String {
    self.inner.borrow().name.clone()
  }

  /// The backing store.
  #[must_use]
  pub fn store(&self) -> Arc<dyn Store> {
    self.inner.borrow().store.clone()
  }

  /// Enters the pipeline scope. While the returned guard lives, operator
  /// and pod calls on this thread register nodes here. Scopes nest; exiting
  /// out of order poisons the pipeline.
  #[must_use]
  pub fn activate(&self) -> PipelineScope {
    ACTIVE.with(|stack| stack.borrow_mut().push(self.inner.clone()));
    PipelineScope {
      inner: self.inner.clone(),
    }
  }

  fn is_active(&self) -> bool {
    ACTIVE.with(|stack| {
      stack
        .borrow()
        .iter()
        .any(|entry| Rc::ptr_eq(entry, &self.inner))
    })
  }

  /// Labels of the registered nodes, in registration order.
  #[must_use]
  pub fn node_labels(&self) -> Vec<String> {
    self
      .inner
      .borrow()
      .nodes
      .iter()
      .map(|n| n.label.clone())
      .collect()
  }

  /// Snapshot of the registered nodes, in registration order.
  #[must_use]
  pub fn nodes(&self) -> Vec<Node> {
    self.inner.borrow().nodes.clone()
  }

  /// Looks up a node by label.
  #[must_use]
  pub fn node(&self, label: &str) -> Option<Node> {
    self
      .inner
      .borrow()
      .nodes
      .iter()
      .find(|n| n.label == label)
      .cloned()
  }

  /// The pipeline fingerprint: a hash of the registration-ordered sequence
  /// of `(node fingerprint, upstream indices)`.
  #[must_use]
  pub fn fingerprint(&self) -> Fingerprint {
    let inner = self.inner.borrow();
    let nodes: Vec<(Fingerprint, Vec<usize>)> = inner
      .nodes
      .iter()
      .map(|n| (n.fingerprint, n.upstream.clone()))
      .collect();
    inner.context.hasher().hash_pipeline(&nodes)
  }

  /// Executes every node in registration order.
  ///
  /// Nodes whose invocation fingerprint is present in the store are loaded
  /// without computation. The first error aborts the run, attributed to the
  /// failing node's label.
  pub fn run(&self) -> Result<()> {
    if self.is_active() {
      return Err(OrcaError::PipelineState(
        "run() called while the pipeline scope is still active".to_string(),
      ));
    }
    let pipeline_fp = self.fingerprint();
    let (name, store, nodes) = {
      let inner = self.inner.borrow();
      (inner.name.clone(), inner.store.clone(), inner.nodes.clone())
    };
    info!(pipeline = %name, fingerprint = %pipeline_fp, nodes = nodes.len(), "running pipeline");

    for node in &nodes {
      let table = node
        .stream
        .as_table(&TableOptions::full())
        .map_err(|e| e.with_node(&node.label))?;
      store
        .put_result(&pipeline_fp, &node.label, &table)
        .map_err(|e| e.with_node(&node.label))?;
      debug!(pipeline = %name, node = %node.label, rows = table.num_rows(), "node complete");
    }
    Ok(())
  }

  /// The result table of a node: data columns only, rows in iteration
  /// order.
  ///
  /// Before `run`, returns the store-cached table when the node's
  /// invocation fingerprint is already present, and an empty table with the
  /// correct schema otherwise. After `run`, returns the materialized table.
  pub fn df(&self, label: &str) -> Result<RecordBatch> {
    let (node, store, pipeline_fp) = {
      let inner = self.inner.borrow();
      let node = inner
        .nodes
        .iter()
        .find(|n| n.label == label)
        .cloned()
        .ok_or_else(|| OrcaError::PipelineState(format!("unknown node label '{label}'")))?;
      drop(inner);
      (node, self.store(), self.fingerprint())
    };

    let tag_spec = node.stream.tag_schema().clone();
    let packet_spec = node.stream.packet_schema().clone();

    let stored = match store.get_result(&pipeline_fp, label)? {
      Some(batch) => Some(batch),
      None => store.get_table(&node.fingerprint)?,
    };
    let rows = match stored {
      Some(batch) => table::batch_to_rows(&batch, &tag_spec, &packet_spec)?,
      None if node.stream.is_materialized() => node.stream.flow()?.as_ref().clone(),
      None => Vec::new(),
    };
    table::rows_to_batch(&tag_spec, &packet_spec, &rows, &TableOptions::new())
  }
}

/// RAII guard for an active pipeline scope.
///
/// Dropping the guard exits the scope. Guards must be dropped in reverse
/// activation order; a mismatched exit logs a warning and poisons the
/// affected pipeline, failing its subsequent registrations.
pub struct PipelineScope {
  inner: Rc<RefCell<PipelineInner>>,
}

impl Drop for PipelineScope {
  fn drop(&mut self) {
    ACTIVE.with(|stack| {
      let mut stack = stack.borrow_mut();
      match stack.last() {
        Some(top) if Rc::ptr_eq(top, &self.inner) => {
          stack.pop();
        }
        _ => {
          warn!("mismatched pipeline scope exit");
          self.inner.borrow_mut().poisoned = true;
          stack.retain(|entry| !Rc::ptr_eq(entry, &self.inner));
        }
      }
    });
  }
}

/// Registers a kernel invocation.
///
/// Inside an active pipeline scope the invocation becomes a node of the
/// innermost pipeline, wired to that pipeline's store; outside, it becomes
/// a standalone lazy stream with no store attached.
pub(crate) fn register_invocation(
  kernel: Arc<dyn Kernel>,
  upstreams: Vec<SharedStream>,
  label: Option<String>,
) -> Result<SharedStream> {
  ACTIVE.with(|stack| {
    let stack = stack.borrow();
    let Some(inner_rc) = stack.last() else {
      let stream = KernelStream::new(kernel, upstreams, label, None, DataContext::default())?;
      return Ok(Arc::new(stream) as SharedStream);
    };

    let mut inner = inner_rc.borrow_mut();
    if inner.poisoned {
      return Err(OrcaError::PipelineState(format!(
        "pipeline '{}' was poisoned by a mismatched scope exit",
        inner.name
      )));
    }

    let kind = kernel.kind();
    let kernel_name = kernel.name().to_string();
    let stream = Arc::new(KernelStream::new(
      kernel,
      upstreams.clone(),
      label.clone(),
      Some(inner.store.clone()),
      inner.context.clone(),
    )?);

    let label = match label {
      Some(label) => {
        if inner.nodes.iter().any(|n| n.label == label) {
          return Err(OrcaError::NameCollision(format!(
            "node label '{label}' already registered"
          )));
        }
        label
      }
      None => {
        let count = inner.label_counts.entry(kernel_name.clone()).or_insert(0);
        let label = format!("{kernel_name}_{count}");
        *count += 1;
        label
      }
    };

    // Re-using a stream across nodes creates shared upstream edges; source
    // streams are not nodes and contribute through fingerprints only.
    let upstream: Vec<usize> = upstreams
      .iter()
      .filter_map(|u| {
        inner
          .nodes
          .iter()
          .position(|n| Arc::ptr_eq(&n.stream, u))
      })
      .collect();

    let shared: SharedStream = stream;
    inner.nodes.push(Node {
      label: label.clone(),
      kind,
      kernel_name,
      stream: shared.clone(),
      fingerprint: shared.fingerprint(),
      upstream,
    });
    debug!(pipeline = %inner.name, node = %label, "registered invocation");
    Ok(shared)
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::function_pod;
  use crate::stream::ImmutableTableStream;
  use crate::store::InMemoryStore;
  use crate::types::Value;
  use arrow::array::{ArrayRef, Int64Array};
  use arrow::datatypes::{DataType as ArrowDataType, Field, Schema};

  fn numbers_stream() -> SharedStream {
    let schema = Arc::new(Schema::new(vec![
      Field::new("id", ArrowDataType::Int64, false),
      Field::new("a", ArrowDataType::Int64, false),
      Field::new("b", ArrowDataType::Int64, false),
    ]));
    let columns: Vec<ArrayRef> = vec![
      Arc::new(Int64Array::from(vec![0, 1, 2])),
      Arc::new(Int64Array::from(vec![1, 2, 3])),
      Arc::new(Int64Array::from(vec![10, 20, 30])),
    ];
    let batch = RecordBatch::try_new(schema, columns).unwrap();
    Arc::new(ImmutableTableStream::new(batch, &["id"]).unwrap())
  }

  #[test]
  fn test_nodes_register_with_disambiguated_labels() {
    let add = function_pod!("1", fn add_numbers(a: i64, b: i64) -> (sum: i64) {
      a + b
    });
    let pipeline = Pipeline::new("p", Arc::new(InMemoryStore::new()));
    {
      let _scope = pipeline.activate();
      add.call(&numbers_stream()).unwrap();
      add.call(&numbers_stream()).unwrap();
    }
    assert_eq!(
      pipeline.node_labels(),
      vec!["add_numbers_0", "add_numbers_1"]
    );
  }

  #[test]
  fn test_upstream_edges_follow_stream_identity() {
    let add = function_pod!("1", fn add_numbers(a: i64, b: i64) -> (sum: i64) {
      a + b
    });
    let double = function_pod!("1", fn double(sum: i64) -> (twice: i64) {
      sum * 2
    });
    let pipeline = Pipeline::new("p", Arc::new(InMemoryStore::new()));
    {
      let _scope = pipeline.activate();
      let summed = add.call(&numbers_stream()).unwrap();
      double.call(&summed).unwrap();
    }
    let nodes = pipeline.nodes();
    assert_eq!(nodes[0].upstream(), &[] as &[usize]);
    assert_eq!(nodes[1].upstream(), &[0]);
  }

  #[test]
  fn test_duplicate_explicit_label_is_rejected() {
    let add = function_pod!("1", fn add_numbers(a: i64, b: i64) -> (sum: i64) {
      a + b
    });
    let pipeline = Pipeline::new("p", Arc::new(InMemoryStore::new()));
    let _scope = pipeline.activate();
    let source = numbers_stream();
    add.call_labeled(&source, Some("x")).unwrap();
    let err = add.call_labeled(&source, Some("x")).unwrap_err();
    assert!(matches!(err, OrcaError::NameCollision(_)));
  }

  #[test]
  fn test_run_inside_scope_is_rejected() {
    let pipeline = Pipeline::new("p", Arc::new(InMemoryStore::new()));
    let _scope = pipeline.activate();
    let err = pipeline.run().unwrap_err();
    assert!(matches!(err, OrcaError::PipelineState(_)));
  }

  #[test]
  fn test_df_before_run_is_empty_with_schema() {
    let add = function_pod!("1", fn add_numbers(a: i64, b: i64) -> (sum: i64) {
      a + b
    });
    let pipeline = Pipeline::new("p", Arc::new(InMemoryStore::new()));
    {
      let _scope = pipeline.activate();
      add.call(&numbers_stream()).unwrap();
    }
    let df = pipeline.df("add_numbers_0").unwrap();
    assert_eq!(df.num_rows(), 0);
    assert_eq!(df.num_columns(), 2); // id, sum
  }

  #[test]
  fn test_run_and_df() {
    let add = function_pod!("1", fn add_numbers(a: i64, b: i64) -> (sum: i64) {
      a + b
    });
    let pipeline = Pipeline::new("p", Arc::new(InMemoryStore::new()));
    {
      let _scope = pipeline.activate();
      add.call(&numbers_stream()).unwrap();
    }
    pipeline.run().unwrap();
    let df = pipeline.df("add_numbers_0").unwrap();
    assert_eq!(df.num_rows(), 3);
    assert_eq!(add.call_count(), 3);
  }

  #[test]
  fn test_standalone_invocation_outside_scope() {
    let add = function_pod!("1", fn add_numbers(a: i64, b: i64) -> (sum: i64) {
      a + b
    });
    let out = add.call(&numbers_stream()).unwrap();
    let rows = out.flow().unwrap();
    assert_eq!(rows[0].1.get("sum"), Some(&Value::Int64(11)));
  }
}
