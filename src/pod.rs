//! Pods: pure typed functions lifted over streams.
//!
//! A [`FunctionPod`] wraps a pure function of typed scalars. Input parameter
//! names define the packet fields it consumes; output keys define the packet
//! fields it produces. Tags pass through unchanged — a pod is a per-record
//! map.
//!
//! Pod identity is explicit: the constructor requires an implementation
//! version string, and editing the function without bumping it will hit
//! stale caches. The [`function_pod!`](crate::function_pod) macro derives
//! the input/output typespecs from a typed Rust signature:
//!
//! ```
//! use orcapod::function_pod;
//!
//! let add = function_pod!("1", fn add_numbers(a: i64, b: i64) -> (sum: i64) {
//!   a + b
//! });
//! assert_eq!(add.name(), "add_numbers");
//! ```

use crate::datagram::{Packet, SourceInfo, Tag};
use crate::error::{OrcaError, Result};
use crate::hash::{Fingerprint, Hasher};
use crate::kernel::{EvalContext, Kernel, NodeKind};
use crate::pipeline;
use crate::stream::{SharedStream, Stream};
use crate::table::{self, TableOptions};
use crate::types::{TypeSpec, Value};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Error type a pod function may return.
pub type PodError = Box<dyn std::error::Error + Send + Sync>;

type PodFn = dyn Fn(&[Value]) -> std::result::Result<Vec<Value>, PodError> + Send + Sync;

/// A pure typed function over packets.
///
/// Execution is memoized per unique input identity: each record's call is
/// keyed by the pod identity plus the input packet's content hash, and the
/// store is consulted before the user function runs.
#[derive(Clone)]
pub struct FunctionPod {
  name: String,
  label: Option<String>,
  inputs: TypeSpec,
  outputs: TypeSpec,
  impl_version: String,
  func: Arc<PodFn>,
  calls: Arc<AtomicU64>,
}

impl FunctionPod {
  /// Wraps a function. `inputs` and `outputs` declare the consumed and
  /// produced packet fields in order; `impl_version` is the engineer-owned
  /// identity component that must change when the function's semantics do.
  pub fn new<F>(
    name: impl Into<String>,
    inputs: TypeSpec,
    outputs: TypeSpec,
    impl_version: impl Into<String>,
    func: F,
  ) -> Self
  where
    F: Fn(&[Value]) -> std::result::Result<Vec<Value>, PodError> + Send + Sync + 'static,
  {
    Self {
      name: name.into(),
      label: None,
      inputs,
      outputs,
      impl_version: impl_version.into(),
      func: Arc::new(func),
      calls: Arc::new(AtomicU64::new(0)),
    }
  }

  /// Sets the default node label used when invocations are registered.
  #[must_use]
  pub fn with_label(mut self, label: impl Into<String>) -> Self {
    self.label = Some(label.into());
    self
  }

  /// The declared function name.
  #[must_use]
  pub fn name(&self) -> &str {
    &self.name
  }

  /// Input field names and types, in parameter order.
  #[must_use]
  pub fn inputs(&self) -> &TypeSpec {
    &self.inputs
  }

  /// Output keys and types, in declaration order.
  #[must_use]
  pub fn outputs(&self) -> &TypeSpec {
    &self.outputs
  }

  /// The implementation version string.
  #[must_use]
  pub fn impl_version(&self) -> &str {
    &self.impl_version
  }

  /// Number of true user-function invocations so far. Store hits do not
  /// count.
  #[must_use]
  pub fn call_count(&self) -> u64 {
    self.calls.load(Ordering::Relaxed)
  }

  /// Applies the pod to a stream, returning the lazy output stream.
  ///
  /// Inside an active pipeline scope this registers a node; outside, it
  /// returns a standalone lazy stream. Input validation runs immediately.
  pub fn call(&self, input: &SharedStream) -> Result<SharedStream> {
    self.call_labeled(input, None)
  }

  /// Like [`FunctionPod::call`] with an explicit node label, overriding any
  /// label set on the pod itself.
  pub fn call_labeled(&self, input: &SharedStream, label: Option<&str>) -> Result<SharedStream> {
    pipeline::register_invocation(
      Arc::new(self.clone()),
      vec![input.clone()],
      label.map(str::to_string).or_else(|| self.label.clone()),
    )
  }

  fn check_outputs(&self, values: &[Value]) -> Result<()> {
    if values.len() != self.outputs.len() {
      return Err(OrcaError::SchemaMismatch(format!(
        "pod '{}' declared {} outputs but returned {}",
        self.name,
        self.outputs.len(),
        values.len()
      )));
    }
    for ((key, declared), value) in self.outputs.iter().zip(values) {
      if value.data_type() != declared {
        return Err(OrcaError::SchemaMismatch(format!(
          "pod '{}' output '{key}' declared {declared} but returned {}",
          self.name,
          value.data_type()
        )));
      }
    }
    Ok(())
  }

  fn restore_packet(
    &self,
    store: &dyn crate::store::Store,
    call_fp: &Fingerprint,
  ) -> Result<Option<Packet>> {
    let Some(batch) = store.get_table(call_fp)? else {
      return Ok(None);
    };
    let mut rows = table::batch_to_rows(&batch, &TypeSpec::new(), &self.outputs)?;
    if rows.len() != 1 {
      return Err(OrcaError::FingerprintCollision {
        fingerprint: call_fp.to_hex(),
      });
    }
    Ok(Some(rows.remove(0).1))
  }
}

impl fmt::Display for FunctionPod {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match &self.label {
      Some(label) => write!(f, "{}({label})", self.name),
      None => f.write_str(&self.name),
    }
  }
}

impl Kernel for FunctionPod {
  fn name(&self) -> &str {
    &self.name
  }

  fn kind(&self) -> NodeKind {
    NodeKind::Pod
  }

  fn label(&self) -> Option<&str> {
    self.label.as_deref()
  }

  fn identity(&self, hasher: &Hasher) -> Fingerprint {
    hasher.hash_pod_identity(&self.name, &self.inputs, &self.outputs, &self.impl_version)
  }

  fn output_types(&self, upstreams: &[SharedStream]) -> Result<(TypeSpec, TypeSpec)> {
    if upstreams.len() != 1 {
      return Err(OrcaError::SchemaMismatch(format!(
        "pod '{}' requires exactly one input stream, got {}",
        self.name,
        upstreams.len()
      )));
    }
    let input = &upstreams[0];

    // The input packet schema must cover every declared input field with the
    // exact declared type. Extra fields are dropped from the output.
    for (field, declared) in self.inputs.iter() {
      match input.packet_schema().get(field) {
        None => {
          return Err(OrcaError::MissingField {
            field: field.to_string(),
            context: format!("input packet schema of pod '{}'", self.name),
          })
        }
        Some(actual) if actual != declared => {
          return Err(OrcaError::SchemaMismatch(format!(
            "pod '{}' input '{field}' declared {declared} but stream has {actual}",
            self.name
          )))
        }
        Some(_) => {}
      }
    }

    for key in self.outputs.keys() {
      if input.tag_schema().contains(key) {
        return Err(OrcaError::NameCollision(format!(
          "pod '{}' output '{key}' collides with a tag column",
          self.name
        )));
      }
    }

    Ok((input.tag_schema().clone(), self.outputs.clone()))
  }

  fn evaluate(
    &self,
    upstreams: &[SharedStream],
    ctx: &EvalContext<'_>,
  ) -> Result<Vec<(Tag, Packet)>> {
    let input = &upstreams[0];
    let hasher = ctx.hasher();
    let pod_identity = self.identity(&hasher);

    let rows = input.flow()?;
    let mut output = Vec::with_capacity(rows.len());
    for (tag, packet) in rows.iter() {
      let call_fp = hasher.hash_pod_call(&pod_identity, &packet.content_hash());

      if let Some(store) = ctx.store {
        if let Some(cached) = self.restore_packet(store, &call_fp)? {
          debug!(pod = %self.name, tag = %tag, "serving pod call from store");
          output.push((tag.clone(), cached));
          continue;
        }
      }

      let args: Vec<Value> = self
        .inputs
        .keys()
        .map(|field| packet.get(field).cloned().expect("validated at construction"))
        .collect();

      self.calls.fetch_add(1, Ordering::Relaxed);
      let values = (self.func)(&args).map_err(|source| OrcaError::PodRuntime {
        label: ctx.label.to_string(),
        tag: tag.to_string(),
        source,
      })?;
      self.check_outputs(&values)?;

      let source = self
        .outputs
        .keys()
        .map(|key| SourceInfo::Invocation {
          fingerprint: call_fp,
          field: key.to_string(),
        })
        .collect();
      let out_packet = Packet::new(
        self.outputs.clone(),
        values,
        Some(source),
        ctx.context.clone(),
      )?;

      if let Some(store) = ctx.store {
        let batch = table::rows_to_batch(
          &TypeSpec::new(),
          &self.outputs,
          &[(Tag::empty(), out_packet.clone())],
          &TableOptions::full(),
        )?;
        store.put_table(&call_fp, &batch)?;
      }

      output.push((tag.clone(), out_packet));
    }
    Ok(output)
  }
}

/// Converts a pod function's return value into the declared output tuple.
///
/// Scalars map to a single output; tuples map positionally onto multiple
/// output keys.
pub trait IntoOutputs {
  /// The output values, in output-key order.
  fn into_outputs(self) -> Vec<Value>;
}

macro_rules! impl_into_outputs_scalar {
  ($($t:ty),* $(,)?) => {
    $(
      impl IntoOutputs for $t {
        fn into_outputs(self) -> Vec<Value> {
          vec![self.into()]
        }
      }
    )*
  };
}

impl_into_outputs_scalar!(bool, i8, i16, i32, i64, u8, u16, u32, u64, f32, f64, String, Vec<u8>);

impl IntoOutputs for &str {
  fn into_outputs(self) -> Vec<Value> {
    vec![self.into()]
  }
}

impl IntoOutputs for Value {
  fn into_outputs(self) -> Vec<Value> {
    vec![self]
  }
}

impl<A: Into<Value>, B: Into<Value>> IntoOutputs for (A, B) {
  fn into_outputs(self) -> Vec<Value> {
    vec![self.0.into(), self.1.into()]
  }
}

impl<A: Into<Value>, B: Into<Value>, C: Into<Value>> IntoOutputs for (A, B, C) {
  fn into_outputs(self) -> Vec<Value> {
    vec![self.0.into(), self.1.into(), self.2.into()]
  }
}

impl<A: Into<Value>, B: Into<Value>, C: Into<Value>, D: Into<Value>> IntoOutputs for (A, B, C, D) {
  fn into_outputs(self) -> Vec<Value> {
    vec![self.0.into(), self.1.into(), self.2.into(), self.3.into()]
  }
}

/// Declares a [`FunctionPod`] from a typed signature.
///
/// The first argument is the implementation version; the rest reads like a
/// function definition whose return type names the output keys:
///
/// ```
/// use orcapod::function_pod;
///
/// let stats = function_pod!("2", fn stats(a: i64, b: i64) -> (sum: i64, diff: i64) {
///   (a + b, a - b)
/// });
/// assert_eq!(stats.outputs().len(), 2);
/// ```
#[macro_export]
macro_rules! function_pod {
  ($version:expr, fn $name:ident( $($arg:ident : $aty:ty),* $(,)? )
      -> ( $($out:ident : $oty:ty),+ $(,)? ) $body:block) => {{
    $crate::pod::FunctionPod::new(
      stringify!($name),
      $crate::types::TypeSpec::from_pairs(vec![
        $((stringify!($arg).to_string(), <$aty as $crate::types::ScalarType>::DATA_TYPE)),*
      ]),
      $crate::types::TypeSpec::from_pairs(vec![
        $((stringify!($out).to_string(), <$oty as $crate::types::ScalarType>::DATA_TYPE)),+
      ]),
      $version,
      move |__args: &[$crate::types::Value]| {
        let mut __iter = __args.iter();
        $(
          let $arg: $aty = <$aty as $crate::types::ScalarType>::from_value(
            __iter.next().ok_or("pod argument missing")?,
          )?;
        )*
        let __result = $body;
        ::std::result::Result::Ok($crate::pod::IntoOutputs::into_outputs(__result))
      },
    )
  }};
}
