//! The kernel seam: the unit of computation invoked on streams.
//!
//! A kernel takes one or more input streams and produces a single output
//! stream. Structural operators ([`Join`](crate::join::Join)) and pods
//! ([`FunctionPod`](crate::pod::FunctionPod)) both implement [`Kernel`];
//! the pipeline tracks their invocations uniformly.

use crate::context::DataContext;
use crate::datagram::{Packet, Tag};
use crate::error::Result;
use crate::hash::{Fingerprint, Hasher};
use crate::stream::SharedStream;
use crate::store::Store;
use crate::types::TypeSpec;

/// Whether a node wraps a structural operator or a pod.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeKind {
  Operator,
  Pod,
}

/// Evaluation-time context handed to a kernel.
pub struct EvalContext<'a> {
  /// Store consulted for per-call memoization, when evaluating inside a
  /// pipeline.
  pub store: Option<&'a dyn Store>,
  /// Data context under which output packets are produced.
  pub context: &'a DataContext,
  /// Node label for error attribution.
  pub label: &'a str,
}

impl EvalContext<'_> {
  /// Returns the hasher at this context's version.
  #[must_use]
  pub fn hasher(&self) -> Hasher {
    self.context.hasher()
  }
}

/// A unit of computation over streams.
///
/// `output_types` performs every construction-time check and computes the
/// output schemas without touching data; `evaluate` performs the actual
/// computation on first materialization.
pub trait Kernel: Send + Sync {
  /// The kernel's name; the default node-label stem.
  fn name(&self) -> &str;

  /// Whether this kernel is an operator or a pod.
  fn kind(&self) -> NodeKind;

  /// Explicit label attached to the kernel, if any.
  fn label(&self) -> Option<&str> {
    None
  }

  /// Stable identity of this kernel under the given hasher.
  fn identity(&self, hasher: &Hasher) -> Fingerprint;

  /// Validates the input streams and returns the output
  /// `(tag typespec, packet typespec)`. Must not read stream data.
  fn output_types(&self, upstreams: &[SharedStream]) -> Result<(TypeSpec, TypeSpec)>;

  /// Computes the output records from the materialized upstreams.
  fn evaluate(&self, upstreams: &[SharedStream], ctx: &EvalContext<'_>)
    -> Result<Vec<(Tag, Packet)>>;
}
