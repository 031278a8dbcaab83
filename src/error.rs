use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, OrcaError>;

/// Error type for all OrcaPod operations.
///
/// Validation errors (`SchemaMismatch`, `NameCollision`, `MissingField`,
/// `UnsupportedType`) are raised synchronously at construction time.
/// Evaluation errors are raised on first materialization and attributed to
/// the offending node.
#[derive(Debug, Error)]
pub enum OrcaError {
  /// Incompatible typespecs on operator or pod input.
  #[error("schema mismatch: {0}")]
  SchemaMismatch(String),
  /// Overlapping non-tag columns at join, or overlapping tag/packet keys.
  #[error("name collision: {0}")]
  NameCollision(String),
  /// A required field is not present.
  #[error("missing field '{field}' in {context}")]
  MissingField { field: String, context: String },
  /// Logical type outside the supported algebra.
  #[error("unsupported type: {0}")]
  UnsupportedType(String),
  /// The store observed two distinct payloads under the same fingerprint.
  #[error("fingerprint collision at {fingerprint}: differing payloads")]
  FingerprintCollision { fingerprint: String },
  /// A user function failed during pod execution.
  #[error("pod '{label}' failed on tag {tag}: {source}")]
  PodRuntime {
    label: String,
    tag: String,
    #[source]
    source: Box<dyn std::error::Error + Send + Sync>,
  },
  /// An error attributed to a named pipeline node.
  #[error("node '{label}': {source}")]
  Node {
    label: String,
    #[source]
    source: Box<OrcaError>,
  },
  /// Operator/pod called in a stale or mismatched pipeline context, or
  /// `run` called outside its preconditions.
  #[error("pipeline state error: {0}")]
  PipelineState(String),
  /// Arrow-level failure during table construction or access.
  #[error("arrow error: {0}")]
  Arrow(#[from] arrow::error::ArrowError),
  /// Parquet-level failure in the file-backed store.
  #[error("parquet error: {0}")]
  Parquet(#[from] parquet::errors::ParquetError),
  /// I/O or filesystem error.
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
  /// Serialization or deserialization failed.
  #[error("serialization error: {0}")]
  Serialization(String),
}

impl OrcaError {
  /// Attributes an error to a pipeline node, unless it already carries a
  /// node label.
  pub(crate) fn with_node(self, label: &str) -> Self {
    match self {
      e @ (OrcaError::PodRuntime { .. } | OrcaError::Node { .. }) => e,
      other => OrcaError::Node {
        label: label.to_string(),
        source: Box::new(other),
      },
    }
  }
}
