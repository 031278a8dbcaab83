#![doc = include_str!("../README.md")]

pub mod context;
pub mod datagram;
pub mod error;
pub mod hash;
pub mod join;
pub mod kernel;
pub mod pipeline;
pub mod pod;
pub mod store;
pub mod stream;
pub mod table;
pub mod types;

pub use context::{DataContext, LIB_VERSION};
pub use datagram::{Packet, SourceInfo, Tag, META_PREFIX};
pub use error::{OrcaError, Result};
pub use hash::{Fingerprint, Hasher, HASHER_VERSION};
pub use join::Join;
pub use kernel::{EvalContext, Kernel, NodeKind};
pub use pipeline::{Node, Pipeline, PipelineScope};
pub use pod::{FunctionPod, IntoOutputs, PodError};
pub use store::{InMemoryStore, ParquetStore, Store};
pub use stream::{ImmutableTableStream, KernelStream, SharedStream, Stream, StreamIter};
pub use table::{TableOptions, CONTENT_HASH_COLUMN, CONTEXT_KEY_COLUMN, SOURCE_PREFIX};
pub use types::{reconcile_typespecs, DataType, ScalarType, TypeSpec, Value};
