//! The join operator.
//!
//! `Join` produces the inner join of two streams on their shared tag
//! columns. All schema checks happen at construction of the derived stream,
//! before any data is read; evaluation groups the right side by shared
//! tag values and emits matches in left-major, right-iteration order.

use crate::datagram::{Packet, SourceInfo, Tag};
use crate::error::{OrcaError, Result};
use crate::hash::{Fingerprint, Hasher};
use crate::kernel::{EvalContext, Kernel, NodeKind};
use crate::pipeline;
use crate::stream::{SharedStream, Stream};
use crate::types::{reconcile_typespecs, TypeSpec, Value};
use std::collections::HashMap;
use std::fmt;

/// Inner join of two streams on their shared tag columns.
#[derive(Clone, Debug, Default)]
pub struct Join {
  label: Option<String>,
}

impl Join {
  /// Creates a join operator.
  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  /// Sets the node label used when the invocation is registered.
  #[must_use]
  pub fn with_label(mut self, label: impl Into<String>) -> Self {
    self.label = Some(label.into());
    self
  }

  /// Applies the join to two streams, returning the lazy joined stream.
  ///
  /// Inside an active pipeline scope this registers a node; outside, it
  /// returns a standalone lazy stream. Schema checks run immediately.
  pub fn apply(&self, left: &SharedStream, right: &SharedStream) -> Result<SharedStream> {
    pipeline::register_invocation(
      std::sync::Arc::new(self.clone()),
      vec![left.clone(), right.clone()],
      self.label.clone(),
    )
  }

  fn shared_tag_columns(left: &TypeSpec, right: &TypeSpec) -> Vec<String> {
    left
      .keys()
      .filter(|k| right.contains(k))
      .map(str::to_string)
      .collect()
  }
}

impl fmt::Display for Join {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match &self.label {
      Some(label) => write!(f, "Join({label})"),
      None => f.write_str("Join"),
    }
  }
}

impl Kernel for Join {
  fn name(&self) -> &str {
    "Join"
  }

  fn kind(&self) -> NodeKind {
    NodeKind::Operator
  }

  fn label(&self) -> Option<&str> {
    self.label.as_deref()
  }

  fn identity(&self, hasher: &Hasher) -> Fingerprint {
    hasher.hash_operator_identity("Join", std::iter::empty())
  }

  fn output_types(&self, upstreams: &[SharedStream]) -> Result<(TypeSpec, TypeSpec)> {
    if upstreams.len() != 2 {
      return Err(OrcaError::SchemaMismatch(format!(
        "join requires exactly two input streams, got {}",
        upstreams.len()
      )));
    }
    let (left, right) = (&upstreams[0], &upstreams[1]);

    let shared = Self::shared_tag_columns(left.tag_schema(), right.tag_schema());
    if shared.is_empty() {
      return Err(OrcaError::SchemaMismatch(
        "join requires at least one shared tag column".to_string(),
      ));
    }

    // Shared tag columns must agree on type; the joined tag schema is the
    // union with shared columns counted once.
    let tag_spec = reconcile_typespecs(
      left.tag_schema(),
      right.tag_schema(),
      shared.iter().map(String::as_str),
    )?;

    for name in left.packet_schema().keys() {
      if right.packet_schema().contains(name) {
        return Err(OrcaError::NameCollision(format!(
          "packet column '{name}' exists on both sides of the join"
        )));
      }
    }
    let packet_spec = left.packet_schema().union(right.packet_schema());

    for name in packet_spec.keys() {
      if tag_spec.contains(name) {
        return Err(OrcaError::NameCollision(format!(
          "column '{name}' is a tag on one side and a packet field on the other"
        )));
      }
    }

    Ok((tag_spec, packet_spec))
  }

  fn evaluate(
    &self,
    upstreams: &[SharedStream],
    _ctx: &EvalContext<'_>,
  ) -> Result<Vec<(Tag, Packet)>> {
    let (left, right) = (&upstreams[0], &upstreams[1]);
    let shared = Self::shared_tag_columns(left.tag_schema(), right.tag_schema());
    let (tag_spec, packet_spec) = self.output_types(upstreams)?;

    let right_rows = right.flow()?;
    let mut groups: HashMap<Vec<Value>, Vec<usize>> = HashMap::new();
    for (index, (tag, _)) in right_rows.iter().enumerate() {
      let key = tag.key_for(&shared).ok_or_else(|| OrcaError::MissingField {
        field: shared.join(","),
        context: "right tag".to_string(),
      })?;
      groups.entry(key).or_default().push(index);
    }

    let left_rows = left.flow()?;
    let mut output = Vec::new();
    for (left_tag, left_packet) in left_rows.iter() {
      let key = left_tag
        .key_for(&shared)
        .ok_or_else(|| OrcaError::MissingField {
          field: shared.join(","),
          context: "left tag".to_string(),
        })?;
      let Some(matches) = groups.get(&key) else {
        continue;
      };
      for &right_index in matches {
        let (right_tag, right_packet) = &right_rows[right_index];

        let mut tag_values = Vec::with_capacity(tag_spec.len());
        for name in tag_spec.keys() {
          let value = left_tag
            .get(name)
            .or_else(|| right_tag.get(name))
            .expect("joined tag schema covers both sides");
          tag_values.push(value.clone());
        }
        let tag = Tag::new(tag_spec.clone(), tag_values)?;

        let mut packet_values = Vec::with_capacity(packet_spec.len());
        let mut source = Vec::with_capacity(packet_spec.len());
        for name in packet_spec.keys() {
          let (value, info) = match left_packet.get(name) {
            Some(value) => (value, left_packet.source_of(name)),
            None => (
              right_packet
                .get(name)
                .expect("joined packet schema covers both sides"),
              right_packet.source_of(name),
            ),
          };
          packet_values.push(value.clone());
          source.push(info.cloned().unwrap_or(SourceInfo::Input));
        }
        let packet = Packet::new(
          packet_spec.clone(),
          packet_values,
          Some(source),
          left_packet.data_context().clone(),
        )?;

        output.push((tag, packet));
      }
    }
    Ok(output)
  }
}
