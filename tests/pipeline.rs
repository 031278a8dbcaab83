use arrow::array::{ArrayRef, BooleanArray, Float64Array, Int64Array, StringArray};
use arrow::datatypes::{DataType as ArrowDataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use orcapod::{
  function_pod, FunctionPod, Hasher, ImmutableTableStream, InMemoryStore, Join, Kernel, OrcaError,
  ParquetStore, Pipeline, SharedStream, SourceInfo, Store, Stream, TableOptions, Value,
};
use std::sync::Arc;
use tempfile::TempDir;

fn int64(values: Vec<i64>) -> ArrayRef {
  Arc::new(Int64Array::from(values))
}

fn utf8(values: Vec<&str>) -> ArrayRef {
  Arc::new(StringArray::from(values))
}

fn mixed_batch() -> RecordBatch {
  let schema = Arc::new(Schema::new(vec![
    Field::new("a", ArrowDataType::Int64, false),
    Field::new("b", ArrowDataType::Utf8, false),
    Field::new("c", ArrowDataType::Boolean, false),
    Field::new("d", ArrowDataType::Float64, false),
  ]));
  RecordBatch::try_new(
    schema,
    vec![
      int64(vec![1, 2, 3]),
      utf8(vec!["x", "y", "z"]),
      Arc::new(BooleanArray::from(vec![true, false, true])),
      Arc::new(Float64Array::from(vec![1.1, 2.2, 3.3])),
    ],
  )
  .unwrap()
}

fn numbers_batch() -> RecordBatch {
  let schema = Arc::new(Schema::new(vec![
    Field::new("id", ArrowDataType::Int64, false),
    Field::new("a", ArrowDataType::Int64, false),
    Field::new("b", ArrowDataType::Int64, false),
  ]));
  RecordBatch::try_new(
    schema,
    vec![
      int64(vec![0, 1, 2, 3, 4]),
      int64(vec![1, 2, 3, 4, 5]),
      int64(vec![10, 20, 30, 40, 50]),
    ],
  )
  .unwrap()
}

fn numbers_stream() -> SharedStream {
  Arc::new(ImmutableTableStream::new(numbers_batch(), &["id"]).unwrap())
}

fn add_pod() -> FunctionPod {
  function_pod!("1", fn add_numbers(a: i64, b: i64) -> (sum: i64) {
    a + b
  })
}

fn multiply_pod() -> FunctionPod {
  function_pod!("1", fn multiply_numbers(a: i64, b: i64) -> (product: i64) {
    a * b
  })
}

fn combine_pod() -> FunctionPod {
  function_pod!("1", fn combine_results(sum: i64, product: i64) -> (total: i64) {
    sum + product
  })
}

struct Chained {
  pipeline: Pipeline,
  add: FunctionPod,
  multiply: FunctionPod,
  combine: FunctionPod,
}

fn build_chained(name: &str, store: Arc<dyn Store>) -> Chained {
  let add = add_pod();
  let multiply = multiply_pod();
  let combine = combine_pod();
  let pipeline = Pipeline::new(name, store);
  {
    let _scope = pipeline.activate();
    let source = numbers_stream();
    let summed = add.call(&source).unwrap();
    let multiplied = multiply.call(&source).unwrap();
    let joined = Join::new().apply(&summed, &multiplied).unwrap();
    combine.call(&joined).unwrap();
  }
  Chained {
    pipeline,
    add,
    multiply,
    combine,
  }
}

#[test]
fn table_stream_round_trip() {
  let batch = mixed_batch();
  let stream = ImmutableTableStream::new(batch.clone(), &["a", "b"]).unwrap();

  let rows = stream.flow().unwrap();
  assert_eq!(rows[0].0.get("a"), Some(&Value::Int64(1)));
  assert_eq!(rows[0].0.get("b"), Some(&Value::String("x".into())));
  assert_eq!(rows[0].1.get("c"), Some(&Value::Boolean(true)));
  assert_eq!(rows[0].1.get("d"), Some(&Value::Float64(1.1)));

  let materialized = stream.as_table(&TableOptions::new()).unwrap();
  assert_eq!(materialized, batch);

  // Re-declaring the same tag columns reproduces the pairs and typespecs.
  let again = ImmutableTableStream::new(materialized, &["a", "b"]).unwrap();
  assert_eq!(again.flow().unwrap(), stream.flow().unwrap());
  assert_eq!(again.tag_schema(), stream.tag_schema());
  assert_eq!(again.packet_schema(), stream.packet_schema());
}

#[test]
fn stream_flow_is_restartable() {
  let stream = ImmutableTableStream::new(mixed_batch(), &["a"]).unwrap();
  assert_eq!(stream.flow().unwrap(), stream.flow().unwrap());
}

#[test]
fn inner_join_matches_by_id() {
  let left_schema = Arc::new(Schema::new(vec![
    Field::new("id", ArrowDataType::Int64, false),
    Field::new("a", ArrowDataType::Int64, false),
    Field::new("b", ArrowDataType::Utf8, false),
  ]));
  let left = RecordBatch::try_new(
    left_schema,
    vec![int64(vec![0, 1, 4]), int64(vec![1, 2, 3]), utf8(vec!["x", "y", "z"])],
  )
  .unwrap();

  let right_schema = Arc::new(Schema::new(vec![
    Field::new("id", ArrowDataType::Int64, false),
    Field::new("c", ArrowDataType::Boolean, false),
    Field::new("d", ArrowDataType::Float64, false),
  ]));
  let right = RecordBatch::try_new(
    right_schema,
    vec![
      int64(vec![0, 1, 2]),
      Arc::new(BooleanArray::from(vec![true, false, true])),
      Arc::new(Float64Array::from(vec![1.1, 2.2, 3.3])),
    ],
  )
  .unwrap();

  let s1: SharedStream = Arc::new(ImmutableTableStream::new(left, &["id"]).unwrap());
  let s2: SharedStream = Arc::new(ImmutableTableStream::new(right, &["id"]).unwrap());

  let joined = Join::new().apply(&s1, &s2).unwrap();
  let table = joined.as_table(&TableOptions::new()).unwrap();
  assert_eq!(table.num_rows(), 2);
  assert_eq!(
    table.schema().fields().iter().map(|f| f.name().clone()).collect::<Vec<_>>(),
    vec!["id", "a", "b", "c", "d"]
  );

  let ids = table
    .column(0)
    .as_any()
    .downcast_ref::<Int64Array>()
    .unwrap();
  assert_eq!(ids.value(0), 0);
  assert_eq!(ids.value(1), 1);
}

#[test]
fn pod_execution_maps_records() {
  let add = add_pod();
  let out = add.call(&numbers_stream()).unwrap();
  let rows = out.flow().unwrap();
  let sums: Vec<i64> = rows
    .iter()
    .map(|(_, p)| match p.get("sum") {
      Some(Value::Int64(v)) => *v,
      other => panic!("unexpected sum {other:?}"),
    })
    .collect();
  assert_eq!(sums, vec![11, 22, 33, 44, 55]);
}

#[test]
fn join_construction_fails_on_mistyped_shared_tag() {
  let left = numbers_stream();

  let schema = Arc::new(Schema::new(vec![
    Field::new("id", ArrowDataType::Utf8, false),
    Field::new("c", ArrowDataType::Int64, false),
  ]));
  let batch =
    RecordBatch::try_new(schema, vec![utf8(vec!["0", "1"]), int64(vec![5, 6])]).unwrap();
  let right: SharedStream = Arc::new(ImmutableTableStream::new(batch, &["id"]).unwrap());

  let err = Join::new().apply(&left, &right).unwrap_err();
  assert!(matches!(err, OrcaError::SchemaMismatch(_)));
}

#[test]
fn fingerprints_are_stable_under_field_reordering() {
  // Same rows, columns declared in a different order.
  let reordered_schema = Arc::new(Schema::new(vec![
    Field::new("b", ArrowDataType::Int64, false),
    Field::new("id", ArrowDataType::Int64, false),
    Field::new("a", ArrowDataType::Int64, false),
  ]));
  let reordered = RecordBatch::try_new(
    reordered_schema,
    vec![
      int64(vec![10, 20, 30, 40, 50]),
      int64(vec![0, 1, 2, 3, 4]),
      int64(vec![1, 2, 3, 4, 5]),
    ],
  )
  .unwrap();

  let forward = ImmutableTableStream::new(numbers_batch(), &["id"]).unwrap();
  let shuffled = ImmutableTableStream::new(reordered, &["id"]).unwrap();
  assert_eq!(forward.fingerprint(), shuffled.fingerprint());

  // Packet content hashes agree row by row.
  let forward_rows = forward.flow().unwrap();
  let shuffled_rows = shuffled.flow().unwrap();
  for ((_, fp), (_, sp)) in forward_rows.iter().zip(shuffled_rows.iter()) {
    assert_eq!(fp.content_hash(), sp.content_hash());
  }

  // Pipelines built from the two sources have equal fingerprints.
  let build = |source: SharedStream| {
    let add = add_pod();
    let pipeline = Pipeline::new("p", Arc::new(InMemoryStore::new()));
    {
      let _scope = pipeline.activate();
      add.call(&source).unwrap();
    }
    pipeline.fingerprint()
  };
  assert_eq!(build(Arc::new(forward)), build(Arc::new(shuffled)));
}

#[test]
fn cross_pipeline_memoization_serves_from_store() {
  let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());

  let first = build_chained("first", store.clone());
  first.pipeline.run().unwrap();
  assert_eq!(first.add.call_count(), 5);
  assert_eq!(first.multiply.call_count(), 5);
  assert_eq!(first.combine.call_count(), 5);

  let labels = first.pipeline.node_labels();
  assert_eq!(
    labels,
    vec!["add_numbers_0", "multiply_numbers_0", "Join_0", "combine_results_0"]
  );

  // An identically structured pipeline against the same store sees every
  // result before running.
  let second = build_chained("second", store.clone());
  assert_eq!(second.pipeline.fingerprint(), first.pipeline.fingerprint());
  for label in &labels {
    let before = second.pipeline.df(label).unwrap();
    let after_first = first.pipeline.df(label).unwrap();
    assert_eq!(before, after_first, "df mismatch at node {label}");
    assert!(before.num_rows() > 0);
  }

  // Running it performs zero user-function invocations.
  second.pipeline.run().unwrap();
  assert_eq!(second.add.call_count(), 0);
  assert_eq!(second.multiply.call_count(), 0);
  assert_eq!(second.combine.call_count(), 0);

  let totals = second.pipeline.df("combine_results_0").unwrap();
  assert_eq!(totals.num_rows(), 5);
}

#[test]
fn impl_version_bump_invalidates_node_and_downstream() {
  let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());

  let first = build_chained("first", store.clone());
  first.pipeline.run().unwrap();

  // Same structure, but add_numbers changed semantics under a new version.
  let add_v2 = function_pod!("2", fn add_numbers(a: i64, b: i64) -> (sum: i64) {
    a + b + 1
  });
  let multiply = multiply_pod();
  let combine = combine_pod();
  let pipeline = Pipeline::new("changed", store.clone());
  {
    let _scope = pipeline.activate();
    let source = numbers_stream();
    let summed = add_v2.call(&source).unwrap();
    let multiplied = multiply.call(&source).unwrap();
    let joined = Join::new().apply(&summed, &multiplied).unwrap();
    combine.call(&joined).unwrap();
  }
  assert_ne!(pipeline.fingerprint(), first.pipeline.fingerprint());
  pipeline.run().unwrap();

  // The changed pod and its downstream recompute; the untouched sibling is
  // served from the store.
  assert_eq!(add_v2.call_count(), 5);
  assert_eq!(combine.call_count(), 5);
  assert_eq!(multiply.call_count(), 0);
}

#[test]
fn pod_outputs_carry_call_provenance() {
  let add = add_pod();
  let source = numbers_stream();
  let out = add.call(&source).unwrap();
  let rows = out.flow().unwrap();
  let inputs = source.flow().unwrap();

  let hasher = Hasher::default();
  let identity = add.identity(&hasher);
  for ((_, input), (_, output)) in inputs.iter().zip(rows.iter()) {
    let expected = hasher.hash_pod_call(&identity, &input.content_hash());
    match output.source_of("sum") {
      Some(SourceInfo::Invocation { fingerprint, field }) => {
        assert_eq!(*fingerprint, expected);
        assert_eq!(field, "sum");
      }
      other => panic!("expected invocation provenance, got {other:?}"),
    }
  }
}

#[test]
fn parquet_store_memoizes_across_processes() {
  let tmp = TempDir::new().unwrap();

  {
    let store: Arc<dyn Store> = Arc::new(ParquetStore::new(tmp.path()).unwrap());
    let first = build_chained("first", store);
    first.pipeline.run().unwrap();
    assert_eq!(first.add.call_count(), 5);
  }

  // A fresh store over the same directory stands in for a new process.
  let store: Arc<dyn Store> = Arc::new(ParquetStore::new(tmp.path()).unwrap());
  let second = build_chained("second", store);
  second.pipeline.run().unwrap();
  assert_eq!(second.add.call_count(), 0);
  assert_eq!(second.multiply.call_count(), 0);
  assert_eq!(second.combine.call_count(), 0);

  let totals = second.pipeline.df("combine_results_0").unwrap();
  assert_eq!(totals.num_rows(), 5);

  let total_column = totals
    .column(totals.schema().index_of("total").unwrap())
    .as_any()
    .downcast_ref::<Int64Array>()
    .unwrap()
    .iter()
    .flatten()
    .collect::<Vec<i64>>();
  assert_eq!(total_column, vec![21, 62, 123, 204, 305]);
}
