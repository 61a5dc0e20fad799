use crate::*;

/// Size of the stack accumulator used when reading back, in u64 counters. Every kind's
/// record must fit, which is checked at compile time below.
pub const QUERY_ACCUMULATOR_CAPACITY: usize = 12;

/// The logical query kinds a [`Query`] can measure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKind {
  Timestamp,
  Occlusion,
  PipelineStatistics,
  /// accumulated over all stream output streams
  StreamOutputStatistics,
}

/// How the accumulated counters are published into the caller's destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryResultMerge {
  /// keep the larger of the accumulated value and the value the caller seeded, so the
  /// results of several queries measuring the same event can be merged
  Max,
  /// write the accumulated counters, zero if the query was never issued
  Overwrite,
}

const STREAM_OUTPUT_STREAM_COUNT: u32 = 4;

impl QueryKind {
  pub const ALL: [QueryKind; 4] = [
    QueryKind::Timestamp,
    QueryKind::Occlusion,
    QueryKind::PipelineStatistics,
    QueryKind::StreamOutputStatistics,
  ];

  pub const fn heap_type(self) -> QueryHeapType {
    self.query_type(0).heap_type()
  }

  /// the hardware query type of one sub query
  pub const fn query_type(self, sub_query: u32) -> QueryType {
    match self {
      QueryKind::Timestamp => QueryType::Timestamp,
      QueryKind::Occlusion => QueryType::Occlusion,
      QueryKind::PipelineStatistics => QueryType::PipelineStatistics,
      QueryKind::StreamOutputStatistics => QueryType::StreamOutputStatistics { stream: sub_query },
    }
  }

  /// how many hardware queries compose one instance
  pub const fn sub_query_count(self) -> u32 {
    match self {
      QueryKind::StreamOutputStatistics => STREAM_OUTPUT_STREAM_COUNT,
      _ => 1,
    }
  }

  /// u64 counters in the record of one sub query
  pub const fn counters_per_record(self) -> usize {
    self.query_type(0).counter_count()
  }

  /// byte size of the record of one sub query in the result buffer
  pub const fn data_size(self) -> usize {
    self.counters_per_record() * std::mem::size_of::<u64>()
  }

  /// minimal destination size for reading back, sub queries are summed into one record
  pub const fn result_size(self) -> usize {
    self.data_size()
  }

  pub const fn merge(self) -> QueryResultMerge {
    match self {
      QueryKind::Timestamp => QueryResultMerge::Max,
      _ => QueryResultMerge::Overwrite,
    }
  }

  /// timestamps are a single point in time, everything else brackets a range of work
  pub const fn has_begin(self) -> bool {
    !matches!(self, QueryKind::Timestamp)
  }

  pub const fn default_instances_per_query(self) -> u32 {
    match self {
      QueryKind::Timestamp => 1,
      _ => 4,
    }
  }
}

const _: () = {
  let mut i = 0;
  while i < QueryKind::ALL.len() {
    assert!(
      QueryKind::ALL[i].counters_per_record() <= QUERY_ACCUMULATOR_CAPACITY,
      "query accumulator is not large enough"
    );
    i += 1;
  }
};

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct PipelineStatistics {
  pub input_assembler_vertices: u64,
  pub input_assembler_primitives: u64,
  pub vertex_shader_invocations: u64,
  pub geometry_shader_invocations: u64,
  pub geometry_shader_primitives: u64,
  pub clipper_invocations: u64,
  pub clipper_primitives: u64,
  pub pixel_shader_invocations: u64,
  pub hull_shader_invocations: u64,
  pub domain_shader_invocations: u64,
  pub compute_shader_invocations: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct StreamOutputStatistics {
  pub primitives_written: u64,
  pub primitives_storage_needed: u64,
}

const _: () = {
  assert!(std::mem::size_of::<PipelineStatistics>() == QueryKind::PipelineStatistics.result_size());
  assert!(
    std::mem::size_of::<StreamOutputStatistics>()
      == QueryKind::StreamOutputStatistics.result_size()
  );
};
