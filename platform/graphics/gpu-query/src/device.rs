use crate::*;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum GPUDeviceError {
  #[error("device is out of memory")]
  OutOfMemory,
  #[error("device has been lost")]
  DeviceLost,
  #[error("device call failed: {0}")]
  Native(String),
}

/// The hardware query type recorded into a command list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryType {
  Timestamp,
  Occlusion,
  PipelineStatistics,
  StreamOutputStatistics { stream: u32 },
}

impl QueryType {
  /// how many u64 values the device writes for one query slot of this type
  pub const fn counter_count(self) -> usize {
    match self {
      QueryType::Timestamp => 1,
      QueryType::Occlusion => 1,
      QueryType::PipelineStatistics => 11,
      QueryType::StreamOutputStatistics { .. } => 2,
    }
  }

  pub const fn heap_type(self) -> QueryHeapType {
    match self {
      QueryType::Timestamp => QueryHeapType::Timestamp,
      QueryType::Occlusion => QueryHeapType::Occlusion,
      QueryType::PipelineStatistics => QueryHeapType::PipelineStatistics,
      QueryType::StreamOutputStatistics { .. } => QueryHeapType::StreamOutputStatistics,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryHeapType {
  Timestamp,
  Occlusion,
  PipelineStatistics,
  StreamOutputStatistics,
}

/// The device context a query lives in.
///
/// It owns command list submission and the completion fence, hands out query heaps and
/// host readable memory, and records commands into the currently open command list.
///
/// Command lists are identified by a monotonically increasing id. The id of the open
/// list is the fence value that will be signaled once that list has executed, so work
/// recorded in list `n` is complete when `completed_fence_value() >= n`.
///
/// All methods take `&self`, an implementation is expected to be a cheap clonable handle
/// with its own interior synchronization.
pub trait GPUQueryDevice {
  type QueryHeap;
  type ReadbackAllocation;

  /// the id of the open command list
  fn command_list_id(&self) -> u64;
  /// the id of the most recent command list that holds commands: the open one if it
  /// is not empty, otherwise the last submitted one
  fn command_list_id_with_commands(&self) -> u64;
  fn completed_fence_value(&self) -> u64;

  /// close and submit the open command list, a no-op if it is empty
  fn submit_command_list(&self) -> Result<(), GPUDeviceError>;
  /// hint that more commands were recorded, the device may decide to submit early
  fn additional_commands_added(&self);
  /// submit pending work and block until everything submitted has completed
  fn wait_for_completion(&self) -> Result<(), GPUDeviceError>;

  fn create_query_heap(
    &self,
    ty: QueryHeapType,
    count: u32,
  ) -> Result<Self::QueryHeap, GPUDeviceError>;
  /// the heap is destroyed once `last_used_command_list_id` completes
  fn defer_deletion(&self, heap: Self::QueryHeap, last_used_command_list_id: u64);

  fn acquire_readback(&self, size: u64) -> Result<Self::ReadbackAllocation, GPUDeviceError>;
  /// the memory is not reused before `last_used_command_list_id` completes
  fn release_readback(
    &self,
    allocation: Self::ReadbackAllocation,
    last_used_command_list_id: u64,
  );
  /// map the allocation for host access.
  ///
  /// `access` receives the whole allocation and returns the byte range it wrote, which
  /// is reported on unmap. `read_range` is the range the host intends to read.
  fn map_readback(
    &self,
    allocation: &Self::ReadbackAllocation,
    read_range: Range<usize>,
    access: &mut dyn FnMut(&mut [u8]) -> Range<usize>,
  ) -> Result<(), GPUDeviceError>;

  fn record_query_begin(&self, heap: &Self::QueryHeap, ty: QueryType, index: u32);
  fn record_query_end(&self, heap: &Self::QueryHeap, ty: QueryType, index: u32);
  fn record_query_resolve(
    &self,
    heap: &Self::QueryHeap,
    ty: QueryType,
    start_index: u32,
    count: u32,
    destination: &Self::ReadbackAllocation,
    destination_offset: u64,
  );
}
