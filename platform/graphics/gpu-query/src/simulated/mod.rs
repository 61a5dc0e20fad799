//! A deterministic in-process device.
//!
//! Nothing runs asynchronously: submitted command lists stay in flight until the owner
//! of the device retires them with [`SimulatedDevice::complete_through`] (or the config
//! asks for completion at submit time), which makes every interleaving of cpu issue,
//! gpu execution and host visibility reproducible.

use std::collections::VecDeque;

use generation_heap::*;
use parking_lot::Mutex;

use crate::*;

mod gpu;
use gpu::*;
pub use gpu::ResolvedRecord;

#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedDeviceConfig {
  /// the value written by the first executed timestamp
  pub timestamp_origin: u64,
  /// ticks between two executed timestamps
  pub timestamp_step: u64,
  /// nanoseconds per timestamp tick
  pub timestamp_period: f32,
  /// the sample of the first executed counter query, counter `c` of a record is
  /// `sample * (c + 1)`
  pub counter_origin: u64,
  pub counter_step: u64,
  pub readback_page_size: u64,
  pub readback_budget: Option<u64>,
  /// submit automatically once the open command list holds this many commands
  pub auto_submit_threshold: Option<usize>,
  /// retire every command list right when it is submitted
  pub complete_on_submit: bool,
  /// how many resolved records are kept for inspection, the oldest are dropped first
  pub resolved_record_capacity: usize,
}

impl Default for SimulatedDeviceConfig {
  fn default() -> Self {
    Self {
      timestamp_origin: 1_000,
      timestamp_step: 16,
      timestamp_period: 1.,
      counter_origin: 100,
      counter_step: 10,
      readback_page_size: 64 * 1024,
      readback_budget: None,
      auto_submit_threshold: None,
      complete_on_submit: false,
      resolved_record_capacity: 1024,
    }
  }
}

impl SimulatedDeviceConfig {
  pub fn with_timestamps(mut self, origin: u64, step: u64) -> Self {
    self.timestamp_origin = origin;
    self.timestamp_step = step;
    self
  }

  pub fn with_readback_budget(mut self, budget: u64) -> Self {
    self.readback_budget = Some(budget);
    self
  }

  pub fn with_auto_submit_threshold(mut self, threshold: usize) -> Self {
    self.auto_submit_threshold = Some(threshold);
    self
  }

  pub fn with_complete_on_submit(mut self, complete_on_submit: bool) -> Self {
    self.complete_on_submit = complete_on_submit;
    self
  }

  pub fn with_resolved_record_capacity(mut self, capacity: usize) -> Self {
    self.resolved_record_capacity = capacity;
    self
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimulatedDeviceStatistics {
  pub submitted_command_lists: u64,
  pub blocking_waits: u64,
  pub additional_commands_notifications: u64,
  pub readback_maps: u64,
  /// the written range reported by the most recent unmap
  pub last_unmap_written_range: Option<Range<usize>>,
  pub resolved_record_count: u64,
}

/// The host side of a query heap living in a [`SimulatedDevice`].
#[derive(Debug)]
pub struct SimulatedQueryHeap {
  key: usize,
  ty: QueryHeapType,
  count: u32,
}

impl SimulatedQueryHeap {
  pub fn ty(&self) -> QueryHeapType {
    self.ty
  }

  pub fn count(&self) -> u32 {
    self.count
  }
}

#[derive(Debug)]
pub struct SimulatedReadback {
  allocation: Suballocation,
}

impl SimulatedReadback {
  pub fn range(&self) -> SuballocationRange {
    self.allocation.range()
  }
}

struct SimulatedDeviceInner {
  config: SimulatedDeviceConfig,
  command_list_id: u64,
  recording: Vec<SimulatedCommand>,
  in_flight: VecDeque<SubmittedCommandList>,
  completed_fence_value: u64,
  query_heaps: slab::Slab<SimulatedQueryHeapStorage>,
  deferred_heaps: DeferredDeletionQueue<usize>,
  readback: GenerationSuballocator,
  next_timestamp: u64,
  next_sample: u64,
  injected_submission_failures: VecDeque<GPUDeviceError>,
  injected_heap_failures: VecDeque<GPUDeviceError>,
  injected_map_failures: VecDeque<GPUDeviceError>,
  statistics: SimulatedDeviceStatistics,
  resolved_records: VecDeque<ResolvedRecord>,
}

impl SimulatedDeviceInner {
  fn new(config: SimulatedDeviceConfig) -> Self {
    let mut readback = GenerationSuballocator::new(config.readback_page_size);
    if let Some(budget) = config.readback_budget {
      readback = readback.with_budget(budget);
    }
    Self {
      command_list_id: 1,
      recording: Vec::new(),
      in_flight: VecDeque::new(),
      completed_fence_value: 0,
      query_heaps: Default::default(),
      deferred_heaps: Default::default(),
      readback,
      next_timestamp: config.timestamp_origin,
      next_sample: config.counter_origin,
      injected_submission_failures: VecDeque::new(),
      injected_heap_failures: VecDeque::new(),
      injected_map_failures: VecDeque::new(),
      statistics: Default::default(),
      resolved_records: VecDeque::new(),
      config,
    }
  }

  fn record(&mut self, command: SimulatedCommand) {
    self.recording.push(command);
  }

  fn submit(&mut self) {
    if self.recording.is_empty() {
      return;
    }
    let id = self.command_list_id;
    let commands = std::mem::take(&mut self.recording);
    log::trace!("submit command list {id} ({} commands)", commands.len());
    self.in_flight.push_back(SubmittedCommandList { id, commands });
    self.command_list_id += 1;
    self.statistics.submitted_command_lists += 1;

    if self.config.complete_on_submit {
      self.retire_through(id);
    }
  }

  fn retire_through(&mut self, fence_value: u64) {
    while self
      .in_flight
      .front()
      .is_some_and(|list| list.id <= fence_value)
    {
      if let Some(list) = self.in_flight.pop_front() {
        let id = list.id;
        self.execute(list);
        self.completed_fence_value = id;
      }
    }
    self.reclaim();
  }

  fn reclaim(&mut self) {
    let completed = self.completed_fence_value;
    for key in self.deferred_heaps.trim(completed) {
      self.query_heaps.remove(key);
      log::trace!("query heap {key} destroyed after fence {completed}");
    }
    self.readback.reclaim(completed);
  }
}

/// A cheap clonable handle to a simulated device.
#[derive(Clone)]
pub struct SimulatedDevice {
  inner: Arc<Mutex<SimulatedDeviceInner>>,
}

impl Default for SimulatedDevice {
  fn default() -> Self {
    Self::new(Default::default())
  }
}

impl SimulatedDevice {
  pub fn new(config: SimulatedDeviceConfig) -> Self {
    Self {
      inner: Arc::new(Mutex::new(SimulatedDeviceInner::new(config))),
    }
  }

  /// execute every submitted command list up to and including `fence_value`
  pub fn complete_through(&self, fence_value: u64) {
    self.inner.lock().retire_through(fence_value)
  }

  /// execute everything submitted so far, the open command list is left alone
  pub fn complete_all_submitted(&self) {
    self.inner.lock().retire_through(u64::MAX)
  }

  /// the next submission fails with `error` and leaves the open command list untouched
  pub fn inject_submission_failure(&self, error: GPUDeviceError) {
    self.inner.lock().injected_submission_failures.push_back(error);
  }

  pub fn inject_query_heap_failure(&self, error: GPUDeviceError) {
    self.inner.lock().injected_heap_failures.push_back(error);
  }

  pub fn inject_map_failure(&self, error: GPUDeviceError) {
    self.inner.lock().injected_map_failures.push_back(error);
  }

  pub fn timestamp_period(&self) -> f32 {
    self.inner.lock().config.timestamp_period
  }

  pub fn statistics(&self) -> SimulatedDeviceStatistics {
    self.inner.lock().statistics.clone()
  }

  /// drain the records resolved since the last call, oldest first
  pub fn take_resolved_records(&self) -> Vec<ResolvedRecord> {
    self.inner.lock().resolved_records.drain(..).collect()
  }

  pub fn readback_statistics(&self) -> SuballocatorStatistics {
    self.inner.lock().readback.statistics()
  }

  /// heaps alive on the device, including the ones waiting for deferred deletion
  pub fn live_query_heap_count(&self) -> usize {
    self.inner.lock().query_heaps.len()
  }

  pub fn pending_heap_deletions(&self) -> usize {
    self.inner.lock().deferred_heaps.len()
  }

  pub fn in_flight_command_lists(&self) -> usize {
    self.inner.lock().in_flight.len()
  }
}

impl GPUQueryDevice for SimulatedDevice {
  type QueryHeap = SimulatedQueryHeap;
  type ReadbackAllocation = SimulatedReadback;

  fn command_list_id(&self) -> u64 {
    self.inner.lock().command_list_id
  }

  fn command_list_id_with_commands(&self) -> u64 {
    let inner = self.inner.lock();
    if inner.recording.is_empty() {
      inner.command_list_id - 1
    } else {
      inner.command_list_id
    }
  }

  fn completed_fence_value(&self) -> u64 {
    self.inner.lock().completed_fence_value
  }

  fn submit_command_list(&self) -> Result<(), GPUDeviceError> {
    let mut inner = self.inner.lock();
    if let Some(error) = inner.injected_submission_failures.pop_front() {
      return Err(error);
    }
    inner.submit();
    Ok(())
  }

  fn additional_commands_added(&self) {
    let mut inner = self.inner.lock();
    inner.statistics.additional_commands_notifications += 1;
    if let Some(threshold) = inner.config.auto_submit_threshold {
      if inner.recording.len() >= threshold {
        inner.submit();
      }
    }
  }

  fn wait_for_completion(&self) -> Result<(), GPUDeviceError> {
    let mut inner = self.inner.lock();
    if let Some(error) = inner.injected_submission_failures.pop_front() {
      return Err(error);
    }
    inner.submit();
    inner.retire_through(u64::MAX);
    inner.statistics.blocking_waits += 1;
    Ok(())
  }

  fn create_query_heap(
    &self,
    ty: QueryHeapType,
    count: u32,
  ) -> Result<SimulatedQueryHeap, GPUDeviceError> {
    let mut inner = self.inner.lock();
    if let Some(error) = inner.injected_heap_failures.pop_front() {
      return Err(error);
    }
    let counters_per_slot = match ty {
      QueryHeapType::Timestamp => QueryType::Timestamp,
      QueryHeapType::Occlusion => QueryType::Occlusion,
      QueryHeapType::PipelineStatistics => QueryType::PipelineStatistics,
      QueryHeapType::StreamOutputStatistics => QueryType::StreamOutputStatistics { stream: 0 },
    }
    .counter_count();
    let key = inner
      .query_heaps
      .insert(SimulatedQueryHeapStorage::new(ty, count, counters_per_slot));
    Ok(SimulatedQueryHeap { key, ty, count })
  }

  fn defer_deletion(&self, heap: SimulatedQueryHeap, last_used_command_list_id: u64) {
    let mut inner = self.inner.lock();
    inner
      .deferred_heaps
      .push(heap.key, last_used_command_list_id);
    inner.reclaim();
  }

  fn acquire_readback(&self, size: u64) -> Result<SimulatedReadback, GPUDeviceError> {
    let mut inner = self.inner.lock();
    let allocation = inner.readback.acquire(size).map_err(|err| {
      log::debug!("readback acquire failed: {err}");
      GPUDeviceError::OutOfMemory
    })?;
    Ok(SimulatedReadback { allocation })
  }

  fn release_readback(&self, allocation: SimulatedReadback, last_used_command_list_id: u64) {
    let mut inner = self.inner.lock();
    inner
      .readback
      .release(allocation.allocation, last_used_command_list_id);
    inner.reclaim();
  }

  /// `access` runs with the device locked and must not call back into the device
  fn map_readback(
    &self,
    allocation: &SimulatedReadback,
    read_range: Range<usize>,
    access: &mut dyn FnMut(&mut [u8]) -> Range<usize>,
  ) -> Result<(), GPUDeviceError> {
    let mut inner = self.inner.lock();
    if let Some(error) = inner.injected_map_failures.pop_front() {
      return Err(error);
    }
    let memory = inner.readback.memory_mut(allocation.range());
    if read_range.end > memory.len() {
      return Err(GPUDeviceError::Native(format!(
        "map read range {read_range:?} exceeds allocation of {} bytes",
        memory.len()
      )));
    }
    let written = access(memory);
    debug_assert!(written.end <= memory.len());

    inner.statistics.readback_maps += 1;
    inner.statistics.last_unmap_written_range = Some(written);
    Ok(())
  }

  fn record_query_begin(&self, heap: &SimulatedQueryHeap, ty: QueryType, index: u32) {
    debug_assert!(index < heap.count);
    self.inner.lock().record(SimulatedCommand::BeginQuery {
      heap: heap.key,
      ty,
      index,
    });
  }

  fn record_query_end(&self, heap: &SimulatedQueryHeap, ty: QueryType, index: u32) {
    debug_assert!(index < heap.count);
    self.inner.lock().record(SimulatedCommand::EndQuery {
      heap: heap.key,
      ty,
      index,
    });
  }

  fn record_query_resolve(
    &self,
    heap: &SimulatedQueryHeap,
    ty: QueryType,
    start_index: u32,
    count: u32,
    destination: &SimulatedReadback,
    destination_offset: u64,
  ) {
    debug_assert!(count > 0 && start_index + count <= heap.count);
    self.inner.lock().record(SimulatedCommand::ResolveQuery {
      heap: heap.key,
      ty,
      start_index,
      count,
      destination: destination.range(),
      destination_offset,
    });
  }
}
