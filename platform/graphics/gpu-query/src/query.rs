use crate::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryDescriptor {
  pub kind: QueryKind,
  /// how many begin/end cycles fit before the results are accumulated on the host
  pub instances_per_query: u32,
  pub label: Option<String>,
}

impl QueryDescriptor {
  pub fn new(kind: QueryKind) -> Self {
    Self {
      kind,
      instances_per_query: kind.default_instances_per_query(),
      label: None,
    }
  }

  pub fn with_instances_per_query(mut self, instances_per_query: u32) -> Self {
    self.instances_per_query = instances_per_query;
    self
  }

  pub fn with_label(mut self, label: impl Into<String>) -> Self {
    self.label = Some(label.into());
    self
  }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryCreateFailure {
  #[error("{kind:?} queries can not use {requested} instances")]
  InvalidInstanceCount { kind: QueryKind, requested: u32 },
  #[error("failed to create the query heap")]
  QueryHeapCreationFailed(#[source] GPUDeviceError),
  #[error("failed to acquire the query result buffer")]
  ResultBufferAcquireFailed(#[source] GPUDeviceError),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryDataFailure {
  #[error("destination holds {provided} bytes but {kind:?} results need {required}")]
  DestinationTooSmall {
    kind: QueryKind,
    required: usize,
    provided: usize,
  },
  #[error("{0:?} queries have no begin")]
  BeginNotSupported(QueryKind),
  #[error("query data is still not ready after waiting for the device")]
  NotReadyAfterWait,
  #[error(transparent)]
  Device(#[from] GPUDeviceError),
}

/// A gpu query backed by a fixed size query heap and a host readable result buffer.
///
/// The heap holds `instances_per_query` instances. Every suspend resolves the active
/// instance into its own place in the result buffer, and resuming moves on to the next
/// instance. When the instances are exhausted the device is waited on, everything
/// resolved so far is summed into instance 0 on the host and rotation continues from
/// instance 1. Reading back sums all instances, so the result is the same as if the
/// heap were unbounded.
///
/// Dropping the query hands the heap to deferred deletion and the result buffer back to
/// the suballocator, both keyed on the last command list that used them.
pub struct Query<D: GPUQueryDevice> {
  device: D,
  state: AsyncState,
  label: Option<String>,
  query_heap: Option<D::QueryHeap>,
  result_buffer: Option<D::ReadbackAllocation>,
  instances_per_query: u32,
  current_instance: u32,
  /// a begin was recorded for `current_instance` and not yet followed by an end
  instance_active: bool,
  last_used_command_list_id: u64,
}

impl<D: GPUQueryDevice + Clone> Query<D> {
  pub fn new(device: &D, desc: &QueryDescriptor) -> Result<Self, QueryCreateFailure> {
    let kind = desc.kind;
    let instance_count_valid = if kind.has_begin() {
      // rotation needs instance 0 for the accumulated total and at least one more
      desc.instances_per_query >= 2
    } else {
      desc.instances_per_query == 1
    };
    // every slot must be addressable by the u32 heap index
    let slot_count = desc
      .instances_per_query
      .checked_mul(kind.sub_query_count());
    if !instance_count_valid || slot_count.is_none() {
      return Err(QueryCreateFailure::InvalidInstanceCount {
        kind,
        requested: desc.instances_per_query,
      });
    }

    let mut query = Self {
      device: device.clone(),
      state: AsyncState::new(kind),
      label: desc.label.clone(),
      query_heap: None,
      result_buffer: None,
      instances_per_query: desc.instances_per_query,
      current_instance: 0,
      instance_active: false,
      last_used_command_list_id: 0,
    };
    query.initialize()?;
    Ok(query)
  }
}

impl<D: GPUQueryDevice> Query<D> {
  fn initialize(&mut self) -> Result<(), QueryCreateFailure> {
    let kind = self.state.kind();
    let slot_count = self.instances_per_query * kind.sub_query_count();
    let buffer_size = kind.data_size() as u64 * slot_count as u64;

    // a failure leaves the fields empty, so drop releases only what was created
    let heap = self
      .device
      .create_query_heap(kind.heap_type(), slot_count)
      .map_err(QueryCreateFailure::QueryHeapCreationFailed)?;
    self.query_heap = Some(heap);

    let buffer = self
      .device
      .acquire_readback(buffer_size)
      .map_err(QueryCreateFailure::ResultBufferAcquireFailed)?;
    self.result_buffer = Some(buffer);

    self.current_instance = 0;
    self.instance_active = false;
    Ok(())
  }

  pub fn kind(&self) -> QueryKind {
    self.state.kind()
  }

  pub fn label(&self) -> Option<&str> {
    self.label.as_deref()
  }

  pub fn instances_per_query(&self) -> u32 {
    self.instances_per_query
  }

  pub fn current_instance(&self) -> u32 {
    self.current_instance
  }

  pub fn last_used_command_list_id(&self) -> u64 {
    self.last_used_command_list_id
  }

  fn heap(&self) -> &D::QueryHeap {
    self.query_heap.as_ref().unwrap()
  }

  fn result_buffer(&self) -> &D::ReadbackAllocation {
    self.result_buffer.as_ref().unwrap()
  }

  /// kept as the single place mapping an instance to heap slots
  fn query_index(&self, instance: u32) -> u32 {
    instance
  }

  fn slot(&self, instance: u32, sub_query: u32) -> u32 {
    self.query_index(instance) * self.kind().sub_query_count() + sub_query
  }

  /// start measuring into instance 0, discarding previous results
  pub fn begin(&mut self) -> Result<(), QueryDataFailure> {
    let kind = self.kind();
    if !kind.has_begin() {
      return Err(QueryDataFailure::BeginNotSupported(kind));
    }
    self.current_instance = 0;
    self.record_begin();
    Ok(())
  }

  /// continue measuring into a new instance after [`Self::suspend`]
  ///
  /// this may block on the device when the instances are exhausted.
  pub fn resume(&mut self) -> Result<(), QueryDataFailure> {
    let kind = self.kind();
    if !kind.has_begin() {
      return Err(QueryDataFailure::BeginNotSupported(kind));
    }
    self.advance_instance()?;
    self.record_begin();
    Ok(())
  }

  fn record_begin(&mut self) {
    assert!(self.current_instance < self.instances_per_query);
    let kind = self.kind();
    for sub_query in 0..kind.sub_query_count() {
      let index = self.slot(self.current_instance, sub_query);
      self
        .device
        .record_query_begin(self.heap(), kind.query_type(sub_query), index);
    }
    self.device.additional_commands_added();
    self.last_used_command_list_id = self.device.command_list_id();
    self.instance_active = true;
  }

  /// end the active instance and resolve it into the result buffer
  pub fn suspend(&mut self) {
    assert!(self.current_instance < self.instances_per_query);

    let kind = self.kind();
    let data_size = kind.data_size() as u64;
    for sub_query in 0..kind.sub_query_count() {
      let ty = kind.query_type(sub_query);
      let index = self.slot(self.current_instance, sub_query);

      self.device.record_query_end(self.heap(), ty, index);
      self.device.record_query_resolve(
        self.heap(),
        ty,
        index,
        1,
        self.result_buffer(),
        index as u64 * data_size,
      );
    }
    self.device.additional_commands_added();
    self.last_used_command_list_id = self.device.command_list_id();
    self.instance_active = false;
  }

  /// move to the next instance, accumulating everything into instance 0 when out of
  /// instances
  pub fn advance_instance(&mut self) -> Result<(), GPUDeviceError> {
    assert!(self.current_instance < self.instances_per_query);

    if self.current_instance + 1 < self.instances_per_query {
      self.current_instance += 1;
      return Ok(());
    }

    log::debug!(
      "query {:?} is out of instances, waiting for the device to accumulate",
      self.label
    );
    self.device.wait_for_completion()?;

    let kind = self.kind();
    let record_size = kind.data_size() * kind.sub_query_count() as usize;
    let read_range = 0..record_size * self.instances_per_query as usize;
    let written_instances = self.current_instance as usize;

    self
      .device
      .map_readback(self.result_buffer(), read_range, &mut |mapped| {
        let (instance0, rest) = mapped.split_at_mut(record_size);
        for instance in rest.chunks_exact(record_size).take(written_instances) {
          for (total, counter) in instance0
            .chunks_exact_mut(COUNTER_SIZE)
            .zip(instance.chunks_exact(COUNTER_SIZE))
          {
            let sum = read_counter(total).wrapping_add(read_counter(counter));
            total.copy_from_slice(bytes_of(&sum));
          }
        }
        0..record_size
      })?;

    // instance 0 now holds the running total, later instances are free to reuse
    self.current_instance = 1;
    Ok(())
  }
}

const COUNTER_SIZE: usize = std::mem::size_of::<u64>();

fn read_counter(bytes: &[u8]) -> u64 {
  bytemuck::pod_read_unaligned(bytes)
}

impl<D: GPUQueryDevice> Query<D> {
  /// read the result as `T`, starting from `seed`. `None` means not ready.
  pub fn get_data_as<T: Pod>(
    &mut self,
    seed: T,
    do_not_flush: bool,
  ) -> Result<Option<T>, QueryDataFailure> {
    let mut value = seed;
    let ready = self.get_data(bytemuck::bytes_of_mut(&mut value), do_not_flush, false)?;
    Ok(ready.then_some(value))
  }
}

impl<D: GPUQueryDevice> GPUAsync for Query<D> {
  type Device = D;

  fn device(&self) -> &D {
    &self.device
  }

  fn async_state(&self) -> &AsyncState {
    &self.state
  }

  fn async_state_mut(&mut self) -> &mut AsyncState {
    &mut self.state
  }

  fn end_internal(&mut self) {
    if !self.kind().has_begin() || !self.instance_active {
      // a timestamp is a single point, and an end without an open begin is a new
      // measurement replacing the previous results, both go into instance 0
      self.current_instance = 0;
    }

    self.suspend();
    self.current_instance += 1;

    debug_assert!(self.current_instance <= self.instances_per_query);
  }

  fn get_data_internal(&mut self, data: &mut [u8]) -> Result<(), QueryDataFailure> {
    debug_assert!(self.current_instance <= self.instances_per_query);

    let kind = self.kind();
    let required = kind.result_size();
    if data.len() < required {
      return Err(QueryDataFailure::DestinationTooSmall {
        kind,
        required,
        provided: data.len(),
      });
    }

    if self.state.ended_command_list_id() == 0 {
      log::warn!("reading query {:?} that was never ended", self.label);
    }

    let data_size = kind.data_size();
    let written = data_size * kind.sub_query_count() as usize * self.current_instance as usize;

    // all instances and sub queries fold into one record
    let mut accumulated = [0_u64; QUERY_ACCUMULATOR_CAPACITY];
    debug_assert!(kind.counters_per_record() <= accumulated.len());

    self
      .device
      .map_readback(self.result_buffer(), 0..written, &mut |mapped| {
        for record in mapped[..written].chunks_exact(data_size) {
          for (total, counter) in accumulated.iter_mut().zip(record.chunks_exact(COUNTER_SIZE)) {
            *total = total.wrapping_add(read_counter(counter));
          }
        }
        0..0
      })?;

    // the destination is only touched once the mapping succeeded
    let destination = &mut data[..required];
    match kind.merge() {
      QueryResultMerge::Max => {
        let timestamp = accumulated[0];
        if timestamp > read_counter(&destination[..COUNTER_SIZE]) {
          destination[..COUNTER_SIZE].copy_from_slice(bytes_of(&timestamp));
        }
      }
      QueryResultMerge::Overwrite => {
        destination.fill(0);
        for (target, total) in destination
          .chunks_exact_mut(COUNTER_SIZE)
          .zip(&accumulated[..kind.counters_per_record()])
        {
          target.copy_from_slice(bytes_of(total));
        }
      }
    }

    Ok(())
  }
}

impl<D: GPUQueryDevice> Drop for Query<D> {
  fn drop(&mut self) {
    if let Some(heap) = self.query_heap.take() {
      self
        .device
        .defer_deletion(heap, self.last_used_command_list_id);
    }
    if let Some(buffer) = self.result_buffer.take() {
      self
        .device
        .release_readback(buffer, self.last_used_command_list_id);
    }
  }
}
