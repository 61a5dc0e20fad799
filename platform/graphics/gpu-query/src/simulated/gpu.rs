use generation_heap::SuballocationRange;

use super::SimulatedDeviceInner;

use crate::*;

pub(super) enum SimulatedCommand {
  BeginQuery {
    heap: usize,
    ty: QueryType,
    index: u32,
  },
  EndQuery {
    heap: usize,
    ty: QueryType,
    index: u32,
  },
  ResolveQuery {
    heap: usize,
    ty: QueryType,
    start_index: u32,
    count: u32,
    destination: SuballocationRange,
    destination_offset: u64,
  },
}

pub(super) struct SubmittedCommandList {
  pub id: u64,
  pub commands: Vec<SimulatedCommand>,
}

/// device side storage of one query heap
pub(super) struct SimulatedQueryHeapStorage {
  pub ty: QueryHeapType,
  pub counters_per_slot: usize,
  pub records: Vec<u64>,
  pub begun: Vec<bool>,
}

impl SimulatedQueryHeapStorage {
  pub fn new(ty: QueryHeapType, count: u32, counters_per_slot: usize) -> Self {
    Self {
      ty,
      counters_per_slot,
      records: vec![0; count as usize * counters_per_slot],
      begun: vec![false; count as usize],
    }
  }

  fn slot(&self, index: u32) -> std::ops::Range<usize> {
    let start = index as usize * self.counters_per_slot;
    start..start + self.counters_per_slot
  }
}

/// A query value written back to host memory, kept for inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRecord {
  pub ty: QueryType,
  pub index: u32,
  pub counters: SmallVec<[u64; QUERY_ACCUMULATOR_CAPACITY]>,
}

impl SimulatedDeviceInner {
  pub(super) fn execute(&mut self, list: SubmittedCommandList) {
    log::trace!(
      "simulated gpu executes command list {} ({} commands)",
      list.id,
      list.commands.len()
    );
    for command in list.commands {
      match command {
        SimulatedCommand::BeginQuery { heap, ty, index } => {
          let Some(storage) = self.query_heaps.get_mut(heap) else {
            log::error!("begin query on a destroyed query heap {heap}");
            continue;
          };
          debug_assert_eq!(storage.ty, ty.heap_type());
          storage.begun[index as usize] = true;
        }
        SimulatedCommand::EndQuery { heap, ty, index } => {
          let values = self.produce_measurement(ty);
          let Some(storage) = self.query_heaps.get_mut(heap) else {
            log::error!("end query on a destroyed query heap {heap}");
            continue;
          };
          if ty != QueryType::Timestamp && !storage.begun[index as usize] {
            log::warn!("query {ty:?} at slot {index} ended without begin");
          }
          storage.begun[index as usize] = false;
          let slot = storage.slot(index);
          storage.records[slot].copy_from_slice(&values);
        }
        SimulatedCommand::ResolveQuery {
          heap,
          ty,
          start_index,
          count,
          destination,
          destination_offset,
        } => {
          let Some(storage) = self.query_heaps.get(heap) else {
            log::error!("resolve query on a destroyed query heap {heap}");
            continue;
          };
          let first = storage.slot(start_index).start;
          let last = storage.slot(start_index + count - 1).end;
          let values: SmallVec<[u64; QUERY_ACCUMULATOR_CAPACITY]> =
            storage.records[first..last].iter().copied().collect();
          let counters_per_slot = storage.counters_per_slot;

          let memory = self.readback.memory_mut(destination);
          let offset = destination_offset as usize;
          let bytes: &[u8] = bytemuck::cast_slice(values.as_slice());
          memory[offset..offset + bytes.len()].copy_from_slice(bytes);

          for (i, record) in values.chunks_exact(counters_per_slot).enumerate() {
            self.push_resolved_record(ResolvedRecord {
              ty,
              index: start_index + i as u32,
              counters: record.iter().copied().collect(),
            });
          }
        }
      }
    }
  }

  fn push_resolved_record(&mut self, record: ResolvedRecord) {
    self.statistics.resolved_record_count += 1;
    let capacity = self.config.resolved_record_capacity;
    if capacity == 0 {
      return;
    }
    if self.resolved_records.len() == capacity {
      self.resolved_records.pop_front();
    }
    self.resolved_records.push_back(record);
  }

  fn produce_measurement(&mut self, ty: QueryType) -> SmallVec<[u64; QUERY_ACCUMULATOR_CAPACITY]> {
    if ty == QueryType::Timestamp {
      let timestamp = self.next_timestamp;
      self.next_timestamp += self.config.timestamp_step;
      return smallvec::smallvec![timestamp];
    }

    let sample = self.next_sample;
    self.next_sample += self.config.counter_step;
    (0..ty.counter_count())
      .map(|counter| sample * (counter as u64 + 1))
      .collect()
  }
}
