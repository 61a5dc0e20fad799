use crate::*;

fn timestamp_query(device: &SimulatedDevice) -> Query<SimulatedDevice> {
  Query::new(device, &QueryDescriptor::new(QueryKind::Timestamp)).unwrap()
}

fn immediate_device() -> SimulatedDevice {
  SimulatedDevice::new(SimulatedDeviceConfig::default().with_complete_on_submit(true))
}

fn read_u64(data: &[u8]) -> u64 {
  bytemuck::pod_read_unaligned(&data[..8])
}

#[test]
fn timestamp_reads_back_after_fence() {
  let device = SimulatedDevice::default();
  let mut query = timestamp_query(&device);

  query.end();
  assert_eq!(query.async_state().ended_command_list_id(), 1);
  assert_eq!(query.current_instance(), 1);

  device.submit_command_list().unwrap();
  device.complete_through(1);

  let mut data = [0_u8; 8];
  assert_eq!(query.get_data(&mut data, false, false), Ok(true));
  assert_eq!(read_u64(&data), 1_000);
}

#[test]
fn do_not_flush_before_completion_is_not_ready() {
  let device = SimulatedDevice::default();
  let mut query = timestamp_query(&device);
  query.end();

  let mut data = [0xab_u8; 8];
  assert_eq!(query.get_data(&mut data, true, false), Ok(false));
  assert_eq!(data, [0xab; 8]);
  assert_eq!(device.statistics().submitted_command_lists, 0);

  // submitted but not executed yet
  device.submit_command_list().unwrap();
  assert_eq!(query.get_data(&mut data, true, false), Ok(false));
  assert_eq!(data, [0xab; 8]);

  device.complete_all_submitted();
  assert_eq!(query.get_data(&mut data, true, false), Ok(true));
  assert_eq!(read_u64(&data), 1_000);
}

#[test]
fn get_data_submits_the_open_command_list() {
  let device = SimulatedDevice::default();
  let mut query = timestamp_query(&device);
  query.end();

  let mut data = [0_u8; 8];
  assert_eq!(query.get_data(&mut data, false, false), Ok(false));
  assert_eq!(device.statistics().submitted_command_lists, 1);
  assert_eq!(device.in_flight_command_lists(), 1);

  // already submitted, no further flush is needed
  assert_eq!(query.get_data(&mut data, false, false), Ok(false));
  assert_eq!(device.statistics().submitted_command_lists, 1);

  device.complete_all_submitted();
  assert_eq!(query.get_data(&mut data, true, false), Ok(true));
  assert_eq!(read_u64(&data), 1_000);
}

#[test]
fn submission_failure_is_reported_as_not_ready() {
  let device = immediate_device();
  let mut query = timestamp_query(&device);
  query.end();

  device.inject_submission_failure(GPUDeviceError::OutOfMemory);
  let mut data = [0_u8; 8];
  assert_eq!(query.get_data(&mut data, false, false), Ok(false));
  assert_eq!(device.statistics().submitted_command_lists, 0);

  // the query stays usable, the retry submits
  assert_eq!(query.get_data(&mut data, false, false), Ok(true));
  assert_eq!(read_u64(&data), 1_000);
}

#[test]
fn timestamp_merges_with_caller_seed_by_max() {
  let device = immediate_device();
  let mut query = timestamp_query(&device);
  query.end();

  let seeded = 5_000_u64;
  let mut data = seeded.to_ne_bytes();
  assert_eq!(query.get_data(&mut data, false, false), Ok(true));
  assert_eq!(read_u64(&data), seeded);
  assert_eq!(query.get_data(&mut data, false, false), Ok(true));
  assert_eq!(read_u64(&data), seeded);

  assert_eq!(query.get_data_as(10_u64, false), Ok(Some(1_000)));
}

#[test]
fn timestamp_can_be_ended_again() {
  let device = immediate_device();
  let mut query = timestamp_query(&device);

  query.end();
  assert_eq!(query.get_data_as(0_u64, false), Ok(Some(1_000)));

  query.end();
  assert_eq!(query.current_instance(), 1);
  assert_eq!(query.async_state().ended_command_list_id(), 2);
  assert_eq!(query.get_data_as(0_u64, false), Ok(Some(1_016)));
}

#[test]
fn small_destination_is_invalid_argument() {
  let device = immediate_device();
  let mut query = timestamp_query(&device);
  query.end();

  let mut data = [0x11_u8; 4];
  assert_eq!(
    query.get_data(&mut data, false, false),
    Err(QueryDataFailure::DestinationTooSmall {
      kind: QueryKind::Timestamp,
      required: 8,
      provided: 4,
    })
  );
  assert_eq!(data, [0x11; 4]);

  let mut statistics = Query::new(
    &device,
    &QueryDescriptor::new(QueryKind::PipelineStatistics),
  )
  .unwrap();
  statistics.begin().unwrap();
  statistics.end();
  let mut data = [0_u8; 16];
  assert!(matches!(
    statistics.get_data(&mut data, false, false),
    Err(QueryDataFailure::DestinationTooSmall { required: 88, .. })
  ));
}

#[test]
fn empty_destination_only_checks_readiness() {
  let device = immediate_device();
  let mut query = timestamp_query(&device);
  query.end();

  assert_eq!(query.get_data(&mut [], false, false), Ok(true));
  assert_eq!(device.statistics().readback_maps, 0);
}

#[test]
fn exhausting_instances_accumulates_once() {
  let device = SimulatedDevice::default();
  let mut query = Query::new(&device, &QueryDescriptor::new(QueryKind::Occlusion)).unwrap();
  assert_eq!(query.instances_per_query(), 4);

  query.begin().unwrap();
  for _ in 0..query.instances_per_query() {
    query.suspend();
    query.resume().unwrap();
  }
  query.end();

  let statistics = device.statistics();
  assert_eq!(statistics.blocking_waits, 1);
  // only instance 0 is written back by the accumulation
  assert_eq!(statistics.last_unmap_written_range, Some(0..8));

  let mut data = [0_u8; 8];
  assert_eq!(query.get_data(&mut data, false, false), Ok(false));
  device.complete_all_submitted();
  assert_eq!(query.get_data(&mut data, true, false), Ok(true));

  let records = device.take_resolved_records();
  assert_eq!(records.len(), 5);
  let expected: u64 = records.iter().map(|record| record.counters[0]).sum();
  assert_eq!(expected, 100 + 110 + 120 + 130 + 140);
  assert_eq!(read_u64(&data), expected);
  assert_eq!(device.statistics().blocking_waits, 1);
  assert_eq!(device.statistics().last_unmap_written_range, Some(0..0));
}

#[test]
fn repeated_exhaustion_keeps_running_total() {
  let device = SimulatedDevice::default();
  let desc = QueryDescriptor::new(QueryKind::Occlusion).with_instances_per_query(2);
  let mut query = Query::new(&device, &desc).unwrap();

  query.begin().unwrap();
  for _ in 0..3 {
    query.suspend();
    query.resume().unwrap();
    assert_eq!(query.current_instance(), 1);
  }
  query.end();
  assert_eq!(device.statistics().blocking_waits, 2);

  device.submit_command_list().unwrap();
  device.complete_all_submitted();
  assert_eq!(query.get_data_as(0_u64, true), Ok(Some(100 + 110 + 120 + 130)));
}

#[test]
fn counters_are_summed_per_position() {
  let device = immediate_device();

  let mut statistics = Query::new(
    &device,
    &QueryDescriptor::new(QueryKind::PipelineStatistics),
  )
  .unwrap();
  statistics.begin().unwrap();
  statistics.suspend();
  statistics.resume().unwrap();
  statistics.end();

  let result = statistics
    .get_data_as(PipelineStatistics::zeroed(), false)
    .unwrap()
    .unwrap();
  assert_eq!(result.input_assembler_vertices, 100 + 110);
  assert_eq!(result.vertex_shader_invocations, 3 * (100 + 110));
  assert_eq!(result.compute_shader_invocations, 11 * (100 + 110));

  // the four streams fold into one record
  let mut stream_output = Query::new(
    &device,
    &QueryDescriptor::new(QueryKind::StreamOutputStatistics),
  )
  .unwrap();
  stream_output.begin().unwrap();
  stream_output.end();

  let result = stream_output
    .get_data_as(StreamOutputStatistics::zeroed(), false)
    .unwrap()
    .unwrap();
  let samples = 120 + 130 + 140 + 150;
  assert_eq!(result.primitives_written, samples);
  assert_eq!(result.primitives_storage_needed, 2 * samples);
}

#[test]
fn async_poll_reads_without_flushing() {
  let device = SimulatedDevice::default();
  let mut query = Query::new(&device, &QueryDescriptor::new(QueryKind::Occlusion)).unwrap();
  query.begin().unwrap();
  query.end();

  let mut data = [0xff_u8; 8];
  assert_eq!(query.get_data(&mut data, false, true), Ok(true));
  // nothing executed yet, the buffer still holds its initial content
  assert_eq!(read_u64(&data), 0);
  assert_eq!(device.statistics().submitted_command_lists, 0);
}

#[test]
fn never_ended_query_reads_floor_value() {
  let device = SimulatedDevice::default();

  let mut occlusion = Query::new(&device, &QueryDescriptor::new(QueryKind::Occlusion)).unwrap();
  let mut data = [0xff_u8; 8];
  assert_eq!(occlusion.get_data(&mut data, true, false), Ok(true));
  assert_eq!(read_u64(&data), 0);

  let mut timestamp = timestamp_query(&device);
  assert_eq!(timestamp.get_data_as(42_u64, true), Ok(Some(42)));
}

#[test]
fn end_tracks_the_command_list_that_holds_it() {
  let device =
    SimulatedDevice::new(SimulatedDeviceConfig::default().with_auto_submit_threshold(1));
  let mut query = timestamp_query(&device);

  query.end();
  // the end was submitted by the device right away, the open list is a new empty one
  assert_eq!(device.command_list_id(), 2);
  assert_eq!(query.async_state().ended_command_list_id(), 1);

  let mut data = [0_u8; 8];
  assert_eq!(query.get_data(&mut data, true, false), Ok(false));
  device.complete_through(1);
  assert_eq!(query.get_data(&mut data, true, false), Ok(true));
  assert_eq!(read_u64(&data), 1_000);
  assert_eq!(device.statistics().submitted_command_lists, 1);
}

#[test]
fn dropped_query_holds_memory_until_generation_completes() {
  let device = SimulatedDevice::new(SimulatedDeviceConfig::default().with_readback_budget(8));
  let mut query = timestamp_query(&device);
  query.end();
  device.submit_command_list().unwrap();
  assert_eq!(query.last_used_command_list_id(), 1);
  drop(query);

  let stat = device.readback_statistics();
  assert_eq!(stat.live_allocations, 0);
  assert_eq!(stat.retiring_allocations, 1);
  assert_eq!(device.live_query_heap_count(), 1);
  assert_eq!(device.pending_heap_deletions(), 1);

  // the only memory is still owned by the gpu timeline
  assert!(matches!(
    Query::new(&device, &QueryDescriptor::new(QueryKind::Timestamp)),
    Err(QueryCreateFailure::ResultBufferAcquireFailed(
      GPUDeviceError::OutOfMemory
    ))
  ));
  // the heap of the failed query was never used and is gone already
  assert_eq!(device.live_query_heap_count(), 1);

  device.complete_through(1);
  assert_eq!(device.readback_statistics().retiring_allocations, 0);
  assert_eq!(device.live_query_heap_count(), 0);
  assert_eq!(device.pending_heap_deletions(), 0);
  // the resolve still landed in the retiring memory before it was reclaimed
  assert_eq!(device.take_resolved_records().len(), 1);

  assert!(Query::new(&device, &QueryDescriptor::new(QueryKind::Timestamp)).is_ok());
}

#[test]
fn construction_failures() {
  let device = SimulatedDevice::default();

  device.inject_query_heap_failure(GPUDeviceError::DeviceLost);
  assert!(matches!(
    Query::new(&device, &QueryDescriptor::new(QueryKind::Timestamp)),
    Err(QueryCreateFailure::QueryHeapCreationFailed(
      GPUDeviceError::DeviceLost
    ))
  ));
  assert_eq!(device.live_query_heap_count(), 0);
  assert_eq!(device.readback_statistics().live_allocations, 0);

  let desc = QueryDescriptor::new(QueryKind::Timestamp).with_instances_per_query(2);
  assert_eq!(
    Query::new(&device, &desc).err(),
    Some(QueryCreateFailure::InvalidInstanceCount {
      kind: QueryKind::Timestamp,
      requested: 2,
    })
  );

  let desc = QueryDescriptor::new(QueryKind::Occlusion).with_instances_per_query(1);
  assert!(matches!(
    Query::new(&device, &desc),
    Err(QueryCreateFailure::InvalidInstanceCount { .. })
  ));
}

#[test]
fn timestamp_has_no_begin() {
  let device = SimulatedDevice::default();
  let mut query = timestamp_query(&device);
  assert_eq!(
    query.begin(),
    Err(QueryDataFailure::BeginNotSupported(QueryKind::Timestamp))
  );
  assert_eq!(
    query.resume(),
    Err(QueryDataFailure::BeginNotSupported(QueryKind::Timestamp))
  );
}

#[test]
fn dispatch_through_trait_object() {
  let device = immediate_device();
  let mut query = timestamp_query(&device);
  let query: &mut dyn GPUAsync<Device = SimulatedDevice> = &mut query;

  query_end(&mut *query);
  let mut data = [0_u8; 8];
  assert_eq!(query_get_data(query, &mut data, false, false), Ok(true));
  assert_eq!(read_u64(&data), 1_000);
}

#[test]
fn measure_time_span() {
  let device = immediate_device();
  let mut span = measure_gpu_time(&device, |_| {}).unwrap();

  let pair = span.read_blocking().unwrap();
  assert_eq!(pair, TimestampPair { start: 1_000, end: 1_016 });
  let ms = pair.duration_in_ms(device.timestamp_period());
  assert!((ms - 16. / 1_000_000.).abs() < 1e-12);

  assert_eq!(span.try_read(true), Ok(Some(pair)));
}

#[test]
fn timestamp_query_blocking_read() {
  let device = SimulatedDevice::default();
  let mut timestamp = TimestampQuery::new(&device).unwrap();
  timestamp.end();

  assert_eq!(timestamp.try_read(true), Ok(None));
  assert_eq!(timestamp.read_blocking(), Ok(1_000));
  assert_eq!(device.statistics().blocking_waits, 1);
}

#[test]
fn simulated_command_list_ids() {
  let device = SimulatedDevice::default();
  assert_eq!(device.command_list_id(), 1);
  assert_eq!(device.command_list_id_with_commands(), 0);

  // nothing recorded, submitting is a no-op
  device.submit_command_list().unwrap();
  assert_eq!(device.command_list_id(), 1);

  let mut query = timestamp_query(&device);
  query.end();
  assert_eq!(device.command_list_id_with_commands(), 1);
  device.submit_command_list().unwrap();
  assert_eq!(device.command_list_id(), 2);
  assert_eq!(device.command_list_id_with_commands(), 1);
  assert_eq!(device.completed_fence_value(), 0);
  device.complete_through(1);
  assert_eq!(device.completed_fence_value(), 1);
}

#[test]
fn repeated_end_replaces_the_measurement() {
  let device = immediate_device();
  let desc = QueryDescriptor::new(QueryKind::Occlusion).with_instances_per_query(2);
  let mut query = Query::new(&device, &desc).unwrap();

  query.begin().unwrap();
  query.end();
  assert_eq!(query.get_data_as(0_u64, false), Ok(Some(100)));

  // more ends than instances, each without a begin
  for expected in [110, 120, 130] {
    query.end();
    assert_eq!(query.current_instance(), 1);
    assert_eq!(query.get_data_as(0_u64, false), Ok(Some(expected)));
  }

  // a begin after all that starts over as well
  query.begin().unwrap();
  query.suspend();
  query.resume().unwrap();
  query.end();
  assert_eq!(query.current_instance(), 2);
  assert_eq!(query.get_data_as(0_u64, false), Ok(Some(140 + 150)));
}

#[test]
fn slot_count_overflow_is_rejected() {
  let device = SimulatedDevice::default();
  let desc =
    QueryDescriptor::new(QueryKind::StreamOutputStatistics).with_instances_per_query(u32::MAX / 2);
  assert_eq!(
    Query::new(&device, &desc).err(),
    Some(QueryCreateFailure::InvalidInstanceCount {
      kind: QueryKind::StreamOutputStatistics,
      requested: u32::MAX / 2,
    })
  );
  assert_eq!(device.live_query_heap_count(), 0);
}

#[test]
fn resolved_record_log_is_bounded_and_drained() {
  let device = SimulatedDevice::new(
    SimulatedDeviceConfig::default()
      .with_complete_on_submit(true)
      .with_resolved_record_capacity(2),
  );
  let mut query = timestamp_query(&device);
  for _ in 0..3 {
    query.end();
    device.submit_command_list().unwrap();
  }

  assert_eq!(device.statistics().resolved_record_count, 3);
  let records = device.take_resolved_records();
  let values: Vec<u64> = records.iter().map(|record| record.counters[0]).collect();
  assert_eq!(values, vec![1_016, 1_032]);
  assert!(device.take_resolved_records().is_empty());
  assert_eq!(device.statistics().resolved_record_count, 3);
}

#[test]
fn failed_wait_during_resume_keeps_the_instance() {
  let device = SimulatedDevice::default();
  let desc = QueryDescriptor::new(QueryKind::Occlusion).with_instances_per_query(2);
  let mut query = Query::new(&device, &desc).unwrap();

  query.begin().unwrap();
  query.suspend();
  query.resume().unwrap();
  query.suspend();
  assert_eq!(query.current_instance(), 1);

  device.inject_submission_failure(GPUDeviceError::DeviceLost);
  assert_eq!(
    query.resume(),
    Err(QueryDataFailure::Device(GPUDeviceError::DeviceLost))
  );
  assert_eq!(query.current_instance(), 1);
  assert_eq!(device.statistics().blocking_waits, 0);

  // the retry accumulates what the failed attempt could not
  query.resume().unwrap();
  assert_eq!(query.current_instance(), 1);
  query.end();
  device.submit_command_list().unwrap();
  device.complete_all_submitted();
  assert_eq!(query.get_data_as(0_u64, true), Ok(Some(100 + 110 + 120)));
}

#[test]
fn failed_map_leaves_destination_untouched() {
  let device = immediate_device();
  let mut query = Query::new(&device, &QueryDescriptor::new(QueryKind::Occlusion)).unwrap();
  query.begin().unwrap();
  query.end();
  device.submit_command_list().unwrap();

  device.inject_map_failure(GPUDeviceError::DeviceLost);
  let mut data = [0xab_u8; 8];
  assert_eq!(
    query.get_data(&mut data, true, false),
    Err(QueryDataFailure::Device(GPUDeviceError::DeviceLost))
  );
  assert_eq!(data, [0xab; 8]);

  assert_eq!(query.get_data(&mut data, true, false), Ok(true));
  assert_eq!(read_u64(&data), 100);
}
