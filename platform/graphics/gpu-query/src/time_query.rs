use crate::*;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct TimestampPair {
  pub start: u64,
  pub end: u64,
}

impl TimestampPair {
  pub fn duration_in_ms(&self, time_unit_in_nanoseconds: f32) -> f64 {
    let nanoseconds = self.end.saturating_sub(self.start) as f64 * time_unit_in_nanoseconds as f64;
    nanoseconds / 1_000_000.0
  }
}

/// A single gpu timestamp.
pub struct TimestampQuery<D: GPUQueryDevice> {
  query: Query<D>,
}

impl<D: GPUQueryDevice + Clone> TimestampQuery<D> {
  pub fn new(device: &D) -> Result<Self, QueryCreateFailure> {
    let desc = QueryDescriptor::new(QueryKind::Timestamp).with_label("timestamp");
    Ok(Self {
      query: Query::new(device, &desc)?,
    })
  }
}

impl<D: GPUQueryDevice> TimestampQuery<D> {
  /// record the timestamp into the open command list
  pub fn end(&mut self) {
    self.query.end()
  }

  /// `None` if the gpu has not written the timestamp yet
  pub fn try_read(&mut self, do_not_flush: bool) -> Result<Option<u64>, QueryDataFailure> {
    self.query.get_data_as(0_u64, do_not_flush)
  }

  /// submit and wait for the device if the timestamp is not ready yet
  pub fn read_blocking(&mut self) -> Result<u64, QueryDataFailure> {
    if let Some(timestamp) = self.try_read(false)? {
      return Ok(timestamp);
    }
    self.query.device().wait_for_completion()?;
    self
      .try_read(true)?
      .ok_or(QueryDataFailure::NotReadyAfterWait)
  }

  pub fn query(&self) -> &Query<D> {
    &self.query
  }
}

/// Two timestamps bracketing the work recorded between them.
pub struct GPUTimeSpan<D: GPUQueryDevice> {
  start: TimestampQuery<D>,
  end: TimestampQuery<D>,
}

impl<D: GPUQueryDevice + Clone> GPUTimeSpan<D> {
  pub fn new(device: &D) -> Result<Self, QueryCreateFailure> {
    Ok(Self {
      start: TimestampQuery::new(device)?,
      end: TimestampQuery::new(device)?,
    })
  }
}

impl<D: GPUQueryDevice> GPUTimeSpan<D> {
  pub fn start(&mut self) {
    self.start.end()
  }

  pub fn end(&mut self) {
    self.end.end()
  }

  /// `None` until both timestamps are written
  pub fn try_read(&mut self, do_not_flush: bool) -> Result<Option<TimestampPair>, QueryDataFailure> {
    // the end is recorded last, once it is ready the start is as well
    let Some(end) = self.end.try_read(do_not_flush)? else {
      return Ok(None);
    };
    let Some(start) = self.start.try_read(true)? else {
      return Ok(None);
    };
    Ok(Some(TimestampPair { start, end }))
  }

  pub fn read_blocking(&mut self) -> Result<TimestampPair, QueryDataFailure> {
    let end = self.end.read_blocking()?;
    let start = self.start.read_blocking()?;
    Ok(TimestampPair { start, end })
  }
}

/// measure the gpu time of the commands `scope` records into `device`
pub fn measure_gpu_time<D: GPUQueryDevice + Clone>(
  device: &D,
  scope: impl FnOnce(&D),
) -> Result<GPUTimeSpan<D>, QueryCreateFailure> {
  let mut span = GPUTimeSpan::new(device)?;
  span.start();
  scope(device);
  span.end();
  Ok(span)
}
