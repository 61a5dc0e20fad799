use crate::*;

/// Bookkeeping shared by every deferred result object.
#[derive(Debug, Clone)]
pub struct AsyncState {
  kind: QueryKind,
  /// the command list that holds the most recent end, 0 if never ended
  ended_command_list_id: u64,
}

impl AsyncState {
  pub fn new(kind: QueryKind) -> Self {
    Self {
      kind,
      ended_command_list_id: 0,
    }
  }

  pub fn kind(&self) -> QueryKind {
    self.kind
  }

  pub fn ended_command_list_id(&self) -> u64 {
    self.ended_command_list_id
  }
}

/// An operation whose result is produced by the gpu and read back later.
///
/// Implementors provide the recording of the end and the reading of the data, the
/// provided methods take care of tracking which command list the result depends on and
/// whether the gpu has executed it.
pub trait GPUAsync {
  type Device: GPUQueryDevice;

  fn device(&self) -> &Self::Device;
  fn async_state(&self) -> &AsyncState;
  fn async_state_mut(&mut self) -> &mut AsyncState;

  /// record whatever finalizes the measurement into the open command list
  fn end_internal(&mut self);
  /// fill `data` from the host visible results, only called once the data is ready or
  /// the caller explicitly accepted stale data
  fn get_data_internal(&mut self, data: &mut [u8]) -> Result<(), QueryDataFailure>;

  fn end(&mut self) {
    self.end_internal();
    let id = self.device().command_list_id_with_commands();
    self.async_state_mut().ended_command_list_id = id;
  }

  /// Returns if the data is ready. When it is not, `data` is left untouched.
  ///
  /// `do_not_flush` forbids submitting the open command list when the end is still in
  /// it. With `async_poll` the readiness check is skipped entirely and whatever the
  /// result buffer holds is read. An empty `data` only checks readiness.
  fn get_data(
    &mut self,
    data: &mut [u8],
    do_not_flush: bool,
    async_poll: bool,
  ) -> Result<bool, QueryDataFailure> {
    if !async_poll && !self.flush_and_prep(do_not_flush) {
      return Ok(false);
    }

    if !data.is_empty() {
      self.get_data_internal(data)?;
    }

    Ok(true)
  }

  /// Make sure the command list holding the end is submitted and report if the gpu has
  /// executed it. Submission failure is not fatal for the query and is reported as not
  /// ready, the caller may retry.
  fn flush_and_prep(&self, do_not_flush: bool) -> bool {
    let device = self.device();
    let ended = self.async_state().ended_command_list_id;

    if ended == device.command_list_id() {
      if do_not_flush {
        return false;
      }

      if let Err(err) = device.submit_command_list() {
        log::debug!("submission for query readback failed, report as not ready: {err}");
        return false;
      }
    }

    device.completed_fence_value() >= ended
  }
}

/// end any deferred result object, see [`GPUAsync::end`]
pub fn query_end<Q: GPUAsync + ?Sized>(query: &mut Q) {
  query.end()
}

/// read any deferred result object, see [`GPUAsync::get_data`]
pub fn query_get_data<Q: GPUAsync + ?Sized>(
  query: &mut Q,
  data: &mut [u8],
  do_not_flush: bool,
  async_poll: bool,
) -> Result<bool, QueryDataFailure> {
  query.get_data(data, do_not_flush, async_poll)
}
