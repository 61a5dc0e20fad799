/// Objects waiting for the gpu timeline to pass their last use.
pub struct DeferredDeletionQueue<T> {
  entries: Vec<(u64, T)>,
}

impl<T> Default for DeferredDeletionQueue<T> {
  fn default() -> Self {
    Self {
      entries: Vec::new(),
    }
  }
}

impl<T> DeferredDeletionQueue<T> {
  pub fn push(&mut self, object: T, last_used_generation: u64) {
    self.entries.push((last_used_generation, object));
  }

  /// remove and return every object whose last use is not newer than `completed_generation`
  ///
  /// the returned order is unspecified.
  pub fn trim(&mut self, completed_generation: u64) -> Vec<T> {
    let mut retired = Vec::new();
    let mut i = 0;
    while i < self.entries.len() {
      if self.entries[i].0 <= completed_generation {
        let (_, object) = self.entries.swap_remove(i);
        retired.push(object);
      } else {
        i += 1;
      }
    }
    retired
  }

  /// used on teardown, when the caller has already waited for the whole timeline
  pub fn drain_all(&mut self) -> impl Iterator<Item = T> + '_ {
    self.entries.drain(..).map(|(_, object)| object)
  }

  pub fn oldest_pending_generation(&self) -> Option<u64> {
    self.entries.iter().map(|(generation, _)| *generation).min()
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }
}
