use std::ops::Range;

use crate::*;

type AllocationHandle = xalloc::tlsf::TlsfRegion<xalloc::arena::sys::Ptr>;

/// every suballocation is placed and sized in units of this, so the memory can always be
/// viewed as u64 counters
const WORD_SIZE: u64 = std::mem::size_of::<u64>() as u64;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SuballocationFailure {
  #[error("zero sized suballocation requested")]
  ZeroSized,
  #[error("suballocation of {requested} bytes exceeds the remaining budget of {remaining} bytes")]
  OutOfBudget { requested: u64, remaining: u64 },
  #[error("suballocation of {0} bytes is larger than a page can address")]
  TooLarge(u64),
  #[error("no page is able to place a suballocation of {0} bytes")]
  NoFittingPage(u64),
}

/// The location of a suballocation, freely copyable so it can be referenced by recorded
/// commands. Ownership stays with [`Suballocation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SuballocationRange {
  pub page: u32,
  /// in bytes, always word aligned
  pub offset: u64,
  /// the requested size in bytes
  pub size: u64,
}

impl SuballocationRange {
  pub fn byte_range(&self) -> Range<usize> {
    self.offset as usize..(self.offset + self.size) as usize
  }

  fn reserved_bytes(&self) -> u64 {
    self.size.div_ceil(WORD_SIZE) * WORD_SIZE
  }
}

/// Exclusive ownership of a range inside a [`GenerationSuballocator`].
///
/// Not clonable, the only way to give it back is [`GenerationSuballocator::release`].
#[derive(Debug, PartialEq, Eq)]
pub struct Suballocation {
  key: usize,
  range: SuballocationRange,
}

impl Suballocation {
  pub fn range(&self) -> SuballocationRange {
    self.range
  }

  pub fn size(&self) -> u64 {
    self.range.size
  }
}

struct HostHeapPage {
  allocator: xalloc::SysTlsf<u32>,
  memory: Vec<u64>,
}

impl HostHeapPage {
  fn new(words: u32) -> Self {
    Self {
      allocator: xalloc::SysTlsf::new(words),
      memory: vec![0; words as usize],
    }
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SuballocatorStatistics {
  pub live_allocations: usize,
  /// released but still waiting for their generation to complete
  pub retiring_allocations: usize,
  pub page_count: usize,
  /// bytes held by live and retiring allocations
  pub reserved_bytes: u64,
}

/// A growable pool of host visible pages handing out small word aligned ranges.
///
/// Released ranges are tagged with the generation that last wrote them and are only
/// returned to the free lists by [`GenerationSuballocator::reclaim`] once that generation
/// is known to be complete, so the memory can never be handed out again while the gpu
/// may still write into it.
pub struct GenerationSuballocator {
  page_size: u64,
  budget: Option<u64>,
  pages: Vec<HostHeapPage>,
  live: slab::Slab<(u32, AllocationHandle)>,
  retiring: DeferredDeletionQueue<Suballocation>,
  reserved_bytes: u64,
}

impl GenerationSuballocator {
  pub fn new(page_size: u64) -> Self {
    assert!(page_size >= WORD_SIZE);
    Self {
      page_size,
      budget: None,
      pages: Vec::new(),
      live: Default::default(),
      retiring: Default::default(),
      reserved_bytes: 0,
    }
  }

  /// limit the total bytes that may be reserved at the same time, including retiring ones
  pub fn with_budget(mut self, budget: u64) -> Self {
    self.budget = Some(budget);
    self
  }

  /// the returned memory is zeroed
  pub fn acquire(&mut self, size: u64) -> Result<Suballocation, SuballocationFailure> {
    if size == 0 {
      return Err(SuballocationFailure::ZeroSized);
    }

    let words = size.div_ceil(WORD_SIZE);
    let reserved = words * WORD_SIZE;
    if let Some(budget) = self.budget {
      let remaining = budget.saturating_sub(self.reserved_bytes);
      if reserved > remaining {
        return Err(SuballocationFailure::OutOfBudget {
          requested: size,
          remaining,
        });
      }
    }
    let words = u32::try_from(words).map_err(|_| SuballocationFailure::TooLarge(size))?;

    let found = self
      .pages
      .iter_mut()
      .enumerate()
      .find_map(|(index, page)| {
        page
          .allocator
          .alloc(words)
          .map(|(handle, offset)| (index, handle, offset))
      });

    let (page, handle, offset) = match found {
      Some(found) => found,
      None => {
        // the tlsf size classes round up, so an exactly sized page may not satisfy the request
        let page_words = (self.page_size / WORD_SIZE).max(words as u64 * 2);
        let page_words =
          u32::try_from(page_words).map_err(|_| SuballocationFailure::TooLarge(size))?;
        let mut page = HostHeapPage::new(page_words);
        let (handle, offset) = page
          .allocator
          .alloc(words)
          .ok_or(SuballocationFailure::NoFittingPage(size))?;
        self.pages.push(page);
        log::debug!(
          "suballocator grows to {} pages ({} bytes added)",
          self.pages.len(),
          page_words as u64 * WORD_SIZE
        );
        (self.pages.len() - 1, handle, offset)
      }
    };

    let page = page as u32;
    let key = self.live.insert((page, handle));
    let range = SuballocationRange {
      page,
      offset: offset as u64 * WORD_SIZE,
      size,
    };
    self.reserved_bytes += reserved;
    self.memory_mut(range).fill(0);

    Ok(Suballocation { key, range })
  }

  /// the range is not reused until [`Self::reclaim`] observes `last_used_generation` completed
  pub fn release(&mut self, allocation: Suballocation, last_used_generation: u64) {
    log::trace!(
      "suballocation {:?} retires after generation {}",
      allocation.range,
      last_used_generation
    );
    self.retiring.push(allocation, last_used_generation);
  }

  /// return the count of ranges given back to the free lists
  pub fn reclaim(&mut self, completed_generation: u64) -> usize {
    let retired = self.retiring.trim(completed_generation);
    let count = retired.len();
    for allocation in retired {
      self.free(allocation);
    }
    count
  }

  fn free(&mut self, allocation: Suballocation) {
    let (page, handle) = self.live.remove(allocation.key);
    if self.pages[page as usize].allocator.dealloc(handle).is_err() {
      log::error!(
        "suballocator page {} rejected the release of {:?}, this is a bug",
        page,
        allocation.range
      );
    }
    self.reserved_bytes -= allocation.range.reserved_bytes();
  }

  pub fn memory(&self, range: SuballocationRange) -> &[u8] {
    let page = &self.pages[range.page as usize];
    &bytemuck::cast_slice::<u64, u8>(&page.memory)[range.byte_range()]
  }

  pub fn memory_mut(&mut self, range: SuballocationRange) -> &mut [u8] {
    let page = &mut self.pages[range.page as usize];
    &mut bytemuck::cast_slice_mut::<u64, u8>(&mut page.memory)[range.byte_range()]
  }

  pub fn statistics(&self) -> SuballocatorStatistics {
    SuballocatorStatistics {
      live_allocations: self.live.len() - self.retiring.len(),
      retiring_allocations: self.retiring.len(),
      page_count: self.pages.len(),
      reserved_bytes: self.reserved_bytes,
    }
  }
}
