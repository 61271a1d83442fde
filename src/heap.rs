use core::ptr::{NonNull, null_mut};

use crate::{
  Diagnostics, Fragments, RtsAlloc,
  error::{HeapError, InitError},
  engine::MIN_ARENA_SIZE,
};

/// Region size [`LockedHeap::default`](crate::LockedHeap) maps on first use.
pub const DEFAULT_HEAP_SIZE: usize = 1 << 20; // 1MB

// =============================================================================
// Platform
// =============================================================================

unsafe fn os_mmap(size: usize) -> *mut u8 {
  let ptr = unsafe {
    libc::mmap(
      null_mut(),
      size,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    null_mut()
  } else {
    ptr as *mut u8
  }
}

unsafe fn os_munmap(ptr: *mut u8, size: usize) {
  unsafe { libc::munmap(ptr.cast(), size) };
}

// =============================================================================
// Heap
// =============================================================================

/// An allocator together with the OS region it lives in.
///
/// The region is page aligned, which always satisfies [`ALIGNMENT`](crate::ALIGNMENT).
/// Dropping the heap unmaps the region, invalidating every pointer it handed out.
pub struct Heap {
  region: NonNull<u8>,
  size: usize,
  alloc: NonNull<RtsAlloc>,
}

// The region is owned exclusively; nothing else holds the handle.
unsafe impl Send for Heap {}

impl Heap {
  /// Maps `size` bytes and sets up an allocator over them.
  pub fn new(size: usize) -> Result<Self, HeapError> {
    let heap = Self::map(size).inspect_err(|e| {
      log::warn!("rtsalloc: heap of {size} bytes unavailable: {e}");
    })?;
    log::debug!(
      "rtsalloc: heap {:p} mapped, {} bytes, capacity={}",
      heap.region,
      size,
      heap.capacity()
    );
    Ok(heap)
  }

  /// [`Heap::new`] without logging, for callers that hold an allocator lock.
  pub(crate) fn map(size: usize) -> Result<Self, HeapError> {
    if size < MIN_ARENA_SIZE {
      return Err(
        InitError::TooSmall {
          size,
          min: MIN_ARENA_SIZE,
        }
        .into(),
      );
    }

    let raw = unsafe { os_mmap(size) };
    let Some(region) = NonNull::new(raw) else {
      let source = std::io::Error::last_os_error();
      return Err(HeapError::Map { size, source });
    };

    match unsafe { RtsAlloc::init(region.as_ptr(), size) } {
      Ok(alloc) => Ok(Self {
        region,
        size,
        alloc: NonNull::from(alloc),
      }),
      Err(e) => {
        unsafe { os_munmap(region.as_ptr(), size) };
        Err(e.into())
      }
    }
  }

  #[inline]
  fn engine(&self) -> &RtsAlloc {
    unsafe { self.alloc.as_ref() }
  }

  #[inline]
  fn engine_mut(&mut self) -> &mut RtsAlloc {
    unsafe { self.alloc.as_mut() }
  }

  /// See [`RtsAlloc::allocate`].
  #[inline]
  pub fn allocate(&mut self, amount: usize) -> Option<NonNull<u8>> {
    self.engine_mut().allocate(amount)
  }

  /// See [`RtsAlloc::free`].
  ///
  /// # Safety
  ///
  /// `ptr` must be null or a live allocation of this heap.
  #[inline]
  pub unsafe fn free(&mut self, ptr: *mut u8) {
    unsafe { self.engine_mut().free(ptr) }
  }

  /// # Safety
  ///
  /// `ptr` must be a live allocation of this heap.
  #[inline]
  pub unsafe fn usable_size(&self, ptr: *const u8) -> usize {
    unsafe { self.engine().usable_size(ptr) }
  }

  pub fn contains(&self, ptr: *const u8) -> bool {
    self.engine().contains(ptr)
  }

  pub fn diagnostics(&self) -> Diagnostics {
    self.engine().diagnostics()
  }

  pub fn capacity(&self) -> usize {
    self.engine().capacity()
  }

  pub fn check_heap_corruption(&self) -> bool {
    self.engine().check_heap_corruption()
  }

  pub fn check_fragment_chain(&self) -> bool {
    self.engine().check_fragment_chain()
  }

  pub fn fragments(&self) -> Fragments<'_> {
    self.engine().fragments()
  }

  /// Size of the mapped region, instance record included.
  pub fn region_size(&self) -> usize {
    self.size
  }
}

impl Drop for Heap {
  fn drop(&mut self) {
    let diag = self.diagnostics();
    if diag.allocated != 0 {
      log::debug!(
        "rtsalloc: heap {:p} dropped with {} bytes still allocated",
        self.region,
        diag.allocated
      );
    }
    unsafe { os_munmap(self.region.as_ptr(), self.size) };
  }
}
