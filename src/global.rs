use core::{
  alloc::{GlobalAlloc, Layout},
  cell::{Cell, UnsafeCell},
  hint,
  mem::size_of,
  ptr::{self, NonNull, null_mut},
  sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use crate::{ALIGNMENT, Diagnostics, Heap, HeapError, heap::DEFAULT_HEAP_SIZE};

// =============================================================================
// SpinLock
// =============================================================================

struct SpinLock {
  locked: AtomicBool,
}

impl SpinLock {
  const fn new() -> Self {
    Self {
      locked: AtomicBool::new(false),
    }
  }

  #[inline]
  fn lock(&self) -> SpinLockGuard<'_> {
    while self
      .locked
      .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
      .is_err()
    {
      while self.locked.load(Ordering::Relaxed) {
        hint::spin_loop();
      }
    }
    SpinLockGuard { lock: self }
  }
}

struct SpinLockGuard<'a> {
  lock: &'a SpinLock,
}

impl Drop for SpinLockGuard<'_> {
  #[inline]
  fn drop(&mut self) {
    self.lock.locked.store(false, Ordering::Release);
  }
}

// =============================================================================
// TLS
// =============================================================================

thread_local! {
  static IN_ALLOC: Cell<bool> = const { Cell::new(false) };
}

/// Clears the re-entrancy flag on scope exit, panics included.
struct ReentryGuard;

impl Drop for ReentryGuard {
  fn drop(&mut self) {
    let _ = IN_ALLOC.try_with(|flag| flag.set(false));
  }
}

// =============================================================================
// LockedHeap
// =============================================================================

enum Slot {
  Unmapped,
  Mapped(Heap),
  /// Mapping failed once and is never retried.
  Failed,
}

/// Outcome of the first use, reported after the lock is released.
enum Mapped {
  Ok { capacity: usize },
  Err(HeapError),
}

/// A [`Heap`] behind a spin lock, usable as `#[global_allocator]` or shared
/// between threads.
///
/// The region is mapped on first use; if that fails every later request fails
/// too. Requests made while the same thread is already inside the allocator
/// fail with null instead of deadlocking, and frees made that way are dropped
/// and counted in [`LockedHeap::dropped_frees`]. Nothing is logged while the
/// lock is held, so an allocating logger is safe to install.
///
/// Alignments above [`ALIGNMENT`] are served by over-allocating and storing the
/// fragment pointer in the word right before the aligned address.
pub struct LockedHeap {
  lock: SpinLock,
  size: usize,
  heap: UnsafeCell<Slot>,
  dropped_frees: AtomicUsize,
}

unsafe impl Sync for LockedHeap {}

impl LockedHeap {
  /// A heap that will map `size` bytes on first use.
  pub const fn new(size: usize) -> Self {
    Self {
      lock: SpinLock::new(),
      size,
      heap: UnsafeCell::new(Slot::Unmapped),
      dropped_frees: AtomicUsize::new(0),
    }
  }

  /// Runs `f` on the heap under the lock. `None` when re-entered, when TLS is
  /// gone, or when the heap could not be mapped.
  fn with_heap<R, F: FnOnce(&mut Heap) -> R>(&self, f: F) -> Option<R> {
    // TLS may already be gone during thread exit.
    let Ok(reentered) = IN_ALLOC.try_with(|flag| flag.replace(true)) else {
      return None;
    };
    if reentered {
      return None;
    }

    let (out, mapped) = {
      let _reentry = ReentryGuard;
      let _guard = self.lock.lock();
      let slot = unsafe { &mut *self.heap.get() };

      let mut mapped = None;
      if matches!(slot, Slot::Unmapped) {
        mapped = Some(match Heap::map(self.size) {
          Ok(heap) => {
            let capacity = heap.capacity();
            *slot = Slot::Mapped(heap);
            Mapped::Ok { capacity }
          }
          Err(err) => {
            *slot = Slot::Failed;
            Mapped::Err(err)
          }
        });
      }

      let out = match slot {
        Slot::Mapped(heap) => Some(f(heap)),
        Slot::Unmapped | Slot::Failed => None,
      };
      (out, mapped)
    };

    // Lock and flag are released: a logger that allocates lands back in here.
    match mapped {
      Some(Mapped::Ok { capacity }) => {
        log::debug!("rtsalloc: locked heap mapped, {} bytes, capacity={capacity}", self.size)
      }
      Some(Mapped::Err(err)) => {
        log::warn!("rtsalloc: locked heap of {} bytes unavailable: {err}", self.size)
      }
      None => {}
    }
    out
  }

  /// Counters of the underlying heap, mapping it if needed.
  pub fn diagnostics(&self) -> Option<Diagnostics> {
    self.with_heap(|heap| heap.diagnostics())
  }

  pub fn check_heap_corruption(&self) -> bool {
    self.with_heap(|heap| heap.check_heap_corruption()).unwrap_or(false)
  }

  pub fn check_fragment_chain(&self) -> bool {
    self.with_heap(|heap| heap.check_fragment_chain()).unwrap_or(false)
  }

  /// Whether the first use failed to map the region.
  pub fn mapping_failed(&self) -> bool {
    let _guard = self.lock.lock();
    matches!(unsafe { &*self.heap.get() }, Slot::Failed)
  }

  /// Frees that arrived while the same thread was inside the allocator. Their
  /// fragments stay allocated for the life of the heap.
  pub fn dropped_frees(&self) -> usize {
    self.dropped_frees.load(Ordering::Relaxed)
  }
}

impl Default for LockedHeap {
  fn default() -> Self {
    Self::new(DEFAULT_HEAP_SIZE)
  }
}

/// Whether `new_size` fits a fragment smaller than the one behind `usable` bytes.
#[inline]
fn fits_smaller_fragment(usable: usize, new_size: usize) -> bool {
  new_size.max(1) + ALIGNMENT <= (usable + ALIGNMENT) / 2
}

unsafe impl GlobalAlloc for LockedHeap {
  unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
    let size = layout.size().max(1);

    if layout.align() <= ALIGNMENT {
      return self
        .with_heap(|heap| heap.allocate(size))
        .flatten()
        .map_or(null_mut(), NonNull::as_ptr);
    }

    let Some(padded) = size.checked_add(layout.align()) else {
      return null_mut();
    };
    let Some(raw) = self.with_heap(|heap| heap.allocate(padded)).flatten() else {
      return null_mut();
    };

    // `raw` is ALIGNMENT-aligned, so the gap is at least one word.
    let raw = raw.as_ptr();
    let offset = layout.align() - (raw as usize & (layout.align() - 1));
    debug_assert!(offset >= size_of::<*mut u8>() && offset <= layout.align());
    unsafe {
      let aligned = raw.add(offset);
      (aligned as *mut *mut u8).sub(1).write(raw);
      aligned
    }
  }

  unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
    if ptr.is_null() {
      return;
    }
    let raw = if layout.align() <= ALIGNMENT {
      ptr
    } else {
      unsafe { (ptr as *mut *mut u8).sub(1).read() }
    };
    if self.with_heap(|heap| unsafe { heap.free(raw) }).is_none() {
      self.dropped_frees.fetch_add(1, Ordering::Relaxed);
    }
  }

  unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
    if ptr.is_null() {
      return unsafe {
        self.alloc(Layout::from_size_align_unchecked(
          new_size.max(1),
          layout.align(),
        ))
      };
    }

    if layout.align() <= ALIGNMENT {
      // In place unless the block outgrows its fragment or would fit one half
      // the size. Moves happen under one lock.
      return self
        .with_heap(|heap| unsafe {
          let usable = heap.usable_size(ptr);
          let fits = new_size <= usable;
          if fits && !fits_smaller_fragment(usable, new_size) {
            return NonNull::new(ptr);
          }
          match heap.allocate(new_size) {
            Some(new_ptr) => {
              ptr::copy_nonoverlapping(ptr, new_ptr.as_ptr(), layout.size().min(new_size));
              heap.free(ptr);
              Some(new_ptr)
            }
            // No room to move a shrinking block; it keeps its fragment.
            None if fits => NonNull::new(ptr),
            None => None,
          }
        })
        .flatten()
        .map_or(null_mut(), NonNull::as_ptr);
    }

    let new_ptr =
      unsafe { self.alloc(Layout::from_size_align_unchecked(new_size, layout.align())) };

    if !new_ptr.is_null() {
      unsafe { ptr::copy_nonoverlapping(ptr, new_ptr, layout.size().min(new_size)) };
      unsafe { self.dealloc(ptr, layout) };
    }

    new_ptr
  }

  unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
    let ptr = unsafe { self.alloc(layout) };
    if !ptr.is_null() {
      unsafe { ptr::write_bytes(ptr, 0, layout.size()) }
    }
    ptr
  }
}
