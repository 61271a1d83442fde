use core::{
  marker::PhantomData,
  mem::size_of,
  ptr::{NonNull, null_mut},
};

use crate::{
  bits::{log2_ceil, log2_floor, lowest_set_bit, pow2, round_up_to_power_of_2},
  error::InitError,
};

// =============================================================================
// Constants
// =============================================================================

/// Alignment of the arena, of every fragment and of every returned pointer.
///
/// Doubles as the per-fragment header reservation: the user pointer sits exactly
/// `ALIGNMENT` bytes past its fragment header.
pub const ALIGNMENT: usize = size_of::<*const u8>() * 4;

/// Smallest fragment, header included. Every fragment size is a multiple of it.
pub const FRAGMENT_SIZE_MIN: usize = ALIGNMENT * 2;

/// Largest fragment the bin index can describe.
pub const FRAGMENT_SIZE_MAX: usize = (usize::MAX >> 1) + 1;

/// One bin per bit of the bitmask.
pub const NUM_BINS_MAX: usize = usize::BITS as usize;

/// Footprint of the instance record at the start of the arena.
pub const INSTANCE_SIZE_PADDED: usize = align_up(size_of::<RtsAlloc>(), ALIGNMENT);

/// Smallest buffer `RtsAlloc::init` accepts.
pub const MIN_ARENA_SIZE: usize = INSTANCE_SIZE_PADDED + FRAGMENT_SIZE_MIN;

// =============================================================================
// Compile-Time Assertions
// =============================================================================

const _: () = assert!(ALIGNMENT.is_power_of_two());
const _: () = assert!(FRAGMENT_SIZE_MIN.is_power_of_two());
const _: () = assert!(FRAGMENT_SIZE_MAX.is_power_of_two());
const _: () = assert!(size_of::<FragmentHeader>() <= ALIGNMENT);
const _: () = assert!(size_of::<Fragment>() <= FRAGMENT_SIZE_MIN);
const _: () = assert!(INSTANCE_SIZE_PADDED >= size_of::<RtsAlloc>());
const _: () = assert!(INSTANCE_SIZE_PADDED % ALIGNMENT == 0);

// =============================================================================
// Types
// =============================================================================

/// Chain links and state, valid for every fragment. Fits in one `ALIGNMENT` unit.
#[repr(C)]
struct FragmentHeader {
  /// Next fragment by address. Null on the last one.
  next: *mut Fragment,
  /// Previous fragment by address. Null on the first one.
  prev: *mut Fragment,
  /// Whole fragment size including this header.
  size: usize,
  used: bool,
}

/// A fragment. The free-list links overlap user data, so they only mean
/// something while the fragment is free and binned.
#[repr(C)]
struct Fragment {
  header: FragmentHeader,
  /// Null == bin tail.
  next_free: *mut Fragment,
  /// Null == bin head.
  prev_free: *mut Fragment,
}

/// Usage counters kept in the instance record.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct Diagnostics {
  /// Usable bytes after the instance record, a multiple of `FRAGMENT_SIZE_MIN`.
  pub capacity: usize,
  /// Bytes in used fragments, headers included.
  pub allocated: usize,
  /// Watermark of `allocated`.
  pub peak_allocated: usize,
  /// Largest `amount` ever requested, successful or not.
  pub peak_request_size: usize,
  /// Non-zero requests that found no large enough fragment.
  pub oom_count: u64,
}

/// The allocator instance. Lives at offset 0 of the arena it manages.
///
/// Single-threaded: callers serialize access (see [`LockedHeap`](crate::LockedHeap)).
#[repr(C)]
pub struct RtsAlloc {
  bins: [*mut Fragment; NUM_BINS_MAX],
  /// Bit `i` set iff `bins[i]` is non-null.
  nonempty_bin_mask: usize,
  /// Head of the address-ordered chain. Never merged away, only grows.
  first: *mut Fragment,
  diagnostics: Diagnostics,
}

/// Snapshot of one fragment, as yielded by [`RtsAlloc::fragments`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct FragmentInfo {
  /// Byte offset from the first fragment.
  pub offset: usize,
  /// Fragment size, header unit included.
  pub size: usize,
  /// Whether the fragment is handed out.
  pub used: bool,
}

// =============================================================================
// Init
// =============================================================================

impl RtsAlloc {
  /// Sets up an allocator over `size` bytes at `base`.
  ///
  /// `base` must be aligned to [`ALIGNMENT`] and `size` must be at least
  /// [`MIN_ARENA_SIZE`]. Capacity is whatever remains after the instance record,
  /// capped at [`FRAGMENT_SIZE_MAX`] and rounded down to [`FRAGMENT_SIZE_MIN`].
  ///
  /// # Safety
  ///
  /// `base..base + size` must be valid for reads and writes for `'a`, and must not be
  /// accessed by anything but the returned handle (and the pointers it hands out)
  /// for that long.
  pub unsafe fn init<'a>(base: *mut u8, size: usize) -> Result<&'a mut RtsAlloc, InitError> {
    if base.is_null() {
      return Err(InitError::NullBase);
    }
    if base as usize % ALIGNMENT != 0 {
      return Err(InitError::Misaligned {
        addr: base as usize,
        align: ALIGNMENT,
      });
    }
    if size < MIN_ARENA_SIZE {
      return Err(InitError::TooSmall {
        size,
        min: MIN_ARENA_SIZE,
      });
    }

    let capacity = (size - INSTANCE_SIZE_PADDED).min(FRAGMENT_SIZE_MAX) & !(FRAGMENT_SIZE_MIN - 1);
    debug_assert!((FRAGMENT_SIZE_MIN..=FRAGMENT_SIZE_MAX).contains(&capacity));

    let frag = unsafe { base.add(INSTANCE_SIZE_PADDED) } as *mut Fragment;
    debug_assert!(frag as usize % ALIGNMENT == 0);
    unsafe {
      frag.write(Fragment {
        header: FragmentHeader {
          next: null_mut(),
          prev: null_mut(),
          size: capacity,
          used: false,
        },
        next_free: null_mut(),
        prev_free: null_mut(),
      });
    }

    let out = base as *mut RtsAlloc;
    unsafe {
      out.write(RtsAlloc {
        bins: [null_mut(); NUM_BINS_MAX],
        nonempty_bin_mask: 0,
        first: frag,
        diagnostics: Diagnostics {
          capacity,
          ..Diagnostics::default()
        },
      });
    }

    let handle = unsafe { &mut *out };
    unsafe { handle.rebin(frag) };
    debug_assert!(handle.nonempty_bin_mask != 0);
    Ok(handle)
  }
}

// =============================================================================
// Bin Index
// =============================================================================

/// Bin holding free fragments of `size`. Rounds down, on both insert and removal.
#[inline(always)]
fn bin_index(size: usize) -> usize {
  debug_assert!(size >= FRAGMENT_SIZE_MIN && size % FRAGMENT_SIZE_MIN == 0);
  let idx = log2_floor(size / FRAGMENT_SIZE_MIN) as usize;
  debug_assert!(idx < NUM_BINS_MAX);
  idx
}

#[inline(always)]
unsafe fn interlink(left: *mut Fragment, right: *mut Fragment) {
  if !left.is_null() {
    unsafe { (*left).header.next = right };
  }
  if !right.is_null() {
    unsafe { (*right).header.prev = left };
  }
}

impl RtsAlloc {
  /// Push a free fragment onto the head of its bin.
  #[inline]
  unsafe fn rebin(&mut self, fragment: *mut Fragment) {
    debug_assert!(!fragment.is_null());
    let idx = bin_index(unsafe { (*fragment).header.size });
    let head = self.bins[idx];

    unsafe {
      (*fragment).next_free = head;
      (*fragment).prev_free = null_mut();
      if !head.is_null() {
        (*head).prev_free = fragment;
      }
    }

    self.bins[idx] = fragment;
    self.nonempty_bin_mask |= pow2(idx as u32);
  }

  /// Splice a free fragment out of its bin. Its size must not have changed since `rebin`.
  #[inline]
  unsafe fn unbin(&mut self, fragment: *mut Fragment) {
    debug_assert!(!fragment.is_null());
    let idx = bin_index(unsafe { (*fragment).header.size });
    let (next_free, prev_free) = unsafe { ((*fragment).next_free, (*fragment).prev_free) };

    if !next_free.is_null() {
      unsafe { (*next_free).prev_free = prev_free };
    }
    if !prev_free.is_null() {
      unsafe { (*prev_free).next_free = next_free };
    }

    if self.bins[idx] == fragment {
      debug_assert!(prev_free.is_null(), "unbin: bin {idx} head {fragment:p} has a predecessor");
      self.bins[idx] = next_free;
      if next_free.is_null() {
        self.nonempty_bin_mask &= !pow2(idx as u32);
      }
    }
  }

  /// Smallest non-empty bin with index `>= min_index`, in O(1).
  #[inline(always)]
  fn find_bin(&self, min_index: u32) -> Option<usize> {
    debug_assert!((min_index as usize) < NUM_BINS_MAX);
    let candidate_bin_mask = !(pow2(min_index) - 1);
    let smallest_bin_mask = lowest_set_bit(self.nonempty_bin_mask & candidate_bin_mask);
    if smallest_bin_mask == 0 {
      return None;
    }
    let idx = log2_floor(smallest_bin_mask) as usize;
    debug_assert!(idx >= min_index as usize && idx < NUM_BINS_MAX);
    Some(idx)
  }
}

// =============================================================================
// Allocation
// =============================================================================

impl RtsAlloc {
  /// Returns at least `amount` writable bytes aligned to [`ALIGNMENT`], or `None`.
  ///
  /// Zero-byte requests fail without touching the counters. Any other failure
  /// bumps `oom_count`. `peak_request_size` is updated either way.
  pub fn allocate(&mut self, amount: usize) -> Option<NonNull<u8>> {
    debug_assert!(self.diagnostics.capacity <= FRAGMENT_SIZE_MAX);

    let out = if amount > 0 && amount <= self.diagnostics.capacity - ALIGNMENT {
      unsafe { self.take_fragment(amount) }
    } else {
      None
    };

    if self.diagnostics.peak_request_size < amount {
      self.diagnostics.peak_request_size = amount;
    }
    if out.is_none() && amount > 0 {
      self.diagnostics.oom_count += 1;
      #[cfg(feature = "trace-calls")]
      log::debug!(
        "rtsalloc: out of memory for {} bytes (allocated={}/{}, oom_count={})",
        amount,
        self.diagnostics.allocated,
        self.diagnostics.capacity,
        self.diagnostics.oom_count
      );
    }

    #[cfg(all(debug_assertions, feature = "debug-tripwire"))]
    self.tripwire("allocate");

    out
  }

  /// Good-fit search, unbin, split. `amount` is already range-checked.
  unsafe fn take_fragment(&mut self, amount: usize) -> Option<NonNull<u8>> {
    let fragment_size = round_up_to_power_of_2(amount + ALIGNMENT);
    debug_assert!((FRAGMENT_SIZE_MIN..=FRAGMENT_SIZE_MAX).contains(&fragment_size));
    debug_assert!(fragment_size >= amount + ALIGNMENT);

    // Ceiling, so that any fragment at or above this bin is big enough.
    let optimal_bin_index = log2_ceil(fragment_size / FRAGMENT_SIZE_MIN);
    let bin_index = self.find_bin(optimal_bin_index)?;

    // Head of the bin, no scan for a tighter fit.
    let frag = self.bins[bin_index];
    debug_assert!(!frag.is_null(), "take_fragment: bin {bin_index} flagged but empty");

    unsafe {
      let size = (*frag).header.size;
      debug_assert!(size >= fragment_size && size % FRAGMENT_SIZE_MIN == 0);
      debug_assert!(!(*frag).header.used, "take_fragment: used fragment {frag:p} in bin {bin_index}");
      self.unbin(frag);

      let leftover = size - fragment_size;
      debug_assert!(leftover < self.diagnostics.capacity && leftover % FRAGMENT_SIZE_MIN == 0);
      if leftover >= FRAGMENT_SIZE_MIN {
        (*frag).header.size = fragment_size;
        let new_frag = (frag as *mut u8).add(fragment_size) as *mut Fragment;
        debug_assert!(new_frag as usize % ALIGNMENT == 0);
        new_frag.write(Fragment {
          header: FragmentHeader {
            next: null_mut(),
            prev: null_mut(),
            size: leftover,
            used: false,
          },
          next_free: null_mut(),
          prev_free: null_mut(),
        });
        interlink(new_frag, (*frag).header.next);
        interlink(frag, new_frag);
        self.rebin(new_frag);
      }

      let granted = (*frag).header.size;
      self.diagnostics.allocated += granted;
      debug_assert!(self.diagnostics.allocated <= self.diagnostics.capacity);
      if self.diagnostics.peak_allocated < self.diagnostics.allocated {
        self.diagnostics.peak_allocated = self.diagnostics.allocated;
      }

      (*frag).header.used = true;
      let out = (frag as *mut u8).add(ALIGNMENT);
      #[cfg(feature = "trace-calls")]
      log::trace!("rtsalloc: allocate({amount}) -> {out:p} fragment={granted}");
      NonNull::new(out)
    }
  }
}

// =============================================================================
// Deallocation
// =============================================================================

impl RtsAlloc {
  /// Returns a fragment to the arena, merging it with free neighbors. Null is a no-op.
  ///
  /// # Safety
  ///
  /// `pointer` must be null or come from `allocate` on this instance and not have been
  /// freed since. Violations trip debug assertions and are undefined in release.
  pub unsafe fn free(&mut self, pointer: *mut u8) {
    if pointer.is_null() {
      return;
    }

    let frag = pointer.wrapping_sub(ALIGNMENT) as *mut Fragment;
    debug_assert!(
      self.owns_fragment(frag),
      "free: {pointer:p} is not a fragment of arena {:p}",
      self.first
    );

    unsafe {
      debug_assert!((*frag).header.used, "free: {pointer:p} is not in use (double free?)");
      let size = (*frag).header.size;
      debug_assert!(size >= FRAGMENT_SIZE_MIN && size <= self.diagnostics.capacity);
      debug_assert!(size % FRAGMENT_SIZE_MIN == 0);

      (*frag).header.used = false;
      debug_assert!(self.diagnostics.allocated >= size);
      self.diagnostics.allocated -= size;
      #[cfg(feature = "trace-calls")]
      log::trace!("rtsalloc: free({pointer:p}) fragment={size}");

      let prev = (*frag).header.prev;
      let next = (*frag).header.next;
      let join_left = !prev.is_null() && !(*prev).header.used;
      let join_right = !next.is_null() && !(*next).header.used;

      // Merged-away headers get size 0 so a stale free trips the size assertions.
      match (join_left, join_right) {
        (true, true) => {
          self.unbin(prev);
          self.unbin(next);
          (*prev).header.size += size + (*next).header.size;
          (*frag).header.size = 0;
          (*next).header.size = 0;
          interlink(prev, (*next).header.next);
          self.rebin(prev);
        }
        (true, false) => {
          self.unbin(prev);
          (*prev).header.size += size;
          (*frag).header.size = 0;
          interlink(prev, next);
          self.rebin(prev);
        }
        (false, true) => {
          self.unbin(next);
          (*frag).header.size += (*next).header.size;
          (*next).header.size = 0;
          interlink(frag, (*next).header.next);
          self.rebin(frag);
        }
        (false, false) => self.rebin(frag),
      }
    }

    #[cfg(all(debug_assertions, feature = "debug-tripwire"))]
    self.tripwire("free");
  }
}

// =============================================================================
// Diagnostics & Validation
// =============================================================================

impl RtsAlloc {
  /// Copy of the usage counters.
  #[inline]
  pub fn diagnostics(&self) -> Diagnostics {
    self.diagnostics
  }

  #[inline]
  pub fn capacity(&self) -> usize {
    self.diagnostics.capacity
  }

  /// Cheap audit of the bin bitmask and the counters. Repairs nothing.
  pub fn check_heap_corruption(&self) -> bool {
    let mut valid = true;

    for (i, bin) in self.bins.iter().enumerate() {
      let mask_bit_set = self.nonempty_bin_mask & pow2(i as u32) != 0;
      valid = valid && (mask_bit_set == !bin.is_null());
    }

    let diag = self.diagnostics;

    valid = valid
      && diag.capacity <= FRAGMENT_SIZE_MAX
      && diag.capacity >= FRAGMENT_SIZE_MIN
      && diag.capacity % FRAGMENT_SIZE_MIN == 0;

    valid = valid
      && diag.allocated <= diag.capacity
      && diag.allocated % FRAGMENT_SIZE_MIN == 0
      && diag.peak_allocated <= diag.capacity
      && diag.peak_allocated >= diag.allocated
      && diag.peak_allocated % FRAGMENT_SIZE_MIN == 0;

    valid = valid && (diag.peak_request_size < diag.capacity || diag.oom_count > 0);
    if diag.peak_request_size == 0 {
      valid = valid && diag.peak_allocated == 0 && diag.allocated == 0 && diag.oom_count == 0;
    } else {
      valid = valid
        && (diag.peak_request_size.saturating_add(ALIGNMENT) <= diag.peak_allocated
          || diag.oom_count > 0);
    }

    valid
  }

  /// Walks the whole chain and every bin. O(n), meant for tests and the tripwire.
  ///
  /// Checks that the chain tiles the capacity exactly, back links agree, no two free
  /// fragments are adjacent, every free fragment sits in the right bin and nothing
  /// else does, and `allocated` matches the used fragments.
  pub fn check_fragment_chain(&self) -> bool {
    let arena_start = self.first as usize;
    let mut expected_addr = arena_start;
    let mut prev: *mut Fragment = null_mut();
    let mut cursor = self.first;
    let mut total = 0usize;
    let mut used_total = 0usize;
    let mut free_count = 0usize;
    let mut prev_free = false;

    while !cursor.is_null() {
      let header = unsafe { &(*cursor).header };
      if cursor as usize != expected_addr
        || header.prev != prev
        || header.size < FRAGMENT_SIZE_MIN
        || header.size % FRAGMENT_SIZE_MIN != 0
      {
        return false;
      }
      if header.used {
        used_total += header.size;
        prev_free = false;
      } else {
        if prev_free {
          return false;
        }
        prev_free = true;
        free_count += 1;
      }
      total += header.size;
      if total > self.diagnostics.capacity {
        return false;
      }
      expected_addr += header.size;
      prev = cursor;
      cursor = header.next;
    }

    if total != self.diagnostics.capacity || used_total != self.diagnostics.allocated {
      return false;
    }

    let mut binned = 0usize;
    for (i, &head) in self.bins.iter().enumerate() {
      let mut prev_free_link: *mut Fragment = null_mut();
      let mut node = head;
      while !node.is_null() {
        let frag = unsafe { &*node };
        if frag.header.used
          || frag.prev_free != prev_free_link
          || frag.header.size < FRAGMENT_SIZE_MIN
          || frag.header.size % FRAGMENT_SIZE_MIN != 0
          || bin_index(frag.header.size) != i
        {
          return false;
        }
        binned += 1;
        if binned > free_count {
          return false;
        }
        prev_free_link = node;
        node = frag.next_free;
      }
    }

    binned == free_count
  }

  #[cfg(all(debug_assertions, feature = "debug-tripwire"))]
  fn tripwire(&self, op: &str) {
    assert!(self.check_heap_corruption(), "{op}: heap corruption detected");
    assert!(self.check_fragment_chain(), "{op}: fragment chain corrupted");
  }

  /// Iterates the address-ordered chain, first fragment first.
  pub fn fragments(&self) -> Fragments<'_> {
    Fragments {
      cursor: self.first,
      origin: self.first as usize,
      _marker: PhantomData,
    }
  }

  /// Whether `ptr` points into the usable region of this arena.
  pub fn contains(&self, ptr: *const u8) -> bool {
    let start = self.first as usize;
    let addr = ptr as usize;
    addr >= start && addr < start + self.diagnostics.capacity
  }

  /// Bytes usable behind a live pointer: its fragment size minus the header unit.
  ///
  /// # Safety
  ///
  /// `ptr` must be a live allocation of this instance.
  pub unsafe fn usable_size(&self, ptr: *const u8) -> usize {
    let frag = ptr.wrapping_sub(ALIGNMENT) as *const Fragment;
    debug_assert!(self.owns_fragment(frag as *mut Fragment));
    let header = unsafe { &(*frag).header };
    debug_assert!(header.used, "usable_size: {ptr:p} is not in use");
    header.size - ALIGNMENT
  }

  /// Address-range plausibility of a fragment header, used by the debug checks.
  fn owns_fragment(&self, frag: *mut Fragment) -> bool {
    let start = self.first as usize;
    let addr = frag as usize;
    addr % ALIGNMENT == 0
      && addr >= start
      && addr <= start + self.diagnostics.capacity - FRAGMENT_SIZE_MIN
  }
}

/// Iterator over the address-ordered fragment chain.
pub struct Fragments<'a> {
  cursor: *const Fragment,
  origin: usize,
  _marker: PhantomData<&'a RtsAlloc>,
}

impl Iterator for Fragments<'_> {
  type Item = FragmentInfo;

  fn next(&mut self) -> Option<FragmentInfo> {
    if self.cursor.is_null() {
      return None;
    }
    let header = unsafe { &(*self.cursor).header };
    let info = FragmentInfo {
      offset: self.cursor as usize - self.origin,
      size: header.size,
      used: header.used,
    };
    self.cursor = header.next;
    Some(info)
  }
}

// =============================================================================
// Utils
// =============================================================================

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}
