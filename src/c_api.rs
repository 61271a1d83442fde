//! C entry points over the engine (enabled with `--features c_api`).
//!
//! Handles are plain `RtsAlloc` pointers into the caller's buffer; failures are null.

use core::ptr::null_mut;

use libc::c_void;

use crate::{Diagnostics, RtsAlloc};

#[unsafe(no_mangle)]
pub unsafe extern "C" fn rtsalloc_init(base: *mut c_void, size: usize) -> *mut RtsAlloc {
  match unsafe { RtsAlloc::init(base.cast(), size) } {
    Ok(handle) => {
      log::debug!("rtsalloc: init arena {base:p} size={size} capacity={}", handle.capacity());
      handle as *mut RtsAlloc
    }
    Err(e) => {
      log::debug!("rtsalloc: init rejected: {e}");
      null_mut()
    }
  }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn rtsalloc_allocate(handle: *mut RtsAlloc, amount: usize) -> *mut c_void {
  debug_assert!(!handle.is_null());
  unsafe { &mut *handle }
    .allocate(amount)
    .map_or(null_mut(), |p| p.as_ptr().cast())
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn rtsalloc_free(handle: *mut RtsAlloc, pointer: *mut c_void) {
  debug_assert!(!handle.is_null());
  unsafe { (*handle).free(pointer.cast()) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn rtsalloc_check_heap_corruption(handle: *const RtsAlloc) -> bool {
  debug_assert!(!handle.is_null());
  unsafe { (*handle).check_heap_corruption() }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn rtsalloc_get_diagnostics(handle: *const RtsAlloc) -> Diagnostics {
  debug_assert!(!handle.is_null());
  unsafe { (*handle).diagnostics() }
}
