use std::{
  mem,
  os::raw::c_void,
  ptr,
  sync::atomic::{fence, AtomicUsize, Ordering},
};

/// Allocation entry points captured from the host allocator's dispatch table
/// before the hooks were installed. Control allocations routed through these
/// never re-enter the hooks.
pub type MallocFn = unsafe extern "C" fn(usize) -> *mut c_void;
pub type FreeFn = unsafe extern "C" fn(*mut c_void);

/// The captured malloc/free pair. The dispatch table never changes after
/// initialization, so the raw function pointers are retained directly.
#[derive(Clone, Copy, Debug)]
pub struct UnhookedAllocator {
  malloc: MallocFn,
  free: FreeFn,
}

impl UnhookedAllocator {
  #[must_use]
  pub fn new(malloc: MallocFn, free: FreeFn) -> Self {
    Self { malloc, free }
  }
}

struct Inner<T> {
  refcount: AtomicUsize,
  free: FreeFn,
  value: T,
}

/// Reference-counted handle whose backing storage comes from the captured
/// malloc and whose final drop releases it through the captured free.
///
/// This is the ownership cell behind the process-wide session pointer: the
/// last reference may be dropped from inside an allocation hook, so neither
/// the storage nor the bookkeeping may touch the hooked allocator.
pub struct UnhookedArc<T> {
  inner: *mut Inner<T>,
}

// SAFETY: the refcount is atomic and the pointee is only dropped by the
// thread that observes the count reach zero, so handles move and share
// across threads exactly like `Arc`.
unsafe impl<T: Send + Sync> Send for UnhookedArc<T> {}
unsafe impl<T: Send + Sync> Sync for UnhookedArc<T> {}

impl<T> UnhookedArc<T> {
  /// Handle that refers to nothing. Never allocates: the post-fork child
  /// overwrites the session slot with one of these while the heap may be in
  /// an arbitrary state.
  #[must_use]
  pub const fn empty() -> Self {
    Self {
      inner: ptr::null_mut(),
    }
  }

  #[must_use]
  pub fn get(&self) -> Option<&T> {
    if self.inner.is_null() {
      return None;
    }
    // SAFETY: a non-null handle owns a reference, which keeps the pointee
    // alive for at least as long as the handle.
    Some(unsafe { &(*self.inner).value })
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.inner.is_null()
  }

  /// Overwrite `slot` with an empty handle without dropping the previous
  /// contents.
  ///
  /// The post-fork child cannot know whether the abandoned reference was
  /// shared with threads that no longer exist, so reclaiming it could free
  /// memory they were mid-way through using. The leak is accepted.
  ///
  /// # Safety
  /// `slot` must point to a valid `UnhookedArc<T>` and no other thread may
  /// access it concurrently (in the post-fork child, none can).
  pub unsafe fn leak_and_reset(slot: *mut Self) {
    unsafe { ptr::write(slot, Self::empty()) };
  }

  /// Move `value` into storage obtained from the captured malloc. `None`
  /// when the host allocator reports out of memory.
  #[must_use]
  pub fn new(value: T, allocator: UnhookedAllocator) -> Option<Self> {
    // SAFETY: raw allocation through the captured entry point; size is the
    // full control block.
    let raw = unsafe { (allocator.malloc)(mem::size_of::<Inner<T>>()) }.cast::<Inner<T>>();
    if raw.is_null() {
      return None;
    }
    debug_assert_eq!(raw.align_offset(mem::align_of::<Inner<T>>()), 0);
    // SAFETY: `raw` is freshly allocated, sized and aligned for `Inner<T>`.
    unsafe {
      ptr::write(
        raw,
        Inner {
          refcount: AtomicUsize::new(1),
          free: allocator.free,
          value,
        },
      );
    }
    Some(Self { inner: raw })
  }

  /// Replace this handle with an empty one and return the previous value.
  #[must_use]
  pub fn take(&mut self) -> Self {
    mem::replace(self, Self::empty())
  }
}

impl<T> Clone for UnhookedArc<T> {
  fn clone(&self) -> Self {
    if !self.inner.is_null() {
      // Relaxed suffices: a new reference is always created from a live one,
      // which keeps the count above zero until this increment lands.
      unsafe { (*self.inner).refcount.fetch_add(1, Ordering::Relaxed) };
    }
    Self { inner: self.inner }
  }
}

impl<T> Drop for UnhookedArc<T> {
  fn drop(&mut self) {
    if self.inner.is_null() {
      return;
    }
    // SAFETY: this handle owns a reference. Release on the decrement and an
    // Acquire fence before destruction, the same protocol `Arc` documents.
    unsafe {
      if (*self.inner).refcount.fetch_sub(1, Ordering::Release) == 1 {
        fence(Ordering::Acquire);
        let free = (*self.inner).free;
        ptr::drop_in_place(self.inner);
        free(self.inner.cast::<c_void>());
      }
    }
  }
}

impl<T: std::fmt::Debug> std::fmt::Debug for UnhookedArc<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self.get() {
      Some(value) => f.debug_tuple("UnhookedArc").field(value).finish(),
      None => f.write_str("UnhookedArc(empty)"),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::AtomicU32;

  unsafe extern "C" fn test_malloc(size: usize) -> *mut c_void {
    unsafe { libc::malloc(size) }
  }

  unsafe extern "C" fn test_free(ptr: *mut c_void) {
    unsafe { libc::free(ptr) }
  }

  fn test_allocator() -> UnhookedAllocator {
    UnhookedAllocator::new(test_malloc, test_free)
  }

  static DROPS: AtomicU32 = AtomicU32::new(0);

  struct CountsDrops;

  impl Drop for CountsDrops {
    fn drop(&mut self) {
      DROPS.fetch_add(1, Ordering::SeqCst);
    }
  }

  #[test]
  fn empty_handle_refers_to_nothing() {
    let handle = UnhookedArc::<u32>::empty();
    assert!(handle.is_empty());
    assert!(handle.get().is_none());
  }

  #[test]
  fn value_dropped_exactly_once_after_last_handle() {
    DROPS.store(0, Ordering::SeqCst);

    let first = UnhookedArc::new(CountsDrops, test_allocator()).expect("allocation");
    let second = first.clone();

    drop(first);
    assert_eq!(DROPS.load(Ordering::SeqCst), 0);

    drop(second);
    assert_eq!(DROPS.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn take_leaves_the_handle_empty() {
    let mut handle = UnhookedArc::new(7u32, test_allocator()).expect("allocation");
    let taken = handle.take();

    assert!(handle.is_empty());
    assert_eq!(taken.get().copied(), Some(7));
  }

  #[test]
  fn leak_and_reset_abandons_the_previous_reference() {
    DROPS.store(0, Ordering::SeqCst);

    let mut slot = UnhookedArc::new(CountsDrops, test_allocator()).expect("allocation");
    // SAFETY: exclusive access in this test.
    unsafe { UnhookedArc::leak_and_reset(&mut slot) };

    assert!(slot.is_empty());
    assert_eq!(DROPS.load(Ordering::SeqCst), 0);
  }
}
