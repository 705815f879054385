use std::{
  cell::UnsafeCell,
  mem,
  ptr,
  sync::atomic::{AtomicBool, AtomicU32, Ordering},
};

use crate::wire::HeapConfig;

/// Fixed width of a registered heap name, NUL padded.
pub const HEAP_NAME_SZ: usize = 64;

/// Total heap slots, including the reserved slot 0.
const MAX_HEAPS: usize = 256;

/// Identifier of the first registerable heap. Slot 0 stays reserved so a
/// zero return from registration can signal failure.
const MIN_HEAP_ID: u32 = 1;

/// Invoked with the new state whenever a heap's `enabled` flag flips.
pub type EnabledCallback = unsafe extern "C" fn(bool);

/// ABI-stable descriptor passed by callers registering a heap.
///
/// New fields may only be appended. Callers pass their compiled-in size, so
/// an older caller leaves the tail of the slot zeroed and keeps working.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct HeapInfo {
  pub name: [u8; HEAP_NAME_SZ],
  pub callback: Option<EnabledCallback>,
}

impl HeapInfo {
  /// Descriptor for `name`, truncated to the fixed width with at least one
  /// trailing NUL.
  #[must_use]
  pub fn new(name: &str, callback: Option<EnabledCallback>) -> Self {
    let mut info = Self {
      name: [0; HEAP_NAME_SZ],
      callback,
    };
    let len = name.len().min(HEAP_NAME_SZ - 1);
    info.name[..len].copy_from_slice(&name.as_bytes()[..len]);
    info
  }
}

struct HeapEntry {
  info: UnsafeCell<HeapInfo>,
  ready: AtomicBool,
  enabled: AtomicBool,
  service_heap_id: AtomicU32,
}

impl HeapEntry {
  /// The heap enable callback, if the registrant provided one.
  fn fire_callback(&self, enabled: bool) {
    // Entries are immutable once `ready` was observed, so the callback
    // pointer read does not race with registration.
    let callback = unsafe { (*self.info.get()).callback };
    if let Some(callback) = callback {
      // SAFETY: the registrant guarantees the callback stays valid for the
      // process lifetime.
      unsafe { callback(enabled) };
    }
  }

  fn name(&self) -> &[u8] {
    let info = unsafe { &*self.info.get() };
    let len = info
      .name
      .iter()
      .position(|&byte| byte == 0)
      .unwrap_or(HEAP_NAME_SZ);
    &info.name[..len]
  }
}

/// Fixed-capacity, append-only table of registered heaps.
///
/// Identifiers are dense, 1-based and never reused. A slot is written
/// exactly once and published with a `ready` store; after that only the
/// `enabled` flag and the negotiated service heap id change, and only from
/// the host-serialized session paths.
pub struct HeapRegistry {
  entries: [HeapEntry; MAX_HEAPS],
  next_id: AtomicU32,
}

// SAFETY: the `info` cells are written once, before the `ready` publish that
// readers synchronize on.
unsafe impl Sync for HeapRegistry {}

impl HeapRegistry {
  #[must_use]
  pub const fn new() -> Self {
    const EMPTY: HeapEntry = HeapEntry {
      info: UnsafeCell::new(HeapInfo {
        name: [0; HEAP_NAME_SZ],
        callback: None,
      }),
      ready: AtomicBool::new(false),
      enabled: AtomicBool::new(false),
      service_heap_id: AtomicU32::new(0),
    };
    Self {
      entries: [EMPTY; MAX_HEAPS],
      next_id: AtomicU32::new(MIN_HEAP_ID),
    }
  }

  /// Match every ready heap against the handshake's heap list. The index of
  /// a list entry is the service-side heap id. Newly matched heaps are
  /// enabled and their callback fired with `true`; previously enabled heaps
  /// that no longer match are disabled and their callback fired with
  /// `false`.
  pub fn apply_config(&self, heaps: &[HeapConfig]) {
    self.for_each_ready(|entry| {
      let matched = heaps
        .iter()
        .position(|config| config.name.as_bytes() == entry.name());
      match matched {
        Some(service_heap_id) => {
          entry
            .service_heap_id
            .store(service_heap_id as u32, Ordering::Relaxed);
          if !entry.enabled.load(Ordering::Relaxed) {
            entry.fire_callback(true);
          }
          entry.enabled.store(true, Ordering::Relaxed);
        }
        None => {
          if entry.enabled.load(Ordering::Relaxed) {
            entry.enabled.store(false, Ordering::Relaxed);
            entry.fire_callback(false);
          }
        }
      }
    });
  }

  /// Disable every ready heap, firing callbacks with `false`. Used by lazy
  /// shutdown and by the post-fork child.
  pub fn disable_all(&self) {
    self.for_each_ready(|entry| {
      if entry.enabled.load(Ordering::Relaxed) {
        entry.enabled.store(false, Ordering::Relaxed);
        entry.fire_callback(false);
      }
    });
  }

  fn for_each_ready<F: FnMut(&HeapEntry)>(&self, mut f: F) {
    let top = self.next_id.load(Ordering::Relaxed).min(MAX_HEAPS as u32);
    for id in MIN_HEAP_ID..top {
      let entry = &self.entries[id as usize];
      if entry.ready.load(Ordering::Acquire) {
        f(entry);
      }
    }
  }

  /// Unsynchronized fast-path read. The flag is relaxed-atomic: a freshly
  /// enabled heap becomes visible to allocating threads with bounded latency
  /// and a missed flip is recovered on the next call.
  #[must_use]
  pub fn is_enabled(&self, id: u32) -> bool {
    if id as usize >= MAX_HEAPS {
      return false;
    }
    self.entries[id as usize].enabled.load(Ordering::Relaxed)
  }

  /// Copy the first `n` bytes of `info` into a fresh slot and publish it.
  ///
  /// Returns 0 when the table is full or when `n` exceeds the layout this
  /// library was compiled against (the caller is newer than the library).
  ///
  /// # Safety
  /// `info` must point to at least `n` readable bytes laid out as a
  /// `HeapInfo` prefix.
  pub unsafe fn register(&self, info: *const HeapInfo, n: usize) -> u32 {
    if info.is_null() || n > mem::size_of::<HeapInfo>() {
      return 0;
    }
    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    if id as usize >= MAX_HEAPS {
      return 0;
    }
    let entry = &self.entries[id as usize];
    // The slot is written exactly once, before the `ready` publish below,
    // so the raw copy cannot race with readers.
    unsafe {
      ptr::copy_nonoverlapping(info.cast::<u8>(), entry.info.get().cast::<u8>(), n);
    }
    entry.ready.store(true, Ordering::Release);
    id
  }

  /// The service-side heap id negotiated at the last handshake. Meaningful
  /// only while the heap is enabled.
  #[must_use]
  pub fn service_heap_id(&self, id: u32) -> u32 {
    if id as usize >= MAX_HEAPS {
      return 0;
    }
    self.entries[id as usize]
      .service_heap_id
      .load(Ordering::Relaxed)
  }
}

impl Default for HeapRegistry {
  fn default() -> Self {
    Self::new()
  }
}
