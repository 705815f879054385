//! The symbol-visible surface of the client.
//!
//! The host allocator runtime loads this library into an arbitrary process,
//! registers its heaps, and calls the report hooks from every thread that
//! allocates. The contract here is narrow: never re-enter the host
//! allocator on the hot path, never block, and never destabilize a forking
//! host. The only process-wide mutable state is the session slot below and
//! the heap registry; both live in statics (leak-on-exit storage) because
//! teardown at process exit could re-enter the hooks.

use std::{cell::UnsafeCell, process, sync::atomic::{AtomicBool, Ordering}};

use tracing::{error, info, warn};

use crate::{
  registry::{HeapInfo, HeapRegistry},
  session::Session,
  spinlock::{Spinlock, SpinlockGuard},
  unhooked::{FreeFn, MallocFn, UnhookedAllocator, UnhookedArc},
};

/// Holds the active session, if any. Empty at startup and again once a
/// shutdown begins. Hooks take owning copies under the spinlock and release
/// the lock before using them, so the session outlives the critical section.
struct SessionSlot {
  cell: UnsafeCell<UnhookedArc<Session>>,
}

// SAFETY: the slot is only read or written while `SESSION_LOCK` is held;
// the post-fork handler is the documented exception and runs in a process
// with exactly one thread.
unsafe impl Sync for SessionSlot {}

impl SessionSlot {
  fn install(&self, session: UnhookedArc<Session>, _lock: &SpinlockGuard<'_>) {
    // SAFETY: exclusive access witnessed by the guard.
    unsafe { *self.cell.get() = session };
  }

  fn is_empty(&self, _lock: &SpinlockGuard<'_>) -> bool {
    // SAFETY: shared access witnessed by the guard.
    unsafe { (*self.cell.get()).is_empty() }
  }

  /// Owning copy of the current reference.
  fn snapshot(&self, _lock: &SpinlockGuard<'_>) -> UnhookedArc<Session> {
    // SAFETY: shared access witnessed by the guard.
    unsafe { (*self.cell.get()).clone() }
  }

  fn take(&self, _lock: &SpinlockGuard<'_>) -> UnhookedArc<Session> {
    // SAFETY: exclusive access witnessed by the guard.
    unsafe { (*self.cell.get()).take() }
  }
}

static SESSION_LOCK: Spinlock = Spinlock::new();
static SESSION: SessionSlot = SessionSlot {
  cell: UnsafeCell::new(UnhookedArc::empty()),
};
static HEAPS: HeapRegistry = HeapRegistry::new();
static ATFORK_INSTALLED: AtomicBool = AtomicBool::new(false);

/// Acquire the session spinlock or tear the process down loudly.
///
/// The guarded sections are tens of instructions, so failing to acquire
/// means the process is in a state we cannot reason about. abort() rather
/// than a single self-signal so the process is sure to come down.
fn lock_or_abort() -> SpinlockGuard<'static> {
  match SESSION_LOCK.try_lock() {
    Some(guard) => guard,
    None => {
      error!("timed out on the session spinlock; aborting the whole process");
      process::abort();
    }
  }
}

/// Runs in the child after fork(2).
///
/// Another host thread may have died holding the spinlock or mid-way
/// through the session, so nothing here may depend on their state: the lock
/// is force-reset, heaps stop reporting, and the old session reference is
/// abandoned in place. Constructing the empty handle is allocation-free,
/// which is what makes the overwrite safe on an inconsistent heap. A new
/// profiling session can still be started in this child later.
extern "C" fn at_fork_child() {
  SESSION_LOCK.force_reset();
  HEAPS.disable_all();
  // SAFETY: single-threaded after fork; the leaked reference may have been
  // shared with threads that no longer exist.
  unsafe { UnhookedArc::leak_and_reset(SESSION.cell.get()) };
}

/// Install the post-fork-child handler once per process. The handler stays
/// registered for the library's lifetime.
fn install_atfork_handler() -> bool {
  if ATFORK_INSTALLED.load(Ordering::Relaxed) {
    return true;
  }
  let rc = unsafe {
    libc::pthread_atfork(None, None, Some(at_fork_child as unsafe extern "C" fn()))
  };
  if rc != 0 {
    warn!("pthread_atfork failed ({rc}); not installing hooks");
    return false;
  }
  ATFORK_INSTALLED.store(true, Ordering::Relaxed);
  true
}

/// Match registered heaps against the handshake result, then publish the
/// session. Split from `heapprof_init_session` so tests can drive it with a
/// session handshaken over a socket pair.
fn install_session(session: Session, unhooked: UnhookedAllocator) -> bool {
  HEAPS.apply_config(&session.client_config().heaps);

  let Some(handle) = UnhookedArc::new(session, unhooked) else {
    warn!("host allocator refused session storage");
    HEAPS.disable_all();
    return false;
  };

  let lock = lock_or_abort();
  // Concurrent init calls are serialized by the host runtime, so the slot
  // cannot have been refilled since it was emptied above.
  debug_assert!(SESSION.is_empty(&lock));
  SESSION.install(handle, &lock);
  true
}

/// Tear down the active session so subsequent hook invocations become
/// no-ops. Safe to call from several failing hooks at once: the first
/// caller through the lock wins.
fn shutdown_lazy() {
  let dropped = {
    let lock = lock_or_abort();
    if SESSION.is_empty(&lock) {
      return;
    }
    HEAPS.disable_all();
    SESSION.take(&lock)
  };
  // The last reference may run session teardown; that stays off the lock.
  drop(dropped);
  info!("profiling session shut down; heaps disabled");
}

/// Start (or confirm) a profiling session.
///
/// `malloc_fn` and `free_fn` are the host allocator's own entry points,
/// captured from its dispatch table before the hooks were installed; every
/// control allocation the client makes for its own bookkeeping goes through
/// them.
///
/// Returns `true` when a session is active on return. Concurrent calls are
/// serialized by the host runtime; a call that finds a live session returns
/// `true` without replacing it.
#[no_mangle]
pub extern "C" fn heapprof_init_session(malloc_fn: MallocFn, free_fn: FreeFn) -> bool {
  if !install_atfork_handler() {
    return false;
  }

  // Swap any stale session out under the lock but drop it outside: its
  // teardown closes sockets and may take arbitrary time.
  let stale;
  {
    let lock = lock_or_abort();
    let current = SESSION.snapshot(&lock);
    if current.get().is_some_and(Session::is_connected) {
      info!("profiling session already active; concurrent init is a success");
      return true;
    }
    drop(current);
    stale = SESSION.take(&lock);
  }
  drop(stale);

  let unhooked = UnhookedAllocator::new(malloc_fn, free_fn);

  // The factories allocate (sockets, argv, handshake buffers), so they run
  // without the spinlock held.
  let Some(session) = Session::create() else {
    info!("no profiling session established; hooks stay disabled");
    return false;
  };

  install_session(session, unhooked)
}

/// Register a heap with the profiler. Returns a positive heap id, or 0 when
/// the registration cannot be honored (table full, or `info` is newer than
/// this library understands).
///
/// # Safety
/// `info` must point to at least `n` readable bytes laid out as a
/// `HeapInfo` prefix.
#[no_mangle]
pub unsafe extern "C" fn heapprof_register_heap(info: *const HeapInfo, n: usize) -> u32 {
  unsafe { HEAPS.register(info, n) }
}

/// Report an allocation on a registered heap. Returns `true` when the
/// allocation was sampled.
#[no_mangle]
pub extern "C" fn heapprof_report_allocation(heap_id: u32, alloc_id: u64, size: u64) -> bool {
  if !HEAPS.is_enabled(heap_id) {
    return false;
  }
  let service_heap_id = HEAPS.service_heap_id(heap_id);

  let (session, sampled_size) = {
    let lock = lock_or_abort();
    let session = SESSION.snapshot(&lock);
    let sampled_size = match session.get() {
      Some(active) => active.sample_size(service_heap_id, size, &lock),
      // No active session; most likely mid-shutdown.
      None => return false,
    };
    if sampled_size == 0 {
      return false;
    }
    (session, sampled_size)
  };

  if let Some(active) = session.get() {
    if !active.record_malloc(service_heap_id, alloc_id, sampled_size, size) {
      shutdown_lazy();
    }
  }
  true
}

/// Report that an allocation previously reported on this heap was freed.
#[no_mangle]
pub extern "C" fn heapprof_report_free(heap_id: u32, alloc_id: u64) {
  if !HEAPS.is_enabled(heap_id) {
    return;
  }
  let service_heap_id = HEAPS.service_heap_id(heap_id);

  let session = {
    let lock = lock_or_abort();
    SESSION.snapshot(&lock)
  };

  if let Some(active) = session.get() {
    if !active.record_free(service_heap_id, alloc_id) {
      shutdown_lazy();
    }
  }
}
