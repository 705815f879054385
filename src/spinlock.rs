use std::{
  hint,
  sync::atomic::{AtomicBool, Ordering},
  time::{Duration, Instant},
};

/// Acquisition attempts made before the deadline clock is consulted. The
/// guarded sections are tens of instructions, so almost every acquisition
/// succeeds inside this window without ever reading the clock.
const BUSY_SPINS: u32 = 1024;

/// Upper bound on the busy wait. A wait anywhere near this long means a
/// holder died or the process state is corrupt; callers abort rather than
/// silently dropping data.
const SPIN_DEADLINE: Duration = Duration::from_millis(128);

/// One-byte spin lock guarding the process-wide session slot.
///
/// The lock also serves as the external serialization point for sampling
/// decisions: the guard is passed by reference as a witness that the caller
/// is inside the critical section (see `Session::sample_size`).
#[derive(Debug, Default)]
pub struct Spinlock {
  locked: AtomicBool,
}

impl Spinlock {
  #[must_use]
  pub const fn new() -> Self {
    Self {
      locked: AtomicBool::new(false),
    }
  }

  /// Reset the lock after `fork`. Only the forking thread survives into the
  /// child, so a pre-fork holder can never release it there.
  pub fn force_reset(&self) {
    self.locked.store(false, Ordering::Release);
  }

  fn try_acquire(&self) -> bool {
    !self.locked.swap(true, Ordering::Acquire)
  }

  /// Attempt to acquire with a bounded busy wait. `None` on deadline expiry;
  /// callers treat that as an unrecoverable invariant violation.
  #[must_use]
  pub fn try_lock(&self) -> Option<SpinlockGuard<'_>> {
    for _ in 0..BUSY_SPINS {
      if self.try_acquire() {
        return Some(SpinlockGuard { lock: self });
      }
      hint::spin_loop();
    }

    let deadline = Instant::now() + SPIN_DEADLINE;
    while Instant::now() < deadline {
      if self.try_acquire() {
        return Some(SpinlockGuard { lock: self });
      }
      hint::spin_loop();
    }
    None
  }
}

/// Releases the lock when dropped, on every exit path from the guarded
/// scope.
#[derive(Debug)]
pub struct SpinlockGuard<'a> {
  lock: &'a Spinlock,
}

impl Drop for SpinlockGuard<'_> {
  fn drop(&mut self) {
    self.lock.locked.store(false, Ordering::Release);
  }
}
