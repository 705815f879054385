use rand::{rngs::SmallRng, Rng, SeedableRng};

/// Poisson sampler for one heap.
///
/// Allocations at least as large as the sampling interval are recorded with
/// their exact size. Smaller allocations are recorded with probability
/// proportional to their size: sampling points follow an exponential
/// inter-arrival schedule whose mean is the interval, and an allocation is
/// attributed one interval's worth of bytes per sampling point it crosses.
///
/// Callers serialize access externally (the session spinlock), so the
/// decisions form a well-defined multiset even under concurrent hooks.
#[derive(Debug)]
pub struct Sampler {
  sampling_interval: u64,
  interval_to_next_sample: i64,
  rng: SmallRng,
}

impl Sampler {
  #[must_use]
  pub fn new(sampling_interval: u64) -> Self {
    Self::with_rng(sampling_interval, SmallRng::from_entropy())
  }

  /// Deterministic sampler for tests and replay.
  #[must_use]
  pub fn with_seed(sampling_interval: u64, seed: u64) -> Self {
    Self::with_rng(sampling_interval, SmallRng::seed_from_u64(seed))
  }

  fn with_rng(sampling_interval: u64, rng: SmallRng) -> Self {
    let mut sampler = Self {
      sampling_interval: sampling_interval.max(1),
      interval_to_next_sample: 0,
      rng,
    };
    sampler.interval_to_next_sample = sampler.next_sample_interval();
    sampler
  }

  fn next_sample_interval(&mut self) -> i64 {
    // Inverse-CDF draw from Exp(1 / interval), floored at one byte so the
    // schedule always advances.
    let uniform: f64 = 1.0 - self.rng.gen::<f64>();
    let interval = -uniform.ln() * self.sampling_interval as f64;
    (interval as i64).max(1)
  }

  fn number_of_samples(&mut self, alloc_size: u64) -> u64 {
    self.interval_to_next_sample -= alloc_size as i64;
    let mut samples = 0;
    while self.interval_to_next_sample <= 0 {
      self.interval_to_next_sample += self.next_sample_interval();
      samples += 1;
    }
    samples
  }

  /// Bytes to attribute to this allocation; 0 means "not sampled".
  #[must_use]
  pub fn sample_size(&mut self, alloc_size: u64) -> u64 {
    if alloc_size >= self.sampling_interval {
      return alloc_size;
    }
    self.sampling_interval * self.number_of_samples(alloc_size)
  }
}
