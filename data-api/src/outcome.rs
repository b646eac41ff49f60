use std::time::Duration;

/// Per-operation duration breakdown: request preparation, the primary-store
/// or cache operation itself, and post-processing (projection, publication).
#[derive(Debug, Clone, Copy, Default)]
pub struct Timings {
    pub pre: Duration,
    pub operation: Duration,
    pub post: Duration,
}

impl Timings {
    pub fn total(&self) -> Duration {
        self.pre + self.operation + self.post
    }
}

/// Successful result of a repository operation, carrying whether the value
/// came out of the cache and where the time went.
#[derive(Debug, Clone)]
pub struct Outcome<T> {
    pub value: T,
    pub cache_hit: bool,
    pub timings: Timings,
}

impl<T> Outcome<T> {
    pub fn new(value: T, cache_hit: bool, timings: Timings) -> Self {
        Self {
            value,
            cache_hit,
            timings,
        }
    }
}
