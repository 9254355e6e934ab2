//! Message and join reference allocation.

use std::sync::atomic::{AtomicU64, Ordering};

/// Allocates correlation refs for one channel instance.
///
/// The join ref is fixed at construction and equals the seed, so the join
/// request (the first ref handed out) carries `join_ref == ref`.
#[derive(Debug)]
pub struct RefAllocator {
    seed: u64,
    join_ref: String,
    next: AtomicU64,
}

impl RefAllocator {
    /// Create an allocator whose first message ref is `seed`.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            join_ref: seed.to_string(),
            next: AtomicU64::new(seed),
        }
    }

    /// The join ref for this channel's lifetime.
    pub fn join_ref(&self) -> &str {
        &self.join_ref
    }

    /// Allocate the next message ref.
    pub fn next_message_ref(&self) -> String {
        self.next.fetch_add(1, Ordering::Relaxed).to_string()
    }

    /// Number of message refs handed out so far.
    pub fn issued(&self) -> u64 {
        self.next.load(Ordering::Relaxed) - self.seed
    }
}

impl Default for RefAllocator {
    fn default() -> Self {
        Self::new(1)
    }
}
