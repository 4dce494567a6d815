use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonic, thread-safe counter. Values handed out are never reused until [`Counter::reset`]
/// is called.
#[derive(Debug, Default)]
pub struct Counter {
    next: AtomicU64,
}

impl Counter {
    pub const fn new(start: u64) -> Self {
        Self {
            next: AtomicU64::new(start),
        }
    }

    /// Returns the next value and advances the counter.
    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// Returns the value the next [`Counter::next`] call would hand out.
    pub fn peek(&self) -> u64 {
        self.next.load(Ordering::Relaxed)
    }

    pub fn reset(&self, start: u64) {
        self.next.store(start, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::Counter;

    #[test]
    pub fn counter_is_monotonic() {
        let counter = Counter::new(5);
        assert_eq!(counter.next(), 5);
        assert_eq!(counter.next(), 6);
        assert_eq!(counter.peek(), 7);

        counter.reset(0);
        assert_eq!(counter.next(), 0);
    }
}
