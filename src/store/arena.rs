/// Byte-budget arena backing one worker's sample tables.
///
/// Every insertion charges its estimated footprint here before touching
/// the tables; a refused charge is the signal to switch to file mode or
/// to flush. The budget is the contract, not the allocator: tables
/// allocate normally but never grow past what was charged.
#[derive(Debug)]
pub struct Arena {
    capacity: usize,
    used: usize,
}

impl Arena {
    pub fn new(capacity: usize) -> Self {
        Arena { capacity, used: 0 }
    }

    /// Tries to reserve `bytes`; `false` means the arena is exhausted
    /// and the caller must spill before retrying.
    pub fn charge(&mut self, bytes: usize) -> bool {
        if self.used + bytes > self.capacity {
            return false;
        }
        self.used += bytes;
        true
    }

    pub fn reset(&mut self) {
        self.used = 0;
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn charge_until_exhausted() {
        let mut arena = Arena::new(100);
        assert!(arena.charge(60));
        assert!(arena.charge(40));
        assert!(!arena.charge(1));
        arena.reset();
        assert!(arena.charge(100));
    }
}
