//! Lock-free `f64` cell for write-shared weight slabs.
//!
//! The propagation pipeline only ever mixes readers and writers across a
//! phase barrier, never inside a phase, so all operations use relaxed
//! ordering: the barrier (a blocking parallel-job join) provides the
//! happens-before edge between phases.

use std::sync::atomic::{AtomicU64, Ordering};

/// An `f64` stored as `AtomicU64` bits.
#[derive(Debug)]
pub struct AtomicF64(AtomicU64);

impl AtomicF64 {
    /// Create a cell holding `value`.
    pub fn new(value: f64) -> Self {
        Self(AtomicU64::new(value.to_bits()))
    }

    /// Read the current value.
    #[inline(always)]
    pub fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    /// Overwrite the current value.
    #[inline(always)]
    pub fn store(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }

    /// Multiply `factor` into the cell without losing concurrent updates.
    ///
    /// Compare-exchange loop; correct for arbitrary interleavings of
    /// writers targeting the same cell. Note that the *order* in which
    /// concurrent factors land is still scheduling-dependent, so callers
    /// that need bit-reproducible products must serialize per cell.
    #[inline(always)]
    pub fn fetch_mul(&self, factor: f64) -> f64 {
        let mut current = self.0.load(Ordering::Relaxed);
        loop {
            let new = (f64::from_bits(current) * factor).to_bits();
            match self.0.compare_exchange_weak(current, new, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return f64::from_bits(current),
                Err(actual) => current = actual,
            }
        }
    }
}

impl Clone for AtomicF64 {
    fn clone(&self) -> Self {
        Self::new(self.load())
    }
}

impl Default for AtomicF64 {
    fn default() -> Self {
        Self::new(0.0)
    }
}

/// Allocate a slab of `len` cells, all holding `value`.
pub fn slab(len: usize, value: f64) -> Vec<AtomicF64> {
    (0..len).map(|_| AtomicF64::new(value)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_load_store() {
        let cell = AtomicF64::new(1.5);
        assert_eq!(cell.load(), 1.5);
        cell.store(-2.25);
        assert_eq!(cell.load(), -2.25);
    }

    #[test]
    fn test_fetch_mul_sequential() {
        let cell = AtomicF64::new(2.0);
        let previous = cell.fetch_mul(3.0);
        assert_eq!(previous, 2.0);
        assert_eq!(cell.load(), 6.0);
    }

    #[test]
    fn test_fetch_mul_no_lost_updates() {
        // 8 threads each multiply by 2 sixteen times; the product must be
        // exactly 2^128 (powers of two are exact in f64, so ordering does
        // not matter here).
        let cell = Arc::new(AtomicF64::new(1.0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cell = Arc::clone(&cell);
                std::thread::spawn(move || {
                    for _ in 0..16 {
                        cell.fetch_mul(2.0);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(cell.load(), 2.0_f64.powi(128));
    }

    #[test]
    fn test_slab() {
        let s = slab(5, 1.0);
        assert_eq!(s.len(), 5);
        assert!(s.iter().all(|c| c.load() == 1.0));
    }
}
