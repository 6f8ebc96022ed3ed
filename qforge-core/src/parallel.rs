//! Parallel-for runtime for amplitude-level kernels
//!
//! Distributes strided index ranges over rayon workers. A power-of-two
//! stride of consecutive indices goes to the same worker to amortize
//! synchronization; registers below the parallel threshold run
//! single-threaded. Kernels must be independent across indices or
//! serialize through their own accumulator slot; panics inside a kernel
//! abort the iteration and surface at the call site.

use rayon::prelude::*;

/// Strided work distributor for amplitude kernels
#[derive(Debug, Clone, Copy)]
pub struct ParallelFor {
    stride_pow: usize,
    threshold_pow: usize,
}

impl ParallelFor {
    /// `stride_pow`: log2 of consecutive indices handed to one worker.
    /// `threshold_pow`: log2 of the iteration count below which the loop
    /// stays on the calling thread.
    pub fn new(stride_pow: usize, threshold_pow: usize) -> Self {
        Self {
            stride_pow,
            threshold_pow,
        }
    }

    /// Invoke `f` for every index in `[begin, end)`
    pub fn par_for<F>(&self, begin: u64, end: u64, f: F)
    where
        F: Fn(u64) + Sync,
    {
        if end <= begin {
            return;
        }
        let count = end - begin;
        if count < (1u64 << self.threshold_pow) {
            for i in begin..end {
                f(i);
            }
            return;
        }

        let stride = 1u64 << self.stride_pow;
        let chunks = count.div_ceil(stride);
        (0..chunks).into_par_iter().for_each(|chunk| {
            let lo = begin + chunk * stride;
            let hi = (lo + stride).min(end);
            for i in lo..hi {
                f(i);
            }
        });
    }

    /// Invoke `f` for every index of a `dimension`-sized space in which the
    /// bit positions named by `sorted_powers` are held zero.
    ///
    /// The masked bits are re-inserted symbolically, so a kernel over all
    /// 2^(n-k) base indices of k fixed qubits never materializes an index
    /// list. `sorted_powers` must be powers of two in ascending order.
    pub fn par_for_mask<F>(&self, dimension: u64, sorted_powers: &[u64], f: F)
    where
        F: Fn(u64) + Sync,
    {
        let iterations = dimension >> sorted_powers.len();
        match sorted_powers {
            [] => self.par_for(0, dimension, f),
            [power] => {
                let low_mask = power - 1;
                self.par_for(0, iterations, |lcv| {
                    f((lcv & low_mask) | ((lcv & !low_mask) << 1));
                });
            }
            powers => self.par_for(0, iterations, |lcv| f(expand_masked_index(lcv, powers))),
        }
    }

    /// Sum `f` over `[begin, end)` with one accumulator per worker
    pub fn par_reduce<F>(&self, begin: u64, end: u64, f: F) -> f64
    where
        F: Fn(u64) -> f64 + Sync,
    {
        if end <= begin {
            return 0.0;
        }
        let count = end - begin;
        if count < (1u64 << self.threshold_pow) {
            return (begin..end).map(f).sum();
        }

        let stride = 1u64 << self.stride_pow;
        let chunks = count.div_ceil(stride);
        (0..chunks)
            .into_par_iter()
            .map(|chunk| {
                let lo = begin + chunk * stride;
                let hi = (lo + stride).min(end);
                (lo..hi).map(&f).sum::<f64>()
            })
            .sum()
    }
}

impl Default for ParallelFor {
    fn default() -> Self {
        Self::new(11, 14)
    }
}

/// Insert a zero bit at each of the `sorted_powers` positions of `lcv`
///
/// Powers must be ascending. This is the index expansion that lets gate
/// kernels iterate only over the base member of each amplitude group.
#[inline]
pub fn expand_masked_index(lcv: u64, sorted_powers: &[u64]) -> u64 {
    let mut i = lcv;
    for &power in sorted_powers {
        let low = i & (power - 1);
        i = ((i ^ low) << 1) | low;
    }
    i
}

/// Shared mutable view of an amplitude array for disjoint-index kernels
///
/// Wraps a raw slice pointer so rayon workers can write without locking.
/// Soundness rests on the kernel's index discipline: no two workers may
/// touch the same element, which the strided/masked iteration guarantees.
pub struct SharedSlice<'a, T> {
    ptr: *mut T,
    len: usize,
    _marker: std::marker::PhantomData<&'a mut [T]>,
}

unsafe impl<T: Send> Send for SharedSlice<'_, T> {}
unsafe impl<T: Send> Sync for SharedSlice<'_, T> {}

impl<'a, T: Copy> SharedSlice<'a, T> {
    pub fn new(slice: &'a mut [T]) -> Self {
        Self {
            ptr: slice.as_mut_ptr(),
            len: slice.len(),
            _marker: std::marker::PhantomData,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Read element `i`.
    ///
    /// # Safety
    /// `i` must be in bounds and not concurrently written by another worker.
    #[inline]
    pub unsafe fn read(&self, i: u64) -> T {
        debug_assert!((i as usize) < self.len);
        *self.ptr.add(i as usize)
    }

    /// Write element `i`.
    ///
    /// # Safety
    /// `i` must be in bounds and touched by exactly one worker.
    #[inline]
    pub unsafe fn write(&self, i: u64, value: T) {
        debug_assert!((i as usize) < self.len);
        *self.ptr.add(i as usize) = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn test_par_for_visits_every_index() {
        let runner = ParallelFor::new(2, 0);
        let sum = AtomicU64::new(0);
        runner.par_for(0, 100, |i| {
            sum.fetch_add(i, Ordering::Relaxed);
        });
        assert_eq!(sum.load(Ordering::Relaxed), 99 * 100 / 2);
    }

    #[test]
    fn test_expand_masked_index() {
        // Holding bit 1 at zero: 0,1,2,3 -> 0,1,4,5
        assert_eq!(expand_masked_index(0, &[2]), 0);
        assert_eq!(expand_masked_index(1, &[2]), 1);
        assert_eq!(expand_masked_index(2, &[2]), 4);
        assert_eq!(expand_masked_index(3, &[2]), 5);

        // Holding bits 0 and 2 at zero: results never have bit 0 or 2 set
        for lcv in 0..8 {
            let i = expand_masked_index(lcv, &[1, 4]);
            assert_eq!(i & 1, 0);
            assert_eq!(i & 4, 0);
        }
    }

    #[test]
    fn test_par_for_mask_base_indices() {
        let runner = ParallelFor::new(2, 0);
        let count = AtomicU64::new(0);
        runner.par_for_mask(16, &[2], |i| {
            assert_eq!(i & 2, 0);
            count.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(count.load(Ordering::Relaxed), 8);
    }

    #[test]
    fn test_par_reduce() {
        let runner = ParallelFor::new(3, 0);
        let total = runner.par_reduce(0, 1000, |i| i as f64);
        assert_eq!(total, (999.0 * 1000.0) / 2.0);
    }

    #[test]
    fn test_shared_slice_disjoint_writes() {
        let mut data = vec![0u64; 64];
        let shared = SharedSlice::new(&mut data);
        let runner = ParallelFor::new(2, 0);
        runner.par_for(0, 64, |i| unsafe {
            shared.write(i, i * 2);
        });
        assert_eq!(data[10], 20);
        assert_eq!(data[63], 126);
    }
}
