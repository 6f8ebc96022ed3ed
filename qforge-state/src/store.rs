//! Amplitude stores
//!
//! Two representations of the 2^n complex amplitudes behind one enum:
//! a dense 64-byte-aligned array and a sparse hash map that drops entries
//! below the norm threshold. Neither store is internally synchronized;
//! operations are data-race free when called from a single logical owner.

use ahash::AHashMap;
use num_complex::Complex64;
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;

use qforge_core::{Result, SimError, ZERO_CMPLX};

/// Alignment of the dense allocation, sized for 512-bit vector loads
const STORE_ALIGNMENT: usize = 64;

/// Dense contiguous amplitude array with aligned memory
pub struct DenseStore {
    dimension: u64,
    data: NonNull<Complex64>,
    layout: Layout,
}

impl DenseStore {
    /// Allocate a zeroed store of `dimension` amplitudes
    pub fn new(dimension: u64) -> Result<Self> {
        let bytes = (dimension as usize)
            .checked_mul(std::mem::size_of::<Complex64>())
            .ok_or_else(|| SimError::CapacityExceeded {
                reason: format!("dense store of {} amplitudes overflows usize", dimension),
            })?;
        let layout = Layout::from_size_align(bytes.max(STORE_ALIGNMENT), STORE_ALIGNMENT)
            .map_err(|_| SimError::CapacityExceeded {
                reason: format!("cannot lay out {} bytes", bytes),
            })?;

        let data = unsafe {
            let ptr = alloc_zeroed(layout) as *mut Complex64;
            if ptr.is_null() {
                return Err(SimError::BackendFailure {
                    reason: format!("allocation of {} bytes failed", layout.size()),
                });
            }
            NonNull::new_unchecked(ptr)
        };

        Ok(Self {
            dimension,
            data,
            layout,
        })
    }

    #[inline]
    pub fn dimension(&self) -> u64 {
        self.dimension
    }

    #[inline]
    pub fn as_slice(&self) -> &[Complex64] {
        unsafe { std::slice::from_raw_parts(self.data.as_ptr(), self.dimension as usize) }
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [Complex64] {
        unsafe { std::slice::from_raw_parts_mut(self.data.as_ptr(), self.dimension as usize) }
    }

    #[inline]
    pub fn read(&self, index: u64) -> Complex64 {
        self.as_slice()[index as usize]
    }

    #[inline]
    pub fn write(&mut self, index: u64, value: Complex64) {
        self.as_mut_slice()[index as usize] = value;
    }

    pub fn clear(&mut self) {
        unsafe {
            std::ptr::write_bytes(self.data.as_ptr(), 0, self.dimension as usize);
        }
    }

    /// Swap the upper half of `self` with the lower half of `other`
    ///
    /// The pager's primitive for making an inter-page qubit act as each
    /// page's top intra-page qubit.
    pub fn shuffle(&mut self, other: &mut DenseStore) {
        debug_assert_eq!(self.dimension, other.dimension);
        let half = (self.dimension / 2) as usize;
        let hi = &mut self.as_mut_slice()[half..];
        let lo = &mut other.as_mut_slice()[..half];
        hi.swap_with_slice(lo);
    }
}

impl Drop for DenseStore {
    fn drop(&mut self) {
        unsafe {
            dealloc(self.data.as_ptr() as *mut u8, self.layout);
        }
    }
}

impl Clone for DenseStore {
    fn clone(&self) -> Self {
        let mut copy = Self::new(self.dimension).expect("clone allocation failed");
        copy.as_mut_slice().copy_from_slice(self.as_slice());
        copy
    }
}

// DenseStore owns its allocation exclusively.
unsafe impl Send for DenseStore {}
unsafe impl Sync for DenseStore {}

/// Sparse amplitude store over a hash map
///
/// Absent keys read as zero; writes whose squared magnitude falls below
/// the threshold remove the entry.
#[derive(Clone)]
pub struct SparseStore {
    dimension: u64,
    map: AHashMap<u64, Complex64>,
    threshold: f64,
}

impl SparseStore {
    pub fn new(dimension: u64, threshold: f64) -> Self {
        Self {
            dimension,
            map: AHashMap::new(),
            threshold,
        }
    }

    #[inline]
    pub fn dimension(&self) -> u64 {
        self.dimension
    }

    #[inline]
    pub fn read(&self, index: u64) -> Complex64 {
        self.map.get(&index).copied().unwrap_or(ZERO_CMPLX)
    }

    #[inline]
    pub fn write(&mut self, index: u64, value: Complex64) {
        if value.norm_sqr() <= self.threshold {
            self.map.remove(&index);
        } else {
            self.map.insert(index, value);
        }
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, Complex64)> + '_ {
        self.map.iter().map(|(&k, &v)| (k, v))
    }

    pub fn keys(&self) -> impl Iterator<Item = u64> + '_ {
        self.map.keys().copied()
    }

    /// Replace the contents wholesale; entries below threshold are kept out
    pub fn replace(&mut self, entries: AHashMap<u64, Complex64>) {
        self.map = entries;
        let threshold = self.threshold;
        self.map.retain(|_, v| v.norm_sqr() > threshold);
    }
}

/// The store behind an engine: dense array or sparse map
#[derive(Clone)]
pub enum StoreKind {
    Dense(DenseStore),
    Sparse(SparseStore),
}

impl StoreKind {
    pub fn new(dimension: u64, sparse: bool, threshold: f64) -> Result<Self> {
        if sparse {
            Ok(StoreKind::Sparse(SparseStore::new(dimension, threshold)))
        } else {
            Ok(StoreKind::Dense(DenseStore::new(dimension)?))
        }
    }

    #[inline]
    pub fn dimension(&self) -> u64 {
        match self {
            StoreKind::Dense(s) => s.dimension(),
            StoreKind::Sparse(s) => s.dimension(),
        }
    }

    #[inline]
    pub fn is_sparse(&self) -> bool {
        matches!(self, StoreKind::Sparse(_))
    }

    #[inline]
    pub fn read(&self, index: u64) -> Complex64 {
        match self {
            StoreKind::Dense(s) => s.read(index),
            StoreKind::Sparse(s) => s.read(index),
        }
    }

    #[inline]
    pub fn write(&mut self, index: u64, value: Complex64) {
        match self {
            StoreKind::Dense(s) => s.write(index, value),
            StoreKind::Sparse(s) => s.write(index, value),
        }
    }

    /// Write a 2×2-update pair atomically from the caller's view
    #[inline]
    pub fn write2(&mut self, i1: u64, c1: Complex64, i2: u64, c2: Complex64) {
        self.write(i1, c1);
        self.write(i2, c2);
    }

    pub fn clear(&mut self) {
        match self {
            StoreKind::Dense(s) => s.clear(),
            StoreKind::Sparse(s) => s.clear(),
        }
    }

    /// Copy `length` amplitudes starting at `offset` into `out`
    pub fn copy_out(&self, out: &mut [Complex64], offset: u64, length: u64) {
        match self {
            StoreKind::Dense(s) => {
                let src = &s.as_slice()[offset as usize..(offset + length) as usize];
                out[..length as usize].copy_from_slice(src);
            }
            StoreKind::Sparse(s) => {
                for (i, slot) in out.iter_mut().enumerate().take(length as usize) {
                    *slot = s.read(offset + i as u64);
                }
            }
        }
    }

    /// Overwrite amplitudes starting at `offset` from `src`
    pub fn copy_in(&mut self, src: &[Complex64], offset: u64) {
        match self {
            StoreKind::Dense(s) => {
                s.as_mut_slice()[offset as usize..offset as usize + src.len()]
                    .copy_from_slice(src);
            }
            StoreKind::Sparse(s) => {
                for (i, &amp) in src.iter().enumerate() {
                    s.write(offset + i as u64, amp);
                }
            }
        }
    }

    /// Copy a window from another store
    pub fn copy_from(&mut self, other: &StoreKind, src_offset: u64, dst_offset: u64, length: u64) {
        for i in 0..length {
            self.write(dst_offset + i, other.read(src_offset + i));
        }
    }

    /// Swap the upper half of `self` with the lower half of `other`
    pub fn shuffle(&mut self, other: &mut StoreKind) {
        if let (StoreKind::Dense(a), StoreKind::Dense(b)) = (&mut *self, &mut *other) {
            a.shuffle(b);
            return;
        }

        let half = self.dimension() / 2;
        for i in 0..half {
            let hi = self.read(half + i);
            let lo = other.read(i);
            self.write(half + i, lo);
            other.write(i, hi);
        }
    }

    /// Squared magnitudes of every amplitude, in basis order
    pub fn probs_into(&self, out: &mut [f64]) {
        match self {
            StoreKind::Dense(s) => {
                for (slot, amp) in out.iter_mut().zip(s.as_slice()) {
                    *slot = amp.norm_sqr();
                }
            }
            StoreKind::Sparse(s) => {
                out.fill(0.0);
                for (k, v) in s.iter() {
                    out[k as usize] = v.norm_sqr();
                }
            }
        }
    }

    /// Total squared norm, single-threaded
    pub fn norm_sqr_serial(&self) -> f64 {
        match self {
            StoreKind::Dense(s) => s.as_slice().iter().map(|a| a.norm_sqr()).sum(),
            StoreKind::Sparse(s) => s.iter().map(|(_, v)| v.norm_sqr()).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_dense_store_zeroed() {
        let store = DenseStore::new(8).unwrap();
        for i in 0..8 {
            assert_eq!(store.read(i), ZERO_CMPLX);
        }
    }

    #[test]
    fn test_dense_alignment() {
        let store = DenseStore::new(4).unwrap();
        assert_eq!(store.as_slice().as_ptr() as usize % STORE_ALIGNMENT, 0);
    }

    #[test]
    fn test_dense_shuffle() {
        let mut a = DenseStore::new(4).unwrap();
        let mut b = DenseStore::new(4).unwrap();
        for i in 0..4 {
            a.write(i, Complex64::new(i as f64, 0.0));
            b.write(i, Complex64::new(10.0 + i as f64, 0.0));
        }
        a.shuffle(&mut b);
        // Upper half of a <-> lower half of b
        assert_eq!(a.read(2).re, 10.0);
        assert_eq!(a.read(3).re, 11.0);
        assert_eq!(b.read(0).re, 2.0);
        assert_eq!(b.read(1).re, 3.0);
        assert_eq!(a.read(0).re, 0.0);
        assert_eq!(b.read(2).re, 12.0);
    }

    #[test]
    fn test_sparse_reads_zero_for_missing() {
        let store = SparseStore::new(16, 1e-20);
        assert_eq!(store.read(5), ZERO_CMPLX);
    }

    #[test]
    fn test_sparse_drops_below_threshold() {
        let mut store = SparseStore::new(16, 1e-10);
        store.write(3, Complex64::new(1e-8, 0.0));
        assert!(store.is_empty());
        store.write(3, Complex64::new(0.5, 0.0));
        assert_eq!(store.len(), 1);
        store.write(3, ZERO_CMPLX);
        assert!(store.is_empty());
    }

    #[test]
    fn test_store_kind_shuffle_mixed() {
        let mut a = StoreKind::new(4, true, 1e-20).unwrap();
        let mut b = StoreKind::new(4, false, 1e-20).unwrap();
        a.write(3, Complex64::new(1.0, 0.0));
        b.write(0, Complex64::new(2.0, 0.0));
        a.shuffle(&mut b);
        assert_eq!(a.read(3).re, 0.0);
        assert_eq!(b.read(1).re, 1.0);
        assert_eq!(a.read(2).re, 2.0);
    }

    #[test]
    fn test_probs_into() {
        let mut store = StoreKind::new(4, false, 1e-20).unwrap();
        store.write(1, Complex64::new(0.6, 0.0));
        store.write(2, Complex64::new(0.0, 0.8));
        let mut probs = [0.0; 4];
        store.probs_into(&mut probs);
        assert_relative_eq!(probs[1], 0.36, epsilon = 1e-12);
        assert_relative_eq!(probs[2], 0.64, epsilon = 1e-12);
        assert_relative_eq!(store.norm_sqr_serial(), 1.0, epsilon = 1e-12);
    }
}
