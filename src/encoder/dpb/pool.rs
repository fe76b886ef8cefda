//! Reference-counted arena of reconstructed surfaces.
//!
//! A reconstructed frame stays alive while any DPB snapshot (session state,
//! a task's active or post-refresh DPB) or the task that produced it still
//! holds it. Slots store [`RecHandle`]s, so copying a DPB is cheap and the
//! pool decides when a surface can be reused.

use tracing::trace;

use crate::error::{EncodeError, Result};

use super::Dpb;

/// Index of a reconstructed surface in the [`FramePool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RecHandle(pub u16);

/// Fixed-size pool of reconstructed surfaces.
#[derive(Debug)]
pub struct FramePool {
    refcounts: Vec<u32>,
}

impl FramePool {
    pub fn new(size: usize) -> Self {
        Self {
            refcounts: vec![0; size],
        }
    }

    pub fn capacity(&self) -> usize {
        self.refcounts.len()
    }

    /// Surfaces currently referenced.
    pub fn in_use(&self) -> usize {
        self.refcounts.iter().filter(|&&c| c > 0).count()
    }

    pub fn refcount(&self, handle: RecHandle) -> u32 {
        self.refcounts.get(handle.0 as usize).copied().unwrap_or(0)
    }

    /// Takes a free surface with a reference count of one.
    pub fn acquire(&mut self) -> Result<RecHandle> {
        let idx = self
            .refcounts
            .iter()
            .position(|&c| c == 0)
            .ok_or_else(|| {
                EncodeError::MemoryAllocation(format!(
                    "all {} reconstructed surfaces are in use",
                    self.refcounts.len()
                ))
            })?;
        self.refcounts[idx] = 1;
        trace!(rec = idx, "acquired reconstructed surface");
        Ok(RecHandle(idx as u16))
    }

    pub fn retain(&mut self, handle: RecHandle) {
        if let Some(count) = self.refcounts.get_mut(handle.0 as usize) {
            *count += 1;
        }
    }

    /// Drops one reference. Returns true when the surface became free.
    pub fn release(&mut self, handle: RecHandle) -> bool {
        match self.refcounts.get_mut(handle.0 as usize) {
            Some(count) if *count > 0 => {
                *count -= 1;
                *count == 0
            }
            _ => false,
        }
    }

    /// Retains every occupied slot of `dpb`.
    pub fn retain_dpb(&mut self, dpb: &Dpb) {
        for frame in dpb.slots.iter().flatten() {
            self.retain(frame.rec);
        }
    }

    /// Releases every occupied slot of `dpb`.
    pub fn release_dpb(&mut self, dpb: &Dpb) {
        for frame in dpb.slots.iter().flatten() {
            self.release(frame.rec);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_until_exhausted() {
        let mut pool = FramePool::new(2);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_ne!(a, b);
        assert!(matches!(pool.acquire(), Err(EncodeError::MemoryAllocation(_))));

        assert!(pool.release(a));
        assert_eq!(pool.acquire().unwrap(), a);
    }

    #[test]
    fn test_refcounting() {
        let mut pool = FramePool::new(1);
        let a = pool.acquire().unwrap();
        pool.retain(a);
        assert_eq!(pool.refcount(a), 2);
        assert!(!pool.release(a));
        assert!(pool.release(a));
        assert!(!pool.release(a));
        assert_eq!(pool.in_use(), 0);
    }
}
