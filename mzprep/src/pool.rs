//! A fixed pool of preprocessing scratch buffers.
//!
//! The pool is the concurrency throttle: there are exactly as many
//! buffer sets as workers, every dispatch must hold one, and a set is
//! returned on every exit path by the [`BufferLease`] guard.

use std::collections::TryReserveError;
use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex};

use crossbeam_channel::{bounded, Receiver, Sender};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Failed to allocate {requested} fragment bins per buffer set: {source}")]
    OutOfMemory {
        requested: usize,
        #[source]
        source: TryReserveError,
    },
    #[error("A buffer pool needs at least one buffer set")]
    ZeroCapacity,
    #[error("A buffer set needs at least one fragment bin")]
    ZeroBins,
}

fn zeroed_bins(len: usize) -> Result<Box<[f64]>, PoolError> {
    let mut bins = Vec::new();
    bins.try_reserve_exact(len)
        .map_err(|source| PoolError::OutOfMemory {
            requested: len,
            source,
        })?;
    bins.resize(len, 0.0);
    Ok(bins.into_boxed_slice())
}

/// The four scratch arrays one preprocessing pass works through, all
/// sized to the pool's bin capacity
#[derive(Debug)]
pub struct BufferSet {
    /// Square-rooted, binned peak intensities
    pub raw: Box<[f64]>,
    /// Regionally normalized correlation data
    pub corr: Box<[f64]>,
    /// Smoothed correlation data
    pub smoothed: Box<[f64]>,
    /// Peak-extracted correlation data
    pub extracted: Box<[f64]>,
}

impl BufferSet {
    fn allocate(bin_capacity: usize) -> Result<Self, PoolError> {
        Ok(Self {
            raw: zeroed_bins(bin_capacity)?,
            corr: zeroed_bins(bin_capacity)?,
            smoothed: zeroed_bins(bin_capacity)?,
            extracted: zeroed_bins(bin_capacity)?,
        })
    }

    pub fn bin_capacity(&self) -> usize {
        self.raw.len()
    }

    /// Zero every array. Called at the start of each dispatch so a
    /// reused set never leaks the previous spectrum.
    pub fn clear(&mut self) {
        self.raw.fill(0.0);
        self.corr.fill(0.0);
        self.smoothed.fill(0.0);
        self.extracted.fill(0.0);
    }
}

/// A fixed-size pool of [`BufferSet`]s backed by a bounded free list.
///
/// `acquire` blocks while every set is out on loan, which is what caps
/// the number of spectra being preprocessed at once.
pub struct BufferPool {
    free_tx: Sender<BufferSet>,
    free_rx: Receiver<BufferSet>,
    capacity: usize,
    bin_capacity: usize,
    in_use: Mutex<usize>,
    returned: Condvar,
}

impl BufferPool {
    /// Allocate `capacity` buffer sets of `bin_capacity` bins each.
    /// Allocation failure is reported, not aborted on.
    pub fn allocate(capacity: usize, bin_capacity: usize) -> Result<Self, PoolError> {
        if capacity == 0 {
            return Err(PoolError::ZeroCapacity);
        }
        if bin_capacity == 0 {
            return Err(PoolError::ZeroBins);
        }
        let (free_tx, free_rx) = bounded(capacity);
        for _ in 0..capacity {
            let set = BufferSet::allocate(bin_capacity)?;
            if free_tx.send(set).is_err() {
                return Err(PoolError::ZeroCapacity);
            }
        }
        Ok(Self {
            free_tx,
            free_rx,
            capacity,
            bin_capacity,
            in_use: Mutex::new(0),
            returned: Condvar::new(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn bin_capacity(&self) -> usize {
        self.bin_capacity
    }

    /// Number of sets currently out on loan
    pub fn in_use(&self) -> usize {
        *self.in_use.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Take a buffer set, blocking until one is free
    pub fn acquire(&self) -> BufferLease<'_> {
        let set = self
            .free_rx
            .recv()
            .unwrap_or_else(|_| unreachable!("the pool holds its own free-list sender"));
        {
            let mut in_use = self.in_use.lock().unwrap_or_else(|e| e.into_inner());
            *in_use += 1;
        }
        BufferLease {
            pool: self,
            set: Some(set),
        }
    }

    fn release(&self, set: BufferSet) {
        // Give the loan back before re-queuing the set. The other order
        // lets a concurrent `acquire` observe `in_use` above capacity.
        {
            let mut in_use = self.in_use.lock().unwrap_or_else(|e| e.into_inner());
            *in_use = in_use.saturating_sub(1);
            self.returned.notify_all();
        }
        // The free list was sized to hold every set, so this cannot block
        self.free_tx
            .send(set)
            .unwrap_or_else(|_| unreachable!("the pool holds its own free-list receiver"));
    }

    /// Park until every set has come home
    pub fn wait_until_idle(&self) {
        let mut in_use = self.in_use.lock().unwrap_or_else(|e| e.into_inner());
        while *in_use > 0 {
            in_use = self
                .returned
                .wait(in_use)
                .unwrap_or_else(|e| e.into_inner());
        }
    }
}

/// Exclusive loan of a [`BufferSet`], returned to the pool on drop no
/// matter how the borrower exits
pub struct BufferLease<'a> {
    pool: &'a BufferPool,
    set: Option<BufferSet>,
}

impl Deref for BufferLease<'_> {
    type Target = BufferSet;

    fn deref(&self) -> &Self::Target {
        self.set.as_ref().unwrap_or_else(|| unreachable!("lease emptied only on drop"))
    }
}

impl DerefMut for BufferLease<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.set.as_mut().unwrap_or_else(|| unreachable!("lease emptied only on drop"))
    }
}

impl Drop for BufferLease<'_> {
    fn drop(&mut self) {
        if let Some(set) = self.set.take() {
            self.pool.release(set);
        }
    }
}
