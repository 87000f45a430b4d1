//! Named fixed-size object pools.
//!
//! A pool hands out `object_size`-byte slots and parks released slots on an
//! available stack for reuse, so create/destroy churn of short-lived objects
//! does not hit the allocator every time. The stack sits under a pool-local
//! lock; global byte accounting rides the shared [`Accounting`] atomics.

use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use ahash::AHashSet as HashSet;

use super::{raw_alloc, raw_dealloc, Accounting};
use crate::error::MemoryError;

/// Pool slots are at least word-aligned; larger objects get 16 so SIMD-ish
/// payloads are safe to place in them.
const SLOT_ALIGN: usize = 16;

/// Opaque handle to one pool slot, returned by [`Pool::acquire`].
#[derive(Debug)]
pub struct PoolSlot {
    ptr: NonNull<u8>,
    size: usize,
}

// SAFETY: a slot exclusively owns its region until released.
unsafe impl Send for PoolSlot {}

impl PoolSlot {
    /// Base address of the slot.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Slot size in bytes (the pool's object size).
    #[inline]
    pub fn len(&self) -> usize {
        self.size
    }

    /// Always `false`; pools never hand out zero-sized slots.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

struct Block(NonNull<u8>);

// SAFETY: blocks are plain owned byte regions.
unsafe impl Send for Block {}

struct PoolState {
    available: Vec<Block>,
    outstanding: HashSet<usize>,
}

/// Per-pool usage figures reported through
/// [`MemoryUsage`](super::MemoryUsage).
#[derive(Debug, Clone, Default)]
pub struct PoolUsage {
    /// Slots currently handed out.
    pub in_use: usize,
    /// Slots parked on the available stack.
    pub available: usize,
    /// `hits / (hits + misses)`; 0 when nothing was acquired yet.
    pub hit_rate: f64,
}

/// A named pool of fixed-size slots. Obtained from
/// [`MemoryManager::get_pool`](super::MemoryManager::get_pool).
pub struct Pool {
    name: String,
    layout: Layout,
    state: Mutex<PoolState>,
    high_water: AtomicUsize,
    hits: AtomicU64,
    misses: AtomicU64,
    acct: Arc<Accounting>,
}

impl Pool {
    pub(crate) fn new(
        name: &str,
        object_size: usize,
        initial_capacity: usize,
        acct: Arc<Accounting>,
    ) -> Result<Pool, MemoryError> {
        let object_size = object_size.max(1);
        let align = if object_size >= SLOT_ALIGN {
            SLOT_ALIGN
        } else {
            std::mem::align_of::<usize>()
        };
        let layout = Layout::from_size_align(object_size, align)
            .map_err(|_| MemoryError::BadAlignment(align))?;

        let mut available = Vec::with_capacity(initial_capacity);
        for _ in 0..initial_capacity {
            match raw_alloc(&acct, layout) {
                Ok(ptr) => {
                    acct.reserve(layout.size());
                    available.push(Block(ptr));
                }
                Err(err) => {
                    for block in available.drain(..) {
                        acct.unreserve(layout.size());
                        raw_dealloc(&acct, block.0, layout);
                    }
                    return Err(err);
                }
            }
        }

        Ok(Pool {
            name: name.into(),
            layout,
            state: Mutex::new(PoolState {
                available,
                outstanding: HashSet::new(),
            }),
            high_water: AtomicUsize::new(initial_capacity.max(64)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            acct,
        })
    }

    /// The pool's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The fixed slot size in bytes.
    pub fn object_size(&self) -> usize {
        self.layout.size()
    }

    /// Sets the available-stack depth above which released slots are freed
    /// instead of retained.
    pub fn set_high_water(&self, slots: usize) {
        self.high_water.store(slots, Ordering::Relaxed);
    }

    /// Takes a slot from the pool: pops the available stack when it has one
    /// (a hit), otherwise allocates a fresh block (a miss).
    pub fn acquire(&self) -> Result<PoolSlot, MemoryError> {
        let mut state = self.state.lock().expect("pool state poisoned");
        let ptr = match state.available.pop() {
            Some(block) => {
                self.acct.unreserve(self.layout.size());
                self.hits.fetch_add(1, Ordering::Relaxed);
                block.0
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                raw_alloc(&self.acct, self.layout)?
            }
        };
        state.outstanding.insert(ptr.as_ptr() as usize);
        Ok(PoolSlot {
            ptr,
            size: self.layout.size(),
        })
    }

    /// Returns a slot to the pool. Retains it on the available stack up to
    /// the high-water mark, frees it beyond that. Fails with `InvalidHandle`
    /// on double release or a slot from another pool.
    pub fn release(&self, slot: PoolSlot) -> Result<(), MemoryError> {
        if slot.size != self.layout.size() {
            return Err(MemoryError::InvalidHandle);
        }
        let mut state = self.state.lock().expect("pool state poisoned");
        if !state.outstanding.remove(&(slot.ptr.as_ptr() as usize)) {
            return Err(MemoryError::InvalidHandle);
        }
        if state.available.len() < self.high_water.load(Ordering::Relaxed) {
            self.acct.reserve(self.layout.size());
            state.available.push(Block(slot.ptr));
        } else {
            raw_dealloc(&self.acct, slot.ptr, self.layout);
        }
        Ok(())
    }

    /// Current usage figures.
    pub fn usage(&self) -> PoolUsage {
        let state = self.state.lock().expect("pool state poisoned");
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        PoolUsage {
            in_use: state.outstanding.len(),
            available: state.available.len(),
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
        }
    }

    /// Frees every block the pool owns, outstanding ones included. Used by
    /// pool destruction and `force_cleanup`; callers must ensure no
    /// outstanding slot is dereferenced afterwards.
    pub(crate) fn drain_all(&self) {
        let mut state = self.state.lock().expect("pool state poisoned");
        for block in state.available.drain(..) {
            self.acct.unreserve(self.layout.size());
            raw_dealloc(&self.acct, block.0, self.layout);
        }
        for address in state.outstanding.drain() {
            // SAFETY: outstanding only holds addresses from `raw_alloc`
            // blocks handed out by this pool and not yet released.
            let ptr = unsafe { NonNull::new_unchecked(address as *mut u8) };
            raw_dealloc(&self.acct, ptr, self.layout);
        }
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.drain_all();
    }
}
