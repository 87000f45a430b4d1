//! Pooled memory and raw aligned allocation.
//!
//! Everything the core allocates outside of ordinary collections goes
//! through a [`MemoryManager`]: named fixed-size object pools for churny
//! short-lived objects, plus raw aligned blocks for one-off buffers. The
//! manager keeps global accounting (allocated / used / reserved), enforces
//! an optional hard limit, fires usage-threshold warnings, and can record
//! live allocations for leak reports.

pub mod pool;

pub use self::pool::{Pool, PoolSlot, PoolUsage};

use std::alloc::{self, Layout};
use std::panic::Location;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use ahash::AHashMap as HashMap;
use log::warn;

use crate::error::MemoryError;

/// Global allocation accounting, shared between the manager and its pools.
///
/// `used` is the number of live bytes; the limit (0 = unlimited) caps it.
#[derive(Debug, Default)]
pub(crate) struct Accounting {
    allocated_total: AtomicU64,
    used: AtomicUsize,
    reserved: AtomicUsize,
    allocations: AtomicU64,
    deallocations: AtomicU64,
    limit: AtomicUsize,
}

impl Accounting {
    /// Reserves `size` bytes against the limit, or fails without touching
    /// any counter.
    fn charge(&self, size: usize) -> Result<(), MemoryError> {
        loop {
            let used = self.used.load(Ordering::Acquire);
            let limit = self.limit.load(Ordering::Acquire);
            if limit != 0 && used + size > limit {
                return Err(MemoryError::MemoryLimitExceeded {
                    requested: size,
                    limit,
                    used,
                });
            }
            if self
                .used
                .compare_exchange(used, used + size, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.allocated_total.fetch_add(size as u64, Ordering::Relaxed);
                self.allocations.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
        }
    }

    fn release(&self, size: usize) {
        self.used.fetch_sub(size, Ordering::AcqRel);
        self.deallocations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn reserve(&self, size: usize) {
        self.reserved.fetch_add(size, Ordering::Relaxed);
    }

    pub(crate) fn unreserve(&self, size: usize) {
        self.reserved.fetch_sub(size, Ordering::Relaxed);
    }

    pub(crate) fn used_bytes(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }
}

/// Allocates a block through the shared accounting; all pool blocks and raw
/// allocations come from here so usage figures add up.
pub(crate) fn raw_alloc(acct: &Accounting, layout: Layout) -> Result<NonNull<u8>, MemoryError> {
    acct.charge(layout.size())?;
    // SAFETY: `layout` has a non-zero size; callers only build layouts for
    // sized requests.
    let ptr = unsafe { alloc::alloc(layout) };
    match NonNull::new(ptr) {
        Some(ptr) => Ok(ptr),
        None => alloc::handle_alloc_error(layout),
    }
}

/// Returns a block obtained from [`raw_alloc`].
pub(crate) fn raw_dealloc(acct: &Accounting, ptr: NonNull<u8>, layout: Layout) {
    // SAFETY: `ptr` came from `raw_alloc` with the same layout.
    unsafe { alloc::dealloc(ptr.as_ptr(), layout) };
    acct.release(layout.size());
}

/// Opaque handle to a raw allocation. The region stays valid until the
/// handle is passed back to [`MemoryManager::deallocate`].
#[derive(Debug)]
pub struct AllocHandle {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the handle exclusively owns its region; moving it between threads
// moves ownership of plain bytes.
unsafe impl Send for AllocHandle {}

impl AllocHandle {
    /// Base address of the region.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Usable size of the region in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.layout.size()
    }

    /// Returns `true` for zero-sized handles (never produced by `allocate`).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }
}

/// One still-live allocation in a leak report.
#[derive(Debug, Clone)]
pub struct LeakRecord {
    /// Base address of the allocation.
    pub address: usize,
    /// Size in bytes.
    pub size: usize,
    /// When the allocation happened.
    pub allocated_at: Instant,
    /// Source location of the allocating call.
    pub call_site: &'static Location<'static>,
}

struct LiveAlloc {
    layout: Layout,
    leak: Option<(Instant, &'static Location<'static>)>,
}

/// A snapshot of current memory usage.
#[derive(Debug, Clone, Default)]
pub struct MemoryUsage {
    /// Cumulative bytes ever allocated.
    pub allocated: u64,
    /// Live bytes right now.
    pub used: usize,
    /// Bytes parked in pool available-stacks, ready for reuse.
    pub reserved: usize,
    /// Per-pool usage keyed by pool name.
    pub pools: std::collections::HashMap<String, PoolUsage>,
}

/// Collector statistics surface.
///
/// This build manages memory manually, so `num_gc` stays 0 and the advisory
/// GC hooks do not collect anything; the figures are driven by the
/// allocator's own accounting so dashboards stay consistent.
#[derive(Debug, Clone, Default)]
pub struct GcStats {
    /// Number of collection cycles run (always 0 here).
    pub num_gc: u64,
    /// Total collector pause time (always zero here).
    pub total_pause: Duration,
    /// Live heap bytes, mirroring `MemoryUsage::used`.
    pub heap_size: usize,
    /// The advisory threshold last set via `set_gc_threshold`.
    pub gc_threshold: usize,
}

type WarningCallback = Box<dyn Fn(usize, usize, f64) + Send + Sync>;

struct WarningEntry {
    threshold: f64,
    fired: bool,
    callback: WarningCallback,
}

/// Typed object pooling and raw aligned allocation with usage accounting.
///
/// All operations are safe under concurrent callers. See the module docs.
pub struct MemoryManager {
    acct: Arc<Accounting>,
    pools: RwLock<HashMap<String, Arc<Pool>>>,
    live: Mutex<HashMap<usize, LiveAlloc>>,
    warnings: Mutex<Vec<WarningEntry>>,
    leak_detection: AtomicBool,
    gc_threshold: AtomicUsize,
}

impl Default for MemoryManager {
    fn default() -> Self {
        MemoryManager {
            acct: Arc::new(Accounting::default()),
            pools: RwLock::new(HashMap::new()),
            live: Mutex::new(HashMap::new()),
            warnings: Mutex::new(Vec::new()),
            leak_detection: AtomicBool::new(false),
            gc_threshold: AtomicUsize::new(0),
        }
    }
}

impl MemoryManager {
    /// Creates a manager with no limit and leak detection off.
    pub fn new() -> Self {
        Default::default()
    }

    /// Registers a named pool of `object_size`-byte slots, pre-populating
    /// `initial_capacity` of them.
    pub fn create_pool(
        &self,
        name: &str,
        object_size: usize,
        initial_capacity: usize,
    ) -> Result<(), MemoryError> {
        let mut pools = self.pools.write().expect("pool registry poisoned");
        if pools.contains_key(name) {
            return Err(MemoryError::PoolAlreadyExists(name.into()));
        }
        let pool = Pool::new(name, object_size, initial_capacity, self.acct.clone())?;
        pools.insert(name.into(), Arc::new(pool));
        Ok(())
    }

    /// Destroys a pool, freeing every slot it owns. Outstanding slots must
    /// not be dereferenced afterwards.
    pub fn destroy_pool(&self, name: &str) -> Result<(), MemoryError> {
        let mut pools = self.pools.write().expect("pool registry poisoned");
        let pool = pools
            .remove(name)
            .ok_or_else(|| MemoryError::PoolNotFound(name.into()))?;
        pool.drain_all();
        Ok(())
    }

    /// Returns a handle to a named pool.
    pub fn get_pool(&self, name: &str) -> Result<Arc<Pool>, MemoryError> {
        let pools = self.pools.read().expect("pool registry poisoned");
        pools
            .get(name)
            .cloned()
            .ok_or_else(|| MemoryError::PoolNotFound(name.into()))
    }

    /// Allocates `size` bytes at the platform's word alignment.
    #[track_caller]
    pub fn allocate(&self, size: usize) -> Result<AllocHandle, MemoryError> {
        self.allocate_aligned(size, std::mem::align_of::<usize>())
    }

    /// Allocates `size` bytes whose address is a multiple of `alignment`
    /// (which must be a power of two).
    #[track_caller]
    pub fn allocate_aligned(
        &self,
        size: usize,
        alignment: usize,
    ) -> Result<AllocHandle, MemoryError> {
        if alignment == 0 || !alignment.is_power_of_two() {
            return Err(MemoryError::BadAlignment(alignment));
        }
        let size = size.max(1);
        let layout = Layout::from_size_align(size, alignment)
            .map_err(|_| MemoryError::BadAlignment(alignment))?;

        let call_site = Location::caller();
        let ptr = raw_alloc(&self.acct, layout)?;

        let leak = self
            .leak_detection
            .load(Ordering::Relaxed)
            .then(|| (Instant::now(), call_site));
        self.live
            .lock()
            .expect("live allocation table poisoned")
            .insert(ptr.as_ptr() as usize, LiveAlloc { layout, leak });

        self.check_warnings();
        Ok(AllocHandle { ptr, layout })
    }

    /// Returns a block to the allocator. Fails with `InvalidHandle` if the
    /// handle is not live (e.g. double release).
    pub fn deallocate(&self, handle: AllocHandle) -> Result<(), MemoryError> {
        let removed = self
            .live
            .lock()
            .expect("live allocation table poisoned")
            .remove(&(handle.ptr.as_ptr() as usize));
        match removed {
            Some(live) if live.layout == handle.layout => {
                raw_dealloc(&self.acct, handle.ptr, handle.layout);
                self.rearm_warnings();
                Ok(())
            }
            Some(live) => {
                // Layout mismatch means the handle was tampered with; put
                // the record back and refuse.
                self.live
                    .lock()
                    .expect("live allocation table poisoned")
                    .insert(handle.ptr.as_ptr() as usize, live);
                Err(MemoryError::InvalidHandle)
            }
            None => Err(MemoryError::InvalidHandle),
        }
    }

    /// Caps live usage at `bytes`; 0 removes the cap. Allocations that would
    /// exceed it fail with `MemoryLimitExceeded`.
    pub fn set_memory_limit(&self, bytes: usize) {
        self.acct.limit.store(bytes, Ordering::Release);
    }

    /// Registers a callback fired once when `used / limit` crosses
    /// `threshold` (clamped to `[0, 1]`). Re-arms when usage drops back
    /// under the threshold.
    pub fn register_memory_warning<F>(&self, threshold: f64, callback: F)
    where
        F: Fn(usize, usize, f64) + Send + Sync + 'static,
    {
        let threshold = threshold.clamp(0.0, 1.0);
        self.warnings
            .lock()
            .expect("warning registry poisoned")
            .push(WarningEntry {
                threshold,
                fired: false,
                callback: Box::new(callback),
            });
    }

    fn usage_ratio(&self) -> Option<(usize, usize, f64)> {
        let limit = self.acct.limit.load(Ordering::Acquire);
        if limit == 0 {
            return None;
        }
        let used = self.acct.used.load(Ordering::Acquire);
        Some((used, limit, used as f64 / limit as f64))
    }

    fn check_warnings(&self) {
        let Some((used, limit, ratio)) = self.usage_ratio() else {
            return;
        };
        let mut to_fire = Vec::new();
        {
            let mut warnings = self.warnings.lock().expect("warning registry poisoned");
            for entry in warnings.iter_mut() {
                if !entry.fired && ratio >= entry.threshold {
                    entry.fired = true;
                    to_fire.push(entry.threshold);
                }
            }
        }
        // Callbacks run outside the registry lock so they may allocate.
        if !to_fire.is_empty() {
            warn!(
                "memory usage at {:.0}% of limit ({} of {} bytes)",
                ratio * 100.0,
                used,
                limit
            );
            let warnings = self.warnings.lock().expect("warning registry poisoned");
            for entry in warnings.iter() {
                if to_fire.contains(&entry.threshold) {
                    (entry.callback)(used, limit, entry.threshold);
                }
            }
        }
    }

    fn rearm_warnings(&self) {
        let ratio = match self.usage_ratio() {
            Some((_, _, r)) => r,
            None => return,
        };
        let mut warnings = self.warnings.lock().expect("warning registry poisoned");
        for entry in warnings.iter_mut() {
            if entry.fired && ratio < entry.threshold {
                entry.fired = false;
            }
        }
    }

    /// Current global and per-pool usage figures.
    pub fn get_memory_usage(&self) -> MemoryUsage {
        let pools = self.pools.read().expect("pool registry poisoned");
        MemoryUsage {
            allocated: self.acct.allocated_total.load(Ordering::Relaxed),
            used: self.acct.used.load(Ordering::Acquire),
            reserved: self.acct.reserved.load(Ordering::Relaxed),
            pools: pools
                .iter()
                .map(|(name, pool)| (name.clone(), pool.usage()))
                .collect(),
        }
    }

    /// Turns allocation-site recording on or off. Only allocations made
    /// while enabled carry call-site data in the report.
    pub fn enable_leak_detection(&self, enabled: bool) {
        self.leak_detection.store(enabled, Ordering::Relaxed);
    }

    /// All raw allocations still live that were made with leak detection
    /// enabled.
    pub fn get_leak_report(&self) -> Vec<LeakRecord> {
        let live = self.live.lock().expect("live allocation table poisoned");
        live.iter()
            .filter_map(|(&address, alloc)| {
                alloc.leak.map(|(allocated_at, call_site)| LeakRecord {
                    address,
                    size: alloc.layout.size(),
                    allocated_at,
                    call_site,
                })
            })
            .collect()
    }

    /// Frees every live raw allocation and every pool slot. Outstanding
    /// handles must not be dereferenced afterwards.
    pub fn force_cleanup(&self) {
        let drained: Vec<(usize, LiveAlloc)> = {
            let mut live = self.live.lock().expect("live allocation table poisoned");
            live.drain().collect()
        };
        for (address, alloc) in drained {
            // SAFETY: the table only holds pointers from `raw_alloc`, and the
            // entry was just removed so nothing frees it twice.
            let ptr = unsafe { NonNull::new_unchecked(address as *mut u8) };
            raw_dealloc(&self.acct, ptr, alloc.layout);
        }
        let pools = self.pools.read().expect("pool registry poisoned");
        for pool in pools.values() {
            pool.drain_all();
        }
    }

    /// Sets the advisory collection threshold. No-op for this manual-memory
    /// build beyond being reported in [`GcStats`].
    pub fn set_gc_threshold(&self, bytes: usize) {
        self.gc_threshold.store(bytes, Ordering::Relaxed);
    }

    /// Advisory collection trigger; a no-op here. The stats surface stays
    /// consistent either way.
    pub fn trigger_gc(&self) {}

    /// Collector statistics (see [`GcStats`]).
    pub fn gc_stats(&self) -> GcStats {
        GcStats {
            num_gc: 0,
            total_pause: Duration::ZERO,
            heap_size: self.acct.used.load(Ordering::Acquire),
            gc_threshold: self.gc_threshold.load(Ordering::Relaxed),
        }
    }
}

impl Drop for MemoryManager {
    fn drop(&mut self) {
        self.force_cleanup();
    }
}
