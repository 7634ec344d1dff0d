//! Storage for hash tables.
//!
//! Tables take everything they need at creation. Regular tables draw on
//! the heap; boot-time tables are carved out of a [`BootArena`], a fixed
//! region set aside once (or handed over as a `'static` buffer) and never
//! given back.

use alloc::alloc::{Layout, alloc, dealloc};
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::mem::{MaybeUninit, align_of, size_of};
use core::ops::{Deref, Range};
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicUsize, Ordering};

const ARENA_ALIGN: usize = 8;

/// Alignment of heap-backed arena regions.
const REGION_ALIGN: usize = 64;

/// A reservation did not fit in the remaining budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exhausted {
    pub requested: usize,
    pub remaining: usize,
}

impl fmt::Display for Exhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Arena exhausted: requested {} bytes, {} remaining",
            self.requested, self.remaining
        )
    }
}

impl core::error::Error for Exhausted {}

/// Where a table's storage comes from.
pub trait StoragePolicy {
    /// Set aside one block for `layout`. `Ok(None)` leaves the table to
    /// allocate its slots from the heap.
    fn allocate_block(&self, layout: Layout) -> Result<Option<ArenaBlock>, Exhausted>;

    fn name(&self) -> &'static str;
}

/// Regular heap storage. Allocation failures surface as the slots are built.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeapStorage;

impl StoragePolicy for HeapStorage {
    fn allocate_block(&self, _layout: Layout) -> Result<Option<ArenaBlock>, Exhausted> {
        Ok(None)
    }

    fn name(&self) -> &'static str {
        "heap"
    }
}

// =============================================================================
// Boot Arena
// =============================================================================

/// Backing memory of an arena.
pub(crate) struct Region {
    base: NonNull<u8>,
    len: usize,
    /// Layout to free with, for regions taken from the heap.
    owned: Option<Layout>,
}

// Blocks are handed out disjointly by the watermark; the region itself is
// never accessed through `Region`.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    fn empty() -> Self {
        Self {
            base: NonNull::dangling(),
            len: 0,
            owned: None,
        }
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        if let Some(layout) = self.owned {
            unsafe { dealloc(self.base.as_ptr(), layout) };
        }
    }
}

/// A block carved out of a [`BootArena`]. Keeps the arena's memory alive.
pub struct ArenaBlock {
    ptr: NonNull<u8>,
    len: usize,
    region: Arc<Region>,
}

impl ArenaBlock {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Address range of the block.
    pub fn addr_range(&self) -> Range<usize> {
        let start = self.ptr.as_ptr() as usize;
        start..start + self.len
    }
}

/// Bump allocator over a fixed boot-time region.
///
/// Allocations only move the watermark forward; nothing is ever freed.
pub struct BootArena {
    region: Arc<Region>,
    watermark: AtomicUsize,
}

impl BootArena {
    /// Reserve a `capacity`-byte region up front. If that fails the arena
    /// is empty and every allocation reports [`Exhausted`].
    pub fn new(capacity: usize) -> Self {
        let region = Layout::from_size_align(capacity, REGION_ALIGN)
            .ok()
            .filter(|l| l.size() > 0)
            .and_then(|layout| {
                let base = NonNull::new(unsafe { alloc(layout) })?;
                Some(Region {
                    base,
                    len: capacity,
                    owned: Some(layout),
                })
            })
            .unwrap_or_else(|| {
                if capacity > 0 {
                    warn!("Could not reserve a {} byte boot arena", capacity);
                }
                Region::empty()
            });
        Self::with_region(region)
    }

    /// Use a buffer that lives for the rest of the system's life, such as
    /// one placed in `.bss`.
    pub fn from_static(buf: &'static mut [MaybeUninit<u8>]) -> Self {
        let len = buf.len();
        let base = NonNull::new(buf.as_mut_ptr().cast::<u8>()).unwrap_or(NonNull::dangling());
        Self::with_region(Region {
            base,
            len,
            owned: None,
        })
    }

    fn with_region(region: Region) -> Self {
        Self {
            region: Arc::new(region),
            watermark: AtomicUsize::new(0),
        }
    }

    /// Carve `size` bytes (8-byte aligned) off the arena, returning their
    /// offsets in the region.
    pub fn allocate(&self, size: usize) -> Result<Range<usize>, Exhausted> {
        self.allocate_aligned(size, ARENA_ALIGN)
    }

    fn allocate_aligned(&self, size: usize, align: usize) -> Result<Range<usize>, Exhausted> {
        let base = self.region.base.as_ptr() as usize;
        let capacity = self.region.len;
        let mut cur = self.watermark.load(Ordering::Acquire);
        loop {
            let start = (base + cur).next_multiple_of(align.max(ARENA_ALIGN)) - base;
            let end = match start.checked_add(size) {
                Some(end) if end <= capacity => end,
                _ => {
                    return Err(Exhausted {
                        requested: size,
                        remaining: capacity.saturating_sub(cur),
                    });
                }
            };
            match self.watermark.compare_exchange_weak(
                cur,
                end,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(start..end),
                Err(actual) => cur = actual,
            }
        }
    }

    pub fn capacity(&self) -> usize {
        self.region.len
    }

    pub fn used(&self) -> usize {
        self.watermark.load(Ordering::Acquire)
    }

    pub fn remaining(&self) -> usize {
        self.capacity().saturating_sub(self.used())
    }

    /// Address range of the whole region.
    pub fn addr_range(&self) -> Range<usize> {
        let start = self.region.base.as_ptr() as usize;
        start..start + self.region.len
    }
}

impl fmt::Debug for BootArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BootArena")
            .field("capacity", &self.capacity())
            .field("used", &self.used())
            .finish()
    }
}

impl StoragePolicy for BootArena {
    fn allocate_block(&self, layout: Layout) -> Result<Option<ArenaBlock>, Exhausted> {
        let range = self.allocate_aligned(layout.size(), layout.align())?;
        // In bounds: `range` lies within the region.
        let ptr = unsafe { self.region.base.add(range.start) };
        Ok(Some(ArenaBlock {
            ptr,
            len: range.len(),
            region: self.region.clone(),
        }))
    }

    fn name(&self) -> &'static str {
        "boot arena"
    }
}

// =============================================================================
// Slots
// =============================================================================

/// A fixed array of table slots, on the heap or inside an arena block.
pub(crate) enum Slots<T> {
    Heap(Box<[T]>),
    Arena {
        ptr: NonNull<T>,
        len: usize,
        _region: Arc<Region>,
    },
}

unsafe impl<T: Send> Send for Slots<T> {}
unsafe impl<T: Sync> Sync for Slots<T> {}

impl<T> Slots<T> {
    /// Build `n` slots with `make`, at `offset` within `block` or, without
    /// a block, on the heap. `None` when memory runs out or the slots do
    /// not fit the block.
    pub(crate) fn new(
        block: Option<&ArenaBlock>,
        offset: usize,
        n: usize,
        make: impl Fn() -> T,
    ) -> Option<Self> {
        let Some(block) = block.filter(|_| n > 0) else {
            let mut v = Vec::new();
            v.try_reserve_exact(n).ok()?;
            v.extend((0..n).map(|_| make()));
            return Some(Slots::Heap(v.into_boxed_slice()));
        };

        let bytes = n.checked_mul(size_of::<T>())?;
        if offset.checked_add(bytes)? > block.len {
            return None;
        }
        let ptr = unsafe { block.ptr.add(offset) }.cast::<T>();
        if ptr.as_ptr() as usize % align_of::<T>() != 0 {
            return None;
        }
        for i in 0..n {
            unsafe { ptr.add(i).write(make()) };
        }
        Some(Slots::Arena {
            ptr,
            len: n,
            _region: block.region.clone(),
        })
    }
}

impl<T> Deref for Slots<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        match self {
            Slots::Heap(slots) => &slots[..],
            Slots::Arena { ptr, len, .. } => unsafe {
                core::slice::from_raw_parts(ptr.as_ptr(), *len)
            },
        }
    }
}

impl<T> Drop for Slots<T> {
    fn drop(&mut self) {
        if let Slots::Arena { ptr, len, .. } = self {
            unsafe { ptr::drop_in_place(ptr::slice_from_raw_parts_mut(ptr.as_ptr(), *len)) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocations_are_aligned_and_disjoint() {
        let arena = BootArena::new(64);
        let a = arena.allocate(3).unwrap();
        let b = arena.allocate(8).unwrap();
        assert_eq!(a, 0..3);
        assert_eq!(b, 8..16);
        assert_eq!(arena.used(), 16);
        assert_eq!(arena.remaining(), 48);
    }

    #[test]
    fn test_exhaustion_leaves_watermark() {
        let arena = BootArena::new(16);
        arena.allocate(10).unwrap();
        let err = arena.allocate(10).unwrap_err();
        assert_eq!(err.requested, 10);
        assert_eq!(err.remaining, 6);
        assert_eq!(arena.used(), 10);
    }

    #[test]
    fn test_slots_live_in_block() {
        let arena = BootArena::new(256);
        let block = arena
            .allocate_block(Layout::array::<u64>(8).unwrap())
            .unwrap()
            .unwrap();
        let slots = Slots::new(Some(&block), 0, 8, || 7u64).unwrap();
        let range = block.addr_range();
        assert!(range.contains(&(slots.as_ptr() as usize)));
        assert_eq!(&slots[..], &[7; 8]);

        // Past the end of the block.
        assert!(Slots::new(Some(&block), 8, 8, || 0u64).is_none());
    }

    #[test]
    fn test_static_region() {
        static mut BUF: [MaybeUninit<u8>; 128] = [MaybeUninit::uninit(); 128];
        let arena = BootArena::from_static(unsafe { &mut *core::ptr::addr_of_mut!(BUF) });
        assert_eq!(arena.capacity(), 128);
        let block = arena.allocate_block(Layout::new::<u64>()).unwrap().unwrap();
        assert!(arena.addr_range().contains(&block.addr_range().start));
        assert!(arena.allocate(200).is_err());
    }
}
