//! Buddy allocator with per-block link records in a flat block map.
//!
//! Where the [bitmap engine](crate::bitmap) spends one bit (or a few) per
//! block, this engine spends a whole [`BlockRecord`] per minimum-size slot
//! of the heap and gets two things back: finding a free block of any size
//! class is a single list operation instead of a bitmap scan, and a plain
//! [`free`](BuddyHeap::free) needs no size argument because the block's
//! leading record remembers its size class.
//!
//! A block of `2^k` slots occupies `block_map[i .. i + 2^k)`, with `i` a
//! multiple of `2^k`; only the leading record carries live metadata. Free
//! blocks of each size class form a circular doubly-linked ring threaded
//! through the records by index, with the ring head per class held in the
//! descriptor. Two free buddy blocks of the same class never coexist: the
//! release path merges them eagerly, exactly like the bitmap engine.

use core::mem;
use core::slice;

use log::{debug, trace};

use crate::bits;
use crate::memmap::{MemoryMap, RegionKind};
use crate::{CommitHook, InitError};

/// Link value meaning "not on any ring" / "empty ring".
const NIL: usize = usize::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockTag {
    Reserved,
    Free,
}

/// Per-slot metadata record of the block map.
///
/// Callers only ever handle these as opaque storage, e.g.
/// `[BlockRecord::default(); SLOTS]` passed through
/// [`BuddyHeapConfig::storage`].
#[derive(Debug, Clone, Copy)]
pub struct BlockRecord {
    tag: BlockTag,
    /// Size-class exponent; meaningful on a block's leading slot only.
    kval: u8,
    /// Forward/backward ring links, by block-map index; meaningful on a
    /// free block's leading slot only.
    linkf: usize,
    linkb: usize,
}

impl Default for BlockRecord {
    fn default() -> Self {
        Self {
            tag: BlockTag::Reserved,
            kval: 0,
            linkf: NIL,
            linkb: NIL,
        }
    }
}

/// Pre-init description of a [`BuddyHeap`], filled in by the caller.
pub struct BuddyHeapConfig<'a> {
    /// Storage for the block map. `None` asks [`init`](BuddyHeap::init) to
    /// carve it out of an available map region.
    pub storage: Option<&'a mut [BlockRecord]>,
    /// The smallest unit of allocation, in bytes.
    pub block_size: usize,
    /// Base address the heap serves; all map locations and all returned
    /// addresses are relative to it.
    pub offset: usize,
}

/// The pointer-linked buddy allocator.
pub struct BuddyHeap<'a> {
    /// Ring head per size class, `NIL` when the class has no free blocks.
    avail: [usize; bits::WORD_BITS],
    block_map: &'a mut [BlockRecord],
    max_kval: u32,
    block_size: usize,
    offset: usize,
    free_blocks: usize,
}

impl<'a> BuddyHeap<'a> {
    /// Bytes of block-map storage required for the memory described by
    /// `map` at the given block size, rounded up to a power of two.
    ///
    /// Returns 0 for a degenerate configuration; [`init`](Self::init)
    /// reports the precise error.
    pub fn size_needed<const N: usize>(map: &MemoryMap<N>, block_size: usize) -> usize {
        let memory_size = match map.memory_size() {
            Some(size) => size,
            None => return 0,
        };
        if block_size == 0 {
            return 0;
        }
        let raw = mem::size_of::<BlockRecord>() * (memory_size / block_size);
        raw.next_power_of_two()
    }

    /// Build a heap from `config` and the regions recorded in `map`.
    ///
    /// When [`storage`](BuddyHeapConfig::storage) is `None`, the block map
    /// is carved out of the first available region large enough to hold it,
    /// reinserted into `map` as unavailable, and reported to `commit`
    /// before first write. Every remaining available region is then fed
    /// into the free rings slot by slot, merging as it goes.
    ///
    /// # Safety
    ///
    /// If the block map is carved from the map, every available region must
    /// describe memory at `offset + location` that is valid for reads and
    /// writes for `'a` and not aliased for that lifetime. With preallocated
    /// `storage` the heap is pure accounting and no memory in the map is
    /// touched.
    pub unsafe fn init<const N: usize>(
        config: BuddyHeapConfig<'a>,
        map: &mut MemoryMap<N>,
        mut commit: CommitHook<'_>,
    ) -> Result<Self, InitError> {
        let BuddyHeapConfig {
            storage,
            block_size,
            offset,
        } = config;

        if block_size == 0 {
            return Err(InitError::InvalidBlockSize);
        }
        map.memory_size().ok_or(InitError::InsufficientMemory)?;

        let record_size = mem::size_of::<BlockRecord>();
        let map_size = Self::size_needed(map, block_size);
        let slots = map_size / record_size;
        if slots == 0 {
            return Err(InitError::InsufficientMemory);
        }

        let block_map: &'a mut [BlockRecord] = match storage {
            Some(storage) => {
                if storage.len() < slots {
                    return Err(InitError::InsufficientMemory);
                }
                let records = &mut storage[..slots];
                records.fill(BlockRecord::default());
                records
            }
            None => {
                let (address, location) = Self::find_carve(map, offset, map_size)?;
                map.insert(location, map_size, RegionKind::Unavailable)?;
                if let Some(hook) = commit.as_mut() {
                    hook(address, map_size)?;
                }
                debug!("buddy heap: block map carved at {address:#x} ({map_size} bytes)");
                let base = address as *mut BlockRecord;
                // SAFETY: the caller guarantees the available region this
                // range was found in is valid, exclusive memory for 'a; the
                // address was aligned by the carve search and the range was
                // re-registered as unavailable above. Every record is
                // written before the slice is formed.
                for i in 0..slots {
                    base.add(i).write(BlockRecord::default());
                }
                slice::from_raw_parts_mut(base, slots)
            }
        };

        let mut heap = BuddyHeap {
            avail: [NIL; bits::WORD_BITS],
            block_map,
            max_kval: bits::ceil_log2(slots),
            block_size,
            offset,
            free_blocks: 0,
        };

        for region in map.regions() {
            if region.kind != RegionKind::Available {
                continue;
            }
            // Clamp to whole blocks inside the region.
            let mut location = region.location + heap.block_size - 1;
            location -= location % heap.block_size;
            let region_end = region.location + region.size;
            while location + heap.block_size <= region_end {
                heap.insert_block(location / heap.block_size, 0);
                location += heap.block_size;
            }
        }
        debug!(
            "buddy heap: {} slots, max order {}, {} free blocks",
            slots, heap.max_kval, heap.free_blocks
        );
        Ok(heap)
    }

    /// Reserve a block of at least `size` bytes.
    ///
    /// The request is rounded up to the next power-of-two multiple of the
    /// block size. Returns the block's address (`offset`-relative; 0 is a
    /// valid address) or `None` when no block of the rounded size is free.
    pub fn reserve(&mut self, size: usize) -> Option<usize> {
        if size == 0 {
            return None;
        }
        let k = bits::ceil_log2((size - 1) / self.block_size + 1);
        for class in k..=self.max_kval {
            if self.avail[class as usize] == NIL {
                continue;
            }
            // Take the tail of the first populated ring, then split back
            // down to the requested class, parking each upper half on its
            // (empty) ring along the way.
            let index = self.block_map[self.avail[class as usize]].linkb;
            self.unlink(class, index);
            self.block_map[index].tag = BlockTag::Reserved;
            let mut class = class;
            while class > k {
                class -= 1;
                let buddy = index + (1usize << class);
                self.block_map[buddy].tag = BlockTag::Free;
                self.block_map[buddy].kval = class as u8;
                self.push_front(class, buddy);
                self.block_map[index].kval = class as u8;
            }
            self.free_blocks -= 1usize << k;
            let address = self.offset + index * self.block_size;
            trace!("buddy heap: reserved {size} bytes at {address:#x}");
            return Some(address);
        }
        trace!("buddy heap: out of {size}-byte blocks");
        None
    }

    /// Release the block at `location`, recovering its size class from the
    /// block map.
    ///
    /// `location` must have been returned by [`reserve`](Self::reserve) and
    /// not yet freed.
    pub fn free(&mut self, location: usize) {
        let index = (location - self.offset) / self.block_size;
        let k = self.block_map[index].kval as u32;
        debug_assert_eq!(self.block_map[index].tag, BlockTag::Reserved);
        self.insert_block(index, k);
        trace!("buddy heap: freed block at {location:#x}");
    }

    /// Release the block at `location` whose size the caller remembers.
    ///
    /// Skips the block-map read of [`free`](Self::free); `size` must be the
    /// reserved block's rounded size.
    pub fn free_size(&mut self, location: usize, size: usize) {
        let index = (location - self.offset) / self.block_size;
        let k = bits::ceil_log2(size / self.block_size);
        self.insert_block(index, k);
        trace!("buddy heap: freed block at {location:#x}");
    }

    /// The number of currently free minimum-size blocks.
    ///
    /// Fragmentation permitting, not all of them are reservable at once as
    /// one contiguous block.
    pub fn free_blocks(&self) -> usize {
        self.free_blocks
    }

    /// The configured minimum unit of allocation.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Free the block of `2^k` slots leading at `index`, merging it with
    /// its buddy as long as the buddy is a free block of the same class.
    fn insert_block(&mut self, mut index: usize, mut k: u32) {
        self.free_blocks += 1usize << k;
        while k < self.max_kval {
            let buddy = index ^ (1usize << k);
            if buddy >= self.block_map.len() {
                break;
            }
            if self.block_map[buddy].tag != BlockTag::Free
                || self.block_map[buddy].kval != k as u8
            {
                break;
            }
            self.unlink(k, buddy);
            self.block_map[buddy].tag = BlockTag::Reserved;
            if buddy < index {
                index = buddy;
            }
            k += 1;
        }
        self.block_map[index].tag = BlockTag::Free;
        self.block_map[index].kval = k as u8;
        self.push_front(k, index);
    }

    /// Splice `index` in as the new head of class `k`'s ring.
    fn push_front(&mut self, k: u32, index: usize) {
        let head = self.avail[k as usize];
        if head == NIL {
            self.block_map[index].linkf = index;
            self.block_map[index].linkb = index;
        } else {
            let tail = self.block_map[head].linkb;
            self.block_map[index].linkf = head;
            self.block_map[index].linkb = tail;
            self.block_map[tail].linkf = index;
            self.block_map[head].linkb = index;
        }
        self.avail[k as usize] = index;
    }

    /// Remove `index` from class `k`'s ring.
    fn unlink(&mut self, k: u32, index: usize) {
        let forward = self.block_map[index].linkf;
        let backward = self.block_map[index].linkb;
        if forward == index {
            self.avail[k as usize] = NIL;
        } else {
            self.block_map[backward].linkf = forward;
            self.block_map[forward].linkb = backward;
            if self.avail[k as usize] == index {
                self.avail[k as usize] = forward;
            }
        }
        self.block_map[index].linkf = NIL;
        self.block_map[index].linkb = NIL;
    }

    /// Find an available region able to host `size` bytes of record-aligned
    /// block map. Returns the aligned absolute address and the map location
    /// of the carve.
    fn find_carve<const N: usize>(
        map: &MemoryMap<N>,
        offset: usize,
        size: usize,
    ) -> Result<(usize, usize), InitError> {
        let align = mem::align_of::<BlockRecord>();
        for region in map.regions() {
            if region.kind != RegionKind::Available {
                continue;
            }
            let mut address = bits::align_up(offset + region.location, align);
            if address == 0 {
                // Never form a metadata reference to the null address.
                address = align;
            }
            let lead = address - (offset + region.location);
            if region.size >= lead + size {
                return Ok((address, region.location + lead));
            }
        }
        Err(InitError::InsufficientMemory)
    }
}
