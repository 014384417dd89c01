//! Buddy allocator over an implicit binary tree of availability bits.
//!
//! The heap is modeled as a complete binary tree: the root stands for the
//! whole heap, its children for the two halves, and so on down to blocks of
//! [`block_size`](BitmapHeapConfig::block_size) bytes at the leaves. Nodes
//! are never materialized; a node is just an index `i` (root at 1, children
//! at `2i` and `2i + 1`, buddy at `i ^ 1`) into a flat array of metadata
//! bits packed into machine words.
//!
//! Each node owns [`block_bits`](BitmapHeapConfig::block_bits) consecutive
//! bits. The most significant bit of the group is the *availability* bit
//! (1 = the block is free and not split). With two or more bits per block,
//! the next one is the *used* flag, set on exactly the node that a
//! reservation was made at; that is what lets [`BitmapHeap::free`] recover
//! the block size when the caller does not remember it. Any further bits
//! are free for caller use via [`BitmapHeap::read_bit`] and
//! [`BitmapHeap::write_bit`].
//!
//! Reservation descends the tree looking for the first available node of
//! the right size, splitting larger nodes as needed; release sets the
//! node's availability back and greedily re-merges buddy pairs. An
//! optional one-index-per-level cache short-circuits the word scans with
//! nodes remembered from recent splits and frees.

use core::slice;

use log::{debug, trace};

use crate::bits;
use crate::memmap::{MemoryMap, RegionKind};
use crate::{CommitHook, InitError};

/// Availability bit: the most significant bit of a node's group.
const BIT_AVAIL: u32 = 0;
/// Used flag: set on the exact node a reservation was made at.
const BIT_USED: u32 = 1;

/// Pre-init description of a [`BitmapHeap`], filled in by the caller.
pub struct BitmapHeapConfig<'a> {
    /// Storage for the metadata bits. `None` asks
    /// [`init`](BitmapHeap::init) to carve the storage out of an available
    /// map region.
    pub storage: Option<&'a mut [usize]>,
    /// Optional free-index cache, one slot per cacheable tree level. Size
    /// it with [`BitmapHeap::cache_slots_needed`]; `None` disables caching.
    pub cache: Option<&'a mut [usize]>,
    /// The smallest unit of allocation, in bytes.
    pub block_size: usize,
    /// Metadata bits per block: a power of two, at most the word width.
    pub block_bits: u32,
    /// Base address the heap serves; all map locations and all returned
    /// addresses are relative to it.
    pub offset: usize,
}

/// The bitmap buddy allocator.
///
/// Built from a [`BitmapHeapConfig`] and a [`MemoryMap`] by
/// [`init`](Self::init). The descriptor never touches the managed memory
/// itself (unless it was asked to carve its metadata out of it), which
/// makes it usable for physical-memory accounting.
pub struct BitmapHeap<'a> {
    bitmap: &'a mut [usize],
    cache: Option<&'a mut [usize]>,
    block_size: usize,
    block_bits: u32,
    blocks_in_word: usize,
    height: u32,
    mask: usize,
    offset: usize,
    free_blocks: usize,
}

impl<'a> BitmapHeap<'a> {
    /// Bytes of metadata storage required for the memory described by
    /// `map`, at the given block size and bits per block.
    ///
    /// The result is the size of the whole availability tree (two bits per
    /// leaf worth of nodes, times `block_bits`), rounded up to a power of
    /// two. Returns 0 for a degenerate configuration; [`init`](Self::init)
    /// reports the precise error.
    pub fn size_needed<const N: usize>(
        map: &MemoryMap<N>,
        block_size: usize,
        block_bits: u32,
    ) -> usize {
        let memory_size = match map.memory_size() {
            Some(size) => size,
            None => return 0,
        };
        if block_size == 0 || block_bits == 0 {
            return 0;
        }
        let raw = block_bits as usize * (memory_size / block_size) / 4;
        raw.next_power_of_two()
    }

    /// Number of cache slots [`init`](Self::init) can make use of for the
    /// memory described by `map`.
    ///
    /// One slot per tree level that spans at least one full metadata word;
    /// levels packed inside the first word are found with a single masked
    /// test and gain nothing from caching.
    pub fn cache_slots_needed<const N: usize>(
        map: &MemoryMap<N>,
        block_size: usize,
        block_bits: u32,
    ) -> usize {
        let memory_size = match map.memory_size() {
            Some(size) => size,
            None => return 0,
        };
        if block_size == 0 || block_bits == 0 {
            return 0;
        }
        let height = bits::ceil_log2(memory_size / block_size);
        let log2_biw = bits::ceil_log2(bits::WORD_BITS / block_bits as usize);
        (height as usize + 1).saturating_sub(log2_biw as usize)
    }

    /// Build a heap from `config` and the regions recorded in `map`.
    ///
    /// When [`storage`](BitmapHeapConfig::storage) is `None`, the metadata
    /// is carved out of the first available region large enough to hold it:
    /// the carve-out is reinserted into `map` as unavailable and reported
    /// to `commit` before it is first written. Every remaining available
    /// region is then ingested into the availability tree.
    ///
    /// # Errors
    ///
    /// See [`InitError`]; misconfigured block geometry, a heap smaller
    /// than one metadata word, and an impossible metadata carve all fail
    /// here.
    ///
    /// # Safety
    ///
    /// If the metadata is carved from the map, every available region must
    /// describe memory at `offset + location` that is valid for reads and
    /// writes for `'a` and not aliased for that lifetime. With
    /// preallocated `storage` the heap is pure accounting and no memory in
    /// the map is touched.
    pub unsafe fn init<const N: usize>(
        config: BitmapHeapConfig<'a>,
        map: &mut MemoryMap<N>,
        mut commit: CommitHook<'_>,
    ) -> Result<Self, InitError> {
        let BitmapHeapConfig {
            storage,
            cache,
            block_size,
            block_bits,
            offset,
        } = config;

        if block_bits == 0 || block_bits as usize > bits::WORD_BITS {
            return Err(InitError::InvalidBlockBits);
        }
        if !bits::is_power_of_2(block_bits as usize) {
            return Err(InitError::InvalidBlockBits);
        }
        if block_size == 0 {
            return Err(InitError::InvalidBlockSize);
        }

        let memory_size = map.memory_size().ok_or(InitError::InsufficientMemory)?;
        let bitmap_size = Self::size_needed(map, block_size, block_bits);
        if bitmap_size <= bits::WORD_BYTES {
            return Err(InitError::InsufficientMemory);
        }
        if bitmap_size >= memory_size && storage.is_none() {
            return Err(InitError::InsufficientMemory);
        }

        let words = bitmap_size / bits::WORD_BYTES;
        let bitmap: &'a mut [usize] = match storage {
            Some(storage) => {
                if storage.len() < words {
                    return Err(InitError::InsufficientMemory);
                }
                &mut storage[..words]
            }
            None => {
                let (address, location) = Self::find_carve(map, offset, bitmap_size)?;
                map.insert(location, bitmap_size, RegionKind::Unavailable)?;
                if let Some(hook) = commit.as_mut() {
                    hook(address, bitmap_size)?;
                }
                debug!("bitmap heap: metadata carved at {address:#x} ({bitmap_size} bytes)");
                // SAFETY: the caller guarantees the available region this
                // range was found in is valid, exclusive memory for 'a; the
                // address was word-aligned by the carve search, and the
                // range was re-registered as unavailable above so it cannot
                // be handed out again.
                slice::from_raw_parts_mut(address as *mut usize, words)
            }
        };

        let mut heap = BitmapHeap {
            bitmap,
            cache,
            block_size,
            block_bits,
            blocks_in_word: bits::WORD_BITS / block_bits as usize,
            height: bits::ceil_log2(memory_size / block_size),
            mask: availability_mask(block_bits),
            offset,
            free_blocks: 0,
        };
        heap.clear_cache();
        heap.ingest(map);
        debug!(
            "bitmap heap: height {}, {} free blocks of {} bytes",
            heap.height, heap.free_blocks, heap.block_size
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
        let height = bits::ceil_log2((size - 1) / self.block_size + 1);
        if height > self.height {
            return None;
        }
        let index = self.find_free(height);
        if index == 0 {
            trace!("bitmap heap: out of {size}-byte blocks");
            return None;
        }
        self.clear_bit(index, BIT_AVAIL);
        self.set_bit(index, BIT_USED);
        self.free_blocks -= 1 << height;
        let address = self.offset
            + (self.block_size << height) * (index - (1usize << (self.height - height)));
        trace!("bitmap heap: reserved {size} bytes at {address:#x}");
        Some(address)
    }

    /// Release the block at `location`.
    ///
    /// `location` must have been returned by [`reserve`](Self::reserve) and
    /// not yet freed. `size` is the reserved block's size; with two or more
    /// bits per block the caller may pass 0 and the true size is recovered
    /// from the used flag.
    ///
    /// # Panics
    ///
    /// Panics if `size` is 0 in a 1-bit-per-block configuration (there is
    /// no used flag to recover the size from), or if `size` exceeds the
    /// heap.
    pub fn free(&mut self, location: usize, size: usize) {
        assert!(
            size != 0 || self.block_bits >= 2,
            "a 1-bit-per-block heap cannot recover block sizes; pass the size"
        );
        let relative = location - self.offset;
        let mut height = bits::ceil_log2(size / self.block_size);
        assert!(height <= self.height, "freed size exceeds the heap");

        let mut index =
            relative / (self.block_size << height) + (1usize << (self.height - height));
        // Walk up to the node the reservation was actually made at.
        while index > 1 && !self.test_bit(index, BIT_USED) {
            height += 1;
            index /= 2;
        }

        self.set_bit(index, BIT_AVAIL);
        self.clear_bit(index, BIT_USED);
        let merged = self.merge(index);
        self.store_cache(merged);
        self.free_blocks += 1 << height;
        trace!("bitmap heap: freed block at {location:#x}");
    }

    /// Read one metadata bit of the reserved block at `location`.
    ///
    /// Bits 0 and 1 belong to the allocator (availability and used flag);
    /// caller bits start at 2 and exist when `block_bits > 2`.
    ///
    /// # Panics
    ///
    /// Panics if `bit` is not less than the configured bits per block.
    pub fn read_bit(&self, location: usize, bit: u32) -> bool {
        assert!(bit < self.block_bits, "bit index out of range");
        self.test_bit(self.reserved_node(location), bit)
    }

    /// Overwrite one metadata bit of the reserved block at `location`.
    ///
    /// # Panics
    ///
    /// Panics if `bit` is not less than the configured bits per block.
    pub fn write_bit(&mut self, location: usize, bit: u32, value: bool) {
        assert!(bit < self.block_bits, "bit index out of range");
        let index = self.reserved_node(location);
        if value {
            self.set_bit(index, bit);
        } else {
            self.clear_bit(index, bit);
        }
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

    /// Find an available region able to host `size` bytes of word-aligned
    /// metadata. Returns the aligned absolute address and the (unaligned)
    /// map location of the carve.
    fn find_carve<const N: usize>(
        map: &MemoryMap<N>,
        offset: usize,
        size: usize,
    ) -> Result<(usize, usize), InitError> {
        for region in map.regions() {
            if region.kind != RegionKind::Available {
                continue;
            }
            let mut address = bits::align_up(offset + region.location, bits::WORD_BYTES);
            if address == 0 {
                // Never form a metadata reference to the null address.
                address = bits::WORD_BYTES;
            }
            let lead = address - (offset + region.location);
            if region.size >= lead + size {
                return Ok((address, region.location + lead));
            }
        }
        Err(InitError::InsufficientMemory)
    }

    /// Populate the availability bits from every available region in the
    /// map, a word at a time, merging freshly available buddy pairs as each
    /// word is completed.
    fn ingest<const N: usize>(&mut self, map: &MemoryMap<N>) {
        self.bitmap.fill(0);
        let leaf_base = (1usize << self.height) / self.blocks_in_word;

        for region in map.regions() {
            if region.kind != RegionKind::Available {
                continue;
            }
            // Clamp to whole blocks inside the region.
            let mut location = region.location + self.block_size - 1;
            location -= location % self.block_size;
            let region_end = region.location + region.size;

            while location + self.block_size <= region_end {
                let block = location / self.block_size;
                let bit_offset = (block % self.blocks_in_word) as u32;
                let word = leaf_base + block / self.blocks_in_word;
                let remaining = (self.blocks_in_word - bit_offset as usize) * self.block_size;
                let bb = self.block_bits;

                if bit_offset == 0 && region_end - location >= remaining {
                    // The region covers this whole word.
                    self.bitmap[word] = self.mask;
                    self.free_blocks += self.blocks_in_word;
                } else if bit_offset == 0 {
                    // Short tail: the first `count` blocks only.
                    let count = ((region_end - location) / self.block_size) as u32;
                    self.bitmap[word] |= self.mask & bits::low_bits(bb * count);
                    self.free_blocks += count as usize;
                } else if region_end - location >= remaining {
                    // Unaligned head: everything from `bit_offset` up.
                    self.bitmap[word] |= self.mask & !bits::low_bits(bb * bit_offset);
                    self.free_blocks += self.blocks_in_word - bit_offset as usize;
                } else {
                    // Both: blocks `bit_offset .. bit_offset + count`.
                    let count = ((region_end - location) / self.block_size) as u32;
                    self.bitmap[word] |= self.mask
                        & bits::low_bits(bb * (bit_offset + count))
                        & !bits::low_bits(bb * bit_offset);
                    self.free_blocks += count as usize;
                }

                // Merge buddy pairs that became available in this word; the
                // merges cascade upward across words on their own.
                for pair in 0..self.blocks_in_word / 2 {
                    let pair_mask = (bits::low_bits(2 * bb) & self.mask) << (2 * bb as usize * pair);
                    if self.bitmap[word] & pair_mask == pair_mask {
                        self.merge(word * self.blocks_in_word + 2 * pair);
                    }
                }

                location += remaining;
            }
        }
    }

    /// Find the index of an available node at `height`, splitting larger
    /// nodes as needed. Returns 0 when nothing of sufficient size is free.
    fn find_free(&mut self, height: u32) -> usize {
        if height > self.height {
            return 0;
        }
        let log2_biw = bits::ceil_log2(self.blocks_in_word);
        if height + log2_biw <= self.height {
            // The level spans whole words: try the cache, then scan.
            let cached = self.check_cache(height);
            if cached != 0 {
                return cached;
            }
            let depth = (self.height - height) as usize;
            let start = (1usize << depth) / self.blocks_in_word;
            let end = (1usize << (depth + 1)) / self.blocks_in_word;
            for word in start..end {
                let avail = self.bitmap[word] & self.mask;
                if avail != 0 {
                    return self.blocks_in_word * word
                        + avail.trailing_zeros() as usize / self.block_bits as usize;
                }
            }
        } else {
            // The level lies inside the first word: one masked test.
            let level = self.level_mask(self.height - height);
            let hit = self.bitmap[0] & level & self.mask;
            if hit != 0 {
                return hit.trailing_zeros() as usize / self.block_bits as usize;
            }
        }
        let parent = self.find_free(height + 1);
        self.split(parent)
    }

    /// Mark `index` as split: it becomes unavailable, both children become
    /// available, and the right child is remembered in the cache. Returns
    /// the left child (0 propagates a failed search).
    fn split(&mut self, index: usize) -> usize {
        if index == 0 {
            return 0;
        }
        self.clear_bit(index, BIT_AVAIL);
        let child = index * 2;
        self.set_bit(child, BIT_AVAIL);
        self.set_bit(child ^ 1, BIT_AVAIL);
        self.store_cache(child + 1);
        child
    }

    /// Merge the available node `index` with its buddy as long as the buddy
    /// is available too, ascending the tree. Returns the final index.
    fn merge(&mut self, mut index: usize) -> usize {
        while index > 1 && self.test_bit(index ^ 1, BIT_AVAIL) {
            self.uncache(index ^ 1);
            self.clear_bit(index, BIT_AVAIL);
            self.clear_bit(index ^ 1, BIT_AVAIL);
            index /= 2;
            self.set_bit(index, BIT_AVAIL);
        }
        index
    }

    /// Walk from the leaf at `location` up to the node its reservation was
    /// made at.
    fn reserved_node(&self, location: usize) -> usize {
        let mut index = (location - self.offset) / self.block_size + (1usize << self.height);
        while index > 1 && !self.test_bit(index, BIT_USED) {
            index /= 2;
        }
        index
    }

    /// A mask over word 0 selecting all bit groups of the level at `depth`.
    fn level_mask(&self, depth: u32) -> usize {
        let low = 1u32 << (depth + bits::ceil_log2(self.block_bits as usize));
        bits::low_bits(low * 2) & !bits::low_bits(low)
    }

    fn set_bit(&mut self, index: usize, bit: u32) {
        if bit < self.block_bits {
            let (word, pos) = self.bit_position(index, bit);
            self.bitmap[word] |= 1 << pos;
        }
    }

    fn clear_bit(&mut self, index: usize, bit: u32) {
        if bit < self.block_bits {
            let (word, pos) = self.bit_position(index, bit);
            self.bitmap[word] &= !(1 << pos);
        }
    }

    /// Bits the node does not have read as set; that is what terminates
    /// used-flag walks on 1-bit heaps.
    fn test_bit(&self, index: usize, bit: u32) -> bool {
        if bit > self.block_bits - 1 {
            return true;
        }
        let (word, pos) = self.bit_position(index, bit);
        self.bitmap[word] & (1 << pos) != 0
    }

    fn bit_position(&self, index: usize, bit: u32) -> (usize, u32) {
        let word = index / self.blocks_in_word;
        let group = (index % self.blocks_in_word) as u32;
        (word, self.block_bits * (group + 1) - 1 - bit)
    }

    /// Take a remembered free node of the level at `height` out of the
    /// cache. 0 means no entry; the scan has to do the work.
    fn check_cache(&mut self, height: u32) -> usize {
        let slot = (self.height - height) as usize;
        let slot = match slot.checked_sub(bits::ceil_log2(self.blocks_in_word) as usize) {
            Some(slot) => slot,
            None => return 0,
        };
        match self.cache.as_deref_mut() {
            Some(cache) if slot < cache.len() => {
                let index = cache[slot];
                cache[slot] = 0;
                index
            }
            _ => 0,
        }
    }

    /// Remember `index` as a known-free node of its level, if its level is
    /// cacheable and the slot is empty.
    fn store_cache(&mut self, index: usize) {
        let slot = match self.cache_slot(index) {
            Some(slot) => slot,
            None => return,
        };
        if let Some(cache) = self.cache.as_deref_mut() {
            if slot < cache.len() && cache[slot] == 0 {
                cache[slot] = index;
            }
        }
    }

    /// Forget `index` if it is cached; it is about to stop being free.
    fn uncache(&mut self, index: usize) {
        let slot = match self.cache_slot(index) {
            Some(slot) => slot,
            None => return,
        };
        if let Some(cache) = self.cache.as_deref_mut() {
            if slot < cache.len() && cache[slot] == index {
                cache[slot] = 0;
            }
        }
    }

    fn cache_slot(&self, index: usize) -> Option<usize> {
        // ceil_log2(index + 1) is the node's depth plus one, for any index
        // of that level.
        let level = bits::ceil_log2(index + 1) as usize;
        level.checked_sub(bits::ceil_log2(self.blocks_in_word) as usize + 1)
    }

    fn clear_cache(&mut self) {
        if let Some(cache) = self.cache.as_deref_mut() {
            cache.fill(0);
        }
    }
}

/// A word with the availability bit of every block group set.
fn availability_mask(block_bits: u32) -> usize {
    let blocks_in_word = bits::WORD_BITS / block_bits as usize;
    let mut mask = 0;
    for group in 1..=blocks_in_word {
        mask |= 1usize << (group * block_bits as usize - 1);
    }
    mask
}
