//! Map-driven memory allocators for kernels and freestanding runtimes.
//!
//! This crate is the bottom layer of a memory-management stack: it manages a
//! caller-supplied region of address space and offers three independent
//! allocator engines, each with the same conceptual contract (*reserve a
//! region of at least N bytes, release a previously reserved region*) but
//! with different trade-offs between metadata overhead, external
//! fragmentation and allocation throughput:
//!
//! * [`BitmapHeap`]: a buddy allocator tracking power-of-two blocks as bits
//!   of an implicit binary tree packed into a word array. Metadata is tiny
//!   (down to one bit per block) and never touches the managed memory, so it
//!   also suits physical-frame accounting where the frames themselves are
//!   not mapped.
//! * [`BuddyHeap`]: a buddy allocator tracking blocks as records in a flat
//!   block map, with one circular free list per size class. Releasing a
//!   block does not require remembering its size.
//! * [`ListHeap`]: a variable-size allocator with boundary tags (a header
//!   and a mirrored footer per block) written into the managed memory
//!   itself. Lowest bookkeeping overhead per byte for general heaps.
//!
//! All three are fed by a [`MemoryMap`]: an ordered catalog of typed address
//! ranges that the caller populates from whatever the platform reports
//! (firmware tables, a device tree, a linker script). The map normalizes
//! itself on every insert, merging or clipping overlapping regions so
//! that *defective* ranges beat *unavailable* ranges beat *available*
//! ranges, and the allocator initializers then ingest every available
//! region. An initializer may also carve its own metadata out of an
//! available region; it registers the carve-out in the map as unavailable
//! and reports it to an optional [page-commit hook](CommitHook) so a paging
//! layer can back the range before it is written.
//!
//! # Usage
//!
//! Populate a map, pick an engine, hand the map over:
//!
//! ```
//! use mapalloc::{BitmapHeap, BitmapHeapConfig, MemoryMap, RegionKind};
//!
//! let mut map = MemoryMap::<8>::new();
//! map.insert(0, 65536, RegionKind::Available).unwrap();
//!
//! // 65536 bytes in 16-byte blocks at one metadata bit per block.
//! assert_eq!(BitmapHeap::size_needed(&map, 16, 1), 1024);
//! let mut bitmap = [0_usize; 1024 / core::mem::size_of::<usize>()];
//!
//! let mut heap = unsafe {
//!     BitmapHeap::init(
//!         BitmapHeapConfig {
//!             storage: Some(&mut bitmap),
//!             cache: None,
//!             block_size: 16,
//!             block_bits: 1,
//!             offset: 0,
//!         },
//!         &mut map,
//!         None,
//!     )
//! }
//! .unwrap();
//!
//! let block = heap.reserve(64).unwrap();
//! heap.free(block, 64);
//! ```
//!
//! # Concurrency
//!
//! Every engine instance is strictly single-owner: operations take
//! `&mut self`, run synchronously and never block. Callers that need to
//! share an instance wrap it in [`Locked`] (or a mutex of their own); the
//! engines promise no finer-grained locking.
//!
//! # Failure behavior
//!
//! Exhaustion is not an error state: `reserve` returns `None`, the engine
//! stays fully usable, and later frees make later reserves succeed again.
//! Misconfiguration and insufficient backing memory surface as
//! [`InitError`] from the initializers; a failed init yields no descriptor.
#![no_std]

mod bits;

pub mod bitmap;
pub mod buddy;
pub mod list;
pub mod memmap;
pub mod sync;

pub use bitmap::{BitmapHeap, BitmapHeapConfig};
pub use buddy::{BlockRecord, BuddyHeap, BuddyHeapConfig};
pub use list::ListHeap;
pub use memmap::{MapFull, MemoryMap, MemoryRegion, RegionKind};
pub use sync::Locked;

/// The page-commit hook rejected a range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitError;

/// Callback invoked by an initializer on its metadata range, before that
/// range is first written.
///
/// The arguments are the range's start address and length in bytes. The hook
/// runs at most once per allocator lifetime and must not re-enter the
/// allocator. Returning an error aborts the init with
/// [`InitError::CommitFailed`]; on success the range is assumed readable
/// and writable.
pub type CommitHook<'a> = Option<&'a mut dyn FnMut(usize, usize) -> Result<(), CommitError>>;

/// An allocator initializer could not build a working descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitError {
    /// The configured block size is zero.
    InvalidBlockSize,
    /// The configured bits-per-block count is zero, not a power of two, or
    /// wider than a machine word.
    InvalidBlockBits,
    /// The map holds no available memory, the heap is smaller than the
    /// metadata it would need, or no available region can host the
    /// metadata.
    InsufficientMemory,
    /// Registering the metadata carve-out would overflow the memory map.
    MapFull,
    /// The page-commit hook rejected the metadata range.
    CommitFailed,
}

impl From<MapFull> for InitError {
    fn from(_: MapFull) -> Self {
        InitError::MapFull
    }
}

impl From<CommitError> for InitError {
    fn from(_: CommitError) -> Self {
        InitError::CommitFailed
    }
}
