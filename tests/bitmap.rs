//! End-to-end tests of the bitmap buddy engine, including the
//! metadata-carve path over a real buffer.

use mapalloc::{BitmapHeap, BitmapHeapConfig, CommitError, InitError, MemoryMap, RegionKind};

/// Deterministic xorshift64 so stress runs are reproducible.
struct XorShift(u64);

impl XorShift {
    fn new(seed: u64) -> Self {
        Self(seed | 1)
    }

    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }
}

/// Random reserve/free churn followed by a full drain: no two live blocks
/// may overlap, every block stays inside the heap, and after freeing
/// everything the free count returns to its post-init value.
fn churn(heap: &mut BitmapHeap<'_>, rng: &mut XorShift, heap_start: usize, heap_end: usize) {
    let block_size = heap.block_size();
    let baseline = heap.free_blocks();

    let mut live: Vec<(usize, usize)> = Vec::new();
    for _ in 0..2048 {
        if rng.next() % 2 == 0 && !live.is_empty() {
            let (location, size) = live.swap_remove(rng.next() as usize % live.len());
            heap.free(location, size);
        } else {
            let size = block_size * (rng.next() as usize % 8 + 1);
            if let Some(location) = heap.reserve(size) {
                assert!(location >= heap_start, "block below the heap");
                assert!(location + size <= heap_end, "block past the heap");
                for &(other, other_size) in &live {
                    assert!(
                        location + size <= other || location >= other + other_size,
                        "blocks overlap: ({location}, {size}) vs ({other}, {other_size})"
                    );
                }
                live.push((location, size));
            }
        }
    }
    for (location, size) in live.drain(..) {
        heap.free(location, size);
    }
    assert_eq!(heap.free_blocks(), baseline, "leaked blocks after drain");
}

#[test]
fn stress_across_block_geometries() {
    for block_size in [1usize, 2, 4, 8, 16, 32] {
        let heap_size = 256 * block_size;
        for shift in 0..6 {
            let block_bits = 1u32 << shift;
            let mut map = MemoryMap::<16>::new();
            map.insert(0, heap_size, RegionKind::Available).unwrap();
            if BitmapHeap::size_needed(&map, block_size, block_bits)
                <= core::mem::size_of::<usize>()
            {
                continue;
            }

            let words =
                BitmapHeap::size_needed(&map, block_size, block_bits) / core::mem::size_of::<usize>();
            let mut storage = vec![0usize; words];
            let mut cache = vec![0usize; 24];
            let mut heap = unsafe {
                BitmapHeap::init(
                    BitmapHeapConfig {
                        storage: Some(&mut storage),
                        cache: Some(&mut cache),
                        block_size,
                        block_bits,
                        offset: 0,
                    },
                    &mut map,
                    None,
                )
            }
            .unwrap();

            assert_eq!(heap.free_blocks(), 256);
            let mut rng = XorShift::new(0x9e37_79b9 + block_size as u64 + block_bits as u64);
            churn(&mut heap, &mut rng, 0, heap_size);

            // A fully drained heap can serve itself as one block again.
            assert_eq!(heap.reserve(heap_size), Some(0));
            heap.free(0, heap_size);
        }
    }
}

#[test]
fn zero_size_free_recovery_under_churn() {
    // With two bits per block, frees may pass size 0 and rely on the used
    // flag to recover the block size.
    let heap_size = 4096;
    let mut map = MemoryMap::<16>::new();
    map.insert(0, heap_size, RegionKind::Available).unwrap();
    let words = BitmapHeap::size_needed(&map, 1, 2) / core::mem::size_of::<usize>();
    let mut storage = vec![0usize; words];
    let mut heap = unsafe {
        BitmapHeap::init(
            BitmapHeapConfig {
                storage: Some(&mut storage),
                cache: None,
                block_size: 1,
                block_bits: 2,
                offset: 0,
            },
            &mut map,
            None,
        )
    }
    .unwrap();

    let baseline = heap.free_blocks();
    let mut rng = XorShift::new(42);
    let mut live = Vec::new();
    for _ in 0..1024 {
        if rng.next() % 2 == 0 && !live.is_empty() {
            let location = live.swap_remove(rng.next() as usize % live.len());
            heap.free(location, 0);
        } else if let Some(location) = heap.reserve(rng.next() as usize % 8 + 1) {
            live.push(location);
        }
    }
    for location in live.drain(..) {
        heap.free(location, 0);
    }
    assert_eq!(heap.free_blocks(), baseline);
    assert_eq!(heap.reserve(heap_size), Some(0));
}

#[test]
fn carves_metadata_and_commits_it_once() {
    let heap_size = 65536;
    let block_size = 16;
    let buffer = vec![0usize; heap_size / core::mem::size_of::<usize>()];
    let offset = buffer.as_ptr() as usize;

    let mut map = MemoryMap::<16>::new();
    map.insert(0, heap_size, RegionKind::Available).unwrap();
    let metadata_size = BitmapHeap::size_needed(&map, block_size, 2);
    assert_eq!(metadata_size, 2048);

    let mut commits = Vec::new();
    let mut hook = |address: usize, size: usize| {
        commits.push((address, size));
        Ok(())
    };
    let mut cache = vec![0usize; 16];
    let mut heap = unsafe {
        BitmapHeap::init(
            BitmapHeapConfig {
                storage: None,
                cache: Some(&mut cache),
                block_size,
                block_bits: 2,
                offset,
            },
            &mut map,
            Some(&mut hook),
        )
    }
    .unwrap();

    // The carve went to the front of the heap and was committed exactly
    // once before use.
    assert_eq!(commits.as_slice(), &[(offset, metadata_size)]);
    assert_eq!(
        map.regions()[0],
        mapalloc::MemoryRegion {
            location: 0,
            size: metadata_size,
            kind: RegionKind::Unavailable,
        }
    );
    assert_eq!(heap.free_blocks(), (heap_size - metadata_size) / block_size);

    // No reservation may land inside the metadata.
    let mut rng = XorShift::new(7);
    churn(&mut heap, &mut rng, offset + metadata_size, offset + heap_size);

    // The whole upper half of the heap is one reservable block.
    let upper = heap.reserve(heap_size / 2).unwrap();
    assert_eq!(upper, offset + heap_size / 2);
}

#[test]
fn commit_failure_aborts_init() {
    let heap_size = 65536;
    let buffer = vec![0usize; heap_size / core::mem::size_of::<usize>()];
    let mut map = MemoryMap::<16>::new();
    map.insert(0, heap_size, RegionKind::Available).unwrap();

    let mut hook = |_address: usize, _size: usize| Err(CommitError);
    let result = unsafe {
        BitmapHeap::init(
            BitmapHeapConfig {
                storage: None,
                cache: None,
                block_size: 16,
                block_bits: 2,
                offset: buffer.as_ptr() as usize,
            },
            &mut map,
            Some(&mut hook),
        )
    };
    assert_eq!(result.err(), Some(InitError::CommitFailed));
}

#[test]
fn carve_requires_an_available_host() {
    // Every available region is far too small to host the metadata.
    let mut map = MemoryMap::<16>::new();
    map.insert(0, 16, RegionKind::Available).unwrap();
    map.insert(65520, 16, RegionKind::Available).unwrap();
    let result = unsafe {
        BitmapHeap::init(
            BitmapHeapConfig {
                storage: None,
                cache: None,
                block_size: 1,
                block_bits: 2,
                offset: 0,
            },
            &mut map,
            None,
        )
    };
    assert_eq!(result.err(), Some(InitError::InsufficientMemory));
}
