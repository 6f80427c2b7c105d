use std::ptr::NonNull;

use pretty_assertions::assert_eq;
use stack_frame_pool::{Backend, Counting, HeapBackend, OutOfMemory, Pool, PoolConfig, RawChunk};

const NUM_LOOPS: usize = 3;
const LIST_SIZE: usize = 100_000;
const PAGE: usize = 4096;

struct Node {
    next: Option<NonNull<Node>>,
}

/// Rounds every request up to a whole page before passing it on.
#[derive(Debug, Default)]
struct PageRounding(HeapBackend);

impl Backend for PageRounding {
    fn allocate(&mut self, size: usize) -> Result<RawChunk, OutOfMemory> {
        let rounded = size.div_ceil(PAGE) * PAGE;
        self.0.allocate(rounded)
    }

    unsafe fn release(&mut self, chunk: RawChunk) {
        unsafe { self.0.release(chunk) }
    }
}

fn build_list(pool: &mut Pool<Counting<PageRounding>>) -> usize {
    let head = pool.alloc_value(Node { next: None }).unwrap();
    let mut tail = head;

    for _ in 1..LIST_SIZE {
        let node = pool.alloc_value(Node { next: None }).unwrap();
        unsafe { (*tail.as_ptr()).next = Some(node) };
        tail = node;
    }

    let mut length = 0;
    let mut cursor = Some(head);
    while let Some(node) = cursor {
        length += 1;
        cursor = unsafe { (*node.as_ptr()).next };
    }
    length
}

#[test]
fn repeated_frames_release_everything() {
    let mut pool = Pool::with_config(
        PoolConfig::default(),
        Counting::new(PageRounding::default()),
    )
    .unwrap();

    for _ in 0..NUM_LOOPS {
        let frame = pool.push().unwrap();
        assert_eq!(build_list(&mut pool), LIST_SIZE);
        pool.pop_frame(frame);

        let stats = pool.backend().stats();
        assert_eq!(stats.live_chunks(), 0);
        assert_eq!(stats.live_bytes(), 0);
    }

    let stats = pool.backend().stats();
    let payload = LIST_SIZE * std::mem::size_of::<Node>() * NUM_LOOPS;

    assert_eq!(stats.allocations, stats.releases);
    assert_eq!(stats.bytes_allocated % PAGE, 0);
    assert!(stats.bytes_allocated >= payload);

    // every loop needs the same number of blocks
    assert_eq!(stats.allocations % NUM_LOOPS, 0);

    pool.destroy().unwrap();
}

#[test]
fn page_slack_is_used() {
    let mut pool = Pool::with_config(
        PoolConfig::new(100, 2).unwrap(),
        Counting::new(PageRounding::default()),
    )
    .unwrap();

    let frame = pool.push().unwrap();

    // the backend reported a whole page, so the frame can use all of it
    assert!(pool.stats().available > 100);
    let available = pool.stats().available;
    pool.malloc(available).unwrap();
    assert_eq!(pool.backend().stats().allocations, 1);

    pool.pop_frame(frame);
}
