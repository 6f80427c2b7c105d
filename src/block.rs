//! Blocks are the chunks a frame bump allocates from.
//!
//! Block records live in a [`BlockArena`] owned by the pool and are chained
//! through [`BlockId`]s, newest first. The chunk itself starts with a small
//! [`BlockHeader`] so a block can be recognised from its memory alone.

use std::ptr::NonNull;

use crate::backend::RawChunk;

/// Bytes reserved at the start of every chunk for its [`BlockHeader`].
pub(crate) const BLOCK_OVERHEAD: usize = {
    let size = std::mem::size_of::<BlockHeader>();
    let align = crate::config::MIN_ALIGN;
    (size + align - 1) & !(align - 1)
};

/// Index of a block inside the pool's [`BlockArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct BlockId(usize);

/// Written at the start of every chunk.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BlockHeader {
    pub(crate) id: usize,
    pub(crate) size: usize,
}

/// A chunk obtained from the backend and owned by exactly one frame.
#[derive(Debug)]
pub(crate) struct Block {
    pub(crate) chunk: RawChunk,
    /// Usable bytes after the header
    pub(crate) size: usize,
    /// The block chained before this one in the same frame
    pub(crate) previous: Option<BlockId>,
}

impl Block {
    /// First usable byte of the block.
    #[inline]
    pub(crate) fn start(&self) -> NonNull<u8> {
        // Safety: the chunk is at least BLOCK_OVERHEAD bytes long
        unsafe { NonNull::new_unchecked(self.chunk.ptr.as_ptr().add(BLOCK_OVERHEAD)) }
    }

    /// Stamps the header into the chunk.
    pub(crate) fn write_header(&self, id: BlockId) {
        let header = BlockHeader { id: id.0, size: self.size };

        // Safety: the chunk is at least BLOCK_OVERHEAD bytes and owned by us
        unsafe { self.chunk.ptr.as_ptr().cast::<BlockHeader>().write_unaligned(header) }
    }

    /// Reads the header back out of the chunk.
    pub(crate) fn read_header(&self) -> BlockHeader {
        // Safety: write_header ran when the block was created
        unsafe { self.chunk.ptr.as_ptr().cast::<BlockHeader>().read_unaligned() }
    }
}

/// Slab of block records with free slot reuse.
#[derive(Debug, Default)]
pub(crate) struct BlockArena {
    slots: Vec<Option<Block>>,
    vacant: Vec<usize>,
    live: usize,
    reserved: usize,
}

impl BlockArena {
    pub(crate) fn insert(&mut self, block: Block) -> BlockId {
        self.live += 1;
        self.reserved += block.size;

        match self.vacant.pop() {
            Some(index) => {
                self.slots[index] = Some(block);
                BlockId(index)
            }
            None => {
                self.slots.push(Some(block));
                BlockId(self.slots.len() - 1)
            }
        }
    }

    pub(crate) fn remove(&mut self, id: BlockId) -> Option<Block> {
        let block = self.slots.get_mut(id.0)?.take()?;

        self.live -= 1;
        self.reserved -= block.size;
        self.vacant.push(id.0);

        Some(block)
    }

    pub(crate) fn get(&self, id: BlockId) -> Option<&Block> {
        self.slots.get(id.0)?.as_ref()
    }

    /// Number of blocks currently held.
    pub(crate) fn len(&self) -> usize {
        self.live
    }

    /// Usable bytes across every held block.
    pub(crate) fn reserved_bytes(&self) -> usize {
        self.reserved
    }

    /// Walks a chain from `head` towards its oldest block.
    pub(crate) fn chain(&self, head: Option<BlockId>) -> impl Iterator<Item = &Block> + '_ {
        std::iter::successors(head.and_then(|id| self.get(id)), move |block| {
            block.previous.and_then(|id| self.get(id))
        })
    }
}

/// Backend request size for a block with `usable` bytes.
#[inline]
pub(crate) fn chunk_request(usable: usize) -> Option<usize> {
    usable.checked_add(BLOCK_OVERHEAD)
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::backend::{Backend, HeapBackend};

    fn block(backend: &mut HeapBackend, size: usize, previous: Option<BlockId>) -> Block {
        let chunk = backend.allocate(size + BLOCK_OVERHEAD).unwrap();
        Block { chunk, size, previous }
    }

    #[test]
    pub fn arena_reuses_slots_test() {
        let mut backend = HeapBackend;
        let mut arena = BlockArena::default();

        let a = arena.insert(block(&mut backend, 32, None));
        let b = arena.insert(block(&mut backend, 64, Some(a)));
        assert_eq!(arena.len(), 2);
        assert_eq!(arena.reserved_bytes(), 96);

        let removed = arena.remove(a).unwrap();
        unsafe { backend.release(removed.chunk) };
        assert!(arena.remove(a).is_none());

        let c = arena.insert(block(&mut backend, 16, None));
        assert_eq!(c, a);
        assert_eq!(arena.reserved_bytes(), 80);

        for id in [b, c] {
            let removed = arena.remove(id).unwrap();
            unsafe { backend.release(removed.chunk) };
        }
        assert_eq!(arena.len(), 0);
    }

    #[test]
    pub fn chain_walks_newest_first_test() {
        let mut backend = HeapBackend;
        let mut arena = BlockArena::default();

        let a = arena.insert(block(&mut backend, 8, None));
        let b = arena.insert(block(&mut backend, 16, Some(a)));
        let c = arena.insert(block(&mut backend, 24, Some(b)));

        let sizes: Vec<usize> = arena.chain(Some(c)).map(|block| block.size).collect();
        assert_eq!(sizes, vec![24, 16, 8]);
        assert_eq!(arena.chain(None).count(), 0);

        for id in [c, b, a] {
            let removed = arena.remove(id).unwrap();
            unsafe { backend.release(removed.chunk) };
        }
    }

    #[test]
    pub fn header_round_trip_test() {
        let mut backend = HeapBackend;
        let mut arena = BlockArena::default();

        let id = arena.insert(block(&mut backend, 40, None));
        let stored = arena.get(id).unwrap();
        stored.write_header(id);

        assert_eq!(stored.read_header(), BlockHeader { id: id.0, size: 40 });
        assert_eq!(
            stored.start().as_ptr() as usize - stored.chunk.ptr.as_ptr() as usize,
            BLOCK_OVERHEAD
        );

        let removed = arena.remove(id).unwrap();
        unsafe { backend.release(removed.chunk) };
    }
}
