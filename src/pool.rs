//! The Pool allows the creation of "Frames" which memory is bump
//! allocated from.  Frames are pushed and popped in stack order,
//! and popping a frame hands every block it acquired back to the
//! [`Backend`] in one go.  [`malloc`](Pool::malloc) always works on
//! the frame at the top of the stack.

use std::{fmt, num::NonZeroU64, ptr::NonNull};

use crate::{
    backend::{Backend, HeapBackend},
    block::{chunk_request, Block, BlockArena, BlockId, BLOCK_OVERHEAD},
    config::{round_to_word, PoolConfig, MIN_ALIGN},
    error::{DestroyError, PoolError, Result},
    frame::{Frame, FrameHandle, FrameMarker, FRAME_OVERHEAD},
};

/// A stack of frames backed by blocks from a [`Backend`].
///
/// Memory handed out by [`malloc`](Pool::malloc) stays valid until the frame
/// that was on top when it was allocated is popped.  Nothing is freed
/// individually.
///
/// # Examples
///
/// ```
/// use stack_frame_pool::Pool;
///
/// let mut pool = Pool::new();
///
/// let outer = pool.push().unwrap();
/// let a = pool.malloc(16).unwrap();
/// unsafe { a.as_ptr().write_bytes(1, 16) };
///
/// let inner = pool.push().unwrap();
/// pool.malloc(4096).unwrap();
/// pool.pop_frame(inner);
///
/// // outer allocations survive the inner frame
/// assert_eq!(unsafe { *a.as_ptr().add(15) }, 1);
///
/// pool.pop_frame(outer);
/// pool.destroy().unwrap();
/// ```
///
/// A pool is not [`Sync`].  Share one between threads by wrapping the whole
/// push, malloc, pop sequence in a lock, or give every thread its own pool.
pub struct Pool<B: Backend = HeapBackend> {
    frames: Vec<Frame>,
    blocks: BlockArena,
    backend: B,
    config: PoolConfig,
    generation: u64,
}

/// A snapshot of how much memory a pool is holding.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Frames on the stack
    pub depth: usize,
    /// Blocks currently held from the backend
    pub blocks: usize,
    /// Usable bytes across those blocks
    pub reserved_bytes: usize,
    /// Bytes the top frame can still hand out without growing
    pub available: usize,
}

impl Pool<HeapBackend> {
    /// Creates a pool over the heap with the default configuration.
    pub fn new() -> Self {
        Self::with_backend(HeapBackend)
    }
}

impl Default for Pool<HeapBackend> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> Pool<B> {
    /// Creates a pool drawing blocks from `backend`, with the default
    /// configuration.
    pub fn with_backend(backend: B) -> Self {
        Pool {
            frames: Vec::new(),
            blocks: BlockArena::default(),
            backend,
            config: PoolConfig::default(),
            generation: 0,
        }
    }

    /// Creates a pool with an explicit configuration.
    pub fn with_config(config: PoolConfig, backend: B) -> Result<Self> {
        config.validate()?;

        let mut pool = Self::with_backend(backend);
        pool.config = config;
        Ok(pool)
    }

    /// Tears the pool down and returns its backend.
    ///
    /// Fails if frames are still on the stack; the pool comes back inside
    /// the error untouched.
    pub fn destroy(self) -> std::result::Result<B, DestroyError<B>> {
        if !self.frames.is_empty() {
            let frames = self.frames.len();
            return Err(DestroyError { pool: self, frames });
        }

        let mut pool = std::mem::ManuallyDrop::new(self);

        // Safety: pool is never touched again after its fields are read out
        unsafe {
            std::ptr::drop_in_place(&mut pool.frames);
            std::ptr::drop_in_place(&mut pool.blocks);
            Ok(std::ptr::read(&pool.backend))
        }
    }

    /// The current growth configuration.
    pub fn config(&self) -> PoolConfig {
        self.config
    }

    /// Sets how many usable bytes each new block gets.
    ///
    /// Blocks that already exist keep their size.
    pub fn set_block_size(&mut self, bytes: usize) -> Result<()> {
        let config = self.config.with_block_size(bytes);
        config.validate()?;

        tracing::debug!(block_size = bytes, "pool block size changed");
        self.config = config;
        Ok(())
    }

    /// Sets the multiplier applied to requests of at least one block size.
    pub fn set_growth_multiplier(&mut self, factor: usize) -> Result<()> {
        let config = self.config.with_growth_multiplier(factor);
        config.validate()?;

        tracing::debug!(growth_multiplier = factor, "pool growth multiplier changed");
        self.config = config;
        Ok(())
    }

    /// Replaces the backend, returning the previous one.
    ///
    /// Blocks must be released by the backend that allocated them, so this
    /// is rejected while any frame is on the stack.
    pub fn set_backend(&mut self, backend: B) -> Result<B> {
        if !self.frames.is_empty() || self.blocks.len() != 0 {
            return Err(PoolError::BackendInUse {
                frames: self.frames.len(),
            });
        }

        tracing::debug!(backend = ?backend, "pool backend replaced");
        Ok(std::mem::replace(&mut self.backend, backend))
    }

    /// The backend blocks are drawn from.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Mutable access to the backend, for reading or resetting counters.
    ///
    /// Blocks already handed out must still be released by this backend, so
    /// only touch its bookkeeping, never the chunks it tracks.
    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Number of frames on the stack.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Returns true if no frame is on the stack.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Handle of the frame on top of the stack.
    pub fn top(&self) -> Option<FrameHandle> {
        self.frames.last().map(|frame| frame.handle)
    }

    /// A snapshot of the memory held by the pool.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            depth: self.frames.len(),
            blocks: self.blocks.len(),
            reserved_bytes: self.blocks.reserved_bytes(),
            available: self.frames.last().map_or(0, |frame| frame.free),
        }
    }

    /// Pushes a new frame onto the stack.
    ///
    /// The frame is carved out of the space left in the current top frame's
    /// block when there is room for it, otherwise it gets a fresh block of
    /// its own.  On failure the stack is left as it was.
    pub fn push(&mut self) -> Result<FrameHandle> {
        let generation = self
            .generation
            .checked_add(1)
            .and_then(NonZeroU64::new)
            .ok_or(PoolError::GenerationExhausted)?;
        let handle = FrameHandle::from_generation(generation);
        let depth = self.frames.len();

        let spare = self
            .frames
            .last()
            .filter(|previous| previous.free >= FRAME_OVERHEAD)
            .map(|previous| (previous.cursor, previous.free));

        let frame = match spare {
            // Safety: cursor..cursor + free is unused space of a live block,
            // which outlives the new frame since frames pop in order
            Some((cursor, free)) => unsafe { Frame::carve(handle, depth, cursor, free, None) },
            None => {
                // block_size >= FRAME_OVERHEAD, checked by PoolConfig::validate
                let id = self.add_block(None, self.config.block_size)?;
                let block = self.block(id);

                // Safety: the block was just acquired and holds at least block_size bytes
                unsafe { Frame::carve(handle, depth, block.start(), block.size, Some(id)) }
            }
        };

        tracing::trace!(
            frame = %handle,
            depth = depth + 1,
            borrowed = frame.blocks.is_none(),
            "pushed frame"
        );

        self.generation = generation.get();
        self.frames.push(frame);
        Ok(handle)
    }

    /// Pops the top frame, releasing every block it acquired.
    ///
    /// Returns the popped frame's handle so the caller can check it against
    /// the one [`push`](Pool::push) gave out.  Prefer
    /// [`pop_frame`](Pool::pop_frame), which does that check before anything
    /// is torn down.
    pub fn pop(&mut self) -> Result<FrameHandle> {
        let frame = self.frames.pop().ok_or(PoolError::EmptyStack)?;

        debug_assert_eq!(
            frame.read_marker(),
            FrameMarker {
                generation: frame.handle.generation(),
                depth: self.frames.len() as u64,
            },
            "frame marker overwritten, memory was written past the end of an allocation"
        );

        let mut released = 0usize;
        let mut next = frame.blocks;
        while let Some(id) = next {
            next = self.remove_block(id);
            released += 1;
        }

        tracing::trace!(
            frame = %frame.handle,
            depth = self.frames.len(),
            released,
            "popped frame"
        );

        Ok(frame.handle)
    }

    /// Pops the top frame after checking that it is `expected`.
    ///
    /// # Panics
    ///
    /// Panics without popping anything if the stack is empty or its top is
    /// not `expected`.  Carrying on would tear down a frame whose memory is
    /// still in use.  Build with `panic = "abort"` to make this abort the
    /// process.
    pub fn pop_frame(&mut self, expected: FrameHandle) {
        match self.top() {
            Some(top) if top == expected => {}
            top => {
                tracing::error!(
                    expected = %expected,
                    top = ?top,
                    depth = self.frames.len(),
                    "unbalanced frame stack"
                );
                panic!(
                    "unbalanced frame stack: expected to pop {}, found {:?}",
                    expected, top
                );
            }
        }

        // cannot fail, the top was just checked
        let _ = self.pop();
    }

    /// Allocates `size` bytes from the top frame.
    ///
    /// The pointer is aligned to [`MIN_ALIGN`] and stays valid until that
    /// frame is popped.  A zero sized request reserves nothing and returns the
    /// frame's cursor, which must not be written through.
    pub fn malloc(&mut self, size: usize) -> Result<NonNull<u8>> {
        self.malloc_aligned(size, MIN_ALIGN)
    }

    /// Allocates `size` bytes aligned to `align` from the top frame.
    pub fn malloc_aligned(&mut self, size: usize, align: usize) -> Result<NonNull<u8>> {
        if !align.is_power_of_two() {
            return Err(PoolError::InvalidAlignment { align });
        }

        let align = align.max(MIN_ALIGN);
        let requested = size;
        let size = round_to_word(size)?;

        let top = self.frames.len().checked_sub(1).ok_or(PoolError::EmptyStack)?;
        if let Some(ptr) = self.frames[top].bump(size, align) {
            return Ok(ptr);
        }

        // fresh blocks start word aligned, anything stricter may need padding
        let needed = size
            .checked_add(align - MIN_ALIGN)
            .ok_or(PoolError::CapacityOverflow { size })?;
        // the growth policy sees the caller's size, rounding only sets a floor
        let request = self.config.growth_request(requested)?.max(needed);

        let head = self.frames[top].blocks;
        let id = self.add_block(head, request)?;
        let block = self.block(id);
        let (start, usable) = (block.start(), block.size);

        let fits = start
            .as_ptr()
            .align_offset(align)
            .checked_add(size)
            .is_some_and(|end| end <= usable);
        if !fits {
            // the block was never linked into the frame, so the frame is untouched
            self.remove_block(id);
            return Err(PoolError::ShortChunk { requested: needed, actual: usable });
        }

        let frame = &mut self.frames[top];
        frame.adopt(id, start, usable);
        frame
            .bump(size, align)
            .ok_or(PoolError::ShortChunk { requested: needed, actual: usable })
    }

    /// Allocates room for a `T` in the top frame and moves `value` into it.
    ///
    /// The value is never dropped; popping the frame only releases its
    /// memory.
    pub fn alloc_value<T>(&mut self, value: T) -> Result<NonNull<T>> {
        let ptr = self
            .malloc_aligned(std::mem::size_of::<T>(), std::mem::align_of::<T>())?
            .cast::<T>();

        // Safety: ptr is fresh, properly aligned and large enough for a T
        unsafe { ptr.as_ptr().write(value) };

        Ok(ptr)
    }

    /// Acquires a block with `requested` usable bytes and links `previous`
    /// behind it.  Nothing changes if the backend refuses.
    pub(crate) fn add_block(&mut self, previous: Option<BlockId>, requested: usize) -> Result<BlockId> {
        let size = chunk_request(requested).ok_or(PoolError::CapacityOverflow { size: requested })?;
        let chunk = self.backend.allocate(size)?;

        if chunk.size < size {
            // Safety: chunk was just returned by this backend
            unsafe { self.backend.release(chunk) };
            return Err(PoolError::ShortChunk {
                requested: size,
                actual: chunk.size,
            });
        }

        let block = Block {
            chunk,
            size: chunk.size - BLOCK_OVERHEAD,
            previous,
        };
        let usable = block.size;
        let id = self.blocks.insert(block);
        self.block(id).write_header(id);

        tracing::trace!(requested = size, usable, blocks = self.blocks.len(), "acquired block");

        Ok(id)
    }

    /// Releases a block and returns the one chained before it.
    pub(crate) fn remove_block(&mut self, id: BlockId) -> Option<BlockId> {
        let block = self.blocks.remove(id)?;

        debug_assert_eq!(
            block.read_header().size,
            block.size,
            "block header overwritten"
        );

        tracing::trace!(size = block.size, blocks = self.blocks.len(), "released block");

        // Safety: every block in the arena came from this backend and is
        // released exactly once, when it leaves the arena
        unsafe { self.backend.release(block.chunk) };

        block.previous
    }

    fn block(&self, id: BlockId) -> &Block {
        match self.blocks.get(id) {
            Some(block) => block,
            None => unreachable!("block ids are only handed out for live blocks"),
        }
    }
}

impl<B: Backend> Drop for Pool<B> {
    fn drop(&mut self) {
        if !self.frames.is_empty() {
            tracing::warn!(
                depth = self.frames.len(),
                "pool dropped with frames still on the stack, releasing them"
            );
        }

        while self.pop().is_ok() {}
    }
}

impl<B: Backend> fmt::Debug for Pool<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        struct Frames<'p, B: Backend>(&'p Pool<B>);

        impl<B: Backend> fmt::Debug for Frames<'_, B> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                // top of stack first
                f.debug_list()
                    .entries(self.0.frames.iter().rev().map(|frame| {
                        format!(
                            "{} free={} blocks={}",
                            frame.handle,
                            frame.free,
                            self.0.blocks.chain(frame.blocks).count()
                        )
                    }))
                    .finish()
            }
        }

        f.debug_struct("Pool")
            .field("frames", &Frames(self))
            .field("stats", &self.stats())
            .field("config", &self.config)
            .field("backend", &self.backend)
            .finish()
    }
}

// Safety: the pool exclusively owns its blocks, the raw pointers it holds
// never alias memory owned by anyone else
unsafe impl<B: Backend + Send> Send for Pool<B> {}
