//! Frame records and the bump carving that happens inside them.

use std::{fmt, num::NonZeroU64, ptr::NonNull};

use crate::{block::BlockId, config::MIN_ALIGN};

/// Bytes a frame takes out of the block it is pushed onto.
pub(crate) const FRAME_OVERHEAD: usize = {
    let size = std::mem::size_of::<FrameMarker>();
    (size + MIN_ALIGN - 1) & !(MIN_ALIGN - 1)
};

/// Identifies a pushed frame.
///
/// Handles come from a per-pool generation counter, so a stale handle from an
/// earlier push never compares equal to a later frame. They only exist to check
/// that pushes and pops pair up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameHandle(NonZeroU64);

impl FrameHandle {
    pub(crate) fn from_generation(generation: NonZeroU64) -> Self {
        FrameHandle(generation)
    }

    pub(crate) fn generation(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for FrameHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "frame#{}", self.0)
    }
}

/// Placed in memory where a frame was pushed, the way a stack frame leaves
/// its header behind on the real stack.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FrameMarker {
    pub(crate) generation: u64,
    pub(crate) depth: u64,
}

/// One entry of the pool's frame stack.
#[derive(Debug)]
pub(crate) struct Frame {
    pub(crate) handle: FrameHandle,
    /// Where this frame's marker was written
    pub(crate) marker: NonNull<u8>,
    /// Next free byte of the active block
    pub(crate) cursor: NonNull<u8>,
    /// Bytes left after `cursor` in the active block
    pub(crate) free: usize,
    /// Newest block this frame acquired itself, if any
    pub(crate) blocks: Option<BlockId>,
}

impl Frame {
    /// Creates a frame whose marker goes at `at`, with `free` bytes available
    /// from `at` onwards.
    ///
    /// # Safety
    ///
    /// `at..at + free` must be writable memory inside a single live block and
    /// `free` must be at least [`FRAME_OVERHEAD`].
    pub(crate) unsafe fn carve(
        handle: FrameHandle,
        depth: usize,
        at: NonNull<u8>,
        free: usize,
        blocks: Option<BlockId>,
    ) -> Self {
        let marker = FrameMarker {
            generation: handle.generation(),
            depth: depth as u64,
        };

        // Safety: ensured by caller
        unsafe {
            at.as_ptr().cast::<FrameMarker>().write_unaligned(marker);

            Frame {
                handle,
                marker: at,
                cursor: NonNull::new_unchecked(at.as_ptr().add(FRAME_OVERHEAD)),
                free: free - FRAME_OVERHEAD,
                blocks,
            }
        }
    }

    /// Reads back the marker written by [`carve`](Frame::carve).
    pub(crate) fn read_marker(&self) -> FrameMarker {
        // Safety: the marker lives in a block held by this frame or an ancestor
        unsafe { self.marker.as_ptr().cast::<FrameMarker>().read_unaligned() }
    }

    /// Switches the frame over to a freshly acquired block.
    pub(crate) fn adopt(&mut self, id: BlockId, start: NonNull<u8>, size: usize) {
        self.blocks = Some(id);
        self.cursor = start;
        self.free = size;
    }

    /// Takes `size` bytes aligned to `align` from the active block, or returns
    /// `None` without touching anything if they do not fit.
    #[inline]
    pub(crate) fn bump(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let padding = self.cursor.as_ptr().align_offset(align);
        let needed = padding.checked_add(size)?;

        if needed > self.free {
            return None;
        }

        // Safety: cursor + needed stays inside the active block since needed <= free
        unsafe {
            let ptr = self.cursor.as_ptr().add(padding);
            self.cursor = NonNull::new_unchecked(ptr.add(size));
            self.free -= needed;

            Some(NonNull::new_unchecked(ptr))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::alloc::Layout;

    struct Buffer {
        ptr: NonNull<u8>,
        layout: Layout,
    }

    impl Buffer {
        fn new(size: usize) -> Self {
            let layout = Layout::from_size_align(size, 16).unwrap();
            let ptr = NonNull::new(unsafe { std::alloc::alloc(layout) }).unwrap();
            Buffer { ptr, layout }
        }
    }

    impl Drop for Buffer {
        fn drop(&mut self) {
            unsafe { std::alloc::dealloc(self.ptr.as_ptr(), self.layout) }
        }
    }

    fn handle(generation: u64) -> FrameHandle {
        FrameHandle::from_generation(NonZeroU64::new(generation).unwrap())
    }

    #[test]
    pub fn carve_writes_marker_test() {
        let buffer = Buffer::new(128);
        let frame = unsafe { Frame::carve(handle(3), 1, buffer.ptr, 128, None) };

        assert_eq!(frame.free, 128 - FRAME_OVERHEAD);
        assert_eq!(
            frame.cursor.as_ptr() as usize - buffer.ptr.as_ptr() as usize,
            FRAME_OVERHEAD
        );
        assert_eq!(frame.read_marker(), FrameMarker { generation: 3, depth: 1 });
    }

    #[test]
    pub fn bump_test() {
        let buffer = Buffer::new(64);
        let mut frame = unsafe { Frame::carve(handle(1), 0, buffer.ptr, 64, None) };
        let available = frame.free;

        let a = frame.bump(8, MIN_ALIGN).unwrap();
        let b = frame.bump(8, MIN_ALIGN).unwrap();
        assert_eq!(b.as_ptr() as usize - a.as_ptr() as usize, 8);
        assert_eq!(frame.free, available - 16);

        assert!(frame.bump(frame.free + 1, MIN_ALIGN).is_none());
        assert_eq!(frame.free, available - 16);

        let rest = frame.free;
        assert!(frame.bump(rest, 1).is_some());
        assert_eq!(frame.free, 0);

        let empty = frame.bump(0, 1).unwrap();
        assert_eq!(empty, frame.cursor);
    }

    #[test]
    pub fn bump_pads_for_alignment_test() {
        let buffer = Buffer::new(256);
        let mut frame = unsafe { Frame::carve(handle(1), 0, buffer.ptr, 256, None) };

        frame.bump(1, 1).unwrap();
        let aligned = frame.bump(4, 64).unwrap();
        assert_eq!(aligned.as_ptr() as usize % 64, 0);
    }

    #[test]
    pub fn handle_display_test() {
        assert_eq!(handle(42).to_string(), "frame#42");
        assert_ne!(handle(1), handle(2));
    }
}
