//! The pool of physical frames that user pages are materialized into.

use alloc::{boxed::Box, vec};
use bitbybit::bitfield;
use core::alloc::Layout;
use core::ptr::NonNull;
use otteros_shared::mem::PAGE_FRAME_SIZE;

#[bitfield(u8, default = 0)]
pub struct CoreMapEntry {
    #[bit(0, rw)]
    allocated: bool,
    #[bit(1, rw)]
    pinned: bool,
}

/// A handle to one page of physical memory drawn from a [`FramePool`].
///
/// The handle is freely copyable; ownership is a protocol, not a type-level
/// guarantee: a frame belongs to exactly one thread from allocation until it
/// is freed or its identity is overwritten during eviction.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Frame {
    base: NonNull<u8>,
}

// SAFETY: A Frame is an address. Access to the memory behind it is governed
// by the single-owner protocol documented above.
unsafe impl Send for Frame {}
unsafe impl Sync for Frame {}

impl Frame {
    pub fn addr(self) -> usize {
        self.base.as_ptr() as usize
    }

    /// # Safety
    ///
    /// The caller must own the frame, and no other reference to its contents
    /// may be live.
    pub unsafe fn bytes<'a>(self) -> &'a [u8; PAGE_FRAME_SIZE] {
        &*self.base.as_ptr().cast()
    }

    /// # Safety
    ///
    /// As [`Frame::bytes`].
    pub unsafe fn bytes_mut<'a>(self) -> &'a mut [u8; PAGE_FRAME_SIZE] {
        &mut *self.base.as_ptr().cast()
    }

    /// # Safety
    ///
    /// As [`Frame::bytes`].
    pub unsafe fn zero(self) {
        self.base.as_ptr().write_bytes(0, PAGE_FRAME_SIZE);
    }
}

/// A fixed-size pool of page-aligned frames with a core map tracking which
/// are in use.
pub struct FramePool {
    base: NonNull<u8>,
    layout: Layout,
    core_map: Box<[CoreMapEntry]>,
    frames_allocated: usize,
    /// Next-fit start position for the free scan.
    position: usize,
}

// SAFETY: The pool owns its backing region exclusively.
unsafe impl Send for FramePool {}

impl FramePool {
    /// Creates a pool of `frame_count` zeroed frames.
    ///
    /// Panics if the backing region cannot be allocated; a kernel that
    /// cannot reserve its user pool cannot run.
    pub fn new(frame_count: usize) -> Self {
        assert!(frame_count > 0, "frame pool must hold at least one frame");
        let layout = Layout::from_size_align(frame_count * PAGE_FRAME_SIZE, PAGE_FRAME_SIZE)
            .expect("frame pool layout overflowed");
        // SAFETY: layout has non-zero size.
        let base = unsafe { alloc::alloc::alloc_zeroed(layout) };
        let base = NonNull::new(base).expect("failed to reserve the frame pool");
        Self {
            base,
            layout,
            core_map: vec![CoreMapEntry::DEFAULT; frame_count].into_boxed_slice(),
            frames_allocated: 0,
            position: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.core_map.len()
    }

    pub fn frames_allocated(&self) -> usize {
        self.frames_allocated
    }

    fn frame_at(&self, index: usize) -> Frame {
        // SAFETY: index is within the pool, so the offset stays inside the
        // backing region.
        let ptr = unsafe { self.base.as_ptr().add(index * PAGE_FRAME_SIZE) };
        Frame {
            base: NonNull::new(ptr).expect("frame address can't be null"),
        }
    }

    fn index_of(&self, frame: Frame) -> usize {
        let offset = frame.addr() - self.base.as_ptr() as usize;
        debug_assert_eq!(offset % PAGE_FRAME_SIZE, 0);
        offset / PAGE_FRAME_SIZE
    }

    /// Allocates one frame, next-fit. Returns [`None`] when the pool is
    /// exhausted; reclaiming frames from their owners is the frame table's
    /// job, not the pool's.
    pub fn alloc(&mut self, zero: bool) -> Option<Frame> {
        let total = self.core_map.len();
        if self.frames_allocated == total {
            return None;
        }

        for scanned in 0..total {
            let index = (self.position + scanned) % total;
            if self.core_map[index].allocated() {
                continue;
            }
            self.core_map[index] = self.core_map[index].with_allocated(true);
            self.frames_allocated += 1;
            self.position = (index + 1) % total;

            let frame = self.frame_at(index);
            if zero {
                // SAFETY: The frame was free, so nobody else references it.
                unsafe { frame.zero() };
            }
            return Some(frame);
        }

        None
    }

    /// Returns a frame to the pool. Panics if the frame is not currently
    /// allocated, which would mean a double free.
    pub fn dealloc(&mut self, frame: Frame) {
        let index = self.index_of(frame);
        assert!(
            self.core_map[index].allocated(),
            "freeing frame {:#x} which is not allocated",
            frame.addr()
        );
        self.core_map[index] = self.core_map[index].with_allocated(false);
        self.frames_allocated -= 1;
    }
}

impl Drop for FramePool {
    fn drop(&mut self) {
        // SAFETY: base was allocated with this exact layout in new().
        unsafe { alloc::alloc::dealloc(self.base.as_ptr(), self.layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_are_unique_and_aligned() {
        let mut pool = FramePool::new(4);
        let mut seen = alloc::vec::Vec::new();
        for _ in 0..4 {
            let frame = pool.alloc(false).expect("pool should have room");
            assert_eq!(frame.addr() % PAGE_FRAME_SIZE, 0);
            assert!(!seen.contains(&frame.addr()));
            seen.push(frame.addr());
        }
        assert!(pool.alloc(false).is_none());
    }

    #[test]
    fn dealloc_makes_room() {
        let mut pool = FramePool::new(2);
        let a = pool.alloc(false).expect("pool should have room");
        let _b = pool.alloc(false).expect("pool should have room");
        assert!(pool.alloc(false).is_none());

        pool.dealloc(a);
        assert_eq!(pool.frames_allocated(), 1);
        assert!(pool.alloc(false).is_some());
    }

    #[test]
    fn zeroed_allocation_scrubs_old_contents() {
        let mut pool = FramePool::new(1);
        let frame = pool.alloc(false).expect("pool should have room");
        // SAFETY: we are the frame's only owner.
        unsafe { frame.bytes_mut()[123] = 0xAB };
        pool.dealloc(frame);

        let frame = pool.alloc(true).expect("pool should have room");
        // SAFETY: as above.
        assert!(unsafe { frame.bytes() }.iter().all(|&b| b == 0));
    }

    #[test]
    #[should_panic(expected = "not allocated")]
    fn double_free_panics() {
        let mut pool = FramePool::new(1);
        let frame = pool.alloc(false).expect("pool should have room");
        pool.dealloc(frame);
        pool.dealloc(frame);
    }
}
