//! Wiring for the virtual-memory services.
//!
//! Everything is owned here and handed out explicitly; there are no
//! process-wide globals, so a hosted embedder (or a test) can stand up as
//! many isolated instances as it likes.

use crate::block::block_core::Block;
use crate::fault::{self, FaultOutcome, PageFault};
use crate::mem::frame_table::FrameTable;
use crate::mem::page;
use crate::mem::swap::SwapManager;
use crate::paging::PageTable;
use crate::threading::{ThreadTable, Tid, VmThread};
use alloc::boxed::Box;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicUsize, Ordering};
use otteros_shared::vaddr::VirtAddr;

/// The assembled virtual-memory subsystem: one frame pool, one swap area
/// and one thread registry shared by every address space.
pub struct VmSystem {
    pub frames: FrameTable,
    pub swap: Arc<SwapManager>,
    pub threads: Arc<ThreadTable>,
    fault_count: AtomicUsize,
}

impl VmSystem {
    /// Builds the subsystem over a pool of `frame_count` frames and the
    /// given swap device.
    pub fn new(frame_count: usize, swap_device: Block) -> Self {
        let swap = Arc::new(SwapManager::new(swap_device));
        let threads = Arc::new(ThreadTable::new());
        let frames = FrameTable::new(frame_count, Arc::clone(&swap), Arc::clone(&threads));
        Self {
            frames,
            swap,
            threads,
            fault_count: AtomicUsize::new(0),
        }
    }

    /// Registers a new thread's address space.
    pub fn spawn_thread(&self, page_table: Box<dyn PageTable>) -> Arc<VmThread> {
        self.threads.register(page_table)
    }

    /// Resolves one page fault on behalf of the running thread: load the
    /// page, grow the stack, or tear the thread down. This is the only
    /// place a fault may kill a thread.
    #[must_use]
    pub fn handle_page_fault(&self, fault: PageFault) -> FaultOutcome {
        fault::handle_page_fault(self, fault)
    }

    /// Materializes the page containing `va` for `thread` without a fault,
    /// for callers that map pages eagerly (program setup, syscalls probing
    /// user buffers).
    #[must_use]
    pub fn load_page(&self, thread: &VmThread, va: VirtAddr) -> bool {
        page::load_page(thread, &self.frames, &self.swap, va)
    }

    /// Maps one zeroed stack page at `addr` for `thread`; silently does
    /// nothing if no frame can be produced.
    pub fn grow_stack(&self, thread: &VmThread, addr: VirtAddr) {
        page::grow_stack(thread, &self.frames, addr);
    }

    /// The process-exit hook: releases the thread's supplemental entries
    /// (and their swap slots), its frames, and its registry slot.
    pub fn exit_thread(&self, tid: Tid) {
        let Some(thread) = self.threads.get(tid) else {
            return;
        };
        thread.spt.lock().teardown(&self.swap);
        self.frames.free_all(tid);
        self.threads.remove(tid);
    }

    /// Page faults handled since boot.
    pub fn fault_count(&self) -> usize {
        self.fault_count.load(Ordering::Relaxed)
    }

    pub(crate) fn note_fault(&self) {
        self.fault_count.fetch_add(1, Ordering::Relaxed);
    }
}
