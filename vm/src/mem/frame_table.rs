//! The table of resident frames and the clock eviction policy that reclaims
//! them under memory pressure.

use crate::mem::frame_alloc::{Frame, FramePool};
use crate::mem::swap::{SwapError, SwapManager};
use crate::paging::PageTable;
use crate::sync::Mutex;
use crate::threading::{ThreadTable, Tid};
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};
use otteros_shared::vaddr::VirtAddr;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FrameError {
    /// Two clock passes found nothing to evict.
    NoVictim,
    /// The victim's page could not be persisted.
    Swap(SwapError),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FrameError::NoVictim => write!(f, "no frame available for eviction"),
            FrameError::Swap(e) => write!(f, "could not save evicted frame: {e}"),
        }
    }
}

impl core::error::Error for FrameError {}

struct FrameEntry {
    frame: Frame,
    /// The thread the frame is allocated to.
    tid: Tid,
    /// The virtual page the frame backs, set by [`FrameTable::bind`]. A
    /// frame with no page is mid-setup and never considered for eviction.
    page: Option<VirtAddr>,
}

/// All resident frames, in insertion order.
///
/// The order doubles as the clock hand: eviction scans from the front and
/// pushes the chosen victim to the back, so recently reclaimed frames are
/// the last to be reconsidered.
pub struct FrameTable {
    pool: Mutex<FramePool>,
    table: Mutex<VecDeque<FrameEntry>>,
    /// Serializes whole evictions. Two concurrent evictions must never
    /// select the same victim or double-allocate a swap slot.
    eviction: Mutex<()>,
    threads: Arc<ThreadTable>,
    swap: Arc<SwapManager>,
    evictions: AtomicUsize,
}

impl FrameTable {
    pub fn new(frame_count: usize, swap: Arc<SwapManager>, threads: Arc<ThreadTable>) -> Self {
        Self {
            pool: Mutex::new(FramePool::new(frame_count)),
            table: Mutex::new(VecDeque::with_capacity(frame_count)),
            eviction: Mutex::new(()),
            threads,
            swap,
            evictions: AtomicUsize::new(0),
        }
    }

    /// Hands `tid` a frame, evicting one if the pool is dry.
    ///
    /// The frame is registered but not yet bound to a page; call
    /// [`bind`](Self::bind) once it is mapped. Failure here means eviction
    /// itself failed, which callers treat as unrecoverable for the current
    /// operation.
    pub fn allocate(&self, tid: Tid, zero: bool) -> Result<Frame, FrameError> {
        let fresh = self.pool.lock().alloc(zero);
        if let Some(frame) = fresh {
            self.table.lock().push_back(FrameEntry {
                frame,
                tid,
                page: None,
            });
            return Ok(frame);
        }
        self.evict(tid)
    }

    /// Records the virtual page `frame` now backs, making it evictable.
    pub fn bind(&self, frame: Frame, page: VirtAddr) {
        let mut table = self.table.lock();
        let entry = table
            .iter_mut()
            .find(|entry| entry.frame == frame)
            .expect("binding a frame that is not registered");
        entry.page = Some(page.page_base());
    }

    /// Unregisters `frame` and returns it to the pool. The caller must have
    /// unmapped it already; the frame has exactly one owner and this ends
    /// its ownership.
    pub fn free(&self, frame: Frame) {
        let mut table = self.table.lock();
        if let Some(index) = table.iter().position(|entry| entry.frame == frame) {
            table.remove(index);
        }
        self.pool.lock().dealloc(frame);
    }

    /// Returns every frame owned by `tid` to the pool, as part of tearing
    /// the thread's address space down.
    pub fn free_all(&self, tid: Tid) {
        let mut table = self.table.lock();
        let mut pool = self.pool.lock();
        let mut index = 0;
        while index < table.len() {
            if table[index].tid == tid {
                let entry = table.remove(index).expect("index is in range");
                pool.dealloc(entry.frame);
            } else {
                index += 1;
            }
        }
    }

    pub fn capacity(&self) -> usize {
        self.pool.lock().capacity()
    }

    /// Number of frames currently registered.
    pub fn resident(&self) -> usize {
        self.table.lock().len()
    }

    /// Number of successful evictions since boot.
    pub fn evictions(&self) -> usize {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Reclaims a frame for `for_tid`.
    ///
    /// Selection, persisting the victim's contents and retargeting the
    /// frame all happen under the eviction lock, with the table lock held
    /// throughout so nothing can free or rebind the victim mid-flight.
    fn evict(&self, for_tid: Tid) -> Result<Frame, FrameError> {
        let _eviction = self.eviction.lock();
        let mut table = self.table.lock();

        let Some(index) = self.choose_victim(&table) else {
            log::error!("frame pool exhausted and no frame is evictable");
            return Err(FrameError::NoVictim);
        };
        let mut entry = table.remove(index).expect("victim index is in range");

        match self.save_victim(&entry) {
            Ok(()) => {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                let frame = entry.frame;
                entry.tid = for_tid;
                entry.page = None;
                table.push_back(entry);
                Ok(frame)
            }
            Err(e) => {
                log::error!("failed to save evicted frame to swap: {e}");
                table.push_back(entry);
                Err(FrameError::Swap(e))
            }
        }
    }

    /// Second-chance scan. Accessed frames get their bit cleared and are
    /// passed over; the bits cleared in the first pass guarantee the second
    /// finds a victim if one can exist at all.
    fn choose_victim(&self, table: &VecDeque<FrameEntry>) -> Option<usize> {
        for _round in 0..2 {
            for index in 0..table.len() {
                let entry = &table[index];
                let Some(page) = entry.page else {
                    continue;
                };
                // The owner may already be mid-exit; its frames are about to
                // be freed, so don't fight over them.
                let Some(thread) = self.threads.get(entry.tid) else {
                    continue;
                };

                {
                    let mut page_table = thread.page_table.lock();
                    if page_table.is_accessed(page) {
                        page_table.clear_accessed(page);
                        continue;
                    }
                }

                // A mapped page whose entry is not loaded yet is still being
                // filled; evicting it would tear the load in half.
                let loading = thread
                    .spt
                    .lock()
                    .lookup(page)
                    .is_some_and(|entry| !entry.loaded);
                if !loading {
                    return Some(index);
                }
            }
        }
        None
    }

    /// Persists the victim's contents so the owner can fault it back later,
    /// then strips the mapping.
    fn save_victim(&self, entry: &FrameEntry) -> Result<(), SwapError> {
        let page = entry.page.expect("victims are always bound");
        let Some(thread) = self.threads.get(entry.tid) else {
            // Owner exited after selection; the contents no longer matter,
            // but the next owner must not see them.
            // SAFETY: The owner is gone, so nothing else references the frame.
            unsafe { entry.frame.zero() };
            return Ok(());
        };

        let mut page_table = thread.page_table.lock();
        let mut spt = thread.spt.lock();

        let dirty = page_table.is_dirty(page);
        let writable = page_table.is_writable(page);
        let file_backed = spt
            .lookup(page)
            .is_some_and(|entry| entry.backing.is_file_only());

        // A clean page that came straight from a file reloads from the file;
        // everything else must go to swap.
        let slot = if dirty || !file_backed {
            // SAFETY: The frame is owned by the victim thread, which is not
            // running here; stale TLB entries on other cores are out of
            // scope for this kernel.
            Some(self.swap.write_out(unsafe { entry.frame.bytes() })?)
        } else {
            None
        };

        spt.record_eviction(page, slot, writable);
        // SAFETY: As above. Scrub the frame so its next owner cannot read
        // the victim's memory.
        unsafe { entry.frame.zero() };
        page_table.unmap(page);
        Ok(())
    }
}
