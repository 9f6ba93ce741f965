//! Supplemental page tables: per-thread records of how to materialize pages
//! that are not (or not yet) backed by a physical frame.

use crate::fs::FileRef;
use crate::mem::frame_table::FrameTable;
use crate::mem::swap::{SwapManager, SwapSlot};
use crate::paging::PageTable;
use crate::threading::VmThread;
use alloc::collections::BTreeMap;
use otteros_shared::mem::PAGE_FRAME_SIZE;
use otteros_shared::vaddr::VirtAddr;

/// Lazy file contents: read `read_bytes` from `offset`, zero the remaining
/// `zero_bytes` of the page.
#[derive(Clone, Debug)]
pub struct FilePage {
    pub file: FileRef,
    pub offset: u32,
    pub read_bytes: u32,
    pub zero_bytes: u32,
    pub writable: bool,
}

/// A page whose current contents sit in a swap slot.
#[derive(Clone, Copy, Debug)]
pub struct SwapPage {
    pub slot: SwapSlot,
    /// Writable bit the page table carried when the page was evicted.
    pub writable: bool,
}

/// Where a page's contents come from.
///
/// A file- or mmap-backed page that has been evicted dirty carries both its
/// file provenance and the swap slot holding its current bytes; the swap
/// copy wins until it is read back in.
#[derive(Clone, Debug)]
pub enum PageBacking {
    File(FilePage),
    Mmap(FilePage),
    Swap(SwapPage),
    SwappedFile(FilePage, SwapPage),
    SwappedMmap(FilePage, SwapPage),
}

impl PageBacking {
    pub fn file_page(&self) -> Option<&FilePage> {
        match self {
            PageBacking::File(f) | PageBacking::Mmap(f) => Some(f),
            PageBacking::SwappedFile(f, _) | PageBacking::SwappedMmap(f, _) => Some(f),
            PageBacking::Swap(_) => None,
        }
    }

    pub fn swap_page(&self) -> Option<SwapPage> {
        match self {
            PageBacking::Swap(s) => Some(*s),
            PageBacking::SwappedFile(_, s) | PageBacking::SwappedMmap(_, s) => Some(*s),
            PageBacking::File(_) | PageBacking::Mmap(_) => None,
        }
    }

    /// A clean page with this backing can be rematerialized from its file
    /// alone, so eviction need not write it to swap.
    pub fn is_file_only(&self) -> bool {
        matches!(self, PageBacking::File(_))
    }

    fn attach_swap(&mut self, swap: SwapPage) {
        use PageBacking::{File, Mmap, Swap, SwappedFile, SwappedMmap};
        let previous = core::mem::replace(self, Swap(swap));
        *self = match previous {
            File(f) | SwappedFile(f, _) => SwappedFile(f, swap),
            Mmap(f) | SwappedMmap(f, _) => SwappedMmap(f, swap),
            Swap(_) => Swap(swap),
        };
    }
}

/// One supplemental page table entry.
#[derive(Clone, Debug)]
pub struct PageEntry {
    pub backing: PageBacking,
    /// True while the page table maps this page to a resident frame.
    pub loaded: bool,
}

/// Maps each page of one thread's address space that needs lazy
/// materialization to the recipe for materializing it.
#[derive(Default)]
pub struct SupplPageTable {
    entries: BTreeMap<u32, PageEntry>,
}

impl SupplPageTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn insert(&mut self, page: VirtAddr, backing: PageBacking) -> bool {
        debug_assert!(page.is_page_aligned());
        let key = page.raw_value();
        if self.entries.contains_key(&key) {
            return false;
        }
        self.entries.insert(
            key,
            PageEntry {
                backing,
                loaded: false,
            },
        );
        true
    }

    /// Registers a file-backed page. Fails without mutating anything if the
    /// page already has an entry.
    #[must_use]
    pub fn insert_file(
        &mut self,
        file: FileRef,
        offset: u32,
        page: VirtAddr,
        read_bytes: u32,
        zero_bytes: u32,
        writable: bool,
    ) -> bool {
        assert_eq!(
            read_bytes as usize + zero_bytes as usize,
            PAGE_FRAME_SIZE,
            "file page must cover exactly one page"
        );
        self.insert(
            page,
            PageBacking::File(FilePage {
                file,
                offset,
                read_bytes,
                zero_bytes,
                writable,
            }),
        )
    }

    /// Registers a page of a memory-mapped file. Same shape as
    /// [`insert_file`](Self::insert_file), but eviction always saves these
    /// to swap rather than trusting the file copy.
    #[must_use]
    pub fn insert_mmap(
        &mut self,
        file: FileRef,
        offset: u32,
        page: VirtAddr,
        read_bytes: u32,
        zero_bytes: u32,
        writable: bool,
    ) -> bool {
        assert_eq!(
            read_bytes as usize + zero_bytes as usize,
            PAGE_FRAME_SIZE,
            "mmap page must cover exactly one page"
        );
        self.insert(
            page,
            PageBacking::Mmap(FilePage {
                file,
                offset,
                read_bytes,
                zero_bytes,
                writable,
            }),
        )
    }

    /// Exact-match lookup by page-aligned address. Absence is an expected
    /// outcome, not an error; the fault handler uses it to tell "needs
    /// loading" from "maybe stack growth, maybe garbage".
    pub fn lookup(&self, page: VirtAddr) -> Option<&PageEntry> {
        self.entries.get(&page.page_base().raw_value())
    }

    pub fn mark_loaded(&mut self, page: VirtAddr) {
        if let Some(entry) = self.entries.get_mut(&page.page_base().raw_value()) {
            entry.loaded = true;
        }
    }

    /// Records that the page's frame was reclaimed: no longer loaded, and
    /// holding a swap slot if eviction had to write one.
    ///
    /// Pages without an entry (stack pages, and pages loaded eagerly at
    /// startup) get a fresh swap-backed entry, which is the only way such a
    /// page can come back.
    pub fn record_eviction(&mut self, page: VirtAddr, slot: Option<SwapSlot>, writable: bool) {
        let key = page.page_base().raw_value();
        match self.entries.get_mut(&key) {
            Some(entry) => {
                if let Some(slot) = slot {
                    entry.backing.attach_swap(SwapPage { slot, writable });
                }
                entry.loaded = false;
            }
            None => {
                let slot = slot.expect("evicting an unrecorded page requires a swap write");
                self.entries.insert(
                    key,
                    PageEntry {
                        backing: PageBacking::Swap(SwapPage { slot, writable }),
                        loaded: false,
                    },
                );
            }
        }
    }

    /// Settles an entry after its swap copy was read back in. A pure swap
    /// entry has served its purpose and disappears; a combined entry
    /// reverts to plain file provenance, loaded.
    pub fn finish_swap_load(&mut self, page: VirtAddr) {
        let key = page.page_base().raw_value();
        let Some(entry) = self.entries.remove(&key) else {
            return;
        };
        match entry.backing {
            PageBacking::Swap(_) => {}
            PageBacking::SwappedFile(f, _) => {
                self.entries.insert(
                    key,
                    PageEntry {
                        backing: PageBacking::File(f),
                        loaded: true,
                    },
                );
            }
            PageBacking::SwappedMmap(f, _) => {
                self.entries.insert(
                    key,
                    PageEntry {
                        backing: PageBacking::Mmap(f),
                        loaded: true,
                    },
                );
            }
            backing => {
                self.entries.insert(
                    key,
                    PageEntry {
                        backing,
                        loaded: true,
                    },
                );
            }
        }
    }

    /// Releases every entry. Entries still holding swap slots give them
    /// back; nothing else scrubs swap when a thread dies.
    pub fn teardown(&mut self, swap: &SwapManager) {
        for (_, entry) in core::mem::take(&mut self.entries) {
            if let Some(swap_page) = entry.backing.swap_page() {
                swap.release(swap_page.slot);
            }
        }
    }
}

/// Materializes the page containing `va` for `thread`.
///
/// Returns false and leaves no dangling mapping or frame if the page has no
/// unloaded entry, the frame cannot be produced, or its contents cannot be
/// read.
#[must_use]
pub fn load_page(
    thread: &VmThread,
    frames: &FrameTable,
    swap: &SwapManager,
    va: VirtAddr,
) -> bool {
    let page = va.page_base();

    // Snapshot the recipe and release the table lock before touching the
    // frame table: allocation may evict, and eviction may need this very
    // table.
    let backing = {
        let spt = thread.spt.lock();
        match spt.lookup(page) {
            Some(entry) if !entry.loaded => entry.backing.clone(),
            _ => return false,
        }
    };

    match backing {
        PageBacking::File(f) | PageBacking::Mmap(f) => {
            load_file_page(thread, frames, page, &f)
        }
        PageBacking::Swap(s)
        | PageBacking::SwappedFile(_, s)
        | PageBacking::SwappedMmap(_, s) => load_swap_page(thread, frames, swap, page, s),
    }
}

fn load_file_page(
    thread: &VmThread,
    frames: &FrameTable,
    page: VirtAddr,
    file_page: &FilePage,
) -> bool {
    let Ok(frame) = frames.allocate(thread.tid, false) else {
        return false;
    };

    // The frame is not yet bound, so eviction cannot see it while we fill it.
    // SAFETY: We are the frame's only owner until it is mapped.
    let bytes = unsafe { frame.bytes_mut() };
    let read_bytes = file_page.read_bytes as usize;

    file_page.file.seek(file_page.offset);
    if file_page.file.read(&mut bytes[..read_bytes]) != read_bytes {
        frames.free(frame);
        return false;
    }
    bytes[read_bytes..].fill(0);

    if !thread.page_table.lock().map(page, frame, file_page.writable) {
        frames.free(frame);
        return false;
    }
    frames.bind(frame, page);
    thread.spt.lock().mark_loaded(page);
    true
}

fn load_swap_page(
    thread: &VmThread,
    frames: &FrameTable,
    swap: &SwapManager,
    page: VirtAddr,
    swap_page: SwapPage,
) -> bool {
    let Ok(frame) = frames.allocate(thread.tid, false) else {
        return false;
    };

    if !thread.page_table.lock().map(page, frame, swap_page.writable) {
        frames.free(frame);
        return false;
    }
    frames.bind(frame, page);

    // The entry still reads not-loaded, which keeps eviction away from this
    // frame until the copy below lands.
    // SAFETY: We own the frame; its page is mapped but its thread is here,
    // not running user code.
    if let Err(e) = swap.read_in(swap_page.slot, unsafe { frame.bytes_mut() }) {
        log::error!(
            "failed to read page {:#x} back from swap slot {}: {}",
            page.raw_value(),
            swap_page.slot.index(),
            e
        );
        thread.page_table.lock().unmap(page);
        frames.free(frame);
        return false;
    }

    thread.spt.lock().finish_swap_load(page);
    true
}

/// Maps one zeroed, writable page at the page containing `addr`.
///
/// Failure is silent: no mapping is installed and the next access simply
/// faults again.
pub fn grow_stack(thread: &VmThread, frames: &FrameTable, addr: VirtAddr) {
    let page = addr.page_base();
    let Ok(frame) = frames.allocate(thread.tid, true) else {
        log::debug!(
            "stack growth at {:#x} forgone: no frame available",
            addr.raw_value()
        );
        return;
    };

    if !thread.page_table.lock().map(page, frame, true) {
        frames.free(frame);
        return;
    }
    frames.bind(frame, page);
}
