//! The per-thread page-table capability the paging core drives.
//!
//! The hardware page directory (and its x86 layout) belongs to the
//! architecture layer; the paging core only needs to install, remove and
//! interrogate mappings, so that is all this trait exposes.

use crate::mem::frame_alloc::Frame;
use crate::sync::Mutex;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use otteros_shared::vaddr::VirtAddr;

pub trait PageTable: Send {
    /// Installs a mapping from the page containing `page` to `frame`.
    /// Returns false if the page is already mapped or the underlying table
    /// cannot be extended; no mapping is installed in that case.
    #[must_use]
    fn map(&mut self, page: VirtAddr, frame: Frame, writable: bool) -> bool;

    /// Removes the mapping for `page`, if any. Later accesses fault.
    fn unmap(&mut self, page: VirtAddr);

    /// The frame `addr` currently maps to, if any.
    fn translate(&self, addr: VirtAddr) -> Option<Frame>;

    fn is_writable(&self, page: VirtAddr) -> bool;

    /// Whether the hardware has marked the page written-to.
    fn is_dirty(&self, page: VirtAddr) -> bool;

    /// Whether the hardware has marked the page referenced.
    fn is_accessed(&self, page: VirtAddr) -> bool;

    fn clear_accessed(&mut self, page: VirtAddr);
}

struct SoftPte {
    frame: Frame,
    writable: bool,
    accessed: bool,
    dirty: bool,
}

/// A software page table for hosted runs.
///
/// Nothing sets the accessed and dirty bits by itself; the embedder models
/// memory accesses through [`SoftPageTable::access`] (or the explicit
/// setters), which is exactly what a paging simulator or a test wants.
#[derive(Default)]
pub struct SoftPageTable {
    entries: BTreeMap<u32, SoftPte>,
}

impl SoftPageTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mapped_pages(&self) -> usize {
        self.entries.len()
    }

    /// Models one user access to `addr`. Returns false if the access would
    /// fault (unmapped, or a write through a read-only mapping); otherwise
    /// updates the accessed and dirty bits like the MMU would.
    pub fn access(&mut self, addr: VirtAddr, write: bool) -> bool {
        let Some(pte) = self.entries.get_mut(&addr.page_base().raw_value()) else {
            return false;
        };
        if write && !pte.writable {
            return false;
        }
        pte.accessed = true;
        pte.dirty |= write;
        true
    }

    pub fn set_accessed(&mut self, page: VirtAddr, accessed: bool) {
        if let Some(pte) = self.entries.get_mut(&page.page_base().raw_value()) {
            pte.accessed = accessed;
        }
    }

    pub fn set_dirty(&mut self, page: VirtAddr, dirty: bool) {
        if let Some(pte) = self.entries.get_mut(&page.page_base().raw_value()) {
            pte.dirty = dirty;
        }
    }
}

impl PageTable for SoftPageTable {
    fn map(&mut self, page: VirtAddr, frame: Frame, writable: bool) -> bool {
        debug_assert!(page.is_page_aligned());
        let key = page.raw_value();
        if self.entries.contains_key(&key) {
            return false;
        }
        self.entries.insert(
            key,
            SoftPte {
                frame,
                writable,
                accessed: false,
                dirty: false,
            },
        );
        true
    }

    fn unmap(&mut self, page: VirtAddr) {
        self.entries.remove(&page.page_base().raw_value());
    }

    fn translate(&self, addr: VirtAddr) -> Option<Frame> {
        self.entries
            .get(&addr.page_base().raw_value())
            .map(|pte| pte.frame)
    }

    fn is_writable(&self, page: VirtAddr) -> bool {
        self.entries
            .get(&page.page_base().raw_value())
            .is_some_and(|pte| pte.writable)
    }

    fn is_dirty(&self, page: VirtAddr) -> bool {
        self.entries
            .get(&page.page_base().raw_value())
            .is_some_and(|pte| pte.dirty)
    }

    fn is_accessed(&self, page: VirtAddr) -> bool {
        self.entries
            .get(&page.page_base().raw_value())
            .is_some_and(|pte| pte.accessed)
    }

    fn clear_accessed(&mut self, page: VirtAddr) {
        self.set_accessed(page, false);
    }
}

/// A cloneable handle to a [`SoftPageTable`].
///
/// The paging core takes ownership of each thread's page table, but a
/// hosted simulator still has to play MMU: set accessed and dirty bits,
/// model loads and stores. Handing the core one of these and keeping a
/// clone gives both sides access.
#[derive(Clone, Default)]
pub struct SharedPageTable(Arc<Mutex<SoftPageTable>>);

impl SharedPageTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut SoftPageTable) -> R) -> R {
        f(&mut self.0.lock())
    }
}

impl PageTable for SharedPageTable {
    fn map(&mut self, page: VirtAddr, frame: Frame, writable: bool) -> bool {
        self.0.lock().map(page, frame, writable)
    }

    fn unmap(&mut self, page: VirtAddr) {
        self.0.lock().unmap(page);
    }

    fn translate(&self, addr: VirtAddr) -> Option<Frame> {
        self.0.lock().translate(addr)
    }

    fn is_writable(&self, page: VirtAddr) -> bool {
        self.0.lock().is_writable(page)
    }

    fn is_dirty(&self, page: VirtAddr) -> bool {
        self.0.lock().is_dirty(page)
    }

    fn is_accessed(&self, page: VirtAddr) -> bool {
        self.0.lock().is_accessed(page)
    }

    fn clear_accessed(&mut self, page: VirtAddr) {
        self.0.lock().clear_accessed(page);
    }
}
