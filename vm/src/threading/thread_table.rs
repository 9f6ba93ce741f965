//! The registry tying thread ids to their paging state.
//!
//! Eviction works across address spaces: it holds only a [`Tid`] per frame
//! and resolves it here when it needs the owner's page table or
//! supplemental page table. Keeping ids rather than references means a
//! frame can outlive its owner without dangling.

use super::Tid;
use crate::mem::page::SupplPageTable;
use crate::paging::PageTable;
use crate::sync::Mutex;
use alloc::{boxed::Box, collections::BTreeMap, sync::Arc};
use core::sync::atomic::{AtomicU16, Ordering};

/// The virtual-memory state of one thread.
pub struct VmThread {
    pub tid: Tid,
    pub page_table: Mutex<Box<dyn PageTable>>,
    pub spt: Mutex<SupplPageTable>,
}

/// Tid 0 is never allocated; it stands for "no thread".
const NO_THREAD: Tid = 0;

pub struct ThreadTable {
    threads: Mutex<BTreeMap<Tid, Arc<VmThread>>>,
    next_tid: AtomicU16,
    running: AtomicU16,
}

impl ThreadTable {
    pub fn new() -> Self {
        Self {
            threads: Mutex::new(BTreeMap::new()),
            next_tid: AtomicU16::new(NO_THREAD + 1),
            running: AtomicU16::new(NO_THREAD),
        }
    }

    /// Registers a new thread around its page table and returns its handle.
    pub fn register(&self, page_table: Box<dyn PageTable>) -> Arc<VmThread> {
        let tid = self.next_tid.fetch_add(1, Ordering::Relaxed);
        assert_ne!(tid, NO_THREAD, "thread ids exhausted");
        let thread = Arc::new(VmThread {
            tid,
            page_table: Mutex::new(page_table),
            spt: Mutex::new(SupplPageTable::new()),
        });
        let previous = self.threads.lock().insert(tid, Arc::clone(&thread));
        assert!(previous.is_none(), "tid {tid} registered twice");
        thread
    }

    pub fn get(&self, tid: Tid) -> Option<Arc<VmThread>> {
        self.threads.lock().get(&tid).cloned()
    }

    pub fn remove(&self, tid: Tid) -> Option<Arc<VmThread>> {
        if self.running.load(Ordering::Relaxed) == tid {
            self.running.store(NO_THREAD, Ordering::Relaxed);
        }
        self.threads.lock().remove(&tid)
    }

    /// Records which thread the scheduler is currently running.
    pub fn set_running(&self, tid: Tid) {
        self.running.store(tid, Ordering::Relaxed);
    }

    pub fn running_thread(&self) -> Option<Arc<VmThread>> {
        match self.running.load(Ordering::Relaxed) {
            NO_THREAD => None,
            tid => self.get(tid),
        }
    }
}

impl Default for ThreadTable {
    fn default() -> Self {
        Self::new()
    }
}
