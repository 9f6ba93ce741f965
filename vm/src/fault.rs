//! Page-fault classification: the single entry point the trap layer calls
//! when a user access cannot be satisfied.

use crate::mem::page;
use crate::paging::PageTable;
use crate::system::VmSystem;
use bitbybit::bitfield;
use otteros_shared::mem::MAX_STACK_SIZE;
use otteros_shared::vaddr::VirtAddr;

/// x86 page-fault error code, pushed by the CPU alongside the trap.
///
/// `present` set means the fault hit a present page (a rights violation
/// rather than a missing mapping); `write` distinguishes writes from reads;
/// `user` is set for faults taken in user mode.
#[bitfield(u32, default = 0)]
pub struct FaultErrorCode {
    #[bit(0, rw)]
    present: bool,
    #[bit(1, rw)]
    write: bool,
    #[bit(2, rw)]
    user: bool,
}

/// Everything the trap layer hands over about one page fault.
#[derive(Clone, Copy)]
pub struct PageFault {
    /// The address whose access faulted, read from CR2.
    pub addr: VirtAddr,
    pub code: FaultErrorCode,
    /// Stack pointer of the interrupted context, for the stack-growth
    /// heuristic.
    pub esp: u32,
}

/// What the trap layer should do with the interrupted thread.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FaultOutcome {
    /// The fault was resolved (or deliberately left for a retry); resume
    /// the thread.
    Handled,
    /// The thread could not be saved and its VM state is already torn
    /// down; do not resume it.
    Terminated,
}

/// PUSHA can touch up to 32 bytes below the stack pointer before the
/// stack has grown to cover them.
const STACK_SLACK: u32 = 32;

fn within_stack_window(addr: VirtAddr, esp: u32) -> bool {
    addr.raw_value() >= esp.saturating_sub(STACK_SLACK)
        && otteros_shared::mem::OFFSET - addr.page_base().raw_value() <= MAX_STACK_SIZE
}

pub(crate) fn handle_page_fault(system: &VmSystem, fault: PageFault) -> FaultOutcome {
    let thread = system
        .threads
        .running_thread()
        .expect("page fault with no running thread");
    system.note_fault();

    let addr = fault.addr;
    let terminate = |reason: &str| {
        log::info!(
            "thread {}: dying due to page fault at {:#x} ({reason})",
            thread.tid,
            addr.raw_value()
        );
        system.exit_thread(thread.tid);
        FaultOutcome::Terminated
    };

    // A fault on a present page is a rights violation, e.g. a write through
    // a read-only mapping. There is nothing to load; the access is simply
    // illegal.
    if fault.code.present() {
        return terminate("rights violation");
    }

    if addr.is_null() || !addr.is_user() {
        return terminate("address outside user space");
    }

    let page = addr.page_base();
    let loaded = {
        let spt = thread.spt.lock();
        spt.lookup(page).map(|entry| entry.loaded)
    };

    match loaded {
        Some(false) => {
            if page::load_page(&thread, &system.frames, &system.swap, page) {
                FaultOutcome::Handled
            } else {
                terminate("page could not be loaded")
            }
        }
        None if within_stack_window(addr, fault.esp) => {
            // Growth failure installs nothing; the thread will just fault
            // here again.
            page::grow_stack(&thread, &system.frames, addr);
            FaultOutcome::Handled
        }
        _ => {
            let stale_mapping = thread.page_table.lock().translate(addr).is_some();
            log::error!(
                "page fault at {:#x}: {} error {} page in {} context{}",
                addr.raw_value(),
                if fault.code.present() {
                    "rights violation"
                } else {
                    "not present"
                },
                if fault.code.write() { "writing" } else { "reading" },
                if fault.code.user() { "user" } else { "kernel" },
                if stale_mapping {
                    " (page is mapped but has no usable record)"
                } else {
                    ""
                },
            );
            terminate("unrecoverable fault")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::block_core::{Block, BlockSector};
    use crate::drivers::ram_disk::RamDisk;
    use crate::fs::{ByteFile, FileRef};
    use crate::mem::swap::SECTORS_PER_PAGE;
    use crate::paging::{PageTable as _, SharedPageTable};
    use crate::system::VmSystem;
    use crate::threading::VmThread;
    use alloc::boxed::Box;
    use alloc::sync::Arc;
    use alloc::vec;
    use otteros_shared::mem::OFFSET;

    fn system(frame_count: usize, swap_slots: usize) -> VmSystem {
        let sectors = swap_slots * SECTORS_PER_PAGE;
        let device = Block::new("swap", sectors as BlockSector, Box::new(RamDisk::new(sectors)));
        VmSystem::new(frame_count, device)
    }

    fn spawn_running(system: &VmSystem) -> (Arc<VmThread>, SharedPageTable) {
        let page_table = SharedPageTable::new();
        let thread = system.spawn_thread(Box::new(page_table.clone()));
        system.threads.set_running(thread.tid);
        (thread, page_table)
    }

    fn not_present_fault(addr: u32, esp: u32, write: bool) -> PageFault {
        PageFault {
            addr: VirtAddr::from_raw(addr),
            code: FaultErrorCode::default().with_write(write).with_user(true),
            esp,
        }
    }

    const ESP: u32 = 0xBFFF_F000;

    #[test]
    fn rights_violation_kills_the_thread() {
        let vm = system(2, 2);
        let (thread, _pt) = spawn_running(&vm);

        let fault = PageFault {
            addr: VirtAddr::from_raw(0x0804_8100),
            code: FaultErrorCode::default()
                .with_present(true)
                .with_write(true)
                .with_user(true),
            esp: ESP,
        };
        assert_eq!(vm.handle_page_fault(fault), FaultOutcome::Terminated);
        assert!(vm.threads.get(thread.tid).is_none(), "thread must be gone");
    }

    #[test]
    fn null_and_kernel_addresses_kill_the_thread() {
        let vm = system(2, 2);
        let (_thread, _pt) = spawn_running(&vm);
        assert_eq!(
            vm.handle_page_fault(not_present_fault(0, ESP, false)),
            FaultOutcome::Terminated
        );

        let (_thread, _pt) = spawn_running(&vm);
        assert_eq!(
            vm.handle_page_fault(not_present_fault(OFFSET + 0x1000, ESP, false)),
            FaultOutcome::Terminated
        );
    }

    #[test]
    fn fault_on_registered_page_loads_it_once() {
        let vm = system(2, 2);
        let (thread, pt) = spawn_running(&vm);
        let page = VirtAddr::from_raw(0x0804_8000);

        let file = FileRef::new(ByteFile::new(vec![3; 100]));
        assert!(thread
            .spt
            .lock()
            .insert_file(file, 0, page, 100, 3996, false));

        assert_eq!(
            vm.handle_page_fault(not_present_fault(0x0804_8042, ESP, false)),
            FaultOutcome::Handled
        );
        assert_eq!(vm.fault_count(), 1);

        let spt = thread.spt.lock();
        let entry = spt.lookup(page).expect("entry must remain");
        assert!(entry.loaded);
        drop(spt);
        assert!(pt.with(|t| t.translate(page).is_some()));
        assert!(!pt.with(|t| t.is_writable(page)), "writable flag must stick");
    }

    #[test]
    fn failed_load_kills_the_thread() {
        let vm = system(2, 2);
        let (thread, _pt) = spawn_running(&vm);
        let page = VirtAddr::from_raw(0x0804_8000);

        // The file is shorter than the entry claims, so the load fails.
        let file = FileRef::new(ByteFile::new(vec![3; 10]));
        assert!(thread
            .spt
            .lock()
            .insert_file(file, 0, page, 100, 3996, false));

        assert_eq!(
            vm.handle_page_fault(not_present_fault(0x0804_8000, ESP, false)),
            FaultOutcome::Terminated
        );
        assert!(vm.threads.get(thread.tid).is_none());
    }

    #[test]
    fn fault_below_stack_pointer_grows_the_stack() {
        let vm = system(2, 2);
        let (thread, pt) = spawn_running(&vm);

        // 4 bytes below ESP, comfortably inside the PUSHA window.
        let addr = ESP - 4;
        assert_eq!(
            vm.handle_page_fault(not_present_fault(addr, ESP, true)),
            FaultOutcome::Handled
        );

        let page = VirtAddr::from_raw(addr).page_base();
        assert!(pt.with(|t| t.translate(page).is_some()));
        assert!(pt.with(|t| t.is_writable(page)));
        assert!(thread.spt.lock().is_empty(), "stack growth records no entry");
    }

    #[test]
    fn fault_far_below_stack_pointer_kills_the_thread() {
        let vm = system(2, 2);
        let (thread, pt) = spawn_running(&vm);

        assert_eq!(
            vm.handle_page_fault(not_present_fault(ESP - 64, ESP, true)),
            FaultOutcome::Terminated
        );
        assert!(pt.with(|t| t.mapped_pages()) == 0);
        assert!(vm.threads.get(thread.tid).is_none());
    }

    #[test]
    fn stack_cannot_grow_past_its_limit() {
        let vm = system(2, 2);
        let (_thread, pt) = spawn_running(&vm);

        // An address above ESP is inside the slack window by definition,
        // but this one is more than 8 MiB below the top of user space.
        let too_deep = OFFSET - MAX_STACK_SIZE - 0x1000;
        assert_eq!(
            vm.handle_page_fault(not_present_fault(too_deep, too_deep - 16, true)),
            FaultOutcome::Terminated
        );
        assert!(pt.with(|t| t.mapped_pages()) == 0);
    }

    #[test]
    fn growth_failure_is_silent() {
        let vm = system(1, 0);
        let (thread, pt) = spawn_running(&vm);

        // Pin the only frame with an unbound allocation so nothing is
        // evictable and growth cannot get a frame.
        let _held = vm
            .frames
            .allocate(thread.tid, false)
            .expect("allocation failed");

        assert_eq!(
            vm.handle_page_fault(not_present_fault(ESP - 4, ESP, true)),
            FaultOutcome::Handled
        );
        assert!(pt.with(|t| t.mapped_pages()) == 0, "no mapping may appear");
        assert!(vm.threads.get(thread.tid).is_some(), "thread must survive");
    }

    #[test]
    fn unclassifiable_fault_with_stale_mapping_kills_the_thread() {
        let vm = system(2, 2);
        let (thread, _pt) = spawn_running(&vm);
        let page = VirtAddr::from_raw(0x0804_8000);

        // Map a page behind the supplemental table's back: the fault
        // handler finds a mapping but no record explaining it.
        let frame = vm
            .frames
            .allocate(thread.tid, true)
            .expect("allocation failed");
        assert!(thread.page_table.lock().map(page, frame, false));
        vm.frames.bind(frame, page);

        assert_eq!(
            vm.handle_page_fault(not_present_fault(0x0804_8010, ESP, true)),
            FaultOutcome::Terminated
        );
        assert!(vm.threads.get(thread.tid).is_none());
    }

    #[test]
    fn faults_are_counted() {
        let vm = system(2, 2);
        let (_thread, _pt) = spawn_running(&vm);
        assert_eq!(vm.fault_count(), 0);
        let _ = vm.handle_page_fault(not_present_fault(0, ESP, false));
        assert_eq!(vm.fault_count(), 1);
    }
}
