//! The swap area: a block device carved into page-sized slots, with a
//! bitmap tracking which slots hold evicted pages.

use crate::block::block_core::{Block, BlockSector, BLOCK_SECTOR_SIZE};
use crate::block::block_error::BlockError;
use crate::sync::Mutex;
use core::fmt;
use otteros_shared::bitmap::Bitmap;
use otteros_shared::mem::PAGE_FRAME_SIZE;

/// How many contiguous sectors hold one page.
pub const SECTORS_PER_PAGE: usize = PAGE_FRAME_SIZE / BLOCK_SECTOR_SIZE;

/// Index of a page-sized slot in the swap area.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SwapSlot(usize);

impl SwapSlot {
    pub fn index(self) -> usize {
        self.0
    }

    fn first_sector(self) -> BlockSector {
        (self.0 * SECTORS_PER_PAGE) as BlockSector
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SwapError {
    /// Every slot is occupied.
    Full,
    /// The swap device failed.
    Block(BlockError),
}

impl fmt::Display for SwapError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SwapError::Full => write!(f, "swap area is full"),
            SwapError::Block(e) => write!(f, "swap device error: {e}"),
        }
    }
}

impl From<BlockError> for SwapError {
    fn from(e: BlockError) -> Self {
        SwapError::Block(e)
    }
}

impl core::error::Error for SwapError {}

struct SwapInner {
    device: Block,
    /// One bit per slot; set means the slot holds a page.
    slots: Bitmap,
}

/// Owns the swap block device and its slot bitmap.
///
/// Device and bitmap share one lock: a slot must never be handed to two
/// writers, and the scan-then-write would race without it.
pub struct SwapManager {
    inner: Mutex<SwapInner>,
}

impl SwapManager {
    /// Takes ownership of the swap device and marks every slot free. Slots
    /// are page-granular; trailing sectors that do not make up a whole page
    /// are unused.
    pub fn new(device: Block) -> Self {
        let capacity = device.size() as usize / SECTORS_PER_PAGE;
        log::info!(
            "swap on \"{}\": {} slots of {} bytes",
            device.name(),
            capacity,
            PAGE_FRAME_SIZE,
        );
        Self {
            inner: Mutex::new(SwapInner {
                device,
                slots: Bitmap::new(capacity),
            }),
        }
    }

    /// Copies a page into the lowest free slot and returns it.
    pub fn write_out(&self, page: &[u8; PAGE_FRAME_SIZE]) -> Result<SwapSlot, SwapError> {
        let mut inner = self.inner.lock();
        let Some(index) = inner.slots.scan_and_set() else {
            return Err(SwapError::Full);
        };
        let slot = SwapSlot(index);

        for i in 0..SECTORS_PER_PAGE {
            let chunk = &page[i * BLOCK_SECTOR_SIZE..(i + 1) * BLOCK_SECTOR_SIZE];
            if let Err(e) = inner.device.write(slot.first_sector() + i as BlockSector, chunk) {
                inner.slots.clear(index);
                return Err(e.into());
            }
        }
        Ok(slot)
    }

    /// Copies a slot's page into `page`, then frees the slot: swap content
    /// is consumed, not retained, once read back.
    pub fn read_in(&self, slot: SwapSlot, page: &mut [u8; PAGE_FRAME_SIZE]) -> Result<(), SwapError> {
        let mut inner = self.inner.lock();
        debug_assert!(inner.slots.get(slot.0), "reading a free swap slot");

        for i in 0..SECTORS_PER_PAGE {
            let chunk = &mut page[i * BLOCK_SECTOR_SIZE..(i + 1) * BLOCK_SECTOR_SIZE];
            inner
                .device
                .read(slot.first_sector() + i as BlockSector, chunk)?;
        }
        inner.slots.clear(slot.0);
        Ok(())
    }

    /// Frees a slot without reading it, for pages that die in swap.
    pub fn release(&self, slot: SwapSlot) {
        let mut inner = self.inner.lock();
        debug_assert!(inner.slots.get(slot.0), "releasing a free swap slot");
        inner.slots.clear(slot.0);
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().slots.len()
    }

    pub fn slots_in_use(&self) -> usize {
        self.inner.lock().slots.count_set()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::ram_disk::RamDisk;
    use alloc::boxed::Box;

    fn swap_with_slots(slots: usize) -> SwapManager {
        let sectors = slots * SECTORS_PER_PAGE;
        let device = Block::new("swap", sectors as BlockSector, Box::new(RamDisk::new(sectors)));
        SwapManager::new(device)
    }

    fn patterned_page() -> Box<[u8; PAGE_FRAME_SIZE]> {
        let mut page = Box::new([0_u8; PAGE_FRAME_SIZE]);
        for (i, byte) in page.iter_mut().enumerate() {
            *byte = (i % 251) as u8;
        }
        page
    }

    #[test]
    fn round_trip_preserves_content_and_frees_slot() {
        let swap = swap_with_slots(4);
        let page = patterned_page();

        let slot = swap.write_out(&page).expect("swap should have room");
        assert_eq!(swap.slots_in_use(), 1);

        let mut restored = Box::new([0_u8; PAGE_FRAME_SIZE]);
        swap.read_in(slot, &mut restored).expect("read_in failed");
        assert_eq!(&restored[..], &page[..]);
        assert_eq!(swap.slots_in_use(), 0);
    }

    #[test]
    fn capacity_is_page_granular() {
        // 10 sectors only fit one whole page at 8 sectors per page.
        let device = Block::new("swap", 10, Box::new(RamDisk::new(10)));
        let swap = SwapManager::new(device);
        assert_eq!(swap.capacity(), 1);
    }

    #[test]
    fn exhaustion_reports_full_until_a_slot_frees() {
        let swap = swap_with_slots(3);
        let page = patterned_page();

        let slots: alloc::vec::Vec<_> = (0..3)
            .map(|_| swap.write_out(&page).expect("swap should have room"))
            .collect();
        assert_eq!(swap.write_out(&page), Err(SwapError::Full));

        swap.release(slots[1]);
        let reused = swap.write_out(&page).expect("freed slot should be reusable");
        assert_eq!(reused, slots[1]);
        assert_eq!(swap.write_out(&page), Err(SwapError::Full));
    }

    #[test]
    fn slots_do_not_overlap() {
        let swap = swap_with_slots(2);
        let zeroes = Box::new([0_u8; PAGE_FRAME_SIZE]);
        let ones = Box::new([1_u8; PAGE_FRAME_SIZE]);

        let a = swap.write_out(&zeroes).expect("swap should have room");
        let b = swap.write_out(&ones).expect("swap should have room");

        let mut restored = Box::new([0xFF_u8; PAGE_FRAME_SIZE]);
        swap.read_in(a, &mut restored).expect("read_in failed");
        assert!(restored.iter().all(|&byte| byte == 0));
        swap.read_in(b, &mut restored).expect("read_in failed");
        assert!(restored.iter().all(|&byte| byte == 1));
    }
}
