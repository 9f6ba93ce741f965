use crate::block::block_core::{BlockOp, BlockSector, BLOCK_SECTOR_SIZE};
use crate::block::block_error::BlockError;
use alloc::boxed::Box;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

#[derive(AsBytes, FromBytes, FromZeroes)]
#[repr(transparent)]
struct Sector([u8; BLOCK_SECTOR_SIZE]);

/// A block device backed by ordinary memory.
///
/// Serves as the swap device when the kernel runs hosted, and as the backing
/// store in tests. Contents start zeroed and live as long as the device.
pub struct RamDisk {
    sectors: Box<[Sector]>,
}

impl RamDisk {
    pub fn new(sector_count: usize) -> Self {
        Self {
            sectors: Sector::new_box_slice_zeroed(sector_count),
        }
    }

    pub fn sector_count(&self) -> usize {
        self.sectors.len()
    }
}

impl BlockOp for RamDisk {
    fn read(&mut self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError> {
        let sector = self
            .sectors
            .get(sector as usize)
            .ok_or(BlockError::ReadError)?;
        buf.copy_from_slice(sector.as_bytes());
        Ok(())
    }

    fn write(&mut self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError> {
        let sector = self
            .sectors
            .get_mut(sector as usize)
            .ok_or(BlockError::WriteError)?;
        sector.as_bytes_mut().copy_from_slice(buf);
        Ok(())
    }
}
