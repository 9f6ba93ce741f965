use crate::mem::OFFSET;
use arbitrary_int::{u12, u20};
use bitbybit::bitfield;

/// A 32-bit virtual address, split into its virtual page number and the
/// offset within the page.
#[bitfield(u32, default = 0)]
pub struct VirtAddr {
    #[bits(12..=31, rw)]
    vpn: u20,
    #[bits(0..=11, rw)]
    offset: u12,
}

impl VirtAddr {
    pub fn from_raw(raw: u32) -> Self {
        Self::new_with_raw_value(raw)
    }

    /// The address of the start of the page containing this address.
    pub fn page_base(self) -> Self {
        self.with_offset(u12::new(0))
    }

    pub fn is_page_aligned(self) -> bool {
        self.offset().value() == 0
    }

    pub fn is_null(self) -> bool {
        self.raw_value() == 0
    }

    /// Whether the address lies in user space (strictly below kernel memory).
    pub fn is_user(self) -> bool {
        self.raw_value() < OFFSET
    }
}
