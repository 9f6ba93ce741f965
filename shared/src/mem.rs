use crate::sizes::{KB, MB};

// Page size is 4KB. This is a property of x86 processors.
pub const PAGE_FRAME_SIZE: usize = 4 * KB;

/// Virtual address where kernel memory begins. Everything below it is user
/// space; everything at or above it is off limits to user programs.
pub const OFFSET: u32 = 0xC000_0000;

/// Upper bound on how far a user stack may grow down from the top of user
/// space.
pub const MAX_STACK_SIZE: u32 = (8 * MB) as u32;
