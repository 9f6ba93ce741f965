pub mod frame_alloc;
pub mod frame_table;
pub mod page;
pub mod swap;

pub use frame_alloc::Frame;
pub use frame_table::{FrameError, FrameTable};
pub use page::SupplPageTable;
pub use swap::{SwapError, SwapManager, SwapSlot};
