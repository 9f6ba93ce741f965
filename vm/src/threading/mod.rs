pub mod thread_table;

pub type Tid = u16;

pub use thread_table::{ThreadTable, VmThread};
