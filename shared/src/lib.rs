//! Constants and small data types shared between the OtterOS kernel crates
//! and the hosted tooling that simulates them.

#![cfg_attr(target_os = "none", no_std)]

extern crate alloc;

pub mod bitmap;
pub mod mem;
pub mod sizes;
pub mod vaddr;
