//! The MOS kernel core: the platform-independent data structures and
//! algorithms that back a small MIPS-class teaching kernel. See
//! `DESIGN.md` for how each module maps onto the pieces of the original.
#![no_std]
#![deny(missing_docs)]

extern crate alloc;

#[cfg(all(test, not(target_os = "none")))]
#[macro_use]
extern crate std;

pub mod collections;
pub mod elf;
pub mod fd;
pub mod ipc;
pub mod logger;
pub mod memory;
pub mod process;
pub mod sched;
pub mod shm;
pub mod syscall;
