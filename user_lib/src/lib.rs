//! User-space runtime for MOS programs: the copy-on-write fork machinery
//! (C9), the in-memory stream library (C12), and path canonicalization
//! (C13). All of it is built against the [`syscalls::Syscalls`] trait
//! rather than raw trap instructions, so it is host-testable the same way
//! `kernel_core::process::thread` is tested against a mocked `Switcher`.
#![no_std]
#![deny(missing_docs)]

extern crate alloc;

#[cfg(all(test, not(target_os = "none")))]
#[macro_use]
extern crate std;

pub mod fork;
pub mod path;
pub mod stream;
pub mod syscalls;
