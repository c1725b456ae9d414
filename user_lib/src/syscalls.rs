//! The user-visible syscall surface.
//!
//! This mirrors the ABI `kernel_core::syscall` implements, but is defined
//! independently: user code never links against the kernel crate, only
//! against whatever trap-stub crate wires [`Syscalls`] up to real `syscall`
//! instructions. Tests exercise [`fork`](crate::fork) and friends against
//! [`MockSyscalls`] instead.
use snafu::Snafu;

#[cfg(test)]
use mockall::automock;

/// An environment identifier, as returned by [`Syscalls::getenvid`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EnvId(pub u32);

/// A user virtual address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VirtualAddress(pub u32);

/// Page-table permission bits a user program may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Perm {
    /// Writable (`PTE_D`).
    pub write: bool,
    /// Shared across fork without copy-on-write (`PTE_LIBRARY`).
    pub library: bool,
}

/// Whether a freshly-forked environment is runnable yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvStatus {
    /// Not yet scheduled; the creator still has setup to do.
    NotRunnable,
    /// Eligible for the scheduler.
    Runnable,
}

/// Errors a syscall can report to its caller, matching the taxonomy in
/// `kernel_core::process::Error`/`kernel_core::syscall::Error` but named
/// from the user side of the boundary.
#[derive(Debug, Snafu, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The target environment id is stale or unknown.
    #[snafu(display("bad environment id"))]
    BadEnv,
    /// An address or length argument was out of range or misaligned.
    #[snafu(display("invalid argument"))]
    Inval,
    /// A page or table allocator is exhausted.
    #[snafu(display("out of memory"))]
    NoMem,
    /// `ipc_try_send` targeted an environment that isn't receiving.
    #[snafu(display("target is not receiving"))]
    IpcNotRecv,
    /// A read or write against a pipe that currently has no data/room.
    #[snafu(display("operation would block"))]
    WouldBlock,
    /// A variable lookup failed or a readonly variable was written.
    #[snafu(display("permission denied"))]
    Perm,
}

/// The syscall surface `user_lib` is built against. A real binary backs
/// this with trap instructions; tests back it with [`MockSyscalls`].
#[cfg_attr(test, automock)]
pub trait Syscalls {
    /// Returns the caller's own environment id.
    fn getenvid(&self) -> EnvId;

    /// Voluntarily yields the remainder of the current time slice.
    fn yield_now(&self);

    /// Destroys `env` (or the caller, if `env == getenvid()`).
    fn env_destroy(&self, env: EnvId) -> Result<(), Error>;

    /// Allocates a new, empty, `NotRunnable` child environment.
    fn exofork(&self) -> Result<EnvId, Error>;

    /// Marks `env` runnable or not.
    fn env_set_status(&self, env: EnvId, status: EnvStatus) -> Result<(), Error>;

    /// Registers the user VA of the calling environment's TLB-modify
    /// handler, invoked on a write fault against a `COW` page.
    fn set_tlb_mod_entry(&self, env: EnvId, entry: VirtualAddress) -> Result<(), Error>;

    /// Allocates and zero-fills a fresh page at `va` in `env`.
    fn page_alloc(&self, env: EnvId, va: VirtualAddress, perm: Perm) -> Result<(), Error>;

    /// Maps the page at `src_va` in `src_env` at `dst_va` in `dst_env`.
    fn page_map(
        &self,
        src_env: EnvId,
        src_va: VirtualAddress,
        dst_env: EnvId,
        dst_va: VirtualAddress,
        perm: Perm,
    ) -> Result<(), Error>;

    /// Removes the mapping at `va` in `env`, if any.
    fn page_unmap(&self, env: EnvId, va: VirtualAddress) -> Result<(), Error>;
}
