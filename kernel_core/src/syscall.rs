//! The syscall gate (C7): argument validation plus dispatch into the other
//! subsystems.
//!
//! Each syscall is exposed as its own typed function rather than a single
//! `dispatch(no, a0..a4)` entry point — the untrusted-register marshaling
//! (decoding a raw argument array, bounds-checking a `(ptr, len)` pair
//! against user space) belongs in `kernel`'s trap handler, which knows the
//! calling convention; what's common to every syscall and worth sharing
//! here is [`check_user_range`] and [`check_user_writable`].

use snafu::{ensure, ResultExt, Snafu};

use crate::fd::{self, FdTable, PipeTable};
use crate::ipc;
use crate::memory::{AddressSpaceIdPool, PageAllocator, Perm, TlbShim, VirtualAddress, UTOP};
use crate::process::{self, EnvId, EnvTable, SchedClass, VarTable};
use crate::sched::Scheduler;
use crate::shm::{self, ShmTable};

/// A 32-bit syscall number, stable across kernel versions so user binaries
/// don't need to be rebuilt when new syscalls are added to the end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SyscallNo {
    /// [`getenvid`]
    GetEnvId = 0,
    /// [`yield_now`]
    Yield = 1,
    /// [`env_destroy`]
    EnvDestroy = 2,
    /// [`exofork`]
    ExoFork = 3,
    /// [`env_set_status`]
    EnvSetStatus = 4,
    /// [`page_alloc`]
    PageAlloc = 5,
    /// [`page_map`]
    PageMap = 6,
    /// [`page_unmap`]
    PageUnmap = 7,
    /// [`ipc_recv`]
    IpcRecv = 8,
    /// [`ipc_try_send`]
    IpcTrySend = 9,
    /// [`shm_new`]
    ShmNew = 10,
    /// [`shm_bind`]
    ShmBind = 11,
    /// [`shm_unbind`]
    ShmUnbind = 12,
    /// [`shm_free`]
    ShmFree = 13,
    /// `fd` family
    Pipe = 14,
    /// `fd` family
    Read = 15,
    /// `fd` family
    Write = 16,
    /// `fd` family
    Close = 17,
    /// [`var_declare`]/[`var_get`]/[`var_unset`]
    VarDeclare = 18,
    /// see above
    VarGet = 19,
    /// see above
    VarUnset = 20,
}

/// Errors raised by the syscall gate itself, distinct from the errors a
/// dispatched call into a subsystem can raise (those are reported through
/// that subsystem's own `Error` type, wrapped in the relevant variant
/// below).
#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum Error {
    /// A user-supplied virtual address (or address range) reached into
    /// kernel space.
    #[snafu(display("user address out of range"))]
    BadAddress,
    /// A user-supplied virtual address was not page-aligned where one was required.
    #[snafu(display("address not page-aligned"))]
    NotAligned,
    /// An environment-manager call failed.
    #[snafu(display("{source}"))]
    Process {
        /// The underlying error.
        source: process::Error,
    },
    /// An IPC call failed.
    #[snafu(display("{source}"))]
    Ipc {
        /// The underlying error.
        source: ipc::Error,
    },
    /// A shared memory call failed.
    #[snafu(display("{source}"))]
    Shm {
        /// The underlying error.
        source: shm::Error,
    },
    /// A file descriptor or pipe call failed.
    #[snafu(display("{source}"))]
    Fd {
        /// The underlying error.
        source: fd::Error,
    },
    /// A variable table call failed.
    #[snafu(display("{source}"))]
    Var {
        /// The underlying error.
        source: process::var::Error,
    },
    /// A memory management call failed.
    #[snafu(display("{source}"))]
    Memory {
        /// The underlying error.
        source: crate::memory::Error,
    },
}

type Result<T> = core::result::Result<T, Error>;

/// Checks that `[va, va + len)` lies entirely below [`UTOP`] and does not
/// wrap around the address space, without checking that it's actually
/// mapped (callers that need that should go through `page_lookup`/a fault).
///
/// # Errors
/// - [`Error::BadAddress`] if the range reaches into kernel space or overflows.
pub fn check_user_range(va: VirtualAddress, len: usize) -> Result<()> {
    let end = (va.0 as u64) + (len as u64);
    ensure!(end <= UTOP as u64, BadAddressSnafu);
    Ok(())
}

/// Like [`check_user_range`], but also requires `va` to be page-aligned —
/// the precondition [`crate::memory::PageDirectory::page_insert`] and
/// friends share.
///
/// # Errors
/// - [`Error::BadAddress`] as in [`check_user_range`].
/// - [`Error::NotAligned`] if `va` is not page-aligned.
pub fn check_user_page(va: VirtualAddress) -> Result<()> {
    ensure!(va.is_page_aligned(), NotAlignedSnafu);
    check_user_range(va, crate::memory::PAGE_SIZE)
}

/// Returns the id of the calling environment. Never fails: there is always
/// a current environment while servicing a syscall.
#[must_use]
pub fn getenvid(envs: &EnvTable) -> EnvId {
    envs.current()
}

/// Voluntarily gives up the rest of the caller's quantum. The scheduler
/// picks the next environment to run on its own next tick; this call has no
/// direct effect beyond being a documented no-op placeholder for the trap
/// handler to recognize and reschedule immediately rather than waiting for
/// the next timer tick.
pub fn yield_now() {}

/// Destroys `envid` (or the caller itself, via [`EnvId::NONE`]), after
/// checking the caller has permission.
///
/// # Errors
/// - [`Error::Process`] if `envid` doesn't resolve, or the caller lacks permission.
pub fn env_destroy(
    envs: &mut EnvTable,
    page_alloc: &mut PageAllocator,
    asid_pool: &AddressSpaceIdPool,
    tlb: &mut impl TlbShim,
    vars: &mut VarTable,
    caller: EnvId,
    envid: EnvId,
) -> Result<()> {
    envs.checkperm(caller, envid).context(ProcessSnafu)?;
    let target = envs.resolve(envid).context(ProcessSnafu)?;
    envs.env_destroy(page_alloc, asid_pool, tlb, vars, target).context(ProcessSnafu)
}

/// Allocates a new, empty child environment (not yet runnable — the
/// original's `sys_exofork`, the building block `fork()` is implemented on
/// top of in user space).
///
/// # Errors
/// - [`Error::Process`] if the environment table is full.
pub fn exofork(
    envs: &mut EnvTable,
    page_alloc: &mut PageAllocator,
    asid_pool: &AddressSpaceIdPool,
    caller: EnvId,
) -> Result<EnvId> {
    let id = envs
        .env_alloc(page_alloc, asid_pool, caller, SchedClass::RoundRobin { priority: 1 })
        .context(ProcessSnafu)?;
    envs.get_mut(id).context(ProcessSnafu)?.status = process::Status::NotRunnable;
    Ok(id)
}

/// Sets `envid`'s lifecycle status, e.g. to mark a freshly-`exofork`ed child runnable.
///
/// # Errors
/// - [`Error::Process`] if `envid` doesn't resolve or the caller lacks permission.
pub fn env_set_status(
    envs: &mut EnvTable,
    caller: EnvId,
    envid: EnvId,
    status: process::Status,
) -> Result<()> {
    envs.checkperm(caller, envid).context(ProcessSnafu)?;
    envs.get_mut(envid).context(ProcessSnafu)?.status = status;
    Ok(())
}

/// Allocates a fresh page and maps it at `va` in `envid`'s address space.
///
/// # Errors
/// - [`Error::Process`] if `envid` doesn't resolve or the caller lacks permission.
/// - [`Error::BadAddress`]/[`Error::NotAligned`] if `va` fails validation.
/// - [`Error::Memory`] if the allocation or mapping fails.
pub fn page_alloc(
    envs: &mut EnvTable,
    page_alloc: &mut PageAllocator,
    tlb: &mut impl TlbShim,
    caller: EnvId,
    envid: EnvId,
    va: VirtualAddress,
    perm: Perm,
) -> Result<()> {
    envs.checkperm(caller, envid).context(ProcessSnafu)?;
    check_user_page(va)?;
    let env = envs.get(envid).context(ProcessSnafu)?;
    let (pgdir, asid) = (env.pgdir, env.asid);
    let page = page_alloc.alloc().context(MemorySnafu)?;
    pgdir.page_insert(page_alloc, tlb, asid, va, page, perm).context(MemorySnafu)
}

/// Maps the page currently at `src_va` in `src_envid` into `dst_envid` at `dst_va`.
///
/// # Errors
/// - [`Error::Process`] if either id doesn't resolve or the caller lacks permission on `dst_envid`.
/// - [`Error::BadAddress`]/[`Error::NotAligned`] if either address fails validation.
/// - [`Error::Memory`] if there is no page mapped at `src_va`, or the destination mapping fails.
#[allow(clippy::too_many_arguments)]
pub fn page_map(
    envs: &mut EnvTable,
    page_alloc: &mut PageAllocator,
    tlb: &mut impl TlbShim,
    caller: EnvId,
    src_envid: EnvId,
    src_va: VirtualAddress,
    dst_envid: EnvId,
    dst_va: VirtualAddress,
    perm: Perm,
) -> Result<()> {
    envs.resolve(src_envid).context(ProcessSnafu)?;
    envs.checkperm(caller, dst_envid).context(ProcessSnafu)?;
    check_user_page(src_va)?;
    check_user_page(dst_va)?;
    let src = envs.get(src_envid).context(ProcessSnafu)?;
    let (src_page, _) = src
        .pgdir
        .page_lookup(page_alloc, src_va)
        .ok_or(crate::memory::Error::UnknownPage)
        .context(MemorySnafu)?;
    let dst = envs.get(dst_envid).context(ProcessSnafu)?;
    let (dst_pgdir, dst_asid) = (dst.pgdir, dst.asid);
    dst_pgdir
        .page_insert(page_alloc, tlb, dst_asid, dst_va, src_page, perm)
        .context(MemorySnafu)
}

/// Unmaps the page at `va` in `envid`'s address space, if any.
///
/// # Errors
/// - [`Error::Process`] if `envid` doesn't resolve or the caller lacks permission.
/// - [`Error::BadAddress`]/[`Error::NotAligned`] if `va` fails validation.
pub fn page_unmap(
    envs: &mut EnvTable,
    page_alloc: &mut PageAllocator,
    tlb: &mut impl TlbShim,
    caller: EnvId,
    envid: EnvId,
    va: VirtualAddress,
) -> Result<()> {
    envs.checkperm(caller, envid).context(ProcessSnafu)?;
    check_user_page(va)?;
    let env = envs.get(envid).context(ProcessSnafu)?;
    let (pgdir, asid) = (env.pgdir, env.asid);
    pgdir.page_remove(page_alloc, tlb, asid, va).context(MemorySnafu)
}

/// Blocks the caller until a message arrives.
///
/// # Errors
/// - [`Error::Ipc`] if `caller` doesn't resolve.
/// - [`Error::BadAddress`]/[`Error::NotAligned`] if `dest_va` is given and fails validation.
pub fn ipc_recv(envs: &mut EnvTable, caller: EnvId, dest_va: Option<VirtualAddress>) -> Result<()> {
    if let Some(va) = dest_va {
        check_user_page(va)?;
    }
    ipc::recv(envs, caller, dest_va).context(IpcSnafu)
}

/// Delivers a value (and, optionally, a page) to `to` if it is currently
/// receiving; otherwise fails immediately rather than blocking the sender.
///
/// # Errors
/// - [`Error::Ipc`] if `to` doesn't resolve or isn't receiving.
/// - [`Error::Memory`] if a page transfer is requested and fails.
pub fn ipc_try_send(
    envs: &mut EnvTable,
    page_alloc: &mut PageAllocator,
    tlb: &mut impl TlbShim,
    caller: EnvId,
    to: EnvId,
    value: u32,
    page: Option<(crate::memory::PageRef, Perm)>,
) -> Result<()> {
    ipc::send(envs, page_alloc, tlb, caller, to, value, page).context(IpcSnafu)
}

/// Allocates a fresh shared memory region of `npage` frames and returns its
/// kernel-generated key. Allocates the frames up front; nothing is mapped
/// into any address space until a later [`shm_bind`].
///
/// # Errors
/// - [`Error::Shm`] if `npage` is too large, every region slot is in use, or
///   a frame allocation fails.
pub fn shm_new(shm: &mut ShmTable, page_alloc: &mut PageAllocator, npage: usize) -> Result<u32> {
    shm.new(page_alloc, npage).context(ShmSnafu)
}

/// Binds the shared memory region under `key` into the caller's address
/// space at `va`. May be called by any environment that knows `key`,
/// including one other than whichever called [`shm_new`].
///
/// # Errors
/// - [`Error::BadAddress`]/[`Error::NotAligned`] if `va` fails validation.
/// - [`Error::Shm`] if `key` is unknown or the mapping fails.
pub fn shm_bind(
    shm: &mut ShmTable,
    envs: &mut EnvTable,
    page_alloc: &mut PageAllocator,
    tlb: &mut impl TlbShim,
    caller: EnvId,
    key: u32,
    va: VirtualAddress,
    perm: Perm,
) -> Result<()> {
    check_user_page(va)?;
    shm.bind(envs, page_alloc, tlb, caller, key, va, perm).context(ShmSnafu)
}

/// Unbinds shared memory region `key` from the caller's address space at `va`.
///
/// # Errors
/// - [`Error::BadAddress`]/[`Error::NotAligned`] if `va` fails validation.
/// - [`Error::Shm`] if the underlying unbind fails.
pub fn shm_unbind(
    shm: &mut ShmTable,
    envs: &mut EnvTable,
    page_alloc: &mut PageAllocator,
    tlb: &mut impl TlbShim,
    caller: EnvId,
    key: u32,
    va: VirtualAddress,
) -> Result<()> {
    check_user_page(va)?;
    shm.unbind(envs, page_alloc, tlb, caller, key, va).context(ShmSnafu)
}

/// Destroys shared memory region `key` if nothing still has it bound.
///
/// # Errors
/// - [`Error::Shm`] if the key is unknown or still bound.
pub fn shm_free(shm: &mut ShmTable, page_alloc: &mut PageAllocator, key: u32) -> Result<()> {
    shm.free(page_alloc, key).context(ShmSnafu)
}

/// Creates a pipe in the caller's descriptor table, returning `(read_fd, write_fd)`.
///
/// # Errors
/// - [`Error::Fd`] if the table is full or the backing page can't be allocated.
pub fn pipe(fds: &mut FdTable, pipes: &mut PipeTable, page_alloc: &mut PageAllocator) -> Result<(usize, usize)> {
    fds.pipe(pipes, page_alloc).context(FdSnafu)
}

/// Reads from `fd` into `buf`.
///
/// # Errors
/// - [`Error::Fd`] per [`FdTable::read`].
pub fn read(fds: &FdTable, pipes: &mut PipeTable, alloc: &PageAllocator, fd: usize, buf: &mut [u8]) -> Result<usize> {
    fds.read(pipes, alloc, fd, buf).context(FdSnafu)
}

/// Writes `buf` to `fd`.
///
/// # Errors
/// - [`Error::Fd`] per [`FdTable::write`].
pub fn write(fds: &FdTable, pipes: &mut PipeTable, alloc: &PageAllocator, fd: usize, buf: &[u8]) -> Result<usize> {
    fds.write(pipes, alloc, fd, buf).context(FdSnafu)
}

/// Closes `fd`.
///
/// # Errors
/// - [`Error::Fd`] per [`FdTable::close`].
pub fn close(fds: &mut FdTable, pipes: &mut PipeTable, alloc: &mut PageAllocator, fd: usize) -> Result<()> {
    fds.close(pipes, alloc, fd).context(FdSnafu)
}

/// Declares (or redeclares) a shell variable owned by the caller.
///
/// # Errors
/// - [`Error::Var`] per [`VarTable::declare`].
pub fn var_declare(
    vars: &mut VarTable,
    caller: EnvId,
    name: &str,
    value: &str,
    readonly: bool,
    exported: bool,
) -> Result<()> {
    vars.declare(name, value, caller, readonly, exported).context(VarSnafu)
}

/// Looks up a variable visible to the caller.
///
/// # Errors
/// - [`Error::Var`] with [`process::var::Error::NotFound`] if nothing by that name is visible.
pub fn var_get<'a>(vars: &'a VarTable, caller: EnvId, name: &str) -> Result<&'a str> {
    vars.get(name, caller)
        .map(|v| v.value.as_str())
        .ok_or(process::var::Error::NotFound)
        .context(VarSnafu)
}

/// Unsets a variable owned by the caller.
///
/// # Errors
/// - [`Error::Var`] per [`VarTable::unset`].
pub fn var_unset(vars: &mut VarTable, caller: EnvId, name: &str) -> Result<()> {
    vars.unset(name, caller).context(VarSnafu)
}

/// Advances the scheduler's clock by one tick and returns who should run next.
pub fn sched_tick(sched: &mut Scheduler, envs: &mut EnvTable) -> Option<EnvId> {
    sched.tick(envs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::PAGE_SIZE;

    fn setup(npage: usize) -> (std::vec::Vec<u8>, PageAllocator, AddressSpaceIdPool, EnvTable) {
        let mut backing = std::vec![0u8; npage * PAGE_SIZE];
        let alloc = unsafe { PageAllocator::new(backing.as_mut_ptr(), npage) };
        (backing, alloc, AddressSpaceIdPool::new(16), EnvTable::new())
    }

    struct NopTlb;
    impl TlbShim for NopTlb {
        fn invalidate(&mut self, _asid: crate::memory::AddressSpaceId, _va: VirtualAddress, _g: bool) {}
    }

    #[test]
    fn check_user_range_rejects_kernel_addresses() {
        assert_eq!(check_user_range(VirtualAddress(UTOP - 4), 8), Err(Error::BadAddress));
        assert!(check_user_range(VirtualAddress(UTOP - 8), 8).is_ok());
    }

    #[test]
    fn check_user_page_rejects_misaligned() {
        assert_eq!(check_user_page(VirtualAddress(0x1001)), Err(Error::NotAligned));
    }

    #[test]
    fn page_alloc_then_unmap_round_trips() {
        let (_b, mut alloc, asids, mut envs) = setup(16);
        let id = envs.env_alloc(&mut alloc, &asids, EnvId::NONE, SchedClass::RoundRobin { priority: 1 }).unwrap();
        let mut tlb = NopTlb;
        let va = VirtualAddress(0x4000);
        page_alloc(&mut envs, &mut alloc, &mut tlb, id, id, va, Perm::default()).unwrap();
        assert!(envs.get(id).unwrap().pgdir.page_lookup(&mut alloc, va).is_some());
        page_unmap(&mut envs, &mut alloc, &mut tlb, id, id, va).unwrap();
        assert!(envs.get(id).unwrap().pgdir.page_lookup(&mut alloc, va).is_none());
    }

    #[test]
    fn exofork_creates_not_runnable_child() {
        let (_b, mut alloc, asids, mut envs) = setup(16);
        let parent = envs.env_alloc(&mut alloc, &asids, EnvId::NONE, SchedClass::RoundRobin { priority: 1 }).unwrap();
        let child = exofork(&mut envs, &mut alloc, &asids, parent).unwrap();
        assert_eq!(envs.get(child).unwrap().status, process::Status::NotRunnable);
        assert_eq!(envs.get(child).unwrap().parent_id, parent);
    }

    #[test]
    fn page_map_shares_a_page_between_two_envs() {
        let (_b, mut alloc, asids, mut envs) = setup(16);
        let a = envs.env_alloc(&mut alloc, &asids, EnvId::NONE, SchedClass::RoundRobin { priority: 1 }).unwrap();
        let b = envs.env_alloc(&mut alloc, &asids, EnvId::NONE, SchedClass::RoundRobin { priority: 1 }).unwrap();
        let mut tlb = NopTlb;
        let va = VirtualAddress(0x4000);
        page_alloc(&mut envs, &mut alloc, &mut tlb, a, a, va, Perm::default()).unwrap();
        page_map(&mut envs, &mut alloc, &mut tlb, a, a, va, b, VirtualAddress(0x5000), Perm::default()).unwrap();
        let (pa, _) = envs.get(a).unwrap().pgdir.page_lookup(&mut alloc, va).unwrap();
        let (pb, _) = envs.get(b).unwrap().pgdir.page_lookup(&mut alloc, VirtualAddress(0x5000)).unwrap();
        assert_eq!(pa, pb);
    }

    #[test]
    fn shm_new_then_bind_from_a_different_env_aliases_the_same_frame() {
        let (_b, mut alloc, asids, mut envs) = setup(16);
        let a = envs.env_alloc(&mut alloc, &asids, EnvId::NONE, SchedClass::RoundRobin { priority: 1 }).unwrap();
        let b = envs.env_alloc(&mut alloc, &asids, EnvId::NONE, SchedClass::RoundRobin { priority: 1 }).unwrap();
        let mut tlb = NopTlb;
        let mut shm = ShmTable::new();
        let key = shm_new(&mut shm, &mut alloc, 1).unwrap();
        shm_bind(&mut shm, &mut envs, &mut alloc, &mut tlb, a, key, VirtualAddress(0x4000), Perm::default()).unwrap();
        shm_bind(&mut shm, &mut envs, &mut alloc, &mut tlb, b, key, VirtualAddress(0x5000), Perm::default()).unwrap();
        let (pa, _) = envs.get(a).unwrap().pgdir.page_lookup(&mut alloc, VirtualAddress(0x4000)).unwrap();
        let (pb, _) = envs.get(b).unwrap().pgdir.page_lookup(&mut alloc, VirtualAddress(0x5000)).unwrap();
        assert_eq!(pa, pb);
    }
}
