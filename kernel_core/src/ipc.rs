//! Synchronous IPC rendezvous with optional page transfer (C6).
//!
//! There is no message queue: `send` only succeeds if its target is
//! currently blocked in `recv`, and delivers the value (and, optionally, a
//! page mapped into the receiver's requested address) directly into that
//! receiver's saved IPC state before waking it. A `send` to an environment
//! that isn't receiving fails immediately rather than queuing.

use snafu::{ensure, ResultExt, Snafu};

use crate::memory::{PageAllocator, PageRef, Perm, TlbShim, VirtualAddress};
use crate::process::{self, EnvId, EnvTable, Status};

/// Errors raised by IPC operations.
#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum Error {
    /// `envid` did not resolve to a live environment.
    #[snafu(display("environment error: {source}"))]
    Env {
        /// The underlying environment-manager error.
        source: process::Error,
    },
    /// The target of a `send` is not currently blocked in `recv`.
    #[snafu(display("target is not receiving"))]
    NotReceiving,
    /// A page transfer was requested but a memory operation failed.
    #[snafu(display("memory error during page transfer: {source}"))]
    Memory {
        /// The underlying memory error.
        source: crate::memory::Error,
    },
}

type Result<T> = core::result::Result<T, Error>;

/// The IPC-related state carried by each environment: whether it is
/// currently blocked waiting to receive, and the most recent message it was
/// given.
#[derive(Debug, Clone, Copy, Default)]
pub struct IpcState {
    /// `true` while this environment is blocked in [`recv`] waiting for a message.
    pub recving: bool,
    /// If set while `recving`, the virtual address a transferred page
    /// should be mapped at; `None` means the receiver isn't interested in
    /// receiving a page, only a value.
    pub dest_va: Option<VirtualAddress>,
    /// The sender of the most recently delivered message.
    pub from: EnvId,
    /// The value most recently delivered.
    pub value: u32,
    /// The permissions of a page delivered with the most recent message, if any.
    pub perm: Perm,
    /// Whether the most recently delivered message included a page.
    pub page_received: bool,
}

/// Blocks `caller` until a message arrives. `dest_va`, if given, is the
/// address a page sent along with the message should be mapped at.
///
/// # Errors
/// - [`Error::Env`] if `caller` doesn't resolve.
pub fn recv(envs: &mut EnvTable, caller: EnvId, dest_va: Option<VirtualAddress>) -> Result<()> {
    let env = envs.get_mut(caller).context(EnvSnafu)?;
    env.ipc.recving = true;
    env.ipc.dest_va = dest_va;
    env.ipc.page_received = false;
    env.status = Status::NotRunnable;
    Ok(())
}

/// Delivers `value` (and, optionally, `page` with `perm`) to `to`, waking it.
///
/// # Errors
/// - [`Error::Env`] if `caller` or `to` doesn't resolve.
/// - [`Error::NotReceiving`] if `to` is not currently blocked in [`recv`].
/// - [`Error::Memory`] if mapping a transferred page fails.
#[allow(clippy::too_many_arguments)]
pub fn send(
    envs: &mut EnvTable,
    page_alloc: &mut PageAllocator,
    tlb: &mut impl TlbShim,
    caller: EnvId,
    to: EnvId,
    value: u32,
    page: Option<(PageRef, Perm)>,
) -> Result<()> {
    let target_id = envs.resolve(to).context(EnvSnafu)?;
    ensure!(envs.get(target_id).context(EnvSnafu)?.ipc.recving, NotReceivingSnafu);

    let mut page_received = false;
    if let Some((page_ref, perm)) = page {
        let target = envs.get(target_id).context(EnvSnafu)?;
        if let Some(dest_va) = target.ipc.dest_va {
            let pgdir = target.pgdir;
            let asid = target.asid;
            pgdir
                .page_insert(page_alloc, tlb, asid, dest_va, page_ref, perm)
                .context(MemorySnafu)?;
            page_received = true;
        }
    }

    let target = envs.get_mut(target_id).context(EnvSnafu)?;
    target.ipc.recving = false;
    target.ipc.from = caller;
    target.ipc.value = value;
    target.ipc.page_received = page_received;
    target.ipc.perm = page.map_or_else(Perm::default, |(_, p)| p);
    target.status = Status::Runnable;
    Ok(())
}
