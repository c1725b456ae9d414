//! The environment (process) manager: a fixed table of [`Env`] slots, ELF
//! loading into a fresh address space, and `envid2env`-style id resolution.

pub mod var;
pub use var::{Var, VarTable};

use alloc::vec::Vec;
use snafu::{ensure, OptionExt, ResultExt, Snafu};

use crate::elf;
use crate::fd::FdTable;
use crate::ipc::IpcState;
use crate::memory::{
    AddressSpaceId, AddressSpaceIdPool, PageAllocator, PageDirectory, Perm, TlbShim,
    VirtualAddress, UTOP,
};

/// Number of bits of an [`EnvId`] given over to the table index.
pub const LOG2NENV: u32 = 10;
/// Number of environment table slots.
pub const NENV: usize = 1 << LOG2NENV;

/// Errors raised by environment-manager operations.
#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum Error {
    /// The environment table is full.
    #[snafu(display("no free environment slots"))]
    TooManyEnvs,
    /// `envid` does not name a live environment.
    #[snafu(display("bad environment id"))]
    BadEnv,
    /// The caller does not have permission to act on the named environment
    /// (it is neither the target nor the target's parent).
    #[snafu(display("permission denied"))]
    Permission,
    /// The ELF image could not be loaded.
    #[snafu(display("could not load executable image: {source}"))]
    Elf {
        /// The underlying loader error.
        source: elf::Error,
    },
    /// A memory operation failed while constructing the environment.
    #[snafu(display("memory error: {source}"))]
    Memory {
        /// The underlying memory error.
        source: crate::memory::Error,
    },
}

type Result<T> = core::result::Result<T, Error>;

/// A unique, generation-tagged identifier for an environment.
///
/// Encoded as `(generation << LOG2NENV) | index`, where `index` is the slot
/// in the environment table. [`EnvId::NONE`] (zero) never names a real
/// environment: `env_alloc` starts the generation counter at 1, so every
/// live environment's id is nonzero. Callers pass [`EnvId::NONE`] to mean
/// "the currently running environment" (see [`EnvTable::resolve`]) and it
/// doubles as the "global" scope owner for [`var::VarTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EnvId(u32);

impl EnvId {
    /// The sentinel id: "no environment" / "the current environment", depending on context.
    pub const NONE: EnvId = EnvId(0);

    /// Builds an id from a generation counter and table index.
    #[must_use]
    pub fn new(generation: u32, index: u32) -> Self {
        EnvId((generation << LOG2NENV) | index)
    }

    /// The table index encoded in this id.
    #[must_use]
    pub fn index(self) -> usize {
        (self.0 & (NENV as u32 - 1)) as usize
    }

    /// The raw 32-bit encoded value.
    #[must_use]
    pub fn raw(self) -> u32 {
        self.0
    }
}

impl Default for EnvId {
    fn default() -> Self {
        EnvId::NONE
    }
}

/// The lifecycle state of an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The slot is unused.
    Free,
    /// Runnable, waiting for the scheduler to pick it.
    Runnable,
    /// Currently the one running environment.
    Running,
    /// Blocked, e.g. waiting in `ipc_recv` or on a full/empty pipe.
    NotRunnable,
}

/// The real-time scheduling class of an environment, set at creation and
/// never changed afterward (see the dual scheduler, C5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedClass {
    /// Scheduled by priority round robin.
    RoundRobin {
        /// Static priority; higher runs first among other round-robin environments.
        priority: u8,
    },
    /// Scheduled by earliest-deadline-first.
    Edf {
        /// The period, in scheduler ticks, between deadlines.
        period: u32,
        /// Ticks of runtime guaranteed to this environment within each period.
        budget: u32,
    },
}

/// One environment (process).
pub struct Env {
    /// This environment's id.
    pub id: EnvId,
    /// The id of the environment that created this one, or [`EnvId::NONE`] for none.
    pub parent_id: EnvId,
    /// Current lifecycle state.
    pub status: Status,
    /// Scheduling class and parameters.
    pub sched: SchedClass,
    /// This environment's page directory.
    pub pgdir: PageDirectory,
    /// This environment's address space id, for TLB tagging.
    pub asid: AddressSpaceId,
    /// The ASID generation this environment's `asid` was allocated under;
    /// used to detect a stale ASID after the pool has wrapped (see
    /// `AddressSpaceIdPool`).
    pub asid_generation: u32,
    /// Number of EDF scheduling ticks remaining in the current period.
    pub runtime_left: u32,
    /// The absolute tick at which the current EDF period ends.
    pub period_deadline: u32,
    /// The program's entry point, as decoded from its ELF header.
    pub entry_point: VirtualAddress,
    /// This environment's synchronous-IPC rendezvous state.
    pub ipc: IpcState,
    /// This environment's open file (pipe) descriptors.
    pub fds: FdTable,
}

/// The fixed table of environment slots plus the allocation bookkeeping
/// (free list, per-slot generation counters) needed to turn a table index
/// into a stable, non-reusable-until-recycled [`EnvId`].
pub struct EnvTable {
    envs: Vec<Option<Env>>,
    generation: Vec<u32>,
    free_list: Vec<u32>,
    current: EnvId,
    kernel_template: Option<PageDirectory>,
}

impl EnvTable {
    /// Creates an empty table with [`NENV`] slots, all free.
    #[must_use]
    pub fn new() -> Self {
        let mut envs = Vec::with_capacity(NENV);
        envs.resize_with(NENV, || None);
        EnvTable {
            envs,
            generation: alloc::vec![1u32; NENV],
            free_list: (0..NENV as u32).rev().collect(),
            current: EnvId::NONE,
            kernel_template: None,
        }
    }

    /// Sets the page directory that every subsequently allocated
    /// environment clones its kernel-space (`>= UTOP`) mappings from —
    /// typically the boot-time directory holding the `UPAGES`/`UENVS`
    /// read-only arrays and whatever else the kernel maps into every
    /// address space. Environments allocated before this is set get no
    /// kernel mappings at all.
    pub fn set_kernel_template(&mut self, pgdir: PageDirectory) {
        self.kernel_template = Some(pgdir);
    }

    /// Resolves `envid` to a table index, honoring the `envid == 0` means
    /// "the currently running environment" sentinel.
    ///
    /// # Errors
    /// - [`Error::BadEnv`] if `envid` names a free or generation-stale slot,
    ///   or the sentinel is used while no environment is current.
    pub fn resolve(&self, envid: EnvId) -> Result<EnvId> {
        let target = if envid == EnvId::NONE { self.current } else { envid };
        ensure!(target != EnvId::NONE, BadEnvSnafu);
        let slot = self.envs.get(target.index()).context(BadEnvSnafu)?;
        let env = slot.as_ref().context(BadEnvSnafu)?;
        ensure!(env.id == target, BadEnvSnafu);
        Ok(target)
    }

    /// Looks up an environment by id, resolving the `envid == 0` sentinel.
    ///
    /// # Errors
    /// - [`Error::BadEnv`] as in [`EnvTable::resolve`].
    pub fn get(&self, envid: EnvId) -> Result<&Env> {
        let target = self.resolve(envid)?;
        Ok(self.envs[target.index()].as_ref().expect("resolved id is live"))
    }

    /// Mutable counterpart of [`EnvTable::get`].
    ///
    /// # Errors
    /// - [`Error::BadEnv`] as in [`EnvTable::resolve`].
    pub fn get_mut(&mut self, envid: EnvId) -> Result<&mut Env> {
        let target = self.resolve(envid)?;
        Ok(self.envs[target.index()].as_mut().expect("resolved id is live"))
    }

    /// Checks that `caller` may act on `target`: the original's
    /// `checkperm` rule — you may always act on yourself, and a parent may
    /// act on a direct child.
    ///
    /// # Errors
    /// - [`Error::BadEnv`] if either id doesn't resolve.
    /// - [`Error::Permission`] if `caller` is neither `target` nor its parent.
    pub fn checkperm(&self, caller: EnvId, target: EnvId) -> Result<()> {
        let caller = self.resolve(caller)?;
        let target = self.resolve(target)?;
        if caller == target {
            return Ok(());
        }
        let target_env = self.envs[target.index()].as_ref().expect("resolved id is live");
        ensure!(target_env.parent_id == caller, PermissionSnafu);
        Ok(())
    }

    /// Which environment is currently running, if any.
    #[must_use]
    pub fn current(&self) -> EnvId {
        self.current
    }

    /// The fixed number of slots in this table ([`NENV`]).
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.envs.len()
    }

    /// The environment at raw table index `idx`, if that slot is occupied.
    #[must_use]
    pub fn slot(&self, idx: usize) -> Option<&Env> {
        self.envs.get(idx).and_then(Option::as_ref)
    }

    /// Iterates over every occupied slot.
    pub fn iter(&self) -> impl Iterator<Item = &Env> {
        self.envs.iter().filter_map(Option::as_ref)
    }

    /// Mutably iterates over every occupied slot.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Env> {
        self.envs.iter_mut().filter_map(Option::as_mut)
    }

    /// Marks `envid` as the currently running environment.
    pub fn set_current(&mut self, envid: EnvId) {
        self.current = envid;
    }

    /// Allocates a fresh environment slot with an empty address space,
    /// parented to `parent_id` (use [`EnvId::NONE`] for none).
    ///
    /// # Errors
    /// - [`Error::TooManyEnvs`] if every slot is in use.
    /// - whatever the underlying `page_alloc`/ASID allocation reports.
    pub fn env_alloc(
        &mut self,
        page_alloc: &mut PageAllocator,
        asid_pool: &AddressSpaceIdPool,
        parent_id: EnvId,
        sched: SchedClass,
    ) -> Result<EnvId> {
        let index = self.free_list.pop().context(TooManyEnvsSnafu)?;
        let generation = self.generation[index as usize];
        let id = EnvId::new(generation, index);
        let pgdir = PageDirectory::new(page_alloc).context(MemorySnafu)?;
        if let Some(template) = self.kernel_template {
            pgdir
                .clone_kernel_mappings(page_alloc, &template, VirtualAddress(UTOP))
                .context(MemorySnafu)?;
        }
        let (asid, asid_generation) = asid_pool.allocate();

        self.envs[index as usize] = Some(Env {
            id,
            parent_id,
            status: Status::Runnable,
            sched,
            pgdir,
            asid,
            asid_generation,
            runtime_left: 0,
            period_deadline: 0,
            entry_point: VirtualAddress(0),
            ipc: IpcState::default(),
            fds: FdTable::new(),
        });
        Ok(id)
    }

    /// Loads `image` into a freshly allocated environment and makes it
    /// runnable. Equivalent to the original's `env_create`.
    ///
    /// # Errors
    /// See [`EnvTable::env_alloc`] and [`elf::load`].
    pub fn env_create(
        &mut self,
        page_alloc: &mut PageAllocator,
        asid_pool: &AddressSpaceIdPool,
        tlb: &mut impl TlbShim,
        parent_id: EnvId,
        image: &[u8],
        sched: SchedClass,
    ) -> Result<EnvId> {
        let id = self.env_alloc(page_alloc, asid_pool, parent_id, sched)?;
        let (pgdir, asid) = {
            let env = self.envs[id.index() as usize].as_ref().expect("just allocated");
            (env.pgdir, env.asid)
        };
        let mut sink = ElfSink {
            page_alloc,
            tlb,
            pgdir,
            asid,
        };
        let entry = elf::load(image, &mut sink).context(ElfSnafu)?;
        self.envs[id.index() as usize].as_mut().expect("just allocated").entry_point = entry;
        Ok(id)
    }

    /// Convenience wrapper identical to [`EnvTable::env_create`] but with an
    /// EDF scheduling class, matching the original's `env_create_edf`.
    ///
    /// # Errors
    /// See [`EnvTable::env_create`].
    pub fn env_create_edf(
        &mut self,
        page_alloc: &mut PageAllocator,
        asid_pool: &AddressSpaceIdPool,
        tlb: &mut impl TlbShim,
        parent_id: EnvId,
        image: &[u8],
        period: u32,
        budget: u32,
    ) -> Result<EnvId> {
        self.env_create(
            page_alloc,
            asid_pool,
            tlb,
            parent_id,
            image,
            SchedClass::Edf { period, budget },
        )
    }

    /// Tears down `envid`: frees every mapped page, the page directory
    /// itself, the ASID, and any variables it owned, then returns the slot
    /// to the free list under a bumped generation counter.
    ///
    /// # Errors
    /// - [`Error::BadEnv`] if `envid` doesn't resolve.
    pub fn env_destroy(
        &mut self,
        page_alloc: &mut PageAllocator,
        asid_pool: &AddressSpaceIdPool,
        tlb: &mut impl TlbShim,
        vars: &mut VarTable,
        envid: EnvId,
    ) -> Result<()> {
        let target = self.resolve(envid)?;
        let env = self.envs[target.index()].take().expect("resolved id is live");

        // Only the user half of the address space belongs to this env: the
        // kernel half (>= UTOP) is shared, cloned in by `env_alloc` from the
        // kernel template, and torn down with the kernel itself, not here.
        let utop_pdx = VirtualAddress(UTOP).pdx() as u32;
        for pdx in 0..utop_pdx {
            let table_va = VirtualAddress(pdx << 22);
            if env.pgdir.pgdir_walk(page_alloc, table_va, false).ok().flatten().is_none() {
                continue;
            }
            for ptx in 0..1024u32 {
                let page_va = VirtualAddress(table_va.0 | (ptx << 12));
                let _ = env.pgdir.page_remove(page_alloc, tlb, env.asid, page_va);
            }
        }
        if let Err(e) = page_alloc.free(env.pgdir.root) {
            log::warn!("env {:#x}: freeing page directory root failed: {e}", env.id.raw());
        }
        if let Err(e) = asid_pool.free(env.asid) {
            log::warn!("env {:#x}: freeing asid failed: {e}", env.id.raw());
        }
        vars.remove_owner(env.id);

        self.generation[target.index()] += 1;
        self.free_list.push(target.index() as u32);
        if self.current == target {
            self.current = EnvId::NONE;
        }
        log::debug!("env {:#x} destroyed", env.id.raw());
        Ok(())
    }
}

impl Default for EnvTable {
    fn default() -> Self {
        Self::new()
    }
}

struct ElfSink<'a, T> {
    page_alloc: &'a mut PageAllocator,
    tlb: &'a mut T,
    pgdir: PageDirectory,
    asid: AddressSpaceId,
}

impl<T: TlbShim> elf::Loader for ElfSink<'_, T> {
    fn map_page(
        &mut self,
        va: VirtualAddress,
        perm: Perm,
        offset_in_page: usize,
        src: &[u8],
    ) -> core::result::Result<(), ()> {
        let page = match self.pgdir.page_lookup(self.page_alloc, va) {
            Some((page, _)) => page,
            None => {
                let page = self.page_alloc.alloc().map_err(|_| ())?;
                self.pgdir
                    .page_insert(self.page_alloc, self.tlb, self.asid, va, page, perm)
                    .map_err(|_| ())?;
                page
            }
        };
        let dst = self.page_alloc.page_to_kptr(page);
        // SAFETY: `dst` points at a whole page owned by `page`, and
        // `offset_in_page + src.len() <= PAGE_SIZE` is guaranteed by the caller
        // (`elf::load_segment` never splits across a page boundary).
        unsafe {
            core::ptr::copy_nonoverlapping(src.as_ptr(), dst.add(offset_in_page), src.len());
        }
        Ok(())
    }
}
