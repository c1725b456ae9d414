//! Keyed shared memory regions (C6).
//!
//! A region is a run of up to [`N_SHM_PAGE`] pages, identified by a
//! kernel-generated `key` handed back from [`ShmTable::new`], which
//! allocates all of the region's frames up front. [`ShmTable::bind`] is a
//! separate, later call — possibly from a different environment that only
//! knows the key — that maps those already-allocated frames into a
//! caller-chosen virtual address range. A region with one or more open
//! bindings cannot be freed.

use snafu::{ensure, ResultExt, Snafu};

use crate::memory::{PageAllocator, PageRef, Perm, TlbShim, VirtualAddress};
use crate::process::{self, EnvId, EnvTable};

/// Maximum number of distinct shared memory regions live at once.
pub const N_SHM: usize = 8;
/// Number of pages in one shared memory region.
pub const N_SHM_PAGE: usize = 8;

/// Errors raised by shared-memory operations.
#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum Error {
    /// Every region slot is in use.
    #[snafu(display("no free shared memory region slots"))]
    TableFull,
    /// No region exists with the given key.
    #[snafu(display("no shared memory region with that key"))]
    NoSuchKey,
    /// `npage` exceeds [`N_SHM_PAGE`].
    #[snafu(display("shared memory region of {npage} pages exceeds the per-region limit"))]
    TooManyPages {
        /// The rejected page count.
        npage: usize,
    },
    /// The region still has open bindings and cannot be freed.
    #[snafu(display("shared memory region is still bound"))]
    Busy,
    /// `env` did not resolve to a live environment.
    #[snafu(display("environment error: {source}"))]
    Env {
        /// The underlying environment-manager error.
        source: process::Error,
    },
    /// A memory operation (mapping/unmapping a page) failed.
    #[snafu(display("memory error: {source}"))]
    Memory {
        /// The underlying memory error.
        source: crate::memory::Error,
    },
}

type Result<T> = core::result::Result<T, Error>;

struct Region {
    key: u32,
    pages: [Option<PageRef>; N_SHM_PAGE],
    npage: usize,
    open_count: u32,
}

/// The table of all live shared memory regions.
pub struct ShmTable {
    regions: [Option<Region>; N_SHM],
    next_key: u32,
}

impl Default for ShmTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ShmTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        ShmTable {
            regions: Default::default(),
            next_key: 1,
        }
    }

    fn find(&self, key: u32) -> Option<usize> {
        self.regions
            .iter()
            .position(|r| r.as_ref().is_some_and(|r| r.key == key))
    }

    /// Allocates a fresh region of `npage` frames in a free slot and returns
    /// its kernel-generated key.
    ///
    /// # Errors
    /// - [`Error::TooManyPages`] if `npage` exceeds [`N_SHM_PAGE`].
    /// - [`Error::TableFull`] if every slot is in use.
    /// - [`Error::Memory`] if a frame allocation fails partway through; any
    ///   frames already allocated for this region are freed back.
    pub fn new(&mut self, page_alloc: &mut PageAllocator, npage: usize) -> Result<u32> {
        ensure!(npage <= N_SHM_PAGE, TooManyPagesSnafu { npage });
        let slot = self
            .regions
            .iter()
            .position(Option::is_none)
            .ok_or(Error::TableFull)?;

        let mut pages = [None; N_SHM_PAGE];
        for slot_page in pages.iter_mut().take(npage) {
            match page_alloc.alloc() {
                Ok(p) => *slot_page = Some(p),
                Err(e) => {
                    for p in pages.into_iter().flatten() {
                        let _ = page_alloc.free(p);
                    }
                    return Err(e).context(MemorySnafu);
                }
            }
        }

        let key = self.next_key;
        self.next_key = self.next_key.wrapping_add(1).max(1);
        self.regions[slot] = Some(Region {
            key,
            pages,
            npage,
            open_count: 0,
        });
        Ok(key)
    }

    /// Maps the already-allocated region under `key` into `env`'s address
    /// space, starting at `va`, one page per frame in order.
    ///
    /// # Errors
    /// - [`Error::Env`] if `env` doesn't resolve.
    /// - [`Error::NoSuchKey`] if no region exists under `key`.
    /// - [`Error::Memory`] if a mapping fails.
    pub fn bind(
        &mut self,
        envs: &mut EnvTable,
        page_alloc: &mut PageAllocator,
        tlb: &mut impl TlbShim,
        env: EnvId,
        key: u32,
        va: VirtualAddress,
        perm: Perm,
    ) -> Result<()> {
        let slot = self.find(key).ok_or(Error::NoSuchKey)?;
        let region = self.regions[slot].as_mut().expect("found slot is occupied");

        let target = envs.get(env).context(EnvSnafu)?;
        let (pgdir, asid) = (target.pgdir, target.asid);
        for i in 0..region.npage {
            let page = region.pages[i].expect("every page below npage is allocated by new");
            let page_va = VirtualAddress(va.0 + (i * crate::memory::PAGE_SIZE) as u32);
            pgdir
                .page_insert(page_alloc, tlb, asid, page_va, page, perm)
                .context(MemorySnafu)?;
        }
        region.open_count += 1;
        Ok(())
    }

    /// Unmaps the region under `key` from `env`'s address space starting at
    /// `va`, decrementing its open count.
    ///
    /// # Errors
    /// - [`Error::Env`] if `env` doesn't resolve.
    /// - [`Error::NoSuchKey`] if no region exists under `key`.
    /// - [`Error::Memory`] if unmapping a page fails.
    pub fn unbind(
        &mut self,
        envs: &mut EnvTable,
        page_alloc: &mut PageAllocator,
        tlb: &mut impl TlbShim,
        env: EnvId,
        key: u32,
        va: VirtualAddress,
    ) -> Result<()> {
        let slot = self.find(key).ok_or(Error::NoSuchKey)?;
        let region = self.regions[slot].as_mut().expect("found slot is occupied");
        let target = envs.get(env).context(EnvSnafu)?;
        let (pgdir, asid) = (target.pgdir, target.asid);
        for i in 0..region.npage {
            let page_va = VirtualAddress(va.0 + (i * crate::memory::PAGE_SIZE) as u32);
            pgdir
                .page_remove(page_alloc, tlb, asid, page_va)
                .context(MemorySnafu)?;
        }
        region.open_count = region.open_count.saturating_sub(1);
        Ok(())
    }

    /// Destroys the region under `key`, freeing its backing pages.
    ///
    /// # Errors
    /// - [`Error::NoSuchKey`] if no region exists under `key`.
    /// - [`Error::Busy`] if the region still has open bindings.
    pub fn free(&mut self, page_alloc: &mut PageAllocator, key: u32) -> Result<()> {
        let slot = self.find(key).ok_or(Error::NoSuchKey)?;
        let region = self.regions[slot].as_ref().expect("found slot is occupied");
        ensure!(region.open_count == 0, BusySnafu);
        for page in region.pages.into_iter().flatten() {
            let _ = page_alloc.free(page);
        }
        self.regions[slot] = None;
        Ok(())
    }
}
