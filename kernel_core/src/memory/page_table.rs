//! Two-level page tables and the ASID-tagged TLB invalidation discipline.
//!
//! A page directory is itself stored in a physical frame drawn from the same
//! [`PageAllocator`] that backs ordinary data pages: [`PageDirectory::root`]
//! and every page-table page it allocates are refcounted frames like any
//! other. There is deliberately no raw pointer threading between entries —
//! the directory and its tables are plain arrays of [`Pte`] words indexed by
//! [`VirtualAddress::pdx`]/[`VirtualAddress::ptx`].

use bitfield::bitfield;
use snafu::ensure;

use super::asid_pool::AddressSpaceId;
use super::{Error, NotAlignedSnafu, PageAllocator, PageRef, Result, VirtualAddress, PAGE_SIZE};

bitfield! {
    /// A single page table (or page directory) entry.
    ///
    /// Bits 12..32 hold the physical frame index; the low bits are flags.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct Pte(u32);
    impl Debug;
    u32;
    /// Physical frame index this entry maps to.
    pub ppn, set_ppn: 31, 12;
    /// Entry is valid (present).
    pub v, set_v: 0;
    /// Entry is writable by the mapped address space.
    pub writable, set_writable: 1;
    /// Entry is marked copy-on-write: writable only after a private copy is
    /// materialized by the page-fault handler.
    pub cow, set_cow: 2;
    /// Entry should be shared verbatim (not copied) across a fork, as with
    /// pages belonging to a shared library mapping.
    pub library, set_library: 3;
    /// Entry must never be made writable, even by COW materialization
    /// (used for read-only program text).
    pub protect, set_protect: 4;
    /// Entry is global: ignored by ASID tagging in the TLB, visible from
    /// every address space (used for kernel mappings).
    pub global, set_global: 5;
    /// Entry has been written through since it was last inserted (dirty bit,
    /// set by the TLB-mod handler on first write to a COW page once the
    /// private copy exists).
    pub dirty, set_dirty: 6;
}

impl Pte {
    fn invalid() -> Self {
        Pte(0)
    }

    /// The frame this entry maps to, if valid.
    #[must_use]
    pub fn page(self) -> Option<PageRef> {
        self.v().then(|| PageRef::from_index(self.ppn()))
    }

    /// The raw permission/flag bits of this entry, for use against
    /// `perm_mask`/`perm_eq` words such as [`PTE_V`]/[`PTE_D`]/[`PTE_G`].
    #[must_use]
    pub fn bits(self) -> u32 {
        self.0
    }
}

/// Valid bit: the entry maps a present page.
pub const PTE_V: u32 = 1 << 0;
/// Dirty/writable bit: the mapping is writable by the mapped address space.
pub const PTE_D: u32 = 1 << 1;
/// Copy-on-write bit.
pub const PTE_COW: u32 = 1 << 2;
/// Library bit: shared verbatim across fork.
pub const PTE_LIBRARY: u32 = 1 << 3;
/// Protect bit: never made writable, even by COW materialization.
pub const PTE_PROTECT: u32 = 1 << 4;
/// Global bit: ignored by ASID tagging.
pub const PTE_G: u32 = 1 << 5;

/// Permission bits requested by a caller of [`PageDirectory::page_insert`].
/// Translated into the corresponding [`Pte`] flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Perm {
    /// Mapping should be writable.
    pub writable: bool,
    /// Mapping should be copy-on-write.
    pub cow: bool,
    /// Mapping should be treated as a shared library page (never copied on fork).
    pub library: bool,
    /// Mapping should never become writable, even via COW materialization.
    pub protect: bool,
    /// Mapping is global (not tagged by ASID, not invalidated by ASID-scoped flushes).
    pub global: bool,
}

/// A shim over the hardware TLB. `kernel` provides the real implementation;
/// tests use a recording mock.
pub trait TlbShim {
    /// Invalidate any cached translation for `va`. `asid` is ignored (and
    /// the entry is invalidated regardless of which address space it was
    /// tagged with) when `global` is set, matching the G-bit semantics of
    /// [`Pte::global`].
    fn invalidate(&mut self, asid: AddressSpaceId, va: VirtualAddress, global: bool);
}

/// A two-level page directory rooted at a single physical frame.
#[derive(Debug, Clone, Copy)]
pub struct PageDirectory {
    /// The frame holding this directory's 1024 top-level entries.
    pub root: PageRef,
}

impl PageDirectory {
    /// Allocates a fresh, empty page directory.
    ///
    /// # Errors
    /// - [`Error::OutOfMemory`] if no frame is available for the root.
    pub fn new(alloc: &mut PageAllocator) -> Result<Self> {
        let root = alloc.alloc()?;
        alloc.incref(root);
        Ok(PageDirectory { root })
    }

    fn entries(alloc: &PageAllocator, page: PageRef) -> *mut Pte {
        alloc.page_to_kptr(page).cast()
    }

    /// Copies every top-level entry at or above `cutoff` from `template`
    /// into this directory, sharing the underlying page-table frames (the
    /// same page tables end up referenced by both directories' root, with
    /// their refcount bumped accordingly) rather than copying page by page.
    /// Used to give a freshly allocated environment the same kernel-space
    /// mappings as every other one, without duplicating the kernel's own
    /// page tables per environment.
    ///
    /// Only overwrites entries that are actually present in `template`;
    /// existing entries in `self` at or above `cutoff` are left alone.
    ///
    /// # Errors
    /// - [`Error::NotAligned`] if `cutoff` is not page-aligned.
    pub fn clone_kernel_mappings(
        &self,
        alloc: &mut PageAllocator,
        template: &PageDirectory,
        cutoff: VirtualAddress,
    ) -> Result<()> {
        ensure!(cutoff.is_page_aligned(), NotAlignedSnafu);
        const ENTRIES_PER_TABLE: usize = PAGE_SIZE / core::mem::size_of::<Pte>();
        for pdx in cutoff.pdx()..ENTRIES_PER_TABLE {
            // SAFETY: `template.root` is a valid directory frame.
            let src_ptr = unsafe { Self::entries(alloc, template.root).add(pdx) };
            // SAFETY: `src_ptr` is within the directory frame.
            let pde = unsafe { src_ptr.read() };
            let Some(pt_page) = pde.page() else {
                continue;
            };
            alloc.incref(pt_page);
            // SAFETY: `self.root` is a valid directory frame owned by this `PageDirectory`.
            let dst_ptr = unsafe { Self::entries(alloc, self.root).add(pdx) };
            // SAFETY: `dst_ptr` is within the directory frame.
            unsafe {
                dst_ptr.write(pde);
            }
        }
        Ok(())
    }

    /// Returns the page-table slot that would hold the translation for `va`,
    /// allocating an intermediate page-table page if one doesn't exist and
    /// `create` is set. Returns `Ok(None)` if no mapping exists and `create`
    /// is false.
    ///
    /// # Errors
    /// - [`Error::NotAligned`] if `va` is not page-aligned.
    /// - [`Error::OutOfMemory`] if `create` is set and no frame is available
    ///   for a new page-table page.
    pub fn pgdir_walk(
        &self,
        alloc: &mut PageAllocator,
        va: VirtualAddress,
        create: bool,
    ) -> Result<Option<*mut Pte>> {
        ensure!(va.is_page_aligned(), NotAlignedSnafu);
        // SAFETY: `root` is a valid directory frame owned by this `PageDirectory`.
        let pde_ptr = unsafe { Self::entries(alloc, self.root).add(va.pdx()) };
        // SAFETY: `pde_ptr` is within the directory frame.
        let pde = unsafe { pde_ptr.read() };
        let pt_page = if let Some(page) = pde.page() {
            page
        } else {
            if !create {
                return Ok(None);
            }
            let page = alloc.alloc()?;
            alloc.incref(page);
            let mut new_pde = Pte::invalid();
            new_pde.set_ppn(page.index());
            new_pde.set_v(true);
            new_pde.set_writable(true);
            // SAFETY: see above.
            unsafe {
                pde_ptr.write(new_pde);
            }
            page
        };
        // SAFETY: `pt_page` is a valid page-table frame.
        let pte_ptr = unsafe { Self::entries(alloc, pt_page).add(va.ptx()) };
        Ok(Some(pte_ptr))
    }

    /// Maps `page` at `va` with the given permissions, replacing any
    /// existing mapping at that address. The new mapping is installed
    /// (and its refcount bumped) before any prior mapping is torn down, so
    /// re-inserting the page already mapped at `va` is a no-op rather than
    /// a transient free.
    ///
    /// # Errors
    /// - [`Error::NotAligned`] if `va` is not page-aligned.
    /// - [`Error::OutOfMemory`] if a new page-table page is needed and none
    ///   is available.
    pub fn page_insert(
        &self,
        alloc: &mut PageAllocator,
        tlb: &mut impl TlbShim,
        asid: AddressSpaceId,
        va: VirtualAddress,
        page: PageRef,
        perm: Perm,
    ) -> Result<()> {
        alloc.incref(page);
        let slot = self
            .pgdir_walk(alloc, va, true)?
            .expect("create=true always yields a slot");
        // SAFETY: `slot` was just returned for this directory.
        let old = unsafe { slot.read() };
        let mut pte = Pte::invalid();
        pte.set_ppn(page.index());
        pte.set_v(true);
        pte.set_writable(perm.writable);
        pte.set_cow(perm.cow);
        pte.set_library(perm.library);
        pte.set_protect(perm.protect);
        pte.set_global(perm.global);
        // SAFETY: see above.
        unsafe {
            slot.write(pte);
        }
        if let Some(old_page) = old.page() {
            tlb.invalidate(asid, va, old.global());
            // this cannot underflow to zero-then-reuse before the new mapping
            // above took its own incref, so decref here cannot free `page`
            // out from under the mapping we just installed even if
            // `old_page == page`.
            let _ = alloc.decref(old_page);
        }
        Ok(())
    }

    /// Returns the page currently mapped at `va` along with its entry, if any.
    #[must_use]
    pub fn page_lookup(&self, alloc: &mut PageAllocator, va: VirtualAddress) -> Option<(PageRef, Pte)> {
        let slot = self.pgdir_walk(alloc, va, false).ok()??;
        // SAFETY: `slot` is a valid entry within this directory's tables.
        let pte = unsafe { slot.read() };
        pte.page().map(|page| (page, pte))
    }

    /// Unmaps whatever page is mapped at `va`, decrementing its reference
    /// count and invalidating the TLB. A no-op if nothing is mapped there.
    pub fn page_remove(
        &self,
        alloc: &mut PageAllocator,
        tlb: &mut impl TlbShim,
        asid: AddressSpaceId,
        va: VirtualAddress,
    ) -> Result<()> {
        let Some(slot) = self.pgdir_walk(alloc, va, false)? else {
            return Ok(());
        };
        // SAFETY: `slot` is valid.
        let pte = unsafe { slot.read() };
        let Some(page) = pte.page() else {
            return Ok(());
        };
        // SAFETY: see above.
        unsafe {
            slot.write(Pte::invalid());
        }
        tlb.invalidate(asid, va, pte.global());
        alloc.decref(page)
    }

    /// Walks every present entry in this directory whose virtual address is
    /// strictly less than `va_cutoff` and whose permission bits, masked by
    /// `perm_mask`, differ from `perm_eq`, removing each one (decrementing
    /// its frame's refcount and invalidating the TLB, exactly as
    /// [`PageDirectory::page_remove`] does). An entry whose masked bits equal
    /// `perm_eq` is left alone. Every qualifying entry is visited exactly
    /// once; visiting order is otherwise unspecified. Returns the number of
    /// entries removed.
    pub fn page_conditional_remove(
        &self,
        alloc: &mut PageAllocator,
        tlb: &mut impl TlbShim,
        asid: AddressSpaceId,
        perm_mask: u32,
        perm_eq: u32,
        va_cutoff: VirtualAddress,
    ) -> Result<usize> {
        const ENTRIES_PER_TABLE: usize = PAGE_SIZE / core::mem::size_of::<Pte>();
        let mut removed = 0;
        for pdx in 0..ENTRIES_PER_TABLE {
            // SAFETY: `root` is a valid directory frame owned by this `PageDirectory`.
            let pde_ptr = unsafe { Self::entries(alloc, self.root).add(pdx) };
            // SAFETY: `pde_ptr` is within the directory frame.
            let pde = unsafe { pde_ptr.read() };
            let Some(pt_page) = pde.page() else {
                continue;
            };
            for ptx in 0..ENTRIES_PER_TABLE {
                let va = VirtualAddress(((pdx as u32) << 22) | ((ptx as u32) << 12));
                if va >= va_cutoff {
                    continue;
                }
                // SAFETY: `pt_page` is a valid page-table frame.
                let pte_ptr = unsafe { Self::entries(alloc, pt_page).add(ptx) };
                // SAFETY: see above.
                let pte = unsafe { pte_ptr.read() };
                let Some(page) = pte.page() else {
                    continue;
                };
                if pte.bits() & perm_mask == perm_eq {
                    continue;
                }
                // SAFETY: see above.
                unsafe {
                    pte_ptr.write(Pte::invalid());
                }
                tlb.invalidate(asid, va, pte.global());
                alloc.decref(page)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}
