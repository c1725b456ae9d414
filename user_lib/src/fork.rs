//! User-space copy-on-write `fork` (C9).
//!
//! The kernel only provides `exofork`, `page_map`/`page_alloc`/`page_unmap`,
//! and TLB-modify fault routing; the copy-on-write policy itself — which
//! pages get shared read-write, which get `COW`-marked, which are copied
//! outright — lives entirely up here, atop [`Syscalls`].
use alloc::vec::Vec;

use crate::syscalls::{EnvId, EnvStatus, Error, Perm, Syscalls, VirtualAddress};

/// One mapping present in the calling environment's address space below
/// `UTOP`, as reported by [`AddressSpaceView::present_mappings`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    /// The mapped virtual address.
    pub va: VirtualAddress,
    /// Its current permission bits.
    pub perm: Perm,
    /// Shared across fork without copy-on-write (the source's `PTE_LIBRARY`
    /// bit). Pages with this set are mapped read-write in both parent and
    /// child rather than made `COW`.
    pub library: bool,
    /// Excluded from sharing entirely (`PTE_PROTECT`): copied outright
    /// rather than shared or `COW`-mapped.
    pub protect: bool,
}

/// A read-only view of the calling environment's present mappings below
/// `UTOP`. Exists because `page_conditional_remove`-style enumeration is a
/// kernel-side VM-walk operation, not something expressible purely through
/// [`Syscalls`]; a real binary backs this by reading `UPAGES`/`UENVS`, the
/// read-only kernel arrays the spec exposes to user space for exactly this
/// purpose.
pub trait AddressSpaceView {
    /// Lists every present user mapping below `UTOP`.
    fn present_mappings(&self) -> Vec<Mapping>;
}

/// The user-space VA of the per-environment TLB-modify fault handler,
/// installed once per process before its first `fork`.
pub const UXSTACKTOP_HANDLER: VirtualAddress = VirtualAddress(0x8000_0000 - 4096);

/// Forks the calling environment.
///
/// On success in the parent, returns the child's [`EnvId`]. The child's
/// own view of this same call is expected to observe `getenvid() == child`
/// once the scheduler runs it; unlike a POSIX `fork`, there is no single
/// "returns 0 in the child" value here because the split happens across
/// two address spaces that this function, running in the parent, cannot
/// observe executing.
pub fn fork<S: Syscalls, V: AddressSpaceView>(
    sys: &S,
    view: &V,
    tlb_mod_entry: VirtualAddress,
) -> Result<EnvId, Error> {
    let parent = sys.getenvid();
    let child = sys.exofork()?;
    sys.set_tlb_mod_entry(parent, tlb_mod_entry)?;
    sys.set_tlb_mod_entry(child, tlb_mod_entry)?;

    for mapping in view.present_mappings() {
        if mapping.protect {
            sys.page_alloc(child, mapping.va, mapping.perm)?;
            continue;
        }
        if mapping.library {
            sys.page_map(parent, mapping.va, child, mapping.va, mapping.perm)?;
            continue;
        }
        if mapping.perm.write {
            let cow_perm = Perm {
                write: false,
                library: false,
            };
            sys.page_map(parent, mapping.va, child, mapping.va, cow_perm)?;
            sys.page_map(child, mapping.va, parent, mapping.va, cow_perm)?;
        } else {
            sys.page_map(parent, mapping.va, child, mapping.va, mapping.perm)?;
        }
    }

    sys.env_set_status(child, EnvStatus::Runnable)?;
    Ok(child)
}

/// Handles a write fault against a page this process previously shared as
/// copy-on-write: allocates a fresh frame, copies the faulting page's
/// contents into it, and installs it writable in place of the shared,
/// read-only mapping.
///
/// `copy_page` performs the actual byte copy; it is injected rather than
/// hardcoded because it has to run against the real fault's scratch page
/// (`UXSTACKTOP`), which this crate has no access to outside a real fault
/// context.
pub fn handle_cow_fault<S: Syscalls>(
    sys: &S,
    fault_va: VirtualAddress,
    copy_page: impl FnOnce(VirtualAddress, VirtualAddress) -> Result<(), Error>,
) -> Result<(), Error> {
    let env = sys.getenvid();
    let page_aligned = VirtualAddress(fault_va.0 & !0xFFF);
    let scratch = VirtualAddress(UXSTACKTOP_HANDLER.0);
    sys.page_alloc(
        env,
        scratch,
        Perm {
            write: true,
            library: false,
        },
    )?;
    copy_page(page_aligned, scratch)?;
    sys.page_map(
        env,
        scratch,
        env,
        page_aligned,
        Perm {
            write: true,
            library: false,
        },
    )?;
    sys.page_unmap(env, scratch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syscalls::MockSyscalls;
    use alloc::vec;

    struct FixedView(Vec<Mapping>);
    impl AddressSpaceView for FixedView {
        fn present_mappings(&self) -> Vec<Mapping> {
            self.0.clone()
        }
    }

    #[test]
    fn fork_shares_library_pages_read_write() {
        let mut sys = MockSyscalls::new();
        sys.expect_getenvid().return_const(EnvId(1));
        sys.expect_exofork().returning(|| Ok(EnvId(2)));
        sys.expect_set_tlb_mod_entry().returning(|_, _| Ok(()));
        sys.expect_page_map()
            .withf(|_, _, _, _, perm| perm.library)
            .times(1)
            .returning(|_, _, _, _, _| Ok(()));
        sys.expect_env_set_status()
            .withf(|env, status| *env == EnvId(2) && *status == EnvStatus::Runnable)
            .returning(|_, _| Ok(()));

        let view = FixedView(vec![Mapping {
            va: VirtualAddress(0x1000),
            perm: Perm {
                write: true,
                library: true,
            },
            library: true,
            protect: false,
        }]);

        let child = fork(&sys, &view, VirtualAddress(0x2000)).unwrap();
        assert_eq!(child, EnvId(2));
    }

    #[test]
    fn fork_cow_maps_a_writable_page_in_both_directions() {
        let mut sys = MockSyscalls::new();
        sys.expect_getenvid().return_const(EnvId(1));
        sys.expect_exofork().returning(|| Ok(EnvId(2)));
        sys.expect_set_tlb_mod_entry().returning(|_, _| Ok(()));
        sys.expect_page_map()
            .withf(|_, _, _, _, perm| !perm.write)
            .times(2)
            .returning(|_, _, _, _, _| Ok(()));
        sys.expect_env_set_status().returning(|_, _| Ok(()));

        let view = FixedView(vec![Mapping {
            va: VirtualAddress(0x3000),
            perm: Perm {
                write: true,
                library: false,
            },
            library: false,
            protect: false,
        }]);

        fork(&sys, &view, VirtualAddress(0x2000)).unwrap();
    }

    #[test]
    fn fork_copies_protected_pages_outright() {
        let mut sys = MockSyscalls::new();
        sys.expect_getenvid().return_const(EnvId(1));
        sys.expect_exofork().returning(|| Ok(EnvId(2)));
        sys.expect_set_tlb_mod_entry().returning(|_, _| Ok(()));
        sys.expect_page_alloc()
            .times(1)
            .returning(|_, _, _| Ok(()));
        sys.expect_page_map().times(0);
        sys.expect_env_set_status().returning(|_, _| Ok(()));

        let view = FixedView(vec![Mapping {
            va: VirtualAddress(0x4000),
            perm: Perm {
                write: true,
                library: false,
            },
            library: false,
            protect: true,
        }]);

        fork(&sys, &view, VirtualAddress(0x2000)).unwrap();
    }
}
