//! Physical and virtual memory management: the physical page allocator (C1),
//! the two-level page table / TLB discipline (C2), and the kernel heap
//! allocator (C3).

use snafu::Snafu;

pub mod asid_pool;
pub mod heap;
pub mod page;
pub mod page_table;

pub use asid_pool::{AddressSpaceId, AddressSpaceIdPool};
pub use page::{PageAllocator, PageRef};
pub use page_table::{PageDirectory, Perm, Pte, TlbShim};

/// Page size used throughout the address space: 4 KiB.
pub const PAGE_SIZE: usize = 4096;
/// Number of bits to shift a page number to get a byte address.
pub const PAGE_SHIFT: u32 = 12;
/// Top of user address space; the remainder is reserved for the kernel.
pub const UTOP: u32 = 0x8000_0000;

/// Start of the kernel heap window managed by [`heap::HeapAllocator`].
pub const HEAP_BEGIN: u32 = 0x8040_0000;
/// Length in bytes of the kernel heap window.
pub const HEAP_SIZE: u32 = 0x0040_0000;

/// Errors that arise from memory related operations.
#[derive(Debug, Snafu, PartialEq, Eq, Clone, Copy)]
pub enum Error {
    /// The physical page allocator has no free pages left.
    #[snafu(display("out of free pages"))]
    OutOfMemory,
    /// An address or length was not page-aligned where alignment was required.
    #[snafu(display("address or length not page-aligned"))]
    NotAligned,
    /// An address fell outside of the range this operation is permitted to touch.
    #[snafu(display("address out of range"))]
    OutOfRange,
    /// A page reference given to a free/decref operation was not known to the allocator.
    #[snafu(display("unknown page reference"))]
    UnknownPage,
}

/// Result type for memory operations.
pub type Result<T> = core::result::Result<T, Error>;

/// An address in the physical address space, i.e. the index of a 4 KiB page frame
/// times [`PAGE_SIZE`] plus an in-page offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(transparent)]
pub struct PhysicalAddress(pub u32);

/// An address in a process's (or the kernel's) virtual address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(transparent)]
pub struct VirtualAddress(pub u32);

impl VirtualAddress {
    /// The page directory index (top 10 bits) for this address.
    #[must_use]
    pub fn pdx(self) -> usize {
        (self.0 >> 22) as usize
    }

    /// The page table index (middle 10 bits) for this address.
    #[must_use]
    pub fn ptx(self) -> usize {
        ((self.0 >> 12) & 0x3ff) as usize
    }

    /// The in-page offset (low 12 bits) for this address.
    #[must_use]
    pub fn offset(self) -> u32 {
        self.0 & 0xfff
    }

    /// Rounds this address down to the start of its containing page.
    #[must_use]
    pub fn page_floor(self) -> VirtualAddress {
        VirtualAddress(self.0 & !0xfff)
    }

    /// `true` if this address is page-aligned.
    #[must_use]
    pub fn is_page_aligned(self) -> bool {
        self.0 & 0xfff == 0
    }

    /// `true` if this address lies in user space, i.e. below [`UTOP`].
    #[must_use]
    pub fn is_user(self) -> bool {
        self.0 < UTOP
    }
}

impl PhysicalAddress {
    /// The index of the page frame containing this address.
    #[must_use]
    pub fn page_number(self) -> usize {
        (self.0 >> PAGE_SHIFT) as usize
    }
}
