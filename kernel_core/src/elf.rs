//! ELF32 program loading.
//!
//! The ELF header and section/segment table formats themselves are treated
//! as an external, already-validated byte layout (the binary format is out
//! of this crate's scope); what this module owns is the *segment-loading
//! contract* between the loader and whatever owns the destination address
//! space. That contract is expressed as the single-method [`Loader`] trait,
//! following `elf_load_seg` in the original teaching kernel's loader: one
//! callback per page the segment touches, including a page-aligned partial
//! first page when the segment's virtual address isn't page-aligned.

use byteorder::{ByteOrder, LittleEndian};
use snafu::{ensure, Snafu};

use crate::memory::{Perm, VirtualAddress, PAGE_SIZE};

/// Errors that can occur while loading an ELF image.
#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum Error {
    /// The image is too short to contain a valid ELF header.
    #[snafu(display("image too short for an ELF header"))]
    Truncated,
    /// The image does not start with the ELF magic number.
    #[snafu(display("not an ELF image"))]
    BadMagic,
    /// The image is not a 32-bit little-endian executable.
    #[snafu(display("not a 32-bit LE executable image"))]
    NotExecutable,
    /// The sink rejected a mapping request.
    #[snafu(display("segment mapping rejected"))]
    MapRejected,
}

type Result<T> = core::result::Result<T, Error>;

const EI_CLASS: usize = 4;
const EI_DATA: usize = 5;
const ELFCLASS32: u8 = 1;
const ELFDATA2LSB: u8 = 1;
const ET_EXEC: u16 = 2;
const PT_LOAD: u32 = 1;

/// The destination address space for an ELF load, expressed as a single
/// callback invoked once per page touched by a loadable segment.
///
/// `offset_in_page` is nonzero only for the first page of a segment whose
/// virtual address is not page-aligned; every other call maps a whole page.
/// `src` is the slice of segment bytes that land in this page — shorter
/// than a page at the tail of the segment or for the zero-filled part of
/// `.bss`, in which case `src` is empty and the sink must still zero the
/// rest of the page (pages come pre-zeroed out of the physical allocator,
/// so an empty `src` normally requires no action beyond mapping).
pub trait Loader {
    /// Maps one page (or the portion of one page covered by `src`) at `va`
    /// with the given permissions, copying `src` in at `offset_in_page`.
    ///
    /// # Errors
    /// Implementations return [`Error::MapRejected`] (via the `?` operator
    /// in the caller) to abort the load, e.g. on address-space exhaustion.
    fn map_page(
        &mut self,
        va: VirtualAddress,
        perm: Perm,
        offset_in_page: usize,
        src: &[u8],
    ) -> core::result::Result<(), ()>;
}

/// Loads the `PT_LOAD` segments of `image` into `sink`, returning the
/// entry point address.
///
/// # Errors
/// - [`Error::Truncated`]/[`Error::BadMagic`]/[`Error::NotExecutable`] if
///   `image` isn't a well-formed ELF32 executable.
/// - [`Error::MapRejected`] if `sink` rejects a page.
pub fn load(image: &[u8], sink: &mut impl Loader) -> Result<VirtualAddress> {
    ensure!(image.len() >= 52, TruncatedSnafu);
    ensure!(&image[0..4] == b"\x7fELF", BadMagicSnafu);
    ensure!(image[EI_CLASS] == ELFCLASS32, NotExecutableSnafu);
    ensure!(image[EI_DATA] == ELFDATA2LSB, NotExecutableSnafu);
    let e_type = LittleEndian::read_u16(&image[16..18]);
    ensure!(e_type == ET_EXEC, NotExecutableSnafu);
    let e_entry = LittleEndian::read_u32(&image[24..28]);
    let e_phoff = LittleEndian::read_u32(&image[28..32]) as usize;
    let e_phentsize = LittleEndian::read_u16(&image[42..44]) as usize;
    let e_phnum = LittleEndian::read_u16(&image[44..46]) as usize;

    for i in 0..e_phnum {
        let ph_start = e_phoff + i * e_phentsize;
        ensure!(image.len() >= ph_start + 32, TruncatedSnafu);
        let ph = &image[ph_start..];
        let p_type = LittleEndian::read_u32(&ph[0..4]);
        if p_type != PT_LOAD {
            continue;
        }
        let p_offset = LittleEndian::read_u32(&ph[4..8]) as usize;
        let p_vaddr = LittleEndian::read_u32(&ph[8..12]);
        let p_filesz = LittleEndian::read_u32(&ph[16..20]) as usize;
        let p_memsz = LittleEndian::read_u32(&ph[20..24]) as usize;
        let p_flags = LittleEndian::read_u32(&ph[24..28]);
        ensure!(image.len() >= p_offset + p_filesz, TruncatedSnafu);

        let perm = Perm {
            writable: p_flags & 0x2 != 0,
            ..Perm::default()
        };

        load_segment(
            &image[p_offset..p_offset + p_filesz],
            p_vaddr,
            p_memsz,
            perm,
            sink,
        )?;
    }

    Ok(VirtualAddress(e_entry))
}

/// Maps one segment page by page, mirroring the original loader's two-phase
/// walk: an optional unaligned prefix page (when `vaddr` isn't page
/// aligned), then whole pages of file content, then zero-filled pages for
/// the `memsz - filesz` BSS tail.
fn load_segment(
    file_bytes: &[u8],
    vaddr: u32,
    memsz: usize,
    perm: Perm,
    sink: &mut impl Loader,
) -> Result<()> {
    let mut va = VirtualAddress(vaddr);
    let mut remaining_file = file_bytes;
    let mut remaining_mem = memsz;

    let first_page_offset = va.offset() as usize;
    if first_page_offset != 0 {
        let room = PAGE_SIZE - first_page_offset;
        let take = room.min(remaining_file.len());
        sink.map_page(va.page_floor(), perm, first_page_offset, &remaining_file[..take])
            .map_err(|()| Error::MapRejected)?;
        remaining_file = &remaining_file[take..];
        remaining_mem = remaining_mem.saturating_sub(room.min(remaining_mem));
        va = VirtualAddress(va.0 + room as u32);
    }

    while !remaining_file.is_empty() {
        let take = remaining_file.len().min(PAGE_SIZE);
        sink.map_page(va, perm, 0, &remaining_file[..take])
            .map_err(|()| Error::MapRejected)?;
        remaining_file = &remaining_file[take..];
        remaining_mem = remaining_mem.saturating_sub(take);
        va = VirtualAddress(va.0 + PAGE_SIZE as u32);
    }

    while remaining_mem > 0 {
        sink.map_page(va, perm, 0, &[]).map_err(|()| Error::MapRejected)?;
        let take = remaining_mem.min(PAGE_SIZE);
        remaining_mem -= take;
        va = VirtualAddress(va.0 + PAGE_SIZE as u32);
    }

    Ok(())
}
