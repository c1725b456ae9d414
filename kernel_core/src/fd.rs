//! File descriptors and pipes (C10).
//!
//! A pipe is a single-page ring buffer, allocated from the physical page
//! allocator like any other frame, with its read/write cursors and open-end
//! refcounts kept in a small header at the front of the page. There is no
//! general filesystem here, only pipes: every [`FdTable`] entry names one
//! end (read or write) of a [`PipeTable`] slot. `read`/`write` never block
//! internally — a full write or an empty, still-open-for-writing read
//! returns [`Error::WouldBlock`] and the caller (the syscall dispatcher) is
//! expected to reschedule the calling environment and retry, the same
//! yield-and-retry discipline `ipc_recv` uses at the scheduler layer.

use snafu::{ensure, ResultExt, Snafu};

use crate::memory::{PageAllocator, PageRef, PAGE_SIZE};

/// Maximum number of live pipes at once.
pub const MAX_PIPES: usize = 16;
/// Maximum number of file descriptors open in a single environment.
pub const MAX_FD: usize = 16;

#[repr(C)]
#[derive(Clone, Copy)]
struct PipeHeader {
    read_pos: u32,
    write_pos: u32,
    filled: u32,
    readers: u32,
    writers: u32,
}

const HEADER_SIZE: usize = core::mem::size_of::<PipeHeader>();
/// Number of bytes of ring buffer data a pipe can hold.
pub const PIPE_CAPACITY: usize = PAGE_SIZE - HEADER_SIZE;

/// Errors raised by file descriptor and pipe operations.
#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum Error {
    /// No free pipe slots remain.
    #[snafu(display("no free pipe slots"))]
    TablesFull,
    /// No free file descriptor slots remain in the caller's table.
    #[snafu(display("no free file descriptors"))]
    TooManyOpenFiles,
    /// `fd` does not name an open descriptor.
    #[snafu(display("bad file descriptor"))]
    BadFd,
    /// A read was attempted on a write end, or vice versa.
    #[snafu(display("wrong direction for this descriptor"))]
    WrongDirection,
    /// The operation cannot complete without blocking; the caller should
    /// yield and retry.
    #[snafu(display("would block"))]
    WouldBlock,
    /// A page allocation failed while creating a pipe.
    #[snafu(display("memory error: {source}"))]
    Memory {
        /// The underlying memory error.
        source: crate::memory::Error,
    },
}

type Result<T> = core::result::Result<T, Error>;

struct PipeSlot {
    page: PageRef,
}

impl PipeSlot {
    fn header(&self, alloc: &PageAllocator) -> *mut PipeHeader {
        alloc.page_to_kptr(self.page).cast()
    }

    fn data(&self, alloc: &PageAllocator) -> *mut u8 {
        // SAFETY: the page backing this slot is `PAGE_SIZE` bytes, of which
        // the header occupies a prefix of `HEADER_SIZE`.
        unsafe { alloc.page_to_kptr(self.page).add(HEADER_SIZE) }
    }
}

/// The table of all live pipe buffers.
#[derive(Default)]
pub struct PipeTable {
    slots: [Option<PipeSlot>; MAX_PIPES],
}

impl PipeTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        PipeTable::default()
    }

    /// Allocates a new pipe with one reader end and one writer end, and
    /// returns its slot index.
    ///
    /// # Errors
    /// - [`Error::TablesFull`] if every pipe slot is in use.
    /// - [`Error::Memory`] if the backing page cannot be allocated.
    pub fn create(&mut self, page_alloc: &mut PageAllocator) -> Result<usize> {
        let idx = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(Error::TablesFull)?;
        let page = page_alloc.alloc().context(MemorySnafu)?;
        page_alloc.incref(page);
        let slot = PipeSlot { page };
        // SAFETY: `page` was just allocated and zero-filled; a `PipeHeader`
        // of all zeroes but `readers`/`writers` is what we write below.
        unsafe {
            slot.header(page_alloc).write(PipeHeader {
                read_pos: 0,
                write_pos: 0,
                filled: 0,
                readers: 1,
                writers: 1,
            });
        }
        self.slots[idx] = Some(slot);
        Ok(idx)
    }

    fn slot(&self, idx: usize) -> Result<&PipeSlot> {
        self.slots.get(idx).and_then(Option::as_ref).ok_or(Error::BadFd)
    }

    fn header(&self, alloc: &PageAllocator, idx: usize) -> Result<PipeHeader> {
        let slot = self.slot(idx)?;
        // SAFETY: the header was initialized by `create` and is only ever
        // touched through this module.
        Ok(unsafe { slot.header(alloc).read() })
    }

    fn write_header(&self, alloc: &PageAllocator, idx: usize, header: PipeHeader) {
        let slot = self.slots[idx].as_ref().expect("caller already resolved this slot");
        // SAFETY: see `header`.
        unsafe {
            slot.header(alloc).write(header);
        }
    }

    /// Adds one to the reader or writer refcount of pipe `idx`, e.g. when a
    /// descriptor is duplicated across a fork.
    ///
    /// # Errors
    /// - [`Error::BadFd`] if `idx` does not name a live pipe.
    pub fn dup_end(&mut self, alloc: &PageAllocator, idx: usize, end: End) -> Result<()> {
        let mut h = self.header(alloc, idx)?;
        match end {
            End::Read => h.readers += 1,
            End::Write => h.writers += 1,
        }
        self.write_header(alloc, idx, h);
        Ok(())
    }

    /// Drops one reference to the reader or writer end of pipe `idx`,
    /// freeing its backing page once both ends have reached zero.
    ///
    /// # Errors
    /// - [`Error::BadFd`] if `idx` does not name a live pipe.
    pub fn close_end(&mut self, alloc: &mut PageAllocator, idx: usize, end: End) -> Result<()> {
        let mut h = self.header(alloc, idx)?;
        match end {
            End::Read => h.readers = h.readers.saturating_sub(1),
            End::Write => h.writers = h.writers.saturating_sub(1),
        }
        if h.readers == 0 && h.writers == 0 {
            let page = self.slots[idx].take().expect("slot resolved above").page;
            let _ = alloc.free(page);
        } else {
            self.write_header(alloc, idx, h);
        }
        Ok(())
    }

    /// Reads up to `buf.len()` bytes from pipe `idx` into `buf`. Returns
    /// `Ok(0)` once the write end has fully closed and the buffer is
    /// drained (end of file), and [`Error::WouldBlock`] if the buffer is
    /// empty but a writer is still open.
    ///
    /// # Errors
    /// - [`Error::BadFd`] if `idx` does not name a live pipe.
    /// - [`Error::WouldBlock`] as above.
    pub fn read(&mut self, alloc: &PageAllocator, idx: usize, buf: &mut [u8]) -> Result<usize> {
        let mut h = self.header(alloc, idx)?;
        if h.filled == 0 {
            return if h.writers == 0 { Ok(0) } else { Err(Error::WouldBlock) };
        }
        let slot = self.slot(idx)?;
        let data = slot.data(alloc);
        let n = core::cmp::min(buf.len(), h.filled as usize);
        for (i, b) in buf.iter_mut().enumerate().take(n) {
            let pos = (h.read_pos as usize + i) % PIPE_CAPACITY;
            // SAFETY: `pos` is within the ring buffer region of the page.
            *b = unsafe { data.add(pos).read() };
        }
        h.read_pos = ((h.read_pos as usize + n) % PIPE_CAPACITY) as u32;
        h.filled -= n as u32;
        self.write_header(alloc, idx, h);
        Ok(n)
    }

    /// Writes up to `buf.len()` bytes into pipe `idx`. Returns the number of
    /// bytes actually written, which may be less than requested if the
    /// buffer fills up partway through, or [`Error::WouldBlock`] if it was
    /// already full.
    ///
    /// # Errors
    /// - [`Error::BadFd`] if `idx` does not name a live pipe.
    /// - [`Error::WouldBlock`] if the ring buffer has no free space.
    pub fn write(&mut self, alloc: &PageAllocator, idx: usize, buf: &[u8]) -> Result<usize> {
        let mut h = self.header(alloc, idx)?;
        let free = PIPE_CAPACITY - h.filled as usize;
        ensure!(free > 0, WouldBlockSnafu);
        let slot = self.slot(idx)?;
        let data = slot.data(alloc);
        let n = core::cmp::min(buf.len(), free);
        for (i, b) in buf.iter().enumerate().take(n) {
            let pos = (h.write_pos as usize + i) % PIPE_CAPACITY;
            // SAFETY: see `read`.
            unsafe {
                data.add(pos).write(*b);
            }
        }
        h.write_pos = ((h.write_pos as usize + n) % PIPE_CAPACITY) as u32;
        h.filled += n as u32;
        self.write_header(alloc, idx, h);
        Ok(n)
    }
}

/// Which end of a pipe a descriptor names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum End {
    /// The read end.
    Read,
    /// The write end.
    Write,
}

#[derive(Clone, Copy)]
struct Descriptor {
    pipe: usize,
    end: End,
}

/// One environment's table of open file descriptors.
#[derive(Default)]
pub struct FdTable {
    entries: [Option<Descriptor>; MAX_FD],
}

impl FdTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        FdTable::default()
    }

    fn alloc_slot(&mut self) -> Result<usize> {
        self.entries
            .iter()
            .position(Option::is_none)
            .ok_or(Error::TooManyOpenFiles)
    }

    /// Creates a fresh pipe and installs its two ends at the lowest two free
    /// descriptor numbers, returning `(read_fd, write_fd)`.
    ///
    /// # Errors
    /// - [`Error::TooManyOpenFiles`] if fewer than two descriptors are free.
    /// - [`Error::TablesFull`]/[`Error::Memory`] as in [`PipeTable::create`].
    pub fn pipe(&mut self, pipes: &mut PipeTable, page_alloc: &mut PageAllocator) -> Result<(usize, usize)> {
        let read_fd = self.alloc_slot()?;
        self.entries[read_fd] = Some(Descriptor { pipe: 0, end: End::Read });
        let write_fd = match self.alloc_slot() {
            Ok(fd) => fd,
            Err(e) => {
                self.entries[read_fd] = None;
                return Err(e);
            }
        };
        let idx = pipes.create(page_alloc)?;
        self.entries[read_fd] = Some(Descriptor { pipe: idx, end: End::Read });
        self.entries[write_fd] = Some(Descriptor { pipe: idx, end: End::Write });
        Ok((read_fd, write_fd))
    }

    /// Duplicates every open descriptor of `self` into `child`, bumping the
    /// corresponding pipe end refcounts. Used when an environment forks.
    ///
    /// # Errors
    /// Propagates [`PipeTable::dup_end`] errors; none are expected in
    /// practice since every descriptor here names a live pipe.
    pub fn fork_into(&self, child: &mut FdTable, pipes: &mut PipeTable, alloc: &PageAllocator) -> Result<()> {
        for (i, entry) in self.entries.iter().enumerate() {
            if let Some(d) = entry {
                pipes.dup_end(alloc, d.pipe, d.end)?;
                child.entries[i] = Some(*d);
            }
        }
        Ok(())
    }

    /// Closes `fd`, dropping this table's reference to its pipe end.
    ///
    /// # Errors
    /// - [`Error::BadFd`] if `fd` is not open.
    pub fn close(&mut self, pipes: &mut PipeTable, alloc: &mut PageAllocator, fd: usize) -> Result<()> {
        let d = self.entries.get(fd).and_then(Option::as_ref).ok_or(Error::BadFd)?;
        let (pipe, end) = (d.pipe, d.end);
        self.entries[fd] = None;
        pipes.close_end(alloc, pipe, end)
    }

    /// Reads from `fd`, which must name a read end.
    ///
    /// # Errors
    /// - [`Error::BadFd`] if `fd` is not open.
    /// - [`Error::WrongDirection`] if `fd` names a write end.
    /// - [`Error::WouldBlock`] as in [`PipeTable::read`].
    pub fn read(&self, pipes: &mut PipeTable, alloc: &PageAllocator, fd: usize, buf: &mut [u8]) -> Result<usize> {
        let d = self.entries.get(fd).and_then(Option::as_ref).ok_or(Error::BadFd)?;
        ensure!(d.end == End::Read, WrongDirectionSnafu);
        pipes.read(alloc, d.pipe, buf)
    }

    /// Writes to `fd`, which must name a write end.
    ///
    /// # Errors
    /// - [`Error::BadFd`] if `fd` is not open.
    /// - [`Error::WrongDirection`] if `fd` names a read end.
    /// - [`Error::WouldBlock`] as in [`PipeTable::write`].
    pub fn write(&self, pipes: &mut PipeTable, alloc: &PageAllocator, fd: usize, buf: &[u8]) -> Result<usize> {
        let d = self.entries.get(fd).and_then(Option::as_ref).ok_or(Error::BadFd)?;
        ensure!(d.end == End::Write, WrongDirectionSnafu);
        pipes.write(alloc, d.pipe, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(npage: usize) -> (std::vec::Vec<u8>, PageAllocator) {
        let mut backing = std::vec![0u8; npage * PAGE_SIZE];
        let alloc = unsafe { PageAllocator::new(backing.as_mut_ptr(), npage) };
        (backing, alloc)
    }

    #[test]
    fn write_then_read_round_trips() {
        let (_b, mut alloc) = setup(4);
        let mut pipes = PipeTable::new();
        let mut fds = FdTable::new();
        let (r, w) = fds.pipe(&mut pipes, &mut alloc).unwrap();
        assert_eq!(fds.write(&mut pipes, &alloc, w, b"hello").unwrap(), 5);
        let mut buf = [0u8; 5];
        assert_eq!(fds.read(&mut pipes, &alloc, r, &mut buf).unwrap(), 5);
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn read_on_empty_open_pipe_would_block() {
        let (_b, mut alloc) = setup(4);
        let mut pipes = PipeTable::new();
        let mut fds = FdTable::new();
        let (r, _w) = fds.pipe(&mut pipes, &mut alloc).unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(fds.read(&mut pipes, &alloc, r, &mut buf), Err(Error::WouldBlock));
    }

    #[test]
    fn closing_last_writer_yields_eof_after_drain() {
        let (_b, mut alloc) = setup(4);
        let mut pipes = PipeTable::new();
        let mut fds = FdTable::new();
        let (r, w) = fds.pipe(&mut pipes, &mut alloc).unwrap();
        fds.write(&mut pipes, &alloc, w, b"x").unwrap();
        fds.close(&mut pipes, &mut alloc, w).unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(fds.read(&mut pipes, &alloc, r, &mut buf).unwrap(), 1);
        assert_eq!(fds.read(&mut pipes, &alloc, r, &mut buf).unwrap(), 0);
    }

    #[test]
    fn full_pipe_write_would_block() {
        let (_b, mut alloc) = setup(4);
        let mut pipes = PipeTable::new();
        let mut fds = FdTable::new();
        let (_r, w) = fds.pipe(&mut pipes, &mut alloc).unwrap();
        let chunk = std::vec![0u8; PIPE_CAPACITY];
        assert_eq!(fds.write(&mut pipes, &alloc, w, &chunk).unwrap(), PIPE_CAPACITY);
        assert_eq!(fds.write(&mut pipes, &alloc, w, &[1]), Err(Error::WouldBlock));
    }

    #[test]
    fn fork_into_duplicates_descriptors_and_bumps_refcounts() {
        let (_b, mut alloc) = setup(4);
        let mut pipes = PipeTable::new();
        let mut parent = FdTable::new();
        let (r, w) = parent.pipe(&mut pipes, &mut alloc).unwrap();
        let mut child = FdTable::new();
        parent.fork_into(&mut child, &mut pipes, &alloc).unwrap();
        parent.close(&mut pipes, &mut alloc, w).unwrap();
        // child's write end still holds the pipe open
        let mut buf = [0u8; 1];
        assert_eq!(child.read(&mut pipes, &alloc, r, &mut buf), Err(Error::WouldBlock));
    }

    #[test]
    fn bad_fd_is_an_error() {
        let (_b, mut alloc) = setup(4);
        let mut pipes = PipeTable::new();
        let fds = FdTable::new();
        let mut buf = [0u8; 1];
        assert_eq!(fds.read(&mut pipes, &alloc, 0, &mut buf), Err(Error::BadFd));
        let _ = &mut alloc;
    }
}
