//! Kernel entry point.
//!
//! What lives here is only what ties `kernel_core`'s data structures
//! together into one running system: everything that depends on the real
//! MIPS-class target (the trap vector, the context-switch assembly, board
//! bring-up, a console and filesystem server reachable over IPC) is a
//! documented seam rather than something this crate fabricates.
#![no_std]
#![no_main]

mod logging;

use log::info;
use spin::Mutex;

use kernel_core::fd::PipeTable;
use kernel_core::memory::{AddressSpaceIdPool, PageAllocator, PageDirectory};
use kernel_core::process::{EnvTable, VarTable};
use kernel_core::sched::Scheduler;
use kernel_core::shm::ShmTable;

/// The kernel's global, cooperatively-shared state. Protected by a lock
/// purely so the types are `Sync`; the scheduler never actually preempts
/// while one of these is held, since there is exactly one core and no
/// interrupts are enabled inside the kernel.
struct Kernel {
    page_alloc: PageAllocator,
    asids: AddressSpaceIdPool,
    envs: EnvTable,
    vars: VarTable,
    shm: ShmTable,
    pipes: PipeTable,
    sched: Scheduler,
}

static KERNEL: Mutex<Option<Kernel>> = Mutex::new(None);

/// Number of physical page frames managed by the allocator. The real value
/// depends on how much RAM the board reports; this is a placeholder until
/// that's wired up.
const NUM_PAGES: usize = 4096;

#[no_mangle]
pub extern "C" fn kmain() -> ! {
    // SAFETY: this pointer is provided by board bring-up code that isn't
    // part of this crate; wiring it up is out of scope here.
    let console = unsafe { logging::MmioConsole::new(core::ptr::null_mut()) };
    logging::init_logging(console);

    // SAFETY: the arena base and size are placeholders pending a real
    // memory map from the board; see the module doc.
    static mut ARENA: [u8; NUM_PAGES * kernel_core::memory::PAGE_SIZE] =
        [0; NUM_PAGES * kernel_core::memory::PAGE_SIZE];
    #[allow(static_mut_refs)]
    let mut page_alloc = unsafe { PageAllocator::new(ARENA.as_mut_ptr(), NUM_PAGES) };
    let asids = AddressSpaceIdPool::new(64);

    // The kernel half of every address space (UPAGES/UENVS and whatever else
    // lives above UTOP) is set up once here and cloned into each env's own
    // directory by `EnvTable::env_alloc`; populating it with the real
    // kernel-space mappings depends on the board's memory map and is part of
    // the same out-of-scope bring-up as the trap vector below.
    let kernel_template =
        PageDirectory::new(&mut page_alloc).expect("arena has room for the kernel template directory");
    let mut envs = EnvTable::new();
    envs.set_kernel_template(kernel_template);

    info!("kernel initialized: {} page frames, {} address space ids", NUM_PAGES, 64);

    *KERNEL.lock() = Some(Kernel {
        page_alloc,
        asids,
        envs,
        vars: VarTable::new(),
        shm: ShmTable::new(),
        pipes: PipeTable::new(),
        sched: Scheduler::new(),
    });

    // The scheduler tick loop, the trap vector that dispatches into
    // `kernel_core::syscall`, and the first user environment all depend on
    // assembly this crate doesn't provide. Park here instead of pretending
    // to boot further.
    #[allow(clippy::empty_loop)]
    loop {}
}

#[panic_handler]
pub fn panic_handler(info: &core::panic::PanicInfo) -> ! {
    log::error!("panic: {info}");
    #[allow(clippy::empty_loop)]
    loop {}
}
