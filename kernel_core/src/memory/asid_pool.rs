use core::num::{NonZeroU16, NonZeroU32};
use core::sync::atomic::{AtomicU32, Ordering};

use crate::collections::{HandleAllocator, HandleAllocatorError};

/// Represents an Address Space Identifier (ASID).
///
/// ASIDs are 16-bit values used by a system to tag and identify different
/// process address spaces. The value `0` is reserved to indicate an invalid
/// or "no ASID".
pub type AddressSpaceId = NonZeroU16;

/// `AsidPool` manages a pool of ASIDs (16-bit integers) using a `HandleAllocator`
/// and a generation counter. The generation counter ensures that ASIDs can be
/// recycled without confusion. Each time the pool runs out of ASIDs, it resets
/// (frees all allocated ASIDs) and increments the generation counter, making all
/// previously issued ASIDs from prior generations invalid.
///
/// # Behavior
/// - If no ASIDs are available when allocating:
///   1. The allocator is reset (all ASIDs freed).
///   2. The generation counter is incremented.
///   3. The first available ASID in the new generation is returned.
///
/// # Thread Safety
/// This struct is designed to be used in a concurrent environment. The internal
/// `HandleAllocator` is thread-safe, and the generation counter is updated atomically.
pub struct AddressSpaceIdPool {
    /// The current generation count. This value is incremented whenever
    /// the pool runs out of ASIDs and resets.
    generation: AtomicU32,

    /// The underlying handle allocator that manages ASID allocation.
    allocator: HandleAllocator,
}

impl Default for AddressSpaceIdPool {
    fn default() -> Self {
        Self::new(u16::MAX)
    }
}

impl AddressSpaceIdPool {
    /// Creates a new ASID pool.
    pub fn new(max_asid: u16) -> Self {
        AddressSpaceIdPool {
            generation: AtomicU32::new(0),
            allocator: HandleAllocator::new(NonZeroU32::new(max_asid as u32).unwrap()),
        }
    }

    /// Allocates a new ASID and returns it along with the current generation count.
    ///
    /// If no ASIDs are available, the pool is reset (all allocated ASIDs are freed),
    /// the generation is incremented, and then the first ASID of the new generation
    /// is returned.
    ///
    /// # Returns
    ///
    /// `(asid, generation)` where:
    /// - `asid` is a 16-bit integer representing the allocated ASID.
    /// - `generation` is the 32-bit integer representing the current generation.
    ///
    /// # Guarantees
    ///
    /// - The returned `asid` will never be `0`.
    /// - Each `asid` is unique until the pool is reset.
    /// - The `generation` value is monotonically increasing each time the pool resets.
    pub fn allocate(&self) -> (AddressSpaceId, u32) {
        // Try to get the next available handle.
        if let Some(handle) = self.allocator.next_handle() {
            // Safe to unwrap since handle comes from the allocator and must be <= max_asids.
            let asid = handle.try_into().unwrap();
            let gen = self.generation.load(Ordering::Relaxed);
            return (asid, gen);
        }

        // No ASIDs available. Reset and increment the generation.
        unsafe {
            // SAFETY: we know this is safe because we are tracking generation counts
            self.allocator.reset();
        }
        let new_gen = self.generation.fetch_add(1, Ordering::Relaxed) + 1;

        // After resetting, the first available handle must succeed unless max_asids = 0,
        // which we disallowed in `new`.
        let handle = self
            .allocator
            .next_handle()
            .expect("allocator should have an available handle after reset");
        let asid = handle.try_into().unwrap();
        (asid, new_gen)
    }

    /// Frees a previously allocated ASID.
    ///
    /// # Arguments
    ///
    /// * `asid` - A 16-bit ASID that was previously returned by `allocate`.
    ///
    /// # Returns
    ///
    /// - `Ok(())` if the ASID was successfully freed.
    /// - `Err(Error)` if the ASID was out of bounds or not allocated.
    ///
    /// # Notes
    ///
    /// This function does not reset the generation. Freed ASIDs can be reused
    /// within the same generation.
    pub fn free(&self, asid: AddressSpaceId) -> Result<(), HandleAllocatorError> {
        self.allocator.free_handle(asid.into())
    }

    /// Returns the current generation count.
    ///
    /// This can be useful to detect when a pool reset (and generation increment) has occurred.
    pub fn current_generation(&self) -> u32 {
        self.generation.load(Ordering::Relaxed)
    }
}
