//! Host-side simulated physical memory.
//!
//! Frames materialize zero-filled on first touch, so a test can pretend to own
//! gigabytes of RAM while only paying for the frames it actually uses.

use crate::PhysMapper;
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress};
use kernel_sync::SpinLock;

#[allow(clippy::cast_possible_truncation)]
const FRAME_BYTES: usize = PAGE_SIZE as usize;

#[repr(C, align(4096))]
struct RamFrame([u8; FRAME_BYTES]);

/// Sparse, lazily allocated physical memory.
#[derive(Default)]
pub struct SimulatedRam {
    frames: SpinLock<BTreeMap<u64, Box<RamFrame>>>,
}

impl SimulatedRam {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of frames touched so far.
    #[must_use]
    pub fn resident_frames(&self) -> usize {
        self.frames.lock().len()
    }

    /// Whether the frame has ever been touched.
    #[must_use]
    pub fn is_resident(&self, frame: u64) -> bool {
        self.frames.lock().contains_key(&frame)
    }

    /// Base pointer of the frame containing `pa`.
    ///
    /// Frames are boxed and never freed, so the pointer stays valid for the
    /// lifetime of `self`.
    fn frame_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        let mut frames = self.frames.lock();
        let frame = frames
            .entry(pa.frame_number())
            .or_insert_with(|| Box::new(RamFrame([0; FRAME_BYTES])));
        frame.0.as_mut_ptr()
    }

    /// Copy bytes out of simulated memory; the range must not cross a frame.
    pub fn read(&self, pa: PhysicalAddress, out: &mut [u8]) {
        let offset = Self::checked_offset(pa, out.len());
        let base = self.frame_ptr(pa);
        // SAFETY: `checked_offset` keeps the range inside one boxed frame.
        unsafe { core::ptr::copy_nonoverlapping(base.add(offset), out.as_mut_ptr(), out.len()) }
    }

    /// Copy bytes into simulated memory; the range must not cross a frame.
    pub fn write(&self, pa: PhysicalAddress, data: &[u8]) {
        let offset = Self::checked_offset(pa, data.len());
        let base = self.frame_ptr(pa);
        // SAFETY: `checked_offset` keeps the range inside one boxed frame.
        unsafe { core::ptr::copy_nonoverlapping(data.as_ptr(), base.add(offset), data.len()) }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn checked_offset(pa: PhysicalAddress, len: usize) -> usize {
        let offset = pa.page_offset() as usize;
        assert!(offset + len <= FRAME_BYTES, "access crosses a frame boundary");
        offset
    }
}

impl PhysMapper for SimulatedRam {
    #[allow(clippy::cast_possible_truncation)]
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let offset = Self::checked_offset(pa, size_of::<T>());
        debug_assert!(offset % align_of::<T>() == 0);
        let base = self.frame_ptr(pa);
        // SAFETY: the frame outlives every borrow handed out for it; callers
        // uphold the aliasing contract of `PhysMapper`.
        unsafe { &mut *base.add(offset).cast::<T>() }
    }
}
