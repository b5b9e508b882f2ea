//! Recoverable errors and the fatal bug-check path.

use crate::bootstrap::LayoutError;
use crate::swap::PageFileError;
use core::fmt;
use kernel_memory_addresses::VirtualAddress;
use kernel_vmem::WalkError;
use log::error;

/// Errors reported to callers of the memory manager.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MmError {
    /// No frame could be provided, even after rebalancing.
    #[error("out of physical memory")]
    OutOfMemory,
    /// A present mapping already exists at the address.
    #[error("a mapping already exists at {0}")]
    MappingConflict(VirtualAddress),
    /// The access is not permitted by the area or page protection.
    #[error("access violation at {0}")]
    AccessViolation(VirtualAddress),
    /// Reading the page back from its paging file failed persistently.
    #[error("in-page error at {0}")]
    InPageError(VirtualAddress),
    /// Address outside the range the operation applies to, or unaligned.
    #[error("invalid address {0}")]
    InvalidAddress(VirtualAddress),
    /// Zero-length request or a length that overflows the address space.
    #[error("invalid length {0:#x}")]
    InvalidLength(u64),
    /// No gap large enough for the requested area.
    #[error("no free virtual range of {0:#x} bytes")]
    NoVirtualSpace(u64),
    /// The requested range overlaps an existing area.
    #[error("range at {0} overlaps an existing area")]
    AreaConflict(VirtualAddress),
    /// The address space id does not name a live address space.
    #[error("unknown address space")]
    UnknownAddressSpace,
    /// No registered paging file has a free slot.
    #[error("paging files exhausted")]
    PagingFileFull,
    /// Paging file registration or I/O failed.
    #[error(transparent)]
    PageFile(#[from] PageFileError),
    /// Boot-time layout computation failed.
    #[error(transparent)]
    Layout(#[from] LayoutError),
}

impl From<WalkError> for MmError {
    fn from(value: WalkError) -> Self {
        match value {
            WalkError::OutOfMemory(_) => Self::OutOfMemory,
            WalkError::LargePage(_) => Self::MappingConflict(VirtualAddress::zero()),
            WalkError::NonCanonical(va) => Self::InvalidAddress(va),
        }
    }
}

/// Fatal conditions. The memory manager cannot continue after any of them.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BugCheckCode {
    /// A page list's links disagree with its cached total.
    PfnListCorrupt,
    /// Internal bookkeeping disagrees with itself.
    MemoryManagementInvalid,
    /// The boot scratch descriptor ran out of pages.
    InstallMoreMemory,
    /// A must-succeed allocation found no page.
    NoPagesAvailable,
    /// Reference count underflow (double free).
    PfnReferenceCount,
    /// Frame number outside every managed range.
    FrameOutOfRange,
}

impl BugCheckCode {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::PfnListCorrupt => "PFN_LIST_CORRUPT",
            Self::MemoryManagementInvalid => "MEMORY_MANAGEMENT",
            Self::InstallMoreMemory => "INSTALL_MORE_MEMORY",
            Self::NoPagesAvailable => "NO_PAGES_AVAILABLE",
            Self::PfnReferenceCount => "PFN_REFERENCE_COUNT",
            Self::FrameOutOfRange => "PAGE_FRAME_OUT_OF_RANGE",
        }
    }
}

impl fmt::Display for BugCheckCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Stop the system.
///
/// Logs the code with its four parameters, then panics with the code name so
/// the panic handler (or a test harness) sees which invariant broke.
#[cold]
#[inline(never)]
#[track_caller]
pub fn bug_check(code: BugCheckCode, parameters: [u64; 4]) -> ! {
    error!(
        "*** STOP: {code} ({:#x}, {:#x}, {:#x}, {:#x})",
        parameters[0], parameters[1], parameters[2], parameters[3]
    );
    panic!("bug check {code}: {parameters:x?}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "bug check PFN_REFERENCE_COUNT")]
    fn bug_check_panics_with_code_name() {
        bug_check(BugCheckCode::PfnReferenceCount, [1, 2, 3, 4]);
    }

    #[test]
    fn walk_errors_map_to_mm_errors() {
        let va = VirtualAddress::new(0x0000_8000_0000_0000);
        assert_eq!(
            MmError::from(WalkError::OutOfMemory(kernel_vmem::TableLevel::Pd)),
            MmError::OutOfMemory
        );
        assert_eq!(
            MmError::from(WalkError::NonCanonical(va)),
            MmError::InvalidAddress(va)
        );
    }
}
