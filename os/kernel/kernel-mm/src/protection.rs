//! Page protection and its PTE encoding.

use kernel_memory_addresses::PhysicalAddress;
use kernel_vmem::PageTableEntry;

/// Kind of memory access, as reported by a fault or requested by a caller.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AccessKind {
    Read,
    Write,
    Execute,
}

/// Access rights of a page.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Access {
    NoAccess,
    ReadOnly,
    ReadWrite,
    /// Readable; the first write gives the space a private copy.
    WriteCopy,
    Execute,
    ExecuteRead,
    ExecuteReadWrite,
    ExecuteWriteCopy,
}

/// Memory type of a page.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Hash)]
pub enum CacheMode {
    #[default]
    WriteBack,
    WriteThrough,
    Uncached,
    /// Requires PAT; without it this degrades to uncached-minus.
    WriteCombined,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct Protection {
    pub access: Access,
    pub cache: CacheMode,
}

impl Protection {
    pub const NO_ACCESS: Self = Self::new(Access::NoAccess);
    pub const READ_ONLY: Self = Self::new(Access::ReadOnly);
    pub const READ_WRITE: Self = Self::new(Access::ReadWrite);
    pub const WRITE_COPY: Self = Self::new(Access::WriteCopy);
    pub const EXECUTE_READ: Self = Self::new(Access::ExecuteRead);
    pub const EXECUTE_READ_WRITE: Self = Self::new(Access::ExecuteReadWrite);

    #[must_use]
    pub const fn new(access: Access) -> Self {
        Self {
            access,
            cache: CacheMode::WriteBack,
        }
    }

    #[must_use]
    pub const fn with_cache(self, cache: CacheMode) -> Self {
        Self { cache, ..self }
    }

    #[must_use]
    pub const fn is_readable(self) -> bool {
        !matches!(self.access, Access::NoAccess | Access::Execute)
    }

    /// Writes succeed without a fault (write-copy pages are not writable).
    #[must_use]
    pub const fn is_writable(self) -> bool {
        matches!(self.access, Access::ReadWrite | Access::ExecuteReadWrite)
    }

    #[must_use]
    pub const fn is_copy_on_write(self) -> bool {
        matches!(self.access, Access::WriteCopy | Access::ExecuteWriteCopy)
    }

    #[must_use]
    pub const fn is_executable(self) -> bool {
        matches!(
            self.access,
            Access::Execute | Access::ExecuteRead | Access::ExecuteReadWrite | Access::ExecuteWriteCopy
        )
    }

    /// Whether an access of `kind` is permitted, counting a write to a
    /// write-copy page as permitted (it is resolved by copying).
    #[must_use]
    pub const fn allows(self, kind: AccessKind) -> bool {
        match kind {
            AccessKind::Read => self.is_readable() || self.is_executable(),
            AccessKind::Write => self.is_writable() || self.is_copy_on_write(),
            AccessKind::Execute => self.is_executable(),
        }
    }

    /// Protection after a copy-on-write fault gave the page a private copy.
    #[must_use]
    pub const fn after_copy(self) -> Self {
        let access = match self.access {
            Access::WriteCopy => Access::ReadWrite,
            Access::ExecuteWriteCopy => Access::ExecuteReadWrite,
            other => other,
        };
        Self { access, ..self }
    }

    /// Leaf entry mapping `frame` with this protection.
    ///
    /// No-access pages produce a disabled (not present) entry that still
    /// records the frame.
    #[must_use]
    pub fn to_entry(self, frame: PhysicalAddress, user: bool) -> PageTableEntry {
        let (write_through, cache_disabled) = match self.cache {
            CacheMode::WriteBack => (false, false),
            CacheMode::WriteThrough => (true, false),
            CacheMode::Uncached => (true, true),
            CacheMode::WriteCombined => (false, true),
        };
        let entry = PageTableEntry::new_leaf(frame)
            .with_writable(self.is_writable())
            .with_user_access(user)
            .with_global_translation(!user)
            .with_copy_on_write(self.is_copy_on_write())
            .with_no_execute(!self.is_executable())
            .with_write_through(write_through)
            .with_cache_disabled(cache_disabled);
        if matches!(self.access, Access::NoAccess) {
            entry.with_present(false).with_disabled(true)
        } else {
            entry
        }
    }

    /// Decode the protection of a present or disabled leaf.
    #[must_use]
    pub fn from_entry(entry: &PageTableEntry) -> Self {
        let cache = match (entry.write_through(), entry.cache_disabled()) {
            (false, false) => CacheMode::WriteBack,
            (true, false) => CacheMode::WriteThrough,
            (true, true) => CacheMode::Uncached,
            (false, true) => CacheMode::WriteCombined,
        };
        let exec = !entry.no_execute();
        let access = if !entry.present() {
            Access::NoAccess
        } else {
            match (entry.writable(), entry.copy_on_write(), exec) {
                (true, _, false) => Access::ReadWrite,
                (true, _, true) => Access::ExecuteReadWrite,
                (false, true, false) => Access::WriteCopy,
                (false, true, true) => Access::ExecuteWriteCopy,
                (false, false, false) => Access::ReadOnly,
                (false, false, true) => Access::ExecuteRead,
            }
        };
        Self { access, cache }
    }

    /// Cache attribute as stored in the frame's flags.
    #[must_use]
    pub const fn cache_attribute(self) -> u8 {
        match self.cache {
            CacheMode::WriteBack | CacheMode::WriteThrough => 0,
            CacheMode::Uncached => 1,
            CacheMode::WriteCombined => 2,
        }
    }
}
