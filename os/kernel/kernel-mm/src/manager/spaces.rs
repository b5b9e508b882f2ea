use super::MemoryManager;
use crate::area::PageDisposition;
use crate::balancer::MemoryConsumer;
use crate::error::MmError;
use crate::pfn::PageUsage;
use crate::space::{AddressSpace, AddressSpaceId, SpaceKind};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::Ordering;
use kernel_vmem::PhysMapper;
use log::{debug, info};

impl<M: PhysMapper> MemoryManager<M> {
    /// Create a process address space sharing the kernel half.
    ///
    /// # Errors
    /// [`MmError::OutOfMemory`] if no frame is left for the new root.
    pub fn create_address_space(&self) -> Result<Arc<AddressSpace>, MmError> {
        let root = self.allocate_frame(MemoryConsumer::System, PageUsage::PageTable, true)?;
        let kernel_root = self.kernel.lock().root;
        self.walker(root.physical_address()).copy_kernel_half(kernel_root);

        let id = AddressSpaceId::new(self.next_space_id.fetch_add(1, Ordering::Relaxed));
        let space = Arc::new(AddressSpace::new(id, SpaceKind::Process, root.physical_address()));
        self.spaces.lock().insert(id, Arc::clone(&space));
        info!("{id}: created, root {root}");
        Ok(space)
    }

    /// Tear down every area and user page table, leaving an empty space
    /// that can be reused.
    ///
    /// Pages are discarded; swap slots are released.
    pub fn clean_address_space(&self, space: &AddressSpace) {
        let mut state = space.lock();
        let starts: Vec<_> = state
            .areas
            .iter()
            .filter(|a| !a.flags().is_static())
            .map(|a| a.start())
            .collect();
        let mut pages = 0;
        for start in starts {
            if let Ok(freed) = self.free_area_locked(space.id(), &mut state, start, &mut |_| PageDisposition::Discard) {
                pages += freed.released;
            }
        }
        if space.kind() == SpaceKind::Process {
            let mut walker = self.walker(state.root);
            let tables = walker.free_user_tables(|table| {
                let mut db = self.frames();
                if let Some(pfn) = db.pfn(table.frame_number()) {
                    db.dereference(pfn);
                }
            });
            debug!("{}: {tables} page tables released", space.id());
        }
        debug!("{}: cleaned, {pages} pages released", space.id());
    }

    /// Destroy a process address space.
    ///
    /// # Errors
    /// [`MmError::UnknownAddressSpace`] for the kernel space or a space that
    /// was already deleted.
    pub fn delete_address_space(&self, space: &AddressSpace) -> Result<(), MmError> {
        if space.kind() == SpaceKind::Kernel || self.spaces.lock().remove(&space.id()).is_none() {
            return Err(MmError::UnknownAddressSpace);
        }
        self.clean_address_space(space);
        let mut state = space.lock();
        let mut db = self.frames();
        if let Some(root) = db.pfn(state.root.frame_number()) {
            db.dereference(root);
        }
        state.deleted = true;
        info!("{}: deleted", space.id());
        Ok(())
    }
}
