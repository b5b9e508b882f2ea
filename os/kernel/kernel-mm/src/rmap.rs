//! # Reverse mappings
//!
//! For every frame the memory manager remembers which (address space,
//! virtual address) pairs map it. The chains are singly linked through a
//! pooled arena of fixed-size nodes owned by the frame database. The arena
//! only grows through [`RmapArena::adopt`], with storage the caller allocated
//! before taking the frame lock, so linking and unlinking never allocate.

use crate::space::AddressSpaceId;
use alloc::vec::Vec;
use kernel_memory_addresses::VirtualAddress;

/// Index of a node in the arena.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct RmapIndex(u32);

/// Arena storage cell.
#[derive(Debug, Copy, Clone)]
pub struct RmapNode {
    next: Option<RmapIndex>,
    space: AddressSpaceId,
    address: VirtualAddress,
}

/// One reverse mapping.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Mapper {
    pub space: AddressSpaceId,
    pub address: VirtualAddress,
}

/// Pool of rmap nodes with an intrusive free list.
#[derive(Debug, Default)]
pub struct RmapArena {
    nodes: Vec<RmapNode>,
    free: Option<RmapIndex>,
    live: usize,
}

impl RmapArena {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free: None,
            live: 0,
        }
    }

    /// Nodes currently linked into some chain.
    #[must_use]
    pub const fn live(&self) -> usize {
        self.live
    }

    /// Nodes that can be handed out without growing.
    #[must_use]
    pub fn spare(&self) -> usize {
        self.nodes.capacity() - self.live
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.nodes.capacity()
    }

    pub(crate) fn reserve(&mut self, additional: usize) {
        self.nodes.reserve(additional);
    }

    /// Continue in `storage` if it holds more nodes than the current
    /// storage; returns whichever of the two is no longer used.
    pub(crate) fn adopt(&mut self, mut storage: Vec<RmapNode>) -> Vec<RmapNode> {
        if storage.capacity() <= self.nodes.capacity() {
            return storage;
        }
        storage.clear();
        storage.extend_from_slice(&self.nodes);
        core::mem::replace(&mut self.nodes, storage)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn alloc(&mut self, node: RmapNode) -> RmapIndex {
        self.live += 1;
        if let Some(index) = self.free {
            let slot = &mut self.nodes[index.0 as usize];
            self.free = slot.next;
            *slot = node;
            index
        } else {
            // Growing here would allocate; callers reserve ahead.
            debug_assert!(self.nodes.len() < self.nodes.capacity());
            self.nodes.push(node);
            RmapIndex((self.nodes.len() - 1) as u32)
        }
    }

    fn release(&mut self, index: RmapIndex) {
        self.live -= 1;
        self.nodes[index.0 as usize].next = self.free;
        self.free = Some(index);
    }

    /// Prepend a mapping to the chain starting at `head`; returns the new head.
    pub(crate) fn insert(
        &mut self,
        head: Option<RmapIndex>,
        space: AddressSpaceId,
        address: VirtualAddress,
    ) -> RmapIndex {
        self.alloc(RmapNode {
            next: head,
            space,
            address,
        })
    }

    /// Remove the first node matching (space, address). Returns the new head
    /// and whether a node was found.
    pub(crate) fn remove(
        &mut self,
        head: Option<RmapIndex>,
        space: AddressSpaceId,
        address: VirtualAddress,
    ) -> (Option<RmapIndex>, bool) {
        let mut prev: Option<RmapIndex> = None;
        let mut cursor = head;
        while let Some(index) = cursor {
            let node = self.nodes[index.0 as usize];
            if node.space == space && node.address == address {
                let new_head = match prev {
                    Some(p) => {
                        self.nodes[p.0 as usize].next = node.next;
                        head
                    }
                    None => node.next,
                };
                self.release(index);
                return (new_head, true);
            }
            prev = cursor;
            cursor = node.next;
        }
        (head, false)
    }

    /// Release every node of a chain.
    pub(crate) fn clear(&mut self, head: Option<RmapIndex>) -> usize {
        let mut cursor = head;
        let mut released = 0;
        while let Some(index) = cursor {
            cursor = self.nodes[index.0 as usize].next;
            self.release(index);
            released += 1;
        }
        released
    }

    pub(crate) fn iter(&self, head: Option<RmapIndex>) -> impl Iterator<Item = Mapper> + '_ {
        let mut cursor = head;
        core::iter::from_fn(move || {
            let node = self.nodes[cursor?.0 as usize];
            cursor = node.next;
            Some(Mapper {
                space: node.space,
                address: node.address,
            })
        })
    }
}
