use super::{Pfn, PfnEntry, PfnStorage};
use crate::error::{BugCheckCode, bug_check};

/// Circular doubly-linked list of frames threaded through their entries.
///
/// Only the head is stored; the tail is the head's back link. Insertion at
/// the tail and removal anywhere are O(1).
#[derive(Debug, Default)]
pub struct PageList {
    head: Option<Pfn>,
    total: usize,
}

/// Entry access for frames already linked into (or about to join) a list.
#[inline]
fn node(storage: &mut PfnStorage, pfn: Pfn) -> &mut PfnEntry {
    // SAFETY: only validated, initialized frames are ever linked.
    unsafe { storage.get_mut(pfn) }
}

#[inline]
fn node_ref(storage: &PfnStorage, pfn: Pfn) -> &PfnEntry {
    // SAFETY: see `node`.
    unsafe { storage.get(pfn) }
}

#[cold]
fn corrupt(pfn: Option<Pfn>, total: usize, detail: u64) -> ! {
    bug_check(
        BugCheckCode::PfnListCorrupt,
        [pfn.map_or(u64::MAX, Pfn::number), total as u64, detail, 0],
    )
}

impl PageList {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            head: None,
            total: 0,
        }
    }

    #[inline]
    #[must_use]
    pub const fn total(&self) -> usize {
        self.total
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.total == 0
    }

    #[inline]
    #[must_use]
    pub const fn head(&self) -> Option<Pfn> {
        self.head
    }

    #[must_use]
    pub fn tail(&self, storage: &PfnStorage) -> Option<Pfn> {
        self.head.and_then(|head| node_ref(storage, head).blink)
    }

    /// Append `pfn`, then run the mutation checks.
    pub(crate) fn push_back(&mut self, storage: &mut PfnStorage, pfn: Pfn) {
        self.link_back(storage, pfn);
        self.after_mutation(storage);
    }

    /// Append without the per-mutation walk; bulk initialization verifies
    /// once at the end.
    pub(crate) fn push_back_unchecked(&mut self, storage: &mut PfnStorage, pfn: Pfn) {
        self.link_back(storage, pfn);
    }

    fn link_back(&mut self, storage: &mut PfnStorage, pfn: Pfn) {
        let entry = node(storage, pfn);
        if entry.flink.is_some() || entry.blink.is_some() {
            corrupt(Some(pfn), self.total, 1);
        }
        match self.head {
            None => {
                entry.flink = Some(pfn);
                entry.blink = Some(pfn);
                self.head = Some(pfn);
            }
            Some(head) => {
                let Some(tail) = node_ref(storage, head).blink else {
                    corrupt(Some(head), self.total, 2);
                };
                let entry = node(storage, pfn);
                entry.flink = Some(head);
                entry.blink = Some(tail);
                node(storage, tail).flink = Some(pfn);
                node(storage, head).blink = Some(pfn);
            }
        }
        self.total += 1;
    }

    /// Unlink `pfn`, which the caller knows to be on this list.
    pub(crate) fn remove(&mut self, storage: &mut PfnStorage, pfn: Pfn) {
        let entry = node(storage, pfn);
        let (Some(next), Some(prev)) = (entry.flink, entry.blink) else {
            corrupt(Some(pfn), self.total, 3);
        };
        entry.flink = None;
        entry.blink = None;
        if self.total == 0 {
            corrupt(Some(pfn), self.total, 4);
        }
        if next == pfn {
            if self.head != Some(pfn) || self.total != 1 {
                corrupt(Some(pfn), self.total, 5);
            }
            self.head = None;
        } else {
            node(storage, prev).flink = Some(next);
            node(storage, next).blink = Some(prev);
            if self.head == Some(pfn) {
                self.head = Some(next);
            }
        }
        self.total -= 1;
        self.after_mutation(storage);
    }

    /// Frames from head to tail.
    pub fn iter<'a>(&self, storage: &'a PfnStorage) -> impl Iterator<Item = Pfn> + 'a {
        let mut cursor = self.head;
        let mut remaining = self.total;
        core::iter::from_fn(move || {
            if remaining == 0 {
                return None;
            }
            let current = cursor?;
            remaining -= 1;
            cursor = node_ref(storage, current).flink;
            Some(current)
        })
    }

    fn after_mutation(&self, storage: &PfnStorage) {
        self.check_ends(storage);
        #[cfg(debug_assertions)]
        self.verify(storage);
    }

    /// Head and tail agree with the cached total.
    fn check_ends(&self, storage: &PfnStorage) {
        match self.head {
            None if self.total == 0 => {}
            Some(head) if self.total > 0 => {
                let Some(tail) = node_ref(storage, head).blink else {
                    corrupt(Some(head), self.total, 6);
                };
                if node_ref(storage, tail).flink != Some(head) {
                    corrupt(Some(tail), self.total, 7);
                }
            }
            head => corrupt(head, self.total, 8),
        }
    }

    /// Walk the whole ring: every back link mirrors its forward link and the
    /// ring closes after exactly `total` frames.
    pub(crate) fn verify(&self, storage: &PfnStorage) {
        self.check_ends(storage);
        let Some(head) = self.head else {
            return;
        };
        let mut current = head;
        for _ in 0..self.total {
            let Some(next) = node_ref(storage, current).flink else {
                corrupt(Some(current), self.total, 9);
            };
            if node_ref(storage, next).blink != Some(current) {
                corrupt(Some(next), self.total, 10);
            }
            current = next;
        }
        if current != head {
            corrupt(Some(current), self.total, 11);
        }
    }
}
