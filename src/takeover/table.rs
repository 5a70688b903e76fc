//! Per-thread attach state, keyed by thread id.
//!
//! A slot has two shapes: the reserved sentinel, meaning "this tid is
//! claimed but the set-context that makes the record meaningful has not
//! succeeded yet", and the full record. Concurrent enumerators skip
//! sentinels without allocating; a record only becomes observable after
//! the context write landed.

use crate::nt::Handle;
use crate::registers::Context64;
use crate::sync::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// One memory word rewritten during attach: where, and what it held.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SavedWord {
    pub addr: usize,
    pub original: u32,
}

/// Everything needed to revert one in-flight attachment.
pub struct TakeoverRecord {
    pub tid: u32,
    /// The original instruction pointer the trampoline will continue to,
    /// and that revert restores. Always outside the runtime image.
    pub continuation_pc: usize,
    /// Set by the thread itself on trampoline entry; from then on the
    /// record is the thread's own and revert keeps its hands off.
    pub in_progress: AtomicBool,
    /// Rewritten stack word, if the attach went through the emulation
    /// layer's stack slot.
    pub saved_stack_word: Option<SavedWord>,
    /// Rewritten `[r14]` word, same deal.
    pub saved_r14_word: Option<SavedWord>,
    /// Duplicated handle, kept alive until revert or completion.
    pub thread_handle: Handle,
    /// The full wide register file captured when the thread was suspended
    /// inside the emulation-layer transition.
    pub x64_context: Option<Box<Context64>>,
}

enum Slot {
    /// Reserved-without-record sentinel.
    Reserved,
    Active(Box<TakeoverRecord>),
}

pub struct TakeoverTable {
    slots: RwLock<HashMap<u32, Slot>>,
}

lazy_static! {
    static ref GLOBAL_TABLE: TakeoverTable = TakeoverTable::new();
}

impl TakeoverTable {
    pub fn new() -> TakeoverTable {
        TakeoverTable {
            slots: RwLock::new(HashMap::new()),
        }
    }

    /// The process-wide table.
    pub fn global() -> &'static TakeoverTable {
        &*GLOBAL_TABLE
    }

    /// Claim `tid` with the sentinel. False if any slot already exists.
    pub fn reserve(&self, tid: u32) -> bool {
        let mut slots = self.slots.write();
        if slots.contains_key(&tid) {
            return false;
        }
        slots.insert(tid, Slot::Reserved);
        true
    }

    /// Drop a sentinel claim that never became a record.
    pub fn unreserve(&self, tid: u32) {
        let mut slots = self.slots.write();
        if let Some(Slot::Reserved) = slots.get(&tid) {
            slots.remove(&tid);
        }
    }

    /// Upgrade the sentinel to the real record. The caller must have
    /// reserved `tid` and have seen its set-context succeed.
    pub fn install(&self, record: Box<TakeoverRecord>) {
        debug_assert!(!crate::is_in_runtime_image(record.continuation_pc));
        let mut slots = self.slots.write();
        slots.insert(record.tid, Slot::Active(record));
    }

    pub fn contains(&self, tid: u32) -> bool {
        self.slots.read().contains_key(&tid)
    }

    pub fn is_active(&self, tid: u32) -> bool {
        match self.slots.read().get(&tid) {
            Some(Slot::Active(_)) => true,
            _ => false,
        }
    }

    /// The trampoline's self-lookup: flip the record to in-progress.
    /// False when there is no record or someone beat us to it, which
    /// makes a second concurrent attach of the same thread a no-op.
    pub fn mark_in_progress(&self, tid: u32) -> bool {
        let slots = self.slots.read();
        match slots.get(&tid) {
            Some(Slot::Active(record)) => !record.in_progress.swap(true, Ordering::AcqRel),
            _ => false,
        }
    }

    pub fn is_in_progress(&self, tid: u32) -> bool {
        let slots = self.slots.read();
        match slots.get(&tid) {
            Some(Slot::Active(record)) => record.in_progress.load(Ordering::Acquire),
            _ => false,
        }
    }

    /// Read access to an active record.
    pub fn with_record<R>(&self, tid: u32, f: impl FnOnce(&TakeoverRecord) -> R) -> Option<R> {
        let slots = self.slots.read();
        match slots.get(&tid) {
            Some(Slot::Active(record)) => Some(f(record)),
            _ => None,
        }
    }

    /// Remove and return the record (or clear a sentinel).
    pub fn remove(&self, tid: u32) -> Option<Box<TakeoverRecord>> {
        let mut slots = self.slots.write();
        match slots.remove(&tid) {
            Some(Slot::Active(record)) => Some(record),
            _ => None,
        }
    }

    /// Tids with full records; sentinels are skipped.
    pub fn active_tids(&self) -> Vec<u32> {
        let slots = self.slots.read();
        let mut tids: Vec<u32> = slots
            .iter()
            .filter_map(|(tid, slot)| match slot {
                Slot::Active(_) => Some(*tid),
                Slot::Reserved => None,
            })
            .collect();
        tids.sort_unstable();
        tids
    }

    pub fn active_len(&self) -> usize {
        self.active_tids().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(tid: u32, pc: usize) -> Box<TakeoverRecord> {
        Box::new(TakeoverRecord {
            tid,
            continuation_pc: pc,
            in_progress: AtomicBool::new(false),
            saved_stack_word: None,
            saved_r14_word: None,
            thread_handle: Handle(0x44),
            x64_context: None,
        })
    }

    #[test]
    fn reserve_is_exclusive() {
        let table = TakeoverTable::new();
        assert!(table.reserve(7));
        assert!(!table.reserve(7));
        assert!(table.contains(7));
        assert!(!table.is_active(7), "sentinel is not a record");
        table.unreserve(7);
        assert!(!table.contains(7));
    }

    #[test]
    fn sentinels_are_invisible_to_enumeration() {
        let table = TakeoverTable::new();
        table.reserve(3);
        table.install(record(4, 0x40_1000));
        assert_eq!(table.active_tids(), vec![4]);
        assert_eq!(table.active_len(), 1);
    }

    #[test]
    fn in_progress_flips_exactly_once() {
        let table = TakeoverTable::new();
        table.install(record(9, 0x40_2000));
        assert!(!table.is_in_progress(9));
        assert!(table.mark_in_progress(9));
        // A second concurrent attach becomes a no-op.
        assert!(!table.mark_in_progress(9));
        assert!(table.is_in_progress(9));
        assert!(!table.mark_in_progress(10), "absent tid");
    }

    #[test]
    fn remove_returns_the_record() {
        let table = TakeoverTable::new();
        table.install(record(5, 0x40_3000));
        let r = table.remove(5).unwrap();
        assert_eq!(r.tid, 5);
        assert_eq!(r.continuation_pc, 0x40_3000);
        assert!(table.remove(5).is_none());
        assert!(table.is_empty());
    }
}
