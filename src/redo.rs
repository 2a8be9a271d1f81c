//! Redo-log operation context
//!
//! Block-state changes are not applied eagerly: the block layer
//! describes them as 64-bit redo entries (set a chunk header, OR/AND a
//! bitmap word) appended to a caller-supplied operation context, and the
//! redo engine above makes the whole batch atomic. The engine itself is
//! out of scope here; [`OperationContext`] is the seam it is consumed
//! through, and [`RedoBuffer`] is a minimal staging implementation that
//! applies entries in order, for embedders without a full redo log and
//! for the test suites.

use crate::persist::{atomic_load_u64, atomic_store_u64, PersistOps};

/// How a redo entry combines with the target word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedoOp {
    /// Replace the word.
    Set,
    /// OR the value into the word.
    Or,
    /// AND the word with the value.
    And,
}

/// Durability class of a redo entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// Recorded in the on-media redo log and replayed after a crash.
    Persistent,
    /// Applied at commit but never replayed from media. Used for state
    /// that is rebuilt on boot, like chunk footers; replaying it could
    /// overwrite a valid head written after the entry was recorded.
    Transient,
}

/// Sink for scheduled 64-bit persistent updates.
pub trait OperationContext {
    /// Append an entry with an explicit durability class.
    fn add_typed_entry(&mut self, addr: *mut u64, value: u64, op: RedoOp, kind: EntryKind);

    /// Append a persistent entry.
    fn add_entry(&mut self, addr: *mut u64, value: u64, op: RedoOp) {
        self.add_typed_entry(addr, value, op, EntryKind::Persistent);
    }
}

/// One scheduled update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedoEntry {
    pub addr: *mut u64,
    pub value: u64,
    pub op: RedoOp,
    pub kind: EntryKind,
}

/// In-memory staging buffer for redo entries.
///
/// `process` applies entries in append order with single relaxed 64-bit
/// stores, persists the persistent ones and drains once at the end,
/// which preserves the observable ordering of the direct (null-context)
/// path. It does not write an on-media log, so it provides atomicity of
/// each word but not of the batch; a crash mid-`process` leaves a prefix
/// applied.
#[derive(Debug, Default)]
pub struct RedoBuffer {
    entries: Vec<RedoEntry>,
}

impl RedoBuffer {
    pub fn new() -> Self {
        RedoBuffer {
            entries: Vec::new(),
        }
    }

    /// All staged entries, in append order.
    pub fn entries(&self) -> &[RedoEntry] {
        &self.entries
    }

    /// The entries a redo engine would record on media.
    pub fn persistent_entries(&self) -> impl Iterator<Item = &RedoEntry> {
        self.entries
            .iter()
            .filter(|e| e.kind == EntryKind::Persistent)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Apply every staged entry and clear the buffer.
    pub fn process(&mut self, p_ops: &dyn PersistOps) {
        for entry in &self.entries {
            unsafe {
                let value = match entry.op {
                    RedoOp::Set => entry.value,
                    RedoOp::Or => atomic_load_u64(entry.addr) | entry.value,
                    RedoOp::And => atomic_load_u64(entry.addr) & entry.value,
                };
                atomic_store_u64(entry.addr, value);
                if entry.kind == EntryKind::Persistent {
                    p_ops.persist(entry.addr.cast(), std::mem::size_of::<u64>());
                }
            }
        }
        p_ops.drain();
        self.entries.clear();
    }

    /// Drop every staged entry without applying it.
    pub fn cancel(&mut self) {
        self.entries.clear();
    }
}

impl OperationContext for RedoBuffer {
    fn add_typed_entry(&mut self, addr: *mut u64, value: u64, op: RedoOp, kind: EntryKind) {
        self.entries.push(RedoEntry {
            addr,
            value,
            op,
            kind,
        });
    }
}
