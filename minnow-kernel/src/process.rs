//! Process descriptors.

use crate::regs::Registers;
use minnow_vmem::PhysAddr;

/// Process identifier: the index of the descriptor slot, `1..NPROC`.
/// Slot 0 is a sentinel that stays [`State::Free`] forever.
pub type Pid = usize;

/// Lifecycle state of a descriptor slot.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum State {
    /// Unused; owns no page table and no frame references.
    #[default]
    Free,
    /// Ready to run; picked round-robin by the scheduler.
    Runnable,
    /// Stopped after a user-mode page fault; never scheduled again.
    Faulted,
    /// Mid-assembly by fork. Either promoted to [`State::Runnable`] or torn
    /// back down to [`State::Free`]; never scheduled.
    Broken,
}

/// One process-descriptor slot.
#[derive(Copy, Clone, Debug)]
pub struct Process {
    pub pid: Pid,
    pub state: State,
    /// Register state saved on every kernel entry, restored on resume.
    pub regs: Registers,
    /// Root frame of the process's page-table tree; `None` exactly while
    /// the slot is [`State::Free`].
    pub page_table: Option<PhysAddr>,
}

impl Process {
    /// A fresh, empty slot.
    #[must_use]
    pub const fn free_slot(pid: Pid) -> Self {
        Self {
            pid,
            state: State::Free,
            regs: Registers::ZERO,
            page_table: None,
        }
    }
}
