// Licensed under the Apache License, Version 2.0 <http://www.apache.org/licenses/LICENSE-2.0> or
// the MIT license <http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Per-thread engine state.
//!
//! Mangled code addresses the current thread's engine state through a
//! dedicated segment: a handful of fixed spill slots, then a pointer to the
//! thread's context record. The record starts with the saved machine
//! context (the register file in canonical order, then flags, then pc),
//! followed by the engine stack pointer, the where-am-i field and the rseq
//! entry-state checkpoint area. Everything here is offsets and addresses;
//! the record itself lives with the thread bookkeeping outside this crate.

use crate::insn::{BranchType, MemRef, Segment, GPR_COUNT, RAX, RBP, RBX, RCX, RDI, RDX, RSI, RSP};

/// Segment register reserved for engine thread-local storage.
pub const ENGINE_SEG: Segment = Segment::Gs;
/// Segment register carrying the application's own TLS.
pub const APP_SEG: Segment = Segment::Fs;

/// Fixed slots at the base of the engine segment.
///
/// The first slots are register spill space for mangled sequences that need
/// a scratch register while the full context is still live; the last holds
/// the address of the thread's context record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TlsSlot {
    /// General spill slot, also the clean-call scratch save.
    Reg0 = 0,
    /// Second spill slot, used by the rseq native replay.
    Reg1 = 1,
    /// Third spill slot, used by segment-reference rewriting.
    Reg2 = 2,
    /// Indirect-branch target holding slot read by the lookup routines.
    BranchTarget = 3,
    /// Base address of the application's library TLS segment.
    AppSegBase = 4,
    /// Address of the thread's context record.
    Context = 5,
}

impl TlsSlot {
    /// Displacement of this slot from the engine segment base.
    pub const fn offset(self) -> i32 {
        (self as i32) * 8
    }

    /// Memory operand addressing this slot.
    pub const fn mem(self) -> MemRef {
        MemRef::seg_disp(ENGINE_SEG, self.offset())
    }
}

/// Saved general-purpose register order inside the machine context record.
pub const MCTX_REG_ORDER: [u8; GPR_COUNT] = [
    RDI, RSI, RBP, RSP, RBX, RDX, RCX, RAX, 8, 9, 10, 11, 12, 13, 14, 15,
];

/// Byte offset of `reg`'s save slot within the machine context.
pub fn mctx_reg_offset(reg: u8) -> i32 {
    let mut index = 0;
    while index < GPR_COUNT {
        if MCTX_REG_ORDER[index] == reg {
            return (index as i32) * 8;
        }
        index += 1;
    }
    unreachable!("register {} has no machine context slot", reg)
}

/// Byte offset of the saved flags word within the machine context.
pub const MCTX_FLAGS_OFFSET: i32 = (GPR_COUNT as i32) * 8;
/// Byte offset of the lazily-filled program counter slot.
pub const MCTX_PC_OFFSET: i32 = MCTX_FLAGS_OFFSET + 8;
/// Total size of the machine context record.
pub const MCTX_SIZE: i32 = MCTX_PC_OFFSET + 8;

/// Offset of the machine context within the thread context record.
pub const CTX_MCTX_OFFSET: i32 = 0;
/// Offset of the engine stack top pointer.
pub const CTX_DSTACK_OFFSET: i32 = MCTX_SIZE;
/// Offset of the where-am-i field (stored as a 32-bit value).
pub const CTX_WHEREAMI_OFFSET: i32 = CTX_DSTACK_OFFSET + 8;
/// Offset of the rseq entry-state checkpoint area, one slot per register.
pub const CTX_RSEQ_ENTRY_STATE_OFFSET: i32 = CTX_WHEREAMI_OFFSET + 8;

/// Checkpoint slot for `reg` relative to the context record base.
pub fn rseq_entry_slot(reg: u8) -> i32 {
    CTX_RSEQ_ENTRY_STATE_OFFSET + (reg as i32) * 8
}

/// Execution mode recorded in the thread context around injected calls.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WhereAmI {
    /// Not yet established for this thread.
    Unknown = 0,
    /// Executing translated application code.
    App = 1,
    /// Inside the engine dispatch loop.
    Dispatch = 2,
    /// Inside an instrumentation callee invoked by a clean call.
    CleanCallee = 3,
}

impl WhereAmI {
    /// Immediate form stored by mangled code.
    pub const fn as_imm(self) -> i64 {
        self as i64
    }
}

/// Entry points of the indirect-branch lookup routines, one per branch
/// type, with separate tables for basic-block and trace fragments.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IblRoutines {
    /// Routines linked from basic-block fragments.
    pub bb: [u64; 3],
    /// Routines linked from trace fragments.
    pub trace: [u64; 3],
}

fn ibl_index(branch: BranchType) -> usize {
    match branch {
        BranchType::Return => 0,
        BranchType::IndirectCall => 1,
        BranchType::IndirectJump => 2,
        BranchType::DirectJump | BranchType::DirectCall => {
            unreachable!("direct transfers are linked, not looked up")
        }
    }
}

impl IblRoutines {
    /// Lookup routine entry for `branch` from a fragment of the given kind.
    pub fn entry(&self, branch: BranchType, is_trace: bool) -> u64 {
        let table = if is_trace { &self.trace } else { &self.bb };
        table[ibl_index(branch)]
    }
}

/// Per-thread engine state handed by reference into every mangling entry
/// point.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ThreadContext {
    /// Indirect-branch lookup routine entry points.
    pub ibl_routines: IblRoutines,
    /// Shared out-of-line context-save routine, for descriptors that
    /// request the out-of-line switch.
    pub context_save_routine: u64,
    /// Shared out-of-line context-restore routine.
    pub context_restore_routine: u64,
    /// Offset of the `rseq_cs` field of the kernel rseq record from the
    /// application segment base. Signed: the registration commonly sits
    /// below the thread pointer.
    pub rseq_cs_offset: i32,
    /// Application name used in fatal diagnostics.
    pub app_name: String,
}

impl Default for ThreadContext {
    fn default() -> Self {
        Self {
            ibl_routines: IblRoutines::default(),
            context_save_routine: 0,
            context_restore_routine: 0,
            rseq_cs_offset: 0,
            app_name: String::new(),
        }
    }
}
