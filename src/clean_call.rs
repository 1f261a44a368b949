// Licensed under the Apache License, Version 2.0 <http://www.apache.org/licenses/LICENSE-2.0> or
// the MIT license <http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Clean-call context switch.
//!
//! Instrumentation callees run on a dedicated engine stack with the full
//! application register file and flags saved in a frame laid out exactly
//! like the machine context record: registers in canonical order, then the
//! flags word, then a lazily-filled program counter slot. [`prepare_clean_call`]
//! emits the switch and save, [`insert_call`] materializes arguments and the
//! call itself, [`cleanup_clean_call`] restores and switches back. Only the
//! scratch register and the stack pointer are touched outside the frame.
//!
//! Floating-point and vector state is never saved here; callees that need
//! it save it explicitly.

use crate::{
    context::{
        mctx_reg_offset, ThreadContext, TlsSlot, WhereAmI, CTX_DSTACK_OFFSET, CTX_WHEREAMI_OFFSET,
        MCTX_REG_ORDER, MCTX_SIZE,
    },
    error::MangleError,
    ilist::{InsnRef, InstructionList},
    insn::{Instruction, MemRef, Operand, OperandSize, RAX, REG_CALL_SCRATCH, RSP},
};
use log::trace;

/// Argument registers of the System V AMD64 calling convention, in
/// assignment order.
pub const ARGUMENT_REGISTERS: [u8; 6] = [
    crate::insn::RDI,
    crate::insn::RSI,
    crate::insn::RDX,
    crate::insn::RCX,
    8, // R8
    9, // R9
];

/// Reserved slots pushed above the register file: the program counter slot
/// and the flags word.
pub const NUM_EXTRA_SLOTS: usize = 2;

/// Per-call-site configuration for the context switch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CleanCallDescriptor {
    /// Bitmap of general-purpose registers to save; the full file by
    /// default, reducible when the callee's register usage is known.
    pub save_registers: u16,
    /// Skip saving (and clearing) the flags word; drops both extra slots.
    pub skip_save_flags: bool,
    /// Pad the frame so ABI stack alignment holds at the injected call.
    pub realign_stack: bool,
    /// Emit calls to the shared save/restore routines instead of the
    /// inline push sequence. Always saves the full file.
    pub out_of_line: bool,
}

impl Default for CleanCallDescriptor {
    fn default() -> Self {
        Self {
            save_registers: 0xffff,
            skip_save_flags: false,
            realign_stack: true,
            out_of_line: false,
        }
    }
}

impl CleanCallDescriptor {
    fn saves(&self, reg: u8) -> bool {
        self.save_registers & (1 << reg) != 0
    }

    fn saved_count(&self) -> usize {
        self.save_registers.count_ones() as usize
    }
}

/// Switch-frame size in bytes for `descriptor`, including any alignment
/// pad. `prepare_clean_call` pushes exactly this much.
pub fn frame_size(descriptor: &CleanCallDescriptor) -> usize {
    if descriptor.out_of_line {
        return MCTX_SIZE as usize;
    }
    let mut slots = descriptor.saved_count();
    if !descriptor.skip_save_flags {
        slots += NUM_EXTRA_SLOTS;
    }
    let mut size = slots * 8;
    if descriptor.realign_stack && size % 16 != 0 {
        size += 8;
    }
    size
}

struct Emitter<'a> {
    list: &'a mut InstructionList,
    before: InsnRef,
}

impl Emitter<'_> {
    fn emit(&mut self, mut insn: Instruction) -> Result<(), MangleError> {
        insn.set_meta();
        self.list.insert_before(self.before, insn)?;
        Ok(())
    }
}

/// Emits the switch from the application stack to the engine stack,
/// storing the application stack pointer into the thread's machine context
/// record. Clobbers the scratch register (restored before returning) and
/// the stack pointer.
fn emit_stack_switch(emitter: &mut Emitter) -> Result<(), MangleError> {
    emitter.emit(Instruction::store(
        OperandSize::S64,
        RAX,
        TlsSlot::Reg0.mem(),
    ))?;
    emitter.emit(Instruction::load(
        OperandSize::S64,
        TlsSlot::Context.mem(),
        RAX,
    ))?;
    emitter.emit(Instruction::store(
        OperandSize::S64,
        RSP,
        MemRef::base_disp(RAX, mctx_reg_offset(RSP)),
    ))?;
    emitter.emit(Instruction::load(
        OperandSize::S64,
        MemRef::base_disp(RAX, CTX_DSTACK_OFFSET),
        RSP,
    ))?;
    emitter.emit(Instruction::load(
        OperandSize::S64,
        TlsSlot::Reg0.mem(),
        RAX,
    ))
}

/// Emits the switch back to the application stack from the machine context
/// record. All other registers already hold application values.
fn emit_stack_restore(emitter: &mut Emitter) -> Result<(), MangleError> {
    emitter.emit(Instruction::store(
        OperandSize::S64,
        RAX,
        TlsSlot::Reg0.mem(),
    ))?;
    emitter.emit(Instruction::load(
        OperandSize::S64,
        TlsSlot::Context.mem(),
        RAX,
    ))?;
    emitter.emit(Instruction::load(
        OperandSize::S64,
        MemRef::base_disp(RAX, mctx_reg_offset(RSP)),
        RSP,
    ))?;
    emitter.emit(Instruction::load(
        OperandSize::S64,
        TlsSlot::Reg0.mem(),
        RAX,
    ))
}

/// Emits the context switch and register save for an injected call,
/// inserting before `before`. Returns the number of switch-frame bytes
/// pushed; the matching [`cleanup_clean_call`] restores exactly that
/// frame, and callers use it to compute offsets into the saved state.
pub fn prepare_clean_call(
    ilist: &mut InstructionList,
    before: InsnRef,
    descriptor: &CleanCallDescriptor,
    tcx: &ThreadContext,
) -> Result<usize, MangleError> {
    let size = frame_size(descriptor);
    trace!("preparing clean call, frame {} bytes", size);
    let mut emitter = Emitter {
        list: ilist,
        before,
    };
    emit_stack_switch(&mut emitter)?;

    if descriptor.out_of_line {
        debug_assert!(
            descriptor.save_registers == 0xffff && !descriptor.skip_save_flags,
            "out-of-line switch always saves the full file"
        );
        emitter.emit(Instruction::call(Operand::Pc(tcx.context_save_routine)))?;
        return Ok(size);
    }

    let mut pushed = 0usize;
    if !descriptor.skip_save_flags {
        // Program counter slot, filled lazily on state reconstruction.
        emitter.emit(Instruction::push_immediate(0))?;
        emitter.emit(Instruction::pushf())?;
        pushed += NUM_EXTRA_SLOTS * 8;
    }
    for &reg in MCTX_REG_ORDER.iter().rev() {
        if descriptor.saves(reg) {
            // The stack pointer slot holds a dummy; the real value sits in
            // the machine context record.
            emitter.emit(Instruction::push(reg))?;
            pushed += 8;
        }
    }
    if !descriptor.skip_save_flags {
        // Leave the callee a defined flags state.
        emitter.emit(Instruction::push_immediate(0))?;
        emitter.emit(Instruction::popf())?;
    }
    if pushed < size {
        debug_assert_eq!(size - pushed, 8);
        emitter.emit(Instruction::lea(MemRef::base_disp(RSP, -8), RSP))?;
    }
    Ok(size)
}

/// Emits the register restore and switch back to the application stack,
/// mirroring [`prepare_clean_call`] for the same descriptor.
pub fn cleanup_clean_call(
    ilist: &mut InstructionList,
    before: InsnRef,
    descriptor: &CleanCallDescriptor,
    tcx: &ThreadContext,
) -> Result<(), MangleError> {
    let size = frame_size(descriptor);
    let mut emitter = Emitter {
        list: ilist,
        before,
    };

    if descriptor.out_of_line {
        emitter.emit(Instruction::call(Operand::Pc(tcx.context_restore_routine)))?;
        return emit_stack_restore(&mut emitter);
    }

    let mut slot_bytes = descriptor.saved_count() * 8;
    if !descriptor.skip_save_flags {
        slot_bytes += NUM_EXTRA_SLOTS * 8;
    }
    if slot_bytes < size {
        // The alignment pad sits below the register file; drop it first.
        debug_assert_eq!(size - slot_bytes, 8);
        emitter.emit(Instruction::lea(MemRef::base_disp(RSP, 8), RSP))?;
    }
    for &reg in MCTX_REG_ORDER.iter() {
        if !descriptor.saves(reg) {
            continue;
        }
        if reg == RSP {
            // Discard the dummy slot; the live value comes back with the
            // stack switch below.
            emitter.emit(Instruction::lea(MemRef::base_disp(RSP, 8), RSP))?;
        } else {
            emitter.emit(Instruction::pop(reg))?;
        }
    }
    if !descriptor.skip_save_flags {
        emitter.emit(Instruction::popf())?;
        emitter.emit(Instruction::lea(MemRef::base_disp(RSP, 8), RSP))?;
    }
    emit_stack_restore(&mut emitter)
}

/// One argument to an injected call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallArg {
    /// Immediate value, materialized into the argument position.
    Immediate(i64),
    /// Current value of a register. Must not name an argument register
    /// that a later-positioned argument has already claimed.
    Register(u8),
}

/// Options for [`insert_call`] beyond the argument list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CallOptions {
    /// Update the thread's where-am-i field around the call.
    pub track_where_am_i: bool,
    /// Mode recorded once the callee returns.
    pub resume_mode: WhereAmI,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            track_where_am_i: true,
            resume_mode: WhereAmI::App,
        }
    }
}

fn rel32_reachable(from_pc: u64, target: u64) -> bool {
    // Displacement is measured from the end of the five-byte call.
    let disp = (target as i128) - (from_pc as i128 + 5);
    disp >= i32::MIN as i128 && disp <= i32::MAX as i128
}

/// Emits an injected call to `callee` with `args` laid out per the SysV
/// calling convention, inserting before `before`. The call is direct when
/// a 32-bit displacement from `from_pc` (the fragment's expected cache
/// position) will reach, and otherwise indirect through
/// [`REG_CALL_SCRATCH`], which callers must never rely on across a call.
/// Every inserted instruction is marked meta by walking forward from the
/// pre-insertion position. Returns whether the call was direct.
pub fn insert_call(
    ilist: &mut InstructionList,
    before: InsnRef,
    callee: u64,
    args: &[CallArg],
    options: &CallOptions,
    from_pc: u64,
) -> Result<bool, MangleError> {
    let mark_from = ilist.prev(before)?;

    let stack_args = args.len().saturating_sub(ARGUMENT_REGISTERS.len());
    if stack_args % 2 == 1 {
        ilist.insert_before(before, Instruction::push_immediate(0))?;
    }
    for arg in args.iter().skip(ARGUMENT_REGISTERS.len()).rev() {
        match *arg {
            CallArg::Register(reg) => {
                ilist.insert_before(before, Instruction::push(reg))?;
            }
            CallArg::Immediate(value) => {
                if value >= i32::MIN as i64 && value <= i32::MAX as i64 {
                    ilist.insert_before(before, Instruction::push_immediate(value as i32))?;
                } else {
                    ilist.insert_before(
                        before,
                        Instruction::load_immediate(OperandSize::S64, REG_CALL_SCRATCH, value),
                    )?;
                    ilist.insert_before(before, Instruction::push(REG_CALL_SCRATCH))?;
                }
            }
        }
    }
    // Register arguments are assigned from the last position to the first
    // so an argument register used as a source stays live until its own
    // assignment.
    for (position, arg) in args.iter().enumerate().take(ARGUMENT_REGISTERS.len()).rev() {
        let destination = ARGUMENT_REGISTERS[position];
        match *arg {
            CallArg::Immediate(value) => {
                ilist.insert_before(
                    before,
                    Instruction::load_immediate(OperandSize::S64, destination, value),
                )?;
            }
            CallArg::Register(source) => {
                debug_assert!(
                    !ARGUMENT_REGISTERS[position + 1..args.len().min(ARGUMENT_REGISTERS.len())]
                        .contains(&source),
                    "argument source register already overwritten"
                );
                if source != destination {
                    ilist.insert_before(
                        before,
                        Instruction::mov(OperandSize::S64, source, destination),
                    )?;
                }
            }
        }
    }

    if options.track_where_am_i {
        emit_whereami(ilist, before, WhereAmI::CleanCallee)?;
    }

    let is_direct = rel32_reachable(from_pc, callee);
    if is_direct {
        ilist.insert_before(before, Instruction::call(Operand::Pc(callee)))?;
    } else {
        trace!("callee {:#x} out of rel32 reach, calling indirect", callee);
        ilist.insert_before(
            before,
            Instruction::load_pointer_immediate(REG_CALL_SCRATCH, callee as i64),
        )?;
        ilist.insert_before(before, Instruction::call_reg(REG_CALL_SCRATCH))?;
    }

    if options.track_where_am_i {
        emit_whereami(ilist, before, options.resume_mode)?;
    }
    if stack_args > 0 {
        let slots = stack_args + (stack_args % 2);
        ilist.insert_before(
            before,
            Instruction::lea(MemRef::base_disp(RSP, (slots * 8) as i32), RSP),
        )?;
    }

    // Everything inserted above is engine code, never client or app code.
    let mut cursor = match mark_from {
        Some(prev) => ilist.next(prev)?,
        None => ilist.first(),
    };
    while let Some(at) = cursor {
        if at == before {
            break;
        }
        ilist.get_mut(at)?.set_meta();
        cursor = ilist.next(at)?;
    }
    Ok(is_direct)
}

fn emit_whereami(
    ilist: &mut InstructionList,
    before: InsnRef,
    mode: WhereAmI,
) -> Result<(), MangleError> {
    ilist.insert_before(
        before,
        Instruction::load(OperandSize::S64, TlsSlot::Context.mem(), RAX),
    )?;
    ilist.insert_before(
        before,
        Instruction::store_immediate(
            OperandSize::S32,
            MemRef::base_disp(RAX, CTX_WHEREAMI_OFFSET),
            mode.as_imm(),
        ),
    )?;
    Ok(())
}
