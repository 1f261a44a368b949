// Licensed under the Apache License, Version 2.0 <http://www.apache.org/licenses/LICENSE-2.0> or
// the MIT license <http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

#![allow(clippy::integer_arithmetic)]
//! x86-64 backend: instruction-synthesis constructors and the encoder.
//!
//! Mangling passes never hand-assemble bytes; they build [`Instruction`]
//! nodes through the constructors here and fragment emission turns a
//! finished list into cache bytes with [`encode_list`].

use crate::{
    error::MangleError,
    ilist::InstructionList,
    insn::{
        Base, Instruction, LabelId, MemRef, Opcode, Operand, OperandSize, Segment, R11, RAX, RCX,
        RSP,
    },
};
use byteorder::{ByteOrder, LittleEndian};
use std::collections::HashMap;
use std::convert::TryFrom;

/// Length in bytes of a short unconditional jump.
pub const JMP_SHORT_LEN: usize = 2;
/// Length in bytes of a near unconditional jump.
pub const JMP_NEAR_LEN: usize = 5;
/// Length in bytes of the multi-byte no-op carrying a 32-bit payload.
pub const NOP_MODRM_LEN: usize = 7;
/// Single-byte no-op.
pub const RAW_OPCODE_NOP: u8 = 0x90;

macro_rules! exclude_operand_sizes {
    ($size:expr, $($to_exclude:pat)|+ $(,)?) => {
        debug_assert!(
            match $size {
                $($to_exclude)|+ => false,
                _ => true,
            },
        );
    }
}

impl Instruction {
    /// Move source register to destination register.
    pub const fn mov(size: OperandSize, source: u8, destination: u8) -> Instruction {
        exclude_operand_sizes!(size, OperandSize::S0 | OperandSize::S8);
        Instruction {
            opcode: Opcode::MovRR,
            size,
            dst: Operand::Reg(destination),
            src: Operand::Reg(source),
            writes: 1 << destination,
            ..Instruction::DEFAULT
        }
    }

    /// Load from memory into a register, zero-extending sub-word sizes.
    pub const fn load(size: OperandSize, mem: MemRef, destination: u8) -> Instruction {
        exclude_operand_sizes!(size, OperandSize::S0);
        Instruction {
            opcode: Opcode::Load,
            size,
            dst: Operand::Reg(destination),
            src: Operand::Mem(mem),
            writes: 1 << destination,
            ..Instruction::DEFAULT
        }
    }

    /// Store a register to memory.
    pub const fn store(size: OperandSize, source: u8, mem: MemRef) -> Instruction {
        exclude_operand_sizes!(size, OperandSize::S0);
        Instruction {
            opcode: Opcode::Store,
            size,
            dst: Operand::Mem(mem),
            src: Operand::Reg(source),
            mem_writes: 1,
            ..Instruction::DEFAULT
        }
    }

    /// Store a sign-extended immediate to memory.
    pub const fn store_immediate(size: OperandSize, mem: MemRef, immediate: i64) -> Instruction {
        exclude_operand_sizes!(size, OperandSize::S0);
        Instruction {
            opcode: Opcode::StoreImm,
            size,
            dst: Operand::Mem(mem),
            src: Operand::Imm(immediate),
            mem_writes: 1,
            ..Instruction::DEFAULT
        }
    }

    /// Move an immediate into a register using the shortest encoding that
    /// holds the value.
    pub const fn load_immediate(size: OperandSize, destination: u8, immediate: i64) -> Instruction {
        exclude_operand_sizes!(size, OperandSize::S0 | OperandSize::S8 | OperandSize::S16);
        Instruction {
            opcode: Opcode::LoadImm,
            size,
            dst: Operand::Reg(destination),
            src: Operand::Imm(immediate),
            writes: 1 << destination,
            ..Instruction::DEFAULT
        }
    }

    /// Move a pointer-sized immediate into a register using the full-width
    /// form regardless of value, so the immediate can be patched in place
    /// after emission.
    pub const fn load_pointer_immediate(destination: u8, immediate: i64) -> Instruction {
        Instruction {
            opcode: Opcode::LoadImmWide,
            size: OperandSize::S64,
            dst: Operand::Reg(destination),
            src: Operand::Imm(immediate),
            writes: 1 << destination,
            ..Instruction::DEFAULT
        }
    }

    /// Load the effective address of `mem` into a register.
    pub const fn lea(mem: MemRef, destination: u8) -> Instruction {
        Instruction {
            opcode: Opcode::Lea,
            size: OperandSize::S64,
            dst: Operand::Reg(destination),
            src: Operand::Mem(mem),
            writes: 1 << destination,
            ..Instruction::DEFAULT
        }
    }

    /// Add an immediate to a register.
    pub const fn add_immediate(size: OperandSize, destination: u8, immediate: i64) -> Instruction {
        exclude_operand_sizes!(size, OperandSize::S0 | OperandSize::S8 | OperandSize::S16);
        Instruction {
            opcode: Opcode::Add,
            size,
            dst: Operand::Reg(destination),
            src: Operand::Imm(immediate),
            writes: 1 << destination,
            ..Instruction::DEFAULT
        }
    }

    /// Subtract an immediate from a register.
    pub const fn sub_immediate(size: OperandSize, destination: u8, immediate: i64) -> Instruction {
        exclude_operand_sizes!(size, OperandSize::S0 | OperandSize::S8 | OperandSize::S16);
        Instruction {
            opcode: Opcode::Sub,
            size,
            dst: Operand::Reg(destination),
            src: Operand::Imm(immediate),
            writes: 1 << destination,
            ..Instruction::DEFAULT
        }
    }

    /// Push a register onto the stack.
    pub const fn push(source: u8) -> Instruction {
        Instruction {
            opcode: Opcode::Push,
            size: OperandSize::S64,
            src: Operand::Reg(source),
            writes: 1 << RSP,
            mem_writes: 1,
            ..Instruction::DEFAULT
        }
    }

    /// Push a sign-extended immediate onto the stack.
    pub const fn push_immediate(immediate: i32) -> Instruction {
        Instruction {
            opcode: Opcode::PushImm,
            size: OperandSize::S64,
            src: Operand::Imm(immediate as i64),
            writes: 1 << RSP,
            mem_writes: 1,
            ..Instruction::DEFAULT
        }
    }

    /// Pop from the stack into a register.
    pub const fn pop(destination: u8) -> Instruction {
        Instruction {
            opcode: Opcode::Pop,
            size: OperandSize::S64,
            dst: Operand::Reg(destination),
            writes: (1 << destination) | (1 << RSP),
            ..Instruction::DEFAULT
        }
    }

    /// Push the flags register.
    pub const fn pushf() -> Instruction {
        Instruction {
            opcode: Opcode::Pushf,
            size: OperandSize::S64,
            writes: 1 << RSP,
            mem_writes: 1,
            ..Instruction::DEFAULT
        }
    }

    /// Pop into the flags register.
    pub const fn popf() -> Instruction {
        Instruction {
            opcode: Opcode::Popf,
            size: OperandSize::S64,
            writes: 1 << RSP,
            ..Instruction::DEFAULT
        }
    }

    /// Short unconditional jump.
    pub const fn jump_short(target: Operand) -> Instruction {
        Instruction {
            opcode: Opcode::JmpShort,
            src: target,
            ..Instruction::DEFAULT
        }
    }

    /// Near unconditional jump.
    pub const fn jump(target: Operand) -> Instruction {
        Instruction {
            opcode: Opcode::Jmp,
            src: target,
            ..Instruction::DEFAULT
        }
    }

    /// Near conditional jump; `cc` is the x86 condition nibble.
    pub const fn jcc(cc: u8, target: Operand) -> Instruction {
        Instruction {
            opcode: Opcode::Jcc(cc),
            src: target,
            ..Instruction::DEFAULT
        }
    }

    /// Short conditional jump.
    pub const fn jcc_short(cc: u8, target: Operand) -> Instruction {
        Instruction {
            opcode: Opcode::JccShort(cc),
            src: target,
            ..Instruction::DEFAULT
        }
    }

    /// `jrcxz`; a 32-bit size selects the `jecxz` form testing `ecx`.
    pub const fn jecxz(target: Operand) -> Instruction {
        Instruction {
            opcode: Opcode::Jecxz,
            size: OperandSize::S64,
            src: target,
            ..Instruction::DEFAULT
        }
    }

    /// Direct near call.
    pub const fn call(target: Operand) -> Instruction {
        Instruction {
            opcode: Opcode::Call,
            src: target,
            writes: 1 << RSP,
            mem_writes: 1,
            ..Instruction::DEFAULT
        }
    }

    /// Indirect call through a register.
    pub const fn call_reg(register: u8) -> Instruction {
        Instruction {
            opcode: Opcode::CallInd,
            src: Operand::Reg(register),
            writes: 1 << RSP,
            mem_writes: 1,
            ..Instruction::DEFAULT
        }
    }

    /// Indirect call through a memory operand.
    pub const fn call_mem(mem: MemRef) -> Instruction {
        Instruction {
            opcode: Opcode::CallInd,
            src: Operand::Mem(mem),
            writes: 1 << RSP,
            mem_writes: 1,
            ..Instruction::DEFAULT
        }
    }

    /// Near return.
    pub const fn return_near() -> Instruction {
        Instruction {
            opcode: Opcode::Ret,
            writes: 1 << RSP,
            ..Instruction::DEFAULT
        }
    }

    /// System call.
    pub const fn syscall() -> Instruction {
        Instruction {
            opcode: Opcode::Syscall,
            // The kernel clobbers rcx and r11; rax carries the result.
            writes: (1 << RAX) | (1 << RCX) | (1 << R11),
            ..Instruction::DEFAULT
        }
    }

    /// Software interrupt.
    pub const fn interrupt(vector: u8) -> Instruction {
        Instruction {
            opcode: Opcode::Int(vector),
            ..Instruction::DEFAULT
        }
    }

    /// Single-byte no-op.
    pub const fn noop() -> Instruction {
        Instruction {
            opcode: Opcode::Nop,
            ..Instruction::DEFAULT
        }
    }

    /// Seven-byte no-op whose displacement field carries an arbitrary
    /// 32-bit payload; executing it is harmless.
    pub const fn noop_with_payload(payload: u32) -> Instruction {
        Instruction {
            opcode: Opcode::NopModrm,
            src: Operand::Mem(MemRef::base_disp(RAX, payload as i32)),
            ..Instruction::DEFAULT
        }
    }

    /// Zero-length position marker.
    pub const fn label(id: LabelId) -> Instruction {
        Instruction {
            opcode: Opcode::Label,
            dst: Operand::Label(id),
            ..Instruction::DEFAULT
        }
    }
}

struct Emitter<'a> {
    out: &'a mut Vec<u8>,
}

impl Emitter<'_> {
    fn emit8(&mut self, b: u8) {
        self.out.push(b);
    }

    fn emit16(&mut self, v: u16) {
        let mut buf = [0u8; 2];
        LittleEndian::write_u16(&mut buf, v);
        self.out.extend_from_slice(&buf);
    }

    fn emit32(&mut self, v: i32) {
        let mut buf = [0u8; 4];
        LittleEndian::write_i32(&mut buf, v);
        self.out.extend_from_slice(&buf);
    }

    fn emit64(&mut self, v: i64) {
        let mut buf = [0u8; 8];
        LittleEndian::write_i64(&mut buf, v);
        self.out.extend_from_slice(&buf);
    }

    fn emit_seg_prefix(&mut self, seg: Segment) {
        match seg {
            Segment::None => {}
            Segment::Fs => self.emit8(0x64),
            Segment::Gs => self.emit8(0x65),
        }
    }

    /// REX prefix; `reg` fills the ModRM reg field, `index` and `base` the
    /// SIB extension bits. Omitted when no bit is set.
    fn emit_rex(&mut self, wide: bool, reg: u8, index: u8, base: u8) {
        let rex = ((wide as u8) << 3)
            | (((reg >> 3) & 1) << 2)
            | (((index >> 3) & 1) << 1)
            | ((base >> 3) & 1);
        if rex != 0 {
            self.emit8(0x40 | rex);
        }
    }

    fn emit_modrm_reg(&mut self, reg: u8, rm: u8) {
        self.emit8(0xc0 | ((reg & 0b111) << 3) | (rm & 0b111));
    }

    /// ModRM, optional SIB and displacement for a memory operand.
    fn emit_modrm_mem(&mut self, reg: u8, mem: &MemRef) {
        let reg = reg & 0b111;
        match (mem.base, mem.index) {
            (Base::Rip, None) => {
                self.emit8((reg << 3) | 0b101);
                self.emit32(mem.disp);
            }
            (Base::None, None) => {
                // Absolute disp32 needs the no-base SIB form.
                self.emit8((reg << 3) | 0b100);
                self.emit8(0x25);
                self.emit32(mem.disp);
            }
            (Base::Reg(base), None) => {
                let base_low = base & 0b111;
                let modbits = if mem.disp == 0 && base_low != 0b101 {
                    0b00
                } else if i8::try_from(mem.disp).is_ok() {
                    0b01
                } else {
                    0b10
                };
                if base_low == 0b100 {
                    // rsp/r12 base is reserved for SIB addressing.
                    self.emit8((modbits << 6) | (reg << 3) | 0b100);
                    self.emit8(0x24);
                } else {
                    self.emit8((modbits << 6) | (reg << 3) | base_low);
                }
                match modbits {
                    0b01 => self.emit8(mem.disp as i8 as u8),
                    0b10 => self.emit32(mem.disp),
                    _ => {}
                }
            }
            (base, Some(index)) => {
                let scale_bits: u8 = match mem.scale {
                    2 => 1,
                    4 => 2,
                    8 => 3,
                    _ => 0,
                };
                let (has_base, base_low) = match base {
                    Base::Reg(b) => (true, b & 0b111),
                    // No-base indexed form uses base=101 with disp32.
                    _ => (false, 0b101),
                };
                let modbits = if !has_base || (mem.disp == 0 && base_low != 0b101) {
                    0b00
                } else if i8::try_from(mem.disp).is_ok() {
                    0b01
                } else {
                    0b10
                };
                self.emit8((modbits << 6) | (reg << 3) | 0b100);
                self.emit8((scale_bits << 6) | ((index & 0b111) << 3) | base_low);
                if !has_base || modbits == 0b10 {
                    self.emit32(mem.disp);
                } else if modbits == 0b01 {
                    self.emit8(mem.disp as i8 as u8);
                }
            }
        }
    }
}

fn mem_rex_bits(mem: &MemRef) -> (u8, u8) {
    let index = mem.index.unwrap_or(0);
    let base = match mem.base {
        Base::Reg(b) => b,
        _ => 0,
    };
    (index, base)
}

fn rel_to(target: u64, pc: u64, insn_len: usize) -> i64 {
    target.wrapping_sub(pc.wrapping_add(insn_len as u64)) as i64
}

fn resolve_target(
    insn: &Instruction,
    resolve: &dyn Fn(LabelId) -> Option<u64>,
) -> Result<u64, MangleError> {
    match insn.src {
        Operand::Pc(pc) => Ok(pc),
        Operand::Label(id) => resolve(id).ok_or(MangleError::UnresolvedLabel(id.0)),
        _ => Err(MangleError::MalformedInstruction),
    }
}

fn expect_reg(op: Operand) -> Result<u8, MangleError> {
    match op {
        Operand::Reg(r) => Ok(r),
        _ => Err(MangleError::MalformedInstruction),
    }
}

fn expect_mem(op: Operand) -> Result<MemRef, MangleError> {
    match op {
        Operand::Mem(m) => Ok(m),
        _ => Err(MangleError::MalformedInstruction),
    }
}

fn expect_imm(op: Operand) -> Result<i64, MangleError> {
    match op {
        Operand::Imm(v) => Ok(v),
        _ => Err(MangleError::MalformedInstruction),
    }
}

fn encode_with(
    insn: &Instruction,
    pc: u64,
    resolve: &dyn Fn(LabelId) -> Option<u64>,
    out: &mut Vec<u8>,
    range_check: bool,
) -> Result<(), MangleError> {
    // Decoded instructions that nothing mutated are re-emitted verbatim. A
    // rip-relative displacement is the one piece of a raw instruction that
    // cannot survive relocation, so it is recomputed against the new pc.
    if let Some(raw) = &insn.raw {
        let start = out.len();
        out.extend_from_slice(raw);
        if let Some(rr) = insn.rip_rel {
            debug_assert_eq!(raw[rr.modrm_off as usize] & 0xc7, 0x05);
            let next_pc = pc.wrapping_add(raw.len() as u64);
            let disp = rr.target.wrapping_sub(next_pc) as i64;
            if range_check && (disp > i64::from(i32::MAX) || disp < i64::from(i32::MIN)) {
                return Err(MangleError::BranchOutOfReach(pc, rr.target));
            }
            let at = start + rr.disp_off as usize;
            LittleEndian::write_i32(&mut out[at..at + 4], disp as i32);
        }
        return Ok(());
    }
    let mut e = Emitter { out };
    let wide = matches!(insn.size, OperandSize::S64);
    match insn.opcode {
        Opcode::Label => {}
        Opcode::Nop => e.emit8(RAW_OPCODE_NOP),
        Opcode::NopModrm => {
            let disp = match insn.src {
                Operand::Mem(m) => m.disp,
                _ => 0,
            };
            e.emit8(0x0f);
            e.emit8(0x1f);
            e.emit8(0x80);
            e.emit32(disp);
        }
        Opcode::Syscall => {
            e.emit8(0x0f);
            e.emit8(0x05);
        }
        Opcode::Int(3) => e.emit8(0xcc),
        Opcode::Int(v) => {
            e.emit8(0xcd);
            e.emit8(v);
        }
        Opcode::Ret => match insn.src {
            Operand::Imm(n) => {
                e.emit8(0xc2);
                e.emit16(n as u16);
            }
            _ => e.emit8(0xc3),
        },
        Opcode::Pushf => e.emit8(0x9c),
        Opcode::Popf => e.emit8(0x9d),
        Opcode::Push => {
            let reg = expect_reg(insn.src)?;
            e.emit_rex(false, 0, 0, reg);
            e.emit8(0x50 | (reg & 0b111));
        }
        Opcode::Pop => {
            let reg = expect_reg(insn.dst)?;
            e.emit_rex(false, 0, 0, reg);
            e.emit8(0x58 | (reg & 0b111));
        }
        Opcode::PushImm => {
            let imm = expect_imm(insn.src)?;
            if i8::try_from(imm).is_ok() {
                e.emit8(0x6a);
                e.emit8(imm as i8 as u8);
            } else {
                e.emit8(0x68);
                e.emit32(imm as i32);
            }
        }
        Opcode::MovRR => {
            let dst = expect_reg(insn.dst)?;
            let src = expect_reg(insn.src)?;
            if matches!(insn.size, OperandSize::S16) {
                e.emit8(0x66);
            }
            e.emit_rex(wide, src, 0, dst);
            e.emit8(0x89);
            e.emit_modrm_reg(src, dst);
        }
        Opcode::Load => {
            let dst = expect_reg(insn.dst)?;
            let mem = expect_mem(insn.src)?;
            let (index, base) = mem_rex_bits(&mem);
            e.emit_seg_prefix(mem.seg);
            match insn.size {
                // movzx clears the upper bits through the 32-bit result.
                OperandSize::S8 | OperandSize::S16 => {
                    e.emit_rex(false, dst, index, base);
                    e.emit8(0x0f);
                    e.emit8(if matches!(insn.size, OperandSize::S8) { 0xb6 } else { 0xb7 });
                }
                _ => {
                    e.emit_rex(wide, dst, index, base);
                    e.emit8(0x8b);
                }
            }
            e.emit_modrm_mem(dst, &mem);
        }
        Opcode::Store => {
            let src = expect_reg(insn.src)?;
            let mem = expect_mem(insn.dst)?;
            let (index, base) = mem_rex_bits(&mem);
            e.emit_seg_prefix(mem.seg);
            if matches!(insn.size, OperandSize::S16) {
                e.emit8(0x66);
            }
            e.emit_rex(wide, src, index, base);
            e.emit8(if matches!(insn.size, OperandSize::S8) { 0x88 } else { 0x89 });
            e.emit_modrm_mem(src, &mem);
        }
        Opcode::StoreImm => {
            let imm = expect_imm(insn.src)?;
            let mem = expect_mem(insn.dst)?;
            let (index, base) = mem_rex_bits(&mem);
            e.emit_seg_prefix(mem.seg);
            if matches!(insn.size, OperandSize::S16) {
                e.emit8(0x66);
            }
            e.emit_rex(wide, 0, index, base);
            e.emit8(if matches!(insn.size, OperandSize::S8) { 0xc6 } else { 0xc7 });
            e.emit_modrm_mem(0, &mem);
            match insn.size {
                OperandSize::S8 => e.emit8(imm as i8 as u8),
                OperandSize::S16 => e.emit16(imm as u16),
                _ => e.emit32(imm as i32),
            }
        }
        Opcode::LoadImm | Opcode::LoadImmWide => {
            let dst = expect_reg(insn.dst)?;
            let imm = expect_imm(insn.src)?;
            let needs_wide = matches!(insn.opcode, Opcode::LoadImmWide)
                || (wide && i32::try_from(imm).is_err());
            if needs_wide {
                e.emit_rex(true, 0, 0, dst);
                e.emit8(0xb8 | (dst & 0b111));
                e.emit64(imm);
            } else if wide {
                e.emit_rex(true, 0, 0, dst);
                e.emit8(0xc7);
                e.emit_modrm_reg(0, dst);
                e.emit32(imm as i32);
            } else {
                e.emit_rex(false, 0, 0, dst);
                e.emit8(0xb8 | (dst & 0b111));
                e.emit32(imm as i32);
            }
        }
        Opcode::Lea => {
            let dst = expect_reg(insn.dst)?;
            let mem = expect_mem(insn.src)?;
            let (index, base) = mem_rex_bits(&mem);
            e.emit_rex(true, dst, index, base);
            e.emit8(0x8d);
            e.emit_modrm_mem(dst, &mem);
        }
        Opcode::Add | Opcode::Sub => {
            let dst = expect_reg(insn.dst)?;
            let imm = expect_imm(insn.src)?;
            let opx: u8 = if matches!(insn.opcode, Opcode::Add) { 0 } else { 5 };
            e.emit_rex(wide, 0, 0, dst);
            if i8::try_from(imm).is_ok() {
                e.emit8(0x83);
                e.emit_modrm_reg(opx, dst);
                e.emit8(imm as i8 as u8);
            } else {
                e.emit8(0x81);
                e.emit_modrm_reg(opx, dst);
                e.emit32(imm as i32);
            }
        }
        Opcode::CallInd | Opcode::JmpInd => {
            let opx: u8 = if matches!(insn.opcode, Opcode::CallInd) { 2 } else { 4 };
            match insn.src {
                Operand::Reg(reg) => {
                    e.emit_rex(false, 0, 0, reg);
                    e.emit8(0xff);
                    e.emit_modrm_reg(opx, reg);
                }
                Operand::Mem(mem) => {
                    let (index, base) = mem_rex_bits(&mem);
                    e.emit_seg_prefix(mem.seg);
                    e.emit_rex(false, 0, index, base);
                    e.emit8(0xff);
                    e.emit_modrm_mem(opx, &mem);
                }
                _ => return Err(MangleError::MalformedInstruction),
            }
        }
        Opcode::JmpShort | Opcode::JccShort(_) => {
            let target = resolve_target(insn, resolve)?;
            let rel = rel_to(target, pc, JMP_SHORT_LEN);
            if range_check && i8::try_from(rel).is_err() {
                return Err(MangleError::BranchOutOfReach(pc, target));
            }
            match insn.opcode {
                Opcode::JmpShort => e.emit8(0xeb),
                Opcode::JccShort(cc) => e.emit8(0x70 | (cc & 0x0f)),
                _ => {}
            }
            e.emit8(rel as i8 as u8);
        }
        Opcode::Jecxz => {
            // 32-bit size keeps the ecx-testing form via the address prefix.
            let narrow = matches!(insn.size, OperandSize::S32);
            let target = resolve_target(insn, resolve)?;
            let len = if narrow { 3 } else { JMP_SHORT_LEN };
            let rel = rel_to(target, pc, len);
            if range_check && i8::try_from(rel).is_err() {
                return Err(MangleError::BranchOutOfReach(pc, target));
            }
            if narrow {
                e.emit8(0x67);
            }
            e.emit8(0xe3);
            e.emit8(rel as i8 as u8);
        }
        Opcode::Jmp | Opcode::Call => {
            let target = resolve_target(insn, resolve)?;
            let rel = rel_to(target, pc, JMP_NEAR_LEN);
            if range_check && i32::try_from(rel).is_err() {
                return Err(MangleError::BranchOutOfReach(pc, target));
            }
            e.emit8(if matches!(insn.opcode, Opcode::Jmp) { 0xe9 } else { 0xe8 });
            e.emit32(rel as i32);
        }
        Opcode::Jcc(cc) => {
            let target = resolve_target(insn, resolve)?;
            let rel = rel_to(target, pc, 6);
            if range_check && i32::try_from(rel).is_err() {
                return Err(MangleError::BranchOutOfReach(pc, target));
            }
            e.emit8(0x0f);
            e.emit8(0x80 | (cc & 0x0f));
            e.emit32(rel as i32);
        }
        Opcode::Other(_) => {
            // Raw bytes were cleared by a mutation; nothing left to emit.
            return Err(MangleError::MalformedInstruction);
        }
    }
    Ok(())
}

/// Encode one instruction placed at code address `pc`. Label operands must
/// already be resolved; whole-fragment emission goes through
/// [`encode_list`] instead.
pub fn encode(insn: &Instruction, pc: u64) -> Result<Vec<u8>, MangleError> {
    let mut out = Vec::with_capacity(16);
    encode_with(insn, pc, &|_| None, &mut out, true)?;
    Ok(out)
}

/// Encoded length of an instruction. Deterministic given opcode, operands
/// and immediate value; independent of final placement.
pub fn instruction_length(insn: &Instruction) -> usize {
    if let Some(raw) = &insn.raw {
        return raw.len();
    }
    let mut out = Vec::with_capacity(16);
    // Branch length never depends on the displacement a target resolves to.
    let ok = encode_with(insn, 0, &|_| Some(0), &mut out, false).is_ok();
    debug_assert!(ok, "length of unencodable instruction");
    out.len()
}

/// Byte offset of the patchable immediate inside an encoded full-width
/// immediate-to-register move.
pub const MOV_IMM64_IMM_OFFSET: usize = 2;

/// Patch the 64-bit immediate of an encoded full-width move in place.
/// `code` must start at the instruction; the expected form is verified.
pub fn patch_mov_immed(code: &mut [u8], value: u64) -> Result<(), MangleError> {
    if code.len() < MOV_IMM64_IMM_OFFSET + 8
        || code[0] & 0xf8 != 0x48
        || code[1] & 0xf8 != 0xb8
    {
        return Err(MangleError::MalformedInstruction);
    }
    LittleEndian::write_u64(
        &mut code[MOV_IMM64_IMM_OFFSET..MOV_IMM64_IMM_OFFSET + 8],
        value,
    );
    Ok(())
}

/// Lay out and encode a finished instruction list at base address `pc`.
///
/// Two passes: the first assigns code offsets by instruction length and
/// collects label positions, the second encodes with every intra-list
/// target resolved. The result is the fragment body exactly as the code
/// cache will hold it.
pub fn encode_list(list: &InstructionList, base: u64) -> Result<Vec<u8>, MangleError> {
    let mut label_pcs: HashMap<LabelId, u64> = HashMap::new();
    let mut pc = base;
    let mut cursor = list.first();
    while let Some(handle) = cursor {
        let insn = list.get(handle)?;
        if let Some(id) = insn.label_id() {
            label_pcs.insert(id, pc);
        }
        pc = pc.wrapping_add(instruction_length(insn) as u64);
        cursor = list.next(handle)?;
    }

    let mut out = Vec::new();
    let mut pc = base;
    let mut cursor = list.first();
    while let Some(handle) = cursor {
        let insn = list.get(handle)?;
        let before = out.len();
        encode_with(insn, pc, &|id| label_pcs.get(&id).copied(), &mut out, true)?;
        debug_assert_eq!(out.len() - before, instruction_length(insn));
        pc = pc.wrapping_add((out.len() - before) as u64);
        cursor = list.next(handle)?;
    }
    Ok(out)
}
