// Licensed under the Apache License, Version 2.0 <http://www.apache.org/licenses/LICENSE-2.0> or
// the MIT license <http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! x86-64 decoder.
//!
//! Length decoding covers the full general-purpose encoding space through
//! opcode tables; classification lifts the subset the mangling passes
//! reason about into structured [`Instruction`] nodes and leaves the rest
//! as [`Opcode::Other`] with raw bytes for verbatim re-emission. Register
//! write sets are filled precisely where modeled and pessimistically
//! (all registers) where an instruction has implicit destinations the
//! tables do not enumerate.

use crate::{
    error::MangleError,
    insn::{
        Base, Instruction, MemRef, Opcode, Operand, OperandSize, RipRel, Segment, RAX, RBP, RBX,
        RCX, RDI, RDX, RSI, RSP,
    },
};
use byteorder::{ByteOrder, LittleEndian};

const M: u16 = 1 << 0; // ModRM byte follows
const I8: u16 = 1 << 1; // 8-bit immediate
const IZ: u16 = 1 << 2; // 32-bit immediate, 16-bit under 0x66
const I16: u16 = 1 << 3; // 16-bit immediate
const IV: u16 = 1 << 4; // 32-bit immediate, 64-bit under REX.W, 16 under 0x66
const R8: u16 = 1 << 5; // 8-bit branch displacement
const R32: u16 = 1 << 6; // 32-bit branch displacement
const MOF: u16 = 1 << 7; // 64-bit absolute moffs (32 under 0x67)
const PFX: u16 = 1 << 8; // legacy prefix
const REXP: u16 = 1 << 9; // REX prefix
const BAD: u16 = 1 << 10; // invalid in 64-bit mode
const GI: u16 = 1 << 11; // group 3: immediate present only for /0 and /1
const I16I8: u16 = 1 << 12; // enter: imm16 then imm8

/// Longest legal instruction.
pub const MAX_INSTR_LEN: usize = 15;

#[rustfmt::skip]
static ONE_BYTE: [u16; 256] = [
    /* 00 */ M, M, M, M, I8, IZ, BAD, BAD, M, M, M, M, I8, IZ, BAD, 0,
    /* 10 */ M, M, M, M, I8, IZ, BAD, BAD, M, M, M, M, I8, IZ, BAD, BAD,
    /* 20 */ M, M, M, M, I8, IZ, PFX, BAD, M, M, M, M, I8, IZ, PFX, BAD,
    /* 30 */ M, M, M, M, I8, IZ, PFX, BAD, M, M, M, M, I8, IZ, PFX, BAD,
    /* 40 */ REXP, REXP, REXP, REXP, REXP, REXP, REXP, REXP,
             REXP, REXP, REXP, REXP, REXP, REXP, REXP, REXP,
    /* 50 */ 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    /* 60 */ BAD, BAD, BAD, M, PFX, PFX, PFX, PFX, IZ, M | IZ, I8, M | I8, 0, 0, 0, 0,
    /* 70 */ R8, R8, R8, R8, R8, R8, R8, R8, R8, R8, R8, R8, R8, R8, R8, R8,
    /* 80 */ M | I8, M | IZ, BAD, M | I8, M, M, M, M, M, M, M, M, M, M, M, M,
    /* 90 */ 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, BAD, 0, 0, 0, 0, 0,
    /* a0 */ MOF, MOF, MOF, MOF, 0, 0, 0, 0, I8, IZ, 0, 0, 0, 0, 0, 0,
    /* b0 */ I8, I8, I8, I8, I8, I8, I8, I8, IV, IV, IV, IV, IV, IV, IV, IV,
    /* c0 */ M | I8, M | I8, I16, 0, 0, 0, M | I8, M | IZ, I16I8, 0, I16, 0, 0, I8, BAD, 0,
    /* d0 */ M, M, M, M, BAD, BAD, BAD, 0, M, M, M, M, M, M, M, M,
    /* e0 */ R8, R8, R8, R8, I8, I8, I8, I8, R32, R32, BAD, R8, 0, 0, 0, 0,
    /* f0 */ PFX, 0, PFX, PFX, 0, 0, M | GI, M | GI, 0, 0, 0, 0, 0, 0, M, M,
];

#[rustfmt::skip]
static TWO_BYTE: [u16; 256] = [
    /* 00 */ M, M, M, M, BAD, 0, 0, 0, 0, 0, BAD, 0, BAD, M, 0, BAD,
    /* 10 */ M, M, M, M, M, M, M, M, M, M, M, M, M, M, M, M,
    /* 20 */ M, M, M, M, BAD, BAD, BAD, BAD, M, M, M, M, M, M, M, M,
    /* 30 */ 0, 0, 0, 0, 0, 0, BAD, 0, 0, BAD, 0, BAD, BAD, BAD, BAD, BAD,
    /* 40 */ M, M, M, M, M, M, M, M, M, M, M, M, M, M, M, M,
    /* 50 */ M, M, M, M, M, M, M, M, M, M, M, M, M, M, M, M,
    /* 60 */ M, M, M, M, M, M, M, M, M, M, M, M, M, M, M, M,
    /* 70 */ M | I8, M | I8, M | I8, M | I8, M, M, M, 0, M, M, BAD, BAD, M, M, M, M,
    /* 80 */ R32, R32, R32, R32, R32, R32, R32, R32,
             R32, R32, R32, R32, R32, R32, R32, R32,
    /* 90 */ M, M, M, M, M, M, M, M, M, M, M, M, M, M, M, M,
    /* a0 */ 0, 0, 0, M, M | I8, M, BAD, BAD, 0, 0, 0, M, M | I8, M, M, M,
    /* b0 */ M, M, M, M, M, M, M, M, M, M, M | I8, M, M, M, M, M,
    /* c0 */ M, M, M | I8, M, M | I8, M | I8, M | I8, M, 0, 0, 0, 0, 0, 0, 0, 0,
    /* d0 */ M, M, M, M, M, M, M, M, M, M, M, M, M, M, M, M,
    /* e0 */ M, M, M, M, M, M, M, M, M, M, M, M, M, M, M, M,
    /* f0 */ M, M, M, M, M, M, M, M, M, M, M, M, M, M, M, BAD,
];

#[derive(Default)]
struct Prefixes {
    opsz16: bool,
    addr32: bool,
    seg: Segment,
    rep_f2: bool,
    rep_f3: bool,
    lock: bool,
    rex: u8,
    rex_off: Option<u8>,
}

impl Prefixes {
    fn rex_w(&self) -> bool {
        self.rex & 0x08 != 0
    }
    fn rex_r(&self) -> u8 {
        (self.rex >> 2) & 1
    }
    fn rex_x(&self) -> u8 {
        (self.rex >> 1) & 1
    }
    fn rex_b(&self) -> u8 {
        self.rex & 1
    }
}

struct ModRmInfo {
    modbits: u8,
    /// ModRM reg field with the REX extension applied.
    reg: u8,
    /// ModRM rm field with the REX extension applied; meaningful as a
    /// register when `modbits == 3` or no SIB redirection happened.
    rm: u8,
    /// Structured memory operand when `modbits != 3`.
    mem: Option<MemRef>,
    modrm_off: u8,
    /// Offset of a 32-bit displacement, when one was consumed.
    disp32_off: Option<u8>,
    rip_relative: bool,
}

fn parse_modrm(
    code: &[u8],
    pos: &mut usize,
    pfx: &Prefixes,
    pc: u64,
) -> Result<ModRmInfo, MangleError> {
    let undecodable = || MangleError::UndecodableInstruction(pc);
    let modrm_off = *pos as u8;
    let byte = *code.get(*pos).ok_or_else(undecodable)?;
    *pos += 1;
    let modbits = byte >> 6;
    let reg = ((byte >> 3) & 0b111) | (pfx.rex_r() << 3);
    let rm_low = byte & 0b111;
    let mut rm = rm_low | (pfx.rex_b() << 3);
    if modbits == 3 {
        return Ok(ModRmInfo {
            modbits,
            reg,
            rm,
            mem: None,
            modrm_off,
            disp32_off: None,
            rip_relative: false,
        });
    }

    let mut base = Base::Reg(rm);
    let mut index = None;
    let mut scale = 1u8;
    let mut rip_relative = false;
    if rm_low == 0b100 {
        let sib = *code.get(*pos).ok_or_else(undecodable)?;
        *pos += 1;
        let sib_index = ((sib >> 3) & 0b111) | (pfx.rex_x() << 3);
        let sib_base = (sib & 0b111) | (pfx.rex_b() << 3);
        if sib_index != RSP as u8 {
            index = Some(sib_index);
            scale = 1 << (sib >> 6);
        }
        if sib & 0b111 == 0b101 && modbits == 0 {
            base = Base::None;
        } else {
            base = Base::Reg(sib_base);
        }
        rm = sib_base;
    } else if rm_low == 0b101 && modbits == 0 {
        base = Base::Rip;
        rip_relative = true;
    }

    let mut disp = 0i32;
    let mut disp32_off = None;
    let need_disp32 = modbits == 2 || rip_relative || matches!(base, Base::None);
    if modbits == 1 {
        let b = *code.get(*pos).ok_or_else(undecodable)?;
        disp = b as i8 as i32;
        *pos += 1;
    } else if need_disp32 {
        if code.len() < *pos + 4 {
            return Err(undecodable());
        }
        disp32_off = Some(*pos as u8);
        disp = LittleEndian::read_i32(&code[*pos..]);
        *pos += 4;
    }

    Ok(ModRmInfo {
        modbits,
        reg,
        rm,
        mem: Some(MemRef { base, index, scale, disp, seg: pfx.seg }),
        modrm_off,
        disp32_off,
        rip_relative,
    })
}

fn operand_size(pfx: &Prefixes) -> OperandSize {
    if pfx.rex_w() {
        OperandSize::S64
    } else if pfx.opsz16 {
        OperandSize::S16
    } else {
        OperandSize::S32
    }
}

/// Conservative sentinel: every register treated as written.
const WRITES_ALL: u16 = 0xffff;

fn reg_bit(reg: u8) -> u16 {
    1 << reg
}

/// Decode one instruction starting at `code[0]`, which sits at application
/// or cache address `pc`. Returns the node and the encoded length.
pub fn decode(code: &[u8], pc: u64) -> Result<(Instruction, usize), MangleError> {
    let undecodable = || MangleError::UndecodableInstruction(pc);
    let mut pfx = Prefixes::default();
    let mut pos = 0usize;

    loop {
        if pos >= code.len() || pos >= MAX_INSTR_LEN {
            return Err(undecodable());
        }
        match code[pos] {
            0x26 | 0x2e | 0x36 | 0x3e => {}
            0x64 => pfx.seg = Segment::Fs,
            0x65 => pfx.seg = Segment::Gs,
            0x66 => pfx.opsz16 = true,
            0x67 => pfx.addr32 = true,
            0xf0 => pfx.lock = true,
            0xf2 => pfx.rep_f2 = true,
            0xf3 => pfx.rep_f3 = true,
            _ => break,
        }
        pos += 1;
    }
    if code[pos] & 0xf0 == 0x40 {
        pfx.rex = code[pos];
        pfx.rex_off = Some(pos as u8);
        pos += 1;
        if pos >= code.len() {
            return Err(undecodable());
        }
    }

    // Opcode map selection, including the VEX escapes.
    let mut vex = false;
    let (map, opcode, mut flags) = match code[pos] {
        0x0f => {
            pos += 1;
            let b2 = *code.get(pos).ok_or_else(undecodable)?;
            pos += 1;
            match b2 {
                0x38 => {
                    let b3 = *code.get(pos).ok_or_else(undecodable)?;
                    pos += 1;
                    (2u8, b3, M)
                }
                0x3a => {
                    let b3 = *code.get(pos).ok_or_else(undecodable)?;
                    pos += 1;
                    (3u8, b3, M | I8)
                }
                _ => (1u8, b2, TWO_BYTE[b2 as usize]),
            }
        }
        0xc4 => {
            // Three-byte VEX: two payload bytes select the opcode map.
            let p0 = *code.get(pos + 1).ok_or_else(undecodable)?;
            let o = *code.get(pos + 3).ok_or_else(undecodable)?;
            pos += 4;
            vex = true;
            match p0 & 0x1f {
                1 => (1u8, o, TWO_BYTE[o as usize] & (M | I8)),
                2 => (2u8, o, M),
                3 => (3u8, o, M | I8),
                _ => return Err(undecodable()),
            }
        }
        0xc5 => {
            let o = *code.get(pos + 2).ok_or_else(undecodable)?;
            pos += 3;
            vex = true;
            (1u8, o, TWO_BYTE[o as usize] & (M | I8))
        }
        b => {
            pos += 1;
            (0u8, b, ONE_BYTE[b as usize])
        }
    };
    if flags & (BAD | PFX | REXP) != 0 {
        return Err(undecodable());
    }

    let modrm = if flags & M != 0 {
        Some(parse_modrm(code, &mut pos, &pfx, pc)?)
    } else {
        None
    };
    if flags & GI != 0 {
        if let Some(m) = &modrm {
            if m.reg & 0b111 < 2 {
                flags |= if opcode == 0xf6 { I8 } else { IZ };
            }
        }
    }

    // Immediate and branch-displacement widths.
    let imm_len = if flags & I8 != 0 {
        1
    } else if flags & I16 != 0 {
        2
    } else if flags & I16I8 != 0 {
        3
    } else if flags & IZ != 0 {
        if pfx.opsz16 { 2 } else { 4 }
    } else if flags & IV != 0 {
        if pfx.rex_w() {
            8
        } else if pfx.opsz16 {
            2
        } else {
            4
        }
    } else if flags & MOF != 0 {
        if pfx.addr32 { 4 } else { 8 }
    } else {
        0
    };
    let rel_len = if flags & R8 != 0 {
        1
    } else if flags & R32 != 0 {
        4
    } else {
        0
    };
    let total = pos + imm_len + rel_len;
    if total > code.len() || total > MAX_INSTR_LEN {
        return Err(undecodable());
    }

    let imm: i64 = match imm_len {
        1 => code[pos] as i8 as i64,
        2 => LittleEndian::read_i16(&code[pos..]) as i64,
        3 => LittleEndian::read_i16(&code[pos..]) as i64, // enter: imm16 part
        4 => LittleEndian::read_i32(&code[pos..]) as i64,
        8 => LittleEndian::read_i64(&code[pos..]),
        _ => 0,
    };
    let rel: i64 = match rel_len {
        1 => code[pos + imm_len] as i8 as i64,
        4 => LittleEndian::read_i32(&code[pos + imm_len..]) as i64,
        _ => 0,
    };
    let branch_target = pc.wrapping_add(total as u64).wrapping_add(rel as u64);

    let mut insn = Instruction {
        translation: Some(pc),
        ..Instruction::DEFAULT
    };
    classify(map, opcode, &pfx, modrm.as_ref(), imm, branch_target, vex, &mut insn);
    if let Some(m) = &modrm {
        if m.rip_relative {
            if let Some(disp_off) = m.disp32_off {
                let disp = match &m.mem {
                    Some(mem) => mem.disp,
                    None => 0,
                };
                insn.rip_rel = Some(RipRel {
                    target: pc.wrapping_add(total as u64).wrapping_add(disp as i64 as u64),
                    rex_off: pfx.rex_off,
                    modrm_off: m.modrm_off,
                    disp_off,
                });
            }
        }
    }

    // Branches are re-encoded at their cache position; everything else
    // re-emits its original bytes when left untouched.
    let is_relative = rel_len != 0;
    if !is_relative {
        insn.raw = Some(code[..total].to_vec().into_boxed_slice());
    }
    Ok((insn, total))
}

#[allow(clippy::too_many_arguments)]
fn classify(
    map: u8,
    opcode: u8,
    pfx: &Prefixes,
    modrm: Option<&ModRmInfo>,
    imm: i64,
    branch_target: u64,
    vex: bool,
    insn: &mut Instruction,
) {
    let size = operand_size(pfx);
    // 32-bit addressing falls outside the structural subset; keep raw.
    let structural_ok = !pfx.addr32;
    let other = |op: u8| Opcode::Other(((map as u16) << 8) | op as u16);

    // Helper closures over the ModRM operand shape.
    let rm_writes = |m: &ModRmInfo, insn: &mut Instruction| {
        if m.modbits == 3 {
            insn.writes |= reg_bit(m.rm);
        } else {
            insn.mem_writes = 1;
        }
    };

    insn.opcode = other(opcode);
    insn.size = size;

    match map {
        0 => match opcode {
            // ALU families: add or adc sbb and sub xor cmp.
            0x00..=0x3d => {
                let family = opcode >> 3;
                let form = opcode & 0b111;
                let m = modrm;
                match form {
                    0 | 1 => {
                        if let Some(m) = m {
                            // cmp writes nothing.
                            if family != 7 {
                                rm_writes(m, insn);
                            }
                            // sub/xor of a register with itself is a
                            // constant zero load.
                            if (family == 5 || family == 6)
                                && m.modbits == 3
                                && m.rm == m.reg
                                && structural_ok
                            {
                                insn.opcode = Opcode::LoadImm;
                                insn.dst = Operand::Reg(m.rm);
                                insn.src = Operand::Imm(0);
                            }
                        }
                    }
                    2 | 3 => {
                        if let Some(m) = m {
                            if family != 7 {
                                insn.writes |= reg_bit(m.reg);
                            }
                            if (family == 5 || family == 6)
                                && m.modbits == 3
                                && m.rm == m.reg
                                && structural_ok
                            {
                                insn.opcode = Opcode::LoadImm;
                                insn.dst = Operand::Reg(m.reg);
                                insn.src = Operand::Imm(0);
                            }
                        }
                    }
                    4 | 5 => {
                        if family != 7 {
                            insn.writes |= reg_bit(RAX);
                        }
                    }
                    _ => {}
                }
            }
            0x50..=0x57 => {
                let reg = (opcode & 0b111) | (pfx.rex_b() << 3);
                insn.opcode = Opcode::Push;
                insn.size = OperandSize::S64;
                insn.src = Operand::Reg(reg);
                insn.writes = reg_bit(RSP);
                insn.mem_writes = 1;
            }
            0x58..=0x5f => {
                let reg = (opcode & 0b111) | (pfx.rex_b() << 3);
                insn.opcode = Opcode::Pop;
                insn.size = OperandSize::S64;
                insn.dst = Operand::Reg(reg);
                insn.writes = reg_bit(reg) | reg_bit(RSP);
            }
            0x63 => {
                if let Some(m) = modrm {
                    insn.writes |= reg_bit(m.reg);
                }
            }
            0x68 | 0x6a => {
                insn.opcode = Opcode::PushImm;
                insn.size = OperandSize::S64;
                insn.src = Operand::Imm(imm);
                insn.writes = reg_bit(RSP);
                insn.mem_writes = 1;
            }
            0x69 | 0x6b => {
                if let Some(m) = modrm {
                    insn.writes |= reg_bit(m.reg);
                }
            }
            0x70..=0x7f => {
                insn.opcode = Opcode::JccShort(opcode & 0x0f);
                insn.src = Operand::Pc(branch_target);
            }
            0x80 | 0x81 | 0x83 => {
                if let Some(m) = modrm {
                    if m.reg & 0b111 != 7 {
                        rm_writes(m, insn);
                    }
                }
            }
            0x86 | 0x87 => {
                if let Some(m) = modrm {
                    insn.writes |= reg_bit(m.reg);
                    rm_writes(m, insn);
                }
            }
            0x88 | 0x89 => {
                if let Some(m) = modrm {
                    let sz = if opcode == 0x88 { OperandSize::S8 } else { size };
                    if m.modbits == 3 {
                        insn.writes |= reg_bit(m.rm);
                        if structural_ok && opcode == 0x89 {
                            insn.opcode = Opcode::MovRR;
                            insn.size = sz;
                            insn.dst = Operand::Reg(m.rm);
                            insn.src = Operand::Reg(m.reg);
                        }
                    } else {
                        insn.mem_writes = 1;
                        if structural_ok {
                            insn.opcode = Opcode::Store;
                            insn.size = sz;
                            insn.dst = Operand::Mem(m.mem.unwrap_or(MemRef::base_disp(RAX, 0)));
                            insn.src = Operand::Reg(m.reg);
                        }
                    }
                }
            }
            // The byte-width 8a form merges into the low register byte;
            // it stays unmodeled so rewrites never widen it.
            0x8a => {
                if let Some(m) = modrm {
                    insn.writes |= reg_bit(m.reg);
                }
            }
            0x8b => {
                if let Some(m) = modrm {
                    insn.writes |= reg_bit(m.reg);
                    if m.modbits == 3 {
                        if structural_ok {
                            insn.opcode = Opcode::MovRR;
                            insn.dst = Operand::Reg(m.reg);
                            insn.src = Operand::Reg(m.rm);
                        }
                    } else if structural_ok {
                        insn.opcode = Opcode::Load;
                        insn.dst = Operand::Reg(m.reg);
                        insn.src = Operand::Mem(m.mem.unwrap_or(MemRef::base_disp(RAX, 0)));
                    }
                }
            }
            0x8d => {
                if let Some(m) = modrm {
                    insn.writes |= reg_bit(m.reg);
                    if m.modbits != 3 && structural_ok {
                        insn.opcode = Opcode::Lea;
                        insn.size = OperandSize::S64;
                        insn.dst = Operand::Reg(m.reg);
                        insn.src = Operand::Mem(m.mem.unwrap_or(MemRef::base_disp(RAX, 0)));
                    }
                }
            }
            0x8f => {
                if let Some(m) = modrm {
                    rm_writes(m, insn);
                    insn.writes |= reg_bit(RSP);
                }
            }
            0x90 => {
                if pfx.rex_b() == 0 && !pfx.rep_f3 {
                    insn.opcode = Opcode::Nop;
                } else {
                    // xchg r8 / pause
                    insn.writes = if pfx.rex_b() != 0 {
                        reg_bit(RAX) | reg_bit(8)
                    } else {
                        0
                    };
                }
            }
            0x91..=0x97 => {
                let reg = (opcode & 0b111) | (pfx.rex_b() << 3);
                insn.writes = reg_bit(RAX) | reg_bit(reg);
            }
            0x98 => insn.writes = reg_bit(RAX),
            0x99 => insn.writes = reg_bit(RDX),
            0x9c => {
                insn.opcode = Opcode::Pushf;
                insn.size = OperandSize::S64;
                insn.writes = reg_bit(RSP);
                insn.mem_writes = 1;
            }
            0x9d => {
                insn.opcode = Opcode::Popf;
                insn.size = OperandSize::S64;
                insn.writes = reg_bit(RSP);
            }
            0x9f => insn.writes = reg_bit(RAX),
            0xa0 | 0xa1 => insn.writes = reg_bit(RAX),
            0xa2 | 0xa3 => insn.mem_writes = 1,
            0xa4 | 0xa5 => {
                insn.mem_writes = 1;
                insn.writes = reg_bit(RSI) | reg_bit(RDI) | rep_counter(pfx);
            }
            0xa6 | 0xa7 => insn.writes = reg_bit(RSI) | reg_bit(RDI) | rep_counter(pfx),
            0xaa | 0xab => {
                insn.mem_writes = 1;
                insn.writes = reg_bit(RDI) | rep_counter(pfx);
            }
            0xac | 0xad => insn.writes = reg_bit(RAX) | reg_bit(RSI) | rep_counter(pfx),
            0xae | 0xaf => insn.writes = reg_bit(RDI) | rep_counter(pfx),
            0xb0..=0xb7 => {
                insn.writes = reg_bit((opcode & 0b111) | (pfx.rex_b() << 3));
            }
            0xb8..=0xbf => {
                let reg = (opcode & 0b111) | (pfx.rex_b() << 3);
                insn.writes = reg_bit(reg);
                if structural_ok && !pfx.opsz16 {
                    insn.opcode = Opcode::LoadImm;
                    insn.dst = Operand::Reg(reg);
                    // Without REX.W the 32-bit form zero-extends.
                    let value = if pfx.rex_w() { imm } else { imm as u32 as i64 };
                    insn.src = Operand::Imm(value);
                }
            }
            0xc0 | 0xc1 | 0xd0 | 0xd1 | 0xd2 | 0xd3 => {
                if let Some(m) = modrm {
                    rm_writes(m, insn);
                }
            }
            0xc2 => {
                insn.opcode = Opcode::Ret;
                insn.src = Operand::Imm(imm);
                insn.writes = reg_bit(RSP);
            }
            0xc3 => {
                insn.opcode = Opcode::Ret;
                insn.writes = reg_bit(RSP);
            }
            0xc6 | 0xc7 => {
                if let Some(m) = modrm {
                    if m.reg & 0b111 == 0 {
                        if m.modbits == 3 {
                            insn.writes |= reg_bit(m.rm);
                            if structural_ok && opcode == 0xc7 && !pfx.opsz16 {
                                insn.opcode = Opcode::LoadImm;
                                insn.dst = Operand::Reg(m.rm);
                                // Sign-extends under REX.W, zero-extends as
                                // a 32-bit destination otherwise.
                                let value =
                                    if pfx.rex_w() { imm } else { imm as u32 as i64 };
                                insn.src = Operand::Imm(value);
                            }
                        } else {
                            insn.mem_writes = 1;
                            if structural_ok {
                                insn.opcode = Opcode::StoreImm;
                                insn.size =
                                    if opcode == 0xc6 { OperandSize::S8 } else { size };
                                insn.dst =
                                    Operand::Mem(m.mem.unwrap_or(MemRef::base_disp(RAX, 0)));
                                insn.src = Operand::Imm(imm);
                            }
                        }
                    }
                }
            }
            0xc8 => {
                insn.writes = reg_bit(RSP) | reg_bit(RBP);
                insn.mem_writes = 1;
            }
            0xc9 => insn.writes = reg_bit(RSP) | reg_bit(RBP),
            0xcc => insn.opcode = Opcode::Int(3),
            0xcd => insn.opcode = Opcode::Int(imm as u8),
            0xd7 => insn.writes = reg_bit(RAX),
            0xd8..=0xdf => {
                if let Some(m) = modrm {
                    if m.modbits != 3 && matches!(m.reg & 0b111, 2 | 3 | 6 | 7) {
                        insn.mem_writes = 1;
                    }
                }
            }
            0xe0..=0xe2 => {
                // loop family decrements rcx; left out of the branch subset.
                insn.writes = reg_bit(RCX);
            }
            0xe3 => {
                insn.opcode = Opcode::Jecxz;
                insn.size = if pfx.addr32 { OperandSize::S32 } else { OperandSize::S64 };
                insn.src = Operand::Pc(branch_target);
            }
            0xe4 | 0xe5 | 0xec | 0xed => insn.writes = reg_bit(RAX),
            0xe8 => {
                insn.opcode = Opcode::Call;
                insn.src = Operand::Pc(branch_target);
                insn.writes = reg_bit(RSP);
                insn.mem_writes = 1;
            }
            0xe9 => {
                insn.opcode = Opcode::Jmp;
                insn.src = Operand::Pc(branch_target);
            }
            0xeb => {
                insn.opcode = Opcode::JmpShort;
                insn.src = Operand::Pc(branch_target);
            }
            0xf6 | 0xf7 => {
                if let Some(m) = modrm {
                    match m.reg & 0b111 {
                        2 | 3 => rm_writes(m, insn),
                        4 | 5 | 6 | 7 => {
                            insn.writes = reg_bit(RAX) | reg_bit(RDX);
                        }
                        _ => {}
                    }
                }
            }
            0xfe => {
                if let Some(m) = modrm {
                    if m.reg & 0b111 < 2 {
                        rm_writes(m, insn);
                    }
                }
            }
            0xff => {
                if let Some(m) = modrm {
                    match m.reg & 0b111 {
                        0 | 1 => rm_writes(m, insn),
                        2 | 4 => {
                            let ind = if m.modbits == 3 {
                                Operand::Reg(m.rm)
                            } else {
                                Operand::Mem(m.mem.unwrap_or(MemRef::base_disp(RAX, 0)))
                            };
                            if m.reg & 0b111 == 2 {
                                insn.opcode = Opcode::CallInd;
                                insn.writes = reg_bit(RSP);
                                insn.mem_writes = 1;
                            } else {
                                insn.opcode = Opcode::JmpInd;
                            }
                            insn.src = ind;
                        }
                        6 => {
                            insn.writes = reg_bit(RSP);
                            insn.mem_writes = 1;
                        }
                        _ => {}
                    }
                }
            }
            _ => {}
        },
        1 => match opcode {
            0x00 => {
                if let Some(m) = modrm {
                    // sldt/str store forms.
                    if m.modbits != 3 && m.reg & 0b111 < 2 {
                        insn.mem_writes = 1;
                    } else if m.modbits == 3 && m.reg & 0b111 < 2 {
                        insn.writes |= reg_bit(m.rm);
                    }
                }
            }
            0x01 => {
                if let Some(m) = modrm {
                    if m.modbits == 3 {
                        // xgetbv/rdtscp and friends clobber implicitly.
                        insn.writes = WRITES_ALL;
                    } else if matches!(m.reg & 0b111, 0 | 1) {
                        insn.mem_writes = 1;
                    }
                }
            }
            0x02 | 0x03 => {
                if let Some(m) = modrm {
                    insn.writes |= reg_bit(m.reg);
                }
            }
            0x05 => {
                insn.opcode = Opcode::Syscall;
                insn.writes = reg_bit(RAX) | reg_bit(RCX) | reg_bit(11);
            }
            0x50 | 0xd7 => {
                // movmskps / pmovmskb land in a general register.
                if let Some(m) = modrm {
                    insn.writes |= reg_bit(m.reg);
                }
            }
            0x11 | 0x13 | 0x17 | 0x29 | 0x2b => {
                if let Some(m) = modrm {
                    if m.modbits != 3 {
                        insn.mem_writes = 1;
                    }
                }
            }
            0x1f => {
                insn.opcode = Opcode::NopModrm;
                if let Some(m) = modrm {
                    if let Some(mem) = m.mem {
                        insn.src = Operand::Mem(mem);
                    }
                }
            }
            0x20 | 0x21 => {
                if let Some(m) = modrm {
                    insn.writes |= reg_bit(m.rm);
                }
            }
            0x2c | 0x2d => {
                if let Some(m) = modrm {
                    insn.writes |= reg_bit(m.reg);
                }
            }
            0x31 | 0x32 | 0x33 => insn.writes = reg_bit(RAX) | reg_bit(RDX),
            0x40..=0x4f => {
                if let Some(m) = modrm {
                    insn.writes |= reg_bit(m.reg);
                }
            }
            0x7e => {
                if let Some(m) = modrm {
                    if m.modbits != 3 && pfx.opsz16 && !pfx.rep_f3 {
                        insn.mem_writes = 1;
                    } else if pfx.opsz16 && m.modbits == 3 && !pfx.rep_f3 {
                        insn.writes |= reg_bit(m.rm);
                    }
                }
            }
            0x7f => {
                if let Some(m) = modrm {
                    if m.modbits != 3 {
                        insn.mem_writes = 1;
                    }
                }
            }
            0x80..=0x8f => {
                insn.opcode = Opcode::Jcc(opcode & 0x0f);
                insn.src = Operand::Pc(branch_target);
            }
            0x90..=0x9f => {
                if let Some(m) = modrm {
                    if m.modbits == 3 {
                        insn.writes |= reg_bit(m.rm);
                    } else {
                        insn.mem_writes = 1;
                    }
                }
            }
            0xa0 | 0xa8 => {
                insn.writes = reg_bit(RSP);
                insn.mem_writes = 1;
            }
            0xa1 | 0xa9 => insn.writes = reg_bit(RSP),
            0xa2 => insn.writes = reg_bit(RAX) | reg_bit(RBX) | reg_bit(RCX) | reg_bit(RDX),
            0xa4 | 0xa5 | 0xab | 0xac | 0xad | 0xb3 | 0xbb => {
                if let Some(m) = modrm {
                    rm_writes(m, insn);
                }
            }
            0xaf | 0xb8 | 0xbc | 0xbd => {
                if let Some(m) = modrm {
                    insn.writes |= reg_bit(m.reg);
                }
            }
            0xb0 | 0xb1 => {
                if let Some(m) = modrm {
                    insn.writes |= reg_bit(RAX);
                    rm_writes(m, insn);
                }
            }
            0xb6 | 0xb7 => {
                if let Some(m) = modrm {
                    insn.writes |= reg_bit(m.reg);
                    if m.modbits != 3 && structural_ok {
                        insn.opcode = Opcode::Load;
                        insn.size =
                            if opcode == 0xb6 { OperandSize::S8 } else { OperandSize::S16 };
                        insn.dst = Operand::Reg(m.reg);
                        insn.src = Operand::Mem(m.mem.unwrap_or(MemRef::base_disp(RAX, 0)));
                    }
                }
            }
            0xba => {
                if let Some(m) = modrm {
                    if m.reg & 0b111 >= 5 {
                        rm_writes(m, insn);
                    }
                }
            }
            0xbe | 0xbf => {
                if let Some(m) = modrm {
                    insn.writes |= reg_bit(m.reg);
                }
            }
            0xc0 | 0xc1 => {
                if let Some(m) = modrm {
                    insn.writes |= reg_bit(m.reg);
                    rm_writes(m, insn);
                }
            }
            0xc3 => {
                if let Some(m) = modrm {
                    if m.modbits != 3 {
                        insn.mem_writes = 1;
                    }
                }
            }
            0xc5 => {
                if let Some(m) = modrm {
                    insn.writes |= reg_bit(m.reg);
                }
            }
            0xc7 => {
                if let Some(m) = modrm {
                    if m.modbits == 3 {
                        insn.writes |= reg_bit(m.rm);
                    } else {
                        insn.mem_writes = 1;
                        insn.writes = reg_bit(RAX) | reg_bit(RDX);
                    }
                }
            }
            0xc8..=0xcf => {
                insn.writes = reg_bit((opcode & 0b111) | (pfx.rex_b() << 3));
            }
            0xd6 | 0xe7 => {
                if let Some(m) = modrm {
                    if m.modbits != 3 {
                        insn.mem_writes = 1;
                    }
                }
            }
            _ => {}
        },
        2 => match opcode {
            // movbe load / crc32 write the reg operand; movbe store hits
            // memory.
            0xf0 => {
                if let Some(m) = modrm {
                    insn.writes |= reg_bit(m.reg);
                }
            }
            0xf1 => {
                if let Some(m) = modrm {
                    if pfx.rep_f2 {
                        insn.writes |= reg_bit(m.reg);
                    } else if m.modbits != 3 {
                        insn.mem_writes = 1;
                    }
                }
            }
            // BMI under VEX names a non-destructive destination the
            // tables do not carry, so treat every register as clobbered.
            0xf2..=0xf7 if vex => insn.writes = WRITES_ALL,
            _ => {}
        },
        3 => {
            // pextr family writes through the rm operand.
            if matches!(opcode, 0x14..=0x17) {
                if let Some(m) = modrm {
                    rm_writes(m, insn);
                }
            }
            if opcode == 0xf0 && vex {
                // rorx
                insn.writes = WRITES_ALL;
            }
        }
        _ => {}
    }
}

fn rep_counter(pfx: &Prefixes) -> u16 {
    if pfx.rep_f2 || pfx.rep_f3 {
        reg_bit(RCX)
    } else {
        0
    }
}

/// Segment override carried by an encoding, if any.
pub fn seg_override(code: &[u8]) -> Option<Segment> {
    for &b in code.iter().take(MAX_INSTR_LEN) {
        match b {
            0x64 => return Some(Segment::Fs),
            0x65 => return Some(Segment::Gs),
            0x26 | 0x2e | 0x36 | 0x3e | 0x66 | 0x67 | 0xf0 | 0xf2 | 0xf3 => continue,
            _ => return None,
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one(code: &[u8], pc: u64) -> (Instruction, usize) {
        decode(code, pc).unwrap()
    }

    #[test]
    fn test_decode_mov_forms() {
        // mov rdi, rsi
        let (insn, len) = one(&[0x48, 0x89, 0xf7], 0x1000);
        assert_eq!(len, 3);
        assert_eq!(insn.opcode, Opcode::MovRR);
        assert!(insn.writes_reg(crate::insn::RDI));
        // mov rax, [rbp+0x10]
        let (insn, len) = one(&[0x48, 0x8b, 0x45, 0x10], 0x1000);
        assert_eq!(len, 4);
        assert_eq!(insn.opcode, Opcode::Load);
        // mov [rbx], rcx
        let (insn, len) = one(&[0x48, 0x89, 0x0b], 0x1000);
        assert_eq!(len, 3);
        assert_eq!(insn.opcode, Opcode::Store);
        assert!(insn.writes_memory());
    }

    #[test]
    fn test_decode_immediates() {
        // mov eax, 60
        let (insn, len) = one(&[0xb8, 0x3c, 0x00, 0x00, 0x00], 0);
        assert_eq!(len, 5);
        assert_eq!(insn.mov_constant(), Some((RAX, 60)));
        // movabs rax, imm64
        let (insn, len) = one(&[0x48, 0xb8, 1, 0, 0, 0, 0, 0, 0, 0x80], 0);
        assert_eq!(len, 10);
        assert_eq!(insn.mov_constant(), Some((RAX, i64::from_le_bytes([1, 0, 0, 0, 0, 0, 0, 0x80]))));
        // mov rax, -1 (sign-extended C7 form)
        let (insn, len) = one(&[0x48, 0xc7, 0xc0, 0xff, 0xff, 0xff, 0xff], 0);
        assert_eq!(len, 7);
        assert_eq!(insn.mov_constant(), Some((RAX, -1)));
        // xor eax, eax folds to a zero constant
        let (insn, len) = one(&[0x31, 0xc0], 0);
        assert_eq!(len, 2);
        assert_eq!(insn.mov_constant(), Some((RAX, 0)));
    }

    #[test]
    fn test_decode_branches() {
        // jmp short +2 at 0x100 targets 0x104
        let (insn, len) = one(&[0xeb, 0x02], 0x100);
        assert_eq!(len, 2);
        assert_eq!(insn.opcode, Opcode::JmpShort);
        assert_eq!(insn.target(), Some(Operand::Pc(0x104)));
        assert!(insn.raw.is_none());
        // jne near backward
        let (insn, len) = one(&[0x0f, 0x85, 0xfa, 0xff, 0xff, 0xff], 0x200);
        assert_eq!(len, 6);
        assert_eq!(insn.opcode, Opcode::Jcc(0x5));
        assert_eq!(insn.target(), Some(Operand::Pc(0x200)));
        // call rel32
        let (insn, len) = one(&[0xe8, 0x10, 0x00, 0x00, 0x00], 0x300);
        assert_eq!(len, 5);
        assert_eq!(insn.opcode, Opcode::Call);
        assert_eq!(insn.target(), Some(Operand::Pc(0x315)));
        // jecxz with the address-size prefix keeps its width
        let (insn, len) = one(&[0x67, 0xe3, 0x05], 0x400);
        assert_eq!(len, 3);
        assert_eq!(insn.opcode, Opcode::Jecxz);
        assert_eq!(insn.size, OperandSize::S32);
        assert_eq!(insn.target(), Some(Operand::Pc(0x408)));
    }

    #[test]
    fn test_decode_indirect_branches() {
        // call rax
        let (insn, _) = one(&[0xff, 0xd0], 0);
        assert_eq!(insn.opcode, Opcode::CallInd);
        assert_eq!(insn.src, Operand::Reg(RAX));
        // jmp [rax+8]
        let (insn, len) = one(&[0xff, 0x60, 0x08], 0);
        assert_eq!(len, 3);
        assert_eq!(insn.opcode, Opcode::JmpInd);
        assert_eq!(insn.src, Operand::Mem(MemRef::base_disp(RAX, 8)));
        // ret / ret imm16
        let (insn, _) = one(&[0xc3], 0);
        assert_eq!(insn.opcode, Opcode::Ret);
        let (insn, len) = one(&[0xc2, 0x10, 0x00], 0);
        assert_eq!(len, 3);
        assert_eq!(insn.src, Operand::Imm(0x10));
    }

    #[test]
    fn test_decode_syscall_and_interrupt() {
        let (insn, len) = one(&[0x0f, 0x05], 0);
        assert_eq!(len, 2);
        assert!(insn.is_syscall());
        let (insn, len) = one(&[0xcd, 0x80], 0);
        assert_eq!(len, 2);
        assert!(insn.is_syscall());
        let (insn, _) = one(&[0xcd, 0x03], 0);
        assert!(insn.is_interrupt());
    }

    #[test]
    fn test_decode_rip_relative() {
        // lea rax, [rip+0x10] at 0x1000, next pc 0x1007, target 0x1017
        let (insn, len) = one(&[0x48, 0x8d, 0x05, 0x10, 0x00, 0x00, 0x00], 0x1000);
        assert_eq!(len, 7);
        assert_eq!(insn.opcode, Opcode::Lea);
        let rr = insn.rip_rel.unwrap();
        assert_eq!(rr.target, 0x1017);
        assert_eq!(rr.disp_off, 3);
        assert_eq!(rr.rex_off, Some(0));
        // cmp dword [rip+disp], imm8: stays Other but records the operand
        let (insn, len) = one(&[0x83, 0x3d, 0x00, 0x01, 0x00, 0x00, 0x07], 0x2000);
        assert_eq!(len, 7);
        assert!(matches!(insn.opcode, Opcode::Other(_)));
        assert_eq!(insn.rip_rel.unwrap().target, 0x2107);
    }

    #[test]
    fn test_decode_sib_and_lengths() {
        // mov rax, [rbx + rcx*8 + 0x40]
        let (insn, len) = one(&[0x48, 0x8b, 0x44, 0xcb, 0x40], 0);
        assert_eq!(len, 5);
        assert_eq!(
            insn.src,
            Operand::Mem(MemRef {
                base: Base::Reg(RBX),
                index: Some(RCX),
                scale: 8,
                disp: 0x40,
                seg: Segment::None,
            })
        );
        // push/pop
        let (insn, len) = one(&[0x41, 0x54], 0);
        assert_eq!(len, 2);
        assert_eq!(insn.opcode, Opcode::Push);
        assert_eq!(insn.src, Operand::Reg(12));
        // seven-byte payload no-op
        let (insn, len) = one(&[0x0f, 0x1f, 0x80, 0x53, 0x30, 0x05, 0x53], 0);
        assert_eq!(len, 7);
        assert_eq!(insn.opcode, Opcode::NopModrm);
        assert_eq!(insn.src, Operand::Mem(MemRef::base_disp(RAX, 0x53053053)));
    }

    #[test]
    fn test_decode_segment_prefix_capture() {
        // mov rax, fs:[0x28]
        let (insn, len) = one(
            &[0x64, 0x48, 0x8b, 0x04, 0x25, 0x28, 0x00, 0x00, 0x00],
            0,
        );
        assert_eq!(len, 9);
        match insn.src {
            Operand::Mem(m) => {
                assert_eq!(m.seg, Segment::Fs);
                assert_eq!(m.disp, 0x28);
                assert_eq!(m.base, Base::None);
            }
            other => panic!("unexpected operand {other:?}"),
        }
        assert_eq!(seg_override(&[0x64, 0x48, 0x8b]), Some(Segment::Fs));
        assert_eq!(seg_override(&[0x48, 0x8b]), None);
    }

    #[test]
    fn test_decode_vex_length() {
        // vmovdqu ymm0, [rdi] : C5 FE 6F 07
        let (_, len) = one(&[0xc5, 0xfe, 0x6f, 0x07], 0);
        assert_eq!(len, 4);
        // vpalignr xmm1, xmm2, xmm3, 4 : C4 E3 69 0F CB 04
        let (_, len) = one(&[0xc4, 0xe3, 0x69, 0x0f, 0xcb, 0x04], 0);
        assert_eq!(len, 6);
    }

    #[test]
    fn test_decode_invalid() {
        assert!(decode(&[0x06], 0).is_err());
        assert!(decode(&[0xea, 0, 0, 0, 0, 0, 0], 0).is_err());
        assert!(decode(&[0x48], 0).is_err());
    }

    #[test]
    fn test_raw_preserved_for_unmodeled() {
        // bsf rax, rcx stays Other with raw bytes for re-emission.
        let bytes = [0x48, 0x0f, 0xbc, 0xc1];
        let (insn, len) = one(&bytes, 0);
        assert_eq!(len, 4);
        assert!(matches!(insn.opcode, Opcode::Other(_)));
        assert_eq!(insn.raw.as_deref(), Some(&bytes[..]));
        assert!(insn.writes_reg(RAX));
    }
}
