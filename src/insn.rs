// Licensed under the Apache License, Version 2.0 <http://www.apache.org/licenses/LICENSE-2.0> or
// the MIT license <http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Architecture-neutral instruction node: registers, operands, opcodes and the
//! per-instruction flags the mangling passes rely on.

pub const RAX: u8 = 0;
pub const RCX: u8 = 1;
pub const RDX: u8 = 2;
pub const RBX: u8 = 3;
pub const RSP: u8 = 4;
pub const RBP: u8 = 5;
pub const RSI: u8 = 6;
pub const RDI: u8 = 7;
pub const R8: u8 = 8;
pub const R9: u8 = 9;
pub const R10: u8 = 10;
pub const R11: u8 = 11;
pub const R12: u8 = 12;
pub const R13: u8 = 13;
pub const R14: u8 = 14;
pub const R15: u8 = 15;

/// Number of general-purpose registers.
pub const GPR_COUNT: usize = 16;

/// Register holding the system-call number at a syscall instruction.
pub const REG_SYSNUM: u8 = RAX;

/// Scratch register used for indirect transfers to unreachable callees.
/// Instrumentation callees must not rely on its value across a call.
pub const REG_CALL_SCRATCH: u8 = R11;

/// Operand and operation widths.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperandSize {
    S0 = 0,
    S8 = 8,
    S16 = 16,
    S32 = 32,
    S64 = 64,
}

/// Segment override for memory operands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Segment {
    /// No override, default segment.
    None,
    /// `fs:`, the application's library TLS segment on Linux x86-64.
    Fs,
    /// `gs:`, reserved for the engine's own thread-local storage.
    Gs,
}

impl Default for Segment {
    fn default() -> Self {
        Segment::None
    }
}

/// Base of a memory operand.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Base {
    /// Absolute displacement only.
    None,
    /// Register base.
    Reg(u8),
    /// Instruction-pointer relative.
    Rip,
}

/// Memory reference: `seg:[base + index * scale + disp]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemRef {
    pub base: Base,
    pub index: Option<u8>,
    pub scale: u8,
    pub disp: i32,
    pub seg: Segment,
}

impl MemRef {
    /// `[base + disp]`.
    pub const fn base_disp(base: u8, disp: i32) -> MemRef {
        MemRef { base: Base::Reg(base), index: None, scale: 1, disp, seg: Segment::None }
    }

    /// `seg:[disp]` with no base register.
    pub const fn seg_disp(seg: Segment, disp: i32) -> MemRef {
        MemRef { base: Base::None, index: None, scale: 1, disp, seg }
    }

    /// `[rip + disp]`.
    pub const fn rip_disp(disp: i32) -> MemRef {
        MemRef { base: Base::Rip, index: None, scale: 1, disp, seg: Segment::None }
    }

    pub fn uses_reg(&self, reg: u8) -> bool {
        matches!(self.base, Base::Reg(r) if r == reg) || self.index == Some(reg)
    }
}

/// Identity of a zero-length label within one instruction list.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LabelId(pub u32);

/// One operand slot. Control-transfer targets live in the source slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operand {
    None,
    Reg(u8),
    Mem(MemRef),
    Imm(i64),
    /// Absolute code address, application or engine routine.
    Pc(u64),
    /// Intra-list target, resolved when the fragment is laid out.
    Label(LabelId),
}

/// Branch category of a fragment exit, consumed by the linker and the
/// indirect-branch lookup dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BranchType {
    DirectJump,
    DirectCall,
    Return,
    IndirectCall,
    IndirectJump,
}

/// Operation kind. The set covers what mangling synthesizes plus what the
/// decoder classifies; anything else decodes as `Other` and is re-emitted
/// from its raw bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Opcode {
    /// Register-to-register move.
    MovRR,
    /// Memory-to-register load.
    Load,
    /// Register-to-memory store.
    Store,
    /// Immediate-to-register move, including the 64-bit form.
    LoadImm,
    /// Immediate-to-register move pinned to the full-width encoding so the
    /// emitted immediate can be patched in place.
    LoadImmWide,
    /// Immediate-to-memory store.
    StoreImm,
    Lea,
    Add,
    Sub,
    Push,
    PushImm,
    Pop,
    Pushf,
    Popf,
    /// Unconditional jump, 8-bit displacement.
    JmpShort,
    /// Unconditional jump, 32-bit displacement.
    Jmp,
    /// Conditional jump, 8-bit displacement; payload is the condition nibble.
    JccShort(u8),
    /// Conditional jump, 32-bit displacement; payload is the condition nibble.
    Jcc(u8),
    /// `jecxz`/`jrcxz`, 8-bit displacement only.
    Jecxz,
    /// Direct near call.
    Call,
    /// Indirect call through a register or memory operand.
    CallInd,
    /// Indirect jump through a register or memory operand.
    JmpInd,
    /// Near return; an immediate source holds the stack adjustment, if any.
    Ret,
    Syscall,
    /// Software interrupt; payload is the vector.
    Int(u8),
    Nop,
    /// Multi-byte no-op with a ModRM operand; carries a 32-bit payload in its
    /// displacement.
    NopModrm,
    /// Zero-length position marker.
    Label,
    /// Decoded application instruction outside the modeled set; first opcode
    /// byte(s) kept for diagnostics, bytes re-emitted verbatim.
    Other(u16),
}

/// Location of a rip-relative memory operand inside a decoded encoding,
/// kept so addressing fixups can rewrite the bytes in place.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RipRel {
    /// Absolute address the operand resolves to at its original location.
    pub target: u64,
    /// Byte offset of the REX prefix, when one is present.
    pub rex_off: Option<u8>,
    /// Byte offset of the ModRM byte.
    pub modrm_off: u8,
    /// Byte offset of the 32-bit displacement.
    pub disp_off: u8,
}

/// Per-instruction flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InsnFlags(u16);

impl InsnFlags {
    /// Inserted by the engine; never reported as original application code.
    pub const META: InsnFlags = InsnFlags(0x1);
    /// Fragment-terminating control transfer.
    pub const EXIT: InsnFlags = InsnFlags(0x2);
    /// Produced by the mangling pass itself (as opposed to the block builder
    /// or an instrumentation client).
    pub const OUR_MANGLING: InsnFlags = InsnFlags(0x4);

    pub const fn empty() -> InsnFlags {
        InsnFlags(0)
    }
    pub const fn contains(self, other: InsnFlags) -> bool {
        self.0 & other.0 == other.0
    }
    pub fn insert(&mut self, other: InsnFlags) {
        self.0 |= other.0;
    }
    pub fn remove(&mut self, other: InsnFlags) {
        self.0 &= !other.0;
    }
}

/// A single machine instruction or zero-length marker, owned by an
/// [`InstructionList`](crate::ilist::InstructionList).
///
/// Structural equality (`PartialEq`) compares opcode, size and operands only;
/// flags, translation and raw bytes are bookkeeping, not shape.
#[derive(Clone, Debug)]
pub struct Instruction {
    pub opcode: Opcode,
    pub size: OperandSize,
    pub dst: Operand,
    pub src: Operand,
    pub flags: InsnFlags,
    /// Application program counter this instruction corresponds to, for state
    /// reconstruction. `None` for meta instructions without a tag.
    pub translation: Option<u64>,
    /// Original encoding when this node was produced by the decoder. Cleared
    /// by any mutation of the operands; when present, encoding re-emits these
    /// bytes verbatim.
    pub raw: Option<Box<[u8]>>,
    /// Bitmap of general-purpose registers this instruction writes.
    pub writes: u16,
    /// Number of memory destinations (0 or 1 for the modeled set; stack
    /// pushes count theirs).
    pub mem_writes: u8,
    /// Exit branch category, set on fragment exits.
    pub exit_type: Option<BranchType>,
    /// Present when the decoded encoding carries a rip-relative memory
    /// operand.
    pub rip_rel: Option<RipRel>,
}

impl Instruction {
    pub const DEFAULT: Instruction = Instruction {
        opcode: Opcode::Nop,
        size: OperandSize::S0,
        dst: Operand::None,
        src: Operand::None,
        flags: InsnFlags::empty(),
        translation: None,
        raw: None,
        writes: 0,
        mem_writes: 0,
        exit_type: None,
        rip_rel: None,
    };

    pub fn is_meta(&self) -> bool {
        self.flags.contains(InsnFlags::META)
    }

    pub fn is_app(&self) -> bool {
        !self.is_meta()
    }

    pub fn set_meta(&mut self) {
        self.flags.insert(InsnFlags::META);
    }

    pub fn set_app(&mut self) {
        self.flags.remove(InsnFlags::META);
    }

    pub fn is_exit(&self) -> bool {
        self.flags.contains(InsnFlags::EXIT)
    }

    pub fn set_exit(&mut self, branch: BranchType) {
        self.flags.insert(InsnFlags::EXIT);
        self.exit_type = Some(branch);
    }

    pub fn is_our_mangling(&self) -> bool {
        self.flags.contains(InsnFlags::OUR_MANGLING)
    }

    pub fn is_label(&self) -> bool {
        matches!(self.opcode, Opcode::Label)
    }

    /// Label identity of a marker instruction.
    pub fn label_id(&self) -> Option<LabelId> {
        match (self.opcode, self.dst) {
            (Opcode::Label, Operand::Label(id)) => Some(id),
            _ => None,
        }
    }

    /// Any control-transfer instruction, direct or indirect.
    pub fn is_cti(&self) -> bool {
        matches!(
            self.opcode,
            Opcode::JmpShort
                | Opcode::Jmp
                | Opcode::JccShort(_)
                | Opcode::Jcc(_)
                | Opcode::Jecxz
                | Opcode::Call
                | Opcode::CallInd
                | Opcode::JmpInd
                | Opcode::Ret
        )
    }

    /// Conditional branch.
    pub fn is_cbr(&self) -> bool {
        matches!(self.opcode, Opcode::JccShort(_) | Opcode::Jcc(_) | Opcode::Jecxz)
    }

    /// Unconditional direct branch.
    pub fn is_ubr(&self) -> bool {
        matches!(self.opcode, Opcode::JmpShort | Opcode::Jmp)
    }

    /// Multi-way (indirect) branch, including returns.
    pub fn is_mbr(&self) -> bool {
        matches!(self.opcode, Opcode::CallInd | Opcode::JmpInd | Opcode::Ret)
    }

    pub fn is_call_direct(&self) -> bool {
        matches!(self.opcode, Opcode::Call)
    }

    pub fn is_call_indirect(&self) -> bool {
        matches!(self.opcode, Opcode::CallInd)
    }

    pub fn is_return(&self) -> bool {
        matches!(self.opcode, Opcode::Ret)
    }

    /// Short 8-bit-displacement branch form that cannot reach an arbitrary
    /// cache location.
    pub fn is_cti_short(&self) -> bool {
        matches!(self.opcode, Opcode::JmpShort | Opcode::JccShort(_) | Opcode::Jecxz)
    }

    /// System-call instruction (`syscall` or `int 0x80`).
    pub fn is_syscall(&self) -> bool {
        matches!(self.opcode, Opcode::Syscall | Opcode::Int(0x80))
    }

    /// Software interrupt that is not a system call.
    pub fn is_interrupt(&self) -> bool {
        matches!(self.opcode, Opcode::Int(v) if v != 0x80)
    }

    /// Control-transfer target, if this is a branch.
    pub fn target(&self) -> Option<Operand> {
        if self.is_cti() && !self.is_return() {
            Some(self.src)
        } else {
            None
        }
    }

    /// Redirects a branch. Invalidates raw bytes, the new form must be
    /// re-encoded.
    pub fn set_target(&mut self, target: Operand) {
        debug_assert!(self.is_cti() && !self.is_return());
        self.src = target;
        self.raw = None;
    }

    /// Immediate moved into a register, for `mov $imm, %reg` forms.
    pub fn mov_constant(&self) -> Option<(u8, i64)> {
        match (self.opcode, self.dst, self.src) {
            (Opcode::LoadImm | Opcode::LoadImmWide, Operand::Reg(r), Operand::Imm(v)) => {
                Some((r, v))
            }
            _ => None,
        }
    }

    pub fn writes_reg(&self, reg: u8) -> bool {
        self.writes & (1 << reg) != 0
    }

    pub fn writes_memory(&self) -> bool {
        self.mem_writes > 0
    }

    /// Total destination count: memory destinations plus written registers.
    pub fn destination_count(&self) -> u32 {
        u32::from(self.mem_writes) + self.writes.count_ones()
    }

    /// Whether the raw encoding still corresponds to the translation address,
    /// i.e. nothing resized or replaced the instruction since decode.
    pub fn raw_matches_translation(&self) -> bool {
        self.raw.is_some() && self.translation.is_some()
    }
}

impl PartialEq for Instruction {
    fn eq(&self, other: &Instruction) -> bool {
        self.opcode == other.opcode
            && self.size == other.size
            && self.dst == other.dst
            && self.src == other.src
    }
}

impl Eq for Instruction {}
