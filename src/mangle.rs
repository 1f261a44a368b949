// Licensed under the Apache License, Version 2.0 <http://www.apache.org/licenses/LICENSE-2.0> or
// the MIT license <http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The top-level mangling pass.
//!
//! A fragment may enter the code cache only after every instruction that
//! could slip out of the engine's control has been rewritten: direct calls
//! must not push return addresses the engine did not choose, indirect
//! branches must exit through the lookup routines, returns must pop into a
//! spilled register, syscalls grow a signal barrier, and restartable
//! sequences are split into an instrumented pass plus a native replay.
//! [`mangle`] drives all of that in a single forward walk; [`finalize`]
//! runs once more after cache placement to patch in the addresses that only
//! exist once the fragment has one.

use log::trace;

use crate::{
    config::Config,
    context::{ThreadContext, TlsSlot},
    decode::{decode, seg_override, MAX_INSTR_LEN},
    error::MangleError,
    fragment::{Fragment, FragmentFlags, RseqCsAllocator},
    ilist::{InsnRef, InstructionList},
    insn::{
        Base, BranchType, InsnFlags, Instruction, MemRef, Opcode, Operand, OperandSize, Segment,
        GPR_COUNT, RAX, RCX, RSP,
    },
    memory::AppMemory,
    rseq::{self, RseqRegions},
    syscall,
    x86::instruction_length,
};

/// Rewrites `ilist` in place until every instruction is safe to execute
/// from the code cache.
///
/// The walk keeps an explicit next cursor because an arm may delete the
/// current instruction, splice new ones in around it, or (for rseq) move
/// the resume point past a whole replayed region. Whatever an arm hands
/// back is where the walk continues; nothing earlier is revisited.
///
/// Arm order matters and is fixed: addressing fixups, then the rseq
/// region check, then segment fixups, then exit-branch normalization,
/// then syscalls and interrupts, then the control-transfer rewrites.
/// Later arms rely on seeing the final shape produced by earlier ones.
///
/// `mangle_calls` disables the call rewrites for callers that translate
/// call targets themselves. `record_translation` stamps every inserted
/// instruction with the application address being mangled, for fragments
/// that need full state-reconstruction coverage.
#[allow(clippy::too_many_arguments)]
pub fn mangle(
    ilist: &mut InstructionList,
    fragment: &mut Fragment,
    app: &AppMemory,
    rseq_regions: &RseqRegions,
    tcx: &ThreadContext,
    config: &Config,
    mangle_calls: bool,
    record_translation: bool,
) -> Result<(), MangleError> {
    trace!("mangling fragment {:#x}", fragment.tag);
    ilist.set_our_mangling(true);
    let result = mangle_list(
        ilist,
        fragment,
        app,
        rseq_regions,
        tcx,
        config,
        mangle_calls,
        record_translation,
    );
    if record_translation {
        ilist.set_translation_target(None);
    }
    ilist.set_our_mangling(false);
    result
}

#[allow(clippy::too_many_arguments)]
fn mangle_list(
    ilist: &mut InstructionList,
    fragment: &mut Fragment,
    app: &AppMemory,
    rseq_regions: &RseqRegions,
    tcx: &ThreadContext,
    config: &Config,
    mangle_calls: bool,
    record_translation: bool,
) -> Result<(), MangleError> {
    let mut cur = ilist.first();
    while let Some(instr) = cur {
        let mut next = ilist.next(instr)?;
        let xl8 = ilist.get(instr)?.translation;
        if record_translation {
            ilist.set_translation_target(xl8);
        }

        if let Some(replacement) = replace_rip_relative_lea(ilist, instr)? {
            // Resume at the replacement so the later arms see it; it has no
            // rip-relative operand left, so this cannot loop.
            cur = Some(replacement);
            continue;
        }

        let (is_app, ours) = {
            let insn = ilist.get(instr)?;
            (insn.is_app(), insn.is_our_mangling())
        };
        if is_app && !ours && !rseq_regions.is_empty() {
            if let Some(pc) = xl8 {
                if rseq_regions.overlaps(pc)
                    && rseq::mangle_rseq(
                        ilist,
                        fragment,
                        instr,
                        &mut next,
                        app,
                        rseq_regions,
                        tcx,
                        config,
                    )?
                {
                    // The store was deleted; the handle is gone with it.
                    cur = next;
                    continue;
                }
            }
        }

        if config.mangle_app_seg && is_app {
            mangle_segment_reference(ilist, instr, next)?;
        }

        normalize_exit_branch(ilist, instr, next, config)?;

        let (is_sys, is_int, plain) = {
            let insn = ilist.get(instr)?;
            (
                insn.is_syscall(),
                insn.is_interrupt(),
                !insn.is_cti() || insn.is_meta(),
            )
        };
        if is_sys {
            syscall::mangle_syscall(ilist, fragment, instr, config)?;
            cur = next;
            continue;
        }
        if is_int || plain {
            cur = next;
            continue;
        }

        let (is_dcall, is_icall, is_ret, is_mbr) = {
            let insn = ilist.get(instr)?;
            (
                insn.is_call_direct(),
                insn.is_call_indirect(),
                insn.is_return(),
                insn.is_mbr(),
            )
        };
        if is_dcall {
            mangle_direct_call(ilist, instr, mangle_calls, app)?;
        } else if is_icall {
            mangle_indirect_call(ilist, instr, next, mangle_calls, fragment, app, tcx)?;
        } else if is_ret {
            mangle_return(ilist, instr, next, fragment, tcx)?;
        } else if is_mbr {
            mangle_indirect_jump(ilist, instr, next, fragment, tcx)?;
        }
        cur = next;
    }
    Ok(())
}

/// Post-placement fixups, run once the fragment's cache address and body
/// bytes are final. Today that is only the rseq critical-section record;
/// fragments without an rseq endpoint return immediately.
pub fn finalize(
    ilist: &InstructionList,
    fragment: &Fragment,
    code: &mut [u8],
    allocator: &mut dyn RseqCsAllocator,
    config: &Config,
) -> Result<(), MangleError> {
    if config.rseq_assume_call || !fragment.flags.contains(FragmentFlags::HAS_RSEQ_ENDPOINT) {
        return Ok(());
    }
    rseq::mangle_rseq_finalize(ilist, fragment, code, allocator)
}

/// Inserts before `before`, appending when the insertion point is the end
/// of the list.
fn put(
    ilist: &mut InstructionList,
    before: Option<InsnRef>,
    insn: Instruction,
) -> Result<InsnRef, MangleError> {
    match before {
        Some(at) => ilist.insert_before(at, insn),
        None => Ok(ilist.append(insn)),
    }
}

/// An `lea` computing a rip-relative address produces the same value no
/// matter where its fragment lands, as long as the computation uses the
/// original location. Replacing it with an immediate load of the resolved
/// address removes the reachability constraint entirely. Plain rip-relative
/// memory operands are left alone here; their displacement is re-relativized
/// when the fragment is emitted.
fn replace_rip_relative_lea(
    ilist: &mut InstructionList,
    instr: InsnRef,
) -> Result<Option<InsnRef>, MangleError> {
    let (reg, target, translation, flags) = {
        let insn = ilist.get(instr)?;
        let rr = match (insn.opcode, insn.rip_rel) {
            (Opcode::Lea, Some(rr)) => rr,
            _ => return Ok(None),
        };
        let reg = match insn.dst {
            Operand::Reg(reg) => reg,
            _ => return Err(MangleError::MalformedInstruction),
        };
        (reg, rr.target, insn.translation, insn.flags)
    };
    trace!(
        "rip-relative lea at {:#x} becomes an immediate load",
        translation.unwrap_or(0)
    );
    let mut load = Instruction::load_immediate(OperandSize::S64, reg, target as i64);
    load.translation = translation;
    let new = ilist.insert_before(instr, load)?;
    // Inherit the flags wholesale: a replacement inside a native rseq copy
    // must keep the copy's mangling mark, while a fresh application lea
    // must not gain one before the rseq arm has seen the replacement.
    ilist.get_mut(new)?.flags = flags;
    ilist.remove(instr)?;
    Ok(Some(new))
}

/// Marks direct application branches that leave the fragment as exits and
/// widens the short forms, which cannot reach an arbitrary cache location.
fn normalize_exit_branch(
    ilist: &mut InstructionList,
    instr: InsnRef,
    next: Option<InsnRef>,
    config: &Config,
) -> Result<(), MangleError> {
    let (is_exit_branch, short) = {
        let insn = ilist.get(instr)?;
        let branch = insn.is_app()
            && (insn.is_cbr() || insn.is_ubr())
            && matches!(insn.target(), Some(Operand::Pc(_)));
        (branch, insn.is_cti_short())
    };
    if !is_exit_branch {
        return Ok(());
    }
    {
        let insn = ilist.get_mut(instr)?;
        if !insn.is_exit() {
            insn.set_exit(BranchType::DirectJump);
        }
    }
    if short && config.widen_exit_branches {
        widen_short_branch(ilist, instr, next)?;
    }
    Ok(())
}

/// A short branch reaches 127 bytes; a fragment exit must reach anywhere
/// in the cache. Jcc and jmp have near forms. Jecxz does not, so its taken
/// edge detours through a near jump placed right after it:
///
/// ```text
///   jecxz taken          ; condition unchanged, target now local
///   jmp short fall       ; not taken: skip the exit
/// taken:
///   jmp orig_target      ; the real exit, near form
/// fall:
/// ```
fn widen_short_branch(
    ilist: &mut InstructionList,
    instr: InsnRef,
    next: Option<InsnRef>,
) -> Result<(), MangleError> {
    let opcode = ilist.get(instr)?.opcode;
    match opcode {
        Opcode::JmpShort => {
            let insn = ilist.get_mut(instr)?;
            insn.opcode = Opcode::Jmp;
            insn.raw = None;
        }
        Opcode::JccShort(cc) => {
            let insn = ilist.get_mut(instr)?;
            insn.opcode = Opcode::Jcc(cc);
            insn.raw = None;
        }
        Opcode::Jecxz => {
            let (target, xl8, exit) = {
                let insn = ilist.get(instr)?;
                let target = insn.target().ok_or(MangleError::MalformedInstruction)?;
                (target, insn.translation, insn.exit_type)
            };
            let taken = ilist.new_label();
            let fall = ilist.new_label();
            {
                let insn = ilist.get_mut(instr)?;
                insn.set_target(Operand::Label(taken));
                insn.flags.remove(InsnFlags::EXIT);
                insn.exit_type = None;
            }
            let mut hop = Instruction::jump_short(Operand::Label(fall));
            hop.set_meta();
            put(ilist, next, hop)?;
            let mut marker = Instruction::label(taken);
            marker.set_meta();
            put(ilist, next, marker)?;
            // Carries the branch's own translation: a thread stopped here
            // reports the jecxz address.
            let mut exit_jmp = Instruction::jump(target);
            exit_jmp.translation = xl8;
            exit_jmp.set_exit(exit.unwrap_or(BranchType::DirectJump));
            put(ilist, next, exit_jmp)?;
            let mut marker = Instruction::label(fall);
            marker.set_meta();
            put(ilist, next, marker)?;
        }
        _ => {}
    }
    Ok(())
}

/// Application address of the instruction after a call. Reuses the decoded
/// length while the raw encoding still matches the translation; a call a
/// client has replaced or resized is measured from application memory
/// instead.
fn call_return_address(insn: &Instruction, app: &AppMemory) -> Result<u64, MangleError> {
    let xl8 = insn.translation.ok_or(MangleError::MalformedInstruction)?;
    if insn.raw_matches_translation() {
        return Ok(xl8.wrapping_add(instruction_length(insn) as u64));
    }
    let bytes = app.slice_at(xl8, MAX_INSTR_LEN)?;
    let (_, len) = decode(bytes, xl8)?;
    Ok(xl8.wrapping_add(len as u64))
}

/// Pushes a 64-bit return address. A single push takes a sign-extended
/// 32-bit immediate, which covers the usual address space; anything wider
/// fixes up the high half of the just-pushed slot with a second store.
fn insert_push_return_address(
    ilist: &mut InstructionList,
    before: Option<InsnRef>,
    retaddr: u64,
) -> Result<(), MangleError> {
    let low = retaddr as i32;
    let mut push = Instruction::push_immediate(low);
    push.set_meta();
    put(ilist, before, push)?;
    if i64::from(low) as u64 != retaddr {
        let mut high = Instruction::store_immediate(
            OperandSize::S32,
            MemRef::base_disp(RSP, 4),
            i64::from((retaddr >> 32) as i32),
        );
        high.set_meta();
        put(ilist, before, high)?;
    }
    Ok(())
}

/// A native call executing from the cache would push a cache address. The
/// rewrite pushes the application return address explicitly and turns the
/// call itself into an exit jump.
fn mangle_direct_call(
    ilist: &mut InstructionList,
    instr: InsnRef,
    mangle_calls: bool,
    app: &AppMemory,
) -> Result<(), MangleError> {
    if !mangle_calls {
        return Ok(());
    }
    let retaddr = call_return_address(ilist.get(instr)?, app)?;
    insert_push_return_address(ilist, Some(instr), retaddr)?;
    let insn = ilist.get_mut(instr)?;
    insn.opcode = Opcode::Jmp;
    insn.raw = None;
    insn.writes = 0;
    insn.mem_writes = 0;
    insn.set_exit(BranchType::DirectCall);
    Ok(())
}

fn spill_branch_register(ilist: &mut InstructionList, before: InsnRef) -> Result<(), MangleError> {
    let mut spill = Instruction::store(OperandSize::S64, RCX, TlsSlot::Reg2.mem());
    spill.set_meta();
    ilist.insert_before(before, spill)?;
    Ok(())
}

/// Turns an indirect branch into the instruction that materializes its
/// target in rcx. Stays app-visible: a fault while computing the target is
/// attributed to the original branch address.
fn capture_branch_target(ilist: &mut InstructionList, instr: InsnRef) -> Result<(), MangleError> {
    let insn = ilist.get_mut(instr)?;
    let target = insn.target().ok_or(MangleError::MalformedInstruction)?;
    match target {
        Operand::Mem(mem) => {
            insn.opcode = Opcode::Load;
            insn.src = Operand::Mem(mem);
        }
        Operand::Reg(reg) => {
            insn.opcode = Opcode::MovRR;
            insn.src = Operand::Reg(reg);
        }
        _ => return Err(MangleError::MalformedInstruction),
    }
    insn.size = OperandSize::S64;
    insn.dst = Operand::Reg(RCX);
    insn.raw = None;
    insn.writes = 1 << RCX;
    insn.mem_writes = 0;
    insn.flags.remove(InsnFlags::EXIT);
    insn.exit_type = None;
    Ok(())
}

/// Completes an indirect-branch rewrite: parks the target where the lookup
/// routine expects it, restores the application's rcx, and exits to the
/// lookup entry for `branch`.
fn insert_indirect_exit(
    ilist: &mut InstructionList,
    before: Option<InsnRef>,
    fragment: &Fragment,
    tcx: &ThreadContext,
    branch: BranchType,
    xl8: Option<u64>,
) -> Result<(), MangleError> {
    let mut park = Instruction::store(OperandSize::S64, RCX, TlsSlot::BranchTarget.mem());
    park.set_meta();
    put(ilist, before, park)?;
    let mut restore = Instruction::load(OperandSize::S64, TlsSlot::Reg2.mem(), RCX);
    restore.set_meta();
    put(ilist, before, restore)?;
    let entry = tcx.ibl_routines.entry(branch, fragment.is_trace());
    let mut exit = Instruction::jump(Operand::Pc(entry));
    exit.translation = xl8;
    exit.set_exit(branch);
    put(ilist, before, exit)?;
    Ok(())
}

/// Captures the target into rcx, pushes the return address, and exits to
/// the indirect-call lookup. The capture happens before the push so an
/// rsp-relative target still reads the application's stack layout.
fn mangle_indirect_call(
    ilist: &mut InstructionList,
    instr: InsnRef,
    next: Option<InsnRef>,
    mangle_calls: bool,
    fragment: &Fragment,
    app: &AppMemory,
    tcx: &ThreadContext,
) -> Result<(), MangleError> {
    if !mangle_calls {
        return Ok(());
    }
    let (retaddr, xl8) = {
        let insn = ilist.get(instr)?;
        (call_return_address(insn, app)?, insn.translation)
    };
    spill_branch_register(ilist, instr)?;
    capture_branch_target(ilist, instr)?;
    insert_push_return_address(ilist, next, retaddr)?;
    insert_indirect_exit(ilist, next, fragment, tcx, BranchType::IndirectCall, xl8)
}

/// Rewrites a return into "pop into spilled rcx, exit through the return
/// lookup".
fn mangle_return(
    ilist: &mut InstructionList,
    instr: InsnRef,
    next: Option<InsnRef>,
    fragment: &Fragment,
    tcx: &ThreadContext,
) -> Result<(), MangleError> {
    spill_branch_register(ilist, instr)?;
    let (imm, xl8) = {
        let insn = ilist.get_mut(instr)?;
        let imm = match insn.src {
            Operand::Imm(n) => Some(n),
            _ => None,
        };
        let xl8 = insn.translation;
        insn.opcode = Opcode::Pop;
        insn.size = OperandSize::S64;
        insn.dst = Operand::Reg(RCX);
        insn.src = Operand::None;
        insn.raw = None;
        insn.writes = (1 << RCX) | (1 << RSP);
        insn.mem_writes = 0;
        insn.flags.remove(InsnFlags::EXIT);
        insn.exit_type = None;
        (imm, xl8)
    };
    if let Some(n) = imm {
        // ret imm frees caller-pushed argument space; lea leaves the
        // arithmetic flags alone, which the pop also preserved.
        let mut adjust = Instruction::lea(MemRef::base_disp(RSP, n as i32), RSP);
        adjust.set_meta();
        put(ilist, next, adjust)?;
    }
    insert_indirect_exit(ilist, next, fragment, tcx, BranchType::Return, xl8)
}

fn mangle_indirect_jump(
    ilist: &mut InstructionList,
    instr: InsnRef,
    next: Option<InsnRef>,
    fragment: &Fragment,
    tcx: &ThreadContext,
) -> Result<(), MangleError> {
    let xl8 = ilist.get(instr)?.translation;
    spill_branch_register(ilist, instr)?;
    capture_branch_target(ilist, instr)?;
    insert_indirect_exit(ilist, next, fragment, tcx, BranchType::IndirectJump, xl8)
}

/// Rewrites a thread-register (fs) memory reference into an explicit
/// address computation from the application's segment base, which the
/// engine keeps in one of its own slots. Only the modeled load and store
/// shapes can be rewritten; gs references and segment prefixes on
/// unmodeled instructions are unsupported application patterns.
fn mangle_segment_reference(
    ilist: &mut InstructionList,
    instr: InsnRef,
    next: Option<InsnRef>,
) -> Result<(), MangleError> {
    enum Slot {
        Dst,
        Src,
    }
    let (slot, mem, used, xl8) = {
        let insn = ilist.get(instr)?;
        let xl8 = insn.translation.unwrap_or(0);
        let picked = match (insn.opcode, insn.dst, insn.src) {
            (Opcode::Load, _, Operand::Mem(m)) if m.seg != Segment::None => Some((Slot::Src, m)),
            (Opcode::Store | Opcode::StoreImm, Operand::Mem(m), _) if m.seg != Segment::None => {
                Some((Slot::Dst, m))
            }
            _ => None,
        };
        let (slot, mem) = match picked {
            Some(p) => p,
            None => {
                // Unmodeled instructions re-emit their raw bytes, so the
                // reference cannot be rewritten; refuse rather than let a
                // stale segment base leak through.
                if let (Opcode::Other(_), Some(raw)) = (insn.opcode, insn.raw.as_deref()) {
                    if seg_override(raw).is_some() {
                        return Err(MangleError::UnsupportedSegmentReference(xl8));
                    }
                }
                return Ok(());
            }
        };
        (slot, mem, referenced_registers(insn), xl8)
    };
    if mem.seg == Segment::Gs || matches!(mem.base, Base::Rip) {
        return Err(MangleError::UnsupportedSegmentReference(xl8));
    }

    let scratch = pick_scratch(used);
    trace!("rewriting fs reference at {:#x} through r{}", xl8, scratch);
    let mut save = Instruction::store(OperandSize::S64, scratch, TlsSlot::Reg2.mem());
    save.set_meta();
    ilist.insert_before(instr, save)?;
    let mut base = Instruction::load(OperandSize::S64, TlsSlot::AppSegBase.mem(), scratch);
    base.set_meta();
    ilist.insert_before(instr, base)?;
    let rewritten = match (mem.base, mem.index) {
        (Base::None, index) => MemRef {
            base: Base::Reg(scratch),
            index,
            scale: mem.scale,
            disp: mem.disp,
            seg: Segment::None,
        },
        (Base::Reg(b), None) => MemRef {
            base: Base::Reg(b),
            index: Some(scratch),
            scale: 1,
            disp: mem.disp,
            seg: Segment::None,
        },
        (Base::Reg(b), Some(index)) => {
            // Both addressing slots are taken; fold the base into the
            // scratch register first.
            let mut fold = Instruction::lea(
                MemRef {
                    base: Base::Reg(scratch),
                    index: Some(b),
                    scale: 1,
                    disp: 0,
                    seg: Segment::None,
                },
                scratch,
            );
            fold.set_meta();
            ilist.insert_before(instr, fold)?;
            MemRef {
                base: Base::Reg(scratch),
                index: Some(index),
                scale: mem.scale,
                disp: mem.disp,
                seg: Segment::None,
            }
        }
        (Base::Rip, _) => return Err(MangleError::UnsupportedSegmentReference(xl8)),
    };
    {
        let insn = ilist.get_mut(instr)?;
        match slot {
            Slot::Dst => insn.dst = Operand::Mem(rewritten),
            Slot::Src => insn.src = Operand::Mem(rewritten),
        }
        insn.raw = None;
    }
    let mut restore = Instruction::load(OperandSize::S64, TlsSlot::Reg2.mem(), scratch);
    restore.set_meta();
    put(ilist, next, restore)?;
    Ok(())
}

/// Bitmask of the registers an instruction's operands name, for scratch
/// selection.
fn referenced_registers(insn: &Instruction) -> u16 {
    let mut used = 0u16;
    for op in [insn.dst, insn.src] {
        match op {
            Operand::Reg(r) => used |= 1 << r,
            Operand::Mem(m) => {
                if let Base::Reg(b) = m.base {
                    used |= 1 << b;
                }
                if let Some(i) = m.index {
                    used |= 1 << i;
                }
            }
            _ => {}
        }
    }
    used
}

/// Lowest general-purpose register the instruction does not reference,
/// excluding the stack pointer.
fn pick_scratch(used: u16) -> u8 {
    // Two operands reference at most four registers, so one always exists.
    (0..GPR_COUNT as u8)
        .find(|&reg| reg != RSP && used & (1 << reg) == 0)
        .unwrap_or(RAX)
}
