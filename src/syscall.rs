// Licensed under the Apache License, Version 2.0 <http://www.apache.org/licenses/LICENSE-2.0> or
// the MIT license <http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! System call mangling.
//!
//! An inlined syscall must stay interruptible: a signal that arrives while
//! the thread is inside the code cache has to be delivered before the kernel
//! transition, not after. The barrier inserted by [`mangle_syscall`] makes
//! that possible without any per-syscall runtime cost. It places an exit
//! branch immediately before the syscall, guarded by a two-byte short jump
//! that normally hops over it. Signal delivery retargets the short jump with
//! a single byte store ([`patch_syscall_exit`]) so the thread stops at the
//! exit branch instead of entering the kernel.
//!
//! [`find_static_syscall_number`] recovers the syscall number from the
//! instruction stream when the application loads it with an immediate,
//! which is what allows a syscall to be inlined in the first place.

use crate::{
    config::Config,
    decode::decode,
    error::MangleError,
    fragment::{Fragment, FragmentFlags},
    ilist::{InsnRef, InstructionList},
    insn::{BranchType, Instruction, Opcode, Operand, REG_SYSNUM},
    x86::{instruction_length, JMP_NEAR_LEN, JMP_SHORT_LEN, RAW_OPCODE_NOP},
};

/// Inserts the signal barrier in front of an inlined syscall.
///
/// Layout after insertion, in list order:
/// short jump to the skip label, exit branch targeting the syscall's own
/// application address, skip label, syscall. The short jump and label stay
/// meta; the exit branch is app-visible so state reconstruction attributes
/// a stop there to the syscall address.
///
/// A syscall that the kernel will not restart after a signal additionally
/// gets a no-op appended, translated to the address after the syscall, so
/// a suspended thread sitting on the return path has a safe resume point.
pub(crate) fn mangle_syscall(
    ilist: &mut InstructionList,
    fragment: &mut Fragment,
    instr: InsnRef,
    config: &Config,
) -> Result<(), MangleError> {
    let insn = ilist.get(instr)?;
    let xl8 = insn.translation.ok_or(MangleError::MalformedInstruction)?;
    let len = instruction_length(insn) as u64;
    fragment.flags.insert(FragmentFlags::HAS_SYSCALL);

    let skip_exit = ilist.new_label();
    let mut hop = Instruction::jump_short(Operand::Label(skip_exit));
    hop.set_meta();
    ilist.insert_before(instr, hop)?;
    // Not meta: a thread diverted here reports the syscall pc as its stop.
    let mut exit = Instruction::jump(Operand::Pc(xl8));
    exit.translation = Some(xl8);
    exit.set_exit(BranchType::DirectJump);
    ilist.insert_before(instr, exit)?;
    let mut lbl = Instruction::label(skip_exit);
    lbl.set_meta();
    ilist.insert_before(instr, lbl)?;

    if config.pad_nonrestartable_syscalls {
        if let Some(num) = last_sysnum_write(ilist, instr)? {
            if !syscall_is_restartable(num) {
                // Fake app no-op so suspension right after the syscall has a
                // translation to stop at.
                let mut nop = Instruction::noop();
                nop.translation = Some(xl8.wrapping_add(len));
                ilist.insert_after(instr, nop)?;
            }
        }
    }
    Ok(())
}

/// Backward scan for the most recent app write of a constant to the syscall
/// number register. Unlike [`find_static_syscall_number`] this does not prove
/// the write reaches the syscall; it only feeds the restartability check.
fn last_sysnum_write(
    ilist: &InstructionList,
    from: InsnRef,
) -> Result<Option<i64>, MangleError> {
    let mut cur = ilist.prev(from)?;
    while let Some(r) = cur {
        let insn = ilist.get(r)?;
        if insn.is_app() {
            if let Some((reg, value)) = insn.mov_constant() {
                if reg == REG_SYSNUM {
                    return Ok(Some(value));
                }
            }
        }
        cur = ilist.prev(r)?;
    }
    Ok(None)
}

/// Whether the kernel transparently restarts this syscall after a signal
/// with `SA_RESTART` set. Syscalls outside the restartable set need a safe
/// suspension point after them; see `signal(7)`.
pub fn syscall_is_restartable(sysnum: i64) -> bool {
    !matches!(
        sysnum,
        libc::SYS_pause
            | libc::SYS_rt_sigsuspend
            | libc::SYS_rt_sigtimedwait
            | libc::SYS_epoll_wait
            | libc::SYS_epoll_pwait
            | libc::SYS_poll
            | libc::SYS_ppoll
            | libc::SYS_select
            | libc::SYS_pselect6
            | libc::SYS_msgrcv
            | libc::SYS_msgsnd
            | libc::SYS_semop
            | libc::SYS_semtimedop
            | libc::SYS_clock_nanosleep
            | libc::SYS_nanosleep
            | libc::SYS_io_getevents
    )
}

/// Retargets the short jump of the first syscall barrier at or after `pc`
/// inside emitted fragment code.
///
/// With `divert` set the short jump is aimed at the exit branch, so the
/// thread leaves the cache immediately before the syscall; with it clear the
/// jump hops over the exit branch and the syscall runs inline. Only the
/// one-byte displacement is stored, so a concurrently executing thread
/// observes the old target or the new one, never a torn encoding. Reapplying
/// the same direction is harmless.
///
/// Returns `Ok(false)` when no patchable barrier lies between `pc` and the
/// fragment body end. That also covers a signal arriving after the short
/// jump itself already executed, where exiting before the syscall is no
/// longer possible.
pub fn patch_syscall_exit(
    fragment: &Fragment,
    code: &mut [u8],
    pc: u64,
    divert: bool,
) -> Result<bool, MangleError> {
    let stop = fragment.body_len;
    if stop > code.len() {
        return Err(MangleError::MalformedInstruction);
    }
    if pc < fragment.start_pc || pc > fragment.start_pc.wrapping_add(stop as u64) {
        return Err(MangleError::UnmappedAddress(pc));
    }
    let mut off = (pc - fragment.start_pc) as usize;
    let mut skip_off = None;
    let mut cti_off = None;
    let syscall_off;
    // The walk mirrors emission: track the most recent short and near jumps
    // so that once the syscall is found they locate the barrier. The bounds
    // test runs before the syscall test, so a syscall ending exactly at the
    // body end (no room for anything to patch) reports failure.
    loop {
        if off >= stop {
            return Ok(false);
        }
        let prev_off = off;
        let (insn, len) = decode(&code[off..], fragment.start_pc + off as u64)?;
        off += len;
        match insn.opcode {
            Opcode::JmpShort => skip_off = Some(prev_off),
            Opcode::Jmp => cti_off = Some(prev_off),
            _ => {}
        }
        if off >= stop {
            return Ok(false);
        }
        if insn.is_syscall() {
            syscall_off = prev_off;
            break;
        }
    }
    let skip_off = match skip_off {
        Some(s) => s,
        None => return Ok(false),
    };
    let cti_off = cti_off.ok_or(MangleError::MalformedInstruction)?;
    // The exit branch sits right before the syscall; the short jump right
    // before that, modulo no-op padding.
    if Some(cti_off) != syscall_off.checked_sub(JMP_NEAR_LEN) || skip_off >= cti_off {
        return Err(MangleError::MalformedInstruction);
    }
    let pad = cti_off
        .checked_sub(JMP_SHORT_LEN)
        .ok_or(MangleError::MalformedInstruction)?;
    if skip_off != pad && code[pad] != RAW_OPCODE_NOP {
        return Err(MangleError::MalformedInstruction);
    }
    let target = if divert { cti_off } else { syscall_off };
    let rel = target as i64 - (skip_off + JMP_SHORT_LEN) as i64;
    if rel > i64::from(i8::MAX) || rel < i64::from(i8::MIN) {
        return Err(MangleError::MalformedInstruction);
    }
    let cur = code[skip_off + 1] as i8;
    if i64::from(cur) != rel {
        log::debug!(
            "retargeting syscall barrier at {:#x} to {:#x}",
            fragment.start_pc + skip_off as u64,
            fragment.start_pc + target as u64
        );
        code[skip_off + 1] = rel as u8;
    }
    Ok(true)
}

/// Tries to statically find the number the application loads into the
/// syscall number register before `instr`, which must be a syscall in
/// `ilist`. Returns -1 when the number cannot be proven.
///
/// The backward walk skips meta instructions, assuming a meta write of the
/// number register is undone before the syscall, and skips app instructions
/// that do not write it. A branch in between is tolerated only if control
/// still reaches the syscall from its target; a branch skipping the syscall,
/// or one from before the write that lands between the write and the
/// syscall, forfeits the static number.
pub fn find_static_syscall_number(
    ilist: &InstructionList,
    instr: InsnRef,
) -> Result<i32, MangleError> {
    ilist.get(instr)?;
    let order: Vec<InsnRef> = ilist.iter().map(|(r, _)| r).collect();
    let sys_pos = match order.iter().position(|r| *r == instr) {
        Some(p) => p,
        None => return Err(MangleError::StaleHandle),
    };

    let mut writer = None;
    let mut idx = sys_pos;
    while idx > 0 {
        idx -= 1;
        let insn = ilist.get(order[idx])?;
        if insn.is_app()
            && (insn.is_syscall() || insn.is_interrupt() || insn.writes_reg(REG_SYSNUM))
        {
            writer = Some(idx);
            break;
        }
        // A branch between the write and the syscall is fine only when its
        // target falls through to the syscall.
        if insn.is_cti()
            && (insn.is_app() || matches!(insn.target(), Some(Operand::Label(_))))
            && !cti_is_normal_elision(ilist, &order, idx)?
        {
            match resolve_cti_target(ilist, &order, insn)? {
                Some(t) if t <= sys_pos => {}
                _ => {
                    log::debug!("branch skips syscall: no static syscall number");
                    return Ok(-1);
                }
            }
        }
    }

    let writer = match writer {
        Some(w) => w,
        None => return Ok(-1),
    };
    let value = match ilist.get(order[writer])?.mov_constant() {
        Some((reg, value)) if reg == REG_SYSNUM => value,
        _ => return Ok(-1),
    };
    debug_assert!(value >= i64::from(i32::MIN) && value <= i64::from(i32::MAX));

    // A label-targeted branch from before the write that lands after it but
    // no later than the syscall would run the syscall with a stale number.
    for idx in 0..writer {
        let insn = ilist.get(order[idx])?;
        if !insn.is_cti() || !matches!(insn.target(), Some(Operand::Label(_))) {
            continue;
        }
        if let Some(t) = resolve_cti_target(ilist, &order, insn)? {
            if t > writer && t <= sys_pos {
                log::debug!("branch skips syscall number write: no static number");
                return Ok(-1);
            }
        }
    }
    Ok(value as i32)
}

/// A direct branch or call whose target is simply the next instruction's
/// application address: the residue of branch elision during block building,
/// harmless to the backward walk.
fn cti_is_normal_elision(
    ilist: &InstructionList,
    order: &[InsnRef],
    idx: usize,
) -> Result<bool, MangleError> {
    let insn = ilist.get(order[idx])?;
    if insn.is_meta() || (!insn.is_ubr() && !insn.is_call_direct()) {
        return Ok(false);
    }
    let next = match order.get(idx + 1) {
        Some(r) => ilist.get(*r)?,
        None => return Ok(false),
    };
    if next.is_meta() {
        return Ok(false);
    }
    match insn.target() {
        Some(Operand::Pc(p)) => Ok(next.translation == Some(p)),
        _ => Ok(false),
    }
}

/// Resolves a branch target to a position in `order`: a label target finds
/// the label instruction, an address target finds the first app instruction
/// translated to that address. `None` when the target leaves the list.
fn resolve_cti_target(
    ilist: &InstructionList,
    order: &[InsnRef],
    insn: &Instruction,
) -> Result<Option<usize>, MangleError> {
    match insn.target() {
        Some(Operand::Label(id)) => {
            for (pos, r) in order.iter().enumerate() {
                let cand = ilist.get(*r)?;
                if cand.label_id() == Some(id) {
                    return Ok(Some(pos));
                }
            }
            Ok(None)
        }
        Some(Operand::Pc(pc)) => {
            for (pos, r) in order.iter().enumerate() {
                let cand = ilist.get(*r)?;
                if cand.is_app() && cand.translation == Some(pc) {
                    return Ok(Some(pos));
                }
            }
            Ok(None)
        }
        _ => Ok(None),
    }
}
