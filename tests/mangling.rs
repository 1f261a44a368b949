// Licensed under the Apache License, Version 2.0 <http://www.apache.org/licenses/LICENSE-2.0> or
// the MIT license <http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Whole-block mangling driven from real instruction bytes: control-transfer
//! rewrites, rip-relative rebasing, segment fixups and re-encoding of the
//! finished fragment.

extern crate byteorder;
extern crate rmangle;

use byteorder::{ByteOrder, LittleEndian};
use rmangle::{
    config::Config,
    context::{IblRoutines, ThreadContext, TlsSlot},
    decode::{decode, MAX_INSTR_LEN},
    error::MangleError,
    fragment::Fragment,
    ilist::InstructionList,
    insn::{BranchType, Instruction, Opcode, Operand, RAX, RCX},
    mangle,
    memory::{AppMemory, CodeRegion},
    rseq::RseqRegions,
    x86::encode_list,
};

const APP_BASE: u64 = 0x40_1000;
const CACHE_BASE: u64 = 0x40_2000;

fn thread_context() -> ThreadContext {
    ThreadContext {
        ibl_routines: IblRoutines {
            bb: [0x7000_0000, 0x7000_0100, 0x7000_0200],
            trace: [0x7000_1000, 0x7000_1100, 0x7000_1200],
        },
        context_save_routine: 0x7000_2000,
        context_restore_routine: 0x7000_2100,
        rseq_cs_offset: 0x2e0,
        app_name: "mangling-test".to_string(),
    }
}

fn decode_block(app: &AppMemory, mut pc: u64, count: usize) -> InstructionList {
    let mut list = InstructionList::new();
    for _ in 0..count {
        let bytes = app.slice_at(pc, MAX_INSTR_LEN).unwrap();
        let (insn, len) = decode(bytes, pc).unwrap();
        list.append(insn);
        pc += len as u64;
    }
    list
}

fn mangle_block(
    list: &mut InstructionList,
    app: &AppMemory,
    config: &Config,
    tcx: &ThreadContext,
) -> Fragment {
    let mut fragment = Fragment::new(APP_BASE);
    let regions = RseqRegions::default();
    mangle(list, &mut fragment, app, &regions, tcx, config, true, false).unwrap();
    fragment
}

/// Decodes emitted bytes front to back, checking every byte is consumed.
fn decode_walk(code: &[u8], base: u64) -> usize {
    let mut off = 0;
    let mut count = 0;
    while off < code.len() {
        let (_, len) = decode(&code[off..], base + off as u64).unwrap();
        off += len;
        count += 1;
    }
    assert_eq!(off, code.len());
    count
}

#[test]
fn test_mangling_block_reencodes_cleanly() {
    // A block touching most rewrite paths at once: rip-relative store,
    // constant load, syscall, indirect call, return.
    let bytes = [
        0x48, 0x89, 0x05, 0x00, 0x01, 0x00, 0x00, // mov [rip+0x100], rax
        0xb8, 0x27, 0x00, 0x00, 0x00, // mov eax, 39
        0x0f, 0x05, // syscall
        0xff, 0xd0, // call rax
        0xc3, // ret
    ];
    let app = AppMemory::new(vec![CodeRegion::new(&bytes, APP_BASE)]).unwrap();
    let mut list = decode_block(&app, APP_BASE, 5);
    let tcx = thread_context();
    let config = Config::default();
    mangle_block(&mut list, &app, &config, &tcx);

    let code = encode_list(&list, CACHE_BASE).unwrap();
    let emitted = decode_walk(&code, CACHE_BASE);
    let listed = list
        .iter()
        .filter(|(_, insn)| insn.opcode != Opcode::Label)
        .count();
    assert_eq!(emitted, listed);
    assert!(emitted > 5);
}

#[test]
fn test_mangling_rip_relative_store_rebased() {
    // mov [rip+0x100], rax; ret. The target address must survive the move
    // to the cache even though the fragment lands 0x1000 bytes away.
    let bytes = [0x48, 0x89, 0x05, 0x00, 0x01, 0x00, 0x00, 0xc3];
    let app = AppMemory::new(vec![CodeRegion::new(&bytes, APP_BASE)]).unwrap();
    let target = APP_BASE + 7 + 0x100;
    let mut list = decode_block(&app, APP_BASE, 2);
    let tcx = thread_context();
    let config = Config::default();
    mangle_block(&mut list, &app, &config, &tcx);

    let code = encode_list(&list, CACHE_BASE).unwrap();
    assert_eq!(&code[..3], &bytes[..3]);
    let rel = LittleEndian::read_i32(&code[3..7]);
    assert_eq!((CACHE_BASE + 7).wrapping_add(rel as i64 as u64), target);
}

#[test]
fn test_mangling_calls_and_return_exit_through_engine() {
    let bytes = [
        0xe8, 0x00, 0x01, 0x00, 0x00, // call +0x100
        0xff, 0xd0, // call rax
        0xc3, // ret
    ];
    let app = AppMemory::new(vec![CodeRegion::new(&bytes, APP_BASE)]).unwrap();
    let mut list = decode_block(&app, APP_BASE, 3);
    let tcx = thread_context();
    let config = Config::default();
    mangle_block(&mut list, &app, &config, &tcx);

    let insns: Vec<_> = list.iter().map(|(_, insn)| insn).collect();
    let pos = |pred: &dyn Fn(&Instruction) -> bool| insns.iter().position(|i| pred(*i)).unwrap();

    // Direct call: pushed return address, then a linked exit to the callee.
    let push_a = pos(&|i| i.opcode == Opcode::PushImm && i.src == Operand::Imm(0x40_1005));
    let dcall = pos(&|i| i.exit_type == Some(BranchType::DirectCall));
    assert!(push_a < dcall);
    assert_eq!(insns[dcall].opcode, Opcode::Jmp);
    assert_eq!(insns[dcall].src, Operand::Pc(APP_BASE + 5 + 0x100));
    assert_eq!(insns[dcall].translation, Some(APP_BASE));

    // Indirect call: target captured into rcx before the push, exit through
    // the lookup routine.
    let capture = pos(&|i| {
        i.opcode == Opcode::MovRR && i.dst == Operand::Reg(RCX) && i.src == Operand::Reg(RAX)
    });
    let push_b = pos(&|i| i.opcode == Opcode::PushImm && i.src == Operand::Imm(0x40_1007));
    let park = pos(&|i| {
        i.opcode == Opcode::Store
            && i.dst == Operand::Mem(TlsSlot::BranchTarget.mem())
            && i.src == Operand::Reg(RCX)
    });
    let icall = pos(&|i| i.exit_type == Some(BranchType::IndirectCall));
    assert!(dcall < capture && capture < push_b && push_b < park && park < icall);
    assert_eq!(insns[icall].src, Operand::Pc(tcx.ibl_routines.bb[1]));

    // Return: popped into rcx, exit through the return lookup routine.
    let popped = pos(&|i| i.opcode == Opcode::Pop && i.dst == Operand::Reg(RCX));
    let ret = pos(&|i| i.exit_type == Some(BranchType::Return));
    assert!(icall < popped && popped < ret);
    assert_eq!(insns[popped].translation, Some(APP_BASE + 7));
    assert_eq!(insns[ret].src, Operand::Pc(tcx.ibl_routines.bb[0]));

    let code = encode_list(&list, CACHE_BASE).unwrap();
    decode_walk(&code, CACHE_BASE);
}

#[test]
fn test_mangling_direct_call_kept_when_disabled() {
    let bytes = [0xe8, 0x00, 0x01, 0x00, 0x00, 0xc3];
    let app = AppMemory::new(vec![CodeRegion::new(&bytes, APP_BASE)]).unwrap();
    let mut list = decode_block(&app, APP_BASE, 2);
    let tcx = thread_context();
    let config = Config::default();
    let mut fragment = Fragment::new(APP_BASE);
    let regions = RseqRegions::default();
    mangle(
        &mut list, &mut fragment, &app, &regions, &tcx, &config, false, false,
    )
    .unwrap();

    let call = list
        .iter()
        .map(|(_, insn)| insn)
        .find(|insn| insn.translation == Some(APP_BASE))
        .unwrap();
    assert_eq!(call.opcode, Opcode::Call);
    assert!(!call.is_exit());
}

#[test]
fn test_mangling_jecxz_widens_through_trampoline() {
    // jrcxz to the ret; the two-byte form cannot carry a cache-range
    // displacement, so the exit detours through a local trampoline.
    let bytes = [
        0xe3, 0x03, // jrcxz +3
        0x48, 0x89, 0xc8, // mov rax, rcx
        0xc3, // ret
    ];
    let app = AppMemory::new(vec![CodeRegion::new(&bytes, APP_BASE)]).unwrap();
    let mut list = decode_block(&app, APP_BASE, 3);
    let tcx = thread_context();
    let config = Config::default();
    mangle_block(&mut list, &app, &config, &tcx);

    let code = encode_list(&list, CACHE_BASE).unwrap();
    // jrcxz hops to the local label, the short jump carries the
    // fall-through over the widened exit.
    assert_eq!(&code[..2], &[0xe3, 0x02][..]);
    assert_eq!(&code[2..4], &[0xeb, 0x05][..]);
    assert_eq!(code[4], 0xe9);
    let rel = LittleEndian::read_i32(&code[5..9]);
    assert_eq!(
        (CACHE_BASE + 9).wrapping_add(rel as i64 as u64),
        APP_BASE + 5
    );
    // The taken-path exit reports the branch's own address.
    let taken = list
        .iter()
        .map(|(_, insn)| insn)
        .find(|insn| insn.exit_type == Some(BranchType::DirectJump))
        .unwrap();
    assert_eq!(taken.translation, Some(APP_BASE));
    decode_walk(&code, CACHE_BASE);
}

#[test]
fn test_mangling_short_branch_widened_for_cache_range() {
    let bytes = [
        0x75, 0x03, // jne +3
        0x48, 0x89, 0xc8, // mov rax, rcx
        0xc3, // ret
    ];
    let app = AppMemory::new(vec![CodeRegion::new(&bytes, APP_BASE)]).unwrap();
    let mut list = decode_block(&app, APP_BASE, 3);
    let tcx = thread_context();
    let config = Config::default();
    mangle_block(&mut list, &app, &config, &tcx);

    let code = encode_list(&list, CACHE_BASE).unwrap();
    assert_eq!(&code[..2], &[0x0f, 0x85][..]);
    let rel = LittleEndian::read_i32(&code[2..6]);
    assert_eq!(
        (CACHE_BASE + 6).wrapping_add(rel as i64 as u64),
        APP_BASE + 5
    );
}

#[test]
fn test_mangling_fs_reference_rewritten_through_saved_base() {
    let bytes = [
        0x64, 0x48, 0x8b, 0x04, 0x25, 0x10, 0x00, 0x00, 0x00, // mov rax, fs:[0x10]
        0xc3, // ret
    ];
    let app = AppMemory::new(vec![CodeRegion::new(&bytes, APP_BASE)]).unwrap();
    let mut list = decode_block(&app, APP_BASE, 2);
    let tcx = thread_context();
    let config = Config {
        mangle_app_seg: true,
        ..Config::default()
    };
    mangle_block(&mut list, &app, &config, &tcx);

    let insns: Vec<_> = list.iter().map(|(_, insn)| insn).collect();
    // Spill, base load, rewritten access, restore.
    assert_eq!(insns[0].opcode, Opcode::Store);
    assert_eq!(insns[0].src, Operand::Reg(RCX));
    assert_eq!(insns[0].dst, Operand::Mem(TlsSlot::Reg2.mem()));
    assert_eq!(insns[1].opcode, Opcode::Load);
    assert_eq!(insns[1].src, Operand::Mem(TlsSlot::AppSegBase.mem()));
    assert_eq!(insns[1].dst, Operand::Reg(RCX));
    assert_eq!(insns[2].opcode, Opcode::Load);
    assert_eq!(insns[2].translation, Some(APP_BASE));
    match insns[2].src {
        Operand::Mem(mem) => {
            assert_eq!(mem, rmangle::insn::MemRef::base_disp(RCX, 0x10));
        }
        other => panic!("rewritten operand: {:?}", other),
    }
    assert_eq!(insns[3].opcode, Opcode::Load);
    assert_eq!(insns[3].src, Operand::Mem(TlsSlot::Reg2.mem()));

    let code = encode_list(&list, CACHE_BASE).unwrap();
    decode_walk(&code, CACHE_BASE);
}

#[test]
fn test_mangling_gs_reference_rejected() {
    let bytes = [
        0x65, 0x48, 0x8b, 0x04, 0x25, 0x10, 0x00, 0x00, 0x00, // mov rax, gs:[0x10]
        0xc3,
    ];
    let app = AppMemory::new(vec![CodeRegion::new(&bytes, APP_BASE)]).unwrap();
    let mut list = decode_block(&app, APP_BASE, 2);
    let tcx = thread_context();
    let config = Config {
        mangle_app_seg: true,
        ..Config::default()
    };
    let mut fragment = Fragment::new(APP_BASE);
    let regions = RseqRegions::default();
    let err = mangle(
        &mut list, &mut fragment, &app, &regions, &tcx, &config, true, false,
    )
    .unwrap_err();
    assert_eq!(err, MangleError::UnsupportedSegmentReference(APP_BASE));
    assert!(err.is_unsupported_app_pattern());
}

#[test]
fn test_mangling_meta_branches_left_alone() {
    // Instrumentation-inserted control flow is not application control flow;
    // the rewrites must skip it.
    let mut list = InstructionList::new();
    let mut helper_call = Instruction::call(Operand::Pc(0x7000_2000));
    helper_call.set_meta();
    list.append(helper_call);
    let mut ret = Instruction::return_near();
    ret.translation = Some(APP_BASE);
    list.append(ret);

    let app = AppMemory::new(Vec::new()).unwrap();
    let tcx = thread_context();
    let config = Config::default();
    mangle_block(&mut list, &app, &config, &tcx);

    let insns: Vec<_> = list.iter().map(|(_, insn)| insn).collect();
    assert_eq!(insns[0].opcode, Opcode::Call);
    assert!(insns[0].is_meta() && !insns[0].is_exit());
    // The app return next to it was still rewritten.
    assert!(insns.iter().any(|i| i.opcode == Opcode::Pop));
    assert!(insns
        .iter()
        .any(|i| i.exit_type == Some(BranchType::Return)));
}
