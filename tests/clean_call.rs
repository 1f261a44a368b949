// Licensed under the Apache License, Version 2.0 <http://www.apache.org/licenses/LICENSE-2.0> or
// the MIT license <http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Clean-call context switches run through the whole pipeline: frame save
//! and restore around an injected callee, argument set-up, the out-of-line
//! variant, and coexistence with block mangling.

extern crate byteorder;
extern crate rmangle;

use byteorder::{ByteOrder, LittleEndian};
use rmangle::{
    clean_call::{frame_size, CallArg, CallOptions, CleanCallDescriptor},
    cleanup_clean_call,
    config::Config,
    context::{
        mctx_reg_offset, IblRoutines, ThreadContext, TlsSlot, WhereAmI, CTX_DSTACK_OFFSET,
        MCTX_SIZE,
    },
    decode::{decode, MAX_INSTR_LEN},
    find_static_syscall_number,
    fragment::{Fragment, FragmentFlags},
    ilist::{InsnRef, InstructionList},
    insert_call, mangle,
    insn::{
        BranchType, Instruction, MemRef, Opcode, Operand, RAX, RCX, RDI, RDX, REG_CALL_SCRATCH,
        RSI, RSP, R12,
    },
    memory::{AppMemory, CodeRegion},
    prepare_clean_call,
    rseq::RseqRegions,
    x86::encode_list,
};

const APP_BASE: u64 = 0x40_1000;
const CACHE_BASE: u64 = 0x40_2000;
const CALLEE: u64 = 0x7000_3000;

fn thread_context() -> ThreadContext {
    ThreadContext {
        ibl_routines: IblRoutines {
            bb: [0x7000_0000, 0x7000_0100, 0x7000_0200],
            trace: [0x7000_1000, 0x7000_1100, 0x7000_1200],
        },
        context_save_routine: 0x7000_2000,
        context_restore_routine: 0x7000_2100,
        rseq_cs_offset: 0x2e0,
        app_name: "clean-call-test".to_string(),
    }
}

fn decode_block(app: &AppMemory, mut pc: u64, count: usize) -> (InstructionList, Vec<InsnRef>) {
    let mut list = InstructionList::new();
    let mut refs = Vec::new();
    for _ in 0..count {
        let bytes = app.slice_at(pc, MAX_INSTR_LEN).unwrap();
        let (insn, len) = decode(bytes, pc).unwrap();
        refs.push(list.append(insn));
        pc += len as u64;
    }
    (list, refs)
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
fn test_clean_call_inline_frame_brackets_callee() {
    let bytes = [
        0x48, 0x89, 0xc8, // mov rax, rcx
        0xc3, // ret
    ];
    let app = AppMemory::new(vec![CodeRegion::new(&bytes, APP_BASE)]).unwrap();
    let (mut list, refs) = decode_block(&app, APP_BASE, 2);
    let tcx = thread_context();
    let descriptor = CleanCallDescriptor::default();

    let size = prepare_clean_call(&mut list, refs[1], &descriptor, &tcx).unwrap();
    assert_eq!(size, frame_size(&descriptor));
    let direct = insert_call(
        &mut list,
        refs[1],
        CALLEE,
        &[CallArg::Immediate(1), CallArg::Register(RCX)],
        &CallOptions::default(),
        CACHE_BASE,
    )
    .unwrap();
    assert!(direct);
    cleanup_clean_call(&mut list, refs[1], &descriptor, &tcx).unwrap();

    let config = Config::default();
    mangle_block(&mut list, &app, &config, &tcx);

    let insns: Vec<_> = list.iter().map(|(_, insn)| insn).collect();
    let pos = |pred: &dyn Fn(&Instruction) -> bool| insns.iter().position(|i| pred(*i)).unwrap();

    // The application instruction ahead of the insertion point is untouched;
    // the switch frame right after it starts by spilling the scratch register.
    assert_eq!(insns[0].opcode, Opcode::MovRR);
    assert!(insns[0].is_app());
    assert_eq!(insns[1].opcode, Opcode::Store);
    assert_eq!(insns[1].dst, Operand::Mem(TlsSlot::Reg0.mem()));
    assert!(insns[1].is_meta());

    let pushf = pos(&|i| i.opcode == Opcode::Pushf);
    let first_push = pos(&|i| i.opcode == Opcode::Push);
    let call = pos(&|i| i.opcode == Opcode::Call && i.src == Operand::Pc(CALLEE));
    // Flags are cleared for the callee after the save and restored last.
    let clear_flags = pos(&|i| i.opcode == Opcode::Popf);
    let restore_flags = insns.iter().rposition(|i| i.opcode == Opcode::Popf).unwrap();
    assert!(pushf < first_push && first_push < clear_flags && clear_flags < call);
    assert!(call < restore_flags);
    assert!(insns[call].is_meta() && !insns[call].is_exit());

    // Full register file pushed; on the way out the stack pointer slot is
    // discarded rather than popped.
    assert_eq!(insns.iter().filter(|i| i.opcode == Opcode::Push).count(), 16);
    assert_eq!(insns.iter().filter(|i| i.opcode == Opcode::PushImm).count(), 2);
    assert_eq!(
        insns
            .iter()
            .filter(|i| i.opcode == Opcode::Pop && i.is_meta())
            .count(),
        15
    );

    // Arguments land in their ABI registers just before the call; the
    // register argument is assigned after the later positions so its source
    // stays live.
    let arg_reg = pos(&|i| {
        i.opcode == Opcode::MovRR && i.dst == Operand::Reg(RSI) && i.src == Operand::Reg(RCX)
    });
    let arg_imm = pos(&|i| {
        i.opcode == Opcode::LoadImm && i.dst == Operand::Reg(RDI) && i.src == Operand::Imm(1)
    });
    assert!(first_push < arg_reg && arg_reg < arg_imm && arg_imm < call);
    assert!(insns[arg_reg].is_meta() && insns[arg_imm].is_meta());

    // The thread's where-am-i field flips on the way in and back out.
    let whereami: Vec<(usize, i64)> = insns
        .iter()
        .enumerate()
        .filter_map(|(at, i)| match (i.opcode, i.src) {
            (Opcode::StoreImm, Operand::Imm(value)) => Some((at, value)),
            _ => None,
        })
        .collect();
    assert_eq!(whereami.len(), 2);
    assert_eq!(whereami[0].1, WhereAmI::CleanCallee.as_imm());
    assert_eq!(whereami[1].1, WhereAmI::App.as_imm());
    assert!(whereami[0].0 < call && call < whereami[1].0 && whereami[1].0 < restore_flags);

    // The return after the injected call still exits through the engine.
    let popped = pos(&|i| i.opcode == Opcode::Pop && i.translation == Some(APP_BASE + 3));
    let ret = pos(&|i| i.exit_type == Some(BranchType::Return));
    assert!(restore_flags < popped && popped < ret);
    assert_eq!(insns[ret].src, Operand::Pc(tcx.ibl_routines.bb[0]));

    let code = encode_list(&list, CACHE_BASE).unwrap();
    assert_eq!(&code[..3], &bytes[..3]);
    // First switch instruction carries the engine segment prefix.
    assert_eq!(code[3], 0x65);
    assert_eq!(decode_walk(&code, CACHE_BASE), insns.len());
}

#[test]
fn test_clean_call_out_of_line_uses_shared_routines() {
    let bytes = [0x48, 0x89, 0xc8, 0xc3];
    let app = AppMemory::new(vec![CodeRegion::new(&bytes, APP_BASE)]).unwrap();
    let (mut list, refs) = decode_block(&app, APP_BASE, 2);
    let tcx = thread_context();
    let descriptor = CleanCallDescriptor {
        out_of_line: true,
        ..CleanCallDescriptor::default()
    };

    let size = prepare_clean_call(&mut list, refs[1], &descriptor, &tcx).unwrap();
    assert_eq!(size, MCTX_SIZE as usize);
    insert_call(
        &mut list,
        refs[1],
        CALLEE,
        &[],
        &CallOptions::default(),
        CACHE_BASE,
    )
    .unwrap();
    cleanup_clean_call(&mut list, refs[1], &descriptor, &tcx).unwrap();

    let config = Config::default();
    mangle_block(&mut list, &app, &config, &tcx);

    let insns: Vec<_> = list.iter().map(|(_, insn)| insn).collect();
    let pos = |pred: &dyn Fn(&Instruction) -> bool| insns.iter().position(|i| pred(*i)).unwrap();

    let save = pos(&|i| i.opcode == Opcode::Call && i.src == Operand::Pc(tcx.context_save_routine));
    let callee = pos(&|i| i.opcode == Opcode::Call && i.src == Operand::Pc(CALLEE));
    let restore =
        pos(&|i| i.opcode == Opcode::Call && i.src == Operand::Pc(tcx.context_restore_routine));
    assert!(save < callee && callee < restore);
    for at in [save, callee, restore] {
        assert!(insns[at].is_meta() && !insns[at].is_exit());
    }

    // The register file lives behind the shared routines; nothing is pushed
    // inline, and the only pop is the rewritten application return.
    assert!(insns.iter().all(|i| !matches!(
        i.opcode,
        Opcode::Push | Opcode::PushImm | Opcode::Pushf | Opcode::Popf
    )));
    assert_eq!(insns.iter().filter(|i| i.opcode == Opcode::Pop).count(), 1);

    // The stack still switches to the engine stack around the callee and
    // comes back from the saved application value.
    let to_engine = pos(&|i| {
        i.opcode == Opcode::Load
            && i.dst == Operand::Reg(RSP)
            && i.src == Operand::Mem(MemRef::base_disp(RAX, CTX_DSTACK_OFFSET))
    });
    let back = pos(&|i| {
        i.opcode == Opcode::Load
            && i.dst == Operand::Reg(RSP)
            && i.src == Operand::Mem(MemRef::base_disp(RAX, mctx_reg_offset(RSP)))
    });
    assert!(to_engine < save && restore < back);

    let code = encode_list(&list, CACHE_BASE).unwrap();
    decode_walk(&code, CACHE_BASE);
}

#[test]
fn test_clean_call_far_callee_through_scratch_register() {
    let bytes = [0x48, 0x89, 0xc8, 0xc3];
    let app = AppMemory::new(vec![CodeRegion::new(&bytes, APP_BASE)]).unwrap();
    let (mut list, refs) = decode_block(&app, APP_BASE, 2);
    let tcx = thread_context();
    let descriptor = CleanCallDescriptor::default();
    let far = 0x7fff_ffff_0000u64;

    prepare_clean_call(&mut list, refs[1], &descriptor, &tcx).unwrap();
    let options = CallOptions {
        track_where_am_i: false,
        ..CallOptions::default()
    };
    let direct = insert_call(&mut list, refs[1], far, &[], &options, CACHE_BASE).unwrap();
    assert!(!direct);
    cleanup_clean_call(&mut list, refs[1], &descriptor, &tcx).unwrap();

    let config = Config::default();
    mangle_block(&mut list, &app, &config, &tcx);

    let insns: Vec<_> = list.iter().map(|(_, insn)| insn).collect();
    let load = insns
        .iter()
        .position(|i| i.opcode == Opcode::LoadImmWide && i.dst == Operand::Reg(REG_CALL_SCRATCH))
        .unwrap();
    assert_eq!(insns[load].src, Operand::Imm(far as i64));
    assert_eq!(insns[load + 1].opcode, Opcode::CallInd);
    assert_eq!(insns[load + 1].src, Operand::Reg(REG_CALL_SCRATCH));
    assert!(insns[load + 1].is_meta() && !insns[load + 1].is_exit());

    // The pointer is materialized in full in the emitted bytes.
    let code = encode_list(&list, CACHE_BASE).unwrap();
    assert!(code.windows(8).any(|w| LittleEndian::read_u64(w) == far));
    decode_walk(&code, CACHE_BASE);
}

#[test]
fn test_clean_call_partial_save_mask_pads_frame() {
    let bytes = [0x48, 0x89, 0xc8, 0xc3];
    let app = AppMemory::new(vec![CodeRegion::new(&bytes, APP_BASE)]).unwrap();
    let (mut list, refs) = decode_block(&app, APP_BASE, 2);
    let tcx = thread_context();
    let descriptor = CleanCallDescriptor {
        save_registers: (1 << RAX) | (1 << RDX) | (1 << R12),
        skip_save_flags: true,
        ..CleanCallDescriptor::default()
    };

    let size = prepare_clean_call(&mut list, refs[1], &descriptor, &tcx).unwrap();
    // Three slots plus the alignment pad.
    assert_eq!(size, 32);
    let options = CallOptions {
        track_where_am_i: false,
        ..CallOptions::default()
    };
    insert_call(&mut list, refs[1], CALLEE, &[], &options, CACHE_BASE).unwrap();
    cleanup_clean_call(&mut list, refs[1], &descriptor, &tcx).unwrap();

    let config = Config::default();
    mangle_block(&mut list, &app, &config, &tcx);

    let insns: Vec<_> = list.iter().map(|(_, insn)| insn).collect();
    let pos = |pred: &dyn Fn(&Instruction) -> bool| insns.iter().position(|i| pred(*i)).unwrap();

    // Saves run down the context record layout, restores mirror them.
    let pushes: Vec<Operand> = insns
        .iter()
        .filter(|i| i.opcode == Opcode::Push)
        .map(|i| i.src)
        .collect();
    assert_eq!(
        pushes,
        vec![Operand::Reg(R12), Operand::Reg(RAX), Operand::Reg(RDX)]
    );
    let meta_pops: Vec<Operand> = insns
        .iter()
        .filter(|i| i.opcode == Opcode::Pop && i.is_meta())
        .map(|i| i.dst)
        .collect();
    assert_eq!(
        meta_pops,
        vec![Operand::Reg(RDX), Operand::Reg(RAX), Operand::Reg(R12)]
    );
    assert!(insns
        .iter()
        .all(|i| !matches!(i.opcode, Opcode::Pushf | Opcode::Popf)));

    // The odd slot count pads below the register file and the pad comes off
    // first on the way out.
    let pad = pos(&|i| i.opcode == Opcode::Lea && i.src == Operand::Mem(MemRef::base_disp(RSP, -8)));
    let unpad =
        pos(&|i| i.opcode == Opcode::Lea && i.src == Operand::Mem(MemRef::base_disp(RSP, 8)));
    let call = pos(&|i| i.opcode == Opcode::Call && i.src == Operand::Pc(CALLEE));
    let push_rdx = pos(&|i| i.opcode == Opcode::Push && i.src == Operand::Reg(RDX));
    let pop_rdx = pos(&|i| i.opcode == Opcode::Pop && i.dst == Operand::Reg(RDX));
    assert!(push_rdx < pad && pad < call && call < unpad && unpad < pop_rdx);

    let code = encode_list(&list, CACHE_BASE).unwrap();
    decode_walk(&code, CACHE_BASE);
}

#[test]
fn test_clean_call_before_syscall_keeps_static_number() {
    // Instrumentation ahead of a syscall must not hide the number from the
    // pre-syscall scan: the injected scratch writes are all meta.
    let bytes = [
        0xb8, 0x27, 0x00, 0x00, 0x00, // mov eax, 39
        0x0f, 0x05, // syscall
        0xc3, // ret
    ];
    let app = AppMemory::new(vec![CodeRegion::new(&bytes, APP_BASE)]).unwrap();
    let (mut list, refs) = decode_block(&app, APP_BASE, 3);
    let tcx = thread_context();
    let descriptor = CleanCallDescriptor::default();

    prepare_clean_call(&mut list, refs[1], &descriptor, &tcx).unwrap();
    insert_call(
        &mut list,
        refs[1],
        CALLEE,
        &[CallArg::Immediate(0)],
        &CallOptions::default(),
        CACHE_BASE,
    )
    .unwrap();
    cleanup_clean_call(&mut list, refs[1], &descriptor, &tcx).unwrap();

    let config = Config::default();
    let fragment = mangle_block(&mut list, &app, &config, &tcx);
    assert!(fragment.flags.contains(FragmentFlags::HAS_SYSCALL));

    // The injected call survives as engine code and the barrier still sits
    // between it and the kernel transition.
    let insns: Vec<_> = list.iter().map(|(_, insn)| insn).collect();
    let call = insns
        .iter()
        .position(|i| i.opcode == Opcode::Call && i.src == Operand::Pc(CALLEE))
        .unwrap();
    let sys = insns.iter().position(|i| i.is_syscall()).unwrap();
    assert!(call < sys);

    assert_eq!(find_static_syscall_number(&list, refs[1]).unwrap(), 39);

    let code = encode_list(&list, CACHE_BASE).unwrap();
    decode_walk(&code, CACHE_BASE);
}
