// Licensed under the Apache License, Version 2.0 <http://www.apache.org/licenses/LICENSE-2.0> or
// the MIT license <http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Restartable sequence (rseq) mangling.
//!
//! An rseq region registered with the kernel must run from its start to its
//! commit point without migration or preemption, with a kernel-forced branch
//! to an abort handler otherwise. Instrumented execution cannot keep that
//! contract: inserted code lengthens the window and the region runs at a
//! different address, so the kernel's bounds no longer match. The scheme
//! here runs the region twice. The instrumented pass executes with every
//! store removed, so observation happens without side effects and without
//! rseq semantics. At the region's endpoint a verbatim copy of the region
//! is appended to the fragment and run natively, bracketed by code that
//! points the thread's rseq descriptor at the copy's bounds, so the kernel
//! applies its protocol to the copy alone.
//!
//! Register state written during the instrumented pass is checkpointed at
//! region entry and restored before the native copy runs, since the copy
//! must observe entry values. The descriptor itself cannot be allocated
//! until fragment layout is final; mangling leaves a patchable placeholder
//! and [`mangle_rseq_finalize`] fills in the real addresses.

use crate::{
    config::Config,
    context::{rseq_entry_slot, ThreadContext, TlsSlot},
    decode::decode,
    error::MangleError,
    fragment::{Fragment, FragmentFlags, RseqCsAllocator},
    ilist::{InsnRef, InstructionList, LabelKind, LabelNote},
    insn::{
        BranchType, Instruction, MemRef, Operand, OperandSize, Segment, GPR_COUNT, RAX, RSP,
    },
    memory::AppMemory,
    x86::{instruction_length, patch_mov_immed},
};
use log::{debug, trace};

/// Longest x86 instruction encoding, the read window for decoding app code.
const DECODE_WINDOW: usize = 16;

/// Signature glibc registers with the kernel when it enables rseq; the four
/// bytes before an abort handler must match it.
pub const RSEQ_DEFAULT_SIGNATURE: u32 = 0x5305_3053;

/// Bounds and side data of one registered rseq region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RseqRegion {
    /// First application address of the region.
    pub start: u64,
    /// Application address of the commit point, one past the last
    /// instruction of the region.
    pub end: u64,
    /// Application address of the abort handler.
    pub handler: u64,
    /// Bitmask of general-purpose registers the region writes, indexed by
    /// encoding number.
    pub reg_written: u16,
}

impl RseqRegion {
    fn writes_reg(&self, reg: u8) -> bool {
        self.reg_written & (1 << reg) != 0
    }
}

/// Registry of the application's rseq regions, consulted while mangling.
#[derive(Clone, Debug)]
pub struct RseqRegions {
    regions: Vec<RseqRegion>,
    signature: u32,
}

impl Default for RseqRegions {
    fn default() -> RseqRegions {
        RseqRegions::new(RSEQ_DEFAULT_SIGNATURE)
    }
}

impl RseqRegions {
    /// Creates an empty registry carrying the abort signature the
    /// application registered with the kernel.
    pub fn new(signature: u32) -> RseqRegions {
        RseqRegions {
            regions: Vec::new(),
            signature,
        }
    }

    /// Records a region. Regions are expected not to overlap; lookup
    /// returns the first match.
    pub fn register(&mut self, region: RseqRegion) {
        debug!(
            "registering rseq region {:#x}-{:#x} handler {:#x}",
            region.start, region.end, region.handler
        );
        self.regions.push(region);
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// The abort signature preceding every abort handler entry.
    pub fn signature(&self) -> u32 {
        self.signature
    }

    /// Whether `pc` falls inside any registered region.
    pub fn overlaps(&self, pc: u64) -> bool {
        self.region_for(pc).is_some()
    }

    /// The region containing `pc`, if any.
    pub fn region_for(&self, pc: u64) -> Option<&RseqRegion> {
        self.regions
            .iter()
            .find(|region| pc >= region.start && pc < region.end)
    }
}

/// Insertion cursor pinned before a fixed list position; an absent position
/// appends at the end, mirroring how the endpoint of a block has no
/// successor.
struct Cursor<'a> {
    list: &'a mut InstructionList,
    before: Option<InsnRef>,
}

impl Cursor<'_> {
    fn insert(&mut self, insn: Instruction) -> Result<InsnRef, MangleError> {
        match self.before {
            Some(at) => self.list.insert_before(at, insn),
            None => Ok(self.list.append(insn)),
        }
    }

    fn insert_meta(&mut self, mut insn: Instruction) -> Result<InsnRef, MangleError> {
        insn.set_meta();
        self.insert(insn)
    }
}

/// Mangles one app instruction that lies inside a registered rseq region.
/// Returns whether the instruction was removed from the list; the caller
/// must not touch it again when so.
///
/// Three concerns meet here, in order. At the region's first instruction
/// the entry values of every register the region writes are checkpointed,
/// ahead of anything else in the fragment. At the region's last instruction
/// the native re-execution is materialized (the call-based variant under
/// [`Config::rseq_assume_call`], otherwise the local copy, which updates
/// `next_instr` so mangling continues over the inserted copy). Finally any
/// store is removed from the instrumented pass, including one at the
/// endpoint itself.
#[allow(clippy::too_many_arguments)]
pub(crate) fn mangle_rseq(
    ilist: &mut InstructionList,
    fragment: &mut Fragment,
    instr: InsnRef,
    next_instr: &mut Option<InsnRef>,
    app: &AppMemory,
    regions: &RseqRegions,
    tcx: &ThreadContext,
    config: &Config,
) -> Result<bool, MangleError> {
    let insn = ilist.get(instr)?;
    let pc = insn.translation.ok_or(MangleError::MalformedInstruction)?;
    // Region arithmetic needs the length of the application instruction at
    // pc, not of whatever node stands in for it now; an addressing fixup may
    // already have replaced the node with a differently-sized form.
    let len = if insn.raw_matches_translation() {
        instruction_length(insn) as u64
    } else {
        let bytes = app.slice_at(pc, DECODE_WINDOW)?;
        let (_, n) = decode(bytes, pc).map_err(|_| MangleError::RseqInvalidInstruction(pc))?;
        n as u64
    };
    let writes_memory = insn.writes_memory();
    let destinations = insn.destination_count();
    let region = match regions.region_for(pc) {
        Some(region) => *region,
        None => return Ok(false),
    };

    // Scratch is the lowest register the region does not write.
    let mut scratch = RAX;
    let mut written_count = 0;
    for reg in 0..GPR_COUNT as u8 {
        if region.writes_reg(reg) {
            if reg == scratch {
                scratch += 1;
            }
            written_count += 1;
        }
    }
    if usize::from(scratch) == GPR_COUNT {
        return Err(MangleError::RseqWritesAllRegisters(region.start));
    }

    if pc == region.start && written_count > 0 {
        insert_entry_checkpoint(ilist, &region, scratch)?;
    }

    if pc.wrapping_add(len) >= region.end {
        fragment.flags.insert(FragmentFlags::HAS_RSEQ_ENDPOINT);
        fragment.flags.insert(FragmentFlags::CANNOT_BE_TRACE);
        if pc.wrapping_add(len) != region.end {
            return Err(MangleError::RseqEndpointMisaligned(pc));
        }
        if ilist.get(instr)?.is_cti() {
            return Err(MangleError::RseqEndpointIsCti(pc));
        }
        if config.rseq_assume_call {
            insert_call_sequence(ilist, *next_instr, &region, scratch, app)?;
        } else {
            let resume =
                insert_native_sequence(ilist, *next_instr, &region, scratch, app, regions, tcx, config)?;
            *next_instr = Some(resume);
        }
    }

    // The instrumented pass must not write memory anywhere in the region:
    // the thread may be on the wrong cpu, touching per-cpu data some other
    // thread owns right now. Removing the store only works when the store
    // is the instruction's sole effect.
    if !writes_memory {
        return Ok(false);
    }
    if destinations > 1 {
        return Err(MangleError::RseqMultiDestinationStore(pc));
    }
    debug!("removing store inside rseq region at {:#x}", pc);
    ilist.remove(instr)?;
    Ok(true)
}

/// Saves the entry value of every region-written register to the per-thread
/// entry-state slots, ahead of the whole fragment so instrumentation cannot
/// have moved the values yet.
fn insert_entry_checkpoint(
    ilist: &mut InstructionList,
    region: &RseqRegion,
    scratch: u8,
) -> Result<(), MangleError> {
    let first = ilist.first().ok_or(MangleError::StaleHandle)?;
    let mut cursor = Cursor {
        list: ilist,
        before: Some(first),
    };
    cursor.insert_meta(Instruction::store(
        OperandSize::S64,
        scratch,
        TlsSlot::Reg0.mem(),
    ))?;
    cursor.insert_meta(Instruction::load(
        OperandSize::S64,
        TlsSlot::Context.mem(),
        scratch,
    ))?;
    for reg in 0..GPR_COUNT as u8 {
        if region.writes_reg(reg) {
            cursor.insert_meta(Instruction::store(
                OperandSize::S64,
                reg,
                MemRef::base_disp(scratch, rseq_entry_slot(reg)),
            ))?;
        }
    }
    cursor.insert_meta(Instruction::load(
        OperandSize::S64,
        TlsSlot::Reg0.mem(),
        scratch,
    ))?;
    Ok(())
}

/// Native re-execution via an extra call frame: loads the checkpointed
/// entry state and calls the region start, assuming the region behaves as
/// a leaf callee whose endpoint is a return. The simpler of the two
/// strategies, kept for applications known to follow call-return shape.
fn insert_call_sequence(
    ilist: &mut InstructionList,
    insert_at: Option<InsnRef>,
    region: &RseqRegion,
    scratch: u8,
    app: &AppMemory,
) -> Result<(), MangleError> {
    debug!("inserting call to native rseq sequence {:#x}", region.start);
    let bytes = app.slice_at(region.end, DECODE_WINDOW)?;
    let (check, _) =
        decode(bytes, region.end).map_err(|_| MangleError::RseqMissingReturn(region.end))?;
    if !check.is_return() {
        return Err(MangleError::RseqMissingReturn(region.end));
    }

    let mut cursor = Cursor {
        list: ilist,
        before: insert_at,
    };
    cursor.insert_meta(Instruction::store(
        OperandSize::S64,
        scratch,
        TlsSlot::Reg0.mem(),
    ))?;
    cursor.insert_meta(Instruction::load(
        OperandSize::S64,
        TlsSlot::Context.mem(),
        scratch,
    ))?;
    for reg in 0..GPR_COUNT as u8 {
        if region.writes_reg(reg) {
            cursor.insert_meta(Instruction::load(
                OperandSize::S64,
                MemRef::base_disp(scratch, rseq_entry_slot(reg)),
                reg,
            ))?;
        }
    }
    // A direct call may not reach the region, so call indirectly through a
    // spill slot rather than burning a register on the target.
    cursor.insert_meta(Instruction::load_pointer_immediate(
        scratch,
        region.start as i64,
    ))?;
    cursor.insert_meta(Instruction::store(
        OperandSize::S64,
        scratch,
        TlsSlot::Reg1.mem(),
    ))?;
    cursor.insert_meta(Instruction::load(
        OperandSize::S64,
        TlsSlot::Reg0.mem(),
        scratch,
    ))?;
    // The region ran as a leaf, so the stack is 16-aligned here and the
    // call pushes us to the alignment its body saw originally.
    cursor.insert_meta(Instruction::sub_immediate(OperandSize::S64, RSP, 8))?;
    cursor.insert_meta(Instruction::call_mem(TlsSlot::Reg1.mem()))?;
    cursor.insert_meta(Instruction::add_immediate(OperandSize::S64, RSP, 8))?;
    Ok(())
}

/// Native re-execution via a verbatim local copy of the region, bracketed
/// by code pointing the thread's rseq descriptor at the copy. Returns the
/// position mangling must resume from, so the segment reference and the
/// copied instructions themselves get mangled.
#[allow(clippy::too_many_arguments)]
fn insert_native_sequence(
    ilist: &mut InstructionList,
    insert_at: Option<InsnRef>,
    region: &RseqRegion,
    scratch: u8,
    app: &AppMemory,
    regions: &RseqRegions,
    tcx: &ThreadContext,
    config: &Config,
) -> Result<InsnRef, MangleError> {
    debug!("inserting native rseq sequence {:#x}", region.start);
    let mut cursor = Cursor {
        list: ilist,
        before: insert_at,
    };
    // Slot 1 for scratch: slot 0 may be live in segment mangling below.
    cursor.insert_meta(Instruction::store(
        OperandSize::S64,
        scratch,
        TlsSlot::Reg1.mem(),
    ))?;
    if region.reg_written != 0 {
        cursor.insert_meta(Instruction::load(
            OperandSize::S64,
            TlsSlot::Context.mem(),
            scratch,
        ))?;
        for reg in 0..GPR_COUNT as u8 {
            if region.writes_reg(reg) {
                cursor.insert_meta(Instruction::load(
                    OperandSize::S64,
                    MemRef::base_disp(scratch, rseq_entry_slot(reg)),
                    reg,
                ))?;
            }
        }
    }

    // Abort handler block. The kernel transfers here on preemption of the
    // copy; the jump leaves the cache for the app's own handler. The
    // signature must occupy the four bytes before the handler entry, and
    // embedding it as a payload no-op keeps the fragment decodable.
    let skip_abort = cursor.list.new_label();
    cursor.insert_meta(Instruction::jump_short(Operand::Label(skip_abort)))?;
    cursor.insert_meta(Instruction::noop_with_payload(regions.signature()))?;
    let abort = cursor.list.new_label();
    cursor.list.set_label_note(
        abort,
        LabelNote {
            kind: LabelKind::RseqAbort,
            immed_count: 0,
        },
    );
    cursor.insert_meta(Instruction::label(abort))?;
    let mut to_handler = Instruction::jump(Operand::Pc(region.handler));
    to_handler.set_exit(BranchType::DirectJump);
    cursor.insert(to_handler)?;
    cursor.insert_meta(Instruction::label(skip_abort))?;

    // Point the thread's rseq descriptor slot at a critical-section record
    // bounding the copy. The record cannot exist until layout is final, so
    // a full-width immediate placeholder is patched in finalization; the
    // label in front of it marks the patch position.
    let cs = cursor.list.new_label();
    cursor.list.set_label_note(
        cs,
        LabelNote {
            kind: LabelKind::RseqCs,
            immed_count: 1,
        },
    );
    cursor.insert_meta(Instruction::label(cs))?;
    cursor.insert_meta(Instruction::load_pointer_immediate(
        scratch,
        config.placeholder_immediate,
    ))?;
    // App-visible store through the app's TLS segment; mangling resumes
    // here so segment handling applies to it and to the copy below.
    let resume = cursor.insert(Instruction::store(
        OperandSize::S64,
        scratch,
        MemRef::seg_disp(Segment::Fs, tcx.rseq_cs_offset),
    ))?;
    cursor.insert_meta(Instruction::load(
        OperandSize::S64,
        TlsSlot::Reg1.mem(),
        scratch,
    ))?;

    // The local copy. Branches staying inside the region keep their raw
    // bytes and stay meta, so the copy's internal layout and displacements
    // survive emission untouched. Everything else is app-visible and will
    // be mangled like any block instruction, turning region exits into
    // fragment exits.
    let start = cursor.list.new_label();
    cursor.list.set_label_note(
        start,
        LabelNote {
            kind: LabelKind::RseqStart,
            immed_count: 0,
        },
    );
    cursor.insert_meta(Instruction::label(start))?;
    let mut pc = region.start;
    while pc < region.end {
        let bytes = app.slice_at(pc, DECODE_WINDOW)?;
        let (mut copy, len) =
            decode(bytes, pc).map_err(|_| MangleError::RseqInvalidInstruction(pc))?;
        let intra = match copy.target() {
            Some(Operand::Pc(tgt)) => {
                (copy.is_cbr() || copy.is_ubr()) && tgt >= region.start && tgt < region.end
            }
            _ => false,
        };
        if intra {
            copy.raw = Some(bytes[..len].to_vec().into_boxed_slice());
            cursor.insert_meta(copy)?;
        } else {
            cursor.insert(copy)?;
        }
        pc = pc.wrapping_add(len as u64);
    }
    let end = cursor.list.new_label();
    cursor.list.set_label_note(
        end,
        LabelNote {
            kind: LabelKind::RseqEnd,
            immed_count: 0,
        },
    );
    cursor.insert_meta(Instruction::label(end))?;

    // Clear the descriptor slot on the fall-through path, so a freed record
    // never leaves a dangling pointer for the kernel to trip over.
    cursor.insert(Instruction::store_immediate(
        OperandSize::S64,
        MemRef::seg_disp(Segment::Fs, tcx.rseq_cs_offset),
        0,
    ))?;
    Ok(resume)
}

/// Patches the critical-section placeholder once fragment layout is known.
///
/// Walks the list accumulating encoded offsets, collects the start, end and
/// abort label positions, fills a freshly allocated descriptor with them
/// and writes its address over the placeholder immediate in `code`.
pub(crate) fn mangle_rseq_finalize(
    ilist: &InstructionList,
    fragment: &Fragment,
    code: &mut [u8],
    allocator: &mut dyn RseqCsAllocator,
) -> Result<(), MangleError> {
    let mut pc = fragment.start_pc;
    let mut start = None;
    let mut end = None;
    let mut abort = None;
    let mut cs_off = None;
    for (_, insn) in ilist.iter() {
        if let Some(id) = insn.label_id() {
            if let Some(note) = ilist.label_note(id) {
                match note.kind {
                    LabelKind::RseqStart => start = Some(pc),
                    LabelKind::RseqEnd => end = Some(pc),
                    LabelKind::RseqAbort => abort = Some(pc),
                    LabelKind::RseqCs => {
                        debug_assert_eq!(note.immed_count, 1);
                        cs_off = Some((pc - fragment.start_pc) as usize);
                    }
                }
            }
        }
        pc += instruction_length(insn) as u64;
    }
    let (start, end, abort, cs_off) = match (start, end, abort, cs_off) {
        (Some(s), Some(e), Some(a), Some(c)) => (s, e, a, c),
        _ => return Err(MangleError::MissingRseqLabel),
    };
    trace!(
        "rseq fragment {:#x}: start={:#x} end={:#x} abort={:#x}",
        fragment.tag,
        start,
        end,
        abort
    );
    let (record, address) = allocator.allocate();
    record.version = 0;
    record.flags = 0;
    record.start_ip = start;
    record.post_commit_offset = end - start;
    record.abort_ip = abort;
    patch_mov_immed_at(code, cs_off, address)
}

fn patch_mov_immed_at(code: &mut [u8], offset: usize, value: u64) -> Result<(), MangleError> {
    match code.get_mut(offset..) {
        Some(slice) => patch_mov_immed(slice, value),
        None => Err(MangleError::MalformedInstruction),
    }
}
