// Licensed under the Apache License, Version 2.0 <http://www.apache.org/licenses/LICENSE-2.0> or
// the MIT license <http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Doubly-linked instruction list backed by a slot arena.
//!
//! Handles ([`InsnRef`]) are generation-checked: removing an instruction
//! invalidates every outstanding handle to it, and later access reports
//! [`MangleError::StaleHandle`](crate::error::MangleError::StaleHandle)
//! instead of touching a recycled slot.

use crate::{
    error::MangleError,
    insn::{InsnFlags, Instruction, LabelId},
};
use std::collections::HashMap;

/// Handle to an instruction inside one [`InstructionList`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct InsnRef {
    index: u32,
    generation: u32,
}

/// Role of a zero-length label, recorded out of band so later passes can
/// find the marker positions after layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LabelKind {
    /// First instruction of a restartable-sequence region copy.
    RseqStart,
    /// One past the last instruction of a restartable-sequence region copy.
    RseqEnd,
    /// Abort handler entry of a restartable-sequence region.
    RseqAbort,
    /// The instruction whose immediate is patched to point at the
    /// registered critical-section descriptor.
    RseqCs,
}

/// Side data attached to a label.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LabelNote {
    pub kind: LabelKind,
    /// Count of full-width immediate moves between the label and the
    /// patch target, so finalization can skip over them.
    pub immed_count: u32,
}

struct Slot {
    insn: Option<Instruction>,
    generation: u32,
    prev: Option<u32>,
    next: Option<u32>,
}

/// Ordered list of instructions under transformation.
#[derive(Default)]
pub struct InstructionList {
    slots: Vec<Slot>,
    free: Vec<u32>,
    head: Option<u32>,
    tail: Option<u32>,
    len: usize,
    next_label: u32,
    notes: HashMap<LabelId, LabelNote>,
    /// Translation stamped on instructions inserted while set, unless the
    /// instruction already carries one.
    translation_target: Option<u64>,
    /// When set, inserted instructions are marked as products of the
    /// mangling pass.
    our_mangling: bool,
}

impl InstructionList {
    pub fn new() -> InstructionList {
        InstructionList::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Allocate a fresh label identity for this list.
    pub fn new_label(&mut self) -> LabelId {
        let id = LabelId(self.next_label);
        self.next_label += 1;
        id
    }

    pub fn set_label_note(&mut self, id: LabelId, note: LabelNote) {
        self.notes.insert(id, note);
    }

    pub fn label_note(&self, id: LabelId) -> Option<LabelNote> {
        self.notes.get(&id).copied()
    }

    /// Set the application address stamped on subsequently inserted
    /// instructions that do not carry their own translation.
    pub fn set_translation_target(&mut self, target: Option<u64>) {
        self.translation_target = target;
    }

    pub fn translation_target(&self) -> Option<u64> {
        self.translation_target
    }

    /// Mark subsequently inserted instructions as mangling products.
    pub fn set_our_mangling(&mut self, enabled: bool) {
        self.our_mangling = enabled;
    }

    pub fn first(&self) -> Option<InsnRef> {
        self.head.map(|index| self.make_ref(index))
    }

    pub fn last(&self) -> Option<InsnRef> {
        self.tail.map(|index| self.make_ref(index))
    }

    pub fn next(&self, r: InsnRef) -> Result<Option<InsnRef>, MangleError> {
        let slot = self.slot(r)?;
        Ok(slot.next.map(|index| self.make_ref(index)))
    }

    pub fn prev(&self, r: InsnRef) -> Result<Option<InsnRef>, MangleError> {
        let slot = self.slot(r)?;
        Ok(slot.prev.map(|index| self.make_ref(index)))
    }

    pub fn get(&self, r: InsnRef) -> Result<&Instruction, MangleError> {
        match &self.slot(r)?.insn {
            Some(insn) => Ok(insn),
            None => Err(MangleError::StaleHandle),
        }
    }

    pub fn get_mut(&mut self, r: InsnRef) -> Result<&mut Instruction, MangleError> {
        let slot = self.slot_mut(r)?;
        match &mut slot.insn {
            Some(insn) => Ok(insn),
            None => Err(MangleError::StaleHandle),
        }
    }

    /// Append at the end of the list.
    pub fn append(&mut self, insn: Instruction) -> InsnRef {
        let index = self.alloc(insn);
        match self.tail {
            Some(tail) => {
                self.slots[tail as usize].next = Some(index);
                self.slots[index as usize].prev = Some(tail);
            }
            None => self.head = Some(index),
        }
        self.tail = Some(index);
        self.len += 1;
        self.make_ref(index)
    }

    /// Insert before `at`.
    pub fn insert_before(
        &mut self,
        at: InsnRef,
        insn: Instruction,
    ) -> Result<InsnRef, MangleError> {
        self.slot(at)?;
        let index = self.alloc(insn);
        let prev = self.slots[at.index as usize].prev;
        self.slots[index as usize].prev = prev;
        self.slots[index as usize].next = Some(at.index);
        self.slots[at.index as usize].prev = Some(index);
        match prev {
            Some(p) => self.slots[p as usize].next = Some(index),
            None => self.head = Some(index),
        }
        self.len += 1;
        Ok(self.make_ref(index))
    }

    /// Insert after `at`.
    pub fn insert_after(&mut self, at: InsnRef, insn: Instruction) -> Result<InsnRef, MangleError> {
        self.slot(at)?;
        let index = self.alloc(insn);
        let next = self.slots[at.index as usize].next;
        self.slots[index as usize].next = next;
        self.slots[index as usize].prev = Some(at.index);
        self.slots[at.index as usize].next = Some(index);
        match next {
            Some(n) => self.slots[n as usize].prev = Some(index),
            None => self.tail = Some(index),
        }
        self.len += 1;
        Ok(self.make_ref(index))
    }

    /// Unlink and return the instruction at `at`. Outstanding handles to it
    /// become stale.
    pub fn remove(&mut self, at: InsnRef) -> Result<Instruction, MangleError> {
        self.slot(at)?;
        let index = at.index as usize;
        let insn = match self.slots[index].insn.take() {
            Some(insn) => insn,
            None => return Err(MangleError::StaleHandle),
        };
        let prev = self.slots[index].prev.take();
        let next = self.slots[index].next.take();
        match prev {
            Some(p) => self.slots[p as usize].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slots[n as usize].prev = prev,
            None => self.tail = prev,
        }
        self.slots[index].generation = self.slots[index].generation.wrapping_add(1);
        self.free.push(at.index);
        self.len -= 1;
        Ok(insn)
    }

    /// Iterate handle/instruction pairs in list order.
    pub fn iter(&self) -> Iter<'_> {
        Iter { list: self, cursor: self.head }
    }

    fn make_ref(&self, index: u32) -> InsnRef {
        InsnRef { index, generation: self.slots[index as usize].generation }
    }

    fn slot(&self, r: InsnRef) -> Result<&Slot, MangleError> {
        match self.slots.get(r.index as usize) {
            Some(slot) if slot.generation == r.generation && slot.insn.is_some() => Ok(slot),
            _ => Err(MangleError::StaleHandle),
        }
    }

    fn slot_mut(&mut self, r: InsnRef) -> Result<&mut Slot, MangleError> {
        match self.slots.get_mut(r.index as usize) {
            Some(slot) if slot.generation == r.generation && slot.insn.is_some() => Ok(slot),
            _ => Err(MangleError::StaleHandle),
        }
    }

    fn alloc(&mut self, mut insn: Instruction) -> u32 {
        if self.our_mangling {
            insn.flags.insert(InsnFlags::OUR_MANGLING);
        }
        if insn.translation.is_none() {
            insn.translation = self.translation_target;
        }
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.insn = Some(insn);
                slot.prev = None;
                slot.next = None;
                index
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    insn: Some(insn),
                    generation: 0,
                    prev: None,
                    next: None,
                });
                index
            }
        }
    }
}

/// Iterator over `(handle, instruction)` pairs of a list.
pub struct Iter<'a> {
    list: &'a InstructionList,
    cursor: Option<u32>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = (InsnRef, &'a Instruction);

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.cursor?;
        let slot = &self.list.slots[index as usize];
        self.cursor = slot.next;
        let insn = slot.insn.as_ref()?;
        Some((self.list.make_ref(index), insn))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::insn::{OperandSize, RAX, RCX};

    fn mov_node(src: u8, dst: u8) -> Instruction {
        Instruction::mov(OperandSize::S64, src, dst)
    }

    #[test]
    fn test_insert_ordering() {
        let mut list = InstructionList::new();
        let b = list.append(mov_node(RAX, RCX));
        let a = list.insert_before(b, Instruction::noop()).unwrap();
        let c = list.insert_after(b, Instruction::return_near()).unwrap();
        assert_eq!(list.first(), Some(a));
        assert_eq!(list.next(a).unwrap(), Some(b));
        assert_eq!(list.next(b).unwrap(), Some(c));
        assert_eq!(list.next(c).unwrap(), None);
        assert_eq!(list.prev(b).unwrap(), Some(a));
        assert_eq!(list.last(), Some(c));
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn test_stale_handle_detected() {
        let mut list = InstructionList::new();
        let a = list.append(Instruction::noop());
        let b = list.append(Instruction::return_near());
        list.remove(a).unwrap();
        assert_eq!(list.get(a).unwrap_err(), MangleError::StaleHandle);
        assert_eq!(list.remove(a).unwrap_err(), MangleError::StaleHandle);
        // Slot reuse must not resurrect the old handle.
        let c = list.append(Instruction::noop());
        assert_ne!(a, c);
        assert!(list.get(a).is_err());
        assert!(list.get(b).is_ok() && list.get(c).is_ok());
        assert_eq!(list.first(), Some(b));
    }

    #[test]
    fn test_insert_state_stamping() {
        let mut list = InstructionList::new();
        list.set_our_mangling(true);
        list.set_translation_target(Some(0x4000));
        let r = list.append(mov_node(RAX, RCX));
        let insn = list.get(r).unwrap();
        assert!(insn.is_our_mangling());
        assert_eq!(insn.translation, Some(0x4000));
        // An explicit translation wins over the list target.
        let mut tagged = Instruction::noop();
        tagged.translation = Some(0x5000);
        let r = list.append(tagged);
        assert_eq!(list.get(r).unwrap().translation, Some(0x5000));
    }

    #[test]
    fn test_label_notes() {
        let mut list = InstructionList::new();
        let id = list.new_label();
        let other = list.new_label();
        assert_ne!(id, other);
        list.set_label_note(id, LabelNote { kind: LabelKind::RseqCs, immed_count: 1 });
        assert_eq!(
            list.label_note(id),
            Some(LabelNote { kind: LabelKind::RseqCs, immed_count: 1 })
        );
        assert_eq!(list.label_note(other), None);
    }
}
