// Licensed under the Apache License, Version 2.0 <http://www.apache.org/licenses/LICENSE-2.0> or
// the MIT license <http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Code-cache fragment interface.
//!
//! Fragments are owned by the code-cache subsystem; mangling reads their
//! bounds and writes instrumentation-relevant flags into them, and
//! finalization is handed the final cache address.

use std::fmt;

/// Flags the mangling passes read from and write into a fragment.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct FragmentFlags(u32);

impl FragmentFlags {
    /// Fragment contains an inlined system call.
    pub const HAS_SYSCALL: FragmentFlags = FragmentFlags(0x1);
    /// Fragment contains the endpoint of an rseq region.
    pub const HAS_RSEQ_ENDPOINT: FragmentFlags = FragmentFlags(0x2);
    /// Fragment must never be absorbed into a trace.
    pub const CANNOT_BE_TRACE: FragmentFlags = FragmentFlags(0x4);
    /// Fragment is a trace rather than a basic block.
    pub const IS_TRACE: FragmentFlags = FragmentFlags(0x8);

    pub const fn empty() -> FragmentFlags {
        FragmentFlags(0)
    }
    pub const fn contains(self, other: FragmentFlags) -> bool {
        self.0 & other.0 == other.0
    }
    pub fn insert(&mut self, other: FragmentFlags) {
        self.0 |= other.0;
    }
    pub fn remove(&mut self, other: FragmentFlags) {
        self.0 &= !other.0;
    }
}

impl fmt::Debug for FragmentFlags {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "FragmentFlags({:#x})", self.0)
    }
}

/// One unit of code-cache-resident translated code.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Fragment {
    /// Application address this fragment translates.
    pub tag: u64,
    /// Flags written by mangling and read by the dispatcher.
    pub flags: FragmentFlags,
    /// Cache address of the first body byte, set once the fragment is
    /// placed.
    pub start_pc: u64,
    /// Encoded body length in bytes.
    pub body_len: usize,
}

impl Fragment {
    /// Creates an unplaced fragment for the given application address.
    pub fn new(tag: u64) -> Self {
        Fragment {
            tag,
            ..Fragment::default()
        }
    }

    /// Whether indirect transfers out of this fragment use the trace
    /// lookup routines.
    pub fn is_trace(&self) -> bool {
        self.flags.contains(FragmentFlags::IS_TRACE)
    }
}

/// The kernel's rseq critical-section record. Field order and the 32-byte
/// alignment follow the `struct rseq_cs` ABI.
#[repr(C, align(32))]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RseqCriticalSection {
    pub version: u32,
    pub flags: u32,
    /// Cache address of the replay's first instruction.
    pub start_ip: u64,
    /// Length of the replayed range.
    pub post_commit_offset: u64,
    /// Cache address the kernel transfers to on abort.
    pub abort_ip: u64,
}

/// Allocator for critical-section records. Records outlive the fragment
/// they serve; freeing happens on the external eviction path.
pub trait RseqCsAllocator {
    /// Allocates one record, returning write access for population plus the
    /// stable address the kernel will consult.
    fn allocate(&mut self) -> (&mut RseqCriticalSection, u64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_ops() {
        let mut flags = FragmentFlags::empty();
        flags.insert(FragmentFlags::HAS_SYSCALL);
        flags.insert(FragmentFlags::CANNOT_BE_TRACE);
        assert!(flags.contains(FragmentFlags::HAS_SYSCALL));
        assert!(!flags.contains(FragmentFlags::IS_TRACE));
        flags.remove(FragmentFlags::HAS_SYSCALL);
        assert!(!flags.contains(FragmentFlags::HAS_SYSCALL));
        assert!(flags.contains(FragmentFlags::CANNOT_BE_TRACE));
    }

    #[test]
    fn test_critical_section_abi() {
        assert_eq!(std::mem::size_of::<RseqCriticalSection>(), 32);
        assert_eq!(std::mem::align_of::<RseqCriticalSection>(), 32);
    }
}
