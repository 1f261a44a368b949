// Licensed under the Apache License, Version 2.0 <http://www.apache.org/licenses/LICENSE-2.0> or
// the MIT license <http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Engine configuration settings

/// Mangling configuration settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Replay rseq regions by calling them as routines instead of copying
    /// their bodies; requires every region to end in a return
    pub rseq_assume_call: bool,
    /// Widen short-offset exit branches to near form so fragments can be
    /// placed anywhere in the cache
    pub widen_exit_branches: bool,
    /// Record translation addresses on inserted instructions for fragments
    /// mangled without an explicit request
    pub record_translation: bool,
    /// Follow non-restartable syscalls with a translation-tagged no-op so
    /// suspension never reports the syscall's own address
    pub pad_nonrestartable_syscalls: bool,
    /// Rewrite application segment-override memory references to go through
    /// the stolen segment's saved base
    pub mangle_app_seg: bool,
    /// Maintain the where-am-i field around injected calls
    pub track_where_am_i: bool,
    /// Size of the per-thread engine stack that clean calls switch to
    pub engine_stack_size: usize,
    /// Value emitted for addresses only known at finalization; large enough
    /// that the encoder always picks the eight-byte immediate form the
    /// finalization patch needs
    pub placeholder_immediate: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rseq_assume_call: false,
            widen_exit_branches: true,
            record_translation: false,
            pad_nonrestartable_syscalls: true,
            mangle_app_seg: false,
            track_where_am_i: true,
            engine_stack_size: 56 * 1024,
            placeholder_immediate: 0x8000_0000,
        }
    }
}
