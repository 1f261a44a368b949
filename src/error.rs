// Licensed under the Apache License, Version 2.0 <http://www.apache.org/licenses/LICENSE-2.0> or
// the MIT license <http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! This module contains the error and fatal-report definitions.
//!
//! Every mangling boundary returns `Result` so internals stay testable.
//! Failures split into two classes: engine-internal conditions (stale
//! handles, unencodable nodes) and unsupported application patterns, which
//! the top-level policy converts into a fatal report and process exit.

/// Error definitions
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MangleError {
    /// Instruction handle outlived the instruction it named
    #[error("stale instruction handle")]
    StaleHandle,
    /// Label operand never placed in the list being encoded
    #[error("unresolved label {0}")]
    UnresolvedLabel(u32),
    /// Instruction node has no valid encoding
    #[error("malformed instruction")]
    MalformedInstruction,
    /// Relative branch displacement does not fit its encoding
    #[error("branch at {0:#x} cannot reach {1:#x}")]
    BranchOutOfReach(u64, u64),
    /// Bytes at the given address do not decode
    #[error("undecodable instruction at {0:#x}")]
    UndecodableInstruction(u64),
    /// Address not covered by any mapped code region
    #[error("unmapped application address {0:#x}")]
    UnmappedAddress(u64),
    /// Overlapping or malformed code region
    #[error("invalid code region {0}")]
    InvalidCodeRegion(usize),
    /// Fragment finalization could not find an expected rseq label
    #[error("missing rseq label in finalized fragment")]
    MissingRseqLabel,
    /// Rseq region leaves no general-purpose register usable as scratch
    #[error("Rseq sequence writes every general-purpose register ({0:#x})")]
    RseqWritesAllRegisters(u64),
    /// Rseq region end address falls inside an instruction
    #[error("Malformed rseq endpoint: not on instruction boundary ({0:#x})")]
    RseqEndpointMisaligned(u64),
    /// Rseq region ends on a control transfer
    #[error("Rseq sequences must fall through their endpoints ({0:#x})")]
    RseqEndpointIsCti(u64),
    /// Rseq region does not end in a return under the call-return strategy
    #[error("Rseq sequences must end with a return ({0:#x})")]
    RseqMissingReturn(u64),
    /// Store with more than one destination inside an rseq region
    #[error("Store inside rseq region has multiple destinations ({0:#x})")]
    RseqMultiDestinationStore(u64),
    /// Undecodable bytes inside an rseq region
    #[error("Invalid instruction inside rseq region ({0:#x})")]
    RseqInvalidInstruction(u64),
    /// Application instruction uses a segment override the engine cannot
    /// virtualize
    #[error("Unsupported segment override in application instruction ({0:#x})")]
    UnsupportedSegmentReference(u64),
}

impl MangleError {
    /// Whether this error reports an application pattern the engine does
    /// not support, as opposed to an engine-internal condition. These are
    /// the errors [`report_fatal_and_exit`] exists for.
    pub fn is_unsupported_app_pattern(&self) -> bool {
        matches!(
            self,
            MangleError::RseqWritesAllRegisters(_)
                | MangleError::RseqEndpointMisaligned(_)
                | MangleError::RseqEndpointIsCti(_)
                | MangleError::RseqMissingReturn(_)
                | MangleError::RseqMultiDestinationStore(_)
                | MangleError::RseqInvalidInstruction(_)
                | MangleError::UnsupportedSegmentReference(_)
        )
    }
}

/// Top-level policy for unsupported application patterns: print a
/// diagnostic identifying the application and condition, then terminate.
/// Nothing below this function exits the process.
pub fn report_fatal_and_exit(error: &MangleError, app_name: &str) -> ! {
    let pid = unsafe { libc::getpid() };
    log::error!("<Application {} ({}). {}>", app_name, pid, error);
    std::process::exit(1);
}
