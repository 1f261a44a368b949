// Licensed under the Apache License, Version 2.0 <http://www.apache.org/licenses/LICENSE-2.0> or
// the MIT license <http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Instruction-stream mangling for a dynamic binary instrumentation engine
//! on x86-64 Linux.
//!
//! The engine executes the application out of a code cache: basic blocks are
//! decoded into fragments, rewritten so the engine keeps control at every
//! boundary, and only then emitted. This crate is that rewriting layer. A
//! fragment builder decodes application bytes into an
//! [`InstructionList`](ilist::InstructionList), hands the list to
//! [`mangle()`], encodes the result with [`x86::encode_list`], and calls
//! [`finalize()`] once the fragment has its cache address.
//!
//! The mangling pass covers:
//!
//!  * direct and indirect calls, returns and indirect jumps, rewritten so
//!    no control transfer leaves the cache without the engine seeing it;
//!  * inlined system calls, bracketed with a patchable exit barrier
//!    ([`patch_syscall_exit`]) so a pending signal can stop the thread
//!    before the kernel transition;
//!  * restartable sequences ([`rseq`](mod@rseq)), run once instrumented
//!    with stores elided and once more natively for the real side effects;
//!  * rip-relative addressing and, optionally, segment-based thread-local
//!    references, fixed up for execution away from the original location.
//!
//! [`clean_call`](mod@clean_call) provides the context switch that brackets
//! calls into instrumentation code: a stack switch to the engine stack, a
//! full register save in machine-context layout, and argument set-up per
//! the System V ABI.
//!
//! Unsupported application patterns surface as [`MangleError`] values with
//! [`MangleError::is_unsupported_app_pattern`] set; embedders that want the
//! reference behavior forward them to [`report_fatal_and_exit`].

pub mod clean_call;
pub mod config;
pub mod context;
pub mod decode;
pub mod error;
pub mod fragment;
pub mod ilist;
pub mod insn;
pub mod mangle;
pub mod memory;
pub mod rseq;
pub mod syscall;
pub mod x86;

pub use crate::{
    clean_call::{cleanup_clean_call, insert_call, prepare_clean_call},
    config::Config,
    error::{report_fatal_and_exit, MangleError},
    mangle::{finalize, mangle},
    syscall::{find_static_syscall_number, patch_syscall_exit, syscall_is_restartable},
};
