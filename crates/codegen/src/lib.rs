//! Code generation from optimized IL flow graphs.
//!
//! The entry point is [`compiler::compile`], which lowers a flow graph in
//! move-argument form (see `FlowGraph::insert_move_arguments`) to machine
//! instructions for one of the supported architectures, together with the
//! metadata the runtime needs to work with the code.
//!
//! # Code shape
//! * Every SSA value owns a home in the frame: a spill slot, an incoming
//!   parameter slot, or (for constants) nothing at all. Each instruction
//!   gets registers assigned from its [`locations::LocationSummary`],
//!   its inputs are brought into those registers by a single parallel
//!   move, and its output is written back home afterwards. Nothing lives
//!   in a register across instructions, which keeps deoptimization
//!   environments and stack maps trivially precise.
//! * Architecture differences live behind [`backend::ArchCodeEmitter`]:
//!   frame entry and exit, how objects are materialized (through the
//!   object pool on ARM and X64, embedded in the instruction stream on
//!   IA32), smi checks, class-id loads and calls. The driver in
//!   [`compiler`] is shared by all three.
//! * Machine instructions are arch-neutral [`assembler::MachInst`] values.
//!   The assembler assigns each one an architecture-specific encoded size
//!   and opaque bytes, so PC offsets in descriptors behave like offsets
//!   into real code without committing to a bit-exact encoding.
//!
//! # Runtime integration
//! * Values are tagged: a smi is its value shifted left by one, a heap
//!   object is its address plus one. The first word of an object is its
//!   class id. See [`layout`].
//! * Generated code calls runtime-provided stubs and runtime entries
//!   ([`stubs`]). Stubs preserve every register except the ones that
//!   carry their results.
//! * A deoptimizing guard branches to an out-of-line stub call. The
//!   return address of that call identifies an entry of the deopt table,
//!   which describes how to rebuild the unoptimized frames ([`deopt`]).
//! * Every call records a PC descriptor at its return address, plus a
//!   stack map of tagged frame slots ([`compiled_code`]).
//!
//! The [`simulator`] executes generated instruction listings against a
//! small model of the runtime. Tests use it to check generated code end
//! to end on all three architectures.

use compact_str::CompactString;
use ember_il::Bailout;
use thiserror::Error;

pub mod assembler;
pub mod backend;
pub mod compiled_code;
pub mod compiler;
pub mod deopt;
pub mod frame;
pub mod isa;
pub mod layout;
pub mod locations;
pub mod parallel_move;
pub mod simulator;
pub mod stubs;

pub use compiled_code::CompiledCode;
pub use compiler::compile;
pub use isa::Arch;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodegenError {
    #[error(transparent)]
    Bailout(#[from] Bailout),
    #[error("{what} is not supported on {arch}")]
    Unsupported { arch: Arch, what: CompactString },
}
