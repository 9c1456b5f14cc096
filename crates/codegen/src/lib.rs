//! Code emission for the lamc lambda-calculus compiler.
//!
//! Each IR node compiles to a blob of word-code in a single code arena. A
//! blob's shape is always: prologue (arity or thunk-entry check), one heap
//! check covering all of the node's let allocations, the allocations, the
//! parallel-move schedule realigning the data stack and the self register for
//! the tail call, the argument-count adjustment, and the tail call itself.
//!
//! The arena also carries the GC header (size and tag) immediately before
//! every entry point; heap objects store entry addresses, so an object's tag
//! and size are found by looking two words before its entry. The runtime's
//! built-in entry points (REF, PAP, RIGID, BLACKHOLE, FORWARD) are emitted at
//! the front of every arena with headers of their own.

pub mod code;
pub mod emit;
pub mod env;
pub mod shuffle;

pub use code::{Builtins, CodeAddr, CodeArena, CompileError, GcHeader, Opcode, Tag, SRC_ENV, SRC_STACK};
pub use emit::{compile, CompiledProgram};
