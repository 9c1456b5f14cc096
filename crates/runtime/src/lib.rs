//! Runtime for the lamc lambda-calculus compiler.
//!
//! The runtime executes the word-code emitted by `lamc-codegen` under a
//! trampoline: compiled blobs chain exclusively by tail calls through the
//! self register, and control re-enters the dispatch loop between blobs.
//! Heap objects live in a fixed nursery and a growable old space collected by
//! a generational semispace collector; a thunk is black-holed while it is
//! being forced and becomes an indirection (REF) to its value once forced, so
//! evaluation is call-by-need with exactly-once semantics.
//!
//! The only public entry point is [`normalize`] (and its statistics-reporting
//! sibling), which seeds a top-level thunk, drives evaluation from outside
//! compiled code, and serializes the β-normal form.

mod heap;
mod interp;
pub mod nf;
mod normalize;
mod obj;
mod region;

pub use interp::{RuntimeConfig, RuntimeStats, Trap};
pub use nf::NormalForm;
pub use normalize::{normalize, normalize_with_stats};

// The object layout packs two 32-bit info fields into one word.
const _: () = assert!(std::mem::size_of::<usize>() == 8, "lamc requires a 64-bit target");
