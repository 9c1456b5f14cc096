//! Compilation of IR nodes into code-arena blobs.
//!
//! Children are compiled before their parent so allocation instructions can
//! name their entry addresses; the parent's environment frame is complete by
//! then, because a child's upvalue requests propagate up through it.

use crate::code::{
    CodeAddr, CodeArena, CompileError, Opcode, Tag, MAX_ALLOC_WORDS, SRC_ENV, SRC_STACK,
};
use crate::env::{mark_used, EnvFrame};
use crate::shuffle::{schedule, Loc, MoveOp, MoveSpec};
use lamc_frontend::{IrArena, Term};
use smallvec::SmallVec;

/// A compiled program: the arena and the entry of the top-level blob.
pub struct CompiledProgram {
    pub code: CodeArena,
    pub entry: CodeAddr,
}

/// Compile the term rooted at `root` into a fresh code arena.
pub fn compile(ir: &IrArena, root: Term) -> Result<CompiledProgram, CompileError> {
    debug_assert_eq!(ir[root].lvl, 0);
    let mut code = CodeArena::new();
    let mut frames: Vec<EnvFrame> = Vec::new();
    let (entry, top) = compile_node(ir, root, &mut frames, &mut code)?;
    debug_assert!(frames.is_empty());
    debug_assert_eq!(top.envc, 0, "a closed term captures nothing");
    log::debug!(
        "compiled {} IR nodes into {} code words, entry {entry}",
        ir.len(),
        code.len()
    );
    Ok(CompiledProgram { code, entry })
}

fn compile_node(
    ir: &IrArena,
    t: Term,
    frames: &mut Vec<EnvFrame>,
    code: &mut CodeArena,
) -> Result<(CodeAddr, EnvFrame), CompileError> {
    let node = &ir[t];
    frames.push(EnvFrame::new(node.lvl));

    mark_used(frames, node.head);
    for &a in &node.args {
        mark_used(frames, a);
    }

    let mut children = Vec::with_capacity(node.lets.len());
    for &l in &node.lets {
        children.push(compile_node(ir, l, frames, code)?);
    }

    let this = frames.pop().unwrap();

    // Header and prologue. Thunks and closures with an empty environment are
    // dynamically sized (info word), see the object layout notes.
    let envc = this.envc;
    let header_size = if envc == 0 { 0 } else { envc + 1 };
    let tag = if node.arity == 0 { Tag::Thunk } else { Tag::Fun };
    code.write_header(header_size, tag);
    let entry = code.next_addr();
    if node.arity == 0 {
        code.push_op(Opcode::ThunkEnter);
    } else {
        code.push_op(Opcode::ArgcCheck);
        code.push(node.arity);
    }

    // Allocate the lets: one heap check for the whole batch, then one Alloc
    // per child. Pushing the object before filling its environment lets a
    // child capture itself.
    if !children.is_empty() {
        let total: u32 = children.iter().map(|(_, f)| object_words(f.envc)).sum();
        if total > MAX_ALLOC_WORDS {
            return Err(CompileError::AllocTooLarge { words: total });
        }
        code.push_op(Opcode::HeapCheck);
        code.push(total);

        let mut lvl = node.lvl + node.arity;
        for (child_entry, child_frame) in &children {
            lvl += 1;
            code.push_op(Opcode::Alloc);
            code.push(child_frame.envc);
            code.push(child_entry.as_u32());

            let mut sources: SmallVec<[(u32, Loc); 8]> = SmallVec::new();
            for v in 0..child_frame.args_start {
                if let Some(slot) = child_frame.upvals[v as usize] {
                    sources.push((slot, resolve(&this, lvl, v)));
                }
            }
            sources.sort_unstable_by_key(|&(slot, _)| slot);
            debug_assert_eq!(sources.len(), child_frame.envc as usize);
            for (_, loc) in sources {
                match loc {
                    Loc::Stack(i) => {
                        code.push(SRC_STACK);
                        code.push(i);
                    }
                    Loc::Env(i) => {
                        code.push(SRC_ENV);
                        code.push(i);
                    }
                }
            }
        }
    }

    // Shuffle into the outgoing frame and make the call.
    let incoming = node.arity + node.lets.len() as u32;
    let outgoing = node.args.len() as u32;
    let slots = incoming.max(outgoing);
    let grow = outgoing.saturating_sub(incoming);
    let lvl = node.lvl + incoming + grow;
    if grow > 0 {
        code.push_op(Opcode::MoreArgs);
        code.push(grow);
    }

    let dest_start = incoming.saturating_sub(outgoing);
    let mut dests = Vec::with_capacity(outgoing as usize);
    for j in 0..outgoing {
        // The last argument lands on top of the outgoing frame.
        let a = node.args[(outgoing - 1 - j) as usize];
        dests.push((dest_start + j, resolve(&this, lvl, a)));
    }
    let spec = MoveSpec {
        slots,
        dests,
        self_dest: resolve(&this, lvl, node.head),
    };
    for op in schedule(&spec) {
        emit_move(code, op);
    }

    let shrink = incoming.saturating_sub(outgoing);
    if shrink > 0 {
        code.push_op(Opcode::FewerArgs);
        code.push(shrink);
    }
    let delta = outgoing as i32 - node.arity as i32;
    if delta != 0 {
        code.push_op(Opcode::AddAc);
        code.push(delta as u32);
    }
    if node.arity == 0 {
        code.push_op(Opcode::BlackholeSelf);
    }
    code.push_op(Opcode::Call);

    code.check_capacity()?;
    Ok((entry, this))
}

fn object_words(envc: u32) -> u32 {
    if envc == 0 {
        2
    } else {
        envc + 1
    }
}

/// Where variable `v` lives in the frame described by `frame`, with `lvl`
/// bindings in scope.
fn resolve(frame: &EnvFrame, lvl: u32, v: u32) -> Loc {
    debug_assert!(v < lvl);
    if v >= frame.args_start {
        Loc::Stack(lvl - v - 1)
    } else {
        Loc::Env(frame.slot(v))
    }
}

fn emit_move(code: &mut CodeArena, op: MoveOp) {
    match op {
        MoveOp::LoadTmpStack(i) => {
            code.push_op(Opcode::LoadTmpStack);
            code.push(i);
        }
        MoveOp::LoadTmpSelf => code.push_op(Opcode::LoadTmpSelf),
        MoveOp::StackToStack { src, dst } => {
            code.push_op(Opcode::MovStack);
            code.push(src);
            code.push(dst);
        }
        MoveOp::EnvToStack { src, dst } => {
            code.push_op(Opcode::MovEnv);
            code.push(src);
            code.push(dst);
        }
        MoveOp::EnvTmpToStack { src, dst } => {
            code.push_op(Opcode::MovEnvTmp);
            code.push(src);
            code.push(dst);
        }
        MoveOp::TmpToStack { dst } => {
            code.push_op(Opcode::WriteTmp);
            code.push(dst);
        }
        MoveOp::StackToSelf { src } => {
            code.push_op(Opcode::SetSelfStack);
            code.push(src);
        }
        MoveOp::EnvToSelf { src } => {
            code.push_op(Opcode::SetSelfEnv);
            code.push(src);
        }
        MoveOp::EnvTmpToSelf { src } => {
            code.push_op(Opcode::SetSelfEnvTmp);
            code.push(src);
        }
        MoveOp::TmpToSelf => code.push_op(Opcode::SetSelfTmp),
    }
}
