//! β-normalization by evaluation.
//!
//! The quoter drives the evaluator from outside compiled code. Evaluating
//! under a binder is done by applying the value to a fresh rigid term (a free
//! variable); applications of rigid terms accumulate, and their arguments are
//! pushed on the data stack as a worklist so the serialized normal form comes
//! out in pre-order.

use crate::interp::{Machine, RuntimeConfig, RuntimeStats, Trap};
use crate::nf::{NormalForm, LAM, NE};
use crate::obj::Obj;
use lamc_codegen::{CodeAddr, CodeArena, Tag};

/// Reduce the program whose top-level blob is `entry` to β-normal form.
pub fn normalize(
    code: &CodeArena,
    entry: CodeAddr,
    config: &RuntimeConfig,
) -> Result<NormalForm, Trap> {
    normalize_with_stats(code, entry, config).map(|(nf, _)| nf)
}

/// Like [`normalize`], also reporting evaluation counters.
pub fn normalize_with_stats(
    code: &CodeArena,
    entry: CodeAddr,
    config: &RuntimeConfig,
) -> Result<(NormalForm, RuntimeStats), Trap> {
    let mut machine = Machine::new(code, config);

    // The top-level blob captures nothing, so it makes a well-formed
    // two-word object (entry plus info word).
    let main = machine.alloc(2, entry)?;
    main.set_info(2, 0);
    machine.self_obj = Some(main);

    let nf = quote(&mut machine)?;
    let stats = machine.stats();
    log::debug!(
        "normalized: {} nf words, {} thunks, {} minor / {} major gcs",
        nf.words().len(),
        stats.thunks_entered,
        stats.minor_gcs,
        stats.major_gcs
    );
    Ok((nf, stats))
}

/// Evaluate the self register to a value (FUN, PAP, or RIGID).
fn eval(m: &mut Machine) -> Result<(), Trap> {
    loop {
        match m.cur_self().tag(m.code) {
            Tag::Fun | Tag::Pap | Tag::Rigid => return Ok(()),
            Tag::Ref => {
                let target = m.compress_refs(m.cur_self());
                m.self_obj = Some(target);
            }
            Tag::Thunk => {
                // A fresh blackhole serves as the update slot; the thunk
                // prologue folds it away and updates the thunk itself.
                let bh = m.alloc(2, m.code.builtins().blackhole_entry)?;
                bh.set_info(2, 0);
                m.push(bh.word());
                m.ac = 0;
                m.run()?;
                m.update_thunk();
                return Ok(());
            }
            Tag::Blackhole => return Err(Trap::BlackHole),
            Tag::Forward => unreachable!("forward objects exist only inside gc"),
        }
    }
}

/// Apply the value in self to `arg`, leaving the result in self.
fn apply(m: &mut Machine, arg: Obj) -> Result<(), Trap> {
    // Push the argument first so it is a root while the update slot is
    // allocated, then slide it above the slot.
    m.push(arg.word());
    let bh = m.alloc(2, m.code.builtins().blackhole_entry)?;
    bh.set_info(2, 0);
    let arg = m.stack[m.sp];
    m.stack[m.sp] = bh.word();
    m.push(arg);
    m.ac = 1;
    m.run()?;
    m.update_thunk();
    Ok(())
}

/// Serialize the β-normal form of the value seeded in self.
fn quote(m: &mut Machine) -> Result<NormalForm, Trap> {
    let mut buf: Vec<u32> = Vec::with_capacity(16);
    let mut next_var = 0u32;

    eval(m)?;

    // The data stack doubles as the worklist of argument objects still to be
    // quoted.
    let worklist_base = m.sp;
    loop {
        match m.cur_self().tag(m.code) {
            Tag::Fun | Tag::Pap => {
                // A function value: emit `λ v.` and quote its body by
                // applying it to the fresh free variable v.
                buf.push(LAM);
                buf.push(next_var);
                let x = m.alloc(2, m.code.builtins().rigid_entry)?;
                x.set_info(2, next_var);
                next_var += 1;
                apply(m, x)?;
            }
            Tag::Rigid => {
                let rigid = m.cur_self();
                let argc = rigid.info_size() - 2;
                buf.push(NE);
                buf.push(argc);
                buf.push(rigid.info_var());
                // First argument on top: pre-order serialization.
                m.sp -= argc as usize;
                for i in 0..argc {
                    m.stack[m.sp + i as usize] = rigid.contents(1 + i);
                }
                if m.sp == worklist_base {
                    return Ok(NormalForm::new(buf));
                }
                let next = Obj::from_word(m.pop());
                m.self_obj = Some(next);
                eval(m)?;
            }
            tag => unreachable!("quote saw non-value tag {tag:?}"),
        }
    }
}
