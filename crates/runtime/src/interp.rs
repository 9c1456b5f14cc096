//! The trampoline interpreter and the runtime helpers.
//!
//! Compiled blobs chain by tail calls through the self register: a blob ends
//! in `Call` and the dispatch loop re-enters whatever the self register's
//! entry word names. A helper that has produced a value "returns in self":
//! if a thunk was entered under arguments the control stack holds its saved
//! argument count: the thunk is updated and the value re-entered. Otherwise
//! control returns to the driver (the quoter's eval/apply), which performs
//! the update itself.
//!
//! The five machine roles of the calling convention are fields here: the
//! self register, the data-stack pointer, the nursery allocation pointer and
//! limit (owned by [`Heap`]), and the argument count.

use crate::heap::{Heap, Roots};
use crate::obj::{Obj, Word};
use lamc_codegen::{CodeAddr, CodeArena, Opcode, SRC_STACK};
use std::fmt;

/// Sizes of the runtime's fixed resources.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Nursery size in bytes; the old space starts at twice this.
    pub nursery_bytes: usize,
    /// Data-stack size in bytes. The evaluator assumes it never overflows.
    pub stack_bytes: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            nursery_bytes: 3 * 1024 * 1024,
            stack_bytes: 8 * 1024 * 1024,
        }
    }
}

/// Counters exposed for logging and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuntimeStats {
    pub minor_gcs: u64,
    pub major_gcs: u64,
    /// Thunk bodies actually entered; a shared thunk counts once.
    pub thunks_entered: u64,
    pub paps_created: u64,
    pub rigids_grown: u64,
}

/// Fatal runtime conditions. Nothing is retried and nothing is surfaced to
/// the source program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trap {
    /// A black-holed thunk was forced again: the program diverges.
    BlackHole,
    /// An allocation could not be satisfied even after collection.
    OutOfMemory,
}

impl fmt::Display for Trap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Trap::BlackHole => write!(f, "black hole (infinite loop?)"),
            Trap::OutOfMemory => write!(f, "heap exhausted"),
        }
    }
}

impl std::error::Error for Trap {}

/// Outcome of one dispatch step.
enum Step {
    /// Keep going: the self register names the next code to enter.
    Tail,
    /// A value is in the self register.
    Value,
}

pub(crate) struct Machine<'a> {
    pub(crate) code: &'a CodeArena,
    pub(crate) heap: Heap,
    pub(crate) stack: Box<[Word]>,
    /// Index of the top of the data stack; the stack grows downward.
    pub(crate) sp: usize,
    pub(crate) self_obj: Option<Obj>,
    pub(crate) ac: usize,
    /// The shuffle's single scratch register.
    tmp: Word,
    /// Saved argument counts of thunks entered under arguments.
    saved_acs: Vec<usize>,
    pub(crate) thunks_entered: u64,
    pub(crate) paps_created: u64,
    pub(crate) rigids_grown: u64,
}

impl<'a> Machine<'a> {
    pub fn new(code: &'a CodeArena, config: &RuntimeConfig) -> Machine<'a> {
        let word = std::mem::size_of::<Word>();
        let nursery_words = (config.nursery_bytes / word).max(1024);
        let stack_words = (config.stack_bytes / word).max(1024);
        Machine {
            code,
            heap: Heap::new(nursery_words),
            stack: vec![0; stack_words].into_boxed_slice(),
            sp: stack_words,
            self_obj: None,
            ac: 0,
            tmp: 0,
            saved_acs: Vec::new(),
            thunks_entered: 0,
            paps_created: 0,
            rigids_grown: 0,
        }
    }

    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            minor_gcs: self.heap.minor_gcs,
            major_gcs: self.heap.major_gcs,
            thunks_entered: self.thunks_entered,
            paps_created: self.paps_created,
            rigids_grown: self.rigids_grown,
        }
    }

    pub fn cur_self(&self) -> Obj {
        self.self_obj.expect("self register is set during evaluation")
    }

    pub fn push(&mut self, w: Word) {
        self.sp -= 1;
        self.stack[self.sp] = w;
    }

    pub fn pop(&mut self) -> Word {
        let w = self.stack[self.sp];
        self.sp += 1;
        w
    }

    /// Run a collection with the machine's roots.
    fn collect(&mut self) {
        self.heap.minor_gc(
            self.code,
            Roots {
                self_obj: &mut self.self_obj,
                stack: &mut self.stack[self.sp..],
            },
        );
    }

    /// Make sure `words` of nursery room exist, collecting if needed.
    fn ensure_heap(&mut self, words: usize) -> Result<(), Trap> {
        if !self.heap.has_room(words) {
            self.collect();
            if !self.heap.has_room(words) {
                return Err(Trap::OutOfMemory);
            }
        }
        Ok(())
    }

    /// Allocate an object, collecting if needed. Callers must re-read any
    /// object handles they held across this call.
    pub fn alloc(&mut self, size: u32, entry: CodeAddr) -> Result<Obj, Trap> {
        self.ensure_heap(size as usize)?;
        Ok(self.heap.bump(size, entry))
    }

    /// Overwrite `thunk` in place with an indirection to `value`.
    pub fn upd(&mut self, thunk: Obj, value: Obj) {
        thunk.set_entry(self.code.builtins().ref_entry);
        thunk.set_contents(0, value.word());
        self.heap.write_barrier(thunk, value);
    }

    /// Consume the top update slot and update it with the value in self.
    pub fn update_thunk(&mut self) {
        let slot = Obj::from_word(self.pop());
        self.upd(slot, self.cur_self());
    }

    /// Dereference a chain of REFs, eagerly rewriting every link to the final
    /// target so no REF transitively points to a REF afterwards.
    pub fn compress_refs(&mut self, o: Obj) -> Obj {
        if o.tag(self.code) != lamc_codegen::Tag::Ref {
            return o;
        }
        let target = self.compress_refs(o.contents_obj(0));
        if target.word() != o.contents(0) {
            o.set_contents(0, target.word());
            self.heap.write_barrier(o, target);
        }
        target
    }

    /// Enter the self register and run until it holds a value and no update
    /// frames of ours remain. Called by the driver with AC and the stack
    /// already arranged.
    pub fn run(&mut self) -> Result<(), Trap> {
        debug_assert!(self.saved_acs.is_empty());
        loop {
            let entry = self.cur_self().entry();
            let op = Opcode::decode(self.code.word(entry.index()))
                .expect("object entry names valid code");
            let step = match op {
                Opcode::RefEntry => {
                    self.self_obj = Some(self.cur_self().contents_obj(0));
                    Step::Tail
                }
                Opcode::PapEntry => {
                    self.pap_entry();
                    Step::Tail
                }
                Opcode::RigidEntry => self.rigid_entry()?,
                Opcode::BlackholeEntry => return Err(Trap::BlackHole),
                Opcode::ForwardEntry => unreachable!("forward objects exist only inside gc"),
                Opcode::ArgcCheck | Opcode::ThunkEnter => self.exec_blob(entry)?,
                other => unreachable!("entered mid-blob opcode {other:?}"),
            };
            if let Step::Value = step {
                match self.saved_acs.pop() {
                    Some(saved) => {
                        // A thunk was entered under arguments: update it and
                        // re-enter the value with them.
                        self.update_thunk();
                        self.ac = saved;
                    }
                    None => return Ok(()),
                }
            }
        }
    }

    /// Execute one compiled blob, from its prologue to its tail call.
    fn exec_blob(&mut self, entry: CodeAddr) -> Result<Step, Trap> {
        let code = self.code;
        let mut pc = entry.index();
        // The object being executed. Environment reads go through it, and it
        // stays valid across the blob's single collection point (the heap
        // check), after which it is re-read from the root.
        let mut entered = self.cur_self();
        loop {
            let op = Opcode::decode(code.word(pc)).expect("blob contains valid code");
            pc += 1;
            match op {
                Opcode::ArgcCheck => {
                    let arity = code.word(pc) as usize;
                    pc += 1;
                    if self.ac < arity {
                        return self.too_few_args();
                    }
                }
                Opcode::ThunkEnter => {
                    self.thunks_entered += 1;
                    if self.ac == 0 {
                        // The top of stack is the enclosing update frame.
                        // Fold: the enclosing thunk becomes an indirection to
                        // this one, and the slot now names this thunk.
                        let slot = Obj::from_word(self.stack[self.sp]);
                        self.upd(slot, entered);
                        self.stack[self.sp] = entered.word();
                    } else {
                        // Entered under arguments: push our own update frame
                        // and evaluate the body with none.
                        self.saved_acs.push(self.ac);
                        self.push(entered.word());
                        self.ac = 0;
                    }
                }
                Opcode::HeapCheck => {
                    let words = code.word(pc) as usize;
                    pc += 1;
                    self.ensure_heap(words)?;
                    entered = self.cur_self();
                }
                Opcode::Alloc => {
                    let envc = code.word(pc);
                    let child_entry = CodeAddr::from_u32(code.word(pc + 1));
                    pc += 2;
                    let size = if envc == 0 { 2 } else { envc + 1 };
                    let obj = self.heap.bump(size, child_entry);
                    self.push(obj.word());
                    if envc == 0 {
                        obj.set_info(2, 0);
                    }
                    for i in 0..envc {
                        let kind = code.word(pc);
                        let idx = code.word(pc + 1);
                        pc += 2;
                        let value = if kind == SRC_STACK {
                            self.stack[self.sp + idx as usize]
                        } else {
                            entered.contents(idx)
                        };
                        obj.set_contents(i, value);
                    }
                }
                Opcode::MoreArgs => {
                    let n = code.word(pc) as usize;
                    pc += 1;
                    for _ in 0..n {
                        self.push(0);
                    }
                }
                Opcode::FewerArgs => {
                    let n = code.word(pc) as usize;
                    pc += 1;
                    self.sp += n;
                }
                Opcode::MovStack => {
                    let (src, dst) = (code.word(pc) as usize, code.word(pc + 1) as usize);
                    pc += 2;
                    self.stack[self.sp + dst] = self.stack[self.sp + src];
                }
                Opcode::MovEnv => {
                    let (src, dst) = (code.word(pc), code.word(pc + 1) as usize);
                    pc += 2;
                    self.stack[self.sp + dst] = entered.contents(src);
                }
                Opcode::MovEnvTmp => {
                    let (src, dst) = (code.word(pc), code.word(pc + 1) as usize);
                    pc += 2;
                    self.stack[self.sp + dst] = Obj::from_word(self.tmp).contents(src);
                }
                Opcode::LoadTmpStack => {
                    let src = code.word(pc) as usize;
                    pc += 1;
                    self.tmp = self.stack[self.sp + src];
                }
                Opcode::LoadTmpSelf => {
                    self.tmp = entered.word();
                }
                Opcode::WriteTmp => {
                    let dst = code.word(pc) as usize;
                    pc += 1;
                    self.stack[self.sp + dst] = self.tmp;
                }
                Opcode::SetSelfStack => {
                    let src = code.word(pc) as usize;
                    pc += 1;
                    self.self_obj = Some(Obj::from_word(self.stack[self.sp + src]));
                }
                Opcode::SetSelfEnv => {
                    let src = code.word(pc);
                    pc += 1;
                    self.self_obj = Some(entered.contents_obj(src));
                }
                Opcode::SetSelfEnvTmp => {
                    let src = code.word(pc);
                    pc += 1;
                    self.self_obj = Some(Obj::from_word(self.tmp).contents_obj(src));
                }
                Opcode::SetSelfTmp => {
                    self.self_obj = Some(Obj::from_word(self.tmp));
                }
                Opcode::AddAc => {
                    let delta = code.word(pc) as i32;
                    pc += 1;
                    self.ac = (self.ac as i64 + i64::from(delta)) as usize;
                }
                Opcode::BlackholeSelf => {
                    entered.set_entry(code.builtins().blackhole_entry);
                    entered.set_info(2, 0);
                }
                Opcode::Call => return Ok(Step::Tail),
                other => unreachable!("object entry opcode {other:?} inside a blob"),
            }
        }
    }

    /// A closure found AC below its arity: package self and the accumulated
    /// arguments into a partial application and return it as the value.
    fn too_few_args(&mut self) -> Result<Step, Trap> {
        if self.ac == 0 {
            return Ok(Step::Value);
        }
        let size = self.ac as u32 + 3;
        let pap = self.alloc(size, self.code.builtins().pap_entry)?;
        self.paps_created += 1;
        pap.set_info(size, 0);
        pap.set_contents(1, self.cur_self().word());
        // Stored arguments keep the stack image: newest first.
        for i in 0..self.ac {
            pap.set_contents(2 + i as u32, self.stack[self.sp + i]);
        }
        self.sp += self.ac;
        self.ac = 0;
        self.self_obj = Some(pap);
        Ok(Step::Value)
    }

    /// Splice a partial application's stored arguments beneath the incoming
    /// ones and tail into the stored function.
    fn pap_entry(&mut self) {
        let pap = self.cur_self();
        let extra = (pap.info_size() - 3) as usize;
        let new_sp = self.sp - extra;
        for i in 0..self.ac {
            self.stack[new_sp + i] = self.stack[self.sp + i];
        }
        for j in 0..extra {
            self.stack[new_sp + self.ac + j] = pap.contents(2 + j as u32);
        }
        self.sp = new_sp;
        self.ac += extra;
        self.self_obj = Some(pap.contents_obj(1));
    }

    /// A rigid term applied to arguments grows into a larger rigid term; with
    /// none it already is the value.
    fn rigid_entry(&mut self) -> Result<Step, Trap> {
        if self.ac == 0 {
            return Ok(Step::Value);
        }
        let old_size = self.cur_self().info_size();
        let new_size = old_size
            .checked_add(self.ac as u32)
            .ok_or(Trap::OutOfMemory)?;
        let rigid = self.alloc(new_size, self.code.builtins().rigid_entry)?;
        self.rigids_grown += 1;
        let old = self.cur_self();
        let old_argc = old.info_size() - 2;
        rigid.set_info(new_size, old.info_var());
        for j in 0..old_argc {
            rigid.set_contents(1 + j, old.contents(1 + j));
        }
        // The top of stack is the last argument; append in application order.
        for j in 0..self.ac {
            rigid.set_contents(
                1 + old_argc + j as u32,
                self.stack[self.sp + self.ac - 1 - j],
            );
        }
        self.sp += self.ac;
        self.ac = 0;
        self.self_obj = Some(rigid);
        Ok(Step::Value)
    }
}
