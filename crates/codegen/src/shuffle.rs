//! The parallel-move scheduler.
//!
//! At every tail call the values of the outgoing frame (argument slots plus
//! the new self) must be produced from the incoming frame (stack slots plus
//! the environment of the current self) without an auxiliary stack. Sources
//! are the stack slots 0..n plus "the self slot" (all environment reads come
//! from it); one scratch temporary is enough because any simple cycle through
//! distinct slots can be opened by spilling exactly one value.
//!
//! The schedule is computed here, independently of the evaluator, by vacating
//! one source at a time:
//!
//! - a DONE source, or one with no destinations, is finished;
//! - hitting an IN_PROGRESS source closes a cycle: its live value is loaded
//!   into the temporary and reads of it are redirected there (including
//!   environment reads through the temporary when the self slot itself was
//!   spilled);
//! - otherwise each destination is vacated before it is written.
//!
//! Every destination is written exactly once and every source is read at most
//! twice (once directly, once via the temporary); at most one cycle is open at
//! any instant.

/// Where a destination's value comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Loc {
    /// A stack slot of the incoming frame, 0 at the top.
    Stack(u32),
    /// An environment slot of the current self.
    Env(u32),
}

/// A parallel-move problem: the frame has `slots` stack slots; `dests` maps
/// destination slots to sources, and `self_dest` is the source of the new
/// self. Destination slots appear at most once.
#[derive(Debug, Clone)]
pub struct MoveSpec {
    pub slots: u32,
    pub dests: Vec<(u32, Loc)>,
    pub self_dest: Loc,
}

/// One scheduled move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveOp {
    /// Break a cycle: load the live value of a stack slot into the temporary.
    LoadTmpStack(u32),
    /// Break a cycle: load the current self into the temporary.
    LoadTmpSelf,
    StackToStack { src: u32, dst: u32 },
    EnvToStack { src: u32, dst: u32 },
    /// Environment read through the temporary (the self slot was spilled).
    EnvTmpToStack { src: u32, dst: u32 },
    TmpToStack { dst: u32 },
    StackToSelf { src: u32 },
    EnvToSelf { src: u32 },
    EnvTmpToSelf { src: u32 },
    TmpToSelf,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Status {
    NotStarted,
    InProgress,
    Done,
}

const NONE: u32 = u32::MAX;

/// Compute a correct schedule for `spec`.
pub fn schedule(spec: &MoveSpec) -> Vec<MoveOp> {
    let n = spec.slots as usize;
    let mut s = Scheduler {
        self_slot: n,
        dest_src: vec![None; n + 1],
        src_head: vec![NONE; n + 1],
        next: vec![NONE; n + 1],
        status: vec![Status::NotStarted; n + 1],
        in_tmp: None,
        ops: Vec::new(),
    };

    s.dest_src[n] = Some(spec.self_dest);
    for &(d, src) in &spec.dests {
        debug_assert!((d as usize) < n);
        debug_assert!(s.dest_src[d as usize].is_none(), "duplicate destination");
        s.dest_src[d as usize] = Some(src);
    }

    // Link destinations to their source slot. Lists are built by prepending,
    // so adding the self destination first makes it the last one vacated for
    // its source: environment reads must all happen before the self register
    // is overwritten.
    s.link(n);
    for d in 0..n {
        s.link(d);
    }

    for src in 0..=n {
        s.vacate(src);
        debug_assert!(s.in_tmp.is_none());
    }
    s.ops
}

struct Scheduler {
    self_slot: usize,
    dest_src: Vec<Option<Loc>>,
    src_head: Vec<u32>,
    next: Vec<u32>,
    status: Vec<Status>,
    in_tmp: Option<usize>,
    ops: Vec<MoveOp>,
}

impl Scheduler {
    fn link(&mut self, d: usize) {
        let Some(src) = self.dest_src[d] else {
            return;
        };
        let s = match src {
            Loc::Stack(i) => i as usize,
            Loc::Env(_) => self.self_slot,
        };
        // An identity move of a stack slot needs no work at all.
        if let Loc::Stack(_) = src {
            if s == d {
                self.dest_src[d] = None;
                return;
            }
        }
        self.next[d] = self.src_head[s];
        self.src_head[s] = d as u32;
    }

    /// Store `src`'s value to all its destinations so it can be overwritten.
    fn vacate(&mut self, src: usize) {
        match self.status[src] {
            Status::Done => {}
            Status::InProgress => {
                // A cycle closes here; spill the live value to the temporary.
                debug_assert!(self.in_tmp.is_none(), "second cycle while one is open");
                self.in_tmp = Some(src);
                self.ops.push(if src == self.self_slot {
                    MoveOp::LoadTmpSelf
                } else {
                    MoveOp::LoadTmpStack(src as u32)
                });
            }
            Status::NotStarted => {
                if self.src_head[src] == NONE {
                    self.status[src] = Status::Done;
                    return;
                }
                self.status[src] = Status::InProgress;
                if src == self.self_slot {
                    self.vacate_self_dests();
                } else {
                    self.vacate_stack_dests(src);
                }
                if self.in_tmp == Some(src) {
                    self.in_tmp = None;
                }
                self.status[src] = Status::Done;
            }
        }
    }

    /// Flush all destinations fed from the environment of self. Each has its
    /// own environment index, so loads are per-destination.
    fn vacate_self_dests(&mut self) {
        let self_slot = self.self_slot;
        let mut d = self.src_head[self_slot];
        while d != NONE {
            let dst = d as usize;
            self.vacate(dst);
            let Some(Loc::Env(idx)) = self.dest_src[dst] else {
                unreachable!("self-sourced destination without an env source");
            };
            let via_tmp = self.in_tmp == Some(self_slot);
            self.ops.push(match (dst == self_slot, via_tmp) {
                (true, true) => MoveOp::EnvTmpToSelf { src: idx },
                (true, false) => MoveOp::EnvToSelf { src: idx },
                (false, true) => MoveOp::EnvTmpToStack { src: idx, dst: d },
                (false, false) => MoveOp::EnvToStack { src: idx, dst: d },
            });
            d = self.next[dst];
        }
    }

    /// Flush all destinations of one stack slot: vacate them all, then store
    /// the (single) source value to each.
    fn vacate_stack_dests(&mut self, src: usize) {
        let mut d = self.src_head[src];
        while d != NONE {
            self.vacate(d as usize);
            d = self.next[d as usize];
        }
        let from_tmp = self.in_tmp == Some(src);
        let mut d = self.src_head[src];
        while d != NONE {
            let dst = d as usize;
            self.ops.push(match (dst == self.self_slot, from_tmp) {
                (true, true) => MoveOp::TmpToSelf,
                (true, false) => MoveOp::StackToSelf { src: src as u32 },
                (false, true) => MoveOp::TmpToStack { dst: d },
                (false, false) => MoveOp::StackToStack { src: src as u32, dst: d },
            });
            d = self.next[dst];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    /// Model of the machine state the schedule runs against. Stack slots and
    /// the self register hold abstract values; environment reads are only
    /// legal while the base (self register or temporary) still names the
    /// original object.
    struct State {
        stack: Vec<u64>,
        self_reg: u64,
        env: Vec<u64>,
        tmp: u64,
        stack_writes: Vec<u32>,
        self_writes: u32,
    }

    const ORIGINAL_SELF: u64 = 0xdead_0001;

    impl State {
        fn new(slots: usize, env: Vec<u64>) -> State {
            State {
                stack: (0..slots as u64).map(|i| 0x1000 + i).collect(),
                self_reg: ORIGINAL_SELF,
                env,
                tmp: 0,
                stack_writes: vec![0; slots],
                self_writes: 0,
            }
        }

        fn read_loc(&self, loc: Loc) -> u64 {
            match loc {
                Loc::Stack(i) => 0x1000 + i as u64,
                Loc::Env(i) => self.env[i as usize],
            }
        }

        fn set_stack(&mut self, dst: u32, v: u64) {
            self.stack[dst as usize] = v;
            self.stack_writes[dst as usize] += 1;
        }

        fn set_self(&mut self, v: u64) {
            self.self_reg = v;
            self.self_writes += 1;
        }

        fn execute(&mut self, ops: &[MoveOp]) {
            for &op in ops {
                match op {
                    MoveOp::LoadTmpStack(i) => self.tmp = self.stack[i as usize],
                    MoveOp::LoadTmpSelf => {
                        assert_eq!(self.self_reg, ORIGINAL_SELF, "self spilled after overwrite");
                        self.tmp = self.self_reg;
                    }
                    MoveOp::StackToStack { src, dst } => {
                        let v = self.stack[src as usize];
                        self.set_stack(dst, v);
                    }
                    MoveOp::EnvToStack { src, dst } => {
                        assert_eq!(self.self_reg, ORIGINAL_SELF, "env read after self overwrite");
                        let v = self.env[src as usize];
                        self.set_stack(dst, v);
                    }
                    MoveOp::EnvTmpToStack { src, dst } => {
                        assert_eq!(self.tmp, ORIGINAL_SELF, "env-via-tmp without self in tmp");
                        let v = self.env[src as usize];
                        self.set_stack(dst, v);
                    }
                    MoveOp::TmpToStack { dst } => {
                        let v = self.tmp;
                        self.set_stack(dst, v);
                    }
                    MoveOp::StackToSelf { src } => {
                        let v = self.stack[src as usize];
                        self.set_self(v);
                    }
                    MoveOp::EnvToSelf { src } => {
                        assert_eq!(self.self_reg, ORIGINAL_SELF, "env read after self overwrite");
                        let v = self.env[src as usize];
                        self.set_self(v);
                    }
                    MoveOp::EnvTmpToSelf { src } => {
                        assert_eq!(self.tmp, ORIGINAL_SELF, "env-via-tmp without self in tmp");
                        let v = self.env[src as usize];
                        self.set_self(v);
                    }
                    MoveOp::TmpToSelf => {
                        let v = self.tmp;
                        self.set_self(v);
                    }
                }
            }
        }
    }

    fn check(spec: &MoveSpec) {
        let env: Vec<u64> = (0..8).map(|i| 0x2000 + i as u64).collect();
        let ops = schedule(spec);
        let mut state = State::new(spec.slots as usize, env);
        state.execute(&ops);

        let mut is_dest = vec![false; spec.slots as usize];
        for &(d, src) in &spec.dests {
            is_dest[d as usize] = true;
            assert_eq!(state.stack[d as usize], state.read_loc(src), "dest {d}");
            // Identity moves may legitimately skip the write.
            let expected = if src == Loc::Stack(d) { 0 } else { 1 };
            assert_eq!(state.stack_writes[d as usize], expected, "writes to {d}");
        }
        assert_eq!(state.self_reg, state.read_loc(spec.self_dest));
        assert_eq!(state.self_writes, 1);
        for (i, &written) in state.stack_writes.iter().enumerate() {
            if !is_dest[i] {
                assert_eq!(written, 0, "non-destination slot {i} written");
            }
        }
    }

    #[test]
    fn disjoint_moves() {
        check(&MoveSpec {
            slots: 4,
            dests: vec![(0, Loc::Stack(2)), (1, Loc::Stack(3))],
            self_dest: Loc::Env(0),
        });
    }

    #[test]
    fn identity_moves() {
        check(&MoveSpec {
            slots: 2,
            dests: vec![(0, Loc::Stack(0)), (1, Loc::Stack(1))],
            self_dest: Loc::Stack(0),
        });
    }

    #[test]
    fn swap_two_slots() {
        check(&MoveSpec {
            slots: 2,
            dests: vec![(0, Loc::Stack(1)), (1, Loc::Stack(0))],
            self_dest: Loc::Env(1),
        });
    }

    #[test]
    fn three_cycle() {
        check(&MoveSpec {
            slots: 3,
            dests: vec![(0, Loc::Stack(1)), (1, Loc::Stack(2)), (2, Loc::Stack(0))],
            self_dest: Loc::Env(0),
        });
    }

    #[test]
    fn cycle_through_self() {
        // self := stack 0, stack 0 := env of self: the self slot is on the
        // cycle, so an environment read must go through the temporary.
        let spec = MoveSpec {
            slots: 1,
            dests: vec![(0, Loc::Env(3))],
            self_dest: Loc::Stack(0),
        };
        let ops = schedule(&spec);
        assert!(
            ops.contains(&MoveOp::LoadTmpSelf) || ops.contains(&MoveOp::LoadTmpStack(0)),
            "cycle must spill: {ops:?}"
        );
        check(&spec);
    }

    #[test]
    fn fan_out_one_source() {
        check(&MoveSpec {
            slots: 3,
            dests: vec![(0, Loc::Stack(2)), (1, Loc::Stack(2)), (2, Loc::Env(1))],
            self_dest: Loc::Stack(2),
        });
    }

    #[test]
    fn shrinking_frame_leaves_low_slots_alone() {
        // Destinations only at the bottom of the frame, as emitted for a call
        // with fewer outgoing than incoming arguments.
        check(&MoveSpec {
            slots: 5,
            dests: vec![(3, Loc::Stack(0)), (4, Loc::Stack(1))],
            self_dest: Loc::Stack(2),
        });
    }

    #[test]
    fn fuzz_random_specs() {
        let mut rng = SmallRng::seed_from_u64(0x5eed);
        for _ in 0..4000 {
            let slots = rng.gen_range(0..=8u32);
            let mut dests = Vec::new();
            for d in 0..slots {
                if rng.gen_bool(0.6) {
                    dests.push((d, random_loc(&mut rng, slots)));
                }
            }
            let spec = MoveSpec {
                slots,
                dests,
                self_dest: random_loc(&mut rng, slots),
            };
            check(&spec);
        }
    }

    fn random_loc(rng: &mut SmallRng, slots: u32) -> Loc {
        if slots > 0 && rng.gen_bool(0.7) {
            Loc::Stack(rng.gen_range(0..slots))
        } else {
            Loc::Env(rng.gen_range(0..8))
        }
    }
}
