//! A-normalized IR.
//!
//! Every node has the shape `λ x₁…xₐ. let y₁ = e₁; …; y_ℓ = e_ℓ in h a₁ … a_k`
//! with a variable in head position and variables for all arguments.
//! Variables are de Bruijn levels: binder i of a node at level `lvl` binds
//! level `lvl + i`, and the let at index j binds `lvl + arity + j`.
//!
//! Lowering from the AST performs the A-normalization:
//!
//! - a β-redex `(λ x. b) e` binds `e` as a let and continues into `b`;
//! - a variable argument is passed directly;
//! - any other argument is hoisted into a let and passed by its level;
//! - a lambda left in head position after its arguments ran out becomes a
//!   let-bound closure called by its level.
//!
//! Because hoisting moves a subterm under binders that did not enclose it in
//! the source, the lowering resolves AST indices through an explicit
//! index→level scope vector instead of assuming the source binder depth.

use crate::parser::Ast;
use cranelift_entity::{entity_impl, PrimaryMap};
use std::fmt;
use std::ops::Index;

/// An opaque reference to an IR node.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Term(u32);
entity_impl!(Term, "term");

/// One IR node; see the module docs for the shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrNode {
    /// De Bruijn level at which this node begins: the number of binders in
    /// scope around it.
    pub lvl: u32,
    /// Number of leading lambdas; 0 means this node is a thunk.
    pub arity: u32,
    /// Let-bound children, in evaluation order.
    pub lets: Vec<Term>,
    /// The head variable of the application spine.
    pub head: u32,
    /// Argument variables, in application order.
    pub args: Vec<u32>,
}

impl IrNode {
    /// The level one past the last binding this node introduces.
    pub fn inner_lvl(&self) -> u32 {
        self.lvl + self.arity + self.lets.len() as u32
    }
}

/// Arena holding every node of one term. Dropped wholesale after code
/// emission.
#[derive(Default)]
pub struct IrArena {
    nodes: PrimaryMap<Term, IrNode>,
}

impl Index<Term> for IrArena {
    type Output = IrNode;

    fn index(&self, t: Term) -> &IrNode {
        &self.nodes[t]
    }
}

impl IrArena {
    /// Number of nodes in the arena.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Is the arena empty?
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Push a node. Exposed so tests can build terms the surface language
    /// cannot express (e.g. self-referential lets).
    pub fn push(&mut self, node: IrNode) -> Term {
        self.nodes.push(node)
    }

    /// Render `t` for debugging.
    pub fn display(&self, t: Term) -> DisplayTerm<'_> {
        DisplayTerm { arena: self, t }
    }

    /// Check the structural invariants of the subtree rooted at `t`.
    pub fn verify(&self, t: Term) -> Result<(), String> {
        let node = &self[t];
        let inner = node.inner_lvl();
        if node.head >= inner {
            return Err(format!("{t}: head v{} out of range {inner}", node.head));
        }
        for &a in &node.args {
            if a >= inner {
                return Err(format!("{t}: arg v{a} out of range {inner}"));
            }
        }
        for (i, &l) in node.lets.iter().enumerate() {
            let expect = node.lvl + node.arity + i as u32;
            if self[l].lvl != expect {
                return Err(format!(
                    "{t}: let {l} has lvl {}, expected {expect}",
                    self[l].lvl
                ));
            }
            self.verify(l)?;
        }
        Ok(())
    }
}

/// Displays an IR node, e.g. `λ v0 v1. let v2 = (v0 v1) in v0 v2`.
pub struct DisplayTerm<'a> {
    arena: &'a IrArena,
    t: Term,
}

impl fmt::Display for DisplayTerm<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let node = &self.arena[self.t];
        if node.arity > 0 {
            write!(f, "λ")?;
            for i in 0..node.arity {
                write!(f, " v{}", node.lvl + i)?;
            }
            write!(f, ". ")?;
        }
        for (i, &l) in node.lets.iter().enumerate() {
            write!(
                f,
                "let v{} = ({}); ",
                node.lvl + node.arity + i as u32,
                self.arena.display(l)
            )?;
        }
        write!(f, "v{}", node.head)?;
        for &a in &node.args {
            write!(f, " v{a}")?;
        }
        Ok(())
    }
}

/// Lower a closed AST into an arena, returning the root.
pub fn lower(ast: &Ast) -> (IrArena, Term) {
    let mut builder = Builder {
        arena: IrArena::default(),
    };
    let mut scope = Vec::new();
    let root = builder.lower_node(ast, 0, &mut scope);
    debug_assert!(scope.is_empty());
    debug_assert_eq!(builder.arena.verify(root), Ok(()));
    log::debug!(
        "lowered to {} IR nodes: {}",
        builder.arena.len(),
        builder.arena.display(root)
    );
    (builder.arena, root)
}

struct Builder {
    arena: IrArena,
}

impl Builder {
    /// Lower `ast` as a node starting at level `lvl`. `scope` maps de Bruijn
    /// depth to assigned level and must describe exactly the binders enclosing
    /// `ast`; it is restored before returning.
    fn lower_node(&mut self, ast: &Ast, lvl: u32, scope: &mut Vec<u32>) -> Term {
        let orig_scope = scope.len();

        let mut arity = 0u32;
        let mut cur = ast;
        while let Ast::Lam(body) = cur {
            scope.push(lvl + arity);
            arity += 1;
            cur = &**body;
        }
        let base = lvl + arity;

        // Walk the application spine. `pending` holds arguments in
        // application order, each with the scope depth of its source
        // position.
        let mut lets: Vec<Term> = Vec::new();
        let mut pending: Vec<(&Ast, usize)> = Vec::new();
        let mut f = cur;
        let head = loop {
            match f {
                Ast::App(g, a) => {
                    pending.insert(0, (&**a, scope.len()));
                    f = &**g;
                }
                Ast::Var(idx) => break resolve(scope, scope.len(), *idx),
                Ast::Lam(body) => {
                    let l = base + lets.len() as u32;
                    if pending.is_empty() {
                        // A lambda in head position with no argument left:
                        // bind it as a closure and call it.
                        let d = scope.len();
                        let child = self.lower_at(f, l, scope, d);
                        lets.push(child);
                        break l;
                    }
                    // β-redex: the next argument becomes a let binding this
                    // lambda's parameter.
                    let (a, d) = pending.remove(0);
                    let child = self.lower_at(a, l, scope, d);
                    lets.push(child);
                    scope.push(l);
                    f = &**body;
                }
            }
        };

        let mut args = Vec::with_capacity(pending.len());
        for (a, d) in pending {
            match a {
                Ast::Var(idx) => args.push(resolve(scope, d, *idx)),
                _ => {
                    let l = base + lets.len() as u32;
                    let child = self.lower_at(a, l, scope, d);
                    lets.push(child);
                    args.push(l);
                }
            }
        }

        scope.truncate(orig_scope);
        self.arena.push(IrNode {
            lvl,
            arity,
            lets,
            head,
            args,
        })
    }

    /// Lower a subterm whose source position saw only the first `depth`
    /// entries of `scope`.
    fn lower_at(&mut self, ast: &Ast, lvl: u32, scope: &[u32], depth: usize) -> Term {
        let mut sub = scope[..depth].to_vec();
        self.lower_node(ast, lvl, &mut sub)
    }
}

fn resolve(scope: &[u32], depth: usize, idx: u32) -> u32 {
    debug_assert!((idx as usize) < depth);
    scope[depth - 1 - idx as usize]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    fn lower_src(src: &str) -> (IrArena, Term) {
        lower(&parse(src).unwrap())
    }

    #[test]
    fn identity() {
        let (arena, root) = lower_src("λ x. x");
        let node = &arena[root];
        assert_eq!(node.lvl, 0);
        assert_eq!(node.arity, 1);
        assert_eq!(node.head, 0);
        assert!(node.lets.is_empty() && node.args.is_empty());
    }

    #[test]
    fn beta_redex_becomes_let() {
        // (λ x. x) (λ y. y)  ⇒  let v0 = (λ y. y) in v0
        let (arena, root) = lower_src("(λ x. x) (λ y. y)");
        let node = &arena[root];
        assert_eq!((node.lvl, node.arity), (0, 0));
        assert_eq!(node.lets.len(), 1);
        assert_eq!(node.head, 0);
        assert!(node.args.is_empty());
        let child = &arena[node.lets[0]];
        assert_eq!((child.lvl, child.arity, child.head), (0, 1, 0));
    }

    #[test]
    fn complex_argument_is_hoisted() {
        // λ f x. f (f x)  ⇒  λ v0 v1. let v2 = (v0 v1) in v0 v2
        let (arena, root) = lower_src("λ f x. f (f x)");
        let node = &arena[root];
        assert_eq!((node.lvl, node.arity), (0, 2));
        assert_eq!(node.head, 0);
        assert_eq!(node.args, vec![2]);
        let t = &arena[node.lets[0]];
        assert_eq!((t.lvl, t.arity, t.head), (2, 0, 0));
        assert_eq!(t.args, vec![1]);
    }

    #[test]
    fn var_argument_is_passed_directly() {
        // λ f x. f x keeps x as an argument, no lets.
        let (arena, root) = lower_src("λ f x. f x");
        let node = &arena[root];
        assert!(node.lets.is_empty());
        assert_eq!(node.head, 0);
        assert_eq!(node.args, vec![1]);
    }

    #[test]
    fn hoisted_argument_under_earlier_let_gets_consistent_levels() {
        // λ w z. w (z z) (z (λ y. y))
        //   ⇒ λ v0 v1. let v2 = (v1 v1); let v3 = (v1 (λ y. y)) in v0 v2 v3
        // and inside v3 the hoisted lambda binds from v3's own level, not a
        // parse-time level.
        let (arena, root) = lower_src("λ w z. w (z z) (z (λ y. y))");
        let node = &arena[root];
        assert_eq!(node.args, vec![2, 3]);
        let second = &arena[node.lets[1]];
        assert_eq!(second.lvl, 3);
        // let v3 = (λ v3. v3) in v1 v3  (levels restart inside the new frame)
        assert_eq!(second.lets.len(), 1);
        assert_eq!(second.head, 1);
        assert_eq!(second.args, vec![3]);
        let inner = &arena[second.lets[0]];
        assert_eq!((inner.lvl, inner.arity, inner.head), (3, 1, 3));
    }

    #[test]
    fn partially_applied_lambda_head() {
        // λ a. (λ x y. x) a leaves λ y. x in head position after one β step:
        //   λ v0. let v1 = (v0); let v2 = (λ v2. v1) in v2
        let (arena, root) = lower_src("λ a. (λ x y. x) a");
        let node = &arena[root];
        assert_eq!((node.lvl, node.arity), (0, 1));
        assert_eq!(node.lets.len(), 2);
        assert_eq!(node.head, 2);
        let closure = &arena[node.lets[1]];
        assert_eq!((closure.lvl, closure.arity), (2, 1));
        assert_eq!(closure.head, 1);
    }

    #[test]
    fn over_application_flattens() {
        // With vars only: λ a b. (λ x. x) a b
        let (arena, root) = lower_src("λ a b. (λ x. x) a b");
        let node = &arena[root];
        // let v2 = (a) in v2 b
        assert_eq!(node.lets.len(), 1);
        assert_eq!(node.head, 2);
        assert_eq!(node.args, vec![1]);
        let bound = &arena[node.lets[0]];
        assert_eq!((bound.lvl, bound.arity, bound.head), (2, 0, 0));
    }

    #[test]
    fn verify_rejects_bad_levels() {
        let mut arena = IrArena::default();
        let child = arena.push(IrNode {
            lvl: 5,
            arity: 0,
            lets: vec![],
            head: 0,
            args: vec![],
        });
        let root = arena.push(IrNode {
            lvl: 0,
            arity: 0,
            lets: vec![child],
            head: 0,
            args: vec![],
        });
        assert!(arena.verify(root).is_err());
    }

    #[test]
    fn all_scenarios_verify() {
        for src in [
            "λ x. x",
            "(λ x. x) (λ y. y)",
            "λ f x. f (f x)",
            "(λ f x. f (f x)) (λ f x. f (f x))",
            "(λ x y. x) (λ a. a) (λ b. b b)",
            "(λ f. (λ x. f (x x)) (λ x. f (x x))) (λ r n. n)",
        ] {
            let (arena, root) = lower_src(src);
            assert_eq!(arena.verify(root), Ok(()), "{src}");
        }
    }
}
