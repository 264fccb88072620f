//! Lowering of structured procedure bodies into labeled basic blocks.
//!
//! Every produced block is non-empty and ends with exactly one `goto` or
//! `return`; no earlier statement is a jump, conditional, loop or break. The
//! block map starts with the block labeled [`START_LABEL`]. Fresh labels are
//! purely numeric, which cannot collide with user labels (identifiers never
//! start with a digit).

use ahash::AHashMap;
use indexmap::IndexMap;

use crate::{
    ast::{Block, Guard, Id, SpecClause, SpecKind, Stmt, StmtLoc},
    pos::Pos,
};

/// Label of the entry block of every flattened body.
pub const START_LABEL: &str = "start";

/// Flattened body: label to statements, in emission order. The last statement
/// of every entry is the block's only `goto` or `return`.
pub type BlockMap = IndexMap<Id, Vec<StmtLoc>>;

/// Flattens a structured body into basic blocks, appending the implicit
/// `return` at the end.
#[must_use]
pub fn flatten_body(block: &Block) -> BlockMap {
    let mut flattener = Flattener {
        blocks: IndexMap::new(),
        current_label: START_LABEL.to_owned(),
        current: Vec::new(),
        counter: 0,
        exits: AHashMap::new(),
        innermost: None,
    };
    flattener.do_block(block);
    flattener.seal(StmtLoc::new(Pos::NONE, Stmt::Return), None);
    flattener.blocks
}

fn goto(labels: Vec<Id>) -> StmtLoc {
    StmtLoc::new(Pos::NONE, Stmt::Goto(labels))
}

struct Flattener {
    blocks: BlockMap,
    current_label: Id,
    current: Vec<StmtLoc>,
    counter: u64,
    /// Exit labels of user-labeled statements, for `break label`.
    exits: AHashMap<Id, Id>,
    /// Exit label of the innermost loop, for anonymous `break`.
    innermost: Option<Id>,
}

impl Flattener {
    fn fresh(&mut self) -> Id {
        let label = self.counter.to_string();
        self.counter += 1;
        label
    }

    fn emit(&mut self, stmt: StmtLoc) {
        self.current.push(stmt);
    }

    /// Closes the current block with `terminator` and opens `next` (or a
    /// fresh unreachable label when `None`).
    fn seal(&mut self, terminator: StmtLoc, next: Option<Id>) {
        let mut stmts = std::mem::take(&mut self.current);
        stmts.push(terminator);
        let next = match next {
            Some(label) => label,
            None => self.fresh(),
        };
        let label = std::mem::replace(&mut self.current_label, next);
        self.blocks.insert(label, stmts);
    }


    fn assume_guard(&mut self, guard: &crate::ast::ExprLoc, positive: bool) {
        let expr = if positive {
            guard.clone()
        } else {
            guard.clone().not().at(guard.position)
        };
        self.emit(StmtLoc::predicate(SpecClause::new(SpecKind::Inline, true, expr)));
    }

    fn do_block(&mut self, block: &Block) {
        for labeled in block {
            self.do_labeled(&labeled.labels, &labeled.stmt);
        }
    }

    fn do_labeled(&mut self, labels: &[Id], stmt: &StmtLoc) {
        let Some((label, rest)) = labels.split_first() else {
            self.do_stmt(stmt);
            return;
        };
        let done = self.fresh();
        self.exits.insert(label.clone(), done.clone());
        self.seal(goto(vec![label.clone()]), Some(label.clone()));
        self.do_labeled(rest, stmt);
        self.exits.remove(label);
        self.seal(goto(vec![done.clone()]), Some(done));
    }

    fn do_stmt(&mut self, stmt: &StmtLoc) {
        match &stmt.stmt {
            Stmt::Predicate(_) | Stmt::Havoc(_) | Stmt::Assign { .. } | Stmt::Call { .. } | Stmt::Skip => {
                self.emit(stmt.clone());
            }
            Stmt::Goto(labels) => {
                self.seal(StmtLoc::new(stmt.position, Stmt::Goto(labels.clone())), None);
            }
            Stmt::Return => {
                self.seal(StmtLoc::new(stmt.position, Stmt::Return), None);
            }
            Stmt::Break(target) => {
                let label = match target {
                    Some(name) => self
                        .exits
                        .get(name)
                        .cloned()
                        .expect("Flattener: break target not in scope"),
                    None => self
                        .innermost
                        .clone()
                        .expect("Flattener: anonymous break outside a loop"),
                };
                self.seal(StmtLoc::new(stmt.position, Stmt::Goto(vec![label])), None);
            }
            Stmt::If {
                guard,
                then_branch,
                else_branch,
            } => {
                let l_then = self.fresh();
                let l_else = self.fresh();
                let l_done = self.fresh();
                self.seal(goto(vec![l_then.clone(), l_else.clone()]), Some(l_then));
                if let Guard::Expr(e) = guard {
                    self.assume_guard(e, true);
                }
                self.do_block(then_branch);
                self.seal(goto(vec![l_done.clone()]), Some(l_else));
                if let Guard::Expr(e) = guard {
                    self.assume_guard(e, false);
                }
                if let Some(els) = else_branch {
                    self.do_block(els);
                }
                self.seal(goto(vec![l_done.clone()]), Some(l_done));
            }
            Stmt::While {
                guard,
                invariants,
                body,
            } => {
                let l_head = self.fresh();
                let l_body = self.fresh();
                let l_done = self.fresh();
                self.seal(goto(vec![l_head.clone()]), Some(l_head.clone()));
                for invariant in invariants {
                    self.emit(StmtLoc::predicate(invariant.clone()));
                }
                let l_after_guard = match guard {
                    Guard::Wildcard => l_done.clone(),
                    Guard::Expr(_) => self.fresh(),
                };
                self.seal(goto(vec![l_body.clone(), l_after_guard.clone()]), Some(l_body));
                if let Guard::Expr(e) = guard {
                    self.assume_guard(e, true);
                }
                let saved = self.innermost.replace(l_done.clone());
                self.do_block(body);
                self.innermost = saved;
                self.seal(goto(vec![l_head]), Some(l_after_guard.clone()));
                if let Guard::Expr(e) = guard {
                    self.assume_guard(e, false);
                    self.seal(goto(vec![l_done.clone()]), Some(l_done));
                }
            }
        }
    }
}
