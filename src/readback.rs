use hashbrown::HashSet;

use crate::node::{ NodeId, Slot, Variety };
use crate::heap::Heap;
use crate::env::Env;
use crate::symbol::{ Symbol, EMPTY_SYM };
use crate::term::{ Term, mk_abs, mk_fix, mk_app, mk_cell, mk_let, mk_test, mk_var,
                   mk_constant, mk_num, mk_str, mk_sym, mk_prim, mk_pruned };
use crate::prim::PRIM_UNDEFINED;
use crate::errors;

/// Expansion allowance per distinct node, for the unsharing bound.
const UNSHARE_K : f64 = 1000.0;

/// One De Bruijn shift frame, pushed when readback descends a
/// substitution whose target chain is shallower than the slot that
/// referenced it. `root_depth` is the target's chain depth; `offset`
/// is what must be added to a graph depth inside the target to get
/// the produced binder level along the current readback path.
#[derive(Debug, Copy, Clone)]
struct ShiftFrame {
    root_depth : i32,
    offset : i32,
}

/// Reads a reduced (or stuck) graph back into a term tree. Sharing is
/// expanded; to keep stuck graphs with heavy sharing from exploding,
/// expansion is abandoned with `Pruned` leaves once the produced term
/// count outruns `K * N * ln(N + e)` for `N` distinct nodes visited.
pub struct Readback<'h> {
    heap : &'h Heap,
    env : &'h Env,
    ctx : Vec<Vec<Symbol>>,
    frames : Vec<ShiftFrame>,
    seen : HashSet<NodeId>,
    produced : u64,
}

pub fn unflatten(sentinel : NodeId, heap : &Heap, env : &Env) -> Term {
    let mut rb = Readback {
        heap,
        env,
        ctx : Vec::with_capacity(16),
        frames : Vec::with_capacity(8),
        seen : HashSet::with_capacity(64),
        produced : 0,
    };
    debug_assert_eq!(heap.node(sentinel).depth, 0);
    rb.chain_term(sentinel)
}

impl<'h> Readback<'h> {
    fn over_budget(&self) -> bool {
        let n = self.seen.len() as f64;
        self.produced as f64 > UNSHARE_K * n * (n + std::f64::consts::E).ln()
    }

    fn chain_term(&mut self, sentinel : NodeId) -> Term {
        let root = self.heap.root_of(sentinel);
        self.node_term(root)
    }

    fn node_term(&mut self, id : NodeId) -> Term {
        stacker::maybe_grow(64 * 1024, 4 * 1024 * 1024, || self.node_term_core(id))
    }

    fn node_term_core(&mut self, id : NodeId) -> Term {
        self.seen.insert(id);
        if self.over_budget() {
            return mk_pruned()
        }
        self.produced += 1;
        let depth = self.heap.node(id).depth;
        match self.heap.node(id).variety {
            Variety::Var | Variety::Val => {
                let slot = self.heap.node(id).slots[0].clone();
                self.slot_term(&slot, depth)
            },
            Variety::Abs | Variety::Fix => {
                let n = self.heap.node(id);
                let body = n.slots[0].expect_body(line!());
                let formals : Vec<Symbol> = n.slots[1..]
                    .iter()
                    .map(|s| s.expect_param(line!()))
                    .collect();
                let is_fix = n.variety == Variety::Fix;
                self.ctx.push(formals.clone());
                let body = self.chain_term(body);
                self.ctx.pop();
                if is_fix {
                    mk_fix(formals, body)
                } else {
                    mk_abs(formals, body)
                }
            },
            Variety::App => {
                let slots = self.heap.node(id).slots.clone();
                let fun = self.slot_term(&slots[0], depth);
                let args = slots[1..].iter().map(|s| self.slot_term(s, depth)).collect();
                mk_app(fun, args)
            },
            Variety::Cell => {
                let slots = self.heap.node(id).slots.clone();
                let elts = slots.iter().map(|s| self.slot_term(s, depth)).collect();
                mk_cell(elts)
            },
            Variety::Let => {
                let n = self.heap.node(id);
                let width = n.let_width();
                let body = n.slots[0].expect_body(line!());
                let slots = n.slots.clone();
                let vars : Vec<Symbol> = slots[width..2 * width]
                    .iter()
                    .map(|s| s.expect_param(line!()))
                    .collect();
                let mut vals = Vec::with_capacity(width);
                vals.push(mk_prim(PRIM_UNDEFINED));
                for i in 1..width {
                    vals.push(self.slot_term(&slots[i], depth));
                }
                self.ctx.push(vars.clone());
                let body = self.chain_term(body);
                self.ctx.pop();
                mk_let(vars, vals, body)
            },
            Variety::Test => {
                let slots = self.heap.node(id).slots.clone();
                let pred = self.slot_term(&slots[0], depth);
                let csq = self.chain_term(slots[1].expect_body(line!()));
                let alt = self.chain_term(slots[2].expect_body(line!()));
                mk_test(pred, vec![csq], vec![alt])
            },
            Variety::Sentinel => errors::err_variety(line!(), "non-sentinel", &id.idx()),
        }
    }

    /// `site_depth` is the chain depth of the node holding the slot;
    /// it decides whether a substitution crosses into a shallower
    /// chain and needs a shift frame.
    fn slot_term(&mut self, slot : &Slot, site_depth : i32) -> Term {
        match slot {
            Slot::Bound { up, across } => self.var_term(*up, *across),
            Slot::Constant(idx) => {
                self.produced += 1;
                mk_constant(*idx, self.env.at(*idx).name)
            },
            Slot::Num(n) => {
                self.produced += 1;
                mk_num(*n)
            },
            Slot::Str(s) => {
                self.produced += 1;
                mk_str(s.clone())
            },
            Slot::Sym(s) => {
                self.produced += 1;
                mk_sym(*s)
            },
            Slot::Prim(p) => {
                self.produced += 1;
                mk_prim(*p)
            },
            Slot::Null => mk_pruned(),
            Slot::Subst(t) => {
                let target_depth = self.heap.node(*t).depth;
                debug_assert!(target_depth <= site_depth);
                if target_depth == site_depth {
                    return self.node_term(*t)
                }
                self.frames.push(ShiftFrame {
                    root_depth : target_depth,
                    offset : self.ctx.len() as i32 - target_depth,
                });
                let out = self.node_term(*t);
                self.frames.pop();
                out
            },
            owise => errors::err_slot_kind(line!(), "value", owise),
        }
    }

    /// Compose the shift stack over a bound variable : convert the
    /// variable's graph coordinates to the produced binder level,
    /// unwinding frames until one contains the referenced chain.
    fn var_term(&mut self, up : i32, across : u32) -> Term {
        self.produced += 1;
        let here = self.ctx.len() as i32;
        let cur_offset = self.frames.last().map(|f| f.offset).unwrap_or(0);
        let target_depth = (here - cur_offset) - up;
        let offset = self.frames
            .iter()
            .rev()
            .find(|f| target_depth >= f.root_depth)
            .map(|f| f.offset)
            .unwrap_or(0);
        let level = target_depth + offset;
        debug_assert!(level >= 1 && level <= here);
        let term_up = (here - level) as u32;
        let name = self.ctx
            .get((level - 1) as usize)
            .and_then(|frame| frame.get(across as usize))
            .copied()
            .unwrap_or(EMPTY_SYM);
        mk_var(term_up, across, name)
    }
}
