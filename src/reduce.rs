use log::debug;

use crate::node::{ NodeId, Slot, SlotRef, Variety };
use crate::heap::Heap;
use crate::env::Env;
use crate::symbol::{ SymbolTable, EMPTY_SYM };
use crate::subst::{ Subst, subst_copy, subst_edit };
use crate::prim::{ self, PrimId, Value, PrimFailure, PRIM_UNDEFINED };
use crate::errors;

/// How often the cursor loop consults heap pressure.
const SWEEP_CHECK_INTERVAL : u64 = 1024;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ReduceStats {
    pub steps : u64,
    pub betas : u64,
    pub prim_apps : u64,
    pub tests : u64,
    pub renames : u64,
    pub etas : u64,
    pub splits : u64,
    pub sweeps : u64,
}

/// A primitive that rejected its (fully evaluated) arguments. The
/// offending application is left stuck in the graph; the diagnostic
/// is reported alongside the partial readback.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub prim : PrimId,
    pub failure : PrimFailure,
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f : &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "primitive '{}' : {}", prim::name(self.prim), self.failure)
    }
}

/// What an application's function position resolves to once
/// substitution indirections are followed.
enum Fun {
    Closure(NodeId),
    Prim(PrimId),
    Stuck,
}

pub struct Reducer<'h> {
    heap : &'h mut Heap,
    env : &'h Env,
    table : &'h mut SymbolTable,
    strict_apply : bool,
    top : NodeId,
    pub stats : ReduceStats,
    pub diagnostics : Vec<Diagnostic>,
}

pub struct Outcome {
    pub stats : ReduceStats,
    pub diagnostics : Vec<Diagnostic>,
}

/// Reduce the chain under `sentinel` to values. Surface mode stops at
/// binder boundaries; deep mode additionally normalizes every binder
/// body and stuck-test branch after the surface pass, via an explicit
/// stack of inner sentinels. The graph is mutated in place and the
/// sentinel stays valid.
pub fn reduce_top(sentinel : NodeId, deep : bool, heap : &mut Heap, env : &Env,
                  table : &mut SymbolTable, strict_apply : bool) -> Outcome {
    let mut reducer = Reducer {
        heap,
        env,
        table,
        strict_apply,
        top : sentinel,
        stats : ReduceStats::default(),
        diagnostics : Vec::new(),
    };
    reducer.heap.baseline();
    reducer.run(sentinel, deep);
    debug!("reduction finished : {} steps, {} betas, {} prim applications, {} in use",
           reducer.stats.steps, reducer.stats.betas, reducer.stats.prim_apps,
           reducer.heap.in_use());
    Outcome { stats : reducer.stats, diagnostics : reducer.diagnostics }
}

impl<'h> Reducer<'h> {
    fn run(&mut self, sentinel : NodeId, deep : bool) {
        let mut work = vec![sentinel];
        while let Some(sent) = work.pop() {
            self.reduce_chain(sent);
            if !deep {
                continue
            }
            for n in self.heap.chain_nodes(sent) {
                match self.heap.node(n).variety {
                    Variety::Abs | Variety::Fix => {
                        work.push(self.heap.node(n).slots[0].expect_body(line!()));
                    },
                    Variety::Test => {
                        work.push(self.heap.node(n).slots[1].expect_body(line!()));
                        work.push(self.heap.node(n).slots[2].expect_body(line!()));
                    },
                    _ => (),
                }
            }
        }
    }

    /// One right-to-left pass. Splicing rewrites reposition the cursor
    /// onto the rightmost spliced node so freshly exposed work is
    /// reduced before the cursor moves on.
    fn reduce_chain(&mut self, sent : NodeId) {
        let mut cur = self.heap.node(sent).prev;
        while cur != sent {
            self.stats.steps += 1;
            if self.stats.steps % SWEEP_CHECK_INTERVAL == 0 {
                self.maybe_sweep();
            }
            let prev = self.heap.node(cur).prev;
            cur = match self.heap.node(cur).variety {
                Variety::Sentinel => errors::err_variety(line!(), "non-sentinel", &cur.idx()),
                Variety::Var | Variety::Val => {
                    self.try_rename(cur);
                    prev
                },
                Variety::Abs | Variety::Fix | Variety::Cell => prev,
                Variety::Test => match self.test_truth(cur) {
                    Some(true) => self.select_branch(cur, 1),
                    Some(false) => self.select_branch(cur, 2),
                    None => prev,
                },
                Variety::App => self.reduce_app(cur, prev),
                Variety::Let => self.reduce_let(cur),
            };
        }
    }

    /// Snap a single-substitution indirection out of the chain : the
    /// unique referrer is rewired straight to the target and the
    /// indirection node freed. Only legal while `nref == 1` keeps the
    /// backreference truthful, and never applied to a chain root,
    /// whose referrer is its sentinel.
    fn try_rename(&mut self, cur : NodeId) {
        let (target, br) = {
            let n = self.heap.node(cur);
            if n.nref != 1 || n.slots.len() != 1 {
                return
            }
            let target = match n.slots[0] {
                Slot::Subst(t) => t,
                _ => return,
            };
            let br = match n.backref {
                Some(br) => br,
                None => return,
            };
            (target, br)
        };
        if self.heap.node(br.node).variety == Variety::Sentinel {
            return
        }
        debug_assert_eq!(self.heap.node(br.node).slots[br.slot as usize], Slot::Subst(cur));
        // the reference moves rather than being dropped and re-added,
        // so the target's count is untouched
        self.heap.node_mut(br.node).slots[br.slot as usize] = Slot::Subst(target);
        if self.heap.node(target).nref == 1 {
            self.heap.node_mut(target).backref = Some(br);
        }
        {
            let n = self.heap.node_mut(cur);
            n.slots.clear();
            debug_assert_eq!(n.nref, 1);
        }
        self.heap.unlink(cur);
        self.heap.node_mut(cur).nref = 0;
        self.heap.free_raw(cur);
        self.stats.renames += 1;
    }

    fn reduce_app(&mut self, r : NodeId, prev : NodeId) -> NodeId {
        let argc = self.heap.node(r).app_argc();
        debug_assert!(argc > 0);
        match self.resolve_fun(r) {
            Fun::Prim(p) => {
                let arity = prim::arity(p);
                if arity == 0 {
                    // applying an atom; `undefined` additionally diagnoses
                    if p == PRIM_UNDEFINED {
                        self.diagnostics.push(Diagnostic { prim : p, failure : PrimFailure::Undefined });
                    }
                    return prev
                }
                if argc == arity {
                    self.dispatch_prim(r, p, argc);
                    prev
                } else if argc < arity {
                    if !self.strict_apply {
                        self.eta_expand(r, argc, arity, None);
                    }
                    prev
                } else {
                    self.split_overapp(r, arity)
                }
            },
            Fun::Closure(f) => {
                let arity = self.heap.node(f).fun_arity();
                if argc == arity {
                    self.beta(r, f)
                } else if argc < arity {
                    if !self.strict_apply {
                        self.eta_expand(r, argc, arity, Some(f));
                    }
                    prev
                } else {
                    self.split_overapp(r, arity)
                }
            },
            Fun::Stuck => prev,
        }
    }

    /// Follow the function slot through value indirections to whatever
    /// will be applied.
    fn resolve_fun(&self, r : NodeId) -> Fun {
        let mut slot = &self.heap.node(r).slots[0];
        loop {
            match slot {
                Slot::Prim(p) => return Fun::Prim(*p),
                Slot::Subst(t) => {
                    let n = self.heap.node(*t);
                    match n.variety {
                        Variety::Abs | Variety::Fix => return Fun::Closure(*t),
                        Variety::Var | Variety::Val => slot = &n.slots[0],
                        _ => return Fun::Stuck,
                    }
                },
                _ => return Fun::Stuck,
            }
        }
    }

    /// Beta : substitute the redex's argument slots through the
    /// abstraction body and splice the result over the redex. The body
    /// is edited in place when the redex held the abstraction's last
    /// reference; fix unfolding always copies, because the fix node
    /// survives inside its own unfolding via the self slot.
    fn beta(&mut self, r : NodeId, f : NodeId) -> NodeId {
        self.stats.betas += 1;
        let is_fix = self.heap.node(f).variety == Variety::Fix;
        let body = self.heap.node(f).slots[0].expect_body(line!());
        let subst = Subst {
            vals : r,
            self_node : if is_fix { f } else { NodeId::NIL },
            shift : self.heap.node(r).depth - self.heap.node(f).depth - 1,
        };
        // editing the body is only sound when this redex holds the
        // abstraction's one reference in hand : a chain of value
        // indirections can hide extra owners even at nref 1
        let direct = self.heap.node(r).slots[0] == Slot::Subst(f);
        let shared = is_fix || !direct || self.heap.node(f).nref > 1;
        let result = if shared {
            subst_copy(self.heap, body, &subst)
        } else {
            self.heap.node_mut(f).slots[0] = Slot::Null;
            subst_edit(self.heap, body, &subst);
            body
        };
        let old = std::mem::replace(&mut self.heap.node_mut(r).slots, Vec::new());
        let tail = self.splice(r, result);
        for slot in old {
            if let Some(t) = slot.target() {
                self.heap.deref(t);
            }
        }
        tail
    }

    /// Let reduction is beta with the let node itself as the redex :
    /// the definitions live in its value slots, already reduced by the
    /// cursor, and the body is always uniquely owned.
    fn reduce_let(&mut self, r : NodeId) -> NodeId {
        self.stats.betas += 1;
        let body = self.heap.node(r).slots[0].expect_body(line!());
        let subst = Subst {
            vals : r,
            self_node : NodeId::NIL,
            shift : -1,
        };
        self.heap.node_mut(r).slots[0] = Slot::Null;
        subst_edit(self.heap, body, &subst);
        let old = std::mem::replace(&mut self.heap.node_mut(r).slots, Vec::new());
        let tail = self.splice(r, body);
        for slot in old {
            if let Some(t) = slot.target() {
                self.heap.deref(t);
            }
        }
        tail
    }

    /// Replace the node `r` with the chain under `sent`, consuming the
    /// sentinel. `r` keeps its identity : the chain's root is
    /// transplanted into it, so every reference to the rewritten node
    /// now sees the result. Answers the rightmost spliced node, where
    /// the cursor resumes.
    fn splice(&mut self, r : NodeId, sent : NodeId) -> NodeId {
        let head = self.heap.root_of(sent);
        debug_assert_eq!(self.heap.node(sent).next, head);
        let tail = self.heap.node(sent).prev;
        self.heap.transplant(r, head);
        let single = head == tail;
        if !single {
            let h2 = self.heap.node(head).next;
            let right = self.heap.node(r).next;
            self.heap.node_mut(r).next = h2;
            self.heap.node_mut(h2).prev = r;
            self.heap.node_mut(tail).next = right;
            if !right.is_nil() {
                self.heap.node_mut(right).prev = tail;
            }
        }
        self.heap.free_raw(head);
        self.heap.free_raw(sent);
        if single { r } else { tail }
    }

    /// The truth value the test's predicate reduced to, if definite.
    fn test_truth(&self, r : NodeId) -> Option<bool> {
        match self.atom_value(&self.heap.node(r).slots[0])? {
            Value::Prim(p) => prim::as_truth(p),
            Value::Bool(b) => Some(b),
            _ => None,
        }
    }

    /// Attach the selected branch in place of the test node and drop
    /// the predicate and the unselected branch.
    fn select_branch(&mut self, r : NodeId, which : usize) -> NodeId {
        self.stats.tests += 1;
        let sent = self.heap.node(r).slots[which].expect_body(line!());
        self.heap.node_mut(r).slots[which] = Slot::Null;
        let old = std::mem::replace(&mut self.heap.node_mut(r).slots, Vec::new());
        let tail = self.splice(r, sent);
        for slot in old {
            if let Some(t) = slot.target() {
                self.heap.deref(t);
            }
        }
        tail
    }

    /// Fully applied primitive : atomize the arguments, run the
    /// operation, and rewrite the application into a value node. A
    /// composite argument leaves the application stuck without
    /// comment; a primitive failure leaves it stuck with a diagnostic.
    fn dispatch_prim(&mut self, r : NodeId, p : PrimId, argc : usize) {
        let mut args = Vec::with_capacity(argc);
        for i in 1..=argc {
            match self.atom_value(&self.heap.node(r).slots[i]) {
                Some(v) => args.push(v),
                None => return,
            }
        }
        match prim::apply(p, &args) {
            Ok(v) => {
                self.stats.prim_apps += 1;
                let old = std::mem::replace(&mut self.heap.node_mut(r).slots, Vec::new());
                {
                    let n = self.heap.node_mut(r);
                    n.variety = Variety::Val;
                    n.slots = vec![value_slot(v)];
                }
                for slot in old {
                    if let Some(t) = slot.target() {
                        self.heap.deref(t);
                    }
                }
            },
            Err(failure) => {
                self.diagnostics.push(Diagnostic { prim : p, failure });
            },
        }
    }

    /// Resolve a slot to an atomic value, following indirection nodes.
    fn atom_value(&self, slot : &Slot) -> Option<Value> {
        let mut slot = slot;
        loop {
            match slot {
                Slot::Num(n) => return Some(Value::Num(*n)),
                Slot::Str(s) => return Some(Value::Str(s.clone())),
                Slot::Sym(s) => return Some(Value::Sym(*s)),
                Slot::Prim(p) => return Some(Value::Prim(*p)),
                Slot::Subst(t) => {
                    let n = self.heap.node(*t);
                    match n.variety {
                        Variety::Var | Variety::Val => slot = &n.slots[0],
                        _ => return None,
                    }
                },
                _ => return None,
            }
        }
    }

    /// Partial application : wrap the application in an abstraction of
    /// the missing parameters. The application node moves one level
    /// down into the fresh body, extended with variables for the
    /// missing arguments, and the redex node is rewritten in place
    /// into the wrapping abstraction.
    fn eta_expand(&mut self, r : NodeId, argc : usize, arity : usize, f : Option<NodeId>) {
        self.stats.etas += 1;
        let depth = self.heap.node(r).depth;
        let missing = arity - argc;

        // parameter names : from the abstraction's own formals when
        // there is one, fresh otherwise
        let mut params = Vec::with_capacity(missing + 1);
        params.push(EMPTY_SYM);
        for j in 0..missing {
            let name = match f {
                Some(f) => self.heap.node(f).slots[2 + argc + j].expect_param(line!()),
                None => self.table.fresh("p"),
            };
            params.push(name);
        }

        let inner = self.heap.alloc(Variety::App, depth + 1, 1 + arity);
        let old = std::mem::replace(&mut self.heap.node_mut(r).slots, Vec::new());
        for (i, slot) in old.into_iter().enumerate() {
            let moved = match slot {
                Slot::Bound { up, across } => Slot::Bound { up : up + 1, across },
                owise => owise,
            };
            if let Some(t) = moved.target() {
                self.snap_backref(t, r, SlotRef { node : inner, slot : i as u32 });
            }
            self.heap.node_mut(inner).slots[i] = moved;
        }
        for j in 0..missing {
            self.heap.node_mut(inner).slots[1 + argc + j] =
                Slot::Bound { up : 0, across : (1 + j) as u32 };
        }

        let sent = self.heap.alloc(Variety::Sentinel, depth + 1, 1);
        {
            let s = self.heap.node_mut(sent);
            s.nref = 1;
            s.next = inner;
            s.prev = inner;
            s.slots[0] = Slot::Body(inner);
        }
        {
            let a = self.heap.node_mut(inner);
            a.prev = sent;
            a.next = sent;
            a.nref = 1;
            a.backref = Some(SlotRef { node : sent, slot : 0 });
        }

        let mut slots = Vec::with_capacity(1 + params.len());
        slots.push(Slot::Body(sent));
        for p in params {
            slots.push(Slot::Param(p));
        }
        let n = self.heap.node_mut(r);
        n.variety = Variety::Abs;
        n.slots = slots;
    }

    /// Over-application : peel off an exactly-applied prefix into an
    /// auxiliary node spliced to the right of the redex, and re-aim
    /// the redex at the prefix's value with the remaining arguments.
    /// The cursor re-enters at the prefix so it reduces first.
    fn split_overapp(&mut self, r : NodeId, arity : usize) -> NodeId {
        self.stats.splits += 1;
        let depth = self.heap.node(r).depth;
        let argc = self.heap.node(r).app_argc();
        let prefix = self.heap.alloc(Variety::App, depth, 1 + arity);

        let old = std::mem::replace(&mut self.heap.node_mut(r).slots, Vec::new());
        let mut rest = Vec::with_capacity(1 + argc - arity);
        rest.push(Slot::Subst(prefix));
        for (i, slot) in old.into_iter().enumerate() {
            if i <= arity {
                if let Some(t) = slot.target() {
                    self.snap_backref(t, r, SlotRef { node : prefix, slot : i as u32 });
                }
                self.heap.node_mut(prefix).slots[i] = slot;
            } else {
                if let Some(t) = slot.target() {
                    self.snap_backref(t, r, SlotRef { node : r, slot : rest.len() as u32 });
                }
                rest.push(slot);
            }
        }
        self.heap.node_mut(r).slots = rest;

        {
            let p = self.heap.node_mut(prefix);
            p.nref = 1;
            p.backref = Some(SlotRef { node : r, slot : 0 });
        }
        let right = self.heap.node(r).next;
        self.heap.node_mut(r).next = prefix;
        self.heap.node_mut(prefix).prev = r;
        self.heap.node_mut(prefix).next = right;
        self.heap.node_mut(right).prev = prefix;
        prefix
    }

    fn snap_backref(&mut self, target : NodeId, from : NodeId, to : SlotRef) {
        let t = self.heap.node_mut(target);
        if let Some(br) = t.backref {
            if br.node == from {
                t.backref = Some(to);
            }
        }
    }

    /// Opportunistic reclamation : when pressure exceeds the
    /// calibrated threshold, mark from the live roots and sweep
    /// whatever the reference counts somehow missed.
    fn maybe_sweep(&mut self) {
        self.heap.calibrate();
        if !self.heap.over_threshold() {
            return
        }
        let mut roots = self.env.graph_roots();
        roots.push(self.top);
        let marked = self.heap.mark_reachable(&roots);
        let swept = self.heap.sweep(&marked);
        self.stats.sweeps += 1;
        self.heap.calibrate();
        debug!("sweep reclaimed {} nodes, {} in use, threshold {:.3}",
               swept, self.heap.in_use(), self.heap.threshold());
    }
}

fn value_slot(v : Value) -> Slot {
    match v {
        Value::Num(n) => Slot::Num(n),
        Value::Str(s) => Slot::Str(s),
        Value::Sym(s) => Slot::Sym(s),
        Value::Prim(p) => Slot::Prim(p),
        Value::Bool(b) => Slot::Prim(prim::truth_atom(b)),
    }
}

#[cfg(test)]
mod reduce_tests {
    use super::*;
    use crate::parser::{ Parser, Statement };
    use crate::resolve::resolve;
    use crate::flatten::flatten;
    use crate::readback::unflatten;

    fn pipeline(src : &str, deep : bool, strict : bool)
        -> (Heap, NodeId, SymbolTable, Env, Outcome)
    {
        let mut tbl = SymbolTable::new();
        let mut heap = Heap::new(100_000);
        let env = Env::new();
        let main = tbl.intern("main");
        let stmts = Parser::parse_statements(src, &mut tbl).unwrap();
        let form = match stmts.into_iter().next().unwrap() {
            Statement::Eval(f) => f,
            owise => panic!("expected eval, got {:?}", owise),
        };
        let term = resolve(&form, &env, &tbl, &[main]).unwrap();
        let sent = flatten(&term, 0, &mut heap, &env);
        let outcome = reduce_top(sent, deep, &mut heap, &env, &mut tbl, strict);
        (heap, sent, tbl, env, outcome)
    }

    fn rendered(src : &str) -> (String, Outcome) {
        let (heap, sent, tbl, env, outcome) = pipeline(src, true, false);
        heap.audit_refcounts(&[sent]).unwrap();
        let term = unflatten(sent, &heap, &env);
        (format!("{}", term.display(&tbl)), outcome)
    }

    #[test]
    fn arithmetic_collapses_to_one_value_node() {
        let (heap, sent, _, _, outcome) = pipeline("1 + 2 * 3.", true, false);
        let chain = heap.chain_nodes(sent);
        assert_eq!(chain.len(), 1);
        assert_eq!(heap.node(chain[0]).variety, Variety::Val);
        assert_eq!(heap.node(chain[0]).slots[0], Slot::Num(7.0));
        assert_eq!(outcome.stats.prim_apps, 2);
    }

    #[test]
    fn rename_snaps_value_indirections() {
        let (printed, outcome) = rendered("[x. x] ([y. y]) (5).");
        assert_eq!(printed, "5");
        assert!(outcome.stats.renames >= 1);
    }

    #[test]
    fn eta_expansion_builds_a_value() {
        let (heap, sent, _, _, outcome) = pipeline("'add' (1).", true, false);
        assert_eq!(outcome.stats.etas, 1);
        let root = heap.root_of(sent);
        assert_eq!(heap.node(root).variety, Variety::Abs);
        assert_eq!(heap.node(root).fun_arity(), 1);
        heap.audit_refcounts(&[sent]).unwrap();
    }

    #[test]
    fn strict_apply_never_eta_expands() {
        let (heap, sent, _, _, outcome) = pipeline("'add' (1).", true, true);
        assert_eq!(outcome.stats.etas, 0);
        let root = heap.root_of(sent);
        assert_eq!(heap.node(root).variety, Variety::App);
    }

    #[test]
    fn over_application_splits_once() {
        let (printed, outcome) = rendered("[x. [y. x + y]] (30, 12).");
        assert_eq!(printed, "42");
        assert_eq!(outcome.stats.splits, 1);
    }

    #[test]
    fn stuck_heads_are_left_alone() {
        let (printed, outcome) = rendered("42 (1).");
        assert_eq!(printed, "42 (1)");
        assert_eq!(outcome.stats.betas, 0);
        assert!(outcome.diagnostics.is_empty());
    }

    #[test]
    fn applying_undefined_diagnoses() {
        let (_, _, _, _, outcome) = pipeline("'undefined' (1).", true, false);
        assert_eq!(outcome.diagnostics.len(), 1);
        assert_eq!(outcome.diagnostics[0].failure, PrimFailure::Undefined);
    }

    #[test]
    fn recursion_releases_its_unfoldings() {
        let (heap, sent, _, _, outcome) = pipeline(
            "[f! n. [n = 0 ? 1 | n * f(n - 1)]] (12).", true, false);
        assert!(outcome.stats.betas >= 12);
        let chain = heap.chain_nodes(sent);
        assert_eq!(chain.len(), 1);
        assert_eq!(heap.node(chain[0]).slots[0], Slot::Num(479001600.0));
        heap.audit_refcounts(&[sent]).unwrap();
    }

    #[test]
    fn threshold_stays_bounded_across_long_runs() {
        let (heap, sent, _, _, outcome) = pipeline(
            "[f! n. [n = 0 ? 0 | f(n - 1)]] (2000).", true, false);
        assert!(outcome.stats.steps > 1024);
        assert!(heap.threshold() >= crate::heap::THRESHOLD_FLOOR);
        assert!(heap.threshold() <= crate::heap::THRESHOLD_CEIL);
        assert_eq!(heap.node(heap.root_of(sent)).slots[0], Slot::Num(0.0));
    }
}
