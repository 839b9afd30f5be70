use crate::term::{ Term, InnerTerm };
use crate::node::{ NodeId, Slot, SlotRef, Variety };
use crate::heap::Heap;
use crate::env::Env;
use crate::errors;

/// Lowers a term tree into crumbled form : a chain of slot nodes in
/// which every non-variable child has been hoisted into its own node
/// and appears in place as an explicit substitution reference. The
/// chain is ordered so that hoisted children sit to the right of their
/// parent, which is what lets the reducer's right-to-left cursor see
/// every argument as a value before it reaches the consumer.
pub struct Flattener<'h> {
    heap : &'h mut Heap,
    env : &'h Env,
}

/// Flatten `term` into a fresh chain at `depth`. The returned sentinel
/// carries one reference for the caller's handle; handing it to
/// `Heap::deref` releases the whole graph.
pub fn flatten(term : &Term, depth : i32, heap : &mut Heap, env : &Env) -> NodeId {
    Flattener { heap, env }.chain(term, depth)
}

impl<'h> Flattener<'h> {
    fn chain(&mut self, t : &Term, depth : i32) -> NodeId {
        let sent = self.heap.alloc(Variety::Sentinel, depth, 1);
        self.heap.node_mut(sent).nref = 1;

        let mut order = Vec::with_capacity(8);
        let root = self.emit(t, depth, &mut order);
        debug_assert_eq!(order.first().copied(), Some(root));

        // thread the chain circularly through the sentinel
        let mut prev = sent;
        for &n in order.iter() {
            self.heap.node_mut(prev).next = n;
            self.heap.node_mut(n).prev = prev;
            prev = n;
        }
        self.heap.node_mut(prev).next = sent;
        self.heap.node_mut(sent).prev = prev;

        self.heap.node_mut(sent).slots[0] = Slot::Body(root);
        {
            let r = self.heap.node_mut(root);
            r.nref += 1;
            r.backref = Some(SlotRef { node : sent, slot : 0 });
        }
        sent
    }

    fn emit(&mut self, t : &Term, depth : i32, order : &mut Vec<NodeId>) -> NodeId {
        stacker::maybe_grow(64 * 1024, 4 * 1024 * 1024, || self.emit_core(t, depth, order))
    }

    fn emit_core(&mut self, t : &Term, depth : i32, order : &mut Vec<NodeId>) -> NodeId {
        match t.as_ref() {
            InnerTerm::Var { up, across, .. } => {
                let n = self.heap.alloc(Variety::Var, depth, 1);
                order.push(n);
                self.heap.node_mut(n).slots[0] = Slot::Bound { up : *up as i32, across : *across };
                n
            },
            InnerTerm::Constant { index, .. } => {
                let n = self.heap.alloc(Variety::Var, depth, 1);
                order.push(n);
                let slot = self.constant_slot(*index);
                if let Slot::Subst(_) = slot {
                    self.heap.node_mut(n).variety = Variety::Val;
                }
                self.heap.node_mut(n).slots[0] = slot;
                n
            },
            InnerTerm::Abs { formals, body } | InnerTerm::Fix { formals, body } => {
                let variety = match t.as_ref() {
                    InnerTerm::Fix {..} => Variety::Fix,
                    _ => Variety::Abs,
                };
                let n = self.heap.alloc(variety, depth, 1 + formals.len());
                order.push(n);
                let inner = self.chain(body, depth + 1);
                self.heap.node_mut(n).slots[0] = Slot::Body(inner);
                for (i, formal) in formals.iter().enumerate() {
                    self.heap.node_mut(n).slots[1 + i] = Slot::Param(*formal);
                }
                n
            },
            InnerTerm::App { fun, args } => {
                let n = self.heap.alloc(Variety::App, depth, 1 + args.len());
                order.push(n);
                let fun_slot = self.hoist(fun, depth, order, n, 0);
                self.heap.node_mut(n).slots[0] = fun_slot;
                for (i, arg) in args.iter().enumerate() {
                    let slot = self.hoist(arg, depth, order, n, (1 + i) as u32);
                    self.heap.node_mut(n).slots[1 + i] = slot;
                }
                n
            },
            InnerTerm::Cell { elts } => {
                let n = self.heap.alloc(Variety::Cell, depth, elts.len());
                order.push(n);
                for (i, elt) in elts.iter().enumerate() {
                    let slot = self.hoist(elt, depth, order, n, i as u32);
                    self.heap.node_mut(n).slots[i] = slot;
                }
                n
            },
            InnerTerm::Let { vars, vals, body } => {
                let width = vars.len();
                let n = self.heap.alloc(Variety::Let, depth, 2 * width);
                order.push(n);
                let inner = self.chain(body, depth + 1);
                self.heap.node_mut(n).slots[0] = Slot::Body(inner);
                for i in 1..width {
                    let slot = self.hoist(&vals[i], depth, order, n, i as u32);
                    self.heap.node_mut(n).slots[i] = slot;
                }
                for i in 0..width {
                    self.heap.node_mut(n).slots[width + i] = Slot::Param(vars[i]);
                }
                n
            },
            InnerTerm::Test { pred, csqs, alts } => {
                debug_assert_eq!(csqs.len(), 1);
                debug_assert_eq!(alts.len(), 1);
                let n = self.heap.alloc(Variety::Test, depth, 3);
                order.push(n);
                let pred_slot = self.hoist(pred, depth, order, n, 0);
                self.heap.node_mut(n).slots[0] = pred_slot;
                // branches do not bind, so their chains sit at the
                // test's own depth
                let csq = self.chain(&csqs[0], depth);
                let alt = self.chain(&alts[0], depth);
                self.heap.node_mut(n).slots[1] = Slot::Body(csq);
                self.heap.node_mut(n).slots[2] = Slot::Body(alt);
                n
            },
            InnerTerm::Num(x) => self.atom(order, depth, Slot::Num(*x)),
            InnerTerm::Str(s) => self.atom(order, depth, Slot::Str(s.clone())),
            InnerTerm::Sym(s) => self.atom(order, depth, Slot::Sym(*s)),
            InnerTerm::Prim(p) => self.atom(order, depth, Slot::Prim(*p)),
            InnerTerm::Pruned => self.atom(order, depth, Slot::Null),
        }
    }

    fn atom(&mut self, order : &mut Vec<NodeId>, depth : i32, slot : Slot) -> NodeId {
        let n = self.heap.alloc(Variety::Val, depth, 1);
        order.push(n);
        self.heap.node_mut(n).slots[0] = slot;
        n
    }

    /// Produce the slot for a child term. Variable-like children stay
    /// in place as reference slots and atoms as value slots; anything
    /// composite is emitted into the enclosing chain and referenced
    /// through a fresh substitution with a unique backreference.
    fn hoist(&mut self, t : &Term, depth : i32, order : &mut Vec<NodeId>,
             parent : NodeId, slot_idx : u32) -> Slot {
        match t.as_ref() {
            InnerTerm::Var { up, across, .. } => {
                Slot::Bound { up : *up as i32, across : *across }
            },
            InnerTerm::Constant { index, .. } => self.constant_slot(*index),
            InnerTerm::Num(x) => Slot::Num(*x),
            InnerTerm::Str(s) => Slot::Str(s.clone()),
            InnerTerm::Sym(s) => Slot::Sym(*s),
            InnerTerm::Prim(p) => Slot::Prim(*p),
            InnerTerm::Pruned => Slot::Null,
            _ => {
                let child = self.emit(t, depth, order);
                {
                    let c = self.heap.node_mut(child);
                    c.nref = 1;
                    c.backref = Some(SlotRef { node : parent, slot : slot_idx });
                }
                Slot::Subst(child)
            },
        }
    }

    /// Opaque binders (and binders with no graph yet) stay as opaque
    /// constant references; everything else resolves to a shared
    /// substitution into the binder's depth-0 body.
    fn constant_slot(&mut self, index : u32) -> Slot {
        let binder = self.env.at(index);
        if binder.flags.lifting() {
            errors::err_lifting_in_flatten(line!(), index);
        }
        if binder.flags.opaque() {
            return Slot::Constant(index)
        }
        match binder.node {
            Some(sent) => {
                let root = self.heap.root_of(sent);
                self.heap.incref(root);
                Slot::Subst(root)
            },
            None => Slot::Constant(index),
        }
    }
}

#[cfg(test)]
mod flatten_tests {
    use super::*;
    use crate::symbol::SymbolTable;
    use crate::parser::{ Parser, Statement };
    use crate::resolve::resolve;
    use crate::heap::Heap;

    fn flatten_src(src : &str) -> (Heap, NodeId, SymbolTable, Env) {
        let mut tbl = SymbolTable::new();
        let mut heap = Heap::new(10_000);
        let env = Env::new();
        let main = tbl.intern("main");
        let stmts = Parser::parse_statements(src, &mut tbl).unwrap();
        let form = match stmts.into_iter().next().unwrap() {
            Statement::Eval(f) => f,
            owise => panic!("expected eval, got {:?}", owise),
        };
        let term = resolve(&form, &env, &tbl, &[main]).unwrap();
        let sent = flatten(&term, 0, &mut heap, &env);
        (heap, sent, tbl, env)
    }

    #[test]
    fn chain_order_is_parent_then_children() {
        let (heap, sent, ..) = flatten_src("'add' (1 * 2, 3 * 4).");
        let chain = heap.chain_nodes(sent);
        // root app, then the two hoisted multiplications
        assert_eq!(chain.len(), 3);
        assert_eq!(heap.node(chain[0]).variety, Variety::App);
        assert_eq!(heap.node(chain[1]).variety, Variety::App);
        assert_eq!(heap.node(chain[2]).variety, Variety::App);
        assert_eq!(heap.root_of(sent), chain[0]);
        // circular linkage through the sentinel
        assert_eq!(heap.node(sent).next, chain[0]);
        assert_eq!(heap.node(sent).prev, chain[2]);
        assert_eq!(heap.node(chain[2]).next, sent);
    }

    #[test]
    fn fresh_chains_have_unit_refs_and_backrefs() {
        let (heap, sent, ..) = flatten_src("[x. x + x] (10 * 10).");
        heap.audit_refcounts(&[sent]).unwrap();
        for id in heap.mark_reachable(&[sent]) {
            let n = heap.node(id);
            if n.variety == Variety::Sentinel {
                continue
            }
            assert_eq!(n.nref, 1);
            let br = n.backref.expect("fresh node without backref");
            assert_eq!(heap.node(br.node).slots[br.slot as usize].target(), Some(id));
        }
    }

    #[test]
    fn abstraction_bodies_are_deeper_chains() {
        let (heap, sent, ..) = flatten_src("[x, y. x].");
        let root = heap.root_of(sent);
        assert_eq!(heap.node(root).variety, Variety::Abs);
        assert_eq!(heap.node(root).fun_arity(), 2);
        let body = heap.node(root).slots[0].expect_body(line!());
        assert_eq!(heap.node(body).depth, 1);
        let body_root = heap.root_of(body);
        assert_eq!(heap.node(body_root).variety, Variety::Var);
        assert_eq!(heap.node(body_root).slots[0], Slot::Bound { up : 0, across : 1 });
    }

    #[test]
    fn test_branches_stay_at_depth() {
        let (heap, sent, ..) = flatten_src("[1 > 0 ? 1 | 2].");
        let root = heap.root_of(sent);
        assert_eq!(heap.node(root).variety, Variety::Test);
        let csq = heap.node(root).slots[1].expect_body(line!());
        let alt = heap.node(root).slots[2].expect_body(line!());
        assert_eq!(heap.node(csq).depth, 0);
        assert_eq!(heap.node(alt).depth, 0);
        // predicate hoisted to the right of the test
        match heap.node(root).slots[0] {
            Slot::Subst(p) => assert_eq!(heap.node(root).next, p),
            ref owise => panic!("expected hoisted predicate, got {:?}", owise),
        }
    }

    #[test]
    fn whole_graph_releases() {
        let (mut heap, sent, ..) = flatten_src("[f! n. [n = 0 ? 1 | n * f(n - 1)]] (5).");
        assert!(heap.in_use() > 5);
        heap.deref(sent);
        assert_eq!(heap.in_use(), 0);
    }
}
