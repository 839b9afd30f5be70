use crate::node::{ NodeId, Slot, SlotRef, Variety };
use crate::heap::Heap;
use crate::errors;

/// Descriptor for one simultaneous substitute-and-shift pass. `vals`
/// is the redex node whose slot at index `across` supplies the value
/// for each eliminated variable; `self_node` is the fix node to stand
/// in for `across == 0`, or `NIL` outside fix unfolding. `shift` is
/// the relocation delta between the body's home depth and the depth
/// the result will be spliced at; it adjusts both node depths and the
/// `up` coordinates of variables that reach past the eliminated
/// binder.
#[derive(Debug, Copy, Clone)]
pub struct Subst {
    pub vals : NodeId,
    pub self_node : NodeId,
    pub shift : i32,
}

/// The value slot substituted for a bound variable at traversal
/// `height`. Substitution targets gain a reference; bound-variable
/// values are re-based to the insertion site; atoms copy by value.
/// No backreference is installed : the referent sits to the right of
/// the rewrite site, and one value may land in many slots.
fn subst_value(heap : &mut Heap, subst : &Subst, across : u32, height : i32) -> Slot {
    if across == 0 {
        if subst.self_node.is_nil() {
            errors::err_self_subst(line!());
        }
        heap.incref(subst.self_node);
        return Slot::Subst(subst.self_node)
    }
    let val = heap.node(subst.vals).slots[across as usize].clone();
    match val {
        Slot::Subst(t) => {
            heap.incref(t);
            Slot::Subst(t)
        },
        Slot::Bound { up, across } => Slot::Bound { up : up + height, across },
        Slot::Num(_) | Slot::Str(_) | Slot::Sym(_) | Slot::Prim(_)
        | Slot::Constant(_) | Slot::Null => val,
        owise => errors::err_slot_kind(line!(), "value", &owise),
    }
}

/// Non-destructive substitution : clone the body chain, rewriting as
/// we go. Used whenever the body's owner is shared and must survive.
/// Source nodes carry a forwarding pointer to their copy for the
/// duration of the pass so that intra-body substitution references
/// re-target the copies; the forwards are cleared before returning.
pub fn subst_copy(heap : &mut Heap, body : NodeId, subst : &Subst) -> NodeId {
    let mut copier = Copier {
        heap,
        subst,
        forwarded : Vec::with_capacity(16),
    };
    let new_sent = copier.copy_chain(body, 0);
    for src in copier.forwarded {
        copier.heap.node_mut(src).forward = NodeId::NIL;
    }
    new_sent
}

struct Copier<'h> {
    heap : &'h mut Heap,
    subst : &'h Subst,
    forwarded : Vec<NodeId>,
}

impl<'h> Copier<'h> {
    fn copy_chain(&mut self, sent : NodeId, height : i32) -> NodeId {
        stacker::maybe_grow(64 * 1024, 4 * 1024 * 1024, || self.copy_chain_core(sent, height))
    }

    fn copy_chain_core(&mut self, sent : NodeId, height : i32) -> NodeId {
        let depth = self.heap.node(sent).depth + self.subst.shift;
        let new_sent = self.heap.alloc(Variety::Sentinel, depth, 1);
        self.heap.node_mut(new_sent).nref = 1;

        // right to left, so every substitution target within the chain
        // is forwarded before any slot that references it is copied
        let mut src = self.heap.node(sent).prev;
        let mut right = new_sent;
        while src != sent {
            let copy = self.copy_node(src, height);
            self.heap.node_mut(copy).next = right;
            self.heap.node_mut(right).prev = copy;
            right = copy;
            src = self.heap.node(src).prev;
        }
        self.heap.node_mut(new_sent).next = right;
        self.heap.node_mut(right).prev = new_sent;

        let src_root = self.heap.root_of(sent);
        let new_root = self.heap.node(src_root).forward;
        debug_assert!(!new_root.is_nil());
        self.heap.node_mut(new_sent).slots[0] = Slot::Body(new_root);
        {
            let r = self.heap.node_mut(new_root);
            r.nref += 1;
            r.backref = Some(SlotRef { node : new_sent, slot : 0 });
        }
        new_sent
    }

    fn copy_node(&mut self, src : NodeId, height : i32) -> NodeId {
        let (variety, depth, slots) = {
            let n = self.heap.node(src);
            (n.variety, n.depth, n.slots.clone())
        };
        let copy = self.heap.alloc(variety, depth + self.subst.shift, slots.len());
        self.heap.node_mut(src).forward = copy;
        self.forwarded.push(src);

        let inner_height = if self.heap.node(src).is_binder() { height + 1 } else { height };
        for (i, slot) in slots.into_iter().enumerate() {
            let new_slot = match slot {
                Slot::Bound { up, across } => {
                    if up == height {
                        subst_value(self.heap, self.subst, across, height)
                    } else if up > height {
                        Slot::Bound { up : up + self.subst.shift, across }
                    } else {
                        Slot::Bound { up, across }
                    }
                },
                Slot::Subst(t) => {
                    let fwd = self.heap.node(t).forward;
                    let target = if fwd.is_nil() { t } else { fwd };
                    self.heap.incref(target);
                    if self.heap.node(target).nref == 1 {
                        self.heap.node_mut(target).backref =
                            Some(SlotRef { node : copy, slot : i as u32 });
                    }
                    Slot::Subst(target)
                },
                Slot::Body(inner) => {
                    let new_inner = self.copy_chain(inner, inner_height);
                    Slot::Body(new_inner)
                },
                owise => owise,
            };
            self.heap.node_mut(copy).slots[i] = new_slot;
        }
        copy
    }
}

/// Destructive substitution : rewrite the body chain in place. Legal
/// only when the body's owner held the last reference, so nothing
/// else can observe the body. Allocation-free apart from string
/// payloads carried in by values.
pub fn subst_edit(heap : &mut Heap, body : NodeId, subst : &Subst) {
    edit_chain(heap, body, 0, subst)
}

fn edit_chain(heap : &mut Heap, sent : NodeId, height : i32, subst : &Subst) {
    stacker::maybe_grow(64 * 1024, 4 * 1024 * 1024, || edit_chain_core(heap, sent, height, subst))
}

fn edit_chain_core(heap : &mut Heap, sent : NodeId, height : i32, subst : &Subst) {
    heap.node_mut(sent).depth += subst.shift;
    let mut cur = heap.node(sent).next;
    while cur != sent {
        heap.node_mut(cur).depth += subst.shift;
        let inner_height = if heap.node(cur).is_binder() { height + 1 } else { height };
        for i in 0..heap.node(cur).slots.len() {
            match heap.node(cur).slots[i].clone() {
                Slot::Bound { up, across } => {
                    if up == height {
                        let value = subst_value(heap, subst, across, height);
                        heap.node_mut(cur).slots[i] = value;
                    } else if up > height {
                        heap.node_mut(cur).slots[i] =
                            Slot::Bound { up : up + subst.shift, across };
                    }
                },
                Slot::Body(inner) => {
                    edit_chain(heap, inner, inner_height, subst);
                },
                _ => (),
            }
        }
        cur = heap.node(cur).next;
    }
}

#[cfg(test)]
mod subst_tests {
    use super::*;
    use crate::symbol::SymbolTable;
    use crate::parser::{ Parser, Statement };
    use crate::resolve::resolve;
    use crate::env::Env;
    use crate::flatten::flatten;
    use crate::prim::registry;

    fn redex(src : &str) -> (Heap, NodeId) {
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
        (heap, sent)
    }

    #[test]
    fn copy_substitutes_atoms_for_bound_vars() {
        let (mut heap, sent) = redex("[x. x + x] (5).");
        let app = heap.root_of(sent);
        let abs = match heap.node(app).slots[0] {
            Slot::Subst(t) => t,
            ref owise => panic!("expected subst fun slot, got {:?}", owise),
        };
        let body = heap.node(abs).slots[0].expect_body(line!());
        let subst = Subst {
            vals : app,
            self_node : NodeId::NIL,
            shift : heap.node(app).depth - heap.node(abs).depth - 1,
        };
        let copy = subst_copy(&mut heap, body, &subst);
        let root = heap.root_of(copy);
        assert_eq!(heap.node(root).depth, 0);
        let add = registry().lookup("add").unwrap();
        assert_eq!(heap.node(root).slots[0], Slot::Prim(add));
        assert_eq!(heap.node(root).slots[1], Slot::Num(5.0));
        assert_eq!(heap.node(root).slots[2], Slot::Num(5.0));
        // the original body is untouched
        let orig_root = heap.root_of(body);
        assert_eq!(heap.node(orig_root).slots[1], Slot::Bound { up : 0, across : 1 });
        // forwards cleared
        assert!(heap.node(orig_root).forward.is_nil());
    }

    #[test]
    fn copy_shares_substitution_targets() {
        let (mut heap, sent) = redex("[x. x + x] (10 * 10).");
        let app = heap.root_of(sent);
        let (abs, mul) = match (&heap.node(app).slots[0], &heap.node(app).slots[1]) {
            (Slot::Subst(a), Slot::Subst(m)) => (*a, *m),
            owise => panic!("expected subst slots, got {:?}", owise),
        };
        let body = heap.node(abs).slots[0].expect_body(line!());
        let subst = Subst { vals : app, self_node : NodeId::NIL, shift : -1 };
        let copy = subst_copy(&mut heap, body, &subst);
        let root = heap.root_of(copy);
        // both variable sites now reference the one hoisted argument
        assert_eq!(heap.node(root).slots[1], Slot::Subst(mul));
        assert_eq!(heap.node(root).slots[2], Slot::Subst(mul));
        // one ref from the redex arg slot, two from the body copy
        assert_eq!(heap.node(mul).nref, 3);
    }

    #[test]
    fn edit_rewrites_in_place_and_redepths() {
        let (mut heap, sent) = redex("[x. [y. x]] (7).");
        let app = heap.root_of(sent);
        let abs = match heap.node(app).slots[0] {
            Slot::Subst(t) => t,
            ref owise => panic!("expected subst fun slot, got {:?}", owise),
        };
        let body = heap.node(abs).slots[0].expect_body(line!());
        let subst = Subst { vals : app, self_node : NodeId::NIL, shift : -1 };
        subst_edit(&mut heap, body, &subst);
        // the body chain is now at depth 0 and the inner abstraction
        // closed over the argument
        assert_eq!(heap.node(body).depth, 0);
        let inner_abs = heap.root_of(body);
        assert_eq!(heap.node(inner_abs).variety, Variety::Abs);
        assert_eq!(heap.node(inner_abs).depth, 0);
        let inner_body = heap.node(inner_abs).slots[0].expect_body(line!());
        assert_eq!(heap.node(inner_body).depth, 1);
        let var = heap.root_of(inner_body);
        assert_eq!(heap.node(var).slots[0], Slot::Num(7.0));
    }

    #[test]
    fn free_variables_shift_past_the_eliminated_binder() {
        // inner redex [y. x] (1) inside [x. ..] : x is free in the
        // inner body and must re-point across the removed binder
        let (mut heap, sent) = redex("[x. [y. x] (1)] (9).");
        let outer_app = heap.root_of(sent);
        let outer_abs = match heap.node(outer_app).slots[0] {
            Slot::Subst(t) => t,
            ref owise => panic!("expected subst, got {:?}", owise),
        };
        let outer_body = heap.node(outer_abs).slots[0].expect_body(line!());
        let inner_app = heap.root_of(outer_body);
        let inner_abs = match heap.node(inner_app).slots[0] {
            Slot::Subst(t) => t,
            ref owise => panic!("expected subst, got {:?}", owise),
        };
        let inner_body = heap.node(inner_abs).slots[0].expect_body(line!());
        // reduce the inner redex at depth 1 : body home depth 2,
        // destination depth 1
        let subst = Subst { vals : inner_app, self_node : NodeId::NIL, shift : -1 };
        let copy = subst_copy(&mut heap, inner_body, &subst);
        let root = heap.root_of(copy);
        // x<1.1> in the inner body becomes x<0.1> after elimination
        assert_eq!(heap.node(root).slots[0], Slot::Bound { up : 0, across : 1 });
    }
}
