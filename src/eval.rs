use std::sync::Arc;

use parking_lot::RwLock;
use log::debug;

use crate::symbol::{ Symbol, SymbolTable };
use crate::parser::{ Parser, Statement, Form };
use crate::resolve::resolve;
use crate::term::Term;
use crate::env::{ Env, BinderFlags };
use crate::heap::{ Heap, DEFAULT_CAP };
use crate::flatten::flatten;
use crate::reduce::{ reduce_top, ReduceStats, Diagnostic };
use crate::readback::unflatten;
use crate::errors::MlcResult;

#[derive(Debug, Clone)]
pub struct EvalOptions {
    /// Reduce top-level expressions under their binders once surface
    /// reduction finishes.
    pub deep : bool,
    /// Leave arity mismatches stuck instead of eta-expanding.
    pub strict_apply : bool,
    pub heap_cap : usize,
}

impl Default for EvalOptions {
    fn default() -> Self {
        EvalOptions {
            deep : true,
            strict_apply : false,
            heap_cap : DEFAULT_CAP,
        }
    }
}

/// The printable result of one expression statement.
#[derive(Debug)]
pub struct Evaluated {
    pub term : Term,
    pub stats : ReduceStats,
    pub diagnostics : Vec<Diagnostic>,
}

/// Owns the shared machinery of a session : symbol table, node arena,
/// and the global environment behind its lock. Every pipeline stage
/// takes these as handles, so tests can run as many independent
/// evaluators as they like.
pub struct Evaluator {
    pub table : SymbolTable,
    pub heap : Heap,
    pub env : Arc<RwLock<Env>>,
    pub opts : EvalOptions,
    space : Symbol,
    active : Vec<Symbol>,
    pub num_statements : usize,
}

impl Evaluator {
    pub fn new(opts : EvalOptions) -> Self {
        let mut table = SymbolTable::new();
        let space = table.intern("main");
        Evaluator {
            heap : Heap::new(opts.heap_cap),
            env : Arc::new(RwLock::new(Env::new())),
            opts,
            space,
            active : vec![space],
            num_statements : 0,
            table,
        }
    }

    /// Parse and evaluate a source text. Definitions mutate the
    /// environment; expression statements produce `Evaluated` results
    /// in order.
    pub fn eval_source(&mut self, source : &str) -> MlcResult<Vec<Evaluated>> {
        let stmts = Parser::parse_statements(source, &mut self.table)?;
        let mut out = Vec::new();
        for stmt in stmts {
            if let Some(evaluated) = self.eval_statement(&stmt)? {
                out.push(evaluated);
            }
        }
        Ok(out)
    }

    pub fn eval_statement(&mut self, stmt : &Statement) -> MlcResult<Option<Evaluated>> {
        self.num_statements += 1;
        match stmt {
            Statement::Define { flags, name, body } => {
                self.define(*name, *flags, body)?;
                Ok(None)
            },
            Statement::Eval(form) => self.eval_form(form).map(Some),
        }
    }

    /// resolve -> flatten -> reduce -> unflatten, releasing the graph
    /// once it has been read back.
    pub fn eval_form(&mut self, form : &Form) -> MlcResult<Evaluated> {
        let term = {
            let env = self.env.read();
            resolve(form, &env, &self.table, &self.active)?
        };
        let sent = {
            let env = self.env.read();
            flatten(&term, 0, &mut self.heap, &env)
        };
        let outcome = {
            let env = self.env.read();
            reduce_top(sent, self.opts.deep, &mut self.heap, &env,
                       &mut self.table, self.opts.strict_apply)
        };
        let out = {
            let env = self.env.read();
            unflatten(sent, &self.heap, &env)
        };
        self.heap.deref(sent);
        Ok(Evaluated {
            term : out,
            stats : outcome.stats,
            diagnostics : outcome.diagnostics,
        })
    }

    /// Install a global binder. Lifting binders park their source
    /// term; literal binders store their graph unreduced; everything
    /// else reduces at definition time, deeply when flagged (`deep`
    /// has no effect under `literal`).
    pub fn define(&mut self, name : Symbol, flags : BinderFlags, body : &Form) -> MlcResult<Vec<Diagnostic>> {
        let term = {
            let env = self.env.read();
            resolve(body, &env, &self.table, &self.active)?
        };
        let old = {
            let mut env = self.env.write();
            let idx = env.bind(name, self.space, flags);
            std::mem::replace(&mut env.at_mut(idx).node, None)
        };
        if let Some(old_sent) = old {
            self.heap.deref(old_sent);
        }

        if flags.lifting() {
            let mut env = self.env.write();
            let idx = match env.lookup(name, &[self.space]) {
                crate::env::Lookup::Found(idx) => idx,
                owise => panic!("binder vanished during definition : {:?}", owise),
            };
            env.at_mut(idx).source = Some(term);
            return Ok(Vec::new())
        }

        let sent = {
            let env = self.env.read();
            flatten(&term, 0, &mut self.heap, &env)
        };
        let diagnostics = if flags.literal() {
            Vec::new()
        } else {
            let env = self.env.read();
            let outcome = reduce_top(sent, flags.deep(), &mut self.heap, &env,
                                     &mut self.table, self.opts.strict_apply);
            outcome.diagnostics
        };
        {
            let mut env = self.env.write();
            let idx = match env.lookup(name, &[self.space]) {
                crate::env::Lookup::Found(idx) => idx,
                owise => panic!("binder vanished during definition : {:?}", owise),
            };
            env.at_mut(idx).node = Some(sent);
        }
        debug!("defined `{}` ({} nodes in use)", self.table.resolve(name), self.heap.in_use());
        Ok(diagnostics)
    }

    pub fn render(&self, term : &Term) -> String {
        format!("{}", term.display(&self.table))
    }

    /// Reference-count consistency over everything reachable from the
    /// environment's graphs. Exposed for tests and the driver's debug
    /// mode.
    pub fn audit(&self) -> Result<(), String> {
        let roots = self.env.read().graph_roots();
        self.heap.audit_refcounts(&roots)
    }
}

#[cfg(test)]
mod eval_tests {
    use super::*;

    fn evaluator() -> Evaluator {
        Evaluator::new(EvalOptions::default())
    }

    fn eval_str(src : &str) -> String {
        let mut ev = evaluator();
        let results = ev.eval_source(src).unwrap();
        let last = results.last().expect("no expression statement in source");
        assert!(last.diagnostics.is_empty(),
                "unexpected diagnostics : {:?}", last.diagnostics);
        ev.audit().unwrap();
        ev.render(&last.term)
    }

    #[test]
    fn s1_identity() {
        assert_eq!(eval_str("[x. x] (42)."), "42");
    }

    #[test]
    fn s2_first_projection() {
        assert_eq!(eval_str("[x, y. x] (1, 2)."), "1");
    }

    #[test]
    fn s3_nested_abstraction() {
        assert_eq!(eval_str("[x. [y. x]] (7) (9)."), "7");
    }

    #[test]
    fn s4_factorial() {
        assert_eq!(eval_str("[f! n. [n = 0 ? 1 | n * f(n - 1)]] (5)."), "120");
    }

    #[test]
    fn s5_let_binding() {
        assert_eq!(eval_str("let { p := [a, b. a + b] } p(3, 4)."), "7");
    }

    #[test]
    fn s6_computed_predicate() {
        assert_eq!(eval_str("[p. [p ? 1 | 2]] (1 > 0)."), "1");
    }

    #[test]
    fn s7_church_two() {
        assert_eq!(eval_str("[f, x. f(f(x))] ([y. y + 1], 0)."), "2");
    }

    #[test]
    fn s8_shared_argument_evaluates_once() {
        let mut ev = evaluator();
        let results = ev.eval_source("[x. x + x] (10 * 10).").unwrap();
        let out = &results[0];
        assert_eq!(ev.render(&out.term), "200");
        // one multiplication, one addition; the shared argument was
        // not recomputed per use site
        assert_eq!(out.stats.prim_apps, 2);
        ev.audit().unwrap();
    }

    #[test]
    fn definitions_and_constants() {
        let mut ev = evaluator();
        let results = ev.eval_source("
            double := [a. a * 2].
            double (double (10)).
        ").unwrap();
        assert_eq!(ev.render(&results[0].term), "40");
        ev.audit().unwrap();
    }

    #[test]
    fn opaque_binders_stay_stuck() {
        let mut ev = evaluator();
        let results = ev.eval_source("
            opaque mystery := 5.
            mystery + 1.
        ").unwrap();
        let printed = ev.render(&results[0].term);
        assert!(printed.contains("mystery<"), "got {}", printed);
        assert!(printed.contains("'add'"), "got {}", printed);
    }

    #[test]
    fn lifting_binders_inline_their_source() {
        let mut ev = evaluator();
        let results = ev.eval_source("
            lifting two := 1 + 1.
            two + two.
        ").unwrap();
        assert_eq!(ev.render(&results[0].term), "4");
    }

    #[test]
    fn division_by_zero_diagnoses_and_sticks() {
        let mut ev = evaluator();
        let results = ev.eval_source("1 / 0.").unwrap();
        let out = &results[0];
        assert_eq!(out.diagnostics.len(), 1);
        let printed = ev.render(&out.term);
        assert!(printed.contains("'div'"), "got {}", printed);
    }

    #[test]
    fn partial_application_eta_expands() {
        // applying the wrapped abstraction afterwards must behave
        // like the saturated call
        assert_eq!(eval_str("[x, y. x - y] (10) (3)."), "7");
        // a partially applied primitive is still a function
        assert_eq!(eval_str("'sub' (10) (3)."), "7");
    }

    #[test]
    fn strict_apply_leaves_partial_applications_stuck() {
        let mut ev = Evaluator::new(EvalOptions {
            strict_apply : true,
            ..EvalOptions::default()
        });
        let results = ev.eval_source("[x, y. x] (1).").unwrap();
        let printed = ev.render(&results[0].term);
        assert!(printed.contains("(1)"), "got {}", printed);
    }

    #[test]
    fn over_application_reduces_prefix_first() {
        assert_eq!(eval_str("[x. [y. x + y]] (30) (12)."), "42");
        // n-ary over-application : the applicable prefix reduces, then
        // its value consumes the tail
        assert_eq!(eval_str("[x. [y. x + y]] (30, 12)."), "42");
    }

    #[test]
    fn cells_reduce_elementwise() {
        assert_eq!(eval_str("[1 + 1 | 2 * 3]."), "[2 | 6]");
    }

    #[test]
    fn surface_mode_leaves_bodies_alone() {
        let mut ev = Evaluator::new(EvalOptions {
            deep : false,
            ..EvalOptions::default()
        });
        let results = ev.eval_source("[y. 1 + 1].").unwrap();
        assert_eq!(ev.render(&results[0].term), "[y. 'add' (1, 1)]");

        let mut deep_ev = evaluator();
        let results = deep_ev.eval_source("[y. 1 + 1].").unwrap();
        assert_eq!(deep_ev.render(&results[0].term), "[y. 2]");
    }

    #[test]
    fn deep_binding_flag_normalizes_bodies() {
        let mut ev = Evaluator::new(EvalOptions {
            deep : false,
            ..EvalOptions::default()
        });
        ev.eval_source("deep inc := [y. y + (1 + 1)].").unwrap();
        ev.eval_source("plain := [y. y + (1 + 1)].").unwrap();
        let env = ev.env.clone();
        let env = env.read();
        let tbl = &ev.table;
        let deep_idx = match env.lookup(tbl.get("inc").unwrap(), &[tbl.get("main").unwrap()]) {
            crate::env::Lookup::Found(i) => i,
            owise => panic!("lookup failed : {:?}", owise),
        };
        let plain_idx = match env.lookup(tbl.get("plain").unwrap(), &[tbl.get("main").unwrap()]) {
            crate::env::Lookup::Found(i) => i,
            owise => panic!("lookup failed : {:?}", owise),
        };
        let deep_term = unflatten(env.at(deep_idx).node.unwrap(), &ev.heap, &env);
        let plain_term = unflatten(env.at(plain_idx).node.unwrap(), &ev.heap, &env);
        let deep_printed = format!("{}", deep_term.display(tbl));
        let plain_printed = format!("{}", plain_term.display(tbl));
        assert!(deep_printed.contains("2") && !deep_printed.contains("'add' (1, 1)"),
                "got {}", deep_printed);
        assert!(plain_printed.contains("'add' (1, 1)"), "got {}", plain_printed);
    }

    #[test]
    fn literal_bindings_stay_unreduced() {
        let mut ev = evaluator();
        // deep on a literal binding has no effect
        ev.eval_source("literal deep frozen := 1 + 2.").unwrap();
        let env = ev.env.clone();
        let env = env.read();
        let idx = match env.lookup(ev.table.get("frozen").unwrap(), &[ev.table.get("main").unwrap()]) {
            crate::env::Lookup::Found(i) => i,
            owise => panic!("lookup failed : {:?}", owise),
        };
        let stored = unflatten(env.at(idx).node.unwrap(), &ev.heap, &env);
        assert_eq!(format!("{}", stored.display(&ev.table)), "'add' (1, 2)");
    }

    #[test]
    fn reduction_is_idempotent_on_values() {
        let mut ev = evaluator();
        let first = ev.eval_source("[f! n. [n = 0 ? 1 | n * f(n - 1)]] (6).").unwrap();
        let printed = ev.render(&first[0].term);
        assert_eq!(printed, "720");
        // feeding the readback through again changes nothing
        let second = ev.eval_source(&format!("{}.", printed)).unwrap();
        assert_eq!(ev.render(&second[0].term), "720");
        assert_eq!(second[0].stats.betas, 0);
        assert_eq!(second[0].stats.prim_apps, 0);
    }

    #[test]
    fn graphs_release_fully_between_statements() {
        let mut ev = evaluator();
        ev.eval_source("[f! n. [n = 0 ? 1 | n * f(n - 1)]] (8).").unwrap();
        // no definitions, so nothing should survive the statement
        assert_eq!(ev.heap.in_use(), 0);
    }

    #[test]
    fn unsharing_cap_prunes_pathological_readbacks() {
        let mut ev = evaluator();
        ev.eval_source("opaque z := 0.").unwrap();
        let mut expr = String::from("z");
        for _ in 0..34 {
            expr = format!("[a. a + a] ({})", expr);
        }
        let results = ev.eval_source(&format!("{}.", expr)).unwrap();
        assert!(results[0].term.contains_pruned());
        let printed = ev.render(&results[0].term);
        assert!(printed.contains("$pruned"), "expected pruning marker");
    }

    #[test]
    fn resolver_errors_surface() {
        let mut ev = evaluator();
        match ev.eval_source("nowhere (1).") {
            Err(crate::errors::MlcErr::Unresolved(name)) => assert_eq!(name, "nowhere"),
            owise => panic!("expected unresolved error, got {:?}", owise),
        }
    }

    #[test]
    fn printed_results_reparse() {
        // annotated variables (`x<0.1>`) are display-only, so the
        // round trip is stated over variable-free values
        let mut ev = evaluator();
        let results = ev.eval_source("[1 + 1 | 2 * 3 | \"s\" | #sym | 'add'].").unwrap();
        let printed = ev.render(&results[0].term);
        let again = ev.eval_source(&format!("{}.", printed)).unwrap();
        assert_eq!(ev.render(&again[0].term), printed);
    }
}
