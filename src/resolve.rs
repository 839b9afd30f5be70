use indexmap::IndexSet;

use crate::symbol::{ Symbol, SymbolTable, EMPTY_SYM };
use crate::parser::Form;
use crate::term::{ Term, InnerTerm, mk_abs, mk_fix, mk_app, mk_cell, mk_let, mk_test,
                   mk_var, mk_constant, mk_num, mk_str, mk_sym, mk_prim };
use crate::env::Env;
use crate::prim::{ registry, PRIM_UNDEFINED };
use crate::errors::{ MlcResult, MlcErr };

/// Converts a parsed form into a closed term. Local names resolve
/// against a stack of binder frames to `(up, across)` coordinates;
/// everything else goes to the global environment, restricted to the
/// active namespaces. References to lifting binders are collected and
/// the result is wrapped in a synthetic let carrying their source
/// terms, with the constants rebound to let variables.
pub struct Resolver<'e> {
    env : &'e Env,
    table : &'e SymbolTable,
    active : &'e [Symbol],
    ctx : Vec<Vec<Symbol>>,
    refs : IndexSet<u32>,
}

pub fn resolve(form : &Form, env : &Env, table : &SymbolTable, active : &[Symbol]) -> MlcResult<Term> {
    let mut resolver = Resolver {
        env,
        table,
        active,
        ctx : Vec::with_capacity(16),
        refs : IndexSet::new(),
    };
    let term = resolver.form_term(form)?;
    let wrapped = resolver.wrap_lifted(term)?;
    debug_assert!(wrapped.is_closed());
    Ok(wrapped)
}

impl<'e> Resolver<'e> {
    fn form_term(&mut self, form : &Form) -> MlcResult<Term> {
        stacker::maybe_grow(64 * 1024, 4 * 1024 * 1024, || self.form_term_core(form))
    }

    fn form_term_core(&mut self, form : &Form) -> MlcResult<Term> {
        match form {
            Form::Var(name) => self.resolve_name(*name),
            Form::Num(n) => Ok(mk_num(*n)),
            Form::Str(s) => Ok(mk_str(s.clone())),
            Form::Sym(s) => Ok(mk_sym(*s)),
            Form::Prim(name) => match registry().lookup(name) {
                Some(id) => Ok(mk_prim(id)),
                None => Err(MlcErr::UnknownPrim(name.clone())),
            },
            Form::Abs { self_name, formals, body } => {
                let mut frame = Vec::with_capacity(formals.len() + 1);
                frame.push((*self_name).unwrap_or(EMPTY_SYM));
                frame.extend_from_slice(formals);
                self.ctx.push(frame.clone());
                let body = self.form_term(body);
                self.ctx.pop();
                let body = body?;
                Ok(match self_name {
                    Some(_) => mk_fix(frame, body),
                    None => mk_abs(frame, body),
                })
            },
            Form::App { fun, args } => {
                let fun = self.form_term(fun)?;
                if args.is_empty() {
                    // zero-argument applications collapse to the function
                    return Ok(fun)
                }
                let mut resolved = Vec::with_capacity(args.len());
                for arg in args {
                    resolved.push(self.form_term(arg)?);
                }
                Ok(mk_app(fun, resolved))
            },
            Form::Cell(elts) => {
                let mut resolved = Vec::with_capacity(elts.len());
                for e in elts {
                    resolved.push(self.form_term(e)?);
                }
                Ok(mk_cell(resolved))
            },
            Form::Test { pred, csq, alt } => {
                let pred = self.form_term(pred)?;
                let csq = self.form_term(csq)?;
                let alt = self.form_term(alt)?;
                Ok(mk_test(pred, vec![csq], vec![alt]))
            },
            Form::Let { vars, vals, body } => {
                let mut term_vals = Vec::with_capacity(vals.len() + 1);
                term_vals.push(mk_prim(PRIM_UNDEFINED));
                for v in vals {
                    term_vals.push(self.form_term(v)?);
                }
                let mut frame = Vec::with_capacity(vars.len() + 1);
                frame.push(EMPTY_SYM);
                frame.extend_from_slice(vars);
                self.ctx.push(frame.clone());
                let body = self.form_term(body);
                self.ctx.pop();
                Ok(mk_let(frame, term_vals, body?))
            },
        }
    }

    fn resolve_name(&mut self, name : Symbol) -> MlcResult<Term> {
        for (up, frame) in self.ctx.iter().rev().enumerate() {
            if let Some(across) = frame.iter().position(|s| *s == name && !s.is_empty()) {
                return Ok(mk_var(up as u32, across as u32, name))
            }
        }
        match self.env.lookup(name, self.active) {
            crate::env::Lookup::Found(idx) => {
                if self.env.at(idx).flags.lifting() {
                    self.refs.insert(idx);
                }
                Ok(mk_constant(idx, name))
            },
            crate::env::Lookup::Ambiguous(spaces) => {
                Err(MlcErr::Ambiguous(
                    String::from(self.table.resolve(name)),
                    spaces.iter().map(|s| String::from(self.table.resolve(*s))).collect(),
                ))
            },
            crate::env::Lookup::Missing => {
                Err(MlcErr::Unresolved(String::from(self.table.resolve(name))))
            },
        }
    }

    /// Wrap the term in a let binding the source terms of every
    /// referenced lifting binder, sorted by binder index, and rebind
    /// the constants in the body to the corresponding let variables.
    fn wrap_lifted(&mut self, term : Term) -> MlcResult<Term> {
        if self.refs.is_empty() {
            return Ok(term)
        }
        let mut sorted : Vec<u32> = self.refs.iter().copied().collect();
        sorted.sort();

        let mut vars = Vec::with_capacity(sorted.len() + 1);
        let mut vals = Vec::with_capacity(sorted.len() + 1);
        vars.push(EMPTY_SYM);
        vals.push(mk_prim(PRIM_UNDEFINED));
        for &idx in sorted.iter() {
            let binder = self.env.at(idx);
            let name = String::from(self.table.resolve(binder.name));
            let source = match &binder.source {
                Some(t) => t.clone(),
                None => return Err(MlcErr::LiftedLiftRef(name)),
            };
            if let InnerTerm::Prim(p) = source.as_ref() {
                if *p == PRIM_UNDEFINED {
                    return Err(MlcErr::UndefinedLift(name))
                }
            }
            if self.references_lifting(&source) {
                return Err(MlcErr::LiftedLiftRef(name))
            }
            vars.push(binder.name);
            vals.push(source);
        }

        let body = self.rebind(&term, 0, &sorted);
        Ok(mk_let(vars, vals, body))
    }

    fn references_lifting(&self, t : &Term) -> bool {
        match t.as_ref() {
            InnerTerm::Constant { index, .. } => self.env.at(*index).flags.lifting(),
            InnerTerm::Abs { body, .. } | InnerTerm::Fix { body, .. } => self.references_lifting(body),
            InnerTerm::App { fun, args } => {
                self.references_lifting(fun) || args.iter().any(|a| self.references_lifting(a))
            },
            InnerTerm::Cell { elts } => elts.iter().any(|e| self.references_lifting(e)),
            InnerTerm::Let { vals, body, .. } => {
                vals.iter().any(|v| self.references_lifting(v)) || self.references_lifting(body)
            },
            InnerTerm::Test { pred, csqs, alts } => {
                self.references_lifting(pred)
                || csqs.iter().any(|c| self.references_lifting(c))
                || alts.iter().any(|a| self.references_lifting(a))
            },
            _ => false,
        }
    }

    /// Replace `Constant` references to the lifted binders with let
    /// variables. `depth` counts the binder bodies entered below the
    /// synthetic let.
    fn rebind(&self, t : &Term, depth : u32, sorted : &[u32]) -> Term {
        stacker::maybe_grow(64 * 1024, 4 * 1024 * 1024, || self.rebind_core(t, depth, sorted))
    }

    fn rebind_core(&self, t : &Term, depth : u32, sorted : &[u32]) -> Term {
        match t.as_ref() {
            InnerTerm::Constant { index, name } => {
                match sorted.iter().position(|i| i == index) {
                    Some(k) => mk_var(depth, (k + 1) as u32, *name),
                    None => t.clone(),
                }
            },
            InnerTerm::Var {..} | InnerTerm::Num(_) | InnerTerm::Str(_)
            | InnerTerm::Sym(_) | InnerTerm::Prim(_) | InnerTerm::Pruned => t.clone(),
            InnerTerm::Abs { formals, body } => {
                mk_abs(formals.clone(), self.rebind(body, depth + 1, sorted))
            },
            InnerTerm::Fix { formals, body } => {
                mk_fix(formals.clone(), self.rebind(body, depth + 1, sorted))
            },
            InnerTerm::App { fun, args } => {
                mk_app(self.rebind(fun, depth, sorted),
                       args.iter().map(|a| self.rebind(a, depth, sorted)).collect())
            },
            InnerTerm::Cell { elts } => {
                mk_cell(elts.iter().map(|e| self.rebind(e, depth, sorted)).collect())
            },
            InnerTerm::Let { vars, vals, body } => {
                mk_let(vars.clone(),
                       vals.iter().map(|v| self.rebind(v, depth, sorted)).collect(),
                       self.rebind(body, depth + 1, sorted))
            },
            InnerTerm::Test { pred, csqs, alts } => {
                mk_test(self.rebind(pred, depth, sorted),
                        csqs.iter().map(|c| self.rebind(c, depth, sorted)).collect(),
                        alts.iter().map(|a| self.rebind(a, depth, sorted)).collect())
            },
        }
    }
}
