use std::sync::Arc;

use crate::symbol::{ Symbol, SymbolTable };
use crate::prim::{ self, PrimId };

use InnerTerm::*;

/// Arc wrapper around `InnerTerm`. Terms are immutable trees; cloning a
/// `Term` is a pointer copy, so binder bodies and lifted sources can be
/// shared freely between the environment and the resolver without deep
/// copies. All mutation in the system happens on the flattened graph,
/// never here.
#[derive(Clone, PartialEq)]
pub struct Term(Arc<InnerTerm>);

/// The tree shape of a closed term. Local variables carry their
/// `(up, across)` coordinates : `up` counts enclosing binder bodies
/// between the variable and the binder that owns it, `across` indexes
/// into that binder's formals. The `name` on a variable is purely
/// informational and plays no part in equality or evaluation.
#[derive(Clone, PartialEq, Debug)]
pub enum InnerTerm {
    /// Formal 0 is the self slot and is the empty symbol here.
    Abs { formals : Vec<Symbol>, body : Term },
    /// Recursive abstraction; formal 0 holds the self name.
    Fix { formals : Vec<Symbol>, body : Term },
    App { fun : Term, args : Vec<Term> },
    Cell { elts : Vec<Term> },
    /// `vars[0]` is reserved (empty symbol) and `vals[0]` is the
    /// `undefined` primitive, so `across` indices line up with the
    /// vectors directly.
    Let { vars : Vec<Symbol>, vals : Vec<Term>, body : Term },
    Test { pred : Term, csqs : Vec<Term>, alts : Vec<Term> },
    Var { up : u32, across : u32, name : Symbol },
    Constant { index : u32, name : Symbol },
    Num(f64),
    Str(String),
    Sym(Symbol),
    Prim(PrimId),
    Pruned,
}

pub fn mk_abs(formals : Vec<Symbol>, body : Term) -> Term {
    assert!(!formals.is_empty());
    Abs { formals, body }.into()
}

pub fn mk_fix(formals : Vec<Symbol>, body : Term) -> Term {
    assert!(!formals.is_empty());
    Fix { formals, body }.into()
}

pub fn mk_app(fun : Term, args : Vec<Term>) -> Term {
    assert!(!args.is_empty());
    App { fun, args }.into()
}

pub fn mk_cell(elts : Vec<Term>) -> Term {
    assert!(!elts.is_empty());
    Cell { elts }.into()
}

pub fn mk_let(vars : Vec<Symbol>, vals : Vec<Term>, body : Term) -> Term {
    assert!(vars.len() >= 2);
    assert_eq!(vars.len(), vals.len());
    Let { vars, vals, body }.into()
}

pub fn mk_test(pred : Term, csqs : Vec<Term>, alts : Vec<Term>) -> Term {
    Test { pred, csqs, alts }.into()
}

pub fn mk_var(up : u32, across : u32, name : Symbol) -> Term {
    Var { up, across, name }.into()
}

pub fn mk_constant(index : u32, name : Symbol) -> Term {
    Constant { index, name }.into()
}

pub fn mk_num(n : f64) -> Term {
    Num(n).into()
}

pub fn mk_str(s : String) -> Term {
    Str(s).into()
}

pub fn mk_sym(s : Symbol) -> Term {
    Sym(s).into()
}

pub fn mk_prim(p : PrimId) -> Term {
    Prim(p).into()
}

pub fn mk_pruned() -> Term {
    Pruned.into()
}

impl Term {
    /// A term is closed when every variable's `up` stays inside the
    /// binders above it and `across` indexes a real formal. The
    /// resolver only ever produces closed terms; this is the checkable
    /// statement of that contract.
    pub fn is_closed(&self) -> bool {
        fn go(t : &Term, frames : &mut Vec<usize>) -> bool {
            match t.as_ref() {
                Var { up, across, .. } => {
                    let up = *up as usize;
                    up < frames.len() && (*across as usize) < frames[frames.len() - 1 - up]
                },
                Abs { formals, body } | Fix { formals, body } => {
                    frames.push(formals.len());
                    let ok = go(body, frames);
                    frames.pop();
                    ok
                },
                App { fun, args } => {
                    go(fun, frames) && args.iter().all(|a| go(a, frames))
                },
                Cell { elts } => elts.iter().all(|e| go(e, frames)),
                Let { vars, vals, body } => {
                    if !vals.iter().all(|v| go(v, frames)) {
                        return false
                    }
                    frames.push(vars.len());
                    let ok = go(body, frames);
                    frames.pop();
                    ok
                },
                Test { pred, csqs, alts } => {
                    go(pred, frames)
                    && csqs.iter().all(|c| go(c, frames))
                    && alts.iter().all(|a| go(a, frames))
                },
                Constant {..} | Num(_) | Str(_) | Sym(_) | Prim(_) | Pruned => true,
            }
        }
        go(self, &mut Vec::new())
    }

    /// Structural equality up to binder names : shapes, variable
    /// wiring, constants and atoms must match, but the informational
    /// symbols on binders and variables are ignored. This is the
    /// equality the round-trip properties are stated in.
    pub fn alike(&self, other : &Term) -> bool {
        match (self.as_ref(), other.as_ref()) {
            (Var { up : u1, across : a1, .. }, Var { up : u2, across : a2, .. }) => {
                u1 == u2 && a1 == a2
            },
            (Constant { index : i1, .. }, Constant { index : i2, .. }) => i1 == i2,
            (Num(a), Num(b)) => a == b,
            (Str(a), Str(b)) => a == b,
            (Sym(a), Sym(b)) => a == b,
            (Prim(a), Prim(b)) => a == b,
            (Pruned, Pruned) => true,
            (Abs { formals : f1, body : b1 }, Abs { formals : f2, body : b2 })
            | (Fix { formals : f1, body : b1 }, Fix { formals : f2, body : b2 }) => {
                f1.len() == f2.len() && b1.alike(b2)
            },
            (App { fun : f1, args : a1 }, App { fun : f2, args : a2 }) => {
                f1.alike(f2)
                && a1.len() == a2.len()
                && a1.iter().zip(a2).all(|(x, y)| x.alike(y))
            },
            (Cell { elts : e1 }, Cell { elts : e2 }) => {
                e1.len() == e2.len() && e1.iter().zip(e2).all(|(x, y)| x.alike(y))
            },
            (Let { vars : v1, vals : l1, body : b1 }, Let { vars : v2, vals : l2, body : b2 }) => {
                v1.len() == v2.len()
                && l1.iter().zip(l2).all(|(x, y)| x.alike(y))
                && b1.alike(b2)
            },
            (Test { pred : p1, csqs : c1, alts : a1 }, Test { pred : p2, csqs : c2, alts : a2 }) => {
                p1.alike(p2)
                && c1.len() == c2.len() && c1.iter().zip(c2).all(|(x, y)| x.alike(y))
                && a1.len() == a2.len() && a1.iter().zip(a2).all(|(x, y)| x.alike(y))
            },
            _ => false
        }
    }

    pub fn contains_pruned(&self) -> bool {
        match self.as_ref() {
            Pruned => true,
            Var {..} | Constant {..} | Num(_) | Str(_) | Sym(_) | Prim(_) => false,
            Abs { body, .. } | Fix { body, .. } => body.contains_pruned(),
            App { fun, args } => fun.contains_pruned() || args.iter().any(|a| a.contains_pruned()),
            Cell { elts } => elts.iter().any(|e| e.contains_pruned()),
            Let { vals, body, .. } => vals.iter().any(|v| v.contains_pruned()) || body.contains_pruned(),
            Test { pred, csqs, alts } => {
                pred.contains_pruned()
                || csqs.iter().any(|c| c.contains_pruned())
                || alts.iter().any(|a| a.contains_pruned())
            },
        }
    }

    pub fn display<'t>(&'t self, table : &'t SymbolTable) -> TermDisplay<'t> {
        TermDisplay { term : self, table }
    }
}

/// Renders a term in the concrete syntax. The output re-parses to an
/// alike term wherever it contains no `<..>`-annotated variables or
/// constants, which only occur in stuck readbacks.
pub struct TermDisplay<'t> {
    term : &'t Term,
    table : &'t SymbolTable,
}

impl<'t> TermDisplay<'t> {
    fn sub(&self, t : &'t Term) -> TermDisplay<'t> {
        TermDisplay { term : t, table : self.table }
    }

    fn write_formals(&self, formals : &[Symbol], f : &mut std::fmt::Formatter) -> std::fmt::Result {
        if !formals[0].is_empty() {
            write!(f, "{}! ", self.table.resolve(formals[0]))?;
        }
        for (i, formal) in formals[1..].iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", self.table.resolve(*formal))?;
        }
        Ok(())
    }

    fn write_seq(&self, ts : &'t [Term], sep : &str, f : &mut std::fmt::Formatter) -> std::fmt::Result {
        for (i, t) in ts.iter().enumerate() {
            if i > 0 {
                write!(f, "{}", sep)?;
            }
            write!(f, "{}", self.sub(t))?;
        }
        Ok(())
    }
}

impl<'t> std::fmt::Display for TermDisplay<'t> {
    fn fmt(&self, f : &mut std::fmt::Formatter) -> std::fmt::Result {
        match self.term.as_ref() {
            Abs { formals, body } | Fix { formals, body } => {
                write!(f, "[")?;
                self.write_formals(formals, f)?;
                write!(f, ". {}]", self.sub(body))
            },
            App { fun, args } => {
                write!(f, "{} (", self.sub(fun))?;
                self.write_seq(args, ", ", f)?;
                write!(f, ")")
            },
            Cell { elts } => {
                write!(f, "[")?;
                self.write_seq(elts, " | ", f)?;
                write!(f, "]")
            },
            Let { vars, vals, body } => {
                write!(f, "let {{")?;
                for i in 1..vars.len() {
                    if i > 1 {
                        write!(f, ". ")?;
                    }
                    write!(f, "{} := {}", self.table.resolve(vars[i]), self.sub(&vals[i]))?;
                }
                write!(f, "}} {}", self.sub(body))
            },
            Test { pred, csqs, alts } => {
                write!(f, "[{} ? ", self.sub(pred))?;
                self.write_seq(csqs, ", ", f)?;
                write!(f, " | ")?;
                self.write_seq(alts, ", ", f)?;
                write!(f, "]")
            },
            Var { up, across, name } => {
                write!(f, "{}<{}.{}>", self.table.resolve(*name), up, across)
            },
            Constant { index, name } => {
                write!(f, "{}<{}>", self.table.resolve(*name), index)
            },
            Num(n) => write!(f, "{}", n),
            Str(s) => {
                write!(f, "\"")?;
                for c in s.chars() {
                    match c {
                        '"' => write!(f, "\\\"")?,
                        '\\' => write!(f, "\\\\")?,
                        '\n' => write!(f, "\\n")?,
                        owise => write!(f, "{}", owise)?,
                    }
                }
                write!(f, "\"")
            },
            Sym(s) => write!(f, "#{}", self.table.resolve(*s)),
            Prim(p) => write!(f, "'{}'", prim::name(*p)),
            Pruned => write!(f, "$pruned"),
        }
    }
}

impl std::fmt::Debug for Term {
    fn fmt(&self, f : &mut std::fmt::Formatter) -> std::fmt::Result {
        match self.as_ref() {
            Abs { formals, body } => write!(f, "Abs({}, {:?})", formals.len(), body),
            Fix { formals, body } => write!(f, "Fix({}, {:?})", formals.len(), body),
            App { fun, args } => write!(f, "App({:?}, {:?})", fun, args),
            Cell { elts } => write!(f, "Cell({:?})", elts),
            Let { vals, body, .. } => write!(f, "Let({:?}, {:?})", &vals[1..], body),
            Test { pred, csqs, alts } => write!(f, "Test({:?} ? {:?} | {:?})", pred, csqs, alts),
            Var { up, across, .. } => write!(f, "Var<{}.{}>", up, across),
            Constant { index, .. } => write!(f, "Const<{}>", index),
            Num(n) => write!(f, "Num({})", n),
            Str(s) => write!(f, "Str({:?})", s),
            Sym(s) => write!(f, "Sym({:?})", s),
            Prim(p) => write!(f, "Prim({:?})", p),
            Pruned => write!(f, "Pruned"),
        }
    }
}

impl std::convert::AsRef<InnerTerm> for Term {
    fn as_ref(&self) -> &InnerTerm {
        match self {
            Term(arc) => arc.as_ref()
        }
    }
}

impl From<InnerTerm> for Term {
    fn from(x : InnerTerm) -> Term {
        Term(Arc::new(x))
    }
}

#[cfg(test)]
mod term_tests {
    use super::*;
    use crate::symbol::{ SymbolTable, EMPTY_SYM };
    use crate::prim::registry;

    #[test]
    fn closedness() {
        let mut tbl = SymbolTable::new();
        let x = tbl.intern("x");
        // [x. x]
        let id = mk_abs(vec![EMPTY_SYM, x], mk_var(0, 1, x));
        assert!(id.is_closed());
        // [x. y<1.1>] with nothing outside : open
        let open = mk_abs(vec![EMPTY_SYM, x], mk_var(1, 1, x));
        assert!(!open.is_closed());
        // across out of range
        let bad = mk_abs(vec![EMPTY_SYM, x], mk_var(0, 2, x));
        assert!(!bad.is_closed());
    }

    #[test]
    fn display_abs_and_app() {
        let mut tbl = SymbolTable::new();
        let x = tbl.intern("x");
        let id = mk_abs(vec![EMPTY_SYM, x], mk_var(0, 1, x));
        let app = mk_app(id, vec![mk_num(42.0)]);
        assert_eq!(format!("{}", app.display(&tbl)), "[x. x<0.1>] (42)");
    }

    #[test]
    fn display_fix_and_atoms() {
        let mut tbl = SymbolTable::new();
        let f = tbl.intern("f");
        let n = tbl.intern("n");
        let fix = mk_fix(vec![f, n], mk_var(0, 0, f));
        assert_eq!(format!("{}", fix.display(&tbl)), "[f! n. f<0.0>]");
        let add = registry().lookup("add").unwrap();
        assert_eq!(format!("{}", mk_prim(add).display(&tbl)), "'add'");
        assert_eq!(format!("{}", mk_str("a\"b".into()).display(&tbl)), "\"a\\\"b\"");
        assert_eq!(format!("{}", mk_num(1.5).display(&tbl)), "1.5");
        assert_eq!(format!("{}", mk_pruned().display(&tbl)), "$pruned");
    }

    #[test]
    fn alike_ignores_names() {
        let mut tbl = SymbolTable::new();
        let x = tbl.intern("x");
        let y = tbl.intern("y");
        let t1 = mk_abs(vec![EMPTY_SYM, x], mk_var(0, 1, x));
        let t2 = mk_abs(vec![EMPTY_SYM, y], mk_var(0, 1, y));
        let t3 = mk_abs(vec![EMPTY_SYM, y], mk_var(0, 0, y));
        assert!(t1.alike(&t2));
        assert!(!t1.alike(&t3));
    }
}
