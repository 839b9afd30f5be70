use once_cell::sync::Lazy;
use hashbrown::HashMap;

use crate::symbol::Symbol;

/// Index into the primitive registry. The registry is immutable and
/// built once, so a `PrimId` is stable for the life of the process and
/// can be embedded directly in terms and graph slots.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct PrimId(u32);

impl PrimId {
    pub fn idx(self) -> usize {
        match self {
            PrimId(n) => n as usize
        }
    }
}

/// The two truth atoms and the reserved pseudo-primitive occupy fixed
/// registry positions; `registry()` asserts the layout on first use.
pub const PRIM_TRUE : PrimId = PrimId(0);
pub const PRIM_FALSE : PrimId = PrimId(1);
pub const PRIM_UNDEFINED : PrimId = PrimId(2);

/// An atomic value as seen by a primitive : the fully reduced payload
/// of an argument slot. Composite nodes (abstractions, cells, stuck
/// applications) never atomize, and their presence leaves the calling
/// application stuck rather than failed.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Num(f64),
    Str(String),
    Sym(Symbol),
    Bool(bool),
    Prim(PrimId),
}

#[derive(Debug, Clone, PartialEq)]
pub enum PrimFailure {
    /// Division or modulo with a zero divisor.
    DivZero,
    /// An argument had the wrong shape for this operation.
    TypeMismatch(&'static str),
    /// `undefined` was dispatched; it has no semantics anywhere.
    Undefined,
}

impl std::fmt::Display for PrimFailure {
    fn fmt(&self, f : &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            PrimFailure::DivZero => write!(f, "division by zero"),
            PrimFailure::TypeMismatch(wanted) => write!(f, "expected {}", wanted),
            PrimFailure::Undefined => write!(f, "'undefined' has no semantics"),
        }
    }
}

type PrimFn = fn(&[Value]) -> Result<Value, PrimFailure>;

pub struct PrimDef {
    pub name : &'static str,
    pub arity : usize,
    pub run : PrimFn,
}

pub struct Registry {
    defs : Vec<PrimDef>,
    by_name : HashMap<&'static str, PrimId>,
}

impl Registry {
    fn add(&mut self, name : &'static str, arity : usize, run : PrimFn) -> PrimId {
        let id = PrimId(self.defs.len() as u32);
        self.defs.push(PrimDef { name, arity, run });
        let clash = self.by_name.insert(name, id);
        assert!(clash.is_none());
        id
    }

    pub fn get(&self, id : PrimId) -> &PrimDef {
        &self.defs[id.idx()]
    }

    pub fn lookup(&self, name : &str) -> Option<PrimId> {
        self.by_name.get(name).copied()
    }
}

pub fn registry() -> &'static Registry {
    static REGISTRY : Lazy<Registry> = Lazy::new(|| {
        let mut r = Registry {
            defs : Vec::with_capacity(20),
            by_name : HashMap::with_capacity(20),
        };
        let t = r.add("true", 0, |_| Err(PrimFailure::TypeMismatch("no arguments")));
        let f = r.add("false", 0, |_| Err(PrimFailure::TypeMismatch("no arguments")));
        let u = r.add("undefined", 0, |_| Err(PrimFailure::Undefined));
        assert_eq!(t, PRIM_TRUE);
        assert_eq!(f, PRIM_FALSE);
        assert_eq!(u, PRIM_UNDEFINED);

        r.add("add", 2, |args| numeric2(args, |a, b| Ok(a + b)));
        r.add("sub", 2, |args| numeric2(args, |a, b| Ok(a - b)));
        r.add("mul", 2, |args| numeric2(args, |a, b| Ok(a * b)));
        r.add("div", 2, |args| numeric2(args, |a, b| {
            if b == 0.0 { Err(PrimFailure::DivZero) } else { Ok(a / b) }
        }));
        r.add("mod", 2, |args| numeric2(args, |a, b| {
            if b == 0.0 { Err(PrimFailure::DivZero) } else { Ok(a % b) }
        }));
        r.add("neg", 1, |args| match args {
            [Value::Num(a)] => Ok(Value::Num(-a)),
            _ => Err(PrimFailure::TypeMismatch("a number")),
        });

        r.add("eq", 2, |args| atomic2(args, |a, b| a == b));
        r.add("ne", 2, |args| atomic2(args, |a, b| a != b));
        r.add("lt", 2, |args| compare2(args, |a, b| a < b));
        r.add("gt", 2, |args| compare2(args, |a, b| a > b));
        r.add("le", 2, |args| compare2(args, |a, b| a <= b));
        r.add("ge", 2, |args| compare2(args, |a, b| a >= b));

        r.add("not", 1, |args| match args {
            [Value::Bool(b)] => Ok(Value::Bool(!b)),
            [Value::Prim(p)] if *p == PRIM_TRUE => Ok(Value::Bool(false)),
            [Value::Prim(p)] if *p == PRIM_FALSE => Ok(Value::Bool(true)),
            _ => Err(PrimFailure::TypeMismatch("a truth value")),
        });

        r
    });

    &REGISTRY
}

fn numeric2(args : &[Value], op : fn(f64, f64) -> Result<f64, PrimFailure>) -> Result<Value, PrimFailure> {
    match args {
        [Value::Num(a), Value::Num(b)] => op(*a, *b).map(Value::Num),
        _ => Err(PrimFailure::TypeMismatch("two numbers")),
    }
}

fn compare2(args : &[Value], op : fn(f64, f64) -> bool) -> Result<Value, PrimFailure> {
    match args {
        [Value::Num(a), Value::Num(b)] => Ok(Value::Bool(op(*a, *b))),
        _ => Err(PrimFailure::TypeMismatch("two numbers")),
    }
}

fn atomic2(args : &[Value], op : fn(&Value, &Value) -> bool) -> Result<Value, PrimFailure> {
    match args {
        [a, b] => Ok(Value::Bool(op(a, b))),
        _ => Err(PrimFailure::TypeMismatch("two atoms")),
    }
}

pub fn apply(id : PrimId, args : &[Value]) -> Result<Value, PrimFailure> {
    (registry().get(id).run)(args)
}

pub fn name(id : PrimId) -> &'static str {
    registry().get(id).name
}

pub fn arity(id : PrimId) -> usize {
    registry().get(id).arity
}

/// Truth values round-trip between `Value::Bool` and the two truth
/// atoms when written back into graph slots.
pub fn truth_atom(b : bool) -> PrimId {
    if b { PRIM_TRUE } else { PRIM_FALSE }
}

pub fn as_truth(id : PrimId) -> Option<bool> {
    if id == PRIM_TRUE {
        Some(true)
    } else if id == PRIM_FALSE {
        Some(false)
    } else {
        None
    }
}
