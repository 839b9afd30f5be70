use std::fmt::Debug;

/// User-facing failures travel as `MlcErr` values; the driver prints
/// them and keeps the session alive. Violations of internal graph
/// invariants instead go through the diverging helpers below, since a
/// broken chain cannot be recovered from and any attempt to limp on
/// would just corrupt the arena further.

pub type MlcResult<T> = Result<T, MlcErr>;

#[derive(Debug, Clone, PartialEq)]
pub enum MlcErr {
    /// Lexer/parser failure; line number and description.
    Parse(usize, String),
    /// The token stream ended inside a statement. The REPL uses this
    /// to keep reading lines instead of reporting an error.
    ParseEof,
    /// A name matched neither the local context nor any binder visible
    /// in the active namespaces.
    Unresolved(String),
    /// A name matched binders in more than one active namespace.
    Ambiguous(String, Vec<String>),
    /// A quoted primitive name is not in the registry.
    UnknownPrim(String),
    /// The pseudo-primitive `undefined` was used as the source of a
    /// lifting binder.
    UndefinedLift(String),
    /// A lifting binder's source term references another lifting
    /// binder; a single synthetic let cannot bind across definitions.
    LiftedLiftRef(String),
}

impl std::fmt::Display for MlcErr {
    fn fmt(&self, f : &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            MlcErr::Parse(line, msg) => write!(f, "parse error, line {} : {}", line, msg),
            MlcErr::ParseEof => write!(f, "parse error : unexpected end of input"),
            MlcErr::Unresolved(name) => write!(f, "unresolved name `{}`", name),
            MlcErr::Ambiguous(name, spaces) => write!(f, "ambiguous name `{}`; candidates in namespaces {:?}", name, spaces),
            MlcErr::UnknownPrim(name) => write!(f, "unknown primitive '{}'", name),
            MlcErr::UndefinedLift(name) => write!(f, "lifting binder `{}` has no semantics : its source is 'undefined'", name),
            MlcErr::LiftedLiftRef(name) => write!(f, "lifting binder `{}` references another lifting binder", name),
        }
    }
}

impl std::error::Error for MlcErr {}

/// The arena refused to grow past its cap. Reduction cannot make
/// progress and partial results would reference freed slots, so this
/// is fatal by design of the heap contract.
pub fn heap_exhausted(live : usize, cap : usize, allocated : u64) -> ! {
    eprintln!("heap exhausted : {} nodes in use (cap {}, {} allocated over the session)\n", live, cap, allocated);
    std::process::exit(-1)
}

pub fn err_slot_kind<T : Debug>(loc : u32, expected : &'static str, got : &T) -> ! {
    eprintln!("node line {} : expected a {} slot, got {:?}\n", loc, expected, got);
    std::process::exit(-1)
}

pub fn err_variety<T : Debug>(loc : u32, expected : &'static str, got : &T) -> ! {
    eprintln!("reduce line {} : cursor expected a {} node, got {:?}\n", loc, expected, got);
    std::process::exit(-1)
}

pub fn err_dangling(loc : u32, idx : usize) -> ! {
    eprintln!("heap line {} : access to freed or out-of-range node {}\n", loc, idx);
    std::process::exit(-1)
}

pub fn err_nref_underflow(loc : u32, idx : usize) -> ! {
    eprintln!("heap line {} : reference count underflow on node {}\n", loc, idx);
    std::process::exit(-1)
}

pub fn err_self_subst(loc : u32) -> ! {
    eprintln!("subst line {} : self substitution requested but no self node was supplied\n", loc);
    std::process::exit(-1)
}

pub fn err_lifting_in_flatten(loc : u32, binder_idx : u32) -> ! {
    eprintln!("flatten line {} : binder {} is flagged lifting but reached the flattener; the resolver should have rebound it\n", loc, binder_idx);
    std::process::exit(-1)
}

pub fn source_file_err<T : std::fmt::Display>(loc : u32, err : T) -> ! {
    eprintln!("main line {} : failed to read at least one of the specified source files. Please check that the file exists at the specified path. Error details : {}\n", loc, err);
    std::process::exit(-1)
}

pub fn toplevel_err<T : Debug>(t : &T) -> ! {
    eprintln!("execution failed with error : {:?}\n", t);
    std::process::exit(-1)
}
