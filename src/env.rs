use hashbrown::HashMap;

use crate::symbol::Symbol;
use crate::term::Term;
use crate::node::NodeId;

/// Binder attributes. `Opaque` binders never expand during reduction,
/// `Literal` binders store their body flattened but unreduced, `Deep`
/// binders reduce under their abstractions when defined, and `Lifting`
/// binders keep their source term so the resolver can inline them into
/// a synthetic let at every use site.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct BinderFlags(u8);

impl BinderFlags {
    pub const OPAQUE : BinderFlags = BinderFlags(1);
    pub const LITERAL : BinderFlags = BinderFlags(2);
    pub const DEEP : BinderFlags = BinderFlags(4);
    pub const LIFTING : BinderFlags = BinderFlags(8);

    pub fn union(self, other : BinderFlags) -> BinderFlags {
        BinderFlags(self.0 | other.0)
    }

    pub fn opaque(self) -> bool {
        self.0 & Self::OPAQUE.0 != 0
    }

    pub fn literal(self) -> bool {
        self.0 & Self::LITERAL.0 != 0
    }

    pub fn deep(self) -> bool {
        self.0 & Self::DEEP.0 != 0
    }

    pub fn lifting(self) -> bool {
        self.0 & Self::LIFTING.0 != 0
    }
}

/// One global environment entry. Exactly one of `node`/`source` is
/// populated once definition completes : lifting binders preserve the
/// resolved source term, everything else stores the sentinel of an
/// already-flattened (and, unless literal, already-reduced) graph
/// parked at depth 0.
#[derive(Debug)]
pub struct Binder {
    pub index : u32,
    pub name : Symbol,
    pub space : Symbol,
    pub flags : BinderFlags,
    pub node : Option<NodeId>,
    pub source : Option<Term>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Missing,
    Found(u32),
    /// More than one active namespace held the name; the offending
    /// spaces ride along for the error report.
    Ambiguous(Vec<Symbol>),
}

/// Binders keyed both ways : an append-only vector ordered by index,
/// and a name multimap whose entries are filtered by namespace at
/// lookup time. Index 0 is a reserved dummy so that a zero index is
/// never a valid reference.
pub struct Env {
    binders : Vec<Binder>,
    by_name : HashMap<Symbol, Vec<u32>>,
}

impl Env {
    pub fn new() -> Self {
        let mut env = Env {
            binders : Vec::with_capacity(256),
            by_name : HashMap::with_capacity(256),
        };
        env.binders.push(Binder {
            index : 0,
            name : crate::symbol::EMPTY_SYM,
            space : crate::symbol::EMPTY_SYM,
            flags : BinderFlags::default(),
            node : None,
            source : None,
        });
        env
    }

    /// Create (or, for an exact `(name, space)` match, repossess) a
    /// binder. Redefinition keeps the old index so that existing
    /// constant references stay stable; the caller installs the new
    /// body afterwards.
    pub fn bind(&mut self, name : Symbol, space : Symbol, flags : BinderFlags) -> u32 {
        for &idx in self.by_name.get(&name).into_iter().flatten() {
            if self.binders[idx as usize].space == space {
                let b = &mut self.binders[idx as usize];
                b.flags = flags;
                b.node = None;
                b.source = None;
                return idx
            }
        }
        let index = self.binders.len() as u32;
        self.binders.push(Binder {
            index,
            name,
            space,
            flags,
            node : None,
            source : None,
        });
        self.by_name.entry(name).or_insert_with(Vec::new).push(index);
        index
    }

    pub fn lookup(&self, name : Symbol, active : &[Symbol]) -> Lookup {
        let candidates : Vec<u32> = self.by_name
            .get(&name)
            .into_iter()
            .flatten()
            .copied()
            .filter(|idx| active.contains(&self.binders[*idx as usize].space))
            .collect();
        match candidates.as_slice() {
            [] => Lookup::Missing,
            [single] => Lookup::Found(*single),
            many => Lookup::Ambiguous(many.iter().map(|i| self.binders[*i as usize].space).collect()),
        }
    }

    pub fn at(&self, index : u32) -> &Binder {
        &self.binders[index as usize]
    }

    pub fn at_mut(&mut self, index : u32) -> &mut Binder {
        &mut self.binders[index as usize]
    }

    pub fn num_binders(&self) -> usize {
        self.binders.len() - 1
    }

    /// Every graph root owned by the environment; these are GC roots
    /// for the passive sweep in addition to whatever chain is live.
    pub fn graph_roots(&self) -> Vec<NodeId> {
        self.binders.iter().filter_map(|b| b.node).collect()
    }
}
