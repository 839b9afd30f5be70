use crate::node::{ Node, NodeId, Slot, SlotRef, Variety };
use crate::errors;

pub const DEFAULT_CAP : usize = 1_000_000;
pub const THRESHOLD_FLOOR : f64 = 0.6;
pub const THRESHOLD_CEIL : f64 = 0.95;

/// Slab arena for graph nodes. Freed entries go on a free list and are
/// reused by later allocations; `live` tracks the in-use count against
/// a hard cap. The pressure threshold drives the reducer's passive
/// sweep : reference counting reclaims everything that can be
/// reclaimed, so the sweep is opportunistic and the threshold merely
/// rations how often it runs.
pub struct Heap {
    nodes : Vec<Node>,
    free : Vec<u32>,
    live : usize,
    cap : usize,
    threshold : f64,
    baseline : usize,
    allocated : u64,
}

impl Heap {
    pub fn new(cap : usize) -> Self {
        Heap {
            nodes : Vec::with_capacity(1024),
            free : Vec::with_capacity(256),
            live : 0,
            cap,
            threshold : THRESHOLD_FLOOR,
            baseline : 0,
            allocated : 0,
        }
    }

    pub fn alloc(&mut self, variety : Variety, depth : i32, nslots : usize) -> NodeId {
        if self.live >= self.cap {
            errors::heap_exhausted(self.live, self.cap, self.allocated);
        }
        self.live += 1;
        self.allocated += 1;
        let fresh = Node {
            variety,
            depth,
            nref : 0,
            backref : None,
            prev : NodeId::NIL,
            next : NodeId::NIL,
            forward : NodeId::NIL,
            alive : true,
            slots : vec![Slot::Null; nslots],
        };
        match self.free.pop() {
            Some(idx) => {
                let id = NodeId::new(idx as usize);
                self.nodes[id.idx()] = fresh;
                id
            },
            None => {
                let id = NodeId::new(self.nodes.len());
                self.nodes.push(fresh);
                id
            }
        }
    }

    pub fn node(&self, id : NodeId) -> &Node {
        match self.nodes.get(id.idx()) {
            Some(n) if n.alive => n,
            _ => errors::err_dangling(line!(), id.idx()),
        }
    }

    pub fn node_mut(&mut self, id : NodeId) -> &mut Node {
        match self.nodes.get_mut(id.idx()) {
            Some(n) if n.alive => n,
            _ => errors::err_dangling(line!(), id.idx()),
        }
    }

    /// Add a reference. Gaining a second referent is the moment a
    /// node becomes shared, and its backreference is nulled for good :
    /// even if the count later falls back to one, the surviving
    /// referrer's identity is unknown.
    pub fn incref(&mut self, id : NodeId) {
        let n = self.node_mut(id);
        n.nref += 1;
        if n.nref > 1 {
            n.backref = None;
        }
    }

    /// Remove a node from its chain, joining its neighbors. Safe to
    /// call on an already-detached node.
    pub fn unlink(&mut self, id : NodeId) {
        let (p, nx) = {
            let n = self.node(id);
            (n.prev, n.next)
        };
        if !p.is_nil() && self.nodes[p.idx()].alive {
            self.nodes[p.idx()].next = nx;
        }
        if !nx.is_nil() && self.nodes[nx.idx()].alive {
            self.nodes[nx.idx()].prev = p;
        }
        let n = self.node_mut(id);
        n.prev = NodeId::NIL;
        n.next = NodeId::NIL;
    }

    /// Return an entry to the free list without touching its slots or
    /// its neighbors' links. For nodes whose payload has been moved or
    /// released by hand (consumed sentinels, transplant sources); the
    /// caller is responsible for any relinking.
    pub fn free_raw(&mut self, id : NodeId) {
        let n = self.node_mut(id);
        n.alive = false;
        n.slots.clear();
        n.backref = None;
        n.prev = NodeId::NIL;
        n.next = NodeId::NIL;
        self.free.push(id.idx() as u32);
        self.live -= 1;
    }

    /// Drop one reference to `id`; at zero the node is unlinked, its
    /// entry reclaimed, and every node its slots referenced is
    /// dereferenced in turn. Iterative so that long chains cannot
    /// overflow the call stack.
    pub fn deref(&mut self, id : NodeId) {
        let mut work = vec![id];
        while let Some(cur) = work.pop() {
            {
                let n = self.node_mut(cur);
                if n.nref == 0 {
                    errors::err_nref_underflow(line!(), cur.idx());
                }
                n.nref -= 1;
                if n.nref > 0 {
                    continue
                }
            }
            self.unlink(cur);
            let slots = {
                let n = self.node_mut(cur);
                n.alive = false;
                n.backref = None;
                std::mem::replace(&mut n.slots, Vec::new())
            };
            self.free.push(cur.idx() as u32);
            self.live -= 1;
            for slot in slots {
                if let Some(t) = slot.target() {
                    work.push(t);
                }
            }
        }
    }

    /// Move `src`'s payload into `dst`, which keeps its own identity :
    /// nref, backref and chain position. Backreferences of nodes the
    /// moved slots point at are snapped from `src` to `dst`. `dst`'s
    /// previous slots must already have been released by the caller.
    pub fn transplant(&mut self, dst : NodeId, src : NodeId) {
        let (variety, depth, slots) = {
            let s = self.node_mut(src);
            (s.variety, s.depth, std::mem::replace(&mut s.slots, Vec::new()))
        };
        {
            let d = self.node_mut(dst);
            debug_assert!(d.slots.is_empty());
            d.variety = variety;
            d.depth = depth;
            d.slots = slots;
        }
        for i in 0..self.node(dst).slots.len() {
            let t = match self.node(dst).slots[i].target() {
                Some(t) => t,
                None => continue,
            };
            let tn = self.node_mut(t);
            if let Some(br) = tn.backref {
                if br.node == src {
                    tn.backref = Some(SlotRef { node : dst, slot : i as u32 });
                }
            }
        }
    }

    /// The nodes of a chain in left-to-right order, sentinel excluded.
    pub fn chain_nodes(&self, sentinel : NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut cur = self.node(sentinel).next;
        while cur != sentinel && !cur.is_nil() {
            out.push(cur);
            cur = self.node(cur).next;
        }
        out
    }

    /// The root (semantic value) node of a chain.
    pub fn root_of(&self, sentinel : NodeId) -> NodeId {
        self.node(sentinel).slots[0].expect_body(line!())
    }

    pub fn is_alive(&self, id : NodeId) -> bool {
        self.nodes.get(id.idx()).map(|n| n.alive).unwrap_or(false)
    }

    pub fn in_use(&self) -> usize {
        self.live
    }

    pub fn total_allocated(&self) -> u64 {
        self.allocated
    }

    pub fn pressure(&self) -> f64 {
        self.live as f64 / self.cap as f64
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn over_threshold(&self) -> bool {
        self.pressure() > self.threshold
    }

    /// Record the current occupancy as the session baseline. Called at
    /// the start of a top-level reduction so pressure decisions are
    /// made relative to a known-good floor.
    pub fn baseline(&mut self) -> usize {
        self.baseline = self.live;
        self.baseline
    }

    /// Adjust the sweep threshold from current pressure. Sustained
    /// pressure above the threshold pushes it toward 1, moderate
    /// pressure eases it upward, and a quiet heap decays it back
    /// toward the floor. The threshold always stays in
    /// [THRESHOLD_FLOOR, THRESHOLD_CEIL].
    pub fn calibrate(&mut self) {
        let p = self.pressure();
        let t = self.threshold;
        if p > t {
            self.threshold = p + (1.0 - p) / 2.0;
        } else if p > 0.666 * t {
            self.threshold = t + (1.0 - t) / 2.0;
        } else if p < 0.333 * t {
            self.threshold = 0.666 * t;
        }
        if self.threshold < THRESHOLD_FLOOR {
            self.threshold = THRESHOLD_FLOOR;
        }
        if self.threshold > THRESHOLD_CEIL {
            self.threshold = THRESHOLD_CEIL;
        }
    }

    /// Every node reachable from the given roots through `Body` and
    /// `Subst` slots. Used as the mark set of the passive sweep and by
    /// the reference-count audits in the test suite.
    pub fn mark_reachable(&self, roots : &[NodeId]) -> hashbrown::HashSet<NodeId> {
        let mut marked = hashbrown::HashSet::with_capacity(64);
        let mut work : Vec<NodeId> = roots.to_vec();
        while let Some(cur) = work.pop() {
            if !marked.insert(cur) {
                continue
            }
            for slot in self.node(cur).slots.iter() {
                if let Some(t) = slot.target() {
                    work.push(t);
                }
            }
        }
        marked
    }

    /// Recompute what every reachable node's `nref` ought to be (one
    /// per referencing slot, plus one per root handle) and compare
    /// against the stored counts.
    pub fn audit_refcounts(&self, roots : &[NodeId]) -> Result<(), String> {
        let marked = self.mark_reachable(roots);
        let mut expected : hashbrown::HashMap<NodeId, u32> = hashbrown::HashMap::with_capacity(marked.len());
        for r in roots {
            *expected.entry(*r).or_insert(0) += 1;
        }
        for id in marked.iter() {
            for slot in self.node(*id).slots.iter() {
                if let Some(t) = slot.target() {
                    *expected.entry(t).or_insert(0) += 1;
                }
            }
        }
        for id in marked.iter() {
            let want = expected.get(id).copied().unwrap_or(0);
            let got = self.node(*id).nref;
            if want != got {
                return Err(format!("node {} has nref {} but {} referencing slots",
                                   id.idx(), got, want))
            }
        }
        Ok(())
    }

    /// Reclaim every live entry not in `marked`. The reducer computes
    /// the mark set from the current roots; with reference counting
    /// intact this finds nothing, which is exactly the point of
    /// running it rarely.
    pub fn sweep(&mut self, marked : &hashbrown::HashSet<NodeId>) -> usize {
        let mut reclaimed = 0;
        for idx in 0..self.nodes.len() {
            let id = NodeId::new(idx);
            if self.nodes[idx].alive && !marked.contains(&id) {
                let n = &mut self.nodes[idx];
                n.alive = false;
                n.slots.clear();
                n.backref = None;
                self.free.push(idx as u32);
                self.live -= 1;
                reclaimed += 1;
            }
        }
        reclaimed
    }
}
