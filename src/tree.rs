//! The element tree: nodes, builder operations, the merge algorithm, and
//! the binding order resolver.
//!
//! Elements live in an arena ([`ElementId`] slots in a `Vec`) with a parallel
//! leader vector. When two nodes merge, the absorbed slot's leader is pointed
//! at the survivor, so every handle to the absorbed node keeps resolving to
//! the authoritative one, even through chains of repeated merges.
//!
//! The tree is built single-threaded, finalized once, and never mutated
//! afterwards; dispatch reads it concurrently without locking.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use http::Method;
use tracing::debug;

use crate::error::{BoxError, TreeError};
use crate::inject::{Handler, Validator, Value};
use crate::router::RouterSpec;

/// Handle to one element in the tree. Handles stay valid across merges;
/// operations resolve them to the surviving node.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ElementId(pub(crate) usize);

/// Handle to one mounted delegation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct DelegationId(pub(crate) usize);

/// What kind of element a node is.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ElementKind {
    Root,
    Path,
    Binding,
    Method,
}

impl fmt::Display for ElementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ElementKind::Root => "root",
            ElementKind::Path => "path",
            ElementKind::Binding => "binding",
            ElementKind::Method => "method",
        })
    }
}

/// An element's identifier: nothing for the root, the segment text for
/// paths and bindings, the verb (or the any-verb fallback) for methods.
/// Set exactly once, at construction, and immutable thereafter.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Ident {
    Root,
    Segment(String),
    Verb(Option<Method>),
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ident::Root => f.write_str("<root>"),
            Ident::Segment(s) => f.write_str(s),
            Ident::Verb(Some(m)) => f.write_str(m.as_str()),
            Ident::Verb(None) => f.write_str("<any>"),
        }
    }
}

/// Converts a binding value back into a path segment for reverse routing.
pub type FormatterFn = dyn Fn(&Value) -> Result<String, BoxError> + Send + Sync;

/// A mount point handing the remaining dispatch to another router.
///
/// The factory receives the owning router instance's state and produces the
/// sub-router's spec and state; construction arguments are folded into the
/// closure. Delegate instances are constructed eagerly, per owning instance,
/// when the owner is constructed (see [`Router::new`](crate::router::Router::new)).
pub struct Delegation {
    factory: Box<dyn Fn(&Value) -> Result<(Arc<RouterSpec>, Value), BoxError> + Send + Sync>,
}

impl Delegation {
    pub fn new(
        factory: impl Fn(&Value) -> Result<(Arc<RouterSpec>, Value), BoxError>
            + Send
            + Sync
            + 'static,
    ) -> Arc<Self> {
        Arc::new(Delegation { factory: Box::new(factory) })
    }

    pub(crate) fn construct(
        &self,
        owner_state: &Value,
    ) -> Result<(Arc<RouterSpec>, Value), BoxError> {
        (self.factory)(owner_state)
    }
}

impl fmt::Debug for Delegation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Delegation(..)")
    }
}

pub(crate) struct DelegationEntry {
    pub(crate) delegation: Arc<Delegation>,
    /// The element the delegation is mounted at, for reverse routing.
    pub(crate) element: ElementId,
}

struct Node {
    kind: ElementKind,
    ident: Ident,
    parent: Option<ElementId>,
    paths: BTreeMap<String, ElementId>,
    bindings: BTreeMap<String, ElementId>,
    /// Memoized output of the binding order resolver; cleared whenever a
    /// binding is inserted here or a sibling's ordering hints change.
    binding_order: Option<Vec<ElementId>>,
    methods: HashMap<Option<Method>, ElementId>,
    delegation: Option<DelegationId>,
    // Binding payload.
    before: BTreeSet<String>,
    after: BTreeSet<String>,
    validator: Option<Arc<Validator>>,
    formatter: Option<Arc<FormatterFn>>,
    // Method payload.
    handler: Option<Arc<Handler>>,
}

impl Node {
    fn new(kind: ElementKind, ident: Ident, parent: Option<ElementId>) -> Self {
        Node {
            kind,
            ident,
            parent,
            paths: BTreeMap::new(),
            bindings: BTreeMap::new(),
            binding_order: None,
            methods: HashMap::new(),
            delegation: None,
            before: BTreeSet::new(),
            after: BTreeSet::new(),
            validator: None,
            formatter: None,
            handler: None,
        }
    }

    fn segment(&self) -> &str {
        match &self.ident {
            Ident::Segment(s) => s,
            _ => unreachable!("segment() on a non-path, non-binding element"),
        }
    }
}

/// The routing tree for one router type: a single root plus the elements
/// registered under it.
pub struct ElementTree {
    nodes: Vec<Node>,
    leaders: Vec<usize>,
    root: ElementId,
    delegations: Vec<DelegationEntry>,
}

impl Default for ElementTree {
    fn default() -> Self {
        Self::new()
    }
}

impl ElementTree {
    pub fn new() -> Self {
        ElementTree {
            nodes: vec![Node::new(ElementKind::Root, Ident::Root, None)],
            leaders: vec![0],
            root: ElementId(0),
            delegations: Vec::new(),
        }
    }

    pub fn root(&self) -> ElementId {
        self.root
    }

    // ---- handle resolution -------------------------------------------------

    /// Resolve a handle to the surviving node it now denotes.
    pub fn leader(&self, id: ElementId) -> ElementId {
        let mut index = id.0;
        while self.leaders[index] != index {
            index = self.leaders[index];
        }
        ElementId(index)
    }

    /// Leader resolution with path compression; used on mutable paths so
    /// repeated merges never leave long alias chains.
    fn leader_compress(&mut self, id: ElementId) -> ElementId {
        let target = self.leader(id);
        let mut index = id.0;
        while self.leaders[index] != target.0 {
            let next = self.leaders[index];
            self.leaders[index] = target.0;
            index = next;
        }
        target
    }

    fn node(&self, id: ElementId) -> &Node {
        &self.nodes[self.leader(id).0]
    }

    // ---- read accessors ----------------------------------------------------

    pub fn kind(&self, id: ElementId) -> ElementKind {
        self.node(id).kind
    }

    pub fn ident(&self, id: ElementId) -> &Ident {
        &self.node(id).ident
    }

    pub fn parent(&self, id: ElementId) -> Option<ElementId> {
        self.node(id).parent.map(|p| self.leader(p))
    }

    pub(crate) fn path_child(&self, id: ElementId, segment: &str) -> Option<ElementId> {
        self.node(id).paths.get(segment).map(|c| self.leader(*c))
    }

    pub(crate) fn method_child(
        &self,
        id: ElementId,
        verb: &Option<Method>,
    ) -> Option<ElementId> {
        self.node(id).methods.get(verb).map(|c| self.leader(*c))
    }

    pub(crate) fn has_methods(&self, id: ElementId) -> bool {
        !self.node(id).methods.is_empty()
    }

    pub(crate) fn method_verbs(&self, id: ElementId) -> impl Iterator<Item = &Option<Method>> {
        self.node(id).methods.keys()
    }

    pub(crate) fn delegation_of(&self, id: ElementId) -> Option<DelegationId> {
        self.node(id).delegation
    }

    pub(crate) fn handler_of(&self, id: ElementId) -> Option<&Arc<Handler>> {
        self.node(id).handler.as_ref()
    }

    pub(crate) fn validator_of(&self, id: ElementId) -> Option<&Arc<Validator>> {
        self.node(id).validator.as_ref()
    }

    pub(crate) fn formatter_of(&self, id: ElementId) -> Option<&Arc<FormatterFn>> {
        self.node(id).formatter.as_ref()
    }

    pub(crate) fn delegations(&self) -> &[DelegationEntry] {
        &self.delegations
    }

    /// The resolved binding order at a node. Only meaningful after
    /// [`finalize`](Self::finalize); dispatch never recomputes.
    pub(crate) fn resolved_binding_order(&self, id: ElementId) -> &[ElementId] {
        match &self.node(id).binding_order {
            Some(order) => order,
            None => &[],
        }
    }

    // ---- builder operations ------------------------------------------------

    fn alloc(&mut self, kind: ElementKind, ident: Ident, parent: Option<ElementId>) -> ElementId {
        let id = ElementId(self.nodes.len());
        self.nodes.push(Node::new(kind, ident, parent));
        self.leaders.push(id.0);
        id
    }

    fn ensure_not_method(&self, id: ElementId) -> Result<(), TreeError> {
        if self.node(id).kind == ElementKind::Method {
            return Err(TreeError::MethodIsLeaf);
        }
        Ok(())
    }

    /// Add a static path segment under `parent`. Re-adding an existing
    /// segment converges on the existing element via the merge algorithm.
    pub fn add_path(&mut self, parent: ElementId, segment: &str) -> Result<ElementId, TreeError> {
        let parent = self.leader_compress(parent);
        self.ensure_not_method(parent)?;
        let child = self.alloc(
            ElementKind::Path,
            Ident::Segment(segment.to_owned()),
            Some(parent),
        );
        self.insert_path_child(parent, child)
    }

    /// Add a variable segment under `parent`.
    pub fn add_binding(&mut self, parent: ElementId, name: &str) -> Result<ElementId, TreeError> {
        let parent = self.leader_compress(parent);
        self.ensure_not_method(parent)?;
        let child = self.alloc(
            ElementKind::Binding,
            Ident::Segment(name.to_owned()),
            Some(parent),
        );
        self.insert_binding_child(parent, child)
    }

    /// Route a verb (or the any-verb fallback, `None`) to a handler at
    /// `parent`. Routing the same verb to the same handler twice converges;
    /// a different handler is an error.
    pub fn add_method(
        &mut self,
        parent: ElementId,
        verb: Option<Method>,
        handler: Arc<Handler>,
    ) -> Result<ElementId, TreeError> {
        let parent = self.leader_compress(parent);
        self.ensure_not_method(parent)?;
        let child = self.alloc(ElementKind::Method, Ident::Verb(verb), Some(parent));
        self.nodes[child.0].handler = Some(handler);
        self.insert_method_child(parent, child)
    }

    /// Mount a delegation at `node`. With an empty verb list the whole
    /// element delegates; with verbs, verb-scoped handlerless methods are
    /// installed whose only job is to point at the delegation.
    pub fn mount(
        &mut self,
        node: ElementId,
        delegation: Arc<Delegation>,
        verbs: &[Method],
    ) -> Result<DelegationId, TreeError> {
        let node = self.leader_compress(node);

        if verbs.is_empty() {
            if let Some(existing) = self.nodes[node.0].delegation {
                if Arc::ptr_eq(&self.delegations[existing.0].delegation, &delegation) {
                    return Ok(existing);
                }
                return Err(TreeError::DelegationAlreadySet);
            }
            let id = DelegationId(self.delegations.len());
            self.delegations.push(DelegationEntry { delegation, element: node });
            self.nodes[node.0].delegation = Some(id);
            return Ok(id);
        }

        self.ensure_not_method(node)?;
        let mut seen = HashSet::new();
        for verb in verbs {
            if !seen.insert(verb.clone()) {
                continue;
            }
            if self.nodes[node.0].methods.contains_key(&Some(verb.clone())) {
                return Err(TreeError::DuplicateMethod { verb: verb.to_string() });
            }
        }
        let id = DelegationId(self.delegations.len());
        self.delegations.push(DelegationEntry { delegation, element: node });
        let mut seen = HashSet::new();
        for verb in verbs {
            if !seen.insert(verb.clone()) {
                continue;
            }
            let method = self.alloc(
                ElementKind::Method,
                Ident::Verb(Some(verb.clone())),
                Some(node),
            );
            self.nodes[method.0].delegation = Some(id);
            self.insert_method_child(node, method)?;
        }
        Ok(id)
    }

    /// Create a path element with no parent, to be attached later.
    pub fn detached_path(&mut self, segment: &str) -> ElementId {
        self.alloc(ElementKind::Path, Ident::Segment(segment.to_owned()), None)
    }

    /// Create a binding element with no parent, to be attached later.
    pub fn detached_binding(&mut self, name: &str) -> ElementId {
        self.alloc(ElementKind::Binding, Ident::Segment(name.to_owned()), None)
    }

    /// Attach a (possibly detached) element under `parent`: climb to the
    /// element's topmost ancestor and insert that whole subtree. Inserting
    /// where an equivalent element already exists merges the two. Attaching
    /// under the element's own descendant is rejected.
    pub fn attach(&mut self, parent: ElementId, elem: ElementId) -> Result<ElementId, TreeError> {
        let parent = self.leader_compress(parent);
        let mut top = self.leader_compress(elem);

        // Climb toward the root; a repeat here would mean the arena holds a
        // parent cycle, which construction is supposed to make impossible.
        let mut seen = HashSet::new();
        loop {
            assert!(seen.insert(top), "parent cycle detected while attaching");
            if top == parent {
                // Already rooted under the target.
                return Ok(self.leader(elem));
            }
            match self.nodes[top.0].parent {
                Some(p) => top = self.leader_compress(p),
                None => break,
            }
        }

        if self.nodes[top.0].kind == ElementKind::Root {
            return Err(TreeError::CannotAttachRoot);
        }
        self.ensure_not_method(parent)?;

        // The target parent must not lie inside the subtree being attached;
        // inserting there would close a parent cycle.
        let mut probe = parent;
        loop {
            if probe == top {
                return Err(TreeError::AttachCycle);
            }
            match self.nodes[probe.0].parent {
                Some(p) => probe = self.leader_compress(p),
                None => break,
            }
        }

        self.insert_child(parent, top)?;
        Ok(self.leader(elem))
    }

    /// Absorb another tree: its nodes are remapped into this arena and its
    /// root is merged into this root. Returns the id offset applied to the
    /// other tree's handles.
    pub fn absorb(&mut self, other: ElementTree) -> Result<usize, TreeError> {
        let offset = self.nodes.len();
        let delegation_offset = self.delegations.len();
        let other_root = other.root;

        for mut node in other.nodes {
            node.parent = node.parent.map(|p| ElementId(p.0 + offset));
            for child in node.paths.values_mut() {
                *child = ElementId(child.0 + offset);
            }
            for child in node.bindings.values_mut() {
                *child = ElementId(child.0 + offset);
            }
            for child in node.methods.values_mut() {
                *child = ElementId(child.0 + offset);
            }
            node.binding_order = None;
            node.delegation = node.delegation.map(|d| DelegationId(d.0 + delegation_offset));
            self.nodes.push(node);
        }
        for leader in other.leaders {
            self.leaders.push(leader + offset);
        }
        for entry in other.delegations {
            self.delegations.push(DelegationEntry {
                delegation: entry.delegation,
                element: ElementId(entry.element.0 + offset),
            });
        }

        let root = self.root;
        self.merge(root, ElementId(other_root.0 + offset))?;
        Ok(offset)
    }

    // ---- binding payload setters -------------------------------------------

    fn binding_mut(&mut self, id: ElementId) -> Result<ElementId, TreeError> {
        let id = self.leader_compress(id);
        if self.nodes[id.0].kind != ElementKind::Binding {
            return Err(TreeError::NotABinding);
        }
        Ok(id)
    }

    /// Set the binding's validator. Elements are write-once.
    pub fn set_validator(
        &mut self,
        id: ElementId,
        validator: Arc<Validator>,
    ) -> Result<(), TreeError> {
        let id = self.binding_mut(id)?;
        if self.nodes[id.0].validator.is_some() {
            return Err(TreeError::ValidatorAlreadySet);
        }
        self.nodes[id.0].validator = Some(validator);
        Ok(())
    }

    /// Set the binding's formatter for reverse routing. Write-once.
    pub fn set_formatter(
        &mut self,
        id: ElementId,
        formatter: Arc<FormatterFn>,
    ) -> Result<(), TreeError> {
        let id = self.binding_mut(id)?;
        if self.nodes[id.0].formatter.is_some() {
            return Err(TreeError::FormatterAlreadySet);
        }
        self.nodes[id.0].formatter = Some(formatter);
        Ok(())
    }

    /// Hint that this binding must be tried before the sibling named
    /// `other`. Hints naming absent siblings are inert.
    pub fn order_before(&mut self, id: ElementId, other: &str) -> Result<(), TreeError> {
        let id = self.binding_mut(id)?;
        self.nodes[id.0].before.insert(other.to_owned());
        self.invalidate_parent_order(id);
        Ok(())
    }

    /// Hint that this binding must be tried after the sibling named `other`.
    pub fn order_after(&mut self, id: ElementId, other: &str) -> Result<(), TreeError> {
        let id = self.binding_mut(id)?;
        self.nodes[id.0].after.insert(other.to_owned());
        self.invalidate_parent_order(id);
        Ok(())
    }

    fn invalidate_parent_order(&mut self, id: ElementId) {
        if let Some(parent) = self.nodes[id.0].parent {
            let parent = self.leader_compress(parent);
            self.nodes[parent.0].binding_order = None;
        }
    }

    // ---- controlled insertion ----------------------------------------------

    fn insert_child(&mut self, parent: ElementId, child: ElementId) -> Result<ElementId, TreeError> {
        match self.nodes[child.0].kind {
            ElementKind::Path => self.insert_path_child(parent, child),
            ElementKind::Binding => self.insert_binding_child(parent, child),
            ElementKind::Method => self.insert_method_child(parent, child),
            ElementKind::Root => Err(TreeError::CannotAttachRoot),
        }
    }

    fn insert_path_child(
        &mut self,
        parent: ElementId,
        child: ElementId,
    ) -> Result<ElementId, TreeError> {
        let key = self.nodes[child.0].segment().to_owned();
        self.nodes[child.0].parent = Some(parent);
        if let Some(&existing) = self.nodes[parent.0].paths.get(&key) {
            let existing = self.leader_compress(existing);
            if existing != child {
                self.merge(existing, child)?;
            }
            self.nodes[parent.0].paths.insert(key, existing);
            Ok(existing)
        } else {
            self.nodes[parent.0].paths.insert(key, child);
            Ok(child)
        }
    }

    fn insert_binding_child(
        &mut self,
        parent: ElementId,
        child: ElementId,
    ) -> Result<ElementId, TreeError> {
        let key = self.nodes[child.0].segment().to_owned();
        self.nodes[child.0].parent = Some(parent);
        self.nodes[parent.0].binding_order = None;
        if let Some(&existing) = self.nodes[parent.0].bindings.get(&key) {
            let existing = self.leader_compress(existing);
            if existing != child {
                self.merge(existing, child)?;
            }
            self.nodes[parent.0].bindings.insert(key, existing);
            Ok(existing)
        } else {
            self.nodes[parent.0].bindings.insert(key, child);
            Ok(child)
        }
    }

    fn insert_method_child(
        &mut self,
        parent: ElementId,
        child: ElementId,
    ) -> Result<ElementId, TreeError> {
        let key = match &self.nodes[child.0].ident {
            Ident::Verb(v) => v.clone(),
            _ => unreachable!("method child without a verb ident"),
        };
        self.nodes[child.0].parent = Some(parent);
        if let Some(&existing) = self.nodes[parent.0].methods.get(&key) {
            let existing = self.leader_compress(existing);
            if existing != child {
                self.merge(existing, child)?;
            }
            self.nodes[parent.0].methods.insert(key, existing);
            Ok(existing)
        } else {
            self.nodes[parent.0].methods.insert(key, child);
            Ok(child)
        }
    }

    // ---- merge ---------------------------------------------------------

    /// Unify two nodes discovered from separate construction paths. `from`
    /// is absorbed into `into`; afterwards every handle to `from` resolves
    /// to `into`. Idempotent, and a no-op when both already resolve to the
    /// same node.
    pub(crate) fn merge(&mut self, into: ElementId, from: ElementId) -> Result<(), TreeError> {
        let into = self.leader_compress(into);
        let from = self.leader_compress(from);
        if into == from {
            return Ok(());
        }

        // All precondition checks happen before any mutation at this level,
        // so a failed merge leaves both operands untouched.
        {
            let a = &self.nodes[into.0];
            let b = &self.nodes[from.0];
            if a.kind != b.kind {
                return Err(TreeError::TypeMismatch { left: a.kind, right: b.kind });
            }
            if a.ident != b.ident {
                return Err(TreeError::IdentMismatch {
                    left: a.ident.to_string(),
                    right: b.ident.to_string(),
                });
            }
            if let (Some(da), Some(db)) = (a.delegation, b.delegation) {
                if !Arc::ptr_eq(
                    &self.delegations[da.0].delegation,
                    &self.delegations[db.0].delegation,
                ) {
                    return Err(TreeError::ConflictingDelegation {
                        ident: a.ident.to_string(),
                    });
                }
            }
            if let (Some(ha), Some(hb)) = (&a.handler, &b.handler) {
                if !Arc::ptr_eq(ha, hb) {
                    return Err(TreeError::DuplicateMethod { verb: a.ident.to_string() });
                }
            }
            if let (Some(va), Some(vb)) = (&a.validator, &b.validator) {
                if !Arc::ptr_eq(va, vb) {
                    return Err(TreeError::ValidatorAlreadySet);
                }
            }
            if let (Some(fa), Some(fb)) = (&a.formatter, &b.formatter) {
                if !Arc::ptr_eq(fa, fb) {
                    return Err(TreeError::FormatterAlreadySet);
                }
            }
            match (a.parent, b.parent) {
                (Some(_), None) | (None, Some(_)) => {
                    return Err(TreeError::StructuralMismatch {
                        ident: a.ident.to_string(),
                    });
                }
                _ => {}
            }
        }

        // Reconcile parents first: merging them re-inserts both operands
        // into the surviving parent's maps, which usually merges the
        // operands themselves as a side effect.
        if let (Some(pa), Some(pb)) = (self.nodes[into.0].parent, self.nodes[from.0].parent) {
            let pa = self.leader_compress(pa);
            let pb = self.leader_compress(pb);
            if pa != pb {
                self.merge(pa, pb)?;
                let into = self.leader_compress(into);
                let from = self.leader_compress(from);
                return self.merge(into, from);
            }
        }

        debug!(
            ident = %self.nodes[into.0].ident,
            kind = %self.nodes[into.0].kind,
            "merging duplicate element"
        );

        // Detach everything from the absorbed node, then alias it.
        let absorbed = &mut self.nodes[from.0];
        let paths = std::mem::take(&mut absorbed.paths);
        let bindings = std::mem::take(&mut absorbed.bindings);
        let methods = std::mem::take(&mut absorbed.methods);
        let before = std::mem::take(&mut absorbed.before);
        let after = std::mem::take(&mut absorbed.after);
        let delegation = absorbed.delegation.take();
        let validator = absorbed.validator.take();
        let formatter = absorbed.formatter.take();
        let handler = absorbed.handler.take();
        absorbed.binding_order = None;
        absorbed.parent = None;
        self.leaders[from.0] = into.0;

        // Adopt the absorbed node's payload; the survivor keeps whichever
        // side is set (conflicts were rejected above).
        let survivor = &mut self.nodes[into.0];
        if survivor.delegation.is_none() {
            survivor.delegation = delegation;
        }
        if survivor.validator.is_none() {
            survivor.validator = validator;
        }
        if survivor.formatter.is_none() {
            survivor.formatter = formatter;
        }
        if survivor.handler.is_none() {
            survivor.handler = handler;
        }
        survivor.before.extend(before);
        survivor.after.extend(after);
        if survivor.kind == ElementKind::Binding {
            self.invalidate_parent_order(into);
        }

        // Re-insert the absorbed node's children, re-parenting them to the
        // survivor; key collisions recurse into further merges.
        for (_, child) in paths {
            let child = self.leader_compress(child);
            self.insert_path_child(into, child)?;
        }
        for (_, child) in bindings {
            let child = self.leader_compress(child);
            self.insert_binding_child(into, child)?;
        }
        for (_, child) in methods {
            let child = self.leader_compress(child);
            self.insert_method_child(into, child)?;
        }
        Ok(())
    }

    // ---- binding order resolver ----------------------------------------

    /// Compute (or fetch the memoized) try-order for the bindings under
    /// `node`: a topological order over the before/after constraints, with
    /// unconstrained siblings in ascending lexicographic ident order.
    pub fn binding_order(&self, node: ElementId) -> Result<Vec<ElementId>, TreeError> {
        let node = self.leader(node);
        if let Some(order) = &self.nodes[node.0].binding_order {
            return Ok(order.clone());
        }
        self.compute_binding_order(node)
    }

    fn compute_binding_order(&self, node: ElementId) -> Result<Vec<ElementId>, TreeError> {
        let siblings = &self.nodes[node.0].bindings;

        // successors[x] = idents that must be tried after x.
        let mut successors: BTreeMap<&str, BTreeSet<&str>> = siblings
            .keys()
            .map(|ident| (ident.as_str(), BTreeSet::new()))
            .collect();
        for (ident, &id) in siblings {
            let binding = &self.nodes[self.leader(id).0];
            for target in &binding.before {
                if siblings.contains_key(target) {
                    successors
                        .get_mut(ident.as_str())
                        .expect("ident is a sibling")
                        .insert(target.as_str());
                }
            }
            for target in &binding.after {
                if siblings.contains_key(target) {
                    successors
                        .get_mut(target.as_str())
                        .expect("target is a sibling")
                        .insert(ident.as_str());
                }
            }
        }

        // Post-order DFS over successor edges, roots and edges visited in
        // reverse lexicographic order; reversing the output respects every
        // constraint and leaves unconstrained siblings ascending.
        fn visit<'a>(
            ident: &'a str,
            successors: &BTreeMap<&'a str, BTreeSet<&'a str>>,
            state: &mut HashMap<&'a str, bool>, // false = active, true = done
            out: &mut Vec<&'a str>,
        ) -> bool {
            match state.get(ident) {
                Some(false) => return false, // cycle
                Some(true) => return true,
                None => {}
            }
            state.insert(ident, false);
            for &next in successors[ident].iter().rev() {
                if !visit(next, successors, state, out) {
                    return false;
                }
            }
            state.insert(ident, true);
            out.push(ident);
            true
        }

        let mut state = HashMap::new();
        let mut out = Vec::with_capacity(siblings.len());
        for ident in siblings.keys().rev() {
            if !visit(ident, &successors, &mut state, &mut out) {
                return Err(TreeError::BindingCycle {
                    ident: self.nodes[node.0].ident.to_string(),
                });
            }
        }
        out.reverse();
        Ok(out.iter().map(|ident| self.leader(siblings[*ident])).collect())
    }

    // ---- finalization ----------------------------------------------------

    /// Canonicalize every stored handle through the leader vector and
    /// resolve every node's binding order, so dispatch reads the tree
    /// without chasing aliases or recomputing orders.
    pub(crate) fn finalize(&mut self) -> Result<(), TreeError> {
        for index in 0..self.nodes.len() {
            if self.leaders[index] != index {
                continue;
            }
            let parent = self.nodes[index].parent.map(|p| self.leader(p));
            let paths: BTreeMap<String, ElementId> = self.nodes[index]
                .paths
                .iter()
                .map(|(k, v)| (k.clone(), self.leader(*v)))
                .collect();
            let bindings: BTreeMap<String, ElementId> = self.nodes[index]
                .bindings
                .iter()
                .map(|(k, v)| (k.clone(), self.leader(*v)))
                .collect();
            let methods: HashMap<Option<Method>, ElementId> = self.nodes[index]
                .methods
                .iter()
                .map(|(k, v)| (k.clone(), self.leader(*v)))
                .collect();
            let node = &mut self.nodes[index];
            node.parent = parent;
            node.paths = paths;
            node.bindings = bindings;
            node.methods = methods;
        }

        let elements: Vec<ElementId> = self
            .delegations
            .iter()
            .map(|entry| self.leader(entry.element))
            .collect();
        for (entry, element) in self.delegations.iter_mut().zip(elements) {
            entry.element = element;
        }

        for index in 0..self.nodes.len() {
            if self.leaders[index] != index || self.nodes[index].bindings.is_empty() {
                continue;
            }
            let order = self.compute_binding_order(ElementId(index))?;
            self.nodes[index].binding_order = Some(order);
        }
        Ok(())
    }
}

impl fmt::Debug for ElementTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let live = self
            .leaders
            .iter()
            .enumerate()
            .filter(|(i, l)| *i == **l)
            .count();
        f.debug_struct("ElementTree")
            .field("nodes_total", &self.nodes.len())
            .field("nodes_live", &live)
            .field("delegations", &self.delegations.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inject::{CallArgs, Callable, WantSignature};

    fn handler(tag: &'static str) -> Arc<Handler> {
        let sig = WantSignature::builder().arg("state").build();
        Arc::new(Callable::new(sig, move |_: CallArgs| Ok(Value::from(tag))))
    }

    fn idents(tree: &ElementTree, order: &[ElementId]) -> Vec<String> {
        order.iter().map(|id| tree.ident(*id).to_string()).collect()
    }

    #[test]
    fn repeated_add_path_converges() {
        let mut tree = ElementTree::new();
        let root = tree.root();
        let a = tree.add_path(root, "books").unwrap();
        let b = tree.add_path(root, "books").unwrap();
        assert_eq!(a, b);
        assert_eq!(tree.path_child(root, "books"), Some(a));
    }

    #[test]
    fn methods_are_leaves() {
        let mut tree = ElementTree::new();
        let root = tree.root();
        let m = tree
            .add_method(root, Some(Method::GET), handler("h"))
            .unwrap();
        assert!(matches!(
            tree.add_path(m, "x"),
            Err(TreeError::MethodIsLeaf)
        ));
        assert!(matches!(
            tree.add_binding(m, "x"),
            Err(TreeError::MethodIsLeaf)
        ));
        assert!(matches!(
            tree.add_method(m, Some(Method::PUT), handler("h2")),
            Err(TreeError::MethodIsLeaf)
        ));
    }

    #[test]
    fn same_verb_same_handler_converges_different_handler_errors() {
        let mut tree = ElementTree::new();
        let root = tree.root();
        let h = handler("h");
        let a = tree.add_method(root, Some(Method::GET), h.clone()).unwrap();
        let b = tree.add_method(root, Some(Method::GET), h).unwrap();
        assert_eq!(a, b);
        assert!(matches!(
            tree.add_method(root, Some(Method::GET), handler("other")),
            Err(TreeError::DuplicateMethod { .. })
        ));
    }

    #[test]
    fn merge_unions_disjoint_subtrees_and_reparents() {
        let mut tree = ElementTree::new();
        let root = tree.root();
        let first = tree.add_path(root, "api").unwrap();
        let left = tree.add_path(first, "books").unwrap();

        // Same segment built again from scratch with a different child.
        let second = tree.add_path(root, "api").unwrap();
        assert_eq!(first, second);
        let right = tree.add_path(second, "authors").unwrap();

        let api = tree.leader(first);
        assert_eq!(tree.path_child(api, "books"), Some(tree.leader(left)));
        assert_eq!(tree.path_child(api, "authors"), Some(tree.leader(right)));
        assert_eq!(tree.parent(left), Some(api));
        assert_eq!(tree.parent(right), Some(api));
    }

    #[test]
    fn absorb_merges_independent_trees() {
        let mut a = ElementTree::new();
        let a_api = a.add_path(a.root(), "api").unwrap();
        a.add_path(a_api, "books").unwrap();

        let mut b = ElementTree::new();
        let b_api = b.add_path(b.root(), "api").unwrap();
        let b_authors = b.add_path(b_api, "authors").unwrap();
        b.add_method(b_authors, Some(Method::GET), handler("authors"))
            .unwrap();

        a.absorb(b).unwrap();
        let api = a.path_child(a.root(), "api").unwrap();
        let books = a.path_child(api, "books").unwrap();
        let authors = a.path_child(api, "authors").unwrap();
        assert_eq!(a.parent(books), Some(api));
        assert_eq!(a.parent(authors), Some(api));
        assert!(a.has_methods(authors));
    }

    #[test]
    fn paths_and_bindings_share_an_ident_without_colliding() {
        // "x" the static segment and "x" the variable live in separate
        // child maps; dispatch prefers the static one.
        let mut tree = ElementTree::new();
        let root = tree.root();
        let path = tree.add_path(root, "x").unwrap();
        let binding = tree.add_binding(root, "x").unwrap();
        assert_ne!(tree.leader(path), tree.leader(binding));
        assert_eq!(tree.kind(path), ElementKind::Path);
        assert_eq!(tree.kind(binding), ElementKind::Binding);
    }

    #[test]
    fn merge_rejects_mismatched_operands_without_mutating() {
        let mut tree = ElementTree::new();
        let root = tree.root();
        let path = tree.add_path(root, "x").unwrap();
        let binding = tree.add_binding(root, "x").unwrap();
        let other = tree.add_path(root, "y").unwrap();
        let detached = tree.detached_path("x");

        assert!(matches!(
            tree.merge(path, binding),
            Err(TreeError::TypeMismatch { .. })
        ));
        assert!(matches!(
            tree.merge(path, other),
            Err(TreeError::IdentMismatch { .. })
        ));
        assert!(matches!(
            tree.merge(path, detached),
            Err(TreeError::StructuralMismatch { .. })
        ));

        // Every operand is still live and in place.
        assert_eq!(tree.path_child(root, "x"), Some(path));
        assert_eq!(tree.path_child(root, "y"), Some(other));
        assert_eq!(tree.leader(binding), binding);
        assert_eq!(tree.leader(detached), detached);
    }

    #[test]
    fn merge_conflicting_delegations_errors() {
        let spec_factory = |_: &Value| -> Result<(Arc<RouterSpec>, Value), BoxError> {
            unreachable!("never constructed in this test")
        };

        let mut a = ElementTree::new();
        let ax = a.add_path(a.root(), "x").unwrap();
        a.mount(ax, Delegation::new(spec_factory), &[]).unwrap();

        let mut b = ElementTree::new();
        let bx = b.add_path(b.root(), "x").unwrap();
        b.mount(bx, Delegation::new(spec_factory), &[]).unwrap();

        assert!(matches!(
            a.absorb(b),
            Err(TreeError::ConflictingDelegation { .. })
        ));
    }

    #[test]
    fn merge_keeps_the_nonnull_delegation() {
        let factory = |_: &Value| -> Result<(Arc<RouterSpec>, Value), BoxError> {
            unreachable!("never constructed in this test")
        };

        let mut a = ElementTree::new();
        a.add_path(a.root(), "x").unwrap();

        let mut b = ElementTree::new();
        let bx = b.add_path(b.root(), "x").unwrap();
        b.mount(bx, Delegation::new(factory), &[]).unwrap();

        a.absorb(b).unwrap();
        let x = a.path_child(a.root(), "x").unwrap();
        assert!(a.delegation_of(x).is_some());
    }

    #[test]
    fn mount_twice_errors_unless_same_delegation() {
        let factory = |_: &Value| -> Result<(Arc<RouterSpec>, Value), BoxError> {
            unreachable!("never constructed in this test")
        };
        let mut tree = ElementTree::new();
        let x = tree.add_path(tree.root(), "x").unwrap();
        let delegation = Delegation::new(factory);
        let id = tree.mount(x, delegation.clone(), &[]).unwrap();
        assert_eq!(tree.mount(x, delegation, &[]).unwrap(), id);
        assert!(matches!(
            tree.mount(x, Delegation::new(factory), &[]),
            Err(TreeError::DelegationAlreadySet)
        ));
    }

    #[test]
    fn verb_restricted_mount_installs_pointer_methods() {
        let factory = |_: &Value| -> Result<(Arc<RouterSpec>, Value), BoxError> {
            unreachable!("never constructed in this test")
        };
        let mut tree = ElementTree::new();
        let x = tree.add_path(tree.root(), "x").unwrap();
        let id = tree
            .mount(x, Delegation::new(factory), &[Method::GET, Method::PUT])
            .unwrap();

        assert!(tree.delegation_of(x).is_none());
        let get = tree.method_child(x, &Some(Method::GET)).unwrap();
        assert_eq!(tree.delegation_of(get), Some(id));
        assert!(tree.handler_of(get).is_none());
        assert!(tree.method_child(x, &Some(Method::POST)).is_none());
    }

    #[test]
    fn verb_restricted_mount_rejects_existing_verbs() {
        let factory = |_: &Value| -> Result<(Arc<RouterSpec>, Value), BoxError> {
            unreachable!("never constructed in this test")
        };
        let mut tree = ElementTree::new();
        let x = tree.add_path(tree.root(), "x").unwrap();
        tree.add_method(x, Some(Method::GET), handler("h")).unwrap();
        assert!(matches!(
            tree.mount(x, Delegation::new(factory), &[Method::GET]),
            Err(TreeError::DuplicateMethod { .. })
        ));
    }

    #[test]
    fn attach_climbs_to_the_topmost_ancestor() {
        let mut tree = ElementTree::new();
        let root = tree.root();
        let top = tree.detached_path("v1");
        let leaf = tree.add_path(top, "books").unwrap();

        let attached = tree.attach(root, leaf).unwrap();
        assert_eq!(attached, tree.leader(leaf));
        let v1 = tree.path_child(root, "v1").unwrap();
        assert_eq!(tree.path_child(v1, "books"), Some(tree.leader(leaf)));
    }

    #[test]
    fn attach_merges_on_collision() {
        let mut tree = ElementTree::new();
        let root = tree.root();
        let existing = tree.add_path(root, "v1").unwrap();
        tree.add_path(existing, "books").unwrap();

        let other = tree.detached_path("v1");
        tree.add_path(other, "authors").unwrap();
        tree.attach(root, other).unwrap();

        let v1 = tree.path_child(root, "v1").unwrap();
        assert!(tree.path_child(v1, "books").is_some());
        assert!(tree.path_child(v1, "authors").is_some());
    }

    #[test]
    fn attaching_an_element_under_itself_is_a_no_op() {
        let mut tree = ElementTree::new();
        let root = tree.root();
        assert_eq!(tree.attach(root, root).unwrap(), root);

        let x = tree.add_path(root, "x").unwrap();
        assert_eq!(tree.attach(x, x).unwrap(), x);
        assert_eq!(tree.parent(x), Some(root));
    }

    #[test]
    fn attach_root_below_another_element_is_rejected() {
        let mut tree = ElementTree::new();
        let root = tree.root();
        let x = tree.add_path(root, "x").unwrap();
        assert!(matches!(
            tree.attach(x, root),
            Err(TreeError::CannotAttachRoot)
        ));
    }

    #[test]
    fn attach_under_own_descendant_is_rejected() {
        let mut tree = ElementTree::new();
        let top = tree.detached_path("a");
        let child = tree.add_path(top, "b").unwrap();

        assert!(matches!(
            tree.attach(child, top),
            Err(TreeError::AttachCycle)
        ));

        // The subtree is untouched and still attaches where it belongs.
        assert_eq!(tree.parent(child), Some(top));
        assert!(tree.parent(top).is_none());
        tree.attach(tree.root(), child).unwrap();
        assert_eq!(tree.path_child(tree.root(), "a"), Some(tree.leader(top)));
    }

    #[test]
    fn merge_chain_repoints_stale_handles() {
        // Merge C into B after B was already absorbed into A: every handle
        // must resolve to the single surviving node.
        let mut tree = ElementTree::new();
        let root = tree.root();
        let a = tree.add_path(root, "seg").unwrap();
        let b_detached = tree.detached_path("seg");
        tree.attach(root, b_detached).unwrap();
        assert_eq!(tree.leader(b_detached), tree.leader(a));

        let c_detached = tree.detached_path("seg");
        let c_child = tree.add_path(c_detached, "deep").unwrap();
        tree.attach(root, c_detached).unwrap();

        let survivor = tree.leader(a);
        assert_eq!(tree.leader(b_detached), survivor);
        assert_eq!(tree.leader(c_detached), survivor);
        assert_eq!(tree.path_child(survivor, "deep"), Some(tree.leader(c_child)));
        assert_eq!(tree.parent(c_child), Some(survivor));
    }

    #[test]
    fn binding_order_defaults_to_ascending_lexicographic() {
        let mut tree = ElementTree::new();
        let root = tree.root();
        tree.add_binding(root, "zeta").unwrap();
        tree.add_binding(root, "alpha").unwrap();
        tree.add_binding(root, "mid").unwrap();

        let order = tree.binding_order(root).unwrap();
        assert_eq!(idents(&tree, &order), vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn binding_order_respects_before_and_after() {
        let mut tree = ElementTree::new();
        let root = tree.root();
        let z = tree.add_binding(root, "zeta").unwrap();
        tree.add_binding(root, "alpha").unwrap();
        let m = tree.add_binding(root, "mid").unwrap();

        // zeta before alpha; mid after zeta.
        tree.order_before(z, "alpha").unwrap();
        tree.order_after(m, "zeta").unwrap();

        let order = tree.binding_order(root).unwrap();
        let names = idents(&tree, &order);
        let pos = |n: &str| names.iter().position(|x| x == n).unwrap();
        assert!(pos("zeta") < pos("alpha"));
        assert!(pos("zeta") < pos("mid"));
    }

    #[test]
    fn binding_order_ignores_absent_siblings() {
        let mut tree = ElementTree::new();
        let root = tree.root();
        let a = tree.add_binding(root, "a").unwrap();
        tree.order_before(a, "not-there").unwrap();
        let order = tree.binding_order(root).unwrap();
        assert_eq!(idents(&tree, &order), vec!["a"]);
    }

    #[test]
    fn binding_order_cycle_is_an_error() {
        let mut tree = ElementTree::new();
        let root = tree.root();
        let a = tree.add_binding(root, "a").unwrap();
        let b = tree.add_binding(root, "b").unwrap();
        tree.order_before(a, "b").unwrap();
        tree.order_before(b, "a").unwrap();
        assert!(matches!(
            tree.binding_order(root),
            Err(TreeError::BindingCycle { .. })
        ));
    }

    #[test]
    fn binding_order_memo_invalidated_by_insertion() {
        let mut tree = ElementTree::new();
        let root = tree.root();
        tree.add_binding(root, "b").unwrap();
        tree.finalize().unwrap();
        assert_eq!(idents(&tree, tree.resolved_binding_order(root)), vec!["b"]);

        tree.add_binding(root, "a").unwrap();
        // Memo cleared; recompute sees both.
        let order = tree.binding_order(root).unwrap();
        assert_eq!(idents(&tree, &order), vec!["a", "b"]);
    }

    #[test]
    fn validator_and_formatter_are_write_once() {
        let sig = WantSignature::builder().arg("state").kw("value").build();
        let validator: Arc<Validator> = Arc::new(Callable::new(sig, |args: CallArgs| {
            Ok(crate::inject::Validation::Accept(
                args.get("value").cloned().expect("value is always supplied"),
            ))
        }));

        let mut tree = ElementTree::new();
        let b = tree.add_binding(tree.root(), "id").unwrap();
        tree.set_validator(b, validator.clone()).unwrap();
        assert!(matches!(
            tree.set_validator(b, validator),
            Err(TreeError::ValidatorAlreadySet)
        ));

        let fmt: Arc<FormatterFn> = Arc::new(|v: &Value| {
            Ok(v.display().unwrap_or_default())
        });
        tree.set_formatter(b, fmt.clone()).unwrap();
        assert!(matches!(
            tree.set_formatter(b, fmt),
            Err(TreeError::FormatterAlreadySet)
        ));
    }
}
