//! Router construction and instances.
//!
//! A [`RouterBuilder`] accumulates the element tree and handler registry,
//! then freezes into an immutable [`RouterSpec`]. A [`Router`] is one live
//! instance of a spec: the spec plus per-instance state, with every mounted
//! sub-router constructed eagerly so dispatch never takes a lock.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock, Weak};

use http::Method;
use tracing::debug;

use crate::dispatch::{self, Dispatch, PathSegments};
use crate::error::{BoxError, DispatchError, ReverseError, TreeError};
use crate::inject::{Handler, Injector, Validator, Value};
use crate::tree::{
    Delegation, DelegationId, ElementId, ElementKind, ElementTree, FormatterFn,
};

/// Accumulates a router definition: tree shape, handlers, mounts, and the
/// automatic-response flags. Consumed by [`finish`](Self::finish).
pub struct RouterBuilder {
    tree: ElementTree,
    handlers: HashMap<String, ElementId>,
    handle_options: bool,
    handle_method_not_allowed: bool,
}

impl Default for RouterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RouterBuilder {
    pub fn new() -> Self {
        RouterBuilder {
            tree: ElementTree::new(),
            handlers: HashMap::new(),
            handle_options: true,
            handle_method_not_allowed: true,
        }
    }

    pub fn root(&self) -> ElementId {
        self.tree.root()
    }

    /// Answer OPTIONS requests automatically at elements with routed methods
    /// but no explicit OPTIONS method. Enabled by default.
    pub fn handle_options(&mut self, yes: bool) -> &mut Self {
        self.handle_options = yes;
        self
    }

    /// Report [`Dispatch::NotImplemented`] for unrouted verbs at elements
    /// that do route other verbs, instead of plain not-found. Enabled by
    /// default.
    pub fn handle_method_not_allowed(&mut self, yes: bool) -> &mut Self {
        self.handle_method_not_allowed = yes;
        self
    }

    /// Add a static path segment under `parent`.
    pub fn add_path(&mut self, parent: ElementId, segment: &str) -> Result<ElementId, TreeError> {
        self.tree.add_path(parent, segment)
    }

    /// Add a whole static path under the root, one element per segment,
    /// returning the leaf. `"/api/books"` is `add_path(root, "api")`
    /// followed by `add_path(api, "books")`.
    pub fn add_route(&mut self, path: &str) -> Result<ElementId, TreeError> {
        let mut node = self.tree.root();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            node = self.tree.add_path(node, segment)?;
        }
        Ok(node)
    }

    /// Add a variable segment under `parent`.
    pub fn add_binding(&mut self, parent: ElementId, name: &str) -> Result<ElementId, TreeError> {
        self.tree.add_binding(parent, name)
    }

    /// Route a verb (or the any-verb fallback, `None`) at `parent`. If the
    /// handler was built with [`Callable::named`](crate::inject::Callable::named),
    /// its name is registered for reverse routing.
    pub fn add_method(
        &mut self,
        parent: ElementId,
        verb: Option<Method>,
        handler: Handler,
    ) -> Result<ElementId, TreeError> {
        let name = handler.name().map(str::to_owned);
        let element = self.tree.add_method(parent, verb, Arc::new(handler))?;
        if let Some(name) = name {
            self.handlers.insert(name, element);
        }
        Ok(element)
    }

    /// Set the validator deciding whether `binding` accepts a segment.
    pub fn set_validator(
        &mut self,
        binding: ElementId,
        validator: Validator,
    ) -> Result<(), TreeError> {
        self.tree.set_validator(binding, Arc::new(validator))
    }

    /// Set the formatter turning a value back into a path segment when
    /// reverse-routing through `binding`.
    pub fn set_formatter(
        &mut self,
        binding: ElementId,
        formatter: impl Fn(&Value) -> Result<String, BoxError> + Send + Sync + 'static,
    ) -> Result<(), TreeError> {
        let formatter: Arc<FormatterFn> = Arc::new(formatter);
        self.tree.set_formatter(binding, formatter)
    }

    /// Require `binding` to be tried before its sibling named `other`.
    pub fn order_before(&mut self, binding: ElementId, other: &str) -> Result<(), TreeError> {
        self.tree.order_before(binding, other)
    }

    /// Require `binding` to be tried after its sibling named `other`.
    pub fn order_after(&mut self, binding: ElementId, other: &str) -> Result<(), TreeError> {
        self.tree.order_after(binding, other)
    }

    /// Mount a sub-router at `node`. With no verbs the element and
    /// everything below it delegates; with verbs, only requests arriving
    /// with one of those verbs delegate.
    pub fn mount(
        &mut self,
        node: ElementId,
        delegation: Arc<Delegation>,
        verbs: &[Method],
    ) -> Result<DelegationId, TreeError> {
        self.tree.mount(node, delegation, verbs)
    }

    /// Create a path element not yet attached anywhere.
    pub fn detached_path(&mut self, segment: &str) -> ElementId {
        self.tree.detached_path(segment)
    }

    /// Create a binding element not yet attached anywhere.
    pub fn detached_binding(&mut self, name: &str) -> ElementId {
        self.tree.detached_binding(name)
    }

    /// Attach an element (with its whole subtree) under `parent`, merging
    /// with any equivalent element already there.
    pub fn attach(&mut self, parent: ElementId, elem: ElementId) -> Result<ElementId, TreeError> {
        self.tree.attach(parent, elem)
    }

    /// Fold another builder's definition into this one. Trees merge from
    /// the roots down; the other builder's handler names come along, with
    /// this builder's registrations winning name collisions.
    pub fn absorb(&mut self, other: RouterBuilder) -> Result<(), TreeError> {
        let offset = self.tree.absorb(other.tree)?;
        for (name, element) in other.handlers {
            self.handlers
                .entry(name)
                .or_insert(ElementId(element.0 + offset));
        }
        Ok(())
    }

    /// Freeze the definition: canonicalize the tree, resolve every binding
    /// order (surfacing constraint cycles now rather than at dispatch), and
    /// produce the shareable spec.
    pub fn finish(mut self) -> Result<Arc<RouterSpec>, TreeError> {
        self.tree.finalize()?;
        let handlers = self
            .handlers
            .into_iter()
            .map(|(name, element)| (name, self.tree.leader(element)))
            .collect();
        Ok(Arc::new(RouterSpec {
            tree: self.tree,
            handlers,
            handle_options: self.handle_options,
            handle_method_not_allowed: self.handle_method_not_allowed,
        }))
    }
}

/// A frozen router definition. Immutable, cheap to share, and safe to
/// dispatch against from any number of threads; one spec may back any
/// number of [`Router`] instances.
pub struct RouterSpec {
    tree: ElementTree,
    handlers: HashMap<String, ElementId>,
    handle_options: bool,
    handle_method_not_allowed: bool,
}

impl RouterSpec {
    pub(crate) fn tree(&self) -> &ElementTree {
        &self.tree
    }

    /// The method element a named handler is routed at.
    pub fn handler_element(&self, name: &str) -> Option<ElementId> {
        self.handlers.get(name).copied()
    }

    pub(crate) fn handle_options(&self) -> bool {
        self.handle_options
    }

    pub(crate) fn handle_method_not_allowed(&self) -> bool {
        self.handle_method_not_allowed
    }
}

/// One live instance of a [`RouterSpec`]: the spec plus instance state.
///
/// Constructing an instance constructs every mounted sub-router (factories
/// run exactly once, here), so the whole instance graph is in place before
/// the first request and dispatch is lock-free. Sub-router instances keep a
/// weak link to their owner for reverse routing across mount boundaries.
pub struct Router {
    spec: Arc<RouterSpec>,
    state: Value,
    parent: Option<(Weak<Router>, ElementId)>,
    delegates: OnceLock<Vec<Arc<Router>>>,
}

impl Router {
    /// Construct an instance of `spec` around `state`. Fails if any mounted
    /// delegation factory fails.
    pub fn new(spec: Arc<RouterSpec>, state: Value) -> Result<Arc<Router>, BoxError> {
        Self::build(spec, state, None)
    }

    fn build(
        spec: Arc<RouterSpec>,
        state: Value,
        parent: Option<(Weak<Router>, ElementId)>,
    ) -> Result<Arc<Router>, BoxError> {
        let router = Arc::new(Router {
            spec: spec.clone(),
            state,
            parent,
            delegates: OnceLock::new(),
        });

        let mut delegates = Vec::with_capacity(spec.tree.delegations().len());
        for entry in spec.tree.delegations() {
            let (sub_spec, sub_state) = entry.delegation.construct(&router.state)?;
            let child = Router::build(
                sub_spec,
                sub_state,
                Some((Arc::downgrade(&router), entry.element)),
            )?;
            delegates.push(child);
        }
        if router.delegates.set(delegates).is_err() {
            unreachable!("delegates are set exactly once, at construction");
        }
        Ok(router)
    }

    pub fn spec(&self) -> &Arc<RouterSpec> {
        &self.spec
    }

    /// The instance state handed to every handler and validator as the
    /// first positional argument.
    pub fn state(&self) -> &Value {
        &self.state
    }

    /// The sub-router instance behind a mount.
    pub fn delegate(&self, id: DelegationId) -> &Arc<Router> {
        let delegates = self
            .delegates
            .get()
            .expect("delegates are populated at construction");
        &delegates[id.0]
    }

    /// Dispatch one request. Binding values discovered along the path are
    /// published into `injector` under their binding names; keys the caller
    /// seeded beforehand win.
    pub fn dispatch(
        &self,
        path: &str,
        verb: Method,
        injector: &mut Injector,
    ) -> Result<Dispatch, DispatchError> {
        debug!(path = %path, verb = %verb, "dispatching");
        let mut segments = PathSegments::parse(path);
        let outcome = dispatch::run(self, &mut segments, &verb, injector)?;
        debug!(outcome = ?outcome, "dispatched");
        Ok(outcome)
    }

    /// Reconstruct the path that reaches `element`, substituting `values`
    /// for the bindings along the way. Walks up through the owning router
    /// chain, so an element inside a mounted sub-router yields the full
    /// outer path.
    pub fn path_for(
        &self,
        element: ElementId,
        values: &[(&str, Value)],
    ) -> Result<String, ReverseError> {
        let mut segments = Vec::new();
        self.reverse_segments(element, values, &mut segments)?;
        segments.reverse();
        Ok(format!("/{}", segments.join("/")))
    }

    /// [`path_for`](Self::path_for) by registered handler name.
    pub fn path_for_handler(
        &self,
        name: &str,
        values: &[(&str, Value)],
    ) -> Result<String, ReverseError> {
        let element = self
            .spec
            .handler_element(name)
            .ok_or_else(|| ReverseError::UnknownHandler(name.to_owned()))?;
        self.path_for(element, values)
    }

    // Collects segments leaf-first; the caller reverses once at the end.
    fn reverse_segments(
        &self,
        element: ElementId,
        values: &[(&str, Value)],
        out: &mut Vec<String>,
    ) -> Result<(), ReverseError> {
        let tree = self.spec.tree();
        let mut current = Some(element);
        // A repeat here would mean the arena holds a parent cycle, which
        // construction rejects.
        let mut seen = HashSet::new();
        while let Some(node) = current {
            assert!(seen.insert(node), "parent cycle detected while reverse routing");
            match tree.kind(node) {
                ElementKind::Method => {}
                ElementKind::Path => out.push(tree.ident(node).to_string()),
                ElementKind::Binding => {
                    let name = tree.ident(node).to_string();
                    let value = values
                        .iter()
                        .find(|(key, _)| *key == name.as_str())
                        .map(|(_, value)| value)
                        .ok_or_else(|| ReverseError::MissingValue(name.clone()))?;
                    let text = match tree.formatter_of(node) {
                        Some(formatter) => formatter(value)
                            .map_err(|source| ReverseError::Formatter(name.clone(), source))?,
                        None => value
                            .display()
                            .ok_or_else(|| ReverseError::Unformattable(name.clone()))?,
                    };
                    out.push(text);
                }
                ElementKind::Root => {
                    if let Some((owner, mount)) = &self.parent {
                        let owner = owner.upgrade().ok_or(ReverseError::DetachedInstance)?;
                        return owner.reverse_segments(*mount, values, out);
                    }
                    return Ok(());
                }
            }
            current = tree.parent(node);
        }
        Ok(())
    }
}
