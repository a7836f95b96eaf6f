//! The dispatcher: walks one request's path segments down the element tree
//! and reports the outcome.
//!
//! Dispatch is a pure function of the frozen tree and the request. It holds
//! no locks and mutates nothing shared; any number of requests may dispatch
//! against the same router concurrently.

use std::collections::VecDeque;

use http::Method;
use tracing::trace;

use crate::error::DispatchError;
use crate::inject::{Injector, Validation, Value};
use crate::router::Router;
use crate::tree::{ElementId, ElementTree};

/// A request path split into its non-empty segments, consumed front to back
/// as the walk descends. Empty segments (leading, trailing, doubled slashes)
/// never reach the tree.
#[derive(Debug, Clone, Default)]
pub struct PathSegments {
    segments: VecDeque<String>,
}

impl PathSegments {
    pub fn parse(path: &str) -> Self {
        PathSegments {
            segments: path
                .split('/')
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
                .collect(),
        }
    }

    pub fn peek(&self) -> Option<&str> {
        self.segments.front().map(String::as_str)
    }

    pub fn pop(&mut self) -> Option<String> {
        self.segments.pop_front()
    }

    pub fn is_exhausted(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// The unconsumed remainder, re-joined. This is what a catch-all handler
    /// receives under the `path_info` key.
    pub fn remaining_path(&self) -> String {
        self.segments
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("/")
    }
}

/// What dispatching one request produced. "Not found" and "not implemented"
/// are ordinary outcomes here, not errors; [`DispatchError`] is reserved for
/// failures inside user-supplied code and the injection engine.
#[derive(Debug)]
pub enum Dispatch {
    /// A handler ran; this is its result value.
    Handled(Value),
    /// No element of the tree claims this path.
    NotFound,
    /// The path exists but no method is routed for this verb. `available`
    /// lists the verbs that would have been accepted.
    NotImplemented { verb: Method, available: Vec<Method> },
    /// An automatic OPTIONS response listing the verbs accepted here.
    Options(Vec<Method>),
}

/// Walk `segments` down `router`'s tree. Binding values discovered along the
/// way are published into the injector under the binding's ident (without
/// clobbering caller-seeded keys), so handlers and later validators can want
/// them by name.
pub(crate) fn run(
    router: &Router,
    segments: &mut PathSegments,
    verb: &Method,
    injector: &mut Injector,
) -> Result<Dispatch, DispatchError> {
    let tree = router.spec().tree();
    let mut node = tree.root();

    loop {
        let segment = match segments.peek() {
            Some(s) => s.to_owned(),
            None => return finish(router, node, verb, segments, injector),
        };

        if let Some(child) = tree.path_child(node, &segment) {
            trace!(segment = %segment, "matched path element");
            segments.pop();
            node = child;
            continue;
        }

        let mut advanced = false;
        for &binding in tree.resolved_binding_order(node) {
            let accepted = match tree.validator_of(binding) {
                Some(validator) => {
                    let outcome = injector
                        .invoke(
                            validator,
                            vec![router.state().clone()],
                            &[("value", Value::from(segment.as_str()))],
                        )?
                        .map_err(DispatchError::Validator)?;
                    match outcome {
                        Validation::Accept(value) => Some(value),
                        Validation::Skip => None,
                    }
                }
                // A binding without a validator accepts any segment verbatim.
                None => Some(Value::from(segment.as_str())),
            };
            if let Some(value) = accepted {
                let name = tree.ident(binding).to_string();
                trace!(segment = %segment, binding = %name, "binding accepted segment");
                injector.insert_if_absent(&name, value);
                segments.pop();
                node = binding;
                advanced = true;
                break;
            }
        }
        if advanced {
            continue;
        }

        // No path, no binding: this is the stop position. A mount or a
        // catch-all handler here may still claim the remainder.
        return finish(router, node, verb, segments, injector);
    }
}

/// Terminal step at `node`: pick a method for the verb, run its handler or
/// hand off through a delegation, or fall back to the automatic OPTIONS and
/// not-implemented responses.
fn finish(
    router: &Router,
    node: ElementId,
    verb: &Method,
    segments: &mut PathSegments,
    injector: &mut Injector,
) -> Result<Dispatch, DispatchError> {
    let spec = router.spec();
    let tree = spec.tree();

    // Exact verb, then HEAD falls back to GET, then the any-verb fallback.
    let picked = tree
        .method_child(node, &Some(verb.clone()))
        .or_else(|| {
            if *verb == Method::HEAD {
                tree.method_child(node, &Some(Method::GET))
            } else {
                None
            }
        })
        .or_else(|| tree.method_child(node, &None));

    let handler = picked.and_then(|method| tree.handler_of(method));
    let delegation = picked
        .and_then(|method| tree.delegation_of(method))
        .or_else(|| tree.delegation_of(node));

    // A handler runs only when the path is fully consumed, or when it
    // declares the well-known remainder parameter and takes what is left.
    if let Some(handler) = handler {
        if segments.is_exhausted() || handler.wants("path_info") {
            if handler.wants("path_info") {
                injector.insert_if_absent("path_info", Value::from(segments.remaining_path()));
            }
            let value = injector
                .invoke(handler, vec![router.state().clone()], &[])?
                .map_err(DispatchError::Handler)?;
            return Ok(Dispatch::Handled(value));
        }
    }

    if let Some(delegation) = delegation {
        trace!(verb = %verb, remaining = segments.len(), "delegating to sub-router");
        return run(router.delegate(delegation), segments, verb, injector);
    }

    if !segments.is_exhausted() || !tree.has_methods(node) {
        return Ok(Dispatch::NotFound);
    }

    let available = available_verbs(tree, node);
    if *verb == Method::OPTIONS && spec.handle_options() {
        return Ok(Dispatch::Options(available));
    }
    if spec.handle_method_not_allowed() {
        return Ok(Dispatch::NotImplemented { verb: verb.clone(), available });
    }
    Ok(Dispatch::NotFound)
}

/// Verbs the baseline any-verb fallback is assumed to cover when computing
/// an Allow-style listing.
const FALLBACK_VERBS: [Method; 6] = [
    Method::HEAD,
    Method::GET,
    Method::PUT,
    Method::POST,
    Method::DELETE,
    Method::OPTIONS,
];

/// The verbs a request to `node` would be accepted with: explicitly routed
/// verbs, the baseline set when an any-verb fallback exists, HEAD whenever
/// GET is served, and always OPTIONS. Sorted by name, deduplicated.
pub(crate) fn available_verbs(tree: &ElementTree, node: ElementId) -> Vec<Method> {
    let mut verbs = Vec::new();
    let mut has_fallback = false;
    for key in tree.method_verbs(node) {
        match key {
            Some(verb) => verbs.push(verb.clone()),
            None => has_fallback = true,
        }
    }
    if has_fallback {
        verbs.extend(FALLBACK_VERBS.iter().cloned());
    }
    if verbs.contains(&Method::GET) {
        verbs.push(Method::HEAD);
    }
    verbs.push(Method::OPTIONS);
    verbs.sort_by(|a, b| a.as_str().cmp(b.as_str()));
    verbs.dedup();
    verbs
}
