//! Error taxonomy.
//!
//! Construction-time errors ([`TreeError`]) indicate a mistake in the router
//! definition and are always fatal. Invocation errors ([`InjectError`]) are
//! fatal to a single call. Dispatch outcomes like "not found" are *not*
//! errors; they are reported as [`Dispatch`](crate::dispatch::Dispatch)
//! variants. Nothing in this crate retries: every failure is a deterministic
//! function of the tree shape and the request.

use thiserror::Error;

use crate::tree::ElementKind;

/// Failures bubbling out of user-supplied code (handlers, validators,
/// formatters, delegation factories, deferred producers).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors raised while building or merging the element tree.
#[derive(Debug, Error)]
pub enum TreeError {
    /// Two elements with different idents were asked to merge.
    #[error("cannot merge elements with different idents: \"{left}\" vs \"{right}\"")]
    IdentMismatch { left: String, right: String },

    /// Two elements of different kinds were asked to merge.
    #[error("cannot merge a {left} element with a {right} element")]
    TypeMismatch { left: ElementKind, right: ElementKind },

    /// Both merge operands carry a delegation and the delegations differ.
    #[error("conflicting delegations at \"{ident}\"")]
    ConflictingDelegation { ident: String },

    /// A rooted element cannot merge with an unrooted one.
    #[error("cannot merge a rooted \"{ident}\" element with an unrooted one")]
    StructuralMismatch { ident: String },

    /// The same verb was routed twice to different handlers.
    #[error("method element for \"{verb}\" already routed to a different handler")]
    DuplicateMethod { verb: String },

    /// A second, different delegation was mounted on one element.
    #[error("delegation has already been set")]
    DelegationAlreadySet,

    /// Method elements are leaves; they accept no path or binding children.
    #[error("cannot attach a child to a method element")]
    MethodIsLeaf,

    /// A root element cannot be attached below another element.
    #[error("cannot attach a root element below another element")]
    CannotAttachRoot,

    /// Attaching here would make the element an ancestor of itself.
    #[error("cannot attach an element under its own descendant")]
    AttachCycle,

    /// The binding's validator was set twice.
    #[error("validator has already been set")]
    ValidatorAlreadySet,

    /// The binding's formatter was set twice.
    #[error("formatter has already been set")]
    FormatterAlreadySet,

    /// The before/after ordering hints among sibling bindings form a cycle.
    #[error("circular before/after constraints among bindings under \"{ident}\"")]
    BindingCycle { ident: String },

    /// A binding-only operation was applied to a non-binding element.
    #[error("element is not a binding")]
    NotABinding,
}

/// Errors raised by the injection engine while invoking a callable.
#[derive(Debug, Error)]
pub enum InjectError {
    /// More positional arguments were supplied than the callable declares.
    #[error("too many positional arguments: got {got}, can handle at most {max}")]
    TooManyPositional { got: usize, max: usize },

    /// A required parameter was neither supplied positionally nor available.
    #[error("missing required keyword arguments: \"{}\"", .0.join("\", \""))]
    MissingRequired(Vec<String>),

    /// A deferred value producer failed.
    #[error("deferred producer failed")]
    Producer(#[source] BoxError),
}

/// Errors raised while dispatching one request.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Inject(#[from] InjectError),

    /// A binding validator failed (as opposed to declining with a skip).
    #[error("binding validator failed")]
    Validator(#[source] BoxError),

    /// The selected handler failed.
    #[error("handler failed")]
    Handler(#[source] BoxError),
}

/// Errors raised while reverse-routing a handler back into path segments.
#[derive(Debug, Error)]
pub enum ReverseError {
    /// No value was supplied for a binding on the path.
    #[error("missing value for binding \"{0}\"")]
    MissingValue(String),

    /// The binding has no formatter and the value is not a plain type.
    #[error("no formatter for binding \"{0}\" and its value has no obvious text form")]
    Unformattable(String),

    /// The binding's formatter failed.
    #[error("formatter for binding \"{0}\" failed")]
    Formatter(String, #[source] BoxError),

    /// No handler is registered under the given name.
    #[error("no handler registered under \"{0}\"")]
    UnknownHandler(String),

    /// An owning router instance along the mount chain has been dropped.
    #[error("owning router instance has been dropped")]
    DetachedInstance,
}
