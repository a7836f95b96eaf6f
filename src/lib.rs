//! # RouteTree
//!
//! RouteTree is a hierarchical URL router with ordered path bindings,
//! sub-router delegation, and signature-based dependency injection.
//!
//! Routes are a tree of elements rather than a list of patterns: static
//! *path* elements, variable *binding* elements, and leaf *method* elements
//! routing a verb to a handler. Trees built independently are reconciled
//! structurally, so two registrations of `/api/books` end up as one element
//! no matter where they came from.
//!
//! ## Features
//!
//! **Ordered bindings:** several bindings may compete for the same path
//! position. Each can carry a validator that accepts or declines a segment,
//! and `before`/`after` hints pin the order they are tried in; unconstrained
//! siblings are tried in name order, so the result is deterministic without
//! priority numbers.
//!
//! **Injection instead of extraction:** handlers declare the parameters they
//! want by name. The dispatcher publishes binding values into a per-request
//! [`Injector`] and each handler receives exactly the arguments its
//! signature asks for; values nothing asked for are never computed (see
//! [`Injector::set_deferred`]).
//!
//! **Sub-router delegation:** an element can hand its remaining path to
//! another router. Sub-routers are constructed eagerly when their owner is
//! constructed, so dispatch across mounts is lock-free, and reverse routing
//! walks back up through the mount chain to produce full outer paths.
//!
//! The router also **responds to OPTIONS requests automatically** and
//! reports *not implemented* (with the verbs that would have been accepted)
//! separately from *not found*; both behaviors can be disabled on the
//! builder.
//!
//! ## Usage
//!
//! ```rust
//! use routetree::{
//!     Callable, Dispatch, Injector, Method, Router, RouterBuilder, Value, WantSignature,
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! let mut builder = RouterBuilder::new();
//! let root = builder.root();
//!
//! // GET /<user_id>
//! let user = builder.add_binding(root, "user_id")?;
//! let signature = WantSignature::builder()
//!     .arg("state")
//!     .arg_default("user_id")
//!     .build();
//! builder.add_method(
//!     user,
//!     Some(Method::GET),
//!     Callable::named("get_user", signature, |args| {
//!         let id = args.get_str("user_id").unwrap_or("?");
//!         Ok(Value::from(format!("user {id}")))
//!     }),
//! )?;
//!
//! let spec = builder.finish()?;
//! let router = Router::new(spec, Value::new(()))?;
//!
//! let mut injector = Injector::new();
//! match router.dispatch("/42", Method::GET, &mut injector)? {
//!     Dispatch::Handled(value) => assert_eq!(value.as_str(), Some("user 42")),
//!     other => panic!("unexpected outcome: {other:?}"),
//! }
//!
//! // And back again.
//! let path = router.path_for_handler("get_user", &[("user_id", Value::from(42_i64))])?;
//! assert_eq!(path, "/42");
//! # Ok(())
//! # }
//! ```
//!
//! ## Dispatch outcomes
//!
//! Dispatching returns a [`Dispatch`]: a handler result, `NotFound`,
//! `NotImplemented` carrying the verbs that *are* routed, or an automatic
//! `Options` listing. Failures inside user-supplied code (handlers,
//! validators, delegation factories) surface as errors instead, so an
//! HTTP adapter can map outcomes and errors to status codes independently.

#![forbid(unsafe_code)]

pub mod dispatch;
pub mod error;
pub mod inject;
pub mod router;
pub mod tree;

pub use dispatch::{Dispatch, PathSegments};
pub use error::{BoxError, DispatchError, InjectError, ReverseError, TreeError};
pub use inject::{
    CallArgs, Callable, Handler, Injector, Validation, Validator, Value, WantSignature,
};
pub use router::{Router, RouterBuilder, RouterSpec};
pub use tree::{Delegation, DelegationId, ElementId, ElementKind, ElementTree, Ident};

pub use http::Method;
