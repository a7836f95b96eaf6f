//! Dependency injection engine.
//!
//! A [`Callable`] pairs a function with a [`WantSignature`] describing which
//! parameters it accepts. The [`Injector`] is a request-scoped store of
//! named values (eager or deferred); [`Injector::invoke`] reconstructs the
//! argument list a callable wants from that store and calls it, passing only
//! the parameters it declares.
//!
//! Signatures are declared explicitly at construction and never change, so
//! the descriptor is computed exactly once per callable.

use std::any::Any;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::error::{BoxError, InjectError};

/// A cheap-to-clone dynamically typed value, keyed by parameter name when it
/// travels through an [`Injector`].
#[derive(Clone)]
pub struct Value(Arc<dyn Any + Send + Sync>);

impl Value {
    /// Wrap any sendable value.
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Value(Arc::new(value))
    }

    /// Borrow the payload as `T`, if it is one.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }

    /// Whether the payload is a `T`.
    pub fn is<T: Any>(&self) -> bool {
        self.0.is::<T>()
    }

    /// Borrow the payload as a string slice, if it holds one.
    pub fn as_str(&self) -> Option<&str> {
        if let Some(s) = self.downcast_ref::<String>() {
            Some(s)
        } else {
            self.downcast_ref::<&'static str>().copied()
        }
    }

    /// Best-effort text rendering, used by default binding formatting.
    /// Only plain payloads (strings, integers, bool) have a text form.
    pub fn display(&self) -> Option<String> {
        if let Some(s) = self.as_str() {
            return Some(s.to_owned());
        }
        macro_rules! try_display {
            ($($ty:ty),*) => {
                $(if let Some(v) = self.downcast_ref::<$ty>() {
                    return Some(v.to_string());
                })*
            };
        }
        try_display!(i64, u64, i32, u32, i16, u16, i8, u8, isize, usize, bool);
        None
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.display() {
            Some(text) => write!(f, "Value({text:?})"),
            None => f.write_str("Value(..)"),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::new(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::new(s)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::new(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::new(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::new(v)
    }
}

/// The signature of desired arguments for a callable: positional order,
/// required and optional name sets, and whether the callable accepts
/// arbitrary extra positional or keyword-style arguments.
#[derive(Clone, Debug)]
pub struct WantSignature {
    order: Vec<String>,
    required: BTreeSet<String>,
    optional: BTreeSet<String>,
    all_pos: bool,
    all_kw: bool,
}

impl WantSignature {
    pub fn builder() -> SignatureBuilder {
        SignatureBuilder::default()
    }

    /// Whether the callable wants `name`, as required or optional, or
    /// because it accepts arbitrary keyword-style arguments.
    pub fn wants(&self, name: &str) -> bool {
        self.all_kw || self.required.contains(name) || self.optional.contains(name)
    }

    /// Narrow an all-keywords signature: the given names become the
    /// explicit required/optional sets and the catch-all stops vacuuming
    /// every available key. Lets wrapper callables restrict what they
    /// forward.
    pub fn narrow(mut self, required: &[&str], optional: &[&str]) -> Self {
        for name in required {
            self.required.insert((*name).to_owned());
        }
        for name in optional {
            self.optional.insert((*name).to_owned());
        }
        self.all_kw = false;
        self
    }

    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn required(&self) -> &BTreeSet<String> {
        &self.required
    }

    pub fn optional(&self) -> &BTreeSet<String> {
        &self.optional
    }

    pub fn all_pos(&self) -> bool {
        self.all_pos
    }

    pub fn all_kw(&self) -> bool {
        self.all_kw
    }
}

/// Builder for [`WantSignature`]. Declaration order of positional-capable
/// parameters is significant.
#[derive(Default)]
pub struct SignatureBuilder {
    order: Vec<String>,
    required: BTreeSet<String>,
    optional: BTreeSet<String>,
    all_pos: bool,
    all_kw: bool,
}

impl SignatureBuilder {
    /// A required parameter that may be satisfied positionally or by name.
    pub fn arg(mut self, name: &str) -> Self {
        self.order.push(name.to_owned());
        self.required.insert(name.to_owned());
        self
    }

    /// A defaulted parameter that may be satisfied positionally or by name.
    pub fn arg_default(mut self, name: &str) -> Self {
        self.order.push(name.to_owned());
        self.optional.insert(name.to_owned());
        self
    }

    /// A required keyword-only parameter.
    pub fn kw(mut self, name: &str) -> Self {
        self.required.insert(name.to_owned());
        self
    }

    /// A defaulted keyword-only parameter.
    pub fn kw_default(mut self, name: &str) -> Self {
        self.optional.insert(name.to_owned());
        self
    }

    /// The callable accepts arbitrary extra positional arguments.
    pub fn all_pos(mut self) -> Self {
        self.all_pos = true;
        self
    }

    /// The callable accepts arbitrary extra keyword-style arguments.
    pub fn all_kw(mut self) -> Self {
        self.all_kw = true;
        self
    }

    /// Finish the signature.
    ///
    /// # Panics
    ///
    /// Panics if a parameter was declared both required and optional; that
    /// is a bug at the declaration site, not a runtime condition.
    pub fn build(self) -> WantSignature {
        assert!(
            self.required.is_disjoint(&self.optional),
            "parameter declared both required and optional"
        );
        WantSignature {
            order: self.order,
            required: self.required,
            optional: self.optional,
            all_pos: self.all_pos,
            all_kw: self.all_kw,
        }
    }
}

/// The reconstructed argument list a callable receives: the positional
/// values it was invoked with plus the keyword values the engine selected
/// for it.
#[derive(Debug, Default)]
pub struct CallArgs {
    positional: Vec<Value>,
    keywords: HashMap<String, Value>,
}

impl CallArgs {
    /// The `index`-th positional argument.
    pub fn pos(&self, index: usize) -> Option<&Value> {
        self.positional.get(index)
    }

    /// The keyword argument named `name`.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.keywords.get(name)
    }

    /// The keyword argument named `name`, as a string slice.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.keywords.contains_key(name)
    }

    pub fn keywords(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.keywords.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// A function paired with its [`WantSignature`]. The signature is fixed at
/// construction; there is no runtime reflection anywhere.
pub struct Callable<T> {
    name: Option<String>,
    signature: WantSignature,
    func: Box<dyn Fn(CallArgs) -> T + Send + Sync>,
}

impl<T> Callable<T> {
    pub fn new(
        signature: WantSignature,
        func: impl Fn(CallArgs) -> T + Send + Sync + 'static,
    ) -> Self {
        Callable { name: None, signature, func: Box::new(func) }
    }

    /// A callable registered under a name, usable for reverse routing via
    /// [`Router::path_for_handler`](crate::router::Router::path_for_handler).
    pub fn named(
        name: &str,
        signature: WantSignature,
        func: impl Fn(CallArgs) -> T + Send + Sync + 'static,
    ) -> Self {
        Callable { name: Some(name.to_owned()), signature, func: Box::new(func) }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn signature(&self) -> &WantSignature {
        &self.signature
    }

    /// Whether this callable wants the parameter `name`.
    pub fn wants(&self, name: &str) -> bool {
        self.signature.wants(name)
    }
}

impl<T> fmt::Debug for Callable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callable")
            .field("name", &self.name)
            .field("signature", &self.signature)
            .finish_non_exhaustive()
    }
}

/// The outcome of a binding validator: accept the segment with a (possibly
/// transformed) value, or decline so the next candidate binding is tried.
#[derive(Debug)]
pub enum Validation {
    Accept(Value),
    Skip,
}

/// A route handler: receives its reconstructed arguments and produces the
/// dispatch result value.
pub type Handler = Callable<Result<Value, BoxError>>;

/// A binding validator, invoked with the raw segment under the `value` key.
pub type Validator = Callable<Result<Validation, BoxError>>;

type DeferredFn = Box<dyn FnOnce(&mut Injector) -> Result<Value, BoxError> + Send>;

/// A request-scoped store of named values feeding dependency injection.
///
/// Values may be supplied eagerly with [`insert`](Injector::insert) or as
/// deferred producers with [`set_deferred`](Injector::set_deferred);
/// producers run at most once, on first lookup, and their result is
/// memoized. One injector belongs to exactly one request and is never
/// shared across requests.
#[derive(Default)]
pub struct Injector {
    available: HashMap<String, Value>,
    deferred: HashMap<String, DeferredFn>,
}

impl Injector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a value, masking any deferred producer under the same key.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.available.insert(key.into(), value);
    }

    /// Set a value only if the key is not already present, so caller-supplied
    /// overrides win over values discovered during dispatch.
    pub fn insert_if_absent(&mut self, key: &str, value: Value) {
        if !self.contains(key) {
            self.insert(key, value);
        }
    }

    /// Register a producer that is run at most once, when (and if) some
    /// callable actually wants the key. The producer may itself look other
    /// keys up through the injector it is handed.
    pub fn set_deferred(
        &mut self,
        key: impl Into<String>,
        producer: impl FnOnce(&mut Injector) -> Result<Value, BoxError> + Send + 'static,
    ) {
        self.deferred.insert(key.into(), Box::new(producer));
    }

    pub fn contains(&self, key: &str) -> bool {
        self.available.contains_key(key) || self.deferred.contains_key(key)
    }

    /// Look a key up, running and memoizing its deferred producer if the
    /// value has not been materialized yet.
    pub fn get(&mut self, key: &str) -> Result<Option<Value>, InjectError> {
        if let Some(value) = self.available.get(key) {
            return Ok(Some(value.clone()));
        }
        if let Some(producer) = self.deferred.remove(key) {
            let value = producer(self).map_err(InjectError::Producer)?;
            self.available.insert(key.to_owned(), value.clone());
            return Ok(Some(value));
        }
        Ok(None)
    }

    /// Remove a key (both its value and any pending producer). Returns
    /// whether the key was present.
    pub fn remove(&mut self, key: &str) -> bool {
        let had_value = self.available.remove(key).is_some();
        let had_deferred = self.deferred.remove(key).is_some();
        had_value || had_deferred
    }

    /// Every key currently known, materialized or deferred.
    pub fn keys(&self) -> BTreeSet<&str> {
        self.available
            .keys()
            .map(String::as_str)
            .chain(self.deferred.keys().map(String::as_str))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.keys().len()
    }

    pub fn is_empty(&self) -> bool {
        self.available.is_empty() && self.deferred.is_empty()
    }

    /// Run `f`, then delete every key it added. This is the per-request
    /// cleanup boundary: it breaks reference cycles established between
    /// injected values and the injector during dispatch.
    pub fn scoped<R>(&mut self, f: impl FnOnce(&mut Injector) -> R) -> R {
        let keep: HashSet<String> = self.keys().iter().map(|k| (*k).to_owned()).collect();
        let result = f(self);
        let added: Vec<String> = self
            .keys()
            .iter()
            .filter(|k| !keep.contains(**k))
            .map(|k| (*k).to_owned())
            .collect();
        for key in added {
            self.remove(&key);
        }
        result
    }

    /// Invoke a callable with the given positional arguments, selecting the
    /// keyword arguments it wants from `overrides` first and this injector
    /// second. Names present in neither are simply not passed; absent
    /// *required* names are an error.
    pub fn invoke<T>(
        &mut self,
        callable: &Callable<T>,
        positional: Vec<Value>,
        overrides: &[(&str, Value)],
    ) -> Result<T, InjectError> {
        let sig = &callable.signature;

        if !sig.all_pos && positional.len() > sig.order.len() {
            return Err(InjectError::TooManyPositional {
                got: positional.len(),
                max: sig.order.len(),
            });
        }

        let satisfied: HashSet<&str> = sig
            .order
            .iter()
            .take(positional.len())
            .map(String::as_str)
            .collect();

        let mut desired: BTreeSet<String> =
            sig.required.union(&sig.optional).cloned().collect();
        if sig.all_kw {
            for (key, _) in overrides {
                desired.insert((*key).to_owned());
            }
            for key in self.keys() {
                desired.insert(key.to_owned());
            }
        }

        let mut keywords = HashMap::new();
        for name in &desired {
            if satisfied.contains(name.as_str()) {
                continue;
            }
            if let Some((_, value)) = overrides.iter().find(|(key, _)| *key == name.as_str()) {
                keywords.insert(name.clone(), value.clone());
            } else if let Some(value) = self.get(name)? {
                keywords.insert(name.clone(), value);
            }
        }

        let missing: Vec<String> = sig
            .required
            .iter()
            .filter(|name| {
                !keywords.contains_key(*name) && !satisfied.contains(name.as_str())
            })
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(InjectError::MissingRequired(missing));
        }

        Ok((callable.func)(CallArgs { positional, keywords }))
    }
}

impl fmt::Debug for Injector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Injector")
            .field("available", &self.available.len())
            .field("deferred", &self.deferred.len())
            .finish()
    }
}
