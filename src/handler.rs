//! Handler capability traits and the registries a filler is built from.
//!
//! A *handler factory* is registered under a storage `spec` (e.g. `"AD_TIFF"`).
//! Given a Resource it constructs a [`Handler`], which in turn resolves the
//! `datum_kwargs` of each Datum into a payload.
//!
//! ```text
//! HandlerRegistry["AD_TIFF"] --construct(locator, resource_kwargs)--> Handler
//! Handler --resolve(datum_kwargs)--> payload
//! ```
//!
//! Registries are plain values. A filler clones the registry it is given, so
//! several fillers can hold independent registries or share factories through
//! the same `Arc`.

use crate::document::{DataKey, Kwargs};
use crate::error::{EventModelError, ModelResult};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Failure reported by a handler or handler factory.
#[derive(Error, Debug)]
pub enum HandlerError {
    /// Storage I/O failed; the data may simply not be visible yet.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The backing storage reported the data as temporarily unavailable.
    #[error("Data unavailable: {0}")]
    Unavailable(String),

    /// The handler rejected the arguments or the data is unreadable.
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl HandlerError {
    /// Transient failures are retried by the filler.
    pub fn is_transient(&self) -> bool {
        matches!(self, HandlerError::Io(_) | HandlerError::Unavailable(_))
    }
}

/// An open reader for one Resource.
///
/// Only [`resolve`](Handler::resolve) is required. `file_list` and `close`
/// are optional capabilities with no-op defaults.
pub trait Handler: Send {
    /// Read one quantum of data.
    fn resolve(&mut self, datum_kwargs: &Kwargs) -> Result<Value, HandlerError>;

    /// Files backing the given datum, if the handler can tell.
    fn file_list(&self, _datum_kwargs: &[Kwargs]) -> Option<Vec<PathBuf>> {
        None
    }

    /// Release files or connections. Called once when the instance is dropped from the cache.
    fn close(&mut self) -> Result<(), HandlerError> {
        Ok(())
    }
}

/// Constructs handlers for one storage spec.
///
/// Implemented for any `Fn(&Path, &Kwargs) -> Result<Box<dyn Handler>, HandlerError>`.
pub trait HandlerFactory: Send + Sync {
    fn construct(
        &self,
        locator: &Path,
        resource_kwargs: &Kwargs,
    ) -> Result<Box<dyn Handler>, HandlerError>;
}

impl<F> HandlerFactory for F
where
    F: Fn(&Path, &Kwargs) -> Result<Box<dyn Handler>, HandlerError> + Send + Sync,
{
    fn construct(
        &self,
        locator: &Path,
        resource_kwargs: &Kwargs,
    ) -> Result<Box<dyn Handler>, HandlerError> {
        self(locator, resource_kwargs)
    }
}

/// Shared handle to a registered factory.
pub type SharedFactory = Arc<dyn HandlerFactory>;

/// Wrap a closure as a [`SharedFactory`].
pub fn factory_fn<F>(f: F) -> SharedFactory
where
    F: Fn(&Path, &Kwargs) -> Result<Box<dyn Handler>, HandlerError> + Send + Sync + 'static,
{
    Arc::new(f)
}

fn same_factory(a: &SharedFactory, b: &SharedFactory) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// Mapping from storage spec to handler factory.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    factories: HashMap<String, SharedFactory>,
}

impl HandlerRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `factory` under `spec`.
    ///
    /// Registering the same factory again is a no-op. A different factory
    /// for an existing spec fails with `DuplicateHandler`; use
    /// [`replace`](Self::replace) to overwrite.
    pub fn register(&mut self, spec: &str, factory: SharedFactory) -> ModelResult<()> {
        if let Some(existing) = self.factories.get(spec) {
            if same_factory(existing, &factory) {
                return Ok(());
            }
            return Err(EventModelError::DuplicateHandler(spec.to_string()));
        }
        self.factories.insert(spec.to_string(), factory);
        Ok(())
    }

    /// Register `factory` under `spec`, returning any factory it displaced.
    pub fn replace(&mut self, spec: &str, factory: SharedFactory) -> Option<SharedFactory> {
        self.factories.insert(spec.to_string(), factory)
    }

    /// Remove and return the factory registered for `spec`.
    pub fn deregister(&mut self, spec: &str) -> ModelResult<SharedFactory> {
        self.factories
            .remove(spec)
            .ok_or_else(|| EventModelError::HandlerNotRegistered(spec.to_string()))
    }

    /// The factory registered for `spec`.
    pub fn get(&self, spec: &str) -> Option<&SharedFactory> {
        self.factories.get(spec)
    }

    /// True if `spec` has a factory.
    pub fn contains(&self, spec: &str) -> bool {
        self.factories.contains_key(spec)
    }

    /// Registered spec names, in no particular order.
    pub fn specs(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Number of registered specs.
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut specs: Vec<&str> = self.specs().collect();
        specs.sort_unstable();
        f.debug_struct("HandlerRegistry").field("specs", &specs).finish()
    }
}

/// Prebuilt registries (e.g. from a discovery step) convert directly.
impl FromIterator<(String, SharedFactory)> for HandlerRegistry {
    fn from_iter<T: IntoIterator<Item = (String, SharedFactory)>>(iter: T) -> Self {
        Self {
            factories: iter.into_iter().collect(),
        }
    }
}

/// What a coercion knows about the payload it is transforming.
#[derive(Debug, Clone, Copy)]
pub struct CoercionContext<'a> {
    /// Field being filled
    pub key: &'a str,
    /// Declared schema of that field, if the descriptor is known
    pub data_key: Option<&'a DataKey>,
    /// Spec of the Resource the payload came from
    pub spec: &'a str,
}

/// Transform applied to every resolved payload before it is inserted.
pub type Coercion =
    Arc<dyn Fn(Value, &CoercionContext<'_>) -> Result<Value, HandlerError> + Send + Sync>;

/// Wrap a closure as a [`Coercion`].
pub fn coercion_fn<F>(f: F) -> Coercion
where
    F: Fn(Value, &CoercionContext<'_>) -> Result<Value, HandlerError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Named payload transforms. Starts with `as_is` and `force_array`.
#[derive(Clone)]
pub struct CoercionRegistry {
    coercions: HashMap<String, Coercion>,
}

impl CoercionRegistry {
    /// Name of the identity coercion.
    pub const AS_IS: &'static str = "as_is";
    /// Name of the coercion that guarantees an array payload.
    pub const FORCE_ARRAY: &'static str = "force_array";

    /// A registry holding the built-in coercions.
    pub fn new() -> Self {
        let mut coercions: HashMap<String, Coercion> = HashMap::new();
        coercions.insert(Self::AS_IS.to_string(), coercion_fn(|value, _| Ok(value)));
        coercions.insert(
            Self::FORCE_ARRAY.to_string(),
            coercion_fn(|value, _| {
                Ok(match value {
                    Value::Array(_) => value,
                    other => Value::Array(vec![other]),
                })
            }),
        );
        Self { coercions }
    }

    /// Register a coercion. Same-function re-registration is a no-op.
    pub fn register(&mut self, name: &str, coercion: Coercion, overwrite: bool) -> ModelResult<()> {
        if let Some(existing) = self.coercions.get(name) {
            let same = std::ptr::eq(
                Arc::as_ptr(existing) as *const (),
                Arc::as_ptr(&coercion) as *const (),
            );
            if same {
                return Ok(());
            }
            if !overwrite {
                return Err(EventModelError::DuplicateCoercion(name.to_string()));
            }
        }
        self.coercions.insert(name.to_string(), coercion);
        Ok(())
    }

    /// Look up a coercion by name.
    pub fn get(&self, name: &str) -> ModelResult<Coercion> {
        self.coercions
            .get(name)
            .cloned()
            .ok_or_else(|| EventModelError::UnknownCoercion(name.to_string()))
    }
}

impl Default for CoercionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CoercionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.coercions.keys().collect();
        names.sort_unstable();
        f.debug_struct("CoercionRegistry").field("names", &names).finish()
    }
}
