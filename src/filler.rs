//! The filler: resolve placeholders in events into externally stored data.
//!
//! A [`Filler`] is fed Descriptor, Resource and Datum documents as they
//! arrive and caches them. When an Event (or EventPage) comes through, every
//! field whose `filled` entry is `false` holds a datum id. The filler follows
//! it to the Datum, then to the Resource, picks the handler factory
//! registered for the Resource's `spec`, and reads the payload:
//!
//! ```text
//! event.data[key] ──datum_id──> Datum ──resource──> Resource ──spec──> HandlerFactory
//!                                  │                     │
//!                           datum_kwargs          root/resource_path
//!                                  └──> Handler::resolve ──> coercion ──> event.data[key]
//! ```
//!
//! Handlers are cached per Resource in a [`HandlerPool`], which may be shared
//! with other fillers. Handler construction and invocation go through
//! [`attempt_with_retries`] because storage can lag behind the documents.
//!
//! Filling is idempotent: fields whose `filled` entry already names a datum
//! are left alone. In [`FillMode::Validate`] the filler performs every lookup
//! but never constructs a handler or touches `data`.
//!
//! Closing a filler (explicitly or by dropping it) releases its hold on
//! every handler it used.

use crate::cache::{shared_handler, HandlerPool, SharedHandler, SharedHandlerPool};
use crate::config::FillerConfig;
use crate::document::{Datum, DatumPage, Descriptor, Event, EventPage, Filled, Resource};
use crate::error::{EventModelError, ModelResult};
use crate::handler::{
    coercion_fn, Coercion, CoercionContext, CoercionRegistry, HandlerRegistry, SharedFactory,
};
use crate::page::{column_pending, pack_event_page, unpack_datum_page, unpack_event_page};
use crate::retry::{attempt_with_retries, RetryPolicy};
use crate::router::{DocumentRouter, Routed};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};

/// Whether the filler reads data or only checks that it could.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FillMode {
    /// Resolve placeholders and write payloads into `data`.
    #[default]
    Fill,
    /// Check datum, resource and spec lookups without reading anything.
    Validate,
}

/// Outcome of looking up one placeholder.
enum Resolution {
    Payload(Value),
    Fillable,
    Pending,
}

/// Resolves external references in events. See the module docs.
pub struct Filler {
    handlers: HandlerRegistry,
    coercion_name: String,
    coercion: Coercion,
    pool: SharedHandlerPool,
    held: HashSet<String>,
    descriptors: HashMap<String, Descriptor>,
    resources: HashMap<String, Resource>,
    datum: HashMap<String, Datum>,
    root_map: HashMap<String, String>,
    retry: RetryPolicy,
    include: Option<HashSet<String>>,
    exclude: HashSet<String>,
    fail_fast: bool,
    mode: FillMode,
    closed: bool,
}

impl Filler {
    /// A filler with an unbounded private handler cache and default retry policy.
    pub fn new(handlers: HandlerRegistry) -> Self {
        let coercion_name = CoercionRegistry::AS_IS.to_string();
        let coercion = coercion_fn(|value, _| Ok(value));
        Self {
            handlers,
            coercion_name,
            coercion,
            pool: HandlerPool::unbounded().shared(),
            held: HashSet::new(),
            descriptors: HashMap::new(),
            resources: HashMap::new(),
            datum: HashMap::new(),
            root_map: HashMap::new(),
            retry: RetryPolicy::default(),
            include: None,
            exclude: HashSet::new(),
            fail_fast: true,
            mode: FillMode::Fill,
            closed: false,
        }
    }

    /// Build a filler from configuration.
    ///
    /// `pool` is used when given (to share handlers between fillers);
    /// otherwise a private pool sized by `handler_cache_capacity` is created.
    /// The configuration is validated first, so hand-built values are held
    /// to the same rules as loaded ones.
    pub fn from_config(
        handlers: HandlerRegistry,
        coercions: &CoercionRegistry,
        config: &FillerConfig,
        pool: Option<SharedHandlerPool>,
    ) -> ModelResult<Self> {
        config.validate()?;
        let pool = pool.unwrap_or_else(|| config.handler_pool().shared());
        Ok(Self::new(handlers)
            .with_coercion(coercions, &config.coerce)?
            .with_pool(pool)
            .with_retry(config.retry_policy())
            .with_root_map(config.root_map.clone())
            .fail_fast(config.fail_fast))
    }

    /// Use `pool` for handler instances instead of the private one.
    pub fn with_pool(mut self, pool: SharedHandlerPool) -> Self {
        self.pool = pool;
        self
    }

    /// Retry budget for handler construction and `resolve` calls.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Remap recorded Resource roots (e.g. after data was moved).
    pub fn with_root_map(mut self, root_map: HashMap<String, String>) -> Self {
        self.root_map = root_map;
        self
    }

    /// Select the coercion applied to every payload.
    pub fn with_coercion(mut self, coercions: &CoercionRegistry, name: &str) -> ModelResult<Self> {
        self.coercion = coercions.get(name)?;
        self.coercion_name = name.to_string();
        Ok(self)
    }

    /// Only fill these fields.
    pub fn include<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.include = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    /// Never fill these fields.
    pub fn exclude<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude = fields.into_iter().map(Into::into).collect();
        self
    }

    /// When false, unresolvable fields are left pending instead of failing the document.
    pub fn fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    /// Switch to [`FillMode::Validate`].
    pub fn validate_only(mut self) -> Self {
        self.mode = FillMode::Validate;
        self
    }

    /// Whether this filler loads data or only checks references.
    pub fn mode(&self) -> FillMode {
        self.mode
    }

    /// Registered handler factories.
    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    /// The handler pool, possibly shared with other fillers.
    pub fn pool(&self) -> &SharedHandlerPool {
        &self.pool
    }

    /// Retry budget in effect.
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// True once [`Filler::close`] has run.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Register a handler factory for `spec`.
    ///
    /// With `overwrite`, an existing factory is replaced and any handler it
    /// built is dropped from the cache.
    pub fn register_handler(
        &mut self,
        spec: &str,
        factory: SharedFactory,
        overwrite: bool,
    ) -> ModelResult<()> {
        if overwrite {
            if self.handlers.replace(spec, factory).is_some() {
                self.discard_handlers_for(spec);
            }
            return Ok(());
        }
        self.handlers.register(spec, factory)
    }

    /// Remove the factory for `spec` and drop any handler it built.
    pub fn deregister_handler(&mut self, spec: &str) -> ModelResult<SharedFactory> {
        let factory = self.handlers.deregister(spec)?;
        self.discard_handlers_for(spec);
        Ok(factory)
    }

    fn discard_handlers_for(&mut self, spec: &str) {
        let mut pool = self.pool.lock();
        for resource in self.resources.values().filter(|r| r.spec == spec) {
            pool.discard(&resource.uid);
        }
    }

    /// Remember a Descriptor so its external fields can be found.
    pub fn add_descriptor(&mut self, doc: &Descriptor) -> ModelResult<()> {
        self.ensure_open()?;
        self.descriptors.insert(doc.uid.clone(), doc.clone());
        Ok(())
    }

    /// Remember a Resource. The handler is only built when first needed.
    pub fn add_resource(&mut self, doc: &Resource) -> ModelResult<()> {
        self.ensure_open()?;
        self.resources.insert(doc.uid.clone(), doc.clone());
        Ok(())
    }

    /// Remember a Datum for later resolution.
    pub fn add_datum(&mut self, doc: &Datum) -> ModelResult<()> {
        self.ensure_open()?;
        self.datum.insert(doc.datum_id.clone(), doc.clone());
        Ok(())
    }

    /// Remember every Datum of a page.
    pub fn add_datum_page(&mut self, doc: &DatumPage) -> ModelResult<()> {
        self.ensure_open()?;
        for datum in unpack_datum_page(doc) {
            self.datum.insert(datum.datum_id.clone(), datum);
        }
        Ok(())
    }

    /// Return a filled copy of `event`.
    pub fn fill_event(&mut self, event: &Event) -> ModelResult<Event> {
        let mut filled = event.clone();
        self.fill_event_in_place(&mut filled)?;
        Ok(filled)
    }

    /// Fill `event` in place.
    ///
    /// On error, fields resolved before the failure stay filled.
    pub fn fill_event_in_place(&mut self, event: &mut Event) -> ModelResult<()> {
        self.ensure_open()?;
        let descriptor = self.descriptors.get(&event.descriptor).cloned().ok_or_else(|| {
            EventModelError::UnresolvableForeignKey {
                key: event.descriptor.clone(),
                message: format!(
                    "Event with uid {} refers to unknown Descriptor {}",
                    event.uid, event.descriptor
                ),
            }
        })?;

        for key in self.needs_filling(event, &descriptor) {
            let placeholder = event.data.get(&key).ok_or_else(|| {
                EventModelError::MismatchedDataKeys(format!(
                    "event {} marks '{key}' as unfilled but has no such data field",
                    event.uid
                ))
            })?;
            let datum_id = placeholder
                .as_str()
                .ok_or_else(|| {
                    EventModelError::InvalidDocument(format!(
                        "event {} field '{key}' should hold a datum id, found {placeholder}",
                        event.uid
                    ))
                })?
                .to_string();

            match self.resolve(&datum_id, &key, &descriptor)? {
                Resolution::Payload(payload) => {
                    event.data.insert(key.clone(), payload);
                    event.filled.insert(key, Filled::Datum(datum_id));
                }
                Resolution::Fillable => {}
                Resolution::Pending => {
                    event.filled.entry(key).or_insert(Filled::Flag(false));
                }
            }
        }
        Ok(())
    }

    /// Return a filled copy of `page`.
    pub fn fill_event_page(&mut self, page: &EventPage) -> ModelResult<EventPage> {
        let mut events: Vec<Event> = unpack_event_page(page).collect();
        for event in &mut events {
            self.fill_event_in_place(event)?;
        }
        pack_event_page(&events)
    }

    /// Fill `page` in place.
    pub fn fill_event_page_in_place(&mut self, page: &mut EventPage) -> ModelResult<()> {
        let filled = self.fill_event_page(page)?;
        page.data = filled.data;
        page.filled = filled.filled;
        Ok(())
    }

    /// Files backing one datum, if its handler can list them.
    pub fn file_list(&mut self, datum_id: &str) -> ModelResult<Option<Vec<PathBuf>>> {
        self.ensure_open()?;
        let datum = self.lookup_datum(datum_id)?.clone();
        let resource = self.lookup_resource(&datum)?.clone();
        let factory = self.lookup_factory(&resource)?;
        let handler = self.handler_for(&resource, &factory)?;
        let files = handler.lock().file_list(std::slice::from_ref(&datum.datum_kwargs));
        Ok(files)
    }

    /// Release this filler's hold on every handler it used.
    pub fn clear_handler_cache(&mut self) {
        let mut pool = self.pool.lock();
        for uid in self.held.drain() {
            pool.release(&uid);
        }
    }

    /// Forget all cached Descriptor, Resource and Datum documents.
    pub fn clear_document_caches(&mut self) {
        self.descriptors.clear();
        self.resources.clear();
        self.datum.clear();
    }

    /// Release handlers and caches. Further use fails with `FillerClosed`.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.clear_handler_cache();
        self.clear_document_caches();
        self.closed = true;
        tracing::info!(coercion = %self.coercion_name, "Filler closed");
    }

    fn ensure_open(&self) -> ModelResult<()> {
        if self.closed {
            return Err(EventModelError::FillerClosed);
        }
        Ok(())
    }

    fn needs_filling(&self, event: &Event, descriptor: &Descriptor) -> Vec<String> {
        let pending: Vec<String> = if event.filled.is_empty() {
            // No fill state recorded: every external field present in data is pending.
            descriptor
                .external_keys()
                .filter(|key| event.data.contains_key(*key))
                .map(str::to_string)
                .collect()
        } else {
            event
                .filled
                .iter()
                .filter(|(_, state)| state.is_pending())
                .map(|(key, _)| key.clone())
                .collect()
        };
        pending
            .into_iter()
            .filter(|key| !self.exclude.contains(key))
            .filter(|key| self.include.as_ref().map_or(true, |inc| inc.contains(key)))
            .collect()
    }

    fn resolve(
        &mut self,
        datum_id: &str,
        key: &str,
        descriptor: &Descriptor,
    ) -> ModelResult<Resolution> {
        let datum = match self.lookup_datum(datum_id) {
            Ok(datum) => datum.clone(),
            Err(e) => return self.pending(key, e),
        };
        let resource = match self.lookup_resource(&datum) {
            Ok(resource) => resource.clone(),
            Err(e) => return self.pending(key, e),
        };
        let factory = match self.lookup_factory(&resource) {
            Ok(factory) => factory,
            Err(e) => return self.pending(key, e),
        };
        if self.mode == FillMode::Validate {
            return Ok(Resolution::Fillable);
        }

        let handler = self.handler_for(&resource, &factory)?;
        let payload = attempt_with_retries(&self.retry, "resolve datum", || {
            handler.lock().resolve(&datum.datum_kwargs)
        })
        .map_err(|e| EventModelError::DataNotAccessible {
            datum_id: datum_id.to_string(),
            resource: resource.uid.clone(),
            attempts: e.attempts,
            source: e.source,
        })?;

        let ctx = CoercionContext {
            key,
            data_key: descriptor.data_keys.get(key),
            spec: &resource.spec,
        };
        let payload =
            (self.coercion)(payload, &ctx).map_err(|source| EventModelError::DataNotAccessible {
                datum_id: datum_id.to_string(),
                resource: resource.uid.clone(),
                attempts: 1,
                source,
            })?;
        Ok(Resolution::Payload(payload))
    }

    fn pending(&self, key: &str, error: EventModelError) -> ModelResult<Resolution> {
        if self.fail_fast {
            return Err(error);
        }
        tracing::warn!(field = key, error = %error, "Leaving field unfilled");
        Ok(Resolution::Pending)
    }

    fn lookup_datum(&self, datum_id: &str) -> ModelResult<&Datum> {
        self.datum
            .get(datum_id)
            .ok_or_else(|| EventModelError::UnresolvableForeignKey {
                key: datum_id.to_string(),
                message: format!("refers to unknown Datum {datum_id}"),
            })
    }

    fn lookup_resource(&self, datum: &Datum) -> ModelResult<&Resource> {
        self.resources
            .get(&datum.resource)
            .ok_or_else(|| EventModelError::UnresolvableForeignKey {
                key: datum.datum_id.clone(),
                message: format!(
                    "Datum {} refers to unknown Resource {}",
                    datum.datum_id, datum.resource
                ),
            })
    }

    fn lookup_factory(&self, resource: &Resource) -> ModelResult<SharedFactory> {
        self.handlers.get(&resource.spec).cloned().ok_or_else(|| {
            EventModelError::UndefinedAssetSpecification {
                spec: resource.spec.clone(),
                resource: resource.uid.clone(),
            }
        })
    }

    /// Where the handler for `resource` should read from, after root_map.
    pub fn locator(&self, resource: &Resource) -> PathBuf {
        let root = self
            .root_map
            .get(&resource.root)
            .unwrap_or(&resource.root);
        if root.is_empty() {
            PathBuf::from(&resource.resource_path)
        } else {
            Path::new(root).join(&resource.resource_path)
        }
    }

    fn handler_for(
        &mut self,
        resource: &Resource,
        factory: &SharedFactory,
    ) -> ModelResult<SharedHandler> {
        {
            let mut pool = self.pool.lock();
            if let Some(handler) = pool.get(&resource.uid) {
                if self.held.insert(resource.uid.clone()) {
                    pool.retain(&resource.uid);
                }
                return Ok(handler);
            }
        }

        // Construct outside the pool lock; this may block on storage.
        let locator = self.locator(resource);
        tracing::debug!(resource = %resource.uid, spec = %resource.spec, locator = %locator.display(), "Constructing handler");
        let handler = attempt_with_retries(&self.retry, "construct handler", || {
            factory.construct(&locator, &resource.resource_kwargs)
        })
        .map_err(|e| EventModelError::HandlerConstruction {
            resource: resource.uid.clone(),
            locator: locator.display().to_string(),
            attempts: e.attempts,
            source: e.source,
        })?;

        let shared = shared_handler(&resource.uid, handler);
        let mut pool = self.pool.lock();
        pool.insert(&resource.uid, shared.clone());
        if self.held.insert(resource.uid.clone()) {
            pool.retain(&resource.uid);
        }
        Ok(shared)
    }
}

impl Drop for Filler {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Filler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Filler")
            .field("handlers", &self.handlers)
            .field("coercion", &self.coercion_name)
            .field("mode", &self.mode)
            .field("held", &self.held.len())
            .field("closed", &self.closed)
            .finish()
    }
}

impl DocumentRouter for Filler {
    fn descriptor(&mut self, doc: Descriptor) -> ModelResult<Routed<Descriptor>> {
        self.add_descriptor(&doc)?;
        Ok(Routed::Handled(doc))
    }

    fn resource(&mut self, doc: Resource) -> ModelResult<Routed<Resource>> {
        self.add_resource(&doc)?;
        Ok(Routed::Handled(doc))
    }

    fn datum(&mut self, doc: Datum) -> ModelResult<Routed<Datum>> {
        self.add_datum(&doc)?;
        Ok(Routed::Handled(doc))
    }

    fn datum_page(&mut self, doc: DatumPage) -> ModelResult<Routed<DatumPage>> {
        self.add_datum_page(&doc)?;
        Ok(Routed::Handled(doc))
    }

    fn event(&mut self, mut doc: Event) -> ModelResult<Routed<Event>> {
        self.fill_event_in_place(&mut doc)?;
        Ok(Routed::Handled(doc))
    }

    fn event_page(&mut self, mut doc: EventPage) -> ModelResult<Routed<EventPage>> {
        self.fill_event_page_in_place(&mut doc)?;
        Ok(Routed::Handled(doc))
    }
}

/// Fail with `UnfilledData` if any field of the page still holds a placeholder.
pub fn verify_filled(page: &EventPage) -> ModelResult<()> {
    let unfilled: Vec<String> = page
        .filled
        .iter()
        .filter(|(_, column)| column_pending(column))
        .map(|(key, _)| key.clone())
        .collect();
    if unfilled.is_empty() {
        Ok(())
    } else {
        Err(EventModelError::UnfilledData(unfilled))
    }
}
