//! Per-run demultiplexing of a merged document stream.
//!
//! A [`RunRouter`] is configured with factories. When a Start arrives each
//! factory is called with it and returns callbacks that will receive every
//! document of that run, plus sub-factories that are called with each of
//! the run's Descriptors:
//!
//! ```text
//! Start ──> factory(start) ──> run-wide callbacks
//!                          └─> sub-factories
//! Descriptor ──> sub-factory(descriptor) ──> stream callbacks
//! ```
//!
//! Stream callbacks receive the Start (replayed when they are created),
//! their Descriptor, that Descriptor's Events and EventPages, the run's
//! Resource and Datum documents and finally the Stop.
//!
//! When a handler registry is configured every run also gets its own
//! [`Filler`]; Events are filled before they are delivered. The Stop
//! document closes the run and its filler.
//!
//! # Run lifecycle
//!
//! ```text
//! absent ──Start──> active ──Stop──> closed (entry evicted)
//! ```
//!
//! A second Start with the uid of an active run, a document of a run that
//! was never started, an Event of an unknown Descriptor and a skipped or
//! repeated `seq_num` are all fatal errors. A Descriptor received twice is
//! ignored when identical and fatal otherwise.
//!
//! A Descriptor's sequence only advances once its Event or EventPage has
//! been filled, so a document rejected because its Datum has not arrived
//! yet can be routed again later.

use crate::cache::SharedHandlerPool;
use crate::config::FillerConfig;
use crate::document::{
    Datum, DatumPage, Descriptor, Document, Event, EventPage, Resource, Start, Stop, StreamDatum,
    StreamResource,
};
use crate::error::{EventModelError, ModelResult};
use crate::filler::Filler;
use crate::handler::{CoercionRegistry, HandlerRegistry};
use crate::router::DocumentCallback;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

/// Resources without a `run_start` remembered for routing their datum.
const UNLABELED_HISTORY: usize = 10_000;

/// Callbacks produced for one Descriptor.
pub type SubFactory =
    Box<dyn FnMut(&Descriptor) -> ModelResult<Vec<Box<dyn DocumentCallback>>> + Send>;

/// Called with every Start.
pub type RunFactory = Box<dyn FnMut(&Start) -> ModelResult<FactoryOutput> + Send>;

/// What a [`RunFactory`] returns for one run.
#[derive(Default)]
pub struct FactoryOutput {
    /// Receive every document of the run.
    pub callbacks: Vec<Box<dyn DocumentCallback>>,
    /// Called with each Descriptor of the run.
    pub subfactories: Vec<SubFactory>,
}

impl FactoryOutput {
    /// No callbacks and no sub-factories.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a callback for every document of the run.
    pub fn with_callback(mut self, callback: impl DocumentCallback + 'static) -> Self {
        self.callbacks.push(Box::new(callback));
        self
    }

    /// Add a sub-factory called with each Descriptor of the run.
    pub fn with_subfactory(mut self, subfactory: SubFactory) -> Self {
        self.subfactories.push(subfactory);
        self
    }
}

/// Wrap a closure as a [`SubFactory`].
pub fn subfactory<F>(factory: F) -> SubFactory
where
    F: FnMut(&Descriptor) -> ModelResult<Vec<Box<dyn DocumentCallback>>> + Send + 'static,
{
    Box::new(factory)
}

/// A sub-factory that only fires for Descriptors of stream `name`.
pub fn for_stream<F>(name: &str, mut factory: F) -> SubFactory
where
    F: FnMut(&Descriptor) -> ModelResult<Vec<Box<dyn DocumentCallback>>> + Send + 'static,
{
    let name = name.to_string();
    Box::new(move |descriptor: &Descriptor| {
        if descriptor.name == name {
            factory(descriptor)
        } else {
            Ok(Vec::new())
        }
    })
}

struct ActiveRun {
    start: Start,
    callbacks: Vec<Box<dyn DocumentCallback>>,
    subfactories: Vec<SubFactory>,
    /// Sub-factory callbacks tagged with their Descriptor uid.
    stream_callbacks: Vec<(String, Box<dyn DocumentCallback>)>,
    descriptors: HashMap<String, Descriptor>,
    last_seq: HashMap<String, u64>,
    filler: Option<Filler>,
}

impl ActiveRun {
    fn all_targets(&mut self) -> impl Iterator<Item = &mut Box<dyn DocumentCallback>> {
        self.callbacks
            .iter_mut()
            .chain(self.stream_callbacks.iter_mut().map(|(_, cb)| cb))
    }

    fn stream_targets<'a>(
        &'a mut self,
        descriptor: &'a str,
    ) -> impl Iterator<Item = &'a mut Box<dyn DocumentCallback>> + 'a {
        self.callbacks.iter_mut().chain(
            self.stream_callbacks
                .iter_mut()
                .filter(move |(uid, _)| uid == descriptor)
                .map(|(_, cb)| cb),
        )
    }
}

fn deliver<'a>(
    targets: impl Iterator<Item = &'a mut Box<dyn DocumentCallback>>,
    doc: &Document,
) -> ModelResult<()> {
    for target in targets {
        target.call(doc)?;
    }
    Ok(())
}

/// Require `seq_nums` to continue the Descriptor's sequence without gaps.
///
/// Returns the new last `seq_num`; recording it is left to the caller.
fn check_sequence(
    last_seq: &HashMap<String, u64>,
    descriptor: &str,
    seq_nums: &[u64],
) -> ModelResult<u64> {
    let mut last = last_seq.get(descriptor).copied().unwrap_or(0);
    for &found in seq_nums {
        if found <= last {
            return Err(EventModelError::SequenceOutOfOrder {
                descriptor: descriptor.to_string(),
                last,
                found,
            });
        }
        if found != last + 1 {
            return Err(EventModelError::SequenceGap {
                descriptor: descriptor.to_string(),
                last,
                found,
            });
        }
        last = found;
    }
    Ok(last)
}

/// Routes documents, by run, to callbacks built by factories. See the module docs.
#[derive(Default)]
pub struct RunRouter {
    factories: Vec<RunFactory>,
    handlers: Option<HandlerRegistry>,
    coercions: CoercionRegistry,
    config: FillerConfig,
    pool: Option<SharedHandlerPool>,
    runs: HashMap<String, ActiveRun>,
    descriptor_runs: HashMap<String, String>,
    resource_runs: HashMap<String, String>,
    unlabeled: VecDeque<String>,
    unlabeled_set: HashSet<String>,
}

impl RunRouter {
    /// A router with no factories that does not fill.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a factory called with every Start.
    pub fn with_factory<F>(mut self, factory: F) -> Self
    where
        F: FnMut(&Start) -> ModelResult<FactoryOutput> + Send + 'static,
    {
        self.factories.push(Box::new(factory));
        self
    }

    /// Fill events with a per-run [`Filler`] built from `handlers`.
    pub fn with_handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = Some(handlers);
        self
    }

    /// Coercions the per-run fillers pick from by `FillerConfig::coerce`.
    pub fn with_coercions(mut self, coercions: CoercionRegistry) -> Self {
        self.coercions = coercions;
        self
    }

    /// Settings for the per-run fillers.
    pub fn with_config(mut self, config: FillerConfig) -> Self {
        self.config = config;
        self
    }

    /// Share one handler pool between all per-run fillers.
    pub fn with_handler_pool(mut self, pool: SharedHandlerPool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// True between a run's Start and its Stop.
    pub fn is_active(&self, run_uid: &str) -> bool {
        self.runs.contains_key(run_uid)
    }

    /// Uids of the runs that have started and not yet stopped.
    pub fn active_runs(&self) -> impl Iterator<Item = &str> {
        self.runs.keys().map(String::as_str)
    }

    /// The filler attached to an active run.
    pub fn filler(&self, run_uid: &str) -> Option<&Filler> {
        self.runs.get(run_uid).and_then(|run| run.filler.as_ref())
    }

    /// Route one document to the consumers of its run.
    pub fn route(&mut self, doc: &Document) -> ModelResult<()> {
        match doc {
            Document::Start(start) => self.start(start),
            Document::Descriptor(descriptor) => self.descriptor(doc, descriptor),
            Document::Event(event) => self.event(doc, event),
            Document::EventPage(page) => self.event_page(doc, page),
            Document::Resource(resource) => self.resource(doc, resource),
            Document::Datum(datum) => self.datum(doc, datum),
            Document::DatumPage(page) => self.datum_page(doc, page),
            Document::StreamResource(resource) => self.stream_resource(doc, resource),
            Document::StreamDatum(datum) => self.stream_datum(doc, datum),
            Document::Stop(stop) => self.stop(doc, stop),
        }
    }

    fn start(&mut self, start: &Start) -> ModelResult<()> {
        if self.runs.contains_key(&start.uid) {
            return Err(EventModelError::DuplicateRun(start.uid.clone()));
        }
        let filler = match &self.handlers {
            Some(handlers) => Some(Filler::from_config(
                handlers.clone(),
                &self.coercions,
                &self.config,
                self.pool.clone(),
            )?),
            None => None,
        };

        let doc = Document::Start(start.clone());
        let mut run = ActiveRun {
            start: start.clone(),
            callbacks: Vec::new(),
            subfactories: Vec::new(),
            stream_callbacks: Vec::new(),
            descriptors: HashMap::new(),
            last_seq: HashMap::new(),
            filler,
        };
        for factory in &mut self.factories {
            let FactoryOutput {
                mut callbacks,
                subfactories,
            } = factory(start)?;
            deliver(callbacks.iter_mut(), &doc)?;
            run.callbacks.extend(callbacks);
            run.subfactories.extend(subfactories);
        }
        tracing::info!(run = %start.uid, callbacks = run.callbacks.len(), "Run started");
        self.runs.insert(start.uid.clone(), run);
        Ok(())
    }

    fn active_run(&mut self, run_uid: &str) -> ModelResult<&mut ActiveRun> {
        self.runs
            .get_mut(run_uid)
            .ok_or_else(|| EventModelError::UnknownRun(run_uid.to_string()))
    }

    fn run_of_descriptor(&self, descriptor_uid: &str) -> ModelResult<String> {
        self.descriptor_runs
            .get(descriptor_uid)
            .cloned()
            .ok_or_else(|| EventModelError::UnresolvableForeignKey {
                key: descriptor_uid.to_string(),
                message: format!("refers to unknown Descriptor {descriptor_uid}"),
            })
    }

    fn descriptor(&mut self, doc: &Document, descriptor: &Descriptor) -> ModelResult<()> {
        if let Some(owner) = self.descriptor_runs.get(&descriptor.uid) {
            let known = self
                .runs
                .get(owner)
                .and_then(|run| run.descriptors.get(&descriptor.uid));
            if owner == &descriptor.run_start && known == Some(descriptor) {
                tracing::debug!(descriptor = %descriptor.uid, "Ignoring repeated descriptor");
                return Ok(());
            }
            return Err(EventModelError::DuplicateDescriptor(descriptor.uid.clone()));
        }
        let run = self.active_run(&descriptor.run_start)?;
        if let Some(filler) = run.filler.as_mut() {
            filler.add_descriptor(descriptor)?;
        }
        deliver(run.all_targets(), doc)?;

        let start = Document::Start(run.start.clone());
        for subfactory in &mut run.subfactories {
            for mut callback in subfactory(descriptor)? {
                callback.call(&start)?;
                callback.call(doc)?;
                run.stream_callbacks.push((descriptor.uid.clone(), callback));
            }
        }
        run.descriptors
            .insert(descriptor.uid.clone(), descriptor.clone());
        tracing::debug!(run = %descriptor.run_start, stream = %descriptor.name, "Routed descriptor");
        self.descriptor_runs
            .insert(descriptor.uid.clone(), descriptor.run_start.clone());
        Ok(())
    }

    fn event(&mut self, doc: &Document, event: &Event) -> ModelResult<()> {
        let run_uid = self.run_of_descriptor(&event.descriptor)?;
        let fill_or_fail = self.config.fill_or_fail;
        let run = self.active_run(&run_uid)?;
        let last = check_sequence(
            &run.last_seq,
            &event.descriptor,
            std::slice::from_ref(&event.seq_num),
        )?;
        let filled = match run.filler.as_mut() {
            Some(filler) => unfillable_passes(filler.fill_event(event), fill_or_fail)?
                .map(Document::Event),
            None => None,
        };
        run.last_seq.insert(event.descriptor.clone(), last);
        deliver(
            run.stream_targets(&event.descriptor),
            filled.as_ref().unwrap_or(doc),
        )
    }

    fn event_page(&mut self, doc: &Document, page: &EventPage) -> ModelResult<()> {
        let run_uid = self.run_of_descriptor(&page.descriptor)?;
        let fill_or_fail = self.config.fill_or_fail;
        let run = self.active_run(&run_uid)?;
        let last = check_sequence(&run.last_seq, &page.descriptor, &page.seq_num)?;
        let filled = match run.filler.as_mut() {
            Some(filler) => unfillable_passes(filler.fill_event_page(page), fill_or_fail)?
                .map(Document::EventPage),
            None => None,
        };
        run.last_seq.insert(page.descriptor.clone(), last);
        deliver(
            run.stream_targets(&page.descriptor),
            filled.as_ref().unwrap_or(doc),
        )
    }

    fn resource(&mut self, doc: &Document, resource: &Resource) -> ModelResult<()> {
        let Some(run_uid) = &resource.run_start else {
            self.remember_unlabeled(&resource.uid);
            return self.fan_out(doc, |filler| filler.add_resource(resource));
        };
        let run = self.active_run(run_uid)?;
        if let Some(filler) = run.filler.as_mut() {
            filler.add_resource(resource)?;
        }
        deliver(run.all_targets(), doc)?;
        self.resource_runs
            .insert(resource.uid.clone(), run_uid.clone());
        Ok(())
    }

    fn stream_resource(&mut self, doc: &Document, resource: &StreamResource) -> ModelResult<()> {
        let Some(run_uid) = &resource.run_start else {
            self.remember_unlabeled(&resource.uid);
            return self.fan_out(doc, |_| Ok(()));
        };
        deliver(self.active_run(run_uid)?.all_targets(), doc)?;
        self.resource_runs
            .insert(resource.uid.clone(), run_uid.clone());
        Ok(())
    }

    fn datum(&mut self, doc: &Document, datum: &Datum) -> ModelResult<()> {
        self.route_by_resource(doc, &datum.resource, |filler| filler.add_datum(datum))
    }

    fn datum_page(&mut self, doc: &Document, page: &DatumPage) -> ModelResult<()> {
        self.route_by_resource(doc, &page.resource, |filler| filler.add_datum_page(page))
    }

    fn stream_datum(&mut self, doc: &Document, datum: &StreamDatum) -> ModelResult<()> {
        self.route_by_resource(doc, &datum.stream_resource, |_| Ok(()))
    }

    fn stop(&mut self, doc: &Document, stop: &Stop) -> ModelResult<()> {
        let run_uid = &stop.run_start;
        // Evict first so the filler is closed on every exit path.
        let mut run = self
            .runs
            .remove(run_uid)
            .ok_or_else(|| EventModelError::UnknownRun(run_uid.clone()))?;
        self.descriptor_runs.retain(|_, owner| owner != run_uid);
        self.resource_runs.retain(|_, owner| owner != run_uid);

        deliver(run.all_targets(), doc)?;
        if let Some(mut filler) = run.filler.take() {
            filler.close();
        }
        tracing::info!(run = %run_uid, exit_status = ?stop.exit_status, "Run closed");
        Ok(())
    }

    /// Route a datum-like document to the run owning `resource_uid`.
    fn route_by_resource<F>(
        &mut self,
        doc: &Document,
        resource_uid: &str,
        mut feed: F,
    ) -> ModelResult<()>
    where
        F: FnMut(&mut Filler) -> ModelResult<()>,
    {
        if let Some(run_uid) = self.resource_runs.get(resource_uid).cloned() {
            let run = self.active_run(&run_uid)?;
            if let Some(filler) = run.filler.as_mut() {
                feed(filler)?;
            }
            return deliver(run.all_targets(), doc);
        }
        if self.unlabeled_set.contains(resource_uid) {
            return self.fan_out(doc, feed);
        }
        Err(EventModelError::UnresolvableForeignKey {
            key: resource_uid.to_string(),
            message: format!("{} refers to unknown resource {resource_uid}", doc.kind()),
        })
    }

    /// Send a document of unknown run to every active run.
    fn fan_out<F>(&mut self, doc: &Document, mut feed: F) -> ModelResult<()>
    where
        F: FnMut(&mut Filler) -> ModelResult<()>,
    {
        tracing::debug!(kind = %doc.kind(), runs = self.runs.len(), "Fanning out unlabeled document");
        for run in self.runs.values_mut() {
            if let Some(filler) = run.filler.as_mut() {
                feed(filler)?;
            }
            deliver(run.all_targets(), doc)?;
        }
        Ok(())
    }

    fn remember_unlabeled(&mut self, uid: &str) {
        if !self.unlabeled_set.insert(uid.to_string()) {
            return;
        }
        self.unlabeled.push_back(uid.to_string());
        if self.unlabeled.len() > UNLABELED_HISTORY {
            if let Some(oldest) = self.unlabeled.pop_front() {
                self.unlabeled_set.remove(&oldest);
            }
        }
    }
}

/// Unless `fill_or_fail`, a document whose spec has no handler passes through unfilled.
fn unfillable_passes<T>(result: ModelResult<T>, fill_or_fail: bool) -> ModelResult<Option<T>> {
    match result {
        Ok(filled) => Ok(Some(filled)),
        Err(EventModelError::UndefinedAssetSpecification { spec, resource }) if !fill_or_fail => {
            tracing::warn!(%spec, %resource, "No handler for spec, passing document through unfilled");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

impl DocumentCallback for RunRouter {
    fn call(&mut self, doc: &Document) -> ModelResult<()> {
        self.route(doc)
    }
}

impl fmt::Debug for RunRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunRouter")
            .field("factories", &self.factories.len())
            .field("handlers", &self.handlers)
            .field("active_runs", &self.runs.len())
            .finish()
    }
}
