//! Document routing: dispatch by kind, with page/single-record conversion.
//!
//! A [`DocumentRouter`] has one method per document kind. Every method has a
//! default that hands the document back as [`Routed::Unhandled`], so an
//! implementation overrides only the kinds it cares about, and only one
//! granularity of each:
//!
//! | incoming     | `event` handled | only `event_page` handled |
//! |--------------|-----------------|---------------------------|
//! | `Event`      | called directly | packed into a 1-row page  |
//! | `EventPage`  | unpacked rows   | called directly           |
//!
//! The same holds for `datum` / `datum_page`. When neither granularity is
//! handled the original document is returned unchanged.
//!
//! [`Dispatcher`] adds an emit chain: every routed document is forwarded to
//! a list of downstream callbacks, optionally after schema validation.

use crate::document::{
    Datum, DatumPage, Descriptor, Document, Event, EventPage, Resource, Start, Stop, StreamDatum,
    StreamResource,
};
use crate::error::{EventModelError, ModelResult};
use crate::page::{pack_datum_page, pack_event_page, unpack_datum_page, unpack_event_page};
use crate::validate::{check_optional, SharedValidator};
use std::collections::HashMap;

/// Result of offering a document to one router method.
#[derive(Debug, Clone, PartialEq)]
pub enum Routed<T> {
    /// The method processed the document; this is its output.
    Handled(T),
    /// The method does not handle this kind; the document comes back untouched.
    Unhandled(T),
}

impl<T> Routed<T> {
    /// The document, whether or not it was handled.
    pub fn into_inner(self) -> T {
        match self {
            Routed::Handled(doc) | Routed::Unhandled(doc) => doc,
        }
    }

    /// True for [`Routed::Handled`].
    pub fn is_handled(&self) -> bool {
        matches!(self, Routed::Handled(_))
    }
}

/// Per-kind document handlers. All methods default to passthrough.
pub trait DocumentRouter {
    fn start(&mut self, doc: Start) -> ModelResult<Routed<Start>> {
        Ok(Routed::Unhandled(doc))
    }

    fn descriptor(&mut self, doc: Descriptor) -> ModelResult<Routed<Descriptor>> {
        Ok(Routed::Unhandled(doc))
    }

    fn event(&mut self, doc: Event) -> ModelResult<Routed<Event>> {
        Ok(Routed::Unhandled(doc))
    }

    fn event_page(&mut self, doc: EventPage) -> ModelResult<Routed<EventPage>> {
        Ok(Routed::Unhandled(doc))
    }

    fn resource(&mut self, doc: Resource) -> ModelResult<Routed<Resource>> {
        Ok(Routed::Unhandled(doc))
    }

    fn datum(&mut self, doc: Datum) -> ModelResult<Routed<Datum>> {
        Ok(Routed::Unhandled(doc))
    }

    fn datum_page(&mut self, doc: DatumPage) -> ModelResult<Routed<DatumPage>> {
        Ok(Routed::Unhandled(doc))
    }

    fn stream_resource(&mut self, doc: StreamResource) -> ModelResult<Routed<StreamResource>> {
        Ok(Routed::Unhandled(doc))
    }

    fn stream_datum(&mut self, doc: StreamDatum) -> ModelResult<Routed<StreamDatum>> {
        Ok(Routed::Unhandled(doc))
    }

    fn stop(&mut self, doc: Stop) -> ModelResult<Routed<Stop>> {
        Ok(Routed::Unhandled(doc))
    }
}

/// Router that handles nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

impl DocumentRouter for Passthrough {}

/// Route one document through `router`, converting between page and
/// single-record forms as needed. Unhandled documents come back unchanged.
pub fn dispatch<R>(router: &mut R, doc: Document) -> ModelResult<Document>
where
    R: DocumentRouter + ?Sized,
{
    let kind = doc.kind();
    let routed = match doc {
        Document::Start(d) => Document::Start(router.start(d)?.into_inner()),
        Document::Descriptor(d) => Document::Descriptor(router.descriptor(d)?.into_inner()),
        Document::Event(d) => route_event(router, d)?,
        Document::EventPage(d) => route_event_page(router, d)?,
        Document::Resource(d) => Document::Resource(router.resource(d)?.into_inner()),
        Document::Datum(d) => route_datum(router, d)?,
        Document::DatumPage(d) => route_datum_page(router, d)?,
        Document::StreamResource(d) => {
            Document::StreamResource(router.stream_resource(d)?.into_inner())
        }
        Document::StreamDatum(d) => Document::StreamDatum(router.stream_datum(d)?.into_inner()),
        Document::Stop(d) => Document::Stop(router.stop(d)?.into_inner()),
    };
    tracing::trace!(%kind, "Dispatched document");
    Ok(routed)
}

fn route_event<R: DocumentRouter + ?Sized>(router: &mut R, doc: Event) -> ModelResult<Document> {
    let doc = match router.event(doc)? {
        Routed::Handled(event) => return Ok(Document::Event(event)),
        Routed::Unhandled(event) => event,
    };
    let page = pack_event_page(std::slice::from_ref(&doc))?;
    match router.event_page(page)? {
        Routed::Handled(page) => {
            let row = unpack_event_page(&page).next();
            row.map(Document::Event).ok_or_else(|| {
                EventModelError::InvalidDocument(
                    "event_page handler returned an empty page for a single event".to_string(),
                )
            })
        }
        Routed::Unhandled(_) => Ok(Document::Event(doc)),
    }
}

fn route_event_page<R: DocumentRouter + ?Sized>(
    router: &mut R,
    doc: EventPage,
) -> ModelResult<Document> {
    let doc = match router.event_page(doc)? {
        Routed::Handled(page) => return Ok(Document::EventPage(page)),
        Routed::Unhandled(page) => page,
    };
    let mut rows = unpack_event_page(&doc).collect::<Vec<_>>().into_iter();
    let Some(first) = rows.next() else {
        return Ok(Document::EventPage(doc));
    };
    let first = match router.event(first)? {
        Routed::Handled(event) => event,
        Routed::Unhandled(_) => return Ok(Document::EventPage(doc)),
    };
    let mut events = vec![first];
    for event in rows {
        events.push(router.event(event)?.into_inner());
    }
    Ok(Document::EventPage(pack_event_page(&events)?))
}

fn route_datum<R: DocumentRouter + ?Sized>(router: &mut R, doc: Datum) -> ModelResult<Document> {
    let doc = match router.datum(doc)? {
        Routed::Handled(datum) => return Ok(Document::Datum(datum)),
        Routed::Unhandled(datum) => datum,
    };
    let page = pack_datum_page(std::slice::from_ref(&doc))?;
    match router.datum_page(page)? {
        Routed::Handled(page) => {
            let row = unpack_datum_page(&page).next();
            row.map(Document::Datum).ok_or_else(|| {
                EventModelError::InvalidDocument(
                    "datum_page handler returned an empty page for a single datum".to_string(),
                )
            })
        }
        Routed::Unhandled(_) => Ok(Document::Datum(doc)),
    }
}

fn route_datum_page<R: DocumentRouter + ?Sized>(
    router: &mut R,
    doc: DatumPage,
) -> ModelResult<Document> {
    let doc = match router.datum_page(doc)? {
        Routed::Handled(page) => return Ok(Document::DatumPage(page)),
        Routed::Unhandled(page) => page,
    };
    let mut rows = unpack_datum_page(&doc).collect::<Vec<_>>().into_iter();
    let Some(first) = rows.next() else {
        return Ok(Document::DatumPage(doc));
    };
    let first = match router.datum(first)? {
        Routed::Handled(datum) => datum,
        Routed::Unhandled(_) => return Ok(Document::DatumPage(doc)),
    };
    let mut datum = vec![first];
    for row in rows {
        datum.push(router.datum(row)?.into_inner());
    }
    Ok(Document::DatumPage(pack_datum_page(&datum)?))
}

/// A downstream consumer of routed documents.
pub trait DocumentCallback: Send {
    fn call(&mut self, doc: &Document) -> ModelResult<()>;
}

impl<F> DocumentCallback for F
where
    F: FnMut(&Document) -> ModelResult<()> + Send,
{
    fn call(&mut self, doc: &Document) -> ModelResult<()> {
        self(doc)
    }
}

/// A router plus its emit chain.
pub struct Dispatcher<R> {
    router: R,
    emit: Vec<Box<dyn DocumentCallback>>,
    validator: Option<SharedValidator>,
}

impl<R: DocumentRouter> Dispatcher<R> {
    /// A dispatcher with an empty emit chain and no validation.
    pub fn new(router: R) -> Self {
        Self {
            router,
            emit: Vec::new(),
            validator: None,
        }
    }

    /// Validate every outgoing document before it is emitted.
    pub fn with_validator(mut self, validator: SharedValidator) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Append a downstream target.
    pub fn emit_to(mut self, target: impl DocumentCallback + 'static) -> Self {
        self.emit.push(Box::new(target));
        self
    }

    /// The wrapped router.
    pub fn router(&self) -> &R {
        &self.router
    }

    /// The wrapped router, mutably.
    pub fn router_mut(&mut self) -> &mut R {
        &mut self.router
    }

    /// Unwrap, dropping the emit chain.
    pub fn into_router(self) -> R {
        self.router
    }

    /// Dispatch `doc`, then forward the result down the emit chain.
    ///
    /// Errors from downstream targets propagate; later targets are skipped.
    pub fn route(&mut self, doc: Document) -> ModelResult<Document> {
        let out = dispatch(&mut self.router, doc)?;
        check_optional(self.validator.as_ref(), &out)?;
        for target in &mut self.emit {
            target.call(&out)?;
        }
        Ok(out)
    }
}

impl<R: DocumentRouter + Send> DocumentCallback for Dispatcher<R> {
    fn call(&mut self, doc: &Document) -> ModelResult<()> {
        self.route(doc.clone()).map(drop)
    }
}

/// Router wrapper that accepts the documents of exactly one run.
///
/// Tracks the run's Start and Descriptors, rejects documents that belong to
/// another run, then delegates to the wrapped router.
#[derive(Debug, Default)]
pub struct SingleRunRouter<R> {
    inner: R,
    start: Option<Start>,
    descriptors: HashMap<String, Descriptor>,
}

impl<R> SingleRunRouter<R> {
    /// Wrap `inner`; the first Start fixes the run.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            start: None,
            descriptors: HashMap::new(),
        }
    }

    /// The wrapped router.
    pub fn inner(&self) -> &R {
        &self.inner
    }

    /// The wrapped router, mutably.
    pub fn inner_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    /// The Start of the run, once seen.
    pub fn run_start(&self) -> ModelResult<&Start> {
        self.start.as_ref().ok_or(EventModelError::RunNotOpen)
    }

    /// A Descriptor of this run, by uid.
    pub fn descriptor_of(&self, descriptor_uid: &str) -> ModelResult<&Descriptor> {
        self.descriptors
            .get(descriptor_uid)
            .ok_or_else(|| EventModelError::UnresolvableForeignKey {
                key: descriptor_uid.to_string(),
                message: "Descriptor is not part of this run".to_string(),
            })
    }

    /// Stream name of the Descriptor an Event refers to.
    pub fn stream_name_of(&self, descriptor_uid: &str) -> ModelResult<&str> {
        self.descriptor_of(descriptor_uid).map(|d| d.name.as_str())
    }

    fn check_run(&self, run_start: &str) -> ModelResult<()> {
        if self.run_start()?.uid != run_start {
            return Err(EventModelError::UnknownRun(run_start.to_string()));
        }
        Ok(())
    }
}

impl<R: DocumentRouter> DocumentRouter for SingleRunRouter<R> {
    fn start(&mut self, doc: Start) -> ModelResult<Routed<Start>> {
        if let Some(start) = &self.start {
            return Err(EventModelError::DuplicateRun(start.uid.clone()));
        }
        self.start = Some(doc.clone());
        self.inner.start(doc)
    }

    fn descriptor(&mut self, doc: Descriptor) -> ModelResult<Routed<Descriptor>> {
        self.check_run(&doc.run_start)?;
        self.descriptors.insert(doc.uid.clone(), doc.clone());
        self.inner.descriptor(doc)
    }

    fn event(&mut self, doc: Event) -> ModelResult<Routed<Event>> {
        self.descriptor_of(&doc.descriptor)?;
        self.inner.event(doc)
    }

    fn event_page(&mut self, doc: EventPage) -> ModelResult<Routed<EventPage>> {
        self.descriptor_of(&doc.descriptor)?;
        self.inner.event_page(doc)
    }

    fn resource(&mut self, doc: Resource) -> ModelResult<Routed<Resource>> {
        if let Some(run_start) = &doc.run_start {
            self.check_run(run_start)?;
        }
        self.inner.resource(doc)
    }

    fn datum(&mut self, doc: Datum) -> ModelResult<Routed<Datum>> {
        self.inner.datum(doc)
    }

    fn datum_page(&mut self, doc: DatumPage) -> ModelResult<Routed<DatumPage>> {
        self.inner.datum_page(doc)
    }

    fn stream_resource(&mut self, doc: StreamResource) -> ModelResult<Routed<StreamResource>> {
        if let Some(run_start) = &doc.run_start {
            self.check_run(run_start)?;
        }
        self.inner.stream_resource(doc)
    }

    fn stream_datum(&mut self, doc: StreamDatum) -> ModelResult<Routed<StreamDatum>> {
        self.inner.stream_datum(doc)
    }

    fn stop(&mut self, doc: Stop) -> ModelResult<Routed<Stop>> {
        self.check_run(&doc.run_start)?;
        self.inner.stop(doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{ExitStatus, Kwargs};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn event(seq_num: u64, x: i64) -> Event {
        Event {
            uid: format!("e{seq_num}"),
            time: 0.0,
            descriptor: "d".into(),
            seq_num,
            data: BTreeMap::from([("x".to_string(), json!(x))]),
            timestamps: BTreeMap::from([("x".to_string(), 0.0)]),
            filled: BTreeMap::new(),
        }
    }

    /// Doubles `x`, implemented only at page granularity.
    struct DoublePages;

    impl DocumentRouter for DoublePages {
        fn event_page(&mut self, mut doc: EventPage) -> ModelResult<Routed<EventPage>> {
            if let Some(column) = doc.data.get_mut("x") {
                for value in column.iter_mut() {
                    *value = json!(value.as_i64().unwrap_or_default() * 2);
                }
            }
            Ok(Routed::Handled(doc))
        }
    }

    /// Counts events, implemented only at row granularity.
    #[derive(Default)]
    struct CountRows(usize);

    impl DocumentRouter for CountRows {
        fn event(&mut self, doc: Event) -> ModelResult<Routed<Event>> {
            self.0 += 1;
            Ok(Routed::Handled(doc))
        }
    }

    #[test]
    fn test_single_event_reaches_page_handler() {
        let out = dispatch(&mut DoublePages, Document::Event(event(1, 21))).unwrap();
        let Document::Event(out) = out else {
            panic!("expected an event, got {:?}", out.kind());
        };
        assert_eq!(out.data["x"], json!(42));
        assert_eq!(out.uid, "e1");
    }

    #[test]
    fn test_page_reaches_row_handler() {
        let page = pack_event_page(&[event(1, 1), event(2, 2), event(3, 3)]).unwrap();
        let mut router = CountRows::default();
        let out = dispatch(&mut router, Document::EventPage(page.clone())).unwrap();
        assert_eq!(router.0, 3);
        assert_eq!(out, Document::EventPage(page));
    }

    #[test]
    fn test_unhandled_is_passthrough() {
        let page = pack_event_page(&[event(1, 1)]).unwrap();
        let doc = Document::EventPage(page);
        assert_eq!(dispatch(&mut Passthrough, doc.clone()).unwrap(), doc);

        let datum = Document::Datum(Datum {
            datum_id: "r/0".into(),
            resource: "r".into(),
            datum_kwargs: Kwargs::new(),
        });
        assert_eq!(dispatch(&mut Passthrough, datum.clone()).unwrap(), datum);
    }

    #[test]
    fn test_emit_chain_sees_routed_output() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut dispatcher =
            Dispatcher::new(DoublePages).emit_to(move |doc: &Document| -> ModelResult<()> {
                sink.lock().push(doc.clone());
                Ok(())
            });
        dispatcher.route(Document::Event(event(1, 5))).unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert!(matches!(&seen[0], Document::Event(e) if e.data["x"] == json!(10)));
    }

    #[test]
    fn test_emit_errors_propagate() {
        let mut dispatcher =
            Dispatcher::new(Passthrough).emit_to(|_: &Document| -> ModelResult<()> {
                Err(EventModelError::InvalidDocument("downstream refused".into()))
            });
        assert!(dispatcher.route(Document::Event(event(1, 1))).is_err());
    }

    #[test]
    fn test_single_run_router() {
        let start = Start {
            uid: "run-a".into(),
            time: 0.0,
            metadata: Kwargs::new(),
        };
        let descriptor = Descriptor {
            uid: "d".into(),
            time: 0.0,
            run_start: "run-a".into(),
            name: "primary".into(),
            data_keys: BTreeMap::new(),
            configuration: Kwargs::new(),
            hints: Kwargs::new(),
            object_keys: Kwargs::new(),
        };
        let mut router = SingleRunRouter::new(CountRows::default());
        assert!(matches!(
            dispatch(&mut router, Document::Event(event(1, 1))),
            Err(EventModelError::UnresolvableForeignKey { .. })
        ));

        dispatch(&mut router, Document::Start(start.clone())).unwrap();
        dispatch(&mut router, Document::Descriptor(descriptor.clone())).unwrap();
        dispatch(&mut router, Document::Event(event(1, 1))).unwrap();
        assert_eq!(router.inner().0, 1);
        assert_eq!(router.stream_name_of("d").unwrap(), "primary");
        assert_eq!(router.run_start().unwrap().uid, "run-a");

        assert!(matches!(
            dispatch(&mut router, Document::Start(start)),
            Err(EventModelError::DuplicateRun(_))
        ));
        let foreign = Descriptor {
            run_start: "run-b".into(),
            ..descriptor
        };
        assert!(matches!(
            dispatch(&mut router, Document::Descriptor(foreign)),
            Err(EventModelError::UnknownRun(_))
        ));

        let stop = Stop {
            uid: "s".into(),
            time: 1.0,
            run_start: "run-a".into(),
            exit_status: ExitStatus::Success,
            reason: String::new(),
            num_events: BTreeMap::new(),
        };
        assert!(dispatch(&mut router, Document::Stop(stop)).is_ok());
    }
}
