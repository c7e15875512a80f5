//! A composed run replayed through the run router with per-run filling.

use event_model::cache::HandlerPool;
use event_model::document::{DataKey, Document, DocumentKind, ExitStatus, Filled, Kwargs, Start};
use event_model::handler::{factory_fn, Handler, HandlerError, HandlerRegistry};
use event_model::run_router::{for_stream, FactoryOutput, RunRouter};
use event_model::{DocumentCallback, EventModelError, FillerConfig, ModelResult, RunComposer};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Returns `[frame, frame]` for `{"frame": n}`.
struct Frames {
    closed: Arc<AtomicUsize>,
}

impl Handler for Frames {
    fn resolve(&mut self, datum_kwargs: &Kwargs) -> Result<Value, HandlerError> {
        let frame = datum_kwargs
            .get("frame")
            .and_then(Value::as_i64)
            .ok_or_else(|| anyhow::anyhow!("missing frame"))?;
        Ok(json!([frame, frame]))
    }

    fn close(&mut self) -> Result<(), HandlerError> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn registry(constructed: Arc<AtomicUsize>, closed: Arc<AtomicUsize>) -> HandlerRegistry {
    let mut handlers = HandlerRegistry::new();
    handlers
        .register(
            "FRAMES",
            factory_fn(move |_, _| {
                constructed.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(Frames {
                    closed: closed.clone(),
                }))
            }),
        )
        .unwrap();
    handlers
}

/// Compose a run with one external field and `n` events.
fn compose_run(spec: &str, n: i64) -> Vec<Document> {
    let run = RunComposer::new();
    let mut docs = vec![Document::Start(run.open_run(Kwargs::new()).unwrap())];
    let (descriptor, events) = run
        .declare_stream(
            "primary",
            BTreeMap::from([
                ("motor".to_string(), DataKey::scalar("sim")),
                (
                    "image".to_string(),
                    DataKey::array("det", vec![2]).with_external("FILESTORE:"),
                ),
            ]),
        )
        .unwrap();
    docs.push(Document::Descriptor(descriptor));
    let (resource, mut datum) = run
        .compose_resource(spec, "/data", "scan.h5", Kwargs::new())
        .unwrap();
    docs.push(Document::Resource(resource));

    for frame in 0..n {
        let mut kwargs = Kwargs::new();
        kwargs.insert("frame".to_string(), json!(frame));
        let datum = datum.compose_datum(kwargs).unwrap();
        let event = events
            .compose_event(
                BTreeMap::from([
                    ("motor".to_string(), json!(frame)),
                    ("image".to_string(), json!(datum.datum_id)),
                ]),
                BTreeMap::from([("motor".to_string(), 0.0), ("image".to_string(), 0.0)]),
                None,
            )
            .unwrap();
        docs.push(Document::Datum(datum));
        docs.push(Document::Event(event));
    }
    docs.push(Document::Stop(
        run.compose_stop(ExitStatus::Success, None).unwrap(),
    ));
    docs
}

type Collected = Arc<Mutex<Vec<Document>>>;

fn collector(out: &Collected) -> impl DocumentCallback + 'static {
    let out = out.clone();
    move |doc: &Document| -> ModelResult<()> {
        out.lock().push(doc.clone());
        Ok(())
    }
}

#[test]
fn test_events_are_filled_before_delivery() {
    let constructed = Arc::new(AtomicUsize::new(0));
    let closed = Arc::new(AtomicUsize::new(0));
    let out = Collected::default();
    let sink = out.clone();
    let mut router = RunRouter::new()
        .with_handlers(registry(constructed.clone(), closed.clone()))
        .with_factory(move |_: &Start| Ok(FactoryOutput::new().with_callback(collector(&sink))));

    for doc in compose_run("FRAMES", 3) {
        router.route(&doc).unwrap();
    }

    let out = out.lock();
    let events: Vec<_> = out
        .iter()
        .filter_map(|doc| match doc {
            Document::Event(event) => Some(event),
            _ => None,
        })
        .collect();
    assert_eq!(events.len(), 3);
    for (frame, event) in events.iter().enumerate() {
        assert_eq!(event.data["image"], json!([frame, frame]));
        assert!(matches!(event.filled["image"], Filled::Datum(_)));
        assert_eq!(event.data["motor"], json!(frame));
    }

    assert_eq!(constructed.load(Ordering::SeqCst), 1);
    assert_eq!(closed.load(Ordering::SeqCst), 1);
    assert_eq!(router.active_runs().count(), 0);

    let Some(Document::Stop(stop)) = out.last() else {
        panic!("stop was not delivered last");
    };
    assert_eq!(stop.num_events["primary"], 3);
}

#[test]
fn test_unknown_spec_passes_through_unless_fill_or_fail() {
    let docs = compose_run("UNKNOWN", 1);
    let handlers = registry(Arc::default(), Arc::default());

    let out = Collected::default();
    let sink = out.clone();
    let mut lenient = RunRouter::new()
        .with_handlers(handlers.clone())
        .with_factory(move |_: &Start| Ok(FactoryOutput::new().with_callback(collector(&sink))));
    for doc in &docs {
        lenient.route(doc).unwrap();
    }
    let unfilled = out
        .lock()
        .iter()
        .find_map(|doc| match doc {
            Document::Event(event) => Some(event.clone()),
            _ => None,
        })
        .unwrap();
    assert!(unfilled.filled["image"].is_pending());
    assert!(unfilled.data["image"].is_string());

    let mut strict = RunRouter::new().with_handlers(handlers).with_config(FillerConfig {
        fill_or_fail: true,
        ..FillerConfig::default()
    });
    let err = docs
        .iter()
        .try_for_each(|doc| strict.route(doc))
        .unwrap_err();
    assert!(matches!(
        err,
        EventModelError::UndefinedAssetSpecification { spec, .. } if spec == "UNKNOWN"
    ));
}

#[test]
fn test_interleaved_runs_share_handler_pool() {
    let constructed = Arc::new(AtomicUsize::new(0));
    let closed = Arc::new(AtomicUsize::new(0));
    let pool = HandlerPool::bounded(NonZeroUsize::new(4).unwrap()).shared();
    let per_stream: Arc<Mutex<BTreeMap<String, usize>>> = Arc::default();
    let counts = per_stream.clone();

    let mut router = RunRouter::new()
        .with_handlers(registry(constructed.clone(), closed.clone()))
        .with_handler_pool(pool.clone())
        .with_factory(move |start: &Start| {
            let counts = counts.clone();
            let run = start.uid.clone();
            Ok(FactoryOutput::new().with_subfactory(for_stream("primary", move |_| {
                let counts = counts.clone();
                let run = run.clone();
                let callback = move |doc: &Document| -> ModelResult<()> {
                    if doc.kind() == DocumentKind::Event {
                        *counts.lock().entry(run.clone()).or_default() += 1;
                    }
                    Ok(())
                };
                Ok(vec![Box::new(callback) as Box<dyn DocumentCallback>])
            })))
        });

    let a = compose_run("FRAMES", 2);
    let b = compose_run("FRAMES", 3);
    // Open both runs before either finishes.
    let (a_head, a_tail) = a.split_at(3);
    let (b_head, b_tail) = b.split_at(3);
    for doc in a_head.iter().chain(b_head).chain(a_tail).chain(b_tail) {
        router.route(doc).unwrap();
    }

    let counts = per_stream.lock();
    assert_eq!(counts.values().sum::<usize>(), 5);
    assert_eq!(counts.len(), 2);
    // One handler per resource, closed when the owning run stopped.
    assert_eq!(constructed.load(Ordering::SeqCst), 2);
    assert_eq!(closed.load(Ordering::SeqCst), 2);
    assert!(pool.lock().is_empty());
}

#[test]
fn test_replayed_event_is_rejected() {
    let docs = compose_run("FRAMES", 2);
    let mut router = RunRouter::new();
    for doc in &docs[..docs.len() - 1] {
        router.route(doc).unwrap();
    }
    let replay = docs
        .iter()
        .find(|doc| doc.kind() == DocumentKind::Event)
        .unwrap();
    assert!(matches!(
        router.route(replay),
        Err(EventModelError::SequenceOutOfOrder { last: 2, found: 1, .. })
    ));
}
