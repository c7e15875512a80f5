//! Composition engine: stateful builders that mint consistent runs.
//!
//! A [`RunComposer`] owns one run. Opening it mints the Start document;
//! every other document is minted through a factory it hands out:
//!
//! ```text
//! RunComposer::open_run ──> Start
//!     ├── declare_stream ──> Descriptor + EventComposer ──> Event / EventPage
//!     ├── compose_resource ──> Resource + DatumComposer ──> Datum / DatumPage
//!     ├── compose_stream_resource ──> StreamResource + StreamDatumComposer ──> StreamDatum
//!     └── compose_stop ──> Stop
//! ```
//!
//! Sequence numbers live in the run state shared by the composer and its
//! event factories, so they can only advance by composing events. Once the
//! Stop is minted every factory of the run refuses further work.
//!
//! # Example
//!
//! ```
//! use event_model::compose::RunComposer;
//! use event_model::document::{DataKey, ExitStatus, Kwargs};
//! use serde_json::json;
//! use std::collections::BTreeMap;
//!
//! # fn main() -> event_model::ModelResult<()> {
//! let run = RunComposer::new();
//! let start = run.open_run(Kwargs::new())?;
//! let (descriptor, events) =
//!     run.declare_stream("primary", BTreeMap::from([("x".to_string(), DataKey::scalar("motor"))]))?;
//! let event = events.compose_event_now(BTreeMap::from([("x".to_string(), json!(1))]))?;
//! assert_eq!(event.seq_num, 1);
//! assert_eq!(descriptor.run_start, start.uid);
//! let stop = run.compose_stop(ExitStatus::Success, None)?;
//! assert_eq!(stop.num_events["primary"], 1);
//! # Ok(())
//! # }
//! ```

use crate::document::{
    new_uid, now, DataKey, Datum, DatumPage, Descriptor, Document, DocumentKind, Event, EventPage,
    ExitStatus, Filled, Kwargs, PathSemantics, Resource, Start, Stop, StreamDatum, StreamResource,
};
use crate::error::{EventModelError, ModelResult};
use crate::page::pack_datum_page;
use crate::validate::{check_optional, SharedValidator};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

/// Declared stream and the last seq_num minted for it.
#[derive(Debug)]
struct Stream {
    descriptor: Descriptor,
    last_seq: u64,
}

#[derive(Debug, Default)]
struct RunState {
    start: Option<Start>,
    stopped: bool,
    streams: HashMap<String, Stream>,
}

impl RunState {
    fn run_uid(&self) -> ModelResult<String> {
        let start = self.start.as_ref().ok_or(EventModelError::RunNotOpen)?;
        if self.stopped {
            return Err(EventModelError::RunAlreadyStopped(start.uid.clone()));
        }
        Ok(start.uid.clone())
    }
}

type SharedState = Arc<Mutex<RunState>>;

/// Validate `doc` when a validator is configured; clones only in that case.
fn validated<T>(validator: Option<&SharedValidator>, doc: T) -> ModelResult<T>
where
    T: Clone + Into<Document>,
{
    if validator.is_some() {
        check_optional(validator, &doc.clone().into())?;
    }
    Ok(doc)
}

/// Additional Descriptor fields beyond the data keys.
#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    /// Device configuration recorded with the stream
    pub configuration: Kwargs,
    /// Display hints
    pub hints: Kwargs,
    /// Device name to the data keys it produces
    pub object_keys: Kwargs,
}

/// Builder for one run. See the module docs.
#[derive(Default)]
pub struct RunComposer {
    state: SharedState,
    validator: Option<SharedValidator>,
}

impl RunComposer {
    /// A composer whose run has not been opened yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check every minted document with `validator`.
    pub fn with_validator(mut self, validator: SharedValidator) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Mint the Start document.
    ///
    /// `uid` and `time` are always generated; metadata may not supply them.
    pub fn open_run(&self, metadata: Kwargs) -> ModelResult<Start> {
        let mut state = self.state.lock();
        if let Some(start) = &state.start {
            return Err(EventModelError::RunAlreadyOpen(start.uid.clone()));
        }
        if let Some(reserved) = ["uid", "time"].into_iter().find(|k| metadata.contains_key(*k)) {
            return Err(EventModelError::InvalidDocument(format!(
                "Start metadata may not set reserved field '{reserved}'"
            )));
        }
        let start = validated(
            self.validator.as_ref(),
            Start {
                uid: new_uid(),
                time: now(),
                metadata,
            },
        )?;
        tracing::info!(run = %start.uid, "Opened run");
        state.start = Some(start.clone());
        Ok(start)
    }

    /// The Start document, once the run is open.
    pub fn start(&self) -> Option<Start> {
        self.state.lock().start.clone()
    }

    /// True once the Stop document has been composed.
    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    /// Declare a stream with default options. See [`declare_stream_with`](Self::declare_stream_with).
    pub fn declare_stream(
        &self,
        name: &str,
        data_keys: BTreeMap<String, DataKey>,
    ) -> ModelResult<(Descriptor, EventComposer)> {
        self.declare_stream_with(name, data_keys, StreamOptions::default())
    }

    /// Mint a Descriptor for `name`, or return the existing one.
    ///
    /// Repeating a declaration with identical data keys returns the cached
    /// Descriptor and a factory sharing its counter. Different data keys
    /// under an existing name fail with `StreamConflict`.
    pub fn declare_stream_with(
        &self,
        name: &str,
        data_keys: BTreeMap<String, DataKey>,
        options: StreamOptions,
    ) -> ModelResult<(Descriptor, EventComposer)> {
        let mut state = self.state.lock();
        let run_start = state.run_uid()?;

        if let Some(stream) = state.streams.get(name) {
            if stream.descriptor.data_keys != data_keys {
                return Err(EventModelError::StreamConflict {
                    name: name.to_string(),
                    existing: stream.descriptor.data_keys.keys().cloned().collect(),
                    requested: data_keys.keys().cloned().collect(),
                });
            }
            let descriptor = stream.descriptor.clone();
            return Ok((descriptor.clone(), self.event_composer(descriptor)));
        }

        let descriptor = validated(
            self.validator.as_ref(),
            Descriptor {
                uid: new_uid(),
                time: now(),
                run_start,
                name: name.to_string(),
                data_keys,
                configuration: options.configuration,
                hints: options.hints,
                object_keys: options.object_keys,
            },
        )?;
        tracing::debug!(stream = name, descriptor = %descriptor.uid, "Declared stream");
        state.streams.insert(
            name.to_string(),
            Stream {
                descriptor: descriptor.clone(),
                last_seq: 0,
            },
        );
        Ok((descriptor.clone(), self.event_composer(descriptor)))
    }

    fn event_composer(&self, descriptor: Descriptor) -> EventComposer {
        EventComposer {
            state: self.state.clone(),
            validator: self.validator.clone(),
            descriptor,
        }
    }

    /// Mint a Resource bound to this run and a factory for its Datum.
    pub fn compose_resource(
        &self,
        spec: &str,
        root: &str,
        resource_path: &str,
        resource_kwargs: Kwargs,
    ) -> ModelResult<(Resource, DatumComposer)> {
        let run_start = self.state.lock().run_uid()?;
        let resource = validated(
            self.validator.as_ref(),
            Resource {
                uid: new_uid(),
                spec: spec.to_string(),
                root: root.to_string(),
                resource_path: resource_path.to_string(),
                resource_kwargs,
                path_semantics: PathSemantics::default(),
                run_start: Some(run_start),
            },
        )?;
        let datum = DatumComposer {
            state: self.state.clone(),
            validator: self.validator.clone(),
            resource: resource.uid.clone(),
            next: 0,
        };
        Ok((resource, datum))
    }

    /// Mint a StreamResource for `data_key` and a factory for its StreamDatum.
    pub fn compose_stream_resource(
        &self,
        spec: &str,
        root: &str,
        resource_path: &str,
        data_key: &str,
        resource_kwargs: Kwargs,
    ) -> ModelResult<(StreamResource, StreamDatumComposer)> {
        let run_start = self.state.lock().run_uid()?;
        let resource = validated(
            self.validator.as_ref(),
            StreamResource {
                uid: new_uid(),
                spec: spec.to_string(),
                root: root.to_string(),
                resource_path: resource_path.to_string(),
                resource_kwargs,
                data_key: data_key.to_string(),
                path_semantics: PathSemantics::default(),
                run_start: Some(run_start),
            },
        )?;
        let datum = StreamDatumComposer {
            state: self.state.clone(),
            validator: self.validator.clone(),
            stream_resource: resource.uid.clone(),
            next_block: 0,
            next_offset: 0,
        };
        Ok((resource, datum))
    }

    /// Mint the Stop document and close the run.
    ///
    /// `num_events` reports the last seq_num of every declared stream.
    pub fn compose_stop(&self, exit_status: ExitStatus, reason: Option<&str>) -> ModelResult<Stop> {
        let mut state = self.state.lock();
        let run_start = state.run_uid()?;
        let num_events = state
            .streams
            .iter()
            .map(|(name, stream)| (name.clone(), stream.last_seq))
            .collect();
        let stop = validated(
            self.validator.as_ref(),
            Stop {
                uid: new_uid(),
                time: now(),
                run_start,
                exit_status,
                reason: reason.unwrap_or_default().to_string(),
                num_events,
            },
        )?;
        state.stopped = true;
        tracing::info!(run = %stop.run_start, ?exit_status, "Stopped run");
        Ok(stop)
    }
}

/// Event factory for one Descriptor.
#[derive(Clone)]
pub struct EventComposer {
    state: SharedState,
    validator: Option<SharedValidator>,
    descriptor: Descriptor,
}

impl EventComposer {
    /// The Descriptor this composer's events belong to.
    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    /// Compose an event whose timestamps are all the current time.
    pub fn compose_event_now(&self, data: BTreeMap<String, Value>) -> ModelResult<Event> {
        let time = now();
        let timestamps = data.keys().map(|k| (k.clone(), time)).collect();
        self.compose_event(data, timestamps, None)
    }

    /// Mint the next Event of this stream.
    ///
    /// `data` must cover exactly the declared data keys and `timestamps`
    /// must have the same keys. `filled` may only name external fields;
    /// external fields it omits start out pending.
    pub fn compose_event(
        &self,
        data: BTreeMap<String, Value>,
        timestamps: BTreeMap<String, f64>,
        filled: Option<BTreeMap<String, Filled>>,
    ) -> ModelResult<Event> {
        self.check_fields(data.keys(), timestamps.keys())?;
        let mut filled = filled.unwrap_or_default();
        self.check_filled(filled.keys())?;
        for key in self.descriptor.external_keys() {
            filled.entry(key.to_string()).or_default();
        }

        let mut state = self.state.lock();
        state.run_uid()?;
        let seq_num = self.last_seq(&state)? + 1;
        let event = validated(
            self.validator.as_ref(),
            Event {
                uid: new_uid(),
                time: now(),
                descriptor: self.descriptor.uid.clone(),
                seq_num,
                data,
                timestamps,
                filled,
            },
        )?;
        self.advance(&mut state, 1)?;
        Ok(event)
    }

    /// Mint an EventPage of N consecutive events in one step.
    pub fn compose_event_page(
        &self,
        data: BTreeMap<String, Vec<Value>>,
        timestamps: BTreeMap<String, Vec<f64>>,
        filled: Option<BTreeMap<String, Vec<Filled>>>,
    ) -> ModelResult<EventPage> {
        self.check_fields(data.keys(), timestamps.keys())?;
        let mut filled = filled.unwrap_or_default();
        self.check_filled(filled.keys())?;

        let rows = column_length(
            data.iter()
                .map(|(k, v)| (k.as_str(), v.len()))
                .chain(timestamps.iter().map(|(k, v)| (k.as_str(), v.len())))
                .chain(filled.iter().map(|(k, v)| (k.as_str(), v.len()))),
        )?
        .ok_or(EventModelError::EmptyPage(DocumentKind::Event))?;
        for key in self.descriptor.external_keys() {
            filled
                .entry(key.to_string())
                .or_insert_with(|| vec![Filled::default(); rows]);
        }

        let mut state = self.state.lock();
        state.run_uid()?;
        let first = self.last_seq(&state)? + 1;
        let time = now();
        let page = validated(
            self.validator.as_ref(),
            EventPage {
                uid: (0..rows).map(|_| new_uid()).collect(),
                time: vec![time; rows],
                descriptor: self.descriptor.uid.clone(),
                seq_num: (first..first + rows as u64).collect(),
                data,
                timestamps,
                filled,
            },
        )?;
        self.advance(&mut state, rows as u64)?;
        Ok(page)
    }

    fn check_fields<'a>(
        &self,
        data: impl Iterator<Item = &'a String>,
        timestamps: impl Iterator<Item = &'a String>,
    ) -> ModelResult<()> {
        let data: BTreeSet<&String> = data.collect();
        if let Some(field) = data.iter().find(|k| !self.descriptor.data_keys.contains_key(**k)) {
            return Err(EventModelError::UndeclaredField {
                stream: self.descriptor.name.clone(),
                field: field.to_string(),
            });
        }
        let missing: Vec<&String> = self
            .descriptor
            .data_keys
            .keys()
            .filter(|k| !data.contains(k))
            .collect();
        if !missing.is_empty() {
            return Err(EventModelError::MismatchedDataKeys(format!(
                "stream '{}' is missing data for {missing:?}",
                self.descriptor.name
            )));
        }
        let timestamps: BTreeSet<&String> = timestamps.collect();
        if timestamps != data {
            return Err(EventModelError::MismatchedDataKeys(format!(
                "timestamps keys {timestamps:?} do not match data keys {data:?}"
            )));
        }
        Ok(())
    }

    fn check_filled<'a>(&self, mut filled: impl Iterator<Item = &'a String>) -> ModelResult<()> {
        let bad = filled.find(|key| {
            !self
                .descriptor
                .data_keys
                .get(*key)
                .is_some_and(DataKey::is_external)
        });
        match bad {
            Some(key) => Err(EventModelError::InvalidDocument(format!(
                "filled names '{key}', which is not an external field of stream '{}'",
                self.descriptor.name
            ))),
            None => Ok(()),
        }
    }

    fn last_seq(&self, state: &RunState) -> ModelResult<u64> {
        state
            .streams
            .get(&self.descriptor.name)
            .map(|stream| stream.last_seq)
            .ok_or_else(|| EventModelError::UnresolvableForeignKey {
                key: self.descriptor.uid.clone(),
                message: format!("stream '{}' is not declared", self.descriptor.name),
            })
    }

    fn advance(&self, state: &mut RunState, by: u64) -> ModelResult<()> {
        match state.streams.get_mut(&self.descriptor.name) {
            Some(stream) => {
                stream.last_seq += by;
                Ok(())
            }
            None => Err(EventModelError::UnresolvableForeignKey {
                key: self.descriptor.uid.clone(),
                message: format!("stream '{}' is not declared", self.descriptor.name),
            }),
        }
    }
}

/// Row count shared by every column, `None` when there are no rows at all.
fn column_length<'a>(
    columns: impl Iterator<Item = (&'a str, usize)>,
) -> ModelResult<Option<usize>> {
    let mut expected: Option<usize> = None;
    for (column, found) in columns {
        match expected {
            None => expected = Some(found),
            Some(expected) if expected != found => {
                return Err(EventModelError::RaggedPage {
                    column: column.to_string(),
                    expected,
                    found,
                })
            }
            Some(_) => {}
        }
    }
    Ok(expected.filter(|rows| *rows > 0))
}

/// Datum factory for one Resource. Ids are `<resource uid>/<n>`, n from 0.
pub struct DatumComposer {
    state: SharedState,
    validator: Option<SharedValidator>,
    resource: String,
    next: u64,
}

impl DatumComposer {
    /// Uid of the Resource the datum refer to.
    pub fn resource_uid(&self) -> &str {
        &self.resource
    }

    /// Mint the next Datum; ids count up from `<resource uid>/0`.
    pub fn compose_datum(&mut self, datum_kwargs: Kwargs) -> ModelResult<Datum> {
        self.state.lock().run_uid()?;
        let datum = validated(
            self.validator.as_ref(),
            Datum {
                datum_id: format!("{}/{}", self.resource, self.next),
                resource: self.resource.clone(),
                datum_kwargs,
            },
        )?;
        self.next += 1;
        Ok(datum)
    }

    /// Mint N datum at once from per-key columns.
    pub fn compose_datum_page(
        &mut self,
        datum_kwargs: BTreeMap<String, Vec<Value>>,
    ) -> ModelResult<DatumPage> {
        self.state.lock().run_uid()?;
        let rows = column_length(datum_kwargs.iter().map(|(k, v)| (k.as_str(), v.len())))?
            .ok_or(EventModelError::EmptyPage(DocumentKind::Datum))?;
        let datum: Vec<Datum> = (0..rows)
            .map(|row| Datum {
                datum_id: format!("{}/{}", self.resource, self.next + row as u64),
                resource: self.resource.clone(),
                datum_kwargs: datum_kwargs
                    .iter()
                    .map(|(k, column)| (k.clone(), column[row].clone()))
                    .collect(),
            })
            .collect();
        let page = validated(self.validator.as_ref(), pack_datum_page(&datum)?)?;
        self.next += rows as u64;
        Ok(page)
    }
}

/// StreamDatum factory for one StreamResource.
///
/// Block indices advance by one per StreamDatum and event offsets by the
/// number of events each block covers.
pub struct StreamDatumComposer {
    state: SharedState,
    validator: Option<SharedValidator>,
    stream_resource: String,
    next_block: u64,
    next_offset: u64,
}

impl StreamDatumComposer {
    /// Uid of the StreamResource the blocks belong to.
    pub fn stream_resource_uid(&self) -> &str {
        &self.stream_resource
    }

    /// Mint the next block of `stream_name`, covering `event_count` events.
    ///
    /// The stream must have been declared on this run.
    pub fn compose_stream_datum(
        &mut self,
        stream_name: &str,
        datum_kwargs: Kwargs,
        event_count: u64,
    ) -> ModelResult<StreamDatum> {
        {
            let state = self.state.lock();
            state.run_uid()?;
            if !state.streams.contains_key(stream_name) {
                return Err(EventModelError::UnresolvableForeignKey {
                    key: stream_name.to_string(),
                    message: "StreamDatum names a stream that was never declared".to_string(),
                });
            }
        }
        let datum = validated(
            self.validator.as_ref(),
            StreamDatum {
                uid: format!("{}/{}", self.stream_resource, self.next_block),
                stream_resource: self.stream_resource.clone(),
                stream_name: stream_name.to_string(),
                block_idx: self.next_block,
                event_count,
                event_offset: self.next_offset,
                datum_kwargs,
            },
        )?;
        self.next_block += 1;
        self.next_offset += event_count;
        Ok(datum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validate::SchemaValidator;
    use serde_json::json;

    fn scalar_keys() -> BTreeMap<String, DataKey> {
        BTreeMap::from([("x".to_string(), DataKey::scalar("motor"))])
    }

    fn image_keys() -> BTreeMap<String, DataKey> {
        BTreeMap::from([
            ("img".to_string(), DataKey::array("cam", vec![5, 5]).with_external("FILESTORE:")),
            ("x".to_string(), DataKey::scalar("motor")),
        ])
    }

    fn x(value: i64) -> BTreeMap<String, Value> {
        BTreeMap::from([("x".to_string(), json!(value))])
    }

    #[test]
    fn test_seq_num_counts_from_one() {
        let run = RunComposer::new();
        let start = run.open_run(Kwargs::new()).unwrap();
        let (descriptor, events) = run.declare_stream("primary", scalar_keys()).unwrap();
        assert_eq!(descriptor.run_start, start.uid);

        let first = events.compose_event_now(x(1)).unwrap();
        let second = events.compose_event_now(x(2)).unwrap();
        assert_eq!((first.seq_num, second.seq_num), (1, 2));
        assert_eq!(first.descriptor, second.descriptor);
        assert_eq!(first.data, x(1));
        assert_eq!(second.data, x(2));
        assert!(first.filled.is_empty());
    }

    #[test]
    fn test_redeclare_shares_counter() {
        let run = RunComposer::new();
        run.open_run(Kwargs::new()).unwrap();
        let (d1, a) = run.declare_stream("primary", scalar_keys()).unwrap();
        let (d2, b) = run.declare_stream("primary", scalar_keys()).unwrap();
        assert_eq!(d1.uid, d2.uid);
        a.compose_event_now(x(1)).unwrap();
        assert_eq!(b.compose_event_now(x(2)).unwrap().seq_num, 2);
    }

    #[test]
    fn test_redeclare_with_other_keys_conflicts() {
        let run = RunComposer::new();
        run.open_run(Kwargs::new()).unwrap();
        run.declare_stream("primary", scalar_keys()).unwrap();
        let err = run.declare_stream("primary", image_keys()).err().unwrap();
        assert!(matches!(err, EventModelError::StreamConflict { ref name, .. } if name == "primary"));
    }

    #[test]
    fn test_undeclared_field() {
        let run = RunComposer::new();
        run.open_run(Kwargs::new()).unwrap();
        let (_, events) = run.declare_stream("primary", scalar_keys()).unwrap();
        let mut data = x(1);
        data.insert("y".into(), json!(2));
        let err = events.compose_event_now(data).unwrap_err();
        assert!(matches!(err, EventModelError::UndeclaredField { ref field, .. } if field == "y"));
        // A rejected event does not consume a seq_num.
        assert_eq!(events.compose_event_now(x(1)).unwrap().seq_num, 1);
    }

    #[test]
    fn test_timestamps_must_match_data() {
        let run = RunComposer::new();
        run.open_run(Kwargs::new()).unwrap();
        let (_, events) = run.declare_stream("primary", scalar_keys()).unwrap();
        let err = events.compose_event(x(1), BTreeMap::new(), None).unwrap_err();
        assert!(matches!(err, EventModelError::MismatchedDataKeys(_)));
    }

    #[test]
    fn test_external_fields_start_pending() {
        let run = RunComposer::new();
        run.open_run(Kwargs::new()).unwrap();
        let (_, events) = run.declare_stream("primary", image_keys()).unwrap();
        let mut data = x(1);
        data.insert("img".into(), json!("res/0"));
        let event = events.compose_event_now(data.clone()).unwrap();
        assert_eq!(event.filled, BTreeMap::from([("img".to_string(), Filled::Flag(false))]));

        let timestamps = data.keys().map(|k| (k.clone(), 0.0)).collect();
        let bad = BTreeMap::from([("x".to_string(), Filled::Flag(true))]);
        assert!(events.compose_event(data, timestamps, Some(bad)).is_err());
    }

    #[test]
    fn test_event_page() {
        let run = RunComposer::new();
        run.open_run(Kwargs::new()).unwrap();
        let (_, events) = run.declare_stream("primary", scalar_keys()).unwrap();
        events.compose_event_now(x(0)).unwrap();
        let page = events
            .compose_event_page(
                BTreeMap::from([("x".to_string(), vec![json!(1), json!(2), json!(3)])]),
                BTreeMap::from([("x".to_string(), vec![0.0, 0.1, 0.2])]),
                None,
            )
            .unwrap();
        assert_eq!(page.seq_num, vec![2, 3, 4]);
        assert_eq!(events.compose_event_now(x(5)).unwrap().seq_num, 5);

        let ragged = events.compose_event_page(
            BTreeMap::from([("x".to_string(), vec![json!(1)])]),
            BTreeMap::from([("x".to_string(), vec![0.0, 0.1])]),
            None,
        );
        assert!(matches!(ragged, Err(EventModelError::RaggedPage { .. })));
    }

    #[test]
    fn test_datum_ids_and_pages() {
        let run = RunComposer::new();
        run.open_run(Kwargs::new()).unwrap();
        let (resource, mut datum) = run
            .compose_resource("AD_HDF5", "/data", "scan.h5", Kwargs::new())
            .unwrap();
        let d0 = datum.compose_datum(Kwargs::new()).unwrap();
        assert_eq!(d0.datum_id, format!("{}/0", resource.uid));
        let page = datum
            .compose_datum_page(BTreeMap::from([("frame".to_string(), vec![json!(1), json!(2)])]))
            .unwrap();
        assert_eq!(
            page.datum_id,
            vec![format!("{}/1", resource.uid), format!("{}/2", resource.uid)]
        );
        assert_eq!(
            datum.compose_datum(Kwargs::new()).unwrap().datum_id,
            format!("{}/3", resource.uid)
        );
    }

    #[test]
    fn test_stream_datum_blocks() {
        let run = RunComposer::new();
        run.open_run(Kwargs::new()).unwrap();
        run.declare_stream("primary", image_keys()).unwrap();
        let (sr, mut blocks) = run
            .compose_stream_resource("AD_HDF5_SWMR", "/data", "stream.h5", "img", Kwargs::new())
            .unwrap();
        let b0 = blocks.compose_stream_datum("primary", Kwargs::new(), 10).unwrap();
        let b1 = blocks.compose_stream_datum("primary", Kwargs::new(), 5).unwrap();
        assert_eq!(b0.uid, format!("{}/0", sr.uid));
        assert_eq!((b1.block_idx, b1.event_offset), (1, 10));
        assert!(blocks.compose_stream_datum("baseline", Kwargs::new(), 1).is_err());
    }

    #[test]
    fn test_stop_lifecycle() {
        let run = RunComposer::new();
        assert!(matches!(
            run.compose_stop(ExitStatus::Success, None),
            Err(EventModelError::RunNotOpen)
        ));
        run.open_run(Kwargs::new()).unwrap();
        assert!(matches!(
            run.open_run(Kwargs::new()),
            Err(EventModelError::RunAlreadyOpen(_))
        ));
        let (_, events) = run.declare_stream("primary", scalar_keys()).unwrap();
        events.compose_event_now(x(1)).unwrap();
        events.compose_event_now(x(2)).unwrap();

        let stop = run.compose_stop(ExitStatus::Abort, Some("user pressed stop")).unwrap();
        assert_eq!(stop.num_events["primary"], 2);
        assert_eq!(stop.reason, "user pressed stop");
        assert!(run.is_stopped());

        let again = run.compose_stop(ExitStatus::Success, None).unwrap_err();
        assert!(again.is_identity_error());
        assert!(matches!(
            events.compose_event_now(x(3)),
            Err(EventModelError::RunAlreadyStopped(_))
        ));
    }

    #[test]
    fn test_reserved_metadata() {
        let run = RunComposer::new();
        let metadata = json!({"uid": "mine"}).as_object().cloned().unwrap();
        assert!(matches!(
            run.open_run(metadata),
            Err(EventModelError::InvalidDocument(_))
        ));
    }

    #[test]
    fn test_validator_sees_every_document() {
        struct NoAborts;
        impl SchemaValidator for NoAborts {
            fn validate(&self, kind: DocumentKind, body: &Value) -> Result<(), String> {
                if kind == DocumentKind::Stop && body["exit_status"] == "abort" {
                    return Err("aborts are not allowed here".into());
                }
                Ok(())
            }
        }

        let run = RunComposer::new().with_validator(Arc::new(NoAborts));
        run.open_run(Kwargs::new()).unwrap();
        let err = run.compose_stop(ExitStatus::Abort, None).unwrap_err();
        assert!(matches!(err, EventModelError::SchemaValidation { kind: DocumentKind::Stop, .. }));
        assert!(!run.is_stopped());
        assert!(run.compose_stop(ExitStatus::Success, None).is_ok());
    }
}
