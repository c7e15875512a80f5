//! Core library for the event-model document stream.
//!
//! Experiments publish a run as a stream of small JSON-compatible documents:
//! a Start, Descriptors for each stream, Events (or columnar EventPages) of
//! readings, Resources and Datum pointing at externally stored payloads, and
//! a Stop. This crate contains the document types, the page codec, the
//! composers that produce valid streams, and the routers and filler that
//! consume them.
//!
//! - [`document`]: the ten document kinds and the tagged envelope
//! - [`page`]: conversion between single documents and pages
//! - [`compose`]: run, stream and datum composers
//! - [`router`]: per-kind dispatch with page/single conversion
//! - [`run_router`]: fan-out of a merged stream to per-run consumers
//! - [`filler`]: replacement of external placeholders with payloads
//! - [`handler`] and [`cache`]: handler registries and the shared instance pool

pub mod cache;
pub mod compose;
pub mod config;
pub mod document;
pub mod error;
pub mod filler;
pub mod handler;
pub mod page;
pub mod retry;
pub mod router;
pub mod run_router;
pub mod validate;

pub use cache::{HandlerPool, SharedHandlerPool};
pub use compose::{DatumComposer, EventComposer, RunComposer, StreamDatumComposer, StreamOptions};
pub use config::{ConfigError, FillerConfig, RetryConfig};
pub use document::{
    Datum, DatumPage, DataKey, Descriptor, Document, DocumentKind, Event, EventPage, ExitStatus,
    Filled, Kwargs, Resource, Start, Stop, StreamDatum, StreamResource,
};
pub use error::{EventModelError, ModelResult};
pub use filler::{verify_filled, FillMode, Filler};
pub use handler::{
    coercion_fn, factory_fn, CoercionRegistry, Handler, HandlerError, HandlerFactory,
    HandlerRegistry,
};
pub use page::{
    merge_datum_pages, merge_event_pages, pack_datum_page, pack_event_page, rechunk_datum_pages,
    rechunk_event_pages, unpack_datum_page, unpack_event_page,
};
pub use retry::RetryPolicy;
pub use router::{dispatch, Dispatcher, DocumentCallback, DocumentRouter, Routed, SingleRunRouter};
pub use run_router::{for_stream, FactoryOutput, RunRouter};
pub use validate::SchemaValidator;
