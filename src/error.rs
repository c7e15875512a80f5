//! Error types for the document runtime.
//!
//! This module defines `EventModelError`, the single error type returned by the
//! composition engine, the page codec, the filler and both routers. It is built
//! with `thiserror` and grouped the same way callers are expected to react:
//!
//! - **Shape errors** (`InvalidDocument`, `SchemaValidation`, `MismatchedDataKeys`,
//!   `UndeclaredField`, `EmptyPage`, `RaggedPage`): the document is malformed. These are
//!   never repaired and never retried.
//! - **Sequence/identity errors** (`RunNotOpen`, `RunAlreadyOpen`, `RunAlreadyStopped`,
//!   `StreamConflict`, `DuplicateRun`, `DuplicateDescriptor`, `UnknownRun`,
//!   `SequenceOutOfOrder`, `SequenceGap`, `UnresolvableForeignKey`): the stream is
//!   inconsistent. Fatal at the point of detection.
//! - **Registry errors** (`DuplicateHandler`, `HandlerNotRegistered`, `DuplicateCoercion`,
//!   `UnknownCoercion`).
//! - **Resolution errors** (`UndefinedAssetSpecification`, `HandlerConstruction`,
//!   `DataNotAccessible`, `UnfilledData`, `FillerClosed`): external data could not be
//!   loaded. Transient failures have already been retried by the time these surface.
//! - **Configuration errors** (`Config`): a filler was built from settings that did not
//!   load or did not validate.
//!
//! Failures raised by handler implementations themselves are described by
//! [`HandlerError`](crate::handler::HandlerError) and wrapped into the resolution variants.

use crate::config::ConfigError;
use crate::document::DocumentKind;
use crate::handler::HandlerError;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type ModelResult<T> = std::result::Result<T, EventModelError>;

/// Every failure the document runtime can report.
#[derive(Error, Debug)]
pub enum EventModelError {
    #[error("Invalid document: {0}")]
    InvalidDocument(String),

    #[error("Schema validation failed for {kind} document: {detail}")]
    SchemaValidation { kind: DocumentKind, detail: String },

    #[error("Mismatched data keys: {0}")]
    MismatchedDataKeys(String),

    #[error("Field '{field}' is not declared in the data_keys of stream '{stream}'")]
    UndeclaredField { stream: String, field: String },

    #[error("Cannot pack an empty collection of {0} documents into a page")]
    EmptyPage(DocumentKind),

    #[error("Ragged page: column '{column}' has {found} rows, expected {expected}")]
    RaggedPage {
        column: String,
        expected: usize,
        found: usize,
    },

    #[error("Run has not been opened")]
    RunNotOpen,

    #[error("Run {0} is already open")]
    RunAlreadyOpen(String),

    #[error("Run {0} has already been stopped")]
    RunAlreadyStopped(String),

    #[error("Stream '{name}' was already declared with data_keys {existing:?}; requested {requested:?}")]
    StreamConflict {
        name: String,
        existing: Vec<String>,
        requested: Vec<String>,
    },

    #[error("Received a second start document for active run {0}")]
    DuplicateRun(String),

    #[error("Descriptor {0} was already received with different contents")]
    DuplicateDescriptor(String),

    #[error("Document refers to run {0}, which has no active start document")]
    UnknownRun(String),

    #[error("Event seq_num {found} for descriptor {descriptor} is not after {last}")]
    SequenceOutOfOrder {
        descriptor: String,
        last: u64,
        found: u64,
    },

    #[error("Event seq_num jumped from {last} to {found} for descriptor {descriptor}")]
    SequenceGap {
        descriptor: String,
        last: u64,
        found: u64,
    },

    #[error("Unresolvable reference to {key}: {message}")]
    UnresolvableForeignKey { key: String, message: String },

    #[error("A different handler is already registered for spec '{0}'")]
    DuplicateHandler(String),

    #[error("No handler registered for spec '{0}'")]
    HandlerNotRegistered(String),

    #[error("A different coercion is already registered under '{0}'")]
    DuplicateCoercion(String),

    #[error("Unknown coercion '{0}'")]
    UnknownCoercion(String),

    #[error("Resource {resource} refers to spec '{spec}', which is not in the handler registry")]
    UndefinedAssetSpecification { spec: String, resource: String },

    #[error("Could not construct handler for resource {resource} at {locator} after {attempts} attempt(s)")]
    HandlerConstruction {
        resource: String,
        locator: String,
        attempts: u32,
        #[source]
        source: HandlerError,
    },

    #[error("Could not load data for datum {datum_id} of resource {resource} after {attempts} attempt(s)")]
    DataNotAccessible {
        datum_id: String,
        resource: String,
        attempts: u32,
        #[source]
        source: HandlerError,
    },

    #[error("Unfilled data found in fields {0:?}")]
    UnfilledData(Vec<String>),

    #[error("This filler has been closed and is no longer usable")]
    FillerClosed,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl EventModelError {
    /// The offending key for reference and spec lookups, if any.
    pub fn key(&self) -> Option<&str> {
        match self {
            EventModelError::UnresolvableForeignKey { key, .. } => Some(key),
            EventModelError::UndefinedAssetSpecification { spec, .. } => Some(spec),
            EventModelError::UnknownRun(uid)
            | EventModelError::DuplicateRun(uid)
            | EventModelError::DuplicateDescriptor(uid) => Some(uid),
            _ => None,
        }
    }

    /// True for errors that describe an inconsistent document stream.
    pub fn is_identity_error(&self) -> bool {
        matches!(
            self,
            EventModelError::RunNotOpen
                | EventModelError::RunAlreadyOpen(_)
                | EventModelError::RunAlreadyStopped(_)
                | EventModelError::StreamConflict { .. }
                | EventModelError::DuplicateRun(_)
                | EventModelError::DuplicateDescriptor(_)
                | EventModelError::UnknownRun(_)
                | EventModelError::SequenceOutOfOrder { .. }
                | EventModelError::SequenceGap { .. }
                | EventModelError::UnresolvableForeignKey { .. }
        )
    }
}
