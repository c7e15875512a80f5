//! Document model for structured experiment data.
//!
//! Documents are plain records with no behaviour beyond their shape. They
//! serialize to the JSON-compatible event-model wire format:
//!
//! - **Start**: run identity and free-form metadata
//! - **Descriptor**: schema of one named data stream
//! - **Event** / **EventPage**: measurements, one row or a column batch
//! - **Resource** / **Datum** / **DatumPage**: references to externally stored data
//! - **StreamResource** / **StreamDatum**: references to externally stored streams
//! - **Stop**: completion status and per-stream event counts
//!
//! # Document Flow
//!
//! ```text
//! Start (1)
//!    │
//!    ├── Descriptor (1+, one per stream)
//!    │       │
//!    │       └── Event / EventPage (N)
//!    │
//!    ├── Resource (0+) ── Datum / DatumPage (N)
//!    ├── StreamResource (0+) ── StreamDatum (N)
//!    │
//! Stop (1)
//! ```
//!
//! On the wire each document travels inside an envelope naming its kind:
//!
//! ```json
//! {"name": "event", "doc": {"uid": "...", "descriptor": "...", ...}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Free-form keyword arguments and metadata.
pub type Kwargs = Map<String, Value>;

/// Generate a new unique document ID
pub fn new_uid() -> String {
    Uuid::new_v4().to_string()
}

/// Current time as UNIX epoch seconds
pub fn now() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1e6
}

/// Closed set of document kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    /// [`Start`]
    Start,
    /// [`Descriptor`]
    Descriptor,
    /// [`Event`]
    Event,
    /// [`EventPage`]
    EventPage,
    /// [`Resource`]
    Resource,
    /// [`Datum`]
    Datum,
    /// [`DatumPage`]
    DatumPage,
    /// [`StreamResource`]
    StreamResource,
    /// [`StreamDatum`]
    StreamDatum,
    /// [`Stop`]
    Stop,
}

impl DocumentKind {
    /// Wire name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentKind::Start => "start",
            DocumentKind::Descriptor => "descriptor",
            DocumentKind::Event => "event",
            DocumentKind::EventPage => "event_page",
            DocumentKind::Resource => "resource",
            DocumentKind::Datum => "datum",
            DocumentKind::DatumPage => "datum_page",
            DocumentKind::StreamResource => "stream_resource",
            DocumentKind::StreamDatum => "stream_datum",
            DocumentKind::Stop => "stop",
        }
    }
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A document together with its kind tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "doc", rename_all = "snake_case")]
pub enum Document {
    /// Opens a run
    Start(Start),
    /// Declares a stream
    Descriptor(Descriptor),
    /// One row of a stream
    Event(Event),
    /// Rows of a stream, by column
    EventPage(EventPage),
    /// Locates external data
    Resource(Resource),
    /// One reference into a Resource
    Datum(Datum),
    /// References into a Resource, by column
    DatumPage(DatumPage),
    /// Locates an external stream
    StreamResource(StreamResource),
    /// One block of an external stream
    StreamDatum(StreamDatum),
    /// Closes a run
    Stop(Stop),
}

impl Document {
    /// The kind tag of this document.
    pub fn kind(&self) -> DocumentKind {
        match self {
            Document::Start(_) => DocumentKind::Start,
            Document::Descriptor(_) => DocumentKind::Descriptor,
            Document::Event(_) => DocumentKind::Event,
            Document::EventPage(_) => DocumentKind::EventPage,
            Document::Resource(_) => DocumentKind::Resource,
            Document::Datum(_) => DocumentKind::Datum,
            Document::DatumPage(_) => DocumentKind::DatumPage,
            Document::StreamResource(_) => DocumentKind::StreamResource,
            Document::StreamDatum(_) => DocumentKind::StreamDatum,
            Document::Stop(_) => DocumentKind::Stop,
        }
    }

    /// Serialize just the inner record, without the envelope.
    pub fn body(&self) -> serde_json::Result<Value> {
        match self {
            Document::Start(d) => serde_json::to_value(d),
            Document::Descriptor(d) => serde_json::to_value(d),
            Document::Event(d) => serde_json::to_value(d),
            Document::EventPage(d) => serde_json::to_value(d),
            Document::Resource(d) => serde_json::to_value(d),
            Document::Datum(d) => serde_json::to_value(d),
            Document::DatumPage(d) => serde_json::to_value(d),
            Document::StreamResource(d) => serde_json::to_value(d),
            Document::StreamDatum(d) => serde_json::to_value(d),
            Document::Stop(d) => serde_json::to_value(d),
        }
    }
}

/// Start document - emitted at the beginning of a run
///
/// Anything beyond `uid` and `time` is caller metadata and is flattened into
/// the same record on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Start {
    /// Unique run identifier
    pub uid: String,
    /// UNIX epoch seconds
    pub time: f64,
    /// User-provided metadata (plan name, sample, operator, ...)
    #[serde(flatten)]
    pub metadata: Kwargs,
}

/// Schema for a data field within events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataKey {
    /// Data type: "number", "integer", "string", "array", "boolean"
    pub dtype: String,
    /// Shape for arrays (empty for scalars)
    pub shape: Vec<i64>,
    /// Where the data came from (device/PV name)
    pub source: String,
    /// Marks the field as externally stored. Only its presence matters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<String>,
    /// Physical units
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
    /// Display precision
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precision: Option<i64>,
    /// Name of the device object that produced the field
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_name: Option<String>,
    /// Anything else the producer recorded
    #[serde(flatten)]
    pub extra: Kwargs,
}

impl DataKey {
    /// Create a scalar number data key
    pub fn scalar(source: &str) -> Self {
        Self::new("number", vec![], source)
    }

    /// Create an array data key
    pub fn array(source: &str, shape: Vec<i64>) -> Self {
        Self::new("array", shape, source)
    }

    /// Create a data key with an explicit dtype.
    pub fn new(dtype: &str, shape: Vec<i64>, source: &str) -> Self {
        Self {
            dtype: dtype.to_string(),
            shape,
            source: source.to_string(),
            external: None,
            units: None,
            precision: None,
            object_name: None,
            extra: Kwargs::new(),
        }
    }

    /// Mark the field as stored outside the event (e.g. `"FILESTORE:"`).
    pub fn with_external(mut self, marker: &str) -> Self {
        self.external = Some(marker.to_string());
        self
    }

    /// Set the physical units.
    pub fn with_units(mut self, units: &str) -> Self {
        self.units = Some(units.to_string());
        self
    }

    /// Presence-only check of the external marker; its content is ignored.
    pub fn is_external(&self) -> bool {
        self.external.is_some()
    }
}

/// Descriptor document - defines schema for event data
///
/// A run can have several descriptors (e.g. "primary" for main data,
/// "baseline" for background readings).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    /// Unique descriptor identifier
    pub uid: String,
    /// UNIX epoch seconds
    pub time: f64,
    /// Links to Start
    pub run_start: String,
    /// Stream name
    pub name: String,
    /// Schema of every field in the stream's events
    pub data_keys: BTreeMap<String, DataKey>,
    /// Device configuration at descriptor creation time
    #[serde(default)]
    pub configuration: Kwargs,
    /// Display hints for viewers
    #[serde(default)]
    pub hints: Kwargs,
    /// Device name to the data keys it produces
    #[serde(default)]
    pub object_keys: Kwargs,
}

impl Descriptor {
    /// Names of fields whose data is stored externally.
    pub fn external_keys(&self) -> impl Iterator<Item = &str> {
        self.data_keys
            .iter()
            .filter(|(_, key)| key.is_external())
            .map(|(name, _)| name.as_str())
    }
}

/// Fill state of one externally stored field.
///
/// `Flag(false)` means the data slot still holds a placeholder. After filling
/// the slot records the datum id that was resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Filled {
    /// `false` until filled; `true` when filled without a recorded id
    Flag(bool),
    /// Filled from this datum id
    Datum(String),
}

impl Filled {
    /// True while the placeholder has not been resolved.
    pub fn is_pending(&self) -> bool {
        matches!(self, Filled::Flag(false))
    }
}

impl Default for Filled {
    fn default() -> Self {
        Filled::Flag(false)
    }
}

/// Event document - one row of measurements
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique event identifier
    pub uid: String,
    /// UNIX epoch seconds
    pub time: f64,
    /// Links to Descriptor that defines schema
    pub descriptor: String,
    /// Sequence number within this descriptor, starting at 1
    pub seq_num: u64,
    /// Field values, or datum ids for unfilled external fields
    pub data: BTreeMap<String, Value>,
    /// Per-field acquisition times
    pub timestamps: BTreeMap<String, f64>,
    /// Fill state of external fields
    #[serde(default)]
    pub filled: BTreeMap<String, Filled>,
}

/// EventPage document - a column batch of events from one descriptor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPage {
    /// One uid per row
    pub uid: Vec<String>,
    /// One time per row
    pub time: Vec<f64>,
    /// Shared by every row
    pub descriptor: String,
    /// One sequence number per row
    pub seq_num: Vec<u64>,
    /// Columns of field values
    pub data: BTreeMap<String, Vec<Value>>,
    /// Columns of acquisition times
    pub timestamps: BTreeMap<String, Vec<f64>>,
    /// Columns of fill state
    #[serde(default)]
    pub filled: BTreeMap<String, Vec<Filled>>,
}

impl EventPage {
    /// Number of rows in the page.
    pub fn len(&self) -> usize {
        self.uid.len()
    }

    /// True when the page has no rows.
    pub fn is_empty(&self) -> bool {
        self.uid.is_empty()
    }
}

/// Rules for joining `root` and `resource_path`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PathSemantics {
    /// Slash separated
    Posix,
    /// Backslash separated, with drive prefixes
    Windows,
}

impl Default for PathSemantics {
    fn default() -> Self {
        if cfg!(windows) {
            PathSemantics::Windows
        } else {
            PathSemantics::Posix
        }
    }
}

/// Resource document - locates a collection of externally stored data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    /// Unique resource identifier
    pub uid: String,
    /// Identifies the storage format and hence the handler
    pub spec: String,
    /// Local, non-semantic part of the path (may be remapped)
    pub root: String,
    /// Path below `root`
    pub resource_path: String,
    /// Arguments for constructing the handler
    pub resource_kwargs: Kwargs,
    /// How `root` and `resource_path` are joined
    #[serde(default)]
    pub path_semantics: PathSemantics,
    /// Owning run, absent for resources minted before the run was known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_start: Option<String>,
}

/// Datum document - arguments for reading one quantum of data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Datum {
    /// Conventionally `<resource uid>/<n>`
    pub datum_id: String,
    /// Links to Resource
    pub resource: String,
    /// Arguments passed to the handler's `resolve`
    pub datum_kwargs: Kwargs,
}

/// DatumPage document - a column batch of datum from one resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatumPage {
    /// One datum id per row
    pub datum_id: Vec<String>,
    /// Shared by every row
    pub resource: String,
    /// Columns of handler arguments
    pub datum_kwargs: BTreeMap<String, Vec<Value>>,
}

impl DatumPage {
    /// Number of rows in the page.
    pub fn len(&self) -> usize {
        self.datum_id.len()
    }

    /// True when the page has no rows.
    pub fn is_empty(&self) -> bool {
        self.datum_id.is_empty()
    }
}

/// StreamResource document - locates an externally stored data stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamResource {
    /// Unique stream resource identifier
    pub uid: String,
    /// Storage format
    pub spec: String,
    /// Local, non-semantic part of the path (may be remapped)
    pub root: String,
    /// Path below `root`
    pub resource_path: String,
    /// Arguments for opening the stream
    pub resource_kwargs: Kwargs,
    /// Which descriptor data key is being streamed
    pub data_key: String,
    /// How `root` and `resource_path` are joined
    #[serde(default)]
    pub path_semantics: PathSemantics,
    /// Owning run, absent when not known at creation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_start: Option<String>,
}

/// StreamDatum document - one block of a stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamDatum {
    /// Conventionally `<stream resource uid>/<block_idx>`
    pub uid: String,
    /// Links to StreamResource
    pub stream_resource: String,
    /// Stream (Descriptor name) the block belongs to
    pub stream_name: String,
    /// Contiguous block order within the stream
    pub block_idx: u64,
    /// Events covered by this block
    pub event_count: u64,
    /// Index of the first event in this block, counted from 0 across the stream
    pub event_offset: u64,
    /// Block-specific read arguments
    pub datum_kwargs: Kwargs,
}

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExitStatus {
    /// Completed normally
    Success,
    /// Stopped on request
    Abort,
    /// Stopped by an error
    Fail,
}

/// Stop document - emitted at the end of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stop {
    /// Unique stop identifier
    pub uid: String,
    /// UNIX epoch seconds
    pub time: f64,
    /// Links to Start
    pub run_start: String,
    /// How the run ended
    pub exit_status: ExitStatus,
    /// Reason for abort/failure
    #[serde(default)]
    pub reason: String,
    /// Events emitted, per stream name
    pub num_events: BTreeMap<String, u64>,
}

macro_rules! impl_from_doc {
    ($($variant:ident),*) => {
        $(
            impl From<$variant> for Document {
                fn from(doc: $variant) -> Self {
                    Document::$variant(doc)
                }
            }
        )*
    };
}

impl_from_doc!(
    Start,
    Descriptor,
    Event,
    EventPage,
    Resource,
    Datum,
    DatumPage,
    StreamResource,
    StreamDatum,
    Stop
);
