//! Schema validation seam.
//!
//! Document schemas live outside this crate. Callers wrap whichever schema
//! library they use in a [`SchemaValidator`] and hand it to the composer or a
//! [`Dispatcher`](crate::router::Dispatcher); every document those produce is
//! checked before it is returned.

use crate::document::{Document, DocumentKind};
use crate::error::{EventModelError, ModelResult};
use serde_json::Value;
use std::sync::Arc;

/// Checks one serialized document body against the schema for its kind.
pub trait SchemaValidator: Send + Sync {
    /// Return `Err(detail)` when `body` does not conform.
    fn validate(&self, kind: DocumentKind, body: &Value) -> Result<(), String>;
}

/// Shared handle to a validator.
pub type SharedValidator = Arc<dyn SchemaValidator>;

/// Validator that accepts every document.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl SchemaValidator for AcceptAll {
    fn validate(&self, _kind: DocumentKind, _body: &Value) -> Result<(), String> {
        Ok(())
    }
}

impl<F> SchemaValidator for F
where
    F: Fn(DocumentKind, &Value) -> Result<(), String> + Send + Sync,
{
    fn validate(&self, kind: DocumentKind, body: &Value) -> Result<(), String> {
        self(kind, body)
    }
}

/// Serialize `doc` and run it through `validator`.
pub fn check(validator: &dyn SchemaValidator, doc: &Document) -> ModelResult<()> {
    let kind = doc.kind();
    let body = doc.body()?;
    validator
        .validate(kind, &body)
        .map_err(|detail| EventModelError::SchemaValidation { kind, detail })
}

/// [`check`] against an optional validator.
pub(crate) fn check_optional(
    validator: Option<&SharedValidator>,
    doc: &Document,
) -> ModelResult<()> {
    match validator {
        Some(validator) => check(validator.as_ref(), doc),
        None => Ok(()),
    }
}
