//! Helpers for tests and benches.
//!
//! [`FormBuilder`] writes multipart bodies, [`chunked`] and [`split_at`] cut
//! them into chunks, [`CollectingSink`] records envelopes and [`reassemble`]
//! folds envelopes back into whole fields.

use parking_lot::Mutex;

use crate::app::EnvelopeSink;
use crate::boundary::Boundary;
use crate::envelope::{OutputEnvelope, PreAction, StreamKey};
use crate::error::SinkError;

/// A field of a generated form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormField {
    pub name: String,
    pub file_name: Option<String>,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

/// Builds `multipart/form-data` bodies.
#[derive(Debug, Clone)]
pub struct FormBuilder {
    boundary: String,
    preamble: Vec<u8>,
    epilogue: Vec<u8>,
    fields: Vec<FormField>,
}

impl FormBuilder {
    /// Start a form delimited by `boundary`.
    #[must_use]
    pub fn new(boundary: impl Into<String>) -> Self {
        Self {
            boundary: boundary.into(),
            preamble: Vec::new(),
            epilogue: Vec::new(),
            fields: Vec::new(),
        }
    }

    /// Add a plain field.
    #[must_use]
    pub fn field(mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.fields.push(FormField {
            name: name.into(),
            file_name: None,
            content_type: None,
            body: value.into(),
        });
        self
    }

    /// Add a file field.
    #[must_use]
    pub fn file(
        mut self,
        name: impl Into<String>,
        file_name: impl Into<String>,
        content_type: impl Into<String>,
        body: impl Into<Vec<u8>>,
    ) -> Self {
        self.fields.push(FormField {
            name: name.into(),
            file_name: Some(file_name.into()),
            content_type: Some(content_type.into()),
            body: body.into(),
        });
        self
    }

    /// Bytes before the first delimiter.
    #[must_use]
    pub fn preamble(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.preamble = bytes.into();
        self
    }

    /// Bytes after the closing delimiter.
    #[must_use]
    pub fn epilogue(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.epilogue = bytes.into();
        self
    }

    /// The fields added so far.
    #[must_use]
    pub fn fields(&self) -> &[FormField] {
        &self.fields
    }

    /// The `Content-Type` header value announcing the boundary.
    #[must_use]
    pub fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }

    /// The parsed boundary.
    pub fn boundary(&self) -> Result<Boundary, crate::error::BoundaryError> {
        Boundary::new(self.boundary.as_bytes())
    }

    /// Render the body.
    #[must_use]
    pub fn build(&self) -> Vec<u8> {
        let mut out = self.preamble.clone();
        if !out.is_empty() {
            out.extend_from_slice(b"\r\n");
        }
        for field in &self.fields {
            out.extend_from_slice(b"--");
            out.extend_from_slice(self.boundary.as_bytes());
            out.extend_from_slice(b"\r\nContent-Disposition: form-data; name=\"");
            out.extend_from_slice(field.name.as_bytes());
            out.push(b'"');
            if let Some(file_name) = &field.file_name {
                out.extend_from_slice(b"; filename=\"");
                out.extend_from_slice(file_name.as_bytes());
                out.push(b'"');
            }
            out.extend_from_slice(b"\r\n");
            if let Some(content_type) = &field.content_type {
                out.extend_from_slice(b"Content-Type: ");
                out.extend_from_slice(content_type.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
            out.extend_from_slice(b"\r\n");
            out.extend_from_slice(&field.body);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"--");
        out.extend_from_slice(self.boundary.as_bytes());
        out.extend_from_slice(b"--");
        if !self.epilogue.is_empty() {
            out.extend_from_slice(b"\r\n");
            out.extend_from_slice(&self.epilogue);
        }
        out
    }
}

/// Cut `data` into chunks of `size` bytes (the last one may be shorter).
#[must_use]
pub fn chunked(data: &[u8], size: usize) -> Vec<Vec<u8>> {
    data.chunks(size.max(1)).map(<[u8]>::to_vec).collect()
}

/// Cut `data` at the given offsets. Offsets are sorted, deduplicated and
/// clamped, so any list of numbers is accepted.
#[must_use]
pub fn split_at(data: &[u8], offsets: &[usize]) -> Vec<Vec<u8>> {
    let mut cuts: Vec<usize> = offsets.iter().map(|&o| o.min(data.len())).collect();
    cuts.sort_unstable();
    cuts.dedup();

    let mut out = Vec::with_capacity(cuts.len() + 1);
    let mut start = 0;
    for cut in cuts {
        if cut > start {
            out.push(data[start..cut].to_vec());
            start = cut;
        }
    }
    if start < data.len() || out.is_empty() {
        out.push(data[start..].to_vec());
    }
    out
}

/// Sink that records every envelope.
#[derive(Debug, Default)]
pub struct CollectingSink {
    envelopes: Mutex<Vec<OutputEnvelope>>,
}

impl CollectingSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything recorded so far.
    #[must_use]
    pub fn envelopes(&self) -> Vec<OutputEnvelope> {
        self.envelopes.lock().clone()
    }

    /// Remove and return everything recorded so far.
    #[must_use]
    pub fn take(&self) -> Vec<OutputEnvelope> {
        std::mem::take(&mut *self.envelopes.lock())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.envelopes.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.envelopes.lock().is_empty()
    }
}

impl EnvelopeSink for CollectingSink {
    fn forward(&self, envelope: OutputEnvelope) -> Result<(), SinkError> {
        self.envelopes.lock().push(envelope);
        Ok(())
    }
}

/// A field put back together from its envelopes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReassembledField {
    pub stream_key: StreamKey,
    pub form_name: String,
    pub file_name: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

/// Concatenate envelope bodies per stream, in order of first appearance.
///
/// The field-less `Finish` emitted when no field is left to close is skipped.
#[must_use]
pub fn reassemble(envelopes: &[OutputEnvelope]) -> Vec<ReassembledField> {
    let mut fields: Vec<ReassembledField> = Vec::new();
    for envelope in envelopes {
        if envelope.pre_action == PreAction::None && envelope.body.is_empty() {
            continue;
        }
        if let Some(field) = fields
            .iter_mut()
            .find(|f| f.stream_key == envelope.stream_key)
        {
            field.body.extend_from_slice(&envelope.body);
        } else {
            fields.push(ReassembledField {
                stream_key: envelope.stream_key,
                form_name: envelope.form_name.clone(),
                file_name: envelope.file_name.clone(),
                content_type: envelope.content_type.clone(),
                body: envelope.body.clone(),
            });
        }
    }
    fields
}
