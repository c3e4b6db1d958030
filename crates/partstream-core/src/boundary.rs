//! Multipart boundary handling.
//!
//! A [`Boundary`] is the `{prefix, root}` pair announced by the request's
//! `Content-Type`. The literal delimiter inside the body is `prefix ++ root`,
//! and every delimiter after the first is preceded by a CRLF. The combined
//! `CRLF ++ delimiter` sequence is called the *marker*; it is what the scanner
//! and the ledger match when a delimiter straddles two chunks.

use crate::error::BoundaryError;

/// RFC 2046 recommends multipart boundary length <= 70 characters.
pub const MAX_BOUNDARY_LEN: usize = 70;

/// Delimiter prefix used by HTTP multipart bodies.
pub const DEFAULT_PREFIX: &[u8] = b"--";

pub(crate) const CRLF: &[u8] = b"\r\n";

/// The delimiter of one upload.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Boundary {
    prefix: Vec<u8>,
    root: Vec<u8>,
    marker: Vec<u8>,
}

impl Boundary {
    /// Create a boundary with the standard `--` prefix.
    pub fn new(root: impl Into<Vec<u8>>) -> Result<Self, BoundaryError> {
        Self::with_prefix(DEFAULT_PREFIX.to_vec(), root)
    }

    /// Create a boundary with a custom prefix.
    ///
    /// Neither half may contain CR or LF, and the root must be non-empty and
    /// no longer than [`MAX_BOUNDARY_LEN`].
    pub fn with_prefix(
        prefix: impl Into<Vec<u8>>,
        root: impl Into<Vec<u8>>,
    ) -> Result<Self, BoundaryError> {
        let prefix = prefix.into();
        let root = root.into();
        if root.is_empty() || root.len() > MAX_BOUNDARY_LEN {
            return Err(BoundaryError::Invalid {
                detail: "boundary length out of range",
            });
        }
        if prefix.iter().chain(root.iter()).any(|b| *b == b'\r' || *b == b'\n') {
            return Err(BoundaryError::Invalid {
                detail: "boundary contains a line terminator",
            });
        }

        let mut marker = Vec::with_capacity(CRLF.len() + prefix.len() + root.len());
        marker.extend_from_slice(CRLF);
        marker.extend_from_slice(&prefix);
        marker.extend_from_slice(&root);

        Ok(Self {
            prefix,
            root,
            marker,
        })
    }

    /// Parse the boundary from a `Content-Type` header value.
    ///
    /// Content-Type format: `multipart/form-data; boundary=----WebKitFormBoundary...`
    pub fn from_content_type(content_type: &str) -> Result<Self, BoundaryError> {
        Self::new(parse_boundary(content_type)?)
    }

    /// The prefix half (`--` for HTTP).
    #[must_use]
    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }

    /// The root half announced by the client.
    #[must_use]
    pub fn root(&self) -> &[u8] {
        &self.root
    }

    /// `prefix ++ root`.
    #[must_use]
    pub fn delimiter(&self) -> &[u8] {
        &self.marker[CRLF.len()..]
    }

    /// `CRLF ++ prefix ++ root`.
    #[must_use]
    pub fn marker(&self) -> &[u8] {
        &self.marker
    }
}

impl std::fmt::Display for Boundary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(self.delimiter()))
    }
}

/// Parse the boundary parameter from a `Content-Type` header value.
pub fn parse_boundary(content_type: &str) -> Result<String, BoundaryError> {
    let content_type = content_type.trim();
    let main = content_type.split(';').next().unwrap_or("").trim();
    if !main.eq_ignore_ascii_case("multipart/form-data") {
        return Err(BoundaryError::Invalid {
            detail: "content type is not multipart/form-data",
        });
    }

    for param in content_type.split(';').skip(1) {
        let param = param.trim();
        let Some((k, v)) = param.split_once('=') else {
            continue;
        };
        if k.trim().eq_ignore_ascii_case("boundary") {
            let boundary = v.trim().trim_matches('"').trim_matches('\'');
            if boundary.is_empty() || boundary.len() > MAX_BOUNDARY_LEN {
                return Err(BoundaryError::Invalid {
                    detail: "boundary length out of range",
                });
            }
            return Ok(boundary.to_string());
        }
    }

    Err(BoundaryError::Missing)
}

/// How far a byte sequence agrees with a boundary marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MarkerMatch {
    /// The marker is complete; `consumed` bytes of the probe were used.
    Full { consumed: usize },
    /// Everything seen so far is a proper prefix of the marker.
    Partial,
    /// The bytes cannot start a marker.
    Diverged,
}

/// Match `held ++ probe` against the start of `marker`.
///
/// `held` must already be a prefix of `marker`. Only as many bytes of `probe`
/// as are needed to complete the marker are inspected.
pub(crate) fn match_marker(marker: &[u8], held: &[u8], probe: &[u8]) -> MarkerMatch {
    debug_assert!(marker.starts_with(held));
    let need = marker.len().saturating_sub(held.len());
    let take = need.min(probe.len());
    if marker[held.len()..held.len() + take] != probe[..take] {
        return MarkerMatch::Diverged;
    }
    if take == need {
        MarkerMatch::Full { consumed: take }
    } else {
        MarkerMatch::Partial
    }
}
