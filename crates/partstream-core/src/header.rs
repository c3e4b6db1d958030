//! Incremental field header accumulation.
//!
//! A field header is everything between a delimiter and the blank line that
//! ends it. Pieces can cut it anywhere, so [`Disposition`] keeps the raw bytes
//! until `CRLF CRLF` shows up and only then parses `Content-Disposition` and
//! `Content-Type`. The parse runs once over the complete header, which makes
//! the result independent of how the header was fragmented.

use memchr::memmem;

/// Blank line ending a field header.
pub const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Default limit for one field header (16KB).
pub const DEFAULT_MAX_HEADER_SIZE: usize = 16 * 1024;

/// Result of feeding a fragment to a [`Disposition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderStatus {
    /// The blank line has not been seen yet.
    Incomplete,
    /// The header is parsed; the returned remainder is field body.
    Complete,
    /// The bytes after the delimiter are `--`: this was the closing delimiter.
    Terminal,
    /// The header grew past the limit without a terminator.
    TooLarge,
}

/// Accumulated field header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Disposition {
    raw_header: Vec<u8>,
    form_name: String,
    file_name: String,
    content_type: Option<String>,
    complete: bool,
    problem: Option<String>,
}

/// Output of [`accumulate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accumulated<'f> {
    pub disposition: Disposition,
    pub remaining: &'f [u8],
    pub status: HeaderStatus,
}

/// Feed `fragment` into `disposition`, returning the updated disposition, the
/// bytes after the header terminator (empty unless complete) and the status.
#[must_use]
pub fn accumulate(mut disposition: Disposition, fragment: &[u8], max_size: usize) -> Accumulated<'_> {
    let (status, remaining) = disposition.accumulate(fragment, max_size);
    Accumulated {
        disposition,
        remaining,
        status,
    }
}

impl Disposition {
    /// Create an empty disposition.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw header bytes seen so far (up to and including the terminator once
    /// complete).
    #[must_use]
    pub fn raw_header(&self) -> &[u8] {
        &self.raw_header
    }

    /// Field name, empty until complete or when the header lacks one.
    #[must_use]
    pub fn form_name(&self) -> &str {
        &self.form_name
    }

    /// File name, empty for plain fields.
    #[must_use]
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Content-Type of the field, if the header carried one.
    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// Returns true once the terminator was seen.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Returns true if the field is a file upload.
    #[must_use]
    pub fn is_file(&self) -> bool {
        !self.file_name.is_empty()
    }

    /// Whether enough bytes arrived to tell a header from a closing delimiter.
    #[must_use]
    pub fn leading_known(&self) -> bool {
        self.complete || self.raw_header.len() >= 2
    }

    /// Why the header could not be fully interpreted, if it couldn't.
    #[must_use]
    pub fn problem(&self) -> Option<&str> {
        self.problem.as_deref()
    }

    /// Append `fragment` and try to complete the header.
    ///
    /// On [`HeaderStatus::Complete`] the returned slice is the part of
    /// `fragment` after the terminator. On every other status it is empty and
    /// the fragment has been retained (or, for `Terminal`, dropped).
    pub fn accumulate<'f>(&mut self, fragment: &'f [u8], max_size: usize) -> (HeaderStatus, &'f [u8]) {
        if self.complete {
            return (HeaderStatus::Complete, fragment);
        }

        let old_len = self.raw_header.len();
        self.raw_header.extend_from_slice(fragment);

        if self.raw_header.starts_with(b"--") {
            return (HeaderStatus::Terminal, &[]);
        }

        // The terminator may straddle the previous fragment by up to 3 bytes.
        let search_from = old_len.saturating_sub(HEADER_TERMINATOR.len() - 1);
        if let Some(pos) = memmem::find(&self.raw_header[search_from..], HEADER_TERMINATOR) {
            let end = search_from + pos + HEADER_TERMINATOR.len();
            self.raw_header.truncate(end);
            if end > max_size {
                return (HeaderStatus::TooLarge, &[]);
            }
            let block = self.raw_header[..end - HEADER_TERMINATOR.len()].to_vec();
            self.parse_block(&block);
            self.complete = true;
            return (HeaderStatus::Complete, &fragment[end - old_len..]);
        }

        if self.raw_header.len() > max_size {
            return (HeaderStatus::TooLarge, &[]);
        }
        (HeaderStatus::Incomplete, &[])
    }

    fn parse_block(&mut self, block: &[u8]) {
        let Ok(text) = std::str::from_utf8(block) else {
            self.problem = Some("invalid UTF-8 in header".to_string());
            return;
        };

        let mut disposition = None;
        for line in text.split("\r\n") {
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            let name = name.trim();
            if name.eq_ignore_ascii_case("content-disposition") {
                disposition = Some(value.trim());
            } else if name.eq_ignore_ascii_case("content-type") {
                self.content_type = Some(value.trim().to_string());
            }
        }

        let Some(disposition) = disposition else {
            self.problem = Some("missing Content-Disposition header".to_string());
            return;
        };

        let params = parse_content_disposition(disposition);
        self.form_name = params.name.unwrap_or_default();
        self.file_name = params.filename.unwrap_or_default();
        self.problem = params.problem;
    }
}

#[derive(Debug, Default)]
struct DispositionParams {
    name: Option<String>,
    filename: Option<String>,
    problem: Option<String>,
}

/// Parse a Content-Disposition header value.
///
/// Format: `form-data; name="field"; filename="file.txt"`
fn parse_content_disposition(value: &str) -> DispositionParams {
    let mut params = DispositionParams::default();

    for param in split_params(value) {
        let param = param.trim();
        if param.eq_ignore_ascii_case("form-data") {
            continue;
        }

        if let Some((key, raw_value)) = param.split_once('=') {
            let key = key.trim();
            if key.eq_ignore_ascii_case("name") {
                params.name = Some(unquote(raw_value));
            } else if key.eq_ignore_ascii_case("filename") {
                let unquoted = unquote(raw_value);
                if unquoted.contains("..")
                    || unquoted.contains('/')
                    || unquoted.contains('\\')
                    || unquoted.contains('\0')
                {
                    params.problem =
                        Some("filename contains path traversal characters".to_string());
                } else {
                    params.filename = Some(unquoted);
                }
            }
        }
    }

    if params.name.is_none() && params.problem.is_none() {
        params.problem = Some("missing name parameter".to_string());
    }
    params
}

/// Split on `;` outside of double quotes.
fn split_params(value: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;
    for (i, c) in value.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ';' if !in_quotes => {
                out.push(&value[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    out.push(&value[start..]);
    out
}

fn unquote(s: &str) -> String {
    let s = s.trim();
    if s.len() >= 2
        && ((s.starts_with('"') && s.ends_with('"')) || (s.starts_with('\'') && s.ends_with('\'')))
    {
        s[1..s.len() - 1].to_string()
    } else {
        s.to_string()
    }
}
