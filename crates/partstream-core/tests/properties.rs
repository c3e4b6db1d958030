//! Property-based tests for scanning, header accumulation and reassembly.
//!
//! Payloads are drawn from an alphabet rich in `\r`, `\n` and `-` so that
//! partial delimiters show up constantly, but without the letters of the
//! boundary root so a payload can never contain a real delimiter.

use std::sync::Arc;

use proptest::prelude::*;

use partstream_core::testing::{CollectingSink, FormBuilder, reassemble, split_at};
use partstream_core::{
    Application, BeginState, Boundary, ChunkScanner, DataPiece, Disposition, HeaderStatus,
    PostAction, SessionId, Store, join_pieces,
};

const ROOT: &str = "XyZ";

fn payload() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(
        prop::sample::select(vec![b'a', b'\r', b'\n', b'-', b'X', b'0']),
        0..40,
    )
}

fn fields() -> impl Strategy<Value = Vec<(String, Vec<u8>)>> {
    prop::collection::vec(("[a-z]{1,8}", payload()), 1..5)
}

proptest! {
    /// Joining the pieces of a chunk gives the chunk back, whatever it holds.
    #[test]
    fn scan_then_join_is_identity(
        chunk in prop::collection::vec(
            prop::sample::select(vec![b'a', b'\r', b'\n', b'-', b'B']),
            0..64,
        ),
        first in 0u64..1000,
    ) {
        let boundary = Boundary::new("B").unwrap();
        let scanner = ChunkScanner::new(&boundary);
        let pieces = scanner.scan(SessionId::new(1), first, &chunk);

        prop_assert_eq!(join_pieces(&pieces), chunk.clone());
        for (offset, piece) in pieces.iter().enumerate() {
            prop_assert_eq!(piece.part(), first + offset as u64);
        }
        let starts = pieces
            .iter()
            .filter(|p| matches!(p, DataPiece::Unit(u) if u.begin == BeginState::Yes))
            .count();
        prop_assert_eq!(starts, scanner.occurrences(&chunk).len());
    }

    /// Header accumulation does not depend on where the header is cut.
    #[test]
    fn header_parse_ignores_fragmentation(
        name in "[a-z]{1,12}",
        file in proptest::option::of("[a-z]{1,8}\\.txt"),
        body in payload(),
        cuts in prop::collection::vec(0usize..160, 0..6),
    ) {
        let mut raw = format!("\r\nContent-Disposition: form-data; name=\"{name}\"");
        if let Some(file) = &file {
            raw.push_str(&format!("; filename=\"{file}\""));
        }
        raw.push_str("\r\n\r\n");
        let mut bytes = raw.into_bytes();
        bytes.extend_from_slice(&body);

        let mut whole = Disposition::new();
        let (status, rest) = whole.accumulate(&bytes, 1024);
        prop_assert_eq!(status, HeaderStatus::Complete);
        prop_assert_eq!(rest, &body[..]);

        let mut pieced = Disposition::new();
        let mut remaining = Vec::new();
        for fragment in split_at(&bytes, &cuts) {
            let (status, rest) = pieced.accumulate(&fragment, 1024);
            if status == HeaderStatus::Complete {
                remaining.extend_from_slice(rest);
            }
        }
        prop_assert_eq!(&pieced, &whole);
        prop_assert_eq!(remaining, body);
        prop_assert_eq!(pieced.form_name(), name.as_str());
        let file = file.unwrap_or_default();
        prop_assert_eq!(pieced.file_name(), file.as_str());
    }

    /// Any chunking of a form reassembles to its fields with exactly one Finish.
    #[test]
    fn any_chunking_reassembles_the_form(
        fields in fields(),
        cuts in prop::collection::vec(0usize..512, 0..12),
    ) {
        let mut form = FormBuilder::new(ROOT);
        for (name, value) in &fields {
            form = form.field(name.clone(), value.clone());
        }
        let body = form.build();
        let boundary = form.boundary().unwrap();

        let app = Application::new(Arc::new(Store::default()), CollectingSink::new());
        let session = SessionId::new(1);
        for chunk in split_at(&body, &cuts) {
            app.handle_chunk(session, &chunk, &boundary).unwrap();
        }

        let envelopes = app.sink().take();
        let finishes = envelopes
            .iter()
            .filter(|e| e.post_action == PostAction::Finish)
            .count();
        prop_assert_eq!(finishes, 1);

        let got = reassemble(&envelopes);
        prop_assert_eq!(got.len(), fields.len());
        for (field, (name, value)) in got.iter().zip(&fields) {
            prop_assert_eq!(&field.form_name, name);
            prop_assert_eq!(&field.body, value);
        }
        prop_assert!(!app.store().contains(session));
    }
}
