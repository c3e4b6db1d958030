use std::sync::Arc;

use partstream::prelude::*;
use partstream::testing::{CollectingSink, FormBuilder, chunked, reassemble};

#[test]
fn prelude_covers_synchronous_reassembly() {
    let form = FormBuilder::new("fence")
        .field("title", "report")
        .file("upload", "a.bin", "application/octet-stream", vec![0u8, 13, 10, 45, 45]);
    let boundary = Boundary::from_content_type(&form.content_type()).unwrap();
    let app = Application::new(Arc::new(Store::default()), CollectingSink::new());
    let session = SessionId::new(9);

    for chunk in chunked(&form.build(), 5) {
        app.handle_chunk(session, &chunk, &boundary).unwrap();
    }

    let envelopes = app.sink().envelopes();
    assert_eq!(envelopes.first().unwrap().pre_action, PreAction::Start);
    assert_eq!(envelopes.last().unwrap().post_action, PostAction::Finish);
    let fields = reassemble(&envelopes);
    assert_eq!(fields.len(), 2);
    assert_eq!(fields[0].body, b"report");
    assert_eq!(fields[1].body, vec![0u8, 13, 10, 45, 45]);
    assert!(!app.store().contains(session));
}

#[cfg(feature = "dispatch")]
mod dispatch {
    use partstream::SessionReport;
    use partstream::prelude::*;
    use partstream::testing::FormBuilder;

    struct Discard;

    impl Transport for Discard {
        async fn deliver(&self, _envelope: OutputEnvelope) -> Result<(), TransportError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn prelude_covers_dispatch() {
        let form = FormBuilder::new("B").field("a", "1").field("b", "2");
        let dispatcher = Dispatcher::new(Discard, DispatchConfig::new());
        let handle = dispatcher
            .open(SessionId::new(1), form.boundary().unwrap())
            .unwrap();
        handle.send_chunk(form.build()).await.unwrap();
        let report: SessionReport = handle.finish().await.unwrap();

        assert!(report.terminated);
        assert_eq!(report.chunks, 1);
        assert!(report.delivered >= 2);
    }
}
