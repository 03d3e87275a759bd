#![cfg(any(target_os = "linux", target_os = "android"))]

use crash_reporter::{Coordinator, DeliveryState, EndpointConfig};
use crash_reporter_test::*;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{header, method, path},
};

#[tokio::test]
async fn crash_is_delivered_on_next_start() {
    let capture = run_test(Fault::Segv, false);
    let id = capture.snapshot.id;

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/submit"))
        .and(header("x-report-id", id.to_string().as_str()))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let endpoint = EndpointConfig::new(&format!("{}/submit", server.uri()), "token").unwrap();

    // The next run of the "application"
    let coordinator = Coordinator::builder(capture.dir.path(), endpoint)
        .without_monitor()
        .background_uploads(false)
        .start()
        .unwrap();

    assert!(!coordinator.crash_loop_detected());

    let store = coordinator.store();
    let pending = store.list_pending().unwrap();
    assert_eq!(pending.len(), 1, "expected exactly one pending report");
    assert_eq!(pending[0].id, id);
    assert_eq!(pending[0].snapshot().unwrap(), capture.snapshot);
    assert_eq!(store.pending_captures().unwrap(), 0);

    let stats = coordinator.uploader().run_cycle().await;
    assert_eq!(stats.delivered, 1);
    assert_eq!(store.state(&id), Some(DeliveryState::Delivered));
    assert!(store.list_pending().unwrap().is_empty());
}
