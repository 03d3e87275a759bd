mod common;

use crash_reporter::{
    BreadcrumbLevel, BreadcrumbSettings, BreadcrumbType, Coordinator, CycleStats, DeliveryState,
    RetryOrder,
};
use std::time::Duration;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{header, method},
};

fn coordinator(dir: &std::path::Path, server: &MockServer) -> crash_reporter::CoordinatorBuilder {
    Coordinator::builder(dir, common::endpoint(server))
        .without_monitor()
        .background_uploads(false)
        .client_options(common::client_options())
        .retry_policy(common::eager_retries(3))
}

#[tokio::test]
async fn delivers_pending_reports() {
    common::init_logging();

    let dir = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(2)
        .mount(&server)
        .await;

    let coordinator = coordinator(dir.path(), &server).start().unwrap();
    let store = coordinator.store();
    let a = store.append_snapshot(&common::snapshot()).unwrap();
    let b = store.append_snapshot(&common::snapshot()).unwrap();

    let stats = coordinator.uploader().run_cycle().await;
    assert_eq!(
        stats,
        CycleStats {
            delivered: 2,
            ..Default::default()
        }
    );
    assert_eq!(store.state(&a), Some(DeliveryState::Delivered));
    assert_eq!(store.state(&b), Some(DeliveryState::Delivered));
    assert!(store.list_pending().unwrap().is_empty());

    // Nothing left to do
    assert_eq!(coordinator.uploader().run_cycle().await, CycleStats::default());
}

#[tokio::test]
async fn retries_until_exhausted() {
    let dir = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&server)
        .await;

    let coordinator = coordinator(dir.path(), &server).start().unwrap();
    let store = coordinator.store();
    let id = store.append_snapshot(&common::snapshot()).unwrap();

    for attempt in 1..=2 {
        let stats = coordinator.uploader().run_cycle().await;
        assert_eq!(stats.retried, 1);
        let report = store.get(&id).unwrap();
        assert_eq!(report.state, DeliveryState::Pending);
        assert_eq!(report.retry_count, attempt);
        assert!(report.next_attempt_at.is_some());
    }

    let stats = coordinator.uploader().run_cycle().await;
    assert_eq!(stats.failed, 1);

    let report = store.get(&id).unwrap();
    assert_eq!(report.state, DeliveryState::FailedPermanent);
    assert_eq!(report.retry_count, 3);

    // Kept on disk, but never attempted again
    assert_eq!(coordinator.uploader().run_cycle().await, CycleStats::default());
}

#[tokio::test]
async fn backoff_is_respected() {
    let dir = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "3600"))
        .expect(1)
        .mount(&server)
        .await;

    let coordinator = coordinator(dir.path(), &server).start().unwrap();
    let id = coordinator.store().append_snapshot(&common::snapshot()).unwrap();

    assert_eq!(coordinator.uploader().run_cycle().await.retried, 1);
    let next = coordinator.store().get(&id).unwrap().next_attempt_at.unwrap();
    assert!(next > chrono::Utc::now() + chrono::TimeDelta::minutes(59));

    // Not due yet
    assert_eq!(coordinator.uploader().run_cycle().await, CycleStats::default());
}

#[tokio::test]
async fn rejected_reports_fail_permanently() {
    let dir = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400))
        .expect(1)
        .mount(&server)
        .await;

    let coordinator = coordinator(dir.path(), &server).start().unwrap();
    let id = coordinator.store().append_snapshot(&common::snapshot()).unwrap();

    assert_eq!(coordinator.uploader().run_cycle().await.failed, 1);
    assert_eq!(
        coordinator.store().state(&id),
        Some(DeliveryState::FailedPermanent)
    );
}

#[tokio::test]
async fn newest_first_in_batches() {
    let dir = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;

    let coordinator = coordinator(dir.path(), &server)
        .retry_order(RetryOrder::Stack)
        .batch_size(1)
        .start()
        .unwrap();
    let store = coordinator.store();
    let older = store.append_snapshot(&common::snapshot()).unwrap();
    let newer = store.append_snapshot(&common::snapshot()).unwrap();

    Mock::given(method("POST"))
        .and(header("x-report-id", newer.to_string().as_str()))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(header("x-report-id", older.to_string().as_str()))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    coordinator.uploader().run_cycle().await;
    assert_eq!(store.state(&newer), Some(DeliveryState::Delivered));
    assert_eq!(store.state(&older), Some(DeliveryState::Pending));

    coordinator.uploader().run_cycle().await;
    assert_eq!(store.state(&older), Some(DeliveryState::Delivered));
}

#[tokio::test]
async fn rate_limited_reports_stay_pending() {
    let dir = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let coordinator = coordinator(dir.path(), &server)
        .reports_per_minute(1)
        .start()
        .unwrap();
    let store = coordinator.store();
    store.append_snapshot(&common::snapshot()).unwrap();
    let second = store.append_snapshot(&common::snapshot()).unwrap();

    let stats = coordinator.uploader().run_cycle().await;
    assert_eq!(stats.delivered, 1);
    assert_eq!(stats.deferred, 1);

    let report = store.get(&second).unwrap();
    assert_eq!(report.state, DeliveryState::Pending);
    assert_eq!(report.retry_count, 0);
}

#[tokio::test]
async fn invalidation_cancels_in_flight_upload() {
    let dir = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(10)))
        .mount(&server)
        .await;

    let coordinator = coordinator(dir.path(), &server).start().unwrap();
    let id = coordinator.store().append_snapshot(&common::snapshot()).unwrap();

    let (stats, ()) = tokio::join!(coordinator.uploader().run_cycle(), async {
        tokio::time::sleep(Duration::from_millis(200)).await;
        coordinator.invalidate_endpoint();
    });

    assert_eq!(stats.deferred, 1);
    let report = coordinator.store().get(&id).unwrap();
    assert_eq!(report.state, DeliveryState::Pending);
    assert_eq!(report.retry_count, 0);

    // No endpoint, no uploads
    assert_eq!(coordinator.uploader().run_cycle().await, CycleStats::default());
}

#[test]
fn background_uploads_on_start() {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let server = runtime.block_on(MockServer::start());
    runtime.block_on(
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server),
    );

    let dir = tempfile::tempdir().unwrap();
    let id = {
        let store =
            crash_reporter::ReportStore::open(dir.path(), crash_reporter::Retention::unlimited())
                .unwrap();
        store.append_snapshot(&common::snapshot()).unwrap()
    };

    let coordinator = coordinator(dir.path(), &server)
        .background_uploads(true)
        .start()
        .unwrap();

    // The server runs on this thread's runtime, so drive it while waiting
    runtime.block_on(async {
        for _ in 0..100 {
            if coordinator.store().state(&id) == Some(DeliveryState::Delivered) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    });

    assert_eq!(coordinator.store().state(&id), Some(DeliveryState::Delivered));
    coordinator.shutdown();
}

#[tokio::test]
async fn crashed_run_uploads_its_breadcrumbs() {
    common::init_logging();

    let dir = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    {
        let coordinator = coordinator(dir.path(), &server)
            .breadcrumbs(BreadcrumbSettings::default())
            .start()
            .unwrap();
        assert!(coordinator.add_breadcrumb(
            BreadcrumbLevel::Info,
            BreadcrumbType::Navigation,
            "entered the dungeon"
        ));
        assert!(!coordinator.add_breadcrumb(
            BreadcrumbLevel::Debug,
            BreadcrumbType::Log,
            "x".repeat(8192)
        ));
    }
    let crashed = common::write_capture(dir.path());

    let host_log = dir.path().join("host.log");
    std::fs::write(&host_log, b"last words").unwrap();

    let coordinator = coordinator(dir.path(), &server)
        .breadcrumbs(BreadcrumbSettings::default())
        .attachments(vec![host_log])
        .start()
        .unwrap();

    let pending = coordinator.store().list_pending().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, crashed);
    assert_eq!(pending[0].attachments.len(), 2);

    // The new run starts an empty log
    assert!(coordinator.breadcrumbs().unwrap().entries().is_empty());

    let stats = coordinator.uploader().run_cycle().await;
    assert_eq!(stats.delivered, 1);

    let requests = server.received_requests().await.unwrap();
    let body = String::from_utf8_lossy(&requests[0].body);
    assert!(body.contains("entered the dungeon"));
    assert!(body.contains(r#"name="attachment_host.log""#));
    assert!(body.contains("last words"));

    // The log of the crashed run now belongs to the store
    let owned: Vec<_> = std::fs::read_dir(coordinator.store().attachments_dir())
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    assert_eq!(owned.len(), 1);
    assert!(pending[0].attachments.contains(&owned[0]));
}
