mod support;

use std::sync::Arc;
use std::time::Duration;

use http::StatusCode;
use s3web::store::StoreError;
use support::*;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_misses_share_one_fetch() {
    let e2e = Arc::new(E2E::start().await);
    e2e.store.put("hot/video.mp4", &[7u8; 4096], "video/mp4");
    e2e.store.set_delay(Duration::from_millis(200));

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let e2e = Arc::clone(&e2e);
        tasks.push(tokio::spawn(async move { e2e.get("/hot/video.mp4").await }));
    }
    for task in tasks {
        let resp = task.await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.body().len(), 4096);
        assert_eq!(resp.header("X-Cache"), Some("MISS"));
    }
    assert_eq!(e2e.store.calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_failures_share_one_fetch() {
    let e2e = Arc::new(E2E::start().await);
    e2e.store.fail("flaky", StoreError::Backend("reset by peer".into()));
    e2e.store.set_delay(Duration::from_millis(200));

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let e2e = Arc::clone(&e2e);
        tasks.push(tokio::spawn(async move { e2e.get("/flaky").await }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap().status(), StatusCode::BAD_GATEWAY);
    }
    assert_eq!(e2e.store.calls(), 1);
}
