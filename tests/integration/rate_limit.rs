//! Concurrent requests through one session stay under the limiter's
//! ceilings.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use reelforge::backend::{GenerationOperation, GenerationRequest, MediaKind};
use reelforge::budget::AutoDeny;
use reelforge::rate_limit::RateLimitConfig;
use reelforge::{SessionConfig, SessionContext};

use crate::common::CountingBackend;

#[tokio::test(start_paused = true)]
async fn test_ten_concurrent_text_requests_respect_concurrency() {
    let mut config = SessionConfig::default();
    config.rate_limit = RateLimitConfig::new(60, 3);
    let backend = Arc::new(CountingBackend::new(Duration::from_millis(200)));
    let session = SessionContext::new("rate", &config, backend.clone(), Arc::new(AutoDeny));

    let requests: Vec<GenerationRequest> = (0..10)
        .map(|i| {
            GenerationRequest::new(
                format!("text-{}", i),
                GenerationOperation::new(MediaKind::Text, "writer"),
                "a line of dialogue",
            )
        })
        .collect();
    let reports = join_all(requests.iter().map(|r| session.generate(r, false))).await;

    assert!(reports.iter().all(|r| r.outcome.is_success()));
    assert_eq!(session.cost_guard().snapshot().request_count, 10);
    assert!(backend.peak_in_flight() <= 3, "peak {}", backend.peak_in_flight());
    let stats = session.limiter().stats();
    assert!(stats.peak_active <= 3);
    assert_eq!(stats.active, 0);
    assert_eq!(stats.granted, 10);
    assert!(stats.tokens >= 0.0);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_spreads_requests_past_burst() {
    let mut config = SessionConfig::default();
    config.rate_limit = RateLimitConfig::new(60, 10).with_burst(2);
    let backend = Arc::new(CountingBackend::new(Duration::ZERO));
    let session = SessionContext::new("burst", &config, backend.clone(), Arc::new(AutoDeny));

    let requests: Vec<GenerationRequest> = (0..5)
        .map(|i| {
            GenerationRequest::new(
                format!("text-{}", i),
                GenerationOperation::new(MediaKind::Text, "writer"),
                "prompt",
            )
        })
        .collect();
    let started = tokio::time::Instant::now();
    let reports = join_all(requests.iter().map(|r| session.generate(r, false))).await;

    assert!(reports.iter().all(|r| r.outcome.is_success()));
    // Two from the burst, then one per second at 60 rpm.
    assert!(started.elapsed() >= Duration::from_secs(3) - Duration::from_millis(50));
    assert_eq!(backend.total_calls(), 5);
}
