//! Academic registration and the daily allowance, end to end.

mod common;

use chrono::Duration as ChronoDuration;
use common::{parse_sse, test_config, TestApp};
use gateway_service::models::StreamEvent;
use gateway_service::services::ScriptedResponder;
use serde_json::Value;

fn queries_remaining(events: &[StreamEvent]) -> Option<u64> {
    events.iter().find_map(|event| match event {
        StreamEvent::Complete { metadata } => {
            metadata.get("queries_remaining").and_then(Value::as_u64)
        }
        _ => None,
    })
}

#[tokio::test]
async fn registration_grants_the_full_daily_allowance() {
    let app = TestApp::spawn().await;
    let client = app.client();

    let response = app.register(&client, "A@B.Edu").await;
    assert_eq!(response.status(), 200);

    let body: Value = response.json().await.expect("Failed to parse response");
    assert_eq!(body["authenticated"], true);
    assert_eq!(body["identity"], "a@b.edu");
    assert_eq!(body["tier"], "academic");
    assert_eq!(body["queries_remaining"], 2);
    assert_eq!(body["daily_limit"], 2);
}

#[tokio::test]
async fn invalid_email_is_rejected() {
    let app = TestApp::spawn().await;

    let response = app.register(&app.client(), "not-an-email").await;

    assert_eq!(response.status(), 422);
}

#[tokio::test]
async fn allowance_counts_down_then_refuses_until_midnight() {
    let app = TestApp::spawn().await;
    let client = app.client();
    app.register(&client, "a@b.edu").await;

    let body = app.ask(&client, "one").await.text().await.expect("body");
    let (events, _) = parse_sse(&body);
    assert_eq!(queries_remaining(&events), Some(1));

    let body = app.ask(&client, "two").await.text().await.expect("body");
    let (events, _) = parse_sse(&body);
    assert_eq!(queries_remaining(&events), Some(0));

    let response = app.ask(&client, "three").await;
    assert_eq!(response.status(), 429);
    // 12:00 UTC, so the allowance resets in twelve hours.
    assert_eq!(
        response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok()),
        Some("43200")
    );
    let body: Value = response.json().await.expect("Failed to parse response");
    let message = body["error"].as_str().unwrap_or_default();
    assert!(message.starts_with("Daily limit of 2 queries reached."), "{}", message);
    assert_eq!(app.responder.call_count(), 2);

    app.clock.advance(ChronoDuration::hours(12));

    let body = app.ask(&client, "tomorrow").await.text().await.expect("body");
    let (events, _) = parse_sse(&body);
    assert_eq!(queries_remaining(&events), Some(1));
}

#[tokio::test]
async fn usage_reports_today_and_all_time() {
    let app = TestApp::spawn().await;
    let client = app.client();
    app.register(&client, "stats@uni.edu").await;
    app.ask(&client, "one").await.text().await.expect("body");

    let body: Value = client
        .get(app.url("/api/v1/auth/usage"))
        .send()
        .await
        .expect("Failed to execute request")
        .json()
        .await
        .expect("Failed to parse response");

    assert_eq!(body["identity"], "stats@uni.edu");
    assert_eq!(body["used_today"], 1);
    assert_eq!(body["remaining_today"], 1);
    assert_eq!(body["total_all_time"], 1);
    assert_eq!(body["daily_limit"], 2);
}

#[tokio::test]
async fn usage_is_not_available_to_full_tier() {
    let app = TestApp::spawn().await;
    let client = app.client();
    app.login(&client).await;

    let response = client
        .get(app.url("/api/v1/auth/usage"))
        .send()
        .await
        .expect("Failed to execute request");

    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn full_tier_is_never_metered() {
    let app = TestApp::spawn().await;
    let client = app.client();
    app.login(&client).await;

    for _ in 0..4 {
        let response = app.ask(&client, "again").await;
        assert_eq!(response.status(), 200);
        response.text().await.expect("body");
    }

    assert_eq!(app.responder.call_count(), 4);
}

#[tokio::test]
async fn failed_streams_do_not_consume_allowance() {
    let app = TestApp::spawn_with(
        test_config(),
        ScriptedResponder::new().fault("upstream exploded"),
    )
    .await;
    let client = app.client();
    app.register(&client, "unlucky@uni.edu").await;

    for _ in 0..3 {
        let response = app.ask(&client, "try").await;
        assert_eq!(response.status(), 200);
        let body = response.text().await.expect("body");
        let (events, done) = parse_sse(&body);
        assert!(done);
        assert!(matches!(events.last(), Some(StreamEvent::Error { .. })));
    }

    let body: Value = client
        .get(app.url("/api/v1/auth/usage"))
        .send()
        .await
        .expect("Failed to execute request")
        .json()
        .await
        .expect("Failed to parse response");
    assert_eq!(body["used_today"], 0);
}

#[tokio::test]
async fn store_outage_fails_closed() {
    let app = TestApp::spawn().await;
    let client = app.client();
    app.register(&client, "outage@uni.edu").await;

    app.store.set_available(false);
    let response = app.ask(&client, "anyone there?").await;

    assert_eq!(response.status(), 503);
    assert_eq!(app.responder.call_count(), 0);
}

#[tokio::test]
async fn store_outage_can_fail_open() {
    let mut config = test_config();
    config.quota.fail_open = true;
    let app = TestApp::spawn_with(config, ScriptedResponder::answering(&["still here"])).await;
    let client = app.client();
    app.register(&client, "open@uni.edu").await;

    app.store.set_available(false);
    let body = app.ask(&client, "anyone there?").await.text().await.expect("body");
    let (events, done) = parse_sse(&body);

    assert!(done);
    assert!(matches!(events.last(), Some(StreamEvent::Complete { .. })));
    assert_eq!(queries_remaining(&events), None);
}
