use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_string_contains, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use slot_watcher::config::ReplayConfig;
use slot_watcher::models::{Location, StrategyKind};
use slot_watcher::replayer::DirectRequestReplayer;
use slot_watcher::SlotScanner;

use super::*;

const ALL_UI: [StrategyKind; 3] = [StrategyKind::UiA, StrategyKind::UiB, StrategyKind::UiC];

fn replayer() -> DirectRequestReplayer {
    DirectRequestReplayer::new(ReplayConfig::default(), "slot-watcher-test", Duration::from_secs(5)).unwrap()
}

#[tokio::test]
async fn test_replay_answers_without_opening_a_page() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/Appointment/SelectLocation"))
        .and(header("cookie", "ASP.NET_SessionId=sess-1"))
        .and(body_string_contains("LocationId=27"))
        .and(body_string_contains("__RequestVerificationToken=csrf-1"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/Appointment/AvailableSlots"))
        .and(query_param("locationId", "27"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "locationId": 27,
            "slots": [
                {"date": "2024-06-10", "time": "10:00"},
                {"date": "2024-06-11", "time": "09:30"},
                {"date": "not a date", "time": "10:00"}
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let browser = Arc::new(FakeBrowser::new(FakeSite::new()));
    let scanner = scanner(browser.clone(), &ALL_UI, Some(replayer()));
    let report = scanner.scan(session(&server.uri(), vec![haverhill()])).await;

    let result = &report.results[0];
    assert!(result.success);
    assert_eq!(result.strategy_used, StrategyKind::DirectReplay);
    assert_eq!(result.slots.len(), 2);
    assert_eq!(result.skipped_entries, 1);
    assert!(!report.session_expired);
    assert_eq!(browser.opened.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_replay_server_error_falls_back_to_browser() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let site = FakeSite::new();
    site.open_slot(27, "2024-06-10", "10:00");
    let browser = Arc::new(FakeBrowser::new(site));
    let scanner = scanner(browser.clone(), &ALL_UI, Some(replayer()));
    let report = scanner.scan(session(&server.uri(), vec![haverhill()])).await;

    let result = &report.results[0];
    assert!(result.success);
    assert_eq!(result.strategy_used, StrategyKind::UiA);
    assert_eq!(result.slots[0].raw_key(), "27|2024-06-10|10:00:00");
    assert!(result.fallback_reason.as_deref().unwrap().contains("500"));
    // A server error is not a session signal.
    assert!(!report.session_expired);
    assert_eq!(scanner.page_tracker().in_use(), 0);
}

#[tokio::test]
async fn test_replay_for_wrong_location_is_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "locationId": 3,
            "slots": [{"date": "2024-06-10", "time": "10:00"}]
        })))
        .mount(&server)
        .await;

    let browser = Arc::new(FakeBrowser::new(FakeSite::new()));
    let scanner = scanner(browser.clone(), &ALL_UI, Some(replayer()));
    let report = scanner.scan(session(&server.uri(), vec![haverhill()])).await;

    let result = &report.results[0];
    assert_eq!(result.strategy_used, StrategyKind::UiA);
    assert!(result.slots.is_empty());
    assert!(result.fallback_reason.is_some());
    assert_eq!(browser.opened.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_every_strategy_failing_yields_failed_result() {
    let browser = Arc::new(FakeBrowser::new(FakeSite::broken()));
    let scanner = scanner(browser.clone(), &ALL_UI, None);
    let report = scanner
        .scan(session("https://booking.example.gov/", vec![haverhill(), Location::new(3, "Boston")]))
        .await;

    assert_eq!(report.results.len(), 2);
    for result in &report.results {
        assert!(!result.success);
        assert!(result.slots.is_empty());
        assert_eq!(result.strategy_used, StrategyKind::UiC);
        assert_eq!(result.error.as_ref().unwrap().kind, "selection");
    }

    // One page per strategy per location, each returned.
    assert_eq!(browser.opened.load(Ordering::SeqCst), 6);
    assert_eq!(browser.closed.load(Ordering::SeqCst), 6);
    assert_eq!(scanner.page_tracker().in_use(), 0);
}

#[tokio::test]
async fn test_results_follow_configured_location_order() {
    let site = FakeSite::new();
    site.open_slot(3, "2024-06-10", "09:00");
    site.open_slot(27, "2024-06-10", "10:00");
    let browser = Arc::new(FakeBrowser::new(site));
    let scanner = scanner(browser, &[StrategyKind::UiA], None);

    let locations = vec![
        Location::new(3, "Boston"),
        haverhill(),
        Location::new(12, "Lawrence"),
    ];
    let report = scanner.scan(session("https://booking.example.gov/", locations)).await;

    let ids: Vec<u32> = report.results.iter().map(|r| r.location_id).collect();
    assert_eq!(ids, vec![3, 27, 12]);
    assert_eq!(report.successes().count(), 3);
    assert!(report.results[2].slots.is_empty());
}

#[tokio::test]
async fn test_malformed_payload_falls_back_for_that_location_only() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(query_param("locationId", "27"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"locationId": 27})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(query_param("locationId", "3"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "locationId": 3,
            "slots": [{"date": "2024-06-10", "time": "09:00"}]
        })))
        .mount(&server)
        .await;

    let site = FakeSite::new();
    site.open_slot(27, "2024-06-10", "10:00");
    let browser = Arc::new(FakeBrowser::new(site));
    let scanner = scanner(browser.clone(), &ALL_UI, Some(replayer()));
    let report = scanner
        .scan(session(&server.uri(), vec![haverhill(), Location::new(3, "Boston")]))
        .await;

    let haverhill = &report.results[0];
    assert_eq!(haverhill.strategy_used, StrategyKind::UiA);
    assert!(haverhill.fallback_reason.as_deref().unwrap().contains("schema mismatch"));
    assert_eq!(haverhill.slots.len(), 1);

    let boston = &report.results[1];
    assert_eq!(boston.strategy_used, StrategyKind::DirectReplay);
    assert!(boston.fallback_reason.is_none());

    assert!(!report.session_expired);
    assert_eq!(browser.opened.load(Ordering::SeqCst), 1);
}
