use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

use slot_watcher::config::ReplayConfig;
use slot_watcher::models::{Channel, StrategyKind};
use slot_watcher::monitor::{MonitorLoop, MonitorSettings, MonitorState, MonitorStatus, TickOutcome};
use slot_watcher::plugins::{NotificationDispatcher, RecipientConfig, RetryPolicy};
use slot_watcher::replayer::DirectRequestReplayer;

use super::*;

fn recipient() -> RecipientConfig {
    RecipientConfig {
        email: Some("pat@example.com".to_string()),
        phone: Some("+15555550100".to_string()),
        channels: vec![Channel::Email, Channel::Sms],
    }
}

fn settings(session_max_age: Duration) -> MonitorSettings {
    MonitorSettings {
        session_max_age,
        extraction_timeout: Duration::from_secs(5),
        history_len: 10,
        recipient: recipient(),
    }
}

struct Harness {
    monitor: MonitorLoop,
    browser: Arc<FakeBrowser>,
    extractor: Arc<FakeSessionExtractor>,
    email: Arc<CountingProvider>,
    sms: Arc<CountingProvider>,
}

fn harness(site: FakeSite, replayer: Option<DirectRequestReplayer>) -> Harness {
    let browser = Arc::new(FakeBrowser::new(site));
    let extractor = Arc::new(FakeSessionExtractor::default());
    let email = Arc::new(CountingProvider::reliable(Channel::Email));
    let sms = Arc::new(CountingProvider::reliable(Channel::Sms));

    let dispatcher = NotificationDispatcher::new(RetryPolicy::default())
        .with_provider(email.clone())
        .with_provider(sms.clone());
    let monitor = MonitorLoop::new(
        Arc::new(scanner(browser.clone(), &[StrategyKind::UiA], replayer)),
        extractor.clone(),
        Arc::new(dispatcher),
        settings(Duration::from_secs(3600)),
    )
    .with_clock(Arc::new(|| day("2024-06-01")));

    Harness {
        monitor,
        browser,
        extractor,
        email,
        sms,
    }
}

async fn wait_for_ticks(rx: &mut watch::Receiver<MonitorStatus>, ticks: u64) {
    while rx.borrow_and_update().ticks < ticks {
        rx.changed().await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn test_one_alert_per_new_matching_slot_across_cycles() {
    let site = FakeSite::new();
    site.open_slot(27, "2024-06-10", "10:00");
    site.open_slot(27, "2024-06-10", "20:00");
    let h = harness(site, None);
    let mut rx = h.monitor.subscribe();

    h.monitor
        .start(session("https://booking.example.gov/", vec![haverhill()]), Duration::from_secs(60))
        .unwrap();
    wait_for_ticks(&mut rx, 3).await;
    h.monitor.stop().unwrap();
    h.monitor.join().await.unwrap();

    assert_eq!(h.email.attempts(), 1);
    assert_eq!(h.sms.attempts(), 1);

    let email = &h.email.delivered()[0];
    assert_eq!(email.recipient, "pat@example.com");
    assert!(email.text.contains("Haverhill: 2024-06-10 10:00"));
    assert!(!email.text.contains("20:00"));
    assert!(h.sms.delivered()[0].text.contains("Haverhill 2024-06-10 10:00"));

    let status = h.monitor.status();
    assert_eq!(status.state, MonitorState::Stopped);
    assert_eq!(status.ticks, 3);
    // The evening slot is remembered even though it never matched.
    assert_eq!(status.registry_size, 2);

    let matches: Vec<usize> = status.history.iter().map(|t| t.new_matches.len()).collect();
    assert_eq!(matches, vec![1, 0, 0]);
    let first = &status.history[0];
    assert_eq!(first.outcome, TickOutcome::Completed);
    assert!(first.dispatch.as_ref().unwrap().all_delivered());
    assert!(status.history[1].dispatch.is_none());

    assert_eq!(h.browser.opened.load(Ordering::SeqCst), 3);
    assert_eq!(h.browser.closed.load(Ordering::SeqCst), 3);
    assert_eq!(h.extractor.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_out_of_window_slot_appearing_later_is_registered_silently() {
    let h = harness(FakeSite::new(), None);
    h.browser.site.open_slot(27, "2024-06-10", "10:00");
    let mut rx = h.monitor.subscribe();

    h.monitor
        .start(session("https://booking.example.gov/", vec![haverhill()]), Duration::from_secs(60))
        .unwrap();
    wait_for_ticks(&mut rx, 1).await;
    assert_eq!(rx.borrow().registry_size, 1);
    assert_eq!(h.email.attempts(), 1);
    assert_eq!(h.sms.attempts(), 1);

    wait_for_ticks(&mut rx, 2).await;
    assert_eq!(rx.borrow().registry_size, 1);
    h.browser.site.open_slot(27, "2024-06-10", "20:00");

    wait_for_ticks(&mut rx, 3).await;
    h.monitor.stop().unwrap();
    h.monitor.join().await.unwrap();

    assert_eq!(h.email.attempts(), 1);
    assert_eq!(h.sms.attempts(), 1);

    let status = h.monitor.status();
    assert_eq!(status.registry_size, 2);
    let matches: Vec<usize> = status.history.iter().map(|t| t.new_matches.len()).collect();
    assert_eq!(matches, vec![1, 0, 0]);
    assert!(status.history[2].dispatch.is_none());
    assert_eq!(status.history[2].results[0].slots.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_slot_opening_later_is_alerted_alone() {
    let h = harness(FakeSite::new(), None);
    h.browser.site.open_slot(27, "2024-06-10", "10:00");
    let mut rx = h.monitor.subscribe();

    h.monitor
        .start(session("https://booking.example.gov/", vec![haverhill()]), Duration::from_secs(60))
        .unwrap();
    wait_for_ticks(&mut rx, 1).await;
    h.browser.site.open_slot(27, "2024-06-12", "14:30");
    wait_for_ticks(&mut rx, 2).await;
    h.monitor.stop().unwrap();
    h.monitor.join().await.unwrap();

    let emails = h.email.delivered();
    assert_eq!(emails.len(), 2);
    assert!(emails[1].text.contains("2024-06-12 14:30"));
    assert!(!emails[1].text.contains("2024-06-10 10:00"));
}

#[tokio::test]
async fn test_stop_mid_tick_releases_page_and_discards_results() {
    let gate = PageGate::default();
    let site = FakeSite::gated(gate.clone());
    site.open_slot(27, "2024-06-10", "10:00");
    let h = harness(site, None);

    h.monitor
        .start(session("https://booking.example.gov/", vec![haverhill()]), Duration::from_secs(60))
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), gate.entered.notified())
        .await
        .expect("scan never reached the page");
    h.monitor.stop().unwrap();
    gate.release.notify_one();

    tokio::time::timeout(Duration::from_secs(5), h.monitor.join())
        .await
        .expect("worker did not exit")
        .unwrap();

    assert_eq!(h.browser.opened.load(Ordering::SeqCst), 1);
    assert_eq!(h.browser.closed.load(Ordering::SeqCst), 1);
    assert_eq!(h.email.attempts(), 0);
    assert_eq!(h.sms.attempts(), 0);

    let status = h.monitor.status();
    assert_eq!(status.state, MonitorState::Stopped);
    assert_eq!(status.ticks, 0);
    assert!(status.history.is_empty());
}

#[tokio::test]
async fn test_expired_session_is_refreshed_on_next_tick() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(302).insert_header("location", "/Home/SessionExpired"))
        .mount(&server)
        .await;

    let site = FakeSite::new();
    site.open_slot(27, "2024-06-10", "10:00");
    let replayer = DirectRequestReplayer::new(ReplayConfig::default(), "slot-watcher-test", Duration::from_secs(5)).unwrap();
    let h = harness(site, Some(replayer));
    let mut rx = h.monitor.subscribe();

    h.monitor
        .start(session(&server.uri(), vec![haverhill()]), Duration::from_millis(20))
        .unwrap();
    wait_for_ticks(&mut rx, 2).await;
    h.monitor.stop().unwrap();
    h.monitor.join().await.unwrap();

    assert!(h.extractor.calls.load(Ordering::SeqCst) >= 1);

    let status = h.monitor.status();
    let first = &status.history[0];
    assert_eq!(first.results[0].strategy_used, StrategyKind::UiA);
    assert!(first.results[0].fallback_reason.is_some());
    assert_eq!(first.new_matches.len(), 1);
    assert_eq!(h.email.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_restart_after_stop_starts_with_empty_registry() {
    let h = harness(FakeSite::new(), None);
    h.browser.site.open_slot(27, "2024-06-10", "10:00");
    let mut rx = h.monitor.subscribe();

    for _ in 0..2 {
        h.monitor
            .start(session("https://booking.example.gov/", vec![haverhill()]), Duration::from_secs(60))
            .unwrap();
        wait_for_ticks(&mut rx, 1).await;
        h.monitor.stop().unwrap();
        h.monitor.join().await.unwrap();
    }

    assert_eq!(h.email.attempts(), 2);
}
