use chrono::NaiveTime;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use slot_watcher::models::{AppointmentSlot, Channel};
use slot_watcher::plugins::{NotificationDispatcher, RecipientConfig, RetryPolicy};

use super::*;

fn recipient(channels: Vec<Channel>) -> RecipientConfig {
    RecipientConfig {
        email: Some("pat@example.com".to_string()),
        phone: Some("+15555550100".to_string()),
        channels,
    }
}

fn ten_am() -> Vec<AppointmentSlot> {
    vec![AppointmentSlot::new(
        27,
        day("2024-06-10"),
        NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
    )]
}

#[tokio::test(start_paused = true)]
async fn test_email_exhausts_retries_while_sms_recovers() {
    let email = Arc::new(CountingProvider::new(Channel::Email, usize::MAX));
    let sms = Arc::new(CountingProvider::new(Channel::Sms, 1));
    let dispatcher = NotificationDispatcher::new(RetryPolicy::default())
        .with_provider(email.clone())
        .with_provider(sms.clone());

    let started = Instant::now();
    let report = dispatcher
        .notify(&recipient(vec![Channel::Email, Channel::Sms]), &ten_am(), &[haverhill()])
        .await;

    let email_outcome = report.outcome(Channel::Email).unwrap();
    assert!(!email_outcome.delivered);
    assert_eq!(email_outcome.attempts, 3);
    assert!(email_outcome.error.as_deref().unwrap().contains("gateway unavailable (attempt 3)"));

    let sms_outcome = report.outcome(Channel::Sms).unwrap();
    assert!(sms_outcome.delivered);
    assert_eq!(sms_outcome.attempts, 2);
    assert_eq!(sms_outcome.message_id.as_deref(), Some("SMS-2"));

    assert!(!report.all_delivered());
    assert_eq!(email.attempts(), 3);
    assert_eq!(sms.attempts(), 2);
    // Backoff between email attempts: 500ms then 1000ms, overlapping the SMS retry.
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(1500) && elapsed < Duration::from_millis(2000));
}

#[tokio::test(start_paused = true)]
async fn test_missing_provider_does_not_block_other_channel() {
    let email = Arc::new(CountingProvider::reliable(Channel::Email));
    let dispatcher = NotificationDispatcher::new(RetryPolicy::default()).with_provider(email.clone());

    let report = dispatcher
        .notify(&recipient(vec![Channel::Email, Channel::Sms]), &ten_am(), &[haverhill()])
        .await;

    assert!(report.outcome(Channel::Email).unwrap().delivered);
    let sms_outcome = report.outcome(Channel::Sms).unwrap();
    assert!(!sms_outcome.delivered);
    assert!(sms_outcome.attempts <= 1);
    assert_eq!(email.delivered().len(), 1);
}

#[tokio::test]
async fn test_unselected_channel_is_not_contacted() {
    let email = Arc::new(CountingProvider::reliable(Channel::Email));
    let sms = Arc::new(CountingProvider::reliable(Channel::Sms));
    let dispatcher = NotificationDispatcher::new(RetryPolicy::default())
        .with_provider(email.clone())
        .with_provider(sms.clone());

    let report = dispatcher
        .notify(&recipient(vec![Channel::Sms]), &ten_am(), &[haverhill()])
        .await;

    assert!(report.all_delivered());
    assert!(report.outcome(Channel::Email).is_none());
    assert_eq!(email.attempts(), 0);
    assert_eq!(sms.delivered()[0].recipient, "+15555550100");
}
