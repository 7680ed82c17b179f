use futures::future::join_all;
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_retry::strategy::ExponentialBackoff;
use tracing::{error, info, warn};

use super::notifiers::{EmailNotifier, SmsNotifier};
use super::traits::NotificationProvider;
use crate::config::{AppConfig, RetryConfig};
use crate::models::{location_name, AppointmentSlot, Channel, JobState, Location, NotificationJob, OutboundMessage};
use crate::utils::error::{DeliveryFailure, ProviderError};

/// Slots listed individually in an SMS before the rest are summarised.
const SMS_SLOT_LIMIT: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub send_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            send_timeout: Duration::from_millis(config.send_timeout_ms),
        }
    }

    /// Delays between attempts: base, 2x base, 4x base, ... capped at `max_delay`.
    pub fn backoff(&self) -> ExponentialBackoff {
        let factor = (self.base_delay.as_millis() as u64 / 2).max(1);
        ExponentialBackoff::from_millis(2)
            .factor(factor)
            .max_delay(self.max_delay)
    }
}

/// Where alerts go and over which channels.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientConfig {
    pub email: Option<String>,
    pub phone: Option<String>,
    pub channels: Vec<Channel>,
}

impl RecipientConfig {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            email: config.notifications.recipient.email.clone(),
            phone: config.notifications.recipient.phone.clone(),
            channels: config.monitor.channels.clone(),
        }
    }

    pub fn address_for(&self, channel: Channel) -> Option<&str> {
        match channel {
            Channel::Email => self.email.as_deref(),
            Channel::Sms => self.phone.as_deref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelOutcome {
    pub channel: Channel,
    pub recipient: Option<String>,
    pub delivered: bool,
    pub attempts: u32,
    pub elapsed_ms: u64,
    pub message_id: Option<String>,
    pub error: Option<String>,
}

impl ChannelOutcome {
    fn misconfigured(channel: Channel, recipient: Option<String>, reason: String) -> Self {
        Self {
            channel,
            recipient,
            delivered: false,
            attempts: 0,
            elapsed_ms: 0,
            message_id: None,
            error: Some(ProviderError::Misconfigured(reason).to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchReport {
    pub outcomes: Vec<ChannelOutcome>,
}

impl DispatchReport {
    pub fn outcome(&self, channel: Channel) -> Option<&ChannelOutcome> {
        self.outcomes.iter().find(|o| o.channel == channel)
    }

    pub fn all_delivered(&self) -> bool {
        self.outcomes.iter().all(|o| o.delivered)
    }
}

/// Fans an alert out to every configured channel, retrying each independently.
pub struct NotificationDispatcher {
    providers: HashMap<Channel, Arc<dyn NotificationProvider>>,
    unavailable: HashMap<Channel, String>,
    policy: RetryPolicy,
}

impl NotificationDispatcher {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            providers: HashMap::new(),
            unavailable: HashMap::new(),
            policy,
        }
    }

    /// Build providers for the configured channels. A provider that cannot be built is
    /// reported as misconfigured whenever that channel is used.
    pub fn from_config(config: &AppConfig) -> Self {
        let policy = RetryPolicy::from_config(&config.notifications.retry);
        let mut dispatcher = Self::new(policy.clone());

        for channel in &config.monitor.channels {
            let provider: Result<Arc<dyn NotificationProvider>, ProviderError> = match channel {
                Channel::Email => EmailNotifier::new(&config.notifications.smtp)
                    .map(|n| Arc::new(n) as Arc<dyn NotificationProvider>),
                Channel::Sms => SmsNotifier::new(&config.notifications.sms, policy.send_timeout)
                    .map(|n| Arc::new(n) as Arc<dyn NotificationProvider>),
            };

            match provider {
                Ok(provider) => dispatcher.register(provider),
                Err(e) => {
                    warn!(channel = %channel, "Notification channel unavailable: {}", e);
                    let reason = match e {
                        ProviderError::Misconfigured(reason) => reason,
                        other => other.to_string(),
                    };
                    dispatcher.unavailable.insert(*channel, reason);
                }
            }
        }

        dispatcher
    }

    pub fn register(&mut self, provider: Arc<dyn NotificationProvider>) {
        let channel = provider.channel();
        self.unavailable.remove(&channel);
        self.providers.insert(channel, provider);
    }

    pub fn with_provider(mut self, provider: Arc<dyn NotificationProvider>) -> Self {
        self.register(provider);
        self
    }

    pub fn has_provider(&self, channel: Channel) -> bool {
        self.providers.contains_key(&channel)
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Alert `recipient` about `slots` on each of their channels. Channels run concurrently.
    pub async fn notify(
        &self,
        recipient: &RecipientConfig,
        slots: &[AppointmentSlot],
        locations: &[Location],
    ) -> DispatchReport {
        if slots.is_empty() {
            return DispatchReport::default();
        }

        let summary = slot_summary(slots, locations);
        let mut channels = recipient.channels.clone();
        channels.sort();
        channels.dedup();

        let mut outcomes = Vec::new();
        let mut jobs = Vec::new();

        for channel in channels {
            let Some(address) = recipient.address_for(channel) else {
                outcomes.push(ChannelOutcome::misconfigured(
                    channel,
                    None,
                    format!("no {} address configured", channel),
                ));
                continue;
            };

            let Some(provider) = self.providers.get(&channel) else {
                let reason = self
                    .unavailable
                    .get(&channel)
                    .cloned()
                    .unwrap_or_else(|| format!("no {} provider registered", channel));
                outcomes.push(ChannelOutcome::misconfigured(channel, Some(address.to_string()), reason));
                continue;
            };

            let message = compose(channel, address, slots, locations);
            let job = NotificationJob::new(message, self.policy.max_attempts);
            jobs.push(self.run_job(Arc::clone(provider), job, &summary));
        }

        outcomes.extend(join_all(jobs).await);
        outcomes.sort_by_key(|o| o.channel);

        for outcome in &outcomes {
            let result = if outcome.delivered { "delivered" } else { "failed" };
            counter!(
                "slot_watcher_notifications_total",
                "channel" => outcome.channel.as_str(),
                "outcome" => result
            )
            .increment(1);
        }

        DispatchReport { outcomes }
    }

    async fn run_job(
        &self,
        provider: Arc<dyn NotificationProvider>,
        mut job: NotificationJob,
        summary: &str,
    ) -> ChannelOutcome {
        let started = Instant::now();
        let mut delays = self.policy.backoff();

        while !job.is_terminal() {
            if let Some(at) = job.next_eligible_at() {
                tokio::time::sleep_until(at).await;
            }
            if !job.poll_ready(Instant::now()) {
                continue;
            }

            let attempt = job.begin_attempt();
            let result = match tokio::time::timeout(self.policy.send_timeout, provider.send(&job.payload)).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Timeout {
                    after_ms: self.policy.send_timeout.as_millis() as u64,
                }),
            };

            match result {
                Ok(receipt) => {
                    info!(channel = %job.channel, attempt, "Delivered alert to {}", job.recipient);
                    job.record_success(receipt.message_id);
                }
                Err(e) => {
                    warn!(channel = %job.channel, attempt, "Delivery attempt failed: {}", e);
                    // Retrying cannot fix a misconfigured provider.
                    let backoff = match e {
                        ProviderError::Misconfigured(_) => None,
                        _ => delays.next(),
                    };
                    job.record_failure(e, backoff, Instant::now());
                }
            }
        }

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let last_error = match job.state {
            JobState::Delivered { message_id } => {
                return ChannelOutcome {
                    channel: job.channel,
                    recipient: Some(job.recipient),
                    delivered: true,
                    attempts: job.attempt,
                    elapsed_ms,
                    message_id,
                    error: None,
                };
            }
            JobState::Failed { last_error } => last_error,
            JobState::Pending | JobState::Waiting { .. } => job
                .last_error
                .clone()
                .unwrap_or_else(|| ProviderError::Transport("delivery abandoned".to_string())),
        };

        let failure = DeliveryFailure {
            channel: job.channel,
            recipient: job.recipient.clone(),
            attempts: job.attempt,
            last_error,
        };
        error!(
            channel = %failure.channel,
            recipient = %failure.recipient,
            attempts = failure.attempts,
            slots = %summary,
            "Giving up on alert: {}",
            failure
        );

        ChannelOutcome {
            channel: job.channel,
            recipient: Some(job.recipient),
            delivered: false,
            attempts: job.attempt,
            elapsed_ms,
            message_id: None,
            error: Some(failure.last_error.to_string()),
        }
    }
}

/// Slots ordered by configured location order, then date and time.
fn ordered_slots<'a>(slots: &'a [AppointmentSlot], locations: &[Location]) -> Vec<&'a AppointmentSlot> {
    let rank = |id: u32| locations.iter().position(|l| l.id == id).unwrap_or(usize::MAX);
    let mut ordered: Vec<&AppointmentSlot> = slots.iter().collect();
    ordered.sort_by_key(|s| (rank(s.location_id), s.date, s.time));
    ordered
}

fn location_names(slots: &[&AppointmentSlot], locations: &[Location]) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for slot in slots {
        let name = location_name(locations, slot.location_id);
        if !names.contains(&name) {
            names.push(name);
        }
    }
    names
}

/// One-line description used in logs, e.g. `Haverhill 2024-06-10 10:00 (+2 more)`.
pub fn slot_summary(slots: &[AppointmentSlot], locations: &[Location]) -> String {
    let ordered = ordered_slots(slots, locations);
    match ordered.split_first() {
        Some((first, rest)) => {
            let head = format!("{} {}", location_name(locations, first.location_id), first.display_time());
            if rest.is_empty() {
                head
            } else {
                format!("{} (+{} more)", head, rest.len())
            }
        }
        None => "no slots".to_string(),
    }
}

pub fn compose(channel: Channel, recipient: &str, slots: &[AppointmentSlot], locations: &[Location]) -> OutboundMessage {
    let ordered = ordered_slots(slots, locations);
    let names = location_names(&ordered, locations);
    let subject = format!("New appointment slots at {}", names.join(", "));

    match channel {
        Channel::Email => OutboundMessage {
            channel,
            recipient: recipient.to_string(),
            subject,
            text: format_text_body(&ordered, locations),
            html: Some(format_html_body(&ordered, locations)),
        },
        Channel::Sms => OutboundMessage {
            channel,
            recipient: recipient.to_string(),
            subject,
            text: format_sms_body(&ordered, locations),
            html: None,
        },
    }
}

fn format_text_body(slots: &[&AppointmentSlot], locations: &[Location]) -> String {
    let mut text = String::new();

    text.push_str("SLOT WATCHER ALERT\n\n");
    text.push_str("New appointment slots matching your preferences:\n\n");
    for slot in slots {
        text.push_str(&format!(
            "{}: {}\n",
            location_name(locations, slot.location_id),
            slot.display_time()
        ));
    }
    text.push_str("\nBook soon, slots go quickly.\n");

    text
}

fn format_html_body(slots: &[&AppointmentSlot], locations: &[Location]) -> String {
    let mut html = String::new();

    html.push_str(
        r#"
<!DOCTYPE html>
<html>
<head>
    <style>
        body { font-family: Arial, sans-serif; margin: 20px; }
        .header { background: #f0f0f0; padding: 15px; border-radius: 5px; }
        .slot { margin: 5px 0; padding: 10px; background: #e8f5e8; border-left: 4px solid #4CAF50; }
    </style>
</head>
<body>
    <div class="header"><strong>New appointment slots matching your preferences</strong></div>
"#,
    );

    for slot in slots {
        html.push_str(&format!(
            r#"    <div class="slot"><strong>{}</strong> {}</div>
"#,
            location_name(locations, slot.location_id),
            slot.display_time()
        ));
    }

    html.push_str(
        r#"
</body>
</html>
"#,
    );

    html
}

fn format_sms_body(slots: &[&AppointmentSlot], locations: &[Location]) -> String {
    let listed: Vec<String> = slots
        .iter()
        .take(SMS_SLOT_LIMIT)
        .map(|slot| format!("{} {}", location_name(locations, slot.location_id), slot.display_time()))
        .collect();

    let mut text = format!("Slot Watcher: {} new slot(s). {}", slots.len(), listed.join("; "));
    if slots.len() > SMS_SLOT_LIMIT {
        text.push_str(&format!(" and {} more", slots.len() - SMS_SLOT_LIMIT));
    }
    text
}
