use serde::{Deserialize, Serialize};
use tokio::time::{Duration, Instant};
use uuid::Uuid;

use crate::models::Channel;
use crate::utils::error::ProviderError;

/// A rendered alert, ready to hand to a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub channel: Channel,
    pub recipient: String,
    pub subject: String,
    pub text: String,
    pub html: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    /// Ready for the next attempt.
    Pending,
    /// Backing off after a failed attempt.
    Waiting { next_eligible_at: Instant },
    Delivered { message_id: Option<String> },
    Failed { last_error: ProviderError },
}

/// Delivery of one alert over one channel, tracked attempt by attempt.
#[derive(Debug, Clone)]
pub struct NotificationJob {
    pub id: Uuid,
    pub channel: Channel,
    pub recipient: String,
    pub payload: OutboundMessage,
    pub attempt: u32,
    pub max_attempts: u32,
    pub state: JobState,
    pub last_error: Option<ProviderError>,
}

impl NotificationJob {
    pub fn new(payload: OutboundMessage, max_attempts: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            channel: payload.channel,
            recipient: payload.recipient.clone(),
            payload,
            attempt: 0,
            max_attempts: max_attempts.max(1),
            state: JobState::Pending,
            last_error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, JobState::Delivered { .. } | JobState::Failed { .. })
    }

    /// Move from `Waiting` back to `Pending` once the backoff has elapsed.
    pub fn poll_ready(&mut self, now: Instant) -> bool {
        match self.state {
            JobState::Pending => true,
            JobState::Waiting { next_eligible_at } if now >= next_eligible_at => {
                self.state = JobState::Pending;
                true
            }
            _ => false,
        }
    }

    /// Record that an attempt is starting. Returns the attempt number (1-based).
    pub fn begin_attempt(&mut self) -> u32 {
        self.attempt += 1;
        self.attempt
    }

    pub fn record_success(&mut self, message_id: Option<String>) {
        self.state = JobState::Delivered { message_id };
    }

    /// Record a failed attempt, either scheduling the next one after `backoff` or giving up.
    pub fn record_failure(&mut self, error: ProviderError, backoff: Option<Duration>, now: Instant) {
        self.last_error = Some(error.clone());
        self.state = match backoff {
            Some(delay) if self.attempt < self.max_attempts => JobState::Waiting {
                next_eligible_at: now + delay,
            },
            _ => JobState::Failed { last_error: error },
        };
    }

    pub fn next_eligible_at(&self) -> Option<Instant> {
        match self.state {
            JobState::Waiting { next_eligible_at } => Some(next_eligible_at),
            _ => None,
        }
    }
}
