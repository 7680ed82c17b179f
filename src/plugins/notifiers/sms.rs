use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::config::SmsConfig;
use crate::models::{Channel, OutboundMessage};
use crate::plugins::traits::{DeliveryReceipt, NotificationProvider};
use crate::utils::error::ProviderError;

#[derive(Debug, Deserialize)]
struct MessageResource {
    sid: Option<String>,
}

/// Sends alerts through a Twilio-compatible REST gateway.
pub struct SmsNotifier {
    client: Client,
    endpoint: String,
    account_sid: String,
    auth_token: String,
    from_number: String,
    timeout: Duration,
}

impl SmsNotifier {
    pub fn new(config: &SmsConfig, timeout: Duration) -> Result<Self, ProviderError> {
        let missing = |field: &str| ProviderError::Misconfigured(format!("sms.{} is not set", field));
        let account_sid = config.account_sid.clone().ok_or_else(|| missing("account_sid"))?;
        let auth_token = config.auth_token.clone().ok_or_else(|| missing("auth_token"))?;
        let from_number = config.from_number.clone().ok_or_else(|| missing("from_number"))?;

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::Misconfigured(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: format!(
                "{}/2010-04-01/Accounts/{}/Messages.json",
                config.api_base.trim_end_matches('/'),
                account_sid
            ),
            account_sid,
            auth_token,
            from_number,
            timeout,
        })
    }
}

#[async_trait]
impl NotificationProvider for SmsNotifier {
    fn channel(&self) -> Channel {
        Channel::Sms
    }

    async fn send(&self, message: &OutboundMessage) -> Result<DeliveryReceipt, ProviderError> {
        let form = [
            ("To", message.recipient.as_str()),
            ("From", self.from_number.as_str()),
            ("Body", message.text.as_str()),
        ];

        let response = self
            .client
            .post(&self.endpoint)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&form)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout {
                        after_ms: self.timeout.as_millis() as u64,
                    }
                } else {
                    ProviderError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if status.is_server_error() {
            return Err(ProviderError::Transport(format!("gateway returned HTTP {}: {}", status, body)));
        }
        if !status.is_success() {
            return Err(ProviderError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let message_id = serde_json::from_str::<MessageResource>(&body)
            .ok()
            .and_then(|resource| resource.sid);
        debug!(channel = %Channel::Sms, "Gateway accepted message {:?}", message_id);

        Ok(DeliveryReceipt { message_id })
    }
}
