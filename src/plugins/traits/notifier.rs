use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::{Channel, OutboundMessage};
use crate::utils::error::ProviderError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub message_id: Option<String>,
}

/// A delivery channel (email, SMS). Implementations make exactly one attempt per call;
/// retries belong to the dispatcher.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationProvider: Send + Sync {
    fn channel(&self) -> Channel;

    async fn send(&self, message: &OutboundMessage) -> Result<DeliveryReceipt, ProviderError>;
}
