use async_trait::async_trait;
use lettre::message::{header, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::debug;

use crate::config::SmtpConfig;
use crate::models::{Channel, OutboundMessage};
use crate::plugins::traits::{DeliveryReceipt, NotificationProvider};
use crate::utils::error::ProviderError;

/// Sends alerts over SMTP as a plain-text + HTML multipart message.
pub struct EmailNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl EmailNotifier {
    pub fn new(config: &SmtpConfig) -> Result<Self, ProviderError> {
        let from_address = config
            .from_address
            .as_deref()
            .or(config.username.as_deref())
            .ok_or_else(|| ProviderError::Misconfigured("smtp.from_address is not set".to_string()))?;
        let from: Mailbox = format!("{} <{}>", config.from_name, from_address)
            .parse()
            .map_err(|e| ProviderError::Misconfigured(format!("invalid sender address: {}", e)))?;

        let builder = if config.use_tls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
                .map_err(|e| ProviderError::Misconfigured(format!("invalid SMTP relay: {}", e)))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
        }
        .port(config.port);

        let builder = match (&config.username, &config.password) {
            (Some(username), Some(password)) => {
                builder.credentials(Credentials::new(username.clone(), password.clone()))
            }
            _ => builder,
        };

        Ok(Self {
            transport: builder.build(),
            from,
        })
    }

    fn build_message(&self, message: &OutboundMessage) -> Result<Message, ProviderError> {
        let to: Mailbox = message
            .recipient
            .parse()
            .map_err(|e| ProviderError::Misconfigured(format!("invalid recipient address: {}", e)))?;

        let builder = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(message.subject.clone());

        let built = match &message.html {
            Some(html) => builder.multipart(
                MultiPart::alternative()
                    .singlepart(
                        SinglePart::builder()
                            .header(header::ContentType::TEXT_PLAIN)
                            .body(message.text.clone()),
                    )
                    .singlepart(
                        SinglePart::builder()
                            .header(header::ContentType::TEXT_HTML)
                            .body(html.clone()),
                    ),
            ),
            None => builder
                .header(header::ContentType::TEXT_PLAIN)
                .body(message.text.clone()),
        };

        built.map_err(|e| ProviderError::Misconfigured(format!("cannot build email: {}", e)))
    }
}

#[async_trait]
impl NotificationProvider for EmailNotifier {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    async fn send(&self, message: &OutboundMessage) -> Result<DeliveryReceipt, ProviderError> {
        let email = self.build_message(message)?;

        match self.transport.send(email).await {
            Ok(response) => {
                debug!(channel = %Channel::Email, "SMTP accepted message: {:?}", response.code());
                Ok(DeliveryReceipt {
                    message_id: response.message().next().map(str::to_string),
                })
            }
            Err(e) if e.is_permanent() => Err(ProviderError::Rejected {
                status: e
                    .status()
                    .and_then(|code| code.to_string().parse().ok())
                    .unwrap_or_default(),
                body: e.to_string(),
            }),
            Err(e) => Err(ProviderError::Transport(e.to_string())),
        }
    }
}
