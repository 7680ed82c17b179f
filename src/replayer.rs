use reqwest::{redirect, Client, Method, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::{ReplayConfig, ReplayMethod, ReplayStep};
use crate::models::{Extraction, Location, SessionContext};
use crate::utils::error::{AppError, RemoteProtocolError};

/// Statuses the site uses for a dead session besides redirecting to the start page.
const SESSION_EXPIRED_STATUSES: [u16; 3] = [401, 403, 440];

/// The availability payload the last replay step must return.
#[derive(Debug, Deserialize)]
struct AvailabilityPayload {
    #[serde(default, alias = "locationId", alias = "LocationId")]
    location_id: Option<Value>,
    #[serde(alias = "Slots", alias = "availableSlots", alias = "AvailableSlots")]
    slots: Vec<Value>,
}

/// Queries availability with plain HTTP requests, replaying what the browser would send.
pub struct DirectRequestReplayer {
    client: Client,
    plan: ReplayConfig,
    timeout: Duration,
}

impl DirectRequestReplayer {
    pub fn new(plan: ReplayConfig, user_agent: &str, timeout: Duration) -> Result<Self, AppError> {
        let client = Client::builder()
            .redirect(redirect::Policy::none())
            .user_agent(user_agent)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            plan,
            timeout,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.plan.enabled && !self.plan.steps.is_empty()
    }

    pub async fn query(
        &self,
        session: &SessionContext,
        location: &Location,
    ) -> Result<Extraction, RemoteProtocolError> {
        tokio::time::timeout(self.timeout, self.replay(session, location))
            .await
            .map_err(|_| RemoteProtocolError::Timeout {
                after_ms: self.timeout.as_millis() as u64,
            })?
    }

    async fn replay(
        &self,
        session: &SessionContext,
        location: &Location,
    ) -> Result<Extraction, RemoteProtocolError> {
        let cookie = self.cookie_header(session)?;
        let mut body = String::new();

        for (index, step) in self.plan.steps.iter().enumerate() {
            let url = session.resolve(&step.path, location)?;
            debug!(location_id = location.id, "Replaying step {} {}", index + 1, url);

            let request = self
                .client
                .request(method_of(step), url)
                .headers(render_headers(session, location, step)?);
            let request = match &cookie {
                Some(cookie) => request.header(reqwest::header::COOKIE, cookie),
                None => request,
            };
            let request = if step.form.is_empty() {
                request
            } else {
                request.form(&render_form(session, location, &step.form)?)
            };

            let response = request.send().await.map_err(|e| {
                if e.is_timeout() {
                    RemoteProtocolError::Timeout {
                        after_ms: self.timeout.as_millis() as u64,
                    }
                } else {
                    RemoteProtocolError::Transport(e.to_string())
                }
            })?;

            check_status(response.status())?;
            body = response
                .text()
                .await
                .map_err(|e| RemoteProtocolError::Transport(e.to_string()))?;
        }

        parse_availability(location, &body)
    }

    fn cookie_header(&self, session: &SessionContext) -> Result<Option<String>, RemoteProtocolError> {
        if self.plan.cookie_tokens.is_empty() {
            return Ok(None);
        }
        let pairs = self
            .plan
            .cookie_tokens
            .iter()
            .map(|name| {
                session
                    .token(name)
                    .map(|value| format!("{}={}", name, value))
                    .ok_or_else(|| RemoteProtocolError::MissingToken(name.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Some(pairs.join("; ")))
    }
}

fn method_of(step: &ReplayStep) -> Method {
    match step.method {
        ReplayMethod::Get => Method::GET,
        ReplayMethod::Post => Method::POST,
    }
}

fn render_form(
    session: &SessionContext,
    location: &Location,
    form: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, String>, RemoteProtocolError> {
    form.iter()
        .map(|(name, template)| -> Result<(String, String), RemoteProtocolError> {
            Ok((name.clone(), session.render(template, location)?))
        })
        .collect()
}

fn render_headers(
    session: &SessionContext,
    location: &Location,
    step: &ReplayStep,
) -> Result<reqwest::header::HeaderMap, RemoteProtocolError> {
    let mut headers = reqwest::header::HeaderMap::new();
    for (name, template) in &step.headers {
        let value = session.render(template, location)?;
        let name = reqwest::header::HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| RemoteProtocolError::InvalidTemplate(format!("header '{}': {}", name, e)))?;
        let value = reqwest::header::HeaderValue::from_str(&value)
            .map_err(|e| RemoteProtocolError::InvalidTemplate(format!("header '{}': {}", name, e)))?;
        headers.insert(name, value);
    }
    Ok(headers)
}

fn check_status(status: StatusCode) -> Result<(), RemoteProtocolError> {
    let code = status.as_u16();
    if status.is_redirection() || SESSION_EXPIRED_STATUSES.contains(&code) {
        return Err(RemoteProtocolError::SessionExpired { status: code });
    }
    if !status.is_success() {
        return Err(RemoteProtocolError::UnexpectedStatus(code));
    }
    Ok(())
}

/// Validate the final response before trusting any of it.
fn parse_availability(location: &Location, body: &str) -> Result<Extraction, RemoteProtocolError> {
    let payload: AvailabilityPayload =
        serde_json::from_str(body).map_err(|e| RemoteProtocolError::SchemaMismatch {
            reason: e.to_string(),
        })?;

    if let Some(reported) = &payload.location_id {
        let matches = match reported {
            Value::Number(n) => n.as_u64() == Some(u64::from(location.id)),
            Value::String(s) => s.trim() == location.id.to_string(),
            Value::Null => true,
            _ => false,
        };
        if !matches {
            return Err(RemoteProtocolError::SchemaMismatch {
                reason: format!("payload is for location {}, expected {}", reported, location.id),
            });
        }
    }

    let extraction = Extraction::from_json_entries(location.id, &payload.slots);
    if !payload.slots.is_empty() && extraction.slots.is_empty() {
        return Err(RemoteProtocolError::SchemaMismatch {
            reason: format!("none of {} slot entries could be read", payload.slots.len()),
        });
    }
    if extraction.skipped > 0 {
        warn!(
            location_id = location.id,
            "Skipped {} malformed slot entr(ies) in replay payload",
            extraction.skipped
        );
    }

    Ok(extraction)
}
