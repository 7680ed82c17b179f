use chrono::{DateTime, Duration as ChronoDuration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::LazyLock;
use url::Url;

use crate::models::{Location, TimePreferences};
use crate::utils::error::TemplateError;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{(location_id|location_name|zip|token\.([A-Za-z0-9_\-\.]+))\}")
        .expect("placeholder pattern is valid")
});

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonalInfo {
    pub name: String,
    pub zip: String,
    pub email: Option<String>,
    pub phone: Option<String>,
}

/// Everything the session extraction collaborator needs to build a [`SessionContext`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionRequest {
    pub url: String,
    pub personal_info: PersonalInfo,
    pub locations: Vec<Location>,
    pub time_preferences: TimePreferences,
}

/// One visit to the booking site. Immutable after extraction; rebuilt when it goes stale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionContext {
    /// URL the session was extracted from; re-extraction starts here.
    pub entry_url: String,
    /// URL the site settled on after redirects; relative paths resolve against it.
    pub base_url: Url,
    pub session_tokens: HashMap<String, String>,
    pub personal_info: PersonalInfo,
    pub locations: Vec<Location>,
    pub time_preferences: TimePreferences,
    pub extracted_at: DateTime<Utc>,
}

impl SessionContext {
    pub fn new(
        request: ExtractionRequest,
        base_url: Url,
        session_tokens: HashMap<String, String>,
    ) -> Self {
        Self {
            entry_url: request.url,
            base_url,
            session_tokens,
            personal_info: request.personal_info,
            locations: request.locations,
            time_preferences: request.time_preferences,
            extracted_at: Utc::now(),
        }
    }

    pub fn refresh_request(&self) -> ExtractionRequest {
        ExtractionRequest {
            url: self.entry_url.clone(),
            personal_info: self.personal_info.clone(),
            locations: self.locations.clone(),
            time_preferences: self.time_preferences.clone(),
        }
    }

    pub fn token(&self, name: &str) -> Option<&str> {
        self.session_tokens.get(name).map(String::as_str)
    }

    pub fn is_stale(&self, max_age: std::time::Duration, now: DateTime<Utc>) -> bool {
        match ChronoDuration::from_std(max_age) {
            Ok(max_age) => now.signed_duration_since(self.extracted_at) > max_age,
            Err(_) => false,
        }
    }

    /// Expand `{location_id}`, `{location_name}`, `{zip}` and `{token.NAME}` placeholders.
    ///
    /// Fails with the first token the session does not hold.
    pub fn render(&self, template: &str, location: &Location) -> Result<String, TemplateError> {
        let mut missing = None;
        let rendered = PLACEHOLDER.replace_all(template, |caps: &regex::Captures<'_>| {
            if let Some(token) = caps.get(2) {
                match self.token(token.as_str()) {
                    Some(value) => value.to_string(),
                    None => {
                        missing.get_or_insert_with(|| token.as_str().to_string());
                        String::new()
                    }
                }
            } else {
                match &caps[1] {
                    "location_id" => location.id.to_string(),
                    "location_name" => location.name.clone(),
                    _ => self.personal_info.zip.clone(),
                }
            }
        });

        match missing {
            Some(name) => Err(TemplateError::MissingToken(name)),
            None => Ok(rendered.into_owned()),
        }
    }

    /// Render a path template and resolve it against the session's base URL.
    pub fn resolve(&self, template: &str, location: &Location) -> Result<Url, TemplateError> {
        let path = self.render(template, location)?;
        self.base_url.join(&path).map_err(|e| TemplateError::InvalidUrl {
            reason: e.to_string(),
            path,
        })
    }
}
