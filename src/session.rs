use async_trait::async_trait;
use regex::Regex;
use reqwest::{header::SET_COOKIE, Client};
use scraper::{Html, Selector};
use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

use crate::config::SiteConfig;
use crate::models::{ExtractionRequest, SessionContext};
use crate::utils::error::{AppError, ExtractionError};

/// Token name for the GUID the site embeds in its appointment URLs.
pub const APPOINTMENT_ID_TOKEN: &str = "appointment_id";

static GUID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$")
        .expect("GUID pattern is valid")
});

/// Turns an entry URL plus personal info into a usable [`SessionContext`].
#[async_trait]
pub trait SessionExtractor: Send + Sync {
    async fn extract(&self, request: ExtractionRequest) -> Result<SessionContext, ExtractionError>;
}

/// Collects session tokens from the entry page over plain HTTP.
pub struct HttpSessionExtractor {
    client: Client,
    required_tokens: Vec<String>,
    timeout: Duration,
}

impl HttpSessionExtractor {
    pub fn new(site: &SiteConfig) -> Result<Self, AppError> {
        let timeout = Duration::from_secs(site.request_timeout);
        let client = Client::builder()
            .user_agent(site.user_agent.as_str())
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            required_tokens: site.required_tokens.clone(),
            timeout,
        })
    }

    async fn fetch(&self, url: Url) -> Result<(Url, HashMap<String, String>, String), ExtractionError> {
        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                ExtractionError::Timeout {
                    after_ms: self.timeout.as_millis() as u64,
                }
            } else {
                ExtractionError::Unreachable(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ExtractionError::UnexpectedPage(format!("entry page returned HTTP {}", status)));
        }

        let final_url = response.url().clone();
        let cookies = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .filter_map(parse_set_cookie)
            .collect();
        let body = response
            .text()
            .await
            .map_err(|e| ExtractionError::Unreachable(e.to_string()))?;

        Ok((final_url, cookies, body))
    }
}

#[async_trait]
impl SessionExtractor for HttpSessionExtractor {
    async fn extract(&self, request: ExtractionRequest) -> Result<SessionContext, ExtractionError> {
        let url = Url::parse(&request.url).map_err(|_| ExtractionError::MalformedUrl(request.url.clone()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ExtractionError::MalformedUrl(request.url.clone()));
        }

        debug!("Extracting session from {}", url);
        let (final_url, mut tokens, body) = tokio::time::timeout(self.timeout, self.fetch(url))
            .await
            .map_err(|_| ExtractionError::Timeout {
                after_ms: self.timeout.as_millis() as u64,
            })??;

        tokens.extend(hidden_inputs(&body));
        if let Some(id) = appointment_id(&final_url) {
            tokens.insert(APPOINTMENT_ID_TOKEN.to_string(), id);
        }

        let missing: Vec<&str> = self
            .required_tokens
            .iter()
            .filter(|name| !tokens.contains_key(name.as_str()))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(ExtractionError::UnexpectedPage(format!(
                "missing session token(s): {}",
                missing.join(", ")
            )));
        }

        info!("Extracted session with {} token(s) from {}", tokens.len(), final_url);
        Ok(SessionContext::new(request, final_url, tokens))
    }
}

/// `name=value; Path=/; HttpOnly` -> `(name, value)`.
fn parse_set_cookie(header: &str) -> Option<(String, String)> {
    let pair = header.split(';').next()?;
    let (name, value) = pair.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((name.to_string(), value.trim().to_string()))
}

fn hidden_inputs(body: &str) -> Vec<(String, String)> {
    let document = Html::parse_document(body);
    let Ok(selector) = Selector::parse(r#"input[type="hidden"][name]"#) else {
        return Vec::new();
    };

    document
        .select(&selector)
        .filter_map(|input| {
            let element = input.value();
            let name = element.attr("name")?;
            Some((name.to_string(), element.attr("value").unwrap_or_default().to_string()))
        })
        .collect()
}

fn appointment_id(url: &Url) -> Option<String> {
    url.path_segments()?
        .find(|segment| GUID.is_match(segment))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Location, PersonalInfo, TimePreferences};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const GUID_PATH: &str = "/Appointment/Index/3fa85f64-5717-4562-b3fc-2c963f66afa6";

    const ENTRY_PAGE: &str = r#"
        <html><body>
          <form action="/Appointment/SelectLocation" method="post">
            <input type="hidden" name="__RequestVerificationToken" value="csrf-xyz" />
            <input type="hidden" name="ServiceId" value="12" />
            <input type="text" name="Zip" value="" />
          </form>
        </body></html>
    "#;

    fn request(url: String) -> ExtractionRequest {
        ExtractionRequest {
            url,
            personal_info: PersonalInfo {
                name: "Pat Doe".to_string(),
                zip: "01830".to_string(),
                email: None,
                phone: None,
            },
            locations: vec![Location::new(27, "Haverhill")],
            time_preferences: TimePreferences::default(),
        }
    }

    fn extractor() -> HttpSessionExtractor {
        HttpSessionExtractor::new(&SiteConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_extracts_cookies_hidden_inputs_and_guid() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(GUID_PATH))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("set-cookie", "ASP.NET_SessionId=sess-1; path=/; HttpOnly")
                    .set_body_string(ENTRY_PAGE),
            )
            .mount(&server)
            .await;

        let session = extractor()
            .extract(request(format!("{}{}", server.uri(), GUID_PATH)))
            .await
            .unwrap();

        assert_eq!(session.token("ASP.NET_SessionId"), Some("sess-1"));
        assert_eq!(session.token("__RequestVerificationToken"), Some("csrf-xyz"));
        assert_eq!(session.token("ServiceId"), Some("12"));
        assert_eq!(session.token("Zip"), None);
        assert_eq!(session.token(APPOINTMENT_ID_TOKEN), Some("3fa85f64-5717-4562-b3fc-2c963f66afa6"));
        assert_eq!(session.locations.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_required_token_is_unexpected_page() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html><body>Maintenance</body></html>"))
            .mount(&server)
            .await;

        let err = extractor()
            .extract(request(format!("{}/Appointment", server.uri())))
            .await
            .unwrap_err();

        assert_eq!(
            err,
            ExtractionError::UnexpectedPage("missing session token(s): __RequestVerificationToken".to_string())
        );
    }

    #[tokio::test]
    async fn test_server_error_is_unexpected_page() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = extractor().extract(request(server.uri())).await.unwrap_err();
        assert!(matches!(err, ExtractionError::UnexpectedPage(_)));
    }

    #[tokio::test]
    async fn test_malformed_url() {
        let err = extractor().extract(request("not a url".to_string())).await.unwrap_err();
        assert_eq!(err, ExtractionError::MalformedUrl("not a url".to_string()));

        let err = extractor()
            .extract(request("ftp://booking.example.gov/".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractionError::MalformedUrl(_)));
    }

    #[test]
    fn test_parse_set_cookie() {
        assert_eq!(
            parse_set_cookie("ASP.NET_SessionId=abc; path=/; HttpOnly"),
            Some(("ASP.NET_SessionId".to_string(), "abc".to_string()))
        );
        assert_eq!(parse_set_cookie("garbage"), None);
        assert_eq!(parse_set_cookie("=value"), None);
    }
}
