use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::env;
use std::path::Path;
use std::time::Duration;
use url::Url;

use crate::models::{
    parse_slot_date, parse_slot_time, Channel, ExtractionRequest, Location, PersonalInfo, StrategyKind,
    TimePreferences, MAX_LOCATIONS,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub site: SiteConfig,
    pub scanner: ScannerConfig,
    pub monitor: MonitorConfig,
    pub notifications: NotificationsConfig,
    pub metrics: MetricsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteConfig {
    pub entry_url: String,
    pub name: String,
    pub zip: String,
    pub user_agent: String,
    pub chrome_path: Option<String>,
    /// Seconds allowed for fetching the entry page during session extraction.
    pub request_timeout: u64,
    /// Tokens the entry page must yield for a session to be usable.
    pub required_tokens: Vec<String>,
    pub layout: SiteLayout,
    pub replay: ReplayConfig,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            entry_url: String::new(),
            name: String::new(),
            zip: String::new(),
            user_agent: "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36".to_string(),
            chrome_path: None,
            request_timeout: 20,
            required_tokens: vec!["__RequestVerificationToken".to_string()],
            layout: SiteLayout::default(),
            replay: ReplayConfig::default(),
        }
    }
}

/// Where things live on the booking site. Path and selector templates accept the
/// `{location_id}`, `{location_name}`, `{zip}` and `{token.NAME}` placeholders.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteLayout {
    pub location_path: String,
    pub form_path: String,
    pub calendar_selector: String,
    pub location_select_selector: String,
    pub continue_selector: String,
    pub widget_selector: String,
    pub slot_selector: String,
    pub date_attribute: String,
    pub time_attribute: String,
    pub slot_data_script: String,
    /// URL fragments that mean the site bounced us to an error or expiry page.
    pub expired_markers: Vec<String>,
}

impl Default for SiteLayout {
    fn default() -> Self {
        Self {
            location_path: "/Appointment/Index/{token.appointment_id}/Location/{location_id}".to_string(),
            form_path: "/Appointment/Index/{token.appointment_id}".to_string(),
            calendar_selector: "#appointment-calendar".to_string(),
            location_select_selector: "select#LocationId".to_string(),
            continue_selector: "button#continue".to_string(),
            widget_selector: ".location-card[data-location-id=\"{location_id}\"]".to_string(),
            slot_selector: ".time-slot".to_string(),
            date_attribute: "data-date".to_string(),
            time_attribute: "data-time".to_string(),
            slot_data_script: "JSON.stringify((window.appointmentCalendar && window.appointmentCalendar.availableSlots) || null)".to_string(),
            expired_markers: vec!["SessionExpired".to_string(), "/Error".to_string()],
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReplayMethod {
    Get,
    Post,
}

/// One request from the captured browser traffic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplayStep {
    pub method: ReplayMethod,
    pub path: String,
    #[serde(default)]
    pub form: BTreeMap<String, String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    pub enabled: bool,
    /// Session tokens sent back as cookies on every replayed request.
    pub cookie_tokens: Vec<String>,
    /// Replayed in order; the last response carries the availability payload.
    pub steps: Vec<ReplayStep>,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        let mut select_form = BTreeMap::new();
        select_form.insert("LocationId".to_string(), "{location_id}".to_string());
        select_form.insert(
            "__RequestVerificationToken".to_string(),
            "{token.__RequestVerificationToken}".to_string(),
        );

        let mut xhr_headers = BTreeMap::new();
        xhr_headers.insert("X-Requested-With".to_string(), "XMLHttpRequest".to_string());

        Self {
            enabled: true,
            cookie_tokens: vec!["ASP.NET_SessionId".to_string()],
            steps: vec![
                ReplayStep {
                    method: ReplayMethod::Post,
                    path: "/Appointment/SelectLocation".to_string(),
                    form: select_form,
                    headers: xhr_headers.clone(),
                },
                ReplayStep {
                    method: ReplayMethod::Get,
                    path: "/Appointment/AvailableSlots?locationId={location_id}".to_string(),
                    form: BTreeMap::new(),
                    headers: xhr_headers,
                },
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// How many locations may be in flight at once within one cycle.
    pub max_concurrent_locations: usize,
    /// UI strategies in the order they are tried.
    pub strategies: Vec<StrategyKind>,
    pub strategy_timeout_ms: u64,
    pub replay_timeout_ms: u64,
    pub extract_timeout_ms: u64,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_locations: 2,
            strategies: vec![StrategyKind::UiA, StrategyKind::UiB, StrategyKind::UiC],
            strategy_timeout_ms: 8_000,
            replay_timeout_ms: 5_000,
            extract_timeout_ms: 5_000,
        }
    }
}

impl ScannerConfig {
    pub fn strategy_timeout(&self) -> Duration {
        Duration::from_millis(self.strategy_timeout_ms)
    }

    pub fn replay_timeout(&self) -> Duration {
        Duration::from_millis(self.replay_timeout_ms)
    }

    pub fn extract_timeout(&self) -> Duration {
        Duration::from_millis(self.extract_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PreferencesConfig {
    pub date_range_start: Option<String>,
    pub date_range_end: Option<String>,
    pub time_window_start: Option<String>,
    pub time_window_end: Option<String>,
}

impl PreferencesConfig {
    pub fn to_preferences(&self) -> Result<TimePreferences, ConfigError> {
        let date = |field: &str, value: &Option<String>| {
            value
                .as_deref()
                .map(|v| {
                    parse_slot_date(v).ok_or_else(|| {
                        ConfigError::Message(format!("Invalid date in monitor.preferences.{}: {}", field, v))
                    })
                })
                .transpose()
        };
        let time = |field: &str, value: &Option<String>| {
            value
                .as_deref()
                .map(|v| {
                    parse_slot_time(v).ok_or_else(|| {
                        ConfigError::Message(format!("Invalid time in monitor.preferences.{}: {}", field, v))
                    })
                })
                .transpose()
        };

        Ok(TimePreferences {
            date_range_start: date("date_range_start", &self.date_range_start)?,
            date_range_end: date("date_range_end", &self.date_range_end)?,
            time_window_start: time("time_window_start", &self.time_window_start)?,
            time_window_end: time("time_window_end", &self.time_window_end)?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub poll_interval_seconds: u64,
    /// Sessions older than this are re-extracted before the next scan.
    pub session_max_age_seconds: u64,
    pub extraction_timeout_seconds: u64,
    /// Number of past ticks kept for display.
    pub history_len: usize,
    pub locations: Vec<Location>,
    pub preferences: PreferencesConfig,
    pub channels: Vec<Channel>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: 300,
            session_max_age_seconds: 1_200,
            extraction_timeout_seconds: 30,
            history_len: 50,
            locations: Vec::new(),
            preferences: PreferencesConfig::default(),
            channels: vec![Channel::Email],
        }
    }
}

impl MonitorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    pub fn session_max_age(&self) -> Duration {
        Duration::from_secs(self.session_max_age_seconds)
    }

    pub fn extraction_timeout(&self) -> Duration {
        Duration::from_secs(self.extraction_timeout_seconds)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationsConfig {
    pub recipient: RecipientSettings,
    pub smtp: SmtpConfig,
    pub sms: SmsConfig,
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RecipientSettings {
    pub email: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from_address: Option<String>,
    pub from_name: String,
    pub use_tls: bool,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: "smtp.gmail.com".to_string(),
            port: 587,
            username: None,
            password: None,
            from_address: None,
            from_name: "Slot Watcher".to_string(),
            use_tls: true,
        }
    }
}

/// Twilio-compatible SMS gateway settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SmsConfig {
    pub api_base: String,
    pub account_sid: Option<String>,
    pub auth_token: Option<String>,
    pub from_number: Option<String>,
}

impl Default for SmsConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.twilio.com".to_string(),
            account_sid: None,
            auth_token: None,
            from_number: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub send_timeout_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            send_timeout_ms: 15_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9001,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// Optional plain-text log file, written alongside console output.
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl AppConfig {
    /// Load layered configuration: `config/default`, `config/{RUN_MODE}`, `config/local`,
    /// an optional explicit file, then `SLOT_WATCHER__*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let mut builder = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            .add_source(File::with_name("config/local").required(false));

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }

        let s = builder
            .add_source(Environment::with_prefix("SLOT_WATCHER").separator("__"))
            .build()?;

        let mut config: AppConfig = s.try_deserialize()?;

        // Add Chrome path from environment if not set
        if config.site.chrome_path.is_none() {
            config.site.chrome_path = env::var("CHROME_PATH").ok();
        }

        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document without consulting the filesystem or environment.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = Config::builder()
            .add_source(File::from_str(source, FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        // Validate site configuration
        let entry_url = Url::parse(&self.site.entry_url)
            .map_err(|_| ConfigError::Message("Invalid site.entry_url format".into()))?;
        if !matches!(entry_url.scheme(), "http" | "https") {
            return Err(ConfigError::Message("site.entry_url must use http or https".into()));
        }

        if self.site.zip.trim().is_empty() {
            return Err(ConfigError::Message("site.zip must not be empty".into()));
        }

        if self.site.request_timeout == 0 {
            return Err(ConfigError::Message("site.request_timeout must be greater than 0".into()));
        }

        if self.site.replay.enabled && self.site.replay.steps.is_empty() {
            return Err(ConfigError::Message("site.replay.steps must not be empty when replay is enabled".into()));
        }

        // Validate scanner configuration
        if self.scanner.max_concurrent_locations == 0 {
            return Err(ConfigError::Message("scanner.max_concurrent_locations must be greater than 0".into()));
        }

        if self.scanner.strategies.is_empty() {
            return Err(ConfigError::Message("scanner.strategies must list at least one UI strategy".into()));
        }

        if self.scanner.strategies.contains(&StrategyKind::DirectReplay) {
            return Err(ConfigError::Message("scanner.strategies lists UI strategies only; use site.replay.enabled for DIRECT_REPLAY".into()));
        }

        if self.scanner.strategy_timeout_ms == 0 || self.scanner.replay_timeout_ms == 0 || self.scanner.extract_timeout_ms == 0 {
            return Err(ConfigError::Message("scanner timeouts must be greater than 0".into()));
        }

        // Validate monitor configuration
        if self.monitor.poll_interval_seconds == 0 {
            return Err(ConfigError::Message("monitor.poll_interval_seconds must be greater than 0".into()));
        }

        if self.monitor.session_max_age_seconds == 0 || self.monitor.extraction_timeout_seconds == 0 {
            return Err(ConfigError::Message("monitor session timings must be greater than 0".into()));
        }

        if self.monitor.locations.is_empty() {
            return Err(ConfigError::Message("monitor.locations must not be empty".into()));
        }

        if self.monitor.locations.len() > MAX_LOCATIONS {
            return Err(ConfigError::Message(format!(
                "monitor.locations may contain at most {} locations",
                MAX_LOCATIONS
            )));
        }

        let mut ids = HashSet::new();
        for location in &self.monitor.locations {
            if !ids.insert(location.id) {
                return Err(ConfigError::Message(format!("Duplicate location id {}", location.id)));
            }
        }

        let prefs = self.monitor.preferences.to_preferences()?;
        if let (Some(start), Some(end)) = (prefs.date_range_start, prefs.date_range_end) {
            if start > end {
                return Err(ConfigError::Message("date_range_start cannot be after date_range_end".into()));
            }
        }
        if let (Some(start), Some(end)) = (prefs.time_window_start, prefs.time_window_end) {
            if start > end {
                return Err(ConfigError::Message("time_window_start cannot be after time_window_end".into()));
            }
        }

        // Validate notification configuration
        if self.monitor.channels.contains(&Channel::Email) && self.notifications.recipient.email.is_none() {
            return Err(ConfigError::Message("EMAIL channel selected but notifications.recipient.email is not set".into()));
        }

        if self.monitor.channels.contains(&Channel::Sms) && self.notifications.recipient.phone.is_none() {
            return Err(ConfigError::Message("SMS channel selected but notifications.recipient.phone is not set".into()));
        }

        if self.notifications.smtp.port == 0 {
            return Err(ConfigError::Message("SMTP port must be greater than 0".into()));
        }

        if Url::parse(&self.notifications.sms.api_base).is_err() {
            return Err(ConfigError::Message("Invalid notifications.sms.api_base format".into()));
        }

        if self.notifications.retry.max_attempts == 0 {
            return Err(ConfigError::Message("notifications.retry.max_attempts must be greater than 0".into()));
        }

        if self.notifications.retry.send_timeout_ms == 0 {
            return Err(ConfigError::Message("notifications.retry.send_timeout_ms must be greater than 0".into()));
        }

        // Validate metrics configuration
        if self.metrics.enabled && self.metrics.port == 0 {
            return Err(ConfigError::Message("Metrics port must be greater than 0".into()));
        }

        Ok(())
    }

    pub fn personal_info(&self) -> PersonalInfo {
        PersonalInfo {
            name: self.site.name.clone(),
            zip: self.site.zip.clone(),
            email: self.notifications.recipient.email.clone(),
            phone: self.notifications.recipient.phone.clone(),
        }
    }

    /// The request used to open the first session and every refresh after it.
    pub fn extraction_request(&self) -> Result<ExtractionRequest, ConfigError> {
        Ok(ExtractionRequest {
            url: self.site.entry_url.clone(),
            personal_info: self.personal_info(),
            locations: self.monitor.locations.clone(),
            time_preferences: self.monitor.preferences.to_preferences()?,
        })
    }
}
