use thiserror::Error;

use crate::models::{Channel, StrategyKind};

#[derive(Error, Debug)]
pub enum AppError {
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Session extraction failed: {0}")]
    Extraction(#[from] ExtractionError),

    #[error("Strategy failed: {0}")]
    Strategy(#[from] StrategyError),

    #[error("{0}")]
    Selection(#[from] SelectionError),

    #[error("Remote protocol error: {0}")]
    RemoteProtocol(#[from] RemoteProtocolError),

    #[error("Notification provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Monitor error: {0}")]
    Monitor(#[from] MonitorError),

    #[error("Browser error: {0}")]
    Browser(#[from] BrowserError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Short, stable name used when errors are summarised for display.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Http(_) => "http",
            AppError::Config(_) => "config",
            AppError::Serialization(_) => "serialization",
            AppError::Io(_) => "io",
            AppError::Extraction(_) => "extraction",
            AppError::Strategy(_) => "strategy",
            AppError::Selection(_) => "selection",
            AppError::RemoteProtocol(_) => "remote_protocol",
            AppError::Provider(_) => "provider",
            AppError::Monitor(_) => "monitor",
            AppError::Browser(_) => "browser",
            AppError::Internal(_) => "internal",
        }
    }
}

/// The session extraction collaborator could not produce a usable session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExtractionError {
    #[error("malformed URL '{0}'")]
    MalformedUrl(String),

    #[error("site unreachable: {0}")]
    Unreachable(String),

    #[error("unexpected page structure: {0}")]
    UnexpectedPage(String),

    #[error("extraction timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },
}

/// A path or form template could not be expanded against the session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("session token '{0}' missing")]
    MissingToken(String),

    #[error("cannot resolve '{path}': {reason}")]
    InvalidUrl { path: String, reason: String },
}

/// One selection strategy failed. Never fatal: the selector moves on to the next strategy.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StrategyError {
    #[error("timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    #[error("expected element '{selector}' not found")]
    MissingElement { selector: String },

    #[error("unexpected redirect to {url}")]
    UnexpectedRedirect { url: String },

    #[error("session token '{0}' missing")]
    MissingToken(String),

    #[error("cannot build page address: {0}")]
    InvalidTemplate(String),

    #[error("invalid CSS selector '{0}'")]
    InvalidSelector(String),

    #[error("page returned no slot data: {0}")]
    NoSlotData(String),

    #[error("browser failure: {0}")]
    Browser(String),
}

impl From<TemplateError> for StrategyError {
    fn from(err: TemplateError) -> Self {
        match err {
            TemplateError::MissingToken(name) => StrategyError::MissingToken(name),
            other => StrategyError::InvalidTemplate(other.to_string()),
        }
    }
}

impl From<BrowserError> for StrategyError {
    fn from(err: BrowserError) -> Self {
        match err {
            BrowserError::ElementNotFound { selector } => StrategyError::MissingElement { selector },
            other => StrategyError::Browser(other.to_string()),
        }
    }
}

/// Every strategy in the chain failed for one location.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("all selection strategies failed: {}", format_attempts(.attempts))]
pub struct SelectionError {
    pub attempts: Vec<(StrategyKind, StrategyError)>,
}

impl SelectionError {
    pub fn attempted(&self) -> Vec<StrategyKind> {
        self.attempts.iter().map(|(kind, _)| *kind).collect()
    }
}

fn format_attempts(attempts: &[(StrategyKind, StrategyError)]) -> String {
    if attempts.is_empty() {
        return "no strategies configured".to_string();
    }
    attempts
        .iter()
        .map(|(kind, err)| format!("{}: {}", kind, err))
        .collect::<Vec<_>>()
        .join("; ")
}

/// The direct replay path can no longer be trusted for this location or session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteProtocolError {
    #[error("session expired (HTTP {status})")]
    SessionExpired { status: u16 },

    #[error("session token '{0}' missing")]
    MissingToken(String),

    #[error("response schema mismatch: {reason}")]
    SchemaMismatch { reason: String },

    #[error("unexpected HTTP status {0}")]
    UnexpectedStatus(u16),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("cannot build request: {0}")]
    InvalidTemplate(String),

    #[error("replay timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },
}

impl From<TemplateError> for RemoteProtocolError {
    fn from(err: TemplateError) -> Self {
        match err {
            TemplateError::MissingToken(name) => RemoteProtocolError::MissingToken(name),
            other => RemoteProtocolError::InvalidTemplate(other.to_string()),
        }
    }
}

impl RemoteProtocolError {
    /// True when the caller should throw the session away and extract a fresh one.
    pub fn requires_new_session(&self) -> bool {
        matches!(
            self,
            RemoteProtocolError::SessionExpired { .. } | RemoteProtocolError::MissingToken(_)
        )
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("provider rejected message (status {status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("provider misconfigured: {0}")]
    Misconfigured(String),

    #[error("send timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },
}

/// State machine misuse. Returned synchronously to the caller.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorError {
    #[error("monitor is already running")]
    AlreadyRunning,

    #[error("monitor is not running")]
    NotRunning,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrowserError {
    #[error("failed to launch browser: {0}")]
    Launch(String),

    #[error("failed to open page: {0}")]
    Page(String),

    #[error("navigation failed: {0}")]
    Navigation(String),

    #[error("element not found: {selector}")]
    ElementNotFound { selector: String },

    #[error("script evaluation failed: {0}")]
    Script(String),
}

/// Delivery failure recorded against a single channel.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{channel} delivery to {recipient} failed after {attempts} attempt(s): {last_error}")]
pub struct DeliveryFailure {
    pub channel: Channel,
    pub recipient: String,
    pub attempts: u32,
    pub last_error: ProviderError,
}

// Result type alias for convenience
pub type Result<T> = std::result::Result<T, AppError>;
