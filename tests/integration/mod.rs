// Shared fixtures for the end-to-end scenarios: a scripted booking site behind the
// browser seam, a session extractor that never touches the network, and counting providers.

pub mod dispatcher_tests;
pub mod monitor_tests;
pub mod scanner_tests;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use url::Url;

use slot_watcher::browser::{BrowserProvider, PageDriver, PagePool};
use slot_watcher::config::SiteLayout;
use slot_watcher::extractor::SlotExtractor;
use slot_watcher::models::{
    Channel, ExtractionRequest, Location, OutboundMessage, PersonalInfo, SessionContext, StrategyKind,
    TimePreferences,
};
use slot_watcher::plugins::{DeliveryReceipt, NotificationProvider};
use slot_watcher::replayer::DirectRequestReplayer;
use slot_watcher::selector::{build_chain, LocationSelector};
use slot_watcher::session::SessionExtractor;
use slot_watcher::utils::error::{BrowserError, ExtractionError, ProviderError};
use slot_watcher::AppointmentScanner;

pub const APPOINTMENT_ID: &str = "f00d";

pub fn day(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

pub fn haverhill() -> Location {
    Location::new(27, "Haverhill")
}

/// June 2024, 09:00 to 17:00.
pub fn june_daytime() -> TimePreferences {
    TimePreferences {
        date_range_start: Some(day("2024-06-01")),
        date_range_end: Some(day("2024-06-30")),
        time_window_start: NaiveTime::from_hms_opt(9, 0, 0),
        time_window_end: NaiveTime::from_hms_opt(17, 0, 0),
    }
}

pub fn request(base: &str, locations: Vec<Location>) -> ExtractionRequest {
    ExtractionRequest {
        url: base.to_string(),
        personal_info: PersonalInfo {
            name: "Pat Doe".to_string(),
            zip: "01830".to_string(),
            email: Some("pat@example.com".to_string()),
            phone: Some("+15555550100".to_string()),
        },
        locations,
        time_preferences: june_daytime(),
    }
}

pub fn session_for(request: ExtractionRequest) -> SessionContext {
    let mut tokens = HashMap::new();
    tokens.insert("appointment_id".to_string(), APPOINTMENT_ID.to_string());
    tokens.insert("ASP.NET_SessionId".to_string(), "sess-1".to_string());
    tokens.insert("__RequestVerificationToken".to_string(), "csrf-1".to_string());
    let base = Url::parse(&request.url).unwrap();
    SessionContext::new(request, base, tokens)
}

pub fn session(base: &str, locations: Vec<Location>) -> Arc<SessionContext> {
    Arc::new(session_for(request(base, locations)))
}

/// Open slots per location, as the calendar page renders them.
#[derive(Default)]
pub struct FakeSite {
    slots: Mutex<HashMap<u32, Vec<(String, String)>>>,
    /// When set, the calendar never appears.
    broken: bool,
    /// When set, the page parks in `wait_for` until released.
    gate: Option<PageGate>,
}

#[derive(Clone, Default)]
pub struct PageGate {
    pub entered: Arc<Notify>,
    pub release: Arc<Notify>,
}

impl FakeSite {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn broken() -> Self {
        Self {
            broken: true,
            ..Self::default()
        }
    }

    pub fn gated(gate: PageGate) -> Self {
        Self {
            gate: Some(gate),
            ..Self::default()
        }
    }

    pub fn open_slot(&self, location_id: u32, date: &str, time: &str) {
        self.slots
            .lock()
            .unwrap()
            .entry(location_id)
            .or_default()
            .push((date.to_string(), time.to_string()));
    }

    fn calendar_html(&self, location_id: Option<u32>) -> String {
        let slots = self.slots.lock().unwrap();
        let buttons: String = location_id
            .and_then(|id| slots.get(&id))
            .map(|entries| {
                entries
                    .iter()
                    .map(|(date, time)| {
                        format!(
                            r#"<button class="time-slot" data-date="{}" data-time="{}">{}</button>"#,
                            date, time, time
                        )
                    })
                    .collect()
            })
            .unwrap_or_default();
        format!(
            r#"<html><body><div id="appointment-calendar">{}</div></body></html>"#,
            buttons
        )
    }
}

pub struct FakePage {
    site: Arc<FakeSite>,
    url: Mutex<String>,
    closed: Arc<AtomicUsize>,
}

impl FakePage {
    fn location_id(&self) -> Option<u32> {
        let url = self.url.lock().unwrap();
        url.rsplit("/Location/").next()?.parse().ok()
    }
}

#[async_trait]
impl PageDriver for FakePage {
    async fn navigate(&self, url: &str) -> Result<(), BrowserError> {
        *self.url.lock().unwrap() = url.to_string();
        Ok(())
    }

    async fn wait_for(&self, selector: &str, _timeout: Duration) -> Result<(), BrowserError> {
        if let Some(gate) = &self.site.gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        if self.site.broken {
            return Err(BrowserError::ElementNotFound {
                selector: selector.to_string(),
            });
        }
        Ok(())
    }

    async fn click(&self, _selector: &str) -> Result<(), BrowserError> {
        Ok(())
    }

    async fn evaluate(&self, _script: &str) -> Result<Value, BrowserError> {
        Ok(Value::Null)
    }

    async fn content(&self) -> Result<String, BrowserError> {
        Ok(self.site.calendar_html(self.location_id()))
    }

    async fn current_url(&self) -> Result<String, BrowserError> {
        Ok(self.url.lock().unwrap().clone())
    }

    fn close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct FakeBrowser {
    pub site: Arc<FakeSite>,
    pub opened: Arc<AtomicUsize>,
    pub closed: Arc<AtomicUsize>,
}

impl FakeBrowser {
    pub fn new(site: FakeSite) -> Self {
        Self {
            site: Arc::new(site),
            opened: Arc::new(AtomicUsize::new(0)),
            closed: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl BrowserProvider for FakeBrowser {
    async fn open_page(&self) -> Result<Box<dyn PageDriver>, BrowserError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakePage {
            site: Arc::clone(&self.site),
            url: Mutex::new("about:blank".to_string()),
            closed: Arc::clone(&self.closed),
        }))
    }
}

pub fn scanner(
    browser: Arc<FakeBrowser>,
    strategies: &[StrategyKind],
    replayer: Option<DirectRequestReplayer>,
) -> AppointmentScanner {
    let timeout = Duration::from_secs(5);
    let chain = build_chain(strategies, &SiteLayout::default(), timeout);
    let selector = LocationSelector::new(chain, PagePool::new(browser), timeout);
    AppointmentScanner::new(selector, SlotExtractor::new(timeout), replayer, 2)
}

/// Re-extraction that always hands back a fresh session with the same tokens.
#[derive(Default)]
pub struct FakeSessionExtractor {
    pub calls: AtomicUsize,
}

#[async_trait]
impl SessionExtractor for FakeSessionExtractor {
    async fn extract(&self, request: ExtractionRequest) -> Result<SessionContext, ExtractionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(session_for(request))
    }
}

/// Fails the first `failures` sends with a transport error, then accepts.
pub struct CountingProvider {
    channel: Channel,
    failures: usize,
    pub attempts: AtomicUsize,
    pub delivered: Mutex<Vec<OutboundMessage>>,
}

impl CountingProvider {
    pub fn new(channel: Channel, failures: usize) -> Self {
        Self {
            channel,
            failures,
            attempts: AtomicUsize::new(0),
            delivered: Mutex::new(Vec::new()),
        }
    }

    pub fn reliable(channel: Channel) -> Self {
        Self::new(channel, 0)
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn delivered(&self) -> Vec<OutboundMessage> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationProvider for CountingProvider {
    fn channel(&self) -> Channel {
        self.channel
    }

    async fn send(&self, message: &OutboundMessage) -> Result<DeliveryReceipt, ProviderError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.failures {
            return Err(ProviderError::Transport(format!("gateway unavailable (attempt {})", attempt)));
        }
        self.delivered.lock().unwrap().push(message.clone());
        Ok(DeliveryReceipt {
            message_id: Some(format!("{}-{}", self.channel, attempt)),
        })
    }
}
