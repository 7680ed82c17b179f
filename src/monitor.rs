use chrono::{DateTime, Local, NaiveDate, Utc};
use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::models::{AppointmentSlot, ErrorInfo, ScanResult, SessionContext};
use crate::plugins::{DispatchReport, NotificationDispatcher, RecipientConfig};
use crate::registry::SlotTracker;
use crate::scanner::SlotScanner;
use crate::session::SessionExtractor;
use crate::utils::error::{AppError, ExtractionError, MonitorError};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MonitorState {
    Idle,
    Running,
    Paused,
    Stopped,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TickOutcome {
    Completed,
    /// The session could not be refreshed, so nothing was scanned.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickRecord {
    pub tick: u64,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub outcome: TickOutcome,
    pub results: Vec<ScanResult>,
    pub new_matches: Vec<AppointmentSlot>,
    pub dispatch: Option<DispatchReport>,
    pub error: Option<ErrorInfo>,
}

/// Snapshot published after every state change and every tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorStatus {
    pub state: MonitorState,
    pub ticks: u64,
    pub registry_size: usize,
    pub session_extracted_at: Option<DateTime<Utc>>,
    /// Most recent ticks, oldest first.
    pub history: Vec<TickRecord>,
}

impl MonitorStatus {
    fn idle() -> Self {
        Self {
            state: MonitorState::Idle,
            ticks: 0,
            registry_size: 0,
            session_extracted_at: None,
            history: Vec::new(),
        }
    }

    pub fn last_tick(&self) -> Option<&TickRecord> {
        self.history.last()
    }
}

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub session_max_age: Duration,
    pub extraction_timeout: Duration,
    pub history_len: usize,
    pub recipient: RecipientConfig,
}

impl MonitorSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            session_max_age: config.monitor.session_max_age(),
            extraction_timeout: config.monitor.extraction_timeout(),
            history_len: config.monitor.history_len,
            recipient: RecipientConfig::from_config(config),
        }
    }
}

/// Supplies "today" for slot pruning.
pub type Clock = Arc<dyn Fn() -> NaiveDate + Send + Sync>;

struct WorkerHandle {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Polls one session on an interval, alerting once per newly seen matching slot.
pub struct MonitorLoop {
    scanner: Arc<dyn SlotScanner>,
    extractor: Arc<dyn SessionExtractor>,
    dispatcher: Arc<NotificationDispatcher>,
    settings: MonitorSettings,
    today: Clock,
    state: watch::Sender<MonitorState>,
    status: Arc<watch::Sender<MonitorStatus>>,
    worker: Mutex<Option<WorkerHandle>>,
}

impl MonitorLoop {
    pub fn new(
        scanner: Arc<dyn SlotScanner>,
        extractor: Arc<dyn SessionExtractor>,
        dispatcher: Arc<NotificationDispatcher>,
        settings: MonitorSettings,
    ) -> Self {
        let (state, _) = watch::channel(MonitorState::Idle);
        let (status, _) = watch::channel(MonitorStatus::idle());

        Self {
            scanner,
            extractor,
            dispatcher,
            settings,
            today: Arc::new(|| Local::now().date_naive()),
            state,
            status: Arc::new(status),
            worker: Mutex::new(None),
        }
    }

    pub fn with_clock(mut self, today: Clock) -> Self {
        self.today = today;
        self
    }

    /// Start polling. Must be called from within a tokio runtime.
    pub fn start(&self, session: Arc<SessionContext>, interval: Duration) -> Result<(), MonitorError> {
        let mut rejected = false;
        self.state.send_if_modified(|state| match *state {
            MonitorState::Running | MonitorState::Paused => {
                rejected = true;
                false
            }
            MonitorState::Idle | MonitorState::Stopped => {
                *state = MonitorState::Running;
                true
            }
        });
        if rejected {
            return Err(MonitorError::AlreadyRunning);
        }

        self.status.send_modify(|status| {
            *status = MonitorStatus::idle();
            status.state = MonitorState::Running;
            status.session_extracted_at = Some(session.extracted_at);
        });

        let cancel = CancellationToken::new();
        let worker = Worker {
            scanner: Arc::clone(&self.scanner),
            extractor: Arc::clone(&self.extractor),
            dispatcher: Arc::clone(&self.dispatcher),
            settings: self.settings.clone(),
            today: Arc::clone(&self.today),
            state: self.state.subscribe(),
            status: Arc::clone(&self.status),
            cancel: cancel.clone(),
            session,
            tracker: SlotTracker::new(),
            session_expired: false,
            ticks: 0,
        };
        let handle = tokio::spawn(worker.run(interval));

        let previous = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(WorkerHandle { cancel, handle });
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }

        info!("Monitor started, polling every {}s", interval.as_secs());
        Ok(())
    }

    /// Stop polling. An in-flight tick finishes its remote calls; its results are discarded.
    pub fn stop(&self) -> Result<(), MonitorError> {
        self.transition(
            |state| matches!(state, MonitorState::Running | MonitorState::Paused),
            MonitorState::Stopped,
        )?;

        if let Some(worker) = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            worker.cancel.cancel();
        }

        info!("Monitor stopped");
        Ok(())
    }

    /// Pause before the next tick. A tick already in progress completes.
    pub fn pause(&self) -> Result<(), MonitorError> {
        self.transition(|state| state == MonitorState::Running, MonitorState::Paused)?;
        info!("Monitor paused");
        Ok(())
    }

    pub fn resume(&self) -> Result<(), MonitorError> {
        if *self.state.borrow() == MonitorState::Running {
            return Ok(());
        }
        self.transition(|state| state == MonitorState::Paused, MonitorState::Running)?;
        info!("Monitor resumed");
        Ok(())
    }

    pub fn state(&self) -> MonitorState {
        *self.state.borrow()
    }

    pub fn status(&self) -> MonitorStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<MonitorStatus> {
        self.status.subscribe()
    }

    /// Wait for the worker task to exit. Returns immediately if it was never started.
    pub async fn join(&self) -> Result<(), AppError> {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(worker) = worker {
            worker
                .handle
                .await
                .map_err(|e| AppError::Internal(format!("monitor worker failed: {}", e)))?;
        }
        Ok(())
    }

    fn transition(
        &self,
        allowed: impl FnOnce(MonitorState) -> bool,
        next: MonitorState,
    ) -> Result<(), MonitorError> {
        let mut rejected = false;
        self.state.send_if_modified(|state| {
            if allowed(*state) {
                *state = next;
                true
            } else {
                rejected = true;
                false
            }
        });
        if rejected {
            return Err(MonitorError::NotRunning);
        }

        self.status.send_modify(|status| status.state = next);
        Ok(())
    }
}

impl Drop for MonitorLoop {
    fn drop(&mut self) {
        if let Some(worker) = self
            .worker
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            worker.cancel.cancel();
        }
    }
}

/// The spawned polling task. Owns the session and the seen-slot registry.
struct Worker {
    scanner: Arc<dyn SlotScanner>,
    extractor: Arc<dyn SessionExtractor>,
    dispatcher: Arc<NotificationDispatcher>,
    settings: MonitorSettings,
    today: Clock,
    state: watch::Receiver<MonitorState>,
    status: Arc<watch::Sender<MonitorStatus>>,
    cancel: CancellationToken,
    session: Arc<SessionContext>,
    tracker: SlotTracker,
    session_expired: bool,
    ticks: u64,
}

impl Worker {
    async fn run(mut self, interval: Duration) {
        loop {
            if !self.wait_until_running().await {
                break;
            }

            match self.tick().await {
                Some(record) => self.publish(record),
                None => break,
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }

        debug!("Monitor worker exiting after {} tick(s)", self.ticks);
    }

    /// Block while paused. Returns `false` once the monitor is stopped.
    async fn wait_until_running(&mut self) -> bool {
        loop {
            if self.cancel.is_cancelled() {
                return false;
            }
            match *self.state.borrow_and_update() {
                MonitorState::Running => return true,
                MonitorState::Stopped => return false,
                MonitorState::Idle | MonitorState::Paused => {}
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                changed = self.state.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
    }

    /// Run one poll cycle. Returns `None` if the monitor was stopped part way through.
    async fn tick(&mut self) -> Option<TickRecord> {
        let tick = self.ticks + 1;
        let started_at = Utc::now();
        let started = tokio::time::Instant::now();
        let elapsed_ms = || started.elapsed().as_millis() as u64;

        if self.session_expired || self.session.is_stale(self.settings.session_max_age, started_at) {
            let request = self.session.refresh_request();
            let refreshed = tokio::time::timeout(self.settings.extraction_timeout, self.extractor.extract(request))
                .await
                .unwrap_or_else(|_| {
                    Err(ExtractionError::Timeout {
                        after_ms: self.settings.extraction_timeout.as_millis() as u64,
                    })
                });
            if self.cancel.is_cancelled() {
                return None;
            }

            match refreshed {
                Ok(session) => {
                    info!("Refreshed booking session");
                    self.session = Arc::new(session);
                    self.session_expired = false;
                }
                Err(e) => {
                    warn!(tick, "Skipping tick, session extraction failed: {}", e);
                    counter!("slot_watcher_ticks_total", "outcome" => "skipped").increment(1);
                    return Some(TickRecord {
                        tick,
                        started_at,
                        elapsed_ms: elapsed_ms(),
                        outcome: TickOutcome::Skipped,
                        results: Vec::new(),
                        new_matches: Vec::new(),
                        dispatch: None,
                        error: Some(ErrorInfo::from(AppError::from(e))),
                    });
                }
            }
        }

        let report = self.scanner.scan(Arc::clone(&self.session)).await;
        if self.cancel.is_cancelled() {
            debug!(tick, "Discarding scan results from cancelled tick");
            return None;
        }
        if report.session_expired {
            self.session_expired = true;
        }

        // Registered on a copy, committed only once the tick completes.
        let today = (self.today)();
        let mut tracker = self.tracker.clone();
        let new_matches = tracker.process(&report.results, &self.session.time_preferences, today);

        let dispatch = if new_matches.is_empty() {
            None
        } else {
            info!(tick, "Found {} new matching slot(s)", new_matches.len());
            let dispatched = self
                .dispatcher
                .notify(&self.settings.recipient, &new_matches, &self.session.locations)
                .await;
            if self.cancel.is_cancelled() {
                return None;
            }
            Some(dispatched)
        };

        self.tracker = tracker;
        gauge!("slot_watcher_registry_size").set(self.tracker.registry().len() as f64);
        counter!("slot_watcher_ticks_total", "outcome" => "completed").increment(1);
        Some(TickRecord {
            tick,
            started_at,
            elapsed_ms: elapsed_ms(),
            outcome: TickOutcome::Completed,
            results: report.results,
            new_matches,
            dispatch,
            error: None,
        })
    }

    fn publish(&mut self, record: TickRecord) {
        self.ticks = record.tick;
        let registry_size = self.tracker.registry().len();
        let extracted_at = self.session.extracted_at;
        let history_len = self.settings.history_len.max(1);

        self.status.send_modify(|status| {
            status.ticks = record.tick;
            status.registry_size = registry_size;
            status.session_extracted_at = Some(extracted_at);
            status.history.push(record);
            if status.history.len() > history_len {
                let excess = status.history.len() - history_len;
                status.history.drain(..excess);
            }
        });
    }
}
