use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::browser::{BrowserProvider, PagePool, PageTracker};
use crate::config::AppConfig;
use crate::extractor::SlotExtractor;
use crate::models::{ErrorInfo, Location, ScanResult, SessionContext, StrategyKind};
use crate::replayer::DirectRequestReplayer;
use crate::selector::{build_chain, LocationSelector};
use crate::utils::error::AppError;

/// Results of one scan cycle, one entry per location in configured order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanReport {
    pub results: Vec<ScanResult>,
    /// The site signalled that the session is no longer valid.
    pub session_expired: bool,
}

impl ScanReport {
    pub fn successes(&self) -> impl Iterator<Item = &ScanResult> {
        self.results.iter().filter(|r| r.success)
    }
}

#[async_trait]
pub trait SlotScanner: Send + Sync {
    async fn scan(&self, session: Arc<SessionContext>) -> ScanReport;
}

/// Per-cycle state shared by the location scans of one cycle.
#[derive(Debug)]
struct CycleFlags {
    replay_enabled: AtomicBool,
    session_expired: AtomicBool,
}

pub struct AppointmentScanner {
    selector: LocationSelector,
    extractor: SlotExtractor,
    replayer: Option<DirectRequestReplayer>,
    max_concurrent: usize,
}

impl AppointmentScanner {
    pub fn new(
        selector: LocationSelector,
        extractor: SlotExtractor,
        replayer: Option<DirectRequestReplayer>,
        max_concurrent: usize,
    ) -> Self {
        Self {
            selector,
            extractor,
            replayer,
            max_concurrent: max_concurrent.max(1),
        }
    }

    pub fn from_config(config: &AppConfig, browser: Arc<dyn BrowserProvider>) -> Result<Self, AppError> {
        let strategies = build_chain(
            &config.scanner.strategies,
            &config.site.layout,
            config.scanner.strategy_timeout(),
        );
        let selector = LocationSelector::new(strategies, PagePool::new(browser), config.scanner.strategy_timeout());

        let replayer = if config.site.replay.enabled {
            Some(DirectRequestReplayer::new(
                config.site.replay.clone(),
                &config.site.user_agent,
                config.scanner.replay_timeout(),
            )?)
        } else {
            None
        };

        Ok(Self::new(
            selector,
            SlotExtractor::new(config.scanner.extract_timeout()),
            replayer,
            config.scanner.max_concurrent_locations,
        ))
    }

    pub fn page_tracker(&self) -> PageTracker {
        self.selector.pages().tracker().clone()
    }

    async fn scan_location(&self, session: &SessionContext, location: &Location, flags: &CycleFlags) -> ScanResult {
        let started = Instant::now();
        let elapsed_ms = || started.elapsed().as_millis() as u64;
        let mut fallback_reason = None;

        if let Some(replayer) = self.replayer.as_ref().filter(|r| r.is_enabled()) {
            if flags.replay_enabled.load(Ordering::SeqCst) {
                match replayer.query(session, location).await {
                    Ok(extraction) => {
                        record_result(StrategyKind::DirectReplay, true);
                        debug!(location_id = location.id, "Replay returned {} slot(s)", extraction.slots.len());
                        return ScanResult::succeeded(
                            location.id,
                            StrategyKind::DirectReplay,
                            extraction,
                            elapsed_ms(),
                            None,
                        );
                    }
                    Err(e) => {
                        if e.requires_new_session() {
                            flags.replay_enabled.store(false, Ordering::SeqCst);
                            flags.session_expired.store(true, Ordering::SeqCst);
                        }
                        counter!("slot_watcher_replay_fallbacks_total").increment(1);
                        warn!(location_id = location.id, "Replay failed, falling back to browser: {}", e);
                        fallback_reason = Some(e.to_string());
                    }
                }
            } else {
                fallback_reason = Some("replay disabled for this cycle after session expiry".to_string());
            }
        }

        let result = match self.selector.select(session, location).await.into_result() {
            Ok(handle) => match self.extractor.extract(&handle).await {
                Ok(extraction) => ScanResult::succeeded(
                    location.id,
                    handle.strategy,
                    extraction,
                    elapsed_ms(),
                    fallback_reason,
                ),
                Err(e) => ScanResult::failed(
                    location.id,
                    handle.strategy,
                    ErrorInfo::from(AppError::from(e)),
                    elapsed_ms(),
                    fallback_reason,
                ),
            },
            Err(e) => {
                let last_tried = e.attempts.last().map(|(kind, _)| *kind).unwrap_or(StrategyKind::UiA);
                ScanResult::failed(
                    location.id,
                    last_tried,
                    ErrorInfo::from(AppError::from(e)),
                    elapsed_ms(),
                    fallback_reason,
                )
            }
        };

        record_result(result.strategy_used, result.success);
        result
    }
}

fn record_result(strategy: StrategyKind, success: bool) {
    let outcome = if success { "success" } else { "failure" };
    counter!(
        "slot_watcher_scan_results_total",
        "strategy" => strategy.as_str(),
        "outcome" => outcome
    )
    .increment(1);
}

#[async_trait]
impl SlotScanner for AppointmentScanner {
    async fn scan(&self, session: Arc<SessionContext>) -> ScanReport {
        let flags = CycleFlags {
            replay_enabled: AtomicBool::new(true),
            session_expired: AtomicBool::new(false),
        };

        let scans: Vec<_> = session
            .locations
            .iter()
            .map(|location| self.scan_location(&session, location, &flags))
            .collect();
        let results: Vec<ScanResult> = stream::iter(scans)
            .buffered(self.max_concurrent)
            .collect()
            .await;

        let succeeded = results.iter().filter(|r| r.success).count();
        info!(
            "Scanned {} location(s): {} succeeded, {} failed",
            results.len(),
            succeeded,
            results.len() - succeeded
        );

        ScanReport {
            results,
            session_expired: flags.session_expired.load(Ordering::SeqCst),
        }
    }
}
