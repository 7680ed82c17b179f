use async_trait::async_trait;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::browser::{PageDriver, PageLease, PagePool};
use crate::models::{Location, SessionContext, StrategyKind};
use crate::utils::error::{SelectionError, StrategyError};

pub mod strategies;

pub use strategies::{build_chain, DirectLink, LocationForm, WidgetScript};

/// How slot data can be read from a page once a strategy has reached it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotView {
    /// Server-rendered calendar; each slot element carries date/time attributes.
    RenderedCalendar {
        container: String,
        slot_selector: String,
        date_attribute: String,
        time_attribute: String,
    },
    /// Client-side widget; the script returns a JSON array of `{date, time}` entries.
    ScriptData { script: String },
}

/// One way of getting from a fresh page to a location's availability view.
#[async_trait]
pub trait SelectionStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    async fn attempt(
        &self,
        session: &SessionContext,
        location: &Location,
        page: &dyn PageDriver,
    ) -> Result<SlotView, StrategyError>;
}

/// A page positioned on a location's availability view. Dropping it releases the page.
#[derive(Debug)]
pub struct SelectionHandle {
    pub location: Location,
    pub strategy: StrategyKind,
    pub page: PageLease,
    pub view: SlotView,
}

#[derive(Debug)]
pub struct SelectionOutcome {
    pub success: bool,
    pub strategy_used: Option<StrategyKind>,
    pub handle: Option<SelectionHandle>,
    pub error: Option<SelectionError>,
}

impl SelectionOutcome {
    fn selected(handle: SelectionHandle) -> Self {
        Self {
            success: true,
            strategy_used: Some(handle.strategy),
            handle: Some(handle),
            error: None,
        }
    }

    fn exhausted(error: SelectionError) -> Self {
        Self {
            success: false,
            strategy_used: None,
            handle: None,
            error: Some(error),
        }
    }

    pub fn into_result(self) -> Result<SelectionHandle, SelectionError> {
        match (self.handle, self.error) {
            (Some(handle), _) => Ok(handle),
            (None, Some(error)) => Err(error),
            (None, None) => Err(SelectionError {
                attempts: Vec::new(),
            }),
        }
    }
}

/// Tries each strategy in order, each once, on its own page and under its own timeout.
pub struct LocationSelector {
    strategies: Vec<Box<dyn SelectionStrategy>>,
    pages: PagePool,
    attempt_timeout: Duration,
}

impl LocationSelector {
    pub fn new(
        strategies: Vec<Box<dyn SelectionStrategy>>,
        pages: PagePool,
        attempt_timeout: Duration,
    ) -> Self {
        Self {
            strategies,
            pages,
            attempt_timeout,
        }
    }

    pub fn pages(&self) -> &PagePool {
        &self.pages
    }

    pub async fn select(&self, session: &SessionContext, location: &Location) -> SelectionOutcome {
        let mut attempts = Vec::with_capacity(self.strategies.len());

        for strategy in &self.strategies {
            let kind = strategy.kind();
            let started = Instant::now();
            debug!(location_id = location.id, strategy = %kind, "Trying selection strategy");

            let attempt = async {
                let page = self.pages.lease().await?;
                let view = strategy.attempt(session, location, &*page).await?;
                Ok::<_, StrategyError>((page, view))
            };

            let error = match tokio::time::timeout(self.attempt_timeout, attempt).await {
                Ok(Ok((page, view))) => {
                    info!(
                        location_id = location.id,
                        strategy = %kind,
                        "Reached availability view in {}ms",
                        started.elapsed().as_millis()
                    );
                    return SelectionOutcome::selected(SelectionHandle {
                        location: location.clone(),
                        strategy: kind,
                        page,
                        view,
                    });
                }
                Ok(Err(e)) => e,
                Err(_) => StrategyError::Timeout {
                    after_ms: self.attempt_timeout.as_millis() as u64,
                },
            };

            warn!(location_id = location.id, strategy = %kind, "Selection strategy failed: {}", error);
            attempts.push((kind, error));
        }

        SelectionOutcome::exhausted(SelectionError { attempts })
    }
}
