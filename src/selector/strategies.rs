use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use super::{SelectionStrategy, SlotView};
use crate::browser::PageDriver;
use crate::config::SiteLayout;
use crate::models::{Location, SessionContext, StrategyKind};
use crate::utils::error::StrategyError;

/// Build the strategy chain in the configured order.
pub fn build_chain(
    kinds: &[StrategyKind],
    layout: &SiteLayout,
    element_timeout: Duration,
) -> Vec<Box<dyn SelectionStrategy>> {
    kinds
        .iter()
        .filter_map(|kind| -> Option<Box<dyn SelectionStrategy>> {
            match kind {
                StrategyKind::UiA => Some(Box::new(DirectLink::new(layout.clone(), element_timeout))),
                StrategyKind::UiB => Some(Box::new(LocationForm::new(layout.clone(), element_timeout))),
                StrategyKind::UiC => Some(Box::new(WidgetScript::new(layout.clone(), element_timeout))),
                StrategyKind::DirectReplay => {
                    warn!("DIRECT_REPLAY is not a page strategy; ignoring it in the selection chain");
                    None
                }
            }
        })
        .collect()
}

fn rendered_calendar(layout: &SiteLayout) -> SlotView {
    SlotView::RenderedCalendar {
        container: layout.calendar_selector.clone(),
        slot_selector: layout.slot_selector.clone(),
        date_attribute: layout.date_attribute.clone(),
        time_attribute: layout.time_attribute.clone(),
    }
}

/// Fail if the site bounced the page to an error or expiry URL.
async fn ensure_not_redirected(page: &dyn PageDriver, layout: &SiteLayout) -> Result<(), StrategyError> {
    let url = page.current_url().await?;
    if layout.expired_markers.iter().any(|marker| url.contains(marker.as_str())) {
        return Err(StrategyError::UnexpectedRedirect { url });
    }
    Ok(())
}

/// UI_A: navigate straight to the location's calendar URL.
pub struct DirectLink {
    layout: SiteLayout,
    element_timeout: Duration,
}

impl DirectLink {
    pub fn new(layout: SiteLayout, element_timeout: Duration) -> Self {
        Self {
            layout,
            element_timeout,
        }
    }
}

#[async_trait]
impl SelectionStrategy for DirectLink {
    fn kind(&self) -> StrategyKind {
        StrategyKind::UiA
    }

    async fn attempt(
        &self,
        session: &SessionContext,
        location: &Location,
        page: &dyn PageDriver,
    ) -> Result<SlotView, StrategyError> {
        let url = session.resolve(&self.layout.location_path, location)?;
        page.navigate(url.as_str()).await?;
        ensure_not_redirected(page, &self.layout).await?;

        page.wait_for(&self.layout.calendar_selector, self.element_timeout).await?;
        Ok(rendered_calendar(&self.layout))
    }
}

/// UI_B: pick the location from the form's `<select>` and continue.
pub struct LocationForm {
    layout: SiteLayout,
    element_timeout: Duration,
}

impl LocationForm {
    pub fn new(layout: SiteLayout, element_timeout: Duration) -> Self {
        Self {
            layout,
            element_timeout,
        }
    }

    fn select_script(&self, location: &Location) -> String {
        let selector = Value::String(self.layout.location_select_selector.clone());
        let value = Value::String(location.id.to_string());
        format!(
            r#"(function() {{
    var select = document.querySelector({selector});
    if (!select) {{ return JSON.stringify({{ found: false }}); }}
    var option = Array.prototype.find.call(select.options, function(o) {{ return o.value === {value}; }});
    if (!option) {{ return JSON.stringify({{ found: false }}); }}
    select.value = option.value;
    select.dispatchEvent(new Event('change', {{ bubbles: true }}));
    return JSON.stringify({{ found: true }});
}})()"#
        )
    }
}

#[async_trait]
impl SelectionStrategy for LocationForm {
    fn kind(&self) -> StrategyKind {
        StrategyKind::UiB
    }

    async fn attempt(
        &self,
        session: &SessionContext,
        location: &Location,
        page: &dyn PageDriver,
    ) -> Result<SlotView, StrategyError> {
        let url = session.resolve(&self.layout.form_path, location)?;
        page.navigate(url.as_str()).await?;
        ensure_not_redirected(page, &self.layout).await?;

        page.wait_for(&self.layout.location_select_selector, self.element_timeout).await?;

        let selected = page.evaluate(&self.select_script(location)).await?;
        if selected.get("found") != Some(&Value::Bool(true)) {
            return Err(StrategyError::MissingElement {
                selector: format!(
                    "{} option[value=\"{}\"]",
                    self.layout.location_select_selector, location.id
                ),
            });
        }
        debug!(location_id = location.id, "Selected location in form");

        page.click(&self.layout.continue_selector).await?;
        ensure_not_redirected(page, &self.layout).await?;

        page.wait_for(&self.layout.calendar_selector, self.element_timeout).await?;
        Ok(rendered_calendar(&self.layout))
    }
}

/// UI_C: click the location's card in the JS widget and read its slot data.
pub struct WidgetScript {
    layout: SiteLayout,
    element_timeout: Duration,
}

impl WidgetScript {
    pub fn new(layout: SiteLayout, element_timeout: Duration) -> Self {
        Self {
            layout,
            element_timeout,
        }
    }
}

#[async_trait]
impl SelectionStrategy for WidgetScript {
    fn kind(&self) -> StrategyKind {
        StrategyKind::UiC
    }

    async fn attempt(
        &self,
        session: &SessionContext,
        location: &Location,
        page: &dyn PageDriver,
    ) -> Result<SlotView, StrategyError> {
        let url = session.resolve(&self.layout.form_path, location)?;
        page.navigate(url.as_str()).await?;
        ensure_not_redirected(page, &self.layout).await?;

        let widget = session.render(&self.layout.widget_selector, location)?;
        page.wait_for(&widget, self.element_timeout).await?;
        page.click(&widget).await?;
        ensure_not_redirected(page, &self.layout).await?;

        page.wait_for(&self.layout.calendar_selector, self.element_timeout).await?;
        Ok(SlotView::ScriptData {
            script: self.layout.slot_data_script.clone(),
        })
    }
}
