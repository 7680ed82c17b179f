use scraper::{Html, Selector};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::models::Extraction;
use crate::selector::{SelectionHandle, SlotView};
use crate::utils::error::StrategyError;

/// Reads normalized slots off a page a selection strategy has positioned.
#[derive(Debug, Clone)]
pub struct SlotExtractor {
    timeout: Duration,
}

impl SlotExtractor {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Zero slots is a valid answer; an error means the page could not be read at all.
    pub async fn extract(&self, handle: &SelectionHandle) -> Result<Extraction, StrategyError> {
        let location_id = handle.location.id;
        let read = async {
            match &handle.view {
                SlotView::RenderedCalendar {
                    container,
                    slot_selector,
                    date_attribute,
                    time_attribute,
                } => {
                    let html = handle.page.content().await?;
                    parse_calendar(
                        location_id,
                        &html,
                        container,
                        slot_selector,
                        date_attribute,
                        time_attribute,
                    )
                }
                SlotView::ScriptData { script } => {
                    let data = handle.page.evaluate(script).await?;
                    parse_script_data(location_id, data)
                }
            }
        };

        let extraction = tokio::time::timeout(self.timeout, read)
            .await
            .map_err(|_| StrategyError::Timeout {
                after_ms: self.timeout.as_millis() as u64,
            })??;

        debug!(
            location_id,
            strategy = %handle.strategy,
            "Extracted {} slot(s), skipped {} malformed entr(ies)",
            extraction.slots.len(),
            extraction.skipped
        );
        Ok(extraction)
    }
}

fn parse_selector(selector: &str) -> Result<Selector, StrategyError> {
    Selector::parse(selector).map_err(|_| StrategyError::InvalidSelector(selector.to_string()))
}

pub fn parse_calendar(
    location_id: u32,
    html: &str,
    container: &str,
    slot_selector: &str,
    date_attribute: &str,
    time_attribute: &str,
) -> Result<Extraction, StrategyError> {
    let document = Html::parse_document(html);
    let container_sel = parse_selector(container)?;
    let slot_sel = parse_selector(slot_selector)?;

    let calendar = document
        .select(&container_sel)
        .next()
        .ok_or_else(|| StrategyError::MissingElement {
            selector: container.to_string(),
        })?;

    let pairs = calendar.select(&slot_sel).map(|slot| {
        let element = slot.value();
        (element.attr(date_attribute), element.attr(time_attribute))
    });

    Ok(Extraction::from_pairs(location_id, pairs))
}

/// Accepts either a bare array of entries or an object with a `slots` array.
pub fn parse_script_data(location_id: u32, data: Value) -> Result<Extraction, StrategyError> {
    let entries = match data {
        Value::Array(entries) => entries,
        Value::Object(mut object) => match object.remove("slots") {
            Some(Value::Array(entries)) => entries,
            _ => return Err(StrategyError::NoSlotData("object without a slots array".to_string())),
        },
        Value::Null => return Err(StrategyError::NoSlotData("script returned null".to_string())),
        other => {
            return Err(StrategyError::NoSlotData(format!(
                "unexpected {} value",
                json_type(&other)
            )))
        }
    };

    Ok(Extraction::from_json_entries(location_id, &entries))
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
