use serde::{Deserialize, Serialize};

use crate::models::{AppointmentSlot, Extraction, StrategyKind};
use crate::utils::error::AppError;

/// Serializable summary of an error, kept alongside scan history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: String,
    pub message: String,
}

impl From<&AppError> for ErrorInfo {
    fn from(err: &AppError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

impl From<AppError> for ErrorInfo {
    fn from(err: AppError) -> Self {
        Self::from(&err)
    }
}

/// Outcome of scanning one location in one cycle. Built once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanResult {
    pub location_id: u32,
    pub strategy_used: StrategyKind,
    pub success: bool,
    pub slots: Vec<AppointmentSlot>,
    pub skipped_entries: usize,
    pub elapsed_ms: u64,
    /// Why the fast replay path was abandoned for this location, if it was.
    pub fallback_reason: Option<String>,
    pub error: Option<ErrorInfo>,
}

impl ScanResult {
    pub fn succeeded(
        location_id: u32,
        strategy_used: StrategyKind,
        extraction: Extraction,
        elapsed_ms: u64,
        fallback_reason: Option<String>,
    ) -> Self {
        Self {
            location_id,
            strategy_used,
            success: true,
            slots: extraction.slots,
            skipped_entries: extraction.skipped,
            elapsed_ms,
            fallback_reason,
            error: None,
        }
    }

    /// A failed result carries no slots.
    pub fn failed(
        location_id: u32,
        strategy_used: StrategyKind,
        error: ErrorInfo,
        elapsed_ms: u64,
        fallback_reason: Option<String>,
    ) -> Self {
        Self {
            location_id,
            strategy_used,
            success: false,
            slots: Vec::new(),
            skipped_entries: 0,
            elapsed_ms,
            fallback_reason,
            error: Some(error),
        }
    }
}
