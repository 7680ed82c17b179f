use serde::{Deserialize, Serialize};
use std::fmt;

pub mod location;
pub mod notification_job;
pub mod preferences;
pub mod scan_result;
pub mod session;
pub mod slot;

// Re-exports for convenience
pub use location::*;
pub use notification_job::*;
pub use preferences::*;
pub use scan_result::*;
pub use session::*;
pub use slot::*;

/// How a location's availability was obtained.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StrategyKind {
    /// Direct-link navigation to the location's calendar.
    UiA,
    /// Form-based location selection.
    UiB,
    /// JS widget interaction.
    UiC,
    DirectReplay,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::UiA => "UI_A",
            StrategyKind::UiB => "UI_B",
            StrategyKind::UiC => "UI_C",
            StrategyKind::DirectReplay => "DIRECT_REPLAY",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Channel {
    Email,
    Sms,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Email => "EMAIL",
            Channel::Sms => "SMS",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
