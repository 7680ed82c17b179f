pub mod browser;
pub mod config;
pub mod extractor;
pub mod models;
pub mod monitor;
pub mod plugins;
pub mod registry;
pub mod replayer;
pub mod scanner;
pub mod selector;
pub mod session;
pub mod utils;

// Re-export commonly used types
pub use config::AppConfig;
pub use monitor::{MonitorLoop, MonitorSettings, MonitorState, MonitorStatus};
pub use scanner::{AppointmentScanner, ScanReport, SlotScanner};
pub use utils::error::AppError;

pub type Result<T> = std::result::Result<T, AppError>;
