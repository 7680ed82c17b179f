// Notification provider implementations
pub mod email;
pub mod sms;

pub use email::EmailNotifier;
pub use sms::SmsNotifier;
