pub mod notifier;

pub use notifier::{DeliveryReceipt, NotificationProvider};
