pub mod dispatcher;
pub mod notifiers;
pub mod traits;

pub use dispatcher::{ChannelOutcome, DispatchReport, NotificationDispatcher, RecipientConfig, RetryPolicy};
pub use traits::{DeliveryReceipt, NotificationProvider};
