pub mod notifier;
pub mod schedule;
pub mod trigger;

pub use notifier::{FanoutNotifier, LogNotifier, Notifier, NotifyEvent, WebhookNotifier};
pub use schedule::{PendingTriggers, Schedule};
pub use trigger::{Trigger, TriggerEvent, TriggerMode};
