//! Outbox/inbox reliability layer
//!
//! - [`OutboxDispatcher`] publishes rows written by committed transitions
//! - [`InboxProcessor`] consumes them exactly once per consumer
//! - [`NotificationConsumer`] and [`AuditConsumer`] are the built-in consumers

mod consumers;
mod inbox;
mod outbox;
mod transport;

pub use consumers::{AuditConsumer, NotificationConsumer};
pub use inbox::{
    AuditEntry, ConsumerEffect, ConsumerError, InboxError, InboxOutcome, InboxProcessor,
    InboxReceipt, MessageConsumer, Notification,
};
pub use outbox::{
    DispatchReport, MessagePublisher, OutboxDispatcher, OutboxDispatcherConfig, OutboxMessage,
    PublishError,
};
pub use transport::InMemoryTransport;
