//! # Event System
//!
//! Publish/subscribe event bus with per-subscriber failure isolation and
//! dead-letter stores. Lifecycle events from the integration manager and the
//! workflow orchestrator are published here for external consumers.

pub mod bus;
pub mod types;

pub use bus::{EventBus, EventBusError, EventBusResult, EventSubscriber, FnSubscriber};
pub use types::{
    DeliveryOutcome, Event, EventBusStats, EventDeadLetter, PublishReport, SubscriberDelivery,
    SubscriberDetail,
};
