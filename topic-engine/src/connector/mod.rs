//! Backend boundary.
//!
//! Connectors perform the actual offer/receive/commit RPCs against whatever stores
//! the topic. The engine only ever talks to them through these traits and reacts
//! to the events they raise.

mod publisher;
mod subscriber;

pub use publisher::{
    PublisherChannelConnector, PublisherConnector, PublisherEvent, PublisherListener,
};
pub use subscriber::{InitializeRequest, SubscriberConnector, SubscriberEvent, SubscriberListener};
