/********************************************************************************
 * Copyright (c) 2024 Contributors to the Eclipse Foundation
 *
 * See the NOTICE file(s) distributed with this work for additional
 * information regarding copyright ownership.
 *
 * This program and the accompanying materials are made available under the
 * terms of the Apache License Version 2.0 which is available at
 * https://www.apache.org/licenses/LICENSE-2.0
 *
 * SPDX-License-Identifier: Apache-2.0
 ********************************************************************************/

//! # topic-engine
//!
//! `topic-engine` is the client side of a channel-partitioned publish/subscribe
//! topic. Publishers append values to ordered channels; subscribers read them back
//! with at-least-once, per-channel-ordered delivery, alone or as members of a
//! durable group that shares the channels between its members.
//!
//! The engine never talks to storage itself. Every RPC goes through a
//! [`PublisherConnector`] or [`SubscriberConnector`], and the engine reacts to the
//! events those connectors raise: channels freed, channels populated, allocation
//! changes, disconnects.
//!
//! ## Layout
//!
//! - `publisher`: [`Publisher`] routes each value to a channel by its order key and
//!   runs one batching engine per channel with topic-full pausing and offer retry.
//! - `subscriber`: [`Subscriber`] tracks owned channels, polls them round robin into
//!   a prefetch queue and serves receive, seek and position requests from one
//!   request queue.
//! - `batching`: [`BatchingQueue`] and [`DebouncedFlowControl`], shared by both sides.
//! - `allocation`: [`SimpleChannelAllocationStrategy`] assigns channels to the live
//!   members of a subscriber group.
//! - `connector`: the backend traits and their events.
//!
//! ## Allocating channels
//!
//! ```
//! use std::collections::{BTreeMap, BTreeSet};
//! use topic_engine::{
//!     AllocationInput, ChannelAllocationStrategy, ClusterMembership,
//!     SimpleChannelAllocationStrategy, SubscriberId,
//! };
//!
//! let first = SubscriberId::external(1);
//! let second = SubscriberId::external(2);
//! let subscribers = BTreeSet::from([first, second]);
//! let manual = BTreeMap::new();
//! let membership = ClusterMembership::default();
//!
//! let allocation = SimpleChannelAllocationStrategy.allocate(&AllocationInput {
//!     subscribers: &subscribers,
//!     manual: &manual,
//!     channel_count: 4,
//!     membership: &membership,
//! });
//!
//! assert_eq!(allocation.channels_of(&first), BTreeSet::from([0, 2]));
//! assert_eq!(allocation.channels_of(&second), BTreeSet::from([1, 3]));
//! ```
//!
//! ## Observability model
//!
//! The library emits structured `tracing` events and never installs a subscriber.
//! Every event carries an `event` name and a `component`; binaries and tests decide
//! how to render them, typically with `tracing_subscriber::fmt`.

mod allocation;
mod batching;
mod config;
mod connector;
mod error;
mod lifecycle;
mod listeners;
mod model;
mod publisher;
mod runtime;
mod serializer;
mod subscriber;

#[doc(hidden)]
pub mod observability;

pub use allocation::{
    AllocationInput, ChannelAllocation, ChannelAllocationStrategy, ClusterMembership,
    SimpleChannelAllocationStrategy,
};
pub use batching::{BatchingQueue, DebouncedFlowControl, ErrorAction, OperationFuture};
pub use config::TopicDependencies;
pub use connector::{
    InitializeRequest, PublisherChannelConnector, PublisherConnector, PublisherEvent,
    PublisherListener, SubscriberConnector, SubscriberEvent, SubscriberListener,
};
pub use error::{Result, TopicError};
pub use lifecycle::{LifecycleState, StateCell};
pub use listeners::ListenerRegistry;
pub use model::{
    ChannelId, CommitResult, CommitStatus, OfferCookie, Position, PublishReceipt,
    PublishResult, PublishStatus, ReceiveResult, ReceiveStatus, ReceivedElement, SeekResult,
    SubscriberGroupId, SubscriberId,
};
pub use publisher::{
    FlushMode, OnFailure, OrderBy, Publisher, PublisherOptions, PublisherState,
    PublisherStatistics,
};
pub use runtime::Executor;
pub use serializer::{BinarySerializer, JsonSerializer, ValueSerializer};
pub use subscriber::{
    ChannelOwnershipListener, ChannelStatistics, Element, Filter, Receive, StateListener,
    Subscriber, SubscriberOptions, SubscriberState, SubscriberStatistics,
};
