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

//! Receiving side of a topic.

mod channel;
mod element;
mod engine;
mod options;
mod request;
mod state;
mod statistics;
mod topic_subscriber;

pub use channel::ChannelStatistics;
pub use element::Element;
pub use options::{ChannelOwnershipListener, Filter, SubscriberOptions};
pub use state::{StateListener, SubscriberState};
pub use statistics::SubscriberStatistics;
pub use topic_subscriber::{Receive, Subscriber};
