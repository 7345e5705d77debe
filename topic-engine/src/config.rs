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

//! Topic dependencies reported by connectors.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_RECONNECT_TIMEOUT_MILLIS: u64 = 300_000;
const DEFAULT_RECONNECT_RETRY_MILLIS: u64 = 5_000;
const DEFAULT_RECONNECT_WAIT_MILLIS: u64 = 10_000;
const DEFAULT_MAX_BATCH_SIZE_BYTES: usize = 1024 * 1024;
const DEFAULT_CLOSE_TIMEOUT_MILLIS: u64 = 30_000;
const DEFAULT_SUBSCRIBER_TIMEOUT_MILLIS: u64 = 300_000;
const DEFAULT_CLOGGED_COUNT: usize = 100;

/// Timing and sizing knobs for a topic, owned by the backend and handed to the
/// engine through the connector.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicDependencies {
    pub reconnect_timeout_millis: u64,
    pub reconnect_retry_millis: u64,
    pub reconnect_wait_millis: u64,
    pub max_batch_size_bytes: usize,
    /// Zero disables post-full notifications.
    pub notify_post_full_timeout_millis: u64,
    pub subscriber_timeout_millis: u64,
    pub close_timeout_millis: u64,
    /// Outstanding receive requests at which a subscriber reports itself clogged.
    pub clogged_count: usize,
}

impl Default for TopicDependencies {
    fn default() -> Self {
        Self {
            reconnect_timeout_millis: DEFAULT_RECONNECT_TIMEOUT_MILLIS,
            reconnect_retry_millis: DEFAULT_RECONNECT_RETRY_MILLIS,
            reconnect_wait_millis: DEFAULT_RECONNECT_WAIT_MILLIS,
            max_batch_size_bytes: DEFAULT_MAX_BATCH_SIZE_BYTES,
            notify_post_full_timeout_millis: 0,
            subscriber_timeout_millis: DEFAULT_SUBSCRIBER_TIMEOUT_MILLIS,
            close_timeout_millis: DEFAULT_CLOSE_TIMEOUT_MILLIS,
            clogged_count: DEFAULT_CLOGGED_COUNT,
        }
    }
}

impl TopicDependencies {
    /// Parses dependencies from JSON; absent fields keep their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn reconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.reconnect_timeout_millis)
    }

    pub fn reconnect_retry(&self) -> Duration {
        Duration::from_millis(self.reconnect_retry_millis)
    }

    pub fn reconnect_wait(&self) -> Duration {
        Duration::from_millis(self.reconnect_wait_millis)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_millis)
    }

    pub fn subscriber_timeout(&self) -> Duration {
        Duration::from_millis(self.subscriber_timeout_millis)
    }

    /// True when a full channel should pause and wait for a freed notification.
    pub fn notify_post_full(&self) -> bool {
        self.notify_post_full_timeout_millis > 0
    }
}
