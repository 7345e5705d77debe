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

//! Elements handed to subscriber callers.

use crate::error::{Result, TopicError};
use crate::model::{ChannelId, CommitResult, Position, ReceivedElement};
use crate::serializer::ValueSerializer;
use crate::subscriber::engine::SubscriberCore;
use std::fmt::{Debug, Formatter};
use std::sync::Weak;
use std::time::SystemTime;

/// A received value together with where it came from. Committing it marks
/// everything up to its position in the channel as processed for the group.
pub struct Element<V> {
    value: V,
    received: ReceivedElement,
    core: Weak<SubscriberCore>,
}

impl<V> Element<V> {
    pub(crate) fn decode(
        received: ReceivedElement,
        serializer: &dyn ValueSerializer<V>,
        core: Weak<SubscriberCore>,
    ) -> Result<Self> {
        let value = serializer.deserialize(&received.binary).map_err(|err| {
            err.wrap(format!(
                "failed to decode element {} of channel {}",
                received.position, received.channel
            ))
        })?;
        Ok(Self {
            value,
            received,
            core,
        })
    }

    pub fn value(&self) -> &V {
        &self.value
    }

    pub fn into_value(self) -> V {
        self.value
    }

    pub fn binary(&self) -> &[u8] {
        &self.received.binary
    }

    pub fn channel(&self) -> ChannelId {
        self.received.channel
    }

    pub fn position(&self) -> Position {
        self.received.position
    }

    /// When the element was published.
    pub fn timestamp(&self) -> SystemTime {
        self.received.timestamp
    }

    pub async fn commit(&self) -> Result<CommitResult> {
        let core = self.core.upgrade().ok_or_else(|| {
            TopicError::IllegalState("the subscriber has been closed".to_string())
        })?;
        core.commit(self.received.channel, self.received.position)
            .await
    }
}

impl<V: Debug> Debug for Element<V> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Element")
            .field("value", &self.value)
            .field("channel", &self.received.channel)
            .field("position", &self.received.position)
            .finish()
    }
}
