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

//! Subscriber lifecycle.

use crate::lifecycle::LifecycleState;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriberState {
    Initial,
    Connecting,
    Connected,
    Disconnected,
    Closing,
    Closed,
}

impl SubscriberState {
    pub fn is_active(self) -> bool {
        !matches!(self, SubscriberState::Closing | SubscriberState::Closed)
    }
}

impl LifecycleState for SubscriberState {
    fn to_u8(self) -> u8 {
        self as u8
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => SubscriberState::Initial,
            1 => SubscriberState::Connecting,
            2 => SubscriberState::Connected,
            3 => SubscriberState::Disconnected,
            4 => SubscriberState::Closing,
            _ => SubscriberState::Closed,
        }
    }

    fn can_transition(self, next: Self) -> bool {
        use SubscriberState::*;
        matches!(
            (self, next),
            (Initial | Disconnected, Connecting)
                | (Connecting, Connected)
                | (Initial | Connecting | Connected, Disconnected)
                | (Initial | Connecting | Connected | Disconnected, Closing)
                | (Closing, Closed)
        )
    }
}

/// Observer of subscriber state changes.
pub trait StateListener: Send + Sync {
    fn on_state_change(&self, state: SubscriberState, previous: SubscriberState);
}
