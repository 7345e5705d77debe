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

//! Debounced backlog accounting.

use crate::observability::events;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

const COMPONENT: &str = "flow_control";

/// Backlog counter with hysteresis.
///
/// Once the backlog rises above `excessive` the control reports itself clogged and
/// stays clogged until the backlog falls back to `normal` or below. Producers are
/// expected to stop issuing work while clogged and may wait for the release with
/// [`DebouncedFlowControl::await_backlog`].
#[derive(Debug)]
pub struct DebouncedFlowControl {
    backlog: AtomicI64,
    normal: i64,
    excessive: i64,
    clogged: AtomicBool,
    released: Notify,
}

impl DebouncedFlowControl {
    pub fn new(normal: u64, excessive: u64) -> Self {
        let normal = i64::try_from(normal).unwrap_or(i64::MAX);
        let excessive = i64::try_from(excessive).unwrap_or(i64::MAX).max(normal);
        Self {
            backlog: AtomicI64::new(0),
            normal,
            excessive,
            clogged: AtomicBool::new(false),
            released: Notify::new(),
        }
    }

    pub fn backlog(&self) -> i64 {
        self.backlog.load(Ordering::Acquire)
    }

    pub fn normal_threshold(&self) -> i64 {
        self.normal
    }

    pub fn excessive_threshold(&self) -> i64 {
        self.excessive
    }

    pub fn is_clogged(&self) -> bool {
        self.clogged.load(Ordering::Acquire)
    }

    /// True once the backlog is past the point where acceptance should slow down.
    pub fn is_above_normal(&self) -> bool {
        self.backlog() > self.normal
    }

    pub fn adjust_backlog(&self, delta: i64) {
        if delta == 0 {
            return;
        }
        let backlog = self.backlog.fetch_add(delta, Ordering::AcqRel) + delta;

        if delta > 0 && backlog > self.excessive {
            if !self.clogged.swap(true, Ordering::AcqRel) {
                debug!(
                    event = events::FLOW_CONTROL_CLOGGED,
                    component = COMPONENT,
                    backlog,
                    excessive = self.excessive,
                    "backlog is excessive"
                );
            }
        } else if delta < 0
            && backlog <= self.normal
            && self.clogged.swap(false, Ordering::AcqRel)
        {
            debug!(
                event = events::FLOW_CONTROL_RELEASED,
                component = COMPONENT,
                backlog,
                normal = self.normal,
                "backlog back to normal"
            );
            self.released.notify_waiters();
        }
    }

    /// Waits until the control is no longer clogged. Returns false if `timeout`
    /// elapsed first.
    pub async fn await_backlog(&self, timeout: Option<Duration>) -> bool {
        let wait = async {
            loop {
                let released = self.released.notified();
                tokio::pin!(released);
                released.as_mut().enable();
                if !self.is_clogged() {
                    return;
                }
                released.await;
            }
        };

        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, wait).await.is_ok(),
            None => {
                wait.await;
                true
            }
        }
    }
}
