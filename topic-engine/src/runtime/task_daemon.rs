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

//! Dedicated daemon thread driving a current-thread Tokio runtime.

use crate::error::{Result, TopicError};
use crate::observability::{events, fields::WorkerContext};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use tokio::runtime::{Builder, Handle};
use tokio::sync::oneshot;
use tracing::{debug, warn};

const COMPONENT: &str = "task_daemon";

/// A named worker thread that executes submitted closures and futures in
/// submission order.
///
/// Tasks still pending when the daemon stops are dropped.
pub(crate) struct TaskDaemon {
    context: WorkerContext,
    handle: Handle,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    stopped: AtomicBool,
}

impl TaskDaemon {
    /// Spawns the daemon thread and its runtime.
    pub(crate) fn start(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| {
                warn!(
                    event = events::DAEMON_START_FAILED,
                    component = COMPONENT,
                    worker_id = name.as_str(),
                    err = %err,
                    "failed to build daemon runtime"
                );
                TopicError::IllegalState(format!("failed to build runtime for {name}: {err}"))
            })?;
        let handle = runtime.handle().clone();
        let (shutdown_sender, shutdown_receiver) = oneshot::channel::<()>();

        let join_handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                runtime.block_on(async {
                    let _ = shutdown_receiver.await;
                });
            })
            .map_err(|err| {
                warn!(
                    event = events::DAEMON_START_FAILED,
                    component = COMPONENT,
                    worker_id = name.as_str(),
                    err = %err,
                    "failed to spawn daemon thread"
                );
                TopicError::IllegalState(format!("failed to spawn daemon thread {name}: {err}"))
            })?;

        let context = WorkerContext::new(name, join_handle.thread().name());
        debug!(
            event = events::DAEMON_START,
            component = COMPONENT,
            worker_id = context.worker_id.as_str(),
            worker_thread = context.worker_thread.as_str(),
            "daemon started"
        );

        Ok(Self {
            context,
            handle,
            shutdown: Mutex::new(Some(shutdown_sender)),
            stopped: AtomicBool::new(false),
        })
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub(crate) fn execute<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.spawn(async move { task() });
    }

    pub(crate) fn spawn<Fut>(&self, future: Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.is_stopped() {
            return;
        }
        drop(self.handle.spawn(future));
    }

    /// Signals the daemon thread to exit. Safe to call from the daemon itself.
    pub(crate) fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(shutdown) = self.shutdown.lock().take() {
            let _ = shutdown.send(());
        }
        debug!(
            event = events::DAEMON_STOP,
            component = COMPONENT,
            worker_id = self.context.worker_id.as_str(),
            worker_thread = self.context.worker_thread.as_str(),
            "daemon stopped"
        );
    }
}

impl Drop for TaskDaemon {
    fn drop(&mut self) {
        self.stop();
    }
}
