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

//! Queue that accepts operations synchronously and releases them in batches.
//!
//! Callers [`BatchingQueue::add`] items and get an [`OperationFuture`] back. The
//! first add while the trigger is open closes it and runs the trigger function on
//! the queue's [`Executor`]; the drain side then alternates
//! [`BatchingQueue::fill_current_batch`] with one of the completion calls until
//! nothing is left, at which point filling reopens the trigger.
//!
//! Dropping an [`OperationFuture`] cancels that operation; cancelled items are
//! skipped when batches are filled and reported as failed completions.

use crate::batching::flow_control::DebouncedFlowControl;
use crate::error::{Result, TopicError};
use crate::observability::events;
use crate::runtime::Executor;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::debug;

const COMPONENT: &str = "batching_queue";

const TRIGGER_OPEN: u8 = 0;
const TRIGGER_CLOSED: u8 = 1;

/// Function invoked with the initial batch size when the trigger fires.
pub type TriggerFn = Arc<dyn Fn(usize) + Send + Sync>;

/// Weight of one queued item in flow-control units.
pub type UnitsFn<I> = Arc<dyn Fn(&I) -> u64 + Send + Sync>;

/// What [`BatchingQueue::handle_error`] does with the outstanding items.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorAction {
    /// Put the current batch back at the front of the pending items and re-trigger.
    Retry,
    /// Fail every outstanding item.
    CompleteWithException,
    /// Fail every outstanding item and close the queue.
    CompleteWithExceptionAndClose,
    /// Cancel every outstanding item.
    Cancel,
    /// Cancel every outstanding item and close the queue.
    CancelAndClose,
}

/// Result of one queued operation. Dropping it cancels the operation.
#[must_use = "dropping the future cancels the operation"]
pub struct OperationFuture<O> {
    receiver: oneshot::Receiver<Result<O>>,
}

impl<O> Future for OperationFuture<O> {
    type Output = Result<O>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.get_mut().receiver).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(TopicError::Cancelled(
                "operation was discarded before completion".to_string(),
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<O> Debug for OperationFuture<O> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationFuture").finish_non_exhaustive()
    }
}

struct QueuedItem<I, O> {
    seq: u64,
    value: I,
    units: u64,
    completion: oneshot::Sender<Result<O>>,
}

impl<I, O> QueuedItem<I, O> {
    fn is_cancelled(&self) -> bool {
        self.completion.is_closed()
    }
}

struct FlushWaiter {
    up_to: u64,
    done: oneshot::Sender<()>,
}

struct QueueState<I, O> {
    pending: VecDeque<QueuedItem<I, O>>,
    batch: VecDeque<QueuedItem<I, O>>,
    active: bool,
    paused: bool,
    next_seq: u64,
    flush_waiters: Vec<FlushWaiter>,
}

impl<I, O> QueueState<I, O> {
    fn has_outstanding_up_to(&self, seq: u64) -> bool {
        self.pending
            .iter()
            .chain(self.batch.iter())
            .any(|item| item.seq <= seq)
    }

    fn release_flush_waiters(&mut self) {
        if self.flush_waiters.is_empty() {
            return;
        }
        let waiters = std::mem::take(&mut self.flush_waiters);
        for waiter in waiters {
            if self.has_outstanding_up_to(waiter.up_to) {
                self.flush_waiters.push(waiter);
            } else {
                let _ = waiter.done.send(());
            }
        }
    }

    fn drain_all(&mut self) -> Vec<QueuedItem<I, O>> {
        let mut drained: Vec<_> = self.batch.drain(..).collect();
        drained.extend(self.pending.drain(..));
        drained
    }
}

/// Generic flow-controlled batching queue.
pub struct BatchingQueue<I, O> {
    name: String,
    state: Mutex<QueueState<I, O>>,
    trigger: AtomicU8,
    trigger_fn: TriggerFn,
    initial_batch: usize,
    units: UnitsFn<I>,
    backlog: Arc<DebouncedFlowControl>,
    executor: Arc<dyn Executor>,
}

impl<I, O> BatchingQueue<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    pub fn new(
        name: impl Into<String>,
        trigger_fn: TriggerFn,
        initial_batch: usize,
        units: UnitsFn<I>,
        backlog: Arc<DebouncedFlowControl>,
        executor: Arc<dyn Executor>,
    ) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                batch: VecDeque::new(),
                active: true,
                paused: false,
                next_seq: 0,
                flush_waiters: Vec::new(),
            }),
            trigger: AtomicU8::new(TRIGGER_OPEN),
            trigger_fn,
            initial_batch,
            units,
            backlog,
            executor,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Appends `value` to the pending items.
    pub fn add(&self, value: I) -> Result<OperationFuture<O>> {
        self.enqueue(value, false)
    }

    /// Puts `value` ahead of every pending item. Used for administrative requests.
    pub fn add_first(&self, value: I) -> Result<OperationFuture<O>> {
        self.enqueue(value, true)
    }

    fn enqueue(&self, value: I, first: bool) -> Result<OperationFuture<O>> {
        let units = (self.units)(&value);
        let (completion, receiver) = oneshot::channel();
        let fire = {
            let mut state = self.state.lock();
            if !state.active {
                return Err(TopicError::IllegalState(format!(
                    "{} is closed",
                    self.name
                )));
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            let item = QueuedItem {
                seq,
                value,
                units,
                completion,
            };
            if first {
                state.pending.push_front(item);
            } else {
                state.pending.push_back(item);
            }
            !state.paused && self.close_trigger()
        };

        self.backlog.adjust_backlog(units as i64);
        if fire {
            self.fire_trigger();
        }
        Ok(OperationFuture { receiver })
    }

    fn close_trigger(&self) -> bool {
        self.trigger
            .compare_exchange(
                TRIGGER_OPEN,
                TRIGGER_CLOSED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    fn fire_trigger(&self) {
        debug!(
            event = events::QUEUE_TRIGGER,
            component = COMPONENT,
            queue = self.name.as_str(),
            batch = self.initial_batch,
            "trigger fired"
        );
        let trigger_fn = self.trigger_fn.clone();
        let batch = self.initial_batch;
        self.executor.execute(Box::new(move || trigger_fn(batch)));
    }

    /// Fires the trigger if it is open and the queue is neither paused nor closed.
    pub fn trigger_operations(&self) {
        let fire = {
            let state = self.state.lock();
            state.active && !state.paused && self.close_trigger()
        };
        if fire {
            self.fire_trigger();
        }
    }

    /// Reopens the trigger so the next add or `trigger_operations` fires it again.
    pub fn reset_trigger(&self) {
        self.trigger.store(TRIGGER_OPEN, Ordering::Release);
    }

    pub fn is_trigger_open(&self) -> bool {
        self.trigger.load(Ordering::Acquire) == TRIGGER_OPEN
    }

    /// Moves pending items into the current batch until it holds `max_units`.
    ///
    /// Returns whether anything was added. When both the batch and the pending
    /// items are empty the trigger is reopened under the same lock that `add` uses,
    /// so an item can never be stranded behind a closed trigger.
    pub fn fill_current_batch(&self, max_units: usize) -> bool {
        let mut released = 0u64;
        let added = {
            let mut state = self.state.lock();
            released += prune_cancelled(&mut state.batch);

            let mut batch_units: u64 = state.batch.iter().map(|item| item.units).sum();
            let mut added = false;
            while batch_units < max_units as u64 {
                let Some(item) = state.pending.pop_front() else {
                    break;
                };
                if item.is_cancelled() {
                    released += item.units;
                    continue;
                }
                batch_units += item.units;
                state.batch.push_back(item);
                added = true;
            }

            if !added && state.batch.is_empty() && state.pending.is_empty() {
                self.reset_trigger();
            }
            if released > 0 {
                state.release_flush_waiters();
            }
            added
        };
        self.release_units(released);
        added
    }

    /// Moves the leading pending items that satisfy `predicate` to the front of the
    /// current batch, keeping their order. Only the drain side may call this.
    pub fn promote_pending(&self, predicate: impl Fn(&I) -> bool) -> bool {
        let mut state = self.state.lock();
        let mut promoted = Vec::new();
        while state
            .pending
            .front()
            .is_some_and(|item| predicate(&item.value))
        {
            if let Some(item) = state.pending.pop_front() {
                promoted.push(item);
            }
        }
        let any = !promoted.is_empty();
        for item in promoted.into_iter().rev() {
            state.batch.push_front(item);
        }
        any
    }

    /// Values of the current batch, skipping cancelled items.
    pub fn current_batch_values(&self) -> Vec<I>
    where
        I: Clone,
    {
        let (values, released) = {
            let mut state = self.state.lock();
            let released = prune_cancelled(&mut state.batch);
            if released > 0 {
                state.release_flush_waiters();
            }
            (
                state
                    .batch
                    .iter()
                    .map(|item| item.value.clone())
                    .collect::<Vec<_>>(),
                released,
            )
        };
        self.release_units(released);
        values
    }

    /// First item of the current batch, if any.
    pub fn batch_head(&self) -> Option<I>
    where
        I: Clone,
    {
        self.state
            .lock()
            .batch
            .front()
            .map(|item| item.value.clone())
    }

    /// True when every item of the current batch has completed, including when the
    /// batch is empty.
    pub fn is_batch_complete(&self) -> bool {
        let (complete, released) = {
            let mut state = self.state.lock();
            let released = prune_cancelled(&mut state.batch);
            if released > 0 {
                state.release_flush_waiters();
            }
            (state.batch.is_empty(), released)
        };
        self.release_units(released);
        complete
    }

    /// Completes the first item of the current batch with `result`.
    ///
    /// Hands `result` back when there is no such item or its caller already
    /// cancelled it, so the caller can return whatever it carries to its source.
    pub fn complete_element(&self, result: O) -> std::result::Result<(), O> {
        let item = {
            let mut state = self.state.lock();
            let item = state.batch.pop_front();
            if item.is_some() {
                state.release_flush_waiters();
            }
            item
        };
        let Some(item) = item else {
            return Err(result);
        };
        self.release_units(item.units);
        match item.completion.send(Ok(result)) {
            Ok(()) => Ok(()),
            Err(Ok(result)) => Err(result),
            Err(Err(_)) => Ok(()),
        }
    }

    /// Completes the first `count` items of the current batch with whatever
    /// `outcome` returns for each batch index. Returns how many callers actually
    /// received their outcome.
    pub fn complete_elements(
        &self,
        count: usize,
        mut outcome: impl FnMut(usize, &I) -> Result<O>,
    ) -> usize {
        if count == 0 {
            return 0;
        }
        let items: Vec<_> = {
            let mut state = self.state.lock();
            let count = count.min(state.batch.len());
            let items = state.batch.drain(..count).collect();
            state.release_flush_waiters();
            items
        };

        let mut delivered = 0;
        let mut released = 0;
        for (index, item) in items.into_iter().enumerate() {
            released += item.units;
            let result = outcome(index, &item.value);
            if item.completion.send(result).is_ok() {
                delivered += 1;
            }
        }
        self.release_units(released);
        delivered
    }

    /// Applies `action` to every outstanding item, building failures with
    /// `error_factory`.
    pub fn handle_error(&self, error_factory: impl Fn(&I) -> TopicError, action: ErrorAction) {
        debug!(
            event = events::QUEUE_ERROR_POLICY,
            component = COMPONENT,
            queue = self.name.as_str(),
            action = ?action,
            "applying error policy"
        );

        if action == ErrorAction::Retry {
            {
                let mut state = self.state.lock();
                while let Some(item) = state.batch.pop_back() {
                    state.pending.push_front(item);
                }
            }
            self.reset_trigger();
            self.trigger_operations();
            return;
        }

        let close = matches!(
            action,
            ErrorAction::CompleteWithExceptionAndClose | ErrorAction::CancelAndClose
        );
        let items = {
            let mut state = self.state.lock();
            if close {
                state.active = false;
            }
            let items = state.drain_all();
            state.release_flush_waiters();
            items
        };

        let mut released = 0;
        for item in items {
            released += item.units;
            let error = match action {
                ErrorAction::Cancel | ErrorAction::CancelAndClose => TopicError::Cancelled(
                    format!("{} cancelled outstanding operations", self.name),
                ),
                _ => error_factory(&item.value),
            };
            let _ = item.completion.send(Err(error));
        }
        self.release_units(released);
        if close {
            self.log_closed();
        }
    }

    /// Cancels every outstanding item and closes the queue.
    pub fn cancel_all_and_close(&self, reason: &str, cause: Option<&TopicError>) {
        let items = {
            let mut state = self.state.lock();
            state.active = false;
            let items = state.drain_all();
            state.release_flush_waiters();
            items
        };

        let message = match cause {
            Some(cause) => format!("{reason}: {cause}"),
            None => reason.to_string(),
        };
        let mut released = 0;
        for item in items {
            released += item.units;
            let _ = item
                .completion
                .send(Err(TopicError::Cancelled(message.clone())));
        }
        self.release_units(released);
        self.log_closed();
    }

    /// Rejects further adds; queued items are left for the drain side.
    pub fn close(&self) {
        let was_active = std::mem::replace(&mut self.state.lock().active, false);
        if was_active {
            self.log_closed();
        }
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    pub fn pause(&self) {
        self.state.lock().paused = true;
    }

    /// Lifts a pause. Returns whether there is queued work to drain.
    pub fn resume(&self) -> bool {
        let mut state = self.state.lock();
        state.paused = false;
        !state.pending.is_empty() || !state.batch.is_empty()
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    pub fn has_pending(&self) -> bool {
        !self.state.lock().pending.is_empty()
    }

    /// Pending plus in-batch items.
    pub fn size(&self) -> usize {
        let state = self.state.lock();
        state.pending.len() + state.batch.len()
    }

    pub fn flow_control(&self) -> &Arc<DebouncedFlowControl> {
        &self.backlog
    }

    /// Resolves once every item queued at the time of the call has completed,
    /// normally or not. Never fails.
    pub fn flush(&self) -> impl Future<Output = ()> + Send + 'static {
        let (receiver, released) = {
            let mut state = self.state.lock();
            let released = prune_cancelled(&mut state.pending);
            let receiver = if state.next_seq > 0 && state.has_outstanding_up_to(state.next_seq - 1)
            {
                let (done, receiver) = oneshot::channel();
                let up_to = state.next_seq - 1;
                state.flush_waiters.push(FlushWaiter { up_to, done });
                Some(receiver)
            } else {
                None
            };
            state.release_flush_waiters();
            (receiver, released)
        };
        self.release_units(released);

        async move {
            if let Some(receiver) = receiver {
                let _ = receiver.await;
            }
        }
    }

    fn release_units(&self, units: u64) {
        if units > 0 {
            self.backlog.adjust_backlog(-(units as i64));
        }
    }

    fn log_closed(&self) {
        debug!(
            event = events::QUEUE_CLOSED,
            component = COMPONENT,
            queue = self.name.as_str(),
            "queue closed"
        );
    }
}

impl<I, O> Debug for BatchingQueue<I, O> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("BatchingQueue")
            .field("name", &self.name)
            .field("pending", &state.pending.len())
            .field("batch", &state.batch.len())
            .field("active", &state.active)
            .field("paused", &state.paused)
            .finish()
    }
}

fn prune_cancelled<I, O>(items: &mut VecDeque<QueuedItem<I, O>>) -> u64 {
    let mut released = 0;
    items.retain(|item| {
        if item.is_cancelled() {
            released += item.units;
            false
        } else {
            true
        }
    });
    released
}

#[cfg(test)]
mod tests {
    use super::{BatchingQueue, ErrorAction, TriggerFn};
    use crate::batching::flow_control::DebouncedFlowControl;
    use crate::error::TopicError;
    use crate::runtime::Executor;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Runs trigger callbacks inline and counts them.
    #[derive(Default)]
    struct CountingExecutor {
        executed: AtomicUsize,
    }

    impl Executor for CountingExecutor {
        fn execute(&self, task: Box<dyn FnOnce() + Send>) {
            self.executed.fetch_add(1, Ordering::SeqCst);
            task();
        }
    }

    struct Fixture {
        queue: BatchingQueue<String, String>,
        executor: Arc<CountingExecutor>,
        triggered: Arc<AtomicUsize>,
    }

    fn fixture() -> Fixture {
        let executor = Arc::new(CountingExecutor::default());
        let triggered = Arc::new(AtomicUsize::new(0));
        let trigger: TriggerFn = {
            let triggered = triggered.clone();
            Arc::new(move |batch| {
                assert_eq!(batch, 1);
                triggered.fetch_add(1, Ordering::SeqCst);
            })
        };
        let queue = BatchingQueue::new(
            "test-queue",
            trigger,
            1,
            Arc::new(|_value: &String| 1),
            Arc::new(DebouncedFlowControl::new(2, 3)),
            executor.clone(),
        );
        Fixture {
            queue,
            executor,
            triggered,
        }
    }

    fn ok(value: &str) -> String {
        value.to_string()
    }

    #[test]
    fn new_queue_is_active_and_complete() {
        let Fixture { queue, .. } = fixture();

        assert!(queue.is_active());
        assert!(queue.is_batch_complete());
        assert!(queue.current_batch_values().is_empty());
        assert!(!queue.fill_current_batch(10));
    }

    #[test]
    fn closed_queue_rejects_adds() {
        let Fixture { queue, .. } = fixture();
        queue.close();

        let err = queue
            .add(ok("late"))
            .expect_err("closed queue should reject adds");

        assert!(!queue.is_active());
        assert!(err.is_illegal_state());
    }

    #[test]
    fn first_add_closes_trigger_and_runs_trigger_function_on_executor() {
        let Fixture {
            queue,
            executor,
            triggered,
        } = fixture();

        let _first = queue.add(ok("one")).expect("add should succeed");
        let _second = queue.add(ok("two")).expect("add should succeed");

        assert!(!queue.is_trigger_open());
        assert_eq!(triggered.load(Ordering::SeqCst), 1);
        assert_eq!(executor.executed.load(Ordering::SeqCst), 1);
        assert_eq!(queue.size(), 2);
    }

    #[test]
    fn add_first_jumps_ahead_of_pending_items() {
        let Fixture { queue, .. } = fixture();
        let _a = queue.add(ok("a")).expect("add should succeed");
        let _b = queue.add(ok("b")).expect("add should succeed");
        let _admin = queue.add_first(ok("admin")).expect("add should succeed");

        assert!(queue.fill_current_batch(3));
        assert_eq!(queue.current_batch_values(), vec!["admin", "a", "b"]);
    }

    #[test]
    fn promoted_items_overtake_the_current_batch() {
        let Fixture { queue, .. } = fixture();
        let _a = queue.add(ok("a")).expect("add should succeed");
        queue.fill_current_batch(1);
        let _b = queue.add(ok("b")).expect("add should succeed");
        let _x = queue.add_first(ok("admin-x")).expect("add should succeed");
        let _y = queue.add_first(ok("admin-y")).expect("add should succeed");

        assert!(queue.promote_pending(|value| value.starts_with("admin")));
        assert_eq!(queue.current_batch_values(), vec!["admin-y", "admin-x", "a"]);
        assert!(!queue.promote_pending(|value| value.starts_with("admin")));
        assert!(queue.has_pending());
    }

    #[test]
    fn fill_adds_nothing_when_batch_already_full() {
        let Fixture { queue, .. } = fixture();
        let _a = queue.add(ok("a")).expect("add should succeed");
        let _b = queue.add(ok("b")).expect("add should succeed");

        assert!(queue.fill_current_batch(1));
        assert!(!queue.fill_current_batch(1));
        assert_eq!(queue.current_batch_values(), vec!["a"]);
        assert!(queue.fill_current_batch(5));
        assert_eq!(queue.current_batch_values(), vec!["a", "b"]);
    }

    #[test]
    fn cancelled_items_are_not_part_of_the_batch() {
        let Fixture { queue, .. } = fixture();
        let _a = queue.add(ok("a")).expect("add should succeed");
        let cancelled = queue.add(ok("b")).expect("add should succeed");
        let _c = queue.add(ok("c")).expect("add should succeed");
        assert!(queue.fill_current_batch(3));

        drop(cancelled);

        assert_eq!(queue.current_batch_values(), vec!["a", "c"]);
        assert!(!queue.is_batch_complete());
    }

    #[test]
    fn complete_zero_elements_is_a_no_op() {
        let Fixture { queue, .. } = fixture();
        let mut future = queue.add(ok("a")).expect("add should succeed");
        queue.fill_current_batch(1);

        assert_eq!(queue.complete_elements(0, |_, value| Ok(value.clone())), 0);
        assert!((&mut future).now_or_never().is_none());
        assert_eq!(queue.current_batch_values(), vec!["a"]);
    }

    #[test]
    fn complete_elements_completes_requested_prefix_with_errors_by_index() {
        let Fixture { queue, .. } = fixture();
        let first = queue.add(ok("a")).expect("add should succeed");
        let second = queue.add(ok("b")).expect("add should succeed");
        let mut third = queue.add(ok("c")).expect("add should succeed");
        queue.fill_current_batch(3);

        let delivered = queue.complete_elements(2, |index, value| {
            if index == 1 {
                Err(TopicError::IllegalState(format!("{value} rejected")))
            } else {
                Ok(value.to_uppercase())
            }
        });

        assert_eq!(delivered, 2);
        assert_eq!(
            first
                .now_or_never()
                .expect("first should be complete")
                .expect("first should succeed"),
            "A"
        );
        assert!(second
            .now_or_never()
            .expect("second should be complete")
            .is_err());
        assert!((&mut third).now_or_never().is_none());
        assert_eq!(queue.current_batch_values(), vec!["c"]);
    }

    #[test]
    fn complete_element_hands_result_back_for_cancelled_item() {
        let Fixture { queue, .. } = fixture();
        let cancelled = queue.add(ok("a")).expect("add should succeed");
        queue.fill_current_batch(1);
        drop(cancelled);

        assert_eq!(queue.complete_element(ok("result")), Err(ok("result")));
        assert!(queue.is_batch_complete());
    }

    #[test]
    fn retry_moves_batch_back_ahead_of_pending_and_retriggers() {
        let Fixture {
            queue, triggered, ..
        } = fixture();
        let _a = queue.add(ok("a")).expect("add should succeed");
        let _b = queue.add(ok("b")).expect("add should succeed");
        queue.fill_current_batch(1);

        queue.handle_error(|_| TopicError::IllegalState("unused".into()), ErrorAction::Retry);

        assert!(queue.is_batch_complete());
        assert_eq!(triggered.load(Ordering::SeqCst), 2);
        queue.fill_current_batch(2);
        assert_eq!(queue.current_batch_values(), vec!["a", "b"]);
    }

    #[test]
    fn complete_with_exception_fails_everything_without_closing() {
        let Fixture { queue, .. } = fixture();
        let batched = queue.add(ok("a")).expect("add should succeed");
        let pending = queue.add(ok("b")).expect("add should succeed");
        queue.fill_current_batch(1);

        queue.handle_error(
            |value| TopicError::Fatal(format!("{value} failed")),
            ErrorAction::CompleteWithException,
        );

        for future in [batched, pending] {
            let err = future
                .now_or_never()
                .expect("future should be complete")
                .expect_err("future should fail");
            assert!(err.is_fatal());
        }
        assert!(queue.is_active());
        assert_eq!(queue.size(), 0);
    }

    #[test]
    fn cancel_and_close_cancels_everything_and_closes() {
        let Fixture { queue, .. } = fixture();
        let batched = queue.add(ok("a")).expect("add should succeed");
        let pending = queue.add(ok("b")).expect("add should succeed");
        queue.fill_current_batch(1);

        queue.handle_error(
            |_| TopicError::IllegalState("unused".into()),
            ErrorAction::CancelAndClose,
        );

        for future in [batched, pending] {
            let err = future
                .now_or_never()
                .expect("future should be complete")
                .expect_err("future should be cancelled");
            assert!(err.is_cancellation());
        }
        assert!(!queue.is_active());
        assert_eq!(queue.flow_control().backlog(), 0);
    }

    #[test]
    fn pause_suppresses_trigger_until_resumed() {
        let Fixture {
            queue, triggered, ..
        } = fixture();
        queue.pause();
        let _a = queue.add(ok("a")).expect("add should succeed");

        assert_eq!(triggered.load(Ordering::SeqCst), 0);
        assert!(queue.resume());
        queue.trigger_operations();
        assert_eq!(triggered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn draining_the_last_item_reopens_the_trigger() {
        let Fixture {
            queue, triggered, ..
        } = fixture();
        let _a = queue.add(ok("a")).expect("add should succeed");
        queue.fill_current_batch(1);
        queue.complete_elements(1, |_, value| Ok(value.clone()));

        assert!(!queue.fill_current_batch(1));
        assert!(queue.is_trigger_open());
        let _b = queue.add(ok("b")).expect("add should succeed");
        assert_eq!(triggered.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn flush_waits_for_queued_and_batched_items() {
        let Fixture { queue, .. } = fixture();
        let _a = queue.add(ok("a")).expect("add should succeed");
        let _b = queue.add(ok("b")).expect("add should succeed");
        queue.fill_current_batch(1);
        let mut flush = Box::pin(queue.flush());

        assert!((&mut flush).now_or_never().is_none());
        queue.complete_elements(1, |_, value| Ok(value.clone()));
        assert!((&mut flush).now_or_never().is_none());
        queue.fill_current_batch(1);
        queue.complete_elements(1, |_, _| Err(TopicError::IllegalState("boom".into())));

        flush.await;
        assert_eq!(queue.size(), 0);
    }

    #[tokio::test]
    async fn flush_of_empty_queue_resolves_immediately() {
        let Fixture { queue, .. } = fixture();

        queue.flush().await;
    }

    #[test]
    fn backlog_tracks_outstanding_units() {
        let Fixture { queue, .. } = fixture();
        let _futures: Vec<_> = (0..4)
            .map(|index| queue.add(index.to_string()).expect("add should succeed"))
            .collect();

        assert!(queue.flow_control().is_clogged());
        queue.fill_current_batch(4);
        queue.complete_elements(2, |_, value| Ok(value.clone()));
        assert_eq!(queue.flow_control().backlog(), 2);
        assert!(!queue.flow_control().is_clogged());
    }
}
