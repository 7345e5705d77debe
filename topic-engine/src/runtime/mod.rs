//! Runtime integration layer.
//!
//! Every engine component drives its work on executors it owns: a [`TaskDaemon`]
//! per publisher, two per subscriber, plus the process-wide [`scheduler`] for
//! delayed reconnects and close tasks. Backend futures are always awaited from one
//! of these, so connector I/O threads never run engine continuations.

pub(crate) mod scheduler;
pub(crate) mod task_daemon;

pub(crate) use task_daemon::TaskDaemon;

/// Somewhere to run batch-drain callbacks off the caller's thread.
pub trait Executor: Send + Sync {
    fn execute(&self, task: Box<dyn FnOnce() + Send>);
}

impl Executor for TaskDaemon {
    fn execute(&self, task: Box<dyn FnOnce() + Send>) {
        TaskDaemon::execute(self, task);
    }
}
