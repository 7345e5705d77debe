//! Process-wide scheduler for delayed reconnects and asynchronous closes.

use lazy_static::lazy_static;
use std::future::Future;
use std::time::Duration;
use tokio::runtime::Runtime;
use tracing::trace;

use crate::observability::events;

const COMPONENT: &str = "scheduler";
const SCHEDULER_RUNTIME_THREADS: usize = 2;
const SCHEDULER_THREAD_NAME: &str = "topic-engine-scheduler";

lazy_static! {
    static ref SCHEDULER_RUNTIME: Option<Runtime> = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(SCHEDULER_RUNTIME_THREADS)
        .thread_name(SCHEDULER_THREAD_NAME)
        .enable_all()
        .build()
        .ok();
}

/// Runs `future` on the shared scheduler, falling back to a plain thread when the
/// scheduler runtime could not be built.
pub(crate) fn spawn<Fut>(future: Fut)
where
    Fut: Future<Output = ()> + Send + 'static,
{
    match SCHEDULER_RUNTIME.as_ref() {
        Some(runtime) => drop(runtime.spawn(future)),
        None => {
            let _ = std::thread::Builder::new()
                .name(SCHEDULER_THREAD_NAME.to_string())
                .spawn(move || {
                    if let Ok(runtime) = tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                    {
                        runtime.block_on(future);
                    }
                });
        }
    }
}

/// Runs `future` on the shared scheduler after `delay`.
pub(crate) fn schedule<Fut>(delay: Duration, future: Fut)
where
    Fut: Future<Output = ()> + Send + 'static,
{
    trace!(
        event = events::SCHEDULER_TASK_SCHEDULED,
        component = COMPONENT,
        delay_ms = delay.as_millis() as u64,
        "task scheduled"
    );
    spawn(async move {
        tokio::time::sleep(delay).await;
        future.await;
    });
}
