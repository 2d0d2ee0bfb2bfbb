use std::{sync::Arc, time::Duration};

use super::{BoxedJob, FutureTask, TaskFuture, ThreadPoolExecutor};
use crate::{
    deadline::Deadline,
    error::SyncError,
    queue::{BlockingQueue, LinkedBlockingQueue},
};

/// Lifecycle and submission surface shared by the executors.
pub trait ExecutorService {
    /// What `shutdown_now` hands back for jobs that never ran.
    type Pending;

    fn execute_boxed(&self, job: BoxedJob) -> Result<(), SyncError>;

    fn shutdown(&self);

    fn shutdown_now(&self) -> Vec<Self::Pending>;

    fn is_shutdown(&self) -> bool;

    fn is_terminated(&self) -> bool;

    fn await_termination(&self, timeout: Duration) -> Result<bool, SyncError>;

    fn execute<F>(&self, f: F) -> Result<(), SyncError>
    where
        Self: Sized,
        F: FnOnce() + Send + 'static,
    {
        self.execute_boxed(BoxedJob::new(f))
    }

    fn submit<R, F>(&self, f: F) -> Result<TaskFuture<R>, SyncError>
    where
        Self: Sized,
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (task, future) = FutureTask::new(f);
        self.execute_boxed(BoxedJob::new(task))?;
        Ok(future)
    }

    /// Runs `f` and completes the future with `value`.
    fn submit_value<R, F>(&self, f: F, value: R) -> Result<TaskFuture<R>, SyncError>
    where
        Self: Sized,
        F: FnOnce() + Send + 'static,
        R: Send + 'static,
    {
        self.submit(move || {
            f();
            value
        })
    }

    /// Runs every task and waits for all of them. Failed tasks report
    /// through their own future. Interruption cancels whatever is left.
    fn invoke_all<R, F>(&self, tasks: Vec<F>) -> Result<Vec<TaskFuture<R>>, SyncError>
    where
        Self: Sized,
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        invoke_all_until(self, tasks, Deadline::never())
    }

    /// Like [`invoke_all`](Self::invoke_all), cancelling the tasks still
    /// unfinished once `timeout` elapses.
    fn invoke_all_timeout<R, F>(
        &self,
        tasks: Vec<F>,
        timeout: Duration,
    ) -> Result<Vec<TaskFuture<R>>, SyncError>
    where
        Self: Sized,
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        invoke_all_until(self, tasks, Deadline::after(timeout))
    }

    /// Returns the result of the first task to succeed and cancels the
    /// others. Fails with the last task's error if none succeeds.
    fn invoke_any<R, F>(&self, tasks: Vec<F>) -> Result<R, SyncError>
    where
        Self: Sized,
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        invoke_any_until(self, tasks, Deadline::never())
    }

    fn invoke_any_timeout<R, F>(&self, tasks: Vec<F>, timeout: Duration) -> Result<R, SyncError>
    where
        Self: Sized,
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        invoke_any_until(self, tasks, Deadline::after(timeout))
    }
}

fn cancel_all<R>(futures: &[TaskFuture<R>]) {
    for future in futures {
        future.cancel(true);
    }
}

fn invoke_all_until<E, R, F>(
    executor: &E,
    tasks: Vec<F>,
    deadline: Deadline,
) -> Result<Vec<TaskFuture<R>>, SyncError>
where
    E: ExecutorService,
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    let mut futures = Vec::with_capacity(tasks.len());
    for task in tasks {
        match executor.submit(task) {
            Ok(future) => futures.push(future),
            Err(err) => {
                cancel_all(&futures);
                return Err(err);
            }
        }
    }

    for future in &futures {
        let finished = match deadline.remaining() {
            None => future.wait().map(|_| true),
            Some(left) => future.wait_timeout(left),
        };
        match finished {
            Ok(true) => {}
            Ok(false) => {
                cancel_all(&futures);
                break;
            }
            Err(err) => {
                cancel_all(&futures);
                return Err(err);
            }
        }
    }
    Ok(futures)
}

/// Reports its slot to the completion queue even if the task panics.
struct Completion {
    index: usize,
    done: Arc<LinkedBlockingQueue<usize>>,
}

impl Drop for Completion {
    fn drop(&mut self) {
        let _ = self.done.offer(self.index);
    }
}

fn invoke_any_until<E, R, F>(executor: &E, tasks: Vec<F>, deadline: Deadline) -> Result<R, SyncError>
where
    E: ExecutorService,
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    if tasks.is_empty() {
        return Err(SyncError::IllegalArgument("no tasks to invoke"));
    }

    let done = Arc::new(LinkedBlockingQueue::new());
    let mut futures = Vec::with_capacity(tasks.len());
    for (index, task) in tasks.into_iter().enumerate() {
        let completion = Completion {
            index,
            done: done.clone(),
        };
        let submitted = executor.submit(move || {
            let _completion = completion;
            task()
        });
        match submitted {
            Ok(future) => futures.push(Some(future)),
            Err(err) => {
                cancel_all(&futures.into_iter().flatten().collect::<Vec<_>>());
                return Err(err);
            }
        }
    }

    let mut last_error = SyncError::ExecutionFailed("no task completed".to_owned());
    let mut remaining = futures.len();
    let outcome = loop {
        if remaining == 0 {
            break Err(last_error);
        }
        let next = match deadline.remaining() {
            None => done.take().map(Some),
            Some(left) => done.poll_timeout(left),
        };
        let index = match next {
            Ok(Some(index)) => index,
            Ok(None) => break Err(SyncError::Timeout),
            Err(err) => break Err(err),
        };
        remaining -= 1;

        let Some(future) = futures[index].take() else {
            continue;
        };
        match future.join() {
            Ok(value) => break Ok(value),
            Err(err) => last_error = err,
        }
    };

    cancel_all(&futures.into_iter().flatten().collect::<Vec<_>>());
    outcome
}

impl ExecutorService for ThreadPoolExecutor<BoxedJob> {
    type Pending = BoxedJob;

    fn execute_boxed(&self, job: BoxedJob) -> Result<(), SyncError> {
        self.execute_job(job)
    }

    fn shutdown(&self) {
        ThreadPoolExecutor::shutdown(self)
    }

    fn shutdown_now(&self) -> Vec<BoxedJob> {
        ThreadPoolExecutor::shutdown_now(self)
    }

    fn is_shutdown(&self) -> bool {
        ThreadPoolExecutor::is_shutdown(self)
    }

    fn is_terminated(&self) -> bool {
        ThreadPoolExecutor::is_terminated(self)
    }

    fn await_termination(&self, timeout: Duration) -> Result<bool, SyncError> {
        ThreadPoolExecutor::await_termination(self, timeout)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering::*},
        thread::sleep,
    };

    use super::*;
    use crate::{
        locks::CountDownLatch,
        testing::{LONG_DELAY, MEDIUM_DELAY, SHORT_DELAY},
    };

    fn pool() -> ThreadPoolExecutor {
        ThreadPoolExecutor::fixed(2).unwrap()
    }

    #[test]
    fn submit_returns_result() {
        let pool = pool();
        let future = pool.submit(|| 6 * 7).unwrap();
        assert_eq!(future.get_timeout(LONG_DELAY), Ok(42));
        assert!(future.is_done());
        assert_eq!(future.join(), Ok(42));

        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        let bump = move || {
            counter.fetch_add(1, SeqCst);
        };
        let future = pool.submit_value(bump, "done").unwrap();
        assert_eq!(future.get(), Ok("done"));
        assert_eq!(ran.load(SeqCst), 1);
    }

    #[test]
    fn panicking_task_surfaces_as_execution_failure() {
        let pool = pool();
        let future = pool.submit(|| -> i32 { panic!("bad task") }).unwrap();
        assert_eq!(future.get(), Err(SyncError::ExecutionFailed("bad task".to_owned())));
    }

    #[test]
    fn invoke_all_waits_for_every_task() {
        let pool = pool();
        let tasks = (0..5).map(|i| move || i * 10).collect::<Vec<_>>();
        let futures = pool.invoke_all(tasks).unwrap();
        assert_eq!(futures.len(), 5);
        for (i, future) in futures.into_iter().enumerate() {
            assert!(future.is_done());
            assert_eq!(future.join(), Ok(i * 10));
        }
    }

    #[test]
    fn invoke_all_timeout_cancels_stragglers() {
        let pool = pool();
        let tasks: Vec<Box<dyn FnOnce() -> u32 + Send>> = vec![
            Box::new(|| 1),
            Box::new(|| {
                sleep(MEDIUM_DELAY * 5);
                2
            }),
        ];
        let futures = pool.invoke_all_timeout(tasks, MEDIUM_DELAY).unwrap();
        assert_eq!(futures[0].get(), Ok(1));
        assert!(futures[1].is_cancelled());
        assert_eq!(futures[1].get(), Err(SyncError::Cancelled));
    }

    #[test]
    fn invoke_any_returns_first_success() {
        let pool = pool();
        let tasks: Vec<Box<dyn FnOnce() -> &'static str + Send>> = vec![
            Box::new(|| -> &'static str { panic!("first fails") }),
            Box::new(|| "second"),
        ];
        assert_eq!(pool.invoke_any(tasks), Ok("second"));
    }

    #[test]
    fn invoke_any_reports_last_failure() {
        let pool = pool();
        let tasks: Vec<Box<dyn FnOnce() -> u8 + Send>> =
            vec![Box::new(|| -> u8 { panic!("nope") }), Box::new(|| -> u8 { panic!("nope") })];
        assert_eq!(
            pool.invoke_any(tasks),
            Err(SyncError::ExecutionFailed("nope".to_owned()))
        );

        let none: Vec<fn() -> u8> = Vec::new();
        assert!(matches!(pool.invoke_any(none), Err(SyncError::IllegalArgument(_))));
    }

    #[test]
    fn invoke_any_timeout_expires() {
        let pool = pool();
        let gate = Arc::new(CountDownLatch::new(1));
        let blocker = gate.clone();
        let tasks = vec![move || {
            let _ = blocker.wait_timeout(LONG_DELAY);
            0
        }];
        assert_eq!(pool.invoke_any_timeout(tasks, SHORT_DELAY), Err(SyncError::Timeout));
        gate.count_down();
    }
}
