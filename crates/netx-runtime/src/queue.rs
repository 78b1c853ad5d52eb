//! Named single-flight task queue.
//!
//! Each concern ("turnOn", "newLease", ...) owns one [`TaskQueue`] with a
//! single async handler. The queue guarantees:
//!
//! - **Sequential execution**: one worker task runs handler invocations
//!   one after another, never two at once
//! - **Coalescing**: requests arriving inside the debounce window (or while an
//!   execution is in flight) replace the pending input; only the latest input
//!   runs and every waiting caller receives that single result
//! - **Bounded time**: each attempt is cut off after `timeout`
//! - **Retry**: failed attempts are re-run up to `max_attempts` in total
//!
//! Outcomes are reported on the shared [`ActivityBus`].
//!
//! # Timeouts
//!
//! A timed-out attempt is aborted and awaited before anything else runs, so
//! executions never overlap. Side effects the handler already fired (platform
//! calls, messages) are not undone; their late results have to be filtered by
//! the caller.

use crate::event::{ActivityBus, ComponentEvent, ErrorClass, Severity};
use crate::supervisor::TaskGroup;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Notify, oneshot};
use tokio::task::{AbortHandle, JoinError};
use tokio::time::{Instant, sleep, sleep_until, timeout};
use tracing::{debug, error, warn};

/// Debounce used for queues driven by user interaction
pub const DEFAULT_USER_INTERACTION_DEBOUNCE: Duration = Duration::from_millis(300);

/// Default per-attempt timeout
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(10);

/// Boxed handler future
pub type TaskFuture<O, E> = Pin<Box<dyn Future<Output = Result<O, E>> + Send + 'static>>;

type Handler<I, O, E> = Arc<dyn Fn(I) -> TaskFuture<O, E> + Send + Sync>;
type Waiter<O, E> = oneshot::Sender<Result<O, QueueError<E>>>;

/// Error type a handler may return
pub trait TaskFailure: Clone + fmt::Display + Send + Sync + 'static {
    /// Whether this failure means something did not answer in time
    fn is_timeout(&self) -> bool {
        false
    }
}

/// Queue-level failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError<E> {
    #[error("{queue}: no handler registered")]
    NoHandler { queue: String },

    #[error("{queue}: timed out")]
    Timeout { queue: String },

    #[error("{0}")]
    Failed(E),

    #[error("{queue}: handler panicked: {message}")]
    Panicked { queue: String, message: String },

    #[error("{queue}: queue closed")]
    Closed { queue: String },
}

impl<E: TaskFailure> QueueError<E> {
    pub fn is_timeout(&self) -> bool {
        match self {
            QueueError::Timeout { .. } => true,
            QueueError::Failed(e) => e.is_timeout(),
            _ => false,
        }
    }

    fn class(&self) -> ErrorClass {
        if self.is_timeout() {
            ErrorClass::Timeout
        } else {
            ErrorClass::Failure
        }
    }
}

/// Per-queue policy
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Queue name, used to tag activity events and logs
    pub name: String,
    /// Quiet period before an idle queue dispatches
    pub debounce: Duration,
    /// Limit for a single attempt
    pub timeout: Duration,
    /// Total attempts per dispatch (at least 1)
    pub max_attempts: u32,
    /// Delay before attempt `n` is `retry_backoff * (n - 1)`
    pub retry_backoff: Duration,
    /// Severity of a terminal failure
    pub severity: Severity,
    /// How long a cached result satisfies [`TaskQueue::get`]
    pub max_age: Option<Duration>,
}

impl QueueConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            debounce: Duration::ZERO,
            timeout: DEFAULT_TASK_TIMEOUT,
            max_attempts: 1,
            retry_backoff: Duration::ZERO,
            severity: Severity::Minor,
            max_age: None,
        }
    }

    pub fn debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn retries(mut self, max_attempts: u32, backoff: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.retry_backoff = backoff;
        self
    }

    pub fn major(mut self) -> Self {
        self.severity = Severity::Major;
        self
    }

    pub fn max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }
}

struct Pending<I, O, E> {
    input: I,
    waiters: Vec<Waiter<O, E>>,
    due: Instant,
}

struct QueueState<I, O, E> {
    in_flight: bool,
    pending: Option<Pending<I, O, E>>,
    last_result: Option<(O, Instant)>,
    dispatched: u64,
    /// Handler attempt currently running
    running: Option<AbortHandle>,
    closed: bool,
}

struct Shared<I, O, E> {
    config: QueueConfig,
    state: Mutex<QueueState<I, O, E>>,
    handler: Mutex<Option<Handler<I, O, E>>>,
    wake: Notify,
    activity: ActivityBus,
}

/// Named single-flight executor
pub struct TaskQueue<I, O, E> {
    shared: Arc<Shared<I, O, E>>,
    tasks: TaskGroup,
}

impl<I, O, E> TaskQueue<I, O, E>
where
    I: Clone + Send + 'static,
    O: Clone + Send + 'static,
    E: TaskFailure,
{
    /// Create a queue reporting to `activity`
    pub fn new(config: QueueConfig, activity: ActivityBus) -> Self {
        let tasks = TaskGroup::new(format!("queue:{}", config.name));
        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(QueueState {
                    in_flight: false,
                    pending: None,
                    last_result: None,
                    dispatched: 0,
                    running: None,
                    closed: false,
                }),
                handler: Mutex::new(None),
                wake: Notify::new(),
                activity,
            }),
            tasks,
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    pub fn config(&self) -> &QueueConfig {
        &self.shared.config
    }

    /// Register the command handler and start the worker.
    ///
    /// Must be called (inside a tokio runtime) before the first `send`.
    /// Calling it again replaces the handler.
    pub fn set_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, E>> + Send + 'static,
    {
        let boxed: Handler<I, O, E> =
            Arc::new(move |input| -> TaskFuture<O, E> { Box::pin(handler(input)) });
        let first = {
            let mut slot = self.shared.handler.lock().unwrap_or_else(PoisonError::into_inner);
            let first = slot.is_none();
            *slot = Some(boxed);
            first
        };

        if first {
            let shared = self.shared.clone();
            self.tasks.spawn("worker", run_worker(shared));
        }
    }

    /// Request an execution and wait for its (possibly shared) result
    pub async fn send(&self, input: I) -> Result<O, QueueError<E>> {
        let rx = self.enqueue(input)?;
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(QueueError::Closed {
                queue: self.shared.config.name.clone(),
            }),
        }
    }

    /// Request an execution without waiting for the result
    pub fn fire(&self, input: I) {
        if let Err(e) = self.enqueue(input) {
            warn!("{}", e);
        }
    }

    /// Cached result if fresh enough, otherwise a new execution with the
    /// default input
    pub async fn get(&self) -> Result<O, QueueError<E>>
    where
        I: Default,
    {
        if let Some(cached) = self.cached() {
            debug!("{}: serving cached result", self.shared.config.name);
            return Ok(cached);
        }
        self.send(I::default()).await
    }

    /// Last successful result, unless older than `max_age`
    pub fn cached(&self) -> Option<O> {
        let state = self.shared.lock();
        let (value, at) = state.last_result.as_ref()?;
        match self.shared.config.max_age {
            Some(max_age) if at.elapsed() > max_age => None,
            _ => Some(value.clone()),
        }
    }

    /// Forget the cached result
    pub fn invalidate(&self) {
        self.shared.lock().last_result = None;
    }

    pub fn is_in_flight(&self) -> bool {
        self.shared.lock().in_flight
    }

    pub fn has_pending(&self) -> bool {
        self.shared.lock().pending.is_some()
    }

    /// Number of executions completed so far
    pub fn dispatched(&self) -> u64 {
        self.shared.lock().dispatched
    }

    /// Stop the worker and abort a running handler; pending callers
    /// receive `Closed`
    pub fn shutdown(&self) {
        self.tasks.shutdown();
        let pending = self.shared.close();
        if let Some(pending) = pending {
            let closed = QueueError::Closed {
                queue: self.shared.config.name.clone(),
            };
            for waiter in pending.waiters {
                let _ = waiter.send(Err(closed.clone()));
            }
        }
    }

    fn enqueue(&self, input: I) -> Result<oneshot::Receiver<Result<O, QueueError<E>>>, QueueError<E>> {
        let name = &self.shared.config.name;
        let has_handler = self
            .shared
            .handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some();
        if !has_handler {
            return Err(QueueError::NoHandler { queue: name.clone() });
        }

        let (tx, rx) = oneshot::channel();
        let now = Instant::now();
        {
            let mut state = self.shared.lock();
            if state.closed {
                return Err(QueueError::Closed { queue: name.clone() });
            }
            // Requests queued behind a running execution go right after it
            let due = if state.in_flight {
                now
            } else {
                now + self.shared.config.debounce
            };

            match state.pending.as_mut() {
                Some(pending) => {
                    debug!("{}: coalescing request ({} waiting)", name, pending.waiters.len() + 1);
                    pending.input = input;
                    pending.waiters.push(tx);
                    pending.due = due;
                }
                None => {
                    state.pending = Some(Pending {
                        input,
                        waiters: vec![tx],
                        due,
                    });
                }
            }
        }

        self.shared.activity.publish(ComponentEvent::ongoing(name.as_str(), true));
        self.shared.wake.notify_one();
        Ok(rx)
    }
}

impl<I, O, E> Drop for TaskQueue<I, O, E> {
    fn drop(&mut self) {
        self.tasks.shutdown();
        self.shared.close();
    }
}

impl<I, O, E> Shared<I, O, E> {
    /// Refuse new requests, abort the running attempt and hand back
    /// whatever was still pending
    fn close(&self) -> Option<Pending<I, O, E>> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.closed = true;
        if let Some(running) = state.running.take() {
            running.abort();
        }
        state.pending.take()
    }
}

impl<I, O, E> Shared<I, O, E>
where
    I: Clone + Send + 'static,
    O: Clone + Send + 'static,
    E: TaskFailure,
{
    fn lock(&self) -> MutexGuard<'_, QueueState<I, O, E>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run one dispatch including retries
    async fn execute(&self, input: I) -> Result<O, QueueError<E>> {
        let name = &self.config.name;
        let handler = self
            .handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| QueueError::NoHandler { queue: name.clone() })?;

        let attempts = self.config.max_attempts.max(1);
        let mut outcome = Err(QueueError::Closed { queue: name.clone() });

        for attempt in 1..=attempts {
            if attempt > 1 {
                warn!("{}: retrying (attempt {}/{})", name, attempt, attempts);
                let backoff = self.config.retry_backoff * (attempt - 1);
                if !backoff.is_zero() {
                    sleep(backoff).await;
                }
            }

            outcome = self.attempt(&handler, input.clone()).await;
            match &outcome {
                Ok(_) => break,
                Err(e) => debug!("{}: attempt {} failed: {}", name, attempt, e),
            }
        }

        outcome
    }

    async fn attempt(&self, handler: &Handler<I, O, E>, input: I) -> Result<O, QueueError<E>> {
        let name = &self.config.name;
        let mut task = tokio::spawn(handler(input));
        {
            let mut state = self.lock();
            if state.closed {
                task.abort();
            } else {
                state.running = Some(task.abort_handle());
            }
        }

        let outcome = match timeout(self.config.timeout, &mut task).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(e))) => Err(QueueError::Failed(e)),
            Ok(Err(join)) => Err(QueueError::Panicked {
                queue: name.clone(),
                message: panic_message(join),
            }),
            Err(_) => {
                task.abort();
                let _ = task.await;
                Err(QueueError::Timeout { queue: name.clone() })
            }
        };
        self.lock().running = None;
        outcome
    }

    fn report(&self, outcome: &Result<O, QueueError<E>>, settled: bool) {
        let name = self.config.name.as_str();
        match outcome {
            Ok(_) => {
                self.activity.publish(ComponentEvent::recovered(name));
            }
            Err(e) => {
                if self.config.severity.is_major() {
                    error!("{}: {}", name, e);
                } else {
                    warn!("{}: {}", name, e);
                }
                self.activity.publish(ComponentEvent::error(
                    name,
                    e.class(),
                    self.config.severity,
                    e.to_string(),
                ));
            }
        }

        if settled {
            self.activity.publish(ComponentEvent::ongoing(name, false));
        }
    }
}

async fn run_worker<I, O, E>(shared: Arc<Shared<I, O, E>>)
where
    I: Clone + Send + 'static,
    O: Clone + Send + 'static,
    E: TaskFailure,
{
    loop {
        let due = shared.lock().pending.as_ref().map(|p| p.due);

        match due {
            None => shared.wake.notified().await,
            Some(due) if due > Instant::now() => {
                tokio::select! {
                    _ = sleep_until(due) => {}
                    _ = shared.wake.notified() => {}
                }
            }
            Some(_) => {
                let pending = {
                    let mut state = shared.lock();
                    let pending = state.pending.take();
                    state.in_flight = pending.is_some();
                    pending
                };
                let Some(pending) = pending else { continue };

                debug!("{}: dispatching ({} waiting)", shared.config.name, pending.waiters.len());
                let outcome = shared.execute(pending.input).await;

                let settled = {
                    let mut state = shared.lock();
                    state.in_flight = false;
                    state.dispatched += 1;
                    if let Ok(value) = &outcome {
                        state.last_result = Some((value.clone(), Instant::now()));
                    }
                    state.pending.is_none()
                };

                shared.report(&outcome, settled);
                for waiter in pending.waiters {
                    let _ = waiter.send(outcome.clone());
                }
            }
        }
    }
}

fn panic_message(join: JoinError) -> String {
    if join.is_cancelled() {
        return "cancelled".to_string();
    }

    let payload = join.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    enum TestError {
        #[error("boom")]
        Boom,
        #[error("too slow")]
        Slow,
    }

    impl TaskFailure for TestError {
        fn is_timeout(&self) -> bool {
            matches!(self, TestError::Slow)
        }
    }

    type EchoQueue = TaskQueue<String, String, TestError>;

    fn echo_queue(debounce: Duration, calls: Arc<AtomicUsize>) -> (EchoQueue, ActivityBus) {
        let activity = ActivityBus::stream();
        let queue = TaskQueue::new(QueueConfig::new("Q").debounce(debounce), activity.clone());
        queue.set_handler(move |input: String| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, TestError>(input)
            }
        });
        (queue, activity)
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_coalesces_to_latest_input() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (queue, _activity) = echo_queue(Duration::from_millis(500), calls.clone());

        let (a, b) = tokio::join!(queue.send("A".into()), async {
            sleep(Duration::from_millis(100)).await;
            queue.send("B".into()).await
        });

        assert_eq!(a.unwrap(), "B");
        assert_eq!(b.unwrap(), "B");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_execution() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (queue, _activity) = echo_queue(Duration::from_millis(300), calls.clone());

        let (r1, r2, r3, r4) = tokio::join!(
            queue.send("x".into()),
            queue.send("x".into()),
            queue.send("x".into()),
            queue.send("x".into()),
        );

        for r in [r1, r2, r3, r4] {
            assert_eq!(r.unwrap(), "x");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(queue.dispatched(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_requests_during_execution_run_after_it() {
        let calls = Arc::new(AtomicUsize::new(0));
        let activity = ActivityBus::stream();
        let queue: EchoQueue = TaskQueue::new(QueueConfig::new("slow"), activity);
        let counter = calls.clone();
        queue.set_handler(move |input: String| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                sleep(Duration::from_secs(1)).await;
                Ok(input)
            }
        });

        let (a, b, c) = tokio::join!(
            queue.send("A".into()),
            async {
                sleep(Duration::from_millis(10)).await;
                queue.send("B".into()).await
            },
            async {
                sleep(Duration::from_millis(20)).await;
                queue.send("C".into()).await
            },
        );

        assert_eq!(a.unwrap(), "A");
        assert_eq!(b.unwrap(), "C");
        assert_eq!(c.unwrap(), "C");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_executions_never_overlap() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let queue: Arc<TaskQueue<u32, u32, TestError>> =
            Arc::new(TaskQueue::new(QueueConfig::new("serial"), ActivityBus::stream()));

        let (a, p) = (active.clone(), peak.clone());
        queue.set_handler(move |n: u32| {
            let (active, peak) = (a.clone(), p.clone());
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                sleep(Duration::from_millis(50)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(n)
            }
        });

        let mut sends = tokio::task::JoinSet::new();
        for n in 0..10u32 {
            let queue = queue.clone();
            sends.spawn(async move {
                sleep(Duration::from_millis(n as u64 * 20)).await;
                queue.send(n).await
            });
        }
        while let Some(result) = sends.join_next().await {
            assert!(result.unwrap().is_ok());
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_reports_error_then_settles() {
        let activity = ActivityBus::stream();
        let mut events = activity.subscribe();
        let queue: EchoQueue = TaskQueue::new(
            QueueConfig::new("stuck").timeout(Duration::from_secs(2)).major(),
            activity,
        );
        queue.set_handler(|input: String| async move {
            sleep(Duration::from_secs(60)).await;
            Ok(input)
        });

        let result = queue.send("x".into()).await;
        assert!(matches!(result, Err(QueueError::Timeout { .. })));
        assert!(!queue.is_in_flight());

        let kinds: Vec<EventKind> = events.drain().into_iter().map(|e| e.kind).collect();
        assert_eq!(kinds.first(), Some(&EventKind::Ongoing(true)));
        assert!(matches!(
            kinds.get(1),
            Some(EventKind::Error { major: true, class: ErrorClass::Timeout, .. })
        ));
        assert_eq!(kinds.last(), Some(&EventKind::Ongoing(false)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_surfaces_final_outcome() {
        let calls = Arc::new(AtomicUsize::new(0));
        let queue: EchoQueue = TaskQueue::new(
            QueueConfig::new("flaky").retries(2, Duration::from_millis(100)),
            ActivityBus::stream(),
        );
        let counter = calls.clone();
        queue.set_handler(move |input: String| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(TestError::Boom)
                } else {
                    Ok(input)
                }
            }
        });

        assert_eq!(queue.send("ok".into()).await.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_exhausted() {
        let calls = Arc::new(AtomicUsize::new(0));
        let queue: EchoQueue = TaskQueue::new(
            QueueConfig::new("broken").retries(3, Duration::ZERO),
            ActivityBus::stream(),
        );
        let counter = calls.clone();
        queue.set_handler(move |_: String| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<String, _>(TestError::Boom)
            }
        });

        let result = queue.send("x".into()).await;
        assert_eq!(result, Err(QueueError::Failed(TestError::Boom)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_timeout_error_is_classified() {
        let activity = ActivityBus::stream();
        let mut events = activity.subscribe();
        let queue: EchoQueue = TaskQueue::new(QueueConfig::new("api"), activity);
        queue.set_handler(|_: String| async { Err::<String, _>(TestError::Slow) });

        let result = queue.send("x".into()).await;
        assert!(result.unwrap_err().is_timeout());
        assert!(events.drain().iter().any(|e| e.is_timeout()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_serves_cached_result() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (queue, _activity) = echo_queue(Duration::ZERO, calls.clone());

        assert_eq!(queue.get().await.unwrap(), "");
        assert_eq!(queue.get().await.unwrap(), "");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        queue.invalidate();
        queue.get().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_refreshes_stale_result() {
        let calls = Arc::new(AtomicUsize::new(0));
        let queue: EchoQueue = TaskQueue::new(
            QueueConfig::new("fresh").max_age(Duration::from_secs(5)),
            ActivityBus::stream(),
        );
        let counter = calls.clone();
        queue.set_handler(move |input: String| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(input)
            }
        });

        queue.get().await.unwrap();
        sleep(Duration::from_secs(6)).await;
        queue.get().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_panicking_handler_does_not_break_queue() {
        let queue: EchoQueue = TaskQueue::new(QueueConfig::new("panicky"), ActivityBus::stream());
        queue.set_handler(|input: String| async move {
            if input == "panic" {
                panic!("handler exploded");
            }
            Ok(input)
        });

        let result = queue.send("panic".into()).await;
        assert!(matches!(result, Err(QueueError::Panicked { ref message, .. }) if message == "handler exploded"));
        assert_eq!(queue.send("fine".into()).await.unwrap(), "fine");
    }

    #[tokio::test]
    async fn test_send_without_handler() {
        let queue: EchoQueue = TaskQueue::new(QueueConfig::new("empty"), ActivityBus::stream());
        assert!(matches!(
            queue.send("x".into()).await,
            Err(QueueError::NoHandler { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_aborts_running_handler() {
        let finished = Arc::new(AtomicUsize::new(0));
        let queue: EchoQueue = TaskQueue::new(QueueConfig::new("slow"), ActivityBus::stream());
        let done = finished.clone();
        queue.set_handler(move |input: String| {
            let done = done.clone();
            async move {
                sleep(Duration::from_secs(5)).await;
                done.fetch_add(1, Ordering::SeqCst);
                Ok::<_, TestError>(input)
            }
        });

        queue.fire("slow".into());
        sleep(Duration::from_secs(1)).await;
        assert!(queue.is_in_flight());

        queue.shutdown();
        assert!(matches!(
            queue.send("late".into()).await,
            Err(QueueError::Closed { .. })
        ));
        drop(queue);

        sleep(Duration::from_secs(10)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }
}
