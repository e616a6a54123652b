use std::any::Any;
use std::fmt::Debug;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinSet};
use tokio::time::Instant;

use crate::action_sender::{ActionSender, AnyActionSender};
use crate::cancellation::{CancellationRegistry, CancellationToken, GuardedSender};
use crate::effect::{Effect, EffectValue, SubscriptionSetup};
use crate::error::EffectFailure;

pub(crate) type FailureHandler = Arc<dyn Fn(EffectFailure) + Send + Sync>;

/// Interprets effects for one driver.
///
/// Actions produced by effects go to `sink`. Keyed bookkeeping lives in a
/// registry private to this runner, so two stores never cancel each other.
pub(crate) struct EffectRunner<Action: Send + 'static> {
    sink: AnyActionSender<Action>,
    handle: Handle,
    registry: CancellationRegistry,
    tasks: Arc<Mutex<JoinSet<()>>>,
    in_flight: Arc<watch::Sender<usize>>,
    on_failure: FailureHandler,
}

impl<Action: Send + 'static> Clone for EffectRunner<Action> {
    fn clone(&self) -> Self {
        Self {
            sink: self.sink.clone(),
            handle: self.handle.clone(),
            registry: self.registry.clone(),
            tasks: self.tasks.clone(),
            in_flight: self.in_flight.clone(),
            on_failure: self.on_failure.clone(),
        }
    }
}

impl<Action> EffectRunner<Action>
where
    Action: Debug + Send + 'static,
{
    /// Must be called from within a tokio runtime; jobs are spawned on it.
    pub fn new(sink: AnyActionSender<Action>, on_failure: FailureHandler) -> Self {
        let (in_flight, _) = watch::channel(0);
        Self {
            sink,
            handle: Handle::current(),
            registry: CancellationRegistry::default(),
            tasks: Arc::new(Mutex::new(JoinSet::new())),
            in_flight: Arc::new(in_flight),
            on_failure,
        }
    }

    pub fn in_flight(&self) -> watch::Receiver<usize> {
        self.in_flight.subscribe()
    }

    pub fn in_flight_count(&self) -> usize {
        *self.in_flight.borrow()
    }

    pub fn has_subscriptions(&self) -> bool {
        self.registry.has_subscriptions()
    }

    pub fn execute(&self, effect: Effect<Action>) {
        if self.registry.is_torn_down() {
            log::trace!("Ignoring {:?} after teardown", effect.value);
            return;
        }
        log::debug!("Handling {:#?}", effect.value);

        match effect.value {
            EffectValue::None => {}
            EffectValue::Send(action) => self.sink.send(action),
            EffectValue::Run(job) => {
                let sender = self.guarded(self.registry.lifetime_token());
                self.spawn(job(sender));
            }
            EffectValue::Batch(effects) => {
                for effect in effects {
                    self.execute(effect);
                }
            }
            EffectValue::Cancellable { id, job } => {
                let sender = self.guarded(self.start(&id));
                self.spawn(job(sender));
            }
            EffectValue::Debounced { id, delay, job } => {
                let token = self.start(&id);
                let sender = self.guarded(token.clone());
                let runner = self.clone();
                let fired = token.clone();
                let timer = self.spawn(async move {
                    tokio::time::sleep(delay).await;
                    runner.registry.disarm_timer(&fired);
                    if fired.is_current() {
                        runner.spawn(job(sender));
                    }
                    Ok(())
                });
                self.registry.arm_timer(&token, timer);
            }
            EffectValue::Throttled { id, interval, job } => {
                if self.registry.try_throttle(&id, interval, Instant::now()) {
                    let sender = self.guarded(self.start(&id));
                    self.spawn(job(sender));
                } else {
                    log::trace!("Throttled effect {} inside its window", id);
                }
            }
            EffectValue::AfterDelay { delay, job } => {
                let sender = self.guarded(self.registry.lifetime_token());
                self.spawn(async move {
                    tokio::time::sleep(delay).await;
                    job(sender);
                    Ok(())
                });
            }
            EffectValue::FireAndForget(job) => {
                self.spawn(job());
            }
            EffectValue::Subscription { id, setup } => self.subscribe(&id, setup),
            EffectValue::Cancel(id) => {
                if let Some(cleanup) = self.registry.cancel(&id) {
                    self.contain(cleanup);
                }
            }
        }
    }

    /// Expires every sender, runs subscription cleanups and aborts whatever
    /// is still running. Later effects are ignored.
    pub fn tear_down(&self) {
        for cleanup in self.registry.tear_down() {
            self.contain(cleanup);
        }
        self.tasks.lock().abort_all();
    }

    fn start(&self, id: &str) -> CancellationToken {
        let (token, superseded) = self.registry.start(id);
        if let Some(cleanup) = superseded {
            self.contain(cleanup);
        }
        token
    }

    fn subscribe(&self, id: &str, setup: SubscriptionSetup<Action>) {
        let token = self.start(id);
        let sender = self.guarded(token.clone());
        let Some(cleanup) = self.contain(move || setup(sender)) else {
            return;
        };
        if let Some(stale) = self.registry.attach_cleanup(&token, cleanup) {
            self.contain(stale);
        }
    }

    /// Runs synchronous effect code (subscription setup, cleanups) so that a
    /// panic is reported like any other effect failure instead of unwinding
    /// into the driver.
    fn contain<R>(&self, work: impl FnOnce() -> R) -> Option<R> {
        match std::panic::catch_unwind(AssertUnwindSafe(work)) {
            Ok(value) => Some(value),
            Err(panic) => {
                (self.on_failure)(EffectFailure::Panicked(panic_message(panic)));
                None
            }
        }
    }

    fn guarded(&self, token: CancellationToken) -> AnyActionSender<Action> {
        AnyActionSender::new(Box::new(GuardedSender::new(self.sink.clone(), token)))
    }

    fn spawn<Fut>(&self, job: Fut) -> AbortHandle
    where
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let guard = InFlight::enter(self.in_flight.clone());
        let on_failure = self.on_failure.clone();
        let task = async move {
            let _guard = guard;
            match AssertUnwindSafe(job).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => on_failure(EffectFailure::Failed(error)),
                Err(panic) => on_failure(EffectFailure::Panicked(panic_message(panic))),
            }
        };

        let mut tasks = self.tasks.lock();
        while tasks.try_join_next().is_some() {}
        tasks.spawn_on(task, &self.handle)
    }
}

struct InFlight(Arc<watch::Sender<usize>>);

impl InFlight {
    fn enter(counter: Arc<watch::Sender<usize>>) -> Self {
        counter.send_modify(|count| *count += 1);
        Self(counter)
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.send_modify(|count| *count = count.saturating_sub(1));
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    enum Action {
        Finished(&'static str),
        Tick(u32),
    }

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<Action>>,
    }

    impl ActionSender for Recorder {
        type SendableAction = Action;

        fn send(&self, action: Action) {
            self.sent.lock().push(action);
        }
    }

    struct Harness {
        runner: EffectRunner<Action>,
        recorder: Arc<Recorder>,
        failures: Arc<Mutex<Vec<String>>>,
    }

    fn harness() -> Harness {
        let _ = env_logger::builder().is_test(true).try_init();
        let recorder = Arc::new(Recorder::default());
        let failures = Arc::new(Mutex::new(Vec::new()));
        let sink = failures.clone();
        let runner = EffectRunner::new(
            AnyActionSender::new(Box::new(recorder.clone())),
            Arc::new(move |failure: EffectFailure| sink.lock().push(failure.to_string())),
        );
        Harness {
            runner,
            recorder,
            failures,
        }
    }

    impl Harness {
        fn sent(&self) -> Vec<Action> {
            self.recorder.sent.lock().clone()
        }

        async fn settle(&self) {
            let mut in_flight = self.runner.in_flight();
            in_flight.wait_for(|count| *count == 0).await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_newer_cancellable_revokes_older() {
        let h = harness();
        h.runner.execute(Effect::cancellable("load", |sender| async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            sender.send(Action::Finished("first"));
        }));
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.runner.execute(Effect::cancellable("load", |sender| async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            sender.send(Action::Finished("second"));
        }));

        h.settle().await;
        assert_eq!(h.sent(), vec![Action::Finished("second")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_job_sees_inactive_sender() {
        let h = harness();
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        h.runner.execute(Effect::cancellable("poll", |sender| async move {
            let mut n = 0;
            while sender.is_active() {
                n += 1;
                counter.fetch_add(1, Ordering::SeqCst);
                sender.send(Action::Tick(n));
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }));
        tokio::time::sleep(Duration::from_millis(35)).await;
        h.runner.execute(Effect::cancel("poll"));

        h.settle().await;
        assert_eq!(ticks.load(Ordering::SeqCst), 4);
        assert_eq!(h.sent().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_runs_only_last_call() {
        let h = harness();
        let runs = Arc::new(AtomicUsize::new(0));
        let start = Instant::now();

        for label in ["a", "b", "c"] {
            let runs = runs.clone();
            h.runner.execute(Effect::debounced(
                "query",
                Duration::from_millis(300),
                move |sender| async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    sender.send(Action::Finished(label));
                },
            ));
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        h.settle().await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(h.sent(), vec![Action::Finished("c")]);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(400) && elapsed < Duration::from_millis(410));
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_drops_calls_inside_window() {
        let h = harness();
        let fired_at = Arc::new(Mutex::new(Vec::new()));
        let start = Instant::now();

        for (index, wait) in [0u64, 40, 40, 40, 100].into_iter().enumerate() {
            tokio::time::sleep(Duration::from_millis(wait)).await;
            let fired_at = fired_at.clone();
            h.runner.execute(Effect::throttled(
                "scroll",
                Duration::from_millis(100),
                move |sender| async move {
                    fired_at.lock().push(start.elapsed());
                    sender.send(Action::Tick(index as u32));
                },
            ));
        }

        h.settle().await;
        assert_eq!(h.sent(), vec![Action::Tick(0), Action::Tick(3), Action::Tick(4)]);
        let fired_at = fired_at.lock();
        for pair in fired_at.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(100));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_after_delay_and_batch() {
        let h = harness();
        h.runner.execute(Effect::batch(vec![
            Effect::after_delay(Duration::from_secs(5), |sender| {
                sender.send(Action::Finished("late"))
            }),
            Effect::run(|sender| async move { sender.send(Action::Finished("now")) }),
            Effect::send(Action::Tick(0)),
        ]));

        assert_eq!(h.runner.in_flight_count(), 2);
        h.settle().await;
        let sent = h.sent();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0], Action::Tick(0));
        assert_eq!(sent[2], Action::Finished("late"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_are_reported_and_isolated() {
        let h = harness();
        h.runner.execute(Effect::batch(vec![
            Effect::run(|_| async { Err::<(), _>(anyhow::anyhow!("network down")) }),
            Effect::fire_and_forget(|| async {
                let () = panic!("boom");
                #[allow(unreachable_code)]
                ()
            }),
            Effect::run(|sender| async move { sender.send(Action::Finished("ok")) }),
        ]));

        h.settle().await;
        assert_eq!(h.sent(), vec![Action::Finished("ok")]);
        let failures = h.failures.lock();
        assert_eq!(failures.len(), 2);
        assert!(failures.iter().any(|f| f.contains("network down")));
        assert!(failures.iter().any(|f| f.contains("boom")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscription_cleanup_runs_once() {
        let h = harness();
        let cleanups = Arc::new(AtomicUsize::new(0));

        let subscribe = |cleanups: Arc<AtomicUsize>, tick: u32| {
            Effect::<Action>::subscription("clock", move |sender| {
                sender.send(Action::Tick(tick));
                move || {
                    cleanups.fetch_add(1, Ordering::SeqCst);
                }
            })
        };

        h.runner.execute(subscribe(cleanups.clone(), 1));
        assert!(h.runner.has_subscriptions());
        h.runner.execute(subscribe(cleanups.clone(), 2));
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);

        h.runner.tear_down();
        h.runner.tear_down();
        assert_eq!(cleanups.load(Ordering::SeqCst), 2);
        assert_eq!(h.sent(), vec![Action::Tick(1), Action::Tick(2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_subscription_code_is_contained() {
        let h = harness();
        h.runner.execute(Effect::batch(vec![
            Effect::subscription("clock", |_: AnyActionSender<Action>| -> fn() {
                panic!("setup bug")
            }),
            Effect::run(|sender| async move { sender.send(Action::Finished("sibling")) }),
            Effect::subscription("feed", |_: AnyActionSender<Action>| {
                || {
                    let () = panic!("cleanup bug");
                }
            }),
        ]));
        assert!(h.runner.has_subscriptions());

        h.runner.execute(Effect::cancel("feed"));
        assert!(!h.runner.has_subscriptions());
        h.settle().await;

        assert_eq!(h.sent(), vec![Action::Finished("sibling")]);
        let failures = h.failures.lock();
        assert_eq!(failures.len(), 2);
        assert!(failures[0].contains("setup bug"));
        assert!(failures[1].contains("cleanup bug"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tear_down_silences_running_effects() {
        let h = harness();
        h.runner.execute(Effect::after_delay(Duration::from_millis(100), |sender| {
            sender.send(Action::Finished("never"))
        }));
        h.runner.tear_down();
        h.runner.execute(Effect::send(Action::Tick(1)));

        h.settle().await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(h.sent().is_empty());
    }
}
