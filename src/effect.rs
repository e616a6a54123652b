use crate::action_mapper::ActionMapper;
use crate::action_sender::AnyActionSender;
use std::fmt::Debug;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Declarative description of work a reducer wants done after it returns.
///
/// Effects are inert: constructing one performs nothing. A driver
/// ([`crate::Store`] or [`crate::TestStore`]) interprets the value and feeds
/// whatever actions the work produces back into the reducer.
pub struct Effect<Action: Send + 'static> {
    pub value: EffectValue<Action>,
}

/// Key naming a family of mutually exclusive effects within one driver.
pub type EffectId = String;

pub type JobFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

pub type AsyncActionJob<Action> = Box<dyn FnOnce(AnyActionSender<Action>) -> JobFuture + Send>;

pub type DelayedJob<Action> = Box<dyn FnOnce(AnyActionSender<Action>) + Send>;

pub type FireAndForgetJob = Box<dyn FnOnce() -> JobFuture + Send>;

pub type Cleanup = Box<dyn FnOnce() + Send>;

pub type SubscriptionSetup<Action> = Box<dyn FnOnce(AnyActionSender<Action>) -> Cleanup + Send>;

type SharedMap<Action, MappedAction> = Arc<dyn Fn(Action) -> MappedAction + Send + Sync>;

pub enum EffectValue<Action: Send + 'static> {
    None,
    Send(Action),
    Run(AsyncActionJob<Action>),
    Batch(Vec<Effect<Action>>),
    Cancellable {
        id: EffectId,
        job: AsyncActionJob<Action>,
    },
    Debounced {
        id: EffectId,
        delay: Duration,
        job: AsyncActionJob<Action>,
    },
    Throttled {
        id: EffectId,
        interval: Duration,
        job: AsyncActionJob<Action>,
    },
    AfterDelay {
        delay: Duration,
        job: DelayedJob<Action>,
    },
    FireAndForget(FireAndForgetJob),
    Subscription {
        id: EffectId,
        setup: SubscriptionSetup<Action>,
    },
    Cancel(EffectId),
}

/// Result of an async effect job.
///
/// Jobs may finish with `()` or with `anyhow::Result<()>`. An error is not
/// turned into an action; reducers that care about failures must catch them
/// inside the job and send an explicit failure action.
pub trait JobOutcome {
    fn into_result(self) -> anyhow::Result<()>;
}

impl JobOutcome for () {
    fn into_result(self) -> anyhow::Result<()> {
        Ok(())
    }
}

impl<E> JobOutcome for Result<(), E>
where
    E: Into<anyhow::Error>,
{
    fn into_result(self) -> anyhow::Result<()> {
        self.map_err(Into::into)
    }
}

fn box_job<Action, T, Fut>(job: T) -> AsyncActionJob<Action>
where
    Action: Send + 'static,
    Fut: Future + Send + 'static,
    Fut::Output: JobOutcome,
    T: FnOnce(AnyActionSender<Action>) -> Fut + Send + 'static,
{
    Box::new(move |sender: AnyActionSender<Action>| -> JobFuture {
        let fut = job(sender);
        Box::pin(async move { fut.await.into_result() })
    })
}

fn map_sender<Action, MappedAction>(
    sender: AnyActionSender<MappedAction>,
    map: SharedMap<Action, MappedAction>,
) -> AnyActionSender<Action>
where
    Action: Send + 'static,
    MappedAction: Send + 'static,
{
    let mapper = ActionMapper::new(Box::new(sender), map);
    AnyActionSender::new(Box::new(mapper))
}

fn map_job<Action, MappedAction>(
    job: AsyncActionJob<Action>,
    map: SharedMap<Action, MappedAction>,
) -> AsyncActionJob<MappedAction>
where
    Action: Send + 'static,
    MappedAction: Send + 'static,
{
    Box::new(move |sender: AnyActionSender<MappedAction>| job(map_sender(sender, map)))
}

impl<Action> Effect<Action>
where
    Action: Send + 'static,
{
    /// Rewrites every action this effect will eventually send through `map`.
    ///
    /// This is how a child feature's effects are re-addressed to its parent.
    pub fn map<F, MappedAction>(self, map: F) -> Effect<MappedAction>
    where
        MappedAction: Send + 'static,
        F: Fn(Action) -> MappedAction + Send + Sync + 'static,
    {
        self.map_shared(Arc::new(map))
    }

    fn map_shared<MappedAction>(self, map: SharedMap<Action, MappedAction>) -> Effect<MappedAction>
    where
        MappedAction: Send + 'static,
    {
        let value = match self.value {
            EffectValue::None => EffectValue::None,
            EffectValue::Send(action) => EffectValue::Send(map(action)),
            EffectValue::Run(job) => EffectValue::Run(map_job(job, map)),
            EffectValue::Batch(effects) => EffectValue::Batch(
                effects
                    .into_iter()
                    .map(|effect| effect.map_shared(map.clone()))
                    .collect(),
            ),
            EffectValue::Cancellable { id, job } => EffectValue::Cancellable {
                id,
                job: map_job(job, map),
            },
            EffectValue::Debounced { id, delay, job } => EffectValue::Debounced {
                id,
                delay,
                job: map_job(job, map),
            },
            EffectValue::Throttled { id, interval, job } => EffectValue::Throttled {
                id,
                interval,
                job: map_job(job, map),
            },
            EffectValue::AfterDelay { delay, job } => EffectValue::AfterDelay {
                delay,
                job: Box::new(move |sender: AnyActionSender<MappedAction>| {
                    job(map_sender(sender, map))
                }),
            },
            EffectValue::FireAndForget(job) => EffectValue::FireAndForget(job),
            EffectValue::Subscription { id, setup } => EffectValue::Subscription {
                id,
                setup: Box::new(move |sender: AnyActionSender<MappedAction>| {
                    setup(map_sender(sender, map))
                }),
            },
            EffectValue::Cancel(id) => EffectValue::Cancel(id),
        };
        Effect { value }
    }

    pub fn none() -> Self {
        Self {
            value: EffectValue::None,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self.value, EffectValue::None)
    }

    /// Sends `action` right away, queued behind the action being processed.
    pub fn send(action: Action) -> Self {
        Self {
            value: EffectValue::Send(action),
        }
    }

    pub fn run<T, Fut>(job: T) -> Self
    where
        Fut: Future + Send + 'static,
        Fut::Output: JobOutcome,
        T: FnOnce(AnyActionSender<Action>) -> Fut + Send + 'static,
    {
        Self {
            value: EffectValue::Run(box_job(job)),
        }
    }

    /// Starts every effect concurrently. No ordering holds between the
    /// actions of different members.
    pub fn batch(effects: Vec<Effect<Action>>) -> Self {
        Self {
            value: EffectValue::Batch(effects),
        }
    }

    pub fn merge(effects: Vec<Effect<Action>>) -> Self {
        Self::batch(effects)
    }

    /// Starting another effect under `id` revokes this one's ability to send.
    pub fn cancellable<T, Fut>(id: impl Into<EffectId>, job: T) -> Self
    where
        Fut: Future + Send + 'static,
        Fut::Output: JobOutcome,
        T: FnOnce(AnyActionSender<Action>) -> Fut + Send + 'static,
    {
        Self {
            value: EffectValue::Cancellable {
                id: id.into(),
                job: box_job(job),
            },
        }
    }

    /// Runs `job` after `delay` unless another effect under `id` starts first.
    pub fn debounced<T, Fut>(id: impl Into<EffectId>, delay: Duration, job: T) -> Self
    where
        Fut: Future + Send + 'static,
        Fut::Output: JobOutcome,
        T: FnOnce(AnyActionSender<Action>) -> Fut + Send + 'static,
    {
        Self {
            value: EffectValue::Debounced {
                id: id.into(),
                delay,
                job: box_job(job),
            },
        }
    }

    /// Runs `job` at most once per `interval` for `id`. Calls inside the
    /// window are dropped, never queued.
    pub fn throttled<T, Fut>(id: impl Into<EffectId>, interval: Duration, job: T) -> Self
    where
        Fut: Future + Send + 'static,
        Fut::Output: JobOutcome,
        T: FnOnce(AnyActionSender<Action>) -> Fut + Send + 'static,
    {
        Self {
            value: EffectValue::Throttled {
                id: id.into(),
                interval,
                job: box_job(job),
            },
        }
    }

    pub fn after_delay<T>(delay: Duration, job: T) -> Self
    where
        T: FnOnce(AnyActionSender<Action>) + Send + 'static,
    {
        Self {
            value: EffectValue::AfterDelay {
                delay,
                job: Box::new(job),
            },
        }
    }

    /// Work that can never feed an action back, e.g. analytics or logging.
    pub fn fire_and_forget<T, Fut>(job: T) -> Self
    where
        Fut: Future + Send + 'static,
        Fut::Output: JobOutcome,
        T: FnOnce() -> Fut + Send + 'static,
    {
        Self {
            value: EffectValue::FireAndForget(Box::new(move || -> JobFuture {
                let fut = job();
                Box::pin(async move { fut.await.into_result() })
            })),
        }
    }

    /// Long-lived source of actions.
    ///
    /// `setup` runs once when the effect is executed and returns the cleanup
    /// closure. Cleanup runs exactly once: when another effect starts under
    /// `id`, when `id` is cancelled, or when the driver is torn down.
    pub fn subscription<T, C>(id: impl Into<EffectId>, setup: T) -> Self
    where
        C: FnOnce() + Send + 'static,
        T: FnOnce(AnyActionSender<Action>) -> C + Send + 'static,
    {
        Self {
            value: EffectValue::Subscription {
                id: id.into(),
                setup: Box::new(move |sender: AnyActionSender<Action>| -> Cleanup {
                    Box::new(setup(sender))
                }),
            },
        }
    }

    pub fn cancel(id: impl Into<EffectId>) -> Self {
        Self {
            value: EffectValue::Cancel(id.into()),
        }
    }
}

impl<Action> Debug for EffectValue<Action>
where
    Action: Send + Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Send(action) => f.debug_tuple("Send").field(action).finish(),
            Self::Run(_) => f.write_str("Run"),
            Self::Batch(effects) => f.debug_tuple("Batch").field(effects).finish(),
            Self::Cancellable { id, .. } => f.debug_struct("Cancellable").field("id", id).finish(),
            Self::Debounced { id, delay, .. } => f
                .debug_struct("Debounced")
                .field("id", id)
                .field("delay", delay)
                .finish(),
            Self::Throttled { id, interval, .. } => f
                .debug_struct("Throttled")
                .field("id", id)
                .field("interval", interval)
                .finish(),
            Self::AfterDelay { delay, .. } => {
                f.debug_struct("AfterDelay").field("delay", delay).finish()
            }
            Self::FireAndForget(_) => f.write_str("FireAndForget"),
            Self::Subscription { id, .. } => {
                f.debug_struct("Subscription").field("id", id).finish()
            }
            Self::Cancel(id) => f.debug_tuple("Cancel").field(id).finish(),
        }
    }
}

impl<Action> Debug for Effect<Action>
where
    Action: Send + Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.value.fmt(f)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::action_sender::ActionSender;
    use parking_lot::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    enum Child {
        Loaded(u32),
    }

    #[derive(Debug, Clone, PartialEq)]
    enum Parent {
        Child(Child),
        Wrapped(Box<Parent>),
    }

    struct Recorder<A> {
        sent: Mutex<Vec<A>>,
    }

    impl<A: Send> ActionSender for Recorder<A> {
        type SendableAction = A;

        fn send(&self, action: A) {
            self.sent.lock().push(action);
        }
    }

    fn recorder<A: Send + 'static>() -> (Arc<Recorder<A>>, AnyActionSender<A>) {
        let recorder = Arc::new(Recorder {
            sent: Mutex::new(Vec::new()),
        });
        let sender = AnyActionSender::new(Box::new(recorder.clone()));
        (recorder, sender)
    }

    async fn drive<A: Send + 'static>(effect: Effect<A>, sender: AnyActionSender<A>) {
        match effect.value {
            EffectValue::Send(action) => sender.send(action),
            EffectValue::Run(job) | EffectValue::Cancellable { job, .. } => {
                job(sender).await.unwrap()
            }
            EffectValue::AfterDelay { job, .. } => job(sender),
            EffectValue::Batch(effects) => {
                for effect in effects {
                    Box::pin(drive(effect, sender.clone())).await;
                }
            }
            other => panic!("unexpected effect {:?}", std::mem::discriminant(&other)),
        }
    }

    #[tokio::test]
    async fn test_map_rewrites_run_actions() {
        let effect = Effect::run(|sender| async move {
            sender.send(Child::Loaded(1));
            sender.send(Child::Loaded(2));
        })
        .map(Parent::Child);

        let (recorder, sender) = recorder();
        drive(effect, sender).await;

        assert_eq!(
            *recorder.sent.lock(),
            vec![Parent::Child(Child::Loaded(1)), Parent::Child(Child::Loaded(2))]
        );
    }

    #[tokio::test]
    async fn test_map_composes() {
        let make = || {
            Effect::batch(vec![
                Effect::send(Child::Loaded(3)),
                Effect::after_delay(Duration::from_millis(1), |sender| {
                    sender.send(Child::Loaded(4))
                }),
            ])
        };
        let wrap = |parent: Parent| Parent::Wrapped(Box::new(parent));

        let (nested, nested_sender) = recorder();
        drive(make().map(Parent::Child).map(wrap), nested_sender).await;

        let (composed, composed_sender) = recorder();
        drive(
            make().map(move |child| wrap(Parent::Child(child))),
            composed_sender,
        )
        .await;

        assert_eq!(*nested.sent.lock(), *composed.sent.lock());
        assert_eq!(nested.sent.lock().len(), 2);
    }

    #[test]
    fn test_map_keeps_keys() {
        let effect = Effect::<Child>::cancellable("search", |_| async {})
            .map(Parent::Child);
        match effect.value {
            EffectValue::Cancellable { id, .. } => assert_eq!(id, "search"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_debug_hides_closures() {
        let effect = Effect::batch(vec![
            Effect::send(Child::Loaded(1)),
            Effect::debounced("query", Duration::from_millis(300), |_| async {}),
            Effect::cancel("query"),
        ]);
        let printed = format!("{:?}", effect);

        assert!(printed.contains("Loaded(1)"));
        assert!(printed.contains("Debounced"));
        assert!(printed.contains("Cancel(\"query\")"));
        assert!(Effect::<Child>::none().is_none());
    }

    #[test]
    fn test_job_outcome_converts_errors() {
        let failed: Result<(), std::io::Error> =
            Err(std::io::Error::new(std::io::ErrorKind::Other, "boom"));
        assert!(failed.into_result().is_err());
        assert!(().into_result().is_ok());
    }
}
