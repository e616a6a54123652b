use std::collections::VecDeque;
use std::fmt::Debug;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::action_sender::{ActionSender, AnyActionSender};
use crate::engine::EffectRunner;
use crate::error::{EffectFailure, TestStoreError};
use crate::reducer::Reducer;
use crate::state_provider::{BorrowedState, StateProvider};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

/// Whether actions produced by effects must all be asserted with
/// [`TestStore::receive`] before the test finishes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Exhaustivity {
    #[default]
    On,
    Off,
}

type StateUpdate<'a, State> = Box<dyn FnOnce(&mut State) + 'a>;

/// Deterministic driver for tests.
///
/// Effects run for real, but the actions they send are not just fed back:
/// each one is reduced when it arrives and also queued, together with the
/// state before and after it, until the test claims it with
/// [`receive`](Self::receive). With [`Exhaustivity::On`] every queued action
/// has to be claimed before [`finish`](Self::finish) succeeds.
///
/// ```ignore
/// let store = TestStore::new(State::default(), Feature::default(), ());
/// store.send_and_assert(Action::IncrementTapped, |state| state.count = 1).await?;
/// store
///     .receive_and_assert(|action| matches!(action, Action::AutoReset), |state| state.count = 0)
///     .await?;
/// store.finish().await?;
/// ```
pub struct TestStore<State, Action, Dependencies = ()>
where
    Action: Clone + Debug + Send + 'static,
    State: Clone + PartialEq + Debug + Send + Sync + 'static,
    Dependencies: Send + Sync + 'static,
{
    inner: Arc<TestStoreInner<State, Action, Dependencies>>,
    failures: Arc<Mutex<Vec<String>>>,
    exhaustivity: Exhaustivity,
    timeout: Duration,
}

struct TestStoreInner<State, Action, Dependencies>
where
    Action: Send + 'static,
{
    state: RwLock<State>,
    reducer: Box<dyn Reducer<State, Action, Dependencies> + Send + Sync>,
    dependencies: Dependencies,
    received: Mutex<VecDeque<Received<State, Action>>>,
    received_changed: Notify,
    runner: EffectRunner<Action>,
}

struct Received<State, Action> {
    action: Action,
    before: State,
    after: State,
}

impl<State, Action, Dependencies> TestStore<State, Action, Dependencies>
where
    Action: Clone + Debug + Send + 'static,
    State: Clone + PartialEq + Debug + Send + Sync + 'static,
    Dependencies: Send + Sync + 'static,
{
    /// Must be called from within a tokio runtime.
    pub fn new<R>(state: State, reducer: R, dependencies: Dependencies) -> Self
    where
        R: Reducer<State, Action, Dependencies> + Send + Sync + 'static,
    {
        let failures = Arc::new(Mutex::new(Vec::new()));
        let record = failures.clone();
        let inner = Arc::new_cyclic(
            |inner: &Weak<TestStoreInner<State, Action, Dependencies>>| {
                let sink = TestSink {
                    inner: inner.clone(),
                };
                let runner = EffectRunner::new(
                    AnyActionSender::new(Box::new(sink)),
                    Arc::new(move |failure: EffectFailure| {
                        log::error!("Test store effect: {}", failure);
                        record.lock().push(failure.to_string());
                    }),
                );
                TestStoreInner {
                    state: RwLock::new(state),
                    reducer: Box::new(reducer),
                    dependencies,
                    received: Mutex::new(VecDeque::new()),
                    received_changed: Notify::new(),
                    runner,
                }
            },
        );
        Self {
            inner,
            failures,
            exhaustivity: Exhaustivity::default(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_exhaustivity(mut self, exhaustivity: Exhaustivity) -> Self {
        self.exhaustivity = exhaustivity;
        self
    }

    /// Default wait for [`receive`](Self::receive) and [`finish`](Self::finish).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn state(&self) -> BorrowedState<'_, State> {
        self.inner.state.read_recursive()
    }

    /// Reduces `action` and starts its effect. Nothing the effect sends is
    /// claimed here.
    pub async fn send(&self, action: Action) -> Result<(), TestStoreError> {
        self.send_inner(action, None)
    }

    /// Like [`send`](Self::send), then checks that the state after the action
    /// equals the state before it with `update` applied.
    pub async fn send_and_assert(
        &self,
        action: Action,
        update: impl FnOnce(&mut State),
    ) -> Result<(), TestStoreError> {
        self.send_inner(action, Some(Box::new(update)))
    }

    /// Claims the first queued action matching `matcher`, waiting for
    /// in-flight effects up to the configured timeout.
    ///
    /// Returns as soon as a match is queued. Effects still running at that
    /// point keep running, so their later actions stay unclaimed until a
    /// following `receive` or [`finish`](Self::finish). Fails immediately when
    /// nothing matches and no effect or subscription could still send one.
    pub async fn receive(
        &self,
        matcher: impl Fn(&Action) -> bool,
    ) -> Result<(), TestStoreError> {
        self.receive_inner(&matcher, None, self.timeout).await
    }

    pub async fn receive_and_assert(
        &self,
        matcher: impl Fn(&Action) -> bool,
        update: impl FnOnce(&mut State),
    ) -> Result<(), TestStoreError> {
        self.receive_inner(&matcher, Some(Box::new(update)), self.timeout)
            .await
    }

    pub async fn receive_within(
        &self,
        matcher: impl Fn(&Action) -> bool,
        timeout: Duration,
    ) -> Result<(), TestStoreError> {
        self.receive_inner(&matcher, None, timeout).await
    }

    /// Fails when effects sent actions the test never claimed. With
    /// [`Exhaustivity::Off`] the leftovers are logged and dropped instead.
    pub fn assert_no_pending_actions(&self) -> Result<(), TestStoreError> {
        let mut received = self.inner.received.lock();
        if received.is_empty() {
            return Ok(());
        }
        let actions = received.iter().map(|r| format!("{:?}", r.action)).collect();
        match self.exhaustivity {
            Exhaustivity::On => Err(TestStoreError::UnreceivedActions { actions }),
            Exhaustivity::Off => {
                log::warn!("Skipping unasserted received actions: {:?}", actions);
                received.clear();
                Ok(())
            }
        }
    }

    pub fn skip_received_actions(&self) {
        let skipped = std::mem::take(&mut *self.inner.received.lock());
        log::debug!("Skipped {} received action(s)", skipped.len());
    }

    /// Waits for in-flight effects, then asserts nothing is left unclaimed.
    /// Subscriptions are torn down when the store is dropped.
    pub async fn finish(self) -> Result<(), TestStoreError> {
        let mut in_flight = self.inner.runner.in_flight();
        let drained = matches!(
            tokio::time::timeout(self.timeout, in_flight.wait_for(|count| *count == 0)).await,
            Ok(Ok(_))
        );
        self.check_failures()?;
        if !drained {
            return Err(TestStoreError::EffectsStillRunning {
                timeout: self.timeout,
                in_flight: self.inner.runner.in_flight_count(),
            });
        }
        self.assert_no_pending_actions()
    }

    fn send_inner(
        &self,
        action: Action,
        update: Option<StateUpdate<'_, State>>,
    ) -> Result<(), TestStoreError> {
        self.check_failures()?;
        log::debug!("Sending {:#?}", action);

        let description = format!("{:?}", action);
        let (before, after, effect) = {
            let mut state = self.inner.state.write();
            let before = state.clone();
            let effect = self
                .inner
                .reducer
                .reduce(&mut state, action, &self.inner.dependencies);
            (before, state.clone(), effect)
        };
        self.inner.runner.execute(effect);

        if let Some(update) = update {
            assert_transition(&description, before, &after, update)?;
        }
        self.check_failures()
    }

    async fn receive_inner(
        &self,
        matcher: &dyn Fn(&Action) -> bool,
        update: Option<StateUpdate<'_, State>>,
        timeout: Duration,
    ) -> Result<(), TestStoreError> {
        let deadline = Instant::now() + timeout;
        let mut in_flight = self.inner.runner.in_flight();

        loop {
            let notified = self.inner.received_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.check_failures()?;
            let running = *in_flight.borrow_and_update();
            if let Some(received) = self.take_first(matcher) {
                log::debug!("Received {:#?}", received.action);
                return match update {
                    Some(update) => assert_transition(
                        &format!("{:?}", received.action),
                        received.before,
                        &received.after,
                        update,
                    ),
                    None => Ok(()),
                };
            }
            if running == 0 && !self.inner.runner.has_subscriptions() {
                return Err(TestStoreError::NoMatchingAction {
                    received: self.received_descriptions(),
                });
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = in_flight.changed() => {}
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(TestStoreError::Timeout {
                        timeout,
                        in_flight: self.inner.runner.in_flight_count(),
                        received: self.received_descriptions(),
                    });
                }
            }
        }
    }

    fn take_first(&self, matcher: &dyn Fn(&Action) -> bool) -> Option<Received<State, Action>> {
        let mut received = self.inner.received.lock();
        let index = received.iter().position(|r| matcher(&r.action))?;
        received.remove(index)
    }

    fn received_descriptions(&self) -> Vec<String> {
        self.inner
            .received
            .lock()
            .iter()
            .map(|r| format!("{:?}", r.action))
            .collect()
    }

    fn check_failures(&self) -> Result<(), TestStoreError> {
        let failures = std::mem::take(&mut *self.failures.lock());
        if failures.is_empty() {
            Ok(())
        } else {
            Err(TestStoreError::EffectFailed(failures.join("; ")))
        }
    }
}

fn assert_transition<State>(
    action: &str,
    before: State,
    after: &State,
    update: StateUpdate<'_, State>,
) -> Result<(), TestStoreError>
where
    State: PartialEq + Debug,
{
    let mut expected = before;
    update(&mut expected);
    if expected == *after {
        Ok(())
    } else {
        Err(TestStoreError::StateMismatch {
            action: action.to_owned(),
            expected: format!("{:#?}", expected),
            actual: format!("{:#?}", after),
        })
    }
}

/// Reduces effect output as it arrives and queues it for `receive`.
struct TestSink<State, Action, Dependencies>
where
    Action: Send + 'static,
{
    inner: Weak<TestStoreInner<State, Action, Dependencies>>,
}

impl<State, Action, Dependencies> ActionSender for TestSink<State, Action, Dependencies>
where
    Action: Clone + Debug + Send + 'static,
    State: Clone + Send + Sync + 'static,
    Dependencies: Send + Sync + 'static,
{
    type SendableAction = Action;

    fn send(&self, action: Action) {
        let Some(inner) = self.inner.upgrade() else {
            log::trace!("Dropping {:?} sent to a dropped test store", action);
            return;
        };
        let effect = {
            let mut state = inner.state.write();
            let before = state.clone();
            let effect = inner
                .reducer
                .reduce(&mut state, action.clone(), &inner.dependencies);
            let after = state.clone();
            inner.received.lock().push_back(Received {
                action,
                before,
                after,
            });
            effect
        };
        inner.received_changed.notify_waiters();
        inner.runner.execute(effect);
    }

    fn is_active(&self) -> bool {
        self.inner.strong_count() > 0
    }
}

impl<State, Action, Dependencies> StateProvider for TestStore<State, Action, Dependencies>
where
    Action: Clone + Debug + Send + 'static,
    State: Clone + PartialEq + Debug + Send + Sync + 'static,
    Dependencies: Send + Sync + 'static,
{
    type State = State;

    fn state(&self) -> BorrowedState<'_, State> {
        TestStore::state(self)
    }
}

impl<State, Action, Dependencies> Drop for TestStore<State, Action, Dependencies>
where
    Action: Clone + Debug + Send + 'static,
    State: Clone + PartialEq + Debug + Send + Sync + 'static,
    Dependencies: Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.inner.runner.tear_down();
    }
}
