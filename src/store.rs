use std::collections::VecDeque;
use std::fmt::Debug;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;

use crate::action_mapper::ActionMapper;
use crate::action_sender::{ActionSender, AnyActionSender};
use crate::change_observer::ChangeObserver;
use crate::engine::EffectRunner;
use crate::error::EffectFailure;
use crate::reducer::Reducer;
use crate::state_provider::{BorrowedState, StateProvider};

type Listener<State> = Arc<dyn Fn(&State) + Send + Sync>;

/// Runtime driver: owns the state, runs the reducer for every action and
/// executes the returned effects, feeding their actions back into itself.
///
/// Dropping the store tears it down: live subscriptions are cleaned up and
/// every sender handed out to effects becomes a no-op.
pub struct Store<State, Action, Dependencies = ()>
where
    Action: Debug + Send + 'static,
    State: Send + Sync + 'static,
    Dependencies: Send + Sync + 'static,
{
    inner: Arc<StoreInner<State, Action, Dependencies>>,
}

struct StoreInner<State, Action, Dependencies>
where
    Action: Send + 'static,
{
    state: RwLock<State>,
    reducer: Box<dyn Reducer<State, Action, Dependencies> + Send + Sync>,
    dependencies: Dependencies,
    queue: Mutex<ActionQueue<Action>>,
    listeners: Arc<Mutex<Listeners<State>>>,
    changes: broadcast::Sender<()>,
    runner: EffectRunner<Action>,
}

struct ActionQueue<Action> {
    pending: VecDeque<Action>,
    draining: bool,
}

struct Listeners<State> {
    next_id: u64,
    entries: Vec<(u64, Listener<State>)>,
}

/// Removes a listener registered with [`Store::subscribe`].
pub struct Unsubscribe {
    remove: Box<dyn FnOnce() + Send>,
}

impl Unsubscribe {
    pub fn unsubscribe(self) {
        (self.remove)()
    }
}

impl<State, Action, Dependencies> Store<State, Action, Dependencies>
where
    Action: Debug + Send + 'static,
    State: Send + Sync + 'static,
    Dependencies: Send + Sync + 'static,
{
    /// Must be called from within a tokio runtime. Effects run on that
    /// runtime, `send` may be called from any thread afterwards.
    pub fn new<R>(state: State, reducer: R, dependencies: Dependencies) -> Self
    where
        R: Reducer<State, Action, Dependencies> + Send + Sync + 'static,
    {
        let (changes, _) = broadcast::channel(16);
        let inner = Arc::new_cyclic(|inner: &Weak<StoreInner<State, Action, Dependencies>>| {
            let sink = StoreSink {
                inner: inner.clone(),
            };
            let runner = EffectRunner::new(
                AnyActionSender::new(Box::new(sink)),
                Arc::new(|failure: EffectFailure| log::error!("Store effect: {}", failure)),
            );
            StoreInner {
                state: RwLock::new(state),
                reducer: Box::new(reducer),
                dependencies,
                queue: Mutex::new(ActionQueue {
                    pending: VecDeque::new(),
                    draining: false,
                }),
                listeners: Arc::new(Mutex::new(Listeners {
                    next_id: 0,
                    entries: Vec::new(),
                })),
                changes,
                runner,
            }
        });
        Self { inner }
    }

    pub fn state(&self) -> BorrowedState<'_, State> {
        self.inner.state.read_recursive()
    }

    /// Registers `listener`, called with the settled state once per
    /// processed action.
    pub fn subscribe(&self, listener: impl Fn(&State) + Send + Sync + 'static) -> Unsubscribe {
        let id = {
            let mut listeners = self.inner.listeners.lock();
            let id = listeners.next_id;
            listeners.next_id += 1;
            listeners.entries.push((id, Arc::new(listener)));
            id
        };
        let listeners = Arc::downgrade(&self.inner.listeners);
        Unsubscribe {
            remove: Box::new(move || {
                if let Some(listeners) = listeners.upgrade() {
                    listeners.lock().entries.retain(|(entry, _)| *entry != id);
                }
            }),
        }
    }

    /// Sender feeding this store. It outlives nothing: once the store is
    /// dropped it silently discards actions.
    pub fn sender(&self) -> AnyActionSender<Action> {
        AnyActionSender::new(Box::new(StoreSink {
            inner: Arc::downgrade(&self.inner),
        }))
    }

    /// Sender for a child feature whose actions are embedded into this
    /// store's action type.
    pub fn scope<ChildAction>(
        &self,
        action: impl Fn(ChildAction) -> Action + Send + Sync + 'static,
    ) -> AnyActionSender<ChildAction>
    where
        ChildAction: Send + 'static,
    {
        let mapper = ActionMapper::new(Box::new(self.sender()), Arc::new(action));
        AnyActionSender::new(Box::new(mapper))
    }

    /// Runs subscription cleanups, stops pending timers and in-flight
    /// effects. Actions sent afterwards are still reduced, but their effects
    /// are ignored.
    pub fn shutdown(&self) {
        self.inner.runner.tear_down();
    }
}

impl<State, Action, Dependencies> StoreInner<State, Action, Dependencies>
where
    Action: Debug + Send + 'static,
    State: Send + Sync + 'static,
    Dependencies: Send + Sync + 'static,
{
    fn enqueue(&self, action: Action) {
        {
            let mut queue = self.queue.lock();
            queue.pending.push_back(action);
            if queue.draining {
                return;
            }
            queue.draining = true;
        }

        let _guard = DrainGuard(&self.queue);
        loop {
            let action = {
                let mut queue = self.queue.lock();
                match queue.pending.pop_front() {
                    Some(action) => action,
                    None => {
                        queue.draining = false;
                        return;
                    }
                }
            };
            self.process(action);
        }
    }

    fn process(&self, action: Action) {
        log::debug!("Processing {:#?}", action);
        let effect = {
            let mut state = self.state.write();
            self.reducer.reduce(&mut state, action, &self.dependencies)
        };
        self.notify();
        self.runner.execute(effect);
    }

    fn notify(&self) {
        let listeners: Vec<Listener<State>> = self
            .listeners
            .lock()
            .entries
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        {
            let state = self.state.read_recursive();
            for listener in listeners {
                listener(&state);
            }
        }
        let _ = self.changes.send(());
    }
}

/// Resets the draining flag if a reducer or listener panics, so later sends
/// still make progress.
struct DrainGuard<'a, Action>(&'a Mutex<ActionQueue<Action>>);

impl<Action> Drop for DrainGuard<'_, Action> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.lock().draining = false;
        }
    }
}

struct StoreSink<State, Action, Dependencies>
where
    Action: Send + 'static,
{
    inner: Weak<StoreInner<State, Action, Dependencies>>,
}

impl<State, Action, Dependencies> ActionSender for StoreSink<State, Action, Dependencies>
where
    Action: Debug + Send + 'static,
    State: Send + Sync + 'static,
    Dependencies: Send + Sync + 'static,
{
    type SendableAction = Action;

    fn send(&self, action: Action) {
        match self.inner.upgrade() {
            Some(inner) => inner.enqueue(action),
            None => log::trace!("Dropping {:?} sent to a dropped store", action),
        }
    }

    fn is_active(&self) -> bool {
        self.inner.strong_count() > 0
    }
}

impl<State, Action, Dependencies> ActionSender for Store<State, Action, Dependencies>
where
    Action: Debug + Send + 'static,
    State: Send + Sync + 'static,
    Dependencies: Send + Sync + 'static,
{
    type SendableAction = Action;

    fn send(&self, action: Action) {
        self.inner.enqueue(action);
    }
}

impl<State, Action, Dependencies> StateProvider for Store<State, Action, Dependencies>
where
    Action: Debug + Send + 'static,
    State: Send + Sync + 'static,
    Dependencies: Send + Sync + 'static,
{
    type State = State;

    fn state(&self) -> BorrowedState<'_, State> {
        Store::state(self)
    }
}

impl<State, Action, Dependencies> ChangeObserver for Store<State, Action, Dependencies>
where
    Action: Debug + Send + 'static,
    State: Send + Sync + 'static,
    Dependencies: Send + Sync + 'static,
{
    fn observe(&self) -> broadcast::Receiver<()> {
        self.inner.changes.subscribe()
    }
}

impl<State, Action, Dependencies> Drop for Store<State, Action, Dependencies>
where
    Action: Debug + Send + 'static,
    State: Send + Sync + 'static,
    Dependencies: Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.inner.runner.tear_down();
    }
}
