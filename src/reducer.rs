use crate::Effect;

/// Feature logic: applies an action to the state and describes the follow-up
/// work as an [`Effect`].
///
/// Reducers must not perform I/O themselves. Everything observable is
/// deferred into the returned effect, and dependencies (clocks, clients,
/// counters) arrive through `dependencies` so tests can substitute them.
pub trait Reducer<State, Action: Send + 'static, Dependencies = ()> {
    fn reduce(
        &self,
        state: &mut State,
        action: Action,
        dependencies: &Dependencies,
    ) -> Effect<Action>;
}

impl<F, State, Action, Dependencies> Reducer<State, Action, Dependencies> for F
where
    Action: Send + 'static,
    F: Fn(&mut State, Action, &Dependencies) -> Effect<Action>,
{
    fn reduce(
        &self,
        state: &mut State,
        action: Action,
        dependencies: &Dependencies,
    ) -> Effect<Action> {
        self(state, action, dependencies)
    }
}

type BoxedReducer<State, Action, Dependencies> =
    Box<dyn Reducer<State, Action, Dependencies> + Send + Sync>;

/// Runs several reducers over the same state, in order, batching their
/// effects.
pub struct CombineReducers<State, Action: Send + 'static, Dependencies = ()> {
    reducers: Vec<BoxedReducer<State, Action, Dependencies>>,
}

pub fn combine<State, Action, Dependencies>(
    reducers: Vec<BoxedReducer<State, Action, Dependencies>>,
) -> CombineReducers<State, Action, Dependencies>
where
    Action: Clone + Send + 'static,
{
    CombineReducers { reducers }
}

impl<State, Action, Dependencies> Reducer<State, Action, Dependencies>
    for CombineReducers<State, Action, Dependencies>
where
    Action: Clone + Send + 'static,
{
    fn reduce(
        &self,
        state: &mut State,
        action: Action,
        dependencies: &Dependencies,
    ) -> Effect<Action> {
        let effects: Vec<_> = self
            .reducers
            .iter()
            .map(|reducer| reducer.reduce(state, action.clone(), dependencies))
            .filter(|effect| !effect.is_none())
            .collect();

        match effects.len() {
            0 => Effect::none(),
            1 => effects.into_iter().next().unwrap_or_else(Effect::none),
            _ => Effect::batch(effects),
        }
    }
}
