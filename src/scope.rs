use std::marker::PhantomData;
use std::sync::Arc;

use crate::{Effect, Reducer};

/// Embeds a child reducer into a parent state and action domain.
///
/// Built by [`scope`].
pub struct Scope<ChildState, ChildAction, ToState, FromState, ToAction, FromAction, Child> {
    to_child_state: ToState,
    from_child_state: FromState,
    to_child_action: ToAction,
    from_child_action: Arc<FromAction>,
    child: Child,
    _phantom: PhantomData<fn(ChildState, ChildAction)>,
}

/// Lifts `child` into the parent domain.
///
/// * `to_child_state` reads the child's slice of the parent state.
/// * `from_child_state` writes the updated slice back.
/// * `to_child_action` returns `None` for parent actions that do not belong
///   to the child. Those actions never reach the child reducer and leave the
///   state untouched.
/// * `from_child_action` embeds the actions produced by the child's effects
///   so they come back to the parent correctly addressed.
///
/// Dependencies are passed through unchanged. Scoped reducers compose, so a
/// tree of scopes mirrors the state tree.
pub fn scope<
    ParentState,
    ParentAction,
    ChildState,
    ChildAction,
    ToState,
    FromState,
    ToAction,
    FromAction,
    Child,
>(
    to_child_state: ToState,
    from_child_state: FromState,
    to_child_action: ToAction,
    from_child_action: FromAction,
    child: Child,
) -> Scope<ChildState, ChildAction, ToState, FromState, ToAction, FromAction, Child>
where
    ToState: Fn(&ParentState) -> &ChildState,
    FromState: Fn(&mut ParentState, ChildState),
    ToAction: Fn(ParentAction) -> Option<ChildAction>,
    FromAction: Fn(ChildAction) -> ParentAction,
{
    Scope {
        to_child_state,
        from_child_state,
        to_child_action,
        from_child_action: Arc::new(from_child_action),
        child,
        _phantom: PhantomData,
    }
}

impl<
        ParentState,
        ParentAction,
        ChildState,
        ChildAction,
        Dependencies,
        ToState,
        FromState,
        ToAction,
        FromAction,
        Child,
    > Reducer<ParentState, ParentAction, Dependencies>
    for Scope<ChildState, ChildAction, ToState, FromState, ToAction, FromAction, Child>
where
    ParentAction: Send + 'static,
    ChildAction: Send + 'static,
    ChildState: Clone,
    ToState: Fn(&ParentState) -> &ChildState,
    FromState: Fn(&mut ParentState, ChildState),
    ToAction: Fn(ParentAction) -> Option<ChildAction>,
    FromAction: Fn(ChildAction) -> ParentAction + Send + Sync + 'static,
    Child: Reducer<ChildState, ChildAction, Dependencies>,
{
    fn reduce(
        &self,
        state: &mut ParentState,
        action: ParentAction,
        dependencies: &Dependencies,
    ) -> Effect<ParentAction> {
        let Some(child_action) = (self.to_child_action)(action) else {
            return Effect::none();
        };

        let mut child_state = (self.to_child_state)(state).clone();
        let effect = self
            .child
            .reduce(&mut child_state, child_action, dependencies);
        (self.from_child_state)(state, child_state);

        let embed = self.from_child_action.clone();
        effect.map(move |action| embed(action))
    }
}
