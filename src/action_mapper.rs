use std::sync::Arc;

use crate::action_sender::ActionSender;

/// Forwards child actions to a parent sender after embedding them.
pub struct ActionMapper<Action, MappedAction>
where
    Action: Send,
    MappedAction: Send,
{
    parent: Box<dyn ActionSender<SendableAction = MappedAction> + Sync>,
    map: Arc<dyn Fn(Action) -> MappedAction + Send + Sync>,
}

impl<Action, MappedAction> ActionMapper<Action, MappedAction>
where
    Action: Send,
    MappedAction: Send,
{
    pub fn new(
        parent: Box<dyn ActionSender<SendableAction = MappedAction> + Sync>,
        map: Arc<dyn Fn(Action) -> MappedAction + Send + Sync>,
    ) -> Self {
        Self { parent, map }
    }
}

impl<Action, MappedAction> ActionSender for ActionMapper<Action, MappedAction>
where
    Action: Send + 'static,
    MappedAction: Send + 'static,
{
    type SendableAction = Action;

    fn send(&self, action: Action) {
        let mapped = (self.map)(action);
        self.parent.send(mapped);
    }

    fn is_active(&self) -> bool {
        self.parent.is_active()
    }
}
