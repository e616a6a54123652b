use std::ops::Deref;
use std::sync::Arc;

/// Capability to dispatch actions into a driver.
///
/// Effects never see the store itself, only a sender. Senders handed to
/// keyed effects turn into silent no-ops once the key is superseded.
pub trait ActionSender: Send {
    type SendableAction;

    fn send(&self, action: Self::SendableAction);

    /// Whether actions sent now can still reach a reducer.
    fn is_active(&self) -> bool {
        true
    }
}

pub struct AnyActionSender<Action: Send + 'static> {
    value: Arc<dyn ActionSender<SendableAction = Action> + Sync>,
}

impl<Action: Send> AnyActionSender<Action> {
    pub fn new(value: Box<dyn ActionSender<SendableAction = Action> + Sync>) -> Self {
        Self {
            value: Arc::from(value),
        }
    }
}

impl<Action: Send> Clone for AnyActionSender<Action> {
    fn clone(&self) -> Self {
        Self {
            value: self.value.clone(),
        }
    }
}

impl<Action: Send> ActionSender for AnyActionSender<Action> {
    type SendableAction = Action;

    fn send(&self, action: Action) {
        self.value.send(action)
    }

    fn is_active(&self) -> bool {
        self.value.is_active()
    }
}

impl<T> ActionSender for Arc<T>
where
    T: ActionSender + Sync,
{
    type SendableAction = T::SendableAction;

    fn send(&self, action: Self::SendableAction) {
        self.deref().send(action);
    }

    fn is_active(&self) -> bool {
        self.deref().is_active()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<i32>>,
    }

    impl ActionSender for Recorder {
        type SendableAction = i32;

        fn send(&self, action: i32) {
            self.sent.lock().push(action);
        }
    }

    #[test]
    fn test_clones_share_destination() {
        let recorder = Arc::new(Recorder::default());
        let sender = AnyActionSender::new(Box::new(recorder.clone()));
        let other = sender.clone();

        sender.send(1);
        other.send(2);

        assert_eq!(*recorder.sent.lock(), vec![1, 2]);
        assert!(other.is_active());
    }
}
