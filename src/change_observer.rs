use tokio::sync::broadcast;

/// Async notification that a store processed an action.
///
/// Receivers that fall behind see `RecvError::Lagged` and should simply read
/// the latest state.
pub trait ChangeObserver {
    fn observe(&self) -> broadcast::Receiver<()>;
}
