/// Read access to a driver's current state.
///
/// The guard is a recursive read lock, so a subscriber may read the state
/// while the store is notifying it.
pub type BorrowedState<'a, State> = parking_lot::RwLockReadGuard<'a, State>;

pub trait StateProvider: Send {
    type State;

    fn state(&self) -> BorrowedState<'_, Self::State>;
}
