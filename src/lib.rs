mod action_mapper;
mod action_sender;
mod cancellation;
mod change_observer;
mod effect;
mod engine;
mod error;
mod reducer;
mod scope;
mod state_provider;
mod store;
mod test_store;

pub use action_mapper::ActionMapper;
pub use action_sender::{ActionSender, AnyActionSender};
pub use change_observer::ChangeObserver;
pub use effect::{Cleanup, Effect, EffectId, EffectValue, JobOutcome};
pub use error::{EffectFailure, TestStoreError};
pub use reducer::{combine, CombineReducers, Reducer};
pub use scope::{scope, Scope};
pub use state_provider::{BorrowedState, StateProvider};
pub use store::{Store, Unsubscribe};
pub use test_store::{Exhaustivity, TestStore};
