use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::action_sender::{ActionSender, AnyActionSender};
use crate::effect::{Cleanup, EffectId};

/// Bookkeeping for keyed effects, one per driver.
///
/// Every start under a key bumps the key's generation. A sender is only
/// allowed through while the generation it captured is still the latest one
/// and the registry has not been torn down.
#[derive(Default)]
struct Registry {
    generations: HashMap<EffectId, u64>,
    timers: HashMap<EffectId, (u64, AbortHandle)>,
    last_fired: HashMap<EffectId, Instant>,
    subscriptions: HashMap<EffectId, (u64, Cleanup)>,
    torn_down: bool,
}

impl Registry {
    fn bump(&mut self, id: &str) -> (u64, Option<Cleanup>) {
        let generation = self.generations.entry(id.to_owned()).or_insert(0);
        *generation += 1;
        let generation = *generation;

        if let Some((_, timer)) = self.timers.remove(id) {
            timer.abort();
        }
        let cleanup = self.subscriptions.remove(id).map(|(_, cleanup)| cleanup);
        (generation, cleanup)
    }

    fn is_current(&self, id: &str, generation: u64) -> bool {
        self.generations.get(id) == Some(&generation)
    }
}

#[derive(Clone, Default)]
pub(crate) struct CancellationRegistry {
    inner: Arc<Mutex<Registry>>,
}

impl CancellationRegistry {
    /// Starts a new generation for `id`.
    ///
    /// Returns the token for the new effect and the cleanup of a subscription
    /// that was live under the same key. The caller runs the cleanup outside
    /// of any lock.
    pub fn start(&self, id: &str) -> (CancellationToken, Option<Cleanup>) {
        let (generation, superseded) = self.inner.lock().bump(id);
        let token = CancellationToken {
            registry: self.inner.clone(),
            key: Some((id.to_owned(), generation)),
        };
        (token, superseded)
    }

    /// Token that only expires on teardown, for effects without a key.
    pub fn lifetime_token(&self) -> CancellationToken {
        CancellationToken {
            registry: self.inner.clone(),
            key: None,
        }
    }

    pub fn cancel(&self, id: &str) -> Option<Cleanup> {
        self.inner.lock().bump(id).1
    }

    pub fn is_torn_down(&self) -> bool {
        self.inner.lock().torn_down
    }

    /// Remembers the pending timer of a debounced effect so that a newer
    /// start under the same key can clear it before it fires.
    pub fn arm_timer(&self, token: &CancellationToken, timer: AbortHandle) {
        let Some((id, generation)) = &token.key else {
            return;
        };
        let mut registry = self.inner.lock();
        if !registry.torn_down && registry.is_current(id, *generation) {
            registry.timers.insert(id.clone(), (*generation, timer));
        } else {
            timer.abort();
        }
    }

    /// Forgets the timer once it fired; the job is running from now on and
    /// is only revoked cooperatively.
    pub fn disarm_timer(&self, token: &CancellationToken) {
        let Some((id, generation)) = &token.key else {
            return;
        };
        let mut registry = self.inner.lock();
        if matches!(registry.timers.get(id), Some((armed, _)) if armed == generation) {
            registry.timers.remove(id);
        }
    }

    /// Returns whether a throttled effect may fire now, recording the fire.
    pub fn try_throttle(&self, id: &str, interval: Duration, now: Instant) -> bool {
        let mut registry = self.inner.lock();
        if let Some(last) = registry.last_fired.get(id) {
            if now.saturating_duration_since(*last) < interval {
                return false;
            }
        }
        registry.last_fired.insert(id.to_owned(), now);
        true
    }

    /// Stores a subscription cleanup. Hands it back when the subscription was
    /// superseded while its setup ran, so the caller can run it immediately.
    pub fn attach_cleanup(&self, token: &CancellationToken, cleanup: Cleanup) -> Option<Cleanup> {
        let Some((id, generation)) = &token.key else {
            return Some(cleanup);
        };
        let mut registry = self.inner.lock();
        if registry.torn_down || !registry.is_current(id, *generation) {
            return Some(cleanup);
        }
        registry.subscriptions.insert(id.clone(), (*generation, cleanup));
        None
    }

    pub fn has_subscriptions(&self) -> bool {
        !self.inner.lock().subscriptions.is_empty()
    }

    /// Expires every token, clears pending timers and returns the cleanups of
    /// all live subscriptions.
    pub fn tear_down(&self) -> Vec<Cleanup> {
        let mut registry = self.inner.lock();
        registry.torn_down = true;
        for (_, (_, timer)) in registry.timers.drain() {
            timer.abort();
        }
        let cleanups = registry
            .subscriptions
            .drain()
            .map(|(_, (_, cleanup))| cleanup)
            .collect();
        cleanups
    }
}

#[derive(Clone)]
pub(crate) struct CancellationToken {
    registry: Arc<Mutex<Registry>>,
    key: Option<(EffectId, u64)>,
}

impl CancellationToken {
    pub fn is_current(&self) -> bool {
        let registry = self.registry.lock();
        if registry.torn_down {
            return false;
        }
        match &self.key {
            Some((id, generation)) => registry.is_current(id, *generation),
            None => true,
        }
    }

    fn describe(&self) -> &str {
        self.key.as_ref().map(|(id, _)| id.as_str()).unwrap_or("<unkeyed>")
    }
}

/// Sender handed to effect jobs. Becomes a silent no-op once its token
/// expires.
pub(crate) struct GuardedSender<Action: Send + 'static> {
    inner: AnyActionSender<Action>,
    token: CancellationToken,
}

impl<Action: Send + 'static> GuardedSender<Action> {
    pub fn new(inner: AnyActionSender<Action>, token: CancellationToken) -> Self {
        Self { inner, token }
    }
}

impl<Action: Send + 'static> ActionSender for GuardedSender<Action> {
    type SendableAction = Action;

    fn send(&self, action: Action) {
        if self.token.is_current() {
            self.inner.send(action);
        } else {
            log::trace!("Dropping action from cancelled effect {}", self.token.describe());
        }
    }

    fn is_active(&self) -> bool {
        self.token.is_current() && self.inner.is_active()
    }
}
