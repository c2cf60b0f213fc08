//! Cooperative cancellation.
//!
//! A [`CancelToken`] is a shared flag plus a list of abort hooks. Work polls the flag between
//! steps; hooks interrupt work that is blocked, typically by shutting a socket down.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::utils::lock;

type Hook = Box<dyn FnOnce() + Send>;

/// Identifies a hook registered with [`CancelToken::on_cancel`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HookId(u64);

#[derive(Default)]
struct Hooks {
    next_id: u64,
    fired: bool,
    list: Vec<(HookId, Hook)>,
}

#[derive(Default)]
struct TokenInner {
    cancelled: AtomicBool,
    hooks: Mutex<Hooks>,
}

/// A cloneable cancellation flag with abort hooks.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

impl CancelToken {
    /// A token that has not been cancelled.
    pub fn new() -> Self {
        CancelToken::default()
    }

    /// Whether [`cancel`](Self::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Cancels the token and runs every registered hook.
    ///
    /// Hooks run once, on the calling thread, after the internal lock is released. Returns
    /// `false` if the token was already cancelled.
    pub fn cancel(&self) -> bool {
        let hooks = {
            let mut hooks = lock(&self.inner.hooks);
            if hooks.fired {
                return false;
            }
            hooks.fired = true;
            self.inner.cancelled.store(true, Ordering::Release);
            std::mem::take(&mut hooks.list)
        };

        for (_, hook) in hooks {
            hook();
        }
        true
    }

    /// Registers a hook to run on cancellation.
    ///
    /// If the token is already cancelled the hook runs immediately and `None` is returned.
    pub fn on_cancel<F>(&self, hook: F) -> Option<HookId>
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut hooks = lock(&self.inner.hooks);
            if !hooks.fired {
                let id = HookId(hooks.next_id);
                hooks.next_id += 1;
                hooks.list.push((id, Box::new(hook)));
                return Some(id);
            }
        }

        hook();
        None
    }

    /// Unregisters a hook that has not run yet.
    ///
    /// Returns `false` if the hook already ran or was never registered with this token.
    pub fn remove(&self, id: HookId) -> bool {
        let mut hooks = lock(&self.inner.hooks);
        let before = hooks.list.len();
        hooks.list.retain(|(hid, _)| *hid != id);
        hooks.list.len() != before
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
