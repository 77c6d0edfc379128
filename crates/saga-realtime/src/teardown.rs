use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

type Action = Box<dyn FnOnce() + Send>;

/// Cloneable, run-at-most-once release of a subscription.
///
/// Every clone shares the same action, so it is safe to hand copies to
/// several owners and call [`Teardown::run`] from all of them.
#[derive(Clone, Default)]
pub struct Teardown {
    action: Option<Arc<Mutex<Option<Action>>>>,
}

impl Teardown {
    pub fn new(action: impl FnOnce() + Send + 'static) -> Self {
        Self {
            action: Some(Arc::new(Mutex::new(Some(Box::new(action))))),
        }
    }

    /// Handed out for duplicate subscriptions. Running it does nothing.
    pub fn noop() -> Self {
        Self::default()
    }

    pub fn is_noop(&self) -> bool {
        self.action.is_none()
    }

    pub fn is_done(&self) -> bool {
        match &self.action {
            Some(action) => action.lock().unwrap_or_else(PoisonError::into_inner).is_none(),
            None => true,
        }
    }

    pub fn run(&self) {
        let Some(action) = &self.action else {
            return;
        };
        let action = action.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(action) = action {
            action();
        }
    }

    /// Chains `after` behind this teardown.
    pub fn then(self, after: impl FnOnce() + Send + 'static) -> Self {
        Teardown::new(move || {
            self.run();
            after();
        })
    }
}

impl fmt::Debug for Teardown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Teardown")
            .field("noop", &self.is_noop())
            .field("done", &self.is_done())
            .finish()
    }
}
