use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{Map, Value};

use super::frame::ExecutionState;
use crate::action::ActionResult;
use crate::error::FlowError;
use crate::script::ActionNode;

pub type ActionListener = Arc<dyn Fn(&ActionNode, &Map<String, Value>, &ActionResult) + Send + Sync>;
pub type StateListener = Arc<dyn Fn(&str, ExecutionState) + Send + Sync>;
pub type ExceptionListener = Arc<dyn Fn(&FlowError) + Send + Sync>;
pub type CompleteListener = Arc<dyn Fn() + Send + Sync>;

/// 监听器集合
///
/// Callbacks are cloned out before they run, so a listener may register or
/// unregister listeners without deadlocking.
#[derive(Default)]
pub struct Listeners {
    action: RwLock<Vec<ActionListener>>,
    state: RwLock<Vec<StateListener>>,
    exception: RwLock<Vec<ExceptionListener>>,
    complete: RwLock<Vec<CompleteListener>>,
}

impl Listeners {
    pub fn on_action(&self, listener: ActionListener) -> &Self {
        self.action.write().push(listener);
        self
    }

    pub fn on_state_change(&self, listener: StateListener) -> &Self {
        self.state.write().push(listener);
        self
    }

    pub fn on_exception(&self, listener: ExceptionListener) -> &Self {
        self.exception.write().push(listener);
        self
    }

    pub fn on_complete(&self, listener: CompleteListener) -> &Self {
        self.complete.write().push(listener);
        self
    }

    pub fn invoke_action(&self, node: &ActionNode, args: &Map<String, Value>, result: &ActionResult) {
        let listeners = self.action.read().clone();
        for listener in listeners {
            listener(node, args, result);
        }
    }

    pub fn invoke_state_change(&self, thread: &str, state: ExecutionState) {
        let listeners = self.state.read().clone();
        for listener in listeners {
            listener(thread, state);
        }
    }

    pub fn invoke_exception(&self, error: &FlowError) {
        let listeners = self.exception.read().clone();
        for listener in listeners {
            listener(error);
        }
    }

    pub fn invoke_complete(&self) {
        let listeners = self.complete.read().clone();
        for listener in listeners {
            listener();
        }
    }

    pub fn unregister_action(&self, listener: &ActionListener) {
        self.action.write().retain(|known| !Arc::ptr_eq(known, listener));
    }

    pub fn unregister_state_change(&self, listener: &StateListener) {
        self.state.write().retain(|known| !Arc::ptr_eq(known, listener));
    }

    pub fn unregister_exception(&self, listener: &ExceptionListener) {
        self.exception.write().retain(|known| !Arc::ptr_eq(known, listener));
    }

    pub fn unregister_complete(&self, listener: &CompleteListener) {
        self.complete.write().retain(|known| !Arc::ptr_eq(known, listener));
    }

    pub fn unregister_listeners(&self) {
        self.action.write().clear();
        self.state.write().clear();
        self.exception.write().clear();
        self.complete.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn unregister_removes_only_that_listener() {
        let listeners = Listeners::default();
        let hits = Arc::new(AtomicUsize::new(0));

        let first: CompleteListener = {
            let hits = Arc::clone(&hits);
            Arc::new(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        };
        let second: CompleteListener = {
            let hits = Arc::clone(&hits);
            Arc::new(move || {
                hits.fetch_add(10, Ordering::SeqCst);
            })
        };
        listeners
            .on_complete(Arc::clone(&first))
            .on_complete(Arc::clone(&second));

        listeners.invoke_complete();
        assert_eq!(hits.load(Ordering::SeqCst), 11);

        listeners.unregister_complete(&first);
        listeners.invoke_complete();
        assert_eq!(hits.load(Ordering::SeqCst), 21);

        listeners.unregister_listeners();
        listeners.invoke_complete();
        assert_eq!(hits.load(Ordering::SeqCst), 21);
    }
}
