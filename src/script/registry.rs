use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::action::Action;

/// 动作注册表
///
/// Shared by every context created from the same script; registration may
/// happen after contexts exist (deferred imports).
#[derive(Default)]
pub struct ActionRegistry {
    actions: RwLock<HashMap<String, Arc<dyn Action>>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self {
            actions: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, name: impl Into<String>, action: Arc<dyn Action>) {
        let name = name.into();
        debug!(action = %name, "registered action");
        self.actions.write().insert(name, action);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Action>> {
        self.actions.read().get(name).map(Arc::clone)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.actions.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.actions.read().keys().cloned().collect();
        names.sort();
        names
    }
}
