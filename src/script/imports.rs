use std::sync::Arc;

use async_trait::async_trait;

use super::document::ImportDef;
use crate::action::Action;
use crate::error::Result;

/// Resolves an `import` entry into an action implementation.
///
/// Script-engine bridges (JavaScript, Python, ...) live behind this trait;
/// the engine only needs the resulting capability.
#[async_trait]
pub trait ActionLoader: Send + Sync {
    async fn load(&self, import: &ImportDef) -> Result<Arc<dyn Action>>;
}
