pub mod action;
pub mod config;
pub mod error;
pub mod runtime;
pub mod script;
pub mod state;
pub mod utils;

pub use action::{Action, ActionResult, FnAction, ForEachMarker, MenuMarker};
#[cfg(feature = "http-actions")]
pub use action::RestAction;
pub use config::{EngineConfig, EnvConfig};
pub use error::{FlowError, Result};
pub use runtime::{Callback, Event, FlowEngine};
pub use script::{ActionLoader, ActionNode, ActionRegistry, Block, ImportDef, Script};
pub use state::{
    ContextSnapshot, ExecutionContext, ExecutionState, FramePointer, Iteration, StackFrame,
};
pub use utils::logging;
