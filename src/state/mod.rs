// 执行状态模块

mod context;
mod frame;
mod listener;
mod snapshot;

pub use context::ExecutionContext;
pub use frame::{CollectTarget, ExecutionState, FramePointer, Iteration, StackFrame};
pub use listener::{ActionListener, CompleteListener, ExceptionListener, Listeners, StateListener};
pub use snapshot::{ContextSnapshot, ContextState};
