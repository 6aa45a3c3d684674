// 运行时调度模块

mod blocks;
mod engine;
mod step;
mod types;

pub use engine::FlowEngine;
pub use types::{Callback, Event};
