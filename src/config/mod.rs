// 配置模块

mod engine;
mod env;

pub use engine::{
    EngineConfig, DEFAULT_MAX_CONCURRENCY, DEFAULT_MAX_STACK_DEPTH, MAX_CONCURRENCY_ENV,
    MAX_STACK_DEPTH_ENV,
};
pub use env::EnvConfig;
