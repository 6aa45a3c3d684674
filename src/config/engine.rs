use serde::{Deserialize, Serialize};

use super::env::EnvConfig;
use crate::error::Result;

pub const DEFAULT_MAX_STACK_DEPTH: usize = 50;
pub const DEFAULT_MAX_CONCURRENCY: usize = 64;

pub const MAX_STACK_DEPTH_ENV: &str = "FLOWSCRIPT_MAX_STACK_DEPTH";
pub const MAX_CONCURRENCY_ENV: &str = "FLOWSCRIPT_MAX_CONCURRENCY";

/// 引擎配置
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Deepest continuation stack a do/else expansion may start from.
    pub max_stack_depth: usize,
    /// Upper bound on thread steps in flight within one round.
    pub max_concurrency: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_stack_depth: DEFAULT_MAX_STACK_DEPTH,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            max_stack_depth: EnvConfig::parse_optional(MAX_STACK_DEPTH_ENV)?
                .unwrap_or(defaults.max_stack_depth),
            max_concurrency: EnvConfig::parse_optional::<usize>(MAX_CONCURRENCY_ENV)?
                .unwrap_or(defaults.max_concurrency)
                .max(1),
        })
    }
}
