use crate::error::{FlowError, Result};
use anyhow::anyhow;
use std::env;
use std::str::FromStr;

/// 环境变量配置管理
pub struct EnvConfig;

impl EnvConfig {
    pub fn get_env(key: &str) -> Result<String> {
        env::var(key)
            .map_err(|_| FlowError::Other(anyhow!("environment variable `{}` is not set", key)))
    }

    pub fn get_env_optional(key: &str) -> Option<String> {
        env::var(key).ok()
    }

    /// Parses `key` when present. A set but malformed value is an error
    /// rather than a silent fallback.
    pub fn parse_optional<T>(key: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match Self::get_env_optional(key) {
            None => Ok(None),
            Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|e| {
                FlowError::Other(anyhow!("invalid value `{}` for `{}`: {}", raw, key, e))
            }),
        }
    }

    pub fn is_debug_mode() -> bool {
        env::var("FLOWSCRIPT_DEBUG").is_ok()
    }
}
