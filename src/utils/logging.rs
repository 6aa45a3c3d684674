use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::EnvConfig;

/// 日志配置
pub struct LoggingConfig;

impl LoggingConfig {
    /// Installs the global subscriber.
    ///
    /// - `RUST_LOG` overrides the filter (error, warn, info, debug, trace)
    /// - `FLOWSCRIPT_DEBUG` switches to a verbose filter and adds file, line
    ///   and thread ids to every record
    ///
    /// ```no_run
    /// use flowscript::utils::LoggingConfig;
    ///
    /// fn main() {
    ///     LoggingConfig::init();
    /// }
    /// ```
    pub fn init() {
        let is_debug = Self::is_debug();

        let env_filter = match EnvFilter::try_from_default_env() {
            Ok(filter) => filter,
            Err(_) => {
                if is_debug {
                    EnvFilter::new("flowscript=debug,info")
                } else {
                    EnvFilter::new("flowscript=info,warn")
                }
            }
        };

        let fmt_layer = fmt::layer()
            .with_target(is_debug)
            .with_file(is_debug)
            .with_line_number(is_debug)
            .with_thread_ids(is_debug);

        let installed = tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init();

        if installed.is_ok() && is_debug {
            tracing::debug!("flowscript debug logging enabled");
        }
    }

    /// Installs the global subscriber with an explicit filter directive.
    pub fn init_with_filter(filter: &str) {
        let _ = tracing_subscriber::registry()
            .with(EnvFilter::new(filter))
            .with(fmt::layer())
            .try_init();
    }

    pub fn is_debug() -> bool {
        EnvConfig::is_debug_mode()
    }
}
