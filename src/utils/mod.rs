pub mod binder;
pub mod logging;
pub mod path;

pub use binder::{bind_value, bind_vars, lookup};
pub use logging::LoggingConfig;
