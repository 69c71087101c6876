pub mod config;
pub mod error;
pub mod types;

pub use config::ExecutorConfig;
pub use error::{BrokenReason, ErrorKind, TabletError, TabletResult};
