pub mod config;
pub mod error;
pub mod sink;

pub use config::*;
pub use error::*;
pub use sink::{FileSink, SharedSink};
