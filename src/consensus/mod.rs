pub mod message;
pub mod peers;
pub mod processor;
pub mod store;

pub use message::*;
pub use peers::*;
pub use processor::*;
